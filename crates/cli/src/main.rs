//! pkgsync command-line client.
//!
//! Provides subcommands for checking out packages and projects, tracking
//! local changes, committing and updating, resolving conflicts, handling
//! source links, and generating / validating configuration files.

mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pkgsync_core::context::Context as SyncContext;
use pkgsync_core::package::{
    CommitOutcome, LinkMode, PullOutcome, UpdateOptions, UpdateReport,
};
use pkgsync_core::project::{PackageCommit, PackageUpdate};
use pkgsync_core::{ApiClient, AppConfig, PackageWc, ProjectWc, WcOptions};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// pkgsync command-line client.
#[derive(Parser, Debug)]
#[command(
    name = "pkgsync",
    version,
    about = "Working copies for a package build service"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Working copy directory.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    dir: PathBuf,

    /// Log more (repeat for debug output).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check out a package, or a whole project when no package is given.
    Checkout {
        project: String,
        package: Option<String>,
        /// Target directory (defaults to the package or project name).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Check out the raw link instead of its expansion.
        #[arg(long)]
        unexpand: bool,
    },

    /// Show the status of files, or of packages in a project.
    Status { names: Vec<String> },

    /// Schedule files for addition.
    Add {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Schedule files for deletion.
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
        /// Delete even if locally modified.
        #[arg(short, long)]
        force: bool,
    },

    /// Undo local changes.
    Revert {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Mark conflicts as resolved.
    Resolved {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Send local changes to the server.
    Commit {
        /// Commit message.
        #[arg(short, long, default_value = "")]
        message: String,
        /// Only commit these files (or packages, in a project).
        names: Vec<String>,
    },

    /// Bring the working copy up to date.
    Update {
        /// Revision to update to.
        #[arg(short, long)]
        revision: Option<String>,
        /// Switch a link package to its expanded sources.
        #[arg(long, conflicts_with = "unexpand")]
        expand: bool,
        /// Switch a link package to its raw link sources.
        #[arg(long)]
        unexpand: bool,
    },

    /// Merge the link target's latest changes into a frozen link.
    Pull,

    /// Check out a broken link for repair.
    Repairlink {
        project: String,
        package: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Verify the local store.
    Check,

    /// Repair a damaged local store.
    Repair,

    /// Create a new package in a project working copy.
    Mkpac { name: String },

    /// Remove a package from a project working copy.
    Rmpac {
        name: String,
        #[arg(short, long)]
        force: bool,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => Ok(path.clone()),
        None => default_config_path(),
    };
    let level = match cli.verbose {
        0 => config_path
            .as_deref()
            .ok()
            .and_then(configured_log_level)
            .unwrap_or_else(|| "warn".to_string()),
        1 => "info".to_string(),
        _ => "debug".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let result = match config_path {
        Ok(path) => run(cli, &path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config_path: &Path) -> Result<()> {
    let dir = cli.dir.as_path();

    match cli.command {
        Commands::Init { output } => cmd_init(output.as_deref().unwrap_or(config_path)),
        Commands::Validate => cmd_validate(config_path),

        // Local operations: the config is optional.
        Commands::Status { names } => cmd_status(dir, &local_options(config_path)?, &names),
        Commands::Add { names } => {
            PackageWc::open(dir)?.add(&names)?;
            print_names("A", &names);
            Ok(())
        }
        Commands::Delete { names, force } => {
            PackageWc::open(dir)?.delete(&names, force)?;
            print_names("D", &names);
            Ok(())
        }
        Commands::Revert { names } => {
            PackageWc::open(dir)?.revert(&names)?;
            for name in &names {
                println!("Reverted '{}'", name);
            }
            Ok(())
        }
        Commands::Resolved { names } => {
            PackageWc::open(dir)?.resolve(&names)?;
            for name in &names {
                println!("Resolved conflicted state of '{}'", name);
            }
            Ok(())
        }
        Commands::Check => cmd_check(dir),
        Commands::Mkpac { name } => {
            let mut project = ProjectWc::open(dir)?;
            project.new_package(&name)?;
            println!("A    {}", name);
            Ok(())
        }
        Commands::Rmpac { name, force } => {
            let options = local_options(config_path)?;
            let mut project = ProjectWc::open(dir)?;
            project.remove_package(&options, &name, force)?;
            println!("D    {}", name);
            Ok(())
        }

        // Network operations.
        Commands::Checkout {
            project,
            package,
            output,
            unexpand,
        } => {
            let ctx = connect(config_path)?;
            cmd_checkout(&ctx, &project, package.as_deref(), output, unexpand).await
        }
        Commands::Commit { message, names } => {
            let ctx = connect(config_path)?;
            cmd_commit(&ctx, dir, &message, &names).await
        }
        Commands::Update {
            revision,
            expand,
            unexpand,
        } => {
            let link_mode = if expand {
                LinkMode::Expand
            } else if unexpand {
                LinkMode::Unexpand
            } else {
                LinkMode::Default
            };
            let opts = UpdateOptions {
                revision,
                link_mode,
            };
            let ctx = connect(config_path)?;
            cmd_update(&ctx, dir, &opts).await
        }
        Commands::Pull => cmd_pull(&connect(config_path)?, dir).await,
        Commands::Repairlink {
            project,
            package,
            output,
        } => {
            let ctx = connect(config_path)?;
            let target = output.unwrap_or_else(|| PathBuf::from(&package));
            let wc = PackageWc::repair_link(&ctx, &project, &package, &target).await?;
            print_status(&wc, &ctx.options)?;
            println!();
            println!(
                "{}",
                style::warn("Resolve the conflicts above, then commit to repair the link.")
            );
            Ok(())
        }
        Commands::Repair => {
            let ctx = connect(config_path)?;
            let wc = PackageWc::repair(&ctx, dir).await?;
            println!(
                "{}",
                style::success(&format!("Working copy repaired at revision {}", wc.revision()))
            );
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

/// `[log] level` from the config file, if it can be read.
fn configured_log_level(path: &Path) -> Option<String> {
    AppConfig::load_from_file(path).ok().map(|c| c.log.level)
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("cannot determine the user config directory")?;
    Ok(AppConfig::default_path(&base))
}

/// Working copy options from the config file, or defaults when there is
/// none.
fn local_options(path: &Path) -> Result<WcOptions> {
    if !path.exists() {
        return Ok(WcOptions::default());
    }
    let config = AppConfig::load_from_file(path).context("failed to load configuration file")?;
    Ok(WcOptions::from_config(&config.workingcopy))
}

fn connect(path: &Path) -> Result<SyncContext<ApiClient>> {
    let config = AppConfig::load_and_resolve(path).context("failed to load configuration file")?;
    let client = ApiClient::from_config(&config).context("failed to create API client")?;
    Ok(SyncContext::from_config(client, &config))
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# pkgsync configuration

[api]
url = "https://api.example.org"
username = "user"
password_env = "PKGSYNC_PASSWORD"
timeout_secs = 60

[workingcopy]
exclude_glob = [".pkgsync", "*.orig", "*.rej", ".*.swp", ".git", ".svn", "*~"]
# Files above this many bytes are not downloaded (0 = no limit).
size_limit = 0
# "native" or "diff3"
merge_tool = "native"

[log]
level = "warn"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
    }
    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the API URL and username");
    println!("  2. Export the password in PKGSYNC_PASSWORD");
    println!("  3. Validate with: pkgsync validate --config {}", output.display());

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config.resolve_env_vars();
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  API URL     : {}", config.api.url);
    println!("  User        : {}", config.api.username);
    println!(
        "  Password    : {}",
        if config.api.password.is_some() {
            "set"
        } else {
            "NOT SET"
        }
    );
    println!("  Timeout     : {}s", config.api.timeout_secs);
    println!(
        "  Size limit  : {}",
        WcOptions::from_config(&config.workingcopy)
            .size_limit
            .map(|n| format!("{n} bytes"))
            .unwrap_or_else(|| "none".to_string())
    );
    println!("  Merge tool  : {:?}", config.workingcopy.merge_tool);
    println!();
    println!("Configuration is valid.");

    Ok(())
}

async fn cmd_checkout(
    ctx: &SyncContext<ApiClient>,
    project: &str,
    package: Option<&str>,
    output: Option<PathBuf>,
    unexpand: bool,
) -> Result<()> {
    match package {
        Some(package) => {
            let target = output.unwrap_or_else(|| PathBuf::from(package));
            let opts = UpdateOptions {
                revision: None,
                link_mode: if unexpand {
                    LinkMode::Unexpand
                } else {
                    LinkMode::Default
                },
            };
            let wc = PackageWc::checkout(ctx, project, package, &target, &opts)
                .await
                .with_context(|| format!("failed to check out {project}/{package}"))?;
            for entry in wc.files() {
                println!("A    {}", target.join(&entry.name).display());
            }
            println!("At revision {}.", wc.revision());
        }
        None => {
            let target = output.unwrap_or_else(|| PathBuf::from(project));
            let wc = ProjectWc::checkout(ctx, project, &target)
                .await
                .with_context(|| format!("failed to check out project {project}"))?;
            for name in wc.packages().keys() {
                println!("A    {}", target.join(name).display());
            }
        }
    }
    Ok(())
}

fn cmd_status(dir: &Path, options: &WcOptions, names: &[String]) -> Result<()> {
    if ProjectWc::is_project(dir) && names.is_empty() {
        let project = ProjectWc::open(dir)?;
        for (status, name) in project.status(options)? {
            println!("{}    {}", status.code(), name);
        }
        return Ok(());
    }
    let wc = PackageWc::open(dir)?;
    if wc.is_interrupted() {
        println!(
            "{}",
            style::warn("An update was interrupted; run 'pkgsync update' to finish it.")
        );
        return Ok(());
    }
    if names.is_empty() {
        print_status(&wc, options)
    } else {
        for (status, name) in wc.status(options, names)? {
            println!("{}    {}", style::status_code(status), name);
        }
        Ok(())
    }
}

/// Changed files only; unmodified ones are left out.
fn print_status(wc: &PackageWc, options: &WcOptions) -> Result<()> {
    for (status, name) in wc.status(options, &[])? {
        if status != pkgsync_core::FileStatus::Unmodified {
            println!("{}    {}", style::status_code(status), name);
        }
    }
    if wc.is_frozen() {
        println!(
            "{}",
            style::warn("The link is frozen at its last working target; run 'pkgsync pull'.")
        );
    }
    Ok(())
}

fn cmd_check(dir: &Path) -> Result<()> {
    let wc = PackageWc::open(dir)?;
    let violations = wc.check()?;
    if violations.is_empty() {
        println!("{}", style::success("Working copy is consistent"));
        return Ok(());
    }
    for v in &violations {
        println!("  {}", v);
    }
    anyhow::bail!(
        "{} problem(s) found; run 'pkgsync repair'",
        violations.len()
    )
}

async fn cmd_commit(
    ctx: &SyncContext<ApiClient>,
    dir: &Path,
    message: &str,
    names: &[String],
) -> Result<()> {
    if ProjectWc::is_project(dir) {
        let mut project = ProjectWc::open(dir)?;
        let order = (!names.is_empty()).then_some(names);
        for (name, result) in project.commit(ctx, message, order).await? {
            match result {
                PackageCommit::Created(outcome) => {
                    println!("{}", style::header(&format!("Created {name}")));
                    print_commit(&outcome);
                }
                PackageCommit::Committed(outcome) => {
                    println!("{}", style::header(&name));
                    print_commit(&outcome);
                }
                PackageCommit::Deleted => println!("Deleted package {}", name),
            }
        }
        return Ok(());
    }

    let mut wc = PackageWc::open(dir)?;
    let todo = (!names.is_empty()).then_some(names);
    let outcome = wc.commit(ctx, message, todo).await?;
    print_commit(&outcome);
    Ok(())
}

fn print_commit(outcome: &CommitOutcome) {
    match outcome {
        CommitOutcome::NothingToCommit => println!("{}", style::dim("Nothing to commit.")),
        CommitOutcome::Committed { revision, uploaded } => {
            for name in uploaded {
                println!("Sending    {}", name);
            }
            println!(
                "{}",
                style::success(&format!("Committed revision {}.", revision))
            );
        }
    }
}

async fn cmd_update(ctx: &SyncContext<ApiClient>, dir: &Path, opts: &UpdateOptions) -> Result<()> {
    if ProjectWc::is_project(dir) {
        let mut project = ProjectWc::open(dir)?;
        for (name, result) in project.update(ctx, opts).await? {
            match result {
                PackageUpdate::CheckedOut(report) => {
                    println!("A    {} (revision {})", name, report.revision)
                }
                PackageUpdate::Updated(report) => {
                    println!("{}", style::header(&name));
                    print_report(&report);
                }
                PackageUpdate::Removed => println!("D    {}", name),
                PackageUpdate::KeptModified => println!(
                    "{}",
                    style::warn(&format!(
                        "{name} was removed on the server but has local changes; kept"
                    ))
                ),
            }
        }
        return Ok(());
    }

    let mut wc = PackageWc::open(dir)?;
    let report = wc.update(ctx, opts).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &UpdateReport) {
    for name in &report.moved_aside {
        println!(
            "{}",
            style::warn(&format!("Local changes moved aside to '{}'", name))
        );
    }
    for (action, name) in &report.changes {
        println!("{}    {}", style::action_code(*action), name);
    }
    if report.is_noop() {
        println!("At revision {}.", report.revision);
    } else {
        println!("Updated to revision {}.", report.revision);
    }
}

async fn cmd_pull(ctx: &SyncContext<ApiClient>, dir: &Path) -> Result<()> {
    let mut wc = PackageWc::open(dir)?;
    match wc.pull(ctx).await? {
        PullOutcome::UpToDate => println!("{}", style::dim("Link target has not changed.")),
        PullOutcome::Pulled(report) => {
            for (action, name) in &report.changes {
                println!("{}    {}", style::action_code(*action), name);
            }
            println!(
                "{}",
                style::success("Merged the link target's changes; commit to record them.")
            );
        }
    }
    Ok(())
}

fn print_names(code: &str, names: &[String]) {
    for name in names {
        println!("{}    {}", code, name);
    }
}
