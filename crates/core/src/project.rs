//! Project working copies: a directory of package working copies plus a
//! manifest of which packages are tracked and in what state.
//!
//! ```text
//! <project>/.pkgsync/_project    {"project"}
//! <project>/.pkgsync/_packages   {"<package>": "normal" | "added" | "deleted"}
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::Transport;
use crate::context::{Context, WcOptions};
use crate::errors::WcError;
use crate::models::PackageState;
use crate::package::{CommitOutcome, PackageWc, UpdateOptions, UpdateReport};
use crate::store::{write_atomic, Store, STORE_DIR};

const PROJECT_FILE: &str = "_project";
const PACKAGES_FILE: &str = "_packages";

#[derive(Debug, Serialize, Deserialize)]
struct ProjectIdent {
    project: String,
}

/// Status of one entry of a project listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageStatus {
    Tracked(PackageState),
    /// Tracked, but the package directory is gone or not a working copy.
    Missing,
    /// A directory the manifest does not know.
    Unversioned,
}

impl PackageStatus {
    pub fn code(self) -> char {
        match self {
            Self::Tracked(state) => state.code(),
            Self::Missing => '!',
            Self::Unversioned => '?',
        }
    }
}

/// What a project update did to one package.
#[derive(Debug, Clone)]
pub enum PackageUpdate {
    CheckedOut(UpdateReport),
    Updated(UpdateReport),
    /// Removed upstream and unmodified locally; deleted from disk.
    Removed,
    /// Removed upstream but modified locally; left in place.
    KeptModified,
}

/// What a project commit did to one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageCommit {
    Created(CommitOutcome),
    Committed(CommitOutcome),
    Deleted,
}

/// A project working copy.
#[derive(Debug)]
pub struct ProjectWc {
    root: PathBuf,
    project: String,
    packages: BTreeMap<String, PackageState>,
}

/// Whether `name` may be used as a package name.
pub fn is_valid_package_name(name: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.+-]*$").ok());
    re.as_ref().is_some_and(|re| re.is_match(name))
}

impl ProjectWc {
    pub fn is_project(dir: &Path) -> bool {
        dir.join(STORE_DIR).join(PROJECT_FILE).is_file()
    }

    pub fn open(dir: &Path) -> Result<Self, WcError> {
        if !Self::is_project(dir) {
            return Err(WcError::NotAWorkingCopy(dir.display().to_string()));
        }
        let store_dir = dir.join(STORE_DIR);
        let ident: ProjectIdent = serde_json::from_slice(&fs::read(store_dir.join(PROJECT_FILE))?)?;
        let manifest = store_dir.join(PACKAGES_FILE);
        let packages = if manifest.exists() {
            serde_json::from_slice(&fs::read(manifest)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            root: dir.to_path_buf(),
            project: ident.project,
            packages,
        })
    }

    /// Check out every package of `project` into `dir`.
    pub async fn checkout<T: Transport>(
        ctx: &Context<T>,
        project: &str,
        dir: &Path,
    ) -> Result<Self, WcError> {
        if Self::is_project(dir) {
            return Err(WcError::InvalidOperation(format!(
                "'{}' is already a project working copy",
                dir.display()
            )));
        }
        let names = ctx.transport.list_packages(project).await?;
        fs::create_dir_all(dir.join(STORE_DIR))?;
        let ident = ProjectIdent {
            project: project.to_string(),
        };
        write_atomic(
            &dir.join(STORE_DIR).join(PROJECT_FILE),
            &serde_json::to_vec_pretty(&ident)?,
        )?;
        let mut wc = Self {
            root: dir.to_path_buf(),
            project: project.to_string(),
            packages: BTreeMap::new(),
        };

        let mut result = Ok(());
        for name in &names {
            let opts = UpdateOptions::default();
            match PackageWc::checkout(ctx, project, name, &wc.root.join(name), &opts).await {
                Ok(_) => {
                    wc.packages.insert(name.clone(), PackageState::Normal);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        let saved = wc.save();
        result?;
        saved?;
        info!(project, packages = wc.packages.len(), "checked out project");
        Ok(wc)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn packages(&self) -> &BTreeMap<String, PackageState> {
        &self.packages
    }

    pub fn package_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Open the working copy of a tracked package.
    pub fn package(&self, name: &str) -> Result<PackageWc, WcError> {
        if !self.packages.contains_key(name) {
            return Err(WcError::NotFound(name.to_string()));
        }
        PackageWc::open(&self.package_dir(name))
    }

    fn save(&self) -> Result<(), WcError> {
        write_atomic(
            &self.root.join(STORE_DIR).join(PACKAGES_FILE),
            &serde_json::to_vec_pretty(&self.packages)?,
        )?;
        Ok(())
    }

    /// Create a local package, to be created on the server by the next
    /// commit.
    pub fn new_package(&mut self, name: &str) -> Result<PackageWc, WcError> {
        if !is_valid_package_name(name) {
            return Err(WcError::InvalidOperation(format!(
                "'{name}' is not a valid package name"
            )));
        }
        if self.packages.contains_key(name) {
            return Err(WcError::InvalidOperation(format!(
                "package '{name}' already exists in this project"
            )));
        }
        let dir = self.package_dir(name);
        fs::create_dir_all(&dir)?;
        let wc = PackageWc::init(&self.project, name, &dir)?;
        self.packages.insert(name.to_string(), PackageState::Added);
        self.save()?;
        info!(package = name, "scheduled package for addition");
        Ok(wc)
    }

    /// Schedule a package for deletion and remove its working files. A
    /// package that was only added locally is dropped outright.
    pub fn remove_package(
        &mut self,
        options: &WcOptions,
        name: &str,
        force: bool,
    ) -> Result<(), WcError> {
        let state = *self
            .packages
            .get(name)
            .ok_or_else(|| WcError::NotFound(name.to_string()))?;
        let dir = self.package_dir(name);
        match state {
            PackageState::Deleted => return Ok(()),
            PackageState::Added => {
                if dir.exists() {
                    fs::remove_dir_all(&dir)?;
                }
                self.packages.remove(name);
            }
            PackageState::Normal => {
                if Store::is_working_copy(&dir) {
                    let wc = PackageWc::open(&dir)?;
                    if !force && wc.has_local_changes(options)? {
                        return Err(WcError::conflict(
                            name,
                            "package has local changes; use force to remove it",
                        ));
                    }
                    for entry in wc.files() {
                        crate::store::remove_if_exists(&dir.join(&entry.name))?;
                    }
                }
                self.packages.insert(name.to_string(), PackageState::Deleted);
            }
        }
        self.save()?;
        info!(package = name, "scheduled package for deletion");
        Ok(())
    }

    /// Bring the project in line with the server, one package at a time.
    ///
    /// Stops at the first failing package; the manifest is written either
    /// way.
    pub async fn update<T: Transport>(
        &mut self,
        ctx: &Context<T>,
        opts: &UpdateOptions,
    ) -> Result<Vec<(String, PackageUpdate)>, WcError> {
        let mut report = Vec::new();
        let result = self.update_packages(ctx, opts, &mut report).await;
        let saved = self.save();
        result?;
        saved?;
        Ok(report)
    }

    async fn update_packages<T: Transport>(
        &mut self,
        ctx: &Context<T>,
        opts: &UpdateOptions,
        report: &mut Vec<(String, PackageUpdate)>,
    ) -> Result<(), WcError> {
        let remote: BTreeSet<String> = ctx
            .transport
            .list_packages(&self.project)
            .await?
            .into_iter()
            .collect();

        let gone: Vec<String> = self
            .packages
            .iter()
            .filter(|(n, s)| **s == PackageState::Normal && !remote.contains(*n))
            .map(|(n, _)| n.clone())
            .collect();
        for name in gone {
            let dir = self.package_dir(&name);
            let modified = Store::is_working_copy(&dir)
                && PackageWc::open(&dir)?.has_local_changes(&ctx.options)?;
            if modified {
                warn!(package = %name, "removed upstream but modified locally; keeping it");
                report.push((name, PackageUpdate::KeptModified));
                continue;
            }
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            self.packages.remove(&name);
            info!(package = %name, "removed upstream; deleted locally");
            report.push((name, PackageUpdate::Removed));
        }

        for name in &remote {
            let dir = self.package_dir(name);
            match self.packages.get(name).copied() {
                None => {
                    let wc = PackageWc::checkout(ctx, &self.project, name, &dir, opts).await?;
                    self.packages.insert(name.clone(), PackageState::Normal);
                    let checked_out = UpdateReport {
                        revision: wc.revision().to_string(),
                        ..UpdateReport::default()
                    };
                    report.push((name.clone(), PackageUpdate::CheckedOut(checked_out)));
                }
                Some(PackageState::Normal) => {
                    let mut wc = PackageWc::open(&dir)?;
                    let changes = wc.update(ctx, opts).await?;
                    report.push((name.clone(), PackageUpdate::Updated(changes)));
                }
                Some(PackageState::Added | PackageState::Deleted) => {}
            }
        }
        Ok(())
    }

    /// Commit every package (or the named ones, in the given order):
    /// added packages are created on the server first, deleted ones are
    /// deleted there and locally.
    pub async fn commit<T: Transport>(
        &mut self,
        ctx: &Context<T>,
        message: &str,
        order: Option<&[String]>,
    ) -> Result<Vec<(String, PackageCommit)>, WcError> {
        let names: Vec<String> = match order {
            Some(names) => names.to_vec(),
            None => self.packages.keys().cloned().collect(),
        };
        let mut report = Vec::new();
        let result = self.commit_packages(ctx, message, &names, &mut report).await;
        let saved = self.save();
        result?;
        saved?;
        Ok(report)
    }

    async fn commit_packages<T: Transport>(
        &mut self,
        ctx: &Context<T>,
        message: &str,
        names: &[String],
        report: &mut Vec<(String, PackageCommit)>,
    ) -> Result<(), WcError> {
        for name in names {
            let state = *self
                .packages
                .get(name)
                .ok_or_else(|| WcError::NotFound(name.clone()))?;
            let dir = self.package_dir(name);
            match state {
                PackageState::Added => {
                    ctx.transport
                        .create_package(&self.project, name, name)
                        .await?;
                    self.packages.insert(name.clone(), PackageState::Normal);
                    info!(package = %name, "created package on the server");
                    let outcome = PackageWc::open(&dir)?.commit(ctx, message, None).await?;
                    report.push((name.clone(), PackageCommit::Created(outcome)));
                }
                PackageState::Deleted => {
                    ctx.transport.delete_package(&self.project, name).await?;
                    if dir.exists() {
                        fs::remove_dir_all(&dir)?;
                    }
                    self.packages.remove(name);
                    info!(package = %name, "deleted package on the server");
                    report.push((name.clone(), PackageCommit::Deleted));
                }
                PackageState::Normal => {
                    if !Store::is_working_copy(&dir) {
                        warn!(package = %name, "package directory is missing; skipping");
                        continue;
                    }
                    let outcome = PackageWc::open(&dir)?.commit(ctx, message, None).await?;
                    report.push((name.clone(), PackageCommit::Committed(outcome)));
                }
            }
        }
        Ok(())
    }

    /// Every tracked package plus unversioned directories, sorted by name.
    pub fn status(&self, options: &WcOptions) -> Result<Vec<(PackageStatus, String)>, WcError> {
        let mut listing: BTreeMap<String, PackageStatus> = BTreeMap::new();
        for (name, state) in &self.packages {
            let present = Store::is_working_copy(&self.package_dir(name));
            let status = match state {
                PackageState::Normal | PackageState::Added if !present => PackageStatus::Missing,
                state => PackageStatus::Tracked(*state),
            };
            listing.insert(name.clone(), status);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name == STORE_DIR || options.is_excluded(&name) || listing.contains_key(&name) {
                continue;
            }
            listing.insert(name, PackageStatus::Unversioned);
        }
        Ok(listing.into_iter().map(|(n, s)| (s, n)).collect())
    }
}
