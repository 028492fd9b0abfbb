//! End-to-end tests for package working copies against the in-memory
//! build service: checkout, status, commit with uploads, update with
//! merges and conflicts, and recovery from interrupted updates.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use pkgsync_core::api::{MemoryServer, RevisionQuery, Transport};
use pkgsync_core::errors::WcError;
use pkgsync_core::models::md5_hex;
use pkgsync_core::package::{CommitOutcome, FileAction, UpdateOptions};
use pkgsync_core::store::{Store, STORE_DIR};
use pkgsync_core::transaction::UpdateJournal;
use pkgsync_core::{Context, FileStatus, PackageWc, WcOptions};

// ===========================================================================
// Helpers
// ===========================================================================

fn server_with(files: &[(&str, &[u8])]) -> Context<MemoryServer> {
    let srv = MemoryServer::new();
    srv.commit_files("prj", "foo", files);
    Context::new(srv, "alice")
}

async fn checkout(ctx: &Context<MemoryServer>) -> (TempDir, PathBuf, PackageWc) {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("foo");
    let wc = PackageWc::checkout(ctx, "prj", "foo", &dir, &UpdateOptions::default())
        .await
        .unwrap();
    (tmp, dir, wc)
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn read(dir: &Path, name: &str) -> Vec<u8> {
    std::fs::read(dir.join(name)).unwrap()
}

fn mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

// ===========================================================================
// Checkout & status
// ===========================================================================

#[tokio::test]
async fn test_checkout_writes_files_and_pristine_copies() {
    let ctx = server_with(&[("foo.spec", b"Name: foo\n"), ("foo.tar", b"tarball")]);
    let (_tmp, dir, wc) = checkout(&ctx).await;

    assert_eq!(wc.revision(), "1");
    assert_eq!(read(&dir, "foo.spec"), b"Name: foo\n");
    assert!(dir.join(STORE_DIR).join("sources").join("foo.tar").is_file());
    assert!(wc.check().unwrap().is_empty());

    let listing = wc.status(&ctx.options, &[]).unwrap();
    assert!(listing.iter().all(|(s, _)| *s == FileStatus::Unmodified));
}

#[tokio::test]
async fn test_checkout_skips_files_above_size_limit() {
    let srv = MemoryServer::new();
    srv.commit_files("prj", "foo", &[("foo.spec", b"spec\n"), ("big.tar", b"0123456789")]);
    let ctx = Context::new(srv, "alice").with_options(WcOptions {
        size_limit: Some(8),
        ..WcOptions::default()
    });
    let (_tmp, dir, wc) = checkout(&ctx).await;

    assert!(!dir.join("big.tar").exists());
    assert_eq!(wc.file_status("big.tar").unwrap(), FileStatus::Skipped);
    assert!(wc.file_entry("big.tar").unwrap().skipped);
    assert!(wc.check().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_checkout_leaves_no_store() {
    let ctx = Context::new(MemoryServer::new(), "alice");
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("nope");
    let err = PackageWc::checkout(&ctx, "prj", "nope", &dir, &UpdateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, WcError::Api(_)));
    assert!(!dir.join(STORE_DIR).exists());
}

// ===========================================================================
// Commit
// ===========================================================================

#[tokio::test]
async fn test_add_then_commit_is_unmodified() {
    let ctx = server_with(&[("foo.spec", b"v1\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("fix.patch"), b"--- a\n+++ b\n").unwrap();
    wc.add(&names(&["fix.patch"])).unwrap();
    assert_eq!(wc.file_status("fix.patch").unwrap(), FileStatus::Added);

    let outcome = wc.commit(&ctx, "add patch", None).await.unwrap();
    assert_eq!(
        outcome,
        CommitOutcome::Committed {
            revision: "2".into(),
            uploaded: names(&["fix.patch"]),
        }
    );
    assert_eq!(wc.file_status("fix.patch").unwrap(), FileStatus::Unmodified);
    assert_eq!(
        wc.file_entry("fix.patch").unwrap().md5,
        md5_hex(b"--- a\n+++ b\n")
    );
    assert!(wc.pending().to_be_added.is_empty());
    assert_eq!(ctx.transport.upload_count("fix.patch"), 1);
    assert_eq!(
        ctx.transport.file_content("prj", "foo", "fix.patch").unwrap(),
        b"--- a\n+++ b\n"
    );
    assert!(!dir.join(STORE_DIR).join("_in_commit").exists());
}

#[tokio::test]
async fn test_commit_skips_upload_of_known_content() {
    let ctx = server_with(&[("foo.spec", b"shared\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("copy.spec"), b"shared\n").unwrap();
    wc.add(&names(&["copy.spec"])).unwrap();
    let outcome = wc.commit(&ctx, "copy", None).await.unwrap();

    assert!(matches!(outcome, CommitOutcome::Committed { ref uploaded, .. } if uploaded.is_empty()));
    assert_eq!(ctx.transport.upload_count("copy.spec"), 0);
}

#[tokio::test]
async fn test_commit_modified_and_deleted() {
    let ctx = server_with(&[("foo.spec", b"v1\n"), ("old.patch", b"old\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("foo.spec"), b"v2\n").unwrap();
    wc.delete(&names(&["old.patch"]), false).unwrap();
    wc.commit(&ctx, "bump", None).await.unwrap();

    assert_eq!(wc.revision(), "2");
    assert!(wc.file_entry("old.patch").is_none());
    assert!(!dir.join(STORE_DIR).join("sources").join("old.patch").exists());
    assert_eq!(wc.file_status("foo.spec").unwrap(), FileStatus::Unmodified);
    assert_eq!(ctx.transport.file_content("prj", "foo", "foo.spec").unwrap(), b"v2\n");
    assert!(ctx.transport.file_content("prj", "foo", "old.patch").is_none());
    assert!(wc.check().unwrap().is_empty());
}

#[tokio::test]
async fn test_commit_subset_leaves_other_changes() {
    let ctx = server_with(&[("a", b"a1\n"), ("b", b"b1\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("a"), b"a2\n").unwrap();
    std::fs::write(dir.join("b"), b"b2\n").unwrap();
    let todo = names(&["a"]);
    wc.commit(&ctx, "only a", Some(todo.as_slice())).await.unwrap();

    assert_eq!(wc.file_status("a").unwrap(), FileStatus::Unmodified);
    assert_eq!(wc.file_status("b").unwrap(), FileStatus::Modified);
    assert_eq!(ctx.transport.file_content("prj", "foo", "b").unwrap(), b"b1\n");
}

#[tokio::test]
async fn test_commit_with_nothing_to_send_talks_to_nobody() {
    let ctx = server_with(&[("foo.spec", b"v1\n")]);
    let (_tmp, _dir, mut wc) = checkout(&ctx).await;

    let before = ctx.transport.request_count();
    let outcome = wc.commit(&ctx, "noop", None).await.unwrap();
    assert_eq!(outcome, CommitOutcome::NothingToCommit);
    assert_eq!(ctx.transport.request_count(), before);
}

#[tokio::test]
async fn test_commit_gives_up_after_upload_rounds() {
    let ctx = server_with(&[("foo.spec", b"v1\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("new.patch"), b"new\n").unwrap();
    wc.add(&names(&["new.patch"])).unwrap();
    ctx.transport.drop_uploads(true);

    let err = wc.commit(&ctx, "lost", None).await.unwrap_err();
    match err {
        WcError::Protocol { rounds, missing } => {
            assert_eq!(rounds, 3);
            assert_eq!(missing, names(&["new.patch"]));
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert_eq!(ctx.transport.upload_count("new.patch"), 3);
    assert_eq!(ctx.transport.commit_count(), 0);

    // Nothing changed locally.
    assert_eq!(wc.revision(), "1");
    assert_eq!(wc.file_status("new.patch").unwrap(), FileStatus::Added);
    assert!(!dir.join(STORE_DIR).join("_in_commit").exists());
    let reopened = PackageWc::open(&dir).unwrap();
    assert_eq!(reopened.revision(), "1");
}

#[tokio::test]
async fn test_commit_uploads_missing_files_over_several_rounds() {
    let ctx = server_with(&[("foo.spec", b"v1\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("x.patch"), b"x content\n").unwrap();
    std::fs::write(dir.join("y.patch"), b"y content\n").unwrap();
    wc.add(&names(&["x.patch", "y.patch"])).unwrap();
    // x.patch stays missing for two rounds, y.patch arrives in the first.
    ctx.transport.drop_uploads_for("x.patch", 2);

    let outcome = wc.commit(&ctx, "two patches", None).await.unwrap();
    match outcome {
        CommitOutcome::Committed { revision, uploaded } => {
            assert_eq!(revision, "2");
            assert_eq!(uploaded.len(), 4);
            assert_eq!(uploaded.iter().filter(|n| *n == "y.patch").count(), 1);
        }
        other => panic!("expected a commit, got {other:?}"),
    }
    assert_eq!(ctx.transport.upload_count("x.patch"), 3);
    assert_eq!(ctx.transport.upload_count("y.patch"), 1);
    assert_eq!(ctx.transport.commit_count(), 1);
    assert_eq!(
        ctx.transport.file_content("prj", "foo", "x.patch").unwrap(),
        b"x content\n"
    );
    assert_eq!(wc.file_status("x.patch").unwrap(), FileStatus::Unmodified);
    assert!(wc.check().unwrap().is_empty());
}

#[tokio::test]
async fn test_commit_refuses_outdated_copy() {
    let ctx = server_with(&[("foo.spec", b"v1\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    ctx.transport.put_file("prj", "foo", "other", b"x");
    std::fs::write(dir.join("foo.spec"), b"v2\n").unwrap();
    let err = wc.commit(&ctx, "late", None).await.unwrap_err();
    assert!(matches!(err, WcError::Outdated { .. }));
    assert!(err.is_user_recoverable());
}

#[tokio::test]
async fn test_commit_refuses_unversioned_name() {
    let ctx = server_with(&[("foo.spec", b"v1\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("stray"), b"x").unwrap();
    let todo = names(&["stray"]);
    let err = wc.commit(&ctx, "m", Some(todo.as_slice())).await.unwrap_err();
    assert!(matches!(err, WcError::NotFound(_)));
}

// ===========================================================================
// Update
// ===========================================================================

#[tokio::test]
async fn test_second_update_writes_nothing() {
    let ctx = server_with(&[("foo.spec", b"v1\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;
    ctx.transport.put_file("prj", "foo", "foo.spec", b"v2\n");

    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert_eq!(report.action("foo.spec"), Some(FileAction::Updated));

    let watched = [
        dir.join("foo.spec"),
        dir.join(STORE_DIR).join("_files"),
        dir.join(STORE_DIR).join("_revision"),
        dir.join(STORE_DIR).join("sources").join("foo.spec"),
    ];
    let before: Vec<SystemTime> = watched.iter().map(|p| mtime(p)).collect();
    std::thread::sleep(Duration::from_millis(20));

    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert!(report.is_noop());
    assert_eq!(report.revision, "2");
    let after: Vec<SystemTime> = watched.iter().map(|p| mtime(p)).collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_update_merges_non_overlapping_changes() {
    let base = b"1\n2\n3\n4\n5\n6\n7\n";
    let ctx = server_with(&[("foo.spec", base)]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("foo.spec"), b"one\n2\n3\n4\n5\n6\n7\n").unwrap();
    ctx.transport
        .put_file("prj", "foo", "foo.spec", b"1\n2\n3\n4\n5\n6\nseven\n");

    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert_eq!(report.action("foo.spec"), Some(FileAction::Merged));
    assert_eq!(read(&dir, "foo.spec"), b"one\n2\n3\n4\n5\n6\nseven\n");
    assert_eq!(wc.file_status("foo.spec").unwrap(), FileStatus::Modified);
    assert!(!dir.join("foo.spec.mine").exists());
}

#[tokio::test]
async fn test_update_conflict_leaves_side_files() {
    let ctx = server_with(&[("foo.spec", b"a\nb\nc\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("foo.spec"), b"mine\nb\nc\n").unwrap();
    ctx.transport.put_file("prj", "foo", "foo.spec", b"theirs\nb\nc\n");

    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert_eq!(report.action("foo.spec"), Some(FileAction::Conflicted));
    assert_eq!(read(&dir, "foo.spec.mine"), b"mine\nb\nc\n");
    assert_eq!(read(&dir, "foo.spec.old"), b"a\nb\nc\n");
    assert_eq!(read(&dir, "foo.spec.new"), b"theirs\nb\nc\n");
    assert_eq!(wc.file_status("foo.spec").unwrap(), FileStatus::Conflicted);
    assert!(wc.check().unwrap().is_empty());

    let err = wc.commit(&ctx, "too soon", None).await.unwrap_err();
    assert!(matches!(err, WcError::FileConflict { .. }));

    std::fs::write(dir.join("foo.spec"), b"merged\nb\nc\n").unwrap();
    wc.resolve(&names(&["foo.spec"])).unwrap();
    assert!(!dir.join("foo.spec.new").exists());
    assert_eq!(wc.file_status("foo.spec").unwrap(), FileStatus::Modified);
    wc.commit(&ctx, "resolved", None).await.unwrap();
    assert_eq!(
        ctx.transport.file_content("prj", "foo", "foo.spec").unwrap(),
        b"merged\nb\nc\n"
    );
}

#[tokio::test]
async fn test_update_appends_on_both_sides_conflict() {
    let ctx = server_with(&[("foo.spec", b"line1\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("foo.spec"), b"line1\nmine\n").unwrap();
    ctx.transport
        .put_file("prj", "foo", "foo.spec", b"line1\nyours\n");

    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert_eq!(report.action("foo.spec"), Some(FileAction::Conflicted));
    assert_eq!(wc.file_status("foo.spec").unwrap(), FileStatus::Conflicted);
    assert_eq!(read(&dir, "foo.spec.mine"), b"line1\nmine\n");
    assert_eq!(read(&dir, "foo.spec.old"), b"line1\n");
    assert_eq!(read(&dir, "foo.spec.new"), b"line1\nyours\n");
}

#[tokio::test]
async fn test_update_merges_insert_and_append() {
    let ctx = server_with(&[("foo.spec", b"a\nb\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("foo.spec"), b"a\nM\nb\n").unwrap();
    ctx.transport.put_file("prj", "foo", "foo.spec", b"a\nb\nY\n");

    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert_eq!(report.action("foo.spec"), Some(FileAction::Merged));
    assert_eq!(read(&dir, "foo.spec"), b"a\nM\nb\nY\n");
    assert_eq!(wc.file_status("foo.spec").unwrap(), FileStatus::Modified);
}

#[tokio::test]
async fn test_update_leaves_local_edit_alone_when_server_did_not_touch_it() {
    let ctx = server_with(&[("foo.spec", b"v1\n"), ("other", b"o1\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("foo.spec"), b"local edit\n").unwrap();
    let before = mtime(&dir.join("foo.spec"));
    std::thread::sleep(Duration::from_millis(20));
    ctx.transport.put_file("prj", "foo", "other", b"o2\n");

    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert_eq!(report.action("foo.spec"), None);
    assert_eq!(report.action("other"), Some(FileAction::Updated));
    assert_eq!(read(&dir, "foo.spec"), b"local edit\n");
    assert_eq!(mtime(&dir.join("foo.spec")), before);
    assert_eq!(wc.file_status("foo.spec").unwrap(), FileStatus::Modified);
}

#[tokio::test]
async fn test_update_of_conflicted_file_only_moves_pristine() {
    let ctx = server_with(&[("foo.spec", b"a\nb\nc\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("foo.spec"), b"mine\nb\nc\n").unwrap();
    ctx.transport.put_file("prj", "foo", "foo.spec", b"theirs\nb\nc\n");
    wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert_eq!(wc.file_status("foo.spec").unwrap(), FileStatus::Conflicted);
    let conflicted = read(&dir, "foo.spec");

    ctx.transport.put_file("prj", "foo", "foo.spec", b"third\nb\nc\n");
    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert_eq!(report.action("foo.spec"), Some(FileAction::Skipped));
    assert_eq!(read(&dir, "foo.spec"), conflicted);
    assert_eq!(
        read(&dir.join(STORE_DIR).join("sources"), "foo.spec"),
        b"third\nb\nc\n"
    );
    assert_eq!(wc.file_status("foo.spec").unwrap(), FileStatus::Conflicted);
    assert!(wc.check().unwrap().is_empty());
}

#[tokio::test]
async fn test_update_merges_into_file_scheduled_for_deletion() {
    let base = b"1\n2\n3\n4\n5\n6\n7\n";
    let ctx = server_with(&[("foo.spec", base)]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    wc.delete(&names(&["foo.spec"]), false).unwrap();
    std::fs::write(dir.join("foo.spec"), b"one\n2\n3\n4\n5\n6\n7\n").unwrap();
    assert_eq!(wc.file_status("foo.spec").unwrap(), FileStatus::Deleted);
    ctx.transport
        .put_file("prj", "foo", "foo.spec", b"1\n2\n3\n4\n5\n6\nseven\n");

    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert_eq!(report.action("foo.spec"), Some(FileAction::Merged));
    assert_eq!(read(&dir, "foo.spec"), b"one\n2\n3\n4\n5\n6\nseven\n");
    assert_eq!(wc.file_status("foo.spec").unwrap(), FileStatus::Modified);
    let listing = wc.status(&ctx.options, &[]).unwrap();
    assert!(!listing.iter().any(|(s, _)| *s == FileStatus::Deleted));
    assert!(wc.check().unwrap().is_empty());
}

#[tokio::test]
async fn test_update_conflicts_with_file_scheduled_for_deletion() {
    let ctx = server_with(&[("foo.spec", b"a\nb\nc\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    wc.delete(&names(&["foo.spec"]), false).unwrap();
    std::fs::write(dir.join("foo.spec"), b"mine\nb\nc\n").unwrap();
    ctx.transport.put_file("prj", "foo", "foo.spec", b"theirs\nb\nc\n");

    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert_eq!(report.action("foo.spec"), Some(FileAction::Conflicted));
    assert_eq!(wc.file_status("foo.spec").unwrap(), FileStatus::Conflicted);
    assert_eq!(read(&dir, "foo.spec.mine"), b"mine\nb\nc\n");
    assert!(wc.check().unwrap().is_empty());
}

#[tokio::test]
async fn test_update_binary_change_on_both_sides_conflicts() {
    let ctx = server_with(&[("logo.png", b"\x89PNG\x00one")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("logo.png"), b"\x89PNG\x00mine").unwrap();
    ctx.transport.put_file("prj", "foo", "logo.png", b"\x89PNG\x00theirs");

    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert_eq!(report.action("logo.png"), Some(FileAction::Conflicted));
    assert_eq!(read(&dir, "logo.png"), b"\x89PNG\x00theirs");
    assert_eq!(read(&dir, "logo.png.mine"), b"\x89PNG\x00mine");
}

#[tokio::test]
async fn test_update_handles_upstream_deletions() {
    let ctx = server_with(&[("a", b"a\n"), ("b", b"b\n"), ("c", b"c\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("b"), b"b edited\n").unwrap();
    ctx.transport.remove_file("prj", "foo", "a");
    ctx.transport.remove_file("prj", "foo", "b");

    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert_eq!(report.action("a"), Some(FileAction::Deleted));
    assert_eq!(report.action("b"), Some(FileAction::Kept));
    assert!(!dir.join("a").exists());
    assert_eq!(read(&dir, "b"), b"b edited\n");
    assert_eq!(wc.file_status("b").unwrap(), FileStatus::Unversioned);
    assert!(wc.check().unwrap().is_empty());
}

#[tokio::test]
async fn test_update_adds_files_and_restores_missing_ones() {
    let ctx = server_with(&[("a", b"a\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::remove_file(dir.join("a")).unwrap();
    assert_eq!(wc.file_status("a").unwrap(), FileStatus::Missing);
    ctx.transport.put_file("prj", "foo", "b", b"b\n");

    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert_eq!(report.action("a"), Some(FileAction::Restored));
    assert_eq!(report.action("b"), Some(FileAction::Added));
    assert_eq!(read(&dir, "a"), b"a\n");
    assert_eq!(read(&dir, "b"), b"b\n");
}

#[tokio::test]
async fn test_update_refuses_to_clobber_untracked_file() {
    let ctx = server_with(&[("a", b"a\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    std::fs::write(dir.join("b"), b"local b\n").unwrap();
    ctx.transport.put_file("prj", "foo", "b", b"server b\n");

    let err = wc.update(&ctx, &UpdateOptions::default()).await.unwrap_err();
    assert!(matches!(err, WcError::FileConflict { ref name, .. } if name == "b"));
    assert_eq!(read(&dir, "b"), b"local b\n");
    assert_eq!(wc.revision(), "1");
    assert!(!wc.is_interrupted());
}

#[tokio::test]
async fn test_update_to_older_revision() {
    let ctx = server_with(&[("foo.spec", b"v1\n")]);
    ctx.transport.put_file("prj", "foo", "foo.spec", b"v2\n");
    let (_tmp, dir, mut wc) = checkout(&ctx).await;
    assert_eq!(read(&dir, "foo.spec"), b"v2\n");

    let opts = UpdateOptions {
        revision: Some("1".into()),
        ..UpdateOptions::default()
    };
    wc.update(&ctx, &opts).await.unwrap();
    assert_eq!(wc.revision(), "1");
    assert_eq!(read(&dir, "foo.spec"), b"v1\n");
}

#[tokio::test]
async fn test_interrupted_update_converges() {
    let ctx = server_with(&[("a", b"a1\n"), ("b", b"b1\n"), ("c", b"c1\n")]);
    let (_tmp, dir, mut wc) = checkout(&ctx).await;

    ctx.transport.commit_files(
        "prj",
        "foo",
        &[("a", b"a2\n"), ("b", b"b2\n"), ("c", b"c2\n")],
    );
    ctx.transport.fail_file_fetches_after(1);
    let err = wc.update(&ctx, &UpdateOptions::default()).await.unwrap_err();
    assert!(matches!(err, WcError::Api(_)));

    // Only update may run until the journal is finished.
    let mut wc = PackageWc::open(&dir).unwrap();
    assert!(wc.is_interrupted());
    assert!(matches!(
        wc.file_status("a"),
        Err(WcError::Inconsistent { .. })
    ));

    ctx.transport.clear_failures();
    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert!(report.moved_aside.is_empty());
    assert!(!wc.is_interrupted());
    assert_eq!(wc.revision(), "2");
    for (name, content) in [("a", b"a2\n"), ("b", b"b2\n"), ("c", b"c2\n")] {
        assert_eq!(read(&dir, name), content);
        assert_eq!(wc.file_status(name).unwrap(), FileStatus::Unmodified);
    }
    assert!(wc.check().unwrap().is_empty());
    assert!(!dir.join(STORE_DIR).join("_in_update").exists());
}

#[tokio::test]
async fn test_update_interrupted_after_replacing_a_file_converges() {
    let ctx = server_with(&[("a", b"a1\n"), ("b", b"b1\n")]);
    let (_tmp, dir, wc) = checkout(&ctx).await;
    drop(wc);
    ctx.transport
        .commit_files("prj", "foo", &[("a", b"a2\n"), ("b", b"b2\n")]);

    // Die right after the new content of `a` was renamed into place.
    let target = ctx
        .transport
        .fetch_tree("prj", "foo", &RevisionQuery::latest())
        .await
        .unwrap();
    let store = Store::locate(&dir).unwrap();
    let journal = UpdateJournal::begin(&store, &target).unwrap();
    journal.backup("a", b"a2\n").unwrap();
    store.write_work("a", b"a2\n").unwrap();
    drop(journal);

    let mut wc = PackageWc::open(&dir).unwrap();
    assert!(wc.is_interrupted());
    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert!(report.moved_aside.is_empty());
    assert_eq!(wc.revision(), "2");
    assert_eq!(read(&dir, "a"), b"a2\n");
    assert_eq!(read(&dir, "b"), b"b2\n");
    assert_eq!(
        wc.status(&ctx.options, &[]).unwrap(),
        vec![
            (FileStatus::Unmodified, "a".to_string()),
            (FileStatus::Unmodified, "b".to_string()),
        ]
    );
    assert!(wc.check().unwrap().is_empty());
}

#[tokio::test]
async fn test_update_interrupted_after_writing_a_merge_converges() {
    let base = b"1\n2\n3\n4\n5\n6\n7\n";
    let mine = b"one\n2\n3\n4\n5\n6\n7\n";
    let merged = b"one\n2\n3\n4\n5\n6\nseven\n";
    let ctx = server_with(&[("foo.spec", base)]);
    let (_tmp, dir, wc) = checkout(&ctx).await;
    drop(wc);
    std::fs::write(dir.join("foo.spec"), mine).unwrap();
    ctx.transport
        .put_file("prj", "foo", "foo.spec", b"1\n2\n3\n4\n5\n6\nseven\n");

    let target = ctx
        .transport
        .fetch_tree("prj", "foo", &RevisionQuery::latest())
        .await
        .unwrap();
    let store = Store::locate(&dir).unwrap();
    let journal = UpdateJournal::begin(&store, &target).unwrap();
    journal.backup("foo.spec", merged).unwrap();
    store.write_work("foo.spec", merged).unwrap();
    drop(journal);

    let mut wc = PackageWc::open(&dir).unwrap();
    let report = wc.update(&ctx, &UpdateOptions::default()).await.unwrap();
    assert!(report.moved_aside.is_empty());
    assert_eq!(report.action("foo.spec"), Some(FileAction::Merged));
    assert_eq!(read(&dir, "foo.spec"), merged);
    assert_eq!(wc.file_status("foo.spec").unwrap(), FileStatus::Modified);
    assert!(!dir.join("foo.spec.mine").exists());
    assert!(wc.check().unwrap().is_empty());
}

// ===========================================================================
// Repair
// ===========================================================================

#[tokio::test]
async fn test_repair_refetches_missing_pristine_copies() {
    let ctx = server_with(&[("foo.spec", b"v1\n")]);
    let (_tmp, dir, _wc) = checkout(&ctx).await;

    let sources = dir.join(STORE_DIR).join("sources");
    std::fs::remove_file(sources.join("foo.spec")).unwrap();
    std::fs::write(sources.join("orphan"), b"x").unwrap();
    assert!(matches!(
        PackageWc::open(&dir),
        Err(WcError::Inconsistent { .. })
    ));

    let wc = PackageWc::repair(&ctx, &dir).await.unwrap();
    assert!(wc.check().unwrap().is_empty());
    assert_eq!(std::fs::read(sources.join("foo.spec")).unwrap(), b"v1\n");
    assert!(!sources.join("orphan").exists());
}
