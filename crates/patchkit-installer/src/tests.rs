use super::*;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use patchkit_core::{PatchConfig, PatchError, RuntimeConfig};
use walkdir::WalkDir;

use crate::elevation::{build_elevation_command, quote_windows_arg};
use crate::fs_utils::remove_file_if_exists;
use crate::install::{install_patch_with_hooks, PassCheckpoint};
use crate::uninstall::uninstall_patch_with_io;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_dir_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "patchkit-installer-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

#[test]
fn build_test_dir_path_disambiguates_same_timestamp_calls() {
    let first = build_test_dir_path(42);
    let second = build_test_dir_path(42);
    assert_ne!(
        first, second,
        "installer test paths must remain unique when timestamp granularity is coarse"
    );
}

struct Fixture {
    root: PathBuf,
    staging: PathBuf,
    game: PathBuf,
    config: PatchConfig,
}

impl Fixture {
    fn new() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time")
            .as_nanos();
        let root = build_test_dir_path(nanos);
        let staging = root.join("staging");
        let game = root.join("game");
        fs::create_dir_all(&staging).expect("must create staging dir");
        fs::create_dir_all(&game).expect("must create game dir");
        Self {
            root,
            staging,
            game,
            config: PatchConfig::default(),
        }
    }

    fn layout(&self) -> InstallLayout {
        InstallLayout::for_config(&self.game, &self.config)
    }

    fn stage(&self, relative: &str, contents: &str) {
        write_file(&self.staging.join(relative), contents);
    }

    fn unstage(&self, relative: &str) {
        fs::remove_file(self.staging.join(relative)).expect("must remove staged file");
    }

    fn put_game_file(&self, relative: &str, contents: &str) {
        write_file(&self.game.join(relative), contents);
    }

    fn game_file(&self, relative: &str) -> Option<String> {
        fs::read_to_string(self.game.join(relative)).ok()
    }

    fn request(&self) -> InstallRequest<'_> {
        InstallRequest {
            staging_root: &self.staging,
            install_root: &self.game,
            config: &self.config,
            elevated: false,
        }
    }

    fn uninstall_request(&self) -> UninstallRequest<'_> {
        UninstallRequest {
            install_root: &self.game,
            config: &self.config,
            elevated: false,
            parent_pid: None,
            self_binary: None,
        }
    }

    fn install(&self) -> InstallReport {
        let elevator = RecordingElevator::exiting_with(Some(0));
        let collaborators = InstallCollaborators {
            access: &GrantAll,
            elevator: &elevator,
            runtime: None,
        };
        match install_patch(&self.request(), &collaborators, |_| {}).expect("must install") {
            InstallOutcome::Installed(report) => report,
            InstallOutcome::Elevated => panic!("install must not elevate"),
        }
    }

    fn ledger(&self) -> Option<patchkit_core::Ledger> {
        read_ledger(&self.layout()).expect("must read ledger")
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("must create parent dir");
    }
    fs::write(path, contents).expect("must write file");
}

/// Every directory and file under `root`, with file contents.
fn snapshot_tree(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|entry| entry.expect("must walk tree"))
        .map(|entry| {
            let relative = entry
                .path()
                .strip_prefix(root)
                .expect("must be under root")
                .to_string_lossy()
                .replace('\\', "/");
            let contents = entry
                .file_type()
                .is_file()
                .then(|| fs::read(entry.path()).expect("must read file"));
            (relative, contents)
        })
        .collect()
}

struct GrantAll;

impl AccessChecker for GrantAll {
    fn check_write_access(&self, _root: &Path) -> Result<AccessStatus> {
        Ok(AccessStatus::Granted)
    }
}

struct DenyAll;

impl AccessChecker for DenyAll {
    fn check_write_access(&self, _root: &Path) -> Result<AccessStatus> {
        Ok(AccessStatus::Denied)
    }
}

struct RecordingElevator {
    code: Option<i32>,
    calls: RefCell<Vec<ElevatedInvocation>>,
}

impl RecordingElevator {
    fn exiting_with(code: Option<i32>) -> Self {
        Self {
            code,
            calls: RefCell::new(Vec::new()),
        }
    }
}

impl Elevator for RecordingElevator {
    fn run_elevated(&self, invocation: &ElevatedInvocation) -> Result<Option<i32>> {
        self.calls.borrow_mut().push(invocation.clone());
        Ok(self.code)
    }
}

#[derive(Default)]
struct RecordingCleanup {
    calls: RefCell<Vec<(Vec<DeferredAction>, Vec<u32>)>>,
}

impl DeferredCleanup for RecordingCleanup {
    fn schedule_deferred_cleanup(
        &self,
        actions: &[DeferredAction],
        wait_for_pids: &[u32],
    ) -> Result<PathBuf> {
        self.calls
            .borrow_mut()
            .push((actions.to_vec(), wait_for_pids.to_vec()));
        Ok(PathBuf::from("cleanup.sh"))
    }
}

struct FakeRuntime {
    already_installed: bool,
    fail: bool,
    installs: AtomicUsize,
}

impl FakeRuntime {
    fn new(already_installed: bool, fail: bool) -> Self {
        Self {
            already_installed,
            fail,
            installs: AtomicUsize::new(0),
        }
    }
}

impl RuntimeInstaller for FakeRuntime {
    fn is_installed(&self) -> bool {
        self.already_installed
    }

    fn install(&self) -> Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("redistributable exited with status 1603"));
        }
        Ok(())
    }
}

fn install_with_checkpoint<H>(fixture: &Fixture, checkpoint: H) -> Result<InstallOutcome>
where
    H: FnMut(PassCheckpoint<'_>) -> Result<()>,
{
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = InstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        runtime: None,
    };
    install_patch_with_hooks(&fixture.request(), &collaborators, |_| {}, checkpoint)
}

#[test]
fn fresh_install_into_empty_dir_records_entries_without_backups() {
    let fixture = Fixture::new();
    fixture.stage("data/_lvl_pc/core.lvl", "patched core");
    fixture.stage("shaders/water.fx", "patched water");

    let report = fixture.install();

    assert_eq!(report.installed.len(), 2);
    assert!(report.backed_up.is_empty());
    assert!(report.tidied.is_empty());
    assert_eq!(report.runtime, RuntimeStatus::NotConfigured);
    assert_eq!(report.ledger_path, fixture.layout().ledger_path());

    let ledger = fixture.ledger().expect("ledger must exist");
    assert_eq!(ledger.len(), 2);
    assert!(ledger.entries().all(|entry| !entry.had_backup));
    assert!(!fixture.layout().backup_dir().exists());
    assert!(!fixture.layout().pass_dir().exists());
    assert_eq!(
        fixture.game_file("data/_lvl_pc/core.lvl").as_deref(),
        Some("patched core")
    );
}

#[test]
fn install_backs_up_foreign_file_once() {
    let fixture = Fixture::new();
    fixture.put_game_file("data/_lvl_pc/core.lvl", "original core");
    fixture.stage("data/_lvl_pc/core.lvl", "patched core");

    let report = fixture.install();

    assert_eq!(report.backed_up, vec![PathBuf::from("data/_lvl_pc/core.lvl")]);
    let backup = fixture.layout().backup_dir().join("data/_lvl_pc/core.lvl");
    assert_eq!(
        fs::read_to_string(&backup).expect("backup must exist"),
        "original core"
    );
    let ledger = fixture.ledger().expect("ledger must exist");
    assert_eq!(
        ledger
            .entry(Path::new("data/_lvl_pc/core.lvl"))
            .map(|entry| entry.had_backup),
        Some(true)
    );
}

#[test]
fn reinstalling_same_staged_set_is_idempotent() {
    let fixture = Fixture::new();
    fixture.put_game_file("core.lvl", "original core");
    fixture.stage("core.lvl", "patched core");
    fixture.stage("shaders/new.fx", "new shader");

    fixture.install();
    let first_tree = snapshot_tree(&fixture.game);
    let first_ledger = fixture.ledger().expect("ledger must exist");

    let report = fixture.install();

    assert!(report.backed_up.is_empty(), "no duplicate backups");
    assert_eq!(snapshot_tree(&fixture.game), first_tree);
    assert_eq!(fixture.ledger().expect("ledger must exist"), first_ledger);
    assert_eq!(
        fs::read_to_string(fixture.layout().backup_dir().join("core.lvl"))
            .expect("backup must survive"),
        "original core"
    );
}

#[test]
fn reinstall_tidies_files_dropped_from_staged_set() {
    let fixture = Fixture::new();
    fixture.put_game_file("b.lvl", "original b");
    fixture.stage("a.lvl", "patched a");
    fixture.stage("b.lvl", "patched b");
    fixture.stage("extra/c.fx", "patched c");
    fixture.install();

    fixture.unstage("b.lvl");
    fixture.unstage("extra/c.fx");
    let report = fixture.install();

    assert_eq!(
        report.tidied,
        vec![PathBuf::from("b.lvl"), PathBuf::from("extra/c.fx")]
    );
    assert_eq!(fixture.game_file("a.lvl").as_deref(), Some("patched a"));
    assert_eq!(fixture.game_file("b.lvl").as_deref(), Some("original b"));
    assert!(fixture.game_file("extra/c.fx").is_none());
    assert!(!fixture.layout().backup_dir().join("b.lvl").exists());

    let ledger = fixture.ledger().expect("ledger must exist");
    assert_eq!(ledger.relative_paths(), vec![PathBuf::from("a.lvl")]);
}

#[test]
fn install_replaces_orphaned_backup_with_current_foreign_file() {
    let fixture = Fixture::new();
    fixture.put_game_file("core.lvl", "current core");
    write_file(
        &fixture.layout().backup_dir().join("core.lvl"),
        "stale backup",
    );
    fixture.stage("core.lvl", "patched core");

    fixture.install();

    assert_eq!(
        fs::read_to_string(fixture.layout().backup_dir().join("core.lvl"))
            .expect("backup must exist"),
        "current core"
    );
}

#[test]
fn failed_pass_restores_pre_pass_tree_at_every_checkpoint() {
    let checkpoints: [fn(&PassCheckpoint<'_>) -> bool; 5] = [
        |point| matches!(point, PassCheckpoint::InstallingFile(path) if path.ends_with("c.lvl")),
        |point| matches!(point, PassCheckpoint::InstalledFile(path) if path.ends_with("d.lvl")),
        |point| matches!(point, PassCheckpoint::TidyingFile(_)),
        |point| matches!(point, PassCheckpoint::Persisting),
        |point| matches!(point, PassCheckpoint::Persisted),
    ];

    for (index, should_fail) in checkpoints.into_iter().enumerate() {
        let fixture = Fixture::new();
        fixture.put_game_file("b.lvl", "original b");
        fixture.put_game_file("d.lvl", "original d");
        fixture.stage("a.lvl", "patched a v1");
        fixture.stage("b.lvl", "patched b v1");
        fixture.install();

        fixture.unstage("b.lvl");
        fixture.stage("a.lvl", "patched a v2");
        fixture.stage("c.lvl", "patched c v2");
        fixture.stage("d.lvl", "patched d v2");
        fixture.stage("nested/dir/e.lvl", "patched e v2");

        let before = snapshot_tree(&fixture.game);
        let ledger_before = fixture.ledger();

        let err = install_with_checkpoint(&fixture, |point| {
            if should_fail(&point) {
                return Err(anyhow!("injected failure"));
            }
            Ok(())
        })
        .expect_err("install must fail");

        assert!(
            err.to_string().contains("injected failure"),
            "checkpoint {index} must surface the original error"
        );
        assert_eq!(
            snapshot_tree(&fixture.game),
            before,
            "checkpoint {index} must restore the pre-pass tree"
        );
        assert_eq!(fixture.ledger(), ledger_before);
    }
}

#[test]
fn failed_fresh_install_leaves_empty_target() {
    let fixture = Fixture::new();
    fixture.put_game_file("b.lvl", "original b");
    fixture.stage("a/a.lvl", "patched a");
    fixture.stage("b.lvl", "patched b");

    let mut events = Vec::new();
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = InstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        runtime: None,
    };
    let before = snapshot_tree(&fixture.game);

    install_patch_with_hooks(
        &fixture.request(),
        &collaborators,
        |event| events.push(event),
        |point| match point {
            PassCheckpoint::Persisted => Err(anyhow!("disk full")),
            _ => Ok(()),
        },
    )
    .expect_err("install must fail");

    assert_eq!(snapshot_tree(&fixture.game), before);
    assert!(fixture.ledger().is_none());
    assert!(events.contains(&InstallEvent::Phase(InstallPhase::RevertingAndFailed)));
    assert!(!events
        .iter()
        .any(|event| matches!(event, InstallEvent::RevertIncomplete { .. })));
    assert!(elevator.calls.borrow().is_empty());
}

#[test]
fn permission_failure_mid_pass_reverts_then_elevates() {
    let fixture = Fixture::new();
    fixture.stage("a.lvl", "patched a");
    fixture.stage("b.lvl", "patched b");
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = InstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        runtime: None,
    };

    let outcome = install_patch_with_hooks(
        &fixture.request(),
        &collaborators,
        |_| {},
        |point| match point {
            PassCheckpoint::InstallingFile(path) if path.ends_with("b.lvl") => {
                Err(PatchError::file_operation(
                    "copy staged file to",
                    path,
                    io::Error::from(io::ErrorKind::PermissionDenied),
                )
                .into())
            }
            _ => Ok(()),
        },
    )
    .expect("must hand off to elevated installer");

    assert_eq!(outcome, InstallOutcome::Elevated);
    assert!(fixture.game_file("a.lvl").is_none());
    assert_eq!(
        elevator.calls.borrow().as_slice(),
        &[ElevatedInvocation::Install {
            install_root: fixture.game.clone(),
            staging_root: fixture.staging.clone(),
        }]
    );
}

#[test]
fn denied_access_delegates_without_touching_tree() {
    let fixture = Fixture::new();
    fixture.stage("a.lvl", "patched a");
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = InstallCollaborators {
        access: &DenyAll,
        elevator: &elevator,
        runtime: None,
    };

    let outcome =
        install_patch(&fixture.request(), &collaborators, |_| {}).expect("must delegate");

    assert_eq!(outcome, InstallOutcome::Elevated);
    assert!(snapshot_tree(&fixture.game).is_empty());
    assert_eq!(elevator.calls.borrow().len(), 1);
}

#[test]
fn elevated_child_failure_is_reported_with_exit_code() {
    let fixture = Fixture::new();
    fixture.stage("a.lvl", "patched a");
    let elevator = RecordingElevator::exiting_with(Some(1));
    let collaborators = InstallCollaborators {
        access: &DenyAll,
        elevator: &elevator,
        runtime: None,
    };

    let err = install_patch(&fixture.request(), &collaborators, |_| {})
        .expect_err("nonzero child exit must fail");

    assert!(matches!(
        err.downcast_ref::<PatchError>(),
        Some(PatchError::ElevatedProcessFailed { code: Some(1) })
    ));
}

#[test]
fn already_elevated_install_does_not_delegate_again() {
    let fixture = Fixture::new();
    fixture.stage("a.lvl", "patched a");
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = InstallCollaborators {
        access: &DenyAll,
        elevator: &elevator,
        runtime: None,
    };
    let request = InstallRequest {
        elevated: true,
        ..fixture.request()
    };

    let err = install_patch(&request, &collaborators, |_| {}).expect_err("must fail");

    assert!(matches!(
        err.downcast_ref::<PatchError>(),
        Some(PatchError::AccessDenied { .. })
    ));
    assert!(elevator.calls.borrow().is_empty());
}

#[test]
fn install_rejects_staging_root_equal_to_install_root() {
    let fixture = Fixture::new();
    let request = InstallRequest {
        install_root: &fixture.staging,
        ..fixture.request()
    };
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = InstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        runtime: None,
    };

    let err = install_patch(&request, &collaborators, |_| {}).expect_err("must fail");
    assert!(err.to_string().contains("must differ"));
}

#[test]
fn corrupt_ledger_aborts_install_before_any_change() {
    let fixture = Fixture::new();
    fixture.stage("a.lvl", "patched a");
    write_file(&fixture.layout().ledger_path(), "{ not json");
    let before = snapshot_tree(&fixture.game);

    let err = install_with_checkpoint(&fixture, |_| Ok(())).expect_err("must fail");

    assert!(matches!(
        err.downcast_ref::<PatchError>(),
        Some(PatchError::LedgerCorrupt { .. })
    ));
    assert_eq!(snapshot_tree(&fixture.game), before);
}

#[test]
fn runtime_failure_is_reported_without_failing_install() {
    let fixture = Fixture::new();
    fixture.stage("a.lvl", "patched a");
    let runtime = FakeRuntime::new(false, true);
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = InstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        runtime: Some(&runtime),
    };
    let mut events = Vec::new();

    let outcome = install_patch(&fixture.request(), &collaborators, |event| events.push(event))
        .expect("must install");

    let InstallOutcome::Installed(report) = outcome else {
        panic!("install must not elevate");
    };
    assert!(matches!(report.runtime, RuntimeStatus::Failed(ref reason) if reason.contains("1603")));
    assert_eq!(runtime.installs.load(Ordering::SeqCst), 1);
    assert!(events
        .iter()
        .any(|event| matches!(event, InstallEvent::RuntimeFinished(RuntimeStatus::Failed(_)))));
}

#[test]
fn runtime_already_present_is_skipped() {
    let fixture = Fixture::new();
    fixture.stage("a.lvl", "patched a");
    let runtime = FakeRuntime::new(true, false);
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = InstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        runtime: Some(&runtime),
    };

    let outcome = install_patch(&fixture.request(), &collaborators, |_| {}).expect("must install");

    assert!(matches!(
        outcome,
        InstallOutcome::Installed(InstallReport {
            runtime: RuntimeStatus::AlreadyInstalled,
            ..
        })
    ));
    assert_eq!(runtime.installs.load(Ordering::SeqCst), 0);
}

#[test]
fn runtime_install_is_joined_even_when_pass_fails() {
    let fixture = Fixture::new();
    fixture.stage("a.lvl", "patched a");
    let runtime = FakeRuntime::new(false, false);
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = InstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        runtime: Some(&runtime),
    };

    install_patch_with_hooks(
        &fixture.request(),
        &collaborators,
        |_| {},
        |_| Err(anyhow!("injected failure")),
    )
    .expect_err("must fail");

    assert_eq!(runtime.installs.load(Ordering::SeqCst), 1);
}

#[test]
fn install_events_report_phases_in_order() {
    let fixture = Fixture::new();
    fixture.stage("a.lvl", "patched a");
    fixture.stage("b.lvl", "patched b");
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = InstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        runtime: None,
    };
    let mut events = Vec::new();

    install_patch(&fixture.request(), &collaborators, |event| events.push(event))
        .expect("must install");

    let phases = events
        .iter()
        .filter_map(|event| match event {
            InstallEvent::Phase(phase) => Some(*phase),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        phases,
        vec![
            InstallPhase::CheckingAccess,
            InstallPhase::InstallingFiles,
            InstallPhase::Tidying,
            InstallPhase::Persisting,
            InstallPhase::Done,
        ]
    );
    assert!(events.contains(&InstallEvent::FileInstalled {
        relative_path: PathBuf::from("b.lvl"),
        backed_up: false,
        current: 2,
        total: 2,
    }));
}

#[test]
fn phase_names_match_log_fields() {
    assert_eq!(InstallPhase::CheckingAccess.as_str(), "checking_access");
    assert_eq!(
        InstallPhase::RevertingAndFailed.as_str(),
        "reverting_and_failed"
    );
    assert_eq!(UninstallPhase::Cleanup.as_str(), "cleanup");
    assert_eq!(UninstallPhase::Done.as_str(), "done");
}

#[test]
fn staged_set_skips_reserved_paths_and_excludes() {
    let mut fixture = Fixture::new();
    fixture.config.install.exclude = vec!["docs".to_string(), "readme-dev.txt".to_string()];
    fixture.stage("patchkit.toml", "[patch]\nname = \"demo\"\n");
    fixture.stage("core.lvl", "patched core");
    fixture.stage("readme-dev.txt", "notes");
    fixture.stage("docs/guide.md", "guide");
    fixture.stage(".patchkit/install_ledger.json", "{}");
    fixture.stage(".patchkit/backup/core.lvl", "old");
    fixture.stage("~patchkit-finish-uninstall.sh", "rm");

    let staged = collect_staged_files(&fixture.staging, &fixture.layout(), &fixture.config)
        .expect("must collect staged files");

    let relative = staged
        .iter()
        .map(|file| file.relative_path.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        relative,
        vec![PathBuf::from("core.lvl"), PathBuf::from("patchkit.toml")]
    );
}

#[test]
fn plan_install_describes_changes_without_touching_tree() {
    let fixture = Fixture::new();
    fixture.put_game_file("b.lvl", "original b");
    fixture.stage("a.lvl", "patched a");
    fixture.stage("b.lvl", "patched b");
    fixture.stage("c.lvl", "patched c");
    fixture.install();

    fixture.unstage("b.lvl");
    fixture.unstage("c.lvl");
    fixture.put_game_file("d.lvl", "original d");
    fixture.stage("d.lvl", "patched d");
    fixture.stage("e.lvl", "patched e");
    let before = snapshot_tree(&fixture.game);

    let plan = plan_install(&fixture.staging, &fixture.game, &fixture.config).expect("must plan");

    assert_eq!(snapshot_tree(&fixture.game), before);
    let kinds = plan
        .changes
        .iter()
        .map(|change| (change.relative_path.to_string_lossy().into_owned(), change.kind))
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            ("a.lvl".to_string(), PlannedChangeKind::Replace),
            ("d.lvl".to_string(), PlannedChangeKind::AddWithBackup),
            ("e.lvl".to_string(), PlannedChangeKind::Add),
            ("b.lvl".to_string(), PlannedChangeKind::RemoveAndRestore),
            ("c.lvl".to_string(), PlannedChangeKind::Remove),
        ]
    );
}

#[test]
fn persisted_ledger_uses_document_field_names() {
    let fixture = Fixture::new();
    fixture.stage("a.lvl", "patched a");
    fixture.install();

    let raw = fs::read_to_string(fixture.layout().ledger_path()).expect("must read ledger");
    let document: serde_json::Value = serde_json::from_str(&raw).expect("must parse ledger");
    assert_eq!(document["version"], 1);
    assert_eq!(
        document["installPath"].as_str(),
        Some(fixture.game.to_string_lossy().as_ref())
    );
    assert_eq!(document["installedFiles"]["a.lvl"], false);
    assert!(!fixture.layout().ledger_tmp_path().exists());
}

#[test]
fn ledger_persist_then_load_round_trips_entries() {
    let fixture = Fixture::new();
    let layout = fixture.layout();
    let mut ledger = patchkit_core::Ledger::new(&fixture.game, layout.backup_dir());
    ledger.record_installed(Path::new("data/core.lvl"), true);
    ledger.record_installed(Path::new("shaders/water.fx"), false);

    persist_ledger(&layout, &ledger).expect("must persist");
    let loaded = load_ledger(&layout).expect("must load");

    assert_eq!(loaded, ledger);
}

#[test]
fn moved_install_rebases_ledger_to_actual_root() {
    let fixture = Fixture::new();
    let layout = fixture.layout();
    let elsewhere = fixture.root.join("old-location");
    let mut ledger = patchkit_core::Ledger::new(&elsewhere, elsewhere.join(".patchkit/backup"));
    ledger.record_installed(Path::new("a.lvl"), false);
    persist_ledger(&layout, &ledger).expect("must persist");

    let loaded = read_ledger(&layout)
        .expect("must read ledger")
        .expect("ledger must exist");

    assert_eq!(loaded.install_root(), fixture.game.as_path());
    assert_eq!(loaded.backup_root(), layout.backup_dir().as_path());
    assert!(loaded.contains(Path::new("a.lvl")));
}

#[test]
fn install_then_uninstall_restores_original_tree() {
    let fixture = Fixture::new();
    fixture.put_game_file("data/core.lvl", "original core");
    fixture.put_game_file("keep.txt", "untouched");
    fixture.stage("data/core.lvl", "patched core");
    fixture.stage("data/new/extra.lvl", "patched extra");
    fixture.stage("patch.dll", "binary");
    let before = snapshot_tree(&fixture.game);

    fixture.install();
    let cleanup = RecordingCleanup::default();
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = UninstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        cleanup: &cleanup,
    };
    let outcome = uninstall_patch(&fixture.uninstall_request(), &collaborators, |_| {})
        .expect("must uninstall");

    assert_eq!(outcome.status, UninstallStatus::Uninstalled);
    assert_eq!(outcome.restored, vec![PathBuf::from("data/core.lvl")]);
    assert!(outcome.deferred.is_empty());
    assert!(outcome.cleanup_script.is_none());
    assert!(cleanup.calls.borrow().is_empty());
    assert_eq!(snapshot_tree(&fixture.game), before);
}

#[test]
fn uninstall_without_ledger_reports_not_installed() {
    let fixture = Fixture::new();
    let cleanup = RecordingCleanup::default();
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = UninstallCollaborators {
        access: &DenyAll,
        elevator: &elevator,
        cleanup: &cleanup,
    };

    let outcome = uninstall_patch(&fixture.uninstall_request(), &collaborators, |_| {})
        .expect("must succeed");

    assert_eq!(outcome.status, UninstallStatus::NotInstalled);
    assert!(elevator.calls.borrow().is_empty());
}

#[test]
fn uninstall_defers_locked_file_and_still_deletes_ledger() {
    let fixture = Fixture::new();
    fixture.put_game_file("c.lvl", "original c");
    fixture.stage("a.lvl", "patched a");
    fixture.stage("c.lvl", "patched c");
    fixture.install();

    let cleanup = RecordingCleanup::default();
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = UninstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        cleanup: &cleanup,
    };
    let request = UninstallRequest {
        parent_pid: Some(4242),
        ..fixture.uninstall_request()
    };
    let locked = fixture.game.join("c.lvl");
    let mut events = Vec::new();

    let outcome = uninstall_patch_with_io(
        &request,
        &collaborators,
        |event| events.push(event),
        read_ledger,
        |path| {
            if path == locked {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "file is in use",
                ));
            }
            fs::remove_file(path)
        },
    )
    .expect("locked file must not fail uninstall");

    let backup = fixture.layout().backup_dir().join("c.lvl");
    assert_eq!(outcome.removed, vec![PathBuf::from("a.lvl")]);
    assert_eq!(
        outcome.deferred,
        vec![
            DeferredAction::DeleteFile(locked.clone()),
            DeferredAction::RestoreBackup {
                backup: backup.clone(),
                destination: locked.clone(),
            },
        ]
    );
    assert!(!fixture.layout().ledger_path().exists());
    assert!(backup.exists(), "backup must stay for deferred restore");
    assert_eq!(outcome.cleanup_script, Some(PathBuf::from("cleanup.sh")));

    let calls = cleanup.calls.borrow();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, outcome.deferred);
    assert_eq!(calls[0].1, vec![std::process::id(), 4242]);
    assert!(events.contains(&UninstallEvent::FileDeferred {
        relative_path: PathBuf::from("c.lvl"),
        reason: "file is in use".to_string(),
    }));
}

#[test]
fn uninstall_schedules_removal_of_own_binary() {
    let fixture = Fixture::new();
    fixture.stage("a.lvl", "patched a");
    fixture.install();
    let binary = fixture.game.join("patchkit");
    write_file(&binary, "installer");

    let cleanup = RecordingCleanup::default();
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = UninstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        cleanup: &cleanup,
    };
    let request = UninstallRequest {
        self_binary: Some(&binary),
        ..fixture.uninstall_request()
    };

    let outcome = uninstall_patch(&request, &collaborators, |_| {}).expect("must uninstall");

    assert_eq!(outcome.deferred, vec![DeferredAction::DeleteFile(binary.clone())]);
    assert_eq!(cleanup.calls.borrow().len(), 1);
}

#[test]
fn uninstall_prunes_directories_created_by_install() {
    let fixture = Fixture::new();
    fixture.put_game_file("data/keep.lvl", "keep");
    fixture.stage("data/deep/nested/a.lvl", "patched a");
    fixture.install();

    let cleanup = RecordingCleanup::default();
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = UninstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        cleanup: &cleanup,
    };
    uninstall_patch(&fixture.uninstall_request(), &collaborators, |_| {}).expect("must uninstall");

    assert!(!fixture.game.join("data/deep").exists());
    assert!(fixture.game.join("data/keep.lvl").exists());
    assert!(!fixture.layout().state_dir().exists());
}

#[test]
fn install_records_only_directories_it_created() {
    let fixture = Fixture::new();
    fixture.put_game_file("data/keep.lvl", "keep");
    fixture.stage("data/deep/nested/a.lvl", "patched a");
    fixture.install();

    let ledger = fixture.ledger().expect("ledger must exist");
    assert_eq!(
        ledger.created_dirs_deepest_first(),
        vec![
            Path::new("data").join("deep").join("nested"),
            Path::new("data").join("deep"),
        ]
    );
}

#[test]
fn uninstall_keeps_preexisting_empty_directory() {
    let fixture = Fixture::new();
    fs::create_dir_all(fixture.game.join("mods")).expect("must create empty mods dir");
    fixture.stage("mods/x.lvl", "patched x");
    let before = snapshot_tree(&fixture.game);

    fixture.install();
    assert!(fixture.ledger().expect("ledger must exist").created_dirs_deepest_first().is_empty());

    let cleanup = RecordingCleanup::default();
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = UninstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        cleanup: &cleanup,
    };
    uninstall_patch(&fixture.uninstall_request(), &collaborators, |_| {}).expect("must uninstall");

    assert!(fixture.game.join("mods").is_dir());
    assert_eq!(snapshot_tree(&fixture.game), before);
}

#[test]
fn uninstall_delegates_with_own_pid_when_access_denied() {
    let fixture = Fixture::new();
    fixture.stage("a.lvl", "patched a");
    fixture.install();

    let cleanup = RecordingCleanup::default();
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = UninstallCollaborators {
        access: &DenyAll,
        elevator: &elevator,
        cleanup: &cleanup,
    };

    let outcome = uninstall_patch(&fixture.uninstall_request(), &collaborators, |_| {})
        .expect("must delegate");

    assert_eq!(outcome.status, UninstallStatus::Elevated);
    assert_eq!(
        elevator.calls.borrow().as_slice(),
        &[ElevatedInvocation::Uninstall {
            install_root: fixture.game.clone(),
            parent_pid: std::process::id(),
        }]
    );
    assert!(fixture.game_file("a.lvl").is_some());
}

#[test]
fn uninstall_elevates_when_ledger_read_is_denied() {
    let fixture = Fixture::new();
    fixture.stage("a.lvl", "patched a");
    fixture.install();

    let cleanup = RecordingCleanup::default();
    let elevator = RecordingElevator::exiting_with(Some(0));
    let collaborators = UninstallCollaborators {
        access: &GrantAll,
        elevator: &elevator,
        cleanup: &cleanup,
    };
    let denied_read = |layout: &InstallLayout| -> Result<Option<patchkit_core::Ledger>> {
        Err(PatchError::file_operation(
            "read install ledger",
            layout.ledger_path(),
            io::Error::from(io::ErrorKind::PermissionDenied),
        )
        .into())
    };

    let outcome = uninstall_patch_with_io(
        &fixture.uninstall_request(),
        &collaborators,
        |_| {},
        denied_read,
        remove_file_if_exists,
    )
    .expect("must hand off to elevated uninstaller");

    assert_eq!(outcome.status, UninstallStatus::Elevated);
    assert_eq!(
        elevator.calls.borrow().as_slice(),
        &[ElevatedInvocation::Uninstall {
            install_root: fixture.game.clone(),
            parent_pid: std::process::id(),
        }]
    );
    assert!(fixture.game_file("a.lvl").is_some());

    let elevated = UninstallRequest {
        elevated: true,
        ..fixture.uninstall_request()
    };
    let err = uninstall_patch_with_io(
        &elevated,
        &collaborators,
        |_| {},
        denied_read,
        remove_file_if_exists,
    )
    .expect_err("elevated instance must not delegate again");
    assert!(PatchError::chain_is_access_denied(&err));
    assert_eq!(elevator.calls.borrow().len(), 1);
}

#[test]
fn shell_cleanup_script_waits_kills_and_replays_actions() {
    let script = render_cleanup_script(
        ScriptFlavor::Shell,
        &[
            DeferredAction::DeleteFile(PathBuf::from("/game/it's.lvl")),
            DeferredAction::RestoreBackup {
                backup: PathBuf::from("/game/.patchkit/backup/core.lvl"),
                destination: PathBuf::from("/game/data/core.lvl"),
            },
        ],
        &[100, 200],
    );

    let lines = script.lines().collect::<Vec<_>>();
    assert_eq!(
        lines,
        vec![
            "#!/bin/sh",
            "sleep 1",
            "kill 100 2>/dev/null",
            "kill 200 2>/dev/null",
            "sleep 1",
            "rm -f -- '/game/it'\\''s.lvl'",
            "mkdir -p -- '/game/data'",
            "mv -f -- '/game/.patchkit/backup/core.lvl' '/game/data/core.lvl' 2>/dev/null",
            "rm -f -- \"$0\"",
        ]
    );
}

#[test]
fn batch_cleanup_script_uses_crlf_and_deletes_itself() {
    let script = render_cleanup_script(
        ScriptFlavor::Batch,
        &[DeferredAction::DeleteFile(PathBuf::from("C:\\Game\\100%.lvl"))],
        &[7],
    );

    assert!(script.starts_with("@echo off\r\n"));
    assert!(script.contains("taskkill /F /PID 7 >nul 2>&1\r\n"));
    assert!(script.contains("del /F /Q \"C:\\Game\\100%%.lvl\" >nul 2>&1\r\n"));
    assert!(script.ends_with("(goto) 2>nul & del \"%~f0\"\r\n"));
}

#[test]
fn script_scheduler_writes_script_at_configured_path() {
    let fixture = Fixture::new();
    let scheduler = ScriptCleanupScheduler::new(fixture.layout().cleanup_script_path());
    assert_eq!(
        scheduler.script_path(),
        fixture.layout().cleanup_script_path().as_path()
    );
    let name = scheduler
        .script_path()
        .file_name()
        .and_then(|name| name.to_str())
        .expect("script must have a file name");
    assert!(name.starts_with("~patchkit-finish-uninstall."));
}

#[test]
fn elevated_invocations_render_legacy_arguments() {
    let install = ElevatedInvocation::Install {
        install_root: PathBuf::from("/games/swbf2"),
        staging_root: PathBuf::from("/downloads/patch"),
    };
    let uninstall = ElevatedInvocation::Uninstall {
        install_root: PathBuf::from("/games/swbf2"),
        parent_pid: 812,
    };

    assert_eq!(
        install.args(),
        vec!["-install", "/games/swbf2", "--staging-root", "/downloads/patch"]
    );
    assert_eq!(
        uninstall.args(),
        vec!["-uninstall", "812", "--install-root", "/games/swbf2"]
    );
}

#[test]
fn windows_arguments_are_quoted_for_argv_parsing() {
    assert_eq!(quote_windows_arg("-uninstall"), "-uninstall");
    assert_eq!(
        quote_windows_arg("C:\\Program Files (x86)\\SWBF2"),
        "\"C:\\Program Files (x86)\\SWBF2\""
    );
    assert_eq!(quote_windows_arg("C:\\My Games\\"), "\"C:\\My Games\\\\\"");
    assert_eq!(quote_windows_arg("say \"hi\""), "\"say \\\"hi\\\"\"");
    assert_eq!(quote_windows_arg(""), "\"\"");
}

#[test]
fn elevation_command_targets_host_mechanism() {
    let command = build_elevation_command(
        Path::new("/opt/patch/patchkit"),
        &ElevatedInvocation::Uninstall {
            install_root: PathBuf::from("/games/My Game"),
            parent_pid: 9,
        },
    );

    if cfg!(windows) {
        assert_eq!(command.get_program(), "powershell");
        let script = command
            .get_args()
            .last()
            .expect("must have script argument")
            .to_string_lossy()
            .into_owned();
        assert!(script.contains("-Verb RunAs"));
        assert!(script
            .contains("-ArgumentList @('-uninstall','9','--install-root','\"/games/My Game\"')"));
        assert!(script.contains("exit $p.ExitCode"));
    } else {
        assert_eq!(command.get_program(), "pkexec");
        let args = command.get_args().collect::<Vec<_>>();
        assert_eq!(
            args,
            vec![
                "/opt/patch/patchkit",
                "-uninstall",
                "9",
                "--install-root",
                "/games/My Game"
            ]
        );
    }
}

#[test]
fn command_runtime_installer_resolves_program_and_marker() {
    let fixture = Fixture::new();
    let marker = fixture.root.join("vcruntime140_1.dll");
    let runtime = CommandRuntimeInstaller::from_config(
        &RuntimeConfig {
            program: "redist/vc_redist.x64.exe".to_string(),
            args: vec!["/install".to_string(), "/quiet".to_string()],
            installed_marker: Some(marker.to_string_lossy().into_owned()),
        },
        &fixture.staging,
    );

    let command = runtime.build_command();
    assert_eq!(
        Path::new(command.get_program()),
        fixture.staging.join("redist/vc_redist.x64.exe")
    );
    assert_eq!(
        command.get_args().collect::<Vec<_>>(),
        vec!["/install", "/quiet"]
    );

    assert!(!runtime.is_installed());
    write_file(&marker, "dll");
    assert!(runtime.is_installed());
}

#[test]
fn command_runtime_installer_reports_missing_program() {
    let fixture = Fixture::new();
    let runtime = CommandRuntimeInstaller::from_config(
        &RuntimeConfig {
            program: "missing-redist".to_string(),
            args: Vec::new(),
            installed_marker: None,
        },
        &fixture.staging,
    );

    let err = runtime.install().expect_err("must fail");
    assert!(err
        .to_string()
        .contains("failed to install runtime dependency"));
}

#[test]
fn probe_write_access_grants_writable_tree() {
    let fixture = Fixture::new();
    fixture.put_game_file("data/core.lvl", "core");

    let status = probe_write_access(&fixture.game).expect("must probe");

    assert_eq!(status, AccessStatus::Granted);
    assert_eq!(
        fs::read_dir(&fixture.game).expect("must list").count(),
        1,
        "probe file must be removed"
    );
}

#[test]
fn probe_write_access_rejects_missing_root() {
    let fixture = Fixture::new();
    let err = probe_write_access(&fixture.root.join("missing")).expect_err("must fail");
    assert!(err.to_string().contains("inspect install root"));
}
