use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use patchkit_core::{install_root_from_executable, relative_path_string, Ledger, PatchConfig};
use patchkit_installer::{
    install_patch, plan_install, read_ledger, uninstall_patch, CommandElevator,
    CommandRuntimeInstaller, DeferredAction, FsAccessChecker, InstallCollaborators, InstallEvent,
    InstallLayout, InstallOutcome, InstallPhase, InstallPlan, InstallReport, InstallRequest,
    PlannedChangeKind, RuntimeInstaller, RuntimeStatus, ScriptCleanupScheduler,
    UninstallCollaborators, UninstallEvent, UninstallOutcome, UninstallRequest, UninstallStatus,
};
use tracing::debug;

use crate::completion::write_completions_script;
use crate::render::{render_status_line, OutputStyle, TerminalProgress, TerminalRenderer};
use crate::{Cli, Commands};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let renderer = TerminalRenderer::current(cli.plain);

    match cli.command {
        Commands::Install {
            target,
            game_exe,
            staging_root,
            dry_run,
        } => {
            let staging_root = root_or_installer_dir(staging_root)?;
            let config = PatchConfig::load_from_dir(&staging_root)?;
            let install_root = absolute_root(resolve_install_root(target, game_exe, &config)?)?;

            if dry_run {
                let plan = plan_install(&staging_root, &install_root, &config)?;
                renderer.print_lines(&render_install_plan_lines(&plan));
                return Ok(());
            }
            run_install_flow(renderer, &staging_root, &install_root, &config, false)
        }
        Commands::Uninstall { install_root } => {
            let install_root = root_or_installer_dir(install_root)?;
            run_uninstall_flow(renderer, &install_root, false, None)
        }
        Commands::Status { install_root } => {
            let install_root = root_or_installer_dir(install_root)?;
            let config = PatchConfig::load_from_dir(&install_root)?;
            let layout = InstallLayout::for_config(&install_root, &config);
            match read_ledger(&layout)? {
                Some(ledger) => renderer.print_lines(&format_status_lines(&ledger)),
                None => renderer.print_status(
                    "info",
                    &format!("no patch installed in {}", install_root.display()),
                ),
            }
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut stdout = io::stdout().lock();
            write_completions_script(shell, &mut stdout)
        }
        Commands::ElevatedInstall {
            install_root,
            staging_root,
        } => {
            let staging_root = root_or_installer_dir(staging_root)?;
            let install_root = absolute_root(install_root)?;
            let config = PatchConfig::load_from_dir(&staging_root)?;
            run_install_flow(renderer, &staging_root, &install_root, &config, true)
        }
        Commands::ElevatedUninstall {
            parent_pid,
            install_root,
        } => {
            let install_root = root_or_installer_dir(install_root)?;
            run_uninstall_flow(renderer, &install_root, true, Some(parent_pid))
        }
    }
}

/// Roots are made absolute up front: an elevated re-entry starts in an
/// unrelated working directory.
pub(crate) fn absolute_root(root: PathBuf) -> Result<PathBuf> {
    std::path::absolute(&root)
        .with_context(|| format!("failed to resolve absolute path for {}", root.display()))
}

fn root_or_installer_dir(root: Option<PathBuf>) -> Result<PathBuf> {
    match root {
        Some(root) => absolute_root(root),
        None => installer_dir(),
    }
}

fn installer_dir() -> Result<PathBuf> {
    let executable =
        std::env::current_exe().context("failed to resolve the installer executable path")?;
    executable
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("installer executable has no parent directory"))
}

pub(crate) fn resolve_install_root(
    target: Option<PathBuf>,
    game_exe: Option<PathBuf>,
    config: &PatchConfig,
) -> Result<PathBuf> {
    match (target, game_exe) {
        (Some(target), None) => Ok(target),
        (None, Some(game_exe)) => {
            install_root_from_executable(&game_exe, config.discovery.executable.as_deref())
        }
        _ => Err(anyhow!("exactly one of --target or --game-exe is required")),
    }
}

fn run_install_flow(
    renderer: TerminalRenderer,
    staging_root: &Path,
    install_root: &Path,
    config: &PatchConfig,
    elevated: bool,
) -> Result<()> {
    let elevator = CommandElevator::current()?;
    let runtime = config
        .runtime
        .as_ref()
        .map(|runtime| CommandRuntimeInstaller::from_config(runtime, staging_root));
    let collaborators = InstallCollaborators {
        access: &FsAccessChecker,
        elevator: &elevator,
        runtime: runtime
            .as_ref()
            .map(|runtime| runtime as &dyn RuntimeInstaller),
    };
    let request = InstallRequest {
        staging_root,
        install_root,
        config,
        elevated,
    };

    renderer.print_section(&format!("install {}", config.patch.name));
    let mut progress: Option<TerminalProgress> = None;
    let outcome = install_patch(&request, &collaborators, |event| {
        on_install_event(renderer, &mut progress, event)
    });
    if let Some(progress) = progress.take() {
        if outcome.is_ok() {
            progress.finish_success();
        } else {
            progress.finish_abandon();
        }
    }

    match outcome? {
        InstallOutcome::Installed(report) => {
            renderer.print_lines(&format_install_report_lines(
                &report,
                install_root,
                renderer.style(),
            ));
        }
        InstallOutcome::Elevated => {
            renderer.print_status("ok", "install completed by the elevated installer");
        }
    }
    Ok(())
}

fn on_install_event(
    renderer: TerminalRenderer,
    progress: &mut Option<TerminalProgress>,
    event: InstallEvent,
) {
    match event {
        InstallEvent::FileInstalled {
            relative_path,
            current,
            total,
            ..
        } => {
            let progress =
                progress.get_or_insert_with(|| renderer.start_progress("install", total as u64));
            progress.set(current as u64);
            progress.set_detail(&relative_path_string(&relative_path));
        }
        InstallEvent::Phase(InstallPhase::RevertingAndFailed) => {
            if let Some(progress) = progress.take() {
                progress.finish_abandon();
            }
            renderer.print_status("warn", "install failed; reverting changes");
        }
        InstallEvent::Phase(phase) => debug!(phase = phase.as_str(), "install phase"),
        InstallEvent::RevertIncomplete { paths } => {
            for path in paths {
                renderer.print_status("err", &format!("could not revert {}", path.display()));
            }
        }
        _ => {}
    }
}

fn run_uninstall_flow(
    renderer: TerminalRenderer,
    install_root: &Path,
    elevated: bool,
    parent_pid: Option<u32>,
) -> Result<()> {
    let config = PatchConfig::load_from_dir(install_root)?;
    let layout = InstallLayout::for_config(install_root, &config);
    let elevator = CommandElevator::current()?;
    let cleanup = ScriptCleanupScheduler::new(layout.cleanup_script_path());
    let collaborators = UninstallCollaborators {
        access: &FsAccessChecker,
        elevator: &elevator,
        cleanup: &cleanup,
    };
    let self_binary = std::env::current_exe()
        .ok()
        .filter(|binary| binary.starts_with(install_root));
    let request = UninstallRequest {
        install_root,
        config: &config,
        elevated,
        parent_pid,
        self_binary: self_binary.as_deref(),
    };

    renderer.print_section(&format!("uninstall {}", config.patch.name));
    let mut progress: Option<TerminalProgress> = None;
    let outcome = uninstall_patch(&request, &collaborators, |event| match event {
        UninstallEvent::Phase(phase) => debug!(phase = phase.as_str(), "uninstall phase"),
        UninstallEvent::FileRemoved {
            relative_path,
            current,
            total,
            ..
        } => {
            let progress = progress
                .get_or_insert_with(|| renderer.start_progress("uninstall", total as u64));
            progress.set(current as u64);
            progress.set_detail(&relative_path_string(&relative_path));
        }
        UninstallEvent::FileDeferred {
            relative_path,
            reason,
        } => debug!(
            relative_path = %relative_path.display(),
            reason = %reason,
            "file removal deferred"
        ),
    });
    if let Some(progress) = progress.take() {
        if outcome.is_ok() {
            progress.finish_success();
        } else {
            progress.finish_abandon();
        }
    }

    let outcome = outcome?;
    renderer.print_lines(&format_uninstall_outcome_lines(
        &outcome,
        install_root,
        renderer.style(),
    ));
    Ok(())
}

pub(crate) fn format_install_report_lines(
    report: &InstallReport,
    install_root: &Path,
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        "ok",
        &format!(
            "installed {} file(s) into {}",
            report.installed.len(),
            install_root.display()
        ),
    )];
    if !report.backed_up.is_empty() {
        lines.push(render_status_line(
            style,
            "info",
            &format!("backed up {} original file(s)", report.backed_up.len()),
        ));
    }
    if !report.tidied.is_empty() {
        lines.push(render_status_line(
            style,
            "info",
            &format!("removed {} file(s) no longer shipped", report.tidied.len()),
        ));
    }
    match &report.runtime {
        RuntimeStatus::NotConfigured => {}
        RuntimeStatus::AlreadyInstalled => lines.push(render_status_line(
            style,
            "info",
            "runtime dependency already present",
        )),
        RuntimeStatus::Installed => lines.push(render_status_line(
            style,
            "ok",
            "runtime dependency installed",
        )),
        RuntimeStatus::Failed(reason) => lines.push(render_status_line(
            style,
            "warn",
            &format!("runtime dependency install failed: {reason}"),
        )),
    }
    lines
}

pub(crate) fn format_uninstall_outcome_lines(
    outcome: &UninstallOutcome,
    install_root: &Path,
    style: OutputStyle,
) -> Vec<String> {
    let summary = match outcome.status {
        UninstallStatus::NotInstalled => {
            return vec![render_status_line(
                style,
                "info",
                &format!("no patch installed in {}", install_root.display()),
            )];
        }
        UninstallStatus::Elevated => {
            return vec![render_status_line(
                style,
                "ok",
                "uninstall completed by the elevated installer",
            )];
        }
        UninstallStatus::Uninstalled => format!(
            "removed {} file(s), restored {} original(s)",
            outcome.removed.len(),
            outcome.restored.len()
        ),
    };

    let mut lines = vec![render_status_line(style, "ok", &summary)];
    for action in &outcome.deferred {
        let message = match action {
            DeferredAction::DeleteFile(path) => {
                format!("will delete {} after exit", path.display())
            }
            DeferredAction::RestoreBackup { destination, .. } => {
                format!("will restore {} after exit", destination.display())
            }
        };
        lines.push(render_status_line(style, "warn", &message));
    }
    lines
}

/// Script-friendly dry-run listing.
pub(crate) fn render_install_plan_lines(plan: &InstallPlan) -> Vec<String> {
    let count = |kind: PlannedChangeKind| {
        plan.changes
            .iter()
            .filter(|change| change.kind == kind)
            .count()
    };

    let mut lines = vec![
        format!(
            "install_preview install_root={} mode=dry-run",
            plan.install_root.display()
        ),
        format!(
            "install_summary adds={} backups={} replacements={} removals={} restores={}",
            count(PlannedChangeKind::Add),
            count(PlannedChangeKind::AddWithBackup),
            count(PlannedChangeKind::Replace),
            count(PlannedChangeKind::Remove),
            count(PlannedChangeKind::RemoveAndRestore)
        ),
    ];
    for change in &plan.changes {
        lines.push(format!(
            "change kind={} path={}",
            change.kind.as_str(),
            relative_path_string(&change.relative_path)
        ));
    }
    lines
}

pub(crate) fn format_status_lines(ledger: &Ledger) -> Vec<String> {
    let mut lines = vec![
        format!("install_root={}", ledger.install_root().display()),
        format!("backup_root={}", ledger.backup_root().display()),
        format!("installed_files={}", ledger.len()),
    ];
    for entry in ledger.entries() {
        lines.push(format!(
            "file path={} backup={}",
            relative_path_string(&entry.relative_path),
            entry.had_backup
        ));
    }
    lines
}
