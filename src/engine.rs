//! Deployment engine: stage -> backup -> activate -> verify -> commit, with
//! automatic rollback when activation or the after-hook fails.
//!
//! Ordering per deployment is strict. A per-target mutex serializes the
//! mutation window (backup through commit/rollback), so two concurrent
//! deployments of the same target cannot interleave their renames.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::archive;
use crate::config::{Config, HookCommand, Target};
use crate::crypto;
use crate::error::{DeployError, Result};

pub struct Engine {
    config: Arc<Config>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Engine {
    pub fn new(config: Arc<Config>) -> Engine {
        Engine {
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// At-most-one in-flight mutation per target name.
    fn lock_for(&self, target: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("target lock map poisoned");
        locks
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run one deployment of `sealed` to `target`, decrypting with `key`.
    ///
    /// Failures before activation leave the target untouched. Failures
    /// during activation or the after-hook roll back to the backed-up
    /// artifact when one exists; a failed rollback is reported as
    /// [`DeployError::RestoreFailed`] and nothing further is attempted.
    pub async fn deploy(&self, target: &Target, key: &[u8; 32], sealed: &[u8]) -> Result<()> {
        let payload = crypto::open(key, sealed)?;
        let staging = archive::unpack(&payload)?;
        let entry = staging.sole_entry()?;
        debug!(
            target_name = %target.name,
            staged = %entry.display(),
            "payload unpacked"
        );

        // Before-hook runs prior to any move, so a failure here needs no
        // restore: report it directly.
        run_hook(target.before.as_ref(), &target.path).await?;

        let lock = self.lock_for(&target.name);
        let _guard = lock.lock().await;

        let backup = self.backup_artifact(target).await?;
        if let Some(ref path) = backup {
            info!(
                target_name = %target.name,
                backup = %path.display(),
                "previous artifact moved aside"
            );
        }

        let outcome = match self.activate(target, &entry).await {
            Ok(()) => run_hook(target.after.as_ref(), &target.path).await,
            Err(err) => Err(err),
        };

        if let Err(cause) = outcome {
            return match backup {
                Some(ref backup_path) => {
                    warn!(
                        target_name = %target.name,
                        error = %cause,
                        "deployment failed, rolling back"
                    );
                    self.rollback(target, backup_path).await?;
                    info!(target_name = %target.name, "previous artifact restored");
                    Err(cause)
                }
                // First-ever deployment: nothing to restore.
                None => Err(cause),
            };
        }

        // Commit: reclaim the backup. A delete failure does not undo an
        // already-successful deployment; log it and move on.
        if let Some(backup_path) = backup {
            if let Err(err) = remove_path(&backup_path).await {
                warn!(
                    target_name = %target.name,
                    backup = %backup_path.display(),
                    error = %err,
                    "failed to delete backup after commit"
                );
            }
        }
        info!(target_name = %target.name, "deployment committed");
        Ok(())
    }

    /// Move an existing artifact into the backup root under a timestamped
    /// name. Absence of an artifact is a legitimate first deployment, not
    /// an error.
    async fn backup_artifact(&self, target: &Target) -> Result<Option<PathBuf>> {
        fs::create_dir_all(&self.config.backup_dir)
            .await
            .map_err(DeployError::Backup)?;

        match fs::symlink_metadata(&target.path).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DeployError::Backup(err)),
            Ok(_) => {
                let dest = self.backup_path(&target.name, "bak");
                fs::rename(&target.path, &dest)
                    .await
                    .map_err(DeployError::Backup)?;
                Ok(Some(dest))
            }
        }
    }

    fn backup_path(&self, target_name: &str, suffix: &str) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d%H%M%S");
        self.config
            .backup_dir
            .join(format!("{target_name}.{stamp}.{suffix}"))
    }

    /// Rename the staged entry onto the artifact path. The prior artifact
    /// was already moved aside, so nothing is replaced here.
    async fn activate(&self, target: &Target, entry: &Path) -> Result<()> {
        if let Some(parent) = target.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(entry, &target.path).await?;
        info!(target_name = %target.name, path = %target.path.display(), "artifact activated");
        Ok(())
    }

    /// Restore the backed-up artifact after a failed activation or
    /// after-hook. The broken artifact is kept aside as forensic evidence,
    /// never discarded. Any failure in here is fatal for automation.
    async fn rollback(&self, target: &Target, backup: &Path) -> Result<()> {
        if fs::symlink_metadata(&target.path).await.is_ok() {
            let failed = self.backup_path(&target.name, "failed.bak");
            fs::rename(&target.path, &failed)
                .await
                .map_err(|err| DeployError::RestoreFailed {
                    context: format!("moving the failed artifact aside: {err}"),
                })?;
            warn!(
                target_name = %target.name,
                failed = %failed.display(),
                "failed artifact kept for inspection"
            );
        }

        fs::rename(backup, &target.path)
            .await
            .map_err(|err| DeployError::RestoreFailed {
                context: format!("renaming the backup into place: {err}"),
            })?;

        // Restart the previous version. The artifact is already back in
        // place at this point, so a failing re-run is logged rather than
        // escalated; the session still reports the original failure.
        if let Err(err) = run_hook(target.after.as_ref(), &target.path).await {
            warn!(
                target_name = %target.name,
                error = %err,
                "after hook failed while restarting the restored artifact"
            );
        }
        Ok(())
    }
}

/// Execute a lifecycle hook with the artifact path as working directory.
/// `None` (an empty configured hook) is a no-op.
pub async fn run_hook(hook: Option<&HookCommand>, artifact: &Path) -> Result<()> {
    let Some(hook) = hook else {
        return Ok(());
    };
    let cwd = working_dir(artifact);
    debug!(command = %hook, cwd = %cwd.display(), "running hook");

    let output = Command::new(&hook.program)
        .args(&hook.args)
        .current_dir(&cwd)
        .output()
        .await
        .map_err(|err| DeployError::Hook {
            command: hook.to_string(),
            reason: format!("spawn failed: {err}"),
        })?;

    if !output.stdout.is_empty() {
        debug!(command = %hook, "hook stdout: {}", String::from_utf8_lossy(&output.stdout).trim_end());
    }
    if !output.stderr.is_empty() {
        debug!(command = %hook, "hook stderr: {}", String::from_utf8_lossy(&output.stderr).trim_end());
    }

    if output.status.success() {
        Ok(())
    } else {
        Err(DeployError::Hook {
            command: hook.to_string(),
            reason: match output.status.code() {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            },
        })
    }
}

/// Hooks run from the artifact path when it is an existing directory, else
/// from its nearest existing parent, so relative scripts resolve
/// predictably whether or not the artifact is in place yet.
fn working_dir(artifact: &Path) -> PathBuf {
    if artifact.is_dir() {
        return artifact.to_path_buf();
    }
    let mut candidate = artifact.parent();
    while let Some(dir) = candidate {
        if dir.is_dir() {
            return dir.to_path_buf();
        }
        candidate = dir.parent();
    }
    PathBuf::from(".")
}

/// Remove a file or directory tree; a missing path is fine.
async fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_hook_is_noop() {
        run_hook(None, Path::new("/nonexistent")).await.unwrap();
    }

    #[tokio::test]
    async fn failing_hook_reports_exit_status() {
        let hook = HookCommand::parse("false").unwrap();
        match run_hook(Some(&hook), Path::new("/tmp")).await {
            Err(DeployError::Hook { command, reason }) => {
                assert_eq!(command, "false");
                assert!(reason.contains("exit status"));
            }
            other => panic!("expected Hook error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unspawnable_hook_reports_spawn_failure() {
        let hook = HookCommand::parse("/no/such/binary").unwrap();
        match run_hook(Some(&hook), Path::new("/tmp")).await {
            Err(DeployError::Hook { reason, .. }) => assert!(reason.contains("spawn failed")),
            other => panic!("expected Hook error, got {other:?}"),
        }
    }

    #[test]
    fn working_dir_prefers_existing_directory() {
        assert_eq!(working_dir(Path::new("/tmp")), PathBuf::from("/tmp"));
        assert_eq!(
            working_dir(Path::new("/tmp/does-not-exist-yet")),
            PathBuf::from("/tmp")
        );
    }
}
