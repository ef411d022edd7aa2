//! Privilege drop and the gate listeners wait on before serving

use anyhow::{Context, Result};
use nix::unistd::{self, Gid, Group, Uid, User};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, info};

/// Opened once the process no longer runs with elevated rights
#[derive(Clone)]
pub struct PrivilegeGate {
    rx: watch::Receiver<bool>,
}

impl PrivilegeGate {
    /// Resolves once privileges are dropped. Errors if the guard went away
    /// without dropping them, in which case the caller must not serve.
    pub async fn dropped(&mut self) -> Result<()> {
        self.rx
            .wait_for(|dropped| *dropped)
            .await
            .map(|_| ())
            .map_err(|_| anyhow::anyhow!("privileges were never dropped"))
    }
}

pub(crate) struct GateOpener {
    tx: watch::Sender<bool>,
}

impl GateOpener {
    pub(crate) fn open(self) {
        self.tx.send_replace(true);
    }
}

pub(crate) fn gate() -> (GateOpener, PrivilegeGate) {
    let (tx, rx) = watch::channel(false);
    (GateOpener { tx }, PrivilegeGate { rx })
}

/// Drops to the configured user and group, then opens the gate
pub struct PrivilegeGuard {
    user: String,
    group: String,
    handed_over: Vec<PathBuf>,
    opener: GateOpener,
}

impl PrivilegeGuard {
    pub fn new(user: &str, group: &str) -> (Self, PrivilegeGate) {
        let (opener, gate) = gate();
        let guard = Self {
            user: user.to_string(),
            group: group.to_string(),
            handed_over: Vec::new(),
            opener,
        };
        (guard, gate)
    }

    /// Files and directories created while privileged that must stay
    /// writable afterwards. Ownership moves to the target user before the drop.
    pub fn hand_over<I, P>(&mut self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.handed_over.extend(paths.into_iter().map(Into::into));
    }

    /// Consumes the guard: the drop happens at most once
    pub fn drop_privileges(self) -> Result<()> {
        if Uid::effective().is_root() {
            drop_identity(&self.user, &self.group, &self.handed_over)?;
            info!("Dropped privileges to {}:{}", self.user, self.group);
        } else {
            info!("Not running as root, no privileges to drop");
        }
        self.opener.open();
        Ok(())
    }
}

fn drop_identity(user: &str, group: &str, handed_over: &[PathBuf]) -> Result<()> {
    let group = Group::from_name(group)
        .with_context(|| format!("Could not look up group {}", group))?
        .ok_or_else(|| anyhow::anyhow!("Group {} does not exist", group))?;
    let user = User::from_name(user)
        .with_context(|| format!("Could not look up user {}", user))?
        .ok_or_else(|| anyhow::anyhow!("User {} does not exist", user))?;

    for path in handed_over {
        hand_over_path(path, user.uid, group.gid)?;
    }

    // Group first: after setuid we no longer may change it
    unistd::setgroups(&[group.gid]).context("Unable to clear supplementary groups")?;
    unistd::setgid(group.gid).context("Unable to set GID")?;
    unistd::setuid(user.uid).context("Unable to set UID")?;

    if Uid::effective().is_root() || Uid::current().is_root() {
        anyhow::bail!("Still running as root after dropping to {}", user.name);
    }
    Ok(())
}

fn hand_over_path(path: &Path, uid: Uid, gid: Gid) -> Result<()> {
    // Optional files (e.g. SQLite side files) may not exist yet
    if std::fs::symlink_metadata(path).is_err() {
        debug!("Nothing to hand over at {}", path.display());
        return Ok(());
    }
    unistd::chown(path, Some(uid), Some(gid))
        .with_context(|| format!("Unable to change owner of {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::capture::{capture_stream, CaptureEnd, CaptureLimits};
    use crate::record::Payload;
    use chrono::Utc;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::ForkResult;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_gate_blocks_until_opened() {
        let (opener, gate) = gate();
        let mut waiter = gate;
        let task = tokio::spawn(async move { waiter.dropped().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        opener.open();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_gate_errors_when_guard_is_lost() {
        let (opener, mut gate) = gate();
        drop(opener);
        assert!(gate.dropped().await.is_err());
    }

    #[tokio::test]
    async fn test_late_waiter_sees_open_gate() {
        let (opener, mut gate) = gate();
        opener.open();
        gate.dropped().await.unwrap();
    }

    #[test]
    fn test_missing_handed_over_path_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("records.db-wal");
        hand_over_path(&missing, Uid::effective(), Gid::effective()).unwrap();
    }

    /// Unprivileged side of the spill test; runs in a forked child
    fn spill_after_drop(large: &Path, group: &str) -> Result<bool> {
        let (mut guard, _gate) = PrivilegeGuard::new("nobody", group);
        guard.hand_over([large]);
        guard.drop_privileges()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let outcome = runtime.block_on(async {
            let (mut client, mut server) = tokio::io::duplex(8 * 1024);
            let writer = tokio::spawn(async move {
                let _ = client.write_all(&[b'A'; 10_000]).await;
                let _ = client.shutdown().await;
            });
            let limits = CaptureLimits::default();
            let outcome = capture_stream(&mut server, 8080, Utc::now(), &limits, large).await;
            drop(server);
            let _ = writer.await;
            outcome
        });

        Ok(outcome.end == CaptureEnd::PeerClosed
            && matches!(outcome.payload, Payload::File(ref path) if std::fs::metadata(path)?.len() == 10_000))
    }

    #[test]
    fn test_spill_dir_stays_writable_after_drop() {
        if !Uid::effective().is_root() || User::from_name("nobody").ok().flatten().is_none() {
            return;
        }
        let group = match Group::from_name("nogroup") {
            Ok(Some(_)) => "nogroup",
            _ => "nobody",
        };

        // Created as root, the way startup creates it
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        let large = dir.path().join("large");
        std::fs::create_dir_all(&large).unwrap();

        // setuid applies to the whole process, so drop in a child
        match unsafe { unistd::fork() }.unwrap() {
            ForkResult::Child => {
                let spilled = std::panic::catch_unwind(|| spill_after_drop(&large, group))
                    .map(|result| matches!(result, Ok(true)))
                    .unwrap_or(false);
                std::process::exit(if spilled { 0 } else { 1 });
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert_eq!(status, WaitStatus::Exited(child, 0));
            }
        }
    }
}
