//! Native-process sandbox runtime
//!
//! Runs an artifact as a subprocess under rlimits: the fuel cap meters CPU
//! time (RLIMIT_CPU) and the memory cap bounds the address space
//! (RLIMIT_AS). The wall-clock watchdog is independent of the fuel meter;
//! either is sufficient to terminate the run.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{FsCapability, RunResult, SandboxFailure, SandboxManifest, TrapReason, STDOUT_CAP};

/// Abstract fuel units per CPU-second. A manifest fuel cap below this grants
/// the one-second floor.
const FUEL_PER_CPU_SEC: u64 = 1_000_000;

/// Scratch directory that cleans up after itself regardless of how the run
/// ends. Shared with the wasm runtime for its preopens.
pub(super) struct ScratchDir {
    path: Option<PathBuf>,
}

impl ScratchDir {
    pub(super) fn create(fs: FsCapability) -> Result<Self, SandboxFailure> {
        let path = match fs {
            FsCapability::None => None,
            FsCapability::ReadOnly | FsCapability::ReadWrite => {
                let path = std::env::temp_dir().join(format!("stingbot-scratch-{}", Uuid::new_v4()));
                std::fs::create_dir_all(&path)
                    .map_err(|e| SandboxFailure::Internal(format!("scratch dir: {e}")))?;
                let mode = match fs {
                    FsCapability::ReadOnly => 0o555,
                    _ => 0o755,
                };
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
                    .map_err(|e| SandboxFailure::Internal(format!("scratch perms: {e}")))?;
                Some(path)
            }
        };
        Ok(Self { path })
    }

    pub(super) fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755));
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %e, "scratch dir cleanup failed");
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct NativeRuntime;

impl NativeRuntime {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, manifest: &SandboxManifest, input: Vec<u8>) -> RunResult {
        let scratch = ScratchDir::create(manifest.fs)?;
        let cwd = scratch
            .path()
            .cloned()
            .unwrap_or_else(std::env::temp_dir);

        let cpu_secs = (manifest.fuel_cap / FUEL_PER_CPU_SEC).max(1);
        let mem_bytes = manifest.memory_cap_mib.saturating_mul(1024 * 1024);

        let mut cmd = Command::new(&manifest.artifact);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&cwd)
            .env_clear()
            .kill_on_drop(true);

        // Resource limits are applied in the child between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                let cpu = libc::rlimit {
                    rlim_cur: cpu_secs,
                    rlim_max: cpu_secs,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                let mem = libc::rlimit {
                    rlim_cur: mem_bytes,
                    rlim_max: mem_bytes,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &mem) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxFailure::Internal(format!("spawn: {e}")))?;

        // Feed stdin and close it so well-behaved artifacts see EOF.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            });
        }

        // Stream stderr into the structured log.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "sandbox::stderr", "{line}");
                }
            });
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxFailure::Internal("stdout not captured".into()))?;

        let run = async {
            let mut output = Vec::new();
            let mut capped = (&mut stdout).take(STDOUT_CAP as u64);
            let read = capped.read_to_end(&mut output).await;
            let status = child.wait().await;
            (read, status, output)
        };

        match tokio::time::timeout(manifest.timeout, run).await {
            Ok((read, status, output)) => {
                read.map_err(|e| SandboxFailure::Internal(format!("stdout read: {e}")))?;
                let status =
                    status.map_err(|e| SandboxFailure::Internal(format!("wait: {e}")))?;
                classify_exit(status, output)
            }
            Err(_) => {
                let _ = child.kill().await;
                Err(SandboxFailure::Trap(TrapReason::Timeout))
            }
        }
    }
}

fn classify_exit(status: std::process::ExitStatus, output: Vec<u8>) -> RunResult {
    if status.success() {
        return Ok(output);
    }
    match status.signal() {
        Some(libc::SIGXCPU) => Err(SandboxFailure::Trap(TrapReason::Fuel)),
        Some(libc::SIGSEGV) | Some(libc::SIGABRT) | Some(libc::SIGKILL) => {
            Err(SandboxFailure::Trap(TrapReason::Oom))
        }
        Some(_) => Err(SandboxFailure::Trap(TrapReason::HostDenied)),
        None => Err(SandboxFailure::Internal(format!(
            "artifact exited with {}",
            status.code().unwrap_or(-1)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuel_cap_maps_to_cpu_seconds_with_floor() {
        assert_eq!((1_000u64 / FUEL_PER_CPU_SEC).max(1), 1);
        assert_eq!((5_000_000u64 / FUEL_PER_CPU_SEC).max(1), 5);
    }

    #[test]
    fn scratch_dir_is_destroyed_on_drop() {
        let scratch = ScratchDir::create(FsCapability::ReadWrite).unwrap();
        let path = scratch.path().unwrap().clone();
        assert!(path.exists());
        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn readonly_scratch_still_cleans_up() {
        let scratch = ScratchDir::create(FsCapability::ReadOnly).unwrap();
        let path = scratch.path().unwrap().clone();
        assert!(path.exists());
        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn no_fs_capability_means_no_scratch() {
        let scratch = ScratchDir::create(FsCapability::None).unwrap();
        assert!(scratch.path().is_none());
    }
}
