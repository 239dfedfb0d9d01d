//! Simulation sandbox
//!
//! Executes untrusted strategy artifacts under hard resource bounds. Every
//! instantiation is preceded by a byte-for-byte digest check; a mismatch
//! never loads the module. Results are cached by (artifact digest, input
//! digest) with singleflight so identical concurrent requests execute once.

mod native;
mod wasm;

pub use native::NativeRuntime;
pub use wasm::WasmRuntime;

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::B256;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::{self, MonoTime};
use crate::config::SandboxCfg;
use crate::error::MipResult;
use crate::metrics;

/// Hard cap on captured stdout.
pub const STDOUT_CAP: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Wasm,
    NativeProcess,
    MicroVm,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Wasm => "wasm",
            RuntimeKind::NativeProcess => "native_process",
            RuntimeKind::MicroVm => "micro_vm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsCapability {
    None,
    ReadOnly,
    ReadWrite,
}

/// Identifies a strategy plugin. Immutable; the digest is verified before
/// every instantiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxManifest {
    pub runtime: RuntimeKind,
    pub artifact: PathBuf,
    /// SHA-256 of the artifact bytes.
    pub digest: B256,
    pub memory_cap_mib: u64,
    pub timeout: Duration,
    pub fuel_cap: u64,
    pub fs: FsCapability,
    pub allow_network: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapReason {
    Fuel,
    Timeout,
    Oom,
    HostDenied,
}

impl TrapReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrapReason::Fuel => "fuel",
            TrapReason::Timeout => "timeout",
            TrapReason::Oom => "oom",
            TrapReason::HostDenied => "host_denied",
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxFailure {
    #[error("trap: {}", .0.as_str())]
    Trap(TrapReason),
    #[error("integrity failure: {0}")]
    Integrity(String),
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
    #[error("sandbox internal: {0}")]
    Internal(String),
}

impl SandboxFailure {
    pub fn trap_reason(&self) -> Option<TrapReason> {
        match self {
            SandboxFailure::Trap(r) => Some(*r),
            _ => None,
        }
    }

    fn status_label(&self) -> &'static str {
        match self {
            SandboxFailure::Trap(r) => r.as_str(),
            SandboxFailure::Integrity(_) => "integrity",
            SandboxFailure::Unavailable(_) => "unavailable",
            SandboxFailure::Internal(_) => "error",
        }
    }
}

pub type RunResult = Result<Vec<u8>, SandboxFailure>;

type CacheKey = (B256, B256);

#[derive(Clone)]
struct CachedRun {
    output: Arc<Vec<u8>>,
    at: MonoTime,
}

#[derive(Debug, Default)]
pub struct SandboxStats {
    pub runs: AtomicU64,
    pub cache_hits: AtomicU64,
    pub module_loads: AtomicU64,
    pub traps: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxStatsSnapshot {
    pub runs: u64,
    pub cache_hits: u64,
    pub module_loads: u64,
    pub traps: u64,
}

/// The sandbox orchestrator. Explicitly constructed and passed by handle;
/// there is deliberately no process-wide instance.
pub struct Sandbox {
    cache: Mutex<LruCache<CacheKey, CachedRun>>,
    cache_ttl: Duration,
    inflight: DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
    wasm: Option<WasmRuntime>,
    native: Option<NativeRuntime>,
    stats: SandboxStats,
}

impl Sandbox {
    pub fn new(cfg: &SandboxCfg) -> MipResult<Self> {
        Ok(Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cfg.cache_entries.max(1)).expect("cache_entries >= 1"),
            )),
            cache_ttl: Duration::from_secs(cfg.cache_ttl_secs),
            inflight: DashMap::new(),
            wasm: cfg.enable_wasm.then(WasmRuntime::new),
            native: cfg.enable_native.then(NativeRuntime::new),
            stats: SandboxStats::default(),
        })
    }

    /// Run an artifact against `input` under the manifest's caps.
    ///
    /// `timeout == 0` short-circuits to a timeout trap before anything is
    /// read from disk, and a digest mismatch fails before any module load.
    pub async fn run(&self, manifest: &SandboxManifest, input: &[u8]) -> RunResult {
        if manifest.timeout.is_zero() {
            self.count_failure(manifest, &SandboxFailure::Trap(TrapReason::Timeout));
            return Err(SandboxFailure::Trap(TrapReason::Timeout));
        }

        let input_digest = B256::from_slice(&Sha256::digest(input));
        let key = (manifest.digest, input_digest);

        if let Some(hit) = self.cache_get(&key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            metrics::inc(metrics::SANDBOX_CACHE_HITS);
            return Ok(hit.as_ref().clone());
        }

        // Singleflight: exactly one execution per cache key at a time.
        let gate = self
            .inflight
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // A racing caller may have filled the cache while we waited.
        if let Some(hit) = self.cache_get(&key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            metrics::inc(metrics::SANDBOX_CACHE_HITS);
            drop(_guard);
            self.release_gate(&key, gate);
            return Ok(hit.as_ref().clone());
        }

        let started = std::time::Instant::now();
        let result = self.execute(manifest, input).await;
        let elapsed = started.elapsed().as_secs_f64();

        let status = match &result {
            Ok(_) => "success",
            Err(f) => f.status_label(),
        };
        metrics::histogram2(
            metrics::SANDBOX_RUNS_SECONDS,
            elapsed,
            "runtime",
            manifest.runtime.as_str(),
            "status",
            status,
        );
        self.stats.runs.fetch_add(1, Ordering::Relaxed);

        match &result {
            Ok(output) => {
                self.cache.lock().put(
                    key,
                    CachedRun {
                        output: Arc::new(output.clone()),
                        at: clock::now(),
                    },
                );
            }
            Err(failure) => self.count_failure(manifest, failure),
        }

        drop(_guard);
        self.release_gate(&key, gate);
        result
    }

    async fn execute(&self, manifest: &SandboxManifest, input: &[u8]) -> RunResult {
        // Digest check happens here, before any runtime sees the artifact.
        let artifact = tokio::fs::read(&manifest.artifact).await.map_err(|e| {
            SandboxFailure::Integrity(format!("{}: {e}", manifest.artifact.display()))
        })?;
        let actual = B256::from_slice(&Sha256::digest(&artifact));
        if actual != manifest.digest {
            warn!(
                artifact = %manifest.artifact.display(),
                expected = %manifest.digest,
                observed = %actual,
                "artifact digest mismatch; refusing to load"
            );
            return Err(SandboxFailure::Integrity(format!(
                "digest mismatch for {}",
                manifest.artifact.display()
            )));
        }

        self.stats.module_loads.fetch_add(1, Ordering::Relaxed);
        metrics::inc1(metrics::SANDBOX_MODULE_LOADS, "runtime", manifest.runtime.as_str());

        match manifest.runtime {
            RuntimeKind::Wasm => match &self.wasm {
                Some(rt) => rt.run(manifest, artifact, input.to_vec()).await,
                None => Err(SandboxFailure::Unavailable("wasm runtime disabled".into())),
            },
            RuntimeKind::NativeProcess => match &self.native {
                Some(rt) => rt.run(manifest, input.to_vec()).await,
                None => Err(SandboxFailure::Unavailable(
                    "native runtime disabled".into(),
                )),
            },
            RuntimeKind::MicroVm => Err(SandboxFailure::Unavailable(
                "micro-vm runtime is not available in this build".into(),
            )),
        }
    }

    fn cache_get(&self, key: &CacheKey) -> Option<Arc<Vec<u8>>> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(hit) if clock::elapsed_ns(hit.at) <= self.cache_ttl.as_nanos() as u64 => {
                Some(hit.output.clone())
            }
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn release_gate(&self, key: &CacheKey, gate: Arc<tokio::sync::Mutex<()>>) {
        drop(gate);
        self.inflight
            .remove_if(key, |_, v| Arc::strong_count(v) <= 1);
    }

    fn count_failure(&self, manifest: &SandboxManifest, failure: &SandboxFailure) {
        if matches!(failure, SandboxFailure::Trap(_)) {
            self.stats.traps.fetch_add(1, Ordering::Relaxed);
        }
        metrics::inc2(
            metrics::SANDBOX_FAILURES,
            "runtime",
            manifest.runtime.as_str(),
            "reason",
            failure.status_label(),
        );
        debug!(runtime = manifest.runtime.as_str(), failure = %failure, "sandbox run failed");
    }

    pub fn stats(&self) -> SandboxStatsSnapshot {
        SandboxStatsSnapshot {
            runs: self.stats.runs.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            module_loads: self.stats.module_loads.load(Ordering::Relaxed),
            traps: self.stats.traps.load(Ordering::Relaxed),
        }
    }
}

/// Compute the manifest digest for an artifact on disk. Used by operators
/// when registering plugins, and by tests.
pub async fn digest_artifact(path: &std::path::Path) -> std::io::Result<B256> {
    let bytes = tokio::fs::read(path).await?;
    Ok(B256::from_slice(&Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxCfg;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn sandbox() -> Sandbox {
        Sandbox::new(&SandboxCfg::default()).unwrap()
    }

    fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "{body}").unwrap();
        drop(f);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn manifest_for(path: PathBuf, digest: B256) -> SandboxManifest {
        SandboxManifest {
            runtime: RuntimeKind::NativeProcess,
            artifact: path,
            digest,
            memory_cap_mib: 64,
            timeout: Duration::from_secs(10),
            fuel_cap: 1_000_000_000,
            fs: FsCapability::None,
            allow_network: false,
        }
    }

    #[tokio::test]
    async fn zero_timeout_traps_before_load() {
        let sb = sandbox();
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "echo.sh", "cat");
        let digest = digest_artifact(&script).await.unwrap();
        let mut manifest = manifest_for(script, digest);
        manifest.timeout = Duration::ZERO;

        let err = sb.run(&manifest, b"hello").await.unwrap_err();
        assert_eq!(err.trap_reason(), Some(TrapReason::Timeout));
        assert_eq!(sb.stats().module_loads, 0);
    }

    #[tokio::test]
    async fn tampered_artifact_never_loads() {
        let sb = sandbox();
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "echo.sh", "cat");
        let digest = digest_artifact(&script).await.unwrap();

        // Tamper one byte after the digest was recorded.
        let mut bytes = std::fs::read(&script).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&script, &bytes).unwrap();

        let manifest = manifest_for(script, digest);
        let err = sb.run(&manifest, b"x").await.unwrap_err();
        assert!(matches!(err, SandboxFailure::Integrity(_)));
        assert_eq!(sb.stats().module_loads, 0);
    }

    #[tokio::test]
    async fn echo_run_round_trips_and_caches() {
        let sb = sandbox();
        let dir = tempfile::tempdir().unwrap();
        // Echo stdin back, and leave a breadcrumb per execution.
        let marker = dir.path().join("ran");
        let script = write_script(
            &dir,
            "echo.sh",
            &format!("echo x >> {}\ncat", marker.display()),
        );
        let digest = digest_artifact(&script).await.unwrap();
        let manifest = manifest_for(script, digest);

        let out = sb.run(&manifest, b"payload").await.unwrap();
        assert_eq!(out, b"payload");
        assert_eq!(sb.stats().module_loads, 1);

        // Cache hit: same digest + input must not re-execute.
        let out2 = sb.run(&manifest, b"payload").await.unwrap();
        assert_eq!(out2, b"payload");
        assert_eq!(sb.stats().cache_hits, 1);
        assert_eq!(sb.stats().module_loads, 1);
        let executions = std::fs::read_to_string(&marker).unwrap().lines().count();
        assert_eq!(executions, 1);

        // Different input is a different cache key.
        let out3 = sb.run(&manifest, b"other").await.unwrap();
        assert_eq!(out3, b"other");
        assert_eq!(sb.stats().module_loads, 2);
    }

    #[tokio::test]
    async fn unbounded_loop_traps_on_fuel() {
        let sb = sandbox();
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "spin.sh", "while :; do :; done");
        let digest = digest_artifact(&script).await.unwrap();
        let mut manifest = manifest_for(script, digest);
        manifest.fuel_cap = 1_000; // ~1 CPU-second budget

        let err = sb.run(&manifest, b"").await.unwrap_err();
        assert_eq!(err.trap_reason(), Some(TrapReason::Fuel));
        assert_eq!(sb.stats().traps, 1);
    }

    #[tokio::test]
    async fn wall_clock_watchdog_fires() {
        let sb = sandbox();
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "sleep.sh", "sleep 30");
        let digest = digest_artifact(&script).await.unwrap();
        let mut manifest = manifest_for(script, digest);
        manifest.timeout = Duration::from_millis(200);

        let err = sb.run(&manifest, b"").await.unwrap_err();
        assert_eq!(err.trap_reason(), Some(TrapReason::Timeout));
    }

    #[tokio::test]
    async fn micro_vm_is_unavailable_not_a_trap() {
        let sb = sandbox();
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "echo.sh", "cat");
        let digest = digest_artifact(&script).await.unwrap();
        let mut manifest = manifest_for(script, digest);
        manifest.runtime = RuntimeKind::MicroVm;

        let err = sb.run(&manifest, b"").await.unwrap_err();
        assert!(matches!(err, SandboxFailure::Unavailable(_)));
        assert!(err.trap_reason().is_none());
    }
}
