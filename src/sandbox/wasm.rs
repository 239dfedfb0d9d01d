//! WASM sandbox runtime
//!
//! Wasmtime with fuel metering, an epoch-based wall-clock watchdog and a
//! store memory limiter. WASI gives the artifact stdin/stdout pipes and, at
//! most, one preopened scratch directory. The watchdog and the fuel meter
//! are independent; a run that completes cancels its watchdog before the
//! deadline thread can fire.

use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use super::native::ScratchDir;
use super::{FsCapability, RunResult, SandboxFailure, SandboxManifest, TrapReason, STDOUT_CAP};

struct StoreState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

#[derive(Debug, Default)]
pub struct WasmRuntime;

impl WasmRuntime {
    pub fn new() -> Self {
        Self
    }

    /// Execute a verified artifact. The caller has already matched the
    /// digest; `artifact` is the exact bytes that hashed clean.
    pub async fn run(
        &self,
        manifest: &SandboxManifest,
        artifact: Vec<u8>,
        input: Vec<u8>,
    ) -> RunResult {
        let manifest = manifest.clone();
        // Wasmtime execution is synchronous; keep it off the async threads.
        tokio::task::spawn_blocking(move || run_blocking(&manifest, artifact, input))
            .await
            .map_err(|e| SandboxFailure::Internal(format!("sandbox task: {e}")))?
    }
}

fn run_blocking(manifest: &SandboxManifest, artifact: Vec<u8>, input: Vec<u8>) -> RunResult {
    // One engine per run: the epoch watchdog must only ever interrupt the
    // store it was armed for.
    let mut config = Config::new();
    config.consume_fuel(true);
    config.epoch_interruption(true);
    let engine = Engine::new(&config)
        .map_err(|e| SandboxFailure::Internal(format!("engine: {e}")))?;

    let module = match Module::from_binary(&engine, &artifact) {
        Ok(m) => m,
        Err(e) => return Err(SandboxFailure::Internal(format!("module: {e}"))),
    };

    let scratch = ScratchDir::create(manifest.fs)?;

    let stdout = MemoryOutputPipe::new(STDOUT_CAP);
    let stderr = MemoryOutputPipe::new(1 << 20);

    let mut builder = WasiCtxBuilder::new();
    builder.stdin(MemoryInputPipe::new(input));
    builder.stdout(stdout.clone());
    builder.stderr(stderr.clone());
    if manifest.allow_network {
        builder.inherit_network();
    }
    match (manifest.fs, scratch.path()) {
        (FsCapability::ReadOnly, Some(path)) => {
            builder
                .preopened_dir(path, ".", DirPerms::READ, FilePerms::READ)
                .map_err(|e| SandboxFailure::Internal(format!("preopen: {e}")))?;
        }
        (FsCapability::ReadWrite, Some(path)) => {
            builder
                .preopened_dir(path, ".", DirPerms::all(), FilePerms::all())
                .map_err(|e| SandboxFailure::Internal(format!("preopen: {e}")))?;
        }
        _ => {}
    }
    let wasi = builder.build_p1();

    let limits = StoreLimitsBuilder::new()
        .memory_size((manifest.memory_cap_mib as usize).saturating_mul(1024 * 1024))
        .build();

    let mut linker: Linker<StoreState> = Linker::new(&engine);
    preview1::add_to_linker_sync(&mut linker, |s: &mut StoreState| &mut s.wasi)
        .map_err(|e| SandboxFailure::Internal(format!("wasi link: {e}")))?;

    let mut store = Store::new(&engine, StoreState { wasi, limits });
    store.limiter(|s| &mut s.limits);
    store
        .set_fuel(manifest.fuel_cap)
        .map_err(|e| SandboxFailure::Internal(format!("fuel: {e}")))?;
    store.set_epoch_deadline(1);

    // Wall-clock watchdog: fires once unless the run finishes first.
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
    let watchdog_engine = engine.clone();
    let timeout = manifest.timeout;
    let watchdog = std::thread::spawn(move || {
        if done_rx.recv_timeout(timeout).is_err() {
            watchdog_engine.increment_epoch();
        }
    });

    let result = instantiate_and_start(&mut store, &linker, &module);

    // Deterministic cancel: the watchdog thread always exits, fired or not.
    let _ = done_tx.send(());
    let _ = watchdog.join();

    match result {
        Ok(()) => {
            let mut bytes = stdout.contents().to_vec();
            bytes.truncate(STDOUT_CAP);
            log_stderr(&stderr);
            Ok(bytes)
        }
        Err(failure) => {
            log_stderr(&stderr);
            Err(failure)
        }
    }
}

fn instantiate_and_start(
    store: &mut Store<StoreState>,
    linker: &Linker<StoreState>,
    module: &Module,
) -> Result<(), SandboxFailure> {
    let instance = linker
        .instantiate(&mut *store, module)
        .map_err(classify_error)?;
    let start = instance
        .get_typed_func::<(), ()>(&mut *store, "_start")
        .map_err(|e| SandboxFailure::Internal(format!("no _start export: {e}")))?;
    match start.call(&mut *store, ()) {
        Ok(()) => Ok(()),
        // proc_exit(0) is ordinary WASI completion, not a failure.
        Err(err)
            if err
                .downcast_ref::<wasmtime_wasi::I32Exit>()
                .is_some_and(|e| e.0 == 0) =>
        {
            Ok(())
        }
        Err(err) => Err(classify_error(err)),
    }
}

fn classify_error(err: wasmtime::Error) -> SandboxFailure {
    if let Some(trap) = err.downcast_ref::<Trap>() {
        return match trap {
            Trap::OutOfFuel => SandboxFailure::Trap(TrapReason::Fuel),
            Trap::Interrupt => SandboxFailure::Trap(TrapReason::Timeout),
            Trap::MemoryOutOfBounds | Trap::TableOutOfBounds => {
                SandboxFailure::Trap(TrapReason::Oom)
            }
            _ => SandboxFailure::Trap(TrapReason::HostDenied),
        };
    }
    // WASI proc_exit with a nonzero code surfaces as I32Exit.
    if let Some(exit) = err.downcast_ref::<wasmtime_wasi::I32Exit>() {
        return SandboxFailure::Internal(format!("artifact exit code {}", exit.0));
    }
    // Instantiation refused by the memory limiter.
    let text = err.to_string();
    if text.contains("memory") && text.contains("limit") {
        return SandboxFailure::Trap(TrapReason::Oom);
    }
    SandboxFailure::Internal(text)
}

fn log_stderr(pipe: &MemoryOutputPipe) {
    let bytes = pipe.contents();
    if bytes.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(&bytes);
    for line in text.lines() {
        tracing::debug!(target: "sandbox::stderr", "{line}");
    }
}
