//! Purpose: Instantiate untrusted generator modules with a minimal, deterministic import surface.
//! Exports: `HostConfig`, `HostRuntime`, `GeneratorModule`, `GeneratorInstance`, `HostState`.
//! Role: Owns engine configuration, host memory/table provisioning, and toolchain shims.
//! Invariants: Every instance gets a fresh store; nothing guest-visible survives an instance.
//! Invariants: Linear memory is page aligned and never grows past `HostConfig::max_memory_bytes`.
//! Invariants: Shims never perform real OS I/O; guest text is forwarded to `tracing` only.
//! Notes: A trapped instance is marked faulted and refuses further calls.
use std::error::Error as StdError;
use std::fmt;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use wasmtime::{
    Caller, Config, Engine, Extern, ExternType, Global, Instance, Linker, Memory, MemoryType,
    Module, ResourceLimiter, Store, StoreLimits, StoreLimitsBuilder, Table, Val, ValType,
};

use crate::core::abi::{AbiConvention, GuestExports, Marshaler};
use crate::core::error::{Error, ErrorKind};

pub const WASM_PAGE_SIZE: u64 = 64 * 1024;
pub const MAX_HEAP_BYTES: u64 = 2 * 1024 * 1024 * 1024;
pub const GUEST_LOG_TARGET: &str = "bitseed::guest";

const OVERGROWTH_CAP_BYTES: u64 = 96 * 1024 * 1024;
const MAX_GROW_ATTEMPTS: u32 = 4;
const DEFAULT_MAX_WASM_STACK: usize = 512 * 1024;

// WASI errno values returned by the file-descriptor shims.
const ERRNO_SUCCESS: i32 = 0;
const ERRNO_FAULT: i32 = 21;
const ERRNO_SPIPE: i32 = 70;

#[derive(Clone, Debug)]
pub struct HostConfig {
    pub max_memory_bytes: u64,
    pub nan_canonicalization: bool,
    pub max_wasm_stack: usize,
}

impl HostConfig {
    pub fn new() -> Self {
        Self {
            max_memory_bytes: MAX_HEAP_BYTES,
            nan_canonicalization: true,
            max_wasm_stack: DEFAULT_MAX_WASM_STACK,
        }
    }

    /// Rounded down to a whole page and clamped to `MAX_HEAP_BYTES`.
    pub fn with_max_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    pub fn with_nan_canonicalization(mut self, enabled: bool) -> Self {
        self.nan_canonicalization = enabled;
        self
    }

    pub fn with_max_wasm_stack(mut self, bytes: usize) -> Self {
        self.max_wasm_stack = bytes;
        self
    }

    fn heap_limit(&self) -> u64 {
        let capped = self.max_memory_bytes.min(MAX_HEAP_BYTES);
        (capped / WASM_PAGE_SIZE).max(1) * WASM_PAGE_SIZE
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-store data visible to the import shims.
pub struct HostState {
    memory: Option<Memory>,
    limits: StoreLimits,
    heap_limit: u64,
}

impl HostState {
    fn new(heap_limit: u64) -> Self {
        Self {
            memory: None,
            limits: StoreLimitsBuilder::new()
                .memory_size(heap_limit as usize)
                .build(),
            heap_limit,
        }
    }
}

/// Raised by the noreturn toolchain shims; surfaces as a guest trap.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum GuestFault {
    Abort,
    AssertionFailed(String),
    Exception,
    Exit(i32),
}

impl fmt::Display for GuestFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestFault::Abort => write!(f, "guest called abort"),
            GuestFault::AssertionFailed(message) => write!(f, "guest assertion failed: {message}"),
            GuestFault::Exception => write!(f, "guest threw an uncaught exception"),
            GuestFault::Exit(code) => write!(f, "guest exited with code {code}"),
        }
    }
}

impl StdError for GuestFault {}

#[derive(Clone)]
pub struct HostRuntime {
    engine: Engine,
    config: HostConfig,
}

impl HostRuntime {
    pub fn new(config: HostConfig) -> Result<Self, Error> {
        let mut engine_config = Config::new();
        engine_config
            .cranelift_nan_canonicalization(config.nan_canonicalization)
            .relaxed_simd_deterministic(true)
            .max_wasm_stack(config.max_wasm_stack);
        let engine = Engine::new(&engine_config).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to configure wasm engine")
                .with_boxed_source(err.into())
        })?;
        Ok(Self { engine, config })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn compile(&self, bytecode: &[u8]) -> Result<GeneratorModule, Error> {
        let module = Module::new(&self.engine, bytecode).map_err(|err| {
            Error::new(ErrorKind::Module)
                .with_message("generator bytecode failed to compile")
                .with_boxed_source(err.into())
        })?;
        let digest: [u8; 32] = Sha256::digest(bytecode).into();
        debug!(digest = %hex::encode(digest), len = bytecode.len(), "compiled generator module");
        Ok(GeneratorModule { module, digest })
    }

    /// Fresh instance with its ABI convention probed once, up front.
    pub fn instantiate(&self, module: &GeneratorModule) -> Result<GeneratorInstance, Error> {
        let (mut store, instance) = self.instantiate_raw(module)?;
        let memory = store.data().memory.ok_or_else(|| {
            Error::new(ErrorKind::UnsupportedAbi).with_message("module has no linear memory")
        })?;
        let exports = GuestExports::probe(&mut store, &instance)?;
        debug!(
            digest = %module.digest_hex(),
            convention = ?exports.convention(),
            "instantiated generator"
        );
        Ok(GeneratorInstance {
            store,
            memory,
            exports,
            faulted: false,
        })
    }

    pub(crate) fn instantiate_raw(
        &self,
        module: &GeneratorModule,
    ) -> Result<(Store<HostState>, Instance), Error> {
        let mut store = Store::new(&self.engine, HostState::new(self.config.heap_limit()));
        store.limiter(|state| &mut state.limits as &mut dyn ResourceLimiter);

        for export in module.module.exports() {
            if let ExternType::Memory(ty) = export.ty() {
                host_memory_type(&ty, self.config.heap_limit())?;
            }
        }

        let mut linker = Linker::new(&self.engine);
        link_shims(&mut linker).map_err(link_error)?;
        provide_imports(&mut store, &mut linker, &module.module)?;
        linker
            .define_unknown_imports_as_traps(&module.module)
            .map_err(link_error)?;

        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|err| {
                Error::new(ErrorKind::Module)
                    .with_message("generator module failed to instantiate")
                    .with_boxed_source(err.into())
            })?;

        if store.data().memory.is_none() {
            let exported = instance.get_memory(&mut store, "memory");
            store.data_mut().memory = exported;
        }
        Ok((store, instance))
    }
}

/// Compiled bytecode; cheap to clone and safe to instantiate repeatedly.
#[derive(Clone)]
pub struct GeneratorModule {
    module: Module,
    digest: [u8; 32],
}

impl GeneratorModule {
    pub fn digest(&self) -> [u8; 32] {
        self.digest
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

pub(crate) enum GenerateArgs {
    Strings {
        seed: u32,
        user_input: u32,
        deploy_args: u32,
    },
    Packed(u32),
}

pub struct GeneratorInstance {
    store: Store<HostState>,
    memory: Memory,
    exports: GuestExports,
    faulted: bool,
}

impl GeneratorInstance {
    pub fn convention(&self) -> AbiConvention {
        self.exports.convention()
    }

    pub fn marshaler(&self) -> Marshaler {
        Marshaler::new(self.memory, &self.exports)
    }

    pub fn store(&self) -> &Store<HostState> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store<HostState> {
        &mut self.store
    }

    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub(crate) fn generate(&mut self, args: GenerateArgs) -> Result<u32, Error> {
        if self.faulted {
            return Err(Error::new(ErrorKind::GeneratorExecution)
                .with_message("instance already faulted; instantiate a fresh one"));
        }
        let result = self.exports.call_generate(&mut self.store, args);
        if result.is_err() {
            self.faulted = true;
        }
        result
    }
}

pub(crate) fn execution_error(err: wasmtime::Error) -> Error {
    let message = if let Some(fault) = err.downcast_ref::<GuestFault>() {
        fault.to_string()
    } else if let Some(trap) = err.downcast_ref::<wasmtime::Trap>() {
        format!("guest trapped: {trap}")
    } else {
        format!("guest call failed: {err}")
    };
    Error::new(ErrorKind::GeneratorExecution)
        .with_message(message)
        .with_boxed_source(err.into())
}

fn link_error(err: wasmtime::Error) -> Error {
    Error::new(ErrorKind::Module)
        .with_message("failed to link host imports")
        .with_boxed_source(err.into())
}

/// Plans the target heap size for one growth attempt; `None` means the request can never fit.
pub(crate) fn plan_heap_growth(
    old_size: u64,
    requested: u64,
    heap_limit: u64,
    attempt: u32,
) -> Option<u64> {
    if requested > heap_limit {
        return None;
    }
    let cut_down = 1u64 << attempt;
    let overgrown = old_size
        .saturating_add(old_size / (5 * cut_down))
        .min(requested.saturating_add(OVERGROWTH_CAP_BYTES));
    Some(align_up(requested.max(overgrown), WASM_PAGE_SIZE).min(heap_limit))
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    if let Some(memory) = caller.data().memory {
        return Some(memory);
    }
    caller.get_export("memory").and_then(Extern::into_memory)
}

fn guest_bytes(caller: &mut Caller<'_, HostState>, offset: u32, len: u32) -> Option<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let data = memory.data(&*caller);
    let start = offset as usize;
    let end = start.checked_add(len as usize)?;
    data.get(start..end).map(<[u8]>::to_vec)
}

fn guest_c_string(caller: &mut Caller<'_, HostState>, offset: u32) -> Option<String> {
    let memory = guest_memory(caller)?;
    let data = memory.data(&*caller);
    let tail = data.get(offset as usize..)?;
    let end = tail.iter().position(|byte| *byte == 0)?;
    Some(String::from_utf8_lossy(&tail[..end]).into_owned())
}

fn resize_heap(mut caller: Caller<'_, HostState>, requested: i32) -> i32 {
    let requested = requested as u32 as u64;
    let Some(memory) = guest_memory(&mut caller) else {
        warn!("resize requested without a linear memory");
        return 0;
    };
    let old_size = memory.data_size(&caller) as u64;
    if requested <= old_size {
        return 1;
    }
    let heap_limit = caller.data().heap_limit;
    for attempt in 0..MAX_GROW_ATTEMPTS {
        let Some(target) = plan_heap_growth(old_size, requested, heap_limit, attempt) else {
            debug!(requested, heap_limit, "heap resize exceeds limit");
            return 0;
        };
        let delta_pages = (target - old_size) / WASM_PAGE_SIZE;
        match memory.grow(&mut caller, delta_pages) {
            Ok(_) => {
                debug!(old_size, requested, target, attempt, "grew guest heap");
                return 1;
            }
            Err(err) => debug!(target, attempt, error = %err, "heap grow attempt failed"),
        }
    }
    0
}

fn log_string(mut caller: Caller<'_, HostState>, offset: i32, length: i32) {
    match guest_bytes(&mut caller, offset as u32, length as u32) {
        Some(bytes) => info!(target: GUEST_LOG_TARGET, "{}", String::from_utf8_lossy(&bytes)),
        None => warn!(target: GUEST_LOG_TARGET, offset, length, "log_string out of bounds"),
    }
}

fn fd_write(mut caller: Caller<'_, HostState>, fd: i32, iov: i32, iovcnt: i32, pnum: i32) -> i32 {
    let Some(memory) = guest_memory(&mut caller) else {
        return ERRNO_FAULT;
    };
    let mut text = Vec::new();
    let mut written: u32 = 0;
    {
        let data = memory.data(&caller);
        for index in 0..iovcnt.max(0) as usize {
            let entry = iov as u32 as usize + index * 8;
            let (Some(ptr), Some(len)) = (read_u32_le(data, entry), read_u32_le(data, entry + 4))
            else {
                return ERRNO_FAULT;
            };
            let start = ptr as usize;
            let Some(chunk) = data.get(start..start + len as usize) else {
                return ERRNO_FAULT;
            };
            text.extend_from_slice(chunk);
            written = written.wrapping_add(len);
        }
    }
    if !text.is_empty() {
        let line = String::from_utf8_lossy(&text);
        info!(target: GUEST_LOG_TARGET, fd, "{}", line.trim_end_matches('\n'));
    }
    if memory
        .write(&mut caller, pnum as u32 as usize, &written.to_le_bytes())
        .is_err()
    {
        return ERRNO_FAULT;
    }
    ERRNO_SUCCESS
}

fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn memcpy(mut caller: Caller<'_, HostState>, dest: i32, src: i32, num: i32) -> wasmtime::Result<()> {
    let memory = guest_memory(&mut caller)
        .ok_or_else(|| wasmtime::Error::msg("memcpy without a linear memory"))?;
    let (dest, src, num) = (dest as u32 as usize, src as u32 as usize, num as u32 as usize);
    let data = memory.data_mut(&mut caller);
    let in_bounds = src
        .checked_add(num)
        .zip(dest.checked_add(num))
        .is_some_and(|(src_end, dest_end)| src_end <= data.len() && dest_end <= data.len());
    if !in_bounds {
        return Err(wasmtime::Error::new(wasmtime::Trap::MemoryOutOfBounds));
    }
    data.copy_within(src..src + num, dest);
    Ok(())
}

fn link_shims(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap("env", "log_string", log_string)?;
    linker.func_wrap("env", "emscripten_resize_heap", resize_heap)?;
    linker.func_wrap("env", "emscripten_memcpy_big", memcpy)?;
    linker.func_wrap("env", "emscripten_memcpy_js", memcpy)?;
    linker.func_wrap("env", "abort", |_caller: Caller<'_, HostState>| -> wasmtime::Result<()> {
        warn!(target: GUEST_LOG_TARGET, "abort");
        Err(wasmtime::Error::new(GuestFault::Abort))
    })?;
    linker.func_wrap(
        "env",
        "__assert_fail",
        |mut caller: Caller<'_, HostState>,
         condition: i32,
         file: i32,
         line: i32,
         function: i32|
         -> wasmtime::Result<()> {
            let condition = guest_c_string(&mut caller, condition as u32).unwrap_or_default();
            let file = guest_c_string(&mut caller, file as u32).unwrap_or_default();
            let function = guest_c_string(&mut caller, function as u32).unwrap_or_default();
            let message = format!("{condition} at {file}:{line} in {function}");
            warn!(target: GUEST_LOG_TARGET, "{message}");
            Err(wasmtime::Error::new(GuestFault::AssertionFailed(message)))
        },
    )?;
    linker.func_wrap(
        "env",
        "__cxa_throw",
        |_caller: Caller<'_, HostState>, _ptr: i32, _ty: i32, _dtor: i32| -> wasmtime::Result<()> {
            Err(wasmtime::Error::new(GuestFault::Exception))
        },
    )?;
    linker.func_wrap("wasi_snapshot_preview1", "fd_write", fd_write)?;
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "fd_close",
        |_caller: Caller<'_, HostState>, _fd: i32| -> i32 { ERRNO_SUCCESS },
    )?;
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "proc_exit",
        |_caller: Caller<'_, HostState>, code: i32| -> wasmtime::Result<()> {
            warn!(target: GUEST_LOG_TARGET, code, "proc_exit");
            Err(wasmtime::Error::new(GuestFault::Exit(code)))
        },
    )?;
    Ok(())
}

/// Provisions memory, table, and global imports the module declares, plus the `fd_seek`
/// variant matching its declared signature.
fn provide_imports(
    store: &mut Store<HostState>,
    linker: &mut Linker<HostState>,
    module: &Module,
) -> Result<(), Error> {
    let heap_limit = store.data().heap_limit;
    for import in module.imports() {
        let (module_name, name) = (import.module(), import.name());
        match import.ty() {
            ExternType::Memory(ty) => {
                let memory = Memory::new(&mut *store, host_memory_type(&ty, heap_limit)?)
                    .map_err(|err| {
                        Error::new(ErrorKind::OutOfMemory)
                            .with_message("failed to allocate host linear memory")
                            .with_boxed_source(err.into())
                    })?;
                store.data_mut().memory = Some(memory);
                linker
                    .define(&*store, module_name, name, memory)
                    .map_err(link_error)?;
            }
            ExternType::Table(ty) => {
                let table = Table::new(&mut *store, ty.clone(), wasmtime::Ref::Func(None))
                    .map_err(link_error)?;
                linker
                    .define(&*store, module_name, name, table)
                    .map_err(link_error)?;
            }
            ExternType::Global(ty) if matches!(ty.content(), ValType::I32) => {
                // memoryBase / tableBase style relocation globals.
                let global = Global::new(&mut *store, ty.clone(), Val::I32(0)).map_err(link_error)?;
                linker
                    .define(&*store, module_name, name, global)
                    .map_err(link_error)?;
            }
            ExternType::Func(ty) if name == "fd_seek" => {
                if ty.params().len() == 4 {
                    linker
                        .func_wrap(
                            module_name,
                            name,
                            |_caller: Caller<'_, HostState>, _fd: i32, _offset: i64, _whence: i32, _out: i32| -> i32 {
                                ERRNO_SPIPE
                            },
                        )
                        .map_err(link_error)?;
                } else {
                    linker
                        .func_wrap(
                            module_name,
                            name,
                            |_caller: Caller<'_, HostState>, _fd: i32, _lo: i32, _hi: i32, _whence: i32, _out: i32| -> i32 {
                                ERRNO_SPIPE
                            },
                        )
                        .map_err(link_error)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn host_memory_type(declared: &MemoryType, heap_limit: u64) -> Result<MemoryType, Error> {
    if declared.is_64() || declared.is_shared() {
        return Err(Error::new(ErrorKind::Module)
            .with_message("only unshared 32-bit linear memories are supported"));
    }
    let limit_pages = heap_limit / WASM_PAGE_SIZE;
    let minimum = declared.minimum();
    if minimum > limit_pages {
        return Err(Error::new(ErrorKind::OutOfMemory)
            .with_message("declared initial memory exceeds the host limit"));
    }
    let maximum = declared
        .maximum()
        .map_or(limit_pages, |max| max.min(limit_pages))
        .max(minimum);
    Ok(MemoryType::new(minimum as u32, Some(maximum as u32)))
}
