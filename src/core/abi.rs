//! Purpose: Move strings and binary buffers across the host/guest linear-memory boundary.
//! Exports: `AbiConvention`, `GuestExports`, `Marshaler`.
//! Role: Hides which allocation convention a generator was built with.
//! Invariants: Strings are written NUL-terminated; binary buffers carry a 4-byte big-endian length.
//! Invariants: Every pointer handed back to the caller lies fully inside linear memory.
//! Invariants: `release` undoes all allocations of one marshaler exactly once.
use tracing::debug;
use wasmtime::{Instance, Memory, Store, TypedFunc, WasmParams, WasmResults};

use crate::core::error::{Error, ErrorKind};
use crate::core::host::{GenerateArgs, HostState, execution_error};

pub const EXPORT_MALLOC: &str = "malloc";
pub const EXPORT_FREE: &str = "free";
pub const EXPORT_STACK_ALLOC: &str = "stackAlloc";
pub const EXPORT_STACK_SAVE: &str = "stackSave";
pub const EXPORT_STACK_RESTORE: &str = "stackRestore";
pub const EXPORT_GENERATE: &str = "inscribe_generate";
pub const LENGTH_PREFIX_LEN: usize = 4;

/// How a generator expects host-provided buffers to be allocated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AbiConvention {
    /// `malloc`/`free`; inputs are NUL-terminated strings.
    AllocFree,
    /// `stackAlloc`/`stackSave`/`stackRestore`; one length-prefixed CBOR input.
    StackScoped,
}

#[derive(Clone)]
enum Allocator {
    AllocFree {
        malloc: TypedFunc<i32, i32>,
        free: TypedFunc<i32, ()>,
    },
    StackScoped {
        alloc: TypedFunc<i32, i32>,
        save: TypedFunc<(), i32>,
        restore: TypedFunc<i32, ()>,
    },
}

#[derive(Clone)]
enum Entrypoint {
    Strings(TypedFunc<(i32, i32, i32), i32>),
    Packed(TypedFunc<i32, i32>),
}

/// Typed handles to the guest exports, resolved once per instance.
#[derive(Clone)]
pub struct GuestExports {
    allocator: Allocator,
    entry: Entrypoint,
}

impl GuestExports {
    /// Stack exports win when a module carries both sets.
    pub(crate) fn probe(store: &mut Store<HostState>, instance: &Instance) -> Result<Self, Error> {
        let mut has = |name: &str| instance.get_func(&mut *store, name).is_some();
        let stack_scoped = [EXPORT_STACK_ALLOC, EXPORT_STACK_SAVE, EXPORT_STACK_RESTORE]
            .into_iter()
            .all(&mut has);
        let alloc_free = !stack_scoped && has(EXPORT_MALLOC) && has(EXPORT_FREE);

        let exports = if stack_scoped {
            Self {
                allocator: Allocator::StackScoped {
                    alloc: typed_export(store, instance, EXPORT_STACK_ALLOC)?,
                    save: typed_export(store, instance, EXPORT_STACK_SAVE)?,
                    restore: typed_export(store, instance, EXPORT_STACK_RESTORE)?,
                },
                entry: Entrypoint::Packed(typed_export(store, instance, EXPORT_GENERATE)?),
            }
        } else if alloc_free {
            Self {
                allocator: Allocator::AllocFree {
                    malloc: typed_export(store, instance, EXPORT_MALLOC)?,
                    free: typed_export(store, instance, EXPORT_FREE)?,
                },
                entry: Entrypoint::Strings(typed_export(store, instance, EXPORT_GENERATE)?),
            }
        } else {
            return Err(Error::new(ErrorKind::UnsupportedAbi)
                .with_message("module exports neither malloc/free nor stackAlloc/stackSave/stackRestore"));
        };
        Ok(exports)
    }

    pub fn convention(&self) -> AbiConvention {
        match self.allocator {
            Allocator::AllocFree { .. } => AbiConvention::AllocFree,
            Allocator::StackScoped { .. } => AbiConvention::StackScoped,
        }
    }

    pub(crate) fn call_generate(
        &self,
        store: &mut Store<HostState>,
        args: GenerateArgs,
    ) -> Result<u32, Error> {
        let ptr = match (&self.entry, args) {
            (
                Entrypoint::Strings(func),
                GenerateArgs::Strings {
                    seed,
                    user_input,
                    deploy_args,
                },
            ) => func.call(store, (seed as i32, user_input as i32, deploy_args as i32)),
            (Entrypoint::Packed(func), GenerateArgs::Packed(input)) => func.call(store, input as i32),
            _ => {
                return Err(Error::new(ErrorKind::Internal)
                    .with_message("arguments do not match the probed convention"));
            }
        }
        .map_err(execution_error)?;
        Ok(ptr as u32)
    }
}

fn typed_export<P, R>(
    store: &mut Store<HostState>,
    instance: &Instance,
    name: &str,
) -> Result<TypedFunc<P, R>, Error>
where
    P: WasmParams,
    R: WasmResults,
{
    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map_err(|err| {
            Error::new(ErrorKind::UnsupportedAbi)
                .with_message(format!("export `{name}` is missing or has the wrong signature"))
                .with_boxed_source(err.into())
        })
}

/// Allocation scope for one generator call.
pub struct Marshaler {
    memory: Memory,
    allocator: Allocator,
    checkpoint: Option<i32>,
    live: Vec<i32>,
}

impl Marshaler {
    pub(crate) fn new(memory: Memory, exports: &GuestExports) -> Self {
        Self {
            memory,
            allocator: exports.allocator.clone(),
            checkpoint: None,
            live: Vec::new(),
        }
    }

    pub fn convention(&self) -> AbiConvention {
        match self.allocator {
            Allocator::AllocFree { .. } => AbiConvention::AllocFree,
            Allocator::StackScoped { .. } => AbiConvention::StackScoped,
        }
    }

    pub fn put_str(&mut self, store: &mut Store<HostState>, value: &str) -> Result<u32, Error> {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        let ptr = self.reserve(store, bytes.len())?;
        self.write(store, ptr, &bytes)?;
        Ok(ptr)
    }

    pub fn put_bytes(&mut self, store: &mut Store<HostState>, value: &[u8]) -> Result<u32, Error> {
        let len = u32::try_from(value.len()).map_err(|_| out_of_memory(value.len()))?;
        let mut framed = Vec::with_capacity(LENGTH_PREFIX_LEN + value.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(value);
        let ptr = self.reserve(store, framed.len())?;
        self.write(store, ptr, &framed)?;
        Ok(ptr)
    }

    pub fn read_cstr(&self, store: &Store<HostState>, ptr: u32) -> Result<Vec<u8>, Error> {
        let data = self.memory.data(store);
        let start = ptr as usize;
        let tail = data.get(start..).filter(|tail| !tail.is_empty()).ok_or_else(|| {
            Error::new(ErrorKind::MemoryDecode)
                .with_message("result pointer is outside linear memory")
                .with_offset(ptr as u64)
        })?;
        match tail.iter().position(|byte| *byte == 0) {
            Some(end) => Ok(tail[..end].to_vec()),
            None => Err(Error::new(ErrorKind::MemoryDecode)
                .with_message("string is not terminated before the end of linear memory")
                .with_offset(ptr as u64)),
        }
    }

    pub fn read_prefixed(&self, store: &Store<HostState>, ptr: u32) -> Result<Vec<u8>, Error> {
        let data = self.memory.data(store);
        let start = ptr as usize;
        let prefix = data.get(start..start + LENGTH_PREFIX_LEN).ok_or_else(|| {
            Error::new(ErrorKind::MemoryDecode)
                .with_message("length prefix is outside linear memory")
                .with_offset(ptr as u64)
        })?;
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let body = start + LENGTH_PREFIX_LEN;
        data.get(body..body + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                Error::new(ErrorKind::MemoryDecode)
                    .with_message(format!("declared length {len} overruns linear memory"))
                    .with_offset(ptr as u64)
            })
    }

    /// Frees in reverse allocation order, or restores the saved stack pointer.
    pub fn release(self, store: &mut Store<HostState>) -> Result<(), Error> {
        match &self.allocator {
            Allocator::AllocFree { free, .. } => {
                for ptr in self.live.iter().rev() {
                    free.call(&mut *store, *ptr).map_err(execution_error)?;
                }
            }
            Allocator::StackScoped { restore, .. } => {
                if let Some(checkpoint) = self.checkpoint {
                    restore
                        .call(&mut *store, checkpoint)
                        .map_err(execution_error)?;
                }
            }
        }
        Ok(())
    }

    fn reserve(&mut self, store: &mut Store<HostState>, len: usize) -> Result<u32, Error> {
        let request = i32::try_from(len).map_err(|_| out_of_memory(len))?;
        let ptr: i32 = match &self.allocator {
            Allocator::AllocFree { malloc, .. } => {
                let ptr = malloc
                    .call(&mut *store, request)
                    .map_err(|err| out_of_memory(len).with_boxed_source(err.into()))?;
                if ptr == 0 {
                    return Err(out_of_memory(len));
                }
                self.live.push(ptr);
                ptr
            }
            Allocator::StackScoped { alloc, save, .. } => {
                if self.checkpoint.is_none() {
                    let checkpoint = save.call(&mut *store, ()).map_err(execution_error)?;
                    self.checkpoint = Some(checkpoint);
                }
                alloc
                    .call(&mut *store, request)
                    .map_err(|err| out_of_memory(len).with_boxed_source(err.into()))?
            }
        };
        let ptr = ptr as u32;

        let end = ptr as u64 + len as u64;
        if end > self.memory.data_size(&*store) as u64 {
            return Err(out_of_memory(len).with_offset(ptr as u64));
        }
        debug!(ptr, len, "reserved guest buffer");
        Ok(ptr)
    }

    fn write(&self, store: &mut Store<HostState>, ptr: u32, bytes: &[u8]) -> Result<(), Error> {
        self.memory
            .write(&mut *store, ptr as usize, bytes)
            .map_err(|err| out_of_memory(bytes.len()).with_offset(ptr as u64).with_source(err))
    }
}

fn out_of_memory(len: usize) -> Error {
    Error::new(ErrorKind::OutOfMemory)
        .with_message(format!("guest could not provide a {len}-byte buffer"))
}
