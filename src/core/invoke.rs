//! Purpose: Run one deterministic generator call from request to decoded token record.
//! Exports: `InvocationRequest`, `GeneratorInvoker`.
//! Role: Glues the host runtime, ABI marshaler, and output decoding together.
//! Invariants: Every call instantiates a fresh instance; nothing carries over between calls.
//! Invariants: Identical module bytes and request produce an identical `TokenRecord`.
//! Invariants: Failures are never retried; the same inputs would fail the same way.
use ciborium::Value as CborValue;
use tracing::debug;

use crate::core::abi::{AbiConvention, Marshaler};
use crate::core::deploy_args::{self, DeployArg};
use crate::core::error::{Error, ErrorKind};
use crate::core::host::{GenerateArgs, GeneratorInstance, GeneratorModule, HostConfig, HostRuntime};
use crate::core::record::{OP_MINT, TokenRecord};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InvocationRequest {
    pub deploy_args: Vec<DeployArg>,
    pub seed: String,
    pub user_input: String,
    /// Filled into the record when the generator leaves `tick` empty.
    pub tick: String,
}

impl InvocationRequest {
    pub fn new(
        deploy_args: Vec<DeployArg>,
        seed: impl Into<String>,
        user_input: impl Into<String>,
    ) -> Self {
        Self {
            deploy_args,
            seed: seed.into(),
            user_input: user_input.into(),
            tick: String::new(),
        }
    }

    pub fn from_json_args<S: AsRef<str>>(
        deploy_args: &[S],
        seed: impl Into<String>,
        user_input: impl Into<String>,
    ) -> Result<Self, Error> {
        Ok(Self::new(deploy_args::parse_all(deploy_args)?, seed, user_input))
    }

    pub fn with_tick(mut self, tick: impl Into<String>) -> Self {
        self.tick = tick.into();
        self
    }

    /// Stack-convention input: CBOR map of `attrs` (deploy-arg CBOR as byte ints), `seed`, `user_input`.
    fn pack(&self) -> Result<Vec<u8>, Error> {
        let attrs = deploy_args::to_cbor(&self.deploy_args)?
            .into_iter()
            .map(|byte| CborValue::Integer(byte.into()))
            .collect();
        let packed = CborValue::Map(vec![
            (CborValue::Text("attrs".to_string()), CborValue::Array(attrs)),
            (
                CborValue::Text("seed".to_string()),
                CborValue::Text(self.seed.clone()),
            ),
            (
                CborValue::Text("user_input".to_string()),
                CborValue::Text(self.user_input.clone()),
            ),
        ]);
        let mut buffer = Vec::new();
        ciborium::into_writer(&packed, &mut buffer).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode generator input")
                .with_source(err)
        })?;
        Ok(buffer)
    }
}

/// Compiled generator ready to be invoked any number of times.
#[derive(Clone)]
pub struct GeneratorInvoker {
    runtime: HostRuntime,
    module: GeneratorModule,
}

impl GeneratorInvoker {
    pub fn new(runtime: HostRuntime, bytecode: &[u8]) -> Result<Self, Error> {
        let module = runtime.compile(bytecode)?;
        Ok(Self { runtime, module })
    }

    pub fn from_bytecode(bytecode: &[u8]) -> Result<Self, Error> {
        Self::new(HostRuntime::new(HostConfig::default())?, bytecode)
    }

    pub fn module(&self) -> &GeneratorModule {
        &self.module
    }

    pub fn runtime(&self) -> &HostRuntime {
        &self.runtime
    }

    pub fn invoke(&self, request: &InvocationRequest) -> Result<TokenRecord, Error> {
        let mut instance = self.runtime.instantiate(&self.module)?;
        let convention = instance.convention();
        debug!(
            digest = %self.module.digest_hex(),
            ?convention,
            seed = %request.seed,
            args = request.deploy_args.len(),
            "invoking generator"
        );

        let mut marshaler = instance.marshaler();
        let outcome = call_guest(&mut instance, &mut marshaler, request);
        // A trapped instance is discarded whole; its allocations go with it.
        let released = if instance.is_faulted() {
            Ok(())
        } else {
            marshaler.release(instance.store_mut())
        };
        let raw = outcome?;
        released?;

        let record = match convention {
            AbiConvention::AllocFree => TokenRecord::from_json_output(&raw)?,
            AbiConvention::StackScoped => TokenRecord::from_cbor_output(&raw)?,
        }
        .with_defaults(OP_MINT, &request.tick);
        debug!(amount = record.amount, has_content = record.content.is_some(), "generator finished");
        Ok(record)
    }
}

fn call_guest(
    instance: &mut GeneratorInstance,
    marshaler: &mut Marshaler,
    request: &InvocationRequest,
) -> Result<Vec<u8>, Error> {
    match marshaler.convention() {
        AbiConvention::AllocFree => {
            let deploy_args = deploy_args::to_json_string(&request.deploy_args);
            let seed = marshaler.put_str(instance.store_mut(), &request.seed)?;
            let user_input = marshaler.put_str(instance.store_mut(), &request.user_input)?;
            let deploy_args = marshaler.put_str(instance.store_mut(), &deploy_args)?;
            let ptr = instance.generate(GenerateArgs::Strings {
                seed,
                user_input,
                deploy_args,
            })?;
            check_result_ptr(ptr)?;
            marshaler.read_cstr(instance.store(), ptr)
        }
        AbiConvention::StackScoped => {
            let packed = request.pack()?;
            let input = marshaler.put_bytes(instance.store_mut(), &packed)?;
            let ptr = instance.generate(GenerateArgs::Packed(input))?;
            check_result_ptr(ptr)?;
            marshaler.read_prefixed(instance.store(), ptr)
        }
    }
}

fn check_result_ptr(ptr: u32) -> Result<(), Error> {
    if ptr == 0 {
        return Err(Error::new(ErrorKind::MemoryDecode)
            .with_message("generator returned a null result pointer")
            .with_offset(0));
    }
    Ok(())
}
