//! Purpose: Generator abstraction over WASM-backed and fixed-output token generators.
//! Exports: `Generator`, `WasmGenerator`, `StaticGenerator`, `generate_blocking_task`.
//! Role: What minters call to produce records and what verifiers call to re-check them.
//! Invariants: Verification regenerates and compares canonical bytes, never trusts the claim.
use std::sync::Arc;

use tracing::debug;

use super::ApiResult;
use crate::core::error::{Error, ErrorKind};
use crate::core::host::HostRuntime;
use crate::core::invoke::{GeneratorInvoker, InvocationRequest};
use crate::core::record::{OP_MINT, TokenRecord};

pub trait Generator: Send + Sync {
    fn inscribe_generate(&self, request: &InvocationRequest) -> ApiResult<TokenRecord>;

    fn inscribe_verify(
        &self,
        request: &InvocationRequest,
        claimed: &TokenRecord,
    ) -> ApiResult<bool> {
        let regenerated = self.inscribe_generate(request)?;
        let matches = regenerated.to_cbor_bytes()? == claimed.to_cbor_bytes()?;
        if !matches {
            debug!(
                regenerated = regenerated.amount,
                claimed = claimed.amount,
                "claimed record does not match regeneration"
            );
        }
        Ok(matches)
    }
}

#[derive(Clone)]
pub struct WasmGenerator {
    invoker: GeneratorInvoker,
}

impl WasmGenerator {
    pub fn new(bytecode: &[u8]) -> ApiResult<Self> {
        Ok(Self {
            invoker: GeneratorInvoker::from_bytecode(bytecode)?,
        })
    }

    pub fn with_runtime(runtime: HostRuntime, bytecode: &[u8]) -> ApiResult<Self> {
        Ok(Self {
            invoker: GeneratorInvoker::new(runtime, bytecode)?,
        })
    }

    pub fn invoker(&self) -> &GeneratorInvoker {
        &self.invoker
    }
}

impl Generator for WasmGenerator {
    fn inscribe_generate(&self, request: &InvocationRequest) -> ApiResult<TokenRecord> {
        self.invoker.invoke(request)
    }
}

/// Always yields the same record; useful for fixed-supply ticks and tests.
#[derive(Clone, Debug)]
pub struct StaticGenerator {
    record: TokenRecord,
}

impl StaticGenerator {
    pub fn new(record: TokenRecord) -> Self {
        Self { record }
    }
}

impl Generator for StaticGenerator {
    fn inscribe_generate(&self, request: &InvocationRequest) -> ApiResult<TokenRecord> {
        Ok(self.record.clone().with_defaults(OP_MINT, &request.tick))
    }
}

/// Runs one invocation on the blocking pool so async callers never stall their scheduler.
pub async fn generate_blocking_task<G>(
    generator: Arc<G>,
    request: InvocationRequest,
) -> ApiResult<TokenRecord>
where
    G: Generator + ?Sized + 'static,
{
    tokio::task::spawn_blocking(move || generator.inscribe_generate(&request))
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("generator task did not complete")
                .with_source(err)
        })?
}
