//! Purpose: Define the stable public Rust API boundary for bitseed.
//! Exports: Generator abstractions, inscriber contract, and the core types they exchange.
//! Role: Public, additive-only surface for embedders and the CLI.
//! Invariants: Everything reachable here is deterministic and free of network I/O.

mod generator;
mod inscriber;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::abi::AbiConvention;
pub use crate::core::deploy_args::{DeployArg, DeployArgSpec};
pub use crate::core::envelope::{
    Envelope, decode_envelope, decode_envelope_at, decode_envelope_hex, decode_inscription_meta,
    decode_transaction, decode_transaction_hex,
};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::host::{HostConfig, HostRuntime};
pub use crate::core::invoke::{GeneratorInvoker, InvocationRequest};
pub use crate::core::record::{Content, InscriptionRequest, TokenRecord};
pub use crate::core::seed::{IndexerSeed, InscribeSeed, InscriptionId};
pub use generator::{Generator, StaticGenerator, WasmGenerator, generate_blocking_task};
pub use inscriber::{FundingRequest, Inscriber, replay_inscription};

pub type ApiResult<T> = Result<T, Error>;
