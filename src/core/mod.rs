// Core modules: guest hosting and marshaling, generator invocation, and envelope decoding.
pub mod abi;
pub mod deploy_args;
pub mod envelope;
pub mod error;
pub mod host;
pub mod invoke;
pub mod record;
pub mod script;
pub mod seed;
