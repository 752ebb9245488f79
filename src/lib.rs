//! Purpose: Shared library crate behind the `bitseed` CLI and tests.
//! Exports: `core` (host runtime, ABI marshaling, invocation, envelope codec, errors), `api`.
//! Role: Runs deterministic token generators and replays inscribed metadata.
//! Invariants: Generator invocation is a pure function of module bytes and request.
//! Invariants: Nothing here builds, signs, or broadcasts transactions.
#![allow(clippy::result_large_err)]

pub mod api;
pub mod core;
