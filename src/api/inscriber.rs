//! Purpose: Contract with the external transaction builder that inscribes records on chain.
//! Exports: `Inscriber`, `FundingRequest`, `replay_inscription`.
//! Role: The only seam between generation and transactions; this crate never signs or broadcasts.
//! Invariants: The builder receives `{content_type, content_bytes, meta}` and returns signed bytes.
use tracing::debug;

use super::ApiResult;
use crate::core::envelope::{Envelope, decode_envelope, decode_transaction};
use crate::core::record::{InscriptionRequest, METAPROTOCOL, TokenRecord};

/// Where and how much the builder needs funded before it can inscribe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FundingRequest {
    pub destination_address: String,
    pub required_fee: u64,
}

pub trait Inscriber {
    fn funding_request(&self, request: &InscriptionRequest) -> ApiResult<FundingRequest>;

    /// Returns the signed transaction carrying the envelope.
    fn inscribe(&mut self, request: &InscriptionRequest) -> ApiResult<Vec<u8>>;
}

/// Decodes signed transaction bytes back into the envelope and, when it is ours, the token record.
pub fn replay_inscription(signed_tx: &[u8]) -> ApiResult<Option<(Envelope, Option<TokenRecord>)>> {
    let tx = decode_transaction(signed_tx)?;
    let Some(envelope) = decode_envelope(&tx)? else {
        return Ok(None);
    };
    let record = if envelope.metaprotocol.is_none() || envelope.metaprotocol_is(METAPROTOCOL) {
        TokenRecord::from_envelope(&envelope)
    } else {
        debug!(metaprotocol = ?envelope.metaprotocol, "envelope belongs to another protocol");
        None
    };
    Ok(Some((envelope, record)))
}
