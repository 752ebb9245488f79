//! Purpose: Decode inscription envelopes from signed transaction witness data.
//! Exports: `Envelope`, `decode_transaction`, `decode_transaction_hex`, `decode_envelope`,
//! `decode_envelope_at`, `decode_inscription_meta`, `locate_envelope`, `envelope_metadata`.
//! Role: Read-only replay of inscribed content and metadata without an indexer.
//! Invariants: The search is always bounded by the push-false start and the ENDIF end marker.
//! Invariants: No envelope, no metadata tag, or unparseable metadata is `None`, never an error.
//! Invariants: Only an unparseable transaction or a non-decompilable witness script is an error.
//! Notes: First match wins: inputs in order, then witness elements in order.
use bitcoin::Transaction;
use ciborium::Value as CborValue;
use tracing::{debug, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::script::{self, OP_0, OP_ENDIF, OP_IF, ScriptItem};

pub const PROTOCOL_ID: &[u8; 3] = b"ord";
pub const ENVELOPE_START: u8 = OP_0;
pub const ENVELOPE_END: u8 = OP_ENDIF;
pub const BODY_SEPARATOR: u8 = OP_0;
pub const TAG_CONTENT_TYPE: u8 = 1;
pub const TAG_METADATA: u8 = 5;
pub const TAG_METAPROTOCOL: u8 = 7;
pub const TAG_CONTENT_ENCODING: u8 = 9;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub input: usize,
    pub witness_index: usize,
    /// Items after the start marker, end marker inclusive.
    pub items: Vec<ScriptItem>,
    pub protocol: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub metaprotocol: Option<String>,
    pub metadata: Option<CborValue>,
    pub body: Option<Vec<u8>>,
}

impl Envelope {
    pub fn from_items(input: usize, witness_index: usize, items: &[ScriptItem]) -> Option<Self> {
        let items = locate_envelope(items)?;
        let (protocol, fields) = split_protocol(items);
        let fields = Fields::read(fields);
        let text = |tag| {
            fields
                .first(tag)
                .map(|value| String::from_utf8_lossy(value).into_owned())
        };
        Some(Envelope {
            input,
            witness_index,
            items: items.to_vec(),
            protocol,
            content_type: text(TAG_CONTENT_TYPE),
            content_encoding: text(TAG_CONTENT_ENCODING),
            metaprotocol: text(TAG_METAPROTOCOL),
            metadata: fields.metadata.as_deref().and_then(decode_metadata),
            body: fields.body,
        })
    }

    pub fn metaprotocol_is(&self, name: &str) -> bool {
        self.metaprotocol.as_deref() == Some(name)
    }

    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(self.body.as_deref()?).ok()
    }
}

/// Tag/value pairs before the body separator, the reassembled metadata, and the body.
#[derive(Debug, Default)]
struct Fields {
    tagged: Vec<(u8, Vec<u8>)>,
    metadata: Option<Vec<u8>>,
    body: Option<Vec<u8>>,
}

impl Fields {
    /// Fields are read by position: a tag, then its value. A value keeps its bytes even
    /// when a minimal push folded it into a small-number opcode.
    fn read(items: &[ScriptItem]) -> Self {
        let mut fields = Fields::default();
        let mut index = 0;
        let mut previous_tag = None;
        while let Some(item) = items.get(index) {
            if item.is_op(ENVELOPE_END) {
                break;
            }
            if item.is_op(BODY_SEPARATOR) {
                let body = items[index + 1..]
                    .iter()
                    .take_while(|item| !item.is_op(ENVELOPE_END))
                    .filter_map(ScriptItem::data)
                    .flatten()
                    .collect();
                fields.body = Some(body);
                break;
            }
            // Extra multi-byte pushes where a tag belongs continue the metadata value.
            if let (Some(TAG_METADATA), Some(chunk)) = (previous_tag, item.as_push()) {
                if chunk.len() > 1 {
                    fields.metadata.get_or_insert_with(Vec::new).extend_from_slice(chunk);
                    index += 1;
                    continue;
                }
            }
            let Some(tag) = field_tag(item) else {
                previous_tag = None;
                index += 1;
                continue;
            };
            let Some(value) = items
                .get(index + 1)
                .filter(|value| !value.is_op(ENVELOPE_END))
                .and_then(ScriptItem::data)
            else {
                break;
            };
            if tag == TAG_METADATA {
                fields.metadata.get_or_insert_with(Vec::new).extend_from_slice(&value);
            }
            fields.tagged.push((tag, value));
            previous_tag = Some(tag);
            index += 2;
        }
        fields
    }

    fn first(&self, tag: u8) -> Option<&[u8]> {
        self.tagged
            .iter()
            .find(|(candidate, _)| *candidate == tag)
            .map(|(_, value)| value.as_slice())
    }
}

/// One-byte tag, whether pushed as data or folded into a small-number opcode.
fn field_tag(item: &ScriptItem) -> Option<u8> {
    match item.data()?.as_slice() {
        [tag] => Some(*tag),
        _ => None,
    }
}

/// Splits off the leading `OP_IF` and protocol-id push, when present.
fn split_protocol(envelope: &[ScriptItem]) -> (Option<Vec<u8>>, &[ScriptItem]) {
    let rest = match envelope {
        [first, rest @ ..] if first.is_op(OP_IF) => rest,
        _ => envelope,
    };
    match rest {
        [ScriptItem::Push(id), fields @ ..] if id.as_slice() == PROTOCOL_ID => {
            (Some(id.clone()), fields)
        }
        _ => (None, rest),
    }
}

/// Everything strictly after the first start marker, up to and including the first end marker.
pub fn locate_envelope(items: &[ScriptItem]) -> Option<&[ScriptItem]> {
    let mut start = None;
    for (index, item) in items.iter().enumerate() {
        if start.is_none() && item.is_op(ENVELOPE_START) {
            start = Some(index);
            continue;
        }
        if item.is_op(ENVELOPE_END) {
            return start.map(|start| &items[start + 1..=index]);
        }
    }
    None
}

/// Metadata values of an envelope, concatenated in order and CBOR-decoded.
///
/// Chunks introduced by a repeated metadata tag, or pushed back to back after one tag,
/// are appended.
pub fn envelope_metadata(envelope: &[ScriptItem]) -> Option<CborValue> {
    let (_, fields) = split_protocol(envelope);
    decode_metadata(&Fields::read(fields).metadata?)
}

fn decode_metadata(payload: &[u8]) -> Option<CborValue> {
    match ciborium::from_reader::<CborValue, _>(payload) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(len = payload.len(), error = %err, "envelope metadata is not valid CBOR");
            None
        }
    }
}

pub fn decode_transaction_hex(tx_hex: &str) -> Result<Transaction, Error> {
    let bytes = hex::decode(tx_hex.trim()).map_err(|err| {
        Error::new(ErrorKind::EnvelopeDecode)
            .with_message("transaction is not valid hex")
            .with_hint("Pass the raw signed transaction as a hex string.")
            .with_source(err)
    })?;
    decode_transaction(&bytes)
}

pub fn decode_transaction(bytes: &[u8]) -> Result<Transaction, Error> {
    bitcoin::consensus::deserialize(bytes).map_err(|err| {
        Error::new(ErrorKind::EnvelopeDecode)
            .with_message("bytes do not parse as a transaction")
            .with_raw(bytes)
            .with_source(err)
    })
}

/// First envelope across all inputs.
pub fn decode_envelope(tx: &Transaction) -> Result<Option<Envelope>, Error> {
    for input in 0..tx.input.len() {
        if let Some(envelope) = decode_envelope_at(tx, input)? {
            return Ok(Some(envelope));
        }
    }
    Ok(None)
}

pub fn decode_envelope_hex(tx_hex: &str) -> Result<Option<Envelope>, Error> {
    decode_envelope(&decode_transaction_hex(tx_hex)?)
}

/// First envelope in one input's witness; an out-of-range input has none.
pub fn decode_envelope_at(tx: &Transaction, input: usize) -> Result<Option<Envelope>, Error> {
    let Some(txin) = tx.input.get(input) else {
        return Ok(None);
    };
    for (witness_index, element) in txin.witness.iter().enumerate() {
        if !element.windows(PROTOCOL_ID.len()).any(|window| window == PROTOCOL_ID) {
            continue;
        }
        let items = script::decompile(element).map_err(|err| {
            err.with_hint(format!("input {input}, witness element {witness_index}"))
        })?;
        match Envelope::from_items(input, witness_index, &items) {
            Some(envelope) => {
                debug!(input, witness_index, items = envelope.items.len(), "found envelope");
                return Ok(Some(envelope));
            }
            None => debug!(input, witness_index, "protocol marker without envelope"),
        }
    }
    Ok(None)
}

/// Metadata of the envelope in one input of a signed transaction.
pub fn decode_inscription_meta(tx_hex: &str, input: usize) -> Result<Option<CborValue>, Error> {
    let tx = decode_transaction_hex(tx_hex)?;
    Ok(decode_envelope_at(&tx, input)?.and_then(|envelope| envelope.metadata))
}

#[cfg(test)]
mod tests {
    use ciborium::Value as CborValue;

    use super::{Envelope, envelope_metadata, locate_envelope};
    use crate::core::script::{OP_0, OP_ENDIF, OP_IF, ScriptItem};

    fn push(bytes: &[u8]) -> ScriptItem {
        ScriptItem::Push(bytes.to_vec())
    }

    fn cbor(value: &CborValue) -> Vec<u8> {
        let mut buffer = Vec::new();
        ciborium::into_writer(value, &mut buffer).expect("encode");
        buffer
    }

    #[test]
    fn envelope_bounds() {
        let items = vec![
            push(b"sig"),
            ScriptItem::Op(OP_0),
            ScriptItem::Op(OP_IF),
            push(b"ord"),
            ScriptItem::Op(OP_ENDIF),
            ScriptItem::Op(OP_ENDIF),
        ];
        let envelope = locate_envelope(&items).expect("envelope");
        assert_eq!(envelope.len(), 3);
        assert_eq!(envelope.last(), Some(&ScriptItem::Op(OP_ENDIF)));

        let end_first = vec![ScriptItem::Op(OP_ENDIF), ScriptItem::Op(OP_0)];
        assert!(locate_envelope(&end_first).is_none());
        let unterminated = vec![ScriptItem::Op(OP_0), ScriptItem::Op(OP_IF), push(b"ord")];
        assert!(locate_envelope(&unterminated).is_none());
    }

    #[test]
    fn metadata_is_soft() {
        let meta = cbor(&CborValue::Map(vec![(
            CborValue::Text("tick".to_string()),
            CborValue::Text("x".to_string()),
        )]));
        let (head, tail) = meta.split_at(3);
        let chunked = vec![
            ScriptItem::Op(0x55),
            push(head),
            ScriptItem::Op(0x55),
            push(tail),
            ScriptItem::Op(OP_0),
        ];
        let value = envelope_metadata(&chunked).expect("metadata");
        assert_eq!(value.as_map().map(Vec::len), Some(1));

        assert!(envelope_metadata(&[push(&meta)]).is_none());
        assert!(envelope_metadata(&[ScriptItem::Op(0x55), push(&[0xff, 0xff])]).is_none());
        assert!(envelope_metadata(&[ScriptItem::Op(0x55), ScriptItem::Op(OP_ENDIF)]).is_none());
    }

    #[test]
    fn metadata_keeps_folded_single_byte_values() {
        // CBOR integer 7 is the lone byte 0x07, which a minimal push encodes as OP_7.
        let folded = vec![ScriptItem::Op(0x55), ScriptItem::Op(0x57), ScriptItem::Op(OP_ENDIF)];
        assert_eq!(envelope_metadata(&folded), Some(CborValue::Integer(7.into())));

        let meta = cbor(&CborValue::Array(vec![
            CborValue::Text("t".repeat(30)),
            CborValue::Integer(9.into()),
        ]));
        let (head, last) = meta.split_at(meta.len() - 1);
        assert_eq!(last, [0x09]);
        let split = vec![
            ScriptItem::Op(OP_0),
            ScriptItem::Op(OP_IF),
            push(b"ord"),
            ScriptItem::Op(0x55),
            push(head),
            ScriptItem::Op(0x55),
            ScriptItem::Op(0x59),
            ScriptItem::Op(OP_0),
            push(b"body"),
            ScriptItem::Op(OP_ENDIF),
        ];
        let envelope = Envelope::from_items(0, 0, &split).expect("envelope");
        assert_eq!(envelope.metadata.clone().map(|value| cbor(&value)), Some(meta));
        assert_eq!(envelope.body_text(), Some("body"));
    }

    #[test]
    fn metadata_continues_over_untagged_pushes() {
        let meta = cbor(&CborValue::Text("m".repeat(40)));
        let (head, tail) = meta.split_at(20);
        let items = vec![ScriptItem::Op(0x55), push(head), push(tail), ScriptItem::Op(OP_ENDIF)];
        assert_eq!(envelope_metadata(&items), Some(CborValue::Text("m".repeat(40))));
    }

    #[test]
    fn reads_tagged_fields_and_body() {
        let items = vec![
            ScriptItem::Op(OP_0),
            ScriptItem::Op(OP_IF),
            push(b"ord"),
            ScriptItem::Op(0x51),
            push(b"text/plain"),
            ScriptItem::Op(0x57),
            push(b"bitseed"),
            ScriptItem::Op(OP_0),
            push(b"Hello, "),
            push(b"World!"),
            ScriptItem::Op(OP_ENDIF),
        ];
        let envelope = Envelope::from_items(0, 1, &items).expect("envelope");
        assert_eq!(envelope.protocol.as_deref(), Some(&b"ord"[..]));
        assert_eq!(envelope.content_type.as_deref(), Some("text/plain"));
        assert!(envelope.metaprotocol_is("bitseed"));
        assert_eq!(envelope.body_text(), Some("Hello, World!"));
        assert_eq!(envelope.metadata, None);
        assert_eq!(envelope.content_encoding, None);
    }
}
