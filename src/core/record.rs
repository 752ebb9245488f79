//! Purpose: Token records produced by generators and their inscription shape.
//! Exports: `TokenRecord`, `Content`, `InscriptionRequest`, metadata key constants.
//! Role: Decodes raw guest output (CBOR or JSON) and builds the inscriber payload.
//! Invariants: Decoding never guesses; any shape mismatch is `InvalidGeneratorOutput` with raw bytes.
//! Invariants: Attributes, when present, are always a map.
//! Notes: Map entry order is preserved so re-encoding stays byte-identical.
use ciborium::Value as CborValue;
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

use crate::core::envelope::Envelope;
use crate::core::error::{Error, ErrorKind};

pub const OP_MINT: &str = "mint";
pub const METAPROTOCOL: &str = "bitseed";
pub const META_OP: &str = "op";
pub const META_TICK: &str = "tick";
pub const META_AMOUNT: &str = "amount";
pub const META_ATTRIBUTES: &str = "attributes";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

const KEY_CONTENT: &str = "content";
const KEY_CONTENT_TYPE: &str = "content_type";
const KEY_CONTENT_LEN: &str = "content_len";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Content {
    pub content_type: String,
    pub content: Vec<u8>,
}

impl Content {
    pub fn new(content_type: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            content: content.into(),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(CONTENT_TYPE_TEXT, body.into().into_bytes())
    }

    pub fn content_len(&self) -> usize {
        self.content.len()
    }

    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TokenRecord {
    pub op: String,
    pub tick: String,
    pub amount: u64,
    pub attributes: Option<CborValue>,
    pub content: Option<Content>,
}

/// What the external inscriber receives; it never sees a `TokenRecord`.
#[derive(Clone, Debug, PartialEq)]
pub struct InscriptionRequest {
    pub content_type: String,
    pub content_bytes: Vec<u8>,
    pub meta: CborValue,
    pub metaprotocol: String,
}

impl InscriptionRequest {
    pub fn meta_bytes(&self) -> Result<Vec<u8>, Error> {
        encode_cbor(&self.meta)
    }
}

impl TokenRecord {
    /// Decodes the length-prefixed payload of a stack-convention generator.
    ///
    /// Accepts either a map `{amount, attributes, content: {content_type, content, content_len?}}`
    /// or the compact array `[amount, attributes-bytes|null, [content_type, bytes]|null]`.
    pub fn from_cbor_output(bytes: &[u8]) -> Result<Self, Error> {
        let value: CborValue = ciborium::from_reader(bytes).map_err(|err| {
            invalid("generator result is not valid CBOR")
                .with_raw(bytes)
                .with_source(err)
        })?;
        let record = match &value {
            CborValue::Map(entries) => record_from_map(entries),
            CborValue::Array(items) => record_from_array(items),
            _ => Err(invalid("generator result must be a map or an array")),
        };
        record.map_err(|err| err.with_raw(bytes))
    }

    /// Decodes the NUL-terminated JSON text of a string-convention generator.
    pub fn from_json_output(bytes: &[u8]) -> Result<Self, Error> {
        let value: JsonValue = serde_json::from_slice(bytes).map_err(|err| {
            invalid("generator result is not valid JSON")
                .with_raw(bytes)
                .with_source(err)
        })?;
        Self::from_json(&value).map_err(|err| err.with_raw(bytes))
    }

    pub fn from_json(value: &JsonValue) -> Result<Self, Error> {
        record_from_map(&json_to_cbor_entries(value)?)
    }

    pub fn with_defaults(mut self, op: &str, tick: &str) -> Self {
        if self.op.is_empty() {
            self.op = op.to_string();
        }
        if self.tick.is_empty() {
            self.tick = tick.to_string();
        }
        self
    }

    /// Canonical CBOR form; identical records always encode identically.
    pub fn to_cbor_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut entries = vec![
            (text(META_OP), text(&self.op)),
            (text(META_TICK), text(&self.tick)),
            (text(META_AMOUNT), CborValue::Integer(self.amount.into())),
            (
                text(META_ATTRIBUTES),
                self.attributes.clone().unwrap_or(CborValue::Null),
            ),
        ];
        let content = match &self.content {
            Some(content) => CborValue::Map(vec![
                (text(KEY_CONTENT_TYPE), text(&content.content_type)),
                (text(KEY_CONTENT), CborValue::Bytes(content.content.clone())),
                (
                    text(KEY_CONTENT_LEN),
                    CborValue::Integer((content.content_len() as u64).into()),
                ),
            ]),
            None => CborValue::Null,
        };
        entries.push((text(KEY_CONTENT), content));
        encode_cbor(&CborValue::Map(entries))
    }

    pub fn to_json(&self) -> JsonValue {
        let content = match &self.content {
            Some(content) => {
                let body = match content.as_text() {
                    Some(text) => JsonValue::String(text.to_string()),
                    None => JsonValue::Array(
                        content
                            .content
                            .iter()
                            .map(|byte| JsonValue::from(*byte))
                            .collect(),
                    ),
                };
                serde_json::json!({
                    "content_type": content.content_type,
                    "content": body,
                    "content_len": content.content_len(),
                })
            }
            None => JsonValue::Null,
        };
        serde_json::json!({
            "op": self.op,
            "tick": self.tick,
            "amount": self.amount,
            "attributes": self.attributes.as_ref().map_or(JsonValue::Null, cbor_to_json),
            "content": content,
        })
    }

    pub fn to_inscription(&self) -> InscriptionRequest {
        let mut meta = vec![
            (text(META_OP), text(&self.op)),
            (text(META_TICK), text(&self.tick)),
            (text(META_AMOUNT), CborValue::Integer(self.amount.into())),
        ];
        if let Some(attributes) = &self.attributes {
            meta.push((text(META_ATTRIBUTES), attributes.clone()));
        }
        let content = self
            .content
            .clone()
            .unwrap_or_else(|| Content::text(self.op.clone()));
        InscriptionRequest {
            content_type: content.content_type,
            content_bytes: content.content,
            meta: CborValue::Map(meta),
            metaprotocol: METAPROTOCOL.to_string(),
        }
    }

    /// Recovers a record from an inscribed envelope; `None` when the metadata is not ours.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        let entries = envelope.metadata.as_ref()?.as_map()?;
        let op = map_get(entries, META_OP)?.as_text()?.to_string();
        let tick = map_get(entries, META_TICK)?.as_text()?.to_string();
        let amount = u64::try_from(map_get(entries, META_AMOUNT)?.as_integer()?).ok()?;
        let attributes = map_get(entries, META_ATTRIBUTES)
            .filter(|value| value.is_map())
            .cloned();
        let content = match (&envelope.content_type, &envelope.body) {
            (Some(content_type), body) => Some(Content::new(
                content_type.clone(),
                body.clone().unwrap_or_default(),
            )),
            (None, Some(body)) => Some(Content::new(String::new(), body.clone())),
            (None, None) => None,
        };
        Some(Self {
            op,
            tick,
            amount,
            attributes,
            content,
        })
    }
}

fn record_from_map(entries: &[(CborValue, CborValue)]) -> Result<TokenRecord, Error> {
    let amount = map_get(entries, META_AMOUNT)
        .ok_or_else(|| invalid("generator result has no amount"))
        .and_then(decode_amount)?;
    let attributes = match map_get(entries, META_ATTRIBUTES) {
        None | Some(CborValue::Null) => None,
        Some(value) => Some(decode_attributes(value)?),
    };
    let content = match map_get(entries, KEY_CONTENT) {
        None | Some(CborValue::Null) => None,
        Some(CborValue::Map(content)) => Some(decode_content_map(content)?),
        Some(CborValue::Array(items)) => Some(decode_content_pair(items)?),
        Some(_) => return Err(invalid("content must be a map, a pair, or null")),
    };
    Ok(TokenRecord {
        op: optional_text(entries, META_OP)?,
        tick: optional_text(entries, META_TICK)?,
        amount,
        attributes,
        content,
    })
}

fn record_from_array(items: &[CborValue]) -> Result<TokenRecord, Error> {
    let [amount, attributes, content] = items else {
        return Err(invalid(format!(
            "generator result array must have 3 items, found {}",
            items.len()
        )));
    };
    let attributes = match attributes {
        CborValue::Null => None,
        value => Some(decode_attributes(value)?),
    };
    let content = match content {
        CborValue::Null => None,
        CborValue::Array(items) => Some(decode_content_pair(items)?),
        _ => return Err(invalid("content must be a [content_type, bytes] pair or null")),
    };
    Ok(TokenRecord {
        amount: decode_amount(amount)?,
        attributes,
        content,
        ..TokenRecord::default()
    })
}

fn decode_amount(value: &CborValue) -> Result<u64, Error> {
    let integer = value
        .as_integer()
        .ok_or_else(|| invalid("amount must be an integer"))?;
    u64::try_from(integer).map_err(|_| invalid("amount must be a non-negative 64-bit integer"))
}

/// Attributes arrive either inline or as CBOR-encoded bytes; both must be a map.
fn decode_attributes(value: &CborValue) -> Result<CborValue, Error> {
    let decoded = match value {
        CborValue::Bytes(bytes) => ciborium::from_reader(bytes.as_slice()).map_err(|err| {
            invalid("attribute bytes are not valid CBOR").with_source(err)
        })?,
        other => other.clone(),
    };
    if !decoded.is_map() {
        return Err(invalid("attributes must be a map"));
    }
    Ok(decoded)
}

fn decode_content_map(entries: &[(CborValue, CborValue)]) -> Result<Content, Error> {
    let content_type = map_get(entries, KEY_CONTENT_TYPE)
        .and_then(CborValue::as_text)
        .ok_or_else(|| invalid("content_type must be text"))?;
    let body = map_get(entries, KEY_CONTENT)
        .or_else(|| map_get(entries, "body"))
        .ok_or_else(|| invalid("content has no body"))
        .and_then(decode_body)?;
    if let Some(declared) = map_get(entries, KEY_CONTENT_LEN) {
        let declared = declared
            .as_integer()
            .and_then(|len| u64::try_from(len).ok())
            .ok_or_else(|| invalid("content_len must be a non-negative integer"))?;
        if declared != body.len() as u64 {
            return Err(invalid(format!(
                "content_len {declared} does not match body length {}",
                body.len()
            )));
        }
    }
    Ok(Content::new(content_type, body))
}

fn decode_content_pair(items: &[CborValue]) -> Result<Content, Error> {
    match items {
        [CborValue::Text(content_type), body] => Ok(Content::new(content_type.clone(), decode_body(body)?)),
        _ => Err(invalid("content must be a [content_type, bytes] pair")),
    }
}

fn decode_body(value: &CborValue) -> Result<Vec<u8>, Error> {
    match value {
        CborValue::Bytes(bytes) => Ok(bytes.clone()),
        CborValue::Text(text) => Ok(text.as_bytes().to_vec()),
        CborValue::Array(items) => items
            .iter()
            .map(|item| {
                item.as_integer()
                    .and_then(|byte| u8::try_from(byte).ok())
                    .ok_or_else(|| invalid("content byte array holds a non-byte value"))
            })
            .collect(),
        _ => Err(invalid("content body must be bytes or text")),
    }
}

fn optional_text(entries: &[(CborValue, CborValue)], key: &str) -> Result<String, Error> {
    match map_get(entries, key) {
        None | Some(CborValue::Null) => Ok(String::new()),
        Some(CborValue::Text(value)) => Ok(value.clone()),
        Some(_) => Err(invalid(format!("{key} must be text"))),
    }
}

pub(crate) fn map_get<'a>(entries: &'a [(CborValue, CborValue)], key: &str) -> Option<&'a CborValue> {
    entries
        .iter()
        .find(|(candidate, _)| candidate.as_text() == Some(key))
        .map(|(_, value)| value)
}

fn json_to_cbor_entries(value: &JsonValue) -> Result<Vec<(CborValue, CborValue)>, Error> {
    match json_to_cbor(value) {
        CborValue::Map(entries) => Ok(entries),
        _ => Err(invalid("generator result must be a JSON object")),
    }
}

pub fn json_to_cbor(value: &JsonValue) -> CborValue {
    match value {
        JsonValue::Null => CborValue::Null,
        JsonValue::Bool(flag) => CborValue::Bool(*flag),
        JsonValue::Number(number) => {
            if let Some(unsigned) = number.as_u64() {
                CborValue::Integer(unsigned.into())
            } else if let Some(signed) = number.as_i64() {
                CborValue::Integer(signed.into())
            } else {
                CborValue::Float(number.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(value) => CborValue::Text(value.clone()),
        JsonValue::Array(items) => CborValue::Array(items.iter().map(json_to_cbor).collect()),
        JsonValue::Object(object) => CborValue::Map(
            object
                .iter()
                .map(|(key, value)| (CborValue::Text(key.clone()), json_to_cbor(value)))
                .collect(),
        ),
    }
}

/// Lossy JSON view for display; byte strings become arrays of numbers.
pub fn cbor_to_json(value: &CborValue) -> JsonValue {
    match value {
        CborValue::Null => JsonValue::Null,
        CborValue::Bool(flag) => JsonValue::Bool(*flag),
        CborValue::Integer(integer) => {
            let wide = i128::from(*integer);
            if let Ok(unsigned) = u64::try_from(wide) {
                JsonValue::from(unsigned)
            } else if let Ok(signed) = i64::try_from(wide) {
                JsonValue::from(signed)
            } else {
                JsonValue::String(wide.to_string())
            }
        }
        CborValue::Float(float) => Number::from_f64(*float).map_or(JsonValue::Null, JsonValue::Number),
        CborValue::Text(text) => JsonValue::String(text.clone()),
        CborValue::Bytes(bytes) => {
            JsonValue::Array(bytes.iter().map(|byte| JsonValue::from(*byte)).collect())
        }
        CborValue::Array(items) => JsonValue::Array(items.iter().map(cbor_to_json).collect()),
        CborValue::Map(entries) => {
            let mut object = JsonMap::new();
            for (key, value) in entries {
                let key = match key {
                    CborValue::Text(text) => text.clone(),
                    other => cbor_to_json(other).to_string(),
                };
                object.insert(key, cbor_to_json(value));
            }
            JsonValue::Object(object)
        }
        CborValue::Tag(_, inner) => cbor_to_json(inner),
        _ => JsonValue::Null,
    }
}

fn text(value: &str) -> CborValue {
    CborValue::Text(value.to_string())
}

fn encode_cbor(value: &CborValue) -> Result<Vec<u8>, Error> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode CBOR value")
            .with_source(err)
    })?;
    Ok(buffer)
}

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidGeneratorOutput).with_message(message)
}
