//! Purpose: Parse and validate named, typed generator parameters fixed at deploy time.
//! Exports: `DeployArg`, `DeployArgSpec`, `parse`, `parse_all`, `to_json_string`, `to_cbor`.
//! Role: Normalizes deploy args before they are serialized for either ABI convention.
//! Invariants: Each arg is a one-key object `{name: {"type": .., "data": ..}}`; order is preserved.
//! Invariants: Range bounds satisfy `min <= max`.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum DeployArgSpec {
    Range { min: i64, max: i64 },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeployArg {
    pub name: String,
    pub spec: DeployArgSpec,
}

impl DeployArg {
    pub fn range(name: impl Into<String>, min: i64, max: i64) -> Result<Self, Error> {
        let arg = Self {
            name: name.into(),
            spec: DeployArgSpec::Range { min, max },
        };
        arg.validate()?;
        Ok(arg)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(invalid("deploy arg name is empty"));
        }
        match self.spec {
            DeployArgSpec::Range { min, max } if min > max => Err(invalid(format!(
                "range `{}` has min {min} greater than max {max}",
                self.name
            ))),
            DeployArgSpec::Range { .. } => Ok(()),
        }
    }

    pub fn to_json_value(&self) -> Value {
        let spec = match &self.spec {
            DeployArgSpec::Range { min, max } => serde_json::json!({
                "type": "range",
                "data": { "min": min, "max": max },
            }),
        };
        let mut object = Map::new();
        object.insert(self.name.clone(), spec);
        Value::Object(object)
    }
}

/// Parses one arg from its JSON text.
pub fn parse(text: &str) -> Result<DeployArg, Error> {
    let value: Value = serde_json::from_str(text).map_err(|err| {
        invalid("deploy arg is not valid JSON")
            .with_raw(text.as_bytes())
            .with_source(err)
    })?;
    from_value(&value).map_err(|err| err.with_raw(text.as_bytes()))
}

pub fn parse_all<S: AsRef<str>>(texts: &[S]) -> Result<Vec<DeployArg>, Error> {
    texts.iter().map(|text| parse(text.as_ref())).collect()
}

pub fn from_value(value: &Value) -> Result<DeployArg, Error> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid("deploy arg must be a JSON object"))?;
    let mut entries = object.iter();
    let (name, spec) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(invalid(format!(
                "deploy arg must have exactly one name, found {}",
                object.len()
            )));
        }
    };
    let spec = DeployArgSpec::deserialize(spec).map_err(|err| {
        invalid(format!("deploy arg `{name}` has an unsupported spec")).with_source(err)
    })?;
    let arg = DeployArg {
        name: name.clone(),
        spec,
    };
    arg.validate()?;
    Ok(arg)
}

pub fn to_json_value(args: &[DeployArg]) -> Value {
    Value::Array(args.iter().map(DeployArg::to_json_value).collect())
}

/// String-convention form: the JSON array text.
pub fn to_json_string(args: &[DeployArg]) -> String {
    to_json_value(args).to_string()
}

/// Stack-convention form: the CBOR encoding of the same array.
pub fn to_cbor(args: &[DeployArg]) -> Result<Vec<u8>, Error> {
    let mut buffer = Vec::new();
    ciborium::into_writer(&to_json_value(args), &mut buffer).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode deploy args")
            .with_source(err)
    })?;
    Ok(buffer)
}

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidDeployArgs).with_message(message)
}
