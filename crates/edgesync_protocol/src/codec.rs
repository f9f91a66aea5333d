//! CBOR helpers shared by every encodable protocol type.
//!
//! Values are built as maps keyed by field name. Decoding goes through
//! [`Fields`], which turns absent or mistyped fields into
//! [`ProtocolError::MissingField`] instead of silently defaulting.

use crate::error::{ProtocolError, ProtocolResult};
use ciborium::value::Value;
use uuid::Uuid;

/// Serializes a CBOR value to bytes.
pub(crate) fn encode_value(value: &Value) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Parses bytes into a CBOR value.
pub(crate) fn decode_value(bytes: &[u8]) -> ProtocolResult<Value> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Builder for a field-name keyed CBOR map.
#[derive(Debug, Default)]
pub(crate) struct MapBuilder {
    pairs: Vec<(Value, Value)>,
}

impl MapBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn value(mut self, key: &str, value: Value) -> Self {
        self.pairs.push((Value::Text(key.to_string()), value));
        self
    }

    pub(crate) fn uint(self, key: &str, value: u64) -> Self {
        self.value(key, Value::Integer(value.into()))
    }

    pub(crate) fn code(self, key: &str, code: u8) -> Self {
        self.value(key, Value::Integer(code.into()))
    }

    pub(crate) fn text(self, key: &str, value: impl Into<String>) -> Self {
        self.value(key, Value::Text(value.into()))
    }

    pub(crate) fn bytes(self, key: &str, value: Vec<u8>) -> Self {
        self.value(key, Value::Bytes(value))
    }

    pub(crate) fn uuid(self, key: &str, value: Uuid) -> Self {
        self.bytes(key, value.as_bytes().to_vec())
    }

    pub(crate) fn bool(self, key: &str, value: bool) -> Self {
        self.value(key, Value::Bool(value))
    }

    pub(crate) fn array(self, key: &str, values: Vec<Value>) -> Self {
        self.value(key, Value::Array(values))
    }

    pub(crate) fn opt_uint(self, key: &str, value: Option<u64>) -> Self {
        match value {
            Some(v) => self.uint(key, v),
            None => self,
        }
    }

    pub(crate) fn opt_text(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.text(key, v),
            None => self,
        }
    }

    pub(crate) fn opt_bytes(self, key: &str, value: Option<&[u8]>) -> Self {
        match value {
            Some(v) => self.bytes(key, v.to_vec()),
            None => self,
        }
    }

    pub(crate) fn build(self) -> Value {
        Value::Map(self.pairs)
    }
}

/// Read-only view over a decoded CBOR map.
pub(crate) struct Fields<'a> {
    pairs: &'a [(Value, Value)],
    context: &'static str,
}

impl<'a> Fields<'a> {
    pub(crate) fn of(value: &'a Value, context: &'static str) -> ProtocolResult<Self> {
        value
            .as_map()
            .map(|pairs| Self {
                pairs: pairs.as_slice(),
                context,
            })
            .ok_or_else(|| ProtocolError::invalid(context, "expected map"))
    }

    fn get(&self, name: &str) -> Option<&'a Value> {
        self.pairs
            .iter()
            .find(|(k, _)| k.as_text() == Some(name))
            .map(|(_, v)| v)
            .filter(|v| !v.is_null())
    }

    fn missing(&self, name: &str) -> ProtocolError {
        ProtocolError::missing(self.context, name)
    }

    pub(crate) fn value(&self, name: &str) -> ProtocolResult<&'a Value> {
        self.get(name).ok_or_else(|| self.missing(name))
    }

    pub(crate) fn opt_uint(&self, name: &str) -> ProtocolResult<Option<u64>> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => v
                .as_integer()
                .and_then(|i| u64::try_from(i).ok())
                .map(Some)
                .ok_or_else(|| self.missing(name)),
        }
    }

    pub(crate) fn uint(&self, name: &str) -> ProtocolResult<u64> {
        self.opt_uint(name)?.ok_or_else(|| self.missing(name))
    }

    /// Reads a `u8` code and maps it through `from_code`.
    pub(crate) fn code<T>(&self, name: &str, from_code: fn(u8) -> Option<T>) -> ProtocolResult<T> {
        let raw = self.uint(name)?;
        u8::try_from(raw)
            .ok()
            .and_then(from_code)
            .ok_or_else(|| ProtocolError::UnknownCode {
                context: self.context,
                field: name.to_string(),
                code: raw,
            })
    }

    pub(crate) fn opt_text(&self, name: &str) -> ProtocolResult<Option<&'a str>> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => v.as_text().map(Some).ok_or_else(|| self.missing(name)),
        }
    }

    pub(crate) fn text(&self, name: &str) -> ProtocolResult<&'a str> {
        self.opt_text(name)?.ok_or_else(|| self.missing(name))
    }

    pub(crate) fn opt_bytes(&self, name: &str) -> ProtocolResult<Option<&'a [u8]>> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => v
                .as_bytes()
                .map(|b| Some(b.as_slice()))
                .ok_or_else(|| self.missing(name)),
        }
    }

    pub(crate) fn uuid(&self, name: &str) -> ProtocolResult<Uuid> {
        self.opt_bytes(name)?
            .and_then(|b| Uuid::from_slice(b).ok())
            .ok_or_else(|| self.missing(name))
    }

    pub(crate) fn bool_or(&self, name: &str, default: bool) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(default)
    }

    pub(crate) fn array(&self, name: &str) -> ProtocolResult<&'a [Value]> {
        self.get(name)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .ok_or_else(|| self.missing(name))
    }
}
