//! Resource property values.
//!
//! Inputs and outputs are trees of [`PropertyValue`]. On the wire (provider
//! protocol, registration stream) they are plain JSON with a few reserved
//! shapes: the unknown sentinel string for values not known until apply, and
//! objects tagged with the signature key for secrets, assets and archives.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Sentinel string standing in for a value that is not known yet.
pub const UNKNOWN_SENTINEL: &str = "04da6b54-80e4-46f7-96ec-b56ff0331ba9";

/// Key marking a JSON object as a special value.
pub const SIGNATURE_KEY: &str = "4dabf18193072939515e22adb298388d";

/// Signature of a secret value.
pub const SECRET_SIGNATURE: &str = "1b47061264138c4ac30d75fd1eb44270";

/// Signature of an asset.
pub const ASSET_SIGNATURE: &str = "c44067f5952c0a294b673a41bacd8c17";

/// Signature of an archive.
pub const ARCHIVE_SIGNATURE: &str = "0def7320c3a5731c473e5ecbe6d01bc7";

/// Ordered map of property names to values.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Error decoding a wire value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PropertyError {
    /// The object carries a signature this engine does not know.
    #[error("unrecognised value signature '{0}'")]
    UnknownSignature(String),

    /// A signed object is missing a required field or has the wrong shape.
    #[error("malformed {kind}: {message}")]
    Malformed {
        /// What kind of special value was being decoded.
        kind: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

impl PropertyError {
    fn malformed(kind: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            message: message.into(),
        }
    }
}

/// A file-like value whose content is uploaded by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Asset {
    /// Inline text content.
    Text(String),
    /// A local file path.
    Path(String),
    /// A remote URI.
    Uri(String),
}

/// A collection of assets or a packaged directory.
#[derive(Debug, Clone, PartialEq)]
pub enum Archive {
    /// Named assets and nested archives.
    Assets(PropertyMap),
    /// A local file or directory path.
    Path(String),
    /// A remote URI.
    Uri(String),
}

/// A single property value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PropertyValue {
    /// JSON null.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A number.
    Number(f64),
    /// A string.
    String(String),
    /// An ordered list.
    Array(Vec<PropertyValue>),
    /// A nested map.
    Object(PropertyMap),
    /// A value that must never be persisted in plaintext.
    Secret(Box<PropertyValue>),
    /// A value that will only be known once the resource is deployed.
    Computed,
    /// An asset.
    Asset(Asset),
    /// An archive.
    Archive(Archive),
}

impl PropertyValue {
    /// Wraps a value as a secret.
    ///
    /// Wrapping an existing secret does not nest it.
    #[must_use]
    pub fn secret(value: Self) -> Self {
        match value {
            Self::Secret(_) => value,
            other => Self::Secret(Box::new(other)),
        }
    }

    /// Returns true if this value is a secret.
    #[must_use]
    pub const fn is_secret(&self) -> bool {
        matches!(self, Self::Secret(_))
    }

    /// Returns true if this value is the unknown placeholder.
    #[must_use]
    pub const fn is_computed(&self) -> bool {
        matches!(self, Self::Computed)
    }

    /// Returns the plaintext under any secret wrapper.
    #[must_use]
    pub fn reveal(&self) -> &Self {
        match self {
            Self::Secret(inner) => inner.reveal(),
            other => other,
        }
    }

    /// Returns true if the value or anything inside it is unknown.
    #[must_use]
    pub fn contains_unknowns(&self) -> bool {
        match self {
            Self::Computed => true,
            Self::Secret(inner) => inner.contains_unknowns(),
            Self::Array(items) => items.iter().any(Self::contains_unknowns),
            Self::Object(map) => map.values().any(Self::contains_unknowns),
            _ => false,
        }
    }

    /// Returns true if the value or anything inside it is secret.
    #[must_use]
    pub fn contains_secrets(&self) -> bool {
        match self {
            Self::Secret(_) => true,
            Self::Array(items) => items.iter().any(Self::contains_secrets),
            Self::Object(map) => map.values().any(Self::contains_secrets),
            Self::Archive(Archive::Assets(assets)) => assets.values().any(Self::contains_secrets),
            _ => false,
        }
    }

    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Short name of the value's kind, for diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Secret(_) => "secret",
            Self::Computed => "unknown",
            Self::Asset(_) => "asset",
            Self::Archive(_) => "archive",
        }
    }

    /// Encodes the value in its JSON wire form.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => number_to_wire(*n),
            Self::String(s) => Value::String(s.clone()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_wire).collect()),
            Self::Object(map) => map_to_wire(map),
            Self::Computed => Value::String(UNKNOWN_SENTINEL.to_string()),
            Self::Secret(inner) => signed(
                SECRET_SIGNATURE,
                [("value".to_string(), inner.to_wire())],
            ),
            Self::Asset(asset) => {
                let field = match asset {
                    Asset::Text(text) => ("text", text),
                    Asset::Path(path) => ("path", path),
                    Asset::Uri(uri) => ("uri", uri),
                };
                signed(
                    ASSET_SIGNATURE,
                    [(field.0.to_string(), Value::String(field.1.clone()))],
                )
            }
            Self::Archive(archive) => {
                let field = match archive {
                    Archive::Assets(assets) => ("assets".to_string(), map_to_wire(assets)),
                    Archive::Path(path) => ("path".to_string(), Value::String(path.clone())),
                    Archive::Uri(uri) => ("uri".to_string(), Value::String(uri.clone())),
                };
                signed(ARCHIVE_SIGNATURE, [field])
            }
        }
    }

    /// Decodes a value from its JSON wire form.
    ///
    /// Secretness is lifted: an array or object with a secret element
    /// decodes as a secret wrapping the unwrapped collection.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown signatures or malformed signed objects.
    pub fn from_wire(value: &Value) -> Result<Self, PropertyError> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => Ok(n.as_f64().map_or(Self::Null, Self::Number)),
            Value::String(s) if s == UNKNOWN_SENTINEL => Ok(Self::Computed),
            Value::String(s) => Ok(Self::String(s.clone())),
            Value::Array(items) => {
                let mut secret = false;
                let mut decoded = Vec::with_capacity(items.len());
                for item in items {
                    match Self::from_wire(item)? {
                        Self::Secret(inner) => {
                            secret = true;
                            decoded.push(*inner);
                        }
                        other => decoded.push(other),
                    }
                }
                Ok(lift(Self::Array(decoded), secret))
            }
            Value::Object(map) => {
                if let Some(signature) = map.get(SIGNATURE_KEY) {
                    return Self::from_signed(signature, map);
                }
                let mut secret = false;
                let mut decoded = PropertyMap::new();
                for (key, item) in map {
                    match Self::from_wire(item)? {
                        Self::Secret(inner) => {
                            secret = true;
                            decoded.insert(key.clone(), *inner);
                        }
                        other => {
                            decoded.insert(key.clone(), other);
                        }
                    }
                }
                Ok(lift(Self::Object(decoded), secret))
            }
        }
    }

    fn from_signed(signature: &Value, map: &Map<String, Value>) -> Result<Self, PropertyError> {
        let signature = signature
            .as_str()
            .ok_or_else(|| PropertyError::UnknownSignature(signature.to_string()))?;

        match signature {
            SECRET_SIGNATURE => {
                let inner = map
                    .get("value")
                    .ok_or_else(|| PropertyError::malformed("secret", "missing 'value'"))?;
                Ok(Self::secret(Self::from_wire(inner)?))
            }
            ASSET_SIGNATURE => {
                let asset = if let Some(text) = string_field(map, "text") {
                    Asset::Text(text)
                } else if let Some(path) = string_field(map, "path") {
                    Asset::Path(path)
                } else if let Some(uri) = string_field(map, "uri") {
                    Asset::Uri(uri)
                } else {
                    return Err(PropertyError::malformed(
                        "asset",
                        "expected one of 'text', 'path' or 'uri'",
                    ));
                };
                Ok(Self::Asset(asset))
            }
            ARCHIVE_SIGNATURE => {
                let archive = if let Some(assets) = map.get("assets") {
                    let Value::Object(entries) = assets else {
                        return Err(PropertyError::malformed("archive", "'assets' must be an object"));
                    };
                    let mut decoded = PropertyMap::new();
                    for (name, entry) in entries {
                        let value = Self::from_wire(entry)?;
                        if !matches!(value, Self::Asset(_) | Self::Archive(_)) {
                            return Err(PropertyError::malformed(
                                "archive",
                                format!("entry '{name}' is not an asset or archive"),
                            ));
                        }
                        decoded.insert(name.clone(), value);
                    }
                    Archive::Assets(decoded)
                } else if let Some(path) = string_field(map, "path") {
                    Archive::Path(path)
                } else if let Some(uri) = string_field(map, "uri") {
                    Archive::Uri(uri)
                } else {
                    return Err(PropertyError::malformed(
                        "archive",
                        "expected one of 'assets', 'path' or 'uri'",
                    ));
                };
                Ok(Self::Archive(archive))
            }
            other => Err(PropertyError::UnknownSignature(other.to_string())),
        }
    }
}

fn lift(value: PropertyValue, secret: bool) -> PropertyValue {
    if secret {
        PropertyValue::secret(value)
    } else {
        value
    }
}

fn signed<const N: usize>(signature: &str, fields: [(String, Value); N]) -> Value {
    let mut map = Map::new();
    map.insert(SIGNATURE_KEY.to_string(), Value::String(signature.to_string()));
    map.extend(fields);
    Value::Object(map)
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn number_to_wire(n: f64) -> Value {
    // Integral values are written without a fractional part.
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map_or(Value::Null, Value::Number)
}

/// Encodes a property map in its JSON wire form.
#[must_use]
pub fn map_to_wire(map: &PropertyMap) -> Value {
    Value::Object(
        map.iter()
            .map(|(key, value)| (key.clone(), value.to_wire()))
            .collect(),
    )
}

/// Decodes a property map from a JSON object.
///
/// Top-level keys keep their own secretness; nothing is lifted to the map.
///
/// # Errors
///
/// Returns an error if the value is not an object or an entry fails to decode.
pub fn map_from_wire(value: &Value) -> Result<PropertyMap, PropertyError> {
    match value {
        Value::Null => Ok(PropertyMap::new()),
        Value::Object(entries) => entries
            .iter()
            .map(|(key, item)| Ok((key.clone(), PropertyValue::from_wire(item)?)))
            .collect(),
        other => Err(PropertyError::malformed(
            "property map",
            format!("expected an object, found {other}"),
        )),
    }
}

/// Merges outputs over inputs; outputs win for keys present in both.
#[must_use]
pub fn merge_outputs(inputs: &PropertyMap, outputs: &PropertyMap) -> PropertyMap {
    let mut merged = inputs.clone();
    for (key, value) in outputs {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Marks outputs secret when their input was secret or their key is listed
/// in `additional`.
#[must_use]
pub fn inherit_secret_outputs(
    inputs: &PropertyMap,
    outputs: PropertyMap,
    additional: &[String],
) -> PropertyMap {
    outputs
        .into_iter()
        .map(|(key, value)| {
            let input_secret = inputs.get(&key).is_some_and(PropertyValue::is_secret);
            let listed = additional.iter().any(|name| name == &key);
            if (input_secret || listed) && !value.is_secret() {
                (key, PropertyValue::secret(value))
            } else {
                (key, value)
            }
        })
        .collect()
}

/// Returns true if any value in the map is unknown.
#[must_use]
pub fn map_contains_unknowns(map: &PropertyMap) -> bool {
    map.values().any(PropertyValue::contains_unknowns)
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_wire(&value).map_err(serde::de::Error::custom)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<Self>> for PropertyValue {
    fn from(value: Vec<Self>) -> Self {
        Self::Array(value)
    }
}

impl From<PropertyMap> for PropertyValue {
    fn from(value: PropertyMap) -> Self {
        Self::Object(value)
    }
}
