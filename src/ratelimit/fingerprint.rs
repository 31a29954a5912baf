//! Key specifications and cache key generation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tonic::Status;
use tracing::{trace, warn};

use crate::error::{Result, TollgateError};
use crate::grpc::CallContext;

const REQUEST_PREFIX: &str = "request:";
const METADATA_PREFIX: &str = "metadata:";

/// Separates the group, the values and the window inside a cache key.
const PART_SEPARATOR: &str = "\u{1e}";
/// Terminates every key value inside a cache key.
const VALUE_TERMINATOR: &str = "\u{1f}";

/// User function deriving a key value from a call.
pub type KeyExtractor<Req> =
    Arc<dyn Fn(&Req, &CallContext) -> std::result::Result<String, Status> + Send + Sync>;

/// Where a rate limit key value comes from.
pub enum KeySpec<Req> {
    /// Dotted field path into the request message, e.g. `user.id`
    RequestField(String),
    /// Name of a client metadata entry, e.g. `user-agent`
    Metadata(String),
    /// User supplied extractor
    Custom(KeyExtractor<Req>),
}

impl<Req> KeySpec<Req> {
    /// Key on a (possibly nested) request field.
    pub fn request_field(path: impl Into<String>) -> Self {
        KeySpec::RequestField(path.into())
    }

    /// Key on a client metadata entry.
    pub fn metadata(name: impl Into<String>) -> Self {
        KeySpec::Metadata(name.into())
    }

    /// Key on the result of a user function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Req, &CallContext) -> std::result::Result<String, Status> + Send + Sync + 'static,
    {
        KeySpec::Custom(Arc::new(f))
    }

    /// Parse the `request:<path>` / `metadata:<name>` string form.
    pub fn parse(spec: &str) -> Result<Self> {
        if let Some(path) = spec.strip_prefix(REQUEST_PREFIX) {
            if path.is_empty() || path.split('.').any(str::is_empty) {
                return Err(TollgateError::Config(format!(
                    "invalid request field path in key '{}'",
                    spec
                )));
            }
            return Ok(KeySpec::RequestField(path.to_string()));
        }

        if let Some(name) = spec.strip_prefix(METADATA_PREFIX) {
            if name.is_empty() {
                return Err(TollgateError::Config(format!(
                    "missing metadata name in key '{}'",
                    spec
                )));
            }
            return Ok(KeySpec::Metadata(name.to_ascii_lowercase()));
        }

        Err(TollgateError::Config(format!(
            "unsupported key '{}', expected '{}<path>' or '{}<name>'",
            spec, REQUEST_PREFIX, METADATA_PREFIX
        )))
    }
}

impl<Req> FromStr for KeySpec<Req> {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<Req> Clone for KeySpec<Req> {
    fn clone(&self) -> Self {
        match self {
            KeySpec::RequestField(path) => KeySpec::RequestField(path.clone()),
            KeySpec::Metadata(name) => KeySpec::Metadata(name.clone()),
            KeySpec::Custom(f) => KeySpec::Custom(Arc::clone(f)),
        }
    }
}

impl<Req> fmt::Debug for KeySpec<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::RequestField(path) => f.debug_tuple("RequestField").field(path).finish(),
            KeySpec::Metadata(name) => f.debug_tuple("Metadata").field(name).finish(),
            KeySpec::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl<Req> fmt::Display for KeySpec<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::RequestField(path) => write!(f, "{}{}", REQUEST_PREFIX, path),
            KeySpec::Metadata(name) => write!(f, "{}{}", METADATA_PREFIX, name),
            KeySpec::Custom(_) => f.write_str("<custom>"),
        }
    }
}

/// Resolve every key spec against a call, preserving order.
///
/// Missing request fields and metadata resolve to an empty string. Errors
/// from custom extractors are returned unchanged. A request that cannot be
/// serialized for a field lookup fails the call with `INTERNAL`.
pub fn resolve_values<Req: Serialize>(
    request: &Req,
    context: &CallContext,
    keys: &[KeySpec<Req>],
) -> std::result::Result<Vec<String>, Status> {
    // Serialized lazily, at most once per call.
    let mut tree: Option<Value> = None;
    let mut values = Vec::with_capacity(keys.len());

    for key in keys {
        let value = match key {
            KeySpec::Custom(extract) => extract(request, context)?,
            KeySpec::RequestField(path) => {
                if tree.is_none() {
                    tree = Some(serialize_request(request)?);
                }
                tree.as_ref().map(|tree| field_value(tree, path)).unwrap_or_default()
            }
            KeySpec::Metadata(name) => context.metadata_value(name).unwrap_or_default(),
        };

        trace!(key = %key, value = %value, "Resolved key value");
        values.push(value);
    }

    Ok(values)
}

fn serialize_request<Req: Serialize>(request: &Req) -> std::result::Result<Value, Status> {
    serde_json::to_value(request).map_err(|e| {
        warn!(error = %e, "Failed to serialize request for key lookup");
        Status::internal("failed to read rate limit key from request")
    })
}

/// Walk a dotted path through a serialized message.
fn field_value(tree: &Value, path: &str) -> String {
    let found = path
        .split('.')
        .try_fold(tree, |node, field| node.get(field));

    match found {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Build the storage key for a group, its key values and a window.
///
/// The key is the hex SHA-256 of the group, each value followed by a unit
/// separator, and the decimal window, with record separators between the
/// three parts. Values containing the separator characters could collide
/// with other combinations; that only merges two limits.
pub fn cache_key(group: &str, values: &[String], window: u64) -> String {
    let mut hasher = Sha256::new();

    hasher.update(group.as_bytes());
    hasher.update(PART_SEPARATOR);
    for value in values {
        hasher.update(value.as_bytes());
        hasher.update(VALUE_TERMINATOR);
    }
    hasher.update(PART_SEPARATOR);
    hasher.update(window.to_string());

    hex::encode(hasher.finalize())
}
