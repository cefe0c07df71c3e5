use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The identity of a [`Resource`](crate::Resource).
///
/// It is assigned once when the resource is defined and stays stable for the lifetime of the
/// process. Clones of a resource share the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Allocates a new, random identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The key under which an [`Entry`](crate::Entry) is stored.
///
/// A key is derived from the resource identity and the canonical form of the normalized input.
/// Keys compare and hash by a SHA-256 digest of both, while the human-readable canonical form is
/// kept around for logging.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    resource: ResourceId,
    resource_name: Arc<str>,
    canonical: Arc<str>,
    hash: [u8; 32],
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_name, self.canonical)
    }
}

impl CacheKey {
    /// Creates the key for `value` as normalized by the resource identified by `resource`.
    pub fn from_value(
        resource: ResourceId,
        resource_name: Arc<str>,
        value: &Value,
    ) -> Result<Self, fmt::Error> {
        let mut builder = CacheKeyBuilder::new(resource, resource_name);
        builder.write_value(value)?;
        Ok(builder.build())
    }

    /// The identity of the resource this key belongs to.
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// The canonical form of the input that forms the basis of this key.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

/// Builds a [`CacheKey`] from a canonical text rendering of the input, hashed together with the
/// resource identity.
///
/// The rendering is stable: map entries are written in sorted key order, sequences keep their
/// order, and integral numbers are written as integers no matter whether they were represented
/// as floats.
struct CacheKeyBuilder {
    resource: ResourceId,
    resource_name: Arc<str>,
    canonical: String,
}

impl CacheKeyBuilder {
    fn new(resource: ResourceId, resource_name: Arc<str>) -> Self {
        Self {
            resource,
            resource_name,
            canonical: String::new(),
        }
    }

    fn write_value(&mut self, value: &Value) -> fmt::Result {
        write_canonical(&mut self.canonical, value)
    }

    fn build(self) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(self.resource.0.as_bytes());
        hasher.update(self.canonical.as_bytes());
        let hash: [u8; 32] = hasher.finalize().into();

        CacheKey {
            resource: self.resource,
            resource_name: self.resource_name,
            canonical: self.canonical.into(),
            hash,
        }
    }
}

/// Floats beyond this magnitude cannot be represented exactly as integers.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

fn write_canonical<W: fmt::Write>(out: &mut W, value: &Value) -> fmt::Result {
    match value {
        Value::Null => out.write_str("null"),
        Value::Bool(b) => write!(out, "{b}"),
        Value::Number(number) => {
            if let Some(n) = number.as_i64() {
                write!(out, "{n}")
            } else if let Some(n) = number.as_u64() {
                write!(out, "{n}")
            } else {
                let n = number.as_f64().unwrap_or_default();
                if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
                    write!(out, "{}", n as i64)
                } else {
                    write!(out, "{n}")
                }
            }
        }
        Value::String(_) => write!(out, "{value}"),
        Value::Array(items) => {
            out.write_char('[')?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.write_char(',')?;
                }
                write_canonical(out, item)?;
            }
            out.write_char(']')
        }
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.write_char('{')?;
            for (i, (name, item)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.write_char(',')?;
                }
                write!(out, "{}:", Value::from(name.as_str()))?;
                write_canonical(out, item)?;
            }
            out.write_char('}')
        }
    }
}
