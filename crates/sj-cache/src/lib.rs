#![forbid(unsafe_code)]

//! Cache-key derivation and the pluggable response cache.
//!
//! The key is a SHA-256 digest over a canonical string encoding of every
//! execution-relevant request field. The backend string participates only
//! here; nothing in the engine branches on it.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sj_core::{Literal, Mode, Program, Transform, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Borrowed view of the request fields the cache key covers.
#[derive(Debug, Clone)]
pub struct CacheKeyInput<'a> {
    pub mode: Mode,
    pub backend: &'a str,
    pub program: &'a Program,
    pub transform_stack: &'a [Transform],
    pub compile_options: &'a BTreeMap<String, String>,
    pub custom_hook: Option<&'a str>,
    pub unknown_features: &'a [String],
    /// Concrete argument values. Responses are concrete, so the key must
    /// separate requests that differ only in their arguments.
    pub args: &'a [Value],
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: &'static str,
    pub digest_hex: String,
}

impl CacheKey {
    #[must_use]
    pub fn as_string(&self) -> String {
        format!("{}-{}", self.namespace, self.digest_hex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKeyError {
    /// Strict mode saw request features this build does not understand.
    /// Fail-closed: raised before any hashing, the request never executes.
    UnknownFeatureRejected { features: Vec<String> },
}

impl std::fmt::Display for CacheKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownFeatureRejected { features } => {
                write!(
                    f,
                    "strict mode rejected unknown features: {}",
                    features.join(",")
                )
            }
        }
    }
}

impl std::error::Error for CacheKeyError {}

pub fn build_cache_key(input: &CacheKeyInput<'_>) -> Result<CacheKey, CacheKeyError> {
    if input.mode == Mode::Strict && !input.unknown_features.is_empty() {
        return Err(CacheKeyError::UnknownFeatureRejected {
            features: input.unknown_features.to_vec(),
        });
    }

    let payload = canonical_payload(input);
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let digest = hasher.finalize();

    Ok(CacheKey {
        namespace: "sjx",
        digest_hex: bytes_to_hex(&digest),
    })
}

fn canonical_payload(input: &CacheKeyInput<'_>) -> String {
    let transforms = input
        .transform_stack
        .iter()
        .map(|transform| match transform {
            Transform::Grad { arg } => format!("grad[{arg}]"),
            other => other.as_str().to_owned(),
        })
        .collect::<Vec<_>>()
        .join(",");

    let compile_options = input
        .compile_options
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(";");

    // Hardened mode folds unknown features into the digest so distinct
    // feature sets land in distinct cache slots.
    let unknown = input.unknown_features.join(",");

    let mut args = String::new();
    for value in input.args {
        write_value(&mut args, value);
        args.push(';');
    }

    format!(
        "mode={}|backend={}|transforms={}|compile={}|hook={}|unknown={}|program={}|args={}",
        input.mode.as_str(),
        input.backend,
        transforms,
        compile_options,
        input.custom_hook.unwrap_or("none"),
        unknown,
        input.program.canonical_fingerprint(),
        args,
    )
}

fn write_value(out: &mut String, value: &Value) {
    use std::fmt::Write;
    match value {
        Value::Scalar(lit) => write_literal(out, *lit),
        Value::Tensor(tensor) => {
            let _ = write!(out, "t:{:?}:{:?}:[", tensor.dtype, tensor.shape.dims);
            for element in &tensor.elements {
                write_literal(out, *element);
                out.push(',');
            }
            out.push(']');
        }
    }
}

fn write_literal(out: &mut String, lit: Literal) {
    use std::fmt::Write;
    let _ = match lit {
        Literal::I64(value) => write!(out, "i64:{value}"),
        Literal::Bool(value) => write!(out, "bool:{value}"),
        Literal::F64Bits(value) => write!(out, "f64bits:{value}"),
    };
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{:02x}", byte));
    }
    out
}

/// What a cache slot stores: the computed outputs plus the execution
/// diagnostics worth replaying on a hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub outputs: Vec<Value>,
    pub folded_equations: usize,
    pub residual_equations: usize,
}

/// Capability interface the dispatcher depends on. Implementations must be
/// safe for concurrent use; eviction and single-flight de-duplication of
/// in-flight identical requests are backend policy, not a core guarantee.
pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<CacheEntry>;
    fn put(&self, key: &CacheKey, entry: CacheEntry);
}

/// Process-local cache backed by a mutex-guarded hash map.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<FxHashMap<CacheKey, CacheEntry>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseCache for InMemoryCache {
    fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .get(key)
            .cloned()
    }

    fn put(&self, key: &CacheKey, entry: CacheEntry) {
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .insert(key.clone(), entry);
    }
}

/// Cache that stores nothing. Useful for tests asserting execution counts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl ResponseCache for NoopCache {
    fn get(&self, _key: &CacheKey) -> Option<CacheEntry> {
        None
    }

    fn put(&self, _key: &CacheKey, _entry: CacheEntry) {}
}
