//! GT-004: Property values, templates and resolved values.
//!
//! A declared property is a literal, a template string with `{{ ... }}`
//! placeholders, or a list/map of those. Resolution turns it into a
//! [`Resolved`] value. Secrets stay sealed inside `Resolved` until
//! [`Resolved::reveal`] is called at the point of a provider call.

use super::error::GantryError;
use super::types::ResourceKey;
use crate::journal::hasher;
use crate::secrets::SecretHandle;
use indexmap::IndexMap;

const SENSITIVE_PREFIX: &str = "sensitive:";

/// A bound reference inside a template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// Output attribute of another resource in this stack
    Output { target: ResourceKey, attribute: String },
    /// Output published by another stack, via a declared alias
    Stack { alias: String, output: String },
    /// Value from the secret store
    Secret { key: String },
    /// Output of a resource read live from its provider
    Lookup { name: String, attribute: String },
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Output { target, attribute } => write!(f, "ref.{}.{}", target, attribute),
            Self::Stack { alias, output } => write!(f, "stack.{}.{}", alias, output),
            Self::Secret { key } => write!(f, "secret.{}", key),
            Self::Lookup { name, attribute } => write!(f, "lookup.{}.{}", name, attribute),
        }
    }
}

/// A piece of a template.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Ref(Reference),
}

/// A string with references.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub segments: Vec<Segment>,
}

impl Template {
    /// The template is exactly one placeholder and no text.
    pub fn is_single_reference(&self) -> bool {
        matches!(self.segments.as_slice(), [Segment::Ref(_)])
    }

    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Ref(r) => Some(r),
            Segment::Text(_) => None,
        })
    }

    pub fn contains_secret(&self) -> bool {
        self.references()
            .any(|r| matches!(r, Reference::Secret { .. }))
    }
}

/// A declared property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Literal(serde_json::Value),
    Template(Template),
    List(Vec<PropertyValue>),
    Map(IndexMap<String, PropertyValue>),
}

impl PropertyValue {
    /// Every reference in this value, depth first.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Template(t) => out.extend(t.references()),
            Self::List(items) => items.iter().for_each(|i| i.collect_references(out)),
            Self::Map(entries) => entries.values().for_each(|v| v.collect_references(out)),
        }
    }

    pub fn contains_secret(&self) -> bool {
        self.references()
            .iter()
            .any(|r| matches!(r, Reference::Secret { .. }))
    }
}

/// Raw piece of a template string before references are bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawSegment {
    Text(String),
    /// Trimmed placeholder expression, e.g. `ref.api.arn`
    Placeholder(String),
}

/// Split a string into text and `{{ ... }}` placeholders.
pub fn parse_placeholders(s: &str) -> Result<Vec<RawSegment>, String> {
    let mut segments = Vec::new();
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(RawSegment::Text(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| format!("unclosed template in \"{}\"", s))?;
        let expr = after[..close].trim();
        if expr.is_empty() {
            return Err(format!("empty placeholder in \"{}\"", s));
        }
        segments.push(RawSegment::Placeholder(expr.to_string()));
        rest = &after[close + 2..];
    }
    if !rest.is_empty() {
        segments.push(RawSegment::Text(rest.to_string()));
    }
    Ok(segments)
}

// ============================================================================
// Resolved values
// ============================================================================

/// Part of a sealed string.
#[derive(Debug, Clone)]
pub enum SealedPart {
    Text(String),
    Secret(SecretHandle),
}

/// A string that contains at least one secret. Only the handles' ciphertext
/// is held; plaintext exists only inside [`SealedString::reveal`].
#[derive(Debug, Clone)]
pub struct SealedString {
    pub parts: Vec<SealedPart>,
}

impl SealedString {
    pub fn fingerprint(&self) -> String {
        if let [SealedPart::Secret(h)] = self.parts.as_slice() {
            return h.fingerprint().to_string();
        }
        let pieces: Vec<String> = self
            .parts
            .iter()
            .map(|p| match p {
                SealedPart::Text(t) => format!("t:{}", t),
                SealedPart::Secret(h) => format!("s:{}", h.fingerprint()),
            })
            .collect();
        let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
        format!("{}{}", SENSITIVE_PREFIX, hasher::composite_hash(&refs))
    }

    pub fn reveal(&self) -> Result<String, GantryError> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                SealedPart::Text(t) => out.push_str(t),
                SealedPart::Secret(h) => out.push_str(&h.reveal()?),
            }
        }
        Ok(out)
    }
}

/// A property value after resolution.
#[derive(Debug, Clone)]
pub enum Resolved {
    Value(serde_json::Value),
    Secret(SealedString),
    /// Known only after a dependency has been applied
    Unknown,
    List(Vec<Resolved>),
    Map(IndexMap<String, Resolved>),
}

impl Resolved {
    pub fn is_known(&self) -> bool {
        match self {
            Self::Unknown => false,
            Self::Value(_) | Self::Secret(_) => true,
            Self::List(items) => items.iter().all(Resolved::is_known),
            Self::Map(entries) => entries.values().all(Resolved::is_known),
        }
    }

    /// Secret-safe JSON form used for diffing, hashing and persistence.
    /// `None` while any part is unknown.
    pub fn fingerprint(&self) -> Option<serde_json::Value> {
        match self {
            Self::Unknown => None,
            Self::Value(v) => Some(v.clone()),
            Self::Secret(s) => Some(serde_json::Value::String(s.fingerprint())),
            Self::List(items) => items
                .iter()
                .map(Resolved::fingerprint)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Self::Map(entries) => entries
                .iter()
                .map(|(k, v)| v.fingerprint().map(|f| (k.clone(), f)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(serde_json::Value::Object),
        }
    }

    /// Plaintext JSON for a provider call. Decrypts secrets.
    pub fn reveal(&self) -> Result<serde_json::Value, GantryError> {
        match self {
            Self::Unknown => Err(GantryError::unresolved(
                "value",
                "not known until a dependency is applied",
            )),
            Self::Value(v) => Ok(v.clone()),
            Self::Secret(s) => Ok(serde_json::Value::String(s.reveal()?)),
            Self::List(items) => items
                .iter()
                .map(Resolved::reveal)
                .collect::<Result<Vec<_>, _>>()
                .map(serde_json::Value::Array),
            Self::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    map.insert(k.clone(), v.reveal()?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
    }

    /// Join resolved pieces of a multi-segment template into one string.
    pub fn concat(pieces: Vec<Resolved>) -> Resolved {
        if pieces.iter().any(|p| !p.is_known()) {
            return Resolved::Unknown;
        }
        let mut parts: Vec<SealedPart> = Vec::new();
        let mut sealed = false;
        for piece in pieces {
            match piece {
                Resolved::Secret(s) => {
                    sealed = true;
                    parts.extend(s.parts);
                }
                other => {
                    let text = other
                        .fingerprint()
                        .map(|v| json_to_text(&v))
                        .unwrap_or_default();
                    match parts.last_mut() {
                        Some(SealedPart::Text(t)) => t.push_str(&text),
                        _ => parts.push(SealedPart::Text(text)),
                    }
                }
            }
        }
        if sealed {
            Resolved::Secret(SealedString { parts })
        } else {
            let text: String = parts
                .into_iter()
                .map(|p| match p {
                    SealedPart::Text(t) => t,
                    SealedPart::Secret(_) => String::new(),
                })
                .collect();
            Resolved::Value(serde_json::Value::String(text))
        }
    }
}

/// Render a JSON value as interpolation text.
pub fn json_to_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A fingerprint string that stands for a secret.
pub fn is_sensitive_fingerprint(v: &serde_json::Value) -> bool {
    v.as_str().is_some_and(|s| s.starts_with(SENSITIVE_PREFIX))
}

/// Fingerprint contains a secret anywhere.
pub fn contains_sensitive(v: &serde_json::Value) -> bool {
    match v {
        serde_json::Value::Array(items) => items.iter().any(contains_sensitive),
        serde_json::Value::Object(map) => map.values().any(contains_sensitive),
        other => is_sensitive_fingerprint(other),
    }
}

/// Prefix for secret fingerprints.
pub fn sensitive_fingerprint(hash: &str) -> String {
    format!("{}{}", SENSITIVE_PREFIX, hash)
}
