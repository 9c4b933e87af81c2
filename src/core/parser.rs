//! GT-006: Declaration loading. YAML parsing, validation and binding.
//!
//! Parses gantry.yaml and checks it against the provider schemas:
//! - Version must be "1.0"
//! - Stack, alias and logical names must be well formed
//! - Resource identities (type + logical name) must be unique
//! - Properties must be known, present when required and of the right kind
//! - References must name declared resources, outputs, aliases and params
//! - The dependency graph must be acyclic
//!
//! Loading is pure: no provider calls, no state access.

use super::error::GantryError;
use super::resolver::build_execution_order;
use super::types::*;
use super::value::{parse_placeholders, PropertyValue, RawSegment, Reference, Segment, Template};
use indexmap::IndexMap;
use regex::Regex;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("static regex"));

static STACK_SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("static regex"));

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a declaration from a string.
pub fn parse_declaration(yaml: &str) -> Result<Declaration, GantryError> {
    serde_yaml_ng::from_str(yaml)
        .map_err(|e| GantryError::MalformedDeclaration(format!("YAML parse error: {}", e)))
}

/// Parse a declaration file from disk.
pub fn parse_declaration_file(path: &Path) -> Result<Declaration, GantryError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        GantryError::MalformedDeclaration(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_declaration(&content)
        .map_err(|e| GantryError::MalformedDeclaration(format!("{}: {}", path.display(), strip_kind(&e))))
}

fn strip_kind(e: &GantryError) -> String {
    match e {
        GantryError::MalformedDeclaration(m) => m.clone(),
        other => other.to_string(),
    }
}

/// Validate a parsed declaration. Returns every problem (empty = valid).
pub fn validate_declaration(decl: &Declaration) -> Vec<ValidationError> {
    match Binder::new(decl).bind(PathBuf::from(".")) {
        Ok(_) => Vec::new(),
        Err(errors) => errors,
    }
}

/// Load a declaration string into a validated resource graph.
pub fn load_declaration(yaml: &str) -> Result<ResourceGraph, GantryError> {
    let decl = parse_declaration(yaml)?;
    bind_declaration(&decl, PathBuf::from("."))
}

/// Load one or more declaration files describing a single stack.
/// Asset paths are relative to the first file's directory.
pub fn load_declaration_files(paths: &[PathBuf]) -> Result<ResourceGraph, GantryError> {
    let first = paths
        .first()
        .ok_or_else(|| GantryError::MalformedDeclaration("no declaration files given".to_string()))?;
    let base_dir = first
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let decls = paths
        .iter()
        .map(|p| parse_declaration_file(p))
        .collect::<Result<Vec<_>, _>>()?;
    check_duplicates(decls.iter().flat_map(|d| d.resources.iter()))?;
    let merged = merge_declarations(decls)?;
    bind_declaration(&merged, base_dir)
}

/// Validate and bind a parsed declaration.
pub fn bind_declaration(decl: &Declaration, base_dir: PathBuf) -> Result<ResourceGraph, GantryError> {
    check_duplicates(decl.resources.iter())?;
    let graph = Binder::new(decl).bind(base_dir).map_err(|errors| {
        GantryError::MalformedDeclaration(
            errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        )
    })?;
    build_execution_order(&graph)?;
    Ok(graph)
}

/// First repeated `type:name`, if any.
fn check_duplicates<'a>(resources: impl Iterator<Item = &'a DeclaredResource>) -> Result<(), GantryError> {
    let mut seen = rustc_hash::FxHashSet::default();
    for r in resources {
        let key = ResourceKey::new(r.resource_type, r.logical_name.clone());
        if !seen.insert(key.clone()) {
            return Err(GantryError::DuplicateIdentity(key));
        }
    }
    Ok(())
}

/// Merge the files of one stack. Names must agree; map sections are merged
/// and a key defined twice is an error; policy comes from the first file.
pub fn merge_declarations(decls: Vec<Declaration>) -> Result<Declaration, GantryError> {
    let mut iter = decls.into_iter();
    let mut merged = iter
        .next()
        .ok_or_else(|| GantryError::MalformedDeclaration("no declarations to merge".to_string()))?;
    for decl in iter {
        if decl.name != merged.name {
            return Err(GantryError::MalformedDeclaration(format!(
                "declarations name different stacks: '{}' and '{}'",
                merged.name, decl.name
            )));
        }
        if decl.version != merged.version {
            return Err(GantryError::MalformedDeclaration(format!(
                "declarations use different versions: \"{}\" and \"{}\"",
                merged.version, decl.version
            )));
        }
        merge_map(&mut merged.params, decl.params, "param")?;
        merge_map(&mut merged.stacks, decl.stacks, "stack alias")?;
        merge_map(&mut merged.lookups, decl.lookups, "lookup")?;
        merge_map(&mut merged.exports, decl.exports, "export")?;
        merged.resources.extend(decl.resources);
        if merged.description.is_none() {
            merged.description = decl.description;
        }
    }
    Ok(merged)
}

fn merge_map<V>(into: &mut IndexMap<String, V>, from: IndexMap<String, V>, what: &str) -> Result<(), GantryError> {
    for (k, v) in from {
        if into.contains_key(&k) {
            return Err(GantryError::MalformedDeclaration(format!("{} '{}' defined twice", what, k)));
        }
        into.insert(k, v);
    }
    Ok(())
}

// ============================================================================
// Binding
// ============================================================================

/// Where a value is being bound.
#[derive(Clone, Copy)]
enum Site<'a> {
    Property(&'a ResourceKey),
    Export,
    Lookup,
}

struct Binder<'a> {
    decl: &'a Declaration,
    by_name: FxHashMap<&'a str, Vec<ResourceKey>>,
    errors: Vec<ValidationError>,
}

impl<'a> Binder<'a> {
    fn new(decl: &'a Declaration) -> Self {
        let mut by_name: FxHashMap<&str, Vec<ResourceKey>> = FxHashMap::default();
        for r in &decl.resources {
            let key = ResourceKey::new(r.resource_type, r.logical_name.clone());
            let entry = by_name.entry(r.logical_name.as_str()).or_default();
            if !entry.contains(&key) {
                entry.push(key);
            }
        }
        Self {
            decl,
            by_name,
            errors: Vec::new(),
        }
    }

    fn error(&mut self, message: String) {
        self.errors.push(ValidationError { message });
    }

    fn bind(mut self, base_dir: PathBuf) -> Result<ResourceGraph, Vec<ValidationError>> {
        let decl = self.decl;
        if decl.version != "1.0" {
            self.error(format!("version must be \"1.0\", got \"{}\"", decl.version));
        }
        self.check_stack_name(&decl.name);
        for (alias, system) in &decl.stacks {
            if !NAME_RE.is_match(alias) {
                self.error(format!("invalid stack alias '{}'", alias));
            }
            if system.is_empty() || !system.split('/').all(|s| STACK_SEGMENT_RE.is_match(s)) {
                self.error(format!("stack alias '{}' has invalid system id '{}'", alias, system));
            }
        }

        let mut lookups = IndexMap::new();
        for (name, declared) in &decl.lookups {
            if !NAME_RE.is_match(name) {
                self.error(format!("invalid lookup name '{}'", name));
            }
            let context = format!("lookup '{}' id", name);
            let Some(id) = self.bind_value(&declared.id, Site::Lookup, &context) else {
                continue;
            };
            if id.references().iter().any(|r| !matches!(r, Reference::Stack { .. })) {
                self.error(format!("{}: may only use params and stack outputs", context));
            }
            lookups.insert(
                name.clone(),
                Lookup {
                    resource_type: declared.resource_type,
                    id,
                },
            );
        }

        let mut resources = IndexMap::new();
        for r in &decl.resources {
            let key = ResourceKey::new(r.resource_type, r.logical_name.clone());
            if !NAME_RE.is_match(&r.logical_name) {
                self.error(format!(
                    "resource '{}': logical name must match {}",
                    key,
                    NAME_RE.as_str()
                ));
            }
            let node = self.bind_resource(&key, r);
            resources.insert(key, node);
        }

        let mut exports = IndexMap::new();
        for (name, raw) in &decl.exports {
            if let Some(value) = self.bind_value(raw, Site::Export, &format!("export '{}'", name)) {
                if value.contains_secret() {
                    self.error(format!("export '{}' must not contain a secret", name));
                }
                exports.insert(name.clone(), value);
            }
        }

        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        Ok(ResourceGraph {
            name: decl.name.clone(),
            description: decl.description.clone(),
            stacks: decl.stacks.clone(),
            lookups,
            resources,
            exports,
            policy: decl.policy.clone(),
            base_dir,
        })
    }

    fn check_stack_name(&mut self, name: &str) {
        if name.is_empty() {
            self.error("name must not be empty".to_string());
        } else if !name.split('/').all(|s| STACK_SEGMENT_RE.is_match(s)) {
            self.error(format!("invalid stack name '{}'", name));
        }
    }

    fn bind_resource(&mut self, key: &ResourceKey, r: &DeclaredResource) -> ResourceNode {
        let schema = r.resource_type.schema();
        let mut properties = IndexMap::new();
        for (name, raw) in &r.properties {
            let context = format!("resource '{}' property '{}'", key, name);
            if let Some(value) = self.bind_value(raw, Site::Property(key), &context) {
                properties.insert(name.clone(), value);
            }
        }
        for message in schema.validate(&properties) {
            self.error(format!("resource '{}': {}", key, message));
        }

        let mut depends_on: Vec<ResourceKey> = Vec::new();
        for dep in &r.depends_on {
            match self.lookup_target(dep) {
                Ok(target) if &target == key => {
                    self.error(format!("resource '{}' depends on itself", key));
                }
                Ok(target) => {
                    if !depends_on.contains(&target) {
                        depends_on.push(target);
                    }
                }
                Err(reason) => self.error(format!("resource '{}' depends on {}", key, reason)),
            }
        }
        for value in properties.values() {
            for reference in value.references() {
                if let Reference::Output { target, .. } = reference {
                    if !depends_on.contains(target) {
                        depends_on.push(target.clone());
                    }
                }
            }
        }

        ResourceNode {
            key: key.clone(),
            properties,
            depends_on,
        }
    }

    /// Resolve a bare `name` or `type:name` to a declared resource.
    fn lookup_target(&self, target: &str) -> Result<ResourceKey, String> {
        if target.contains(':') {
            let key: ResourceKey = target.parse()?;
            return match self.by_name.get(key.name.as_str()) {
                Some(keys) if keys.contains(&key) => Ok(key),
                _ => Err(format!("unknown resource '{}'", target)),
            };
        }
        match self.by_name.get(target).map(Vec::as_slice) {
            None | Some([]) => Err(format!("unknown resource '{}'", target)),
            Some([key]) => Ok(key.clone()),
            Some(keys) => Err(format!(
                "ambiguous resource '{}' (one of: {})",
                target,
                keys.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            )),
        }
    }

    fn bind_value(&mut self, raw: &serde_yaml_ng::Value, site: Site<'_>, context: &str) -> Option<PropertyValue> {
        use serde_yaml_ng::Value as Y;
        match raw {
            Y::String(s) => self.bind_string(s, site, context),
            Y::Sequence(items) => {
                // Bind every item so that all problems are reported.
                let bound: Vec<Option<PropertyValue>> =
                    items.iter().map(|i| self.bind_value(i, site, context)).collect();
                bound.into_iter().collect::<Option<Vec<_>>>().map(PropertyValue::List)
            }
            Y::Mapping(map) => {
                let mut out = IndexMap::with_capacity(map.len());
                let mut ok = true;
                for (k, v) in map {
                    let Some(k) = k.as_str() else {
                        self.error(format!("{}: map keys must be strings", context));
                        ok = false;
                        continue;
                    };
                    match self.bind_value(v, site, context) {
                        Some(value) => {
                            out.insert(k.to_string(), value);
                        }
                        None => ok = false,
                    }
                }
                ok.then_some(PropertyValue::Map(out))
            }
            Y::Tagged(t) => self.bind_value(&t.value, site, context),
            scalar => match serde_json::to_value(scalar) {
                Ok(v) => Some(PropertyValue::Literal(v)),
                Err(e) => {
                    self.error(format!("{}: {}", context, e));
                    None
                }
            },
        }
    }

    fn bind_string(&mut self, s: &str, site: Site<'_>, context: &str) -> Option<PropertyValue> {
        let raw = match parse_placeholders(s) {
            Ok(raw) => raw,
            Err(e) => {
                self.error(format!("{}: {}", context, e));
                return None;
            }
        };

        // A value that is exactly one param keeps the param's own type.
        if let [RawSegment::Placeholder(expr)] = raw.as_slice() {
            if let Some(param) = expr.strip_prefix("params.") {
                return match self.decl.params.get(param) {
                    Some(v) => match serde_json::to_value(v) {
                        Ok(v) => Some(PropertyValue::Literal(v)),
                        Err(e) => {
                            self.error(format!("{}: param '{}': {}", context, param, e));
                            None
                        }
                    },
                    None => {
                        self.error(format!("{}: unknown param '{}'", context, param));
                        None
                    }
                };
            }
        }

        let mut segments: Vec<Segment> = Vec::new();
        let mut ok = true;
        for piece in raw {
            let text = match piece {
                RawSegment::Text(t) => t,
                RawSegment::Placeholder(expr) => match self.bind_placeholder(&expr, site) {
                    Ok(Binding::Text(t)) => t,
                    Ok(Binding::Ref(r)) => {
                        segments.push(Segment::Ref(r));
                        continue;
                    }
                    Err(reason) => {
                        self.error(format!("{}: {}", context, reason));
                        ok = false;
                        continue;
                    }
                },
            };
            match segments.last_mut() {
                Some(Segment::Text(prev)) => prev.push_str(&text),
                _ => segments.push(Segment::Text(text)),
            }
        }
        if !ok {
            return None;
        }
        match segments.as_slice() {
            [] => Some(PropertyValue::Literal(serde_json::Value::String(String::new()))),
            [Segment::Text(t)] => Some(PropertyValue::Literal(serde_json::Value::String(t.clone()))),
            _ => Some(PropertyValue::Template(Template { segments })),
        }
    }

    fn bind_placeholder(&self, expr: &str, site: Site<'_>) -> Result<Binding, String> {
        let (namespace, rest) = expr
            .split_once('.')
            .ok_or_else(|| format!("invalid placeholder '{}'", expr))?;
        match namespace {
            "params" => self
                .decl
                .params
                .get(rest)
                .map(|v| Binding::Text(yaml_value_to_string(v)))
                .ok_or_else(|| format!("unknown param '{}'", rest)),
            "ref" => {
                let (target, attribute) = rest
                    .split_once('.')
                    .filter(|(t, a)| !t.is_empty() && !a.is_empty())
                    .ok_or_else(|| format!("invalid reference '{}': expected ref.<resource>.<output>", expr))?;
                let key = self.lookup_target(target)?;
                if let Site::Property(own) = site {
                    if own == &key {
                        return Err(format!("'{}' references itself", expr));
                    }
                }
                if !key.resource_type.schema().has_output(attribute) {
                    return Err(format!(
                        "{} has no output '{}' (outputs: {})",
                        key,
                        attribute,
                        key.resource_type.schema().outputs.join(", ")
                    ));
                }
                Ok(Binding::Ref(Reference::Output {
                    target: key,
                    attribute: attribute.to_string(),
                }))
            }
            "stack" => {
                let (alias, output) = rest
                    .split_once('.')
                    .filter(|(a, o)| !a.is_empty() && !o.is_empty())
                    .ok_or_else(|| format!("invalid stack reference '{}': expected stack.<alias>.<output>", expr))?;
                if !self.decl.stacks.contains_key(alias) {
                    return Err(format!("undeclared stack alias '{}'", alias));
                }
                Ok(Binding::Ref(Reference::Stack {
                    alias: alias.to_string(),
                    output: output.to_string(),
                }))
            }
            "lookup" => {
                let (name, attribute) = rest
                    .split_once('.')
                    .filter(|(n, a)| !n.is_empty() && !a.is_empty())
                    .ok_or_else(|| format!("invalid lookup reference '{}': expected lookup.<name>.<output>", expr))?;
                let lookup = self
                    .decl
                    .lookups
                    .get(name)
                    .ok_or_else(|| format!("undeclared lookup '{}'", name))?;
                let schema = lookup.resource_type.schema();
                if !schema.has_output(attribute) {
                    return Err(format!(
                        "lookup '{}' ({}) has no output '{}' (outputs: {})",
                        name,
                        lookup.resource_type,
                        attribute,
                        schema.outputs.join(", ")
                    ));
                }
                Ok(Binding::Ref(Reference::Lookup {
                    name: name.to_string(),
                    attribute: attribute.to_string(),
                }))
            }
            "secret" if !rest.is_empty() => Ok(Binding::Ref(Reference::Secret { key: rest.to_string() })),
            _ => Err(format!("unknown placeholder '{}'", expr)),
        }
    }
}

enum Binding {
    Text(String),
    Ref(Reference),
}
