//! GT-005: Dependency DAG, topological order and reference resolution.
//!
//! Topological order uses Kahn's algorithm with deterministic (alphabetical)
//! tie-breaking. Reference resolution runs in two steps: external lookups
//! (stack outputs, secrets, live provider reads) are fetched asynchronously,
//! then a node's properties are resolved synchronously against a view of
//! dependency outputs.

use super::error::GantryError;
use super::schema::{PropertyKind, ResourceSchema};
use super::types::{Lookup, Outputs, ResourceGraph, ResourceKey};
use super::value::{PropertyValue, Reference, Resolved, SealedPart, SealedString, Segment};
use crate::core::retry::Backoff;
use crate::journal::hasher;
use crate::provider::{CachedReads, ProviderRegistry};
use crate::secrets::{SecretHandle, SecretStore};
use crate::stack::{CachedStacks, StackResolver};
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeSet, VecDeque};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// Ordering
// ============================================================================

/// Kahn's algorithm over `node → dependencies`. Ready nodes are released in
/// sorted batches. Dependencies on keys outside the map are ignored.
/// On a cycle, returns the sorted nodes that could not be ordered.
pub fn topological_order<K>(deps: &IndexMap<K, Vec<K>>) -> Result<Vec<K>, Vec<K>>
where
    K: Clone + Eq + Hash + Ord,
{
    let mut in_degree: FxHashMap<&K, usize> = deps.keys().map(|k| (k, 0)).collect();
    let mut dependents: FxHashMap<&K, Vec<&K>> = FxHashMap::default();

    for (node, node_deps) in deps {
        let unique: FxHashSet<&K> = node_deps.iter().filter(|d| deps.contains_key(*d)).collect();
        for dep in unique {
            dependents.entry(dep).or_default().push(node);
            if let Some(d) = in_degree.get_mut(node) {
                *d += 1;
            }
        }
    }

    let mut zero: Vec<&K> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(k, _)| *k)
        .collect();
    zero.sort();
    let mut queue: VecDeque<&K> = zero.into_iter().collect();

    let mut order = Vec::with_capacity(deps.len());
    while let Some(current) = queue.pop_front() {
        order.push(current.clone());
        let mut next_ready = Vec::new();
        for &next in dependents.get(current).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    next_ready.push(next);
                }
            }
        }
        next_ready.sort();
        queue.extend(next_ready);
    }

    if order.len() != deps.len() {
        let ordered: FxHashSet<&K> = order.iter().collect();
        let mut remaining: Vec<K> = deps
            .keys()
            .filter(|k| !ordered.contains(k))
            .cloned()
            .collect();
        remaining.sort();
        return Err(remaining);
    }
    Ok(order)
}

/// Execution order of a graph's declared resources.
pub fn build_execution_order(graph: &ResourceGraph) -> Result<Vec<ResourceKey>, GantryError> {
    let deps: IndexMap<ResourceKey, Vec<ResourceKey>> = graph
        .resources
        .iter()
        .map(|(k, n)| (k.clone(), n.depends_on.clone()))
        .collect();
    topological_order(&deps).map_err(|cycle| {
        GantryError::MalformedDeclaration(format!(
            "dependency cycle detected involving: {}",
            cycle
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ))
    })
}

/// Every node that transitively depends on `start`.
pub fn transitive_dependents<K>(start: &K, deps: &IndexMap<K, Vec<K>>) -> BTreeSet<K>
where
    K: Clone + Eq + Hash + Ord,
{
    let mut out = BTreeSet::new();
    let mut frontier = vec![start.clone()];
    while let Some(current) = frontier.pop() {
        for (node, node_deps) in deps {
            if node_deps.contains(&current) && out.insert(node.clone()) {
                frontier.push(node.clone());
            }
        }
    }
    out
}

// ============================================================================
// Reference resolution
// ============================================================================

/// Outputs visible to a node while resolving: dependency key → outputs.
/// A missing entry means the dependency's outputs are not known yet.
pub type OutputView = FxHashMap<ResourceKey, Outputs>;

/// Whether unknown local outputs are tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Unknown outputs become `Resolved::Unknown`
    Plan,
    /// Every dependency has converged; unknown outputs are errors
    Apply,
}

/// Results of external lookups for one node.
#[derive(Debug, Default)]
pub struct External {
    stacks: FxHashMap<(String, String), Result<serde_json::Value, String>>,
    secrets: FxHashMap<String, Result<SecretHandle, GantryError>>,
    lookups: FxHashMap<String, Result<Outputs, String>>,
}

/// Resolves property values and exports for one stack.
pub struct ReferenceResolver {
    aliases: IndexMap<String, String>,
    lookups: IndexMap<String, Lookup>,
    base_dir: PathBuf,
    backoff: Backoff,
    stacks: CachedStacks,
    secrets: Arc<dyn SecretStore>,
    reads: Option<CachedReads>,
}

impl ReferenceResolver {
    pub fn new(graph: &ResourceGraph, stacks: Arc<dyn StackResolver>, secrets: Arc<dyn SecretStore>) -> Self {
        let backoff = Backoff::from_policy(&graph.policy);
        Self {
            aliases: graph.stacks.clone(),
            lookups: graph.lookups.clone(),
            base_dir: graph.base_dir.clone(),
            backoff,
            stacks: CachedStacks::new(stacks, backoff),
            secrets,
            reads: None,
        }
    }

    /// Read `{{lookup.*}}` resources through these providers. Without them
    /// every lookup reference is unresolved.
    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.reads = Some(CachedReads::new(providers, self.backoff));
        self
    }

    /// Fetch every stack output and secret referenced by `values`.
    pub async fn prefetch<'a>(&self, values: impl IntoIterator<Item = &'a PropertyValue>) -> External {
        let mut external = External::default();
        for value in values {
            for reference in value.references() {
                match reference {
                    Reference::Stack { alias, output } => {
                        let result = self.stack_output(alias, output).await;
                        external.stacks.insert((alias.clone(), output.clone()), result);
                    }
                    Reference::Lookup { name, .. } => {
                        if !external.lookups.contains_key(name) {
                            let result = self.read_lookup(name).await;
                            external.lookups.insert(name.clone(), result);
                        }
                    }
                    Reference::Secret { key } => {
                        if !external.secrets.contains_key(key) {
                            external
                                .secrets
                                .insert(key.clone(), self.secrets.require_secret(key));
                        }
                    }
                    Reference::Output { .. } => {}
                }
            }
        }
        external
    }

    async fn stack_output(&self, alias: &str, output: &str) -> Result<serde_json::Value, String> {
        match self.aliases.get(alias) {
            Some(system) => self.stacks.lookup(system, output).await,
            None => Err(format!("undeclared stack alias '{}'", alias)),
        }
    }

    /// Resolve a lookup's id, then read the resource from its provider.
    async fn read_lookup(&self, name: &str) -> Result<Outputs, String> {
        let lookup = self
            .lookups
            .get(name)
            .ok_or_else(|| format!("undeclared lookup '{}'", name))?;
        let mut external = External::default();
        for reference in lookup.id.references() {
            if let Reference::Stack { alias, output } = reference {
                let result = self.stack_output(alias, output).await;
                external.stacks.insert((alias.clone(), output.clone()), result);
            }
        }
        let id = self
            .resolve_value(&lookup.id, &OutputView::default(), &external, ResolveMode::Apply)
            .map_err(|e| e.to_string())?;
        let Resolved::Value(serde_json::Value::String(id)) = id else {
            return Err(format!("lookup '{}' id is not a string", name));
        };
        let reads = self
            .reads
            .as_ref()
            .ok_or_else(|| format!("no provider to read lookup '{}'", name))?;
        reads.read(lookup.resource_type, &id).await
    }

    /// Resolve a node's properties against dependency outputs.
    pub fn resolve_properties(
        &self,
        schema: &ResourceSchema,
        properties: &IndexMap<String, PropertyValue>,
        view: &OutputView,
        external: &External,
        mode: ResolveMode,
    ) -> Result<IndexMap<String, Resolved>, GantryError> {
        let mut out = IndexMap::with_capacity(properties.len());
        for (name, value) in properties {
            let mut resolved = self.resolve_value(value, view, external, mode)?;
            if schema.property(name).is_some_and(|p| p.kind == PropertyKind::Asset) {
                resolved = self.resolve_asset(resolved)?;
            }
            out.insert(name.clone(), resolved);
        }
        Ok(out)
    }

    /// Prefetch and resolve in one step.
    pub async fn resolve_node(
        &self,
        schema: &ResourceSchema,
        properties: &IndexMap<String, PropertyValue>,
        view: &OutputView,
        mode: ResolveMode,
    ) -> Result<IndexMap<String, Resolved>, GantryError> {
        let external = self.prefetch(properties.values()).await;
        self.resolve_properties(schema, properties, view, &external, mode)
    }

    /// Resolve the graph's exports. Exports whose inputs did not converge
    /// are left out.
    pub async fn resolve_exports(
        &self,
        exports: &IndexMap<String, PropertyValue>,
        view: &OutputView,
    ) -> IndexMap<String, serde_json::Value> {
        let external = self.prefetch(exports.values()).await;
        let mut out = IndexMap::new();
        for (name, value) in exports {
            match self
                .resolve_value(value, view, &external, ResolveMode::Plan)
                .map(|r| r.fingerprint())
            {
                Ok(Some(v)) => {
                    out.insert(name.clone(), v);
                }
                Ok(None) => tracing::warn!(export = %name, "export not known, not published"),
                Err(e) => tracing::warn!(export = %name, error = %e, "export not resolved"),
            }
        }
        out
    }

    fn resolve_value(
        &self,
        value: &PropertyValue,
        view: &OutputView,
        external: &External,
        mode: ResolveMode,
    ) -> Result<Resolved, GantryError> {
        match value {
            PropertyValue::Literal(v) => Ok(Resolved::Value(v.clone())),
            PropertyValue::List(items) => items
                .iter()
                .map(|i| self.resolve_value(i, view, external, mode))
                .collect::<Result<Vec<_>, _>>()
                .map(Resolved::List),
            PropertyValue::Map(entries) => {
                let mut map = IndexMap::with_capacity(entries.len());
                for (k, v) in entries {
                    map.insert(k.clone(), self.resolve_value(v, view, external, mode)?);
                }
                Ok(Resolved::Map(map))
            }
            PropertyValue::Template(t) => {
                let mut pieces = Vec::with_capacity(t.segments.len());
                for segment in &t.segments {
                    pieces.push(match segment {
                        Segment::Text(s) => Resolved::Value(serde_json::Value::String(s.clone())),
                        Segment::Ref(r) => self.resolve_reference(r, view, external, mode)?,
                    });
                }
                if t.is_single_reference() {
                    Ok(pieces.pop().unwrap_or(Resolved::Unknown))
                } else {
                    Ok(Resolved::concat(pieces))
                }
            }
        }
    }

    fn resolve_reference(
        &self,
        reference: &Reference,
        view: &OutputView,
        external: &External,
        mode: ResolveMode,
    ) -> Result<Resolved, GantryError> {
        match reference {
            Reference::Output { target, attribute } => match view.get(target) {
                None if mode == ResolveMode::Plan => Ok(Resolved::Unknown),
                None => Err(GantryError::unresolved(
                    reference.to_string(),
                    format!("{} has not produced outputs", target),
                )),
                Some(outputs) => outputs
                    .get(attribute)
                    .cloned()
                    .map(Resolved::Value)
                    .ok_or_else(|| {
                        GantryError::unresolved(
                            reference.to_string(),
                            format!("{} did not report '{}'", target, attribute),
                        )
                    }),
            },
            Reference::Stack { alias, output } => match external.stacks.get(&(alias.clone(), output.clone())) {
                Some(Ok(v)) => Ok(Resolved::Value(v.clone())),
                Some(Err(reason)) => Err(GantryError::unresolved(reference.to_string(), reason.clone())),
                None => Err(GantryError::unresolved(reference.to_string(), "not fetched")),
            },
            Reference::Lookup { name, attribute } => match external.lookups.get(name) {
                Some(Ok(outputs)) => outputs
                    .get(attribute)
                    .cloned()
                    .map(Resolved::Value)
                    .ok_or_else(|| {
                        GantryError::unresolved(
                            reference.to_string(),
                            format!("lookup '{}' did not report '{}'", name, attribute),
                        )
                    }),
                Some(Err(reason)) => Err(GantryError::unresolved(reference.to_string(), reason.clone())),
                None => Err(GantryError::unresolved(reference.to_string(), "not fetched")),
            },
            Reference::Secret { key } => match external.secrets.get(key) {
                Some(Ok(handle)) => Ok(Resolved::Secret(SealedString {
                    parts: vec![SealedPart::Secret(handle.clone())],
                })),
                Some(Err(e)) => Err(e.clone()),
                None => Err(GantryError::MissingSecret(key.clone())),
            },
        }
    }

    /// Replace an asset path by `{path, hash}` so content changes are diffed.
    fn resolve_asset(&self, value: Resolved) -> Result<Resolved, GantryError> {
        let Resolved::Value(serde_json::Value::String(path)) = value else {
            return Ok(value);
        };
        let full = resolve_asset_path(&self.base_dir, &path);
        let hash = hasher::hash_path(&full)
            .map_err(|e| GantryError::unresolved(format!("asset {}", path), e))?;
        Ok(Resolved::Value(serde_json::json!({ "path": path, "hash": hash })))
    }
}

fn resolve_asset_path(base_dir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::load_declaration;
    use crate::core::types::ResourceType;
    use crate::secrets::{MemorySource, SealingStore, SecretVault};
    use crate::stack::StaticStackResolver;
    use proptest::prelude::*;
    use serde_json::json;

    fn key(ty: ResourceType, name: &str) -> ResourceKey {
        ResourceKey::new(ty, name)
    }

    #[test]
    fn test_gt005_topo_linear_and_tiebreak() {
        let deps: IndexMap<&str, Vec<&str>> = IndexMap::from([
            ("c", vec!["b"]),
            ("b", vec!["a"]),
            ("a", vec![]),
            ("z", vec![]),
            ("m", vec![]),
        ]);
        assert_eq!(topological_order(&deps).unwrap(), vec!["a", "m", "z", "b", "c"]);
    }

    #[test]
    fn test_gt005_topo_cycle() {
        let deps: IndexMap<&str, Vec<&str>> =
            IndexMap::from([("a", vec!["b"]), ("b", vec!["a"]), ("c", vec![])]);
        assert_eq!(topological_order(&deps).unwrap_err(), vec!["a", "b"]);
    }

    #[test]
    fn test_gt005_transitive_dependents() {
        let deps: IndexMap<&str, Vec<&str>> = IndexMap::from([
            ("role", vec![]),
            ("fn", vec!["role"]),
            ("perm", vec!["fn"]),
            ("table", vec![]),
        ]);
        let d = transitive_dependents(&"role", &deps);
        assert_eq!(d.into_iter().collect::<Vec<_>>(), vec!["fn", "perm"]);
    }

    #[test]
    fn test_gt005_build_execution_order() {
        let graph = load_declaration(
            r#"
version: "1.0"
name: api
resources:
  - type: lambda_function
    logicalName: fn
    properties: {role: "{{ref.role.arn}}", runtime: go1.x, handler: api, code: /dev/null}
  - type: iam_role
    logicalName: role
    properties: {assume_role_service: lambda.amazonaws.com}
"#,
        )
        .unwrap();
        let order = build_execution_order(&graph).unwrap();
        assert_eq!(
            order,
            vec![key(ResourceType::IamRole, "role"), key(ResourceType::LambdaFunction, "fn")]
        );
    }

    fn resolver(graph: &ResourceGraph) -> ReferenceResolver {
        let stacks = StaticStackResolver::default().with("org/core", "collectorHostname", json!("otel.local"));
        let secrets = SealingStore::new(
            SecretVault::generate(),
            MemorySource::default().with("openai-api-key", "sk-plain-text"),
        );
        ReferenceResolver::new(graph, Arc::new(stacks), Arc::new(secrets))
    }

    const FN_DECL: &str = r#"
version: "1.0"
name: api
stacks: {core: org/core}
resources:
  - type: iam_role
    logicalName: role
    properties: {assume_role_service: lambda.amazonaws.com}
  - type: lambda_function
    logicalName: fn
    properties:
      role: "{{ref.role.arn}}"
      runtime: go1.x
      handler: api
      code: /dev/null
      environment:
        OTEL_ENDPOINT: "http://{{stack.core.collectorHostname}}:4318"
        OPENAI_API_KEY: "{{secret.openai-api-key}}"
"#;

    #[tokio::test]
    async fn test_gt005_resolve_plan_mode_unknown() {
        let graph = load_declaration(FN_DECL).unwrap();
        let r = resolver(&graph);
        let node = &graph.resources[&key(ResourceType::LambdaFunction, "fn")];
        let props = r
            .resolve_node(
                ResourceType::LambdaFunction.schema(),
                &node.properties,
                &OutputView::default(),
                ResolveMode::Plan,
            )
            .await
            .unwrap();
        assert!(!props["role"].is_known());
        let env = props["environment"].fingerprint().unwrap();
        assert_eq!(env["OTEL_ENDPOINT"], json!("http://otel.local:4318"));
        assert!(env["OPENAI_API_KEY"].as_str().unwrap().starts_with("sensitive:"));
        assert!(!env.to_string().contains("sk-plain-text"));
    }

    #[tokio::test]
    async fn test_gt005_resolve_apply_mode() {
        let graph = load_declaration(FN_DECL).unwrap();
        let r = resolver(&graph);
        let node = &graph.resources[&key(ResourceType::LambdaFunction, "fn")];
        let schema = ResourceType::LambdaFunction.schema();

        let err = r
            .resolve_node(schema, &node.properties, &OutputView::default(), ResolveMode::Apply)
            .await
            .unwrap_err();
        assert!(matches!(err, GantryError::UnresolvedReference { .. }));

        let mut view = OutputView::default();
        view.insert(
            key(ResourceType::IamRole, "role"),
            Outputs::from([("arn".to_string(), json!("arn:local:iam::role/r"))]),
        );
        let props = r
            .resolve_node(schema, &node.properties, &view, ResolveMode::Apply)
            .await
            .unwrap();
        assert_eq!(props["role"].fingerprint(), Some(json!("arn:local:iam::role/r")));
        assert_eq!(
            props["environment"].reveal().unwrap()["OPENAI_API_KEY"],
            json!("sk-plain-text")
        );
        let code = props["code"].fingerprint().unwrap();
        assert_eq!(code["path"], json!("/dev/null"));
        assert!(code["hash"].as_str().unwrap().starts_with("blake3:"));
    }

    #[tokio::test]
    async fn test_gt005_missing_secret_and_stack() {
        let graph = load_declaration(FN_DECL).unwrap();
        let node = &graph.resources[&key(ResourceType::LambdaFunction, "fn")];
        let r = ReferenceResolver::new(
            &graph,
            Arc::new(StaticStackResolver::default()),
            Arc::new(SealingStore::new(SecretVault::generate(), MemorySource::default())),
        );
        let err = r
            .resolve_node(
                ResourceType::LambdaFunction.schema(),
                &node.properties,
                &OutputView::default(),
                ResolveMode::Plan,
            )
            .await
            .unwrap_err();
        // Map entries resolve in declaration order: the stack output fails first.
        assert!(matches!(err, GantryError::UnresolvedReference { ref reference, .. } if reference == "stack.core.collectorHostname"));
    }

    #[tokio::test]
    async fn test_gt005_asset_hash_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("api.zip"), "v1").unwrap();
        let mut graph = load_declaration(
            r#"
version: "1.0"
name: api
resources:
  - type: lambda_function
    logicalName: fn
    properties: {role: arn:local:iam::role/r, runtime: go1.x, handler: api, code: api.zip}
"#,
        )
        .unwrap();
        graph.base_dir = dir.path().to_path_buf();
        let r = resolver(&graph);
        let node = graph.resources[&key(ResourceType::LambdaFunction, "fn")].clone();
        let schema = ResourceType::LambdaFunction.schema();
        let view = OutputView::default();

        let first = r.resolve_node(schema, &node.properties, &view, ResolveMode::Plan).await.unwrap();
        std::fs::write(dir.path().join("api.zip"), "v2").unwrap();
        let second = r.resolve_node(schema, &node.properties, &view, ResolveMode::Plan).await.unwrap();
        assert_ne!(first["code"].fingerprint(), second["code"].fingerprint());

        std::fs::remove_file(dir.path().join("api.zip")).unwrap();
        assert!(r.resolve_node(schema, &node.properties, &view, ResolveMode::Plan).await.is_err());
    }

    proptest! {
        /// Every edge of a random DAG is respected by the computed order.
        #[test]
        fn topological_order_respects_edges(
            n in 1usize..24,
            edges in proptest::collection::vec((0usize..24, 0usize..24), 0..60),
        ) {
            let mut deps: IndexMap<usize, Vec<usize>> = (0..n).map(|i| (i, Vec::new())).collect();
            for (a, b) in edges {
                let (a, b) = (a % n, b % n);
                if a < b {
                    deps[b].push(a);
                }
            }
            let order = topological_order(&deps).unwrap();
            prop_assert_eq!(order.len(), n);
            let pos: FxHashMap<usize, usize> = order.iter().enumerate().map(|(i, k)| (*k, i)).collect();
            for (node, node_deps) in &deps {
                for dep in node_deps {
                    prop_assert!(pos[dep] < pos[node]);
                }
            }
        }
    }
}
