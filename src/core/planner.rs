//! GT-009: Plan generation: diff declared properties against recorded state.
//!
//! Actions are derived in a fixed point over the dependency graph. A node
//! whose action is Create or Replace loses its recorded outputs, so every
//! reference to it becomes unknown and its dependents are decided again.
//! Outputs only ever disappear from the view, which bounds the iteration.

use super::error::GantryError;
use super::resolver::{
    build_execution_order, topological_order, transitive_dependents, External, OutputView,
    ReferenceResolver, ResolveMode,
};
use super::retry::{call_with_retry, Backoff};
use super::schema::ResourceSchema;
use super::state::StateStore;
use super::types::{
    ExecutionPlan, PlanAction, PlannedChange, PropertyChange, ReplaceStrategy, ResourceGraph,
    ResourceKey, ResourceNode, ResourceRecord, ShownValue,
};
use super::value::{contains_sensitive, Resolved};
use crate::journal::hasher;
use crate::provider::ProviderRegistry;
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, VecDeque};

/// Everything planning reads.
pub struct PlanContext<'a> {
    pub graph: &'a ResourceGraph,
    pub state: &'a StateStore,
    pub providers: &'a ProviderRegistry,
    pub resolver: &'a ReferenceResolver,
    /// Ask providers whether recorded identifiers still exist
    pub refresh: bool,
}

/// Action for one declared node.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: PlanAction,
    pub strategy: Option<ReplaceStrategy>,
    pub changes: Vec<PropertyChange>,
    pub blocked: Option<String>,
}

impl Decision {
    fn unresolved(record: Option<&ResourceRecord>, cause: String) -> Self {
        Self {
            action: if record.is_some() {
                PlanAction::Update
            } else {
                PlanAction::Create
            },
            strategy: None,
            changes: Vec::new(),
            blocked: Some(cause),
        }
    }

    fn invalidates_outputs(&self) -> bool {
        self.blocked.is_some() || matches!(self.action, PlanAction::Create | PlanAction::Replace)
    }
}

/// Generate an execution plan for one stack.
pub async fn plan(ctx: &PlanContext<'_>) -> Result<ExecutionPlan, GantryError> {
    let graph = ctx.graph;
    let order = build_execution_order(graph)?;
    let records = ctx.state.snapshot().await;
    let vanished = if ctx.refresh {
        refresh(ctx, &records).await?
    } else {
        FxHashSet::default()
    };

    let mut externals: FxHashMap<ResourceKey, External> = FxHashMap::default();
    for node in graph.resources.values() {
        let external = ctx.resolver.prefetch(node.properties.values()).await;
        externals.insert(node.key.clone(), external);
    }

    let live: FxHashMap<&ResourceKey, &ResourceRecord> = records
        .iter()
        .filter(|(k, _)| graph.resources.contains_key(*k) && !vanished.contains(*k))
        .collect();

    let mut decisions = settle(graph, &order, ctx.resolver, &externals, &live);

    // Operation graph: declared ops follow declared dependencies, deletes
    // follow what the records say depended on the deleted resource.
    let mut op_deps: IndexMap<ResourceKey, Vec<ResourceKey>> = graph
        .resources
        .values()
        .map(|n| (n.key.clone(), n.depends_on.clone()))
        .collect();
    let orphans: Vec<&ResourceRecord> = records
        .values()
        .filter(|r| !graph.resources.contains_key(&r.key()))
        .collect();
    for orphan in &orphans {
        let key = orphan.key();
        let deps: Vec<ResourceKey> = records
            .values()
            .filter(|r| r.depends_on.contains(&key))
            .map(ResourceRecord::key)
            .collect();
        op_deps.insert(key, deps);
    }
    // Deleting first means waiting until nothing recorded still uses it.
    for (key, decision) in &decisions {
        if decision.action == PlanAction::Replace
            && decision.strategy == Some(ReplaceStrategy::DeleteBeforeCreate)
        {
            let former = orphans
                .iter()
                .filter(|o| o.depends_on.contains(key))
                .map(|o| o.key());
            if let Some(deps) = op_deps.get_mut(key) {
                deps.extend(former);
            }
        }
    }
    // Replaced instances are deleted once every dependent has moved to the
    // new one, either in this run or in a later one if deletion failed.
    let mut retiring: Vec<(ResourceKey, Vec<String>)> = Vec::new();
    for node in graph.resources.values() {
        let key = &node.key;
        let mut ids = records.get(key).map(|r| r.retired.clone()).unwrap_or_default();
        let replacing = decisions.get(key).is_some_and(|d| {
            d.action == PlanAction::Replace && d.strategy == Some(ReplaceStrategy::CreateBeforeDelete)
        });
        if replacing {
            ids.extend(live.get(key).map(|r| r.provider_id.clone()));
        }
        if ids.is_empty() {
            continue;
        }
        let mut deps = vec![key.clone()];
        deps.extend(graph.dependents_of(key).cloned());
        deps.extend(
            orphans
                .iter()
                .filter(|o| o.depends_on.contains(key))
                .map(|o| o.key()),
        );
        op_deps.insert(key.retired(), deps);
        retiring.push((key.clone(), ids));
    }

    let execution_order = topological_order(&op_deps).map_err(|cycle| {
        GantryError::MalformedDeclaration(format!(
            "operation cycle detected involving: {}",
            cycle
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ))
    })?;

    let mut roots: Vec<&ResourceKey> = decisions
        .iter()
        .filter(|(_, d)| d.blocked.is_some())
        .map(|(k, _)| k)
        .collect();
    roots.sort();
    let mut inherited: BTreeMap<ResourceKey, String> = BTreeMap::new();
    for root in roots {
        for dependent in transitive_dependents(root, &op_deps) {
            inherited
                .entry(dependent)
                .or_insert_with(|| format!("dependency {} is blocked", root));
        }
    }

    let mut changes = Vec::with_capacity(op_deps.len());
    for node in graph.resources.values() {
        let key = &node.key;
        let Some(mut decision) = decisions.remove(key) else {
            continue;
        };
        if decision.blocked.is_none() {
            decision.blocked = inherited.get(key).cloned();
        }
        let record = live.get(key);
        changes.push(PlannedChange {
            key: key.clone(),
            action: decision.action,
            strategy: decision.strategy,
            changes: decision.changes,
            depends_on: op_deps.get(key).cloned().unwrap_or_default(),
            provider_id: record.map(|r| r.provider_id.clone()),
            retired: Vec::new(),
            vanished: vanished.contains(key),
            blocked: decision.blocked,
        });
    }
    for (owner, ids) in retiring {
        let key = owner.retired();
        changes.push(PlannedChange {
            action: PlanAction::Retire,
            strategy: None,
            changes: Vec::new(),
            depends_on: op_deps.get(&key).cloned().unwrap_or_default(),
            provider_id: None,
            retired: ids,
            vanished: false,
            blocked: inherited.get(&key).cloned(),
            key,
        });
    }
    for orphan in orphans {
        let key = orphan.key();
        changes.push(PlannedChange {
            action: PlanAction::Delete,
            strategy: None,
            changes: Vec::new(),
            depends_on: op_deps.get(&key).cloned().unwrap_or_default(),
            provider_id: Some(orphan.provider_id.clone()),
            retired: orphan.retired.clone(),
            vanished: vanished.contains(&key),
            blocked: inherited.get(&key).cloned(),
            key,
        });
    }

    let count = |action: PlanAction| changes.iter().filter(|c| c.action == action).count() as u32;
    let plan = ExecutionPlan {
        stack: graph.name.clone(),
        to_create: count(PlanAction::Create),
        to_update: count(PlanAction::Update),
        to_replace: count(PlanAction::Replace),
        to_delete: count(PlanAction::Delete),
        to_retire: count(PlanAction::Retire),
        unchanged: count(PlanAction::Noop),
        changes,
        execution_order,
    };
    tracing::debug!(
        stack = %plan.stack,
        create = plan.to_create,
        update = plan.to_update,
        replace = plan.to_replace,
        delete = plan.to_delete,
        retire = plan.to_retire,
        "planned"
    );
    Ok(plan)
}

/// Ask each record's provider whether its identifier still exists.
async fn refresh(
    ctx: &PlanContext<'_>,
    records: &IndexMap<ResourceKey, ResourceRecord>,
) -> Result<FxHashSet<ResourceKey>, GantryError> {
    let backoff = Backoff::from_policy(&ctx.graph.policy);
    let mut vanished = FxHashSet::default();
    for (key, record) in records {
        let provider = ctx.providers.get(key.resource_type)?;
        let exists = call_with_retry(backoff, || {
            provider.exists(key.resource_type, &record.provider_id)
        })
        .await;
        match exists {
            Ok((true, _)) => {}
            Ok((false, _)) => {
                tracing::info!(resource = %key, provider_id = %record.provider_id, "recorded resource vanished");
                vanished.insert(key.clone());
            }
            Err(e) => tracing::warn!(resource = %key, error = %e, "refresh failed, keeping record"),
        }
    }
    Ok(vanished)
}

/// Decide every declared node until no node loses its outputs.
fn settle(
    graph: &ResourceGraph,
    order: &[ResourceKey],
    resolver: &ReferenceResolver,
    externals: &FxHashMap<ResourceKey, External>,
    live: &FxHashMap<&ResourceKey, &ResourceRecord>,
) -> FxHashMap<ResourceKey, Decision> {
    let mut view: OutputView = live
        .iter()
        .map(|(k, r)| ((*k).clone(), r.outputs.clone()))
        .collect();
    let none = External::default();
    let mut queue: VecDeque<&ResourceKey> = order.iter().collect();
    let mut queued: FxHashSet<&ResourceKey> = order.iter().collect();
    let mut decisions = FxHashMap::default();

    while let Some(key) = queue.pop_front() {
        queued.remove(key);
        let Some(node) = graph.resources.get(key) else {
            continue;
        };
        let schema = key.resource_type.schema();
        let record = live.get(key).copied();
        let external = externals.get(key).unwrap_or(&none);
        let decision = match resolver.resolve_properties(
            schema,
            &node.properties,
            &view,
            external,
            ResolveMode::Plan,
        ) {
            Ok(resolved) => decide(schema, node, &resolved, record),
            Err(e) => Decision::unresolved(record, e.to_string()),
        };
        if decision.invalidates_outputs() && view.remove(key).is_some() {
            for dependent in graph.dependents_of(key) {
                if queued.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }
        decisions.insert(key.clone(), decision);
    }
    decisions
}

/// Derive a node's action from its resolved properties and its record.
pub fn decide(
    schema: &ResourceSchema,
    node: &ResourceNode,
    resolved: &IndexMap<String, Resolved>,
    record: Option<&ResourceRecord>,
) -> Decision {
    let Some(record) = record else {
        return Decision {
            action: PlanAction::Create,
            strategy: None,
            changes: resolved
                .iter()
                .map(|(name, value)| PropertyChange {
                    name: name.clone(),
                    before: ShownValue::Absent,
                    after: shown_resolved(Some(value)),
                    forces_replacement: false,
                })
                .collect(),
            blocked: None,
        };
    };

    let changes = diff_properties(schema, resolved, &record.properties);
    let (action, strategy) = if changes.iter().any(|c| c.forces_replacement) {
        (
            PlanAction::Replace,
            Some(schema.replace_strategy(&node.properties)),
        )
    } else if changes.is_empty() {
        (PlanAction::Noop, None)
    } else {
        (PlanAction::Update, None)
    };
    Decision {
        action,
        strategy,
        changes,
        blocked: None,
    }
}

/// Property-level differences. An unknown value always differs.
pub fn diff_properties(
    schema: &ResourceSchema,
    resolved: &IndexMap<String, Resolved>,
    recorded: &IndexMap<String, serde_json::Value>,
) -> Vec<PropertyChange> {
    let removed = recorded.keys().filter(|k| !resolved.contains_key(*k));
    let mut changes = Vec::new();
    for name in resolved.keys().chain(removed) {
        let after = resolved.get(name);
        let before = recorded.get(name);
        let changed = match (after.map(Resolved::fingerprint), before) {
            (Some(Some(a)), Some(b)) => &a != b,
            (None, None) => false,
            _ => true,
        };
        if changed {
            changes.push(PropertyChange {
                name: name.clone(),
                before: shown_recorded(before),
                after: shown_resolved(after),
                forces_replacement: schema.is_immutable(name),
            });
        }
    }
    changes
}

fn shown_resolved(value: Option<&Resolved>) -> ShownValue {
    match value.map(Resolved::fingerprint) {
        None => ShownValue::Absent,
        Some(None) => ShownValue::Unknown,
        Some(Some(v)) if contains_sensitive(&v) => ShownValue::Sensitive,
        Some(Some(v)) => ShownValue::Known(v),
    }
}

fn shown_recorded(value: Option<&serde_json::Value>) -> ShownValue {
    match value {
        None => ShownValue::Absent,
        Some(v) if contains_sensitive(v) => ShownValue::Sensitive,
        Some(v) => ShownValue::Known(v.clone()),
    }
}

/// Secret-safe property map persisted in a record.
pub fn fingerprint_properties(resolved: &IndexMap<String, Resolved>) -> IndexMap<String, serde_json::Value> {
    resolved
        .iter()
        .filter_map(|(k, v)| v.fingerprint().map(|f| (k.clone(), f)))
        .collect()
}

/// Hash of a resource's fingerprinted desired state.
pub fn hash_desired_state(key: &ResourceKey, properties: &IndexMap<String, serde_json::Value>) -> String {
    let object: serde_json::Map<String, serde_json::Value> = properties
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let canonical = hasher::canonical_json(&serde_json::Value::Object(object));
    hasher::composite_hash(&[&key.to_string(), &canonical])
}

// ============================================================================
// Rendering
// ============================================================================

fn show(value: &ShownValue) -> String {
    match value {
        ShownValue::Known(v) => v.to_string(),
        ShownValue::Sensitive => "(sensitive)".to_string(),
        ShownValue::Unknown => "(known after apply)".to_string(),
        ShownValue::Absent => "(absent)".to_string(),
    }
}

/// Human-readable plan: declaration order, deletions last.
pub fn render_plan(plan: &ExecutionPlan) -> String {
    let resources = plan
        .changes
        .iter()
        .filter(|c| c.action != PlanAction::Retire)
        .count();
    let mut out = format!("Planning: {} ({} resources)\n\n", plan.stack, resources);

    for change in &plan.changes {
        let mut header = format!("  {} {}", change.action.symbol(), change.key);
        if let Some(strategy) = change.strategy {
            header.push_str(&format!(" ({})", strategy));
        }
        if change.vanished {
            header.push_str(" (vanished)");
        }
        if !change.retired.is_empty() {
            header.push_str(&format!(" ({})", change.retired.join(", ")));
        }
        out.push_str(&header);
        out.push('\n');

        for prop in &change.changes {
            let line = if change.action == PlanAction::Create {
                format!("      {}: {}", prop.name, show(&prop.after))
            } else {
                format!(
                    "      {}: {} -> {}",
                    prop.name,
                    show(&prop.before),
                    show(&prop.after)
                )
            };
            out.push_str(&line);
            if prop.forces_replacement {
                out.push_str("  # forces replacement");
            }
            out.push('\n');
        }
        if let Some(cause) = &change.blocked {
            out.push_str(&format!("      # blocked: {}\n", cause));
        }
    }

    out.push_str(&format!(
        "\nPlan: {} to add, {} to change, {} to replace, {} to destroy, {} unchanged.\n",
        plan.to_create, plan.to_update, plan.to_replace, plan.to_delete, plan.unchanged
    ));
    if plan.to_retire > 0 {
        out.push_str(&format!("{} replaced instance set(s) to retire.\n", plan.to_retire));
    }
    let blocked = plan.blocked().count();
    if blocked > 0 {
        out.push_str(&format!("{} operation(s) blocked.\n", blocked));
    }
    out
}
