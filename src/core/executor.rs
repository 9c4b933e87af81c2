//! GT-010: Executor: runs a plan as a concurrent task graph.
//!
//! An operation starts once every operation it depends on has converged.
//! Ready operations run on a `JoinSet`, at most `parallelism` at a time,
//! released in execution order. Each operation re-resolves its properties
//! against the outputs its dependencies actually produced, re-diffs, and
//! persists its record as soon as its provider call completes.

use super::error::GantryError;
use super::planner;
use super::resolver::{transitive_dependents, OutputView, ReferenceResolver, ResolveMode};
use super::retry::{await_completion, call_with_retry, Backoff, PollSchedule};
use super::state::StateStore;
use super::types::*;
use super::value::Resolved;
use crate::journal::eventlog;
use crate::provider::{Completion, Properties, Provider, ProviderError, ProviderOutput, ProviderRegistry};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

/// Cooperative stop request. In-flight operations finish; nothing new starts.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Configuration for an apply run.
pub struct ApplyConfig {
    pub graph: Arc<ResourceGraph>,
    pub state: Arc<StateStore>,
    pub providers: ProviderRegistry,
    /// Shared with planning so stack lookups resolve once per pass
    pub resolver: Arc<ReferenceResolver>,
    pub parallelism: usize,
    pub abort: AbortSignal,
    /// Append provenance events to the stack's events.jsonl
    pub journal: bool,
}

/// Provenance sink for one run.
struct Journal {
    stack: String,
    dir: Option<PathBuf>,
}

impl Journal {
    fn emit(&self, event: ProvenanceEvent) {
        let Some(dir) = &self.dir else {
            return;
        };
        if let Err(e) = eventlog::append_event(dir, event) {
            tracing::warn!(stack = %self.stack, error = %e, "cannot append provenance event");
        }
    }
}

/// State shared by every operation task.
struct Shared {
    state: Arc<StateStore>,
    providers: ProviderRegistry,
    resolver: Arc<ReferenceResolver>,
    backoff: Backoff,
    schedule: PollSchedule,
}

/// What one operation task hands back.
struct Outcome {
    key: ResourceKey,
    applied: PlanAction,
    result: Result<Option<Outputs>, GantryError>,
    attempts: u32,
    hash: Option<String>,
    duration_seconds: f64,
}

/// Progress of one operation while it runs.
struct Progress {
    applied: PlanAction,
    attempts: u32,
    hash: Option<String>,
}

/// Execute a plan.
///
/// Returns `Err` only when the run cannot start; operation failures are
/// reported per operation in the [`ApplyReport`].
pub async fn apply(cfg: &ApplyConfig, plan: &ExecutionPlan) -> Result<ApplyReport, GantryError> {
    let start = Instant::now();
    let run_id = eventlog::generate_run_id();
    let stack = cfg.state.stack().to_string();
    let marker = cfg.state.begin_apply()?;
    let journal = Journal {
        stack: stack.clone(),
        dir: cfg
            .journal
            .then(|| cfg.state.dir().map(PathBuf::from))
            .flatten(),
    };
    journal.emit(ProvenanceEvent::ApplyStarted {
        stack: stack.clone(),
        run_id: run_id.clone(),
        gantry_version: env!("CARGO_PKG_VERSION").to_string(),
        operations: plan.changes.len() as u32,
    });
    tracing::info!(stack = %stack, run_id = %run_id, operations = plan.changes.len(), "apply started");

    let policy = &cfg.graph.policy;
    let shared = Arc::new(Shared {
        state: Arc::clone(&cfg.state),
        providers: cfg.providers.clone(),
        resolver: Arc::clone(&cfg.resolver),
        backoff: Backoff::from_policy(policy),
        schedule: PollSchedule::from_policy(policy),
    });

    // Operation graph restricted to the operations in this plan.
    let position: FxHashMap<&ResourceKey, usize> = plan
        .execution_order
        .iter()
        .enumerate()
        .map(|(i, k)| (k, i))
        .collect();
    let op_deps: IndexMap<ResourceKey, Vec<ResourceKey>> = plan
        .changes
        .iter()
        .map(|c| {
            let deps = c
                .depends_on
                .iter()
                .filter(|d| position.contains_key(d))
                .cloned()
                .collect();
            (c.key.clone(), deps)
        })
        .collect();
    let mut waiting: FxHashMap<ResourceKey, usize> =
        op_deps.iter().map(|(k, d)| (k.clone(), d.len())).collect();
    let mut dependents: FxHashMap<ResourceKey, Vec<ResourceKey>> = FxHashMap::default();
    for (key, deps) in &op_deps {
        for dep in deps {
            dependents.entry(dep.clone()).or_default().push(key.clone());
        }
    }

    let mut ready: BTreeMap<usize, ResourceKey> = BTreeMap::new();
    for (key, count) in &waiting {
        if *count == 0 {
            if let Some(&i) = position.get(key) {
                ready.insert(i, key.clone());
            }
        }
    }

    let parallelism = cfg.parallelism.max(1);
    let mut converged: OutputView = OutputView::default();
    let mut reports: FxHashMap<ResourceKey, OperationReport> = FxHashMap::default();
    let mut log: Vec<ExecutionLogEntry> = Vec::new();
    let mut seq: u64 = 0;
    let mut set: JoinSet<Outcome> = JoinSet::new();
    let mut in_flight = 0usize;

    loop {
        while in_flight < parallelism && !cfg.abort.is_aborted() {
            let Some((_, key)) = ready.pop_first() else {
                break;
            };
            let Some(change) = plan.change(&key).cloned() else {
                continue;
            };
            seq += 1;
            log.push(ExecutionLogEntry {
                seq,
                key: key.clone(),
                action: change.action,
                phase: LogPhase::Started,
            });
            journal.emit(ProvenanceEvent::ResourceStarted {
                stack: stack.clone(),
                resource: key.to_string(),
                action: change.action.to_string(),
            });
            let node = cfg.graph.resources.get(&key).cloned();
            let view: OutputView = node
                .iter()
                .flat_map(|n| n.depends_on.iter())
                .filter_map(|d| converged.get(d).map(|o| (d.clone(), o.clone())))
                .collect();
            let shared = Arc::clone(&shared);
            set.spawn(async move {
                let planned = change.action;
                let key = change.key.clone();
                // The inner task keeps a panic from losing track of its operation.
                match tokio::spawn(run_operation(shared, change, node, view)).await {
                    Ok(outcome) => outcome,
                    Err(e) => Outcome {
                        key,
                        applied: planned,
                        result: Err(GantryError::PermanentFailure(format!("operation task failed: {}", e))),
                        attempts: 0,
                        hash: None,
                        duration_seconds: 0.0,
                    },
                }
            });
            in_flight += 1;
        }

        if in_flight == 0 {
            break;
        }
        let Some(joined) = set.join_next().await else {
            break;
        };
        in_flight -= 1;
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                // Only reachable if the outer task itself was cancelled.
                tracing::error!(error = %e, "operation task lost");
                continue;
            }
        };

        let planned = plan
            .change(&outcome.key)
            .map_or(outcome.applied, |c| c.action);
        seq += 1;
        log.push(ExecutionLogEntry {
            seq,
            key: outcome.key.clone(),
            action: outcome.applied,
            phase: LogPhase::Finished,
        });

        match outcome.result {
            Ok(outputs) => {
                tracing::info!(
                    resource = %outcome.key,
                    action = %outcome.applied,
                    duration = outcome.duration_seconds,
                    "converged"
                );
                journal.emit(ProvenanceEvent::ResourceConverged {
                    stack: stack.clone(),
                    resource: outcome.key.to_string(),
                    action: outcome.applied.to_string(),
                    duration_seconds: outcome.duration_seconds,
                    hash: outcome.hash.clone().unwrap_or_default(),
                });
                if let Some(outputs) = outputs {
                    converged.insert(outcome.key.clone(), outputs);
                }
                for dependent in dependents.get(&outcome.key).into_iter().flatten() {
                    if reports.contains_key(dependent) {
                        continue;
                    }
                    if let Some(count) = waiting.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            if let Some(&i) = position.get(dependent) {
                                ready.insert(i, dependent.clone());
                            }
                        }
                    }
                }
                reports.insert(
                    outcome.key.clone(),
                    OperationReport {
                        key: outcome.key,
                        planned,
                        applied: outcome.applied,
                        status: OperationStatus::Converged,
                        attempts: outcome.attempts,
                        duration_seconds: outcome.duration_seconds,
                    },
                );
            }
            Err(e) => {
                let cause = e.to_string();
                tracing::error!(resource = %outcome.key, error = %cause, "operation failed");
                journal.emit(ProvenanceEvent::ResourceFailed {
                    stack: stack.clone(),
                    resource: outcome.key.to_string(),
                    error: cause.clone(),
                });
                for dependent in transitive_dependents(&outcome.key, &op_deps) {
                    if reports.contains_key(&dependent) {
                        continue;
                    }
                    if let Some(&i) = position.get(&dependent) {
                        ready.remove(&i);
                    }
                    let reason = SkipReason::Dependency(outcome.key.clone());
                    journal.emit(ProvenanceEvent::ResourceSkipped {
                        stack: stack.clone(),
                        resource: dependent.to_string(),
                        reason: reason.to_string(),
                    });
                    reports.insert(dependent.clone(), skipped(plan, dependent, reason));
                }
                reports.insert(
                    outcome.key.clone(),
                    OperationReport {
                        key: outcome.key,
                        planned,
                        applied: outcome.applied,
                        status: OperationStatus::Failed { cause },
                        attempts: outcome.attempts,
                        duration_seconds: outcome.duration_seconds,
                    },
                );
            }
        }
    }

    let cancelled = cfg.abort.is_aborted();
    let mut operations = Vec::with_capacity(plan.execution_order.len());
    for key in &plan.execution_order {
        let report = match reports.remove(key) {
            Some(r) => r,
            None => {
                journal.emit(ProvenanceEvent::ResourceSkipped {
                    stack: stack.clone(),
                    resource: key.to_string(),
                    reason: SkipReason::Cancelled.to_string(),
                });
                skipped(plan, key.clone(), SkipReason::Cancelled)
            }
        };
        operations.push(report);
    }

    publish_exports(cfg).await;
    drop(marker);

    let report = ApplyReport {
        stack: stack.clone(),
        run_id: run_id.clone(),
        operations,
        log,
        cancelled,
        total_duration: start.elapsed(),
    };
    let count = |pred: fn(&OperationStatus) -> bool| {
        report.operations.iter().filter(|o| pred(&o.status)).count() as u32
    };
    journal.emit(ProvenanceEvent::ApplyCompleted {
        stack,
        run_id,
        resources_converged: count(|s| *s == OperationStatus::Converged),
        resources_failed: count(|s| matches!(s, OperationStatus::Failed { .. })),
        resources_skipped: count(|s| matches!(s, OperationStatus::Skipped { .. })),
        total_seconds: report.total_duration.as_secs_f64(),
    });
    tracing::info!(
        stack = %report.stack,
        converged = report.converged().count(),
        failed = report.failed().count(),
        skipped = report.skipped().count(),
        cancelled,
        "apply finished"
    );
    Ok(report)
}

fn skipped(plan: &ExecutionPlan, key: ResourceKey, reason: SkipReason) -> OperationReport {
    let planned = plan.change(&key).map_or(PlanAction::Noop, |c| c.action);
    OperationReport {
        key,
        planned,
        applied: planned,
        status: OperationStatus::Skipped { reason },
        attempts: 0,
        duration_seconds: 0.0,
    }
}

/// Publish exports from the records left after the run.
async fn publish_exports(cfg: &ApplyConfig) {
    let view: OutputView = cfg
        .state
        .snapshot()
        .await
        .into_iter()
        .filter(|(k, _)| cfg.graph.resources.contains_key(k))
        .map(|(k, r)| (k, r.outputs))
        .collect();
    let exports = cfg.resolver.resolve_exports(&cfg.graph.exports, &view).await;
    if let Err(e) = cfg.state.publish_exports(&exports) {
        tracing::error!(stack = %cfg.state.stack(), error = %e, "cannot publish exports");
    }
}

// ============================================================================
// Operations
// ============================================================================

async fn run_operation(
    shared: Arc<Shared>,
    change: PlannedChange,
    node: Option<ResourceNode>,
    view: OutputView,
) -> Outcome {
    let started = Instant::now();
    let mut progress = Progress {
        applied: change.action,
        attempts: 0,
        hash: None,
    };
    let result = match (&node, change.action) {
        (_, PlanAction::Delete) => delete_orphan(&shared, &change, &mut progress).await,
        (_, PlanAction::Retire) => retire(&shared, &change, &mut progress).await,
        (Some(node), _) => converge(&shared, &change, node, &view, &mut progress, started).await,
        (None, _) => Err(GantryError::MalformedDeclaration(format!(
            "{} is not declared",
            change.key
        ))),
    };
    Outcome {
        key: change.key,
        applied: progress.applied,
        result,
        attempts: progress.attempts,
        hash: progress.hash,
        duration_seconds: started.elapsed().as_secs_f64(),
    }
}

/// Bring a declared resource to its desired state.
async fn converge(
    shared: &Shared,
    change: &PlannedChange,
    node: &ResourceNode,
    view: &OutputView,
    progress: &mut Progress,
    started: Instant,
) -> Result<Option<Outputs>, GantryError> {
    let key = &node.key;
    let schema = key.resource_type.schema();
    let stored = shared.state.get(key).await;
    let mut retired = stored.as_ref().map(|r| r.retired.clone()).unwrap_or_default();
    // A planned Create ignores any record: it is absent or vanished.
    let record = match change.action {
        PlanAction::Create => None,
        _ => stored,
    };

    let resolved = shared
        .resolver
        .resolve_node(schema, &node.properties, view, ResolveMode::Apply)
        .await?;
    let decision = planner::decide(schema, node, &resolved, record.as_ref());
    progress.applied = decision.action;
    if decision.action != change.action {
        tracing::info!(
            resource = %key,
            planned = %change.action,
            applied = %decision.action,
            "refined at apply time"
        );
    }

    let fingerprints = planner::fingerprint_properties(&resolved);
    let hash = planner::hash_desired_state(key, &fingerprints);
    progress.hash = Some(hash.clone());

    let provider = shared.providers.get(key.resource_type)?;
    let output = match (decision.action, record) {
        (PlanAction::Noop, Some(record)) => {
            if record.depends_on != node.depends_on {
                shared
                    .state
                    .put(ResourceRecord {
                        depends_on: node.depends_on.clone(),
                        ..record.clone()
                    })
                    .await?;
            }
            return Ok(Some(record.outputs));
        }
        (PlanAction::Update, Some(record)) => {
            let props = reveal(&resolved)?;
            invoke(shared, provider.as_ref(), progress, || {
                provider.update(key.resource_type, &record.provider_id, &props)
            })
            .await?
        }
        (PlanAction::Replace, Some(record)) => {
            let strategy = decision
                .strategy
                .unwrap_or(ReplaceStrategy::CreateBeforeDelete);
            let props = reveal(&resolved)?;
            match strategy {
                ReplaceStrategy::DeleteBeforeCreate => {
                    let record = delete_retired(shared, provider.as_ref(), record, progress).await?;
                    retired.clear();
                    remove_remote(shared, provider.as_ref(), key, &record.provider_id, progress).await?;
                    shared.state.remove(key).await?;
                    invoke(shared, provider.as_ref(), progress, || {
                        provider.create(key.resource_type, &key.name, &props)
                    })
                    .await?
                }
                ReplaceStrategy::CreateBeforeDelete => {
                    // The old instance stays until the retire operation runs.
                    retired.push(record.provider_id.clone());
                    invoke(shared, provider.as_ref(), progress, || {
                        provider.create(key.resource_type, &key.name, &props)
                    })
                    .await?
                }
            }
        }
        (_, _) => {
            progress.applied = PlanAction::Create;
            let props = reveal(&resolved)?;
            invoke(shared, provider.as_ref(), progress, || {
                provider.create(key.resource_type, &key.name, &props)
            })
            .await?
        }
    };

    let outputs = output.outputs.clone();
    persist(shared, node, output, fingerprints, hash, retired, started).await?;
    Ok(Some(outputs))
}

/// Delete the instances a create-before-delete replacement left behind.
async fn retire(
    shared: &Shared,
    change: &PlannedChange,
    progress: &mut Progress,
) -> Result<Option<Outputs>, GantryError> {
    let owner = change.key.retired_owner().ok_or_else(|| {
        GantryError::MalformedDeclaration(format!("{} is not a retire operation", change.key))
    })?;
    let record = match shared.state.get(&owner).await {
        Some(record) if !record.retired.is_empty() => record,
        _ => {
            progress.applied = PlanAction::Noop;
            return Ok(None);
        }
    };
    let provider = shared.providers.get(owner.resource_type)?;
    delete_retired(shared, provider.as_ref(), record, progress).await?;
    Ok(None)
}

/// Delete each retired id of a record, persisting the record after every
/// deletion so an interrupted run resumes with what is left.
async fn delete_retired(
    shared: &Shared,
    provider: &dyn Provider,
    mut record: ResourceRecord,
    progress: &mut Progress,
) -> Result<ResourceRecord, GantryError> {
    let key = record.key();
    while let Some(provider_id) = record.retired.first().cloned() {
        remove_remote(shared, provider, &key, &provider_id, progress)
            .await
            .map_err(|e| {
                GantryError::PermanentFailure(format!(
                    "replaced instance {} of {} was not deleted: {}",
                    provider_id, key, e
                ))
            })?;
        record.retired.remove(0);
        shared.state.put(record.clone()).await?;
        tracing::info!(resource = %key, provider_id = %provider_id, "replaced instance deleted");
    }
    Ok(record)
}

/// Delete a resource that is no longer declared, then forget its record.
async fn delete_orphan(
    shared: &Shared,
    change: &PlannedChange,
    progress: &mut Progress,
) -> Result<Option<Outputs>, GantryError> {
    let key = &change.key;
    let record = shared.state.get(key).await;
    let provider = shared.providers.get(key.resource_type)?;
    let record = match record {
        Some(r) => Some(delete_retired(shared, provider.as_ref(), r, progress).await?),
        None => None,
    };
    if change.vanished {
        tracing::info!(resource = %key, "already gone, forgetting record");
    } else if let Some(provider_id) = record
        .as_ref()
        .map(|r| r.provider_id.clone())
        .or_else(|| change.provider_id.clone())
    {
        remove_remote(shared, provider.as_ref(), key, &provider_id, progress).await?;
    }
    shared.state.remove(key).await?;
    Ok(None)
}

async fn remove_remote(
    shared: &Shared,
    provider: &dyn Provider,
    key: &ResourceKey,
    provider_id: &str,
    progress: &mut Progress,
) -> Result<ProviderOutput, GantryError> {
    invoke(shared, provider, progress, || {
        provider.delete(key.resource_type, provider_id)
    })
    .await
}

/// One provider call: retry throttling, then poll until done.
async fn invoke<F, Fut>(
    shared: &Shared,
    provider: &dyn Provider,
    progress: &mut Progress,
    call: F,
) -> Result<ProviderOutput, GantryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Completion, ProviderError>>,
{
    let result = call_with_retry(shared.backoff, call).await;
    let (completion, attempts) = match result {
        Ok(ok) => ok,
        Err(e) => {
            if let GantryError::Throttled { attempts, .. } = &e {
                progress.attempts += attempts;
            } else {
                progress.attempts += 1;
            }
            return Err(e);
        }
    };
    progress.attempts += attempts;
    await_completion(provider, completion, shared.schedule).await
}

async fn persist(
    shared: &Shared,
    node: &ResourceNode,
    output: ProviderOutput,
    properties: IndexMap<String, serde_json::Value>,
    hash: String,
    retired: Vec<String>,
    started: Instant,
) -> Result<u64, GantryError> {
    shared
        .state
        .put(ResourceRecord {
            resource_type: node.key.resource_type,
            name: node.key.name.clone(),
            provider_id: output.provider_id,
            properties,
            outputs: output.outputs,
            depends_on: node.depends_on.clone(),
            hash,
            applied_at: Some(eventlog::now_iso8601()),
            duration_seconds: Some(started.elapsed().as_secs_f64()),
            version: 0,
            retired,
        })
        .await
}

/// Plaintext properties for a provider call.
fn reveal(resolved: &IndexMap<String, Resolved>) -> Result<Properties, GantryError> {
    let mut props = Properties::new();
    for (name, value) in resolved {
        props.insert(name.clone(), value.reveal()?);
    }
    Ok(props)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::load_declaration;
    use crate::core::planner::{plan as make_plan, PlanContext};
    use crate::provider::local::CallKind;
    use crate::provider::LocalCloud;
    use crate::secrets::{MemorySource, SealingStore, SecretVault};
    use crate::stack::{StackResolver, StaticStackResolver};
    use serde_json::json;
    use std::time::Duration;

    const FN_DECL: &str = r#"
version: "1.0"
name: demo/api
policy: {backoff_ms: 1, max_backoff_ms: 2, poll_interval_ms: 1}
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
      code: api.zip
      environment:
        OPENAI_API_KEY: "{{secret.openai-api-key}}"
"#;

    const ROLE_ONLY: &str = r#"
version: "1.0"
name: demo/api
policy: {backoff_ms: 1, max_backoff_ms: 2, poll_interval_ms: 1}
resources:
  - type: iam_role
    logicalName: role
    properties: {assume_role_service: lambda.amazonaws.com}
"#;

    fn key(ty: ResourceType, name: &str) -> ResourceKey {
        ResourceKey::new(ty, name)
    }

    fn role() -> ResourceKey {
        key(ResourceType::IamRole, "role")
    }

    fn func() -> ResourceKey {
        key(ResourceType::LambdaFunction, "fn")
    }

    struct Rig {
        dir: tempfile::TempDir,
        cloud: Arc<LocalCloud>,
        state: Arc<StateStore>,
        stacks: Arc<dyn StackResolver>,
        parallelism: usize,
        abort: AbortSignal,
    }

    impl Rig {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("api.zip"), "bootstrap-v1").unwrap();
            let state = Arc::new(StateStore::open(&dir.path().join("state"), "demo/api").unwrap());
            Self {
                dir,
                cloud: Arc::new(LocalCloud::new()),
                state,
                stacks: Arc::new(StaticStackResolver::default()),
                parallelism: 4,
                abort: AbortSignal::new(),
            }
        }

        fn graph(&self, yaml: &str) -> ResourceGraph {
            let mut graph = load_declaration(yaml).unwrap();
            graph.base_dir = self.dir.path().to_path_buf();
            graph
        }

        async fn run(&self, graph: ResourceGraph) -> (ExecutionPlan, ApplyReport) {
            let secrets = SealingStore::new(
                SecretVault::generate(),
                MemorySource::default().with("openai-api-key", "sk-live-plaintext"),
            );
            let providers = ProviderRegistry::uniform(self.cloud.clone());
            let resolver = Arc::new(
                ReferenceResolver::new(&graph, Arc::clone(&self.stacks), Arc::new(secrets))
                    .with_providers(providers.clone()),
            );
            let plan = make_plan(&PlanContext {
                graph: &graph,
                state: &self.state,
                providers: &providers,
                resolver: &resolver,
                refresh: true,
            })
            .await
            .unwrap();
            let cfg = ApplyConfig {
                graph: Arc::new(graph),
                state: Arc::clone(&self.state),
                providers,
                resolver,
                parallelism: self.parallelism,
                abort: self.abort.clone(),
                journal: true,
            };
            let report = apply(&cfg, &plan).await.unwrap();
            (plan, report)
        }

        /// Mutations after the first `skip`, as `(kind, logical name)`.
        fn mutations_since(&self, skip: usize) -> Vec<(CallKind, String)> {
            self.cloud
                .mutations()
                .into_iter()
                .skip(skip)
                .map(|c| (c.kind, c.target))
                .collect()
        }

        fn calls_for(&self, target: &str) -> Vec<CallKind> {
            self.cloud
                .mutations()
                .into_iter()
                .filter(|c| c.target == target)
                .map(|c| c.kind)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_gt010_role_fn_scenario() {
        let rig = Rig::new();

        let (_, first) = rig.run(rig.graph(FN_DECL)).await;
        assert!(first.is_converged());
        assert_eq!(
            first.applied_actions(),
            vec![(role(), PlanAction::Create), (func(), PlanAction::Create)]
        );
        assert_eq!(rig.cloud.len(), 2);

        let (plan, second) = rig.run(rig.graph(FN_DECL)).await;
        assert!(plan.is_noop());
        assert!(second.is_converged());
        assert!(second.applied_actions().is_empty());

        let role_version = rig.state.version(&role()).await;
        let (plan, third) = rig.run(rig.graph(ROLE_ONLY)).await;
        assert_eq!(plan.actions(), vec![(role(), PlanAction::Noop), (func(), PlanAction::Delete)]);
        assert_eq!(third.applied_actions(), vec![(func(), PlanAction::Delete)]);
        assert_eq!(rig.state.version(&role()).await, role_version);
        assert!(rig.state.get(&func()).await.is_none());
        assert_eq!(rig.cloud.len(), 1);
    }

    #[tokio::test]
    async fn test_gt010_idempotent_no_mutations() {
        let rig = Rig::new();
        rig.run(rig.graph(FN_DECL)).await;
        let before = rig.cloud.mutations().len();
        let (_, report) = rig.run(rig.graph(FN_DECL)).await;
        assert!(report.is_converged());
        assert_eq!(rig.cloud.mutations().len(), before);
    }

    #[tokio::test]
    async fn test_gt010_dependency_finishes_before_dependent_starts() {
        let rig = Rig::new();
        rig.cloud.set_latency(Duration::from_millis(5));
        let (_, report) = rig.run(rig.graph(FN_DECL)).await;
        let (_, role_done) = report.log_span(&role()).unwrap();
        let (fn_start, _) = report.log_span(&func()).unwrap();
        assert!(role_done < fn_start);
    }

    #[tokio::test]
    async fn test_gt010_records_hold_no_plaintext_secret() {
        let rig = Rig::new();
        rig.run(rig.graph(FN_DECL)).await;
        let record = rig.state.get(&func()).await.unwrap();
        let env = &record.properties["environment"]["OPENAI_API_KEY"];
        assert!(env.as_str().unwrap().starts_with("sensitive:blake3:"));

        let path = crate::core::state::record_path(rig.state.dir().unwrap(), &func());
        let on_disk = std::fs::read_to_string(path).unwrap();
        assert!(!on_disk.contains("sk-live-plaintext"));
        let events = std::fs::read_to_string(eventlog::event_log_path(rig.state.dir().unwrap())).unwrap();
        assert!(!events.contains("sk-live-plaintext"));

        // The provider did receive the plaintext.
        let (_, live) = rig.cloud.find(ResourceType::LambdaFunction, "fn").unwrap();
        assert_eq!(live.properties["environment"]["OPENAI_API_KEY"], json!("sk-live-plaintext"));
    }

    #[tokio::test]
    async fn test_gt010_replace_create_before_delete() {
        let rig = Rig::new();
        rig.run(rig.graph(FN_DECL)).await;
        let old = rig.state.get(&role()).await.unwrap();

        let before = rig.cloud.mutations().len();

        let changed = FN_DECL.replace("lambda.amazonaws.com", "edgelambda.amazonaws.com");
        let (plan, report) = rig.run(rig.graph(&changed)).await;
        assert_eq!(plan.change(&role()).unwrap().action, PlanAction::Replace);
        assert_eq!(plan.change(&func()).unwrap().action, PlanAction::Update);
        let retire = plan.change(&role().retired()).unwrap();
        assert_eq!(retire.depends_on, vec![role(), func()]);
        assert!(report.is_converged());
        assert_eq!(report.operation(&role().retired()).unwrap().applied, PlanAction::Retire);

        // The old role goes only after the function has moved off it.
        assert_eq!(
            rig.mutations_since(before),
            vec![
                (CallKind::Create, "role".to_string()),
                (CallKind::Update, "fn".to_string()),
                (CallKind::Delete, "role".to_string()),
            ]
        );
        let new = rig.state.get(&role()).await.unwrap();
        assert_ne!(new.provider_id, old.provider_id);
        assert!(new.retired.is_empty());
        assert!(rig.cloud.resource(&old.provider_id).is_none());
        assert_eq!(rig.cloud.len(), 2);
        let (_, live_fn) = rig.cloud.find(ResourceType::LambdaFunction, "fn").unwrap();
        assert_eq!(live_fn.properties["role"], new.outputs["arn"]);
    }

    #[tokio::test]
    async fn test_gt010_failed_retire_is_resumed() {
        let rig = Rig::new();
        rig.run(rig.graph(FN_DECL)).await;
        let old = rig.state.get(&role()).await.unwrap();

        rig.cloud.fail_deletes("role", "role is still attached");
        let changed = FN_DECL.replace("lambda.amazonaws.com", "edgelambda.amazonaws.com");
        let (_, report) = rig.run(rig.graph(&changed)).await;
        assert!(!report.is_converged());
        assert_eq!(report.operation(&role()).unwrap().status, OperationStatus::Converged);
        assert_eq!(report.operation(&func()).unwrap().status, OperationStatus::Converged);
        assert!(matches!(
            &report.operation(&role().retired()).unwrap().status,
            OperationStatus::Failed { cause }
                if cause.contains("role is still attached") && cause.contains(&old.provider_id)
        ));

        // The old id survives in the record, on disk.
        let reopened = StateStore::open(&rig.dir.path().join("state"), "demo/api").unwrap();
        let stored = reopened.get(&role()).await.unwrap();
        assert_ne!(stored.provider_id, old.provider_id);
        assert_eq!(stored.retired, vec![old.provider_id.clone()]);
        assert!(rig.cloud.resource(&old.provider_id).is_some());

        rig.cloud.clear_faults("role");
        let (plan, resumed) = rig.run(rig.graph(&changed)).await;
        assert_eq!(
            plan.actions(),
            vec![
                (role(), PlanAction::Noop),
                (func(), PlanAction::Noop),
                (role().retired(), PlanAction::Retire),
            ]
        );
        assert_eq!(plan.change(&role().retired()).unwrap().retired, vec![old.provider_id.clone()]);
        assert!(resumed.is_converged());
        assert!(rig.cloud.resource(&old.provider_id).is_none());
        assert!(rig.state.get(&role()).await.unwrap().retired.is_empty());

        let (plan, _) = rig.run(rig.graph(&changed)).await;
        assert!(plan.is_noop());
    }

    #[tokio::test]
    async fn test_gt010_replace_delete_before_create() {
        let rig = Rig::new();
        let named = ROLE_ONLY.replace(
            "{assume_role_service: lambda.amazonaws.com}",
            "{name: exec-role, assume_role_service: lambda.amazonaws.com}",
        );
        rig.run(rig.graph(&named)).await;

        let changed = named.replace("lambda.amazonaws.com", "edgelambda.amazonaws.com");
        let (plan, report) = rig.run(rig.graph(&changed)).await;
        assert_eq!(
            plan.change(&role()).unwrap().strategy,
            Some(ReplaceStrategy::DeleteBeforeCreate)
        );
        assert!(report.is_converged());
        assert_eq!(
            rig.calls_for("role"),
            vec![CallKind::Create, CallKind::Delete, CallKind::Create]
        );
        assert_eq!(rig.state.get(&role()).await.unwrap().provider_id, "exec-role");
    }

    #[tokio::test]
    async fn test_gt010_delete_first_replace_after_orphaned_dependent() {
        let rig = Rig::new();
        let pinned = "{name: exec-role, assume_role_service: lambda.amazonaws.com}";
        let with_fn = FN_DECL.replace("{assume_role_service: lambda.amazonaws.com}", pinned);
        rig.run(rig.graph(&with_fn)).await;
        let before = rig.cloud.mutations().len();

        let role_only = ROLE_ONLY
            .replace("{assume_role_service: lambda.amazonaws.com}", pinned)
            .replace("lambda.amazonaws.com", "edgelambda.amazonaws.com");
        let (plan, report) = rig.run(rig.graph(&role_only)).await;
        assert_eq!(plan.change(&role()).unwrap().depends_on, vec![func()]);
        assert!(report.is_converged());
        assert_eq!(
            rig.mutations_since(before),
            vec![
                (CallKind::Delete, "fn".to_string()),
                (CallKind::Delete, "role".to_string()),
                (CallKind::Create, "role".to_string()),
            ]
        );
    }

    const WITH_TABLE: &str = r#"
version: "1.0"
name: demo/api
policy: {backoff_ms: 1, max_backoff_ms: 2, poll_interval_ms: 1}
resources:
  - type: iam_role
    logicalName: role
    properties: {assume_role_service: lambda.amazonaws.com}
  - type: lambda_function
    logicalName: fn
    properties: {role: "{{ref.role.arn}}", runtime: go1.x, handler: api, code: api.zip}
  - type: lambda_permission
    logicalName: invoke
    properties: {action: "lambda:InvokeFunction", function: "{{ref.fn.name}}", principal: apigateway.amazonaws.com}
  - type: dynamodb_table
    logicalName: scores
    properties: {hash_key: id}
"#;

    #[tokio::test]
    async fn test_gt010_partial_failure_then_resume() {
        let rig = Rig::new();
        rig.cloud.fail("fn", "code storage limit exceeded");
        let perm = key(ResourceType::LambdaPermission, "invoke");
        let table = key(ResourceType::DynamodbTable, "scores");

        let (_, report) = rig.run(rig.graph(WITH_TABLE)).await;
        assert!(!report.is_converged());
        assert_eq!(report.operation(&role()).unwrap().status, OperationStatus::Converged);
        assert_eq!(report.operation(&table).unwrap().status, OperationStatus::Converged);
        assert!(matches!(
            &report.operation(&func()).unwrap().status,
            OperationStatus::Failed { cause } if cause.contains("code storage limit")
        ));
        assert_eq!(
            report.operation(&perm).unwrap().status,
            OperationStatus::Skipped {
                reason: SkipReason::Dependency(func())
            }
        );
        assert!(rig.state.get(&func()).await.is_none());

        rig.cloud.clear_faults("fn");
        let (plan, resumed) = rig.run(rig.graph(WITH_TABLE)).await;
        assert_eq!(plan.change(&role()).unwrap().action, PlanAction::Noop);
        assert_eq!(plan.change(&table).unwrap().action, PlanAction::Noop);
        assert!(resumed.is_converged());
        assert_eq!(
            resumed.applied_actions(),
            vec![(func(), PlanAction::Create), (perm, PlanAction::Create)]
        );
        assert_eq!(rig.calls_for("role"), vec![CallKind::Create]);
        assert_eq!(rig.cloud.len(), 4);
    }

    #[tokio::test]
    async fn test_gt010_throttling_is_retried() {
        let rig = Rig::new();
        rig.cloud.throttle("role", 2);
        let (_, report) = rig.run(rig.graph(ROLE_ONLY)).await;
        assert!(report.is_converged());
        assert_eq!(report.operation(&role()).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_gt010_throttling_exhausted_fails() {
        let rig = Rig::new();
        rig.cloud.throttle("role", 50);
        let (_, report) = rig.run(rig.graph(FN_DECL)).await;
        assert!(matches!(
            &report.operation(&role()).unwrap().status,
            OperationStatus::Failed { cause } if cause.contains("throttled after 5 attempt(s)")
        ));
        assert_eq!(report.operation(&role()).unwrap().attempts, 5);
        assert!(matches!(
            report.operation(&func()).unwrap().status,
            OperationStatus::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_gt010_long_running_completion_is_polled() {
        let rig = Rig::new();
        rig.cloud.complete_after("role", 3);
        let (_, report) = rig.run(rig.graph(FN_DECL)).await;
        assert!(report.is_converged());
        let polls = rig
            .cloud
            .calls()
            .into_iter()
            .filter(|c| c.kind == CallKind::Poll)
            .count();
        assert_eq!(polls, 3);
        let record = rig.state.get(&role()).await.unwrap();
        assert!(rig.cloud.resource(&record.provider_id).is_some());
    }

    const FAN_OUT: &str = r#"
version: "1.0"
name: demo/api
policy: {backoff_ms: 1, max_backoff_ms: 2, poll_interval_ms: 1}
resources:
  - type: dynamodb_table
    logicalName: t1
    properties: {hash_key: id}
  - type: dynamodb_table
    logicalName: t2
    properties: {hash_key: id}
  - type: dynamodb_table
    logicalName: t3
    properties: {hash_key: id}
  - type: dynamodb_table
    logicalName: t4
    properties: {hash_key: id}
  - type: dynamodb_table
    logicalName: t5
    properties: {hash_key: id}
"#;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_gt010_parallelism_bound() {
        let mut rig = Rig::new();
        rig.parallelism = 2;
        rig.cloud.set_latency(Duration::from_millis(20));
        let (_, report) = rig.run(rig.graph(FAN_OUT)).await;
        assert!(report.is_converged());
        assert!(rig.cloud.max_in_flight() <= 2);
        assert_eq!(rig.cloud.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_gt010_abort_skips_unstarted() {
        let rig = Rig::new();
        rig.abort.abort();
        let (_, report) = rig.run(rig.graph(FN_DECL)).await;
        assert!(report.cancelled);
        assert!(report.operations.iter().all(|o| o.status
            == OperationStatus::Skipped {
                reason: SkipReason::Cancelled
            }));
        assert!(rig.cloud.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_gt010_abort_lets_in_flight_operation_finish() {
        let mut rig = Rig::new();
        rig.parallelism = 1;
        rig.cloud.set_latency(Duration::from_millis(50));
        let cloud = Arc::clone(&rig.cloud);
        let abort = rig.abort.clone();
        let watcher = tokio::spawn(async move {
            while cloud.mutations().is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            abort.abort();
        });

        let (_, report) = rig.run(rig.graph(FAN_OUT)).await;
        watcher.await.unwrap();
        assert!(report.cancelled);
        let first = key(ResourceType::DynamodbTable, "t1");
        assert_eq!(report.operation(&first).unwrap().status, OperationStatus::Converged);
        let path = crate::core::state::record_path(rig.state.dir().unwrap(), &first);
        assert!(path.exists());
        for name in ["t2", "t3", "t4", "t5"] {
            assert_eq!(
                report.operation(&key(ResourceType::DynamodbTable, name)).unwrap().status,
                OperationStatus::Skipped {
                    reason: SkipReason::Cancelled
                }
            );
        }
        assert_eq!(rig.mutations_since(0), vec![(CallKind::Create, "t1".to_string())]);

        rig.abort = AbortSignal::new();
        let (plan, resumed) = rig.run(rig.graph(FAN_OUT)).await;
        assert_eq!(plan.change(&first).unwrap().action, PlanAction::Noop);
        assert_eq!(plan.to_create, 4);
        assert!(resumed.is_converged());
    }

    #[tokio::test]
    async fn test_gt010_pending_stack_blocks_only_dependents() {
        let mut rig = Rig::new();
        rig.stacks = Arc::new(StaticStackResolver::default().pending("org/core", "apiGatewayId", 0, None));
        let yaml = r#"
version: "1.0"
name: demo/api
stacks: {core: org/core}
policy: {backoff_ms: 1, max_backoff_ms: 2, poll_interval_ms: 1, max_attempts: 2}
resources:
  - type: apigw_route
    logicalName: score
    properties: {api_id: "{{stack.core.apiGatewayId}}", route_key: "POST /score"}
  - type: lambda_permission
    logicalName: invoke
    properties: {action: "lambda:InvokeFunction", function: api, principal: apigateway.amazonaws.com}
    dependsOn: [score]
  - type: dynamodb_table
    logicalName: scores
    properties: {hash_key: id}
"#;
        let (plan, report) = rig.run(rig.graph(yaml)).await;
        let route = key(ResourceType::ApigwRoute, "score");
        let perm = key(ResourceType::LambdaPermission, "invoke");
        assert!(plan.change(&route).unwrap().blocked.is_some());
        assert!(matches!(
            &report.operation(&route).unwrap().status,
            OperationStatus::Failed { cause } if cause.contains("still pending")
        ));
        assert_eq!(
            report.operation(&perm).unwrap().status,
            OperationStatus::Skipped {
                reason: SkipReason::Dependency(route)
            }
        );
        assert_eq!(
            report.operation(&key(ResourceType::DynamodbTable, "scores")).unwrap().status,
            OperationStatus::Converged
        );
    }

    const GATEWAY_PERMISSION: &str = r#"
version: "1.0"
name: demo/api
stacks: {core: org/booth-game/core}
lookups:
  gateway: {type: http_api, id: "{{stack.core.apiGatewayId}}"}
policy: {backoff_ms: 1, max_backoff_ms: 2, poll_interval_ms: 1, max_attempts: 2}
resources:
  - type: lambda_permission
    logicalName: invoke
    properties:
      action: lambda:InvokeFunction
      function: booth-api
      principal: apigateway.amazonaws.com
      source_arn: "{{lookup.gateway.execution_arn}}/*/*"
"#;

    #[tokio::test]
    async fn test_gt010_lookup_reads_gateway_for_source_arn() {
        let mut rig = Rig::new();
        let props = Properties::from_iter([
            ("name".to_string(), json!("booth-gateway")),
            ("protocol_type".to_string(), json!("HTTP")),
        ]);
        let Completion::Done(gateway) = rig
            .cloud
            .create(ResourceType::HttpApi, "gateway", &props)
            .await
            .unwrap()
        else {
            panic!("expected immediate completion");
        };
        rig.stacks = Arc::new(StaticStackResolver::default().with(
            "org/booth-game/core",
            "apiGatewayId",
            json!(gateway.provider_id),
        ));

        let perm = key(ResourceType::LambdaPermission, "invoke");
        let expected = format!("arn:local:execute-api:{}/*/*", gateway.provider_id);
        let (plan, report) = rig.run(rig.graph(GATEWAY_PERMISSION)).await;
        let source = plan
            .change(&perm)
            .unwrap()
            .changes
            .iter()
            .find(|c| c.name == "source_arn")
            .unwrap();
        assert_eq!(source.after, ShownValue::Known(json!(expected)));
        assert!(report.is_converged());
        let (_, live) = rig.cloud.find(ResourceType::LambdaPermission, "invoke").unwrap();
        assert_eq!(live.properties["source_arn"], json!(expected));

        let (plan, _) = rig.run(rig.graph(GATEWAY_PERMISSION)).await;
        assert!(plan.is_noop());
    }

    #[tokio::test]
    async fn test_gt010_lookup_of_missing_resource_blocks() {
        let mut rig = Rig::new();
        rig.stacks = Arc::new(StaticStackResolver::default().with(
            "org/booth-game/core",
            "apiGatewayId",
            json!("api-404"),
        ));
        let perm = key(ResourceType::LambdaPermission, "invoke");
        let (plan, report) = rig.run(rig.graph(GATEWAY_PERMISSION)).await;
        let cause = plan.change(&perm).unwrap().blocked.clone().unwrap();
        assert!(cause.contains("lookup.gateway.execution_arn"), "{}", cause);
        assert!(cause.contains("http_api 'api-404' does not exist"), "{}", cause);
        assert!(matches!(
            &report.operation(&perm).unwrap().status,
            OperationStatus::Failed { cause } if cause.contains("does not exist")
        ));
        assert!(rig.cloud.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_gt010_journal_and_exports() {
        let rig = Rig::new();
        let yaml = format!(
            "{}exports:\n  roleArn: \"{{{{ref.role.arn}}}}\"\n",
            ROLE_ONLY
        );
        let (_, report) = rig.run(rig.graph(&yaml)).await;
        assert!(report.is_converged());

        let dir = rig.state.dir().unwrap();
        let events = eventlog::read_events(dir).unwrap();
        assert!(matches!(events.first().unwrap().event, ProvenanceEvent::ApplyStarted { .. }));
        assert!(matches!(
            events.last().unwrap().event,
            ProvenanceEvent::ApplyCompleted { resources_converged: 1, .. }
        ));
        assert!(!dir.join(crate::core::state::IN_PROGRESS_MARKER).exists());

        let exports = rig.state.exports().unwrap().unwrap();
        let record = rig.state.get(&role()).await.unwrap();
        assert_eq!(exports["roleArn"], record.outputs["arn"]);
    }
}
