//! GT-031: LocalCloud: simulated provider for every resource type.
//!
//! Keeps resources in memory, optionally persisted as `cloud.json` in a cloud
//! directory so that separate CLI runs see the same "cloud". Fabricates ids,
//! names and ARNs per type, enforces identity-name uniqueness and supports
//! fault injection for tests.

use super::{Completion, Properties, Provider, ProviderError, ProviderOutput};
use crate::core::error::GantryError;
use crate::core::types::{Outputs, ResourceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A resource as the simulated cloud stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudResource {
    pub resource_type: ResourceType,
    pub logical_name: String,
    #[serde(default)]
    pub physical_name: Option<String>,
    pub properties: Properties,
    pub outputs: Outputs,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CloudState {
    next_id: u64,
    resources: BTreeMap<String, CloudResource>,
}

/// Kind of call in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Create,
    Update,
    Delete,
    Exists,
    Read,
    Poll,
}

/// One entry in the call log.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudCall {
    pub kind: CallKind,
    /// Logical name when known, otherwise the provider id or token
    pub target: String,
}

#[derive(Debug, Default)]
struct Fault {
    throttle: u32,
    fail: Option<String>,
    fail_delete: Option<String>,
    polls: u32,
}

enum PendingOp {
    Put { id: String, resource: CloudResource },
    Remove { id: String },
}

struct Pending {
    remaining: u32,
    op: PendingOp,
    output: ProviderOutput,
}

/// Simulated cloud control plane.
pub struct LocalCloud {
    state: Mutex<CloudState>,
    faults: Mutex<HashMap<String, Fault>>,
    pending: Mutex<HashMap<String, Pending>>,
    calls: Mutex<Vec<CloudCall>>,
    latency: Mutex<Duration>,
    path: Option<PathBuf>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for LocalCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCloud {
    /// An empty in-memory cloud.
    pub fn new() -> Self {
        Self::with_state(CloudState::default(), None)
    }

    fn with_state(state: CloudState, path: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(state),
            faults: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
            path,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// A cloud persisted as `cloud.json` under `dir`.
    pub fn open(dir: &Path) -> Result<Self, GantryError> {
        let path = dir.join("cloud.json");
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| GantryError::Config(format!("cannot read {}: {}", path.display(), e)))?;
            serde_json::from_str(&content).map_err(|e| {
                GantryError::Config(format!("invalid cloud state {}: {}", path.display(), e))
            })?
        } else {
            CloudState::default()
        };
        Ok(Self::with_state(state, Some(path)))
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Throttle the next `times` mutating calls for a logical name.
    pub fn throttle(&self, logical_name: &str, times: u32) {
        lock(&self.faults)
            .entry(logical_name.to_string())
            .or_default()
            .throttle = times;
    }

    /// Fail every mutating call for a logical name.
    pub fn fail(&self, logical_name: &str, message: &str) {
        lock(&self.faults)
            .entry(logical_name.to_string())
            .or_default()
            .fail = Some(message.to_string());
    }

    /// Fail only delete calls for a logical name.
    pub fn fail_deletes(&self, logical_name: &str, message: &str) {
        lock(&self.faults)
            .entry(logical_name.to_string())
            .or_default()
            .fail_delete = Some(message.to_string());
    }

    pub fn clear_faults(&self, logical_name: &str) {
        lock(&self.faults).remove(logical_name);
    }

    /// Mutating calls for a logical name complete only after `polls` polls.
    pub fn complete_after(&self, logical_name: &str, polls: u32) {
        lock(&self.faults)
            .entry(logical_name.to_string())
            .or_default()
            .polls = polls;
    }

    /// Delay every mutating call.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Delete a resource behind the engine's back.
    pub fn remove_out_of_band(&self, provider_id: &str) -> bool {
        let mut state = lock(&self.state);
        let removed = state.resources.remove(provider_id).is_some();
        if removed {
            let _ = self.persist(&state);
        }
        removed
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn len(&self) -> usize {
        lock(&self.state).resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resource(&self, provider_id: &str) -> Option<CloudResource> {
        lock(&self.state).resources.get(provider_id).cloned()
    }

    /// Live resource by type and logical name.
    pub fn find(&self, resource_type: ResourceType, logical_name: &str) -> Option<(String, CloudResource)> {
        lock(&self.state)
            .resources
            .iter()
            .find(|(_, r)| r.resource_type == resource_type && r.logical_name == logical_name)
            .map(|(id, r)| (id.clone(), r.clone()))
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        lock(&self.calls).clone()
    }

    /// Create, update and delete calls, in order.
    pub fn mutations(&self) -> Vec<CloudCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c.kind, CallKind::Create | CallKind::Update | CallKind::Delete))
            .collect()
    }

    /// Highest number of mutating calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn record(&self, kind: CallKind, target: &str) {
        lock(&self.calls).push(CloudCall {
            kind,
            target: target.to_string(),
        });
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    /// Apply injected faults. Returns the number of polls before completion.
    fn take_fault(&self, logical_name: &str, kind: CallKind) -> Result<u32, ProviderError> {
        let mut faults = lock(&self.faults);
        let Some(fault) = faults.get_mut(logical_name) else {
            return Ok(0);
        };
        if let Some(msg) = fault.fail_delete.as_ref().filter(|_| kind == CallKind::Delete) {
            return Err(ProviderError::Permanent(msg.clone()));
        }
        if fault.throttle > 0 {
            fault.throttle -= 1;
            return Err(ProviderError::Throttled(format!(
                "rate exceeded for {}",
                logical_name
            )));
        }
        if let Some(msg) = &fault.fail {
            return Err(ProviderError::Permanent(msg.clone()));
        }
        Ok(fault.polls)
    }

    fn persist(&self, state: &CloudState) -> Result<(), ProviderError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProviderError::Permanent(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let body = serde_json::to_string_pretty(state)
            .map_err(|e| ProviderError::Permanent(format!("serialize error: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)
            .map_err(|e| ProviderError::Permanent(format!("cannot write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| ProviderError::Permanent(format!("cannot rename {}: {}", tmp.display(), e)))
    }

    fn apply(&self, op: PendingOp) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        match op {
            PendingOp::Put { id, resource } => {
                check_collision(&state, &id, &resource)?;
                state.resources.insert(id, resource);
            }
            PendingOp::Remove { id } => {
                state.resources.remove(&id);
            }
        }
        self.persist(&state)
    }

    /// Finish now, or park the operation behind a poll token.
    fn complete(&self, polls: u32, op: PendingOp, output: ProviderOutput) -> Result<Completion, ProviderError> {
        if polls == 0 {
            self.apply(op)?;
            return Ok(Completion::Done(output));
        }
        let token = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            format!("op-{:06}", state.next_id)
        };
        lock(&self.pending).insert(
            token.clone(),
            Pending {
                remaining: polls,
                op,
                output,
            },
        );
        Ok(Completion::InProgress { token })
    }
}

fn str_prop<'a>(properties: &'a Properties, name: &str) -> Option<&'a str> {
    properties.get(name).and_then(Value::as_str)
}

fn id_prefix(resource_type: ResourceType) -> &'static str {
    match resource_type {
        ResourceType::HttpApi => "api",
        ResourceType::ApigwIntegration => "integ",
        ResourceType::ApigwRoute => "route",
        ResourceType::ApigwStage => "stage",
        ResourceType::LambdaPermission => "perm",
        ResourceType::IamRole => "role",
        ResourceType::LambdaFunction => "fn",
        ResourceType::DynamodbTable => "table",
    }
}

/// Types whose provider id is their physical name.
fn id_is_name(resource_type: ResourceType) -> bool {
    matches!(
        resource_type,
        ResourceType::IamRole | ResourceType::LambdaFunction | ResourceType::DynamodbTable
    )
}

fn outputs_for(resource_type: ResourceType, id: &str, name: Option<&str>, properties: &Properties, seq: u64) -> Outputs {
    let name = name.unwrap_or(id);
    let mut out = Outputs::new();
    match resource_type {
        ResourceType::HttpApi => {
            out.insert("id".into(), json!(id));
            out.insert("api_endpoint".into(), json!(format!("https://{}.execute-api.local", id)));
            out.insert("execution_arn".into(), json!(format!("arn:local:execute-api:{}", id)));
        }
        ResourceType::IamRole => {
            out.insert("arn".into(), json!(format!("arn:local:iam::role/{}", name)));
            out.insert("name".into(), json!(name));
            out.insert("id".into(), json!(name));
        }
        ResourceType::LambdaFunction => {
            let arn = format!("arn:local:lambda:function:{}", name);
            let invoke = format!("arn:local:apigateway:lambda:path/functions/{}/invocations", arn);
            out.insert("arn".into(), json!(arn));
            out.insert("name".into(), json!(name));
            out.insert("invoke_arn".into(), json!(invoke));
        }
        ResourceType::ApigwStage => {
            let api = str_prop(properties, "api_id").unwrap_or_default();
            out.insert("id".into(), json!(id));
            out.insert(
                "invoke_url".into(),
                json!(format!("https://{}.execute-api.local/{}", api, name)),
            );
        }
        ResourceType::DynamodbTable => {
            let arn = format!("arn:local:dynamodb:table/{}", name);
            let streams = properties.get("stream_enabled").and_then(Value::as_bool) == Some(true);
            let stream = if streams {
                json!(format!("{}/stream/{:06}", arn, seq))
            } else {
                Value::Null
            };
            out.insert("arn".into(), json!(arn));
            out.insert("name".into(), json!(name));
            out.insert("stream_arn".into(), stream);
        }
        ResourceType::ApigwIntegration | ResourceType::ApigwRoute | ResourceType::LambdaPermission => {
            out.insert("id".into(), json!(id));
        }
    }
    out
}

fn check_collision(state: &CloudState, id: &str, resource: &CloudResource) -> Result<(), ProviderError> {
    let Some(name) = &resource.physical_name else {
        return Ok(());
    };
    let scope = str_prop(&resource.properties, "api_id");
    let clash = state.resources.iter().any(|(other_id, other)| {
        other_id != id
            && other.resource_type == resource.resource_type
            && other.physical_name.as_deref() == Some(name.as_str())
            && str_prop(&other.properties, "api_id") == scope
    });
    if clash {
        return Err(ProviderError::Permanent(format!(
            "{} '{}' already exists",
            resource.resource_type, name
        )));
    }
    Ok(())
}

fn check_api(state: &CloudState, resource_type: ResourceType, properties: &Properties) -> Result<(), ProviderError> {
    if !matches!(
        resource_type,
        ResourceType::ApigwIntegration | ResourceType::ApigwRoute | ResourceType::ApigwStage
    ) {
        return Ok(());
    }
    let Some(api) = str_prop(properties, "api_id") else {
        return Ok(());
    };
    let found = state
        .resources
        .get(api)
        .is_some_and(|r| r.resource_type == ResourceType::HttpApi);
    if !found {
        return Err(ProviderError::Permanent(format!("api '{}' does not exist", api)));
    }
    Ok(())
}

#[async_trait]
impl Provider for LocalCloud {
    async fn create(
        &self,
        resource_type: ResourceType,
        name: &str,
        properties: &Properties,
    ) -> Result<Completion, ProviderError> {
        self.record(CallKind::Create, name);
        let _guard = self.enter().await;
        let polls = self.take_fault(name, CallKind::Create)?;

        let (id, resource) = {
            let mut state = lock(&self.state);
            check_api(&state, resource_type, properties)?;
            state.next_id += 1;
            let seq = state.next_id;
            let physical = resource_type.schema().identity.map(|prop| {
                str_prop(properties, prop)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}-{:07x}", name, seq.wrapping_mul(0x9e37_79b9) & 0xfff_ffff))
            });
            let id = match &physical {
                Some(p) if id_is_name(resource_type) => p.clone(),
                _ => format!("{}-{:06}", id_prefix(resource_type), seq),
            };
            let resource = CloudResource {
                resource_type,
                logical_name: name.to_string(),
                outputs: outputs_for(resource_type, &id, physical.as_deref(), properties, seq),
                physical_name: physical,
                properties: properties.clone(),
            };
            check_collision(&state, &id, &resource)?;
            if state.resources.contains_key(&id) {
                return Err(ProviderError::Permanent(format!("{} '{}' already exists", resource_type, id)));
            }
            (id, resource)
        };

        tracing::debug!(%resource_type, name, id = %id, "local create");
        let output = ProviderOutput {
            provider_id: id.clone(),
            outputs: resource.outputs.clone(),
        };
        self.complete(polls, PendingOp::Put { id, resource }, output)
    }

    async fn update(
        &self,
        resource_type: ResourceType,
        provider_id: &str,
        properties: &Properties,
    ) -> Result<Completion, ProviderError> {
        let existing = self.resource(provider_id);
        let logical = existing
            .as_ref()
            .map(|r| r.logical_name.clone())
            .unwrap_or_else(|| provider_id.to_string());
        self.record(CallKind::Update, &logical);
        let _guard = self.enter().await;
        let polls = self.take_fault(&logical, CallKind::Update)?;

        let Some(existing) = existing else {
            return Err(ProviderError::Permanent(format!(
                "{} '{}' not found",
                resource_type, provider_id
            )));
        };
        let resource = {
            let mut state = lock(&self.state);
            check_api(&state, resource_type, properties)?;
            state.next_id += 1;
            let seq = state.next_id;
            CloudResource {
                outputs: outputs_for(resource_type, provider_id, existing.physical_name.as_deref(), properties, seq),
                properties: properties.clone(),
                ..existing
            }
        };

        tracing::debug!(%resource_type, provider_id, "local update");
        let output = ProviderOutput {
            provider_id: provider_id.to_string(),
            outputs: resource.outputs.clone(),
        };
        let op = PendingOp::Put {
            id: provider_id.to_string(),
            resource,
        };
        self.complete(polls, op, output)
    }

    async fn delete(&self, resource_type: ResourceType, provider_id: &str) -> Result<Completion, ProviderError> {
        let logical = self
            .resource(provider_id)
            .map(|r| r.logical_name)
            .unwrap_or_else(|| provider_id.to_string());
        self.record(CallKind::Delete, &logical);
        let _guard = self.enter().await;
        let polls = self.take_fault(&logical, CallKind::Delete)?;

        tracing::debug!(%resource_type, provider_id, "local delete");
        let output = ProviderOutput {
            provider_id: provider_id.to_string(),
            outputs: Outputs::new(),
        };
        let op = PendingOp::Remove {
            id: provider_id.to_string(),
        };
        self.complete(polls, op, output)
    }

    async fn exists(&self, _resource_type: ResourceType, provider_id: &str) -> Result<bool, ProviderError> {
        self.record(CallKind::Exists, provider_id);
        Ok(lock(&self.state).resources.contains_key(provider_id))
    }

    async fn read(&self, resource_type: ResourceType, provider_id: &str) -> Result<Option<Outputs>, ProviderError> {
        self.record(CallKind::Read, provider_id);
        Ok(self
            .resource(provider_id)
            .filter(|r| r.resource_type == resource_type)
            .map(|r| r.outputs))
    }

    async fn poll(&self, token: &str) -> Result<Completion, ProviderError> {
        self.record(CallKind::Poll, token);
        let finished = {
            let mut pending = lock(&self.pending);
            let Some(entry) = pending.get_mut(token) else {
                return Err(ProviderError::Permanent(format!("unknown operation '{}'", token)));
            };
            entry.remaining = entry.remaining.saturating_sub(1);
            if entry.remaining > 0 {
                None
            } else {
                pending.remove(token)
            }
        };
        match finished {
            None => Ok(Completion::InProgress {
                token: token.to_string(),
            }),
            Some(done) => {
                self.apply(done.op)?;
                Ok(Completion::Done(done.output))
            }
        }
    }
}
