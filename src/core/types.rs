//! GT-001: Core types for declarations, identities, plans, records and reports.
//!
//! The declaration document types derive Serialize/Deserialize for YAML
//! roundtripping. The loaded `ResourceGraph` is the validated, bound form that
//! the planner and executor work with.

use super::value::PropertyValue;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Output attributes reported by a provider for one resource.
pub type Outputs = IndexMap<String, serde_json::Value>;

// ============================================================================
// Declaration document (gantry.yaml)
// ============================================================================

/// Root declaration: the desired state of one stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Declaration {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Stack id. May contain `/`-separated segments.
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Parameters substituted at load time via `{{params.key}}`
    #[serde(default)]
    pub params: IndexMap<String, serde_yaml_ng::Value>,

    /// Cross-system stack aliases: alias → system id
    #[serde(default)]
    pub stacks: IndexMap<String, String>,

    /// Resources owned elsewhere, read live from their provider
    #[serde(default)]
    pub lookups: IndexMap<String, DeclaredLookup>,

    /// Resource declarations (order-preserving)
    #[serde(default)]
    pub resources: Vec<DeclaredResource>,

    /// Values this stack publishes for other stacks
    #[serde(default)]
    pub exports: IndexMap<String, serde_yaml_ng::Value>,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,
}

/// An existing resource referenced by provider id, e.g. an API gateway
/// whose id another stack exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredLookup {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,

    /// Provider id: a literal, or built from params and stack outputs
    pub id: serde_yaml_ng::Value,
}

/// One resource as written in the declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredResource {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,

    #[serde(rename = "logicalName")]
    pub logical_name: String,

    #[serde(default)]
    pub properties: IndexMap<String, serde_yaml_ng::Value>,

    /// Explicit dependencies, by bare logical name or `type:name`
    #[serde(default, rename = "dependsOn")]
    pub depends_on: Vec<String>,
}

// ============================================================================
// Resource identity
// ============================================================================

/// Resource type. Each variant carries a provider-defined schema, see
/// [`crate::core::schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    HttpApi,
    IamRole,
    LambdaFunction,
    ApigwIntegration,
    ApigwRoute,
    ApigwStage,
    LambdaPermission,
    DynamodbTable,
}

impl ResourceType {
    pub const ALL: [ResourceType; 8] = [
        Self::HttpApi,
        Self::IamRole,
        Self::LambdaFunction,
        Self::ApigwIntegration,
        Self::ApigwRoute,
        Self::ApigwStage,
        Self::LambdaPermission,
        Self::DynamodbTable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpApi => "http_api",
            Self::IamRole => "iam_role",
            Self::LambdaFunction => "lambda_function",
            Self::ApigwIntegration => "apigw_integration",
            Self::ApigwRoute => "apigw_route",
            Self::ApigwStage => "apigw_stage",
            Self::LambdaPermission => "lambda_permission",
            Self::DynamodbTable => "dynamodb_table",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown resource type '{}'", s))
    }
}

/// Unique identity of a resource within a stack: type + logical name.
/// Rendered and serialized as `type:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub name: String,
}

/// Suffix of the operation that deletes a resource's replaced instances.
/// Logical names cannot contain `#`, so the key never names a resource.
const RETIRED_SUFFIX: &str = "#retired";

impl ResourceKey {
    pub fn new(resource_type: ResourceType, name: impl Into<String>) -> Self {
        Self {
            resource_type,
            name: name.into(),
        }
    }

    /// Key of the operation that deletes this resource's replaced instances.
    pub fn retired(&self) -> Self {
        Self::new(self.resource_type, format!("{}{}", self.name, RETIRED_SUFFIX))
    }

    /// The resource a retire operation belongs to.
    pub fn retired_owner(&self) -> Option<Self> {
        self.name
            .strip_suffix(RETIRED_SUFFIX)
            .map(|name| Self::new(self.resource_type, name))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, name) = s
            .split_once(':')
            .ok_or_else(|| format!("resource key '{}' must be type:name", s))?;
        if name.is_empty() {
            return Err(format!("resource key '{}' has an empty name", s));
        }
        Ok(Self::new(ty.parse()?, name))
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy. Every field has a default; CLI flags and gantry.toml may
/// override some of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Maximum number of provider operations in flight
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Attempts per provider call or pending stack lookup before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles per attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Delay between polls of a long-running provider operation
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Polls before a long-running operation counts as failed
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,

    /// Ask the provider whether recorded identifiers still exist before planning
    #[serde(default = "default_true")]
    pub refresh: bool,

    /// Append provenance events to events.jsonl
    #[serde(default = "default_true")]
    pub journal: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
            refresh: true,
            journal: true,
        }
    }
}

fn default_parallelism() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_polls() -> u32 {
    120
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Loaded graph
// ============================================================================

/// A declared resource after validation and reference binding.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    pub key: ResourceKey,

    /// Property values in declaration order
    pub properties: IndexMap<String, PropertyValue>,

    /// Explicit dependsOn plus every local reference target, deduplicated
    pub depends_on: Vec<ResourceKey>,
}

/// A bound lookup: `{{lookup.<name>.<output>}}` reads this resource.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub resource_type: ResourceType,
    pub id: PropertyValue,
}

/// The validated resource graph of one stack.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    pub name: String,
    pub description: Option<String>,
    pub stacks: IndexMap<String, String>,
    pub lookups: IndexMap<String, Lookup>,
    pub resources: IndexMap<ResourceKey, ResourceNode>,
    pub exports: IndexMap<String, PropertyValue>,
    pub policy: Policy,

    /// Directory asset paths are relative to
    pub base_dir: PathBuf,
}

impl ResourceGraph {
    /// A graph with no resources, used to tear a stack down.
    pub fn empty(name: &str, policy: Policy) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            stacks: IndexMap::new(),
            lookups: IndexMap::new(),
            resources: IndexMap::new(),
            exports: IndexMap::new(),
            policy,
            base_dir: PathBuf::from("."),
        }
    }

    /// Declared resources that list `key` among their dependencies.
    pub fn dependents_of<'a>(&'a self, key: &'a ResourceKey) -> impl Iterator<Item = &'a ResourceKey> {
        self.resources
            .values()
            .filter(move |n| n.depends_on.contains(key))
            .map(|n| &n.key)
    }
}

// ============================================================================
// Actual-state record
// ============================================================================

/// Persisted snapshot of one applied resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,

    pub name: String,

    /// Identifier assigned by the provider
    pub provider_id: String,

    /// Last-applied property fingerprints (secrets never in plaintext)
    #[serde(default)]
    pub properties: IndexMap<String, serde_json::Value>,

    /// Output attributes from the last successful provider call
    #[serde(default)]
    pub outputs: Outputs,

    /// Dependencies at the time of apply, for delete ordering
    #[serde(default)]
    pub depends_on: Vec<ResourceKey>,

    /// BLAKE3 of the fingerprinted declaration
    pub hash: String,

    #[serde(default)]
    pub applied_at: Option<String>,

    #[serde(default)]
    pub duration_seconds: Option<f64>,

    /// Store version of this record; bumped on every write
    #[serde(default)]
    pub version: u64,

    /// Provider ids of replaced instances that are not deleted yet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retired: Vec<String>,
}

impl ResourceRecord {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type, self.name.clone())
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Operation to perform on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Update,
    Replace,
    Delete,
    /// Delete the instances a replacement left behind
    Retire,
    Noop,
}

impl PlanAction {
    /// Symbol used in rendered plans.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete | Self::Retire => "-",
            Self::Noop => " ",
        }
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Replace => write!(f, "REPLACE"),
            Self::Delete => write!(f, "DELETE"),
            Self::Retire => write!(f, "RETIRE"),
            Self::Noop => write!(f, "NO-OP"),
        }
    }
}

/// How a replacement is sequenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Old and new may coexist under different identities
    CreateBeforeDelete,
    /// The declaration pins the identity, so the old one must go first
    DeleteBeforeCreate,
}

impl fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateBeforeDelete => write!(f, "create before delete"),
            Self::DeleteBeforeCreate => write!(f, "delete before create"),
        }
    }
}

/// A property value as shown in a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum ShownValue {
    Known(serde_json::Value),
    Sensitive,
    Unknown,
    Absent,
}

/// One property difference.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub name: String,
    pub before: ShownValue,
    pub after: ShownValue,
    pub forces_replacement: bool,
}

/// A single planned operation.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub key: ResourceKey,
    pub action: PlanAction,

    /// Set for Replace
    pub strategy: Option<ReplaceStrategy>,

    /// Property differences (empty for Noop and Delete)
    pub changes: Vec<PropertyChange>,

    /// Operations that must converge before this one starts
    pub depends_on: Vec<ResourceKey>,

    /// Recorded provider id, when a record exists
    pub provider_id: Option<String>,

    /// Replaced instances a Retire deletes (known ones; the executor
    /// deletes whatever the record lists when it runs)
    pub retired: Vec<String>,

    /// Refresh found the recorded identifier gone
    pub vanished: bool,

    /// Resolution failure that prevents this operation
    pub blocked: Option<String>,
}

/// Full execution plan for one stack.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub stack: String,

    /// Changes in declaration order, deletions last
    pub changes: Vec<PlannedChange>,

    /// Topological execution order over all operations
    pub execution_order: Vec<ResourceKey>,

    pub to_create: u32,
    pub to_update: u32,
    pub to_replace: u32,
    pub to_delete: u32,
    pub to_retire: u32,
    pub unchanged: u32,
}

impl ExecutionPlan {
    pub fn change(&self, key: &ResourceKey) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| &c.key == key)
    }

    /// `(key, action)` pairs in execution order.
    pub fn actions(&self) -> Vec<(ResourceKey, PlanAction)> {
        self.execution_order
            .iter()
            .filter_map(|k| self.change(k).map(|c| (k.clone(), c.action)))
            .collect()
    }

    /// Operations whose references could not be resolved.
    pub fn blocked(&self) -> impl Iterator<Item = &PlannedChange> {
        self.changes.iter().filter(|c| c.blocked.is_some())
    }

    pub fn is_noop(&self) -> bool {
        self.changes.iter().all(|c| c.action == PlanAction::Noop)
    }
}

// ============================================================================
// Apply report
// ============================================================================

/// Why an operation never ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A dependency failed or was itself skipped
    Dependency(ResourceKey),
    /// The run was aborted before this operation was scheduled
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dependency(k) => write!(f, "dependency {} did not converge", k),
            Self::Cancelled => write!(f, "apply aborted before scheduling"),
        }
    }
}

/// Final status of one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    Converged,
    Failed { cause: String },
    Skipped { reason: SkipReason },
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "CONVERGED"),
            Self::Failed { .. } => write!(f, "FAILED"),
            Self::Skipped { .. } => write!(f, "SKIPPED"),
        }
    }
}

/// Outcome of one operation.
#[derive(Debug, Clone)]
pub struct OperationReport {
    pub key: ResourceKey,

    /// Action from the plan
    pub planned: PlanAction,

    /// Action actually performed after apply-time refinement
    pub applied: PlanAction,

    pub status: OperationStatus,
    pub attempts: u32,
    pub duration_seconds: f64,
}

/// Phase of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPhase {
    Started,
    Finished,
}

/// Ordered execution log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLogEntry {
    pub seq: u64,
    pub key: ResourceKey,
    pub action: PlanAction,
    pub phase: LogPhase,
}

/// Result of applying a plan.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub stack: String,
    pub run_id: String,

    /// One entry per planned operation, in execution order
    pub operations: Vec<OperationReport>,

    pub log: Vec<ExecutionLogEntry>,
    pub cancelled: bool,
    pub total_duration: std::time::Duration,
}

impl ApplyReport {
    pub fn operation(&self, key: &ResourceKey) -> Option<&OperationReport> {
        self.operations.iter().find(|o| &o.key == key)
    }

    pub fn converged(&self) -> impl Iterator<Item = &OperationReport> {
        self.operations
            .iter()
            .filter(|o| o.status == OperationStatus::Converged)
    }

    pub fn failed(&self) -> impl Iterator<Item = &OperationReport> {
        self.operations
            .iter()
            .filter(|o| matches!(o.status, OperationStatus::Failed { .. }))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &OperationReport> {
        self.operations
            .iter()
            .filter(|o| matches!(o.status, OperationStatus::Skipped { .. }))
    }

    /// Every operation converged.
    pub fn is_converged(&self) -> bool {
        self.operations
            .iter()
            .all(|o| o.status == OperationStatus::Converged)
    }

    /// Converged `(key, action)` pairs that changed something, in the order
    /// operations started.
    pub fn applied_actions(&self) -> Vec<(ResourceKey, PlanAction)> {
        self.log
            .iter()
            .filter(|e| e.phase == LogPhase::Started)
            .filter_map(|e| {
                self.operation(&e.key)
                    .filter(|o| o.status == OperationStatus::Converged && o.applied != PlanAction::Noop)
                    .map(|o| (e.key.clone(), o.applied))
            })
            .collect()
    }

    /// Sequence numbers of an operation's log entries.
    pub fn log_span(&self, key: &ResourceKey) -> Option<(u64, u64)> {
        let started = self
            .log
            .iter()
            .find(|e| &e.key == key && e.phase == LogPhase::Started)?;
        let finished = self
            .log
            .iter()
            .find(|e| &e.key == key && e.phase == LogPhase::Finished)?;
        Some((started.seq, finished.seq))
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    ApplyStarted {
        stack: String,
        run_id: String,
        gantry_version: String,
        operations: u32,
    },
    ResourceStarted {
        stack: String,
        resource: String,
        action: String,
    },
    ResourceConverged {
        stack: String,
        resource: String,
        action: String,
        duration_seconds: f64,
        hash: String,
    },
    ResourceFailed {
        stack: String,
        resource: String,
        error: String,
    },
    ResourceSkipped {
        stack: String,
        resource: String,
        reason: String,
    },
    ApplyCompleted {
        stack: String,
        run_id: String,
        resources_converged: u32,
        resources_failed: u32,
        resources_skipped: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

/// Convert a YAML scalar to text for `{{params.*}}` interpolation.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

// ============================================================================
// Tests
// ============================================================================
