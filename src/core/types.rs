//! Template model, stack state, plan, and provenance event types.
//!
//! Defines the YAML schema types for stack documents (parameters, mappings,
//! resources, outputs), the per-stack state file, and report types. All
//! persisted types derive Serialize/Deserialize for YAML roundtripping.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Attribute map published by a provider for a created resource.
pub type Attributes = IndexMap<String, serde_yaml_ng::Value>;

/// Mapping table: top-level key → attribute name → scalar.
pub type Mapping = IndexMap<String, IndexMap<String, serde_yaml_ng::Value>>;

// ============================================================================
// Top-level stack document
// ============================================================================

/// Root template — the desired state of one stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackTemplate {
    /// Schema version (must be "1.0")
    pub format_version: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Parameter declarations (order-preserving)
    #[serde(default)]
    pub parameters: IndexMap<String, Parameter>,

    /// Named mapping tables
    #[serde(default)]
    pub mappings: IndexMap<String, Mapping>,

    /// Resource declarations, keyed by logical id
    pub resources: IndexMap<String, ResourceDecl>,

    /// Output declarations, resolved after all resources are created
    #[serde(default)]
    pub outputs: IndexMap<String, Output>,
}

// ============================================================================
// Parameters
// ============================================================================

/// A declared template parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    /// Declared type (informational; values are YAML scalars)
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,

    /// Default value used when no override is supplied
    #[serde(default)]
    pub default: Option<serde_yaml_ng::Value>,

    /// When non-empty, the effective value must be a member
    #[serde(default)]
    pub allowed_values: Vec<serde_yaml_ng::Value>,

    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
}

fn default_param_type() -> String {
    "string".to_string()
}

// ============================================================================
// Resources
// ============================================================================

/// A single declared resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Provider resource kind. Opaque to the engine.
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Property bag of unresolved expressions
    #[serde(default)]
    pub properties: IndexMap<String, Expr>,

    /// Explicit dependencies (other logical ids applied first)
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// An output declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    /// Value expression
    pub value: Expr,

    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
}

// ============================================================================
// Expressions
// ============================================================================

/// An intrinsic expression. Immutable once parsed; resolution is pure.
///
/// Variants deserialize untagged, so a property bag may nest plain scalars,
/// sequences, maps, and intrinsics freely:
///
/// ```yaml
/// properties:
///   bucket_name: { join: ["site-", { ref: env }] }
///   origin: { get_attr: [site_bucket, domain_name] }
///   region_tag: { find_in_map: [region_map, us-east-1, suffix] }
///   index_url: { sub: "https://${cdn.domain_name}/index.html" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expr {
    /// Parameter reference: `{ ref: name }`
    Ref {
        #[serde(rename = "ref")]
        name: String,
    },

    /// Attribute of a created resource: `{ get_attr: [logical_id, attr] }`
    GetAttr { get_attr: (String, String) },

    /// Mapping lookup: `{ find_in_map: [mapping, key, attr] }`
    FindInMap { find_in_map: (String, String, String) },

    /// String concatenation of resolved children: `{ join: [...] }`
    Join { join: Vec<Expr> },

    /// Template string with `${...}` placeholders: `{ sub: "..." }`
    Sub { sub: String },

    /// A sequence of expressions
    Seq(Vec<Expr>),

    /// A nested map of expressions
    Map(IndexMap<String, Expr>),

    /// A plain YAML scalar
    Scalar(serde_yaml_ng::Value),
}

impl Expr {
    /// Shorthand for a string literal.
    pub fn str(s: &str) -> Self {
        Expr::Scalar(serde_yaml_ng::Value::String(s.to_string()))
    }
}

// ============================================================================
// Resource lifecycle
// ============================================================================

/// Per-resource lifecycle state. Transitions are owned exclusively by the
/// engine's scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Pending,
    Creating,
    Created,
    Failed,
    RolledBack,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Creating => write!(f, "CREATING"),
            Self::Created => write!(f, "CREATED"),
            Self::Failed => write!(f, "FAILED"),
            Self::RolledBack => write!(f, "ROLLED-BACK"),
        }
    }
}

// ============================================================================
// Stack state file
// ============================================================================

/// Per-stack state file. Records what the engine has provisioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackState {
    /// Schema version
    pub schema: String,

    /// Stack name
    pub stack: String,

    /// When the state was generated
    pub generated_at: String,

    /// Generator version
    pub generator: String,

    /// Per-resource records, in creation order
    pub resources: IndexMap<String, ResourceRecord>,
}

/// Per-resource state record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Resource type
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Last recorded lifecycle state
    pub status: ResourceState,

    /// Provider-assigned physical id (absent for failed creates)
    #[serde(default)]
    pub physical_id: Option<String>,

    /// When the resource was last applied
    #[serde(default)]
    pub applied_at: Option<String>,

    /// BLAKE3 hash of the declared properties at last apply
    pub properties_hash: String,

    /// Attributes published by the provider at last apply
    #[serde(default)]
    pub attributes: Attributes,
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Destroy,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    /// Logical resource id
    pub resource_id: String,

    /// Resource type
    pub resource_type: String,

    /// Action to take
    pub action: PlanAction,

    /// Human-readable description
    pub description: String,
}

/// Full stack plan.
#[derive(Debug, Clone)]
pub struct StackPlan {
    /// Stack name
    pub stack: String,

    /// Planned changes in creation order
    pub changes: Vec<PlannedChange>,

    /// Topological creation order (logical ids)
    pub creation_order: Vec<String>,

    /// Summary counts
    pub to_create: u32,
    pub to_update: u32,
    pub to_destroy: u32,
    pub unchanged: u32,
}

impl StackPlan {
    /// Look up the planned action for a resource. Unknown ids plan as Create.
    pub fn action_for(&self, resource_id: &str) -> PlanAction {
        self.changes
            .iter()
            .find(|c| c.resource_id == resource_id)
            .map(|c| c.action)
            .unwrap_or(PlanAction::Create)
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StackEvent {
    ApplyStarted {
        stack: String,
        run_id: String,
        engine_version: String,
    },
    ResourceStarted {
        stack: String,
        resource: String,
        action: String,
    },
    ResourceCreated {
        stack: String,
        resource: String,
        physical_id: String,
        duration_seconds: f64,
    },
    ResourceUpdated {
        stack: String,
        resource: String,
        physical_id: String,
        duration_seconds: f64,
    },
    ResourceUnchanged {
        stack: String,
        resource: String,
    },
    ResourceFailed {
        stack: String,
        resource: String,
        error: String,
    },
    ResourceRolledBack {
        stack: String,
        resource: String,
        physical_id: String,
    },
    RollbackFailed {
        stack: String,
        resource: String,
        error: String,
    },
    ApplyCompleted {
        stack: String,
        run_id: String,
        created: u32,
        unchanged: u32,
        failed: u32,
        rolled_back: u32,
        total_seconds: f64,
    },
    DestroyCompleted {
        stack: String,
        deleted: u32,
        failed: u32,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: StackEvent,
}

// ============================================================================
// Apply / destroy reports
// ============================================================================

/// Final outcome for one resource in an apply run.
#[derive(Debug, Clone)]
pub struct ResourceOutcome {
    /// Resource type
    pub resource_type: String,

    /// Final lifecycle state
    pub state: ResourceState,

    /// True when the resource was already converged and skipped
    pub unchanged: bool,

    /// Provider-assigned physical id, when one exists
    pub physical_id: Option<String>,

    /// Creation/update error, when the resource failed
    pub error: Option<String>,

    /// Rollback error — the resource is still Created and needs operator
    /// attention
    pub rollback_error: Option<String>,
}

/// Result of an apply run. Produced on both full success and partial failure.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub stack: String,
    pub run_id: String,

    /// Per-resource outcomes, keyed by logical id, in creation order
    pub outcomes: IndexMap<String, ResourceOutcome>,

    /// Resolved outputs — populated only when every resource is Created
    pub outputs: IndexMap<String, serde_yaml_ng::Value>,

    pub total_duration: std::time::Duration,
}

impl ApplyReport {
    pub fn count(&self, state: ResourceState) -> u32 {
        self.outcomes.values().filter(|o| o.state == state).count() as u32
    }

    /// Resources created or updated by this run.
    pub fn created(&self) -> u32 {
        self.outcomes
            .values()
            .filter(|o| o.state == ResourceState::Created && !o.unchanged)
            .count() as u32
    }

    /// Resources already converged and skipped.
    pub fn unchanged(&self) -> u32 {
        self.outcomes.values().filter(|o| o.unchanged).count() as u32
    }

    /// True when every resource ended Created with no rollback residue.
    pub fn is_success(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| o.state == ResourceState::Created && o.rollback_error.is_none())
    }

    /// True when any rollback delete failed.
    pub fn has_rollback_failure(&self) -> bool {
        self.outcomes.values().any(|o| o.rollback_error.is_some())
    }
}

/// Result of a destroy run.
#[derive(Debug, Clone)]
pub struct DestroyReport {
    pub stack: String,
    pub deleted: u32,

    /// Delete failures, keyed by logical id
    pub failures: IndexMap<String, String>,
}

// ============================================================================
// Scalar helper
// ============================================================================

/// Coerce a resolved YAML scalar to its string representation.
/// Returns None for sequences and maps.
pub fn scalar_to_string(val: &serde_yaml_ng::Value) -> Option<String> {
    match val {
        serde_yaml_ng::Value::String(s) => Some(s.clone()),
        serde_yaml_ng::Value::Number(n) => Some(n.to_string()),
        serde_yaml_ng::Value::Bool(b) => Some(b.to_string()),
        serde_yaml_ng::Value::Null => Some(String::new()),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parse() {
        let yaml = r#"
format_version: "1.0"
description: static site stack
parameters:
  env:
    type: string
    default: dev
    allowed_values: [dev, prod]
mappings:
  region_map:
    us-east-1:
      suffix: use1
resources:
  site_bucket:
    type: storage_bucket
    properties:
      bucket_name: { join: ["site-", { ref: env }] }
  cdn:
    type: cdn_distribution
    depends_on: [site_bucket]
    properties:
      origin: { get_attr: [site_bucket, domain_name] }
outputs:
  url:
    value: { sub: "https://${cdn.domain_name}/" }
    description: site entry point
"#;
        let t: StackTemplate = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(t.format_version, "1.0");
        assert_eq!(t.parameters.len(), 1);
        assert_eq!(t.mappings["region_map"]["us-east-1"]["suffix"], "use1");
        assert_eq!(t.resources.len(), 2);
        assert_eq!(t.resources["cdn"].depends_on, vec!["site_bucket"]);
        assert_eq!(t.outputs.len(), 1);
    }

    #[test]
    fn test_expr_untagged_variants() {
        let e: Expr = serde_yaml_ng::from_str("{ ref: env }").unwrap();
        assert_eq!(e, Expr::Ref { name: "env".to_string() });

        let e: Expr = serde_yaml_ng::from_str("{ get_attr: [bucket, arn] }").unwrap();
        assert_eq!(
            e,
            Expr::GetAttr { get_attr: ("bucket".to_string(), "arn".to_string()) }
        );

        let e: Expr = serde_yaml_ng::from_str("{ find_in_map: [m, k, a] }").unwrap();
        assert!(matches!(e, Expr::FindInMap { .. }));

        let e: Expr = serde_yaml_ng::from_str(r#"{ join: ["a", { ref: env }] }"#).unwrap();
        assert!(matches!(e, Expr::Join { ref join } if join.len() == 2));

        let e: Expr = serde_yaml_ng::from_str(r#"{ sub: "x-${env}" }"#).unwrap();
        assert!(matches!(e, Expr::Sub { .. }));
    }

    #[test]
    fn test_expr_plain_values() {
        let e: Expr = serde_yaml_ng::from_str("hello").unwrap();
        assert_eq!(e, Expr::str("hello"));

        let e: Expr = serde_yaml_ng::from_str("[1, 2]").unwrap();
        assert!(matches!(e, Expr::Seq(ref v) if v.len() == 2));

        // A map without an intrinsic key stays a plain nested map
        let e: Expr = serde_yaml_ng::from_str("{ index_document: index.html }").unwrap();
        assert!(matches!(e, Expr::Map(ref m) if m.contains_key("index_document")));
    }

    #[test]
    fn test_parameter_defaults() {
        let p: Parameter = serde_yaml_ng::from_str("default: dev").unwrap();
        assert_eq!(p.param_type, "string");
        assert!(p.allowed_values.is_empty());
        assert_eq!(p.default, Some(serde_yaml_ng::Value::String("dev".into())));
    }

    #[test]
    fn test_resource_state_display() {
        assert_eq!(ResourceState::Pending.to_string(), "PENDING");
        assert_eq!(ResourceState::Created.to_string(), "CREATED");
        assert_eq!(ResourceState::RolledBack.to_string(), "ROLLED-BACK");
    }

    #[test]
    fn test_plan_action_display() {
        assert_eq!(PlanAction::Create.to_string(), "CREATE");
        assert_eq!(PlanAction::NoOp.to_string(), "NO-OP");
    }

    #[test]
    fn test_stack_state_roundtrip() {
        let mut resources = IndexMap::new();
        resources.insert(
            "site_bucket".to_string(),
            ResourceRecord {
                resource_type: "storage_bucket".to_string(),
                status: ResourceState::Created,
                physical_id: Some("storage_bucket-0001".to_string()),
                applied_at: Some("2026-08-01T12:00:00Z".to_string()),
                properties_hash: "blake3:abc123".to_string(),
                attributes: IndexMap::new(),
            },
        );
        let state = StackState {
            schema: "1.0".to_string(),
            stack: "site".to_string(),
            generated_at: "2026-08-01T12:00:00Z".to_string(),
            generator: "armazon 0.3.0".to_string(),
            resources,
        };
        let yaml = serde_yaml_ng::to_string(&state).unwrap();
        let back: StackState = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(back.stack, "site");
        assert_eq!(back.resources["site_bucket"].status, ResourceState::Created);
    }

    #[test]
    fn test_stack_event_serde() {
        let event = StackEvent::ApplyStarted {
            stack: "site".to_string(),
            run_id: "r-abc".to_string(),
            engine_version: "0.3.0".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"apply_started\""));
        assert!(json.contains("\"run_id\":\"r-abc\""));
    }

    #[test]
    fn test_scalar_to_string() {
        assert_eq!(
            scalar_to_string(&serde_yaml_ng::Value::String("hello".into())),
            Some("hello".to_string())
        );
        assert_eq!(
            scalar_to_string(&serde_yaml_ng::Value::Bool(true)),
            Some("true".to_string())
        );
        assert_eq!(
            scalar_to_string(&serde_yaml_ng::Value::Null),
            Some(String::new())
        );
        let seq: serde_yaml_ng::Value = serde_yaml_ng::from_str("[1]").unwrap();
        assert_eq!(scalar_to_string(&seq), None);
    }

    #[test]
    fn test_plan_action_for() {
        let plan = StackPlan {
            stack: "s".to_string(),
            changes: vec![PlannedChange {
                resource_id: "a".to_string(),
                resource_type: "t".to_string(),
                action: PlanAction::NoOp,
                description: "a: no changes".to_string(),
            }],
            creation_order: vec!["a".to_string()],
            to_create: 0,
            to_update: 0,
            to_destroy: 0,
            unchanged: 1,
        };
        assert_eq!(plan.action_for("a"), PlanAction::NoOp);
        assert_eq!(plan.action_for("ghost"), PlanAction::Create);
    }
}
