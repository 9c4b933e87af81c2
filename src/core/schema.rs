//! GT-003: Provider-defined resource schemas.
//!
//! Each resource type declares its known properties (kind, required,
//! immutable), the output attributes its provider reports, and an optional
//! identity property. Declarations are checked against these at load time.

use super::types::{ReplaceStrategy, ResourceType};
use super::value::PropertyValue;
use indexmap::IndexMap;
use self::PropertyKind as K;

/// Kind of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    String,
    Integer,
    Bool,
    StringList,
    StringMap,
    /// Arbitrary nested structure (policy documents)
    Document,
    /// Local file or directory path; its BLAKE3 hash takes part in diffing
    Asset,
}

impl PropertyKind {
    fn describe(&self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Integer => "an integer",
            Self::Bool => "a boolean",
            Self::StringList => "a list of strings",
            Self::StringMap => "a map of strings",
            Self::Document => "a document",
            Self::Asset => "a path",
        }
    }

    /// Check a declared value against this kind. Single references are
    /// accepted for scalar kinds; their type is only known once resolved.
    pub fn check(&self, value: &PropertyValue) -> Result<(), String> {
        let ok = match (self, value) {
            (Self::Document, _) => true,
            (Self::String | Self::Asset, PropertyValue::Literal(v)) => v.is_string(),
            (Self::String, PropertyValue::Template(_)) => true,
            (Self::Asset, PropertyValue::Template(t)) => !t.contains_secret(),
            (Self::Integer, PropertyValue::Literal(v)) => v.is_i64() || v.is_u64(),
            (Self::Bool, PropertyValue::Literal(v)) => v.is_boolean(),
            (Self::Integer | Self::Bool, PropertyValue::Template(t)) => t.is_single_reference(),
            (Self::StringList, PropertyValue::List(items)) => {
                items.iter().all(|i| Self::String.check(i).is_ok())
            }
            (Self::StringMap, PropertyValue::Map(entries)) => {
                entries.values().all(|v| Self::String.check(v).is_ok())
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("expected {}", self.describe()))
        }
    }
}

/// One known property of a resource type.
#[derive(Debug, Clone, Copy)]
pub struct PropertySpec {
    pub name: &'static str,
    pub kind: PropertyKind,
    pub required: bool,
    /// A change cannot be applied in place
    pub immutable: bool,
}

const fn opt(name: &'static str, kind: PropertyKind) -> PropertySpec {
    PropertySpec {
        name,
        kind,
        required: false,
        immutable: false,
    }
}

const fn req(name: &'static str, kind: PropertyKind) -> PropertySpec {
    PropertySpec {
        name,
        kind,
        required: true,
        immutable: false,
    }
}

const fn fixed(spec: PropertySpec) -> PropertySpec {
    PropertySpec {
        immutable: true,
        ..spec
    }
}

/// Schema of one resource type.
#[derive(Debug)]
pub struct ResourceSchema {
    pub resource_type: ResourceType,
    pub properties: &'static [PropertySpec],
    pub outputs: &'static [&'static str],
    /// Property that pins the provider-side name, when declared
    pub identity: Option<&'static str>,
}

static HTTP_API: ResourceSchema = ResourceSchema {
    resource_type: ResourceType::HttpApi,
    properties: &[
        req("name", K::String),
        fixed(opt("protocol_type", K::String)),
        opt("description", K::String),
    ],
    outputs: &["id", "api_endpoint", "execution_arn"],
    identity: None,
};

static IAM_ROLE: ResourceSchema = ResourceSchema {
    resource_type: ResourceType::IamRole,
    properties: &[
        fixed(opt("name", K::String)),
        fixed(req("assume_role_service", K::String)),
        opt("inline_policies", K::Document),
        opt("managed_policy_arns", K::StringList),
    ],
    outputs: &["arn", "name", "id"],
    identity: Some("name"),
};

static LAMBDA_FUNCTION: ResourceSchema = ResourceSchema {
    resource_type: ResourceType::LambdaFunction,
    properties: &[
        fixed(opt("function_name", K::String)),
        req("role", K::String),
        req("runtime", K::String),
        req("handler", K::String),
        req("code", K::Asset),
        opt("timeout", K::Integer),
        opt("memory_size", K::Integer),
        opt("environment", K::StringMap),
    ],
    outputs: &["arn", "name", "invoke_arn"],
    identity: Some("function_name"),
};

static APIGW_INTEGRATION: ResourceSchema = ResourceSchema {
    resource_type: ResourceType::ApigwIntegration,
    properties: &[
        fixed(req("api_id", K::String)),
        fixed(req("integration_type", K::String)),
        req("integration_uri", K::String),
        opt("payload_format_version", K::String),
    ],
    outputs: &["id"],
    identity: None,
};

static APIGW_ROUTE: ResourceSchema = ResourceSchema {
    resource_type: ResourceType::ApigwRoute,
    properties: &[
        fixed(req("api_id", K::String)),
        req("route_key", K::String),
        opt("target", K::String),
    ],
    outputs: &["id"],
    identity: None,
};

static APIGW_STAGE: ResourceSchema = ResourceSchema {
    resource_type: ResourceType::ApigwStage,
    properties: &[
        fixed(req("api_id", K::String)),
        fixed(req("name", K::String)),
        opt("auto_deploy", K::Bool),
    ],
    outputs: &["id", "invoke_url"],
    identity: Some("name"),
};

static LAMBDA_PERMISSION: ResourceSchema = ResourceSchema {
    resource_type: ResourceType::LambdaPermission,
    properties: &[
        fixed(req("action", K::String)),
        fixed(req("function", K::String)),
        fixed(req("principal", K::String)),
        fixed(opt("source_arn", K::String)),
    ],
    outputs: &["id"],
    identity: None,
};

static DYNAMODB_TABLE: ResourceSchema = ResourceSchema {
    resource_type: ResourceType::DynamodbTable,
    properties: &[
        fixed(opt("name", K::String)),
        fixed(req("hash_key", K::String)),
        fixed(opt("hash_key_type", K::String)),
        fixed(opt("range_key", K::String)),
        opt("billing_mode", K::String),
        opt("stream_enabled", K::Bool),
    ],
    outputs: &["arn", "name", "stream_arn"],
    identity: Some("name"),
};

impl ResourceType {
    pub fn schema(&self) -> &'static ResourceSchema {
        match self {
            Self::HttpApi => &HTTP_API,
            Self::IamRole => &IAM_ROLE,
            Self::LambdaFunction => &LAMBDA_FUNCTION,
            Self::ApigwIntegration => &APIGW_INTEGRATION,
            Self::ApigwRoute => &APIGW_ROUTE,
            Self::ApigwStage => &APIGW_STAGE,
            Self::LambdaPermission => &LAMBDA_PERMISSION,
            Self::DynamodbTable => &DYNAMODB_TABLE,
        }
    }
}

impl ResourceSchema {
    pub fn property(&self, name: &str) -> Option<&'static PropertySpec> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn is_immutable(&self, name: &str) -> bool {
        self.property(name).is_some_and(|p| p.immutable)
    }

    pub fn has_output(&self, attribute: &str) -> bool {
        self.outputs.contains(&attribute)
    }

    /// Replacement sequencing for a declaration: pinning the identity
    /// property means old and new cannot coexist.
    pub fn replace_strategy<V>(&self, declared: &IndexMap<String, V>) -> ReplaceStrategy {
        match self.identity {
            Some(id) if declared.contains_key(id) => ReplaceStrategy::DeleteBeforeCreate,
            _ => ReplaceStrategy::CreateBeforeDelete,
        }
    }

    /// Validate a property map. Returns one message per problem.
    pub fn validate(&self, properties: &IndexMap<String, PropertyValue>) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, value) in properties {
            match self.property(name) {
                None => errors.push(format!(
                    "unknown property '{}' for {}",
                    name, self.resource_type
                )),
                Some(spec) => {
                    if let Err(e) = spec.kind.check(value) {
                        errors.push(format!("property '{}': {}", name, e));
                    }
                }
            }
        }
        for spec in self.properties.iter().filter(|p| p.required) {
            if !properties.contains_key(spec.name) {
                errors.push(format!("missing required property '{}'", spec.name));
            }
        }
        errors
    }
}
