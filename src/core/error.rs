//! GT-002: Error taxonomy.
//!
//! Parse and schema errors abort before any provider call. Reference and
//! provider errors fail only the affected operation and its dependents.

use super::types::ResourceKey;
use thiserror::Error;

/// Errors surfaced by loading, resolving, planning and applying.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GantryError {
    /// YAML syntax error or schema violation.
    #[error("malformed declaration: {0}")]
    MalformedDeclaration(String),

    /// Two resources share type and logical name.
    #[error("duplicate resource identity: {0}")]
    DuplicateIdentity(ResourceKey),

    /// A local, cross-system or asset reference could not be resolved.
    #[error("unresolved reference {reference}: {reason}")]
    UnresolvedReference { reference: String, reason: String },

    /// The secret store has no value for the key.
    #[error("missing secret '{0}'")]
    MissingSecret(String),

    /// The provider kept throttling past the attempt bound.
    #[error("throttled after {attempts} attempt(s): {message}")]
    Throttled { attempts: u32, message: String },

    /// The provider rejected the operation.
    #[error("permanent failure: {0}")]
    PermanentFailure(String),

    /// Reading or writing the state directory failed.
    #[error("state error: {0}")]
    State(String),

    /// Invalid project configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl GantryError {
    pub fn unresolved(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Errors that stop a run before any provider call is made.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::MalformedDeclaration(_) | Self::DuplicateIdentity(_) | Self::State(_) | Self::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ResourceType;

    #[test]
    fn test_gt002_display() {
        let e = GantryError::DuplicateIdentity(ResourceKey::new(ResourceType::IamRole, "role"));
        assert_eq!(e.to_string(), "duplicate resource identity: iam_role:role");

        let e = GantryError::unresolved("stack.core.apiGatewayId", "not found");
        assert!(e.to_string().contains("stack.core.apiGatewayId"));

        let e = GantryError::Throttled {
            attempts: 5,
            message: "rate exceeded".to_string(),
        };
        assert_eq!(e.to_string(), "throttled after 5 attempt(s): rate exceeded");
    }

    #[test]
    fn test_gt002_setup_classification() {
        assert!(GantryError::MalformedDeclaration("x".into()).is_setup());
        assert!(GantryError::State("disk".into()).is_setup());
        assert!(!GantryError::MissingSecret("k".into()).is_setup());
        assert!(!GantryError::PermanentFailure("denied".into()).is_setup());
    }
}
