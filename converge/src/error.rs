use converge_resource::{AttributePath, AttributeValue, BackendId, Operation, ProviderError};

use crate::lifecycle::Lifecycle;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration, or stored state that no longer fits the schema.
    #[error(transparent)]
    Resource(#[from] converge_resource::Error),

    /// A mutating call failed. The instance keeps its previous state.
    #[error("failed to {operation} resource {name}")]
    Apply {
        operation: Operation,
        name: String,
        #[source]
        source: ProviderError,
    },

    /// A read or existence check failed, so the remote state is unknown.
    #[error("could not {operation} resource {name}")]
    Backend {
        operation: Operation,
        name: String,
        #[source]
        source: ProviderError,
    },

    #[error("resource {name}: {path} is {}, expected {expected}", show(.actual))]
    AssertionFailed {
        name: String,
        path: AttributePath,
        expected: AttributeValue,
        actual: Option<AttributeValue>,
    },

    #[error("resource {name}: check failed")]
    CheckFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The plan was computed against state that has changed since.
    #[error("plan for resource {name} is out of date; plan again")]
    StalePlan { name: String },

    #[error("resource {name} is already recorded as {id}; refusing to create another")]
    AlreadyManaged { name: String, id: BackendId },

    #[error("resource {name}: {step}; teardown also failed: {teardown}")]
    TeardownFailed {
        name: String,
        step: Box<Error>,
        teardown: Box<Error>,
    },

    #[error("resource {name} ({id}) still exists after destroy")]
    StillExists { name: String, id: BackendId },

    #[error("interrupted before reconciling {0}")]
    Interrupted(String),

    #[error("resource {name} cannot go from {from:?} to {to:?}")]
    IllegalTransition {
        name: String,
        from: Lifecycle,
        to: Lifecycle,
    },
}

fn show(value: &Option<AttributeValue>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "unset".to_string(),
    }
}

impl Error {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Resource(converge_resource::Error::Validation(_))
        )
    }

    /// The backend error behind this failure, if any.
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Error::Apply { source, .. } | Error::Backend { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
