//! The capability contract a backend implements to be reconciled.

use std::{
    fmt::{self, Display},
    str::FromStr,
    time::Duration,
};

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{diff::ChangeSet, value::Attributes};

/// Opaque identifier assigned by the backend on creation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(pub String);

impl BackendId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BackendId {
    fn from(s: &str) -> Self {
        BackendId(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Exists,
}

impl Operation {
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Operation::Create | Operation::Update | Operation::Delete
        )
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Exists => "exists",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The backend has no resource with this id.
    #[error("resource {0} not found")]
    NotFound(BackendId),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Any other backend failure, kept as the backend reported it.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, PartialEq)]
pub struct CreateResourceResponse {
    pub id: BackendId,
    pub attributes: Attributes,
}

/// Create/Read/Update/Delete/Exists against one kind of remote resource.
///
/// Implementations may block for a long time; callers put their own timeout
/// around each call. A provider value is built once per process and passed by
/// reference wherever it is needed.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn create(&self, attributes: &Attributes) -> ProviderResult<CreateResourceResponse>;

    /// Fails with [`ProviderError::NotFound`] when the resource is gone.
    async fn read(&self, id: &BackendId) -> ProviderResult<Attributes>;

    /// Apply the in-place `changes`. Returns the attributes after the update.
    async fn update(&self, id: &BackendId, changes: &ChangeSet) -> ProviderResult<Attributes>;

    async fn delete(&self, id: &BackendId) -> ProviderResult<()>;

    async fn exists(&self, id: &BackendId) -> ProviderResult<bool>;
}

/// When a backend applies a changed parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyMethod {
    Immediate,
    PendingReboot,
}

impl ApplyMethod {
    /// Conventional name of the block field holding the apply method.
    pub const ATTRIBUTE: &'static str = "apply_method";

    /// The apply method declared by a block, `Immediate` when unset.
    pub fn of_block(block: &Attributes) -> anyhow::Result<ApplyMethod> {
        match block.get(Self::ATTRIBUTE).and_then(|v| v.as_str()) {
            None => Ok(ApplyMethod::Immediate),
            Some(s) => s.parse(),
        }
    }
}

impl FromStr for ApplyMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "immediate" => Ok(ApplyMethod::Immediate),
            "pending-reboot" => Ok(ApplyMethod::PendingReboot),
            other => bail!("unknown apply method: {}", other),
        }
    }
}

impl Display for ApplyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyMethod::Immediate => write!(f, "immediate"),
            ApplyMethod::PendingReboot => write!(f, "pending-reboot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::AttributeValue;

    #[test]
    fn apply_method_from_block() {
        let mut block = Attributes::new();
        assert_eq!(ApplyMethod::of_block(&block).unwrap(), ApplyMethod::Immediate);
        block.insert(
            ApplyMethod::ATTRIBUTE.to_string(),
            AttributeValue::from("pending-reboot"),
        );
        assert_eq!(
            ApplyMethod::of_block(&block).unwrap(),
            ApplyMethod::PendingReboot
        );
        block.insert(ApplyMethod::ATTRIBUTE.to_string(), "later".into());
        assert!(ApplyMethod::of_block(&block).is_err());
    }

    #[test]
    fn provider_error_classes() {
        assert!(ProviderError::NotFound("pg-1".into()).is_not_found());
        assert!(!ProviderError::Timeout(Duration::from_secs(1)).is_not_found());
        let other: ProviderError = anyhow::anyhow!("throttled").into();
        assert!(!other.is_not_found());
        assert_eq!(other.to_string(), "throttled");
        assert_eq!(
            ProviderError::NotFound("pg-1".into()).to_string(),
            "resource pg-1 not found"
        );
    }

    #[test]
    fn mutating_operations() {
        assert!(Operation::Create.is_mutating());
        assert!(Operation::Delete.is_mutating());
        assert!(!Operation::Read.is_mutating());
        assert!(!Operation::Exists.is_mutating());
    }
}
