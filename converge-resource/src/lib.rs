//! Resource schemas, attribute diffing and the capability contract that
//! backends implement to be reconciled by `converge`.

pub mod diff;
pub mod error;
pub mod framework;
pub mod memory;
pub mod schema;
pub mod value;

pub use diff::{diff, Change, ChangeKind, ChangeSet};
pub use error::{Error, Result, ValidationError};
pub use framework::{BackendId, Operation, ProviderError, ProviderResult, ResourceProvider};
pub use schema::{AttributeDef, AttributeType, Nesting, Schema};
pub use value::{AttributePath, AttributeValue, Attributes};
