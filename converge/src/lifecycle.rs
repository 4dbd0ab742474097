//! Lifecycle of a single managed resource.
//!
//! ```text
//! Absent --create--> Creating --ok--> Present --update--> Updating --ok--> Present
//!                       |                |                    |
//!                     fail            destroy               fail -> Present
//!                       v                v
//!                     Absent        Destroying --ok--> Absent
//!                                        |
//!                                      fail -> Present
//! ```

use converge_resource::{Attributes, BackendId};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Lifecycle {
    Absent,
    Creating,
    Present,
    Updating,
    Destroying,
}

impl Lifecycle {
    pub fn can_transition(self, to: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, to),
            (Absent, Creating)
                | (Creating, Present)
                | (Creating, Absent)
                | (Present, Updating)
                | (Updating, Present)
                | (Present, Destroying)
                | (Destroying, Absent)
                | (Destroying, Present)
        )
    }

    /// Checked step along one edge of the lifecycle.
    pub fn transition(self, name: &str, to: Lifecycle) -> Result<Lifecycle> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(Error::IllegalTransition {
                name: name.to_string(),
                from: self,
                to,
            })
        }
    }

    /// Whether no remote call is in progress.
    pub fn is_settled(self) -> bool {
        matches!(self, Lifecycle::Absent | Lifecycle::Present)
    }
}

/// A named resource as the controller sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInstance {
    pub name: String,
    pub backend_id: Option<BackendId>,
    pub attributes: Option<Attributes>,
    pub lifecycle: Lifecycle,
}

impl ResourceInstance {
    pub fn absent(name: &str) -> ResourceInstance {
        ResourceInstance {
            name: name.to_string(),
            backend_id: None,
            attributes: None,
            lifecycle: Lifecycle::Absent,
        }
    }

    pub fn present(name: &str, id: BackendId, attributes: Attributes) -> ResourceInstance {
        ResourceInstance {
            name: name.to_string(),
            backend_id: Some(id),
            attributes: Some(attributes),
            lifecycle: Lifecycle::Present,
        }
    }

    pub fn is_present(&self) -> bool {
        self.lifecycle == Lifecycle::Present
    }

    pub(crate) fn advance(&mut self, to: Lifecycle) -> Result<()> {
        let to = self.lifecycle.transition(&self.name, to)?;
        tracing::info!(resource = %self.name, from = ?self.lifecycle, to = ?to, "lifecycle");
        self.lifecycle = to;
        Ok(())
    }

    /// Mark the instance as gone.
    pub(crate) fn clear(&mut self) -> Result<()> {
        self.advance(Lifecycle::Absent)?;
        self.backend_id = None;
        self.attributes = None;
        Ok(())
    }
}
