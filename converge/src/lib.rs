//! Reconciles remote resources with a declarative configuration.
//!
//! The [`Controller`](controller::Controller) owns the [`StateStore`](state::StateStore)
//! and drives each resource through its [`Lifecycle`](lifecycle::Lifecycle) using
//! a backend's [`ResourceProvider`](converge_resource::ResourceProvider)
//! capabilities.

pub mod acceptance;
pub mod controller;
pub mod error;
pub mod interrupt;
pub mod lifecycle;
pub mod state;
pub mod state_file;
pub mod verify;

pub use controller::{Controller, ControllerOptions, Plan};
pub use error::{Error, Result};
pub use lifecycle::{Lifecycle, ResourceInstance};
