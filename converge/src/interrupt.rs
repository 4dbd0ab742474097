use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context as _;

use crate::error::{Error, Result};

/// Shared cancellation flag.
///
/// Reconciliation checks it before every remote call, so an interrupt lets the
/// call in progress finish and its result be recorded, then stops.
#[derive(Clone, Debug, Default)]
pub struct InterruptState {
    interrupted: Arc<AtomicBool>,
}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Interrupted`] when cancellation was requested.
    pub fn check_interrupted(&self, resource: &str) -> Result<()> {
        if self.is_interrupted() {
            tracing::warn!(resource, "interrupted; not issuing further calls");
            Err(Error::Interrupted(resource.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Route Ctrl-C to a fresh [`InterruptState`].
pub fn set_up_process_interrupt_handler() -> anyhow::Result<InterruptState> {
    let interrupt_state = InterruptState::new();
    let handler_state = interrupt_state.clone();
    ctrlc::set_handler(move || {
        if handler_state.is_interrupted() {
            // Second Ctrl-C: give up without waiting for calls in flight.
            std::process::exit(130);
        }
        eprintln!("Interrupted; waiting for calls in progress to finish. Press Ctrl-C again to abort.");
        handler_state.set_interrupted();
    })
    .context("setting interrupt handler")?;
    Ok(interrupt_state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let a = InterruptState::new();
        let b = a.clone();
        assert!(a.check_interrupted("pg").is_ok());
        b.set_interrupted();
        assert!(a.is_interrupted());
        assert!(matches!(
            a.check_interrupted("pg"),
            Err(Error::Interrupted(name)) if name == "pg"
        ));
    }
}
