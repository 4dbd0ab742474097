//! Multi-step scenarios against a real backend.
//!
//! A [`TestCase`] applies each step's configuration in turn, checks the
//! backend after every step, and always destroys what it created at the end,
//! even when a step failed.

use std::fmt;

use anyhow::anyhow;
use converge_resource::{AttributeValue, Attributes, ResourceProvider, Schema};

use crate::{
    controller::{Controller, ControllerOptions},
    error::{Error, Result},
    interrupt::InterruptState,
    lifecycle::ResourceInstance,
    state::StateStore,
    verify::{check_attributes, check_block_set, Verifier},
};

pub enum Check {
    /// The backend reports the resource as existing.
    Exists,
    /// The attribute at this flat path, as read from the backend.
    Attribute(String, AttributeValue),
    /// The block list attribute holds exactly these blocks, in any order.
    BlockSet(String, Vec<AttributeValue>),
    /// Anything else, on the attributes read from the backend.
    Custom(Box<dyn Fn(&Attributes) -> anyhow::Result<()> + Send + Sync>),
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Exists => write!(f, "Exists"),
            Check::Attribute(path, value) => write!(f, "Attribute({}, {})", path, value),
            Check::BlockSet(attribute, blocks) => {
                write!(f, "BlockSet({}, {} blocks)", attribute, blocks.len())
            }
            Check::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl Check {
    pub fn attribute(path: &str, value: impl Into<AttributeValue>) -> Check {
        Check::Attribute(path.to_string(), value.into())
    }
}

#[derive(Debug)]
pub struct TestStep {
    pub config: Attributes,
    pub checks: Vec<Check>,
}

#[derive(Debug)]
pub struct TestCase {
    /// Local name of the resource under test.
    pub resource: String,
    pub steps: Vec<TestStep>,
    pub options: ControllerOptions,
}

impl TestCase {
    pub fn new(resource: &str) -> TestCase {
        TestCase {
            resource: resource.to_string(),
            steps: Vec::new(),
            options: ControllerOptions::default(),
        }
    }

    pub fn step(mut self, config: Attributes, checks: Vec<Check>) -> TestCase {
        self.steps.push(TestStep { config, checks });
        self
    }

    /// Run all steps, then destroy the resource and confirm it is gone.
    ///
    /// The first failing step stops the run; teardown happens regardless. If
    /// both fail, [`Error::TeardownFailed`] carries both errors.
    pub async fn run(&self, provider: &dyn ResourceProvider, schema: &Schema) -> Result<()> {
        let controller = Controller::new(
            schema.clone(),
            StateStore::new(),
            self.options.clone(),
            InterruptState::new(),
        );
        let steps = self.run_steps(provider, &controller).await;
        let teardown = self.teardown(provider, &controller).await;
        match (steps, teardown) {
            (Ok(()), teardown) => teardown,
            (Err(step), Ok(())) => Err(step),
            (Err(step), Err(teardown)) => {
                tracing::error!(
                    resource = %self.resource,
                    error = %teardown,
                    "teardown failed after a failed step; the resource may be left behind"
                );
                Err(Error::TeardownFailed {
                    name: self.resource.clone(),
                    step: Box::new(step),
                    teardown: Box::new(teardown),
                })
            }
        }
    }

    async fn run_steps(
        &self,
        provider: &dyn ResourceProvider,
        controller: &Controller,
    ) -> Result<()> {
        let verifier = Verifier::new(provider).with_call_timeout(self.options.call_timeout);
        for (i, step) in self.steps.iter().enumerate() {
            tracing::info!(resource = %self.resource, step = i, "acceptance step");
            let instance = controller
                .reconcile(provider, &self.resource, &step.config)
                .await?;
            run_checks(&verifier, &instance, &step.checks).await?;
        }
        Ok(())
    }

    async fn teardown(&self, provider: &dyn ResourceProvider, controller: &Controller) -> Result<()> {
        let before = controller.instance(&self.resource);
        controller.destroy(provider, &self.resource).await?;
        Verifier::new(provider)
            .with_call_timeout(self.options.call_timeout)
            .confirm_destroyed(&before)
            .await
    }
}

async fn run_checks(
    verifier: &Verifier<'_>,
    instance: &ResourceInstance,
    checks: &[Check],
) -> Result<()> {
    for check in checks {
        if matches!(check, Check::Exists) && !verifier.exists(instance).await? {
            return Err(Error::CheckFailed {
                name: instance.name.clone(),
                source: anyhow!("resource does not exist"),
            });
        }
    }
    if checks.iter().all(|c| matches!(c, Check::Exists)) {
        return Ok(());
    }
    let attributes = verifier.read(instance).await?;
    for check in checks {
        match check {
            Check::Exists => {}
            Check::Attribute(path, value) => {
                check_attributes(&instance.name, &attributes, &[(path, value.clone())])?
            }
            Check::BlockSet(attribute, blocks) => {
                check_block_set(&instance.name, &attributes, attribute, blocks)?
            }
            Check::Custom(f) => f(&attributes).map_err(|source| Error::CheckFailed {
                name: instance.name.clone(),
                source,
            })?,
        }
    }
    Ok(())
}
