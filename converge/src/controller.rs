//! Drives resource instances through their lifecycle.
//!
//! Reconciling one instance is: refresh it if a previous call left it in an
//! unknown state, validate the desired configuration, diff it against the
//! stored state, then issue the Create, Update or Delete+Create the diff calls
//! for. Every mutating call that succeeds is followed by a Read, and the Read
//! result is what gets stored.
//!
//! Calls for the same instance are serialized by a per-name lock; distinct
//! instances proceed concurrently.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use converge_resource::{
    diff, Attributes, BackendId, ChangeSet, Operation, ProviderError, ProviderResult,
    ResourceProvider, Schema,
};
use tokio::sync::OwnedMutexGuard;
use tracing::Instrument as _;

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

use crate::{
    error::{Error, Result},
    interrupt::InterruptState,
    lifecycle::{Lifecycle, ResourceInstance},
    state::{StateStore, StoredResource},
    verify::{with_timeout, Verifier},
};

#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    /// Upper bound for every single backend call. `None` waits forever.
    pub call_timeout: Option<Duration>,
}

/// What reconciling a resource would do.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub instance: ResourceInstance,
    /// The desired configuration with schema defaults filled in.
    pub desired: Attributes,
    pub changes: ChangeSet,
}

pub struct Controller {
    schema: Schema,
    store: StateStore,
    options: ControllerOptions,
    interrupt: InterruptState,
    locks: LockMap,
    /// Instances whose remote state is unknown after a timed-out or unverified
    /// call. They are read again before the next plan.
    untrusted: Mutex<BTreeSet<String>>,
}

impl Controller {
    pub fn new(
        schema: Schema,
        store: StateStore,
        options: ControllerOptions,
        interrupt: InterruptState,
    ) -> Controller {
        Controller {
            schema,
            store,
            options,
            interrupt,
            locks: Mutex::new(HashMap::new()),
            untrusted: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The instance as last recorded.
    pub fn instance(&self, name: &str) -> ResourceInstance {
        match self.store.get(name) {
            Some(stored) => ResourceInstance::present(name, stored.id, stored.attributes),
            None => ResourceInstance::absent(name),
        }
    }

    pub fn is_untrusted(&self, name: &str) -> bool {
        self.untrusted
            .lock()
            .expect("untrusted set poisoned")
            .contains(name)
    }

    fn set_untrusted(&self, name: &str, untrusted: bool) {
        let mut set = self.untrusted.lock().expect("untrusted set poisoned");
        if untrusted {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    async fn lock_instance(&self, name: &str) -> InstanceGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().expect("instance lock map poisoned");
            locks.entry(name.to_string()).or_default().clone()
        };
        InstanceGuard {
            locks: &self.locks,
            name: name.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// A plan may only be applied to the state it was computed from.
    fn check_fresh(&self, planned: &ResourceInstance) -> Result<()> {
        let current = self.instance(&planned.name);
        if current != *planned || self.is_untrusted(&planned.name) {
            tracing::warn!("recorded state changed since the plan was made");
            return Err(Error::StalePlan {
                name: planned.name.clone(),
            });
        }
        Ok(())
    }

    /// Validate `desired` and diff it against the stored state. No backend
    /// calls are made.
    pub fn plan(&self, name: &str, desired: &Attributes) -> Result<Plan> {
        self.schema
            .validate(desired)
            .map_err(converge_resource::Error::from)?;
        let desired = self.schema.with_defaults(desired);
        let instance = self.instance(name);
        let changes = diff(&self.schema, instance.attributes.as_ref(), &desired)?;
        Ok(Plan {
            instance,
            desired,
            changes,
        })
    }

    /// Bring the resource called `name` to the `desired` configuration.
    pub async fn reconcile(
        &self,
        provider: &dyn ResourceProvider,
        name: &str,
        desired: &Attributes,
    ) -> Result<ResourceInstance> {
        let _guard = self.lock_instance(name).await;
        async {
            if self.is_untrusted(name) {
                self.refresh_locked(provider, name).await?;
            }
            let plan = self.plan(name, desired)?;
            if !plan.changes.is_empty() {
                tracing::debug!(changes = plan.changes.len(), "planned\n{}", plan.changes);
            }
            self.apply_locked(provider, plan.instance, &plan.changes, &plan.desired)
                .await
        }
        .instrument(tracing::info_span!("reconcile", resource = name))
        .await
    }

    /// Carry out a change set computed earlier by [`Controller::plan`] for
    /// `instance`.
    pub async fn apply_change_set(
        &self,
        provider: &dyn ResourceProvider,
        instance: ResourceInstance,
        changes: &ChangeSet,
        desired: &Attributes,
    ) -> Result<ResourceInstance> {
        let name = instance.name.clone();
        let _guard = self.lock_instance(&name).await;
        async {
            self.check_fresh(&instance)?;
            self.apply_locked(provider, instance, changes, desired).await
        }
        .instrument(tracing::info_span!("apply", resource = %name))
        .await
    }

    /// Delete the resource and forget it once the backend confirms it is gone.
    pub async fn destroy(
        &self,
        provider: &dyn ResourceProvider,
        name: &str,
    ) -> Result<ResourceInstance> {
        let _guard = self.lock_instance(name).await;
        async {
            let instance = self.instance(name);
            if !instance.is_present() {
                tracing::info!("not managed; nothing to destroy");
                return Ok(instance);
            }
            self.delete_locked(provider, instance).await
        }
        .instrument(tracing::info_span!("destroy", resource = name))
        .await
    }

    /// Read the resource from the backend and record what it reports.
    pub async fn refresh(
        &self,
        provider: &dyn ResourceProvider,
        name: &str,
    ) -> Result<ResourceInstance> {
        let _guard = self.lock_instance(name).await;
        self.refresh_locked(provider, name)
            .instrument(tracing::info_span!("refresh", resource = name))
            .await
    }

    async fn call<T>(
        &self,
        name: &str,
        operation: Operation,
        call: impl std::future::Future<Output = ProviderResult<T>>,
    ) -> ProviderResult<T> {
        let r = with_timeout(self.options.call_timeout, call).await;
        match &r {
            Err(ProviderError::Timeout(t)) => {
                tracing::warn!(%operation, timeout = ?t, "backend call timed out");
                if operation.is_mutating() {
                    self.set_untrusted(name, true);
                }
            }
            Err(e) => tracing::debug!(%operation, error = %e, "backend call failed"),
            Ok(_) => tracing::trace!(%operation, "backend call succeeded"),
        }
        r
    }

    async fn refresh_locked(
        &self,
        provider: &dyn ResourceProvider,
        name: &str,
    ) -> Result<ResourceInstance> {
        let Some(stored) = self.store.get(name) else {
            self.set_untrusted(name, false);
            return Ok(ResourceInstance::absent(name));
        };
        self.interrupt.check_interrupted(name)?;
        match self.call(name, Operation::Read, provider.read(&stored.id)).await {
            Ok(attributes) => {
                if attributes != stored.attributes {
                    tracing::warn!(id = %stored.id, "remote state differs from recorded state");
                }
                self.store.put(
                    name,
                    StoredResource {
                        id: stored.id.clone(),
                        attributes: attributes.clone(),
                    },
                    "refresh",
                );
                self.set_untrusted(name, false);
                Ok(ResourceInstance::present(name, stored.id, attributes))
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(id = %stored.id, "resource disappeared from the backend");
                self.store.remove(name, "refresh");
                self.set_untrusted(name, false);
                Ok(ResourceInstance::absent(name))
            }
            Err(source) => Err(Error::Backend {
                operation: Operation::Read,
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn apply_locked(
        &self,
        provider: &dyn ResourceProvider,
        instance: ResourceInstance,
        changes: &ChangeSet,
        desired: &Attributes,
    ) -> Result<ResourceInstance> {
        if changes.is_empty() && instance.is_present() {
            tracing::debug!("up to date");
            return Ok(instance);
        }
        if !instance.is_present() {
            return self.create_locked(provider, instance, desired).await;
        }
        if changes.is_replace() {
            tracing::info!("replacing\n{}", changes);
            let instance = self.delete_locked(provider, instance).await?;
            return self.create_locked(provider, instance, desired).await;
        }
        self.update_locked(provider, instance, changes).await
    }

    async fn create_locked(
        &self,
        provider: &dyn ResourceProvider,
        mut instance: ResourceInstance,
        desired: &Attributes,
    ) -> Result<ResourceInstance> {
        let name = instance.name.clone();
        if let Some(stored) = self.store.get(&name) {
            return Err(Error::AlreadyManaged {
                name,
                id: stored.id,
            });
        }
        self.interrupt.check_interrupted(&name)?;
        instance.advance(Lifecycle::Creating)?;
        let created = match self.call(&name, Operation::Create, provider.create(desired)).await {
            Ok(created) => created,
            Err(source) => {
                instance.advance(Lifecycle::Absent)?;
                return Err(Error::Apply {
                    operation: Operation::Create,
                    name,
                    source,
                });
            }
        };
        tracing::info!(id = %created.id, "created");
        // Record the id at once so that a failed read cannot orphan the resource.
        self.store.put(
            &name,
            StoredResource {
                id: created.id.clone(),
                attributes: created.attributes,
            },
            "create",
        );
        let attributes = self.read_back(provider, &name, &created.id).await?;
        self.store.put(
            &name,
            StoredResource {
                id: created.id.clone(),
                attributes: attributes.clone(),
            },
            "read",
        );
        instance.backend_id = Some(created.id);
        instance.attributes = Some(attributes);
        instance.advance(Lifecycle::Present)?;
        Ok(instance)
    }

    async fn update_locked(
        &self,
        provider: &dyn ResourceProvider,
        mut instance: ResourceInstance,
        changes: &ChangeSet,
    ) -> Result<ResourceInstance> {
        let name = instance.name.clone();
        let id = backend_id(&instance)?;
        self.interrupt.check_interrupted(&name)?;
        instance.advance(Lifecycle::Updating)?;
        if let Err(source) = self
            .call(&name, Operation::Update, provider.update(&id, changes))
            .await
        {
            instance.advance(Lifecycle::Present)?;
            return Err(Error::Apply {
                operation: Operation::Update,
                name,
                source,
            });
        }
        tracing::info!(id = %id, "updated");
        let attributes = self.read_back(provider, &name, &id).await?;
        self.store.put(
            &name,
            StoredResource {
                id,
                attributes: attributes.clone(),
            },
            "update",
        );
        instance.attributes = Some(attributes);
        instance.advance(Lifecycle::Present)?;
        Ok(instance)
    }

    async fn delete_locked(
        &self,
        provider: &dyn ResourceProvider,
        mut instance: ResourceInstance,
    ) -> Result<ResourceInstance> {
        let name = instance.name.clone();
        let id = backend_id(&instance)?;
        self.interrupt.check_interrupted(&name)?;
        instance.advance(Lifecycle::Destroying)?;
        match self.call(&name, Operation::Delete, provider.delete(&id)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::warn!(id = %id, "already deleted");
            }
            Err(source) => {
                instance.advance(Lifecycle::Present)?;
                return Err(Error::Apply {
                    operation: Operation::Delete,
                    name,
                    source,
                });
            }
        }
        let verifier = Verifier::new(provider).with_call_timeout(self.options.call_timeout);
        if let Err(e) = verifier.confirm_destroyed(&instance).await {
            instance.advance(Lifecycle::Present)?;
            self.set_untrusted(&name, true);
            return Err(e);
        }
        tracing::info!(id = %id, "destroyed");
        self.store.remove(&name, "destroy");
        self.set_untrusted(&name, false);
        instance.clear()?;
        Ok(instance)
    }

    /// Read after a successful mutation. On failure the instance is marked
    /// for a refresh before its next plan.
    async fn read_back(
        &self,
        provider: &dyn ResourceProvider,
        name: &str,
        id: &BackendId,
    ) -> Result<Attributes> {
        match self.call(name, Operation::Read, provider.read(id)).await {
            Ok(attributes) => Ok(attributes),
            Err(source) => {
                self.set_untrusted(name, true);
                Err(Error::Backend {
                    operation: Operation::Read,
                    name: name.to_string(),
                    source,
                })
            }
        }
    }
}

fn backend_id(instance: &ResourceInstance) -> Result<BackendId> {
    instance
        .backend_id
        .clone()
        .ok_or_else(|| Error::IllegalTransition {
            name: instance.name.clone(),
            from: Lifecycle::Absent,
            to: instance.lifecycle,
        })
}

/// Holds the lock of one instance. The lock map entry goes away with the last
/// holder.
struct InstanceGuard<'a> {
    locks: &'a LockMap,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        if locks
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_resource::{memory::MemoryProvider, AttributeDef};

    fn controller() -> Controller {
        let schema = Schema::new([("name", AttributeDef::string().required())]).unwrap();
        Controller::new(
            schema,
            StateStore::new(),
            ControllerOptions::default(),
            InterruptState::new(),
        )
    }

    fn config(name: &str) -> Attributes {
        Attributes::from([("name".to_string(), name.into())])
    }

    fn tracked_locks(c: &Controller) -> usize {
        c.locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn lock_map_does_not_grow() {
        let p = MemoryProvider::new();
        let c = controller();
        for name in ["a", "b", "c"] {
            c.reconcile(&p, name, &config(name)).await.unwrap();
        }
        c.destroy(&p, "a").await.unwrap();
        assert_eq!(tracked_locks(&c), 0);
    }

    #[tokio::test]
    async fn lock_entry_lives_while_held() {
        let c = controller();
        let held = c.lock_instance("a").await;
        assert_eq!(tracked_locks(&c), 1);

        // A waiter keeps the entry alive after the holder lets go.
        let waiter = c.locks.lock().unwrap()["a"].clone();
        drop(held);
        assert_eq!(tracked_locks(&c), 1);
        drop(waiter);

        let again = c.lock_instance("a").await;
        drop(again);
        assert_eq!(tracked_locks(&c), 0);
    }

    #[tokio::test]
    async fn create_never_replaces_a_recorded_id() {
        let p = MemoryProvider::new();
        let c = controller();
        c.reconcile(&p, "a", &config("a")).await.unwrap();

        let _guard = c.lock_instance("a").await;
        let err = c
            .create_locked(&p, ResourceInstance::absent("a"), &config("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyManaged { .. }), "{:?}", err);
        assert_eq!(p.ids().len(), 1);
    }
}
