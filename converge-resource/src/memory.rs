//! An in-memory backend for deterministic tests of everything that consumes
//! the capability contract.
//!
//! Besides storing resources it records every call it receives, can inject
//! failures and latency, and lets tests change "remote" state behind the
//! caller's back to simulate drift.

use std::{
    collections::BTreeMap,
    sync::Mutex,
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;

use crate::{
    diff::ChangeSet,
    framework::{
        BackendId, CreateResourceResponse, Operation, ProviderError, ProviderResult,
        ResourceProvider,
    },
    value::Attributes,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create(Attributes),
    Read(BackendId),
    Update(BackendId, ChangeSet),
    Delete(BackendId),
    Exists(BackendId),
}

impl Call {
    pub fn operation(&self) -> Operation {
        match self {
            Call::Create(_) => Operation::Create,
            Call::Read(_) => Operation::Read,
            Call::Update(_, _) => Operation::Update,
            Call::Delete(_) => Operation::Delete,
            Call::Exists(_) => Operation::Exists,
        }
    }

    fn id(&self) -> BackendId {
        match self {
            Call::Create(_) => BackendId("<new>".to_string()),
            Call::Read(id) | Call::Update(id, _) | Call::Delete(id) | Call::Exists(id) => {
                id.clone()
            }
        }
    }
}

/// A failure to inject into the next call of some operation.
#[derive(Debug, Clone)]
pub enum Failure {
    Error(String),
    NotFound,
    /// Wait this long, then perform the call anyway.
    Stall(Duration),
}

type Normalizer = Box<dyn Fn(&mut Attributes) + Send + Sync>;

#[derive(Default)]
struct Inner {
    resources: BTreeMap<BackendId, Attributes>,
    next_id: u64,
    calls: Vec<Call>,
    failures: Vec<(Operation, Failure)>,
    in_flight: BTreeMap<BackendId, usize>,
    max_in_flight: usize,
}

#[derive(Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    id_attribute: Option<String>,
    normalizer: Option<Normalizer>,
    latency: Option<Duration>,
}

struct InFlight<'a> {
    provider: &'a MemoryProvider,
    id: BackendId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut inner = self.provider.lock();
        if let Some(n) = inner.in_flight.get_mut(&self.id) {
            *n -= 1;
        }
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the value of attribute `name` as the backend id, as backends that
    /// key resources by name do.
    pub fn with_id_attribute(mut self, name: &str) -> Self {
        self.id_attribute = Some(name.to_string());
        self
    }

    /// Rewrite attributes on every write, like a backend that normalises its
    /// input.
    pub fn with_normalizer(mut self, f: impl Fn(&mut Attributes) + Send + Sync + 'static) -> Self {
        self.normalizer = Some(Box::new(f));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mutex poisoned")
    }

    pub fn fail_next(&self, operation: Operation, failure: Failure) {
        self.lock().failures.push((operation, failure));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn mutating_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation().is_mutating())
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Highest number of concurrent calls seen for any single resource.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn get(&self, id: &BackendId) -> Option<Attributes> {
        self.lock().resources.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<BackendId> {
        self.lock().resources.keys().cloned().collect()
    }

    /// Change remote state without going through the contract.
    pub fn put_out_of_band(&self, id: &BackendId, attributes: Attributes) {
        self.lock().resources.insert(id.clone(), attributes);
    }

    pub fn remove_out_of_band(&self, id: &BackendId) {
        self.lock().resources.remove(id);
    }

    async fn enter(&self, call: Call) -> ProviderResult<InFlight<'_>> {
        let op = call.operation();
        let id = call.id();
        let failure = {
            let mut inner = self.lock();
            inner.calls.push(call);
            let n = inner.in_flight.entry(id.clone()).or_default();
            *n += 1;
            let n = *n;
            inner.max_in_flight = inner.max_in_flight.max(n);
            inner
                .failures
                .iter()
                .position(|(o, _)| *o == op)
                .map(|pos| inner.failures.remove(pos).1)
        };
        let guard = InFlight {
            provider: self,
            id: id.clone(),
        };
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match failure {
            None => Ok(guard),
            Some(Failure::Error(msg)) => Err(anyhow!(msg).into()),
            Some(Failure::NotFound) => Err(ProviderError::NotFound(id)),
            Some(Failure::Stall(d)) => {
                tokio::time::sleep(d).await;
                Ok(guard)
            }
        }
    }

    fn normalize(&self, attributes: &mut Attributes) {
        if let Some(f) = &self.normalizer {
            f(attributes);
        }
    }
}

#[async_trait]
impl ResourceProvider for MemoryProvider {
    async fn create(&self, attributes: &Attributes) -> ProviderResult<CreateResourceResponse> {
        let _in_flight = self.enter(Call::Create(attributes.clone())).await?;
        let mut stored = attributes.clone();
        self.normalize(&mut stored);
        let mut inner = self.lock();
        let id = match self
            .id_attribute
            .as_ref()
            .and_then(|a| attributes.get(a))
            .and_then(|v| v.as_str())
        {
            Some(name) => BackendId(name.to_string()),
            None => {
                inner.next_id += 1;
                BackendId(format!("mem-{}", inner.next_id))
            }
        };
        if inner.resources.contains_key(&id) {
            return Err(anyhow!("resource {} already exists", id).into());
        }
        inner.resources.insert(id.clone(), stored.clone());
        Ok(CreateResourceResponse {
            id,
            attributes: stored,
        })
    }

    async fn read(&self, id: &BackendId) -> ProviderResult<Attributes> {
        let _in_flight = self.enter(Call::Read(id.clone())).await?;
        self.get(id)
            .ok_or_else(|| ProviderError::NotFound(id.clone()))
    }

    async fn update(&self, id: &BackendId, changes: &ChangeSet) -> ProviderResult<Attributes> {
        let _in_flight = self
            .enter(Call::Update(id.clone(), changes.clone()))
            .await?;
        let current = self
            .get(id)
            .ok_or_else(|| ProviderError::NotFound(id.clone()))?;
        let mut updated = changes.apply(&current);
        self.normalize(&mut updated);
        self.lock().resources.insert(id.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete(&self, id: &BackendId) -> ProviderResult<()> {
        let _in_flight = self.enter(Call::Delete(id.clone())).await?;
        let removed = self.lock().resources.remove(id);
        match removed {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound(id.clone())),
        }
    }

    async fn exists(&self, id: &BackendId) -> ProviderResult<bool> {
        let _in_flight = self.enter(Call::Exists(id.clone())).await?;
        let exists = self.lock().resources.contains_key(id);
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::AttributeValue;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), AttributeValue::from(*v)))
            .collect()
    }

    #[tokio::test]
    async fn crud_roundtrip() {
        let p = MemoryProvider::new();
        let created = p.create(&attrs(&[("name", "a")])).await.unwrap();
        assert_eq!(created.id, BackendId("mem-1".to_string()));
        assert!(p.exists(&created.id).await.unwrap());
        assert_eq!(p.read(&created.id).await.unwrap(), attrs(&[("name", "a")]));
        p.delete(&created.id).await.unwrap();
        assert!(!p.exists(&created.id).await.unwrap());
        assert!(p.read(&created.id).await.unwrap_err().is_not_found());
        assert!(p.delete(&created.id).await.unwrap_err().is_not_found());
        assert_eq!(p.mutating_calls(), 2);
    }

    #[tokio::test]
    async fn ids_from_attribute() {
        let p = MemoryProvider::new().with_id_attribute("name");
        let created = p.create(&attrs(&[("name", "pg")])).await.unwrap();
        assert_eq!(created.id, BackendId("pg".to_string()));
        assert!(p.create(&attrs(&[("name", "pg")])).await.is_err());
    }

    #[tokio::test]
    async fn normalizes_writes() {
        let p = MemoryProvider::new().with_normalizer(|a| {
            if let Some(AttributeValue::String(s)) = a.get_mut("name") {
                *s = s.to_lowercase();
            }
        });
        let created = p.create(&attrs(&[("name", "PG")])).await.unwrap();
        assert_eq!(created.attributes, attrs(&[("name", "pg")]));
    }

    #[tokio::test]
    async fn injected_failures_apply_once() {
        let p = MemoryProvider::new();
        p.fail_next(Operation::Create, Failure::Error("quota exceeded".to_string()));
        let err = p.create(&attrs(&[("name", "a")])).await.unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
        assert!(p.ids().is_empty());
        p.create(&attrs(&[("name", "a")])).await.unwrap();
        assert_eq!(p.ids().len(), 1);
    }
}
