//! Last known remote state of every managed resource.
//!
//! The store is the only record of which backend id belongs to which local
//! name. Mutation is reserved for the controller; everything else reads
//! [`Snapshot`]s. Every mutation is also kept as a [`StateEvent`], a JSON patch
//! against the serialized state document, so that the history can be appended
//! to a state file and replayed.

use std::{collections::BTreeMap, sync::RwLock};

use anyhow::{bail, Context as _};
use chrono::Utc;
use converge_resource::{Attributes, BackendId};
use json_patch::{
    jsonptr::PointerBuf, AddOperation, Patch, PatchOperation, RemoveOperation,
};
use serde::{Deserialize, Serialize};

const STATE_TYPE: &str = "convergeState";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResource {
    pub id: BackendId,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEvent {
    pub index: u64,
    pub meta: StateEventMeta,
    pub patch: Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEventMeta {
    pub time: String,
    /// What caused the change: `init`, `create`, `update`, `refresh`, ...
    #[serde(default)]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    #[serde(rename = "_type")]
    type_: String,
    resources: BTreeMap<String, StoredResource>,
}

/// Read-only copy of the store at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    resources: BTreeMap<String, StoredResource>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&StoredResource> {
        self.resources.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StoredResource)> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<String, StoredResource>,
    events: Vec<StateEvent>,
}

#[derive(Debug)]
pub struct StateStore {
    inner: RwLock<Inner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn resource_pointer(name: &str) -> PointerBuf {
    PointerBuf::from_tokens(["resources", name])
}

impl StateStore {
    /// An empty store whose journal starts with the initial document.
    pub fn new() -> StateStore {
        let init = StateEvent {
            index: 0,
            meta: StateEventMeta {
                time: Utc::now().to_rfc3339(),
                event: "init".to_string(),
                resource: None,
            },
            patch: Patch(vec![PatchOperation::Add(AddOperation {
                path: PointerBuf::root(),
                value: serde_json::json!({
                    "_type": STATE_TYPE,
                    "resources": {},
                }),
            })]),
        };
        StateStore {
            inner: RwLock::new(Inner {
                resources: BTreeMap::new(),
                events: vec![init],
            }),
        }
    }

    /// Rebuild a store by replaying a journal. The first event must have index 0.
    pub fn from_events(
        events: impl IntoIterator<Item = anyhow::Result<StateEvent>>,
    ) -> anyhow::Result<StateStore> {
        let mut document = serde_json::json!({});
        let mut replayed = Vec::new();
        for event in events {
            let event = event?;
            let expected = replayed.len() as u64;
            if event.index != expected {
                bail!(
                    "state journal out of order: expected event {}, got {}",
                    expected,
                    event.index
                );
            }
            json_patch::patch(&mut document, &event.patch.0)
                .with_context(|| format!("applying state event {}", event.index))?;
            replayed.push(event);
        }
        if replayed.is_empty() {
            bail!("state journal is empty");
        }
        let document: StateDocument =
            serde_json::from_value(document).context("state document has an unexpected shape")?;
        if document.type_ != STATE_TYPE {
            bail!(
                "not a converge state: _type is {:?}, expected {:?}",
                document.type_,
                STATE_TYPE
            );
        }
        Ok(StateStore {
            inner: RwLock::new(Inner {
                resources: document.resources,
                events: replayed,
            }),
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("state store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("state store lock poisoned")
    }

    pub fn get(&self, name: &str) -> Option<StoredResource> {
        self.read().resources.get(name).cloned()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            resources: self.read().resources.clone(),
        }
    }

    /// The whole journal, oldest first.
    pub fn events(&self) -> Vec<StateEvent> {
        self.read().events.clone()
    }

    /// Journal entries with an index of at least `index`.
    pub fn events_since(&self, index: u64) -> Vec<StateEvent> {
        self.read()
            .events
            .iter()
            .filter(|e| e.index >= index)
            .cloned()
            .collect()
    }

    pub(crate) fn put(&self, name: &str, resource: StoredResource, event: &str) {
        let mut inner = self.write();
        if inner.resources.get(name) == Some(&resource) {
            return;
        }
        // Serializing plain maps, strings, numbers and bools cannot fail.
        let value = serde_json::to_value(&resource).unwrap_or_default();
        let patch = Patch(vec![PatchOperation::Add(AddOperation {
            path: resource_pointer(name),
            value,
        })]);
        inner.resources.insert(name.to_string(), resource);
        Self::record(&mut inner, name, event, patch);
    }

    pub(crate) fn remove(&self, name: &str, event: &str) {
        let mut inner = self.write();
        if inner.resources.remove(name).is_none() {
            return;
        }
        let patch = Patch(vec![PatchOperation::Remove(RemoveOperation {
            path: resource_pointer(name),
        })]);
        Self::record(&mut inner, name, event, patch);
    }

    fn record(inner: &mut Inner, name: &str, event: &str, patch: Patch) {
        let index = inner.events.len() as u64;
        tracing::trace!(resource = name, event, index, "state event");
        inner.events.push(StateEvent {
            index,
            meta: StateEventMeta {
                time: Utc::now().to_rfc3339(),
                event: event.to_string(),
                resource: Some(name.to_string()),
            },
            patch,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_resource::AttributeValue;

    fn stored(id: &str, value: &str) -> StoredResource {
        StoredResource {
            id: BackendId::from(id),
            attributes: [("name".to_string(), AttributeValue::from(value))]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn put_get_remove() {
        let store = StateStore::new();
        assert!(store.get("pg").is_none());
        store.put("pg", stored("pg-1", "a"), "create");
        assert_eq!(store.get("pg"), Some(stored("pg-1", "a")));
        store.remove("pg", "destroy");
        assert!(store.get("pg").is_none());
        assert_eq!(store.events().len(), 3);
    }

    #[test]
    fn snapshots_do_not_change() {
        let store = StateStore::new();
        store.put("pg", stored("pg-1", "a"), "create");
        let snapshot = store.snapshot();
        store.put("pg", stored("pg-1", "b"), "update");
        assert_eq!(snapshot.get("pg"), Some(&stored("pg-1", "a")));
        assert_eq!(store.snapshot().get("pg"), Some(&stored("pg-1", "b")));
    }

    #[test]
    fn unchanged_put_is_not_journaled() {
        let store = StateStore::new();
        store.put("pg", stored("pg-1", "a"), "create");
        store.put("pg", stored("pg-1", "a"), "refresh");
        store.remove("other", "destroy");
        assert_eq!(store.events().len(), 2);
    }

    #[test]
    fn replay_journal() {
        let store = StateStore::new();
        store.put("pg", stored("pg-1", "a"), "create");
        store.put("a/b~c", stored("odd-1", "x"), "create");
        store.put("pg", stored("pg-1", "b"), "update");
        store.remove("a/b~c", "destroy");

        let replayed = StateStore::from_events(store.events().into_iter().map(Ok)).unwrap();
        assert_eq!(replayed.snapshot(), store.snapshot());
        assert_eq!(replayed.events(), store.events());
        assert_eq!(store.events_since(3).len(), 2);
    }

    #[test]
    fn replay_rejects_gaps() {
        let store = StateStore::new();
        store.put("pg", stored("pg-1", "a"), "create");
        let mut events = store.events();
        events.remove(0);
        assert!(StateStore::from_events(events.into_iter().map(Ok)).is_err());
    }

    #[test]
    fn replay_rejects_foreign_documents() {
        let event: StateEvent = serde_json::from_value(serde_json::json!({
            "index": 0,
            "meta": {"time": "2019-03-04T07:40:00Z"},
            "patch": [
                {"op": "add", "path": "", "value": {"_type": "inventoryState", "resources": {}}}
            ]
        }))
        .unwrap();
        let err = StateStore::from_events([Ok(event)]).unwrap_err();
        assert!(err.to_string().contains("not a converge state"), "{}", err);
    }
}
