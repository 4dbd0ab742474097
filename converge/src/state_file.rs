//! Persistence of the state journal.
//!
//! A state file is a stream of pretty-printed [`StateEvent`] JSON documents.
//! It is only ever appended to, under an exclusive `fd-lock`.

use std::{
    fs::{File, OpenOptions},
    io::{self, Seek as _, Write as _},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context as _, Result};
use serde_json::{de::IoRead, Deserializer, StreamDeserializer};

use crate::state::{StateEvent, StateStore};

pub struct StateEventStream<'a, R: io::Read> {
    iter: StreamDeserializer<'a, IoRead<R>, StateEvent>,
    /// The validated first event, handed out before the rest.
    first_event: Option<StateEvent>,
}

impl<'a, R: io::Read> StateEventStream<'a, R> {
    pub fn open_from_reader(reader: R) -> Result<StateEventStream<'a, R>> {
        let mut iter = Deserializer::from_reader(reader).into_iter();
        let first_event = match iter.next() {
            Some(Ok(ev @ StateEvent { index: 0, .. })) => ev,
            Some(Ok(StateEvent { index, .. })) => {
                bail!("Expected initial state event with index 0, got {}", index)
            }
            Some(Err(e)) => bail!(
                "State file invalid: error parsing initial state event: {}",
                e
            ),
            None => bail!("State file invalid: no initial state event"),
        };
        Ok(StateEventStream {
            iter,
            first_event: Some(first_event),
        })
    }
}

impl<R: io::Read> Iterator for StateEventStream<'_, R> {
    type Item = Result<StateEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first_event.is_some() {
            self.first_event.take().map(Ok)
        } else {
            self.iter.next().map(|r| r.map_err(Into::into))
        }
    }
}

/// An open state file and how much of the journal it already holds.
pub struct StateFile {
    path: PathBuf,
    file: Arc<File>,
    locking: fd_lock::RwLock<Arc<File>>,
    expected_size: Option<u64>,
    persisted: u64,
}

impl StateFile {
    /// Open `path` and load its journal, or start a new one if the file does
    /// not exist.
    pub fn open_or_create(path: &Path) -> Result<(StateFile, StateStore)> {
        if path.exists() {
            let reader = io::BufReader::new(
                File::open(path).with_context(|| format!("opening {}", path.display()))?,
            );
            let store = StateStore::from_events(StateEventStream::open_from_reader(reader)?)
                .with_context(|| format!("loading state from {}", path.display()))?;
            let persisted = store.events().len() as u64;
            let handle = Self::open(path, false, persisted)?;
            Ok((handle, store))
        } else {
            let store = StateStore::new();
            let mut handle = Self::open(path, true, 0)?;
            handle.sync(&store)?;
            Ok((handle, store))
        }
    }

    fn open(path: &Path, create_new: bool, persisted: u64) -> Result<StateFile> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(create_new)
            .open(path)
            .with_context(|| format!("opening state file {}", path.display()))?;
        // Anything past this point on the next append was written by someone else.
        let expected_size = file
            .metadata()
            .with_context(|| format!("reading metadata of {}", path.display()))?
            .len();
        let file = Arc::new(file);
        Ok(StateFile {
            path: path.to_path_buf(),
            locking: fd_lock::RwLock::new(file.clone()),
            file,
            expected_size: Some(expected_size),
            persisted,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append the journal entries of `store` that are not in the file yet.
    pub fn sync(&mut self, store: &StateStore) -> Result<()> {
        let events = store.events_since(self.persisted);
        if events.is_empty() {
            return Ok(());
        }
        self.append(&events)?;
        self.persisted += events.len() as u64;
        Ok(())
    }

    fn append(&mut self, events: &[StateEvent]) -> Result<()> {
        let lock_guard = self.locking.write().context("locking state file")?;
        let pos = (&*self.file).seek(io::SeekFrom::End(0))?;
        if let Some((from, to)) = foreign_range(self.expected_size, pos) {
            tracing::error!(
                path = %self.path.display(),
                "state file was written concurrently; foreign bytes [{}..{}) may need manual repair",
                from,
                to
            );
        }
        let mut writer = io::BufWriter::new(&*self.file);
        for event in events {
            serde_json::to_writer_pretty(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);
        self.expected_size = Some((&*self.file).stream_position()?);
        drop(lock_guard);
        Ok(())
    }

    /// The byte range appended by another writer since our last write.
    #[cfg(test)]
    fn foreign_bytes(&self, end: u64) -> Option<(u64, u64)> {
        foreign_range(self.expected_size, end)
    }
}

fn foreign_range(expected_size: Option<u64>, end: u64) -> Option<(u64, u64)> {
    match expected_size {
        Some(expected) if expected != end => Some((expected, end)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StoredResource;
    use converge_resource::{AttributeValue, BackendId};
    use std::io::Write as _;

    const BASIC_EXAMPLE: &str = r#"
    {
        "index": 0,
        "meta": {"time":"2019-03-04T07:40:00Z", "event": "init"},
        "patch": [
            { "op": "add", "value": { "_type": "convergeState", "resources": {} }, "path": "" }
        ]
    }
    {
        "index": 1,
        "meta": {"time":"2019-03-04T07:41:00Z", "event": "create", "resource": "pg"},
        "patch": [
            {
                "op": "add",
                "value": { "id": "pg-1", "attributes": { "name": "pg" } },
                "path": "/resources/pg"
            }
        ]
    }
"#;

    #[test]
    fn test_open_state_stream() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let events: Vec<_> = stream.collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().meta.time, "2019-03-04T07:40:00Z");
        assert_eq!(
            events[1].as_ref().unwrap().meta.resource.as_deref(),
            Some("pg")
        );
    }

    #[test]
    fn test_resolve_state() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let store = StateStore::from_events(stream).unwrap();
        let pg = store.get("pg").unwrap();
        assert_eq!(pg.id, BackendId::from("pg-1"));
        assert_eq!(pg.attributes["name"], AttributeValue::from("pg"));
    }

    #[test]
    fn test_open_state_stream_invalid() {
        for input in [
            r#"{"index":1,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}"#,
            r#"{"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}"#,
            r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]"#,
            r#""#,
            r#"[]"#,
            r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"}}"#,
        ] {
            assert!(
                StateEventStream::open_from_reader(input.as_bytes()).is_err(),
                "{}",
                input
            );
        }
    }

    #[test]
    fn test_invalid_second_event() {
        let input = r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}
{"meta":{"time":"2019-06-04T07:40:00Z"}}"#;
        let stream = StateEventStream::open_from_reader(input.as_bytes()).unwrap();
        let events: Vec<Result<StateEvent>> = stream.collect();
        assert!(events[1].is_err());
    }

    #[test]
    fn test_state_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let (mut file, store) = StateFile::open_or_create(&path).unwrap();
        store.put(
            "pg",
            StoredResource {
                id: BackendId::from("pg-1"),
                attributes: Default::default(),
            },
            "create",
        );
        file.sync(&store).unwrap();
        file.sync(&store).unwrap();
        drop(file);

        let (mut file, reopened) = StateFile::open_or_create(&path).unwrap();
        assert_eq!(reopened.snapshot(), store.snapshot());
        assert_eq!(reopened.events().len(), 2);

        reopened.remove("pg", "destroy");
        file.sync(&reopened).unwrap();
        drop(file);

        let (_, again) = StateFile::open_or_create(&path).unwrap();
        assert!(again.snapshot().is_empty());
        assert_eq!(again.events().len(), 3);
    }

    #[test]
    fn test_foreign_write_after_reopen_is_noticed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let (file, _) = StateFile::open_or_create(&path).unwrap();
        drop(file);

        let (file, _) = StateFile::open_or_create(&path).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(file.expected_size, Some(len));
        assert_eq!(file.foreign_bytes(len), None);

        // Another process appends before our first write.
        let mut other = OpenOptions::new().append(true).open(&path).unwrap();
        other.write_all(b"{}\n").unwrap();
        let end = std::fs::metadata(&path).unwrap().len();
        assert_eq!(file.foreign_bytes(end), Some((len, end)));
    }
}
