//! A backend that keeps each resource as one JSON document in a directory.
//!
//! It is mostly useful for trying things out and for running the acceptance
//! suite without a cloud account. Writers take an exclusive lock on
//! `<dir>/.lock`, so several processes may share a directory.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use converge_resource::{
    framework::{ApplyMethod, CreateResourceResponse},
    AttributeValue, Attributes, BackendId, ChangeKind, ChangeSet, ProviderError, ProviderResult,
    ResourceProvider,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResourceFile {
    id: BackendId,
    created: String,
    updated: String,
    attributes: Attributes,
}

pub struct LocalProvider {
    dir: PathBuf,
    id_attribute: Option<String>,
}

impl LocalProvider {
    pub fn new(dir: impl Into<PathBuf>) -> LocalProvider {
        LocalProvider {
            dir: dir.into(),
            id_attribute: None,
        }
    }

    /// Name resources after the value of this attribute instead of generating
    /// an id.
    pub fn with_id_attribute(mut self, name: &str) -> LocalProvider {
        self.id_attribute = Some(name.to_string());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &BackendId) -> ProviderResult<PathBuf> {
        let s = id.as_str();
        if s.is_empty()
            || s.starts_with('.')
            || !s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(anyhow!("invalid resource id for a local backend: {:?}", s).into());
        }
        Ok(self.dir.join(format!("{}.json", s)))
    }

    /// Run `f` while holding the directory lock.
    fn locked<T>(&self, f: impl FnOnce() -> ProviderResult<T>) -> ProviderResult<T> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating backend directory {}", self.dir.display()))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(".lock"))
            .context("opening backend lock file")?;
        let mut lock = fd_lock::RwLock::new(file);
        let guard = lock.write().context("locking backend directory")?;
        let r = f();
        drop(guard);
        r
    }

    fn load(&self, id: &BackendId) -> ProviderResult<ResourceFile> {
        let path = self.path_for(id)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProviderError::NotFound(id.clone()))
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("reading {}", path.display()))
                    .into())
            }
        };
        let stored: ResourceFile = serde_json::from_reader(io::BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(stored)
    }

    fn store(&self, resource: &ResourceFile) -> ProviderResult<()> {
        let path = self.path_for(&resource.id)?;
        let tmp = path.with_extension("json.tmp");
        let mut writer = io::BufWriter::new(
            File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?,
        );
        serde_json::to_writer_pretty(&mut writer, resource).context("writing resource")?;
        writer.write_all(b"\n").context("writing resource")?;
        writer.flush().context("writing resource")?;
        drop(writer);
        fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    fn new_id(&self, attributes: &Attributes) -> ProviderResult<BackendId> {
        match &self.id_attribute {
            Some(name) => match attributes.get(name) {
                Some(AttributeValue::String(s)) => Ok(BackendId(s.clone())),
                Some(other) => Err(anyhow!(
                    "id attribute {} must be a string, found {}",
                    name,
                    other.kind()
                )
                .into()),
                None => Err(anyhow!("id attribute {} is not set", name).into()),
            },
            None => Ok(BackendId(format!(
                "res-{}",
                Utc::now().format("%Y%m%d%H%M%S%9f")
            ))),
        }
    }
}

/// Report blocks whose apply method defers the change.
fn log_apply_methods(id: &BackendId, changes: &ChangeSet) -> anyhow::Result<()> {
    for change in changes {
        if change.kind == ChangeKind::Remove {
            continue;
        }
        if let Some(block) = change.new.as_ref().and_then(|v| v.as_block()) {
            let method = ApplyMethod::of_block(block)?;
            if method == ApplyMethod::PendingReboot {
                tracing::info!(resource = %id, path = %change.path, "change takes effect after reboot");
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ResourceProvider for LocalProvider {
    async fn create(&self, attributes: &Attributes) -> ProviderResult<CreateResourceResponse> {
        let id = self.new_id(attributes)?;
        self.locked(|| {
            let path = self.path_for(&id)?;
            if path.exists() {
                return Err(
                    anyhow!("resource {} already exists in {}", id, self.dir.display()).into(),
                );
            }
            let now = Utc::now().to_rfc3339();
            self.store(&ResourceFile {
                id: id.clone(),
                created: now.clone(),
                updated: now,
                attributes: attributes.clone(),
            })?;
            Ok(())
        })?;
        tracing::debug!(resource = %id, "created");
        Ok(CreateResourceResponse {
            id,
            attributes: attributes.clone(),
        })
    }

    async fn read(&self, id: &BackendId) -> ProviderResult<Attributes> {
        Ok(self.load(id)?.attributes)
    }

    async fn update(&self, id: &BackendId, changes: &ChangeSet) -> ProviderResult<Attributes> {
        if changes.is_replace() {
            return Err(anyhow!("resource {} cannot be updated in place", id).into());
        }
        log_apply_methods(id, changes)?;
        self.locked(|| {
            let mut resource = self.load(id)?;
            resource.attributes = changes.apply(&resource.attributes);
            resource.updated = Utc::now().to_rfc3339();
            self.store(&resource)?;
            tracing::debug!(resource = %id, changes = changes.len(), "updated");
            Ok(resource.attributes)
        })
    }

    async fn delete(&self, id: &BackendId) -> ProviderResult<()> {
        self.locked(|| {
            let path = self.path_for(id)?;
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(ProviderError::NotFound(id.clone()))
                }
                Err(e) => Err(anyhow::Error::new(e)
                    .context(format!("removing {}", path.display()))
                    .into()),
            }
        })
    }

    async fn exists(&self, id: &BackendId) -> ProviderResult<bool> {
        Ok(self.path_for(id)?.exists())
    }
}
