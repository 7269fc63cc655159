//! Server registry. Credentials live here and only leave as a
//! [`ConnectionTarget`] handed to the executor.

use crate::error::{MonitorError, Result};
use crate::models::server::{ConnectionTarget, NewServer, ServerPatch, ServerRecord, ServerSummary};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn create(&self, req: NewServer) -> Result<ServerSummary>;

    /// All records, newest first.
    async fn list(&self) -> Result<Vec<ServerSummary>>;

    async fn get(&self, id: &str) -> Result<ServerSummary>;

    async fn update(&self, id: &str, patch: ServerPatch) -> Result<ServerSummary>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Connection parameters, secret included, for one record.
    async fn resolve(&self, id: &str) -> Result<ConnectionTarget>;

    /// Connection parameters for every record, keyed by id.
    async fn targets(&self) -> Result<Vec<(String, ConnectionTarget)>>;

    /// Stores the address reported by the last health probe.
    async fn set_ip_address(&self, id: &str, ip: &str) -> Result<()>;
}

type Records = HashMap<String, ServerRecord>;

fn sorted(records: &Records) -> Vec<ServerRecord> {
    let mut records: Vec<ServerRecord> = records.values().cloned().collect();
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    records
}

fn insert_record(records: &mut Records, req: NewServer) -> Result<ServerSummary> {
    let record = ServerRecord::create(req)?;
    let summary = record.summary();
    records.insert(record.id.clone(), record);
    Ok(summary)
}

fn update_record(records: &mut Records, id: &str, patch: ServerPatch) -> Result<ServerSummary> {
    let record = records.get_mut(id).ok_or_else(|| MonitorError::not_found(id))?;
    // validate on a copy so a rejected patch leaves the record intact
    let mut updated = record.clone();
    updated.apply(patch)?;
    *record = updated;
    Ok(record.summary())
}

fn remove_record(records: &mut Records, id: &str) -> Result<()> {
    records
        .remove(id)
        .map(|_| ())
        .ok_or_else(|| MonitorError::not_found(id))
}

fn set_record_ip(records: &mut Records, id: &str, ip: &str) -> Result<()> {
    let record = records.get_mut(id).ok_or_else(|| MonitorError::not_found(id))?;
    record.ip_address = Some(ip.to_string());
    Ok(())
}

/// Process-local registry. Lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records(records: Vec<ServerRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }

    fn snapshot(&self) -> Vec<ServerRecord> {
        sorted(&self.records.read())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn create(&self, req: NewServer) -> Result<ServerSummary> {
        insert_record(&mut self.records.write(), req)
    }

    async fn list(&self) -> Result<Vec<ServerSummary>> {
        Ok(self.snapshot().iter().map(ServerRecord::summary).collect())
    }

    async fn get(&self, id: &str) -> Result<ServerSummary> {
        self.records
            .read()
            .get(id)
            .map(ServerRecord::summary)
            .ok_or_else(|| MonitorError::not_found(id))
    }

    async fn update(&self, id: &str, patch: ServerPatch) -> Result<ServerSummary> {
        update_record(&mut self.records.write(), id, patch)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        remove_record(&mut self.records.write(), id)
    }

    async fn resolve(&self, id: &str) -> Result<ConnectionTarget> {
        self.records
            .read()
            .get(id)
            .map(ServerRecord::target)
            .ok_or_else(|| MonitorError::not_found(id))
    }

    async fn targets(&self) -> Result<Vec<(String, ConnectionTarget)>> {
        Ok(self
            .snapshot()
            .into_iter()
            .map(|r| (r.id.clone(), r.target()))
            .collect())
    }

    async fn set_ip_address(&self, id: &str, ip: &str) -> Result<()> {
        set_record_ip(&mut self.records.write(), id, ip)
    }
}

/// Registry persisted as a JSON array, rewritten after every change.
/// A change reaches memory only once it is on disk.
pub struct JsonFileStore {
    inner: MemoryStore,
    path: PathBuf,
    file_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Opens the store, loading existing records. A missing file is an
    /// empty registry.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records: Vec<ServerRecord> = match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                MonitorError::Storage(format!("Cannot read {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        info!("Loaded {} server(s) from {}", records.len(), path.display());
        Ok(Self {
            inner: MemoryStore::with_records(records),
            path,
            file_lock: Mutex::new(()),
        })
    }

    /// Applies `change` to a copy of the records, writes the copy, then
    /// swaps it in. A failed change or write leaves memory untouched.
    async fn commit<T, F>(&self, change: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut Records) -> Result<T> + Send,
    {
        let _guard = self.file_lock.lock().await;

        let mut records = self.inner.records.read().clone();
        let output = change(&mut records)?;
        self.persist(&records).await?;
        *self.inner.records.write() = records;

        Ok(output)
    }

    async fn persist(&self, records: &Records) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(dir).await {
                warn!("Failed to create data directory {}: {}", dir.display(), e);
            }
        }

        let content = serde_json::to_string_pretty(&sorted(records))?;

        // Write to temp file then rename
        let mut temp_file = self.path.clone().into_os_string();
        temp_file.push(".tmp");
        let temp_file = PathBuf::from(temp_file);

        // a stale temp file would keep its old permissions
        let _ = fs::remove_file(&temp_file).await;
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&temp_file).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_file, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for JsonFileStore {
    async fn create(&self, req: NewServer) -> Result<ServerSummary> {
        self.commit(|records| insert_record(records, req)).await
    }

    async fn list(&self) -> Result<Vec<ServerSummary>> {
        self.inner.list().await
    }

    async fn get(&self, id: &str) -> Result<ServerSummary> {
        self.inner.get(id).await
    }

    async fn update(&self, id: &str, patch: ServerPatch) -> Result<ServerSummary> {
        self.commit(|records| update_record(records, id, patch)).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.commit(|records| remove_record(records, id)).await
    }

    async fn resolve(&self, id: &str) -> Result<ConnectionTarget> {
        self.inner.resolve(id).await
    }

    async fn targets(&self) -> Result<Vec<(String, ConnectionTarget)>> {
        self.inner.targets().await
    }

    async fn set_ip_address(&self, id: &str, ip: &str) -> Result<()> {
        self.commit(|records| set_record_ip(records, id, ip)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::server::Credential;

    fn new_server(name: &str) -> NewServer {
        NewServer {
            name: Some(name.to_string()),
            hostname: Some("db.internal".to_string()),
            password: Some("s3cret".to_string()),
            ..Default::default()
        }
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("ssh-dashboard-{}", uuid::Uuid::new_v4()))
            .join("servers.json")
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let store = MemoryStore::new();
        let first = store.create(new_server("first")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.create(new_server("second")).await.unwrap();

        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn resolve_returns_secret_for_known_id() {
        let store = MemoryStore::new();
        let created = store.create(new_server("db")).await.unwrap();

        let target = store.resolve(&created.id).await.unwrap();
        assert_eq!(target.credential, Credential::Password("s3cret".to_string()));
        assert_eq!(target.username, "root");

        assert!(matches!(store.resolve("nope").await, Err(MonitorError::NotFound(_))));
    }

    #[tokio::test]
    async fn rejected_patch_leaves_record_untouched() {
        let store = MemoryStore::new();
        let created = store.create(new_server("db")).await.unwrap();

        let patch = ServerPatch {
            description: Some("primary".to_string()),
            hostname: Some("not a host!".to_string()),
            ..Default::default()
        };
        assert!(store.update(&created.id, patch).await.is_err());
        assert_eq!(store.get(&created.id).await.unwrap().description, None);
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(store.delete("missing").await, Err(MonitorError::NotFound(_))));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let path = temp_path();
        let store = JsonFileStore::open(&path).await.unwrap();
        let created = store.create(new_server("web")).await.unwrap();
        store.set_ip_address(&created.id, "10.0.0.9").await.unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let summary = reopened.get(&created.id).await.unwrap();
        assert_eq!(summary.name, "web");
        assert_eq!(summary.ip_address.as_deref(), Some("10.0.0.9"));
        assert_eq!(
            reopened.resolve(&created.id).await.unwrap().credential,
            Credential::Password("s3cret".to_string())
        );

        reopened.delete(&created.id).await.unwrap();
        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert!(reopened.list().await.unwrap().is_empty());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_storage_error() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();

        let err = JsonFileStore::open(&path).await.err().unwrap();
        assert!(matches!(err, MonitorError::Storage(_)));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    /// A path whose parent is a regular file, so every write fails.
    fn unwritable_path() -> PathBuf {
        let root = std::env::temp_dir().join(format!("ssh-dashboard-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        let blocker = root.join("blocker");
        std::fs::write(&blocker, "").unwrap();
        blocker.join("servers.json")
    }

    #[tokio::test]
    async fn failed_write_does_not_create_record() {
        let path = unwritable_path();
        let store = JsonFileStore::open(&path).await.unwrap();

        assert!(store.create(new_server("web")).await.is_err());
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.targets().await.unwrap().is_empty());

        let _ = std::fs::remove_dir_all(path.parent().unwrap().parent().unwrap());
    }

    #[tokio::test]
    async fn failed_write_leaves_existing_record_intact() {
        let path = unwritable_path();
        let record = ServerRecord::create(new_server("web")).unwrap();
        let id = record.id.clone();
        let store = JsonFileStore {
            inner: MemoryStore::with_records(vec![record]),
            path: path.clone(),
            file_lock: Mutex::new(()),
        };

        let patch = ServerPatch {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        assert!(store.update(&id, patch).await.is_err());
        assert!(store.set_ip_address(&id, "10.0.0.9").await.is_err());
        assert!(store.delete(&id).await.is_err());

        let summary = store.get(&id).await.unwrap();
        assert_eq!(summary.name, "web");
        assert_eq!(summary.ip_address, None);

        let _ = std::fs::remove_dir_all(path.parent().unwrap().parent().unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let path = temp_path();
        let mut temp_file = path.clone().into_os_string();
        temp_file.push(".tmp");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // leftover from an interrupted write, world-readable
        std::fs::write(&temp_file, "[]").unwrap();
        std::fs::set_permissions(&temp_file, std::fs::Permissions::from_mode(0o644)).unwrap();

        let store = JsonFileStore::open(&path).await.unwrap();
        store.create(new_server("web")).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
