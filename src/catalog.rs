//! Catalog store contract and an in-memory implementation.
//!
//! The on-disk catalog (schema, migrations, scanning) lives outside this
//! crate; the sync engine only needs the operations below. All access goes
//! through one serialized handle, so implementations wrap their connection
//! in a mutex and the engine treats the store as single-writer.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Result, VaultError};
use crate::types::{CatalogRecord, RemoteFileRecord, Visibility};

/// Operations the sync engine requires from the local catalog.
///
/// `family_changes_since` and `count_family_changes_since` must apply the
/// effective visibility (a file inherits its watched folder's setting unless
/// overridden) and exclude remote records, returning rows ordered by
/// `indexed_at` ascending.
pub trait CatalogStore: Send + Sync {
    /// Create the `remote_files` and `sync_state` tables (and their
    /// secondary indexes) if they do not exist yet.
    fn create_tables_if_missing(&self) -> Result<()>;

    fn count_family_changes_since(&self, since: i64) -> Result<i64>;

    fn family_changes_since(
        &self,
        since: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CatalogRecord>>;

    /// Insert or update a remote record under `(source_device_id, remote_id)`,
    /// clearing any deletion mark.
    fn upsert_remote(&self, record: &RemoteFileRecord) -> Result<()>;

    /// Mark an existing remote record as deleted.
    fn mark_remote_deleted(
        &self,
        source_device_id: &str,
        remote_id: i64,
        synced_at: i64,
    ) -> Result<()>;

    /// Last completed sync time for a peer, 0 when never synced.
    fn sync_cursor(&self, device_id: &str) -> Result<i64>;

    fn set_sync_cursor(&self, device_id: &str, ts: i64) -> Result<()>;

    /// Live (non-deleted) remote records from one device, ordered by name.
    fn remote_files_from(&self, device_id: &str) -> Result<Vec<RemoteFileRecord>>;

    /// Live remote records from all devices, ordered by device then name.
    fn all_remote_files(&self) -> Result<Vec<RemoteFileRecord>>;

    /// Case-insensitive substring search over remote record names.
    fn search_remote_files(&self, query: &str, limit: usize) -> Result<Vec<RemoteFileRecord>>;

    fn remote_file_count(&self) -> Result<i64>;

    fn remote_file_count_from(&self, device_id: &str) -> Result<i64>;
}

/// In-memory catalog store.
///
/// Backs the tests and embedders that keep their catalog elsewhere. Local
/// records carry their effective visibility, so the family filter is a plain
/// predicate here.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    local: Vec<CatalogRecord>,
    remote: HashMap<(String, i64), RemoteFileRecord>,
    cursors: HashMap<String, i64>,
    next_local_id: i64,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a local catalog record, assigning an id when the record has none.
    pub fn insert_local(&self, mut record: CatalogRecord) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        if record.id == 0 {
            inner.next_local_id += 1;
            record.id = inner.next_local_id;
        } else if record.id > inner.next_local_id {
            inner.next_local_id = record.id;
        }
        let id = record.id;
        inner.local.push(record);
        id
    }

    fn family_filter(record: &CatalogRecord, since: i64) -> bool {
        record.visibility == Visibility::Family && !record.is_remote && record.indexed_at > since
    }
}

impl CatalogStore for MemoryCatalog {
    fn create_tables_if_missing(&self) -> Result<()> {
        Ok(())
    }

    fn count_family_changes_since(&self, since: i64) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .local
            .iter()
            .filter(|r| Self::family_filter(r, since))
            .count() as i64)
    }

    fn family_changes_since(
        &self,
        since: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CatalogRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<CatalogRecord> = inner
            .local
            .iter()
            .filter(|r| Self::family_filter(r, since))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.indexed_at);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    fn upsert_remote(&self, record: &RemoteFileRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (record.source_device_id.clone(), record.remote_id);
        let local_id = match inner.remote.get(&key) {
            Some(existing) => existing.local_id,
            None => {
                inner.next_local_id += 1;
                inner.next_local_id
            }
        };
        let mut stored = record.clone();
        stored.local_id = local_id;
        stored.is_deleted = false;
        inner.remote.insert(key, stored);
        Ok(())
    }

    fn mark_remote_deleted(
        &self,
        source_device_id: &str,
        remote_id: i64,
        synced_at: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (source_device_id.to_string(), remote_id);
        match inner.remote.get_mut(&key) {
            Some(record) => {
                record.is_deleted = true;
                record.synced_at = synced_at;
                Ok(())
            }
            None => Err(VaultError::NotFound(format!(
                "remote record {}:{}",
                source_device_id, remote_id
            ))),
        }
    }

    fn sync_cursor(&self, device_id: &str) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.cursors.get(device_id).copied().unwrap_or(0))
    }

    fn set_sync_cursor(&self, device_id: &str, ts: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.cursors.insert(device_id.to_string(), ts);
        Ok(())
    }

    fn remote_files_from(&self, device_id: &str) -> Result<Vec<RemoteFileRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<RemoteFileRecord> = inner
            .remote
            .values()
            .filter(|r| !r.is_deleted && r.source_device_id == device_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    fn all_remote_files(&self) -> Result<Vec<RemoteFileRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<RemoteFileRecord> = inner
            .remote
            .values()
            .filter(|r| !r.is_deleted)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.source_device_id.as_str(), a.name.as_str())
                .cmp(&(b.source_device_id.as_str(), b.name.as_str()))
        });
        Ok(rows)
    }

    fn search_remote_files(&self, query: &str, limit: usize) -> Result<Vec<RemoteFileRecord>> {
        let needle = query.to_lowercase();
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<RemoteFileRecord> = inner
            .remote
            .values()
            .filter(|r| !r.is_deleted && r.name.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows.truncate(limit);
        Ok(rows)
    }

    fn remote_file_count(&self) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.remote.values().filter(|r| !r.is_deleted).count() as i64)
    }

    fn remote_file_count_from(&self, device_id: &str) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .remote
            .values()
            .filter(|r| !r.is_deleted && r.source_device_id == device_id)
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(id: i64, name: &str, visibility: Visibility, indexed_at: i64) -> CatalogRecord {
        CatalogRecord {
            id,
            relative_path: format!("a/{}", name),
            name: name.to_string(),
            mime_type: "application/octet-stream".to_string(),
            size: 10,
            modified_at: indexed_at,
            checksum: None,
            visibility,
            source_device_id: None,
            is_remote: false,
            sync_version: 1,
            indexed_at,
        }
    }

    fn remote(device: &str, remote_id: i64, name: &str) -> RemoteFileRecord {
        RemoteFileRecord {
            local_id: 0,
            remote_id,
            source_device_id: device.to_string(),
            path: format!("a/{}", name),
            name: name.to_string(),
            mime_type: "image/jpeg".to_string(),
            size: 10,
            modified_at: 100,
            checksum: String::new(),
            synced_at: 200,
            is_deleted: false,
        }
    }

    #[test]
    fn family_changes_exclude_private_and_remote() {
        let store = MemoryCatalog::new();
        store.insert_local(local(1, "family.jpg", Visibility::Family, 100));
        store.insert_local(local(2, "private.jpg", Visibility::Private, 101));
        let mut hidden = local(3, "mirrored.jpg", Visibility::Family, 102);
        hidden.is_remote = true;
        store.insert_local(hidden);

        assert_eq!(store.count_family_changes_since(0).unwrap(), 1);
        let rows = store.family_changes_since(0, 100, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "family.jpg");
    }

    #[test]
    fn family_changes_respect_since_and_order() {
        let store = MemoryCatalog::new();
        store.insert_local(local(1, "c.txt", Visibility::Family, 102));
        store.insert_local(local(2, "a.txt", Visibility::Family, 100));
        store.insert_local(local(3, "b.txt", Visibility::Family, 101));

        let rows = store.family_changes_since(100, 100, 0).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["b.txt", "c.txt"]);

        let paged = store.family_changes_since(0, 2, 1).unwrap();
        assert_eq!(paged.len(), 2);
        assert_eq!(paged[0].name, "b.txt");
    }

    #[test]
    fn upsert_remote_is_keyed_by_source_and_id() {
        let store = MemoryCatalog::new();
        store.upsert_remote(&remote("device-A", 42, "photo.jpg")).unwrap();
        let mut updated = remote("device-A", 42, "photo-renamed.jpg");
        updated.size = 999;
        store.upsert_remote(&updated).unwrap();
        store.upsert_remote(&remote("device-B", 42, "photo.jpg")).unwrap();

        assert_eq!(store.remote_file_count().unwrap(), 2);
        let from_a = store.remote_files_from("device-A").unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].name, "photo-renamed.jpg");
        assert_eq!(from_a[0].size, 999);
    }

    #[test]
    fn upsert_preserves_local_row_id() {
        let store = MemoryCatalog::new();
        store.upsert_remote(&remote("device-A", 1, "one.jpg")).unwrap();
        let first = store.remote_files_from("device-A").unwrap()[0].local_id;
        store.upsert_remote(&remote("device-A", 1, "one-renamed.jpg")).unwrap();
        let second = store.remote_files_from("device-A").unwrap()[0].local_id;
        assert_eq!(first, second);
    }

    #[test]
    fn mark_deleted_hides_record() {
        let store = MemoryCatalog::new();
        store.upsert_remote(&remote("device-A", 7, "gone.pdf")).unwrap();
        store.mark_remote_deleted("device-A", 7, 300).unwrap();
        assert_eq!(store.remote_file_count().unwrap(), 0);
        assert!(store.remote_files_from("device-A").unwrap().is_empty());
        assert!(store.mark_remote_deleted("device-A", 99, 300).is_err());
    }

    #[test]
    fn cursors_are_per_device() {
        let store = MemoryCatalog::new();
        assert_eq!(store.sync_cursor("device-A").unwrap(), 0);
        store.set_sync_cursor("device-A", 1000).unwrap();
        store.set_sync_cursor("device-C", 2000).unwrap();
        assert_eq!(store.sync_cursor("device-A").unwrap(), 1000);
        assert_eq!(store.sync_cursor("device-C").unwrap(), 2000);
    }

    #[test]
    fn search_matches_case_insensitive() {
        let store = MemoryCatalog::new();
        store.upsert_remote(&remote("device-A", 1, "Holiday.JPG")).unwrap();
        store.upsert_remote(&remote("device-A", 2, "notes.txt")).unwrap();
        let hits = store.search_remote_files("holiday", 50).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].remote_id, 1);
    }
}
