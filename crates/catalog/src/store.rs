//! The entry store: id-keyed entries with lock-free read snapshots, the
//! active-mount table, per-source refresh bookkeeping and JSON persistence.

use crate::error::Result;
use crate::model::{
    ActiveMount, Entry, RegistryStatus, SearchQuery, SourceRefreshStatus, SourceType,
};
use crate::search::{self, IndexRecord};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const ENTRIES_FILE: &str = "entries.json";
const MOUNTS_FILE: &str = "mounts.json";

/// Immutable view of the entry set plus its search index. Readers clone the
/// `Arc` and never block writers.
pub struct Snapshot {
    /// Entries in insertion order (search tie-break order).
    pub entries: Vec<Arc<Entry>>,
    by_id: HashMap<String, usize>,
    index: Vec<IndexRecord>,
}

impl Snapshot {
    fn empty() -> Self {
        Snapshot {
            entries: Vec::new(),
            by_id: HashMap::new(),
            index: Vec::new(),
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<Entry>> {
        self.by_id.get(id).map(|pos| &self.entries[*pos])
    }
}

struct MountTable {
    live: HashMap<String, ActiveMount>,
    /// Mounts loaded from a previous process. Their children are gone; kept
    /// for post-mortem inspection and pruned on the first list.
    recovered: Vec<ActiveMount>,
}

#[derive(Serialize, Deserialize)]
struct EntriesSnapshotFile {
    entries: Vec<serde_json::Value>,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct MountsSnapshotFile {
    mounts: Vec<serde_json::Value>,
    updated_at: DateTime<Utc>,
}

/// Central store for registry entries and active mounts.
pub struct Store {
    cache_dir: PathBuf,
    sources_dir: PathBuf,
    refresh_interval: Duration,
    snapshot: RwLock<Arc<Snapshot>>,
    /// Serializes writers so index rebuild and snapshot write stay consistent.
    write_guard: Mutex<()>,
    mounts: RwLock<MountTable>,
    status: RwLock<HashMap<SourceType, SourceRefreshStatus>>,
    refresh_guards: HashMap<SourceType, tokio::sync::Mutex<()>>,
}

impl Store {
    /// Open (or create) a store rooted at `cache_dir`, loading any persisted
    /// entries and mounts. Entries that fail validation are skipped with a
    /// warning; persisted mounts are loaded as recovered state only.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache or sources directory cannot be created.
    pub fn open(
        cache_dir: impl Into<PathBuf>,
        sources_dir: impl Into<PathBuf>,
        refresh_interval: Duration,
    ) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let sources_dir = sources_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        std::fs::create_dir_all(&sources_dir)?;

        let store = Store {
            cache_dir,
            sources_dir,
            refresh_interval,
            snapshot: RwLock::new(Arc::new(Snapshot::empty())),
            write_guard: Mutex::new(()),
            mounts: RwLock::new(MountTable {
                live: HashMap::new(),
                recovered: Vec::new(),
            }),
            status: RwLock::new(HashMap::new()),
            refresh_guards: SourceType::ALL
                .into_iter()
                .map(|source| (source, tokio::sync::Mutex::new(())))
                .collect(),
        };
        store.load_entries();
        store.load_mounts();
        Ok(store)
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    #[must_use]
    pub fn sources_dir(&self) -> &Path {
        &self.sources_dir
    }

    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Current read snapshot (entries + index).
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    // ── entries ────────────────────────────────────────────────────────

    /// Upsert a single entry (validated and normalized first), rebuilding
    /// the search index and persisting the snapshot.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed id or image reference.
    pub fn add(&self, entry: Entry) -> Result<()> {
        let entry = entry.normalized()?;
        let _guard = self.write_guard.lock();
        let mut entries = self.snapshot.read().entries.clone();
        let mut by_id: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.id.clone(), pos))
            .collect();
        upsert(&mut entries, &mut by_id, entry);
        self.commit_entries(entries, by_id);
        Ok(())
    }

    /// Upsert a batch in one commit. Invalid entries are skipped with a
    /// warning; returns the number actually applied.
    pub fn bulk_add(&self, batch: Vec<Entry>) -> usize {
        let _guard = self.write_guard.lock();
        let mut entries = self.snapshot.read().entries.clone();
        let mut by_id: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.id.clone(), pos))
            .collect();

        let mut applied = 0;
        for entry in batch {
            match entry.normalized() {
                Ok(entry) => {
                    upsert(&mut entries, &mut by_id, entry);
                    applied += 1;
                }
                Err(e) => tracing::warn!(error = %e, "skipping invalid entry in bulk add"),
            }
        }
        self.commit_entries(entries, by_id);
        tracing::info!(count = applied, "bulk added entries");
        applied
    }

    fn commit_entries(&self, entries: Vec<Arc<Entry>>, by_id: HashMap<String, usize>) {
        let index = search::build_index(&entries);
        let snapshot = Arc::new(Snapshot {
            entries,
            by_id,
            index,
        });
        *self.snapshot.write() = Arc::clone(&snapshot);
        self.save_entries(&snapshot);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Entry> {
        self.snapshot.read().get(id).map(|e| (**e).clone())
    }

    #[must_use]
    pub fn list(&self, limit: usize) -> Vec<Entry> {
        self.snapshot
            .read()
            .entries
            .iter()
            .take(limit)
            .map(|e| (**e).clone())
            .collect()
    }

    #[must_use]
    pub fn by_source(&self, source: SourceType) -> Vec<Entry> {
        self.snapshot
            .read()
            .entries
            .iter()
            .filter(|e| e.source == source)
            .map(|e| (**e).clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.read().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fuzzy + popularity ranked search over the current snapshot.
    #[must_use]
    pub fn search(&self, query: &SearchQuery) -> Vec<Entry> {
        let snapshot = self.snapshot();
        search::search(&snapshot.entries, &snapshot.index, query)
            .into_iter()
            .map(|e| (*e).clone())
            .collect()
    }

    // ── active mounts ──────────────────────────────────────────────────

    pub fn add_mount(&self, mount: ActiveMount) {
        let mut table = self.mounts.write();
        tracing::info!(entry_id = %mount.entry_id, prefix = %mount.prefix, "mounted server");
        table.live.insert(mount.entry_id.clone(), mount);
        self.save_mounts(&table);
    }

    pub fn remove_mount(&self, entry_id: &str) -> Option<ActiveMount> {
        let mut table = self.mounts.write();
        let mount = table.live.remove(entry_id);
        if let Some(m) = &mount {
            tracing::info!(entry_id = %m.entry_id, prefix = %m.prefix, "unmounted server");
            self.save_mounts(&table);
        }
        mount
    }

    #[must_use]
    pub fn get_mount(&self, entry_id: &str) -> Option<ActiveMount> {
        self.mounts.read().live.get(entry_id).cloned()
    }

    #[must_use]
    pub fn find_mount_by_prefix(&self, prefix: &str) -> Option<ActiveMount> {
        self.mounts
            .read()
            .live
            .values()
            .find(|m| m.prefix == prefix)
            .cloned()
    }

    /// Live mounts only. The first call prunes mounts recovered from a
    /// previous process (their children are gone) and re-persists.
    #[must_use]
    pub fn list_mounts(&self) -> Vec<ActiveMount> {
        let mut table = self.mounts.write();
        if !table.recovered.is_empty() {
            tracing::info!(
                count = table.recovered.len(),
                "pruning mounts recovered from a previous run"
            );
            table.recovered.clear();
            self.save_mounts(&table);
        }
        let mut mounts: Vec<ActiveMount> = table.live.values().cloned().collect();
        mounts.sort_by(|a, b| a.entry_id.cmp(&b.entry_id));
        mounts
    }

    #[must_use]
    pub fn mount_count(&self) -> usize {
        self.mounts.read().live.len()
    }

    /// Merge environment variables into a mount (applied on next restart).
    pub fn update_mount_env(
        &self,
        entry_id: &str,
        env: HashMap<String, String>,
    ) -> Option<ActiveMount> {
        let mut table = self.mounts.write();
        let mount = table.live.get_mut(entry_id)?;
        mount.environment.extend(env);
        let updated = mount.clone();
        tracing::info!(
            entry_id = %entry_id,
            keys = ?updated.environment.keys().collect::<Vec<_>>(),
            "updated mount environment"
        );
        self.save_mounts(&table);
        Some(updated)
    }

    // ── source status / staleness ──────────────────────────────────────

    pub fn update_source_status(&self, status: SourceRefreshStatus) {
        self.status.write().insert(status.source, status);
    }

    #[must_use]
    pub fn source_status(&self, source: SourceType) -> Option<SourceRefreshStatus> {
        self.status.read().get(&source).cloned()
    }

    /// Whether `source` is due for a refresh (never refreshed, or older than
    /// the configured interval).
    #[must_use]
    pub fn should_refresh(&self, source: SourceType) -> bool {
        let status = self.status.read();
        let Some(last) = status.get(&source).and_then(|s| s.last_refresh) else {
            return true;
        };
        let elapsed = Utc::now().signed_duration_since(last);
        elapsed.to_std().is_ok_and(|e| e >= self.refresh_interval)
    }

    /// Per-source refresh guard; refresh bodies for one source run strictly
    /// one at a time.
    #[must_use]
    pub fn refresh_guard(&self, source: SourceType) -> &tokio::sync::Mutex<()> {
        &self.refresh_guards[&source]
    }

    /// Aggregate status for `registry_status`.
    #[must_use]
    pub fn status(&self) -> RegistryStatus {
        let status = self.status.read();
        let sources: BTreeMap<String, SourceRefreshStatus> = status
            .values()
            .map(|s| (s.source.to_string(), s.clone()))
            .collect();
        let last_refresh_attempt = status.values().filter_map(|s| s.last_attempt).max();
        RegistryStatus {
            total_entries: self.len(),
            active_mounts: self.mount_count(),
            sources,
            last_refresh_attempt,
            cache_dir: self.cache_dir.display().to_string(),
            sources_dir: self.sources_dir.display().to_string(),
        }
    }

    // ── persistence ────────────────────────────────────────────────────

    /// Write both snapshot files (used by the shutdown sequence).
    ///
    /// # Errors
    ///
    /// Returns an error if either snapshot cannot be serialized or written.
    pub fn save(&self) -> Result<()> {
        let snapshot = self.snapshot();
        write_entries_file(&self.cache_dir.join(ENTRIES_FILE), &snapshot.entries)?;
        let table = self.mounts.read();
        write_mounts_file(&self.cache_dir.join(MOUNTS_FILE), &table)?;
        Ok(())
    }

    fn save_entries(&self, snapshot: &Snapshot) {
        let path = self.cache_dir.join(ENTRIES_FILE);
        if let Err(e) = write_entries_file(&path, &snapshot.entries) {
            tracing::error!(path = %path.display(), error = %e, "failed to save entries snapshot");
        }
    }

    fn save_mounts(&self, table: &MountTable) {
        let path = self.cache_dir.join(MOUNTS_FILE);
        if let Err(e) = write_mounts_file(&path, table) {
            tracing::error!(path = %path.display(), error = %e, "failed to save mounts snapshot");
        }
    }

    fn load_entries(&self) {
        let path = self.cache_dir.join(ENTRIES_FILE);
        if !path.exists() {
            tracing::info!("no cached registry entries found");
            return;
        }
        let file: EntriesSnapshotFile = match std::fs::read_to_string(&path)
            .map_err(crate::CatalogError::from)
            .and_then(|text| serde_json::from_str(&text).map_err(Into::into))
        {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load cached entries");
                return;
            }
        };

        let mut entries: Vec<Arc<Entry>> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();
        for value in file.entries {
            let id = value.get("id").and_then(|v| v.as_str()).unwrap_or("?").to_string();
            match serde_json::from_value::<Entry>(value).map_err(crate::CatalogError::from)
                .and_then(Entry::normalized)
            {
                Ok(entry) => upsert(&mut entries, &mut by_id, entry),
                Err(e) => tracing::warn!(entry_id = %id, error = %e, "skipping cached entry"),
            }
        }
        tracing::info!(count = entries.len(), "loaded entries from cache");

        let index = search::build_index(&entries);
        *self.snapshot.write() = Arc::new(Snapshot {
            entries,
            by_id,
            index,
        });
    }

    fn load_mounts(&self) {
        let path = self.cache_dir.join(MOUNTS_FILE);
        if !path.exists() {
            return;
        }
        let file: MountsSnapshotFile = match std::fs::read_to_string(&path)
            .map_err(crate::CatalogError::from)
            .and_then(|text| serde_json::from_str(&text).map_err(Into::into))
        {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load persisted mounts");
                return;
            }
        };

        let mut recovered = Vec::new();
        for value in file.mounts {
            match serde_json::from_value::<ActiveMount>(value) {
                Ok(mount) => recovered.push(mount),
                Err(e) => tracing::warn!(error = %e, "skipping persisted mount"),
            }
        }
        if !recovered.is_empty() {
            tracing::info!(
                count = recovered.len(),
                "loaded mounts from a previous run (diagnostic only, not reattached)"
            );
        }
        self.mounts.write().recovered = recovered;
    }
}

fn upsert(entries: &mut Vec<Arc<Entry>>, by_id: &mut HashMap<String, usize>, entry: Entry) {
    match by_id.get(&entry.id) {
        Some(pos) => entries[*pos] = Arc::new(entry),
        None => {
            by_id.insert(entry.id.clone(), entries.len());
            entries.push(Arc::new(entry));
        }
    }
}

fn write_entries_file(path: &Path, entries: &[Arc<Entry>]) -> Result<()> {
    let file = EntriesSnapshotFile {
        entries: entries
            .iter()
            .map(|e| serde_json::to_value(&**e))
            .collect::<std::result::Result<_, _>>()?,
        updated_at: Utc::now(),
    };
    std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
    Ok(())
}

fn write_mounts_file(path: &Path, table: &MountTable) -> Result<()> {
    let mut mounts: Vec<&ActiveMount> = table.live.values().collect();
    mounts.sort_by(|a, b| a.entry_id.cmp(&b.entry_id));
    mounts.extend(table.recovered.iter());
    let file = MountsSnapshotFile {
        mounts: mounts
            .into_iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()?,
        updated_at: Utc::now(),
    };
    std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
    Ok(())
}
