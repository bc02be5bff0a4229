//! Multi-process metric store over mapped dictionaries
//!
//! ## Architecture
//!
//! ```text
//! writer (pid 12)                   writer (pid 34)
//!   MmapMetricStore                   MmapMetricStore
//!     └─ metric_x___12.mmap             └─ metric_x___34.mmap
//!                  \                     /
//!                   all_values (any pid): map each file read-only,
//!                   flock, scan, group by label set, fold
//! ```
//!
//! Each process writes only its own file, so growth never races across
//! processes. Within a process a re-entrant mutex serializes every mutating
//! call, growth included. The file lock is taken only by `synchronize` and by
//! readers, which is what keeps multi-value updates whole for `all_values`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use parking_lot::ReentrantMutex;
use tracing::{debug, info};

use super::dict::{is_not_found, MmapedDict};
use super::layout::FileLayout;
use super::reader::DictReader;
use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::metrics::{Aggregation, LabelKeyEncoder, LabelSet, MetricSettings, MetricType};
use crate::store::{DataStore, MetricStore};

/// Factory for mmap-backed metric stores sharing one directory
#[derive(Debug, Clone)]
pub struct MmapStore {
    config: StoreConfig,
    layout: FileLayout,
    process_id: u32,
}

impl MmapStore {
    /// Store writing files tagged with the current process id.
    /// Creates the directory if it doesn't exist.
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        Self::with_process_id(config, std::process::id())
    }

    /// Store over a directory that must already exist, for processes that
    /// only read. Fails with an I/O `NotFound` error instead of creating it.
    pub fn existing(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let not_dir = |reason: String| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{}: {}", config.dir.display(), reason),
            )
        };
        match fs::metadata(&config.dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(not_dir("not a directory".to_string()).into()),
            Err(e) => return Err(not_dir(e.to_string()).into()),
        }
        let layout = FileLayout::new(config.dir.clone());
        Ok(MmapStore {
            config,
            layout,
            process_id: std::process::id(),
        })
    }

    /// Store writing files tagged with `process_id`
    pub fn with_process_id(config: StoreConfig, process_id: u32) -> StoreResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;
        let layout = FileLayout::new(config.dir.clone());
        Ok(MmapStore {
            config,
            layout,
            process_id,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Files of `metric_name` from every process, sorted by pid
    pub fn metric_files(&self, metric_name: &str) -> StoreResult<Vec<(u32, PathBuf)>> {
        self.layout.metric_files(metric_name)
    }

    /// Names of all metrics with at least one file in the directory
    pub fn metric_names(&self) -> StoreResult<Vec<String>> {
        self.layout.metric_names()
    }

    /// Delete every file written by process `pid`, returning how many.
    ///
    /// Files of exited processes keep contributing to `all_values` until
    /// removed here. Removing the files of a live process loses its values
    /// for readers while it keeps writing to the unlinked file.
    pub fn remove_process_files(&self, pid: u32) -> StoreResult<usize> {
        let mut removed = 0;
        for path in self.layout.process_files(pid)? {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(pid, removed, dir = %self.layout.dir().display(), "removed process metric files");
        Ok(removed)
    }
}

impl DataStore for MmapStore {
    type Store = MmapMetricStore;

    fn for_metric(
        &self,
        metric_name: &str,
        metric_type: MetricType,
        settings: &MetricSettings,
    ) -> StoreResult<MmapMetricStore> {
        FileLayout::validate_metric_name(metric_name)?;
        let aggregation = settings.resolve_aggregation(metric_type)?;

        Ok(MmapMetricStore {
            metric_name: metric_name.to_string(),
            aggregation,
            layout: self.layout.clone(),
            process_id: self.process_id,
            initial_capacity: self.config.initial_capacity,
            internal: ReentrantMutex::new(RefCell::new(None)),
        })
    }
}

/// Values of one metric: this process's dictionary for writes, every
/// process's dictionary for `all_values`.
pub struct MmapMetricStore {
    metric_name: String,
    aggregation: Aggregation,
    layout: FileLayout,
    process_id: u32,
    initial_capacity: usize,
    /// Opened on first use
    internal: ReentrantMutex<RefCell<Option<MmapedDict>>>,
}

impl MmapMetricStore {
    /// Path of the file this process writes
    pub fn file_path(&self) -> PathBuf {
        self.layout.file_path(&self.metric_name, self.process_id)
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Flush and unmap this process's dictionary. The next write reopens it.
    pub fn close(&self) -> StoreResult<()> {
        let guard = self.internal.lock();
        let dict = guard.borrow_mut().take();
        match dict {
            Some(dict) => dict.close(),
            None => Ok(()),
        }
    }

    /// Run `f` on this process's dictionary under the in-process lock.
    /// `f` must not call back into the store.
    fn with_internal<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut MmapedDict) -> StoreResult<T>,
    {
        let guard = self.internal.lock();
        let mut slot = guard.borrow_mut();
        let dict = match slot.take() {
            Some(dict) => dict,
            None => {
                let dict = MmapedDict::open_with_capacity(&self.file_path(), self.initial_capacity)?;
                debug!(metric = %self.metric_name, pid = self.process_id, "opened process dictionary");
                dict
            }
        };
        f(slot.insert(dict))
    }

    /// Read every file of this metric under its file lock: (pid, entries)
    fn read_all_files(&self) -> StoreResult<Vec<(u32, Vec<(String, f64)>)>> {
        let mut files = Vec::new();
        for (pid, path) in self.layout.metric_files(&self.metric_name)? {
            let mut reader = match DictReader::open(&path) {
                Ok(reader) => reader,
                Err(e) if is_not_found(&e) => {
                    debug!(path = %path.display(), "metric file removed before read");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let entries = reader.with_file_lock(|r| r.all_entries())?;
            files.push((pid, entries));
        }
        Ok(files)
    }
}

impl MetricStore for MmapMetricStore {
    fn metric_name(&self) -> &str {
        &self.metric_name
    }

    fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    fn set(&self, labels: &LabelSet, value: f64) -> StoreResult<()> {
        let key = LabelKeyEncoder::encode(labels);
        self.with_internal(|dict| dict.write_value(&key, value))
    }

    fn increment(&self, labels: &LabelSet, by: f64) -> StoreResult<()> {
        let key = LabelKeyEncoder::encode(labels);
        self.with_internal(|dict| {
            let value = dict.read_value(&key)?;
            dict.write_value(&key, value + by)
        })
    }

    fn get(&self, labels: &LabelSet) -> StoreResult<f64> {
        let key = LabelKeyEncoder::encode(labels);
        self.with_internal(|dict| dict.read_value(&key))
    }

    /// Holds the in-process lock and this process's file lock while `block`
    /// runs. Calling `all_values` from inside `block` deadlocks on the file
    /// lock.
    fn synchronize(
        &self,
        block: &mut dyn FnMut(&dyn MetricStore) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let _guard = self.internal.lock();
        let _file_lock = self.with_internal(|dict| dict.lock_file())?;
        block(self)
    }

    fn all_values(&self) -> StoreResult<BTreeMap<LabelSet, f64>> {
        let files = self.read_all_files()?;
        debug!(metric = %self.metric_name, files = files.len(), "aggregating metric files");

        let mut grouped: BTreeMap<LabelSet, Vec<f64>> = BTreeMap::new();
        for (_, entries) in files {
            for (key, value) in entries {
                grouped
                    .entry(LabelKeyEncoder::decode(&key))
                    .or_default()
                    .push(value);
            }
        }

        Ok(grouped
            .into_iter()
            .filter_map(|(labels, values)| {
                self.aggregation.fold(values).map(|value| (labels, value))
            })
            .collect())
    }
}

impl std::fmt::Debug for MmapMetricStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapMetricStore")
            .field("metric_name", &self.metric_name)
            .field("aggregation", &self.aggregation)
            .field("process_id", &self.process_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn store(dir: &tempfile::TempDir, pid: u32) -> MmapStore {
        MmapStore::with_process_id(StoreConfig::new(dir.path()), pid).unwrap()
    }

    #[test]
    fn test_no_file_until_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let metric = store(&dir, 1)
            .for_metric("requests", MetricType::Counter, &MetricSettings::new())
            .unwrap();

        assert!(!metric.file_path().exists());
        assert!(metric.all_values().unwrap().is_empty());
        assert!(!metric.file_path().exists(), "reading must not create files");

        metric.increment_one(&LabelSet::empty()).unwrap();
        assert!(metric.file_path().exists());
        assert_eq!(
            metric.file_path().file_name().unwrap(),
            "metric_requests___1.mmap"
        );
    }

    #[test]
    fn test_invalid_settings_touch_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("metrics");
        let store = MmapStore::with_process_id(StoreConfig::new(&data_dir), 1).unwrap();

        let bad_mode = store.for_metric(
            "requests",
            MetricType::Counter,
            &MetricSettings::new().with("aggregation", "invalid"),
        );
        let bad_key = store.for_metric(
            "requests",
            MetricType::Counter,
            &MetricSettings::new().with("some_setting", "true"),
        );
        let bad_name = store.for_metric("../x", MetricType::Counter, &MetricSettings::new());

        assert!(matches!(bad_mode, Err(StoreError::InvalidSettings(_))));
        assert!(matches!(bad_key, Err(StoreError::InvalidSettings(_))));
        assert!(matches!(bad_name, Err(StoreError::InvalidMetricName(_))));
        assert_eq!(fs::read_dir(&data_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_synchronize_reenters_store() {
        let dir = tempfile::tempdir().unwrap();
        let metric = store(&dir, 1)
            .for_metric("latency", MetricType::Histogram, &MetricSettings::new())
            .unwrap();
        let bucket = LabelSet::from_pairs(&[("le", "0.5")]);
        let count = LabelSet::from_pairs(&[("le", "+Inf")]);

        metric
            .synchronize(&mut |s| {
                s.increment(&bucket, 1.0)?;
                s.increment(&count, 1.0)?;
                assert_eq!(s.get(&bucket)?, 1.0);
                Ok(())
            })
            .unwrap();

        let values = metric.all_values().unwrap();
        assert_eq!(values[&bucket], 1.0);
        assert_eq!(values[&count], 1.0);
    }

    #[test]
    fn test_synchronize_error_releases_locks() {
        let dir = tempfile::tempdir().unwrap();
        let metric = store(&dir, 1)
            .for_metric("requests", MetricType::Counter, &MetricSettings::new())
            .unwrap();
        let labels = LabelSet::from_pairs(&[("code", "200")]);

        let result = metric.synchronize(&mut |s| {
            s.increment(&labels, 1.0)?;
            Err(StoreError::InvalidConfig("abort".to_string()))
        });
        assert!(result.is_err());

        // Both locks must be free again: all_values takes the file lock.
        assert_eq!(metric.all_values().unwrap()[&labels], 1.0);
    }

    #[test]
    fn test_existing_does_not_create_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("typo");

        let err = MmapStore::existing(StoreConfig::new(&missing)).unwrap_err();
        assert!(is_not_found(&err));
        assert!(!missing.exists());

        let file = dir.path().join("file");
        fs::write(&file, b"").unwrap();
        assert!(MmapStore::existing(StoreConfig::new(&file)).is_err());

        let store = MmapStore::existing(StoreConfig::new(dir.path())).unwrap();
        assert!(store.metric_names().unwrap().is_empty());
    }

    #[test]
    fn test_all_values_leaves_foreign_files_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let metric = store(&dir, 1)
            .for_metric("m", MetricType::Counter, &MetricSettings::new())
            .unwrap();

        // Created by process 7, not yet sized
        let empty = dir.path().join("metric_m___7.mmap");
        fs::write(&empty, b"").unwrap();
        // Sized by process 8, header not yet written
        let zeroed = dir.path().join("metric_m___8.mmap");
        fs::write(&zeroed, vec![0u8; 64]).unwrap();

        assert!(metric.all_values().unwrap().is_empty());

        assert_eq!(fs::metadata(&empty).unwrap().len(), 0);
        assert_eq!(fs::read(&zeroed).unwrap(), vec![0u8; 64]);
        assert!(!metric.file_path().exists());
    }

    #[test]
    fn test_close_then_write_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let metric = store(&dir, 1)
            .for_metric("requests", MetricType::Counter, &MetricSettings::new())
            .unwrap();
        let labels = LabelSet::from_pairs(&[("code", "200")]);

        metric.close().unwrap();
        metric.increment(&labels, 2.0).unwrap();
        metric.close().unwrap();
        metric.increment(&labels, 3.0).unwrap();

        assert_eq!(metric.get(&labels).unwrap(), 5.0);
    }

    #[test]
    fn test_remove_process_files() {
        let dir = tempfile::tempdir().unwrap();
        let labels = LabelSet::from_pairs(&[("foo", "bar")]);
        for pid in [1, 2] {
            let s = store(&dir, pid);
            for name in ["a", "b"] {
                s.for_metric(name, MetricType::Counter, &MetricSettings::new())
                    .unwrap()
                    .set(&labels, pid as f64)
                    .unwrap();
            }
        }

        let reader = store(&dir, 3);
        assert_eq!(reader.remove_process_files(1).unwrap(), 2);
        assert_eq!(reader.remove_process_files(1).unwrap(), 0);

        let a = reader
            .for_metric("a", MetricType::Counter, &MetricSettings::new())
            .unwrap();
        assert_eq!(a.all_values().unwrap()[&labels], 2.0);
        assert_eq!(reader.metric_files("a").unwrap().len(), 1);
    }
}
