//! On-disk naming of dictionary files
//!
//! File name format: `metric_<metric_name>___<pid>.mmap`
//!
//! One file per (metric, process). Listing the directory and keeping the
//! names that parse back to a given metric is how readers find every
//! process that has written to it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{StoreError, StoreResult};

const FILE_PREFIX: &str = "metric_";
const PID_SEPARATOR: &str = "___";
const FILE_EXTENSION: &str = ".mmap";

/// Maps (metric, pid) pairs to files in one directory
#[derive(Debug, Clone)]
pub struct FileLayout {
    dir: PathBuf,
}

impl FileLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileLayout { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reject names that cannot be embedded in a single file name
    pub fn validate_metric_name(metric_name: &str) -> StoreResult<()> {
        if metric_name.is_empty()
            || metric_name.contains(['/', '\\', '\0'])
            || metric_name == "."
            || metric_name == ".."
        {
            return Err(StoreError::InvalidMetricName(metric_name.to_string()));
        }
        Ok(())
    }

    /// File name for `metric_name` written by process `pid`
    pub fn file_name(metric_name: &str, pid: u32) -> String {
        format!("{FILE_PREFIX}{metric_name}{PID_SEPARATOR}{pid}{FILE_EXTENSION}")
    }

    /// Path of the file for `metric_name` written by process `pid`
    pub fn file_path(&self, metric_name: &str, pid: u32) -> PathBuf {
        self.dir.join(Self::file_name(metric_name, pid))
    }

    /// Parse a file name back to (metric name, pid).
    ///
    /// The pid is taken after the last separator, so metric names may
    /// themselves contain underscores.
    pub fn parse_file_name(file_name: &str) -> Option<(&str, u32)> {
        let stem = file_name
            .strip_prefix(FILE_PREFIX)?
            .strip_suffix(FILE_EXTENSION)?;
        let (metric_name, pid) = stem.rsplit_once(PID_SEPARATOR)?;
        if metric_name.is_empty() || pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((metric_name, pid.parse().ok()?))
    }

    /// Every file of `metric_name`, from any process, sorted by pid
    pub fn metric_files(&self, metric_name: &str) -> StoreResult<Vec<(u32, PathBuf)>> {
        let mut files: Vec<(u32, PathBuf)> = self
            .list()?
            .into_iter()
            .filter(|(name, _, _)| name == metric_name)
            .map(|(_, pid, path)| (pid, path))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Every file written by process `pid`, sorted by path
    pub fn process_files(&self, pid: u32) -> StoreResult<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = self
            .list()?
            .into_iter()
            .filter(|(_, file_pid, _)| *file_pid == pid)
            .map(|(_, _, path)| path)
            .collect();
        files.sort();
        Ok(files)
    }

    /// Distinct metric names with at least one file, sorted
    pub fn metric_names(&self) -> StoreResult<Vec<String>> {
        let mut names: Vec<String> = self.list()?.into_iter().map(|(name, _, _)| name).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// (metric name, pid, path) for every dictionary file in the directory
    fn list(&self) -> StoreResult<Vec<(String, u32, PathBuf)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                debug!(dir = %self.dir.display(), "skipping non UTF-8 file name");
                continue;
            };
            match Self::parse_file_name(file_name) {
                Some((metric_name, pid)) => {
                    files.push((metric_name.to_string(), pid, entry.path()));
                }
                None => debug!(file = file_name, "skipping unrelated file"),
            }
        }
        Ok(files)
    }
}
