//! Read-only view of a dictionary owned by another process
//!
//! The file is opened read-only and mapped with `Mmap`, so nothing here can
//! change a file it does not own. A file the owner has created but not yet
//! sized or initialized reads as empty.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::dict::{check_used, load_used, scan_entries, HEADER_SIZE};
use super::lock::FileLock;
use crate::error::StoreResult;

/// Read-only handle on a dictionary file
pub struct DictReader {
    file: File,
    path: PathBuf,
    /// None until the file is at least a header long
    mmap: Option<Mmap>,
}

impl DictReader {
    /// Open an existing file. Fails with an I/O `NotFound` error if absent.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = File::open(path)?;
        Ok(DictReader {
            file,
            path: path.to_path_buf(),
            mmap: None,
        })
    }

    /// Run `block` while holding an exclusive lock on the file
    pub fn with_file_lock<T, F>(&mut self, block: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Self) -> StoreResult<T>,
    {
        let _lock = FileLock::acquire(&self.file)?;
        block(self)
    }

    /// Every (key, value) pair up to the `used` currently in the header
    pub fn all_entries(&mut self) -> StoreResult<Vec<(String, f64)>> {
        let Some(used) = self.refresh()? else {
            return Ok(Vec::new());
        };
        let Some(mmap) = self.mmap.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(scan_entries(mmap, used, &self.path)?
            .into_iter()
            .map(|(key, value, _)| (key, value))
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the current mapping; 0 before the first successful map
    pub fn mapped_len(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len())
    }

    /// Map (or remap) as needed and return `used`, or None while the owner
    /// has not initialized the header yet.
    fn refresh(&mut self) -> StoreResult<Option<usize>> {
        if self.mapped_len() < HEADER_SIZE && !self.remap()? {
            return Ok(None);
        }
        let mut used = load_used(self.current());
        if used == 0 {
            return Ok(None);
        }
        if used > self.mapped_len() {
            // The owner grew the file since it was mapped here.
            self.remap()?;
            used = load_used(self.current());
        }
        check_used(used, self.mapped_len(), &self.path)?;
        Ok(Some(used))
    }

    /// Map the whole file. Returns false, leaving nothing mapped, when the
    /// file is still shorter than a header.
    fn remap(&mut self) -> StoreResult<bool> {
        let len = self.file.metadata()?.len() as usize;
        if len < HEADER_SIZE {
            self.mmap = None;
            return Ok(false);
        }
        self.mmap = Some(unsafe { Mmap::map(&self.file)? });
        Ok(self.mapped_len() >= HEADER_SIZE)
    }

    fn current(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

impl std::fmt::Debug for DictReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictReader")
            .field("path", &self.path)
            .field("mapped_len", &self.mapped_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::mmap::dict::{is_not_found, MmapedDict, INITIAL_MMAP_SIZE};

    fn dict_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("metric_test___1.mmap")
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = DictReader::open(&dict_path(&dir)).unwrap_err();
        assert!(is_not_found(&err));
        assert!(!dict_path(&dir).exists());
    }

    #[test]
    fn test_empty_file_reads_empty_and_stays_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dict_path(&dir);
        std::fs::write(&path, b"").unwrap();

        let mut reader = DictReader::open(&path).unwrap();
        assert!(reader.with_file_lock(|r| r.all_entries()).unwrap().is_empty());

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_uninitialized_header_stays_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dict_path(&dir);
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        let mut reader = DictReader::open(&path).unwrap();
        assert!(reader.all_entries().unwrap().is_empty());

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, vec![0u8; 64]);
    }

    #[test]
    fn test_reader_sees_owner_initialize_after_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dict_path(&dir);
        std::fs::write(&path, b"").unwrap();

        let mut reader = DictReader::open(&path).unwrap();
        assert!(reader.all_entries().unwrap().is_empty());

        let mut owner = MmapedDict::open_with_capacity(&path, 64).unwrap();
        owner.write_value("foo=bar", 5.0).unwrap();

        assert_eq!(
            reader.all_entries().unwrap(),
            vec![("foo=bar".to_string(), 5.0)]
        );
        // The owner's header is exactly what the owner wrote.
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], &(owner.used() as u32).to_le_bytes());
    }

    #[test]
    fn test_reader_sees_owner_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dict_path(&dir);
        let mut owner = MmapedDict::open(&path).unwrap();
        owner.write_value("a", 1.0).unwrap();

        let mut reader = DictReader::open(&path).unwrap();
        assert_eq!(reader.all_entries().unwrap(), vec![("a".to_string(), 1.0)]);

        owner.write_value("a", 2.0).unwrap();
        assert_eq!(reader.all_entries().unwrap(), vec![("a".to_string(), 2.0)]);
        assert_eq!(reader.mapped_len(), INITIAL_MMAP_SIZE);
    }

    #[test]
    fn test_reader_follows_appends_and_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dict_path(&dir);
        let mut owner = MmapedDict::open_with_capacity(&path, 64).unwrap();
        owner.write_value("a", 1.0).unwrap();

        let mut reader = DictReader::open(&path).unwrap();
        assert!(!reader.all_entries().unwrap().is_empty());
        for i in 0..20 {
            owner.write_value(&format!("key_{}", i), i as f64).unwrap();
        }
        assert!(owner.capacity() > reader.mapped_len());

        let entries = reader.all_entries().unwrap();
        assert_eq!(entries.len(), 21);
        assert_eq!(entries[20], ("key_19".to_string(), 19.0));
        assert_eq!(reader.mapped_len(), owner.capacity());
    }

    #[test]
    fn test_corrupted_header_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dict_path(&dir);
        let mut bytes = vec![0u8; 64];
        bytes[0..4].copy_from_slice(&4096u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let err = DictReader::open(&path).unwrap().all_entries().unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { .. }), "{}", err);
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[cfg(unix)]
    #[test]
    fn test_with_file_lock_excludes_other_handles() {
        use crate::mmap::lock::FileLockExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dict_path(&dir);
        let _owner = MmapedDict::open(&path).unwrap();
        let mut reader = DictReader::open(&path).unwrap();
        let other = std::fs::File::open(&path).unwrap();

        reader
            .with_file_lock(|_| {
                assert!(!other.try_lock_exclusive().unwrap());
                Ok(())
            })
            .unwrap();
        assert!(other.try_lock_exclusive().unwrap());
    }
}
