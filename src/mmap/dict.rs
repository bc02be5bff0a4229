//! Mapped Dictionary - File Format, Open/Scan, Insert/Grow
//!
//! A dictionary of `f64` values keyed by strings, stored in one
//! memory-mapped file per (metric, process).
//!
//! ## File Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (8 bytes)                 │
//! │ - used: u32 LE                   │
//! │ - reserved: 4 bytes              │
//! ├──────────────────────────────────┤
//! │ Entry 0                          │
//! │ - key_length: u32 LE             │
//! │ - key: [u8; key_length] (UTF-8)  │
//! │ - padding: 1..=8 spaces          │
//! │ - value: f64 LE (8-byte aligned) │
//! ├──────────────────────────────────┤
//! │ Entry 1 ...                      │
//! ├──────────────────────────────────┤
//! │ zeroed spare capacity            │
//! └──────────────────────────────────┘
//! ```
//!
//! `used` counts the meaningful bytes from the start of the file. Entries
//! are only ever appended, so a key's value offset is fixed for the life of
//! the file. Single values are read and written with aligned 8-byte atomic
//! accesses; nothing else in the file is synchronized by this type.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapMut;
use tracing::debug;

use super::lock::FileLock;
use crate::error::{StoreError, StoreResult};

/// Header size in bytes
pub const HEADER_SIZE: usize = 8;
/// Capacity of a freshly created file (1MB)
pub const INITIAL_MMAP_SIZE: usize = 1024 * 1024;
/// Key length prefix size
const LEN_PREFIX_SIZE: usize = 4;
/// Value field size
const VALUE_SIZE: usize = 8;
/// Byte used to pad keys up to the value alignment
const PAD_BYTE: u8 = b' ';
/// Largest `used` the signed 32-bit header can express
const MAX_USED: usize = i32::MAX as usize;

/// Padding after a key of `key_len` bytes. Always 1..=8 bytes.
pub fn padding_len(key_len: usize) -> usize {
    8 - (key_len + LEN_PREFIX_SIZE) % 8
}

/// Total on-disk size of an entry for a key of `key_len` bytes
pub fn entry_size(key_len: usize) -> usize {
    LEN_PREFIX_SIZE + key_len + padding_len(key_len) + VALUE_SIZE
}

/// A string → f64 dictionary backed by a shared memory-mapped file
pub struct MmapedDict {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    used: usize,
    /// key → byte offset of its value field
    positions: HashMap<String, usize>,
}

impl MmapedDict {
    /// Open (or create) a dictionary with the default initial capacity
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::open_with_capacity(path, INITIAL_MMAP_SIZE)
    }

    /// Open a dictionary for writing, creating the file with
    /// `initial_capacity` zero bytes if it does not exist or is empty.
    /// Only the owning process opens a file this way; other processes read
    /// it through `DictReader`.
    pub fn open_with_capacity(path: &Path, initial_capacity: usize) -> StoreResult<Self> {
        debug_assert!(
            initial_capacity > HEADER_SIZE,
            "Precondition: initial capacity must exceed the header"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if file.metadata()?.len() == 0 {
            file.set_len(initial_capacity as u64)?;
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() < HEADER_SIZE {
            return Err(StoreError::corrupted(path, "file shorter than header"));
        }

        let mut dict = MmapedDict {
            file,
            mmap,
            path: path.to_path_buf(),
            used: 0,
            positions: HashMap::new(),
        };

        if dict.load_used() == 0 {
            dict.store_used(HEADER_SIZE);
        }
        dict.reload_used()?;

        for (key, _, value_offset) in dict.scan()? {
            dict.positions.insert(key, value_offset);
        }

        debug!(
            path = %dict.path.display(),
            capacity = dict.capacity(),
            used = dict.used,
            entries = dict.positions.len(),
            "opened mapped dictionary"
        );

        Ok(dict)
    }

    /// Read the value for `key`, inserting it with 0.0 first if absent.
    pub fn read_value(&mut self, key: &str) -> StoreResult<f64> {
        let offset = self.position_or_insert(key)?;
        Ok(self.load_value(offset))
    }

    /// Write the value for `key`, inserting it first if absent.
    pub fn write_value(&mut self, key: &str, value: f64) -> StoreResult<()> {
        let offset = self.position_or_insert(key)?;
        self.store_value(offset, value);
        Ok(())
    }

    /// Decode every (key, value) pair up to the `used` currently in the
    /// header. Takes no lock.
    pub fn all_entries(&mut self) -> StoreResult<Vec<(String, f64)>> {
        self.reload_used()?;
        Ok(self
            .scan()?
            .into_iter()
            .map(|(key, value, _)| (key, value))
            .collect())
    }

    /// Run `block` while holding an exclusive lock on the file. The lock is
    /// released whether or not `block` succeeds.
    pub fn with_file_lock<T, F>(&mut self, block: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Self) -> StoreResult<T>,
    {
        let _lock = self.lock_file()?;
        block(self)
    }

    /// Take an exclusive lock on the file, held until the guard is dropped
    pub fn lock_file(&self) -> StoreResult<FileLock> {
        Ok(FileLock::acquire(&self.file)?)
    }

    /// Flush mapped pages, fsync, then unmap and close
    pub fn close(self) -> StoreResult<()> {
        let MmapedDict { file, mmap, .. } = self;
        mmap.flush()?;
        file.sync_all()?;
        drop(mmap);
        drop(file);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in use, header included
    pub fn used(&self) -> usize {
        self.used
    }

    /// Current file (and mapping) size
    pub fn capacity(&self) -> usize {
        self.mmap.len()
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.positions.contains_key(key)
    }

    // ========================================================================
    // Entry insertion and growth
    // ========================================================================

    fn position_or_insert(&mut self, key: &str) -> StoreResult<usize> {
        match self.positions.get(key) {
            Some(&offset) => Ok(offset),
            None => self.insert(key),
        }
    }

    /// Append a zero-valued entry for `key`. Caller serializes mutation.
    fn insert(&mut self, key: &str) -> StoreResult<usize> {
        let key_len = key.len();
        if key_len > MAX_USED {
            return Err(StoreError::KeyTooLarge { len: key_len });
        }

        let size = entry_size(key_len);
        let start = self.used;
        let end = start
            .checked_add(size)
            .filter(|end| *end <= MAX_USED)
            .ok_or_else(|| StoreError::DictionaryFull {
                path: self.path.clone(),
                used: start,
            })?;

        if end > self.capacity() {
            self.grow(end)?;
        }

        let key_end = start + LEN_PREFIX_SIZE + key_len;
        let value_offset = end - VALUE_SIZE;
        let entry = &mut self.mmap[start..end];
        entry[..LEN_PREFIX_SIZE].copy_from_slice(&(key_len as u32).to_le_bytes());
        entry[LEN_PREFIX_SIZE..key_end - start].copy_from_slice(key.as_bytes());
        entry[key_end - start..value_offset - start].fill(PAD_BYTE);
        self.store_value(value_offset, 0.0);

        // Publish the entry only after it is fully written.
        self.used = end;
        self.store_used(end);
        self.positions.insert(key.to_owned(), value_offset);

        debug_assert_eq!(value_offset % 8, 0, "Postcondition: value must be 8-byte aligned");
        debug_assert!(self.used <= self.capacity(), "Postcondition: used within capacity");

        Ok(value_offset)
    }

    /// Take `used` from the header and check it against the mapping
    fn reload_used(&mut self) -> StoreResult<()> {
        let used = self.load_used();
        check_used(used, self.capacity(), &self.path)?;
        self.used = used;
        Ok(())
    }

    /// Double the capacity until `required` bytes fit, then remap
    fn grow(&mut self, required: usize) -> StoreResult<()> {
        let old_capacity = self.capacity();
        let mut new_capacity = old_capacity;
        while new_capacity < required {
            new_capacity = new_capacity.checked_mul(2).ok_or_else(|| {
                StoreError::DictionaryFull {
                    path: self.path.clone(),
                    used: self.used,
                }
            })?;
        }

        self.file.set_len(new_capacity as u64)?;
        self.remap()?;

        debug!(
            path = %self.path.display(),
            old_capacity,
            new_capacity = self.capacity(),
            "grew mapped dictionary"
        );
        Ok(())
    }

    /// Replace the mapping with one covering the whole current file.
    /// Every offset stays valid; no view into the old mapping survives
    /// because all access goes through `&self`/`&mut self`.
    fn remap(&mut self) -> StoreResult<()> {
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    /// Walk entries from the header to `used`: (key, value, value offset)
    fn scan(&self) -> StoreResult<Vec<(String, f64, usize)>> {
        scan_entries(&self.mmap, self.used, &self.path)
    }

    // ========================================================================
    // Raw mapped access
    // ========================================================================

    fn load_used(&self) -> usize {
        load_used(&self.mmap)
    }

    fn store_used(&mut self, used: usize) {
        debug_assert!(used <= MAX_USED);
        // SAFETY: the mapping is page aligned and at least HEADER_SIZE long.
        let cell = unsafe { &*(self.mmap.as_mut_ptr() as *const AtomicU32) };
        cell.store((used as u32).to_le(), Ordering::Release);
    }

    fn load_value(&self, offset: usize) -> f64 {
        load_value(&self.mmap, offset)
    }

    fn store_value(&mut self, offset: usize, value: f64) {
        debug_assert!(offset % 8 == 0 && offset + VALUE_SIZE <= self.capacity());
        // SAFETY: value offsets are 8-byte aligned within the page-aligned
        // mapping and bounds-checked by the insert or scan that produced them.
        let cell = unsafe { &*(self.mmap.as_mut_ptr().add(offset) as *const AtomicU64) };
        cell.store(value.to_bits().to_le(), Ordering::Release);
    }
}

impl std::fmt::Debug for MmapedDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapedDict")
            .field("path", &self.path)
            .field("used", &self.used)
            .field("capacity", &self.capacity())
            .field("entries", &self.positions.len())
            .finish()
    }
}

// ============================================================================
// Decoding shared with DictReader
// ============================================================================

/// Atomically read the `used` header of a mapping at least HEADER_SIZE long
pub(crate) fn load_used(map: &[u8]) -> usize {
    debug_assert!(map.len() >= HEADER_SIZE);
    // SAFETY: mappings are page aligned and at least HEADER_SIZE long.
    let cell = unsafe { &*(map.as_ptr() as *const AtomicU32) };
    u32::from_le(cell.load(Ordering::Acquire)) as usize
}

/// Atomically read the value at an 8-byte aligned offset
pub(crate) fn load_value(map: &[u8], offset: usize) -> f64 {
    debug_assert!(offset % 8 == 0 && offset + VALUE_SIZE <= map.len());
    // SAFETY: callers pass offsets produced by an insert or a bounds-checked
    // scan; they are 8-byte aligned from the page-aligned mapping base.
    let cell = unsafe { &*(map.as_ptr().add(offset) as *const AtomicU64) };
    f64::from_bits(u64::from_le(cell.load(Ordering::Acquire)))
}

/// Reject a `used` header that cannot describe a well-formed file
pub(crate) fn check_used(used: usize, capacity: usize, path: &Path) -> StoreResult<()> {
    if used > capacity {
        return Err(StoreError::corrupted(
            path,
            format!("used {} exceeds file size {}", used, capacity),
        ));
    }
    if used < HEADER_SIZE || used % 8 != 0 {
        return Err(StoreError::corrupted(
            path,
            format!("invalid used size {}", used),
        ));
    }
    Ok(())
}

/// Decode the entries of `map` between the header and `used`
pub(crate) fn scan_entries(
    map: &[u8],
    used: usize,
    path: &Path,
) -> StoreResult<Vec<(String, f64, usize)>> {
    let corrupted_at =
        |pos: usize, reason: &str| StoreError::corrupted(path, format!("{} at offset {}", reason, pos));
    let mut entries = Vec::new();
    let mut pos = HEADER_SIZE;

    while pos < used {
        if pos + LEN_PREFIX_SIZE > used {
            return Err(corrupted_at(pos, "truncated key length"));
        }
        let mut len_bytes = [0u8; LEN_PREFIX_SIZE];
        len_bytes.copy_from_slice(&map[pos..pos + LEN_PREFIX_SIZE]);
        let key_len = u32::from_le_bytes(len_bytes) as usize;
        if key_len > MAX_USED {
            return Err(corrupted_at(pos, "negative key length"));
        }

        let end = pos + entry_size(key_len);
        if end > used {
            return Err(corrupted_at(pos, "entry extends past used"));
        }

        let key_start = pos + LEN_PREFIX_SIZE;
        let key = std::str::from_utf8(&map[key_start..key_start + key_len])
            .map_err(|_| corrupted_at(pos, "key is not UTF-8"))?;
        let value_offset = end - VALUE_SIZE;

        entries.push((key.to_owned(), load_value(map, value_offset), value_offset));
        pos = end;
    }

    Ok(entries)
}

/// True when `err` is an I/O not-found error (file removed concurrently)
pub(crate) fn is_not_found(err: &StoreError) -> bool {
    matches!(err, StoreError::Io(e) if e.kind() == io::ErrorKind::NotFound)
}
