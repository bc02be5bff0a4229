//! Memory-Mapped Metric Storage
//!
//! Values live in per-process mapped dictionary files so that forked worker
//! processes can each write their own file and any process can read the
//! aggregate of all of them.
//!
//! ## File Format
//!
//! ```text
//! [used: u32 LE][pad: 4]
//! [key_len: u32 LE][key bytes][space pad to 8][value: f64 LE]  (repeated)
//! ```
//!
//! Every value sits on an 8-byte boundary, so readers see either the old
//! or the new value of a cell and never a torn one.

pub mod dict;
pub mod layout;
pub mod lock;
pub mod reader;
mod store;

pub use dict::MmapedDict;
pub use layout::FileLayout;
pub use lock::{FileLock, FileLockExt};
pub use reader::DictReader;
pub use store::{MmapMetricStore, MmapStore};
