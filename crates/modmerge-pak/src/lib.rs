//! Container handling for mod merging: recursive indexing and extraction,
//! cached content access, packing and file identity checks.

pub mod cache;
pub mod error;
pub mod format;
pub mod index;
pub mod writer;

pub use cache::{ContentCache, TreeCache};
pub use error::{PakError, Result};
pub use format::ArchiveFormat;
pub use index::{ArchiveEntry, ArchiveIndex, DuplicateEntry, EntryLocation, PathLookup};
pub use writer::{identical, pack, pack_to_file};
