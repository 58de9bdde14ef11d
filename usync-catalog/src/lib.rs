//! Durable record storage and work queue: the Catalog named throughout
//! the design as the single source of truth for Folders, Files,
//! Segments, Articles, Shares, AuthorizedUsers and the WorkItem queue.

mod memory_store;
mod records;
mod sled_store;
mod store;

pub use memory_store::MemoryCatalog;
pub use records::{
    Article, AuthorizedUser, File, Folder, FolderState, PackedFileRange, Segment, SegmentStatus,
    Share, ShareType, WorkItem, WorkOperation,
};
pub use sled_store::SledCatalog;
pub use store::{Catalog, FolderLock};
