//! Folder indexing, fixed-size segmentation, small-file packing and the
//! Segment subject-naming scheme described in §4.3.

mod indexer;
mod packing;
mod segmenter;

pub use indexer::{content_set_matches, index_folder, IndexedFile};
pub use packing::{frame, unpack, Framed, PackedEntry};
pub use segmenter::{pack_small_files, split_fixed_size, PlainSegment, SegmentSource};
