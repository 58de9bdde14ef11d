//! Orchestration: CoreIndex wire format and signing, the Publisher and
//! Resolver that put and get a CoreIndex, the Uploader and Downloader
//! durable-queue consumers, and the Control surface exposed to a GUI
//! or CLI front end.

mod config;
mod control;
mod coreindex;
mod downloader;
mod publisher;
mod resolver;
mod uploader;

pub use config::{build_transport_pool, CoreConfig, ServerConfig};
pub use control::{
    ControlAccessType, ControlAuth, ControlRequest, ControlResponse, ControlSurface,
    ControlValue, ProgressEvent, ProgressSnapshot, StatsSnapshot,
};
pub use coreindex::{AccessBlock, CoreIndex, FileTableEntry, PackingTableEntry, SegmentTableEntry};
pub use downloader::{ensure_local_mirror, enqueue_pending_downloads, run_download_batch};
pub use publisher::{publish_folder, AccessSpec};
pub use resolver::{open, OpenAuth, ResolvedShare};
pub use uploader::{enqueue_pending_uploads, run_upload_batch, staging_path};
