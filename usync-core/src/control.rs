//! The request/response surface exposed to external collaborators
//! (GUI/CLI), per §6. Grounded on spec.md §9's redesign flag ("runtime
//! string-keyed dispatch ... → a single tagged request/response
//! enumeration, with compile-time exhaustive handling"): `ControlRequest`
//! is matched exhaustively in `ControlSurface::handle` rather than
//! looked up by name.

use crate::config::CoreConfig;
use crate::downloader;
use crate::publisher::{self, AccessSpec};
use crate::resolver::{self, OpenAuth};
use crate::uploader;
use chrono::Duration;
use rand_core::{OsRng, RngCore};
use std::path::Path;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use usync_catalog::{Catalog, File, Folder, FolderState, Segment, SegmentStatus, WorkOperation};
use usync_common::{FolderId, ShareId, UsyncError};
use usync_crypto::{Identity, IdentitySecretStore, PublicCommitment};
use usync_nntp::ArticleTransport;

/// How a `download_share` caller proves access, the wire-friendly form of
/// `resolver::OpenAuth` (no borrowed `Identity` reference, since this
/// enum crosses the control boundary).
pub enum ControlAuth {
    Public,
    Private,
    Protected { password: String },
}

pub enum ControlAccessType {
    Public,
    Private { authorized: Vec<PublicCommitment> },
    Protected { password: String },
}

#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub total_segments: u64,
    pub posted_segments: u64,
}

impl ProgressSnapshot {
    pub fn fraction(&self) -> f64 {
        if self.total_segments == 0 {
            0.0
        } else {
            self.posted_segments as f64 / self.total_segments as f64
        }
    }
}

/// One tick of an in-progress `upload_folder`/`download_share`, pushed
/// to subscribers of `ControlSurface::subscribe_progress` after every
/// batch iteration. Unlike `ProgressSnapshot`, which a caller pulls on
/// demand via a `Progress` request, this is pushed without polling.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub folder_id: FolderId,
    pub snapshot: ProgressSnapshot,
}

#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub folders: usize,
    pub shares: usize,
    pub pending_uploads: usize,
    pub pending_downloads: usize,
}

pub enum ControlRequest {
    InitializeIdentity,
    RegisterFolder { path: String, name: String },
    IndexFolder { folder_id: FolderId },
    SegmentFolder { folder_id: FolderId },
    UploadFolder { folder_id: FolderId },
    PublishFolder { folder_id: FolderId, access: ControlAccessType, expires_in: Option<Duration> },
    RevokeShare { share_id: ShareId },
    DownloadShare { share_id: ShareId, dest: String, auth: ControlAuth },
    Progress { folder_id: FolderId },
    Stats,
}

pub enum ControlValue {
    UserId(String),
    FolderId(FolderId),
    SegmentsEnqueued(usize),
    SegmentsPosted(usize),
    SegmentsDownloaded(usize),
    Share(usync_catalog::Share),
    Progress(ProgressSnapshot),
    Stats(StatsSnapshot),
    None,
}

/// The stable result envelope named in §6: `{ ok, value|error_kind, message }`.
pub struct ControlResponse {
    pub ok: bool,
    pub value: Option<ControlValue>,
    pub error_kind: Option<String>,
    pub message: String,
}

impl ControlResponse {
    fn ok(value: ControlValue) -> Self {
        Self { ok: true, value: Some(value), error_kind: None, message: String::new() }
    }

    fn err(e: anyhow::Error) -> Self {
        let error_kind = e.downcast_ref::<UsyncError>().map(error_kind_name).unwrap_or("Internal").to_string();
        Self { ok: false, value: None, error_kind: Some(error_kind), message: e.to_string() }
    }
}

/// Owns nothing durable itself; every call re-derives what it needs from
/// the Catalog and `identity_store`, so a `ControlSurface` can be
/// constructed fresh per request without losing state.
pub struct ControlSurface<'a> {
    pub catalog: &'a dyn Catalog,
    pub transport: &'a dyn ArticleTransport,
    pub config: &'a CoreConfig,
    pub identity_store: &'a dyn IdentitySecretStore,
    cancel: CancellationToken,
    progress_tx: Option<broadcast::Sender<ProgressEvent>>,
}

impl<'a> ControlSurface<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        transport: &'a dyn ArticleTransport,
        config: &'a CoreConfig,
        identity_store: &'a dyn IdentitySecretStore,
    ) -> Self {
        Self {
            catalog,
            transport,
            config,
            identity_store,
            cancel: CancellationToken::new(),
            progress_tx: None,
        }
    }

    /// The token that stops this surface's in-flight `upload_folder`/
    /// `download_share` polling loop between WorkItem batches. Cloned so
    /// the embedder can hold it and call `.cancel()` from another task
    /// while `handle` is in flight.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribes to incremental `ProgressEvent`s pushed during
    /// `upload_folder`/`download_share`, alongside the one-shot
    /// `Progress` request. Lazily creates the broadcast channel on first
    /// subscription.
    pub fn subscribe_progress(&mut self) -> broadcast::Receiver<ProgressEvent> {
        if let Some(tx) = &self.progress_tx {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(64);
        self.progress_tx = Some(tx);
        rx
    }

    fn emit_progress(&self, folder_id: FolderId, snapshot: ProgressSnapshot) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(ProgressEvent { folder_id, snapshot });
        }
    }

    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        let result = match request {
            ControlRequest::InitializeIdentity => self.initialize_identity(),
            ControlRequest::RegisterFolder { path, name } => self.register_folder(path, name).await,
            ControlRequest::IndexFolder { folder_id } => self.index_folder(folder_id).await,
            ControlRequest::SegmentFolder { folder_id } => self.segment_folder(folder_id).await,
            ControlRequest::UploadFolder { folder_id } => self.upload_folder(folder_id).await,
            ControlRequest::PublishFolder { folder_id, access, expires_in } => {
                self.publish_folder(folder_id, access, expires_in).await
            }
            ControlRequest::RevokeShare { share_id } => self.revoke_share(share_id).await,
            ControlRequest::DownloadShare { share_id, dest, auth } => {
                self.download_share(share_id, dest, auth).await
            }
            ControlRequest::Progress { folder_id } => self.progress(folder_id).await,
            ControlRequest::Stats => self.stats().await,
        };
        match result {
            Ok(value) => ControlResponse::ok(value),
            Err(e) => ControlResponse::err(e),
        }
    }

    fn initialize_identity(&self) -> anyhow::Result<ControlValue> {
        let identity = Identity::ensure_identity(self.identity_store, &self.config.identity_intent)?;
        Ok(ControlValue::UserId(identity.user_id()))
    }

    async fn register_folder(&self, path: String, name: String) -> anyhow::Result<ControlValue> {
        let folder_id = FolderId::new();
        let mut root_secret = [0u8; 32];
        let mut folder_key_seed = [0u8; 32];
        OsRng.fill_bytes(&mut root_secret);
        OsRng.fill_bytes(&mut folder_key_seed);

        self.catalog
            .put_folder(&Folder {
                folder_id,
                path,
                display_name: name,
                created_at: chrono::Utc::now(),
                state: FolderState::Registered,
                segment_size: self.config.segment_size,
                root_secret,
                folder_key_seed,
            })
            .await?;
        Ok(ControlValue::FolderId(folder_id))
    }

    async fn index_folder(&self, folder_id: FolderId) -> anyhow::Result<ControlValue> {
        let mut folder = self.require_folder(&folder_id).await?;
        let _lock = self.catalog.lock_folder(&folder_id).await;

        let indexed = usync_segment::index_folder(&folder.path).await?;
        for f in &indexed {
            self.catalog
                .put_file(&File {
                    file_id: f.file_id,
                    folder_id,
                    rel_path: f.rel_path.clone(),
                    size: f.size,
                    sha256: f.sha256,
                    modified_at: f.modified_at,
                    duplicate_of: f.duplicate_of,
                })
                .await?;
        }

        if folder.state == FolderState::Registered {
            folder.state = FolderState::Indexed;
            self.catalog.put_folder(&folder).await?;
        }
        Ok(ControlValue::SegmentsEnqueued(indexed.len()))
    }

    /// Splits and packs every File's bytes into plaintext Segments per
    /// §4.3, staging each one to disk for the Uploader. Re-running this
    /// for a folder replaces its Segment set entirely, matching the
    /// Open Question decision that a content change requires a full
    /// index → segment → upload cycle rather than an incremental diff.
    async fn segment_folder(&self, folder_id: FolderId) -> anyhow::Result<ControlValue> {
        let mut folder = self.require_folder(&folder_id).await?;
        let _lock = self.catalog.lock_folder(&folder_id).await;

        let files = self.catalog.list_files_by_folder(&folder_id).await?;
        for stale in self.catalog.list_segments_by_folder(&folder_id).await? {
            let staged = uploader::staging_path(&folder.path, &stale.segment_id);
            let _ = tokio::fs::remove_file(&staged).await;
        }

        let mut small = Vec::new();
        let mut next_index = 0u64;
        let mut created = 0usize;

        for f in &files {
            let path = Path::new(&folder.path).join(&f.rel_path);
            if f.duplicate_of.is_some() {
                continue;
            }
            if f.size < folder.segment_size {
                let bytes = tokio::fs::read(&path).await?;
                small.push((
                    usync_segment::IndexedFile {
                        file_id: f.file_id,
                        rel_path: f.rel_path.clone(),
                        size: f.size,
                        sha256: f.sha256,
                        modified_at: f.modified_at,
                        duplicate_of: f.duplicate_of,
                    },
                    bytes,
                ));
                continue;
            }
            let reader = tokio::fs::File::open(&path).await?;
            let segments = usync_segment::split_fixed_size(
                f.file_id,
                tokio::io::BufReader::new(reader),
                folder.segment_size,
                &mut next_index,
                &folder_id,
                &folder.root_secret,
                1,
                &mut OsRng,
            )
            .await?;
            created += self.persist_plain_segments(&folder, segments).await?;
        }

        if !small.is_empty() {
            let packed = usync_segment::pack_small_files(
                &small,
                folder.segment_size,
                &mut next_index,
                &folder_id,
                &folder.root_secret,
                1,
                &mut OsRng,
            );
            created += self.persist_plain_segments(&folder, packed).await?;
        }

        if folder.state == FolderState::Indexed || folder.state == FolderState::Registered {
            folder.state = FolderState::Segmented;
            self.catalog.put_folder(&folder).await?;
        }
        Ok(ControlValue::SegmentsEnqueued(created))
    }

    async fn persist_plain_segments(
        &self,
        folder: &Folder,
        segments: Vec<usync_segment::PlainSegment>,
    ) -> anyhow::Result<usize> {
        let mut count = 0;
        for s in segments {
            let segment_id = usync_common::SegmentId::new();
            let staged = uploader::staging_path(&folder.path, &segment_id);
            if let Some(parent) = staged.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&staged, &s.plaintext).await?;

            let (file_id, packed_entries) = match s.source {
                usync_segment::SegmentSource::Single { file_id, .. } => (file_id, None),
                usync_segment::SegmentSource::Packed(entries) => {
                    let owner = entries.first().expect("packed segment has at least one entry").file_id;
                    let ranges = entries
                        .into_iter()
                        .map(|e| usync_catalog::PackedFileRange {
                            file_id: e.file_id,
                            offset: e.offset,
                            length: e.length,
                        })
                        .collect();
                    (owner, Some(ranges))
                }
            };

            self.catalog
                .put_segment(&Segment {
                    segment_id,
                    file_id,
                    folder_id: folder.folder_id,
                    index: s.index,
                    plaintext_len: s.plaintext.len() as u64,
                    plaintext_sha256: s.plaintext_sha256,
                    status: SegmentStatus::Encoded,
                    internal_subject: s.internal_subject,
                    usenet_subject: s.usenet_subject,
                    message_id: None,
                    packed_entries,
                })
                .await?;
            count += 1;
        }
        Ok(count)
    }

    async fn upload_folder(&self, folder_id: FolderId) -> anyhow::Result<ControlValue> {
        uploader::enqueue_pending_uploads(self.catalog, &folder_id).await?;
        let mut total_posted = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(UsyncError::Cancelled.into());
            }
            let posted = uploader::run_upload_batch(
                self.catalog,
                self.transport,
                "control-surface",
                16,
                self.config,
                &mut OsRng,
                &self.cancel,
            )
            .await?;
            total_posted += posted;
            if let ControlValue::Progress(snapshot) = self.progress(folder_id).await? {
                self.emit_progress(folder_id, snapshot);
            }
            if posted == 0 {
                break;
            }
        }

        if let Some(mut folder) = self.catalog.get_folder(&folder_id).await? {
            let segments = self.catalog.list_segments_by_folder(&folder_id).await?;
            if !segments.is_empty() && segments.iter().all(|s| s.status == SegmentStatus::Posted) {
                folder.state = FolderState::Uploaded;
                self.catalog.put_folder(&folder).await?;
            }
        }
        Ok(ControlValue::SegmentsPosted(total_posted))
    }

    async fn publish_folder(
        &self,
        folder_id: FolderId,
        access: ControlAccessType,
        expires_in: Option<Duration>,
    ) -> anyhow::Result<ControlValue> {
        let folder = self.require_folder(&folder_id).await?;
        let spec = match access {
            ControlAccessType::Public => AccessSpec::Public,
            ControlAccessType::Private { authorized } => AccessSpec::Private { authorized },
            ControlAccessType::Protected { password } => AccessSpec::Protected { password },
        };
        let share = publisher::publish_folder(
            self.catalog,
            self.transport,
            &folder,
            spec,
            expires_in,
            self.config,
            &mut OsRng,
        )
        .await?;

        let mut folder = folder;
        folder.state = FolderState::Published;
        self.catalog.put_folder(&folder).await?;
        Ok(ControlValue::Share(share))
    }

    async fn revoke_share(&self, share_id: ShareId) -> anyhow::Result<ControlValue> {
        for folder in self.catalog.list_folders().await? {
            for mut share in self.catalog.list_shares_by_folder(&folder.folder_id).await? {
                if share.share_id == share_id {
                    share.revoked = true;
                    self.catalog.put_share(&share).await?;
                    return Ok(ControlValue::None);
                }
            }
        }
        Err(UsyncError::NotFound(format!("share {share_id} not found")).into())
    }

    async fn download_share(
        &self,
        share_id: ShareId,
        dest: String,
        auth: ControlAuth,
    ) -> anyhow::Result<ControlValue> {
        let identity = Identity::ensure_identity(self.identity_store, &self.config.identity_intent)?;
        let open_auth = match &auth {
            ControlAuth::Public => OpenAuth::Public,
            ControlAuth::Private => OpenAuth::Private { identity: &identity },
            ControlAuth::Protected { password } => OpenAuth::Protected { password },
        };
        let resolved = resolver::open(self.catalog, self.transport, &share_id, open_auth).await?;

        let folder_id = downloader::ensure_local_mirror(
            self.catalog,
            &share_id,
            &resolved.index,
            &resolved.k_share,
            &dest,
        )
        .await?;

        downloader::enqueue_pending_downloads(self.catalog, &folder_id).await?;
        let mut total = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(UsyncError::Cancelled.into());
            }
            let completed = downloader::run_download_batch(
                self.catalog,
                self.transport,
                "control-surface",
                16,
                &folder_id,
                Path::new(&dest),
                self.config.max_attempts,
                &mut OsRng,
                &self.cancel,
            )
            .await?;
            total += completed;
            if let ControlValue::Progress(snapshot) = self.progress(folder_id).await? {
                self.emit_progress(folder_id, snapshot);
            }
            if completed == 0 {
                break;
            }
        }
        Ok(ControlValue::SegmentsDownloaded(total))
    }

    async fn progress(&self, folder_id: FolderId) -> anyhow::Result<ControlValue> {
        let segments = self.catalog.list_segments_by_folder(&folder_id).await?;
        let total_segments = segments.len() as u64;
        let posted_segments = segments.iter().filter(|s| s.status == SegmentStatus::Posted).count() as u64;
        Ok(ControlValue::Progress(ProgressSnapshot { total_segments, posted_segments }))
    }

    async fn stats(&self) -> anyhow::Result<ControlValue> {
        let folders = self.catalog.list_folders().await?;
        let mut stats = StatsSnapshot { folders: folders.len(), ..Default::default() };
        for folder in &folders {
            stats.shares += self.catalog.list_shares_by_folder(&folder.folder_id).await?.len();
            let items = self.catalog.list_work_items_by_folder(&folder.folder_id).await?;
            stats.pending_uploads += items.iter().filter(|w| w.operation == WorkOperation::UploadSegment).count();
            stats.pending_downloads +=
                items.iter().filter(|w| w.operation == WorkOperation::DownloadArticle).count();
        }
        Ok(ControlValue::Stats(stats))
    }

    async fn require_folder(&self, folder_id: &FolderId) -> anyhow::Result<Folder> {
        self.catalog
            .get_folder(folder_id)
            .await?
            .ok_or_else(|| UsyncError::NotFound(format!("folder {folder_id} not found")).into())
    }
}

/// Stable error-kind name for the `{ ok, value|error_kind, message }`
/// envelope, matching the variant names §7 uses for each error class.
fn error_kind_name(e: &UsyncError) -> &'static str {
    match e {
        UsyncError::InvalidInput(_) => "InvalidInput",
        UsyncError::NotFound(_) => "NotFound",
        UsyncError::AccessDenied => "AccessDenied",
        UsyncError::Expired => "Expired",
        UsyncError::IntegrityFailed(_) => "IntegrityFailed",
        UsyncError::ProviderTransient(_) => "ProviderTransient",
        UsyncError::ProviderFatal(_) => "ProviderFatal",
        UsyncError::StorageUnavailable(_) => "StorageUnavailable",
        UsyncError::Cancelled => "Cancelled",
        UsyncError::Internal(_) => "Internal",
        UsyncError::AlreadyInitialized => "AlreadyInitialized",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usync_catalog::MemoryCatalog;
    use usync_crypto::MemorySecretStore;
    use usync_nntp::ArticleTransport as _;

    struct NullTransport;

    #[async_trait::async_trait]
    impl ArticleTransport for NullTransport {
        async fn post(&self, _raw_article: &str, proposed_message_id: &str) -> anyhow::Result<String> {
            Ok(proposed_message_id.to_string())
        }
        async fn retrieve(&self, _message_id: &str) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("no articles in a null transport"))
        }
    }

    #[tokio::test]
    async fn register_folder_then_progress_reports_zero_segments() {
        let catalog = MemoryCatalog::new();
        let transport = NullTransport;
        let config = CoreConfig::default();
        let store = MemorySecretStore::default();
        let surface = ControlSurface::new(&catalog, &transport, &config, &store);

        let response = surface
            .handle(ControlRequest::RegisterFolder { path: "/tmp/demo".into(), name: "demo".into() })
            .await;
        assert!(response.ok);
        let folder_id = match response.value {
            Some(ControlValue::FolderId(id)) => id,
            _ => panic!("expected FolderId"),
        };

        let progress = surface.handle(ControlRequest::Progress { folder_id }).await;
        assert!(progress.ok);
        match progress.value {
            Some(ControlValue::Progress(snapshot)) => assert_eq!(snapshot.total_segments, 0),
            _ => panic!("expected Progress"),
        }
    }

    #[tokio::test]
    async fn revoke_share_on_unknown_id_is_not_found() {
        let catalog = MemoryCatalog::new();
        let transport = NullTransport;
        let config = CoreConfig::default();
        let store = MemorySecretStore::default();
        let surface = ControlSurface::new(&catalog, &transport, &config, &store);

        let share_id = usync_common::base32_token(&mut usync_common::new_csprng());
        let response = surface.handle(ControlRequest::RevokeShare { share_id }).await;
        assert!(!response.ok);
        assert_eq!(response.error_kind.as_deref(), Some("NotFound"));
    }
}
