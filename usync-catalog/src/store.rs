use crate::records::{Article, AuthorizedUser, File, Folder, Segment, Share, WorkItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use usync_common::{FileId, FolderId, Result, SegmentId, ShareId, WorkItemId};

/// A held advisory lock on a single folder. Released on drop; see
/// `Catalog::lock_folder`. Implementations hand out a guard rather than
/// exposing lock/unlock directly so a crashed or cancelled caller can
/// never leave a folder locked.
pub trait FolderLock: Send {}

/// Durable storage for every §3 record type plus the WorkItem queue.
///
/// Mutations that must be atomic with respect to concurrent callers (a
/// folder's state transition, a WorkItem claim) are expressed as single
/// trait methods rather than get/put pairs, so implementations can use
/// whatever native transaction primitive they have (a sled transaction,
/// a mutex-guarded map) without exposing it at this boundary.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn put_folder(&self, folder: &Folder) -> Result<()>;
    async fn get_folder(&self, id: &FolderId) -> Result<Option<Folder>>;
    async fn list_folders(&self) -> Result<Vec<Folder>>;

    async fn put_file(&self, file: &File) -> Result<()>;
    async fn get_file(&self, id: &FileId) -> Result<Option<File>>;
    async fn list_files_by_folder(&self, folder_id: &FolderId) -> Result<Vec<File>>;

    async fn put_segment(&self, segment: &Segment) -> Result<()>;
    async fn get_segment(&self, id: &SegmentId) -> Result<Option<Segment>>;
    async fn list_segments_by_file(&self, file_id: &FileId) -> Result<Vec<Segment>>;
    async fn list_segments_by_folder(&self, folder_id: &FolderId) -> Result<Vec<Segment>>;

    async fn put_article(&self, article: &Article) -> Result<()>;
    async fn get_article(&self, message_id: &str) -> Result<Option<Article>>;

    async fn put_share(&self, share: &Share) -> Result<()>;
    async fn get_share(&self, id: &ShareId) -> Result<Option<Share>>;
    async fn list_shares_by_folder(&self, folder_id: &FolderId) -> Result<Vec<Share>>;

    async fn add_authorized_user(&self, user: &AuthorizedUser) -> Result<()>;
    async fn remove_authorized_user(
        &self,
        folder_id: &FolderId,
        user_commitment: &usync_common::UserId,
    ) -> Result<()>;
    async fn list_authorized_users(&self, folder_id: &FolderId) -> Result<Vec<AuthorizedUser>>;

    /// Inserts a new WorkItem, unowned, ready at `next_attempt_at`.
    async fn enqueue_work_item(&self, item: &WorkItem) -> Result<()>;

    /// Atomically scans items with `owner = None` and `next_attempt_at <= now`,
    /// assigns `owner` to each, and returns up to `limit` of them. Items not
    /// returned remain unowned for the next caller.
    async fn claim_ready_work_items(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>>;

    /// Marks a claimed item permanently done; it is removed from the
    /// queue (its outcome lives on the Segment/Article record instead).
    async fn complete_work_item(&self, id: &WorkItemId) -> Result<()>;

    /// Records a failed attempt. If `attempts + 1 >= max_attempts` the
    /// item is retained unowned with no further `next_attempt_at` so it
    /// surfaces as terminally failed for operator inspection rather than
    /// being retried forever.
    async fn fail_work_item(
        &self,
        id: &WorkItemId,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
        max_attempts: u32,
    ) -> Result<()>;

    async fn get_work_item(&self, id: &WorkItemId) -> Result<Option<WorkItem>>;
    async fn list_work_items_by_folder(&self, folder_id: &FolderId) -> Result<Vec<WorkItem>>;

    /// Acquires the process-local advisory lock for `folder_id`, per §4's
    /// "single advisory lock per folder_id" rule guarding cross-component
    /// invariants such as folder state transitions.
    async fn lock_folder(&self, folder_id: &FolderId) -> Box<dyn FolderLock>;
}
