use crate::records::{Article, AuthorizedUser, File, Folder, Segment, Share, WorkItem};
use crate::store::{Catalog, FolderLock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use usync_common::{FileId, FolderId, Result, SegmentId, ShareId, UserId, WorkItemId};

/// In-memory `Catalog`, grounded on the teacher's `MemoryBlockStore`: a
/// single mutex-guarded map per record type, adequate for tests and for
/// a first local run before a durable backend is wired up.
#[derive(Default)]
pub struct MemoryCatalog {
    folders: Mutex<HashMap<FolderId, Folder>>,
    files: Mutex<HashMap<FileId, File>>,
    segments: Mutex<HashMap<SegmentId, Segment>>,
    articles: Mutex<HashMap<String, Article>>,
    shares: Mutex<HashMap<ShareId, Share>>,
    authorized_users: Mutex<Vec<AuthorizedUser>>,
    work_items: Mutex<HashMap<WorkItemId, WorkItem>>,
    folder_locks: Mutex<HashMap<FolderId, Arc<Mutex<()>>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn folder_lock_handle(&self, folder_id: &FolderId) -> Arc<Mutex<()>> {
        self.folder_locks
            .lock()
            .entry(folder_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

struct MemoryFolderLock {
    handle: Arc<Mutex<()>>,
}

impl FolderLock for MemoryFolderLock {}

impl Drop for MemoryFolderLock {
    fn drop(&mut self) {
        // SAFETY: `lock_folder` locked this same handle and forgot the
        // guard so it could be returned across an await boundary; this
        // is the matching release, and nothing else holds the guard.
        unsafe { self.handle.force_unlock() };
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn put_folder(&self, folder: &Folder) -> Result<()> {
        self.folders
            .lock()
            .insert(folder.folder_id.clone(), folder.clone());
        Ok(())
    }

    async fn get_folder(&self, id: &FolderId) -> Result<Option<Folder>> {
        Ok(self.folders.lock().get(id).cloned())
    }

    async fn list_folders(&self) -> Result<Vec<Folder>> {
        Ok(self.folders.lock().values().cloned().collect())
    }

    async fn put_file(&self, file: &File) -> Result<()> {
        self.files.lock().insert(file.file_id.clone(), file.clone());
        Ok(())
    }

    async fn get_file(&self, id: &FileId) -> Result<Option<File>> {
        Ok(self.files.lock().get(id).cloned())
    }

    async fn list_files_by_folder(&self, folder_id: &FolderId) -> Result<Vec<File>> {
        Ok(self
            .files
            .lock()
            .values()
            .filter(|f| &f.folder_id == folder_id)
            .cloned()
            .collect())
    }

    async fn put_segment(&self, segment: &Segment) -> Result<()> {
        segment.check_invariant()?;
        self.segments
            .lock()
            .insert(segment.segment_id.clone(), segment.clone());
        Ok(())
    }

    async fn get_segment(&self, id: &SegmentId) -> Result<Option<Segment>> {
        Ok(self.segments.lock().get(id).cloned())
    }

    async fn list_segments_by_file(&self, file_id: &FileId) -> Result<Vec<Segment>> {
        let mut out: Vec<Segment> = self
            .segments
            .lock()
            .values()
            .filter(|s| &s.file_id == file_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.index);
        Ok(out)
    }

    async fn list_segments_by_folder(&self, folder_id: &FolderId) -> Result<Vec<Segment>> {
        Ok(self
            .segments
            .lock()
            .values()
            .filter(|s| &s.folder_id == folder_id)
            .cloned()
            .collect())
    }

    async fn put_article(&self, article: &Article) -> Result<()> {
        self.articles
            .lock()
            .insert(article.message_id.clone(), article.clone());
        Ok(())
    }

    async fn get_article(&self, message_id: &str) -> Result<Option<Article>> {
        Ok(self.articles.lock().get(message_id).cloned())
    }

    async fn put_share(&self, share: &Share) -> Result<()> {
        self.shares
            .lock()
            .insert(share.share_id.clone(), share.clone());
        Ok(())
    }

    async fn get_share(&self, id: &ShareId) -> Result<Option<Share>> {
        Ok(self.shares.lock().get(id).cloned())
    }

    async fn list_shares_by_folder(&self, folder_id: &FolderId) -> Result<Vec<Share>> {
        Ok(self
            .shares
            .lock()
            .values()
            .filter(|s| &s.folder_id == folder_id)
            .cloned()
            .collect())
    }

    async fn add_authorized_user(&self, user: &AuthorizedUser) -> Result<()> {
        let mut users = self.authorized_users.lock();
        if !users
            .iter()
            .any(|u| u.folder_id == user.folder_id && u.user_id_commitment == user.user_id_commitment)
        {
            users.push(user.clone());
        }
        Ok(())
    }

    async fn remove_authorized_user(&self, folder_id: &FolderId, user_commitment: &UserId) -> Result<()> {
        self.authorized_users
            .lock()
            .retain(|u| !(&u.folder_id == folder_id && &u.user_id_commitment == user_commitment));
        Ok(())
    }

    async fn list_authorized_users(&self, folder_id: &FolderId) -> Result<Vec<AuthorizedUser>> {
        Ok(self
            .authorized_users
            .lock()
            .iter()
            .filter(|u| &u.folder_id == folder_id)
            .cloned()
            .collect())
    }

    async fn enqueue_work_item(&self, item: &WorkItem) -> Result<()> {
        self.work_items.lock().insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn claim_ready_work_items(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>> {
        let mut items = self.work_items.lock();
        let mut claimed = Vec::new();
        let mut ids: Vec<WorkItemId> = items
            .values()
            .filter(|i| i.owner.is_none() && i.next_attempt_at <= now)
            .map(|i| i.id.clone())
            .collect();
        ids.sort_by_key(|id| {
            items
                .get(id)
                .map(|i| i.next_attempt_at)
                .unwrap_or(now)
        });
        for id in ids.into_iter().take(limit) {
            if let Some(item) = items.get_mut(&id) {
                item.owner = Some(owner.to_string());
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_work_item(&self, id: &WorkItemId) -> Result<()> {
        self.work_items.lock().remove(id);
        Ok(())
    }

    async fn fail_work_item(
        &self,
        id: &WorkItemId,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
        max_attempts: u32,
    ) -> Result<()> {
        let mut items = self.work_items.lock();
        if let Some(item) = items.get_mut(id) {
            item.attempts += 1;
            item.last_error = Some(error.to_string());
            item.owner = None;
            if item.attempts >= max_attempts {
                log::warn!(
                    "work item {} exhausted retries after {} attempts: {error}",
                    item.id,
                    item.attempts
                );
            } else if let Some(next) = next_attempt_at {
                item.next_attempt_at = next;
            }
        }
        Ok(())
    }

    async fn get_work_item(&self, id: &WorkItemId) -> Result<Option<WorkItem>> {
        Ok(self.work_items.lock().get(id).cloned())
    }

    async fn list_work_items_by_folder(&self, folder_id: &FolderId) -> Result<Vec<WorkItem>> {
        Ok(self
            .work_items
            .lock()
            .values()
            .filter(|i| &i.folder_id == folder_id)
            .cloned()
            .collect())
    }

    async fn lock_folder(&self, folder_id: &FolderId) -> Box<dyn FolderLock> {
        let handle = self.folder_lock_handle(folder_id);
        std::mem::forget(handle.lock());
        Box::new(MemoryFolderLock { handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usync_common::FolderId;

    fn sample_folder() -> Folder {
        Folder {
            folder_id: FolderId::new(),
            path: "/tmp/example".into(),
            display_name: "example".into(),
            created_at: Utc::now(),
            state: crate::records::FolderState::Registered,
            segment_size: 768_000,
            root_secret: [0u8; 32],
            folder_key_seed: [1u8; 32],
        }
    }

    #[tokio::test]
    async fn put_then_get_folder_round_trips() {
        let catalog = MemoryCatalog::new();
        let folder = sample_folder();
        catalog.put_folder(&folder).await.unwrap();
        let fetched = catalog.get_folder(&folder.folder_id).await.unwrap().unwrap();
        assert_eq!(fetched.folder_id, folder.folder_id);
    }

    #[tokio::test]
    async fn work_item_claim_grants_single_owner() {
        let catalog = MemoryCatalog::new();
        let folder = sample_folder();
        let item = WorkItem {
            id: WorkItemId::new(),
            operation: crate::records::WorkOperation::UploadSegment,
            folder_id: folder.folder_id.clone(),
            segment_id: usync_common::SegmentId::new(),
            article_message_id: None,
            attempts: 0,
            next_attempt_at: Utc::now(),
            last_error: None,
            owner: None,
            created_at: Utc::now(),
        };
        catalog.enqueue_work_item(&item).await.unwrap();

        let claimed_a = catalog
            .claim_ready_work_items("worker-a", Utc::now(), 10)
            .await
            .unwrap();
        assert_eq!(claimed_a.len(), 1);

        let claimed_b = catalog
            .claim_ready_work_items("worker-b", Utc::now(), 10)
            .await
            .unwrap();
        assert!(claimed_b.is_empty(), "already-owned item must not be claimed twice");
    }

    #[tokio::test]
    async fn fail_work_item_reschedules_until_max_attempts() {
        let catalog = MemoryCatalog::new();
        let item = WorkItem {
            id: WorkItemId::new(),
            operation: crate::records::WorkOperation::UploadSegment,
            folder_id: FolderId::new(),
            segment_id: usync_common::SegmentId::new(),
            article_message_id: None,
            attempts: 0,
            next_attempt_at: Utc::now(),
            last_error: None,
            owner: Some("worker-a".into()),
            created_at: Utc::now(),
        };
        catalog.enqueue_work_item(&item).await.unwrap();
        catalog
            .fail_work_item(&item.id, "transient failure", Some(Utc::now()), 5)
            .await
            .unwrap();
        let reloaded = catalog.get_work_item(&item.id).await.unwrap().unwrap();
        assert_eq!(reloaded.attempts, 1);
        assert!(reloaded.owner.is_none());
    }
}
