//! Durable queue consumer turning `encoded` Segments into `posted`
//! articles (§4.7). Grounded on spec.md §9's restartable-queue-consumer
//! redesign flag; driven entirely by `usync-catalog`'s WorkItem queue so
//! a crash mid-run resumes from exactly the WorkItems left unclaimed.

use crate::config::CoreConfig;
use anyhow::Context;
use chrono::Utc;
use rand_core::{CryptoRng, RngCore};
use tokio_util::sync::CancellationToken;
use usync_catalog::{Catalog, Segment, SegmentStatus, WorkItem, WorkOperation};
use usync_common::{FolderId, UsyncError};
use usync_nntp::{ArticleHeaders, ArticleTransport, BackoffPolicy};

/// Enqueues one WorkItem per `encoded` Segment in `folder_id` that does
/// not already have a pending or completed upload WorkItem. Idempotent:
/// re-running after every segment already has a WorkItem is a no-op
/// (§8 property 6).
pub async fn enqueue_pending_uploads(catalog: &dyn Catalog, folder_id: &FolderId) -> anyhow::Result<usize> {
    let segments = catalog.list_segments_by_folder(folder_id).await?;
    let existing = catalog.list_work_items_by_folder(folder_id).await?;
    let already_queued: std::collections::HashSet<_> = existing
        .iter()
        .filter(|w| w.operation == WorkOperation::UploadSegment)
        .map(|w| w.segment_id)
        .collect();

    let mut enqueued = 0;
    for segment in segments {
        if segment.status != SegmentStatus::Encoded {
            continue;
        }
        if already_queued.contains(&segment.segment_id) {
            continue;
        }
        catalog
            .enqueue_work_item(&WorkItem {
                id: usync_common::WorkItemId::new(),
                operation: WorkOperation::UploadSegment,
                folder_id: *folder_id,
                segment_id: segment.segment_id,
                article_message_id: None,
                attempts: 0,
                next_attempt_at: Utc::now(),
                last_error: None,
                owner: None,
                created_at: Utc::now(),
            })
            .await?;
        enqueued += 1;
    }
    Ok(enqueued)
}

/// Claims up to `limit` ready upload WorkItems as `owner` and posts each
/// Segment's already-encrypted, already-yEnc-framed bytes. On success the
/// Segment transitions to `Posted` with the server-acknowledged
/// `message_id` and the WorkItem is completed; on failure it is retried
/// up to `config.max_attempts`, after which the Segment goes `Failed`
/// and the WorkItem is retained unowned for operator inspection (§4.7).
/// `cancel` is checked before claiming each WorkItem, so a triggered
/// token stops the batch between items rather than mid-upload.
pub async fn run_upload_batch(
    catalog: &dyn Catalog,
    transport: &dyn ArticleTransport,
    owner: &str,
    limit: usize,
    config: &CoreConfig,
    rng: &mut (impl RngCore + CryptoRng),
    cancel: &CancellationToken,
) -> anyhow::Result<usize> {
    let backoff = BackoffPolicy::default();
    let claimed = catalog.claim_ready_work_items(owner, Utc::now(), limit).await?;
    let mut posted = 0;

    for item in claimed {
        if cancel.is_cancelled() {
            return Err(UsyncError::Cancelled.into());
        }
        match upload_one(catalog, transport, &item, config, rng).await {
            Ok(()) => {
                catalog.complete_work_item(&item.id).await?;
                posted += 1;
            }
            Err(e) => {
                let retryable = usync_nntp::is_retryable(&e) && item.attempts + 1 < config.max_attempts;
                let next_attempt_at = retryable.then(|| {
                    let jitter_sample = (rng.next_u32() as f64 / u32::MAX as f64) * 2.0 - 1.0;
                    Utc::now() + backoff.delay_for(item.attempts, jitter_sample)
                });
                catalog
                    .fail_work_item(&item.id, &e.to_string(), next_attempt_at, config.max_attempts)
                    .await?;
                if next_attempt_at.is_none() {
                    mark_segment_failed(catalog, &item.segment_id).await?;
                }
            }
        }
    }
    Ok(posted)
}

async fn upload_one(
    catalog: &dyn Catalog,
    transport: &dyn ArticleTransport,
    item: &WorkItem,
    config: &CoreConfig,
    rng: &mut (impl RngCore + CryptoRng),
) -> anyhow::Result<()> {
    let mut segment = catalog
        .get_segment(&item.segment_id)
        .await?
        .ok_or_else(|| UsyncError::NotFound(format!("segment {} vanished from catalog", item.segment_id)))?;

    if segment.status == SegmentStatus::Posted {
        return Ok(());
    }

    let wire_framed = load_wire_framed(catalog, &segment).await?;
    let message_id = usync_nntp::generate_message_id(rng, &config.message_id_domain);
    let headers = ArticleHeaders {
        message_id: message_id.clone(),
        subject: segment.usenet_subject.clone(),
        from_display_name: config.from_display_name.clone(),
        from_address: config.from_address.clone(),
        newsgroup: config.newsgroup.clone(),
        date: Utc::now(),
    };
    let raw = usync_nntp::format_article(&headers, 1, 1, &wire_framed);
    let acked = transport.post(&raw, &message_id).await?;

    segment.status = SegmentStatus::Posted;
    segment.message_id = Some(acked.clone());
    segment.check_invariant()?;
    catalog.put_segment(&segment).await?;
    catalog
        .put_article(&usync_catalog::Article {
            message_id: acked,
            newsgroup: config.newsgroup.clone(),
            subject: segment.usenet_subject.clone(),
            posted_at: Utc::now(),
            size_on_wire: raw.len() as u64,
        })
        .await?;
    Ok(())
}

/// The wire-framed (header + AEAD ciphertext) bytes for a Segment are
/// produced by `segment_folder` and handed to the Uploader for posting.
/// The Catalog does not persist the bulky framed bytes a second time;
/// they are recomputed here from the plaintext staged on disk under
/// `download_root/.staging/<segment_id>` by `segment_folder`, the same
/// write-then-post handoff the teacher uses between encode and upload.
async fn load_wire_framed(catalog: &dyn Catalog, segment: &Segment) -> anyhow::Result<Vec<u8>> {
    let folder = catalog
        .get_folder(&segment.folder_id)
        .await?
        .ok_or_else(|| UsyncError::NotFound(format!("folder {} vanished from catalog", segment.folder_id)))?;
    let staged_path = staging_path(&folder.path, &segment.segment_id);
    let plaintext = tokio::fs::read(&staged_path)
        .await
        .with_context(|| format!("reading staged segment plaintext at {}", staged_path.display()))?;

    let file = catalog
        .get_file(&segment.file_id)
        .await?
        .ok_or_else(|| UsyncError::NotFound(format!("file {} vanished from catalog", segment.file_id)))?;
    let key = usync_crypto::derive_segment_key(&folder.root_secret, &folder.folder_id.to_string(), &file.sha256, segment.index);
    usync_crypto::encrypt_segment(&key, &plaintext)
}

async fn mark_segment_failed(catalog: &dyn Catalog, segment_id: &usync_common::SegmentId) -> anyhow::Result<()> {
    if let Some(mut segment) = catalog.get_segment(segment_id).await? {
        segment.status = SegmentStatus::Failed;
        catalog.put_segment(&segment).await?;
    }
    Ok(())
}

/// Staging directory layout shared with `segment_folder`: one file per
/// Segment, named by id, holding exactly the plaintext bytes that
/// `build_segment` assembled (single-file range or packed frame).
pub fn staging_path(folder_path: &str, segment_id: &usync_common::SegmentId) -> std::path::PathBuf {
    std::path::Path::new(folder_path)
        .join(".usync-staging")
        .join(segment_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use usync_catalog::{File, Folder, FolderState, MemoryCatalog, PackedFileRange};
    use usync_common::{FileId, SegmentId};

    #[tokio::test]
    async fn enqueue_is_idempotent_across_two_calls() {
        let catalog = MemoryCatalog::new();
        let folder_id = FolderId::new();
        let file_id = FileId::new();
        catalog
            .put_folder(&Folder {
                folder_id,
                path: "/tmp/x".into(),
                display_name: "x".into(),
                created_at: Utc::now(),
                state: FolderState::Segmented,
                segment_size: 768_000,
                root_secret: [0u8; 32],
                folder_key_seed: [0u8; 32],
            })
            .await
            .unwrap();
        catalog
            .put_file(&File {
                file_id,
                folder_id,
                rel_path: "a.txt".into(),
                size: 5,
                sha256: [1u8; 32],
                modified_at: Utc::now(),
                duplicate_of: None,
            })
            .await
            .unwrap();
        catalog
            .put_segment(&Segment {
                segment_id: SegmentId::new(),
                file_id,
                folder_id,
                index: 0,
                plaintext_len: 5,
                plaintext_sha256: [1u8; 32],
                status: SegmentStatus::Encoded,
                internal_subject: "a".repeat(64),
                usenet_subject: "b".repeat(20),
                message_id: None,
                packed_entries: None::<Vec<PackedFileRange>>,
            })
            .await
            .unwrap();

        let first = enqueue_pending_uploads(&catalog, &folder_id).await.unwrap();
        let second = enqueue_pending_uploads(&catalog, &folder_id).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }
}
