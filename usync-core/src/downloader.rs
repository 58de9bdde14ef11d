//! Given a resolved CoreIndex, reconstructs the original folder on disk
//! (§4.7). Grounded on the same restartable-queue-consumer redesign flag
//! as `uploader.rs`; reuses `usync-catalog`'s WorkItem queue by mirroring
//! the CoreIndex's file/segment tables into local Catalog rows keyed by
//! a folder id derived from the share, so a download is resumable the
//! same way an upload is.

use crate::coreindex::CoreIndex;
use anyhow::Context;
use chrono::Utc;
use rand_core::RngCore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use usync_catalog::{Catalog, File, Folder, FolderState, PackedFileRange, Segment, SegmentStatus, WorkItem, WorkOperation};
use usync_common::{FileId, FolderId, SegmentId, ShareId, UsyncError};
use usync_nntp::ArticleTransport;

/// Derives a stable local `FolderId` for a downloaded share: `download_share`
/// run twice against the same `share_id` finds the same mirror rows
/// instead of creating duplicates, which is what makes a killed-and-
/// restarted download resume rather than re-fetch from scratch (§8
/// property 7).
fn mirror_folder_id(share_id: &ShareId) -> FolderId {
    let mut hasher = Sha256::new();
    hasher.update(b"usync-download-mirror");
    hasher.update(share_id.as_str().as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[0..16]);
    FolderId::from_uuid(uuid::Uuid::from_bytes(bytes))
}

/// Creates or updates the local mirror Folder/File/Segment rows for a
/// resolved share. Existing `Posted` (i.e. already downloaded and
/// validated) Segment rows are left untouched so a resumed run does not
/// re-fetch what it already has.
pub async fn ensure_local_mirror(
    catalog: &dyn Catalog,
    share_id: &ShareId,
    index: &CoreIndex,
    k_share: &[u8; 32],
    dest: &str,
) -> anyhow::Result<FolderId> {
    let folder_id = mirror_folder_id(share_id);
    let _lock = catalog.lock_folder(&folder_id).await;

    if catalog.get_folder(&folder_id).await?.is_none() {
        catalog
            .put_folder(&Folder {
                folder_id,
                path: dest.to_string(),
                display_name: share_id.as_str().to_string(),
                created_at: Utc::now(),
                state: FolderState::Registered,
                segment_size: index.segment_size as u64,
                root_secret: *k_share,
                folder_key_seed: [0u8; 32],
            })
            .await?;
    }

    for f in &index.files {
        if catalog.get_file(&f.file_id).await?.is_none() {
            catalog
                .put_file(&File {
                    file_id: f.file_id,
                    folder_id,
                    rel_path: f.rel_path.clone(),
                    size: f.size,
                    sha256: f.sha256,
                    modified_at: Utc::now(),
                    duplicate_of: f.duplicate_of,
                })
                .await?;
        }
    }

    let owning_file = |segment_id: SegmentId| -> Option<FileId> {
        index
            .files
            .iter()
            .find(|f| {
                let range = f.segment_range_start..(f.segment_range_start + f.segment_range_count);
                index.segments.get(range.start as usize..range.end as usize).is_some_and(|slice| {
                    slice.iter().any(|s| s.segment_id == segment_id)
                })
            })
            .map(|f| f.file_id)
    };

    for s in &index.segments {
        if catalog.get_segment(&s.segment_id).await?.is_some() {
            continue;
        }
        let packed_entries = index
            .packing
            .iter()
            .find(|p| p.segment_id == s.segment_id)
            .map(|p| {
                p.entries
                    .iter()
                    .map(|e| PackedFileRange {
                        file_id: e.file_id,
                        offset: e.offset,
                        length: e.length,
                    })
                    .collect::<Vec<_>>()
            });
        let file_id = packed_entries
            .as_ref()
            .and_then(|entries| entries.first())
            .map(|e| e.file_id)
            .or_else(|| owning_file(s.segment_id))
            .context("segment in CoreIndex owned by no file")?;

        catalog
            .put_segment(&Segment {
                segment_id: s.segment_id,
                file_id,
                folder_id,
                index: s.key_id,
                plaintext_len: s.plaintext_len,
                plaintext_sha256: s.plaintext_sha256,
                status: SegmentStatus::Pending,
                internal_subject: String::new(),
                usenet_subject: String::new(),
                message_id: Some(s.message_id.clone()),
                packed_entries,
            })
            .await?;
    }

    Ok(folder_id)
}

/// Enqueues one download WorkItem per Segment not yet `Posted`
/// (downloaded+validated). Idempotent like `uploader::enqueue_pending_uploads`.
pub async fn enqueue_pending_downloads(catalog: &dyn Catalog, folder_id: &FolderId) -> anyhow::Result<usize> {
    let segments = catalog.list_segments_by_folder(folder_id).await?;
    let existing = catalog.list_work_items_by_folder(folder_id).await?;
    let already_queued: std::collections::HashSet<_> = existing
        .iter()
        .filter(|w| w.operation == WorkOperation::DownloadArticle)
        .map(|w| w.segment_id)
        .collect();

    let mut enqueued = 0;
    for segment in segments {
        if segment.status == SegmentStatus::Posted || already_queued.contains(&segment.segment_id) {
            continue;
        }
        catalog
            .enqueue_work_item(&WorkItem {
                id: usync_common::WorkItemId::new(),
                operation: WorkOperation::DownloadArticle,
                folder_id: *folder_id,
                segment_id: segment.segment_id,
                article_message_id: segment.message_id.clone(),
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

/// Claims ready download WorkItems, retrieves and validates each
/// Segment's article, and reassembles any File whose Segments are all
/// now present. Three integrity layers are checked in order (§4.4):
/// the wire header's transport CRC, the AEAD tag, and finally
/// `sha256(plaintext) == segment.plaintext_sha256`. `cancel` is checked
/// before claiming each WorkItem; a triggered token still runs the
/// reassembly pass over whatever already completed before returning
/// `Cancelled`.
pub async fn run_download_batch(
    catalog: &dyn Catalog,
    transport: &dyn ArticleTransport,
    owner: &str,
    limit: usize,
    folder_id: &FolderId,
    dest: &Path,
    max_attempts: u32,
    rng: &mut impl RngCore,
    cancel: &CancellationToken,
) -> anyhow::Result<usize> {
    let backoff = usync_nntp::BackoffPolicy::default();
    let claimed = catalog.claim_ready_work_items(owner, Utc::now(), limit).await?;
    let mut completed = 0;

    for item in claimed {
        if cancel.is_cancelled() {
            reassemble_ready_files(catalog, folder_id, dest).await?;
            return Err(UsyncError::Cancelled.into());
        }
        match download_one(catalog, transport, &item).await {
            Ok(()) => {
                catalog.complete_work_item(&item.id).await?;
                completed += 1;
            }
            Err(e) => {
                let retryable = usync_nntp::is_retryable(&e) && item.attempts + 1 < max_attempts;
                let next_attempt_at = retryable.then(|| {
                    let jitter_sample = (rng.next_u32() as f64 / u32::MAX as f64) * 2.0 - 1.0;
                    Utc::now() + backoff.delay_for(item.attempts, jitter_sample)
                });
                catalog
                    .fail_work_item(&item.id, &e.to_string(), next_attempt_at, max_attempts)
                    .await?;
            }
        }
    }

    reassemble_ready_files(catalog, folder_id, dest).await?;
    Ok(completed)
}

async fn download_one(
    catalog: &dyn Catalog,
    transport: &dyn ArticleTransport,
    item: &WorkItem,
) -> anyhow::Result<()> {
    let mut segment = catalog
        .get_segment(&item.segment_id)
        .await?
        .ok_or_else(|| UsyncError::NotFound(format!("segment {} vanished from catalog", item.segment_id)))?;
    if segment.status == SegmentStatus::Posted {
        return Ok(());
    }

    let message_id = segment
        .message_id
        .clone()
        .context("download WorkItem for a segment with no known message_id")?;
    let raw = transport.retrieve(&message_id).await?;
    let (_, _part, wire_framed) =
        usync_nntp::parse_article(&raw).map_err(|e| UsyncError::IntegrityFailed(e.to_string()))?;

    let folder = catalog
        .get_folder(&segment.folder_id)
        .await?
        .ok_or_else(|| UsyncError::NotFound(format!("folder {} vanished from catalog", segment.folder_id)))?;
    let file = catalog
        .get_file(&segment.file_id)
        .await?
        .ok_or_else(|| UsyncError::NotFound(format!("file {} vanished from catalog", segment.file_id)))?;
    let key = usync_crypto::derive_segment_key(&folder.root_secret, &folder.folder_id.to_string(), &file.sha256, segment.index);
    let plaintext = usync_crypto::decrypt_segment(&key, &wire_framed)
        .map_err(|e| UsyncError::IntegrityFailed(e.to_string()))?;

    let actual_sha256: [u8; 32] = Sha256::digest(&plaintext).into();
    if actual_sha256 != segment.plaintext_sha256 {
        return Err(UsyncError::IntegrityFailed(format!(
            "segment {} plaintext hash mismatch after decryption",
            segment.segment_id
        ))
        .into());
    }

    let staging = staging_path(&folder.path, &segment.segment_id);
    if let Some(parent) = staging.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&staging, &plaintext).await?;

    segment.status = SegmentStatus::Posted;
    catalog.put_segment(&segment).await?;
    Ok(())
}

/// Staging directory for downloaded, validated segment plaintexts,
/// mirroring `uploader::staging_path`'s layout on the download side.
fn staging_path(folder_path: &str, segment_id: &SegmentId) -> PathBuf {
    Path::new(folder_path).join(".usync-download-staging").join(segment_id.to_string())
}

async fn reassemble_ready_files(catalog: &dyn Catalog, folder_id: &FolderId, dest: &Path) -> anyhow::Result<()> {
    let folder = catalog
        .get_folder(folder_id)
        .await?
        .ok_or_else(|| UsyncError::NotFound(format!("folder {folder_id} vanished from catalog")))?;
    let files = catalog.list_files_by_folder(folder_id).await?;
    let segments = catalog.list_segments_by_folder(folder_id).await?;

    for file in &files {
        let final_path = dest.join(&file.rel_path);
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            continue;
        }

        if let Some(orig_id) = file.duplicate_of {
            let Some(orig) = files.iter().find(|f| f.file_id == orig_id) else {
                continue;
            };
            let orig_path = dest.join(&orig.rel_path);
            let Ok(bytes) = tokio::fs::read(&orig_path).await else {
                continue;
            };
            write_atomically(&final_path, &bytes).await?;
            continue;
        }

        let owning: Vec<&Segment> = segments
            .iter()
            .filter(|s| {
                s.file_id == file.file_id
                    || s.packed_entries
                        .as_ref()
                        .is_some_and(|entries| entries.iter().any(|e| e.file_id == file.file_id))
            })
            .collect();
        if owning.is_empty() || owning.iter().any(|s| s.status != SegmentStatus::Posted) {
            continue;
        }

        let bytes = if let Some(seg) = owning.iter().find(|s| s.packed_entries.is_some()) {
            let staged = staging_path(&folder.path, &seg.segment_id);
            let payload = tokio::fs::read(&staged).await?;
            let unpacked = usync_segment::unpack(&payload)?;
            unpacked
                .into_iter()
                .find(|(entry, _)| entry.file_id == file.file_id)
                .map(|(_, bytes)| bytes)
                .with_context(|| format!("packed segment missing file {}", file.file_id))?
        } else {
            let mut ordered = owning;
            ordered.sort_by_key(|s| s.index);
            let mut out = Vec::with_capacity(file.size as usize);
            for seg in ordered {
                let staged = staging_path(&folder.path, &seg.segment_id);
                out.extend_from_slice(&tokio::fs::read(&staged).await?);
            }
            out
        };

        write_atomically(&final_path, &bytes).await?;
    }
    Ok(())
}

/// Write-ahead pattern per §4.7: write to a temp file in the destination
/// directory, then atomically rename over the final path so a crash
/// mid-write never leaves a partially-written file at `final_path`.
async fn write_atomically(final_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = final_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = final_path.with_extension("usync-tmp");
    tokio::fs::write(&temp_path, bytes).await?;
    tokio::fs::rename(&temp_path, final_path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_folder_id_is_deterministic_for_same_share() {
        let share_id = usync_common::base32_token(&mut usync_common::new_csprng());
        let a = mirror_folder_id(&share_id);
        let b = mirror_folder_id(&share_id);
        assert_eq!(a, b);
    }
}
