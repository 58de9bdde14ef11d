use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use usync_common::{FileId, FolderId, SegmentId, ShareId, UserId, WorkItemId};

/// §3 Folder lifecycle states. Transitions are monotonic except for the
/// terminal `Deleted`, which can be reached from any other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FolderState {
    Registered,
    Indexed,
    Segmented,
    Uploaded,
    Published,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub folder_id: FolderId,
    pub path: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub state: FolderState,
    /// Fixed at registration time; immutable afterward, including across
    /// re-publish (Open Question decision 1).
    pub segment_size: u64,
    /// 32-byte HKDF root, persisted so a crashed run can recompute segment
    /// keys without re-deriving from an identity secret.
    pub root_secret: [u8; 32],
    /// The folder's long-term Schnorr keypair seed (§3 FolderKey). The
    /// scalar is rebuilt from this seed on load; only the seed is stored.
    pub folder_key_seed: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub file_id: FileId,
    pub folder_id: FolderId,
    pub rel_path: String,
    pub size: u64,
    pub sha256: [u8; 32],
    pub modified_at: DateTime<Utc>,
    /// Set when this file's content duplicates an earlier file indexed in
    /// the same folder walk. A duplicate owns no Segment rows; its bytes
    /// are recovered on download by copying the original's reassembled
    /// file instead of being re-fetched from Usenet.
    pub duplicate_of: Option<FileId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Pending,
    Encoded,
    Posted,
    Failed,
}

/// One packed file's byte range within a packed Segment's payload,
/// mirroring `usync_segment::packing::PackedEntry` without pulling a
/// dependency on `usync-segment` into the Catalog crate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PackedFileRange {
    pub file_id: FileId,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: SegmentId,
    /// For a single-file segment, that file. For a packed segment, the
    /// first file in `packed_entries` (ownership for the segment proper
    /// is shared; query `packed_entries` for the full file set).
    pub file_id: FileId,
    pub folder_id: FolderId,
    /// Folder-wide ordinal, 0-based, contiguous across every File and
    /// packed batch in the Folder (assigned by the Segmenter's shared
    /// counter, not per-file).
    pub index: u64,
    pub plaintext_len: u64,
    pub plaintext_sha256: [u8; 32],
    pub status: SegmentStatus,
    /// Derivable from `(folder_id, file_hash, index)`; never posted (§3
    /// global invariant c).
    pub internal_subject: String,
    /// Random, posted as the article Subject header.
    pub usenet_subject: String,
    /// Set exactly when `status == Posted` (§3 invariant).
    pub message_id: Option<String>,
    /// `Some` iff this Segment was produced by small-file packing; lists
    /// every file packed into it and its byte range within the decoded
    /// payload (§4.3).
    pub packed_entries: Option<Vec<PackedFileRange>>,
}

impl Segment {
    pub fn check_invariant(&self) -> usync_common::Result<()> {
        if self.status == SegmentStatus::Posted && self.message_id.is_none() {
            anyhow::bail!("segment {} is posted but has no message_id", self.segment_id);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub message_id: String,
    pub newsgroup: String,
    pub subject: String,
    pub posted_at: DateTime<Utc>,
    pub size_on_wire: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareType {
    Public,
    Private,
    Protected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    pub share_id: ShareId,
    pub folder_id: FolderId,
    pub share_type: ShareType,
    /// Message-IDs of this share's CoreIndex articles, in part order
    /// (§4.6: "a large CoreIndex is split into ordered segments with an
    /// explicit total count"). A single-article CoreIndex has length 1.
    pub core_index_message_ids: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedUser {
    pub folder_id: FolderId,
    pub user_id_commitment: UserId,
    pub added_at: DateTime<Utc>,
    pub added_by: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkOperation {
    UploadSegment,
    DownloadArticle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub operation: WorkOperation,
    pub folder_id: FolderId,
    /// Target segment for uploads, or the segment a downloaded article
    /// fills in for downloads.
    pub segment_id: SegmentId,
    /// Set once an upload succeeds or a download target is known to exist
    /// on the server (resolved from the CoreIndex segment locator table).
    pub article_message_id: Option<String>,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Worker id currently holding this item, if any. At most one owner
    /// at a time (§3 WorkItem invariant).
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }
}
