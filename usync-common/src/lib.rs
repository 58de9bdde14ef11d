//! Shared primitives used by every other crate in the UsenetSync core:
//! opaque ids, the error kind enum, content hashing, and CSPRNG-backed
//! random token generation for subjects, message-ids and share ids.

mod error;
mod hash;
mod ids;
mod tokens;

pub use error::UsyncError;
pub use hash::{sha256_digest, Sha256Digest};
pub use ids::{FileId, FolderId, SegmentId, ShareId, UserId, WorkItemId};
pub use tokens::{base32_token, lowercase_alnum_token, new_csprng};

/// Result alias used by internal, composing functions throughout the
/// workspace, mirroring the teacher's own `anyhow::Result<T>` alias.
pub type Result<T> = anyhow::Result<T>;
