use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID, e.g. one loaded back from the Catalog.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(FolderId, "Identifies a registered Folder.");
uuid_id!(FileId, "Identifies a File within a Folder.");
uuid_id!(SegmentId, "Identifies a Segment within a File.");
uuid_id!(WorkItemId, "Identifies a durable queue WorkItem.");

/// The hex-encoded public commitment `P = H(S)` of an Identity, used to
/// authorize access to PRIVATE shares. Opaque: the core never attempts to
/// decode or interpret it beyond shape validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Wraps a 64-character lowercase hex string. Rejects anything else,
    /// since a malformed `user_id` should never silently propagate into
    /// an AuthorizedUser record.
    pub fn parse(raw: impl Into<String>) -> anyhow::Result<Self> {
        let raw = raw.into();
        anyhow::ensure!(
            raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit()),
            "user_id must be 64 hex characters, got {:?}",
            raw
        );
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The opaque, randomly generated Share identifier: 24 Base32 characters,
/// carrying no embedded metadata per §4.6.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShareId(String);

impl ShareId {
    pub fn parse(raw: impl Into<String>) -> anyhow::Result<Self> {
        let raw = raw.into();
        anyhow::ensure!(
            raw.len() == 24 && raw.chars().all(|c| c.is_ascii_alphanumeric()),
            "share_id must be 24 alphanumeric characters, got {:?}",
            raw
        );
        Ok(Self(raw))
    }

    /// Only `usync-core::publisher` is meant to mint fresh ids; this
    /// constructor is intentionally crate-visible only through `parse`
    /// elsewhere, but `from_generated` is exposed for the token generator.
    pub(crate) fn from_generated(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
