//! Builds and posts the CoreIndex for a folder (§4.6). Grounded on
//! `wnfs/src/private/forest.rs`'s `PrivateForest::put` — encrypt-then-
//! store a node and hand back a pointer the matching `get` can resolve —
//! generalized here from one HAMT node to the whole CoreIndex plus its
//! file/segment/packing tables.

use crate::config::CoreConfig;
use crate::coreindex::{
    AccessBlock, CoreIndex, FileTableEntry, PackingTableEntry, SegmentTableEntry,
};
use anyhow::{ensure, Context};
use chrono::{Duration, Utc};
use rand_core::{CryptoRng, RngCore};
use std::collections::HashMap;
use usync_catalog::{Catalog, Folder, SegmentStatus, Share, ShareType};
use usync_common::{base32_token, SegmentId};
use usync_crypto::{
    derive_password_key, wrap_share_key, wrap_with_key, FolderKeyPair, PasswordParams,
    PublicCommitment,
};
use usync_nntp::{ArticleHeaders, ArticleTransport};

/// Caller-supplied access rule for a publish, mirroring the three §4.6
/// variants before they're turned into an `AccessBlock`.
pub enum AccessSpec {
    Public,
    Private { authorized: Vec<PublicCommitment> },
    Protected { password: String },
}

/// Each CoreIndex article's body is capped well under typical provider
/// article-size limits so the signed index is never the reason a post
/// is rejected; only the content itself (via segment_size) is tuned to
/// that limit in the common case, this is a backstop for folders with
/// very large file/segment tables.
const COREINDEX_CHUNK_SIZE: usize = 700_000;

/// Builds, signs, posts and records a new CoreIndex for `folder`. Every
/// Segment belonging to the folder must already be `Posted`; re-running
/// this after a successful publish (with the same `access`) mints a new
/// Share pointing at a freshly-posted, freshly-signed CoreIndex — the
/// segment articles themselves are never touched (§4.6 re-publish).
pub async fn publish_folder(
    catalog: &dyn Catalog,
    transport: &dyn ArticleTransport,
    folder: &Folder,
    access: AccessSpec,
    expires_in: Option<Duration>,
    config: &CoreConfig,
    rng: &mut (impl RngCore + CryptoRng),
) -> anyhow::Result<Share> {
    let _lock = catalog.lock_folder(&folder.folder_id).await;

    let files = catalog.list_files_by_folder(&folder.folder_id).await?;
    let mut segments = catalog.list_segments_by_folder(&folder.folder_id).await?;
    ensure!(
        !segments.is_empty(),
        "folder has no segments; run segment_folder and upload_folder first"
    );
    segments.sort_by_key(|s| s.index);
    for s in &segments {
        s.check_invariant()?;
        ensure!(
            s.status == SegmentStatus::Posted,
            "segment {} is not yet posted; run upload_folder to completion first",
            s.segment_id
        );
    }

    let position: HashMap<SegmentId, u32> = segments
        .iter()
        .enumerate()
        .map(|(i, s)| (s.segment_id, i as u32))
        .collect();

    let mut file_table = Vec::with_capacity(files.len());
    for f in &files {
        if let Some(orig) = f.duplicate_of {
            file_table.push(FileTableEntry {
                file_id: f.file_id,
                rel_path: f.rel_path.clone(),
                size: f.size,
                sha256: f.sha256,
                segment_range_start: 0,
                segment_range_count: 0,
                duplicate_of: Some(orig),
            });
            continue;
        }

        let packed_owner = segments
            .iter()
            .find(|s| {
                s.packed_entries
                    .as_ref()
                    .is_some_and(|entries| entries.iter().any(|e| e.file_id == f.file_id))
            });

        let (segment_range_start, segment_range_count) = if let Some(seg) = packed_owner {
            (position[&seg.segment_id], 1u32)
        } else {
            let mut positions: Vec<u32> = segments
                .iter()
                .filter(|s| s.file_id == f.file_id && s.packed_entries.is_none())
                .map(|s| position[&s.segment_id])
                .collect();
            ensure!(!positions.is_empty(), "file {} owns no segment", f.file_id);
            positions.sort_unstable();
            for pair in positions.windows(2) {
                ensure!(
                    pair[1] == pair[0] + 1,
                    "file {} segments are not contiguous in the segment table",
                    f.file_id
                );
            }
            (positions[0], positions.len() as u32)
        };

        file_table.push(FileTableEntry {
            file_id: f.file_id,
            rel_path: f.rel_path.clone(),
            size: f.size,
            sha256: f.sha256,
            segment_range_start,
            segment_range_count,
            duplicate_of: None,
        });
    }

    let mut segment_table = Vec::with_capacity(segments.len());
    let mut packing_table = Vec::new();
    for s in &segments {
        let message_id = s
            .message_id
            .clone()
            .context("posted segment missing message_id despite invariant check")?;
        segment_table.push(SegmentTableEntry {
            segment_id: s.segment_id,
            message_id,
            plaintext_len: s.plaintext_len,
            plaintext_sha256: s.plaintext_sha256,
            key_id: s.index,
        });
        if let Some(entries) = &s.packed_entries {
            packing_table.push(PackingTableEntry {
                segment_id: s.segment_id,
                entries: entries
                    .iter()
                    .map(|e| usync_segment::PackedEntry {
                        file_id: e.file_id,
                        offset: e.offset,
                        length: e.length,
                    })
                    .collect(),
            });
        }
    }

    let folder_keys = FolderKeyPair::from_seed(&folder.folder_key_seed);
    // Open Question decision 6 (see DESIGN.md): K_share is the folder's
    // own root_secret, so unwrapping it on the resolving side hands back
    // exactly what `derive_segment_key` needs for every segment.
    let k_share = folder.root_secret;

    let access_block = match access {
        AccessSpec::Public => AccessBlock::Public { share_key: k_share },
        AccessSpec::Private { authorized } => {
            let mut access_salt = [0u8; 16];
            rng.fill_bytes(&mut access_salt);
            let mut entries = Vec::with_capacity(authorized.len());
            for (i, user_pub) in authorized.iter().enumerate() {
                let wrapped =
                    wrap_share_key(&folder_keys, user_pub, &access_salt, i as u32, &k_share)?;
                entries.push((*user_pub, wrapped));
            }
            AccessBlock::Private { entries, access_salt }
        }
        AccessSpec::Protected { password } => {
            let mut salt = [0u8; 16];
            rng.fill_bytes(&mut salt);
            let kdf_params = PasswordParams::default();
            let password_key = derive_password_key(&password, &salt, kdf_params)?;
            let wrapped_key = wrap_with_key(&password_key, &k_share)?;
            AccessBlock::Protected {
                salt,
                kdf_params,
                wrapped_key,
            }
        }
    };

    let now = Utc::now();
    let index = CoreIndex {
        folder_public_key: folder_keys.public,
        segment_size: folder.segment_size as u32,
        created_at: now,
        expires_at: expires_in.map(|d| now + d),
        access: access_block,
        files: file_table,
        segments: segment_table,
        packing: packing_table,
    };

    let encoded = index.sign_and_encode(&folder_keys, rng)?;
    let message_ids = post_core_index(transport, &encoded, config, rng).await?;

    let share = Share {
        share_id: base32_token(rng),
        folder_id: folder.folder_id,
        share_type: match &index.access {
            AccessBlock::Public { .. } => ShareType::Public,
            AccessBlock::Private { .. } => ShareType::Private,
            AccessBlock::Protected { .. } => ShareType::Protected,
        },
        core_index_message_ids: message_ids,
        expires_at: index.expires_at,
        created_at: now,
        revoked: false,
    };
    catalog.put_share(&share).await?;
    Ok(share)
}

async fn post_core_index(
    transport: &dyn ArticleTransport,
    encoded: &[u8],
    config: &CoreConfig,
    rng: &mut (impl RngCore + CryptoRng),
) -> anyhow::Result<Vec<String>> {
    let chunks: Vec<&[u8]> = encoded.chunks(COREINDEX_CHUNK_SIZE).collect();
    let total = chunks.len() as u32;
    let subject = usync_common::lowercase_alnum_token(rng, 20);

    let mut message_ids = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        let part = (i + 1) as u32;
        let message_id = usync_nntp::generate_message_id(rng, &config.message_id_domain);
        let headers = ArticleHeaders {
            message_id: message_id.clone(),
            subject: subject.clone(),
            from_display_name: config.from_display_name.clone(),
            from_address: config.from_address.clone(),
            newsgroup: config.newsgroup.clone(),
            date: Utc::now(),
        };
        let raw = usync_nntp::format_article(&headers, part, total, chunk);
        let posted = transport.post(&raw, &message_id).await?;
        message_ids.push(posted);
    }
    Ok(message_ids)
}
