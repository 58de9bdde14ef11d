//! Opens a Share by id: fetches and verifies the CoreIndex, applies the
//! access rule to recover `K_share`, and hands back the validated index.
//! Grounded on `wnfs/src/private/forest.rs`'s `PrivateForest::get` — the
//! fetch+decrypt+verify half of the put/get pair `publisher.rs` grounds
//! its other half on.

use crate::coreindex::{AccessBlock, CoreIndex};
use anyhow::{ensure, Context};
use chrono::Utc;
use usync_catalog::{Catalog, Share, ShareType};
use usync_common::{ShareId, UsyncError};
use usync_crypto::{derive_password_key, unwrap_with_key, Identity};
use usync_nntp::ArticleTransport;

/// How the caller proves they're allowed to open a share, matching the
/// three §4.6 access rules. `Public` carries nothing since a PUBLIC
/// CoreIndex's share key is already in the clear.
pub enum OpenAuth<'a> {
    Public,
    Private { identity: &'a Identity },
    Protected { password: &'a str },
}

/// A successfully resolved share: the verified CoreIndex plus the
/// recovered `K_share`, which the Downloader uses as the folder's
/// `root_secret` for `derive_segment_key`.
pub struct ResolvedShare {
    pub index: CoreIndex,
    pub k_share: [u8; 32],
}

/// `open(share_id, auth) -> CoreIndex | AccessDenied | Expired | NotFound`
/// (§4.6). Looks up the share's root CoreIndex message-ids, fetches and
/// reassembles every part in order, verifies the folder signature, then
/// applies `auth` against the embedded access block.
pub async fn open(
    catalog: &dyn Catalog,
    transport: &dyn ArticleTransport,
    share_id: &ShareId,
    auth: OpenAuth<'_>,
) -> anyhow::Result<ResolvedShare> {
    let share = find_share(catalog, share_id).await?;
    ensure_not_revoked(&share)?;

    let mut bytes = Vec::new();
    for message_id in &share.core_index_message_ids {
        let raw = transport
            .retrieve(message_id)
            .await
            .map_err(|_| UsyncError::NotFound(format!("CoreIndex article {message_id} missing")))?;
        let (_, _part, payload) = usync_nntp::parse_article(&raw)
            .context("parsing a CoreIndex article")?;
        bytes.extend_from_slice(&payload);
    }

    let index = CoreIndex::decode_and_verify(&bytes)
        .map_err(|e| UsyncError::IntegrityFailed(e.to_string()))?;

    if let Some(expires_at) = index.expires_at {
        if Utc::now() > expires_at {
            return Err(UsyncError::Expired.into());
        }
    }

    let k_share = apply_access(&index.access, &index.folder_public_key, auth)?;

    Ok(ResolvedShare { index, k_share })
}

fn ensure_not_revoked(share: &Share) -> anyhow::Result<()> {
    ensure!(!share.revoked, UsyncError::AccessDenied);
    Ok(())
}

async fn find_share(catalog: &dyn Catalog, share_id: &ShareId) -> anyhow::Result<Share> {
    catalog
        .get_share(share_id)
        .await?
        .ok_or_else(|| UsyncError::NotFound(format!("share {share_id} not found")).into())
}

fn apply_access(
    access: &AccessBlock,
    folder_public_key: &usync_crypto::PublicCommitment,
    auth: OpenAuth<'_>,
) -> anyhow::Result<[u8; 32]> {
    match (access, auth) {
        (AccessBlock::Public { share_key }, OpenAuth::Public) => Ok(*share_key),
        (AccessBlock::Private { entries, access_salt }, OpenAuth::Private { identity }) => entries
            .iter()
            .enumerate()
            .find(|(_, (commitment, _))| *commitment == identity.commitment())
            .and_then(|(i, (_, wrapped))| {
                identity
                    .unwrap_share_key(folder_public_key, access_salt, i as u32, wrapped)
                    .ok()
            })
            .ok_or_else(|| UsyncError::AccessDenied.into()),
        (
            AccessBlock::Protected {
                salt,
                kdf_params,
                wrapped_key,
            },
            OpenAuth::Protected { password },
        ) => {
            let key = derive_password_key(password, salt, *kdf_params)?;
            unwrap_with_key(&key, wrapped_key).map_err(|_| UsyncError::AccessDenied.into())
        }
        _ => Err(UsyncError::AccessDenied.into()),
    }
}
