//! End-to-end scenarios run entirely against an in-memory Catalog and an
//! in-memory article transport, driven through `ControlSurface` the way
//! a GUI or CLI front end would. No real NNTP server or filesystem
//! persistence across processes is involved; "installations" are
//! separate `Catalog`/`IdentitySecretStore` pairs sharing one transport.

use async_trait::async_trait;
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use usync_catalog::{Catalog, MemoryCatalog};
use usync_core::{
    open, AccessBlock, ControlAccessType, ControlAuth, ControlRequest, ControlSurface,
    ControlValue, CoreConfig, OpenAuth,
};
use usync_crypto::{Identity, MemorySecretStore};
use usync_nntp::ArticleTransport;

struct MemoryTransport {
    articles: Mutex<HashMap<String, String>>,
}

impl MemoryTransport {
    fn new() -> Self {
        Self { articles: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl ArticleTransport for MemoryTransport {
    async fn post(&self, raw_article: &str, proposed_message_id: &str) -> anyhow::Result<String> {
        self.articles
            .lock()
            .unwrap()
            .insert(proposed_message_id.to_string(), raw_article.to_string());
        Ok(proposed_message_id.to_string())
    }

    async fn retrieve(&self, message_id: &str) -> anyhow::Result<String> {
        self.articles
            .lock()
            .unwrap()
            .get(message_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such article: {message_id}"))
    }
}

fn write_file(dir: &Path, rel_path: &str, bytes: &[u8]) {
    let path = dir.join(rel_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, bytes).unwrap();
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

async fn publish_new_folder(
    catalog: &dyn Catalog,
    transport: &dyn ArticleTransport,
    config: &CoreConfig,
    identity_store: &dyn usync_crypto::IdentitySecretStore,
    folder_path: &Path,
    access: ControlAccessType,
) -> usync_catalog::Share {
    let surface = ControlSurface::new(catalog, transport, config, identity_store);

    let register = surface
        .handle(ControlRequest::RegisterFolder {
            path: folder_path.to_string_lossy().to_string(),
            name: "demo".into(),
        })
        .await;
    assert!(register.ok, "{}", register.message);
    let folder_id = match register.value {
        Some(ControlValue::FolderId(id)) => id,
        _ => panic!("expected FolderId"),
    };

    let index = surface.handle(ControlRequest::IndexFolder { folder_id }).await;
    assert!(index.ok, "{}", index.message);

    let segment = surface.handle(ControlRequest::SegmentFolder { folder_id }).await;
    assert!(segment.ok, "{}", segment.message);

    let upload = surface.handle(ControlRequest::UploadFolder { folder_id }).await;
    assert!(upload.ok, "{}", upload.message);

    let publish = surface
        .handle(ControlRequest::PublishFolder { folder_id, access, expires_in: None })
        .await;
    assert!(publish.ok, "{}", publish.message);
    match publish.value {
        Some(ControlValue::Share(share)) => share,
        _ => panic!("expected Share"),
    }
}

#[tokio::test]
async fn s1_public_round_trip_small_files() {
    let src = tempfile::tempdir().unwrap();
    write_file(src.path(), "a.txt", b"hello");
    write_file(src.path(), "b.txt", b"world!");

    let catalog = MemoryCatalog::new();
    let transport = MemoryTransport::new();
    let config = CoreConfig::default();
    let store = MemorySecretStore::default();

    let share = publish_new_folder(
        &catalog,
        &transport,
        &config,
        &store,
        src.path(),
        ControlAccessType::Public,
    )
    .await;
    assert_eq!(share.share_id.as_str().len(), 24);
    assert!(share.share_id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));

    let posted_segments = catalog
        .list_segments_by_folder(
            &catalog.list_folders().await.unwrap()[0].folder_id,
        )
        .await
        .unwrap();
    assert_eq!(posted_segments.len(), 1, "both small files should pack into one segment");
    assert!(posted_segments[0].packed_entries.is_some());

    let dest = tempfile::tempdir().unwrap();
    let download_catalog = MemoryCatalog::new();
    let download_store = MemorySecretStore::default();
    let download_surface = ControlSurface::new(&download_catalog, &transport, &config, &download_store);
    let download = download_surface
        .handle(ControlRequest::DownloadShare {
            share_id: share.share_id.clone(),
            dest: dest.path().to_string_lossy().to_string(),
            auth: ControlAuth::Public,
        })
        .await;
    assert!(download.ok, "{}", download.message);

    let a = std::fs::read(dest.path().join("a.txt")).unwrap();
    let b = std::fs::read(dest.path().join("b.txt")).unwrap();
    assert_eq!(a, b"hello");
    assert_eq!(b, b"world!");
    assert_eq!(sha256_hex(&a), "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
    assert_eq!(sha256_hex(&b), "711e9609339e92b03ddc0a211827dba421f38f9ed8b9d806e1ffdd8c15ffa03d");
}

#[tokio::test]
async fn s2_large_file_segmentation() {
    let src = tempfile::tempdir().unwrap();
    let bytes: Vec<u8> = (0..10_000_000u32).map(|i| (i % 251) as u8).collect();
    write_file(src.path(), "big.bin", &bytes);

    let catalog = MemoryCatalog::new();
    let transport = MemoryTransport::new();
    let config = CoreConfig::default();
    let store = MemorySecretStore::default();

    let share = publish_new_folder(
        &catalog,
        &transport,
        &config,
        &store,
        src.path(),
        ControlAccessType::Public,
    )
    .await;

    let folder_id = catalog.list_folders().await.unwrap()[0].folder_id;
    let segments = catalog.list_segments_by_folder(&folder_id).await.unwrap();
    assert_eq!(segments.len(), 14);
    let mut by_index = segments.clone();
    by_index.sort_by_key(|s| s.index);
    assert!(by_index[13].plaintext_len < 768_000);
    for s in &by_index[..13] {
        assert_eq!(s.plaintext_len, 768_000);
    }

    let dest = tempfile::tempdir().unwrap();
    let download_catalog = MemoryCatalog::new();
    let download_store = MemorySecretStore::default();
    let download_surface = ControlSurface::new(&download_catalog, &transport, &config, &download_store);
    let download = download_surface
        .handle(ControlRequest::DownloadShare {
            share_id: share.share_id.clone(),
            dest: dest.path().to_string_lossy().to_string(),
            auth: ControlAuth::Public,
        })
        .await;
    assert!(download.ok, "{}", download.message);

    let roundtripped = std::fs::read(dest.path().join("big.bin")).unwrap();
    assert_eq!(roundtripped, bytes);
}

#[tokio::test]
async fn s3_private_access_authorized_vs_rejected() {
    let src = tempfile::tempdir().unwrap();
    write_file(src.path(), "secret.txt", b"only for friends");

    let catalog = MemoryCatalog::new();
    let transport = MemoryTransport::new();
    let config = CoreConfig::default();
    let owner_store = MemorySecretStore::default();

    let b_store = MemorySecretStore::default();
    let b_identity = Identity::ensure_identity(&b_store, "default").unwrap();
    let c_store = MemorySecretStore::default();
    let _c_identity = Identity::ensure_identity(&c_store, "default").unwrap();

    let share = publish_new_folder(
        &catalog,
        &transport,
        &config,
        &owner_store,
        src.path(),
        ControlAccessType::Private { authorized: vec![b_identity.commitment()] },
    )
    .await;

    let b_catalog = MemoryCatalog::new();
    let b_surface = ControlSurface::new(&b_catalog, &transport, &config, &b_store);
    let b_dest = tempfile::tempdir().unwrap();
    let b_download = b_surface
        .handle(ControlRequest::DownloadShare {
            share_id: share.share_id.clone(),
            dest: b_dest.path().to_string_lossy().to_string(),
            auth: ControlAuth::Private,
        })
        .await;
    assert!(b_download.ok, "{}", b_download.message);
    assert_eq!(std::fs::read(b_dest.path().join("secret.txt")).unwrap(), b"only for friends");

    let c_catalog = MemoryCatalog::new();
    let c_surface = ControlSurface::new(&c_catalog, &transport, &config, &c_store);
    let c_dest = tempfile::tempdir().unwrap();
    let c_download = c_surface
        .handle(ControlRequest::DownloadShare {
            share_id: share.share_id.clone(),
            dest: c_dest.path().to_string_lossy().to_string(),
            auth: ControlAuth::Private,
        })
        .await;
    assert!(!c_download.ok);
    assert_eq!(c_download.error_kind.as_deref(), Some("AccessDenied"));
}

#[tokio::test]
async fn s4_protected_access_password_and_salt() {
    let src = tempfile::tempdir().unwrap();
    write_file(src.path(), "vault.txt", b"treasure");

    let catalog = MemoryCatalog::new();
    let transport = MemoryTransport::new();
    let config = CoreConfig::default();
    let owner_store = MemorySecretStore::default();

    let share_one = publish_new_folder(
        &catalog,
        &transport,
        &config,
        &owner_store,
        src.path(),
        ControlAccessType::Protected { password: "correct horse".into() },
    )
    .await;

    let folder_id = catalog.list_folders().await.unwrap()[0].folder_id;
    let surface = ControlSurface::new(&catalog, &transport, &config, &owner_store);
    let republish = surface
        .handle(ControlRequest::PublishFolder {
            folder_id,
            access: ControlAccessType::Protected { password: "correct horse".into() },
            expires_in: None,
        })
        .await;
    assert!(republish.ok, "{}", republish.message);
    let share_two = match republish.value {
        Some(ControlValue::Share(share)) => share,
        _ => panic!("expected Share"),
    };

    let resolved_one = open(&catalog, &transport, &share_one.share_id, OpenAuth::Protected { password: "correct horse" })
        .await
        .unwrap();
    let resolved_two = open(&catalog, &transport, &share_two.share_id, OpenAuth::Protected { password: "correct horse" })
        .await
        .unwrap();
    let salt_one = match resolved_one.index.access {
        AccessBlock::Protected { salt, .. } => salt,
        _ => panic!("expected Protected access block"),
    };
    let salt_two = match resolved_two.index.access {
        AccessBlock::Protected { salt, .. } => salt,
        _ => panic!("expected Protected access block"),
    };
    assert_ne!(salt_one, salt_two, "each publish mints a fresh password salt");

    let dest = tempfile::tempdir().unwrap();
    let download_catalog = MemoryCatalog::new();
    let download_store = MemorySecretStore::default();
    let download_surface = ControlSurface::new(&download_catalog, &transport, &config, &download_store);
    let good = download_surface
        .handle(ControlRequest::DownloadShare {
            share_id: share_one.share_id.clone(),
            dest: dest.path().to_string_lossy().to_string(),
            auth: ControlAuth::Protected { password: "correct horse".into() },
        })
        .await;
    assert!(good.ok, "{}", good.message);
    assert_eq!(std::fs::read(dest.path().join("vault.txt")).unwrap(), b"treasure");

    let wrong_dest = tempfile::tempdir().unwrap();
    let wrong_catalog = MemoryCatalog::new();
    let wrong_store = MemorySecretStore::default();
    let wrong_surface = ControlSurface::new(&wrong_catalog, &transport, &config, &wrong_store);
    let bad = wrong_surface
        .handle(ControlRequest::DownloadShare {
            share_id: share_one.share_id.clone(),
            dest: wrong_dest.path().to_string_lossy().to_string(),
            auth: ControlAuth::Protected { password: "wrong".into() },
        })
        .await;
    assert!(!bad.ok);
    assert_eq!(bad.error_kind.as_deref(), Some("AccessDenied"));
}

#[tokio::test]
async fn s5_republish_updates_access_only() {
    let src = tempfile::tempdir().unwrap();
    write_file(src.path(), "shared.txt", b"team file");

    let catalog = MemoryCatalog::new();
    let transport = MemoryTransport::new();
    let config = CoreConfig::default();
    let owner_store = MemorySecretStore::default();

    let b_store = MemorySecretStore::default();
    let b_identity = Identity::ensure_identity(&b_store, "default").unwrap();
    let d_store = MemorySecretStore::default();
    let d_identity = Identity::ensure_identity(&d_store, "default").unwrap();

    let share_with_b = publish_new_folder(
        &catalog,
        &transport,
        &config,
        &owner_store,
        src.path(),
        ControlAccessType::Private { authorized: vec![b_identity.commitment()] },
    )
    .await;

    let folder_id = catalog.list_folders().await.unwrap()[0].folder_id;
    let message_ids_before: std::collections::BTreeSet<String> = catalog
        .list_segments_by_folder(&folder_id)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|s| s.message_id)
        .collect();

    let surface = ControlSurface::new(&catalog, &transport, &config, &owner_store);
    let republish = surface
        .handle(ControlRequest::PublishFolder {
            folder_id,
            access: ControlAccessType::Private { authorized: vec![d_identity.commitment()] },
            expires_in: None,
        })
        .await;
    assert!(republish.ok, "{}", republish.message);
    let share_with_d = match republish.value {
        Some(ControlValue::Share(share)) => share,
        _ => panic!("expected Share"),
    };
    assert_ne!(share_with_b.share_id, share_with_d.share_id);

    let message_ids_after: std::collections::BTreeSet<String> = catalog
        .list_segments_by_folder(&folder_id)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|s| s.message_id)
        .collect();
    assert_eq!(message_ids_before, message_ids_after, "re-publishing must not touch segment articles");

    let d_catalog = MemoryCatalog::new();
    let d_surface = ControlSurface::new(&d_catalog, &transport, &config, &d_store);
    let d_dest = tempfile::tempdir().unwrap();
    let d_download = d_surface
        .handle(ControlRequest::DownloadShare {
            share_id: share_with_d.share_id.clone(),
            dest: d_dest.path().to_string_lossy().to_string(),
            auth: ControlAuth::Private,
        })
        .await;
    assert!(d_download.ok, "{}", d_download.message);

    let b_catalog = MemoryCatalog::new();
    let b_surface = ControlSurface::new(&b_catalog, &transport, &config, &b_store);
    let b_dest = tempfile::tempdir().unwrap();
    let b_rejected = b_surface
        .handle(ControlRequest::DownloadShare {
            share_id: share_with_d.share_id.clone(),
            dest: b_dest.path().to_string_lossy().to_string(),
            auth: ControlAuth::Private,
        })
        .await;
    assert!(!b_rejected.ok);
    assert_eq!(b_rejected.error_kind.as_deref(), Some("AccessDenied"));
}

#[tokio::test]
async fn s6_resume_after_interrupted_upload() {
    let src = tempfile::tempdir().unwrap();
    let bytes: Vec<u8> = (0..10_000_000u32).map(|i| (i % 199) as u8).collect();
    write_file(src.path(), "resumable.bin", &bytes);

    let catalog = MemoryCatalog::new();
    let transport = MemoryTransport::new();
    let config = CoreConfig::default();
    let store = MemorySecretStore::default();
    let surface = ControlSurface::new(&catalog, &transport, &config, &store);

    let register = surface
        .handle(ControlRequest::RegisterFolder {
            path: src.path().to_string_lossy().to_string(),
            name: "demo".into(),
        })
        .await;
    let folder_id = match register.value {
        Some(ControlValue::FolderId(id)) => id,
        _ => panic!("expected FolderId"),
    };
    assert!(surface.handle(ControlRequest::IndexFolder { folder_id }).await.ok);
    assert!(surface.handle(ControlRequest::SegmentFolder { folder_id }).await.ok);

    usync_core::enqueue_pending_uploads(&catalog, &folder_id).await.unwrap();
    let mut rng = OsRng;
    let cancel = tokio_util::sync::CancellationToken::new();
    let first_batch = usync_core::run_upload_batch(
        &catalog,
        &transport,
        "installation-a",
        7,
        &config,
        &mut rng,
        &cancel,
    )
    .await
    .unwrap();
    assert_eq!(first_batch, 7, "simulated crash after exactly 7 posted segments");

    let posted_before_restart = catalog
        .list_segments_by_folder(&folder_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.status == usync_catalog::SegmentStatus::Posted)
        .count();
    assert_eq!(posted_before_restart, 7);

    // "Restart": resume with a fresh batch call against the same catalog,
    // standing in for a new process picking the queue back up.
    let second_batch = usync_core::run_upload_batch(
        &catalog,
        &transport,
        "installation-a",
        16,
        &config,
        &mut rng,
        &cancel,
    )
    .await
    .unwrap();
    assert_eq!(second_batch, 7);

    let segments = catalog.list_segments_by_folder(&folder_id).await.unwrap();
    assert_eq!(segments.len(), 14);
    assert!(segments.iter().all(|s| s.status == usync_catalog::SegmentStatus::Posted));
    let message_ids: std::collections::BTreeSet<_> =
        segments.iter().filter_map(|s| s.message_id.clone()).collect();
    assert_eq!(message_ids.len(), 14);
}
