use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use usync_common::{FileId, FolderId, Result};
use walkdir::WalkDir;

/// One file discovered under a folder root, with its content hash
/// already computed. Mirrors §3's `File` record but is storage-agnostic;
/// the caller persists it via `usync-catalog`.
#[derive(Debug, Clone)]
pub struct IndexedFile {
    pub file_id: FileId,
    pub rel_path: String,
    pub size: u64,
    pub sha256: [u8; 32],
    pub modified_at: DateTime<Utc>,
    /// Set when another file earlier in `rel_path` order has identical
    /// content; names that file's id. The segmenter and publisher skip
    /// re-posting bytes for a duplicate, per spec's dedup requirement.
    pub duplicate_of: Option<FileId>,
}

/// Walks `root` and produces one `IndexedFile` per regular file, sorted
/// by relative path so repeated indexing of an unchanged tree is
/// byte-for-byte deterministic (segmentation and packing downstream
/// depend on a stable file order). Files whose content duplicates an
/// earlier (by `rel_path`) file in the same walk are flagged via
/// `duplicate_of` rather than segmented twice.
pub async fn index_folder(root: impl AsRef<Path>) -> Result<Vec<IndexedFile>> {
    let root = root.as_ref().to_path_buf();
    let entries = tokio::task::spawn_blocking(move || walk(&root)).await??;
    Ok(entries)
}

fn walk(root: &Path) -> Result<Vec<IndexedFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).into_iter() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel_path = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let metadata = entry.metadata()?;
        let modified_at: DateTime<Utc> = metadata.modified()?.into();
        let bytes = std::fs::read(entry.path())?;
        let sha256 = sha256_of(&bytes);

        files.push(IndexedFile {
            file_id: FileId::new(),
            rel_path,
            size: bytes.len() as u64,
            sha256,
            modified_at,
            duplicate_of: None,
        });
    }
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    let mut seen: HashMap<[u8; 32], FileId> = HashMap::new();
    for file in &mut files {
        match seen.get(&file.sha256) {
            Some(canonical) => file.duplicate_of = Some(*canonical),
            None => {
                seen.insert(file.sha256, file.file_id);
            }
        }
    }
    Ok(files)
}

fn sha256_of(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Re-indexes and compares against a previously segmented file set, used
/// to decide whether a re-publish can reuse existing segments (Open
/// Question decision 2: content changes require a full index → segment
/// → upload cycle, so this is a pure equality check, not a merge).
pub fn content_set_matches(previous: &[IndexedFile], current: &[IndexedFile]) -> bool {
    if previous.len() != current.len() {
        return false;
    }
    previous
        .iter()
        .zip(current.iter())
        .all(|(a, b)| a.rel_path == b.rel_path && a.sha256 == b.sha256 && a.size == b.size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn indexes_files_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"world!").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let files = index_folder(dir.path()).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].rel_path, "a.txt");
        assert_eq!(files[1].rel_path, "b.txt");
        assert_eq!(files[0].size, 5);
        assert_eq!(files[1].size, 6);
    }

    #[tokio::test]
    async fn reindexing_unchanged_tree_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("a.txt")).unwrap();
        f.write_all(b"hello").unwrap();
        drop(f);

        let first = index_folder(dir.path()).await.unwrap();
        let second = index_folder(dir.path()).await.unwrap();
        assert!(content_set_matches(&first, &second));
    }

    #[tokio::test]
    async fn content_change_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let first = index_folder(dir.path()).await.unwrap();

        std::fs::write(dir.path().join("a.txt"), b"hello!!").unwrap();
        let second = index_folder(dir.path()).await.unwrap();
        assert!(!content_set_matches(&first, &second));
    }
}
