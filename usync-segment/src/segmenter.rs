use crate::indexer::IndexedFile;
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use usync_common::{lowercase_alnum_token, FileId, FolderId};

/// A single plaintext segment as produced by the Segmenter, before
/// encryption. `source` names which file(s) contributed its bytes: a
/// single whole/partial file for an ordinary segment, or several for a
/// packed one (§4.3).
#[derive(Debug, Clone)]
pub struct PlainSegment {
    pub index: u64,
    pub plaintext: Vec<u8>,
    pub plaintext_sha256: [u8; 32],
    pub source: SegmentSource,
    pub internal_subject: String,
    pub usenet_subject: String,
}

#[derive(Debug, Clone)]
pub enum SegmentSource {
    /// Byte range `[offset, offset + len)` of one file.
    Single { file_id: FileId, offset: u64, len: u64 },
    /// Several small files packed into one segment, framed by
    /// `crate::packing`.
    Packed(Vec<crate::packing::PackedEntry>),
}

/// Splits `reader` into fixed-size segments of at most `segment_size`
/// bytes, the last possibly short. Reads and hashes one `segment_size`
/// chunk at a time so a large file is never held whole in memory; only
/// one chunk buffer is live at any point regardless of file size. Does
/// not pack; packing is a separate pass over the files left over after
/// this (§4.3).
pub async fn split_fixed_size(
    file_id: FileId,
    mut reader: impl AsyncRead + Unpin,
    segment_size: u64,
    next_index: &mut u64,
    folder_id: &FolderId,
    folder_secret: &[u8; 32],
    version: u32,
    rng: &mut (impl RngCore + CryptoRng),
) -> std::io::Result<Vec<PlainSegment>> {
    let segment_size = segment_size as usize;
    let mut out = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut chunk = vec![0u8; segment_size];
        let mut filled = 0usize;
        while filled < segment_size {
            let n = reader.read(&mut chunk[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        chunk.truncate(filled);
        let index = *next_index;
        *next_index += 1;

        out.push(build_segment(
            index,
            chunk,
            SegmentSource::Single {
                file_id,
                offset,
                len: filled as u64,
            },
            folder_id,
            folder_secret,
            version,
            rng,
        ));
        offset += filled as u64;
        if filled < segment_size {
            break;
        }
    }
    Ok(out)
}

/// Packs small files (`size < segment_size`) into as few segments as
/// possible, each holding up to `P = ⌊segment_size / avg(small_file_size)⌋`
/// files (§4.3). Packing order follows the files' existing (sorted)
/// order, so the decision is deterministic for a given input set.
pub fn pack_small_files(
    small_files: &[(IndexedFile, Vec<u8>)],
    segment_size: u64,
    next_index: &mut u64,
    folder_id: &FolderId,
    folder_secret: &[u8; 32],
    version: u32,
    rng: &mut (impl RngCore + CryptoRng),
) -> Vec<PlainSegment> {
    if small_files.is_empty() {
        return Vec::new();
    }
    let avg_size: u64 = {
        let total: u64 = small_files.iter().map(|(f, _)| f.size).sum();
        (total / small_files.len() as u64).max(1)
    };
    let max_per_segment = ((segment_size / avg_size).max(1)) as usize;

    let mut out = Vec::new();
    for batch in small_files.chunks(max_per_segment) {
        let framed = crate::packing::frame(batch);
        if framed.payload.len() as u64 > segment_size {
            // A batch can only overshoot when a single file's own size
            // plus framing overhead exceeds segment_size; split to one
            // file per segment for that remainder instead of violating
            // the nominal segment size.
            for (file, bytes) in batch {
                let single_framed = crate::packing::frame(std::slice::from_ref(&(file.clone(), bytes.clone())));
                let index = *next_index;
                *next_index += 1;
                out.push(build_segment(
                    index,
                    single_framed.payload,
                    SegmentSource::Packed(single_framed.entries),
                    folder_id,
                    folder_secret,
                    version,
                    rng,
                ));
            }
            continue;
        }
        let index = *next_index;
        *next_index += 1;
        out.push(build_segment(
            index,
            framed.payload,
            SegmentSource::Packed(framed.entries),
            folder_id,
            folder_secret,
            version,
            rng,
        ));
    }
    out
}

fn build_segment(
    index: u64,
    plaintext: Vec<u8>,
    source: SegmentSource,
    folder_id: &FolderId,
    folder_secret: &[u8; 32],
    version: u32,
    rng: &mut (impl RngCore + CryptoRng),
) -> PlainSegment {
    let plaintext_sha256 = {
        let mut hasher = Sha256::new();
        hasher.update(&plaintext);
        hasher.finalize().into()
    };
    let mut entropy = [0u8; 16];
    rng.fill_bytes(&mut entropy);
    let internal_subject = internal_subject(folder_secret, folder_id, version, index, &entropy);
    let usenet_subject = lowercase_alnum_token(rng, 20);

    PlainSegment {
        index,
        plaintext,
        plaintext_sha256,
        source,
        internal_subject,
        usenet_subject,
    }
}

/// `internal_subject = H(folder_priv || folder_id || version || segment_index || entropy)`,
/// 64-hex, per §4.3. Never posted; used only to verify a downloaded
/// article matches the Segment the Catalog expects.
fn internal_subject(
    folder_secret: &[u8; 32],
    folder_id: &FolderId,
    version: u32,
    segment_index: u64,
    entropy: &[u8; 16],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(folder_secret);
    hasher.update(folder_id.to_string().as_bytes());
    hasher.update(version.to_be_bytes());
    hasher.update(segment_index.to_be_bytes());
    hasher.update(entropy);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::IndexedFile;
    use chrono::Utc;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[tokio::test]
    async fn short_file_produces_one_short_segment() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let mut index = 0;
        let segments = split_fixed_size(
            FileId::new(),
            std::io::Cursor::new(b"hello".to_vec()),
            768_000,
            &mut index,
            &FolderId::new(),
            &[0u8; 32],
            1,
            &mut rng,
        )
        .await
        .unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].plaintext, b"hello");
        assert_eq!(index, 1);
    }

    #[tokio::test]
    async fn large_file_splits_into_full_segments_plus_short_tail() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let mut index = 0;
        let bytes = vec![7u8; 10_000_000];
        let segments = split_fixed_size(
            FileId::new(),
            std::io::Cursor::new(bytes),
            768_000,
            &mut index,
            &FolderId::new(),
            &[0u8; 32],
            1,
            &mut rng,
        )
        .await
        .unwrap();
        assert_eq!(segments.len(), 14);
        assert_eq!(segments[13].plaintext.len(), 10_000_000 - 13 * 768_000);
        for s in &segments[..13] {
            assert_eq!(s.plaintext.len(), 768_000);
        }
    }

    #[tokio::test]
    async fn usenet_subjects_are_twenty_lowercase_alnum_chars() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let mut index = 0;
        let segments = split_fixed_size(
            FileId::new(),
            std::io::Cursor::new(b"some content".to_vec()),
            768_000,
            &mut index,
            &FolderId::new(),
            &[1u8; 32],
            1,
            &mut rng,
        )
        .await
        .unwrap();
        let subject = &segments[0].usenet_subject;
        assert_eq!(subject.len(), 20);
        assert!(subject.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn packing_keeps_all_small_files_and_respects_bound() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let mut index = 0;
        let files: Vec<(IndexedFile, Vec<u8>)> = (0..5)
            .map(|i| {
                let bytes = vec![i as u8; 100];
                (
                    IndexedFile {
                        file_id: FileId::new(),
                        rel_path: format!("f{i}.bin"),
                        size: bytes.len() as u64,
                        sha256: [0u8; 32],
                        modified_at: Utc::now(),
                        duplicate_of: None,
                    },
                    bytes,
                )
            })
            .collect();

        let segments = pack_small_files(
            &files,
            1000,
            &mut index,
            &FolderId::new(),
            &[2u8; 32],
            1,
            &mut rng,
        );
        let total_entries: usize = segments
            .iter()
            .map(|s| match &s.source {
                SegmentSource::Packed(entries) => entries.len(),
                SegmentSource::Single { .. } => 1,
            })
            .sum();
        assert_eq!(total_entries, 5);
    }
}
