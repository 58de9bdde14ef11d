//! The CoreIndex binary wire format: the signed, posted record
//! describing one share, per §6.

use anyhow::{bail, ensure, Context};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use std::io::{Cursor, Read, Write};
use usync_common::{FileId, SegmentId};
use usync_crypto::{FolderKeyPair, PasswordParams, PublicCommitment, SchnorrProof};

pub const MAGIC: [u8; 4] = *b"UCIX";
pub const VERSION: u16 = 1;
const FIXED_HEADER_LEN: usize = 94;
const SIGNATURE_LEN: usize = 64;

const FLAG_ACCESS_MASK: u32 = 0b11;
const FLAG_PACKING_BIT: u32 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Public = 0,
    Private = 1,
    Protected = 2,
}

impl AccessType {
    fn from_bits(bits: u32) -> anyhow::Result<Self> {
        match bits & FLAG_ACCESS_MASK {
            0 => Ok(Self::Public),
            1 => Ok(Self::Private),
            2 => Ok(Self::Protected),
            other => bail!("unknown access_type bits: {other}"),
        }
    }
}

/// The three access rules of §4.6, each carrying exactly what's needed
/// to recover `K_share` on the resolving side.
#[derive(Debug, Clone)]
pub enum AccessBlock {
    Public {
        share_key: [u8; 32],
    },
    Private {
        /// `(Pᵢ, WRAP(Pᵢ, K_share))` per authorized user; raw user ids
        /// never appear (§4.6).
        entries: Vec<(PublicCommitment, [u8; 48])>,
        /// Fresh per publish (Open Question decision 5), prepended so
        /// `wrap_share_key`/`unwrap_share_key` never reuse a key/nonce
        /// pair across re-publishes of the same folder.
        access_salt: [u8; 16],
    },
    Protected {
        salt: [u8; 16],
        kdf_params: PasswordParams,
        wrapped_key: [u8; 48],
    },
}

impl AccessBlock {
    fn access_type(&self) -> AccessType {
        match self {
            Self::Public { .. } => AccessType::Public,
            Self::Private { .. } => AccessType::Private,
            Self::Protected { .. } => AccessType::Protected,
        }
    }

    fn write(&self, out: &mut Vec<u8>) -> anyhow::Result<()> {
        match self {
            Self::Public { share_key } => {
                out.write_all(share_key)?;
            }
            Self::Private { entries, access_salt } => {
                out.write_all(access_salt)?;
                out.write_u32::<BigEndian>(entries.len() as u32)?;
                for (p, wrapped) in entries {
                    out.write_all(&p.0)?;
                    out.write_all(wrapped)?;
                }
            }
            Self::Protected {
                salt,
                kdf_params,
                wrapped_key,
            } => {
                out.write_all(salt)?;
                out.write_u8(kdf_params.log_n)?;
                out.write_u32::<BigEndian>(kdf_params.r)?;
                out.write_u8(kdf_params.p as u8)?;
                out.write_u16::<BigEndian>(0)?; // reserved
                out.write_all(wrapped_key)?;
            }
        }
        Ok(())
    }

    fn read(cursor: &mut Cursor<&[u8]>, access_type: AccessType) -> anyhow::Result<Self> {
        match access_type {
            AccessType::Public => {
                let mut share_key = [0u8; 32];
                cursor.read_exact(&mut share_key)?;
                Ok(Self::Public { share_key })
            }
            AccessType::Private => {
                let mut access_salt = [0u8; 16];
                cursor.read_exact(&mut access_salt)?;
                let count = cursor.read_u32::<BigEndian>()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let mut p = [0u8; 32];
                    cursor.read_exact(&mut p)?;
                    let mut wrapped = [0u8; 48];
                    cursor.read_exact(&mut wrapped)?;
                    entries.push((PublicCommitment(p), wrapped));
                }
                Ok(Self::Private { entries, access_salt })
            }
            AccessType::Protected => {
                let mut salt = [0u8; 16];
                cursor.read_exact(&mut salt)?;
                let log_n = cursor.read_u8()?;
                let r = cursor.read_u32::<BigEndian>()?;
                let p = cursor.read_u8()? as u32;
                let _reserved = cursor.read_u16::<BigEndian>()?;
                let mut wrapped_key = [0u8; 48];
                cursor.read_exact(&mut wrapped_key)?;
                Ok(Self::Protected {
                    salt,
                    kdf_params: PasswordParams { log_n, r, p },
                    wrapped_key,
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileTableEntry {
    pub file_id: FileId,
    pub rel_path: String,
    pub size: u64,
    pub sha256: [u8; 32],
    /// First segment's position in the segment table and how many
    /// consecutive entries belong to this file. Both are `0` for a
    /// duplicate file, which owns no segments of its own.
    pub segment_range_start: u32,
    pub segment_range_count: u32,
    /// Set when this file's content is identical to an earlier file in
    /// the table; names that file instead of repeating its segments.
    pub duplicate_of: Option<FileId>,
}

#[derive(Debug, Clone)]
pub struct SegmentTableEntry {
    pub segment_id: SegmentId,
    pub message_id: String,
    pub plaintext_len: u64,
    pub plaintext_sha256: [u8; 32],
    /// The ordinal used to derive this segment's content key
    /// (`derive_segment_key`'s `segment_index` argument), independent of
    /// this entry's position in the table.
    pub key_id: u64,
}

#[derive(Debug, Clone)]
pub struct PackingTableEntry {
    pub segment_id: SegmentId,
    pub entries: Vec<usync_segment::PackedEntry>,
}

#[derive(Debug, Clone)]
pub struct CoreIndex {
    pub folder_public_key: PublicCommitment,
    pub segment_size: u32,
    pub created_at: DateTime<Utc>,
    /// `None` = never.
    pub expires_at: Option<DateTime<Utc>>,
    pub access: AccessBlock,
    pub files: Vec<FileTableEntry>,
    pub segments: Vec<SegmentTableEntry>,
    pub packing: Vec<PackingTableEntry>,
}

impl CoreIndex {
    fn folder_fingerprint(&self) -> [u8; 32] {
        *usync_common::sha256_digest(&self.folder_public_key.0).as_bytes()
    }

    /// Serializes everything except the trailing signature, the exact
    /// bytes the folder key signs and verifiers re-derive.
    fn to_unsigned_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(FIXED_HEADER_LEN + 1024);
        out.extend_from_slice(&MAGIC);
        out.write_u16::<BigEndian>(VERSION)?;
        out.extend_from_slice(&self.folder_public_key.0);
        out.extend_from_slice(&self.folder_fingerprint());
        out.write_u32::<BigEndian>(self.segment_size)?;

        let mut flags = self.access.access_type() as u32;
        if !self.packing.is_empty() {
            flags |= FLAG_PACKING_BIT;
        }
        out.write_u32::<BigEndian>(flags)?;
        out.write_u64::<BigEndian>(self.created_at.timestamp() as u64)?;
        out.write_u64::<BigEndian>(self.expires_at.map(|t| t.timestamp() as u64).unwrap_or(0))?;

        ensure!(out.len() == FIXED_HEADER_LEN, "fixed header length drifted");

        self.access.write(&mut out)?;

        out.write_u32::<BigEndian>(self.files.len() as u32)?;
        for f in &self.files {
            out.write_all(f.file_id.as_uuid().as_bytes())?;
            let path_bytes = f.rel_path.as_bytes();
            out.write_u16::<BigEndian>(path_bytes.len() as u16)?;
            out.write_all(path_bytes)?;
            out.write_u64::<BigEndian>(f.size)?;
            out.write_all(&f.sha256)?;
            out.write_u32::<BigEndian>(f.segment_range_start)?;
            out.write_u32::<BigEndian>(f.segment_range_count)?;
            match f.duplicate_of {
                Some(orig) => {
                    out.write_u8(1)?;
                    out.write_all(orig.as_uuid().as_bytes())?;
                }
                None => out.write_u8(0)?,
            }
        }

        out.write_u32::<BigEndian>(self.segments.len() as u32)?;
        for s in &self.segments {
            out.write_all(s.segment_id.as_uuid().as_bytes())?;
            let mid_bytes = s.message_id.as_bytes();
            out.write_u16::<BigEndian>(mid_bytes.len() as u16)?;
            out.write_all(mid_bytes)?;
            out.write_u64::<BigEndian>(s.plaintext_len)?;
            out.write_all(&s.plaintext_sha256)?;
            out.write_u64::<BigEndian>(s.key_id)?;
        }

        if !self.packing.is_empty() {
            out.write_u32::<BigEndian>(self.packing.len() as u32)?;
            for p in &self.packing {
                out.write_all(p.segment_id.as_uuid().as_bytes())?;
                out.write_u32::<BigEndian>(p.entries.len() as u32)?;
                for e in &p.entries {
                    out.write_all(e.file_id.as_uuid().as_bytes())?;
                    out.write_u32::<BigEndian>(e.offset)?;
                    out.write_u32::<BigEndian>(e.length)?;
                }
            }
        }

        Ok(out)
    }

    /// Signs and serializes the complete posted byte form: unsigned
    /// bytes followed by the 64-byte Schnorr signature over them.
    pub fn sign_and_encode(
        &self,
        folder_keys: &FolderKeyPair,
        rng: &mut (impl rand_core::RngCore + rand_core::CryptoRng),
    ) -> anyhow::Result<Vec<u8>> {
        let mut bytes = self.to_unsigned_bytes()?;
        let signature: SchnorrProof = folder_keys.sign(&bytes, rng);
        bytes.extend_from_slice(&signature.to_bytes());
        Ok(bytes)
    }

    /// Parses and verifies a posted CoreIndex. Returns `IntegrityFailed`
    /// (via the caller's error mapping) if the signature does not
    /// verify against the embedded folder public key.
    pub fn decode_and_verify(bytes: &[u8]) -> anyhow::Result<Self> {
        ensure!(
            bytes.len() >= FIXED_HEADER_LEN + SIGNATURE_LEN,
            "CoreIndex shorter than its fixed header plus signature"
        );
        let (unsigned, signature_bytes) = bytes.split_at(bytes.len() - SIGNATURE_LEN);
        let mut cursor = Cursor::new(unsigned);

        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        ensure!(magic == MAGIC, "bad CoreIndex magic");
        let version = cursor.read_u16::<BigEndian>()?;
        ensure!(version == VERSION, "unsupported CoreIndex version {version}");

        let mut folder_public_key = [0u8; 32];
        cursor.read_exact(&mut folder_public_key)?;
        let folder_public_key = PublicCommitment(folder_public_key);

        let mut fingerprint = [0u8; 32];
        cursor.read_exact(&mut fingerprint)?;
        ensure!(
            fingerprint == *usync_common::sha256_digest(&folder_public_key.0).as_bytes(),
            "folder_fingerprint does not match folder_public_key"
        );

        let segment_size = cursor.read_u32::<BigEndian>()?;
        let flags = cursor.read_u32::<BigEndian>()?;
        let access_type = AccessType::from_bits(flags)?;
        let has_packing = flags & FLAG_PACKING_BIT != 0;

        let created_at = timestamp(cursor.read_u64::<BigEndian>()?)?;
        let expires_raw = cursor.read_u64::<BigEndian>()?;
        let expires_at = if expires_raw == 0 {
            None
        } else {
            Some(timestamp(expires_raw)?)
        };

        ensure!(
            cursor.position() as usize == FIXED_HEADER_LEN,
            "fixed header length drifted while decoding"
        );

        let access = AccessBlock::read(&mut cursor, access_type)?;

        let file_count = cursor.read_u32::<BigEndian>()?;
        let mut files = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            let mut id_bytes = [0u8; 16];
            cursor.read_exact(&mut id_bytes)?;
            let path_len = cursor.read_u16::<BigEndian>()? as usize;
            let mut path_bytes = vec![0u8; path_len];
            cursor.read_exact(&mut path_bytes)?;
            let size = cursor.read_u64::<BigEndian>()?;
            let mut sha256 = [0u8; 32];
            cursor.read_exact(&mut sha256)?;
            let segment_range_start = cursor.read_u32::<BigEndian>()?;
            let segment_range_count = cursor.read_u32::<BigEndian>()?;
            let duplicate_of = if cursor.read_u8()? == 1 {
                let mut dup_bytes = [0u8; 16];
                cursor.read_exact(&mut dup_bytes)?;
                Some(FileId::from_uuid(uuid::Uuid::from_bytes(dup_bytes)))
            } else {
                None
            };
            files.push(FileTableEntry {
                file_id: FileId::from_uuid(uuid::Uuid::from_bytes(id_bytes)),
                rel_path: String::from_utf8(path_bytes).context("non-utf8 rel_path")?,
                size,
                sha256,
                segment_range_start,
                segment_range_count,
                duplicate_of,
            });
        }

        let segment_count = cursor.read_u32::<BigEndian>()?;
        let mut segments = Vec::with_capacity(segment_count as usize);
        for _ in 0..segment_count {
            let mut id_bytes = [0u8; 16];
            cursor.read_exact(&mut id_bytes)?;
            let mid_len = cursor.read_u16::<BigEndian>()? as usize;
            let mut mid_bytes = vec![0u8; mid_len];
            cursor.read_exact(&mut mid_bytes)?;
            let plaintext_len = cursor.read_u64::<BigEndian>()?;
            let mut plaintext_sha256 = [0u8; 32];
            cursor.read_exact(&mut plaintext_sha256)?;
            let key_id = cursor.read_u64::<BigEndian>()?;
            segments.push(SegmentTableEntry {
                segment_id: SegmentId::from_uuid(uuid::Uuid::from_bytes(id_bytes)),
                message_id: String::from_utf8(mid_bytes).context("non-utf8 message_id")?,
                plaintext_len,
                plaintext_sha256,
                key_id,
            });
        }

        let mut packing = Vec::new();
        if has_packing {
            let packing_count = cursor.read_u32::<BigEndian>()?;
            for _ in 0..packing_count {
                let mut id_bytes = [0u8; 16];
                cursor.read_exact(&mut id_bytes)?;
                let entry_count = cursor.read_u32::<BigEndian>()?;
                let mut entries = Vec::with_capacity(entry_count as usize);
                for _ in 0..entry_count {
                    let mut file_id_bytes = [0u8; 16];
                    cursor.read_exact(&mut file_id_bytes)?;
                    let offset = cursor.read_u32::<BigEndian>()?;
                    let length = cursor.read_u32::<BigEndian>()?;
                    entries.push(usync_segment::PackedEntry {
                        file_id: FileId::from_uuid(uuid::Uuid::from_bytes(file_id_bytes)),
                        offset,
                        length,
                    });
                }
                packing.push(PackingTableEntry {
                    segment_id: SegmentId::from_uuid(uuid::Uuid::from_bytes(id_bytes)),
                    entries,
                });
            }
        }

        let index = CoreIndex {
            folder_public_key,
            segment_size,
            created_at,
            expires_at,
            access,
            files,
            segments,
            packing,
        };

        let signature = SchnorrProof::from_bytes(
            signature_bytes
                .try_into()
                .expect("split_at guarantees exactly SIGNATURE_LEN bytes"),
        );
        let verified = FolderKeyPair::verify(&folder_public_key, unsigned, &signature)?;
        ensure!(verified, "CoreIndex signature verification failed");

        Ok(index)
    }
}

fn timestamp(unix_seconds: u64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_opt(unix_seconds as i64, 0)
        .single()
        .context("invalid unix timestamp in CoreIndex")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn sample_index(access: AccessBlock) -> CoreIndex {
        CoreIndex {
            // Overwritten by callers with the real signing keypair's
            // public half before signing; placeholder here only because
            // `CoreIndex` always needs a value for this field.
            folder_public_key: PublicCommitment([0u8; 32]),
            segment_size: 768_000,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            expires_at: None,
            access,
            files: vec![FileTableEntry {
                file_id: FileId::new(),
                rel_path: "a.txt".into(),
                size: 5,
                sha256: [1u8; 32],
                segment_range_start: 0,
                segment_range_count: 1,
                duplicate_of: None,
            }],
            segments: vec![SegmentTableEntry {
                segment_id: SegmentId::new(),
                message_id: "<abc@ngPost.com>".into(),
                plaintext_len: 5,
                plaintext_sha256: [2u8; 32],
                key_id: 0,
            }],
            packing: vec![],
        }
    }

    #[test]
    fn public_core_index_round_trips_signed() {
        let folder_keys = FolderKeyPair::generate(&mut OsRng);
        let mut index = sample_index(AccessBlock::Public { share_key: [9u8; 32] });
        index.folder_public_key = folder_keys.public;

        let encoded = index.sign_and_encode(&folder_keys, &mut OsRng).unwrap();
        let decoded = CoreIndex::decode_and_verify(&encoded).unwrap();

        assert_eq!(decoded.files.len(), 1);
        assert_eq!(decoded.segments[0].message_id, "<abc@ngPost.com>");
    }

    #[test]
    fn tampered_core_index_fails_verification() {
        let folder_keys = FolderKeyPair::generate(&mut OsRng);
        let mut index = sample_index(AccessBlock::Public { share_key: [9u8; 32] });
        index.folder_public_key = folder_keys.public;

        let mut encoded = index.sign_and_encode(&folder_keys, &mut OsRng).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;

        assert!(CoreIndex::decode_and_verify(&encoded).is_err());
    }
}
