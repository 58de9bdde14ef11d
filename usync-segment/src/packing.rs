use crate::indexer::IndexedFile;
use anyhow::{ensure, Context};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};
use usync_common::{FileId, Result};

/// One `(file_id, offset, length)` tuple in a packed segment's framing
/// header, per §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedEntry {
    pub file_id: FileId,
    /// Byte offset of this file's bytes within the packed segment's
    /// payload area (after the framing header).
    pub offset: u32,
    pub length: u32,
}

pub struct Framed {
    pub payload: Vec<u8>,
    pub entries: Vec<PackedEntry>,
}

/// `{ entry_count(u32) | (file_id(16) | offset(u32) | length(u32)) * n | file bytes concatenated }`.
/// File ids are packed as raw UUID bytes; `file_id.as_uuid().as_bytes()`.
fn header_len(entry_count: usize) -> usize {
    4 + entry_count * (16 + 4 + 4)
}

pub fn frame(files: &[(IndexedFile, Vec<u8>)]) -> Framed {
    let header_len = header_len(files.len());
    let payload_len: usize = files.iter().map(|(_, bytes)| bytes.len()).sum();
    let mut out = Vec::with_capacity(header_len + payload_len);
    out.write_u32::<BigEndian>(files.len() as u32).unwrap();

    let mut entries = Vec::with_capacity(files.len());
    let mut running_offset = 0u32;
    for (file, bytes) in files {
        out.write_all(file.file_id.as_uuid().as_bytes()).unwrap();
        out.write_u32::<BigEndian>(running_offset).unwrap();
        out.write_u32::<BigEndian>(bytes.len() as u32).unwrap();
        entries.push(PackedEntry {
            file_id: file.file_id,
            offset: running_offset,
            length: bytes.len() as u32,
        });
        running_offset += bytes.len() as u32;
    }
    for (_, bytes) in files {
        out.write_all(bytes).unwrap();
    }

    Framed {
        payload: out,
        entries,
    }
}

/// Reverses `frame`: parses the header and returns `(entry, bytes)` pairs
/// in the order they were packed, used by the Downloader to split a
/// retrieved packed segment back into per-file ranges.
pub fn unpack(packed: &[u8]) -> Result<Vec<(PackedEntry, Vec<u8>)>> {
    let mut cursor = Cursor::new(packed);
    let entry_count = cursor.read_u32::<BigEndian>().context("packed entry count")? as usize;

    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let mut id_bytes = [0u8; 16];
        std::io::Read::read_exact(&mut cursor, &mut id_bytes).context("packed file id")?;
        let offset = cursor.read_u32::<BigEndian>().context("packed offset")?;
        let length = cursor.read_u32::<BigEndian>().context("packed length")?;
        entries.push(PackedEntry {
            file_id: FileId::from_uuid(uuid::Uuid::from_bytes(id_bytes)),
            offset,
            length,
        });
    }

    let payload_start = cursor.position() as usize;
    let payload = &packed[payload_start..];

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        ensure!(end <= payload.len(), "packed entry range out of bounds");
        out.push((entry, payload[start..end].to_vec()));
    }
    Ok(out)
}
