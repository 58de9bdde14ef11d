use anyhow::{ensure, Context};

/// Magic bytes identifying a UsenetSync wire-framed segment, per §4.4.
pub const WIRE_MAGIC: [u8; 4] = *b"USNW";
pub const WIRE_VERSION: u8 = 1;
pub const WIRE_HEADER_LEN: usize = 32;

/// The 32-byte header prepended to every AEAD-encrypted segment before
/// yEnc-class text encoding, per §4.4:
/// `{ magic(4) | version(1) | flags(1) | reserved(2) | plaintext_len(8) |
///    ciphertext_len(8) | crc32(4) | header_crc(4) }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub version: u8,
    pub flags: u8,
    pub plaintext_len: u64,
    pub ciphertext_len: u64,
    /// CRC32 of the ciphertext, redundant with the text encoder's own
    /// per-part CRC but checked independently as the "transport CRC"
    /// integrity layer named in §4.4.
    pub crc32: u32,
}

impl WireHeader {
    pub fn new(plaintext_len: u64, ciphertext_len: u64, ciphertext: &[u8]) -> Self {
        Self {
            version: WIRE_VERSION,
            flags: 0,
            plaintext_len,
            ciphertext_len,
            crc32: crc32fast::hash(ciphertext),
        }
    }

    pub fn to_bytes(&self) -> [u8; WIRE_HEADER_LEN] {
        let mut out = [0u8; WIRE_HEADER_LEN];
        out[0..4].copy_from_slice(&WIRE_MAGIC);
        out[4] = self.version;
        out[5] = self.flags;
        // bytes 6..8 reserved, left zero
        out[8..16].copy_from_slice(&self.plaintext_len.to_be_bytes());
        out[16..24].copy_from_slice(&self.ciphertext_len.to_be_bytes());
        out[24..28].copy_from_slice(&self.crc32.to_be_bytes());
        let header_crc = crc32fast::hash(&out[0..28]);
        out[28..32].copy_from_slice(&header_crc.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        ensure!(
            bytes.len() >= WIRE_HEADER_LEN,
            "wire header too short: {} bytes",
            bytes.len()
        );
        ensure!(&bytes[0..4] == WIRE_MAGIC, "bad wire magic");

        let header_crc = u32::from_be_bytes(bytes[28..32].try_into().context("header_crc")?);
        let computed_header_crc = crc32fast::hash(&bytes[0..28]);
        ensure!(header_crc == computed_header_crc, "wire header CRC mismatch");

        let version = bytes[4];
        let flags = bytes[5];
        let plaintext_len = u64::from_be_bytes(bytes[8..16].try_into().context("plaintext_len")?);
        let ciphertext_len =
            u64::from_be_bytes(bytes[16..24].try_into().context("ciphertext_len")?);
        let crc32 = u32::from_be_bytes(bytes[24..28].try_into().context("crc32")?);

        Ok(Self {
            version,
            flags,
            plaintext_len,
            ciphertext_len,
            crc32,
        })
    }

    /// Validates the transport CRC against an actually-received ciphertext
    /// buffer, the first of the three integrity layers named in §4.4.
    pub fn check_ciphertext_crc(&self, ciphertext: &[u8]) -> anyhow::Result<()> {
        ensure!(
            ciphertext.len() as u64 == self.ciphertext_len,
            "ciphertext length mismatch: header says {}, got {}",
            self.ciphertext_len,
            ciphertext.len()
        );
        let actual = crc32fast::hash(ciphertext);
        ensure!(actual == self.crc32, "ciphertext transport CRC mismatch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let ciphertext = b"pretend-ciphertext-bytes";
        let header = WireHeader::new(42, ciphertext.len() as u64, ciphertext);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), WIRE_HEADER_LEN);
        let parsed = WireHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        parsed.check_ciphertext_crc(ciphertext).unwrap();
    }

    #[test]
    fn corrupted_header_crc_is_rejected() {
        let ciphertext = b"abc";
        let header = WireHeader::new(3, 3, ciphertext);
        let mut bytes = header.to_bytes();
        bytes[10] ^= 0xff;
        assert!(WireHeader::from_bytes(&bytes).is_err());
    }
}
