use crate::keying::SegmentKey;
use crate::wire::WireHeader;
use anyhow::{ensure, Context};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};

/// AEAD-encrypts a segment's plaintext and prepends the 32-byte wire
/// header, per §4.4. The yEnc-class text encoding that follows for
/// posting is applied by `usync-nntp`, which owns the article body.
pub fn encrypt_segment(key: &SegmentKey, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(&key.key)
        .map_err(|e| anyhow::anyhow!("invalid segment key: {e}"))?;
    let nonce = Nonce::from_slice(&key.nonce);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("segment AEAD encryption failed: {e}"))?;

    let header = WireHeader::new(plaintext.len() as u64, ciphertext.len() as u64, &ciphertext);
    let mut framed = Vec::with_capacity(crate::wire::WIRE_HEADER_LEN + ciphertext.len());
    framed.extend_from_slice(&header.to_bytes());
    framed.extend_from_slice(&ciphertext);
    Ok(framed)
}

/// Reverses `encrypt_segment`: parses the wire header, checks the
/// transport CRC, AEAD-decrypts, and returns the plaintext. Callers are
/// expected to additionally check `sha256(plaintext) == segment.plaintext_sha256`
/// (the third integrity layer named in §4.4); that check lives in
/// `usync-segment` since it needs the Segment record, not just the key.
pub fn decrypt_segment(key: &SegmentKey, framed: &[u8]) -> anyhow::Result<Vec<u8>> {
    ensure!(
        framed.len() >= crate::wire::WIRE_HEADER_LEN,
        "framed segment shorter than the wire header"
    );
    let (header_bytes, ciphertext) = framed.split_at(crate::wire::WIRE_HEADER_LEN);
    let header = WireHeader::from_bytes(header_bytes).context("parsing wire header")?;
    header.check_ciphertext_crc(ciphertext)?;

    let cipher = ChaCha20Poly1305::new_from_slice(&key.key)
        .map_err(|e| anyhow::anyhow!("invalid segment key: {e}"))?;
    let nonce = Nonce::from_slice(&key.nonce);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow::anyhow!("segment AEAD authentication failed"))?;

    ensure!(
        plaintext.len() as u64 == header.plaintext_len,
        "decrypted length does not match header plaintext_len"
    );
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keying::derive_segment_key;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let key = derive_segment_key(&[7u8; 32], "folder-1", &[1u8; 32], 0);
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let framed = encrypt_segment(&key, plaintext).unwrap();
        let decrypted = decrypt_segment(&key, &framed).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = derive_segment_key(&[7u8; 32], "folder-1", &[1u8; 32], 0);
        let mut framed = encrypt_segment(&key, b"hello world").unwrap();
        let last = framed.len() - 1;
        framed[last] ^= 0xff;
        assert!(decrypt_segment(&key, &framed).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let key = derive_segment_key(&[7u8; 32], "folder-1", &[1u8; 32], 0);
        let other = derive_segment_key(&[7u8; 32], "folder-1", &[1u8; 32], 1);
        let framed = encrypt_segment(&key, b"hello world").unwrap();
        assert!(decrypt_segment(&other, &framed).is_err());
    }
}
