use crate::schnorr::{self, PublicCommitment, SchnorrProof};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use curve25519_dalek::{ristretto::CompressedRistretto, scalar::Scalar};
use hkdf::Hkdf;
use rand_core::{CryptoRng, RngCore};
use scrypt::Params as ScryptParams;
use sha2::Sha256;

/// A per-segment content key and nonce, derived per §4.2:
/// `K = KDF(root_secret, folder_id || file_hash || segment_index)`,
/// `N = KDF(K, "nonce")[0..12]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
    pub key: [u8; 32],
    pub nonce: [u8; 12],
}

/// Derives the content key for one segment. `root_secret` is the
/// folder's 32-byte root, persisted in the Catalog per §4.2.
pub fn derive_segment_key(
    root_secret: &[u8; 32],
    folder_id: &str,
    file_hash: &[u8; 32],
    segment_index: u64,
) -> SegmentKey {
    let hk = Hkdf::<Sha256>::new(None, root_secret);
    let mut info = Vec::with_capacity(folder_id.len() + 32 + 8);
    info.extend_from_slice(folder_id.as_bytes());
    info.extend_from_slice(file_hash);
    info.extend_from_slice(&segment_index.to_be_bytes());

    let mut key = [0u8; 32];
    hk.expand(&info, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");

    SegmentKey {
        key,
        nonce: derive_segment_nonce(&key),
    }
}

/// `N = KDF(K, "nonce")[0..12]`, split out so callers that already hold a
/// `SegmentKey.key` (e.g. after reloading from the Catalog) can
/// recompute the nonce without re-deriving the key.
pub fn derive_segment_nonce(key: &[u8; 32]) -> [u8; 12] {
    let hk = Hkdf::<Sha256>::new(None, key);
    let mut nonce = [0u8; 12];
    hk.expand(b"nonce", &mut nonce)
        .expect("12 bytes is a valid HKDF-SHA256 output length");
    nonce
}

/// A folder's long-term signing keypair (§3 FolderKey). Built on the same
/// Ristretto Schnorr primitive as `Identity`; see DESIGN.md for why a
/// single hand-rolled primitive serves both roles instead of bringing in
/// a second signature scheme.
pub struct FolderKeyPair {
    scalar: Scalar,
    pub public: PublicCommitment,
}

impl FolderKeyPair {
    /// Generates a fresh keypair when a folder is first registered.
    pub fn generate(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let (scalar, public) = schnorr::keypair_from_seed(seed);
        Self { scalar, public }
    }

    /// Signs the CoreIndex bytes (everything preceding the signature
    /// field, per §6).
    pub fn sign(&self, message: &[u8], rng: &mut (impl RngCore + CryptoRng)) -> SchnorrProof {
        schnorr::prove(&self.scalar, message, rng)
    }

    pub fn verify(public: &PublicCommitment, message: &[u8], sig: &SchnorrProof) -> anyhow::Result<bool> {
        schnorr::verify(public, message, sig)
    }
}

/// scrypt parameters for PROTECTED shares (§4.2, §9 Open Question
/// decision 4): `log_n = 15, r = 8, p = 1`, the library's recommended
/// interactive-use defaults, persisted per-share alongside the salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl Default for PasswordParams {
    fn default() -> Self {
        Self {
            log_n: 15,
            r: 8,
            p: 1,
        }
    }
}

/// Derives a 32-byte key from a password and salt via scrypt, for
/// PROTECTED shares.
pub fn derive_password_key(
    password: &str,
    salt: &[u8; 16],
    params: PasswordParams,
) -> anyhow::Result<[u8; 32]> {
    let scrypt_params = ScryptParams::new(params.log_n, params.r, params.p, 32)
        .map_err(|e| anyhow::anyhow!("invalid scrypt parameters: {e}"))?;
    let mut out = [0u8; 32];
    scrypt::scrypt(password.as_bytes(), salt, &scrypt_params, &mut out)
        .map_err(|e| anyhow::anyhow!("scrypt derivation failed: {e}"))?;
    Ok(out)
}

fn shared_point_bytes(scalar: &Scalar, other: &PublicCommitment) -> anyhow::Result<[u8; 32]> {
    let other_point = CompressedRistretto(other.0)
        .decompress()
        .ok_or_else(|| anyhow::anyhow!("peer commitment is not a valid Ristretto point"))?;
    Ok((other_point * scalar).compress().to_bytes())
}

fn wrap_cipher_material(
    shared: &[u8; 32],
    access_salt: &[u8; 16],
    user_index: u32,
) -> ([u8; 32], [u8; 12]) {
    let hk = Hkdf::<Sha256>::new(Some(access_salt), shared);
    let mut info = Vec::with_capacity(8 + 4);
    info.extend_from_slice(b"wrap-key");
    info.extend_from_slice(&user_index.to_be_bytes());
    let mut key = [0u8; 32];
    hk.expand(&info, &mut key).expect("valid HKDF length");

    let mut nonce_info = Vec::with_capacity(10 + 4);
    nonce_info.extend_from_slice(b"wrap-nonce");
    nonce_info.extend_from_slice(&user_index.to_be_bytes());
    let mut nonce = [0u8; 12];
    hk.expand(&nonce_info, &mut nonce).expect("valid HKDF length");

    (key, nonce)
}

/// Wraps `k_share` for one authorized user, per §4.6 PRIVATE access
/// blocks: `WRAP(Pᵢ, K_share)`. Implemented as a Ristretto
/// Diffie-Hellman between the folder's own keypair and the user's public
/// commitment, feeding a ChaCha20-Poly1305 AEAD encryption of the share
/// key (32-byte ciphertext + 16-byte tag = the 48-byte `wrapped_key`
/// field in §6's binary layout). `access_salt` is fresh per publish
/// (DESIGN.md Open Question decision 5) so republishing never reuses a
/// key/nonce pair even for the same user.
pub fn wrap_share_key(
    folder_keys: &FolderKeyPair,
    user_commitment: &PublicCommitment,
    access_salt: &[u8; 16],
    user_index: u32,
    k_share: &[u8; 32],
) -> anyhow::Result<[u8; 48]> {
    let shared = shared_point_bytes(&folder_keys.scalar, user_commitment)?;
    let (key, nonce) = wrap_cipher_material(&shared, access_salt, user_index);
    let cipher = ChaCha20Poly1305::new_from_slice(&key).expect("32-byte key");
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), k_share.as_slice())
        .map_err(|e| anyhow::anyhow!("share key wrap failed: {e}"))?;
    ciphertext
        .try_into()
        .map_err(|_| anyhow::anyhow!("unexpected wrapped key length"))
}

/// Unwraps a share key on the authorized user's side: the user supplies
/// their own Schnorr scalar (never transmitted) and the folder's public
/// commitment (from the CoreIndex header).
pub fn unwrap_share_key(
    user_scalar: &Scalar,
    folder_public: &PublicCommitment,
    access_salt: &[u8; 16],
    user_index: u32,
    wrapped: &[u8; 48],
) -> anyhow::Result<[u8; 32]> {
    let shared = shared_point_bytes(user_scalar, folder_public)?;
    let (key, nonce) = wrap_cipher_material(&shared, access_salt, user_index);
    let cipher = ChaCha20Poly1305::new_from_slice(&key).expect("32-byte key");
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), wrapped.as_slice())
        .map_err(|_| anyhow::anyhow!("share key unwrap failed: wrong identity or corrupted data"))?;
    plaintext
        .try_into()
        .map_err(|_| anyhow::anyhow!("unexpected unwrapped key length"))
}

/// Wraps `k_share` under a password-derived key for PROTECTED shares
/// (§4.6). Uses an all-zero nonce: safe here because `key` is always a
/// fresh `derive_password_key` output tied to a salt that is regenerated
/// on every publish (Open Question decision 5 extended to PROTECTED),
/// so the same (key, nonce) pair is never reused.
pub fn wrap_with_key(key: &[u8; 32], k_share: &[u8; 32]) -> anyhow::Result<[u8; 48]> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).expect("32-byte key");
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), k_share.as_slice())
        .map_err(|e| anyhow::anyhow!("share key wrap failed: {e}"))?;
    ciphertext
        .try_into()
        .map_err(|_| anyhow::anyhow!("unexpected wrapped key length"))
}

/// Reverses `wrap_with_key`.
pub fn unwrap_with_key(key: &[u8; 32], wrapped: &[u8; 48]) -> anyhow::Result<[u8; 32]> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).expect("32-byte key");
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&[0u8; 12]), wrapped.as_slice())
        .map_err(|_| anyhow::anyhow!("share key unwrap failed: wrong password or corrupted data"))?;
    plaintext
        .try_into()
        .map_err(|_| anyhow::anyhow!("unexpected unwrapped key length"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn segment_keys_are_unique_per_index() {
        let root = [1u8; 32];
        let file_hash = [2u8; 32];
        let k0 = derive_segment_key(&root, "folder", &file_hash, 0);
        let k1 = derive_segment_key(&root, "folder", &file_hash, 1);
        assert_ne!(k0.key, k1.key);
        assert_ne!(k0.nonce, k1.nonce);
    }

    #[test]
    fn password_key_is_deterministic_for_same_salt() {
        let salt = [9u8; 16];
        let a = derive_password_key("correct horse", &salt, PasswordParams::default()).unwrap();
        let b = derive_password_key("correct horse", &salt, PasswordParams::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn wrong_password_derives_different_key() {
        let salt = [9u8; 16];
        let a = derive_password_key("correct horse", &salt, PasswordParams::default()).unwrap();
        let b = derive_password_key("wrong", &salt, PasswordParams::default()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrap_unwrap_round_trips_for_authorized_user() {
        let folder_keys = FolderKeyPair::generate(&mut OsRng);
        let (user_scalar, user_pub) = schnorr::keypair_from_seed(&[5u8; 32]);
        let access_salt = [3u8; 16];
        let k_share = [42u8; 32];

        let wrapped = wrap_share_key(&folder_keys, &user_pub, &access_salt, 0, &k_share).unwrap();
        let unwrapped =
            unwrap_share_key(&user_scalar, &folder_keys.public, &access_salt, 0, &wrapped).unwrap();
        assert_eq!(unwrapped, k_share);
    }

    #[test]
    fn unauthorized_user_cannot_unwrap() {
        let folder_keys = FolderKeyPair::generate(&mut OsRng);
        let (_, user_pub) = schnorr::keypair_from_seed(&[5u8; 32]);
        let (other_scalar, _) = schnorr::keypair_from_seed(&[6u8; 32]);
        let access_salt = [3u8; 16];
        let k_share = [42u8; 32];

        let wrapped = wrap_share_key(&folder_keys, &user_pub, &access_salt, 0, &k_share).unwrap();
        let result = unwrap_share_key(&other_scalar, &folder_keys.public, &access_salt, 0, &wrapped);
        assert!(result.is_err());
    }

    #[test]
    fn password_wrap_unwrap_round_trips() {
        let salt = [4u8; 16];
        let key = derive_password_key("correct horse", &salt, PasswordParams::default()).unwrap();
        let k_share = [7u8; 32];
        let wrapped = wrap_with_key(&key, &k_share).unwrap();
        let unwrapped = unwrap_with_key(&key, &wrapped).unwrap();
        assert_eq!(unwrapped, k_share);
    }

    #[test]
    fn wrong_password_key_cannot_unwrap() {
        let salt = [4u8; 16];
        let right = derive_password_key("correct horse", &salt, PasswordParams::default()).unwrap();
        let wrong = derive_password_key("wrong", &salt, PasswordParams::default()).unwrap();
        let k_share = [7u8; 32];
        let wrapped = wrap_with_key(&right, &k_share).unwrap();
        assert!(unwrap_with_key(&wrong, &wrapped).is_err());
    }
}
