use crate::ids::ShareId;
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};

const LOWER_ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Seeds a fresh CSPRNG the way `wnfs-nameaccumulator` seeds its own:
/// `ChaCha20Rng`, seeded from the OS entropy source rather than a fixed
/// seed, so every caller that needs "a CSPRNG" gets one without having to
/// know which concrete RNG type the rest of the workspace standardized on.
pub fn new_csprng() -> ChaCha20Rng {
    ChaCha20Rng::from_rng(rand_core::OsRng).expect("OS RNG must be available")
}

/// Samples `len` characters from `[a-z0-9]`. Used for `usenet_subject`
/// (len 20) and the `Message-ID` local part (len 16) per §4.3.
pub fn lowercase_alnum_token(rng: &mut impl RngCore, len: usize) -> String {
    (0..len)
        .map(|_| {
            let idx = (rng.next_u32() as usize) % LOWER_ALNUM.len();
            LOWER_ALNUM[idx] as char
        })
        .collect()
}

/// Samples a 24-character Base32 `share_id` per §4.6: 15 random bytes
/// encode to exactly 24 Base32 characters with no padding.
pub fn base32_token(rng: &mut impl RngCore) -> ShareId {
    let mut bytes = [0u8; 15];
    rng.fill_bytes(&mut bytes);
    let encoded = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes);
    debug_assert_eq!(encoded.len(), 24);
    ShareId::from_generated(encoded.to_ascii_lowercase())
}
