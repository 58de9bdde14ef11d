//! Identity, per-folder/per-segment keying, AEAD segment encryption and
//! wire framing, and the Ristretto-based Schnorr primitive shared by
//! Identity proofs and CoreIndex signatures.

mod aead;
mod identity;
mod keying;
mod schnorr;
mod wire;

pub use aead::{decrypt_segment, encrypt_segment};
pub use identity::{
    verify_proof, Challenge, FileSecretStore, Identity, IdentitySecretStore, MemorySecretStore,
    Proof,
};
pub use keying::{
    derive_password_key, derive_segment_key, derive_segment_nonce, unwrap_share_key,
    unwrap_with_key, wrap_share_key, wrap_with_key, FolderKeyPair, PasswordParams, SegmentKey,
};
pub use schnorr::{PublicCommitment, SchnorrProof};
pub use wire::{WireHeader, WIRE_HEADER_LEN};

pub type Result<T> = anyhow::Result<T>;
