//! A hand-rolled Schnorr sigma-protocol over the Ristretto group, shared
//! by `Identity`'s zero-knowledge access proofs and `FolderKey`'s
//! CoreIndex signatures. Built directly on `curve25519-dalek` rather than
//! pulling in a separate signature crate, the way the teacher builds its
//! own accumulator math on `num-bigint-dig` instead of an off-the-shelf
//! accumulator library.

use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_POINT, ristretto::CompressedRistretto, scalar::Scalar,
    RistrettoPoint,
};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

/// A public commitment `P = x·G`, compressed to 32 bytes. This is the
/// value spec.md calls `P = H(S)` for Identity (§3/§4.1) and the public
/// half of a FolderKey (§3); see DESIGN.md for why the spec's "`H`" is
/// read as this derivation rather than a literal hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicCommitment(pub [u8; 32]);

impl PublicCommitment {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn point(&self) -> anyhow::Result<RistrettoPoint> {
        CompressedRistretto(self.0)
            .decompress()
            .ok_or_else(|| anyhow::anyhow!("commitment is not a valid Ristretto point"))
    }
}

/// A Schnorr proof-of-knowledge / signature: `(R, s)` such that
/// `s·G == R + e·P` where `e = H(R || P || message)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchnorrProof {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl SchnorrProof {
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.r);
        out[32..].copy_from_slice(&self.s);
        out
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Self { r, s }
    }
}

/// Derives the scalar `x` and public commitment `P = x·G` deterministically
/// from a 32-byte secret seed.
pub fn keypair_from_seed(seed: &[u8; 32]) -> (Scalar, PublicCommitment) {
    let scalar = Scalar::hash_from_bytes::<Sha512>(seed);
    let point = RISTRETTO_BASEPOINT_POINT * scalar;
    (scalar, PublicCommitment(point.compress().to_bytes()))
}

fn challenge_scalar(r_point: &RistrettoPoint, p: &PublicCommitment, message: &[u8]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(r_point.compress().as_bytes());
    hasher.update(p.0);
    hasher.update(message);
    Scalar::from_hash(hasher)
}

/// Produces a proof binding `scalar` (the prover's secret) to `message`.
/// Used both for `Identity::prove_access` (message = challenge bytes) and
/// `FolderKey` CoreIndex signing (message = CoreIndex bytes).
pub fn prove(scalar: &Scalar, message: &[u8], rng: &mut (impl RngCore + CryptoRng)) -> SchnorrProof {
    let p = PublicCommitment((RISTRETTO_BASEPOINT_POINT * scalar).compress().to_bytes());
    let mut nonce_bytes = [0u8; 64];
    rng.fill_bytes(&mut nonce_bytes);
    let k = Scalar::hash_from_bytes::<Sha512>(&nonce_bytes);
    let r_point = RISTRETTO_BASEPOINT_POINT * k;
    let e = challenge_scalar(&r_point, &p, message);
    let s = k + e * scalar;

    SchnorrProof {
        r: r_point.compress().to_bytes(),
        s: s.to_bytes(),
    }
}

/// Verifies a proof against a public commitment and message. Constant-time
/// in the final comparison per §4.1; pure and stateless (callers are
/// responsible for single-use/TTL enforcement on the challenge itself, see
/// `Identity::verify_proof`).
pub fn verify(p: &PublicCommitment, message: &[u8], proof: &SchnorrProof) -> anyhow::Result<bool> {
    let p_point = p.point()?;
    let r_point = CompressedRistretto(proof.r)
        .decompress()
        .ok_or_else(|| anyhow::anyhow!("proof.r is not a valid Ristretto point"))?;
    let s = Scalar::from_canonical_bytes(proof.s)
        .into_option()
        .ok_or_else(|| anyhow::anyhow!("proof.s is not a canonical scalar"))?;

    let e = challenge_scalar(&r_point, p, message);
    let lhs = RISTRETTO_BASEPOINT_POINT * s;
    let rhs = r_point + p_point * e;

    Ok(lhs.compress().as_bytes().ct_eq(rhs.compress().as_bytes()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    #[test]
    fn proof_round_trips() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let seed = {
            let mut s = [0u8; 32];
            rng.fill_bytes(&mut s);
            s
        };
        let (scalar, p) = keypair_from_seed(&seed);
        let message = b"challenge-bytes";
        let proof = prove(&scalar, message, &mut rng);
        assert!(verify(&p, message, &proof).unwrap());
    }

    #[test]
    fn proof_rejects_wrong_commitment() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let (scalar, _) = keypair_from_seed(&{
            let mut s = [0u8; 32];
            rng.fill_bytes(&mut s);
            s
        });
        let (_, other_p) = keypair_from_seed(&{
            let mut s = [0u8; 32];
            rng.fill_bytes(&mut s);
            s
        });
        let message = b"challenge-bytes";
        let proof = prove(&scalar, message, &mut rng);
        assert!(!verify(&other_p, message, &proof).unwrap());
    }

    #[test]
    fn proof_rejects_wrong_message() {
        let mut rng = ChaCha20Rng::seed_from_u64(13);
        let seed = {
            let mut s = [0u8; 32];
            rng.fill_bytes(&mut s);
            s
        };
        let (scalar, p) = keypair_from_seed(&seed);
        let proof = prove(&scalar, b"first", &mut rng);
        assert!(!verify(&p, b"second", &proof).unwrap());
    }
}
