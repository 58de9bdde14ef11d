use crate::schnorr::{self, PublicCommitment, SchnorrProof};
use anyhow::{bail, Context};
use chrono::{DateTime, Duration, Utc};
use curve25519_dalek::scalar::Scalar;
use rand_core::{CryptoRng, OsRng, RngCore};
use std::path::{Path, PathBuf};
use usync_common::UsyncError;
use zeroize::Zeroize;

/// Challenges are valid for at most this long, per §4.1.
const CHALLENGE_LIFETIME_SECS: i64 = 60;

pub use crate::schnorr::SchnorrProof as Proof;

/// A single-use, time-bounded challenge issued by a verifier. Carries its
/// own issuance time so `verify_proof` can enforce the ≤60s lifetime
/// without any external state, keeping verification itself stateless;
/// single-use replay protection is the caller's responsibility (e.g. the
/// Resolver tracks consumed nonces), since that requires state that
/// outlives a single verification call.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub nonce: [u8; 32],
    pub issued_at: DateTime<Utc>,
}

impl Challenge {
    pub fn issue(rng: &mut impl RngCore) -> Self {
        let mut nonce = [0u8; 32];
        rng.fill_bytes(&mut nonce);
        Self {
            nonce,
            issued_at: Utc::now(),
        }
    }

    fn is_fresh(&self) -> bool {
        Utc::now() - self.issued_at <= Duration::seconds(CHALLENGE_LIFETIME_SECS)
    }

    fn transcript(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(40);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.issued_at.timestamp().to_be_bytes());
        bytes
    }
}

/// Abstracts "host-protected storage" for the permanent identity secret
/// `S` (§4.1). The core never assumes a particular OS keychain; a
/// collaborator may supply one, a file-backed store is provided for
/// environments without one.
pub trait IdentitySecretStore {
    /// Returns the stored secret together with the `intent` tag it was
    /// initialized under, if any.
    fn load(&self) -> anyhow::Result<Option<([u8; 32], String)>>;
    fn save(&self, secret: &[u8; 32], intent: &str) -> anyhow::Result<()>;
}

/// An in-memory store, useful for tests and for installations that
/// re-derive or rehydrate the secret from elsewhere before constructing
/// `Identity`.
#[derive(Default)]
pub struct MemorySecretStore {
    inner: std::sync::Mutex<Option<([u8; 32], String)>>,
}

impl IdentitySecretStore for MemorySecretStore {
    fn load(&self) -> anyhow::Result<Option<([u8; 32], String)>> {
        Ok(self.inner.lock().unwrap().clone())
    }

    fn save(&self, secret: &[u8; 32], intent: &str) -> anyhow::Result<()> {
        *self.inner.lock().unwrap() = Some((*secret, intent.to_string()));
        Ok(())
    }
}

/// A file-backed store. Restricts permissions to the owner on unix; this
/// is the closest a portable core can get to "protected local storage"
/// without depending on a platform keychain, which belongs to the
/// excluded desktop-shell layer.
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Sibling file holding the intent tag the secret was saved under;
    /// kept separate so the secret file itself stays exactly 32 bytes.
    fn intent_path(&self) -> PathBuf {
        self.path.with_extension("intent")
    }
}

impl IdentitySecretStore for FileSecretStore {
    fn load(&self) -> anyhow::Result<Option<([u8; 32], String)>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path).context("reading identity secret file")?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity secret file has unexpected length"))?;
        let intent = std::fs::read_to_string(self.intent_path()).unwrap_or_default();
        Ok(Some((secret, intent)))
    }

    fn save(&self, secret: &[u8; 32], intent: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("creating identity secret directory")?;
        }
        std::fs::write(&self.path, secret).context("writing identity secret file")?;
        std::fs::write(self.intent_path(), intent).context("writing identity intent file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .context("restricting identity secret file permissions")?;
            std::fs::set_permissions(self.intent_path(), std::fs::Permissions::from_mode(0o600))
                .context("restricting identity intent file permissions")?;
        }
        Ok(())
    }
}

/// The permanent per-installation Identity (§4.1). `S` never leaves the
/// process after construction; it is held only long enough to derive the
/// Schnorr keypair and is zeroized immediately after.
pub struct Identity {
    scalar: Scalar,
    commitment: PublicCommitment,
}

impl Identity {
    /// Generates `S` on first call, persists it (and `intent`) via
    /// `store`, and returns the hex `user_id`. On subsequent calls against
    /// an already-populated store with a matching `intent`, rehydrates
    /// the existing identity instead of generating a new one — `S`
    /// "cannot be reissued" per §3. A subsequent call with a different
    /// `intent` fails with `AlreadyInitialized` rather than silently
    /// rehydrating an identity issued for a different purpose.
    pub fn ensure_identity(store: &impl IdentitySecretStore, intent: &str) -> anyhow::Result<Self> {
        match store
            .load()
            .map_err(|e| anyhow::anyhow!("storage unavailable: {e}"))?
        {
            Some((mut secret, stored_intent)) => {
                if stored_intent != intent {
                    return Err(UsyncError::AlreadyInitialized.into());
                }
                let identity = Self::from_secret(&secret);
                secret.zeroize();
                Ok(identity)
            }
            None => {
                let mut secret = [0u8; 32];
                OsRng.fill_bytes(&mut secret);
                store
                    .save(&secret, intent)
                    .map_err(|e| anyhow::anyhow!("storage unavailable: {e}"))?;
                let identity = Self::from_secret(&secret);
                secret.zeroize();
                Ok(identity)
            }
        }
    }

    fn from_secret(secret: &[u8; 32]) -> Self {
        let (scalar, commitment) = schnorr::keypair_from_seed(secret);
        Self { scalar, commitment }
    }

    /// The hex-encoded public commitment, used as `user_id` everywhere
    /// else in the Catalog.
    pub fn user_id(&self) -> String {
        self.commitment.to_hex()
    }

    pub fn commitment(&self) -> PublicCommitment {
        self.commitment
    }

    /// Produces a proof that this Identity holds the secret behind its
    /// commitment, bound to `challenge`.
    pub fn prove_access(&self, challenge: &Challenge, rng: &mut (impl RngCore + CryptoRng)) -> Proof {
        schnorr::prove(&self.scalar, &challenge.transcript(), rng)
    }

    /// Unwraps a PRIVATE share's `K_share` entry addressed to this
    /// Identity. The scalar behind `self.commitment()` never leaves this
    /// call; only `crate::keying` sees it, the same boundary
    /// `prove_access` already keeps.
    pub fn unwrap_share_key(
        &self,
        folder_public: &PublicCommitment,
        access_salt: &[u8; 16],
        user_index: u32,
        wrapped: &[u8; 48],
    ) -> anyhow::Result<[u8; 32]> {
        crate::keying::unwrap_share_key(&self.scalar, folder_public, access_salt, user_index, wrapped)
    }
}

/// Verifies a proof against a commitment and challenge. Rejects stale
/// challenges (> 60s old) before doing any curve arithmetic.
pub fn verify_proof(
    commitment: &PublicCommitment,
    challenge: &Challenge,
    proof: &Proof,
) -> anyhow::Result<bool> {
    if !challenge.is_fresh() {
        bail!("challenge expired");
    }
    schnorr::verify(commitment, &challenge.transcript(), proof)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_identity_persists_across_calls() {
        let store = MemorySecretStore::default();
        let first = Identity::ensure_identity(&store, "default").unwrap();
        let second = Identity::ensure_identity(&store, "default").unwrap();
        assert_eq!(first.user_id(), second.user_id());
    }

    #[test]
    fn ensure_identity_rejects_mismatched_intent() {
        let store = MemorySecretStore::default();
        Identity::ensure_identity(&store, "default").unwrap();
        let err = Identity::ensure_identity(&store, "other").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UsyncError>(),
            Some(UsyncError::AlreadyInitialized)
        ));
    }

    #[test]
    fn prove_and_verify_round_trip() {
        let store = MemorySecretStore::default();
        let identity = Identity::ensure_identity(&store, "default").unwrap();
        let challenge = Challenge::issue(&mut OsRng);
        let proof = identity.prove_access(&challenge, &mut OsRng);
        assert!(verify_proof(&identity.commitment(), &challenge, &proof).unwrap());
    }

    #[test]
    fn verify_rejects_stale_challenge() {
        let store = MemorySecretStore::default();
        let identity = Identity::ensure_identity(&store, "default").unwrap();
        let mut challenge = Challenge::issue(&mut OsRng);
        challenge.issued_at = Utc::now() - Duration::seconds(120);
        let proof = identity.prove_access(&challenge, &mut OsRng);
        assert!(verify_proof(&identity.commitment(), &challenge, &proof).is_err());
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile_dir();
        let store = FileSecretStore::new(dir.join("identity.secret"));
        let first = Identity::ensure_identity(&store, "default").unwrap();
        let second = Identity::ensure_identity(&store, "default").unwrap();
        assert_eq!(first.user_id(), second.user_id());
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("usync-identity-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
