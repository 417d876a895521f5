//! Signing, verification and hashing
//!
//! Keys are ed25519; an address is the raw verifying key. Hashes are BLAKE3.

use crate::types::{Address, Hash, Signature};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Node or wallet signing key
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh key from OS entropy
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic key from a 32-byte secret
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn address(&self) -> Address {
        Address(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }

    fn secret(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair").field("address", &self.address()).finish()
    }
}

/// Verify `signature` over `message` by the key behind `address`
pub fn verify(
    address: &Address,
    message: &[u8],
    signature: &Signature,
) -> Result<(), ed25519_dalek::SignatureError> {
    let key = VerifyingKey::from_bytes(address.as_bytes())?;
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    key.verify(message, &sig)
}

/// BLAKE3 digest
pub fn hash(data: &[u8]) -> Hash {
    Hash(*blake3::hash(data).as_bytes())
}

/// On-disk key file (JSON)
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyFile {
    /// base58 secret key
    pub secret: String,
    /// base58 address, informational
    pub address: Address,
}

impl KeyFile {
    pub fn from_keypair(keypair: &Keypair) -> Self {
        Self {
            secret: bs58::encode(keypair.secret()).into_string(),
            address: keypair.address(),
        }
    }

    pub fn keypair(&self) -> anyhow::Result<Keypair> {
        let bytes = bs58::decode(&self.secret).into_vec()?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Secret key must be 32 bytes, got {}", bytes.len()))?;
        Ok(Keypair::from_seed(seed))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Keypair> {
        let data = std::fs::read_to_string(path)?;
        let file: KeyFile = serde_json::from_str(&data)?;
        file.keypair()
    }

    /// Load the key at `path`, creating and saving a new one if absent
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> anyhow::Result<Keypair> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        tracing::info!("No key file at {:?}, generating a new key", path);
        let keypair = Keypair::generate();
        Self::from_keypair(&keypair).save(path)?;
        Ok(keypair)
    }
}
