//! Transport keys and session encryption
//!
//! Each node holds a long-lived ed25519 keypair for identity and signing.
//! Every connection performs an ephemeral x25519 exchange; the resulting
//! shared secret and the handshake transcript feed HKDF-SHA256 to derive
//! one key per direction for ChaCha20-Poly1305.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, SharedSecret};

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature
    pub fn verify(
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8; 64],
    ) -> Result<(), CryptoError> {
        let verifying_key =
            VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::InvalidKeyLength)?;
        let sig = Signature::from_bytes(signature);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

/// X25519 ephemeral key exchange
pub struct EphemeralExchange {
    secret: EphemeralSecret,
    public: X25519Public,
}

impl EphemeralExchange {
    /// Generate new ephemeral keypair
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Perform key exchange and derive shared secret
    pub fn exchange(self, their_public: &[u8; 32]) -> SharedSecret {
        let their_public = X25519Public::from(*their_public);
        self.secret.diffie_hellman(&their_public)
    }
}

impl Default for EphemeralExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// Session cipher bound to one connection.
///
/// One key and one nonce counter per direction; both ends advance the
/// counters in lockstep, so nonces never repeat under a key.
pub struct SessionCipher {
    send: ChaCha20Poly1305,
    recv: ChaCha20Poly1305,
    send_counter: u64,
    recv_counter: u64,
}

impl SessionCipher {
    /// Derive directional session keys from the shared secret and the
    /// handshake transcript. The transcript binds the keys to the
    /// identities and ephemerals both sides observed.
    pub fn derive(
        shared: &SharedSecret,
        transcript: &[u8; 32],
        is_initiator: bool,
    ) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(transcript), shared.as_bytes());

        let mut i2r = [0u8; 32];
        let mut r2i = [0u8; 32];
        hkdf.expand(b"spacesync-i2r", &mut i2r)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        hkdf.expand(b"spacesync-r2i", &mut r2i)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let (send_key, recv_key) = if is_initiator { (i2r, r2i) } else { (r2i, i2r) };

        Ok(Self {
            send: ChaCha20Poly1305::new_from_slice(&send_key)
                .map_err(|_| CryptoError::InvalidKeyLength)?,
            recv: ChaCha20Poly1305::new_from_slice(&recv_key)
                .map_err(|_| CryptoError::InvalidKeyLength)?,
            send_counter: 0,
            recv_counter: 0,
        })
    }

    fn nonce(counter: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..12].copy_from_slice(&counter.to_le_bytes());
        *Nonce::from_slice(&bytes)
    }

    /// Seal an outgoing payload; `aad` is the frame type byte.
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Self::nonce(self.send_counter);
        self.send_counter += 1;
        self.send
            .encrypt(
                &nonce,
                chacha20poly1305::aead::Payload { msg: plaintext, aad },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Open an incoming payload; `aad` is the frame type byte.
    pub fn open(&mut self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Self::nonce(self.recv_counter);
        self.recv_counter += 1;
        self.recv
            .decrypt(
                &nonce,
                chacha20poly1305::aead::Payload { msg: ciphertext, aad },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
