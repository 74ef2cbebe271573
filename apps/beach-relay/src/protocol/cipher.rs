use bytes::Bytes;

use super::Scope;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Session encryption supplied by the embedding application.
///
/// The relay only ever stores and forwards the ciphertext this produces.
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, scope: &Scope, plaintext: Bytes) -> Result<Bytes, CipherError>;
    fn decrypt(&self, scope: &Scope, ciphertext: Bytes) -> Result<Bytes, CipherError>;
}

/// Passthrough for deployments whose transport already encrypts.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextCipher;

impl PayloadCipher for PlaintextCipher {
    fn encrypt(&self, _scope: &Scope, plaintext: Bytes) -> Result<Bytes, CipherError> {
        Ok(plaintext)
    }

    fn decrypt(&self, _scope: &Scope, ciphertext: Bytes) -> Result<Bytes, CipherError> {
        Ok(ciphertext)
    }
}
