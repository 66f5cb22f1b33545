//! Assinaturas Ed25519 da camada de consenso

use ed25519_dalek::{ExpandedSecretKey, PublicKey, SecretKey, Signature};
use rand::rngs::OsRng;
use zeroize::Zeroize;

use crate::error::CoreError;
use crate::Result;

/// Tamanho em bytes de uma chave pública
pub const PUBLIC_KEY_BYTES: usize = 32;
/// Tamanho em bytes de uma chave secreta (seed)
pub const SECRET_KEY_BYTES: usize = 32;
/// Tamanho em bytes de uma assinatura destacada
pub const SIGNATURE_BYTES: usize = 64;

/// Chave pública em forma crua, como aparece no wire e nas saídas de transação
pub type PublicKeyBytes = [u8; PUBLIC_KEY_BYTES];

/// Par de chaves Ed25519 da carteira
///
/// As chaves são guardadas como bytes crus; os tipos do backend são
/// reconstruídos a cada uso. A chave secreta é zerada no drop.
pub struct KeyPair {
    pub public_key: PublicKeyBytes,
    secret_key: [u8; SECRET_KEY_BYTES],
}

impl KeyPair {
    /// Gera um novo par de chaves
    #[must_use]
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        let keypair = ed25519_dalek::Keypair::generate(&mut csprng);
        Self {
            public_key: keypair.public.to_bytes(),
            secret_key: keypair.secret.to_bytes(),
        }
    }

    /// Reconstrói um par de chaves a partir dos bytes crus
    ///
    /// # Errors
    ///
    /// Retorna erro se a chave secreta não corresponder a uma seed válida ou
    /// se a chave pública derivada não bater com a fornecida
    pub fn from_bytes(public_key: &[u8], secret_key: &[u8]) -> Result<Self> {
        let secret = SecretKey::from_bytes(secret_key)
            .map_err(|e| CoreError::CryptographicError(e.to_string()))?;
        let derived = PublicKey::from(&secret);
        if derived.as_bytes() != public_key {
            return Err(CoreError::CryptographicError(
                "chave pública não corresponde à secreta".to_string(),
            ));
        }
        Ok(Self {
            public_key: derived.to_bytes(),
            secret_key: secret.to_bytes(),
        })
    }

    /// Assina uma mensagem, produzindo uma assinatura destacada de 64 bytes
    ///
    /// # Errors
    ///
    /// Retorna erro se a chave secreta guardada for inválida
    pub fn sign(&self, message: &[u8]) -> Result<[u8; SIGNATURE_BYTES]> {
        let secret = SecretKey::from_bytes(&self.secret_key)
            .map_err(|e| CoreError::CryptographicError(e.to_string()))?;
        let public = PublicKey::from(&secret);
        let expanded = ExpandedSecretKey::from(&secret);
        Ok(expanded.sign(message, &public).to_bytes())
    }

    /// Returns the raw bytes of the secret key (config export)
    #[must_use]
    pub const fn secret_bytes(&self) -> &[u8; SECRET_KEY_BYTES] {
        &self.secret_key
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

/// Verifica uma assinatura destacada contra a chave pública dada
#[must_use]
pub fn verify(public_key: &PublicKeyBytes, message: &[u8], signature: &[u8]) -> bool {
    let Ok(public) = PublicKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_bytes(signature) else {
        return false;
    };
    public.verify_strict(message, &sig).is_ok()
}
