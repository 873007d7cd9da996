//! RSA signing key material for local actors

use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::AppError;

/// Modulus size for newly provisioned actor keys
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Public key id advertised for an actor
pub fn key_id_for_actor(actor_uri: &str) -> String {
    let actor = actor_uri.split('#').next().unwrap_or(actor_uri);
    format!("{}#main-key", actor)
}

/// Generate an RSA keypair as (PKCS#8 private PEM, SPKI public PEM).
///
/// CPU-bound; call from `spawn_blocking` on the async side.
pub fn generate_pem_keypair(bits: usize) -> Result<(String, String), AppError> {
    let mut rng = rand::thread_rng();
    let private_key =
        RsaPrivateKey::new(&mut rng, bits).map_err(|e| AppError::Internal(e.into()))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?;

    Ok((private_key_pem, public_key_pem))
}

/// Shared 1024-bit keypair so unit tests pay for generation once.
#[cfg(test)]
pub(crate) fn test_keypair() -> (&'static str, &'static str) {
    use std::sync::OnceLock;

    static KEYPAIR: OnceLock<(String, String)> = OnceLock::new();
    let (private_key_pem, public_key_pem) =
        KEYPAIR.get_or_init(|| generate_pem_keypair(1024).expect("test keypair"));
    (private_key_pem.as_str(), public_key_pem.as_str())
}
