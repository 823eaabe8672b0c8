//! Passphrase-based wrapping of folder keys.
//!
//! Each encrypted folder owns a random 32-byte key. The key itself never
//! touches the object store in the clear: it is sealed with AES-256-GCM
//! under a KEK derived from the owner's passphrase via PBKDF2-HMAC-SHA512.
//! Folder contents are untouched; only the folder metadata key is wrapped.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha512;

pub const PBKDF2_ITERATIONS: u32 = 120_000;
pub const FOLDER_KEY_LEN: usize = 32;
const KEK_LEN: usize = 32;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Wrapped folder key, fields raw (callers base64 them for the manifest).
#[derive(Debug, Clone)]
pub struct WrappedKey {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub salt: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid passphrase")]
pub struct InvalidPassphrase;

pub fn generate_folder_key() -> Vec<u8> {
    let mut key = vec![0u8; FOLDER_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn derive_kek(passphrase: &str, salt: &[u8]) -> [u8; KEK_LEN] {
    let mut kek = [0u8; KEK_LEN];
    pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut kek);
    kek
}

pub fn wrap_folder_key(passphrase: &str, folder_key: &[u8]) -> WrappedKey {
    let mut rng = rand::thread_rng();
    let mut salt = vec![0u8; SALT_LEN];
    rng.fill_bytes(&mut salt);
    let mut iv = vec![0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let kek = derive_kek(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&kek).expect("kek is exactly 32 bytes");
    // the aead crate appends the 16-byte tag to the ciphertext
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), folder_key)
        .expect("aes-gcm encryption is infallible for in-memory buffers");
    let auth_tag = sealed.split_off(sealed.len() - TAG_LEN);

    WrappedKey {
        ciphertext: sealed,
        iv,
        auth_tag,
        salt,
    }
}

/// Unseal a folder key. Any mismatch (wrong passphrase, corrupted record)
/// comes back as the same opaque [`InvalidPassphrase`].
pub fn unwrap_folder_key(passphrase: &str, wrapped: &WrappedKey) -> Result<Vec<u8>, InvalidPassphrase> {
    if wrapped.iv.len() != IV_LEN || wrapped.auth_tag.len() != TAG_LEN {
        return Err(InvalidPassphrase);
    }
    let kek = derive_kek(passphrase, &wrapped.salt);
    let cipher = Aes256Gcm::new_from_slice(&kek).expect("kek is exactly 32 bytes");

    let mut sealed = wrapped.ciphertext.clone();
    sealed.extend_from_slice(&wrapped.auth_tag);
    cipher
        .decrypt(Nonce::from_slice(&wrapped.iv), sealed.as_ref())
        .map_err(|_| InvalidPassphrase)
}

/// 256-bit random session token, hex-encoded.
pub fn generate_session_token() -> String {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_recovers_key() {
        let key = generate_folder_key();
        let wrapped = wrap_folder_key("correct horse", &key);
        let unwrapped = unwrap_folder_key("correct horse", &wrapped).unwrap();
        assert_eq!(unwrapped, key);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let key = generate_folder_key();
        let wrapped = wrap_folder_key("pass1234", &key);
        assert!(unwrap_folder_key("wrong999", &wrapped).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = generate_folder_key();
        let mut wrapped = wrap_folder_key("pass1234", &key);
        wrapped.ciphertext[0] ^= 0xff;
        assert!(unwrap_folder_key("pass1234", &wrapped).is_err());
    }

    #[test]
    fn field_shapes() {
        let wrapped = wrap_folder_key("pass1234", &generate_folder_key());
        assert_eq!(wrapped.salt.len(), 16);
        assert_eq!(wrapped.iv.len(), 12);
        assert_eq!(wrapped.auth_tag.len(), 16);
        assert_eq!(wrapped.ciphertext.len(), FOLDER_KEY_LEN);
    }

    #[test]
    fn session_tokens_are_256_bit_hex() {
        let token = generate_session_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_session_token());
    }
}
