// Secret codec (encryption-at-rest for store secrets)
//
// Provides:
// - Deterministic "is encrypted?" detection via a prefix
// - Authenticated encryption using AES-256-GCM
// - Lazy, file-backed master key stored under the store root
//
// The encrypted connection descriptor in each instance record, and any
// provider-specific secrets, go through this codec before touching disk.
// Decrypt treats unprefixed input as legacy plaintext so pre-hardening
// records keep working until the hardening migration rewrites them.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use std::path::PathBuf;
use tokio::sync::OnceCell;

const ENC_PREFIX: &str = "ENCv1:";
const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

#[derive(Debug)]
pub struct SecretCodec {
    key_path: PathBuf,
    key: OnceCell<[u8; KEY_BYTES]>,
}

impl SecretCodec {
    pub fn new(key_path: PathBuf) -> Self {
        Self {
            key_path,
            key: OnceCell::new(),
        }
    }

    pub fn is_encrypted(&self, value: &str) -> bool {
        value.starts_with(ENC_PREFIX)
    }

    pub async fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(ENC_PREFIX.to_string());
        }

        let key = *self.get_or_init_key().await?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| anyhow::anyhow!("Internal error: invalid AES-256 key length"))?;

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| anyhow::anyhow!("Failed to generate nonce"))?;

        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("Secret encryption failed"))?;

        // Store nonce || ciphertext (ciphertext includes GCM tag)
        let mut blob = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(format!(
            "{}{}",
            ENC_PREFIX,
            base64::engine::general_purpose::STANDARD.encode(blob)
        ))
    }

    pub async fn decrypt(&self, value: &str) -> Result<String> {
        if !self.is_encrypted(value) {
            // Backward compatibility: treat as plaintext
            return Ok(value.to_string());
        }

        let encoded = value.trim_start_matches(ENC_PREFIX);
        if encoded.is_empty() {
            return Ok(String::new());
        }

        let blob = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("Failed to base64-decode encrypted secret")?;

        if blob.len() < NONCE_BYTES {
            anyhow::bail!("Encrypted secret blob is too short");
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_BYTES);
        let nonce = Nonce::from_slice(nonce_bytes);

        let key = *self.get_or_init_key().await?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| anyhow::anyhow!("Internal error: invalid AES-256 key length"))?;

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow::anyhow!("Secret decryption failed"))?;
        let s = String::from_utf8(plaintext).context("Decrypted secret is not valid UTF-8")?;
        Ok(s)
    }

    async fn get_or_init_key(&self) -> Result<&[u8; KEY_BYTES]> {
        self.key
            .get_or_try_init(|| async {
                // Try load from disk; if missing, create.
                if tokio::fs::try_exists(&self.key_path).await.unwrap_or(false) {
                    let bytes = tokio::fs::read(&self.key_path).await.with_context(|| {
                        format!("Failed to read secret key file: {:?}", self.key_path)
                    })?;

                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(bytes)
                        .context("Failed to decode secret key file (base64)")?;

                    if decoded.len() != KEY_BYTES {
                        anyhow::bail!(
                            "Secret key file has invalid length (expected {KEY_BYTES} bytes)"
                        );
                    }

                    let mut key = [0u8; KEY_BYTES];
                    key.copy_from_slice(&decoded);
                    return Ok(key);
                }

                if let Some(parent) = self.key_path.parent() {
                    tokio::fs::create_dir_all(parent).await.with_context(|| {
                        format!("Failed to create secret key directory: {:?}", parent)
                    })?;
                }

                let mut key_bytes = [0u8; KEY_BYTES];
                SystemRandom::new()
                    .fill(&mut key_bytes)
                    .map_err(|_| anyhow::anyhow!("Failed to generate secret key"))?;

                let encoded = base64::engine::general_purpose::STANDARD.encode(key_bytes);

                // Atomic create-new to avoid races; if another run won the
                // race, reload its key instead of clobbering it.
                let mut opts = tokio::fs::OpenOptions::new();
                opts.write(true).create_new(true);
                match opts.open(&self.key_path).await {
                    Ok(mut file) => {
                        use tokio::io::AsyncWriteExt;
                        file.write_all(encoded.as_bytes()).await.with_context(|| {
                            format!("Failed to write secret key file: {:?}", self.key_path)
                        })?;
                        file.flush().await?;
                        Ok(key_bytes)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        let bytes = tokio::fs::read(&self.key_path).await.with_context(|| {
                            format!("Failed to read secret key file: {:?}", self.key_path)
                        })?;
                        let decoded = base64::engine::general_purpose::STANDARD
                            .decode(bytes)
                            .context("Failed to decode secret key file (base64)")?;
                        if decoded.len() != KEY_BYTES {
                            anyhow::bail!(
                                "Secret key file has invalid length (expected {KEY_BYTES} bytes)"
                            );
                        }
                        let mut key = [0u8; KEY_BYTES];
                        key.copy_from_slice(&decoded);
                        Ok(key)
                    }
                    Err(e) => Err(anyhow::Error::new(e)).with_context(|| {
                        format!("Failed to create secret key file: {:?}", self.key_path)
                    }),
                }
            })
            .await
            .map(|k| k as &[u8; KEY_BYTES])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec_in(dir: &std::path::Path) -> SecretCodec {
        SecretCodec::new(dir.join("secrets").join("master_key.b64"))
    }

    #[tokio::test]
    async fn encrypt_then_decrypt_round_trips() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let codec = codec_in(tmp.path());

        let descriptor = "server=db1;database=demoshopdb;user=shopserve;password=s3cret";
        let blob = codec.encrypt(descriptor).await.expect("encrypt");
        assert!(codec.is_encrypted(&blob));
        assert!(!blob.contains("s3cret"));

        let back = codec.decrypt(&blob).await.expect("decrypt");
        assert_eq!(back, descriptor);
    }

    #[tokio::test]
    async fn decrypt_passes_plaintext_through() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let codec = codec_in(tmp.path());

        let back = codec.decrypt("server=legacy;database=old").await.expect("decrypt");
        assert_eq!(back, "server=legacy;database=old");
    }

    #[tokio::test]
    async fn key_persists_across_codec_instances() {
        let tmp = tempfile::tempdir().expect("tempdir");

        let blob = codec_in(tmp.path()).encrypt("v").await.expect("encrypt");
        let back = codec_in(tmp.path()).decrypt(&blob).await.expect("decrypt");
        assert_eq!(back, "v");
    }

    #[tokio::test]
    async fn corrupted_blob_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let codec = codec_in(tmp.path());
        assert!(codec.decrypt("ENCv1:!!!not-base64!!!").await.is_err());
    }
}
