//! At-rest sealing of refresh tokens using ChaCha20-Poly1305.
//!
//! Refresh tokens are long-lived credentials, so `tokens.json` stores them as
//! `sealed:{nonce_hex}:{ciphertext_hex}` under a process-wide 256-bit key.
//! The key comes from configuration (`TOKEN_SEAL_KEY`, hex) or is generated
//! once and persisted next to the data directory with owner-only permissions.
//! Unprefixed values are passed through on read, so plaintext records written
//! by older deployments keep working.

use anyhow::{Context, bail};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use std::fmt;
use std::path::Path;

const SEALED_PREFIX: &str = "sealed:";

/// Process-wide sealing key.
#[derive(Clone)]
pub struct SealKey {
    key: [u8; 32],
}

impl fmt::Debug for SealKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealKey").finish_non_exhaustive()
    }
}

impl SealKey {
    /// Parse a 64-character hex key.
    pub fn from_hex(hex: &str) -> anyhow::Result<Self> {
        let bytes = decode_hex(hex.trim()).context("seal key is not valid hex")?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("seal key must be exactly 32 bytes"))?;
        Ok(Self { key })
    }

    /// Resolve the sealing key: configured value first, then the persisted
    /// key file, generating and persisting a fresh key when neither exists.
    pub fn load_or_generate(configured: Option<&str>, key_path: &Path) -> anyhow::Result<Self> {
        if let Some(hex) = configured {
            return Self::from_hex(hex);
        }
        if key_path.exists() {
            let hex = std::fs::read_to_string(key_path)
                .with_context(|| format!("failed to read seal key from {}", key_path.display()))?;
            return Self::from_hex(&hex);
        }

        let mut key = [0u8; 32];
        use rand::RngCore;
        rand::rng().fill_bytes(&mut key);

        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let hex: String = key.iter().map(|b| format!("{b:02x}")).collect();
        std::fs::write(key_path, &hex)
            .with_context(|| format!("failed to persist seal key to {}", key_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))
                .context("failed to restrict seal key permissions")?;
        }
        tracing::info!(path = %key_path.display(), "generated new token seal key");
        Ok(Self { key })
    }

    /// Seal a plaintext secret into the `sealed:{nonce}:{ciphertext}` form.
    pub fn seal(&self, plaintext: &str) -> anyhow::Result<String> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.key).expect("key is exactly 32 bytes");
        let nonce = ChaCha20Poly1305::generate_nonce(OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("sealing failed: {e}"))?;
        let nonce_hex: String = nonce.iter().map(|b| format!("{b:02x}")).collect();
        let ct_hex: String = ciphertext.iter().map(|b| format!("{b:02x}")).collect();
        Ok(format!("{SEALED_PREFIX}{nonce_hex}:{ct_hex}"))
    }

    /// Open a stored secret. Sealed values are decrypted and authenticated;
    /// unprefixed values are returned as-is.
    pub fn open(&self, stored: &str) -> anyhow::Result<String> {
        let Some(rest) = stored.strip_prefix(SEALED_PREFIX) else {
            return Ok(stored.to_owned());
        };
        let Some((nonce_hex, ct_hex)) = rest.split_once(':') else {
            bail!("malformed sealed value");
        };
        let nonce_bytes = decode_hex(nonce_hex).context("malformed sealed nonce")?;
        if nonce_bytes.len() != 12 {
            bail!("sealed nonce must be 12 bytes");
        }
        let ciphertext = decode_hex(ct_hex).context("malformed sealed ciphertext")?;

        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.key).expect("key is exactly 32 bytes");
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|e| anyhow::anyhow!("unsealing failed: {e}"))?;
        String::from_utf8(plaintext).context("unsealed value is not valid UTF-8")
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}
