use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use openssl::pkey::Private;
use openssl::rsa::{Padding, Rsa};
use tracing::{info, warn};

/// The node-local RSA keypair for the login handshake. Loaded from PEM
/// once at startup and cached; generated and persisted on first run.
pub struct RsaKeys {
    key: Rsa<Private>,
}

impl RsaKeys {
    pub fn load_or_generate(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            let pem = fs::read(path)
                .with_context(|| format!("reading rsa key {path}"))?;
            let key = Rsa::private_key_from_pem(&pem)
                .with_context(|| format!("parsing rsa key {path}"))?;
            return Ok(Self { key });
        }
        info!(path = %path, "no rsa key on disk, generating");
        let key = Rsa::generate(2048)?;
        if let Err(e) = fs::write(path, key.private_key_to_pem()?) {
            warn!(path = %path, "cannot persist rsa key: {e}");
        }
        Ok(Self { key })
    }

    pub fn generate() -> Result<Self> {
        Ok(Self {
            key: Rsa::generate(2048)?,
        })
    }

    /// `(E, N)` in hex, the shape `get_salt` hands to the client.
    pub fn public_parts(&self) -> Result<(String, String)> {
        Ok((
            self.key.e().to_hex_str()?.to_string(),
            self.key.n().to_hex_str()?.to_string(),
        ))
    }

    /// Decrypt a hex PKCS#1 v1.5 ciphertext into the salted plaintext.
    pub fn decrypt_hex(&self, ciphertext: &str) -> Result<String> {
        let ciphertext =
            hex::decode(ciphertext).context("ciphertext is not hex")?;
        let mut plaintext = vec![0; self.key.size() as usize];
        let n = self
            .key
            .private_decrypt(&ciphertext, &mut plaintext, Padding::PKCS1)
            .context("rsa decrypt")?;
        plaintext.truncate(n);
        String::from_utf8(plaintext).context("plaintext is not utf-8")
    }

    /// Client-side half of the handshake. The browser does this with the
    /// pubkey from `get_salt`; the server only needs it in tests.
    pub fn encrypt_hex(&self, plaintext: &str) -> Result<String> {
        let mut ciphertext = vec![0; self.key.size() as usize];
        let n = self.key.public_encrypt(
            plaintext.as_bytes(),
            &mut ciphertext,
            Padding::PKCS1,
        )?;
        ciphertext.truncate(n);
        Ok(hex::encode(ciphertext))
    }
}
