//! Secret storage
//!
//! Values are sealed with AES-256-GCM under the daemon's master key. The
//! owning user's id is bound as associated data, so a ciphertext copied to
//! another user's record fails authentication instead of decrypting.
//!
//! Wire format: `base64(nonce[12] || ciphertext || tag[16])`.

use crate::lookup::Key;
use crate::store::Store;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Key as AesKey, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use nimbus_backend::Notifier;
use nimbus_core::model::{ActivityRecord, Secret, SecretView};
use nimbus_core::{CloudError, RequestContext, Result};
use rand::RngCore;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// AES-256-GCM keyed by the master key
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(master_key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(master_key)),
        }
    }

    /// Cipher under a fresh random key. Secrets do not survive a restart.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(&key)
    }

    pub fn encrypt(&self, user_id: Uuid, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let payload = Payload {
            msg: plaintext.as_bytes(),
            aad: user_id.as_bytes(),
        };
        let ciphertext = self
            .cipher
            .encrypt(&nonce, payload)
            .map_err(|_| CloudError::internal("secret encryption failed"))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, user_id: Uuid, sealed: &str) -> Result<String> {
        let raw = STANDARD
            .decode(sealed.trim())
            .map_err(|_| CloudError::invalid("ciphertext is not valid base64"))?;
        if raw.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CloudError::invalid(format!(
                "ciphertext too short: {} bytes (minimum {})",
                raw.len(),
                NONCE_SIZE + TAG_SIZE
            )));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        let payload = Payload {
            msg: ciphertext,
            aad: user_id.as_bytes(),
        };
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| CloudError::internal("secret decryption failed: authentication tag mismatch"))?;
        String::from_utf8(plaintext)
            .map_err(|e| CloudError::internal_from("decrypted secret is not UTF-8", e))
    }
}

pub struct SecretService {
    store: Arc<dyn Store>,
    cipher: SecretCipher,
    notifier: Notifier,
}

impl SecretService {
    pub fn new(store: Arc<dyn Store>, cipher: SecretCipher, notifier: Notifier) -> Self {
        Self {
            store,
            cipher,
            notifier,
        }
    }

    pub fn encrypt(&self, user_id: Uuid, plaintext: &str) -> Result<String> {
        self.cipher.encrypt(user_id, plaintext)
    }

    pub fn decrypt(&self, user_id: Uuid, sealed: &str) -> Result<String> {
        self.cipher.decrypt(user_id, sealed)
    }

    pub async fn create(
        &self,
        ctx: &RequestContext,
        name: &str,
        value: &str,
        description: Option<String>,
    ) -> Result<SecretView> {
        ctx.ensure_active()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CloudError::invalid("secret name is required"));
        }

        let now = Utc::now();
        let secret = Secret {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            user_id: ctx.user_id,
            name: name.to_string(),
            description,
            ciphertext: self.cipher.encrypt(ctx.user_id, value)?,
            last_accessed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_secret(&secret).await?;
        info!(secret_id = %secret.id, name = %secret.name, "secret created");

        self.notifier
            .emit(ActivityRecord::new(
                "SECRET_CREATE",
                "secret",
                secret.id,
                ctx.user_id,
                ctx.tenant_id,
            ))
            .await;
        Ok(secret.redacted())
    }

    /// Every secret of the tenant, values redacted
    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<SecretView>> {
        Ok(self
            .store
            .list_secrets(ctx.tenant_id)
            .await?
            .iter()
            .map(Secret::redacted)
            .collect())
    }

    /// The secret with its plaintext; stamps `last_accessed_at`
    pub async fn get(&self, ctx: &RequestContext, key: &str) -> Result<SecretView> {
        ctx.ensure_active()?;
        let mut secret = self.resolve(ctx, key).await?;
        let plaintext = self.cipher.decrypt(secret.user_id, &secret.ciphertext)?;

        secret.last_accessed_at = Some(Utc::now());
        self.store.update_secret(&secret).await?;
        Ok(secret.revealed(plaintext))
    }

    pub async fn delete(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        ctx.ensure_active()?;
        let secret = self.resolve(ctx, key).await?;
        self.store.delete_secret(ctx.tenant_id, secret.id).await?;
        info!(secret_id = %secret.id, "secret deleted");

        self.notifier
            .emit(ActivityRecord::new(
                "SECRET_DELETE",
                "secret",
                secret.id,
                ctx.user_id,
                ctx.tenant_id,
            ))
            .await;
        Ok(())
    }

    async fn resolve(&self, ctx: &RequestContext, key: &str) -> Result<Secret> {
        match Key::parse(key)? {
            Key::Id(id) => self.store.get_secret(ctx.tenant_id, id).await,
            Key::Name(name) => self
                .store
                .find_secret_by_name(ctx.tenant_id, name)
                .await?
                .ok_or_else(|| CloudError::not_found("secret", name)),
        }
    }
}
