//! Prekey pool maintenance.

use serde_json::Value;
use tracing::{debug, info};

use super::AccountManager;
use crate::error::{RelayError, RelayResult};
use crate::keys::{
    generate_pre_key, generate_signed_pre_key, GeneratedKeys, PreKey, LAST_RESORT_KEY_ID,
};
use crate::storage::state_keys;

/// Progress callback for key generation: `(keys_done, fraction_done)`.
pub type KeyProgress<'a> = &'a (dyn Fn(u32, f64) + Send + Sync);

impl AccountManager {
    /// Regenerates and publishes the pool when the server runs low or local
    /// key material is missing. Returns whether a new pool was published.
    pub async fn refresh_pre_keys(&self) -> RelayResult<bool> {
        let ctx = self.ctx();
        let config = &ctx.config;
        let count = ctx.server.get_my_key_count().await?;

        let signed_key_id = ctx
            .store
            .get_state_u32(state_keys::SIGNED_KEY_ID)
            .await?
            .unwrap_or(1);
        let signed_key_ok = ctx
            .store
            .load_signed_pre_key(signed_key_id.saturating_sub(1))
            .await?
            .is_some();
        let last_resort_ok = !config.last_resort_key
            || ctx.store.load_pre_key(LAST_RESORT_KEY_ID).await?.is_some();

        if count > config.pre_key_low_water && signed_key_ok && last_resort_ok {
            debug!("Prekey pool healthy: {} on server", count);
            return Ok(false);
        }

        info!(
            "Refreshing prekeys: count={} signed_ok={} last_resort_ok={}",
            count, signed_key_ok, last_resort_ok
        );
        let keys = self.generate_keys(None).await?;
        ctx.server.register_keys(&keys).await?;
        Ok(true)
    }

    /// Generates and stores a full pool: the high-water mark of one-time
    /// prekeys, a rotated signed prekey and, when enabled, the last-resort
    /// key. The signed prekey two rotations back is removed.
    pub async fn generate_keys(&self, progress: Option<KeyProgress<'_>>) -> RelayResult<GeneratedKeys> {
        let ctx = self.ctx();
        let store = &ctx.store;
        let identity = store
            .get_our_identity()
            .await?
            .ok_or_else(|| RelayError::InvalidState("no identity key".to_string()))?;

        let start = store
            .get_state_u32(state_keys::MAX_PRE_KEY_ID)
            .await?
            .unwrap_or(1);
        let signed_key_id = store
            .get_state_u32(state_keys::SIGNED_KEY_ID)
            .await?
            .unwrap_or(1);
        let count = ctx.config.pre_key_high_water.max(1);

        let last_resort_key = if ctx.config.last_resort_key {
            match store.load_pre_key(LAST_RESORT_KEY_ID).await? {
                Some(pair) => Some(PreKey {
                    key_id: LAST_RESORT_KEY_ID,
                    public_key: pair.public_key.to_vec(),
                }),
                None => {
                    info!("Creating last-resort prekey");
                    let (public, pair) = generate_pre_key(LAST_RESORT_KEY_ID)?;
                    store.store_pre_key(LAST_RESORT_KEY_ID, &pair).await?;
                    Some(public)
                }
            }
        } else {
            None
        };

        let mut pre_keys = Vec::with_capacity(count as usize);
        for i in 0..count {
            let key_id = start + i;
            let (public, pair) = generate_pre_key(key_id)?;
            store.store_pre_key(key_id, &pair).await?;
            pre_keys.push(public);
            if let Some(progress) = progress {
                progress(i + 1, f64::from(i + 1) / f64::from(count));
            }
        }

        let (signed_pre_key, pair) = generate_signed_pre_key(&identity, signed_key_id)?;
        store.store_signed_pre_key(signed_key_id, &pair).await?;
        if signed_key_id > 2 {
            store.remove_signed_pre_key(signed_key_id - 2).await?;
        }

        store
            .put_states(&[
                (state_keys::MAX_PRE_KEY_ID, Value::from(start + count)),
                (state_keys::SIGNED_KEY_ID, Value::from(signed_key_id + 1)),
            ])
            .await?;
        debug!(
            "Generated prekeys {}..{} and signed prekey {}",
            start,
            start + count,
            signed_key_id
        );

        Ok(GeneratedKeys {
            identity_key: identity.public_key().to_vec(),
            signed_pre_key,
            pre_keys,
            last_resort_key,
        })
    }
}
