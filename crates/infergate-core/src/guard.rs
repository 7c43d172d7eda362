use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    error::CoreError,
    model::{Credential, now_ms},
    ports::{AccountStore, CredentialStore},
};

const BEARER_PREFIX: &str = "Bearer ";

/// Picks the presented credential. The dedicated API-key header wins over
/// the authorization header; blank values count as absent.
pub fn extract_credential(api_key: Option<&str>, authorization: Option<&str>) -> Option<String> {
    if let Some(key) = api_key.map(str::trim).filter(|key| !key.is_empty()) {
        return Some(key.to_string());
    }
    let header = authorization.map(str::trim).filter(|value| !value.is_empty())?;
    let key = header.strip_prefix(BEARER_PREFIX).map(str::trim).unwrap_or(header);
    (!key.is_empty()).then(|| key.to_string())
}

pub struct AccessGuard {
    credentials: Arc<dyn CredentialStore>,
    accounts: Arc<dyn AccountStore>,
}

impl AccessGuard {
    pub fn new(credentials: Arc<dyn CredentialStore>, accounts: Arc<dyn AccountStore>) -> Self {
        Self { credentials, accounts }
    }

    pub async fn authorize(&self, presented: Option<&str>) -> Result<Credential, CoreError> {
        let Some(key) = presented else {
            return Err(CoreError::Unauthorized("missing API key".to_string()));
        };

        let credential = match self.credentials.lookup(key).await? {
            Some(credential) if credential.enabled => credential,
            _ => {
                info!(event = "auth.credential.rejected", "credential unknown or disabled");
                return Err(CoreError::Unauthorized("invalid API key".to_string()));
            }
        };

        if !self.accounts.is_active(&credential.account_id).await? {
            info!(
                event = "auth.account.inactive",
                account_id = %credential.account_id,
                "credential owner is disabled"
            );
            return Err(CoreError::Forbidden("user is disabled".to_string()));
        }

        if let Err(err) = self.credentials.touch_last_used(&credential.key, now_ms()).await {
            warn!(event = "auth.touch.failed", error = %err, "failed to bump credential last-used");
        }

        Ok(credential)
    }
}
