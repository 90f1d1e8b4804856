//! Handshake authentication
//!
//! Connections are accepted when auth is disabled, when the device id is on
//! the allow-list, or when a known bearer token is presented. Rejected
//! connections are closed with a diagnostic log entry; the reason never goes
//! on the wire.

use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::info;

use crate::config::AuthSettings;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or invalid Authorization header")]
    MissingBearer,
    #[error("invalid token")]
    InvalidToken,
}

/// Handshake policy built once at bootstrap from the server config.
pub struct AuthPolicy {
    enabled: bool,
    allowed_devices: HashSet<String>,
    /// token → human-readable name, for the acceptance log line
    tokens: HashMap<String, String>,
}

impl AuthPolicy {
    pub fn new(settings: &AuthSettings) -> Self {
        Self {
            enabled: settings.enabled,
            allowed_devices: settings.allowed_devices.iter().cloned().collect(),
            tokens: settings
                .tokens
                .iter()
                .map(|t| (t.token.clone(), t.name.clone()))
                .collect(),
        }
    }

    /// Validate connection-scoped metadata read from the transport headers.
    pub fn authenticate(
        &self,
        device_id: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<(), AuthError> {
        if !self.enabled {
            return Ok(());
        }

        if let Some(device_id) = device_id {
            if self.allowed_devices.contains(device_id) {
                return Ok(());
            }
        }

        let token = authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingBearer)?;
        match self.tokens.get(token) {
            Some(name) => {
                info!(
                    "Authentication successful - device: {}, token: {}",
                    device_id.unwrap_or("<none>"),
                    name
                );
                Ok(())
            }
            None => Err(AuthError::InvalidToken),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenEntry;

    fn settings(enabled: bool) -> AuthSettings {
        AuthSettings {
            enabled,
            allowed_devices: vec!["dev-1".into()],
            tokens: vec![TokenEntry { token: "T1".into(), name: "alice".into() }],
        }
    }

    #[test]
    fn disabled_auth_accepts_anything() {
        let policy = AuthPolicy::new(&settings(false));
        assert_eq!(policy.authenticate(None, None), Ok(()));
    }

    #[test]
    fn allow_listed_device_needs_no_token() {
        let policy = AuthPolicy::new(&settings(true));
        assert_eq!(policy.authenticate(Some("dev-1"), None), Ok(()));
    }

    #[test]
    fn bearer_token_admits_unknown_device() {
        let policy = AuthPolicy::new(&settings(true));
        assert_eq!(policy.authenticate(Some("dev-9"), Some("Bearer T1")), Ok(()));
        assert_eq!(
            policy.authenticate(Some("dev-9"), Some("Bearer nope")),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            policy.authenticate(Some("dev-9"), None),
            Err(AuthError::MissingBearer)
        );
        assert_eq!(
            policy.authenticate(Some("dev-9"), Some("Basic T1")),
            Err(AuthError::MissingBearer)
        );
    }
}
