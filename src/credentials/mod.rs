// Credential pool: the persisted OAuth2 refresh-token accounts the
// scheduler draws from.

mod store;

pub use store::CredentialStore;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// One OAuth2 refresh-token account. `refresh_token` is the stable identity
/// key; `project_id` is assigned once on first load and never changes.
/// `session_id` is ephemeral, assigned in memory on process start, and is
/// never written back to disk (the serializer simply has no field for it in
/// `store::PersistedCredential`, rather than filtering it out by convention).
#[derive(Clone, Deserialize, Serialize, Zeroize)]
#[zeroize(drop)]
pub struct Credential {
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub remark: String,
    #[serde(skip)]
    pub session_id: i64,
}

fn default_enable() -> bool {
    true
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("refresh_token", &"[REDACTED]")
            .field("access_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .field("timestamp", &self.timestamp)
            .field("enable", &self.enable)
            .field("project_id", &self.project_id)
            .field("remark", &self.remark)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// 5-minute skew applied to expiry checks, matching the refresh margin the
/// scheduler uses before a request would otherwise hit an expired token.
const EXPIRY_SKEW_MS: i64 = 300_000;

impl Credential {
    /// `now >= timestamp + expires_in*1000 - 300_000`.
    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis >= self.timestamp + self.expires_in * 1000 - EXPIRY_SKEW_MS
    }

    /// First 10 characters of the refresh token, safe to log or return from
    /// the stats endpoint.
    pub fn token_prefix(&self) -> String {
        self.refresh_token.chars().take(10).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(timestamp: i64, expires_in: i64) -> Credential {
        Credential {
            refresh_token: "1//0testrefresh".to_string(),
            access_token: "ya29.test".to_string(),
            expires_in,
            timestamp,
            enable: true,
            project_id: "brave-otter-a1b2c".to_string(),
            remark: String::new(),
            session_id: -42,
        }
    }

    #[test]
    fn expiry_applies_five_minute_skew() {
        let now = 1_000_000_000_000;
        // expires in exactly 5 minutes from now -> already considered expired
        let c = cred(now, 300);
        assert!(c.is_expired(now));

        // expires in 5 minutes and 1 second -> not yet expired
        let c2 = cred(now, 301);
        assert!(!c2.is_expired(now));
    }

    #[test]
    fn debug_impl_redacts_tokens() {
        let c = cred(0, 3600);
        let s = format!("{:?}", c);
        assert!(!s.contains("1//0testrefresh"));
        assert!(!s.contains("ya29.test"));
    }

    #[test]
    fn token_prefix_is_ten_chars() {
        let c = cred(0, 3600);
        assert_eq!(c.token_prefix(), "1//0testre");
    }
}
