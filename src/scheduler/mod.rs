// Credential scheduler: picks a credential per request, tracks per-credential
// active counts and cooldowns, refreshes expired access tokens, and retires
// dead ones. Generalizes a single-credential double-checked-locking refresh
// into a pool, selecting the least-loaded credential over atomic per-entry
// session counts.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::credentials::{Credential, CredentialStore};
use crate::error::{ProxyError, Result};
use crate::retry::{parse_retry_after_header, parse_quota_reset_delay};

/// Google OAuth2 client for the Gemini CLI (public, installed-app client).
/// Source: gemini-cli's `code_assist/oauth2.ts`.
const OAUTH_CLIENT_ID: &str = "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const OAUTH_CLIENT_SECRET: &str = "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";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Fixed cooldown applied to a 429 when upstream gives no retry hint. Short
/// and not exponential: the scheduler wants to rotate across credentials,
/// not back off on any single one.
const DEFAULT_RATE_LIMIT_COOLDOWN_MS: i64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Active,
    RateLimited,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastStatus {
    Unused,
    Success,
    RateLimited,
    AuthFailed,
    ServerError,
    NetworkError,
    Error,
}

impl LastStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LastStatus::Unused => "unused",
            LastStatus::Success => "success",
            LastStatus::RateLimited => "rate_limited",
            LastStatus::AuthFailed => "auth_failed",
            LastStatus::ServerError => "server_error",
            LastStatus::NetworkError => "network_error",
            LastStatus::Error => "error",
        }
    }
}

/// Outcome of a single upstream attempt, as reported back to the scheduler
/// after the retry loop resolves a request against this credential.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Success,
    RateLimited { retry_after_ms: Option<i64> },
    AuthFailed,
    ServerError,
    NetworkError,
}

struct Entry {
    credential: RwLock<Credential>,
    status: RwLock<CredentialStatus>,
    active_count: AtomicU32,
    cooldown_until_ms: AtomicI64,
    consecutive_429_count: AtomicU32,
    last_status: RwLock<LastStatus>,
    last_used_time_ms: AtomicI64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    refresh_count: AtomicU64,
    /// Guards refresh so two concurrent selectors of the same credential
    /// don't both POST a refresh.
    refresh_lock: Mutex<()>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Per-credential view returned by `get_all_stats()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CredentialStat {
    pub token_prefix: String,
    pub enabled: bool,
    pub active_count: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub refresh_count: u64,
    pub success_rate: f64,
    pub last_used_time_ms: i64,
    pub effective_status: &'static str,
    pub last_status: &'static str,
    pub remark: String,
}

#[derive(Debug, Clone, serde::Serialize, Default)]
pub struct StatsSummary {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub active: usize,
    pub total_success: u64,
    pub total_failure: u64,
    pub total_refresh: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AllStats {
    pub credentials: Vec<CredentialStat>,
    pub summary: StatsSummary,
}

/// A handle identifying a selected credential within one request's retry
/// chain, used both to make the outbound call and to report the outcome.
pub struct Selection {
    pub(crate) index: usize,
}

/// Pool of credentials the scheduler selects from. Constructed once at
/// startup from `CredentialStore::load_full()`'s full (enabled + disabled)
/// list, preserving file order — disabled entries are skipped at selection
/// but kept around so `get_all_stats()` can still report them.
pub struct CredentialScheduler {
    store: Arc<CredentialStore>,
    entries: RwLock<Vec<Arc<Entry>>>,
    http: reqwest::Client,
    per_credential_concurrency: u32,
    enabled_count: AtomicUsize,
}

impl CredentialScheduler {
    pub async fn new(store: Arc<CredentialStore>, per_credential_concurrency: u32) -> Result<Self> {
        let all = store.load_full().await?;
        let enabled_count = all.iter().filter(|c| c.enable).count();
        let entries = all.into_iter().map(Self::new_entry).collect();
        Ok(Self {
            store,
            entries: RwLock::new(entries),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .map_err(|e| ProxyError::Internal(format!("failed to build oauth http client: {e}")))?,
            per_credential_concurrency,
            enabled_count: AtomicUsize::new(enabled_count),
        })
    }

    /// Build a pool entry for `credential`, seeding its status from the
    /// on-disk `enable` flag so a disabled credential loaded at startup (or
    /// carried over on reload) starts out of rotation rather than `Active`.
    fn new_entry(credential: Credential) -> Arc<Entry> {
        let status = if credential.enable { CredentialStatus::Active } else { CredentialStatus::Disabled };
        Arc::new(Entry {
            credential: RwLock::new(credential),
            status: RwLock::new(status),
            active_count: AtomicU32::new(0),
            cooldown_until_ms: AtomicI64::new(0),
            consecutive_429_count: AtomicU32::new(0),
            last_status: RwLock::new(LastStatus::Unused),
            last_used_time_ms: AtomicI64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            refresh_count: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled_count.load(Ordering::Relaxed)
    }

    /// Select the least-loaded untried credential, skipping disabled and
    /// cooling-down entries, refreshing its access token transparently if
    /// expired. `tried` is
    /// mutated to include every credential visited (including ones whose
    /// refresh failed), so the caller's retry loop never revisits them.
    pub async fn select(&self, tried: &mut HashSet<usize>) -> Result<(Selection, String, String)> {
        loop {
            let entries = self.entries.read().await;
            let now = now_millis();

            let mut best: Option<(usize, u32)> = None;
            let mut any_cooling = false;
            let mut any_overloaded = false;
            let mut any_untried = false;

            for (idx, entry) in entries.iter().enumerate() {
                if tried.contains(&idx) {
                    continue;
                }
                any_untried = true;

                if *entry.status.read().await == CredentialStatus::Disabled {
                    continue;
                }

                let cooldown_until = entry.cooldown_until_ms.load(Ordering::Relaxed);
                if cooldown_until > now {
                    any_cooling = true;
                    continue;
                }

                let active = entry.active_count.load(Ordering::Relaxed);
                if active >= self.per_credential_concurrency {
                    any_overloaded = true;
                    continue;
                }

                match best {
                    None => best = Some((idx, active)),
                    Some((_, best_active)) if active < best_active => best = Some((idx, active)),
                    _ => {}
                }
            }

            let Some((idx, _)) = best else {
                if !any_untried {
                    return Err(ProxyError::ServiceUnavailable("no credentials usable".to_string()));
                }
                if any_cooling && !any_overloaded {
                    let min_remaining = self.min_cooldown_remaining(&entries, tried, now).await;
                    let secs = min_remaining.div_ceil(1000).max(1) as u64;
                    return Err(ProxyError::RateLimitError {
                        message: "all usable credentials are cooling down".to_string(),
                        retry_after_secs: Some(secs),
                    });
                }
                if any_overloaded {
                    return Err(ProxyError::ServiceUnavailable("concurrency cap reached".to_string()));
                }
                return Err(ProxyError::ServiceUnavailable("no credentials usable".to_string()));
            };

            let entry = entries[idx].clone();
            entry.active_count.fetch_add(1, Ordering::SeqCst);
            drop(entries);

            let access_token = {
                let cred = entry.credential.read().await;
                cred.access_token.clone()
            };
            let is_expired = {
                let cred = entry.credential.read().await;
                cred.is_expired(now)
            };

            if !is_expired {
                let project_id = entry.credential.read().await.project_id.clone();
                return Ok((Selection { index: idx }, access_token, project_id));
            }

            match self.refresh(&entry).await {
                Ok((access_token, project_id)) => {
                    return Ok((Selection { index: idx }, access_token, project_id));
                }
                Err(e) => {
                    warn!(error = %e, "credential refresh failed, rolling back reservation");
                    entry.active_count.fetch_sub(1, Ordering::SeqCst);
                    *entry.last_status.write().await = LastStatus::AuthFailed;
                    entry.failure_count.fetch_add(1, Ordering::Relaxed);
                    tried.insert(idx);
                    continue;
                }
            }
        }
    }

    async fn min_cooldown_remaining(
        &self,
        entries: &[Arc<Entry>],
        tried: &HashSet<usize>,
        now: i64,
    ) -> i64 {
        let mut min_remaining = i64::MAX;
        for (idx, entry) in entries.iter().enumerate() {
            if tried.contains(&idx) {
                continue;
            }
            if *entry.status.read().await == CredentialStatus::Disabled {
                continue;
            }
            let remaining = entry.cooldown_until_ms.load(Ordering::Relaxed) - now;
            if remaining > 0 && remaining < min_remaining {
                min_remaining = remaining;
            }
        }
        if min_remaining == i64::MAX { 0 } else { min_remaining }
    }

    /// Double-checked refresh: a single in-flight POST per credential, behind
    /// its own lock, so concurrent selectors of an expired credential don't
    /// thunder-herd the token endpoint.
    async fn refresh(&self, entry: &Entry) -> Result<(String, String)> {
        let _guard = entry.refresh_lock.lock().await;

        let now = now_millis();
        {
            let cred = entry.credential.read().await;
            if !cred.is_expired(now) {
                return Ok((cred.access_token.clone(), cred.project_id.clone()));
            }
        }

        let refresh_token = entry.credential.read().await.refresh_token.clone();
        let params = [
            ("client_id", OAUTH_CLIENT_ID),
            ("client_secret", OAUTH_CLIENT_SECRET),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .http
            .post(OAUTH_TOKEN_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| ProxyError::NetworkError(format!("oauth refresh transport error: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after_header);
            let body = response.text().await.unwrap_or_default();
            crate::metrics::record_oauth_refresh(false);
            return Err(ProxyError::AuthenticationError(format!(
                "oauth refresh failed: http {status} (retry_after={retry_after:?}): {body}"
            )));
        }

        let token_data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProxyError::ApiError(format!("oauth refresh response unparsable: {e}")))?;

        let access_token = token_data
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProxyError::ApiError("oauth refresh response missing access_token".to_string()))?
            .to_string();
        let expires_in = token_data.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(3600);

        let project_id;
        {
            let mut cred = entry.credential.write().await;
            cred.access_token = access_token.clone();
            cred.expires_in = expires_in;
            cred.timestamp = now;
            project_id = cred.project_id.clone();
        }
        entry.refresh_count.fetch_add(1, Ordering::Relaxed);

        let snapshot = entry.credential.read().await.clone();
        self.store.save_all(std::slice::from_ref(&snapshot)).await?;
        crate::metrics::record_oauth_refresh(true);

        info!(project_id = %project_id, "refreshed oauth access token");
        Ok((access_token, project_id))
    }

    /// Report the outcome of an upstream attempt made with `selection`,
    /// applying the cooldown/status transition for that outcome and
    /// releasing the active-count reservation taken in `select()`.
    pub async fn report(&self, selection: Selection, outcome: Outcome) {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(selection.index).cloned() else { return };
        drop(entries);

        entry.active_count.fetch_sub(1, Ordering::SeqCst);
        entry.last_used_time_ms.store(now_millis(), Ordering::Relaxed);
        crate::metrics::record_scheduler_outcome(&outcome);

        match outcome {
            Outcome::Success => {
                *entry.status.write().await = CredentialStatus::Active;
                entry.cooldown_until_ms.store(0, Ordering::Relaxed);
                entry.consecutive_429_count.store(0, Ordering::Relaxed);
                entry.success_count.fetch_add(1, Ordering::Relaxed);
                *entry.last_status.write().await = LastStatus::Success;
            }
            Outcome::RateLimited { retry_after_ms } => {
                *entry.status.write().await = CredentialStatus::RateLimited;
                let delay = retry_after_ms.unwrap_or(DEFAULT_RATE_LIMIT_COOLDOWN_MS);
                entry.cooldown_until_ms.store(now_millis() + delay, Ordering::Relaxed);
                entry.consecutive_429_count.fetch_add(1, Ordering::Relaxed);
                entry.failure_count.fetch_add(1, Ordering::Relaxed);
                *entry.last_status.write().await = LastStatus::RateLimited;
            }
            Outcome::AuthFailed => {
                *entry.status.write().await = CredentialStatus::Disabled;
                entry.cooldown_until_ms.store(0, Ordering::Relaxed);
                entry.failure_count.fetch_add(1, Ordering::Relaxed);
                *entry.last_status.write().await = LastStatus::AuthFailed;
                let refresh_token = entry.credential.read().await.refresh_token.clone();
                if self.store.disable(&refresh_token).await.is_ok() {
                    if let Ok(all) = self.store.load_full().await {
                        self.reload_entries(all).await;
                    }
                }
            }
            Outcome::ServerError => {
                entry.cooldown_until_ms.store(0, Ordering::Relaxed);
                entry.consecutive_429_count.store(0, Ordering::Relaxed);
                entry.failure_count.fetch_add(1, Ordering::Relaxed);
                *entry.last_status.write().await = LastStatus::ServerError;
            }
            Outcome::NetworkError => {
                entry.cooldown_until_ms.store(0, Ordering::Relaxed);
                entry.consecutive_429_count.store(0, Ordering::Relaxed);
                entry.failure_count.fetch_add(1, Ordering::Relaxed);
                *entry.last_status.write().await = LastStatus::NetworkError;
            }
        }
    }

    /// After a credential is disabled, rebuild the in-memory entries from
    /// the store's full (enabled + disabled) list in file order, carrying
    /// over counters for credentials still present (matched by refresh
    /// token) so disabled credentials stay reportable in `get_all_stats()`.
    async fn reload_entries(&self, all: Vec<Credential>) {
        let mut entries = self.entries.write().await;
        let enabled_count = all.iter().filter(|c| c.enable).count();
        let mut rebuilt = Vec::with_capacity(all.len());
        for cred in all {
            if let Some(existing) = Self::find_by_token(&entries, &cred.refresh_token).await {
                rebuilt.push(existing);
            } else {
                rebuilt.push(Self::new_entry(cred));
            }
        }
        *entries = rebuilt;
        self.enabled_count.store(enabled_count, Ordering::Relaxed);
    }

    async fn find_by_token(entries: &[Arc<Entry>], refresh_token: &str) -> Option<Arc<Entry>> {
        for entry in entries {
            if entry.credential.read().await.refresh_token == refresh_token {
                return Some(entry.clone());
            }
        }
        None
    }

    /// Per-credential and aggregate stats, per spec: disabled credentials are
    /// not currently tracked in `entries` once retired, so this reports only
    /// the live (enabled-at-some-point) set the scheduler is holding.
    pub async fn get_all_stats(&self) -> AllStats {
        let entries = self.entries.read().await;
        let mut credentials = Vec::with_capacity(entries.len());
        let mut summary = StatsSummary::default();

        for entry in entries.iter() {
            let cred = entry.credential.read().await;
            let status = *entry.status.read().await;
            let active_count = entry.active_count.load(Ordering::Relaxed);
            let success = entry.success_count.load(Ordering::Relaxed);
            let failure = entry.failure_count.load(Ordering::Relaxed);
            let refresh = entry.refresh_count.load(Ordering::Relaxed);
            let total = success + failure;
            let success_rate = if total == 0 { 0.0 } else { (success as f64 / total as f64 * 1000.0).round() / 10.0 };

            let effective_status: &'static str = if status == CredentialStatus::Disabled {
                "disabled"
            } else if active_count > 0 {
                "active"
            } else if entry.cooldown_until_ms.load(Ordering::Relaxed) > now_millis() {
                "rate_limited"
            } else {
                "idle"
            };

            summary.total += 1;
            if status == CredentialStatus::Disabled {
                summary.disabled += 1;
            } else {
                summary.enabled += 1;
            }
            if active_count > 0 {
                summary.active += 1;
            }
            summary.total_success += success;
            summary.total_failure += failure;
            summary.total_refresh += refresh;

            credentials.push(CredentialStat {
                token_prefix: cred.token_prefix(),
                enabled: status != CredentialStatus::Disabled,
                active_count,
                success_count: success,
                failure_count: failure,
                refresh_count: refresh,
                success_rate,
                last_used_time_ms: entry.last_used_time_ms.load(Ordering::Relaxed),
                effective_status,
                last_status: entry.last_status.read().await.as_str(),
                remark: cred.remark.clone(),
            });
        }

        debug!(total = summary.total, enabled = summary.enabled, "aggregated credential stats");
        AllStats { credentials, summary }
    }
}

/// Best-effort parser for upstream error JSON's RetryInfo/ErrorInfo details,
/// used by the retry loop to extract `retry_after_ms` for `Outcome::RateLimited`.
pub fn retry_after_ms_from_error_body(body: &str) -> Option<i64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let details = value.get("error")?.get("details")?.as_array()?;

    for detail in details {
        if detail.get("@type").and_then(|v| v.as_str()) == Some("type.googleapis.com/google.rpc.RetryInfo") {
            if let Some(delay) = detail.get("retryDelay").and_then(|v| v.as_str()) {
                if let Some(ms) = crate::retry::parse_retry_delay_seconds(delay) {
                    return Some(ms);
                }
            }
        }
    }
    for detail in details {
        if detail.get("@type").and_then(|v| v.as_str()) == Some("type.googleapis.com/google.rpc.ErrorInfo") {
            if let Some(delay) = detail.get("metadata").and_then(|m| m.get("quotaResetDelay")).and_then(|v| v.as_str()) {
                if let Some(ms) = parse_quota_reset_delay(delay) {
                    return Some(ms);
                }
            }
        }
    }
    None
}
