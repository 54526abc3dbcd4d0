// src/registry/backend.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Healthy,
    Full,
    Unhealthy,
}

impl BackendStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendStatus::Healthy => "healthy",
            BackendStatus::Full => "full",
            BackendStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Optional fields carried by a status update.
#[derive(Debug, Default)]
pub struct StatusPatch {
    pub session_count: Option<usize>,
    pub sessions: Option<Vec<String>>,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug)]
struct BackendState {
    status: BackendStatus,
    session_count: usize,
    sessions: HashSet<String>,
    last_checked: Option<DateTime<Utc>>,
    response_time_ms: u64,
    last_error: Option<String>,
}

/// One configured upstream origin. The mutable state is a single unit of
/// mutation behind one lock; counters are monotonic atomics.
#[derive(Debug)]
pub struct Backend {
    pub id: String,
    pub url: Url,
    created_at: DateTime<Utc>,
    state: RwLock<BackendState>,
    health_checks: AtomicU64,
    failures: AtomicU64,
    deleted_sessions: AtomicU64,
}

impl Backend {
    pub fn new(id: String, url: Url) -> Self {
        Self {
            id,
            url,
            created_at: Utc::now(),
            state: RwLock::new(BackendState {
                status: BackendStatus::Healthy,
                session_count: 0,
                sessions: HashSet::new(),
                last_checked: None,
                response_time_ms: 0,
                last_error: None,
            }),
            health_checks: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            deleted_sessions: AtomicU64::new(0),
        }
    }

    /// Canonical origin, no trailing slash.
    pub fn origin(&self) -> String {
        self.url.as_str().trim_end_matches('/').to_string()
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.origin(), path)
    }

    pub async fn status(&self) -> BackendStatus {
        self.state.read().await.status
    }

    pub async fn is_active(&self) -> bool {
        self.state.read().await.status == BackendStatus::Healthy
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.session_count
    }

    pub async fn has_session(&self, session_id: &str) -> bool {
        self.state.read().await.sessions.contains(session_id)
    }

    /// Applies a status update: stamps `last_checked`, bumps `health_checks`,
    /// bumps `failures` only on a transition into UNHEALTHY, and overlays the
    /// patch fields.
    pub async fn apply_update(
        &self,
        new_status: BackendStatus,
        patch: StatusPatch,
    ) -> BackendSnapshot {
        let mut state = self.state.write().await;
        self.health_checks.fetch_add(1, Ordering::Relaxed);
        if new_status == BackendStatus::Unhealthy && state.status != BackendStatus::Unhealthy {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        state.status = new_status;
        state.last_checked = Some(Utc::now());
        if let Some(count) = patch.session_count {
            state.session_count = count;
        }
        if let Some(sessions) = patch.sessions {
            state.sessions = sessions.into_iter().collect();
        }
        if let Some(elapsed) = patch.response_time_ms {
            state.response_time_ms = elapsed;
        }
        match patch.error {
            Some(error) => state.last_error = Some(error),
            None if new_status != BackendStatus::Unhealthy => state.last_error = None,
            None => {}
        }
        self.snapshot_locked(&state)
    }

    /// Drops a session from local bookkeeping, decrementing the count with a
    /// floor at zero. Returns the new count.
    pub async fn forget_session(&self, session_id: &str) -> usize {
        let mut state = self.state.write().await;
        state.sessions.remove(session_id);
        state.session_count = state.session_count.saturating_sub(1);
        state.session_count
    }

    pub fn record_deleted_session(&self) {
        self.deleted_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn deleted_sessions(&self) -> u64 {
        self.deleted_sessions.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> BackendSnapshot {
        let state = self.state.read().await;
        self.snapshot_locked(&state)
    }

    fn snapshot_locked(&self, state: &BackendState) -> BackendSnapshot {
        let mut sessions: Vec<String> = state.sessions.iter().cloned().collect();
        sessions.sort();
        BackendSnapshot {
            id: self.id.clone(),
            url: self.origin(),
            status: state.status,
            is_active: state.status == BackendStatus::Healthy,
            session_count: state.session_count,
            sessions,
            last_checked: state.last_checked.map(|t| t.to_rfc3339()),
            response_time_ms: state.response_time_ms,
            last_error: state.last_error.clone(),
            counters: CounterSnapshot {
                health_checks: self.health_checks(),
                failures: self.failures(),
                deleted_sessions: self.deleted_sessions(),
            },
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSnapshot {
    pub id: String,
    pub url: String,
    pub status: BackendStatus,
    pub is_active: bool,
    pub session_count: usize,
    pub sessions: Vec<String>,
    pub last_checked: Option<String>,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub counters: CounterSnapshot,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub health_checks: u64,
    pub failures: u64,
    pub deleted_sessions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Backend {
        Backend::new("server-1".into(), "http://127.0.0.1:3001".parse().unwrap())
    }

    #[tokio::test]
    async fn origin_has_no_trailing_slash() {
        let b = backend();
        assert_eq!(b.origin(), "http://127.0.0.1:3001");
        assert_eq!(b.endpoint("/sessions"), "http://127.0.0.1:3001/sessions");
    }

    #[tokio::test]
    async fn update_stamps_check_and_applies_patch() {
        let b = backend();
        let snap = b
            .apply_update(
                BackendStatus::Full,
                StatusPatch {
                    session_count: Some(25),
                    sessions: Some(vec!["s-1".into(), "s-2".into()]),
                    response_time_ms: Some(12),
                    error: None,
                },
            )
            .await;
        assert_eq!(snap.status, BackendStatus::Full);
        assert!(!snap.is_active);
        assert_eq!(snap.session_count, 25);
        assert_eq!(snap.counters.health_checks, 1);
        assert!(snap.last_checked.is_some());
        assert!(b.has_session("s-1").await);
    }

    #[tokio::test]
    async fn failures_bump_only_on_transition_into_unhealthy() {
        let b = backend();
        b.apply_update(
            BackendStatus::Unhealthy,
            StatusPatch {
                error: Some("connection refused".into()),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(b.failures(), 1);

        // already unhealthy, no further bump
        b.apply_update(BackendStatus::Unhealthy, StatusPatch::default())
            .await;
        assert_eq!(b.failures(), 1);

        // recovery then another outage bumps again
        b.apply_update(BackendStatus::Healthy, StatusPatch::default())
            .await;
        b.apply_update(BackendStatus::Unhealthy, StatusPatch::default())
            .await;
        assert_eq!(b.failures(), 2);
        assert_eq!(b.health_checks(), 4);
    }

    #[tokio::test]
    async fn recovery_clears_the_recorded_error() {
        let b = backend();
        b.apply_update(
            BackendStatus::Unhealthy,
            StatusPatch {
                error: Some("timed out".into()),
                ..Default::default()
            },
        )
        .await;
        let snap = b
            .apply_update(BackendStatus::Healthy, StatusPatch::default())
            .await;
        assert!(snap.last_error.is_none());
    }

    #[tokio::test]
    async fn forget_session_floors_at_zero() {
        let b = backend();
        b.apply_update(
            BackendStatus::Healthy,
            StatusPatch {
                session_count: Some(1),
                sessions: Some(vec!["s-1".into()]),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(b.forget_session("s-1").await, 0);
        assert_eq!(b.forget_session("s-1").await, 0);
        assert!(!b.has_session("s-1").await);
    }
}
