//! `/health` and `/ready` checks.
//!
//! Liveness answers as long as the process serves HTTP. Readiness follows
//! the service phase: it turns on once the media engine answers a
//! capabilities request and turns off for good when draining starts.
//! `/metrics` is served separately by the Prometheus handle.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Liveness body, also used by load balancers that match on text.
pub const LIVENESS_BODY: &str = "voice controller is running";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServicePhase {
    /// Waiting for the media engine.
    Starting = 0,
    Serving = 1,
    /// Shutdown began; never leaves this phase.
    Draining = 2,
}

impl ServicePhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ServicePhase::Starting,
            1 => ServicePhase::Serving,
            _ => ServicePhase::Draining,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ServicePhase::Starting => "starting",
            ServicePhase::Serving => "serving",
            ServicePhase::Draining => "draining",
        }
    }
}

/// Shared between the readiness check task, the shutdown path and the
/// HTTP handlers.
#[derive(Debug)]
pub struct HealthState {
    phase: AtomicU8,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(ServicePhase::Starting as u8),
        }
    }

    /// Starting → Serving. Has no effect once draining.
    pub fn set_ready(&self) {
        let _ = self.phase.compare_exchange(
            ServicePhase::Starting as u8,
            ServicePhase::Serving as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn set_not_ready(&self) {
        self.phase
            .store(ServicePhase::Draining as u8, Ordering::SeqCst);
    }

    #[must_use]
    pub fn phase(&self) -> ServicePhase {
        ServicePhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == ServicePhase::Serving
    }
}

pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/ready", get(readiness))
        .with_state(health_state)
}

async fn liveness() -> &'static str {
    LIVENESS_BODY
}

async fn readiness(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    let phase = state.phase();
    let status = if phase == ServicePhase::Serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, phase.as_str())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn get_path(state: &Arc<HealthState>, path: &str) -> (StatusCode, String) {
        let response = health_router(Arc::clone(state))
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_draining_is_final() {
        let state = HealthState::new();
        assert_eq!(state.phase(), ServicePhase::Starting);

        state.set_ready();
        assert!(state.is_ready());

        state.set_not_ready();
        state.set_ready();
        assert_eq!(state.phase(), ServicePhase::Draining);
        assert!(!state.is_ready());
    }

    #[test]
    fn test_drain_before_engine_answers() {
        let state = HealthState::new();
        state.set_not_ready();
        state.set_ready();
        assert_eq!(state.phase(), ServicePhase::Draining);
    }

    #[tokio::test]
    async fn test_liveness_ignores_phase() {
        let state = Arc::new(HealthState::new());
        state.set_not_ready();

        let (status, body) = get_path(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, LIVENESS_BODY);
    }

    #[tokio::test]
    async fn test_readiness_reports_phase() {
        let state = Arc::new(HealthState::new());
        assert_eq!(
            get_path(&state, "/ready").await,
            (StatusCode::SERVICE_UNAVAILABLE, "starting".to_string())
        );

        state.set_ready();
        assert_eq!(
            get_path(&state, "/ready").await,
            (StatusCode::OK, "serving".to_string())
        );

        state.set_not_ready();
        assert_eq!(
            get_path(&state, "/ready").await,
            (StatusCode::SERVICE_UNAVAILABLE, "draining".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let state = Arc::new(HealthState::new());
        let (status, _) = get_path(&state, "/live").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
