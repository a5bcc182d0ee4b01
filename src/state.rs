//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket connection.
//!
//! ## Shared vs. Per-Call:
//! - **Shared**: configuration, request metrics, the audio backend (which
//!   enforces one microphone holder at a time) and the desks' reservation book
//!   and order ledger
//! - **Per-call**: each `/ws/call` connection builds its own
//!   [`SessionController`] from the *current* configuration, so a
//!   `PUT /api/v1/config` applies to the next call without a restart
//!
//! ## Locking:
//! `Arc<RwLock<T>>` for data that changes at runtime. Readers clone what they
//! need and drop the guard straight away so no lock is held across an await.

use crate::audio::device::AudioBackend;
use crate::call::remote::RemoteConnector;
use crate::call::{CallObserver, SessionController};
use crate::config::AppConfig;
use crate::desk::Desks;
use crate::evaluation::GeminiEvaluator;
use crate::live::GeminiLiveConnector;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Builds the remote connector for a new call from the live configuration.
pub type ConnectorFactory = Arc<dyn Fn(&AppConfig) -> Arc<dyn RemoteConnector> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
    pub desks: Desks,
    pub audio: Arc<dyn AudioBackend>,
    connector_factory: ConnectorFactory,
}

/// Request and call counters since server start.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Open `/ws/call` connections
    pub active_connections: u32,
    pub calls_started: u64,
    pub calls_ended: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// State backed by the system audio devices and the Gemini Live service.
    pub fn new(config: AppConfig, audio: Arc<dyn AudioBackend>) -> Self {
        let factory: ConnectorFactory =
            Arc::new(|config: &AppConfig| Arc::new(GeminiLiveConnector::new(&config.live)) as Arc<dyn RemoteConnector>);
        Self::with_connector(config, audio, factory)
    }

    pub fn with_connector(
        config: AppConfig,
        audio: Arc<dyn AudioBackend>,
        connector_factory: ConnectorFactory,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            desks: Desks::new(),
            audio,
            connector_factory,
        }
    }

    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<()> {
        new_config.validate()?;
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
        Ok(())
    }

    /// A controller for one connection, built from the current configuration.
    pub fn session_controller(&self, observer: Arc<dyn CallObserver>) -> Result<SessionController> {
        let config = self.get_config();
        let evaluator = GeminiEvaluator::new(
            &config.evaluation,
            config.live.api_key().map(str::to_string),
        )?;
        let connector = (self.connector_factory)(&config);

        Ok(SessionController::new(
            config,
            self.audio.clone(),
            connector,
            Arc::new(evaluator),
            observer,
        ))
    }

    fn with_metrics<F: FnOnce(&mut AppMetrics)>(&self, update: F) {
        let mut metrics = self
            .metrics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut metrics);
    }

    pub fn increment_request_count(&self) {
        self.with_metrics(|m| m.request_count += 1);
    }

    pub fn increment_error_count(&self) {
        self.with_metrics(|m| m.error_count += 1);
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.with_metrics(|m| {
            let metric = m.endpoint_metrics.entry(endpoint.to_string()).or_default();
            metric.request_count += 1;
            metric.total_duration_ms += duration_ms;
            if is_error {
                metric.error_count += 1;
            }
        });
    }

    /// Claim a connection slot. Returns false when the configured limit is reached.
    pub fn try_open_connection(&self) -> bool {
        let limit = self.get_config().performance.max_concurrent_sessions;
        let mut admitted = false;
        self.with_metrics(|m| {
            if (m.active_connections as usize) < limit {
                m.active_connections += 1;
                admitted = true;
            }
        });
        admitted
    }

    pub fn close_connection(&self) {
        self.with_metrics(|m| m.active_connections = m.active_connections.saturating_sub(1));
    }

    pub fn record_call_started(&self) {
        self.with_metrics(|m| m.calls_started += 1);
    }

    pub fn record_call_ended(&self) {
        self.with_metrics(|m| m.calls_ended += 1);
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::device::{Microphone, PlaybackContext};
    use crate::error::{CallError, CallResult};

    /// Backend for host tests that never reaches a real device.
    pub(crate) struct NoAudio;

    impl AudioBackend for NoAudio {
        fn open_microphone(&self, _: u32, _: usize, _: usize) -> CallResult<Microphone> {
            Err(CallError::Device("No audio device in tests".to_string()))
        }

        fn open_playback(&self, _: u32) -> CallResult<Arc<dyn PlaybackContext>> {
            Err(CallError::Device("No audio device in tests".to_string()))
        }
    }

    pub(crate) fn test_state() -> AppState {
        AppState::new(AppConfig::default(), Arc::new(NoAudio))
    }

    #[test]
    fn test_connection_slots_respect_limit() {
        let state = test_state();
        let mut config = state.get_config();
        config.performance.max_concurrent_sessions = 2;
        state.update_config(config).unwrap();

        assert!(state.try_open_connection());
        assert!(state.try_open_connection());
        assert!(!state.try_open_connection());

        state.close_connection();
        assert!(state.try_open_connection());
        assert_eq!(state.get_metrics_snapshot().active_connections, 2);
    }

    #[test]
    fn test_close_connection_never_underflows() {
        let state = test_state();
        state.close_connection();
        assert_eq!(state.get_metrics_snapshot().active_connections, 0);
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = test_state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_invalid_config_update_is_rejected() {
        let state = test_state();
        let mut config = state.get_config();
        config.performance.max_concurrent_sessions = 0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().performance.max_concurrent_sessions, 4);
    }

    #[test]
    fn test_session_controller_starts_idle() {
        let state = test_state();
        let controller = state
            .session_controller(Arc::new(crate::call::controller::NoopObserver))
            .unwrap();
        assert_eq!(controller.status(), crate::call::CallStatus::Idle);
    }
}
