//! # Session Controller
//!
//! Owns one call at a time and drives it through its lifecycle:
//!
//! ```text
//! Idle --start()--> Connecting --Open--> Active --end()--> Ended
//!                        |                  |
//!                        +---Error/Closed---+---------> Ended
//! ```
//!
//! ## Ownership:
//! Every resource a call acquires (microphone, playback context, scheduler,
//! capture pump, tool worker, remote handle) lives in [`CallResources`] inside
//! the [`CallSession`]. Every termination path goes through
//! [`CallResources::teardown`], which releases each resource at most once.
//!
//! ## Event Routing:
//! Inbound events are handled in arrival order on the controller task:
//! transcript fragments and turn boundaries go to the assembler, audio chunks
//! to the playback scheduler, and tool-call batches to the tool worker. The
//! capture pump runs as its own task with only a send handle.
//!
//! ## Host Surface:
//! Hosts drive the controller with [`CallCommand`]s through [`SessionController::run`]
//! and receive changes through a [`CallObserver`].

use crate::audio::device::{AudioBackend, CaptureDevice, PlaybackContext};
use crate::call::capture::{AudioCaptureChannel, CaptureStats};
use crate::call::playback::AudioPlaybackScheduler;
use crate::call::remote::{RemoteConnector, RemoteEvent, RemoteHandle, ServerEvent, SessionSetup};
use crate::call::tools::{ToolCallBridge, ToolHandler, ToolWorker};
use crate::call::transcript::{Speaker, TranscriptAssembler, TranscriptEntry};
use crate::config::AppConfig;
use crate::error::{CallError, CallResult};
use crate::evaluation::{EvaluationReport, EvaluationRequest, Evaluator};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Idle,
    Connecting,
    Active,
    Ended,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallStatus::Idle => "idle",
            CallStatus::Connecting => "connecting",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
        };
        write!(f, "{}", name)
    }
}

/// One metric on the 0-100 scale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricScore {
    pub label: String,
    pub value: f64,
}

/// Everything a call needs to know about the scenario it simulates.
#[derive(Clone)]
pub struct CallPlan {
    pub scenario_id: String,
    /// Desk context shown to the reviewer, e.g. "ROOM SERVICE CALL SIMULATOR"
    pub title: String,
    /// Full instruction for the agent, opening line included
    pub system_instruction: String,
    pub function_declarations: Vec<Value>,
    pub metric_labels: Vec<String>,
    pub tool_handler: Option<Arc<dyn ToolHandler>>,
}

impl fmt::Debug for CallPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPlan")
            .field("scenario_id", &self.scenario_id)
            .field("title", &self.title)
            .field("tools", &self.function_declarations.len())
            .field("metric_labels", &self.metric_labels)
            .finish()
    }
}

/// Receives call changes. Every method defaults to doing nothing.
pub trait CallObserver: Send + Sync {
    fn on_status_change(&self, _status: CallStatus) {}
    fn on_transcript_change(&self, _entries: &[TranscriptEntry]) {}
    fn on_metrics_change(&self, _metrics: &[MetricScore]) {}
    fn on_evaluation(&self, _report: &EvaluationReport) {}
    fn on_error(&self, _error: &CallError) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl CallObserver for NoopObserver {}

/// Commands a host sends to [`SessionController::run`].
#[derive(Debug)]
pub enum CallCommand {
    Start(CallPlan),
    End,
    SetMuted(bool),
    Evaluate,
}

/// Resources owned by one call.
#[derive(Default)]
pub struct CallResources {
    microphone: Option<Box<dyn CaptureDevice>>,
    pending_frames: Option<mpsc::Receiver<Vec<f32>>>,
    capture_task: Option<JoinHandle<CaptureStats>>,
    playback: Option<Arc<dyn PlaybackContext>>,
    scheduler: Option<AudioPlaybackScheduler>,
    tool_worker: Option<ToolWorker>,
    remote: Option<Box<dyn RemoteHandle>>,
    events: Option<mpsc::Receiver<RemoteEvent>>,
    torn_down: bool,
}

impl CallResources {
    /// Release everything. Returns false if this already ran.
    pub fn teardown(&mut self) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;

        if let Some(mut scheduler) = self.scheduler.take() {
            let stopped = scheduler.stop_all();
            debug!(stopped, "Stopped in-flight playback");
        }
        if let Some(task) = self.capture_task.take() {
            task.abort();
        }
        self.pending_frames = None;
        if let Some(mut microphone) = self.microphone.take() {
            microphone.release();
        }
        if let Some(playback) = self.playback.take() {
            playback.close();
        }
        if let Some(worker) = self.tool_worker.take() {
            worker.abort();
        }
        self.remote = None;
        self.events = None;
        true
    }
}

/// Aggregate root for one call. Never reused.
pub struct CallSession {
    pub id: Uuid,
    pub plan: CallPlan,
    pub started_at: DateTime<Utc>,
    status: CallStatus,
    muted: Arc<AtomicBool>,
    transcript: TranscriptAssembler,
    metrics: Vec<MetricScore>,
    resources: CallResources,
}

impl CallSession {
    fn new(plan: CallPlan) -> Self {
        let metrics = plan
            .metric_labels
            .iter()
            .map(|label| MetricScore {
                label: label.clone(),
                value: 0.0,
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            plan,
            started_at: Utc::now(),
            status: CallStatus::Idle,
            muted: Arc::new(AtomicBool::new(false)),
            transcript: TranscriptAssembler::new(),
            metrics,
            resources: CallResources::default(),
        }
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.transcript.entries()
    }

    pub fn metrics(&self) -> &[MetricScore] {
        &self.metrics
    }
}

/// Unwrap a device open that ran on the blocking pool.
fn flatten_blocking<T>(joined: Result<CallResult<T>, tokio::task::JoinError>) -> CallResult<T> {
    joined.map_err(|e| CallError::Device(format!("Device open task failed: {}", e)))?
}

pub struct SessionController {
    config: AppConfig,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn RemoteConnector>,
    evaluator: Arc<dyn Evaluator>,
    observer: Arc<dyn CallObserver>,
    session: Option<CallSession>,
}

impl SessionController {
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn RemoteConnector>,
        evaluator: Arc<dyn Evaluator>,
        observer: Arc<dyn CallObserver>,
    ) -> Self {
        Self {
            config,
            backend,
            connector,
            evaluator,
            observer,
            session: None,
        }
    }

    pub fn status(&self) -> CallStatus {
        self.session
            .as_ref()
            .map(CallSession::status)
            .unwrap_or(CallStatus::Idle)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    /// Acquire devices, open the remote session and move to `Connecting`.
    ///
    /// Rejected while a call is in progress. A missing credential fails before
    /// anything is acquired. A device failure releases whatever was acquired
    /// and leaves the controller idle.
    pub async fn start(&mut self, plan: CallPlan) -> CallResult<()> {
        let status = self.status();
        if matches!(status, CallStatus::Connecting | CallStatus::Active) {
            return Err(CallError::InvalidState(format!(
                "Cannot start a call while one is {}",
                status
            )));
        }

        let api_key = self
            .config
            .live
            .api_key()
            .ok_or_else(|| {
                CallError::Configuration(
                    "API key is missing; set GEMINI_API_KEY before starting a call".to_string(),
                )
            })?
            .to_string();

        if let Some(mut previous) = self.session.take() {
            previous.resources.teardown();
        }

        let audio = self.config.audio.clone();
        let backend = self.backend.clone();
        let opened = tokio::task::spawn_blocking(move || {
            backend.open_microphone(
                audio.capture_sample_rate,
                audio.frame_samples,
                audio.capture_queue_depth,
            )
        })
        .await;
        let microphone = match flatten_blocking(opened) {
            Ok(microphone) => microphone,
            Err(e) => return Err(self.abort_to_idle(status, e)),
        };

        let backend = self.backend.clone();
        let playback_rate = self.config.audio.playback_sample_rate;
        let opened = tokio::task::spawn_blocking(move || backend.open_playback(playback_rate)).await;
        let playback = match flatten_blocking(opened) {
            Ok(playback) => playback,
            Err(e) => {
                let mut device = microphone.device;
                device.release();
                return Err(self.abort_to_idle(status, e));
            }
        };

        let mut session = CallSession::new(plan);
        session.status = CallStatus::Connecting;
        session.resources.microphone = Some(microphone.device);
        session.resources.pending_frames = Some(microphone.frames);
        session.resources.scheduler = Some(AudioPlaybackScheduler::new(playback.clone()));
        session.resources.playback = Some(playback);

        let setup = SessionSetup {
            api_key,
            model: self.config.live.model.clone(),
            voice: self.config.live.voice.clone(),
            system_instruction: session.plan.system_instruction.clone(),
            function_declarations: session.plan.function_declarations.clone(),
        };

        info!(
            call_id = %session.id,
            scenario = %session.plan.scenario_id,
            model = %setup.model,
            "Starting call"
        );

        self.session = Some(session);
        self.notify_status(CallStatus::Connecting);
        self.notify_transcript();
        self.notify_metrics();

        match self.connector.open(setup).await {
            Ok(remote) => {
                if let Some(session) = self.session.as_mut() {
                    session.resources.remote = Some(remote.handle);
                    session.resources.events = Some(remote.events);
                }
                Ok(())
            }
            Err(e) => {
                let err = match e {
                    CallError::Transport(_) => e,
                    other => CallError::Transport(other.to_string()),
                };
                self.terminate(&err);
                Err(err)
            }
        }
    }

    fn abort_to_idle(&mut self, previous: CallStatus, err: CallError) -> CallError {
        warn!("Call start aborted: {}", err);
        if previous != CallStatus::Idle {
            self.notify_status(CallStatus::Idle);
        }
        err
    }

    /// Hang up. A no-op unless a call is connecting or active.
    ///
    /// The graceful close is only requested; local cleanup never waits for it.
    pub fn end(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !matches!(session.status, CallStatus::Connecting | CallStatus::Active) {
            return;
        }

        session.status = CallStatus::Ended;
        if let Some(remote) = session.resources.remote.as_mut() {
            if let Err(e) = remote.close() {
                warn!(call_id = %session.id, "Graceful close failed: {}", e);
            }
        }
        if session.resources.teardown() {
            info!(
                call_id = %session.id,
                duration_secs = (Utc::now() - session.started_at).num_seconds(),
                "Call ended by operator"
            );
        }
        self.notify_status(CallStatus::Ended);
    }

    /// Fatal path: end the call and release everything.
    fn terminate(&mut self, err: &CallError) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !matches!(session.status, CallStatus::Connecting | CallStatus::Active) {
            return;
        }

        error!(call_id = %session.id, "Call terminated: {}", err);
        session.status = CallStatus::Ended;
        session.resources.teardown();
        self.notify_status(CallStatus::Ended);
    }

    pub fn set_muted(&mut self, muted: bool) {
        if let Some(session) = self.session.as_ref() {
            session.muted.store(muted, Ordering::SeqCst);
            debug!(call_id = %session.id, muted, "Mute changed");
        }
    }

    /// Handle one inbound event. Returns the transport error when the event
    /// terminated the call.
    pub fn handle_remote_event(&mut self, event: RemoteEvent) -> CallResult<()> {
        match event {
            RemoteEvent::Open => {
                self.activate();
                Ok(())
            }
            RemoteEvent::Message(message) => {
                self.route_message(message);
                Ok(())
            }
            RemoteEvent::Error(message) => self.fail(CallError::Transport(message)),
            RemoteEvent::Closed(code) => {
                let reason = match code {
                    Some(code) => format!("Remote session closed (code {})", code),
                    None => "Remote session closed".to_string(),
                };
                self.fail(CallError::Transport(reason))
            }
        }
    }

    fn fail(&mut self, err: CallError) -> CallResult<()> {
        if !matches!(self.status(), CallStatus::Connecting | CallStatus::Active) {
            debug!("Ignoring late transport signal: {}", err);
            return Ok(());
        }
        self.terminate(&err);
        Err(err)
    }

    fn activate(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.status != CallStatus::Connecting {
            return;
        }
        let Some(sender) = session.resources.remote.as_ref().map(|remote| remote.sender()) else {
            return;
        };

        if let Some(mut frames) = session.resources.pending_frames.take() {
            // Audio from before the agent was ready is not part of the call
            let mut stale = 0;
            while frames.try_recv().is_ok() {
                stale += 1;
            }
            if stale > 0 {
                debug!(stale, "Discarded frames captured while connecting");
            }
            let pump = AudioCaptureChannel::new(session.muted.clone());
            session.resources.capture_task = Some(tokio::spawn(pump.pump(frames, sender.clone())));
        }

        let bridge = ToolCallBridge::new(session.plan.tool_handler.clone());
        session.resources.tool_worker = Some(ToolWorker::spawn(bridge, sender));

        session.status = CallStatus::Active;
        info!(call_id = %session.id, "Call active");
        self.notify_status(CallStatus::Active);
    }

    fn route_message(&mut self, message: ServerEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !matches!(session.status, CallStatus::Connecting | CallStatus::Active) {
            return;
        }

        let mut transcript_changed = false;
        if let Some(text) = message.input_transcript.as_deref() {
            session.transcript.apply_fragment(Speaker::Operator, text);
            transcript_changed = true;
        }
        if let Some(text) = message.output_transcript.as_deref() {
            session.transcript.apply_fragment(Speaker::Agent, text);
            transcript_changed = true;
        }
        if message.turn_complete {
            session.transcript.turn_complete();
            transcript_changed = true;
        }
        if message.interrupted {
            debug!(call_id = %session.id, "Agent reported interruption");
        }

        if let Some(scheduler) = session.resources.scheduler.as_mut() {
            for chunk in &message.audio_chunks {
                if let Err(e) = scheduler.enqueue(chunk) {
                    warn!(call_id = %session.id, "Failed to schedule audio chunk: {}", e);
                }
            }
        }

        if !message.tool_calls.is_empty() {
            match session.resources.tool_worker.as_ref() {
                Some(worker) => worker.submit(message.tool_calls),
                None => warn!(
                    call_id = %session.id,
                    count = message.tool_calls.len(),
                    "Tool calls received before the call was active; dropping"
                ),
            }
        }

        if transcript_changed {
            self.notify_transcript();
        }
    }

    /// Score the finished call and overwrite the metrics with the result.
    pub async fn evaluate(&mut self) -> CallResult<EvaluationReport> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| CallError::InvalidState("No call to evaluate".to_string()))?;
        if session.status != CallStatus::Ended {
            return Err(CallError::InvalidState(format!(
                "Evaluation is only available after the call has ended (call is {})",
                session.status
            )));
        }
        if session.transcript.len() < 2 {
            return Err(CallError::Usage(
                "Not enough conversation to evaluate".to_string(),
            ));
        }

        let request = EvaluationRequest {
            title: session.plan.title.clone(),
            transcript: session.transcript.entries().to_vec(),
            metric_labels: session.plan.metric_labels.clone(),
        };
        let call_id = session.id;

        let report = self
            .evaluator
            .evaluate(request)
            .await
            .map_err(|e| CallError::Evaluation(e.to_string()))?;

        if let Some(session) = self.session.as_mut() {
            for metric in session.metrics.iter_mut() {
                metric.value = report.score_for(&metric.label);
            }
            info!(call_id = %call_id, metrics = ?session.metrics, "Evaluation applied");
        }
        self.notify_metrics();
        Ok(report)
    }

    /// Next inbound event of the current call. Pends forever when there is none.
    pub async fn next_remote_event(&mut self) -> RemoteEvent {
        let events = self
            .session
            .as_mut()
            .and_then(|session| session.resources.events.as_mut());
        match events {
            Some(events) => events.recv().await.unwrap_or(RemoteEvent::Closed(None)),
            None => std::future::pending::<RemoteEvent>().await,
        }
    }

    /// Drive the controller from host commands and remote events until the
    /// host goes away, then end any call in progress.
    pub async fn run(mut self, mut commands: mpsc::Receiver<CallCommand>) {
        loop {
            tokio::select! {
                // Remote events first so a queued failure is reported before a hang-up
                biased;

                event = self.next_remote_event() => {
                    if let Err(e) = self.handle_remote_event(event) {
                        self.observer.on_error(&e);
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => self.dispatch(command).await,
                    None => break,
                },
            }
        }

        self.end();
        debug!("Session controller stopped");
    }

    async fn dispatch(&mut self, command: CallCommand) {
        let result = match command {
            CallCommand::Start(plan) => self.start(plan).await,
            CallCommand::End => {
                self.end();
                Ok(())
            }
            CallCommand::SetMuted(muted) => {
                self.set_muted(muted);
                Ok(())
            }
            CallCommand::Evaluate => self.evaluate().await.map(|report| {
                self.observer.on_evaluation(&report);
            }),
        };

        if let Err(e) = result {
            self.observer.on_error(&e);
        }
    }

    fn notify_status(&self, status: CallStatus) {
        self.observer.on_status_change(status);
    }

    fn notify_transcript(&self) {
        if let Some(session) = self.session.as_ref() {
            self.observer.on_transcript_change(session.transcript.entries());
        }
    }

    fn notify_metrics(&self) {
        if let Some(session) = self.session.as_ref() {
            self.observer.on_metrics_change(&session.metrics);
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.resources.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::Microphone;
    use crate::call::playback::tests::{chunk, ManualPlayback};
    use crate::call::remote::{
        OutboundMessage, OutboundSender, RemoteSession, ToolCallRequest,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        microphone_opens: AtomicUsize,
        microphone_releases: Arc<AtomicUsize>,
        fail_microphone: bool,
        fail_playback: bool,
        frames: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
        playback: Mutex<Option<Arc<ManualPlayback>>>,
    }

    impl FakeBackend {
        fn playback(&self) -> Arc<ManualPlayback> {
            self.playback.lock().unwrap().clone().unwrap()
        }

        fn frame_sender(&self) -> mpsc::Sender<Vec<f32>> {
            self.frames.lock().unwrap().clone().unwrap()
        }
    }

    struct FakeMicrophone {
        releases: Arc<AtomicUsize>,
    }

    impl CaptureDevice for FakeMicrophone {
        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AudioBackend for FakeBackend {
        fn open_microphone(&self, _: u32, _: usize, queue_depth: usize) -> CallResult<Microphone> {
            if self.fail_microphone {
                return Err(CallError::Device("Permission denied".to_string()));
            }
            self.microphone_opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(queue_depth);
            *self.frames.lock().unwrap() = Some(tx);
            Ok(Microphone {
                frames: rx,
                device: Box::new(FakeMicrophone {
                    releases: self.microphone_releases.clone(),
                }),
            })
        }

        fn open_playback(&self, _: u32) -> CallResult<Arc<dyn PlaybackContext>> {
            if self.fail_playback {
                return Err(CallError::Device("No output device".to_string()));
            }
            let playback = Arc::new(ManualPlayback::default());
            *self.playback.lock().unwrap() = Some(playback.clone());
            Ok(playback)
        }
    }

    struct FakeHandle {
        sender: OutboundSender,
        closes: Arc<AtomicUsize>,
        fail_close: bool,
    }

    impl RemoteHandle for FakeHandle {
        fn sender(&self) -> OutboundSender {
            self.sender.clone()
        }

        fn close(&mut self) -> CallResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(CallError::Transport("close frame rejected".to_string()));
            }
            Ok(())
        }
    }

    /// Connector whose far end is held by the test.
    #[derive(Default)]
    struct FakeConnector {
        fail: bool,
        fail_close: bool,
        closes: Arc<AtomicUsize>,
        setups: Mutex<Vec<SessionSetup>>,
        events: Mutex<Option<mpsc::Sender<RemoteEvent>>>,
        outbound: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    }

    impl FakeConnector {
        fn take_outbound(&self) -> mpsc::Receiver<OutboundMessage> {
            self.outbound.lock().unwrap().take().unwrap()
        }
    }

    #[async_trait]
    impl RemoteConnector for FakeConnector {
        async fn open(&self, setup: SessionSetup) -> CallResult<RemoteSession> {
            if self.fail {
                return Err(CallError::Transport("connection refused".to_string()));
            }
            self.setups.lock().unwrap().push(setup);
            let (event_tx, event_rx) = mpsc::channel(16);
            let (out_tx, out_rx) = mpsc::channel(16);
            *self.events.lock().unwrap() = Some(event_tx);
            *self.outbound.lock().unwrap() = Some(out_rx);
            Ok(RemoteSession {
                handle: Box::new(FakeHandle {
                    sender: OutboundSender::new(out_tx),
                    closes: self.closes.clone(),
                    fail_close: self.fail_close,
                }),
                events: event_rx,
            })
        }
    }

    struct FixedEvaluator;

    #[async_trait]
    impl Evaluator for FixedEvaluator {
        async fn evaluate(&self, request: EvaluationRequest) -> anyhow::Result<EvaluationReport> {
            assert_eq!(request.transcript.len(), 2);
            Ok(EvaluationReport {
                scores: HashMap::from([("accuracy".to_string(), 90.0), ("upselling".to_string(), 40.0)]),
                good_points: vec!["Confirmed the room number".to_string()],
                areas_for_improvement: vec![],
            })
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        statuses: Mutex<Vec<CallStatus>>,
        transcripts: Mutex<Vec<Vec<TranscriptEntry>>>,
        metrics: Mutex<Vec<Vec<MetricScore>>>,
        errors: Mutex<Vec<CallError>>,
    }

    impl CallObserver for RecordingObserver {
        fn on_status_change(&self, status: CallStatus) {
            self.statuses.lock().unwrap().push(status);
        }

        fn on_transcript_change(&self, entries: &[TranscriptEntry]) {
            self.transcripts.lock().unwrap().push(entries.to_vec());
        }

        fn on_metrics_change(&self, metrics: &[MetricScore]) {
            self.metrics.lock().unwrap().push(metrics.to_vec());
        }

        fn on_error(&self, error: &CallError) {
            self.errors.lock().unwrap().push(error.clone());
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn call(&self, name: &str, _arguments: &Value) -> anyhow::Result<Value> {
            Ok(json!({ "handled": name }))
        }
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        connector: Arc<FakeConnector>,
        observer: Arc<RecordingObserver>,
        controller: SessionController,
    }

    fn harness_with(backend: FakeBackend, connector: FakeConnector, api_key: Option<&str>) -> Harness {
        let mut config = AppConfig::default();
        config.live.api_key = api_key.map(str::to_string);
        let backend = Arc::new(backend);
        let connector = Arc::new(connector);
        let observer = Arc::new(RecordingObserver::default());
        let controller = SessionController::new(
            config,
            backend.clone(),
            connector.clone(),
            Arc::new(FixedEvaluator),
            observer.clone(),
        );
        Harness {
            backend,
            connector,
            observer,
            controller,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeBackend::default(), FakeConnector::default(), Some("test-key"))
    }

    fn plan() -> CallPlan {
        CallPlan {
            scenario_id: "rs1".to_string(),
            title: "Hotel Room Service".to_string(),
            system_instruction: "You are a hotel guest.".to_string(),
            function_declarations: vec![json!({ "name": "placeOrder" })],
            metric_labels: vec!["Accuracy".into(), "Upselling".into(), "Resolution".into()],
            tool_handler: Some(Arc::new(EchoHandler)),
        }
    }

    async fn active(h: &mut Harness) {
        h.controller.start(plan()).await.unwrap();
        h.controller.handle_remote_event(RemoteEvent::Open).unwrap();
        assert_eq!(h.controller.status(), CallStatus::Active);
    }

    fn releases(h: &Harness) -> usize {
        h.backend.microphone_releases.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_end_while_idle_is_noop() {
        let mut h = harness();
        h.controller.end();
        assert_eq!(h.controller.status(), CallStatus::Idle);
        assert!(h.observer.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_before_acquiring_devices() {
        let mut h = harness_with(FakeBackend::default(), FakeConnector::default(), None);
        let err = h.controller.start(plan()).await.unwrap_err();

        assert!(matches!(err, CallError::Configuration(_)));
        assert_eq!(h.controller.status(), CallStatus::Idle);
        assert_eq!(h.backend.microphone_opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_passes_plan_to_remote_setup() {
        let mut h = harness();
        h.controller.start(plan()).await.unwrap();

        assert_eq!(h.controller.status(), CallStatus::Connecting);
        let setups = h.connector.setups.lock().unwrap();
        assert_eq!(setups[0].api_key, "test-key");
        assert_eq!(setups[0].voice, "Zephyr");
        assert_eq!(setups[0].system_instruction, "You are a hotel guest.");
        assert_eq!(
            *h.observer.statuses.lock().unwrap(),
            vec![CallStatus::Connecting]
        );
    }

    #[tokio::test]
    async fn test_start_while_active_is_rejected_without_side_effects() {
        let mut h = harness();
        active(&mut h).await;

        let err = h.controller.start(plan()).await.unwrap_err();

        assert!(matches!(err, CallError::InvalidState(_)));
        assert_eq!(h.controller.status(), CallStatus::Active);
        assert_eq!(h.backend.microphone_opens.load(Ordering::SeqCst), 1);
        assert_eq!(releases(&h), 0);
    }

    #[tokio::test]
    async fn test_microphone_failure_stays_idle() {
        let backend = FakeBackend {
            fail_microphone: true,
            ..Default::default()
        };
        let mut h = harness_with(backend, FakeConnector::default(), Some("k"));

        let err = h.controller.start(plan()).await.unwrap_err();
        assert!(matches!(err, CallError::Device(_)));
        assert_eq!(h.controller.status(), CallStatus::Idle);
        assert!(h.connector.setups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_playback_failure_releases_microphone() {
        let backend = FakeBackend {
            fail_playback: true,
            ..Default::default()
        };
        let mut h = harness_with(backend, FakeConnector::default(), Some("k"));

        let err = h.controller.start(plan()).await.unwrap_err();
        assert!(matches!(err, CallError::Device(_)));
        assert_eq!(h.controller.status(), CallStatus::Idle);
        assert_eq!(releases(&h), 1);
    }

    #[tokio::test]
    async fn test_open_failure_ends_call_and_cleans_up() {
        let connector = FakeConnector {
            fail: true,
            ..Default::default()
        };
        let mut h = harness_with(FakeBackend::default(), connector, Some("k"));

        let err = h.controller.start(plan()).await.unwrap_err();
        assert!(matches!(err, CallError::Transport(_)));
        assert_eq!(h.controller.status(), CallStatus::Ended);
        assert_eq!(releases(&h), 1);
        assert_eq!(h.backend.playback().closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_end_twice_then_transport_error_tears_down_once() {
        let mut h = harness();
        active(&mut h).await;
        h.controller
            .handle_remote_event(RemoteEvent::Message(ServerEvent {
                audio_chunks: vec![chunk(2400), chunk(2400)],
                ..Default::default()
            }))
            .unwrap();

        h.controller.end();
        h.controller.end();
        assert!(h
            .controller
            .handle_remote_event(RemoteEvent::Error("socket reset".to_string()))
            .is_ok());

        let playback = h.backend.playback();
        assert_eq!(h.controller.status(), CallStatus::Ended);
        assert_eq!(releases(&h), 1);
        assert_eq!(playback.closes.load(Ordering::SeqCst), 1);
        assert_eq!(playback.stops.load(Ordering::SeqCst), 2);
        assert_eq!(h.connector.closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            *h.observer.statuses.lock().unwrap(),
            vec![CallStatus::Connecting, CallStatus::Active, CallStatus::Ended]
        );
    }

    #[tokio::test]
    async fn test_end_cleans_up_when_graceful_close_fails() {
        let connector = FakeConnector {
            fail_close: true,
            ..Default::default()
        };
        let mut h = harness_with(FakeBackend::default(), connector, Some("k"));
        active(&mut h).await;

        h.controller.end();

        assert_eq!(h.controller.status(), CallStatus::Ended);
        assert_eq!(h.connector.closes.load(Ordering::SeqCst), 1);
        assert_eq!(releases(&h), 1);
        assert_eq!(h.backend.playback().closes.load(Ordering::SeqCst), 1);
        assert!(h.observer.errors.lock().unwrap().is_empty());
        assert_eq!(
            *h.observer.statuses.lock().unwrap(),
            vec![CallStatus::Connecting, CallStatus::Active, CallStatus::Ended]
        );
    }

    #[tokio::test]
    async fn test_transport_error_ends_call_and_later_end_is_noop() {
        let mut h = harness();
        active(&mut h).await;

        let err = h
            .controller
            .handle_remote_event(RemoteEvent::Closed(Some(1011)))
            .unwrap_err();
        assert!(matches!(err, CallError::Transport(_)));
        h.controller.end();

        assert_eq!(h.controller.status(), CallStatus::Ended);
        assert_eq!(releases(&h), 1);
        assert_eq!(h.connector.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_end_while_connecting_ends_call() {
        let mut h = harness();
        h.controller.start(plan()).await.unwrap();

        h.controller.end();

        assert_eq!(h.controller.status(), CallStatus::Ended);
        assert_eq!(releases(&h), 1);
        // A late open after hang-up must not revive the call
        h.controller.handle_remote_event(RemoteEvent::Open).unwrap();
        assert_eq!(h.controller.status(), CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_messages_feed_transcript_playback_and_tools() {
        let mut h = harness();
        active(&mut h).await;
        let mut outbound = h.connector.take_outbound();

        h.controller
            .handle_remote_event(RemoteEvent::Message(ServerEvent {
                output_transcript: Some("I'd like breakfast".to_string()),
                audio_chunks: vec![chunk(4800)],
                tool_calls: vec![ToolCallRequest {
                    call_id: "fc-1".to_string(),
                    name: "getMenuItems".to_string(),
                    arguments: json!({}),
                }],
                ..Default::default()
            }))
            .unwrap();
        h.controller
            .handle_remote_event(RemoteEvent::Message(ServerEvent {
                input_transcript: Some("Certainly".to_string()),
                turn_complete: true,
                ..Default::default()
            }))
            .unwrap();

        let session = h.controller.session().unwrap();
        assert_eq!(session.transcript().len(), 2);
        assert!(session.transcript().iter().all(|e| e.is_final));
        assert_eq!(h.backend.playback().starts.lock().unwrap().len(), 1);

        match outbound.recv().await.unwrap() {
            OutboundMessage::ToolResponse(response) => {
                assert_eq!(response.call_id, "fc-1");
                assert_eq!(response.result, json!({ "result": { "handled": "getMenuItems" } }));
            }
            other => panic!("unexpected outbound message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_capture_flows_after_open_and_respects_mute() {
        let mut h = harness();
        active(&mut h).await;
        let mut outbound = h.connector.take_outbound();
        let frames = h.backend.frame_sender();

        frames.send(vec![0.1; 8]).await.unwrap();
        assert!(matches!(outbound.recv().await.unwrap(), OutboundMessage::Audio(_)));

        h.controller.set_muted(true);
        assert!(h.controller.session().unwrap().is_muted());
        frames.send(vec![0.1; 8]).await.unwrap();
        // Let the pump take the muted frame before unmuting
        while frames.capacity() < frames.max_capacity() {
            tokio::task::yield_now().await;
        }
        h.controller.set_muted(false);
        frames.send(vec![0.2; 8]).await.unwrap();

        match outbound.recv().await.unwrap() {
            OutboundMessage::Audio(frame) => {
                assert_eq!(frame.data, crate::audio::codec::encode_frame(&[0.2; 8]));
            }
            other => panic!("unexpected outbound message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_evaluate_requires_ended_call_and_enough_transcript() {
        let mut h = harness();
        active(&mut h).await;
        assert!(matches!(
            h.controller.evaluate().await.unwrap_err(),
            CallError::InvalidState(_)
        ));

        h.controller
            .handle_remote_event(RemoteEvent::Message(ServerEvent {
                output_transcript: Some("Hello?".to_string()),
                ..Default::default()
            }))
            .unwrap();
        h.controller.end();
        assert!(matches!(
            h.controller.evaluate().await.unwrap_err(),
            CallError::Usage(_)
        ));
    }

    #[tokio::test]
    async fn test_evaluation_overwrites_metrics_by_label() {
        let mut h = harness();
        active(&mut h).await;
        h.controller
            .handle_remote_event(RemoteEvent::Message(ServerEvent {
                output_transcript: Some("Two coffees please".to_string()),
                input_transcript: Some("Right away".to_string()),
                turn_complete: true,
                ..Default::default()
            }))
            .unwrap();
        h.controller.end();

        let report = h.controller.evaluate().await.unwrap();
        assert_eq!(report.good_points.len(), 1);

        let values: Vec<(String, f64)> = h
            .controller
            .session()
            .unwrap()
            .metrics()
            .iter()
            .map(|m| (m.label.clone(), m.value))
            .collect();
        assert_eq!(
            values,
            vec![
                ("Accuracy".to_string(), 90.0),
                ("Upselling".to_string(), 40.0),
                ("Resolution".to_string(), 0.0),
            ]
        );
        assert_eq!(h.observer.metrics.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_loop_reports_transport_error_and_ends_on_host_drop() {
        let h = harness();
        let (commands, rx) = mpsc::channel(8);
        let backend = h.backend.clone();
        let connector = h.connector.clone();
        let observer = h.observer.clone();
        let task = tokio::spawn(h.controller.run(rx));

        commands.send(CallCommand::Start(plan())).await.unwrap();
        // Wait for the connector to hand out the event channel
        let events = loop {
            if let Some(events) = connector.events.lock().unwrap().clone() {
                break events;
            }
            tokio::task::yield_now().await;
        };
        events.send(RemoteEvent::Open).await.unwrap();
        events
            .send(RemoteEvent::Error("upstream went away".to_string()))
            .await
            .unwrap();
        drop(commands);
        task.await.unwrap();

        assert_eq!(backend.microphone_releases.load(Ordering::SeqCst), 1);
        let errors = observer.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], CallError::Transport(_)));
    }
}
