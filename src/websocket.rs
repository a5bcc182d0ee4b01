//! # Call WebSocket Handler
//!
//! Each connection to `/ws/call` is one practice station: an actor that owns a
//! command channel into its own [`SessionController`] and relays call changes
//! back to the browser.
//!
//! ## WebSocket Protocol:
//! JSON text frames tagged by `type`.
//! - **Client → Server**: `start_call {scenario_id}`, `end_call`,
//!   `set_muted {muted}`, `evaluate`, `pong {timestamp}`
//! - **Server → Client**: `status`, `transcript`, `metrics`, `evaluation`,
//!   `error {code, message}`, `ping {timestamp}`
//!
//! ## Lifecycle:
//! The controller task lives as long as the actor. Stopping the actor (client
//! close, protocol error or heartbeat timeout) drops the command sender, which
//! ends any call in progress and releases its devices.

use crate::call::transcript::TranscriptEntry;
use crate::call::{CallCommand, CallObserver, CallStatus, MetricScore};
use crate::desk::find_scenario;
use crate::error::{AppError, CallError};
use crate::evaluation::EvaluationReport;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
const COMMAND_QUEUE_DEPTH: usize = 16;

/// Messages sent by the browser.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartCall { scenario_id: String },
    EndCall,
    SetMuted { muted: bool },
    Evaluate,
    Pong {
        #[serde(default)]
        timestamp: Option<u64>,
    },
}

/// Messages pushed to the browser.
#[derive(Debug, Clone, Serialize, Message)]
#[serde(tag = "type", rename_all = "snake_case")]
#[rtype(result = "()")]
pub enum ServerMessage {
    Status { status: CallStatus },
    Transcript { entries: Vec<TranscriptEntry> },
    Metrics { metrics: Vec<MetricScore> },
    Evaluation { report: EvaluationReport },
    Error { code: String, message: String },
    Ping { timestamp: u64 },
}

impl ServerMessage {
    fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Forwards controller notifications to the connection's actor.
struct SocketObserver {
    addr: Addr<CallWebSocket>,
}

impl CallObserver for SocketObserver {
    fn on_status_change(&self, status: CallStatus) {
        self.addr.do_send(ServerMessage::Status { status });
    }

    fn on_transcript_change(&self, entries: &[TranscriptEntry]) {
        self.addr.do_send(ServerMessage::Transcript {
            entries: entries.to_vec(),
        });
    }

    fn on_metrics_change(&self, metrics: &[MetricScore]) {
        self.addr.do_send(ServerMessage::Metrics {
            metrics: metrics.to_vec(),
        });
    }

    fn on_evaluation(&self, report: &EvaluationReport) {
        self.addr.do_send(ServerMessage::Evaluation {
            report: report.clone(),
        });
    }

    fn on_error(&self, error: &CallError) {
        self.addr.do_send(ServerMessage::error(error.code(), error.to_string()));
    }
}

pub struct CallWebSocket {
    state: web::Data<AppState>,
    commands: Option<mpsc::Sender<CallCommand>>,
    last_heartbeat: Instant,
}

impl CallWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            commands: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn push(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Failed to serialize server message: {}", e),
        }
    }

    fn forward(&self, ctx: &mut ws::WebsocketContext<Self>, command: CallCommand) {
        let Some(commands) = self.commands.as_ref() else {
            self.push(ctx, &ServerMessage::error("unavailable", "Call controller is not running"));
            return;
        };

        if let Err(e) = commands.try_send(command) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "Too many pending commands, try again",
                mpsc::error::TrySendError::Closed(_) => "Call controller has stopped",
            };
            warn!("Dropped client command: {}", reason);
            self.push(ctx, &ServerMessage::error("busy", reason));
        }
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::StartCall { scenario_id } => match find_scenario(&scenario_id) {
                Some(scenario) => {
                    info!(scenario = %scenario.id, desk = ?scenario.desk, "Client requested a call");
                    let plan = self.state.desks.plan_for(scenario, chrono::Utc::now());
                    self.forward(ctx, CallCommand::Start(plan));
                }
                None => self.push(
                    ctx,
                    &ServerMessage::error("unknown_scenario", format!("No scenario with id '{}'", scenario_id)),
                ),
            },
            ClientMessage::EndCall => self.forward(ctx, CallCommand::End),
            ClientMessage::SetMuted { muted } => self.forward(ctx, CallCommand::SetMuted(muted)),
            ClientMessage::Evaluate => self.forward(ctx, CallCommand::Evaluate),
            ClientMessage::Pong { .. } => self.last_heartbeat = Instant::now(),
        }
    }
}

impl Actor for CallWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Call WebSocket connection started");

        let observer = Arc::new(SocketObserver { addr: ctx.address() });
        match self.state.session_controller(observer) {
            Ok(controller) => {
                let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
                self.commands = Some(tx);
                tokio::spawn(controller.run(rx));
                self.push(ctx, &ServerMessage::Status { status: CallStatus::Idle });
            }
            Err(e) => {
                error!("Failed to create session controller: {}", e);
                self.push(ctx, &ServerMessage::error("internal_error", e.to_string()));
                ctx.stop();
                return;
            }
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Call WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
            act.push(ctx, &ServerMessage::Ping { timestamp });
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender ends the call and stops the controller task
        self.commands.take();
        self.state.close_connection();
        info!("Call WebSocket connection stopped");
    }
}

impl Handler<ServerMessage> for CallWebSocket {
    type Result = ();

    fn handle(&mut self, message: ServerMessage, ctx: &mut Self::Context) {
        if let ServerMessage::Status { status } = &message {
            match status {
                CallStatus::Connecting => self.state.record_call_started(),
                CallStatus::Ended => self.state.record_call_ended(),
                _ => {}
            }
        }
        self.push(ctx, &message);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_client_message(message, ctx),
                Err(err) => {
                    debug!("Rejected client frame: {}", text);
                    self.push(ctx, &ServerMessage::error("invalid_json", format!("Invalid JSON: {}", err)));
                }
            },
            Ok(ws::Message::Binary(_)) => {
                self.push(
                    ctx,
                    &ServerMessage::error("unsupported", "Binary frames are not part of the call protocol"),
                );
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Call WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("Call WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Upgrade `GET /ws/call` to a call connection.
pub async fn call_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    info!("New call connection request from: {:?}", req.connection_info().peer_addr());

    if !state.try_open_connection() {
        warn!("Rejecting call connection: connection limit reached");
        return Err(AppError::Unavailable("Too many active call connections".to_string()).into());
    }

    let response = ws::start(CallWebSocket::new(state.clone()), &req, stream);
    if response.is_err() {
        state.close_connection();
    }
    response
}
