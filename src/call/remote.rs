//! # Remote Session Primitive
//!
//! The bidirectional session the controller talks to. Opening a session
//! returns a handle plus an ordered event stream, instead of a set of
//! callbacks. The handle hands out [`OutboundSender`]s, which are the only
//! thing the capture pump and the tool worker ever see of the session.

use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// MIME type of outbound capture frames.
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// One encoded capture frame ready for transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub data: String,
    pub mime_type: String,
}

/// One base64 block of agent speech.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundAudioChunk {
    pub data: String,
}

/// A function call requested by the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// The answer to a [`ToolCallRequest`], correlated by `call_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallResponse {
    pub call_id: String,
    pub name: String,
    pub result: Value,
}

/// Everything one inbound server message can carry. Any combination of
/// fields may be present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerEvent {
    pub input_transcript: Option<String>,
    pub output_transcript: Option<String>,
    pub turn_complete: bool,
    pub interrupted: bool,
    pub audio_chunks: Vec<InboundAudioChunk>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ServerEvent {
    pub fn is_empty(&self) -> bool {
        self.input_transcript.is_none()
            && self.output_transcript.is_none()
            && !self.turn_complete
            && !self.interrupted
            && self.audio_chunks.is_empty()
            && self.tool_calls.is_empty()
    }
}

/// Ordered events produced by an open session.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// The remote side is ready; audio may flow
    Open,
    Message(ServerEvent),
    Error(String),
    /// The session closed, with the close code if the peer sent one
    Closed(Option<u16>),
}

/// Messages queued for the transport writer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Audio(OutboundFrame),
    ToolResponse(ToolCallResponse),
}

/// A send-only view of the session's outbound stream.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<OutboundMessage>,
}

impl OutboundSender {
    pub fn new(tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self { tx }
    }

    pub async fn send_frame(&self, frame: OutboundFrame) -> CallResult<()> {
        self.send(OutboundMessage::Audio(frame)).await
    }

    pub async fn send_tool_response(&self, response: ToolCallResponse) -> CallResult<()> {
        self.send(OutboundMessage::ToolResponse(response)).await
    }

    async fn send(&self, message: OutboundMessage) -> CallResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| CallError::Transport("Remote session is closed".to_string()))
    }
}

/// What the agent needs to know before the first frame flows.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub function_declarations: Vec<Value>,
}

/// The controller's exclusive handle on an open session.
pub trait RemoteHandle: Send {
    fn sender(&self) -> OutboundSender;

    /// Request a graceful close. Returns once the request is queued; it never
    /// waits for the peer to acknowledge.
    fn close(&mut self) -> CallResult<()>;
}

/// A freshly opened session.
pub struct RemoteSession {
    pub handle: Box<dyn RemoteHandle>,
    pub events: mpsc::Receiver<RemoteEvent>,
}

/// Opens remote sessions.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn open(&self, setup: SessionSetup) -> CallResult<RemoteSession>;
}
