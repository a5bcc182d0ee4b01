//! # Gemini Live Transport
//!
//! [`RemoteConnector`] implementation over the Gemini Live bidirectional
//! WebSocket API.
//!
//! ## Session Protocol:
//! 1. **Connect**: `wss://.../BidiGenerateContent?key=API_KEY`
//! 2. **Setup**: first frame is `{"setup": {...}}` with the model, audio
//!    response modality, prebuilt voice, system instruction, tool declarations
//!    and transcription of both directions
//! 3. **Ready**: the server answers `setupComplete`, surfaced as `RemoteEvent::Open`
//! 4. **Streaming**: `realtimeInput.mediaChunks` carry microphone audio out,
//!    `serverContent` carries agent audio and transcripts in, `toolCall`
//!    requests are answered with `toolResponse`
//!
//! The server may send its JSON in text or binary frames; both are parsed.
//!
//! ## Tasks:
//! One writer task drains the outbound queue into the socket; one reader task
//! parses inbound frames into the ordered event channel. Dropping the handle
//! stops both.

use crate::call::remote::{
    InboundAudioChunk, OutboundMessage, OutboundSender, RemoteConnector, RemoteEvent,
    RemoteHandle, RemoteSession, ServerEvent, SessionSetup, ToolCallRequest,
};
use crate::config::LiveConfig;
use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Outbound messages buffered ahead of the socket.
const OUTBOUND_QUEUE: usize = 64;
/// Inbound events buffered ahead of the controller.
const EVENT_QUEUE: usize = 256;

pub struct GeminiLiveConnector {
    endpoint: String,
}

impl GeminiLiveConnector {
    pub fn new(config: &LiveConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
        }
    }
}

#[async_trait]
impl RemoteConnector for GeminiLiveConnector {
    async fn open(&self, setup: SessionSetup) -> CallResult<RemoteSession> {
        let url = format!("{}?key={}", self.endpoint, setup.api_key);
        info!(endpoint = %self.endpoint, model = %setup.model, "Opening live session");

        let (stream, _response) = connect_async(url.as_str()).await?;
        let (mut sink, mut source) = stream.split();

        sink.send(Message::Text(build_setup_message(&setup).to_string()))
            .await?;

        let (out_tx, mut out_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_QUEUE);
        let (close_tx, close_rx) = oneshot::channel::<()>();
        let (event_tx, event_rx) = mpsc::channel::<RemoteEvent>(EVENT_QUEUE);

        tokio::spawn(async move {
            let mut close_rx = close_rx;
            loop {
                tokio::select! {
                    message = out_rx.recv() => {
                        let Some(message) = message else { break };
                        let frame = Message::Text(encode_outbound(&message).to_string());
                        if let Err(e) = sink.send(frame).await {
                            debug!("Live writer stopping: {}", e);
                            return;
                        }
                    }
                    _ = &mut close_rx => break,
                }
            }
            if let Err(e) = sink.close().await {
                debug!("Live session close failed: {}", e);
            }
        });

        let reader = tokio::spawn(async move {
            let closed = loop {
                let text = match source.next().await {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Ignoring non-UTF-8 binary frame from live session");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break RemoteEvent::Closed(frame.map(|f| u16::from(f.code)));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break RemoteEvent::Error(e.to_string()),
                    None => break RemoteEvent::Closed(None),
                };

                match parse_server_message(&text) {
                    Ok(events) => {
                        for event in events {
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Skipping unparseable live message: {}", e),
                }
            };
            let _ = event_tx.send(closed).await;
        });

        Ok(RemoteSession {
            handle: Box::new(GeminiLiveHandle {
                sender: OutboundSender::new(out_tx),
                close_tx: Some(close_tx),
                reader,
            }),
            events: event_rx,
        })
    }
}

struct GeminiLiveHandle {
    sender: OutboundSender,
    close_tx: Option<oneshot::Sender<()>>,
    reader: JoinHandle<()>,
}

impl RemoteHandle for GeminiLiveHandle {
    fn sender(&self) -> OutboundSender {
        self.sender.clone()
    }

    fn close(&mut self) -> CallResult<()> {
        let close_tx = self
            .close_tx
            .take()
            .ok_or_else(|| CallError::InvalidState("Live session already closing".to_string()))?;
        close_tx
            .send(())
            .map_err(|_| CallError::Transport("Live writer already stopped".to_string()))
    }
}

impl Drop for GeminiLiveHandle {
    fn drop(&mut self) {
        // Dropping close_tx also tells the writer to send a close frame
        self.reader.abort();
    }
}

/// Build the first frame of a session.
pub fn build_setup_message(setup: &SessionSetup) -> Value {
    let mut body = json!({
        "model": format!("models/{}", setup.model.trim_start_matches("models/")),
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": setup.voice } }
            }
        },
        "systemInstruction": { "parts": [{ "text": setup.system_instruction }] },
        "inputAudioTranscription": {},
        "outputAudioTranscription": {}
    });

    if !setup.function_declarations.is_empty() {
        body["tools"] = json!([{ "functionDeclarations": setup.function_declarations }]);
    }

    json!({ "setup": body })
}

pub fn encode_outbound(message: &OutboundMessage) -> Value {
    match message {
        OutboundMessage::Audio(frame) => json!({
            "realtimeInput": {
                "mediaChunks": [{ "mimeType": frame.mime_type, "data": frame.data }]
            }
        }),
        OutboundMessage::ToolResponse(response) => json!({
            "toolResponse": {
                "functionResponses": [{
                    "id": response.call_id,
                    "name": response.name,
                    "response": response.result
                }]
            }
        }),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCall>,
    go_away: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCall {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    args: Value,
}

/// Translate one server frame into remote events, in the order the frame
/// lists them.
pub fn parse_server_message(text: &str) -> Result<Vec<RemoteEvent>, serde_json::Error> {
    let message: LiveServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(RemoteEvent::Open);
    }

    if let Some(go_away) = &message.go_away {
        warn!(detail = %go_away, "Live session is about to be closed by the server");
    }

    let mut event = ServerEvent::default();
    if let Some(content) = message.server_content {
        event.input_transcript = content.input_transcription.and_then(|t| t.text);
        event.output_transcript = content.output_transcription.and_then(|t| t.text);
        event.turn_complete = content.turn_complete;
        event.interrupted = content.interrupted;
        event.audio_chunks = content
            .model_turn
            .map(|turn| turn.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|part| part.inline_data)
            .map(|inline| InboundAudioChunk { data: inline.data })
            .collect();
    }
    if let Some(tool_call) = message.tool_call {
        event.tool_calls = tool_call
            .function_calls
            .into_iter()
            .map(|call| ToolCallRequest {
                call_id: call.id,
                name: call.name,
                arguments: if call.args.is_null() { json!({}) } else { call.args },
            })
            .collect();
    }

    if !event.is_empty() {
        events.push(RemoteEvent::Message(event));
    }
    Ok(events)
}
