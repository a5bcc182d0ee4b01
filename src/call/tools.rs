//! # Tool Call Bridge
//!
//! Services the function calls the agent makes mid-conversation.
//!
//! ## Ordering:
//! Requests in one batch are handled one at a time: invoke the handler, wait
//! for it, send the correlated response, then move to the next request.
//! Batches go through a single worker task in arrival order, so a slow
//! handler holds up later tool calls but never the audio path.
//!
//! ## Response Payload:
//! - handler succeeded: `{"result": <value>}`
//! - handler failed or none configured: `{"error": "<message>"}`
//!
//! A handler failure is reported to the agent and the call carries on.

use crate::call::remote::{OutboundSender, ToolCallRequest, ToolCallResponse};
use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Business logic the agent can invoke by name.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, name: &str, arguments: &Value) -> anyhow::Result<Value>;
}

#[derive(Clone, Default)]
pub struct ToolCallBridge {
    handler: Option<Arc<dyn ToolHandler>>,
}

impl ToolCallBridge {
    pub fn new(handler: Option<Arc<dyn ToolHandler>>) -> Self {
        Self { handler }
    }

    /// Run the handler for one request and shape its outcome as a response.
    pub async fn resolve(&self, request: &ToolCallRequest) -> ToolCallResponse {
        let result = match &self.handler {
            None => {
                warn!(tool = %request.name, "Tool call received with no handler configured");
                json!({ "error": "No tool handler is configured for this call" })
            }
            Some(handler) => match handler.call(&request.name, &request.arguments).await {
                Ok(value) => json!({ "result": value }),
                Err(e) => {
                    let err = CallError::ToolHandler(e.to_string());
                    warn!(tool = %request.name, call_id = %request.call_id, "{}", err);
                    json!({ "error": e.to_string() })
                }
            },
        };

        ToolCallResponse {
            call_id: request.call_id.clone(),
            name: request.name.clone(),
            result,
        }
    }

    /// Service a batch sequentially, sending each response before starting
    /// the next request. Fails only if the session stopped accepting sends.
    pub async fn service_batch(
        &self,
        requests: Vec<ToolCallRequest>,
        sender: &OutboundSender,
    ) -> CallResult<usize> {
        let mut sent = 0;
        for request in &requests {
            info!(tool = %request.name, call_id = %request.call_id, "Servicing tool call");
            let response = self.resolve(request).await;
            sender.send_tool_response(response).await?;
            sent += 1;
        }
        Ok(sent)
    }
}

/// Background task that services tool batches in arrival order.
pub struct ToolWorker {
    batches: mpsc::UnboundedSender<Vec<ToolCallRequest>>,
    task: JoinHandle<()>,
}

impl ToolWorker {
    pub fn spawn(bridge: ToolCallBridge, sender: OutboundSender) -> Self {
        let (batches, mut rx) = mpsc::unbounded_channel::<Vec<ToolCallRequest>>();
        let task = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                if let Err(e) = bridge.service_batch(batch, &sender).await {
                    debug!("Tool worker stopping: {}", e);
                    break;
                }
            }
        });
        Self { batches, task }
    }

    pub fn submit(&self, batch: Vec<ToolCallRequest>) {
        if self.batches.send(batch).is_err() {
            debug!("Tool worker already stopped; dropping batch");
        }
    }

    /// Cancel any in-flight handler and stop the worker.
    pub fn abort(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::remote::OutboundMessage;
    use std::sync::Mutex;

    /// Records invocation order and fails on demand.
    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolHandler for RecordingHandler {
        async fn call(&self, name: &str, arguments: &Value) -> anyhow::Result<Value> {
            self.calls.lock().unwrap().push(name.to_string());
            // Yield so an out-of-order implementation would have a chance to interleave
            tokio::task::yield_now().await;
            if name == "explode" {
                anyhow::bail!("kitchen closed");
            }
            Ok(json!({ "echo": arguments.clone() }))
        }
    }

    fn request(id: &str, name: &str) -> ToolCallRequest {
        ToolCallRequest {
            call_id: id.to_string(),
            name: name.to_string(),
            arguments: json!({ "id": id }),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<ToolCallResponse> {
        let mut responses = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let OutboundMessage::ToolResponse(response) = message {
                responses.push(response);
            }
        }
        responses
    }

    #[tokio::test]
    async fn test_batch_responses_follow_request_order() {
        let handler = Arc::new(RecordingHandler::default());
        let bridge = ToolCallBridge::new(Some(handler.clone()));
        let (tx, mut rx) = mpsc::channel(8);

        let sent = bridge
            .service_batch(
                vec![request("c1", "checkAvailability"), request("c2", "makeReservation")],
                &OutboundSender::new(tx),
            )
            .await
            .unwrap();

        assert_eq!(sent, 2);
        let responses = drain(&mut rx);
        let ids: Vec<_> = responses.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(responses[1].name, "makeReservation");
        assert_eq!(responses[1].result, json!({ "result": { "echo": { "id": "c2" } } }));
        assert_eq!(*handler.calls.lock().unwrap(), vec!["checkAvailability", "makeReservation"]);
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_error_payload() {
        let bridge = ToolCallBridge::new(Some(Arc::new(RecordingHandler::default())));
        let (tx, mut rx) = mpsc::channel(8);

        bridge
            .service_batch(
                vec![request("c1", "explode"), request("c2", "getMenuItems")],
                &OutboundSender::new(tx),
            )
            .await
            .unwrap();

        let responses = drain(&mut rx);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].result, json!({ "error": "kitchen closed" }));
        assert!(responses[1].result.get("result").is_some());
    }

    #[tokio::test]
    async fn test_missing_handler_answers_every_request_with_error() {
        let bridge = ToolCallBridge::new(None);
        let response = bridge.resolve(&request("c9", "placeOrder")).await;
        assert_eq!(response.call_id, "c9");
        assert!(response.result.get("error").is_some());
    }

    #[tokio::test]
    async fn test_worker_services_batches_in_arrival_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let worker = ToolWorker::spawn(
            ToolCallBridge::new(Some(Arc::new(RecordingHandler::default()))),
            OutboundSender::new(tx),
        );

        worker.submit(vec![request("a", "getRestaurantInfo")]);
        worker.submit(vec![request("b", "checkAvailability"), request("c", "makeReservation")]);

        let mut ids = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                OutboundMessage::ToolResponse(response) => ids.push(response.call_id),
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(ids, vec!["a", "b", "c"]);
        worker.abort();
    }
}
