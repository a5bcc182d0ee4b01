//! Capture path: microphone frames in, encoded outbound frames out.
//!
//! Frames arrive from the device thread over a bounded channel, so cadence
//! follows the device's own buffering. While the operator is muted, frames are
//! still drained (capture keeps running) but nothing is sent.

use crate::audio::codec;
use crate::call::remote::{OutboundFrame, OutboundSender, CAPTURE_MIME_TYPE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Counters reported when the pump finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub emitted: u64,
    pub suppressed: u64,
}

pub struct AudioCaptureChannel {
    muted: Arc<AtomicBool>,
}

impl AudioCaptureChannel {
    pub fn new(muted: Arc<AtomicBool>) -> Self {
        Self { muted }
    }

    /// Encode and send frames in arrival order until the frame stream ends or
    /// the session stops accepting sends.
    pub async fn pump(
        self,
        mut frames: mpsc::Receiver<Vec<f32>>,
        sender: OutboundSender,
    ) -> CaptureStats {
        let mut stats = CaptureStats::default();

        while let Some(frame) = frames.recv().await {
            if self.muted.load(Ordering::SeqCst) {
                stats.suppressed += 1;
                continue;
            }

            let outbound = OutboundFrame {
                data: codec::encode_frame(&frame),
                mime_type: CAPTURE_MIME_TYPE.to_string(),
            };
            if let Err(e) = sender.send_frame(outbound).await {
                debug!("Capture pump stopping: {}", e);
                break;
            }
            stats.emitted += 1;
        }

        debug!(
            emitted = stats.emitted,
            suppressed = stats.suppressed,
            "Capture pump finished"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::remote::OutboundMessage;

    fn frame(value: f32) -> Vec<f32> {
        vec![value; 4]
    }

    #[tokio::test]
    async fn test_mute_suppresses_sends_in_order() {
        let muted = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);

        frame_tx.send(frame(0.1)).await.unwrap();
        frame_tx.send(frame(0.2)).await.unwrap();

        let pump = tokio::spawn(
            AudioCaptureChannel::new(muted.clone()).pump(frame_rx, OutboundSender::new(out_tx)),
        );

        // Wait until both unmuted frames went out before muting
        let first = out_rx.recv().await.unwrap();
        let second = out_rx.recv().await.unwrap();
        muted.store(true, Ordering::SeqCst);
        frame_tx.send(frame(0.3)).await.unwrap();
        frame_tx.send(frame(0.4)).await.unwrap();
        drop(frame_tx);

        let stats = pump.await.unwrap();
        assert_eq!(stats, CaptureStats { emitted: 2, suppressed: 2 });
        assert!(out_rx.try_recv().is_err());

        let expected: Vec<_> = [0.1, 0.2]
            .iter()
            .map(|&v| OutboundMessage::Audio(OutboundFrame {
                data: codec::encode_frame(&frame(v)),
                mime_type: CAPTURE_MIME_TYPE.to_string(),
            }))
            .collect();
        assert_eq!(vec![first, second], expected);
    }

    #[tokio::test]
    async fn test_pump_stops_when_session_closes() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        drop(out_rx);

        frame_tx.send(frame(0.5)).await.unwrap();
        frame_tx.send(frame(0.5)).await.unwrap();

        let stats = AudioCaptureChannel::new(Arc::new(AtomicBool::new(false)))
            .pump(frame_rx, OutboundSender::new(out_tx))
            .await;
        assert_eq!(stats.emitted, 0);
    }
}
