//! # Playback Scheduling
//!
//! Turns inbound agent audio into gapless output on the playback context's
//! clock. A single cursor, `next_start_time`, is clamped to the device clock
//! on every chunk so a stall never schedules audio in the past, then advanced
//! by each unit's duration so consecutive units abut exactly.
//!
//! Every scheduled unit stays in the live set until it ends on its own.
//! [`AudioPlaybackScheduler::stop_all`] is the only cancellation path.

use crate::audio::codec;
use crate::audio::device::{PlaybackContext, PlaybackSource};
use crate::call::remote::InboundAudioChunk;
use crate::error::{CallError, CallResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

type LiveSet = Arc<Mutex<HashMap<u64, Box<dyn PlaybackSource>>>>;

/// Placement of one scheduled unit on the device clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledUnit {
    pub id: u64,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledUnit {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

pub struct AudioPlaybackScheduler {
    context: Arc<dyn PlaybackContext>,
    next_start_time: f64,
    next_id: u64,
    live: LiveSet,
}

impl AudioPlaybackScheduler {
    pub fn new(context: Arc<dyn PlaybackContext>) -> Self {
        Self {
            context,
            next_start_time: 0.0,
            next_id: 0,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Number of units scheduled and not yet finished.
    pub fn live_count(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }

    /// Schedule one chunk right after the previous one.
    ///
    /// A chunk that fails to decode is skipped and leaves the cursor alone.
    /// Empty chunks schedule nothing.
    pub fn enqueue(&mut self, chunk: &InboundAudioChunk) -> CallResult<Option<ScheduledUnit>> {
        self.next_start_time = self.next_start_time.max(self.context.current_time());

        let samples = match codec::decode_chunk(&chunk.data) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Skipping undecodable audio chunk: {}", e);
                return Ok(None);
            }
        };
        if samples.is_empty() {
            return Ok(None);
        }

        let duration = samples.len() as f64 / self.context.sample_rate() as f64;
        let start = self.next_start_time;
        let id = self.next_id;
        self.next_id += 1;

        let ended_set = self.live.clone();
        let on_ended = Box::new(move || {
            if let Ok(mut live) = ended_set.lock() {
                live.remove(&id);
            }
        });

        // Hold the set across scheduling so a completion callback can never
        // run before the unit is tracked
        let mut live = self
            .live
            .lock()
            .map_err(|_| CallError::Device("Playback set lock poisoned".to_string()))?;
        let source = self.context.start_source(samples, start, on_ended)?;
        live.insert(id, source);
        drop(live);

        self.next_start_time += duration;
        debug!(unit = id, start, duration, "Scheduled playback unit");

        Ok(Some(ScheduledUnit { id, start, duration }))
    }

    /// Stop every live unit immediately and clear the set.
    pub fn stop_all(&mut self) -> usize {
        let drained: Vec<_> = match self.live.lock() {
            Ok(mut live) => live.drain().map(|(_, source)| source).collect(),
            Err(_) => return 0,
        };
        for source in &drained {
            source.stop();
        }
        drained.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::call::remote::InboundAudioChunk;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Ended = Box<dyn FnOnce() + Send>;

    /// Playback context with a hand-driven clock that records every start.
    #[derive(Default)]
    pub(crate) struct ManualPlayback {
        pub now: Mutex<f64>,
        pub starts: Mutex<Vec<(f64, usize)>>,
        pub pending: Mutex<Vec<Ended>>,
        pub stops: Arc<AtomicUsize>,
        pub closes: AtomicUsize,
    }

    impl ManualPlayback {
        pub(crate) fn set_time(&self, t: f64) {
            *self.now.lock().unwrap() = t;
        }

        /// Fire the completion callbacks of every unit started so far.
        pub(crate) fn finish_all(&self) {
            let pending: Vec<Ended> = self.pending.lock().unwrap().drain(..).collect();
            for callback in pending {
                callback();
            }
        }
    }

    struct ManualSource {
        stops: Arc<AtomicUsize>,
    }

    impl PlaybackSource for ManualSource {
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl PlaybackContext for ManualPlayback {
        fn sample_rate(&self) -> u32 {
            24000
        }

        fn current_time(&self) -> f64 {
            *self.now.lock().unwrap()
        }

        fn start_source(
            &self,
            samples: Vec<f32>,
            start_at: f64,
            on_ended: Box<dyn FnOnce() + Send>,
        ) -> CallResult<Box<dyn PlaybackSource>> {
            self.starts.lock().unwrap().push((start_at, samples.len()));
            self.pending.lock().unwrap().push(on_ended);
            Ok(Box::new(ManualSource {
                stops: self.stops.clone(),
            }))
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn chunk(samples: usize) -> InboundAudioChunk {
        InboundAudioChunk {
            data: codec::encode_frame(&vec![0.25; samples]),
        }
    }

    #[test]
    fn test_units_abut_without_gaps_or_overlap() {
        let context = Arc::new(ManualPlayback::default());
        let mut scheduler = AudioPlaybackScheduler::new(context.clone());

        let units: Vec<ScheduledUnit> = [2400, 4800, 1200, 24000]
            .iter()
            .map(|&n| scheduler.enqueue(&chunk(n)).unwrap().unwrap())
            .collect();

        assert_eq!(units[0].start, 0.0);
        for pair in units.windows(2) {
            assert_eq!(pair[0].end(), pair[1].start);
        }
        assert!((units[1].duration - 0.2).abs() < 1e-12);
        assert_eq!(scheduler.live_count(), 4);
    }

    #[test]
    fn test_cursor_clamps_to_device_clock_after_stall() {
        let context = Arc::new(ManualPlayback::default());
        let mut scheduler = AudioPlaybackScheduler::new(context.clone());

        let first = scheduler.enqueue(&chunk(2400)).unwrap().unwrap();
        assert_eq!(first.end(), 0.1);

        context.set_time(5.0);
        let second = scheduler.enqueue(&chunk(2400)).unwrap().unwrap();
        assert_eq!(second.start, 5.0);
        assert!(second.start >= first.end());
    }

    #[test]
    fn test_natural_completion_removes_units() {
        let context = Arc::new(ManualPlayback::default());
        let mut scheduler = AudioPlaybackScheduler::new(context.clone());
        scheduler.enqueue(&chunk(100)).unwrap();
        scheduler.enqueue(&chunk(100)).unwrap();

        context.finish_all();

        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(scheduler.stop_all(), 0);
        assert_eq!(context.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_all_stops_every_live_unit_once() {
        let context = Arc::new(ManualPlayback::default());
        let mut scheduler = AudioPlaybackScheduler::new(context.clone());
        for _ in 0..3 {
            scheduler.enqueue(&chunk(480)).unwrap();
        }

        assert_eq!(scheduler.stop_all(), 3);
        assert_eq!(scheduler.stop_all(), 0);
        assert_eq!(context.stops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_bad_and_empty_chunks_leave_cursor_alone() {
        let context = Arc::new(ManualPlayback::default());
        let mut scheduler = AudioPlaybackScheduler::new(context.clone());
        scheduler.enqueue(&chunk(2400)).unwrap();

        let garbage = InboundAudioChunk { data: "%%%".to_string() };
        assert_eq!(scheduler.enqueue(&garbage).unwrap(), None);
        assert_eq!(scheduler.enqueue(&chunk(0)).unwrap(), None);

        assert_eq!(scheduler.next_start_time(), 0.1);
        assert_eq!(context.starts.lock().unwrap().len(), 1);
    }
}
