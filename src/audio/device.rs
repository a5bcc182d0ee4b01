//! # Audio Devices
//!
//! Device-facing half of the call pipeline. The session controller only sees
//! the trait seams defined here, so tests can drive the pipeline with fake
//! devices and a manual clock while production uses cpal.
//!
//! ## Key Components:
//! - **AudioBackend**: acquires the microphone and opens the playback context
//! - **Microphone**: an acquired capture stream, delivered as fixed-size frames
//!   over a bounded channel, plus the device handle that releases it
//! - **PlaybackContext**: an output device with its own monotonic clock that
//!   can start sources at an absolute time
//!
//! ## Threading:
//! cpal streams are not `Send` on every platform, so each stream lives on its
//! own named thread and is dropped there when the handle is released. The
//! capture callback re-blocks device buffers into frames and pushes them onto
//! an unbounded channel without blocking. The capture thread forwards them in
//! order onto the bounded queue the encoder reads, waiting while it is full.
//! Releasing a device only signals its thread; the join happens on tokio's
//! blocking pool when a runtime is present.

use crate::error::{CallError, CallResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long `open_*` waits for the device thread to report that its stream is running.
const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval of the capture forwarder while idle or while the queue is full.
const FORWARD_POLL: Duration = Duration::from_millis(20);

/// Acquires the two audio devices a call needs.
///
/// Opening may block on device start-up; callers on an async runtime should
/// run it on the blocking pool.
pub trait AudioBackend: Send + Sync {
    /// Acquire the microphone and start producing mono frames of
    /// `frame_samples` samples at `sample_rate`.
    fn open_microphone(
        &self,
        sample_rate: u32,
        frame_samples: usize,
        queue_depth: usize,
    ) -> CallResult<Microphone>;

    /// Open an output context that plays mono sources at `sample_rate`.
    fn open_playback(&self, sample_rate: u32) -> CallResult<Arc<dyn PlaybackContext>>;

    /// Whether a call currently holds the microphone.
    fn microphone_in_use(&self) -> bool {
        false
    }
}

/// An acquired microphone: the frame stream plus the handle that releases it.
pub struct Microphone {
    pub frames: mpsc::Receiver<Vec<f32>>,
    pub device: Box<dyn CaptureDevice>,
}

/// Handle to a running capture stream and its input context.
pub trait CaptureDevice: Send {
    /// Stop the stream, close the input context and give the device back.
    /// Calling it more than once has no further effect.
    fn release(&mut self);
}

/// Output device context with a monotonic clock in seconds.
pub trait PlaybackContext: Send + Sync {
    /// Rate of the samples passed to `start_source`.
    fn sample_rate(&self) -> u32;

    /// Current position of the device clock.
    fn current_time(&self) -> f64;

    /// Schedule `samples` to start at `start_at` on the device clock.
    /// `on_ended` runs once when the source finishes on its own; it does not
    /// run for sources that were stopped.
    fn start_source(
        &self,
        samples: Vec<f32>,
        start_at: f64,
        on_ended: Box<dyn FnOnce() + Send>,
    ) -> CallResult<Box<dyn PlaybackSource>>;

    /// Stop rendering and release the output device.
    fn close(&self);
}

/// A scheduled playback unit.
pub trait PlaybackSource: Send {
    fn stop(&self);
}

/// Linear-interpolation sample rate converter for mono streams.
///
/// Good enough for speech between common device rates; there is no
/// anti-aliasing filter.
#[derive(Debug, Clone)]
pub(crate) struct LinearResampler {
    step: f64,
    position: f64,
    previous: f32,
}

impl LinearResampler {
    pub(crate) fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate as f64 / to_rate as f64,
            position: 1.0,
            previous: 0.0,
        }
    }

    pub(crate) fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    pub(crate) fn process(&mut self, input: impl IntoIterator<Item = f32>, out: &mut Vec<f32>) {
        if self.is_passthrough() {
            out.extend(input);
            return;
        }
        for sample in input {
            while self.position <= 1.0 {
                out.push(self.previous + (sample - self.previous) * self.position as f32);
                self.position += self.step;
            }
            self.position -= 1.0;
            self.previous = sample;
        }
    }
}

/// Re-blocks device callback buffers into fixed-size mono frames.
pub(crate) struct CaptureFramer {
    frame_samples: usize,
    resampler: LinearResampler,
    pending: Vec<f32>,
    scratch: Vec<f32>,
}

impl CaptureFramer {
    pub(crate) fn new(device_rate: u32, target_rate: u32, frame_samples: usize) -> Self {
        Self {
            frame_samples,
            resampler: LinearResampler::new(device_rate, target_rate),
            pending: Vec::with_capacity(frame_samples),
            scratch: Vec::new(),
        }
    }

    /// Feed interleaved device samples; returns every frame completed by this block.
    pub(crate) fn push_interleaved(&mut self, data: &[f32], channels: usize) -> Vec<Vec<f32>> {
        let channels = channels.max(1);
        self.scratch.clear();
        let mono = data
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32);
        self.resampler.process(mono, &mut self.scratch);

        let mut frames = Vec::new();
        for &sample in &self.scratch {
            self.pending.push(sample);
            if self.pending.len() == self.frame_samples {
                frames.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.frame_samples),
                ));
            }
        }
        frames
    }
}

/// cpal-backed devices. Only one microphone acquisition may be live at a time.
#[derive(Clone, Default)]
pub struct CpalAudioBackend {
    microphone_in_use: Arc<AtomicBool>,
}

impl CpalAudioBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioBackend for CpalAudioBackend {
    fn open_microphone(
        &self,
        sample_rate: u32,
        frame_samples: usize,
        queue_depth: usize,
    ) -> CallResult<Microphone> {
        if self
            .microphone_in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CallError::Device(
                "Microphone is already in use by another call".to_string(),
            ));
        }

        let claim = MicrophoneClaim(self.microphone_in_use.clone());
        let (frames, stop, thread) =
            spawn_capture_thread(sample_rate, frame_samples, queue_depth, claim)?;
        Ok(Microphone {
            frames,
            device: Box::new(CpalCaptureDevice {
                stop,
                thread: Some(thread),
            }),
        })
    }

    fn open_playback(&self, sample_rate: u32) -> CallResult<Arc<dyn PlaybackContext>> {
        let context = CpalPlaybackContext::open(sample_rate)?;
        Ok(Arc::new(context))
    }

    fn microphone_in_use(&self) -> bool {
        self.microphone_in_use.load(Ordering::SeqCst)
    }
}

/// Holds the backend's microphone flag; dropping it frees the microphone.
struct MicrophoneClaim(Arc<AtomicBool>);

impl Drop for MicrophoneClaim {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

type CaptureThread = (mpsc::Receiver<Vec<f32>>, Arc<AtomicBool>, JoinHandle<()>);

fn spawn_capture_thread(
    sample_rate: u32,
    frame_samples: usize,
    queue_depth: usize,
    claim: MicrophoneClaim,
) -> CallResult<CaptureThread> {
    let (frame_tx, frame_rx) = mpsc::channel(queue_depth.max(1));
    let (ready_tx, ready_rx) = std_mpsc::channel::<CallResult<()>>();
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();

    let thread = std::thread::Builder::new()
        .name("call-capture".to_string())
        .spawn(move || {
            let _claim = claim;
            let (raw_tx, raw_rx) = std_mpsc::channel();
            let stream = match build_capture_stream(sample_rate, frame_samples, raw_tx) {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            let forwarded = forward_frames(raw_rx, frame_tx, &thread_stop);
            // The encoder may hang up before release; hold the device until then
            while !thread_stop.load(Ordering::SeqCst) {
                std::thread::park_timeout(FORWARD_POLL);
            }
            drop(stream);
            debug!(forwarded, "Capture stream dropped");
        })
        .map_err(|e| CallError::Device(format!("Failed to spawn capture thread: {}", e)))?;

    match ready_rx.recv_timeout(DEVICE_OPEN_TIMEOUT) {
        Ok(Ok(())) => Ok((frame_rx, stop, thread)),
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err)
        }
        Err(_) => {
            stop.store(true, Ordering::SeqCst);
            thread.thread().unpark();
            Err(CallError::Device("Timed out opening the microphone".to_string()))
        }
    }
}

/// Move frames from the device callback onto the bounded encoder queue in
/// arrival order, waiting while the queue is full. Returns the number of
/// frames forwarded once `stop` is set, the callback side is gone or the
/// encoder has hung up.
fn forward_frames(
    raw_rx: std_mpsc::Receiver<Vec<f32>>,
    frame_tx: mpsc::Sender<Vec<f32>>,
    stop: &AtomicBool,
) -> u64 {
    let mut forwarded = 0;
    let mut stalls: u64 = 0;

    while !stop.load(Ordering::SeqCst) {
        let mut frame = match raw_rx.recv_timeout(FORWARD_POLL) {
            Ok(frame) => frame,
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        };
        loop {
            match frame_tx.try_send(frame) {
                Ok(()) => {
                    forwarded += 1;
                    break;
                }
                Err(mpsc::error::TrySendError::Full(back)) => {
                    if stop.load(Ordering::SeqCst) {
                        return forwarded;
                    }
                    stalls += 1;
                    if stalls == 1 || stalls % 100 == 0 {
                        warn!(stalls, "Capture queue full; holding frames");
                    }
                    frame = back;
                    std::thread::park_timeout(FORWARD_POLL);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return forwarded,
            }
        }
    }
    forwarded
}

/// Join a device thread without blocking an async runtime worker.
fn join_device_thread(thread: JoinHandle<()>, name: &'static str) {
    let join = move || {
        if thread.join().is_err() {
            warn!(thread = name, "Device thread panicked");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

fn build_capture_stream(
    sample_rate: u32,
    frame_samples: usize,
    frame_tx: std_mpsc::Sender<Vec<f32>>,
) -> CallResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| CallError::Device("No input device available".to_string()))?;

    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        "Acquiring microphone"
    );

    let supported = device.default_input_config()?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let framer = CaptureFramer::new(config.sample_rate.0, sample_rate, frame_samples);

    let stream = match format {
        cpal::SampleFormat::F32 => input_stream::<f32>(&device, &config, framer, frame_tx)?,
        cpal::SampleFormat::I16 => input_stream::<i16>(&device, &config, framer, frame_tx)?,
        cpal::SampleFormat::U16 => input_stream::<u16>(&device, &config, framer, frame_tx)?,
        other => {
            return Err(CallError::Device(format!(
                "Unsupported input sample format: {:?}",
                other
            )))
        }
    };
    stream.play()?;

    info!(
        device_rate = config.sample_rate.0,
        channels = config.channels,
        target_rate = sample_rate,
        frame_samples,
        "Microphone capture started"
    );
    Ok(stream)
}

fn input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut framer: CaptureFramer,
    frame_tx: std_mpsc::Sender<Vec<f32>>,
) -> CallResult<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut converted: Vec<f32> = Vec::new();
    let mut consumer_gone = false;

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if consumer_gone {
                return;
            }
            converted.clear();
            converted.extend(data.iter().map(|s| s.to_sample::<f32>()));
            for frame in framer.push_interleaved(&converted, channels) {
                if frame_tx.send(frame).is_err() {
                    consumer_gone = true;
                    break;
                }
            }
        },
        |err| warn!("Capture stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

struct CpalCaptureDevice {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureDevice for CpalCaptureDevice {
    fn release(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        thread.thread().unpark();
        join_device_thread(thread, "call-capture");
        info!("Microphone released");
    }
}

impl Drop for CpalCaptureDevice {
    fn drop(&mut self) {
        self.release();
    }
}

struct Voice {
    start_frame: u64,
    samples: Vec<f32>,
    stopped: Arc<AtomicBool>,
    on_ended: Option<Box<dyn FnOnce() + Send>>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Sums scheduled voices onto the device timeline.
struct Mixer {
    frames_rendered: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    /// Render `frames` mono output frames and return the callbacks of voices
    /// that finished naturally. Callbacks run after the lock is released.
    fn render(&mut self, out: &mut Vec<f32>, frames: usize) -> Vec<Box<dyn FnOnce() + Send>> {
        out.clear();
        out.resize(frames, 0.0);
        let block_start = self.frames_rendered;

        for voice in &self.voices {
            if voice.stopped.load(Ordering::SeqCst) {
                continue;
            }
            for (i, slot) in out.iter_mut().enumerate() {
                let t = block_start + i as u64;
                if t >= voice.start_frame && t < voice.end_frame() {
                    *slot += voice.samples[(t - voice.start_frame) as usize];
                }
            }
        }

        self.frames_rendered += frames as u64;
        let now = self.frames_rendered;
        let mut finished = Vec::new();
        self.voices.retain_mut(|voice| {
            if voice.stopped.load(Ordering::SeqCst) {
                return false;
            }
            if voice.end_frame() <= now {
                if let Some(callback) = voice.on_ended.take() {
                    finished.push(callback);
                }
                return false;
            }
            true
        });
        finished
    }
}

/// cpal output stream with a frame-counting clock.
pub struct CpalPlaybackContext {
    nominal_rate: u32,
    device_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    sources_started: AtomicU64,
}

impl CpalPlaybackContext {
    fn open(nominal_rate: u32) -> CallResult<Self> {
        let mixer = Arc::new(Mutex::new(Mixer {
            frames_rendered: 0,
            voices: Vec::new(),
        }));
        let (ready_tx, ready_rx) = std_mpsc::channel::<CallResult<u32>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let thread_mixer = mixer.clone();

        let thread = std::thread::Builder::new()
            .name("call-playback".to_string())
            .spawn(move || {
                let (stream, device_rate) = match build_output_stream(thread_mixer) {
                    Ok(opened) => opened,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(device_rate));
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Playback stream dropped");
            })
            .map_err(|e| CallError::Device(format!("Failed to spawn playback thread: {}", e)))?;

        let device_rate = match ready_rx.recv_timeout(DEVICE_OPEN_TIMEOUT) {
            Ok(Ok(rate)) => rate,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => {
                drop(stop_tx);
                return Err(CallError::Device("Timed out opening the output device".to_string()));
            }
        };

        Ok(Self {
            nominal_rate,
            device_rate,
            mixer,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
            sources_started: AtomicU64::new(0),
        })
    }
}

fn build_output_stream(mixer: Arc<Mutex<Mixer>>) -> CallResult<(cpal::Stream, u32)> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| CallError::Device("No output device available".to_string()))?;

    let supported = device.default_output_config()?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();

    let stream = match format {
        cpal::SampleFormat::F32 => output_stream::<f32>(&device, &config, mixer)?,
        cpal::SampleFormat::I16 => output_stream::<i16>(&device, &config, mixer)?,
        cpal::SampleFormat::U16 => output_stream::<u16>(&device, &config, mixer)?,
        other => {
            return Err(CallError::Device(format!(
                "Unsupported output sample format: {:?}",
                other
            )))
        }
    };
    stream.play()?;

    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        device_rate = config.sample_rate.0,
        "Playback context opened"
    );
    Ok((stream, config.sample_rate.0))
}

fn output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> CallResult<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = (config.channels as usize).max(1);
    let mut mono: Vec<f32> = Vec::new();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            let finished = match mixer.lock() {
                Ok(mut mixer) => mixer.render(&mut mono, frames),
                Err(_) => {
                    mono.clear();
                    mono.resize(frames, 0.0);
                    Vec::new()
                }
            };
            for (frame, &value) in data.chunks_mut(channels).zip(mono.iter()) {
                let sample = value.clamp(-1.0, 1.0).to_sample::<T>();
                for slot in frame.iter_mut() {
                    *slot = sample;
                }
            }
            for callback in finished {
                callback();
            }
        },
        |err| warn!("Playback stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

struct CpalSource {
    stopped: Arc<AtomicBool>,
}

impl PlaybackSource for CpalSource {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl PlaybackContext for CpalPlaybackContext {
    fn sample_rate(&self) -> u32 {
        self.nominal_rate
    }

    fn current_time(&self) -> f64 {
        let frames = self.mixer.lock().map(|m| m.frames_rendered).unwrap_or(0);
        frames as f64 / self.device_rate as f64
    }

    fn start_source(
        &self,
        samples: Vec<f32>,
        start_at: f64,
        on_ended: Box<dyn FnOnce() + Send>,
    ) -> CallResult<Box<dyn PlaybackSource>> {
        let mut resampled = Vec::with_capacity(samples.len());
        LinearResampler::new(self.nominal_rate, self.device_rate).process(samples, &mut resampled);

        let stopped = Arc::new(AtomicBool::new(false));
        let voice = Voice {
            start_frame: (start_at.max(0.0) * self.device_rate as f64).round() as u64,
            samples: resampled,
            stopped: stopped.clone(),
            on_ended: Some(on_ended),
        };

        self.mixer
            .lock()
            .map_err(|_| CallError::Device("Playback mixer lock poisoned".to_string()))?
            .voices
            .push(voice);
        self.sources_started.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(CpalSource { stopped }))
    }

    fn close(&self) {
        let stop_tx = self.stop_tx.lock().ok().and_then(|mut tx| tx.take());
        let Some(stop_tx) = stop_tx else {
            return;
        };
        let _ = stop_tx.send(());
        if let Some(thread) = self.thread.lock().ok().and_then(|mut t| t.take()) {
            join_device_thread(thread, "call-playback");
        }
        info!(
            sources = self.sources_started.load(Ordering::Relaxed),
            "Playback context closed"
        );
    }
}

impl Drop for CpalPlaybackContext {
    fn drop(&mut self) {
        self.close();
    }
}
