//! # Live Call Core
//!
//! The session controller and the audio pipeline around it.
//!
//! ## Key Components:
//! - **controller**: lifecycle state machine, event routing and cleanup
//! - **capture**: microphone frames to encoded outbound frames, honoring mute
//! - **playback**: gapless scheduling of inbound agent audio
//! - **transcript**: folds cumulative speech-to-text fragments into entries
//! - **tools**: services agent function calls in order
//! - **remote**: the bidirectional session seam the controller talks through

pub mod capture;
pub mod controller;
pub mod playback;
pub mod remote;
pub mod tools;
pub mod transcript;

pub use controller::{CallCommand, CallObserver, CallPlan, CallStatus, MetricScore, SessionController};
