//! # Audio Module
//!
//! Local audio for a simulated call.
//!
//! ## Audio Formats:
//! - **Capture**: 16 kHz mono, framed into 4096-sample blocks, sent as 16-bit
//!   little-endian PCM encoded in base64
//! - **Playback**: 24 kHz mono 16-bit little-endian PCM received as base64
//!
//! ## Key Components:
//! - **codec**: sample conversion, byte packing and transport encoding
//! - **device**: microphone and playback context behind trait seams, with a
//!   cpal implementation for real hardware

pub mod codec;
pub mod device;
