pub mod config;
pub mod desk;

pub use config::*;
pub use desk::*;
