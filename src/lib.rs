pub mod config;
pub mod controller;
pub mod messages;
pub mod motion;
pub mod protocol;
pub mod runtime;

pub use controller::{MotionController, MotionError, StopMode};
