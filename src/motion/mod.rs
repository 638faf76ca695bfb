// Motion control for the differential-drive base
//
// Provides:
// - Speed profile planning (trapezoid, ramp, tick-speed conversion)
// - Pose estimation from wheel ticks with optional heading fusion
// - Closed-loop commands (distance, rotate, speed, stop, calibration)
// - The engine tying frames, pose and commands to the link

pub mod controllers;
pub mod engine;
pub mod pose;
pub mod profile;

pub use controllers::{Command, Motion, MotorSetpoint, StopCondition};
pub use engine::MotionEngine;
pub use pose::PoseEstimator;
