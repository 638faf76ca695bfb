// Motion engine
//
// Owns the link writer, the pose estimator and the single active command.
// Every odometry frame runs: pose update, event emission, command update,
// one speed write. The engine is synchronous; the controller task drives it.

use std::collections::VecDeque;

use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, trace, warn};

use super::controllers::{Command, Motion, MotorSetpoint};
use super::pose::PoseEstimator;
use super::profile::tick_speed_to_speed;
use crate::config::{HeadingSource, POSE_HISTORY_LIMIT, RobotConfig};
use crate::messages::{DebugFrame, MotionEvent, OdometryFrame, Pose, SpeedSample};
use crate::protocol::link::{self, Link};
use crate::protocol::{DeviceEvent, Direction, Request};

/// Completion sender for a running command, fulfilled with the pose at completion
pub type Completion = oneshot::Sender<Pose>;

struct Active {
    command: Command,
    done: Completion,
}

pub struct MotionEngine<L: Link> {
    config: RobotConfig,
    link: L,
    estimator: PoseEstimator,
    active: Option<Active>,
    /// Setpoint written on every frame while no command overrides it
    setpoint: MotorSetpoint,
    ready: bool,
    track_pose: bool,
    /// Most recent poses, oldest dropped past `POSE_HISTORY_LIMIT`
    history: VecDeque<Pose>,
    events: broadcast::Sender<MotionEvent>,
}

impl<L: Link> MotionEngine<L> {
    pub fn new(config: RobotConfig, link: L, events: broadcast::Sender<MotionEvent>) -> Self {
        Self {
            estimator: PoseEstimator::new(config.heading_source),
            config,
            link,
            active: None,
            setpoint: MotorSetpoint::ZERO,
            ready: false,
            track_pose: false,
            history: VecDeque::new(),
            events,
        }
    }

    pub fn config(&self) -> &RobotConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pose(&self) -> Pose {
        self.estimator.pose()
    }

    pub fn history(&self) -> Vec<Pose> {
        self.history.iter().copied().collect()
    }

    fn record(&mut self, pose: Pose) {
        if self.history.len() == POSE_HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(pose);
    }

    /// Name of the running command, if any
    pub fn active(&self) -> Option<&'static str> {
        self.active.as_ref().map(|a| a.command.name())
    }

    pub fn setpoint(&self) -> MotorSetpoint {
        self.setpoint
    }

    /// Publish to every subscriber
    pub fn emit(&self, event: MotionEvent) {
        // No listeners is fine
        let _ = self.events.send(event);
    }

    fn send(&mut self, request: Request) -> link::Result<()> {
        trace!("-> {:?}", request);
        self.link.write(&request.encode())
    }

    /// Route one decoded device frame
    pub fn handle(&mut self, event: DeviceEvent) -> link::Result<()> {
        match event {
            DeviceEvent::Ready => {
                if self.ready {
                    debug!("Device reported ready again");
                } else {
                    info!("Device ready");
                    self.ready = true;
                }
                Ok(())
            }
            DeviceEvent::Odometry(frame) => self.on_odometry(frame),
            DeviceEvent::Debug(frame) => {
                self.on_debug(frame);
                Ok(())
            }
        }
    }

    fn on_debug(&self, frame: DebugFrame) {
        trace!("Debug frame: {:?}", frame);
        self.emit(MotionEvent::Debug(frame));
    }

    fn on_odometry(&mut self, frame: OdometryFrame) -> link::Result<()> {
        self.emit(MotionEvent::Odometry(frame));

        let update = self.estimator.update(&frame, &self.config);
        if update.changed {
            if self.track_pose {
                self.record(update.pose);
            }
            self.emit(MotionEvent::Pose(update.pose));
        }
        if self.estimator.source() == HeadingSource::Fused {
            self.emit(MotionEvent::PoseOdom(update.odometry));
            self.emit(MotionEvent::PoseImu(update.fused));
        }

        if let Some(active) = self.active.as_mut() {
            let step = active.command.update(&frame, &update.pose, &self.config);
            self.setpoint = step.setpoint;

            if step.done
                && let Some(finished) = self.active.take()
            {
                info!("{} complete at {:?}", finished.command.name(), update.pose);
                if finished.done.send(update.pose).is_err() {
                    debug!("{} finished with nobody waiting", finished.command.name());
                }
            }
        }

        self.emit(MotionEvent::Speed(SpeedSample {
            target: self.setpoint.mean(),
            actual: self.measured_speed(&frame),
        }));
        self.write_setpoint()
    }

    fn measured_speed(&self, frame: &OdometryFrame) -> f64 {
        let left = tick_speed_to_speed(
            frame.left_ticks as i64,
            self.config.left_distance_per_tick,
            self.config.loop_time,
        );
        let right = tick_speed_to_speed(
            frame.right_ticks as i64,
            self.config.right_distance_per_tick,
            self.config.loop_time,
        );
        (left + right) / 2.0
    }

    fn write_setpoint(&mut self) -> link::Result<()> {
        let (left, right) = self
            .setpoint
            .clamped(self.config.max_speed)
            .tick_speeds(&self.config);
        let request = Request::SetSpeed {
            left: left.clamp(0, u8::MAX as i64) as u8,
            right: right.clamp(0, u8::MAX as i64) as u8,
        };
        self.send(request)
    }

    /// Make `motion` the active command. A command already running is
    /// dropped without being fulfilled. If the direction frame cannot be
    /// written the running command, if any, stays in charge.
    pub fn start(&mut self, motion: Motion, done: Completion) -> link::Result<()> {
        let command = Command::new(motion, &self.config);
        if let Some(direction) = command.direction() {
            self.send(Request::SetDirection(direction.bytes()))?;
        }

        if let Some(previous) = self.active.take() {
            warn!(
                "{} replaces unfinished {}",
                command.name(),
                previous.command.name()
            );
        }
        debug!("Starting {}", command.name());
        self.active = Some(Active { command, done });
        Ok(())
    }

    /// Stop the motors immediately. Does not touch the active command.
    pub fn hard_stop(&mut self) -> link::Result<()> {
        info!("Hard stop");
        self.setpoint = MotorSetpoint::ZERO;
        self.send(Request::Stop)
    }

    /// Abandon the active command without fulfilling it, then hard stop
    pub fn emergency_stop(&mut self) -> link::Result<()> {
        if let Some(cancelled) = self.active.take() {
            warn!("Emergency stop cancels {}", cancelled.command.name());
        }
        self.hard_stop()
    }

    /// Drive each wheel directly (mm/s, sign = direction). Becomes the idle
    /// setpoint; an active command overrides it on the next frame.
    pub fn speed_left_right(&mut self, left: f64, right: f64) -> link::Result<()> {
        if let Some(active) = &self.active {
            debug!("Direct wheel speeds while {} is active", active.command.name());
        }
        self.send(Request::SetDirection(Direction::for_wheels(left, right)))?;
        self.setpoint = MotorSetpoint::new(left.abs(), right.abs()).clamped(self.config.max_speed);
        self.write_setpoint()
    }

    pub fn set_debug_level(&mut self, level: u8) -> link::Result<()> {
        info!("Setting device debug level to {}", level);
        self.send(Request::SetDebugLevel(level))
    }

    pub fn request_ready(&mut self) -> link::Result<()> {
        self.send(Request::IsReady)
    }

    /// Force the pose estimate and notify listeners
    pub fn append_pose(&mut self, pose: Pose) {
        self.estimator.reset(pose);
        if self.track_pose {
            self.record(pose);
        }
        self.emit(MotionEvent::Pose(pose));
    }

    pub fn set_track_pose(&mut self, enabled: bool) {
        self.track_pose = enabled;
    }

    /// Feed an external heading sample (rad) to the fused estimate
    pub fn set_heading(&mut self, heading: f64) {
        self.estimator.set_heading(heading);
    }

    /// Stop the board and release the link. Any running command is dropped.
    pub fn close(&mut self) -> link::Result<()> {
        if let Some(cancelled) = self.active.take() {
            warn!("Closing while {} is active", cancelled.command.name());
        }
        self.setpoint = MotorSetpoint::ZERO;

        let result = self
            .send(Request::Stop)
            .and_then(|()| self.send(Request::Close));
        self.link.close()?;
        self.emit(MotionEvent::Close);
        result
    }
}
