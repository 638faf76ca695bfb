// Closed-loop motion commands
//
// Each command owns its ramp and PID state and turns one odometry frame
// (plus the pose after that frame) into a wheel speed setpoint. Commands
// never write to the link themselves; the engine does that and fulfils the
// caller's completion handle when a step reports `done`.

use std::fmt;

use tracing::{debug, info};

use super::pose::{wheel_travel, wrap_angle};
use super::profile::{max_achievable_speed, ramp_towards, speed_to_tick_speed, tick_speed_to_speed};
use crate::config::RobotConfig;
use crate::messages::{OdometryFrame, Pose};
use crate::protocol::Direction;

/// Trim applied below the requested speed of a speed/heading run (mm/s)
pub const SPEED_HEADING_TRIM: f64 = 10.0;

/// Wheel speed magnitudes (mm/s). Direction is sent separately.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotorSetpoint {
    pub left: f64,
    pub right: f64,
}

impl MotorSetpoint {
    pub const ZERO: Self = Self {
        left: 0.0,
        right: 0.0,
    };

    pub fn new(left: f64, right: f64) -> Self {
        Self { left, right }
    }

    pub fn uniform(speed: f64) -> Self {
        Self::new(speed, speed)
    }

    /// Clamp both wheels to [0, max]
    pub fn clamped(self, max: f64) -> Self {
        Self {
            left: self.left.clamp(0.0, max),
            right: self.right.clamp(0.0, max),
        }
    }

    /// Tick speed per control loop for each wheel
    pub fn tick_speeds(&self, config: &RobotConfig) -> (i64, i64) {
        (
            speed_to_tick_speed(self.left, config.left_distance_per_tick, config.loop_time),
            speed_to_tick_speed(self.right, config.right_distance_per_tick, config.loop_time),
        )
    }

    pub fn is_zero(&self, config: &RobotConfig) -> bool {
        self.tick_speeds(config) == (0, 0)
    }

    pub fn mean(&self) -> f64 {
        (self.left + self.right) / 2.0
    }
}

/// Output of one control tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub setpoint: MotorSetpoint,
    pub done: bool,
}

impl Step {
    fn running(setpoint: MotorSetpoint) -> Self {
        Self {
            setpoint,
            done: false,
        }
    }

    fn finished(setpoint: MotorSetpoint) -> Self {
        Self {
            setpoint,
            done: true,
        }
    }
}

/// Completion test for open-ended runs, evaluated once per frame
pub type StopCondition = Box<dyn FnMut(&OdometryFrame, &Pose) -> bool + Send>;

/// Parameters of a motion command as requested by a caller
pub enum Motion {
    /// Drive `distance` mm (negative = reverse) holding `heading` rad
    DistanceHeading { distance: f64, heading: f64 },
    /// Turn in place by `angle` rad (positive = right)
    Rotate { angle: f64 },
    /// Hold `speed` mm/s and `heading` rad until `until` returns true
    SpeedHeading {
        speed: f64,
        heading: f64,
        until: StopCondition,
    },
    /// Ramp both wheels down from their measured speed
    SoftStop,
    /// Straight run without heading correction, reporting tick totals
    CalibrationTest { distance: f64 },
}

impl fmt::Debug for Motion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Motion::DistanceHeading { distance, heading } => f
                .debug_struct("DistanceHeading")
                .field("distance", distance)
                .field("heading", heading)
                .finish(),
            Motion::Rotate { angle } => f.debug_struct("Rotate").field("angle", angle).finish(),
            Motion::SpeedHeading { speed, heading, .. } => f
                .debug_struct("SpeedHeading")
                .field("speed", speed)
                .field("heading", heading)
                .finish_non_exhaustive(),
            Motion::SoftStop => f.write_str("SoftStop"),
            Motion::CalibrationTest { distance } => f
                .debug_struct("CalibrationTest")
                .field("distance", distance)
                .finish(),
        }
    }
}

/// Progress of a trapezoidal run. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Cruise,
    Decelerate,
    Stopped,
}

/// Accelerate/cruise, decelerate, stop, driven by distance travelled
#[derive(Debug, Clone)]
pub struct Trapezoid {
    distance: f64,
    decelerate_at: f64,
    cruise_speed: f64,
    min_speed: f64,
    travelled: f64,
    phase: Phase,
}

impl Trapezoid {
    pub fn new(distance: f64, max_speed: f64, config: &RobotConfig) -> Self {
        let distance = distance.abs();
        let plan = max_achievable_speed(distance, max_speed, config.min_speed, config.acceleration);
        Self {
            distance,
            decelerate_at: distance - plan.acceleration_distance,
            cruise_speed: plan.cruise_speed,
            min_speed: config.min_speed,
            travelled: 0.0,
            phase: Phase::Cruise,
        }
    }

    /// Add `travel` mm and return the resulting phase
    pub fn advance(&mut self, travel: f64) -> Phase {
        self.travelled += travel.abs();

        if self.phase == Phase::Cruise && self.travelled >= self.decelerate_at {
            debug!(
                "Decelerating at {:.1} of {:.1} mm",
                self.travelled, self.distance
            );
            self.phase = Phase::Decelerate;
        }
        if self.phase != Phase::Stopped && self.travelled >= self.distance {
            debug!("Stop target reached at {:.1} mm", self.travelled);
            self.phase = Phase::Stopped;
        }
        self.phase
    }

    /// Speed the ramp should head for in the current phase
    pub fn target_speed(&self) -> f64 {
        match self.phase {
            Phase::Cruise => self.cruise_speed,
            Phase::Decelerate => self.min_speed,
            Phase::Stopped => 0.0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn travelled(&self) -> f64 {
        self.travelled
    }

    pub fn cruise_speed(&self) -> f64 {
        self.cruise_speed
    }

    pub fn decelerate_at(&self) -> f64 {
        self.decelerate_at
    }
}

/// Shortest signed angle from `phi` to `target`
pub fn heading_error(target: f64, phi: f64) -> f64 {
    wrap_angle(target - phi)
}

/// PID on heading error, output in mm/s of wheel speed difference
#[derive(Debug, Clone)]
pub struct HeadingPid {
    kp: f64,
    ki: f64,
    kd: f64,
    dt: f64,
    accumulated: f64,
    last_error: f64,
}

impl HeadingPid {
    pub fn new(config: &RobotConfig) -> Self {
        Self {
            kp: config.heading_kp,
            ki: config.heading_ki,
            kd: config.heading_kd,
            dt: config.loop_seconds(),
            accumulated: 0.0,
            last_error: 0.0,
        }
    }

    /// Rounded correction for a wrapped heading error
    pub fn correction(&mut self, error: f64) -> f64 {
        self.accumulated += error * self.dt;

        let p = self.kp * error;
        let i = self.accumulated * self.ki;
        let d = (error - self.last_error) / self.dt * self.kd;
        self.last_error = error;

        (p + i + d).round()
    }
}

fn steer(base: f64, correction: f64, direction: Direction, max_speed: f64) -> MotorSetpoint {
    let correction = match direction {
        Direction::Reverse => -correction,
        _ => correction,
    };
    MotorSetpoint::new(base + correction, base - correction).clamped(max_speed)
}

fn straight_direction(signed: f64) -> Direction {
    if signed > 0.0 { Direction::Forward } else { Direction::Reverse }
}

/// Drive a distance while correcting towards a heading
pub struct DistanceHeading {
    heading: f64,
    direction: Direction,
    profile: Trapezoid,
    speed: f64,
    pid: HeadingPid,
}

impl DistanceHeading {
    pub fn new(distance: f64, heading: f64, config: &RobotConfig) -> Self {
        let profile = Trapezoid::new(distance, config.max_speed, config);
        info!(
            "Distance/heading: {:.1} mm at {:.3} rad, cruise {:.1} mm/s, decelerate at {:.1} mm",
            distance,
            heading,
            profile.cruise_speed(),
            profile.decelerate_at()
        );
        Self {
            heading,
            direction: straight_direction(distance),
            profile,
            speed: 0.0,
            pid: HeadingPid::new(config),
        }
    }

    fn update(&mut self, frame: &OdometryFrame, pose: &Pose, config: &RobotConfig) -> Step {
        let (left, right) = wheel_travel(frame, config);
        if self.profile.advance((left.abs() + right.abs()) / 2.0) == Phase::Stopped {
            self.speed = 0.0;
            return Step::finished(MotorSetpoint::ZERO);
        }

        self.speed = ramp_towards(self.speed, self.profile.target_speed(), config.acceleration_step);
        let correction = self.pid.correction(heading_error(self.heading, pose.phi));
        Step::running(steer(self.speed, correction, self.direction, config.max_speed))
    }

    pub fn phase(&self) -> Phase {
        self.profile.phase()
    }
}

/// Turn in place; each wheel runs its own trapezoid over the arc length
pub struct Rotate {
    direction: Direction,
    left: Trapezoid,
    right: Trapezoid,
    left_speed: f64,
    right_speed: f64,
}

impl Rotate {
    pub fn new(angle: f64, config: &RobotConfig) -> Self {
        let arc = (config.wheel_base / 2.0 * angle).abs();
        let profile = Trapezoid::new(arc, config.max_rotation_speed, config);
        info!(
            "Rotate: {:.3} rad, arc {:.1} mm per wheel, cruise {:.1} mm/s",
            angle,
            arc,
            profile.cruise_speed()
        );
        Self {
            direction: if angle > 0.0 {
                Direction::RotateRight
            } else {
                Direction::RotateLeft
            },
            left: profile.clone(),
            right: profile,
            left_speed: 0.0,
            right_speed: 0.0,
        }
    }

    fn update(&mut self, frame: &OdometryFrame, config: &RobotConfig) -> Step {
        let (left_travel, right_travel) = wheel_travel(frame, config);
        let step = config.acceleration_step;

        self.left_speed = match self.left.advance(left_travel) {
            Phase::Stopped => 0.0,
            _ => ramp_towards(self.left_speed, self.left.target_speed(), step),
        };
        self.right_speed = match self.right.advance(right_travel) {
            Phase::Stopped => 0.0,
            _ => ramp_towards(self.right_speed, self.right.target_speed(), step),
        };

        let setpoint =
            MotorSetpoint::new(self.left_speed, self.right_speed).clamped(config.max_rotation_speed);
        if self.left.phase() == Phase::Stopped && self.right.phase() == Phase::Stopped {
            Step::finished(setpoint)
        } else {
            Step::running(setpoint)
        }
    }

    pub fn phases(&self) -> (Phase, Phase) {
        (self.left.phase(), self.right.phase())
    }
}

/// Hold a speed and heading until the caller's condition is met
pub struct SpeedHeading {
    heading: f64,
    direction: Direction,
    target: f64,
    speed: f64,
    pid: HeadingPid,
    until: StopCondition,
}

impl SpeedHeading {
    pub fn new(speed: f64, heading: f64, until: StopCondition, config: &RobotConfig) -> Self {
        let target = (speed.abs().min(config.max_speed) - SPEED_HEADING_TRIM).max(0.0);
        info!("Speed/heading: {:.1} mm/s at {:.3} rad", target, heading);
        Self {
            heading,
            direction: straight_direction(speed),
            target,
            speed: 0.0,
            pid: HeadingPid::new(config),
            until,
        }
    }

    fn update(&mut self, frame: &OdometryFrame, pose: &Pose, config: &RobotConfig) -> Step {
        self.speed = ramp_towards(self.speed, self.target, config.acceleration_step);
        let correction = self.pid.correction(heading_error(self.heading, pose.phi));
        let setpoint = steer(self.speed, correction, self.direction, config.max_speed);

        if (self.until)(frame, pose) {
            Step::finished(setpoint)
        } else {
            Step::running(setpoint)
        }
    }
}

/// Ramp both wheels to standstill from whatever they are doing now
#[derive(Debug, Default)]
pub struct SoftStop {
    speeds: Option<(f64, f64)>,
}

impl SoftStop {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&mut self, frame: &OdometryFrame, config: &RobotConfig) -> Step {
        let (left, right) = self.speeds.unwrap_or_else(|| {
            let left = tick_speed_to_speed(
                frame.left_ticks as i64,
                config.left_distance_per_tick,
                config.loop_time,
            );
            let right = tick_speed_to_speed(
                frame.right_ticks as i64,
                config.right_distance_per_tick,
                config.loop_time,
            );
            debug!("Soft stop from {:.1} / {:.1} mm/s", left.abs(), right.abs());
            (left.abs(), right.abs())
        });

        let step = config.acceleration_step;
        let speeds = (ramp_towards(left, 0.0, step), ramp_towards(right, 0.0, step));
        self.speeds = Some(speeds);

        let setpoint = MotorSetpoint::new(speeds.0, speeds.1).clamped(config.max_speed);
        if setpoint.is_zero(config) {
            Step::finished(setpoint)
        } else {
            Step::running(setpoint)
        }
    }
}

/// Straight run without heading correction; logs tick totals at the end
pub struct CalibrationTest {
    direction: Direction,
    profile: Trapezoid,
    speed: f64,
    total_left: i64,
    total_right: i64,
}

impl CalibrationTest {
    pub fn new(distance: f64, config: &RobotConfig) -> Self {
        let profile = Trapezoid::new(distance, config.max_speed, config);
        info!(
            "Calibration run: {:.1} mm, cruise {:.1} mm/s",
            distance,
            profile.cruise_speed()
        );
        Self {
            direction: straight_direction(distance),
            profile,
            speed: 0.0,
            total_left: 0,
            total_right: 0,
        }
    }

    fn update(&mut self, frame: &OdometryFrame, config: &RobotConfig) -> Step {
        self.total_left += frame.left_ticks as i64;
        self.total_right += frame.right_ticks as i64;

        let (left, right) = wheel_travel(frame, config);
        if self.profile.advance((left.abs() + right.abs()) / 2.0) == Phase::Stopped {
            self.speed = 0.0;
            info!(
                "Calibration run done: {:.1} mm, left {} ticks, right {} ticks",
                self.profile.travelled(),
                self.total_left,
                self.total_right
            );
            return Step::finished(MotorSetpoint::ZERO);
        }

        self.speed = ramp_towards(self.speed, self.profile.target_speed(), config.acceleration_step);
        Step::running(MotorSetpoint::uniform(self.speed).clamped(self.profile.cruise_speed()))
    }

    pub fn totals(&self) -> (i64, i64) {
        (self.total_left, self.total_right)
    }
}

/// The command occupying the engine's single active slot
pub enum Command {
    DistanceHeading(DistanceHeading),
    Rotate(Rotate),
    SpeedHeading(SpeedHeading),
    SoftStop(SoftStop),
    CalibrationTest(CalibrationTest),
}

impl Command {
    pub fn new(motion: Motion, config: &RobotConfig) -> Self {
        match motion {
            Motion::DistanceHeading { distance, heading } => {
                Command::DistanceHeading(DistanceHeading::new(distance, heading, config))
            }
            Motion::Rotate { angle } => Command::Rotate(Rotate::new(angle, config)),
            Motion::SpeedHeading {
                speed,
                heading,
                until,
            } => Command::SpeedHeading(SpeedHeading::new(speed, heading, until, config)),
            Motion::SoftStop => Command::SoftStop(SoftStop::new()),
            Motion::CalibrationTest { distance } => {
                Command::CalibrationTest(CalibrationTest::new(distance, config))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::DistanceHeading(_) => "distance_heading",
            Command::Rotate(_) => "rotate",
            Command::SpeedHeading(_) => "speed_heading",
            Command::SoftStop(_) => "soft_stop",
            Command::CalibrationTest(_) => "distance_calibration_test",
        }
    }

    /// Wheel directions to send when the command starts. A soft stop keeps
    /// whatever the wheels are doing.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Command::DistanceHeading(c) => Some(c.direction),
            Command::Rotate(c) => Some(c.direction),
            Command::SpeedHeading(c) => Some(c.direction),
            Command::SoftStop(_) => None,
            Command::CalibrationTest(c) => Some(c.direction),
        }
    }

    pub fn update(&mut self, frame: &OdometryFrame, pose: &Pose, config: &RobotConfig) -> Step {
        match self {
            Command::DistanceHeading(c) => c.update(frame, pose, config),
            Command::Rotate(c) => c.update(frame, config),
            Command::SpeedHeading(c) => c.update(frame, pose, config),
            Command::SoftStop(c) => c.update(frame, config),
            Command::CalibrationTest(c) => c.update(frame, config),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
