// Message types shared by the codec, the motion engine and the zenoh bridge

use serde::{Deserialize, Serialize};

/// Robot pose: position in millimeters, heading in radians within (-π, π]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub phi: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, phi: f64) -> Self {
        Self { x, y, phi }
    }

    /// Straight-line distance from this pose to a coordinate (mm)
    pub fn distance_to(&self, target: Point) -> f64 {
        (target.x - self.x).hypot(target.y - self.y)
    }

    /// Absolute heading pointing from this pose towards a coordinate (rad)
    pub fn bearing_to(&self, target: Point) -> f64 {
        (target.y - self.y).atan2(target.x - self.x)
    }
}

/// A target coordinate in millimeters
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Signed encoder deltas reported by the device for one control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OdometryFrame {
    pub left_ticks: i32,
    pub right_ticks: i32,
}

impl OdometryFrame {
    pub fn new(left_ticks: i32, right_ticks: i32) -> Self {
        Self {
            left_ticks,
            right_ticks,
        }
    }
}

/// Per-motor loop telemetry from a debug frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotorDebug {
    pub speed_setpoint: u8,
    pub speed_ticks_input: u8,
    pub speed_pwm_output: u16,
    pub total_ticks: u16,
}

/// Device loop telemetry for both motors. Pass-through only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DebugFrame {
    pub loop_time: u8,
    pub left: MotorDebug,
    pub right: MotorDebug,
}

/// Mean commanded vs. measured wheel speed for one control loop (mm/s)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpeedSample {
    pub target: f64,
    pub actual: f64,
}

/// Events published to listeners of the motion controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum MotionEvent {
    Odometry(OdometryFrame),
    Debug(DebugFrame),
    Speed(SpeedSample),
    /// Authoritative pose, emitted when it changes
    Pose(Pose),
    /// Tick-integrated pose (only when heading fusion is configured)
    PoseOdom(Pose),
    /// Pose with externally fused heading (only when heading fusion is configured)
    PoseImu(Pose),
    Error(String),
    Disconnect,
    Close,
}

/// Requests accepted by the zenoh bridge, one per public controller call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MotionRequest {
    IsReady,
    SetTrackPose { enabled: bool },
    SetDebugLevel { level: u8 },
    AppendPose { pose: Pose },
    Heading { phi: f64 },
    SpeedLeftRight { left: f64, right: f64 },
    DistanceCalibrationTest { distance: f64 },
    SpeedHeading { speed: f64, heading: f64, duration_ms: u64 },
    DistanceHeading { distance: f64, heading: f64 },
    Rotate { angle: f64 },
    Stop { hard: bool },
    MoveToXy { target: Point },
    MoveToXyPhi { target: Point, heading: f64 },
    EmergencyStop,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearing_and_distance() {
        let pose = Pose::new(0.0, 0.0, 0.0);
        let target = Point::new(100.0, 100.0);

        assert!((pose.distance_to(target) - 141.42135).abs() < 1e-4);
        assert!((pose.bearing_to(target) - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
    }

    #[test]
    fn test_request_json_shape() {
        let request: MotionRequest =
            serde_json::from_str(r#"{"type":"distance_heading","distance":500.0,"heading":0.0}"#)
                .unwrap();
        assert_eq!(
            request,
            MotionRequest::DistanceHeading {
                distance: 500.0,
                heading: 0.0
            }
        );
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&MotionEvent::Pose(Pose::new(1.0, 2.0, 0.5))).unwrap();
        assert_eq!(json, r#"{"event":"pose","data":{"x":1.0,"y":2.0,"phi":0.5}}"#);
    }
}
