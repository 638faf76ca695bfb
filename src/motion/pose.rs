// Differential-drive dead reckoning
//
// Two estimates are integrated every tick from the same wheel travel: one
// takes its heading from the ticks, the other from an external heading
// sensor when a sample is available. The configured heading source picks
// which one is authoritative.

use std::f64::consts::{PI, TAU};

use crate::config::{HeadingSource, RobotConfig};
use crate::messages::{OdometryFrame, Pose};

/// Wrap an angle into (-π, π]
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(TAU);
    if wrapped > PI { wrapped - TAU } else { wrapped }
}

/// Normalize an angle through its sine and cosine
pub fn normalize_angle(angle: f64) -> f64 {
    angle.sin().atan2(angle.cos())
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Distance travelled by each wheel for one frame (mm, signed)
pub fn wheel_travel(frame: &OdometryFrame, config: &RobotConfig) -> (f64, f64) {
    (
        frame.left_ticks as f64 * config.left_distance_per_tick,
        frame.right_ticks as f64 * config.right_distance_per_tick,
    )
}

fn advance(last: &Pose, delta_left: f64, delta_right: f64) -> (f64, f64) {
    let center = (delta_left + delta_right) / 2.0;
    (
        round4(last.x + center * last.phi.cos()),
        round4(last.y + center * last.phi.sin()),
    )
}

/// Integrate one frame of wheel travel, heading from the ticks
pub fn integrate_odom(last: &Pose, delta_left: f64, delta_right: f64, wheel_base: f64) -> Pose {
    let (x, y) = advance(last, delta_left, delta_right);
    let phi = normalize_angle(last.phi - (delta_right - delta_left) / wheel_base);
    Pose { x, y, phi }
}

/// Integrate one frame of wheel travel, heading from an external sample
pub fn integrate_with_heading_fusion(last: &Pose, delta_left: f64, delta_right: f64, heading: f64) -> Pose {
    let (x, y) = advance(last, delta_left, delta_right);
    Pose {
        x,
        y,
        phi: normalize_angle(heading),
    }
}

/// Result of feeding one odometry frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseUpdate {
    /// Estimate selected by the heading source
    pub pose: Pose,
    pub odometry: Pose,
    pub fused: Pose,
    /// Whether `pose` differs from the previous authoritative pose
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct PoseEstimator {
    source: HeadingSource,
    odometry: Pose,
    fused: Pose,
    heading: Option<f64>,
}

impl PoseEstimator {
    pub fn new(source: HeadingSource) -> Self {
        Self {
            source,
            odometry: Pose::default(),
            fused: Pose::default(),
            heading: None,
        }
    }

    pub fn source(&self) -> HeadingSource {
        self.source
    }

    /// Authoritative pose
    pub fn pose(&self) -> Pose {
        match self.source {
            HeadingSource::Odometry => self.odometry,
            HeadingSource::Fused => self.fused,
        }
    }

    pub fn odometry_pose(&self) -> Pose {
        self.odometry
    }

    pub fn fused_pose(&self) -> Pose {
        self.fused
    }

    /// Latest external heading sample (rad)
    pub fn set_heading(&mut self, heading: f64) {
        self.heading = Some(normalize_angle(heading));
    }

    /// Force both estimates to `pose`
    pub fn reset(&mut self, pose: Pose) {
        self.odometry = pose;
        self.fused = pose;
    }

    pub fn update(&mut self, frame: &OdometryFrame, config: &RobotConfig) -> PoseUpdate {
        let previous = self.pose();
        let (delta_left, delta_right) = wheel_travel(frame, config);

        self.odometry = integrate_odom(&self.odometry, delta_left, delta_right, config.wheel_base);
        self.fused = match self.heading {
            Some(heading) => integrate_with_heading_fusion(&self.fused, delta_left, delta_right, heading),
            None => integrate_odom(&self.fused, delta_left, delta_right, config.wheel_base),
        };

        let pose = self.pose();
        PoseUpdate {
            pose,
            odometry: self.odometry,
            fused: self.fused,
            changed: pose != previous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use proptest::prelude::*;

    #[test]
    fn test_wrap_short_way_round() {
        let error = wrap_angle((PI - 0.01) - (-PI + 0.01));
        assert!((error + 0.02).abs() < 1e-9, "got {error}");

        let error = wrap_angle((-PI + 0.01) - (PI - 0.01));
        assert!((error - 0.02).abs() < 1e-9, "got {error}");

        assert_eq!(wrap_angle(PI), PI);
        assert!((wrap_angle(-PI) - PI).abs() < 1e-12);
    }

    #[test]
    fn test_zero_deltas_keep_pose() {
        let last = Pose::new(12.5, -3.25, 0.7);
        assert_eq!(integrate_odom(&last, 0.0, 0.0, 189.7), last);
    }

    #[test]
    fn test_straight_line_keeps_heading() {
        let last = Pose::new(0.0, 0.0, 0.0);
        let next = integrate_odom(&last, 10.0, 10.0, 189.7);
        assert_eq!(next, Pose::new(10.0, 0.0, 0.0));

        let angled = integrate_odom(&Pose::new(0.0, 0.0, PI / 2.0), 10.0, 10.0, 189.7);
        assert_eq!(angled.x, 0.0);
        assert_eq!(angled.y, 10.0);
        assert!((angled.phi - PI / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_spin_in_place_keeps_position() {
        let last = Pose::new(5.0, 5.0, 0.0);
        let next = integrate_odom(&last, 10.0, -10.0, 200.0);
        assert_eq!((next.x, next.y), (5.0, 5.0));
        // Left forward, right back turns towards positive phi
        assert!((next.phi - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_fusion_takes_external_heading() {
        let next = integrate_with_heading_fusion(&Pose::default(), 10.0, 10.0, 3.0 * PI);
        assert_eq!(next.x, 10.0);
        assert!((next.phi - PI).abs() < 1e-9);
    }

    #[test]
    fn test_estimator_tracks_both_estimates() {
        let config = test_config();
        let mut estimator = PoseEstimator::new(HeadingSource::Fused);

        // No heading sample yet: both estimates follow the ticks
        let update = estimator.update(&OdometryFrame::new(10, -10), &config);
        assert_eq!(update.odometry, update.fused);
        assert!(update.changed);

        estimator.set_heading(1.0);
        let update = estimator.update(&OdometryFrame::new(0, 0), &config);
        assert!((update.pose.phi - 1.0).abs() < 1e-12);
        assert!((update.odometry.phi - 1.0).abs() > 0.1);
        assert!(update.changed);
    }

    #[test]
    fn test_estimator_unchanged_pose() {
        let config = test_config();
        let mut estimator = PoseEstimator::new(HeadingSource::Odometry);
        let update = estimator.update(&OdometryFrame::new(0, 0), &config);
        assert!(!update.changed);
        assert_eq!(estimator.pose(), Pose::default());
    }

    #[test]
    fn test_reset_forces_both() {
        let mut estimator = PoseEstimator::new(HeadingSource::Odometry);
        let pose = Pose::new(100.0, 50.0, 0.25);
        estimator.reset(pose);
        assert_eq!(estimator.odometry_pose(), pose);
        assert_eq!(estimator.fused_pose(), pose);
    }

    proptest! {
        #[test]
        fn wrap_stays_in_range(angle in -100.0f64..100.0) {
            let wrapped = wrap_angle(angle);
            prop_assert!(wrapped > -PI && wrapped <= PI);
            prop_assert!((wrapped.sin() - angle.sin()).abs() < 1e-9);
            prop_assert!((wrapped.cos() - angle.cos()).abs() < 1e-9);
        }

        #[test]
        fn opposite_deltas_spin_in_place(delta in -500.0f64..500.0, x in -1e4f64..1e4, y in -1e4f64..1e4, phi in -3.0f64..3.0) {
            let last = Pose::new(x, y, phi);
            let next = integrate_odom(&last, delta, -delta, 189.7);
            prop_assert_eq!(next.x, (x * 10_000.0).round() / 10_000.0);
            prop_assert_eq!(next.y, (y * 10_000.0).round() / 10_000.0);
        }
    }
}
