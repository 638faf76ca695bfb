// Trapezoidal speed planning and the per-tick ramp

/// Added to every acceleration time so a zero speed change still plans some travel
pub const ACCELERATION_TIME_OFFSET: f64 = 0.1;

/// Seconds needed to go from `current` to `target` speed (mm/s) at `acceleration` (mm/s²)
pub fn acceleration_time(target: f64, current: f64, acceleration: f64) -> f64 {
    (target - current) / acceleration + ACCELERATION_TIME_OFFSET
}

/// Distance (mm, rounded up) covered while accelerating from `current` to `target`
pub fn acceleration_distance(target: f64, current: f64, acceleration: f64) -> f64 {
    let time = acceleration_time(target, current, acceleration);
    (0.5 * acceleration * time * time).ceil()
}

/// Cruise speed and one-way acceleration distance for a move
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedPlan {
    pub cruise_speed: f64,
    pub acceleration_distance: f64,
}

/// Highest cruise speed not above `desired_speed` that leaves room to
/// accelerate and decelerate symmetrically within `distance`.
///
/// Moves of at most `2 * min_speed` are driven at `min_speed` throughout.
pub fn max_achievable_speed(
    distance: f64,
    desired_speed: f64,
    min_speed: f64,
    acceleration: f64,
) -> SpeedPlan {
    let creep = SpeedPlan {
        cruise_speed: min_speed,
        acceleration_distance: 0.0,
    };
    if distance <= 2.0 * min_speed {
        return creep;
    }

    let mut speed = desired_speed;
    loop {
        if speed <= min_speed {
            return creep;
        }

        let acceleration_distance = acceleration_distance(speed, 0.0, acceleration);
        if 2.0 * acceleration_distance <= distance {
            return SpeedPlan {
                cruise_speed: speed,
                acceleration_distance,
            };
        }
        speed -= min_speed / 2.0;
    }
}

/// Move `current` towards `setpoint` by at most `step`, never overshooting
pub fn ramp_towards(current: f64, setpoint: f64, step: f64) -> f64 {
    if current < setpoint {
        (current + step).min(setpoint)
    } else {
        (current - step).max(setpoint)
    }
}

/// Wheel speed (mm/s) to encoder ticks per control loop
pub fn speed_to_tick_speed(speed: f64, distance_per_tick: f64, loop_time_ms: f64) -> i64 {
    (speed * loop_time_ms / 1000.0 / distance_per_tick).round() as i64
}

/// Encoder ticks per control loop to wheel speed (mm/s)
pub fn tick_speed_to_speed(ticks: i64, distance_per_tick: f64, loop_time_ms: f64) -> f64 {
    ticks as f64 * distance_per_tick * 1000.0 / loop_time_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_acceleration_distance() {
        // 400 mm/s at 500 mm/s²: t = 0.8 + 0.1, d = ceil(202.5)
        assert!((acceleration_time(400.0, 0.0, 500.0) - 0.9).abs() < 1e-12);
        assert_eq!(acceleration_distance(400.0, 0.0, 500.0), 203.0);
        // Offset keeps a zero speed change from planning zero distance
        assert_eq!(acceleration_distance(100.0, 100.0, 500.0), 3.0);
    }

    #[test]
    fn test_plan_full_speed() {
        let plan = max_achievable_speed(500.0, 400.0, 50.0, 500.0);
        assert_eq!(plan.cruise_speed, 400.0);
        assert_eq!(plan.acceleration_distance, 203.0);
    }

    #[test]
    fn test_plan_reduced_speed() {
        let plan = max_achievable_speed(300.0, 400.0, 50.0, 500.0);
        assert!(plan.cruise_speed < 400.0);
        assert!(2.0 * plan.acceleration_distance <= 300.0);
        assert_eq!(plan.acceleration_distance, acceleration_distance(plan.cruise_speed, 0.0, 500.0));
    }

    #[test]
    fn test_plan_short_move_creeps() {
        let plan = max_achievable_speed(100.0, 400.0, 50.0, 500.0);
        assert_eq!(
            plan,
            SpeedPlan {
                cruise_speed: 50.0,
                acceleration_distance: 0.0
            }
        );
    }

    #[test]
    fn test_ramp() {
        assert_eq!(ramp_towards(0.0, 25.0, 10.0), 10.0);
        assert_eq!(ramp_towards(20.0, 25.0, 10.0), 25.0);
        assert_eq!(ramp_towards(25.0, 25.0, 10.0), 25.0);
        assert_eq!(ramp_towards(30.0, 0.0, 10.0), 20.0);
        assert_eq!(ramp_towards(5.0, 0.0, 10.0), 0.0);
    }

    #[test]
    fn test_tick_speed_conversion() {
        // 400 mm/s for 20 ms = 8 mm, 4 mm per tick
        assert_eq!(speed_to_tick_speed(400.0, 4.0, 20.0), 2);
        assert_eq!(tick_speed_to_speed(2, 4.0, 20.0), 400.0);
        assert_eq!(speed_to_tick_speed(0.0, 4.0, 20.0), 0);
    }

    proptest! {
        #[test]
        fn plan_fits_distance(
            distance in 1.0f64..20_000.0,
            max_speed in 50.0f64..2_000.0,
            min_speed in 1.0f64..200.0,
            acceleration in 50.0f64..5_000.0,
        ) {
            let plan = max_achievable_speed(distance, max_speed, min_speed, acceleration);
            if distance <= 2.0 * min_speed {
                prop_assert_eq!(plan.cruise_speed, min_speed);
                prop_assert_eq!(plan.acceleration_distance, 0.0);
            } else {
                prop_assert!(plan.cruise_speed <= max_speed.max(min_speed));
                prop_assert!(2.0 * plan.acceleration_distance <= distance);
            }
        }

        #[test]
        fn ramp_never_overshoots(current in -1_000.0f64..1_000.0, setpoint in -1_000.0f64..1_000.0, step in 0.0f64..500.0) {
            let next = ramp_towards(current, setpoint, step);
            let (low, high) = if current < setpoint { (current, setpoint) } else { (setpoint, current) };
            prop_assert!(next >= low && next <= high);
            prop_assert_eq!(ramp_towards(setpoint, setpoint, step), setpoint);
        }
    }
}
