// Payload parsers for device frames
//
// Odometry (0x30), 8 bytes, one 4-byte word per wheel:
//   [m2, m1, m0, dir]  24-bit big-endian tick magnitude, then direction
// The legacy 4-byte layout [left, left_dir, right, right_dir] is also accepted.
//
// The motors are mounted mirrored: a non-zero direction byte means forward
// for the left wheel and reverse for the right wheel.
//
// Debug (0x35), 13 bytes:
//   [loop_time, left(6), right(6)]
//   per motor: [setpoint, ticks_input, pwm_hi, pwm_lo, total_hi, total_lo]

use crate::messages::{DebugFrame, MotorDebug, OdometryFrame};

pub const ODOMETRY_PAYLOAD_LEN: usize = 8;
pub const LEGACY_ODOMETRY_PAYLOAD_LEN: usize = 4;
pub const DEBUG_PAYLOAD_LEN: usize = 13;

const MAX_TICK_MAGNITUDE: u32 = 0x00FF_FFFF;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unexpected {kind} payload length: {len}")]
pub struct PayloadError {
    pub kind: &'static str,
    pub len: usize,
}

fn left_sign(direction: u8) -> i32 {
    if direction != 0 { 1 } else { -1 }
}

fn right_sign(direction: u8) -> i32 {
    if direction == 0 { 1 } else { -1 }
}

fn word(hi: u8, lo: u8) -> u16 {
    u16::from_be_bytes([hi, lo])
}

/// Parse an odometry payload into signed tick deltas
pub fn parse_odometry(payload: &[u8]) -> Result<OdometryFrame, PayloadError> {
    match payload.len() {
        ODOMETRY_PAYLOAD_LEN => {
            let left = u32::from_be_bytes([0, payload[0], payload[1], payload[2]]) as i32;
            let right = u32::from_be_bytes([0, payload[4], payload[5], payload[6]]) as i32;
            Ok(OdometryFrame::new(
                left * left_sign(payload[3]),
                right * right_sign(payload[7]),
            ))
        }
        LEGACY_ODOMETRY_PAYLOAD_LEN => Ok(OdometryFrame::new(
            payload[0] as i32 * left_sign(payload[1]),
            payload[2] as i32 * right_sign(payload[3]),
        )),
        len => Err(PayloadError {
            kind: "odometry",
            len,
        }),
    }
}

/// Build the 8-byte odometry payload the device would send for `frame`
pub fn odometry_payload(frame: &OdometryFrame) -> [u8; ODOMETRY_PAYLOAD_LEN] {
    let left = frame.left_ticks.unsigned_abs().min(MAX_TICK_MAGNITUDE).to_be_bytes();
    let right = frame.right_ticks.unsigned_abs().min(MAX_TICK_MAGNITUDE).to_be_bytes();
    let left_dir = u8::from(frame.left_ticks >= 0);
    let right_dir = u8::from(frame.right_ticks < 0);

    [
        left[1], left[2], left[3], left_dir, right[1], right[2], right[3], right_dir,
    ]
}

fn parse_motor(fields: &[u8]) -> MotorDebug {
    MotorDebug {
        speed_setpoint: fields[0],
        speed_ticks_input: fields[1],
        speed_pwm_output: word(fields[2], fields[3]),
        total_ticks: word(fields[4], fields[5]),
    }
}

/// Parse a debug payload
pub fn parse_debug(payload: &[u8]) -> Result<DebugFrame, PayloadError> {
    if payload.len() < DEBUG_PAYLOAD_LEN {
        return Err(PayloadError {
            kind: "debug",
            len: payload.len(),
        });
    }

    Ok(DebugFrame {
        loop_time: payload[0],
        left: parse_motor(&payload[1..7]),
        right: parse_motor(&payload[7..13]),
    })
}
