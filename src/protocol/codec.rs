// Frame codec for the motor controller board
//
// Device -> host, after unstuffing: [0xA3, 0x3A, CMD, LEN, payload(LEN)...]
// Host -> device, before stuffing:  [0xA3, CMD, payload...]
//
// Frames are COBS-stuffed and terminated by 0x00 on the wire. The stuffing
// overhead byte sits immediately in front of the 0xA3 0x3A marker.

use tracing::{debug, trace, warn};

use super::cobs::{self, DELIMITER, StuffingError};
use super::parsers::{self, PayloadError};
use crate::messages::{DebugFrame, OdometryFrame};

/// Marker opening every device frame
pub const FRAME_MARKER: [u8; 2] = [0xA3, 0x3A];

/// First byte of every host request
pub const REQUEST_START_FLAG: u8 = 0xA3;

/// Marker + CMD + LEN
const HEADER_LEN: usize = 4;

/// Default bound on bytes held while waiting for a frame to complete
pub const DEFAULT_BUFFER_LIMIT: usize = 1024;

/// Device command codes
pub const CMD_READY: u8 = 0xFF;
pub const CMD_ODOMETRY: u8 = 0x30;
pub const CMD_DEBUG: u8 = 0x35;

/// Host request codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCode {
    IsReady = 0x01,
    SetDebugLevel = 0x02,
    Close = 0x03,
    SetDirection = 0x10,
    SetSpeed = 0x11,
    Stop = 0x13,
}

/// Wheel direction pairs as understood by the board: [left, right]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
    RotateLeft,
    RotateRight,
}

impl Direction {
    pub fn bytes(self) -> [u8; 2] {
        match self {
            Direction::Forward => [1, 0],
            Direction::Reverse => [0, 1],
            Direction::RotateLeft => [0, 0],
            Direction::RotateRight => [1, 1],
        }
    }

    /// Direction bytes for independent signed wheel speeds
    pub fn for_wheels(left: f64, right: f64) -> [u8; 2] {
        [u8::from(left > 0.0), u8::from(right <= 0.0)]
    }
}

/// A request sent from the host to the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    IsReady,
    SetDebugLevel(u8),
    Close,
    SetDirection([u8; 2]),
    /// Tick-speed per control loop for the left and right wheel
    SetSpeed { left: u8, right: u8 },
    Stop,
}

impl Request {
    pub fn code(&self) -> RequestCode {
        match self {
            Request::IsReady => RequestCode::IsReady,
            Request::SetDebugLevel(_) => RequestCode::SetDebugLevel,
            Request::Close => RequestCode::Close,
            Request::SetDirection(_) => RequestCode::SetDirection,
            Request::SetSpeed { .. } => RequestCode::SetSpeed,
            Request::Stop => RequestCode::Stop,
        }
    }

    /// Unstuffed request bytes: start flag, code, payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![REQUEST_START_FLAG, self.code() as u8];
        match *self {
            Request::SetDebugLevel(level) => bytes.push(level),
            Request::SetDirection(dirs) => bytes.extend_from_slice(&dirs),
            Request::SetSpeed { left, right } => bytes.extend_from_slice(&[left, right]),
            Request::IsReady | Request::Close | Request::Stop => {}
        }
        bytes
    }

    /// Wire bytes: stuffed and terminated
    pub fn encode(&self) -> Vec<u8> {
        cobs::encode_frame(&self.to_bytes())
    }
}

/// Decoded device frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceEvent {
    Ready,
    Odometry(OdometryFrame),
    Debug(DebugFrame),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Bad stuffing: {0}")]
    Stuffing(#[from] StuffingError),

    #[error("Frame header missing or corrupt ({len} bytes)")]
    Header { len: usize },

    #[error("Frame 0x{cmd:02X} announces {expected} payload bytes, {actual} present")]
    ShortPayload {
        cmd: u8,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Build the wire bytes of a device frame (what the board sends)
pub fn encode_device_frame(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&FRAME_MARKER);
    frame.push(cmd);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    cobs::encode_frame(&frame)
}

/// Unstuff one frame (terminator excluded) and turn it into an event.
/// Unknown commands yield `Ok(None)`.
pub fn parse_frame(stuffed: &[u8]) -> Result<Option<DeviceEvent>, FrameError> {
    let frame = cobs::decode(stuffed)?;
    if frame.len() < HEADER_LEN || frame[..2] != FRAME_MARKER {
        return Err(FrameError::Header { len: frame.len() });
    }

    let cmd = frame[2];
    let len = frame[3] as usize;
    let payload = frame
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or(FrameError::ShortPayload {
            cmd,
            expected: len,
            actual: frame.len() - HEADER_LEN,
        })?;

    let event = match cmd {
        CMD_READY => DeviceEvent::Ready,
        CMD_ODOMETRY => DeviceEvent::Odometry(parsers::parse_odometry(payload)?),
        CMD_DEBUG => DeviceEvent::Debug(parsers::parse_debug(payload)?),
        other => {
            trace!("Dropping frame with unknown command 0x{:02X}", other);
            return Ok(None);
        }
    };
    Ok(Some(event))
}

/// Restartable scanner turning arbitrarily chunked serial input into events
pub struct FrameDecoder {
    buffer: Vec<u8>,
    limit: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_BUFFER_LIMIT)
    }

    /// Create a decoder that holds at most `limit` bytes of pending input
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(limit),
            limit: limit.max(HEADER_LEN + 2),
        }
    }

    /// Bytes currently waiting for a frame to complete
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and iterate over every frame it completes
    pub fn decode<'a>(&'a mut self, chunk: &[u8]) -> impl Iterator<Item = DeviceEvent> + use<'a> {
        self.buffer.extend_from_slice(chunk);
        std::iter::from_fn(move || self.next_event())
    }

    /// Extract the next complete frame from the buffer, if any
    pub fn next_event(&mut self) -> Option<DeviceEvent> {
        loop {
            let Some(marker) = find_marker(&self.buffer) else {
                self.trim_unmarked();
                return None;
            };

            if marker == 0 {
                // Stuffing byte in front of the marker was lost
                debug!("Marker at buffer start without overhead byte, skipping");
                self.buffer.drain(..1);
                continue;
            }
            let start = marker - 1;

            let Some(end) = self.buffer[marker..]
                .iter()
                .position(|&b| b == DELIMITER)
                .map(|offset| marker + offset)
            else {
                if self.buffer.len() - start > self.limit {
                    warn!(
                        "Discarding {} bytes of unterminated frame",
                        self.buffer.len() - start
                    );
                    self.buffer.drain(..marker + FRAME_MARKER.len());
                    continue;
                }
                self.buffer.drain(..start);
                return None;
            };

            let parsed = parse_frame(&self.buffer[start..end]);
            self.buffer.drain(..=end);

            match parsed {
                Ok(Some(event)) => return Some(event),
                Ok(None) => continue,
                Err(e) => {
                    warn!("Dropping malformed frame: {}", e);
                    continue;
                }
            }
        }
    }

    fn trim_unmarked(&mut self) {
        if self.buffer.len() > self.limit {
            // Keep the tail: it may hold an overhead byte and half a marker
            let drop = self.buffer.len() - 2;
            debug!("No frame marker in {} bytes, dropping {}", self.buffer.len(), drop);
            self.buffer.drain(..drop);
        }
    }
}

fn find_marker(buffer: &[u8]) -> Option<usize> {
    buffer.windows(FRAME_MARKER.len()).position(|w| w == FRAME_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parsers::odometry_payload;

    fn odometry_bytes(left: i32, right: i32) -> Vec<u8> {
        encode_device_frame(CMD_ODOMETRY, &odometry_payload(&OdometryFrame::new(left, right)))
    }

    #[test]
    fn test_request_bytes() {
        assert_eq!(Request::IsReady.to_bytes(), vec![0xA3, 0x01]);
        assert_eq!(
            Request::SetDirection(Direction::Forward.bytes()).to_bytes(),
            vec![0xA3, 0x10, 1, 0]
        );
        assert_eq!(
            Request::SetSpeed { left: 12, right: 0 }.to_bytes(),
            vec![0xA3, 0x11, 12, 0]
        );
        assert_eq!(Request::Stop.to_bytes(), vec![0xA3, 0x13]);
        assert_eq!(Request::Close.to_bytes(), vec![0xA3, 0x03]);
        assert_eq!(Request::SetDebugLevel(2).to_bytes(), vec![0xA3, 0x02, 2]);
    }

    #[test]
    fn test_request_encoding_is_stuffed_and_terminated() {
        let wire = Request::SetSpeed { left: 12, right: 0 }.encode();
        assert_eq!(wire, vec![0x04, 0xA3, 0x11, 12, 0x01, 0x00]);
    }

    #[test]
    fn test_wheel_directions() {
        assert_eq!(Direction::for_wheels(100.0, 100.0), Direction::Forward.bytes());
        assert_eq!(Direction::for_wheels(-100.0, -100.0), Direction::Reverse.bytes());
        assert_eq!(Direction::for_wheels(100.0, -100.0), Direction::RotateRight.bytes());
    }

    #[test]
    fn test_decode_ready() {
        let mut decoder = FrameDecoder::new();
        let events: Vec<_> = decoder.decode(&encode_device_frame(CMD_READY, &[])).collect();

        assert_eq!(events, vec![DeviceEvent::Ready]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_split_frame_yields_one_event() {
        let wire = odometry_bytes(12, -3);
        let mut whole = FrameDecoder::new();
        let expected: Vec<_> = whole.decode(&wire).collect();
        assert_eq!(expected.len(), 1);

        for split in 1..wire.len() {
            let mut decoder = FrameDecoder::new();
            let mut events: Vec<_> = decoder.decode(&wire[..split]).collect();
            events.extend(decoder.decode(&wire[split..]));
            assert_eq!(events, expected, "split at {split}");
        }
    }

    #[test]
    fn test_garbage_and_back_to_back_frames() {
        let mut stream = vec![0x55, 0x13, 0x00, 0x99];
        stream.extend(odometry_bytes(1, 2));
        stream.extend(encode_device_frame(0x42, &[1, 2, 3]));
        stream.extend(odometry_bytes(3, 4));

        let mut decoder = FrameDecoder::new();
        let events: Vec<_> = decoder.decode(&stream).collect();

        assert_eq!(
            events,
            vec![
                DeviceEvent::Odometry(OdometryFrame::new(1, 2)),
                DeviceEvent::Odometry(OdometryFrame::new(3, 4)),
            ]
        );
    }

    #[test]
    fn test_debug_frame_dispatch() {
        let payload = [20, 30, 28, 0x01, 0x2C, 0x10, 0x00, 31, 29, 0x00, 0xC8, 0x0F, 0xFF];
        let mut decoder = FrameDecoder::new();
        let events: Vec<_> = decoder.decode(&encode_device_frame(CMD_DEBUG, &payload)).collect();

        match events.as_slice() {
            [DeviceEvent::Debug(frame)] => assert_eq!(frame.left.speed_pwm_output, 300),
            other => panic!("expected one debug event, got {other:?}"),
        }
    }

    #[test]
    fn test_short_payload_is_dropped() {
        // LEN says 8 but only 2 payload bytes follow
        let wire = cobs::encode_frame(&[0xA3, 0x3A, CMD_ODOMETRY, 8, 1, 2]);
        let mut stream = wire;
        stream.extend(odometry_bytes(5, 5));

        let mut decoder = FrameDecoder::new();
        let events: Vec<_> = decoder.decode(&stream).collect();
        assert_eq!(events, vec![DeviceEvent::Odometry(OdometryFrame::new(5, 5))]);
    }

    #[test]
    fn test_buffer_is_bounded_without_marker() {
        let mut decoder = FrameDecoder::with_limit(64);
        let noise = vec![0x11; 500];
        assert_eq!(decoder.decode(&noise).count(), 0);
        assert!(decoder.buffered() <= 64);

        // Still decodes once a frame arrives
        let events: Vec<_> = decoder.decode(&odometry_bytes(1, 1)).collect();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_unterminated_frame_is_bounded() {
        let mut decoder = FrameDecoder::with_limit(64);
        let mut stream = vec![0x05, 0xA3, 0x3A];
        stream.extend(vec![0x22; 200]);
        assert_eq!(decoder.decode(&stream).count(), 0);
        assert!(decoder.buffered() <= 64);
    }
}
