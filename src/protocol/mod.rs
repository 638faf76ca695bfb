// Wire protocol for the differential-drive controller board
//
// Provides:
// - COBS byte stuffing
// - Frame scanner and request encoder
// - Odometry / debug payload parsers
// - Serial link with a background reader

pub mod cobs;
pub mod codec;
pub mod link;
pub mod parsers;

pub use codec::{DeviceEvent, Direction, FrameDecoder, FrameError, Request, encode_device_frame};
pub use link::{Link, LinkError, LinkEvent, SerialLink};
