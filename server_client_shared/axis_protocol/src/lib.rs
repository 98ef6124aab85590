//! Wire types shared between the coordinator and the axis controllers on the bus.
pub mod axis;
pub mod frame;

pub use axis::{AxisId, CommandCode};
pub use frame::{crc8, decode_frame, decode_line, encode_frame, FrameError, SlaveCommand};
