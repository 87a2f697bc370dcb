//! Sensor data acquisition module
//!
//! Handles the serial link to the sensor board and turns raw lines into
//! validated frames.

pub mod frame_parser;
pub mod serial_channel;
pub mod simulated;

pub use frame_parser::{FrameError, FrameParser};
pub use serial_channel::{
    ChannelError, LineTransport, SerialChannel, SerialPortConnector, SerialSettings,
    TransportConnector,
};
pub use simulated::SimulatedConnector;
