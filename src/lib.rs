pub mod daemon;
pub mod device;
pub mod error;
pub mod server;

pub use device::seek::{SeekTo, parse_seek_command};
pub use device::{CommandDevice, DeviceHandle};
pub use error::AesdError;
pub use server::{Backend, Server, ServerConfig};
