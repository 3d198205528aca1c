pub mod codec;
pub mod connection;
pub mod health;
pub mod pool;

pub use connection::{ConnectionError, ModbusConnection};
pub use health::DeviceHealthTracker;
pub use pool::DevicePool;
