pub mod credential;
pub mod device;
pub mod message;
pub mod pem;
pub mod telemetry;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod topics;

pub use credential::*;
pub use device::*;
pub use message::*;
pub use telemetry::*;
