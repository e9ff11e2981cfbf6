//! Transport layer module.

pub mod btle;
pub mod mock;
pub mod traits;

pub use btle::BtleTransport;
pub use mock::{ControlReply, MockTransport};
pub use traits::{OtaTransport, TransportError};
