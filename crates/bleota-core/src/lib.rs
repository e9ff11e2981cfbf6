//! bleota-core: BLE OTA firmware transfer client (central role).
//!
//! Streams a firmware image to an embedded peripheral over GATT:
//! packet-size negotiation, request/done control handshakes, and
//! strictly ordered packet streaming with per-packet retry.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: UUIDs, control opcodes, tunables
//! - **Transport**: GATT communication abstraction (btleplug, mock)
//! - **Packet**: firmware image loading and chunking
//! - **Control**: opcode writes and acknowledgment waits
//! - **Retry**: bounded per-packet retry
//! - **Discover**: scan-and-match and interactive selection
//! - **Events**: observer pattern for UI decoupling
//! - **Session**: the transfer state machine
//!
//! # Example
//!
//! ```no_run
//! use bleota_core::session::{OtaSession, SessionConfig};
//!
//! # async fn run() {
//! let config = SessionConfig {
//!     firmware_path: "ota-ble.bin".to_string(),
//!     auto_select: true,
//!     ..Default::default()
//! };
//!
//! let mut session = OtaSession::new(config);
//! session.run().await.expect("OTA failed");
//! # }
//! ```

pub mod control;
pub mod discover;
pub mod events;
pub mod packet;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use control::{ControlChannel, ControlError};
pub use discover::DiscoveryError;
pub use events::{NullObserver, OtaEvent, OtaObserver, TracingObserver};
pub use packet::{FirmwareImage, PacketError};
pub use protocol::opcode::{ControlOpcode, ControlResponse};
pub use retry::RetryPolicy;
pub use session::{ConfigError, OtaError, OtaSession, SessionConfig, TransferState};
pub use transport::{BtleTransport, ControlReply, MockTransport, OtaTransport, TransportError};
