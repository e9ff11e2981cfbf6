//! GATT transport layer abstraction.
//!
//! Defines the `OtaTransport` trait for the wireless link,
//! allowing different implementations (btleplug, mock, etc.).

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Connect timed out after {timeout_secs}s")]
    ConnectTimeout { timeout_secs: u64 },

    #[error("Connected, but OTA service not found on device")]
    ServiceNotFound,

    #[error("OTA characteristic not present on device: {uuid}")]
    CharacteristicMissing { uuid: Uuid },

    #[error("Write to {uuid} failed: {message}")]
    WriteFailed { uuid: Uuid, message: String },

    #[error("Subscribe to {uuid} failed: {message}")]
    SubscribeFailed { uuid: Uuid, message: String },

    #[error("Unsubscribe from {uuid} failed: {message}")]
    UnsubscribeFailed { uuid: Uuid, message: String },

    #[error("Link dropped")]
    LinkDropped,

    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
}

/// Abstract GATT transport interface.
///
/// This trait enables:
/// - Production implementation using btleplug
/// - Mock implementation for unit testing the transfer state machine
#[async_trait]
pub trait OtaTransport: Send + Sync {
    /// Write bytes to a characteristic. `with_response` requests
    /// acknowledged delivery at the link layer.
    async fn write_attribute(
        &self,
        uuid: Uuid,
        payload: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;

    /// Subscribe to notifications on a characteristic.
    ///
    /// Notifications arrive on the returned queue in FIFO order. The
    /// queue closes when the link drops, so a waiter can tell a dead
    /// link apart from a slow peripheral.
    async fn subscribe(&self, uuid: Uuid) -> Result<UnboundedReceiver<Vec<u8>>, TransportError>;

    /// Stop notifications on a characteristic.
    async fn unsubscribe(&self, uuid: Uuid) -> Result<(), TransportError>;

    /// Tear the connection down.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Largest single-write payload the active connection supports
    /// (the ATT MTU).
    fn link_capacity(&self) -> usize;
}
