//! Control channel: opcode writes and acknowledgment waits.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::debug;

use crate::protocol::constants::OTA_CONTROL_UUID;
use crate::protocol::opcode::ControlOpcode;
use crate::transport::{OtaTransport, TransportError};

#[derive(Error, Debug)]
pub enum ControlError {
    /// No notification arrived within the ack timeout.
    #[error("Timeout waiting for {label} response")]
    AckTimeout { label: &'static str },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Writes control opcodes and waits for the peripheral's replies.
///
/// Holding the notification queue receiver behind `&mut self` keeps
/// the waits single-consumer: a second concurrent `await_response`
/// cannot be expressed.
pub struct ControlChannel<'a, T: OtaTransport> {
    transport: &'a T,
    inbox: UnboundedReceiver<Vec<u8>>,
    ack_timeout: Duration,
}

impl<'a, T: OtaTransport> ControlChannel<'a, T> {
    /// Subscribe to the control characteristic and wrap its queue.
    pub async fn open(transport: &'a T, ack_timeout: Duration) -> Result<Self, TransportError> {
        let inbox = transport.subscribe(OTA_CONTROL_UUID).await?;
        Ok(Self {
            transport,
            inbox,
            ack_timeout,
        })
    }

    /// Write a single opcode byte with acknowledged delivery.
    pub async fn send(&self, opcode: ControlOpcode) -> Result<(), TransportError> {
        debug!(%opcode, "Sending control opcode");
        self.transport
            .write_attribute(OTA_CONTROL_UUID, &[opcode.as_byte()], true)
            .await
    }

    /// Wait for the next notification buffer.
    ///
    /// A closed queue means the notification producer is gone, which
    /// only happens when the link dropped.
    pub async fn await_response(&mut self, label: &'static str) -> Result<Vec<u8>, ControlError> {
        match timeout(self.ack_timeout, self.inbox.recv()).await {
            Ok(Some(buf)) => Ok(buf),
            Ok(None) => Err(TransportError::LinkDropped.into()),
            Err(_) => Err(ControlError::AckTimeout { label }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[tokio::test]
    async fn test_send_writes_one_acknowledged_byte() {
        let mock = MockTransport::new(512);
        let channel = ControlChannel::open(&mock, Duration::from_secs(5))
            .await
            .unwrap();
        channel.send(ControlOpcode::Request).await.unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        let (uuid, payload, with_response) = &writes[0];
        assert_eq!(*uuid, OTA_CONTROL_UUID);
        assert_eq!(payload, &vec![0x01]);
        assert!(*with_response);
    }

    #[tokio::test]
    async fn test_responses_arrive_in_fifo_order() {
        let mock = MockTransport::new(512);
        let mut channel = ControlChannel::open(&mock, Duration::from_secs(5))
            .await
            .unwrap();
        mock.notify(&[0x02]);
        mock.notify(&[0x05]);

        assert_eq!(channel.await_response("first").await.unwrap(), vec![0x02]);
        assert_eq!(channel.await_response("second").await.unwrap(), vec![0x05]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_carries_label() {
        let mock = MockTransport::new(512);
        let mut channel = ControlChannel::open(&mock, Duration::from_secs(5))
            .await
            .unwrap();

        let err = channel.await_response("OTA request").await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::AckTimeout {
                label: "OTA request"
            }
        ));
    }

    #[tokio::test]
    async fn test_closed_queue_is_link_dropped() {
        let mock = MockTransport::new(512);
        let mut channel = ControlChannel::open(&mock, Duration::from_secs(5))
            .await
            .unwrap();
        mock.drop_link();

        let err = channel.await_response("OTA done").await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::Transport(TransportError::LinkDropped)
        ));
    }
}
