//! btleplug-based GATT transport implementation.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::traits::{OtaTransport, TransportError};
use crate::protocol::constants::{OTA_CONTROL_UUID, OTA_DATA_UUID, OTA_SERVICE_UUID};

/// btleplug-based GATT transport.
///
/// Owns the connection for the session and resolves the OTA
/// characteristics once at connect time.
pub struct BtleTransport {
    peripheral: Peripheral,
    control_char: Characteristic,
    data_char: Characteristic,
    link_capacity: usize,
}

impl BtleTransport {
    /// Connect to the peripheral and resolve the OTA service and both
    /// characteristics.
    ///
    /// btleplug exposes no portable query for the negotiated ATT MTU,
    /// so the caller supplies the value later reported by
    /// [`OtaTransport::link_capacity`].
    #[instrument(skip(peripheral), fields(address = %peripheral.address()))]
    pub async fn connect(
        peripheral: Peripheral,
        connect_timeout: Duration,
        assumed_mtu: usize,
    ) -> Result<Self, TransportError> {
        info!("Connecting...");
        timeout(connect_timeout, peripheral.connect())
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                timeout_secs: connect_timeout.as_secs(),
            })?
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        if !peripheral
            .services()
            .iter()
            .any(|service| service.uuid == OTA_SERVICE_UUID)
        {
            return Err(TransportError::ServiceNotFound);
        }

        let characteristics = peripheral.characteristics();
        let control_char = characteristics
            .iter()
            .find(|c| c.uuid == OTA_CONTROL_UUID)
            .cloned()
            .ok_or(TransportError::CharacteristicMissing {
                uuid: OTA_CONTROL_UUID,
            })?;
        let data_char = characteristics
            .iter()
            .find(|c| c.uuid == OTA_DATA_UUID)
            .cloned()
            .ok_or(TransportError::CharacteristicMissing { uuid: OTA_DATA_UUID })?;

        info!(assumed_mtu, "Connected");
        Ok(Self {
            peripheral,
            control_char,
            data_char,
            link_capacity: assumed_mtu,
        })
    }

    /// Peripheral address, for reporting.
    pub fn address(&self) -> String {
        self.peripheral.address().to_string()
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        if uuid == self.control_char.uuid {
            Ok(&self.control_char)
        } else if uuid == self.data_char.uuid {
            Ok(&self.data_char)
        } else {
            Err(TransportError::CharacteristicMissing { uuid })
        }
    }
}

#[async_trait]
impl OtaTransport for BtleTransport {
    async fn write_attribute(
        &self,
        uuid: Uuid,
        payload: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(uuid)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(characteristic, payload, write_type)
            .await
            .map_err(|e| TransportError::WriteFailed {
                uuid,
                message: e.to_string(),
            })
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<UnboundedReceiver<Vec<u8>>, TransportError> {
        let characteristic = self.characteristic(uuid)?.clone();
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| TransportError::SubscribeFailed {
                uuid,
                message: e.to_string(),
            })?;

        let mut stream =
            self.peripheral
                .notifications()
                .await
                .map_err(|e| TransportError::SubscribeFailed {
                    uuid,
                    message: e.to_string(),
                })?;

        let (tx, rx) = mpsc::unbounded_channel();
        // The notification stream ends when the link drops; the task
        // then exits and dropping `tx` closes the queue, which the
        // waiter reads as LinkDropped.
        tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == uuid && tx.send(notification.value).is_err() {
                    break;
                }
            }
            debug!(%uuid, "Notification stream ended");
        });

        Ok(rx)
    }

    async fn unsubscribe(&self, uuid: Uuid) -> Result<(), TransportError> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral
            .unsubscribe(characteristic)
            .await
            .map_err(|e| TransportError::UnsubscribeFailed {
                uuid,
                message: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::DisconnectFailed(e.to_string()))
    }

    fn link_capacity(&self) -> usize {
        self.link_capacity
    }
}
