//! Mock GATT transport for testing.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use super::traits::{OtaTransport, TransportError};
use crate::protocol::constants::{OTA_CONTROL_UUID, OTA_DATA_UUID};

/// Scripted reaction to a control-characteristic write.
#[derive(Debug, Clone)]
pub enum ControlReply {
    /// Push these bytes onto the notification queue.
    Respond(Vec<u8>),
    /// Reply with nothing and let the waiter time out.
    Silent,
    /// Close the notification queue, as a dropped link would.
    DropLink,
}

/// Mock transport for unit testing transfer state machine logic.
pub struct MockTransport {
    /// Captured successful writes: (characteristic, payload, with_response).
    write_log: Mutex<Vec<(Uuid, Vec<u8>, bool)>>,
    /// Scripted replies, consumed one per control write.
    replies: Mutex<VecDeque<ControlReply>>,
    /// Producer side of the notification queue handed out on subscribe.
    notify_tx: Mutex<Option<UnboundedSender<Vec<u8>>>>,
    /// Injected data-write faults: (first failing attempt ordinal, count).
    fault_windows: Mutex<Vec<(usize, u32)>>,
    /// Data-characteristic write attempts seen so far, failures included.
    data_attempts: Mutex<usize>,
    /// Simulated ATT MTU.
    capacity: usize,
    unsubscribed: Mutex<bool>,
    disconnected: Mutex<bool>,
}

impl MockTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            write_log: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            notify_tx: Mutex::new(None),
            fault_windows: Mutex::new(Vec::new()),
            data_attempts: Mutex::new(0),
            capacity,
            unsubscribed: Mutex::new(false),
            disconnected: Mutex::new(false),
        }
    }

    /// Queue a scripted reaction to the next unanswered control write.
    pub fn queue_reply(&self, reply: ControlReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Queue a plain notification response to the next control write.
    pub fn queue_response(&self, bytes: &[u8]) {
        self.queue_reply(ControlReply::Respond(bytes.to_vec()));
    }

    /// Push an unsolicited notification, as the peripheral could.
    pub fn notify(&self, bytes: &[u8]) {
        if let Some(tx) = self.notify_tx.lock().unwrap().as_ref() {
            let _ = tx.send(bytes.to_vec());
        }
    }

    /// Close the notification queue, simulating a dropped link.
    pub fn drop_link(&self) {
        self.notify_tx.lock().unwrap().take();
    }

    /// Fail `times` consecutive data-characteristic write attempts
    /// starting at attempt `ordinal` (0 = the first data write).
    pub fn fail_data_writes_from(&self, ordinal: usize, times: u32) {
        self.fault_windows.lock().unwrap().push((ordinal, times));
    }

    /// All captured writes.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>, bool)> {
        self.write_log.lock().unwrap().clone()
    }

    /// Payloads successfully written to the data characteristic, in order.
    pub fn data_writes(&self) -> Vec<Vec<u8>> {
        self.write_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(uuid, _, _)| *uuid == OTA_DATA_UUID)
            .map(|(_, payload, _)| payload.clone())
            .collect()
    }

    /// Payloads written to the control characteristic, in order.
    pub fn control_writes(&self) -> Vec<Vec<u8>> {
        self.write_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(uuid, _, _)| *uuid == OTA_CONTROL_UUID)
            .map(|(_, payload, _)| payload.clone())
            .collect()
    }

    pub fn was_unsubscribed(&self) -> bool {
        *self.unsubscribed.lock().unwrap()
    }

    pub fn was_disconnected(&self) -> bool {
        *self.disconnected.lock().unwrap()
    }
}

#[async_trait]
impl OtaTransport for MockTransport {
    async fn write_attribute(
        &self,
        uuid: Uuid,
        payload: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        if uuid == OTA_DATA_UUID {
            let attempt = {
                let mut seen = self.data_attempts.lock().unwrap();
                let current = *seen;
                *seen += 1;
                current
            };
            let faulted = self
                .fault_windows
                .lock()
                .unwrap()
                .iter()
                .any(|(start, times)| attempt >= *start && attempt < *start + *times as usize);
            if faulted {
                return Err(TransportError::WriteFailed {
                    uuid,
                    message: format!("injected fault at attempt {attempt}"),
                });
            }
        }

        self.write_log
            .lock()
            .unwrap()
            .push((uuid, payload.to_vec(), with_response));

        if uuid == OTA_CONTROL_UUID {
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(ControlReply::Respond(bytes)) => {
                    if let Some(tx) = self.notify_tx.lock().unwrap().as_ref() {
                        let _ = tx.send(bytes);
                    }
                }
                Some(ControlReply::DropLink) => self.drop_link(),
                Some(ControlReply::Silent) | None => {}
            }
        }

        Ok(())
    }

    async fn subscribe(&self, _uuid: Uuid) -> Result<UnboundedReceiver<Vec<u8>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notify_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, _uuid: Uuid) -> Result<(), TransportError> {
        *self.unsubscribed.lock().unwrap() = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        *self.disconnected.lock().unwrap() = true;
        Ok(())
    }

    fn link_capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_capture() {
        let mock = MockTransport::new(512);
        mock.write_attribute(OTA_DATA_UUID, b"hello", true)
            .await
            .unwrap();
        mock.write_attribute(OTA_CONTROL_UUID, &[0x01], true)
            .await
            .unwrap();

        assert_eq!(mock.data_writes(), vec![b"hello".to_vec()]);
        assert_eq!(mock.control_writes(), vec![vec![0x01]]);
    }

    #[tokio::test]
    async fn test_scripted_reply_on_control_write() {
        let mock = MockTransport::new(512);
        let mut inbox = mock.subscribe(OTA_CONTROL_UUID).await.unwrap();
        mock.queue_response(&[0x02]);

        mock.write_attribute(OTA_CONTROL_UUID, &[0x01], true)
            .await
            .unwrap();
        assert_eq!(inbox.recv().await.unwrap(), vec![0x02]);
    }

    #[tokio::test]
    async fn test_drop_link_closes_queue() {
        let mock = MockTransport::new(512);
        let mut inbox = mock.subscribe(OTA_CONTROL_UUID).await.unwrap();
        mock.drop_link();
        assert_eq!(inbox.recv().await, None);
    }

    #[tokio::test]
    async fn test_injected_data_faults() {
        let mock = MockTransport::new(512);
        mock.fail_data_writes_from(1, 2);

        assert!(mock.write_attribute(OTA_DATA_UUID, b"a", true).await.is_ok());
        assert!(mock.write_attribute(OTA_DATA_UUID, b"b", true).await.is_err());
        assert!(mock.write_attribute(OTA_DATA_UUID, b"b", true).await.is_err());
        assert!(mock.write_attribute(OTA_DATA_UUID, b"b", true).await.is_ok());
        assert_eq!(mock.data_writes().len(), 2);
    }
}
