//! OTA session - the transfer protocol state machine.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::control::{ControlChannel, ControlError};
use crate::discover::{self, DiscoveryError};
use crate::events::{OtaEvent, OtaObserver, TracingObserver};
use crate::packet::{self, FirmwareImage, PacketError};
use crate::protocol::constants::{
    ACK_TIMEOUT_SECS, ATT_WRITE_OVERHEAD, CONNECT_TIMEOUT_SECS, LINK_MTU_DEFAULT,
    MAX_PAYLOAD_DEFAULT, OTA_CONTROL_UUID, OTA_DATA_UUID, PKT_RETRY_DELAY, PKT_WRITE_RETRIES,
    PROGRESS_STRIDE, SCAN_RETRIES, SCAN_TIMEOUT_SECS,
};
use crate::protocol::opcode::{ControlOpcode, ControlResponse};
use crate::retry::RetryPolicy;
use crate::transport::{BtleTransport, OtaTransport, TransportError};

/// Configuration for an OTA session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Firmware binary path.
    pub firmware_path: String,
    /// Scan timeout per discovery attempt, seconds.
    pub scan_timeout_secs: u64,
    /// Discovery attempts before giving up.
    pub scan_retries: u32,
    /// Connection establishment timeout, seconds.
    pub connect_timeout_secs: u64,
    /// Timeout for control acknowledgments, seconds.
    pub ack_timeout_secs: u64,
    /// Attempts per packet write.
    pub packet_write_retries: u32,
    /// Delay between packet write attempts, milliseconds.
    pub packet_retry_delay_ms: u64,
    /// Safety cap on the negotiated packet payload, bytes.
    pub max_payload: usize,
    /// Assumed ATT MTU of the connection, bytes.
    pub link_mtu: usize,
    /// Pick the target by advertised name/service instead of prompting.
    pub auto_select: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            firmware_path: "ota-ble.bin".to_string(),
            scan_timeout_secs: SCAN_TIMEOUT_SECS,
            scan_retries: SCAN_RETRIES,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            ack_timeout_secs: ACK_TIMEOUT_SECS,
            packet_write_retries: PKT_WRITE_RETRIES,
            packet_retry_delay_ms: PKT_RETRY_DELAY.as_millis() as u64,
            max_payload: MAX_PAYLOAD_DEFAULT,
            link_mtu: LINK_MTU_DEFAULT,
            auto_select: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Transfer engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    Idle,
    Negotiating,
    Requesting,
    WaitingRequestAck,
    Streaming,
    Completing,
    WaitingDoneAck,
    Succeeded,
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Idle => write!(f, "IDLE"),
            TransferState::Negotiating => write!(f, "NEGOTIATING"),
            TransferState::Requesting => write!(f, "REQUESTING"),
            TransferState::WaitingRequestAck => write!(f, "WAITING_REQUEST_ACK"),
            TransferState::Streaming => write!(f, "STREAMING"),
            TransferState::Completing => write!(f, "COMPLETING"),
            TransferState::WaitingDoneAck => write!(f, "WAITING_DONE_ACK"),
            TransferState::Succeeded => write!(f, "SUCCEEDED"),
            TransferState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Errors that abort an OTA session.
#[derive(Error, Debug)]
pub enum OtaError {
    #[error("Computed packet size invalid (<=0) for link capacity {capacity}. Check MTU.")]
    Negotiation { capacity: usize },

    #[error("OTA request not acknowledged (got {response})")]
    RequestRejected { response: ControlResponse },

    #[error("OTA done not acknowledged (got {response})")]
    DoneRejected { response: ControlResponse },

    #[error("Packet {index}/{total} failed: {source}")]
    PacketWriteFailed {
        index: usize,
        total: usize,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// OTA session - owns one connection and drives the transfer on it.
pub struct OtaSession<O: OtaObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    state: TransferState,
}

impl OtaSession<TracingObserver> {
    /// Create a new session with the default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: OtaObserver> OtaSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            state: TransferState::Idle,
        }
    }

    /// Current engine state.
    pub fn state(&self) -> TransferState {
        self.state
    }

    fn goto_state(&mut self, to: TransferState) {
        debug!(from = %self.state, to = %to, "State transition");
        self.observer.on_event(&OtaEvent::PhaseChanged {
            from: self.state,
            to,
        });
        self.state = to;
    }

    /// Run the complete session: load the image, resolve a target,
    /// connect, and transfer.
    #[instrument(skip(self))]
    pub async fn run(&mut self) -> Result<(), OtaError> {
        let started = Instant::now();

        let image = FirmwareImage::load(&self.config.firmware_path)?;
        info!(
            path = %self.config.firmware_path,
            bytes = image.len(),
            "Loaded firmware image"
        );

        let adapter = discover::default_adapter().await?;
        let scan_timeout = Duration::from_secs(self.config.scan_timeout_secs);
        let target = if self.config.auto_select {
            discover::discover_target(&adapter, self.config.scan_retries, scan_timeout).await?
        } else {
            discover::choose_device(&adapter, scan_timeout).await?
        };

        let transport = BtleTransport::connect(
            target,
            Duration::from_secs(self.config.connect_timeout_secs),
            self.config.link_mtu,
        )
        .await?;
        self.observer.on_event(&OtaEvent::DeviceConnected {
            address: transport.address(),
        });

        self.run_transfer(&transport, &image).await?;
        info!(elapsed = ?started.elapsed(), "OTA successful");
        Ok(())
    }

    /// Drive the transfer over an established transport.
    ///
    /// The connection is torn down on every exit path: unsubscribe is
    /// best-effort, disconnect is attempted unconditionally.
    pub async fn run_transfer<T: OtaTransport>(
        &mut self,
        transport: &T,
        image: &FirmwareImage,
    ) -> Result<(), OtaError> {
        let result = self.drive(transport, image).await;

        if let Err(e) = transport.unsubscribe(OTA_CONTROL_UUID).await {
            debug!(error = %e, "Unsubscribe failed during teardown");
        }
        if let Err(e) = transport.disconnect().await {
            warn!(error = %e, "Disconnect failed during teardown");
        }
        info!("Disconnected");

        match result {
            Ok(()) => {
                self.goto_state(TransferState::Succeeded);
                self.observer.on_event(&OtaEvent::Complete);
                Ok(())
            }
            Err(e) => {
                self.goto_state(TransferState::Failed);
                Err(e)
            }
        }
    }

    async fn drive<T: OtaTransport>(
        &mut self,
        transport: &T,
        image: &FirmwareImage,
    ) -> Result<(), OtaError> {
        let ack_timeout = Duration::from_secs(self.config.ack_timeout_secs);
        let mut control = ControlChannel::open(transport, ack_timeout)
            .await
            .map_err(OtaError::Transport)?;

        self.goto_state(TransferState::Negotiating);
        let capacity = transport.link_capacity();
        let packet_size = capacity
            .saturating_sub(ATT_WRITE_OVERHEAD)
            .min(self.config.max_payload)
            .min(u16::MAX as usize); // announced as a 2-byte field
        if packet_size == 0 {
            return Err(OtaError::Negotiation { capacity });
        }
        info!(packet_size, capacity, "Negotiated packet size");
        self.observer
            .on_event(&OtaEvent::PacketSizeNegotiated { size: packet_size });

        // One-time out-of-band announcement, distinct from firmware
        // packets: 2 bytes little-endian on the data characteristic.
        transport
            .write_attribute(OTA_DATA_UUID, &(packet_size as u16).to_le_bytes(), true)
            .await?;

        let packets = packet::chunk(image.as_bytes(), packet_size)?;
        info!(packets = packets.len(), "Prepared packets");

        self.goto_state(TransferState::Requesting);
        control
            .send(ControlOpcode::Request)
            .await
            .map_err(OtaError::Transport)?;
        self.goto_state(TransferState::WaitingRequestAck);
        let response = ControlResponse::parse(&control.await_response("OTA request").await?);
        if !response.is(ControlOpcode::RequestAck) {
            return Err(OtaError::RequestRejected { response });
        }

        self.goto_state(TransferState::Streaming);
        self.stream_packets(transport, &packets, image.len()).await?;

        self.goto_state(TransferState::Completing);
        control
            .send(ControlOpcode::Done)
            .await
            .map_err(OtaError::Transport)?;
        self.goto_state(TransferState::WaitingDoneAck);
        match control.await_response("OTA done").await {
            Ok(buf) => {
                let response = ControlResponse::parse(&buf);
                if !response.is(ControlOpcode::DoneAck) {
                    return Err(OtaError::DoneRejected { response });
                }
            }
            // The peripheral reboots into the new image right after
            // acknowledging DONE; a link dropped during this one wait
            // is the expected outcome, not a failure.
            Err(ControlError::Transport(TransportError::LinkDropped)) => {
                info!("Link dropped while awaiting DONE ack; peripheral is rebooting");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    /// Stream packets in strict index order; each write is retried per
    /// the retry policy, and the first exhausted packet aborts the
    /// session.
    async fn stream_packets<T: OtaTransport>(
        &mut self,
        transport: &T,
        packets: &[&[u8]],
        total_bytes: usize,
    ) -> Result<(), OtaError> {
        let retry = RetryPolicy::new(
            self.config.packet_write_retries,
            Duration::from_millis(self.config.packet_retry_delay_ms),
        );
        let total = packets.len();
        let mut sent_bytes = 0usize;

        for (i, payload) in packets.iter().copied().enumerate() {
            let index = i + 1;
            retry
                .run(&format!("Packet {index}/{total} write"), || {
                    transport.write_attribute(OTA_DATA_UUID, payload, true)
                })
                .await
                .map_err(|source| OtaError::PacketWriteFailed {
                    index,
                    total,
                    source,
                })?;

            sent_bytes += payload.len();
            if index % PROGRESS_STRIDE == 0 || index == total {
                self.observer.on_event(&OtaEvent::Progress {
                    sent_packets: index,
                    total_packets: total,
                    sent_bytes,
                    total_bytes,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::transport::{ControlReply, MockTransport};
    use std::sync::Mutex;

    const REQUEST_ACK: &[u8] = &[0x02];
    const REQUEST_NAK: &[u8] = &[0x03];
    const DONE_ACK: &[u8] = &[0x05];
    const DONE_NAK: &[u8] = &[0x06];

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<OtaEvent>>,
    }

    impl OtaObserver for RecordingObserver {
        fn on_event(&self, event: &OtaEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            packet_retry_delay_ms: 0,
            ..Default::default()
        }
    }

    fn session() -> OtaSession<NullObserver> {
        OtaSession::with_observer(test_config(), Arc::new(NullObserver))
    }

    fn image(len: usize) -> FirmwareImage {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        FirmwareImage::from_bytes(data).unwrap()
    }

    fn happy_mock(capacity: usize) -> MockTransport {
        let mock = MockTransport::new(capacity);
        mock.queue_response(REQUEST_ACK);
        mock.queue_response(DONE_ACK);
        mock
    }

    #[tokio::test]
    async fn test_end_to_end_six_packets() {
        // 1000 bytes at capacity 183 -> payload 180 -> 5x180 + 1x100.
        let mock = happy_mock(183);
        let observer = Arc::new(RecordingObserver::default());
        let mut session = OtaSession::with_observer(test_config(), observer.clone());
        let image = image(1000);

        session.run_transfer(&mock, &image).await.unwrap();
        assert_eq!(session.state(), TransferState::Succeeded);

        let data = mock.data_writes();
        assert_eq!(data.len(), 7); // announcement + 6 packets
        assert_eq!(data[0], 180u16.to_le_bytes());
        for packet in &data[1..6] {
            assert_eq!(packet.len(), 180);
        }
        assert_eq!(data[6].len(), 100);

        assert_eq!(mock.control_writes(), vec![vec![0x01], vec![0x04]]);

        // 6 < 20, so progress fires once, at the final packet.
        let events = observer.events.lock().unwrap();
        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                OtaEvent::Progress {
                    sent_packets,
                    total_packets,
                    sent_bytes,
                    total_bytes,
                } => Some((*sent_packets, *total_packets, *sent_bytes, *total_bytes)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(6, 6, 1000, 1000)]);
    }

    #[tokio::test]
    async fn test_packets_cover_image_in_order() {
        let mock = happy_mock(103); // payload 100
        let mut session = session();
        let image = image(1000);

        session.run_transfer(&mock, &image).await.unwrap();

        let data = mock.data_writes();
        let rebuilt: Vec<u8> = data[1..].concat();
        assert_eq!(rebuilt, image.as_bytes());
        for (i, packet) in data[1..].iter().enumerate() {
            assert_eq!(packet.as_slice(), &image.as_bytes()[i * 100..(i + 1) * 100]);
        }
    }

    #[tokio::test]
    async fn test_progress_every_twentieth_packet() {
        let mock = happy_mock(13); // payload 10
        let observer = Arc::new(RecordingObserver::default());
        let mut session = OtaSession::with_observer(test_config(), observer.clone());
        let image = image(450); // 45 packets

        session.run_transfer(&mock, &image).await.unwrap();

        let events = observer.events.lock().unwrap();
        let reported: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                OtaEvent::Progress { sent_packets, .. } => Some(*sent_packets),
                _ => None,
            })
            .collect();
        assert_eq!(reported, vec![20, 40, 45]);
    }

    #[tokio::test]
    async fn test_negotiation_respects_mtu_and_cap() {
        // min(23 - 3, 512) = 20.
        let mock = happy_mock(23);
        let mut session = session();

        session.run_transfer(&mock, &image(100)).await.unwrap();

        let data = mock.data_writes();
        assert_eq!(data[0], 20u16.to_le_bytes());
        assert!(data[1..].iter().all(|p| p.len() <= 20));
    }

    #[tokio::test]
    async fn test_negotiation_respects_payload_cap() {
        // Large MTU is capped by max_payload.
        let mock = happy_mock(4096);
        let mut session = session();

        session.run_transfer(&mock, &image(100)).await.unwrap();
        assert_eq!(mock.data_writes()[0], 512u16.to_le_bytes());
    }

    #[tokio::test]
    async fn test_capacity_too_small_fails_before_any_write() {
        let mock = MockTransport::new(3);
        let mut session = session();

        let err = session.run_transfer(&mock, &image(100)).await.unwrap_err();
        assert!(matches!(err, OtaError::Negotiation { capacity: 3 }));
        assert!(mock.writes().is_empty());
        assert_eq!(session.state(), TransferState::Failed);
    }

    #[tokio::test]
    async fn test_request_nak_aborts_before_streaming() {
        let mock = MockTransport::new(183);
        mock.queue_response(REQUEST_NAK);
        let mut session = session();

        let err = session.run_transfer(&mock, &image(1000)).await.unwrap_err();
        match err {
            OtaError::RequestRejected { response } => {
                assert!(response.is(ControlOpcode::RequestNak))
            }
            other => panic!("unexpected error: {other}"),
        }
        // Announcement only; no firmware packet was written.
        assert_eq!(mock.data_writes().len(), 1);
        assert_eq!(session.state(), TransferState::Failed);
    }

    #[tokio::test]
    async fn test_unrecognized_request_response_aborts() {
        let mock = MockTransport::new(183);
        mock.queue_response(&[0x42]);
        let mut session = session();

        let err = session.run_transfer(&mock, &image(1000)).await.unwrap_err();
        match err {
            OtaError::RequestRejected { response } => {
                assert_eq!(response, ControlResponse::Unrecognized(0x42))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.data_writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_ack_timeout() {
        let mock = MockTransport::new(183);
        mock.queue_reply(ControlReply::Silent);
        let mut session = session();

        let err = session.run_transfer(&mock, &image(1000)).await.unwrap_err();
        assert!(matches!(
            err,
            OtaError::Control(ControlError::AckTimeout {
                label: "OTA request"
            })
        ));
        assert_eq!(session.state(), TransferState::Failed);
    }

    #[tokio::test]
    async fn test_packet_write_failure_exhausts_retries() {
        let mock = MockTransport::new(103); // payload 100, 10 packets
        mock.queue_response(REQUEST_ACK);
        // Announcement is data attempt 0; packet 3's attempts are 3..6.
        mock.fail_data_writes_from(3, 3);
        let mut session = session();

        let err = session.run_transfer(&mock, &image(1000)).await.unwrap_err();
        match err {
            OtaError::PacketWriteFailed { index, total, .. } => {
                assert_eq!(index, 3);
                assert_eq!(total, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Announcement + packets 1 and 2; nothing after the failure.
        assert_eq!(mock.data_writes().len(), 3);
        // DONE was never sent.
        assert_eq!(mock.control_writes(), vec![vec![0x01]]);
        assert_eq!(session.state(), TransferState::Failed);
    }

    #[tokio::test]
    async fn test_transient_packet_failure_recovers() {
        let mock = happy_mock(103);
        // Packet 1 fails twice, succeeds on the third attempt.
        mock.fail_data_writes_from(1, 2);
        let mut session = session();

        session.run_transfer(&mock, &image(1000)).await.unwrap();
        assert_eq!(session.state(), TransferState::Succeeded);
        assert_eq!(mock.data_writes().len(), 11); // announcement + 10 packets
    }

    #[tokio::test]
    async fn test_done_nak_fails() {
        let mock = MockTransport::new(183);
        mock.queue_response(REQUEST_ACK);
        mock.queue_response(DONE_NAK);
        let mut session = session();

        let err = session.run_transfer(&mock, &image(1000)).await.unwrap_err();
        match err {
            OtaError::DoneRejected { response } => assert!(response.is(ControlOpcode::DoneNak)),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.state(), TransferState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_ack_timeout_fails() {
        let mock = MockTransport::new(183);
        mock.queue_response(REQUEST_ACK);
        mock.queue_reply(ControlReply::Silent);
        let mut session = session();

        let err = session.run_transfer(&mock, &image(1000)).await.unwrap_err();
        assert!(matches!(
            err,
            OtaError::Control(ControlError::AckTimeout { label: "OTA done" })
        ));
        assert_eq!(session.state(), TransferState::Failed);
    }

    #[tokio::test]
    async fn test_link_drop_during_done_wait_is_success() {
        let mock = MockTransport::new(183);
        mock.queue_response(REQUEST_ACK);
        mock.queue_reply(ControlReply::DropLink);
        let mut session = session();

        session.run_transfer(&mock, &image(1000)).await.unwrap();
        assert_eq!(session.state(), TransferState::Succeeded);
    }

    #[tokio::test]
    async fn test_link_drop_during_request_wait_fails() {
        let mock = MockTransport::new(183);
        mock.queue_reply(ControlReply::DropLink);
        let mut session = session();

        let err = session.run_transfer(&mock, &image(1000)).await.unwrap_err();
        assert!(matches!(
            err,
            OtaError::Control(ControlError::Transport(TransportError::LinkDropped))
        ));
        assert_eq!(session.state(), TransferState::Failed);
    }

    #[tokio::test]
    async fn test_teardown_runs_on_success() {
        let mock = happy_mock(183);
        let mut session = session();

        session.run_transfer(&mock, &image(1000)).await.unwrap();
        assert!(mock.was_unsubscribed());
        assert!(mock.was_disconnected());
    }

    #[tokio::test]
    async fn test_teardown_runs_on_failure() {
        let mock = MockTransport::new(183);
        mock.queue_response(REQUEST_NAK);
        let mut session = session();

        session.run_transfer(&mock, &image(1000)).await.unwrap_err();
        assert!(mock.was_unsubscribed());
        assert!(mock.was_disconnected());
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.scan_timeout_secs, 5);
        assert_eq!(config.scan_retries, 3);
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.ack_timeout_secs, 5);
        assert_eq!(config.packet_write_retries, 3);
        assert_eq!(config.packet_retry_delay_ms, 100);
        assert_eq!(config.max_payload, 512);
    }

    #[test]
    fn test_config_toml_round_trip() {
        let config = SessionConfig {
            firmware_path: "fw.bin".to_string(),
            auto_select: true,
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: SessionConfig = toml::from_str("max_payload = 244\n").unwrap();
        assert_eq!(parsed.max_payload, 244);
        assert_eq!(parsed.scan_retries, 3);
    }
}
