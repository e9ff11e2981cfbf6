//! Event system for UI decoupling.
//!
//! Allows a CLI or GUI front-end to follow a transfer without tight
//! coupling to the engine.

use crate::session::TransferState;

/// Events emitted during an OTA session.
#[derive(Debug, Clone)]
pub enum OtaEvent {
    /// Connected to the peripheral.
    DeviceConnected { address: String },
    /// Engine state changed.
    PhaseChanged {
        from: TransferState,
        to: TransferState,
    },
    /// Packet size fixed for the session.
    PacketSizeNegotiated { size: usize },
    /// Streaming progress.
    Progress {
        sent_packets: usize,
        total_packets: usize,
        sent_bytes: usize,
        total_bytes: usize,
    },
    /// Transfer finished successfully.
    Complete,
}

/// Observer trait for receiving OTA session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait OtaObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &OtaEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl OtaObserver for NullObserver {
    fn on_event(&self, _event: &OtaEvent) {
        // Do nothing
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl OtaObserver for TracingObserver {
    fn on_event(&self, event: &OtaEvent) {
        match event {
            OtaEvent::DeviceConnected { address } => {
                tracing::info!(address = %address, "Connected");
            }
            OtaEvent::PhaseChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Phase changed");
            }
            OtaEvent::PacketSizeNegotiated { size } => {
                tracing::info!(size, "Using packet size");
            }
            OtaEvent::Progress {
                sent_packets,
                total_packets,
                sent_bytes,
                total_bytes,
            } => {
                let percent = if *total_packets > 0 {
                    (*sent_packets as f64 / *total_packets as f64) * 100.0
                } else {
                    0.0
                };
                tracing::info!(
                    packets = %format!("{sent_packets}/{total_packets}"),
                    bytes = %format!("{sent_bytes}/{total_bytes}"),
                    percent = %format!("{percent:.1}"),
                    "Progress"
                );
            }
            OtaEvent::Complete => {
                tracing::info!("OTA transfer complete");
            }
        }
    }
}
