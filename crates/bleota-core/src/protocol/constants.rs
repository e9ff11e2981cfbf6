//! OTA protocol constants.
//!
//! UUIDs and control values mirror the peripheral's NimBLE GATT table.

use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// GATT Identifiers
// ============================================================================

/// OTA service advertised by the peripheral.
pub const OTA_SERVICE_UUID: Uuid = Uuid::from_u128(0xf505f04b_2066_5069_8775_830fcfc57339);

/// Control characteristic: opcodes out, acknowledgments back via notification.
pub const OTA_CONTROL_UUID: Uuid = Uuid::from_u128(0x834bb43d_8419_5109_b6a4_a0da03786bc6);

/// Data characteristic: packet-size announcement, then firmware packets.
pub const OTA_DATA_UUID: Uuid = Uuid::from_u128(0xbdda975f_9e48_5c04_b67e_f017f019b150);

/// Advertised names accepted by auto-discovery (compared lowercase).
pub const TARGET_DEVICE_NAMES: &[&str] = &["esp32", "mkey"];

// ============================================================================
// Link & Sizing
// ============================================================================

/// ATT write header overhead subtracted from the MTU when sizing packets.
pub const ATT_WRITE_OVERHEAD: usize = 3;

/// Safety cap on the negotiated packet payload.
pub const MAX_PAYLOAD_DEFAULT: usize = 512;

/// Assumed ATT MTU when the platform stack does not expose the
/// negotiated value. Matches the peripheral's preferred MTU.
pub const LINK_MTU_DEFAULT: usize = 512;

/// Fixed packet size used by dry runs; no negotiation happens there.
pub const DRY_RUN_PACKET_SIZE: usize = 180;

/// Progress is reported every this many packets, and on the last one.
pub const PROGRESS_STRIDE: usize = 20;

// ============================================================================
// Timeouts & Retries
// ============================================================================

/// Scan timeout per discovery attempt.
pub const SCAN_TIMEOUT_SECS: u64 = 5;

/// Discovery attempts before giving up.
pub const SCAN_RETRIES: u32 = 3;

/// Connection establishment timeout.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Timeout waiting for a control acknowledgment.
pub const ACK_TIMEOUT_SECS: u64 = 5;

/// Attempts per packet write.
pub const PKT_WRITE_RETRIES: u32 = 3;

/// Fixed delay between packet write attempts.
pub const PKT_RETRY_DELAY: Duration = Duration::from_millis(100);
