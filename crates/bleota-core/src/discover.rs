//! Peripheral discovery and selection.
//!
//! Hands the session a single resolved peripheral; the transfer engine
//! itself never scans.

use std::io::Write as _;
use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::protocol::constants::{OTA_SERVICE_UUID, TARGET_DEVICE_NAMES};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    #[error(
        "No device advertising the OTA service found after {attempts} scans. \
         Ensure it is powered and advertising."
    )]
    NothingFound { attempts: u32 },

    #[error("No named BLE devices found. Make sure the target is advertising with a name.")]
    NoNamedDevices,

    #[error("Selection cancelled by user")]
    SelectionCancelled,

    #[error("Invalid selection: {0}")]
    SelectionInvalid(String),

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Get the first Bluetooth adapter.
pub async fn default_adapter() -> Result<Adapter, DiscoveryError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(DiscoveryError::NoAdapter)
}

async fn scan(adapter: &Adapter, duration: Duration) -> Result<Vec<Peripheral>, DiscoveryError> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;
    let peripherals = adapter.peripherals().await?;
    adapter.stop_scan().await?;
    Ok(peripherals)
}

/// Scan for a peripheral advertising the OTA service or one of the
/// accepted device names, retrying with linear backoff between
/// attempts.
pub async fn discover_target(
    adapter: &Adapter,
    retries: u32,
    scan_timeout: Duration,
) -> Result<Peripheral, DiscoveryError> {
    info!("Searching for a peripheral advertising the OTA service...");

    for attempt in 1..=retries.max(1) {
        for peripheral in scan(adapter, scan_timeout).await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            let name = props.local_name.unwrap_or_default();
            debug!(name = %name, address = %peripheral.address(), "Scanned");

            let name_match = TARGET_DEVICE_NAMES.contains(&name.to_lowercase().as_str());
            let service_match = props.services.contains(&OTA_SERVICE_UUID);
            if name_match || service_match {
                info!(name = %name, address = %peripheral.address(), "Found target");
                return Ok(peripheral);
            }
        }

        if attempt < retries {
            // Linear backoff: wait `attempt` seconds before rescanning.
            let backoff = Duration::from_secs(attempt.into());
            info!(attempt, retries, backoff_secs = backoff.as_secs(), "No target yet, retrying");
            tokio::time::sleep(backoff).await;
        }
    }

    Err(DiscoveryError::NothingFound {
        attempts: retries.max(1),
    })
}

/// List named peripherals and let the operator pick one on stdin.
pub async fn choose_device(
    adapter: &Adapter,
    scan_timeout: Duration,
) -> Result<Peripheral, DiscoveryError> {
    println!("Scanning devices for {}s...", scan_timeout.as_secs());

    let mut named = Vec::new();
    for peripheral in scan(adapter, scan_timeout).await? {
        if let Some(props) = peripheral.properties().await?
            && let Some(name) = props.local_name
        {
            named.push((name, props.services, peripheral));
        }
    }
    if named.is_empty() {
        return Err(DiscoveryError::NoNamedDevices);
    }

    for (idx, (name, services, peripheral)) in named.iter().enumerate() {
        println!(
            "[{}] {} | {} | services={:?}",
            idx + 1,
            name,
            peripheral.address(),
            services
        );
    }

    print!("Select device number (or press Enter to cancel): ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;

    let index = parse_selection(&line, named.len())?;
    let (name, _, peripheral) = named.swap_remove(index - 1);
    info!(name = %name, address = %peripheral.address(), "Selected");
    Ok(peripheral)
}

/// Validate a 1-based selection typed by the operator.
fn parse_selection(input: &str, count: usize) -> Result<usize, DiscoveryError> {
    let choice = input.trim();
    if choice.is_empty() {
        return Err(DiscoveryError::SelectionCancelled);
    }
    let index: usize = choice
        .parse()
        .map_err(|_| DiscoveryError::SelectionInvalid(format!("'{choice}' is not a number")))?;
    if index < 1 || index > count {
        return Err(DiscoveryError::SelectionInvalid(format!(
            "{index} is out of range 1..={count}"
        )));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_valid() {
        assert_eq!(parse_selection("2\n", 3).unwrap(), 2);
        assert_eq!(parse_selection("  1  ", 1).unwrap(), 1);
    }

    #[test]
    fn test_selection_cancelled_on_empty_input() {
        assert!(matches!(
            parse_selection("\n", 3),
            Err(DiscoveryError::SelectionCancelled)
        ));
        assert!(matches!(
            parse_selection("", 3),
            Err(DiscoveryError::SelectionCancelled)
        ));
    }

    #[test]
    fn test_selection_rejects_non_numeric() {
        assert!(matches!(
            parse_selection("abc\n", 3),
            Err(DiscoveryError::SelectionInvalid(_))
        ));
    }

    #[test]
    fn test_selection_rejects_out_of_range() {
        assert!(matches!(
            parse_selection("0\n", 3),
            Err(DiscoveryError::SelectionInvalid(_))
        ));
        assert!(matches!(
            parse_selection("4\n", 3),
            Err(DiscoveryError::SelectionInvalid(_))
        ));
    }
}
