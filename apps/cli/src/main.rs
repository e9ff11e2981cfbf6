use clap::Parser;

use bleota_core::packet::{self, FirmwareImage};
use bleota_core::protocol::constants::DRY_RUN_PACKET_SIZE;
use bleota_core::session::{OtaSession, SessionConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "ESP32 OTA update over BLE", long_about = None)]
struct Args {
    /// Firmware binary path
    #[arg(short, long)]
    file: Option<String>,

    /// Read and chunk the firmware without any BLE action
    #[arg(long)]
    dry_run: bool,

    /// Optional TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Scan timeout per attempt (s)
    #[arg(long)]
    scan_timeout: Option<u64>,

    /// Scan retries
    #[arg(long)]
    scan_retries: Option<u32>,

    /// Auto-select device by name/service UUID without prompting
    #[arg(long)]
    auto: bool,

    /// Max payload per packet (bytes)
    #[arg(long)]
    max_payload: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args).await {
        error!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(file) = args.file {
        config.firmware_path = file;
    }
    if let Some(timeout) = args.scan_timeout {
        config.scan_timeout_secs = timeout;
    }
    if let Some(retries) = args.scan_retries {
        config.scan_retries = retries;
    }
    if let Some(max_payload) = args.max_payload {
        config.max_payload = max_payload;
    }
    if args.auto {
        config.auto_select = true;
    }

    if args.dry_run {
        let image = FirmwareImage::load(&config.firmware_path)?;
        let packets = packet::chunk(image.as_bytes(), DRY_RUN_PACKET_SIZE)?;
        info!(
            packets = packets.len(),
            packet_size = DRY_RUN_PACKET_SIZE,
            "Dry run, nothing sent"
        );
        println!(
            "[dry-run] Would send {} packets of size <= {} bytes.",
            packets.len(),
            DRY_RUN_PACKET_SIZE
        );
        return Ok(());
    }

    let mut session = OtaSession::new(config);
    session.run().await?;
    Ok(())
}
