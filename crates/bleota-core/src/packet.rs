//! Firmware image loading and packetization.

use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Packet size must be > 0")]
    InvalidPacketSize,

    #[error("Firmware image is empty")]
    EmptyImage,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Firmware image, read once at session start and immutable afterward.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Read an image from disk. Empty files are rejected.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PacketError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(data)
    }

    /// Wrap raw bytes. Empty images are rejected.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, PacketError> {
        if data.is_empty() {
            return Err(PacketError::EmptyImage);
        }
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Split an image into packets of at most `size` bytes.
///
/// Packet `i` covers bytes `[i * size, min((i + 1) * size, len))`;
/// only the final packet may be short. Packets are never reordered or
/// split further.
pub fn chunk(image: &[u8], size: usize) -> Result<Vec<&[u8]>, PacketError> {
    if size == 0 {
        return Err(PacketError::InvalidPacketSize);
    }
    let packets: Vec<&[u8]> = image.chunks(size).collect();
    if packets.is_empty() {
        return Err(PacketError::EmptyImage);
    }
    Ok(packets)
}
