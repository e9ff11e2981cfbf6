//! Protocol module - OTA protocol definitions.

pub mod constants;
pub mod opcode;

pub use constants::*;
pub use opcode::{ControlOpcode, ControlResponse};
