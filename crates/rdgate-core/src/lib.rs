//! rdgate-core: shared protocol library for the remote-desktop gateway.
//!
//! Provides the length-prefixed instruction framer, the encrypted connection
//! token codec, connection descriptors with the settings merge, and the
//! gateway error taxonomy.

pub mod error;
pub mod instruction;
pub mod settings;
pub mod token;

// Re-export commonly used items at crate root.
pub use error::{GatewayError, GatewayResult, Leg};
pub use instruction::{Instruction, InstructionParser};
pub use settings::{ConnectionDescriptor, ProtocolTable, SettingValue, Settings};
pub use token::{Cipher, TokenCodec};
