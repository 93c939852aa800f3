//! Wire format and schema validation for control-plane messages.
//!
//! Split into sub-modules:
//! - `protocol_types`: message types, error codes
//! - `protocol_codec`: encode/decode and framing

pub use super::protocol_codec::*;
pub use super::protocol_types::*;

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
