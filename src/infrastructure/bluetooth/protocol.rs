//! GATT Protocol Constants
//!
//! Well-known identifiers used by the sensor node and helpers for
//! handling its raw payloads.

use anyhow::Result;
use uuid::Uuid;

/// Client Characteristic Configuration Descriptor (Bluetooth SIG 0x2902)
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Primary data characteristic exposed by the sensor node
pub const TARGET_CHAR_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef1);

/// CCCD value enabling notifications (little-endian 0x0001)
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value disabling notifications and indications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Parse a UUID string, accepting the hyphenated and the simple 32-digit forms
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format '{}': {}", uuid_str, e))
}

/// Decode a payload as text, replacing invalid UTF-8 sequences
pub fn decode_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}
