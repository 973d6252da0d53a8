//! Handshake protocol constants and characteristic codecs

use uuid::Uuid;

// ----------------------------------------------------------------------------
// Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Namespace service advertised by every participant
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xE0C3793A_0739_42A2_A800_8BED236D8815);

/// Characteristic carrying the peer identity as UTF-8
pub const IDENTITY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xA33AD1C8_2533_4FCC_B4F6_4465986E2243);

/// Characteristic carrying the data channel PSM, 2 bytes big-endian
pub const PORT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xABDD3056_28FA_441D_A470_55A75A52553A);

/// Characteristic carrying opaque metadata
pub const METADATA_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x936D7669_E532_42BF_8B8D_97E3C1073F74);

/// Characteristics read during the handshake, in read order
pub const REQUIRED_CHARACTERISTICS: [Uuid; 3] = [
    IDENTITY_CHARACTERISTIC_UUID,
    PORT_CHARACTERISTIC_UUID,
    METADATA_CHARACTERISTIC_UUID,
];

/// Short name used in log lines
pub fn characteristic_name(uuid: &Uuid) -> Option<&'static str> {
    match *uuid {
        IDENTITY_CHARACTERISTIC_UUID => Some("identity"),
        PORT_CHARACTERISTIC_UUID => Some("port"),
        METADATA_CHARACTERISTIC_UUID => Some("metadata"),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// Characteristic Codecs
// ----------------------------------------------------------------------------

/// Encode a channel port as 2 bytes, big-endian
pub fn encode_port(port: u16) -> [u8; 2] {
    port.to_be_bytes()
}

/// Decode a channel port; anything but exactly 2 bytes has no value
pub fn decode_port(bytes: &[u8]) -> Option<u16> {
    let raw: [u8; 2] = bytes.try_into().ok()?;
    Some(u16::from_be_bytes(raw))
}

/// Decode an identity value
///
/// Identities are strict UTF-8 and never empty.
pub fn decode_identity(bytes: &[u8]) -> Option<String> {
    match std::str::from_utf8(bytes) {
        Ok(identity) if !identity.is_empty() => Some(identity.to_string()),
        _ => None,
    }
}
