//! Cycling Speed and Cadence GATT identifiers
//!
//! UUID constants for the CSC profile and helpers to accept both the full
//! 128-bit form and the 16/32-bit short forms of Bluetooth SIG UUIDs.

use anyhow::Result;
use uuid::Uuid;

/// Cycling Speed and Cadence service (0x1816)
pub const CSC_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001816_0000_1000_8000_00805f9b34fb);

/// CSC Measurement characteristic (0x2A5B), notify only
pub const CSC_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x00002a5b_0000_1000_8000_00805f9b34fb);

/// Bluetooth SIG base UUID: 0000xxxx-0000-1000-8000-00805f9b34fb
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BASE_MASK: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;

/// Expand a 16-bit SIG-assigned number into a full UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Parse a UUID string in full, 16-bit (`2a5b`) or 32-bit (`00002a5b`) form.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    let value = uuid_str.trim().to_ascii_lowercase();
    let value = value.strip_prefix("0x").unwrap_or(&value);

    match value.len() {
        4 => Ok(uuid_from_u16(u16::from_str_radix(value, 16)?)),
        8 => {
            let short = u32::from_str_radix(value, 16)?;
            Ok(Uuid::from_u128(BASE_UUID | (u128::from(short) << 96)))
        }
        _ => Ok(Uuid::parse_str(value)?),
    }
}

/// The 16-bit short form when `uuid` is built on the SIG base UUID.
pub fn short_form(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & BASE_MASK != BASE_UUID {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Render a UUID the way diagnostics print it: short form when possible.
pub fn describe_uuid(uuid: &Uuid) -> String {
    match short_form(uuid) {
        Some(short) => format!("{:04x}", short),
        None => uuid.to_string(),
    }
}
