use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::BtError;

/// Bytes an address occupies in a command frame (six plus a pad byte).
pub const ADDRESS_LEN: usize = 7;

/// Bytes a friendly name occupies in a command frame.
pub const NAME_LEN: usize = 16;

/// A 48-bit Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BtAddress(pub [u8; 6]);

impl BtAddress {
    /// The address as carried in command parameters.
    pub fn to_wire(self) -> [u8; ADDRESS_LEN] {
        let mut wire = [0u8; ADDRESS_LEN];
        wire[..6].copy_from_slice(&self.0);
        wire
    }

    /// Read an address from the start of `params`, padding short input.
    pub fn from_wire(params: &[u8]) -> Self {
        let mut addr = [0u8; 6];
        let n = params.len().min(6);
        addr[..n].copy_from_slice(&params[..n]);
        Self(addr)
    }

    /// True for text that parses as an address rather than a device name.
    pub fn is_address(text: &str) -> bool {
        text.parse::<Self>().is_ok()
    }
}

impl FromStr for BtAddress {
    type Err = BtError;

    /// Accepts twelve hex digits, optionally separated by `:` or `-`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BtError::InvalidAddress(s.to_string());
        let mut digits = Vec::with_capacity(12);
        for c in s.chars().filter(|c| *c != ':' && *c != '-') {
            let digit = c.to_digit(16).ok_or_else(invalid)?;
            digits.push(digit as u8);
        }
        if digits.len() != 12 {
            return Err(invalid());
        }
        let mut addr = [0u8; 6];
        for (slot, pair) in addr.iter_mut().zip(digits.chunks(2)) {
            *slot = (pair[0] << 4) | pair[1];
        }
        Ok(Self(addr))
    }
}

impl fmt::Display for BtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl Serialize for BtAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BtAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Encode a friendly name into the chip's zero-padded name field.
pub fn encode_name(name: &str) -> Result<[u8; NAME_LEN], BtError> {
    if name.len() > NAME_LEN || name.bytes().any(|b| b == 0) {
        return Err(BtError::InvalidName(name.to_string()));
    }
    let mut out = [0u8; NAME_LEN];
    out[..name.len()].copy_from_slice(name.as_bytes());
    Ok(out)
}

/// Decode a name field, stopping at the first zero byte.
pub fn decode_name(raw: &[u8]) -> String {
    let raw = &raw[..raw.len().min(NAME_LEN)];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
