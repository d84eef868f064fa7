// Copyright 2025-2026 CEMAXECUTER LLC

use serde::{Deserialize, Serialize};

pub const BLE_ADV_AA: u32 = 0x8E89BED6;
pub const BLE_ADV_CRC_INIT: u32 = 0x555555;
pub const BLE_ADV_CHANNELS: [u8; 3] = [37, 38, 39];

/// Largest value the 24-bit CRC register can hold
pub const BLE_CRC_MASK: u32 = 0xFFFFFF;

/// Reflect (bit-reverse) a 24-bit value
fn reflect24(mut v: u32) -> u32 {
    let mut result: u32 = 0;
    for _ in 0..24 {
        result = (result << 1) | (v & 1);
        v >>= 1;
    }
    result
}

/// BLE CRC-24 implementation
/// Polynomial: x^24 + x^10 + x^9 + x^6 + x^4 + x^3 + x + 1
/// Reflected polynomial for right-shifting CRC: 0xDA6000
/// Init: 0x555555 for advertising channels, CRC init from CONNECT_IND for data
/// Init value must be bit-reversed for the reflected CRC algorithm
pub fn crc24(data: &[u8], init: u32) -> u32 {
    let mut crc = reflect24(init & BLE_CRC_MASK);

    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xDA6000;
            } else {
                crc >>= 1;
            }
        }
    }

    crc & BLE_CRC_MASK
}

/// CRC bytes in on-air order (least significant byte first)
pub fn crc24_bytes(data: &[u8], init: u32) -> [u8; 3] {
    let crc = crc24(data, init);
    [crc as u8, (crc >> 8) as u8, (crc >> 16) as u8]
}

/// BLE PHY type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlePhy {
    #[serde(rename = "1m")]
    Phy1M,
    #[serde(rename = "2m")]
    Phy2M,
    #[serde(rename = "coded")]
    PhyCoded,
}

impl BlePhy {
    /// Main-mode code programmed into a radio command's PHY field
    pub fn main_mode(self) -> u8 {
        match self {
            BlePhy::Phy1M => 0,
            BlePhy::Phy2M => 1,
            BlePhy::PhyCoded => 2,
        }
    }
}

impl Default for BlePhy {
    fn default() -> Self {
        BlePhy::Phy1M
    }
}
