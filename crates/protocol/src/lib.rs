// Copyright 2025-2026 CEMAXECUTER LLC

pub mod ble;

/// Number of BLE channels (0-36 data, 37-39 advertising)
pub const BLE_NUM_CHANNELS: u8 = 40;

/// BLE channel number to physical RF channel index (2402 + 2 * index MHz).
/// Returns None for channels outside 0-39.
pub fn channel_to_rf_index(channel: u8) -> Option<u8> {
    match channel {
        37 => Some(0),
        38 => Some(12),
        39 => Some(39),
        c if c <= 10 => Some(c + 1),
        c if c < 37 => Some(c + 2),
        _ => None,
    }
}

/// BLE channel number to centre frequency in MHz
pub fn channel_to_freq(channel: u8) -> Option<u32> {
    channel_to_rf_index(channel).map(|idx| 2402 + 2 * idx as u32)
}
