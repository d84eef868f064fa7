// Copyright 2025-2026 CEMAXECUTER LLC

use std::io::{self, Write};
use byteorder::{LittleEndian, WriteBytesExt};
use bt_protocol::ble::{crc24_bytes, BlePhy};
use bt_protocol::channel_to_rf_index;
use bt_radio::CapturedFrame;

pub const DLT_BLUETOOTH_LE_LL_WITH_PHDR: u32 = 256;

// BLE LE header flags
const LE_DEWHITENED: u16 = 0x0001;
const LE_SIGNAL_POWER_VALID: u16 = 0x0002;
const LE_REF_AA_VALID: u16 = 0x0010;
const LE_CRC_CHECKED: u16 = 0x0400;
const LE_CRC_VALID: u16 = 0x0800;

// PHY encoding in flags bits 14-15
const LE_PHY_1M: u16 = 0x0000;
const LE_PHY_2M: u16 = 0x4000;
const LE_PHY_CODED: u16 = 0x8000;

const LE_HEADER_SIZE: usize = 10;

// Largest record: LE header + AA + 255-byte PDU + CRC
const SNAPLEN: u32 = (LE_HEADER_SIZE + 4 + 255 + 3) as u32;

/// Map BLE PHY type to PCAP flags bits 14-15
fn phy_to_flags(phy: BlePhy) -> u16 {
    match phy {
        BlePhy::Phy1M => LE_PHY_1M,
        BlePhy::Phy2M => LE_PHY_2M,
        BlePhy::PhyCoded => LE_PHY_CODED,
    }
}

/// PCAP file writer
pub struct PcapWriter<W: Write> {
    writer: W,
    records: u64,
}

impl<W: Write> PcapWriter<W> {
    /// Create a new PCAP file writer with the global header.
    pub fn new(mut writer: W) -> io::Result<Self> {
        writer.write_u32::<LittleEndian>(0xa1b2c3d4)?; // magic
        writer.write_u16::<LittleEndian>(2)?; // version_major
        writer.write_u16::<LittleEndian>(4)?; // version_minor
        writer.write_i32::<LittleEndian>(0)?; // thiszone
        writer.write_u32::<LittleEndian>(0)?; // sigfigs
        writer.write_u32::<LittleEndian>(SNAPLEN)?;
        writer.write_u32::<LittleEndian>(DLT_BLUETOOTH_LE_LL_WITH_PHDR)?;
        writer.flush()?;
        Ok(Self { writer, records: 0 })
    }

    /// Write one received frame. The radio strips the access address and
    /// CRC, so both are reconstructed from the receive parameters.
    pub fn write_frame(
        &mut self,
        frame: &CapturedFrame,
        access_address: u32,
        crc_init: u32,
        phy: BlePhy,
    ) -> io::Result<()> {
        // Frames only reach the sink after the radio's CRC filter passed them
        let flags = LE_DEWHITENED
            | LE_SIGNAL_POWER_VALID
            | LE_REF_AA_VALID
            | LE_CRC_CHECKED
            | LE_CRC_VALID
            | phy_to_flags(phy);

        let rf_channel = channel_to_rf_index(frame.channel).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("bad channel {}", frame.channel))
        })?;

        let total_len = LE_HEADER_SIZE + 4 + frame.data.len() + 3;

        // PCAP record header
        self.writer.write_u32::<LittleEndian>(frame.timestamp / 1_000_000)?;
        self.writer.write_u32::<LittleEndian>(frame.timestamp % 1_000_000)?;
        self.writer.write_u32::<LittleEndian>(total_len as u32)?;
        self.writer.write_u32::<LittleEndian>(total_len as u32)?;

        // BLE LE link-layer header (10 bytes, packed LE)
        self.writer.write_u8(rf_channel)?;
        self.writer.write_i8(frame.rssi)?;
        self.writer.write_i8(0)?; // noise, not reported
        self.writer.write_u8(0)?; // aa_offenses
        self.writer.write_u32::<LittleEndian>(access_address)?; // ref_aa
        self.writer.write_u16::<LittleEndian>(flags)?;

        // Packet data
        self.writer.write_u32::<LittleEndian>(access_address)?;
        self.writer.write_all(&frame.data)?;
        self.writer.write_all(&crc24_bytes(&frame.data, crc_init))?;
        self.writer.flush()?;

        self.records += 1;
        Ok(())
    }

    /// Records written so far
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flush the writer
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bt_protocol::ble::{BLE_ADV_AA, BLE_ADV_CRC_INIT};

    fn frame(channel: u8, data: Vec<u8>) -> CapturedFrame {
        CapturedFrame { data, timestamp: 2_500_123, rssi: -48, channel }
    }

    #[test]
    fn test_pcap_global_header() {
        let mut buf = Vec::new();
        let _writer = PcapWriter::new(&mut buf).unwrap();

        // Check PCAP magic
        assert_eq!(buf[0..4], [0xd4, 0xc3, 0xb2, 0xa1]);
        // Version 2.4
        assert_eq!(buf[4..6], [2, 0]);
        assert_eq!(buf[6..8], [4, 0]);
        // DLT 256
        assert_eq!(buf[20..24], [0, 1, 0, 0]);
        assert_eq!(buf.len(), 24);
    }

    #[test]
    fn test_adv_frame_record() {
        let pdu = vec![0x40, 0x06, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        let mut w = PcapWriter::new(Vec::new()).unwrap();
        w.write_frame(&frame(38, pdu.clone()), BLE_ADV_AA, BLE_ADV_CRC_INIT, BlePhy::Phy1M)
            .unwrap();
        assert_eq!(w.records(), 1);
        let buf = w.into_inner();
        let rec = &buf[24..];

        // 2.500123 s
        assert_eq!(u32::from_le_bytes(rec[0..4].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(rec[4..8].try_into().unwrap()), 500_123);
        let incl = u32::from_le_bytes(rec[8..12].try_into().unwrap()) as usize;
        assert_eq!(incl, 10 + 4 + pdu.len() + 3);
        assert_eq!(rec.len(), 16 + incl);

        let le = &rec[16..26];
        assert_eq!(le[0], 12); // channel 38 -> RF index 12
        assert_eq!(le[1] as i8, -48);
        assert_eq!(u32::from_le_bytes(le[4..8].try_into().unwrap()), BLE_ADV_AA);
        let flags = u16::from_le_bytes(le[8..10].try_into().unwrap());
        assert_eq!(flags & 0xC000, LE_PHY_1M);
        assert_ne!(flags & LE_CRC_VALID, 0);
        assert_ne!(flags & LE_REF_AA_VALID, 0);

        let data = &rec[26..];
        assert_eq!(data[0..4], [0xD6, 0xBE, 0x89, 0x8E]);
        assert_eq!(&data[4..4 + pdu.len()], &pdu[..]);
        assert_eq!(data[4 + pdu.len()..], crc24_bytes(&pdu, BLE_ADV_CRC_INIT));
    }

    #[test]
    fn test_phy_flags() {
        let mut w = PcapWriter::new(Vec::new()).unwrap();
        w.write_frame(&frame(5, vec![0x02, 0x00]), 0x12345678, 0x555555, BlePhy::Phy2M).unwrap();
        let buf = w.into_inner();
        let flags = u16::from_le_bytes(buf[24 + 16 + 8..24 + 16 + 10].try_into().unwrap());
        assert_eq!(flags & 0xC000, LE_PHY_2M);
        assert_eq!(buf[24 + 16], 6); // channel 5 -> RF index 6
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let mut w = PcapWriter::new(Vec::new()).unwrap();
        let err = w
            .write_frame(&frame(40, vec![0x00, 0x00]), BLE_ADV_AA, BLE_ADV_CRC_INIT, BlePhy::Phy1M)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(w.records(), 0);
    }
}
