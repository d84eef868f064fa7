// Copyright 2025-2026 CEMAXECUTER LLC

//! Replay scripts for the simulated radio.
//!
//! One JSON object per line, ordered by radio time:
//!
//! ```text
//! # adv on 37, hop, then a packet on 38
//! {"kind":"packet","at":4000,"channel":37,"pdu":[0,6,1,2,3,4,5,6],"rssi":-52}
//! {"kind":"hop","at":8000}
//! {"kind":"packet","at":8400,"channel":38,"pdu":[0,1,9]}
//! {"kind":"stop","at":20000}
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use bt_protocol::ble::{BlePhy, BLE_ADV_AA};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sim::AirPacket;

fn default_access_address() -> u32 {
    BLE_ADV_AA
}

fn default_rssi() -> i8 {
    -60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayPacket {
    /// Radio ticks
    pub at: u64,
    pub channel: u8,
    pub pdu: Vec<u8>,
    #[serde(default = "default_access_address")]
    pub access_address: u32,
    #[serde(default = "default_rssi")]
    pub rssi: i8,
    /// Transmitted CRC; omitted means correct
    #[serde(default)]
    pub crc: Option<u32>,
    #[serde(default)]
    pub phy: BlePhy,
}

impl ReplayPacket {
    pub fn to_air_packet(&self) -> AirPacket {
        AirPacket {
            channel: self.channel,
            phy: self.phy,
            access_address: self.access_address,
            pdu: self.pdu.clone(),
            crc: self.crc,
            rssi: self.rssi,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayEvent {
    Packet(ReplayPacket),
    Hop { at: u64 },
    Stop { at: u64 },
}

impl ReplayEvent {
    /// Radio time of the event in ticks
    pub fn at(&self) -> u64 {
        match self {
            ReplayEvent::Packet(p) => p.at,
            ReplayEvent::Hop { at } | ReplayEvent::Stop { at } => *at,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay read failed: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("line {line}: event at {at} is earlier than previous event at {previous}")]
    OutOfOrder { line: usize, at: u64, previous: u64 },
}

/// Iterator over the events of a replay script
pub struct ReplayReader<R: BufRead> {
    reader: R,
    line_no: usize,
    last_at: u64,
    buf: String,
}

impl ReplayReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let file = File::open(path.as_ref())?;
        Ok(Self::from_reader(BufReader::new(file)))
    }
}

impl<R: BufRead> ReplayReader<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            reader,
            line_no: 0,
            last_at: 0,
            buf: String::new(),
        }
    }

    fn next_event(&mut self) -> Result<Option<ReplayEvent>, ReplayError> {
        loop {
            self.buf.clear();
            if self.reader.read_line(&mut self.buf)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let line = self.buf.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let event: ReplayEvent = serde_json::from_str(line)
                .map_err(|source| ReplayError::Parse { line: self.line_no, source })?;

            let at = event.at();
            if at < self.last_at {
                return Err(ReplayError::OutOfOrder {
                    line: self.line_no,
                    at,
                    previous: self.last_at,
                });
            }
            self.last_at = at;
            return Ok(Some(event));
        }
    }
}

impl<R: BufRead> Iterator for ReplayReader<R> {
    type Item = Result<ReplayEvent, ReplayError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(text: &str) -> Vec<Result<ReplayEvent, ReplayError>> {
        ReplayReader::from_reader(Cursor::new(text.to_string())).collect()
    }

    #[test]
    fn test_parse_script() {
        let script = "\
# header comment
{\"kind\":\"packet\",\"at\":4000,\"channel\":37,\"pdu\":[0,2,1,2],\"rssi\":-52}

{\"kind\":\"hop\",\"at\":8000}
{\"kind\":\"packet\",\"at\":8400,\"channel\":5,\"pdu\":[2,1,7],\"access_address\":305419896,\"crc\":1,\"phy\":\"2m\"}
{\"kind\":\"stop\",\"at\":20000}
";
        let events: Vec<ReplayEvent> = read_all(script).into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(events.len(), 4);

        match &events[0] {
            ReplayEvent::Packet(p) => {
                assert_eq!(p.channel, 37);
                assert_eq!(p.pdu, vec![0, 2, 1, 2]);
                assert_eq!(p.access_address, BLE_ADV_AA);
                assert_eq!(p.rssi, -52);
                assert_eq!(p.crc, None);
                assert_eq!(p.phy, BlePhy::Phy1M);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(events[1], ReplayEvent::Hop { at: 8000 });

        let ReplayEvent::Packet(p) = &events[2] else {
            panic!("expected packet");
        };
        assert_eq!(p.access_address, 0x12345678);
        assert_eq!(p.crc, Some(1));
        assert_eq!(p.phy, BlePhy::Phy2M);
        assert_eq!(p.rssi, -60);

        let air = p.to_air_packet();
        assert_eq!(air.channel, 5);
        assert_eq!(air.crc, Some(1));
        assert_eq!(events[3].at(), 20000);
    }

    #[test]
    fn test_parse_error_reports_line() {
        let script = "{\"kind\":\"hop\",\"at\":1}\n\n{\"kind\":\"jump\",\"at\":2}\n";
        let results = read_all(script);
        assert!(results[0].is_ok());
        match &results[1] {
            Err(ReplayError::Parse { line, .. }) => assert_eq!(*line, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_out_of_order_rejected() {
        let script = "{\"kind\":\"hop\",\"at\":100}\n{\"kind\":\"stop\",\"at\":100}\n{\"kind\":\"hop\",\"at\":50}\n";
        let results = read_all(script);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(
            results[2],
            Err(ReplayError::OutOfOrder { line: 3, at: 50, previous: 100 })
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ReplayReader::open("/nonexistent/replay.jsonl"),
            Err(ReplayError::Io(_))
        ));
    }
}
