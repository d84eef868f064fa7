// Copyright 2025-2026 CEMAXECUTER LLC

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crossbeam::channel;

use bt_output::pcap::PcapWriter;
use bt_protocol::ble::{BlePhy, BLE_ADV_AA, BLE_ADV_CRC_INIT};
use bt_radio::cmd::RxStats;
use bt_radio::dispatch::channel_sink;
use bt_radio::replay::{ReplayEvent, ReplayReader};
use bt_radio::sim::{Delivery, SimRadio};
use bt_radio::{CapturedFrame, PoolConfig, RadioError, RadioSession};

/// Frames buffered between the dispatcher and the output loop
const FRAME_QUEUE_DEPTH: usize = 1024;

/// Receive operation to run
#[derive(Debug, Clone, Copy)]
pub enum RxMode {
    Single {
        phy: BlePhy,
        channel: u8,
        access_address: u32,
        crc_init: u32,
        timeout: u32,
    },
    Advertising {
        hop_ticks: u32,
    },
}

impl RxMode {
    /// Access address, CRC init and PHY the frames were received with
    fn link_params(&self) -> (u32, u32, BlePhy) {
        match *self {
            RxMode::Single { phy, access_address, crc_init, .. } => (access_address, crc_init, phy),
            RxMode::Advertising { .. } => (BLE_ADV_AA, BLE_ADV_CRC_INIT, BlePhy::Phy1M),
        }
    }
}

#[derive(Debug, Default)]
struct ReplaySummary {
    events: u64,
    delivered: u64,
    not_listening: u64,
    filtered: u64,
    buffer_full: u64,
    radio: Option<RxStats>,
    dropped_entries: u64,
}

/// Drive a simulated radio from a replay script. Runs as the control thread;
/// frames leave through the callback.
fn drive(
    script: PathBuf,
    mode: RxMode,
    pool: PoolConfig,
    tx: channel::Sender<CapturedFrame>,
) -> Result<ReplaySummary, String> {
    let reader = ReplayReader::open(&script)
        .map_err(|e| format!("failed to open {}: {}", script.display(), e))?;

    let radio = SimRadio::new();
    let mut session = RadioSession::with_pool_config(radio.clone(), pool);
    session.open().map_err(|e| format!("failed to open radio: {}", e))?;

    let callback = Some(channel_sink(tx));
    let started = match mode {
        RxMode::Single { phy, channel, access_address, crc_init, timeout } => {
            session.recv_frames(phy, channel, access_address, crc_init, timeout, callback)
        }
        RxMode::Advertising { hop_ticks } => session.recv_adv3(hop_ticks, callback),
    };
    started.map_err(|e| format!("failed to start receive: {}", e))?;

    let mut summary = ReplaySummary::default();

    for event in reader {
        let event = event.map_err(|e| format!("{}: {}", script.display(), e))?;
        radio.advance_to(event.at());
        summary.events += 1;

        match event {
            ReplayEvent::Packet(p) => match radio.transmit(&p.to_air_packet()) {
                Delivery::Received => summary.delivered += 1,
                Delivery::NotListening => summary.not_listening += 1,
                Delivery::CrcError | Delivery::Empty | Delivery::Oversize => summary.filtered += 1,
                Delivery::BufferFull => summary.buffer_full += 1,
            },
            ReplayEvent::Hop { .. } => session.trigger_hop().map_err(radio_err)?,
            ReplayEvent::Stop { .. } => session.stop().map_err(radio_err)?,
        }
    }

    summary.radio = session.stats();
    summary.dropped_entries = session.dispatch_counts().map_or(0, |(_, dropped)| dropped);
    session.close().map_err(radio_err)?;
    Ok(summary)
}

fn radio_err(e: RadioError) -> String {
    format!("radio: {}", e)
}

/// Replay a capture script through the radio session and write frames to PCAP.
pub fn run_replay(
    script: &Path,
    mode: RxMode,
    pool: PoolConfig,
    pcap_path: Option<&Path>,
    verbose: bool,
    print_stats: bool,
) -> Result<(), String> {
    let (access_address, crc_init, phy) = mode.link_params();

    // PCAP writer
    let mut pcap_writer: Option<PcapWriter<BufWriter<File>>> = if let Some(path) = pcap_path {
        let file = File::create(path).map_err(|e| format!("failed to create {}: {}", path.display(), e))?;
        let writer = BufWriter::new(file);
        Some(PcapWriter::new(writer).map_err(|e| format!("failed to write PCAP header: {}", e))?)
    } else {
        None
    };

    let (tx, rx) = channel::bounded(FRAME_QUEUE_DEPTH);

    let script = script.to_path_buf();
    let driver = std::thread::spawn(move || drive(script, mode, pool, tx));

    let stats_start = Instant::now();
    let mut total: u64 = 0;
    let mut per_channel = [0u64; 40];

    // The sender lives in the session's callback; the loop ends when it closes
    for frame in rx.iter() {
        total += 1;
        if let Some(n) = per_channel.get_mut(frame.channel as usize) {
            *n += 1;
        }

        if verbose {
            println!(
                "{:>10}us ch {:>2} rssi {:>4} len {:>3} {}",
                frame.timestamp,
                frame.channel,
                frame.rssi,
                frame.data.len(),
                hex(&frame.data)
            );
        }

        if let Some(ref mut writer) = pcap_writer {
            if let Err(e) = writer.write_frame(&frame, access_address, crc_init, phy) {
                log::warn!("PCAP write failed: {}", e);
            }
        }
    }

    let summary = driver
        .join()
        .map_err(|_| "replay thread panicked".to_string())??;

    if let Some(ref mut writer) = pcap_writer {
        writer.flush().map_err(|e| format!("failed to flush PCAP: {}", e))?;
    }

    // Final stats
    if print_stats {
        let elapsed = stats_start.elapsed().as_secs_f64();
        eprintln!(
            "done ({:.3}s): events: {} frames: {} delivered: {} not listening: {} filtered: {} queue full: {} dropped: {}",
            elapsed,
            summary.events,
            total,
            summary.delivered,
            summary.not_listening,
            summary.filtered,
            summary.buffer_full,
            summary.dropped_entries,
        );
        for (ch, n) in per_channel.iter().enumerate().filter(|(_, n)| **n > 0) {
            eprintln!("  ch {:>2}: {}", ch, n);
        }
        if let Some(s) = summary.radio {
            eprintln!(
                "radio: rx ok {} crc err {} buf full {} last rssi {}",
                s.n_rx_ok, s.n_rx_nok, s.n_rx_buf_full, s.last_rssi
            );
        }
    }

    Ok(())
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bt-rxsniff-{}-{}", std::process::id(), name))
    }

    fn write_script(name: &str, text: &str) -> PathBuf {
        let path = temp_path(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_replay_advertising_to_pcap() {
        let script = write_script(
            "adv.jsonl",
            "{\"kind\":\"packet\",\"at\":400,\"channel\":37,\"pdu\":[0,2,1,2]}\n\
             {\"kind\":\"hop\",\"at\":1000}\n\
             {\"kind\":\"packet\",\"at\":1200,\"channel\":38,\"pdu\":[0,1,3]}\n\
             {\"kind\":\"packet\",\"at\":3000,\"channel\":39,\"pdu\":[0,1,4]}\n\
             {\"kind\":\"stop\",\"at\":3500}\n",
        );
        let pcap = temp_path("adv.pcap");

        run_replay(
            &script,
            RxMode::Advertising { hop_ticks: 2000 },
            PoolConfig::default(),
            Some(&pcap),
            false,
            false,
        )
        .unwrap();

        let bytes = std::fs::read(&pcap).unwrap();
        // Global header plus three records of 16 + 10 + 4 + PDU + 3
        assert_eq!(bytes.len(), 24 + (33 + 4) + (33 + 3) + (33 + 3));
        let _ = std::fs::remove_file(&script);
        let _ = std::fs::remove_file(&pcap);
    }

    #[test]
    fn test_replay_single_channel() {
        let script = write_script(
            "single.jsonl",
            "# one good, one bad CRC, one on the wrong channel\n\
             {\"kind\":\"packet\",\"at\":100,\"channel\":5,\"pdu\":[2,1,9],\"access_address\":305419896}\n\
             {\"kind\":\"packet\",\"at\":200,\"channel\":5,\"pdu\":[2,1,9],\"access_address\":305419896,\"crc\":0}\n\
             {\"kind\":\"packet\",\"at\":300,\"channel\":6,\"pdu\":[2,1,9],\"access_address\":305419896}\n",
        );
        let mode = RxMode::Single {
            phy: BlePhy::Phy1M,
            channel: 5,
            access_address: 0x12345678,
            crc_init: 0x555555,
            timeout: bt_radio::cmd::TIMEOUT_NEVER,
        };
        let (tx, rx) = channel::bounded(16);
        let summary = drive(script.clone(), mode, PoolConfig::default(), tx).unwrap();

        assert_eq!(summary.events, 3);
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.filtered, 1);
        assert_eq!(summary.not_listening, 1);
        let frames: Vec<CapturedFrame> = rx.try_iter().collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, 5);
        assert_eq!(frames[0].timestamp, 25);
        let _ = std::fs::remove_file(&script);
    }

    #[test]
    fn test_replay_missing_script() {
        let err = run_replay(
            Path::new("/nonexistent/script.jsonl"),
            RxMode::Advertising { hop_ticks: 2000 },
            PoolConfig::default(),
            None,
            false,
            false,
        )
        .unwrap_err();
        assert!(err.contains("failed to open"));
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0xAB, 0x10]), "00ab10");
    }
}
