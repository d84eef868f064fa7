// Copyright 2025-2026 CEMAXECUTER LLC

mod pipeline;

use clap::Parser;
use std::path::PathBuf;

use bt_protocol::ble::{BlePhy, BLE_ADV_AA, BLE_ADV_CRC_INIT};
use bt_radio::cmd::TIMEOUT_NEVER;
use bt_radio::PoolConfig;

use pipeline::RxMode;

#[derive(Parser, Debug)]
#[command(name = "bt-rxsniff")]
#[command(about = "BLE receive sniffer driven by a radio replay script")]
struct Cli {
    /// Replay script (JSON lines of packet/hop/stop events)
    #[arg(short = 'r', long)]
    replay: Option<PathBuf>,

    /// Receive on a single channel (0-39) instead of the advertising chain
    #[arg(short = 'c', long)]
    channel: Option<u8>,

    /// Access address for single-channel receive
    #[arg(long, value_parser = parse_hex_u32, default_value = "8E89BED6")]
    access_address: u32,

    /// CRC init for single-channel receive (24 bits)
    #[arg(long, value_parser = parse_hex_u32, default_value = "555555")]
    crc_init: u32,

    /// PHY for single-channel receive: 1m, 2m, coded
    #[arg(long, default_value = "1m")]
    phy: String,

    /// Absolute end time in radio ticks for single-channel receive
    #[arg(long)]
    timeout: Option<u32>,

    /// Advertising hop interval in radio ticks (4 per microsecond)
    #[arg(long, default_value = "2000")]
    hop: u32,

    /// PCAP output file
    #[arg(short = 'w', long)]
    write: Option<PathBuf>,

    /// Receive entries in the radio pool
    #[arg(long, default_value = "2")]
    entries: usize,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Print statistics
    #[arg(long)]
    stats: bool,
}

fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn parse_phy(s: &str) -> Option<BlePhy> {
    match s {
        "1m" => Some(BlePhy::Phy1M),
        "2m" => Some(BlePhy::Phy2M),
        "coded" => Some(BlePhy::PhyCoded),
        _ => None,
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mode = match cli.channel {
        Some(channel) => {
            let Some(phy) = parse_phy(&cli.phy) else {
                eprintln!("unknown PHY: {} (use 1m, 2m, or coded)", cli.phy);
                std::process::exit(1);
            };
            RxMode::Single {
                phy,
                channel,
                access_address: cli.access_address,
                crc_init: cli.crc_init,
                timeout: cli.timeout.unwrap_or(TIMEOUT_NEVER),
            }
        }
        None => RxMode::Advertising { hop_ticks: cli.hop },
    };

    if cli.verbose {
        log::info!("bt-rxsniff starting");
        match &mode {
            RxMode::Single { channel, access_address, .. } => {
                log::info!("channel {} AA {:08X}", channel, access_address)
            }
            RxMode::Advertising { hop_ticks } => {
                log::info!("advertising chain AA {:08X} CRC {:06X}, hop {} ticks", BLE_ADV_AA, BLE_ADV_CRC_INIT, hop_ticks)
            }
        }
    }

    let pool = PoolConfig { entry_count: cli.entries, ..PoolConfig::default() };

    if let Some(ref script) = cli.replay {
        if let Err(e) = pipeline::run_replay(script, mode, pool, cli.write.as_deref(), cli.verbose, cli.stats) {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    } else {
        eprintln!("no input specified. Use -r <script> to replay a capture script.");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex_u32("8E89BED6"), Ok(0x8E89BED6));
        assert_eq!(parse_hex_u32("0x555555"), Ok(0x555555));
        assert!(parse_hex_u32("xyz").is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["bt-rxsniff", "-r", "script.jsonl"]);
        assert_eq!(cli.access_address, BLE_ADV_AA);
        assert_eq!(cli.crc_init, BLE_ADV_CRC_INIT);
        assert_eq!(cli.hop, 2000);
        assert_eq!(cli.entries, 2);
        assert!(cli.channel.is_none());
        assert_eq!(parse_phy(&cli.phy), Some(BlePhy::Phy1M));
    }

    #[test]
    fn test_cli_single_channel() {
        let cli = Cli::parse_from([
            "bt-rxsniff", "-r", "s.jsonl", "-c", "5", "--access-address", "12345678",
            "--phy", "2m", "--timeout", "40000",
        ]);
        assert_eq!(cli.channel, Some(5));
        assert_eq!(cli.access_address, 0x12345678);
        assert_eq!(parse_phy(&cli.phy), Some(BlePhy::Phy2M));
        assert_eq!(cli.timeout, Some(40000));
    }
}
