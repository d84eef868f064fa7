// Copyright 2025-2026 CEMAXECUTER LLC

use std::sync::atomic::{AtomicI8, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use bt_protocol::ble::{BlePhy, BLE_ADV_AA, BLE_ADV_CHANNELS, BLE_ADV_CRC_INIT, BLE_CRC_MASK};
use bt_protocol::BLE_NUM_CHANNELS;

use crate::queue::EntryPool;
use crate::RadioError;

/// Command number of the BLE5 generic receive operation
pub const CMD_BLE5_GENERIC_RX: u16 = 0x1829;

/// Radio core command-switch overhead subtracted from the channel 38 window
pub const CMD_LATENCY_TICKS: u32 = 150;

/// Timeout value meaning "receive until stopped"
pub const TIMEOUT_NEVER: u32 = 0xFFFF_FFFF;

/// Status word written by the radio core into each command
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdStatus {
    Idle = 0x0000,
    Pending = 0x0001,
    Active = 0x0002,
    Skipped = 0x0003,
    DoneOk = 0x1400,
    DoneAbort = 0x1407,
    DoneStopped = 0x1408,
}

impl CmdStatus {
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0x0000 => Some(CmdStatus::Idle),
            0x0001 => Some(CmdStatus::Pending),
            0x0002 => Some(CmdStatus::Active),
            0x0003 => Some(CmdStatus::Skipped),
            0x1400 => Some(CmdStatus::DoneOk),
            0x1407 => Some(CmdStatus::DoneAbort),
            0x1408 => Some(CmdStatus::DoneStopped),
            _ => None,
        }
    }

    /// A command is live until the radio core has finished with it.
    pub fn is_live_raw(raw: u16) -> bool {
        raw <= CmdStatus::Active as u16
    }
}

/// Atomic status cell updated by the radio core while the command executes.
#[derive(Debug)]
pub struct StatusCell(AtomicU16);

impl StatusCell {
    pub fn new() -> Self {
        Self(AtomicU16::new(CmdStatus::Idle as u16))
    }

    pub fn raw(&self) -> u16 {
        self.0.load(Ordering::Acquire)
    }

    pub fn get(&self) -> Option<CmdStatus> {
        CmdStatus::from_raw(self.raw())
    }

    pub fn set(&self, status: CmdStatus) {
        self.0.store(status as u16, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        CmdStatus::is_live_raw(self.raw())
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    /// Immediately
    Now,
    /// Never by time; only by an enabled command trigger
    Never,
    /// At an absolute radio time
    AbsTime,
    /// Relative to the end of the previous command
    RelPrevEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub kind: TriggerType,
    /// An immediate trigger directive also fires this trigger
    pub ena_cmd: bool,
    pub trigger_no: u8,
    /// Fire immediately if the trigger time is already in the past
    pub past_trig: bool,
}

impl Trigger {
    pub const fn new(kind: TriggerType) -> Self {
        Self { kind, ena_cmd: false, trigger_no: 0, past_trig: true }
    }

    pub const fn on_command(mut self) -> Self {
        self.ena_cmd = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionRule {
    /// Always run the next command in the chain
    Always,
    /// Chain ends after this command
    Never,
}

/// Receive filtering and entry layout flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxConfig {
    pub auto_flush_ignored: bool,
    pub auto_flush_crc_err: bool,
    pub auto_flush_empty: bool,
    pub include_len_byte: bool,
    pub include_crc: bool,
    pub append_rssi: bool,
    pub append_status: bool,
    pub append_timestamp: bool,
}

impl RxConfig {
    /// Drop bad and empty packets, keep only the length byte and payload.
    pub const fn sniffer() -> Self {
        Self {
            auto_flush_ignored: true,
            auto_flush_crc_err: true,
            auto_flush_empty: true,
            include_len_byte: true,
            include_crc: false,
            append_rssi: false,
            append_status: false,
            append_timestamp: false,
        }
    }
}

/// Output statistics slot shared by every command of a session.
/// Written by the radio core, read by the dispatcher.
#[derive(Debug, Default)]
pub struct RxOutput {
    n_rx_ok: AtomicU16,
    n_rx_nok: AtomicU16,
    n_rx_buf_full: AtomicU16,
    last_rssi: AtomicI8,
    timestamp: AtomicU32,
}

/// Plain snapshot of [`RxOutput`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxStats {
    pub n_rx_ok: u16,
    pub n_rx_nok: u16,
    pub n_rx_buf_full: u16,
    pub last_rssi: i8,
    pub timestamp: u32,
}

impl RxOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet accepted into the receive queue
    pub fn record_ok(&self, rssi: i8, timestamp: u32) {
        self.last_rssi.store(rssi, Ordering::Relaxed);
        self.timestamp.store(timestamp, Ordering::Relaxed);
        self.n_rx_ok.fetch_add(1, Ordering::Release);
    }

    /// Record a packet received with a CRC error
    pub fn record_nok(&self) {
        self.n_rx_nok.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet lost because the receive queue was full
    pub fn record_buf_full(&self) {
        self.n_rx_buf_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp.load(Ordering::Acquire)
    }

    pub fn last_rssi(&self) -> i8 {
        self.last_rssi.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> RxStats {
        RxStats {
            n_rx_ok: self.n_rx_ok.load(Ordering::Acquire),
            n_rx_nok: self.n_rx_nok.load(Ordering::Relaxed),
            n_rx_buf_full: self.n_rx_buf_full.load(Ordering::Relaxed),
            last_rssi: self.last_rssi.load(Ordering::Relaxed),
            timestamp: self.timestamp.load(Ordering::Relaxed),
        }
    }
}

/// Receive parameters referenced by a generic receive command
#[derive(Clone)]
pub struct RxParams {
    pub rx_queue: Arc<EntryPool>,
    pub access_address: u32,
    /// CRC init, least significant byte first
    pub crc_init: [u8; 3],
    /// Re-arm after each received packet
    pub repeat: bool,
    pub rx_config: RxConfig,
    pub end_trigger: Trigger,
    pub end_time: u32,
}

impl RxParams {
    pub fn crc_init(&self) -> u32 {
        self.crc_init[0] as u32 | (self.crc_init[1] as u32) << 8 | (self.crc_init[2] as u32) << 16
    }
}

fn split_crc_init(crc_init: u32) -> [u8; 3] {
    [crc_init as u8, (crc_init >> 8) as u8, (crc_init >> 16) as u8]
}

/// One BLE5 generic receive command
pub struct RxCommand {
    pub command_no: u16,
    status: StatusCell,
    pub start_trigger: Trigger,
    pub start_time: u32,
    pub condition: ConditionRule,
    pub channel: u8,
    /// 0 lets the radio derive whitening from the channel
    pub whitening_init: u8,
    pub phy: BlePhy,
    pub params: RxParams,
    pub output: Arc<RxOutput>,
}

impl RxCommand {
    fn new(channel: u8, phy: BlePhy, params: RxParams, output: Arc<RxOutput>) -> Self {
        Self {
            command_no: CMD_BLE5_GENERIC_RX,
            status: StatusCell::new(),
            start_trigger: Trigger::new(TriggerType::Now),
            start_time: 0,
            condition: ConditionRule::Always,
            channel,
            whitening_init: 0,
            phy,
            params,
            output,
        }
    }

    pub fn status(&self) -> &StatusCell {
        &self.status
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

impl std::fmt::Debug for RxCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxCommand")
            .field("channel", &self.channel)
            .field("status", &format_args!("0x{:04X}", self.status.raw()))
            .field("phy", &self.phy)
            .field("access_address", &format_args!("0x{:08X}", self.params.access_address))
            .field("end_trigger", &self.params.end_trigger)
            .field("end_time", &self.params.end_time)
            .field("condition", &self.condition)
            .finish()
    }
}

/// Single-channel whitening seed
pub fn whitening_init(channel: u8) -> u8 {
    0x40 | channel
}

/// Linked receive commands; command i+1 runs after command i ends.
#[derive(Debug)]
pub struct CommandChain {
    ops: Vec<RxCommand>,
}

impl CommandChain {
    /// Receive on one channel, re-arming after every packet, until `timeout`
    /// (absolute radio ticks) or forever for [`TIMEOUT_NEVER`].
    pub fn single(
        phy: BlePhy,
        channel: u8,
        access_address: u32,
        crc_init: u32,
        timeout: u32,
        rx_queue: Arc<EntryPool>,
        output: Arc<RxOutput>,
    ) -> Result<Self, RadioError> {
        if channel >= BLE_NUM_CHANNELS {
            return Err(RadioError::InvalidArgument("channel must be below 40"));
        }
        if crc_init > BLE_CRC_MASK {
            return Err(RadioError::InvalidArgument("CRC init must fit in 24 bits"));
        }

        let (end_trigger, end_time) = if timeout == TIMEOUT_NEVER {
            (Trigger::new(TriggerType::Never), 0)
        } else {
            (Trigger::new(TriggerType::AbsTime), timeout)
        };

        let params = RxParams {
            rx_queue,
            access_address,
            crc_init: split_crc_init(crc_init),
            repeat: true,
            rx_config: RxConfig::sniffer(),
            end_trigger,
            end_time,
        };

        let mut cmd = RxCommand::new(channel, phy, params, output);
        cmd.whitening_init = whitening_init(channel);
        cmd.condition = ConditionRule::Never;

        Ok(Self { ops: vec![cmd] })
    }

    /// Advertising chain: 37 until a hop trigger, then 38 for
    /// `hop_ticks - CMD_LATENCY_TICKS`, then 39 for `hop_ticks`.
    pub fn adv3(hop_ticks: u32, rx_queue: Arc<EntryPool>, output: Arc<RxOutput>) -> Result<Self, RadioError> {
        if hop_ticks <= CMD_LATENCY_TICKS {
            return Err(RadioError::InvalidArgument("hop interval must exceed command latency"));
        }

        let base = RxParams {
            rx_queue,
            access_address: BLE_ADV_AA,
            crc_init: split_crc_init(BLE_ADV_CRC_INIT),
            repeat: true,
            rx_config: RxConfig::sniffer(),
            end_trigger: Trigger::new(TriggerType::Never),
            end_time: 0,
        };

        let [ch37, ch38, ch39] = BLE_ADV_CHANNELS;

        let mut params37 = base.clone();
        params37.end_trigger = Trigger::new(TriggerType::Never).on_command();

        let mut params38 = base.clone();
        params38.end_trigger = Trigger::new(TriggerType::RelPrevEnd);
        params38.end_time = hop_ticks - CMD_LATENCY_TICKS;

        let mut params39 = base;
        params39.end_trigger = Trigger::new(TriggerType::RelPrevEnd);
        params39.end_time = hop_ticks;

        let sniff37 = RxCommand::new(ch37, BlePhy::Phy1M, params37, output.clone());
        let sniff38 = RxCommand::new(ch38, BlePhy::Phy1M, params38, output.clone());
        let mut sniff39 = RxCommand::new(ch39, BlePhy::Phy1M, params39, output);
        sniff39.condition = ConditionRule::Never;

        Ok(Self { ops: vec![sniff37, sniff38, sniff39] })
    }

    pub fn ops(&self) -> &[RxCommand] {
        &self.ops
    }

    pub fn get(&self, idx: usize) -> Option<&RxCommand> {
        self.ops.get(idx)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Index of the command that runs after `idx`, honouring its condition.
    pub fn next_index(&self, idx: usize) -> Option<usize> {
        let op = self.ops.get(idx)?;
        match op.condition {
            ConditionRule::Always if idx + 1 < self.ops.len() => Some(idx + 1),
            _ => None,
        }
    }

    /// True once the radio core has finished with the last command that will run.
    pub fn is_complete(&self) -> bool {
        let mut idx = 0;
        loop {
            let Some(op) = self.ops.get(idx) else {
                return true;
            };
            match op.status().get() {
                Some(CmdStatus::DoneStopped) | Some(CmdStatus::DoneAbort) => return true,
                _ if op.is_live() => return false,
                _ => {}
            }
            match self.next_index(idx) {
                Some(next) => idx = next,
                None => return true,
            }
        }
    }
}
