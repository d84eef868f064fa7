// Copyright 2025-2026 CEMAXECUTER LLC

//! Software radio core. Executes command chains against a virtual 4 MHz
//! clock and packets injected with [`SimRadio::transmit`], raising events on
//! the injecting thread the way a radio interrupt would.

use std::sync::{Arc, Mutex, MutexGuard};

use bt_protocol::ble::{crc24, BlePhy, BLE_ADV_AA};

use crate::cmd::{CmdStatus, CommandChain, TriggerType};
use crate::queue::MAX_LENGTH;
use crate::{CommandHandle, Directive, EventHandler, EventMask, Priority, RadioCore, RadioError};

/// A packet on the air
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirPacket {
    pub channel: u8,
    pub phy: BlePhy,
    pub access_address: u32,
    /// PDU: 2-byte header followed by the payload
    pub pdu: Vec<u8>,
    /// Transmitted CRC; None means a correct CRC for the receiver's seed
    pub crc: Option<u32>,
    pub rssi: i8,
}

impl AirPacket {
    pub fn new(channel: u8, access_address: u32, pdu: Vec<u8>) -> Self {
        Self {
            channel,
            phy: BlePhy::Phy1M,
            access_address,
            pdu,
            crc: None,
            rssi: -60,
        }
    }

    /// Advertising-channel packet
    pub fn adv(channel: u8, pdu: Vec<u8>) -> Self {
        Self::new(channel, BLE_ADV_AA, pdu)
    }

    pub fn with_rssi(mut self, rssi: i8) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_crc(mut self, crc: u32) -> Self {
        self.crc = Some(crc);
        self
    }

    pub fn with_phy(mut self, phy: BlePhy) -> Self {
        self.phy = phy;
        self
    }
}

/// Why a transmitted packet did or did not reach the receive queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the receive queue and the event raised
    Received,
    /// No operation listening on that channel, PHY and access address
    NotListening,
    /// Discarded by the CRC-error filter
    CrcError,
    /// Discarded by the empty-packet filter
    Empty,
    /// Receive queue had no free entry
    BufferFull,
    /// PDU longer than the largest receive entry
    Oversize,
}

struct Running {
    chain: Arc<CommandChain>,
    current: usize,
    /// Radio time at which the current command ends on its own
    deadline: Option<u64>,
    handler: EventHandler,
    events: EventMask,
}

struct SimState {
    available: bool,
    open: bool,
    clock: u64,
    next_handle: u32,
    running: Option<Running>,
    directives: Vec<Directive>,
}

/// Cloneable handle onto one simulated radio core
#[derive(Clone)]
pub struct SimRadio {
    inner: Arc<Mutex<SimState>>,
}

impl SimRadio {
    pub fn new() -> Self {
        Self::with_availability(true)
    }

    /// A radio whose open always fails
    pub fn unavailable() -> Self {
        Self::with_availability(false)
    }

    fn with_availability(available: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                available,
                open: false,
                clock: 0,
                next_handle: 1,
                running: None,
                directives: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current radio time in ticks
    pub fn now(&self) -> u64 {
        self.lock().clock
    }

    /// Let `ticks` of radio time pass, firing end triggers on the way.
    pub fn advance(&self, ticks: u64) {
        let mut state = self.lock();
        let target = state.clock + ticks;
        let done = state.run_until(target);
        drop(state);
        notify_done(done);
    }

    /// Let radio time pass up to `tick`. Never moves the clock backwards.
    pub fn advance_to(&self, tick: u64) {
        let mut state = self.lock();
        if tick > state.clock {
            let done = state.run_until(tick);
            drop(state);
            notify_done(done);
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn is_idle(&self) -> bool {
        self.lock().running.is_none()
    }

    /// Channel of the command currently receiving
    pub fn running_channel(&self) -> Option<u8> {
        let state = self.lock();
        let running = state.running.as_ref()?;
        running.chain.get(running.current).map(|op| op.channel)
    }

    /// Directives executed so far, oldest first
    pub fn directives(&self) -> Vec<Directive> {
        self.lock().directives.clone()
    }

    /// Put a packet on the air at the current radio time.
    pub fn transmit(&self, pkt: &AirPacket) -> Delivery {
        let mut state = self.lock();
        let now = state.clock;

        let Some(running) = state.running.as_ref() else {
            return Delivery::NotListening;
        };
        let chain = running.chain.clone();
        let idx = running.current;
        let handler = running.handler.clone();
        let events = running.events;
        let Some(op) = chain.get(idx) else {
            return Delivery::NotListening;
        };
        let params = &op.params;

        if pkt.pdu.len() > MAX_LENGTH {
            return Delivery::Oversize;
        }
        if op.channel != pkt.channel || op.phy != pkt.phy || params.access_address != pkt.access_address {
            return Delivery::NotListening;
        }

        let expected = crc24(&pkt.pdu, params.crc_init());
        let crc = pkt.crc.unwrap_or(expected);
        if crc != expected {
            op.output.record_nok();
            if params.rx_config.auto_flush_crc_err {
                log::trace!("sim: CRC error on channel {}", op.channel);
                return Delivery::CrcError;
            }
        }

        let payload_len = pkt.pdu.get(1).copied().unwrap_or(0);
        if payload_len == 0 && params.rx_config.auto_flush_empty {
            return Delivery::Empty;
        }

        let cfg = params.rx_config;
        let mut entry = Vec::with_capacity(pkt.pdu.len() + 9);
        if cfg.include_len_byte {
            entry.push(pkt.pdu.len() as u8);
        }
        entry.extend_from_slice(&pkt.pdu);
        if cfg.include_crc {
            entry.extend_from_slice(&crc.to_le_bytes()[..3]);
        }
        if cfg.append_rssi {
            entry.push(pkt.rssi as u8);
        }
        if cfg.append_status {
            entry.push(0);
        }
        if cfg.append_timestamp {
            entry.extend_from_slice(&(now as u32).to_le_bytes());
        }

        if !params.rx_queue.push(&entry) {
            op.output.record_buf_full();
            log::debug!("sim: receive queue full on channel {}", op.channel);
            return Delivery::BufferFull;
        }
        op.output.record_ok(pkt.rssi, now as u32);

        let done = if params.repeat { None } else { state.end_current(CmdStatus::DoneOk) };
        drop(state);

        if events.contains(EventMask::RX_ENTRY_DONE) {
            handler(EventMask::RX_ENTRY_DONE);
        }
        notify_done(done);
        Delivery::Received
    }
}

fn notify_done(handlers: impl IntoIterator<Item = EventHandler>) {
    for handler in handlers {
        handler(EventMask::LAST_CMD_DONE);
    }
}

impl Default for SimRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimState {
    /// Start command `idx` of the running chain at `prev_end`.
    fn start(&mut self, idx: usize, prev_end: u64) {
        let now = self.clock;
        let Some(running) = self.running.as_mut() else {
            return;
        };
        let Some(op) = running.chain.get(idx) else {
            return;
        };

        let params = &op.params;
        let deadline = match params.end_trigger.kind {
            TriggerType::Never | TriggerType::Now => None,
            TriggerType::AbsTime => Some(params.end_time as u64),
            TriggerType::RelPrevEnd => Some(prev_end + params.end_time as u64),
        };
        // A trigger time already behind the clock fires only with past_trig set
        let deadline = deadline.filter(|&d| d >= now || params.end_trigger.past_trig);

        op.status().set(CmdStatus::Active);
        running.current = idx;
        running.deadline = deadline;
        log::trace!("sim: channel {} active, deadline {:?}", op.channel, deadline);
    }

    /// End the running command and continue with its successor, if any.
    /// Returns the handler to notify if that ended the whole chain.
    fn end_current(&mut self, status: CmdStatus) -> Option<EventHandler> {
        let now = self.clock;
        let running = self.running.as_ref()?;
        let chain = running.chain.clone();
        let idx = running.current;

        if let Some(op) = chain.get(idx) {
            op.status().set(status);
        }

        let next = match status {
            CmdStatus::DoneOk => chain.next_index(idx),
            _ => None,
        };
        if let Some(next) = next {
            self.start(next, now);
            return None;
        }

        let running = self.running.take()?;
        log::trace!("sim: chain done");
        running.events.contains(EventMask::LAST_CMD_DONE).then_some(running.handler)
    }

    fn run_until(&mut self, target: u64) -> Vec<EventHandler> {
        let mut done = Vec::new();
        loop {
            let deadline = match self.running.as_ref().and_then(|r| r.deadline) {
                Some(d) if d <= target => d,
                _ => break,
            };
            self.clock = self.clock.max(deadline);
            done.extend(self.end_current(CmdStatus::DoneOk));
        }
        self.clock = target;
        done
    }

    fn abort_running(&mut self) {
        if let Some(running) = self.running.take() {
            if let Some(op) = running.chain.get(running.current) {
                op.status().set(CmdStatus::DoneAbort);
            }
        }
    }
}

impl RadioCore for SimRadio {
    fn open(&mut self) -> Result<(), RadioError> {
        let mut state = self.lock();
        if !state.available {
            return Err(RadioError::DeviceUnavailable);
        }
        state.open = true;
        Ok(())
    }

    fn run_async(
        &mut self,
        chain: Arc<CommandChain>,
        priority: Priority,
        handler: EventHandler,
        events: EventMask,
    ) -> Result<CommandHandle, RadioError> {
        let mut state = self.lock();
        if !state.open {
            return Err(RadioError::InvalidState);
        }
        if chain.is_empty() {
            return Err(RadioError::InvalidArgument("empty command chain"));
        }

        state.abort_running();

        let handle = CommandHandle(state.next_handle);
        state.next_handle += 1;
        log::debug!("sim: chain of {} queued ({:?}, handle {})", chain.len(), priority, handle.0);

        chain.ops()[0].status().set(CmdStatus::Pending);
        let now = state.clock;
        state.running = Some(Running { chain, current: 0, deadline: None, handler, events });
        state.start(0, now);
        let done = state.run_until(now);
        drop(state);
        notify_done(done);
        Ok(handle)
    }

    fn run_immediate(&mut self, directive: Directive) -> Result<(), RadioError> {
        let mut state = self.lock();
        if !state.open {
            return Err(RadioError::InvalidState);
        }
        state.directives.push(directive);

        let done = match directive {
            Directive::HopTrigger => {
                let accepts = state
                    .running
                    .as_ref()
                    .and_then(|r| r.chain.get(r.current))
                    .map_or(false, |op| op.params.end_trigger.ena_cmd);
                if accepts {
                    state.end_current(CmdStatus::DoneOk)
                } else {
                    log::debug!("sim: hop trigger ignored, running command does not accept it");
                    None
                }
            }
            Directive::Stop => state.end_current(CmdStatus::DoneStopped),
        };
        drop(state);
        notify_done(done);
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.lock();
        state.abort_running();
        state.open = false;
    }
}
