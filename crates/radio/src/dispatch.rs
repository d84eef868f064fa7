// Copyright 2025-2026 CEMAXECUTER LLC

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::Sender;

use crate::cmd::{CommandChain, RxOutput};
use crate::queue::EntryPool;
use crate::{EventMask, RADIO_TICKS_PER_US};

/// A received packet, borrowed from its receive entry.
/// Only valid for the duration of the frame callback.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Packet bytes following the length byte
    pub data: &'a [u8],
    pub length: u8,
    /// Microseconds of radio time
    pub timestamp: u32,
    pub rssi: i8,
    pub channel: u8,
}

impl Frame<'_> {
    pub fn to_captured(&self) -> CapturedFrame {
        CapturedFrame {
            data: self.data.to_vec(),
            timestamp: self.timestamp,
            rssi: self.rssi,
            channel: self.channel,
        }
    }
}

/// Owned copy of a [`Frame`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
    pub timestamp: u32,
    pub rssi: i8,
    pub channel: u8,
}

/// Frame sink invoked synchronously from the dispatcher. Must return quickly
/// and must not keep the borrowed payload.
pub type FrameCallback = Box<dyn FnMut(&Frame<'_>) + Send>;

/// Build a callback that copies each frame into a bounded channel.
/// Frames are dropped rather than blocking the dispatcher when the channel is full.
pub fn channel_sink(tx: Sender<CapturedFrame>) -> FrameCallback {
    let mut overflows: u64 = 0;
    Box::new(move |frame: &Frame<'_>| {
        if tx.try_send(frame.to_captured()).is_err() {
            overflows += 1;
            if overflows.is_power_of_two() {
                log::warn!("frame channel full, {} frames dropped", overflows);
            }
        }
    })
}

/// 4 MHz radio ticks to microseconds (truncating)
pub fn ticks_to_us(ticks: u32) -> u32 {
    ticks / RADIO_TICKS_PER_US
}

/// Progress of the advertising chain as seen by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvPhase {
    AwaitingHopFrom37,
    AwaitingHopFrom38,
    OnChannel39,
}

impl AdvPhase {
    pub fn channel(self) -> u8 {
        match self {
            AdvPhase::AwaitingHopFrom37 => 37,
            AdvPhase::AwaitingHopFrom38 => 38,
            AdvPhase::OnChannel39 => 39,
        }
    }

    /// Move past commands the radio core has finished with. Never moves backwards.
    pub fn update(self, chain: &CommandChain) -> Self {
        let finished = |idx: usize| chain.get(idx).map_or(true, |op| !op.is_live());

        let mut phase = self;
        if phase == AdvPhase::AwaitingHopFrom37 && finished(0) {
            phase = AdvPhase::AwaitingHopFrom38;
        }
        if phase == AdvPhase::AwaitingHopFrom38 && finished(1) {
            phase = AdvPhase::OnChannel39;
        }
        phase
    }
}

/// Which receive operation incoming entries belong to
pub(crate) enum ReceiveMode {
    Idle,
    Single { channel: u8 },
    Adv3 { chain: Arc<CommandChain>, phase: AdvPhase },
}

struct DispatchState {
    mode: ReceiveMode,
    callback: Option<FrameCallback>,
}

/// Receive dispatcher: drains completed entries, attributes them to a channel
/// and hands frames to the active callback.
pub struct Dispatcher {
    pool: Arc<EntryPool>,
    output: Arc<RxOutput>,
    state: Mutex<DispatchState>,
    frames: AtomicU64,
    dropped: AtomicU64,
}

impl Dispatcher {
    pub fn new(pool: Arc<EntryPool>, output: Arc<RxOutput>) -> Self {
        Self {
            pool,
            output,
            state: Mutex::new(DispatchState { mode: ReceiveMode::Idle, callback: None }),
            frames: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn pool(&self) -> &Arc<EntryPool> {
        &self.pool
    }

    pub fn output(&self) -> &Arc<RxOutput> {
        &self.output
    }

    /// Replace the bookkeeping of the previous receive operation.
    pub(crate) fn arm(&self, mode: ReceiveMode, callback: Option<FrameCallback>) {
        let mut state = self.lock();
        state.mode = mode;
        state.callback = callback;
    }

    pub(crate) fn disarm(&self) {
        self.arm(ReceiveMode::Idle, None);
    }

    /// Frames handed to a callback so far
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Entries recycled without producing a frame
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current advertising phase, if the advertising chain is armed
    pub fn adv_phase(&self) -> Option<AdvPhase> {
        match self.lock().mode {
            ReceiveMode::Adv3 { phase, .. } => Some(phase),
            _ => None,
        }
    }

    /// Radio core event handler. Consumes one completed entry per
    /// receive-entry event.
    pub fn handle_event(&self, events: EventMask) {
        if !events.contains(EventMask::RX_ENTRY_DONE) {
            return;
        }

        let Some(entry) = self.pool.next_completed() else {
            return;
        };

        let mut state = self.lock();
        let channel = match &mut state.mode {
            ReceiveMode::Single { channel } => Some(*channel),
            ReceiveMode::Adv3 { chain, phase } => {
                *phase = phase.update(chain);
                Some(phase.channel())
            }
            ReceiveMode::Idle => None,
        };

        let (Some(channel), Some(payload)) = (channel, entry.payload()) else {
            log::debug!("dropping malformed or unattributed entry ({} bytes)", entry.bytes().len());
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let Some(callback) = state.callback.as_mut() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let frame = Frame {
            data: payload,
            length: payload.len() as u8,
            timestamp: ticks_to_us(self.output.timestamp()),
            rssi: self.output.last_rssi(),
            channel,
        };

        log::trace!(
            "frame ch={} len={} ts={}us rssi={}",
            frame.channel,
            frame.length,
            frame.timestamp,
            frame.rssi
        );

        callback(&frame);
        self.frames.fetch_add(1, Ordering::Relaxed);

        drop(state);
        entry.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::CmdStatus;
    use crate::queue::{entry_buffer_size, MAX_LENGTH, NUM_APPENDED_BYTES, NUM_DATA_ENTRIES};

    fn dispatcher() -> Dispatcher {
        let total = entry_buffer_size(NUM_DATA_ENTRIES, MAX_LENGTH, NUM_APPENDED_BYTES);
        let pool = EntryPool::define(total, NUM_DATA_ENTRIES, MAX_LENGTH + NUM_APPENDED_BYTES).unwrap();
        Dispatcher::new(Arc::new(pool), Arc::new(RxOutput::new()))
    }

    fn collector() -> (FrameCallback, Arc<Mutex<Vec<CapturedFrame>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: FrameCallback = Box::new(move |f: &Frame<'_>| sink.lock().unwrap().push(f.to_captured()));
        (cb, seen)
    }

    #[test]
    fn test_ticks_to_us_truncates() {
        assert_eq!(ticks_to_us(4000), 1000);
        assert_eq!(ticks_to_us(4003), 1000);
        assert_eq!(ticks_to_us(3), 0);
        assert_eq!(ticks_to_us(u32::MAX), u32::MAX / 4);
    }

    #[test]
    fn test_single_channel_frame() {
        let d = dispatcher();
        let (cb, seen) = collector();
        d.arm(ReceiveMode::Single { channel: 12 }, Some(cb));

        assert!(d.pool().push(&[3, 0x40, 0x01, 0x99]));
        d.output().record_ok(-61, 4003);
        d.handle_event(EventMask::RX_ENTRY_DONE);

        let frames = seen.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, vec![0x40, 0x01, 0x99]);
        assert_eq!(frames[0].channel, 12);
        assert_eq!(frames[0].timestamp, 1000);
        assert_eq!(frames[0].rssi, -61);
        assert_eq!(d.pool().occupancy(), 0);
    }

    #[test]
    fn test_frame_emitted_before_entry_recycled() {
        let d = dispatcher();
        let pool = d.pool().clone();
        let during = Arc::new(Mutex::new(Vec::new()));
        let seen = during.clone();
        let cb: FrameCallback = Box::new(move |_: &Frame<'_>| seen.lock().unwrap().push(pool.occupancy()));
        d.arm(ReceiveMode::Single { channel: 3 }, Some(cb));

        assert!(d.pool().push(&[1, 0x10]));
        d.handle_event(EventMask::RX_ENTRY_DONE);

        assert_eq!(*during.lock().unwrap(), vec![1]);
        assert_eq!(d.pool().occupancy(), 0);
    }

    #[test]
    fn test_other_events_ignored() {
        let d = dispatcher();
        let (cb, seen) = collector();
        d.arm(ReceiveMode::Single { channel: 1 }, Some(cb));
        assert!(d.pool().push(&[1, 0xAA]));

        d.handle_event(EventMask::LAST_CMD_DONE);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(d.pool().occupancy(), 1);

        d.handle_event(EventMask::LAST_CMD_DONE | EventMask::RX_ENTRY_DONE);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_event_without_entry() {
        let d = dispatcher();
        let (cb, seen) = collector();
        d.arm(ReceiveMode::Single { channel: 1 }, Some(cb));
        d.handle_event(EventMask::RX_ENTRY_DONE);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(d.dropped(), 0);
    }

    #[test]
    fn test_drains_without_callback() {
        let d = dispatcher();
        d.arm(ReceiveMode::Single { channel: 7 }, None);
        for i in 0..10u8 {
            assert!(d.pool().push(&[1, i]), "push {}", i);
            d.handle_event(EventMask::RX_ENTRY_DONE);
        }
        assert_eq!(d.pool().occupancy(), 0);
        assert_eq!(d.dropped(), 10);
        assert_eq!(d.frames(), 0);
    }

    #[test]
    fn test_malformed_entry_recycled() {
        let d = dispatcher();
        let (cb, seen) = collector();
        d.arm(ReceiveMode::Single { channel: 7 }, Some(cb));
        assert!(d.pool().push(&[200, 1, 2]));
        d.handle_event(EventMask::RX_ENTRY_DONE);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(d.pool().occupancy(), 0);
        assert_eq!(d.dropped(), 1);
    }

    #[test]
    fn test_adv3_attribution_follows_status() {
        let d = dispatcher();
        let chain = Arc::new(CommandChain::adv3(2000, d.pool().clone(), d.output().clone()).unwrap());
        let (cb, seen) = collector();
        d.arm(
            ReceiveMode::Adv3 { chain: chain.clone(), phase: AdvPhase::AwaitingHopFrom37 },
            Some(cb),
        );

        chain.ops()[0].status().set(CmdStatus::Active);
        assert!(d.pool().push(&[1, 0x01]));
        d.handle_event(EventMask::RX_ENTRY_DONE);

        chain.ops()[0].status().set(CmdStatus::DoneOk);
        chain.ops()[1].status().set(CmdStatus::Active);
        assert!(d.pool().push(&[1, 0x02]));
        d.handle_event(EventMask::RX_ENTRY_DONE);

        chain.ops()[1].status().set(CmdStatus::DoneOk);
        assert!(d.pool().push(&[1, 0x03]));
        d.handle_event(EventMask::RX_ENTRY_DONE);

        let channels: Vec<u8> = seen.lock().unwrap().iter().map(|f| f.channel).collect();
        assert_eq!(channels, vec![37, 38, 39]);
        assert_eq!(d.adv_phase(), Some(AdvPhase::OnChannel39));
    }

    #[test]
    fn test_adv3_before_chain_starts_is_channel_37() {
        let d = dispatcher();
        let chain = Arc::new(CommandChain::adv3(2000, d.pool().clone(), d.output().clone()).unwrap());
        let (cb, seen) = collector();
        d.arm(ReceiveMode::Adv3 { chain, phase: AdvPhase::AwaitingHopFrom37 }, Some(cb));

        assert!(d.pool().push(&[1, 0x01]));
        d.handle_event(EventMask::RX_ENTRY_DONE);
        assert_eq!(seen.lock().unwrap()[0].channel, 37);
    }

    #[test]
    fn test_adv_phase_never_regresses() {
        let q = {
            let total = entry_buffer_size(1, 8, 0);
            Arc::new(EntryPool::define(total, 1, 8).unwrap())
        };
        let chain = CommandChain::adv3(500, q, Arc::new(RxOutput::new())).unwrap();
        chain.ops()[0].status().set(CmdStatus::DoneOk);
        chain.ops()[1].status().set(CmdStatus::DoneOk);
        let phase = AdvPhase::AwaitingHopFrom37.update(&chain);
        assert_eq!(phase, AdvPhase::OnChannel39);

        // Status words going back to a live value do not move the phase back
        chain.ops()[0].status().set(CmdStatus::Active);
        assert_eq!(phase.update(&chain), AdvPhase::OnChannel39);
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let mut cb = channel_sink(tx);
        let frame = Frame { data: &[1, 2], length: 2, timestamp: 5, rssi: -40, channel: 38 };
        cb(&frame);
        cb(&frame);
        assert_eq!(rx.len(), 1);
        let got = rx.recv().unwrap();
        assert_eq!(got.data, vec![1, 2]);
        assert_eq!(got.channel, 38);
    }
}
