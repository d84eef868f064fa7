// Copyright 2025-2026 CEMAXECUTER LLC

//! Radio session: owns the radio core, the receive entry pool and the
//! dispatcher, and exposes the receive operations.

use std::sync::Arc;

use bt_protocol::ble::BlePhy;
use bt_protocol::channel_to_freq;

use crate::cmd::{CommandChain, RxOutput, RxStats};
use crate::dispatch::{AdvPhase, Dispatcher, FrameCallback, ReceiveMode};
use crate::queue::{entry_buffer_size, EntryPool, MAX_LENGTH, NUM_APPENDED_BYTES, NUM_DATA_ENTRIES};
use crate::{CommandHandle, Directive, EventHandler, EventMask, Priority, RadioCore, RadioError};

/// Receive entry pool geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub entry_count: usize,
    pub max_length: usize,
    pub appended_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            entry_count: NUM_DATA_ENTRIES,
            max_length: MAX_LENGTH,
            appended_bytes: NUM_APPENDED_BYTES,
        }
    }
}

impl PoolConfig {
    fn build(&self) -> Result<EntryPool, RadioError> {
        let entry_size = self.max_length + self.appended_bytes;
        let total = entry_buffer_size(self.entry_count, self.max_length, self.appended_bytes);
        EntryPool::define(total, self.entry_count, entry_size)
    }
}

pub struct RadioSession<R: RadioCore> {
    core: R,
    open: bool,
    pool_config: PoolConfig,
    output: Arc<RxOutput>,
    dispatcher: Option<Arc<Dispatcher>>,
    chain: Option<Arc<CommandChain>>,
    cmd: Option<CommandHandle>,
}

impl<R: RadioCore> RadioSession<R> {
    pub fn new(core: R) -> Self {
        Self::with_pool_config(core, PoolConfig::default())
    }

    pub fn with_pool_config(core: R, pool_config: PoolConfig) -> Self {
        Self {
            core,
            open: false,
            pool_config,
            output: Arc::new(RxOutput::new()),
            dispatcher: None,
            chain: None,
            cmd: None,
        }
    }

    /// Acquire the radio and the receive entry pool. No-op if already open.
    pub fn open(&mut self) -> Result<(), RadioError> {
        if self.open {
            return Ok(());
        }

        self.core.open()?;
        let pool = match self.pool_config.build() {
            Ok(pool) => pool,
            Err(e) => {
                self.core.close();
                return Err(e);
            }
        };

        log::info!(
            "radio open: {} receive entries of {} bytes",
            pool.capacity(),
            pool.entry_size()
        );

        self.output = Arc::new(RxOutput::new());
        self.dispatcher = Some(Arc::new(Dispatcher::new(Arc::new(pool), self.output.clone())));
        self.open = true;
        Ok(())
    }

    /// Alias of [`RadioSession::open`]
    pub fn init(&mut self) -> Result<(), RadioError> {
        self.open()
    }

    fn dispatcher(&self) -> Result<Arc<Dispatcher>, RadioError> {
        match &self.dispatcher {
            Some(d) if self.open => Ok(d.clone()),
            _ => Err(RadioError::InvalidState),
        }
    }

    /// Receive on one channel until `timeout` (absolute radio ticks) or until
    /// stopped when `timeout` is [`TIMEOUT_NEVER`](crate::cmd::TIMEOUT_NEVER).
    pub fn recv_frames(
        &mut self,
        phy: BlePhy,
        channel: u8,
        access_address: u32,
        crc_init: u32,
        timeout: u32,
        callback: Option<FrameCallback>,
    ) -> Result<(), RadioError> {
        let dispatcher = self.dispatcher()?;
        let chain = CommandChain::single(
            phy,
            channel,
            access_address,
            crc_init,
            timeout,
            dispatcher.pool().clone(),
            self.output.clone(),
        )?;

        log::info!(
            "receiving on channel {} ({} MHz, {:?}, AA {:08X})",
            channel,
            channel_to_freq(channel).unwrap_or(0),
            phy,
            access_address
        );
        dispatcher.arm(ReceiveMode::Single { channel }, callback);
        self.submit(Arc::new(chain), &dispatcher)
    }

    /// Receive on the advertising channels: 37 until [`RadioSession::trigger_hop`],
    /// then 38 and 39 for roughly `hop_ticks` each.
    pub fn recv_adv3(&mut self, hop_ticks: u32, callback: Option<FrameCallback>) -> Result<(), RadioError> {
        let dispatcher = self.dispatcher()?;
        let chain = Arc::new(CommandChain::adv3(
            hop_ticks,
            dispatcher.pool().clone(),
            self.output.clone(),
        )?);

        log::info!("receiving on advertising channels, hop interval {} ticks", hop_ticks);
        dispatcher.arm(
            ReceiveMode::Adv3 { chain: chain.clone(), phase: AdvPhase::AwaitingHopFrom37 },
            callback,
        );
        self.submit(chain, &dispatcher)
    }

    fn submit(&mut self, chain: Arc<CommandChain>, dispatcher: &Arc<Dispatcher>) -> Result<(), RadioError> {
        let d = dispatcher.clone();
        let handler: EventHandler = Arc::new(move |events| d.handle_event(events));

        match self.core.run_async(chain.clone(), Priority::Normal, handler, EventMask::RX_ENTRY_DONE) {
            Ok(handle) => {
                log::debug!("chain of {} submitted as command {}", chain.len(), handle.0);
                self.chain = Some(chain);
                self.cmd = Some(handle);
                Ok(())
            }
            Err(e) => {
                log::error!("radio refused command chain: {}", e);
                dispatcher.disarm();
                Err(e)
            }
        }
    }

    /// End the running chained operation early and move to its successor.
    pub fn trigger_hop(&mut self) -> Result<(), RadioError> {
        self.dispatcher()?;
        log::debug!("hop trigger");
        self.core.run_immediate(Directive::HopTrigger)
    }

    /// Gracefully end whatever receive operation is running. Completion is
    /// observed through command status, not through this call.
    pub fn stop(&mut self) -> Result<(), RadioError> {
        self.dispatcher()?;
        log::debug!("stop");
        self.core.run_immediate(Directive::Stop)
    }

    /// Release the radio. Fails if the session is not open.
    pub fn close(&mut self) -> Result<(), RadioError> {
        let dispatcher = self.dispatcher()?;

        if self.chain.as_ref().map_or(false, |c| !c.is_complete()) {
            if let Err(e) = self.core.run_immediate(Directive::Stop) {
                log::warn!("stop before close failed: {}", e);
            }
        }
        self.core.close();
        dispatcher.disarm();

        log::info!(
            "radio closed: {} frames, {} entries dropped",
            dispatcher.frames(),
            dispatcher.dropped()
        );

        self.dispatcher = None;
        self.chain = None;
        self.cmd = None;
        self.open = false;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Output statistics of the current session
    pub fn stats(&self) -> Option<RxStats> {
        self.open.then(|| self.output.snapshot())
    }

    /// Chain most recently accepted by the radio core
    pub fn active_chain(&self) -> Option<&CommandChain> {
        self.chain.as_deref()
    }

    pub fn command_handle(&self) -> Option<CommandHandle> {
        self.cmd
    }

    /// Frames delivered and entries dropped by the dispatcher
    pub fn dispatch_counts(&self) -> Option<(u64, u64)> {
        self.dispatcher.as_ref().map(|d| (d.frames(), d.dropped()))
    }

    /// Advertising phase as last seen by the dispatcher
    pub fn adv_phase(&self) -> Option<AdvPhase> {
        self.dispatcher.as_ref().and_then(|d| d.adv_phase())
    }

    pub fn core(&self) -> &R {
        &self.core
    }
}

impl<R: RadioCore> Drop for RadioSession<R> {
    fn drop(&mut self) {
        if self.open {
            let _ = self.close();
        }
    }
}
