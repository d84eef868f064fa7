// Copyright 2025-2026 CEMAXECUTER LLC

pub mod cmd;
pub mod dispatch;
pub mod error;
pub mod queue;
pub mod replay;
pub mod session;
pub mod sim;

use std::ops::BitOr;
use std::sync::Arc;

pub use cmd::CommandChain;
pub use dispatch::{CapturedFrame, Frame, FrameCallback};
pub use error::RadioError;
pub use session::{PoolConfig, RadioSession};

/// Radio core timer rate: 4 ticks per microsecond
pub const RADIO_TICKS_PER_US: u32 = 4;

/// Set of radio core event classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(pub u64);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    /// Last command in a chain finished
    pub const LAST_CMD_DONE: EventMask = EventMask(1 << 1);
    /// A receive entry was completed and handed to software
    pub const RX_ENTRY_DONE: EventMask = EventMask(1 << 23);

    pub fn contains(self, other: EventMask) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

/// Scheduling priority for a submitted command chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
}

/// Handle to a command chain accepted by the radio core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHandle(pub u32);

/// Immediate commands executed by the radio core outside the command queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// End the running chained operation early and continue with its successor
    HopTrigger,
    /// Gracefully end whatever operation is running
    Stop,
}

impl Directive {
    pub const HOP_TRIGGER_CODE: u32 = 0x0404_0001;
    pub const STOP_CODE: u32 = 0x0402_0001;

    pub fn code(self) -> u32 {
        match self {
            Directive::HopTrigger => Self::HOP_TRIGGER_CODE,
            Directive::Stop => Self::STOP_CODE,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            Self::HOP_TRIGGER_CODE => Some(Directive::HopTrigger),
            Self::STOP_CODE => Some(Directive::Stop),
            _ => None,
        }
    }
}

/// Event callback registered with a submitted chain. Invoked from the radio
/// core's event context, concurrently with the controlling thread.
pub type EventHandler = Arc<dyn Fn(EventMask) + Send + Sync>;

/// Common trait for radio core backends
pub trait RadioCore: Send {
    /// Acquire the radio hardware.
    fn open(&mut self) -> Result<(), RadioError>;

    /// Hand a command chain to the radio core for autonomous execution.
    /// Returns as soon as the chain is queued; `handler` is invoked for every
    /// event in `events` until the chain ends.
    fn run_async(
        &mut self,
        chain: Arc<CommandChain>,
        priority: Priority,
        handler: EventHandler,
        events: EventMask,
    ) -> Result<CommandHandle, RadioError>;

    /// Execute an immediate directive. Its effect is observed later through
    /// command status and events.
    fn run_immediate(&mut self, directive: Directive) -> Result<(), RadioError>;

    /// Release the radio hardware, aborting anything still running.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_codes_distinct() {
        assert_ne!(Directive::HopTrigger.code(), Directive::Stop.code());
        assert_eq!(Directive::from_code(0x0404_0001), Some(Directive::HopTrigger));
        assert_eq!(Directive::from_code(0x0402_0001), Some(Directive::Stop));
        assert_eq!(Directive::from_code(0), None);
    }

    #[test]
    fn test_event_mask() {
        let mask = EventMask::RX_ENTRY_DONE | EventMask::LAST_CMD_DONE;
        assert!(mask.contains(EventMask::RX_ENTRY_DONE));
        assert!(mask.contains(EventMask::LAST_CMD_DONE));
        assert!(!EventMask::LAST_CMD_DONE.contains(EventMask::RX_ENTRY_DONE));
        assert!(!mask.contains(EventMask::NONE));
    }
}
