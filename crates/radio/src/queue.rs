// Copyright 2025-2026 CEMAXECUTER LLC

//! Receive entry pool: a fixed ring of data entries the radio core fills and
//! the dispatcher drains.
//!
//! Exactly one producer (the radio core) and one consumer (the receive
//! dispatcher). Ownership of each entry moves between them through its
//! atomic status word; there is no other locking.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::RadioError;

/// Constant header size of a generic data entry
pub const DATA_ENTRY_HEADER_SIZE: usize = 8;
/// Max length byte the radio will accept
pub const MAX_LENGTH: usize = 255;
/// Entries in the default pool
pub const NUM_DATA_ENTRIES: usize = 2;
/// Length byte plus one status byte
pub const NUM_APPENDED_BYTES: usize = 2;

const ENTRY_ALIGN: usize = 4;

// Entry status, owner in brackets
const ENTRY_PENDING: u8 = 0; // free (producer)
const ENTRY_BUSY: u8 = 1; // being written (producer)
const ENTRY_FINISHED: u8 = 2; // complete, not yet claimed (consumer)
const ENTRY_READING: u8 = 3; // claimed by a CompletedEntry (consumer)

const fn align_up(n: usize) -> usize {
    (n + ENTRY_ALIGN - 1) & !(ENTRY_ALIGN - 1)
}

/// Bytes needed to back `entries` entries of `max_len + appended` data bytes each.
pub const fn entry_buffer_size(entries: usize, max_len: usize, appended: usize) -> usize {
    entries * align_up(DATA_ENTRY_HEADER_SIZE + max_len + appended)
}

struct DataEntry {
    status: AtomicU8,
    len: AtomicUsize,
    data: UnsafeCell<Box<[u8]>>,
}

/// Fixed-capacity ring of receive buffers.
pub struct EntryPool {
    entries: Box<[DataEntry]>,
    entry_size: usize,
    write: AtomicUsize,
    read: AtomicUsize,
}

// SAFETY: entry data is only touched by the side that currently owns the entry
// per its status word. Producer writes happen between a Pending->Busy claim and a
// Release store of Finished; consumer reads happen between an Acquire
// Finished->Reading claim and a Release store of Pending.
unsafe impl Sync for EntryPool {}

impl EntryPool {
    /// Carve `entry_count` entries of `entry_size` data bytes out of a buffer of
    /// `total_size` bytes.
    pub fn define(total_size: usize, entry_count: usize, entry_size: usize) -> Result<Self, RadioError> {
        if entry_count == 0 || entry_size == 0 {
            return Err(RadioError::OutOfMemory);
        }
        let per_entry = align_up(DATA_ENTRY_HEADER_SIZE + entry_size);
        match per_entry.checked_mul(entry_count) {
            Some(needed) if needed <= total_size => {}
            _ => return Err(RadioError::OutOfMemory),
        }

        let entries = (0..entry_count)
            .map(|_| DataEntry {
                status: AtomicU8::new(ENTRY_PENDING),
                len: AtomicUsize::new(0),
                data: UnsafeCell::new(vec![0u8; entry_size].into_boxed_slice()),
            })
            .collect();

        Ok(Self {
            entries,
            entry_size,
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Entries not currently available to the producer.
    pub fn occupancy(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status.load(Ordering::Acquire) != ENTRY_PENDING)
            .count()
    }

    fn bump(&self, idx: usize) -> usize {
        let next = idx + 1;
        if next == self.entries.len() { 0 } else { next }
    }

    /// Producer side: copy `bytes` into the next free entry and mark it finished.
    /// Returns false if the ring is full or `bytes` does not fit an entry.
    pub fn push(&self, bytes: &[u8]) -> bool {
        if bytes.len() > self.entry_size {
            return false;
        }

        let idx = self.write.load(Ordering::Relaxed);
        let entry = &self.entries[idx];
        if entry
            .status
            .compare_exchange(ENTRY_PENDING, ENTRY_BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        // SAFETY: the Pending->Busy claim above gives the producer exclusive access.
        unsafe {
            let data = &mut *entry.data.get();
            data[..bytes.len()].copy_from_slice(bytes);
        }
        entry.len.store(bytes.len(), Ordering::Relaxed);
        self.write.store(self.bump(idx), Ordering::Relaxed);
        entry.status.store(ENTRY_FINISHED, Ordering::Release);
        true
    }

    /// Consumer side: the oldest completed entry, if any.
    ///
    /// The entry stays claimed until the returned guard is advanced or dropped;
    /// while it is claimed, further calls return None.
    pub fn next_completed(&self) -> Option<CompletedEntry<'_>> {
        let idx = self.read.load(Ordering::Relaxed);
        let entry = &self.entries[idx];
        entry
            .status
            .compare_exchange(ENTRY_FINISHED, ENTRY_READING, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;

        let len = entry.len.load(Ordering::Relaxed);
        // SAFETY: the Finished->Reading claim gives the consumer exclusive access
        // until the guard releases it.
        let bytes = unsafe { &(&*entry.data.get())[..len] };
        Some(CompletedEntry { pool: self, idx, bytes })
    }
}

/// A filled entry on loan to the consumer. Dropping it returns the buffer to
/// the radio core.
pub struct CompletedEntry<'a> {
    pool: &'a EntryPool,
    idx: usize,
    bytes: &'a [u8],
}

impl<'a> CompletedEntry<'a> {
    /// Raw entry contents as written by the radio core
    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    /// Packet length byte (byte 0)
    pub fn packet_len(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    /// Bytes 1..=len, or None if the length byte overruns the entry.
    pub fn payload(&self) -> Option<&[u8]> {
        let len = self.packet_len()? as usize;
        self.bytes.get(1..1 + len)
    }

    /// Return the entry to the radio core.
    pub fn advance(self) {}
}

impl Drop for CompletedEntry<'_> {
    fn drop(&mut self) {
        let entry = &self.pool.entries[self.idx];
        self.pool.read.store(self.pool.bump(self.idx), Ordering::Relaxed);
        entry.status.store(ENTRY_PENDING, Ordering::Release);
    }
}
