//! Fake hardware backends for running the driver on a host.
//!
//! [`RecordingBus`] stands in for the parallel peripheral and keeps a copy of
//! every transfer. [`SimulatedLoop`] stands in for the GCLK peripheral and
//! completes one segment of the loop per poll. Both walk the descriptor chains
//! they are given exactly as DMA would, so what they record is what the
//! hardware would have clocked out.
//!
//! Completions are delivered from the engines' `poll` hooks rather than from
//! an interrupt, so tests stay single threaded.

use alloc::boxed::Box;
use alloc::vec::Vec;

use portable_atomic::{AtomicU32, Ordering};

use crate::clock::{ClockLoopConfig, LoopControl, LoopPeripheral, SegmentHeader, USER_CONF_NEXT};
use crate::descriptor::DmaDescriptor;
use crate::greyscale::Word;
use crate::parallel::{ParallelBusConfig, ParallelOutput};
use crate::signal::CompletionFlag;
use crate::{DriverError, DriverSignals};

/// User register value reported by [`SimulatedLoop::setup`].
pub const SIMULATED_USER_REGISTER: u32 = 0x0000_0024;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

fn stamp() -> u32 {
    SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// Allocate a [`DriverSignals`] that lives for the rest of the program.
#[must_use]
pub fn leak_signals() -> &'static DriverSignals {
    Box::leak(Box::new(DriverSignals::new()))
}

/// Something a fake backend saw, stamped with a global sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A one-shot parallel transfer of `words` words was started.
    Sent {
        /// Sequence number
        at: u32,
        /// Words in the transfer
        words: usize,
    },
    /// The loop was started.
    Started {
        /// Sequence number
        at: u32,
    },
    /// A loop segment completed.
    Segment {
        /// Sequence number
        at: u32,
        /// Segment counter after completion
        count: u32,
    },
    /// The loop halted.
    Halted {
        /// Sequence number
        at: u32,
    },
}

impl Event {
    /// Sequence number of the event.
    #[must_use]
    pub fn at(&self) -> u32 {
        match *self {
            Self::Sent { at, .. }
            | Self::Started { at }
            | Self::Segment { at, .. }
            | Self::Halted { at } => at,
        }
    }
}

/// Collect the payload of a chain up to its end-of-frame descriptor.
///
/// # Safety
///
/// Every descriptor reachable from `head`, and the memory each points at,
/// must be alive.
unsafe fn collect_chain(head: &DmaDescriptor) -> (Vec<u8>, usize) {
    let mut bytes = Vec::new();
    let mut count = 0;
    let mut current: *const DmaDescriptor = head;
    while let Some(descriptor) = unsafe { current.as_ref() } {
        bytes.extend_from_slice(unsafe { descriptor.payload() });
        count += 1;
        if descriptor.is_eof() {
            break;
        }
        current = descriptor.next;
    }
    (bytes, count)
}

/// Parallel bus that records every transfer.
#[derive(Debug, Default)]
pub struct RecordingBus {
    config: Option<ParallelBusConfig>,
    transfers: Vec<Vec<Word>>,
    descriptor_counts: Vec<usize>,
    events: Vec<Event>,
    pending: bool,
    lose_completions: bool,
}

impl RecordingBus {
    /// A bus that completes every transfer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With `false`, transfers never complete, as if the interrupt was lost.
    pub fn set_deliver_completions(&mut self, deliver: bool) {
        self.lose_completions = !deliver;
    }

    /// Last configuration applied.
    #[must_use]
    pub fn config(&self) -> Option<&ParallelBusConfig> {
        self.config.as_ref()
    }

    /// Every transfer, oldest first.
    #[must_use]
    pub fn transfers(&self) -> &[Vec<Word>] {
        &self.transfers
    }

    /// The most recent transfer.
    #[must_use]
    pub fn last_transfer(&self) -> Option<&[Word]> {
        self.transfers.last().map(Vec::as_slice)
    }

    /// Number of descriptors in each transfer's chain.
    #[must_use]
    pub fn descriptor_counts(&self) -> &[usize] {
        &self.descriptor_counts
    }

    /// Transfer events.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Forget everything recorded so far.
    pub fn clear_transfers(&mut self) {
        self.transfers.clear();
        self.descriptor_counts.clear();
        self.events.clear();
    }
}

impl ParallelOutput for RecordingBus {
    fn configure(&mut self, config: &ParallelBusConfig) -> Result<(), DriverError> {
        self.config = Some(*config);
        Ok(())
    }

    fn start(&mut self, head: &DmaDescriptor) {
        // The engine keeps the chain and its buffer alive until completion.
        let (bytes, count) = unsafe { collect_chain(head) };
        let words: Vec<Word> = bytes
            .chunks_exact(2)
            .map(|pair| Word::from_bits(u16::from_ne_bytes([pair[0], pair[1]])))
            .collect();
        self.events.push(Event::Sent {
            at: stamp(),
            words: words.len(),
        });
        self.transfers.push(words);
        self.descriptor_counts.push(count);
        self.pending = true;
    }

    fn poll(&mut self, done: &CompletionFlag) {
        if self.pending && !self.lose_completions {
            self.pending = false;
            done.signal();
        }
    }
}

/// GCLK peripheral that completes one loop segment per poll.
#[derive(Debug)]
pub struct SimulatedLoop {
    config: Option<ClockLoopConfig>,
    head: *const DmaDescriptor,
    control: Option<&'static LoopControl>,
    running: bool,
    starts: u32,
    resets: u32,
    pattern_bytes: usize,
    header_data_len: u32,
    segment_log: Vec<u32>,
    events: Vec<Event>,
    lose_interrupts: bool,
}

impl SimulatedLoop {
    /// A stopped loop.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: None,
            head: core::ptr::null(),
            control: None,
            running: false,
            starts: 0,
            resets: 0,
            pattern_bytes: 0,
            header_data_len: 0,
            segment_log: Vec::new(),
            events: Vec::new(),
            lose_interrupts: false,
        }
    }

    /// With `false`, polling never completes a segment.
    pub fn set_deliver_interrupts(&mut self, deliver: bool) {
        self.lose_interrupts = !deliver;
    }

    /// Complete up to `count` segments, stopping early if the loop halts.
    pub fn run_segments(&mut self, count: usize) {
        for _ in 0..count {
            if !self.complete_segment() {
                break;
            }
        }
    }

    /// Finish the current segment the way the hardware does: count it, then
    /// reread the header's user word to decide whether to go on. Returns
    /// whether the loop is still running.
    fn complete_segment(&mut self) -> bool {
        let Some(control) = self.control else {
            return false;
        };
        if !self.running || self.head.is_null() {
            return false;
        }
        control.on_segment_done();
        let count = control.segment_count();
        self.segment_log.push(count);
        self.events.push(Event::Segment { at: stamp(), count });

        // The head descriptor points at the live header; word 1 is the user
        // register value.
        let user = unsafe { (*self.head).buffer.cast::<u32>().add(1).read_volatile() };
        if user & USER_CONF_NEXT == 0 {
            self.running = false;
            self.events.push(Event::Halted { at: stamp() });
            control.on_transfer_done();
        }
        self.running
    }

    /// Last configuration applied.
    #[must_use]
    pub fn config(&self) -> Option<&ClockLoopConfig> {
        self.config.as_ref()
    }

    /// Whether the simulated transfer is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of start commands issued.
    #[must_use]
    pub fn starts(&self) -> u32 {
        self.starts
    }

    /// Number of channel resets.
    #[must_use]
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// Pattern bytes found behind the header on the last start.
    #[must_use]
    pub fn pattern_bytes(&self) -> usize {
        self.pattern_bytes
    }

    /// Data length register value read from the header on the last start.
    #[must_use]
    pub fn header_data_len(&self) -> u32 {
        self.header_data_len
    }

    /// Segment counter value after each completed segment.
    #[must_use]
    pub fn segment_log(&self) -> &[u32] {
        &self.segment_log
    }

    /// Forget the segment log and events.
    pub fn clear_segment_log(&mut self) {
        self.segment_log.clear();
        self.events.clear();
    }

    /// Loop events.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }
}

impl Default for SimulatedLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopPeripheral for SimulatedLoop {
    fn setup(&mut self, config: &ClockLoopConfig) -> Result<u32, DriverError> {
        self.config = Some(*config);
        Ok(SIMULATED_USER_REGISTER)
    }

    fn reset(&mut self) {
        self.resets += 1;
    }

    fn start(&mut self, head: &DmaDescriptor, control: &'static LoopControl) {
        // The engine owns the chain for as long as the loop runs.
        let (bytes, _) = unsafe { collect_chain(head) };
        self.pattern_bytes = bytes.len().saturating_sub(SegmentHeader::SIZE);
        self.header_data_len = bytes
            .get(8..12)
            .map_or(0, |b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]));
        self.head = head;
        self.control = Some(control);
        self.running = true;
        self.starts += 1;
        self.events.push(Event::Started { at: stamp() });
    }

    fn poll(&mut self, _control: &LoopControl) {
        if !self.lose_interrupts {
            self.complete_segment();
        }
    }
}
