//! Free-running GCLK and row-address generator.
//!
//! The MBI5153 needs GCLK running continuously and the host has to step the
//! row-address lines in time with the chip's PWM sections. Neither carries
//! data, so a second peripheral (GPSPI2 in octal mode on the ESP32-S3) replays
//! a fixed byte pattern from a descriptor chain whose tail links back to its
//! head:
//!
//! ```text
//! +--------+   +-----------+       +-----------+
//! | header |-->| pattern 0 |-...-->| pattern n |--+
//! +--------+   +-----------+       +-----------+  |
//!     ^                                           |
//!     +-------------------------------------------+
//! ```
//!
//! The peripheral reads the [`SegmentHeader`] at the start of every loop. Its
//! user word decides whether the peripheral continues with another segment or
//! ends the transfer after this one, so pausing the clock is one store to
//! memory plus a wait for the end of the current segment.
//!
//! Each byte of the pattern is a [`ClockWord`]: bit 7 drives GCLK, bits 6..2
//! drive address lines A..E.

use alloc::vec::Vec;

use bitfield::bitfield;
use portable_atomic::{AtomicU32, Ordering};

use crate::descriptor::{ChainEnd, DescriptorChain, DmaDescriptor, DmaSegment};
use crate::signal::CompletionFlag;
use crate::{DriverError, MAX_SCAN_LINES};

/// GCLK pulses per PWM section. A 14-bit PWM cycle is 32 sections of 512.
pub const GCLKS_PER_SECTION: usize = 512;

/// Low cycles between sections while the row address changes.
pub const DEAD_TIME_CYCLES: usize = 2;

/// Largest single segment the peripheral accepts.
pub const MAX_SEGMENT_BYTES: usize = 32 * 1024;

/// Magic value the peripheral expects in the top nibble of a segment header.
pub const SEGMENT_MAGIC: u32 = 0xA << 28;

/// Header bitmap: the next word is loaded into the user register.
pub const HEADER_LOADS_USER: u32 = 1 << 3;

/// Header bitmap: the following word is loaded into the data length register.
pub const HEADER_LOADS_DATA_LEN: u32 = 1 << 6;

/// User register bit that keeps a segmented transfer going.
pub const USER_CONF_NEXT: u32 = 1 << 15;

/// Computes the number of bytes in the GCLK/address pattern.
#[must_use]
pub const fn compute_pattern_len(scan_lines: usize) -> usize {
    scan_lines * (GCLKS_PER_SECTION * 2 + DEAD_TIME_CYCLES)
}

/// Checks the datasheet rule that GCLK runs faster than 20% of DCLK.
///
/// # Errors
///
/// Returns [`DriverError::ClockRatio`] when it does not.
pub fn check_clock_ratio(gclk_hz: u32, dclk_hz: u32) -> Result<(), DriverError> {
    if u64::from(gclk_hz) * 5 > u64::from(dclk_hz) {
        Ok(())
    } else {
        Err(DriverError::ClockRatio { gclk_hz, dclk_hz })
    }
}

bitfield! {
    /// One byte of the octal GCLK/address pattern.
    ///
    /// The bit layout is as follows:
    /// - Bit 7: GCLK
    /// - Bits 6-2: Row address (A on bit 2)
    /// - Bits 1-0: Unused
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct ClockWord(u8);
    impl Debug;
    pub gclk, set_gclk: 7;
    pub u8, addr, set_addr: 6, 2;
}

impl ClockWord {
    /// Word driving the given GCLK level and row address.
    #[must_use]
    pub fn new(gclk: bool, addr: u8) -> Self {
        let mut word = Self(0);
        word.set_gclk(gclk);
        word.set_addr(addr);
        word
    }
}

/// Fill `pattern` with the GCLK/address sequence for `scan_lines` rows.
///
/// Every row gets [`GCLKS_PER_SECTION`] high/low pulse pairs followed by
/// [`DEAD_TIME_CYCLES`] low cycles during which the address advances. The
/// pattern ends with GCLK low, which is where the peripheral stops.
pub fn fill_pattern(pattern: &mut [ClockWord], scan_lines: usize) {
    let row_len = GCLKS_PER_SECTION * 2 + DEAD_TIME_CYCLES;
    for (row, chunk) in pattern.chunks_exact_mut(row_len).take(scan_lines).enumerate() {
        let addr = row as u8;
        let next = ((row + 1) % scan_lines) as u8;
        let (pulses, dead) = chunk.split_at_mut(GCLKS_PER_SECTION * 2);
        for pair in pulses.chunks_exact_mut(2) {
            pair[0] = ClockWord::new(true, addr);
            pair[1] = ClockWord::new(false, addr);
        }
        dead.fill(ClockWord::new(false, next));
    }
}

/// The three words the peripheral reloads before every segment.
#[derive(Debug)]
#[repr(C)]
pub struct SegmentHeader {
    magic: u32,
    user: AtomicU32,
    data_len: AtomicU32,
}

impl SegmentHeader {
    /// Size in bytes as read by DMA.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    const fn new() -> Self {
        Self {
            magic: SEGMENT_MAGIC | HEADER_LOADS_USER | HEADER_LOADS_DATA_LEN,
            user: AtomicU32::new(USER_CONF_NEXT),
            data_len: AtomicU32::new(0),
        }
    }

    /// Magic and register bitmap word.
    #[must_use]
    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// User register value loaded for the next segment.
    #[must_use]
    pub fn user(&self) -> u32 {
        self.user.load(Ordering::Acquire)
    }

    /// Data length register value: segment bits minus one.
    #[must_use]
    pub fn data_len(&self) -> u32 {
        self.data_len.load(Ordering::Acquire)
    }
}

/// State of the looping transfer shared with the clock peripheral's
/// interrupt handler.
///
/// Lives in [`DriverSignals`](crate::DriverSignals). The interrupt handler
/// calls [`on_segment_done`](Self::on_segment_done) for every
/// segment-complete interrupt and [`on_transfer_done`](Self::on_transfer_done)
/// when the transfer ends.
#[derive(Debug)]
pub struct LoopControl {
    header: SegmentHeader,
    user_continue: AtomicU32,
    user_stop: AtomicU32,
    segments: AtomicU32,
    halted: CompletionFlag,
}

impl LoopControl {
    /// New control block with the header set to continue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            header: SegmentHeader::new(),
            user_continue: AtomicU32::new(USER_CONF_NEXT),
            user_stop: AtomicU32::new(0),
            segments: AtomicU32::new(0),
            halted: CompletionFlag::new(),
        }
    }

    /// Derive the continue/stop user values from the peripheral's current
    /// user register and record the segment length.
    pub fn configure(&self, user_base: u32, segment_bytes: usize) {
        self.user_continue
            .store(user_base | USER_CONF_NEXT, Ordering::Relaxed);
        self.user_stop
            .store(user_base & !USER_CONF_NEXT, Ordering::Relaxed);
        let bits = (segment_bytes * 8).saturating_sub(1) as u32;
        self.header.data_len.store(bits, Ordering::Release);
    }

    /// Select whether the peripheral loads another segment.
    pub fn set_continue(&self, keep_going: bool) {
        let user = if keep_going {
            self.user_continue.load(Ordering::Relaxed)
        } else {
            self.user_stop.load(Ordering::Relaxed)
        };
        self.header.user.store(user, Ordering::Release);
    }

    /// Whether the header currently says continue.
    #[must_use]
    pub fn continues(&self) -> bool {
        self.header.user() & USER_CONF_NEXT != 0
    }

    /// Segment-complete interrupt hook.
    pub fn on_segment_done(&self) {
        self.segments.fetch_add(1, Ordering::AcqRel);
    }

    /// Transfer-complete interrupt hook.
    pub fn on_transfer_done(&self) {
        self.halted.signal();
    }

    /// Segments completed since power-up.
    #[must_use]
    pub fn segment_count(&self) -> u32 {
        self.segments.load(Ordering::Acquire)
    }

    /// The header the peripheral reads.
    #[must_use]
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Flag signalled when the loop has halted.
    #[must_use]
    pub fn halted(&self) -> &CompletionFlag {
        &self.halted
    }

    fn header_segment(&self) -> DmaSegment {
        DmaSegment::from_raw(
            core::ptr::from_ref(&self.header).cast::<u8>(),
            SegmentHeader::SIZE,
        )
    }
}

impl Default for LoopControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Pins and clock of the GCLK/address peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockLoopConfig {
    /// GPIOs for address lines A..E
    pub address_pins: [u8; 5],
    /// GPIO for GCLK
    pub gclk_pin: u8,
    /// Peripheral bit clock. GCLK runs at half this rate.
    pub clock_hz: u32,
}

impl ClockLoopConfig {
    /// 5 MHz bit clock, 2.5 MHz GCLK.
    pub const DEFAULT_CLOCK_HZ: u32 = 5_000_000;

    /// Config with the default clock.
    #[must_use]
    pub const fn new(address_pins: [u8; 5], gclk_pin: u8) -> Self {
        Self {
            address_pins,
            gclk_pin,
            clock_hz: Self::DEFAULT_CLOCK_HZ,
        }
    }

    /// GCLK frequency produced by the pattern.
    #[must_use]
    pub const fn gclk_hz(&self) -> u32 {
        self.clock_hz / 2
    }
}

impl Default for ClockLoopConfig {
    fn default() -> Self {
        Self::new([0; 5], 0)
    }
}

/// Hardware side of the looping transfer.
pub trait LoopPeripheral {
    /// Configure octal output on the given pins and return the peripheral's
    /// user register value, from which the header's continue/stop words are
    /// derived.
    ///
    /// # Errors
    ///
    /// Backend specific; the engine passes the error through.
    fn setup(&mut self, config: &ClockLoopConfig) -> Result<u32, DriverError>;

    /// Reset the DMA channel and clear the output FIFO.
    fn reset(&mut self);

    /// Enable segmented transfers, point the DMA channel at `head` and issue
    /// the start command. Must return immediately. `control` is the block
    /// the interrupt handler reports to.
    fn start(&mut self, head: &DmaDescriptor, control: &'static LoopControl);

    /// Called on every spin while the engine waits for the loop to halt.
    fn poll(&mut self, _control: &LoopControl) {}
}

/// Keeps GCLK and the row address running from a self-looping transfer.
///
/// [`start`](Self::start) and [`stop`](Self::stop) must alternate. The
/// [`FrameScheduler`](crate::scheduler::FrameScheduler) guarantees that.
#[derive(Debug)]
pub struct ClockAddressEngine<C> {
    peripheral: C,
    control: &'static LoopControl,
    pattern: Vec<ClockWord>,
    chain: DescriptorChain,
    spin_limit: Option<u32>,
    running: bool,
}

impl<C: LoopPeripheral> ClockAddressEngine<C> {
    /// Create an engine. `control` is shared with the interrupt handler.
    #[must_use]
    pub const fn new(peripheral: C, control: &'static LoopControl, spin_limit: Option<u32>) -> Self {
        Self {
            peripheral,
            control,
            pattern: Vec::new(),
            chain: DescriptorChain::new(),
            spin_limit,
            running: false,
        }
    }

    /// Build the pattern for `scan_lines` rows, configure the peripheral and
    /// link the looping chain.
    ///
    /// # Errors
    ///
    /// [`DriverError::SegmentTooLarge`] if the pattern does not fit one
    /// segment, [`DriverError::OutOfDmaMemory`] if allocation fails, or
    /// whatever the backend reports.
    pub fn setup(&mut self, config: &ClockLoopConfig, scan_lines: usize) -> Result<(), DriverError> {
        let scan_lines = scan_lines.clamp(1, MAX_SCAN_LINES);
        let len = compute_pattern_len(scan_lines);
        if len > MAX_SEGMENT_BYTES {
            error!("GCLK pattern of {} bytes does not fit one segment", len);
            return Err(DriverError::SegmentTooLarge {
                bytes: len,
                max: MAX_SEGMENT_BYTES,
            });
        }

        let mut pattern = Vec::new();
        pattern
            .try_reserve_exact(len)
            .map_err(|_| DriverError::OutOfDmaMemory { requested: len })?;
        pattern.resize(len, ClockWord::default());
        fill_pattern(&mut pattern, scan_lines);
        self.pattern = pattern;
        info!("GCLK pattern is {} bytes for {} scan lines", len, scan_lines);

        let user_base = self.peripheral.setup(config)?;
        self.control.configure(user_base, len);
        self.control.set_continue(true);
        let segments = [
            self.control.header_segment(),
            DmaSegment::from_bytes(self.pattern_bytes()),
        ];
        self.chain.link(&segments, ChainEnd::LoopToHead)?;
        debug!("GCLK loop uses {} descriptors", self.chain.len());
        Ok(())
    }

    fn pattern_bytes(&self) -> &[u8] {
        // ClockWord is a transparent u8.
        unsafe { core::slice::from_raw_parts(self.pattern.as_ptr().cast::<u8>(), self.pattern.len()) }
    }

    /// Reset the channel, set the header to continue and start the loop.
    /// Returns without waiting.
    ///
    /// # Errors
    ///
    /// [`DriverError::NotReady`] if [`setup`](Self::setup) has not run.
    pub fn start(&mut self) -> Result<(), DriverError> {
        debug_assert!(!self.running, "clock loop started twice");
        let Some(head) = self.chain.head() else {
            return Err(DriverError::NotReady);
        };
        self.peripheral.reset();
        self.control.set_continue(true);
        self.control.halted().arm();
        self.peripheral.start(head, self.control);
        self.running = true;
        trace!("clock loop started");
        Ok(())
    }

    /// Reset the channel and start the loop again, whatever state it was
    /// last seen in. Recovers from a [`stop`](Self::stop) that timed out.
    ///
    /// # Errors
    ///
    /// [`DriverError::NotReady`] if [`setup`](Self::setup) has not run.
    pub fn restart(&mut self) -> Result<(), DriverError> {
        if self.running {
            debug!("restarting clock loop");
        }
        self.running = false;
        self.start()
    }

    /// Set the header to stop and block until the current segment has
    /// finished.
    ///
    /// # Errors
    ///
    /// [`DriverError::Timeout`] if a spin limit is set and exceeded. The
    /// header is set back to continue so GCLK keeps running, and the engine
    /// still counts as running.
    pub fn stop(&mut self) -> Result<(), DriverError> {
        debug_assert!(self.running, "clock loop stopped twice");
        let control = self.control;
        control.set_continue(false);
        let peripheral = &mut self.peripheral;
        if let Err(err) = control.halted().wait(self.spin_limit, || peripheral.poll(control)) {
            control.set_continue(true);
            return Err(err);
        }
        self.running = false;
        trace!("clock loop stopped after {} segments", control.segment_count());
        Ok(())
    }

    /// Whether the loop has been started and not stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The GCLK/address pattern.
    #[must_use]
    pub fn pattern(&self) -> &[ClockWord] {
        &self.pattern
    }

    /// Segments completed since power-up.
    #[must_use]
    pub fn segment_count(&self) -> u32 {
        self.control.segment_count()
    }

    /// The hardware backend.
    #[must_use]
    pub fn peripheral(&self) -> &C {
        &self.peripheral
    }

    /// The hardware backend, mutably.
    pub fn peripheral_mut(&mut self) -> &mut C {
        &mut self.peripheral
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;
    use crate::host::{leak_signals, SimulatedLoop};

    fn engine(scan_lines: usize) -> ClockAddressEngine<SimulatedLoop> {
        let signals = leak_signals();
        let mut engine = ClockAddressEngine::new(SimulatedLoop::new(), &signals.clock_loop, None);
        engine.setup(&ClockLoopConfig::default(), scan_lines).unwrap();
        engine
    }

    #[test]
    fn test_clock_word_layout() {
        let word = ClockWord::new(true, 0b10101);
        assert_eq!(word.0, 0b1101_0100);
        assert!(word.gclk());
        assert_eq!(word.addr(), 0b10101);
        assert_eq!(ClockWord::new(false, 31).0, 0b0111_1100);
    }

    #[test]
    fn test_compute_pattern_len() {
        assert_eq!(compute_pattern_len(1), 1026);
        assert_eq!(compute_pattern_len(20), 20_520);
        assert!(compute_pattern_len(31) <= MAX_SEGMENT_BYTES);
        assert!(compute_pattern_len(32) > MAX_SEGMENT_BYTES);
    }

    #[test]
    fn test_fill_pattern() {
        let mut pattern = std::vec![ClockWord::default(); compute_pattern_len(3)];
        fill_pattern(&mut pattern, 3);

        let row_len = GCLKS_PER_SECTION * 2 + DEAD_TIME_CYCLES;
        for (row, chunk) in pattern.chunks_exact(row_len).enumerate() {
            let pulses = chunk[..GCLKS_PER_SECTION * 2]
                .iter()
                .filter(|w| w.gclk())
                .count();
            assert_eq!(pulses, GCLKS_PER_SECTION);
            assert!(chunk[..GCLKS_PER_SECTION * 2]
                .iter()
                .all(|w| usize::from(w.addr()) == row));
            assert!(chunk[GCLKS_PER_SECTION * 2..].iter().all(|w| !w.gclk()));
        }
        // dead time of the last row already shows row 0
        assert_eq!(pattern.last().unwrap().addr(), 0);
        assert!(!pattern.last().unwrap().gclk());
        assert_eq!(pattern[row_len - 1].addr(), 1);
    }

    #[test]
    fn test_check_clock_ratio() {
        assert_eq!(check_clock_ratio(2_500_000, 6_956_521), Ok(()));
        assert_eq!(
            check_clock_ratio(1_000_000, 6_956_521),
            Err(DriverError::ClockRatio {
                gclk_hz: 1_000_000,
                dclk_hz: 6_956_521
            })
        );
        // exactly 20% is not enough
        assert!(check_clock_ratio(2_000_000, 10_000_000).is_err());
    }

    #[test]
    fn test_loop_control_header() {
        let control = LoopControl::new();
        assert_eq!(control.header().magic(), 0xA000_0048);
        assert!(control.continues());

        control.configure(0x0000_0024, 100);
        assert_eq!(control.header().data_len(), 799);
        control.set_continue(false);
        assert!(!control.continues());
        assert_eq!(control.header().user(), 0x24);
        control.set_continue(true);
        assert_eq!(control.header().user(), 0x24 | USER_CONF_NEXT);
    }

    #[test]
    fn test_header_is_three_words() {
        assert_eq!(SegmentHeader::SIZE, 12);
    }

    #[test]
    fn test_setup_links_loop() {
        let engine = engine(20);
        assert_eq!(engine.pattern().len(), 20_520);
        let peripheral = engine.peripheral();
        assert_eq!(peripheral.config(), Some(&ClockLoopConfig::default()));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_setup_rejects_oversized_pattern() {
        let signals = leak_signals();
        let mut engine = ClockAddressEngine::new(SimulatedLoop::new(), &signals.clock_loop, None);
        assert_eq!(
            engine.setup(&ClockLoopConfig::default(), 32),
            Err(DriverError::SegmentTooLarge {
                bytes: 32_832,
                max: MAX_SEGMENT_BYTES
            })
        );
    }

    #[test]
    fn test_start_before_setup() {
        let signals = leak_signals();
        let mut engine = ClockAddressEngine::new(SimulatedLoop::new(), &signals.clock_loop, None);
        assert_eq!(engine.start(), Err(DriverError::NotReady));
    }

    #[test]
    fn test_start_reads_header_through_chain() {
        let mut engine = engine(20);
        engine.start().unwrap();
        assert!(engine.is_running());
        let peripheral = engine.peripheral();
        assert_eq!(peripheral.starts(), 1);
        assert_eq!(peripheral.resets(), 1);
        assert_eq!(peripheral.pattern_bytes(), 20_520);
        assert_eq!(peripheral.header_data_len(), 20_520 * 8 - 1);
    }

    #[test]
    fn test_stop_waits_for_segment_boundary() {
        let mut engine = engine(4);
        engine.start().unwrap();
        engine.peripheral_mut().run_segments(5);
        assert_eq!(engine.segment_count(), 5);
        engine.stop().unwrap();
        assert!(!engine.is_running());
        assert!(!engine.peripheral().is_running());
        // the segment in flight when stop was requested completes
        assert_eq!(engine.segment_count(), 6);
    }

    #[test]
    fn test_segment_counter_continuous_across_restart() {
        let mut engine = engine(4);
        let mut log = Vec::new();
        for _ in 0..3 {
            engine.start().unwrap();
            engine.peripheral_mut().run_segments(3);
            engine.stop().unwrap();
            log.extend_from_slice(engine.peripheral().segment_log());
            engine.peripheral_mut().clear_segment_log();
        }
        let expected: Vec<u32> = (1..=12).collect();
        assert_eq!(log, expected);
        assert_eq!(engine.segment_count(), 12);
    }

    #[test]
    fn test_stop_times_out_when_loop_never_halts() {
        let signals = leak_signals();
        let mut peripheral = SimulatedLoop::new();
        peripheral.set_deliver_interrupts(false);
        let mut engine = ClockAddressEngine::new(peripheral, &signals.clock_loop, Some(50));
        engine.setup(&ClockLoopConfig::default(), 2).unwrap();
        engine.start().unwrap();
        assert_eq!(engine.stop(), Err(DriverError::Timeout));
        assert!(engine.is_running());
        // the loop is told to keep going rather than left to halt unseen
        assert!(signals.clock_loop.continues());
        engine.peripheral_mut().run_segments(1);
        assert!(engine.peripheral().is_running());
    }

    #[test]
    fn test_restart_after_failed_stop() {
        let signals = leak_signals();
        let mut peripheral = SimulatedLoop::new();
        peripheral.set_deliver_interrupts(false);
        let mut engine = ClockAddressEngine::new(peripheral, &signals.clock_loop, Some(50));
        engine.setup(&ClockLoopConfig::default(), 2).unwrap();
        engine.start().unwrap();
        assert_eq!(engine.stop(), Err(DriverError::Timeout));

        engine.peripheral_mut().set_deliver_interrupts(true);
        engine.restart().unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.peripheral().starts(), 2);
        assert_eq!(engine.peripheral().resets(), 2);
        assert!(signals.clock_loop.continues());

        engine.peripheral_mut().run_segments(2);
        assert!(engine.peripheral().is_running());
        assert_eq!(engine.stop(), Ok(()));
        assert!(!engine.peripheral().is_running());
    }

    #[test]
    fn test_restart_before_setup() {
        let signals = leak_signals();
        let mut engine = ClockAddressEngine::new(SimulatedLoop::new(), &signals.clock_loop, None);
        assert_eq!(engine.restart(), Err(DriverError::NotReady));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_gclk_hz() {
        assert_eq!(ClockLoopConfig::default().gclk_hz(), 2_500_000);
    }
}
