//! Per-frame choreography of the two DMA engines.
//!
//! A frame goes through these steps, in this order:
//!
//! 1. Set LE on the last bit of every 16 × chain block of the greyscale
//!    buffer.
//! 2. Send the buffer. GCLK keeps running, which gives the chips far more than
//!    the 50 GCLKs they need to move each latched block into SRAM.
//! 3. Stop GCLK. The loop halts at the end of its pattern with GCLK low.
//!    If it never reports halting, the header is set back to continue and
//!    the frame fails; [`FrameScheduler::boot`] restarts the loop.
//! 4. Send vsync. All chips swap to the new frame.
//! 5. Restart GCLK.
//! 6. Send any pending brightness change.
//! 7. Zero the buffer for the next frame.
//!
//! Data, stop, vsync, start is the order the chip's timing rules require.

use crate::clock::{ClockAddressEngine, LoopPeripheral};
use crate::config::ConfigProgrammer;
use crate::greyscale::GreyscaleBuffer;
use crate::parallel::{ParallelDataEngine, ParallelOutput};
use crate::{DriverError, PanelLayout};

/// Where the scheduler is in the frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameState {
    /// GCLK is running and the buffer may be written.
    #[default]
    ClockRunning,
    /// The greyscale buffer is in flight.
    SendingData,
    /// Waiting for the GCLK loop to halt.
    StoppingClock,
    /// GCLK is stopped and vsync is in flight.
    SendingVsync,
}

/// Owns the greyscale buffer and both engines, and runs frames.
///
/// Pixel writes go through [`buffer_mut`](Self::buffer_mut), which needs
/// `&mut self`, so the buffer can not be written while a frame is being sent.
#[derive(Debug)]
pub struct FrameScheduler<L: PanelLayout, P, C> {
    buffer: GreyscaleBuffer<L>,
    data: ParallelDataEngine<P>,
    clock: ClockAddressEngine<C>,
    programmer: ConfigProgrammer,
    state: FrameState,
    frames: u32,
}

impl<L, P, C> FrameScheduler<L, P, C>
where
    L: PanelLayout,
    P: ParallelOutput,
    C: LoopPeripheral,
{
    /// Assemble a scheduler. Both engines must already be configured.
    #[must_use]
    pub fn new(
        buffer: GreyscaleBuffer<L>,
        data: ParallelDataEngine<P>,
        clock: ClockAddressEngine<C>,
        programmer: ConfigProgrammer,
    ) -> Self {
        Self {
            buffer,
            data,
            clock,
            programmer,
            state: FrameState::ClockRunning,
            frames: 0,
        }
    }

    /// Restart GCLK and run the chip boot sequence.
    ///
    /// Also recovers from a frame that failed part way through. The loop is
    /// always reset and restarted, since a timed-out stop leaves its real
    /// state unknown.
    ///
    /// # Errors
    ///
    /// Any error from either engine.
    pub fn boot(&mut self) -> Result<(), DriverError> {
        self.clock.restart()?;
        self.state = FrameState::ClockRunning;
        self.programmer.boot(&mut self.data, &mut self.buffer)
    }

    /// Display the contents of the buffer and clear it.
    ///
    /// # Errors
    ///
    /// [`DriverError::NotReady`] if the previous frame failed and
    /// [`boot`](Self::boot) has not been run since, or any error from either
    /// engine. A failed frame leaves [`state`](Self::state) where it failed.
    pub fn run_frame(&mut self) -> Result<(), DriverError> {
        if self.state != FrameState::ClockRunning || !self.clock.is_running() {
            return Err(DriverError::NotReady);
        }

        self.buffer.apply_data_latches();
        self.state = FrameState::SendingData;
        self.data.send_buffer(&self.buffer)?;

        self.state = FrameState::StoppingClock;
        self.clock.stop()?;
        self.state = FrameState::SendingVsync;
        ConfigProgrammer::vsync(&mut self.data, &mut self.buffer)?;
        self.clock.start()?;

        self.programmer
            .apply_pending(&mut self.data, &mut self.buffer)?;
        self.buffer.clear();
        self.state = FrameState::ClockRunning;
        self.frames = self.frames.wrapping_add(1);
        trace!("frame {} done", self.frames);
        Ok(())
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Whether the buffer may be written. False after a frame failed until
    /// [`boot`](Self::boot) has run, since DMA may still be reading it.
    #[must_use]
    pub fn is_building(&self) -> bool {
        self.state == FrameState::ClockRunning
    }

    /// Frames displayed since creation.
    #[must_use]
    pub fn frame_count(&self) -> u32 {
        self.frames
    }

    /// The greyscale buffer.
    #[must_use]
    pub fn buffer(&self) -> &GreyscaleBuffer<L> {
        &self.buffer
    }

    /// The greyscale buffer, for pixel writes.
    ///
    /// Does not check [`is_building`](Self::is_building); callers writing
    /// after a failed frame must [`boot`](Self::boot) first.
    pub fn buffer_mut(&mut self) -> &mut GreyscaleBuffer<L> {
        &mut self.buffer
    }

    /// The configuration programmer.
    #[must_use]
    pub fn programmer(&self) -> &ConfigProgrammer {
        &self.programmer
    }

    /// The configuration programmer, mutably.
    pub fn programmer_mut(&mut self) -> &mut ConfigProgrammer {
        &mut self.programmer
    }

    /// The parallel data engine.
    #[must_use]
    pub fn data(&self) -> &ParallelDataEngine<P> {
        &self.data
    }

    /// The parallel data engine, mutably.
    pub fn data_mut(&mut self) -> &mut ParallelDataEngine<P> {
        &mut self.data
    }

    /// The clock engine.
    #[must_use]
    pub fn clock(&self) -> &ClockAddressEngine<C> {
        &self.clock
    }

    /// The clock engine, mutably.
    pub fn clock_mut(&mut self) -> &mut ClockAddressEngine<C> {
        &mut self.clock
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;
    use crate::clock::ClockLoopConfig;
    use crate::config::{ChipSettings, VSYNC_WORDS};
    use crate::greyscale::Word;
    use crate::host::{leak_signals, Event, RecordingBus, SimulatedLoop};
    use crate::{DriverSignals, Mbi5153Panel78};

    type TestScheduler = FrameScheduler<Mbi5153Panel78, RecordingBus, SimulatedLoop>;

    fn scheduler_with(signals: &'static DriverSignals) -> TestScheduler {
        let buffer = GreyscaleBuffer::new().unwrap();
        let data = ParallelDataEngine::new(RecordingBus::new(), &signals.transfer_done, None);
        let mut clock = ClockAddressEngine::new(SimulatedLoop::new(), &signals.clock_loop, None);
        clock.setup(&ClockLoopConfig::default(), 20).unwrap();
        let mut scheduler =
            FrameScheduler::new(buffer, data, clock, ConfigProgrammer::new(ChipSettings::default(), 128));
        scheduler.boot().unwrap();
        scheduler.data_mut().output_mut().clear_transfers();
        scheduler
    }

    fn scheduler() -> TestScheduler {
        scheduler_with(leak_signals())
    }

    #[test]
    fn test_boot_starts_clock() {
        let scheduler = scheduler();
        assert!(scheduler.clock().is_running());
        assert_eq!(scheduler.state(), FrameState::ClockRunning);
        assert_eq!(scheduler.frame_count(), 0);
    }

    #[test]
    fn test_run_frame_sends_data_then_vsync() {
        let mut scheduler = scheduler();
        scheduler.buffer_mut().set_pixel(0, 0, 255, 0, 0);
        scheduler.run_frame().unwrap();

        let sent = scheduler.data().output().transfers();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].len(), Mbi5153Panel78::BUFFER_WORDS);
        assert_eq!(sent[1].len(), VSYNC_WORDS);

        assert_eq!(scheduler.state(), FrameState::ClockRunning);
        assert_eq!(scheduler.frame_count(), 1);
        assert!(scheduler.clock().is_running());
        assert!(scheduler.buffer().words().iter().all(|w| *w == Word::BLANK));
    }

    #[test]
    fn test_frame_ordering() {
        let signals = leak_signals();
        let mut scheduler = scheduler_with(signals);
        scheduler.run_frame().unwrap();

        // both fakes stamp events from one global sequence
        let data_events: Vec<Event> = scheduler.data().output().events().to_vec();
        let clock_events: Vec<Event> = scheduler.clock().peripheral().events().to_vec();
        let data_sent = data_events[0].at();
        let vsync_sent = data_events[1].at();
        let stopped = clock_events
            .iter()
            .find(|e| matches!(e, Event::Halted { .. }))
            .map(Event::at)
            .unwrap();
        let restarted = clock_events
            .iter()
            .filter(|e| matches!(e, Event::Started { .. }))
            .map(Event::at)
            .last()
            .unwrap();
        assert!(data_sent < stopped);
        assert!(stopped < vsync_sent);
        assert!(vsync_sent < restarted);
    }

    #[test]
    fn test_data_latch_at_end_of_each_block() {
        let mut scheduler = scheduler();
        scheduler.run_frame().unwrap();
        let frame = &scheduler.data().output().transfers()[0];
        for (i, block) in frame.chunks_exact(80).enumerate() {
            let latched: Vec<usize> = block
                .iter()
                .enumerate()
                .filter(|(_, w)| w.latch())
                .map(|(i, _)| i)
                .collect();
            assert_eq!(latched, [79], "block {i}");
        }
    }

    #[test]
    fn test_brightness_applied_after_vsync() {
        let mut scheduler = scheduler();
        scheduler.programmer_mut().set_brightness(255);
        scheduler.run_frame().unwrap();

        let sent = scheduler.data().output().transfers();
        let lengths: Vec<usize> = sent.iter().map(Vec::len).collect();
        assert_eq!(lengths, [Mbi5153Panel78::BUFFER_WORDS, VSYNC_WORDS, 16, 80]);
        assert!(!scheduler.programmer().is_pending());
        assert!(scheduler.buffer().words().iter().all(|w| *w == Word::BLANK));
    }

    #[test]
    fn test_failed_frame_requires_boot() {
        let signals = leak_signals();
        let mut scheduler = scheduler_with(signals);
        let mut bus = RecordingBus::new();
        bus.set_deliver_completions(false);
        *scheduler.data_mut() = ParallelDataEngine::new(bus, &signals.transfer_done, Some(10));
        assert_eq!(scheduler.run_frame(), Err(DriverError::Timeout));
        assert_eq!(scheduler.state(), FrameState::SendingData);
        assert!(!scheduler.is_building());
        assert_eq!(scheduler.run_frame(), Err(DriverError::NotReady));

        scheduler.data_mut().output_mut().set_deliver_completions(true);
        scheduler.boot().unwrap();
        assert_eq!(scheduler.run_frame(), Ok(()));
    }

    #[test]
    fn test_boot_recovers_from_failed_clock_stop() {
        let signals = leak_signals();
        let buffer = GreyscaleBuffer::<Mbi5153Panel78>::new().unwrap();
        let data = ParallelDataEngine::new(RecordingBus::new(), &signals.transfer_done, None);
        let mut clock = ClockAddressEngine::new(SimulatedLoop::new(), &signals.clock_loop, Some(50));
        clock.setup(&ClockLoopConfig::default(), 20).unwrap();
        let mut scheduler =
            FrameScheduler::new(buffer, data, clock, ConfigProgrammer::new(ChipSettings::default(), 128));
        scheduler.boot().unwrap();

        scheduler.clock_mut().peripheral_mut().set_deliver_interrupts(false);
        assert_eq!(scheduler.run_frame(), Err(DriverError::Timeout));
        assert_eq!(scheduler.state(), FrameState::StoppingClock);
        assert!(!scheduler.is_building());

        scheduler.clock_mut().peripheral_mut().set_deliver_interrupts(true);
        let starts = scheduler.clock().peripheral().starts();
        scheduler.boot().unwrap();
        assert_eq!(scheduler.clock().peripheral().starts(), starts + 1);
        assert!(signals.clock_loop.continues());
        assert!(scheduler.clock().is_running());
        assert!(scheduler.is_building());

        scheduler.clock_mut().peripheral_mut().run_segments(1);
        assert!(scheduler.clock().peripheral().is_running());
        assert_eq!(scheduler.run_frame(), Ok(()));
    }

    #[test]
    fn test_segment_counter_advances_across_frames() {
        let mut scheduler = scheduler();
        let before = scheduler.clock().segment_count();
        scheduler.run_frame().unwrap();
        scheduler.run_frame().unwrap();
        // each stop lets exactly one final segment complete
        assert_eq!(scheduler.clock().segment_count(), before + 2);
        let log = scheduler.clock().peripheral().segment_log();
        assert!(log.windows(2).all(|w| w[1] == w[0] + 1));
    }
}
