//! MBI5153 command payloads and configuration registers.
//!
//! Commands are encoded by how many DCLK rising edges see LE high:
//!
//! | Command          | LE high for  |
//! |------------------|--------------|
//! | Data latch       | 1            |
//! | Vsync            | 3            |
//! | Write register 1 | 4            |
//! | Write register 2 | 8            |
//! | Soft reset       | 10           |
//! | Pre-active       | 14           |
//!
//! The payload builders write into the front of the greyscale buffer, which
//! is cleared after every frame, and [`ConfigProgrammer`] sends them through
//! the [`ParallelDataEngine`].

use bitfield::bitfield;

use crate::greyscale::{GreyscaleBuffer, Word};
use crate::parallel::{ParallelDataEngine, ParallelOutput};
use crate::{DriverError, PanelLayout, BITS_PER_CHANNEL, MAX_SCAN_LINES};

/// LE-high clocks of the soft reset command.
pub const SOFT_RESET_LATCH_CLOCKS: usize = 10;

/// LE-high clocks of the pre-active command.
pub const PRE_ACTIVE_LATCH_CLOCKS: usize = 14;

/// LE-low clocks that must follow pre-active.
pub const PRE_ACTIVE_TRAILING_CLOCKS: usize = 2;

/// LE-high clocks that write configuration register 1.
pub const REGISTER1_LATCH_CLOCKS: usize = 4;

/// LE-high clocks that write configuration register 2.
pub const REGISTER2_LATCH_CLOCKS: usize = 8;

/// LE-high clocks of the vsync command.
pub const VSYNC_LATCH_CLOCKS: usize = 3;

/// Length of the vsync payload. The LE burst sits in the middle so GCLK has
/// settled low on both sides of it.
pub const VSYNC_WORDS: usize = 600;

/// Configuration register 2 as measured on the 78 × 78 panel. Suppresses
/// ghosting on the green and blue channels.
pub const REGISTER2: u16 = 0b1001_0000_0001_1110;

/// Largest current gain code.
pub const MAX_CURRENT_CODE: u8 = 63;

bitfield! {
    /// Configuration register 1.
    ///
    /// The bit layout is as follows:
    /// - Bit 14: Ghost elimination
    /// - Bits 13-8: Scan lines minus one
    /// - Bit 7: Greyscale depth select
    /// - Bit 6: GCLK multiplier
    /// - Bits 5-0: Current gain
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct ConfigRegister1(u16);
    impl Debug;
    pub ghost_elimination, set_ghost_elimination: 14;
    pub u8, scan_lines_minus_one, set_scan_lines_minus_one: 13, 8;
    pub greyscale_depth, set_greyscale_depth: 7;
    pub gclk_multiplier, set_gclk_multiplier: 6;
    pub u8, current_gain, set_current_gain: 5, 0;
}

/// Pack configuration register 1.
///
/// `scan_lines` is clamped to `1..=32` and `brightness_code` to
/// [`MAX_CURRENT_CODE`].
#[must_use]
pub fn build_register1(
    scan_lines: usize,
    greyscale_depth: bool,
    anti_ghosting: bool,
    gclk_multiplier: bool,
    brightness_code: u8,
) -> u16 {
    let mut reg = ConfigRegister1(0);
    reg.set_ghost_elimination(anti_ghosting);
    reg.set_scan_lines_minus_one((scan_lines.clamp(1, MAX_SCAN_LINES) - 1) as u8);
    reg.set_greyscale_depth(greyscale_depth);
    reg.set_gclk_multiplier(gclk_multiplier);
    reg.set_current_gain(brightness_code.min(MAX_CURRENT_CODE));
    reg.0
}

/// Map a 0-255 brightness level onto the 0-63 current gain, rounding to
/// nearest.
#[must_use]
pub const fn brightness_to_current(level: u8) -> u8 {
    ((level as u16 * MAX_CURRENT_CODE as u16 + 127) / 255) as u8
}

/// Write the soft reset command. Returns the payload length in words.
pub fn write_soft_reset(words: &mut [Word]) -> usize {
    words[..SOFT_RESET_LATCH_CLOCKS].fill(Word::LATCH);
    words[SOFT_RESET_LATCH_CLOCKS] = Word::BLANK;
    SOFT_RESET_LATCH_CLOCKS + 1
}

/// Write the pre-active command. Returns the payload length in words.
pub fn write_pre_active(words: &mut [Word]) -> usize {
    let len = PRE_ACTIVE_LATCH_CLOCKS + PRE_ACTIVE_TRAILING_CLOCKS;
    words[..PRE_ACTIVE_LATCH_CLOCKS].fill(Word::LATCH);
    words[PRE_ACTIVE_LATCH_CLOCKS..len].fill(Word::BLANK);
    len
}

/// Write a configuration register to every IC of the chain.
///
/// Each IC gets 16 words, MSB first, with every colour line high for a one
/// bit. All ICs see the same data, but only the last IC's stream raises LE,
/// during its final `latch_window` bits, so the whole chain latches at once.
/// Returns the payload length in words.
pub fn write_config(words: &mut [Word], register: u16, chain_len: usize, latch_window: usize) -> usize {
    let len = chain_len * BITS_PER_CHANNEL;
    for (ic, stream) in words[..len].chunks_exact_mut(BITS_PER_CHANNEL).enumerate() {
        let last = ic + 1 == chain_len;
        for (i, word) in stream.iter_mut().enumerate() {
            let bit = BITS_PER_CHANNEL - 1 - i;
            let mut value = if (register >> bit) & 1 == 1 {
                Word::ALL_RGB
            } else {
                Word::BLANK
            };
            if last && bit < latch_window {
                value.set_latch(true);
            }
            *word = value;
        }
    }
    len
}

/// Write the vsync command. Returns the payload length in words.
pub fn write_vsync(words: &mut [Word]) -> usize {
    words[..VSYNC_WORDS].fill(Word::BLANK);
    let start = VSYNC_WORDS - VSYNC_WORDS / 2;
    words[start..start + VSYNC_LATCH_CLOCKS].fill(Word::LATCH);
    VSYNC_WORDS
}

/// Chip settings that do not change at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChipSettings {
    /// Register 1 bit 14
    pub anti_ghosting: bool,
    /// Register 1 bit 7
    pub greyscale_depth: bool,
    /// Register 1 bit 6
    pub gclk_multiplier: bool,
    /// Value written to register 2
    pub register2: u16,
}

impl Default for ChipSettings {
    fn default() -> Self {
        Self {
            anti_ghosting: true,
            greyscale_depth: true,
            gclk_multiplier: false,
            register2: REGISTER2,
        }
    }
}

/// Programs the chain's configuration registers.
///
/// Brightness is the only runtime setting. A change is recorded as pending
/// and sent by [`apply_pending`](Self::apply_pending), which the frame
/// scheduler calls once the frame has been displayed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigProgrammer {
    settings: ChipSettings,
    brightness: u8,
    pending: bool,
}

impl ConfigProgrammer {
    /// Create a programmer with an initial brightness level.
    #[must_use]
    pub const fn new(settings: ChipSettings, brightness: u8) -> Self {
        Self {
            settings,
            brightness,
            pending: false,
        }
    }

    /// Requested brightness level.
    #[must_use]
    pub const fn brightness(&self) -> u8 {
        self.brightness
    }

    /// Current gain sent for the requested level.
    #[must_use]
    pub const fn brightness_code(&self) -> u8 {
        brightness_to_current(self.brightness)
    }

    /// Record a new brightness level. Returns whether a refresh is now
    /// pending.
    pub fn set_brightness(&mut self, level: u8) -> bool {
        if level != self.brightness {
            self.brightness = level;
            self.pending = true;
        }
        self.pending
    }

    /// Whether a brightness change has not been sent yet.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending
    }

    /// The chip settings.
    #[must_use]
    pub const fn settings(&self) -> &ChipSettings {
        &self.settings
    }

    /// Register 1 for a layout with the current brightness.
    #[must_use]
    pub fn register1<L: PanelLayout>(&self) -> u16 {
        build_register1(
            L::SCAN_LINES,
            self.settings.greyscale_depth,
            self.settings.anti_ghosting,
            self.settings.gclk_multiplier,
            self.brightness_code(),
        )
    }

    /// Run the full boot sequence and leave `buffer` zeroed.
    ///
    /// Soft reset, pre-active, register 1, pre-active, register 2, soft
    /// reset. GCLK must already be running.
    ///
    /// # Errors
    ///
    /// Any error from the parallel engine.
    pub fn boot<L: PanelLayout, P: ParallelOutput>(
        &mut self,
        engine: &mut ParallelDataEngine<P>,
        buffer: &mut GreyscaleBuffer<L>,
    ) -> Result<(), DriverError> {
        info!("booting chain of {} drivers", L::CHAIN_LEN);
        let reg1 = self.register1::<L>();
        let reg2 = self.settings.register2;
        debug!("register 1 = {}, register 2 = {}", reg1, reg2);

        debug!("boot: soft reset");
        send(engine, buffer, write_soft_reset)?;
        debug!("boot: pre-active");
        send(engine, buffer, write_pre_active)?;
        debug!("boot: writing register 1");
        send(engine, buffer, |w| {
            write_config(w, reg1, L::CHAIN_LEN, REGISTER1_LATCH_CLOCKS)
        })?;
        debug!("boot: pre-active");
        send(engine, buffer, write_pre_active)?;
        debug!("boot: writing register 2");
        send(engine, buffer, |w| {
            write_config(w, reg2, L::CHAIN_LEN, REGISTER2_LATCH_CLOCKS)
        })?;
        debug!("boot: soft reset");
        send(engine, buffer, write_soft_reset)?;
        buffer.clear();
        debug!("boot: done");
        self.pending = false;
        Ok(())
    }

    /// Resend register 1 with the current brightness. Skips the reset so the
    /// display does not blank.
    ///
    /// # Errors
    ///
    /// Any error from the parallel engine.
    pub fn refresh<L: PanelLayout, P: ParallelOutput>(
        &mut self,
        engine: &mut ParallelDataEngine<P>,
        buffer: &mut GreyscaleBuffer<L>,
    ) -> Result<(), DriverError> {
        let reg1 = self.register1::<L>();
        debug!("refreshing register 1 = {}", reg1);
        send(engine, buffer, write_pre_active)?;
        send(engine, buffer, |w| {
            write_config(w, reg1, L::CHAIN_LEN, REGISTER1_LATCH_CLOCKS)
        })?;
        self.pending = false;
        Ok(())
    }

    /// Refresh if a brightness change is pending. Returns whether anything
    /// was sent.
    ///
    /// # Errors
    ///
    /// Any error from the parallel engine.
    pub fn apply_pending<L: PanelLayout, P: ParallelOutput>(
        &mut self,
        engine: &mut ParallelDataEngine<P>,
        buffer: &mut GreyscaleBuffer<L>,
    ) -> Result<bool, DriverError> {
        if !self.pending {
            return Ok(false);
        }
        self.refresh(engine, buffer)?;
        Ok(true)
    }

    /// Send the vsync command.
    ///
    /// # Errors
    ///
    /// Any error from the parallel engine.
    pub fn vsync<L: PanelLayout, P: ParallelOutput>(
        engine: &mut ParallelDataEngine<P>,
        buffer: &mut GreyscaleBuffer<L>,
    ) -> Result<(), DriverError> {
        send(engine, buffer, write_vsync)
    }
}

fn send<L: PanelLayout, P: ParallelOutput>(
    engine: &mut ParallelDataEngine<P>,
    buffer: &mut GreyscaleBuffer<L>,
    write: impl FnOnce(&mut [Word]) -> usize,
) -> Result<(), DriverError> {
    let len = write(buffer.words_mut());
    engine.send_words(&buffer.words()[..len])
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec;
    use std::vec::Vec;

    use super::*;
    use crate::host::{leak_signals, RecordingBus};
    use crate::Mbi5153Panel78;

    fn latch_positions(words: &[Word]) -> Vec<usize> {
        words
            .iter()
            .enumerate()
            .filter(|(_, w)| w.latch())
            .map(|(i, _)| i)
            .collect()
    }

    fn engine() -> ParallelDataEngine<RecordingBus> {
        ParallelDataEngine::new(RecordingBus::new(), &leak_signals().transfer_done, None)
    }

    #[test]
    fn test_build_register1_documented_value() {
        let reg = build_register1(31, true, true, false, 32);
        assert_eq!(reg, (1 << 14) | (30 << 8) | (1 << 7) | 32);
    }

    #[test]
    fn test_build_register1_fields() {
        let reg = ConfigRegister1(build_register1(20, false, false, true, 63));
        assert!(!reg.ghost_elimination());
        assert_eq!(reg.scan_lines_minus_one(), 19);
        assert!(!reg.greyscale_depth());
        assert!(reg.gclk_multiplier());
        assert_eq!(reg.current_gain(), 63);
    }

    #[test]
    fn test_build_register1_clamps() {
        let reg = ConfigRegister1(build_register1(100, false, false, false, 255));
        assert_eq!(reg.scan_lines_minus_one(), 31);
        assert_eq!(reg.current_gain(), 63);
        let reg = ConfigRegister1(build_register1(0, false, false, false, 0));
        assert_eq!(reg.scan_lines_minus_one(), 0);
    }

    #[test]
    fn test_brightness_to_current() {
        assert_eq!(brightness_to_current(0), 0);
        assert_eq!(brightness_to_current(255), 63);
        assert_eq!(brightness_to_current(128), 32);
        assert_eq!(brightness_to_current(2), 0);
        assert_eq!(brightness_to_current(3), 1);
        let mut last = 0;
        for level in 0..=255u8 {
            let code = brightness_to_current(level);
            assert!(code >= last);
            last = code;
        }
    }

    #[test]
    fn test_soft_reset_payload() {
        let mut words = vec![Word::ALL_RGB; 32];
        let len = write_soft_reset(&mut words);
        assert_eq!(len, 11);
        assert_eq!(latch_positions(&words[..len]), (0..10).collect::<Vec<_>>());
        assert_eq!(words[10], Word::BLANK);
    }

    #[test]
    fn test_pre_active_payload() {
        let mut words = vec![Word::ALL_RGB; 32];
        let len = write_pre_active(&mut words);
        assert_eq!(len, 16);
        assert!(words[..14].iter().all(|w| *w == Word::LATCH));
        assert!(words[14..16].iter().all(|w| *w == Word::BLANK));
    }

    #[test]
    fn test_config_payload_latches_only_last_ic() {
        let mut words = vec![Word::BLANK; 128];
        let len = write_config(&mut words, 0xFFFF, 5, REGISTER1_LATCH_CLOCKS);
        assert_eq!(len, 80);
        assert_eq!(latch_positions(&words[..len]), vec![76, 77, 78, 79]);
        assert!(words[..len].iter().all(|w| w.bits() & 0x0FFF == 0x0FFF));

        let len = write_config(&mut words, 0, 5, REGISTER2_LATCH_CLOCKS);
        assert_eq!(latch_positions(&words[..len]), (72..80).collect::<Vec<_>>());
    }

    #[test]
    fn test_config_payload_msb_first() {
        let mut words = vec![Word::BLANK; 32];
        let len = write_config(&mut words, 0b1000_0000_0000_0001, 2, 0);
        assert_eq!(len, 32);
        for stream in words.chunks_exact(16) {
            assert_eq!(stream[0], Word::ALL_RGB);
            assert!(stream[1..15].iter().all(|w| *w == Word::BLANK));
            assert_eq!(stream[15], Word::ALL_RGB);
        }
    }

    #[test]
    fn test_vsync_payload() {
        let mut words = vec![Word::ALL_RGB; VSYNC_WORDS + 10];
        let len = write_vsync(&mut words);
        assert_eq!(len, VSYNC_WORDS);
        assert_eq!(latch_positions(&words[..len]), vec![300, 301, 302]);
        assert_eq!(words[303], Word::BLANK);
        assert!(words[..len].iter().all(|w| w.bits() & 0x0FFF == 0));
    }

    #[test]
    fn test_set_brightness_marks_pending() {
        let mut programmer = ConfigProgrammer::new(ChipSettings::default(), 128);
        assert!(!programmer.is_pending());
        assert!(!programmer.set_brightness(128));
        assert!(programmer.set_brightness(255));
        assert_eq!(programmer.brightness(), 255);
        assert_eq!(programmer.brightness_code(), 63);
    }

    #[test]
    fn test_boot_sequence() {
        let mut engine = engine();
        let mut buffer = GreyscaleBuffer::<Mbi5153Panel78>::new().unwrap();
        buffer.set_pixel(1, 1, 255, 255, 255);
        let mut programmer = ConfigProgrammer::new(ChipSettings::default(), 128);
        programmer.set_brightness(64);
        programmer.boot(&mut engine, &mut buffer).unwrap();

        let sent = engine.output().transfers();
        let lengths: Vec<usize> = sent.iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![11, 16, 80, 16, 80, 11]);

        let reg1 = build_register1(20, true, true, false, 16);
        let mut expected = vec![Word::BLANK; 80];
        write_config(&mut expected, reg1, 5, REGISTER1_LATCH_CLOCKS);
        assert_eq!(sent[2], expected);
        write_config(&mut expected, REGISTER2, 5, REGISTER2_LATCH_CLOCKS);
        assert_eq!(sent[4], expected);

        assert!(buffer.words().iter().all(|w| *w == Word::BLANK));
        assert!(!programmer.is_pending());
    }

    #[test]
    fn test_apply_pending_sends_register1_only() {
        let mut engine = engine();
        let mut buffer = GreyscaleBuffer::<Mbi5153Panel78>::new().unwrap();
        let mut programmer = ConfigProgrammer::new(ChipSettings::default(), 128);
        assert_eq!(programmer.apply_pending(&mut engine, &mut buffer), Ok(false));
        assert!(engine.output().transfers().is_empty());

        programmer.set_brightness(255);
        assert_eq!(programmer.apply_pending(&mut engine, &mut buffer), Ok(true));
        let sent = engine.output().transfers();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].len(), 16);
        let mut expected = vec![Word::BLANK; 80];
        write_config(&mut expected, build_register1(20, true, true, false, 63), 5, REGISTER1_LATCH_CLOCKS);
        assert_eq!(sent[1], expected);
        assert_eq!(latch_positions(&sent[1]), vec![76, 77, 78, 79]);
        assert!(!programmer.is_pending());
    }

    #[test]
    fn test_vsync_through_engine() {
        let mut engine = engine();
        let mut buffer = GreyscaleBuffer::<Mbi5153Panel78>::new().unwrap();
        ConfigProgrammer::vsync(&mut engine, &mut buffer).unwrap();
        let sent = engine.output().last_transfer().unwrap();
        assert_eq!(sent.len(), VSYNC_WORDS);
        assert_eq!(latch_positions(sent), vec![300, 301, 302]);
    }
}
