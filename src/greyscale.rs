//! Greyscale bit-plane buffer for a chain of MBI5153 drivers.
//!
//! The buffer holds one [`Word`] per DCLK cycle. Every word drives all twelve
//! colour lines at once, so bit `n` of a channel's 16-bit greyscale value for
//! every scan group lives in the same word. Words are ordered the way they are
//! shifted out:
//!
//! ```text
//! scan line 0: channel 0: IC 0 bits 15..0, IC 1 bits 15..0, ... IC N-1
//!              channel 1: IC 0 ...
//!              ...
//! scan line 1: ...
//! ```
//!
//! so the first word of pixel `(x, y)` is
//!
//! ```text
//! SCAN_ROW_WORDS * (y % SCAN_LINES)
//!     + (x % CHANNELS_PER_IC) * CHAIN_LEN * 16
//!     + (x / CHANNELS_PER_IC) * 16
//! ```
//!
//! and the scan group `y / SCAN_LINES` picks which RGB triple of the word is
//! touched. Only the eight most significant bits of each channel are written;
//! the low eight stay zero.
//!
//! # Safety
//!
//! The buffer is handed to DMA by pointer. Writes must not overlap an
//! in-flight transfer; the [`FrameScheduler`](crate::scheduler::FrameScheduler)
//! only ever sends while it holds the buffer mutably.

use alloc::vec::Vec;
use core::marker::PhantomData;

use bitfield::bitfield;
#[cfg(not(feature = "esp-dma"))]
use embedded_dma::ReadBuffer;
#[cfg(feature = "esp-dma")]
use esp_hal::dma::ReadBuffer;

use crate::config::VSYNC_WORDS;
use crate::{
    compute_scan_groups, DriverError, PanelLayout, BITS_PER_CHANNEL, MAX_SCAN_GROUPS,
    MAX_SCAN_LINES,
};

/// Number of colour bits taken from each 8-bit input channel.
pub const COLOR_BITS: usize = 8;

bitfield! {
    /// 16-bit word sent on the parallel bus for one DCLK cycle.
    ///
    /// The bit layout is as follows:
    /// - Bit 12: LE / latch
    /// - Bits 11-9: Red, blue, green for scan group 4
    /// - Bits 8-6: Red, blue, green for scan group 3
    /// - Bits 5-3: Red, blue, green for scan group 2
    /// - Bits 2-0: Red, blue, green for scan group 1
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct Word(u16);
    impl Debug;
    pub latch, set_latch: 12;
    pub r4, set_r4: 11;
    pub b4, set_b4: 10;
    pub g4, set_g4: 9;
    pub r3, set_r3: 8;
    pub b3, set_b3: 7;
    pub g3, set_g3: 6;
    pub r2, set_r2: 5;
    pub b2, set_b2: 4;
    pub g2, set_g2: 3;
    pub r1, set_r1: 2;
    pub b1, set_b1: 1;
    pub g1, set_g1: 0;
}

impl Word {
    /// All lines low.
    pub const BLANK: Self = Self(0);
    /// Every colour line high, latch low.
    pub const ALL_RGB: Self = Self(0x0FFF);
    /// Only the latch line high.
    pub const LATCH: Self = Self(1 << 12);

    /// Raw bus value.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Word with the given raw bus value.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    #[inline]
    fn write_slice(&mut self, shift: usize, slice: u16) {
        self.0 = (self.0 & !(0b111 << shift)) | (slice << shift);
    }

    #[inline]
    fn read_slice(self, shift: usize) -> u16 {
        (self.0 >> shift) & 0b111
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Word {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Word({=u16:#06x})", self.0);
    }
}

/// Per-bit RGB slices of one colour, most significant bit first.
///
/// Bit 0 of a slice is green, bit 1 blue, bit 2 red, matching the G/B/R order
/// of the colour lines within a scan group.
#[must_use]
pub fn encode_slices(r: u8, g: u8, b: u8) -> [u16; COLOR_BITS] {
    let mut slices = [0u16; COLOR_BITS];
    for (i, slice) in slices.iter_mut().enumerate() {
        let bit = COLOR_BITS - 1 - i;
        *slice = u16::from((g >> bit) & 1)
            | (u16::from((b >> bit) & 1) << 1)
            | (u16::from((r >> bit) & 1) << 2);
    }
    slices
}

/// Screen rotation applied to logical coordinates before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Rotation {
    /// No rotation
    #[default]
    Deg0,
    /// 90 degrees clockwise
    Deg90,
    /// 180 degrees
    Deg180,
    /// 270 degrees clockwise
    Deg270,
}

impl Rotation {
    /// Rotation for an index in `0..4`. Larger values clamp to [`Rotation::Deg270`].
    #[must_use]
    pub const fn from_index(index: u8) -> Self {
        match index {
            0 => Self::Deg0,
            1 => Self::Deg90,
            2 => Self::Deg180,
            _ => Self::Deg270,
        }
    }

    /// Index of this rotation in `0..4`.
    #[must_use]
    pub const fn index(self) -> u8 {
        self as u8
    }

    /// The next rotation clockwise, wrapping after 270 degrees.
    #[must_use]
    pub const fn next(self) -> Self {
        Self::from_index((self.index() + 1) % 4)
    }

    /// Whether logical width and height are swapped.
    #[must_use]
    pub const fn swaps_axes(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }

    /// Map a logical coordinate onto the unrotated panel.
    ///
    /// `width` and `height` are the panel's unrotated dimensions. Returns
    /// `None` when the coordinate is outside the rotated screen.
    #[must_use]
    pub fn transform(self, x: usize, y: usize, width: usize, height: usize) -> Option<(usize, usize)> {
        let (logical_w, logical_h) = if self.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        };
        if x >= logical_w || y >= logical_h {
            return None;
        }
        Some(match self {
            Self::Deg0 => (x, y),
            Self::Deg90 => (y, height - 1 - x),
            Self::Deg180 => (width - 1 - x, height - 1 - y),
            Self::Deg270 => (width - 1 - y, x),
        })
    }
}

/// Greyscale data for one frame of a [`PanelLayout`].
///
/// The buffer is also reused as scratch space for the short command payloads
/// (reset, pre-active, configuration, vsync), which is why it is cleared after
/// every frame.
pub struct GreyscaleBuffer<L: PanelLayout> {
    words: Vec<Word>,
    _layout: PhantomData<L>,
}

impl<L: PanelLayout> GreyscaleBuffer<L> {
    const LAYOUT_CHECK: () = {
        assert!(
            L::WIDTH + L::X_OFFSET <= L::PHYSICAL_WIDTH,
            "visible width plus offset exceeds the columns driven by the chain"
        );
        assert!(
            L::SCAN_LINES > 0 && L::SCAN_LINES <= MAX_SCAN_LINES,
            "scan line count out of range"
        );
        assert!(
            compute_scan_groups(L::HEIGHT, L::SCAN_LINES) <= MAX_SCAN_GROUPS,
            "panel height needs more scan groups than colour lines"
        );
        assert!(
            L::BUFFER_WORDS >= VSYNC_WORDS,
            "greyscale buffer too small to hold command payloads"
        );
    };

    /// Words shifted per channel across the whole chain.
    const CHANNEL_STRIDE: usize = L::CHAIN_LEN * BITS_PER_CHANNEL;

    /// Allocate a zeroed buffer.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::OutOfDmaMemory`] if the allocation fails.
    pub fn new() -> Result<Self, DriverError> {
        let () = Self::LAYOUT_CHECK;
        let mut words = Vec::new();
        words
            .try_reserve_exact(L::BUFFER_WORDS)
            .map_err(|_| DriverError::OutOfDmaMemory {
                requested: L::BUFFER_WORDS * core::mem::size_of::<Word>(),
            })?;
        words.resize(L::BUFFER_WORDS, Word::BLANK);
        info!(
            "allocated greyscale buffer of {} bytes",
            L::BUFFER_WORDS * core::mem::size_of::<Word>()
        );
        Ok(Self {
            words,
            _layout: PhantomData,
        })
    }

    /// Index of the first word of a physical column and row.
    ///
    /// `x` already includes the layout's `X_OFFSET`.
    #[must_use]
    pub const fn word_index(x: usize, y: usize) -> usize {
        L::SCAN_ROW_WORDS * (y % L::SCAN_LINES)
            + (x % L::CHANNELS_PER_IC) * Self::CHANNEL_STRIDE
            + (x / L::CHANNELS_PER_IC) * BITS_PER_CHANNEL
    }

    /// Position of the RGB triple for row `y` inside a word.
    #[must_use]
    pub const fn slice_shift(y: usize) -> usize {
        (y / L::SCAN_LINES) * 3
    }

    #[inline]
    fn write_slices(&mut self, x: usize, y: usize, slices: &[u16; COLOR_BITS]) {
        let start = Self::word_index(x + L::X_OFFSET, y);
        let shift = Self::slice_shift(y);
        for (word, &slice) in self.words[start..start + COLOR_BITS].iter_mut().zip(slices) {
            word.write_slice(shift, slice);
        }
    }

    /// Encode one pixel. Coordinates outside the visible panel are ignored.
    pub fn set_pixel(&mut self, x: usize, y: usize, r: u8, g: u8, b: u8) {
        if x >= L::WIDTH || y >= L::HEIGHT {
            return;
        }
        self.write_slices(x, y, &encode_slices(r, g, b));
    }

    /// Read back the eight most significant bits of each channel of a pixel.
    #[must_use]
    pub fn decode_pixel(&self, x: usize, y: usize) -> Option<(u8, u8, u8)> {
        if x >= L::WIDTH || y >= L::HEIGHT {
            return None;
        }
        let start = Self::word_index(x + L::X_OFFSET, y);
        let shift = Self::slice_shift(y);
        let (mut r, mut g, mut b) = (0u8, 0u8, 0u8);
        for (i, word) in self.words[start..start + COLOR_BITS].iter().enumerate() {
            let slice = word.read_slice(shift);
            let bit = COLOR_BITS - 1 - i;
            g |= ((slice & 1) as u8) << bit;
            b |= (((slice >> 1) & 1) as u8) << bit;
            r |= (((slice >> 2) & 1) as u8) << bit;
        }
        Some((r, g, b))
    }

    /// Encode every visible pixel with the same colour.
    pub fn fill(&mut self, r: u8, g: u8, b: u8) {
        let slices = encode_slices(r, g, b);
        for y in 0..L::HEIGHT {
            for x in 0..L::WIDTH {
                self.write_slices(x, y, &slices);
            }
        }
    }

    /// Zero every word, including latch bits left by the last frame or
    /// command.
    pub fn clear(&mut self) {
        self.words.fill(Word::BLANK);
    }

    /// Raise LE on the final bit of the last IC for every channel of every
    /// scan line, so each 16-bit block is committed to SRAM as soon as it has
    /// been shifted through the chain.
    pub fn apply_data_latches(&mut self) {
        for block in self.words.chunks_exact_mut(Self::CHANNEL_STRIDE) {
            if let Some(last) = block.last_mut() {
                last.set_latch(true);
            }
        }
    }

    /// The words in transmission order.
    #[must_use]
    pub fn words(&self) -> &[Word] {
        &self.words
    }

    /// Mutable access for building command payloads in place.
    pub fn words_mut(&mut self) -> &mut [Word] {
        &mut self.words
    }

    /// Size of the buffer in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        core::mem::size_of_val(self.words.as_slice())
    }
}

unsafe impl<L: PanelLayout> ReadBuffer for GreyscaleBuffer<L> {
    #[cfg(not(feature = "esp-dma"))]
    type Word = u8;

    unsafe fn read_buffer(&self) -> (*const u8, usize) {
        (self.words.as_ptr().cast::<u8>(), self.size_bytes())
    }
}

unsafe impl<L: PanelLayout> ReadBuffer for &mut GreyscaleBuffer<L> {
    #[cfg(not(feature = "esp-dma"))]
    type Word = u8;

    unsafe fn read_buffer(&self) -> (*const u8, usize) {
        (self.words.as_ptr().cast::<u8>(), self.size_bytes())
    }
}

impl<L: PanelLayout> core::fmt::Debug for GreyscaleBuffer<L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GreyscaleBuffer")
            .field("size", &self.size_bytes())
            .field("words", &self.words.len())
            .field("scan_lines", &L::SCAN_LINES)
            .field("chain_len", &L::CHAIN_LEN)
            .finish()
    }
}

#[cfg(feature = "defmt")]
impl<L: PanelLayout> defmt::Format for GreyscaleBuffer<L> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(
            f,
            "GreyscaleBuffer<{}x{}, scan {}, chain {}>",
            L::WIDTH,
            L::HEIGHT,
            L::SCAN_LINES,
            L::CHAIN_LEN
        );
        defmt::write!(f, " size: {}", self.size_bytes());
    }
}
