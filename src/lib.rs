//! Output driver for LED matrix panels built from chained MBI5153 drivers.
//!
//! ## How MBI5153 Panels Work
//!
//! The MBI5153 is a 16-channel constant-current LED driver with its own PWM
//! engine and an on-chip SRAM that holds greyscale data for up to 32 scan
//! lines. Unlike a HUB75 panel, the host does not modulate the LEDs itself; it
//! loads greyscale values once and then only has to keep the chips clocked.
//!
//! ### Signal names
//! - **SDI (R/G/B × groups)** – Serial greyscale data. Every colour of every
//!   scan group has its own data line, all clocked together.
//! - **DCLK** – Data shift clock; each rising edge shifts one bit on every SDI line
//! - **LE / LAT** – Latch; the number of DCLK rising edges sampled while LE is
//!   high selects a command (data latch, vsync, config write, pre-active, reset)
//! - **GCLK** – Greyscale clock driving the internal PWM counters
//! - **A B C D E** – Row-address lines selecting the active scan line
//!
//! ### Frame workflow
//! 1. Shift 16 bits per channel, per chained IC, per scan line (MSB first).
//!    The last bit of every `16 × chain` block is sent with LE high
//!    (**data latch**), which moves the shifted block into SRAM.
//! 2. Keep GCLK running for at least 50 cycles so the chips can move SRAM into
//!    their display buffer.
//! 3. Hold GCLK low and raise LE for three DCLK edges (**vsync**). All chips
//!    swap to the new frame at once.
//! 4. Resume GCLK and the row-address scan.
//!
//! ### Two DMA engines
//! - A parallel output peripheral sends one-shot buffers: greyscale frames and
//!   the short command sequences. See [`parallel::ParallelDataEngine`].
//! - A second peripheral free-runs GCLK and the address lines from a
//!   self-looping segmented transfer. It is paused only around vsync. See
//!   [`clock::ClockAddressEngine`].
//!
//! The two are choreographed by [`scheduler::FrameScheduler`], and
//! [`Matrix`] exposes the pixel API used by the rest of the firmware.
//!
//! ## Hardware backends
//! The engines talk to hardware through the [`parallel::ParallelOutput`] and
//! [`clock::LoopPeripheral`] traits. Interrupt handlers report completion
//! through a `static` [`DriverSignals`]. With the `host` feature, fake
//! backends in [`host`] record every transfer so the whole driver can run in
//! tests and benchmarks.
//!
//! ## Available Feature Flags
//!
//! ### `esp-dma` Feature
//! Switches the `ReadBuffer` implementation of
//! [`greyscale::GreyscaleBuffer`] from `embedded-dma` to `esp-hal::dma`.
//!
//! ### `esp32s3` Feature
//! Enables `esp-hal` for the ESP32-S3 and implies `esp-dma`. Backends for
//! LCD_CAM (data) and GPSPI2 (GCLK) implement the two hardware traits on top of it.
//!
//! ### `defmt` / `log` Features
//! Route the driver's log output to `defmt` and/or the `log` facade, and
//! implement `defmt::Format` for the public types.
//!
//! ### `host` Feature
//! Builds the [`host`] module with recording fake backends.
#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

extern crate alloc;

mod fmt;

pub mod clock;
pub mod config;
pub mod descriptor;
pub mod greyscale;
#[cfg(any(test, feature = "host"))]
pub mod host;
pub mod matrix;
pub mod parallel;
pub mod scheduler;
pub mod signal;

use embedded_graphics::pixelcolor::Rgb888;

pub use clock::LoopControl;
pub use matrix::Matrix;
pub use signal::CompletionFlag;

/// Color type accepted by the driver
pub type Color = Rgb888;

/// Number of serial bits per channel of one IC.
pub const BITS_PER_CHANNEL: usize = 16;

/// Number of colour data lines on the parallel bus (R, G, B for four scan groups).
pub const COLOR_LINES: usize = 12;

/// Maximum number of scan groups that fit on the parallel bus.
pub const MAX_SCAN_GROUPS: usize = COLOR_LINES / 3;

/// Maximum number of scan lines an MBI5153 can multiplex.
pub const MAX_SCAN_LINES: usize = 32;

/// Computes the number of bus words needed for one scan line.
///
/// # Arguments
///
/// * `chain_len` - Number of chained driver ICs
/// * `channels_per_ic` - Number of output channels per IC
///
/// # Returns
///
/// Words shifted out per scan line: one 16-bit serial word per channel per IC
#[must_use]
pub const fn compute_scan_row_words(chain_len: usize, channels_per_ic: usize) -> usize {
    chain_len * channels_per_ic * BITS_PER_CHANNEL
}

/// Computes the number of bus words in the greyscale buffer.
#[must_use]
pub const fn compute_buffer_words(
    scan_lines: usize,
    chain_len: usize,
    channels_per_ic: usize,
) -> usize {
    scan_lines * compute_scan_row_words(chain_len, channels_per_ic)
}

/// Computes how many scan groups (parallel RGB line triples) a panel needs.
#[must_use]
pub const fn compute_scan_groups(height: usize, scan_lines: usize) -> usize {
    height.div_ceil(scan_lines)
}

/// Build-time geometry of a panel.
///
/// The wiring constants are derived from how the ICs are soldered to the
/// LEDs. Changing a panel build means a new implementation of this trait, not
/// new encoding logic.
///
/// # Example
/// ```rust
/// use mbi5153_driver::PanelLayout;
///
/// struct Panel64;
///
/// impl PanelLayout for Panel64 {
///     const WIDTH: usize = 64;
///     const HEIGHT: usize = 64;
///     const SCAN_LINES: usize = 16;
///     const CHAIN_LEN: usize = 4;
/// }
///
/// assert_eq!(Panel64::PHYSICAL_WIDTH, 64);
/// assert_eq!(Panel64::SCAN_ROW_WORDS, 1024);
/// ```
pub trait PanelLayout {
    /// Visible columns
    const WIDTH: usize;
    /// Visible rows
    const HEIGHT: usize;
    /// Scan lines multiplexed by each IC
    const SCAN_LINES: usize;
    /// Number of chained ICs per data line
    const CHAIN_LEN: usize;
    /// Output channels per IC
    const CHANNELS_PER_IC: usize = 16;
    /// Physical columns missing on the left edge of the panel
    const X_OFFSET: usize = 0;
    /// Physical columns driven by the chain
    const PHYSICAL_WIDTH: usize = Self::CHAIN_LEN * Self::CHANNELS_PER_IC;
    /// Bus words per scan line
    const SCAN_ROW_WORDS: usize = compute_scan_row_words(Self::CHAIN_LEN, Self::CHANNELS_PER_IC);
    /// Bus words in the greyscale buffer
    const BUFFER_WORDS: usize =
        compute_buffer_words(Self::SCAN_LINES, Self::CHAIN_LEN, Self::CHANNELS_PER_IC);
}

/// The 78 × 78 panel: five ICs, 20 scan lines, two dead columns on the left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mbi5153Panel78;

impl PanelLayout for Mbi5153Panel78 {
    const WIDTH: usize = 78;
    const HEIGHT: usize = 78;
    const SCAN_LINES: usize = 20;
    const CHAIN_LEN: usize = 5;
    const X_OFFSET: usize = 2;
}

/// Errors reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverError {
    /// DMA-capable memory could not be allocated.
    #[display("out of DMA memory allocating {requested} bytes")]
    OutOfDmaMemory {
        /// Bytes requested
        requested: usize,
    },
    /// A looping transfer segment is larger than the peripheral accepts.
    #[display("segment of {bytes} bytes exceeds the {max} byte limit")]
    SegmentTooLarge {
        /// Segment size in bytes
        bytes: usize,
        /// Largest accepted segment
        max: usize,
    },
    /// GCLK must run faster than 20% of DCLK.
    #[display("GCLK {gclk_hz} Hz is below 20% of DCLK {dclk_hz} Hz")]
    ClockRatio {
        /// Greyscale clock
        gclk_hz: u32,
        /// Data clock
        dclk_hz: u32,
    },
    /// A completion signal did not arrive within the configured spin limit.
    #[display("timed out waiting for DMA completion")]
    Timeout,
    /// The driver has not been initialised.
    #[display("driver not initialised")]
    NotReady,
}

/// Flags shared between the driver and the interrupt handlers.
///
/// Place one in a `static` and call [`CompletionFlag::signal`] on
/// `transfer_done` from the parallel peripheral's transfer-done interrupt, and
/// [`LoopControl::on_segment_done`] / [`LoopControl::on_transfer_done`] from
/// the clock peripheral's interrupt.
///
/// # Example
/// ```rust
/// use mbi5153_driver::DriverSignals;
///
/// static SIGNALS: DriverSignals = DriverSignals::new();
///
/// // inside the LCD transfer-done ISR
/// SIGNALS.transfer_done.signal();
/// assert_eq!(SIGNALS.transfer_done.count(), 1);
/// ```
#[derive(Debug)]
pub struct DriverSignals {
    /// Set when a one-shot parallel transfer has been clocked out
    pub transfer_done: CompletionFlag,
    /// Continuation header and counters of the GCLK loop
    pub clock_loop: LoopControl,
}

impl DriverSignals {
    /// Create a fresh set of signals.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            transfer_done: CompletionFlag::new(),
            clock_loop: LoopControl::new(),
        }
    }
}

impl Default for DriverSignals {
    fn default() -> Self {
        Self::new()
    }
}
