//! One-shot DMA transfers on the 16-bit parallel bus.
//!
//! The parallel peripheral (LCD_CAM in i8080 mode on the ESP32-S3) shifts one
//! [`Word`] per DCLK edge. [`ParallelDataEngine`] links a buffer into a
//! descriptor chain, starts the transfer and blocks until the peripheral's
//! transfer-done interrupt fires. Greyscale frames and every command payload
//! go through [`ParallelDataEngine::send_words`] or
//! [`ParallelDataEngine::send_buffer`].

#[cfg(not(feature = "esp-dma"))]
use embedded_dma::ReadBuffer;
#[cfg(feature = "esp-dma")]
use esp_hal::dma::ReadBuffer;

use crate::descriptor::{ChainEnd, DescriptorChain, DmaDescriptor, DmaSegment};
use crate::greyscale::Word;
use crate::signal::CompletionFlag;
use crate::{DriverError, COLOR_LINES};

/// Number of data lines on the bus.
pub const BUS_WIDTH: usize = 16;

/// Bus line carrying LE.
pub const LATCH_LINE: usize = COLOR_LINES;

/// Pin routing and clocking of the parallel bus.
///
/// Pins are GPIO numbers; the backend maps them onto peripheral signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ParallelBusConfig {
    /// GPIO for each bus bit, `None` for unused bits
    pub data_pins: [Option<u8>; BUS_WIDTH],
    /// GPIO carrying DCLK
    pub clock_pin: u8,
    /// Invert DCLK at the pin
    pub invert_clock: bool,
    /// Peripheral source clock
    pub source_clock_hz: u32,
    /// Integer divider applied to the source clock
    pub clock_divider: u16,
    /// Dummy DCLK cycles issued before the data phase
    pub dummy_cycles: u8,
}

impl ParallelBusConfig {
    /// 160 MHz PLL source.
    pub const DEFAULT_SOURCE_CLOCK_HZ: u32 = 160_000_000;
    /// Gives a DCLK just under 7 MHz. Faster rates pick up noise on long
    /// ribbon cables.
    pub const DEFAULT_CLOCK_DIVIDER: u16 = 23;
    /// Two dummy cycles at the start of each transfer.
    pub const DEFAULT_DUMMY_CYCLES: u8 = 2;

    /// Route twelve colour lines (G1 B1 R1 G2 ... R4) and LE onto the bus.
    #[must_use]
    pub const fn new(color_pins: [u8; COLOR_LINES], latch_pin: u8, clock_pin: u8) -> Self {
        let mut data_pins = [None; BUS_WIDTH];
        let mut i = 0;
        while i < COLOR_LINES {
            data_pins[i] = Some(color_pins[i]);
            i += 1;
        }
        data_pins[LATCH_LINE] = Some(latch_pin);
        Self {
            data_pins,
            clock_pin,
            invert_clock: false,
            source_clock_hz: Self::DEFAULT_SOURCE_CLOCK_HZ,
            clock_divider: Self::DEFAULT_CLOCK_DIVIDER,
            dummy_cycles: Self::DEFAULT_DUMMY_CYCLES,
        }
    }

    /// Invert DCLK at the pin.
    #[must_use]
    pub const fn with_clock_inversion(mut self, invert: bool) -> Self {
        self.invert_clock = invert;
        self
    }

    /// Use a different clock divider.
    #[must_use]
    pub const fn with_clock_divider(mut self, divider: u16) -> Self {
        self.clock_divider = divider;
        self
    }

    /// Resulting DCLK frequency.
    #[must_use]
    pub const fn dclk_hz(&self) -> u32 {
        if self.clock_divider == 0 {
            return self.source_clock_hz;
        }
        self.source_clock_hz / self.clock_divider as u32
    }
}

impl Default for ParallelBusConfig {
    fn default() -> Self {
        Self {
            data_pins: [None; BUS_WIDTH],
            clock_pin: 0,
            invert_clock: false,
            source_clock_hz: Self::DEFAULT_SOURCE_CLOCK_HZ,
            clock_divider: Self::DEFAULT_CLOCK_DIVIDER,
            dummy_cycles: Self::DEFAULT_DUMMY_CYCLES,
        }
    }
}

/// Hardware side of the parallel bus.
///
/// Implementations program the peripheral and its DMA channel. The
/// transfer-done interrupt must call [`CompletionFlag::signal`] on the flag
/// the engine was created with.
pub trait ParallelOutput {
    /// Bind pins, select 16-bit words, program the dummy phase and clock
    /// divider. Called once before any transfer.
    ///
    /// # Errors
    ///
    /// Backend specific; the engine passes the error through.
    fn configure(&mut self, config: &ParallelBusConfig) -> Result<(), DriverError>;

    /// Point the DMA channel at `head` and trigger the peripheral. Must not
    /// wait for completion.
    fn start(&mut self, head: &DmaDescriptor);

    /// Called on every spin while the engine waits for `done`.
    fn poll(&mut self, _done: &CompletionFlag) {}
}

/// Sends buffers once over the parallel bus, blocking until each has been
/// clocked out.
#[derive(Debug)]
pub struct ParallelDataEngine<P> {
    output: P,
    done: &'static CompletionFlag,
    chain: DescriptorChain,
    spin_limit: Option<u32>,
    transfers: u32,
}

impl<P: ParallelOutput> ParallelDataEngine<P> {
    /// Create an engine around `output`. `done` is the flag its interrupt
    /// handler signals.
    #[must_use]
    pub const fn new(output: P, done: &'static CompletionFlag, spin_limit: Option<u32>) -> Self {
        Self {
            output,
            done,
            chain: DescriptorChain::new(),
            spin_limit,
            transfers: 0,
        }
    }

    /// Configure the peripheral.
    ///
    /// # Errors
    ///
    /// Whatever the backend reports.
    pub fn configure(&mut self, config: &ParallelBusConfig) -> Result<(), DriverError> {
        debug!("parallel bus clock divider is {}", config.clock_divider);
        info!("resulting parallel bus clock: {} Hz", config.dclk_hz());
        self.output.configure(config)
    }

    /// Send bus words in order.
    ///
    /// # Errors
    ///
    /// [`DriverError::OutOfDmaMemory`] if the descriptor pool cannot grow,
    /// [`DriverError::Timeout`] if a spin limit is set and exceeded.
    pub fn send_words(&mut self, words: &[Word]) -> Result<(), DriverError> {
        self.send_segment(DmaSegment::from_words(words))
    }

    /// Send raw bytes.
    ///
    /// # Errors
    ///
    /// See [`send_words`](Self::send_words).
    pub fn send_once(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        self.send_segment(DmaSegment::from_bytes(bytes))
    }

    /// Send a DMA-readable buffer such as a
    /// [`GreyscaleBuffer`](crate::greyscale::GreyscaleBuffer).
    ///
    /// # Errors
    ///
    /// See [`send_words`](Self::send_words).
    #[cfg(not(feature = "esp-dma"))]
    pub fn send_buffer<B: ReadBuffer<Word = u8>>(&mut self, buffer: &B) -> Result<(), DriverError> {
        // The borrow of `buffer` outlives the blocking send.
        let (ptr, len) = unsafe { buffer.read_buffer() };
        self.send_segment(DmaSegment::from_raw(ptr, len))
    }

    /// Send a DMA-readable buffer such as a
    /// [`GreyscaleBuffer`](crate::greyscale::GreyscaleBuffer).
    ///
    /// # Errors
    ///
    /// See [`send_words`](Self::send_words).
    #[cfg(feature = "esp-dma")]
    pub fn send_buffer<B: ReadBuffer>(&mut self, buffer: &B) -> Result<(), DriverError> {
        // The borrow of `buffer` outlives the blocking send.
        let (ptr, len) = unsafe { buffer.read_buffer() };
        self.send_segment(DmaSegment::from_raw(ptr, len))
    }

    fn send_segment(&mut self, segment: DmaSegment) -> Result<(), DriverError> {
        if segment.is_empty() {
            return Ok(());
        }
        trace!("sending parallel payload of {} bytes", segment.len());
        self.chain.link(&[segment], ChainEnd::Stop)?;
        let Some(head) = self.chain.head() else {
            return Ok(());
        };

        let done = self.done;
        done.arm();
        self.output.start(head);
        let output = &mut self.output;
        done.wait(self.spin_limit, || output.poll(done))?;
        self.transfers = self.transfers.wrapping_add(1);
        Ok(())
    }

    /// Number of completed transfers.
    #[must_use]
    pub fn transfer_count(&self) -> u32 {
        self.transfers
    }

    /// Descriptors currently allocated.
    #[must_use]
    pub fn descriptor_capacity(&self) -> usize {
        self.chain.capacity()
    }

    /// Free the descriptor pool. The next send reallocates it.
    pub fn release(&mut self) {
        self.chain.release();
    }

    /// The hardware backend.
    #[must_use]
    pub fn output(&self) -> &P {
        &self.output
    }

    /// The hardware backend, mutably.
    pub fn output_mut(&mut self) -> &mut P {
        &mut self.output
    }
}
