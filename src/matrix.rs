//! Pixel-level API over the whole driver.
//!
//! [`Matrix`] is what effects and UI code talk to. Pixels written between two
//! calls to [`Matrix::update`] make up one frame; every update starts from a
//! black buffer.
//!
//! # Example
//! ```rust
//! # #[cfg(feature = "host")]
//! # {
//! use mbi5153_driver::clock::ClockLoopConfig;
//! use mbi5153_driver::host::{leak_signals, RecordingBus, SimulatedLoop};
//! use mbi5153_driver::matrix::{DriverConfig, Matrix};
//! use mbi5153_driver::parallel::ParallelBusConfig;
//! use mbi5153_driver::Mbi5153Panel78;
//!
//! let mut matrix = Matrix::<Mbi5153Panel78, _, _>::new(
//!     RecordingBus::new(),
//!     SimulatedLoop::new(),
//!     leak_signals(),
//!     ParallelBusConfig::default(),
//!     ClockLoopConfig::default(),
//!     DriverConfig::default(),
//! )
//! .unwrap();
//! matrix.init().unwrap();
//!
//! matrix.set_pixel(10, 10, 255, 0, 0);
//! matrix.update().unwrap();
//! # }
//! ```

use core::convert::Infallible;

use embedded_graphics::pixelcolor::RgbColor;
use embedded_graphics::prelude::{DrawTarget, OriginDimensions, Size};
use embedded_graphics::Pixel;

use crate::clock::{check_clock_ratio, ClockAddressEngine, ClockLoopConfig, LoopPeripheral};
use crate::config::{ChipSettings, ConfigProgrammer};
use crate::greyscale::{GreyscaleBuffer, Rotation};
use crate::parallel::{ParallelBusConfig, ParallelDataEngine, ParallelOutput};
use crate::scheduler::FrameScheduler;
use crate::{Color, DriverError, DriverSignals, PanelLayout};

/// Runtime settings of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DriverConfig {
    /// Spins before a DMA wait gives up. `None` waits forever.
    pub spin_limit: Option<u32>,
    /// Initial brightness level, 0-255
    pub brightness: u8,
    /// Initial rotation
    pub rotation: Rotation,
    /// Fixed chip register settings
    pub chip: ChipSettings,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            spin_limit: None,
            brightness: 128,
            rotation: Rotation::Deg0,
            chip: ChipSettings::default(),
        }
    }
}

/// An MBI5153 panel.
#[derive(Debug)]
pub struct Matrix<L: PanelLayout, P, C> {
    scheduler: FrameScheduler<L, P, C>,
    bus: ParallelBusConfig,
    clock_loop: ClockLoopConfig,
    rotation: Rotation,
    ready: bool,
}

impl<L, P, C> Matrix<L, P, C>
where
    L: PanelLayout,
    P: ParallelOutput,
    C: LoopPeripheral,
{
    /// Allocate the greyscale buffer and assemble the driver. Nothing is sent
    /// until [`init`](Self::init).
    ///
    /// # Errors
    ///
    /// [`DriverError::OutOfDmaMemory`] if the buffer cannot be allocated.
    pub fn new(
        output: P,
        peripheral: C,
        signals: &'static DriverSignals,
        bus: ParallelBusConfig,
        clock_loop: ClockLoopConfig,
        config: DriverConfig,
    ) -> Result<Self, DriverError> {
        let buffer = GreyscaleBuffer::new()?;
        let data = ParallelDataEngine::new(output, &signals.transfer_done, config.spin_limit);
        let clock = ClockAddressEngine::new(peripheral, &signals.clock_loop, config.spin_limit);
        let programmer = ConfigProgrammer::new(config.chip, config.brightness);
        Ok(Self {
            scheduler: FrameScheduler::new(buffer, data, clock, programmer),
            bus,
            clock_loop,
            rotation: config.rotation,
            ready: false,
        })
    }

    /// Configure both peripherals, start GCLK, program the chips and show a
    /// blank frame. Does nothing once the driver is ready.
    ///
    /// # Errors
    ///
    /// [`DriverError::ClockRatio`] if GCLK is too slow for DCLK, or any error
    /// from the engines. The driver stays not ready.
    pub fn init(&mut self) -> Result<(), DriverError> {
        if self.ready {
            return Ok(());
        }
        match self.try_init() {
            Ok(()) => {
                self.ready = true;
                info!("panel ready: {}x{}", L::WIDTH, L::HEIGHT);
                Ok(())
            }
            Err(err) => {
                error!("panel init failed: {}", err);
                Err(err)
            }
        }
    }

    fn try_init(&mut self) -> Result<(), DriverError> {
        check_clock_ratio(self.clock_loop.gclk_hz(), self.bus.dclk_hz())?;
        self.scheduler.data_mut().configure(&self.bus)?;
        if !self.scheduler.clock().is_running() {
            self.scheduler
                .clock_mut()
                .setup(&self.clock_loop, L::SCAN_LINES)?;
        }
        self.scheduler.boot()?;
        self.scheduler.run_frame()
    }

    /// Whether [`init`](Self::init) has succeeded.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Reboot the chain and restart GCLK after an [`update`](Self::update)
    /// failed. Pixel writes are dropped until this succeeds.
    ///
    /// # Errors
    ///
    /// [`DriverError::NotReady`] before a successful [`init`](Self::init),
    /// otherwise any error from the engines.
    pub fn recover(&mut self) -> Result<(), DriverError> {
        if !self.ready {
            return Err(DriverError::NotReady);
        }
        warn!("recovering after a failed frame");
        self.scheduler.boot()
    }

    /// Set one pixel. Coordinates are in the rotated screen space;
    /// anything outside it is ignored, as is any write while a failed frame
    /// may still own the buffer.
    pub fn set_pixel(&mut self, x: i32, y: i32, r: u8, g: u8, b: u8) {
        if !self.scheduler.is_building() {
            return;
        }
        let (Ok(x), Ok(y)) = (usize::try_from(x), usize::try_from(y)) else {
            return;
        };
        if let Some((px, py)) = self.rotation.transform(x, y, L::WIDTH, L::HEIGHT) {
            self.scheduler.buffer_mut().set_pixel(px, py, r, g, b);
        }
    }

    /// Read back a pixel written since the last update.
    #[must_use]
    pub fn pixel(&self, x: i32, y: i32) -> Option<(u8, u8, u8)> {
        let x = usize::try_from(x).ok()?;
        let y = usize::try_from(y).ok()?;
        let (px, py) = self.rotation.transform(x, y, L::WIDTH, L::HEIGHT)?;
        self.scheduler.buffer().decode_pixel(px, py)
    }

    /// Set every pixel to one colour.
    pub fn fill_screen(&mut self, r: u8, g: u8, b: u8) {
        if self.scheduler.is_building() {
            self.scheduler.buffer_mut().fill(r, g, b);
        }
    }

    /// Blank the frame being built.
    pub fn clear_screen(&mut self) {
        if self.scheduler.is_building() {
            self.scheduler.buffer_mut().clear();
        }
    }

    /// Request a brightness level. Sent to the chips during the next
    /// [`update`](Self::update).
    pub fn set_brightness(&mut self, level: u8) {
        if self.scheduler.programmer_mut().set_brightness(level) {
            debug!("brightness {} pending", level);
        }
    }

    /// Last requested brightness level.
    #[must_use]
    pub fn brightness(&self) -> u8 {
        self.scheduler.programmer().brightness()
    }

    /// Current gain code for the requested brightness.
    #[must_use]
    pub fn brightness_code(&self) -> u8 {
        self.scheduler.programmer().brightness_code()
    }

    /// Set the rotation by index, 0 to 3. Larger values clamp to 3.
    pub fn set_rotation(&mut self, rotation: u8) {
        self.rotation = Rotation::from_index(rotation);
    }

    /// Rotate a further 90 degrees clockwise.
    pub fn rotate90(&mut self) {
        self.rotation = self.rotation.next();
    }

    /// Current rotation.
    #[must_use]
    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Width of the rotated screen.
    #[must_use]
    pub fn width(&self) -> usize {
        if self.rotation.swaps_axes() {
            L::HEIGHT
        } else {
            L::WIDTH
        }
    }

    /// Height of the rotated screen.
    #[must_use]
    pub fn height(&self) -> usize {
        if self.rotation.swaps_axes() {
            L::WIDTH
        } else {
            L::HEIGHT
        }
    }

    /// Display the frame and start a new, blank one.
    ///
    /// # Errors
    ///
    /// [`DriverError::NotReady`] before a successful [`init`](Self::init),
    /// otherwise any error from the frame scheduler.
    pub fn update(&mut self) -> Result<(), DriverError> {
        if !self.ready {
            return Err(DriverError::NotReady);
        }
        self.scheduler.run_frame()
    }

    /// The frame scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &FrameScheduler<L, P, C> {
        &self.scheduler
    }

    /// The frame scheduler, mutably.
    pub fn scheduler_mut(&mut self) -> &mut FrameScheduler<L, P, C> {
        &mut self.scheduler
    }
}

impl<L, P, C> OriginDimensions for Matrix<L, P, C>
where
    L: PanelLayout,
    P: ParallelOutput,
    C: LoopPeripheral,
{
    fn size(&self) -> Size {
        Size::new(self.width() as u32, self.height() as u32)
    }
}

impl<L, P, C> DrawTarget for Matrix<L, P, C>
where
    L: PanelLayout,
    P: ParallelOutput,
    C: LoopPeripheral,
{
    type Color = Color;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            self.set_pixel(point.x, point.y, color.r(), color.g(), color.b());
        }
        Ok(())
    }

    fn clear(&mut self, color: Self::Color) -> Result<(), Self::Error> {
        self.fill_screen(color.r(), color.g(), color.b());
        Ok(())
    }
}
