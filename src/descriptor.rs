//! Linked-list DMA descriptors.
//!
//! Both engines feed their peripherals through chains of GDMA-style
//! descriptors. A descriptor points at up to [`DESCRIPTOR_MAX_CHUNK`] bytes
//! and at the next descriptor; the last one carries the end-of-frame flag and
//! either ends the chain or loops back to the head.
//!
//! [`DescriptorChain`] owns the descriptor memory. It grows when a longer
//! buffer is linked and never shrinks unless [`DescriptorChain::release`] is
//! called.

use alloc::vec::Vec;
use core::ptr;

use bitfield::bitfield;

use crate::DriverError;

/// Largest payload a single descriptor may point at.
pub const DESCRIPTOR_MAX_CHUNK: usize = 4096 - 4;

/// Computes the number of descriptors needed for `len` bytes.
#[must_use]
pub const fn compute_descriptor_count(len: usize) -> usize {
    len.div_ceil(DESCRIPTOR_MAX_CHUNK)
}

bitfield! {
    /// First word of a DMA descriptor.
    ///
    /// The bit layout is as follows:
    /// - Bit 31: Owner (1 = DMA)
    /// - Bit 30: Successful end of frame
    /// - Bit 28: Error end of frame
    /// - Bits 23-12: Valid bytes in the buffer
    /// - Bits 11-0: Buffer size
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct DescriptorFlags(u32);
    impl Debug;
    pub owner, set_owner: 31;
    pub suc_eof, set_suc_eof: 30;
    pub err_eof, set_err_eof: 28;
    pub u16, length, set_length: 23, 12;
    pub u16, size, set_size: 11, 0;
}

/// A single DMA descriptor as read by the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct DmaDescriptor {
    /// Size, length and control flags
    pub flags: DescriptorFlags,
    /// Payload address
    pub buffer: *const u8,
    /// Next descriptor, or null at the end of a one-shot chain
    pub next: *const DmaDescriptor,
}

impl DmaDescriptor {
    /// An unused descriptor.
    pub const EMPTY: Self = Self {
        flags: DescriptorFlags(0),
        buffer: ptr::null(),
        next: ptr::null(),
    };

    /// Number of payload bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.flags.length())
    }

    /// Whether the descriptor carries no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this descriptor ends a transfer.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.flags.suc_eof()
    }

    /// View the payload.
    ///
    /// # Safety
    ///
    /// The memory this descriptor points at must still be alive and must not
    /// be mutated for the lifetime of the returned slice.
    #[must_use]
    pub unsafe fn payload(&self) -> &[u8] {
        if self.is_empty() || self.buffer.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.buffer, self.len()) }
    }
}

/// A contiguous region of memory to be linked into a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaSegment {
    ptr: *const u8,
    len: usize,
}

impl DmaSegment {
    /// Segment covering a byte slice.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        }
    }

    /// Segment covering a slice of plain words, sent in memory order.
    #[must_use]
    pub fn from_words<T: Copy>(words: &[T]) -> Self {
        Self {
            ptr: words.as_ptr().cast::<u8>(),
            len: core::mem::size_of_val(words),
        }
    }

    /// Segment covering raw memory, such as a header the hardware rereads.
    #[must_use]
    pub const fn from_raw(ptr: *const u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the segment is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// What the last descriptor of a chain points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChainEnd {
    /// Terminate the transfer after the last descriptor.
    Stop,
    /// Jump back to the first descriptor and keep going.
    LoopToHead,
}

/// Grow-only pool of descriptors linked into a single chain.
#[derive(Debug, Default)]
pub struct DescriptorChain {
    descriptors: Vec<DmaDescriptor>,
    in_use: usize,
}

impl DescriptorChain {
    /// Create an empty chain. No memory is allocated until the first link.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            descriptors: Vec::new(),
            in_use: 0,
        }
    }

    /// Number of descriptors the pool can hold without reallocating.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.descriptors.len()
    }

    /// Number of descriptors in the current chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.in_use
    }

    /// Whether the current chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// First descriptor of the current chain.
    #[must_use]
    pub fn head(&self) -> Option<&DmaDescriptor> {
        self.descriptors.get(..self.in_use)?.first()
    }

    /// Descriptors of the current chain in link order.
    pub fn iter(&self) -> impl Iterator<Item = &DmaDescriptor> {
        self.descriptors.iter().take(self.in_use)
    }

    /// Total payload bytes in the current chain.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.iter().map(DmaDescriptor::len).sum()
    }

    /// Free all descriptor memory.
    pub fn release(&mut self) {
        self.descriptors = Vec::new();
        self.in_use = 0;
    }

    fn reserve(&mut self, count: usize) -> Result<(), DriverError> {
        if count <= self.descriptors.len() {
            return Ok(());
        }
        debug!(
            "growing descriptor pool from {} to {} descriptors",
            self.descriptors.len(),
            count
        );
        // Drop the old pool first so peak usage stays at one pool.
        self.descriptors = Vec::new();
        self.in_use = 0;
        let mut pool = Vec::new();
        pool.try_reserve_exact(count)
            .map_err(|_| DriverError::OutOfDmaMemory {
                requested: count * core::mem::size_of::<DmaDescriptor>(),
            })?;
        pool.resize(count, DmaDescriptor::EMPTY);
        self.descriptors = pool;
        Ok(())
    }

    /// Split `segments` into descriptor-sized chunks and link them.
    ///
    /// Every segment starts on a fresh descriptor. The last descriptor gets
    /// the end-of-frame flag and, depending on `end`, a null or head link.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::OutOfDmaMemory`] if the pool has to grow and
    /// the allocation fails.
    pub fn link(&mut self, segments: &[DmaSegment], end: ChainEnd) -> Result<(), DriverError> {
        let count = segments
            .iter()
            .map(|segment| compute_descriptor_count(segment.len))
            .sum();
        self.reserve(count)?;

        let mut n = 0;
        for segment in segments {
            let mut offset = 0;
            while offset < segment.len {
                let chunk = (segment.len - offset).min(DESCRIPTOR_MAX_CHUNK);
                let mut flags = DescriptorFlags(0);
                flags.set_owner(true);
                flags.set_size(chunk as u16);
                flags.set_length(chunk as u16);
                let descriptor = &mut self.descriptors[n];
                descriptor.flags = flags;
                descriptor.buffer = segment.ptr.wrapping_add(offset);
                offset += chunk;
                n += 1;
            }
        }
        self.in_use = n;
        if n == 0 {
            return Ok(());
        }

        let base = self.descriptors.as_ptr();
        for i in 0..n - 1 {
            self.descriptors[i].next = base.wrapping_add(i + 1);
        }
        let last = &mut self.descriptors[n - 1];
        last.flags.set_suc_eof(true);
        last.next = match end {
            ChainEnd::Stop => ptr::null(),
            ChainEnd::LoopToHead => base,
        };
        trace!("linked {} descriptors", n);
        Ok(())
    }
}
