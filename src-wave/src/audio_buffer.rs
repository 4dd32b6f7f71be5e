//! Wave buffers and their lifecycle
//!
//! A `WaveBuffer` is a handle on a fixed-size byte region plus the state the
//! buffer is in:
//! - Raw: owned by the application, unknown to the driver
//! - Prepared: registered with an open device, owned by the application
//! - Queued: submitted, owned by the driver until it completes
//! - Completed: handed back by the driver, owned by the application again
//!
//! Cloning a `WaveBuffer` clones the handle (same id, same state). Use
//! `clone_descriptor` for a second buffer over the same bytes, e.g. to record
//! into one region and play it back from another buffer.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::format::WaveFormat;
use crate::utils::next_buffer_id;
use crate::{Result, WaveError};

/// Process-unique buffer token, handed to the driver in place of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(usize);

impl BufferId {
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Lifecycle state of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    Raw,
    Prepared,
    Queued,
    Completed,
}

impl BufferState {
    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: BufferState) -> bool {
        use BufferState::*;
        matches!(
            (self, next),
            (Raw, Prepared)
                | (Prepared, Queued)
                | (Prepared, Raw)
                | (Queued, Completed)
                | (Completed, Queued)
                | (Completed, Raw)
        )
    }

    /// Whether the driver currently owns the buffer
    pub fn is_driver_owned(self) -> bool {
        self == BufferState::Queued
    }
}

/// Attempted lifecycle transition the state machine does not allow
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from:?} -> {to:?} for {id}")]
pub struct TransitionError {
    pub id: BufferId,
    pub from: BufferState,
    pub to: BufferState,
}

/// Byte region shared by every buffer cloned from the same allocation
///
/// The boxed slice is never reallocated, so its address stays valid for a
/// driver that was handed a raw pointer at prepare time.
struct Region {
    bytes: Mutex<Box<[u8]>>,
    len: usize,
}

impl Region {
    fn allocate(len: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|e| WaveError::Allocation(format!("allocator refused {len} bytes: {e}")))?;
        bytes.resize(len, 0u8);
        Ok(Self {
            bytes: Mutex::new(bytes.into_boxed_slice()),
            len,
        })
    }

    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.lock())
    }

    fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.lock())
    }

    #[cfg_attr(not(windows), allow(dead_code))]
    fn as_mut_ptr(&self) -> *mut u8 {
        self.bytes.lock().as_mut_ptr()
    }
}

struct BufferHeader {
    id: BufferId,
    region: Arc<Region>,
    state: Mutex<BufferState>,
    bytes_recorded: AtomicUsize,
}

/// Handle on a fixed-size audio buffer
#[derive(Clone)]
pub struct WaveBuffer {
    header: Arc<BufferHeader>,
}

impl WaveBuffer {
    /// Allocate a zeroed buffer holding `seconds` of audio in `format`
    pub fn allocate(format: &WaveFormat, seconds: u32) -> Result<Self> {
        let len = format.buffer_len(seconds).ok_or_else(|| {
            WaveError::Allocation(format!(
                "{seconds}s of {format} does not fit a 32-bit buffer length"
            ))
        })?;
        Self::with_len(len)
    }

    /// Allocate a zeroed buffer of `len` bytes
    pub fn with_len(len: usize) -> Result<Self> {
        if u32::try_from(len).is_err() {
            return Err(WaveError::Allocation(format!(
                "{len} bytes does not fit a 32-bit buffer length"
            )));
        }
        let region = Region::allocate(len)?;
        Ok(Self::over(Arc::new(region)))
    }

    fn over(region: Arc<Region>) -> Self {
        let buffer = Self {
            header: Arc::new(BufferHeader {
                id: BufferId(next_buffer_id()),
                region,
                state: Mutex::new(BufferState::Raw),
                bytes_recorded: AtomicUsize::new(0),
            }),
        };
        log::debug!("Allocated {} ({} bytes)", buffer.id(), buffer.len());
        buffer
    }

    /// New Raw buffer over the same bytes, with its own id and state
    pub fn clone_descriptor(&self) -> Self {
        Self::over(Arc::clone(&self.header.region))
    }

    pub fn id(&self) -> BufferId {
        self.header.id
    }

    pub fn len(&self) -> usize {
        self.header.region.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> BufferState {
        *self.header.state.lock()
    }

    /// Bytes the driver reported on the last completion
    pub fn bytes_recorded(&self) -> usize {
        self.header.bytes_recorded.load(Ordering::Acquire)
    }

    /// Whether both buffers view the same bytes
    pub fn shares_region_with(&self, other: &WaveBuffer) -> bool {
        Arc::ptr_eq(&self.header.region, &other.header.region)
    }

    /// Zero-fill the region
    pub fn clear(&self) {
        self.warn_if_driver_owned("clear");
        self.header.region.with_bytes_mut(|bytes| bytes.fill(0));
    }

    /// Copy of the current bytes
    pub fn to_vec(&self) -> Vec<u8> {
        self.header.region.with_bytes(<[u8]>::to_vec)
    }

    /// Copy of the bytes the driver reported as recorded
    pub fn recorded_data(&self) -> Vec<u8> {
        let recorded = self.bytes_recorded().min(self.len());
        self.header.region.with_bytes(|bytes| bytes[..recorded].to_vec())
    }

    /// Copy `data` to the start of the region; returns the bytes copied
    pub fn copy_from_slice(&self, data: &[u8]) -> usize {
        self.warn_if_driver_owned("write");
        self.header.region.with_bytes_mut(|bytes| {
            let n = data.len().min(bytes.len());
            bytes[..n].copy_from_slice(&data[..n]);
            n
        })
    }

    fn warn_if_driver_owned(&self, what: &str) {
        if self.state().is_driver_owned() {
            log::warn!("{} on {} while the driver owns it", what, self.id());
        }
    }

    /// Move to `to`, returning the previous state
    pub(crate) fn transition(&self, to: BufferState) -> std::result::Result<BufferState, TransitionError> {
        let mut state = self.header.state.lock();
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                id: self.id(),
                from,
                to,
            });
        }
        *state = to;
        log::trace!("{}: {:?} -> {:?}", self.id(), from, to);
        Ok(from)
    }

    /// Roll back a transition the driver refused
    pub(crate) fn restore(&self, previous: BufferState) {
        *self.header.state.lock() = previous;
    }

    pub(crate) fn set_bytes_recorded(&self, bytes: usize) {
        self.header
            .bytes_recorded
            .store(bytes.min(self.len()), Ordering::Release);
    }

    /// Driver-side read access to the bytes
    pub(crate) fn driver_read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.header.region.with_bytes(f)
    }

    /// Driver-side write access to the bytes
    pub(crate) fn driver_write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.header.region.with_bytes_mut(f)
    }

    /// Stable address of the region, for drivers that take raw pointers
    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.header.region.as_mut_ptr()
    }
}

impl fmt::Debug for WaveBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaveBuffer")
            .field("id", &self.id())
            .field("len", &self.len())
            .field("state", &self.state())
            .finish()
    }
}
