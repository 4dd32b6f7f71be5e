//! Per-engine completion event channel
//!
//! Completed buffers travel from the driver thread to the application over a
//! rendezvous channel: the publisher blocks until a consumer takes the
//! buffer, which gives the driver natural back-pressure. Closing the channel
//! sets an explicit end-of-stream flag, drops the senders so blocked
//! consumers wake up, and releases any publisher still waiting.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Select, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio_buffer::WaveBuffer;

/// Producer side, owned by the engine's shared state
pub(crate) struct EventChannel {
    tx: Sender<WaveBuffer>,
    rx: Receiver<WaveBuffer>,
    closing_tx: Sender<()>,
    closing_rx: Receiver<()>,
    closed: Arc<AtomicBool>,
}

impl EventChannel {
    pub(crate) fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        let (closing_tx, closing_rx) = channel::bounded(0);
        Self {
            tx,
            rx,
            closing_tx,
            closing_rx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn stream(&self) -> EventStream {
        EventStream {
            rx: self.rx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }

    pub(crate) fn publisher(&self) -> Publisher {
        Publisher {
            tx: self.tx.clone(),
            closing_rx: self.closing_rx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }

    /// Mark end-of-stream and drop both senders
    ///
    /// Consumers see disconnection once the last in-flight publisher returns.
    pub(crate) fn close(self) {
        self.closed.store(true, Ordering::Release);
        let Self { tx, closing_tx, .. } = self;
        drop(closing_tx);
        drop(tx);
    }
}

/// Short-lived sender used by the bridge for a single notification
pub(crate) struct Publisher {
    tx: Sender<WaveBuffer>,
    closing_rx: Receiver<()>,
    closed: Arc<AtomicBool>,
}

impl Publisher {
    /// Block until a consumer receives `buffer` or the channel closes
    ///
    /// Hands the buffer back when the channel closed before delivery.
    pub(crate) fn publish(&self, buffer: WaveBuffer) -> Result<(), WaveBuffer> {
        if self.closed.load(Ordering::Acquire) {
            return Err(buffer);
        }

        let mut select = Select::new();
        let send_index = select.send(&self.tx);
        let closing_index = select.recv(&self.closing_rx);
        let operation = select.select();

        if operation.index() == send_index {
            operation
                .send(&self.tx, buffer)
                .map_err(|err| err.into_inner())
        } else {
            debug_assert_eq!(operation.index(), closing_index);
            // Only ever completes as disconnected: nothing is sent on it.
            let _ = operation.recv(&self.closing_rx);
            Err(buffer)
        }
    }
}

/// Consumer handle on an engine's completion events
///
/// Every event carries the buffer that just came back from the driver.
/// `recv` returns None once the engine closed its channel.
#[derive(Clone)]
pub struct EventStream {
    rx: Receiver<WaveBuffer>,
    closed: Arc<AtomicBool>,
}

impl EventStream {
    /// A stream that is already at end-of-stream
    pub(crate) fn ended() -> Self {
        let (tx, rx) = channel::bounded(0);
        drop(tx);
        Self {
            rx,
            closed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Block for the next completed buffer, None at end-of-stream
    pub fn recv(&self) -> Option<WaveBuffer> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<WaveBuffer, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<WaveBuffer, TryRecvError> {
        self.rx.try_recv()
    }

    /// Whether the engine has closed this channel
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Underlying receiver, for `crossbeam::select!` across engines
    pub fn receiver(&self) -> &Receiver<WaveBuffer> {
        &self.rx
    }

    /// Blocking iterator that ends at end-of-stream
    pub fn iter(&self) -> channel::Iter<'_, WaveBuffer> {
        self.rx.iter()
    }
}

impl<'a> IntoIterator for &'a EventStream {
    type Item = WaveBuffer;
    type IntoIter = channel::Iter<'a, WaveBuffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("closed", &self.is_closed())
            .finish()
    }
}
