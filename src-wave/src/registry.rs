//! Process-wide dispatch table
//!
//! Drivers only ever see an opaque instance token. The table maps that token
//! back to the engine's shared state. It is created by the first engine that
//! registers and dropped again when the last one unregisters.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audio_buffer::{BufferId, WaveBuffer};
use crate::driver::Direction;
use crate::events::{EventChannel, EventStream, Publisher};

/// Engine state the callback bridge needs to reach
pub(crate) struct EngineShared {
    token: usize,
    direction: Direction,
    channel: Mutex<Option<EventChannel>>,
    prepared: Mutex<HashMap<BufferId, WaveBuffer>>,
    completions: AtomicU64,
}

impl EngineShared {
    pub(crate) fn new(direction: Direction) -> Arc<Self> {
        Arc::new(Self {
            token: next_token(),
            direction,
            channel: Mutex::new(None),
            prepared: Mutex::new(HashMap::new()),
            completions: AtomicU64::new(0),
        })
    }

    pub(crate) fn token(&self) -> usize {
        self.token
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    /// Start a fresh event channel, ending any previous one
    pub(crate) fn open_channel(&self) {
        let mut channel = self.channel.lock();
        if let Some(stale) = channel.replace(EventChannel::new()) {
            log::warn!("{:?} engine {} reopened its event channel", self.direction, self.token);
            stale.close();
        }
    }

    /// End the event channel; idempotent
    pub(crate) fn close_channel(&self) {
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
            log::debug!("{:?} engine {} event channel closed", self.direction, self.token);
        }
    }

    pub(crate) fn events(&self) -> EventStream {
        self.channel
            .lock()
            .as_ref()
            .map(EventChannel::stream)
            .unwrap_or_else(EventStream::ended)
    }

    pub(crate) fn publisher(&self) -> Option<Publisher> {
        self.channel.lock().as_ref().map(EventChannel::publisher)
    }

    pub(crate) fn insert_prepared(&self, buffer: &WaveBuffer) {
        self.prepared.lock().insert(buffer.id(), buffer.clone());
    }

    pub(crate) fn remove_prepared(&self, id: BufferId) -> Option<WaveBuffer> {
        self.prepared.lock().remove(&id)
    }

    pub(crate) fn prepared_buffer(&self, id: BufferId) -> Option<WaveBuffer> {
        self.prepared.lock().get(&id).cloned()
    }

    pub(crate) fn prepared_buffers(&self) -> Vec<WaveBuffer> {
        self.prepared.lock().values().cloned().collect()
    }

    pub(crate) fn prepared_count(&self) -> usize {
        self.prepared.lock().len()
    }

    pub(crate) fn record_completion(&self) -> u64 {
        self.completions.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn completions(&self) -> u64 {
        self.completions.load(Ordering::Relaxed)
    }
}

type DispatchTable = HashMap<usize, Arc<EngineShared>>;

static DISPATCH_TABLE: Mutex<Option<DispatchTable>> = parking_lot::const_mutex(None);

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);

fn next_token() -> usize {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// Make an engine reachable from driver callbacks
pub(crate) fn register(shared: &Arc<EngineShared>) {
    let mut table = DISPATCH_TABLE.lock();
    let engines = table.get_or_insert_with(|| {
        log::debug!("Dispatch table created");
        HashMap::new()
    });
    engines.insert(shared.token(), Arc::clone(shared));
}

/// Remove an engine; drops the table once it is empty
pub(crate) fn unregister(token: usize) {
    let mut table = DISPATCH_TABLE.lock();
    if let Some(engines) = table.as_mut() {
        engines.remove(&token);
        if engines.is_empty() {
            *table = None;
            log::debug!("Dispatch table released");
        }
    }
}

/// Resolve a driver instance token
pub(crate) fn lookup(token: usize) -> Option<Arc<EngineShared>> {
    DISPATCH_TABLE
        .lock()
        .as_ref()
        .and_then(|engines| engines.get(&token).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup_unregister() {
        let shared = EngineShared::new(Direction::Output);
        assert!(lookup(shared.token()).is_none());

        register(&shared);
        let found = lookup(shared.token()).unwrap();
        assert!(Arc::ptr_eq(&found, &shared));

        unregister(shared.token());
        assert!(lookup(shared.token()).is_none());
    }

    #[test]
    fn test_tokens_are_unique_and_nonzero() {
        let a = EngineShared::new(Direction::Input);
        let b = EngineShared::new(Direction::Input);
        assert_ne!(a.token(), 0);
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn test_unregister_unknown_token_is_noop() {
        unregister(usize::MAX);
        assert!(lookup(usize::MAX).is_none());
    }

    #[test]
    fn test_channel_lifecycle() {
        let shared = EngineShared::new(Direction::Output);
        assert!(shared.events().is_closed());
        assert!(shared.publisher().is_none());

        shared.open_channel();
        let first = shared.events();
        assert!(!first.is_closed());

        shared.open_channel();
        assert!(first.is_closed());

        shared.close_channel();
        shared.close_channel();
        assert!(shared.events().is_closed());
    }

    #[test]
    fn test_prepared_map() {
        let shared = EngineShared::new(Direction::Input);
        let buffer = WaveBuffer::with_len(2).unwrap();
        shared.insert_prepared(&buffer);
        assert_eq!(shared.prepared_count(), 1);
        assert_eq!(shared.prepared_buffer(buffer.id()).unwrap().id(), buffer.id());
        assert!(shared.remove_prepared(buffer.id()).is_some());
        assert!(shared.prepared_buffer(buffer.id()).is_none());
    }
}
