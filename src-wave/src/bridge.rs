//! Callback bridge between driver threads and engines
//!
//! A driver callback arrives on a thread the library does not own, carrying
//! two opaque values: the instance token given at open time and, for
//! completions, the token of the buffer that came back. The bridge resolves
//! both through the dispatch table, moves the buffer to Completed and hands
//! it to the engine's event channel.
//!
//! Neither token is ever an address, so a stale or corrupted value resolves
//! to nothing instead of to freed memory.

use crate::audio_buffer::{BufferId, BufferState};
use crate::driver::Direction;
use crate::registry::{self, EngineShared};

// Driver message codes, values as defined by mmsystem.h
pub const MM_WOM_OPEN: u32 = 0x3BB;
pub const MM_WOM_CLOSE: u32 = 0x3BC;
pub const MM_WOM_DONE: u32 = 0x3BD;
pub const MM_WIM_OPEN: u32 = 0x3BE;
pub const MM_WIM_CLOSE: u32 = 0x3BF;
pub const MM_WIM_DATA: u32 = 0x3C0;

/// Notification delivered by a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMessage {
    /// Device opened
    Opened,
    /// Buffer finished playing or recording
    Done { buffer: usize, bytes_recorded: usize },
    /// Device closed
    Closed,
}

/// Kind of a raw driver message code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Opened,
    Done,
    Closed,
}

/// Inconsistency between a driver callback and the engine state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("No engine registered for instance {0}")]
    UnknownInstance(usize),

    #[error("Engine {instance} has no prepared buffer {buffer}")]
    UnknownBuffer { instance: usize, buffer: usize },

    #[error("{buffer} reported done while {state:?}")]
    NotQueued { buffer: BufferId, state: BufferState },
}

/// Decode a raw message code for a device of the given direction
///
/// Codes belonging to the other direction, or unknown codes, decode to None.
pub fn decode_message(direction: Direction, code: u32) -> Option<MessageKind> {
    match (direction, code) {
        (Direction::Output, MM_WOM_OPEN) | (Direction::Input, MM_WIM_OPEN) => {
            Some(MessageKind::Opened)
        }
        (Direction::Output, MM_WOM_DONE) | (Direction::Input, MM_WIM_DATA) => {
            Some(MessageKind::Done)
        }
        (Direction::Output, MM_WOM_CLOSE) | (Direction::Input, MM_WIM_CLOSE) => {
            Some(MessageKind::Closed)
        }
        _ => None,
    }
}

/// Route a driver notification to the engine registered under `instance`
///
/// A completion blocks the calling thread until the application receives
/// the event or the engine closes its channel.
pub fn dispatch(instance: usize, message: DriverMessage) -> Result<(), BridgeError> {
    let engine = registry::lookup(instance).ok_or(BridgeError::UnknownInstance(instance))?;

    match message {
        DriverMessage::Opened => {
            engine.open_channel();
            log::debug!("{:?} engine {} opened", engine.direction(), instance);
            Ok(())
        }
        DriverMessage::Done {
            buffer,
            bytes_recorded,
        } => complete(&engine, buffer, bytes_recorded),
        DriverMessage::Closed => {
            engine.close_channel();
            log::debug!("{:?} engine {} closed", engine.direction(), instance);
            Ok(())
        }
    }
}

fn complete(engine: &EngineShared, raw: usize, bytes_recorded: usize) -> Result<(), BridgeError> {
    let id = BufferId::from_raw(raw);
    let buffer = engine
        .prepared_buffer(id)
        .ok_or(BridgeError::UnknownBuffer {
            instance: engine.token(),
            buffer: raw,
        })?;

    let state = buffer.state();
    if state != BufferState::Queued {
        return Err(BridgeError::NotQueued { buffer: id, state });
    }

    buffer.set_bytes_recorded(bytes_recorded);
    buffer
        .transition(BufferState::Completed)
        .map_err(|err| BridgeError::NotQueued {
            buffer: id,
            state: err.from,
        })?;
    let count = engine.record_completion();
    log::trace!("{} done ({} bytes, completion #{})", id, bytes_recorded, count);

    match engine.publisher() {
        Some(publisher) => {
            if publisher.publish(buffer).is_err() {
                log::debug!("{} completed after its event channel closed", id);
            }
        }
        None => log::debug!("{} completed with no event channel open", id),
    }
    Ok(())
}

/// Dispatch from a driver callback, where no error can be returned
///
/// An inconsistency here means the driver and the engine disagree about who
/// owns a buffer, so the process is aborted.
pub fn dispatch_or_abort(instance: usize, message: DriverMessage) {
    if let Err(err) = dispatch(instance, message) {
        log::error!("Fatal driver callback inconsistency: {}", err);
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::WaveBuffer;
    use crossbeam::channel::TryRecvError;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct Registered(Arc<EngineShared>);

    impl Registered {
        fn new(direction: Direction) -> Self {
            let shared = EngineShared::new(direction);
            registry::register(&shared);
            Self(shared)
        }

        fn token(&self) -> usize {
            self.0.token()
        }
    }

    impl Drop for Registered {
        fn drop(&mut self) {
            registry::unregister(self.0.token());
        }
    }

    fn queued_buffer(engine: &EngineShared) -> WaveBuffer {
        let buffer = WaveBuffer::with_len(8).unwrap();
        buffer.transition(BufferState::Prepared).unwrap();
        engine.insert_prepared(&buffer);
        buffer.transition(BufferState::Queued).unwrap();
        buffer
    }

    #[test]
    fn test_decode_message() {
        assert_eq!(decode_message(Direction::Output, MM_WOM_DONE), Some(MessageKind::Done));
        assert_eq!(decode_message(Direction::Input, MM_WIM_DATA), Some(MessageKind::Done));
        assert_eq!(decode_message(Direction::Input, MM_WIM_OPEN), Some(MessageKind::Opened));
        assert_eq!(decode_message(Direction::Output, MM_WOM_CLOSE), Some(MessageKind::Closed));
        assert_eq!(decode_message(Direction::Output, MM_WIM_DATA), None);
        assert_eq!(decode_message(Direction::Input, 0x3B9), None);
    }

    #[test]
    fn test_unknown_instance() {
        assert_eq!(
            dispatch(usize::MAX - 1, DriverMessage::Opened),
            Err(BridgeError::UnknownInstance(usize::MAX - 1))
        );
    }

    #[test]
    fn test_done_publishes_completed_buffer() {
        let engine = Registered::new(Direction::Input);
        dispatch(engine.token(), DriverMessage::Opened).unwrap();
        let events = engine.0.events();
        let buffer = queued_buffer(&engine.0);
        let raw = buffer.id().as_raw();
        let token = engine.token();

        let driver = thread::spawn(move || {
            dispatch(
                token,
                DriverMessage::Done {
                    buffer: raw,
                    bytes_recorded: 6,
                },
            )
        });

        let received = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received.id(), buffer.id());
        assert_eq!(received.state(), BufferState::Completed);
        assert_eq!(received.bytes_recorded(), 6);
        assert_eq!(driver.join().unwrap(), Ok(()));
        assert_eq!(engine.0.completions(), 1);
    }

    #[test]
    fn test_stale_buffer_is_rejected_without_side_effects() {
        let engine = Registered::new(Direction::Output);
        dispatch(engine.token(), DriverMessage::Opened).unwrap();
        let events = engine.0.events();
        let buffer = queued_buffer(&engine.0);
        let stale = WaveBuffer::with_len(8).unwrap();

        let result = dispatch(
            engine.token(),
            DriverMessage::Done {
                buffer: stale.id().as_raw(),
                bytes_recorded: 0,
            },
        );

        assert_eq!(
            result,
            Err(BridgeError::UnknownBuffer {
                instance: engine.token(),
                buffer: stale.id().as_raw(),
            })
        );
        assert_eq!(buffer.state(), BufferState::Queued);
        assert_eq!(stale.state(), BufferState::Raw);
        assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(engine.0.completions(), 0);
    }

    #[test]
    fn test_done_for_unqueued_buffer_is_rejected() {
        let engine = Registered::new(Direction::Output);
        let buffer = WaveBuffer::with_len(8).unwrap();
        buffer.transition(BufferState::Prepared).unwrap();
        engine.0.insert_prepared(&buffer);

        let result = dispatch(
            engine.token(),
            DriverMessage::Done {
                buffer: buffer.id().as_raw(),
                bytes_recorded: 8,
            },
        );

        assert_eq!(
            result,
            Err(BridgeError::NotQueued {
                buffer: buffer.id(),
                state: BufferState::Prepared,
            })
        );
        assert_eq!(buffer.state(), BufferState::Prepared);
        assert_eq!(buffer.bytes_recorded(), 0);
    }

    #[test]
    fn test_done_after_close_still_completes() {
        let engine = Registered::new(Direction::Output);
        dispatch(engine.token(), DriverMessage::Opened).unwrap();
        let events = engine.0.events();
        let buffer = queued_buffer(&engine.0);

        dispatch(engine.token(), DriverMessage::Closed).unwrap();
        assert!(events.is_closed());
        assert!(events.recv().is_none());

        dispatch(
            engine.token(),
            DriverMessage::Done {
                buffer: buffer.id().as_raw(),
                bytes_recorded: 8,
            },
        )
        .unwrap();
        assert_eq!(buffer.state(), BufferState::Completed);
    }
}
