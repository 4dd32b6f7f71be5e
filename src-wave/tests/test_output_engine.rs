//! Output engine tests against the loopback driver

use std::sync::Arc;
use std::time::{Duration, Instant};

use sotf_wave::driver::loopback::{LoopbackConfig, LoopbackDriver};
use sotf_wave::utils::{MMSYSERR_BADDEVICEID, WAVERR_BADFORMAT, WAVERR_STILLPLAYING};
use sotf_wave::{
    BitsPerSample, BufferState, Channels, WaveBuffer, WaveFormat, WaveOut, WAVE_MAPPER,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Helpers
// ============================================================================

fn cd_format() -> WaveFormat {
    WaveFormat::new(Channels::Stereo, 44_100, BitsPerSample::Sixteen)
}

fn engine() -> WaveOut {
    WaveOut::new(Arc::new(LoopbackDriver::new(LoopbackConfig::default())))
}

/// Poll until the driver has handed `buffer` back, without receiving its event
fn wait_until_completed(buffer: &WaveBuffer) {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while buffer.state() != BufferState::Completed {
        assert!(Instant::now() < deadline, "{} never completed", buffer.id());
        std::thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_play_one_buffer_twice() {
    let mut out = engine();
    out.open(0, &cd_format()).unwrap();
    assert!(out.is_open());
    assert_eq!(out.format(), Some(cd_format()));

    let buffer = WaveBuffer::allocate(&cd_format(), 1).unwrap();
    let id = buffer.id();
    out.prepare_buffer(buffer).unwrap();
    let events = out.events();

    for round in 1..=2u64 {
        out.write().unwrap();
        let done = events.recv_timeout(EVENT_TIMEOUT).unwrap();
        assert_eq!(done.id(), id);
        assert_eq!(done.state(), BufferState::Completed);
        assert_eq!(out.completions(), round);
    }

    let buffer = out.unprepare_buffer().unwrap();
    assert_eq!(buffer.state(), BufferState::Raw);
    assert!(out.buffer().is_none());

    out.close().unwrap();
    assert!(!out.is_open());
    assert!(events.is_closed());
    assert!(events.recv().is_none());
    assert!(out.events().recv().is_none());
}

#[test]
fn test_open_with_mapper() {
    let mut out = engine();
    out.open(WAVE_MAPPER, &cd_format()).unwrap();
    out.close().unwrap();
}

#[test]
fn test_open_errors_leave_engine_closed() {
    let mut out = engine();

    let err = out.open(5, &cd_format()).unwrap_err();
    assert_eq!(err.device_code(), Some(MMSYSERR_BADDEVICEID));
    assert!(!out.is_open());
    assert!(out.events().is_closed());

    let err = out.open(0, &WaveFormat::pcm(6, 44_100, 16)).unwrap_err();
    assert_eq!(err.device_code(), Some(WAVERR_BADFORMAT));
    assert!(!out.is_open());

    out.open(0, &cd_format()).unwrap();
    out.close().unwrap();
}

#[test]
fn test_reopen_after_close() {
    let mut out = engine();
    out.open(0, &cd_format()).unwrap();
    out.close().unwrap();
    out.open(0, &cd_format()).unwrap();
    assert!(!out.events().is_closed());
    out.close().unwrap();
}

// ============================================================================
// Queued buffers
// ============================================================================

#[test]
fn test_unprepare_while_queued_fails() {
    let mut out = engine();
    out.open(0, &cd_format()).unwrap();
    out.pause().unwrap();

    out.prepare_buffer(WaveBuffer::with_len(64).unwrap()).unwrap();
    let events = out.events();
    out.write().unwrap();
    assert!(out.is_queued());

    let err = out.unprepare_buffer().unwrap_err();
    assert_eq!(err.device_code(), Some(WAVERR_STILLPLAYING));
    assert!(err.to_string().contains("still playing"));
    assert_eq!(out.buffer().unwrap().state(), BufferState::Queued);

    out.reset().unwrap();
    let done = events.recv_timeout(EVENT_TIMEOUT).unwrap();
    assert_eq!(done.state(), BufferState::Completed);
    assert!(!out.is_queued());

    out.unprepare_buffer().unwrap();
    out.close().unwrap();
}

#[test]
fn test_paused_device_holds_buffer_until_restart() {
    let mut out = engine();
    out.open(0, &cd_format()).unwrap();
    out.pause().unwrap();
    out.prepare_buffer(WaveBuffer::with_len(64).unwrap()).unwrap();
    let events = out.events();
    out.write().unwrap();

    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(out.is_queued());

    out.restart().unwrap();
    events.recv_timeout(EVENT_TIMEOUT).unwrap();
    out.unprepare_buffer().unwrap();
    out.close().unwrap();
}

#[test]
fn test_prepare_of_foreign_buffer_is_rejected() {
    let mut out = engine();
    out.open(0, &cd_format()).unwrap();
    let buffer = WaveBuffer::with_len(64).unwrap();
    out.prepare_buffer(buffer.clone()).unwrap();
    let returned = out.unprepare_buffer().unwrap();
    assert_eq!(returned.id(), buffer.id());

    // A buffer already prepared elsewhere cannot be taken over.
    let mut other = engine();
    other.open(0, &cd_format()).unwrap();
    other.prepare_buffer(buffer.clone()).unwrap();
    assert!(out.prepare_buffer(buffer).unwrap_err().device_code().is_some());
    assert!(out.buffer().is_none());

    other.unprepare_buffer().unwrap();
    other.close().unwrap();
    out.close().unwrap();
}

#[test]
fn test_drop_while_queued_ends_stream() {
    let mut out = engine();
    out.open(0, &cd_format()).unwrap();
    out.pause().unwrap();
    let buffer = WaveBuffer::with_len(64).unwrap();
    out.prepare_buffer(buffer.clone()).unwrap();
    let events = out.events();
    out.write().unwrap();

    drop(out);

    assert!(events.is_closed());
    assert!(events.recv().is_none());
    assert_eq!(buffer.state(), BufferState::Raw);
}

#[test]
fn test_close_with_undelivered_completion() {
    for _ in 0..20 {
        let mut out = engine();
        out.open(0, &cd_format()).unwrap();
        let buffer = WaveBuffer::with_len(256).unwrap();
        out.prepare_buffer(buffer.clone()).unwrap();
        let events = out.events();
        out.write().unwrap();

        // The completion is never received: the driver thread is still
        // waiting to deliver it when the engine closes.
        wait_until_completed(&buffer);
        assert!(!out.is_queued());
        let returned = out.unprepare_buffer().unwrap();
        assert_eq!(returned.state(), BufferState::Raw);
        out.close().unwrap();

        assert!(!out.is_open());
        assert!(events.is_closed());
    }
}

#[test]
#[should_panic(expected = "still prepared")]
fn test_close_with_prepared_buffer_panics() {
    let mut out = engine();
    out.open(0, &cd_format()).unwrap();
    out.prepare_buffer(WaveBuffer::with_len(8).unwrap()).unwrap();
    let _ = out.close();
}

#[test]
#[should_panic(expected = "cannot submit")]
fn test_write_while_queued_panics() {
    let mut out = engine();
    out.open(0, &cd_format()).unwrap();
    out.pause().unwrap();
    out.prepare_buffer(WaveBuffer::with_len(8).unwrap()).unwrap();
    out.write().unwrap();
    let _ = out.write();
}
