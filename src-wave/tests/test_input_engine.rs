//! Input engine tests against the loopback driver

use std::sync::Arc;
use std::time::{Duration, Instant};

use sotf_wave::driver::loopback::{LoopbackConfig, LoopbackDriver};
use sotf_wave::utils::WAVERR_STILLPLAYING;
use sotf_wave::{BitsPerSample, BufferState, Channels, WaveBuffer, WaveFormat, WaveIn};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn voice_format() -> WaveFormat {
    WaveFormat::new(Channels::Mono, 8_000, BitsPerSample::Eight)
}

fn open_engine() -> WaveIn {
    let mut input = WaveIn::new(Arc::new(LoopbackDriver::new(LoopbackConfig::default())));
    input.open(0, &voice_format()).unwrap();
    input
}

#[test]
fn test_completions_arrive_in_submission_order() {
    let mut input = open_engine();
    let keys: Vec<_> = (0..3)
        .map(|_| input.prepare_buffer(WaveBuffer::with_len(32).unwrap()).unwrap())
        .collect();
    let events = input.events();

    for &key in &keys {
        input.add_buffer(key).unwrap();
    }
    assert_eq!(input.queued_count(), 3);
    input.start().unwrap();

    for &key in &keys {
        let done = events.recv_timeout(EVENT_TIMEOUT).unwrap();
        assert_eq!(input.key_of(done.id()), Some(key));
        assert_eq!(done.state(), BufferState::Completed);
        assert_eq!(done.bytes_recorded(), 32);
    }
    assert_eq!(input.queued_count(), 0);
    assert_eq!(input.completions(), 3);

    for &key in &keys {
        input.unprepare_buffer(key).unwrap();
    }
    input.close().unwrap();
}

#[test]
fn test_recording_waits_for_start() {
    let mut input = open_engine();
    let key = input.prepare_buffer(WaveBuffer::with_len(16).unwrap()).unwrap();
    let events = input.events();
    input.add_buffer(key).unwrap();

    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

    input.start().unwrap();
    let done = events.recv_timeout(EVENT_TIMEOUT).unwrap();
    // Nothing was played, so the buffer holds 8-bit silence.
    assert_eq!(done.to_vec(), vec![0x80; 16]);

    input.add_buffer(key).unwrap();
    events.recv_timeout(EVENT_TIMEOUT).unwrap();

    input.stop().unwrap();
    input.unprepare_buffer(key).unwrap();
    input.close().unwrap();
}

#[test]
fn test_reset_returns_every_queued_buffer_empty() {
    let mut input = open_engine();
    let first = input.prepare_buffer(WaveBuffer::with_len(16).unwrap()).unwrap();
    let second = input.prepare_buffer(WaveBuffer::with_len(16).unwrap()).unwrap();
    let events = input.events();
    input.add_buffer(first).unwrap();
    input.add_buffer(second).unwrap();

    let err = input.unprepare_buffer(first).unwrap_err();
    assert_eq!(err.device_code(), Some(WAVERR_STILLPLAYING));

    input.reset().unwrap();
    for key in [first, second] {
        let done = events.recv_timeout(EVENT_TIMEOUT).unwrap();
        assert_eq!(input.key_of(done.id()), Some(key));
        assert_eq!(done.bytes_recorded(), 0);
    }

    input.unprepare_buffer(first).unwrap();
    input.unprepare_buffer(second).unwrap();
    assert_eq!(input.get_buffer(first).unwrap().state(), BufferState::Raw);
    input.close().unwrap();
}

#[test]
fn test_unprepare_raw_buffer_is_noop() {
    let mut input = open_engine();
    let key = input.prepare_buffer(WaveBuffer::with_len(16).unwrap()).unwrap();
    input.unprepare_buffer(key).unwrap();
    input.unprepare_buffer(key).unwrap();
    let buffer = input.remove_buffer(key).unwrap();
    assert_eq!(buffer.state(), BufferState::Raw);
    assert!(input.is_empty());
    input.close().unwrap();
}

#[test]
fn test_events_end_after_close() {
    let mut input = open_engine();
    let events = input.events();
    let waiter = std::thread::spawn(move || events.recv().is_none());
    std::thread::sleep(Duration::from_millis(50));
    input.close().unwrap();
    assert!(waiter.join().unwrap());
}

#[test]
fn test_close_with_undelivered_completion() {
    for _ in 0..20 {
        let mut input = open_engine();
        let buffer = WaveBuffer::with_len(16).unwrap();
        let key = input.prepare_buffer(buffer.clone()).unwrap();
        let events = input.events();
        input.add_buffer(key).unwrap();
        input.start().unwrap();

        let deadline = Instant::now() + EVENT_TIMEOUT;
        while buffer.state() != BufferState::Completed {
            assert!(Instant::now() < deadline, "{} never completed", buffer.id());
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(input.queued_count(), 0);

        input.stop().unwrap();
        input.unprepare_buffer(key).unwrap();
        input.close().unwrap();
        assert!(events.recv().is_none());
    }
}

#[test]
fn test_drop_with_queued_buffers() {
    let mut input = open_engine();
    let buffers: Vec<WaveBuffer> = (0..2).map(|_| WaveBuffer::with_len(16).unwrap()).collect();
    for buffer in &buffers {
        let key = input.prepare_buffer(buffer.clone()).unwrap();
        input.add_buffer(key).unwrap();
    }
    let events = input.events();

    drop(input);

    assert!(events.recv().is_none());
    assert!(buffers.iter().all(|b| b.state() == BufferState::Raw));
}
