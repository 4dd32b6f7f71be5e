//! Record from an input device and play the recording back, continuously

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam::select;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use sotf_wave::{devices, init_logging, BufferKey, WaveBuffer, WaveConfig, WaveIn, WaveOut};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Record-and-play loop over the wave audio devices
#[derive(Parser)]
#[command(name = "wave_loopback")]
#[command(about = "Record from an input device and play it back buffer by buffer")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of record/play completions to run before stopping
    #[arg(long, default_value = "10")]
    cycles: u64,

    /// List devices and exit
    #[arg(long)]
    list: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => WaveConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => WaveConfig::default(),
    };
    init_logging(&config.log_filter);

    let driver = config.create_driver()?;

    if cli.list {
        println!("Input devices ({}):", driver.name());
        for device in devices::input_devices(driver.as_ref())? {
            println!("  {} {} (driver {})", device.id, device.name, device.version_label());
        }
        println!("Output devices ({}):", driver.name());
        for device in devices::output_devices(driver.as_ref())? {
            println!("  {} {} (driver {})", device.id, device.name, device.version_label());
        }
        return Ok(());
    }

    let format = config.format();
    println!("Format: {}", format);

    let mut record = WaveIn::new(driver.clone());
    record
        .open(config.input_device, &format)
        .context("Failed to open input device")?;
    let mut play = WaveOut::new(driver);
    play.open(config.output_device, &format)
        .context("Failed to open output device")?;
    play.set_volume(config.volume_left, config.volume_right)?;

    let mut keys: Vec<BufferKey> = Vec::with_capacity(config.input_buffers);
    let first = WaveBuffer::allocate(&format, config.buffer_seconds)?;
    // Playback reads the same bytes the first record buffer is filled with.
    play.prepare_buffer(first.clone_descriptor())?;
    keys.push(record.prepare_buffer(first)?);
    for _ in 1..config.input_buffers {
        keys.push(record.prepare_buffer(WaveBuffer::allocate(&format, config.buffer_seconds)?)?);
    }

    let record_events = record.events();
    let play_events = play.events();

    println!("Recording...");
    for &key in &keys {
        record.add_buffer(key)?;
    }
    record.start()?;
    thread::sleep(Duration::from_millis(200));
    play.write()?;

    let mut recorded = 0u64;
    let mut played = 0u64;
    while recorded + played < cli.cycles {
        select! {
            recv(record_events.receiver()) -> event => {
                let Ok(buffer) = event else { bail!("input device closed unexpectedly") };
                recorded += 1;
                log::debug!("Recorded {} bytes into {}", buffer.bytes_recorded(), buffer.id());
                let key = record
                    .key_of(buffer.id())
                    .context("completion for a buffer the input engine does not hold")?;
                record.add_buffer(key)?;
                record.start()?;
            }
            recv(play_events.receiver()) -> event => {
                if event.is_err() {
                    bail!("output device closed unexpectedly");
                }
                played += 1;
                play.write()?;
            }
        }
    }
    println!("Recorded {} buffers, played {} buffers", recorded, played);

    record.stop()?;
    record.reset()?;
    play.reset()?;
    while record.queued_count() > 0 || play.is_queued() {
        select! {
            recv(record_events.receiver()) -> _ => {}
            recv(play_events.receiver()) -> _ => {}
            default(DRAIN_TIMEOUT) => {
                bail!("Buffers did not come back within {:?} of reset", DRAIN_TIMEOUT);
            }
        }
    }

    for &key in &keys {
        record.unprepare_buffer(key)?;
    }
    play.unprepare_buffer()?;
    record.close()?;
    play.close()?;
    println!("Done");
    Ok(())
}
