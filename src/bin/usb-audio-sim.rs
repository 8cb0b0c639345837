//! USB Audio Streaming Simulator
//!
//! Runs the streaming core against an in-memory transport and loops
//! captured audio back to playback.
//!
//! Usage: `usb-audio-sim [seconds] [sample_rate]`

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use usb_audio_stream::{
    audio::{AlternateConfiguration, EndpointInfo, FormatRequest, StaticCapabilities},
    config::EngineSettings,
    engine::StreamingEngine,
    transport::sim::SimTransport,
    StreamDirection,
};

fn device_capabilities() -> StaticCapabilities {
    StaticCapabilities::new()
        .with(
            AlternateConfiguration {
                alternate_setting: 1,
                channel_count: 2,
                bit_depth: 16,
                sample_rates: vec![44100, 48000],
            },
            EndpointInfo {
                max_packet_bytes: 196,
                poll_interval_exponent: 1,
                has_sync_feedback: true,
            },
        )
        .with(
            AlternateConfiguration {
                alternate_setting: 2,
                channel_count: 2,
                bit_depth: 24,
                sample_rates: vec![48000, 96000],
            },
            EndpointInfo {
                max_packet_bytes: 582,
                poll_interval_exponent: 1,
                has_sync_feedback: true,
            },
        )
}

/// Frames per 1 ms packet over one second, as a device clocked at `rate` emits them
fn packet_cadence(rate: u32) -> Vec<u32> {
    (0..1000u64)
        .map(|i| (((i + 1) * rate as u64) / 1000 - (i * rate as u64) / 1000) as u32)
        .collect()
}

/// 10.14 feedback report for a device running at `rate`
fn feedback_report(rate: u32) -> [u8; 3] {
    let raw = (rate as f64 / 1000.0 * 16_384.0).round() as u32;
    let bytes = raw.to_le_bytes();
    [bytes[0], bytes[1], bytes[2]]
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting USB audio streaming simulator");

    let seconds: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 10,
    };
    let sample_rate: u32 = match std::env::args().nth(2) {
        Some(arg) => arg.parse()?,
        None => 48000,
    };

    let settings = EngineSettings::load_or_default();
    let packets_per_list = settings.scheduler.packets_per_frame_list as u64;
    let capabilities = device_capabilities();

    println!("\n=== Simulated Device ===");
    println!("  Sample rates: {:?}", capabilities.sample_rates());
    println!("  Channels: {:?}", capabilities.channel_counts());
    println!();

    let sim = Arc::new(SimTransport::new(1_000));
    sim.set_jitter_ns(20_000);

    let mut engine = StreamingEngine::new(sim.clone(), settings);
    let request = FormatRequest {
        channel_count: 2,
        bit_depth: 16,
        sample_rate,
    };
    for direction in StreamDirection::ALL {
        let format = engine.select_format(direction, &request, &capabilities)?;
        tracing::info!(
            "{:?}: alt setting {}, {}ch {}-bit {} Hz",
            direction,
            format.alternate_setting,
            format.channel_count,
            format.bit_depth,
            format.sample_rate
        );
    }

    let config = engine
        .stream_config(StreamDirection::Capture)
        .ok_or_else(|| anyhow::anyhow!("capture format missing after negotiation"))?;
    sim.set_capture_cadence(config.bytes_per_frame, packet_cadence(config.sample_rate));
    sim.set_feedback_report(Some(&feedback_report(config.sample_rate)));

    // Virtual host controller: one frame list per direction per list period
    let driver_sim = sim.clone();
    let driver = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(packets_per_list));
        loop {
            ticker.tick().await;
            driver_sim.complete_next();
            driver_sim.complete_next();
        }
    });

    tokio::task::block_in_place(|| engine.start())?;

    let reader = engine.capture_reader()?;
    let writer = engine.playback_writer()?;
    let mut chunk = vec![0u8; config.sample_buffer_bytes(1)];

    let mut pump = tokio::time::interval(Duration::from_millis(packets_per_list));
    let mut stats_ticker = tokio::time::interval(Duration::from_secs(1));
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    tracing::info!("Streaming for {}s - press Ctrl+C to stop", seconds);

    loop {
        tokio::select! {
            _ = pump.tick() => {
                if let Err(e) = engine.process_pending() {
                    tracing::warn!("Stream error: {}", e);
                }
                // Loop captured audio back out
                let n = reader.read(&mut chunk);
                writer.write(&chunk[..n]);

                while let Some(stamp) = engine.pop_wrap_stamp(StreamDirection::Capture) {
                    tracing::debug!("Capture wrap {} at {:?}", stamp.wrap_count, stamp.wall_time_ns);
                }
            }
            _ = stats_ticker.tick() => {
                let stats = engine.stats();
                if let (Some(capture), Some(playback)) = (stats.capture, stats.playback) {
                    tracing::info!(
                        "Stats: {} KB in, {} KB out, {} overruns, {} underruns, {} resyncs, clock {}, device {:?} Hz",
                        capture.bytes / 1024,
                        playback.bytes / 1024,
                        capture.overruns,
                        playback.underruns,
                        capture.scheduler.resyncs + playback.scheduler.resyncs,
                        if stats.clock_locked { "locked" } else { "acquiring" },
                        stats.device_rate_hz
                    );
                }
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    engine.stop();
    let drained = tokio::task::block_in_place(|| engine.drain_blocking(Duration::from_secs(1)))?;
    driver.abort();

    if drained {
        tracing::info!("Simulator stopped cleanly");
    } else {
        tracing::warn!("Simulator stopped with transfers still in flight");
    }
    Ok(())
}
