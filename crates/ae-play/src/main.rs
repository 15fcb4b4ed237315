//! AE Play - plays a test tone through the audio engine
//!
//! Loads the audio settings, opens the engine, pushes a generated sine
//! through one stream (or two, mixed) and drains it.
//!
//! ## Command line flags
//!
//! - `--device <driver:device>`: output device, e.g. `null:default`
//! - `--seconds <n>`: tone length (default 3)
//! - `--freq <hz>`: tone frequency (default 440)
//! - `--two`: mix a second tone a fifth above
//! - `--clock`: keep the stream in sync with a synthetic AV clock

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};

use ae_core::config::{default_config_path, load_config};
use ae_core::{AudioEngine, AudioFormat, AudioSettings, AudioStream, AvClock, ChannelLayout, ExtData, SampleFormat, StreamOptions};

const SAMPLE_RATE: u32 = 48000;

/// Frames pushed per `add_data` call
const CHUNK_FRAMES: usize = 1024;

struct Args {
    device: Option<String>,
    seconds: f64,
    freq: f64,
    two: bool,
    clock: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        device: None,
        seconds: 3.0,
        freq: 440.0,
        two: false,
        clock: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--device" => args.device = Some(iter.next().context("--device needs a value")?),
            "--seconds" => {
                args.seconds = iter
                    .next()
                    .context("--seconds needs a value")?
                    .parse()
                    .context("invalid --seconds")?
            }
            "--freq" => {
                args.freq = iter
                    .next()
                    .context("--freq needs a value")?
                    .parse()
                    .context("invalid --freq")?
            }
            "--two" => args.two = true,
            "--clock" => args.clock = true,
            other => return Err(anyhow!("unknown argument {}", other)),
        }
    }
    Ok(args)
}

/// Wall clock started when playback starts
struct WallClock(Instant);

impl AvClock for WallClock {
    fn clock_ms(&self) -> f64 {
        self.0.elapsed().as_secs_f64() * 1000.0
    }
}

/// Sine generator producing interleaved stereo f32
struct Tone {
    phase: f64,
    step: f64,
    level: f32,
}

impl Tone {
    fn new(freq: f64, level: f32) -> Self {
        Self {
            phase: 0.0,
            step: freq * std::f64::consts::TAU / SAMPLE_RATE as f64,
            level,
        }
    }

    fn fill(&mut self, out: &mut Vec<f32>, frames: usize) {
        out.clear();
        for _ in 0..frames {
            let s = self.phase.sin() as f32 * self.level;
            out.push(s);
            out.push(s);
            self.phase = (self.phase + self.step) % std::f64::consts::TAU;
        }
    }
}

/// Push one chunk, retrying until the engine took all of it
fn push(stream: &mut AudioStream, samples: &[f32], frames: usize, pts: Option<f64>) -> Result<()> {
    let bytes: &[u8] = bytemuck::cast_slice(samples);
    let mut done = 0;
    let mut stalls = 0;
    while done < frames {
        let ext = ExtData {
            pts: pts.map(|p| p + done as f64 * 1000.0 / SAMPLE_RATE as f64),
            ..Default::default()
        };
        let n = stream.add_data(&[bytes], done, frames - done, ext);
        if n == 0 {
            stalls += 1;
            if stalls > 50 {
                return Err(anyhow!("stream {} stopped accepting data", stream.id()));
            }
        }
        done += n;
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = parse_args()?;
    let config_path = default_config_path();
    let mut settings: AudioSettings = load_config(&config_path);
    if let Some(device) = args.device.clone() {
        settings.device = device;
    }
    log::info!("ae-play starting on {}", settings.device);

    let mut engine = AudioEngine::new(settings).context("failed to start the audio engine")?;
    let format = AudioFormat::pcm(SampleFormat::F32, SAMPLE_RATE, ChannelLayout::stereo());

    let start = Instant::now();
    let clock: Option<Arc<dyn AvClock>> = if args.clock {
        Some(Arc::new(WallClock(start)))
    } else {
        None
    };

    let mut streams = vec![(
        engine.new_stream(format.clone(), StreamOptions::default(), clock.clone())?,
        Tone::new(args.freq, 0.4),
    )];
    if args.two {
        streams.push((
            engine.new_stream(format, StreamOptions::default(), None)?,
            Tone::new(args.freq * 1.5, 0.3),
        ));
    }

    let total = (args.seconds * SAMPLE_RATE as f64) as usize;
    let mut written = 0;
    let mut chunk = Vec::with_capacity(CHUNK_FRAMES * 2);
    while written < total {
        let frames = CHUNK_FRAMES.min(total - written);
        let pts = clock.as_ref().map(|_| written as f64 * 1000.0 / SAMPLE_RATE as f64);
        for (i, (stream, tone)) in streams.iter_mut().enumerate() {
            tone.fill(&mut chunk, frames);
            push(stream, &chunk, frames, if i == 0 { pts } else { None })?;
        }
        written += frames;
    }

    for (stream, _) in &mut streams {
        if !stream.drain(true) {
            log::warn!("Stream {} did not report drained", stream.id());
        }
        if let Some(info) = stream.get_sync_info() {
            log::info!("Stream {}: sync {:?}, error {:.1} ms", stream.id(), info.state, info.error_ms);
        }
    }
    log::info!("Played {:.1} s in {:.1} s", args.seconds, start.elapsed().as_secs_f64());

    drop(streams);
    engine.shutdown().context("engine shutdown failed")?;
    Ok(())
}
