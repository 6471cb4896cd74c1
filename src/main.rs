use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voice_terminal::audio::{CpalCapture, FRAME_DURATION_MS, capture_ring};
use voice_terminal::discovery::Discovery;
use voice_terminal::vad::VadEngine;
use voice_terminal::{Config, Daemon};

/// Voice terminal - streams microphone audio to a voice assistant server
#[derive(Parser)]
#[command(name = "voice-terminal", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "VOICE_TERMINAL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the terminal (default)
    Run,
    /// Show microphone levels and voice activity
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Find servers and print their health
    Discover {
        /// Seconds to wait for scans and health checks
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,voice_terminal=info",
        1 => "info,voice_terminal=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::info!(
                device_id = %config.feedback.device_id,
                room = %config.feedback.room,
                "starting voice terminal"
            );
            Daemon::new(config).run().await?;
            Ok(())
        }
        Command::TestMic { duration } => test_mic(&config, duration).await,
        Command::Discover { timeout } => discover(&config, timeout).await,
    }
}

/// Print one line per second with level and voice activity
#[allow(clippy::future_not_send)]
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (producer, mut source, control) = capture_ring(config.audio.capture_buffer_frames);
    control.apply_gain(config.audio.microphone_gain)?;
    let mut mic = CpalCapture::new()?;
    mic.start(producer)?;
    let mut vad = VadEngine::new(config.vad.clone())?;

    let frames_per_second = 1000 / FRAME_DURATION_MS;
    let deadline = Instant::now() + Duration::from_secs(duration);
    let mut second = 0;

    while Instant::now() < deadline {
        let mut peak_rms = 0.0f32;
        let mut voiced = 0;
        for _ in 0..frames_per_second {
            let frame = source.next_frame().await?;
            let result = vad.process(&frame);
            peak_rms = peak_rms.max(result.rms);
            if result.voice_active {
                voiced += 1;
            }
        }
        second += 1;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (peak_rms / 200.0).min(50.0) as usize;
        let meter = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);
        println!(
            "[{second:2}s] RMS: {peak_rms:7.1} | voice: {voiced:2}/{frames_per_second} | noise floor: {:5.0} | [{meter}]",
            vad.noise_floor()
        );
    }

    mic.stop();

    println!("\n---");
    println!("If RMS stayed near 0, check that the microphone is the default input device.");
    Ok(())
}

/// Run one discovery pass and print every server found
async fn discover(config: &Config, timeout: u64) -> anyhow::Result<()> {
    let (discovery, handle) = Discovery::from_config(config)?;

    if tokio::time::timeout(Duration::from_secs(timeout), discovery.refresh())
        .await
        .is_err()
    {
        println!("Discovery did not finish within {timeout}s, showing partial results");
    }

    let candidates = handle.ranked().await;
    if candidates.is_empty() {
        println!("No servers found");
        return Ok(());
    }

    for candidate in candidates {
        let endpoint = &candidate.endpoint;
        match &candidate.health {
            Some(health) if health.online => println!(
                "{endpoint}  online  {}ms  sessions={}  version={}",
                health.response_time_ms,
                health
                    .active_sessions
                    .map_or_else(|| "-".to_string(), |n| n.to_string()),
                health.version.as_deref().unwrap_or("-"),
            ),
            Some(_) => println!("{endpoint}  offline"),
            None => println!("{endpoint}  unchecked"),
        }
    }
    Ok(())
}
