use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tracing_subscriber::EnvFilter;

use duplex_voice::audio::{self, AudioBackend, AudioFrame, CpalBackend};
use duplex_voice::{Config, LiveConnector, SessionOrchestrator, SessionStatus, ToolRegistry};

/// Duplex Voice - real-time voice assistant session
#[derive(Parser)]
#[command(name = "duplex-voice", version, about)]
struct Cli {
    /// Path to a config file (defaults to the user config directory)
    #[arg(short, long, env = "DUPLEX_VOICE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a voice session (default)
    Run,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the recording as a WAV file
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
    /// Print the resolved configuration (keys redacted)
    ShowConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = match cli.verbose {
        0 => "info,duplex_voice=info",
        1 => "info,duplex_voice=debug",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

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

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_session(config).await,
        Command::TestMic { duration, save } => test_mic(&config, duration, save).await,
        Command::TestSpeaker => test_speaker(&config).await,
        Command::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

/// Run a voice session until Ctrl-C or the assistant ends it
async fn run_session(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let connector = Arc::new(LiveConnector::new(config.session.endpoint.clone()));
    let orchestrator = SessionOrchestrator::new(
        &config,
        connector,
        Arc::new(CpalBackend),
        Arc::new(ToolRegistry::with_builtins()),
    );
    let handle = orchestrator.handle();

    // Set up shutdown signal
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                handle.stop();
            }
        });
    }

    // Status line
    {
        let mut status = handle.subscribe();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow_and_update();
                tracing::info!(status = %current, "session status");
                if current == SessionStatus::Stopped {
                    break;
                }
            }
        });
    }

    tracing::info!(model = %config.session.model, voice = %config.session.voice, "duplex voice ready - start talking");
    orchestrator.run().await?;
    Ok(())
}

/// Test microphone input
async fn test_mic(config: &Config, duration: u64, save: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let audio_config = config.audio;
    println!("Sample rate: {} Hz", audio_config.input_sample_rate);
    println!("---");

    // The device is not Send, so it lives on a blocking thread
    let pcm = tokio::task::spawn_blocking(move || -> duplex_voice::Result<Vec<u8>> {
        let mut device =
            CpalBackend.open_capture(audio_config.input_sample_rate, audio_config.chunk_size)?;
        let mut recording = Vec::new();
        let mut second = Vec::new();
        let start = Instant::now();
        let mut elapsed_secs = 0;

        while elapsed_secs < duration {
            let frame = device.read_chunk()?;
            second.extend_from_slice(&frame.data);
            recording.extend_from_slice(&frame.data);

            let secs = start.elapsed().as_secs();
            if secs > elapsed_secs {
                elapsed_secs = secs;
                print_level(elapsed_secs, &second);
                second.clear();
            }
        }
        Ok(recording)
    })
    .await??;

    println!("\n---");
    if let Some(path) = save {
        let wav = audio::pcm_to_wav(&pcm, audio_config.input_sample_rate, 1)?;
        std::fs::write(&path, wav)?;
        println!("Saved recording to {}", path.display());
    }
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

fn print_level(second: u64, pcm: &[u8]) {
    let energy = audio::rms_level(pcm);
    let peak = AudioFrame::new(pcm.to_vec(), 0, 1)
        .samples()
        .iter()
        .map(|s| f32::from(*s).abs() / 32768.0)
        .fold(0.0f32, f32::max);

    // Visual meter
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let meter_len = (energy * 100.0).min(50.0) as usize;
    let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

    println!("[{second:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]");
}

/// Test speaker output with a sine wave
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = config.audio.output_sample_rate;
    let frequency = 440.0_f32;

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    let samples: Vec<i16> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            ((2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 * 32767.0) as i16 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);

    tokio::task::spawn_blocking(move || -> duplex_voice::Result<()> {
        let mut device = CpalBackend.open_playback(sample_rate)?;
        // 100ms frames, as the model streams them
        for chunk in samples.chunks(sample_rate as usize / 10) {
            device.write(&AudioFrame::from_samples(chunk, sample_rate, 1))?;
        }
        // Let the device buffer drain
        std::thread::sleep(Duration::from_millis(200));
        Ok(())
    })
    .await??;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Print the resolved configuration
fn show_config(config: &Config) {
    let s = &config.session;
    let a = &config.audio;

    println!("[session]");
    println!("endpoint = {}", s.endpoint);
    println!("model = {}", s.model);
    println!("voice = {}", s.voice);
    println!("max_retries = {}", s.max_retries);
    println!("credential_cooldown = {:?}", s.credential_cooldown);
    println!("conflict_backoff_base = {:?}", s.conflict_backoff_base);
    println!("retry_delay = {:?}", s.retry_delay);
    println!("watchdog_threshold = {:?}", s.watchdog_threshold);
    println!("send_cooldown = {:?}", s.send_cooldown);
    println!("history_turns = {}", s.history_turns);
    println!(
        "compression = {} -> {} tokens",
        s.compression.trigger_tokens, s.compression.target_tokens
    );
    println!();
    println!("[audio]");
    println!("input_sample_rate = {}", a.input_sample_rate);
    println!("output_sample_rate = {}", a.output_sample_rate);
    println!("chunk_size = {}", a.chunk_size);
    println!("playback_queue_capacity = {}", a.playback_queue_capacity);
    println!();
    println!("[credentials]");
    for (i, key) in config.credentials.iter().enumerate() {
        println!("key {i} = {}", redact(key.expose_secret()));
    }
    if config.credentials.is_empty() {
        println!("(none)");
    }
}

/// Show only the last four characters of a key
fn redact(key: &str) -> String {
    let tail: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("****{tail}")
}
