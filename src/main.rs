use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use tracing::info;

use voicelink::{
    AudioStats, ClientConfig, LogLevel, NullSink, PlaybackSink, VoiceClient, WavFileCapture,
    WavFileSink,
};

/// voicelink - stream a WAV file to a voice agent and record its replies
#[derive(Parser, Debug)]
#[command(name = "voicelink")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Agent to call
    #[arg(long = "agent-id")]
    agent_id: Option<String>,

    /// Agent environment tag
    #[arg(long)]
    environment: Option<String>,

    /// Explicit agent socket URL (skips the agent lookup)
    #[arg(long = "server-url")]
    server_url: Option<String>,

    /// WAV file streamed as the microphone
    #[arg(short = 'i', long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// WAV file receiving the agent's speech
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Seconds to stay connected
    #[arg(short = 'd', long, default_value_t = 30)]
    duration: u64,

    /// Log level (DEBUG, INFO, WARN, ERROR)
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Text event sent after connecting
    #[arg(long)]
    text: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        println!("Loading configuration from {}", config_path.display());
        ClientConfig::from_file(config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        ClientConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };
    apply_overrides(&mut config, &cli)?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level.to_tracing_level())
        .init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let device = match &cli.input {
        Some(path) => WavFileCapture::open(path)?,
        None => WavFileCapture::from_samples(Vec::new(), config.audio.input_sample_rate),
    };

    let recorder = match &cli.output {
        Some(path) => Some(Arc::new(WavFileSink::new(
            path,
            config.audio.output_sample_rate,
        )?)),
        None => None,
    };
    let sink: Arc<dyn PlaybackSink> = match &recorder {
        Some(recorder) => recorder.clone(),
        None => Arc::new(NullSink::new()),
    };

    let client = VoiceClient::builder(config)
        .capture_device(Arc::new(device))
        .playback_sink(sink)
        .build()?;
    register_callbacks(&client);

    client.connect().await?;
    if let Some(text) = &cli.text {
        client.send_text_event(text.clone()).await?;
    }
    client.start_listening().await?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.duration)) => {
            info!("Session duration elapsed");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted");
        }
    }

    client.disconnect().await;

    if let (Some(recorder), Some(path)) = (recorder, &cli.output) {
        recorder.finish()?;
        println!("Agent audio written to {}", path.display());
    }

    Ok(())
}

fn apply_overrides(config: &mut ClientConfig, cli: &Cli) -> anyhow::Result<()> {
    if let Some(agent_id) = &cli.agent_id {
        config.agent_id = agent_id.clone();
    }
    if let Some(environment) = &cli.environment {
        config.environment = Some(environment.clone());
    }
    if let Some(server_url) = &cli.server_url {
        config.server_url = Some(server_url.clone());
    }
    if let Some(level) = &cli.log_level {
        config.log_level =
            LogLevel::parse(level).ok_or_else(|| anyhow!("Invalid log level '{}'", level))?;
    }
    Ok(())
}

fn register_callbacks(client: &VoiceClient) {
    client.on_open(Arc::new(|| Box::pin(async { println!("Connected") })));
    client.on_close(Arc::new(|| Box::pin(async { println!("Connection closed") })));
    client.on_error(Arc::new(|message: String| {
        Box::pin(async move { eprintln!("Error: {message}") })
    }));
    client.on_playback_start(Arc::new(|| Box::pin(async { println!("Agent speaking") })));
    client.on_playback_stop(Arc::new(|| Box::pin(async { println!("Agent finished") })));

    let speaking = Arc::new(AtomicBool::new(false));
    client.on_audio_stats(Arc::new(move |stats: AudioStats| {
        let speaking = speaking.clone();
        Box::pin(async move {
            if speaking.swap(stats.is_speaking, Ordering::SeqCst) != stats.is_speaking {
                let side = if stats.is_playback == Some(true) {
                    "agent"
                } else {
                    "caller"
                };
                let what = if stats.is_speaking { "speech" } else { "silence" };
                println!("{what} ({side}, level {:.2})", stats.level);
            }
        })
    }));
}
