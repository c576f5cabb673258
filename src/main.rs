mod buffers;
mod config;
mod crypto;
mod directive;
mod events;
mod microphone;
mod orchestrator;
mod platform;
mod protocol;
mod receiver;
mod resequencer;
mod seqbuf;
mod session;
mod speaker;
mod state;
mod stats;
mod transport;

use clap::Parser;
use config::Config;
use platform::LogPlatform;
use session::Session;
use state::ClientState;
use stats::Stats;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let config = Config::parse();

    info!(
        thing = %config.thing_name,
        broker = format!("{}:{}", config.mqtt_host, config.mqtt_port),
        topic_head = %config.topic_head(),
        "🚀 ais-voice-client starting"
    );

    let stats = Stats::new();
    let (mqtt, eventloop) = transport::connect(&config);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(4);

    let session = Arc::new(Session::new(
        config,
        mqtt,
        Arc::new(LogPlatform),
        stats.clone(),
        shutdown_tx,
    )?);

    // Stats reporter
    let stats_interval = session.config.stats_interval_secs;
    tokio::spawn(stats::stats_reporter(stats, stats_interval));

    // Receiver: drives the MQTT event loop and all inbound dispatch.
    tokio::spawn(receiver::receiver_task(session.clone(), eventloop));

    // Streaming tasks.
    tokio::spawn(speaker::playback_task(session.clone()));
    tokio::spawn(microphone::uplink_task(session.clone()));

    // On real hardware the audio DMA fills the capture ring and drains
    // the decoded PCM ring; this host build pumps both at frame rate so
    // neither side stalls against a ring nobody touches.
    tokio::spawn(output_pump(session.clone()));
    tokio::spawn(capture_pump(session.clone()));

    // Stand-in for the touch button and the wake-word engine.
    tokio::spawn(control_input(session.clone()));

    session.platform.indicator_blink(1000);
    info!("✅ client initialized");

    orchestrator::run(session, shutdown_rx).await
}

async fn output_pump(session: Arc<Session>) {
    let frame = session.config.raw_frame_size();
    let period = Duration::from_millis(session.config.speaker_frame_ms as u64);
    let mut sink = vec![0u8; frame];
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if session.state.contains(ClientState::SPEAKER_OPEN) {
            session.read_speaker_buffer(&mut sink);
        }
    }
}

async fn capture_pump(session: Arc<Session>) {
    let frame = vec![0u8; session.config.mic_frame_size()];
    let period = Duration::from_millis(session.config.mic_frame_ms as u64);
    let mut ticker = tokio::time::interval(period);
    loop {
        if !session.state.contains(ClientState::MICROPHONE_OPEN) {
            session.state.wait_any(ClientState::MICROPHONE_OPEN).await;
            ticker.reset();
        }
        ticker.tick().await;
        session.fill_microphone_buffer(&frame);
    }
}

/// Reads simple commands from stdin: `tap` presses the touch button,
/// `wake` simulates a wake-word detection.
async fn control_input(session: Arc<Session>) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "tap" => {
                if let Err(e) = session.button_tapped().await {
                    tracing::warn!(error = %e, "button tap failed");
                }
            }
            "wake" => {
                let end = session.microphone.offset.load(std::sync::atomic::Ordering::SeqCst);
                let begin = end.saturating_sub(32_000);
                session.wake_word_detected("computer", begin, end);
            }
            "" => {}
            other => tracing::warn!(input = %other, "unknown command (try: tap, wake)"),
        }
    }
}
