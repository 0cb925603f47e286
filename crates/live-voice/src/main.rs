//! Live voice CLI: talk to the conversation service from the terminal.
//!
//! Usage:
//!   live-voice [config.toml]
//!   live-voice --devices
//!
//! Keys (followed by Enter): `r` start/stop listening, `m` mute/unmute,
//! `x` restart the session, `q` quit.
//!
//! The API key is read from `LIVE_VOICE__ENDPOINT__API_KEY` (a `.env` file works).

use live_voice::{
    AudioTap, CpalMicrophone, EngineCommand, EngineHandle, EngineNotice, LiveConfig, RodioOutput,
    VoiceEngine, WsConnector,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_voice=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config_path: Option<PathBuf> = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--devices" => {
                for name in CpalMicrophone::list_input_devices()? {
                    println!("{}", name);
                }
                return Ok(());
            }
            other => config_path = Some(PathBuf::from(other)),
        }
    }

    let config = match config_path {
        Some(path) => LiveConfig::load_from(&path)?,
        None => LiveConfig::load()?,
    };
    info!(
        "Model {} · voice {}",
        config.session.model, config.session.voice
    );

    let output_tap = AudioTap::new();
    let output = RodioOutput::new(config.audio.output_sample_rate, Some(output_tap.clone()))?;
    let connector = WsConnector::new(config.endpoint.clone());
    let (mut engine, notices) = VoiceEngine::new(&config, connector, CpalMicrophone::new(), output);

    tokio::spawn(print_notices(notices));
    tokio::spawn(read_keys(engine.handle()));
    tokio::spawn(log_levels(engine.input_tap().clone(), output_tap));

    println!("Keys: r = talk/stop, m = mute, x = restart, q = quit");
    if let Err(e) = engine.connect() {
        warn!("Initial connection failed: {} (press x to retry)", e);
    }

    engine.run().await?;
    info!("Goodbye");
    Ok(())
}

async fn print_notices(mut notices: mpsc::UnboundedReceiver<EngineNotice>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            EngineNotice::Status(text) => println!("• {}", text),
            EngineNotice::Error(text) => eprintln!("✖ {}", text),
            EngineNotice::Warning(text) => eprintln!("! {}", text),
            EngineNotice::TurnComplete => debug!("Turn complete"),
            EngineNotice::SessionReady(_) | EngineNotice::StateChanged(_) => {}
        }
    }
}

async fn read_keys(handle: EngineHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let command = match line.trim() {
            "r" => EngineCommand::ToggleRecording,
            "m" => EngineCommand::ToggleMute,
            "x" => EngineCommand::ResetSession(None),
            "q" => EngineCommand::Shutdown,
            "" => continue,
            other => {
                eprintln!("Unknown key '{}'", other);
                continue;
            }
        };
        let quit = command == EngineCommand::Shutdown;
        if handle.send(command).is_err() || quit {
            return;
        }
    }
    // stdin closed
    let _ = handle.shutdown();
}

/// Peak levels of both directions, once a second at debug level.
async fn log_levels(input: AudioTap, output: AudioTap) {
    let mut input_rx = input.subscribe();
    let mut output_rx = output.subscribe();
    let mut report = tokio::time::interval(Duration::from_secs(1));
    let (mut input_peak, mut output_peak) = (0.0f32, 0.0f32);
    loop {
        tokio::select! {
            Ok(block) = input_rx.recv() => input_peak = input_peak.max(peak(&block)),
            Ok(block) = output_rx.recv() => output_peak = output_peak.max(peak(&block)),
            _ = report.tick() => {
                debug!("Levels: mic {:.2} · speaker {:.2}", input_peak, output_peak);
                input_peak = 0.0;
                output_peak = 0.0;
            }
        }
    }
}

fn peak(block: &[f32]) -> f32 {
    block.iter().fold(0.0f32, |m, s| m.max(s.abs()))
}
