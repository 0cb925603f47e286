//! End-to-end engine behaviour against simulated devices and a scripted channel.
//!
//! The hardware test at the bottom needs a microphone, speakers and an API key.

use live_voice::channel::InboundAudio;
use live_voice::engine::EngineEvent;
use live_voice::sim::{
    audio_message, silence_message, ManualClock, ScriptedConnector, SimulatedMicrophone,
    SimulatedOutput,
};
use live_voice::{
    EngineNotice, LiveConfig, ServerMessage, SessionConfig, SessionState, VoiceEngine,
    VoiceError,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

type Engine = VoiceEngine<ScriptedConnector, SimulatedMicrophone, SimulatedOutput>;

struct Harness {
    engine: Engine,
    notices: mpsc::UnboundedReceiver<EngineNotice>,
    connector: ScriptedConnector,
    mic: SimulatedMicrophone,
    output: SimulatedOutput,
    clock: ManualClock,
}

impl Harness {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let clock = ManualClock::new();
        let output = SimulatedOutput::new(clock.clone());
        let connector = ScriptedConnector::new();
        let mic = SimulatedMicrophone::new();
        let (engine, notices) = VoiceEngine::new(
            &LiveConfig::default(),
            connector.clone(),
            mic.clone(),
            output.clone(),
        );
        Self {
            engine,
            notices,
            connector,
            mic,
            output,
            clock,
        }
    }

    fn ready() -> Self {
        let mut h = Self::new();
        assert_ok!(h.engine.connect());
        h.connector.latest().unwrap().opened();
        h.engine.process_pending();
        assert_eq!(h.engine.state(), SessionState::Ready);
        h
    }

    fn recording() -> Self {
        let mut h = Self::ready();
        assert_ok!(h.engine.start_recording());
        assert_eq!(h.engine.state(), SessionState::Recording);
        h
    }

    /// Deliver a server message on the current channel and handle it.
    fn server_says(&mut self, message: ServerMessage) {
        self.connector.latest().unwrap().message(message);
        self.engine.process_pending();
    }

    fn drain(&mut self) -> Vec<EngineNotice> {
        let mut out = Vec::new();
        while let Ok(n) = self.notices.try_recv() {
            out.push(n);
        }
        out
    }

    fn statuses(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter_map(|n| match n {
                EngineNotice::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

fn assert_close(a: f64, b: f64) {
    assert!((a - b).abs() < 1e-6, "{} != {}", a, b);
}

#[test]
fn start_recording_requires_ready() {
    let mut h = Harness::new();
    let err = assert_err!(h.engine.start_recording());
    assert!(matches!(err, VoiceError::Precondition(_)));
    assert_eq!(h.engine.state(), SessionState::Disconnected);
    assert_eq!(h.mic.opens(), 0);

    assert_ok!(h.engine.connect());
    assert!(h.engine.start_recording().is_err());
    assert_eq!(h.engine.state(), SessionState::Connecting);
    assert_eq!(h.mic.opens(), 0);
}

#[test]
fn connect_twice_is_rejected() {
    let mut h = Harness::new();
    assert_ok!(h.engine.connect());
    let err = assert_err!(h.engine.connect());
    assert!(matches!(err, VoiceError::Precondition(_)));
    assert_eq!(h.connector.attempts(), 1);
}

#[test]
fn open_reports_session_started() {
    let mut h = Harness::new();
    assert_ok!(h.engine.connect());
    assert!(!h.engine.session_ready());
    h.connector.latest().unwrap().opened();
    h.engine.process_pending();

    assert!(h.engine.session_ready());
    let notices = h.drain();
    assert!(notices.contains(&EngineNotice::Status("Session started".to_string())));
    assert!(notices.contains(&EngineNotice::SessionReady(true)));
}

#[test]
fn reset_while_connecting_ignores_stale_callbacks() {
    let mut h = Harness::new();
    assert_ok!(h.engine.connect());
    let first = h.connector.attempt(0).unwrap();
    let first_generation = h.engine.session().generation;

    assert_ok!(h.engine.reset_session(None));
    assert_eq!(h.connector.closes(), 1);
    assert_eq!(h.engine.state(), SessionState::Connecting);
    assert!(h.engine.session().generation > first_generation);

    // the superseded attempt completes late, then fails
    first.opened();
    h.engine.process_pending();
    assert_eq!(h.engine.state(), SessionState::Connecting);
    first.error("socket reset");
    first.closed("gone");
    h.engine.process_pending();
    assert_eq!(h.engine.state(), SessionState::Connecting);
    assert!(!h
        .drain()
        .iter()
        .any(|n| matches!(n, EngineNotice::Error(_))));

    h.connector.attempt(1).unwrap().opened();
    h.engine.process_pending();
    assert_eq!(h.engine.state(), SessionState::Ready);
}

#[test]
fn reset_with_new_configuration_reopens() {
    let mut h = Harness::recording();
    let config = SessionConfig::default()
        .with_voice("Kai")
        .with_system_instruction("Answer in one sentence.");

    assert_ok!(h.engine.reset_session(Some(config.clone())));
    assert_eq!(h.engine.state(), SessionState::Connecting);
    assert!(!h.mic.is_open());
    assert_eq!(h.connector.config_of(1), Some(config));
    assert!(h.statuses().contains(&"Session restarted".to_string()));

    h.connector.latest().unwrap().opened();
    h.engine.process_pending();
    assert_eq!(h.engine.state(), SessionState::Ready);
    assert_eq!(h.engine.session().config.voice, "Kai");
}

#[test]
fn malformed_audio_is_dropped_without_state_change() {
    let mut h = Harness::ready();
    h.drain();

    // three bytes: not a whole number of 16-bit samples
    h.server_says(ServerMessage::Audio(InboundAudio {
        data: "AAEC".to_string(),
        sample_rate: 24_000,
        channels: 1,
    }));

    assert_eq!(h.engine.state(), SessionState::Ready);
    assert_eq!(h.engine.scheduler().active_len(), 0);
    assert!(h.output.started().is_empty());
    assert!(h
        .drain()
        .iter()
        .any(|n| matches!(n, EngineNotice::Warning(_))));

    // the session keeps working afterwards
    h.server_says(silence_message(0.25, 24_000));
    assert_eq!(h.engine.scheduler().active_len(), 1);
}

#[test]
fn remote_close_while_recording_releases_microphone() {
    let mut h = Harness::recording();
    h.connector.latest().unwrap().closed("going away");
    h.engine.process_pending();

    assert_eq!(h.engine.state(), SessionState::Disconnected);
    assert!(!h.engine.capture().is_running());
    assert!(!h.mic.is_open());
    assert_eq!(h.mic.closes(), 1);
    assert!(!h.engine.has_channel());
    assert!(h
        .statuses()
        .contains(&"Session closed: going away".to_string()));
}

#[test]
fn error_before_open_enters_error_state() {
    let mut h = Harness::new();
    assert_ok!(h.engine.connect());
    h.connector.latest().unwrap().error("handshake refused");
    h.engine.process_pending();

    assert_eq!(h.engine.state(), SessionState::Error);
    assert_eq!(h.connector.closes(), 1);
    assert!(h
        .drain()
        .contains(&EngineNotice::Error("handshake refused".to_string())));

    // only reset leaves Error
    assert!(h.engine.start_recording().is_err());
    assert!(h.engine.connect().is_err());
    assert_ok!(h.engine.reset_session(None));
    assert_eq!(h.engine.state(), SessionState::Connecting);
}

#[test]
fn refused_open_enters_error_state() {
    let mut h = Harness::new();
    h.connector.refuse(Some("no route"));
    let err = assert_err!(h.engine.connect());
    assert!(matches!(err, VoiceError::Connection(_)));
    assert_eq!(h.engine.state(), SessionState::Error);
}

#[test]
fn messages_after_close_are_ignored() {
    let mut h = Harness::ready();
    let events = h.connector.latest().unwrap();
    events.closed("bye");
    events.message(silence_message(1.0, 24_000));
    events.message(ServerMessage::Interrupted);
    h.engine.process_pending();

    assert_eq!(h.engine.state(), SessionState::Disconnected);
    assert!(h.output.started().is_empty());
    assert_eq!(h.engine.scheduler().active_len(), 0);
}

#[test]
fn microphone_denied_keeps_session_ready() {
    let mut h = Harness::ready();
    h.drain();
    h.mic.set_unavailable(true);

    let err = assert_err!(h.engine.start_recording());
    assert!(matches!(err, VoiceError::Device(_)));
    assert_eq!(h.engine.state(), SessionState::Ready);

    let statuses = h.statuses();
    assert_eq!(statuses[0], "Requesting microphone...");
    assert!(statuses[1].starts_with("Mic Error: "), "{:?}", statuses);

    h.mic.set_unavailable(false);
    assert_ok!(h.engine.start_recording());
    assert_eq!(h.engine.state(), SessionState::Recording);
}

#[test]
fn mute_never_changes_session_state() {
    let mut h = Harness::recording();
    h.engine.set_muted(true);
    assert!(h.engine.is_muted());
    assert!(h.output.is_muted());
    assert_eq!(h.engine.state(), SessionState::Recording);

    assert_ok!(h.engine.stop_recording());
    h.engine.set_muted(false);
    assert!(!h.output.is_muted());
    assert_eq!(h.engine.state(), SessionState::Ready);
}

#[test]
fn frames_are_sent_only_while_recording() {
    let mut h = Harness::recording();

    assert!(h.mic.push_frame(vec![0.25; 256]));
    h.engine.process_pending();
    let sent = h.connector.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].pcm.len(), 512);
    assert_eq!(sent[0].sample_rate, 16_000);

    // a frame already queued when recording stops is dropped
    assert!(h.mic.push_frame(vec![0.25; 256]));
    assert_ok!(h.engine.stop_recording());
    h.engine.process_pending();
    assert_eq!(h.connector.sent().len(), 1);
    assert!(!h.mic.push_frame(vec![0.25; 256]));
    assert!(h.statuses().contains(&"Not listening".to_string()));
}

#[test]
fn stop_recording_outside_recording_is_a_no_op() {
    let mut h = Harness::ready();
    assert_ok!(h.engine.stop_recording());
    assert_eq!(h.engine.state(), SessionState::Ready);
    assert_eq!(h.mic.closes(), 0);
}

#[test]
fn device_failure_while_recording_returns_to_ready() {
    let mut h = Harness::recording();
    assert!(h.mic.fail("device unplugged"));
    h.engine.process_pending();

    assert_eq!(h.engine.state(), SessionState::Ready);
    assert!(!h.mic.is_open());
    assert!(h.engine.has_channel());
}

#[test]
fn inbound_segments_play_back_to_back() {
    let mut h = Harness::ready();
    h.server_says(silence_message(1.0, 24_000));
    h.server_says(silence_message(0.5, 24_000));

    let started = h.output.started();
    assert_eq!(started.len(), 2);
    assert_close(started[0].at, 0.0);
    assert_close(started[1].at, 1.0);
    assert_close(h.engine.scheduler().next_playback_time(), 1.5);
}

#[test]
fn interruption_cuts_playback_and_restarts_from_clock() {
    let mut h = Harness::recording();
    h.server_says(silence_message(1.0, 24_000));
    h.server_says(silence_message(1.0, 24_000));

    h.clock.set(0.3);
    h.server_says(ServerMessage::Interrupted);
    assert_eq!(h.output.stopped(), 2);
    assert_eq!(h.engine.scheduler().active_len(), 0);
    assert_close(h.engine.scheduler().next_playback_time(), 0.0);
    assert_eq!(h.engine.state(), SessionState::Recording);

    h.server_says(silence_message(0.5, 24_000));
    let last = h.output.started().last().cloned().unwrap();
    assert_close(last.at, 0.3);
    assert_close(h.engine.scheduler().next_playback_time(), 0.8);
}

#[test]
fn inbound_rate_is_converted_to_output_rate() {
    let mut h = Harness::ready();
    h.server_says(audio_message(&vec![0.1; 16_000], 16_000));
    let started = h.output.started();
    assert_eq!(started[0].samples, 24_000);
    assert_close(h.engine.scheduler().next_playback_time(), 1.0);
}

#[test]
fn tick_sweeps_finished_playbacks() {
    let mut h = Harness::ready();
    h.server_says(silence_message(1.0, 24_000));
    h.server_says(silence_message(0.5, 24_000));

    h.clock.set(1.1);
    h.engine.handle_event(EngineEvent::Tick);
    assert_eq!(h.engine.scheduler().active_len(), 1);

    h.clock.set(2.0);
    h.engine.handle_event(EngineEvent::Tick);
    assert!(!h.engine.scheduler().is_playing());
}

#[test]
fn turn_complete_is_forwarded() {
    let mut h = Harness::ready();
    h.drain();
    h.server_says(ServerMessage::TurnComplete);
    assert!(h.drain().contains(&EngineNotice::TurnComplete));
}

#[test]
fn shutdown_releases_everything_and_ignores_late_callbacks() {
    let mut h = Harness::recording();
    h.server_says(silence_message(1.0, 24_000));
    let events = h.connector.latest().unwrap();

    h.engine.shutdown();
    assert_eq!(h.engine.state(), SessionState::Disconnected);
    assert!(!h.mic.is_open());
    assert_eq!(h.connector.closes(), 1);
    assert_eq!(h.output.stopped(), 1);

    events.opened();
    events.message(silence_message(1.0, 24_000));
    h.engine.process_pending();
    assert_eq!(h.engine.state(), SessionState::Disconnected);
    assert_eq!(h.output.started().len(), 1);

    let states: Vec<SessionState> = h
        .drain()
        .into_iter()
        .filter_map(|n| match n {
            EngineNotice::StateChanged(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(
        &states[states.len() - 2..],
        &[SessionState::Closing, SessionState::Disconnected]
    );
}

#[tokio::test]
async fn run_loop_processes_commands_until_shutdown() {
    let mut h = Harness::new();
    let handle = h.engine.handle();
    let connector = h.connector.clone();
    let mic = h.mic.clone();

    let driver = async {
        assert_ok!(handle.send(live_voice::EngineCommand::Connect));
        tokio::time::sleep(Duration::from_millis(20)).await;
        connector.latest().unwrap().opened();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_ok!(handle.toggle_recording());
        tokio::time::sleep(Duration::from_millis(20)).await;
        mic.push_frame(vec![0.0; 256]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_ok!(handle.toggle_mute());
        assert_ok!(handle.shutdown());
    };

    let (result, _) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(h.engine.run(), driver)
    })
    .await
    .expect("engine did not stop");

    assert_ok!(result);
    assert_eq!(h.engine.state(), SessionState::Disconnected);
    assert_eq!(h.connector.sent().len(), 1);
    assert!(h.engine.is_muted());
    assert!(!h.mic.is_open());
}

#[test]
fn handle_fails_once_engine_is_gone() {
    let h = Harness::new();
    let handle = h.engine.handle();
    drop(h);
    assert!(matches!(
        handle.start_recording(),
        Err(VoiceError::ChannelSend(_))
    ));
}

#[tokio::test]
#[ignore] // Requires audio hardware and LIVE_VOICE__ENDPOINT__API_KEY
async fn test_live_session_with_hardware() {
    use live_voice::{AudioTap, CpalMicrophone, RodioOutput, WsConnector};

    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    dotenvy::dotenv().ok();

    let config = LiveConfig::load().expect("Failed to load config");
    let output = RodioOutput::new(config.audio.output_sample_rate, Some(AudioTap::new()))
        .expect("Failed to open output");
    let (mut engine, mut notices) = VoiceEngine::new(
        &config,
        WsConnector::new(config.endpoint.clone()),
        CpalMicrophone::new(),
        output,
    );
    let handle = engine.handle();
    engine.connect().expect("Failed to start connection");

    let driver = async {
        while let Some(notice) = notices.recv().await {
            println!("{:?}", notice);
            if notice == EngineNotice::SessionReady(true) {
                handle.start_recording().unwrap();
                tokio::time::sleep(Duration::from_secs(5)).await;
                handle.shutdown().unwrap();
                break;
            }
        }
    };

    let (result, _) = tokio::join!(engine.run(), driver);
    result.expect("Engine loop failed");
}
