//! The session: one value owning everything the tasks share.
//!
//! Cross-task state lives here behind narrow locks — the state word, the
//! speaker queue and PCM ring, the microphone ring, a handful of atomics
//! for offsets and flags, and the outbound event counters. Tasks receive
//! an `Arc<Session>` and nothing else.

use crate::buffers::{ByteRing, MessageQueue};
use crate::config::Config;
use crate::crypto::{CryptoContext, CryptoError, KeyMaterial};
use crate::events::{Event, Initiator, WakeWord};
use crate::platform::Platform;
use crate::speaker::SpeakerMessage;
use crate::state::{ClientState, StateSet};
use crate::stats::Stats;
use crate::transport::{self, Topics};
use rumqttc::AsyncClient;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

/// Default speech profile reported in MicrophoneOpened.
const ASR_PROFILE: &str = "NEAR_FIELD";

#[derive(Debug, Error)]
pub enum EventError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("publish failed: {0}")]
    Transport(#[from] rumqttc::ClientError),
}

/// Why the session is going down. Sent to the orchestrator, which tears
/// everything off and exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The service sent a Disconnect on the connection topic.
    ServiceDisconnect,
    /// A speaker sequence arrived beyond the resequencing window while no
    /// overrun retransmit was pending.
    SpeakerSequenceOutOfRange { sequence: u32, expected: u32 },
    /// A streaming task hit a fatal encrypt or publish error.
    StreamingFailure,
}

/// Outbound counters: envelope sequence and event message id, advanced
/// together under one lock held through publish so published sequences
/// are gap-free and in order.
struct Outbound {
    sequence: u32,
    message_id: u64,
}

/// Speaker-side shared state.
pub struct SpeakerShared {
    /// Decrypted messages in sequence order, budgeted in payload bytes.
    pub queue: MessageQueue<SpeakerMessage>,
    /// Decoded PCM drained by the platform output device.
    pub output: ByteRing,
    /// Playback volume, 0..=100.
    pub volume: AtomicU32,
    /// Offset named by the pending or active OpenSpeaker.
    pub open_offset: AtomicU64,
    /// Offset named by the pending CloseSpeaker.
    pub close_offset: AtomicU64,
    /// Absolute offset just past the last decoded audio byte.
    pub output_offset: AtomicU64,
}

/// Microphone-side shared state.
pub struct MicrophoneShared {
    /// Raw capture ring the platform fills.
    pub ring: ByteRing,
    /// Absolute bytes published so far.
    pub offset: AtomicU64,
}

pub struct Session {
    pub config: Config,
    pub topics: Topics,
    pub mqtt: AsyncClient,
    pub crypto: CryptoContext,
    pub state: StateSet,
    pub stats: Arc<Stats>,
    pub platform: Arc<dyn Platform>,
    pub speaker: SpeakerShared,
    pub microphone: MicrophoneShared,

    outbound: tokio::sync::Mutex<Outbound>,
    /// Initiator for the next MicrophoneOpened event.
    initiator: Mutex<Option<Initiator>>,
    /// Set when an opening should produce a MicrophoneOpened event;
    /// consumed by the microphone task.
    mic_opened_pending: AtomicBool,
    /// The speaker queue rejected a push and the service will retransmit.
    pub overrun: AtomicBool,
    /// The microphone opened while in overrun: retransmitted sequences
    /// will carry different content, so parked lookahead must be dropped.
    pub mic_opened_during_overrun: AtomicBool,

    shutdown: tokio::sync::mpsc::Sender<ShutdownReason>,
}

impl Session {
    pub fn new(
        config: Config,
        mqtt: AsyncClient,
        platform: Arc<dyn Platform>,
        stats: Arc<Stats>,
        shutdown: tokio::sync::mpsc::Sender<ShutdownReason>,
    ) -> Result<Self, CryptoError> {
        let crypto = CryptoContext::new(&KeyMaterial {
            client_public: &config.client_public_key,
            client_private: &config.client_private_key,
            peer_public: &config.peer_public_key,
        })?;

        let topics = Topics::new(&config);
        let speaker = SpeakerShared {
            queue: MessageQueue::new(config.speaker_buffer_size),
            output: ByteRing::new(config.decode_buffer_size()),
            volume: AtomicU32::new(config.default_volume.min(100)),
            open_offset: AtomicU64::new(0),
            close_offset: AtomicU64::new(0),
            output_offset: AtomicU64::new(0),
        };
        let microphone = MicrophoneShared {
            ring: ByteRing::new(config.mic_buffer_size()),
            offset: AtomicU64::new(0),
        };

        Ok(Session {
            config,
            topics,
            mqtt,
            crypto,
            state: StateSet::new(),
            stats,
            platform,
            speaker,
            microphone,
            outbound: tokio::sync::Mutex::new(Outbound {
                sequence: 0,
                message_id: 0,
            }),
            initiator: Mutex::new(None),
            mic_opened_pending: AtomicBool::new(false),
            overrun: AtomicBool::new(false),
            mic_opened_during_overrun: AtomicBool::new(false),
            shutdown,
        })
    }

    // ── Event emission ─────────────────────────────────────────────────

    /// Serialize, encrypt and publish one event. The counter lock is held
    /// through the publish so envelope sequences hit the wire gap-free
    /// and in order even with concurrent emitters.
    pub async fn send_event(&self, event: Event) -> Result<(), EventError> {
        let mut outbound = self.outbound.lock().await;
        let sequence = outbound.sequence;
        let message_id = outbound.message_id;

        let message = event.to_message(message_id).to_string();
        debug!(seq = sequence, event = event.name(), "sending event");
        let frame = self.crypto.encrypt(sequence, message.as_bytes())?;

        match transport::publish(&self.mqtt, &self.topics.event, frame).await {
            Ok(()) => {
                outbound.sequence += 1;
                outbound.message_id += 1;
                self.stats.record_event_published();
                Ok(())
            }
            Err(e) => {
                self.stats.record_publish_error();
                Err(e.into())
            }
        }
    }

    // ── Speaker operations ─────────────────────────────────────────────

    /// Open the speaker at `offset`: fresh PCM ring, platform output on,
    /// SpeakerOpened out, state bit set.
    pub async fn open_speaker(&self, offset: u64) -> Result<(), EventError> {
        info!(offset, "speaker open");
        self.speaker.output.reset();
        self.platform.speaker_open();
        self.send_event(Event::SpeakerOpened { offset }).await?;
        self.state.set(ClientState::SPEAKER_OPEN);
        Ok(())
    }

    /// Close the speaker at `offset`: platform output off, state bit
    /// cleared, SpeakerClosed out.
    pub async fn close_speaker(&self, offset: u64) -> Result<(), EventError> {
        info!(offset, "speaker close");
        self.platform.speaker_close();
        self.state.clear(ClientState::SPEAKER_OPEN);
        self.send_event(Event::SpeakerClosed { offset }).await
    }

    pub fn volume(&self) -> u32 {
        self.speaker.volume.load(Ordering::Relaxed)
    }

    // ── Microphone operations ──────────────────────────────────────────

    /// Open the microphone. The uplink task emits MicrophoneOpened and
    /// starts draining the capture ring.
    pub fn open_microphone(&self) {
        self.state.set(ClientState::MICROPHONE_OPEN);
        if self.overrun.load(Ordering::SeqCst) {
            self.mic_opened_during_overrun.store(true, Ordering::SeqCst);
        }
        self.mic_opened_pending.store(true, Ordering::SeqCst);
        self.platform.indicator_blink(500);
        self.platform.microphone_open();
    }

    /// Close the microphone. The uplink task emits MicrophoneClosed on
    /// its next pass.
    pub fn close_microphone(&self) {
        self.platform.microphone_close();
        self.state.clear(ClientState::MICROPHONE_OPEN);
        self.platform.indicator_off();
    }

    /// Consume the pending MicrophoneOpened marker.
    pub fn take_mic_opened_pending(&self) -> bool {
        self.mic_opened_pending.swap(false, Ordering::SeqCst)
    }

    pub fn set_initiator(&self, initiator: Option<Initiator>) {
        *self.initiator.lock().unwrap() = initiator;
    }

    /// Initiator for the MicrophoneOpened event being built.
    pub fn current_initiator(&self) -> Option<Initiator> {
        self.initiator.lock().unwrap().clone()
    }

    pub fn asr_profile(&self) -> &'static str {
        ASR_PROFILE
    }

    // ── User input entry points ────────────────────────────────────────

    /// Touch button handler. While the assistant is speaking or alerting
    /// a tap stops playback; otherwise it opens the microphone.
    pub async fn button_tapped(&self) -> Result<(), EventError> {
        if self
            .state
            .intersects(ClientState::ATTENTION_SPEAKING | ClientState::ATTENTION_ALERTING)
        {
            return self.send_event(crate::events::stop_playing()).await;
        }
        self.set_initiator(Some(Initiator {
            kind: "TAP".into(),
            token: None,
            wake_word: None,
        }));
        self.open_microphone();
        self.platform.touch_button_disable();
        Ok(())
    }

    /// Wake word handler: the detector names the word and its byte range
    /// in the capture stream.
    pub fn wake_word_detected(&self, word: &str, begin_offset: u64, end_offset: u64) {
        self.set_initiator(Some(Initiator {
            kind: "WAKEWORD".into(),
            token: None,
            wake_word: Some(WakeWord {
                word: word.to_string(),
                begin_offset,
                end_offset,
            }),
        }));
        self.open_microphone();
    }

    // ── Audio callback entry points ────────────────────────────────────

    /// Feed captured PCM into the microphone ring. Non-blocking; returns
    /// the bytes accepted. Safe to call from a capture callback.
    pub fn fill_microphone_buffer(&self, pcm: &[u8]) -> usize {
        self.microphone.ring.try_write(pcm)
    }

    /// Drain decoded PCM for the output device. Non-blocking; returns the
    /// bytes copied. Safe to call from an output callback.
    pub fn read_speaker_buffer(&self, buf: &mut [u8]) -> usize {
        self.speaker.output.try_read(buf)
    }

    // ── Bootstrap documents ────────────────────────────────────────────

    pub fn connect_message(&self) -> Value {
        json!({
            "header": { "name": "Connect", "messageId": "0" },
            "payload": {
                "awsAccountId": self.config.aws_account_id,
                "clientId": self.config.thing_name,
            }
        })
    }

    pub fn disconnect_message(&self) -> Value {
        json!({
            "header": { "name": "Disconnect", "messageId": "disconnecting_message" },
            "payload": {
                "code": "GOING_OFFLINE",
                "description": format!("{} disconnecting", self.config.thing_name),
            }
        })
    }

    pub fn capabilities_document(&self) -> Value {
        json!({
            "header": {
                "name": "Publish",
                "messageId": format!("{}_Capabilities", self.config.thing_name),
            },
            "payload": {
                "capabilities": [
                    {
                        "type": "AisInterface",
                        "interface": "Speaker",
                        "version": "1.0",
                        "configurations": {
                            "audioBuffer": {
                                "sizeInBytes": self.config.speaker_buffer_size,
                                "reporting": {
                                    "overrunWarningThreshold": self.config.speaker_overrun_warning,
                                    "underrunWarningThreshold": self.config.speaker_underrun_warning,
                                }
                            },
                            "audioDecoder": {
                                "format": "OPUS",
                                "bitrate": {
                                    "type": "CONSTANT",
                                    "bitsPerSecond": self.config.speaker_bitrate,
                                },
                                "numberOfChannels": self.config.speaker_channels,
                            }
                        }
                    },
                    {
                        "type": "AisInterface",
                        "interface": "Microphone",
                        "version": "1.0",
                        "configurations": {
                            "audioEncoder": { "format": "AUDIO_L16_RATE_16000_CHANNELS_1" }
                        }
                    },
                    {
                        "type": "AisInterface",
                        "interface": "System",
                        "version": "1.0",
                        "configurations": {
                            "mqtt": { "message": { "maxSizeInBytes": self.config.message_max_size } },
                            "firmwareVersion": "42",
                            "locale": "en-US",
                        }
                    }
                ]
            }
        })
    }

    pub fn synchronize_state_event(&self) -> Event {
        Event::SynchronizeState {
            speaker_volume: Some(self.volume()),
            // Device alerts are declared unsupported.
            all_alerts: None,
        }
    }

    // ── Teardown ───────────────────────────────────────────────────────

    /// Tell the orchestrator the session is done for. Never blocks.
    pub fn signal_shutdown(&self, reason: ShutdownReason) {
        let _ = self.shutdown.try_send(reason);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{offline_session, offline_session_with_config, test_config};
    use super::*;

    #[test]
    fn capabilities_document_shape() {
        let (session, _rx) =
            offline_session_with_config(test_config(&["--thing-name", "dev-7"]));

        let doc = session.capabilities_document();
        assert_eq!(doc["header"]["name"], "Publish");
        assert_eq!(doc["header"]["messageId"], "dev-7_Capabilities");

        let caps = doc["payload"]["capabilities"].as_array().unwrap();
        assert_eq!(caps.len(), 3);
        assert_eq!(caps[0]["interface"], "Speaker");
        assert_eq!(caps[0]["configurations"]["audioBuffer"]["sizeInBytes"], 32000);
        assert_eq!(caps[0]["configurations"]["audioDecoder"]["format"], "OPUS");
        assert_eq!(
            caps[0]["configurations"]["audioDecoder"]["bitrate"]["bitsPerSecond"],
            64000
        );
        assert_eq!(caps[1]["interface"], "Microphone");
        assert_eq!(
            caps[1]["configurations"]["audioEncoder"]["format"],
            "AUDIO_L16_RATE_16000_CHANNELS_1"
        );
        assert_eq!(caps[2]["interface"], "System");
        assert_eq!(
            caps[2]["configurations"]["mqtt"]["message"]["maxSizeInBytes"],
            5400
        );
    }

    #[test]
    fn connect_and_disconnect_messages() {
        let (session, _rx) = offline_session_with_config(test_config(&[
            "--thing-name",
            "dev-7",
            "--aws-account-id",
            "123456789012",
        ]));

        let connect = session.connect_message();
        assert_eq!(connect["header"]["name"], "Connect");
        assert_eq!(connect["payload"]["awsAccountId"], "123456789012");
        assert_eq!(connect["payload"]["clientId"], "dev-7");

        let disconnect = session.disconnect_message();
        assert_eq!(disconnect["payload"]["code"], "GOING_OFFLINE");
        assert_eq!(disconnect["payload"]["description"], "dev-7 disconnecting");
    }

    #[tokio::test]
    async fn concurrent_emitters_each_publish_exactly_once() {
        let (session, _rx) = offline_session();

        let emitters: Vec<_> = (0..10)
            .map(|i| {
                let session = session.clone();
                tokio::spawn(async move {
                    session.send_event(Event::VolumeChanged { volume: i }).await
                })
            })
            .collect();
        for handle in emitters {
            handle.await.unwrap().unwrap();
        }

        // Ten events, ten envelope sequences, no gaps: the next emission
        // observes exactly ten predecessors.
        assert_eq!(session.stats.events_published.load(Ordering::Relaxed), 10);
        session
            .send_event(Event::VolumeChanged { volume: 0 })
            .await
            .unwrap();
        assert_eq!(session.stats.events_published.load(Ordering::Relaxed), 11);
    }

    #[test]
    fn open_microphone_flags_overrun_window() {
        let (session, _rx) = offline_session();
        session.overrun.store(true, Ordering::SeqCst);
        session.open_microphone();

        assert!(session.state.contains(ClientState::MICROPHONE_OPEN));
        assert!(session.mic_opened_during_overrun.load(Ordering::SeqCst));
        assert!(session.take_mic_opened_pending());
        // Consumed exactly once.
        assert!(!session.take_mic_opened_pending());
    }

    #[test]
    fn audio_callback_entry_points_move_bytes() {
        let (session, _rx) = offline_session();
        assert_eq!(session.fill_microphone_buffer(&[1u8; 100]), 100);
        let mut drain = [0u8; 100];
        assert_eq!(session.microphone.ring.try_read(&mut drain), 100);

        session.speaker.output.try_write(&[2u8; 64]);
        let mut out = [0u8; 64];
        assert_eq!(session.read_speaker_buffer(&mut out), 64);
        assert_eq!(out, [2u8; 64]);
    }
}
