//! Inbound message handling.
//!
//! One task polls the MQTT event loop and dispatches every publish by
//! topic: connection acknowledgements in plaintext, everything else
//! through the crypto envelope. Because all inbound work runs on this one
//! task, the state transitions caused by one message complete before the
//! next is looked at.

use crate::crypto::CryptoError;
use crate::directive::{self, AttentionState, Directive};
use crate::events::{Event, Initiator};
use crate::seqbuf::SequenceBuffer;
use crate::session::{Session, ShutdownReason};
use crate::speaker::{SpeakerIngress, SpeakerMessage};
use crate::state::ClientState;
use rumqttc::{Event as MqttEvent, EventLoop, Packet};
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct ControlMessage {
    header: ControlHeader,
    #[serde(default)]
    payload: Option<ControlPayload>,
}

#[derive(Debug, Deserialize)]
struct ControlHeader {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ControlPayload {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Per-session inbound state: speaker sequencing plus the directive
/// reorder point.
pub struct Receiver {
    session: Arc<Session>,
    speaker: SpeakerIngress,
    directive_expect: u32,
    directive_buffer: SequenceBuffer,
}

impl Receiver {
    pub fn new(session: Arc<Session>) -> Self {
        Receiver {
            speaker: SpeakerIngress::new(session.clone()),
            session,
            directive_expect: 0,
            directive_buffer: SequenceBuffer::new(),
        }
    }

    /// Handle one raw publish.
    pub async fn handle_publish(&mut self, topic: &str, payload: &[u8]) {
        self.session.stats.record_recv(payload.len());

        if topic == self.session.topics.connection_fromservice {
            self.handle_connection(payload);
            return;
        }

        let (sequence, body) = match self.session.crypto.decrypt(payload) {
            Ok(decrypted) => decrypted,
            Err(CryptoError::SequenceMismatch) => {
                // TODO: close the connection with a MESSAGE_TAMPERED
                // disconnect code instead of only dropping the frame.
                self.session.stats.record_decrypt_failure();
                warn!(topic = %topic, "decrypted sequence number does not match, dropping frame");
                return;
            }
            Err(e) => {
                self.session.stats.record_decrypt_failure();
                warn!(topic = %topic, error = %e, "failed to decrypt frame, dropping");
                return;
            }
        };
        debug!(topic = %topic, sequence, bytes = body.len(), "inbound message");

        if topic == self.session.topics.speaker {
            self.session.stats.record_speaker_message();
            self.speaker
                .handle(SpeakerMessage {
                    sequence,
                    payload: body,
                })
                .await;
        } else if topic == self.session.topics.directive {
            self.handle_directive(sequence, body).await;
        } else if topic == self.session.topics.capabilities_acknowledge {
            self.handle_capabilities_ack(&body);
        } else {
            debug!(topic = %topic, "message on unexpected topic");
        }
    }

    // ── Connection topic (plaintext) ───────────────────────────────────

    fn handle_connection(&mut self, payload: &[u8]) {
        let message: ControlMessage = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(e) => {
                self.session.stats.record_parse_error();
                warn!(error = %e, "unparseable connection message");
                return;
            }
        };
        let payload = message.payload.unwrap_or_default();
        let code = payload.code.as_deref().unwrap_or("");

        match message.header.name.as_str() {
            "Acknowledge" => {
                if code == "CONNECTION_ESTABLISHED" {
                    info!("service connection established");
                    self.session.state.set(ClientState::CONNECTED);
                } else {
                    warn!(code = %code, "service refused the connection");
                    self.session.state.set(ClientState::CONNECTION_DENIED);
                }
            }
            "Disconnect" => {
                if self.session.state.contains(ClientState::CONNECTED) {
                    warn!(
                        code = %code,
                        description = payload.description.as_deref().unwrap_or(""),
                        "service disconnected us"
                    );
                    self.session.signal_shutdown(ShutdownReason::ServiceDisconnect);
                }
            }
            other => debug!(name = %other, "unhandled connection message"),
        }
    }

    // ── Capabilities acknowledge ───────────────────────────────────────

    fn handle_capabilities_ack(&mut self, body: &[u8]) {
        let message: ControlMessage = match serde_json::from_slice(body) {
            Ok(m) => m,
            Err(e) => {
                self.session.stats.record_parse_error();
                warn!(error = %e, "unparseable capabilities acknowledgement");
                return;
            }
        };
        let payload = message.payload.unwrap_or_default();
        if payload.code.as_deref() == Some("CAPABILITIES_ACCEPTED") {
            info!("capabilities accepted");
            self.session.state.set(ClientState::CAPABILITIES_ACCEPTED);
        } else {
            warn!(
                description = payload.description.as_deref().unwrap_or(""),
                "capabilities rejected"
            );
            self.session.state.set(ClientState::CAPABILITIES_REJECTED);
        }
    }

    // ── Directive topic ────────────────────────────────────────────────

    /// Deliver directives to the dispatcher strictly in sequence order,
    /// parking early arrivals and dropping replays.
    async fn handle_directive(&mut self, sequence: u32, body: Vec<u8>) {
        if sequence < self.directive_expect {
            debug!(sequence, expected = self.directive_expect, "dropping replayed directive");
            return;
        }
        if sequence > self.directive_expect {
            self.directive_buffer.insert(sequence, body);
            debug!(
                sequence,
                expected = self.directive_expect,
                parked = self.directive_buffer.len(),
                "parking early directive"
            );
            return;
        }

        self.dispatch(&body).await;
        self.directive_expect = self.directive_expect.wrapping_add(1);
        while let Some(parked) = self.directive_buffer.pop_if_first(self.directive_expect) {
            self.dispatch(&parked).await;
            self.directive_expect = self.directive_expect.wrapping_add(1);
        }
    }

    async fn dispatch(&mut self, body: &[u8]) {
        let directives = match directive::parse_message(body) {
            Ok(d) => d,
            Err(e) => {
                self.session.stats.record_parse_error();
                warn!(error = %e, "unparseable directive message, dropping");
                return;
            }
        };
        for directive in directives {
            self.apply(directive).await;
        }
    }

    async fn apply(&mut self, directive: Directive) {
        let session = &self.session;
        match directive {
            Directive::SetAttentionState { state } => {
                info!(state = ?state, "attention state");
                let bit = match state {
                    AttentionState::Idle => ClientState::ATTENTION_IDLE,
                    AttentionState::Thinking => ClientState::ATTENTION_THINKING,
                    AttentionState::Speaking => ClientState::ATTENTION_SPEAKING,
                    AttentionState::Alerting => ClientState::ATTENTION_ALERTING,
                };
                session.state.set_attention(bit);
                if state == AttentionState::Idle {
                    session.platform.touch_button_enable();
                    session.platform.indicator_on();
                }
            }
            Directive::OpenSpeaker { offset } => {
                debug!(offset, "OpenSpeaker");
                session.speaker.open_offset.store(offset, Ordering::SeqCst);
                session.state.set(ClientState::OPEN_SPEAKER_RECEIVED);
            }
            Directive::CloseSpeaker { offset } => {
                debug!(?offset, "CloseSpeaker");
                match offset {
                    Some(offset) => {
                        session.speaker.close_offset.store(offset, Ordering::SeqCst)
                    }
                    None => session.state.set(ClientState::CLOSE_SPEAKER_NO_OFFSET),
                }
            }
            Directive::OpenMicrophone { initiator } => {
                debug!("OpenMicrophone");
                session.set_initiator(initiator.map(|i| Initiator {
                    kind: i.kind,
                    token: i.payload.and_then(|p| p.token),
                    wake_word: None,
                }));
                session.microphone.ring.reset();
                session.open_microphone();
                session.platform.indicator_blink(200);
            }
            Directive::CloseMicrophone => {
                debug!("CloseMicrophone");
                session.close_microphone();
            }
            Directive::SetVolume { volume } => {
                debug!(volume, "SetVolume");
                session.speaker.volume.store(volume, Ordering::SeqCst);
                if let Err(e) = session.send_event(Event::VolumeChanged { volume }).await {
                    warn!(error = %e, "failed to report volume change");
                }
            }
        }
    }
}

/// The receiver task: drives the MQTT event loop for the whole process.
pub async fn receiver_task(session: Arc<Session>, mut eventloop: EventLoop) {
    let mut receiver = Receiver::new(session);
    info!("receiver task up");
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                receiver
                    .handle_publish(&publish.topic, &publish.payload)
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "MQTT connection error, retrying in 1s");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
