//! Outbound event catalog.
//!
//! Every event publishes as `{"events":[{"header":{...},"payload":{...}}]}`
//! on the event topic, encrypted. The session assigns the message id and
//! the envelope sequence; this module only knows the shapes.

use serde_json::{json, Map, Value};

/// Buffer states reported through BufferStateChanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Overrun,
    OverrunWarning,
    Underrun,
    UnderrunWarning,
}

impl BufferState {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferState::Overrun => "OVERRUN",
            BufferState::OverrunWarning => "OVERRUN_WARNING",
            BufferState::Underrun => "UNDERRUN",
            BufferState::UnderrunWarning => "UNDERRUN_WARNING",
        }
    }
}

/// How the microphone came to be open, reported in MicrophoneOpened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initiator {
    /// `TAP`, `WAKEWORD`, or whatever the service named in OpenMicrophone.
    pub kind: String,
    /// Opaque token passed through from the service, when present.
    pub token: Option<String>,
    pub wake_word: Option<WakeWord>,
}

/// Wake word detection result: the word plus its byte offsets in the
/// microphone stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeWord {
    pub word: String,
    pub begin_offset: u64,
    pub end_offset: u64,
}

impl Initiator {
    fn to_json(&self) -> Value {
        let mut initiator = Map::new();
        initiator.insert("type".into(), Value::String(self.kind.clone()));

        let mut payload = Map::new();
        if let Some(token) = &self.token {
            payload.insert("token".into(), Value::String(token.clone()));
        }
        if let Some(ww) = &self.wake_word {
            payload.insert("wakeWord".into(), Value::String(ww.word.clone()));
            payload.insert(
                "wakeWordIndices".into(),
                json!({ "beginOffset": ww.begin_offset, "endOffset": ww.end_offset }),
            );
        }
        if !payload.is_empty() {
            initiator.insert("payload".into(), Value::Object(payload));
        }
        Value::Object(initiator)
    }
}

/// One outbound event with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    MicrophoneOpened {
        profile: String,
        initiator: Option<Initiator>,
        offset: u64,
    },
    MicrophoneClosed {
        offset: u64,
    },
    SpeakerOpened {
        offset: u64,
    },
    SpeakerClosed {
        offset: u64,
    },
    SpeakerMarkerEncountered {
        marker: u32,
    },
    BufferStateChanged {
        topic: &'static str,
        sequence: u32,
        state: BufferState,
    },
    VolumeChanged {
        volume: u32,
    },
    SynchronizeState {
        speaker_volume: Option<u32>,
        all_alerts: Option<Vec<String>>,
    },
    ButtonCommandIssued {
        command: &'static str,
    },
}

/// The service command issued when the user stops playback by touch.
pub fn stop_playing() -> Event {
    Event::ButtonCommandIssued { command: "STOP" }
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::MicrophoneOpened { .. } => "MicrophoneOpened",
            Event::MicrophoneClosed { .. } => "MicrophoneClosed",
            Event::SpeakerOpened { .. } => "SpeakerOpened",
            Event::SpeakerClosed { .. } => "SpeakerClosed",
            Event::SpeakerMarkerEncountered { .. } => "SpeakerMarkerEncountered",
            Event::BufferStateChanged { .. } => "BufferStateChanged",
            Event::VolumeChanged { .. } => "VolumeChanged",
            Event::SynchronizeState { .. } => "SynchronizeState",
            Event::ButtonCommandIssued { .. } => "ButtonCommandIssued",
        }
    }

    fn payload(&self) -> Value {
        match self {
            Event::MicrophoneOpened {
                profile,
                initiator,
                offset,
            } => {
                let mut payload = Map::new();
                payload.insert("profile".into(), Value::String(profile.clone()));
                if let Some(initiator) = initiator {
                    payload.insert("initiator".into(), initiator.to_json());
                }
                payload.insert("offset".into(), json!(offset));
                Value::Object(payload)
            }
            Event::MicrophoneClosed { offset }
            | Event::SpeakerOpened { offset }
            | Event::SpeakerClosed { offset } => json!({ "offset": offset }),
            Event::SpeakerMarkerEncountered { marker } => json!({ "marker": marker }),
            Event::BufferStateChanged {
                topic,
                sequence,
                state,
            } => json!({
                "message": { "topic": topic, "sequenceNumber": sequence },
                "state": state.as_str(),
            }),
            Event::VolumeChanged { volume } => json!({ "volume": volume }),
            Event::SynchronizeState {
                speaker_volume,
                all_alerts,
            } => {
                let mut payload = Map::new();
                if let Some(volume) = speaker_volume {
                    payload.insert("speaker".into(), json!({ "volume": volume }));
                }
                if let Some(alerts) = all_alerts {
                    payload.insert("alerts".into(), json!({ "allAlerts": alerts }));
                }
                Value::Object(payload)
            }
            Event::ButtonCommandIssued { command } => json!({ "command": command }),
        }
    }

    /// Render the full transport message for this event.
    pub fn to_message(&self, message_id: u64) -> Value {
        json!({
            "events": [{
                "header": {
                    "name": self.name(),
                    "messageId": message_id.to_string(),
                },
                "payload": self.payload(),
            }]
        })
    }
}
