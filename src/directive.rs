//! Inbound directive model.
//!
//! One transport message on the directive topic carries an array of
//! directive objects which must be applied in array order:
//!
//! ```json
//! {"directives":[{"header":{"name":"SetAttentionState","messageId":"..."},
//!                 "payload":{"state":"THINKING"}},
//!                {"header":{"name":"OpenSpeaker","messageId":"..."},
//!                 "payload":{"offset":0}}]}
//! ```
//!
//! Parsing is strict per directive but lenient per message: an unknown
//! name or malformed payload drops that directive with a log line and the
//! rest still apply.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct DirectiveEnvelope {
    directives: Vec<RawDirective>,
}

#[derive(Debug, Deserialize)]
struct RawDirective {
    header: DirectiveHeader,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct DirectiveHeader {
    pub name: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
}

/// Attention states the service can put the assistant into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttentionState {
    Idle,
    Thinking,
    Speaking,
    Alerting,
}

#[derive(Debug, Deserialize)]
struct SetAttentionStatePayload {
    state: AttentionState,
    #[serde(default)]
    offset: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenSpeakerPayload {
    offset: u64,
}

#[derive(Debug, Default, Deserialize)]
struct CloseSpeakerPayload {
    #[serde(default)]
    offset: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenMicrophonePayload {
    #[serde(default)]
    initiator: Option<InitiatorPayload>,
}

/// Initiator as named by the service in OpenMicrophone; echoed back in the
/// MicrophoneOpened event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InitiatorPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Option<InitiatorToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InitiatorToken {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetVolumePayload {
    volume: u32,
    #[serde(default)]
    offset: Option<u64>,
}

/// A directive the dispatcher knows how to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    SetAttentionState { state: AttentionState },
    OpenSpeaker { offset: u64 },
    CloseSpeaker { offset: Option<u64> },
    OpenMicrophone { initiator: Option<InitiatorPayload> },
    CloseMicrophone,
    SetVolume { volume: u32 },
}

/// Parse a decrypted directive message body into the directives to apply,
/// in array order.
pub fn parse_message(body: &[u8]) -> Result<Vec<Directive>, serde_json::Error> {
    let envelope: DirectiveEnvelope = serde_json::from_slice(body)?;
    let mut parsed = Vec::with_capacity(envelope.directives.len());

    for raw in envelope.directives {
        let name = raw.header.name.as_str();
        let payload = raw.payload.unwrap_or(Value::Null);
        let directive = match name {
            "SetAttentionState" => serde_json::from_value::<SetAttentionStatePayload>(payload)
                .map(|p| {
                    if p.offset.is_some() {
                        // Offset-synchronized attention changes are not
                        // handled; the state change applies immediately.
                        warn!(message_id = %raw.header.message_id, "ignoring offset in SetAttentionState");
                    }
                    Directive::SetAttentionState { state: p.state }
                }),
            "OpenSpeaker" => serde_json::from_value::<OpenSpeakerPayload>(payload)
                .map(|p| Directive::OpenSpeaker { offset: p.offset }),
            "CloseSpeaker" => {
                if payload.is_null() {
                    Ok(Directive::CloseSpeaker { offset: None })
                } else {
                    serde_json::from_value::<CloseSpeakerPayload>(payload)
                        .map(|p| Directive::CloseSpeaker { offset: p.offset })
                }
            }
            "OpenMicrophone" => {
                if payload.is_null() {
                    Ok(Directive::OpenMicrophone { initiator: None })
                } else {
                    serde_json::from_value::<OpenMicrophonePayload>(payload)
                        .map(|p| Directive::OpenMicrophone { initiator: p.initiator })
                }
            }
            "CloseMicrophone" => Ok(Directive::CloseMicrophone),
            "SetVolume" => serde_json::from_value::<SetVolumePayload>(payload).map(|p| {
                if p.offset.is_some() {
                    warn!(message_id = %raw.header.message_id, "ignoring offset in SetVolume");
                }
                Directive::SetVolume {
                    volume: p.volume.min(100),
                }
            }),
            other => {
                warn!(directive = %other, message_id = %raw.header.message_id, "unknown directive, skipping");
                continue;
            }
        };

        match directive {
            Ok(d) => parsed.push(d),
            Err(e) => {
                warn!(directive = %name, message_id = %raw.header.message_id, error = %e,
                      "malformed directive payload, skipping");
            }
        }
    }

    Ok(parsed)
}
