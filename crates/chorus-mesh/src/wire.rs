//! Message framing over peer data channels.
//!
//! Every message is a UTF-8 JSON object with a `type` tag and a `payload`:
//!
//! ```text
//! {"type":"stateUpdate","payload":{"userId":"u1","resonance":0.4,...}}
//! ```
//!
//! Unknown `type` values decode to [`Inbound::Unknown`] so newer peers can
//! introduce message kinds without breaking older ones.

use bytes::Bytes;
use chorus_field::ParticipantState;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const STATE_UPDATE: &str = "stateUpdate";

/// Messages this node understands.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshMessage {
    /// A participant's full current state.
    StateUpdate(ParticipantState),
}

impl MeshMessage {
    /// Wire tag for this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateUpdate(_) => STATE_UPDATE,
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(MeshMessage),
    /// Well-formed frame with a `type` this node does not handle.
    Unknown(String),
}

#[derive(Serialize)]
struct OutFrame<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: &'a T,
}

#[derive(Deserialize)]
struct InFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Encode a message to its wire bytes.
pub fn encode(message: &MeshMessage) -> Result<Bytes> {
    let bytes = match message {
        MeshMessage::StateUpdate(state) => serde_json::to_vec(&OutFrame {
            kind: message.kind(),
            payload: state,
        })?,
    };
    Ok(Bytes::from(bytes))
}

/// Decode wire bytes.
///
/// Anything that is not a JSON object with a string `type`, or whose payload
/// does not fit its type, is [`Error::MalformedMessage`].
pub fn decode(data: &[u8]) -> Result<Inbound> {
    let frame: InFrame =
        serde_json::from_slice(data).map_err(|e| Error::MalformedMessage(e.to_string()))?;

    match frame.kind.as_str() {
        STATE_UPDATE => {
            let state: ParticipantState = serde_json::from_value(frame.payload)
                .map_err(|e| Error::MalformedMessage(format!("{STATE_UPDATE}: {e}")))?;
            Ok(Inbound::Message(MeshMessage::StateUpdate(state)))
        }
        _ => Ok(Inbound::Unknown(frame.kind)),
    }
}
