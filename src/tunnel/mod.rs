//! Tunnel plumbing shared by the relay and the workstation client.
//!
//! The [`Envelope`] is the single frame type on the tunnel socket. The relay
//! wraps every inbound client frame into a `message` envelope tagged with that
//! client's `connection_id`; the workstation replies with `message` envelopes
//! tagged the same way. `connected`/`disconnected` bracket a client's
//! lifetime. The `payload` is opaque to the tunnel on both legs — it is never
//! re-parsed, only routed.

pub mod client;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tracing::warn;

/// Frame type discriminator for [`Envelope`].
///
/// Unknown values deserialize to [`EnvelopeType::Unknown`] rather than failing
/// the whole frame, so newer peers can introduce types without breaking older
/// ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    /// A client connected on the relay; no payload.
    Connected,
    /// A client disconnected on the relay; no payload.
    Disconnected,
    /// An opaque client frame in either direction.
    Message,
    /// Any type this build doesn't know. Logged and dropped by receivers.
    #[serde(other)]
    Unknown,
}

/// One multiplexed frame on the tunnel socket.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Relay-assigned id of the client this frame belongs to.
    pub connection_id: String,
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,
    /// Raw client bytes, present only for `message` frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

/// Failure to decode an [`Envelope`] from a tunnel text frame.
#[derive(Debug)]
pub struct MalformedFrame(pub serde_json::Error);

impl std::fmt::Display for MalformedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed tunnel frame: {}", self.0)
    }
}

impl std::error::Error for MalformedFrame {}

impl Envelope {
    /// A `message` frame carrying `payload` for `connection_id`.
    pub fn message(connection_id: &str, payload: Box<RawValue>) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            envelope_type: EnvelopeType::Message,
            payload: Some(payload),
        }
    }

    /// A payload-less control frame (`connected`/`disconnected`).
    pub fn control(connection_id: &str, envelope_type: EnvelopeType) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            envelope_type,
            payload: None,
        }
    }

    /// Decode a single-line JSON frame.
    pub fn decode(text: &str) -> Result<Self, MalformedFrame> {
        serde_json::from_str(text).map_err(MalformedFrame)
    }

    /// Encode to a single-line JSON frame.
    pub fn encode(&self) -> String {
        // Envelope contains only string/enum/RawValue fields; serialization
        // cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Persisted relay identity, written after a successful registration.
///
/// Lives at `$HOME/.devport/relay/config.json` with mode 0600 (directory
/// 0700), since the token alone proves subdomain ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayIdentity {
    pub subdomain: String,
    pub relay_token: String,
    pub relay_server: String,
}

impl RelayIdentity {
    /// Path of the persisted identity file.
    pub fn path() -> Option<PathBuf> {
        let home = std::env::var_os("HOME")?;
        Some(
            PathBuf::from(home)
                .join(".devport")
                .join("relay")
                .join("config.json"),
        )
    }

    /// Load the persisted identity, if any. Parse failures are treated as
    /// absence: the caller re-registers and overwrites the file.
    pub async fn load() -> Option<Self> {
        let path = Self::path()?;
        let data = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&data) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!("Ignoring unreadable relay identity at {}: {e}", path.display());
                None
            }
        }
    }

    /// Persist this identity with restrictive permissions.
    pub async fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(std::io::Error::other("HOME is not set"));
        };
        let Some(dir) = path.parent() else {
            return Err(std::io::Error::other("identity path has no parent"));
        };
        tokio::fs::create_dir_all(dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
        }
        let data = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        tokio::fs::write(&path, data).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }

    /// Remove the persisted identity (after the relay rejected the token).
    pub async fn discard() {
        if let Some(path) = Self::path() {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_message_round_trip() {
        let payload = RawValue::from_string(r#"{"jsonrpc":"2.0","id":1}"#.to_string()).unwrap();
        let env = Envelope::message("conn-1", payload);
        let text = env.encode();
        let back = Envelope::decode(&text).unwrap();
        assert_eq!(back.connection_id, "conn-1");
        assert_eq!(back.envelope_type, EnvelopeType::Message);
        // The payload must survive byte-for-byte; the codec never reinterprets it.
        assert_eq!(back.payload.unwrap().get(), r#"{"jsonrpc":"2.0","id":1}"#);
    }

    #[test]
    fn envelope_control_omits_payload() {
        let env = Envelope::control("conn-2", EnvelopeType::Connected);
        let text = env.encode();
        assert!(!text.contains("payload"));
        let back = Envelope::decode(&text).unwrap();
        assert_eq!(back.envelope_type, EnvelopeType::Connected);
        assert!(back.payload.is_none());
    }

    #[test]
    fn envelope_unknown_type_tolerated() {
        let back =
            Envelope::decode(r#"{"connection_id":"c","type":"http_request","payload":{}}"#).unwrap();
        assert_eq!(back.envelope_type, EnvelopeType::Unknown);
    }

    #[test]
    fn envelope_malformed_frame_errors() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"type":"message"}"#).is_err());
    }
}
