//! Internal pub/sub bus for channel fan-out.
//!
//! Frames on the bus carry a fixed-width header: the channel name and the
//! target client id, each padded with spaces (or truncated) to
//! [`HEADER_FIELD_WIDTH`] bytes, followed by the JSON [`Envelope`]. An empty
//! client id field addresses every subscriber of the channel.
//!
//! The bus never reaches clients directly; each socket connection filters
//! frames against its own subscriptions before forwarding them.

use std::collections::HashSet;
use std::sync::Arc;

use robe_shared::{Envelope, ProtocolError};
use serde_json::Value;
use tokio::sync::broadcast;

pub const HEADER_FIELD_WIDTH: usize = 64;
const HEADER_LEN: usize = HEADER_FIELD_WIDTH * 2;
const BUS_CAPACITY: usize = 1024;

/// A decoded bus frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerFrame {
    pub channel: String,
    pub client_id: Option<String>,
    pub envelope: Envelope,
}

impl BrokerFrame {
    /// Whether a connection with `client_id` and these channel
    /// `subscriptions` should receive this frame.
    ///
    /// Subscriptions are matched against the envelope's channel, not the
    /// header field, which is cut at [`HEADER_FIELD_WIDTH`] bytes.
    pub fn is_for(&self, client_id: &str, subscriptions: &HashSet<String>) -> bool {
        match &self.client_id {
            Some(target) => target == client_id,
            None => subscriptions.contains(&self.envelope.channel),
        }
    }
}

pub fn encode_frame(
    channel: &str,
    client_id: Option<&str>,
    envelope: &Envelope,
) -> Result<Vec<u8>, ProtocolError> {
    let payload = envelope.to_json()?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    push_field(&mut out, channel);
    push_field(&mut out, client_id.unwrap_or(""));
    out.extend_from_slice(payload.as_bytes());
    Ok(out)
}

pub fn decode_frame(bytes: &[u8]) -> Result<BrokerFrame, ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated { len: bytes.len() });
    }
    let channel = read_field(&bytes[..HEADER_FIELD_WIDTH])?;
    let client_id = read_field(&bytes[HEADER_FIELD_WIDTH..HEADER_LEN])?;
    let payload = std::str::from_utf8(&bytes[HEADER_LEN..])
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    Ok(BrokerFrame {
        channel,
        client_id: (!client_id.is_empty()).then_some(client_id),
        envelope: Envelope::parse(payload)?,
    })
}

fn push_field(out: &mut Vec<u8>, field: &str) {
    let mut end = field.len().min(HEADER_FIELD_WIDTH);
    while !field.is_char_boundary(end) {
        end -= 1;
    }
    out.extend_from_slice(&field.as_bytes()[..end]);
    out.resize(out.len() + HEADER_FIELD_WIDTH - end, b' ');
}

fn read_field(raw: &[u8]) -> Result<String, ProtocolError> {
    let text = std::str::from_utf8(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok(text.trim_end_matches(' ').to_string())
}

/// Process-wide fan-out bus.
#[derive(Clone)]
pub struct Broker {
    tx: broadcast::Sender<Arc<Vec<u8>>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish `event`/`content` on `channel`, to one client or to every
    /// subscriber. Returns how many connections saw the frame.
    pub fn publish(
        &self,
        channel: &str,
        client_id: Option<&str>,
        event: &str,
        content: Value,
    ) -> Result<usize, ProtocolError> {
        let frame = encode_frame(channel, client_id, &Envelope::new(channel, event, content))?;
        Ok(self.tx.send(Arc::new(frame)).unwrap_or(0))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_fields_are_fixed_width() {
        let env = Envelope::new("chat", "say", json!("hi"));
        let frame = encode_frame("chat", Some("abc"), &env).unwrap();
        assert_eq!(&frame[..4], b"chat");
        assert!(frame[4..HEADER_FIELD_WIDTH].iter().all(|b| *b == b' '));
        assert_eq!(&frame[HEADER_FIELD_WIDTH..HEADER_FIELD_WIDTH + 3], b"abc");

        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.channel, "chat");
        assert_eq!(decoded.client_id.as_deref(), Some("abc"));
        assert_eq!(decoded.envelope, env);
    }

    #[test]
    fn test_long_names_are_truncated_on_char_boundary() {
        let name = format!("{}é", "a".repeat(63));
        let env = Envelope::new(name.as_str(), "x", Value::Null);
        let frame = encode_frame(&name, None, &env).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.channel, "a".repeat(63));
        assert_eq!(decoded.client_id, None);
    }

    #[test]
    fn test_short_frame_is_rejected() {
        assert_eq!(
            decode_frame(b"tiny"),
            Err(ProtocolError::Truncated { len: 4 })
        );
    }

    fn subscribed_to(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_frame_targeting() {
        let env = Envelope::new("chat", "say", Value::Null);
        let broadcast = decode_frame(&encode_frame("chat", None, &env).unwrap()).unwrap();
        assert!(broadcast.is_for("anyone", &subscribed_to(&["chat"])));
        assert!(!broadcast.is_for("anyone", &subscribed_to(&[])));

        let unicast = decode_frame(&encode_frame("chat", Some("c1"), &env).unwrap()).unwrap();
        assert!(unicast.is_for("c1", &subscribed_to(&[])));
        assert!(!unicast.is_for("c2", &subscribed_to(&["chat"])));
    }

    #[test]
    fn test_long_channel_reaches_its_subscribers() {
        let name = "c".repeat(HEADER_FIELD_WIDTH + 6);
        let env = Envelope::new(name.as_str(), "say", Value::Null);
        let frame = decode_frame(&encode_frame(&name, None, &env).unwrap()).unwrap();

        assert!(frame.is_for("anyone", &subscribed_to(&[name.as_str()])));
        // A different channel sharing the same first 64 bytes is not a match.
        assert!(!frame.is_for("anyone", &subscribed_to(&[frame.channel.as_str()])));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let broker = Broker::new();
        let mut rx = broker.subscribe();
        let seen = broker.publish("chat", None, "say", json!({"text": "hi"})).unwrap();
        assert_eq!(seen, 1);

        let frame = decode_frame(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame.envelope.content["text"], "hi");
    }
}
