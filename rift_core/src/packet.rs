//! Single-packet wire codec.
//!
//! The wire text form is `type:id:endpoint:data`, with the trailing `:data`
//! segment omitted when a packet carries none. Only the first three colons
//! are structural: endpoint never contains a colon, and everything after
//! the third colon (including further colons and multi-byte UTF-8) is the
//! data segment verbatim.
//!
//! Event and ack argument arrays stay as raw JSON text here; they are only
//! parsed by the dispatch layer, against a handler's declared shape.

use bytes::Bytes;
use thiserror::Error;

/// A decoded wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Tear down a namespace (or the whole session when `endpoint` is empty).
    Disconnect {
        /// Namespace path; empty is the default namespace.
        endpoint: String,
    },

    /// A namespace is (being) established.
    Connect {
        /// Namespace path; empty is the default namespace.
        endpoint: String,
    },

    /// Keep-alive probe; answering one resets the peer's missed count.
    Heartbeat,

    /// A plain text message, dispatched under the event name `message`.
    Message {
        /// Correlation id, `0` when no acknowledgment is requested.
        id: u64,
        /// Namespace path.
        endpoint: String,
        /// The raw message text.
        data: String,
    },

    /// A JSON message, dispatched under the event name `message`.
    Json {
        /// Correlation id, `0` when no acknowledgment is requested.
        id: u64,
        /// Namespace path.
        endpoint: String,
        /// The raw JSON text.
        data: String,
    },

    /// A named event with a JSON-encoded argument array.
    Event {
        /// Correlation id, `0` when no acknowledgment is requested.
        id: u64,
        /// Namespace path.
        endpoint: String,
        /// The event name.
        name: String,
        /// The raw JSON argument array.
        args: String,
    },

    /// An acknowledgment reply to a packet that carried an id.
    Ack {
        /// The id of the packet being acknowledged.
        ack_id: u64,
        /// The raw JSON result array.
        args: String,
    },

    /// A protocol-level error delivered to the peer.
    Error {
        /// Namespace path.
        endpoint: String,
        /// Machine-readable reason.
        reason: String,
        /// Optional advice segment.
        advice: String,
    },

    /// Filler frame; carries nothing.
    Noop,
}

impl Packet {
    /// The namespace path this packet addresses.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        match self {
            Packet::Disconnect { endpoint }
            | Packet::Connect { endpoint }
            | Packet::Message { endpoint, .. }
            | Packet::Json { endpoint, .. }
            | Packet::Event { endpoint, .. }
            | Packet::Error { endpoint, .. } => endpoint,
            Packet::Heartbeat | Packet::Ack { .. } | Packet::Noop => "",
        }
    }

    /// The correlation id, `0` when absent.
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            Packet::Message { id, .. } | Packet::Json { id, .. } | Packet::Event { id, .. } => *id,
            _ => 0,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Packet::Disconnect { .. } => 0,
            Packet::Connect { .. } => 1,
            Packet::Heartbeat => 2,
            Packet::Message { .. } => 3,
            Packet::Json { .. } => 4,
            Packet::Event { .. } => 5,
            Packet::Ack { .. } => 6,
            Packet::Error { .. } => 7,
            Packet::Noop => 8,
        }
    }
}

/// A malformed single packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer is not valid UTF-8.
    #[error("packet is not valid UTF-8")]
    Utf8,

    /// The buffer has fewer than the three structural colons required.
    #[error("truncated packet")]
    Truncated,

    /// The type digit is not one of the known packet kinds.
    #[error("unknown packet type `{0}`")]
    UnknownKind(String),

    /// The id segment is present but not an unsigned integer.
    #[error("invalid packet id `{0}`")]
    InvalidId(String),

    /// An event or ack data segment is not the JSON shape it must be.
    #[error("invalid packet data: {0}")]
    InvalidData(String),
}

/// Render a packet to its wire form, addressed to `endpoint`.
///
/// The endpoint argument wins over any endpoint stored in the packet, so a
/// namespace can stamp its own path on every packet it sends.
#[must_use]
pub fn encode_packet(endpoint: &str, packet: &Packet) -> Bytes {
    let data: Option<String> = match packet {
        Packet::Disconnect { .. } | Packet::Connect { .. } => None,
        Packet::Heartbeat | Packet::Noop => None,
        Packet::Message { data, .. } | Packet::Json { data, .. } => Some(data.clone()),
        Packet::Event { name, args, .. } => {
            // `args` is raw JSON; splice it in next to the escaped name.
            let name_json =
                serde_json::to_string(name).unwrap_or_else(|_| String::from("\"\""));
            Some(format!("{{\"name\":{name_json},\"args\":{args}}}"))
        }
        Packet::Ack { ack_id, args } => {
            if args.is_empty() {
                Some(ack_id.to_string())
            } else {
                Some(format!("{ack_id}+{args}"))
            }
        }
        Packet::Error { reason, advice, .. } => {
            if advice.is_empty() {
                Some(reason.clone())
            } else {
                Some(format!("{reason}+{advice}"))
            }
        }
    };

    let mut out = String::new();
    out.push((b'0' + packet.kind()) as char);
    out.push(':');
    let id = packet.id();
    if id != 0 {
        out.push_str(&id.to_string());
    }
    out.push(':');
    out.push_str(endpoint);
    if let Some(data) = data {
        out.push(':');
        out.push_str(&data);
    }
    Bytes::from(out)
}

/// Decode a single packet from its wire form.
///
/// JSON payloads inside the data segment are validated only as far as the
/// packet shape requires (an event must carry `{"name": …, "args": […]}`);
/// argument arrays are kept as raw text.
pub fn decode_packet(raw: &[u8]) -> Result<Packet, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::Utf8)?;

    let mut parts = text.splitn(4, ':');
    let kind = parts.next().unwrap_or("");
    let id_part = parts.next().ok_or(DecodeError::Truncated)?;
    let endpoint = parts.next().ok_or(DecodeError::Truncated)?.to_string();
    let data = parts.next().unwrap_or("");

    // A trailing `+` on the id is the peer's explicit ack request marker;
    // a bare non-zero id means the same thing.
    let id_digits = id_part.strip_suffix('+').unwrap_or(id_part);
    let id: u64 = if id_digits.is_empty() {
        0
    } else {
        id_digits
            .parse()
            .map_err(|_| DecodeError::InvalidId(id_part.to_string()))?
    };

    match kind {
        "0" => Ok(Packet::Disconnect { endpoint }),
        "1" => Ok(Packet::Connect { endpoint }),
        "2" => Ok(Packet::Heartbeat),
        "3" => Ok(Packet::Message {
            id,
            endpoint,
            data: data.to_string(),
        }),
        "4" => Ok(Packet::Json {
            id,
            endpoint,
            data: data.to_string(),
        }),
        "5" => {
            let value: serde_json::Value = serde_json::from_str(data)
                .map_err(|e| DecodeError::InvalidData(e.to_string()))?;
            let name = value
                .get("name")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| DecodeError::InvalidData("event without a name".into()))?
                .to_string();
            let args = match value.get("args") {
                Some(args) => args.to_string(),
                None => String::from("[]"),
            };
            Ok(Packet::Event {
                id,
                endpoint,
                name,
                args,
            })
        }
        "6" => {
            let (ack_digits, args) = match data.split_once('+') {
                Some((ack, rest)) => (ack, rest.to_string()),
                None => (data, String::new()),
            };
            let ack_id: u64 = ack_digits
                .parse()
                .map_err(|_| DecodeError::InvalidData(format!("bad ack id `{ack_digits}`")))?;
            Ok(Packet::Ack { ack_id, args })
        }
        "7" => {
            let (reason, advice) = match data.split_once('+') {
                Some((r, a)) => (r.to_string(), a.to_string()),
                None => (data.to_string(), String::new()),
            };
            Ok(Packet::Error {
                endpoint,
                reason,
                advice,
            })
        }
        "8" => Ok(Packet::Noop),
        other => Err(DecodeError::UnknownKind(other.to_string())),
    }
}
