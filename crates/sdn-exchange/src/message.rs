use serde::{Deserialize, Serialize};

use sdn_core::{PeerId, Predicate, SdnError, MAX_EXCHANGE_PAYLOAD};

/// Wire message kinds. The values are the on-wire `MessageType` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    RequestData = 0x01,
    PushData = 0x02,
    Query = 0x03,
    Response = 0x04,
    Ack = 0x05,
    Nack = 0x06,
}

/// Sentinel first byte marking an optional routing-header block ahead of the
/// core framing. Not a valid `MessageType`.
pub const ROUTING_SENTINEL: u8 = 0x00;

impl MessageType {
    pub fn from_byte(b: u8) -> Result<Self, SdnError> {
        match b {
            0x01 => Ok(MessageType::RequestData),
            0x02 => Ok(MessageType::PushData),
            0x03 => Ok(MessageType::Query),
            0x04 => Ok(MessageType::Response),
            0x05 => Ok(MessageType::Ack),
            0x06 => Ok(MessageType::Nack),
            other => Err(SdnError::InvalidRequest(format!("unknown message type {other:#04x}"))),
        }
    }
}

/// One framed exchange message.
///
/// Layout on the wire:
///
/// ```text
/// byte  0        MessageType (u8)
/// bytes 1..3     schema name length (big-endian u16)
/// bytes 3..3+N   schema name (UTF-8)
/// next 4 bytes   payload length (big-endian u32)
/// remainder      payload
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMessage {
    pub msg_type: MessageType,
    pub schema_name: String,
    pub payload: Vec<u8>,
}

/// Optional destination-addressed relay block preceding the core framing.
///
/// `schema_type` and `destination_peers` stay cleartext so intermediate
/// nodes can route; payload encryption (when flagged) is end-to-end between
/// the addressed peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHeader {
    pub schema_type: String,
    pub destination_peers: Vec<PeerId>,
    /// Remaining hop count; decremented per relay, dropped at 0.
    pub ttl: u8,
    pub priority: u8,
    pub encrypted: bool,
    pub session_key_id: Option<String>,
}

/// A message plus its optional routing header: what actually rides a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub routing: Option<RoutingHeader>,
    pub message: ExchangeMessage,
}

impl ExchangeMessage {
    pub fn new(msg_type: MessageType, schema_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self { msg_type, schema_name: schema_name.into(), payload }
    }

    /// Ack carrying the stored CID text.
    pub fn ack(schema: &str, cid_hex: String) -> Self {
        Self::new(MessageType::Ack, schema, cid_hex.into_bytes())
    }

    /// Nack carrying a short machine-readable reason.
    pub fn nack(schema: &str, reason: &str) -> Self {
        Self::new(MessageType::Nack, schema, reason.as_bytes().to_vec())
    }

    pub fn encode(&self) -> Result<Vec<u8>, SdnError> {
        if self.payload.len() > MAX_EXCHANGE_PAYLOAD {
            return Err(SdnError::MessageTooLarge {
                size: self.payload.len(),
                max: MAX_EXCHANGE_PAYLOAD,
            });
        }
        let schema = self.schema_name.as_bytes();
        if schema.len() > u16::MAX as usize {
            return Err(SdnError::InvalidRequest("schema name too long".into()));
        }
        let mut out = Vec::with_capacity(1 + 2 + schema.len() + 4 + self.payload.len());
        out.push(self.msg_type as u8);
        out.extend_from_slice(&(schema.len() as u16).to_be_bytes());
        out.extend_from_slice(schema);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode a message from `buf`, returning it and the bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), SdnError> {
        let short = || SdnError::InvalidRequest("truncated exchange message".into());
        if buf.len() < 3 {
            return Err(short());
        }
        let msg_type = MessageType::from_byte(buf[0])?;
        let schema_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let mut pos = 3;
        if buf.len() < pos + schema_len + 4 {
            return Err(short());
        }
        let schema_name = std::str::from_utf8(&buf[pos..pos + schema_len])
            .map_err(|_| SdnError::InvalidRequest("schema name is not UTF-8".into()))?
            .to_string();
        pos += schema_len;
        let payload_len =
            u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        pos += 4;
        if payload_len > MAX_EXCHANGE_PAYLOAD {
            return Err(SdnError::MessageTooLarge { size: payload_len, max: MAX_EXCHANGE_PAYLOAD });
        }
        if buf.len() < pos + payload_len {
            return Err(short());
        }
        let payload = buf[pos..pos + payload_len].to_vec();
        pos += payload_len;
        Ok((Self { msg_type, schema_name, payload }, pos))
    }
}

impl RoutingHeader {
    /// Encode as `ROUTING_SENTINEL | u32 len | bincode(header)`.
    fn encode(&self) -> Result<Vec<u8>, SdnError> {
        let body = bincode::serialize(self).map_err(|e| SdnError::Serialization(e.to_string()))?;
        let mut out = Vec::with_capacity(5 + body.len());
        out.push(ROUTING_SENTINEL);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize), SdnError> {
        let short = || SdnError::InvalidRequest("truncated routing header".into());
        if buf.len() < 5 || buf[0] != ROUTING_SENTINEL {
            return Err(short());
        }
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len > MAX_EXCHANGE_PAYLOAD {
            return Err(SdnError::MessageTooLarge { size: len, max: MAX_EXCHANGE_PAYLOAD });
        }
        if buf.len() < 5 + len {
            return Err(short());
        }
        let header: RoutingHeader = bincode::deserialize(&buf[5..5 + len])
            .map_err(|e| SdnError::Serialization(e.to_string()))?;
        Ok((header, 5 + len))
    }
}

impl Envelope {
    pub fn plain(message: ExchangeMessage) -> Self {
        Self { routing: None, message }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SdnError> {
        let mut out = Vec::new();
        if let Some(routing) = &self.routing {
            out.extend_from_slice(&routing.encode()?);
        }
        out.extend_from_slice(&self.message.encode()?);
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, SdnError> {
        let (routing, consumed) = match buf.first() {
            Some(&ROUTING_SENTINEL) => {
                let (header, consumed) = RoutingHeader::decode(buf)?;
                (Some(header), consumed)
            }
            _ => (None, 0),
        };
        let (message, end) = ExchangeMessage::decode(&buf[consumed..])?;
        if consumed + end != buf.len() {
            return Err(SdnError::InvalidRequest("trailing bytes after message".into()));
        }
        Ok(Self { routing, message })
    }
}

/// Compact serialization of a network query: `(schema, predicates, limit)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub schema: String,
    pub predicates: Vec<Predicate>,
    pub limit: Option<u32>,
}

impl QueryRequest {
    // JSON rather than bincode: predicate values are free-form JSON scalars,
    // which a non-self-describing format cannot round-trip.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SdnError> {
        serde_json::to_vec(self).map_err(|e| SdnError::Serialization(e.to_string()))
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, SdnError> {
        serde_json::from_slice(buf).map_err(|e| SdnError::Serialization(e.to_string()))
    }
}

/// Length-prefixed record list for Query responses: u32 count, then
/// `u32 len | bytes` per record.
pub fn encode_record_list(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(items.len() as u32).to_be_bytes());
    for item in items {
        out.extend_from_slice(&(item.len() as u32).to_be_bytes());
        out.extend_from_slice(item);
    }
    out
}

pub fn decode_record_list(buf: &[u8]) -> Result<Vec<Vec<u8>>, SdnError> {
    let short = || SdnError::InvalidRequest("truncated record list".into());
    if buf.len() < 4 {
        return Err(short());
    }
    let count = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let mut pos = 4;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if buf.len() < pos + 4 {
            return Err(short());
        }
        let len = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        pos += 4;
        if buf.len() < pos + len {
            return Err(short());
        }
        out.push(buf[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(out)
}
