//! sdn-exchange
//!
//! The SDS Exchange wire protocol: framed request/push/query/ack messages,
//! optional destination-addressed routing headers, the libp2p
//! request-response codec, and the server-side handler with trust, rate, and
//! signature enforcement.

pub mod codec;
pub mod message;
pub mod service;

pub use codec::{exchange_protocol, id_exchange_protocol, SdsCodec};
pub use message::{
    decode_record_list, encode_record_list, Envelope, ExchangeMessage, MessageType, QueryRequest,
    RoutingHeader, ROUTING_SENTINEL,
};
pub use service::{ExchangeService, HandleOutcome};
