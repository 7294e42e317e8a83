//! RPC messages exchanged between clients and brokers.
//!
//! The same types are used by the in-process transport (passed by value) and
//! by the TCP transport (serialized as JSON inside an [`Envelope`]).
//!
//! # Directions
//!
//! ```text
//! client ──BrokerRequest──▶ broker      broker ──ClientRequest──▶ client
//! client ◀─BrokerResponse── broker      broker ◀─ClientResponse── client
//! ```
//!
//! Broker-initiated calls (`Deliver`, `AliveCheck`) travel on the connection
//! the client opened, so a client never needs to accept connections.

use bytes::Bytes;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorCode};
use crate::types::{
    ClientRole, Delivery, Mid, Msid, PartitionId, PublishMode, SubscribeMode,
};

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Stable per client process. A reconnect with the same id takes over
    /// the name it was assigned before.
    pub client_id: String,
    pub name: String,
    /// Address the client reports for itself.
    pub url: String,
    pub topic: String,
    pub partition: PartitionId,
    /// Partition count used when this connect creates the topic.
    pub partition_count: u32,
    pub role: ClientRole,
    #[serde(default)]
    pub publish_mode: PublishMode,
    /// How long a `WaitExclusive` publisher may wait for the lead role.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub name: String,
    pub topic: String,
    pub partition: PartitionId,
    pub mid: Mid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub name: String,
    pub topic: String,
    pub partition: PartitionId,
    pub subscription: String,
    pub mode: SubscribeMode,
    /// First msid wanted; `0` starts after the partition push offset.
    pub sub_offset: Msid,
    /// Bound on a failover wait.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub name: String,
    pub topic: String,
    pub partition: PartitionId,
    pub subscription: String,
    /// Number of messages the subscriber can still buffer.
    pub buf_size: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullStatus {
    /// The buffer budget was used up.
    BufferFull,
    /// No further messages arrived before the pull timeout.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReply {
    pub delivered: u32,
    pub status: PullStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRequest {
    pub topic: String,
    pub partition: PartitionId,
    pub subscription: String,
    pub ack_offset: Msid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub name: String,
    pub topic: String,
    pub partition: PartitionId,
    pub subscription: String,
}

/// Client to broker call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerRequest {
    Lookup { topic: String, partition: PartitionId },
    RequestAlloc { topic: String, partition: PartitionId },
    Connect(ConnectRequest),
    Publish(PublishRequest),
    Subscribe(SubscribeRequest),
    Pull(PullRequest),
    Ack(AckRequest),
    Unsubscribe(UnsubscribeRequest),
    GetTopicInfo { topic: String },
    Disconnect { name: String },
}

impl BrokerRequest {
    /// Operation name used in logs and metrics.
    pub fn op_name(&self) -> &'static str {
        match self {
            BrokerRequest::Lookup { .. } => "lookup",
            BrokerRequest::RequestAlloc { .. } => "request_alloc",
            BrokerRequest::Connect(_) => "connect",
            BrokerRequest::Publish(_) => "publish",
            BrokerRequest::Subscribe(_) => "subscribe",
            BrokerRequest::Pull(_) => "pull",
            BrokerRequest::Ack(_) => "ack",
            BrokerRequest::Unsubscribe(_) => "unsubscribe",
            BrokerRequest::GetTopicInfo { .. } => "get_topic_info",
            BrokerRequest::Disconnect { .. } => "disconnect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BrokerResponse {
    Url(String),
    Name(String),
    Msid(Msid),
    Pulled(PullReply),
    PartitionCount(u32),
    Ok,
    Error(WireError),
}

/// Broker to client call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientRequest {
    Deliver(Delivery),
    AliveCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ClientResponse {
    Ok,
    Error(WireError),
}

// ============================================================================
// Errors on the wire
// ============================================================================

/// Serialized form of [`Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: i16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_url: Option<String>,
}

impl From<&Error> for WireError {
    fn from(e: &Error) -> Self {
        let leader_url = match e {
            Error::NeedAllocation { leader_url } => Some(leader_url.clone()),
            _ => None,
        };
        Self {
            code: e.code() as i16,
            message: e.wire_message(),
            leader_url,
        }
    }
}

impl WireError {
    pub fn into_error(self) -> Error {
        let code = ErrorCode::from_i16(self.code).unwrap_or(ErrorCode::Unknown);
        Error::from_wire(code, self.message, self.leader_url)
    }
}

// ============================================================================
// Framing
// ============================================================================

/// One frame on a TCP connection.
///
/// Correlation ids are scoped per direction: the client numbers its
/// requests, the broker numbers its pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: u64,
    pub body: FrameBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum FrameBody {
    Request(BrokerRequest),
    Response(BrokerResponse),
    Push(ClientRequest),
    PushReply(ClientResponse),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn test_need_allocation_keeps_leader_url() {
        let err = Error::NeedAllocation {
            leader_url: "10.0.0.1:7100".into(),
        };
        let wire = WireError::from(&err);
        assert_eq!(wire.leader_url.as_deref(), Some("10.0.0.1:7100"));
        assert_eq!(wire.into_error(), err);
    }

    #[test]
    fn test_unknown_code_maps_to_transport() {
        let wire = WireError {
            code: 999,
            message: "boom".into(),
            leader_url: None,
        };
        assert_eq!(wire.into_error(), Error::Transport("boom".into()));
    }

    #[test]
    fn test_envelope_json_shape() {
        let env = Envelope {
            correlation_id: 7,
            body: FrameBody::Request(BrokerRequest::Lookup {
                topic: "t".into(),
                partition: 1,
            }),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["correlation_id"], 7);
        assert_eq!(json["body"]["frame"], "request");
        assert_eq!(json["body"]["op"], "lookup");
        assert_eq!(json["body"]["topic"], "t");
    }

    #[test]
    fn test_push_frame_decodes() {
        let delivery = Delivery {
            subscription: "s".into(),
            message: Message {
                topic: "t".into(),
                partition: 1,
                msid: 3,
                mid: 3,
                key: None,
                payload: Bytes::from_static(b"hi"),
            },
        };
        let env = Envelope {
            correlation_id: 1,
            body: FrameBody::Push(ClientRequest::Deliver(delivery.clone())),
        };
        let bytes = serde_json::to_vec(&env).unwrap();
        let back: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.body, FrameBody::Push(ClientRequest::Deliver(delivery)));
    }

    #[test]
    fn test_op_names() {
        let req = BrokerRequest::Disconnect { name: "x".into() };
        assert_eq!(req.op_name(), "disconnect");
    }
}
