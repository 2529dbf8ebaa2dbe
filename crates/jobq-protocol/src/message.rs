use crate::ErrorResponse;
use jobq_core::{JobEnvelope, JobEvent, JobId, JobRecord, JobState, Lease};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message types for the TCP protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Enqueue = 1,
    Claim = 2,
    Ack = 3,
    Nack = 4,
    Depth = 5,
    CreateRecord = 6,
    GetRecord = 7,
    ApplyEvent = 8,
    RemoveRecord = 9,
    ListRecords = 10,
    Ok = 100,
    Error = 101,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Enqueue),
            2 => Some(MessageType::Claim),
            3 => Some(MessageType::Ack),
            4 => Some(MessageType::Nack),
            5 => Some(MessageType::Depth),
            6 => Some(MessageType::CreateRecord),
            7 => Some(MessageType::GetRecord),
            8 => Some(MessageType::ApplyEvent),
            9 => Some(MessageType::RemoveRecord),
            10 => Some(MessageType::ListRecords),
            100 => Some(MessageType::Ok),
            101 => Some(MessageType::Error),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Protocol messages. Every request is answered by exactly one `Ok` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Store an envelope in the broker queue
    Enqueue(EnqueueRequest),

    /// Lease one ready envelope; answered with `Ok { body: Lease | null }`
    Claim(ClaimRequest),

    Ack(AckRequest),

    Nack(NackRequest),

    /// Queue occupancy; answered with `Ok { body: QueueDepth }`
    Depth(DepthRequest),

    CreateRecord(CreateRecordRequest),

    /// Answered with `Ok { body: JobRecord }`
    GetRecord(GetRecordRequest),

    /// Answered with `Ok { body: JobRecord }` holding the updated record
    ApplyEvent(ApplyEventRequest),

    RemoveRecord(RemoveRecordRequest),

    /// Answered with `Ok { body: [JobRecord] }`
    ListRecords(ListRecordsRequest),

    /// Successful response
    Ok(OkResponse),

    /// Failed response carrying the engine error
    Error(ErrorResponse),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Enqueue(_) => MessageType::Enqueue,
            Message::Claim(_) => MessageType::Claim,
            Message::Ack(_) => MessageType::Ack,
            Message::Nack(_) => MessageType::Nack,
            Message::Depth(_) => MessageType::Depth,
            Message::CreateRecord(_) => MessageType::CreateRecord,
            Message::GetRecord(_) => MessageType::GetRecord,
            Message::ApplyEvent(_) => MessageType::ApplyEvent,
            Message::RemoveRecord(_) => MessageType::RemoveRecord,
            Message::ListRecords(_) => MessageType::ListRecords,
            Message::Ok(_) => MessageType::Ok,
            Message::Error(_) => MessageType::Error,
        }
    }

    /// Shorthand for an `Ok` response with an empty body
    pub fn ok() -> Self {
        Message::Ok(OkResponse { body: Value::Null })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub envelope: JobEnvelope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub visibility_ms: u64,
    /// How long the broker may hold the request open waiting for work
    pub wait_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckRequest {
    pub lease: Lease,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NackRequest {
    pub lease: Lease,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DepthRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRecordRequest {
    pub record: JobRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRecordRequest {
    pub id: JobId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyEventRequest {
    pub id: JobId,
    pub event: JobEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveRecordRequest {
    pub id: JobId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRecordsRequest {
    pub handler_name: String,
    pub state: JobState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OkResponse {
    pub body: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(1), Some(MessageType::Enqueue));
        assert_eq!(MessageType::from_u8(9), Some(MessageType::RemoveRecord));
        assert_eq!(MessageType::from_u8(10), Some(MessageType::ListRecords));
        assert_eq!(MessageType::from_u8(101), Some(MessageType::Error));
        assert_eq!(MessageType::from_u8(42), None);

        assert_eq!(MessageType::Claim.as_u8(), 2);
        assert_eq!(MessageType::Ok.as_u8(), 100);
    }

    #[test]
    fn test_message_type_matches_variant() {
        assert_eq!(Message::ok().message_type(), MessageType::Ok);
        assert_eq!(
            Message::Depth(DepthRequest::default()).message_type(),
            MessageType::Depth
        );
    }
}
