use crate::{Message, MessageType, ProtocolError, Result, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Codec for encoding/decoding messages with length-prefixed framing
///
/// Frame format: [4-byte length (big-endian)] [1-byte message type] [JSON body]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Need at least 5 bytes for length prefix + message type
        if src.len() < 5 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[0..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length == 0 {
            return Err(ProtocolError::Protocol("empty frame".to_string()));
        }
        if length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(length));
        }

        // Wait for complete message
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);

        let msg_type_byte = src.get_u8();
        let msg_type = MessageType::from_u8(msg_type_byte)
            .ok_or(ProtocolError::InvalidMessageType(msg_type_byte))?;

        let body = src.split_to(length - 1);

        let message = match msg_type {
            MessageType::Enqueue => Message::Enqueue(serde_json::from_slice(&body)?),
            MessageType::Claim => Message::Claim(serde_json::from_slice(&body)?),
            MessageType::Ack => Message::Ack(serde_json::from_slice(&body)?),
            MessageType::Nack => Message::Nack(serde_json::from_slice(&body)?),
            MessageType::Depth => Message::Depth(serde_json::from_slice(&body)?),
            MessageType::CreateRecord => Message::CreateRecord(serde_json::from_slice(&body)?),
            MessageType::GetRecord => Message::GetRecord(serde_json::from_slice(&body)?),
            MessageType::ApplyEvent => Message::ApplyEvent(serde_json::from_slice(&body)?),
            MessageType::RemoveRecord => Message::RemoveRecord(serde_json::from_slice(&body)?),
            MessageType::ListRecords => Message::ListRecords(serde_json::from_slice(&body)?),
            MessageType::Ok => Message::Ok(serde_json::from_slice(&body)?),
            MessageType::Error => Message::Error(serde_json::from_slice(&body)?),
        };

        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let body = match &item {
            Message::Enqueue(req) => serde_json::to_vec(req)?,
            Message::Claim(req) => serde_json::to_vec(req)?,
            Message::Ack(req) => serde_json::to_vec(req)?,
            Message::Nack(req) => serde_json::to_vec(req)?,
            Message::Depth(req) => serde_json::to_vec(req)?,
            Message::CreateRecord(req) => serde_json::to_vec(req)?,
            Message::GetRecord(req) => serde_json::to_vec(req)?,
            Message::ApplyEvent(req) => serde_json::to_vec(req)?,
            Message::RemoveRecord(req) => serde_json::to_vec(req)?,
            Message::ListRecords(req) => serde_json::to_vec(req)?,
            Message::Ok(resp) => serde_json::to_vec(resp)?,
            Message::Error(resp) => serde_json::to_vec(resp)?,
        };

        let total_length = 1 + body.len(); // message type + body
        if total_length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(total_length));
        }

        dst.reserve(4 + total_length);
        dst.put_u32(total_length as u32);
        dst.put_u8(item.message_type().as_u8());
        dst.put_slice(&body);

        Ok(())
    }
}
