// length-prefixed frames on the rpc channel: a u32 big-endian byte count
// followed by a json body.

use mlworker_core::ReplyEnvelope;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::{RequestError, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    // a frame above the receive limit; its body was read and discarded
    Oversized(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_receive: usize,
    max_send: usize,
}

impl FrameCodec {
    pub fn new(max_receive: usize, max_send: usize) -> Self {
        Self {
            max_receive,
            max_send,
        }
    }

    pub fn max_receive(&self) -> usize {
        self.max_receive
    }

    pub fn max_send(&self) -> usize {
        self.max_send
    }

    // next frame, or `None` when the peer closed the stream between frames
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Frame>, TransportError>
    where
        R: AsyncRead + Unpin,
    {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if len > self.max_receive {
            // drain so the stream stays aligned on frame boundaries
            let drained = tokio::io::copy(&mut (&mut *reader).take(len as u64), &mut tokio::io::sink()).await?;
            if drained < len as u64 {
                return Err(TransportError::Closed);
            }
            return Ok(Some(Frame::Oversized(len)));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        Ok(Some(Frame::Data(body)))
    }

    pub async fn write_frame<W>(&self, writer: &mut W, body: &[u8]) -> Result<(), TransportError>
    where
        W: AsyncWrite + Unpin,
    {
        if body.len() > self.max_send || body.len() > u32::MAX as usize {
            return Err(TransportError::FrameTooLarge {
                size: body.len(),
                limit: self.max_send,
            });
        }
        writer.write_u32(body.len() as u32).await?;
        writer.write_all(body).await?;
        writer.flush().await?;
        Ok(())
    }

    // encodes a reply; one above the send limit is replaced by an error reply
    // for the same request
    pub fn encode_reply(&self, reply: &ReplyEnvelope) -> Result<Vec<u8>, TransportError> {
        let body = serde_json::to_vec(reply)?;
        if body.len() <= self.max_send {
            return Ok(body);
        }
        warn!(id = %reply.id, size = body.len(), limit = self.max_send, "reply too large, sending an error instead");
        let err = RequestError::PayloadTooLarge {
            size: body.len(),
            limit: self.max_send,
        };
        Ok(serde_json::to_vec(&ReplyEnvelope::error(
            reply.id.clone(),
            reply.action.clone(),
            err.detail(),
        ))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlworker_core::ErrorDetail;
    use serde_json::json;

    #[tokio::test]
    async fn frames_round_trip_over_a_stream() {
        let codec = FrameCodec::new(1024, 1024);
        let (mut client, mut server) = tokio::io::duplex(4096);

        codec.write_frame(&mut client, b"{\"a\":1}").await.expect("write");
        codec.write_frame(&mut client, b"").await.expect("write");
        drop(client);

        assert_eq!(
            codec.read_frame(&mut server).await.expect("read"),
            Some(Frame::Data(b"{\"a\":1}".to_vec()))
        );
        assert_eq!(codec.read_frame(&mut server).await.expect("read"), Some(Frame::Data(Vec::new())));
        assert_eq!(codec.read_frame(&mut server).await.expect("read"), None);
    }

    #[tokio::test]
    async fn oversized_frames_are_skipped() {
        let sender = FrameCodec::new(1024, 1024);
        let receiver = FrameCodec::new(4, 1024);
        let (mut client, mut server) = tokio::io::duplex(4096);

        sender.write_frame(&mut client, b"0123456789").await.expect("write");
        sender.write_frame(&mut client, b"ok").await.expect("write");
        drop(client);

        assert_eq!(receiver.read_frame(&mut server).await.expect("read"), Some(Frame::Oversized(10)));
        assert_eq!(
            receiver.read_frame(&mut server).await.expect("read"),
            Some(Frame::Data(b"ok".to_vec()))
        );
    }

    #[tokio::test]
    async fn truncated_frames_are_errors() {
        let codec = FrameCodec::new(1024, 1024);
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(10).await.expect("len");
        client.write_all(b"abc").await.expect("body");
        drop(client);
        assert!(codec.read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn send_limit_is_enforced() {
        let codec = FrameCodec::new(1024, 4);
        let (mut client, _server) = tokio::io::duplex(64);
        let err = codec.write_frame(&mut client, b"too long").await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size: 8, limit: 4 }));
    }

    #[test]
    fn large_replies_become_errors() {
        let reply = ReplyEnvelope {
            id: "7".into(),
            action: "echo".into(),
            version: 1,
            is_error: false,
            payload: Some(json!({"msg": "x".repeat(500)})),
            error: None,
        };
        let codec = FrameCodec::new(1024, 200);
        let body = codec.encode_reply(&reply).expect("encode");
        let decoded: ReplyEnvelope = serde_json::from_slice(&body).expect("decode");
        assert!(decoded.is_error);
        assert_eq!(decoded.id, "7");
        let error: ErrorDetail = decoded.error.expect("error");
        assert_eq!(error.code, "payload_too_large");
    }
}
