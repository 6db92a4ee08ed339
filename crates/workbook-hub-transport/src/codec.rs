//! Newline-delimited JSON framing.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};

use crate::protocol::WireMessage;

/// Codec error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame exceeds {0} bytes")]
    FrameTooLong(usize),
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl CodecError {
    /// Whether the peer broke the protocol (as opposed to the transport
    /// failing underneath it).
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::FrameTooLong(_) | Self::Malformed(_))
    }
}

/// One JSON [`WireMessage`] per line.
#[derive(Debug, Clone)]
pub struct WireCodec {
    lines: LinesCodec,
    max_frame_bytes: usize,
}

impl WireCodec {
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame_bytes),
            max_frame_bytes,
        }
    }

    fn convert(&self, err: LinesCodecError) -> CodecError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => CodecError::FrameTooLong(self.max_frame_bytes),
            LinesCodecError::Io(e) => CodecError::Io(e),
        }
    }

    fn parse(line: Option<String>) -> Result<Option<WireMessage>, CodecError> {
        line.map(|line| serde_json::from_str(&line).map_err(CodecError::from))
            .transpose()
    }
}

impl Decoder for WireCodec {
    type Item = WireMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireMessage>, CodecError> {
        loop {
            let line = self.lines.decode(src).map_err(|e| self.convert(e))?;
            match line {
                Some(line) if line.trim().is_empty() => {}
                other => return Self::parse(other),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<WireMessage>, CodecError> {
        loop {
            let line = self.lines.decode_eof(src).map_err(|e| self.convert(e))?;
            match line {
                Some(line) if line.trim().is_empty() => {}
                other => return Self::parse(other),
            }
        }
    }
}

impl Encoder<WireMessage> for WireCodec {
    type Error = CodecError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let json = serde_json::to_string(&item)?;
        if json.len() > self.max_frame_bytes {
            return Err(CodecError::FrameTooLong(self.max_frame_bytes));
        }
        self.lines.encode(json, dst).map_err(|e| self.convert(e))
    }
}

/// Frame a byte stream with [`WireCodec`].
pub fn framed<T>(io: T, max_frame_bytes: usize) -> Framed<T, WireCodec>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, WireCodec::new(max_frame_bytes))
}

/// Decode a single message carried in its own frame (e.g. a WebSocket
/// text message).
///
/// # Errors
/// Returns error if the frame is too long or not a valid message.
pub fn decode_message(frame: &[u8], max_frame_bytes: usize) -> Result<WireMessage, CodecError> {
    if frame.len() > max_frame_bytes {
        return Err(CodecError::FrameTooLong(max_frame_bytes));
    }
    Ok(serde_json::from_slice(frame)?)
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use workbook_hub_core::Role;

    use super::*;

    #[tokio::test]
    async fn test_reads_messages_across_partial_writes() {
        let io = tokio_test::io::Builder::new()
            .read(br#"{"type":"heart"#)
            .read(b"beat\"}\n\n")
            .read(br#"{"type":"close","reason":"done"}"#)
            .read(b"\n")
            .build();
        let mut framed = framed(io, 1024);

        assert_eq!(framed.next().await.unwrap().unwrap(), WireMessage::Heartbeat);
        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            WireMessage::Close {
                reason: "done".into()
            }
        );
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_writes_one_line_per_message() {
        let io = tokio_test::io::Builder::new()
            .write(b"{\"type\":\"heartbeat\"}\n")
            .write(b"{\"type\":\"detach\"}\n")
            .build();
        let mut framed = framed(io, 1024);

        framed.send(WireMessage::Heartbeat).await.unwrap();
        framed.send(WireMessage::Detach).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_line_is_a_protocol_violation() {
        let io = tokio_test::io::Builder::new().read(b"{not json}\n").build();
        let mut framed = framed(io, 1024);

        let err = framed.next().await.unwrap().unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let long = format!("{{\"type\":\"close\",\"reason\":\"{}\"}}\n", "x".repeat(200));
        let io = tokio_test::io::Builder::new().read(long.as_bytes()).build();
        let mut framed = framed(io, 64);

        let err = framed.next().await.unwrap().unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLong(64)));
    }

    #[test]
    fn test_encoder_refuses_oversized_messages() {
        let mut codec = WireCodec::new(64);
        let mut buf = BytesMut::new();
        let msg = WireMessage::handshake("s".repeat(100), Role::Client, None);
        assert!(matches!(
            codec.encode(msg, &mut buf),
            Err(CodecError::FrameTooLong(64))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_single_frame() {
        let msg = decode_message(br#"{"type":"attach"}"#, 1024).unwrap();
        assert_eq!(msg, WireMessage::Attach);
        assert!(decode_message(b"[]", 1024).is_err());
    }
}
