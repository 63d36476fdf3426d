//! Stream handshake messages for the TCP peer host.
//!
//! Every peer stream is its own TCP connection. The opener sends a
//! [`StreamHeader`] naming itself and the protocol it wants; the acceptor
//! answers with a [`StreamAck`]. Both are JSON, prefixed with a 4-byte
//! big-endian length. After the ack the connection carries raw protocol bytes.

use crate::error::HostError;
use peerlink_types::PeerId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current stream handshake version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of a handshake frame (64 KB).
pub const MAX_HEADER_SIZE: u32 = 64 * 1024;

/// Sent by the side opening a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHeader {
    /// Unique handshake ID.
    pub id: String,
    /// The opener's node ID.
    pub node_id: PeerId,
    /// Addresses the opener accepts streams on.
    #[serde(default)]
    pub listen_addrs: Vec<SocketAddr>,
    /// Requested protocol, e.g. `/peerlink/rpc/1.0.0`.
    pub protocol: String,
    pub protocol_version: u32,
    /// Random nonce for HMAC authentication.
    #[serde(default)]
    pub nonce: String,
    /// HMAC-SHA256(shared_secret, nonce + node_id). Empty when unauthenticated.
    #[serde(default)]
    pub auth_hmac: String,
}

/// Reply to a [`StreamHeader`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamAck {
    #[serde(rename = "accepted")]
    Accepted {
        node_id: PeerId,
        #[serde(default)]
        listen_addrs: Vec<SocketAddr>,
        protocol_version: u32,
        #[serde(default)]
        nonce: String,
        #[serde(default)]
        auth_hmac: String,
    },
    #[serde(rename = "rejected")]
    Rejected { code: RejectCode, message: String },
}

/// Why a stream was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    /// No handler registered for the protocol.
    UnknownProtocol,
    /// HMAC did not verify.
    Unauthorized,
    VersionMismatch,
}

impl StreamAck {
    /// Turn a rejection into the matching host error.
    pub fn into_error(code: RejectCode, message: String, protocol: &str) -> HostError {
        match code {
            RejectCode::UnknownProtocol => HostError::ProtocolNotSupported(protocol.to_string()),
            RejectCode::Unauthorized => HostError::AuthFailed(message),
            RejectCode::VersionMismatch => HostError::HandshakeFailed(message),
        }
    }
}

/// Encode a frame (4-byte big-endian length + JSON).
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Write one handshake frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), HostError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_frame(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one handshake frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, HostError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(HostError::ConnectionClosed);
        }
        Err(e) => return Err(HostError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_HEADER_SIZE {
        return Err(HostError::HeaderTooLarge {
            size: len,
            max: MAX_HEADER_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> StreamHeader {
        StreamHeader {
            id: "hs-1".to_string(),
            node_id: PeerId::new("node-a"),
            listen_addrs: vec!["127.0.0.1:7401".parse().unwrap()],
            protocol: "/peerlink/rpc/1.0.0".to_string(),
            protocol_version: PROTOCOL_VERSION,
            nonce: "n".to_string(),
            auth_hmac: String::new(),
        }
    }

    #[test]
    fn test_encode_length_prefix() {
        let bytes = encode_frame(&header()).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
    }

    #[test]
    fn test_ack_serialization() {
        let ack = StreamAck::Rejected {
            code: RejectCode::UnknownProtocol,
            message: "no handler".to_string(),
        };
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains("\"type\":\"rejected\""));
        assert!(json.contains("unknown_protocol"));
        match serde_json::from_str::<StreamAck>(&json).unwrap() {
            StreamAck::Rejected { code, .. } => assert_eq!(code, RejectCode::UnknownProtocol),
            other => panic!("Expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frame_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &header()).await.unwrap();
        let decoded: StreamHeader = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded.node_id.as_str(), "node-a");
        assert_eq!(decoded.protocol, "/peerlink/rpc/1.0.0");
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&(MAX_HEADER_SIZE + 1).to_be_bytes())
            .build();
        let err = read_frame::<_, StreamHeader>(&mut reader).await.unwrap_err();
        assert!(matches!(err, HostError::HeaderTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let mut reader = tokio_test::io::Builder::new().build();
        let err = read_frame::<_, StreamHeader>(&mut reader).await.unwrap_err();
        assert!(matches!(err, HostError::ConnectionClosed));
    }
}
