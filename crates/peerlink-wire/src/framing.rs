//! Length-prefixed message framing for peer protocols.
//!
//! Wire format: `[u16 little-endian length][payload]`. The payload format is
//! up to the message type; this layer never looks inside it.

use crate::error::FramingError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload a frame can carry.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// A value that can be put on the wire by [`write_msg`] and filled in by
/// [`read_msg`].
pub trait Message: Send {
    fn marshal(&self) -> Result<Vec<u8>, FramingError>;

    /// Replace `self` with the value decoded from `bytes`.
    fn unmarshal(&mut self, bytes: &[u8]) -> Result<(), FramingError>;
}

/// JSON-encoded [`Message`] wrapper.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> std::ops::Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> Message for Json<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    fn marshal(&self) -> Result<Vec<u8>, FramingError> {
        serde_json::to_vec(&self.0).map_err(|e| FramingError::Marshal(e.to_string()))
    }

    fn unmarshal(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        self.0 = serde_json::from_slice(bytes).map_err(|e| FramingError::Unmarshal(e.to_string()))?;
        Ok(())
    }
}

/// Raw bytes, passed through untouched.
impl Message for Vec<u8> {
    fn marshal(&self) -> Result<Vec<u8>, FramingError> {
        Ok(self.clone())
    }

    fn unmarshal(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        self.clear();
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Marshal `msg` and write it as one frame.
///
/// Payloads over [`MAX_FRAME_SIZE`] are refused before anything is written.
pub async fn write_msg<W, M>(writer: &mut W, msg: &M) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
    M: Message + ?Sized,
{
    let payload = msg.marshal()?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FramingError::MessageTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame and unmarshal it into `msg`.
///
/// Short reads are retried until the declared length is satisfied. If the
/// stream ends first the read fails and `msg` is left untouched.
pub async fn read_msg<R, M>(reader: &mut R, msg: &mut M) -> Result<(), FramingError>
where
    R: AsyncRead + Unpin,
    M: Message + ?Sized,
{
    let mut header = [0u8; 2];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FramingError::ConnectionClosed);
        }
        Err(e) => return Err(FramingError::Io(e)),
    }

    let len = u16::from_le_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FramingError::Truncated { expected: len });
        }
        Err(e) => return Err(FramingError::Io(e)),
    }
    msg.unmarshal(&payload)
}
