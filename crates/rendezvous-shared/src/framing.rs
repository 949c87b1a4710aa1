//! Length-prefixed record framing.
//!
//! Every record is a big-endian `u32` length followed by that many bytes of
//! bincode. The same framing carries envelopes on the control stream and the
//! metadata record at the head of a peer-to-peer transfer.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_FRAME_SIZE;
use crate::envelope::Envelope;
use crate::error::ProtocolError;

/// Serialize `value` and write it as one frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(value)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it.
///
/// The payload is consumed in full before decoding, so a decode failure
/// leaves the stream positioned at the next frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, envelope).await
}

pub async fn read_envelope<R>(reader: &mut R) -> Result<Envelope, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    read_frame(reader).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Credentials, EnvelopeKind};

    #[tokio::test]
    async fn test_envelopes_arrive_in_order() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let creds = Credentials::new("alice", "pw1");
        write_envelope(&mut client, &Envelope::register(&creds)).await.unwrap();
        write_envelope(&mut client, &Envelope::login(&creds)).await.unwrap();

        let first = read_envelope(&mut server).await.unwrap();
        let second = read_envelope(&mut server).await.unwrap();
        assert_eq!(first.kind(), EnvelopeKind::Register);
        assert_eq!(second.kind(), EnvelopeKind::Login);
        assert_eq!(second.credentials().unwrap(), creds);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();

        let err = read_envelope(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_garbage_payload_is_not_fatal() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_u32(3).await.unwrap();
        client.write_all(&[0xff, 0xff, 0xff]).await.unwrap();
        write_envelope(&mut client, &Envelope::logout("alice")).await.unwrap();

        let err = read_envelope(&mut server).await.unwrap_err();
        assert!(!err.is_fatal());

        // The next frame is still readable.
        let next = read_envelope(&mut server).await.unwrap();
        assert_eq!(next.kind(), EnvelopeKind::Logout);
    }

    #[tokio::test]
    async fn test_closed_stream_is_fatal() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_envelope(&mut server).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
