//! Length-prefixed bincode framing shared by the client protocol and the
//! peer replication channel. Each frame is `len (u32 BE) | bincode body`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame. Oversized frames indicate a corrupt or
/// hostile peer and tear the connection down.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the size cap")]
    TooLarge(usize),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for FrameError {
    fn from(e: bincode::Error) -> Self {
        FrameError::Serialization(e.to_string())
    }
}

/// Write one message with its length prefix and flush.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. Returns `Ok(None)` on a clean close, i.e. EOF on a
/// frame boundary; EOF mid-frame is an error.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
        payload: Vec<u8>,
    }

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let sent = Ping {
            seq: 7,
            payload: b"hello".to_vec(),
        };

        write_frame(&mut client, &sent).await.unwrap();
        let received: Ping = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let got: Option<Ping> = read_frame(&mut server).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Length prefix promising 100 bytes, then hang up.
        tokio::io::AsyncWriteExt::write_all(&mut client, &100u32.to_be_bytes())
            .await
            .unwrap();
        drop(client);
        let got: Result<Option<Ping>, _> = read_frame(&mut server).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &(u32::MAX).to_be_bytes())
            .await
            .unwrap();
        let got: Result<Option<Ping>, _> = read_frame(&mut server).await;
        assert!(matches!(got, Err(FrameError::TooLarge(_))));
    }
}
