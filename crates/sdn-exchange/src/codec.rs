use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::request_response::Codec;
use libp2p::StreamProtocol;

use sdn_core::MAX_EXCHANGE_PAYLOAD;

use crate::message::Envelope;

/// Build the SDS Exchange protocol id for a topic prefix.
pub fn exchange_protocol(prefix: &str) -> StreamProtocol {
    StreamProtocol::try_from_owned(format!("/{prefix}/sds-exchange/1.0.0"))
        .expect("protocol id starts with a slash")
}

/// Build the ID Exchange protocol id (same framing, PNM/EPM only).
pub fn id_exchange_protocol(prefix: &str) -> StreamProtocol {
    StreamProtocol::try_from_owned(format!("/{prefix}/id-exchange/1.0.0"))
        .expect("protocol id starts with a slash")
}

/// Outer frame cap: the 10 MiB payload limit plus headroom for framing and a
/// routing header.
const MAX_WIRE_FRAME: usize = MAX_EXCHANGE_PAYLOAD + 64 * 1024;

/// Length-delimited transport codec for `Envelope`s. One request and one
/// response per stream; the behaviour closes the stream afterwards.
#[derive(Debug, Clone, Default)]
pub struct SdsCodec;

async fn read_frame<T: AsyncRead + Unpin + Send>(io: &mut T) -> std::io::Result<Envelope> {
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_WIRE_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds cap"),
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Envelope::decode(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

async fn write_frame<T: AsyncWrite + Unpin + Send>(
    io: &mut T,
    envelope: Envelope,
) -> std::io::Result<()> {
    let bytes = envelope
        .encode()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    io.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    io.write_all(&bytes).await?;
    Ok(())
}

#[async_trait]
impl Codec for SdsCodec {
    type Protocol = StreamProtocol;
    type Request = Envelope;
    type Response = Envelope;

    async fn read_request<T: AsyncRead + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> std::io::Result<Self::Request> {
        read_frame(io).await
    }

    async fn read_response<T: AsyncRead + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> std::io::Result<Self::Response> {
        read_frame(io).await
    }

    async fn write_request<T: AsyncWrite + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> std::io::Result<()> {
        write_frame(io, req).await
    }

    async fn write_response<T: AsyncWrite + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> std::io::Result<()> {
        write_frame(io, res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ExchangeMessage, MessageType};
    use futures::io::Cursor;

    #[tokio::test]
    async fn frame_round_trip() {
        let envelope = Envelope::plain(ExchangeMessage::new(
            MessageType::RequestData,
            "OMM",
            b"deadbeef".to_vec(),
        ));
        let mut buf = Vec::new();
        write_frame(&mut buf, envelope.clone()).await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn oversized_frame_header_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn protocol_ids_carry_the_prefix() {
        assert_eq!(exchange_protocol("spacedata").as_ref(), "/spacedata/sds-exchange/1.0.0");
        assert_eq!(id_exchange_protocol("spacedata").as_ref(), "/spacedata/id-exchange/1.0.0");
    }
}
