//! TCP transport with length-prefixed framing.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::transport::{Acceptor, FrameSink, FrameStream, FramedPair, Transport, TransportError};

/// Frames messages over TCP with a four byte big-endian length prefix.
///
/// Addresses take the form `tcp://host:port`. Nagle's algorithm is disabled
/// on every connection; bus traffic is latency sensitive and messages are
/// already batched into frames.
pub struct TcpTransport;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::new()
}

fn framed(stream: TcpStream) -> FramedPair {
    let (read, write) = stream.into_split();
    FramedPair {
        sink: Box::new(TcpFrameSink(FramedWrite::new(write, codec()))),
        stream: Box::new(TcpFrameStream(FramedRead::new(read, codec()))),
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    async fn dial(&self, rest: &str) -> Result<FramedPair, TransportError> {
        if !rest.contains(':') {
            return Err(TransportError::BadAddress(rest.to_string()));
        }
        let stream = TcpStream::connect(rest).await?;
        stream.set_nodelay(true)?;
        Ok(framed(stream))
    }

    async fn bind(&self, rest: &str) -> Result<Box<dyn Acceptor>, TransportError> {
        if !rest.contains(':') {
            return Err(TransportError::BadAddress(rest.to_string()));
        }
        let listener = TcpListener::bind(rest).await?;
        Ok(Box::new(TcpAcceptor(listener)))
    }
}

struct TcpAcceptor(TcpListener);

#[async_trait::async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<FramedPair, TransportError> {
        let (stream, peer) = self.0.accept().await?;
        tracing::trace!(%peer, "accepted connection");
        stream.set_nodelay(true)?;
        Ok(framed(stream))
    }
}

struct TcpFrameSink(FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>);

#[async_trait::async_trait]
impl FrameSink for TcpFrameSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.0.send(frame).await?;
        Ok(())
    }
}

struct TcpFrameStream(FramedRead<OwnedReadHalf, LengthDelimitedCodec>);

#[async_trait::async_trait]
impl FrameStream for TcpFrameStream {
    async fn recv(&mut self) -> Result<Option<BytesMut>, TransportError> {
        match self.0.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}
