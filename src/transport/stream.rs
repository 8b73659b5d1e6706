//! Byte-stream transport: frames are delimited by the frame codec itself.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::instrument;

use crate::core::codec::FrameCodec;
use crate::error::Result;
use crate::transport::{Connection, PeerInfo};

/// Split any duplex byte stream into a [`Connection`].
pub fn connection<IO>(io: IO, peer: PeerInfo) -> Connection
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let frames = FramedRead::new(read_half, FrameCodec);
    let sink = FramedWrite::new(write_half, FrameCodec);

    Connection {
        frames: Box::pin(frames),
        sink: Box::pin(sink),
        peer,
    }
}

/// Dial a raw TCP peer.
#[instrument(fields(address = %address))]
pub async fn connect(address: &str) -> Result<Connection> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    let peer = PeerInfo {
        addr: stream.peer_addr().ok(),
        forwarded_ip: None,
    };
    Ok(connection(stream, peer))
}
