//! WebSocket transport.
//!
//! The upgrade handshake happens once; afterwards every binary message is
//! exactly one encoded frame. Text messages are malformed input, ping/pong
//! are answered by tungstenite and never surface, and a close message ends
//! the frame stream.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument};

use crate::core::frame::Frame;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::{Connection, PeerInfo};

/// Wrap an upgraded WebSocket as a [`Connection`].
pub fn connection<S>(ws: WebSocketStream<S>, peer: PeerInfo) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let sink = sink.sink_map_err(ProtocolError::from).with(|payload: Bytes| {
        future::ready(Ok::<_, ProtocolError>(Message::Binary(payload.to_vec())))
    });

    let frames = stream.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Binary(data)) => Some(Frame::from_bytes(&data)),
            Ok(Message::Text(_)) => Some(Err(ProtocolError::MalformedFrame(
                constants::ERR_TEXT_MESSAGE.to_string(),
            ))),
            Ok(Message::Close(_)) => Some(Err(ProtocolError::ConnectionClosed)),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
            Err(e) => Some(Err(e.into())),
        })
    });

    Connection {
        frames: Box::pin(frames),
        sink: Box::pin(sink),
        peer,
    }
}

/// Run the server side of the upgrade on an accepted stream.
///
/// When `trust_forwarded` is set, proxy headers seen during the upgrade
/// determine the reported client address.
pub async fn accept<S>(io: S, addr: Option<SocketAddr>, trust_forwarded: bool) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut headers = None;
    let ws = tokio_tungstenite::accept_hdr_async(
        io,
        |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            headers = Some(request.headers().clone());
            Ok(response)
        },
    )
    .await?;

    let forwarded_ip = if trust_forwarded {
        headers.as_ref().and_then(forwarded_client_ip)
    } else {
        None
    };

    debug!(peer = ?addr, forwarded = ?forwarded_ip, "WebSocket upgrade complete");
    Ok(connection(ws, PeerInfo { addr, forwarded_ip }))
}

/// Dial a WebSocket server. Bare `host:port` addresses become `ws://host:port/`.
/// `wss://` is refused: the client dials plain WebSocket only.
#[instrument(fields(address = %address))]
pub async fn connect(address: &str) -> Result<Connection> {
    let url = to_ws_url(address)?;
    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;

    let addr = if let MaybeTlsStream::Plain(tcp) = ws.get_ref() {
        tcp.peer_addr().ok()
    } else {
        None
    };

    Ok(connection(ws, PeerInfo {
        addr,
        forwarded_ip: None,
    }))
}

/// Normalize a dial address into a WebSocket URL.
pub fn to_ws_url(address: &str) -> Result<String> {
    if address.starts_with("wss://") {
        return Err(ProtocolError::ConfigError(format!(
            "wss:// is not supported by the client dialer: {address}"
        )));
    }
    if address.starts_with("ws://") {
        Ok(address.to_string())
    } else {
        Ok(format!("ws://{address}/"))
    }
}

/// Client address from `X-Forwarded-For` (first hop) or `X-Real-Ip`, with
/// `X-Real-Port` appended when present.
pub fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    let ip = header_value(headers, "x-forwarded-for")
        .and_then(|list| list.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| header_value(headers, "x-real-ip"))?;

    match header_value(headers, "x-real-port") {
        Some(port) => Some(format!("{ip}:{port}")),
        None => Some(ip.to_string()),
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_to_ws_url() {
        assert_eq!(to_ws_url("127.0.0.1:9000").ok().as_deref(), Some("ws://127.0.0.1:9000/"));
        assert_eq!(to_ws_url("ws://host:1/path").ok().as_deref(), Some("ws://host:1/path"));
    }

    #[tokio::test]
    async fn test_wss_dial_is_refused() {
        assert!(matches!(to_ws_url("wss://host"), Err(ProtocolError::ConfigError(_))));
        assert!(matches!(
            connect("wss://127.0.0.1:1/").await,
            Err(ProtocolError::ConfigError(_))
        ));
    }

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let map = headers(&[("x-forwarded-for", "10.0.0.1, 10.0.0.2")]);
        assert_eq!(forwarded_client_ip(&map).as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_real_ip_with_port() {
        let map = headers(&[("x-real-ip", " 192.168.1.9 "), ("x-real-port", "4431")]);
        assert_eq!(forwarded_client_ip(&map).as_deref(), Some("192.168.1.9:4431"));
    }

    #[test]
    fn test_no_proxy_headers() {
        assert_eq!(forwarded_client_ip(&HeaderMap::new()), None);
    }
}
