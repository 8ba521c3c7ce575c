//! WebSocket connection handler for the relay
//!
//! Binds each connection to the identity passed as `peer` query parameter,
//! then shuttles frames between the socket and the relay session.

use super::registry::{ConnectionId, Outbound};
use super::session::RelayHandle;
use crate::protocol::PEER_QUERY_PARAM;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Identity carried by a connection request URI, if any
pub(crate) fn identity_from_query(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == PEER_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|identity| !identity.is_empty())
}

fn reject(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Handle a single relay connection until either side closes it
pub(crate) async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn: ConnectionId,
    relay: RelayHandle,
    outbound_queue: usize,
) -> crate::Result<()> {
    let mut identity = None;
    let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
        match identity_from_query(request.uri().query()) {
            Some(peer) => {
                identity = Some(peer);
                Ok(response)
            }
            None => Err(reject("missing peer query parameter")),
        }
    })
    .await?;

    let Some(identity) = identity else {
        return Err(crate::Error::MissingIdentity);
    };
    info!(peer_id = %identity, conn, "Relay connection from {}", addr);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (outbox, mut outbox_rx) = mpsc::channel::<Outbound>(outbound_queue);
    relay.connected(conn, identity.clone(), outbox)?;

    // Task to forward queued frames to the socket
    let mut forward_task = tokio::spawn(async move {
        while let Some(outbound) = outbox_rx.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        error!("Failed to send relay frame: {}", e);
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let frame = CloseFrame {
                        code: CloseCode::Policy,
                        reason: reason.into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(peer_id = %identity, "Non UTF-8 frame, closing connection");
                            break;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!(peer_id = %identity, "Relay connection closed by client");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(peer_id = %identity, "Relay connection error: {}", e);
                        break;
                    }
                };
                if relay.frame(conn, text).is_err() {
                    break;
                }
            }
            _ = &mut forward_task => {
                debug!(peer_id = %identity, "Relay stopped writing to connection");
                break;
            }
        }
    }

    relay.closed(conn);
    forward_task.abort();

    Ok(())
}
