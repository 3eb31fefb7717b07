//! WebSocket surface of the message bus.
//!
//! Each skill and collaborator process holds one persistent duplex
//! connection. Inbound frames are parsed as wire messages and published into
//! the in-process broker; everything published on the broker is fanned back
//! out to every connection. Ordering is promised per publisher only.
//!
//! When a connection drops, a `skill.disconnected` message is published for
//! the skill id the connection last identified itself with, so the registry
//! and session manager can react (force-ending any session it owned).

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::client::BusClient;
use crate::bus::message::Message;
use crate::contract::topics;
use crate::error::{Result, SkaldError};

/// Accept loop for the bus endpoint. Runs until `cancel` fires.
pub async fn serve(bus: BusClient, addr: &str, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "bus endpoint listening");
    serve_with_listener(bus, listener, cancel).await
}

/// Accept loop over an already-bound listener (lets callers bind port 0).
pub async fn serve_with_listener(
    bus: BusClient,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "bus connection accepted");
                let bus = bus.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(bus, stream, cancel).await {
                        debug!(%peer, error = %e, "bus connection closed");
                    }
                });
            }
            () = cancel.cancelled() => {
                info!("bus endpoint shutting down");
                return Ok(());
            }
        }
    }
}

/// Serve one client connection until it closes or the server shuts down.
async fn handle_connection(
    bus: BusClient,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| SkaldError::Bus(format!("websocket handshake: {e}")))?;
    let (mut write, mut read) = ws.split();

    // Everything on the broker goes back out to this client. The client is
    // expected to filter by type; the bus does not track per-client
    // subscription sets.
    let mut outbound = bus.subscribe("*");

    // Skill id this connection last identified itself with, for the
    // disconnect notification.
    let mut connected_skill: Option<String> = None;

    let disconnect_reason = loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        match Message::from_wire(&text) {
                            Ok(message) => {
                                if let Some(skill_id) = identifying_skill(&message) {
                                    connected_skill = Some(skill_id.to_owned());
                                }
                                bus.publish(&message);
                            }
                            Err(e) => {
                                warn!(error = %e, "dropping unparseable bus frame");
                            }
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        break "closed by peer";
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "bus read error");
                        break "read error";
                    }
                    // Binary, Ping/Pong frames handled by tungstenite.
                    _ => {}
                }
            }
            delivery = outbound.recv() => {
                let Some(message) = delivery else { break "broker gone" };
                let raw = message.to_wire()?;
                if let Err(e) = write.send(tungstenite::Message::Text(raw)).await {
                    debug!(error = %e, "bus write error");
                    break "write error";
                }
            }
            () = cancel.cancelled() => {
                let _ = write.send(tungstenite::Message::Close(None)).await;
                break "server shutdown";
            }
        }
    };

    if let Some(skill_id) = connected_skill {
        debug!(%skill_id, reason = disconnect_reason, "skill connection dropped");
        let notice = Message::with_data(
            topics::SKILL_DISCONNECTED,
            json!({ "skill_id": skill_id, "reason": disconnect_reason }),
        )?;
        bus.publish(&notice);
    }
    Ok(())
}

/// Extract the skill id a message identifies its sender as, if any.
///
/// Registration and heartbeat traffic names the skill in its payload; other
/// traffic carries it in the context envelope.
fn identifying_skill(message: &Message) -> Option<&str> {
    match message.msg_type.as_str() {
        topics::SKILL_REGISTER | topics::SKILL_HEARTBEAT => message.data_str("skill_id"),
        _ => message.context.skill_id.as_deref(),
    }
}
