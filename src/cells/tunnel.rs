//! TCP tunnels between nuclei
//!
//! A tunnel is an ordinary cell backed by one TCP stream. Both sides open the
//! conversation by writing their domain identity, then read the peer's; only
//! after that handshake does the tunnel register and install a domain route,
//! so a connection that dies early leaves no trace in the kernel. Sends are
//! best-effort: a frame that cannot be written is logged and dropped. Any
//! receive-side failure is fatal for the tunnel: it kills its own cell, and
//! the kill path closes the stream; the kernel retracts the route the moment
//! the cell is killed.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::envelope::Envelope;
use super::nucleus::{Cell, Nucleus};
use super::routing::Route;
use super::{Result, RoutingError};

/// Frames larger than this are treated as stream corruption.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct DomainInfo {
    domain: String,
}

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Hello(DomainInfo),
    Envelope(Envelope),
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &Frame) -> Result<()> {
    let bytes = rmp_serde::to_vec(frame).map_err(|e| RoutingError::Codec(e.to_string()))?;
    if bytes.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(RoutingError::Codec(format!(
            "frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    Ok(())
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Frame> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(RoutingError::Codec(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes).await?;
    rmp_serde::from_slice(&bytes).map_err(|e| RoutingError::Codec(e.to_string()))
}

/// Both-write-then-read identity exchange.
async fn handshake(
    nucleus: &Nucleus,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    timeout: Duration,
) -> Result<String> {
    let hello = Frame::Hello(DomainInfo {
        domain: nucleus.domain().to_string(),
    });
    let exchange = async {
        write_frame(writer, &hello).await?;
        match read_frame(reader).await? {
            Frame::Hello(info) => Ok(info.domain),
            Frame::Envelope(_) => Err(RoutingError::Handshake(
                "peer sent an envelope before its identity".into(),
            )),
        }
    };
    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(RoutingError::Handshake(format!(
            "no identity from peer within {timeout:?}"
        ))),
    }
}

struct Tunnel {
    writer: OwnedWriteHalf,
    peer_domain: String,
}

#[async_trait]
impl Cell for Tunnel {
    async fn message_arrived(&mut self, _nucleus: &Nucleus, envelope: Envelope) {
        // Best-effort: a message that cannot be framed or written is dropped.
        // A dead socket surfaces on the receive loop, which tears down the
        // tunnel; one bad message must not take the link with it.
        let uoid = envelope.uoid;
        if let Err(err) = write_frame(&mut self.writer, &Frame::Envelope(envelope)).await {
            warn!(peer = %self.peer_domain, %uoid, %err, "tunnel write failed, message dropped");
        }
    }

    async fn prepare_removal(&mut self, _nucleus: &Nucleus) {
        // The kernel already retracted the domain route when it killed this
        // cell; all that is left is to close the stream.
        let _ = self.writer.shutdown().await;
        info!(peer = %self.peer_domain, "tunnel closed");
    }
}

fn tunnel_cell_name(peer_domain: &str) -> String {
    format!("tunnel-{peer_domain}")
}

/// Register the tunnel cell, install the peer-domain route and start pumping
/// inbound frames. Runs only after a successful handshake.
fn install(
    nucleus: &Nucleus,
    mut reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    peer_domain: String,
) -> Result<String> {
    let name = tunnel_cell_name(&peer_domain);
    let route = Route::Domain {
        domain: peer_domain.clone(),
        target: name.clone(),
    };
    nucleus.register(
        name.clone(),
        Tunnel {
            writer,
            peer_domain: peer_domain.clone(),
        },
    )?;
    if let Err(err) = nucleus.route_add(route) {
        let _ = nucleus.kill(&name);
        return Err(err);
    }
    info!(peer = %peer_domain, cell = %name, "tunnel established");

    let pump_nucleus = nucleus.clone();
    let pump_name = name.clone();
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Frame::Envelope(envelope)) => {
                    if let Err(err) = pump_nucleus.send(envelope) {
                        warn!(peer = %peer_domain, %err, "undeliverable tunneled message");
                    }
                }
                Ok(Frame::Hello(_)) => {
                    warn!(peer = %peer_domain, "unexpected identity frame, closing tunnel");
                    break;
                }
                Err(err) => {
                    debug!(peer = %peer_domain, %err, "tunnel receive ended");
                    break;
                }
            }
        }
        let _ = pump_nucleus.kill(&pump_name);
    });

    Ok(name)
}

/// Dial a peer nucleus and establish a tunnel. Returns the tunnel cell name.
pub async fn connect(nucleus: &Nucleus, addr: &str, timeout: Duration) -> Result<String> {
    let stream = TcpStream::connect(addr).await?;
    establish(nucleus, stream, timeout).await
}

/// Take an accepted connection through the handshake and install the tunnel.
pub async fn establish(nucleus: &Nucleus, stream: TcpStream, timeout: Duration) -> Result<String> {
    let (mut reader, mut writer) = stream.into_split();
    let peer_domain = handshake(nucleus, &mut reader, &mut writer, timeout).await?;
    install(nucleus, reader, writer, peer_domain)
}

/// Accept loop: every inbound connection becomes a tunnel. Handshake
/// failures are logged and the connection dropped; nothing is registered.
pub fn spawn_listener(nucleus: Nucleus, listener: TcpListener, timeout: Duration) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let nucleus = nucleus.clone();
                    tokio::spawn(async move {
                        if let Err(err) = establish(&nucleus, stream, timeout).await {
                            warn!(%peer, %err, "inbound tunnel rejected");
                        }
                    });
                }
                Err(err) => {
                    warn!(%err, "tunnel accept failed");
                    break;
                }
            }
        }
    });
}
