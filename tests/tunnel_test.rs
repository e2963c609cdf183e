//! Cross-domain messaging over real TCP tunnels.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;

use gridspace::cells::{tunnel, Cell, CellAddress, CellPath, Envelope, Nucleus, RoutingError};
use gridspace::messages::{Message, PoolMessage};

struct Echo;

#[async_trait]
impl Cell for Echo {
    async fn message_arrived(&mut self, nucleus: &Nucleus, envelope: Envelope) {
        if matches!(envelope.payload, Message::Ping) {
            let _ = nucleus.send(envelope.into_reply(Message::Pong));
        }
    }
}

const HANDSHAKE: Duration = Duration::from_secs(5);

async fn linked_pair() -> (Nucleus, Nucleus) {
    let alpha = Nucleus::new("alpha");
    let beta = Nucleus::new("beta");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tunnel::spawn_listener(alpha.clone(), listener, HANDSHAKE);
    tunnel::connect(&beta, &addr.to_string(), HANDSHAKE)
        .await
        .unwrap();
    // Give the acceptor a moment to finish its side of the handshake.
    tokio::time::sleep(Duration::from_millis(100)).await;
    (alpha, beta)
}

#[tokio::test]
async fn request_reply_across_domains() {
    let (alpha, beta) = linked_pair().await;
    alpha.register("echo", Echo).unwrap();

    let envelope = Envelope::new(
        CellAddress::new("caller", "beta"),
        CellPath::parse("echo@alpha"),
        Message::Ping,
    );
    let reply = beta
        .send_and_wait(envelope, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(reply.payload, Message::Pong));
}

#[tokio::test]
async fn both_sides_install_a_domain_route() {
    let (alpha, beta) = linked_pair().await;
    assert!(alpha.cell_names().contains(&"tunnel-beta".to_string()));
    assert!(beta.cell_names().contains(&"tunnel-alpha".to_string()));
    assert_eq!(alpha.routes().len(), 1);
    assert_eq!(beta.routes().len(), 1);
}

#[tokio::test]
async fn failed_handshake_leaves_no_trace() {
    // A listener that accepts and immediately hangs up, before any identity
    // exchange completes.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            drop(stream);
        }
    });

    let nucleus = Nucleus::new("beta");
    let result = tunnel::connect(&nucleus, &addr.to_string(), HANDSHAKE).await;
    assert!(result.is_err());
    assert!(nucleus.cell_names().is_empty());
    assert!(nucleus.routes().is_empty());

    let envelope = Envelope::new(
        CellAddress::new("caller", "beta"),
        CellPath::parse("echo@alpha"),
        Message::Ping,
    );
    assert!(nucleus.send(envelope).is_err());
}

#[tokio::test]
async fn killed_tunnel_retracts_its_route() {
    let (alpha, beta) = linked_pair().await;
    let _ = alpha;

    // The route must be gone the moment kill returns, before the mailbox
    // drains, so routed senders fail over to no-route immediately.
    beta.kill("tunnel-alpha").unwrap();
    assert!(beta.routes().is_empty());
    assert!(!beta.cell_names().contains(&"tunnel-alpha".to_string()));

    let envelope = Envelope::new(
        CellAddress::new("caller", "beta"),
        CellPath::parse("echo@alpha"),
        Message::Ping,
    );
    assert!(matches!(
        beta.send(envelope),
        Err(RoutingError::NoRoute(_))
    ));
}

#[tokio::test]
async fn oversized_message_is_dropped_not_the_tunnel() {
    let (alpha, beta) = linked_pair().await;
    alpha.register("echo", Echo).unwrap();

    // Well past the 16 MiB frame limit; the tunnel must drop it and live on.
    let huge = Message::Pool(PoolMessage::FileFlushed {
        content_id: "x".repeat(17 * 1024 * 1024),
    });
    let envelope = Envelope::new(
        CellAddress::new("caller", "beta"),
        CellPath::parse("sink@alpha"),
        huge,
    );
    beta.send(envelope).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(beta.cell_names().contains(&"tunnel-alpha".to_string()));
    assert_eq!(beta.routes().len(), 1);

    let ping = Envelope::new(
        CellAddress::new("caller", "beta"),
        CellPath::parse("echo@alpha"),
        Message::Ping,
    );
    let reply = beta
        .send_and_wait(ping, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(reply.payload, Message::Pong));
}

#[tokio::test]
async fn peer_disconnect_tears_the_tunnel_down() {
    let (alpha, beta) = linked_pair().await;

    // Alpha drops its end; beta's receive loop must notice and clean up.
    alpha.kill("tunnel-beta").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(beta.routes().is_empty());
    assert!(!beta.cell_names().contains(&"tunnel-alpha".to_string()));
}
