//! ZMQ bridge to the device broker.
//!
//! The bridge republishes broker traffic as two-frame `[topic, payload]`
//! messages on a PUB socket we SUB-connect to, and forwards whatever we
//! publish in the same shape back to the broker.
//!
//! Both sockets use the same options: LINGER 0 so shutdown never blocks,
//! RECONNECT_IVL 1s, RECONNECT_IVL_MAX 60s.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use tmq::{publish, subscribe, Context as ZmqContext, Multipart};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::publisher::Publisher;
use crate::router::TransportRouter;

pub const RECONNECT_IVL_MS: i32 = 1000;
pub const RECONNECT_IVL_MAX_MS: i32 = 60_000;

type Inbound = Box<dyn Stream<Item = Result<Multipart, tmq::TmqError>> + Unpin + Send>;

/// Inbound half: a SUB socket receiving every topic the bridge forwards.
pub struct BrokerSubscriber {
    #[allow(dead_code)]
    context: ZmqContext,
    sub: Inbound,
    endpoint: String,
}

impl BrokerSubscriber {
    pub fn connect(endpoint: &str) -> Result<Self> {
        let context = ZmqContext::new();
        // One empty-prefix subscription; the router ignores what it does not
        // route.
        let sub = subscribe(&context)
            .set_linger(0)
            .set_reconnect_ivl(RECONNECT_IVL_MS)
            .set_reconnect_ivl_max(RECONNECT_IVL_MAX_MS)
            .connect(endpoint)
            .with_context(|| format!("Failed to connect broker SUB socket to {endpoint}"))?
            .subscribe(b"")
            .context("Failed to subscribe broker SUB socket")?;

        info!(endpoint, "Connected to broker events");
        Ok(Self {
            context,
            sub: Box::new(sub),
            endpoint: endpoint.to_string(),
        })
    }

    /// Feed every message to `router` until shutdown or the socket closes.
    pub async fn run(mut self, router: TransportRouter, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                msg = self.sub.next() => match msg {
                    Some(Ok(multipart)) => dispatch_multipart(&router, multipart),
                    Some(Err(e)) => warn!(endpoint = %self.endpoint, error = %e, "Broker receive failed"),
                    None => {
                        error!(endpoint = %self.endpoint, "Broker event stream ended");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Broker subscriber shutting down");
                    break;
                }
            }
        }
    }
}

fn dispatch_multipart(router: &TransportRouter, multipart: Multipart) {
    let frames: Vec<Vec<u8>> = multipart.into_iter().map(|m| m.to_vec()).collect();
    match split_frames(frames) {
        Some((topic, payload)) => router.handle_message(&topic, &payload),
        None => debug!("Dropping message without topic and payload frames"),
    }
}

/// `[topic, payload]`; extra frames are ignored.
fn split_frames(frames: Vec<Vec<u8>>) -> Option<(String, Vec<u8>)> {
    let mut frames = frames.into_iter();
    let topic = frames.next()?;
    let payload = frames.next()?;
    Some((String::from_utf8_lossy(&topic).into_owned(), payload))
}

/// Outbound half: a PUB socket the bridge forwards to the broker.
pub struct ZmqPublisher {
    #[allow(dead_code)]
    context: ZmqContext,
    socket: Mutex<publish::Publish>,
}

impl ZmqPublisher {
    pub fn connect(endpoint: &str) -> Result<Self> {
        let context = ZmqContext::new();
        let socket = publish(&context)
            .set_linger(0)
            .set_reconnect_ivl(RECONNECT_IVL_MS)
            .set_reconnect_ivl_max(RECONNECT_IVL_MAX_MS)
            .connect(endpoint)
            .with_context(|| format!("Failed to connect broker PUB socket to {endpoint}"))?;

        info!(endpoint, "Connected to broker commands");
        Ok(Self {
            context,
            socket: Mutex::new(socket),
        })
    }
}

#[async_trait]
impl Publisher for ZmqPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let multipart = Multipart::from(vec![topic.as_bytes().to_vec(), payload]);
        let mut socket = self.socket.lock().await;
        socket
            .send(multipart)
            .await
            .with_context(|| format!("Failed to publish to {topic}"))
    }
}
