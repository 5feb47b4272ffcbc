//! Inbound topic routing.
//!
//! [`TransportRouter::handle_message`] is called by the transport for every
//! `[topic, payload]` it receives. It never waits on slow work: remote-chat
//! requests go to a per-device mailbox, everything else to the service pool
//! or the speech service.
//!
//! A disconnect releases the device's session in the background. A mailbox
//! opened by a later reconnect waits for that release before it dispatches
//! anything, so the new session never races the old one's teardown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use hiveproto::bridge::now_ms;
use hiveproto::service::{modules_reply, LicenseValue, QueryKind, QueryResult, ServiceActivity};
use hiveproto::topic::{
    COMMAND_QUERY_RESULT, COMMAND_REMOTE_CHAT, COMMAND_TELEHEALTH, COMMAND_WAKEUP,
    EVENT_DEVICE_LOGS, EVENT_REMOTE_CHAT, EVENT_REMOTE_CHAT_STAGING, EVENT_SERVICE_ACTIVITY,
    EVENT_ZMQ_BRIDGE,
};
use hiveproto::{
    BridgeFrame, BridgeMessage, DeviceRequest, InboundTopic, ProtoError, ProtoSubscribe,
    RemoteChatEvent, ResponseEnvelope, SttRequest,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogError, ContentCatalog};
use crate::devices::DeviceStore;
use crate::markup::{MarkupRenderer, Mood};
use crate::publisher::{send_bridge, Publisher};
use crate::sessions::SessionRegistry;
use crate::stt::SpeechService;
use crate::workers::WorkerPool;

static CONNECTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"connected from (.*) as (d_[a-f0-9-]+)").expect("connect pattern is valid")
});

static DISCONNECTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Client (d_[a-f0-9-]+) (closed its connection|disconnected)")
        .expect("disconnect pattern is valid")
});

/// Connect or disconnect announced in a broker log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerPresence {
    Connected { device_id: String, address: String },
    Disconnected { device_id: String },
}

impl BrokerPresence {
    pub fn parse(line: &str) -> Option<Self> {
        if let Some(caps) = CONNECTED.captures(line) {
            return Some(BrokerPresence::Connected {
                device_id: caps[2].to_string(),
                address: caps[1].to_string(),
            });
        }
        DISCONNECTED
            .captures(line)
            .map(|caps| BrokerPresence::Disconnected {
                device_id: caps[1].to_string(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Queued remote-chat requests per device. Past this, requests are
    /// answered with the fallback.
    pub mailbox_depth: usize,
    /// Pause between loading a device and pushing it config.
    pub connect_settle: Duration,
    /// License id → license value handed to devices that ask.
    pub licenses: BTreeMap<String, String>,
}

impl RouterSettings {
    pub fn from_config(config: &hiveconf::HiveConfig) -> Self {
        Self {
            mailbox_depth: config.bootstrap.workers.mailbox_depth,
            connect_settle: config.bootstrap.defaults.connect_settle(),
            licenses: config.bootstrap.licenses.clone(),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            mailbox_depth: 16,
            connect_settle: Duration::from_secs(1),
            licenses: BTreeMap::new(),
        }
    }
}

/// Everything the router hands work to.
pub struct RouterParts {
    pub devices: Arc<DeviceStore>,
    pub registry: Arc<SessionRegistry>,
    pub speech: Arc<SpeechService>,
    pub publisher: Arc<dyn Publisher>,
    pub markup: Arc<dyn MarkupRenderer>,
    pub service_pool: WorkerPool,
    pub settings: RouterSettings,
}

struct Mailbox {
    tx: mpsc::Sender<DeviceRequest>,
    task: JoinHandle<()>,
}

/// A device's session release, awaitable by whoever needs it finished.
type Release = Shared<BoxFuture<'static, ()>>;

struct Inner {
    devices: Arc<DeviceStore>,
    registry: Arc<SessionRegistry>,
    speech: Arc<SpeechService>,
    publisher: Arc<dyn Publisher>,
    markup: Arc<dyn MarkupRenderer>,
    service_pool: WorkerPool,
    settings: RouterSettings,
    mailboxes: DashMap<String, Mailbox>,
    releases: DashMap<String, Release>,
}

#[derive(Clone)]
pub struct TransportRouter {
    inner: Arc<Inner>,
}

impl TransportRouter {
    pub fn new(parts: RouterParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                devices: parts.devices,
                registry: parts.registry,
                speech: parts.speech,
                publisher: parts.publisher,
                markup: parts.markup,
                service_pool: parts.service_pool,
                settings: parts.settings,
                mailboxes: DashMap::new(),
                releases: DashMap::new(),
            }),
        }
    }

    pub fn devices(&self) -> &Arc<DeviceStore> {
        &self.inner.devices
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Route one inbound message.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) {
        let Some(parsed) = InboundTopic::parse(topic) else {
            debug!(topic, "Ignoring unrouted topic");
            return;
        };

        match parsed {
            InboundTopic::BrokerLog { level } => {
                if level == "N" {
                    self.on_broker_log(&String::from_utf8_lossy(payload));
                }
            }
            InboundTopic::BrokerClients { metric } => {
                match String::from_utf8_lossy(payload).trim().parse::<i64>() {
                    Ok(value) => self.inner.devices.record_client_metric(metric, value),
                    Err(_) => debug!(metric, "Non-numeric client metric"),
                }
            }
            InboundTopic::State { device_id } => {
                debug!(device.id = device_id, "Rx state");
                self.check_connect(device_id, "state");
                match serde_json::from_slice::<Value>(payload) {
                    Ok(state) => self.inner.devices.put_state(device_id, state),
                    Err(e) => warn!(device.id = device_id, error = %e, "Unreadable state"),
                }
            }
            InboundTopic::Event { device_id, name } => {
                self.check_connect(device_id, "event");
                self.on_device_event(device_id, name, payload);
            }
        }
    }

    fn on_broker_log(&self, line: &str) {
        match BrokerPresence::parse(line) {
            Some(BrokerPresence::Connected { device_id, address }) => {
                if self.inner.devices.connect_init_needed(&device_id) {
                    info!(device.id = %device_id, %address, "Device connected");
                    self.bootstrap(&device_id);
                }
            }
            Some(BrokerPresence::Disconnected { device_id }) => self.on_disconnect(&device_id),
            None => {}
        }
    }

    /// Traffic from a device we never saw connect still gets bootstrapped.
    fn check_connect(&self, device_id: &str, seen_on: &str) {
        if self.inner.devices.connect_init_needed(device_id) {
            info!(device.id = device_id, seen_on, "Unannounced device, connecting now");
            self.bootstrap(device_id);
        }
    }

    /// Load the device, then push its config once the connection has
    /// settled. The settle delay does not hold a pool permit.
    fn bootstrap(&self, device_id: &str) {
        let this = self.clone();
        let device_id = device_id.to_string();
        self.inner.service_pool.submit("bootstrap", async move {
            if let Err(e) = this.inner.devices.connect(&device_id).await {
                warn!(device.id = %device_id, error = %e, "Using defaults for device");
            }

            let pusher = this.clone();
            let settle = this.inner.settings.connect_settle;
            this.inner.service_pool.submit_after("push_config", settle, async move {
                if let Err(e) = pusher.push_config(&device_id).await {
                    warn!(device.id = %device_id, error = %e, "Device bootstrap failed");
                }
            });
        });
    }

    async fn push_config(&self, device_id: &str) -> Result<()> {
        let inner = &self.inner;
        inner
            .publisher
            .send_config(device_id, &inner.devices.config(device_id))
            .await?;

        let subscribe = ProtoSubscribe {
            protos: vec![SttRequest::PROTO_NAME.to_string()],
            timestamp: now_ms(),
        };
        send_bridge(inner.publisher.as_ref(), device_id, &subscribe).await?;
        debug!(device.id = device_id, "Subscribed to speech frames");
        Ok(())
    }

    fn on_disconnect(&self, device_id: &str) {
        if let Some((_, mailbox)) = self.inner.mailboxes.remove(device_id) {
            mailbox.task.abort();
        }
        self.inner.devices.release(device_id);
        self.inner.speech.release(device_id);

        let previous = self.inner.releases.remove(device_id).map(|(_, r)| r);
        let registry = self.inner.registry.clone();
        let id = device_id.to_string();
        let release: Release = async move {
            if let Some(previous) = previous {
                previous.await;
            }
            registry.release(&id).await;
        }
        .boxed()
        .shared();
        self.inner.releases.insert(device_id.to_string(), release.clone());

        let inner = self.inner.clone();
        let id = device_id.to_string();
        tokio::spawn(async move {
            release.await;
            inner.releases.remove_if(&id, |_, r| r.peek().is_some());
        });
        info!(device.id = device_id, "Device disconnected");
    }

    fn on_device_event(&self, device_id: &str, name: &str, payload: &[u8]) {
        match name {
            EVENT_REMOTE_CHAT | EVENT_REMOTE_CHAT_STAGING => self.on_remote_chat(device_id, payload),
            EVENT_SERVICE_ACTIVITY => self.on_service_activity(device_id, payload),
            EVENT_ZMQ_BRIDGE => self.on_bridge_frame(device_id, payload),
            EVENT_DEVICE_LOGS => match serde_json::from_slice::<Value>(payload) {
                Ok(rec) => debug!(
                    target: "hive.device",
                    "{}[{}] - {}",
                    device_id,
                    rec.get("tag").and_then(serde_json::Value::as_str).unwrap_or_default(),
                    rec.get("message").and_then(serde_json::Value::as_str).unwrap_or_default()
                ),
                Err(e) => debug!(device.id = device_id, error = %e, "Unreadable device log"),
            },
            other => debug!(device.id = device_id, event = other, "Unhandled device event"),
        }
    }

    fn on_remote_chat(&self, device_id: &str, payload: &[u8]) {
        match RemoteChatEvent::parse(payload) {
            Ok(RemoteChatEvent::Chat(request)) => self.enqueue(device_id, request),
            Ok(RemoteChatEvent::ModulesQuery { event_id }) => {
                let reply = modules_reply(&event_id, self.inner.registry.modules_info());
                self.send_later(device_id, COMMAND_REMOTE_CHAT, reply);
            }
            Ok(RemoteChatEvent::Unhandled { backend }) => {
                debug!(device.id = device_id, %backend, "Unhandled remote-chat backend");
            }
            Err(ProtoError::MalformedRequest {
                event_id: Some(event_id),
                reason,
            }) => {
                warn!(device.id = device_id, event.id = %event_id, %reason, "Malformed remote-chat request");
                let reply = ResponseEnvelope::fallback_for(&event_id, "router", None).to_json();
                self.send_later(device_id, COMMAND_REMOTE_CHAT, reply);
            }
            Err(e) => warn!(device.id = device_id, error = %e, "Dropping unreadable remote-chat event"),
        }
    }

    /// Queue a request behind the device's earlier ones.
    fn enqueue(&self, device_id: &str, request: DeviceRequest) {
        let mailbox = self
            .inner
            .mailboxes
            .entry(device_id.to_string())
            .or_insert_with(|| self.open_mailbox(device_id));

        let rejected = match mailbox.tx.try_send(request) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(request)) => {
                warn!(device.id = device_id, event.id = %request.event_id, "Device mailbox full, answering with fallback");
                request
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                warn!(device.id = device_id, event.id = %request.event_id, "Device mailbox closed, answering with fallback");
                request
            }
        };
        drop(mailbox);

        if !rejected.is_notify() {
            let reply = ResponseEnvelope::fallback(&rejected).to_json();
            self.send_later(device_id, COMMAND_REMOTE_CHAT, reply);
        }
    }

    fn open_mailbox(&self, device_id: &str) -> Mailbox {
        let (tx, mut rx) = mpsc::channel::<DeviceRequest>(self.inner.settings.mailbox_depth.max(1));
        let inner = self.inner.clone();
        let pending_release = self.inner.releases.get(device_id).map(|r| r.value().clone());
        let device_id = device_id.to_string();
        let task = tokio::spawn(async move {
            if let Some(release) = pending_release {
                debug!(device.id = %device_id, "Waiting for previous session release");
                release.await;
            }
            while let Some(request) = rx.recv().await {
                let robot = inner.devices.robot_snapshot(&device_id);
                let outcome = inner.registry.dispatch(&device_id, request, robot).await;
                debug!(device.id = %device_id, ?outcome, "Request handled");
            }
        });
        Mailbox { tx, task }
    }

    fn on_service_activity(&self, device_id: &str, payload: &[u8]) {
        let activity = match ServiceActivity::parse(payload) {
            Ok(activity) => activity,
            Err(e) => {
                warn!(device.id = device_id, error = %e, "Unreadable service activity");
                return;
            }
        };

        match activity {
            ServiceActivity::Query { query, request_id } => {
                self.answer_query(device_id, query, request_id)
            }
            ServiceActivity::MentorBehavior(behavior) => {
                let devices = self.inner.devices.clone();
                let id = device_id.to_string();
                self.inner.service_pool.submit("mentor_behavior", async move {
                    if let Err(e) = devices.add_mentor_behavior(&id, behavior).await {
                        warn!(device.id = %id, error = %e, "Failed to store mentor behavior");
                    }
                });
            }
            ServiceActivity::Telehealth(message) => {
                info!(device.id = device_id, %message, "Rx telehealth");
                if let Some(state) = message.get("state").filter(|s| !s.is_null()) {
                    self.inner.devices.put_puppet_state(device_id, state.clone());
                }
            }
            ServiceActivity::Other => debug!(device.id = device_id, "Service activity report"),
        }
    }

    fn answer_query(&self, device_id: &str, query: QueryKind, request_id: Value) {
        let devices = &self.inner.devices;
        let result = match query {
            QueryKind::Schedule => {
                debug!(device.id = device_id, "Rx schedule request");
                QueryResult::schedule(request_id, devices.schedule(device_id))
            }
            QueryKind::MentorBehaviors => {
                let records = devices.mentor_behaviors(device_id);
                info!(device.id = device_id, count = records.len(), "Providing mentor behaviors");
                QueryResult::mentor_behaviors(request_id, records)
            }
            QueryKind::License => {
                if self.inner.settings.licenses.is_empty() {
                    debug!(device.id = device_id, "No licenses configured");
                    return;
                }
                let values = self
                    .inner
                    .settings
                    .licenses
                    .iter()
                    .map(|(id, license)| LicenseValue {
                        id: id.clone(),
                        license: license.clone(),
                    })
                    .collect();
                QueryResult::licenses(request_id, values)
            }
            QueryKind::Unknown(name) => {
                debug!(device.id = device_id, query = %name, "Unknown service query");
                return;
            }
        };

        match serde_json::to_value(&result) {
            Ok(reply) => self.send_later(device_id, COMMAND_QUERY_RESULT, reply),
            Err(e) => warn!(device.id = device_id, error = %e, "Failed to encode query result"),
        }
    }

    fn on_bridge_frame(&self, device_id: &str, payload: &[u8]) {
        let frame = match BridgeFrame::parse(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(device.id = device_id, error = %e, "Unreadable bridge frame");
                return;
            }
        };
        if !frame.is::<SttRequest>() {
            debug!(device.id = device_id, proto = frame.proto_name, "Unhandled bridge proto");
            return;
        }
        match frame.decode::<SttRequest>() {
            Ok(request) => self.inner.speech.on_request(device_id, &request),
            Err(e) => warn!(device.id = device_id, error = %e, "Undecodable STT request"),
        }
    }

    /// Publish from the service pool.
    fn send_later(&self, device_id: &str, command: &'static str, payload: Value) {
        let publisher = self.inner.publisher.clone();
        let id = device_id.to_string();
        self.inner.service_pool.submit("reply", async move {
            if let Err(e) = publisher.send_command(&id, command, &payload).await {
                warn!(device.id = %id, command, error = %e, "Failed to publish");
            }
        });
    }

    /// Wake a device whose screen is off. Returns false if it is offline.
    pub async fn send_wakeup(&self, device_id: &str) -> Result<bool> {
        if !self.inner.devices.is_online(device_id) {
            return Ok(false);
        }
        self.inner
            .publisher
            .send_command(device_id, COMMAND_WAKEUP, &json!({"command": "wakeup"}))
            .await?;
        Ok(true)
    }

    /// Have the device say `text` right now.
    pub async fn send_telehealth_speech(
        &self,
        device_id: &str,
        text: &str,
        mood: Option<&Mood>,
    ) -> Result<bool> {
        let markup = self.inner.markup.render(text, mood);
        let message = json!({
            "action": "PLAY_OUTPUT",
            "output": {"text": text, "markup": markup},
        });
        self.send_telehealth(device_id, message).await
    }

    /// Stop whatever the device is saying.
    pub async fn send_telehealth_interrupt(&self, device_id: &str) -> Result<bool> {
        self.send_telehealth(device_id, json!({"action": "INTERRUPT"}))
            .await
    }

    async fn send_telehealth(&self, device_id: &str, message: Value) -> Result<bool> {
        if !self.inner.devices.is_online(device_id) {
            return Ok(false);
        }
        let payload = json!({"command": "telehealth", "message": message});
        self.inner
            .publisher
            .send_command(device_id, COMMAND_TELEHEALTH, &payload)
            .await?;
        Ok(true)
    }

    /// Swap in a new catalog and push the resulting config to online
    /// devices.
    pub async fn reload(&self, catalog: &ContentCatalog) -> Result<(), CatalogError> {
        self.inner.registry.reload(catalog)?;
        self.inner
            .devices
            .set_defaults(catalog.device_config.clone(), catalog.schedule.clone());

        for device_id in self.inner.devices.online_devices() {
            info!(device.id = %device_id, "Pushing updated config");
            let config = self.inner.devices.config(&device_id);
            if let Err(e) = self.inner.publisher.send_config(&device_id, &config).await {
                warn!(device.id = %device_id, error = %e, "Failed to push config");
            }
        }
        Ok(())
    }

    /// Log broker client counts and pool counters every `every` until
    /// shutdown.
    pub fn spawn_metrics_logger(
        &self,
        every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.log_metrics(),
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    pub fn log_metrics(&self) {
        let inner = &self.inner;
        let clients = inner.devices.client_metrics();
        info!(
            online = inner.devices.online_devices().len(),
            mailboxes = inner.mailboxes.len(),
            clients = ?clients,
            "Client metrics"
        );
        for pool in [inner.registry.pool(), &inner.service_pool, inner.speech.pool()] {
            let stats = pool.stats();
            debug!(
                pool = pool.name(),
                submitted = stats.submitted,
                completed = stats.completed,
                failed = stats.failed,
                in_flight = stats.in_flight,
                "Worker pool"
            );
        }
    }

    /// Stop every mailbox task. Queued requests are dropped.
    pub fn shutdown(&self) {
        for entry in self.inner.mailboxes.iter() {
            entry.value().task.abort();
        }
        self.inner.mailboxes.clear();
    }

    /// Wait for pending releases and for queued and running work across
    /// the router's pools.
    pub async fn idle(&self) {
        let releases: Vec<Release> = self.inner.releases.iter().map(|r| r.value().clone()).collect();
        join_all(releases).await;
        self.inner.service_pool.idle().await;
        self.inner.registry.pool().idle().await;
        self.inner.speech.idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_commands::GlobalCommandMatcher;
    use crate::markup::PlainMarkup;
    use crate::publisher::MemoryPublisher;
    use crate::sandbox::LuaSandbox;
    use crate::sessions::{Session, SessionFactory};
    use crate::catalog::ModuleSpec;
    use crate::stt::{Transcriber, Transcript, TranscriptionError};
    use async_trait::async_trait;
    use hiveproto::{LocalData, Volley};
    use tokio::sync::{Notify, Semaphore};
    use tokio::time::Instant;

    struct NoSessions;

    #[async_trait]
    impl SessionFactory for NoSessions {
        async fn create(&self, _spec: &ModuleSpec) -> anyhow::Result<Box<dyn Session>> {
            anyhow::bail!("sessions are not used here")
        }
    }

    struct Silent;

    #[async_trait]
    impl Transcriber for Silent {
        async fn transcribe(&self, _wav: Vec<u8>) -> Result<Transcript, TranscriptionError> {
            Err(TranscriptionError::Empty)
        }
    }

    /// Sessions that park every volley until `gate` hands out a permit.
    #[derive(Clone)]
    struct StalledSessions {
        started: Arc<Notify>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Session for StalledSessions {
        async fn ingest_notify(&mut self, _volley: &Volley) {}

        async fn handle_volley(&mut self, volley: &mut Volley) {
            self.started.notify_one();
            self.gate.acquire().await.unwrap().forget();
            volley.set_output("done", None);
        }

        fn has_complete_hook(&self) -> bool {
            false
        }

        async fn complete_hook(&mut self, _volley: Volley) {}

        fn local_data(&self) -> LocalData {
            LocalData::new()
        }
    }

    #[async_trait]
    impl SessionFactory for StalledSessions {
        async fn create(&self, _spec: &ModuleSpec) -> anyhow::Result<Box<dyn Session>> {
            Ok(Box::new(self.clone()))
        }
    }

    fn router(licenses: BTreeMap<String, String>) -> (TransportRouter, Arc<MemoryPublisher>) {
        let settings = RouterSettings {
            mailbox_depth: 4,
            connect_settle: Duration::ZERO,
            licenses,
        };
        router_with(Arc::new(NoSessions), settings, 2)
    }

    fn router_with(
        factory: Arc<dyn SessionFactory>,
        settings: RouterSettings,
        service_workers: usize,
    ) -> (TransportRouter, Arc<MemoryPublisher>) {
        let publisher = Arc::new(MemoryPublisher::new());
        let catalog = ContentCatalog::builtin();
        let registry = SessionRegistry::new(
            GlobalCommandMatcher::new(Arc::new(LuaSandbox::new()), Duration::from_secs(1)),
            factory,
            Arc::new(PlainMarkup),
            WorkerPool::new("remote_chat", 2),
            publisher.clone(),
        );
        registry.reload(&catalog).unwrap();

        let router = TransportRouter::new(RouterParts {
            devices: Arc::new(DeviceStore::new(json!({"paired": true}), json!({"name": "default"}))),
            registry: Arc::new(registry),
            speech: Arc::new(SpeechService::new(
                Arc::new(Silent),
                publisher.clone(),
                WorkerPool::new("stt", 1),
            )),
            publisher: publisher.clone(),
            markup: Arc::new(PlainMarkup),
            service_pool: WorkerPool::new("service", service_workers),
            settings,
        });
        (router, publisher)
    }

    fn chat(router: &TransportRouter, device_id: &str, event_id: &str, speech: &str) {
        let body = json!({
            "event_id": event_id,
            "backend": "router",
            "command": "continue",
            "module_id": "OPENMOXIE_CHAT",
            "content_id": "default",
            "speech": speech,
        });
        router.handle_message(
            &format!("/devices/{device_id}/events/remote-chat"),
            &serde_json::to_vec(&body).unwrap(),
        );
    }

    /// Remote-chat replies once there are at least `count`, or whatever
    /// arrived by `limit`.
    async fn remote_chat_replies(publisher: &MemoryPublisher, count: usize, limit: Duration) -> Vec<Value> {
        let deadline = Instant::now() + limit;
        loop {
            let replies: Vec<Value> = publisher
                .on_topic("/commands/remote_chat")
                .iter()
                .filter_map(|p| p.json())
                .collect();
            if replies.len() >= count || Instant::now() >= deadline {
                return replies;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn connect(router: &TransportRouter, device_id: &str) {
        let line = format!("New client connected from 127.0.0.1 as {device_id}");
        router.handle_message("$SYS/broker/log/N", line.as_bytes());
        router.idle().await;
    }

    #[test]
    fn test_broker_presence_lines() {
        let line = "1700000000: New client connected from 10.0.0.5:51234 as d_0a1b-2c (p2, c1, k60).";
        assert_eq!(
            BrokerPresence::parse(line),
            Some(BrokerPresence::Connected {
                device_id: "d_0a1b-2c".to_string(),
                address: "10.0.0.5:51234".to_string(),
            })
        );
        assert_eq!(
            BrokerPresence::parse("1700000000: Client d_ff closed its connection."),
            Some(BrokerPresence::Disconnected { device_id: "d_ff".to_string() })
        );
        assert_eq!(BrokerPresence::parse("Client web_1 disconnected."), None);
    }

    #[tokio::test]
    async fn test_connect_bootstraps_once() {
        let (router, publisher) = router(BTreeMap::new());
        let line = b"New client connected from 10.0.0.5 as d_01";
        router.handle_message("$SYS/broker/log/N", line);
        router.handle_message("$SYS/broker/log/N", line);
        router.idle().await;
        router.handle_message("/devices/d_01/state", br#"{"battery": 80}"#);
        router.idle().await;

        assert_eq!(publisher.on_topic("/devices/d_01/config").len(), 1);
        let bridge = publisher.on_topic("/devices/d_01/commands/zmq");
        assert_eq!(bridge.len(), 1);
        let frame = BridgeFrame::parse(&bridge[0].payload).unwrap();
        let sub = frame.decode::<ProtoSubscribe>().unwrap();
        assert_eq!(sub.protos, vec![SttRequest::PROTO_NAME.to_string()]);

        assert!(router.devices().is_online("d_01"));
        assert_eq!(router.devices().record("d_01").unwrap().state["battery"], 80);
    }

    #[tokio::test]
    async fn test_disconnect_reopens_gate() {
        let (router, publisher) = router(BTreeMap::new());
        connect(&router, "d_01").await;
        router.handle_message("$SYS/broker/log/N", b"Client d_01 disconnected.");
        router.idle().await;
        assert!(!router.devices().is_online("d_01"));

        router.handle_message("/devices/d_01/events/device-logs", br#"{"tag":"x","message":"y"}"#);
        router.idle().await;
        assert_eq!(publisher.on_topic("/devices/d_01/config").len(), 2);
    }

    #[tokio::test]
    async fn test_connect_settle_leaves_service_pool_free() {
        let settings = RouterSettings {
            mailbox_depth: 4,
            connect_settle: Duration::from_secs(1),
            licenses: BTreeMap::new(),
        };
        let (router, publisher) = router_with(Arc::new(NoSessions), settings, 1);
        router.handle_message("$SYS/broker/log/N", b"New client connected from 10.0.0.5 as d_01");

        let query = json!({"backend": "data", "event_id": "ev-q", "query": {"query": "modules"}});
        router.handle_message(
            "/devices/d_01/events/remote-chat",
            &serde_json::to_vec(&query).unwrap(),
        );

        let replies = remote_chat_replies(&publisher, 1, Duration::from_millis(500)).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["event_id"], "ev-q");
        assert!(publisher.on_topic("/devices/d_01/config").is_empty());

        router.idle().await;
        assert_eq!(publisher.on_topic("/devices/d_01/config").len(), 1);
    }

    #[tokio::test]
    async fn test_full_mailbox_answers_with_fallback() {
        let sessions = StalledSessions {
            started: Arc::new(Notify::new()),
            gate: Arc::new(Semaphore::new(0)),
        };
        let settings = RouterSettings {
            mailbox_depth: 1,
            connect_settle: Duration::ZERO,
            licenses: BTreeMap::new(),
        };
        let (router, publisher) = router_with(Arc::new(sessions.clone()), settings, 2);
        connect(&router, "d_01").await;

        chat(&router, "d_01", "ev-a", "first");
        sessions.started.notified().await;
        chat(&router, "d_01", "ev-b", "second");
        chat(&router, "d_01", "ev-c", "third");

        let replies = remote_chat_replies(&publisher, 1, Duration::from_secs(2)).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["event_id"], "ev-c");
        assert_eq!(replies[0]["fallback"], true);
        assert_eq!(replies[0]["output"]["text"], hiveproto::FALLBACK_TEXT);

        sessions.gate.add_permits(10);
        let replies = remote_chat_replies(&publisher, 3, Duration::from_secs(2)).await;
        let answered: Vec<&str> = replies.iter().filter_map(|r| r["event_id"].as_str()).collect();
        assert_eq!(answered, vec!["ev-c", "ev-a", "ev-b"]);
        assert_eq!(replies[1]["output"]["text"], "done");
        assert_eq!(replies[2]["fallback"], false);
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_notify_silently() {
        let sessions = StalledSessions {
            started: Arc::new(Notify::new()),
            gate: Arc::new(Semaphore::new(0)),
        };
        let settings = RouterSettings {
            mailbox_depth: 1,
            connect_settle: Duration::ZERO,
            licenses: BTreeMap::new(),
        };
        let (router, publisher) = router_with(Arc::new(sessions.clone()), settings, 2);
        connect(&router, "d_01").await;

        chat(&router, "d_01", "ev-a", "first");
        sessions.started.notified().await;
        chat(&router, "d_01", "ev-b", "second");
        let notify = json!({
            "event_id": "ev-n",
            "backend": "router",
            "command": "notify",
            "module_id": "OPENMOXIE_CHAT",
            "content_id": "default",
            "speech": "said this",
        });
        router.handle_message(
            "/devices/d_01/events/remote-chat",
            &serde_json::to_vec(&notify).unwrap(),
        );
        router.inner.service_pool.idle().await;
        assert!(publisher.on_topic("/commands/remote_chat").is_empty());

        sessions.gate.add_permits(10);
        let replies = remote_chat_replies(&publisher, 2, Duration::from_secs(2)).await;
        assert_eq!(replies.len(), 2);
    }

    #[tokio::test]
    async fn test_modules_query_answered() {
        let (router, publisher) = router(BTreeMap::new());
        let query = json!({"backend": "data", "event_id": "ev-9", "query": {"query": "modules"}});
        router.handle_message(
            "/devices/d_01/events/remote-chat",
            &serde_json::to_vec(&query).unwrap(),
        );
        router.idle().await;

        let reply = publisher.on_topic("/commands/remote_chat")[0].json().unwrap();
        assert_eq!(reply["event_id"], "ev-9");
        assert_eq!(reply["query_data"]["version"], "openmoxie_v1");
        assert_eq!(reply["query_data"]["modules"][0]["info"]["id"], "OPENMOXIE_CHAT");
    }

    #[tokio::test]
    async fn test_malformed_request_gets_fallback() {
        let (router, publisher) = router(BTreeMap::new());
        let bad = json!({"backend": "router", "event_id": "ev-1", "command": "dance"});
        router.handle_message(
            "/devices/d_01/events/remote-chat",
            &serde_json::to_vec(&bad).unwrap(),
        );
        router.idle().await;

        let reply = publisher.on_topic("/commands/remote_chat")[0].json().unwrap();
        assert_eq!(reply["event_id"], "ev-1");
        assert_eq!(reply["fallback"], true);
    }

    #[tokio::test]
    async fn test_service_queries() {
        let mut licenses = BTreeMap::new();
        licenses.insert("google_speech".to_string(), "secret".to_string());
        let (router, publisher) = router(licenses);
        let topic = "/devices/d_01/events/client-service-activity-log";
        connect(&router, "d_01").await;

        router.handle_message(topic, br#"{"mentor_behavior": {"module_id": "JOKE"}}"#);
        router.idle().await;
        router.handle_message(topic, br#"{"subtopic": "query", "query": "schedule", "request_id": 1}"#);
        router.handle_message(topic, br#"{"subtopic": "query", "query": "mentor_behaviors", "request_id": 2}"#);
        router.handle_message(topic, br#"{"subtopic": "query", "query": "license", "request_id": 3}"#);
        router.idle().await;

        let replies: Vec<Value> = publisher
            .on_topic("/commands/query_result")
            .iter()
            .filter_map(|p| p.json())
            .collect();
        assert_eq!(replies.len(), 3);
        let by_id = |id: i64| replies.iter().find(|r| r["request_id"] == id).unwrap();
        assert_eq!(by_id(1)["schedule"]["name"], "default");
        assert_eq!(by_id(2)["mentor_behaviors"][0]["module_id"], "JOKE");
        assert_eq!(by_id(3)["license_values"][0]["id"], "google_speech");
    }

    #[tokio::test]
    async fn test_license_query_without_licenses_is_silent() {
        let (router, publisher) = router(BTreeMap::new());
        router.handle_message(
            "/devices/d_01/events/client-service-activity-log",
            br#"{"subtopic": "query", "query": "license", "request_id": 3}"#,
        );
        router.idle().await;
        assert!(publisher.on_topic("/commands/query_result").is_empty());
    }

    #[tokio::test]
    async fn test_telehealth_and_wakeup_need_online_device() {
        let (router, publisher) = router(BTreeMap::new());
        assert!(!router.send_wakeup("d_01").await.unwrap());

        connect(&router, "d_01").await;
        router.handle_message(
            "/devices/d_01/events/client-service-activity-log",
            br#"{"subtopic": "telehealth", "message": {"state": "LISTENING"}}"#,
        );
        router.idle().await;
        assert_eq!(
            router.devices().record("d_01").unwrap().puppet_state,
            Some(json!("LISTENING"))
        );

        assert!(router.send_wakeup("d_01").await.unwrap());
        let mood = Mood { name: "happy".to_string(), intensity: 0.5 };
        assert!(router.send_telehealth_speech("d_01", "a < b", Some(&mood)).await.unwrap());
        assert!(router.send_telehealth_interrupt("d_01").await.unwrap());

        let tele = publisher.on_topic("/commands/telehealth");
        let play = tele[0].json().unwrap();
        assert_eq!(play["message"]["action"], "PLAY_OUTPUT");
        assert_eq!(play["message"]["output"]["markup"], "a &lt; b");
        assert_eq!(tele[1].json().unwrap()["message"]["action"], "INTERRUPT");
        assert_eq!(publisher.on_topic("/commands/wakeup").len(), 1);
    }

    #[tokio::test]
    async fn test_reload_pushes_config_to_online_devices() {
        let (router, publisher) = router(BTreeMap::new());
        connect(&router, "d_01").await;

        let mut catalog = ContentCatalog::builtin();
        catalog.device_config = json!({"paired": false});
        router.reload(&catalog).await.unwrap();

        let configs = publisher.on_topic("/devices/d_01/config");
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].json().unwrap()["paired"], false);
    }

    #[tokio::test]
    async fn test_client_metrics_recorded() {
        let (router, _) = router(BTreeMap::new());
        router.handle_message("$SYS/broker/clients/connected", b"3");
        router.handle_message("$SYS/broker/clients/total", b"bogus");
        assert_eq!(router.devices().client_metrics().get("connected"), Some(&3));
        assert_eq!(router.devices().client_metrics().len(), 1);
        router.log_metrics();
    }
}
