//! Shared harness: a router wired to in-memory fakes.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive::catalog::{ContentCatalog, ModuleSpec};
use hive::devices::DeviceStore;
use hive::global_commands::GlobalCommandMatcher;
use hive::markup::PlainMarkup;
use hive::publisher::MemoryPublisher;
use hive::router::{RouterParts, RouterSettings, TransportRouter};
use hive::sandbox::LuaSandbox;
use hive::sessions::{
    ChatSessionFactory, Completion, CompletionRequest, Session, SessionFactory, SessionRegistry,
};
use hive::stt::{SpeechService, Transcriber, Transcript, TranscriptionError, WordTiming};
use hive::workers::WorkerPool;
use hiveproto::{LocalData, Volley};
use serde_json::{json, Value};
use tokio::time::Instant;

/// Answers every turn with "You said <last user turn>".
pub struct EchoCompletion;

#[async_trait]
impl Completion for EchoCompletion {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String> {
        let last = request
            .messages
            .last()
            .map(|t| t.content.clone())
            .unwrap_or_default();
        Ok(format!("You said {last}"))
    }
}

/// Always hears "hello moxie" from 0.25s to 0.75s.
pub struct FixedTranscriber;

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<Transcript, TranscriptionError> {
        assert!(wav.starts_with(b"RIFF"));
        Ok(Transcript {
            text: "hello moxie".to_string(),
            words: vec![
                WordTiming { word: "hello".to_string(), start: 0.25, end: 0.5 },
                WordTiming { word: "moxie".to_string(), start: 0.5, end: 0.75 },
            ],
        })
    }
}

/// Wraps real chat sessions and counts completion hooks.
struct CountingSession {
    inner: Box<dyn Session>,
    completed: Arc<AtomicUsize>,
}

#[async_trait]
impl Session for CountingSession {
    async fn ingest_notify(&mut self, volley: &Volley) {
        self.inner.ingest_notify(volley).await
    }

    async fn handle_volley(&mut self, volley: &mut Volley) {
        self.inner.handle_volley(volley).await
    }

    fn has_complete_hook(&self) -> bool {
        self.inner.has_complete_hook()
    }

    async fn complete_hook(&mut self, volley: Volley) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.inner.complete_hook(volley).await
    }

    fn local_data(&self) -> LocalData {
        self.inner.local_data()
    }
}

struct CountingFactory {
    inner: ChatSessionFactory,
    completed: Arc<AtomicUsize>,
}

#[async_trait]
impl SessionFactory for CountingFactory {
    async fn create(&self, spec: &ModuleSpec) -> anyhow::Result<Box<dyn Session>> {
        Ok(Box::new(CountingSession {
            inner: self.inner.create(spec).await?,
            completed: self.completed.clone(),
        }))
    }
}

pub struct Harness {
    pub router: TransportRouter,
    pub publisher: Arc<MemoryPublisher>,
    pub completed: Arc<AtomicUsize>,
}

pub fn harness(catalog: &str, method_timeout: Duration) -> Harness {
    let catalog = ContentCatalog::parse(catalog, std::path::Path::new("content.toml")).unwrap();
    let publisher = Arc::new(MemoryPublisher::new());
    let sandbox = Arc::new(LuaSandbox::new());
    let completed = Arc::new(AtomicUsize::new(0));

    let factory = CountingFactory {
        inner: ChatSessionFactory::new(
            Arc::new(EchoCompletion),
            sandbox.clone(),
            "test-model",
            Duration::from_secs(2),
        ),
        completed: completed.clone(),
    };
    let registry = SessionRegistry::new(
        GlobalCommandMatcher::new(sandbox, method_timeout),
        Arc::new(factory),
        Arc::new(PlainMarkup),
        WorkerPool::new("remote_chat", 4),
        publisher.clone(),
    );
    registry.reload(&catalog).unwrap();

    let router = TransportRouter::new(RouterParts {
        devices: Arc::new(DeviceStore::new(
            catalog.device_config.clone(),
            catalog.schedule.clone(),
        )),
        registry: Arc::new(registry),
        speech: Arc::new(SpeechService::new(
            Arc::new(FixedTranscriber),
            publisher.clone(),
            WorkerPool::new("stt", 2),
        )),
        publisher: publisher.clone(),
        markup: Arc::new(PlainMarkup),
        service_pool: WorkerPool::new("service", 2),
        settings: RouterSettings {
            mailbox_depth: 16,
            connect_settle: Duration::ZERO,
            ..Default::default()
        },
    });

    Harness { router, publisher, completed }
}

impl Harness {
    pub fn request(&self, device_id: &str, command: &str, module: &str, content: &str, speech: Option<&str>) -> String {
        let event_id = uuid::Uuid::new_v4().to_string();
        let mut body = json!({
            "event_id": event_id,
            "backend": "router",
            "command": command,
            "module_id": module,
            "content_id": content,
        });
        if let Some(speech) = speech {
            body["speech"] = json!(speech);
        }
        self.router.handle_message(
            &format!("/devices/{device_id}/events/remote-chat"),
            &serde_json::to_vec(&body).unwrap(),
        );
        event_id
    }

    pub fn remote_chat_replies(&self) -> Vec<Value> {
        self.publisher
            .on_topic("/commands/remote_chat")
            .iter()
            .filter_map(|p| p.json())
            .collect()
    }

    /// Wait for at least `count` remote-chat replies.
    pub async fn replies(&self, count: usize) -> Vec<Value> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let replies = self.remote_chat_replies();
            if replies.len() >= count || Instant::now() >= deadline {
                return replies;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
