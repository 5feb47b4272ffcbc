//! Wiring the service together from config and collaborators.

use std::sync::Arc;

use anyhow::{Context, Result};
use hiveconf::HiveConfig;
use tracing::{info, warn};

use crate::catalog::ContentCatalog;
use crate::devices::DeviceStore;
use crate::global_commands::GlobalCommandMatcher;
use crate::markup::{MarkupRenderer, PlainMarkup};
use crate::publisher::Publisher;
use crate::router::{RouterParts, RouterSettings, TransportRouter};
use crate::sandbox::{LuaSandbox, Sandbox};
use crate::sessions::{ChatSessionFactory, Completion, OpenAiCompletion, SessionRegistry};
use crate::stt::{SpeechService, Transcriber, WhisperTranscriber};
use crate::workers::WorkerPool;

/// The outside world the service talks to.
pub struct Collaborators {
    pub publisher: Arc<dyn Publisher>,
    pub completion: Arc<dyn Completion>,
    pub transcriber: Arc<dyn Transcriber>,
    pub markup: Arc<dyn MarkupRenderer>,
    pub sandbox: Arc<dyn Sandbox>,
}

impl Collaborators {
    /// HTTP collaborators from the configured endpoints.
    pub fn from_config(config: &HiveConfig, publisher: Arc<dyn Publisher>) -> Self {
        let services = &config.bootstrap.services;
        Self {
            publisher,
            completion: Arc::new(OpenAiCompletion::from_config(services)),
            transcriber: Arc::new(WhisperTranscriber::from_config(services)),
            markup: Arc::new(PlainMarkup),
            sandbox: Arc::new(LuaSandbox::with_memory_limit(
                config.bootstrap.defaults.script_memory_bytes(),
            )),
        }
    }
}

/// Load the content catalog, using the built-in one when the file is
/// missing.
pub fn load_catalog(config: &HiveConfig) -> Result<ContentCatalog> {
    let path = &config.infra.paths.content_file;
    if !path.exists() {
        warn!(path = %path.display(), "Content file not found, using built-in catalog");
        return Ok(ContentCatalog::builtin());
    }
    ContentCatalog::load(path).context("Failed to load content catalog")
}

/// Build the router and everything behind it.
pub fn assemble(
    config: &HiveConfig,
    catalog: &ContentCatalog,
    collaborators: Collaborators,
) -> Result<TransportRouter> {
    let workers = &config.bootstrap.workers;
    let defaults = &config.bootstrap.defaults;

    let devices = DeviceStore::new(catalog.device_config.clone(), catalog.schedule.clone())
        .with_state_dir(&config.infra.paths.state_dir);

    let factory = ChatSessionFactory::new(
        collaborators.completion,
        collaborators.sandbox.clone(),
        &config.bootstrap.services.llm_model,
        defaults.hook_timeout(),
    );
    let registry = SessionRegistry::new(
        GlobalCommandMatcher::new(collaborators.sandbox, defaults.method_timeout()),
        Arc::new(factory),
        collaborators.markup.clone(),
        WorkerPool::new("remote_chat", workers.remote_chat),
        collaborators.publisher.clone(),
    );
    registry.reload(catalog)?;

    let speech = SpeechService::new(
        collaborators.transcriber,
        collaborators.publisher.clone(),
        WorkerPool::new("stt", workers.stt),
    );

    info!(
        remote_chat = workers.remote_chat,
        service = workers.service,
        stt = workers.stt,
        mailbox_depth = workers.mailbox_depth,
        "Worker pools ready"
    );

    Ok(TransportRouter::new(RouterParts {
        devices: Arc::new(devices),
        registry: Arc::new(registry),
        speech: Arc::new(speech),
        publisher: collaborators.publisher,
        markup: collaborators.markup,
        service_pool: WorkerPool::new("service", workers.service),
        settings: RouterSettings::from_config(config),
    }))
}
