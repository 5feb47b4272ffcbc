//! Conversation sessions.
//!
//! A device talks to at most one session at a time. The registry owns the
//! device → session table and the hand-off rules; sessions only know how to
//! answer a volley.

pub mod chat;
pub mod completion;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use hiveproto::{LocalData, Volley};
use tokio::sync::Mutex;

use crate::catalog::ModuleSpec;

pub use chat::{ChatParams, ChatSession, ChatSessionFactory, SummaryOptions};
pub use completion::{ChatTurn, Completion, CompletionRequest, OpenAiCompletion, Role};
pub use registry::{DispatchOutcome, SessionRegistry};

/// `module_id/content_id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(module_id: &str, content_id: &str) -> Self {
        Self(format!("{module_id}/{content_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One live conversation.
#[async_trait]
pub trait Session: Send {
    /// Record context from a `notify` request. Never produces a reply.
    async fn ingest_notify(&mut self, volley: &Volley);

    /// Fill in `volley.response`.
    async fn handle_volley(&mut self, volley: &mut Volley);

    fn has_complete_hook(&self) -> bool;

    /// Called once when the device leaves this session.
    async fn complete_hook(&mut self, volley: Volley);

    fn local_data(&self) -> LocalData;
}

pub type SessionHandle = Arc<Mutex<Box<dyn Session>>>;

/// Builds sessions for catalog modules.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, spec: &ModuleSpec) -> anyhow::Result<Box<dyn Session>>;
}
