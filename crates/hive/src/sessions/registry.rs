//! Device → session table and request dispatch.
//!
//! Every remote-chat request goes through [`SessionRegistry::dispatch`]:
//!
//! 1. A matching global pattern answers and nothing else runs.
//! 2. A request for a catalog module goes to the device's session for that
//!    module, creating it (and retiring the previous one) when needed.
//! 3. Anything else retires the device's session and gets the fallback.
//!
//! Each device has its own slot lock, so a hand-off is atomic for that
//! device without making devices wait on each other. Slots carry a
//! generation that moves on every retire; a reply computed for an older
//! generation is dropped instead of sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use hiveproto::service::ModuleInfo;
use hiveproto::topic::COMMAND_REMOTE_CHAT;
use hiveproto::{DeviceRequest, ResponseEnvelope, RobotSnapshot, Volley};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{SessionFactory, SessionHandle, SessionKey};
use crate::catalog::{CatalogError, ContentCatalog, ModuleSpec};
use crate::global_commands::{compile_all, GlobalCommandMatcher};
use crate::markup::MarkupRenderer;
use crate::publisher::Publisher;
use crate::workers::WorkerPool;

/// How a request was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A global pattern answered.
    Global { pattern: String },
    /// The device's session answered.
    Session { key: SessionKey },
    /// A notify was folded into the session; nothing is sent.
    Notified { key: SessionKey },
    /// No module matched; the fallback was sent.
    Fallback,
    /// A notify for a module we do not serve.
    Ignored,
    /// The session could not be created; an error reply was sent.
    Failed,
    /// The device moved on while the reply was computed; nothing was sent.
    Stale,
}

#[derive(Default)]
struct DeviceSlot {
    active: Option<(SessionKey, SessionHandle)>,
    generation: u64,
}

#[derive(Default)]
struct ModuleTable {
    by_key: HashMap<SessionKey, ModuleSpec>,
    info: Vec<ModuleInfo>,
}

pub struct SessionRegistry {
    slots: DashMap<String, Arc<Mutex<DeviceSlot>>>,
    modules: RwLock<Arc<ModuleTable>>,
    generations: AtomicU64,
    matcher: GlobalCommandMatcher,
    factory: Arc<dyn SessionFactory>,
    markup: Arc<dyn MarkupRenderer>,
    pool: WorkerPool,
    publisher: Arc<dyn Publisher>,
}

impl SessionRegistry {
    pub fn new(
        matcher: GlobalCommandMatcher,
        factory: Arc<dyn SessionFactory>,
        markup: Arc<dyn MarkupRenderer>,
        pool: WorkerPool,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            modules: RwLock::new(Arc::new(ModuleTable::default())),
            generations: AtomicU64::new(0),
            matcher,
            factory,
            markup,
            pool,
            publisher,
        }
    }

    /// Swap in the catalog's modules and global patterns. On error nothing
    /// changes.
    pub fn reload(&self, catalog: &ContentCatalog) -> Result<(), CatalogError> {
        let patterns = compile_all(&catalog.global_responses)?;

        let by_key = catalog
            .modules
            .iter()
            .map(|m| (m.key(), m.clone()))
            .collect::<HashMap<_, _>>();
        let info = catalog
            .module_content_ids()
            .iter()
            .map(|(module_id, content_ids)| ModuleInfo::remote(module_id, content_ids))
            .collect();

        for key in by_key.keys() {
            debug!(session.key = %key, "Registered remote module");
        }
        info!(
            modules = by_key.len(),
            global_responses = patterns.len(),
            "Loaded content catalog"
        );

        self.matcher.install(patterns);
        let table = Arc::new(ModuleTable { by_key, info });
        match self.modules.write() {
            Ok(mut guard) => *guard = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
        Ok(())
    }

    fn modules(&self) -> Arc<ModuleTable> {
        match self.modules.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Remote module list for the device's `modules` data query.
    pub fn modules_info(&self) -> Vec<ModuleInfo> {
        self.modules().info.clone()
    }

    pub fn matcher(&self) -> &GlobalCommandMatcher {
        &self.matcher
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    fn slot(&self, device_id: &str) -> Arc<Mutex<DeviceSlot>> {
        self.slots
            .entry(device_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    async fn generation(&self, device_id: &str) -> u64 {
        match self.slots.get(device_id).map(|s| s.value().clone()) {
            Some(slot) => slot.lock().await.generation,
            None => 0,
        }
    }

    /// The module the device is currently talking to.
    pub async fn active_session(&self, device_id: &str) -> Option<SessionKey> {
        let slot = self.slots.get(device_id).map(|s| s.value().clone())?;
        let guard = slot.lock().await;
        guard.active.as_ref().map(|(key, _)| key.clone())
    }

    /// The device's session for `spec`, creating it if the device is
    /// elsewhere. The previous session's completion hook has finished by
    /// the time the new one is installed. If the factory fails the slot is
    /// left as it was.
    pub async fn get_or_create(
        &self,
        device_id: &str,
        spec: &ModuleSpec,
    ) -> anyhow::Result<(SessionHandle, u64)> {
        let key = spec.key();
        let slot = self.slot(device_id);
        let mut guard = slot.lock().await;

        if let Some((active, handle)) = &guard.active {
            if *active == key {
                return Ok((handle.clone(), guard.generation));
            }
        }

        let session = self.factory.create(spec).await?;

        if let Some((old_key, old)) = self.take_active(&mut guard) {
            info!(device.id = device_id, from = %old_key, to = %key, "Session hand-off");
            let hook = complete_session(device_id.to_string(), old_key, old);
            if let Err(e) = self.pool.run("complete_hook", hook).await {
                error!(device.id = device_id, error = %e, "Completion hook did not finish");
            }
        } else {
            info!(device.id = device_id, session.key = %key, "Session started");
        }

        let handle: SessionHandle = Arc::new(Mutex::new(session));
        guard.active = Some((key, handle.clone()));
        Ok((handle, guard.generation))
    }

    /// Clear the slot and move its generation on.
    fn take_active(&self, slot: &mut DeviceSlot) -> Option<(SessionKey, SessionHandle)> {
        slot.generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        slot.active.take()
    }

    /// Retire the device's session, if any, without waiting for its hook.
    async fn retire(&self, device_id: &str) -> bool {
        let Some(slot) = self.slots.get(device_id).map(|s| s.value().clone()) else {
            return false;
        };
        let mut guard = slot.lock().await;
        match self.take_active(&mut guard) {
            Some((key, handle)) => {
                self.pool
                    .submit("complete_hook", complete_session(device_id.to_string(), key, handle));
                true
            }
            None => false,
        }
    }

    /// Forget the device: retire its session and invalidate in-flight
    /// replies.
    pub async fn release(&self, device_id: &str) {
        if self.retire(device_id).await {
            info!(device.id = device_id, "Released device session");
        }
    }

    /// Handle one remote-chat request from `device_id`.
    #[tracing::instrument(
        skip(self, request, robot),
        fields(device.id = device_id, command = request.command.as_str(), event.id = %request.event_id)
    )]
    pub async fn dispatch(
        &self,
        device_id: &str,
        request: DeviceRequest,
        robot: RobotSnapshot,
    ) -> DispatchOutcome {
        let volley = Volley::new(Some(device_id), request).with_robot(robot);

        if !volley.request.is_notify() {
            if let Some(pending) = self.matcher.check(&volley) {
                let pattern = pending.pattern_name().to_string();
                debug!(pattern.name = %pattern, "Global response");
                let generation = self.generation(device_id).await;
                let resp = match self.pool.run("global_command", pending.execute()).await {
                    Ok(resp) => resp,
                    Err(e) => error_envelope(&volley.request, &e.to_string()),
                };
                return if self.send(device_id, generation, &resp).await {
                    DispatchOutcome::Global { pattern }
                } else {
                    DispatchOutcome::Stale
                };
            }
        }

        let key = SessionKey::new(volley.request.module_id(), volley.request.content_id());
        let modules = self.modules();
        let Some(spec) = modules.by_key.get(&key) else {
            let reset = self.retire(device_id).await;
            if volley.request.is_notify() {
                return DispatchOutcome::Ignored;
            }
            debug!(session.key = %key, session_reset = reset, "Request for unserved module");
            let generation = self.generation(device_id).await;
            self.send(device_id, generation, &ResponseEnvelope::fallback(&volley.request))
                .await;
            return DispatchOutcome::Fallback;
        };

        let (handle, generation) = match self.get_or_create(device_id, spec).await {
            Ok(found) => found,
            Err(e) => {
                error!(session.key = %key, error = %e, "Failed to create session");
                if volley.request.is_notify() {
                    return DispatchOutcome::Failed;
                }
                let resp = error_envelope(&volley.request, &e.to_string());
                let generation = self.generation(device_id).await;
                self.send(device_id, generation, &resp).await;
                return DispatchOutcome::Failed;
            }
        };

        if volley.request.is_notify() {
            handle.lock().await.ingest_notify(&volley).await;
            return DispatchOutcome::Notified { key };
        }

        let request = volley.request.clone();
        let markup = self.markup.clone();
        let work = async move {
            let mut volley = volley;
            handle.lock().await.handle_volley(&mut volley).await;
            if volley.response.output.markup_missing() {
                let rendered = markup.render(&volley.response.output.text, None);
                volley.response.output.markup = Some(rendered);
            }
            volley.response
        };
        let resp = match self.pool.run("volley", work).await {
            Ok(resp) => resp,
            Err(e) => {
                error!(session.key = %key, error = %e, "Volley handler failed");
                error_envelope(&request, &e.to_string())
            }
        };

        if self.send(device_id, generation, &resp).await {
            DispatchOutcome::Session { key }
        } else {
            DispatchOutcome::Stale
        }
    }

    /// Publish `resp` unless the device's generation moved past
    /// `generation`. The slot stays locked through the publish, so a
    /// retire cannot land between the check and the send.
    async fn send(&self, device_id: &str, generation: u64, resp: &ResponseEnvelope) -> bool {
        let slot = self.slot(device_id);
        let guard = slot.lock().await;
        if guard.generation != generation {
            debug!(
                device.id = device_id,
                generation,
                current = guard.generation,
                "Dropping stale response"
            );
            return false;
        }

        debug!(device.id = device_id, response = %resp.debug_string(), "Tx remote_chat");
        if let Err(e) = self
            .publisher
            .send_command(device_id, COMMAND_REMOTE_CHAT, &resp.to_json())
            .await
        {
            warn!(device.id = device_id, error = %e, "Failed to publish response");
        }
        drop(guard);
        true
    }
}

/// Speakable reply for an internal failure.
fn error_envelope(request: &DeviceRequest, message: &str) -> ResponseEnvelope {
    let text = format!("Error handling volley: {message}");
    let mut resp = ResponseEnvelope::new_response(request, Default::default());
    resp.set_output(&text, Some(&text), None);
    resp
}

/// Run a retired session's completion hook with its final local data.
async fn complete_session(device_id: String, key: SessionKey, handle: SessionHandle) {
    let mut session = handle.lock().await;
    if !session.has_complete_hook() {
        return;
    }
    debug!(device.id = %device_id, session.key = %key, "Running completion hook");
    let volley = Volley::data_only(Some(&device_id), session.local_data());
    session.complete_hook(volley).await;
}
