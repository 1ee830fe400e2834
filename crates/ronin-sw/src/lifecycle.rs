//! Lifecycle Controller: drives a release through install, waiting,
//! activation and active control of clients.
//!
//! ```text
//! Uninstalled ──install──► Installing ──mandatory ok──► Waiting
//!                              └──mandatory failed──► Uninstalled
//! Waiting ──activate / SKIP_WAITING──► Activating ──reap──► Active
//! ```
//!
//! The registration keeps one generation per slot. A waiting generation is
//! activated once no attached client is still controlled by the active one,
//! or immediately on a `SKIP_WAITING` message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use hashbrown::HashMap;
use ronin_net::{Fetcher, NetError, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Release, SwConfig};
use crate::registry::GenerationRegistry;
use crate::router::{FetchRouter, Routed};
use crate::store::{CacheEntry, CacheStorage, GenerationId, RequestKey};
use crate::SwError;

// ==================== Types ====================

/// Identifier of an attached client (a page or tab).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// State of a worker generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    #[default]
    Uninstalled,
    /// Populating its generation.
    Installing,
    /// Installed, waiting for the old generation's clients to go away.
    Waiting,
    /// Being promoted; superseded generations are reaped.
    Activating,
    /// Current; intercepts requests for all claimed clients.
    Active,
}

/// Messages the controlling application can post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerMessage {
    /// Activate the waiting generation now.
    SkipWaiting,
}

/// Lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A generation changed state.
    StateChange {
        generation: GenerationId,
        state: WorkerState,
    },
    /// An install was aborted; the previous generation is unaffected.
    InstallFailed {
        generation: GenerationId,
        reason: String,
    },
    /// A generation became current.
    Promoted {
        generation: GenerationId,
        previous: Option<GenerationId>,
    },
    /// A superseded generation was deleted.
    Reaped { generation: GenerationId },
    /// A client is now controlled by a different generation.
    ControllerChange {
        client: ClientId,
        generation: GenerationId,
    },
}

/// Registration slots.
#[derive(Debug, Default)]
struct Slots {
    installing: Option<GenerationId>,
    waiting: Option<GenerationId>,
    activating: Option<GenerationId>,
    active: Option<GenerationId>,
}

// ==================== Controller ====================

/// Owns the registry and router for one client context.
pub struct LifecycleController {
    config: SwConfig,
    registry: GenerationRegistry,
    router: FetchRouter,
    fetcher: Arc<dyn Fetcher>,
    slots: Mutex<Slots>,
    /// Attached clients and the generation controlling each.
    clients: RwLock<HashMap<ClientId, Option<GenerationId>>>,
    /// Held shared by every routed fetch and exclusively across promote
    /// and reap, so no fetch reads a generation while it is deleted.
    routing: RwLock<()>,
    event_tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleController {
    /// Create a controller. The receiver yields [`LifecycleEvent`]s.
    pub fn new(
        config: SwConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let router = FetchRouter::new(
            config.routing.clone(),
            Arc::clone(&storage),
            Arc::clone(&fetcher),
        );

        (
            Self {
                config,
                registry: GenerationRegistry::new(storage),
                router,
                fetcher,
                slots: Mutex::new(Slots::default()),
                clients: RwLock::new(HashMap::new()),
                routing: RwLock::new(()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn config(&self) -> &SwConfig {
        &self.config
    }

    pub fn registry(&self) -> &GenerationRegistry {
        &self.registry
    }

    /// State of the newest worker in the registration.
    pub async fn state(&self) -> WorkerState {
        let slots = self.slots.lock().await;
        if slots.installing.is_some() {
            WorkerState::Installing
        } else if slots.activating.is_some() {
            WorkerState::Activating
        } else if slots.waiting.is_some() {
            WorkerState::Waiting
        } else if slots.active.is_some() {
            WorkerState::Active
        } else {
            WorkerState::Uninstalled
        }
    }

    /// State of a specific generation.
    pub async fn state_of(&self, generation: &GenerationId) -> WorkerState {
        let slots = self.slots.lock().await;
        let is = |slot: &Option<GenerationId>| slot.as_ref() == Some(generation);
        if is(&slots.installing) {
            WorkerState::Installing
        } else if is(&slots.activating) {
            WorkerState::Activating
        } else if is(&slots.waiting) {
            WorkerState::Waiting
        } else if is(&slots.active) {
            WorkerState::Active
        } else {
            WorkerState::Uninstalled
        }
    }

    pub async fn active_generation(&self) -> Option<GenerationId> {
        self.slots.lock().await.active.clone()
    }

    pub async fn waiting_generation(&self) -> Option<GenerationId> {
        self.slots.lock().await.waiting.clone()
    }

    // ---------- install ----------

    /// Install the configured release.
    pub async fn install(&self) -> Result<GenerationId, SwError> {
        let release = self.config.release.clone();
        self.install_release(&release).await
    }

    /// Install `release` into a fresh generation.
    ///
    /// All mandatory assets must be fetched and stored, otherwise the new
    /// generation is discarded and the error returned; the current
    /// generation keeps serving either way. On success the generation waits,
    /// and is activated straight away if nothing holds it back.
    pub async fn install_release(&self, release: &Release) -> Result<GenerationId, SwError> {
        let id = release.version.clone();
        if self.registry.current().await.as_ref() == Some(&id) {
            info!(generation = %id, "Generation already current, nothing to install");
            return Err(SwError::GenerationInUse(id));
        }

        {
            let mut slots = self.slots.lock().await;
            if let Some(other) = &slots.installing {
                return Err(SwError::StateError(format!(
                    "install of {} already in progress",
                    other
                )));
            }
            slots.installing = Some(id.clone());
        }
        self.emit_state(&id, WorkerState::Installing);

        if let Err(err) = self.populate(release).await {
            self.abort_install(&id, &err).await;
            return Err(err);
        }

        let superseded = {
            let mut slots = self.slots.lock().await;
            slots.installing = None;
            slots.waiting.replace(id.clone())
        };
        if let Some(old) = superseded.filter(|old| old != &id) {
            info!(generation = %old, replacement = %id, "Waiting generation superseded");
            if let Err(err) = self.registry.discard(&old).await {
                warn!(generation = %old, error = %err, "Failed to discard superseded generation");
            }
            self.emit_state(&old, WorkerState::Uninstalled);
        }
        self.emit_state(&id, WorkerState::Waiting);

        if self.config.skip_waiting_after_install {
            self.skip_waiting().await?;
        } else {
            self.activate().await?;
        }
        Ok(id)
    }

    async fn populate(&self, release: &Release) -> Result<(), SwError> {
        let id = &release.version;
        let handle = self.registry.begin_install(id).await?;
        let storage = self.registry.storage();
        info!(
            generation = %id,
            mandatory = release.manifest.mandatory.len(),
            best_effort = release.manifest.best_effort.len(),
            "Installing generation"
        );

        let mandatory = release
            .manifest
            .mandatory
            .iter()
            .map(|path| self.config.resolve(path))
            .collect::<Result<Vec<_>, _>>()?;
        let fetched = try_join_all(mandatory.into_iter().map(|url| self.fetch_asset(id, url))).await?;
        for (url, response) in fetched {
            storage
                .put(&handle, RequestKey::get(&url), CacheEntry::capture(&response))
                .await?;
        }

        let best_effort = join_all(release.manifest.best_effort.iter().map(|path| async move {
            let url = self.config.resolve(path)?;
            self.fetch_asset(id, url).await
        }))
        .await;
        for (path, result) in release.manifest.best_effort.iter().zip(best_effort) {
            let stored = match result {
                Ok((url, response)) => {
                    storage
                        .put(&handle, RequestKey::get(&url), CacheEntry::capture(&response))
                        .await
                }
                Err(err) => Err(err),
            };
            if let Err(err) = stored {
                info!(generation = %id, asset = %path, error = %err, "Best-effort asset skipped (offline install)");
            }
        }

        self.registry.commit_install(id).await?;
        info!(generation = %id, "Install complete");
        Ok(())
    }

    /// Fetch one install asset; transport errors and non-2xx both fail it.
    async fn fetch_asset(
        &self,
        generation: &GenerationId,
        url: Url,
    ) -> Result<(Url, Response), SwError> {
        let failed = |reason: String| SwError::InstallFailed {
            generation: generation.clone(),
            asset: url.to_string(),
            reason,
        };
        let response = self
            .fetcher
            .fetch(Request::get(url.clone()))
            .await
            .map_err(|err: NetError| failed(err.to_string()))?;
        if !response.ok() {
            return Err(failed(format!("HTTP {}", response.status)));
        }
        Ok((url, response))
    }

    async fn abort_install(&self, id: &GenerationId, err: &SwError) {
        warn!(generation = %id, error = %err, "Install failed, keeping previous generation");
        match self.registry.discard(id).await {
            Ok(_) | Err(SwError::GenerationInUse(_)) => {}
            Err(discard_err) => {
                warn!(generation = %id, error = %discard_err, "Failed to discard aborted generation")
            }
        }
        {
            let mut slots = self.slots.lock().await;
            slots.installing = None;
            // A same-id reinstall wiped the waiting copy.
            if slots.waiting.as_ref() == Some(id) {
                slots.waiting = None;
            }
        }
        self.emit(LifecycleEvent::InstallFailed {
            generation: id.clone(),
            reason: err.to_string(),
        });
        self.emit_state(id, WorkerState::Uninstalled);
    }

    // ---------- activation ----------

    /// Activate the waiting generation if no attached client is still
    /// controlled by the active one. Returns whether activation happened.
    pub async fn activate(&self) -> Result<bool, SwError> {
        let mut slots = self.slots.lock().await;
        let Some(waiting) = slots.waiting.clone() else {
            return Ok(false);
        };

        if let Some(active) = &slots.active {
            let held = self
                .clients
                .read()
                .await
                .values()
                .filter(|controller| controller.as_ref() == Some(active))
                .count();
            if held > 0 {
                debug!(generation = %waiting, active = %active, clients = held, "Generation waiting for clients to detach");
                return Ok(false);
            }
        }

        self.activate_waiting(&mut slots).await?;
        Ok(true)
    }

    /// Activate the waiting generation regardless of attached clients.
    ///
    /// Pages still running assets of the old generation may then load
    /// assets of the new one.
    pub async fn skip_waiting(&self) -> Result<bool, SwError> {
        let mut slots = self.slots.lock().await;
        match &slots.waiting {
            Some(waiting) => info!(generation = %waiting, "Skipping wait"),
            None => {
                debug!("Skip waiting requested with nothing waiting");
                return Ok(false);
            }
        }
        self.activate_waiting(&mut slots).await?;
        Ok(true)
    }

    async fn activate_waiting(&self, slots: &mut Slots) -> Result<(), SwError> {
        let Some(id) = slots.waiting.take() else {
            return Ok(());
        };
        slots.activating = Some(id.clone());
        self.emit_state(&id, WorkerState::Activating);

        // Waits for in-flight fetches on the old generation to finish.
        let routing = self.routing.write().await;
        let previous = match self.registry.promote(&id).await {
            Ok(previous) => previous,
            Err(err) => {
                warn!(generation = %id, error = %err, "Promotion failed");
                drop(routing);
                slots.activating = None;
                self.emit_state(&id, WorkerState::Uninstalled);
                return Err(err);
            }
        };
        slots.active = Some(id.clone());
        self.emit(LifecycleEvent::Promoted {
            generation: id.clone(),
            previous,
        });

        match self.registry.reap(&id).await {
            Ok(reaped) => {
                for generation in reaped {
                    self.emit(LifecycleEvent::Reaped { generation });
                }
            }
            Err(err) => warn!(generation = %id, error = %err, "Reaping old generations failed"),
        }
        drop(routing);

        self.claim(&id).await;
        slots.activating = None;
        self.emit_state(&id, WorkerState::Active);
        Ok(())
    }

    /// Take control of every attached client.
    async fn claim(&self, generation: &GenerationId) {
        let mut clients = self.clients.write().await;
        for (client, controller) in clients.iter_mut() {
            if controller.as_ref() != Some(generation) {
                *controller = Some(generation.clone());
                self.emit(LifecycleEvent::ControllerChange {
                    client: *client,
                    generation: generation.clone(),
                });
            }
        }
    }

    /// Re-adopt the configured release from a persistent store.
    ///
    /// Returns `false` when the store does not hold it.
    pub async fn resume(&self) -> Result<bool, SwError> {
        let id = self.config.release.version.clone();
        self.resume_from(&id).await
    }

    /// Re-adopt `id` from a persistent store as the active generation.
    pub async fn resume_from(&self, id: &GenerationId) -> Result<bool, SwError> {
        let mut slots = self.slots.lock().await;
        if slots.active.as_ref() == Some(id) {
            return Ok(true);
        }
        if !self.registry.storage().contains(id).await? {
            debug!(generation = %id, "Nothing to resume");
            return Ok(false);
        }

        self.registry.adopt(id).await?;
        slots.active = Some(id.clone());
        self.emit_state(id, WorkerState::Active);
        Ok(true)
    }

    // ---------- messages ----------

    /// Handle a JSON message from the page. Unknown messages are ignored.
    pub async fn post_message(&self, message: &str) -> Result<bool, SwError> {
        match serde_json::from_str::<ControllerMessage>(message) {
            Ok(message) => self.handle_message(message).await,
            Err(err) => {
                debug!(error = %err, "Ignoring unrecognized message");
                Ok(false)
            }
        }
    }

    pub async fn handle_message(&self, message: ControllerMessage) -> Result<bool, SwError> {
        match message {
            ControllerMessage::SkipWaiting => self.skip_waiting().await,
        }
    }

    // ---------- clients ----------

    /// Attach a client; it is controlled by the current generation, if any.
    pub async fn attach_client(&self) -> ClientId {
        let client = ClientId::new();
        let controller = self.registry.current().await;
        debug!(client = client.raw(), controller = ?controller.as_ref().map(|g| g.as_str()), "Client attached");
        self.clients.write().await.insert(client, controller);
        client
    }

    /// Detach a client. Returns whether a waiting generation got activated.
    pub async fn detach_client(&self, client: ClientId) -> Result<bool, SwError> {
        if self.clients.write().await.remove(&client).is_none() {
            return Ok(false);
        }
        debug!(client = client.raw(), "Client detached");
        self.activate().await
    }

    pub async fn controlled_by(&self, client: ClientId) -> Option<GenerationId> {
        self.clients.read().await.get(&client).cloned().flatten()
    }

    // ---------- fetch ----------

    /// Route a request against the current generation.
    ///
    /// Activation waits for routed requests to finish before it reaps, and
    /// requests arriving meanwhile are routed once the new generation is
    /// current. Background refreshes are not waited for.
    pub async fn handle_fetch(&self, request: Request) -> Result<Routed, NetError> {
        let _routing = self.routing.read().await;
        let handle = self.registry.current_handle().await;
        self.router.route(handle.as_ref(), request).await
    }

    fn emit_state(&self, generation: &GenerationId, state: WorkerState) {
        self.emit(LifecycleEvent::StateChange {
            generation: generation.clone(),
            state,
        });
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssetManifest;
    use crate::store::MemoryCacheStorage;
    use async_trait::async_trait;
    use http::StatusCode;

    /// Serves a fixed body for every URL under `https://maths.test/`.
    struct OriginOnly;

    #[async_trait]
    impl Fetcher for OriginOnly {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            if request.url.host_str() == Some("maths.test") {
                let body = format!("body of {}", request.url.path());
                Ok(Response::new(request.url, StatusCode::OK, Default::default(), body))
            } else {
                Err(NetError::RequestFailed("offline".into()))
            }
        }
    }

    fn controller(skip: bool) -> (LifecycleController, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let mut config = SwConfig::new(Url::parse("https://maths.test/").unwrap());
        config.skip_waiting_after_install = skip;
        LifecycleController::new(config, Arc::new(MemoryCacheStorage::new()), Arc::new(OriginOnly))
    }

    fn release(version: &str) -> Release {
        Release::new(version, AssetManifest::default())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_skip_waiting_message_format() {
        let message: ControllerMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
        assert_eq!(message, ControllerMessage::SkipWaiting);
        assert!(serde_json::from_str::<ControllerMessage>(r#"{"type":"RELOAD"}"#).is_err());
    }

    #[test]
    fn test_client_ids_unique() {
        assert_ne!(ClientId::new(), ClientId::new());
    }

    #[tokio::test]
    async fn test_first_install_activates() {
        let (controller, mut rx) = controller(false);
        assert_eq!(controller.state().await, WorkerState::Uninstalled);

        let id = controller.install().await.unwrap();
        assert_eq!(id.as_str(), "ronins-maths-v4.0");
        assert_eq!(controller.state().await, WorkerState::Active);
        assert_eq!(controller.registry().current().await, Some(id.clone()));

        let states: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                LifecycleEvent::StateChange { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                WorkerState::Installing,
                WorkerState::Waiting,
                WorkerState::Activating,
                WorkerState::Active
            ]
        );
    }

    #[tokio::test]
    async fn test_update_waits_for_clients() {
        let (controller, _rx) = controller(false);
        controller.install_release(&release("v1")).await.unwrap();
        let client = controller.attach_client().await;
        assert_eq!(controller.controlled_by(client).await, Some(GenerationId::from("v1")));

        controller.install_release(&release("v2")).await.unwrap();
        assert_eq!(controller.state_of(&"v2".into()).await, WorkerState::Waiting);
        assert_eq!(controller.active_generation().await, Some(GenerationId::from("v1")));

        assert!(controller.detach_client(client).await.unwrap());
        assert_eq!(controller.active_generation().await, Some(GenerationId::from("v2")));
        assert_eq!(
            controller.registry().storage().generations().await.unwrap(),
            vec![GenerationId::from("v2")]
        );
    }

    #[tokio::test]
    async fn test_skip_waiting_claims_clients() {
        let (controller, mut rx) = controller(false);
        controller.install_release(&release("v1")).await.unwrap();
        let client = controller.attach_client().await;
        controller.install_release(&release("v2")).await.unwrap();
        drain(&mut rx);

        assert!(controller.post_message(r#"{"type":"SKIP_WAITING"}"#).await.unwrap());
        assert_eq!(controller.controlled_by(client).await, Some(GenerationId::from("v2")));

        let events = drain(&mut rx);
        assert!(events.contains(&LifecycleEvent::Reaped {
            generation: "v1".into()
        }));
        assert!(events.contains(&LifecycleEvent::ControllerChange {
            client,
            generation: "v2".into()
        }));
    }

    #[tokio::test]
    async fn test_unknown_message_ignored() {
        let (controller, _rx) = controller(false);
        assert!(!controller.post_message(r#"{"type":"PING"}"#).await.unwrap());
        assert!(!controller.post_message("not json").await.unwrap());
    }

    #[tokio::test]
    async fn test_newer_waiting_replaces_older() {
        let (controller, _rx) = controller(false);
        controller.install_release(&release("v1")).await.unwrap();
        let _client = controller.attach_client().await;
        controller.install_release(&release("v2")).await.unwrap();
        controller.install_release(&release("v3")).await.unwrap();

        assert_eq!(controller.waiting_generation().await, Some(GenerationId::from("v3")));
        assert!(!controller.registry().storage().contains(&"v2".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_install_reports_and_resets() {
        let (controller, mut rx) = controller(false);
        let broken = Release::new(
            "v1",
            AssetManifest {
                mandatory: vec!["https://elsewhere.test/app.js".into()],
                best_effort: Vec::new(),
            },
        );

        let err = controller.install_release(&broken).await.unwrap_err();
        assert!(matches!(err, SwError::InstallFailed { .. }));
        assert_eq!(controller.state().await, WorkerState::Uninstalled);
        assert!(controller.registry().storage().generations().await.unwrap().is_empty());
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, LifecycleEvent::InstallFailed { .. })));
    }

    #[tokio::test]
    async fn test_reinstall_current_rejected() {
        let (controller, _rx) = controller(true);
        controller.install().await.unwrap();
        assert!(matches!(
            controller.install().await,
            Err(SwError::GenerationInUse(_))
        ));
        assert_eq!(controller.state().await, WorkerState::Active);
    }

    #[tokio::test]
    async fn test_fetch_passes_through_before_activation() {
        let (controller, _rx) = controller(false);
        let routed = controller
            .handle_fetch(Request::get(Url::parse("https://maths.test/index.html").unwrap()))
            .await
            .unwrap();
        assert_eq!(routed.policy, crate::RoutingPolicy::Bypass);
        assert!(controller.registry().storage().generations().await.unwrap().is_empty());
    }
}
