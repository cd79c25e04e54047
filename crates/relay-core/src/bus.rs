//! Ingress: one queue fed by every platform adapter, one dispatch loop that
//! hands each event to a worker owning its session's queue. Events of one
//! session run in arrival order; sessions run in parallel.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::BotProfiles,
    domain::SessionId,
    event::{InboundMessage, MessageEvent},
    messaging::port::{PlatformPort, Platforms},
    pipeline::{Collaborators, PipelineContext, PipelineScheduler},
    registry::{dispatch, EventType, HandlerCtx, HandlerPayload, HandlerRegistry, PluginFilter},
    Error, Result,
};

/// Per-session FIFOs, keyed by profile and session.
type SessionQueues = HashMap<(String, SessionId), mpsc::UnboundedSender<MessageEvent>>;

const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(600);

/// Cloneable handle adapters use to push inbound messages.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl EventSender {
    pub fn send(&self, msg: InboundMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::Collaborator("event bus is closed".to_string()))
    }
}

pub struct EventBus {
    registry: Arc<HandlerRegistry>,
    platforms: Arc<Platforms>,
    default_profile: String,
    profiles: RwLock<HashMap<String, Arc<PipelineScheduler>>>,
    routes: RwLock<HashMap<String, String>>,
    tx: mpsc::UnboundedSender<InboundMessage>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    cancel: CancellationToken,
    grace: Mutex<Duration>,
    session_idle: Duration,
    running: AtomicBool,
    drained: watch::Sender<bool>,
}

impl EventBus {
    pub fn new(shared: &Collaborators, default_profile: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (drained, _) = watch::channel(false);
        Self {
            registry: shared.registry.clone(),
            platforms: shared.platforms.clone(),
            default_profile: default_profile.into(),
            profiles: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            grace: Mutex::new(Duration::from_secs(5)),
            session_idle: DEFAULT_SESSION_IDLE,
            running: AtomicBool::new(false),
            drained,
        }
    }

    /// How long a session worker waits for its next event before it exits
    /// and releases the session's resources.
    pub fn with_session_idle(mut self, idle: Duration) -> Self {
        self.session_idle = idle;
        self
    }

    /// Build one scheduler per configured profile plus the platform routes.
    pub fn from_profiles(profiles: &BotProfiles, shared: &Collaborators) -> Result<Self> {
        let bus = Self::new(shared, profiles.default_profile.clone());
        for (name, profile) in &profiles.profiles {
            let ctx = Arc::new(PipelineContext::for_profile(
                name.clone(),
                profile.clone(),
                shared,
            ));
            bus.add_profile(name.clone(), Arc::new(PipelineScheduler::build(ctx)?));
        }
        for (platform, profile) in &profiles.routes {
            bus.route(platform.clone(), profile.clone());
        }
        Ok(bus)
    }

    /// Add or replace the scheduler serving `name`.
    pub fn add_profile(&self, name: impl Into<String>, scheduler: Arc<PipelineScheduler>) {
        let name = name.into();
        info!(profile = %name, stages = ?scheduler.stage_names(), "profile ready");
        self.profiles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, scheduler);
    }

    pub fn route(&self, platform: impl Into<String>, profile: impl Into<String>) {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(platform.into(), profile.into());
    }

    pub fn scheduler_for(&self, platform: &str) -> Option<Arc<PipelineScheduler>> {
        let name = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(platform)
            .cloned()
            .unwrap_or_else(|| self.default_profile.clone());
        let profiles = self.profiles.read().unwrap_or_else(|e| e.into_inner());
        profiles
            .get(&name)
            .or_else(|| profiles.get(&self.default_profile))
            .cloned()
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub fn platforms(&self) -> &Arc<Platforms> {
        &self.platforms
    }

    /// Make a platform available for replies and notify `PlatformLoaded`
    /// subscribers.
    pub async fn register_platform(&self, port: Arc<dyn PlatformPort>) {
        let name = port.name().to_string();
        self.platforms.insert(port);
        info!(platform = %name, "platform registered");

        let hooks = self
            .registry
            .snapshot()
            .lookup(EventType::PlatformLoaded, &PluginFilter::All);
        let mut hctx =
            HandlerCtx::new(EventType::PlatformLoaded).with_payload(HandlerPayload::Platform(&name));
        if let Err(e) = dispatch(&hooks, &mut hctx).await {
            warn!(platform = %name, error = %e, "platform-loaded hook failed");
        }
    }

    /// Long-running dispatch loop. Returns after [`EventBus::shutdown`],
    /// once in-flight runs finished or the grace period ran out.
    pub async fn dispatch(&self) {
        let Some(mut rx) = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            warn!("dispatch loop already started");
            return;
        };
        self.running.store(true, Ordering::SeqCst);
        info!("event bus dispatching");

        let mut runs = JoinSet::new();
        let mut queues = SessionQueues::new();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(res) = runs.join_next(), if !runs.is_empty() => report(res),
                msg = rx.recv() => match msg {
                    Some(msg) => self.enqueue(&mut queues, &mut runs, msg),
                    None => break,
                },
            }
        }
        // Workers finish what is queued, then see their channel close.
        drop(queues);

        let grace = *self.grace.lock().unwrap_or_else(|e| e.into_inner());
        info!(in_flight = runs.len(), grace_ms = grace.as_millis() as u64, "event bus draining");
        let drain = async {
            while let Some(res) = runs.join_next().await {
                report(res);
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(aborted = runs.len(), "grace period elapsed; aborting pipeline runs");
            runs.shutdown().await;
        }
        self.drained.send_replace(true);
        info!("event bus stopped");
    }

    fn enqueue(&self, queues: &mut SessionQueues, runs: &mut JoinSet<()>, msg: InboundMessage) {
        let Some(scheduler) = self.scheduler_for(&msg.platform_name) else {
            warn!(platform = %msg.platform_name, origin = %msg.origin, "no profile for platform; dropping message");
            return;
        };
        let profile = scheduler.context().profile_name.clone();
        let event = MessageEvent::from_inbound(msg, profile.clone());
        debug!(origin = %event.origin, profile = %profile, "event dequeued");

        let key = (profile, event.session_id.clone());
        let event = match queues.get(&key) {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                // The worker went idle and closed its queue.
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        queues.retain(|_, tx| !tx.is_closed());
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(event).is_err() {
            return;
        }
        queues.insert(key.clone(), tx);
        runs.spawn(session_worker(scheduler, key.1, rx, self.session_idle));
    }

    /// Stop accepting events and wait up to `grace` for in-flight runs.
    pub async fn shutdown(&self, grace: Duration) {
        *self.grace.lock().unwrap_or_else(|e| e.into_inner()) = grace;
        self.cancel.cancel();
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let mut drained = self.drained.subscribe();
        let slack = Duration::from_millis(500);
        if tokio::time::timeout(grace + slack, drained.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!("event bus did not drain in time");
        }
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Runs one session's events in order. After `idle` without work it closes
/// its queue, runs anything that slipped in, and releases the session.
async fn session_worker(
    scheduler: Arc<PipelineScheduler>,
    session: SessionId,
    mut rx: mpsc::UnboundedReceiver<MessageEvent>,
    idle: Duration,
) {
    let sessions = scheduler.context().sessions.clone();
    loop {
        match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(mut event)) => {
                let _turn = sessions.lock_session(&session).await;
                scheduler.run(&mut event).await;
            }
            Ok(None) => break,
            Err(_) => {
                // Closing under the lock queues a successor worker behind
                // the leftovers.
                let _turn = sessions.lock_session(&session).await;
                rx.close();
                while let Ok(mut event) = rx.try_recv() {
                    scheduler.run(&mut event).await;
                }
                break;
            }
        }
    }
    debug!(session = %session, "session worker idle");
    sessions.release(&session);
    scheduler.release_session(&session);
}

fn report(res: std::result::Result<(), JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            error!(error = %e, "pipeline run panicked");
        } else {
            debug!(error = %e, "pipeline run cancelled");
        }
    }
}
