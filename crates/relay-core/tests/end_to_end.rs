use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use relay_core::{
    builtin::BuiltinPlugin,
    bus::EventBus,
    config::{ProfileConfig, RateLimitStrategy, DEFAULT_PROFILE},
    domain::{MessageType, Origin},
    event::{Denial, InboundMessage, MessageEvent, MessageResult, StopReason},
    messaging::{
        port::{PlatformPort, Platforms},
        types::PlatformCapabilities,
    },
    pipeline::{Collaborators, PipelineContext, PipelineScheduler},
    plugin::{Plugin, PluginHost},
    registry::{
        handler_fn, EventType, Handler, HandlerCtx, HandlerMetadata, HandlerOutcome,
        HandlerRegistry, HandlerSet,
    },
    Result,
};
use tokio::sync::Barrier;

const PLATFORM: &str = "fake";

#[derive(Default)]
struct FakePlatform {
    sent: Mutex<Vec<(String, String)>>,
}

impl FakePlatform {
    fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl PlatformPort for FakePlatform {
    fn name(&self) -> &str {
        PLATFORM
    }

    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities::default()
    }

    async fn send(&self, origin: &Origin, result: &MessageResult) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((origin.to_string(), result.text.clone()));
        Ok(())
    }
}

struct Harness {
    shared: Collaborators,
    platform: Arc<FakePlatform>,
}

impl Harness {
    fn new() -> Self {
        let platform = Arc::new(FakePlatform::default());
        let platforms = Arc::new(Platforms::new());
        platforms.insert(platform.clone());
        Self {
            shared: Collaborators::new(Arc::new(HandlerRegistry::new()), platforms),
            platform,
        }
    }

    fn scheduler(&self, profile: ProfileConfig) -> Arc<PipelineScheduler> {
        let ctx = Arc::new(PipelineContext::for_profile(DEFAULT_PROFILE, profile, &self.shared));
        Arc::new(PipelineScheduler::build(ctx).unwrap())
    }

    fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.shared.registry
    }
}

fn group(text: &str) -> MessageEvent {
    let origin = Origin::new(PLATFORM, MessageType::Group, "-100");
    MessageEvent::from_inbound(InboundMessage::text(origin, "u1", text), DEFAULT_PROFILE)
}

fn direct_in(chat: &str, text: &str) -> InboundMessage {
    InboundMessage::text(Origin::new(PLATFORM, MessageType::Direct, chat), chat, text)
}

fn pong() -> Arc<dyn Handler> {
    handler_fn(|c| {
        c.reply("pong");
        Ok(HandlerOutcome::Continue)
    })
}

#[tokio::test]
async fn unaddressed_group_message_stops_at_waking_check() {
    let h = Harness::new();
    h.registry()
        .register(HandlerMetadata::new("echo", "echo", EventType::MessageReceived, handler_fn(|c| {
            c.reply("should not run");
            Ok(HandlerOutcome::Continue)
        })))
        .unwrap();
    let scheduler = h.scheduler(ProfileConfig::default());

    let mut ev = group("hello");
    scheduler.run(&mut ev).await;

    assert_eq!(
        ev.stop_reason(),
        Some(&StopReason::Denied(Denial::NotAddressed))
    );
    assert!(ev.result.is_none());
    assert!(h.platform.texts().is_empty());
}

#[tokio::test]
async fn direct_command_is_answered_by_its_handler() {
    let h = Harness::new();
    h.registry()
        .register(HandlerMetadata::command("demo", "ping", pong()).with_priority(10))
        .unwrap();
    let scheduler = h.scheduler(ProfileConfig::default());

    let mut ev = MessageEvent::from_inbound(direct_in("42", "/ping"), DEFAULT_PROFILE);
    scheduler.run(&mut ev).await;

    assert!(!ev.is_stopped());
    assert_eq!(ev.result, Some(MessageResult::text("pong")));
    assert_eq!(
        *h.platform.sent.lock().unwrap(),
        vec![("fake:direct:42".to_string(), "pong".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn burst_over_the_limit_is_discarded_through_the_bus() {
    let h = Harness::new();
    h.registry()
        .register(HandlerMetadata::command(
            "demo",
            "say",
            handler_fn(|c| {
                let text = c.args.join(" ");
                c.reply(text);
                Ok(HandlerOutcome::Continue)
            }),
        ))
        .unwrap();

    let mut profile = ProfileConfig::default();
    profile.rate_limit.count = 3;
    profile.rate_limit.window_secs = 5;
    profile.rate_limit.strategy = RateLimitStrategy::Discard;

    let bus = Arc::new(EventBus::new(&h.shared, DEFAULT_PROFILE));
    bus.add_profile(DEFAULT_PROFILE, h.scheduler(profile));
    let runner = bus.clone();
    let loop_handle = tokio::spawn(async move { runner.dispatch().await });

    let tx = bus.sender();
    for i in 1..=5 {
        tx.send(direct_in("7", &format!("/say {i}"))).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    bus.shutdown(Duration::from_secs(1)).await;
    loop_handle.await.unwrap();

    assert_eq!(h.platform.texts(), vec!["1", "2", "3"]);
}

fn say() -> Arc<dyn Handler> {
    handler_fn(|c| {
        let text = c.args.join(" ");
        c.reply(text);
        Ok(HandlerOutcome::Continue)
    })
}

async fn run_through_bus(h: &Harness, profile: ProfileConfig, texts: Vec<String>) {
    let bus = Arc::new(EventBus::new(&h.shared, DEFAULT_PROFILE));
    bus.add_profile(DEFAULT_PROFILE, h.scheduler(profile));
    let runner = bus.clone();
    let loop_handle = tokio::spawn(async move { runner.dispatch().await });

    let tx = bus.sender();
    for text in texts {
        tx.send(direct_in("7", &text)).unwrap();
    }
    // Let the loop dequeue everything before it is cancelled.
    tokio::time::sleep(Duration::from_millis(300)).await;
    bus.shutdown(Duration::from_secs(5)).await;
    loop_handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_burst_keeps_arrival_order_on_many_threads() {
    let h = Harness::new();
    h.registry()
        .register(HandlerMetadata::command("demo", "say", say()))
        .unwrap();

    let mut profile = ProfileConfig::default();
    profile.rate_limit.count = 3;
    profile.rate_limit.window_secs = 5;
    profile.rate_limit.strategy = RateLimitStrategy::Discard;

    let texts = (1..=5).map(|i| format!("/say {i}")).collect();
    run_through_bus(&h, profile, texts).await;

    assert_eq!(h.platform.texts(), vec!["1", "2", "3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_session_is_answered_in_order_on_many_threads() {
    let h = Harness::new();
    h.registry()
        .register(HandlerMetadata::command("demo", "say", say()))
        .unwrap();

    let mut profile = ProfileConfig::default();
    profile.rate_limit.enabled = false;

    let texts = (1..=20).map(|i| format!("/say {i}")).collect();
    run_through_bus(&h, profile, texts).await;

    let expected: Vec<String> = (1..=20).map(|i| i.to_string()).collect();
    assert_eq!(h.platform.texts(), expected);
}

#[tokio::test]
async fn whitelist_ignores_addressing_by_default() {
    let h = Harness::new();
    h.registry()
        .register(HandlerMetadata::command("demo", "ping", pong()))
        .unwrap();
    let mut profile = ProfileConfig::default();
    profile.whitelist.enabled = true;
    profile.whitelist.log = false;
    let scheduler = h.scheduler(profile);

    let mut ev = group("/ping");
    ev.is_at_or_wake = true;
    scheduler.run(&mut ev).await;

    assert_eq!(ev.stop_reason(), Some(&StopReason::Denied(Denial::Whitelist)));
    assert!(h.platform.texts().is_empty());
}

#[tokio::test]
async fn admin_can_whitelist_a_chat_at_runtime() {
    let h = Harness::new();
    PluginHost::new(h.registry().clone())
        .load_all(vec![Arc::new(BuiltinPlugin::new()) as Arc<dyn Plugin>])
        .await
        .unwrap();
    h.registry()
        .register(HandlerMetadata::command("demo", "ping", pong()))
        .unwrap();

    let mut profile = ProfileConfig::default();
    profile.whitelist.enabled = true;
    profile.whitelist.log = false;
    profile.process.llm_enabled = false;
    let scheduler = h.scheduler(profile);

    let mut ev = group("/wl");
    ev.sender_role = relay_core::domain::SenderRole::Admin;
    scheduler.run(&mut ev).await;

    let mut ev = group("/ping");
    scheduler.run(&mut ev).await;
    assert_eq!(h.platform.texts(), vec!["fake:group:-100 whitelisted.", "pong"]);
}

#[tokio::test]
async fn blocked_content_gets_a_forced_reply_despite_the_stop() {
    let h = Harness::new();
    let mut profile = ProfileConfig::default();
    profile.safety.keywords = vec!["forbidden".to_string()];
    profile.safety.blocked_reply = "blocked".to_string();
    profile.decorate.prefix = "[bot] ".to_string();
    let scheduler = h.scheduler(profile);

    let mut ev = group("/say forbidden things");
    ev.is_at_or_wake = true;
    scheduler.run(&mut ev).await;
    assert_eq!(ev.stop_reason(), Some(&StopReason::SafetyViolation));
    // Decoration wraps only the stages after it, so the stop came first.
    assert_eq!(h.platform.texts(), vec!["blocked"]);

    let mut quiet = group("forbidden");
    scheduler.run(&mut quiet).await;
    assert_eq!(h.platform.texts().len(), 1);
}

/// Parks every event inside the process stage until the test lets go.
struct Gate {
    arrived: Arc<Barrier>,
    release: Arc<Barrier>,
}

#[async_trait]
impl Handler for Gate {
    async fn handle(&self, _ctx: &mut HandlerCtx<'_>) -> Result<HandlerOutcome> {
        self.arrived.wait().await;
        self.release.wait().await;
        Ok(HandlerOutcome::Continue)
    }
}

fn tagged_set(tag: &'static str, gate: Option<Arc<dyn Handler>>) -> HandlerSet {
    let mut handlers = vec![HandlerMetadata::new(
        tag,
        "tag",
        EventType::MessageReceived,
        handler_fn(move |c| {
            c.reply(tag);
            Ok(HandlerOutcome::Continue)
        }),
    )];
    if let Some(gate) = gate {
        handlers.push(
            HandlerMetadata::new(tag, "gate", EventType::MessageReceived, gate).with_priority(10),
        );
    }
    HandlerSet::from_handlers(handlers).unwrap()
}

#[tokio::test]
async fn in_flight_events_keep_their_snapshot_across_a_reload() {
    const IN_FLIGHT: usize = 10;
    let h = Harness::new();
    let arrived = Arc::new(Barrier::new(IN_FLIGHT + 1));
    let release = Arc::new(Barrier::new(IN_FLIGHT + 1));
    let gate: Arc<dyn Handler> = Arc::new(Gate {
        arrived: arrived.clone(),
        release: release.clone(),
    });
    h.registry().swap(tagged_set("old", Some(gate)));

    let mut profile = ProfileConfig::default();
    profile.process.llm_enabled = false;
    let scheduler = h.scheduler(profile);

    let runs: Vec<_> = (0..IN_FLIGHT)
        .map(|i| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let mut ev = MessageEvent::from_inbound(
                    direct_in(&format!("c{i}"), "anything"),
                    DEFAULT_PROFILE,
                );
                scheduler.run(&mut ev).await;
                ev.result.map(|r| r.text)
            })
        })
        .collect();

    arrived.wait().await;
    h.registry().swap(tagged_set("new", None));
    release.wait().await;

    for run in runs {
        assert_eq!(run.await.unwrap().as_deref(), Some("old"));
    }

    let mut late = MessageEvent::from_inbound(direct_in("late", "anything"), DEFAULT_PROFILE);
    scheduler.run(&mut late).await;
    assert_eq!(late.result.map(|r| r.text).as_deref(), Some("new"));
}
