use std::sync::Arc;

use anyhow::Context;
use teloxide::Bot;
use tracing::{error, info, warn};

use relay_core::{
    builtin::BuiltinPlugin,
    bus::EventBus,
    config::Config,
    messaging::{
        port::{PlatformPort, Platforms},
        throttled::{ThrottleConfig, ThrottledPlatform},
    },
    pipeline::Collaborators,
    plugin::{Plugin, PluginHost},
    registry::HandlerRegistry,
};
use relay_openai::OpenAiProvider;
use relay_telegram::{router::run_polling, TelegramPlatform};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_core::logging::init("relay")?;

    let cfg = Config::load().context("loading configuration")?;
    info!(
        profiles = cfg.profiles.profiles.len(),
        file = %cfg.profiles_file.display(),
        "configuration loaded"
    );

    let registry = Arc::new(HandlerRegistry::new());
    let platforms = Arc::new(Platforms::new());
    let mut shared = Collaborators::new(registry.clone(), platforms);

    match &cfg.openai_api_key {
        Some(key) => {
            let llm = OpenAiProvider::new(
                key.clone(),
                cfg.openai_base_url.clone(),
                cfg.openai_model.clone(),
                cfg.llm_timeout,
            )?;
            shared = shared.with_llm(Arc::new(llm));
        }
        None => warn!("OPENAI_API_KEY is not set; only command handlers will answer"),
    }

    let plugins = Arc::new(PluginHost::new(registry));
    let builtin = BuiltinPlugin::with_host(Arc::downgrade(&plugins));
    plugins
        .load_all(vec![Arc::new(builtin) as Arc<dyn Plugin>])
        .await?;

    let bus = Arc::new(
        EventBus::from_profiles(&cfg.profiles, &shared)?.with_session_idle(cfg.session_idle),
    );
    let runner = bus.clone();
    let dispatch = tokio::spawn(async move { runner.dispatch().await });

    let polling = match &cfg.telegram_bot_token {
        Some(token) => {
            let bot = Bot::new(token.clone());
            let raw: Arc<dyn PlatformPort> = Arc::new(TelegramPlatform::new(bot.clone()));
            bus.register_platform(Arc::new(ThrottledPlatform::new(raw, ThrottleConfig::default())))
                .await;

            let sender = bus.sender();
            let admins = cfg.admins.clone();
            let cancel = bus.cancellation();
            Some(tokio::spawn(async move {
                if let Err(e) = run_polling(bot, sender, admins, cancel).await {
                    error!(error = %e, "telegram polling failed");
                }
            }))
        }
        None => {
            warn!("TELEGRAM_BOT_TOKEN is not set; no platform is connected");
            None
        }
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");

    bus.shutdown(cfg.shutdown_grace).await;
    if let Some(polling) = polling {
        let _ = polling.await;
    }
    let _ = dispatch.await;
    Ok(())
}
