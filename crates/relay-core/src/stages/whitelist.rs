use async_trait::async_trait;
use tracing::info;

use crate::{
    config::WhitelistConfig,
    event::{Denial, MessageEvent, StopReason},
    pipeline::{context::PipelineContext, Stage, StageFlow},
    Result,
};

pub struct WhitelistStage {
    cfg: WhitelistConfig,
}

impl WhitelistStage {
    pub fn new(cfg: WhitelistConfig) -> Self {
        Self { cfg }
    }

    fn admin_exempt(&self, event: &MessageEvent) -> bool {
        event.is_admin()
            && if event.is_group() {
                self.cfg.ignore_admin_in_group
            } else {
                self.cfg.ignore_admin_in_direct
            }
    }

    fn listed(&self, event: &MessageEvent, ctx: &PipelineContext) -> bool {
        let origin = event.origin.to_string();
        self.cfg
            .entries
            .iter()
            .any(|e| *e == origin || e == event.session_id.as_str())
            || ctx.sessions.is_whitelisted(&event.session_id)
    }
}

#[async_trait]
impl Stage for WhitelistStage {
    fn name(&self) -> &'static str {
        "whitelist_check"
    }

    async fn process(&self, event: &mut MessageEvent, ctx: &PipelineContext) -> Result<StageFlow> {
        if self.cfg.bypass_when_addressed && event.is_at_or_wake {
            return Ok(StageFlow::Next);
        }
        if self.admin_exempt(event) || self.listed(event, ctx) {
            return Ok(StageFlow::Next);
        }

        if self.cfg.log {
            info!(
                origin = %event.origin,
                session = %event.session_id,
                sender = %event.sender_id,
                "not whitelisted; message ignored"
            );
        }
        event.stop(StopReason::Denied(Denial::Whitelist));
        Ok(StageFlow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ProfileConfig, stages::testing};

    fn stage(entries: &[&str]) -> WhitelistStage {
        WhitelistStage::new(WhitelistConfig {
            enabled: true,
            entries: entries.iter().map(|s| s.to_string()).collect(),
            log: false,
            ..WhitelistConfig::default()
        })
    }

    #[tokio::test]
    async fn unlisted_session_is_stopped_even_when_addressed() {
        let (ctx, _) = testing::ctx_with(ProfileConfig::default());
        let s = stage(&[]);

        let mut ev = testing::group("hi");
        s.process(&mut ev, &ctx).await.unwrap();
        assert_eq!(ev.stop_reason(), Some(&StopReason::Denied(Denial::Whitelist)));

        let mut ev = testing::group("hi");
        ev.is_at_or_wake = true;
        s.process(&mut ev, &ctx).await.unwrap();
        assert!(ev.is_stopped());
    }

    #[tokio::test]
    async fn bypass_flag_lets_addressed_messages_through() {
        let (ctx, _) = testing::ctx_with(ProfileConfig::default());
        let mut s = stage(&[]);
        s.cfg.bypass_when_addressed = true;

        let mut ev = testing::group("hi");
        ev.is_at_or_wake = true;
        s.process(&mut ev, &ctx).await.unwrap();
        assert!(!ev.is_stopped());
    }

    #[tokio::test]
    async fn configured_and_runtime_entries_pass() {
        let (ctx, _) = testing::ctx_with(ProfileConfig::default());
        let s = stage(&["test:group:g1"]);
        let mut ev = testing::group("hi");
        s.process(&mut ev, &ctx).await.unwrap();
        assert!(!ev.is_stopped());

        let s = stage(&[]);
        let mut ev = testing::direct("hi");
        ctx.sessions.set_whitelisted(&ev.session_id, true);
        s.process(&mut ev, &ctx).await.unwrap();
        assert!(!ev.is_stopped());
    }

    #[tokio::test]
    async fn admin_exemption_follows_chat_kind() {
        let (ctx, _) = testing::ctx_with(ProfileConfig::default());
        let mut s = stage(&[]);
        s.cfg.ignore_admin_in_group = false;

        let mut ev = testing::admin(testing::group("hi"));
        s.process(&mut ev, &ctx).await.unwrap();
        assert!(ev.is_stopped());

        let mut ev = testing::admin(testing::direct("hi"));
        s.process(&mut ev, &ctx).await.unwrap();
        assert!(!ev.is_stopped());
    }

    /// Collects formatted log output in memory.
    #[derive(Clone, Default)]
    struct LogBuf(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuf {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    async fn denied_log(log: bool) -> String {
        let buf = LogBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (ctx, _) = testing::ctx_with(ProfileConfig::default());
        let s = WhitelistStage::new(WhitelistConfig {
            enabled: true,
            log,
            ..WhitelistConfig::default()
        });
        let mut ev = testing::group("hi");
        s.process(&mut ev, &ctx).await.unwrap();
        assert_eq!(ev.stop_reason(), Some(&StopReason::Denied(Denial::Whitelist)));
        buf.text()
    }

    #[tokio::test]
    async fn denials_are_logged_only_when_asked() {
        assert!(!denied_log(false).await.contains("not whitelisted"));

        let logged = denied_log(true).await;
        assert!(logged.contains("not whitelisted; message ignored"));
        assert!(logged.contains("test:group:g1"));
    }
}
