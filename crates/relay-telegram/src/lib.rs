//! Telegram adapter (teloxide).
//!
//! Implements the `relay-core` `PlatformPort` over the Telegram Bot API and
//! feeds inbound updates into the event bus (see [`router`]).

use async_trait::async_trait;
use teloxide::prelude::*;
use tokio::time::sleep;

pub mod router;

use relay_core::{
    domain::Origin,
    errors::Error,
    event::{MediaRef, MessageResult},
    messaging::{port::PlatformPort, types::PlatformCapabilities},
    Result,
};

pub const PLATFORM: &str = "telegram";

const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Clone)]
pub struct TelegramPlatform {
    bot: Bot,
}

impl TelegramPlatform {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(origin: &Origin) -> Result<ChatId> {
        origin
            .chat_id
            .parse::<i64>()
            .map(ChatId)
            .map_err(|_| Error::Collaborator(format!("not a telegram chat: {origin}")))
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::Collaborator(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(teloxide::RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    sleep(d).await;
                }
                Err(other) => return Err(Self::map_err(other)),
            }
        }
    }
}

/// Media references are appended as plain lines; Telegram previews links.
fn render(result: &MessageResult) -> String {
    let mut text = result.text.clone();
    for media in &result.media {
        let (MediaRef::Image(r) | MediaRef::File(r)) = media;
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(r);
    }
    text
}

#[async_trait]
impl PlatformPort for TelegramPlatform {
    fn name(&self) -> &str {
        PLATFORM
    }

    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities {
            supports_images: false,
            supports_mentions: true,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }

    async fn send(&self, origin: &Origin, result: &MessageResult) -> Result<()> {
        let chat = Self::tg_chat(origin)?;
        let text = render(result);
        self.with_retry(|| self.bot.send_message(chat, text.clone()))
            .await?;
        Ok(())
    }
}
