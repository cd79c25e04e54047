use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*, types::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::{
    bus::EventSender,
    domain::{MessageType, Origin, SenderRole},
    event::InboundMessage,
    logging::preview,
};

use crate::PLATFORM;

/// Shared state for the update handlers.
pub struct RouterState {
    pub sender: EventSender,
    pub admins: Vec<String>,
    pub bot_id: UserId,
    /// Without the leading `@`.
    pub bot_username: String,
}

/// Fields of a Telegram message the bot cares about.
#[derive(Clone, Debug, Default)]
pub struct Incoming {
    pub chat_id: i64,
    pub private: bool,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub text: String,
    pub reply_to_bot: bool,
}

/// Strip `@bot_username` mentions (including `/cmd@bot_username`) and report
/// whether there were any.
pub fn strip_mention(text: &str, bot_username: &str) -> (String, bool) {
    if bot_username.is_empty() {
        return (text.to_string(), false);
    }
    // Telegram usernames are ASCII.
    let needle = format!("@{bot_username}");
    let mut out = String::with_capacity(text.len());
    let mut found = false;
    let mut i = 0;
    while i < text.len() {
        let hit = text
            .get(i..i + needle.len())
            .is_some_and(|s| s.eq_ignore_ascii_case(&needle));
        if hit {
            found = true;
            i += needle.len();
            continue;
        }
        let Some(c) = text[i..].chars().next() else {
            break;
        };
        out.push(c);
        i += c.len_utf8();
    }
    if !found {
        return (text.to_string(), false);
    }
    let cleaned = out.split_whitespace().collect::<Vec<_>>().join(" ");
    (cleaned, true)
}

pub fn to_inbound(incoming: Incoming, bot_username: &str, admins: &[String]) -> InboundMessage {
    let message_type = if incoming.private {
        MessageType::Direct
    } else {
        MessageType::Group
    };
    let (text, mentioned) = strip_mention(&incoming.text, bot_username);
    let origin = Origin::new(PLATFORM, message_type, incoming.chat_id.to_string());
    let role = if admins.iter().any(|a| a == &incoming.sender_id) {
        SenderRole::Admin
    } else {
        SenderRole::Normal
    };

    let mut msg = InboundMessage::text(origin, incoming.sender_id, text)
        .with_role(role)
        .addressed(mentioned || incoming.reply_to_bot);
    msg.sender_name = incoming.sender_name;
    msg
}

async fn handle_message(msg: Message, state: Arc<RouterState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    if user.is_bot {
        return Ok(());
    }
    let Some(text) = msg.text().or_else(|| msg.caption()) else {
        return Ok(());
    };

    let reply_to_bot = msg
        .reply_to_message()
        .and_then(|m| m.from())
        .is_some_and(|u| u.id == state.bot_id);

    let incoming = Incoming {
        chat_id: msg.chat.id.0,
        private: msg.chat.is_private(),
        sender_id: user.id.0.to_string(),
        sender_name: user
            .username
            .clone()
            .or_else(|| Some(user.first_name.clone())),
        text: text.to_string(),
        reply_to_bot,
    };
    let inbound = to_inbound(incoming, &state.bot_username, &state.admins);
    debug!(
        origin = %inbound.origin,
        addressed = inbound.is_at_or_wake,
        text = %preview(&inbound.raw_text, 80),
        "telegram update"
    );

    if let Err(e) = state.sender.send(inbound) {
        warn!(error = %e, "dropping telegram update");
    }
    Ok(())
}

/// Long-poll Telegram and push every text message into the bus until
/// `cancel` fires.
pub async fn run_polling(
    bot: Bot,
    sender: EventSender,
    admins: Vec<String>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let me = bot.get_me().await?;
    let bot_username = me.username().to_string();
    info!(username = %bot_username, "telegram polling started");

    let state = Arc::new(RouterState {
        sender,
        admins,
        bot_id: me.user.id,
        bot_username,
    });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build();

    let token = dispatcher.shutdown_token();
    tokio::spawn(async move {
        cancel.cancelled().await;
        match token.shutdown() {
            Ok(done) => done.await,
            Err(e) => debug!(error = %e, "telegram dispatcher was idle"),
        }
    });

    dispatcher.dispatch().await;
    info!("telegram polling stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(text: &str, private: bool) -> Incoming {
        Incoming {
            chat_id: if private { 42 } else { -100 },
            private,
            sender_id: "42".to_string(),
            sender_name: Some("ann".to_string()),
            text: text.to_string(),
            reply_to_bot: false,
        }
    }

    #[test]
    fn strips_mentions_case_insensitively() {
        assert_eq!(
            strip_mention("@RelayBot hello there", "relaybot"),
            ("hello there".to_string(), true)
        );
        assert_eq!(
            strip_mention("/ping@relaybot now", "relaybot"),
            ("/ping now".to_string(), true)
        );
        assert_eq!(
            strip_mention("hello @someone", "relaybot"),
            ("hello @someone".to_string(), false)
        );
    }

    #[test]
    fn group_mention_is_addressed() {
        let msg = to_inbound(incoming("@relaybot hi", false), "relaybot", &[]);
        assert_eq!(msg.origin.to_string(), "telegram:group:-100");
        assert_eq!(msg.raw_text, "hi");
        assert!(msg.is_at_or_wake);
        assert_eq!(msg.sender_role, SenderRole::Normal);
    }

    #[test]
    fn reply_to_bot_is_addressed_and_admins_are_marked() {
        let mut inc = incoming("what about this", false);
        inc.reply_to_bot = true;
        let msg = to_inbound(inc, "relaybot", &["42".to_string()]);
        assert!(msg.is_at_or_wake);
        assert_eq!(msg.sender_role, SenderRole::Admin);
    }

    #[test]
    fn private_chat_maps_to_direct() {
        let msg = to_inbound(incoming("hey", true), "relaybot", &[]);
        assert_eq!(msg.message_type, MessageType::Direct);
        assert_eq!(msg.session_id.as_str(), "telegram:direct:42");
        assert!(!msg.is_at_or_wake);
    }
}
