//! Cross-platform messaging ports (Telegram today; Discord/QQ/etc. behind the same trait).

pub mod port;
pub mod throttled;
pub mod types;
