use crate::Result;

/// Initialize tracing for the bot.
///
/// Default: info for our crates, warn for everything else. `RUST_LOG`
/// overrides the filter entirely. Calling this twice is harmless; the second
/// subscriber is ignored.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,relay=info,relay_core=info,relay_telegram=info,relay_openai=info,{service_name}=info"
        ))
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .try_init();

    Ok(())
}

/// Collapse newlines and cap the length of message text for log lines.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.lines().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let keep = max_chars.saturating_sub(3);
    format!("{}...", flat.chars().take(keep).collect::<String>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_flattens_and_truncates() {
        assert_eq!(preview("a\nb", 10), "a b");
        assert_eq!(preview("abcdefghij", 6), "abc...");
        assert_eq!(preview("héllo", 5), "héllo");
    }
}
