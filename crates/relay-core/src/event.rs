use std::fmt;

use chrono::{DateTime, Utc};

use crate::domain::{MessageType, Origin, SenderRole, SessionId};

/// Normalized inbound record pushed by platform adapters.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub origin: Origin,
    pub session_id: SessionId,
    pub platform_name: String,
    pub message_type: MessageType,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub sender_role: SenderRole,
    pub raw_text: String,
    pub image_refs: Vec<String>,
    pub is_at_or_wake: bool,
}

impl InboundMessage {
    /// Plain text message; the session id is derived from the origin.
    pub fn text(origin: Origin, sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: SessionId::from_origin(&origin),
            platform_name: origin.platform.clone(),
            message_type: origin.message_type,
            origin,
            sender_id: sender_id.into(),
            sender_name: None,
            sender_role: SenderRole::Normal,
            raw_text: text.into(),
            image_refs: Vec::new(),
            is_at_or_wake: false,
        }
    }

    pub fn with_role(mut self, role: SenderRole) -> Self {
        self.sender_role = role;
        self
    }

    pub fn addressed(mut self, is_at_or_wake: bool) -> Self {
        self.is_at_or_wake = is_at_or_wake;
        self
    }
}

/// Media attached to a reply. Platforms decide how to render the reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaRef {
    Image(String),
    File(String),
}

/// Output payload built by the process stage and edited by decoration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageResult {
    pub text: String,
    pub media: Vec<MediaRef>,
    /// Deliver even if the event ends up stopped.
    pub force: bool,
}

impl MessageResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn forced(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            force: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.media.is_empty()
    }
}

/// Why an admission stage turned an event away. Always silent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Denial {
    Whitelist,
    RateLimited,
    SessionDisabled,
    NotAddressed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    Denied(Denial),
    SafetyViolation,
    /// A handler consumed the event and asked the pipeline to stop.
    Handled,
    StageFailed {
        stage: &'static str,
    },
    Collaborator,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Denied(d) => write!(f, "denied ({d:?})"),
            StopReason::SafetyViolation => f.write_str("safety violation"),
            StopReason::Handled => f.write_str("handled"),
            StopReason::StageFailed { stage } => write!(f, "stage {stage} failed"),
            StopReason::Collaborator => f.write_str("collaborator failure"),
        }
    }
}

/// The unit of work flowing through a pipeline.
///
/// Owned by exactly one pipeline run; stages get `&mut` access in turn.
#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub origin: Origin,
    pub session_id: SessionId,
    pub platform_name: String,
    pub message_type: MessageType,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub sender_role: SenderRole,
    pub raw_text: String,
    /// Working text: `raw_text` minus any wake prefix.
    pub text: String,
    /// The wake prefix the waking stage stripped from `text`, if any.
    pub wake_prefix: Option<String>,
    pub image_refs: Vec<String>,
    pub is_at_or_wake: bool,
    pub profile: String,
    pub received_at: DateTime<Utc>,
    pub result: Option<MessageResult>,
    stopped: Option<StopReason>,
}

impl MessageEvent {
    pub fn from_inbound(msg: InboundMessage, profile: impl Into<String>) -> Self {
        Self {
            text: msg.raw_text.clone(),
            wake_prefix: None,
            origin: msg.origin,
            session_id: msg.session_id,
            platform_name: msg.platform_name,
            message_type: msg.message_type,
            sender_id: msg.sender_id,
            sender_name: msg.sender_name,
            sender_role: msg.sender_role,
            raw_text: msg.raw_text,
            image_refs: msg.image_refs,
            is_at_or_wake: msg.is_at_or_wake,
            profile: profile.into(),
            received_at: Utc::now(),
            result: None,
            stopped: None,
        }
    }

    /// Stop the event. The first reason wins.
    pub fn stop(&mut self, reason: StopReason) {
        if self.stopped.is_none() {
            self.stopped = Some(reason);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stopped.as_ref()
    }

    pub fn set_result(&mut self, result: MessageResult) {
        self.result = Some(result);
    }

    /// Text after the command prefix, or `None` if the message is not a
    /// command. A stripped wake prefix equal to the command prefix counts.
    pub fn command_body(&self, command_prefix: &str) -> Option<&str> {
        let text = self.text.trim_start();
        if command_prefix.is_empty() {
            return Some(text);
        }
        if let Some(rest) = text.strip_prefix(command_prefix) {
            return Some(rest);
        }
        (self.wake_prefix.as_deref() == Some(command_prefix)).then_some(text)
    }

    pub fn is_admin(&self) -> bool {
        self.sender_role == SenderRole::Admin
    }

    pub fn is_group(&self) -> bool {
        self.message_type == MessageType::Group
    }

    /// Whether the current result must reach the platform.
    pub fn should_deliver(&self) -> bool {
        match &self.result {
            Some(r) if !r.is_empty() => !self.is_stopped() || r.force,
            _ => false,
        }
    }
}
