use std::sync::Arc;

use crate::{
    config::ProfileConfig,
    conversation::ConversationStore,
    messaging::port::Platforms,
    model::client::LlmProvider,
    registry::HandlerRegistry,
    safety::ContentClassifier,
    session::SessionStore,
};

/// Collaborators shared by every profile of one bot.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<HandlerRegistry>,
    pub platforms: Arc<Platforms>,
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub classifier: Option<Arc<dyn ContentClassifier>>,
}

impl Collaborators {
    pub fn new(registry: Arc<HandlerRegistry>, platforms: Arc<Platforms>) -> Self {
        Self {
            registry,
            platforms,
            llm: None,
            classifier: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ContentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }
}

/// What the stages of one profile's pipeline can reach.
///
/// Session state and conversation history are per profile: two personas
/// answering the same chat keep separate switches and histories.
pub struct PipelineContext {
    pub profile_name: String,
    pub profile: Arc<ProfileConfig>,
    pub registry: Arc<HandlerRegistry>,
    pub sessions: Arc<SessionStore>,
    pub conversations: Arc<ConversationStore>,
    pub platforms: Arc<Platforms>,
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub classifier: Option<Arc<dyn ContentClassifier>>,
}

impl PipelineContext {
    pub fn for_profile(
        profile_name: impl Into<String>,
        profile: ProfileConfig,
        shared: &Collaborators,
    ) -> Self {
        Self {
            profile_name: profile_name.into(),
            sessions: Arc::new(SessionStore::new(&profile.session)),
            conversations: Arc::new(ConversationStore::new(profile.process.max_context_turns)),
            profile: Arc::new(profile),
            registry: shared.registry.clone(),
            platforms: shared.platforms.clone(),
            llm: shared.llm.clone(),
            classifier: shared.classifier.clone(),
        }
    }
}
