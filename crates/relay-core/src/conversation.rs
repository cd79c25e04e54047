use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use crate::{domain::SessionId, model::types::ChatTurn};

/// Bounded per-session conversation history handed to the LLM.
///
/// Oldest turns are dropped first once `max_turns` is exceeded.
pub struct ConversationStore {
    max_turns: usize,
    turns: Mutex<HashMap<SessionId, VecDeque<ChatTurn>>>,
}

impl ConversationStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            turns: Mutex::new(HashMap::new()),
        }
    }

    pub fn contexts(&self, session: &SessionId) -> Vec<ChatTurn> {
        let map = self.turns.lock().unwrap_or_else(|e| e.into_inner());
        map.get(session)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record(&self, session: &SessionId, turns: impl IntoIterator<Item = ChatTurn>) {
        if self.max_turns == 0 {
            return;
        }
        let mut map = self.turns.lock().unwrap_or_else(|e| e.into_inner());
        let history = map.entry(session.clone()).or_default();
        history.extend(turns);
        while history.len() > self.max_turns {
            history.pop_front();
        }
    }

    pub fn clear(&self, session: &SessionId) {
        let mut map = self.turns.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(session);
    }
}
