//! Chat transcript and turn state.
//!
//! A turn moves `Idle -> Sending -> Streaming -> Idle`; every transition has
//! exactly one entry point on [`ChatState`], so a delta can never land while
//! idle and a second turn can never start while one is in flight.

use chrono::{SecondsFormat, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::protocol::{ChatMessage, ChatSession, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    /// Request sent, no delta yet.
    Sending { reply_id: String },
    /// At least one delta has been appended to the reply.
    Streaming { reply_id: String },
}

impl TurnPhase {
    fn reply_id(&self) -> Option<&str> {
        match self {
            TurnPhase::Idle => None,
            TurnPhase::Sending { reply_id } | TurnPhase::Streaming { reply_id } => Some(reply_id),
        }
    }
}

/// Handle for the turn started by [`ChatState::begin_turn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub session_id: String,
    pub message: String,
    pub reply_id: String,
}

#[derive(Debug, Clone)]
pub struct ChatState {
    session: Option<ChatSession>,
    file_name: String,
    messages: Vec<ChatMessage>,
    phase: TurnPhase,
}

impl ChatState {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            session: None,
            file_name: file_name.into(),
            messages: Vec::new(),
            phase: TurnPhase::Idle,
        }
    }

    pub fn with_session(session: ChatSession) -> Self {
        let mut state = Self::new(session.file_name.clone());
        state.session = Some(session);
        state
    }

    /// Binds the state to a backend session, e.g. once the upload that
    /// creates it has finished. Refused while a turn is in flight.
    pub fn attach_session(&mut self, session: ChatSession) -> ChatResult<()> {
        if self.is_loading() {
            return Err(ChatError::Busy);
        }
        debug!(session_id = %session.session_id, "session attached");
        self.file_name = session.file_name.clone();
        self.session = Some(session);
        Ok(())
    }

    pub fn session(&self) -> Option<&ChatSession> {
        self.session.as_ref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn phase(&self) -> &TurnPhase {
        &self.phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase != TurnPhase::Idle
    }

    pub fn message(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Records the user's message and an empty assistant reply to stream into.
    pub fn begin_turn(&mut self, input: &str) -> ChatResult<Turn> {
        let session_id = self
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
            .ok_or(ChatError::NoSession)?;
        if self.is_loading() {
            return Err(ChatError::Busy);
        }
        let message = input.trim();
        if message.is_empty() {
            return Err(ChatError::InvalidRequest(
                "message must not be empty".to_string(),
            ));
        }

        let user = self.new_message(Role::User, message.to_string());
        let reply = self.new_message(Role::Assistant, String::new());
        let reply_id = reply.id.clone();
        self.messages.push(user);
        self.messages.push(reply);
        self.phase = TurnPhase::Sending {
            reply_id: reply_id.clone(),
        };
        debug!(%reply_id, "turn started");

        Ok(Turn {
            session_id,
            message: message.to_string(),
            reply_id,
        })
    }

    /// Appends a streamed delta to the reply. Deltas for any other id are
    /// ignored.
    pub fn apply_delta(&mut self, reply_id: &str, delta: &str) -> bool {
        if self.phase.reply_id() != Some(reply_id) {
            warn!(%reply_id, "ignoring delta for inactive reply");
            return false;
        }
        let Some(message) = self.messages.iter_mut().find(|m| m.id == reply_id) else {
            return false;
        };

        message.content.push_str(delta);
        self.phase = TurnPhase::Streaming {
            reply_id: reply_id.to_string(),
        };
        true
    }

    /// Settles the turn; the reply keeps whatever content arrived.
    pub fn complete(&mut self, reply_id: &str) {
        if self.phase.reply_id() == Some(reply_id) {
            self.phase = TurnPhase::Idle;
        }
    }

    /// Settles the turn, replacing the reply with the error.
    pub fn fail(&mut self, reply_id: &str, error: &ChatError) {
        if self.phase.reply_id() != Some(reply_id) {
            return;
        }
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == reply_id) {
            message.content = format!("Error: {}", error);
        }
        self.phase = TurnPhase::Idle;
    }

    /// Replaces the transcript with the backend's copy.
    pub fn load_history(&mut self, messages: Vec<ChatMessage>) -> ChatResult<()> {
        if self.is_loading() {
            return Err(ChatError::Busy);
        }
        self.messages = messages;
        Ok(())
    }

    fn new_message(&self, role: Role, content: String) -> ChatMessage {
        ChatMessage {
            id: Uuid::now_v7().to_string(),
            content,
            role,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            file_name: self.file_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ChatSession {
        ChatSession {
            session_id: "session-1".to_string(),
            file_name: "sales.csv".to_string(),
            created_at: "2024-01-01T00:00:00".to_string(),
            last_updated: None,
        }
    }

    #[test]
    fn turn_creates_user_message_and_empty_reply() {
        let mut state = ChatState::with_session(session());
        let turn = state.begin_turn("  How many rows?  ").unwrap();

        assert_eq!(turn.session_id, "session-1");
        assert_eq!(turn.message, "How many rows?");
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[0].role, Role::User);
        assert_eq!(state.messages()[0].file_name, "sales.csv");

        let reply = state.message(&turn.reply_id).unwrap();
        assert_eq!(reply.role, Role::Assistant);
        assert!(reply.content.is_empty());
        assert!(state.is_loading());
    }

    #[test]
    fn deltas_append_in_order_then_complete() {
        let mut state = ChatState::with_session(session());
        let turn = state.begin_turn("hi").unwrap();

        for delta in ["Hel", "lo", ", ", "world"] {
            assert!(state.apply_delta(&turn.reply_id, delta));
        }
        assert!(matches!(state.phase(), TurnPhase::Streaming { .. }));

        state.complete(&turn.reply_id);
        assert_eq!(state.message(&turn.reply_id).unwrap().content, "Hello, world");
        assert!(!state.is_loading());
    }

    #[test]
    fn second_turn_while_busy_is_rejected() {
        let mut state = ChatState::with_session(session());
        state.begin_turn("first").unwrap();

        assert!(matches!(state.begin_turn("second"), Err(ChatError::Busy)));
        assert_eq!(state.messages().len(), 2);
    }

    #[test]
    fn failure_overwrites_partial_reply() {
        let mut state = ChatState::with_session(session());
        let turn = state.begin_turn("hi").unwrap();
        state.apply_delta(&turn.reply_id, "partial");

        let error = ChatError::Status {
            status: 500,
            body: String::new(),
        };
        state.fail(&turn.reply_id, &error);

        assert_eq!(
            state.message(&turn.reply_id).unwrap().content,
            "Error: HTTP error! status: 500"
        );
        assert_eq!(state.phase(), &TurnPhase::Idle);
    }

    #[test]
    fn stale_delta_is_ignored() {
        let mut state = ChatState::with_session(session());
        let first = state.begin_turn("one").unwrap();
        state.complete(&first.reply_id);

        assert!(!state.apply_delta(&first.reply_id, "late"));
        assert_eq!(state.message(&first.reply_id).unwrap().content, "");
    }

    #[test]
    fn turn_requires_session_and_text() {
        let mut detached = ChatState::new("sales.csv");
        assert!(matches!(detached.begin_turn("hi"), Err(ChatError::NoSession)));

        let mut state = ChatState::with_session(session());
        assert!(matches!(
            state.begin_turn("   "),
            Err(ChatError::InvalidRequest(_))
        ));
        assert!(!state.is_loading());
    }

    #[test]
    fn attached_session_enables_turns() {
        let mut state = ChatState::new("upload.csv");
        assert!(matches!(state.begin_turn("hi"), Err(ChatError::NoSession)));

        state.attach_session(session()).unwrap();
        let turn = state.begin_turn("hi").unwrap();
        assert_eq!(turn.session_id, "session-1");
        assert_eq!(state.messages()[0].file_name, "sales.csv");

        assert!(matches!(state.attach_session(session()), Err(ChatError::Busy)));
    }

    #[test]
    fn reply_ids_are_distinct_and_ordered() {
        let mut state = ChatState::with_session(session());
        let first = state.begin_turn("one").unwrap();
        state.complete(&first.reply_id);
        let second = state.begin_turn("two").unwrap();

        assert_ne!(first.reply_id, second.reply_id);
        assert!(first.reply_id < second.reply_id);
    }

    #[test]
    fn history_cannot_replace_active_turn() {
        let mut state = ChatState::with_session(session());
        state.begin_turn("one").unwrap();
        assert!(matches!(state.load_history(Vec::new()), Err(ChatError::Busy)));
    }
}
