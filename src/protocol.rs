use serde::{Deserialize, Serialize};

/// Body of `POST /ollama-chat/create-session` and `GET /ollama-chat/session/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub session_id: String,
    pub file_name: String,
    pub created_at: String,
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Body of the non-streaming `POST /ollama-chat/send-message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub session_id: String,
    pub user_message: String,
    pub ai_response: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of `GET /ollama-chat/session/{id}/messages`, also used for the
/// local transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub role: Role,
    pub timestamp: String,
    #[serde(default)]
    pub file_name: String,
}
