use crate::attachment::Attachment;
use crate::error::{ChatError, ChatResult};
use crate::protocol::{ChatMessage, ChatReply, ChatSession};
use crate::stream::{pump, StreamOptions, StreamOutcome, StreamSummary};
use reqwest::multipart::Form;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1";

const CREATE_SESSION_PATH: &str = "/ollama-chat/create-session";
const SEND_MESSAGE_PATH: &str = "/ollama-chat/send-message";
const STREAM_MESSAGE_PATH: &str = "/ollama-chat/send-streaming-message";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    /// Applies to the non-streaming calls; streams use a deadline instead.
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP client for the data-chat backend.
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    http: HttpClient,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> ChatResult<Self> {
        let http = HttpClient::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            base_url: normalize_base_url(&config.base_url),
            token: config.token,
            timeout: config.timeout,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Uploads a CSV file and opens a chat session over it.
    pub async fn create_session(&self, attachment: &Attachment) -> ChatResult<ChatSession> {
        attachment.ensure_chat_compatible()?;
        let form = Form::new().part("file", attachment.to_part()?);

        let response = self
            .request(Method::POST, CREATE_SESSION_PATH)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await?;
        let session: ChatSession = ensure_success(response).await?.json().await?;

        info!(
            session_id = %session.session_id,
            file_name = %session.file_name,
            "chat session created"
        );
        Ok(session)
    }

    /// Sends one turn and waits for the complete reply.
    pub async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        attachment: &Attachment,
    ) -> ChatResult<ChatReply> {
        let form = message_form(session_id, message, attachment)?;

        let response = self
            .request(Method::POST, SEND_MESSAGE_PATH)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await?;

        ensure_success(response).await?.json().await.map_err(Into::into)
    }

    /// Sends one turn and streams the reply, calling `on_chunk` with each
    /// content delta in arrival order.
    ///
    /// `on_chunk` is never called after this future resolves. A non-success
    /// status fails before any of the body is read.
    pub async fn send_streaming_message<F>(
        &self,
        session_id: &str,
        message: &str,
        attachment: &Attachment,
        options: &StreamOptions,
        on_chunk: F,
    ) -> ChatResult<StreamSummary>
    where
        F: FnMut(&str),
    {
        let form = message_form(session_id, message, attachment)?;
        let request = self.request(Method::POST, STREAM_MESSAGE_PATH).multipart(form);
        let cancel = &options.cancel;

        info!(session_id, message_len = message.len(), "streaming chat turn");

        let exchange = open_and_pump(request, cancel, on_chunk);

        match options.deadline {
            Some(deadline) => {
                let budget = deadline.saturating_duration_since(Instant::now());
                tokio::time::timeout_at(deadline, exchange)
                    .await
                    .map_err(|_| ChatError::Timeout(budget))?
            }
            None => exchange.await,
        }
    }

    /// Full transcript of a session as stored by the backend.
    pub async fn session_messages(&self, session_id: &str) -> ChatResult<Vec<ChatMessage>> {
        let path = format!("/ollama-chat/session/{}/messages", session_id);
        self.get_json(&path).await
    }

    pub async fn session(&self, session_id: &str) -> ChatResult<ChatSession> {
        let path = format!("/ollama-chat/session/{}", session_id);
        self.get_json(&path).await
    }

    async fn get_json<T>(&self, path: &str) -> ChatResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .request(Method::GET, path)
            .timeout(self.timeout)
            .send()
            .await?;

        ensure_success(response).await?.json().await.map_err(Into::into)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

async fn open_and_pump<F>(
    request: RequestBuilder,
    cancel: &CancellationToken,
    on_chunk: F,
) -> ChatResult<StreamSummary>
where
    F: FnMut(&str),
{
    let response = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            return Ok(StreamSummary {
                outcome: StreamOutcome::Cancelled,
                deltas: 0,
                dropped_frames: 0,
            });
        }
        response = request.send() => response?,
    };

    // The body is left unread on failure.
    let status = response.status();
    if !status.is_success() {
        return Err(status_error(status, String::new()));
    }
    debug!(%status, "stream opened");

    pump(response.bytes_stream(), cancel, on_chunk).await
}

fn message_form(session_id: &str, message: &str, attachment: &Attachment) -> ChatResult<Form> {
    if session_id.trim().is_empty() {
        return Err(ChatError::InvalidRequest(
            "session id must not be empty".to_string(),
        ));
    }
    if message.trim().is_empty() {
        return Err(ChatError::InvalidRequest(
            "message must not be empty".to_string(),
        ));
    }
    attachment.ensure_chat_compatible()?;

    Ok(Form::new()
        .text("session_id", session_id.to_string())
        .text("message", message.to_string())
        .part("file", attachment.to_part()?))
}

async fn ensure_success(response: Response) -> ChatResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, body))
}

fn status_error(status: StatusCode, body: String) -> ChatError {
    if status == StatusCode::UNAUTHORIZED {
        ChatError::Unauthorized
    } else {
        ChatError::Status {
            status: status.as_u16(),
            body,
        }
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
