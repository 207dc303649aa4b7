//! Client for the data-chat backend: session management, streamed replies
//! and a terminal front-end.

pub mod attachment;
pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod stream;
pub mod ui;

pub use client::{ChatClient, ClientConfig};
pub use error::{ChatError, ChatResult};
