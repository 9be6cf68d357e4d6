use serde::{Deserialize, Serialize};

/// Relay session lifecycle. Terminated is terminal; the transition table
/// lives in `session.rs`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configuring,
    Streaming,
    Stopping,
    Terminated,
}

/// Destination for one relay, immutable once the encoder has been spawned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamConfig {
    pub destination_url: String,
    #[serde(default)]
    pub title: String,
}

/// Events produced by the transcoder adapter, consumed only by the owning
/// session's event loop.
#[derive(Debug)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    Exit(Option<i32>),
    SpawnFailure(String),
    WriteFailure(String),
}

/// Synchronous failures returned to the caller of the triggering operation.
/// Asynchronous failures (spawn/write/exit) surface as events instead.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("destination required")]
    DestinationRequired,
    #[error("destination must be an rtmp:// or rtmps:// url")]
    InvalidDestination,
    #[error("session already configured")]
    AlreadyConfigured,
    #[error("session is not streaming")]
    NotStreaming,
    #[error("transcoder input at capacity")]
    Capacity,
    #[error("transcoder input closed")]
    InputClosed,
}

/// Inbound commands on the client transport (text frames).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Configure(StreamConfig),
    Stop,
}

/// Outbound events to the client transport.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Configured,
    ConfigError { reason: String },
    Stopped,
    StreamStats { message: String },
    StreamError { reason: String },
    StreamEnded { exit_code: Option<i32> },
}

/// The destination url embeds the stream key, so it never appears in full
/// in logs. Keeps scheme and host, masks everything after the first path
/// segment separator except the last four characters.
pub fn redact_destination(url: &str) -> String {
    let path_start = url
        .find("://")
        .and_then(|i| url[i + 3..].find('/').map(|j| i + 3 + j))
        .unwrap_or(0);
    let (head, tail) = url.split_at(path_start);
    if tail.len() <= 5 {
        // Nothing worth keeping, mask the whole remainder.
        return format!("{}/****", head);
    }
    let suffix = &tail[tail.len() - 4..];
    format!("{}/****{}", head, suffix)
}
