use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::RelaySettings;
use crate::manager;
use crate::relay::transcoder::{self, Transcoder};
use crate::relay::types::{
    ClientEvent, ProcessEvent, RelayError, SessionState, StreamConfig, redact_destination,
};

/// Per-connection state machine. Owns at most one live `Transcoder` and is
/// the only consumer of its `ProcessEvent`s, which a dedicated task applies
/// one at a time.
pub struct RelaySession {
    id: String,
    settings: Arc<RelaySettings>,
    inner: Mutex<SessionInner>,
    /// Outbound events toward the client transport.
    events_tx: mpsc::Sender<ClientEvent>,
    /// Feeds this session's own event loop.
    process_tx: mpsc::Sender<ProcessEvent>,
    bytes_forwarded: AtomicU64,
    /// Cancelled exactly once, on the transition into Terminated.
    terminated: CancellationToken,
}

struct SessionInner {
    state: SessionState,
    config: Option<StreamConfig>,
    start_time: Option<DateTime<Utc>>,
    transcoder: Option<Transcoder>,
}

impl RelaySession {
    pub fn new(
        id: String,
        settings: Arc<RelaySettings>,
        events_tx: mpsc::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let (process_tx, process_rx) = mpsc::channel(256);
        let session = Arc::new(Self {
            id,
            settings,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                config: None,
                start_time: None,
                transcoder: None,
            }),
            events_tx,
            process_tx,
            bytes_forwarded: AtomicU64::new(0),
            terminated: CancellationToken::new(),
        });

        let session_clone = Arc::clone(&session);
        tokio::spawn(async move {
            session_clone.run(process_rx).await;
        });

        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded.load(Ordering::Relaxed)
    }

    pub async fn transcoder_pid(&self) -> Option<u32> {
        self.inner.lock().await.transcoder.as_ref().and_then(|t| t.pid())
    }

    /// Write-once: set when the encoder is spawned, never mutated after.
    pub async fn config(&self) -> Option<StreamConfig> {
        self.inner.lock().await.config.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    pub async fn wait_terminated(&self) {
        self.terminated.cancelled().await;
    }

    /// Validates the destination and spawns the encoder. Validation errors
    /// are returned synchronously and leave the session in Idle; a spawn
    /// failure surfaces asynchronously and terminates the session.
    pub async fn configure(&self, config: StreamConfig) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Idle {
            return Err(RelayError::AlreadyConfigured);
        }

        let url = config.destination_url.trim().to_string();
        if url.is_empty() {
            return Err(RelayError::DestinationRequired);
        }
        if !url.starts_with("rtmp://") && !url.starts_with("rtmps://") {
            return Err(RelayError::InvalidDestination);
        }

        inner.state = SessionState::Configuring;
        inner.config = Some(StreamConfig {
            destination_url: url.clone(),
            title: config.title,
        });

        let (program, args) = transcoder::encoder_command(&self.settings, &url);
        log::info!(
            "session {}: starting {} -> {}",
            self.id,
            program,
            redact_destination(&url)
        );
        match Transcoder::spawn(
            &program,
            &args,
            self.process_tx.clone(),
            self.settings.chunk_capacity,
        ) {
            Ok(transcoder) => {
                inner.transcoder = Some(transcoder);
                inner.state = SessionState::Streaming;
                inner.start_time = Some(Utc::now());
                self.emit(ClientEvent::Configured);
                Ok(())
            }
            Err(e) => {
                // Handled by the event loop so the terminate path is single.
                let _ = self
                    .process_tx
                    .try_send(ProcessEvent::SpawnFailure(e.to_string()));
                Ok(())
            }
        }
    }

    /// Forwards one binary chunk to the encoder. Accepted only while
    /// Streaming; backpressure is reported synchronously and leaves the
    /// session Streaming.
    pub async fn submit_chunk(&self, chunk: Bytes) -> Result<(), RelayError> {
        let inner = self.inner.lock().await;
        if inner.state != SessionState::Streaming {
            return Err(RelayError::NotStreaming);
        }
        let transcoder = inner.transcoder.as_ref().ok_or(RelayError::NotStreaming)?;
        let len = chunk.len() as u64;
        transcoder.write(chunk)?;
        self.bytes_forwarded.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Requests termination. Idempotent from every state, including after
    /// Terminated. With a live encoder this closes its stdin and arms the
    /// grace timer; without one the session terminates immediately.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Stopping | SessionState::Terminated => return,
            _ => {}
        }
        inner.state = SessionState::Stopping;

        match inner.transcoder.as_ref() {
            Some(transcoder) => {
                transcoder.terminate();
                let kill = transcoder.kill_token();
                let terminated = self.terminated.clone();
                let grace = self.settings.stop_grace;
                let id = self.id.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = terminated.cancelled() => {}
                        _ = tokio::time::sleep(grace) => {
                            log::warn!("session {}: encoder still running after grace period, killing", id);
                            kill.cancel();
                        }
                    }
                });
            }
            None => {
                drop(inner);
                self.finalize(None, true).await;
            }
        }
    }

    pub async fn force_kill(&self) {
        if let Some(transcoder) = self.inner.lock().await.transcoder.as_ref() {
            transcoder.force_kill();
        }
    }

    fn emit(&self, event: ClientEvent) {
        if self.events_tx.try_send(event).is_err() {
            log::warn!("session {}: outbound event dropped", self.id);
        }
    }

    /// Single sequential consumer of process events for this session.
    async fn run(self: Arc<Self>, mut process_rx: mpsc::Receiver<ProcessEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.terminated.cancelled() => break,
                event = process_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&self, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout(line) => {
                log::debug!("session {}: encoder stdout: {}", self.id, line);
            }
            ProcessEvent::Stderr(line) => {
                let streaming = self.state().await == SessionState::Streaming;
                if streaming && transcoder::is_progress_line(&line) {
                    self.emit(ClientEvent::StreamStats { message: line });
                } else {
                    log::debug!("session {}: encoder: {}", self.id, line);
                }
            }
            ProcessEvent::SpawnFailure(reason) => {
                log::error!("session {}: encoder failed to start: {}", self.id, reason);
                self.emit(ClientEvent::StreamError {
                    reason: format!("failed to start encoder: {}", reason),
                });
                // The process never ran, so there is no stream to end.
                self.finalize(None, false).await;
            }
            ProcessEvent::WriteFailure(reason) => {
                log::error!("session {}: encoder input failed: {}", self.id, reason);
                self.emit(ClientEvent::StreamError {
                    reason: format!("encoder input failed: {}", reason),
                });
                self.stop().await;
            }
            ProcessEvent::Exit(code) => {
                let state = self.state().await;
                if state == SessionState::Streaming && code != Some(0) {
                    self.emit(ClientEvent::StreamError {
                        reason: format!("encoder exited unexpectedly (code {:?})", code),
                    });
                }
                self.finalize(code, true).await;
            }
        }
    }

    /// The only transition into Terminated: runs at most once, emits the
    /// terminal event and removes the session from the registry.
    async fn finalize(&self, exit_code: Option<i32>, emit_ended: bool) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Terminated {
                return;
            }
            inner.state = SessionState::Terminated;
            inner.transcoder = None;

            let duration = inner
                .start_time
                .map(|t| (Utc::now() - t).num_seconds())
                .unwrap_or(0);
            log::info!(
                "session {}: terminated (exit code {:?}, {} bytes forwarded, {}s)",
                self.id,
                exit_code,
                self.bytes_forwarded(),
                duration
            );
        }

        if emit_ended {
            self.emit(ClientEvent::StreamEnded { exit_code });
        }
        self.terminated.cancel();
        manager::remove_session(&self.id).await;
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
