use std::process::Stdio;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RelaySettings;
use crate::relay::types::{ProcessEvent, RelayError};

/// Named encoder parameter sets. The upstream project shipped two divergent
/// hard-coded configurations; here they are selectable by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderProfile {
    /// veryfast preset, 30 fps, capped 2500k video bitrate, 44.1 kHz stereo.
    Standard,
    /// ultrafast preset, 25 fps, CRF rate control, 32 kHz audio.
    LowLatency,
}

impl EncoderProfile {
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "standard" => Some(Self::Standard),
            "low-latency" | "low_latency" => Some(Self::LowLatency),
            _ => None,
        }
    }

    /// Fixed argument list, minus the destination url. Input is always
    /// stdin and the container is always FLV, which is what RTMP ingest
    /// expects.
    #[rustfmt::skip]
    pub fn args(&self) -> Vec<String> {
        let args: &[&str] = match self {
            Self::Standard => &[
                "-i", "-",
                "-c:v", "libx264",
                "-preset", "veryfast",
                "-tune", "zerolatency",
                "-r", "30",
                "-g", "60",
                "-keyint_min", "30",
                "-pix_fmt", "yuv420p",
                "-b:v", "2500k",
                "-maxrate", "2500k",
                "-bufsize", "5000k",
                "-c:a", "aac",
                "-b:a", "128k",
                "-ar", "44100",
                "-ac", "2",
                "-f", "flv",
            ],
            Self::LowLatency => &[
                "-i", "-",
                "-c:v", "libx264",
                "-preset", "ultrafast",
                "-tune", "zerolatency",
                "-r", "25",
                "-g", "50",
                "-keyint_min", "25",
                "-crf", "25",
                "-pix_fmt", "yuv420p",
                "-sc_threshold", "0",
                "-profile:v", "main",
                "-level", "3.1",
                "-c:a", "aac",
                "-b:a", "128k",
                "-ar", "32000",
                "-f", "flv",
            ],
        };
        args.iter().map(|s| s.to_string()).collect()
    }
}

/// Full command line for one relay. The destination url is appended
/// verbatim as the final argument, also when the argument list has been
/// overridden.
pub fn encoder_command(settings: &RelaySettings, destination_url: &str) -> (String, Vec<String>) {
    let mut args = settings
        .encoder_args
        .clone()
        .unwrap_or_else(|| settings.encoder_profile.args());
    args.push(destination_url.to_string());
    (settings.encoder_program.clone(), args)
}

/// ffmpeg reports encoding progress on stderr as `frame=...`/`size=...`
/// stat rows; everything else on stderr is diagnostics.
pub fn is_progress_line(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with("frame=") || line.starts_with("size=")
}

/// Supervises one external encoder process: feeds ordered binary chunks to
/// its stdin through a bounded queue, and translates stdout/stderr/exit
/// into `ProcessEvent`s. Never restarts the process; restart policy belongs
/// to the caller.
pub struct Transcoder {
    pid: Option<u32>,
    chunk_tx: mpsc::Sender<Bytes>,
    stop_requested: Arc<AtomicBool>,
    stop: CancellationToken,
    kill: CancellationToken,
}

impl Transcoder {
    /// Spawns the process and the supervision tasks. All events, including
    /// the final `Exit`, are delivered on `event_tx` in the order they
    /// occur.
    pub fn spawn(
        program: &str,
        args: &[String],
        event_tx: mpsc::Sender<ProcessEvent>,
        chunk_capacity: usize,
    ) -> std::io::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Backstop: the child must never outlive its supervisor.
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("child stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr not piped"))?;

        let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(chunk_capacity);
        let stop_requested = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();
        let kill = CancellationToken::new();

        spawn_writer(
            stdin,
            chunk_rx,
            event_tx.clone(),
            Arc::clone(&stop_requested),
            stop.clone(),
        );
        spawn_line_reader(stdout, event_tx.clone(), ProcessEvent::Stdout);
        spawn_line_reader(stderr, event_tx.clone(), ProcessEvent::Stderr);

        let kill_clone = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_clone.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|s| s.code());
            let _ = event_tx.send(ProcessEvent::Exit(code)).await;
        });

        Ok(Self {
            pid,
            chunk_tx,
            stop_requested,
            stop,
            kill,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Single ordered write attempt. Reject-new on backpressure: a full
    /// queue fails immediately, already-queued chunks are never dropped or
    /// reordered.
    pub fn write(&self, chunk: Bytes) -> Result<(), RelayError> {
        if self.stop_requested.load(Ordering::Relaxed) {
            return Err(RelayError::InputClosed);
        }
        self.chunk_tx.try_send(chunk).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::Capacity,
            mpsc::error::TrySendError::Closed(_) => RelayError::InputClosed,
        })
    }

    /// Graceful termination: stop the writer and close the child's stdin so
    /// the encoder can flush and exit on its own. Write failures from this
    /// point on are expected and suppressed.
    pub fn terminate(&self) {
        self.stop_requested.store(true, Ordering::Relaxed);
        self.stop.cancel();
    }

    pub fn force_kill(&self) {
        self.kill.cancel();
    }

    /// Token cancelled by `force_kill`; lets the owner arm a grace timer
    /// without holding the adapter.
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }
}

fn spawn_writer(
    mut stdin: tokio::process::ChildStdin,
    mut chunk_rx: mpsc::Receiver<Bytes>,
    event_tx: mpsc::Sender<ProcessEvent>,
    stop_requested: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    // Flush whatever was accepted before the stop request;
                    // accepted chunks are never silently dropped.
                    while let Ok(chunk) = chunk_rx.try_recv() {
                        if stdin.write_all(&chunk).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
                chunk = chunk_rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    if let Err(e) = stdin.write_all(&chunk).await {
                        // Broken pipe after a termination request is the
                        // normal way this race resolves; before one it is a
                        // real failure.
                        if !stop_requested.load(Ordering::Relaxed) {
                            let _ = event_tx
                                .send(ProcessEvent::WriteFailure(e.to_string()))
                                .await;
                        }
                        break;
                    }
                }
            }
        }
        // Dropping stdin closes the pipe and signals EOF to the encoder.
        drop(stdin);
    });
}

fn spawn_line_reader<R>(
    reader: R,
    event_tx: mpsc::Sender<ProcessEvent>,
    to_event: fn(String) -> ProcessEvent,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if event_tx.send(to_event(line)).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
#[path = "transcoder_test.rs"]
mod transcoder_test;
