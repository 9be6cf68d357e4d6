use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::relay::types::ProcessEvent;

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

fn temp_out(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rtmp-relay-{}-{}", name, uuid::Uuid::new_v4()))
}

fn event_channel() -> (mpsc::Sender<ProcessEvent>, mpsc::Receiver<ProcessEvent>) {
    mpsc::channel(256)
}

/// Skips diagnostics until the final Exit event.
async fn wait_exit(rx: &mut mpsc::Receiver<ProcessEvent>) -> Option<i32> {
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("exit event before timeout")
            .expect("event channel open");
        if let ProcessEvent::Exit(code) = event {
            return code;
        }
    }
}

// ------------------------------------------------------------------------
// Argument contract
// ------------------------------------------------------------------------

#[test]
fn test_destination_is_final_argument() {
    let settings = crate::config::RelaySettings::default();
    let (program, args) = encoder_command(&settings, "rtmp://ingest.example/live/key123");
    assert_eq!(program, "ffmpeg");
    assert_eq!(args.last().unwrap(), "rtmp://ingest.example/live/key123");
    // Input comes from stdin, output container is FLV.
    assert_eq!(&args[..2], &["-i".to_string(), "-".to_string()]);
    let flv = args.iter().position(|a| a == "flv").unwrap();
    assert_eq!(args[flv - 1], "-f");
}

#[test]
fn test_args_override_still_appends_destination() {
    let settings = crate::config::RelaySettings {
        encoder_program: "sh".to_string(),
        encoder_args: Some(sh("exec cat > /dev/null")),
        ..Default::default()
    };
    let (program, args) = encoder_command(&settings, "rtmp://x/live/k");
    assert_eq!(program, "sh");
    assert_eq!(
        args,
        vec![
            "-c".to_string(),
            "exec cat > /dev/null".to_string(),
            "rtmp://x/live/k".to_string()
        ]
    );
}

#[test]
fn test_profiles_diverge() {
    let standard = EncoderProfile::Standard.args();
    let low_latency = EncoderProfile::LowLatency.args();
    assert!(standard.contains(&"veryfast".to_string()));
    assert!(standard.contains(&"2500k".to_string()));
    assert!(standard.contains(&"44100".to_string()));
    assert!(low_latency.contains(&"ultrafast".to_string()));
    assert!(low_latency.contains(&"-crf".to_string()));
    assert!(low_latency.contains(&"32000".to_string()));
}

#[test]
fn test_profile_by_name() {
    assert_eq!(EncoderProfile::by_name("standard"), Some(EncoderProfile::Standard));
    assert_eq!(
        EncoderProfile::by_name("low-latency"),
        Some(EncoderProfile::LowLatency)
    );
    assert_eq!(EncoderProfile::by_name("nope"), None);
}

#[test]
fn test_progress_line_detection() {
    assert!(is_progress_line(
        "frame=  120 fps= 30 q=23.0 size=     512kB time=00:00:04.00 bitrate=1048.6kbits/s"
    ));
    assert!(is_progress_line("size=     256kB time=00:00:02.00"));
    assert!(!is_progress_line("Input #0, matroska,webm, from 'pipe:0':"));
    assert!(!is_progress_line(""));
}

// ------------------------------------------------------------------------
// Process supervision (real test-double processes)
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_chunks_reach_stdin_in_order() {
    let out = temp_out("order");
    let (tx, mut rx) = event_channel();
    let script = format!("exec cat > {}", out.display());
    let transcoder = Transcoder::spawn("sh", &sh(&script), tx, 16).unwrap();

    transcoder.write(Bytes::from(vec![1u8; 10])).unwrap();
    transcoder.write(Bytes::from(vec![2u8; 20])).unwrap();
    transcoder.write(Bytes::from(vec![3u8; 5])).unwrap();
    transcoder.terminate();

    assert_eq!(wait_exit(&mut rx).await, Some(0));

    let data = std::fs::read(&out).unwrap();
    assert_eq!(data.len(), 35);
    assert_eq!(&data[..10], &[1u8; 10][..]);
    assert_eq!(&data[10..30], &[2u8; 20][..]);
    assert_eq!(&data[30..], &[3u8; 5][..]);
    let _ = std::fs::remove_file(&out);
}

#[tokio::test]
async fn test_spawn_failure_is_synchronous() {
    let (tx, _rx) = event_channel();
    let result = Transcoder::spawn("rtmp-relay-test-missing-encoder", &[], tx, 4);
    assert!(result.is_err());
}

#[tokio::test]
async fn test_exit_code_is_reported() {
    let (tx, mut rx) = event_channel();
    let _transcoder = Transcoder::spawn("sh", &sh("exit 7"), tx, 4).unwrap();
    assert_eq!(wait_exit(&mut rx).await, Some(7));
}

#[tokio::test]
async fn test_broken_pipe_before_stop_is_a_write_failure() {
    let (tx, mut rx) = event_channel();
    let transcoder = Transcoder::spawn("sh", &sh("exit 7"), tx, 4).unwrap();
    assert_eq!(wait_exit(&mut rx).await, Some(7));

    // No termination was requested, so the broken pipe must be reported.
    transcoder.write(Bytes::from_static(b"late")).unwrap();
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("write failure before timeout")
            .expect("event channel open");
        if let ProcessEvent::WriteFailure(_) = event {
            break;
        }
    }
}

#[tokio::test]
async fn test_writes_after_terminate_are_suppressed() {
    let (tx, mut rx) = event_channel();
    let transcoder = Transcoder::spawn("sh", &sh("exec cat > /dev/null"), tx, 16).unwrap();

    transcoder.write(Bytes::from_static(b"payload")).unwrap();
    transcoder.terminate();
    assert!(matches!(
        transcoder.write(Bytes::from_static(b"late")),
        Err(RelayError::InputClosed)
    ));

    // Drain every event up to Exit: none may be a WriteFailure.
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("exit before timeout")
            .expect("event channel open");
        match event {
            ProcessEvent::WriteFailure(reason) => {
                panic!("suppressed write surfaced: {}", reason)
            }
            ProcessEvent::Exit(code) => {
                assert_eq!(code, Some(0));
                break;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_force_kill_reaps_the_process() {
    let (tx, mut rx) = event_channel();
    let transcoder = Transcoder::spawn("sh", &sh("exec sleep 30"), tx, 4).unwrap();
    let pid = transcoder.pid().unwrap();

    transcoder.force_kill();
    // Killed by signal, so there is no exit code.
    assert_eq!(wait_exit(&mut rx).await, None);
    assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists());
}

#[tokio::test]
async fn test_backpressure_rejects_new_writes() {
    let (tx, mut rx) = event_channel();
    // Never reads stdin, so nothing drains the queue.
    let transcoder = Transcoder::spawn("sh", &sh("exec sleep 30"), tx, 1).unwrap();

    // Single-threaded test runtime: without an await the writer task cannot
    // run, so the second write must hit the full queue.
    transcoder.write(Bytes::from(vec![0u8; 1024])).unwrap();
    assert!(matches!(
        transcoder.write(Bytes::from(vec![0u8; 1024])),
        Err(RelayError::Capacity)
    ));

    transcoder.force_kill();
    wait_exit(&mut rx).await;
}
