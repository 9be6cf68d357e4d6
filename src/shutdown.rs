use std::time::Duration;

use crate::manager;

/// Drives every registered session to Terminated: requests a graceful stop,
/// waits up to the grace period, then kills whatever encoder is still
/// running. Returns only once every snapshotted session has terminated or
/// the bounded waits have elapsed.
pub(crate) async fn shutdown_all(grace: Duration) {
    let sessions = manager::snapshot().await;
    if sessions.is_empty() {
        return;
    }
    log::info!("shutting down {} active session(s)", sessions.len());

    for session in &sessions {
        session.stop().await;
    }

    let all_terminated = futures::future::join_all(sessions.iter().map(|s| s.wait_terminated()));
    if tokio::time::timeout(grace, all_terminated).await.is_err() {
        for session in &sessions {
            if !session.is_terminated() {
                log::warn!(
                    "session {}: still alive after grace period, killing encoder",
                    session.id()
                );
                session.force_kill().await;
            }
        }
        // Bounded wait for the kills to be reaped.
        let remaining = futures::future::join_all(sessions.iter().map(|s| s.wait_terminated()));
        let _ = tokio::time::timeout(Duration::from_secs(2), remaining).await;
    }

    log::info!("shutdown complete");
}
