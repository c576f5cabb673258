//! Microphone uplink pipeline.
//!
//! The platform capture callback feeds raw PCM into the session's ring;
//! this task drains it in fixed-duration chunks, tags each chunk with the
//! absolute byte offset and the per-direction sequence, encrypts, and
//! publishes on the microphone topic. Opening and closing are edges of
//! the `MICROPHONE_OPEN` state bit, each reported with one event.

use crate::events::Event;
use crate::protocol::build_microphone_chunk;
use crate::session::{Session, ShutdownReason};
use crate::state::ClientState;
use crate::transport;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

pub async fn uplink_task(session: Arc<Session>) {
    let audio_size = session.config.audio_data_size;
    let chunk_timeout = Duration::from_millis(session.config.mic_chunk_timeout_ms());
    let mut sequence: u32 = 0;
    let mut pcm = vec![0u8; audio_size];
    let mut was_open = false;

    info!("microphone task up");
    loop {
        if !session.state.contains(ClientState::MICROPHONE_OPEN) {
            if was_open {
                was_open = false;
                let offset = session.microphone.offset.load(Ordering::SeqCst);
                info!(offset, "microphone closed");
                if let Err(e) = session.send_event(Event::MicrophoneClosed { offset }).await {
                    error!(error = %e, "failed to report microphone close");
                    session.signal_shutdown(ShutdownReason::StreamingFailure);
                    return;
                }
            }
            session.state.wait_any(ClientState::MICROPHONE_OPEN).await;
            continue;
        }
        was_open = true;

        if session.take_mic_opened_pending() {
            let event = Event::MicrophoneOpened {
                profile: session.asr_profile().to_string(),
                initiator: session.current_initiator(),
                offset: session.microphone.offset.load(Ordering::SeqCst),
            };
            if let Err(e) = session.send_event(event).await {
                error!(error = %e, "failed to report microphone open");
                session.signal_shutdown(ShutdownReason::StreamingFailure);
                return;
            }
        }

        // Fill one audio message, or take whatever arrived within the
        // message duration plus slack.
        let deadline = Instant::now() + chunk_timeout;
        let mut received = 0;
        while received < audio_size {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let n = session
                .microphone
                .ring
                .read_some(&mut pcm[received..], deadline - now)
                .await;
            if n == 0 {
                break;
            }
            received += n;
        }

        if received == 0 {
            continue;
        }

        let offset = session.microphone.offset.load(Ordering::SeqCst);
        let chunk = build_microphone_chunk(offset, &pcm[..received]);
        let frame = match session.crypto.encrypt(sequence, &chunk) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "failed to encrypt microphone chunk");
                session.signal_shutdown(ShutdownReason::StreamingFailure);
                return;
            }
        };

        // The microphone may have closed while the chunk filled; stale
        // bytes are dropped rather than published.
        if !session.state.contains(ClientState::MICROPHONE_OPEN) {
            debug!(bytes = received, "dropping capture gathered after close");
            continue;
        }

        match transport::publish(&session.mqtt, &session.topics.microphone, frame).await {
            Ok(()) => {
                sequence = sequence.wrapping_add(1);
                session
                    .microphone
                    .offset
                    .fetch_add(received as u64, Ordering::SeqCst);
                session.stats.record_mic_chunk();
            }
            Err(e) => {
                error!(error = %e, "microphone publish failed");
                session.stats.record_publish_error();
                session.signal_shutdown(ShutdownReason::StreamingFailure);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::offline_session;

    async fn wait_for_offset(session: &Arc<Session>, target: u64) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while session.microphone.offset.load(Ordering::SeqCst) < target {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("microphone offset should advance");
    }

    #[tokio::test]
    async fn captured_bytes_advance_the_offset() {
        let (session, _rx) = offline_session();
        session.open_microphone();

        let task = tokio::spawn(uplink_task(session.clone()));
        assert_eq!(session.fill_microphone_buffer(&[1u8; 1000]), 1000);

        wait_for_offset(&session, 1000).await;
        assert_eq!(session.microphone.offset.load(Ordering::SeqCst), 1000);
        // The one-shot MicrophoneOpened marker was consumed by the task.
        assert!(!session.take_mic_opened_pending());
        task.abort();
    }

    #[tokio::test]
    async fn closing_stops_consumption() {
        let (session, _rx) = offline_session();
        session.open_microphone();

        let task = tokio::spawn(uplink_task(session.clone()));
        session.fill_microphone_buffer(&[1u8; 500]);
        wait_for_offset(&session, 500).await;

        session.close_microphone();
        // Give the task time to park on the state wait, then feed bytes
        // that must not be consumed.
        tokio::time::sleep(Duration::from_millis(300)).await;
        session.fill_microphone_buffer(&[2u8; 500]);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(session.microphone.offset.load(Ordering::SeqCst), 500);
        assert_eq!(session.microphone.ring.len(), 500);
        task.abort();
    }

    #[tokio::test]
    async fn reopening_keeps_the_running_offset() {
        let (session, _rx) = offline_session();
        session.open_microphone();
        let task = tokio::spawn(uplink_task(session.clone()));

        session.fill_microphone_buffer(&[1u8; 640]);
        wait_for_offset(&session, 640).await;

        session.close_microphone();
        tokio::time::sleep(Duration::from_millis(300)).await;

        session.open_microphone();
        session.fill_microphone_buffer(&[2u8; 360]);
        wait_for_offset(&session, 1000).await;
        assert_eq!(session.microphone.offset.load(Ordering::SeqCst), 1000);
        task.abort();
    }
}
