//! Session lifecycle: connect, declare capabilities, synchronize state,
//! then hold the session until something fatal happens.

use crate::session::{Session, ShutdownReason};
use crate::state::ClientState;
use crate::transport;
use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One connection attempt: publish Connect, wait for the verdict.
/// `Ok(true)` when connected, `Ok(false)` on denial or timeout.
async fn connect_once(session: &Session) -> anyhow::Result<bool> {
    let timeout = Duration::from_millis(session.config.default_timeout_ms);
    session.state.clear(ClientState::CONNECTION_DENIED);

    info!("connecting to the service");
    transport::publish(
        &session.mqtt,
        &session.topics.connection_fromclient,
        session.connect_message().to_string().into_bytes(),
    )
    .await
    .context("publishing Connect")?;

    let seen = session
        .state
        .wait_any_timeout(
            ClientState::CONNECTED | ClientState::CONNECTION_DENIED,
            timeout,
        )
        .await;
    if seen.contains(ClientState::CONNECTED) {
        Ok(true)
    } else {
        if seen.is_empty() {
            warn!("connection attempt timed out");
        }
        Ok(false)
    }
}

/// Publish Disconnect, then retry connecting with exponential backoff.
async fn connect_with_backoff(session: &Session) -> anyhow::Result<()> {
    session.state.clear(ClientState::CONNECTED);
    transport::publish(
        &session.mqtt,
        &session.topics.connection_fromclient,
        session.disconnect_message().to_string().into_bytes(),
    )
    .await
    .context("publishing Disconnect")?;

    let mut interval = Duration::from_millis(session.config.reconnect_interval_ms);
    for attempt in 1..=session.config.reconnect_retry {
        info!(attempt, "connection attempt");
        tokio::time::sleep(interval).await;
        if connect_once(session).await? {
            return Ok(());
        }
        interval *= 2;
    }
    bail!(
        "failed to connect after {} attempts",
        session.config.reconnect_retry
    )
}

/// Publish the capabilities document and wait for the service verdict.
async fn publish_capabilities(session: &Session) -> anyhow::Result<()> {
    transport::subscribe(&session.mqtt, &session.topics.capabilities_acknowledge).await?;
    transport::subscribe(&session.mqtt, &session.topics.directive).await?;
    transport::subscribe(&session.mqtt, &session.topics.speaker).await?;

    // The capabilities topic runs its own envelope sequence space.
    let capabilities_sequence = 0;
    let document = session.capabilities_document().to_string();
    let frame = session
        .crypto
        .encrypt(capabilities_sequence, document.as_bytes())
        .context("encrypting capabilities")?;
    transport::publish(&session.mqtt, &session.topics.capabilities_publish, frame)
        .await
        .context("publishing capabilities")?;

    let seen = session
        .state
        .wait_any_timeout(
            ClientState::CAPABILITIES_ACCEPTED | ClientState::CAPABILITIES_REJECTED,
            Duration::from_millis(session.config.default_timeout_ms),
        )
        .await;
    if seen.contains(ClientState::CAPABILITIES_ACCEPTED) {
        Ok(())
    } else if seen.contains(ClientState::CAPABILITIES_REJECTED) {
        bail!("service rejected the capabilities document")
    } else {
        bail!("capabilities acknowledgement timed out")
    }
}

/// Bring the session up: connection handshake, capabilities, state sync.
pub async fn bootstrap(session: &Session) -> anyhow::Result<()> {
    transport::subscribe(&session.mqtt, &session.topics.connection_fromservice).await?;
    connect_with_backoff(session).await?;
    publish_capabilities(session).await?;
    session
        .send_event(session.synchronize_state_event())
        .await
        .context("publishing SynchronizeState")?;
    info!("session established");
    Ok(())
}

/// Run the session to completion. Returns an error describing why it
/// ended; the process exits non-zero on it.
pub async fn run(
    session: Arc<Session>,
    mut shutdown: mpsc::Receiver<ShutdownReason>,
) -> anyhow::Result<()> {
    if let Err(e) = bootstrap(&session).await {
        teardown(&session).await;
        return Err(e);
    }

    let reason = shutdown
        .recv()
        .await
        .unwrap_or(ShutdownReason::StreamingFailure);
    warn!(reason = ?reason, "session shutting down");
    teardown(&session).await;
    bail!("session terminated: {reason:?}")
}

/// Best-effort cleanup: tell the service we are leaving, release the
/// indicator, drop the MQTT connection.
pub async fn teardown(session: &Session) {
    if session.state.contains(ClientState::CONNECTED) {
        session.state.clear(ClientState::CONNECTED);
        let _ = transport::publish(
            &session.mqtt,
            &session.topics.connection_fromclient,
            session.disconnect_message().to_string().into_bytes(),
        )
        .await;
    }
    session.platform.indicator_off();
    let _ = session.mqtt.disconnect().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{offline_session_with_config, test_config};

    fn fast_config() -> crate::config::Config {
        test_config(&[
            "--default-timeout-ms",
            "50",
            "--reconnect-interval-ms",
            "1",
            "--reconnect-retry",
            "2",
        ])
    }

    #[tokio::test]
    async fn connect_once_succeeds_when_acknowledged() {
        let (session, _rx) = offline_session_with_config(fast_config());
        // Simulate the receiver seeing CONNECTION_ESTABLISHED.
        session.state.set(ClientState::CONNECTED);
        assert!(connect_once(&session).await.unwrap());
    }

    #[tokio::test]
    async fn connect_once_fails_on_denial() {
        let (session, _rx) = offline_session_with_config(fast_config());
        session.state.set(ClientState::CONNECTION_DENIED);
        // The denial bit is cleared per attempt, so arrange for it to be
        // set again while the attempt waits.
        let setter = {
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                session.state.set(ClientState::CONNECTION_DENIED);
            })
        };
        assert!(!connect_once(&session).await.unwrap());
        setter.await.unwrap();
    }

    #[tokio::test]
    async fn connect_once_times_out_without_answer() {
        let (session, _rx) = offline_session_with_config(fast_config());
        assert!(!connect_once(&session).await.unwrap());
    }

    #[tokio::test]
    async fn backoff_gives_up_after_configured_retries() {
        let (session, _rx) = offline_session_with_config(fast_config());
        let err = connect_with_backoff(&session).await.unwrap_err();
        assert!(err.to_string().contains("after 2 attempts"));
    }

    #[tokio::test]
    async fn capabilities_rejection_is_fatal() {
        let (session, _rx) = offline_session_with_config(fast_config());
        session.state.set(ClientState::CAPABILITIES_REJECTED);
        let err = publish_capabilities(&session).await.unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }
}
