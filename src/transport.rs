//! MQTT transport: topic set, connection options, publish helper.

use crate::config::Config;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use std::time::Duration;
use tracing::{debug, info};

/// The eight topics of one session, fully composed.
#[derive(Debug, Clone)]
pub struct Topics {
    pub connection_fromclient: String,
    pub connection_fromservice: String,
    pub capabilities_publish: String,
    pub capabilities_acknowledge: String,
    pub directive: String,
    pub event: String,
    pub microphone: String,
    pub speaker: String,
}

impl Topics {
    pub fn new(config: &Config) -> Self {
        let head = config.topic_head();
        Topics {
            connection_fromclient: format!("{head}/connection/fromclient"),
            connection_fromservice: format!("{head}/connection/fromservice"),
            capabilities_publish: format!("{head}/capabilities/publish"),
            capabilities_acknowledge: format!("{head}/capabilities/acknowledge"),
            directive: format!("{head}/directive"),
            event: format!("{head}/event"),
            microphone: format!("{head}/microphone"),
            speaker: format!("{head}/speaker"),
        }
    }
}

/// Open the MQTT connection for a session.
///
/// The returned [`EventLoop`] must be polled by the receiver task; nothing
/// moves on the wire until it is.
pub fn connect(config: &Config) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(&config.thing_name, &config.mqtt_host, config.mqtt_port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    options.set_max_packet_size(
        config.message_max_size.max(8 * 1024),
        config.message_max_size.max(8 * 1024),
    );

    info!(
        host = %config.mqtt_host,
        port = config.mqtt_port,
        client_id = %config.thing_name,
        "opening MQTT connection"
    );
    AsyncClient::new(options, 64)
}

/// Publish one message at QoS 0.
pub async fn publish(
    client: &AsyncClient,
    topic: &str,
    payload: Vec<u8>,
) -> Result<(), rumqttc::ClientError> {
    debug!(topic = %topic, bytes = payload.len(), "publish");
    client.publish(topic, QoS::AtMostOnce, false, payload).await
}

/// Subscribe to one topic at QoS 0.
pub async fn subscribe(client: &AsyncClient, topic: &str) -> Result<(), rumqttc::ClientError> {
    info!(topic = %topic, "subscribed");
    client.subscribe(topic, QoS::AtMostOnce).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn topics_follow_the_head() {
        let config = Config::parse_from([
            "ais-voice-client",
            "--topic-root",
            "root",
            "--thing-name",
            "thing-1",
        ]);
        let topics = Topics::new(&config);
        assert_eq!(topics.connection_fromclient, "root/ais/v1/thing-1/connection/fromclient");
        assert_eq!(topics.connection_fromservice, "root/ais/v1/thing-1/connection/fromservice");
        assert_eq!(topics.capabilities_publish, "root/ais/v1/thing-1/capabilities/publish");
        assert_eq!(
            topics.capabilities_acknowledge,
            "root/ais/v1/thing-1/capabilities/acknowledge"
        );
        assert_eq!(topics.directive, "root/ais/v1/thing-1/directive");
        assert_eq!(topics.event, "root/ais/v1/thing-1/event");
        assert_eq!(topics.microphone, "root/ais/v1/thing-1/microphone");
        assert_eq!(topics.speaker, "root/ais/v1/thing-1/speaker");
    }
}
