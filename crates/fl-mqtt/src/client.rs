//! Managed MQTT client
//!
//! Wraps rumqttc's `AsyncClient` with a driven event loop task. Incoming
//! publishes are enqueued on a bounded channel; the heavy work (routing,
//! parsing, storage) happens in the service's drainer task, so a slow
//! pipeline back-pressures broker acks instead of piling up memory.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fl_common::{FieldLogError, Result};
use fl_config::MqttSettings;

/// Capacity of the event channel between the driver task and the drainer.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One subscription the client maintains across reconnects.
#[derive(Debug, Clone)]
pub struct TopicFilter {
    pub path: String,
    /// Per-filter QoS override; the broker default applies when None.
    pub qos: Option<u8>,
}

/// Connection lifecycle and message events, in arrival order.
#[derive(Debug, Clone)]
pub enum MqttEvent {
    Connected,
    Disconnected { reason: String },
    Message { topic: String, payload: Vec<u8> },
}

pub struct MqttIngestClient {
    client: AsyncClient,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

impl MqttIngestClient {
    /// Connect to the broker and start the event driver task. Subscriptions
    /// are (re-)established on every ConnAck, so they survive reconnects
    /// with clean sessions.
    pub fn start(
        settings: &MqttSettings,
        filters: Vec<TopicFilter>,
    ) -> Result<(Self, mpsc::Receiver<MqttEvent>)> {
        if filters.is_empty() {
            return Err(FieldLogError::Mqtt(
                "no topic filters to subscribe".to_string(),
            ));
        }

        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.broker_host.clone(),
            settings.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_period_seconds));
        options.set_clean_session(settings.clean_session);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        if settings.use_tls {
            // Default rustls config validates against the platform trust
            // store; deployments with private CAs supply their own broker
            // certificates there.
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let driver = tokio::spawn(drive_event_loop(
            eventloop,
            client.clone(),
            filters,
            settings.quality_of_service_level,
            Duration::from_secs(settings.reconnect_delay_seconds.max(1)),
            settings.max_reconnect_attempts,
            events_tx,
            cancel.clone(),
        ));

        info!(
            broker = %format!("{}:{}", settings.broker_host, settings.broker_port),
            client_id = %settings.client_id,
            tls = settings.use_tls,
            "MQTT client started"
        );

        Ok((
            Self {
                client,
                cancel,
                driver,
            },
            events_rx,
        ))
    }

    /// Stop the driver and disconnect. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let _ = self.client.disconnect().await;
        debug!("MQTT client stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.driver.is_finished()
    }
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_event_loop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    filters: Vec<TopicFilter>,
    default_qos: u8,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
    events_tx: mpsc::Sender<MqttEvent>,
    cancel: CancellationToken,
) {
    let mut failed_attempts: u32 = 0;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(code = ?ack.code, "MQTT broker connection established");
                failed_attempts = 0;
                subscribe_all(&client, &filters, default_qos).await;
                if events_tx.send(MqttEvent::Connected).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = MqttEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if events_tx.send(message).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker requested disconnect");
                let _ = events_tx
                    .send(MqttEvent::Disconnected {
                        reason: "server disconnect".to_string(),
                    })
                    .await;
            }
            Ok(_) => {}
            Err(err) => {
                failed_attempts += 1;
                warn!(%err, attempt = failed_attempts, "MQTT connection error");
                let _ = events_tx
                    .send(MqttEvent::Disconnected {
                        reason: err.to_string(),
                    })
                    .await;
                if max_reconnect_attempts > 0 && failed_attempts >= max_reconnect_attempts {
                    warn!(
                        attempts = failed_attempts,
                        "Reconnect budget exhausted, stopping MQTT driver"
                    );
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(reconnect_delay) => {}
                }
            }
        }
    }
    debug!("MQTT event driver stopped");
}

async fn subscribe_all(client: &AsyncClient, filters: &[TopicFilter], default_qos: u8) {
    for filter in filters {
        let qos = qos_from_level(filter.qos.unwrap_or(default_qos));
        match client.subscribe(filter.path.clone(), qos).await {
            Ok(()) => debug!(filter = %filter.path, ?qos, "Subscribed"),
            Err(err) => warn!(filter = %filter.path, %err, "Subscribe failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_settings() -> MqttSettings {
        MqttSettings {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1,
            client_id: "fieldlog-test".to_string(),
            reconnect_delay_seconds: 1,
            max_reconnect_attempts: 1,
            ..MqttSettings::default()
        }
    }

    #[test]
    fn qos_mapping() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn empty_filter_list_is_rejected() {
        let Err(err) = MqttIngestClient::start(&unreachable_settings(), vec![]) else {
            panic!("expected start to fail without filters");
        };
        assert!(matches!(err, FieldLogError::Mqtt(_)));
    }

    #[tokio::test]
    async fn unreachable_broker_reports_disconnect() {
        let filters = vec![TopicFilter {
            path: "plant/#".to_string(),
            qos: None,
        }];
        let (client, mut events) =
            MqttIngestClient::start(&unreachable_settings(), filters).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event before timeout")
            .expect("driver alive");
        assert!(matches!(event, MqttEvent::Disconnected { .. }));

        client.shutdown().await;
        client.shutdown().await; // idempotent
    }
}
