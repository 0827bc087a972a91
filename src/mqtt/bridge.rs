use super::Topics;
use crate::config::MqttSettings;
use crate::publish::Outbound;
use crate::supervisor::SignalSet;
use chrono::{DateTime, Local};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 100;
const MAX_BACKOFF: Duration = Duration::from_secs(10);
/// Retry period once max_retries is exceeded
const SLOW_RETRY: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retries exhausted, still polling at [`SLOW_RETRY`]
    Failed,
}

#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub failed_attempts: u32,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub messages_dropped: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl MqttStatus {
    /// Delay before the next connection attempt
    pub fn retry_delay(&self, settings: &MqttSettings) -> Duration {
        if self.failed_attempts > settings.max_retries {
            return SLOW_RETRY;
        }
        let exponent = self.failed_attempts.saturating_sub(1).min(16);
        settings
            .retry_backoff()
            .saturating_mul(1 << exponent)
            .min(MAX_BACKOFF)
    }
}

pub struct MqttBridge {
    settings: MqttSettings,
    topics: Topics,
    status: MqttStatus,
    client: AsyncClient,
    eventloop: EventLoop,
    outbound: mpsc::Receiver<Outbound>,
    signals: Arc<SignalSet>,
}

impl MqttBridge {
    pub fn new(
        settings: MqttSettings,
        outbound: mpsc::Receiver<Outbound>,
        signals: Arc<SignalSet>,
    ) -> Self {
        let mut mqtt_options =
            MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        mqtt_options.set_keep_alive(KEEP_ALIVE);
        if let (Some(user), Some(password)) = (&settings.user, &settings.password) {
            mqtt_options.set_credentials(user.clone(), password.clone());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        MqttBridge {
            topics: Topics::new(&settings.topic_prefix),
            settings,
            status: MqttStatus {
                connection_state: ConnectionState::Connecting,
                ..MqttStatus::default()
            },
            client,
            eventloop,
            outbound,
            signals,
        }
    }

    pub fn status(&self) -> &MqttStatus {
        &self.status
    }

    /// Runs the bridge until the token is cancelled
    pub async fn run(mut self, token: CancellationToken) {
        info!(
            "Connecting to MQTT broker {}:{} as {}",
            self.settings.host, self.settings.port, self.settings.client_id
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = self.eventloop.poll() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(e) => {
                        self.connection_failed(e);
                        let delay = self.status.retry_delay(&self.settings);
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
                Some(event) = self.outbound.recv() => self.forward(event),
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect: {}", e);
        }
        info!(
            "MQTT bridge stopped ({} sent, {} received, {} dropped)",
            self.status.messages_sent, self.status.messages_received, self.status.messages_dropped
        );
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("MQTT connected");
                self.status.connection_state = ConnectionState::Connected;
                self.status.failed_attempts = 0;
                self.subscribe();
            }
            Event::Incoming(Packet::Publish(publish)) => {
                self.status.messages_received += 1;
                self.status.last_activity = Some(Local::now());
                match self.topics.decode_command(&publish.topic, &publish.payload) {
                    Ok(signal) => {
                        debug!("Command on {} raises {:?}", publish.topic, signal);
                        self.signals.raise(signal);
                    }
                    Err(e) => warn!("Ignoring MQTT command: {}", e),
                }
            }
            _ => {}
        }
    }

    fn subscribe(&self) {
        for filter in self.topics.subscriptions() {
            if let Err(e) = self.client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                error!("Subscribe to {} failed: {}", filter, e);
            }
        }
    }

    fn connection_failed(&mut self, e: rumqttc::ConnectionError) {
        self.status.failed_attempts += 1;
        let attempts = self.status.failed_attempts;

        if attempts > self.settings.max_retries {
            if self.status.connection_state != ConnectionState::Failed {
                error!(
                    "MQTT broker unreachable after {} attempts, retrying every {:?}: {}",
                    self.settings.max_retries, SLOW_RETRY, e
                );
            }
            self.status.connection_state = ConnectionState::Failed;
        } else {
            warn!(
                "MQTT connection error (attempt {}/{}): {}",
                attempts, self.settings.max_retries, e
            );
            self.status.connection_state = ConnectionState::Reconnecting;
        }
    }

    fn forward(&mut self, event: Outbound) {
        if self.status.connection_state != ConnectionState::Connected {
            self.status.messages_dropped += 1;
            debug!("MQTT not connected, dropping {:?}", event);
            return;
        }

        let (topic, payload) = match self.topics.encode(&event) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.status.messages_dropped += 1;
                warn!("{}", e);
                return;
            }
        };

        match self.client.try_publish(topic.as_str(), QoS::AtMostOnce, false, payload) {
            Ok(()) => {
                self.status.messages_sent += 1;
                self.status.last_activity = Some(Local::now());
            }
            Err(e) => {
                self.status.messages_dropped += 1;
                warn!("Publish to {} failed: {}", topic, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_backs_off_then_slows_down() {
        let settings = MqttSettings {
            max_retries: 3,
            retry_backoff_ms: 500,
            ..MqttSettings::default()
        };
        let delay = |failed_attempts| {
            MqttStatus {
                failed_attempts,
                ..MqttStatus::default()
            }
            .retry_delay(&settings)
        };

        assert_eq!(delay(1), Duration::from_millis(500));
        assert_eq!(delay(2), Duration::from_secs(1));
        assert_eq!(delay(3), Duration::from_secs(2));
        assert_eq!(delay(4), SLOW_RETRY);
    }

    #[test]
    fn backoff_is_capped() {
        let settings = MqttSettings {
            max_retries: 40,
            retry_backoff_ms: 1000,
            ..MqttSettings::default()
        };
        let status = MqttStatus {
            failed_attempts: 30,
            ..MqttStatus::default()
        };
        assert_eq!(status.retry_delay(&settings), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn events_are_dropped_while_disconnected() {
        let (tx, rx) = mpsc::channel(4);
        let mut bridge = MqttBridge::new(MqttSettings::default(), rx, Arc::new(SignalSet::new()));
        drop(tx);

        bridge.forward(Outbound::Status(crate::publish::StatusEvent::Display { on: true }));
        assert_eq!(bridge.status().messages_dropped, 1);
        assert_eq!(bridge.status().messages_sent, 0);
    }
}
