//! MQTT message bus implementation.
//!
//! Wraps a rumqttc client. The event loop runs in a background task that
//! delivers incoming publishes to subscribed handlers and re-issues every
//! subscription after a reconnect, since sessions are clean by default.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use backon::BackoffBuilder;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{BusError, InboundMessage, MessageBus, MessageHandler, MqttConfig, OutboundMessage, Result};
use crate::utils::retry::{reconnect_backoff, MAX_RECONNECT_DELAY};

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

const PLAIN_PORT: u16 = 1883;
const TLS_PORT: u16 = 8883;

type Subscriptions = Arc<RwLock<Vec<(String, Arc<dyn MessageHandler>)>>>;

/// Parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse a broker URL such as `tcp://127.0.0.1:1883` or `ssl://broker`.
///
/// Schemes `tcp` and `mqtt` are plain; `ssl`, `tls` and `mqtts` use TLS.
pub fn parse_broker_url(url: &str) -> Result<BrokerAddress> {
    let invalid = |reason: &str| BusError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
    let tls = match scheme.to_ascii_lowercase().as_str() {
        "tcp" | "mqtt" => false,
        "ssl" | "tls" | "mqtts" => true,
        _ => return Err(invalid("unsupported scheme")),
    };

    let authority = rest.trim_end_matches('/');
    let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
        let (host, after) = v6.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    let port = match port {
        Some(port) => port.parse().map_err(|_| invalid("invalid port"))?,
        None if tls => TLS_PORT,
        None => PLAIN_PORT,
    };

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Default client id: hostname followed by the current second.
pub fn default_client_id() -> String {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let second = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() % 60)
        .unwrap_or(0);
    format!("{}{}", hostname, second)
}

/// Map a numeric QoS onto MQTT's three levels.
pub fn to_mqtt_qos(qos: u8) -> Result<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(BusError::InvalidQos(other)),
    }
}

/// Build client options from configuration.
pub fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions> {
    let address = parse_broker_url(&config.broker)?;
    let client_id = config.client_id.clone().unwrap_or_else(default_client_id);

    let mut options = MqttOptions::new(client_id, address.host, address.port);
    options
        .set_keep_alive(Duration::from_secs(config.keep_alive_secs))
        .set_clean_session(config.clean_session);

    if let Some(username) = config.username.as_deref().filter(|u| !u.is_empty()) {
        let password = config.password.clone().unwrap_or_default();
        options.set_credentials(username, password);
    }

    if address.tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    Ok(options)
}

/// MQTT bus backed by a single broker connection.
pub struct MqttBus {
    client: AsyncClient,
    handlers: Subscriptions,
    subscription_qos: QoS,
}

impl MqttBus {
    /// Connect to the broker.
    ///
    /// Returns once the broker acknowledged the connection. Failing to
    /// connect here is an error; later disconnects are retried in the
    /// background.
    pub async fn connect(config: &MqttConfig) -> Result<Self> {
        let options = mqtt_options(config)?;
        let subscription_qos = to_mqtt_qos(config.subscription_qos)?;
        let client_id = options.client_id();

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => continue,
                Err(e) => {
                    return Err(BusError::Connection(format!(
                        "Failed to connect to {}: {}",
                        config.broker, e
                    )))
                }
            }
        }

        info!(broker = %config.broker, client_id = %client_id, "Connected");

        let handlers: Subscriptions = Arc::new(RwLock::new(Vec::new()));
        tokio::spawn(Self::run_event_loop(
            eventloop,
            client.clone(),
            handlers.clone(),
            subscription_qos,
        ));

        Ok(Self {
            client,
            handlers,
            subscription_qos,
        })
    }

    /// Drive the connection: deliver publishes, resubscribe after reconnects.
    async fn run_event_loop(
        mut eventloop: EventLoop,
        client: AsyncClient,
        handlers: Subscriptions,
        subscription_qos: QoS,
    ) {
        let backoff_builder = reconnect_backoff();
        let mut backoff_iter = backoff_builder.build();

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = Arc::new(InboundMessage {
                        topic: publish.topic,
                        qos: publish.qos as u8,
                        payload: publish.payload,
                        message_id: publish.pkid,
                    });
                    let handlers = handlers.read().await;
                    let delivered = super::dispatch_to_handlers(&handlers, &message);
                    debug!(
                        topic = %message.topic,
                        message_id = message.message_id,
                        handlers = delivered,
                        "Received message"
                    );
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected");
                    // Reset backoff on successful connection
                    backoff_iter = backoff_builder.build();

                    for (filter, _) in handlers.read().await.iter() {
                        if let Err(e) = client.try_subscribe(filter.as_str(), subscription_qos) {
                            error!(filter = %filter, error = %e, "Failed to resubscribe");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(MAX_RECONNECT_DELAY);
                    warn!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Broker connection error, reconnecting after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %message.topic))]
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let qos = to_mqtt_qos(message.qos)?;
        self.client
            .publish_bytes(message.topic, qos, message.retain, message.payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.handlers
            .write()
            .await
            .push((filter.to_string(), handler));

        self.client
            .subscribe(filter, self.subscription_qos)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        info!(filter = %filter, qos = ?self.subscription_qos, "Subscribed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_url() {
        let address = parse_broker_url("tcp://127.0.0.1:1883").unwrap();
        assert_eq!(
            address,
            BrokerAddress {
                host: "127.0.0.1".to_string(),
                port: 1883,
                tls: false
            }
        );
    }

    #[test]
    fn test_parse_default_ports() {
        assert_eq!(parse_broker_url("mqtt://broker").unwrap().port, 1883);
        let tls = parse_broker_url("ssl://broker/").unwrap();
        assert_eq!(tls.port, 8883);
        assert!(tls.tls);
        assert!(parse_broker_url("mqtts://broker:9999").unwrap().tls);
    }

    #[test]
    fn test_parse_ipv6_url() {
        let address = parse_broker_url("tcp://[::1]:1884").unwrap();
        assert_eq!(address.host, "::1");
        assert_eq!(address.port, 1884);
    }

    #[test]
    fn test_parse_invalid_urls() {
        assert!(parse_broker_url("127.0.0.1:1883").is_err());
        assert!(parse_broker_url("http://broker").is_err());
        assert!(parse_broker_url("tcp://:1883").is_err());
        assert!(parse_broker_url("tcp://broker:port").is_err());
    }

    #[test]
    fn test_to_mqtt_qos() {
        assert_eq!(to_mqtt_qos(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(to_mqtt_qos(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(to_mqtt_qos(3), Err(BusError::InvalidQos(3))));
    }

    #[test]
    fn test_mqtt_options_from_config() {
        let config = MqttConfig {
            broker: "tcp://broker:1884".to_string(),
            client_id: Some("dispatcher".to_string()),
            username: Some("bot".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        };
        let options = mqtt_options(&config).unwrap();
        assert_eq!(options.client_id(), "dispatcher");
        assert_eq!(options.broker_address(), ("broker".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(2));
        assert!(options.clean_session());
        assert_eq!(
            options.credentials(),
            Some(("bot".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_mqtt_options_without_username_ignores_password() {
        let config = MqttConfig {
            password: Some("secret".to_string()),
            ..Default::default()
        };
        let options = mqtt_options(&config).unwrap();
        assert!(options.credentials().is_none());
    }

    #[test]
    fn test_default_client_id_is_not_empty() {
        assert!(!default_client_id().is_empty());
    }
}
