// mqtt.rs

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use crate::*;

/// Minimum time between two failed connection attempts.
pub const MQTT_RETRY_MS: u64 = 5000;
pub const CLIENT_ID_PREFIX: &str = "Temperature-";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MqttState {
    Connecting,
    Connected,
    Disconnected,
    NotUsed,
}

impl fmt::Display for MqttState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MqttState::Connecting => "connecting",
            MqttState::Connected => "connected",
            MqttState::Disconnected => "disconnected",
            MqttState::NotUsed => "not used",
        })
    }
}

/// The blocking operations the connection state machine needs from an
/// MQTT client.
pub trait MqttTransport {
    fn resolve(&mut self, host: &str) -> anyhow::Result<IpAddr>;
    fn connect(
        &mut self,
        addr: SocketAddr,
        client_id: &str,
        user: &str,
        pass: &str,
    ) -> anyhow::Result<()>;
    fn is_connected(&mut self) -> bool;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> anyhow::Result<()>;
    fn disconnect(&mut self);
}

/// `Temperature-` followed by the last three MAC bytes in hex.
pub fn client_id(mac: &[u8; 6]) -> String {
    format!(
        "{CLIENT_ID_PREFIX}{:02x}{:02x}{:02x}",
        mac[3], mac[4], mac[5]
    )
}

pub struct MqttManager<T> {
    transport: T,
    settings: MqttSettings,
    client_id: String,
    state: MqttState,
    last_attempt: Option<u64>,
    attempts: u32,
}

impl<T: MqttTransport> MqttManager<T> {
    pub fn new(transport: T, settings: MqttSettings, mac: &[u8; 6]) -> Self {
        let state = if settings.is_used() {
            MqttState::Disconnected
        } else {
            info!("MQTT is disabled.");
            MqttState::NotUsed
        };
        MqttManager {
            transport,
            settings,
            client_id: client_id(mac),
            state,
            last_attempt: None,
            attempts: 0,
        }
    }

    pub fn state(&self) -> MqttState {
        self.state
    }

    pub fn is_used(&self) -> bool {
        self.state != MqttState::NotUsed
    }

    pub fn is_connected(&self) -> bool {
        self.state == MqttState::Connected
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn topic(&self) -> &str {
        &self.settings.name
    }

    /// Connection attempts made so far, failed DNS lookups included.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drive the connection. Returns true if the state changed.
    pub fn tick(&mut self, now: u64) -> bool {
        let before = self.state;
        self.service(now);
        self.state != before
    }

    fn service(&mut self, now: u64) {
        if self.state == MqttState::NotUsed {
            return;
        }
        if self.transport.is_connected() {
            self.state = MqttState::Connected;
            return;
        }
        if self.state == MqttState::Connected {
            warn!("MQTT connection lost.");
            self.state = MqttState::Disconnected;
        }
        if let Some(t) = self.last_attempt {
            if now.saturating_sub(t) <= MQTT_RETRY_MS {
                return;
            }
        }

        self.attempts += 1;
        self.state = MqttState::Connecting;
        let server = &self.settings.server;
        let ip = match self.transport.resolve(server) {
            Ok(ip) => ip,
            Err(e) => {
                error!("Unable to resolve hostname {server}: {e:#}, try again in 5 seconds");
                self.state = MqttState::Disconnected;
                self.last_attempt = Some(now);
                return;
            }
        };

        let addr = SocketAddr::new(ip, self.settings.port);
        info!(
            "Attempting MQTT connection to {server}:{port} ({ip}) as {id}...",
            port = self.settings.port,
            id = self.client_id
        );
        match self.transport.connect(
            addr,
            &self.client_id,
            &self.settings.user,
            &self.settings.pass,
        ) {
            Ok(()) => {
                info!("MQTT connected.");
                self.state = MqttState::Connected;
            }
            Err(e) => {
                error!("MQTT connection failed: {e:#}, try again in 5 seconds");
                self.transport.disconnect();
                self.state = MqttState::Disconnected;
                self.last_attempt = Some(now);
            }
        }
    }

    /// Send one message on the configured topic. Does nothing unless
    /// connected; a failure shows up as a state change on the next tick.
    pub fn publish(&mut self, payload: &str) -> bool {
        if self.state != MqttState::Connected {
            return false;
        }
        info!("MQTT sending {}", self.settings.name);
        match self
            .transport
            .publish(&self.settings.name, payload.as_bytes())
        {
            Ok(()) => true,
            Err(e) => {
                error!("MQTT send error: {e:#}");
                false
            }
        }
    }

    /// Apply new settings from the configuration portal.
    pub fn reconfigure(&mut self, settings: MqttSettings) {
        self.transport.disconnect();
        self.last_attempt = None;
        self.state = if settings.is_used() {
            info!("MQTT reconfigured, server {}", settings.server);
            MqttState::Connecting
        } else {
            info!("MQTT server cleared, MQTT is disabled.");
            MqttState::NotUsed
        };
        self.settings = settings;
    }
}

#[cfg(target_os = "espidf")]
pub use esp_transport::*;

#[cfg(target_os = "espidf")]
mod esp_transport {
    use super::*;

    use std::{net::ToSocketAddrs, sync::atomic::AtomicBool};

    use anyhow::anyhow;
    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_svc::mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration, QoS};

    const CONNACK_WAIT_MS: u32 = 3000;
    const CONNACK_POLL_MS: u32 = 100;

    /// The esp-idf MQTT client. Its connection runs on its own task, so
    /// the connected flag is fed from the event callback.
    #[derive(Default)]
    pub struct EspMqttTransport {
        client: Option<EspMqttClient<'static>>,
        connected: Arc<AtomicBool>,
    }

    impl EspMqttTransport {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl MqttTransport for EspMqttTransport {
        fn resolve(&mut self, host: &str) -> anyhow::Result<IpAddr> {
            (host, 0)
                .to_socket_addrs()?
                .map(|a| a.ip())
                .next()
                .ok_or_else(|| anyhow!("no address for {host}"))
        }

        fn connect(
            &mut self,
            addr: SocketAddr,
            client_id: &str,
            user: &str,
            pass: &str,
        ) -> anyhow::Result<()> {
            self.disconnect();

            let url = format!("mqtt://{addr}");
            let conf = MqttClientConfiguration {
                client_id: Some(client_id),
                username: (!user.is_empty()).then_some(user),
                password: (!pass.is_empty()).then_some(pass),
                keep_alive_interval: Some(Duration::from_secs(25)),
                ..Default::default()
            };

            let flag = self.connected.clone();
            let client = EspMqttClient::new_cb(&url, &conf, move |event| match event.payload() {
                EventPayload::Connected(_) => flag.store(true, Ordering::Relaxed),
                EventPayload::Disconnected => flag.store(false, Ordering::Relaxed),
                EventPayload::Error(e) => warn!("MQTT error: {e:?}"),
                _ => {}
            })?;
            self.client = Some(client);

            let mut waited = 0;
            while waited < CONNACK_WAIT_MS {
                if self.connected.load(Ordering::Relaxed) {
                    return Ok(());
                }
                FreeRtos::delay_ms(CONNACK_POLL_MS);
                waited += CONNACK_POLL_MS;
            }
            bail!("no answer from {addr}");
        }

        fn is_connected(&mut self) -> bool {
            self.client.is_some() && self.connected.load(Ordering::Relaxed)
        }

        fn publish(&mut self, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
            match self.client.as_mut() {
                Some(c) => {
                    c.publish(topic, QoS::AtMostOnce, false, payload)?;
                    Ok(())
                }
                None => bail!("not connected"),
            }
        }

        fn disconnect(&mut self) {
            self.client = None;
            self.connected.store(false, Ordering::Relaxed);
        }
    }
}


// EOF
