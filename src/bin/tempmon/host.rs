// bin/tempmon/host.rs

use std::{
    convert::Infallible,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use embedded_hal::digital::{ErrorType, InputPin};
use tempmon::*;

const HOST_API_PORT: u16 = 8080;

/// Slow triangle wave around room temperature.
struct SimulatedProbe {
    n: u32,
}

impl TemperatureProbe for SimulatedProbe {
    type Error = Infallible;

    fn read_celsius(&mut self) -> Result<f32, Self::Error> {
        self.n = self.n.wrapping_add(1);
        let phase = (self.n % 80) as f32;
        let offset = if phase < 40.0 { phase } else { 80.0 - phase };
        Ok(19.0 + offset * 0.1)
    }
}

/// A button nobody presses.
struct Released;

impl ErrorType for Released {
    type Error = Infallible;
}

impl InputPin for Released {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(true)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

struct NoMqtt;

impl MqttTransport for NoMqtt {
    fn resolve(&mut self, host: &str) -> anyhow::Result<IpAddr> {
        bail!("{host}: MQTT is not available on host builds")
    }

    fn connect(
        &mut self,
        _addr: SocketAddr,
        _client_id: &str,
        _user: &str,
        _pass: &str,
    ) -> anyhow::Result<()> {
        bail!("MQTT is not available on host builds")
    }

    fn is_connected(&mut self) -> bool {
        false
    }

    fn publish(&mut self, _topic: &str, _payload: &[u8]) -> anyhow::Result<()> {
        bail!("MQTT is not available on host builds")
    }

    fn disconnect(&mut self) {}
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    info!("Starting up, firmware v{FW_VERSION} (host simulation)");

    let config = MyConfig {
        port: std::env::var("API_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(HOST_API_PORT),
        mqtt_server: "".into(),
        ..Default::default()
    };
    info!("My config:\n{config:#?}");

    let mac = [0x02, 0, 0, 0x12, 0x34, 0x56];
    let mqtt = MqttManager::new(NoMqtt, config.mqtt(), &mac);
    let ctl = ControlLoop::new(
        SimulatedProbe { n: 0 },
        FrameBuffer::new(SCREEN_WIDTH, SCREEN_HEIGHT),
        mqtt,
        Released,
        Released,
        PortalState::Connecting,
        NetInfo {
            mac,
            ..Default::default()
        },
    );

    let state = Arc::new(Box::pin(MyState::new(config, Box::new(MemoryStore::new()))));
    let net = NetInfo {
        mac,
        ip: Ipv4Addr::LOCALHOST,
        mask: Ipv4Addr::new(255, 0, 0, 0),
        gateway: Ipv4Addr::LOCALHOST,
    };
    *state.net.write().await = net;
    *state.portal.write().await = PortalState::Connected;
    state
        .push_event(PortalEvent::StateChanged(PortalState::Connected))
        .await;
    state.push_event(PortalEvent::Connected(net)).await;
    *state.wifi_up.write().await = true;

    info!("Entering main loop...");
    tokio::select! {
        _ = Box::pin(poll_reset(state.clone())) => { info!("Restart requested, exiting."); }
        _ = Box::pin(run_control(state.clone(), ctl)) => { error!("run_control() ended."); }
        res = Box::pin(run_api_server(state.clone())) => { res?; }
    };
    Ok(())
}

async fn poll_reset(state: Arc<Pin<Box<MyState>>>) {
    let mut uptime: u32 = 0;
    loop {
        sleep(Duration::from_secs(1)).await;

        uptime += 1;
        *(state.uptime.write().await) = uptime;

        if *state.reset.read().await {
            return;
        }
    }
}

// EOF
