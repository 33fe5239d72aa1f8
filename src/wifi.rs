// wifi.rs

use anyhow::anyhow;
use embedded_svc::wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration};
use esp_idf_svc::{
    eventloop::{EspEventLoop, System},
    netif::{self, EspNetif},
    timer::{EspTimerService, Task},
    wifi::{AsyncWifi, EspWifi, WifiDriver},
};

use crate::*;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WifiLoop<'a> {
    pub state: Arc<Pin<Box<MyState>>>,
    pub wifi: Option<AsyncWifi<EspWifi<'a>>>,
}

impl<'a> WifiLoop<'a> {
    pub async fn run(
        mut self,
        wifidriver: WifiDriver<'a>,
        sysloop: EspEventLoop<System>,
        timer: EspTimerService<Task>,
    ) -> anyhow::Result<()> {
        info!("Initializing Wi-Fi...");

        let net_if = EspNetif::new(netif::NetifStack::Sta)?;

        let mac = net_if.get_mac()?;
        self.state.net.write().await.mac = mac;

        let espwifi = EspWifi::wrap_all(wifidriver, net_if, EspNetif::new(netif::NetifStack::Ap)?)?;
        self.wifi = Some(AsyncWifi::wrap(espwifi, sysloop, timer)?);

        let config = self.state.config.read().await.clone();
        if config.wifi_ssid.is_empty() {
            info!("No WiFi credentials, starting portal.");
            return self.run_portal(&config.portal_ssid).await;
        }

        Box::pin(self.configure(&config.wifi_ssid, &config.wifi_pass)).await?;
        self.state.set_portal(PortalState::Connecting).await;

        if let Err(e) = Box::pin(self.initial_connect()).await {
            error!("WiFi connection failed: {e:?}");
            Box::pin(self.wifi_mut()?.stop()).await?;
            return self.run_portal(&config.portal_ssid).await;
        }

        let ip_info = self.wifi_mut()?.wifi().sta_netif().get_ip_info()?;
        let net = NetInfo {
            mac,
            ip: ip_info.ip,
            mask: mask_addr(ip_info.subnet.mask.0),
            gateway: ip_info.subnet.gateway,
        };
        info!("WiFi up: {net:?}, DNS: {:?}", ip_info.dns);
        self.announce(net, PortalState::Connected).await;

        self.stay_connected().await
    }

    fn wifi_mut(&mut self) -> anyhow::Result<&mut AsyncWifi<EspWifi<'a>>> {
        self.wifi.as_mut().ok_or_else(|| anyhow!("WiFi driver not initialized"))
    }

    async fn announce(&self, net: NetInfo, portal: PortalState) {
        *self.state.net.write().await = net;
        *self.state.portal.write().await = portal;
        self.state.push_event(PortalEvent::StateChanged(portal)).await;
        self.state.push_event(PortalEvent::Connected(net)).await;
        *self.state.wifi_up.write().await = true;
    }

    pub async fn configure(&mut self, ssid: &str, pass: &str) -> anyhow::Result<()> {
        info!("WiFi setting credentials...");
        let wifi = self.wifi_mut()?;
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: ssid.try_into().map_err(|_| anyhow!("SSID too long"))?,
            password: pass.try_into().map_err(|_| anyhow!("WiFi password too long"))?,
            ..Default::default()
        }))?;

        info!("WiFi driver starting...");
        Ok(Box::pin(wifi.start()).await?)
    }

    /// Serve the configuration portal from our own access point, forever.
    async fn run_portal(mut self, portal_ssid: &str) -> anyhow::Result<()> {
        let wifi = self.wifi_mut()?;
        wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
            ssid: portal_ssid
                .try_into()
                .map_err(|_| anyhow!("Portal SSID too long"))?,
            auth_method: AuthMethod::None,
            ..Default::default()
        }))?;
        Box::pin(wifi.start()).await?;
        Box::pin(wifi.wait_netif_up()).await?;

        let ip_info = wifi.wifi().ap_netif().get_ip_info()?;
        let net = NetInfo {
            mac: self.state.net.read().await.mac,
            ip: ip_info.ip,
            mask: mask_addr(ip_info.subnet.mask.0),
            gateway: ip_info.subnet.gateway,
        };
        info!("Portal {portal_ssid:?} up at {}", net.ip);
        self.announce(net, PortalState::AccessPoint).await;

        loop {
            sleep(Duration::from_secs(3600)).await;
        }
    }

    pub async fn initial_connect(&mut self) -> anyhow::Result<()> {
        self.do_connect_loop(true).await
    }

    pub async fn stay_connected(mut self) -> anyhow::Result<()> {
        self.do_connect_loop(false).await
    }

    async fn do_connect_loop(&mut self, initial: bool) -> anyhow::Result<()> {
        let state = self.state.clone();
        let wifi = self.wifi_mut()?;
        loop {
            // wait for disconnect before trying to connect again
            let timeout = if initial { Some(CONNECT_TIMEOUT) } else { None };
            Box::pin(wifi.wifi_wait(|w| w.is_up(), timeout)).await.ok();

            if !initial {
                state.set_portal(PortalState::Connecting).await;
            }
            info!("WiFi connecting...");
            Box::pin(wifi.connect()).await.ok();

            info!("WiFi waiting for association...");
            let res = Box::pin(wifi.ip_wait_while(|w| w.is_up().map(|s| !s), timeout)).await;
            if let Err(e) = res {
                error!("WiFi error: {e:?}");

                // only give up on the initial connection, otherwise keep trying
                if initial {
                    bail!(e);
                }
                continue;
            }

            info!("WiFi connected.");
            if initial {
                return Ok(());
            }
            state.set_portal(PortalState::Connected).await;
        }
    }
}

fn mask_addr(bits: u8) -> net::Ipv4Addr {
    net::Ipv4Addr::from(u32::MAX.checked_shl(32 - u32::from(bits.min(32))).unwrap_or(0))
}

// EOF
