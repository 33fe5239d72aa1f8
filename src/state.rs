// state.rs

use std::{collections::VecDeque, fmt, net::Ipv4Addr};

use crate::*;

/// Where the WiFi side / configuration portal currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortalState {
    AccessPoint,
    Connecting,
    Connected,
    Reconfigured,
    WillConnect,
}

impl fmt::Display for PortalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortalState::AccessPoint => "access point",
            PortalState::Connecting => "connecting",
            PortalState::Connected => "connected",
            PortalState::Reconfigured => "reconfigure",
            PortalState::WillConnect => "will connect",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetInfo {
    pub mac: [u8; 6],
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl Default for NetInfo {
    fn default() -> Self {
        NetInfo {
            mac: [0; 6],
            ip: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl NetInfo {
    pub fn mac_string(&self) -> String {
        let m = self.mac;
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Something the portal or WiFi side wants the control loop to know.
///
/// Queued in [`MyState`] and handed to the control loop one per tick.
#[derive(Clone, Debug, PartialEq)]
pub enum PortalEvent {
    None,
    Reconfigured(MqttSettings),
    /// Addresses only, the portal state arrives separately as `StateChanged`.
    Connected(NetInfo),
    StateChanged(PortalState),
}

pub struct MyState {
    pub config: RwLock<MyConfig>,
    pub store: Mutex<Box<dyn ConfigStore + Send + Sync>>,
    pub uptime: RwLock<u32>,
    pub api_cnt: AtomicU32,
    pub wifi_up: RwLock<bool>,
    pub portal: RwLock<PortalState>,
    pub net: RwLock<NetInfo>,
    pub data: RwLock<TempValues>,
    pub events: RwLock<VecDeque<PortalEvent>>,
    pub reset: RwLock<bool>,
}

impl MyState {
    pub fn new(config: MyConfig, store: Box<dyn ConfigStore + Send + Sync>) -> Self {
        MyState {
            config: RwLock::new(config),
            store: Mutex::new(store),
            uptime: RwLock::new(0),
            api_cnt: AtomicU32::new(0),
            wifi_up: RwLock::new(false),
            portal: RwLock::new(PortalState::Connecting),
            net: RwLock::new(NetInfo::default()),
            data: RwLock::new(TempValues::default()),
            events: RwLock::new(VecDeque::new()),
            reset: RwLock::new(false),
        }
    }

    pub async fn push_event(&self, ev: PortalEvent) {
        self.events.write().await.push_back(ev);
    }

    pub async fn next_event(&self) -> PortalEvent {
        self.events
            .write()
            .await
            .pop_front()
            .unwrap_or(PortalEvent::None)
    }

    pub async fn set_portal(&self, portal: PortalState) {
        let mut cur = self.portal.write().await;
        if *cur != portal {
            info!("Portal state: {portal}");
            *cur = portal;
            drop(cur);
            self.push_event(PortalEvent::StateChanged(portal)).await;
        }
    }
}


// EOF
