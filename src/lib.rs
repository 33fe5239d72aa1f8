// lib.rs
#![warn(clippy::large_futures)]

pub use std::{
    net,
    pin::Pin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

pub use anyhow::bail;
pub use log::*;
pub use serde::{Deserialize, Serialize};
pub use tokio::{
    sync::{Mutex, RwLock},
    time::{sleep, Duration},
};

mod config;
pub use config::*;

mod state;
pub use state::*;

mod stats;
pub use stats::*;

mod measure;
pub use measure::*;

mod display;
pub use display::*;

mod mqtt;
pub use mqtt::*;

mod control;
pub use control::*;

mod apiserver;
pub use apiserver::*;

#[cfg(target_os = "espidf")]
mod wifi;
#[cfg(target_os = "espidf")]
pub use wifi::*;

pub const FW_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The snapshot served on `/values` and published over MQTT.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TempValues {
    pub temperature: f32,
    pub temperature_min: f32,
    pub temperature_max: f32,
}

impl TempValues {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Uptime {
    pub uptime: u32,
    pub uptime_s: String,
}

impl Uptime {
    pub fn new(uptime: u32) -> Self {
        let days = uptime / 86400;
        let hours = uptime % 86400 / 3600;
        let mins = uptime % 3600 / 60;
        let secs = uptime % 60;
        Uptime {
            uptime,
            uptime_s: format!("{days}d {hours:02}:{mins:02}:{secs:02}"),
        }
    }
}


// EOF
