// bin/tempmon/esp.rs

use anyhow::anyhow;
use esp_idf_hal::{
    delay::{Ets, FreeRtos},
    gpio::{
        AnyIOPin, AnyInputPin, AnyOutputPin, IOPin, Input, InputPin, Output, OutputPin, PinDriver,
    },
    peripherals::Peripherals,
    spi::{config::Config as SpiConfig, SpiDeviceDriver, SpiDriver, SpiDriverConfig},
    units::FromValueType,
};
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs, timer::EspTaskTimerService, wifi::WifiDriver};
use esp_idf_sys::{esp, esp_app_desc};
use mipidsi::{
    interface::SpiInterface,
    models::ST7789,
    options::{ColorInversion, Orientation, Rotation},
    Builder,
};

use tempmon::*;

const CONFIG_RESET_COUNT: i32 = 9;
const SPI_BUF_SIZE: usize = 512;

esp_app_desc!();

pub fn run() -> anyhow::Result<()> {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    // eventfd is needed by our mio poll implementation
    #[allow(clippy::needless_update)]
    let config = esp_idf_sys::esp_vfs_eventfd_config_t {
        max_fds: 1,
        ..Default::default()
    };
    esp! { unsafe { esp_idf_sys::esp_vfs_eventfd_register(&config) } }?;

    info!("Starting up, firmware v{FW_VERSION}");

    let sysloop = EspSystemEventLoop::take()?;
    let timer = EspTaskTimerService::new()?;
    let nvs_default_partition = nvs::EspDefaultNvsPartition::take()?;

    let ns = env!("CARGO_BIN_NAME");
    let nvs = nvs::EspNvs::new(nvs_default_partition.clone(), ns, true)
        .map_err(|e| anyhow!("Could not get namespace {ns}: {e:?}"))?;
    info!("Got namespace {ns:?} from default partition");
    let mut store = NvsStore::new(nvs);

    #[cfg(feature = "reset_settings")]
    let config = {
        let c = MyConfig::default();
        store.save(&c)?;
        c
    };

    #[cfg(not(feature = "reset_settings"))]
    let config = match store.load() {
        None => {
            error!("Could not read nvs config, using defaults");
            let c = MyConfig::default();
            store.save(&c)?;
            info!("Successfully saved default config to nvs.");
            c
        }

        // using settings saved on nvs if we could find them
        Some(c) => c,
    };
    info!("My config:\n{config:#?}");

    let mut mac = [0u8; 6];
    esp! { unsafe {
        esp_idf_sys::esp_read_mac(mac.as_mut_ptr(), esp_idf_sys::esp_mac_type_t_ESP_MAC_WIFI_STA)
    } }?;

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let probe = Ds18b20Probe::new(pins.gpio26.downgrade())?;
    let reset_btn = PinDriver::input(pins.gpio38.downgrade_input())?;
    let info_btn = PinDriver::input(pins.gpio37.downgrade_input())?;
    let factory_btn = PinDriver::input(pins.gpio39.downgrade_input())?;
    let led = PinDriver::output(pins.gpio22.downgrade_output())?;

    let spi = SpiDriver::new(
        peripherals.spi2,
        pins.gpio18,
        pins.gpio23,
        None::<AnyIOPin>,
        &SpiDriverConfig::new(),
    )?;
    let spi_dev = SpiDeviceDriver::new(
        spi,
        Some(pins.gpio5),
        &SpiConfig::new().baudrate(26.MHz().into()),
    )?;
    let dc = PinDriver::output(pins.gpio16)?;
    let rst = PinDriver::output(pins.gpio17)?;
    let buffer = Box::leak(Box::new([0u8; SPI_BUF_SIZE]));
    let display = Builder::new(ST7789, SpiInterface::new(spi_dev, dc, buffer))
        .display_size(240, 320)
        .orientation(Orientation::new().rotate(Rotation::Deg90))
        .invert_colors(ColorInversion::Normal)
        .reset_pin(rst)
        .init(&mut Ets)
        .map_err(|e| anyhow!("Display init failed: {e:?}"))?;

    let mqtt = MqttManager::new(EspMqttTransport::new(), config.mqtt(), &mac);
    let ctl = ControlLoop::new(
        probe,
        display,
        mqtt,
        reset_btn,
        info_btn,
        PortalState::Connecting,
        NetInfo {
            mac,
            ..Default::default()
        },
    );

    let wifidriver = WifiDriver::new(
        peripherals.modem,
        sysloop.clone(),
        Some(nvs_default_partition),
    )?;

    let state = Box::pin(MyState::new(config, Box::new(store)));
    let shared_state = Arc::new(state);

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(Box::pin(async move {
            let wifi_loop = WifiLoop {
                state: shared_state.clone(),
                wifi: None,
            };

            info!("Entering main loop...");
            tokio::select! {
                _ = Box::pin(poll_reset(shared_state.clone(), factory_btn)) => { error!("poll_reset() ended."); }
                _ = Box::pin(run_led(shared_state.clone(), led)) => { error!("run_led() ended."); }
                _ = Box::pin(run_control(shared_state.clone(), ctl)) => { error!("run_control() ended."); }
                _ = Box::pin(run_api_server(shared_state.clone())) => { error!("run_api_server() ended."); }
                _ = Box::pin(wifi_loop.run(wifidriver, sysloop, timer)) => { error!("wifi_loop.run() ended."); }
            };
        }));

    // not actually returning from main() but we reboot instead
    info!("main() finished, reboot.");
    FreeRtos::delay_ms(3000);
    esp_idf_hal::reset::restart();
}

async fn poll_reset(
    state: Arc<Pin<Box<MyState>>>,
    button: PinDriver<'_, AnyInputPin, Input>,
) -> anyhow::Result<()> {
    let mut uptime: u32 = 0;
    loop {
        sleep(Duration::from_secs(1)).await;

        uptime += 1;
        *(state.uptime.write().await) = uptime;

        if *state.reset.read().await {
            // let the http response go out first
            sleep(Duration::from_millis(2000)).await;
            esp_idf_hal::reset::restart();
        }

        if button.is_low() {
            Box::pin(reset_button(&state, &button)).await?;
        }
    }
}

async fn reset_button(
    state: &Arc<Pin<Box<MyState>>>,
    button: &PinDriver<'_, AnyInputPin, Input>,
) -> anyhow::Result<()> {
    let mut reset_cnt = CONFIG_RESET_COUNT;

    while button.is_low() {
        // button is pressed and kept down, countdown and factory reset if reach zero
        warn!("Factory reset? {reset_cnt}");

        if reset_cnt == 0 {
            error!("Factory resetting...");
            state.store.lock().await.save(&MyConfig::default())?;
            sleep(Duration::from_millis(2000)).await;
            esp_idf_hal::reset::restart();
        }

        reset_cnt -= 1;
        sleep(Duration::from_millis(500)).await;
    }
    Ok(())
}

/// Slow blink while serving the portal, fast blink while connecting.
async fn run_led(
    state: Arc<Pin<Box<MyState>>>,
    mut led: PinDriver<'_, AnyOutputPin, Output>,
) -> anyhow::Result<()> {
    let mut on = false;
    loop {
        let blink_ms = match *state.portal.read().await {
            PortalState::AccessPoint => Some(500),
            PortalState::Connected => None,
            _ => Some(100),
        };
        match blink_ms {
            Some(ms) => {
                on = !on;
                led.set_level(on.into())?;
                sleep(Duration::from_millis(ms)).await;
            }
            None => {
                on = false;
                led.set_low()?;
                sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

// EOF
