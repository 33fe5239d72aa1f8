// control.rs

use embedded_graphics::{draw_target::DrawTarget, pixelcolor::Rgb565};
use embedded_hal::digital::InputPin;

use crate::*;

pub const SENSOR_POLL_MS: u64 = 1000;
pub const POST_INTERVAL_MS: u64 = 10_000;
const TICK_MS: u64 = 10;

/// What happened during one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub polled: bool,
    pub redraw: RedrawFlags,
    pub reset: bool,
    pub published: bool,
    pub overlay: bool,
}

/// The whole device, stepped once per iteration of the main loop.
///
/// Buttons are active low. The reset button acts for as long as it is
/// held, the info button toggles the overlay when it is released.
pub struct ControlLoop<P, D, T, A, B> {
    sensor: SensorReader<P>,
    painter: Painter<D>,
    stats: StatsTracker,
    mqtt: MqttManager<T>,
    reset_button: A,
    info_button: B,
    last_poll: Option<u64>,
    last_post: Option<u64>,
    info_released: bool,
    show_info: bool,
    overlay_dirty: bool,
    portal: PortalState,
    net: NetInfo,
}

impl<P, D, T, A, B> ControlLoop<P, D, T, A, B>
where
    P: TemperatureProbe,
    D: DrawTarget<Color = Rgb565>,
    T: MqttTransport,
    A: InputPin,
    B: InputPin,
{
    pub fn new(
        probe: P,
        display: D,
        mqtt: MqttManager<T>,
        reset_button: A,
        info_button: B,
        portal: PortalState,
        net: NetInfo,
    ) -> Self {
        let mut ctl = ControlLoop {
            sensor: SensorReader::new(probe),
            painter: Painter::new(display),
            stats: StatsTracker::new(),
            mqtt,
            reset_button,
            info_button,
            last_poll: None,
            last_post: None,
            info_released: true,
            show_info: false,
            overlay_dirty: false,
            portal,
            net,
        };
        let fields = ctl.info_fields();
        ctl.painter.draw_chrome();
        ctl.painter.show_temperature(ctl.stats.current());
        ctl.painter.render_info_overlay(ctl.show_info, &fields);
        ctl
    }

    pub fn tick(&mut self, now: u64, event: PortalEvent) -> TickReport {
        let mut report = TickReport::default();
        self.handle_event(event);

        let due = match self.last_poll {
            None => true,
            Some(t) => now.saturating_sub(t) > SENSOR_POLL_MS,
        };
        if due {
            report.polled = true;
            if let Some(t) = self.sensor.poll() {
                report.redraw = self.update(t);
                self.last_poll = Some(now);
            }
        }

        if self.reset_button.is_low().unwrap_or(false) {
            info!("Min/Max reset");
            self.stats.reset();
            self.last_poll = None;
            report.reset = true;
        }

        if self.mqtt.tick(now) {
            self.overlay_dirty = true;
        }
        if self.mqtt.is_connected() {
            let due = match self.last_post {
                None => true,
                Some(t) => now.saturating_sub(t) > POST_INTERVAL_MS,
            };
            if due {
                report.published = self.mqtt.publish(&self.stats.values().to_json());
                self.last_post = Some(now);
            }
        }

        let released = self.info_button.is_high().unwrap_or(true);
        if released != self.info_released {
            self.info_released = released;
            if released {
                self.show_info = !self.show_info;
                self.overlay_dirty = true;
            }
        }

        if self.overlay_dirty {
            self.overlay_dirty = false;
            let fields = self.info_fields();
            self.painter.render_info_overlay(self.show_info, &fields);
            report.overlay = true;
        }
        report
    }

    fn handle_event(&mut self, event: PortalEvent) {
        match event {
            PortalEvent::None => return,
            PortalEvent::Reconfigured(settings) => self.mqtt.reconfigure(settings),
            PortalEvent::Connected(net) => {
                info!(
                    "Network up: ip {} mask {} gw {}",
                    net.ip, net.mask, net.gateway
                );
                self.net = net;
            }
            PortalEvent::StateChanged(portal) => self.portal = portal,
        }
        self.overlay_dirty = true;
    }

    fn update(&mut self, sample: f32) -> RedrawFlags {
        let flags = self.stats.update(sample);
        if flags.min {
            self.painter.show_min(self.stats.min());
        }
        if flags.max {
            self.painter.show_max(self.stats.max());
        }
        if flags.current {
            self.painter.show_temperature(self.stats.current());
        }
        flags
    }

    pub fn info_fields(&self) -> InfoFields {
        InfoFields {
            net: self.net,
            portal: self.portal,
            mqtt: self.mqtt.is_used().then(|| self.mqtt.state()),
        }
    }

    pub fn values(&self) -> TempValues {
        self.stats.values()
    }

    pub fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    pub fn painter(&self) -> &Painter<D> {
        &self.painter
    }

    pub fn mqtt(&self) -> &MqttManager<T> {
        &self.mqtt
    }

    pub fn mqtt_mut(&mut self) -> &mut MqttManager<T> {
        &mut self.mqtt
    }

    pub fn show_info(&self) -> bool {
        self.show_info
    }

    pub fn sensor(&self) -> &SensorReader<P> {
        &self.sensor
    }
}

/// Drive the control loop forever, feeding it queued portal events and
/// publishing its values for the API server.
pub async fn run_control<P, D, T, A, B>(
    state: Arc<Pin<Box<MyState>>>,
    mut ctl: ControlLoop<P, D, T, A, B>,
) -> anyhow::Result<()>
where
    P: TemperatureProbe,
    D: DrawTarget<Color = Rgb565>,
    T: MqttTransport,
    A: InputPin,
    B: InputPin,
{
    let start = std::time::Instant::now();
    loop {
        let event = state.next_event().await;
        let now = start.elapsed().as_millis() as u64;
        ctl.tick(now, event);
        *state.data.write().await = ctl.values();
        sleep(Duration::from_millis(TICK_MS)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        convert::Infallible,
        rc::Rc,
    };

    use embedded_hal::digital::ErrorType;

    use super::*;
    use crate::mqtt::tests::{settings, MockTransport};

    #[derive(Clone, Default)]
    struct Probe {
        value: Rc<Cell<Option<f32>>>,
        reads: Rc<Cell<u32>>,
    }

    impl TemperatureProbe for Probe {
        type Error = MeasurementError<()>;

        fn read_celsius(&mut self) -> Result<f32, Self::Error> {
            self.reads.set(self.reads.get() + 1);
            self.value.get().ok_or(MeasurementError::NoDeviceFound)
        }
    }

    /// Active-low button, released (high) by default.
    #[derive(Clone)]
    struct Button(Rc<Cell<bool>>);

    impl Button {
        fn new() -> Self {
            Button(Rc::new(Cell::new(true)))
        }

        fn press(&self) {
            self.0.set(false);
        }

        fn release(&self) {
            self.0.set(true);
        }
    }

    impl ErrorType for Button {
        type Error = Infallible;
    }

    impl InputPin for Button {
        fn is_high(&mut self) -> Result<bool, Self::Error> {
            Ok(self.0.get())
        }

        fn is_low(&mut self) -> Result<bool, Self::Error> {
            Ok(!self.0.get())
        }
    }

    type Ctl = ControlLoop<Probe, FrameBuffer, MockTransport, Button, Button>;

    struct Rig {
        ctl: Ctl,
        probe: Probe,
        reset: Button,
        info: Button,
    }

    fn rig(server: &str, transport: MockTransport) -> Rig {
        let probe = Probe::default();
        let reset = Button::new();
        let info = Button::new();
        let mqtt = MqttManager::new(transport, settings(server), &[0, 1, 2, 3, 4, 5]);
        let ctl = ControlLoop::new(
            probe.clone(),
            FrameBuffer::new(SCREEN_WIDTH, SCREEN_HEIGHT),
            mqtt,
            reset.clone(),
            info.clone(),
            PortalState::Connecting,
            NetInfo::default(),
        );
        Rig {
            ctl,
            probe,
            reset,
            info,
        }
    }

    fn box_has_text(ctl: &Ctl, r: ScreenRegion) -> bool {
        let fb = ctl.painter().display();
        (r.y..r.bottom()).any(|y| (r.x..r.right()).any(|x| fb.pixel(x, y) == Some(FOREGROUND)))
    }

    #[test]
    fn polls_once_per_interval() {
        let mut r = rig("", MockTransport::default());
        r.probe.value.set(Some(20.0));

        assert!(r.ctl.tick(0, PortalEvent::None).polled);
        assert!(!r.ctl.tick(500, PortalEvent::None).polled);
        assert!(!r.ctl.tick(1000, PortalEvent::None).polled);
        assert!(r.ctl.tick(1001, PortalEvent::None).polled);
        assert_eq!(r.probe.reads.get(), 2);
    }

    #[test]
    fn failed_read_retries_next_tick() {
        let mut r = rig("", MockTransport::default());
        let rep = r.ctl.tick(0, PortalEvent::None);
        assert!(rep.polled);
        assert_eq!(rep.redraw, RedrawFlags::NONE);

        r.probe.value.set(Some(-85.0));
        assert_eq!(r.ctl.tick(10, PortalEvent::None).redraw, RedrawFlags::NONE);

        r.probe.value.set(Some(19.5));
        assert_eq!(r.ctl.tick(20, PortalEvent::None).redraw, RedrawFlags::ALL);
        assert_eq!(r.probe.reads.get(), 3);
        assert_eq!(r.ctl.sensor().errors(), 2);
    }

    #[test]
    fn unplugged_sensor_logs_once_per_burst() {
        let mut r = rig("", MockTransport::default());
        for now in (0..1000).step_by(TICK_MS as usize) {
            assert!(r.ctl.tick(now, PortalEvent::None).polled);
        }
        assert_eq!(r.probe.reads.get(), 100);
        assert_eq!(r.ctl.sensor().errors(), 100);
        assert_eq!(r.ctl.sensor().reported(), 1);

        r.probe.value.set(Some(20.0));
        r.ctl.tick(1000, PortalEvent::None);
        r.probe.value.set(None);
        r.ctl.tick(2001, PortalEvent::None);
        assert_eq!(r.ctl.sensor().reported(), 2);
    }

    #[test]
    fn redraws_follow_stats() {
        let mut r = rig("", MockTransport::default());
        let l = *r.ctl.painter().layout();
        let mut got = Vec::new();
        for (i, t) in [20.0, 20.0, 21.5, 21.4].into_iter().enumerate() {
            r.probe.value.set(Some(t));
            got.push(r.ctl.tick(i as u64 * 1001, PortalEvent::None).redraw);
        }
        assert_eq!(got[0], RedrawFlags::ALL);
        assert_eq!(got[1], RedrawFlags::NONE);
        assert_eq!(got[2], RedrawFlags {
            min: false,
            max: true,
            current: true,
        });
        assert_eq!(got[3], RedrawFlags {
            min: false,
            max: false,
            current: true,
        });
        assert!(box_has_text(&r.ctl, l.min_box));
        assert!(box_has_text(&r.ctl, l.max_box));
        assert!(box_has_text(&r.ctl, l.temp_box));
        assert_eq!(r.ctl.values(), TempValues {
            temperature: 21.4,
            temperature_min: 20.0,
            temperature_max: 21.5,
        });
    }

    #[test]
    fn reset_button_forces_full_redraw() {
        let mut r = rig("", MockTransport::default());
        r.probe.value.set(Some(20.0));
        r.ctl.tick(0, PortalEvent::None);
        r.probe.value.set(Some(25.0));
        r.ctl.tick(1001, PortalEvent::None);
        assert_eq!(r.ctl.stats().max(), 25.0);

        r.reset.press();
        let rep = r.ctl.tick(1100, PortalEvent::None);
        assert!(rep.reset);
        assert_eq!(r.ctl.values(), TempValues::default());
        r.reset.release();

        r.probe.value.set(Some(22.0));
        let rep = r.ctl.tick(1200, PortalEvent::None);
        assert!(rep.polled);
        assert_eq!(rep.redraw, RedrawFlags::ALL);
        assert_eq!(r.ctl.stats().max(), 22.0);
        assert_eq!(r.ctl.stats().min(), 22.0);
    }

    #[test]
    fn info_button_toggles_on_release() {
        let mut r = rig("", MockTransport::default());
        let info_box = r.ctl.painter().layout().info_box;
        assert!(!r.ctl.tick(0, PortalEvent::None).overlay);

        r.info.press();
        assert!(!r.ctl.tick(10, PortalEvent::None).overlay);
        assert!(!r.ctl.show_info());
        // held
        assert!(!r.ctl.tick(20, PortalEvent::None).overlay);

        r.info.release();
        assert!(r.ctl.tick(30, PortalEvent::None).overlay);
        assert!(r.ctl.show_info());
        assert!(box_has_text(&r.ctl, info_box));
        assert!(!r.ctl.tick(40, PortalEvent::None).overlay);

        r.info.press();
        r.ctl.tick(50, PortalEvent::None);
        r.info.release();
        r.ctl.tick(60, PortalEvent::None);
        assert!(!r.ctl.show_info());
        assert!(!box_has_text(&r.ctl, info_box));
    }

    #[test]
    fn publishes_every_ten_seconds_when_connected() {
        let mut r = rig("broker", MockTransport::default());
        r.probe.value.set(Some(21.0));
        assert!(r.ctl.tick(0, PortalEvent::None).published);
        assert!(!r.ctl.tick(5_000, PortalEvent::None).published);
        assert!(!r.ctl.tick(10_000, PortalEvent::None).published);
        assert!(r.ctl.tick(10_001, PortalEvent::None).published);

        let sent = &r.ctl.mqtt_mut().transport_mut().published;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "TempMon");
        assert_eq!(
            sent[0].1,
            r#"{"temperature":21.0,"temperatureMin":21.0,"temperatureMax":21.0}"#
        );
    }

    #[test]
    fn never_publishes_without_connection() {
        let t = MockTransport {
            connect_fails: true,
            ..Default::default()
        };
        let mut r = rig("broker", t);
        r.probe.value.set(Some(21.0));
        for now in (0..60_000).step_by(1000) {
            assert!(!r.ctl.tick(now, PortalEvent::None).published);
        }
        assert!(r.ctl.mqtt_mut().transport_mut().published.is_empty());
    }

    #[test]
    fn portal_events_reach_overlay() {
        let mut r = rig("broker", MockTransport::default());
        r.ctl.tick(0, PortalEvent::None);
        assert_eq!(r.ctl.info_fields().mqtt, Some(MqttState::Connected));

        let net = NetInfo {
            mac: [1, 2, 3, 4, 5, 6],
            ip: net::Ipv4Addr::new(10, 0, 0, 7),
            mask: net::Ipv4Addr::new(255, 0, 0, 0),
            gateway: net::Ipv4Addr::new(10, 0, 0, 1),
        };
        r.ctl.tick(5, PortalEvent::StateChanged(PortalState::Connected));
        assert!(r.ctl.tick(10, PortalEvent::Connected(net)).overlay);
        assert_eq!(r.ctl.info_fields().net, net);
        assert_eq!(r.ctl.info_fields().portal, PortalState::Connected);

        let rep = r.ctl.tick(20, PortalEvent::Reconfigured(settings("")));
        assert!(rep.overlay);
        assert_eq!(r.ctl.mqtt().state(), MqttState::NotUsed);
        assert_eq!(r.ctl.info_fields().mqtt, None);

        r.ctl.tick(30, PortalEvent::StateChanged(PortalState::WillConnect));
        assert_eq!(r.ctl.info_fields().portal, PortalState::WillConnect);
    }

    #[test]
    fn access_point_never_shows_connected() {
        let mut r = rig("", MockTransport::default());
        r.ctl.tick(0, PortalEvent::StateChanged(PortalState::AccessPoint));
        r.ctl.tick(10, PortalEvent::Connected(NetInfo::default()));
        assert_eq!(r.ctl.info_fields().portal, PortalState::AccessPoint);
    }

    #[tokio::test]
    async fn driver_drains_events_and_shares_values() {
        let r = rig("", MockTransport::default());
        r.probe.value.set(Some(23.5));
        let state = Arc::new(Box::pin(MyState::new(
            MyConfig::default(),
            Box::new(MemoryStore::new()),
        )));
        state
            .push_event(PortalEvent::StateChanged(PortalState::AccessPoint))
            .await;

        let res = tokio::time::timeout(
            Duration::from_millis(100),
            run_control(state.clone(), r.ctl),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(state.next_event().await, PortalEvent::None);
        assert_eq!(state.data.read().await.temperature, 23.5);
    }
}

// EOF
