// apiserver.rs

use askama::Template;
use axum::{
    Json, Router,
    body::Body,
    extract::{Form, State},
    http::{HeaderValue, Response, StatusCode, header},
    response::{Html, IntoResponse, Redirect},
    routing::*,
};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::*;

const MONITOR_CACHE_CONTROL: &str = "public, max-age=31536000";
const MONITOR_LAST_MODIFIED: &str = "Mon, 04 Mar 2019 07:00:00 GMT";

pub async fn run_api_server(state: Arc<Pin<Box<MyState>>>) -> anyhow::Result<()> {
    loop {
        if *state.wifi_up.read().await {
            break;
        }
        sleep(Duration::from_secs(1)).await;
    }

    let listen = format!("0.0.0.0:{}", state.config.read().await.port);
    let addr = listen.parse::<net::SocketAddr>()?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening to {listen}");
    Ok(axum::serve(listener, app.into_make_service()).await?)
}

pub fn router(state: Arc<Pin<Box<MyState>>>) -> Router {
    Router::new()
        .route("/", get(get_index))
        .route(
            "/monitor.html",
            get(get_monitor).layer(SetResponseHeaderLayer::overriding(
                header::CACHE_CONTROL,
                HeaderValue::from_static(MONITOR_CACHE_CONTROL),
            )),
        )
        .route("/values", get(get_values))
        .route("/uptime", get(get_uptime))
        .route("/portal", get(get_portal).post(post_portal))
        .route(
            "/config",
            get(get_config).post(post_config).options(options),
        )
        .route("/reset_config", get(reset_config))
        .with_state(state)
}

pub async fn options(State(state): State<Arc<Pin<Box<MyState>>>>) -> Response<Body> {
    let cnt = state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} options()");

    (
        StatusCode::OK,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "get,post"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "content-type"),
        ],
    )
        .into_response()
}

pub async fn get_index(State(state): State<Arc<Pin<Box<MyState>>>>) -> Response<Body> {
    let cnt = state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} get_index()");

    (StatusCode::FOUND, [(header::LOCATION, "/monitor.html")]).into_response()
}

pub async fn get_monitor(State(state): State<Arc<Pin<Box<MyState>>>>) -> Response<Body> {
    let cnt = state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} get_monitor()");

    (
        StatusCode::OK,
        [(header::LAST_MODIFIED, MONITOR_LAST_MODIFIED)],
        Html(include_str!("monitor.html")),
    )
        .into_response()
}

pub async fn get_values(State(state): State<Arc<Pin<Box<MyState>>>>) -> Response<Body> {
    let cnt = state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} get_values()");

    let values = *state.data.read().await;
    (
        StatusCode::OK,
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(values),
    )
        .into_response()
}

pub async fn get_uptime(State(state): State<Arc<Pin<Box<MyState>>>>) -> (StatusCode, Json<Uptime>) {
    let cnt = state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} get_uptime()");

    let uptime = *state.uptime.read().await;
    (StatusCode::OK, Json(Uptime::new(uptime)))
}

pub async fn get_portal(State(state): State<Arc<Pin<Box<MyState>>>>) -> Response<Body> {
    let cnt = state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} get_portal()");

    let page = match state.config.read().await.render() {
        Err(e) => {
            let err_msg = format!("Portal template error: {e:?}\n");
            error!("{err_msg}");
            return (StatusCode::INTERNAL_SERVER_ERROR, err_msg).into_response();
        }
        Ok(s) => s,
    };
    (StatusCode::OK, Html(page)).into_response()
}

pub async fn post_portal(
    State(state): State<Arc<Pin<Box<MyState>>>>,
    Form(config): Form<MyConfig>,
) -> Response<Body> {
    let cnt = state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} post_portal()");

    let (status, msg) = apply_config(&state, config).await;
    if status == StatusCode::OK {
        return Redirect::to("/portal").into_response();
    }
    (status, msg).into_response()
}

/// The config as shown over the API, without the secrets.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigView {
    pub port: u16,
    pub wifi_ssid: String,
    pub wifi_pass_set: bool,
    pub portal_ssid: String,
    pub mqtt_server: String,
    pub mqtt_user: String,
    pub mqtt_pass_set: bool,
    pub mqtt_port: u16,
    pub mqtt_name: String,
}

impl From<&MyConfig> for ConfigView {
    fn from(c: &MyConfig) -> Self {
        ConfigView {
            port: c.port,
            wifi_ssid: c.wifi_ssid.clone(),
            wifi_pass_set: !c.wifi_pass.is_empty(),
            portal_ssid: c.portal_ssid.clone(),
            mqtt_server: c.mqtt_server.clone(),
            mqtt_user: c.mqtt_user.clone(),
            mqtt_pass_set: !c.mqtt_pass.is_empty(),
            mqtt_port: c.mqtt_port,
            mqtt_name: c.mqtt_name.clone(),
        }
    }
}

pub async fn get_config(
    State(state): State<Arc<Pin<Box<MyState>>>>,
) -> (StatusCode, Json<ConfigView>) {
    let cnt = state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} get_conf()");

    let view = ConfigView::from(&*state.config.read().await);
    (StatusCode::OK, Json(view))
}

pub async fn post_config(
    State(state): State<Arc<Pin<Box<MyState>>>>,
    Json(config): Json<MyConfig>,
) -> (StatusCode, String) {
    let cnt = state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} set_conf()");

    apply_config(&state, config).await
}

pub async fn reset_config(State(state): State<Arc<Pin<Box<MyState>>>>) -> (StatusCode, String) {
    let cnt = state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} reset_conf()");

    info!("Saving default config to nvs...");
    if let Err(e) = state.store.lock().await.save(&MyConfig::default()) {
        let msg = format!("Nvs write error: {e:?}");
        error!("{msg}");
        return (StatusCode::INTERNAL_SERVER_ERROR, msg);
    }
    info!("Config saved to nvs. Resetting soon...");
    *state.reset.write().await = true;
    (StatusCode::OK, "OK".to_string())
}

// Blank password fields keep the stored secret, as the portal never echoes it.
async fn apply_config(state: &MyState, mut config: MyConfig) -> (StatusCode, String) {
    if let Err(e) = config.validate() {
        warn!("Rejected config: {e}");
        return (StatusCode::BAD_REQUEST, e.to_string());
    }

    let old = state.config.read().await.clone();
    if config.wifi_pass.is_empty() && config.wifi_ssid == old.wifi_ssid {
        config.wifi_pass = old.wifi_pass.clone();
    }
    if config.mqtt_pass.is_empty() {
        config.mqtt_pass = old.mqtt_pass.clone();
    }
    config.mqtt_server = config.mqtt_server.trim().to_string();

    info!("Saving new config to nvs...");
    if let Err(e) = state.store.lock().await.save(&config) {
        let msg = format!("Nvs write error: {e:?}");
        error!("{msg}");
        return (StatusCode::INTERNAL_SERVER_ERROR, msg);
    }

    let reboot = old.wifi_changed(&config);
    let mqtt = config.mqtt();
    let mqtt_changed = old.mqtt() != mqtt;
    *state.config.write().await = config;

    if reboot {
        info!("Network settings changed. Resetting soon...");
        state.set_portal(PortalState::WillConnect).await;
        *state.reset.write().await = true;
    } else if mqtt_changed {
        let prev = *state.portal.read().await;
        state.set_portal(PortalState::Reconfigured).await;
        state.push_event(PortalEvent::Reconfigured(mqtt)).await;
        state.set_portal(prev).await;
    }
    (StatusCode::OK, "OK".to_string())
}

#[cfg(test)]
mod tests {
    use axum::{body::to_bytes, http::Request};
    use tower::ServiceExt;

    use super::*;

    struct FailingStore;

    impl ConfigStore for FailingStore {
        fn load(&mut self) -> Option<MyConfig> {
            None
        }

        fn save(&mut self, _config: &MyConfig) -> anyhow::Result<()> {
            bail!("flash worn out")
        }
    }

    fn state_with(store: Box<dyn ConfigStore + Send + Sync>) -> Arc<Pin<Box<MyState>>> {
        let config = MyConfig {
            wifi_ssid: "home".into(),
            wifi_pass: "secret".into(),
            mqtt_pass: "hunter2".into(),
            ..Default::default()
        };
        Arc::new(Box::pin(MyState::new(config, store)))
    }

    fn state() -> Arc<Pin<Box<MyState>>> {
        state_with(Box::new(MemoryStore::new()))
    }

    async fn call(state: &Arc<Pin<Box<MyState>>>, req: Request<Body>) -> Response<Body> {
        router(state.clone()).oneshot(req).await.unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(config: &MyConfig) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/config")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(config).unwrap()))
            .unwrap()
    }

    async fn body_string(resp: Response<Body>) -> String {
        let b = to_bytes(resp.into_body(), 65536).await.unwrap();
        String::from_utf8(b.to_vec()).unwrap()
    }

    async fn drain(state: &MyState) -> Vec<PortalEvent> {
        let mut evs = Vec::new();
        loop {
            match state.next_event().await {
                PortalEvent::None => return evs,
                ev => evs.push(ev),
            }
        }
    }

    #[tokio::test]
    async fn values_are_json_with_cors() {
        let st = state();
        *st.data.write().await = TempValues {
            temperature: 21.5,
            temperature_min: 19.0,
            temperature_max: 23.0,
        };
        let resp = call(&st, get("/values")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(
            body_string(resp).await,
            r#"{"temperature":21.5,"temperatureMin":19.0,"temperatureMax":23.0}"#
        );
    }

    #[tokio::test]
    async fn root_redirects_to_monitor() {
        let resp = call(&state(), get("/")).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers()[header::LOCATION], "/monitor.html");
    }

    #[tokio::test]
    async fn monitor_page_is_cacheable() {
        let resp = call(&state(), get("/monitor.html")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CACHE_CONTROL], MONITOR_CACHE_CONTROL);
        assert_eq!(resp.headers()[header::LAST_MODIFIED], MONITOR_LAST_MODIFIED);
        assert!(body_string(resp).await.contains("/values"));
    }

    #[tokio::test]
    async fn uptime_is_formatted() {
        let st = state();
        *st.uptime.write().await = 3661;
        let body = body_string(call(&st, get("/uptime")).await).await;
        assert_eq!(body, r#"{"uptime":3661,"uptime_s":"0d 01:01:01"}"#);
    }

    #[tokio::test]
    async fn config_view_hides_secrets() {
        let body = body_string(call(&state(), get("/config")).await).await;
        assert!(!body.contains("secret"));
        assert!(!body.contains("hunter2"));
        let view: ConfigView = serde_json::from_str(&body).unwrap();
        assert!(view.wifi_pass_set);
        assert!(view.mqtt_pass_set);
        assert_eq!(view.mqtt_name, "TempMon");
    }

    #[tokio::test]
    async fn portal_page_renders_form() {
        let resp = call(&state(), get("/portal")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.contains(r#"name="mqtt_server""#));
        assert!(!body.contains("hunter2"));
    }

    #[tokio::test]
    async fn mqtt_change_reconfigures_without_reboot() {
        let st = state();
        let mut cfg = st.config.read().await.clone();
        cfg.mqtt_server = " broker.lan ".into();
        cfg.mqtt_pass = "".into();

        let resp = call(&st, post_json(&cfg)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!*st.reset.read().await);

        let saved = st.store.lock().await.load().unwrap();
        assert_eq!(saved.mqtt_server, "broker.lan");
        assert_eq!(saved.mqtt_pass, "hunter2");
        assert_eq!(*st.config.read().await, saved);

        let evs = drain(&st).await;
        assert_eq!(evs, vec![
            PortalEvent::StateChanged(PortalState::Reconfigured),
            PortalEvent::Reconfigured(saved.mqtt()),
            PortalEvent::StateChanged(PortalState::Connecting),
        ]);
    }

    #[tokio::test]
    async fn unchanged_config_queues_nothing() {
        let st = state();
        let cfg = st.config.read().await.clone();
        let resp = call(&st, post_json(&cfg)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(drain(&st).await.is_empty());
    }

    #[tokio::test]
    async fn wifi_change_schedules_reboot() {
        let st = state();
        let mut cfg = st.config.read().await.clone();
        cfg.wifi_ssid = "office".into();
        cfg.wifi_pass = "".into();

        let resp = call(&st, post_json(&cfg)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(*st.reset.read().await);
        assert_eq!(*st.portal.read().await, PortalState::WillConnect);
        // new network, so an empty password is taken as is
        assert_eq!(st.config.read().await.wifi_pass, "");
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let st = state();
        let mut cfg = st.config.read().await.clone();
        cfg.mqtt_name = "  ".into();

        let resp = call(&st, post_json(&cfg)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(st.store.lock().await.load().is_none());
        assert_eq!(st.config.read().await.mqtt_name, "TempMon");
        assert!(drain(&st).await.is_empty());
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let st = state_with(Box::new(FailingStore));
        let mut cfg = st.config.read().await.clone();
        cfg.mqtt_server = "elsewhere".into();

        let resp = call(&st, post_json(&cfg)).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            st.config.read().await.mqtt_server,
            MyConfig::default().mqtt_server
        );
    }

    #[tokio::test]
    async fn portal_form_keeps_blank_passwords() {
        let st = state();
        let req = Request::builder()
            .method("POST")
            .uri("/portal")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(
                "port=80&wifi_ssid=home&wifi_pass=&portal_ssid=Temperature+Monitor\
                 &mqtt_server=&mqtt_user=homeassistant&mqtt_pass=&mqtt_port=1883&mqtt_name=Kitchen",
            ))
            .unwrap();

        let resp = call(&st, req).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers()[header::LOCATION], "/portal");

        let cfg = st.config.read().await.clone();
        assert_eq!(cfg.wifi_pass, "secret");
        assert_eq!(cfg.mqtt_pass, "hunter2");
        assert_eq!(cfg.mqtt_name, "Kitchen");
        assert!(!*st.reset.read().await);
        assert!(!cfg.mqtt().is_used());
    }

    #[tokio::test]
    async fn reset_config_saves_defaults() {
        let st = state();
        let resp = call(&st, get("/reset_config")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(st.store.lock().await.load(), Some(MyConfig::default()));
        assert!(*st.reset.read().await);
    }

    #[tokio::test]
    async fn options_allow_cors() {
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/config")
            .body(Body::empty())
            .unwrap();
        let resp = call(&state(), req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}

// EOF
