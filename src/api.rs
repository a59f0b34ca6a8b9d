use std::io::Read;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::alarm::model::{
    AlarmDefinition, AlarmId, AlarmRecord, AlarmRuntimeState, EntryId, ScriptSettings, TimeOfDay,
    parse_days,
};
use crate::alarm::schedule::format_instant;
use crate::coordinator::{Coordinator, CreateAlarm, ScriptUpdate};
use crate::error::AlarmError;

const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

pub struct ApiServer {
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn start(
        config: ApiServerConfig,
        coordinator: Arc<Coordinator>,
        runtime: Handle,
    ) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow::anyhow!("failed to start API server on {bind}: {err}"))?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let http_join = thread::spawn(move || {
            run_server_loop(server, coordinator, runtime, stop_for_thread)
        });
        info!(%bind, "command API listening");

        Ok(Self {
            stop,
            http_join: Some(http_join),
        })
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

fn run_server_loop(
    server: Server,
    coordinator: Arc<Coordinator>,
    runtime: Handle,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => handle_request(request, &coordinator, &runtime),
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
}

fn handle_request(
    mut request: tiny_http::Request,
    coordinator: &Arc<Coordinator>,
    runtime: &Handle,
) {
    let Some(remote_addr) = request.remote_addr() else {
        let _ = send_json(
            request,
            StatusCode(400),
            &error_body("bad_request", "missing remote address"),
        );
        return;
    };
    if !is_local_network_ip(remote_addr.ip()) {
        let _ = send_json(
            request,
            StatusCode(403),
            &error_body("forbidden", "local network only"),
        );
        return;
    }

    let url = request.url().to_string();
    let (path, _query) = split_path_query(&url);
    let Some(route) = Route::parse(request.method(), path) else {
        let _ = send_json(request, StatusCode(404), &error_body("not_found", "unknown route"));
        return;
    };

    let mut body = String::new();
    if let Err(err) = request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)
    {
        let _ = send_json(
            request,
            StatusCode(400),
            &error_body("bad_request", &format!("unreadable body: {err}")),
        );
        return;
    }

    debug!(method = %request.method(), %path, "api request");
    // Each request runs as its own task so a slow script only blocks callers of that alarm.
    let coordinator = Arc::clone(coordinator);
    runtime.spawn(async move {
        let reply = execute(&coordinator, route, &body).await;
        let sent = tokio::task::spawn_blocking(move || {
            send_json(request, StatusCode(reply.status), &reply.body)
        })
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to send API response"),
            Err(err) => warn!(error = %err, "API response task failed"),
        }
    });
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    ListAlarms,
    CreateAlarm,
    GetAlarm(AlarmId),
    DeleteAlarm(AlarmId),
    Command(AlarmId, Command),
    SetDeviceDefaults(EntryId),
    GetDeviceDefaults(EntryId),
    Health,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Snooze,
    Dismiss,
    SkipNext,
    CancelSkip,
    Test,
    Enable,
    Disable,
    SetTime,
    SetDays,
    SetScripts,
}

impl Command {
    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "snooze" => Command::Snooze,
            "dismiss" => Command::Dismiss,
            "skip_next" => Command::SkipNext,
            "cancel_skip" => Command::CancelSkip,
            "test" => Command::Test,
            "enable" => Command::Enable,
            "disable" => Command::Disable,
            "set_time" => Command::SetTime,
            "set_days" => Command::SetDays,
            "set_scripts" => Command::SetScripts,
            _ => return None,
        })
    }
}

impl Route {
    fn parse(method: &Method, path: &str) -> Option<Self> {
        let segments = path
            .trim_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>();
        match (method, segments.as_slice()) {
            (Method::Get, ["api", "alarms"]) => Some(Route::ListAlarms),
            (Method::Post, ["api", "alarms"]) => Some(Route::CreateAlarm),
            (Method::Get, ["api", "alarms", id]) => Some(Route::GetAlarm(AlarmId::new(*id))),
            (Method::Delete, ["api", "alarms", id]) => Some(Route::DeleteAlarm(AlarmId::new(*id))),
            (Method::Post, ["api", "alarms", id, command]) => {
                Some(Route::Command(AlarmId::new(*id), Command::parse(command)?))
            }
            (Method::Put, ["api", "devices", entry, "defaults"]) => {
                Some(Route::SetDeviceDefaults(EntryId::new(*entry)))
            }
            (Method::Get, ["api", "devices", entry, "defaults"]) => {
                Some(Route::GetDeviceDefaults(EntryId::new(*entry)))
            }
            (Method::Get, ["api", "health"]) => Some(Route::Health),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateAlarmBody {
    name: String,
    time: String,
    days: Vec<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    entry_id: Option<String>,
    #[serde(default)]
    snooze_minutes: Option<u32>,
    #[serde(default)]
    max_snooze_count: Option<u32>,
    #[serde(default)]
    pre_alarm_minutes: Option<u32>,
    #[serde(default)]
    auto_dismiss_minutes: Option<u32>,
    #[serde(default)]
    use_device_defaults: Option<bool>,
    #[serde(default)]
    scripts: Option<ScriptSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct SnoozeBody {
    #[serde(default)]
    minutes: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SetTimeBody {
    time: String,
}

#[derive(Debug, Deserialize)]
struct SetDaysBody {
    days: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AlarmView {
    #[serde(flatten)]
    definition: AlarmDefinition,
    #[serde(flatten)]
    runtime: AlarmRuntimeState,
    next_trigger_local: String,
}

#[derive(Debug, PartialEq)]
struct ApiReply {
    status: u16,
    body: Value,
}

impl ApiReply {
    fn ok(body: impl Serialize) -> Self {
        Self::with_status(200, body)
    }

    fn with_status(status: u16, body: impl Serialize) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status, body },
            Err(err) => Self {
                status: 500,
                body: error_body("internal_error", &err.to_string()),
            },
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            status: 400,
            body: error_body("bad_request", &message),
        }
    }
}

impl From<AlarmError> for ApiReply {
    fn from(err: AlarmError) -> Self {
        let status = match &err {
            AlarmError::Validation(_) => 400,
            AlarmError::NotFound(_) | AlarmError::DeviceNotFound(_) => 404,
            AlarmError::InvalidState { .. } | AlarmError::SnoozeLimitReached { .. } => 409,
        };
        Self {
            status,
            body: error_body(err.code(), &err.to_string()),
        }
    }
}

async fn execute(coordinator: &Coordinator, route: Route, body: &str) -> ApiReply {
    match dispatch(coordinator, route, body).await {
        Ok(reply) => reply,
        Err(reply) => reply,
    }
}

async fn dispatch(coordinator: &Coordinator, route: Route, body: &str) -> Result<ApiReply, ApiReply> {
    let view = |record: AlarmRecord| AlarmView {
        next_trigger_local: format_instant(record.runtime.next_trigger, &coordinator.time_zone()),
        definition: record.definition,
        runtime: record.runtime,
    };

    let reply = match route {
        Route::ListAlarms => {
            let alarms = coordinator
                .alarms()
                .await
                .into_iter()
                .map(view)
                .collect::<Vec<_>>();
            ApiReply::ok(json!({ "alarms": alarms }))
        }
        Route::GetAlarm(id) => ApiReply::ok(view(coordinator.alarm(&id).await?)),
        Route::CreateAlarm => {
            let body = parse_body::<CreateAlarmBody>(body)?;
            let request = CreateAlarm {
                name: body.name,
                time: TimeOfDay::parse(&body.time)?,
                days: parse_days(&body.days)?,
                enabled: body.enabled,
                entry_id: body.entry_id.map(EntryId::new),
                snooze_minutes: body.snooze_minutes,
                max_snooze_count: body.max_snooze_count,
                pre_alarm_minutes: body.pre_alarm_minutes,
                auto_dismiss_minutes: body.auto_dismiss_minutes,
                use_device_defaults: body.use_device_defaults,
                scripts: body.scripts,
            };
            ApiReply::with_status(201, view(coordinator.create_alarm(request).await?))
        }
        Route::DeleteAlarm(id) => {
            coordinator.delete_alarm(&id).await?;
            ApiReply::ok(json!({ "deleted": id }))
        }
        Route::Command(id, command) => {
            let record = match command {
                Command::Snooze => {
                    let body = parse_optional_body::<SnoozeBody>(body)?;
                    coordinator.snooze(&id, body.minutes).await?
                }
                Command::Dismiss => coordinator.dismiss(&id).await?,
                Command::SkipNext => coordinator.skip_next(&id).await?,
                Command::CancelSkip => coordinator.cancel_skip(&id).await?,
                Command::Test => coordinator.test_alarm(&id).await?,
                Command::Enable => coordinator.set_enabled(&id, true).await?,
                Command::Disable => coordinator.set_enabled(&id, false).await?,
                Command::SetTime => {
                    let body = parse_body::<SetTimeBody>(body)?;
                    coordinator
                        .set_time(&id, TimeOfDay::parse(&body.time)?)
                        .await?
                }
                Command::SetDays => {
                    let body = parse_body::<SetDaysBody>(body)?;
                    coordinator.set_days(&id, parse_days(&body.days)?).await?
                }
                Command::SetScripts => {
                    let update = parse_body::<ScriptUpdate>(body)?;
                    coordinator.set_scripts(&id, update).await?
                }
            };
            ApiReply::ok(view(record))
        }
        Route::SetDeviceDefaults(entry_id) => {
            let scripts = parse_body::<ScriptSettings>(body)?;
            ApiReply::ok(coordinator.set_device_defaults(&entry_id, scripts)?)
        }
        Route::GetDeviceDefaults(entry_id) => ApiReply::ok(coordinator.device_defaults(&entry_id)?),
        Route::Health => match coordinator.health() {
            Some(report) => ApiReply::ok(report),
            None => ApiReply::ok(coordinator.health_check()),
        },
    };
    Ok(reply)
}

fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, ApiReply> {
    serde_json::from_str(body).map_err(|err| {
        ApiReply::bad_request(format!(
            "invalid JSON at line {}, column {}: {err}",
            err.line(),
            err.column()
        ))
    })
}

fn parse_optional_body<T: DeserializeOwned + Default>(body: &str) -> Result<T, ApiReply> {
    if body.trim().is_empty() {
        return Ok(T::default());
    }
    parse_body(body)
}

fn error_body(code: &str, message: &str) -> Value {
    json!({ "error": code, "message": message })
}

fn default_true() -> bool {
    true
}

fn send_json<T: Serialize>(
    request: tiny_http::Request,
    status: StatusCode,
    body: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_data(payload)
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn split_path_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn is_local_network_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || is_ipv4_mapped_local(v6)
        }
    }
}

fn is_ipv4_mapped_local(v6: Ipv6Addr) -> bool {
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        None => false,
    }
}
