use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::actions::ActionCommand;
use crate::alarm::model::{ActionRef, DEFAULT_ENTRY_ID, EntryId};
use crate::alarm::script::BackoffPolicy;

pub const MAX_GRACE_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub time_zone: Option<Tz>,
    pub missed_alarm_grace_minutes: u32,
    pub health_check_interval: Duration,
    pub backoff: BackoffPolicy,
    pub default_entry_id: EntryId,
    pub actions: BTreeMap<ActionRef, ActionCommand>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            time_zone: None,
            missed_alarm_grace_minutes: default_grace_minutes(),
            health_check_interval: Duration::from_secs(default_health_check_interval_secs()),
            backoff: BackoffPolicy::default(),
            default_entry_id: EntryId::default(),
            actions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HubConfigFile {
    version: u32,
    #[serde(default)]
    time_zone: Option<String>,
    #[serde(default = "default_grace_minutes")]
    missed_alarm_grace_minutes: u32,
    #[serde(default = "default_health_check_interval_secs")]
    health_check_interval_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    script_backoff_base_ms: u64,
    #[serde(default = "default_backoff_ceiling_ms")]
    script_backoff_ceiling_ms: u64,
    #[serde(default = "default_entry_id")]
    default_entry_id: String,
    #[serde(default)]
    actions: BTreeMap<String, ActionCommand>,
}

pub fn load_hub_config(path: &Path) -> Result<HubConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read hub config {}", path.display()))?;
    parse_hub_config_text(&content)
}

pub fn parse_hub_config_text(content: &str) -> Result<HubConfig> {
    let raw = serde_json::from_str::<HubConfigFile>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow!("invalid JSON at line {line}, column {column}: {err}")
    })?;

    if raw.version != 1 {
        bail!(
            "unsupported hub config version {}; expected version 1",
            raw.version
        );
    }
    if raw.missed_alarm_grace_minutes > MAX_GRACE_MINUTES {
        bail!(
            "missed_alarm_grace_minutes must be at most {MAX_GRACE_MINUTES}, got {}",
            raw.missed_alarm_grace_minutes
        );
    }
    if raw.health_check_interval_secs == 0 {
        bail!("health_check_interval_secs must be greater than zero");
    }
    if raw.script_backoff_base_ms == 0 {
        bail!("script_backoff_base_ms must be greater than zero");
    }
    if raw.script_backoff_ceiling_ms < raw.script_backoff_base_ms {
        bail!(
            "script_backoff_ceiling_ms ({}) must not be below script_backoff_base_ms ({})",
            raw.script_backoff_ceiling_ms,
            raw.script_backoff_base_ms
        );
    }
    let default_entry_id = raw.default_entry_id.trim();
    if default_entry_id.is_empty() {
        bail!("default_entry_id must not be empty");
    }

    let time_zone = raw
        .time_zone
        .as_deref()
        .map(parse_time_zone)
        .transpose()?;

    let mut actions = BTreeMap::new();
    for (name, command) in raw.actions {
        if name.trim().is_empty() {
            bail!("action names must not be empty");
        }
        if command.program.trim().is_empty() {
            bail!("action '{name}' must name a program");
        }
        actions.insert(ActionRef::new(name), command);
    }

    Ok(HubConfig {
        time_zone,
        missed_alarm_grace_minutes: raw.missed_alarm_grace_minutes,
        health_check_interval: Duration::from_secs(raw.health_check_interval_secs),
        backoff: BackoffPolicy {
            base: Duration::from_millis(raw.script_backoff_base_ms),
            ceiling: Duration::from_millis(raw.script_backoff_ceiling_ms),
        },
        default_entry_id: EntryId::new(default_entry_id),
        actions,
    })
}

pub fn parse_time_zone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|err| anyhow!("unknown time zone '{name}': {err}"))
}

/// Explicit name first, then `$TZ`, then UTC.
pub fn resolve_time_zone(explicit: Option<Tz>) -> Tz {
    explicit
        .or_else(|| {
            std::env::var("TZ")
                .ok()
                .and_then(|name| parse_time_zone(name.trim_start_matches(':')).ok())
        })
        .unwrap_or(chrono_tz::UTC)
}

fn default_grace_minutes() -> u32 {
    5
}

fn default_health_check_interval_secs() -> u64 {
    60
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_ceiling_ms() -> u64 {
    30_000
}

fn default_entry_id() -> String {
    DEFAULT_ENTRY_ID.to_string()
}
