use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alarm::script::ScriptRequest;
use crate::error::AlarmError;

pub const DEFAULT_ENTRY_ID: &str = "default";
pub const MAX_NAME_LEN: usize = 50;

pub const SNOOZE_MINUTES: RangeInclusive<u32> = 1..=60;
pub const MAX_SNOOZE_COUNT: RangeInclusive<u32> = 0..=10;
pub const PRE_ALARM_MINUTES: RangeInclusive<u32> = 0..=60;
pub const AUTO_DISMISS_MINUTES: RangeInclusive<u32> = 0..=180;
pub const SCRIPT_TIMEOUT_SECS: RangeInclusive<u64> = 1..=300;
pub const SCRIPT_RETRY_COUNT: RangeInclusive<u32> = 0..=10;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmId(String);

impl AlarmId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(format!("alarm_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new(DEFAULT_ENTRY_ID)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionRef(String);

impl ActionRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u32,
    minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self, AlarmError> {
        if hour > 23 {
            return Err(AlarmError::validation(format!(
                "hour {hour} is outside 0-23"
            )));
        }
        if minute > 59 {
            return Err(AlarmError::validation(format!(
                "minute {minute} is outside 0-59"
            )));
        }
        Ok(Self { hour, minute })
    }

    /// Accepts `HH:MM` and `HH:MM:SS`; seconds are validated and dropped.
    pub fn parse(input: &str) -> Result<Self, AlarmError> {
        let invalid = || AlarmError::validation(format!("invalid time '{input}', expected HH:MM"));
        let parts = input.trim().split(':').collect::<Vec<_>>();
        if !(2..=3).contains(&parts.len()) {
            return Err(invalid());
        }
        let number = |part: &str| part.parse::<u32>().map_err(|_| invalid());
        let hour = number(parts[0])?;
        let minute = number(parts[1])?;
        if let Some(seconds) = parts.get(2)
            && number(*seconds)? > 59
        {
            return Err(invalid());
        }
        Self::new(hour, minute)
    }

    pub fn hour(self) -> u32 {
        self.hour
    }

    pub fn minute(self) -> u32 {
        self.minute
    }

    pub fn to_naive(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = AlarmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

const ALL_DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Weekday bitmask. A set with exactly one day marks a one-time alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<WeekdayToken>", into = "Vec<WeekdayToken>")]
pub struct DaySet(u8);

impl DaySet {
    pub const WEEKDAYS: DaySet = DaySet(0b0001_1111);

    pub fn from_days(days: impl IntoIterator<Item = Weekday>) -> Self {
        Self(days.into_iter().fold(0, |bits, day| bits | day_bit(day)))
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & day_bit(day) != 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_one_time(self) -> bool {
        self.len() == 1
    }

    pub fn iter(self) -> impl Iterator<Item = Weekday> {
        ALL_DAYS.into_iter().filter(move |day| self.contains(*day))
    }
}

impl fmt::Display for DaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.iter().map(weekday_name).collect::<Vec<_>>();
        f.write_str(&names.join(","))
    }
}

fn day_bit(day: Weekday) -> u8 {
    1 << day.num_days_from_monday()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WeekdayToken {
    #[serde(alias = "mon", alias = "Mon")]
    Monday,
    #[serde(alias = "tue", alias = "Tue")]
    Tuesday,
    #[serde(alias = "wed", alias = "Wed")]
    Wednesday,
    #[serde(alias = "thu", alias = "Thu")]
    Thursday,
    #[serde(alias = "fri", alias = "Fri")]
    Friday,
    #[serde(alias = "sat", alias = "Sat")]
    Saturday,
    #[serde(alias = "sun", alias = "Sun")]
    Sunday,
}

impl WeekdayToken {
    fn to_chrono(self) -> Weekday {
        match self {
            WeekdayToken::Monday => Weekday::Mon,
            WeekdayToken::Tuesday => Weekday::Tue,
            WeekdayToken::Wednesday => Weekday::Wed,
            WeekdayToken::Thursday => Weekday::Thu,
            WeekdayToken::Friday => Weekday::Fri,
            WeekdayToken::Saturday => Weekday::Sat,
            WeekdayToken::Sunday => Weekday::Sun,
        }
    }

    fn from_chrono(day: Weekday) -> Self {
        match day {
            Weekday::Mon => WeekdayToken::Monday,
            Weekday::Tue => WeekdayToken::Tuesday,
            Weekday::Wed => WeekdayToken::Wednesday,
            Weekday::Thu => WeekdayToken::Thursday,
            Weekday::Fri => WeekdayToken::Friday,
            Weekday::Sat => WeekdayToken::Saturday,
            Weekday::Sun => WeekdayToken::Sunday,
        }
    }
}

impl From<Vec<WeekdayToken>> for DaySet {
    fn from(tokens: Vec<WeekdayToken>) -> Self {
        DaySet::from_days(tokens.into_iter().map(WeekdayToken::to_chrono))
    }
}

impl From<DaySet> for Vec<WeekdayToken> {
    fn from(days: DaySet) -> Self {
        days.iter().map(WeekdayToken::from_chrono).collect()
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

pub fn parse_weekday(input: &str) -> Result<Weekday, AlarmError> {
    let day = match input.trim().to_ascii_lowercase().as_str() {
        "monday" | "mon" => Weekday::Mon,
        "tuesday" | "tue" => Weekday::Tue,
        "wednesday" | "wed" => Weekday::Wed,
        "thursday" | "thu" => Weekday::Thu,
        "friday" | "fri" => Weekday::Fri,
        "saturday" | "sat" => Weekday::Sat,
        "sunday" | "sun" => Weekday::Sun,
        _ => {
            return Err(AlarmError::validation(format!("unknown day '{input}'")));
        }
    };
    Ok(day)
}

pub fn parse_days<S: AsRef<str>>(tokens: &[S]) -> Result<DaySet, AlarmError> {
    let mut days = DaySet::default();
    for token in tokens {
        let day = parse_weekday(token.as_ref())?;
        if days.contains(day) {
            return Err(AlarmError::validation(format!(
                "duplicate day '{}'",
                weekday_name(day)
            )));
        }
        days = DaySet(days.0 | day_bit(day));
    }
    Ok(days)
}

pub fn sanitize_name(raw: &str) -> Result<String, AlarmError> {
    let cleaned = raw.chars().filter(|ch| !ch.is_control()).collect::<String>();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return Err(AlarmError::validation("alarm name must not be empty"));
    }
    Ok(trimmed.chars().take(MAX_NAME_LEN).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptPhase {
    PreAlarm,
    Alarm,
    PostAlarm,
    OnSnooze,
    OnDismiss,
    OnArm,
    OnCancel,
    OnSkip,
}

impl ScriptPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptPhase::PreAlarm => "pre_alarm",
            ScriptPhase::Alarm => "alarm",
            ScriptPhase::PostAlarm => "post_alarm",
            ScriptPhase::OnSnooze => "on_snooze",
            ScriptPhase::OnDismiss => "on_dismiss",
            ScriptPhase::OnArm => "on_arm",
            ScriptPhase::OnCancel => "on_cancel",
            ScriptPhase::OnSkip => "on_skip",
        }
    }
}

impl fmt::Display for ScriptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSettings {
    #[serde(default)]
    pub actions: BTreeMap<ScriptPhase, ActionRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<ActionRef>,
    #[serde(default = "default_script_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            actions: BTreeMap::new(),
            fallback: None,
            timeout_secs: default_script_timeout_secs(),
            retry_count: default_retry_count(),
        }
    }
}

impl ScriptSettings {
    pub fn validate(&self) -> Result<(), AlarmError> {
        let mut problems = Vec::new();
        self.collect_problems(&mut problems);
        into_validation(problems)
    }

    pub fn referenced_actions(&self) -> impl Iterator<Item = &ActionRef> {
        self.actions.values().chain(self.fallback.iter())
    }

    pub fn request(&self, phase: ScriptPhase) -> ScriptRequest {
        ScriptRequest {
            action: self.actions.get(&phase).cloned(),
            fallback: self.fallback.clone(),
            timeout: StdDuration::from_secs(self.timeout_secs),
            retry_count: self.retry_count,
        }
    }

    fn collect_problems(&self, problems: &mut Vec<String>) {
        check_range(
            "script timeout_secs",
            self.timeout_secs,
            SCRIPT_TIMEOUT_SECS,
            problems,
        );
        check_range(
            "script retry_count",
            self.retry_count,
            SCRIPT_RETRY_COUNT,
            problems,
        );
        for (phase, action) in &self.actions {
            if action.as_str().trim().is_empty() {
                problems.push(format!("script for {phase} must not be empty"));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDefaults {
    pub entry_id: EntryId,
    #[serde(default)]
    pub scripts: ScriptSettings,
}

impl DeviceDefaults {
    pub fn new(entry_id: EntryId) -> Self {
        Self {
            entry_id,
            scripts: ScriptSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmDefinition {
    pub id: AlarmId,
    #[serde(default)]
    pub entry_id: EntryId,
    pub name: String,
    pub time: TimeOfDay,
    pub days: DaySet,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub skip_next: bool,
    #[serde(default = "default_snooze_minutes")]
    pub snooze_minutes: u32,
    #[serde(default = "default_max_snooze_count")]
    pub max_snooze_count: u32,
    #[serde(default = "default_pre_alarm_minutes")]
    pub pre_alarm_minutes: u32,
    #[serde(default = "default_auto_dismiss_minutes")]
    pub auto_dismiss_minutes: u32,
    #[serde(default = "default_use_device_defaults")]
    pub use_device_defaults: bool,
    #[serde(default)]
    pub scripts: ScriptSettings,
}

impl AlarmDefinition {
    pub fn new(id: AlarmId, entry_id: EntryId, name: String, time: TimeOfDay, days: DaySet) -> Self {
        Self {
            id,
            entry_id,
            name,
            time,
            days,
            enabled: false,
            skip_next: false,
            snooze_minutes: default_snooze_minutes(),
            max_snooze_count: default_max_snooze_count(),
            pre_alarm_minutes: default_pre_alarm_minutes(),
            auto_dismiss_minutes: default_auto_dismiss_minutes(),
            use_device_defaults: default_use_device_defaults(),
            scripts: ScriptSettings::default(),
        }
    }

    pub fn is_one_time(&self) -> bool {
        self.days.is_one_time()
    }

    pub fn snooze_duration(&self) -> Duration {
        Duration::minutes(i64::from(self.snooze_minutes))
    }

    pub fn pre_alarm_lead(&self) -> Duration {
        Duration::minutes(i64::from(self.pre_alarm_minutes))
    }

    pub fn auto_dismiss_timeout(&self) -> Option<Duration> {
        (self.auto_dismiss_minutes > 0)
            .then(|| Duration::minutes(i64::from(self.auto_dismiss_minutes)))
    }

    pub fn validate(&self) -> Result<(), AlarmError> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("alarm name must not be empty".to_string());
        }
        if self.enabled && self.days.is_empty() {
            problems.push("an enabled alarm needs at least one day".to_string());
        }
        check_range("snooze_minutes", self.snooze_minutes, SNOOZE_MINUTES, &mut problems);
        check_range(
            "max_snooze_count",
            self.max_snooze_count,
            MAX_SNOOZE_COUNT,
            &mut problems,
        );
        check_range(
            "pre_alarm_minutes",
            self.pre_alarm_minutes,
            PRE_ALARM_MINUTES,
            &mut problems,
        );
        check_range(
            "auto_dismiss_minutes",
            self.auto_dismiss_minutes,
            AUTO_DISMISS_MINUTES,
            &mut problems,
        );
        self.scripts.collect_problems(&mut problems);
        into_validation(problems)
    }

    pub fn resolve_script(
        &self,
        phase: ScriptPhase,
        defaults: Option<&DeviceDefaults>,
    ) -> ScriptRequest {
        if !self.use_device_defaults {
            return self.scripts.request(phase);
        }
        match defaults {
            Some(defaults) => defaults.scripts.request(phase),
            None => ScriptRequest::none(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmPhase {
    #[default]
    Disarmed,
    Armed,
    PreAlarm,
    Ringing,
    Snoozed,
}

impl AlarmPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmPhase::Disarmed => "disarmed",
            AlarmPhase::Armed => "armed",
            AlarmPhase::PreAlarm => "pre_alarm",
            AlarmPhase::Ringing => "ringing",
            AlarmPhase::Snoozed => "snoozed",
        }
    }

    pub fn is_ringing_cycle(self) -> bool {
        matches!(self, AlarmPhase::Ringing | AlarmPhase::Snoozed)
    }
}

impl fmt::Display for AlarmPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    ManualTest,
    MissedRecovery,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmRuntimeState {
    pub phase: AlarmPhase,
    pub next_trigger: Option<DateTime<Utc>>,
    pub snooze_count: u32,
    pub snooze_end_time: Option<DateTime<Utc>>,
    pub last_trigger_time: Option<DateTime<Utc>>,
    pub ringing_since: Option<DateTime<Utc>>,
    pub trigger: Option<TriggerKind>,
    pub skipped_occurrence: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub definition: AlarmDefinition,
    #[serde(default)]
    pub runtime: AlarmRuntimeState,
}

fn check_range<T>(field: &str, value: T, range: RangeInclusive<T>, problems: &mut Vec<String>)
where
    T: PartialOrd + fmt::Display,
{
    if !range.contains(&value) {
        problems.push(format!(
            "{field} must be between {} and {}, got {value}",
            range.start(),
            range.end()
        ));
    }
}

fn into_validation(problems: Vec<String>) -> Result<(), AlarmError> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(AlarmError::Validation(problems.join("; ")))
    }
}

fn default_enabled() -> bool {
    true
}

fn default_snooze_minutes() -> u32 {
    9
}

fn default_max_snooze_count() -> u32 {
    3
}

fn default_pre_alarm_minutes() -> u32 {
    5
}

fn default_auto_dismiss_minutes() -> u32 {
    60
}

fn default_use_device_defaults() -> bool {
    true
}

fn default_script_timeout_secs() -> u64 {
    30
}

fn default_retry_count() -> u32 {
    3
}
