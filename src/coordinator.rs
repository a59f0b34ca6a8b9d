use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alarm::machine::{AlarmStateMachine, Recovery, TimerFire, TransitionContext};
use crate::alarm::model::{
    ActionRef, AlarmDefinition, AlarmId, AlarmRecord, DaySet, DeviceDefaults, EntryId,
    SNOOZE_MINUTES, ScriptPhase, ScriptSettings, TimeOfDay, sanitize_name,
};
use crate::alarm::script::{BackoffPolicy, ScriptBackend, ScriptRunner};
use crate::alarm::timer::{TimerEngine, TimerHandle};
use crate::clock::Clock;
use crate::error::{AlarmError, PersistenceError};
use crate::events::{AlarmEvent, EventBus};
use crate::store::StateStore;

type AlarmHandle = Arc<AsyncMutex<AlarmStateMachine>>;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub time_zone: Tz,
    pub grace: Duration,
    pub health_interval: Duration,
    pub backoff: BackoffPolicy,
    pub default_entry_id: EntryId,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            time_zone: chrono_tz::UTC,
            grace: Duration::minutes(5),
            health_interval: Duration::seconds(60),
            backoff: BackoffPolicy::default(),
            default_entry_id: EntryId::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateAlarm {
    pub name: String,
    pub time: TimeOfDay,
    pub days: DaySet,
    pub enabled: bool,
    pub entry_id: Option<EntryId>,
    pub snooze_minutes: Option<u32>,
    pub max_snooze_count: Option<u32>,
    pub pre_alarm_minutes: Option<u32>,
    pub auto_dismiss_minutes: Option<u32>,
    pub use_device_defaults: Option<bool>,
    pub scripts: Option<ScriptSettings>,
}

#[cfg(test)]
impl CreateAlarm {
    pub fn new(name: impl Into<String>, time: TimeOfDay, days: DaySet) -> Self {
        Self {
            name: name.into(),
            time,
            days,
            enabled: true,
            entry_id: None,
            snooze_minutes: None,
            max_snooze_count: None,
            pre_alarm_minutes: None,
            auto_dismiss_minutes: None,
            use_device_defaults: None,
            scripts: None,
        }
    }
}

/// Partial update of an alarm's scripts. A `None` action removes that phase.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptUpdate {
    #[serde(default)]
    pub actions: BTreeMap<ScriptPhase, Option<ActionRef>>,
    #[serde(default)]
    pub fallback: Option<ActionRef>,
    #[serde(default)]
    pub clear_fallback: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub use_device_defaults: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    pub loaded: usize,
    pub rearmed: usize,
    pub resumed: usize,
    pub recovered_late: usize,
    pub missed: usize,
    pub idle: usize,
    pub auto_disabled: usize,
    pub rejected: usize,
}

impl StartupReport {
    fn count(&mut self, recovery: Recovery) {
        match recovery {
            Recovery::Idle => self.idle += 1,
            Recovery::Rearmed => self.rearmed += 1,
            Recovery::Resumed => self.resumed += 1,
            Recovery::RecoveredLate => self.recovered_late += 1,
            Recovery::Missed => self.missed += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub alarms: usize,
    pub pending_timers: usize,
    pub issues: Vec<String>,
}

pub struct Coordinator {
    alarms: RwLock<HashMap<AlarmId, AlarmHandle>>,
    devices: RwLock<HashMap<EntryId, Arc<RwLock<DeviceDefaults>>>>,
    timers: TimerEngine<TimerFire>,
    scripts: ScriptRunner,
    store: Arc<dyn StateStore>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
    health: Mutex<Option<HealthReport>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        backend: Arc<dyn ScriptBackend>,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            alarms: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            timers: TimerEngine::new(),
            scripts: ScriptRunner::new(backend, settings.backoff),
            store,
            events: EventBus::new(),
            clock,
            settings,
            health: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn time_zone(&self) -> Tz {
        self.settings.time_zone
    }

    pub async fn start(&self) -> Result<StartupReport, PersistenceError> {
        let loaded = self.store.load()?;
        let mut report = StartupReport {
            loaded: loaded.alarms.len(),
            rejected: loaded.rejected_alarms.len(),
            ..StartupReport::default()
        };

        {
            let mut devices = write(&self.devices);
            for defaults in loaded.devices {
                devices.insert(defaults.entry_id.clone(), Arc::new(RwLock::new(defaults)));
            }
            devices
                .entry(self.settings.default_entry_id.clone())
                .or_insert_with(|| {
                    Arc::new(RwLock::new(DeviceDefaults::new(
                        self.settings.default_entry_id.clone(),
                    )))
                });
        }
        for rejected in &loaded.rejected_devices {
            error!(entry_id = %rejected.key, reason = %rejected.reason, "ignoring device defaults");
        }
        self.warn_missing_device_actions();

        for rejected in loaded.rejected_alarms {
            error!(alarm_id = %rejected.key, reason = %rejected.reason, "alarm record disabled");
            self.events.emit(AlarmEvent::AutoDisabled {
                alarm_id: AlarmId::new(rejected.key),
                reason: rejected.reason,
            });
        }

        for record in loaded.alarms {
            let id = record.definition.id.clone();
            let problem = self.startup_problem(&record.definition);
            let handle = Arc::new(AsyncMutex::new(AlarmStateMachine::restore(
                record.definition,
                record.runtime,
            )));
            write(&self.alarms).insert(id.clone(), handle.clone());

            let mut machine = handle.lock().await;
            if let Some(reason) = problem {
                if machine.definition().enabled {
                    error!(alarm_id = %id, %reason, "auto-disabling alarm");
                    machine.quarantine(&self.timers);
                    self.persist(&machine);
                    self.events.emit(AlarmEvent::AutoDisabled {
                        alarm_id: id,
                        reason,
                    });
                    report.auto_disabled += 1;
                    continue;
                }
                warn!(alarm_id = %id, %reason, "disabled alarm has invalid configuration");
            }

            let ctx = self.context(&machine.definition().entry_id);
            let recovery = machine.recover(&ctx).await;
            debug!(alarm_id = %id, ?recovery, "alarm restored");
            report.count(recovery);
            self.persist(&machine);
        }

        info!(
            loaded = report.loaded,
            missed = report.missed,
            auto_disabled = report.auto_disabled,
            rejected = report.rejected,
            "coordinator started"
        );
        Ok(report)
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut in_flight = JoinSet::new();
        let mut next_health_check = self.clock.now() + self.settings.health_interval;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.timers.park(self.clock.as_ref()) => {}
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "timer dispatch task failed");
                    }
                }
            }
            // One task per fire; a slow script only delays its own alarm.
            for (handle, fire) in self.timers.take_due(self.clock.now()) {
                let coordinator = Arc::clone(&self);
                in_flight.spawn(async move { coordinator.dispatch(handle, fire).await });
            }
            let now = self.clock.now();
            if now >= next_health_check {
                self.health_check();
                next_health_check = now + self.settings.health_interval;
            }
        }
        in_flight.shutdown().await;
        self.shutdown().await;
    }

    async fn dispatch(&self, handle: TimerHandle, fire: TimerFire) {
        let Ok(mut machine) = self.acquire(&fire.alarm_id).await else {
            debug!(alarm_id = %fire.alarm_id, "timer fired for a deleted alarm");
            return;
        };
        let ctx = self.context(&machine.definition().entry_id);
        if machine.on_timer(&ctx, handle, fire.kind).await {
            self.persist(&machine);
        }
    }

    pub async fn create_alarm(&self, request: CreateAlarm) -> Result<AlarmRecord, AlarmError> {
        let name = sanitize_name(&request.name)?;
        let entry_id = request
            .entry_id
            .unwrap_or_else(|| self.settings.default_entry_id.clone());
        let mut definition = AlarmDefinition::new(
            AlarmId::generate(),
            entry_id.clone(),
            name,
            request.time,
            request.days,
        );
        if let Some(minutes) = request.snooze_minutes {
            definition.snooze_minutes = minutes;
        }
        if let Some(count) = request.max_snooze_count {
            definition.max_snooze_count = count;
        }
        if let Some(minutes) = request.pre_alarm_minutes {
            definition.pre_alarm_minutes = minutes;
        }
        if let Some(minutes) = request.auto_dismiss_minutes {
            definition.auto_dismiss_minutes = minutes;
        }
        if let Some(scripts) = request.scripts {
            definition.scripts = scripts;
            definition.use_device_defaults = false;
        }
        if let Some(use_device_defaults) = request.use_device_defaults {
            definition.use_device_defaults = use_device_defaults;
        }
        definition.validate()?;
        if !definition.use_device_defaults {
            self.ensure_actions_exist(&definition.scripts)?;
        }
        if request.enabled && definition.days.is_empty() {
            return Err(AlarmError::validation(
                "an alarm needs at least one day before it can be enabled",
            ));
        }
        self.register_device(&entry_id);

        let id = definition.id.clone();
        let handle = Arc::new(AsyncMutex::new(AlarmStateMachine::new(definition)));
        let mut machine = handle.lock().await;
        {
            let mut alarms = write(&self.alarms);
            if alarms.contains_key(&id) {
                return Err(AlarmError::validation(format!(
                    "alarm id '{id}' is already in use"
                )));
            }
            alarms.insert(id.clone(), handle.clone());
        }
        info!(alarm_id = %id, name = %machine.definition().name, "alarm created");
        self.events.emit(AlarmEvent::Created {
            alarm_id: id.clone(),
        });

        if request.enabled {
            let ctx = self.context(&entry_id);
            if let Err(err) = machine.enable(&ctx).await {
                write(&self.alarms).remove(&id);
                return Err(err);
            }
        }
        self.persist(&machine);
        Ok(machine.record())
    }

    pub async fn delete_alarm(&self, id: &AlarmId) -> Result<(), AlarmError> {
        let handle = {
            let mut alarms = write(&self.alarms);
            let handle = alarms
                .remove(id)
                .ok_or_else(|| AlarmError::NotFound(id.clone()))?;
            self.timers.cancel_where(|fire| &fire.alarm_id == id);
            handle
        };

        let mut machine = handle.lock().await;
        let ctx = self.context(&machine.definition().entry_id);
        machine.disable(&ctx).await;
        if let Err(err) = self.store.remove_alarm(id) {
            error!(alarm_id = %id, error = %err, "failed to remove alarm from state file");
        }
        info!(alarm_id = %id, "alarm deleted");
        self.events.emit(AlarmEvent::Deleted {
            alarm_id: id.clone(),
        });
        Ok(())
    }

    pub async fn set_enabled(&self, id: &AlarmId, enabled: bool) -> Result<AlarmRecord, AlarmError> {
        let mut machine = self.acquire(id).await?;
        let ctx = self.context(&machine.definition().entry_id);
        if enabled {
            machine.enable(&ctx).await?;
        } else {
            machine.disable(&ctx).await;
        }
        Ok(self.commit(&machine))
    }

    pub async fn snooze(&self, id: &AlarmId, minutes: Option<u32>) -> Result<AlarmRecord, AlarmError> {
        let duration = match minutes {
            Some(minutes) if !SNOOZE_MINUTES.contains(&minutes) => {
                return Err(AlarmError::validation(format!(
                    "snooze minutes must be between {} and {}, got {minutes}",
                    SNOOZE_MINUTES.start(),
                    SNOOZE_MINUTES.end()
                )));
            }
            Some(minutes) => Some(Duration::minutes(i64::from(minutes))),
            None => None,
        };
        let mut machine = self.acquire(id).await?;
        let ctx = self.context(&machine.definition().entry_id);
        machine.snooze(&ctx, duration).await?;
        Ok(self.commit(&machine))
    }

    pub async fn dismiss(&self, id: &AlarmId) -> Result<AlarmRecord, AlarmError> {
        let mut machine = self.acquire(id).await?;
        let ctx = self.context(&machine.definition().entry_id);
        machine.dismiss(&ctx).await?;
        Ok(self.commit(&machine))
    }

    pub async fn skip_next(&self, id: &AlarmId) -> Result<AlarmRecord, AlarmError> {
        let mut machine = self.acquire(id).await?;
        let ctx = self.context(&machine.definition().entry_id);
        machine.skip_next(&ctx).await?;
        Ok(self.commit(&machine))
    }

    pub async fn cancel_skip(&self, id: &AlarmId) -> Result<AlarmRecord, AlarmError> {
        let mut machine = self.acquire(id).await?;
        let ctx = self.context(&machine.definition().entry_id);
        machine.cancel_skip(&ctx).await?;
        Ok(self.commit(&machine))
    }

    pub async fn set_time(&self, id: &AlarmId, time: TimeOfDay) -> Result<AlarmRecord, AlarmError> {
        let mut machine = self.acquire(id).await?;
        let ctx = self.context(&machine.definition().entry_id);
        machine.set_time(&ctx, time)?;
        Ok(self.commit(&machine))
    }

    pub async fn set_days(&self, id: &AlarmId, days: DaySet) -> Result<AlarmRecord, AlarmError> {
        let mut machine = self.acquire(id).await?;
        let ctx = self.context(&machine.definition().entry_id);
        machine.set_days(&ctx, days)?;
        Ok(self.commit(&machine))
    }

    pub async fn test_alarm(&self, id: &AlarmId) -> Result<AlarmRecord, AlarmError> {
        let mut machine = self.acquire(id).await?;
        let ctx = self.context(&machine.definition().entry_id);
        machine.test_alarm(&ctx).await?;
        Ok(self.commit(&machine))
    }

    pub async fn set_scripts(
        &self,
        id: &AlarmId,
        update: ScriptUpdate,
    ) -> Result<AlarmRecord, AlarmError> {
        let mut machine = self.acquire(id).await?;
        let definition = machine.definition();
        let mut scripts = definition.scripts.clone();
        for (phase, action) in &update.actions {
            match action {
                Some(action) => scripts.actions.insert(*phase, action.clone()),
                None => scripts.actions.remove(phase),
            };
        }
        if update.clear_fallback {
            scripts.fallback = None;
        }
        if let Some(fallback) = &update.fallback {
            scripts.fallback = Some(fallback.clone());
        }
        if let Some(timeout_secs) = update.timeout_secs {
            scripts.timeout_secs = timeout_secs;
        }
        if let Some(retry_count) = update.retry_count {
            scripts.retry_count = retry_count;
        }
        let use_device_defaults = update.use_device_defaults.unwrap_or(
            definition.use_device_defaults && update.actions.is_empty() && update.fallback.is_none(),
        );

        scripts.validate()?;
        if !use_device_defaults {
            self.ensure_actions_exist(&scripts)?;
        }
        let ctx = self.context(&machine.definition().entry_id);
        machine.set_scripts(&ctx, scripts, use_device_defaults);
        Ok(self.commit(&machine))
    }

    pub fn set_device_defaults(
        &self,
        entry_id: &EntryId,
        scripts: ScriptSettings,
    ) -> Result<DeviceDefaults, AlarmError> {
        scripts.validate()?;
        self.ensure_actions_exist(&scripts)?;
        let device = self.register_device(entry_id);
        let mut defaults = device.write().unwrap_or_else(PoisonError::into_inner);
        defaults.scripts = scripts;
        if let Err(err) = self.store.save_device(&defaults) {
            error!(entry_id = %entry_id, error = %err, "failed to persist device defaults");
        }
        info!(entry_id = %entry_id, "device defaults updated");
        Ok(defaults.clone())
    }

    pub fn device_defaults(&self, entry_id: &EntryId) -> Result<DeviceDefaults, AlarmError> {
        read(&self.devices)
            .get(entry_id)
            .map(|device| device.read().unwrap_or_else(PoisonError::into_inner).clone())
            .ok_or_else(|| AlarmError::DeviceNotFound(entry_id.clone()))
    }

    pub async fn alarm(&self, id: &AlarmId) -> Result<AlarmRecord, AlarmError> {
        Ok(self.acquire(id).await?.record())
    }

    pub async fn alarms(&self) -> Vec<AlarmRecord> {
        let handles = self.handles();
        let mut records = join_all(
            handles
                .iter()
                .map(|handle| async move { handle.lock().await.record() }),
        )
        .await;
        records.sort_by(|a, b| a.definition.id.cmp(&b.definition.id));
        records
    }

    pub fn health(&self) -> Option<HealthReport> {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn health_check(&self) -> HealthReport {
        let mut issues = Vec::new();
        let mut busy = 0;
        let handles = self.handles();
        for handle in &handles {
            // Mid-transition; checked next round.
            let Ok(mut machine) = handle.try_lock() else {
                busy += 1;
                continue;
            };
            let ctx = self.context(&machine.definition().entry_id);
            let found = machine.health_check(&ctx);
            if !found.is_empty() {
                self.persist(&machine);
                issues.extend(found);
            }
        }

        let orphaned = {
            let alarms = read(&self.alarms);
            self.timers
                .cancel_where(|fire| !alarms.contains_key(&fire.alarm_id))
        };
        if orphaned > 0 {
            issues.push(format!("cancelled {orphaned} timer(s) for deleted alarms"));
        }

        let report = HealthReport {
            checked_at: self.clock.now(),
            alarms: handles.len(),
            pending_timers: self.timers.count_where(|_| true),
            issues,
        };
        if report.issues.is_empty() {
            debug!(alarms = report.alarms, busy, "health check passed");
        } else {
            warn!(issues = ?report.issues, "health check repaired alarms");
            self.events.emit(AlarmEvent::HealthWarning {
                issues: report.issues.clone(),
            });
        }
        *self.health.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    pub async fn shutdown(&self) {
        let cancelled = self.timers.cancel_where(|_| true);
        let handles = self.handles();
        for handle in &handles {
            let machine = handle.lock().await;
            self.persist(&machine);
        }
        info!(alarms = handles.len(), cancelled, "coordinator stopped");
    }

    async fn acquire(&self, id: &AlarmId) -> Result<OwnedMutexGuard<AlarmStateMachine>, AlarmError> {
        let handle = read(&self.alarms)
            .get(id)
            .cloned()
            .ok_or_else(|| AlarmError::NotFound(id.clone()))?;
        let machine = handle.clone().lock_owned().await;
        // Deleted while we waited for the lock.
        let current = read(&self.alarms)
            .get(id)
            .is_some_and(|registered| Arc::ptr_eq(registered, &handle));
        if !current {
            return Err(AlarmError::NotFound(id.clone()));
        }
        Ok(machine)
    }

    fn handles(&self) -> Vec<AlarmHandle> {
        read(&self.alarms).values().cloned().collect()
    }

    fn context(&self, entry_id: &EntryId) -> TransitionContext<'_> {
        let defaults = read(&self.devices)
            .get(entry_id)
            .map(|device| device.read().unwrap_or_else(PoisonError::into_inner).clone());
        TransitionContext {
            clock: self.clock.as_ref(),
            time_zone: self.settings.time_zone,
            grace: self.settings.grace,
            timers: &self.timers,
            scripts: &self.scripts,
            events: &self.events,
            defaults,
        }
    }

    fn register_device(&self, entry_id: &EntryId) -> Arc<RwLock<DeviceDefaults>> {
        if let Some(device) = read(&self.devices).get(entry_id) {
            return device.clone();
        }
        write(&self.devices)
            .entry(entry_id.clone())
            .or_insert_with(|| {
                info!(entry_id = %entry_id, "registering device");
                Arc::new(RwLock::new(DeviceDefaults::new(entry_id.clone())))
            })
            .clone()
    }

    fn commit(&self, machine: &AlarmStateMachine) -> AlarmRecord {
        self.persist(machine);
        machine.record()
    }

    fn persist(&self, machine: &AlarmStateMachine) {
        if let Err(err) = self.store.save_alarm(&machine.record()) {
            error!(alarm_id = %machine.id(), error = %err, "failed to persist alarm state");
        }
    }

    fn ensure_actions_exist(&self, scripts: &ScriptSettings) -> Result<(), AlarmError> {
        match scripts
            .referenced_actions()
            .find(|action| !self.scripts.action_exists(action))
        {
            Some(action) => Err(AlarmError::validation(format!("unknown action '{action}'"))),
            None => Ok(()),
        }
    }

    fn startup_problem(&self, definition: &AlarmDefinition) -> Option<String> {
        if let Err(err) = definition.validate() {
            return Some(err.to_string());
        }
        if definition.use_device_defaults {
            return None;
        }
        definition
            .scripts
            .referenced_actions()
            .find(|action| !self.scripts.action_exists(action))
            .map(|action| format!("script action '{action}' does not exist"))
    }

    fn warn_missing_device_actions(&self) {
        for device in read(&self.devices).values() {
            let defaults = device.read().unwrap_or_else(PoisonError::into_inner);
            for action in defaults.scripts.referenced_actions() {
                if !self.scripts.action_exists(action) {
                    warn!(
                        entry_id = %defaults.entry_id,
                        %action,
                        "device default refers to an unknown action"
                    );
                }
            }
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
