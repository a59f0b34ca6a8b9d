//! Per-alarm state machine.
//!
//! ```text
//!            enable                 lead timer             trigger timer
//! Disarmed ---------> Armed ------------------> PreAlarm ---------------> Ringing
//!    ^                  ^ \______________________________________________/ ^  |
//!    |                  |            trigger timer (no lead)               |  | snooze
//!    |   dismiss /      |                                       snooze end |  v
//!    +-- auto-dismiss --+------------------------------------------------- Snoozed
//!       (one-time)        (recurring)
//! ```
//!
//! Every transition runs with the alarm's lock held by the caller. A machine
//! owns at most one timer handle; it is cancelled before a replacement is
//! registered.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, info, warn};

use crate::alarm::model::{
    AlarmDefinition, AlarmId, AlarmPhase, AlarmRecord, AlarmRuntimeState, DaySet,
    DeviceDefaults, ScriptPhase, ScriptSettings, TimeOfDay, TriggerKind,
};
use crate::alarm::schedule::compute_next;
use crate::alarm::script::{ScriptContext, ScriptRunner};
use crate::alarm::timer::{TimerEngine, TimerHandle};
use crate::clock::Clock;
use crate::error::AlarmError;
use crate::events::{AlarmEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    PreAlarm,
    Trigger,
    SnoozeEnd,
    AutoDismiss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFire {
    pub alarm_id: AlarmId,
    pub kind: TimerKind,
}

pub struct TransitionContext<'a> {
    pub clock: &'a dyn Clock,
    pub time_zone: Tz,
    pub grace: Duration,
    pub timers: &'a TimerEngine<TimerFire>,
    pub scripts: &'a ScriptRunner,
    pub events: &'a EventBus,
    pub defaults: Option<DeviceDefaults>,
}

impl TransitionContext<'_> {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Idle,
    Rearmed,
    Resumed,
    RecoveredLate,
    Missed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Dismissed,
    AutoDismissed,
    Missed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveTimer {
    handle: TimerHandle,
    kind: TimerKind,
}

#[derive(Debug)]
pub struct AlarmStateMachine {
    definition: AlarmDefinition,
    runtime: AlarmRuntimeState,
    timer: Option<ActiveTimer>,
}

impl AlarmStateMachine {
    pub fn new(definition: AlarmDefinition) -> Self {
        Self::restore(definition, AlarmRuntimeState::default())
    }

    pub fn restore(definition: AlarmDefinition, runtime: AlarmRuntimeState) -> Self {
        Self {
            definition,
            runtime,
            timer: None,
        }
    }

    pub fn id(&self) -> &AlarmId {
        &self.definition.id
    }

    pub fn definition(&self) -> &AlarmDefinition {
        &self.definition
    }

    #[cfg(test)]
    pub fn runtime(&self) -> &AlarmRuntimeState {
        &self.runtime
    }

    #[cfg(test)]
    pub fn phase(&self) -> AlarmPhase {
        self.runtime.phase
    }

    #[cfg(test)]
    pub fn pending_timer(&self) -> Option<(TimerHandle, TimerKind)> {
        self.timer.map(|timer| (timer.handle, timer.kind))
    }

    pub fn record(&self) -> AlarmRecord {
        AlarmRecord {
            definition: self.definition.clone(),
            runtime: self.runtime.clone(),
        }
    }

    pub async fn enable(&mut self, ctx: &TransitionContext<'_>) -> Result<(), AlarmError> {
        if self.definition.enabled && self.runtime.phase != AlarmPhase::Disarmed {
            return Ok(());
        }
        if self.definition.days.is_empty() {
            return Err(AlarmError::validation(
                "an alarm needs at least one day before it can be enabled",
            ));
        }
        self.definition.enabled = true;
        self.run_script(ctx, ScriptPhase::OnArm).await;
        self.schedule_next(ctx);
        info!(
            alarm_id = %self.definition.id,
            next_trigger = ?self.runtime.next_trigger,
            "alarm armed"
        );
        ctx.events.emit(AlarmEvent::Armed {
            alarm_id: self.definition.id.clone(),
            next_trigger: self.runtime.next_trigger,
        });
        Ok(())
    }

    pub async fn disable(&mut self, ctx: &TransitionContext<'_>) {
        let was_active = self.runtime.phase != AlarmPhase::Disarmed;
        if !self.definition.enabled && !was_active {
            return;
        }
        self.definition.enabled = false;
        self.clear_timer(ctx.timers);
        self.enter_disarmed();
        if was_active {
            self.run_script(ctx, ScriptPhase::OnCancel).await;
        }
        info!(alarm_id = %self.definition.id, "alarm disarmed");
        ctx.events.emit(AlarmEvent::Disarmed {
            alarm_id: self.definition.id.clone(),
        });
    }

    pub fn quarantine(&mut self, timers: &TimerEngine<TimerFire>) {
        self.definition.enabled = false;
        self.clear_timer(timers);
        self.enter_disarmed();
    }

    /// Handles a fired timer. Returns false when the fire was stale or ignored.
    pub async fn on_timer(
        &mut self,
        ctx: &TransitionContext<'_>,
        handle: TimerHandle,
        kind: TimerKind,
    ) -> bool {
        if self.timer.map(|timer| timer.handle) != Some(handle) {
            debug!(alarm_id = %self.definition.id, ?kind, "ignoring stale timer");
            return false;
        }
        self.timer = None;

        match (self.runtime.phase, kind) {
            (AlarmPhase::Armed, TimerKind::PreAlarm) => self.enter_pre_alarm(ctx).await,
            (AlarmPhase::Armed | AlarmPhase::PreAlarm, TimerKind::Trigger) => {
                self.fire_trigger(ctx).await;
            }
            (AlarmPhase::Snoozed, TimerKind::SnoozeEnd) => {
                let now = ctx.now();
                self.resume_ringing(ctx, now).await;
            }
            (AlarmPhase::Ringing, TimerKind::AutoDismiss) => {
                self.complete(ctx, Completion::AutoDismissed).await;
            }
            (phase, kind) => {
                warn!(
                    alarm_id = %self.definition.id,
                    %phase,
                    ?kind,
                    "timer fired in unexpected phase"
                );
                return false;
            }
        }
        true
    }

    pub async fn snooze(
        &mut self,
        ctx: &TransitionContext<'_>,
        duration: Option<Duration>,
    ) -> Result<(), AlarmError> {
        if self.runtime.phase != AlarmPhase::Ringing {
            return Err(self.invalid_state("snooze"));
        }
        let max = self.definition.max_snooze_count;
        if self.runtime.snooze_count >= max {
            warn!(alarm_id = %self.definition.id, max, "snooze limit reached");
            ctx.events.emit(AlarmEvent::SnoozeLimitReached {
                alarm_id: self.definition.id.clone(),
                max_snooze_count: max,
            });
            return Err(AlarmError::SnoozeLimitReached {
                id: self.definition.id.clone(),
                max,
            });
        }

        let until = ctx.now() + duration.unwrap_or_else(|| self.definition.snooze_duration());
        self.runtime.phase = AlarmPhase::Snoozed;
        self.runtime.snooze_count += 1;
        self.runtime.snooze_end_time = Some(until);
        self.runtime.ringing_since = None;
        // Replaces the auto-dismiss timer.
        self.set_timer(ctx.timers, until, TimerKind::SnoozeEnd);
        info!(
            alarm_id = %self.definition.id,
            snooze_count = self.runtime.snooze_count,
            %until,
            "alarm snoozed"
        );
        ctx.events.emit(AlarmEvent::Snoozed {
            alarm_id: self.definition.id.clone(),
            snooze_count: self.runtime.snooze_count,
            until,
        });
        self.run_script(ctx, ScriptPhase::OnSnooze).await;
        Ok(())
    }

    pub async fn dismiss(&mut self, ctx: &TransitionContext<'_>) -> Result<(), AlarmError> {
        if !self.runtime.phase.is_ringing_cycle() {
            return Err(self.invalid_state("dismiss"));
        }
        self.complete(ctx, Completion::Dismissed).await;
        Ok(())
    }

    pub async fn skip_next(&mut self, ctx: &TransitionContext<'_>) -> Result<(), AlarmError> {
        self.ensure_not_ringing("skip the next occurrence")?;
        if self.definition.skip_next {
            return Ok(());
        }
        self.definition.skip_next = true;
        self.runtime.skipped_occurrence = None;
        if self.definition.enabled {
            self.schedule_next(ctx);
        }
        info!(
            alarm_id = %self.definition.id,
            next_trigger = ?self.runtime.next_trigger,
            "next occurrence skipped"
        );
        ctx.events.emit(AlarmEvent::Skipped {
            alarm_id: self.definition.id.clone(),
            next_trigger: self.runtime.next_trigger,
        });
        self.run_script(ctx, ScriptPhase::OnSkip).await;
        Ok(())
    }

    pub async fn cancel_skip(&mut self, ctx: &TransitionContext<'_>) -> Result<(), AlarmError> {
        self.ensure_not_ringing("cancel a skip")?;
        if !self.definition.skip_next {
            return Ok(());
        }
        self.definition.skip_next = false;
        self.runtime.skipped_occurrence = None;
        if self.definition.enabled {
            self.schedule_next(ctx);
        }
        info!(alarm_id = %self.definition.id, "skip cancelled");
        ctx.events.emit(AlarmEvent::SkipCancelled {
            alarm_id: self.definition.id.clone(),
            next_trigger: self.runtime.next_trigger,
        });
        self.run_script(ctx, ScriptPhase::OnSkip).await;
        Ok(())
    }

    pub fn set_time(
        &mut self,
        ctx: &TransitionContext<'_>,
        time: TimeOfDay,
    ) -> Result<(), AlarmError> {
        self.ensure_not_ringing("change its time")?;
        let old_time = self.definition.time;
        self.definition.time = time;
        if self.definition.enabled {
            self.schedule_next(ctx);
        }
        info!(alarm_id = %self.definition.id, %old_time, new_time = %time, "alarm time changed");
        ctx.events.emit(AlarmEvent::TimeChanged {
            alarm_id: self.definition.id.clone(),
            old_time,
            new_time: time,
        });
        Ok(())
    }

    pub fn set_days(&mut self, ctx: &TransitionContext<'_>, days: DaySet) -> Result<(), AlarmError> {
        self.ensure_not_ringing("change its days")?;
        if days.is_empty() && self.definition.enabled {
            return Err(AlarmError::validation(
                "an enabled alarm needs at least one day",
            ));
        }
        self.definition.days = days;
        if self.definition.enabled {
            self.schedule_next(ctx);
        }
        info!(alarm_id = %self.definition.id, %days, "alarm days changed");
        ctx.events.emit(AlarmEvent::DaysChanged {
            alarm_id: self.definition.id.clone(),
            days,
        });
        Ok(())
    }

    pub fn set_scripts(
        &mut self,
        ctx: &TransitionContext<'_>,
        scripts: ScriptSettings,
        use_device_defaults: bool,
    ) {
        self.definition.scripts = scripts;
        self.definition.use_device_defaults = use_device_defaults;
        info!(alarm_id = %self.definition.id, use_device_defaults, "alarm scripts updated");
        ctx.events.emit(AlarmEvent::ScriptsChanged {
            alarm_id: self.definition.id.clone(),
            use_device_defaults,
        });
    }

    pub async fn test_alarm(&mut self, ctx: &TransitionContext<'_>) -> Result<(), AlarmError> {
        self.ensure_not_ringing("start a test")?;
        info!(alarm_id = %self.definition.id, "test alarm requested");
        self.start_ringing(ctx, TriggerKind::ManualTest, None).await;
        Ok(())
    }

    pub async fn recover(&mut self, ctx: &TransitionContext<'_>) -> Recovery {
        let now = ctx.now();
        if !self.definition.enabled {
            self.enter_disarmed();
            return Recovery::Idle;
        }

        match self.runtime.phase {
            AlarmPhase::Ringing => {
                let since = self
                    .runtime
                    .ringing_since
                    .or(self.runtime.last_trigger_time)
                    .unwrap_or(now);
                if now - since <= ctx.grace {
                    self.resume_ringing(ctx, since).await;
                    Recovery::Resumed
                } else {
                    self.complete_missed(ctx, since).await;
                    Recovery::Missed
                }
            }
            AlarmPhase::Snoozed => {
                let until = self.runtime.snooze_end_time.unwrap_or(now);
                if until > now {
                    self.set_timer(ctx.timers, until, TimerKind::SnoozeEnd);
                    Recovery::Resumed
                } else if now - until <= ctx.grace {
                    self.resume_ringing(ctx, now).await;
                    Recovery::Resumed
                } else {
                    self.complete_missed(ctx, until).await;
                    Recovery::Missed
                }
            }
            AlarmPhase::Armed | AlarmPhase::PreAlarm => match self.runtime.next_trigger {
                Some(due) if due > now => {
                    let was_pre_alarm = self.runtime.phase == AlarmPhase::PreAlarm;
                    self.schedule_next(ctx);
                    if was_pre_alarm
                        && self.runtime.next_trigger == Some(due)
                        && self.timer.map(|timer| timer.kind) == Some(TimerKind::Trigger)
                    {
                        self.runtime.phase = AlarmPhase::PreAlarm;
                    }
                    Recovery::Rearmed
                }
                Some(due) if now - due <= ctx.grace => {
                    self.start_ringing(ctx, TriggerKind::MissedRecovery, Some(due))
                        .await;
                    Recovery::RecoveredLate
                }
                Some(due) => {
                    self.schedule_after_miss(ctx, due);
                    Recovery::Missed
                }
                None => {
                    self.schedule_next(ctx);
                    Recovery::Rearmed
                }
            },
            AlarmPhase::Disarmed => {
                self.schedule_next(ctx);
                Recovery::Rearmed
            }
        }
    }

    pub fn health_check(&mut self, ctx: &TransitionContext<'_>) -> Vec<String> {
        let mut issues = Vec::new();
        let now = ctx.now();
        let timer_live = self
            .timer
            .is_some_and(|timer| ctx.timers.is_pending(timer.handle));
        let id = &self.definition.id;

        match self.runtime.phase {
            AlarmPhase::Armed | AlarmPhase::PreAlarm if self.definition.enabled && !timer_live => {
                issues.push(format!("alarm '{id}' is armed without a pending timer"));
                self.schedule_next(ctx);
            }
            AlarmPhase::Disarmed if self.definition.enabled => {
                issues.push(format!("alarm '{id}' is enabled but disarmed"));
                self.schedule_next(ctx);
            }
            AlarmPhase::Snoozed if !timer_live => {
                issues.push(format!("alarm '{id}' is snoozed without a wake-up timer"));
                let until = self.runtime.snooze_end_time.unwrap_or(now).max(now);
                self.set_timer(ctx.timers, until, TimerKind::SnoozeEnd);
            }
            AlarmPhase::Ringing if !timer_live => {
                if let Some(timeout) = self.definition.auto_dismiss_timeout() {
                    issues.push(format!("alarm '{id}' is ringing without an auto-dismiss timer"));
                    let since = self.runtime.ringing_since.unwrap_or(now);
                    self.set_timer(ctx.timers, (since + timeout).max(now), TimerKind::AutoDismiss);
                }
            }
            _ => {}
        }
        issues
    }

    async fn enter_pre_alarm(&mut self, ctx: &TransitionContext<'_>) {
        let Some(due) = self.runtime.next_trigger else {
            self.schedule_next(ctx);
            return;
        };
        self.runtime.phase = AlarmPhase::PreAlarm;
        self.set_timer(ctx.timers, due, TimerKind::Trigger);
        info!(alarm_id = %self.definition.id, %due, "pre-alarm started");
        ctx.events.emit(AlarmEvent::PreAlarm {
            alarm_id: self.definition.id.clone(),
            next_trigger: due,
        });
        self.run_script(ctx, ScriptPhase::PreAlarm).await;
    }

    async fn fire_trigger(&mut self, ctx: &TransitionContext<'_>) {
        let now = ctx.now();
        let due = self.runtime.next_trigger.unwrap_or(now);
        if now - due > ctx.grace {
            self.schedule_after_miss(ctx, due);
            return;
        }
        self.start_ringing(ctx, TriggerKind::Scheduled, Some(due)).await;
    }

    async fn start_ringing(
        &mut self,
        ctx: &TransitionContext<'_>,
        trigger: TriggerKind,
        due: Option<DateTime<Utc>>,
    ) {
        let now = ctx.now();
        self.runtime.trigger = Some(trigger);
        self.runtime.snooze_count = 0;
        self.runtime.last_trigger_time = Some(due.unwrap_or(now));
        if due.is_some() {
            self.definition.skip_next = false;
            self.runtime.skipped_occurrence = None;
        }
        self.resume_ringing(ctx, now).await;
    }

    /// Enters Ringing for the current cycle, counting auto-dismiss from `since`.
    async fn resume_ringing(&mut self, ctx: &TransitionContext<'_>, since: DateTime<Utc>) {
        let now = ctx.now();
        self.runtime.phase = AlarmPhase::Ringing;
        self.runtime.ringing_since = Some(since);
        self.runtime.snooze_end_time = None;
        self.refresh_next_trigger(ctx, now);
        match self.definition.auto_dismiss_timeout() {
            Some(timeout) => {
                self.set_timer(ctx.timers, (since + timeout).max(now), TimerKind::AutoDismiss);
            }
            None => self.clear_timer(ctx.timers),
        }

        let trigger = self.runtime.trigger.unwrap_or(TriggerKind::Scheduled);
        info!(
            alarm_id = %self.definition.id,
            ?trigger,
            snooze_count = self.runtime.snooze_count,
            "alarm ringing"
        );
        ctx.events.emit(AlarmEvent::Triggered {
            alarm_id: self.definition.id.clone(),
            trigger,
            snooze_count: self.runtime.snooze_count,
        });
        self.run_script(ctx, ScriptPhase::Alarm).await;
    }

    async fn complete(&mut self, ctx: &TransitionContext<'_>, completion: Completion) {
        let was_test = self.runtime.trigger == Some(TriggerKind::ManualTest);
        self.clear_timer(ctx.timers);
        self.runtime.snooze_count = 0;
        self.runtime.snooze_end_time = None;
        self.runtime.ringing_since = None;
        self.runtime.trigger = None;

        if self.definition.enabled && self.definition.is_one_time() && !was_test {
            info!(alarm_id = %self.definition.id, "one-time alarm finished; disabling");
            self.definition.enabled = false;
        }
        if self.definition.enabled {
            self.schedule_next(ctx);
        } else {
            self.enter_disarmed();
        }

        let alarm_id = self.definition.id.clone();
        let script = match completion {
            Completion::Dismissed => {
                info!(%alarm_id, "alarm dismissed");
                ctx.events.emit(AlarmEvent::Dismissed { alarm_id });
                Some(ScriptPhase::OnDismiss)
            }
            Completion::AutoDismissed => {
                info!(%alarm_id, "alarm auto-dismissed");
                ctx.events.emit(AlarmEvent::AutoDismissed { alarm_id });
                Some(ScriptPhase::PostAlarm)
            }
            Completion::Missed => None,
        };
        if let Some(phase) = script {
            self.run_script(ctx, phase).await;
        }
    }

    async fn complete_missed(&mut self, ctx: &TransitionContext<'_>, due: DateTime<Utc>) {
        self.complete(ctx, Completion::Missed).await;
        self.report_miss(ctx, due);
    }

    fn schedule_after_miss(&mut self, ctx: &TransitionContext<'_>, due: DateTime<Utc>) {
        if self.definition.skip_next
            && self
                .runtime
                .skipped_occurrence
                .is_some_and(|skipped| skipped < due)
        {
            self.definition.skip_next = false;
            self.runtime.skipped_occurrence = None;
        }
        self.schedule_next(ctx);
        self.report_miss(ctx, due);
    }

    fn report_miss(&self, ctx: &TransitionContext<'_>, due: DateTime<Utc>) {
        warn!(
            alarm_id = %self.definition.id,
            %due,
            next_trigger = ?self.runtime.next_trigger,
            "alarm occurrence missed"
        );
        ctx.events.emit(AlarmEvent::Missed {
            alarm_id: self.definition.id.clone(),
            due,
            next_trigger: self.runtime.next_trigger,
        });
    }

    fn schedule_next(&mut self, ctx: &TransitionContext<'_>) {
        let now = ctx.now();
        let skip = self.skip_pending(now);
        let Some(next) = compute_next(
            &now,
            self.definition.time,
            self.definition.days,
            skip,
            &ctx.time_zone,
        ) else {
            error!(
                alarm_id = %self.definition.id,
                "no upcoming occurrence; disarming"
            );
            self.definition.enabled = false;
            self.clear_timer(ctx.timers);
            self.enter_disarmed();
            return;
        };

        self.runtime.phase = AlarmPhase::Armed;
        self.runtime.next_trigger = Some(next.at);
        if skip {
            self.runtime.skipped_occurrence = next.skipped;
        } else if !self.definition.skip_next {
            self.runtime.skipped_occurrence = None;
        }

        let lead = self.definition.pre_alarm_lead();
        let wake_at = next.at - lead;
        if lead > Duration::zero() && wake_at > now {
            self.set_timer(ctx.timers, wake_at, TimerKind::PreAlarm);
        } else {
            self.set_timer(ctx.timers, next.at, TimerKind::Trigger);
        }
        debug!(
            alarm_id = %self.definition.id,
            next_trigger = %next.at,
            skip,
            "next trigger scheduled"
        );
    }

    /// A skip stays pending until the occurrence it bypasses has passed.
    fn skip_pending(&self, now: DateTime<Utc>) -> bool {
        self.definition.skip_next
            && self
                .runtime
                .skipped_occurrence
                .is_none_or(|skipped| skipped > now)
    }

    fn refresh_next_trigger(&mut self, ctx: &TransitionContext<'_>, now: DateTime<Utc>) {
        if !self.definition.enabled {
            self.runtime.next_trigger = None;
            return;
        }
        if self.runtime.next_trigger.is_some_and(|at| at > now) {
            return;
        }
        let skip = self.skip_pending(now);
        self.runtime.next_trigger = compute_next(
            &now,
            self.definition.time,
            self.definition.days,
            skip,
            &ctx.time_zone,
        )
        .map(|next| next.at);
    }

    fn enter_disarmed(&mut self) {
        self.runtime.phase = AlarmPhase::Disarmed;
        self.runtime.next_trigger = None;
        self.runtime.snooze_count = 0;
        self.runtime.snooze_end_time = None;
        self.runtime.ringing_since = None;
        self.runtime.trigger = None;
    }

    fn set_timer(&mut self, timers: &TimerEngine<TimerFire>, at: DateTime<Utc>, kind: TimerKind) {
        self.clear_timer(timers);
        let handle = timers.schedule(
            at,
            TimerFire {
                alarm_id: self.definition.id.clone(),
                kind,
            },
        );
        self.timer = Some(ActiveTimer { handle, kind });
    }

    fn clear_timer(&mut self, timers: &TimerEngine<TimerFire>) {
        if let Some(timer) = self.timer.take() {
            timers.cancel(timer.handle);
        }
    }

    fn ensure_not_ringing(&self, command: &'static str) -> Result<(), AlarmError> {
        if self.runtime.phase.is_ringing_cycle() {
            return Err(self.invalid_state(command));
        }
        Ok(())
    }

    fn invalid_state(&self, command: &'static str) -> AlarmError {
        AlarmError::InvalidState {
            id: self.definition.id.clone(),
            phase: self.runtime.phase,
            command,
        }
    }

    fn script_context(&self, phase: ScriptPhase) -> ScriptContext {
        ScriptContext {
            alarm_id: self.definition.id.clone(),
            alarm_name: self.definition.name.clone(),
            alarm_time: self.definition.time,
            phase,
            trigger: self.runtime.trigger,
            snooze_count: self.runtime.snooze_count,
            is_one_time: self.definition.is_one_time(),
            days: self.definition.days,
        }
    }

    async fn run_script(&self, ctx: &TransitionContext<'_>, phase: ScriptPhase) {
        let request = self.definition.resolve_script(phase, ctx.defaults.as_ref());
        if request.action.is_none() {
            return;
        }
        let context = self.script_context(phase);
        let outcome = ctx.scripts.run(&request, &context).await;
        if let Some(error) = outcome.error {
            ctx.events.emit(AlarmEvent::ScriptFailed {
                alarm_id: self.definition.id.clone(),
                phase,
                action: request.action,
                attempts: outcome.attempts,
                fallback_succeeded: outcome.fallback,
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Weekday};
    use tokio::sync::broadcast;

    use super::*;
    use crate::alarm::model::{ActionRef, EntryId};
    use crate::alarm::script::BackoffPolicy;
    use crate::alarm::script::testing::ScriptedBackend;
    use crate::clock::FakeClock;
    use crate::events::drain;

    struct Harness {
        clock: FakeClock,
        timers: TimerEngine<TimerFire>,
        scripts: ScriptRunner,
        events: EventBus,
        backend: Arc<ScriptedBackend>,
    }

    impl Harness {
        fn new(backend: ScriptedBackend) -> Self {
            let backend = Arc::new(backend);
            Self {
                clock: FakeClock::new(utc(2, 6, 0)),
                timers: TimerEngine::new(),
                scripts: ScriptRunner::new(backend.clone(), BackoffPolicy::default()),
                events: EventBus::new(),
                backend,
            }
        }

        fn ctx(&self) -> TransitionContext<'_> {
            TransitionContext {
                clock: &self.clock,
                time_zone: chrono_tz::UTC,
                grace: Duration::minutes(10),
                timers: &self.timers,
                scripts: &self.scripts,
                events: &self.events,
                defaults: None,
            }
        }

        async fn advance_to(&self, machine: &mut AlarmStateMachine, at: DateTime<Utc>) -> bool {
            self.clock.set(at);
            let mut fired = false;
            loop {
                let due = self.timers.take_due(at);
                if due.is_empty() {
                    return fired;
                }
                for (handle, fire) in due {
                    fired |= machine.on_timer(&self.ctx(), handle, fire.kind).await;
                }
            }
        }

        fn outstanding(&self, id: &AlarmId) -> usize {
            self.timers.count_where(|fire| &fire.alarm_id == id)
        }
    }

    // 2026-03-02 is a Monday.
    fn utc(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0)
            .single()
            .expect("valid instant")
    }

    fn definition(days: DaySet) -> AlarmDefinition {
        AlarmDefinition::new(
            AlarmId::new("wake"),
            EntryId::default(),
            "Wake".to_string(),
            TimeOfDay::new(7, 0).expect("time"),
            days,
        )
    }

    fn with_scripts(mut definition: AlarmDefinition) -> AlarmDefinition {
        definition.use_device_defaults = false;
        for (phase, name) in [
            (ScriptPhase::PreAlarm, "script.pre"),
            (ScriptPhase::Alarm, "script.ring"),
            (ScriptPhase::PostAlarm, "script.post"),
            (ScriptPhase::OnSnooze, "script.snooze"),
            (ScriptPhase::OnDismiss, "script.dismiss"),
            (ScriptPhase::OnArm, "script.arm"),
            (ScriptPhase::OnCancel, "script.cancel"),
            (ScriptPhase::OnSkip, "script.skip"),
        ] {
            definition.scripts.actions.insert(phase, ActionRef::new(name));
        }
        definition
    }

    fn all_scripts() -> ScriptedBackend {
        [
            "script.pre",
            "script.ring",
            "script.post",
            "script.snooze",
            "script.dismiss",
            "script.arm",
            "script.cancel",
            "script.skip",
        ]
        .into_iter()
        .fold(ScriptedBackend::new(), ScriptedBackend::with_action)
    }

    fn assert_future_trigger(machine: &AlarmStateMachine, now: DateTime<Utc>) {
        if machine.definition().enabled {
            let next = machine.runtime().next_trigger.expect("enabled alarm has a trigger");
            assert!(next > now, "next trigger {next} must be after {now}");
        } else {
            assert_eq!(machine.runtime().next_trigger, None);
        }
    }

    async fn ringing_machine(harness: &Harness, definition: AlarmDefinition) -> AlarmStateMachine {
        let mut machine = AlarmStateMachine::new(definition);
        machine.enable(&harness.ctx()).await.expect("enable");
        harness.advance_to(&mut machine, utc(2, 7, 0)).await;
        assert_eq!(machine.phase(), AlarmPhase::Ringing);
        machine
    }

    #[tokio::test]
    async fn weekday_alarm_walks_through_pre_alarm_into_ringing() {
        let harness = Harness::new(all_scripts());
        let mut definition = with_scripts(definition(DaySet::WEEKDAYS));
        definition.pre_alarm_minutes = 5;
        let mut machine = AlarmStateMachine::new(definition);

        machine.enable(&harness.ctx()).await.expect("enable");
        assert_eq!(machine.phase(), AlarmPhase::Armed);
        assert_eq!(machine.runtime().next_trigger, Some(utc(2, 7, 0)));
        assert_eq!(
            harness.timers.deadline_of(machine.pending_timer().expect("timer").0),
            Some(utc(2, 6, 55))
        );
        assert_eq!(harness.backend.calls_to("script.arm"), 1);

        assert!(!harness.advance_to(&mut machine, utc(2, 6, 54)).await);
        assert_eq!(machine.phase(), AlarmPhase::Armed);

        assert!(harness.advance_to(&mut machine, utc(2, 6, 55)).await);
        assert_eq!(machine.phase(), AlarmPhase::PreAlarm);
        assert_eq!(harness.backend.calls_to("script.pre"), 1);
        assert_eq!(harness.outstanding(machine.id()), 1);

        assert!(harness.advance_to(&mut machine, utc(2, 7, 0)).await);
        assert_eq!(machine.phase(), AlarmPhase::Ringing);
        assert_eq!(machine.runtime().last_trigger_time, Some(utc(2, 7, 0)));
        assert_eq!(harness.backend.calls_to("script.ring"), 1);
        assert_eq!(machine.runtime().next_trigger, Some(utc(3, 7, 0)));
        assert_eq!(harness.outstanding(machine.id()), 1);
    }

    #[tokio::test]
    async fn snooze_schedules_wake_up_and_rings_again() {
        let harness = Harness::new(all_scripts());
        let mut machine = ringing_machine(&harness, with_scripts(definition(DaySet::WEEKDAYS))).await;

        machine.snooze(&harness.ctx(), None).await.expect("snooze");
        assert_eq!(machine.phase(), AlarmPhase::Snoozed);
        assert_eq!(machine.runtime().snooze_count, 1);
        assert_eq!(machine.runtime().snooze_end_time, Some(utc(2, 7, 9)));
        assert_eq!(
            machine.pending_timer().map(|(_, kind)| kind),
            Some(TimerKind::SnoozeEnd)
        );
        assert_eq!(harness.outstanding(machine.id()), 1);
        assert_eq!(harness.backend.calls_to("script.snooze"), 1);

        assert!(harness.advance_to(&mut machine, utc(2, 7, 9)).await);
        assert_eq!(machine.phase(), AlarmPhase::Ringing);
        assert_eq!(machine.runtime().snooze_count, 1);
        assert_eq!(harness.backend.calls_to("script.ring"), 2);
        assert_eq!(
            machine.pending_timer().map(|(_, kind)| kind),
            Some(TimerKind::AutoDismiss)
        );
    }

    #[tokio::test]
    async fn snooze_at_limit_is_rejected_and_keeps_ringing() {
        let harness = Harness::new(ScriptedBackend::new());
        let mut definition = definition(DaySet::WEEKDAYS);
        definition.max_snooze_count = 1;
        let mut machine = ringing_machine(&harness, definition).await;
        let mut events = harness.events.subscribe();

        machine.snooze(&harness.ctx(), None).await.expect("first snooze");
        harness.advance_to(&mut machine, utc(2, 7, 9)).await;
        assert_eq!(machine.phase(), AlarmPhase::Ringing);

        let err = machine
            .snooze(&harness.ctx(), None)
            .await
            .expect_err("limit reached");
        assert!(matches!(err, AlarmError::SnoozeLimitReached { max: 1, .. }));
        assert_eq!(machine.phase(), AlarmPhase::Ringing);
        assert_eq!(machine.runtime().snooze_count, 1);
        assert!(
            drain(&mut events)
                .iter()
                .any(|event| matches!(event, AlarmEvent::SnoozeLimitReached { .. }))
        );
    }

    #[tokio::test]
    async fn snooze_accepts_a_one_off_duration() {
        let harness = Harness::new(ScriptedBackend::new());
        let mut machine = ringing_machine(&harness, definition(DaySet::WEEKDAYS)).await;
        machine
            .snooze(&harness.ctx(), Some(Duration::minutes(2)))
            .await
            .expect("snooze");
        assert_eq!(machine.runtime().snooze_end_time, Some(utc(2, 7, 2)));
    }

    #[tokio::test]
    async fn dismissing_one_time_alarm_disables_it() {
        let harness = Harness::new(all_scripts());
        let wednesday = DaySet::from_days([Weekday::Wed]);
        let mut machine = AlarmStateMachine::new(with_scripts(definition(wednesday)));
        machine.enable(&harness.ctx()).await.expect("enable");
        assert_eq!(machine.runtime().next_trigger, Some(utc(4, 7, 0)));

        harness.advance_to(&mut machine, utc(4, 6, 55)).await;
        harness.advance_to(&mut machine, utc(4, 7, 0)).await;
        assert_eq!(machine.phase(), AlarmPhase::Ringing);

        machine.dismiss(&harness.ctx()).await.expect("dismiss");
        assert!(!machine.definition().enabled);
        assert_eq!(machine.runtime().next_trigger, None);
        assert_eq!(machine.phase(), AlarmPhase::Disarmed);
        assert_eq!(machine.runtime().snooze_count, 0);
        assert_eq!(harness.outstanding(machine.id()), 0);
        assert_eq!(harness.backend.calls_to("script.dismiss"), 1);
    }

    #[tokio::test]
    async fn dismissing_recurring_alarm_rearms_and_resets_snoozes() {
        let harness = Harness::new(ScriptedBackend::new());
        let mut machine = ringing_machine(&harness, definition(DaySet::WEEKDAYS)).await;
        machine.snooze(&harness.ctx(), None).await.expect("snooze");

        harness.clock.set(utc(2, 7, 3));
        machine.dismiss(&harness.ctx()).await.expect("dismiss");
        assert_eq!(machine.phase(), AlarmPhase::Armed);
        assert_eq!(machine.runtime().snooze_count, 0);
        assert_eq!(machine.runtime().snooze_end_time, None);
        assert_eq!(machine.runtime().next_trigger, Some(utc(3, 7, 0)));
        assert_eq!(harness.outstanding(machine.id()), 1);
        assert_future_trigger(&machine, utc(2, 7, 3));
    }

    #[tokio::test]
    async fn auto_dismiss_runs_post_alarm_script() {
        let harness = Harness::new(all_scripts());
        let mut definition = with_scripts(definition(DaySet::WEEKDAYS));
        definition.auto_dismiss_minutes = 30;
        let mut machine = ringing_machine(&harness, definition).await;
        let mut events = harness.events.subscribe();

        assert!(harness.advance_to(&mut machine, utc(2, 7, 30)).await);
        assert_eq!(machine.phase(), AlarmPhase::Armed);
        assert_eq!(harness.backend.calls_to("script.post"), 1);
        assert_eq!(harness.backend.calls_to("script.dismiss"), 0);
        assert!(
            drain(&mut events)
                .iter()
                .any(|event| matches!(event, AlarmEvent::AutoDismissed { .. }))
        );
    }

    #[tokio::test]
    async fn skip_bypasses_one_occurrence_then_clears() {
        let harness = Harness::new(all_scripts());
        let mut definition = with_scripts(definition(DaySet::WEEKDAYS));
        definition.pre_alarm_minutes = 0;
        let mut machine = AlarmStateMachine::new(definition);
        machine.enable(&harness.ctx()).await.expect("enable");

        machine.skip_next(&harness.ctx()).await.expect("skip");
        assert!(machine.definition().skip_next);
        assert_eq!(machine.runtime().next_trigger, Some(utc(3, 7, 0)));
        assert_eq!(harness.backend.calls_to("script.skip"), 1);

        assert!(!harness.advance_to(&mut machine, utc(2, 7, 0)).await);
        assert_eq!(machine.phase(), AlarmPhase::Armed);
        assert!(machine.definition().skip_next);

        assert!(harness.advance_to(&mut machine, utc(3, 7, 0)).await);
        assert_eq!(machine.phase(), AlarmPhase::Ringing);
        assert!(!machine.definition().skip_next);
        machine.dismiss(&harness.ctx()).await.expect("dismiss");
        assert_eq!(machine.runtime().next_trigger, Some(utc(4, 7, 0)));
    }

    #[tokio::test]
    async fn cancel_skip_restores_the_original_occurrence() {
        let harness = Harness::new(ScriptedBackend::new());
        let mut machine = AlarmStateMachine::new(definition(DaySet::WEEKDAYS));
        machine.enable(&harness.ctx()).await.expect("enable");
        machine.skip_next(&harness.ctx()).await.expect("skip");
        machine.cancel_skip(&harness.ctx()).await.expect("unskip");
        assert!(!machine.definition().skip_next);
        assert_eq!(machine.runtime().next_trigger, Some(utc(2, 7, 0)));
        assert_eq!(harness.outstanding(machine.id()), 1);
    }

    #[tokio::test]
    async fn definition_changes_are_rejected_while_ringing() {
        let harness = Harness::new(ScriptedBackend::new());
        let mut machine = ringing_machine(&harness, definition(DaySet::WEEKDAYS)).await;
        let before = machine.record();

        let new_time = TimeOfDay::new(8, 0).expect("time");
        let err = machine
            .set_time(&harness.ctx(), new_time)
            .expect_err("invalid state");
        assert_eq!(err.code(), "invalid_state");
        let err = machine
            .set_days(&harness.ctx(), DaySet::from_days([Weekday::Sat]))
            .expect_err("invalid state");
        assert_eq!(err.code(), "invalid_state");
        let err = machine.skip_next(&harness.ctx()).await.expect_err("invalid");
        assert_eq!(err.code(), "invalid_state");
        assert_eq!(machine.record(), before);
    }

    #[tokio::test]
    async fn set_time_reschedules_with_single_timer() {
        let harness = Harness::new(ScriptedBackend::new());
        let mut machine = AlarmStateMachine::new(definition(DaySet::WEEKDAYS));
        machine.enable(&harness.ctx()).await.expect("enable");
        let old = machine.pending_timer().expect("timer").0;

        machine
            .set_time(&harness.ctx(), TimeOfDay::new(6, 30).expect("time"))
            .expect("set time");
        assert!(!harness.timers.is_pending(old));
        assert_eq!(harness.outstanding(machine.id()), 1);
        assert_eq!(machine.runtime().next_trigger, Some(utc(2, 6, 30)));

        let err = machine
            .set_days(&harness.ctx(), DaySet::default())
            .expect_err("empty days");
        assert_eq!(err.code(), "validation_error");
        assert_eq!(machine.definition().days, DaySet::WEEKDAYS);
    }

    #[tokio::test]
    async fn disable_cancels_timer_and_runs_cancel_script() {
        let harness = Harness::new(all_scripts());
        let mut machine = AlarmStateMachine::new(with_scripts(definition(DaySet::WEEKDAYS)));
        machine.enable(&harness.ctx()).await.expect("enable");
        machine.disable(&harness.ctx()).await;

        assert_eq!(machine.phase(), AlarmPhase::Disarmed);
        assert_eq!(machine.runtime().next_trigger, None);
        assert_eq!(harness.outstanding(machine.id()), 0);
        assert_eq!(harness.backend.calls_to("script.cancel"), 1);

        machine.disable(&harness.ctx()).await;
        assert_eq!(harness.backend.calls_to("script.cancel"), 1);
    }

    #[tokio::test]
    async fn enabling_without_days_is_rejected() {
        let harness = Harness::new(ScriptedBackend::new());
        let mut machine = AlarmStateMachine::new(definition(DaySet::default()));
        let err = machine.enable(&harness.ctx()).await.expect_err("no days");
        assert_eq!(err.code(), "validation_error");
        assert!(!machine.definition().enabled);
    }

    #[tokio::test]
    async fn stale_timer_handle_has_no_effect() {
        let harness = Harness::new(ScriptedBackend::new());
        let mut machine = AlarmStateMachine::new(definition(DaySet::WEEKDAYS));
        machine.enable(&harness.ctx()).await.expect("enable");
        let (stale, kind) = machine.pending_timer().expect("timer");
        machine
            .set_time(&harness.ctx(), TimeOfDay::new(9, 0).expect("time"))
            .expect("set time");

        assert!(!machine.on_timer(&harness.ctx(), stale, kind).await);
        assert_eq!(machine.phase(), AlarmPhase::Armed);
    }

    #[tokio::test]
    async fn late_trigger_beyond_grace_is_reported_as_missed() {
        let harness = Harness::new(ScriptedBackend::new());
        let mut definition = definition(DaySet::WEEKDAYS);
        definition.pre_alarm_minutes = 0;
        let mut machine = AlarmStateMachine::new(definition);
        machine.enable(&harness.ctx()).await.expect("enable");
        let mut events = harness.events.subscribe();

        harness.advance_to(&mut machine, utc(2, 7, 45)).await;
        assert_eq!(machine.phase(), AlarmPhase::Armed);
        assert_eq!(machine.runtime().next_trigger, Some(utc(3, 7, 0)));
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            AlarmEvent::Missed { due, .. } if *due == utc(2, 7, 0)
        )));
    }

    #[tokio::test]
    async fn test_alarm_rings_without_consuming_one_time_alarm() {
        let harness = Harness::new(ScriptedBackend::new());
        let wednesday = DaySet::from_days([Weekday::Wed]);
        let mut machine = AlarmStateMachine::new(definition(wednesday));
        machine.enable(&harness.ctx()).await.expect("enable");

        machine.test_alarm(&harness.ctx()).await.expect("test");
        assert_eq!(machine.phase(), AlarmPhase::Ringing);
        assert_eq!(machine.runtime().trigger, Some(TriggerKind::ManualTest));
        assert_eq!(harness.outstanding(machine.id()), 1);

        machine.dismiss(&harness.ctx()).await.expect("dismiss");
        assert!(machine.definition().enabled);
        assert_eq!(machine.runtime().next_trigger, Some(utc(4, 7, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_alarm_script_uses_fallback_and_still_rings() {
        let backend = ScriptedBackend::new()
            .failing("script.ring", u32::MAX)
            .with_action("script.siren");
        let harness = Harness::new(backend);
        let mut definition = definition(DaySet::WEEKDAYS);
        definition.use_device_defaults = false;
        definition
            .scripts
            .actions
            .insert(ScriptPhase::Alarm, ActionRef::new("script.ring"));
        definition.scripts.fallback = Some(ActionRef::new("script.siren"));
        definition.scripts.retry_count = 2;
        let mut events: broadcast::Receiver<AlarmEvent> = harness.events.subscribe();

        let machine = ringing_machine(&harness, definition).await;
        assert_eq!(machine.phase(), AlarmPhase::Ringing);
        assert_eq!(harness.backend.calls_to("script.ring"), 3);
        assert_eq!(harness.backend.calls_to("script.siren"), 1);
        let failure = drain(&mut events)
            .into_iter()
            .find(|event| matches!(event, AlarmEvent::ScriptFailed { .. }))
            .expect("script failure reported");
        assert!(matches!(
            failure,
            AlarmEvent::ScriptFailed {
                phase: ScriptPhase::Alarm,
                attempts: 3,
                fallback_succeeded: Some(true),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn ringing_restored_within_grace_resumes() {
        let harness = Harness::new(all_scripts());
        let runtime = AlarmRuntimeState {
            phase: AlarmPhase::Ringing,
            next_trigger: Some(utc(3, 7, 0)),
            last_trigger_time: Some(utc(2, 7, 0)),
            ringing_since: Some(utc(2, 7, 0)),
            trigger: Some(TriggerKind::Scheduled),
            ..AlarmRuntimeState::default()
        };
        let mut definition = with_scripts(definition(DaySet::WEEKDAYS));
        definition.enabled = true;
        let mut machine = AlarmStateMachine::restore(definition, runtime);
        let mut events = harness.events.subscribe();

        harness.clock.set(utc(2, 7, 5));
        assert_eq!(machine.recover(&harness.ctx()).await, Recovery::Resumed);
        assert_eq!(machine.phase(), AlarmPhase::Ringing);
        assert_eq!(harness.backend.calls_to("script.ring"), 1);
        let (handle, kind) = machine.pending_timer().expect("auto-dismiss");
        assert_eq!(kind, TimerKind::AutoDismiss);
        assert_eq!(harness.timers.deadline_of(handle), Some(utc(2, 8, 0)));
        assert!(
            !drain(&mut events)
                .iter()
                .any(|event| matches!(event, AlarmEvent::Missed { .. }))
        );
    }

    #[tokio::test]
    async fn snoozed_restore_keeps_pending_wake_up() {
        let harness = Harness::new(ScriptedBackend::new());
        let runtime = AlarmRuntimeState {
            phase: AlarmPhase::Snoozed,
            next_trigger: Some(utc(3, 7, 0)),
            snooze_count: 1,
            snooze_end_time: Some(utc(2, 7, 9)),
            last_trigger_time: Some(utc(2, 7, 0)),
            trigger: Some(TriggerKind::Scheduled),
            ..AlarmRuntimeState::default()
        };
        let mut definition = definition(DaySet::WEEKDAYS);
        definition.enabled = true;
        let mut machine = AlarmStateMachine::restore(definition, runtime);

        harness.clock.set(utc(2, 7, 4));
        assert_eq!(machine.recover(&harness.ctx()).await, Recovery::Resumed);
        assert_eq!(machine.phase(), AlarmPhase::Snoozed);
        assert!(harness.advance_to(&mut machine, utc(2, 7, 9)).await);
        assert_eq!(machine.phase(), AlarmPhase::Ringing);
    }

    #[tokio::test]
    async fn armed_restore_past_grace_is_missed() {
        let harness = Harness::new(ScriptedBackend::new());
        let runtime = AlarmRuntimeState {
            phase: AlarmPhase::Armed,
            next_trigger: Some(utc(2, 7, 0)),
            ..AlarmRuntimeState::default()
        };
        let mut definition = definition(DaySet::WEEKDAYS);
        definition.enabled = true;
        let mut machine = AlarmStateMachine::restore(definition, runtime);
        let mut events = harness.events.subscribe();

        harness.clock.set(utc(2, 7, 20));
        assert_eq!(machine.recover(&harness.ctx()).await, Recovery::Missed);
        assert_eq!(machine.phase(), AlarmPhase::Armed);
        assert_eq!(machine.runtime().next_trigger, Some(utc(3, 7, 0)));
        assert!(
            drain(&mut events)
                .iter()
                .any(|event| matches!(event, AlarmEvent::Missed { .. }))
        );
    }

    #[tokio::test]
    async fn ringing_restore_past_grace_completes_as_missed() {
        let harness = Harness::new(all_scripts());
        let runtime = AlarmRuntimeState {
            phase: AlarmPhase::Ringing,
            next_trigger: Some(utc(3, 7, 0)),
            snooze_count: 2,
            last_trigger_time: Some(utc(2, 7, 0)),
            ringing_since: Some(utc(2, 7, 0)),
            trigger: Some(TriggerKind::Scheduled),
            ..AlarmRuntimeState::default()
        };
        let mut definition = with_scripts(definition(DaySet::WEEKDAYS));
        definition.enabled = true;
        let mut machine = AlarmStateMachine::restore(definition, runtime);
        let mut events = harness.events.subscribe();

        harness.clock.set(utc(2, 7, 30));
        assert_eq!(machine.recover(&harness.ctx()).await, Recovery::Missed);
        assert!(machine.definition().enabled);
        assert_eq!(machine.phase(), AlarmPhase::Armed);
        assert_eq!(machine.runtime().snooze_count, 0);
        assert_eq!(machine.runtime().ringing_since, None);
        assert_eq!(machine.runtime().next_trigger, Some(utc(3, 7, 0)));
        assert_eq!(harness.outstanding(machine.id()), 1);
        assert_eq!(harness.backend.calls_to("script.ring"), 0);
        assert_eq!(harness.backend.calls_to("script.dismiss"), 0);
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            AlarmEvent::Missed { due, next_trigger: Some(next), .. }
                if *due == utc(2, 7, 0) && *next == utc(3, 7, 0)
        )));
    }

    #[tokio::test]
    async fn snoozed_one_time_restore_past_grace_disables() {
        let harness = Harness::new(ScriptedBackend::new());
        let runtime = AlarmRuntimeState {
            phase: AlarmPhase::Snoozed,
            next_trigger: Some(utc(11, 7, 0)),
            snooze_count: 1,
            snooze_end_time: Some(utc(4, 7, 9)),
            last_trigger_time: Some(utc(4, 7, 0)),
            trigger: Some(TriggerKind::Scheduled),
            ..AlarmRuntimeState::default()
        };
        let mut definition = definition(DaySet::from_days([Weekday::Wed]));
        definition.enabled = true;
        let mut machine = AlarmStateMachine::restore(definition, runtime);
        let mut events = harness.events.subscribe();

        harness.clock.set(utc(4, 7, 40));
        assert_eq!(machine.recover(&harness.ctx()).await, Recovery::Missed);
        assert!(!machine.definition().enabled);
        assert_eq!(machine.phase(), AlarmPhase::Disarmed);
        assert_eq!(machine.runtime().next_trigger, None);
        assert_eq!(machine.runtime().snooze_count, 0);
        assert_eq!(machine.pending_timer(), None);
        assert_eq!(harness.outstanding(machine.id()), 0);
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            AlarmEvent::Missed { due, next_trigger: None, .. } if *due == utc(4, 7, 9)
        )));
    }

    #[tokio::test]
    async fn armed_one_time_restore_past_grace_stays_armed_for_next_week() {
        let harness = Harness::new(ScriptedBackend::new());
        let runtime = AlarmRuntimeState {
            phase: AlarmPhase::Armed,
            next_trigger: Some(utc(4, 7, 0)),
            ..AlarmRuntimeState::default()
        };
        let mut definition = definition(DaySet::from_days([Weekday::Wed]));
        definition.enabled = true;
        let mut machine = AlarmStateMachine::restore(definition, runtime);

        harness.clock.set(utc(4, 7, 30));
        assert_eq!(machine.recover(&harness.ctx()).await, Recovery::Missed);
        assert!(machine.definition().enabled);
        assert_eq!(machine.phase(), AlarmPhase::Armed);
        assert_eq!(machine.runtime().next_trigger, Some(utc(11, 7, 0)));
        assert_eq!(harness.outstanding(machine.id()), 1);
    }

    #[tokio::test]
    async fn armed_restore_within_grace_rings_late() {
        let harness = Harness::new(ScriptedBackend::new());
        let runtime = AlarmRuntimeState {
            phase: AlarmPhase::PreAlarm,
            next_trigger: Some(utc(2, 7, 0)),
            ..AlarmRuntimeState::default()
        };
        let mut definition = definition(DaySet::WEEKDAYS);
        definition.enabled = true;
        let mut machine = AlarmStateMachine::restore(definition, runtime);

        harness.clock.set(utc(2, 7, 3));
        assert_eq!(machine.recover(&harness.ctx()).await, Recovery::RecoveredLate);
        assert_eq!(machine.phase(), AlarmPhase::Ringing);
        assert_eq!(machine.runtime().trigger, Some(TriggerKind::MissedRecovery));
        assert_eq!(machine.runtime().last_trigger_time, Some(utc(2, 7, 0)));
        assert_future_trigger(&machine, utc(2, 7, 3));
    }

    #[tokio::test]
    async fn health_check_rebuilds_a_lost_timer() {
        let harness = Harness::new(ScriptedBackend::new());
        let mut machine = AlarmStateMachine::new(definition(DaySet::WEEKDAYS));
        machine.enable(&harness.ctx()).await.expect("enable");
        harness.timers.cancel_where(|_| true);

        let issues = machine.health_check(&harness.ctx());
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("without a pending timer"));
        assert_eq!(harness.outstanding(machine.id()), 1);
        assert!(machine.health_check(&harness.ctx()).is_empty());
    }
}
