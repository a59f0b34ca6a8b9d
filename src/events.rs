use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::alarm::model::{ActionRef, AlarmId, DaySet, ScriptPhase, TimeOfDay, TriggerKind};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlarmEvent {
    Created {
        alarm_id: AlarmId,
    },
    Deleted {
        alarm_id: AlarmId,
    },
    Armed {
        alarm_id: AlarmId,
        next_trigger: Option<DateTime<Utc>>,
    },
    Disarmed {
        alarm_id: AlarmId,
    },
    PreAlarm {
        alarm_id: AlarmId,
        next_trigger: DateTime<Utc>,
    },
    Triggered {
        alarm_id: AlarmId,
        trigger: TriggerKind,
        snooze_count: u32,
    },
    Snoozed {
        alarm_id: AlarmId,
        snooze_count: u32,
        until: DateTime<Utc>,
    },
    SnoozeLimitReached {
        alarm_id: AlarmId,
        max_snooze_count: u32,
    },
    Dismissed {
        alarm_id: AlarmId,
    },
    AutoDismissed {
        alarm_id: AlarmId,
    },
    Missed {
        alarm_id: AlarmId,
        due: DateTime<Utc>,
        next_trigger: Option<DateTime<Utc>>,
    },
    Skipped {
        alarm_id: AlarmId,
        next_trigger: Option<DateTime<Utc>>,
    },
    SkipCancelled {
        alarm_id: AlarmId,
        next_trigger: Option<DateTime<Utc>>,
    },
    TimeChanged {
        alarm_id: AlarmId,
        old_time: TimeOfDay,
        new_time: TimeOfDay,
    },
    DaysChanged {
        alarm_id: AlarmId,
        days: DaySet,
    },
    ScriptsChanged {
        alarm_id: AlarmId,
        use_device_defaults: bool,
    },
    ScriptFailed {
        alarm_id: AlarmId,
        phase: ScriptPhase,
        action: Option<ActionRef>,
        attempts: u32,
        fallback_succeeded: Option<bool>,
        error: String,
    },
    AutoDisabled {
        alarm_id: AlarmId,
        reason: String,
    },
    HealthWarning {
        issues: Vec<String>,
    },
}

impl AlarmEvent {
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            AlarmEvent::SnoozeLimitReached { .. }
                | AlarmEvent::Missed { .. }
                | AlarmEvent::ScriptFailed { .. }
                | AlarmEvent::AutoDisabled { .. }
                | AlarmEvent::HealthWarning { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AlarmEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlarmEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: AlarmEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

pub async fn log_events(mut receiver: broadcast::Receiver<AlarmEvent>) {
    loop {
        match receiver.recv().await {
            Ok(event) => {
                let payload = serde_json::to_string(&event)
                    .unwrap_or_else(|err| format!("unencodable event: {err}"));
                if event.is_warning() {
                    warn!(event = %payload, "alarm event");
                } else {
                    info!(event = %payload, "alarm event");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
pub fn drain(receiver: &mut broadcast::Receiver<AlarmEvent>) -> Vec<AlarmEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}
