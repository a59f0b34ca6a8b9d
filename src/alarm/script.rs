use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::alarm::model::{ActionRef, AlarmId, DaySet, ScriptPhase, TimeOfDay, TriggerKind};
use crate::error::ScriptError;

#[derive(Debug, Clone, Serialize)]
pub struct ScriptContext {
    pub alarm_id: AlarmId,
    pub alarm_name: String,
    pub alarm_time: TimeOfDay,
    pub phase: ScriptPhase,
    pub trigger: Option<TriggerKind>,
    pub snooze_count: u32,
    pub is_one_time: bool,
    pub days: DaySet,
}

#[async_trait]
pub trait ScriptBackend: Send + Sync {
    async fn invoke(&self, action: &ActionRef, context: &ScriptContext) -> Result<(), ScriptError>;

    fn exists(&self, action: &ActionRef) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRequest {
    pub action: Option<ActionRef>,
    pub fallback: Option<ActionRef>,
    pub timeout: Duration,
    pub retry_count: u32,
}

impl ScriptRequest {
    pub fn none() -> Self {
        Self {
            action: None,
            fallback: None,
            timeout: Duration::ZERO,
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            ceiling: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1_u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub success: bool,
    pub attempts: u32,
    pub fallback: Option<bool>,
    pub error: Option<String>,
}

impl ScriptOutcome {
    fn skipped() -> Self {
        Self {
            success: true,
            attempts: 0,
            fallback: None,
            error: None,
        }
    }
}

pub struct ScriptRunner {
    backend: Arc<dyn ScriptBackend>,
    backoff: BackoffPolicy,
}

impl ScriptRunner {
    pub fn new(backend: Arc<dyn ScriptBackend>, backoff: BackoffPolicy) -> Self {
        Self { backend, backoff }
    }

    pub fn action_exists(&self, action: &ActionRef) -> bool {
        self.backend.exists(action)
    }

    /// Runs the request to completion. Never fails; the outcome says what happened.
    pub async fn run(&self, request: &ScriptRequest, context: &ScriptContext) -> ScriptOutcome {
        let Some(action) = request.action.as_ref() else {
            return ScriptOutcome::skipped();
        };

        let mut attempts = 0;
        let mut last_error = String::new();
        for retry in 0..=request.retry_count {
            attempts += 1;
            match self.attempt(action, request.timeout, context).await {
                Ok(()) => {
                    debug!(
                        alarm_id = %context.alarm_id,
                        phase = %context.phase,
                        %action,
                        attempts,
                        "script completed"
                    );
                    return ScriptOutcome {
                        success: true,
                        attempts,
                        fallback: None,
                        error: None,
                    };
                }
                Err(err) => {
                    warn!(
                        alarm_id = %context.alarm_id,
                        phase = %context.phase,
                        %action,
                        attempt = attempts,
                        "script attempt failed: {err}"
                    );
                    last_error = err.to_string();
                }
            }
            if retry < request.retry_count {
                tokio::time::sleep(self.backoff.delay_for(retry)).await;
            }
        }

        error!(
            alarm_id = %context.alarm_id,
            phase = %context.phase,
            %action,
            attempts,
            "script failed after all attempts: {last_error}"
        );

        let fallback = match request.fallback.as_ref() {
            Some(fallback) => {
                let result = self.attempt(fallback, request.timeout, context).await;
                if let Err(err) = &result {
                    error!(
                        alarm_id = %context.alarm_id,
                        phase = %context.phase,
                        %fallback,
                        "fallback script failed: {err}"
                    );
                }
                Some(result.is_ok())
            }
            None => None,
        };

        ScriptOutcome {
            success: fallback.unwrap_or(false),
            attempts,
            fallback,
            error: Some(last_error),
        }
    }

    async fn attempt(
        &self,
        action: &ActionRef,
        timeout: Duration,
        context: &ScriptContext,
    ) -> Result<(), ScriptError> {
        if !self.backend.exists(action) {
            return Err(ScriptError::MissingAction(action.clone()));
        }
        match tokio::time::timeout(timeout, self.backend.invoke(action, context)).await {
            Ok(result) => result,
            Err(_) => Err(ScriptError::Timeout(timeout)),
        }
    }
}
