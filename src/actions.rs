use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::alarm::model::ActionRef;
use crate::alarm::script::{ScriptBackend, ScriptContext};
use crate::error::ScriptError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActionCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CommandScriptBackend {
    actions: BTreeMap<ActionRef, ActionCommand>,
    dry_run: bool,
}

impl CommandScriptBackend {
    pub fn new(actions: BTreeMap<ActionRef, ActionCommand>) -> Self {
        Self {
            actions,
            dry_run: false,
        }
    }

    pub fn dry_run(actions: BTreeMap<ActionRef, ActionCommand>) -> Self {
        Self {
            actions,
            dry_run: true,
        }
    }
}

#[async_trait]
impl ScriptBackend for CommandScriptBackend {
    async fn invoke(&self, action: &ActionRef, context: &ScriptContext) -> Result<(), ScriptError> {
        let command = self
            .actions
            .get(action)
            .ok_or_else(|| ScriptError::MissingAction(action.clone()))?;
        if self.dry_run {
            info!(
                alarm_id = %context.alarm_id,
                %action,
                program = %command.program,
                phase = %context.phase,
                "dry run, action not started"
            );
            return Ok(());
        }
        let payload = serde_json::to_string(context)
            .map_err(|err| ScriptError::Failed(format!("unable to encode context: {err}")))?;

        debug!(%action, program = %command.program, phase = %context.phase, "running action");
        let output = Command::new(&command.program)
            .args(&command.args)
            .env("ALARM_CONTEXT", payload)
            .env("ALARM_ID", context.alarm_id.as_str())
            .env("ALARM_PHASE", context.phase.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                ScriptError::Failed(format!("unable to start '{}': {err}", command.program))
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.is_empty() {
            Err(ScriptError::Failed(format!(
                "'{}' exited with {}",
                command.program, output.status
            )))
        } else {
            Err(ScriptError::Failed(format!(
                "'{}' exited with {}: {stderr}",
                command.program, output.status
            )))
        }
    }

    fn exists(&self, action: &ActionRef) -> bool {
        self.actions.contains_key(action)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::alarm::model::ScriptPhase;
    use crate::alarm::script::testing::context;

    fn backend(name: &str, script: &str) -> CommandScriptBackend {
        let mut actions = BTreeMap::new();
        actions.insert(
            ActionRef::new(name),
            ActionCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
            },
        );
        CommandScriptBackend::new(actions)
    }

    #[tokio::test]
    async fn passes_context_through_environment() {
        let backend = backend(
            "script.check",
            r#"test "$ALARM_ID" = wake && test "$ALARM_PHASE" = alarm && echo "$ALARM_CONTEXT" | grep -q '"alarm_name":"Wake"'"#,
        );
        backend
            .invoke(&ActionRef::new("script.check"), &context(ScriptPhase::Alarm))
            .await
            .expect("action succeeds");
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let backend = backend("script.broken", "echo 'speaker offline' >&2; exit 3");
        let err = backend
            .invoke(&ActionRef::new("script.broken"), &context(ScriptPhase::Alarm))
            .await
            .expect_err("action fails");
        assert!(err.to_string().contains("speaker offline"));
    }

    #[tokio::test]
    async fn dry_run_never_starts_the_program() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("fired");
        let mut actions = BTreeMap::new();
        actions.insert(
            ActionRef::new("script.siren"),
            ActionCommand {
                program: "touch".to_string(),
                args: vec![marker.display().to_string()],
            },
        );
        let backend = CommandScriptBackend::dry_run(actions);

        assert!(backend.exists(&ActionRef::new("script.siren")));
        backend
            .invoke(&ActionRef::new("script.siren"), &context(ScriptPhase::Alarm))
            .await
            .expect("dry run succeeds");
        assert!(!marker.exists());
        assert!(
            backend
                .invoke(&ActionRef::new("script.none"), &context(ScriptPhase::Alarm))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn unknown_action_is_missing() {
        let backend = CommandScriptBackend::default();
        assert!(!backend.exists(&ActionRef::new("script.none")));
        let err = backend
            .invoke(&ActionRef::new("script.none"), &context(ScriptPhase::Alarm))
            .await
            .expect_err("missing");
        assert!(matches!(err, ScriptError::MissingAction(_)));
    }
}
