//! Per-stage execution plan
//!
//! Actions are recorded per stage and per server id and executed later,
//! in registration order, over a [`RemoteShell`]. The plan belongs to one
//! run; nothing here is process-global.

use crate::{Error, Result, manifest::{ActionKind, FileSpec, Stage}, mixin::ServerContext};
use indexmap::IndexMap;
use remote_shell::RemoteShell;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// Completion callback: given the installed remote path, the commands to run next
pub type CompletionFn = Box<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// One recorded action
pub struct ScheduledAction {
    /// Mixin that scheduled it
    pub mixin: String,
    /// Template it was rendered from
    pub template: String,
    /// Install or run
    pub kind: ActionKind,
    /// Placement details
    pub spec: FileSpec,
    /// Rendered file on this machine
    pub local: PathBuf,
    /// Re-upload even if already installed on the server
    pub overwrite: bool,
    on_complete: Option<CompletionFn>,
}

impl ScheduledAction {
    /// Create an action for a rendered file
    pub fn new(
        mixin: impl Into<String>,
        template: impl Into<String>,
        kind: ActionKind,
        spec: FileSpec,
        local: PathBuf,
    ) -> Self {
        Self {
            mixin: mixin.into(),
            template: template.into(),
            kind,
            spec,
            local,
            overwrite: false,
            on_complete: None,
        }
    }
}

impl fmt::Debug for ScheduledAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledAction")
            .field("mixin", &self.mixin)
            .field("template", &self.template)
            .field("kind", &self.kind)
            .field("local", &self.local)
            .field("overwrite", &self.overwrite)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

type StageQueue = IndexMap<String, Vec<ScheduledAction>>;

/// Actions per stage and server
#[derive(Debug, Default)]
pub struct ExecutionPlan {
    stages: Mutex<HashMap<Stage, StageQueue>>,
    // (server id, local file) -> remote path
    installed: Mutex<HashMap<(String, PathBuf), String>>,
}

/// Refers to a just-scheduled action
pub struct ActionHandle<'a> {
    plan: &'a ExecutionPlan,
    stage: Stage,
    target: String,
    index: usize,
}

impl ActionHandle<'_> {
    /// Commands to run after the action completes
    pub fn on_complete<F>(self, callback: F) -> Self
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        self.plan
            .with_action(self.stage, &self.target, self.index, |a| {
                a.on_complete = Some(Box::new(callback));
            });
        self
    }

    /// Upload again even when the server already has the file
    pub fn overwrite(self) -> Self {
        self.plan
            .with_action(self.stage, &self.target, self.index, |a| a.overwrite = true);
        self
    }

    /// Stage the action was scheduled into
    pub fn stage(&self) -> Stage {
        self.stage
    }
}

impl ExecutionPlan {
    /// An empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an action for `target_id` in the stage its spec names
    pub fn schedule(&self, target_id: &str, action: ScheduledAction) -> ActionHandle<'_> {
        let stage = action.spec.run_at;
        info!(
            "ACTION ({})::{} --> {} [{}]",
            action.mixin, action.kind, action.template, stage
        );
        let mut stages = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = stages
            .entry(stage)
            .or_default()
            .entry(target_id.to_string())
            .or_default();
        queue.push(action);
        ActionHandle {
            plan: self,
            stage,
            target: target_id.to_string(),
            index: queue.len() - 1,
        }
    }

    fn with_action(&self, stage: Stage, target: &str, index: usize, f: impl FnOnce(&mut ScheduledAction)) {
        let mut stages = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(action) = stages
            .get_mut(&stage)
            .and_then(|q| q.get_mut(target))
            .and_then(|actions| actions.get_mut(index))
        {
            f(action);
        }
    }

    /// Number of pending actions for a server in a stage
    pub fn pending(&self, stage: Stage, target_id: &str) -> usize {
        self.stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&stage)
            .and_then(|q| q.get(target_id))
            .map_or(0, Vec::len)
    }

    /// Templates pending for a server in a stage, in order
    pub fn pending_templates(&self, stage: Stage, target_id: &str) -> Vec<String> {
        self.stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&stage)
            .and_then(|q| q.get(target_id))
            .map(|actions| actions.iter().map(|a| a.template.clone()).collect())
            .unwrap_or_default()
    }

    /// Remote path of a file already installed on a server
    pub fn installed_path(&self, target_id: &str, local: &Path) -> Option<String> {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(target_id.to_string(), local.to_path_buf()))
            .cloned()
    }

    /// Run every action recorded for `stage` and `target`, in order
    ///
    /// Actions are consumed. Returns how many ran.
    pub async fn execute(
        &self,
        stage: Stage,
        shell: &dyn RemoteShell,
        target: &ServerContext,
    ) -> Result<usize> {
        let actions = {
            let mut stages = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
            stages
                .get_mut(&stage)
                .and_then(|q| q.shift_remove(&target.id))
                .unwrap_or_default()
        };
        let count = actions.len();
        for action in actions {
            let path = match action.kind {
                ActionKind::Install => self.install(&action, shell, target).await?,
                ActionKind::Run => self.run(&action, shell, target).await?,
            };
            if let Some(callback) = &action.on_complete {
                for command in callback(&path) {
                    self.command(shell, target, &command, action.spec.tolerate_failure)
                        .await?;
                }
            }
        }
        Ok(count)
    }

    async fn install(
        &self,
        action: &ScheduledAction,
        shell: &dyn RemoteShell,
        target: &ServerContext,
    ) -> Result<String> {
        if !action.overwrite {
            if let Some(path) = self.installed_path(&target.id, &action.local) {
                return Ok(path);
            }
        }

        let remote = target.remote();
        let uploaded = shell.upload(&action.local, &remote, &shell.home_dir()).await?;
        let path = match &action.spec.dir {
            Some(dir) => {
                let spec = &action.spec;
                let install_cmd = format!(
                    "sudo install -g {} -m {} -o {} -t {} {}",
                    spec.group, spec.mode, spec.owner, dir, uploaded
                );
                info!("INSTALL [{}] on {}", install_cmd, target.fqdn);
                self.command(shell, target, &install_cmd, false).await?;
                let file = uploaded.rsplit('/').next().unwrap_or(&uploaded);
                format!("{}/{}", dir.trim_end_matches('/'), file)
            }
            None => uploaded,
        };

        info!("INSTALLED {} to {} on {}", action.template, path, target.fqdn);
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((target.id.clone(), action.local.clone()), path.clone());
        Ok(path)
    }

    async fn run(
        &self,
        action: &ScheduledAction,
        shell: &dyn RemoteShell,
        target: &ServerContext,
    ) -> Result<String> {
        let path = self.install(action, shell, target).await?;
        let command = format!("sudo -u{} \"{}\"", action.spec.run_as, path);
        self.command(shell, target, &command, action.spec.tolerate_failure)
            .await?;
        Ok(path)
    }

    async fn command(
        &self,
        shell: &dyn RemoteShell,
        target: &ServerContext,
        command: &str,
        tolerate_failure: bool,
    ) -> Result<()> {
        let code = shell.run(&target.remote(), command).await?;
        if code == 0 {
            return Ok(());
        }
        if tolerate_failure {
            warn!(
                "Exit status {} for command [{}] on {} (tolerated)",
                code, command, target.fqdn
            );
            return Ok(());
        }
        Err(Error::CommandFailed {
            target: target.fqdn.clone(),
            command: command.to_string(),
            code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_shell::{RecordingShell, ShellEvent};

    fn server() -> ServerContext {
        ServerContext::new("i-1", "ms101", "ms101.dev.ame1.example.com", "10.0.0.5")
    }

    fn action(template: &str, kind: ActionKind, spec: FileSpec) -> ScheduledAction {
        ScheduledAction::new("test", template, kind, spec, PathBuf::from(format!("/tmp/r/{}", template)))
    }

    #[smol_potat::test]
    async fn test_actions_run_in_registration_order() {
        let plan = ExecutionPlan::new();
        let shell = RecordingShell::new("ubuntu");
        plan.schedule("i-1", action("a", ActionKind::Run, FileSpec::default()));
        plan.schedule("i-1", action("b", ActionKind::Run, FileSpec::default()));
        assert_eq!(plan.pending(Stage::BeforeBootstrap, "i-1"), 2);

        let ran = plan.execute(Stage::BeforeBootstrap, &shell, &server()).await.unwrap();
        assert_eq!(ran, 2);
        assert_eq!(
            shell.commands_for("i-1"),
            vec!["sudo -uroot \"/home/ubuntu/a\"", "sudo -uroot \"/home/ubuntu/b\""]
        );
        // Consumed
        assert_eq!(plan.pending(Stage::BeforeBootstrap, "i-1"), 0);
    }

    #[smol_potat::test]
    async fn test_install_into_dir_with_callback() {
        let plan = ExecutionPlan::new();
        let shell = RecordingShell::new("ubuntu");
        let spec = FileSpec {
            dir: Some("/etc/init.d".into()),
            ..FileSpec::default()
        };
        plan.schedule("i-1", action("init", ActionKind::Install, spec))
            .on_complete(|path| vec![format!("sudo service {} start", path)]);

        plan.execute(Stage::BeforeBootstrap, &shell, &server()).await.unwrap();
        assert_eq!(
            shell.commands_for("i-1"),
            vec![
                "sudo install -g root -m 755 -o root -t /etc/init.d /home/ubuntu/init",
                "sudo service /etc/init.d/init start",
            ]
        );
        assert_eq!(
            plan.installed_path("i-1", Path::new("/tmp/r/init")).as_deref(),
            Some("/etc/init.d/init")
        );
    }

    #[smol_potat::test]
    async fn test_install_is_idempotent_per_server() {
        let plan = ExecutionPlan::new();
        let shell = RecordingShell::new("ubuntu");
        plan.schedule("i-1", action("lib", ActionKind::Install, FileSpec::default()));
        plan.schedule("i-1", action("lib", ActionKind::Run, FileSpec::default()));
        plan.execute(Stage::BeforeBootstrap, &shell, &server()).await.unwrap();

        let uploads = shell
            .events()
            .into_iter()
            .filter(|e| matches!(e, ShellEvent::Upload { .. }))
            .count();
        assert_eq!(uploads, 1);
    }

    #[smol_potat::test]
    async fn test_non_zero_exit_fails_unless_tolerated() {
        let plan = ExecutionPlan::new();
        let shell = RecordingShell::new("ubuntu");
        shell.fail_matching("flaky", 1);

        let tolerant = FileSpec {
            tolerate_failure: true,
            ..FileSpec::default()
        };
        plan.schedule("i-1", action("flaky", ActionKind::Run, tolerant));
        assert!(plan.execute(Stage::BeforeBootstrap, &shell, &server()).await.is_ok());

        plan.schedule("i-1", action("flaky", ActionKind::Run, FileSpec::default()));
        let err = plan
            .execute(Stage::BeforeBootstrap, &shell, &server())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { code: 1, .. }));
    }

    #[smol_potat::test]
    async fn test_stages_are_separate() {
        let plan = ExecutionPlan::new();
        let shell = RecordingShell::new("ubuntu");
        let after = FileSpec {
            run_at: Stage::AfterBootstrap,
            ..FileSpec::default()
        };
        let handle = plan.schedule("i-1", action("late", ActionKind::Run, after));
        assert_eq!(handle.stage(), Stage::AfterBootstrap);

        assert_eq!(plan.execute(Stage::BeforeBootstrap, &shell, &server()).await.unwrap(), 0);
        assert_eq!(plan.pending_templates(Stage::AfterBootstrap, "i-1"), vec!["late"]);
    }
}
