use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{task_wrapper_script, Agent, DEV_DIR, PREBUILD_SCRIPTS_DIR, PROJECT_DIR};
use crate::db::{Db, TaskStatus, VmTask};
use crate::error::{join_errors, AgentError};
use crate::ssh::{shell_quote, ExecOpts, SshConfig, SshSession};
use crate::vm::{ExtraDrive, VmSpec};

const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuildArgs {
    pub prebuild_event_id: i64,
    pub root_fs_path: PathBuf,
    /// Drive with the checked-out repository, mounted at the dev dir.
    pub project_drive_path: PathBuf,
    pub instance_id: Option<String>,
}

/// Per-task outcome, aligned with the input task order. Task failures are
/// data here, not activity failures; the workflow engine decides what a
/// failed task means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Success,
    Error { error: String },
    Cancelled,
}

impl Agent {
    /// Runs all tasks of a prebuild event concurrently inside one VM with
    /// live log streaming. The first task failure cancels every sibling
    /// that has not finished yet; tasks that already succeeded keep their
    /// status.
    #[tracing::instrument(skip(self, args), fields(prebuild_event_id = args.prebuild_event_id))]
    pub async fn prebuild(&self, args: PrebuildArgs) -> Result<Vec<TaskOutcome>> {
        let event = self
            .db
            .prebuild_event_with_tasks(args.prebuild_event_id)
            .await?;
        tracing::info!(task_count = event.tasks.len(), "running prebuild tasks");

        let spec = VmSpec {
            instance_id: args
                .instance_id
                .clone()
                .unwrap_or_else(|| Self::generate_instance_id("prebuild")),
            root_fs_path: args.root_fs_path.clone(),
            extra_drives: vec![ExtraDrive {
                path: args.project_drive_path.clone(),
                mount_path: Some(DEV_DIR.to_owned()),
                read_only: false,
            }],
            should_poweroff: true,
            ssh_user: self.config.ssh_user.clone(),
            ssh_auth: self.config.workspace_auth(),
        };

        let db = self.db.clone();
        let ssh_user = self.config.ssh_user.clone();
        let tasks = event.tasks;
        self.vm
            .with_vm(spec, move |ssh, handle| async move {
                upload_task_scripts(
                    &ssh,
                    PREBUILD_SCRIPTS_DIR,
                    tasks.iter().map(|task| (task.idx, task.command.as_str())),
                )
                .await?;

                let factory = SshTaskChannelFactory {
                    ssh: SshConfig {
                        host: handle.network.vm_ip,
                        port: 22,
                        user: ssh_user,
                        auth: ssh.config().auth.clone(),
                    },
                    scripts_dir: PREBUILD_SCRIPTS_DIR.to_owned(),
                    cwd: PROJECT_DIR.to_owned(),
                };
                Ok(supervise_tasks(&db, &factory, &tasks).await)
            })
            .await
    }
}

/// Uploads one wrapper script per task into the guest.
pub(crate) async fn upload_task_scripts<'a>(
    ssh: &SshSession,
    dir: &str,
    commands: impl IntoIterator<Item = (i32, &'a str)>,
) -> Result<()> {
    ssh.exec(&["mkdir", "-p", dir], ExecOpts::default())
        .await
        .context("could not create the task script directory")?;
    for (idx, command) in commands {
        let script = task_wrapper_script(command);
        ssh.write_file(&format!("{dir}/task-{idx}.sh"), script.as_bytes())
            .await
            .with_context(|| format!("could not upload the script for task {idx}"))?;
    }
    Ok(())
}

/// Producer/consumer byte buffer between an exec and its log flusher.
/// The exec callbacks append, the flusher swaps the content out.
#[derive(Default)]
pub(crate) struct LogBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl LogBuffer {
    pub fn push(&self, chunk: &[u8]) {
        self.bytes
            .lock()
            .expect("log buffer poisoned")
            .extend_from_slice(chunk);
    }

    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.bytes.lock().expect("log buffer poisoned"))
    }
}

/// One task's command channel into the guest. `dispose` interrupts an
/// in-flight `run` from another concurrent flow; that is the whole
/// cancellation mechanism.
pub(crate) trait TaskChannel: Send + Sync {
    async fn run(&self, buffer: &LogBuffer) -> Result<()>;
    fn dispose(&self);
}

pub(crate) trait TaskChannelFactory {
    type Channel: TaskChannel;
    async fn open(&self, task_idx: i32) -> Result<Self::Channel>;
}

/// Opens a dedicated ssh session per task and runs its wrapper script
/// piped through `tee` so the log also lands next to the script.
pub(crate) struct SshTaskChannelFactory {
    pub ssh: SshConfig,
    pub scripts_dir: String,
    pub cwd: String,
}

impl TaskChannelFactory for SshTaskChannelFactory {
    type Channel = SshTaskChannel;

    async fn open(&self, task_idx: i32) -> Result<SshTaskChannel> {
        Ok(SshTaskChannel {
            session: SshSession::new(self.ssh.clone()),
            script_path: format!("{}/task-{task_idx}.sh", self.scripts_dir),
            log_path: format!("{}/task-{task_idx}.log", self.scripts_dir),
            cwd: self.cwd.clone(),
        })
    }
}

pub(crate) struct SshTaskChannel {
    session: SshSession,
    script_path: String,
    log_path: String,
    cwd: String,
}

impl TaskChannel for SshTaskChannel {
    async fn run(&self, buffer: &LogBuffer) -> Result<()> {
        let pipeline = format!(
            "bash {} 2>&1 | tee {}",
            shell_quote(&self.script_path),
            shell_quote(&self.log_path)
        );
        let opts = ExecOpts {
            cwd: Some(self.cwd.clone()),
            on_stdout: Some(Box::new(|chunk: &[u8]| buffer.push(chunk))),
            on_stderr: Some(Box::new(|chunk: &[u8]| buffer.push(chunk))),
            ..Default::default()
        };
        self.session
            .exec(&["bash", "-c", &pipeline], opts)
            .await
            .map(|_| ())
    }

    fn dispose(&self) {
        self.session.dispose();
    }
}

/// Shared cancellation state of one supervisor run. `begin_cleanup` is
/// set-once: exactly one failing task becomes the root cause, and only
/// that call disposes the registered channels.
struct CancelGroup<C: TaskChannel> {
    cleanup_started: AtomicBool,
    channels: Mutex<Vec<Arc<C>>>,
}

impl<C: TaskChannel> CancelGroup<C> {
    fn new() -> Self {
        Self {
            cleanup_started: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, channel: Arc<C>) {
        self.channels
            .lock()
            .expect("cancel group poisoned")
            .push(channel);
    }

    fn cleanup_started(&self) -> bool {
        self.cleanup_started.load(Ordering::SeqCst)
    }

    /// Returns true for exactly one caller per run.
    fn begin_cleanup(&self) -> bool {
        let won = self
            .cleanup_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            for channel in self.channels.lock().expect("cancel group poisoned").iter() {
                channel.dispose();
            }
        }
        won
    }
}

/// Assigns gap-free chunk indices for one log group. Single writer by
/// construction: exactly one flusher exists per task run.
struct LogFlusher<'a> {
    db: &'a Db,
    log_group_id: i64,
    next_idx: i64,
}

impl LogFlusher<'_> {
    async fn flush(&mut self, buffer: &LogBuffer) -> Result<()> {
        let pending = buffer.take();
        if pending.is_empty() {
            return Ok(());
        }
        self.db
            .append_log_chunk(self.log_group_id, self.next_idx, &pending)
            .await?;
        self.next_idx += 1;
        Ok(())
    }
}

/// Runs every task concurrently and returns their outcomes in input
/// order. Task errors never escape; they become outcomes.
pub(crate) async fn supervise_tasks<F>(db: &Db, factory: &F, tasks: &[VmTask]) -> Vec<TaskOutcome>
where
    F: TaskChannelFactory,
{
    let group = CancelGroup::new();
    let runs = tasks.iter().map(|task| run_task(db, factory, &group, task));
    futures::future::join_all(runs).await
}

async fn run_task<F: TaskChannelFactory>(
    db: &Db,
    factory: &F,
    group: &CancelGroup<F::Channel>,
    task: &VmTask,
) -> TaskOutcome {
    match drive_task(db, factory, group, task).await {
        Ok(()) => TaskOutcome::Success,
        Err(err) => {
            //the first failure wins the root-cause slot and cancels the rest
            let root_cause = group.begin_cleanup();
            let status = if root_cause {
                TaskStatus::Error
            } else {
                TaskStatus::Cancelled
            };
            //a failed status write must never mask the original error
            let err = match db.update_task_status(task.id, status).await {
                Ok(()) => err,
                Err(status_err) => join_errors(err, status_err),
            };
            if root_cause {
                tracing::warn!(
                    task_id = task.id,
                    error = %format!("{err:#}"),
                    "task failed, cancelling its siblings"
                );
                TaskOutcome::Error {
                    error: format!("{err:#}"),
                }
            } else {
                tracing::info!(task_id = task.id, "task cancelled");
                TaskOutcome::Cancelled
            }
        }
    }
}

async fn drive_task<F: TaskChannelFactory>(
    db: &Db,
    factory: &F,
    group: &CancelGroup<F::Channel>,
    task: &VmTask,
) -> Result<()> {
    if group.cleanup_started() {
        return Err(AgentError::SshDisposed.into());
    }
    db.update_task_status(task.id, TaskStatus::Running)
        .await
        .context("could not mark task running")?;

    let channel = Arc::new(factory.open(task.idx).await?);
    group.register(channel.clone());
    if group.cleanup_started() {
        //cleanup raced with the open, this channel missed the group dispose
        channel.dispose();
    }

    let buffer = LogBuffer::default();
    let mut flusher = LogFlusher {
        db,
        log_group_id: task.log_group_id,
        next_idx: 0,
    };

    let run = channel.run(&buffer);
    tokio::pin!(run);
    let mut ticker = tokio::time::interval(LOG_FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let run_result = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = ticker.tick() => {
                if group.cleanup_started() {
                    //make sure our exec observes the cancellation
                    channel.dispose();
                }
                if let Err(flush_err) = flusher.flush(&buffer).await {
                    //a dead flusher takes its exec down with it
                    channel.dispose();
                    return Err(flush_err);
                }
            }
        }
    };
    //drain whatever arrived after the last tick
    flusher.flush(&buffer).await?;
    run_result?;

    db.update_task_status(task.id, TaskStatus::Success)
        .await
        .context("could not persist task success")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    enum MockBehaviour {
        /// Emit chunks after the given delays, then finish cleanly.
        Emit(Vec<(Duration, Vec<u8>)>),
        /// Fail with exit code 1 after the delay.
        Fail(Duration),
        /// Run until disposed.
        Hang,
    }

    struct MockChannel {
        behaviour: MockBehaviour,
        disposed: AtomicBool,
    }

    impl MockChannel {
        async fn wait(&self, duration: Duration) -> Result<()> {
            let deadline = tokio::time::Instant::now() + duration;
            loop {
                if self.disposed.load(Ordering::SeqCst) {
                    return Err(AgentError::SshDisposed.into());
                }
                if tokio::time::Instant::now() >= deadline {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    impl TaskChannel for MockChannel {
        async fn run(&self, buffer: &LogBuffer) -> Result<()> {
            match &self.behaviour {
                MockBehaviour::Emit(chunks) => {
                    for (delay, bytes) in chunks {
                        self.wait(*delay).await?;
                        buffer.push(bytes);
                    }
                    if self.disposed.load(Ordering::SeqCst) {
                        return Err(AgentError::SshDisposed.into());
                    }
                    Ok(())
                }
                MockBehaviour::Fail(after) => {
                    self.wait(*after).await?;
                    Err(AgentError::SshExecFailed {
                        code: Some(1),
                        stderr: "boom".to_owned(),
                    }
                    .into())
                }
                MockBehaviour::Hang => loop {
                    self.wait(Duration::from_millis(10)).await?;
                },
            }
        }

        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    struct MockFactory {
        behaviours: Mutex<HashMap<i32, MockBehaviour>>,
    }

    impl MockFactory {
        fn new(plan: Vec<(i32, MockBehaviour)>) -> Self {
            Self {
                behaviours: Mutex::new(plan.into_iter().collect()),
            }
        }
    }

    impl TaskChannelFactory for MockFactory {
        type Channel = MockChannel;

        async fn open(&self, task_idx: i32) -> Result<MockChannel> {
            let behaviour = self
                .behaviours
                .lock()
                .unwrap()
                .remove(&task_idx)
                .expect("no behaviour planned for this task");
            Ok(MockChannel {
                behaviour,
                disposed: AtomicBool::new(false),
            })
        }
    }

    async fn memory_db() -> Db {
        Db::connect("sqlite::memory:").await.unwrap()
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[tokio::test]
    async fn all_tasks_succeed_and_their_logs_land_in_their_groups() {
        let db = memory_db().await;
        let event = db.create_prebuild_event(&["echo A", "echo B"]).await.unwrap();
        let factory = MockFactory::new(vec![
            (0, MockBehaviour::Emit(vec![(ms(10), b"A\n".to_vec())])),
            (1, MockBehaviour::Emit(vec![(ms(10), b"B\n".to_vec())])),
        ]);

        let outcomes = supervise_tasks(&db, &factory, &event.tasks).await;
        assert_eq!(outcomes, vec![TaskOutcome::Success, TaskOutcome::Success]);

        let reloaded = db.prebuild_event_with_tasks(event.id).await.unwrap();
        assert!(reloaded
            .tasks
            .iter()
            .all(|task| task.status == TaskStatus::Success));

        let group_a = db.log_chunks(event.tasks[0].log_group_id).await.unwrap();
        let joined_a: Vec<u8> = group_a.iter().flat_map(|(_, c)| c.clone()).collect();
        assert_eq!(joined_a, b"A\n");
        let group_b = db.log_chunks(event.tasks[1].log_group_id).await.unwrap();
        let joined_b: Vec<u8> = group_b.iter().flat_map(|(_, c)| c.clone()).collect();
        assert_eq!(joined_b, b"B\n");
    }

    #[tokio::test]
    async fn first_failure_cancels_every_unfinished_sibling() {
        let db = memory_db().await;
        let event = db
            .create_prebuild_event(&["sleep 10; echo A", "exit 1"])
            .await
            .unwrap();
        let factory = MockFactory::new(vec![
            (0, MockBehaviour::Hang),
            (1, MockBehaviour::Fail(ms(20))),
        ]);

        let outcomes = supervise_tasks(&db, &factory, &event.tasks).await;
        assert_eq!(outcomes[0], TaskOutcome::Cancelled);
        match &outcomes[1] {
            TaskOutcome::Error { error } => assert!(error.contains("exited with code Some(1)")),
            other => panic!("expected the failing task to be the root cause, got {other:?}"),
        }

        let reloaded = db.prebuild_event_with_tasks(event.id).await.unwrap();
        assert_eq!(reloaded.tasks[0].status, TaskStatus::Cancelled);
        assert_eq!(reloaded.tasks[1].status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn exactly_one_root_cause_among_many_hanging_tasks() {
        let db = memory_db().await;
        let event = db
            .create_prebuild_event(&["a", "b", "c", "d"])
            .await
            .unwrap();
        let factory = MockFactory::new(vec![
            (0, MockBehaviour::Hang),
            (1, MockBehaviour::Hang),
            (2, MockBehaviour::Fail(ms(15))),
            (3, MockBehaviour::Hang),
        ]);

        let outcomes = supervise_tasks(&db, &factory, &event.tasks).await;
        let errors = outcomes
            .iter()
            .filter(|o| matches!(o, TaskOutcome::Error { .. }))
            .count();
        let cancelled = outcomes
            .iter()
            .filter(|o| matches!(o, TaskOutcome::Cancelled))
            .count();
        assert_eq!(errors, 1);
        assert_eq!(cancelled, 3);

        let reloaded = db.prebuild_event_with_tasks(event.id).await.unwrap();
        let terminal_errors = reloaded
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Error)
            .count();
        assert_eq!(terminal_errors, 1);
        assert!(reloaded
            .tasks
            .iter()
            .all(|t| t.status != TaskStatus::Running && t.status != TaskStatus::Pending));
    }

    #[tokio::test]
    async fn early_success_is_not_rolled_back_by_a_later_failure() {
        let db = memory_db().await;
        let event = db.create_prebuild_event(&["quick", "doomed"]).await.unwrap();
        let factory = MockFactory::new(vec![
            (0, MockBehaviour::Emit(vec![(ms(5), b"done\n".to_vec())])),
            (1, MockBehaviour::Fail(Duration::from_secs(3))),
        ]);

        let outcomes = supervise_tasks(&db, &factory, &event.tasks).await;
        assert_eq!(outcomes[0], TaskOutcome::Success);
        assert!(matches!(outcomes[1], TaskOutcome::Error { .. }));

        let reloaded = db.prebuild_event_with_tasks(event.id).await.unwrap();
        assert_eq!(reloaded.tasks[0].status, TaskStatus::Success);
        assert_eq!(reloaded.tasks[1].status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn log_indices_are_contiguous_across_many_flushes() {
        let db = memory_db().await;
        let event = db.create_prebuild_event(&["chatty"]).await.unwrap();
        let factory = MockFactory::new(vec![(
            0,
            MockBehaviour::Emit(vec![
                (ms(400), b"one ".to_vec()),
                (ms(800), b"two ".to_vec()),
                (ms(1200), b"three".to_vec()),
            ]),
        )]);

        let outcomes = supervise_tasks(&db, &factory, &event.tasks).await;
        assert_eq!(outcomes, vec![TaskOutcome::Success]);

        let chunks = db.log_chunks(event.tasks[0].log_group_id).await.unwrap();
        assert!(!chunks.is_empty());
        for (expected_idx, (idx, _)) in chunks.iter().enumerate() {
            assert_eq!(*idx, expected_idx as i64);
        }
        let joined: Vec<u8> = chunks.iter().flat_map(|(_, c)| c.clone()).collect();
        assert_eq!(joined, b"one two three");
    }

    #[tokio::test]
    async fn status_write_failure_is_reported_with_the_original_error() {
        let db = memory_db().await;
        //this task does not exist in the database, so every status write fails
        let ghost = VmTask {
            id: 999,
            idx: 0,
            command: "exit 1".to_owned(),
            status: TaskStatus::Pending,
            log_group_id: 1,
        };
        let factory = MockFactory::new(vec![(0, MockBehaviour::Fail(ms(5)))]);

        let outcomes = supervise_tasks(&db, &factory, std::slice::from_ref(&ghost)).await;
        match &outcomes[0] {
            TaskOutcome::Error { error } => {
                assert!(error.contains("errors occurred together"));
                assert!(error.contains("999"));
            }
            other => panic!("expected a composite error outcome, got {other:?}"),
        }
    }
}
