use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use hostmon_common::types::{AgentResult, Request};
use hostmon_plugin::ResultWriter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Dispatch, Manager};
use crate::error::SchedulerError;
use crate::regexp::Expression;
use crate::task::TaskId;

/// Sleep when nothing is queued; any command wakes the loop earlier.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

const TIMEOUT_REASON: &str = "Timeout while executing check.";

enum Command {
    Update {
        client_id: u64,
        output: Arc<dyn ResultWriter>,
        requests: Vec<Request>,
    },
    Unregister(u64),
    Direct {
        key: String,
        output: Arc<dyn ResultWriter>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Query {
        command: String,
        reply: oneshot::Sender<Result<String, SchedulerError>>,
    },
    Regexps {
        expressions: Vec<Expression>,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    Finished(TaskId),
    Stop,
}

/// Cloneable front end of a running [`Manager`].
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ManagerHandle {
    fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.tx.send(command).map_err(|_| SchedulerError::Stopped)
    }

    /// Submits a full request batch for `client_id`.
    pub fn update(
        &self,
        client_id: u64,
        output: Arc<dyn ResultWriter>,
        requests: Vec<Request>,
    ) -> Result<(), SchedulerError> {
        self.send(Command::Update {
            client_id,
            output,
            requests,
        })
    }

    pub fn unregister(&self, client_id: u64) -> Result<(), SchedulerError> {
        self.send(Command::Unregister(client_id))
    }

    pub async fn query(&self, command: &str) -> Result<String, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Query {
            command: command.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| SchedulerError::Stopped)?
    }

    pub async fn update_regexps(&self, expressions: Vec<Expression>) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Regexps { expressions, reply })?;
        rx.await.map_err(|_| SchedulerError::Stopped)?
    }

    /// Runs one check of `key` as a single check and waits up to `timeout`
    /// for its result. Failures come back as "not supported" results.
    pub async fn perform_check(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<AgentResult, SchedulerError> {
        let (result_tx, result_rx) = oneshot::channel();
        let output = Arc::new(SingleResult::new(result_tx));
        let (reply, accepted) = oneshot::channel();
        self.send(Command::Direct {
            key: key.to_string(),
            output,
            reply,
        })?;

        if let Err(reason) = accepted.await.map_err(|_| SchedulerError::Stopped)? {
            return Ok(AgentResult::not_supported(0, reason));
        }
        Ok(match time::timeout(timeout, result_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => AgentResult::not_supported(0, "No value was returned."),
            Err(_) => AgentResult::not_supported(0, "Timeout while waiting for check result."),
        })
    }

    /// Asks the loop to exit. Active runners are stopped before the join
    /// handle completes.
    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }
}

/// Result writer of one direct check: forwards the first result.
struct SingleResult {
    tx: Mutex<Option<oneshot::Sender<AgentResult>>>,
}

impl SingleResult {
    fn new(tx: oneshot::Sender<AgentResult>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn sender(&self) -> Option<oneshot::Sender<AgentResult>> {
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

impl ResultWriter for SingleResult {
    fn write(&self, result: AgentResult) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(result);
        }
    }

    fn flush(&self) {}

    fn slots_available(&self) -> usize {
        usize::from(self.tx.lock().map(|tx| tx.is_some()).unwrap_or(false))
    }

    fn persist_slots_available(&self) -> usize {
        self.slots_available()
    }
}

impl Manager {
    /// Moves the manager into a tokio task and returns the handle used to
    /// talk to it.
    pub fn start(self) -> (ManagerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ManagerHandle { tx: tx.clone() };
        let join = tokio::spawn(self.run(rx, tx));
        (handle, join)
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        tx: mpsc::UnboundedSender<Command>,
    ) {
        info!(plugins = self.agents.len(), "Scheduler started");
        let mut housekeeping = time::interval(self.options.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            for dispatch in self.dispatch(Utc::now()) {
                self.execute(dispatch, tx.clone());
            }

            let wait = self
                .next_due()
                .map(|due| (due - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_WAIT);

            tokio::select! {
                command = rx.recv() => match command {
                    None | Some(Command::Stop) => break,
                    Some(command) => self.handle(command),
                },
                _ = time::sleep(wait) => {}
                _ = housekeeping.tick() => self.housekeeping(Utc::now()),
            }
        }

        self.shutdown().await;
    }

    fn handle(&mut self, command: Command) {
        let now = Utc::now();
        match command {
            Command::Update {
                client_id,
                output,
                requests,
            } => self.update(client_id, output, &requests, now),
            Command::Unregister(client_id) => self.unregister(client_id, now),
            Command::Direct { key, output, reply } => {
                let accepted = self
                    .perform_direct(&key, output, now)
                    .map(|_| ())
                    .map_err(|e| e.to_string());
                let _ = reply.send(accepted);
            }
            Command::Query { command, reply } => {
                let _ = reply.send(self.process_query(&command));
            }
            Command::Regexps { expressions, reply } => {
                let _ = reply.send(self.update_regexps(expressions));
            }
            Command::Finished(task) => self.finish(task, now),
            Command::Stop => {}
        }
    }

    /// Runs the job on the blocking pool and reports completion back to the
    /// loop once the job has returned. Capacity stays reserved for as long
    /// as the job runs. A job exceeding the timeout gets its item answered
    /// with a "not supported" result right away.
    fn execute(&self, dispatch: Dispatch, tx: mpsc::UnboundedSender<Command>) {
        let timeout = self.options.timeout;
        let plugin = self
            .agents
            .get(dispatch.plugin)
            .map(|agent| agent.plugin().name().to_string())
            .unwrap_or_default();
        let Dispatch {
            task,
            kind,
            job,
            report_to,
            ..
        } = dispatch;

        tokio::spawn(async move {
            let mut running = tokio::task::spawn_blocking(job);
            let joined = match time::timeout(timeout, &mut running).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        plugin = %plugin,
                        kind,
                        task = %task,
                        timeout_secs = timeout.as_secs_f64(),
                        "Task execution timed out"
                    );
                    if let Some((output, itemid)) = report_to {
                        output.write(AgentResult::not_supported(itemid, TIMEOUT_REASON));
                    }
                    running.await
                }
            };
            if let Err(e) = joined {
                error!(plugin = %plugin, kind, task = %task, error = %e, "Task panicked");
            }
            let _ = tx.send(Command::Finished(task));
        });
    }

    async fn shutdown(self) {
        for (name, runner) in self.active_runners() {
            debug!(plugin = %name, "Stopping plugin");
            if let Err(e) = tokio::task::spawn_blocking(move || runner.stop()).await {
                error!(plugin = %name, error = %e, "Plugin stop panicked");
            }
        }
        info!("Scheduler stopped");
    }
}
