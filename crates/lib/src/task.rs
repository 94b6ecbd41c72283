//! # Installation tasks
//!
//! A task is a named, single-shot unit of work closed over a snapshot of a
//! module's properties. Tasks run synchronously and are never retried; the
//! caller runs them one at a time against the target root.

use std::fmt::Debug;
use std::io;
use std::thread::JoinHandle;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use instconf_utils::PathQuotedDisplay;

use crate::bus::RemoteError;
use crate::service_observer::ObserverError;

/// Errors raised by [`Task::run`].
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// A required source file or directory is missing.
    #[error("Failed to transfer {path}: source does not exist")]
    Transfer {
        /// The missing source path.
        path: Utf8PathBuf,
    },
    /// The target system can not be configured as requested.
    #[error("{0}")]
    Configuration(String),
    /// A remote service did not become available in time.
    #[error(transparent)]
    ServiceUnavailable(#[from] ObserverError),
    /// The subscription service rejected a registration.
    #[error("Registration failed: {message}")]
    Registration {
        /// The bus error name.
        name: String,
        /// The exception type reported by the subscription service, if any.
        exception: Option<String>,
        /// The human readable message.
        message: String,
    },
    /// Some other remote call failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The Insights client is not installed in the target system.
    #[error("The insights-client tool ({0}) is not installed")]
    InsightsClientMissing(Utf8PathBuf),
    /// The Insights client failed.
    #[error("Failed to connect to Red Hat Insights: {0}")]
    InsightsConnect(String),
    /// An I/O operation on the target system failed.
    #[error("{context}")]
    Io {
        /// What we were doing.
        context: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// A helper command failed.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Attach a description to I/O errors raised by tasks.
pub(crate) trait TaskIoContext<T> {
    fn task_context(self, f: impl FnOnce() -> String) -> Result<T, TaskError>;
}

impl<T> TaskIoContext<T> for io::Result<T> {
    fn task_context(self, f: impl FnOnce() -> String) -> Result<T, TaskError> {
        self.map_err(|source| TaskError::Io {
            context: f(),
            source,
        })
    }
}

/// Open the root directory of the target system.
pub(crate) fn open_sysroot(sysroot: &Utf8Path) -> Result<Dir, TaskError> {
    Dir::open_ambient_dir(sysroot, cap_std::ambient_authority())
        .task_context(|| format!("Opening {}", PathQuotedDisplay::new(sysroot)))
}

/// An installation task.
pub trait Task: Send + Sync + Debug {
    /// Human readable name, used for progress reporting.
    fn name(&self) -> &str;

    /// Run the task to completion.
    fn run(&self) -> Result<(), TaskError>;
}

/// Run tasks in sequence; the first failure aborts the rest.
pub fn run_tasks(tasks: &[Box<dyn Task>]) -> anyhow::Result<()> {
    let n = tasks.len();
    for (i, task) in tasks.iter().enumerate() {
        tracing::info!("Running task {}/{n}: {}", i + 1, task.name());
        task.run()
            .with_context(|| format!("Task \"{}\" failed", task.name()))?;
    }
    Ok(())
}

/// A task running on its own thread.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    handle: JoinHandle<Result<(), TaskError>>,
}

impl TaskHandle {
    /// Start running `task` in the background.
    pub fn spawn(task: Box<dyn Task>) -> io::Result<Self> {
        let name = task.name().to_owned();
        let handle = std::thread::Builder::new()
            .name("task".into())
            .spawn(move || task.run())?;
        Ok(Self { name, handle })
    }

    /// The name of the task.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the task to finish.
    pub fn join(self) -> anyhow::Result<()> {
        match self.handle.join() {
            Ok(r) => r.with_context(|| format!("Task \"{}\" failed", self.name)),
            Err(_) => anyhow::bail!("Task \"{}\" panicked", self.name),
        }
    }
}
