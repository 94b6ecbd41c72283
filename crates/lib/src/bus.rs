//! Seams to the outside world: systemd, the target system, and the
//! message bus.
//!
//! Modules and tasks receive these as trait objects at construction
//! time instead of looking up process-wide singletons.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use instconf_utils::CommandRunExt;

/// Start, restart, enable and disable systemd units.
pub trait UnitManager: Send + Sync + std::fmt::Debug {
    /// Start a unit in the running (installation) environment.
    fn start_unit(&self, unit: &str) -> Result<()>;
    /// Restart a unit in the running (installation) environment.
    fn restart_unit(&self, unit: &str) -> Result<()>;
    /// Enable a unit in the system rooted at `root`.
    fn enable_unit(&self, unit: &str, root: &Utf8Path) -> Result<()>;
    /// Disable a unit in the system rooted at `root`.
    fn disable_unit(&self, unit: &str, root: &Utf8Path) -> Result<()>;
}

/// [`UnitManager`] backed by `systemctl`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Systemctl;

impl Systemctl {
    fn run(verb: &str, unit: &str, root: Option<&Utf8Path>) -> Result<()> {
        let mut cmd = Command::new("systemctl");
        if let Some(root) = root {
            cmd.arg(format!("--root={root}"));
        }
        cmd.args([verb, unit]).log_debug().run()
    }
}

impl UnitManager for Systemctl {
    #[context("Starting {unit}")]
    fn start_unit(&self, unit: &str) -> Result<()> {
        Self::run("start", unit, None)
    }

    #[context("Restarting {unit}")]
    fn restart_unit(&self, unit: &str) -> Result<()> {
        Self::run("restart", unit, None)
    }

    #[context("Enabling {unit}")]
    fn enable_unit(&self, unit: &str, root: &Utf8Path) -> Result<()> {
        Self::run("enable", unit, Some(root))
    }

    #[context("Disabling {unit}")]
    fn disable_unit(&self, unit: &str, root: &Utf8Path) -> Result<()> {
        Self::run("disable", unit, Some(root))
    }
}

/// Run programs inside the target system.
pub trait SysrootExec: Send + Sync + std::fmt::Debug {
    /// Run `argv` chrooted into `sysroot`, optionally feeding `stdin`.
    /// A non-zero exit status is an error.
    fn exec(&self, sysroot: &Utf8Path, argv: &[String], stdin: Option<&str>) -> Result<()>;
}

/// [`SysrootExec`] backed by `chroot(1)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Chroot;

impl SysrootExec for Chroot {
    #[context("Running in {sysroot}")]
    fn exec(&self, sysroot: &Utf8Path, argv: &[String], stdin: Option<&str>) -> Result<()> {
        let mut cmd = Command::new("chroot");
        cmd.arg(sysroot.as_str()).args(argv);
        let Some(input) = stdin else {
            return cmd.log_debug().run();
        };
        // Input may hold secrets, so it is never part of the logged command line.
        cmd.log_debug();
        let pretty = cmd.to_string_pretty();
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Spawning {pretty}"))?;
        child
            .stdin
            .take()
            .context("Missing stdin pipe")?
            .write_all(input.as_bytes())
            .context("Writing stdin")?;
        let status = child.wait()?;
        anyhow::ensure!(status.success(), "Subprocess failed: {pretty}: {status}");
        Ok(())
    }
}

/// Produce handles to remote objects on a bus.
pub trait ProxyFactory<P>: Send + Sync + std::fmt::Debug {
    /// Return a handle to `object_path` as exported by `service_name`.
    fn get_proxy(&self, service_name: &str, object_path: &str) -> P;
}

/// The conventional object path of a service, e.g. `com.redhat.RHSM1`
/// maps to `/com/redhat/RHSM1`.
pub fn object_path_for(service_name: &str) -> String {
    let mut path = String::with_capacity(service_name.len() + 1);
    for part in service_name.split('.').filter(|p| !p.is_empty()) {
        path.push('/');
        path.push_str(part);
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// An error returned by a remote service, as carried by the bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct RemoteError {
    /// The bus error name, e.g. `com.redhat.RHSM1.Error`.
    pub name: String,
    /// The error message as sent by the remote side.
    pub message: String,
}

impl RemoteError {
    /// Create a new remote error.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records systemctl operations as `verb unit`.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct FakeUnits {
        pub(crate) calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeUnits {
        fn record(&self, s: String) {
            self.calls.lock().unwrap().push(s);
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl UnitManager for FakeUnits {
        fn start_unit(&self, unit: &str) -> Result<()> {
            self.record(format!("start {unit}"));
            Ok(())
        }

        fn restart_unit(&self, unit: &str) -> Result<()> {
            self.record(format!("restart {unit}"));
            Ok(())
        }

        fn enable_unit(&self, unit: &str, _root: &Utf8Path) -> Result<()> {
            self.record(format!("enable {unit}"));
            Ok(())
        }

        fn disable_unit(&self, unit: &str, _root: &Utf8Path) -> Result<()> {
            self.record(format!("disable {unit}"));
            Ok(())
        }
    }

    /// Records every command run in the sysroot; fails programs listed in `failing`.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct FakeExec {
        pub(crate) calls: Arc<Mutex<Vec<(Vec<String>, Option<String>)>>>,
        pub(crate) failing: Vec<String>,
    }

    impl FakeExec {
        pub(crate) fn argvs(&self) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(argv, _)| argv.clone())
                .collect()
        }
    }

    impl SysrootExec for FakeExec {
        fn exec(&self, _sysroot: &Utf8Path, argv: &[String], stdin: Option<&str>) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((argv.to_vec(), stdin.map(ToOwned::to_owned)));
            if self.failing.iter().any(|p| Some(p) == argv.first()) {
                anyhow::bail!("{} exited with status 1", argv[0]);
            }
            Ok(())
        }
    }

    #[test]
    fn test_object_path() {
        assert_eq!(object_path_for("my.test.module"), "/my/test/module");
        assert_eq!(object_path_for("com.redhat.RHSM1"), "/com/redhat/RHSM1");
        assert_eq!(object_path_for(""), "/");
    }
}
