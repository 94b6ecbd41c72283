//! Tasks applying the subscription configuration to the target system.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;

use super::system_purpose::{
    check_system_purpose_set, give_the_system_purpose, SystemPurposeData, SYSPURPOSE_FILE,
};
use crate::bus::SysrootExec;
use crate::task::{open_sysroot, Task, TaskError, TaskIoContext};

const RHSM_CONF: &str = "etc/rhsm/rhsm.conf";
const CONSUMER_KEY: &str = "etc/pki/consumer/key.pem";
const CONSUMER_CERT: &str = "etc/pki/consumer/cert.pem";
const ENTITLEMENT_DIR: &str = "etc/pki/entitlement";
const REDHAT_REPO: &str = "etc/yum.repos.d/redhat.repo";
const INSIGHTS_CLIENT: &str = "usr/bin/insights-client";

/// Set the system purpose of the installed system.
#[derive(Debug)]
pub struct SystemPurposeConfigurationTask {
    pub(crate) sysroot: Utf8PathBuf,
    pub(crate) data: SystemPurposeData,
    /// Apply even if the target already has a system purpose.
    pub(crate) overwrite: bool,
    pub(crate) exec: Arc<dyn SysrootExec>,
}

impl Task for SystemPurposeConfigurationTask {
    fn name(&self) -> &str {
        "Set system purpose"
    }

    fn run(&self) -> Result<(), TaskError> {
        if !self.overwrite && check_system_purpose_set(&self.sysroot)? {
            tracing::debug!("System purpose already set, not overwriting it.");
            return Ok(());
        }
        give_the_system_purpose(&self.sysroot, &self.data, self.exec.as_ref())?;
        Ok(())
    }
}

/// Copy subscription tokens from the installation environment into the
/// installed system, so that it does not have to be registered again.
#[derive(Debug)]
pub struct TransferSubscriptionTokensTask {
    pub(crate) source_root: Utf8PathBuf,
    pub(crate) sysroot: Utf8PathBuf,
    pub(crate) transfer_subscription_tokens: bool,
}

impl TransferSubscriptionTokensTask {
    fn missing(&self, path: &str) -> TaskError {
        TaskError::Transfer {
            path: self.source_root.join(path),
        }
    }

    /// Copy one file, creating the parent directories in the target.
    fn copy(&self, src: &Dir, dest: &Dir, path: &str) -> Result<(), TaskError> {
        if !src.is_file(path) {
            return Err(self.missing(path));
        }
        if let Some(parent) = Utf8Path::new(path).parent() {
            dest.create_dir_all(parent)
                .task_context(|| format!("Creating {parent}"))?;
        }
        src.copy(path, dest, path)
            .task_context(|| format!("Copying {path}"))?;
        tracing::debug!("Transferred /{path}");
        Ok(())
    }

    fn copy_entitlements(&self, src: &Dir, dest: &Dir) -> Result<(), TaskError> {
        if !src.is_dir(ENTITLEMENT_DIR) {
            return Err(self.missing(ENTITLEMENT_DIR));
        }
        let mut names = Vec::new();
        for entry in src
            .read_dir(ENTITLEMENT_DIR)
            .task_context(|| format!("Reading {ENTITLEMENT_DIR}"))?
        {
            let entry = entry.task_context(|| format!("Reading {ENTITLEMENT_DIR}"))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(".pem") {
                names.push(name.to_owned());
            }
        }
        if names.is_empty() {
            return Err(self.missing(&format!("{ENTITLEMENT_DIR}/*.pem")));
        }
        names.sort();
        for name in names {
            self.copy(src, dest, &format!("{ENTITLEMENT_DIR}/{name}"))?;
        }
        Ok(())
    }
}

impl Task for TransferSubscriptionTokensTask {
    fn name(&self) -> &str {
        "Transfer subscription tokens to target system"
    }

    fn run(&self) -> Result<(), TaskError> {
        let src = open_sysroot(&self.source_root)?;
        let dest = open_sysroot(&self.sysroot)?;

        if src.is_file(SYSPURPOSE_FILE) {
            self.copy(&src, &dest, SYSPURPOSE_FILE)?;
        } else {
            tracing::debug!("No system purpose file to transfer.");
        }

        if !self.transfer_subscription_tokens {
            tracing::debug!("Subscription tokens are not transferred.");
            return Ok(());
        }
        self.copy(&src, &dest, RHSM_CONF)?;
        self.copy(&src, &dest, CONSUMER_KEY)?;
        self.copy(&src, &dest, CONSUMER_CERT)?;
        self.copy_entitlements(&src, &dest)?;
        self.copy(&src, &dest, REDHAT_REPO)?;
        Ok(())
    }
}

/// Connect the installed system to Red Hat Insights.
#[derive(Debug)]
pub struct ConnectToInsightsTask {
    pub(crate) sysroot: Utf8PathBuf,
    pub(crate) subscription_attached: bool,
    pub(crate) connect_to_insights: bool,
    pub(crate) exec: Arc<dyn SysrootExec>,
}

impl Task for ConnectToInsightsTask {
    fn name(&self) -> &str {
        "Connect the target system to Red Hat Insights"
    }

    fn run(&self) -> Result<(), TaskError> {
        if !(self.subscription_attached && self.connect_to_insights) {
            tracing::debug!("Not connecting to Red Hat Insights.");
            return Ok(());
        }
        let root = open_sysroot(&self.sysroot)?;
        let installed = root
            .try_exists(INSIGHTS_CLIENT)
            .task_context(|| format!("Querying {INSIGHTS_CLIENT}"))?;
        if !installed {
            return Err(TaskError::InsightsClientMissing(
                Utf8Path::new("/").join(INSIGHTS_CLIENT),
            ));
        }
        let argv = [format!("/{INSIGHTS_CLIENT}"), "--register".to_owned()];
        self.exec
            .exec(&self.sysroot, &argv, None)
            .map_err(|e| TaskError::InsightsConnect(format!("{e:#}")))?;
        tracing::info!("Connected to Red Hat Insights.");
        Ok(())
    }
}
