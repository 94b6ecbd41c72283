//! Tasks applying the services configuration to the target system.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::dirext::CapStdExtDirExt;

use super::{SetupOnBoot, GRAPHICAL_TARGET, TEXT_ONLY_TARGET};
use crate::bus::UnitManager;
use crate::task::{open_sysroot, Task, TaskError, TaskIoContext};

const INITIAL_SETUP_UNIT: &str = "initial-setup.service";
const INITIAL_SETUP_UNIT_PATH: &str = "lib/systemd/system/initial-setup.service";
const RECONFIG_FILE: &str = "etc/reconfigSys";
const SYSTEMD_SYSTEM_DIR: &str = "etc/systemd/system";
const DEFAULT_TARGET_LINK: &str = "etc/systemd/system/default.target";
const SYSCONFIG_DIR: &str = "etc/sysconfig";
const DESKTOP_FILE: &str = "etc/sysconfig/desktop";

/// Enable, disable or reconfigure Initial Setup.
#[derive(Debug)]
pub struct ConfigureInitialSetupTask {
    pub(crate) sysroot: Utf8PathBuf,
    pub(crate) setup_on_boot: SetupOnBoot,
    pub(crate) units: Arc<dyn UnitManager>,
}

impl Task for ConfigureInitialSetupTask {
    fn name(&self) -> &str {
        "Configure Initial Setup"
    }

    fn run(&self) -> Result<(), TaskError> {
        let root = open_sysroot(&self.sysroot)?;
        let installed = root
            .try_exists(INITIAL_SETUP_UNIT_PATH)
            .task_context(|| format!("Querying {INITIAL_SETUP_UNIT_PATH}"))?;
        if !installed {
            tracing::debug!("Initial Setup is not installed.");
            return Ok(());
        }
        match self.setup_on_boot {
            // Initial Setup is off unless asked for.
            SetupOnBoot::Default | SetupOnBoot::Disabled => {
                self.units.disable_unit(INITIAL_SETUP_UNIT, &self.sysroot)?;
            }
            SetupOnBoot::Reconfig => {
                self.units.enable_unit(INITIAL_SETUP_UNIT, &self.sysroot)?;
                root.atomic_write(RECONFIG_FILE, b"")
                    .task_context(|| format!("Writing {RECONFIG_FILE}"))?;
            }
            SetupOnBoot::Enabled => {
                self.units.enable_unit(INITIAL_SETUP_UNIT, &self.sysroot)?;
            }
        }
        Ok(())
    }
}

/// Disable and enable units. All disablements happen first, so a unit
/// named in both lists ends up enabled.
#[derive(Debug)]
pub struct ConfigureServicesTask {
    pub(crate) sysroot: Utf8PathBuf,
    pub(crate) disabled_services: Vec<String>,
    pub(crate) enabled_services: Vec<String>,
    pub(crate) units: Arc<dyn UnitManager>,
}

impl Task for ConfigureServicesTask {
    fn name(&self) -> &str {
        "Configure services"
    }

    fn run(&self) -> Result<(), TaskError> {
        for unit in &self.disabled_services {
            tracing::debug!("Disabling service: {unit}.");
            self.units.disable_unit(unit, &self.sysroot)?;
        }
        for unit in &self.enabled_services {
            tracing::debug!("Enabling service: {unit}.");
            self.units.enable_unit(unit, &self.sysroot)?;
        }
        Ok(())
    }
}

/// Point `default.target` at the configured target.
#[derive(Debug)]
pub struct ConfigureSystemdDefaultTargetTask {
    pub(crate) sysroot: Utf8PathBuf,
    pub(crate) default_target: String,
}

impl Task for ConfigureSystemdDefaultTargetTask {
    fn name(&self) -> &str {
        "Configure the systemd default target"
    }

    fn run(&self) -> Result<(), TaskError> {
        let target = match self.default_target.as_str() {
            "" => TEXT_ONLY_TARGET,
            t @ (GRAPHICAL_TARGET | TEXT_ONLY_TARGET) => t,
            other => {
                return Err(TaskError::Configuration(format!(
                    "Unsupported default target: {other}"
                )))
            }
        };
        let root = open_sysroot(&self.sysroot)?;
        if !root.is_dir(SYSTEMD_SYSTEM_DIR) {
            return Err(TaskError::Configuration(format!(
                "Missing /{SYSTEMD_SYSTEM_DIR} in the target system"
            )));
        }
        root.remove_file_optional(DEFAULT_TARGET_LINK)
            .task_context(|| format!("Removing {DEFAULT_TARGET_LINK}"))?;
        let dest = Utf8Path::new("/lib/systemd/system").join(target);
        root.symlink_contents(&dest, DEFAULT_TARGET_LINK)
            .task_context(|| format!("Linking {DEFAULT_TARGET_LINK}"))?;
        tracing::debug!("Default target set to {target}.");
        Ok(())
    }
}

/// Write the default desktop to `/etc/sysconfig/desktop`.
#[derive(Debug)]
pub struct ConfigureDefaultDesktopTask {
    pub(crate) sysroot: Utf8PathBuf,
    pub(crate) default_desktop: String,
}

impl Task for ConfigureDefaultDesktopTask {
    fn name(&self) -> &str {
        "Configure the default desktop"
    }

    fn run(&self) -> Result<(), TaskError> {
        if self.default_desktop.is_empty() {
            return Ok(());
        }
        let root = open_sysroot(&self.sysroot)?;
        if !root.is_dir(SYSCONFIG_DIR) {
            return Err(TaskError::Configuration(format!(
                "Missing /{SYSCONFIG_DIR} in the target system"
            )));
        }
        let contents = format!("DESKTOP={}\n", self.default_desktop);
        root.atomic_write(DESKTOP_FILE, contents)
            .task_context(|| format!("Writing {DESKTOP_FILE}"))?;
        Ok(())
    }
}
