//! # Firewall configuration of the installed system

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::bus::SysrootExec;
use crate::kickstart::{self, KickstartData, KickstartError};
use crate::module::ConfigurationModule;
use crate::observable::{Observed, Properties};
use crate::task::{open_sysroot, Task, TaskError, TaskIoContext};

/// The offline configuration tool, relative to the sysroot.
const FIREWALL_OFFLINE_CMD: &str = "usr/bin/firewall-offline-cmd";

/// Property names emitted by [`FirewallModule`].
#[allow(missing_docs)]
pub mod props {
    pub const FIREWALL_KICKSTARTED: &str = "FirewallKickstarted";
    pub const USE_SYSTEM_DEFAULTS: &str = "UseSystemDefaults";
    pub const FIREWALL_ENABLED: &str = "FirewallEnabled";
    pub const ENABLED_PORTS: &str = "EnabledPorts";
    pub const TRUSTS: &str = "Trusts";
    pub const ENABLED_SERVICES: &str = "EnabledServices";
    pub const DISABLED_SERVICES: &str = "DisabledServices";
}

const ALL_PROPS: &[&str] = &[
    props::FIREWALL_KICKSTARTED,
    props::USE_SYSTEM_DEFAULTS,
    props::FIREWALL_ENABLED,
    props::ENABLED_PORTS,
    props::TRUSTS,
    props::ENABLED_SERVICES,
    props::DISABLED_SERVICES,
];

/// The firewall configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallConfig {
    /// The `firewall` directive was seen.
    pub kickstarted: bool,
    /// Keep whatever the installed packages configured.
    pub use_system_defaults: bool,
    /// Whether the firewall is enabled.
    pub enabled: bool,
    /// Ports to open, `port:protocol`.
    pub enabled_ports: Vec<String>,
    /// Trusted interfaces.
    pub trusts: Vec<String>,
    /// Services to allow.
    pub enabled_services: Vec<String>,
    /// Services to remove.
    pub disabled_services: Vec<String>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            kickstarted: false,
            use_system_defaults: false,
            enabled: true,
            enabled_ports: Vec::new(),
            trusts: Vec::new(),
            enabled_services: Vec::new(),
            disabled_services: Vec::new(),
        }
    }
}

/// The firewall configuration module.
#[derive(Debug)]
pub struct FirewallModule {
    state: Observed<FirewallConfig>,
    exec: Arc<dyn SysrootExec>,
}

impl FirewallModule {
    /// Create the module with the default configuration.
    pub fn new(exec: Arc<dyn SysrootExec>) -> Self {
        Self {
            state: Observed::new(FirewallConfig::default()),
            exec,
        }
    }

    /// A copy of the whole configuration.
    pub fn config(&self) -> FirewallConfig {
        self.state.get(Clone::clone)
    }

    /// Whether the configuration came from the installation description.
    pub fn firewall_kickstarted(&self) -> bool {
        self.state.get(|s| s.kickstarted)
    }

    /// See [`Self::firewall_kickstarted`].
    pub fn set_firewall_kickstarted(&self, v: bool) {
        self.state
            .update(&[props::FIREWALL_KICKSTARTED], |s| s.kickstarted = v);
        tracing::debug!("Firewall considered kickstarted: {v}");
    }

    /// Whether to leave the firewall configuration alone.
    pub fn use_system_defaults(&self) -> bool {
        self.state.get(|s| s.use_system_defaults)
    }

    /// See [`Self::use_system_defaults`].
    pub fn set_use_system_defaults(&self, v: bool) {
        self.state
            .update(&[props::USE_SYSTEM_DEFAULTS], |s| s.use_system_defaults = v);
        tracing::debug!("Use system defaults set to: {v}");
    }

    /// Whether the firewall is enabled.
    pub fn firewall_enabled(&self) -> bool {
        self.state.get(|s| s.enabled)
    }

    /// See [`Self::firewall_enabled`].
    pub fn set_firewall_enabled(&self, v: bool) {
        self.state.update(&[props::FIREWALL_ENABLED], |s| s.enabled = v);
        tracing::debug!("Firewall enabled set to: {v}");
    }

    /// Ports to open.
    pub fn enabled_ports(&self) -> Vec<String> {
        self.state.get(|s| s.enabled_ports.clone())
    }

    /// See [`Self::enabled_ports`].
    pub fn set_enabled_ports(&self, ports: Vec<String>) {
        tracing::debug!("Enabled ports set to: {ports:?}");
        self.state
            .update(&[props::ENABLED_PORTS], |s| s.enabled_ports = ports);
    }

    /// Trusted interfaces.
    pub fn trusts(&self) -> Vec<String> {
        self.state.get(|s| s.trusts.clone())
    }

    /// See [`Self::trusts`].
    pub fn set_trusts(&self, trusts: Vec<String>) {
        tracing::debug!("Trusts set to: {trusts:?}");
        self.state.update(&[props::TRUSTS], |s| s.trusts = trusts);
    }

    /// Services to allow.
    pub fn enabled_services(&self) -> Vec<String> {
        self.state.get(|s| s.enabled_services.clone())
    }

    /// See [`Self::enabled_services`].
    pub fn set_enabled_services(&self, services: Vec<String>) {
        tracing::debug!("Enabled services set to: {services:?}");
        self.state
            .update(&[props::ENABLED_SERVICES], |s| s.enabled_services = services);
    }

    /// Services to remove.
    pub fn disabled_services(&self) -> Vec<String> {
        self.state.get(|s| s.disabled_services.clone())
    }

    /// See [`Self::disabled_services`].
    pub fn set_disabled_services(&self, services: Vec<String>) {
        tracing::debug!("Disabled services set to: {services:?}");
        self.state
            .update(&[props::DISABLED_SERVICES], |s| s.disabled_services = services);
    }
}

impl ConfigurationModule for FirewallModule {
    fn name(&self) -> &'static str {
        "firewall"
    }

    fn properties(&self) -> &Properties {
        self.state.properties()
    }

    fn import(&self, data: &KickstartData) -> Result<(), KickstartError> {
        let config = match &data.firewall {
            Some(f) => FirewallConfig {
                kickstarted: true,
                use_system_defaults: f.use_system_defaults,
                enabled: f.enabled,
                enabled_ports: f.ports.clone(),
                trusts: f.trusts.clone(),
                enabled_services: f.services.clone(),
                disabled_services: f.remove_services.clone(),
            },
            None => FirewallConfig::default(),
        };
        self.state.update(ALL_PROPS, |s| *s = config);
        Ok(())
    }

    fn export(&self, data: &mut KickstartData) {
        let config = self.config();
        let untouched = FirewallConfig::default();
        if !config.kickstarted && config == untouched {
            return;
        }
        data.firewall = Some(kickstart::Firewall {
            enabled: config.enabled,
            use_system_defaults: config.use_system_defaults,
            ports: config.enabled_ports,
            trusts: config.trusts,
            services: config.enabled_services,
            remove_services: config.disabled_services,
        });
    }

    fn install_with_tasks(&self, sysroot: &Utf8Path) -> Vec<Box<dyn Task>> {
        vec![Box::new(ConfigureFirewallTask {
            sysroot: sysroot.to_owned(),
            config: self.config(),
            exec: Arc::clone(&self.exec),
        })]
    }
}

/// Apply the firewall configuration with `firewall-offline-cmd`.
#[derive(Debug)]
pub struct ConfigureFirewallTask {
    sysroot: Utf8PathBuf,
    config: FirewallConfig,
    exec: Arc<dyn SysrootExec>,
}

impl ConfigureFirewallTask {
    fn argv(&self) -> Vec<String> {
        let c = &self.config;
        let mut argv = vec![format!("/{FIREWALL_OFFLINE_CMD}")];
        if !c.enabled {
            argv.push("--disabled".into());
            return argv;
        }
        argv.push("--enabled".into());
        // ssh stays reachable unless explicitly removed
        if !c.disabled_services.iter().any(|s| s == "ssh")
            && !c.enabled_services.iter().any(|s| s == "ssh")
        {
            argv.push("--service=ssh".into());
        }
        argv.extend(c.enabled_ports.iter().map(|p| format!("--port={p}")));
        argv.extend(c.trusts.iter().map(|t| format!("--trust={t}")));
        argv.extend(c.enabled_services.iter().map(|s| format!("--service={s}")));
        argv.extend(
            c.disabled_services
                .iter()
                .map(|s| format!("--remove-service={s}")),
        );
        argv
    }
}

impl Task for ConfigureFirewallTask {
    fn name(&self) -> &str {
        "Configure firewall"
    }

    fn run(&self) -> Result<(), TaskError> {
        if self.config.use_system_defaults {
            tracing::info!("Using the system defaults for the firewall configuration");
            return Ok(());
        }
        let root = open_sysroot(&self.sysroot)?;
        let have_tool = root
            .try_exists(FIREWALL_OFFLINE_CMD)
            .task_context(|| format!("Querying {FIREWALL_OFFLINE_CMD}"))?;
        if !have_tool {
            if self.config.enabled {
                return Err(TaskError::Configuration(format!(
                    "/{FIREWALL_OFFLINE_CMD} is not installed in the target system, but the firewall should be configured"
                )));
            }
            tracing::debug!("Firewall disabled and {FIREWALL_OFFLINE_CMD} not installed; nothing to do");
            return Ok(());
        }
        self.exec.exec(&self.sysroot, &self.argv(), None)?;
        Ok(())
    }
}
