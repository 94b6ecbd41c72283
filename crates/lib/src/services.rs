//! # Services and boot target of the installed system
//!
//! Which units to enable or disable, the default systemd target, the
//! default desktop and whether Initial Setup runs on first boot.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use camino::Utf8Path;

use crate::bus::UnitManager;
use crate::kickstart::{self, KickstartData, KickstartError};
use crate::module::ConfigurationModule;
use crate::observable::{Observed, Properties};
use crate::task::Task;

mod installation;

pub use installation::{
    ConfigureDefaultDesktopTask, ConfigureInitialSetupTask, ConfigureServicesTask,
    ConfigureSystemdDefaultTargetTask,
};

/// The target of graphical installations.
pub const GRAPHICAL_TARGET: &str = "graphical.target";
/// The target of text only installations.
pub const TEXT_ONLY_TARGET: &str = "multi-user.target";

/// Property names emitted by [`ServicesModule`].
#[allow(missing_docs)]
pub mod props {
    pub const DISABLED_SERVICES: &str = "DisabledServices";
    pub const ENABLED_SERVICES: &str = "EnabledServices";
    pub const DEFAULT_TARGET: &str = "DefaultTarget";
    pub const DEFAULT_DESKTOP: &str = "DefaultDesktop";
    pub const SETUP_ON_BOOT: &str = "SetupOnBoot";
}

/// What Initial Setup should do on the first boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetupOnBoot {
    /// Leave it to the installed packages.
    #[default]
    Default,
    /// Do not run it.
    Disabled,
    /// Run it.
    Enabled,
    /// Run it in reconfiguration mode.
    Reconfig,
}

impl Display for SetupOnBoot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            SetupOnBoot::Default => "default",
            SetupOnBoot::Disabled => "disabled",
            SetupOnBoot::Enabled => "enabled",
            SetupOnBoot::Reconfig => "reconfig",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct State {
    disabled_services: Vec<String>,
    enabled_services: Vec<String>,
    default_target: String,
    default_desktop: String,
    setup_on_boot: SetupOnBoot,
}

/// The services configuration module.
#[derive(Debug)]
pub struct ServicesModule {
    state: Observed<State>,
    units: Arc<dyn UnitManager>,
}

impl ServicesModule {
    /// Create the module; `units` enables and disables units in the target.
    pub fn new(units: Arc<dyn UnitManager>) -> Self {
        Self {
            state: Observed::new(State::default()),
            units,
        }
    }

    /// Units to disable.
    pub fn disabled_services(&self) -> Vec<String> {
        self.state.get(|s| s.disabled_services.clone())
    }

    /// Set the units to disable.
    pub fn set_disabled_services(&self, services: Vec<String>) {
        tracing::debug!("Disabled services are set to {services:?}.");
        self.state
            .update(&[props::DISABLED_SERVICES], |s| s.disabled_services = services);
    }

    /// Units to enable.
    pub fn enabled_services(&self) -> Vec<String> {
        self.state.get(|s| s.enabled_services.clone())
    }

    /// Set the units to enable.
    pub fn set_enabled_services(&self, services: Vec<String>) {
        tracing::debug!("Enabled services are set to {services:?}.");
        self.state
            .update(&[props::ENABLED_SERVICES], |s| s.enabled_services = services);
    }

    /// The default systemd target; empty for the text only target.
    pub fn default_target(&self) -> String {
        self.state.get(|s| s.default_target.clone())
    }

    /// Set the default systemd target.
    pub fn set_default_target(&self, target: &str) {
        self.state
            .update(&[props::DEFAULT_TARGET], |s| s.default_target = target.to_owned());
        tracing::debug!("Default target is set to {target}.");
    }

    /// The default desktop; empty for none.
    pub fn default_desktop(&self) -> String {
        self.state.get(|s| s.default_desktop.clone())
    }

    /// Set the default desktop.
    pub fn set_default_desktop(&self, desktop: &str) {
        self.state
            .update(&[props::DEFAULT_DESKTOP], |s| s.default_desktop = desktop.to_owned());
        tracing::debug!("Default desktop is set to {desktop}.");
    }

    /// What Initial Setup does on first boot.
    pub fn setup_on_boot(&self) -> SetupOnBoot {
        self.state.get(|s| s.setup_on_boot)
    }

    /// Set what Initial Setup does on first boot.
    pub fn set_setup_on_boot(&self, value: SetupOnBoot) {
        self.state
            .update(&[props::SETUP_ON_BOOT], |s| s.setup_on_boot = value);
        tracing::debug!("Setup on boot is set to {value}.");
    }
}

impl ConfigurationModule for ServicesModule {
    fn name(&self) -> &'static str {
        "services"
    }

    fn properties(&self) -> &Properties {
        self.state.properties()
    }

    fn import(&self, data: &KickstartData) -> Result<(), KickstartError> {
        let services = data.services.clone().unwrap_or_default();
        self.set_disabled_services(services.disabled);
        self.set_enabled_services(services.enabled);

        let xconfig = data.xconfig.clone().unwrap_or_default();
        let target = if data.skipx {
            TEXT_ONLY_TARGET
        } else if xconfig.startxonboot {
            GRAPHICAL_TARGET
        } else {
            ""
        };
        self.set_default_target(target);
        self.set_default_desktop(xconfig.defaultdesktop.as_deref().unwrap_or_default());

        let setup_on_boot = match data.firstboot {
            None => SetupOnBoot::Default,
            Some(kickstart::Firstboot::Enable) => SetupOnBoot::Enabled,
            Some(kickstart::Firstboot::Disable) => SetupOnBoot::Disabled,
            Some(kickstart::Firstboot::Reconfig) => SetupOnBoot::Reconfig,
        };
        self.set_setup_on_boot(setup_on_boot);
        Ok(())
    }

    fn export(&self, data: &mut KickstartData) {
        let s = self.state.get(Clone::clone);
        if !(s.disabled_services.is_empty() && s.enabled_services.is_empty()) {
            data.services = Some(kickstart::Services {
                disabled: s.disabled_services,
                enabled: s.enabled_services,
            });
        }
        let startxonboot = s.default_target == GRAPHICAL_TARGET;
        data.skipx = s.default_target == TEXT_ONLY_TARGET;
        if startxonboot || !s.default_desktop.is_empty() {
            data.xconfig = Some(kickstart::XConfig {
                startxonboot,
                defaultdesktop: (!s.default_desktop.is_empty()).then_some(s.default_desktop),
            });
        }
        data.firstboot = match s.setup_on_boot {
            SetupOnBoot::Default => None,
            SetupOnBoot::Enabled => Some(kickstart::Firstboot::Enable),
            SetupOnBoot::Disabled => Some(kickstart::Firstboot::Disable),
            SetupOnBoot::Reconfig => Some(kickstart::Firstboot::Reconfig),
        };
    }

    fn install_with_tasks(&self, sysroot: &Utf8Path) -> Vec<Box<dyn Task>> {
        let s = self.state.get(Clone::clone);
        vec![
            Box::new(ConfigureInitialSetupTask {
                sysroot: sysroot.to_owned(),
                setup_on_boot: s.setup_on_boot,
                units: Arc::clone(&self.units),
            }) as Box<dyn Task>,
            Box::new(ConfigureServicesTask {
                sysroot: sysroot.to_owned(),
                disabled_services: s.disabled_services,
                enabled_services: s.enabled_services,
                units: Arc::clone(&self.units),
            }),
            Box::new(ConfigureSystemdDefaultTargetTask {
                sysroot: sysroot.to_owned(),
                default_target: s.default_target,
            }),
            Box::new(ConfigureDefaultDesktopTask {
                sysroot: sysroot.to_owned(),
                default_desktop: s.default_desktop,
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::FakeUnits;
    use crate::observable::tests::Recorder;

    fn module() -> ServicesModule {
        ServicesModule::new(Arc::new(FakeUnits::default()))
    }

    #[test]
    fn properties() {
        let m = module();
        let rec = Recorder::attach(m.properties());
        m.set_enabled_services(vec!["a".into(), "b".into()]);
        m.set_disabled_services(vec!["c".into()]);
        m.set_default_target(GRAPHICAL_TARGET);
        m.set_default_desktop("KDE");
        m.set_setup_on_boot(SetupOnBoot::Reconfig);
        assert_eq!(
            rec.take(),
            [
                "EnabledServices",
                "DisabledServices",
                "DefaultTarget",
                "DefaultDesktop",
                "SetupOnBoot"
            ]
        );
        assert_eq!(m.enabled_services(), ["a", "b"]);
        assert_eq!(m.setup_on_boot(), SetupOnBoot::Reconfig);
    }

    #[test]
    fn kickstart_round_trip() {
        for json in [
            r#"{"services": {"disabled": ["a", "b"], "enabled": ["c"]}}"#,
            r#"{"xconfig": {"startxonboot": true, "defaultdesktop": "GNOME"}}"#,
            r#"{"skipx": true, "firstboot": "reconfig"}"#,
            r#"{"xconfig": {"defaultdesktop": "KDE"}, "firstboot": "disable"}"#,
            r#"{}"#,
        ] {
            let input = KickstartData::from_json(json).unwrap();
            let m = module();
            m.import(&input).unwrap();
            let mut out = KickstartData::default();
            m.export(&mut out);
            assert_eq!(out, input, "{json}");
        }
    }

    #[test]
    fn import_targets() {
        let m = module();
        m.import(&KickstartData {
            skipx: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(m.default_target(), TEXT_ONLY_TARGET);
        m.import(&KickstartData::default()).unwrap();
        assert_eq!(m.default_target(), "");
        assert_eq!(m.setup_on_boot(), SetupOnBoot::Default);
    }

    #[test]
    fn task_order() {
        let tasks = module().install_with_tasks(Utf8Path::new("/mnt/sysroot"));
        let names = tasks.iter().map(|t| t.name()).collect::<Vec<_>>();
        assert_eq!(
            names,
            [
                "Configure Initial Setup",
                "Configure services",
                "Configure the systemd default target",
                "Configure the default desktop"
            ]
        );
    }
}
