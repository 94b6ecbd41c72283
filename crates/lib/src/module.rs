//! The shape shared by all configuration modules.

use std::fmt::Debug;

use camino::Utf8Path;

use crate::kickstart::{KickstartData, KickstartError};
use crate::observable::Properties;
use crate::task::Task;

/// A configuration module: observable properties, a kickstart mapping
/// and a factory for the tasks that apply the configuration.
pub trait ConfigurationModule: Send + Sync + Debug {
    /// Short name, used in logs.
    fn name(&self) -> &'static str;

    /// The change notification table of this module.
    fn properties(&self) -> &Properties;

    /// Replace the module's configuration with what `data` describes.
    fn import(&self, data: &KickstartData) -> Result<(), KickstartError>;

    /// Write the module's configuration into `data`.
    fn export(&self, data: &mut KickstartData);

    /// Tasks applying the configuration to the system at `sysroot`.
    ///
    /// The tasks see a snapshot of the properties taken now.
    fn install_with_tasks(&self, sysroot: &Utf8Path) -> Vec<Box<dyn Task>>;
}
