//! # Command line interface
//!
//! Applies an installation description to a target system, or renders it
//! back as kickstart directives.

use std::ffi::OsString;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use fn_error_context::context;
use rustix::process::getuid;

use crate::bus::{Chroot, Systemctl};
use crate::config::{InstallerConfig, CONFIG_PATH};
use crate::firewall::FirewallModule;
use crate::kickstart::KickstartData;
use crate::module::ConfigurationModule;
use crate::services::ServicesModule;
use crate::subscription::system_purpose::ValidFields;
use crate::subscription::SubscriptionModule;
use crate::task::{run_tasks, Task};
use crate::users::UsersModule;

/// Options for `install`.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct InstallOpts {
    /// Root of the installed system; overrides the configuration.
    #[clap(long)]
    pub(crate) sysroot: Option<Utf8PathBuf>,

    /// The installation description, as JSON.
    pub(crate) description: Utf8PathBuf,
}

/// Options for `export`.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct ExportOpts {
    /// The installation description, as JSON.
    pub(crate) description: Utf8PathBuf,
}

/// Options for `valid-fields`.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct ValidFieldsOpts {
    /// The whitelist file; defaults to the configured one.
    pub(crate) path: Option<Utf8PathBuf>,
}

#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum Command {
    /// Apply an installation description to the installed system.
    ///
    /// Every module imports the description, then the tasks of all
    /// modules run in sequence against the target root. The first
    /// failing task aborts the installation.
    Install(InstallOpts),
    /// Print an installation description as kickstart directives.
    Export(ExportOpts),
    /// Print the known system purpose values as JSON.
    ValidFields(ValidFieldsOpts),
}

/// Configure an installed system.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "instconf")]
#[clap(rename_all = "kebab-case")]
#[clap(version, long_version = clap::crate_version!())]
pub(crate) struct Opt {
    /// Configuration file.
    #[clap(long, global = true)]
    pub(crate) config: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    pub(crate) command: Command,
}

/// The configuration modules.
#[derive(Debug)]
struct Modules {
    users: UsersModule,
    firewall: FirewallModule,
    services: ServicesModule,
    subscription: SubscriptionModule,
}

impl Modules {
    fn new(config: &InstallerConfig) -> Self {
        let exec = Arc::new(Chroot);
        let subscription = SubscriptionModule::new(
            ValidFields::load(&config.subscription.valid_fields_path),
            &config.source_root,
            exec.clone(),
        );
        subscription
            .set_transfer_subscription_tokens(config.subscription.transfer_subscription_tokens);
        Self {
            users: UsersModule::new(exec.clone()),
            firewall: FirewallModule::new(exec),
            services: ServicesModule::new(Arc::new(Systemctl)),
            subscription,
        }
    }

    /// All modules, in installation order.
    fn all(&self) -> [&dyn ConfigurationModule; 4] {
        [
            &self.users,
            &self.firewall,
            &self.services,
            &self.subscription,
        ]
    }

    /// Import `data` into every module.
    fn import(&self, data: &KickstartData) -> Result<()> {
        for m in self.all() {
            tracing::debug!("Importing the {} configuration", m.name());
            m.import(data)
                .with_context(|| format!("Importing the {} configuration", m.name()))?;
        }
        Ok(())
    }

    /// Render the configuration of every module as kickstart directives.
    fn export(&self) -> String {
        let mut data = KickstartData::default();
        for m in self.all() {
            m.export(&mut data);
        }
        data.to_string()
    }

    fn install_with_tasks(&self, sysroot: &Utf8Path) -> Vec<Box<dyn Task>> {
        self.all()
            .into_iter()
            .flat_map(|m| m.install_with_tasks(sysroot))
            .collect()
    }
}

#[context("Installing")]
fn install(config: &InstallerConfig, opts: InstallOpts) -> Result<()> {
    anyhow::ensure!(getuid().is_root(), "Must run as the root user");
    let sysroot = opts.sysroot.as_deref().unwrap_or(&config.sysroot);
    let data = KickstartData::load(&opts.description)?;
    let modules = Modules::new(config);
    modules.import(&data)?;
    if config.subscription.connect_to_insights {
        modules.subscription.set_connect_to_insights(true);
    }
    run_tasks(&modules.install_with_tasks(sysroot))?;
    tracing::info!("Configured {sysroot}");
    Ok(())
}

#[context("Exporting")]
fn export(config: &InstallerConfig, opts: ExportOpts) -> Result<()> {
    let data = KickstartData::load(&opts.description)?;
    let modules = Modules::new(config);
    modules.import(&data)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(modules.export().as_bytes())?;
    stdout.flush()?;
    Ok(())
}

fn valid_fields(config: &InstallerConfig, opts: ValidFieldsOpts) -> Result<()> {
    let path = opts
        .path
        .as_deref()
        .unwrap_or(&config.subscription.valid_fields_path);
    let fields = ValidFields::load(path);
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &fields)?;
    writeln!(stdout)?;
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}

fn run_from_opt(opt: Opt) -> Result<()> {
    let config_path = opt.config.as_deref().unwrap_or(Utf8Path::new(CONFIG_PATH));
    let config = InstallerConfig::load(config_path)?;
    match opt.command {
        Command::Install(opts) => install(&config, opts),
        Command::Export(opts) => export(&config, opts),
        Command::ValidFields(opts) => valid_fields(&config, opts),
    }
}
