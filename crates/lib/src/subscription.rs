//! # Subscription and system purpose
//!
//! Holds the system purpose of the installed system and everything needed
//! to register it with Red Hat: credentials, the subscription server, an
//! optional HTTP proxy, and whether to connect to Red Hat Insights.
//!
//! Registration happens in the installation environment through the RHSM
//! service ([`rhsm`]); the resulting tokens are then carried over to the
//! installed system by [`TransferSubscriptionTokensTask`].

use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

use crate::bus::{ProxyFactory, SysrootExec, UnitManager};
use crate::config::SubscriptionConfig;
use crate::kickstart::{self, KickstartData, KickstartError};
use crate::module::ConfigurationModule;
use crate::observable::{Observed, Properties};
use crate::service_observer::{ObserverError, ServiceObserver};
use crate::task::{Task, TaskError};

mod installation;
pub mod rhsm;
mod runtime;
pub mod system_purpose;

pub use installation::{
    ConnectToInsightsTask, SystemPurposeConfigurationTask, TransferSubscriptionTokensTask,
};
use rhsm::{PrivateBusConnector, RhsmHandles};
pub use runtime::{
    AttachSubscriptionTask, RegisterWithOrganizationKeyTask, RegisterWithUsernamePasswordTask,
    RestoreRHSMLogLevelTask, RhsmDefaults, SetRHSMConfigurationTask, StartRHSMTask,
};
use system_purpose::{process_field, SystemPurposeData, ValidFields};

/// Property names emitted by [`SubscriptionModule`].
#[allow(missing_docs)]
pub mod props {
    pub const ROLE: &str = "Role";
    pub const SLA: &str = "SLA";
    pub const USAGE: &str = "Usage";
    pub const ADDONS: &str = "Addons";
    pub const IS_SYSTEM_PURPOSE_SET: &str = "IsSystemPurposeSet";
    pub const ORGANIZATION: &str = "Organization";
    pub const ACTIVATION_KEYS: &str = "ActivationKeys";
    pub const ACCOUNT_USERNAME: &str = "AccountUsername";
    pub const ACCOUNT_PASSWORD: &str = "AccountPassword";
    pub const IS_ACCOUNT_PASSWORD_SET: &str = "IsAccountPasswordSet";
    pub const SERVER_HOSTNAME: &str = "ServerHostname";
    pub const RHSM_BASEURL: &str = "RHSMBaseurl";
    pub const SERVER_PROXY_HOSTNAME: &str = "ServerProxyHostname";
    pub const SERVER_PROXY_PORT: &str = "ServerProxyPort";
    pub const SERVER_PROXY_USER: &str = "ServerProxyUser";
    pub const SERVER_PROXY_PASSWORD: &str = "ServerProxyPassword";
    pub const CONNECT_TO_INSIGHTS: &str = "ConnectToInsights";
    pub const IS_REGISTERED: &str = "IsRegistered";
    pub const IS_SUBSCRIPTION_ATTACHED: &str = "IsSubscriptionAttached";
    pub const TRANSFER_SUBSCRIPTION_TOKENS: &str = "TransferSubscriptionTokens";
}

/// A string that is never shown by [`Debug`] or in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The secret value itself.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<unset>)")
        } else {
            f.write_str("Secret(<hidden>)")
        }
    }
}

/// Everything needed to register the system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Organization for activation key registration.
    pub organization: String,
    /// Activation keys.
    pub activation_keys: Vec<Secret>,
    /// Red Hat account name.
    pub account_username: String,
    /// Red Hat account password.
    pub account_password: Secret,
    /// Subscription server; empty for the RHSM default.
    pub server_hostname: String,
    /// Content base URL; empty for the RHSM default.
    pub rhsm_baseurl: String,
    /// HTTP proxy host; empty for no proxy.
    pub server_proxy_hostname: String,
    /// HTTP proxy port; `None` for the RHSM default.
    pub server_proxy_port: Option<u16>,
    /// HTTP proxy user.
    pub server_proxy_user: String,
    /// HTTP proxy password.
    pub server_proxy_password: Secret,
}

const PROXY_OPTION: &str = "--proxy";

impl SubscriptionRequest {
    /// Fill in the proxy fields from `[user[:password]@]host[:port]`.
    fn set_proxy(&mut self, proxy: &str) -> Result<(), KickstartError> {
        let invalid = || KickstartError::InvalidValue {
            directive: "rhsm",
            option: PROXY_OPTION,
            value: proxy.to_owned(),
        };
        let (credentials, address) = match proxy.rsplit_once('@') {
            Some((credentials, address)) => (Some(credentials), address),
            None => (None, proxy),
        };
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => (host, Some(port.parse::<u16>().map_err(|_| invalid())?)),
            None => (address, None),
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let (user, password) = match credentials {
            Some(c) => match c.split_once(':') {
                Some((user, password)) => (user, password),
                None => (c, ""),
            },
            None => ("", ""),
        };
        // a password can not be expressed without its user
        if user.is_empty() && !password.is_empty() {
            return Err(invalid());
        }
        self.server_proxy_hostname = host.to_owned();
        self.server_proxy_port = port;
        self.server_proxy_user = user.to_owned();
        self.server_proxy_password = Secret::new(password);
        Ok(())
    }

    /// The proxy as `[user[:password]@]host[:port]`, if one is set.
    fn proxy(&self) -> Option<String> {
        if self.server_proxy_hostname.is_empty() {
            return None;
        }
        let mut s = String::new();
        if !self.server_proxy_user.is_empty() {
            s.push_str(&self.server_proxy_user);
            if !self.server_proxy_password.is_empty() {
                s.push(':');
                s.push_str(self.server_proxy_password.expose());
            }
            s.push('@');
        }
        s.push_str(&self.server_proxy_hostname);
        if let Some(port) = self.server_proxy_port {
            s.push_str(&format!(":{port}"));
        }
        Some(s)
    }
}

/// The RHSM collaborators of the installation environment.
#[derive(Debug, Clone)]
pub struct RhsmRuntime {
    /// Starts RHSM and hands out its objects.
    pub observer: ServiceObserver<RhsmHandles>,
    /// Connects to the RHSM private bus.
    pub connector: Arc<dyn PrivateBusConnector>,
}

impl RhsmRuntime {
    /// Watch for RHSM on the bus, giving up after the configured timeout.
    pub fn new(
        factory: Arc<dyn ProxyFactory<RhsmHandles>>,
        units: Arc<dyn UnitManager>,
        connector: Arc<dyn PrivateBusConnector>,
        config: &SubscriptionConfig,
    ) -> Self {
        let observer = ServiceObserver::with_timeout(
            factory,
            units,
            rhsm::RHSM_SERVICE_NAME,
            rhsm::RHSM_UNIT,
            config.activation_timeout(),
        );
        Self {
            observer,
            connector,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct State {
    system_purpose: SystemPurposeData,
    request: SubscriptionRequest,
    connect_to_insights: bool,
    registered: bool,
    subscription_attached: bool,
    transfer_subscription_tokens: bool,
}

/// The subscription configuration module.
#[derive(Debug)]
pub struct SubscriptionModule {
    state: Observed<State>,
    valid_fields: ValidFields,
    source_root: Utf8PathBuf,
    rhsm_defaults: RhsmDefaults,
    exec: Arc<dyn SysrootExec>,
}

impl SubscriptionModule {
    /// Create the module.
    ///
    /// `valid_fields` is the system purpose whitelist, `source_root` the
    /// root of the installation environment holding the subscription
    /// tokens, and `exec` runs tools in the installed system.
    pub fn new(
        valid_fields: ValidFields,
        source_root: &Utf8Path,
        exec: Arc<dyn SysrootExec>,
    ) -> Self {
        let state = State {
            transfer_subscription_tokens: true,
            ..Default::default()
        };
        Self {
            state: Observed::new(state),
            valid_fields,
            source_root: source_root.to_owned(),
            rhsm_defaults: RhsmDefaults::default(),
            exec,
        }
    }

    /// Known roles.
    pub fn valid_roles(&self) -> &[String] {
        &self.valid_fields.roles
    }

    /// Known service level agreements.
    pub fn valid_slas(&self) -> &[String] {
        &self.valid_fields.slas
    }

    /// Known usage types.
    pub fn valid_usage_types(&self) -> &[String] {
        &self.valid_fields.usage_types
    }

    fn set_purpose_field(&self, name: &'static str, f: impl FnOnce(&mut SystemPurposeData)) {
        self.state
            .update(&[name, props::IS_SYSTEM_PURPOSE_SET], |s| f(&mut s.system_purpose));
    }

    /// The intended role.
    pub fn role(&self) -> String {
        self.state.get(|s| s.system_purpose.role.clone())
    }

    /// Set the intended role.
    pub fn set_role(&self, role: &str) {
        self.set_purpose_field(props::ROLE, |p| p.role = role.to_owned());
        tracing::debug!("Role is set to {role}.");
    }

    /// The service level agreement.
    pub fn sla(&self) -> String {
        self.state.get(|s| s.system_purpose.sla.clone())
    }

    /// Set the service level agreement.
    pub fn set_sla(&self, sla: &str) {
        self.set_purpose_field(props::SLA, |p| p.sla = sla.to_owned());
        tracing::debug!("SLA is set to {sla}.");
    }

    /// The intended usage.
    pub fn usage(&self) -> String {
        self.state.get(|s| s.system_purpose.usage.clone())
    }

    /// Set the intended usage.
    pub fn set_usage(&self, usage: &str) {
        self.set_purpose_field(props::USAGE, |p| p.usage = usage.to_owned());
        tracing::debug!("Usage is set to {usage}.");
    }

    /// Additional layered products or features.
    pub fn addons(&self) -> Vec<String> {
        self.state.get(|s| s.system_purpose.addons.clone())
    }

    /// Set the additional layered products or features.
    pub fn set_addons(&self, addons: Vec<String>) {
        tracing::debug!("Addons set to {addons:?}.");
        self.set_purpose_field(props::ADDONS, |p| p.addons = addons);
    }

    /// Whether any system purpose field is set.
    pub fn is_system_purpose_set(&self) -> bool {
        self.state.get(|s| s.system_purpose.is_set())
    }

    /// The complete system purpose.
    pub fn system_purpose_data(&self) -> SystemPurposeData {
        self.state.get(|s| s.system_purpose.clone())
    }

    /// The organization used with activation keys.
    pub fn organization(&self) -> String {
        self.state.get(|s| s.request.organization.clone())
    }

    /// Set the organization.
    pub fn set_organization(&self, organization: &str) {
        self.state.update(&[props::ORGANIZATION], |s| {
            s.request.organization = organization.to_owned()
        });
        tracing::debug!("Organization set to: {organization}");
    }

    /// The number of activation keys set.
    pub fn activation_key_count(&self) -> usize {
        self.state.get(|s| s.request.activation_keys.len())
    }

    /// Set the activation keys.
    pub fn set_activation_keys(&self, keys: Vec<Secret>) {
        let n = keys.len();
        self.state
            .update(&[props::ACTIVATION_KEYS], |s| s.request.activation_keys = keys);
        tracing::debug!("{n} activation keys have been set.");
    }

    /// The Red Hat account name.
    pub fn account_username(&self) -> String {
        self.state.get(|s| s.request.account_username.clone())
    }

    /// Set the Red Hat account name.
    pub fn set_account_username(&self, username: &str) {
        self.state.update(&[props::ACCOUNT_USERNAME], |s| {
            s.request.account_username = username.to_owned()
        });
        tracing::debug!("Red Hat account name set to: {username}");
    }

    /// Whether an account password is set. The password itself can not be read back.
    pub fn is_account_password_set(&self) -> bool {
        self.state.get(|s| !s.request.account_password.is_empty())
    }

    /// Set the Red Hat account password.
    pub fn set_account_password(&self, password: Secret) {
        self.state.update(
            &[props::ACCOUNT_PASSWORD, props::IS_ACCOUNT_PASSWORD_SET],
            |s| s.request.account_password = password,
        );
        tracing::debug!("Red Hat account password has been set.");
    }

    /// The subscription server; empty for the default.
    pub fn server_hostname(&self) -> String {
        self.state.get(|s| s.request.server_hostname.clone())
    }

    /// Set the subscription server.
    pub fn set_server_hostname(&self, hostname: &str) {
        self.state.update(&[props::SERVER_HOSTNAME], |s| {
            s.request.server_hostname = hostname.to_owned()
        });
        tracing::debug!("Subscription server hostname set to: {hostname}");
    }

    /// The content base URL; empty for the default.
    pub fn rhsm_baseurl(&self) -> String {
        self.state.get(|s| s.request.rhsm_baseurl.clone())
    }

    /// Set the content base URL.
    pub fn set_rhsm_baseurl(&self, baseurl: &str) {
        self.state.update(&[props::RHSM_BASEURL], |s| {
            s.request.rhsm_baseurl = baseurl.to_owned()
        });
        tracing::debug!("RHSM base URL set to: {baseurl}");
    }

    /// The HTTP proxy host; empty for none.
    pub fn server_proxy_hostname(&self) -> String {
        self.state.get(|s| s.request.server_proxy_hostname.clone())
    }

    /// Set the HTTP proxy host.
    pub fn set_server_proxy_hostname(&self, hostname: &str) {
        self.state.update(&[props::SERVER_PROXY_HOSTNAME], |s| {
            s.request.server_proxy_hostname = hostname.to_owned()
        });
    }

    /// The HTTP proxy port.
    pub fn server_proxy_port(&self) -> Option<u16> {
        self.state.get(|s| s.request.server_proxy_port)
    }

    /// Set the HTTP proxy port; `None` restores the default.
    pub fn set_server_proxy_port(&self, port: Option<u16>) {
        self.state
            .update(&[props::SERVER_PROXY_PORT], |s| s.request.server_proxy_port = port);
    }

    /// The HTTP proxy user.
    pub fn server_proxy_user(&self) -> String {
        self.state.get(|s| s.request.server_proxy_user.clone())
    }

    /// Set the HTTP proxy user.
    pub fn set_server_proxy_user(&self, user: &str) {
        self.state.update(&[props::SERVER_PROXY_USER], |s| {
            s.request.server_proxy_user = user.to_owned()
        });
    }

    /// Set the HTTP proxy password.
    pub fn set_server_proxy_password(&self, password: Secret) {
        self.state.update(&[props::SERVER_PROXY_PASSWORD], |s| {
            s.request.server_proxy_password = password
        });
    }

    /// A snapshot of the registration settings.
    pub fn subscription_request(&self) -> SubscriptionRequest {
        self.state.get(|s| s.request.clone())
    }

    /// Whether to connect the installed system to Red Hat Insights.
    pub fn connect_to_insights(&self) -> bool {
        self.state.get(|s| s.connect_to_insights)
    }

    /// See [`Self::connect_to_insights`].
    pub fn set_connect_to_insights(&self, value: bool) {
        self.state
            .update(&[props::CONNECT_TO_INSIGHTS], |s| s.connect_to_insights = value);
        tracing::debug!("Connect target system to Insights set to: {value}");
    }

    /// Whether to copy the subscription tokens into the installed system.
    pub fn transfer_subscription_tokens(&self) -> bool {
        self.state.get(|s| s.transfer_subscription_tokens)
    }

    /// See [`Self::transfer_subscription_tokens`].
    pub fn set_transfer_subscription_tokens(&self, value: bool) {
        self.state.update(&[props::TRANSFER_SUBSCRIPTION_TOKENS], |s| {
            s.transfer_subscription_tokens = value
        });
    }

    /// Whether the installation environment is registered.
    pub fn is_registered(&self) -> bool {
        self.state.get(|s| s.registered)
    }

    fn set_registered(&self, value: bool) {
        self.state
            .update(&[props::IS_REGISTERED], |s| s.registered = value);
        tracing::debug!("System registered set to: {value}");
    }

    /// Whether a subscription is attached to the installation environment.
    pub fn is_subscription_attached(&self) -> bool {
        self.state.get(|s| s.subscription_attached)
    }

    fn set_subscription_attached(&self, value: bool) {
        self.state
            .update(&[props::IS_SUBSCRIPTION_ATTACHED], |s| {
                s.subscription_attached = value
            });
        tracing::debug!("Subscription attached set to: {value}");
    }

    /// Start RHSM in the installation environment.
    pub fn start_rhsm_with_task(&self, rhsm: &RhsmRuntime) -> StartRHSMTask {
        StartRHSMTask {
            source_root: self.source_root.clone(),
            observer: rhsm.observer.clone(),
            defaults: Arc::clone(&self.rhsm_defaults),
        }
    }

    /// Push the server and proxy settings to RHSM.
    pub fn set_rhsm_config_with_task(
        &self,
        rhsm: &RhsmRuntime,
    ) -> Result<SetRHSMConfigurationTask, ObserverError> {
        let handles = rhsm.observer.get_handle()?;
        let defaults = self
            .rhsm_defaults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(SetRHSMConfigurationTask {
            config: handles.config,
            defaults,
            request: self.subscription_request(),
        })
    }

    /// Register with the Red Hat account credentials.
    pub fn register_username_password_with_task(
        &self,
        rhsm: &RhsmRuntime,
    ) -> Result<RegisterWithUsernamePasswordTask, ObserverError> {
        let handles = rhsm.observer.get_handle()?;
        let request = self.subscription_request();
        Ok(RegisterWithUsernamePasswordTask {
            register_server: handles.register_server,
            connector: Arc::clone(&rhsm.connector),
            username: request.account_username,
            password: request.account_password,
        })
    }

    /// Register with the organization and activation keys.
    pub fn register_organization_key_with_task(
        &self,
        rhsm: &RhsmRuntime,
    ) -> Result<RegisterWithOrganizationKeyTask, ObserverError> {
        let handles = rhsm.observer.get_handle()?;
        let request = self.subscription_request();
        Ok(RegisterWithOrganizationKeyTask {
            register_server: handles.register_server,
            connector: Arc::clone(&rhsm.connector),
            organization: request.organization,
            activation_keys: request.activation_keys,
        })
    }

    /// Auto-attach a subscription matching the SLA.
    pub fn attach_subscription_with_task(
        &self,
        rhsm: &RhsmRuntime,
    ) -> Result<AttachSubscriptionTask, ObserverError> {
        let handles = rhsm.observer.get_handle()?;
        Ok(AttachSubscriptionTask {
            attach: handles.attach,
            service_level: self.sla(),
        })
    }

    /// Restore the RHSM log level raised by [`StartRHSMTask`].
    pub fn restore_rhsm_log_level_with_task(
        &self,
        rhsm: &RhsmRuntime,
    ) -> Result<RestoreRHSMLogLevelTask, ObserverError> {
        let handles = rhsm.observer.get_handle()?;
        Ok(RestoreRHSMLogLevelTask {
            config: handles.config,
        })
    }

    /// Register the installation environment, using activation keys if
    /// any are set and the account credentials otherwise.
    ///
    /// Updates [`Self::is_registered`] from the outcome.
    pub fn register(&self, rhsm: &RhsmRuntime) -> Result<(), TaskError> {
        let task: Box<dyn Task> = if self.activation_key_count() > 0 {
            Box::new(self.register_organization_key_with_task(rhsm)?)
        } else {
            Box::new(self.register_username_password_with_task(rhsm)?)
        };
        let r = task.run();
        self.set_registered(r.is_ok());
        r
    }

    /// Attach a subscription to the registered installation environment.
    ///
    /// Updates [`Self::is_subscription_attached`] from the outcome.
    pub fn attach_subscription(&self, rhsm: &RhsmRuntime) -> Result<(), TaskError> {
        let r = self.attach_subscription_with_task(rhsm)?.run();
        self.set_subscription_attached(r.is_ok());
        r
    }

    fn import_system_purpose(&self, syspurpose: Option<&kickstart::Syspurpose>) {
        let syspurpose = syspurpose.cloned().unwrap_or_default();
        let field = |raw: Option<String>, valid: &[String], name: &str| match raw {
            Some(raw) if !raw.is_empty() => process_field(&raw, valid, name),
            _ => String::new(),
        };
        self.set_role(&field(syspurpose.role, &self.valid_fields.roles, "role"));
        self.set_sla(&field(syspurpose.sla, &self.valid_fields.slas, "SLA"));
        self.set_usage(&field(
            syspurpose.usage,
            &self.valid_fields.usage_types,
            "usage",
        ));
        // There is no whitelist of addons.
        self.set_addons(syspurpose.addons);
    }
}

impl ConfigurationModule for SubscriptionModule {
    fn name(&self) -> &'static str {
        "subscription"
    }

    fn properties(&self) -> &Properties {
        self.state.properties()
    }

    fn import(&self, data: &KickstartData) -> Result<(), KickstartError> {
        let rhsm = data.rhsm.clone().unwrap_or_default();
        let mut request = SubscriptionRequest {
            organization: rhsm.organization.unwrap_or_default(),
            activation_keys: rhsm.activation_keys.into_iter().map(Secret::new).collect(),
            server_hostname: rhsm.server_hostname.unwrap_or_default(),
            rhsm_baseurl: rhsm.rhsm_baseurl.unwrap_or_default(),
            ..Default::default()
        };
        if let Some(proxy) = &rhsm.proxy {
            request.set_proxy(proxy)?;
        }

        self.import_system_purpose(data.syspurpose.as_ref());
        self.set_organization(&request.organization);
        self.set_activation_keys(request.activation_keys);
        self.set_server_hostname(&request.server_hostname);
        self.set_rhsm_baseurl(&request.rhsm_baseurl);
        self.set_server_proxy_hostname(&request.server_proxy_hostname);
        self.set_server_proxy_port(request.server_proxy_port);
        self.set_server_proxy_user(&request.server_proxy_user);
        self.set_server_proxy_password(request.server_proxy_password);
        self.set_connect_to_insights(rhsm.connect_to_insights);
        Ok(())
    }

    fn export(&self, data: &mut KickstartData) {
        let s = self.state.get(Clone::clone);
        let purpose = s.system_purpose;
        if purpose.is_set() {
            let opt = |v: String| (!v.is_empty()).then_some(v);
            data.syspurpose = Some(kickstart::Syspurpose {
                role: opt(purpose.role),
                sla: opt(purpose.sla),
                usage: opt(purpose.usage),
                addons: purpose.addons,
            });
        }

        let r = s.request;
        let rhsm = kickstart::Rhsm {
            proxy: r.proxy(),
            organization: (!r.organization.is_empty()).then_some(r.organization),
            activation_keys: r
                .activation_keys
                .iter()
                .map(|k| k.expose().to_owned())
                .collect(),
            connect_to_insights: s.connect_to_insights,
            server_hostname: (!r.server_hostname.is_empty()).then_some(r.server_hostname),
            rhsm_baseurl: (!r.rhsm_baseurl.is_empty()).then_some(r.rhsm_baseurl),
        };
        if rhsm != kickstart::Rhsm::default() {
            data.rhsm = Some(rhsm);
        }
    }

    fn install_with_tasks(&self, sysroot: &Utf8Path) -> Vec<Box<dyn Task>> {
        let s = self.state.get(Clone::clone);
        vec![
            Box::new(SystemPurposeConfigurationTask {
                sysroot: sysroot.to_owned(),
                data: s.system_purpose,
                overwrite: false,
                exec: Arc::clone(&self.exec),
            }) as Box<dyn Task>,
            // Without an attached subscription there are no tokens to carry over.
            Box::new(TransferSubscriptionTokensTask {
                source_root: self.source_root.clone(),
                sysroot: sysroot.to_owned(),
                transfer_subscription_tokens: s.transfer_subscription_tokens
                    && s.subscription_attached,
            }),
            Box::new(ConnectToInsightsTask {
                sysroot: sysroot.to_owned(),
                subscription_attached: s.subscription_attached,
                connect_to_insights: s.connect_to_insights,
                exec: Arc::clone(&self.exec),
            }),
        ]
    }
}
