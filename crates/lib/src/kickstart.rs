//! # Parsed installation description records
//!
//! These are the structured forms of the kickstart directives the
//! configuration modules consume. Parsing the kickstart grammar itself
//! happens elsewhere; we accept the parsed records as JSON and can render
//! them back into directive text.

use std::fmt::{self, Debug, Display, Formatter};

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// Errors found while importing a description into a module.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KickstartError {
    /// A mandatory option was not given.
    #[error("{directive}: {option} is required")]
    Missing {
        /// The directive, e.g. `sshkey`.
        directive: &'static str,
        /// The missing option, e.g. `--username`.
        option: &'static str,
    },
    /// An option has a value that can not be used.
    #[error("{directive}: invalid value for {option}: {value:?}")]
    InvalidValue {
        /// The directive, e.g. `rhsm`.
        directive: &'static str,
        /// The offending option, e.g. `--proxy`.
        option: &'static str,
        /// The value as given.
        value: String,
    },
}

/// Stands in for a password in [`Debug`] output.
pub(crate) struct Redacted<'a>(pub(crate) &'a str);

impl Debug for Redacted<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<unset>")
        } else {
            f.write_str("<hidden>")
        }
    }
}

/// The `rootpw` directive.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RootPw {
    /// The password; empty if only the lock state is given.
    #[serde(default)]
    pub password: String,
    /// Whether `password` is already crypted.
    #[serde(default)]
    pub is_crypted: bool,
    /// Lock the root account.
    #[serde(default)]
    pub lock: bool,
}

impl Debug for RootPw {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootPw")
            .field("password", &Redacted(&self.password))
            .field("is_crypted", &self.is_crypted)
            .field("lock", &self.lock)
            .finish()
    }
}

/// A `user` directive.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct User {
    /// The user name.
    pub name: String,
    /// Supplementary groups.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Home directory.
    #[serde(default)]
    pub homedir: Option<String>,
    /// The password, possibly crypted.
    #[serde(default)]
    pub password: String,
    /// Whether `password` is already crypted.
    #[serde(default)]
    pub is_crypted: bool,
    /// Lock the account.
    #[serde(default)]
    pub lock: bool,
    /// Login shell.
    #[serde(default)]
    pub shell: Option<String>,
    /// The GECOS field.
    #[serde(default)]
    pub gecos: Option<String>,
    /// Numeric user id; absent means "pick one".
    #[serde(default)]
    pub uid: Option<u32>,
    /// Numeric id of the primary group; absent means "pick one".
    #[serde(default)]
    pub gid: Option<u32>,
}

impl Debug for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("name", &self.name)
            .field("groups", &self.groups)
            .field("homedir", &self.homedir)
            .field("password", &Redacted(&self.password))
            .field("is_crypted", &self.is_crypted)
            .field("lock", &self.lock)
            .field("shell", &self.shell)
            .field("gecos", &self.gecos)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .finish()
    }
}

/// A `group` directive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Group {
    /// The group name.
    pub name: String,
    /// Numeric group id; absent means "pick one".
    #[serde(default)]
    pub gid: Option<u32>,
}

/// An `sshkey` directive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SshKey {
    /// The user the key is installed for.
    pub username: String,
    /// The public key, in `authorized_keys` format.
    pub key: String,
}

fn default_true() -> bool {
    true
}

/// The `firewall` directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Firewall {
    /// `--enabled` (the default) or `--disabled`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Leave the firewall configuration of the installed system alone.
    #[serde(default)]
    pub use_system_defaults: bool,
    /// Ports to open, as `port:protocol`.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Trusted network interfaces.
    #[serde(default)]
    pub trusts: Vec<String>,
    /// Services to allow.
    #[serde(default)]
    pub services: Vec<String>,
    /// Services to remove from the allowed set.
    #[serde(default)]
    pub remove_services: Vec<String>,
}

impl Default for Firewall {
    fn default() -> Self {
        Self {
            enabled: true,
            use_system_defaults: false,
            ports: Vec::new(),
            trusts: Vec::new(),
            services: Vec::new(),
            remove_services: Vec::new(),
        }
    }
}

/// The `services` directive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Services {
    /// Units to disable.
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Units to enable.
    #[serde(default)]
    pub enabled: Vec<String>,
}

/// The `xconfig` directive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct XConfig {
    /// Boot into the graphical target.
    #[serde(default)]
    pub startxonboot: bool,
    /// The default desktop environment.
    #[serde(default)]
    pub defaultdesktop: Option<String>,
}

/// The `firstboot` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Firstboot {
    /// `--enable`
    Enable,
    /// `--disable`
    Disable,
    /// `--reconfig`
    Reconfig,
}

/// The `syspurpose` directive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Syspurpose {
    /// Intended role.
    #[serde(default)]
    pub role: Option<String>,
    /// Service level agreement.
    #[serde(default)]
    pub sla: Option<String>,
    /// Intended usage.
    #[serde(default)]
    pub usage: Option<String>,
    /// Additional products.
    #[serde(default)]
    pub addons: Vec<String>,
}

impl Syspurpose {
    fn is_empty(&self) -> bool {
        self.role.is_none() && self.sla.is_none() && self.usage.is_none() && self.addons.is_empty()
    }
}

/// The `rhsm` directive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Rhsm {
    /// Organization id for activation key registration.
    #[serde(default)]
    pub organization: Option<String>,
    /// Activation keys.
    #[serde(default)]
    pub activation_keys: Vec<String>,
    /// Connect the installed system to Red Hat Insights.
    #[serde(default)]
    pub connect_to_insights: bool,
    /// Subscription server hostname.
    #[serde(default)]
    pub server_hostname: Option<String>,
    /// Content base URL.
    #[serde(default)]
    pub rhsm_baseurl: Option<String>,
    /// HTTP proxy, as `[user[:password]@]host[:port]`.
    #[serde(default)]
    pub proxy: Option<String>,
}

/// The directives consumed by the configuration modules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
#[allow(missing_docs)]
pub struct KickstartData {
    #[serde(default)]
    pub rootpw: Option<RootPw>,
    #[serde(default)]
    pub user: Vec<User>,
    #[serde(default)]
    pub group: Vec<Group>,
    #[serde(default)]
    pub sshkey: Vec<SshKey>,
    #[serde(default)]
    pub firewall: Option<Firewall>,
    #[serde(default)]
    pub services: Option<Services>,
    #[serde(default)]
    pub xconfig: Option<XConfig>,
    #[serde(default)]
    pub skipx: bool,
    #[serde(default)]
    pub firstboot: Option<Firstboot>,
    #[serde(default)]
    pub syspurpose: Option<Syspurpose>,
    #[serde(default)]
    pub rhsm: Option<Rhsm>,
}

impl KickstartData {
    /// Parse a description from its JSON form.
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("Parsing installation description")
    }

    /// Read a description from a JSON file.
    #[context("Loading {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::from_json(&buf)
    }
}

fn quoted(s: &str) -> String {
    format!("\"{s}\"")
}

impl Display for RootPw {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("rootpw")?;
        if !self.password.is_empty() {
            let kind = if self.is_crypted {
                "--iscrypted"
            } else {
                "--plaintext"
            };
            write!(f, " {kind}")?;
        }
        if self.lock {
            f.write_str(" --lock")?;
        }
        if !self.password.is_empty() {
            write!(f, " {}", self.password)?;
        }
        Ok(())
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("user")?;
        if !self.groups.is_empty() {
            write!(f, " --groups={}", self.groups.join(","))?;
        }
        if let Some(homedir) = &self.homedir {
            write!(f, " --homedir={homedir}")?;
        }
        write!(f, " --name={}", self.name)?;
        if !self.password.is_empty() {
            write!(f, " --password={}", self.password)?;
            if self.is_crypted {
                f.write_str(" --iscrypted")?;
            }
        }
        if let Some(shell) = &self.shell {
            write!(f, " --shell={shell}")?;
        }
        if let Some(uid) = self.uid {
            write!(f, " --uid={uid}")?;
        }
        if let Some(gecos) = &self.gecos {
            write!(f, " --gecos={}", quoted(gecos))?;
        }
        if let Some(gid) = self.gid {
            write!(f, " --gid={gid}")?;
        }
        if self.lock {
            f.write_str(" --lock")?;
        }
        Ok(())
    }
}

impl Display for Group {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "group --name={}", self.name)?;
        if let Some(gid) = self.gid {
            write!(f, " --gid={gid}")?;
        }
        Ok(())
    }
}

impl Display for SshKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "sshkey --username={} {}", self.username, quoted(&self.key))
    }
}

impl Display for Firewall {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.use_system_defaults {
            return f.write_str("firewall --use-system-defaults");
        }
        if !self.enabled {
            return f.write_str("firewall --disabled");
        }
        f.write_str("firewall --enabled")?;
        if !self.ports.is_empty() {
            write!(f, " --port={}", self.ports.join(","))?;
        }
        for trust in &self.trusts {
            write!(f, " --trust={trust}")?;
        }
        if !self.services.is_empty() {
            write!(f, " --service={}", self.services.join(","))?;
        }
        if !self.remove_services.is_empty() {
            write!(f, " --remove-service={}", self.remove_services.join(","))?;
        }
        Ok(())
    }
}

impl Display for Services {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("services")?;
        if !self.disabled.is_empty() {
            write!(f, " --disabled={}", self.disabled.join(","))?;
        }
        if !self.enabled.is_empty() {
            write!(f, " --enabled={}", self.enabled.join(","))?;
        }
        Ok(())
    }
}

impl Display for XConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("xconfig")?;
        if self.startxonboot {
            f.write_str(" --startxonboot")?;
        }
        if let Some(desktop) = &self.defaultdesktop {
            write!(f, " --defaultdesktop={desktop}")?;
        }
        Ok(())
    }
}

impl Display for Firstboot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let opt = match self {
            Firstboot::Enable => "--enable",
            Firstboot::Disable => "--disable",
            Firstboot::Reconfig => "--reconfig",
        };
        write!(f, "firstboot {opt}")
    }
}

impl Display for Syspurpose {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("# Intended system purpose\nsyspurpose")?;
        for (opt, v) in [("role", &self.role), ("sla", &self.sla), ("usage", &self.usage)] {
            if let Some(v) = v {
                write!(f, " --{opt}={}", quoted(v))?;
            }
        }
        for addon in &self.addons {
            write!(f, " --addon={}", quoted(addon))?;
        }
        Ok(())
    }
}

impl Display for Rhsm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("rhsm")?;
        if let Some(org) = &self.organization {
            write!(f, " --organization={}", quoted(org))?;
        }
        for key in &self.activation_keys {
            write!(f, " --activation-key={}", quoted(key))?;
        }
        if self.connect_to_insights {
            f.write_str(" --connect-to-insights")?;
        }
        if let Some(hostname) = &self.server_hostname {
            write!(f, " --server-hostname={}", quoted(hostname))?;
        }
        if let Some(baseurl) = &self.rhsm_baseurl {
            write!(f, " --rhsm-baseurl={}", quoted(baseurl))?;
        }
        if let Some(proxy) = &self.proxy {
            write!(f, " --proxy={}", quoted(proxy))?;
        }
        Ok(())
    }
}

impl Display for KickstartData {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(rootpw) = &self.rootpw {
            writeln!(f, "{rootpw}")?;
        }
        for user in &self.user {
            writeln!(f, "{user}")?;
        }
        for group in &self.group {
            writeln!(f, "{group}")?;
        }
        for key in &self.sshkey {
            writeln!(f, "{key}")?;
        }
        if let Some(firewall) = &self.firewall {
            writeln!(f, "{firewall}")?;
        }
        if let Some(services) = self
            .services
            .as_ref()
            .filter(|s| !(s.disabled.is_empty() && s.enabled.is_empty()))
        {
            writeln!(f, "{services}")?;
        }
        if let Some(xconfig) = &self.xconfig {
            writeln!(f, "{xconfig}")?;
        }
        if self.skipx {
            writeln!(f, "skipx")?;
        }
        if let Some(firstboot) = &self.firstboot {
            writeln!(f, "{firstboot}")?;
        }
        if let Some(syspurpose) = self.syspurpose.as_ref().filter(|s| !s.is_empty()) {
            writeln!(f, "{syspurpose}")?;
        }
        if let Some(rhsm) = &self.rhsm {
            writeln!(f, "{rhsm}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn parse_json_defaults() {
        let data = KickstartData::from_json(
            r#"{"user": [{"name": "user3", "lock": true}], "firewall": {"ports": ["22:tcp"]}, "skipx": true}"#,
        )
        .unwrap();
        let user = &data.user[0];
        assert_eq!(user.uid, None);
        assert!(!user.is_crypted);
        let firewall = data.firewall.as_ref().unwrap();
        assert!(firewall.enabled);
        assert!(!firewall.use_system_defaults);
        assert!(data.skipx);
        assert_eq!(data.rootpw, None);

        let e = KickstartData::from_json(r#"{"bogus": 1}"#).unwrap_err();
        assert!(format!("{e:#}").contains("unknown field `bogus`"));
        assert!(KickstartData::from_json(r#"{"group": [{"name": "g", "gid": -1}]}"#).is_err());
    }

    #[test]
    fn render_users() {
        let data = KickstartData {
            rootpw: Some(RootPw {
                password: "abcdef".into(),
                is_crypted: true,
                lock: true,
            }),
            user: vec![
                User {
                    name: "user1".into(),
                    groups: vec!["foo".into(), "bar".into()],
                    homedir: Some("user1_home".into()),
                    password: "swordfish".into(),
                    shell: Some("zsh".into()),
                    uid: Some(123),
                    gecos: Some("some stuff".into()),
                    gid: Some(321),
                    ..Default::default()
                },
                User {
                    name: "user2".into(),
                    password: "laksdjaskldjhasjhd".into(),
                    is_crypted: true,
                    ..Default::default()
                },
                User {
                    name: "user3".into(),
                    lock: true,
                    ..Default::default()
                },
            ],
            group: vec![
                Group {
                    name: "group1".into(),
                    gid: Some(321),
                },
                Group {
                    name: "group3".into(),
                    gid: None,
                },
            ],
            sshkey: vec![SshKey {
                username: "user1".into(),
                key: "aaa".into(),
            }],
            ..Default::default()
        };
        let expected = indoc! { r#"
            rootpw --iscrypted --lock abcdef
            user --groups=foo,bar --homedir=user1_home --name=user1 --password=swordfish --shell=zsh --uid=123 --gecos="some stuff" --gid=321
            user --name=user2 --password=laksdjaskldjhasjhd --iscrypted
            user --name=user3 --lock
            group --name=group1 --gid=321
            group --name=group3
            sshkey --username=user1 "aaa"
        "# };
        similar_asserts::assert_eq!(data.to_string(), expected);
    }

    #[test]
    fn render_rootpw() {
        let plain = RootPw {
            password: "abcdef".into(),
            ..Default::default()
        };
        assert_eq!(plain.to_string(), "rootpw --plaintext abcdef");
        let locked = RootPw {
            lock: true,
            ..Default::default()
        };
        assert_eq!(locked.to_string(), "rootpw --lock");
    }

    #[test]
    fn render_firewall() {
        let mut fw = Firewall {
            ports: vec!["22:tcp".into()],
            trusts: vec!["eth0".into()],
            services: vec!["ssh".into()],
            ..Default::default()
        };
        assert_eq!(
            fw.to_string(),
            "firewall --enabled --port=22:tcp --trust=eth0 --service=ssh"
        );
        fw.enabled = false;
        assert_eq!(fw.to_string(), "firewall --disabled");
    }

    #[test]
    fn render_system() {
        let data = KickstartData {
            firewall: Some(Firewall {
                ports: vec!["22:tcp".into(), "8080:udp".into()],
                trusts: vec!["eth0".into(), "eth1".into()],
                services: vec!["ssh".into()],
                remove_services: vec!["cockpit".into()],
                ..Default::default()
            }),
            services: Some(Services {
                disabled: vec!["a".into(), "b".into()],
                enabled: vec!["c".into()],
            }),
            xconfig: Some(XConfig {
                startxonboot: true,
                defaultdesktop: Some("GNOME".into()),
            }),
            firstboot: Some(Firstboot::Reconfig),
            syspurpose: Some(Syspurpose {
                role: Some("FOO".into()),
                sla: Some("BAR".into()),
                usage: Some("BAZ".into()),
                addons: vec!["Foo Product".into(), "Bar Feature".into()],
            }),
            rhsm: Some(Rhsm {
                organization: Some("123".into()),
                activation_keys: vec!["key1".into()],
                connect_to_insights: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let expected = indoc! { r#"
            firewall --enabled --port=22:tcp,8080:udp --trust=eth0 --trust=eth1 --service=ssh --remove-service=cockpit
            services --disabled=a,b --enabled=c
            xconfig --startxonboot --defaultdesktop=GNOME
            firstboot --reconfig
            # Intended system purpose
            syspurpose --role="FOO" --sla="BAR" --usage="BAZ" --addon="Foo Product" --addon="Bar Feature"
            rhsm --organization="123" --activation-key="key1" --connect-to-insights
        "# };
        similar_asserts::assert_eq!(data.to_string(), expected);
    }

    #[test]
    fn empty_sections_are_omitted() {
        let data = KickstartData {
            services: Some(Services::default()),
            syspurpose: Some(Syspurpose::default()),
            ..Default::default()
        };
        assert_eq!(data.to_string(), "");
        let fw = Firewall {
            use_system_defaults: true,
            ..Default::default()
        };
        assert_eq!(fw.to_string(), "firewall --use-system-defaults");
    }
}
