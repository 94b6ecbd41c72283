//! # Users, groups and the root account
//!
//! Holds the accounts to create in the installed system, the SSH keys to
//! install for them, and the root password and lock state.

use std::sync::Arc;

use camino::Utf8Path;

use crate::bus::SysrootExec;
use crate::kickstart::{self, KickstartData, KickstartError};
use crate::module::ConfigurationModule;
use crate::observable::{Observed, Properties};
use crate::task::Task;

mod installation;
pub mod structures;

pub use installation::{CreateGroupsTask, CreateUsersTask, SetRootPasswordTask, SetSshKeysTask};
use structures::{
    GroupData, GroupStructure, InvalidIdError, SshKeyData, UserData, UserStructure,
};

/// Property names emitted by [`UsersModule`].
#[allow(missing_docs)]
pub mod props {
    pub const USERS: &str = "Users";
    pub const GROUPS: &str = "Groups";
    pub const SSH_KEYS: &str = "SshKeys";
    pub const IS_ROOT_PASSWORD_SET: &str = "IsRootPasswordSet";
    pub const IS_ROOT_PASSWORD_CRYPTED: &str = "IsRootPasswordCrypted";
    pub const ROOT_PASSWORD: &str = "RootPassword";
    pub const IS_ROOT_ACCOUNT_LOCKED: &str = "IsRootAccountLocked";
    pub const IS_ROOTPW_KICKSTARTED: &str = "IsRootpwKickstarted";
}

const ROOT_PASSWORD_PROPS: &[&str] = &[
    props::IS_ROOT_PASSWORD_SET,
    props::ROOT_PASSWORD,
    props::IS_ROOT_PASSWORD_CRYPTED,
];

#[derive(Default)]
struct State {
    users: Vec<UserData>,
    groups: Vec<GroupData>,
    ssh_keys: Vec<SshKeyData>,
    root_password: String,
    root_password_is_crypted: bool,
    root_account_locked: bool,
    rootpw_seen: bool,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("users", &self.users)
            .field("groups", &self.groups)
            .field("ssh_keys", &self.ssh_keys)
            .field("root_password", &kickstart::Redacted(&self.root_password))
            .field("root_password_is_crypted", &self.root_password_is_crypted)
            .field("root_account_locked", &self.root_account_locked)
            .field("rootpw_seen", &self.rootpw_seen)
            .finish()
    }
}

/// The users configuration module.
#[derive(Debug)]
pub struct UsersModule {
    state: Observed<State>,
    exec: Arc<dyn SysrootExec>,
}

impl UsersModule {
    /// Create the module; `exec` runs the account tools in the target system.
    pub fn new(exec: Arc<dyn SysrootExec>) -> Self {
        Self {
            state: Observed::new(State::default()),
            exec,
        }
    }

    /// The users to create.
    pub fn users(&self) -> Vec<UserData> {
        self.state.get(|s| s.users.clone())
    }

    /// Replace the users to create.
    pub fn set_users(&self, users: Vec<UserData>) {
        let n = users.len();
        self.state.update(&[props::USERS], |s| s.users = users);
        tracing::debug!("A new user list has been set ({n} users).");
    }

    /// The users in their bus form.
    pub fn user_structures(&self) -> Vec<UserStructure> {
        self.state
            .get(|s| s.users.iter().map(UserStructure::from).collect())
    }

    /// Replace the users from their bus form. Nothing changes if any
    /// entry carries an invalid id.
    pub fn set_user_structures(&self, users: Vec<UserStructure>) -> Result<(), InvalidIdError> {
        let users = users
            .into_iter()
            .map(UserData::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        self.set_users(users);
        Ok(())
    }

    /// The groups to create.
    pub fn groups(&self) -> Vec<GroupData> {
        self.state.get(|s| s.groups.clone())
    }

    /// Replace the groups to create.
    pub fn set_groups(&self, groups: Vec<GroupData>) {
        tracing::debug!("A new group list has been set: {groups:?}");
        self.state.update(&[props::GROUPS], |s| s.groups = groups);
    }

    /// The groups in their bus form.
    pub fn group_structures(&self) -> Vec<GroupStructure> {
        self.state
            .get(|s| s.groups.iter().map(GroupStructure::from).collect())
    }

    /// Replace the groups from their bus form.
    pub fn set_group_structures(&self, groups: Vec<GroupStructure>) -> Result<(), InvalidIdError> {
        let groups = groups
            .into_iter()
            .map(GroupData::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        self.set_groups(groups);
        Ok(())
    }

    /// The SSH keys to install.
    pub fn ssh_keys(&self) -> Vec<SshKeyData> {
        self.state.get(|s| s.ssh_keys.clone())
    }

    /// Replace the SSH keys to install.
    pub fn set_ssh_keys(&self, ssh_keys: Vec<SshKeyData>) {
        let n = ssh_keys.len();
        self.state.update(&[props::SSH_KEYS], |s| s.ssh_keys = ssh_keys);
        tracing::debug!("A new ssh key list has been set ({n} keys).");
    }

    /// The root password, possibly crypted.
    pub fn root_password(&self) -> String {
        self.state.get(|s| s.root_password.clone())
    }

    /// Whether the root password is crypted.
    pub fn is_root_password_crypted(&self) -> bool {
        self.state.get(|s| s.root_password_is_crypted)
    }

    /// Whether a root password is set.
    pub fn is_root_password_set(&self) -> bool {
        self.state.get(|s| !s.root_password.is_empty())
    }

    /// Set the root password.
    pub fn set_root_password(&self, password: &str, crypted: bool) {
        self.state.update(ROOT_PASSWORD_PROPS, |s| {
            s.root_password = password.to_owned();
            s.root_password_is_crypted = crypted;
        });
        tracing::debug!("Root password set.");
    }

    /// Set an already crypted root password.
    pub fn set_crypted_root_password(&self, password: &str) {
        self.set_root_password(password, true)
    }

    /// Clear any set root password.
    pub fn clear_root_password(&self) {
        self.state.update(ROOT_PASSWORD_PROPS, |s| {
            s.root_password.clear();
            s.root_password_is_crypted = false;
        });
        tracing::debug!("Root password cleared.");
    }

    /// Whether the root account is locked.
    pub fn is_root_account_locked(&self) -> bool {
        self.state.get(|s| s.root_account_locked)
    }

    /// Lock or unlock the root account.
    pub fn set_root_account_locked(&self, locked: bool) {
        self.state
            .update(&[props::IS_ROOT_ACCOUNT_LOCKED], |s| s.root_account_locked = locked);
        if locked {
            tracing::debug!("Root account has been locked.");
        } else {
            tracing::debug!("Root account has been unlocked.");
        }
    }

    /// Whether the root password came from the installation description.
    pub fn is_rootpw_kickstarted(&self) -> bool {
        self.state.get(|s| s.rootpw_seen)
    }

    /// Mark the root password as coming from the installation description.
    pub fn set_rootpw_kickstarted(&self, seen: bool) {
        self.state
            .update(&[props::IS_ROOTPW_KICKSTARTED], |s| s.rootpw_seen = seen);
        tracing::debug!("Root password considered seen in kickstart: {seen}.");
    }
}

fn require(value: &str, directive: &'static str, option: &'static str) -> Result<(), KickstartError> {
    if value.is_empty() {
        return Err(KickstartError::Missing { directive, option });
    }
    Ok(())
}

impl ConfigurationModule for UsersModule {
    fn name(&self) -> &'static str {
        "users"
    }

    fn properties(&self) -> &Properties {
        self.state.properties()
    }

    fn import(&self, data: &KickstartData) -> Result<(), KickstartError> {
        tracing::debug!("Processing kickstart data...");
        for user in &data.user {
            require(&user.name, "user", "--name")?;
        }
        for group in &data.group {
            require(&group.name, "group", "--name")?;
        }
        for key in &data.sshkey {
            require(&key.username, "sshkey", "--username")?;
        }

        let rootpw = data.rootpw.clone().unwrap_or_default();
        self.set_root_password(&rootpw.password, rootpw.is_crypted);
        self.set_root_account_locked(rootpw.lock);
        self.set_rootpw_kickstarted(data.rootpw.is_some());
        self.set_users(data.user.iter().map(UserData::from).collect());
        self.set_groups(data.group.iter().map(GroupData::from).collect());
        self.set_ssh_keys(data.sshkey.iter().map(SshKeyData::from).collect());
        Ok(())
    }

    fn export(&self, data: &mut KickstartData) {
        tracing::debug!("Generating kickstart data...");
        self.state.get(|s| {
            if s.rootpw_seen || !s.root_password.is_empty() || s.root_account_locked {
                data.rootpw = Some(kickstart::RootPw {
                    password: s.root_password.clone(),
                    is_crypted: s.root_password_is_crypted,
                    lock: s.root_account_locked,
                });
            }
            data.user = s.users.iter().map(kickstart::User::from).collect();
            data.group = s.groups.iter().map(kickstart::Group::from).collect();
            data.sshkey = s.ssh_keys.iter().map(kickstart::SshKey::from).collect();
        })
    }

    fn install_with_tasks(&self, sysroot: &Utf8Path) -> Vec<Box<dyn Task>> {
        self.state.get(|s| {
            vec![
                Box::new(SetRootPasswordTask {
                    sysroot: sysroot.to_owned(),
                    password: s.root_password.clone(),
                    is_crypted: s.root_password_is_crypted,
                    lock: s.root_account_locked,
                    exec: Arc::clone(&self.exec),
                }) as Box<dyn Task>,
                Box::new(CreateGroupsTask {
                    sysroot: sysroot.to_owned(),
                    groups: s.groups.clone(),
                    exec: Arc::clone(&self.exec),
                }),
                Box::new(CreateUsersTask {
                    sysroot: sysroot.to_owned(),
                    users: s.users.clone(),
                    exec: Arc::clone(&self.exec),
                }),
                Box::new(SetSshKeysTask {
                    sysroot: sysroot.to_owned(),
                    ssh_keys: s.ssh_keys.clone(),
                    users: s.users.clone(),
                }),
            ]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::FakeExec;
    use crate::observable::tests::Recorder;

    fn module() -> UsersModule {
        UsersModule::new(Arc::new(FakeExec::default()))
    }

    #[test]
    fn defaults() {
        let m = module();
        assert!(m.users().is_empty());
        assert!(m.groups().is_empty());
        assert!(m.ssh_keys().is_empty());
        assert!(!m.is_root_password_set());
        assert!(!m.is_root_password_crypted());
        assert!(!m.is_root_account_locked());
        assert!(!m.is_rootpw_kickstarted());
    }

    #[test]
    fn root_password() {
        let m = module();
        let rec = Recorder::attach(m.properties());
        m.set_crypted_root_password("abcef");
        assert_eq!(m.root_password(), "abcef");
        assert!(m.is_root_password_crypted());
        assert!(m.is_root_password_set());
        assert_eq!(
            rec.take(),
            ["IsRootPasswordSet", "RootPassword", "IsRootPasswordCrypted"]
        );

        m.clear_root_password();
        assert_eq!(m.root_password(), "");
        assert!(!m.is_root_password_crypted());
        assert!(!m.is_root_password_set());

        m.set_root_account_locked(true);
        assert!(m.is_root_account_locked());
        assert_eq!(rec.take().last().unwrap(), "IsRootAccountLocked");
    }

    #[test]
    fn structures_reject_invalid_ids() {
        let m = module();
        let rec = Recorder::attach(m.properties());
        let mut bad = UserStructure::from(&UserData::default());
        bad.uid = -500;
        assert!(m.set_user_structures(vec![bad]).is_err());
        assert!(m.users().is_empty());
        assert!(rec.take().is_empty());

        m.set_group_structures(vec![GroupStructure {
            name: "wheel".into(),
            gid: -1,
        }])
        .unwrap();
        assert_eq!(m.groups()[0].gid, None);
        assert_eq!(m.group_structures()[0].gid, -1);
    }

    #[test]
    fn kickstart_round_trip() {
        let input = KickstartData::from_json(
            r#"{
                "rootpw": {"password": "abcdef", "is-crypted": true},
                "user": [
                    {"name": "user1", "groups": ["a", "b"], "homedir": "user1_home", "password": "foo",
                     "shell": "ksh", "uid": 123, "gecos": "baz", "gid": 345},
                    {"name": "user3", "lock": true}
                ],
                "group": [{"name": "group1", "gid": 321}, {"name": "group3"}],
                "sshkey": [{"username": "user1", "key": "aaa"}]
            }"#,
        )
        .unwrap();
        let m = module();
        m.import(&input).unwrap();
        assert!(m.is_rootpw_kickstarted());
        assert_eq!(m.groups()[1].gid, None);
        assert_eq!(m.users()[1].uid, None);

        let mut out = KickstartData::default();
        m.export(&mut out);
        assert_eq!(out, input);

        let again = module();
        again.import(&out).unwrap();
        assert_eq!(again.users(), m.users());
        assert_eq!(again.groups(), m.groups());
        assert_eq!(again.ssh_keys(), m.ssh_keys());
        assert_eq!(again.root_password(), m.root_password());
    }

    #[test]
    fn rootpw_not_kickstarted() {
        let m = module();
        m.import(&KickstartData::default()).unwrap();
        assert!(!m.is_rootpw_kickstarted());
        let mut out = KickstartData::default();
        m.export(&mut out);
        assert_eq!(out.rootpw, None);
        assert_eq!(out.to_string(), "");
    }

    #[test]
    fn import_requires_names() {
        let data = KickstartData {
            sshkey: vec![kickstart::SshKey {
                username: String::new(),
                key: "aaa".into(),
            }],
            ..Default::default()
        };
        let e = module().import(&data).unwrap_err();
        assert_eq!(e.to_string(), "sshkey: --username is required");
    }

    #[test]
    fn tasks_snapshot_state() {
        let m = module();
        m.set_groups(vec![GroupData {
            name: "g".into(),
            gid: None,
        }]);
        let tasks = m.install_with_tasks(Utf8Path::new("/mnt/sysroot"));
        let names = tasks.iter().map(|t| t.name()).collect::<Vec<_>>();
        assert_eq!(
            names,
            ["Set root password", "Create groups", "Create users", "Set SSH keys"]
        );
        m.set_groups(Vec::new());
        assert!(format!("{:?}", tasks[1]).contains("name: \"g\""));
    }
}
