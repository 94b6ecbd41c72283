//! Tasks creating accounts in the installed system.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::{DirBuilder, DirBuilderExt as _, Permissions, PermissionsExt as _};
use cap_std_ext::dirext::CapStdExtDirExt;

use super::structures::{GroupData, SshKeyData, UserData};
use crate::bus::SysrootExec;
use crate::kickstart::Redacted;
use crate::task::{open_sysroot, Task, TaskError, TaskIoContext};

fn argv<'a>(args: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    args.into_iter().map(ToOwned::to_owned).collect()
}

/// Set the password of `user` via `chpasswd`; the password only
/// travels on stdin.
fn set_password(
    exec: &dyn SysrootExec,
    sysroot: &Utf8Path,
    user: &str,
    password: &str,
    is_crypted: bool,
) -> Result<(), TaskError> {
    let mut cmd = argv(["chpasswd"]);
    if is_crypted {
        cmd.push("-e".into());
    }
    exec.exec(sysroot, &cmd, Some(&format!("{user}:{password}\n")))?;
    Ok(())
}

fn lock_account(exec: &dyn SysrootExec, sysroot: &Utf8Path, user: &str) -> Result<(), TaskError> {
    exec.exec(sysroot, &argv(["usermod", "-L", user]), None)?;
    Ok(())
}

/// Set the root password and lock state.
pub struct SetRootPasswordTask {
    pub(crate) sysroot: Utf8PathBuf,
    pub(crate) password: String,
    pub(crate) is_crypted: bool,
    pub(crate) lock: bool,
    pub(crate) exec: Arc<dyn SysrootExec>,
}

impl Debug for SetRootPasswordTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetRootPasswordTask")
            .field("sysroot", &self.sysroot)
            .field("password", &Redacted(&self.password))
            .field("is_crypted", &self.is_crypted)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl Task for SetRootPasswordTask {
    fn name(&self) -> &str {
        "Set root password"
    }

    fn run(&self) -> Result<(), TaskError> {
        if !self.password.is_empty() {
            set_password(
                &*self.exec,
                &self.sysroot,
                "root",
                &self.password,
                self.is_crypted,
            )?;
        }
        if self.lock {
            lock_account(&*self.exec, &self.sysroot, "root")?;
        }
        Ok(())
    }
}

/// Create groups.
#[derive(Debug)]
pub struct CreateGroupsTask {
    pub(crate) sysroot: Utf8PathBuf,
    pub(crate) groups: Vec<GroupData>,
    pub(crate) exec: Arc<dyn SysrootExec>,
}

impl Task for CreateGroupsTask {
    fn name(&self) -> &str {
        "Create groups"
    }

    fn run(&self) -> Result<(), TaskError> {
        for group in &self.groups {
            let mut cmd = argv(["groupadd"]);
            if let Some(gid) = group.gid {
                cmd.extend(["-g".to_owned(), gid.to_string()]);
            }
            cmd.push(group.name.clone());
            self.exec.exec(&self.sysroot, &cmd, None)?;
        }
        Ok(())
    }
}

/// Create user accounts, along with any supplementary groups they need.
#[derive(Debug)]
pub struct CreateUsersTask {
    pub(crate) sysroot: Utf8PathBuf,
    pub(crate) users: Vec<UserData>,
    pub(crate) exec: Arc<dyn SysrootExec>,
}

impl CreateUsersTask {
    fn useradd_argv(user: &UserData) -> Vec<String> {
        let mut cmd = argv(["useradd"]);
        if let Some(uid) = user.uid {
            cmd.extend(["-u".to_owned(), uid.to_string()]);
        }
        if let Some(gid) = user.gid {
            cmd.extend(["-g".to_owned(), gid.to_string()]);
        }
        if !user.groups.is_empty() {
            cmd.extend(["-G".to_owned(), user.groups.join(",")]);
        }
        for (opt, v) in [("-d", &user.homedir), ("-s", &user.shell), ("-c", &user.gecos)] {
            if !v.is_empty() {
                cmd.extend([opt.to_owned(), v.clone()]);
            }
        }
        cmd.push(user.name.clone());
        cmd
    }
}

impl Task for CreateUsersTask {
    fn name(&self) -> &str {
        "Create users"
    }

    fn run(&self) -> Result<(), TaskError> {
        for user in &self.users {
            for group in &user.groups {
                // -f: success if it exists already
                self.exec
                    .exec(&self.sysroot, &argv(["groupadd", "-f", group]), None)?;
            }
            self.exec
                .exec(&self.sysroot, &Self::useradd_argv(user), None)?;
            if !user.password.is_empty() {
                set_password(
                    &*self.exec,
                    &self.sysroot,
                    &user.name,
                    &user.password,
                    user.is_crypted,
                )?;
            }
            if user.lock {
                lock_account(&*self.exec, &self.sysroot, &user.name)?;
            }
        }
        Ok(())
    }
}

/// Install SSH public keys into `authorized_keys`.
#[derive(Debug)]
pub struct SetSshKeysTask {
    pub(crate) sysroot: Utf8PathBuf,
    pub(crate) ssh_keys: Vec<SshKeyData>,
    /// Used to find home directories.
    pub(crate) users: Vec<UserData>,
}

impl SetSshKeysTask {
    fn home_of(&self, username: &str) -> Utf8PathBuf {
        if username == "root" {
            return "root".into();
        }
        let homedir = self
            .users
            .iter()
            .find(|u| u.name == username && !u.homedir.is_empty())
            .map(|u| u.homedir.trim_start_matches('/').to_owned());
        homedir.map_or_else(|| Utf8Path::new("home").join(username), Utf8PathBuf::from)
    }
}

impl Task for SetSshKeysTask {
    fn name(&self) -> &str {
        "Set SSH keys"
    }

    fn run(&self) -> Result<(), TaskError> {
        if self.ssh_keys.is_empty() {
            return Ok(());
        }
        let root = open_sysroot(&self.sysroot)?;
        let mut db = DirBuilder::new();
        db.mode(0o700);
        for key in &self.ssh_keys {
            let ssh_dir = self.home_of(&key.username).join(".ssh");
            root.ensure_dir_with(&ssh_dir, &db)
                .task_context(|| format!("Creating {ssh_dir}"))?;
            let path = ssh_dir.join("authorized_keys");
            let mut contents = if root.try_exists(&path).task_context(|| format!("Querying {path}"))? {
                root.read_to_string(&path)
                    .task_context(|| format!("Reading {path}"))?
            } else {
                String::new()
            };
            if !contents.is_empty() && !contents.ends_with('\n') {
                contents.push('\n');
            }
            contents.push_str(&key.key);
            contents.push('\n');
            root.atomic_write_with_perms(&path, contents, Permissions::from_mode(0o600))
                .task_context(|| format!("Writing {path}"))?;
            tracing::debug!("Installed SSH key for {}", key.username);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::FakeExec;

    fn sysroot() -> Utf8PathBuf {
        "/mnt/sysroot".into()
    }

    #[test]
    fn root_password_via_stdin() {
        let exec = FakeExec::default();
        let task = SetRootPasswordTask {
            sysroot: sysroot(),
            password: "$6$abc".into(),
            is_crypted: true,
            lock: true,
            exec: Arc::new(exec.clone()),
        };
        task.run().unwrap();
        let calls = exec.calls.lock().unwrap().clone();
        assert_eq!(calls[0].0, ["chpasswd", "-e"]);
        assert_eq!(calls[0].1.as_deref(), Some("root:$6$abc\n"));
        assert_eq!(calls[1].0, ["usermod", "-L", "root"]);
    }

    #[test]
    fn debug_hides_passwords() {
        let task = SetRootPasswordTask {
            sysroot: sysroot(),
            password: "topsecret".into(),
            is_crypted: false,
            lock: false,
            exec: Arc::new(FakeExec::default()),
        };
        let user = UserData {
            name: "user1".into(),
            password: "topsecret".into(),
            ..Default::default()
        };
        let rendered = [
            format!("{task:?}"),
            format!("{user:?}"),
            format!("{:?}", crate::users::structures::UserStructure::from(&user)),
        ];
        for s in &rendered {
            assert!(!s.contains("topsecret"), "{s}");
            assert!(s.contains("<hidden>"), "{s}");
        }
        assert!(format!("{:?}", UserData::default()).contains("<unset>"));
    }

    #[test]
    fn create_users() {
        let exec = FakeExec::default();
        let task = CreateUsersTask {
            sysroot: sysroot(),
            users: vec![
                UserData {
                    name: "user1".into(),
                    uid: Some(123),
                    gid: None,
                    groups: vec!["wheel".into()],
                    shell: "/bin/zsh".into(),
                    gecos: "some stuff".into(),
                    password: "swordfish".into(),
                    is_crypted: false,
                    ..Default::default()
                },
                UserData {
                    name: "user3".into(),
                    lock: true,
                    ..Default::default()
                },
            ],
            exec: Arc::new(exec.clone()),
        };
        task.run().unwrap();
        assert_eq!(
            exec.argvs(),
            [
                vec!["groupadd", "-f", "wheel"],
                vec!["useradd", "-u", "123", "-G", "wheel", "-s", "/bin/zsh", "-c", "some stuff", "user1"],
                vec!["chpasswd"],
                vec!["useradd", "user3"],
                vec!["usermod", "-L", "user3"],
            ]
        );
    }

    #[test]
    fn create_groups_stops_on_failure() {
        let exec = FakeExec {
            failing: vec!["groupadd".into()],
            ..Default::default()
        };
        let task = CreateGroupsTask {
            sysroot: sysroot(),
            groups: vec![
                GroupData {
                    name: "a".into(),
                    gid: Some(321),
                },
                GroupData {
                    name: "b".into(),
                    gid: None,
                },
            ],
            exec: Arc::new(exec.clone()),
        };
        let e = task.run().unwrap_err();
        assert!(matches!(e, TaskError::Other(_)));
        assert_eq!(exec.argvs(), [vec!["groupadd", "-g", "321", "a"]]);
    }

    #[test]
    fn ssh_keys() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        std::fs::create_dir_all(root.join("root")).unwrap();
        std::fs::create_dir_all(root.join("srv/user1")).unwrap();
        std::fs::create_dir_all(root.join("srv/user1/.ssh")).unwrap();
        std::fs::write(root.join("srv/user1/.ssh/authorized_keys"), "old").unwrap();
        let task = SetSshKeysTask {
            sysroot: root.to_owned(),
            ssh_keys: vec![
                SshKeyData {
                    key: "aaa".into(),
                    username: "user1".into(),
                },
                SshKeyData {
                    key: "bbb".into(),
                    username: "root".into(),
                },
            ],
            users: vec![UserData {
                name: "user1".into(),
                homedir: "/srv/user1".into(),
                ..Default::default()
            }],
        };
        task.run().unwrap();
        let read = |p: &str| std::fs::read_to_string(root.join(p)).unwrap();
        assert_eq!(read("srv/user1/.ssh/authorized_keys"), "old\naaa\n");
        assert_eq!(read("root/.ssh/authorized_keys"), "bbb\n");
    }
}
