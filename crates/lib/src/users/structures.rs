//! User, group and SSH key records.
//!
//! [`UserData`] and [`GroupData`] are what the module stores. The bus
//! carries ids as plain signed integers with `-1` meaning "not set";
//! [`UserStructure`] and [`GroupStructure`] are that wire form, and the
//! conversions here are the only place the sentinel exists.

use std::fmt::{self, Debug, Formatter};

use serde::{Deserialize, Serialize};

use crate::kickstart::{self, Redacted};

/// The bus encoding of an absent uid or gid.
pub const ID_NOT_SET: i64 = -1;

/// A uid or gid that can not be represented.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {field} {value}")]
pub struct InvalidIdError {
    /// `uid` or `gid`.
    pub field: &'static str,
    /// The rejected value.
    pub value: i64,
}

fn id_to_bus(id: Option<u32>) -> i64 {
    id.map_or(ID_NOT_SET, i64::from)
}

fn id_from_bus(field: &'static str, value: i64) -> Result<Option<u32>, InvalidIdError> {
    if value == ID_NOT_SET {
        return Ok(None);
    }
    u32::try_from(value)
        .map(Some)
        .map_err(|_| InvalidIdError { field, value })
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_owned())
}

/// A user account to create.
#[derive(Clone, PartialEq, Eq)]
pub struct UserData {
    /// User name.
    pub name: String,
    /// Numeric user id, or the next free one.
    pub uid: Option<u32>,
    /// Supplementary groups; missing ones are created.
    pub groups: Vec<String>,
    /// Numeric id of the primary group, or the next free one.
    pub gid: Option<u32>,
    /// Home directory; empty for the system default.
    pub homedir: String,
    /// The password; empty leaves the account without one.
    pub password: String,
    /// Whether `password` is already crypted.
    pub is_crypted: bool,
    /// Lock the account.
    pub lock: bool,
    /// Login shell; empty for the system default.
    pub shell: String,
    /// The GECOS field.
    pub gecos: String,
}

impl Debug for UserData {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserData")
            .field("name", &self.name)
            .field("uid", &self.uid)
            .field("groups", &self.groups)
            .field("gid", &self.gid)
            .field("homedir", &self.homedir)
            .field("password", &Redacted(&self.password))
            .field("is_crypted", &self.is_crypted)
            .field("lock", &self.lock)
            .field("shell", &self.shell)
            .field("gecos", &self.gecos)
            .finish()
    }
}

impl Default for UserData {
    fn default() -> Self {
        Self {
            name: String::new(),
            uid: None,
            groups: Vec::new(),
            gid: None,
            homedir: String::new(),
            password: String::new(),
            is_crypted: true,
            lock: false,
            shell: String::new(),
            gecos: String::new(),
        }
    }
}

impl From<&kickstart::User> for UserData {
    fn from(user: &kickstart::User) -> Self {
        Self {
            name: user.name.clone(),
            uid: user.uid,
            groups: user.groups.clone(),
            gid: user.gid,
            homedir: user.homedir.clone().unwrap_or_default(),
            password: user.password.clone(),
            is_crypted: user.is_crypted,
            lock: user.lock,
            shell: user.shell.clone().unwrap_or_default(),
            gecos: user.gecos.clone().unwrap_or_default(),
        }
    }
}

impl From<&UserData> for kickstart::User {
    fn from(user: &UserData) -> Self {
        Self {
            name: user.name.clone(),
            groups: user.groups.clone(),
            homedir: non_empty(&user.homedir),
            password: user.password.clone(),
            is_crypted: user.is_crypted,
            lock: user.lock,
            shell: non_empty(&user.shell),
            gecos: non_empty(&user.gecos),
            uid: user.uid,
            gid: user.gid,
        }
    }
}

/// A group to create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupData {
    /// Group name.
    pub name: String,
    /// Numeric group id, or the next free one.
    pub gid: Option<u32>,
}

impl From<&kickstart::Group> for GroupData {
    fn from(group: &kickstart::Group) -> Self {
        Self {
            name: group.name.clone(),
            gid: group.gid,
        }
    }
}

impl From<&GroupData> for kickstart::Group {
    fn from(group: &GroupData) -> Self {
        Self {
            name: group.name.clone(),
            gid: group.gid,
        }
    }
}

/// An SSH public key to install for a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKeyData {
    /// The public key.
    pub key: String,
    /// Whose key it is.
    pub username: String,
}

impl From<&kickstart::SshKey> for SshKeyData {
    fn from(k: &kickstart::SshKey) -> Self {
        Self {
            key: k.key.clone(),
            username: k.username.clone(),
        }
    }
}

impl From<&SshKeyData> for kickstart::SshKey {
    fn from(k: &SshKeyData) -> Self {
        Self {
            username: k.username.clone(),
            key: k.key.clone(),
        }
    }
}

/// The bus form of [`UserData`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct UserStructure {
    pub name: String,
    pub uid: i64,
    pub groups: Vec<String>,
    pub gid: i64,
    pub homedir: String,
    pub password: String,
    pub is_crypted: bool,
    pub lock: bool,
    pub shell: String,
    pub gecos: String,
}

impl Debug for UserStructure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserStructure")
            .field("name", &self.name)
            .field("uid", &self.uid)
            .field("groups", &self.groups)
            .field("gid", &self.gid)
            .field("homedir", &self.homedir)
            .field("password", &Redacted(&self.password))
            .field("is_crypted", &self.is_crypted)
            .field("lock", &self.lock)
            .field("shell", &self.shell)
            .field("gecos", &self.gecos)
            .finish()
    }
}

impl From<&UserData> for UserStructure {
    fn from(user: &UserData) -> Self {
        Self {
            name: user.name.clone(),
            uid: id_to_bus(user.uid),
            groups: user.groups.clone(),
            gid: id_to_bus(user.gid),
            homedir: user.homedir.clone(),
            password: user.password.clone(),
            is_crypted: user.is_crypted,
            lock: user.lock,
            shell: user.shell.clone(),
            gecos: user.gecos.clone(),
        }
    }
}

impl TryFrom<UserStructure> for UserData {
    type Error = InvalidIdError;

    fn try_from(user: UserStructure) -> Result<Self, Self::Error> {
        Ok(Self {
            uid: id_from_bus("uid", user.uid)?,
            gid: id_from_bus("gid", user.gid)?,
            name: user.name,
            groups: user.groups,
            homedir: user.homedir,
            password: user.password,
            is_crypted: user.is_crypted,
            lock: user.lock,
            shell: user.shell,
            gecos: user.gecos,
        })
    }
}

/// The bus form of [`GroupData`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct GroupStructure {
    pub name: String,
    pub gid: i64,
}

impl From<&GroupData> for GroupStructure {
    fn from(group: &GroupData) -> Self {
        Self {
            name: group.name.clone(),
            gid: id_to_bus(group.gid),
        }
    }
}

impl TryFrom<GroupStructure> for GroupData {
    type Error = InvalidIdError;

    fn try_from(group: GroupStructure) -> Result<Self, Self::Error> {
        Ok(Self {
            gid: id_from_bus("gid", group.gid)?,
            name: group.name,
        })
    }
}
