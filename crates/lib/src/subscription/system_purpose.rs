//! System purpose: role, service level, usage and addons of the system.
//!
//! The whitelist of known values ships with the subscription tooling and
//! is known to be incomplete, so matching against it is advisory.

use anyhow::Context;
use camino::Utf8Path;
use fn_error_context::context;
use instconf_utils::ResultExt;
use serde::{Deserialize, Serialize};

use crate::bus::SysrootExec;
use crate::task::{open_sysroot, TaskError, TaskIoContext};

/// Where the subscription tooling keeps the whitelist.
pub const VALID_FIELDS_FILE_PATH: &str = "/etc/rhsm/syspurpose/valid_fields.json";
/// The system purpose of a configured system, relative to its root.
pub const SYSPURPOSE_FILE: &str = "etc/rhsm/syspurpose/syspurpose.json";
const SYSPURPOSE_TOOL: &str = "usr/sbin/syspurpose";

/// Known values for the system purpose fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidFields {
    /// Known roles.
    #[serde(default, rename = "role")]
    pub roles: Vec<String>,
    /// Known service level agreements.
    #[serde(default, rename = "service_level_agreement")]
    pub slas: Vec<String>,
    /// Known usage types.
    #[serde(default, rename = "usage")]
    pub usage_types: Vec<String>,
}

impl ValidFields {
    /// Load the whitelist; a missing or unparsable file yields empty lists.
    pub fn load(path: &Utf8Path) -> Self {
        Self::try_load(path).log_err_default()
    }

    #[context("Loading system purpose valid fields from {path}")]
    fn try_load(path: &Utf8Path) -> anyhow::Result<Self> {
        let buf = match std::fs::read_to_string(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("System purpose valid fields file not found at {path}");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&buf).context("Parsing")
    }
}

/// The system purpose to apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemPurposeData {
    /// Intended role.
    pub role: String,
    /// Service level agreement.
    pub sla: String,
    /// Intended usage.
    pub usage: String,
    /// Additional layered products or features.
    pub addons: Vec<String>,
}

impl SystemPurposeData {
    /// Whether any field is set.
    pub fn is_set(&self) -> bool {
        !(self.role.is_empty() && self.sla.is_empty() && self.usage.is_empty() && self.addons.is_empty())
    }
}

/// Case and surrounding whitespace do not matter when matching.
pub fn normalize_field(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// The first entry of `valid` equal to `raw` after normalization.
pub fn match_field<'a>(raw: &str, valid: &'a [String]) -> Option<&'a str> {
    let normalized = normalize_field(raw);
    valid
        .iter()
        .find(|v| normalize_field(v) == normalized)
        .map(String::as_str)
}

/// Substitute the whitelisted spelling of `raw` if there is one; keep `raw`
/// as a custom value otherwise.
pub fn process_field(raw: &str, valid: &[String], field_name: &str) -> String {
    match match_field(raw, valid) {
        Some(m) => {
            tracing::info!("{field_name} value {raw} matched to known valid field {m}");
            m.to_owned()
        }
        None => {
            tracing::info!("Using custom {field_name} value {raw}");
            raw.to_owned()
        }
    }
}

/// The `syspurpose` arguments applying `data`.
fn syspurpose_args(data: &SystemPurposeData) -> Vec<String> {
    let mut args = Vec::new();
    for (verb, value) in [("set-role", &data.role), ("set-sla", &data.sla), ("set-usage", &data.usage)] {
        if !value.is_empty() {
            args.extend([verb.to_owned(), value.clone()]);
        }
    }
    if !data.addons.is_empty() {
        args.extend(["add".to_owned(), "addons".to_owned()]);
        args.extend(data.addons.iter().cloned());
    }
    args
}

/// Apply the system purpose by running the `syspurpose` tool in the
/// installed system.
///
/// Returns whether the tool was run.
pub fn give_the_system_purpose(
    sysroot: &Utf8Path,
    data: &SystemPurposeData,
    exec: &dyn SysrootExec,
) -> Result<bool, TaskError> {
    let args = syspurpose_args(data);
    if args.is_empty() {
        tracing::warn!("Not calling syspurpose as no fields have been provided");
        return Ok(false);
    }
    let root = open_sysroot(sysroot)?;
    let have_tool = root
        .try_exists(SYSPURPOSE_TOOL)
        .task_context(|| format!("Querying {SYSPURPOSE_TOOL}"))?;
    if !have_tool {
        tracing::error!("The syspurpose tool is missing, cannot set system purpose");
        return Ok(false);
    }
    let mut argv = vec![format!("/{SYSPURPOSE_TOOL}")];
    argv.extend(args);
    exec.exec(sysroot, &argv, None)?;
    Ok(true)
}

/// Whether the system at `sysroot` already has a system purpose.
pub fn check_system_purpose_set(sysroot: &Utf8Path) -> Result<bool, TaskError> {
    open_sysroot(sysroot)?
        .try_exists(SYSPURPOSE_FILE)
        .task_context(|| format!("Querying {SYSPURPOSE_FILE}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use camino::Utf8PathBuf;
    use indoc::indoc;

    use super::*;
    use crate::bus::tests::FakeExec;

    pub(crate) const VALID_FIELDS_JSON: &str = indoc! { r#"
        {
            "role": ["AAA Desktop", "BBB Server", "CCC workstation", "DDD super hypernode"],
            "service_level_agreement": ["Hyper", "Super", "Reasonable Effort"],
            "usage": ["Safe", "Cookie Factory", "Apocalypse Recovery"]
        }
    "# };

    fn v(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn load_valid_fields() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(td.path().join("valid_fields.json")).unwrap();
        assert_eq!(ValidFields::load(&path), ValidFields::default());

        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(ValidFields::load(&path), ValidFields::default());

        std::fs::write(&path, VALID_FIELDS_JSON).unwrap();
        let fields = ValidFields::load(&path);
        assert_eq!(
            fields.roles,
            ["AAA Desktop", "BBB Server", "CCC workstation", "DDD super hypernode"]
        );
        assert_eq!(fields.slas, ["Hyper", "Super", "Reasonable Effort"]);
        assert_eq!(fields.usage_types, ["Safe", "Cookie Factory", "Apocalypse Recovery"]);
    }

    #[test]
    fn normalize() {
        assert_eq!(normalize_field("aaa"), "aaa");
        assert_eq!(normalize_field("AAA"), "aaa");
        assert_eq!(normalize_field(" AAA "), "aaa");
        assert_eq!(normalize_field(" AAA BBB "), "aaa bbb");
        assert_eq!(normalize_field(" AbC deF "), "abc def");
    }

    #[test]
    fn matching() {
        assert_eq!(match_field("A", &v(&["B"])), None);
        assert_eq!(match_field("A-B", &v(&["A B"])), None);
        assert_eq!(match_field("A_B", &v(&["A B"])), None);
        assert_eq!(match_field("A_B", &v(&["A-B"])), None);

        assert_eq!(match_field("a", &v(&["a"])), Some("a"));
        assert_eq!(match_field("A", &v(&["a"])), Some("a"));
        assert_eq!(match_field("a", &v(&["A"])), Some("A"));
        assert_eq!(match_field(" a ", &v(&["A"])), Some("A"));
        assert_eq!(match_field("a", &v(&[" A "])), Some(" A "));
        assert_eq!(match_field("a B cd ", &v(&["A b CD"])), Some("A b CD"));

        assert_eq!(match_field("A", &v(&["B", "c", "def", "A"])), Some("A"));
        assert_eq!(match_field("A", &v(&["B", "c", "def", "A", "z", "A"])), Some("A"));
        assert_eq!(match_field("a", &v(&["A", "A"])), Some("A"));
        assert_eq!(match_field("foo BAR", &v(&["foo Bar", "foo ar"])), Some("foo Bar"));
    }

    #[test]
    fn process() {
        let roles = v(&["AAA Desktop", "BBB Server"]);
        assert_eq!(process_field(" aaa desktop", &roles, "role"), "AAA Desktop");
        assert_eq!(process_field("My Custom Role", &roles, "role"), "My Custom Role");
    }

    fn sysroot_with_tool() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(td.path().join("usr/sbin")).unwrap();
        std::fs::write(td.path().join(SYSPURPOSE_TOOL), "").unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        (td, root)
    }

    #[test]
    fn give_purpose() {
        let (_td, root) = sysroot_with_tool();
        let exec = FakeExec::default();
        let data = SystemPurposeData {
            role: "foo".into(),
            sla: "bar".into(),
            usage: "baz".into(),
            addons: v(&["a", "b", "c"]),
        };
        assert!(give_the_system_purpose(&root, &data, &exec).unwrap());
        assert_eq!(
            exec.argvs(),
            [vec![
                "/usr/sbin/syspurpose",
                "set-role",
                "foo",
                "set-sla",
                "bar",
                "set-usage",
                "baz",
                "add",
                "addons",
                "a",
                "b",
                "c"
            ]]
        );
    }

    #[test]
    fn give_partial_purpose() {
        let (_td, root) = sysroot_with_tool();
        let exec = FakeExec::default();
        let data = SystemPurposeData {
            sla: "Reasonable Effort".into(),
            ..Default::default()
        };
        give_the_system_purpose(&root, &data, &exec).unwrap();
        assert_eq!(
            exec.argvs(),
            [vec!["/usr/sbin/syspurpose", "set-sla", "Reasonable Effort"]]
        );
    }

    #[test]
    fn no_purpose_or_no_tool() {
        let exec = FakeExec::default();
        let (_td, root) = sysroot_with_tool();
        assert!(!give_the_system_purpose(&root, &SystemPurposeData::default(), &exec).unwrap());

        let td = tempfile::tempdir().unwrap();
        let bare = Utf8Path::from_path(td.path()).unwrap();
        let data = SystemPurposeData {
            role: "foo".into(),
            ..Default::default()
        };
        assert!(!give_the_system_purpose(bare, &data, &exec).unwrap());
        assert!(exec.argvs().is_empty());
    }

    #[test]
    fn purpose_set() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        assert!(!check_system_purpose_set(root).unwrap());
        std::fs::create_dir_all(root.join("etc/rhsm/syspurpose")).unwrap();
        std::fs::write(root.join(SYSPURPOSE_FILE), "{}").unwrap();
        assert!(check_system_purpose_set(root).unwrap());
    }
}
