//! Helpers intended for [`std::process::Command`].

use std::process::Command;

use anyhow::{Context, Result};

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, inheriting stdout; stderr is captured
    /// and included in the error if the command fails.
    fn run(&mut self) -> Result<()>;

    /// Render the command the way a POSIX shell would read it.
    fn to_string_pretty(&self) -> String;
}

/// Format the last few lines of captured stderr for an error message.
fn stderr_tail(buf: &[u8]) -> String {
    const MAX_LINES: usize = 20;
    let s = String::from_utf8_lossy(buf);
    let lines = s.lines().collect::<Vec<_>>();
    let start = lines.len().saturating_sub(MAX_LINES);
    lines[start..].join("\n")
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run(&mut self) -> Result<()> {
        let cmdline = self.to_string_pretty();
        let output = self
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {cmdline}"))?;
        if !output.status.success() {
            let stderr = stderr_tail(&output.stderr);
            anyhow::bail!("Subprocess failed: {cmdline}: {}\n{stderr}", output.status);
        }
        Ok(())
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|arg| {
                let arg = arg.to_string_lossy();
                shlex::try_quote(&arg)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| arg.into_owned())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_run_ext() {
        Command::new("true").run().unwrap();
        assert!(Command::new("false").run().is_err());
        let e = Command::new("/bin/sh")
            .args(["-c", "echo expected-this-oops-message 1>&2; exit 1"])
            .run()
            .err()
            .unwrap();
        similar_asserts::assert_eq!(
            e.to_string(),
            "Subprocess failed: /bin/sh -c 'echo expected-this-oops-message 1>&2; exit 1': exit status: 1\nexpected-this-oops-message"
        );
    }

    #[test]
    fn pretty() {
        let mut c = Command::new("systemctl");
        c.args(["--root=/mnt/sys root", "enable", "sshd.service"]);
        assert_eq!(
            c.to_string_pretty(),
            "systemctl '--root=/mnt/sys root' enable sshd.service"
        );
    }
}
