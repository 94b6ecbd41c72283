use std::fmt::Display;

use camino::Utf8Path;

/// Helper to format a path for logs and error messages.
#[derive(Debug)]
pub struct PathQuotedDisplay<'a> {
    path: &'a Utf8Path,
}

impl<'a> Display for PathQuotedDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.path.as_str();
        if s.chars()
            .all(|c| matches!(c, '/' | '.' | '-' | '_') || c.is_alphanumeric())
        {
            return f.write_str(s);
        }
        match shlex::try_quote(s) {
            Ok(r) => f.write_str(&r),
            // Embedded NUL; should not happen really
            Err(_) => Err(std::fmt::Error),
        }
    }
}

impl<'a> PathQuotedDisplay<'a> {
    /// Given a path, quote it in a way that it would be parsed by a default
    /// POSIX shell. If the path has no spaces or shell meta-characters,
    /// it will be exactly the same as the input.
    pub fn new<P: AsRef<Utf8Path> + ?Sized>(path: &'a P) -> PathQuotedDisplay<'a> {
        PathQuotedDisplay {
            path: path.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unquoted() {
        for v in ["", "foo", "/foo/bar", "/foo/bar/../baz", "/etc/pki/consumer/key.pem"] {
            assert_eq!(v, format!("{}", PathQuotedDisplay::new(v)));
        }
    }

    #[test]
    fn test_quoted() {
        let cases = [
            (" ", "' '"),
            ("/some/path with spaces/", "'/some/path with spaces/'"),
            ("/foo/!/bar&", "'/foo/!/bar&'"),
        ];
        for (v, quoted) in cases {
            assert_eq!(quoted, format!("{}", PathQuotedDisplay::new(v)));
        }
    }
}
