//! Extension methods for [`Result`].

use std::fmt::Display;

/// Extension methods for results whose errors are only worth logging.
pub trait ResultExt<T, E: Display> {
    /// Return the Ok value unchanged; on error, log it and return the default value.
    fn log_err_default(self) -> T
    where
        T: Default;

    /// Return the Ok value wrapped in [`Some`]; on error, log it and return `None`.
    fn log_err_ok(self) -> Option<T>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log_err_default(self) -> T
    where
        T: Default,
    {
        match self {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("{e:#}");
                Default::default()
            }
        }
    }

    #[track_caller]
    fn log_err_ok(self) -> Option<T> {
        match self {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!("{e:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_err() {
        let r: Result<Vec<u32>, String> = Err("oops".into());
        assert!(r.log_err_default().is_empty());
        let r: Result<u32, String> = Ok(42);
        assert_eq!(r.log_err_ok(), Some(42));
        let r: Result<u32, String> = Err("oops".into());
        assert_eq!(r.log_err_ok(), None);
    }
}
