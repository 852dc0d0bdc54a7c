#![deny(unsafe_code)]

//! # Overview
//!
//! Structured logging setup shared by every `segblock` binary. A single
//! [`Verbosity`] level, derived from the CLI's `-v`/`-vv` flags, is mapped to
//! a `tracing` filter and installed once at process entry via [`init`].
//!
//! The engine crate never configures its own subscriber; it only emits
//! `tracing` events, so tests can run without a global subscriber installed.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Verbosity levels recognised by every `segblock` binary.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Verbosity {
    /// Default: warnings and errors only.
    #[default]
    Quiet,
    /// `-v`: informational run-mode transitions are logged.
    Verbose,
    /// `-vv`: per-buffer debug detail is logged as well.
    VeryVerbose,
}

impl Verbosity {
    /// Builds a verbosity level from a `-v` occurrence count.
    #[must_use]
    pub const fn from_count(count: u8) -> Self {
        match count {
            0 => Self::Quiet,
            1 => Self::Verbose,
            _ => Self::VeryVerbose,
        }
    }

    fn filter_directive(self) -> &'static str {
        match self {
            Self::Quiet => "warn",
            Self::Verbose => "info",
            Self::VeryVerbose => "debug",
        }
    }
}

static INIT: Once = Once::new();

/// Installs a process-wide `tracing` subscriber for the given verbosity.
///
/// Safe to call more than once; only the first call takes effect, matching
/// the behaviour of `tracing`'s global dispatcher (a second subscriber can
/// never replace the first one).
pub fn init(verbosity: Verbosity) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(verbosity.filter_directive()));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_count_maps_occurrences_to_levels() {
        assert_eq!(Verbosity::from_count(0), Verbosity::Quiet);
        assert_eq!(Verbosity::from_count(1), Verbosity::Verbose);
        assert_eq!(Verbosity::from_count(2), Verbosity::VeryVerbose);
        assert_eq!(Verbosity::from_count(9), Verbosity::VeryVerbose);
    }

    #[test]
    fn filter_directives_escalate_with_verbosity() {
        assert_eq!(Verbosity::Quiet.filter_directive(), "warn");
        assert_eq!(Verbosity::Verbose.filter_directive(), "info");
        assert_eq!(Verbosity::VeryVerbose.filter_directive(), "debug");
    }
}
