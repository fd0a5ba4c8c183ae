//! Diagnostic logging to stderr.

use std::ffi::OsStr;
use tracing_subscriber::EnvFilter;

/// Count `-v`/`--verbose` occurrences before any `--` separator.
///
/// Logging has to be up before the defaults store is loaded, which is
/// before clap sees the arguments.
pub fn verbosity<S: AsRef<OsStr>>(argv: &[S]) -> u8 {
    let mut count: u8 = 0;
    for arg in argv.iter().skip(1) {
        let Some(arg) = arg.as_ref().to_str() else {
            continue;
        };
        if arg == "--" {
            break;
        }
        if arg == "--verbose" {
            count = count.saturating_add(1);
        } else if let Some(flags) = arg.strip_prefix('-') {
            if !flags.is_empty() && flags.chars().all(|c| c == 'v') {
                count = count.saturating_add(u8::try_from(flags.len()).unwrap_or(u8::MAX));
            }
        }
    }
    count
}

/// Install the global subscriber. `RUST_LOG` wins when no `-v` is given.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = if verbosity == 0 {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    } else {
        EnvFilter::new(level)
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity() {
        assert_eq!(verbosity(&["bu", "list"]), 0);
        assert_eq!(verbosity(&["bu", "-v", "list"]), 1);
        assert_eq!(verbosity(&["bu", "launch", "-vv", "--verbose"]), 3);
        assert_eq!(verbosity(&["bu", "launch", "--", "-v"]), 0);
        assert_eq!(verbosity(&["bu", "attach", "-1"]), 0);
        assert_eq!(verbosity(&["bu", "-"]), 0);
    }

    #[test]
    fn test_verbosity_saturates() {
        let many = format!("-{}", "v".repeat(300));
        assert_eq!(verbosity(&["bu", many.as_str()]), u8::MAX);
        assert_eq!(verbosity(&["bu", "-v", many.as_str()]), u8::MAX);
    }
}
