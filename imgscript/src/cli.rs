//! Command-line argument parsing.
//!
//! Usage:
//!   imgscript [--commands <file>]… [--no-user] [--debug] [--verbosity <n>] [--] <item>…
//!
//! Options are only recognised before the first script item, so items such
//! as `-add` or `-v` reach the interpreter untouched.  Without items the
//! script is read from standard input when it is not a terminal.

use std::path::PathBuf;

pub const USAGE: &str = "Usage: imgscript [--commands <file>]... [--no-user] [--debug] [--verbosity <n>] [--] <item>...";

/// Parsed command-line arguments.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CliArgs {
    /// Extra command files (`--commands <file>`).
    pub commands: Vec<PathBuf>,
    /// Skip the user command file (`--no-user`).
    pub no_user: bool,
    /// Debug logging on stderr (`--debug`).
    pub debug: bool,
    pub verbosity: Option<i32>,
    pub help: bool,
    /// Script items.
    pub script: Vec<String>,
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse `std::env::args()`.
pub fn parse_args() -> Result<CliArgs, String> {
    let raw: Vec<String> = std::env::args().collect();
    parse_argv(raw.get(1..).unwrap_or_default())
}

/// Parse a slice of argument strings (exposed for testing).
pub fn parse_argv(argv: &[String]) -> Result<CliArgs, String> {
    let mut args = CliArgs::default();
    let mut i = 0;

    while i < argv.len() {
        let arg = argv[i].as_str();
        match arg {
            "--" => {
                i += 1;
                break;
            }
            "-h" | "--help" => args.help = true,
            "--no-user" => args.no_user = true,
            "--debug" => args.debug = true,
            "--commands" | "--verbosity" => {
                let value = argv
                    .get(i + 1)
                    .ok_or_else(|| format!("{arg} requires an argument"))?;
                if arg == "--commands" {
                    args.commands.push(PathBuf::from(value));
                } else {
                    let v = value
                        .parse()
                        .map_err(|_| format!("invalid verbosity level: {value}"))?;
                    args.verbosity = Some(v);
                }
                i += 1;
            }
            a if a.starts_with("--") => return Err(format!("unknown option: {a}")),
            _ => break,
        }
        i += 1;
    }

    args.script = argv[i.min(argv.len())..].to_vec();
    Ok(args)
}

/// Join command-line items into script text, keeping each one a single item.
pub fn script_text(items: &[String]) -> String {
    items
        .iter()
        .map(|item| item.replace(' ', "\\ "))
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Terminal helpers ──────────────────────────────────────────────────────────

pub fn stdin_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) != 0 }
}

pub fn stderr_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDERR_FILENO) != 0 }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|&s| s.to_owned()).collect()
    }

    #[test]
    fn empty_args() {
        let a = parse_argv(&argv(&[])).unwrap();
        assert_eq!(a, CliArgs::default());
    }

    #[test]
    fn options_then_items() {
        let a = parse_argv(&argv(&["--debug", "--commands", "lib.ims", "(0)", "add", "1"])).unwrap();
        assert!(a.debug);
        assert_eq!(a.commands, vec![PathBuf::from("lib.ims")]);
        assert_eq!(a.script, argv(&["(0)", "add", "1"]));
    }

    #[test]
    fn items_may_look_like_flags() {
        let a = parse_argv(&argv(&["-v", "--debug"])).unwrap();
        assert!(!a.debug);
        assert_eq!(a.script, argv(&["-v", "--debug"]));
    }

    #[test]
    fn double_dash_ends_options() {
        let a = parse_argv(&argv(&["--no-user", "--", "--debug"])).unwrap();
        assert!(a.no_user);
        assert_eq!(a.script, argv(&["--debug"]));
    }

    #[test]
    fn verbosity_level() {
        let a = parse_argv(&argv(&["--verbosity", "-1"])).unwrap();
        assert_eq!(a.verbosity, Some(-1));
        assert!(parse_argv(&argv(&["--verbosity", "loud"])).is_err());
        assert!(parse_argv(&argv(&["--verbosity"])).is_err());
    }

    #[test]
    fn unknown_long_option() {
        assert!(parse_argv(&argv(&["--frobnicate"])).is_err());
    }

    #[test]
    fn script_text_escapes_spaces() {
        assert_eq!(script_text(&argv(&["echo", "hello world"])), "echo hello\\ world");
    }
}
