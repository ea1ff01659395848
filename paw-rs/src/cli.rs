//! Command-line argument parsing.
//!
//! Usage:
//!   paw [OPTIONS] [SCRIPT] [ARGS]...
//!   paw -e <CODE> [ARGS]...

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clap::Parser;
use directories::{BaseDirs, ProjectDirs};

use crate::config::{parse_timeout_ms, Config, InitScript};
use crate::error::ConfigError;
use crate::script::value::Value;

/// Name of the per-user init script in the platform config directory.
pub const INIT_FILE: &str = "init.paw";

/// Name of the dotfile searched in the home and current directories.
pub const RC_FILE: &str = ".pawrc";

// ── Public types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "paw", version, about = "Run paw command scripts")]
pub struct CliArgs {
    /// Code to run instead of a script file.
    #[arg(short = 'e', long = "eval", value_name = "CODE")]
    pub eval: Option<String>,

    /// Init script to run first (default: search the usual places).
    #[arg(short = 'f', long = "init", value_name = "FILE", conflicts_with = "no_init")]
    pub init: Option<PathBuf>,

    /// Do not run any init script.
    #[arg(short = 'n', long = "no-init")]
    pub no_init: bool,

    /// Library directory, visible to scripts as `~PAWLIB`.
    #[arg(short = 'L', long = "lib", value_name = "DIR")]
    pub lib: Option<PathBuf>,

    /// Debug logging.
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Token deadline in milliseconds; 0 disables it.
    #[arg(long = "timeout-ms", value_name = "MS")]
    pub timeout_ms: Option<String>,

    /// Script file; `-` or nothing reads statements from stdin.
    #[arg(value_name = "SCRIPT")]
    pub script: Option<PathBuf>,

    /// Arguments bound to `$1..$n` and `$@`.
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// What the binary should run once set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Eval(String),
    File(PathBuf),
    Stdin,
}

impl CliArgs {
    /// With `-e` the first positional is an argument, not a script.
    pub fn mode(&self) -> Mode {
        match (&self.eval, &self.script) {
            (Some(code), _) => Mode::Eval(code.clone()),
            (None, Some(path)) if path.as_os_str() != "-" => Mode::File(path.clone()),
            (None, _) => Mode::Stdin,
        }
    }

    /// Positional arguments for the root activation.
    pub fn script_args(&self) -> Vec<Value> {
        let leading = match (&self.eval, &self.script) {
            (Some(_), Some(first)) => Some(first.display().to_string()),
            _ => None,
        };
        leading
            .into_iter()
            .chain(self.args.iter().cloned())
            .map(|a| arg_value(&a))
            .collect()
    }

    /// Layer the flags over `config`.
    pub fn apply(&self, config: &mut Config) -> Result<(), ConfigError> {
        if let Some(raw) = &self.timeout_ms {
            config.engine.token_timeout = parse_timeout_ms("--timeout-ms", raw)?;
        }
        if let Some(lib) = &self.lib {
            config.lib_dir = Some(lib.clone());
        }
        config.init = match (&self.init, self.no_init) {
            (_, true) => InitScript::Skip,
            (Some(path), false) => InitScript::Explicit(path.clone()),
            (None, false) => config.init.clone(),
        };
        Ok(())
    }
}

/// Numbers become `Int`/`Float`, anything else a string.
fn arg_value(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Int(n);
    }
    match raw.parse::<f64>() {
        Ok(x) if x.is_finite() => Value::Float(x),
        _ => Value::Str(raw.to_owned()),
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse a slice of argument strings (exposed for testing).
pub fn parse_argv<I, S>(argv: I) -> Result<CliArgs, clap::Error>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString> + Clone,
{
    let argv = argv.into_iter().map(Into::<OsString>::into);
    CliArgs::try_parse_from(std::iter::once(OsString::from("paw")).chain(argv))
}

// ── File lookup ───────────────────────────────────────────────────────────────

/// Find the user's init script: `<config dir>/init.paw`, then `~/.pawrc`,
/// then `./.pawrc`.
pub fn find_user_config() -> Option<PathBuf> {
    let project = ProjectDirs::from("", "", "paw").map(|d| d.config_dir().join(INIT_FILE));
    let home = BaseDirs::new().map(|d| d.home_dir().join(RC_FILE));
    [project, home, Some(PathBuf::from(".").join(RC_FILE))]
        .into_iter()
        .flatten()
        .find(|p| p.is_file())
}

/// Determine the library directory.
///
/// Priority: configured directory (`-L` or `PAW_LIB`) → `lib/paw` next to
/// the workspace during development → the platform data directory.
pub fn resolve_libdir(configured: Option<&Path>) -> PathBuf {
    if let Some(d) = configured {
        return d.to_path_buf();
    }
    if let Ok(manifest) = std::env::var("CARGO_MANIFEST_DIR") {
        let dev = Path::new(&manifest)
            .parent()
            .unwrap_or(Path::new("."))
            .join("lib/paw");
        if dev.is_dir() {
            return dev;
        }
    }
    ProjectDirs::from("", "", "paw")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/usr/local/lib/paw"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn script_with_args() {
        let a = parse_argv(["run.paw", "1", "two", "-3"]).unwrap();
        assert_eq!(a.mode(), Mode::File(PathBuf::from("run.paw")));
        assert_eq!(
            a.script_args(),
            vec![Value::Int(1), Value::Str("two".into()), Value::Int(-3)]
        );
    }

    #[test]
    fn eval_takes_positionals_as_args() {
        let a = parse_argv(["-e", "echo $1", "hello", "2.5"]).unwrap();
        assert_eq!(a.mode(), Mode::Eval("echo $1".into()));
        assert_eq!(a.script_args(), vec![Value::Str("hello".into()), Value::Float(2.5)]);
    }

    #[test]
    fn no_script_reads_stdin() {
        assert_eq!(parse_argv(Vec::<String>::new()).unwrap().mode(), Mode::Stdin);
        assert_eq!(parse_argv(["-"]).unwrap().mode(), Mode::Stdin);
    }

    #[test]
    fn flags_override_config() {
        let a = parse_argv(["-n", "-L", "/opt/paw", "--timeout-ms", "50", "x.paw"]).unwrap();
        let mut config = Config::default();
        a.apply(&mut config).unwrap();
        assert_eq!(config.init, InitScript::Skip);
        assert_eq!(config.lib_dir, Some(PathBuf::from("/opt/paw")));
        assert_eq!(config.engine.token_timeout, Some(Duration::from_millis(50)));
    }

    #[test]
    fn explicit_init() {
        let a = parse_argv(["-f", "setup.paw"]).unwrap();
        let mut config = Config::default();
        a.apply(&mut config).unwrap();
        assert_eq!(config.init, InitScript::Explicit(PathBuf::from("setup.paw")));
    }

    #[test]
    fn init_conflicts_with_no_init() {
        assert!(parse_argv(["-f", "a.paw", "-n"]).is_err());
    }

    #[test]
    fn bad_timeout() {
        let a = parse_argv(["--timeout-ms", "later"]).unwrap();
        assert!(a.apply(&mut Config::default()).is_err());
    }

    #[test]
    fn libdir_override_wins() {
        assert_eq!(resolve_libdir(Some(Path::new("/x"))), PathBuf::from("/x"));
    }
}
