//! Declarative argument schema with remembered defaults.
//!
//! Sub-commands are declared as [`CommandSpec`]s. Building the `clap`
//! command consults the [`DefaultsStore`] so a value remembered from a
//! previous run becomes the argument's default, and only arguments with
//! neither a remembered nor an explicit default stay required. After a
//! successful parse every argument marked `persist` is written back.

use crate::defaults::{DefaultsStore, Scalar};
use crate::error::BeakerUtilError;
use anyhow::Result;
use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgGroup, ArgMatches, Command};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const TRAILING_ID: &str = "extra_args";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Str,
    Int,
    Flag,
}

/// One declared argument.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    /// Long flag name; also the key in the defaults store.
    pub name: &'static str,
    pub short: Option<char>,
    pub help: &'static str,
    pub kind: ArgKind,
    pub positional: bool,
    pub required: bool,
    pub default: Option<&'static str>,
    /// Allowed values, computed when the schema is built.
    pub choices: Option<Vec<String>>,
    /// Remember the resolved value for the next invocation.
    pub persist: bool,
    /// Inclusive bounds of an `Int` argument.
    pub range: Option<(i64, i64)>,
}

impl ArgSpec {
    fn new(name: &'static str, kind: ArgKind, positional: bool) -> Self {
        Self {
            name,
            short: None,
            help: "",
            kind,
            positional,
            required: false,
            default: None,
            choices: None,
            persist: false,
            range: None,
        }
    }

    pub fn option(name: &'static str) -> Self {
        Self::new(name, ArgKind::Str, false)
    }

    pub fn positional(name: &'static str) -> Self {
        Self::new(name, ArgKind::Str, true)
    }

    pub fn flag(name: &'static str) -> Self {
        Self::new(name, ArgKind::Flag, false)
    }

    pub fn int(mut self) -> Self {
        self.kind = ArgKind::Int;
        self
    }

    pub fn short(mut self, short: char) -> Self {
        self.short = Some(short);
        self
    }

    pub fn help(mut self, help: &'static str) -> Self {
        self.help = help;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default(mut self, value: &'static str) -> Self {
        self.default = Some(value);
        self
    }

    pub fn choices(mut self, choices: Vec<String>) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn persist(mut self) -> Self {
        self.persist = true;
        self
    }

    /// Integer argument limited to `min..=max`.
    pub fn range(mut self, min: i64, max: i64) -> Self {
        self.kind = ArgKind::Int;
        self.range = Some((min, max));
        self
    }

    fn bounds(&self) -> (i64, i64) {
        self.range.unwrap_or((i64::MIN, i64::MAX))
    }

    /// Coerce a remembered value to this argument's type, if it fits.
    fn coerce(&self, stored: &Scalar) -> Option<String> {
        let int = match (self.kind, stored) {
            (ArgKind::Flag, _) => return None,
            (ArgKind::Str, value) => return Some(value.to_string()),
            (ArgKind::Int, Scalar::Int(v)) => Some(*v),
            (ArgKind::Int, Scalar::Str(s)) => s.trim().parse::<i64>().ok(),
        };
        let (min, max) = self.bounds();
        int.filter(|v| (min..=max).contains(v)).map(|v| v.to_string())
    }

    fn to_arg(&self, stored: Option<&Scalar>) -> Arg {
        let mut arg = Arg::new(self.name).help(self.help);
        if !self.positional {
            arg = arg.long(self.name);
            if let Some(short) = self.short {
                arg = arg.short(short);
            }
        }

        match self.kind {
            ArgKind::Flag => return arg.action(ArgAction::SetTrue),
            ArgKind::Int => {
                let (min, max) = self.bounds();
                arg = arg
                    .value_parser(clap::value_parser!(i64).range(min..=max))
                    .allow_negative_numbers(true)
            }
            ArgKind::Str => {}
        }

        if let Some(choices) = &self.choices {
            let listed = if choices.is_empty() {
                "none".to_string()
            } else {
                choices.join(", ")
            };
            arg = arg.help(format!("{} [choices: {}]", self.help, listed));
        }

        let remembered = stored.and_then(|value| {
            let coerced = self.coerce(value);
            if coerced.is_none() {
                warn!(arg = self.name, value = %value, "ignoring unusable remembered value");
            }
            coerced
        });

        match (remembered, self.default) {
            (Some(value), _) => arg.default_value(value),
            (None, Some(value)) => arg.default_value(value),
            (None, None) => arg.required(self.required),
        }
    }
}

/// One sub-command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    pub about: &'static str,
    pub aliases: Vec<&'static str>,
    pub args: Vec<ArgSpec>,
    /// Arguments of which at most one may be given.
    pub exclusive: Vec<&'static str>,
    /// Accept verbatim arguments after a literal `--`.
    pub trailing: bool,
}

impl CommandSpec {
    pub fn new(name: &'static str, about: &'static str) -> Self {
        Self {
            name,
            about,
            aliases: Vec::new(),
            args: Vec::new(),
            exclusive: Vec::new(),
            trailing: false,
        }
    }

    pub fn alias(mut self, alias: &'static str) -> Self {
        self.aliases.push(alias);
        self
    }

    pub fn arg(mut self, arg: ArgSpec) -> Self {
        self.args.push(arg);
        self
    }

    pub fn exclusive(mut self, names: &[&'static str]) -> Self {
        self.exclusive = names.to_vec();
        self
    }

    pub fn trailing(mut self) -> Self {
        self.trailing = true;
        self
    }

    fn to_command(&self, store: &DefaultsStore) -> Command {
        let mut cmd = Command::new(self.name).about(self.about);
        for alias in &self.aliases {
            cmd = cmd.visible_alias(*alias);
        }
        for spec in &self.args {
            cmd = cmd.arg(spec.to_arg(store.get_default(self.name, spec.name)));
        }
        if !self.exclusive.is_empty() {
            cmd = cmd.group(
                ArgGroup::new("target")
                    .args(self.exclusive.iter().copied())
                    .multiple(false),
            );
        }
        if self.trailing {
            cmd = cmd.arg(
                Arg::new(TRAILING_ID)
                    .help("Arguments passed through verbatim after --")
                    .num_args(0..)
                    .last(true)
                    .allow_hyphen_values(true),
            );
        }
        cmd
    }
}

/// Build the full CLI from the declared sub-commands.
pub fn build_cli(specs: &[CommandSpec], store: &DefaultsStore) -> Command {
    let mut cli = Command::new("beakerutil")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Collection of utilities for Beaker")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::Count)
                .help("Increase log verbosity"),
        );
    for spec in specs {
        cli = cli.subcommand(spec.to_command(store));
    }
    cli
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Flag(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub value: ArgValue,
    /// Given on the command line, as opposed to filled from a default.
    pub explicit: bool,
}

/// The outcome of argument resolution for one invocation.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub command: String,
    values: BTreeMap<String, Resolved>,
    trailing: Vec<String>,
}

impl Invocation {
    pub fn str(&self, name: &str) -> Option<&str> {
        match self.values.get(name).map(|r| &r.value) {
            Some(ArgValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name).map(|r| &r.value) {
            Some(ArgValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(
            self.values.get(name).map(|r| &r.value),
            Some(ArgValue::Flag(true))
        )
    }

    /// String value only if it was typed on this command line.
    pub fn explicit_str(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .filter(|r| r.explicit)
            .and_then(|_| self.str(name))
    }

    /// Integer value only if it was typed on this command line.
    pub fn explicit_int(&self, name: &str) -> Option<i64> {
        self.values
            .get(name)
            .filter(|r| r.explicit)
            .and_then(|_| self.int(name))
    }

    /// Arguments that followed a literal `--`.
    pub fn trailing(&self) -> &[String] {
        &self.trailing
    }
}

fn extract(spec: &ArgSpec, matches: &ArgMatches) -> Option<Resolved> {
    let explicit = matches.value_source(spec.name) == Some(ValueSource::CommandLine);
    let value = match spec.kind {
        ArgKind::Flag => ArgValue::Flag(matches.get_flag(spec.name)),
        ArgKind::Int => ArgValue::Int(*matches.get_one::<i64>(spec.name)?),
        ArgKind::Str => ArgValue::Str(matches.get_one::<String>(spec.name)?.clone()),
    };
    Some(Resolved { value, explicit })
}

/// Parse `argv`, validate choices and remember persistent values.
///
/// Usage errors come back as `clap::Error` inside the `anyhow::Error` so the
/// caller can let clap print and exit.
pub fn resolve<I, T>(specs: &[CommandSpec], store: &mut DefaultsStore, argv: I) -> Result<Invocation>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = build_cli(specs, store).try_get_matches_from(argv)?;
    let (name, sub) = matches
        .subcommand()
        .ok_or_else(|| anyhow::anyhow!("No command given"))?;
    let spec = specs
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| anyhow::anyhow!("Unknown command {}", name))?;

    let mut invocation = Invocation {
        command: name.to_string(),
        ..Default::default()
    };

    for arg in &spec.args {
        let Some(resolved) = extract(arg, sub) else {
            continue;
        };
        if let (Some(choices), ArgValue::Str(value)) = (&arg.choices, &resolved.value) {
            if !choices.contains(value) {
                return Err(BeakerUtilError::invalid_choice(arg.name, value, choices).into());
            }
        }
        invocation.values.insert(arg.name.to_string(), resolved);
    }

    if spec.trailing {
        invocation.trailing = sub
            .get_many::<String>(TRAILING_ID)
            .map(|values| values.cloned().collect())
            .unwrap_or_default();
    }

    for arg in spec.args.iter().filter(|a| a.persist) {
        let scalar = match invocation.values.get(arg.name).map(|r| &r.value) {
            Some(ArgValue::Str(s)) => Scalar::Str(s.clone()),
            Some(ArgValue::Int(v)) => Scalar::Int(*v),
            Some(ArgValue::Flag(_)) | None => continue,
        };
        debug!(command = name, arg = arg.name, value = %scalar, "remembering default");
        store.set_default(name, arg.name, scalar);
    }

    Ok(invocation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn specs(presets: Vec<String>) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("launch", "Launch")
                .arg(
                    ArgSpec::positional("launch_config")
                        .choices(presets)
                        .persist(),
                )
                .arg(ArgSpec::option("workspace").short('w').required().persist())
                .arg(ArgSpec::option("gpus").range(0, 64).default("1").persist())
                .arg(ArgSpec::option("node"))
                .arg(ArgSpec::flag("dry-run").persist())
                .trailing(),
            CommandSpec::new("attach", "Attach")
                .arg(ArgSpec::option("name").short('n'))
                .arg(ArgSpec::option("id").short('i'))
                .arg(ArgSpec::positional("session_idx").int())
                .exclusive(&["name", "id", "session_idx"]),
        ]
    }

    fn store(dir: &TempDir) -> DefaultsStore {
        DefaultsStore::load(dir.path().join("config.yaml")).unwrap()
    }

    #[test]
    fn test_required_without_default() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let err = resolve(&specs(vec!["a".into()]), &mut store, ["bu", "launch", "a"]).unwrap_err();
        assert!(err.downcast_ref::<clap::Error>().is_some());
    }

    #[test]
    fn test_remembered_value_becomes_default() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let specs = specs(vec!["a".into()]);

        let inv = resolve(&specs, &mut store, ["bu", "launch", "a", "-w", "ai2/dev"]).unwrap();
        assert_eq!(inv.str("workspace"), Some("ai2/dev"));
        assert_eq!(inv.explicit_str("workspace"), Some("ai2/dev"));
        assert_eq!(inv.int("gpus"), Some(1));

        let inv = resolve(&specs, &mut store, ["bu", "launch"]).unwrap();
        assert_eq!(inv.str("workspace"), Some("ai2/dev"));
        assert_eq!(inv.explicit_str("workspace"), None);
        assert_eq!(inv.str("launch_config"), Some("a"));
    }

    #[test]
    fn test_flags_and_unmarked_args_not_persisted() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        resolve(
            &specs(vec!["a".into()]),
            &mut store,
            ["bu", "launch", "a", "-w", "ws", "--dry-run", "--node", "n1"],
        )
        .unwrap();
        assert!(store.get_default("launch", "dry-run").is_none());
        assert!(store.get_default("launch", "node").is_none());
        assert_eq!(store.get_default("launch", "gpus"), Some(&Scalar::Int(1)));
    }

    #[test]
    fn test_stored_int_coerced() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.set_default("launch", "gpus", "4");
        store.set_default("launch", "workspace", "ws");
        let inv = resolve(&specs(vec!["a".into()]), &mut store, ["bu", "launch", "a"]).unwrap();
        assert_eq!(inv.int("gpus"), Some(4));
    }

    #[test]
    fn test_wrong_type_stored_value_ignored() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.set_default("launch", "gpus", "many");
        store.set_default("launch", "workspace", "ws");
        let inv = resolve(&specs(vec!["a".into()]), &mut store, ["bu", "launch", "a"]).unwrap();
        assert_eq!(inv.int("gpus"), Some(1));
    }

    #[test]
    fn test_out_of_range_rejected_before_persisting() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let err = resolve(
            &specs(vec!["a".into()]),
            &mut store,
            ["bu", "launch", "a", "-w", "ws", "--gpus", "-1"],
        )
        .unwrap_err();
        assert!(err.downcast_ref::<clap::Error>().is_some());
        assert!(store.get_default("launch", "gpus").is_none());
        assert!(store.get_default("launch", "workspace").is_none());
    }

    #[test]
    fn test_out_of_range_stored_value_ignored() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.set_default("launch", "gpus", -3i64);
        store.set_default("launch", "workspace", "ws");
        let inv = resolve(&specs(vec!["a".into()]), &mut store, ["bu", "launch", "a"]).unwrap();
        assert_eq!(inv.int("gpus"), Some(1));
        assert_eq!(store.get_default("launch", "gpus"), Some(&Scalar::Int(1)));
    }

    #[test]
    fn test_empty_choice_set_rejects_value() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let err = resolve(&specs(Vec::new()), &mut store, ["bu", "launch", "x", "-w", "ws"])
            .unwrap_err();
        let err = err.downcast::<BeakerUtilError>().unwrap();
        assert_eq!(
            err,
            BeakerUtilError::InvalidChoice {
                arg: "launch_config".into(),
                value: "x".into(),
                allowed: "none".into(),
            }
        );
        assert!(store.get_default("launch", "workspace").is_none());
    }

    #[test]
    fn test_trailing_args_verbatim() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let inv = resolve(
            &specs(vec!["a".into()]),
            &mut store,
            ["bu", "launch", "a", "-w", "ws", "--", "--priority", "high", "-x"],
        )
        .unwrap();
        assert_eq!(inv.trailing(), ["--priority", "high", "-x"]);
    }

    #[test]
    fn test_exclusive_targets() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let specs = specs(Vec::new());
        assert!(resolve(&specs, &mut store, ["bu", "attach", "-n", "x", "-i", "y"]).is_err());

        let inv = resolve(&specs, &mut store, ["bu", "attach", "-1"]).unwrap();
        assert_eq!(inv.int("session_idx"), Some(-1));
        assert_eq!(inv.str("name"), None);
    }

    #[test]
    fn test_verbose_accepted_after_subcommand() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let inv = resolve(&specs(Vec::new()), &mut store, ["bu", "attach", "-vv"]).unwrap();
        assert_eq!(inv.command, "attach");
    }
}
