//! CLI entry point and command definitions.

use crate::args::{self, ArgSpec, CommandSpec, Invocation};
use crate::defaults::DefaultsStore;
use crate::error::BeakerUtilError;
use crate::gpu_monitor::{CancellationToken, GpuMonitor, GpuSource};
use crate::launch_config::{LaunchConfigs, LaunchPreset};
use crate::launcher::{plan_launch, LaunchMode, LaunchSpec};
use crate::paths::ConfigPaths;
use crate::scheduler::{fetch_sessions, Scheduler, BEAKER_BIN};
use crate::selector::{format_listing, resolve_target, TargetQuery};
use crate::shell_init::{self, Shell};
use crate::utils::{shell_join, Executor};
use anyhow::{Context, Result};
use clap::ValueEnum;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Commands were written for the shell hook to source.
    Source,
}

/// Everything a command talks to outside the process.
pub struct Env<'a> {
    pub scheduler: &'a dyn Scheduler,
    pub executor: &'a dyn Executor,
    pub gpu_source: &'a dyn GpuSource,
    pub paths: ConfigPaths,
    pub home: PathBuf,
    /// Set by the shell hook; commands go here instead of being executed.
    pub source_file: Option<PathBuf>,
}

fn target_args(spec: CommandSpec, verb: &'static str) -> CommandSpec {
    let (name_help, id_help, idx_help) = match verb {
        "attach" => (
            "The name of the session to attach to",
            "The id of the session to attach to",
            "The index of the session to attach to",
        ),
        _ => (
            "The name of the session to stop",
            "The id of the session to stop",
            "The index of the session to stop",
        ),
    };
    spec.arg(ArgSpec::option("name").short('n').help(name_help))
        .arg(ArgSpec::option("id").short('i').help(id_help))
        .arg(ArgSpec::positional("session_idx").int().help(idx_help))
        .exclusive(&["name", "id", "session_idx"])
}

/// The sub-commands, with launch preset names as the allowed choices.
pub fn command_specs(presets: Vec<String>) -> Vec<CommandSpec> {
    vec![
        CommandSpec::new("list", "List all sessions"),
        target_args(CommandSpec::new("attach", "Attach to a running session"), "attach"),
        target_args(
            CommandSpec::new("stop", "Stop a running session").alias("cancel"),
            "stop",
        ),
        CommandSpec::new(
            "launch",
            "Launch interactive session on any available node in a cluster",
        )
        .arg(
            ArgSpec::positional("launch_config")
                .help("The launch configuration to use")
                .choices(presets)
                .persist(),
        )
        .arg(
            ArgSpec::option("cluster")
                .short('c')
                .help("Regex matched against cluster names")
                .persist(),
        )
        .arg(ArgSpec::option("workspace").short('w').help("Beaker workspace").persist())
        .arg(ArgSpec::option("budget").short('b').help("Budget to charge").persist())
        .arg(
            ArgSpec::option("gpus")
                .short('g')
                .range(0, i64::from(u32::MAX))
                .help("Number of GPUs to reserve")
                .persist(),
        )
        .arg(ArgSpec::option("image").help("Beaker image to start from").persist())
        .arg(ArgSpec::option("node").help("Preferred node, by hostname or id"))
        .arg(ArgSpec::option("name").help("Name of the new session"))
        .arg(
            ArgSpec::flag("dry-run")
                .help("Print the command that would be executed without running it"),
        )
        .arg(ArgSpec::flag("ssh").help("Run the session inside tmux on the node, over ssh"))
        .trailing(),
        CommandSpec::new("reset", "Forget remembered argument values")
            .arg(ArgSpec::positional("command").help("Sub-command to reset; all if omitted"))
            .arg(ArgSpec::positional("arg").help("Single argument of that sub-command")),
        CommandSpec::new("config", "View configuration").arg(
            ArgSpec::positional("config_type")
                .help("The type of configuration to view")
                .required()
                .choices(vec!["launch".into(), "defaults".into()]),
        ),
        CommandSpec::new("init", "Install the shell hook").arg(
            ArgSpec::positional("shell")
                .help("Shell whose rc file gets the hook")
                .required()
                .choices(Shell::value_variants().iter().map(|s| s.name().to_string()).collect()),
        ),
        CommandSpec::new("monitor", "Watch GPU usage of running batch jobs")
            .arg(
                ArgSpec::option("interval")
                    .range(1, i64::from(u32::MAX))
                    .default("5")
                    .help("Seconds between refreshes")
                    .persist(),
            )
            .arg(ArgSpec::flag("once").help("Print one table and exit")),
    ]
}

/// Parse `argv`, remember defaults and run the chosen command.
pub fn run<I, T>(argv: I, env: &Env, out: &mut dyn Write) -> Result<Outcome>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut store = DefaultsStore::load(env.paths.defaults_file())?;
    let presets = LaunchConfigs::load(&env.paths.launch_file())?;
    let names = presets.as_ref().map(LaunchConfigs::names).unwrap_or_default();

    let inv = args::resolve(&command_specs(names), &mut store, argv)
        .map_err(|e| launch_config_error(e, presets.as_ref(), &env.paths))?;
    store.save()?;
    debug!(command = %inv.command, "resolved arguments");

    match inv.command.as_str() {
        "list" => list(env, out),
        "attach" => attach(&inv, env, out),
        "stop" => stop(&inv, env, out),
        "launch" => launch(&inv, presets.as_ref(), env, out),
        "reset" => reset(&inv, &mut store, out),
        "config" => config(&inv, &store, env, out),
        "init" => init(&inv, &mut store, env, out),
        "monitor" => monitor(&inv, env, out),
        other => anyhow::bail!("Unknown command {}", other),
    }
}

/// Explain a rejected preset name in terms of the presets file.
fn launch_config_error(
    err: anyhow::Error,
    presets: Option<&LaunchConfigs>,
    paths: &ConfigPaths,
) -> anyhow::Error {
    let name = match err.downcast_ref::<BeakerUtilError>() {
        Some(BeakerUtilError::InvalidChoice { arg, value, .. }) if arg == "launch_config" => {
            value.clone()
        }
        _ => return err,
    };
    match presets {
        Some(configs) => configs
            .resolve(&name)
            .err()
            .map(anyhow::Error::from)
            .unwrap_or(err),
        None => {
            BeakerUtilError::LaunchConfigMissing(paths.launch_file().display().to_string()).into()
        }
    }
}

/// Print, hand to the shell hook, or execute a composed command.
fn deliver(argv: &[String], dry_run: bool, env: &Env, out: &mut dyn Write) -> Result<Outcome> {
    let line = shell_join(argv)?;
    if dry_run {
        writeln!(out, "Would execute:")?;
        writeln!(out, "{}", line)?;
        return Ok(Outcome::Done);
    }
    writeln!(out, "{}", line)?;
    if let Some(path) = &env.source_file {
        fs::write(path, format!("{}\n", line))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(file = %path.display(), "handing command to the shell hook");
        return Ok(Outcome::Source);
    }
    out.flush()?;
    env.executor.exec(argv)?;
    Ok(Outcome::Done)
}

fn list(env: &Env, out: &mut dyn Write) -> Result<Outcome> {
    let (author, sessions) = fetch_sessions(env.scheduler)?;
    write!(out, "{}", format_listing(&author, sessions))?;
    Ok(Outcome::Done)
}

fn target_query(inv: &Invocation) -> TargetQuery {
    TargetQuery {
        index: inv.int("session_idx"),
        name: inv.str("name").map(str::to_string),
        id: inv.str("id").map(str::to_string),
    }
}

fn attach(inv: &Invocation, env: &Env, out: &mut dyn Write) -> Result<Outcome> {
    let (author, sessions) = fetch_sessions(env.scheduler)?;
    let session = resolve_target(&author, sessions, &target_query(inv))?;
    writeln!(
        out,
        "Attempting to attach to session {} on node {}...",
        session.job.label(),
        session.display_hostname()
    )?;
    let argv = vec![
        BEAKER_BIN.to_string(),
        "session".into(),
        "attach".into(),
        "--remote".into(),
        session.job.id.clone(),
    ];
    deliver(&argv, false, env, out)
}

fn stop(inv: &Invocation, env: &Env, out: &mut dyn Write) -> Result<Outcome> {
    let (author, sessions) = fetch_sessions(env.scheduler)?;
    let session = resolve_target(&author, sessions, &target_query(inv))?;
    let interactive = session.job.is_interactive();
    writeln!(
        out,
        "Attempting to stop {} session {} on node {}...",
        if interactive { "interactive" } else { "noninteractive" },
        session.job.label(),
        session.display_hostname()
    )?;
    let (noun, verb) = if interactive {
        ("session", "stop")
    } else {
        ("job", "cancel")
    };
    let argv = vec![
        BEAKER_BIN.to_string(),
        noun.into(),
        verb.into(),
        session.job.id.clone(),
    ];
    deliver(&argv, false, env, out)
}

/// Launch parameters read through `get`, which decides whether remembered
/// values count or only ones typed on this command line.
fn preset_from_args<'a>(
    inv: &'a Invocation,
    get: impl Fn(&'a Invocation, &str) -> Option<&'a str>,
    gpus: Option<u32>,
) -> LaunchPreset {
    let owned = |name: &str| get(inv, name).map(str::to_string);
    LaunchPreset {
        cluster: owned("cluster"),
        workspace: owned("workspace"),
        budget: owned("budget"),
        gpus,
        image: owned("image"),
        name: owned("name"),
        node: owned("node"),
        ..Default::default()
    }
}

fn gpu_count(value: Option<i64>) -> Result<Option<u32>> {
    value
        .map(u32::try_from)
        .transpose()
        .context("GPU count out of range")
}

fn launch(
    inv: &Invocation,
    presets: Option<&LaunchConfigs>,
    env: &Env,
    out: &mut dyn Write,
) -> Result<Outcome> {
    // A preset name only gets past argument resolution when the file lists it.
    let base = match (inv.str("launch_config"), presets) {
        (Some(name), Some(configs)) => configs.resolve(name)?,
        (_, configs) => configs.map(LaunchConfigs::default_preset).unwrap_or_default(),
    };

    let remembered = preset_from_args(inv, Invocation::str, gpu_count(inv.int("gpus"))?);
    let explicit = preset_from_args(
        inv,
        Invocation::explicit_str,
        gpu_count(inv.explicit_int("gpus"))?,
    );
    let merged = explicit.over(&base.over(&remembered));
    debug!(preset = ?merged, "merged launch parameters");

    let spec = LaunchSpec::from_preset(merged, inv.trailing().to_vec())?;
    let mode = if inv.flag("ssh") {
        LaunchMode::Ssh
    } else {
        LaunchMode::Direct
    };
    let plan = plan_launch(env.scheduler, &spec, mode)?;
    info!(
        node = %plan.node.hostname,
        cluster = %plan.node.cluster,
        free_gpus = plan.node.free_gpus,
        "selected node"
    );
    deliver(&plan.argv, inv.flag("dry-run"), env, out)
}

fn reset(inv: &Invocation, store: &mut DefaultsStore, out: &mut dyn Write) -> Result<Outcome> {
    match (inv.str("command"), inv.str("arg")) {
        (None, _) => {
            store.reset_all();
            writeln!(out, "Reset all remembered defaults.")?;
        }
        (Some(command), None) => {
            if !store.reset_command(command) {
                return Err(BeakerUtilError::NoStoredDefaults(command.to_string()).into());
            }
            writeln!(out, "Reset remembered defaults of {}.", command)?;
        }
        (Some(command), Some(arg)) => {
            if !store.reset_arg(command, arg) {
                return Err(BeakerUtilError::NoStoredDefaults(format!("{} {}", command, arg)).into());
            }
            writeln!(out, "Reset remembered {} of {}.", arg, command)?;
        }
    }
    store.save()?;
    Ok(Outcome::Done)
}

fn config(inv: &Invocation, store: &DefaultsStore, env: &Env, out: &mut dyn Write) -> Result<Outcome> {
    match inv.str("config_type") {
        Some("launch") => {
            let configs = LaunchConfigs::load_required(&env.paths.launch_file())?;
            writeln!(out, "{}", configs.render()?)?;
        }
        Some("defaults") => write!(out, "{}", store.defaults_yaml()?)?,
        other => anyhow::bail!("Unknown configuration type: {}", other.unwrap_or_default()),
    }
    Ok(Outcome::Done)
}

fn init(inv: &Invocation, store: &mut DefaultsStore, env: &Env, out: &mut dyn Write) -> Result<Outcome> {
    let name = inv.str("shell").unwrap_or_default();
    let shell = Shell::from_name(name).with_context(|| format!("Unsupported shell {}", name))?;
    let rc_file = shell.rc_file(&env.home);
    if shell_init::install(&rc_file)? {
        writeln!(
            out,
            "Installed the beakerutil hook in {}. Open a new shell to use it.",
            rc_file.display()
        )?;
    } else {
        writeln!(out, "The beakerutil hook in {} is up to date.", rc_file.display())?;
    }
    store.register_shell(shell.name());
    store.save()?;
    Ok(Outcome::Done)
}

fn monitor(inv: &Invocation, env: &Env, out: &mut dyn Write) -> Result<Outcome> {
    let (author, sessions) = fetch_sessions(env.scheduler)?;
    let monitor = GpuMonitor::new(env.gpu_source, sessions);
    if monitor.job_count() == 0 {
        return Err(BeakerUtilError::NoSessions(author).into());
    }

    if inv.flag("once") {
        write!(out, "{}", monitor.snapshot()?.render_text())?;
        return Ok(Outcome::Done);
    }

    let secs = u64::try_from(inv.int("interval").unwrap_or(5))
        .context("Refresh interval out of range")?;
    info!(jobs = monitor.job_count(), hosts = monitor.hostnames().len(), "starting monitor");
    monitor.run_live(Duration::from_secs(secs), &CancellationToken::new())?;
    Ok(Outcome::Done)
}
