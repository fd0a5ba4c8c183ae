//! Node selection and `beaker session create` composition.

use crate::error::BeakerUtilError;
use crate::launch_config::{LaunchPreset, Mount};
use crate::scheduler::{find_clusters, NodeCapacity, Scheduler, BEAKER_BIN};
use crate::utils::{embed_double_quoted, shell_join};
use anyhow::Result;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tracing::warn;

/// tmux session name used on the remote node.
pub const TMUX_SESSION: &str = "beakerutil";

/// Fully resolved parameters of one launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Regex matched against cluster names from the start.
    pub cluster: String,
    pub workspace: String,
    pub budget: String,
    pub gpus: Option<u32>,
    pub node: Option<String>,
    pub image: Option<String>,
    pub name: Option<String>,
    pub mounts: Vec<Mount>,
    pub env_secrets: BTreeMap<String, String>,
    pub extra_args: Vec<String>,
}

impl LaunchSpec {
    pub fn from_preset(preset: LaunchPreset, extra_args: Vec<String>) -> Result<Self, BeakerUtilError> {
        let require = |value: Option<String>, field| {
            value
                .filter(|v| !v.is_empty())
                .ok_or(BeakerUtilError::MissingLaunchField { field })
        };
        Ok(Self {
            cluster: require(preset.cluster, "cluster")?,
            workspace: require(preset.workspace, "workspace")?,
            budget: require(preset.budget, "budget")?,
            gpus: preset.gpus,
            node: preset.node,
            image: preset.image,
            name: preset.name,
            mounts: preset.mounts,
            env_secrets: preset.env_secrets,
            extra_args,
        })
    }

    pub fn requested_gpus(&self) -> u32 {
        self.gpus.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeChoice {
    pub node: NodeCapacity,
    /// A preferred node was given but could not be used.
    pub fell_back: bool,
}

/// Pick the node with the most free GPUs, or the preferred one if it fits.
pub fn select_node(
    candidates: &[NodeCapacity],
    requested: u32,
    preferred: Option<&str>,
) -> Result<NodeChoice, BeakerUtilError> {
    let mut fell_back = false;
    if let Some(preferred) = preferred {
        let found = candidates
            .iter()
            .find(|n| n.hostname == preferred || n.node_id == preferred);
        match found {
            Some(node) if node.free_gpus >= requested => {
                return Ok(NodeChoice {
                    node: node.clone(),
                    fell_back: false,
                })
            }
            _ => fell_back = true,
        }
    }

    let best = candidates
        .iter()
        .max_by_key(|n| (n.free_gpus, Reverse(n.hostname.as_str())))
        .ok_or_else(|| BeakerUtilError::NoNodes(String::new()))?;
    if best.free_gpus < requested {
        return Err(BeakerUtilError::InsufficientCapacity {
            requested,
            hostname: best.hostname.clone(),
            free: best.free_gpus,
        });
    }
    Ok(NodeChoice {
        node: best.clone(),
        fell_back,
    })
}

/// How the composed command reaches Beaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Run `beaker session create --remote` locally.
    Direct,
    /// Run it on the chosen node inside tmux, over ssh.
    Ssh,
}

/// `beaker session create` in its fixed argument order.
pub fn session_create_argv(spec: &LaunchSpec, clusters: &[String], remote: bool) -> Vec<String> {
    let mut argv: Vec<String> = [
        BEAKER_BIN,
        "session",
        "create",
        "-w",
        spec.workspace.as_str(),
        "--budget",
        spec.budget.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    if remote {
        argv.push("--remote".into());
    }
    argv.push("--bare".into());
    if let Some(name) = &spec.name {
        argv.extend(["--name".to_string(), name.clone()]);
    }
    for cluster in clusters {
        argv.extend(["--cluster".to_string(), cluster.clone()]);
    }
    for mount in &spec.mounts {
        argv.extend([
            "--mount".to_string(),
            format!("src={},ref={},dst={}", mount.src, mount.reference, mount.dst),
        ]);
    }
    for (env, secret) in &spec.env_secrets {
        argv.extend(["--secret-env".to_string(), format!("{}={}", env, secret)]);
    }
    if let Some(image) = &spec.image {
        argv.extend(["--image".to_string(), image.clone()]);
    }
    if let Some(gpus) = spec.gpus {
        argv.extend(["--gpus".to_string(), gpus.to_string()]);
    }
    argv.extend(spec.extra_args.iter().cloned());
    argv
}

/// Wrap a command so it runs in a persistent tmux session on `hostname`.
///
/// The command is quoted twice: once for the shell tmux starts and once
/// for the login shell ssh runs it through.
pub fn ssh_tmux_argv(hostname: &str, inner: &[String]) -> Result<Vec<String>> {
    let remote = format!(
        "tmux new-session -A -s {} \"{}\"",
        TMUX_SESSION,
        embed_double_quoted(&shell_join(inner)?)
    );
    Ok(vec!["ssh".into(), "-t".into(), hostname.to_string(), remote])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub argv: Vec<String>,
    pub node: NodeCapacity,
}

/// Query live capacity, choose a node and compose the command to run.
pub fn plan_launch(scheduler: &dyn Scheduler, spec: &LaunchSpec, mode: LaunchMode) -> Result<LaunchPlan> {
    let clusters = find_clusters(scheduler, &spec.cluster)?;
    if clusters.is_empty() {
        return Err(BeakerUtilError::NoClusters(spec.cluster.clone()).into());
    }

    let mut candidates = Vec::new();
    for cluster in &clusters {
        candidates.extend(scheduler.utilization(cluster)?.nodes);
    }
    if candidates.is_empty() {
        return Err(BeakerUtilError::NoNodes(spec.cluster.clone()).into());
    }

    let requested = spec.requested_gpus();
    let choice = select_node(&candidates, requested, spec.node.as_deref())?;
    if choice.fell_back {
        warn!(
            "Preferred node {} unavailable or lacking {} free GPU(s); using {} instead",
            spec.node.as_deref().unwrap_or_default(),
            requested,
            choice.node.hostname
        );
    }
    let argv = match mode {
        LaunchMode::Direct => session_create_argv(spec, &clusters, true),
        LaunchMode::Ssh => {
            let inner = session_create_argv(spec, &[choice.node.cluster.clone()], false);
            ssh_tmux_argv(&choice.node.hostname, &inner)?
        }
    };
    Ok(LaunchPlan {
        argv,
        node: choice.node,
    })
}
