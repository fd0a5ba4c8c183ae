//! Read-only view of the Beaker scheduler.
//!
//! Everything the tool needs from Beaker goes through the [`Scheduler`]
//! trait. [`BeakerCli`] implements it by running the `beaker` CLI with JSON
//! output, the same way the rest of the tool shells out to external programs.

use crate::utils::run_command;
use anyhow::{Context, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Name of the scheduler's CLI binary.
pub const BEAKER_BIN: &str = "beaker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Interactive session
    Session,
    /// Batch execution
    Execution,
}

/// Resources reserved by a job.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    /// UUIDs of the reserved GPUs
    #[serde(default)]
    pub gpus: Vec<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub cpu_count: Option<f64>,
}

/// Lifecycle timestamps as reported by Beaker.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default)]
    pub scheduled: Option<String>,
    #[serde(default)]
    pub started: Option<String>,
    #[serde(default)]
    pub exited: Option<String>,
    #[serde(default)]
    pub finalized: Option<String>,
    #[serde(default)]
    pub canceled: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i64>,
}

impl JobStatus {
    /// The most advanced lifecycle stage reached.
    pub fn current(&self) -> &'static str {
        if self.canceled.is_some() {
            "canceled"
        } else if self.finalized.is_some() {
            "finalized"
        } else if self.exited.is_some() {
            match self.exit_code {
                Some(0) | None => "exited",
                Some(_) => "failed",
            }
        } else if self.started.is_some() {
            "running"
        } else if self.scheduled.is_some() {
            "scheduled"
        } else {
            "created"
        }
    }
}

/// A Beaker job: an interactive session or a batch execution.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: JobKind,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub limits: Option<Limits>,
    #[serde(default)]
    pub status: JobStatus,
}

impl Job {
    pub fn is_interactive(&self) -> bool {
        self.kind == JobKind::Session
    }

    /// Name if set, otherwise the id.
    pub fn label(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Node {
    pub id: String,
    pub hostname: String,
}

/// A job joined with the node it runs on.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub job: Job,
    pub node: Option<Node>,
}

impl Session {
    /// Hostname used as the primary sort key; empty when unassigned.
    pub fn hostname(&self) -> &str {
        self.node.as_ref().map(|n| n.hostname.as_str()).unwrap_or("")
    }

    pub fn display_hostname(&self) -> &str {
        match self.hostname() {
            "" => "<unassigned>",
            host => host,
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on node {}", self.job.label(), self.display_hostname())
    }
}

/// Free capacity of one node at query time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCapacity {
    pub node_id: String,
    pub hostname: String,
    pub cluster: String,
    pub free_gpus: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterUtilization {
    pub cluster: String,
    pub nodes: Vec<NodeCapacity>,
}

pub trait Scheduler {
    /// Name of the authenticated account.
    fn whoami(&self) -> Result<String>;
    /// Unfinalized jobs authored by `author`.
    fn list_jobs(&self, author: &str) -> Result<Vec<Job>>;
    fn get_node(&self, id: &str) -> Result<Node>;
    /// Fully-qualified names of every visible cluster.
    fn list_clusters(&self) -> Result<Vec<String>>;
    fn utilization(&self, cluster: &str) -> Result<ClusterUtilization>;
}

/// Fetch the current user's jobs together with their nodes.
pub fn fetch_sessions(scheduler: &dyn Scheduler) -> Result<(String, Vec<Session>)> {
    let author = scheduler.whoami()?;
    let jobs = scheduler.list_jobs(&author)?;
    let mut nodes: HashMap<String, Node> = HashMap::new();
    let mut sessions = Vec::with_capacity(jobs.len());
    for job in jobs {
        let node = match job.node.as_deref() {
            Some(id) => {
                if !nodes.contains_key(id) {
                    nodes.insert(id.to_string(), scheduler.get_node(id)?);
                }
                nodes.get(id).cloned()
            }
            None => None,
        };
        sessions.push(Session { job, node });
    }
    debug!(author = %author, count = sessions.len(), "fetched sessions");
    Ok((author, sessions))
}

/// Clusters whose name matches `pattern` anchored at the start.
pub fn find_clusters(scheduler: &dyn Scheduler, pattern: &str) -> Result<Vec<String>> {
    let re = Regex::new(&format!("^(?:{})", pattern))
        .with_context(|| format!("Invalid cluster pattern {}", pattern))?;
    Ok(scheduler
        .list_clusters()?
        .into_iter()
        .filter(|name| re.is_match(name))
        .collect())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

#[derive(Deserialize)]
struct Account {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterRecord {
    name: String,
    #[serde(default)]
    full_name: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ResourceRecord {
    #[serde(default)]
    gpu_count: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeUtilizationRecord {
    id: String,
    hostname: String,
    #[serde(default)]
    free: ResourceRecord,
    #[serde(default)]
    cordoned: Option<String>,
}

#[derive(Deserialize)]
struct UtilizationRecord {
    #[serde(default)]
    nodes: Vec<NodeUtilizationRecord>,
}

/// Parse a utilization report, dropping cordoned nodes.
fn parse_utilization(cluster: &str, json: &str) -> Result<ClusterUtilization> {
    let record: OneOrMany<UtilizationRecord> =
        serde_json::from_str(json).context("Could not parse cluster utilization")?;
    let records = match record {
        OneOrMany::Many(list) => list,
        OneOrMany::One(one) => vec![one],
    };
    let nodes = records
        .into_iter()
        .flat_map(|r| r.nodes)
        .filter(|n| n.cordoned.is_none())
        .map(|n| NodeCapacity {
            node_id: n.id,
            hostname: n.hostname,
            cluster: cluster.to_string(),
            free_gpus: n.free.gpu_count.unwrap_or(0),
        })
        .collect();
    Ok(ClusterUtilization {
        cluster: cluster.to_string(),
        nodes,
    })
}

/// [`Scheduler`] backed by the `beaker` command-line client.
#[derive(Debug, Default)]
pub struct BeakerCli;

impl BeakerCli {
    pub fn new() -> Self {
        Self
    }

    fn query<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let mut cmd = vec![BEAKER_BIN];
        cmd.extend_from_slice(args);
        cmd.extend_from_slice(&["--format", "json"]);
        let result = run_command(&cmd, true)?;
        serde_json::from_str(&result.stdout)
            .with_context(|| format!("Could not parse output of {}", cmd.join(" ")))
    }

    fn query_one<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        match self.query::<OneOrMany<T>>(args)? {
            OneOrMany::One(item) => Ok(item),
            OneOrMany::Many(items) => items
                .into_iter()
                .next()
                .with_context(|| format!("Empty response from beaker {}", args.join(" "))),
        }
    }
}

impl Scheduler for BeakerCli {
    fn whoami(&self) -> Result<String> {
        let account: Account = self.query_one(&["account", "whoami"])?;
        Ok(account.name)
    }

    fn list_jobs(&self, author: &str) -> Result<Vec<Job>> {
        self.query(&["job", "list", "--author", author, "--finalized=false"])
    }

    fn get_node(&self, id: &str) -> Result<Node> {
        self.query_one(&["node", "get", id])
    }

    fn list_clusters(&self) -> Result<Vec<String>> {
        let clusters: Vec<ClusterRecord> = self.query(&["cluster", "list"])?;
        Ok(clusters
            .into_iter()
            .map(|c| c.full_name.unwrap_or(c.name))
            .collect())
    }

    fn utilization(&self, cluster: &str) -> Result<ClusterUtilization> {
        let result = run_command(
            &[BEAKER_BIN, "cluster", "utilization", cluster, "--format", "json"],
            true,
        )?;
        parse_utilization(cluster, &result.stdout)
    }
}
