//! Ordering and selection of the user's sessions.

use crate::error::BeakerUtilError;
use crate::scheduler::{Job, Session};
use std::fmt::Write;

/// Sessions split by kind, each sorted by `(hostname, job id)`.
#[derive(Debug, Clone, Default)]
pub struct Partitioned {
    pub interactive: Vec<Session>,
    pub noninteractive: Vec<Session>,
}

impl Partitioned {
    pub fn new(sessions: Vec<Session>) -> Self {
        let (mut interactive, mut noninteractive): (Vec<_>, Vec<_>) =
            sessions.into_iter().partition(|s| s.job.is_interactive());
        sort_sessions(&mut interactive);
        sort_sessions(&mut noninteractive);
        Self {
            interactive,
            noninteractive,
        }
    }

    pub fn len(&self) -> usize {
        self.interactive.len() + self.noninteractive.len()
    }

    /// Interactive sessions first, then non-interactive, in display order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.interactive.iter().chain(self.noninteractive.iter())
    }

    /// Session at a listing index.
    pub fn get(&self, index: i64) -> Option<&Session> {
        let index = usize::try_from(index).ok()?;
        self.iter().nth(index)
    }
}

pub fn sort_sessions(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| {
        (a.hostname(), a.job.id.as_str()).cmp(&(b.hostname(), b.job.id.as_str()))
    });
}

/// How the user identified the session to act on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetQuery {
    pub index: Option<i64>,
    pub name: Option<String>,
    pub id: Option<String>,
}

/// Pick one session: index, then name, then id, then the only one.
pub fn resolve_target(
    author: &str,
    sessions: Vec<Session>,
    query: &TargetQuery,
) -> Result<Session, BeakerUtilError> {
    if sessions.is_empty() {
        return Err(BeakerUtilError::NoSessions(author.to_string()));
    }
    let sorted = Partitioned::new(sessions);

    if let Some(index) = query.index {
        return sorted
            .get(index)
            .cloned()
            .ok_or(BeakerUtilError::InvalidIndex(index));
    }
    if let Some(name) = &query.name {
        return sorted
            .iter()
            .find(|s| s.job.name.as_deref() == Some(name.as_str()))
            .cloned()
            .ok_or_else(|| BeakerUtilError::NoSessionWithName(name.clone()));
    }
    if let Some(id) = &query.id {
        return sorted
            .iter()
            .find(|s| &s.job.id == id)
            .cloned()
            .ok_or_else(|| BeakerUtilError::NoSessionWithId(id.clone()));
    }
    if sorted.len() == 1 {
        if let Some(only) = sorted.iter().next() {
            return Ok(only.clone());
        }
    }
    Err(BeakerUtilError::Ambiguous)
}

/// Human summary of what a job has reserved.
pub fn reservation_summary(job: &Job) -> String {
    let Some(limits) = &job.limits else {
        return "with no resources reserved".to_string();
    };
    let mut summary = format!("using: [{} GPU(s)", limits.gpus.len());
    if let Some(memory) = limits.memory.as_deref().filter(|m| !m.is_empty()) {
        let _ = write!(summary, ", {} of memory", memory);
    }
    if let Some(cpus) = limits.cpu_count.filter(|c| *c != 0.0) {
        let _ = write!(summary, ", {} CPU(s)", cpus);
    }
    summary.push(']');
    summary
}

/// The `list` output: one indexed line per session, interactive first.
pub fn format_listing(author: &str, sessions: Vec<Session>) -> String {
    if sessions.is_empty() {
        return format!("No sessions found for author {}.\n", author);
    }
    let sorted = Partitioned::new(sessions);
    let mut out = String::new();
    let mut idx = 0;
    for (title, group) in [
        ("Interactive sessions:", &sorted.interactive),
        ("Noninteractive sessions:", &sorted.noninteractive),
    ] {
        if group.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{}", title);
        for session in group {
            let job = &session.job;
            let name = match job.name.as_deref() {
                Some(name) if !name.is_empty() => format!(" (name={})", name),
                _ => String::new(),
            };
            let _ = writeln!(
                out,
                "\t{}: Session {}{} on node {} {}, status={}",
                idx,
                job.id,
                name,
                session.display_hostname(),
                reservation_summary(job),
                job.status.current()
            );
            idx += 1;
        }
    }
    out
}
