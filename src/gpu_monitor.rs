//! GPU utilization polling for the user's batch jobs.

use crate::scheduler::Session;
use crate::selector::sort_sessions;
use crate::ui::{self, App, TerminalGuard};
use anyhow::Result;
use crossterm::event::{self, Event};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;
use std::io;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Query run on every node, one CSV line per GPU.
pub const SMI_QUERY: &str = "nvidia-smi --query-gpu=uuid,name,memory.used,memory.total,utilization.gpu --format=csv,noheader,nounits";

const HEADERS: [&str; 5] = ["Job", "Hostname", "GPU(s)", "VRAM", "GPU Utilization"];

/// One GPU as reported by `nvidia-smi`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuStat {
    pub uuid: String,
    pub name: String,
    pub memory_used: String,
    pub memory_total: String,
    pub utilization: String,
}

/// Parse `--format=csv,noheader,nounits` output, skipping malformed lines.
pub fn parse_smi_csv(output: &str) -> Vec<GpuStat> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 5 || fields[0].is_empty() {
                return None;
            }
            Some(GpuStat {
                uuid: fields[0].to_string(),
                name: fields[1].to_string(),
                memory_used: fields[2].to_string(),
                memory_total: fields[3].to_string(),
                utilization: fields[4].to_string(),
            })
        })
        .collect()
}

/// Collects GPU stats from a set of hosts in one round.
pub trait GpuSource {
    /// Hosts that could not be queried are absent from the result.
    fn query(&self, hosts: &[String]) -> Result<HashMap<String, Vec<GpuStat>>>;
}

/// Runs `nvidia-smi` over ssh: every host's child is spawned before any is
/// awaited, so one round costs about as long as the slowest host.
pub struct SshGpuSource;

impl SshGpuSource {
    fn spawn(host: &str) -> io::Result<Child> {
        Command::new("ssh")
            .args(["-o", "BatchMode=yes", host, SMI_QUERY])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

impl GpuSource for SshGpuSource {
    fn query(&self, hosts: &[String]) -> Result<HashMap<String, Vec<GpuStat>>> {
        Ok(gather(hosts, SshGpuSource::spawn))
    }
}

/// Start one child per host, then reap every child that started.
///
/// A host whose child cannot be started or fails is left out.
fn gather<F>(hosts: &[String], spawn: F) -> HashMap<String, Vec<GpuStat>>
where
    F: Fn(&str) -> io::Result<Child>,
{
    let mut children = Vec::with_capacity(hosts.len());
    for host in hosts {
        match spawn(host) {
            Ok(child) => children.push((host, child)),
            Err(e) => warn!(host = %host, error = %e, "cannot start nvidia-smi query"),
        }
    }

    let mut stats = HashMap::new();
    for (host, child) in children {
        let output = match child.wait_with_output() {
            Ok(output) => output,
            Err(e) => {
                warn!(host = %host, error = %e, "cannot read nvidia-smi output");
                continue;
            }
        };
        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout);
            stats.insert(host.clone(), parse_smi_csv(&text));
        } else {
            debug!(
                host = %host,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "nvidia-smi query failed"
            );
        }
    }
    stats
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuUsage {
    pub name: String,
    pub vram: String,
    pub utilization: String,
}

impl GpuUsage {
    fn placeholder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vram: "-".to_string(),
            utilization: "-".to_string(),
        }
    }

    pub fn utilization_pct(&self) -> Option<u32> {
        self.utilization.trim_end_matches('%').trim().parse().ok()
    }
}

/// One job's line in the usage table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRow {
    pub job_id: String,
    pub hostname: String,
    pub gpus: Vec<GpuUsage>,
}

impl UsageRow {
    fn column(&self, field: impl Fn(&GpuUsage) -> &str) -> String {
        self.gpus.iter().map(field).collect::<Vec<_>>().join("\n")
    }

    fn cells(&self) -> [String; 5] {
        [
            self.job_id.clone(),
            self.hostname.clone(),
            self.column(|g| g.name.as_str()),
            self.column(|g| g.vram.as_str()),
            self.column(|g| g.utilization.as_str()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub timestamp: String,
    pub rows: Vec<UsageRow>,
}

impl UsageSnapshot {
    pub fn header_cells() -> [&'static str; 5] {
        HEADERS
    }

    pub fn row_cells(&self) -> impl Iterator<Item = [String; 5]> + '_ {
        self.rows.iter().map(UsageRow::cells)
    }

    /// Plain-text grid with the timestamp on the first line.
    pub fn render_text(&self) -> String {
        let header: Vec<String> = HEADERS.iter().map(|h| h.to_string()).collect();
        let rows: Vec<Vec<String>> = self.row_cells().map(|r| r.to_vec()).collect();

        let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
        for row in &rows {
            for (i, cell) in row.iter().enumerate() {
                let widest = cell.lines().map(|l| l.chars().count()).max().unwrap_or(0);
                widths[i] = widths[i].max(widest);
            }
        }

        let rule = |fill: char| {
            let parts: Vec<String> = widths.iter().map(|w| fill.to_string().repeat(w + 2)).collect();
            format!("+{}+\n", parts.join("+"))
        };
        let write_row = |out: &mut String, row: &[String]| {
            let height = row.iter().map(|c| c.lines().count().max(1)).max().unwrap_or(1);
            for line_idx in 0..height {
                out.push('|');
                for (i, cell) in row.iter().enumerate() {
                    let line = cell.lines().nth(line_idx).unwrap_or("");
                    let pad = widths[i] - line.chars().count();
                    let _ = write!(out, " {}{} |", line, " ".repeat(pad));
                }
                out.push('\n');
            }
        };

        let mut out = format!("{}\n", self.timestamp);
        out.push_str(&rule('-'));
        write_row(&mut out, header.as_slice());
        out.push_str(&rule('='));
        for row in &rows {
            write_row(&mut out, row.as_slice());
            out.push_str(&rule('-'));
        }
        out
    }
}

/// Join each job's reserved GPUs with the stats of its host.
pub fn build_rows(experiments: &[Session], stats: &HashMap<String, Vec<GpuStat>>) -> Vec<UsageRow> {
    experiments
        .iter()
        .map(|session| {
            let hostname = session.display_hostname().to_string();
            let reserved = session
                .job
                .limits
                .as_ref()
                .map(|l| l.gpus.as_slice())
                .unwrap_or_default();
            let gpus = match stats.get(session.hostname()) {
                _ if reserved.is_empty() => Vec::new(),
                None => vec![GpuUsage::placeholder("unavailable")],
                Some(host_stats) => reserved
                    .iter()
                    .map(|uuid| match host_stats.iter().find(|s| &s.uuid == uuid) {
                        Some(stat) => GpuUsage {
                            name: stat.name.clone(),
                            vram: format!("{} / {} MiB", stat.memory_used, stat.memory_total),
                            utilization: format!("{} %", stat.utilization),
                        },
                        None => GpuUsage::placeholder(uuid),
                    })
                    .collect(),
            };
            UsageRow {
                job_id: session.job.id.clone(),
                hostname,
                gpus,
            }
        })
        .collect()
}

/// Cooperative stop signal for the poll loop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Watches the GPUs reserved by the user's batch executions.
pub struct GpuMonitor<'a> {
    source: &'a dyn GpuSource,
    experiments: Vec<Session>,
    hostnames: Vec<String>,
}

impl<'a> GpuMonitor<'a> {
    pub fn new(source: &'a dyn GpuSource, sessions: Vec<Session>) -> Self {
        let mut experiments: Vec<Session> = sessions
            .into_iter()
            .filter(|s| !s.job.is_interactive())
            .collect();
        sort_sessions(&mut experiments);
        let hostnames: BTreeSet<String> = experiments
            .iter()
            .map(|s| s.hostname().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        Self {
            source,
            experiments,
            hostnames: hostnames.into_iter().collect(),
        }
    }

    pub fn job_count(&self) -> usize {
        self.experiments.len()
    }

    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    /// One batch query of every host.
    pub fn snapshot(&self) -> Result<UsageSnapshot> {
        let stats = self.source.query(&self.hostnames)?;
        Ok(UsageSnapshot {
            timestamp: chrono::Local::now().format("%m/%d/%Y %H:%M:%S").to_string(),
            rows: build_rows(&self.experiments, &stats),
        })
    }

    /// Redraw every `interval` until the token is cancelled.
    ///
    /// The terminal is restored when the guard drops, whichever way the
    /// loop ends.
    pub fn run_live(&self, interval: Duration, cancel: &CancellationToken) -> Result<()> {
        let mut guard = TerminalGuard::enter()?;
        let mut app = App::new(interval, self.job_count());
        let input_tick = Duration::from_millis(100);

        while !cancel.is_cancelled() {
            match self.snapshot() {
                Ok(snapshot) => app.update(snapshot),
                Err(e) => app.set_error(format!("{:#}", e)),
            }
            guard.terminal().draw(|frame| ui::render(frame, &app))?;

            let deadline = Instant::now() + interval;
            while !cancel.is_cancelled() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                if event::poll(remaining.min(input_tick))? {
                    match event::read()? {
                        Event::Key(key) if ui::is_quit_key(&key) => cancel.cancel(),
                        Event::Resize(_, _) => {
                            guard.terminal().draw(|frame| ui::render(frame, &app))?;
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::testing::{job, node};
    use crate::scheduler::{JobKind, Limits};
    use std::cell::RefCell;

    struct FakeGpus {
        stats: HashMap<String, Vec<GpuStat>>,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl GpuSource for FakeGpus {
        fn query(&self, hosts: &[String]) -> Result<HashMap<String, Vec<GpuStat>>> {
            self.calls.borrow_mut().push(hosts.to_vec());
            Ok(self.stats.clone())
        }
    }

    const SMI: &str = "GPU-a, NVIDIA H100 80GB HBM3, 1024, 81559, 97\n\
                       GPU-b, NVIDIA H100 80GB HBM3, 0, 81559, 0\n\
                       garbage line\n";

    fn execution(id: &str, host: &str, gpus: &[&str]) -> Session {
        let mut j = job(id, JobKind::Execution, host);
        if !gpus.is_empty() {
            j.limits = Some(Limits {
                gpus: gpus.iter().map(|g| g.to_string()).collect(),
                ..Default::default()
            });
        }
        Session {
            job: j,
            node: Some(node(host, host)),
        }
    }

    #[test]
    fn test_parse_smi_csv() {
        let stats = parse_smi_csv(SMI);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].uuid, "GPU-a");
        assert_eq!(stats[0].name, "NVIDIA H100 80GB HBM3");
        assert_eq!(stats[0].utilization, "97");
    }

    #[test]
    fn test_gather_skips_hosts_that_cannot_start() {
        let hosts: Vec<String> = ["ok", "missing", "down"].iter().map(|h| h.to_string()).collect();
        let stats = gather(&hosts, |host| match host {
            "ok" => Command::new("echo")
                .arg("GPU-a, NVIDIA H100 80GB HBM3, 1024, 81559, 97")
                .stdout(Stdio::piped())
                .spawn(),
            "missing" => Err(io::Error::new(io::ErrorKind::NotFound, "no ssh")),
            _ => Command::new("false").stdout(Stdio::piped()).spawn(),
        });
        assert_eq!(stats.keys().collect::<Vec<_>>(), ["ok"]);
        assert_eq!(stats["ok"][0].utilization, "97");
    }

    #[test]
    fn test_build_rows() {
        let mut stats = HashMap::new();
        stats.insert("h1".to_string(), parse_smi_csv(SMI));
        let sessions = vec![
            execution("e1", "h1", &["GPU-b", "GPU-x"]),
            execution("e2", "h2", &["GPU-c"]),
            execution("e3", "h1", &[]),
        ];
        let rows = build_rows(&sessions, &stats);
        assert_eq!(rows[0].gpus[0].vram, "0 / 81559 MiB");
        assert_eq!(rows[0].gpus[0].utilization_pct(), Some(0));
        assert_eq!(rows[0].gpus[1].name, "GPU-x");
        assert_eq!(rows[1].gpus[0].name, "unavailable");
        assert!(rows[2].gpus.is_empty());
    }

    #[test]
    fn test_monitor_queries_unique_hosts_once() {
        let mut stats = HashMap::new();
        stats.insert("h1".to_string(), parse_smi_csv(SMI));
        let source = FakeGpus {
            stats,
            calls: RefCell::new(Vec::new()),
        };
        let mut interactive = execution("s1", "h9", &[]);
        interactive.job.kind = JobKind::Session;
        let sessions = vec![
            execution("e2", "h2", &["GPU-c"]),
            execution("e1", "h1", &["GPU-a"]),
            execution("e0", "h1", &["GPU-b"]),
            interactive,
        ];
        let monitor = GpuMonitor::new(&source, sessions);
        assert_eq!(monitor.job_count(), 3);
        assert_eq!(monitor.hostnames(), ["h1", "h2"]);

        let snapshot = monitor.snapshot().unwrap();
        assert_eq!(source.calls.borrow().len(), 1);
        let order: Vec<&str> = snapshot.rows.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(order, vec!["e0", "e1", "e2"]);
    }

    #[test]
    fn test_render_text_grid() {
        let snapshot = UsageSnapshot {
            timestamp: "01/02/2024 03:04:05".into(),
            rows: vec![UsageRow {
                job_id: "e1".into(),
                hostname: "h1".into(),
                gpus: vec![
                    GpuUsage {
                        name: "H100".into(),
                        vram: "1 / 2 MiB".into(),
                        utilization: "97 %".into(),
                    },
                    GpuUsage {
                        name: "H100".into(),
                        vram: "0 / 2 MiB".into(),
                        utilization: "0 %".into(),
                    },
                ],
            }],
        };
        let text = snapshot.render_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "01/02/2024 03:04:05");
        assert!(lines[1].starts_with("+-----+"));
        assert!(lines[2].starts_with("| Job | Hostname |"));
        assert!(lines[3].starts_with("+=====+"));
        assert!(lines[4].starts_with("| e1  | h1       | H100   | 1 / 2 MiB |"));
        assert!(lines[5].starts_with("|     |          | H100   | 0 / 2 MiB |"));
        assert_eq!(lines.len(), 7);
        let width = lines[1].len();
        assert!(lines[1..].iter().all(|l| l.len() == width));
    }

    #[test]
    fn test_cancellation_token_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
