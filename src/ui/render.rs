//! Rendering logic using Ratatui.

use super::app::App;
use crate::gpu_monitor::{GpuUsage, UsageRow, UsageSnapshot};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table},
    Frame,
};

/// Render the entire UI.
pub fn render(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(0),    // Table
        ])
        .split(frame.area());

    render_header(frame, app, chunks[0]);
    render_usage_table(frame, app, chunks[1]);
}

/// Render the header panel.
fn render_header(frame: &mut Frame, app: &App, area: Rect) {
    let status = match &app.error {
        Some(error) => Span::styled(
            format!("Last refresh failed: {}", error),
            Style::default().fg(Color::Red),
        ),
        None => Span::styled(
            format!("Press q or Ctrl+C to exit | Refresh #{}", app.refreshes),
            Style::default().fg(Color::DarkGray),
        ),
    };

    let header_text = vec![
        Line::from(Span::styled(
            app.title(),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        )),
        Line::from(status),
    ];

    let header = Paragraph::new(header_text).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Blue)),
    );

    frame.render_widget(header, area);
}

/// Color a utilization reading so idle GPUs stand out.
fn utilization_color(gpu: &GpuUsage) -> Color {
    match gpu.utilization_pct() {
        Some(pct) if pct >= 50 => Color::Green,
        Some(pct) if pct >= 10 => Color::Yellow,
        Some(_) => Color::Red,
        None => Color::DarkGray,
    }
}

/// One line per GPU, so multi-GPU jobs get a taller row.
fn gpu_lines(gpus: &[GpuUsage], field: impl Fn(&GpuUsage) -> String) -> Text<'static> {
    Text::from(gpus.iter().map(|g| Line::from(field(g))).collect::<Vec<_>>())
}

fn usage_row(row: &UsageRow) -> Row<'static> {
    let utilization = Text::from(
        row.gpus
            .iter()
            .map(|g| Line::styled(g.utilization.clone(), Style::default().fg(utilization_color(g))))
            .collect::<Vec<_>>(),
    );
    let height = row.gpus.len().max(1) as u16;

    Row::new(vec![
        Cell::from(row.job_id.clone()).style(Style::default().fg(Color::Cyan)),
        Cell::from(row.hostname.clone()),
        Cell::from(gpu_lines(&row.gpus, |g| g.name.clone())),
        Cell::from(gpu_lines(&row.gpus, |g| g.vram.clone())),
        Cell::from(utilization),
    ])
    .height(height)
}

/// Render the per-job GPU table.
fn render_usage_table(frame: &mut Frame, app: &App, area: Rect) {
    let panel_title = "GPU Usage";
    let block = Block::default()
        .title(panel_title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let snapshot = match &app.snapshot {
        Some(snapshot) if !snapshot.rows.is_empty() => snapshot,
        Some(_) => {
            frame.render_widget(Paragraph::new("No batch jobs").block(block), area);
            return;
        }
        None => {
            frame.render_widget(Paragraph::new("Querying nodes...").block(block), area);
            return;
        }
    };

    let header_cells = UsageSnapshot::header_cells().into_iter().map(|h| {
        Cell::from(h).style(
            Style::default()
                .fg(Color::Magenta)
                .add_modifier(Modifier::BOLD),
        )
    });
    let header = Row::new(header_cells).height(1);
    let rows: Vec<Row> = snapshot.rows.iter().map(usage_row).collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(28),
            Constraint::Length(24),
            Constraint::Min(20),
            Constraint::Length(22),
            Constraint::Length(16),
        ],
    )
    .header(header)
    .block(block);

    frame.render_widget(table, area);
}
