//! TUI rendering with ratatui
//!
//! Layout, top to bottom: status bar, device and statistics panels, the
//! Start/Stop control bar, and the log pane. The help dialog is drawn on
//! top when open.

use common::metrics::{StatsSnapshot, format_bytes, format_rate};
use common::{LogEntry, LogLevel};
use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::app::{App, Dialog};
use crate::controller::ControllerState;

/// Main render function
pub fn render(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Status bar
            Constraint::Length(8), // Device + statistics
            Constraint::Length(3), // Controls
            Constraint::Min(5),    // Log pane
        ])
        .split(frame.area());

    render_status_bar(frame, app, chunks[0]);
    render_panels(frame, app, chunks[1]);
    render_control_bar(frame, app, chunks[2]);
    render_log(frame, app, chunks[3]);

    match app.dialog() {
        Dialog::None => {}
        Dialog::Help => render_help_dialog(frame),
    }
}

fn render_status_bar(frame: &mut Frame, app: &App, area: Rect) {
    let (state_label, state_color) = state_style(app.state());

    let status_text = vec![
        Span::styled("Target: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            app.controller().descriptor().to_string(),
            Style::default().fg(Color::Cyan),
        ),
        Span::raw("  |  "),
        Span::styled("State: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            state_label,
            Style::default()
                .fg(state_color)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw("  |  "),
        Span::styled("Uptime: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            format_duration(app.uptime()),
            Style::default().fg(Color::Green),
        ),
    ];

    let status = Paragraph::new(Line::from(status_text))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" USB Traffic Generator ")
                .title_alignment(Alignment::Center)
                .border_style(Style::default().fg(Color::Blue)),
        )
        .alignment(Alignment::Center);

    frame.render_widget(status, area);
}

fn render_panels(frame: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    render_device_panel(frame, app, chunks[0]);
    render_stats_panel(frame, app, chunks[1]);
}

fn render_device_panel(frame: &mut Frame, app: &App, area: Rect) {
    let controller = app.controller();

    let device = match controller.device() {
        Some(device) => Span::styled(device.to_string(), Style::default().fg(Color::White)),
        None => Span::styled("not opened", Style::default().fg(Color::DarkGray)),
    };
    let plan = match controller.plan() {
        Some(plan) => Span::styled(plan.describe(), Style::default().fg(Color::White)),
        None => Span::styled("-", Style::default().fg(Color::DarkGray)),
    };

    let lines = vec![
        Line::from(vec![
            Span::styled("VID:PID  ", Style::default().fg(Color::DarkGray)),
            Span::styled(
                controller.descriptor().to_string(),
                Style::default().fg(Color::Cyan),
            ),
        ]),
        Line::from(vec![
            Span::styled("Device   ", Style::default().fg(Color::DarkGray)),
            device,
        ]),
        Line::from(vec![
            Span::styled("Transfer ", Style::default().fg(Color::DarkGray)),
            plan,
        ]),
    ];

    let panel = Paragraph::new(lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray))
                .title(" Device ")
                .title_style(Style::default().fg(Color::White)),
        )
        .wrap(Wrap { trim: true });
    frame.render_widget(panel, area);
}

fn render_stats_panel(frame: &mut Frame, app: &App, area: Rect) {
    let stats = app.stats();

    let failures = stats.errors + stats.timeouts;
    let failure_color = if failures > 0 {
        Color::Red
    } else {
        Color::DarkGray
    };

    let lines = vec![
        Line::from(vec![
            Span::styled("Packets: ", Style::default().fg(Color::DarkGray)),
            Span::styled(stats.packets.to_string(), Style::default().fg(Color::Green)),
            Span::styled(" / ", Style::default().fg(Color::DarkGray)),
            Span::styled(failure_label(&stats), Style::default().fg(failure_color)),
        ]),
        Line::from(vec![
            Span::styled("TX: ", Style::default().fg(Color::DarkGray)),
            Span::styled(
                format_bytes(stats.bytes_sent),
                Style::default().fg(Color::White),
            ),
            Span::styled("  RX: ", Style::default().fg(Color::DarkGray)),
            Span::styled(
                format_bytes(stats.bytes_received),
                Style::default().fg(Color::White),
            ),
        ]),
        Line::from(vec![
            Span::styled("Rate: ", Style::default().fg(Color::DarkGray)),
            Span::styled(
                format_rate(stats.throughput_bps),
                Style::default().fg(Color::Cyan),
            ),
        ]),
        Line::from(vec![
            Span::styled("Latency: ", Style::default().fg(Color::DarkGray)),
            Span::styled(
                stats.latency.format_avg(),
                Style::default().fg(latency_color(stats.latency.avg_us)),
            ),
        ]),
        Line::from(vec![
            Span::styled("Elapsed: ", Style::default().fg(Color::DarkGray)),
            Span::styled(
                stats
                    .elapsed
                    .map(format_duration)
                    .unwrap_or_else(|| "-".to_string()),
                Style::default().fg(Color::White),
            ),
        ]),
    ];

    let panel = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray))
            .title(" Statistics ")
            .title_style(Style::default().fg(Color::White)),
    );
    frame.render_widget(panel, area);
}

/// Error and timeout counts with the share of failed iterations
fn failure_label(stats: &StatsSnapshot) -> String {
    format!(
        "{} errors, {} timeouts ({:.1}%)",
        stats.errors,
        stats.timeouts,
        stats.failure_rate() * 100.0
    )
}

/// Start/Stop buttons; the one that does nothing in the current state is greyed out
fn render_control_bar(frame: &mut Frame, app: &App, area: Rect) {
    let running = app.state() == ControllerState::Running;

    let key_style = Style::default()
        .fg(Color::Yellow)
        .add_modifier(Modifier::BOLD);

    let controls = vec![
        Span::styled(" Start ", button_style(!running, Color::Green)),
        Span::raw(" "),
        Span::styled("s", key_style),
        Span::raw("    "),
        Span::styled(" Stop ", button_style(running, Color::Red)),
        Span::raw(" "),
        Span::styled("x", key_style),
        Span::raw("    "),
        Span::styled("l", key_style),
        Span::raw(" Devices  "),
        Span::styled("c", key_style),
        Span::raw(" Clear  "),
        Span::styled("?", key_style),
        Span::raw(" Help  "),
        Span::styled("q", key_style),
        Span::raw(" Quit"),
    ];

    let bar = Paragraph::new(Line::from(controls))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray)),
        )
        .alignment(Alignment::Center);

    frame.render_widget(bar, area);
}

fn render_log(frame: &mut Frame, app: &App, area: Rect) {
    let height = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = visible_entries(app.log().len(), app.scroll(), height)
        .map(|i| log_line(&app.log()[i]))
        .collect();

    let mut title = format!(" Log ({}) ", app.log().len());
    if app.scroll() > 0 {
        title.push_str(&format!("[-{}] ", app.scroll()));
    }
    if app.dropped() > 0 {
        title.push_str(&format!("[{} dropped] ", app.dropped()));
    }

    let log = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Blue))
            .title(title),
    );
    frame.render_widget(log, area);
}

/// Indices of the entries shown in a pane `height` lines tall
fn visible_entries(len: usize, scroll: usize, height: usize) -> std::ops::Range<usize> {
    let end = len.saturating_sub(scroll);
    end.saturating_sub(height)..end
}

fn log_line(entry: &LogEntry) -> Line<'_> {
    let color = match entry.level {
        LogLevel::Debug => Color::DarkGray,
        LogLevel::Info => Color::White,
        LogLevel::Warn => Color::Yellow,
        LogLevel::Error => Color::Red,
    };

    Line::from(vec![
        Span::styled(
            format_timestamp(entry.timestamp),
            Style::default().fg(Color::DarkGray),
        ),
        Span::raw(" "),
        Span::styled(format!("{:<5}", entry.level), Style::default().fg(color)),
        Span::raw(" "),
        Span::styled(entry.message.as_str(), Style::default().fg(color)),
    ])
}

fn render_help_dialog(frame: &mut Frame) {
    let area = centered_rect(60, 60, frame.area());

    let section = Style::default()
        .fg(Color::Yellow)
        .add_modifier(Modifier::BOLD);
    let key = Style::default().fg(Color::Cyan);

    let help_content = vec![
        Line::from(Span::styled("Traffic", section)),
        Line::from(""),
        Line::from(vec![
            Span::styled("  s / Enter    ", key),
            Span::raw("Start generating traffic"),
        ]),
        Line::from(vec![
            Span::styled("  x / Space    ", key),
            Span::raw("Stop and release the device"),
        ]),
        Line::from(vec![
            Span::styled("  l            ", key),
            Span::raw("List attached USB devices"),
        ]),
        Line::from(""),
        Line::from(Span::styled("Log", section)),
        Line::from(""),
        Line::from(vec![
            Span::styled("  Up / k       ", key),
            Span::raw("Scroll back"),
        ]),
        Line::from(vec![
            Span::styled("  Down / j     ", key),
            Span::raw("Scroll forward"),
        ]),
        Line::from(vec![
            Span::styled("  End / G      ", key),
            Span::raw("Follow newest entries"),
        ]),
        Line::from(vec![
            Span::styled("  c            ", key),
            Span::raw("Clear the log"),
        ]),
        Line::from(""),
        Line::from(Span::styled("General", section)),
        Line::from(""),
        Line::from(vec![
            Span::styled("  ?            ", key),
            Span::raw("Show this help"),
        ]),
        Line::from(vec![
            Span::styled("  Esc          ", key),
            Span::raw("Close dialog"),
        ]),
        Line::from(vec![
            Span::styled("  q / Ctrl+C   ", key),
            Span::raw("Stop traffic and quit"),
        ]),
    ];

    let help_paragraph = Paragraph::new(help_content)
        .block(
            Block::default()
                .title(" Help ")
                .title_alignment(Alignment::Center)
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .wrap(Wrap { trim: false });

    frame.render_widget(Clear, area);
    frame.render_widget(help_paragraph, area);
}

fn state_style(state: ControllerState) -> (&'static str, Color) {
    match state {
        ControllerState::Idle => ("Idle", Color::Yellow),
        ControllerState::Running => ("Running", Color::Green),
    }
}

fn button_style(enabled: bool, color: Color) -> Style {
    if enabled {
        Style::default()
            .fg(Color::Black)
            .bg(color)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::DarkGray).bg(Color::Black)
    }
}

fn latency_color(avg_us: u64) -> Color {
    if avg_us > 50_000 {
        Color::Red
    } else if avg_us > 20_000 {
        Color::Yellow
    } else {
        Color::Green
    }
}

/// Helper to create a centered rectangle
fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

/// Format duration for display
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

/// UTC wall-clock time as `HH:MM:SS.mmm`
fn format_timestamp(timestamp: SystemTime) -> String {
    let since_epoch = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since_epoch.as_secs() % 86_400;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60,
        since_epoch.subsec_millis()
    )
}
