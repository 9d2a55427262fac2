use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};

use tapfarm_core::instance::InstanceSnapshot;
use tapfarm_core::logger::{COLOR_BLUE, COLOR_GRAY};
use tapfarm_core::orchestrator::format_duration;
use tapfarm_core::types::{InstanceStatus, OrchestratorState};

use crate::App;

pub fn draw(f: &mut Frame, app: &App) {
    let chunks = if app.log_visible {
        Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
            .split(f.area())
    } else {
        Layout::default().constraints([Constraint::Percentage(100)]).split(f.area())
    };

    let snapshot = app.snapshot();
    let state = snapshot.as_ref().map_or(OrchestratorState::Stopped, |s| s.state);
    let (banner_label, banner_bg) = match state {
        OrchestratorState::Running => ("RUNNING (Press S to stop)", Color::Green),
        OrchestratorState::Stopping => ("STOPPING...", Color::Yellow),
        OrchestratorState::Stopped => ("STOPPED (Press S to start)", Color::Red),
    };

    let key = |k: &'static str| Span::styled(k, Style::default().fg(Color::Yellow));
    let mut lines: Vec<Line> = vec![
        Line::from(vec![
            Span::raw(" "),
            key("j"),
            Span::raw("/"),
            key("k"),
            Span::raw(" select, "),
            key("space"),
            Span::raw(" pause one, "),
            key("p"),
            Span::raw(" pause all, "),
            key("r"),
            Span::raw(" restart, "),
            key("l"),
            Span::raw(" logs"),
        ]),
        Line::from(""),
    ];

    match &snapshot {
        None => lines.push(Line::from(Span::styled("  waiting for first status...", Style::default().fg(Color::DarkGray)))),
        Some(s) => {
            lines.push(Line::from(vec![
                Span::styled(format!(" {}", s.game), Style::default().fg(Color::White).add_modifier(Modifier::BOLD)),
                Span::styled(
                    format!(
                        "  {}  {} sessions  {:.1}/h  {} running  {} paused",
                        format_duration(std::time::Duration::from_secs_f64(s.elapsed)),
                        s.total_sessions,
                        s.sessions_per_hour,
                        s.count(InstanceStatus::Running),
                        s.count(InstanceStatus::Paused),
                    ),
                    Style::default().fg(Color::DarkGray),
                ),
            ]));
            lines.push(Line::from(""));
            for (i, inst) in s.instances.iter().enumerate() {
                lines.extend(instance_lines(inst, i == app.selected));
            }
        }
    }

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(0)])
        .split(chunks[0]);

    let width = left[0].width as usize;
    let pad_left = width.saturating_sub(banner_label.len()) / 2;
    let banner = format!("{:pad_left$}{:<rest$}", "", banner_label, rest = width.saturating_sub(pad_left));
    f.render_widget(
        Paragraph::new(Line::from(Span::styled(
            banner,
            Style::default().fg(Color::Black).bg(banner_bg).add_modifier(Modifier::BOLD),
        ))),
        left[0],
    );

    let list = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::LEFT | Borders::RIGHT | Borders::BOTTOM)
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(list, left[1]);

    if app.log_visible && chunks.len() > 1 {
        let visible_height = chunks[1].height.saturating_sub(2) as usize;
        let total = app.log_messages.len();
        let scroll = app.log_scroll.min(total.saturating_sub(visible_height));
        let start = total.saturating_sub(visible_height + scroll);
        let end = total.saturating_sub(scroll);
        let log_lines: Vec<Line> = app.log_messages[start..end].iter().map(|m| parse_log_line(m)).collect();

        let title = if scroll > 0 { format!(" Logs (+{}) ", scroll) } else { " Logs ".to_string() };
        let panel = Paragraph::new(log_lines)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(Color::Yellow)),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(panel, chunks[1]);
    }

    if let Some((dialog, _)) = &app.confirm {
        dialog.render(f);
    }
}

fn status_color(status: InstanceStatus) -> Color {
    match status {
        InstanceStatus::Running => Color::Green,
        InstanceStatus::Paused => Color::Yellow,
        InstanceStatus::Restarting => Color::Magenta,
        InstanceStatus::Stopped => Color::Red,
    }
}

/// Header row plus an optional error row for one instance.
fn instance_lines(inst: &InstanceSnapshot, selected: bool) -> Vec<Line<'static>> {
    let dim = Style::default().fg(Color::DarkGray);
    let mut header = vec![
        Span::raw(if selected { "> " } else { "  " }),
        Span::styled(format!("#{} ", inst.number), dim),
        Span::styled(inst.device.clone(), Style::default().fg(Color::White).add_modifier(Modifier::BOLD)),
        Span::styled(format!(" [{}]", inst.status), Style::default().fg(status_color(inst.status))),
        Span::styled(format!(" {}", inst.state), Style::default().fg(Color::Cyan)),
        Span::styled(format!(" {}/{}", inst.cursor, inst.actions), dim),
    ];
    if !inst.ready && inst.status == InstanceStatus::Running {
        header.push(Span::styled(" (waiting)", dim));
    }
    header.push(Span::styled(
        format!(
            "  {:.0}s  cycle {}  cnt {}  score {}  sess {}  rst {}",
            inst.elapsed_in_state, inst.cycle_index, inst.counter, inst.score, inst.session_count, inst.restarts
        ),
        dim,
    ));

    let mut lines = vec![Line::from(header)];
    let problem = inst
        .halt_reason
        .as_ref()
        .map(|r| format!("halted: {}", r))
        .or_else(|| (inst.consecutive_failures > 0).then(|| {
            format!("{} failures: {}", inst.consecutive_failures, inst.last_error.as_deref().unwrap_or("?"))
        }));
    if let Some(p) = problem {
        lines.push(Line::from(Span::styled(format!("      {}", p), Style::default().fg(Color::Red))));
    }
    lines
}

/// Parse a structured log line (level\x1fprefix\x1fcolor\x1ftimestamp\x1fmessage)
/// into a colored Line for TUI rendering.
pub fn parse_log_line(raw: &str) -> Line<'_> {
    let parts: Vec<&str> = raw.splitn(5, '\x1f').collect();
    if parts.len() < 5 {
        return Line::from(raw);
    }
    let (level, prefix, color, timestamp, message) = (parts[0], parts[1], parts[2], parts[3], parts[4]);

    let line_color = match color.parse::<u8>().unwrap_or(0) {
        COLOR_GRAY => Color::DarkGray,
        COLOR_BLUE => Color::LightBlue,
        _ => Color::White,
    };

    let mut spans = vec![Span::styled(timestamp, Style::default().fg(Color::DarkGray)), Span::raw(" ")];
    match level {
        "ERROR" => spans.push(Span::styled("error ", Style::default().fg(Color::Red))),
        "WARN" => spans.push(Span::styled("warn ", Style::default().fg(Color::Yellow))),
        "DEBUG" | "TRACE" => spans.push(Span::styled("debug ", Style::default().fg(Color::DarkGray))),
        _ => {}
    }
    if !prefix.is_empty() {
        spans.push(Span::styled(prefix, Style::default().fg(line_color).add_modifier(Modifier::BOLD)));
        spans.push(Span::raw(" "));
    }
    spans.push(Span::styled(message, Style::default().fg(line_color)));
    Line::from(spans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(line: &Line) -> String {
        line.spans.iter().map(|s| s.content.as_ref()).collect()
    }

    #[test]
    fn test_parse_structured_line() {
        let line = parse_log_line("WARN\x1femulator-5554\x1f2\x1f10:00:01\x1ftap failed");
        assert_eq!(text(&line), "10:00:01 warn emulator-5554 tap failed");
        assert_eq!(line.spans.last().unwrap().style.fg, Some(Color::LightBlue));
    }

    #[test]
    fn test_parse_plain_line_falls_back() {
        let line = parse_log_line("plain text");
        assert_eq!(text(&line), "plain text");
    }
}
