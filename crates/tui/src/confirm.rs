use crossterm::event::KeyCode;
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph},
    Frame,
};

/// Yes/No dialog. Starts on No.
pub struct ConfirmDialog {
    pub message: String,
    pub selected: bool, // true = Yes
}

/// Result of a key press inside the dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Pending,
    /// Enter on the current choice, or y/n
    Close { accept: bool },
}

impl ConfirmDialog {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), selected: false }
    }

    pub fn toggle(&mut self) {
        self.selected = !self.selected;
    }

    pub fn key(&mut self, code: KeyCode) -> Answer {
        match code {
            KeyCode::Left | KeyCode::Right | KeyCode::Tab | KeyCode::Char('h') | KeyCode::Char('l') => {
                self.toggle();
                Answer::Pending
            }
            KeyCode::Char('y') | KeyCode::Char('Y') => {
                self.selected = true;
                Answer::Close { accept: true }
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => Answer::Close { accept: false },
            KeyCode::Enter => Answer::Close { accept: true },
            _ => Answer::Pending,
        }
    }

    pub fn render(&self, f: &mut Frame) {
        let width = (self.message.chars().count() as u16 + 6).max(30);
        let area = centered_rect(width, 7, f.area());

        // Whatever the dashboard drew here goes away
        f.render_widget(Clear, area);

        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow))
            .title(" Confirm ");
        let inner = block.inner(area);
        f.render_widget(block, area);

        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1), // padding
                Constraint::Length(1), // question
                Constraint::Length(1), // gap
                Constraint::Length(1), // yes / no
            ])
            .split(inner);

        // Question
        let message = Paragraph::new(Line::from(Span::styled(
            &self.message,
            Style::default().fg(Color::White),
        )))
        .alignment(Alignment::Center);
        f.render_widget(message, rows[1]);

        // Buttons, the focused one highlighted
        let chosen = |bg| Style::default().fg(Color::Black).bg(bg).add_modifier(Modifier::BOLD);
        let idle = Style::default().fg(Color::DarkGray);
        let buttons = Line::from(vec![
            Span::styled("  [Yes]  ", if self.selected { chosen(Color::Green) } else { idle }),
            Span::raw("   "),
            Span::styled("  [No]  ", if self.selected { idle } else { chosen(Color::Red) }),
        ]);
        f.render_widget(Paragraph::new(buttons).alignment(Alignment::Center), rows[3]);
    }
}

/// Return a centered `Rect` of `width` columns and `height` rows inside `area`.
fn centered_rect(width: u16, height: u16, area: Rect) -> Rect {
    let x = area.x + area.width.saturating_sub(width) / 2;
    let y = area.y + area.height.saturating_sub(height) / 2;
    Rect::new(x, y, width.min(area.width), height.min(area.height))
}
