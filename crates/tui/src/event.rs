use std::io;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, MouseEventKind};
use ratatui::{backend::CrosstermBackend, Terminal};

use crate::confirm::Answer;
use crate::ui;
use crate::App;

pub fn run(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, app: &mut App) -> anyhow::Result<()> {
    loop {
        if app.should_quit {
            return Ok(());
        }

        // Pull in new log lines
        app.drain_logs();

        // Draw
        terminal.draw(|f| ui::draw(f, app))?;

        // 100ms poll keeps the status panel fresh without a busy loop
        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        match event::read()? {
            Event::Key(key) if key.kind == KeyEventKind::Press => {
                // An open dialog takes every key
                if let Some((dialog, _)) = app.confirm.as_mut() {
                    if let Answer::Close { accept } = dialog.key(key.code) {
                        app.close_confirm(accept);
                    }
                    continue;
                }
                match key.code {
                    KeyCode::Char('q') | KeyCode::Char('Q') => app.ask_quit(),
                    KeyCode::Up | KeyCode::Char('k') | KeyCode::Char('K') => app.move_up(),
                    KeyCode::Down | KeyCode::Char('j') | KeyCode::Char('J') => app.move_down(),
                    KeyCode::Char(' ') => app.toggle_selected(),
                    KeyCode::Char('s') | KeyCode::Char('S') => app.start_stop(),
                    KeyCode::Char('p') | KeyCode::Char('P') => app.pause_resume_all(),
                    KeyCode::Char('r') | KeyCode::Char('R') => app.ask_restart_selected(),
                    KeyCode::Char('l') | KeyCode::Char('L') => app.toggle_log(),
                    // Log panel scrolling
                    KeyCode::PageUp => app.scroll_log_up(10),
                    KeyCode::PageDown => app.scroll_log_down(10),
                    _ => {}
                }
            }
            Event::Mouse(mouse) => match mouse.kind {
                MouseEventKind::ScrollUp => app.scroll_log_up(3),
                MouseEventKind::ScrollDown => app.scroll_log_down(3),
                _ => {}
            },
            _ => {}
        }
    }
}
