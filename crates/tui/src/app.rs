use std::sync::mpsc;

use tapfarm_core::sink::{OrchestratorSnapshot, SharedStatus};
use tapfarm_core::types::{Command, InstanceStatus, OrchestratorState};

use crate::confirm::ConfirmDialog;

/// Keep at most this many log rows in memory.
const LOG_CAPACITY: usize = 5000;

/// What a confirmed dialog should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    Quit,
    Restart(usize),
}

pub struct App {
    pub status: SharedStatus,
    pub selected: usize,
    pub log_visible: bool,
    pub log_messages: Vec<String>,
    pub log_scroll: usize, // scroll offset from bottom (0 = latest)
    pub log_rx: mpsc::Receiver<String>,
    pub cmd_tx: mpsc::Sender<Command>,
    pub confirm: Option<(ConfirmDialog, Pending)>,
    pub should_quit: bool,
}

impl App {
    pub fn new(status: SharedStatus, log_rx: mpsc::Receiver<String>, cmd_tx: mpsc::Sender<Command>) -> Self {
        Self {
            status,
            selected: 0,
            log_visible: true,
            log_messages: Vec::new(),
            log_scroll: 0,
            log_rx,
            cmd_tx,
            confirm: None,
            should_quit: false,
        }
    }

    pub fn snapshot(&self) -> Option<OrchestratorSnapshot> {
        self.status.latest()
    }

    pub fn drain_logs(&mut self) {
        while let Ok(msg) = self.log_rx.try_recv() {
            self.log_messages.push(msg);
            if self.log_scroll > 0 {
                // keep the viewport on the same rows while scrolled back
                self.log_scroll += 1;
            }
        }
        if self.log_messages.len() > LOG_CAPACITY {
            let excess = self.log_messages.len() - LOG_CAPACITY;
            self.log_messages.drain(..excess);
        }
    }

    pub fn scroll_log_up(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_add(n);
    }

    pub fn scroll_log_down(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(n);
    }

    fn instance_count(&self) -> usize {
        self.snapshot().map_or(0, |s| s.instances.len())
    }

    pub fn move_up(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    pub fn move_down(&mut self) {
        if self.selected + 1 < self.instance_count() {
            self.selected += 1;
        }
    }

    fn send(&self, cmd: Command) {
        self.cmd_tx.send(cmd).ok();
    }

    /// Pause or resume the selected instance.
    pub fn toggle_selected(&mut self) {
        self.send(Command::Toggle(self.selected));
    }

    pub fn start_stop(&mut self) {
        let running = self.snapshot().is_some_and(|s| s.state == OrchestratorState::Running);
        self.send(if running { Command::StopAll } else { Command::StartAll });
    }

    /// Pause everything, or resume everything when nothing is running.
    pub fn pause_resume_all(&mut self) {
        let any_running = self.snapshot().is_some_and(|s| s.count(InstanceStatus::Running) > 0);
        self.send(if any_running { Command::PauseAll } else { Command::ResumeAll });
    }

    pub fn ask_restart_selected(&mut self) {
        if self.selected < self.instance_count() {
            let dialog = ConfirmDialog::new(format!("Restart instance #{}?", self.selected + 1));
            self.confirm = Some((dialog, Pending::Restart(self.selected)));
        }
    }

    pub fn ask_quit(&mut self) {
        self.confirm = Some((ConfirmDialog::new("Stop all instances and quit?"), Pending::Quit));
    }

    /// Close the dialog, running its action when Yes was chosen.
    pub fn close_confirm(&mut self, accept: bool) {
        let Some((dialog, pending)) = self.confirm.take() else {
            return;
        };
        if !(accept && dialog.selected) {
            return;
        }
        match pending {
            Pending::Quit => self.quit(),
            Pending::Restart(i) => self.send(Command::Restart(i)),
        }
    }

    pub fn toggle_log(&mut self) {
        self.log_visible = !self.log_visible;
    }

    pub fn quit(&mut self) {
        self.send(Command::Quit);
        self.should_quit = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapfarm_core::sink::StatusSink;

    fn app() -> (App, mpsc::Receiver<Command>, mpsc::Sender<String>) {
        let (log_tx, log_rx) = mpsc::channel();
        let (cmd_tx, cmd_rx) = mpsc::channel();
        (App::new(SharedStatus::new(), log_rx, cmd_tx), cmd_rx, log_tx)
    }

    #[test]
    fn test_quit_needs_confirmation() {
        let (mut app, cmds, _logs) = app();
        app.ask_quit();
        app.close_confirm(true);
        assert!(!app.should_quit);
        assert!(cmds.try_recv().is_err());

        app.ask_quit();
        if let Some((dialog, _)) = app.confirm.as_mut() {
            dialog.toggle();
        }
        app.close_confirm(true);
        assert!(app.should_quit);
        assert_eq!(cmds.try_recv().unwrap(), Command::Quit);
    }

    #[test]
    fn test_start_stop_follows_orchestrator_state() {
        let (mut app, cmds, _logs) = app();
        app.start_stop();
        assert_eq!(cmds.try_recv().unwrap(), Command::StartAll);

        app.status.publish(&OrchestratorSnapshot {
            game: "demo".into(),
            state: OrchestratorState::Running,
            elapsed: 1.0,
            total_sessions: 0,
            sessions_per_hour: 0.0,
            instances: Vec::new(),
        });
        app.start_stop();
        assert_eq!(cmds.try_recv().unwrap(), Command::StopAll);
    }

    #[test]
    fn test_scrolled_log_keeps_position() {
        let (mut app, _cmds, logs) = app();
        logs.send("a".into()).unwrap();
        app.drain_logs();
        app.scroll_log_up(1);
        logs.send("b".into()).unwrap();
        app.drain_logs();
        assert_eq!(app.log_scroll, 2);
        assert_eq!(app.log_messages, vec!["a", "b"]);
    }
}
