//! TUI application state
//!
//! Owns the traffic controller and the log pane contents, and runs the
//! event loop that ties terminal input, log entries and redraws together.

use anyhow::Result;
use common::{LogEntry, LogFeed, LogLevel, StatsSnapshot};
use crossterm::{
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, backend::CrosstermBackend};
use std::collections::VecDeque;
use std::io::{self, Stdout};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::events::{Action, Event, EventHandler};
use super::ui;
use crate::config::UiSettings;
use crate::controller::{ControllerState, StopOutcome, TrafficController};

/// Current dialog/popup being displayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialog {
    None,
    /// Keybindings
    Help,
}

/// Application state
pub struct App {
    controller: TrafficController,
    /// Log pane contents, oldest first
    log: VecDeque<LogEntry>,
    /// Maximum number of entries kept in `log`
    scrollback: usize,
    /// Entries between the bottom of the pane and the newest entry
    scroll: usize,
    dialog: Dialog,
    should_quit: bool,
    /// Statistics as of the last tick
    stats: StatsSnapshot,
    /// Entries the worker had to drop because the pane fell behind
    dropped: u64,
    start_time: Instant,
}

impl App {
    pub fn new(controller: TrafficController, scrollback: usize) -> Self {
        let stats = controller.stats();
        Self {
            controller,
            log: VecDeque::with_capacity(scrollback.min(4096)),
            scrollback: scrollback.max(1),
            scroll: 0,
            dialog: Dialog::None,
            should_quit: false,
            stats,
            dropped: 0,
            start_time: Instant::now(),
        }
    }

    pub fn controller(&self) -> &TrafficController {
        &self.controller
    }

    pub fn state(&self) -> ControllerState {
        self.controller.state()
    }

    pub fn stats(&self) -> &StatsSnapshot {
        &self.stats
    }

    pub fn log(&self) -> &VecDeque<LogEntry> {
        &self.log
    }

    pub fn scroll(&self) -> usize {
        self.scroll
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn dialog(&self) -> Dialog {
        self.dialog
    }

    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Append an entry to the log pane
    pub fn push_log(&mut self, entry: LogEntry) {
        self.log.push_back(entry);
        while self.log.len() > self.scrollback {
            self.log.pop_front();
        }
        // Keep a scrolled-back view on the same entries
        if self.scroll > 0 {
            self.scroll = (self.scroll + 1).min(self.log.len().saturating_sub(1));
        }
    }

    /// Handle user action
    pub fn handle_action(&mut self, action: Action) {
        match action {
            Action::Quit => {
                if self.dialog != Dialog::None {
                    self.dialog = Dialog::None;
                } else {
                    self.controller.stop();
                    self.should_quit = true;
                }
            }
            Action::CloseDialog => {
                self.dialog = Dialog::None;
            }
            Action::ShowHelp => {
                self.dialog = Dialog::Help;
            }
            Action::Start => {
                if self.dialog == Dialog::None {
                    // Failures are already in the log pane
                    if let Err(e) = self.controller.start() {
                        debug!("Start rejected: {}", e);
                    }
                    self.refresh_stats();
                }
            }
            Action::Stop => {
                if self.dialog == Dialog::None {
                    if self.controller.stop() == StopOutcome::NotRunning {
                        self.push_log(LogEntry::new(LogLevel::Info, "Traffic is not running"));
                    }
                    self.refresh_stats();
                }
            }
            Action::ClearLog => {
                self.log.clear();
                self.scroll = 0;
            }
            Action::ListDevices => {
                if self.dialog == Dialog::None {
                    if let Err(e) = self.controller.list_devices() {
                        debug!("Device listing failed: {}", e);
                    }
                }
            }
            Action::ScrollUp => {
                self.scroll = (self.scroll + 1).min(self.log.len().saturating_sub(1));
            }
            Action::ScrollDown => {
                self.scroll = self.scroll.saturating_sub(1);
            }
            Action::Follow => {
                self.scroll = 0;
            }
            Action::None => {}
        }
    }

    /// Periodic update
    pub fn on_tick(&mut self) {
        if self.controller.worker_finished() {
            // Only a panic ends the worker without Stop
            warn!("Traffic worker exited unexpectedly");
            self.controller.stop();
        }
        self.refresh_stats();
    }

    fn refresh_stats(&mut self) {
        self.stats = self.controller.stats();
    }

    fn set_dropped(&mut self, dropped: u64) {
        if dropped > self.dropped {
            debug!("{} log entries dropped", dropped - self.dropped);
        }
        self.dropped = dropped;
    }
}

/// Terminal wrapper for setup/teardown
pub struct Tui {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl Tui {
    pub fn new() -> Result<Self> {
        let backend = CrosstermBackend::new(io::stdout());
        let terminal = Terminal::new(backend)?;
        Ok(Self { terminal })
    }

    /// Enter TUI mode (raw mode, alternate screen)
    pub fn enter(&mut self) -> Result<()> {
        enable_raw_mode()?;
        execute!(io::stdout(), EnterAlternateScreen)?;
        self.terminal.hide_cursor()?;
        self.terminal.clear()?;
        Ok(())
    }

    /// Exit TUI mode (restore terminal state)
    pub fn exit(&mut self) -> Result<()> {
        disable_raw_mode()?;
        execute!(io::stdout(), LeaveAlternateScreen)?;
        self.terminal.show_cursor()?;
        Ok(())
    }

    pub fn draw(&mut self, app: &App) -> Result<()> {
        self.terminal.draw(|frame| {
            ui::render(frame, app);
        })?;
        Ok(())
    }
}

impl Drop for Tui {
    fn drop(&mut self) {
        // Best effort cleanup
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}

/// Run the TUI until the user quits
///
/// Requires the multi-threaded Tokio runtime: Start and Stop block on the
/// USB worker and run through `block_in_place`.
pub async fn run(controller: TrafficController, feed: LogFeed, settings: &UiSettings) -> Result<()> {
    let mut tui = Tui::new()?;
    tui.enter()?;

    let mut app = App::new(controller, settings.scrollback);
    let mut events = EventHandler::new(settings.tick_rate());

    loop {
        if let Err(e) = tui.draw(&app) {
            error!("Failed to draw UI: {:#}", e);
            break;
        }

        tokio::select! {
            event = events.next() => {
                match event {
                    Some(Event::Key(key)) => {
                        let action = Action::from(key);
                        tokio::task::block_in_place(|| app.handle_action(action));
                    }
                    Some(Event::Resize(_, _)) => {
                        // ratatui picks up the new size on the next draw
                    }
                    Some(Event::Tick) => {
                        tokio::task::block_in_place(|| app.on_tick());
                        app.set_dropped(feed.dropped());
                    }
                    None => break,
                }
            }

            entry = feed.recv() => {
                match entry {
                    Ok(entry) => {
                        app.push_log(entry);
                        for entry in feed.drain() {
                            app.push_log(entry);
                        }
                    }
                    Err(e) => {
                        warn!("Log channel closed: {}", e);
                        break;
                    }
                }
            }
        }

        if app.should_quit() {
            break;
        }
    }

    tui.exit()?;
    Ok(())
}
