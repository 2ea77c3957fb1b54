//! TUI event handling
//!
//! Polls crossterm on a Tokio task and forwards key presses, resizes and
//! periodic ticks over a channel.

use crossterm::event::{self, Event as CrosstermEvent, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Terminal event types
#[derive(Debug, Clone)]
pub enum Event {
    Key(KeyEvent),
    Resize(u16, u16),
    /// Periodic status refresh
    Tick,
}

/// User actions derived from keyboard input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start generating traffic
    Start,
    /// Stop generating traffic
    Stop,
    /// Empty the log pane
    ClearLog,
    /// Enumerate attached devices into the log pane
    ListDevices,
    /// Scroll the log pane towards older entries
    ScrollUp,
    /// Scroll the log pane towards newer entries
    ScrollDown,
    /// Jump back to the newest entry
    Follow,
    ShowHelp,
    CloseDialog,
    Quit,
    None,
}

impl From<KeyEvent> for Action {
    fn from(key: KeyEvent) -> Self {
        match key.code {
            KeyCode::Char('q') => Action::Quit,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Action::Quit,
            KeyCode::Esc => Action::CloseDialog,

            KeyCode::Char('s') | KeyCode::Enter => Action::Start,
            KeyCode::Char('x') | KeyCode::Char(' ') => Action::Stop,
            KeyCode::Char('c') => Action::ClearLog,
            KeyCode::Char('l') => Action::ListDevices,
            KeyCode::Char('?') => Action::ShowHelp,

            KeyCode::Up | KeyCode::Char('k') | KeyCode::PageUp => Action::ScrollUp,
            KeyCode::Down | KeyCode::Char('j') | KeyCode::PageDown => Action::ScrollDown,
            KeyCode::End | KeyCode::Char('G') => Action::Follow,

            _ => Action::None,
        }
    }
}

/// Event handler that polls terminal events in a background task
pub struct EventHandler {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
    /// Spawn the polling task
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn new(tick_rate: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut last_tick = Instant::now();

            loop {
                let timeout = tick_rate
                    .checked_sub(last_tick.elapsed())
                    .unwrap_or(Duration::ZERO);

                // crossterm polling blocks, keep it off the async workers
                let polled = tokio::task::spawn_blocking(move || {
                    if event::poll(timeout)? {
                        event::read().map(Some)
                    } else {
                        Ok(None)
                    }
                })
                .await;

                match polled {
                    Ok(Ok(Some(CrosstermEvent::Key(key)))) => {
                        // Ignore key release events on some platforms
                        if key.kind == KeyEventKind::Press && tx.send(Event::Key(key)).is_err() {
                            break;
                        }
                    }
                    Ok(Ok(Some(CrosstermEvent::Resize(width, height)))) => {
                        if tx.send(Event::Resize(width, height)).is_err() {
                            break;
                        }
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(_)) | Err(_) => break,
                }

                if last_tick.elapsed() >= tick_rate {
                    if tx.send(Event::Tick).is_err() {
                        break;
                    }
                    last_tick = Instant::now();
                }
            }
        });

        Self { rx }
    }

    /// Receive the next event
    ///
    /// Returns None if the event channel is closed.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}
