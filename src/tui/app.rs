//! TUI application state and main event loop

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures::StreamExt;
use ratatui::DefaultTerminal;

use super::compose::ComposeState;
use super::debug_log::DebugLogState;
use super::log_capture::LogBuffer;
use super::timeline::TimelineState;
use super::ui;
use crate::calling::media::TrackListSink;
use crate::conversation::{Command, ConversationHandle, ConversationView, Notice};
use crate::models::Identity;
use crate::signaling::SignalingChannel;

/// Redraw interval when nothing else happens (connection state, log pane).
const TICK_MS: u64 = 250;

/// Application state
pub struct App {
    pub should_exit: bool,
    pub identity: Identity,
    pub view: ConversationView,
    pub connected: bool,
    pub compose: ComposeState,
    pub timeline: TimelineState,
    pub debug_log: DebugLogState,
    pub remote: Arc<TrackListSink>,
    /// Last notice, shown in the status bar until the next key press.
    pub status_message: Option<String>,
}

impl App {
    pub fn new(identity: Identity, view: ConversationView, log_buffer: LogBuffer) -> Self {
        Self {
            should_exit: false,
            identity,
            view,
            connected: false,
            compose: ComposeState::default(),
            timeline: TimelineState::default(),
            debug_log: DebugLogState::new(log_buffer),
            remote: Arc::new(TrackListSink::default()),
            status_message: None,
        }
    }

    /// Handle a key press. Returns the command to forward, if any.
    pub fn handle_key(&mut self, key: KeyEvent) -> Option<Command> {
        self.status_message = None;
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Esc => {
                self.should_exit = true;
                None
            }
            KeyCode::Char('c') if ctrl => {
                self.should_exit = true;
                None
            }
            KeyCode::Char('u') if ctrl => {
                self.compose.clear();
                Some(self.draft())
            }
            KeyCode::Char(c) if !ctrl => {
                self.compose.insert_char(c);
                Some(self.draft())
            }
            KeyCode::Backspace => {
                self.compose.backspace();
                Some(self.draft())
            }
            KeyCode::Delete => {
                self.compose.delete();
                Some(self.draft())
            }
            KeyCode::Left => {
                self.compose.move_left();
                None
            }
            KeyCode::Right => {
                self.compose.move_right();
                None
            }
            KeyCode::Home => {
                self.compose.move_home();
                None
            }
            KeyCode::End => {
                self.compose.move_end();
                None
            }
            KeyCode::Enter => {
                self.compose.mark_sent();
                Some(Command::Send { attachment: None })
            }
            KeyCode::PageUp if self.debug_log.visible => {
                self.debug_log.scroll_up(10);
                None
            }
            KeyCode::PageDown if self.debug_log.visible => {
                self.debug_log.scroll_down(10);
                None
            }
            KeyCode::PageUp => {
                self.timeline.scroll_up(self.view.messages.len());
                None
            }
            KeyCode::PageDown => {
                self.timeline.scroll_down();
                None
            }
            KeyCode::F(2) => Some(Command::StartCall),
            KeyCode::F(3) => Some(Command::EndCall),
            KeyCode::F(4) => Some(Command::Resolve),
            KeyCode::F(12) => {
                self.debug_log.toggle();
                None
            }
            _ => None,
        }
    }

    fn draft(&self) -> Command {
        Command::SetDraft(self.compose.input.clone())
    }

    pub fn apply_view(&mut self, view: ConversationView) {
        self.compose.on_draft(&view.draft);
        if view.messages.len() > self.view.messages.len() && self.timeline.scroll > 0 {
            // Keep the viewport on the same messages while scrolled back.
            self.timeline.scroll += view.messages.len() - self.view.messages.len();
        }
        self.view = view;
    }

    pub fn on_notice(&mut self, notice: Notice) {
        if matches!(notice, Notice::MessageFailed(_)) {
            self.compose.send_failed();
        }
        self.status_message = Some(notice.to_string());
    }

    pub fn render(&self, frame: &mut ratatui::Frame) {
        ui::render(frame, self);
    }
}

/// Run the TUI for one conversation until the user quits.
pub async fn run(
    mut conversation: ConversationHandle,
    channel: SignalingChannel,
    identity: Identity,
    log_buffer: LogBuffer,
) -> Result<()> {
    tracing::info!("Opening conversation {}", conversation.chat_id());
    let mut terminal = ratatui::init();
    let result = run_app(&mut terminal, &mut conversation, &channel, identity, log_buffer).await;
    ratatui::restore();
    conversation.shutdown().await;
    result
}

async fn run_app(
    terminal: &mut DefaultTerminal,
    conversation: &mut ConversationHandle,
    channel: &SignalingChannel,
    identity: Identity,
    log_buffer: LogBuffer,
) -> Result<()> {
    let mut app = App::new(identity, conversation.snapshot(), log_buffer);
    conversation.send(Command::AttachRemote(app.remote.clone()));

    let mut input = EventStream::new();
    let mut tick = tokio::time::interval(Duration::from_millis(TICK_MS));

    while !app.should_exit {
        app.connected = channel.is_connected();
        app.debug_log.refresh();
        terminal.draw(|frame| app.render(frame))?;

        tokio::select! {
            event = input.next() => match event {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                    if let Some(command) = app.handle_key(key) {
                        if !conversation.send(command) {
                            break;
                        }
                    }
                }
                // Resize and the rest are picked up by the next draw.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("Failed to read terminal input"),
                None => break,
            },
            changed = conversation.view.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = conversation.view.borrow_and_update().clone();
                app.apply_view(view);
            }
            Some(notice) = conversation.notices.recv() => app.on_notice(notice),
            _ = tick.tick() => {}
        }
    }

    Ok(())
}
