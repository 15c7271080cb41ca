//! Per-conversation runtime.
//!
//! Entering a conversation spawns one task that owns the timeline, the
//! typing indicator, the compose box and the call controller. Inbound
//! channel events, UI commands, timer firings, call work and REST results
//! are all processed by that task one at a time, so none of the component
//! state needs locking. The UI reads a [`ConversationView`] snapshot
//! published after every step and receives [`Notice`]s for failures.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::api::ChatBackend;
use crate::calling::controller::CallSettings;
use crate::calling::media::{MediaResourceManager, RemoteSink};
use crate::calling::peer::PeerConnector;
use crate::calling::{CallInput, CallRole, CallSessionController, CallState};
use crate::chat::{Composer, MessageSynchronizer, TypingIndicatorTracker};
use crate::models::{
    Attachment, Chat, ChatStatus, Identity, Message, OutgoingMessage, RawMessage, TypingUser,
};
use crate::signaling::events::{Namespace, CALL_EVENTS, MESSAGE_EVENTS};
use crate::signaling::{
    ChannelHandle, InboundEvent, OutboundEvent, SignalingChannel, Subscription,
};
use crate::timer::{TimerFired, TimerKind};

/// UI actions.
pub enum Command {
    SetDraft(String),
    /// Send the current draft, optionally with an attachment.
    Send {
        attachment: Option<Attachment>,
    },
    StartCall,
    EndCall,
    AttachRemote(Arc<dyn RemoteSink>),
    /// Mark the chat resolved (admins only).
    Resolve,
    Shutdown,
}

/// User-visible failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    CallFailed(String),
    MessageFailed(String),
    /// A command was refused without doing anything.
    Rejected(String),
    RequestFailed(String),
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::CallFailed(reason) => write!(f, "Call failed: {}", reason),
            Notice::MessageFailed(reason) => write!(f, "Message failed to send: {}", reason),
            Notice::Rejected(reason) => f.write_str(reason),
            Notice::RequestFailed(reason) => f.write_str(reason),
        }
    }
}

/// Snapshot of everything the UI renders.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView {
    pub chat_id: String,
    pub messages: Vec<Message>,
    /// Someone else is typing.
    pub typing: bool,
    pub call_state: CallState,
    pub call_role: CallRole,
    pub remote_party: Option<String>,
    pub remote_tracks: usize,
    pub status: Option<ChatStatus>,
    pub draft: String,
    pub history_loaded: bool,
}

impl ConversationView {
    fn empty(chat_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            messages: Vec::new(),
            typing: false,
            call_state: CallState::Idle,
            call_role: CallRole::None,
            remote_party: None,
            remote_tracks: 0,
            status: None,
            draft: String::new(),
            history_loaded: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub identity: Identity,
    pub typing_timeout: Duration,
    pub call: CallSettings,
}

impl ConversationSettings {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            typing_timeout: Duration::from_millis(3000),
            call: CallSettings::default(),
        }
    }
}

/// UI side of a running conversation.
pub struct ConversationHandle {
    chat_id: String,
    commands: mpsc::UnboundedSender<Command>,
    pub view: watch::Receiver<ConversationView>,
    pub notices: mpsc::UnboundedReceiver<Notice>,
    task: JoinHandle<()>,
}

impl ConversationHandle {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Queue a command. Returns false once the conversation has stopped.
    pub fn send(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            tracing::error!("Conversation {} stopped, command dropped", self.chat_id);
            return false;
        }
        true
    }

    pub fn snapshot(&self) -> ConversationView {
        self.view.borrow().clone()
    }

    /// Stop the event loop and wait until everything is released.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            tracing::error!("Conversation {} task failed: {}", self.chat_id, e);
        }
    }
}

/// Results of REST calls made on behalf of the loop.
enum Work {
    History(Result<Chat>),
    Sent {
        outgoing: OutgoingMessage,
        result: Result<RawMessage>,
    },
    Resolved(Result<ChatStatus>),
}

struct Inputs {
    events: mpsc::UnboundedReceiver<(String, Value)>,
    commands: mpsc::UnboundedReceiver<Command>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    calls: mpsc::UnboundedReceiver<CallInput>,
    work: mpsc::UnboundedReceiver<Work>,
}

struct Conversation {
    chat_id: String,
    identity: Identity,
    channel: ChannelHandle,
    subscriptions: Vec<Subscription>,
    backend: Arc<dyn ChatBackend>,
    timeline: MessageSynchronizer,
    typing: TypingIndicatorTracker,
    composer: Composer,
    calls: CallSessionController,
    status: Option<ChatStatus>,
    history_loaded: bool,
    work: mpsc::UnboundedSender<Work>,
    notices: mpsc::UnboundedSender<Notice>,
    view: watch::Sender<ConversationView>,
}

/// Enter a conversation: open the channel for it, start loading history
/// and spawn its event loop.
pub fn spawn(
    chat_id: &str,
    channel: &SignalingChannel,
    backend: Arc<dyn ChatBackend>,
    media: MediaResourceManager,
    connector: Arc<dyn PeerConnector>,
    settings: ConversationSettings,
) -> ConversationHandle {
    let handle = channel.open(chat_id);

    // One queue for both namespaces keeps the arrival order.
    let (event_tx, events) = mpsc::unbounded_channel();
    let subscriptions = MESSAGE_EVENTS
        .iter()
        .chain(CALL_EVENTS.iter())
        .map(|name| {
            let tx = event_tx.clone();
            let event = name.to_string();
            handle.subscribe(name, move |payload| {
                let _ = tx.send((event.clone(), payload.clone()));
            })
        })
        .collect();

    let (timer_tx, timers) = mpsc::unbounded_channel();
    let (notice_tx, notices) = mpsc::unbounded_channel();
    let (work_tx, work) = mpsc::unbounded_channel();
    let (command_tx, commands) = mpsc::unbounded_channel();
    let (view_tx, view) = watch::channel(ConversationView::empty(chat_id));

    let ConversationSettings {
        identity,
        typing_timeout,
        call,
    } = settings;
    let typing = TypingIndicatorTracker::new(identity.id.clone(), typing_timeout, timer_tx.clone());
    let (calls, call_inputs) = CallSessionController::new(
        identity.id.clone(),
        handle.clone(),
        media,
        connector,
        call,
        timer_tx,
        notice_tx.clone(),
    );

    let conversation = Conversation {
        chat_id: chat_id.to_string(),
        identity,
        channel: handle,
        subscriptions,
        backend,
        timeline: MessageSynchronizer::new(chat_id),
        typing,
        composer: Composer::default(),
        calls,
        status: None,
        history_loaded: false,
        work: work_tx,
        notices: notice_tx,
        view: view_tx,
    };
    conversation.load_history();

    let inputs = Inputs {
        events,
        commands,
        timers,
        calls: call_inputs,
        work,
    };
    let task = tokio::spawn(conversation.run(inputs));

    ConversationHandle {
        chat_id: chat_id.to_string(),
        commands: command_tx,
        view,
        notices,
        task,
    }
}

impl Conversation {
    async fn run(mut self, mut inputs: Inputs) {
        tracing::info!("Conversation {} started", self.chat_id);
        loop {
            tokio::select! {
                Some((name, payload)) = inputs.events.recv() => {
                    self.on_event(&name, &payload).await;
                }
                command = inputs.commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.on_command(command),
                },
                Some(fired) = inputs.timers.recv() => self.on_timer(fired),
                Some(input) = inputs.calls.recv() => self.calls.handle_input(input).await,
                Some(work) = inputs.work.recv() => self.on_work(work),
            }
            self.publish();
        }
        self.close();
    }

    fn load_history(&self) {
        let backend = Arc::clone(&self.backend);
        let chat_id = self.chat_id.clone();
        let work = self.work.clone();
        tokio::spawn(async move {
            let result = backend.fetch_chat(&chat_id).await;
            let _ = work.send(Work::History(result));
        });
    }

    async fn on_event(&mut self, name: &str, payload: &Value) {
        let event = match InboundEvent::parse(name, payload) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(violation) => {
                tracing::warn!("Ignoring event in {}: {}", self.chat_id, violation);
                return;
            }
        };

        if Namespace::of(event.name()) == Some(Namespace::Call) {
            self.calls.handle_inbound(event).await;
            return;
        }
        match event {
            InboundEvent::NewMessage(raw) => {
                if raw.chat_id.as_deref().is_some_and(|id| id != self.chat_id) {
                    tracing::debug!("Ignoring newMessage for another chat");
                    return;
                }
                self.ingest_live(raw);
            }
            InboundEvent::UserTyping(user) => {
                self.typing.on_pulse(&user);
            }
            InboundEvent::ChatStatusUpdated { chat_id, status } => {
                if chat_id == self.chat_id {
                    self.set_status(status);
                }
            }
            _ => {}
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SetDraft(text) => {
                if self.composer.set_draft(text) {
                    self.send_typing_pulse();
                }
            }
            Command::Send { attachment } => match self.composer.outgoing(attachment) {
                Some(outgoing) => self.send_message(outgoing),
                None => self.notify(Notice::Rejected("Nothing to send".to_string())),
            },
            Command::StartCall => {
                if let Err(e) = self.calls.start_call() {
                    self.notify(Notice::Rejected(format!("Cannot start call: {}", e)));
                }
            }
            Command::EndCall => self.calls.end_call(),
            Command::AttachRemote(sink) => self.calls.attach_remote(sink),
            Command::Resolve => self.resolve(),
            // Handled by the loop.
            Command::Shutdown => {}
        }
    }

    fn on_timer(&mut self, fired: TimerFired) {
        match fired.kind {
            TimerKind::TypingClear => {
                self.typing.on_timer(fired.token);
            }
            TimerKind::EndedGrace => {
                self.calls.on_timer(fired.token);
            }
        }
    }

    fn on_work(&mut self, work: Work) {
        match work {
            Work::History(Ok(chat)) => {
                let report = self.timeline.ingest_history(chat.messages);
                for rejected in &report.rejected {
                    tracing::warn!("Rejected history entry in {}: {}", self.chat_id, rejected);
                }
                tracing::info!(
                    "Loaded history for {}: {} new, {} already present",
                    self.chat_id,
                    report.added,
                    report.skipped
                );
                if let Some(status) = chat.status {
                    self.set_status(status);
                }
                self.history_loaded = true;
            }
            Work::History(Err(e)) => {
                tracing::error!("Failed to load history for {}: {:#}", self.chat_id, e);
                self.notify(Notice::RequestFailed(format!("Failed to load history: {:#}", e)));
            }
            Work::Sent {
                outgoing,
                result: Ok(raw),
            } => {
                self.composer.sent(&outgoing);
                self.ingest_live(raw);
            }
            Work::Sent {
                result: Err(e), ..
            } => {
                tracing::error!("Send failed in {}: {:#}", self.chat_id, e);
                self.notify(Notice::MessageFailed(format!("{:#}", e)));
            }
            Work::Resolved(Ok(status)) => {
                tracing::info!("Chat {} is now {}", self.chat_id, status.as_str());
                self.set_status(status);
            }
            Work::Resolved(Err(e)) => {
                tracing::error!("Failed to resolve {}: {:#}", self.chat_id, e);
                self.notify(Notice::RequestFailed(format!("Failed to resolve chat: {:#}", e)));
            }
        }
    }

    fn ingest_live(&mut self, raw: RawMessage) {
        match self.timeline.ingest_live(raw) {
            Ok(outcome) => tracing::debug!("Live message in {}: {:?}", self.chat_id, outcome),
            Err(e) => tracing::warn!("Rejected live message in {}: {}", self.chat_id, e),
        }
    }

    fn set_status(&mut self, status: ChatStatus) {
        self.status = Some(status);
        self.calls.set_chat_open(status == ChatStatus::Open);
    }

    fn send_typing_pulse(&self) {
        let pulse = OutboundEvent::Typing {
            chat_id: self.chat_id.clone(),
            user: TypingUser::from(&self.identity),
        };
        if let Err(e) = self.channel.send(&pulse) {
            tracing::debug!("Typing pulse dropped: {}", e);
        }
    }

    fn send_message(&self, outgoing: OutgoingMessage) {
        let backend = Arc::clone(&self.backend);
        let chat_id = self.chat_id.clone();
        let work = self.work.clone();
        tokio::spawn(async move {
            let result = backend.send_message(&chat_id, &outgoing).await;
            let _ = work.send(Work::Sent { outgoing, result });
        });
    }

    fn resolve(&mut self) {
        if !self.identity.role.can_resolve() {
            self.notify(Notice::Rejected(
                "Only admins can resolve chats".to_string(),
            ));
            return;
        }
        if self.status == Some(ChatStatus::Resolved) {
            self.notify(Notice::Rejected("Chat is already resolved".to_string()));
            return;
        }
        let backend = Arc::clone(&self.backend);
        let chat_id = self.chat_id.clone();
        let work = self.work.clone();
        tokio::spawn(async move {
            let result = backend.update_status(&chat_id, ChatStatus::Resolved).await;
            let _ = work.send(Work::Resolved(result));
        });
    }

    fn notify(&self, notice: Notice) {
        tracing::debug!("Notice for {}: {:?}", self.chat_id, notice);
        let _ = self.notices.send(notice);
    }

    fn publish(&self) {
        let session = self.calls.session();
        let next = ConversationView {
            chat_id: self.chat_id.clone(),
            messages: self.timeline.snapshot(),
            typing: self.typing.is_typing(),
            call_state: self.calls.state(),
            call_role: self.calls.role(),
            remote_party: session.remote_party.clone(),
            remote_tracks: self.calls.remote_track_count(),
            status: self.status,
            draft: self.composer.draft().to_string(),
            history_loaded: self.history_loaded,
        };
        self.view.send_if_modified(|view| {
            if *view == next {
                return false;
            }
            *view = next;
            true
        });
    }

    fn close(mut self) {
        self.calls.dispose();
        self.typing.reset();
        self.subscriptions.clear();
        self.channel.close();
        self.publish();
        tracing::info!("Conversation {} closed", self.chat_id);
    }
}
