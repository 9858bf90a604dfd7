//! Terminal front end
//!
//! Reads commands from stdin, drives the send orchestrator and renders the
//! conversation from its event feed. A send runs alongside the input loop so
//! `/stop` works while a response is streaming.

use crate::config::ClientConfig;
use crate::conversation::{ConversationMessage, Role};
use crate::db::{ChatRecord, Database};
use crate::orchestrator::{ChatEvent, Rejected, SendOrchestrator, SendOutcome};
use crate::settings::{SettingsFile, Theme};
use crate::store::DatabaseStore;
use crate::transport::HttpTransport;
use futures::future::{FutureExt, LocalBoxFuture, OptionFuture};
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const HELP: &str = "\
Commands:
  <text>          ask a question
  /stop           stop the current answer
  /regen          regenerate the last answer
  /delete <n>     remove message n from the view
  /new            start a new chat
  /chats          list saved chats, pinned first
  /search <text>  list chats whose title contains text
  /open <id>      open a saved chat
  /pin <id>       pin a chat to the top of the list
  /unpin <id>     unpin a chat
  /rename <id> <title>  rename a chat
  /rmchat <id>    delete a saved chat
  /clearall       delete every saved chat
  /system [text]  show or set the system prompt
  /theme          toggle dark/light
  /clear          reset all settings
  /dismiss        hide the error banner
  /quit           exit";

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Stop,
    Regenerate,
    /// 1-based position in the rendered list
    Delete(usize),
    NewChat,
    ListChats,
    Search(String),
    Open(String),
    Pin(String),
    Unpin(String),
    Rename { chat_id: String, title: String },
    DeleteChat(String),
    ClearHistory,
    System(Option<String>),
    Theme,
    ClearSettings,
    Dismiss,
    Help,
    Quit,
    Invalid(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Send(line.to_string());
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    match (name, arg) {
        ("stop", _) => Command::Stop,
        ("regen" | "regenerate", _) => Command::Regenerate,
        ("delete", n) => match n.parse::<usize>() {
            Ok(n) if n > 0 => Command::Delete(n),
            _ => Command::Invalid(format!("usage: /delete <n>, got {n:?}")),
        },
        ("new", _) => Command::NewChat,
        ("chats", _) => Command::ListChats,
        ("search", "") => Command::Invalid("usage: /search <text>".to_string()),
        ("search", query) => Command::Search(query.to_string()),
        ("open" | "rmchat" | "pin" | "unpin", "") => {
            Command::Invalid(format!("usage: /{name} <chat id>"))
        }
        ("open", id) => Command::Open(id.to_string()),
        ("pin", id) => Command::Pin(id.to_string()),
        ("unpin", id) => Command::Unpin(id.to_string()),
        ("rmchat", id) => Command::DeleteChat(id.to_string()),
        ("rename", rest) => match rest.split_once(char::is_whitespace) {
            Some((chat_id, title)) if !title.trim().is_empty() => Command::Rename {
                chat_id: chat_id.to_string(),
                title: title.trim().to_string(),
            },
            _ => Command::Invalid("usage: /rename <chat id> <title>".to_string()),
        },
        ("clearall", _) => Command::ClearHistory,
        ("system", "") => Command::System(None),
        ("system", text) => Command::System(Some(text.to_string())),
        ("theme", _) => Command::Theme,
        ("clear", _) => Command::ClearSettings,
        ("dismiss", _) => Command::Dismiss,
        ("help" | "?", _) => Command::Help,
        ("quit" | "exit" | "q", _) => Command::Quit,
        (other, _) => Command::Invalid(format!("unknown command /{other}; try /help")),
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// Prints conversation events incrementally
pub struct Renderer<W: Write> {
    out: W,
    theme: Theme,
    streaming: Option<Streaming>,
}

/// Assistant message currently being printed
struct Streaming {
    id: String,
    /// Text of the current attempt already on screen
    shown: String,
    /// Something follows the label on the current line
    dirty: bool,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W, theme: Theme) -> Self {
        Self {
            out,
            theme,
            streaming: None,
        }
    }

    pub fn set_theme(&mut self, theme: Theme) {
        self.theme = theme;
    }

    fn label(&self, role: Role) -> String {
        let (color, name) = match (self.theme, role) {
            (Theme::Dark, Role::User) => ("36", "you"),
            (Theme::Light, Role::User) => ("34", "you"),
            (Theme::Dark, Role::Assistant) => ("33", "tutor"),
            (Theme::Light, Role::Assistant) => ("35", "tutor"),
        };
        format!("\x1b[1;{color}m{name}>\x1b[0m")
    }

    pub fn line(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "{text}")?;
        self.out.flush()
    }

    pub fn chats(&mut self, chats: &[ChatRecord]) -> io::Result<()> {
        if chats.is_empty() {
            return self.line("(no saved chats)");
        }
        for chat in chats {
            let pin = if chat.pinned { "*" } else { " " };
            writeln!(
                self.out,
                "{pin} {}  {}  ({})",
                chat.id,
                chat.title,
                chat.updated_at.format("%Y-%m-%d %H:%M")
            )?;
        }
        self.out.flush()
    }

    /// Print the whole list with 1-based positions. A message still being
    /// streamed stays attached so later text keeps printing.
    pub fn redraw(&mut self, messages: &[ConversationMessage]) -> io::Result<()> {
        let streaming_id = self.streaming.take().map(|s| s.id);
        writeln!(self.out)?;
        let last = messages.len().checked_sub(1);
        for (i, message) in messages.iter().enumerate() {
            let label = self.label(message.role);
            if streaming_id.as_deref() != Some(message.id.as_str()) {
                writeln!(self.out, "[{}] {label} {}", i + 1, message.content)?;
            } else if Some(i) == last {
                write!(self.out, "[{}] {label} {}", i + 1, message.content)?;
                self.streaming = Some(Streaming {
                    id: message.id.clone(),
                    shown: message.content.clone(),
                    dirty: !message.content.is_empty(),
                });
            } else {
                // Not at the bottom; the next update reprints it there
                writeln!(self.out, "[{}] {label} {}", i + 1, message.content)?;
                self.streaming = Some(Streaming {
                    id: message.id.clone(),
                    shown: String::new(),
                    dirty: true,
                });
            }
        }
        self.out.flush()
    }

    pub fn handle(
        &mut self,
        event: ChatEvent,
        snapshot: impl FnOnce() -> Vec<ConversationMessage>,
    ) -> io::Result<()> {
        match event {
            ChatEvent::MessageAppended { message } => {
                let label = self.label(message.role);
                match message.role {
                    Role::User => writeln!(self.out, "{label} {}", message.content)?,
                    Role::Assistant => {
                        write!(self.out, "{label} {}", message.content)?;
                        self.streaming = Some(Streaming {
                            id: message.id,
                            dirty: !message.content.is_empty(),
                            shown: message.content,
                        });
                    }
                }
            }
            ChatEvent::MessageUpdated { id, content } => self.update(&id, content)?,
            ChatEvent::Done { id, .. } => {
                if self.streaming.as_ref().is_some_and(|s| s.id == id) {
                    self.streaming = None;
                    writeln!(self.out)?;
                }
            }
            ChatEvent::Error { message } => {
                writeln!(self.out, "\n\x1b[1;31m! {message}\x1b[0m (/dismiss to hide)")?;
            }
            ChatEvent::ChatSelected { title, .. } => writeln!(self.out, "(chat: {title})")?,
            ChatEvent::Reset | ChatEvent::Truncated { .. } | ChatEvent::MessageRemoved { .. } => {
                return self.redraw(&snapshot());
            }
            ChatEvent::Retrying { .. } | ChatEvent::ErrorDismissed => {}
        }
        self.out.flush()
    }

    /// Print only what was appended; anything else starts a fresh line
    fn update(&mut self, id: &str, content: String) -> io::Result<()> {
        let label = self.label(Role::Assistant);
        let Some(stream) = self.streaming.as_mut().filter(|s| s.id == id) else {
            return Ok(());
        };

        if content.is_empty() {
            stream.shown.clear();
            return Ok(());
        }
        match content.strip_prefix(stream.shown.as_str()) {
            Some(suffix) if !stream.shown.is_empty() => write!(self.out, "{suffix}")?,
            _ if !stream.dirty => write!(self.out, "{content}")?,
            _ => write!(self.out, "\n{label} {content}")?,
        }
        stream.shown = content;
        stream.dirty = true;
        Ok(())
    }
}

// ============================================================================
// Main loop
// ============================================================================

pub async fn run(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = SettingsFile::load(&config.settings_path)?;

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    let transport = HttpTransport::new(config.endpoint.clone(), config.connect_timeout)?;
    tracing::info!(endpoint = %transport.endpoint(), "Using chat endpoint");

    let orch: SendOrchestrator<HttpTransport, DatabaseStore> =
        SendOrchestrator::new(Arc::new(transport), config.retry)
            .with_store(Arc::new(DatabaseStore::new(db)), config.user_id.clone())
            .with_system_prompt(settings.get().system_prompt.clone());

    let mut events = orch.subscribe();
    let mut renderer = Renderer::new(io::stdout(), settings.get().theme);

    if let Some(chat_id) = settings.get().active_chat_id.clone() {
        if let Err(e) = orch.load_chat(&chat_id).await {
            tracing::warn!(chat_id = %chat_id, error = %e, "Could not reopen last chat");
            settings.update(|s| s.active_chat_id = None)?;
        }
        // Drop the events of the initial load; the redraw below covers them
        while events.try_recv().is_ok() {}
    }
    renderer.redraw(&orch.messages())?;
    renderer.line("Type /help for commands.")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut active: Option<LocalBoxFuture<'_, SendOutcome>> = None;

    loop {
        tokio::select! {
            Some(outcome) = OptionFuture::from(active.as_mut()), if active.is_some() => {
                active = None;
                report(&mut renderer, &outcome)?;
                orch.reconcile().await;
            }

            event = events.recv() => match event {
                Ok(event) => {
                    if let ChatEvent::ChatSelected { chat_id, .. } = &event {
                        let chat_id = chat_id.clone();
                        settings.update(|s| s.active_chat_id = Some(chat_id))?;
                    }
                    renderer.handle(event, || orch.messages())?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Renderer fell behind; redrawing");
                    renderer.redraw(&orch.messages())?;
                }
                Err(RecvError::Closed) => break,
            },

            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                match parse_command(&line) {
                    Command::Send(text) if active.is_none() => {
                        let orch = &orch;
                        active = Some(async move { orch.send(&text).await }.boxed_local());
                    }
                    Command::Regenerate if active.is_none() => {
                        active = Some(orch.regenerate().boxed_local());
                    }
                    Command::Send(_) | Command::Regenerate => {
                        renderer.line("(still answering; /stop first)")?;
                    }
                    Command::Stop => orch.stop(),
                    Command::Delete(n) => {
                        if orch.delete_message(n - 1).is_none() {
                            renderer.line(&format!("(no message {n})"))?;
                        }
                    }
                    Command::NewChat => {
                        orch.reset();
                        settings.update(|s| s.active_chat_id = None)?;
                    }
                    Command::ListChats => match orch.list_chats().await {
                        Ok(chats) => renderer.chats(&chats)?,
                        Err(e) => renderer.line(&format!("(could not list chats: {e})"))?,
                    },
                    Command::Search(query) => match orch.search_chats(&query).await {
                        Ok(chats) => renderer.chats(&chats)?,
                        Err(e) => renderer.line(&format!("(could not search chats: {e})"))?,
                    },
                    Command::Pin(chat_id) => match orch.pin_chat(&chat_id, true).await {
                        Ok(()) => renderer.line("(chat pinned)")?,
                        Err(e) => renderer.line(&format!("(could not pin chat: {e})"))?,
                    },
                    Command::Unpin(chat_id) => match orch.pin_chat(&chat_id, false).await {
                        Ok(()) => renderer.line("(chat unpinned)")?,
                        Err(e) => renderer.line(&format!("(could not unpin chat: {e})"))?,
                    },
                    Command::Rename { chat_id, title } => {
                        if let Err(e) = orch.rename_chat(&chat_id, &title).await {
                            renderer.line(&format!("(could not rename chat: {e})"))?;
                        }
                    }
                    Command::ClearHistory => match orch.delete_all_chats().await {
                        Ok(deleted) => {
                            settings.update(|s| s.active_chat_id = None)?;
                            renderer.line(&format!("(deleted {deleted} chats)"))?;
                        }
                        Err(e) => renderer.line(&format!("(could not delete chats: {e})"))?,
                    },
                    Command::Open(chat_id) => {
                        if let Err(e) = orch.load_chat(&chat_id).await {
                            renderer.line(&format!("(could not open chat: {e})"))?;
                            settings.update(|s| s.active_chat_id = None)?;
                        }
                    }
                    Command::DeleteChat(chat_id) => match orch.delete_chat(&chat_id).await {
                        Ok(()) => {
                            if settings.get().active_chat_id.as_deref() == Some(chat_id.as_str()) {
                                settings.update(|s| s.active_chat_id = None)?;
                            }
                            renderer.line("(chat deleted)")?;
                        }
                        Err(e) => renderer.line(&format!("(could not delete chat: {e})"))?,
                    },
                    Command::System(None) => {
                        let prompt = settings.get().system_prompt.clone();
                        renderer.line(if prompt.is_empty() { "(server default)" } else { &prompt })?;
                    }
                    Command::System(Some(prompt)) => {
                        orch.set_system_prompt(prompt.clone());
                        settings.update(|s| s.system_prompt = prompt)?;
                        renderer.line("(system prompt saved)")?;
                    }
                    Command::Theme => {
                        let theme = settings.get().theme.toggled();
                        settings.update(|s| s.theme = theme)?;
                        renderer.set_theme(theme);
                        renderer.line(&format!("(theme: {theme})"))?;
                    }
                    Command::ClearSettings => {
                        settings.clear()?;
                        orch.set_system_prompt(String::new());
                        renderer.set_theme(settings.get().theme);
                        renderer.line(&format!("(settings cleared: {})", settings.path().display()))?;
                    }
                    Command::Dismiss => {
                        if orch.error_banner().is_none() {
                            renderer.line("(no error to dismiss)")?;
                        }
                        orch.dismiss_error();
                    }
                    Command::Help => renderer.line(HELP)?,
                    Command::Quit => break,
                    Command::Invalid(message) => renderer.line(&format!("({message})"))?,
                }
            }
        }
    }

    orch.stop();
    if let Some(send) = active.take() {
        send.await;
    }
    orch.flush_writes().await;
    Ok(())
}

fn report<W: Write>(renderer: &mut Renderer<W>, outcome: &SendOutcome) -> io::Result<()> {
    match outcome {
        SendOutcome::Rejected(Rejected::EmptyInput) => renderer.line("(nothing to send)"),
        SendOutcome::Rejected(Rejected::Busy) => renderer.line("(still answering; /stop first)"),
        SendOutcome::Rejected(Rejected::NothingToRegenerate) => {
            renderer.line("(nothing to regenerate)")
        }
        SendOutcome::Completed { .. } | SendOutcome::Cancelled { .. } | SendOutcome::Failed { .. } => {
            Ok(())
        }
    }
}
