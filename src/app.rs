use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{Duration as ChronoDuration, Utc};
use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use chatline::conversation::{PartitionInfo, PartitionState};
use chatline::{
    Conversation, ConversationId, ConversationView, DocumentStore, MemoryStore, Message,
    MessageBody, MessageDraft, PartitionKey, SessionError, SessionEvent, Timeline, UserId,
};

#[derive(Debug, Clone, PartialEq)]
pub enum InputMode {
    Normal,
    Editing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Open(Conversation),
    Attach(PathBuf),
    Close,
    Refresh,
    Retry,
    Help,
    Quit,
}

impl Command {
    /// Parse a `/command`. The error is the line to show the user.
    pub fn parse(input: &str) -> Result<Self, String> {
        let parts: Vec<&str> = input.trim_start_matches('/').split_whitespace().collect();
        let Some(name) = parts.first() else {
            return Err("Empty command. Type /help for available commands.".to_string());
        };

        match (name.to_lowercase().as_str(), &parts[1..]) {
            ("dm" | "d", [peer]) => Ok(Command::Open(Conversation::direct(*peer))),
            ("dm" | "d", _) => Err("Usage: /dm <user>".to_string()),
            ("group" | "g", [group]) => Ok(Command::Open(Conversation::group(*group))),
            ("group" | "g", _) => Err("Usage: /group <id>".to_string()),
            ("attach" | "a", []) => Err("Usage: /attach <path>".to_string()),
            ("attach" | "a", path) => Ok(Command::Attach(PathBuf::from(path.join(" ")))),
            ("close" | "leave", _) => Ok(Command::Close),
            ("refresh", _) => Ok(Command::Refresh),
            ("retry", _) => Ok(Command::Retry),
            ("help" | "h" | "commands", _) => Ok(Command::Help),
            ("quit" | "q" | "exit", _) => Ok(Command::Quit),
            (other, _) => Err(format!(
                "Unknown command: {}. Type /help for available commands.",
                other
            )),
        }
    }
}

pub struct App {
    pub should_quit: bool,
    pub input_mode: InputMode,
    pub input: String,
    /// In chars, not bytes.
    pub cursor_position: usize,
    pub scroll_offset: usize,

    pub backend_label: String,
    pub timeline: Timeline,
    pub partitions: Vec<PartitionInfo>,
    pub status_messages: Vec<String>,

    view: ConversationView,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl App {
    pub fn new(view: ConversationView, backend_label: impl Into<String>) -> Self {
        let mut app = Self {
            should_quit: false,
            input_mode: InputMode::Normal,
            input: String::new(),
            cursor_position: 0,
            scroll_offset: 0,

            backend_label: backend_label.into(),
            timeline: Timeline::default(),
            partitions: Vec::new(),
            status_messages: Vec::new(),

            view,
            events_rx: None,
        };

        app.add_status_message(format!(
            "chatline v{} - signed in as {} ({})",
            env!("CARGO_PKG_VERSION"),
            app.me(),
            app.backend_label
        ));
        app.add_status_message("Type /help for commands.".to_string());
        app
    }

    pub fn me(&self) -> &UserId {
        self.view.me()
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.view.current().map(|session| session.conversation())
    }

    pub async fn handle_input(&mut self, event: Event) -> Result<()> {
        if let Event::Key(key) = event {
            self.handle_key_event(key).await?;
        }
        Ok(())
    }

    async fn handle_key_event(&mut self, key: KeyEvent) -> Result<()> {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return Ok(());
        }

        match self.input_mode {
            InputMode::Normal => match key.code {
                KeyCode::Char('q') => self.should_quit = true,
                KeyCode::Char('i') | KeyCode::Enter => self.input_mode = InputMode::Editing,
                KeyCode::Up => self.scroll_up(1),
                KeyCode::Down => self.scroll_offset = self.scroll_offset.saturating_sub(1),
                KeyCode::PageUp => self.scroll_up(10),
                KeyCode::PageDown => self.scroll_offset = self.scroll_offset.saturating_sub(10),
                _ => {}
            },
            InputMode::Editing => match key.code {
                KeyCode::Enter => {
                    let input = std::mem::take(&mut self.input);
                    self.cursor_position = 0;
                    self.input_mode = InputMode::Normal;
                    self.submit_input(&input).await?;
                }
                KeyCode::Char(c) => {
                    let at = self.byte_offset(self.cursor_position);
                    self.input.insert(at, c);
                    self.cursor_position += 1;
                }
                KeyCode::Backspace if self.cursor_position > 0 => {
                    self.cursor_position -= 1;
                    let at = self.byte_offset(self.cursor_position);
                    self.input.remove(at);
                }
                KeyCode::Delete if self.cursor_position < self.input_len() => {
                    let at = self.byte_offset(self.cursor_position);
                    self.input.remove(at);
                }
                KeyCode::Left => self.cursor_position = self.cursor_position.saturating_sub(1),
                KeyCode::Right => {
                    self.cursor_position = (self.cursor_position + 1).min(self.input_len())
                }
                KeyCode::Home => self.cursor_position = 0,
                KeyCode::End => self.cursor_position = self.input_len(),
                KeyCode::Esc => {
                    self.input.clear();
                    self.cursor_position = 0;
                    self.input_mode = InputMode::Normal;
                }
                _ => {}
            },
        }
        Ok(())
    }

    /// Toward older messages, never past the first one.
    fn scroll_up(&mut self, lines: usize) {
        self.scroll_offset = (self.scroll_offset + lines).min(self.timeline.len().saturating_sub(1));
    }

    fn input_len(&self) -> usize {
        self.input.chars().count()
    }

    fn byte_offset(&self, chars: usize) -> usize {
        self.input
            .char_indices()
            .nth(chars)
            .map(|(i, _)| i)
            .unwrap_or(self.input.len())
    }

    pub async fn submit_input(&mut self, input: &str) -> Result<()> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(());
        }

        if input.starts_with('/') {
            match Command::parse(input) {
                Ok(command) => self.run_command(command).await?,
                Err(usage) => self.add_status_message(usage),
            }
        } else {
            self.send_text(input).await;
        }
        Ok(())
    }

    pub async fn run_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Open(conversation) => self.open_conversation(conversation).await?,
            Command::Attach(path) => self.send_attachment(&path).await,
            Command::Close => match self.conversation().cloned() {
                Some(conversation) => {
                    self.close_conversation();
                    self.add_status_message(format!("Closed {}", conversation));
                }
                None => self.add_status_message("No conversation open".to_string()),
            },
            Command::Refresh => match self.view.current().cloned() {
                Some(session) => match session.refresh_membership().await {
                    Ok(()) => self.add_status_message("Membership refreshed".to_string()),
                    Err(e) => self.add_status_message(format!("Refresh failed: {}", e)),
                },
                None => self.add_status_message("No conversation open".to_string()),
            },
            Command::Retry => match self.view.current() {
                Some(session) => {
                    let count = session.reopen_failed();
                    self.add_status_message(format!("Reopened {} failed feed(s)", count));
                }
                None => self.add_status_message("No conversation open".to_string()),
            },
            Command::Help => self.show_help(),
            Command::Quit => self.should_quit = true,
        }
        Ok(())
    }

    /// One conversation at a time: the previous session is closed first.
    pub async fn open_conversation(&mut self, conversation: Conversation) -> Result<()> {
        self.close_conversation();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = match self.view.open(conversation.clone(), events_tx).await {
            Ok(session) => session,
            Err(SessionError::AlreadyOpen { open }) => {
                self.add_status_message(format!("{} is still open", open));
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        self.events_rx = Some(events_rx);
        self.timeline = session.timeline();
        self.partitions = session.partitions();

        info!(conversation = %conversation, "conversation opened");
        self.add_status_message(format!(
            "Opened {} ({} feed(s))",
            conversation,
            self.partitions.len()
        ));
        Ok(())
    }

    fn close_conversation(&mut self) {
        self.view.close();
        self.events_rx = None;
        self.timeline = Timeline::default();
        self.partitions.clear();
        self.scroll_offset = 0;
    }

    async fn send_text(&mut self, text: &str) {
        let Some(session) = self.view.current().cloned() else {
            self.add_status_message(
                "No conversation open. Use /dm <user> or /group <id>.".to_string(),
            );
            return;
        };
        if let Err(e) = session.send_text(text).await {
            self.add_status_message(format!("Send failed: {}", e));
        }
    }

    async fn send_attachment(&mut self, path: &Path) {
        let Some(session) = self.view.current().cloned() else {
            self.add_status_message(
                "No conversation open. Use /dm <user> or /group <id>.".to_string(),
            );
            return;
        };
        let (name, data) = match read_attachment(path).await {
            Ok(attachment) => attachment,
            Err(e) => {
                self.add_status_message(format!("Attach failed: {:#}", e));
                return;
            }
        };
        match session.send_attachment(&name, &data).await {
            Ok(_) => self.add_status_message(format!("Sent {}", name)),
            Err(e) => self.add_status_message(format!("Send failed: {}", e)),
        }
    }

    fn show_help(&mut self) {
        let help_text = [
            "Commands:",
            "/dm <user> - Open a direct conversation",
            "/group <id> - Open a group conversation",
            "/attach <path> - Send a file",
            "/close - Close the current conversation",
            "/refresh - Re-read the group member list",
            "/retry - Reopen feeds that failed",
            "/help - Show this help",
            "/quit - Exit",
            "",
            "Keys: i/Enter=type, Esc=stop typing, q=quit, Up/Down/PgUp/PgDn=scroll",
        ];

        for line in help_text {
            self.add_status_message(line.to_string());
        }
    }

    pub fn add_status_message(&mut self, message: String) {
        self.status_messages.push(format!(
            "[{}] {}",
            chrono::Local::now().format("%H:%M:%S"),
            message
        ));

        if self.status_messages.len() > 1000 {
            self.status_messages.remove(0);
        }
    }

    /// Apply everything the open session pushed since the last tick.
    pub fn on_tick(&mut self) {
        let mut events = Vec::new();
        if let Some(rx) = self.events_rx.as_mut() {
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
        }

        for event in events {
            match event {
                SessionEvent::Timeline(timeline) => self.timeline = timeline,
                SessionEvent::Warning(warning) => {
                    self.add_status_message(format!("warning: {}", warning))
                }
                SessionEvent::PartitionsChanged(partitions) => self.partitions = partitions,
                SessionEvent::Closed => self.events_rx = None,
            }
        }
    }

    pub fn failed_partitions(&self) -> usize {
        self.partitions
            .iter()
            .filter(|p| p.state == PartitionState::Failed)
            .count()
    }

    /// `scroll_offset` counts lines up from the newest message.
    pub fn get_visible_messages(&self, height: usize) -> &[Message] {
        let messages = self.timeline.messages();
        let offset = self.scroll_offset.min(messages.len().saturating_sub(height));
        let end = messages.len() - offset;
        let start = end.saturating_sub(height);
        &messages[start..end]
    }

    pub fn get_visible_status_messages(&self, height: usize) -> &[String] {
        let start = self.status_messages.len().saturating_sub(height);
        &self.status_messages[start..]
    }
}

/// File name and `data:` URL for the file at `path`.
async fn read_attachment(path: &Path) -> Result<(String, String)> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} is not a file", path.display()))?;
    let data = format!("data:{};base64,{}", mime_type(path), STANDARD.encode(bytes));
    Ok((name, data))
}

fn mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Populate `store` with a direct conversation with `bob` and a group
/// `rustaceans` (me, bob, carol), then keep the group chatting in the
/// background.
pub fn seed_demo(store: &MemoryStore, me: &UserId) {
    let bob = UserId::new("bob");
    let carol = UserId::new("carol");
    let group = ConversationId::new("rustaceans");
    let now = Utc::now();
    let at = |minutes_ago: i64| Some(now - ChronoDuration::minutes(minutes_ago));

    let to_bob = PartitionKey::new(ConversationId::from(&bob), me.clone());
    let to_me = PartitionKey::new(ConversationId::from(me), bob.clone());
    store.insert(&to_me, Message::new("demo-1", bob.clone(), MessageBody::text("hey, you around?"), at(42)));
    store.insert(&to_bob, Message::new("demo-2", me.clone(), MessageBody::text("yep, what's up"), at(41)));
    store.insert(&to_me, Message::new("demo-3", bob.clone(), MessageBody::attachment("plan.png", "data:image/png;base64,iVBORw0KGgo="), at(40)));

    store.set_members(&group, vec![me.clone(), bob.clone(), carol.clone()]);
    let from = |user: &UserId| PartitionKey::new(group.clone(), user.clone());
    store.insert(&from(&carol), Message::new("demo-4", carol.clone(), MessageBody::text("standup in 5"), at(15)));
    store.insert(&from(&bob), Message::new("demo-5", bob.clone(), MessageBody::text("on my way"), at(14)));
    store.insert(&from(me), Message::new("demo-6", me.clone(), MessageBody::text("joining"), at(13)));

    let store = store.clone();
    tokio::spawn(async move {
        let lines = [
            (carol.clone(), "anyone seen the release notes?"),
            (bob.clone(), "drafting them now"),
            (carol, "thanks!"),
        ];
        for (author, text) in lines {
            tokio::time::sleep(Duration::from_secs(8)).await;
            let key = PartitionKey::new(group.clone(), author.clone());
            let _ = store.append_message(&key, MessageDraft::text(author, text)).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatline::conversation::FeedRegistry;
    use chatline::SessionOptions;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn app_with(store: &MemoryStore) -> App {
        let registry = FeedRegistry::new(Arc::new(store.clone()));
        let view = ConversationView::new(registry, UserId::new("ana"), SessionOptions::default());
        App::new(view, "memory")
    }

    async fn settle(app: &mut App) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        app.on_tick();
    }

    #[test]
    fn commands_parse() {
        assert_eq!(Command::parse("/dm bob"), Ok(Command::Open(Conversation::direct("bob"))));
        assert_eq!(Command::parse("/g rust"), Ok(Command::Open(Conversation::group("rust"))));
        assert_eq!(Command::parse("/QUIT"), Ok(Command::Quit));
        assert_eq!(
            Command::parse("/attach my notes.txt"),
            Ok(Command::Attach(PathBuf::from("my notes.txt")))
        );
        assert!(Command::parse("/attach").is_err());
        assert!(Command::parse("/dm").is_err());
        assert!(Command::parse("/dance").is_err());
    }

    #[tokio::test]
    async fn typed_text_lands_in_the_open_conversation() {
        let store = MemoryStore::new();
        let mut app = app_with(&store);

        app.submit_input("/dm bob").await.unwrap();
        app.submit_input("hello there").await.unwrap();
        settle(&mut app).await;

        assert_eq!(app.timeline.len(), 1);
        assert_eq!(app.timeline.messages()[0].body.preview(), "hello there");
        assert_eq!(app.partitions.len(), 2);
    }

    #[tokio::test]
    async fn switching_conversations_replaces_the_timeline() {
        let store = MemoryStore::new();
        let me = UserId::new("ana");
        seed_demo(&store, &me);
        let mut app = app_with(&store);

        app.run_command(Command::Open(Conversation::direct("bob"))).await.unwrap();
        settle(&mut app).await;
        assert_eq!(app.timeline.ids(), vec!["demo-1", "demo-2", "demo-3"]);

        app.run_command(Command::Open(Conversation::group("rustaceans"))).await.unwrap();
        settle(&mut app).await;
        assert_eq!(app.timeline.ids(), vec!["demo-4", "demo-5", "demo-6"]);
        assert_eq!(app.partitions.len(), 3);
    }

    #[tokio::test]
    async fn sending_without_a_conversation_only_reports() {
        let store = MemoryStore::new();
        let mut app = app_with(&store);
        let before = app.status_messages.len();

        app.submit_input("hello?").await.unwrap();

        assert_eq!(app.status_messages.len(), before + 1);
        assert!(app.timeline.is_empty());
    }

    #[test]
    fn cursor_edits_respect_multibyte_chars() {
        let store = MemoryStore::new();
        let mut app = app_with(&store);
        app.input = "héllo".to_string();
        app.cursor_position = 2;

        assert_eq!(app.byte_offset(app.cursor_position), 3);
        assert_eq!(app.input_len(), 5);
    }

    #[tokio::test]
    async fn attached_files_arrive_as_data_urls() {
        let store = MemoryStore::new();
        let mut app = app_with(&store);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.PNG");
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

        app.submit_input("/dm bob").await.unwrap();
        app.submit_input(&format!("/attach {}", path.display())).await.unwrap();
        settle(&mut app).await;

        assert_eq!(app.timeline.len(), 1);
        let body = &app.timeline.messages()[0].body;
        assert!(body.is_image());
        assert_eq!(body, &MessageBody::attachment("cat.PNG", "data:image/png;base64,iVBORw=="));
    }

    #[tokio::test]
    async fn unreadable_attachment_is_reported() {
        let store = MemoryStore::new();
        let mut app = app_with(&store);
        app.submit_input("/dm bob").await.unwrap();

        app.run_command(Command::Attach(PathBuf::from("/no/such/file.png"))).await.unwrap();
        settle(&mut app).await;

        assert!(app.timeline.is_empty());
        assert!(app.status_messages.last().unwrap().contains("Attach failed"));
    }

    #[tokio::test]
    async fn scrolling_stays_within_the_timeline() {
        let store = MemoryStore::new();
        let me = UserId::new("ana");
        let bob = UserId::new("bob");
        let inbox = PartitionKey::new(ConversationId::from(&me), bob.clone());
        for n in 1..=5 {
            let at = Utc.timestamp_opt(n, 0).single();
            store.insert(&inbox, Message::new(format!("m{}", n), bob.clone(), MessageBody::text("hi"), at));
        }
        let mut app = app_with(&store);
        app.run_command(Command::Open(Conversation::direct("bob"))).await.unwrap();
        settle(&mut app).await;

        let ids = |app: &App| -> Vec<String> {
            app.get_visible_messages(2).iter().map(|m| m.id.to_string()).collect()
        };
        assert_eq!(ids(&app), vec!["m4", "m5"]);

        app.handle_key_event(KeyEvent::new(KeyCode::Up, KeyModifiers::NONE)).await.unwrap();
        assert_eq!(ids(&app), vec!["m3", "m4"]);

        for _ in 0..3 {
            app.handle_key_event(KeyEvent::new(KeyCode::PageUp, KeyModifiers::NONE)).await.unwrap();
        }
        assert_eq!(app.scroll_offset, 4);
        assert_eq!(ids(&app), vec!["m1", "m2"]);

        app.scroll_offset = 100;
        assert_eq!(ids(&app), vec!["m1", "m2"]);

        app.scroll_offset = 4;
        app.handle_key_event(KeyEvent::new(KeyCode::PageDown, KeyModifiers::NONE)).await.unwrap();
        assert_eq!(app.scroll_offset, 0);
        assert_eq!(ids(&app), vec!["m4", "m5"]);
    }
}
