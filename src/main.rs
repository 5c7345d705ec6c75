use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::{
    io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::info;

use chatline::config::{Backend, Config};
use chatline::conversation::FeedRegistry;
use chatline::nostr::{generate_random_handle, Identity, NostrStore};
use chatline::{
    logging, Conversation, ConversationView, DocumentStore, MemoryStore, SessionOptions, UserId,
};

mod app;
mod ui;

use app::App;

fn cli() -> Command {
    Command::new("chatline")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Terminal chat client that merges per-sender outboxes into one conversation")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Config file (default: <config dir>/chatline/config.toml)"),
        )
        .arg(
            Arg::new("user")
                .short('u')
                .long("user")
                .value_name("HANDLE")
                .help("Your user id"),
        )
        .arg(
            Arg::new("nsec")
                .long("nsec")
                .value_name("NSEC_KEY")
                .help("Sign with your Nostr private key (nsec format)"),
        )
        .arg(
            Arg::new("backend")
                .short('b')
                .long("backend")
                .value_name("BACKEND")
                .value_parser(["memory", "nostr"])
                .help("Document store to use"),
        )
        .arg(
            Arg::new("relay")
                .short('r')
                .long("relay")
                .value_name("URL")
                .action(ArgAction::Append)
                .help("Relay to use instead of the configured ones (repeatable)"),
        )
        .arg(
            Arg::new("dm")
                .long("dm")
                .value_name("USER")
                .conflicts_with("group")
                .help("Open a direct conversation on startup"),
        )
        .arg(
            Arg::new("group")
                .long("group")
                .value_name("ID")
                .help("Open a group conversation on startup"),
        )
        .arg(
            Arg::new("live-membership")
                .long("live-membership")
                .action(ArgAction::SetTrue)
                .help("Follow group membership changes while a conversation is open"),
        )
        .arg(
            Arg::new("demo")
                .long("demo")
                .action(ArgAction::SetTrue)
                .help("Use an in-memory store seeded with sample conversations"),
        )
}

fn apply_overrides(config: &mut Config, matches: &clap::ArgMatches) -> Result<()> {
    if let Some(user) = matches.get_one::<String>("user") {
        config.identity.handle = Some(user.clone());
    }
    if let Some(nsec) = matches.get_one::<String>("nsec") {
        config.identity.nsec = Some(nsec.clone());
    }
    if let Some(backend) = matches.get_one::<String>("backend") {
        config.store.backend = backend.parse::<Backend>()?;
    }
    if let Some(relays) = matches.get_many::<String>("relay") {
        config.store.relays = relays.cloned().collect();
    }
    if matches.get_flag("live-membership") {
        config.session.live_membership = true;
    }
    if matches.get_flag("demo") {
        config.store.backend = Backend::Memory;
    }
    Ok(())
}

async fn build_store(config: &Config, demo: bool) -> Result<(Arc<dyn DocumentStore>, UserId, String)> {
    match config.store.backend {
        Backend::Memory => {
            let handle = config
                .identity
                .handle
                .clone()
                .unwrap_or_else(generate_random_handle);
            let me = UserId::new(handle);
            let store = MemoryStore::new();
            let label = if demo {
                app::seed_demo(&store, &me);
                "memory (demo)"
            } else {
                "memory"
            };
            Ok((Arc::new(store), me, label.to_string()))
        }
        Backend::Nostr => {
            let handle = config.identity.handle.as_deref();
            let identity = match config.identity.nsec.as_deref() {
                Some(nsec) => Identity::from_nsec(nsec, handle)?,
                None => Identity::ephemeral(handle),
            };
            let store = NostrStore::new(&identity, &config.store.relays)
                .await
                .context("failed to set up relays")?;
            store
                .connect(Duration::from_secs(config.store.connect_timeout_secs))
                .await;
            let label = format!(
                "nostr, {} relay(s), {}",
                store.relay_count(),
                if identity.is_ephemeral { "ephemeral" } else { "authenticated" }
            );
            Ok((Arc::new(store), identity.handle, label))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let mut config = Config::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
    apply_overrides(&mut config, &matches)?;
    let demo = matches.get_flag("demo");

    let log_file = config.logging.file_path();
    logging::init_tracing(&config.logging.level, &log_file)
        .with_context(|| format!("failed to open log file {}", log_file.display()))?;
    info!(backend = ?config.store.backend, "starting chatline");

    let (store, me, backend_label) = build_store(&config, demo).await?;
    let registry = FeedRegistry::new(store);
    let options = SessionOptions {
        live_membership: config.session.live_membership,
    };
    let mut app = App::new(ConversationView::new(registry, me, options), backend_label);

    let initial = match (matches.get_one::<String>("dm"), matches.get_one::<String>("group")) {
        (Some(peer), _) => Some(Conversation::direct(peer.as_str())),
        (None, Some(group)) => Some(Conversation::group(group.as_str())),
        (None, None) if demo => Some(Conversation::group("rustaceans")),
        (None, None) => None,
    };
    if let Some(conversation) = initial {
        app.open_conversation(conversation).await?;
    }

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {:?}", err);
    }

    Ok(())
}

async fn run_app(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, app: &mut App) -> Result<()> {
    let mut last_tick = Instant::now();
    let tick_rate = Duration::from_millis(100);

    loop {
        terminal.draw(|f| ui::draw(f, app))?;

        let timeout_duration = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);

        if event::poll(timeout_duration)? {
            let event = event::read()?;
            app.handle_input(event).await?;
        }

        if last_tick.elapsed() >= tick_rate {
            app.on_tick();
            last_tick = Instant::now();
        }

        if app.should_quit {
            return Ok(());
        }
    }
}
