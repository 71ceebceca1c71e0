use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use echo_chat::{
    ChatError, ChatResult, ChatSession, ContextManager, DEFAULT_SYSTEM_PROMPT, PairBudget,
    TurnOptions, TurnProgress,
};
use echo_llm::{LlmProvider, create_provider};
use echo_storage::{RoomId, SqliteStorage, StorageError};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::command::{Command, HELP, parse_command};
use crate::settings::{EchoSettings, SettingsStore};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to open chat storage on `{stage}`: {source}"))]
    OpenStorage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

struct Repl {
    settings: Arc<EchoSettings>,
    settings_store: SettingsStore,
    manager: ContextManager<SqliteStorage>,
    session: ChatSession,
}

pub async fn run() -> AppResult<()> {
    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    tracing::info!(
        provider_id = %settings.provider_id,
        model = %settings.default_model,
        database_path = %settings.database_path,
        "starting echo"
    );

    let storage = SqliteStorage::open(&settings.database_path)
        .await
        .context(OpenStorageSnafu {
            stage: "open-storage",
        })?;
    let session = ChatSession::new(build_provider(&settings), settings.history_budget())
        .with_unknown_role_policy(settings.unknown_roles);

    let mut repl = Repl {
        settings,
        settings_store,
        manager: ContextManager::new(Arc::new(storage)),
        session,
    };
    repl.open_latest_room();

    println!("echo - type /help for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        repl.prompt();
        let line = tokio::select! {
            line = lines.next_line() => line.context(ReadInputSnafu {
                stage: "read-stdin-line",
            })?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                None
            }
        };
        let Some(line) = line else {
            break;
        };
        let Some(command) = parse_command(&line) else {
            continue;
        };

        match repl.handle(command).await {
            Ok(Flow::Quit) => break,
            Ok(Flow::Continue) => {}
            Err(error) => repl.report(&error),
        }
    }
    Ok(())
}

fn build_provider(settings: &EchoSettings) -> Option<Arc<dyn LlmProvider>> {
    let Some(config) = settings.to_provider_config() else {
        tracing::warn!("no API key configured; model calls are disabled");
        return None;
    };
    match create_provider(config) {
        Ok(provider) => Some(provider),
        Err(error) => {
            tracing::warn!(error = %error, "failed to create model provider");
            None
        }
    }
}

impl Repl {
    fn prompt(&self) {
        let label = match self.session.active_room() {
            Some(room_id) => room_id.short(),
            None => "no room".to_string(),
        };
        print!("[{label}] > ");
        let _ = std::io::stdout().flush();
    }

    fn open_latest_room(&mut self) {
        match self.manager.list_rooms() {
            Ok(rooms) => self
                .session
                .set_active_room(rooms.first().map(|room| room.room_id)),
            Err(error) => tracing::warn!(error = %error, "could not list rooms at startup"),
        }
    }

    fn active_room(&self) -> Option<RoomId> {
        let room_id = self.session.active_room();
        if room_id.is_none() {
            println!("no room is open; create one with /new <name>");
        }
        room_id
    }

    /// Full id or any unambiguous prefix of one.
    fn resolve_room(&self, raw: &str) -> ChatResult<Option<RoomId>> {
        let raw = raw.trim().to_ascii_lowercase();
        let matches = self
            .manager
            .list_rooms()?
            .into_iter()
            .filter(|room| room.room_id.to_string().starts_with(&raw))
            .map(|room| room.room_id)
            .collect::<Vec<_>>();
        match matches.as_slice() {
            [room_id] => Ok(Some(*room_id)),
            [] => {
                println!("no room matches '{raw}'");
                Ok(None)
            }
            _ => {
                println!("'{raw}' matches {} rooms; use more characters", matches.len());
                Ok(None)
            }
        }
    }

    async fn handle(&mut self, command: Command) -> ChatResult<Flow> {
        match command {
            Command::Rooms => self.list_rooms()?,
            Command::New { name } => {
                let room = self.manager.create_room(&name, Some(DEFAULT_SYSTEM_PROMPT))?;
                self.session.set_active_room(Some(room.room_id));
                println!("created room '{}' ({})", room.name, room.room_id.short());
            }
            Command::Open { room } => {
                if let Some(room_id) = self.resolve_room(&room)? {
                    self.session.set_active_room(Some(room_id));
                    self.print_history(room_id)?;
                }
            }
            Command::Delete { room } => {
                if let Some(room_id) = self.resolve_room(&room)? {
                    if self.manager.delete_room(&room_id.to_string())? {
                        self.session.forget_room(room_id);
                        println!("deleted room {}", room_id.short());
                    } else {
                        println!("room {} no longer exists", room_id.short());
                    }
                }
            }
            Command::Clear => {
                if let Some(room_id) = self.active_room() {
                    let deleted = self.manager.clear_room_chat_history(&room_id.to_string())?;
                    println!("removed {deleted} messages");
                }
            }
            Command::Models { free_only } => self.list_models(free_only).await,
            Command::Model { id } => {
                if let Some(room_id) = self.active_room() {
                    self.session.room_settings_mut(room_id).model = Some(id.clone());
                    println!("room now uses {id}");
                }
            }
            Command::Temperature { value } => {
                if let Some(room_id) = self.active_room() {
                    self.session.room_settings_mut(room_id).temperature = Some(value);
                    println!("temperature set to {value}");
                }
            }
            Command::Pairs { value } => {
                if let Some(room_id) = self.active_room() {
                    let budget = PairBudget::clamped(value);
                    self.session.room_settings_mut(room_id).history_pairs = Some(budget);
                    println!("sending the last {} exchanges as context", budget.get());
                }
            }
            Command::Export => {
                if let Some(room_id) = self.active_room() {
                    println!("{}", self.manager.export_transcript(room_id)?);
                }
            }
            Command::Save => {
                if let Some(room_id) = self.active_room() {
                    self.save_defaults(room_id);
                }
            }
            Command::Status => {
                let status = self.manager.model_status(&self.session).await;
                match (status.provider, status.model, status.temperature) {
                    (Some(provider), Some(model), Some(temperature)) => println!(
                        "{provider}: {model} at temperature {temperature} ({})",
                        if status.connected { "connected" } else { "disconnected" }
                    ),
                    _ => println!("no model configured"),
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return Ok(Flow::Quit),
            Command::Say(text) => self.say(&text).await?,
            Command::Invalid(message) => println!("{message}"),
        }
        Ok(Flow::Continue)
    }

    fn list_rooms(&self) -> ChatResult<()> {
        let summaries = self.manager.room_summaries()?;
        if summaries.is_empty() {
            println!("no rooms yet; create one with /new <name>");
        }
        for summary in summaries {
            let marker = if self.session.active_room() == Some(summary.room.room_id) {
                "*"
            } else {
                " "
            };
            println!(
                "{marker} {}  {}  ({} messages)",
                summary.room.room_id.short(),
                summary.room.name,
                summary.message_count
            );
        }
        Ok(())
    }

    fn print_history(&self, room_id: RoomId) -> ChatResult<()> {
        for message in self.manager.messages(room_id)? {
            if message.role.is_system() {
                continue;
            }
            let speaker = match message.role {
                echo_storage::MessageRole::Human => "you".to_string(),
                _ => message.model_tag.clone(),
            };
            println!("{speaker}: {}", message.content);
        }
        let stats = self.manager.room_stats(room_id);
        println!("-- {} visible messages", stats.visible);
        Ok(())
    }

    fn save_defaults(&mut self, room_id: RoomId) {
        let room = self.session.room_settings(room_id);
        let saved = self.settings_store.update(|settings| {
            if let Some(model) = &room.model {
                settings.default_model = model.clone();
            }
            if let Some(temperature) = room.temperature {
                settings.default_temperature = temperature;
            }
            if let Some(budget) = room.history_pairs {
                settings.history_pairs = budget.get();
            }
        });

        match saved {
            Ok(()) => {
                self.settings = self.settings_store.settings();
                println!(
                    "saved defaults to {} (applied on next start)",
                    self.settings_store.config_path().display()
                );
            }
            Err(error) => println!("could not save settings: {error}"),
        }
    }

    async fn list_models(&self, free_only: bool) {
        let Some(provider) = self.session.provider() else {
            println!("no model configured");
            return;
        };
        match provider.list_available_models().await {
            Ok(catalog) => {
                if let Some(warning) = &catalog.warning {
                    println!("(showing {:?} models: {warning})", catalog.source);
                }
                let models = if free_only {
                    catalog.free_models()
                } else {
                    catalog.models
                };
                for model in models {
                    println!("{}", model.id);
                }
            }
            Err(error) => println!("could not list models: {error}"),
        }
    }

    async fn say(&mut self, text: &str) -> ChatResult<()> {
        let Some(room_id) = self.active_room() else {
            return Ok(());
        };
        let streaming = self.settings.streaming;
        let options = TurnOptions::default()
            .with_streaming(streaming)
            .with_timeout(Duration::from_secs(self.settings.turn_timeout_secs));

        let mut stdout = std::io::stdout();
        let turn = self.manager.submit_with_observer(
            &mut self.session,
            room_id,
            text,
            options,
            |progress| match progress {
                TurnProgress::Fragment(fragment) => {
                    let _ = write!(stdout, "{fragment}");
                    let _ = stdout.flush();
                }
                TurnProgress::FallbackStarted => {
                    let _ = writeln!(stdout, "\n[stream interrupted, retrying without streaming]");
                }
            },
        );

        tokio::select! {
            result = turn => {
                let outcome = result?;
                if !streaming || outcome.used_fallback {
                    print!("{}", outcome.assistant_message.content);
                }
                println!();
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\n[cancelled; your message was kept]");
            }
        }
        Ok(())
    }

    fn report(&self, error: &ChatError) {
        tracing::debug!(error = ?error, "command failed");
        match error {
            ChatError::InvalidModel { model, .. } => println!(
                "\nmodel '{model}' was rejected; pick another with /models and /model <id>"
            ),
            ChatError::ApiConnection { message, .. } => println!(
                "\ncould not reach the model: {message}\n\
                 your message was saved; send it again to retry"
            ),
            ChatError::TurnTimedOut { timeout, .. } => println!(
                "\nno reply within {}s; your message was saved",
                timeout.as_secs()
            ),
            ChatError::PreconditionFailed { .. } => println!(
                "no API key configured; set OPENROUTER_API_KEY or api_key in {}",
                self.settings_store.config_path().display()
            ),
            other => println!("error: {other}"),
        }
    }
}
