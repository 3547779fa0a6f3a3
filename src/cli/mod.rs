//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod chat;
pub mod key;
pub mod model_list;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::api::{ConversationId, HttpChatBackend};
use crate::cli::chat::run_chat;
use crate::cli::key::{clear_key, key_status, set_key};
use crate::cli::model_list::list_models;
use crate::core::config::{Config, VaultBackend};
use crate::core::session::SessionOrchestrator;
use crate::core::stream::HttpStreamConnector;
use crate::core::vault::{
    DeviceFingerprint, FileStorage, KeyringStorage, MemoryStorage, VaultService, VaultStorage,
};
use crate::utils::logging::init_tracing;

const KEYRING_SERVICE: &str = "uru";

#[derive(Parser)]
#[command(name = "uru", version)]
#[command(about = "Streaming chat client with an encrypted local API key vault")]
#[command(
    long_about = "Uru sends messages to a chat service and streams the assistant's reply \
to the terminal. The provider API key is kept encrypted on this machine and is only \
decrypted to accompany a send.\n\n\
Configuration:\n\
  Settings are read from config.toml in the platform configuration directory, or from \
the file given with --config.\n\n\
Environment Variables:\n\
  URU_LOG           Log filter directives (default: warn)\n\n\
Controls:\n\
  Ctrl+C            Stop the response being generated"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Read configuration from this file instead of the default location
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Append diagnostic logs to this file instead of stderr
    #[arg(short = 'l', long, global = true, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Model to use instead of the configured default
    #[arg(short = 'm', long, global = true, value_name = "MODEL")]
    pub model: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage the stored API key
    Key {
        #[command(subcommand)]
        action: KeyCommand,
    },
    /// List models offered by the chat service
    Models,
    /// Send a message and stream the reply
    Chat {
        /// Conversation to send to
        conversation_id: ConversationId,
        /// Instructions for the assistant, replacing the configured system prompt
        #[arg(short = 's', long = "system", value_name = "PROMPT")]
        system: Option<String>,
        /// Message text (multiple words are joined with spaces)
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        message: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum KeyCommand {
    /// Encrypt and store an API key
    Set {
        key: String,
        /// Store without asking the chat service whether the key works
        #[arg(long)]
        skip_validate: bool,
    },
    /// Show whether a usable API key is stored
    Status,
    /// Remove the stored API key
    Clear,
}

pub type CliSession = SessionOrchestrator<Box<dyn VaultStorage>>;

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.log.as_deref())?;
    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(args.config.as_deref())?;
    let mut session = build_session(&config, args.model.as_deref())?;

    match args.command {
        Commands::Key { action } => match action {
            KeyCommand::Set { key, skip_validate } => {
                set_key(&session, config.vault_backend, &key, skip_validate).await
            }
            KeyCommand::Status => key_status(&session, config.vault_backend),
            KeyCommand::Clear => clear_key(&session),
        },
        Commands::Models => list_models(&session).await,
        Commands::Chat {
            conversation_id,
            system,
            message,
        } => {
            run_chat(
                &mut session,
                conversation_id,
                system.as_deref(),
                &message.join(" "),
            )
            .await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn Error>> {
    let config = match path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    Ok(config)
}

fn vault_storage(backend: VaultBackend) -> Result<Box<dyn VaultStorage>, Box<dyn Error>> {
    let storage: Box<dyn VaultStorage> = match backend {
        VaultBackend::File => Box::new(FileStorage::new(Config::vault_dir()?)),
        VaultBackend::Keyring => Box::new(KeyringStorage::new(KEYRING_SERVICE)),
        VaultBackend::Memory => Box::new(MemoryStorage::new()),
    };
    Ok(storage)
}

/// Wire the HTTP backend, the event-stream connector and the vault selected
/// by `config` into a session.
pub fn build_session(config: &Config, model: Option<&str>) -> Result<CliSession, Box<dyn Error>> {
    let client = reqwest::Client::new();
    let backend = HttpChatBackend::new(client.clone(), &config.base_url, config.auth_token.clone());
    let connector = HttpStreamConnector::new(client, config.auth_token.clone());
    let vault = VaultService::new(
        vault_storage(config.vault_backend)?,
        config.user_id.clone(),
        DeviceFingerprint::detect(),
    );

    Ok(SessionOrchestrator::new(
        vault,
        Arc::new(backend),
        Arc::new(connector),
        config.session_settings(model),
    ))
}
