//! `uru key` subcommands.

use std::error::Error;

use crate::cli::CliSession;
use crate::core::config::VaultBackend;

pub async fn set_key(
    session: &CliSession,
    backend: VaultBackend,
    key: &str,
    skip_validate: bool,
) -> Result<(), Box<dyn Error>> {
    let key = key.trim();
    if key.is_empty() {
        return Err("API key cannot be empty".into());
    }

    if !skip_validate {
        // The verdict is advisory; the key is stored either way.
        match session.validate_credential(key).await {
            Ok(verdict) if verdict.valid => {
                println!("✅ The chat service accepted this key");
                if let Some(organization) = verdict.organization {
                    println!("   Organization: {organization}");
                }
                if let Some(models) = verdict.models.filter(|models| !models.is_empty()) {
                    println!("   Models: {}", models.join(", "));
                }
            }
            Ok(verdict) => {
                let reason = verdict
                    .error
                    .unwrap_or_else(|| "no reason given".to_string());
                eprintln!("⚠️  The chat service rejected this key: {reason}");
            }
            Err(err) => eprintln!("⚠️  Could not validate the key: {}", err.user_message()),
        }
    }

    session.set_credential(key)?;
    println!("🔐 API key stored ({} vault)", backend.as_str());
    if backend == VaultBackend::Memory {
        eprintln!("⚠️  The memory vault is discarded when this command exits");
    }
    Ok(())
}

pub fn key_status(session: &CliSession, backend: VaultBackend) -> Result<(), Box<dyn Error>> {
    match session.check_credential() {
        Ok(true) => println!("🔐 An API key is stored ({} vault)", backend.as_str()),
        Ok(false) => {
            println!("No usable API key is stored. Run 'uru key set <KEY>' to add one.")
        }
        Err(err) if err.is_recoverable() => {
            return Err(format!(
                "The {} vault is temporarily unavailable ({err}). Try again shortly.",
                backend.as_str()
            )
            .into());
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

pub fn clear_key(session: &CliSession) -> Result<(), Box<dyn Error>> {
    session.clear_credential()?;
    println!("🗑️  API key removed");
    Ok(())
}
