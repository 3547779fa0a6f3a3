//! Model listing functionality

use std::error::Error;

use crate::cli::CliSession;

pub async fn list_models(session: &CliSession) -> Result<(), Box<dyn Error>> {
    let response = session
        .list_models()
        .await
        .map_err(|err| err.user_message())?;

    println!("🤖 Available Models");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    println!("🎯 Model used for chat: {}", session.settings().model);
    if let Some(default_model) = &response.default_model {
        println!("   Service default: {default_model}");
    }
    println!();

    if response.models.is_empty() {
        println!("No models found.");
        return Ok(());
    }

    let mut models = response.models;
    models.sort_by(|a, b| a.id.cmp(&b.id));
    for model in models {
        let mut line = format!("  • {}", model.id);
        if let Some(name) = model.name.as_deref().filter(|name| *name != model.id) {
            line.push_str(&format!(" ({name})"));
        }
        if let Some(context_length) = model.context_length {
            line.push_str(&format!(" · {context_length} tokens"));
        }
        if !model.supports_streaming {
            line.push_str(" · no streaming");
        }
        println!("{line}");
        if let Some(description) = model.description.as_deref() {
            println!("    {description}");
        }
    }
    Ok(())
}
