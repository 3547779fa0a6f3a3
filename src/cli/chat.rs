//! One-shot chat: send a message and stream the reply to stdout.

use std::error::Error;
use std::io::{self, Write};

use tracing::debug;

use crate::api::ConversationId;
use crate::cli::CliSession;
use crate::core::session::SessionUpdate;

enum Step {
    Update(Option<SessionUpdate>),
    Interrupted,
}

pub async fn run_chat(
    session: &mut CliSession,
    conversation_id: ConversationId,
    system_prompt: Option<&str>,
    message: &str,
) -> Result<(), Box<dyn Error>> {
    session.open_conversation(conversation_id, None);
    if let Some(prompt) = system_prompt {
        session.set_system_prompt(conversation_id, Some(prompt))?;
    }
    session
        .send_message(conversation_id, message)
        .await
        .map_err(|err| err.user_message())?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stdout = io::stdout();

    loop {
        let step = tokio::select! {
            update = session.next_update() => Step::Update(update),
            _ = &mut ctrl_c => Step::Interrupted,
        };

        match step {
            Step::Update(Some(SessionUpdate::Delta { content, .. })) => {
                write!(stdout, "{content}")?;
                stdout.flush()?;
            }
            Step::Update(Some(SessionUpdate::Reconnecting { attempt, delay, .. })) => {
                eprintln!(
                    "\n⚠️  Connection lost; reconnecting in {:.1}s (attempt {attempt})",
                    delay.as_secs_f32()
                );
            }
            Step::Update(Some(SessionUpdate::Completed { .. })) | Step::Update(None) => {
                writeln!(stdout)?;
                break;
            }
            Step::Update(Some(SessionUpdate::Failed { error, .. })) => {
                writeln!(stdout)?;
                return Err(error.user_message().into());
            }
            Step::Interrupted => {
                session.stop_generation(conversation_id)?;
                writeln!(stdout)?;
                eprintln!("⏹️  Generation stopped");
                break;
            }
        }
    }

    if let Some(conversation) = session.close_conversation(conversation_id) {
        debug!(
            conversation = %conversation.id,
            messages = conversation.messages.len(),
            "chat finished"
        );
    }
    Ok(())
}
