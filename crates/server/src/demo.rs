//! Demo application served by the binary: `communication.message`.

use serde::{Deserialize, Serialize};
use serde_json::json;

use cairn_core::{Aggregate, CommandContext, DomainError, DomainResult, EntityId, EntityIdentifier, Initiator};
use cairn_events::Command;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub text: Option<String>,
    pub likes: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "camelCase")]
pub enum MessageCommand {
    Send { text: String },
    Like,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "camelCase")]
pub enum MessageEvent {
    Sent { text: String },
    Liked { likes: u64 },
}

impl Aggregate for Message {
    type Command = MessageCommand;
    type Event = MessageEvent;

    const CONTEXT: &'static str = "communication";
    const ENTITY: &'static str = "message";

    fn command_names() -> &'static [&'static str] {
        &["send", "like"]
    }

    fn apply(&mut self, event: &MessageEvent) {
        match event {
            MessageEvent::Sent { text } => self.text = Some(text.clone()),
            MessageEvent::Liked { likes } => self.likes = *likes,
        }
    }

    fn is_authorized(&self, command: &MessageCommand, ctx: &CommandContext) -> bool {
        // Anyone may like; only known users may send.
        match command {
            MessageCommand::Send { .. } => !ctx.initiator.is_anonymous(),
            MessageCommand::Like => true,
        }
    }

    fn handle(&self, command: &MessageCommand, _ctx: &CommandContext) -> DomainResult<Vec<MessageEvent>> {
        match command {
            MessageCommand::Send { text } if text.trim().is_empty() => {
                Err(DomainError::rejected("Message text must not be empty."))
            }
            MessageCommand::Send { .. } if self.text.is_some() => {
                Err(DomainError::rejected("Message was already sent."))
            }
            MessageCommand::Send { text } => Ok(vec![MessageEvent::Sent { text: text.clone() }]),
            MessageCommand::Like if self.text.is_none() => Err(DomainError::rejected("Message was not yet sent.")),
            MessageCommand::Like => Ok(vec![MessageEvent::Liked {
                likes: self.likes + 1,
            }]),
        }
    }
}

/// A few commands to exercise the pipeline on startup: each message is sent
/// and liked twice, plus one like from an anonymous user before sending.
pub fn commands(messages: usize) -> Vec<Command> {
    let mut commands = Vec::new();

    for n in 0..messages {
        let id = EntityIdentifier::new(Message::CONTEXT, Message::ENTITY, EntityId::new());
        let author = Initiator::new(format!("user-{n}"));

        commands.push(Command::new(id.clone(), "like", json!({}), Initiator::anonymous()));
        commands.push(Command::new(
            id.clone(),
            "send",
            json!({ "text": format!("hello #{n}") }),
            author.clone(),
        ));
        commands.push(Command::new(id.clone(), "like", json!({}), author.clone()));
        commands.push(Command::new(id, "like", json!({}), Initiator::anonymous()));
    }

    commands
}
