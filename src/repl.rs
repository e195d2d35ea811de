use log::{ debug, warn };
use std::error::Error;
use std::io::Write;
use tokio::io::{ AsyncBufReadExt, BufReader };
use tokio::sync::broadcast::{ self, error::{ RecvError, TryRecvError } };
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::conversation::{ ConversationController, ControllerEvent, SendOutcome };
use crate::models::chat::Conversation;

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Message(&'a str),
    New,
    List,
    Switch(&'a str),
    Delete(&'a str),
    Help,
    Quit,
    Unknown(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message(line);
    };
    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match (name, arg) {
        ("new", _) => Input::New,
        ("list", _) => Input::List,
        ("switch", id) if !id.is_empty() => Input::Switch(id),
        ("delete", id) if !id.is_empty() => Input::Delete(id),
        ("help", _) => Input::Help,
        ("quit" | "exit", _) => Input::Quit,
        _ => Input::Unknown(line),
    }
}

/// Resolves a full id or an unambiguous id prefix.
fn resolve_id(conversations: &[Conversation], needle: &str) -> Option<String> {
    if let Some(exact) = conversations.iter().find(|c| c.id == needle) {
        return Some(exact.id.clone());
    }
    let mut matches = conversations.iter().filter(|c| c.id.starts_with(needle));
    match (matches.next(), matches.next()) {
        (Some(only), None) => Some(only.id.clone()),
        _ => None,
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn prompt() -> std::io::Result<()> {
    print!("> ");
    std::io::stdout().flush()
}

fn print_help() {
    println!("Commands:");
    println!("  /new            start a new conversation");
    println!("  /list           list conversations");
    println!("  /switch <id>    switch to a conversation (id prefix is enough)");
    println!("  /delete <id>    delete a conversation");
    println!("  /quit           leave");
    println!("Ctrl-C stops a reply in progress.");
}

/// Interactive chat loop on top of the controller. Every new conversation
/// uses `model` and is seeded with `system` when given.
pub async fn run_chat(
    controller: &ConversationController,
    model: &str,
    system: Option<&str>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let first = controller.create(model, system);
    println!("Chatting with {} (conversation {}). Type /help for commands.", model, short_id(&first));

    let mut events = controller.subscribe();
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());

    loop {
        prompt()?;
        let line = tokio::select! {
            line = lines.next() => line,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line?;

        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => {
                break;
            }
            Input::Help => print_help(),
            Input::New => {
                let id = controller.create(model, system);
                println!("Started conversation {}", short_id(&id));
            }
            Input::List => list_conversations(controller),
            Input::Switch(needle) => {
                match resolve_id(&controller.conversations(), needle) {
                    Some(id) => {
                        controller.set_active(&id)?;
                        println!("Switched to {}", short_id(&id));
                    }
                    None => println!("No single conversation matches '{}'", needle),
                }
            }
            Input::Delete(needle) => {
                match resolve_id(&controller.conversations(), needle) {
                    Some(id) => {
                        controller.delete(&id);
                        match controller.active_id() {
                            Some(active) => println!("Deleted. Active conversation is {}", short_id(&active)),
                            None => println!("Deleted. No conversations left, use /new to start one."),
                        }
                    }
                    None => println!("No single conversation matches '{}'", needle),
                }
            }
            Input::Unknown(command) => println!("Unknown command '{}', try /help", command),
            Input::Message(text) => {
                if controller.active_id().is_none() {
                    println!("No active conversation, use /new to start one.");
                    continue;
                }
                send_and_print(controller, &mut events, text).await?;
            }
        }
    }

    debug!("Leaving chat with {} conversations", controller.conversations().len());
    Ok(())
}

fn list_conversations(controller: &ConversationController) {
    let active = controller.active_id();
    for conversation in controller.conversations() {
        let marker = if active.as_deref() == Some(conversation.id.as_str()) { "*" } else { " " };
        println!(
            "{} {}  {:<50}  {} messages, {}",
            marker,
            short_id(&conversation.id),
            conversation.title,
            conversation.messages.len(),
            conversation.created_at.format("%Y-%m-%d %H:%M")
        );
    }
}

/// Takes every event still queued. A lagged receiver keeps going from the
/// oldest retained event instead of stopping early.
fn drain_pending(events: &mut broadcast::Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
    let mut pending = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => pending.push(event),
            Err(TryRecvError::Lagged(skipped)) => debug!("Skipped {} stale events", skipped),
            Err(TryRecvError::Empty | TryRecvError::Closed) => {
                break;
            }
        }
    }
    pending
}

async fn send_and_print(
    controller: &ConversationController,
    events: &mut broadcast::Receiver<ControllerEvent>,
    text: &str
) -> Result<(), Box<dyn Error + Send + Sync>> {
    // Drop anything left over from earlier turns.
    drain_pending(events);

    let mut streamed = String::new();
    let send = controller.send(text, None);
    tokio::pin!(send);

    let outcome = loop {
        tokio::select! {
            outcome = &mut send => break outcome?,
            event = events.recv() => {
                match event {
                    Ok(ControllerEvent::Chunk { text, .. }) => {
                        print!("{}", text);
                        std::io::stdout().flush()?;
                        streamed.push_str(&text);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!("Display skipped {} events", skipped),
                    Err(RecvError::Closed) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                controller.stop();
            }
        }
    };

    // Chunks emitted right before the send resolved.
    for event in drain_pending(events) {
        if let ControllerEvent::Chunk { text, .. } = event {
            print!("{}", text);
            streamed.push_str(&text);
        }
    }
    println!();

    match outcome {
        SendOutcome::Failed(message) => {
            let error = message.content.strip_prefix(streamed.as_str()).unwrap_or(&message.content);
            println!("{}", error.trim_start());
        }
        SendOutcome::Stopped => println!("(stopped)"),
        SendOutcome::Completed(_) | SendOutcome::Skipped => {}
    }
    Ok(())
}
