use log::{ info, warn };
use std::error::Error;
use std::io::Write;
use tokio_util::sync::CancellationToken;

use crate::cli::ModelsCommand;
use crate::config::AppConfig;
use crate::llm::chat::{ ChatClient, ChatRequest };
use crate::llm::stream::StreamOutcome;
use crate::models::chat::ChatMessage;
use crate::models::model::{ format_size, LoadParams, ModelEntry, ModelStatus };
use crate::registry::api::ModelApi;
use crate::registry::ModelRegistry;

type CommandResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Picks the model for a chat session: the configured one, or else the first
/// model the server already has loaded.
pub async fn resolve_model(
    config: &AppConfig,
    registry: &ModelRegistry
) -> Result<String, Box<dyn Error + Send + Sync>> {
    if let Some(model) = &config.client.model {
        return Ok(model.clone());
    }
    registry.fetch_all().await?;
    match registry.loaded().into_iter().next() {
        Some(entry) => {
            info!("No model configured, using loaded model {}", entry.id);
            Ok(entry.id)
        }
        None => Err("no model configured (--model / LLAMA_MODEL) and none is loaded".into()),
    }
}

pub async fn ask(
    client: &dyn ChatClient,
    config: &AppConfig,
    prompt: &str,
    system: Option<&str>,
    no_stream: bool
) -> CommandResult {
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(prompt));
    let request = ChatRequest::new(config.client.model.clone(), messages, &config.send);

    if no_stream {
        let completion = client.complete(request).await?;
        println!("{}", completion.message.content);
        info!(
            "Finished ({}), tokens: prompt={} completion={}",
            completion.finish_reason.as_deref().unwrap_or("unknown"),
            completion.usage.prompt_tokens,
            completion.usage.completion_tokens
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let mut stream = client.stream_chat(request, cancel.clone()).await;
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            chunk = stream.next_chunk() => {
                match chunk {
                    Some(text) => {
                        print!("{}", text);
                        stdout.flush()?;
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                cancel.cancel();
            }
        }
    }
    println!();

    match stream.outcome().await {
        StreamOutcome::Completed => Ok(()),
        StreamOutcome::Cancelled => {
            warn!("Generation stopped");
            Ok(())
        }
        StreamOutcome::Failed(e) => Err(e.into()),
    }
}

pub async fn models(registry: &ModelRegistry, action: ModelsCommand) -> CommandResult {
    match action {
        ModelsCommand::List { loaded, favorites } => {
            registry.fetch_all().await?;
            let entries: Vec<ModelEntry> = registry
                .all()
                .into_iter()
                .filter(|m| !loaded || m.status == ModelStatus::Loaded)
                .filter(|m| !favorites || m.favorite)
                .collect();
            if entries.is_empty() {
                println!("No models found.");
            }
            for entry in &entries {
                println!("{}", list_line(entry));
            }
        }
        ModelsCommand::Info { id } => {
            let entry = registry.refresh(&id).await?;
            print_details(&entry);
        }
        ModelsCommand::Load { id, ctx_size, n_gpu_layers } => {
            registry.fetch_all().await?;
            let defaults = LoadParams::default();
            let params = LoadParams {
                ctx_size: ctx_size.unwrap_or(defaults.ctx_size),
                n_gpu_layers: n_gpu_layers.unwrap_or(defaults.n_gpu_layers),
            };
            registry.load(&id, Some(params)).await?;
            println!("Loaded {}", id);
        }
        ModelsCommand::Unload { id } => {
            registry.fetch_all().await?;
            registry.unload(&id).await?;
            println!("Unloaded {}", id);
        }
        ModelsCommand::Scan => {
            let count = registry.rescan().await?;
            println!("Scan complete, {} models available", count);
        }
        ModelsCommand::Favorite { id } => {
            registry.fetch_all().await?;
            let favorite = registry.toggle_favorite(&id).await?;
            if favorite {
                println!("Marked {} as favorite", id);
            } else {
                println!("Removed {} from favorites", id);
            }
        }
    }
    Ok(())
}

pub async fn health(api: &dyn ModelApi) -> CommandResult {
    let status = api.health().await?;
    println!("Server status: {}", status);
    Ok(())
}

fn list_line(entry: &ModelEntry) -> String {
    format!(
        "{} {:<40} {:<9} {:>10} {}",
        if entry.favorite { "*" } else { " " },
        entry.display_name(),
        entry.status,
        format_size(entry.size),
        entry.quantization.as_deref().unwrap_or("-")
    )
}

fn print_details(entry: &ModelEntry) {
    println!("Id:             {}", entry.id);
    if let Some(alias) = &entry.alias {
        println!("Alias:          {}", alias);
    }
    println!("File:           {}", entry.filename);
    println!("Path:           {}", entry.path);
    println!("Size:           {}", format_size(entry.size));
    println!("Status:         {}", entry.status);
    println!("Favorite:       {}", entry.favorite);
    let optional = [
        ("Architecture", entry.architecture.clone()),
        ("Parameters", entry.parameters.clone()),
        ("Context length", entry.context_length.map(|n| n.to_string())),
        ("File type", entry.file_type.clone()),
        ("Quantization", entry.quantization.clone()),
    ];
    for (label, value) in optional {
        if let Some(value) = value {
            println!("{:<15} {}", format!("{}:", label), value);
        }
    }
    if entry.chat_template.is_some() {
        println!("Chat template:  present");
    }
}
