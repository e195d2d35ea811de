pub mod cli;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod llm;
pub mod models;
pub mod registry;
pub mod repl;

use cli::{ Args, Command };
use config::AppConfig;
use conversation::ConversationController;
use log::info;
use registry::api::HttpModelApi;
use registry::ModelRegistry;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = AppConfig::from_args(&args)?;
    config.log_summary();

    let client = llm::chat::new_client(&config.client)?;
    let api = Arc::new(HttpModelApi::from_config(&config.client)?);
    let registry = ModelRegistry::new(api.clone());

    match args.command {
        Command::Chat { system } => {
            let model = commands::resolve_model(&config, &registry).await?;
            info!("Starting chat with model {}", model);
            let controller = ConversationController::new(client, config.send.clone());
            repl::run_chat(&controller, &model, system.as_deref()).await
        }
        Command::Ask { prompt, system, no_stream } => {
            commands::ask(client.as_ref(), &config, &prompt, system.as_deref(), no_stream).await
        }
        Command::Models { action } => commands::models(&registry, action).await,
        Command::Health => commands::health(api.as_ref()).await,
    }
}
