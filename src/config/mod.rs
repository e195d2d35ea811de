use log::info;
use thiserror::Error;

use crate::cli::Args;
use crate::llm::chat::SendOptions;
use crate::llm::{ LlmConfig, LlmError };

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Client(#[from] LlmError),
    #[error("{name} must be within {min}..={max}, got {value}")]
    OutOfRange {
        name: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
    #[error("max_tokens must be greater than zero")]
    ZeroMaxTokens,
}

/// Everything the services need, resolved from command line and environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub client: LlmConfig,
    pub send: SendOptions,
}

impl AppConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let client = LlmConfig::new(&args.url)?
            .with_api_key(args.api_key.clone())
            .with_model(args.model.clone());

        if args.max_tokens == 0 {
            return Err(ConfigError::ZeroMaxTokens);
        }
        check_range("temperature", args.temperature, 0.0, 2.0)?;
        check_range("top_p", args.top_p, 0.0, 1.0)?;
        if let Some(penalty) = args.frequency_penalty {
            check_range("frequency_penalty", penalty, -2.0, 2.0)?;
        }
        if let Some(penalty) = args.presence_penalty {
            check_range("presence_penalty", penalty, -2.0, 2.0)?;
        }

        let send = SendOptions {
            max_tokens: args.max_tokens,
            temperature: args.temperature,
            top_p: args.top_p,
            stop: if args.stop.is_empty() {
                None
            } else {
                Some(args.stop.clone())
            },
            seed: args.seed,
            frequency_penalty: args.frequency_penalty,
            presence_penalty: args.presence_penalty,
        };

        Ok(Self { client, send })
    }

    pub fn log_summary(&self) {
        info!("--- Core Configuration ---");
        info!("Server URL: {}", self.client.base_url);
        info!("API Key: {}", if self.client.api_key.is_some() { "set" } else { "not set" });
        info!("Default Model: {}", self.client.model.as_deref().unwrap_or("server default"));
        info!("Max Tokens: {}", self.send.max_tokens);
        info!("Temperature: {}", self.send.temperature);
        info!("Top P: {}", self.send.top_p);
        if let Some(stop) = &self.send.stop {
            info!("Stop Sequences: {:?}", stop);
        }
        info!("-------------------------");
    }
}

fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_nan() || value < min || value > max {
        return Err(ConfigError::OutOfRange { name, min, max, value });
    }
    Ok(())
}
