use clap::{ Parser, Subcommand };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Args ---
    /// Base URL of the llama dashboard server (e.g., http://127.0.0.1:8080)
    #[arg(long, global = true, env = "LLAMA_DASH_URL", default_value = "http://127.0.0.1:8080")]
    pub url: String,

    /// Optional API key. Sent as a bearer token when set.
    #[arg(long, global = true, env = "LLAMA_API_KEY")]
    pub api_key: Option<String>,

    /// Model used for new conversations when a command does not name one.
    #[arg(long, global = true, env = "LLAMA_MODEL")]
    pub model: Option<String>,

    // --- Sampling Args ---
    /// Maximum number of tokens to generate per reply.
    #[arg(long, global = true, env = "LLAMA_MAX_TOKENS", default_value = "2048")]
    pub max_tokens: u32,

    #[arg(long, global = true, env = "LLAMA_TEMPERATURE", default_value = "0.8")]
    pub temperature: f64,

    #[arg(long, global = true, env = "LLAMA_TOP_P", default_value = "0.95")]
    pub top_p: f64,

    /// Stop sequence; may be repeated.
    #[arg(long = "stop", global = true)]
    pub stop: Vec<String>,

    #[arg(long, global = true, env = "LLAMA_SEED")]
    pub seed: Option<u32>,

    #[arg(long, global = true)]
    pub frequency_penalty: Option<f64>,

    #[arg(long, global = true)]
    pub presence_penalty: Option<f64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Interactive chat session.
    Chat {
        /// System prompt seeded into every new conversation.
        #[arg(long)]
        system: Option<String>,
    },
    /// Ask a single question and print the reply.
    Ask {
        prompt: String,

        #[arg(long)]
        system: Option<String>,

        /// Wait for the whole reply instead of streaming it.
        #[arg(long, default_value = "false")]
        no_stream: bool,
    },
    /// Inspect and manage models on the server.
    Models {
        #[command(subcommand)]
        action: ModelsCommand,
    },
    /// Check that the server is up.
    Health,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ModelsCommand {
    List {
        /// Only show loaded models.
        #[arg(long, default_value = "false")]
        loaded: bool,

        /// Only show favorites.
        #[arg(long, default_value = "false")]
        favorites: bool,
    },
    Info {
        id: String,
    },
    Load {
        id: String,

        #[arg(long)]
        ctx_size: Option<u32>,

        /// Layers offloaded to the GPU; -1 offloads all of them.
        #[arg(long, allow_hyphen_values = true)]
        n_gpu_layers: Option<i32>,
    },
    Unload {
        id: String,
    },
    /// Ask the server to rescan its model directories.
    Scan,
    /// Toggle the favorite flag.
    Favorite {
        id: String,
    },
}
