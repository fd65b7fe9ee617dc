//! Line-protocol host for the komatachi agent.
//!
//! One JSON object per line on stdin/stdout:
//!   <- {"type":"input","text":"..."}
//!   -> {"type":"ready"}
//!   -> {"type":"output","text":"..."}
//!   -> {"type":"error","message":"..."}
//!
//! EOF on stdin exits 0. Startup failures emit a final error frame and
//! exit non-zero.

use std::io::{self, BufRead, Write};

use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use komatachi::{
    Agent, AgentConfig, AgentError, AnthropicProvider, Config, ConversationStore, StorageError,
    ToolRegistry,
};

const CONVERSATION_DIR: &str = "conversation";

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum InputFrame {
    Input { text: String },
}

fn emit(frame: serde_json::Value) {
    let mut stdout = io::stdout().lock();
    // A broken pipe means the host is gone; nothing useful left to do.
    let _ = writeln!(stdout, "{frame}");
    let _ = stdout.flush();
}

fn fatal(message: &str) -> ! {
    error!(message, "fatal startup error");
    emit(json!({"type": "error", "message": message}));
    std::process::exit(1);
}

/// Load the conversation, or create it on first run.
fn open_store(config: &Config) -> Result<ConversationStore, AgentError> {
    let dir = config.data_dir.join(CONVERSATION_DIR);
    let mut store = ConversationStore::new(&dir);
    match store.load() {
        Ok(()) => Ok(store),
        Err(AgentError::Storage(StorageError::NotFound { .. })) => {
            info!(dir = %dir.display(), "initializing new conversation");
            store.initialize(Some(&config.model))?;
            Ok(store)
        }
        Err(e) => Err(e),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => fatal(&e.to_string()),
    };

    let store = match open_store(&config) {
        Ok(store) => store,
        Err(e) => fatal(&e.to_string()),
    };

    let provider = AnthropicProvider::new(&config.api_key);
    let mut agent = Agent::new(
        provider,
        store,
        ToolRegistry::new(),
        AgentConfig {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            context_window: config.context_window,
            home_dir: config.home_dir.clone(),
        },
    );

    info!(model = %config.model, data_dir = %config.data_dir.display(), "ready");
    emit(json!({"type": "ready"}));

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame: InputFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                emit(json!({"type": "error", "message": format!("malformed input: {e}")}));
                continue;
            }
        };

        let InputFrame::Input { text } = frame;
        match agent.process_turn(&text).await {
            Ok(result) => emit(json!({"type": "output", "text": result.text})),
            Err(e) => emit(json!({"type": "error", "message": e.to_string()})),
        }
    }
}
