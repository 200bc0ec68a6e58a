//! # pocket-cli
//!
//! Command-line front end for pocket.
//!
//! Wires an [`Engine`] over the scripted reference backend and a
//! snapshot-file store, so registration, chats and history can be driven
//! from a shell:
//!
//! ```text
//! pocket register m1 ./model.gguf
//! pocket create-chat --model m1 --id demo
//! pocket chat demo "hello"
//! pocket history demo
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pocket_engine::ModelKind;
use pocket_runtime::{ScriptedBackend, TracingTelemetry};
use pocket_sampling::SamplerConfig;
use pocket_session::{Engine, EngineConfig, GeneratorConfig};
use pocket_store::ChatConfig;
use tracing_subscriber::EnvFilter;

/// pocket: on-device chat runtime
#[derive(Debug, Parser)]
#[command(name = "pocket", version)]
pub struct Cli {
    /// Snapshot file holding models, chats and messages.
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Engine configuration (TOML).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Reply the scripted backend produces.
    #[arg(long, global = true)]
    pub reply: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register a model file under a name.
    Register {
        name: String,
        path: PathBuf,
        /// LLM or EMBEDDING.
        #[arg(long, default_value = "llm")]
        kind: ModelKind,
    },

    /// Move a registered model to a file with identical contents.
    UpdatePath { name: String, path: PathBuf },

    /// Create a chat and print its id.
    CreateChat {
        /// Registered LLM serving the chat.
        #[arg(long)]
        model: String,

        #[arg(long, default_value = "You are a helpful assistant.")]
        system: String,

        /// Chat id; generated when omitted.
        #[arg(long)]
        id: Option<String>,

        /// Do not record generated exchanges.
        #[arg(long)]
        ephemeral: bool,
    },

    /// Send a message to a chat and stream the reply.
    Chat {
        chat_id: String,
        message: String,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(long)]
        top_k: Option<u32>,

        #[arg(long)]
        top_p: Option<f32>,
    },

    /// One-shot generation with a registered model. Nothing is recorded.
    Ask {
        model: String,
        prompt: String,

        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /// Print a chat's history.
    History {
        chat_id: String,

        /// Print messages as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Drop a chat's cached context.
    Unload { chat_id: String },
}

/// Default snapshot file when neither `--store` nor the config names one.
pub const DEFAULT_STORE: &str = "pocket.json";

/// Install the fmt subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // A second install (e.g. in tests) is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Resolve the engine configuration from `--config` and `--store`.
pub fn engine_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(store) = &cli.store {
        config.store_path = Some(store.clone());
    }
    if config.store_path.is_none() {
        config.store_path = Some(PathBuf::from(DEFAULT_STORE));
    }
    Ok(config)
}

fn sampler(base: SamplerConfig, max_tokens: Option<u32>, top_k: Option<u32>, top_p: Option<f32>) -> SamplerConfig {
    let mut sampler = base;
    if let Some(n) = max_tokens {
        sampler = sampler.with_max_tokens(n);
    }
    if let Some(k) = top_k {
        sampler = sampler.with_top_k(k);
    }
    if let Some(p) = top_p {
        sampler = sampler.with_top_p(p);
    }
    sampler
}

/// Execute one command, writing user-facing output to `out`.
pub fn run(cli: Cli, out: &mut impl Write) -> anyhow::Result<()> {
    let config = engine_config(&cli)?;
    let backend = match &cli.reply {
        Some(reply) => ScriptedBackend::new(reply),
        None => ScriptedBackend::default(),
    };
    let engine = Engine::open(backend, config.clone())
        .context("cannot start engine")?
        .with_telemetry(std::sync::Arc::new(TracingTelemetry));

    match cli.command {
        Command::Register { name, path, kind } => {
            engine
                .register_model(&name, &path, kind)
                .with_context(|| format!("cannot register '{name}'"))?;
            writeln!(out, "registered {name} ({kind}) -> {}", path.display())?;
        }
        Command::UpdatePath { name, path } => {
            engine
                .update_model_path(&name, &path)
                .with_context(|| format!("cannot move '{name}'"))?;
            writeln!(out, "{name} -> {}", path.display())?;
        }
        Command::CreateChat {
            model,
            system,
            id,
            ephemeral,
        } => {
            let chat_config = ChatConfig::new(system, model).with_persist(!ephemeral);
            let id = engine.create_chat(id.as_deref(), chat_config)?;
            writeln!(out, "{id}")?;
        }
        Command::Chat {
            chat_id,
            message,
            max_tokens,
            top_k,
            top_p,
        } => {
            let generator = GeneratorConfig::new(sampler(config.sampler, max_tokens, top_k, top_p));
            let mut write_err = None;
            let tokens = engine.generate_streaming_chat_response(&chat_id, &message, &generator, |fragment| {
                match out.write_all(fragment.as_bytes()).and_then(|()| out.flush()) {
                    Ok(()) => true,
                    Err(e) => {
                        write_err = Some(e);
                        false
                    }
                }
            })?;
            if let Some(e) = write_err {
                return Err(e.into());
            }
            writeln!(out)?;
            tracing::info!(tokens, "reply complete");
        }
        Command::Ask {
            model,
            prompt,
            max_tokens,
        } => {
            let sampler = sampler(config.sampler, max_tokens, None, None);
            let mut text = String::new();
            engine.generate_streaming_response(&model, &prompt, &sampler, |fragment| {
                text.push_str(fragment);
                true
            })?;
            writeln!(out, "{text}")?;
        }
        Command::History { chat_id, json } => {
            for message in engine.get_chat_history(&chat_id)? {
                if json {
                    writeln!(
                        out,
                        "{}",
                        serde_json::json!({
                            "sequence_index": message.sequence_index,
                            "role": message.role,
                            "content": message.content,
                            "metadata": message.metadata,
                            "created_at": message.created_at,
                        })
                    )?;
                } else {
                    writeln!(out, "[{}] {}: {}", message.sequence_index, message.role, message.content)?;
                }
            }
        }
        Command::Unload { chat_id } => {
            let was_loaded = engine.unload_chat(&chat_id)?;
            writeln!(out, "{chat_id}: {}", if was_loaded { "unloaded" } else { "not loaded" })?;
        }
    }

    engine.shutdown()?;
    Ok(())
}
