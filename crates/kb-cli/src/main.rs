//! kb - command-line interface for the knowledge-base tool service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kb_core::{KbConfig, StoreMode};
use kb_mcp::{McpServer, ToolRegistry};
use kb_store::KnowledgeBase;

/// kb - collection-oriented knowledge base exposed as MCP tools
#[derive(Parser, Debug)]
#[command(name = "kb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/kb-mcp/config.toml, then ./kb-mcp.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store mode: in-memory, on-disk or remote
    #[arg(long, global = true)]
    store_mode: Option<StoreMode>,

    /// Directory for the on-disk store
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Remote store host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Remote store port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Address to serve on
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the MCP tools over HTTP until interrupted
    Serve,

    /// Print the tool definitions
    Tools,

    /// Run one tool call and print its output
    Call {
        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(default_value = "{}")]
        arguments: String,
    },

    /// List collections with their document counts
    Collections,
}

impl Cli {
    /// Resolve configuration: file, then environment, then flags.
    fn resolve_config<F>(&self, lookup: F) -> Result<KbConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match &self.config {
            Some(path) => KbConfig::load(path)?,
            None => KbConfig::load_default()?,
        };
        config.apply_overrides(lookup)?;

        if let Some(mode) = self.store_mode {
            config.store.mode = mode;
        }
        if let Some(dir) = &self.data_dir {
            config.store.data_dir = dir.clone();
        }
        if let Some(host) = &self.host {
            config.store.host = host.clone();
        }
        if let Some(port) = self.port {
            config.store.port = port;
        }
        if let Some(bind) = &self.bind {
            config.server.bind_address = bind.clone();
        }
        Ok(config)
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = cli
        .resolve_config(|key| std::env::var(key).ok())
        .context("Failed to load configuration")?;

    match &cli.command {
        Commands::Serve => {
            kb_mcp::serve(&config).await?;
        }
        Commands::Tools => {
            let kb = Arc::new(KnowledgeBase::in_memory()?);
            let registry = ToolRegistry::new(kb);
            println!("{}", serde_json::to_string_pretty(registry.definitions())?);
        }
        Commands::Call { tool, arguments } => {
            let arguments: Value =
                serde_json::from_str(arguments).context("Tool arguments are not valid JSON")?;
            call_tool(&config, tool, arguments).await?;
        }
        Commands::Collections => {
            list_collections(&config).await?;
        }
    }

    Ok(())
}

async fn open_store(config: &KbConfig) -> Result<Arc<KnowledgeBase>> {
    let kb = KnowledgeBase::from_config(config)
        .await
        .with_context(|| format!("Failed to open {} store", config.store.mode))?;
    Ok(Arc::new(kb))
}

async fn call_tool(config: &KbConfig, tool: &str, arguments: Value) -> Result<()> {
    let kb = open_store(config).await?;
    let server = McpServer::new(
        Arc::clone(&kb),
        Duration::from_millis(config.server.request_timeout_ms),
    );

    info!("Calling '{}'", tool);
    let outcome = server.registry().call(tool, arguments).await;
    kb.close().await?;

    match outcome {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", serde_json::to_string_pretty(&err.to_body())?);
            std::process::exit(1);
        }
    }
}

async fn list_collections(config: &KbConfig) -> Result<()> {
    let kb = open_store(config).await?;
    let collections = kb.list_collections().await?;

    if collections.is_empty() {
        println!("No collections found.");
    } else {
        println!("Found {} collections:\n", collections.len());
        for collection in &collections {
            let count = kb.count_documents(&collection.name).await?;
            println!("- {} ({} documents)", collection.name, count);
        }
    }

    kb.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_call() {
        let cli = Cli::try_parse_from([
            "kb",
            "call",
            "create_collection",
            r#"{"collection_name": "notes"}"#,
        ])
        .unwrap();

        match cli.command {
            Commands::Call { tool, arguments } => {
                assert_eq!(tool, "create_collection");
                assert!(arguments.contains("notes"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_flags_override_env_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.toml");
        std::fs::write(
            &path,
            "[store]\nmode = \"remote\"\nport = 7000\n\n[server]\nbind_address = \"0.0.0.0:9\"\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "kb",
            "--config",
            path.to_str().unwrap(),
            "--store-mode",
            "in-memory",
            "serve",
        ])
        .unwrap();
        let config = cli
            .resolve_config(|key| (key == "KB_STORE_PORT").then(|| "7100".to_string()))
            .unwrap();

        assert_eq!(config.store.mode, StoreMode::InMemory);
        assert_eq!(config.store.port, 7100);
        assert_eq!(config.server.bind_address, "0.0.0.0:9");
    }

    #[test]
    fn test_bad_store_mode_is_rejected() {
        assert!(Cli::try_parse_from(["kb", "--store-mode", "cloud", "tools"]).is_err());
    }

    #[tokio::test]
    async fn test_call_tool_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "kb",
            "--data-dir",
            dir.path().to_str().unwrap(),
            "--store-mode",
            "on-disk",
            "collections",
        ])
        .unwrap();
        let config = cli.resolve_config(no_env).unwrap();

        call_tool(
            &config,
            "create_collection",
            serde_json::json!({"collection_name": "notes"}),
        )
        .await
        .unwrap();

        let kb = open_store(&config).await.unwrap();
        let names: Vec<_> = kb
            .list_collections()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["notes"]);
        kb.close().await.unwrap();
    }
}
