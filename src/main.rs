use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

mod command;
mod config;
mod context;
mod dispatcher;
mod event_bus;
mod fallback;
mod logger;
mod repair;
mod scanner;
mod services;

use config::Config;
use context::ConversationStore;
use dispatcher::CommandDispatcher;
use event_bus::EventBus;
use services::{LocalBackend, Services};

#[derive(Parser)]
#[command(name = "nutrivize-commands")]
#[command(about = "Carry out the commands embedded in an assistant reply")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<String>,
    /// User the commands run for
    #[arg(short, long, default_value = "local-user")]
    user: String,
    /// Read the reply from a file instead of stdin
    #[arg(short, long)]
    input: Option<String>,
    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
    /// Reply text; read from stdin when empty
    #[arg(last = true)]
    reply: Vec<String>,
}

fn read_reply(args: &Args) -> Result<String> {
    if !args.reply.is_empty() {
        return Ok(args.reply.join(" "));
    }
    if let Some(path) = &args.input {
        let expanded = shellexpand::tilde(path);
        return std::fs::read_to_string(expanded.as_ref())
            .with_context(|| format!("Failed to read reply from {}", path));
    }
    let mut reply = String::new();
    std::io::stdin()
        .read_to_string(&mut reply)
        .context("Failed to read reply from stdin")?;
    Ok(reply)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logger::init(args.verbose);

    let config = Config::load(&args.config)?;
    let reply = read_reply(&args)?;

    let event_bus = Arc::new(EventBus::new(config.events.capacity));
    let contexts = Arc::new(
        ConversationStore::new(config.context.clone()).with_event_bus(event_bus.clone()),
    );
    let services = Services::from_backend(Arc::new(LocalBackend::new()));
    let dispatcher = CommandDispatcher::new(services, contexts, config.dispatch.clone())
        .with_event_bus(event_bus.clone());

    let output = dispatcher.process(&reply, &args.user).await;
    print!("{}", output);
    if !output.ends_with('\n') {
        println!();
    }

    let metrics = event_bus.get_metrics().await;
    info!(
        "Commands: {} detected, {} completed, {} failed ({} repaired, {} via fallback)",
        metrics.commands_detected,
        metrics.commands_completed,
        metrics.commands_failed,
        metrics.payloads_repaired,
        metrics.fallbacks_used
    );
    Ok(())
}
