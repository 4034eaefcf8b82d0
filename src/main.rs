use std::io;

use anyhow::{bail, Result};
use llama_chatbot::chat::{ChatOutcome, ChatSession};
use llama_chatbot::config::ChatConfig;
use llama_chatbot::inference::llama::LlamaService;
use llama_chatbot::logging;
use tracing::info;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let cfg = ChatConfig::from_env()?;

    println!("Loading model... this may take some time ⏳");
    let service = LlamaService::load(&cfg.model)?;
    println!("Model loaded ✅");

    println!("\nWelcome to your LLaMA 2 Chatbot! Type 'quit' to exit.\n");

    let mut session = ChatSession::new(&service, cfg.generation);
    let outcome = session.run(io::stdin().lock(), io::stdout().lock())?;

    info!(?outcome, turns = session.turns(), "chat finished");
    if outcome == ChatOutcome::EndOfInput {
        bail!("input closed before quit");
    }
    Ok(())
}
