use std::env;

use anyhow::Result;
use llama_chatbot::config::RunnerConfig;
use llama_chatbot::logging;
use llama_chatbot::runner::{PromptRunner, DEFAULT_PROMPT};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let prompt = env::args().skip(1).collect::<Vec<_>>().join(" ");
    let prompt = if prompt.trim().is_empty() {
        DEFAULT_PROMPT.to_string()
    } else {
        prompt
    };

    let cfg = RunnerConfig::from_env()?;
    let output = PromptRunner::from_config(&cfg).run(&prompt).await?;

    println!("{}", output.stdout);
    Ok(())
}
