use std::io::{BufRead, Write};
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::debug;

use crate::conversation::{
    build_instruction_prompt, extract_reply, is_exit_command, strip_line_ending,
};
use crate::inference::{GenerationParams, TextGenerator};

pub const USER_PROMPT: &str = "You: ";
pub const BOT_LABEL: &str = "Bot:";
pub const FAREWELL: &str = "Goodbye 👋";

/// How a chat session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatOutcome {
    Quit,
    EndOfInput,
}

/// Terminal chat loop over any [`TextGenerator`].
pub struct ChatSession<'a, G: TextGenerator + ?Sized> {
    generator: &'a G,
    params: GenerationParams,
    turns: usize,
}

impl<'a, G: TextGenerator + ?Sized> ChatSession<'a, G> {
    pub fn new(generator: &'a G, params: GenerationParams) -> Self {
        Self {
            generator,
            params,
            turns: 0,
        }
    }

    pub fn turns(&self) -> usize {
        self.turns
    }

    pub fn run<R: BufRead, W: Write>(&mut self, mut input: R, mut output: W) -> Result<ChatOutcome> {
        let mut line = String::new();
        loop {
            write!(output, "{USER_PROMPT}")?;
            output.flush()?;

            line.clear();
            let read = input.read_line(&mut line).context("reading user input")?;
            if read == 0 {
                // Input closed before a quit command; no farewell.
                writeln!(output)?;
                return Ok(ChatOutcome::EndOfInput);
            }

            let user_input = strip_line_ending(&line);
            if is_exit_command(user_input) {
                writeln!(output, "{FAREWELL}")?;
                return Ok(ChatOutcome::Quit);
            }
            if user_input.is_empty() {
                continue;
            }

            let reply = self.turn(user_input)?;
            writeln!(output, "{BOT_LABEL} {reply}")?;
        }
    }

    fn turn(&mut self, user_input: &str) -> Result<String> {
        let prompt = build_instruction_prompt(user_input);
        let started = Instant::now();

        let response = self.generator.generate(&prompt, &self.params)?;
        self.turns += 1;

        debug!(
            turn = self.turns,
            prompt_chars = prompt.len(),
            response_chars = response.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chat turn complete"
        );

        Ok(extract_reply(&response).to_string())
    }
}
