pub const INST_OPEN: &str = "[INST]";
pub const INST_CLOSE: &str = "[/INST]";

const EXIT_COMMANDS: &[&str] = &["quit", "exit"];

/// Wraps a user turn in the Llama-2 instruction tags.
pub fn build_instruction_prompt(user_input: &str) -> String {
    format!("{INST_OPEN} {user_input} {INST_CLOSE}")
}

/// The generated text echoes the prompt, so the reply is whatever follows
/// the last closing tag. Without a tag the whole response is the reply.
pub fn extract_reply(response: &str) -> &str {
    let tail = match response.rfind(INST_CLOSE) {
        Some(idx) => &response[idx + INST_CLOSE.len()..],
        None => response,
    };
    tail.trim()
}

pub fn is_exit_command(input: &str) -> bool {
    let lowered = input.to_lowercase();
    EXIT_COMMANDS.iter().any(|cmd| *cmd == lowered)
}

/// Drops the trailing line terminator left by `read_line`.
pub fn strip_line_ending(line: &str) -> &str {
    line.strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_input_verbatim() {
        assert_eq!(build_instruction_prompt("Hello"), "[INST] Hello [/INST]");
        assert_eq!(
            build_instruction_prompt("  spaced  out "),
            "[INST]   spaced  out  [/INST]"
        );
    }

    #[test]
    fn reply_follows_last_closing_tag() {
        let response = "[INST] Hi [/INST] first [/INST]  second answer \n";
        assert_eq!(extract_reply(response), "second answer");
    }

    #[test]
    fn reply_without_tag_is_trimmed_response() {
        assert_eq!(extract_reply("  just text\n"), "just text");
        assert_eq!(extract_reply(""), "");
    }

    #[test]
    fn reply_after_trailing_tag_is_empty() {
        assert_eq!(extract_reply("[INST] Hi [/INST]"), "");
    }

    #[test]
    fn exit_commands_ignore_case() {
        for cmd in ["quit", "QUIT", "Quit", "exit", "EXIT", "eXiT"] {
            assert!(is_exit_command(cmd), "{cmd}");
        }
        for other in ["quit!", " quit", "exit ", "q", "", "quitting"] {
            assert!(!is_exit_command(other), "{other:?}");
        }
    }

    #[test]
    fn strips_unix_and_windows_line_endings() {
        assert_eq!(strip_line_ending("hello\n"), "hello");
        assert_eq!(strip_line_ending("hello\r\n"), "hello");
        assert_eq!(strip_line_ending("hello"), "hello");
        assert_eq!(strip_line_ending(" hello \n"), " hello ");
    }
}
