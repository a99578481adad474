//! Read-eval-print loop over stdin

use std::io::Write as _;

use agent_core::{Agent, AgentError, Message, MessageLog, Role};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// What a line of input asks for
#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Quit,
    Skip,
    Prompt(&'a str),
}

impl<'a> Input<'a> {
    pub fn classify(line: &'a str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            Self::Skip
        } else if trimmed.eq_ignore_ascii_case("quit") || trimmed.eq_ignore_ascii_case("exit") {
            Self::Quit
        } else {
            Self::Prompt(trimmed)
        }
    }
}

/// Names of the tools requested in `messages`, in call order
pub fn tools_used(messages: &[Message]) -> Vec<&str> {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter().map(|call| call.name.as_str()))
        .collect()
}

fn prompt() -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "\nYou: ")?;
    stdout.flush()
}

/// Run until `quit`, `exit`, end of input, or Ctrl-C at the prompt.
///
/// Ctrl-C while a turn is running cancels only that turn.
pub async fn run(agent: &Agent) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut log = MessageLog::new();

    loop {
        prompt()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let input = match Input::classify(&line) {
            Input::Quit => break,
            Input::Skip => continue,
            Input::Prompt(input) => input,
        };

        let before = log.len();
        let cancel = CancellationToken::new();
        let result = {
            let turn = agent.run_turn_with_cancel(&mut log, input, &cancel);
            tokio::pin!(turn);
            tokio::select! {
                result = &mut turn => result,
                _ = tokio::signal::ctrl_c() => {
                    cancel.cancel();
                    turn.await
                }
            }
        };

        for name in tools_used(&log.snapshot()[before..]) {
            println!("[Using tool: {name}]");
        }
        match result {
            Ok(answer) => println!("\nAssistant: {answer}"),
            Err(AgentError::Cancelled) => println!("[Cancelled]"),
            Err(e) => {
                tracing::error!(error = %e, "Turn failed");
                println!("\nAssistant: {}", e.user_message());
            }
        }
    }

    Ok(())
}
