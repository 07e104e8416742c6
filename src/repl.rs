//! Interactive chat loop and one-shot questions for the CLI.

use std::time::Duration;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

use crate::chat::{ChatSession, Exchange, ExchangeError, Outcome};

/// Spinner on stderr while the model is working.
fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

fn print_exchange(exchange: &Exchange) {
    println!("{}", exchange.answer);
    println!();
    eprintln!("[{}]", exchange.cost);
}

/// Run one exchange with a spinner, printing the result.
///
/// Returns `false` once the session has ended.
async fn exchange(session: &mut ChatSession, line: &str) -> Result<bool> {
    let spinner = create_spinner("thinking...");
    let outcome = session.handle(line).await;
    spinner.finish_and_clear();

    match outcome {
        Ok(Outcome::Answered(exchange)) => {
            print_exchange(&exchange);
            Ok(true)
        }
        Ok(Outcome::Ignored) => Ok(true),
        Ok(Outcome::Ended) => Ok(false),
        Err(ExchangeError::Persistence { answer, cost, source }) => {
            println!("{}", answer);
            println!();
            eprintln!("[{}]", cost);
            tracing::warn!(error = %source, "retrying save of exchange");
            session.persist(line, &answer).await?;
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

/// Answer a single question.
pub async fn run_ask(session: &mut ChatSession, question: &str) -> Result<()> {
    exchange(session, question).await?;
    Ok(())
}

/// Read questions until an exit phrase, Ctrl-D, or an input error.
pub async fn run_chat(session: &mut ChatSession) -> Result<()> {
    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut editor: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    eprintln!(
        "docchat: conversation '{}'. Type 'exit' or 'quit' to leave.",
        session.memory().conversation()
    );

    loop {
        match editor.readline("> ") {
            Ok(line) => match exchange(session, &line).await {
                Ok(true) => continue,
                Ok(false) => break,
                // Keep the session alive; the next question may succeed.
                Err(e) => eprintln!("error: {:#}", e),
            },
            Err(ReadlineError::Interrupted) => {
                eprintln!("(interrupted, type 'exit' to leave)");
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("input error: {}", e);
                break;
            }
        }
    }

    eprintln!("Goodbye!");
    Ok(())
}
