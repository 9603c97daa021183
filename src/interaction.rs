//! Operator prompts.
//!
//! Components never read the terminal directly; they ask an [`Interaction`].
//! Force mode installs [`Unattended`], which confirms everything and refuses
//! questions that have no safe default (usernames, passwords).

use std::io::{BufRead, IsTerminal, Write};

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;

use crate::console;
use crate::error::BootstrapError;

pub trait Interaction {
    /// Yes/no question; `false` when the operator declines.
    fn confirm(&self, question: &str) -> Result<bool>;

    /// Free-text answer, trimmed. May be empty.
    fn ask(&self, question: &str) -> Result<String>;

    /// Answer read without echo.
    fn ask_secret(&self, question: &str) -> Result<String>;
}

/// Build the interaction matching the run mode.
pub fn for_mode(force: bool) -> Box<dyn Interaction> {
    if force {
        Box::new(Unattended)
    } else {
        Box::new(Terminal)
    }
}

/// Prompts on the controlling terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct Terminal;

impl Interaction for Terminal {
    fn confirm(&self, question: &str) -> Result<bool> {
        console::prompt(format!("{question} [y/N]"));
        let answer = read_line()?;
        Ok(matches!(
            answer.trim().to_ascii_lowercase().as_str(),
            "y" | "yes"
        ))
    }

    fn ask(&self, question: &str) -> Result<String> {
        console::prompt(question);
        Ok(read_line()?.trim().to_string())
    }

    fn ask_secret(&self, question: &str) -> Result<String> {
        console::prompt(question);
        if !std::io::stdin().is_terminal() {
            // Piped input cannot be echoed back anyway.
            return Ok(read_line()?.trim_end_matches(&['\r', '\n'][..]).to_string());
        }
        let secret = read_secret_raw();
        println!();
        secret
    }
}

/// Non-interactive mode: confirmations are implicit, questions are errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unattended;

impl Interaction for Unattended {
    fn confirm(&self, question: &str) -> Result<bool> {
        console::info(format!("{question} [forced: yes]"));
        Ok(true)
    }

    fn ask(&self, question: &str) -> Result<String> {
        Err(BootstrapError::NonInteractive(question.to_string()).into())
    }

    fn ask_secret(&self, question: &str) -> Result<String> {
        Err(BootstrapError::NonInteractive(question.to_string()).into())
    }
}

fn read_line() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading answer from stdin")?;
    Ok(line)
}

/// Restores cooked mode even when reading keys fails midway.
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

fn read_secret_raw() -> Result<String> {
    terminal::enable_raw_mode().context("switching terminal to raw mode")?;
    let _guard = RawModeGuard;
    let _ = std::io::stdout().flush();

    let mut secret = String::new();
    loop {
        let Event::Key(key) = event::read().context("reading key from terminal")? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => break,
            KeyCode::Char('c') | KeyCode::Char('d')
                if key.modifiers.contains(KeyModifiers::CONTROL) =>
            {
                return Err(BootstrapError::Aborted("password entry interrupted".into()).into());
            }
            KeyCode::Char(c) => secret.push(c),
            KeyCode::Backspace => {
                secret.pop();
            }
            _ => {}
        }
    }
    Ok(secret)
}
