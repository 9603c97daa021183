//! Scripted stand-ins for the external world.
//!
//! [`FakeRunner`] replays queued outcomes for commands matched by program and
//! leading arguments and records every invocation. [`RecordingSleeper`] and
//! [`ScriptedInteraction`] make backoff schedules and prompting observable.
//! They are used by this crate's unit and integration tests and are public
//! so downstream wrappers can test their own step lists.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::error::BootstrapError;
use crate::interaction::Interaction;
use crate::process::{Cmd, CommandOutput, CommandRunner};
use crate::retry::Sleeper;

struct Rule {
    pattern: Vec<String>,
    outcomes: VecDeque<Outcome>,
}

#[derive(Clone)]
enum Outcome {
    Exit(CommandOutput),
    SpawnError(String),
}

/// Command runner that answers from a script.
///
/// Patterns are whitespace-separated words matched as a prefix of
/// `[program, args...]`; the longest matching pattern wins. A rule's last
/// queued outcome repeats forever. Unmatched commands succeed with empty
/// output.
#[derive(Default)]
pub struct FakeRunner {
    rules: RefCell<Vec<Rule>>,
    calls: RefCell<Vec<Cmd>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn on(&self, pattern: &str, output: CommandOutput) {
        self.on_sequence(pattern, vec![output]);
    }

    pub fn on_sequence(&self, pattern: &str, outputs: Vec<CommandOutput>) {
        self.push_rule(pattern, outputs.into_iter().map(Outcome::Exit).collect());
    }

    /// Make the command fail to start, as if the program were missing.
    pub fn on_spawn_error(&self, pattern: &str, message: &str) {
        self.push_rule(pattern, VecDeque::from([Outcome::SpawnError(message.into())]));
    }

    fn push_rule(&self, pattern: &str, outcomes: VecDeque<Outcome>) {
        let pattern = pattern.split_whitespace().map(str::to_string).collect();
        let mut rules = self.rules.borrow_mut();
        rules.retain(|rule| rule.pattern != pattern);
        rules.push(Rule { pattern, outcomes });
    }

    /// Every command run so far, in order.
    pub fn calls(&self) -> Vec<Cmd> {
        self.calls.borrow().clone()
    }

    /// Rendered command lines, in order.
    pub fn lines(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.to_string()).collect()
    }

    /// Number of invocations matching `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        let pattern: Vec<&str> = pattern.split_whitespace().collect();
        self.calls
            .borrow()
            .iter()
            .filter(|cmd| matches_prefix(cmd, &pattern))
            .count()
    }

    /// Last invocation matching `pattern`.
    pub fn last(&self, pattern: &str) -> Option<Cmd> {
        let pattern: Vec<&str> = pattern.split_whitespace().collect();
        self.calls
            .borrow()
            .iter()
            .rev()
            .find(|cmd| matches_prefix(cmd, &pattern))
            .cloned()
    }
}

fn matches_prefix(cmd: &Cmd, pattern: &[&str]) -> bool {
    let words = std::iter::once(cmd.program()).chain(cmd.get_args().iter().map(String::as_str));
    let words: Vec<&str> = words.collect();
    pattern.len() <= words.len() && pattern.iter().zip(&words).all(|(p, w)| p == w)
}

impl CommandRunner for FakeRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(cmd.clone());

        let mut rules = self.rules.borrow_mut();
        let best = rules
            .iter_mut()
            .filter(|rule| {
                let pattern: Vec<&str> = rule.pattern.iter().map(String::as_str).collect();
                matches_prefix(cmd, &pattern)
            })
            .max_by_key(|rule| rule.pattern.len());

        let Some(rule) = best else {
            return Ok(CommandOutput::default());
        };
        let outcome = if rule.outcomes.len() > 1 {
            rule.outcomes.pop_front()
        } else {
            rule.outcomes.front().cloned()
        };
        match outcome {
            Some(Outcome::Exit(output)) => Ok(output),
            Some(Outcome::SpawnError(message)) => bail!("Failed to execute {}: {}", cmd.program(), message),
            None => Ok(CommandOutput::default()),
        }
    }
}

/// Records requested delays instead of sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    slept: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }

    pub fn total(&self) -> Duration {
        self.slept.borrow().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}

/// Answers prompts from queues and records every question asked.
///
/// Running out of scripted answers is an error, so a test that expects no
/// prompting fails loudly if one happens.
#[derive(Default)]
pub struct ScriptedInteraction {
    confirms: RefCell<VecDeque<bool>>,
    answers: RefCell<VecDeque<String>>,
    asked: RefCell<Vec<String>>,
}

impl ScriptedInteraction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_confirms(self, answers: impl IntoIterator<Item = bool>) -> Self {
        self.confirms.borrow_mut().extend(answers);
        self
    }

    /// Answers for `ask` and `ask_secret`, consumed in order.
    pub fn with_answers<S: Into<String>>(self, answers: impl IntoIterator<Item = S>) -> Self {
        self.answers
            .borrow_mut()
            .extend(answers.into_iter().map(Into::into));
        self
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.borrow().clone()
    }

    fn next_answer(&self, question: &str) -> Result<String> {
        self.asked.borrow_mut().push(question.to_string());
        self.answers
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| BootstrapError::NonInteractive(question.to_string()).into())
    }
}

impl Interaction for ScriptedInteraction {
    fn confirm(&self, question: &str) -> Result<bool> {
        self.asked.borrow_mut().push(question.to_string());
        self.confirms
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| BootstrapError::NonInteractive(question.to_string()).into())
    }

    fn ask(&self, question: &str) -> Result<String> {
        self.next_answer(question)
    }

    fn ask_secret(&self, question: &str) -> Result<String> {
        self.next_answer(question)
    }
}
