//! Leveled operator messages.
//!
//! These are the lines a person watching the bootstrap reads; diagnostics
//! for debugging go through `tracing` instead.

use std::fmt::Display;
use std::io::Write;

pub fn info(msg: impl Display) {
    println!("[info] {msg}");
}

pub fn success(msg: impl Display) {
    println!("[ ok ] {msg}");
}

pub fn warn(msg: impl Display) {
    eprintln!("[warn] {msg}");
}

pub fn error(msg: impl Display) {
    eprintln!("[fail] {msg}");
}

/// Print a question without a trailing newline so the answer follows it.
pub fn prompt(msg: impl Display) {
    print!("[ ?? ] {msg} ");
    let _ = std::io::stdout().flush();
}

/// Progress header for the n-th of `total` ordered items.
pub fn progress(index: usize, total: usize, msg: impl Display) {
    println!("[{index}/{total}] {msg}");
}

/// Echo captured command output, indented under the current message.
pub fn detail(text: &str) {
    for line in text.lines() {
        println!("       {line}");
    }
}
