//! Shell tokenization and command-shape helpers
//!
//! Regex/shlex based utilities used directly and as the fallback when the
//! tree-sitter parse fails.

use once_cell::sync::Lazy;
use regex::Regex;

/// Tokenize a shell command into words
/// Uses shlex for proper shell quoting handling
pub fn tokenize(command: &str) -> Option<Vec<String>> {
    shlex::split(command)
}

/// Split a command by shell operators (;, &&, ||, single &)
/// Returns individual commands for separate analysis
pub fn split_compound_command(command: &str) -> Vec<String> {
    // Simple splitting - doesn't handle quoted strings perfectly but good enough
    static SPLIT_PATTERN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\s*(;|&&|\|\||&\s)\s*").unwrap());

    SPLIT_PATTERN
        .split(command)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Split a pipeline into its stages (`a | b` -> [a, b]), leaving `||` alone
pub fn split_pipeline(command: &str) -> Vec<String> {
    let mut stages = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' if quote.is_none() => quote = Some(c),
            q if Some(q) == quote => quote = None,
            '|' if quote.is_none() => {
                if chars.peek() == Some(&'|') {
                    current.push_str("||");
                    chars.next();
                    continue;
                }
                stages.push(current.trim().to_string());
                current = String::new();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }

    if !current.trim().is_empty() {
        stages.push(current.trim().to_string());
    }
    stages
}

/// Whether the command runs in the background (`cmd &`, not `a && b`)
pub fn is_backgrounded(command: &str) -> bool {
    let trimmed = command.trim_end();
    trimmed.ends_with('&') && !trimmed.ends_with("&&")
}

/// Base name of a command word (`/usr/bin/rm` -> `rm`)
pub fn command_basename(word: &str) -> &str {
    word.rsplit('/').next().unwrap_or(word)
}

/// Whether `argv` begins with the tokens of `shape` (e.g. `npm init`)
///
/// The first word is compared by basename so `/usr/bin/npm init` matches.
pub fn argv_matches_shape(argv: &[String], shape: &[String]) -> bool {
    if shape.is_empty() || argv.len() < shape.len() {
        return false;
    }

    argv.iter().zip(shape.iter()).enumerate().all(|(i, (arg, want))| {
        if i == 0 {
            command_basename(arg) == command_basename(want)
        } else {
            arg == want
        }
    })
}
