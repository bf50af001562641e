//! Wrapper command detection and unwrapping
//!
//! Handles commands like sudo, timeout, env, etc. that wrap other commands,
//! so path extraction sees the command that actually touches the file.

use std::collections::HashSet;

/// Default wrapper commands to detect
pub const DEFAULT_WRAPPERS: &[&str] = &[
    "sudo",
    "timeout",
    "xargs",
    "env",
    "nice",
    "nohup",
    "ionice",
    "strace",
    "time",
    "unbuffer",
    "watch",
    "caffeinate", // macOS
    "doas",       // BSD sudo alternative
];

/// Options that consume the following word, per wrapper
fn options_with_argument(wrapper: &str) -> &'static [&'static str] {
    match wrapper {
        "sudo" | "doas" => &["-u", "--user", "-g", "--group", "-C", "--close-from", "-h", "--host"],
        "timeout" => &["-s", "--signal", "-k", "--kill-after"],
        "env" => &["-u", "--unset", "-C", "--chdir"],
        "xargs" => &["-n", "-L", "-I", "-E", "-s", "-P", "-d", "-a"],
        "watch" => &["-n", "-d", "--interval"],
        "nice" | "ionice" | "strace" => &["-n", "-c", "-p", "-o"],
        _ => &[],
    }
}

/// Strip wrapper commands from an argv, recursively
///
/// Example: `sudo timeout 30 rm -rf build` -> `rm -rf build`
/// Returns `None` when the wrapper has no inner command.
pub fn unwrap_argv(argv: &[String], wrappers: &[String]) -> Option<Vec<String>> {
    let wrapper_set: HashSet<&str> = wrappers.iter().map(|s| s.as_str()).collect();
    unwrap_tokens(argv, &wrapper_set)
}

fn unwrap_tokens(tokens: &[String], wrappers: &HashSet<&str>) -> Option<Vec<String>> {
    let first = tokens.first()?;
    let name = crate::parser::shell::command_basename(first);

    // If not a wrapper, return as-is
    if !wrappers.contains(name) {
        return Some(tokens.to_vec());
    }

    let takes_argument = options_with_argument(name);
    let mut idx = 1;

    while idx < tokens.len() {
        let token = &tokens[idx];

        if token.starts_with('-') {
            idx += if takes_argument.contains(&token.as_str()) { 2 } else { 1 };
        } else if name == "env" && token.contains('=') {
            // VAR=val assignments
            idx += 1;
        } else if name == "timeout" {
            // First non-option is the duration
            return unwrap_tokens(tokens.get(idx + 1..)?, wrappers);
        } else {
            return unwrap_tokens(&tokens[idx..], wrappers);
        }
    }

    None
}

/// Extract the actual command from a command string
pub fn unwrap_command(command: &str, wrappers: &[String]) -> Option<Vec<String>> {
    let tokens = shlex::split(command)?;
    unwrap_argv(&tokens, wrappers)
}
