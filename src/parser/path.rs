//! File target extraction from shell commands
//!
//! Recognized command shapes:
//!
//! | shape                                   | access | operand |
//! |-----------------------------------------|--------|---------|
//! | `cmd > file`, `cmd >> file`, `cmd &> f` | write  | redirect target |
//! | `rm`, `unlink`, `rmdir`, `shred`        | delete | all     |
//! | `mv src.. dst`                          | delete | sources, `dst` as write |
//! | `git rm path..`                         | delete | all after `rm` |
//! | `cp`, `install`, `ln`                   | write  | last    |
//! | `touch`                                 | write  | all     |
//! | `chmod`, `chown`                        | write  | all after mode/owner |
//! | `truncate`                              | write  | last    |
//! | `tee file..`                            | write  | all     |
//! | `sed -i script file..`                  | write  | all after script |
//! | `dd of=file`                            | write  | `of=`   |
//! | `git checkout -- path..`, `git restore` | write  | all after subcommand |
//! | `cat`, `head`, `tail`, `less`, `more`   | read   | last    |
//! | `grep pattern file`, `rg pattern file`  | read   | last    |
//! | `cmd < file`                            | read   | redirect target |
//!
//! Wrappers (sudo, timeout, env, ...) are stripped first. Every target of
//! every compound part is reported; [`extract_target`] narrows that to the
//! first write or delete, falling back to the first read.

use once_cell::sync::Lazy;
use regex::Regex;

use super::ast::{self, RedirectKind};
use super::{shell, wrapper};
use crate::locks::Access;

/// A file a shell command operates on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTarget {
    pub path: String,
    pub access: Access,
}

impl ShellTarget {
    fn new(path: &str, access: Access) -> Self {
        Self {
            path: path.to_string(),
            access,
        }
    }
}

/// Every file a shell command reads, writes or deletes, in command order
pub fn extract_targets(command: &str, wrappers: &[String]) -> Vec<ShellTarget> {
    let (argvs, redirects) = split_command(command);
    let mut targets = Vec::new();

    for (kind, target) in &redirects {
        let access = match kind {
            RedirectKind::Output => Access::Write,
            RedirectKind::Input => Access::Read,
        };
        targets.push(ShellTarget::new(target, access));
    }

    for argv in &argvs {
        let Some(argv) = wrapper::unwrap_argv(argv, wrappers) else {
            continue;
        };
        targets.extend(classify_argv(&argv));
    }

    targets
}

/// The file a shell command mutates first, else the first file it reads
pub fn extract_target(command: &str, wrappers: &[String]) -> Option<ShellTarget> {
    let mut targets = extract_targets(command, wrappers);
    match targets.iter().position(|t| t.access != Access::Read) {
        Some(idx) => Some(targets.swap_remove(idx)),
        None => targets.into_iter().next(),
    }
}

/// Argv lists and redirects, from the AST or the regex fallback
fn split_command(command: &str) -> (Vec<Vec<String>>, Vec<(RedirectKind, String)>) {
    let analysis = ast::analyze_command(command);
    if analysis.parsed {
        let argvs = analysis
            .commands
            .into_iter()
            .filter(|c| !c.is_dynamic)
            .map(|c| c.argv)
            .collect();
        let redirects = analysis
            .redirects
            .into_iter()
            .map(|r| (r.kind, r.target))
            .collect();
        return (argvs, redirects);
    }

    fallback_split(command)
}

fn fallback_split(command: &str) -> (Vec<Vec<String>>, Vec<(RedirectKind, String)>) {
    static REDIRECT: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(\d?>>?|&>|<)\s*([^\s;|&<>]+)").unwrap());

    let mut argvs = Vec::new();
    let mut redirects = Vec::new();

    for part in shell::split_compound_command(command) {
        for stage in shell::split_pipeline(&part) {
            for caps in REDIRECT.captures_iter(&stage) {
                let op = &caps[1];
                let target = caps[2].to_string();
                if target.starts_with('&') || target == "/dev/null" || op.starts_with('2') {
                    continue;
                }
                let kind = if op.contains('>') {
                    RedirectKind::Output
                } else {
                    RedirectKind::Input
                };
                redirects.push((kind, target));
            }

            let stripped = REDIRECT.replace_all(&stage, " ");
            if let Some(tokens) = shell::tokenize(&stripped) {
                if !tokens.is_empty() {
                    argvs.push(tokens);
                }
            }
        }
    }

    (argvs, redirects)
}

/// Match one unwrapped argv against the recognized shapes
fn classify_argv(argv: &[String]) -> Vec<ShellTarget> {
    let Some(first_word) = argv.first() else {
        return Vec::new();
    };
    let name = shell::command_basename(first_word);
    let args = &argv[1..];
    let operands: Vec<&str> = args
        .iter()
        .map(String::as_str)
        .filter(|a| !a.starts_with('-'))
        .collect();
    let last = operands.last().copied();
    let after_first = operands.get(1..).unwrap_or_default();

    let targets = match name {
        "rm" | "unlink" | "rmdir" | "shred" => each(&operands, Access::Delete),
        "mv" => match operands.split_last() {
            Some((destination, sources)) if !sources.is_empty() => {
                let mut targets = each(sources, Access::Delete);
                targets.push(ShellTarget::new(destination, Access::Write));
                targets
            }
            _ => each(&operands, Access::Delete),
        },
        "cp" | "install" | "ln" if operands.len() >= 2 => each(&operands[operands.len() - 1..], Access::Write),
        "touch" | "tee" => each(&operands, Access::Write),
        "chmod" | "chown" | "chgrp" => each(after_first, Access::Write),
        "truncate" => last.map(|p| vec![ShellTarget::new(p, Access::Write)]).unwrap_or_default(),
        "sed" if args.iter().any(|a| a.starts_with("-i") || a == "--in-place") => each(after_first, Access::Write),
        "dd" => args
            .iter()
            .filter_map(|a| a.strip_prefix("of="))
            .map(|p| ShellTarget::new(p, Access::Write))
            .collect(),
        "git" => classify_git(&operands),
        "cat" | "head" | "tail" | "less" | "more" | "bat" | "wc" | "nl" => {
            last.map(|p| vec![ShellTarget::new(p, Access::Read)]).unwrap_or_default()
        }
        "grep" | "rg" | "egrep" | "fgrep" if operands.len() >= 2 => {
            last.map(|p| vec![ShellTarget::new(p, Access::Read)]).unwrap_or_default()
        }
        _ => Vec::new(),
    };

    targets.into_iter().filter(|t| !t.path.is_empty()).collect()
}

fn classify_git(operands: &[&str]) -> Vec<ShellTarget> {
    let Some((subcommand, rest)) = operands.split_first() else {
        return Vec::new();
    };
    match *subcommand {
        "rm" => each(rest, Access::Delete),
        "checkout" | "restore" => each(rest, Access::Write),
        _ => Vec::new(),
    }
}

fn each(paths: &[&str], access: Access) -> Vec<ShellTarget> {
    paths.iter().map(|p| ShellTarget::new(p, access)).collect()
}
