//! AST-based shell command analysis using tree-sitter-bash
//!
//! Produces normalized argv lists (quote obfuscation removed) and the file
//! redirections of a command line, which is what path extraction needs.

use tree_sitter::{Node, Parser, Tree};

/// Direction of a file redirection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// `<`
    Input,
    /// `>`, `>>`, `&>`, `>|`
    Output,
}

/// A file redirection target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub target: String,
}

/// A normalized command with its arguments
#[derive(Debug, Clone)]
pub struct NormalizedCommand {
    /// Command name followed by arguments, quotes removed
    pub argv: Vec<String>,
    /// The full command text
    pub full_command: String,
    /// Whether the command name was dynamically generated
    pub is_dynamic: bool,
}

impl NormalizedCommand {
    pub fn name(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

/// Result of AST-based command analysis
#[derive(Debug, Clone, Default)]
pub struct CommandAnalysis {
    pub commands: Vec<NormalizedCommand>,
    pub redirects: Vec<Redirect>,
    /// Raw AST parse succeeded
    pub parsed: bool,
}

/// Parse and analyze a bash command using tree-sitter
pub fn analyze_command(source: &str) -> CommandAnalysis {
    let mut parser = Parser::new();

    if parser.set_language(&tree_sitter_bash::LANGUAGE.into()).is_err() {
        return CommandAnalysis::default();
    }

    match parser.parse(source, None) {
        Some(tree) => analyze_tree(&tree, source),
        None => CommandAnalysis::default(),
    }
}

fn analyze_tree(tree: &Tree, source: &str) -> CommandAnalysis {
    let root = tree.root_node();
    let mut analysis = CommandAnalysis {
        parsed: !root.has_error(),
        ..CommandAnalysis::default()
    };
    collect(&root, source, &mut analysis);
    analysis
}

/// Recursively collect commands and redirects from the AST
fn collect(node: &Node, source: &str, analysis: &mut CommandAnalysis) {
    match node.kind() {
        "command" => {
            if let Some(cmd) = extract_command(node, source) {
                analysis.commands.push(cmd);
            }
            // Redirects can sit inside the command node
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() == "file_redirect" {
                    if let Some(redirect) = extract_redirect(&child, source) {
                        analysis.redirects.push(redirect);
                    }
                }
            }
        }
        "file_redirect" => {
            if let Some(redirect) = extract_redirect(node, source) {
                analysis.redirects.push(redirect);
            }
        }
        _ => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                collect(&child, source, analysis);
            }
        }
    }
}

fn text<'a>(node: &Node, source: &'a str) -> &'a str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

/// Extract a normalized command from a command node
fn extract_command(node: &Node, source: &str) -> Option<NormalizedCommand> {
    let mut cursor = node.walk();
    let mut argv = Vec::new();
    let mut is_dynamic = false;
    let mut seen_name = false;

    for child in node.children(&mut cursor) {
        match child.kind() {
            "command_name" => {
                let (name, dynamic) = normalize_command_name(&child, source);
                argv.push(name);
                is_dynamic = dynamic;
                seen_name = true;
            }
            "word" | "string" | "raw_string" | "concatenation" | "number"
            | "simple_expansion" | "expansion" | "command_substitution"
                if seen_name =>
            {
                argv.push(normalize_word(&child, source));
            }
            _ => {}
        }
    }

    if !seen_name {
        return None;
    }

    Some(NormalizedCommand {
        argv,
        full_command: text(node, source).to_string(),
        is_dynamic,
    })
}

fn extract_redirect(node: &Node, source: &str) -> Option<Redirect> {
    let mut cursor = node.walk();
    let mut kind = None;
    for child in node.children(&mut cursor) {
        if child.is_named() {
            continue;
        }
        let op = child.kind();
        if op.contains('>') {
            kind = Some(RedirectKind::Output);
        } else if op.contains('<') {
            kind = Some(RedirectKind::Input);
        }
    }

    let destination = match node.child_by_field_name("destination") {
        Some(destination) => destination,
        None => {
            let mut cursor = node.walk();
            let last = node.named_children(&mut cursor).last()?;
            last
        }
    };
    let target = normalize_word(&destination, source);

    // Descriptor duplication (2>&1) and the bit bucket are not files
    if target.is_empty()
        || target.starts_with('&')
        || target.chars().all(|c| c.is_ascii_digit())
        || target == "/dev/null"
    {
        return None;
    }

    Some(Redirect {
        kind: kind?,
        target,
    })
}

/// Normalize a command name, handling quote obfuscation and detecting dynamic names
/// Returns (normalized_name, is_dynamic)
fn normalize_command_name(node: &Node, source: &str) -> (String, bool) {
    let mut cursor = node.walk();

    if let Some(child) = node.children(&mut cursor).next() {
        match child.kind() {
            "simple_expansion" | "expansion" | "command_substitution" => {
                return (text(&child, source).to_string(), true);
            }
            // Concatenation (like ba'sh') - normalize it
            "concatenation" => {
                return (
                    normalize_concatenation(&child, source),
                    has_dynamic_parts(&child),
                );
            }
            "word" => return (text(&child, source).to_string(), false),
            "string" | "raw_string" => return (strip_quotes(text(&child, source)), false),
            _ => {}
        }
    }

    (text(node, source).to_string(), false)
}

/// Normalize a concatenation node (like ba'sh' -> bash)
fn normalize_concatenation(node: &Node, source: &str) -> String {
    let mut result = String::new();
    let mut cursor = node.walk();

    for child in node.children(&mut cursor) {
        match child.kind() {
            "string" | "raw_string" => result.push_str(&strip_quotes(text(&child, source))),
            "concatenation" => result.push_str(&normalize_concatenation(&child, source)),
            _ => result.push_str(text(&child, source)),
        }
    }

    result
}

/// Check if a node contains dynamic parts (variables, command substitution)
fn has_dynamic_parts(node: &Node) -> bool {
    match node.kind() {
        "simple_expansion" | "expansion" | "command_substitution" => true,
        _ => {
            let mut cursor = node.walk();
            let dynamic = node.children(&mut cursor).any(|child| has_dynamic_parts(&child));
            dynamic
        }
    }
}

/// Normalize a word (handles quoted strings, concatenations)
fn normalize_word(node: &Node, source: &str) -> String {
    match node.kind() {
        "concatenation" => normalize_concatenation(node, source),
        "string" | "raw_string" => strip_quotes(text(node, source)),
        _ => text(node, source).to_string(),
    }
}

/// Strip quotes from a string
fn strip_quotes(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}
