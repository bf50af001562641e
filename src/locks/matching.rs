//! Path and symbol matching for locked modules

use globset::{Glob, GlobSet, GlobSetBuilder};

/// Normalize separators and strip a leading `./`
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    match unified.strip_prefix("./") {
        Some(rest) => rest.to_string(),
        None => unified,
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn stem(path: &str) -> &str {
    let name = basename(path);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => &name[..idx],
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Compiled `protected_paths` of one module
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    fragments: Vec<String>,
    globs: Option<GlobSet>,
}

impl PathMatcher {
    /// Invalid glob patterns are skipped with a warning
    pub fn new(patterns: &[String]) -> Self {
        let mut fragments = Vec::new();
        let mut builder = GlobSetBuilder::new();
        let mut has_globs = false;

        for pattern in patterns {
            let pattern = normalize_path(pattern);
            if pattern.is_empty() {
                continue;
            }
            if !is_glob(&pattern) {
                fragments.push(pattern);
                continue;
            }

            let anchored = if pattern.starts_with('/') || pattern.starts_with("**") {
                vec![pattern.clone()]
            } else {
                vec![pattern.clone(), format!("**/{}", pattern)]
            };
            for candidate in anchored {
                match Glob::new(&candidate) {
                    Ok(glob) => {
                        builder.add(glob);
                        has_globs = true;
                    }
                    Err(e) => tracing::warn!(pattern = %candidate, error = %e, "skipping invalid protected path glob"),
                }
            }
        }

        let globs = if has_globs {
            match builder.build() {
                Ok(set) => Some(set),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to build protected path globs");
                    None
                }
            }
        } else {
            None
        };

        Self { fragments, globs }
    }

    /// Fragment substring, basename equality, or glob match
    pub fn matches(&self, path: &str) -> bool {
        let path = normalize_path(path);
        if path.is_empty() {
            return false;
        }

        let name = basename(&path);
        let fragment_hit = self.fragments.iter().any(|fragment| {
            if path.contains(fragment.as_str()) {
                return true;
            }
            let fragment_name = basename(fragment);
            !fragment_name.is_empty() && fragment_name == name
        });

        fragment_hit || self.globs.as_ref().is_some_and(|set| set.is_match(&path))
    }

    /// Whether `path` names a file with the same stem as a protected file
    pub fn shares_stem(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let target = stem(&path).to_lowercase();
        if target.is_empty() {
            return false;
        }
        self.fragments
            .iter()
            .any(|fragment| !fragment.ends_with('/') && stem(fragment).to_lowercase() == target)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whether `symbol` occurs in `text` as a whole identifier
pub fn contains_symbol(text: &str, symbol: &str) -> bool {
    if symbol.is_empty() {
        return false;
    }

    text.match_indices(symbol).any(|(idx, _)| {
        let before = text[..idx].chars().next_back();
        let after = text[idx + symbol.len()..].chars().next();
        !before.is_some_and(is_ident_char) && !after.is_some_and(is_ident_char)
    })
}

/// Protected symbols appearing in any of the texts, in declaration order
pub fn touched_symbols(symbols: &[String], texts: &[&str]) -> Vec<String> {
    symbols
        .iter()
        .filter(|symbol| texts.iter().any(|text| contains_symbol(text, symbol)))
        .cloned()
        .collect()
}
