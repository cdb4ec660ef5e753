use super::Unresolved;
use ahash::AHashMap;
use regex::{Captures, Regex};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").expect("placeholder regex")
});

/// Replaces `$NAME` and `${NAME}` with values from `env`. Unknown names are
/// left as written.
pub fn substitute_placeholders(path: &str, env: &AHashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(path, |caps: &Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or_default();
            match env.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// One result per directive line, in line order.
pub fn resolve_classpath_additions(
    lines: &[String],
    env: &AHashMap<String, String>,
) -> Vec<Result<Vec<PathBuf>, Unresolved>> {
    lines
        .iter()
        .map(|line| {
            let path = substitute_placeholders(line, env);
            let files = expand(&path);
            if files.is_empty() {
                Err(Unresolved::Path(path))
            } else {
                Ok(files)
            }
        })
        .collect()
}

fn is_glob(segment: &str) -> bool {
    segment.contains(['*', '?', '[', '{'])
}

/// An existing path is returned as is. Otherwise the last segment is
/// matched as a glob against the entries of its parent directory.
pub fn expand(path: &str) -> Vec<PathBuf> {
    let candidate = PathBuf::from(path);
    if candidate.exists() {
        return vec![candidate];
    }
    let Some(pattern) = candidate.file_name().and_then(|name| name.to_str()) else {
        return vec![];
    };
    if !is_glob(pattern) {
        return vec![];
    }
    let Some(glob) = GlobPattern::new(pattern) else {
        log::debug!("Invalid glob pattern '{pattern}'");
        return vec![];
    };

    let parent = candidate.parent().unwrap_or(Path::new(""));
    let read_from = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
    let Ok(entries) = fs::read_dir(read_from) else {
        return vec![];
    };
    let mut matches: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| glob.is_match(&entry.file_name().to_string_lossy()))
        .map(|entry| parent.join(entry.file_name()))
        .collect();
    matches.sort();
    matches
}

/// A single path segment glob: `*`, `?`, `[abc]`, `[a-z]`, `[!a]` and
/// `{a,b}`. Case-sensitive. Hidden names only match patterns starting with `.`.
pub struct GlobPattern {
    regex: Regex,
    matches_hidden: bool,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Option<GlobPattern> {
        let mut translated = String::from("^");
        let mut chars = pattern.chars().peekable();
        let mut in_alternatives = false;

        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    while chars.peek() == Some(&'*') {
                        chars.next();
                    }
                    translated.push_str(".*");
                }
                '?' => translated.push('.'),
                '[' => {
                    let mut class = String::from("[");
                    if chars.peek() == Some(&'!') {
                        chars.next();
                        class.push('^');
                    }
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        if matches!(c, '\\' | '[' | '&' | '~' | '^') {
                            class.push('\\');
                        }
                        class.push(c);
                    }
                    if !closed {
                        return None;
                    }
                    class.push(']');
                    translated.push_str(&class);
                }
                '{' if !in_alternatives => {
                    in_alternatives = true;
                    translated.push_str("(?:");
                }
                '}' if in_alternatives => {
                    in_alternatives = false;
                    translated.push(')');
                }
                ',' if in_alternatives => translated.push('|'),
                '\\' => {
                    let escaped = chars.next()?;
                    translated.push_str(&regex::escape(&escaped.to_string()));
                }
                other => translated.push_str(&regex::escape(&other.to_string())),
            }
        }
        if in_alternatives {
            return None;
        }
        translated.push('$');

        Some(GlobPattern {
            regex: Regex::new(&translated).ok()?,
            matches_hidden: pattern.starts_with('.'),
        })
    }

    pub fn is_match(&self, name: &str) -> bool {
        if name.starts_with('.') && !self.matches_hidden {
            return false;
        }
        self.regex.is_match(name)
    }
}
