//! Include/exclude pattern matching.
//!
//! A pattern is either an exact file/directory name or a shell-style glob
//! (`*`, `?`, `[...]`), told apart by whether it contains glob
//! metacharacters. Globs are translated to `regex` rather than pulling in
//! a dedicated glob crate.

use regex::Regex;

pub enum Pattern {
    Exact(String),
    Glob(Regex),
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn glob_to_regex(glob: &str) -> Regex {
    let mut out = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '\\' | '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            '[' => out.push('['),
            ']' => out.push(']'),
            other => out.push(other),
        }
    }
    out.push('$');
    Regex::new(&out).unwrap_or_else(|_| Regex::new("$^").unwrap())
}

pub fn compile(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .map(|p| {
            if is_glob(p) {
                Pattern::Glob(glob_to_regex(p))
            } else {
                Pattern::Exact(p.clone())
            }
        })
        .collect()
}

pub fn any_matches(patterns: &[Pattern], name: &str) -> bool {
    patterns.iter().any(|p| match p {
        Pattern::Exact(s) => s == name,
        Pattern::Glob(re) => re.is_match(name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_only_the_literal_name() {
        let patterns = compile(&["Thumbs.db".to_string()]);
        assert!(any_matches(&patterns, "Thumbs.db"));
        assert!(!any_matches(&patterns, "thumbs.db"));
        assert!(!any_matches(&patterns, "Thumbs.db.bak"));
    }

    #[test]
    fn glob_pattern_matches_extension() {
        let patterns = compile(&["*.tmp".to_string()]);
        assert!(any_matches(&patterns, "scratch.tmp"));
        assert!(!any_matches(&patterns, "scratch.tmpx"));
        assert!(!any_matches(&patterns, "tmp"));
    }
}
