//! `sed -i` emulation for the two script shapes the crate emits:
//! `/RE/d` and `s/RE/REPL/`, with POSIX basic regular expressions.

use regex::Regex;

/// Apply a sed script to file content. Returns `None` for scripts the
/// fake does not understand.
pub fn apply(script: &str, content: &str) -> Option<String> {
    let had_newline = content.ends_with('\n');
    let lines = content.lines();

    let out: Vec<String> = if let Some(rest) = script.strip_prefix("s/") {
        let (pattern, rest) = split_unescaped(rest)?;
        let (replacement, flags) = split_unescaped(rest)?;
        if !flags.is_empty() {
            return None;
        }
        let re = Regex::new(&bre_to_regex(pattern)).ok()?;
        let replacement = sed_replacement(replacement);
        lines
            .map(|l| re.replace(l, replacement.as_str()).into_owned())
            .collect()
    } else if let Some(rest) = script.strip_prefix('/') {
        let (pattern, command) = split_unescaped(rest)?;
        if command != "d" {
            return None;
        }
        let re = Regex::new(&bre_to_regex(pattern)).ok()?;
        lines.filter(|l| !re.is_match(l)).map(ToString::to_string).collect()
    } else {
        return None;
    };

    let mut joined = out.join("\n");
    if had_newline && !out.is_empty() {
        joined.push('\n');
    }
    Some(joined)
}

/// Split at the first `/` not preceded by a backslash.
fn split_unescaped(s: &str) -> Option<(&str, &str)> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'/' => return Some((&s[..i], &s[i + 1..])),
            _ => i += 1,
        }
    }
    None
}

/// Translate a POSIX BRE to the `regex` crate's syntax.
fn bre_to_regex(bre: &str) -> String {
    let chars: Vec<char> = bre.chars().collect();
    let mut out = String::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                match chars.get(i + 1) {
                    Some('/') => out.push('/'),
                    Some(c) => {
                        out.push('\\');
                        out.push(*c);
                    }
                    None => out.push_str(r"\\"),
                }
                i += 2;
            }
            '[' => {
                out.push('[');
                i += 1;
                let mut first = true;
                while i < chars.len() {
                    if chars[i] == '[' && chars.get(i + 1) == Some(&':') {
                        while i < chars.len() && !(chars[i] == ']' && chars[i - 1] == ':') {
                            out.push(chars[i]);
                            i += 1;
                        }
                        out.push(']');
                        i += 1;
                    } else if chars[i] == ']' && !first {
                        out.push(']');
                        i += 1;
                        break;
                    } else {
                        if matches!(chars[i], '\\' | '[') {
                            out.push('\\');
                        }
                        out.push(chars[i]);
                        i += 1;
                    }
                    first = false;
                }
            }
            c @ ('+' | '?' | '(' | ')' | '{' | '}' | '|') => {
                out.push('\\');
                out.push(c);
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Translate a sed replacement to the `regex` crate's syntax.
fn sed_replacement(repl: &str) -> String {
    let mut out = String::new();
    let mut chars = repl.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(n) = chars.next() {
                    if n == '$' {
                        out.push_str("$$");
                    } else {
                        out.push(n);
                    }
                }
            }
            '&' => out.push_str("${0}"),
            '$' => out.push_str("$$"),
            c => out.push(c),
        }
    }
    out
}
