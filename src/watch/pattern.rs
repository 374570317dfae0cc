//! Filename glob patterns (`*`, `?`, `[abc]`, `[!abc]`, `[a-z]`), compiled to an anchored regex.

use regex::Regex;

use crate::error::{Result, TidewaterError};

#[derive(Debug, Clone)]
pub struct FilePattern {
    glob: String,
    regex: Regex,
}

impl FilePattern {
    pub fn new(glob: &str) -> Result<Self> {
        let source = glob_to_regex(glob)?;
        let regex = Regex::new(&source)
            .map_err(|e| TidewaterError::Config(format!("invalid pattern {:?}: {}", glob, e)))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn matches(&self, filename: &str) -> bool {
        self.regex.is_match(filename)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }
}

fn glob_to_regex(glob: &str) -> Result<String> {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');

    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut class = String::from("[");
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    class.push('^');
                }
                let mut closed = false;
                let mut first = true;
                while let Some(cc) = chars.next() {
                    match cc {
                        // A leading ']' is a literal member
                        ']' if !first => {
                            closed = true;
                            break;
                        }
                        '\\' | '[' | ']' | '&' | '~' | '^' => {
                            class.push('\\');
                            class.push(cc);
                        }
                        _ => class.push(cc),
                    }
                    first = false;
                }
                if !closed {
                    return Err(TidewaterError::Config(format!(
                        "unterminated character class in pattern {:?}",
                        glob
                    )));
                }
                class.push(']');
                out.push_str(&class);
            }
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }

    out.push('$');
    Ok(out)
}
