//! Mount option handling
//!
//! Volume attributes carry mount options as one raw string. Tokens are
//! either bare runs of non-space characters or double-quoted strings in
//! which a backslash escapes the next character; adjacent pieces glue
//! together, so `--log-file="/tmp/my log"` is a single token.

use crate::error::{Error, Result};

/// Option token that keeps the backend inside the agent's own container
pub const NO_SYSTEMD_FLAG: &str = "--no-systemd";

/// Options that make the backend touch local files.
///
/// Paths named by these options are only meaningful inside the agent's
/// container, so they are withheld when the backend runs on the host.
const HOST_UNSAFE_KEYS: &[&str] = &["log-file", "shared-config", "cache"];

/// Split a raw options string into tokens
pub fn tokenize_options(raw: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = raw.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut token = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            chars.next();
            if c != '"' {
                token.push(c);
                continue;
            }
            // Quoted section
            let mut closed = false;
            while let Some(q) = chars.next() {
                match q {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => match chars.next() {
                        Some(escaped) => token.push(escaped),
                        None => break,
                    },
                    other => token.push(other),
                }
            }
            if !closed {
                return Err(Error::InvalidArgument(format!(
                    "unterminated quote in mount options: {}",
                    raw
                )));
            }
        }
        tokens.push(token);
    }

    Ok(tokens)
}

/// Options split by where they may be applied
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteredOptions {
    /// Options safe everywhere, in their original order
    pub args: Vec<String>,
    /// Options (with their values) that only make sense in-container
    pub host_unsafe: Vec<String>,
    /// Whether host delegation is allowed for this volume
    pub use_host: bool,
}

/// Strip leading dashes and any inline `=value` from an option token
fn option_key(opt: &str) -> &str {
    let stripped = opt
        .strip_prefix("--")
        .or_else(|| opt.strip_prefix('-'))
        .unwrap_or(opt);
    match stripped.find('=') {
        Some(eq) => &stripped[..eq],
        None => stripped,
    }
}

/// Classify option tokens for host delegation.
///
/// The strategy switch is pulled out first, wherever it appears, so it
/// never gets mistaken for the value of a neighbouring option. A filtered
/// option written as two tokens takes the following token as its value
/// unconditionally, even when that token looks like a flag.
pub fn split_host_unsafe(tokens: &[String]) -> FilteredOptions {
    let use_host = !tokens.iter().any(|t| t == NO_SYSTEMD_FLAG);
    let mut filtered = FilteredOptions {
        use_host,
        ..Default::default()
    };

    let mut rest = tokens.iter().filter(|t| *t != NO_SYSTEMD_FLAG);
    while let Some(opt) = rest.next() {
        if opt.is_empty() {
            continue;
        }
        if !opt.starts_with('-') {
            filtered.args.push(opt.clone());
            continue;
        }

        let key = option_key(opt);
        if HOST_UNSAFE_KEYS.contains(&key) {
            filtered.host_unsafe.push(opt.clone());
            if !opt.contains('=') {
                if let Some(value) = rest.next() {
                    filtered.host_unsafe.push(value.clone());
                }
            }
        } else if !key.is_empty() {
            filtered.args.push(opt.clone());
        }
    }

    filtered
}
