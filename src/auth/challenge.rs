//! `WWW-Authenticate` / `Proxy-Authenticate` parsing.

use serde::Serialize;

/// One challenge: a scheme and its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Lowercased scheme name.
    pub scheme: String,
    pub params: Vec<(String, String)>,
    /// Opaque token68 form (`Negotiate abc==`), if used instead of params.
    pub token: Option<String>,
}

impl AuthChallenge {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn realm(&self) -> &str {
        self.param("realm").unwrap_or_default()
    }
}

/// What the caller is told when credentials are needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthChallengeInfo {
    pub is_proxy: bool,
    /// Origin of the server or proxy asking, e.g. `http://proxy:3128`.
    pub challenger: String,
    pub scheme: String,
    pub realm: String,
}

/// Parse every challenge in a set of header values.
///
/// A value may hold several comma-separated challenges; a comma inside a
/// quoted string does not split.
pub fn parse_challenges<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<AuthChallenge> {
    let mut challenges: Vec<AuthChallenge> = Vec::new();
    for value in values {
        for item in split_unquoted(value) {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let name_end = item
                .find(|c: char| c == '=' || c.is_ascii_whitespace())
                .unwrap_or(item.len());
            let (name, rest) = item.split_at(name_end);
            if let Some(value) = rest.trim_start().strip_prefix('=') {
                // `name=value` continues the current challenge.
                if let Some(current) = challenges.last_mut() {
                    current.params.push((name.to_ascii_lowercase(), unquote(value)));
                }
                continue;
            }

            let mut challenge = AuthChallenge {
                scheme: name.to_ascii_lowercase(),
                params: Vec::new(),
                token: None,
            };
            let rest = rest.trim();
            if !rest.is_empty() {
                match rest.split_once('=') {
                    Some((k, v)) if !k.is_empty() && !v.is_empty() && !v.chars().all(|c| c == '=') => {
                        challenge.params.push((k.trim().to_ascii_lowercase(), unquote(v)));
                    }
                    _ => challenge.token = Some(rest.to_string()),
                }
            }
            challenges.push(challenge);
        }
    }
    challenges
}

fn split_unquoted(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}
