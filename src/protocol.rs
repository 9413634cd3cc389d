//! Line protocol spoken with the key-value service.
//!
//! Every request and response is one `\n`-terminated line. Requests:
//!
//! ```text
//! AUTH <bucket> <password as JSON string>
//! GET <key>
//! UPSERT <key> <document>
//! REMOVE <key>
//! QUIT
//! ```
//!
//! Responses are `OK`, `OK <payload>` or `ERR <code or detail>`. Keys never
//! contain whitespace and documents are compact JSON, so neither can break
//! the framing.

use crate::StoreResult;

pub const NOT_FOUND: &str = "NOT_FOUND";
pub const BUSY: &str = "BUSY";
pub const TIMEOUT: &str = "TIMEOUT";
pub const TOO_LARGE: &str = "TOO_LARGE";
pub const AUTH: &str = "AUTH";

/// A request line, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Auth { bucket: String, password: String },
    Get { key: String },
    Upsert { key: String, document: String },
    Remove { key: String },
    Quit,
}

impl Request {
    /// Renders the request without the trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            Request::Auth { bucket, password } => {
                // A JSON string never contains a raw newline.
                let password = serde_json::Value::String(password.clone()).to_string();
                format!("AUTH {} {}", bucket, password)
            }
            Request::Get { key } => format!("GET {}", key),
            Request::Upsert { key, document } => format!("UPSERT {} {}", key, document),
            Request::Remove { key } => format!("REMOVE {}", key),
            Request::Quit => "QUIT".to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest),
            None => (line, ""),
        };

        match verb.to_uppercase().as_str() {
            "AUTH" => {
                let (bucket, password) = rest.split_once(' ').ok_or("missing arguments")?;
                let password: String = serde_json::from_str(password).map_err(|_| "invalid password encoding")?;
                Ok(Request::Auth { bucket: bucket.to_string(), password })
            }
            "GET" => Ok(Request::Get { key: single_key(rest)? }),
            "REMOVE" => Ok(Request::Remove { key: single_key(rest)? }),
            "UPSERT" => {
                let (key, document) = rest.split_once(' ').ok_or("missing arguments")?;
                if key.is_empty() {
                    return Err("missing arguments".to_string());
                }
                Ok(Request::Upsert { key: key.to_string(), document: document.to_string() })
            }
            "QUIT" => Ok(Request::Quit),
            _ => Err("unknown command".to_string()),
        }
    }
}

fn single_key(rest: &str) -> Result<String, String> {
    let key = rest.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err("missing arguments".to_string());
    }
    Ok(key.to_string())
}

/// Renders a store outcome as a response line.
pub fn response_line(result: &StoreResult) -> String {
    match result {
        StoreResult::Success(None) => "OK".to_string(),
        StoreResult::Success(Some(payload)) => format!("OK {}", payload),
        StoreResult::NotFound => format!("ERR {}", NOT_FOUND),
        StoreResult::Busy => format!("ERR {}", BUSY),
        StoreResult::Timeout => format!("ERR {}", TIMEOUT),
        StoreResult::TooLarge => format!("ERR {}", TOO_LARGE),
        StoreResult::OtherFailure(detail) => format!("ERR {}", detail),
    }
}

/// Classifies a response line.
pub fn parse_response(line: &str) -> StoreResult {
    let line = line.trim_end_matches(['\r', '\n']);
    if line == "OK" {
        return StoreResult::Success(None);
    }
    if let Some(payload) = line.strip_prefix("OK ") {
        return StoreResult::Success(Some(payload.to_string()));
    }
    match line.strip_prefix("ERR ") {
        Some(NOT_FOUND) => StoreResult::NotFound,
        Some(BUSY) => StoreResult::Busy,
        Some(TIMEOUT) => StoreResult::Timeout,
        Some(TOO_LARGE) => StoreResult::TooLarge,
        Some(detail) => StoreResult::OtherFailure(detail.to_string()),
        None => StoreResult::OtherFailure(format!("unexpected response: {}", line)),
    }
}
