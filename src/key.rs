//! Storage keys for grain identities.
//!
//! A key has the form `<type>:<tag>:<value>[+<extension>]`, for example
//! `Counter:i:42` or `Session:s:alice%40example.com`. Textual parts are
//! percent-escaped for every byte outside `[A-Za-z0-9._-]`, so keys never
//! contain whitespace or the `:`/`+` separators, and [`parse_key`] recovers
//! the exact identity a key was derived from.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The primary key of a grain, in every shape the runtime hands out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrainKey {
    Integer(i64),
    Guid(Uuid),
    String(String),
    IntegerCompound(i64, String),
    GuidCompound(Uuid, String),
}

/// Stable identity of one grain instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrainId {
    pub grain_type: String,
    pub key: GrainKey,
}

impl GrainId {
    pub fn new(grain_type: impl Into<String>, key: GrainKey) -> Self {
        Self {
            grain_type: grain_type.into(),
            key,
        }
    }

    pub fn integer(grain_type: impl Into<String>, key: i64) -> Self {
        Self::new(grain_type, GrainKey::Integer(key))
    }

    pub fn string(grain_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(grain_type, GrainKey::String(key.into()))
    }

    pub fn guid(grain_type: impl Into<String>, key: Uuid) -> Self {
        Self::new(grain_type, GrainKey::Guid(key))
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.grain_type, self.key)
    }
}

/// Derives the storage key for a grain. Pure and deterministic.
pub fn derive_key(id: &GrainId) -> String {
    let mut out = escape(&id.grain_type);
    out.push(':');
    match &id.key {
        GrainKey::Integer(n) => {
            out.push_str("i:");
            out.push_str(&n.to_string());
        }
        GrainKey::Guid(g) => {
            out.push_str("g:");
            out.push_str(&g.simple().to_string());
        }
        GrainKey::String(s) => {
            out.push_str("s:");
            out.push_str(&escape(s));
        }
        GrainKey::IntegerCompound(n, ext) => {
            out.push_str("ix:");
            out.push_str(&n.to_string());
            out.push('+');
            out.push_str(&escape(ext));
        }
        GrainKey::GuidCompound(g, ext) => {
            out.push_str("gx:");
            out.push_str(&g.simple().to_string());
            out.push('+');
            out.push_str(&escape(ext));
        }
    }
    out
}

/// Recovers the identity a storage key was derived from.
///
/// Only canonical keys, exactly as produced by [`derive_key`], are accepted.
pub fn parse_key(key: &str) -> Result<GrainId> {
    let invalid = || Error::Configuration(format!("invalid storage key: {}", key));

    let (grain_type, rest) = key.split_once(':').ok_or_else(invalid)?;
    let (tag, value) = rest.split_once(':').ok_or_else(invalid)?;
    let grain_type = unescape(grain_type).ok_or_else(invalid)?;

    let grain_key = match tag {
        "i" => GrainKey::Integer(value.parse().map_err(|_| invalid())?),
        "g" => GrainKey::Guid(parse_guid(value).ok_or_else(invalid)?),
        "s" => GrainKey::String(unescape(value).ok_or_else(invalid)?),
        "ix" => {
            let (n, ext) = value.split_once('+').ok_or_else(invalid)?;
            GrainKey::IntegerCompound(n.parse().map_err(|_| invalid())?, unescape(ext).ok_or_else(invalid)?)
        }
        "gx" => {
            let (g, ext) = value.split_once('+').ok_or_else(invalid)?;
            GrainKey::GuidCompound(parse_guid(g).ok_or_else(invalid)?, unescape(ext).ok_or_else(invalid)?)
        }
        _ => return Err(invalid()),
    };

    let id = GrainId::new(grain_type, grain_key);
    // Rejects alternative spellings such as "+7" or lowercase escapes.
    if derive_key(&id) != key {
        return Err(invalid());
    }
    Ok(id)
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-')
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn unescape(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// The 32-digit form used inside storage keys.
fn parse_guid(s: &str) -> Option<Uuid> {
    if s.len() != 32 {
        return None;
    }
    Uuid::try_parse(s).ok()
}

/// Human form: `i:42`, `g:<uuid>`, `s:<text>`, `ix:42+<text>`, `gx:<uuid>+<text>`.
impl fmt::Display for GrainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrainKey::Integer(n) => write!(f, "i:{}", n),
            GrainKey::Guid(g) => write!(f, "g:{}", g),
            GrainKey::String(s) => write!(f, "s:{}", s),
            GrainKey::IntegerCompound(n, ext) => write!(f, "ix:{}+{}", n, ext),
            GrainKey::GuidCompound(g, ext) => write!(f, "gx:{}+{}", g, ext),
        }
    }
}

impl FromStr for GrainKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Configuration(format!("invalid grain key '{}', expected i:, g:, s:, ix: or gx: form", s));
        let (tag, value) = s.split_once(':').ok_or_else(invalid)?;
        match tag {
            "i" => Ok(GrainKey::Integer(value.parse().map_err(|_| invalid())?)),
            "g" => Ok(GrainKey::Guid(Uuid::parse_str(value).map_err(|_| invalid())?)),
            "s" => Ok(GrainKey::String(value.to_string())),
            "ix" => {
                let (n, ext) = value.split_once('+').ok_or_else(invalid)?;
                Ok(GrainKey::IntegerCompound(n.parse().map_err(|_| invalid())?, ext.to_string()))
            }
            "gx" => {
                let (g, ext) = value.split_once('+').ok_or_else(invalid)?;
                Ok(GrainKey::GuidCompound(Uuid::parse_str(g).map_err(|_| invalid())?, ext.to_string()))
            }
            _ => Err(invalid()),
        }
    }
}
