//! Relay addressing.
//!
//! User input is `host` or `host:port`. A trailing `:port` is honoured only
//! when it is 1 to 5 ASCII digits within the 16-bit range; anything else leaves
//! the whole string as the host and applies [`DEFAULT_PORT`].

use crate::config::DEFAULT_PORT;
use crate::error::{constants, ProtocolError, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ProtocolError::InvalidAddress(
                constants::ERR_EMPTY_ADDRESS.into(),
            ));
        }

        if let Some((host, port)) = input.rsplit_once(':') {
            if let Some(port) = parse_port(port) {
                if !host.is_empty() {
                    return Ok(Self::new(host, port));
                }
            }
        }

        Ok(Self::new(input, DEFAULT_PORT))
    }
}

fn parse_port(digits: &str) -> Option<u16> {
    if digits.is_empty() || digits.len() > 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u16>().ok()
}

impl FromStr for Address {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Primary address plus an optional fallback, fixed for one connection
/// attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub primary: Address,
    pub fallback: Option<Address>,
}

impl Endpoint {
    pub fn new(primary: Address) -> Self {
        Self {
            primary,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Address) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Parse from user-supplied strings; an empty fallback string counts as absent.
    pub fn parse(primary: &str, fallback: Option<&str>) -> Result<Self> {
        let fallback = match fallback.map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(Address::parse(raw)?),
            _ => None,
        };
        Ok(Self {
            primary: Address::parse(primary)?,
            fallback,
        })
    }

    /// Addresses in the order they are tried.
    pub fn candidates(&self) -> impl Iterator<Item = &Address> {
        std::iter::once(&self.primary).chain(self.fallback.iter())
    }
}
