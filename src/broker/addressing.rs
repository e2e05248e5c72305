//! Queue addressing for local and remote broker hosts.
//!
//! Local queues are addressed by path (`.\private$\orders`). Remote queues
//! need a direct format name, which comes in two protocol flavours: plain
//! TCP addressing by host, and native OS addressing that resolves the
//! machine name through the directory service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Returns true for host strings that mean "this machine"
pub fn is_local_host(host: &str) -> bool {
    let host = host.trim();
    host.is_empty()
        || host == "."
        || host.eq_ignore_ascii_case("localhost")
        || host == "127.0.0.1"
        || host == "::1"
}

/// Remote addressing protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolPreference {
    /// `FormatName:DIRECT=TCP:<address>\...`
    Tcp,
    /// `FormatName:DIRECT=OS:<machine>\...`
    Os,
}

impl Default for ProtocolPreference {
    fn default() -> Self {
        Self::Tcp
    }
}

impl ProtocolPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Os => "os",
        }
    }

    fn other(&self) -> Self {
        match self {
            Self::Tcp => Self::Os,
            Self::Os => Self::Tcp,
        }
    }

    /// Protocols to try, preferred first
    pub fn candidates(&self, fallback: bool) -> Vec<ProtocolPreference> {
        if fallback {
            vec![*self, self.other()]
        } else {
            vec![*self]
        }
    }
}

impl fmt::Display for ProtocolPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProtocolPreference {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tcp" | "direct-tcp" => Ok(Self::Tcp),
            "os" | "native" | "direct-os" => Ok(Self::Os),
            _ => Err("invalid protocol; expected tcp|os"),
        }
    }
}

/// Fully resolved address of one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAddress {
    pub host: String,
    pub prefix: String,
    pub name: String,
}

impl QueueAddress {
    pub fn new(host: &str, prefix: &str, name: &str) -> Self {
        Self {
            host: host.trim().to_string(),
            prefix: prefix.trim_matches('\\').to_string(),
            name: crate::domain::short_name(name).to_string(),
        }
    }

    pub fn is_local(&self) -> bool {
        is_local_host(&self.host)
    }

    /// Path form used for local queues and as the registry path
    pub fn path(&self) -> String {
        let host = if self.is_local() { "." } else { &self.host };
        if self.prefix.is_empty() {
            format!("{}\\{}", host, self.name)
        } else {
            format!("{}\\{}\\{}", host, self.prefix, self.name)
        }
    }

    /// Format name for remote access using the given protocol
    pub fn format_name(&self, protocol: ProtocolPreference) -> String {
        let target = match protocol {
            ProtocolPreference::Tcp => "TCP",
            ProtocolPreference::Os => "OS",
        };
        let tail = if self.prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{}\\{}", self.prefix, self.name)
        };
        format!("FormatName:DIRECT={}:{}\\{}", target, self.host, tail)
    }

    /// Addresses to try in order: the path for local queues, otherwise one
    /// format name per candidate protocol
    pub fn candidates(&self, preference: ProtocolPreference, fallback: bool) -> Vec<String> {
        if self.is_local() {
            vec![self.path()]
        } else {
            preference
                .candidates(fallback)
                .into_iter()
                .map(|p| self.format_name(p))
                .collect()
        }
    }
}
