use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// A remote benchmark machine, identified by its network address (IPv4, IPv6 or hostname).
///
/// Targets are fixed for the lifetime of an experiment and are used as the key wherever results
/// are grouped per machine, so they order and hash by address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    pub fn new(address: impl Into<String>) -> Self {
        Target(address.into().trim().to_string())
    }

    pub fn address(&self) -> &str {
        &self.0
    }

    /// `user@address`, the destination handed to ssh.
    pub fn destination(&self, user: &str) -> String {
        format!("{}@{}", user, self.0)
    }

    /// `user@[address]`, the host part of a copy argument. Brackets keep the colons of an IPv6
    /// address apart from the path separator.
    pub fn copy_prefix(&self, user: &str) -> String {
        format!("{}@[{}]", user, self.0)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Target {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = s.trim();
        if address.is_empty() {
            return Err(anyhow::anyhow!("target address cannot be empty"));
        }
        if address.contains(char::is_whitespace) {
            return Err(anyhow::anyhow!("target address {address:?} contains whitespace"));
        }
        Ok(Target::new(address))
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        Target::new(value)
    }
}

/// Parses a comma separated list of targets, skipping empty entries.
pub fn parse_target_list(list: &str) -> anyhow::Result<Vec<Target>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Target::from_str)
        .collect()
}
