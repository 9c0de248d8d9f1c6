//! Host addressing and replica-set connection strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A remote host identified by name and port.
///
/// This is the key under which per-host pools live; two pools to the same
/// name but different ports are entirely independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    /// Create a new host/port pair
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a "host:port" string
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::invalid_connection_string(format!("missing port in '{}'", s)))?;
        if host.is_empty() {
            return Err(Error::invalid_connection_string(format!(
                "empty host in '{}'",
                s
            )));
        }
        let port: u16 = port.parse().map_err(|_| {
            Error::invalid_connection_string(format!("invalid port in '{}'", s))
        })?;
        Ok(Self::new(host, port))
    }

    /// The host name
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// The member list of a replica set, or a bare seed list of standalone hosts.
///
/// The textual form is `setName/host1:port,host2:port` for a replica set and
/// `host1:port,host2:port` for standalones. The set name is what groups the
/// per-host pools of one replica set into a shared warming club; standalone
/// hosts each get a solitary club of their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionString {
    set_name: Option<String>,
    servers: Vec<HostAndPort>,
}

impl ConnectionString {
    /// Build a replica-set connection string
    pub fn for_replica_set(set_name: impl Into<String>, servers: Vec<HostAndPort>) -> Self {
        Self {
            set_name: Some(set_name.into()),
            servers,
        }
    }

    /// Build a standalone seed list
    pub fn for_standalones(servers: Vec<HostAndPort>) -> Self {
        Self {
            set_name: None,
            servers,
        }
    }

    /// Parse `setName/h1:p,h2:p` or `h1:p,h2:p`
    pub fn parse(s: &str) -> Result<Self> {
        let (set_name, hosts) = match s.split_once('/') {
            Some((name, rest)) => {
                if name.is_empty() {
                    return Err(Error::invalid_connection_string(
                        "empty replica set name".to_string(),
                    ));
                }
                (Some(name.to_string()), rest)
            }
            None => (None, s),
        };

        if hosts.is_empty() {
            return Err(Error::invalid_connection_string(
                "no hosts listed".to_string(),
            ));
        }

        let servers = hosts
            .split(',')
            .map(HostAndPort::parse)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { set_name, servers })
    }

    /// The replica-set name, if this names a replica set
    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// The listed servers
    pub fn servers(&self) -> &[HostAndPort] {
        &self.servers
    }

    /// Whether this names a replica set (as opposed to standalone seeds)
    pub fn is_replica_set(&self) -> bool {
        self.set_name.is_some()
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.set_name {
            write!(f, "{}/", name)?;
        }
        for (i, server) in self.servers.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", server)?;
        }
        Ok(())
    }
}

impl FromStr for ConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
