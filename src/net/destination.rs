//! Destination: one bound UDP endpoint identified by a channel URI.

use std::fmt;

use thiserror::Error;

use super::Endpoint;

const UDP_SCHEME: &str = "udp://";

/// Errors parsing a channel URI into a [`Destination`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DestinationError {
    /// URI does not start with `udp://`.
    #[error("unsupported channel URI scheme: {0}")]
    InvalidScheme(String),
    /// The address part is not a valid `ip:port`.
    #[error("invalid endpoint address in channel URI: {0}")]
    InvalidAddress(String),
}

/// An immutable destination: the local endpoint a receiver binds, the data
/// address the sources transmit to, and whether that address is multicast.
///
/// Parsed from a channel URI of the form `udp://ip:port`. Two destinations
/// compare equal when their canonical URIs match, so the parsed form can be
/// carried as a string through command buffers and re-parsed losslessly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    remote_data: Endpoint,
    local_data: Endpoint,
    multicast: bool,
}

impl Destination {
    /// Parses a channel URI.
    ///
    /// For unicast the receiver binds the given address itself; the sources
    /// are identified later by the datagram source address. For multicast the
    /// given address is the group to join.
    ///
    /// # Errors
    ///
    /// Returns [`DestinationError`] on an unknown scheme or malformed address.
    pub fn parse(uri: &str) -> Result<Self, DestinationError> {
        let rest = uri
            .strip_prefix(UDP_SCHEME)
            .ok_or_else(|| DestinationError::InvalidScheme(uri.to_owned()))?;

        let data: Endpoint = rest
            .parse()
            .map_err(|_| DestinationError::InvalidAddress(rest.to_owned()))?;

        Ok(Self {
            remote_data: data,
            local_data: data,
            multicast: data.is_multicast(),
        })
    }

    /// The endpoint the receive socket binds.
    #[must_use]
    pub const fn local_data(&self) -> Endpoint {
        self.local_data
    }

    /// The address sources transmit data to.
    #[must_use]
    pub const fn remote_data(&self) -> Endpoint {
        self.remote_data
    }

    /// Whether the data address is a multicast group.
    #[must_use]
    pub const fn is_multicast(&self) -> bool {
        self.multicast
    }

    /// Canonical URI form, usable as a registry key and re-parseable.
    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{UDP_SCHEME}{}", self.remote_data)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{UDP_SCHEME}{}", self.remote_data)
    }
}
