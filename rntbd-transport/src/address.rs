//! Physical replica addresses.

use {
    crate::error::{Result, TransportError},
    std::{fmt, str::FromStr},
    url::Url,
};

pub const SCHEME: &str = "rntbd";

/// A replica address of the form `rntbd://host:port/replica/path/`.
///
/// The authority (`host:port`) keys the endpoint and its pool; the path is
/// sent on every request as the replica path header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhysicalAddress {
    uri: Url,
    authority: String,
}

impl PhysicalAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let invalid = |reason: &str| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };
        let uri = Url::parse(address).map_err(|e| invalid(&e.to_string()))?;
        if uri.scheme() != SCHEME {
            return Err(invalid("scheme must be rntbd"));
        }
        let host = uri.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = uri.port().ok_or_else(|| invalid("missing port"))?;
        let authority = format!("{host}:{port}");
        Ok(Self { uri, authority })
    }

    /// `host:port`, suitable for dialing.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn replica_path(&self) -> &str {
        self.uri.path()
    }

    pub fn as_str(&self) -> &str {
        self.uri.as_str()
    }

    /// The address of the endpoint serving this replica, without a path.
    pub fn endpoint(&self) -> Self {
        let mut uri = self.uri.clone();
        uri.set_path("/");
        uri.set_query(None);
        uri.set_fragment(None);
        Self {
            uri,
            authority: self.authority.clone(),
        }
    }
}

impl FromStr for PhysicalAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri.as_str())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    #[test]
    fn test_parse_replica_address() {
        let address =
            PhysicalAddress::parse("rntbd://10.0.0.4:14303/apps/a/services/b/partitions/c/replicas/1p/")
                .unwrap();
        assert_eq!(address.authority(), "10.0.0.4:14303");
        assert_eq!(
            address.replica_path(),
            "/apps/a/services/b/partitions/c/replicas/1p/"
        );
        assert_eq!(address.endpoint().as_str(), "rntbd://10.0.0.4:14303/");
        assert_eq!(address.endpoint().authority(), address.authority());
    }

    #[test]
    fn test_parse_rejects_bad_addresses() {
        assert_matches!(
            PhysicalAddress::parse("https://host:443/"),
            Err(TransportError::InvalidAddress { .. })
        );
        assert_matches!(
            PhysicalAddress::parse("rntbd://host/"),
            Err(TransportError::InvalidAddress { .. })
        );
        assert!("not a uri".parse::<PhysicalAddress>().is_err());
    }
}
