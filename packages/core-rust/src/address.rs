//! Endpoint addresses and the well-known anonymous/none destinations.

use std::fmt;

use url::Url;

/// Anonymous destination: "reply on the back channel".
pub const ANONYMOUS_ADDRESS: &str = "http://www.w3.org/2005/08/addressing/anonymous";
/// Null destination: "discard".
pub const NONE_ADDRESS: &str = "http://www.w3.org/2005/08/addressing/none";

/// Base used to resolve path-only addresses such as `"/svc"`.
const RELATIVE_BASE: &str = "relative://localhost/";

/// Errors raised when parsing an endpoint address.
#[derive(Debug, thiserror::Error)]
#[error("invalid endpoint address {address:?}: {source}")]
pub struct AddressError {
    pub address: String,
    #[source]
    pub source: url::ParseError,
}

/// Parsed endpoint address. Path-only addresses are accepted and marked
/// relative; they never take part in host comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    uri: Url,
    relative: bool,
}

impl EndpointAddress {
    /// Parse an absolute URI or an absolute path.
    ///
    /// # Errors
    ///
    /// Returns `AddressError` if the input is neither.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        match Url::parse(address) {
            Ok(uri) => Ok(Self {
                uri,
                relative: false,
            }),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = Url::parse(RELATIVE_BASE).map_err(|source| AddressError {
                    address: address.to_string(),
                    source,
                })?;
                let uri = base.join(address).map_err(|source| AddressError {
                    address: address.to_string(),
                    source,
                })?;
                Ok(Self {
                    uri,
                    relative: true,
                })
            }
            Err(source) => Err(AddressError {
                address: address.to_string(),
                source,
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Host name, or `None` for relative addresses.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        if self.relative {
            None
        } else {
            self.uri.host_str()
        }
    }

    #[must_use]
    pub fn is_relative(&self) -> bool {
        self.relative
    }

    /// Whether `address` names one of the well-known anonymous/none destinations.
    #[must_use]
    pub fn is_well_known(address: &str) -> bool {
        address == ANONYMOUS_ADDRESS || address == NONE_ADDRESS
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.relative {
            f.write_str(self.uri.path())
        } else {
            f.write_str(self.uri.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_uri() {
        let addr = EndpointAddress::parse("net.mem://node-a/calc").unwrap();
        assert_eq!(addr.path(), "/calc");
        assert_eq!(addr.host(), Some("node-a"));
        assert!(!addr.is_relative());
    }

    #[test]
    fn parses_path_only_address() {
        let addr = EndpointAddress::parse("/svc").unwrap();
        assert_eq!(addr.path(), "/svc");
        assert_eq!(addr.host(), None);
        assert_eq!(addr.to_string(), "/svc");
    }

    #[test]
    fn rejects_garbage() {
        assert!(EndpointAddress::parse("http://[::1").is_err());
    }

    #[test]
    fn recognizes_well_known_addresses() {
        assert!(EndpointAddress::is_well_known(ANONYMOUS_ADDRESS));
        assert!(EndpointAddress::is_well_known(NONE_ADDRESS));
        assert!(!EndpointAddress::is_well_known("net.mem://node-a/calc"));
    }
}
