//! Peer address classification
//!
//! Answers two questions about the remote end of a request: which address
//! family it used (the `family` label) and whether it falls inside one of
//! the configured private ranges (the `internal` label).

use std::net::IpAddr;

use ipnet::IpNet;

/// Ranges treated as internal when no ranges are configured
pub const DEFAULT_PRIVATE_RANGES: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "::1/128",
    "fc00::/7",
];

/// Classifies peer addresses as internal or external
#[derive(Debug, Clone, Default)]
pub struct NetworkClassifier {
    ranges: Vec<IpNet>,
}

impl NetworkClassifier {
    /// Build a classifier from CIDR strings such as `10.0.0.0/8`
    ///
    /// A bare address (`10.1.2.3`) is accepted as a single-host range.
    pub fn from_cidrs<I, S>(cidrs: I) -> Result<Self, ipnet::AddrParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ranges = cidrs
            .into_iter()
            .map(|cidr| parse_range(cidr.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { ranges })
    }

    /// Classifier over [`DEFAULT_PRIVATE_RANGES`]
    pub fn with_default_ranges() -> Self {
        let ranges = DEFAULT_PRIVATE_RANGES
            .iter()
            .filter_map(|cidr| cidr.parse().ok())
            .collect();
        Self { ranges }
    }

    /// Whether the address falls inside any configured range
    ///
    /// IPv4-mapped IPv6 addresses are compared as IPv4.
    pub fn is_internal(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.ranges.iter().any(|range| range.contains(&ip))
    }

    /// `"y"` / `"n"` label for an optional peer address
    pub fn internal_label(&self, ip: Option<IpAddr>) -> &'static str {
        match ip {
            Some(ip) if self.is_internal(ip) => "y",
            _ => "n",
        }
    }

    pub fn ranges(&self) -> &[IpNet] {
        &self.ranges
    }
}

/// Address family label: `"2"` for IPv6 peers, `"1"` otherwise
///
/// An unknown peer is reported as IPv4, matching what a proxy would record
/// for a request whose remote address could not be parsed.
pub fn address_family(ip: Option<IpAddr>) -> &'static str {
    match ip.map(|ip| ip.to_canonical()) {
        Some(IpAddr::V6(_)) => "2",
        _ => "1",
    }
}

fn parse_range(cidr: &str) -> Result<IpNet, ipnet::AddrParseError> {
    let cidr = cidr.trim();
    if cidr.contains('/') {
        return cidr.parse();
    }
    match cidr.parse::<IpAddr>() {
        Ok(ip) => Ok(IpNet::from(ip)),
        // Re-parse as a network so the caller gets ipnet's error type
        Err(_) => cidr.parse(),
    }
}
