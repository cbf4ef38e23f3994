//! CIDR primitives.
//!
//! Parsing, validity checks, containment and overlap tests over IPv4
//! blocks. Everything here is pure; no I/O and no retained state.

use ipnet::Ipv4Net;
use std::net::{IpAddr, Ipv4Addr};

/// Errors produced while parsing or classifying a CIDR
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CidrError {
    #[error("invalid CIDR '{cidr}': {reason}")]
    Malformed { cidr: String, reason: String },

    #[error("IPv6 is not supported: '{value}'")]
    Ipv6Unsupported { value: String },

    #[error("{cidr} can't be used: network address {network} is unspecified")]
    Unspecified { cidr: String, network: Ipv4Addr },

    #[error("{cidr} can't be used: network address {network} is a loopback address")]
    Loopback { cidr: String, network: Ipv4Addr },

    #[error("{cidr} can't be used: network address {network} is a link-local unicast address")]
    LinkLocalUnicast { cidr: String, network: Ipv4Addr },

    #[error("{cidr} can't be used: network address {network} is a link-local multicast address")]
    LinkLocalMulticast { cidr: String, network: Ipv4Addr },
}

/// Parse an IPv4 CIDR, normalizing it to its network address.
///
/// `10.10.10.5/24` parses to `10.10.10.0/24`. IPv6 input is rejected.
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net, CidrError> {
    let trimmed = cidr.trim();
    match trimmed.parse::<Ipv4Net>() {
        Ok(net) => Ok(net.trunc()),
        Err(e) => {
            if trimmed.contains(':') {
                return Err(CidrError::Ipv6Unsupported { value: trimmed.to_string() });
            }
            Err(CidrError::Malformed {
                cidr: trimmed.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

/// Reject a CIDR that can't serve as a pool or cluster block.
///
/// The rules look at the network address only: unspecified, loopback,
/// link-local unicast (169.254.0.0/16) and link-local multicast
/// (224.0.0.0/24) are refused.
pub fn is_valid_pool(cidr: &str) -> Result<Ipv4Net, CidrError> {
    let net = parse_cidr(cidr)?;
    let network = net.network();
    let cidr = net.to_string();

    if network.is_unspecified() {
        return Err(CidrError::Unspecified { cidr, network });
    }
    if network.is_loopback() {
        return Err(CidrError::Loopback { cidr, network });
    }
    if network.is_link_local() {
        return Err(CidrError::LinkLocalUnicast { cidr, network });
    }
    if is_link_local_multicast(network) {
        return Err(CidrError::LinkLocalMulticast { cidr, network });
    }

    Ok(net)
}

fn is_link_local_multicast(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 224 && octets[1] == 0 && octets[2] == 0
}

/// Check whether `candidate` overlaps any block in `existing`.
///
/// Two blocks overlap when either one's network address falls inside the
/// other. Any unparsable input is an error, candidate or existing.
pub fn overlaps<S: AsRef<str>>(existing: &[S], candidate: &str) -> Result<bool, CidrError> {
    let candidate = parse_cidr(candidate)?;
    for cidr in existing {
        let block = parse_cidr(cidr.as_ref())?;
        if nets_overlap(&block, &candidate) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Symmetric containment check on two parsed blocks
pub fn nets_overlap(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// True when `inner` lies entirely inside `outer`
pub fn is_subnet_of(inner: &Ipv4Net, outer: &Ipv4Net) -> bool {
    outer.contains(inner)
}

/// Big-endian integer form of an IPv4 address.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are normalized first;
/// anything else in IPv6 is rejected.
pub fn address_of(ip: IpAddr) -> Result<u32, CidrError> {
    match ip {
        IpAddr::V4(v4) => Ok(u32::from(v4)),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(u32::from)
            .ok_or_else(|| CidrError::Ipv6Unsupported { value: v6.to_string() }),
    }
}

/// Inverse of [`address_of`]
pub fn ip_of(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value)
}

/// Number of addresses covered by a block
pub fn capacity(net: &Ipv4Net) -> u64 {
    1u64 << (32 - u32::from(net.prefix_len()))
}

/// First and last address of a block as integers (inclusive)
pub fn bounds(net: &Ipv4Net) -> (u64, u64) {
    let start = u64::from(u32::from(net.network()));
    (start, start + capacity(net) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_parse_normalizes_host_bits() {
        let net = parse_cidr("10.10.10.5/24").unwrap();
        assert_eq!(net.to_string(), "10.10.10.0/24");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_cidr("not-a-cidr"), Err(CidrError::Malformed { .. })));
        assert!(matches!(parse_cidr("10.0.0.0/33"), Err(CidrError::Malformed { .. })));
        assert!(matches!(parse_cidr("10.0.0.0"), Err(CidrError::Malformed { .. })));
        assert!(matches!(parse_cidr("fd00::/64"), Err(CidrError::Ipv6Unsupported { .. })));
    }

    #[test]
    fn test_is_valid_pool() {
        assert!(is_valid_pool("242.0.0.0/8").is_ok());
        assert!(is_valid_pool("10.0.0.0/16").is_ok());

        assert!(matches!(is_valid_pool("0.0.0.0/8"), Err(CidrError::Unspecified { .. })));
        assert!(matches!(is_valid_pool("127.0.0.0/8"), Err(CidrError::Loopback { .. })));
        assert!(matches!(is_valid_pool("169.254.0.0/16"), Err(CidrError::LinkLocalUnicast { .. })));
        assert!(matches!(is_valid_pool("224.0.0.0/24"), Err(CidrError::LinkLocalMulticast { .. })));
        // Only the network address is classified
        assert!(is_valid_pool("224.0.1.0/24").is_ok());
    }

    #[test]
    fn test_is_valid_pool_error_names_rule() {
        let err = is_valid_pool("127.1.0.0/16").unwrap_err();
        assert!(err.to_string().contains("loopback"));
        assert!(err.to_string().contains("127.1.0.0/16"));
    }

    #[test]
    fn test_overlaps_both_directions() {
        let existing = vec!["10.10.0.0/16".to_string()];
        assert!(overlaps(&existing, "10.10.10.0/24").unwrap());

        let existing = vec!["10.10.10.0/24"];
        assert!(overlaps(&existing, "10.10.0.0/16").unwrap());

        let existing = vec!["10.10.0.0/16", "10.12.0.0/16"];
        assert!(!overlaps(&existing, "10.11.0.0/16").unwrap());

        let empty: Vec<String> = Vec::new();
        assert!(!overlaps(&empty, "10.11.0.0/16").unwrap());
    }

    #[test]
    fn test_overlaps_propagates_parse_errors() {
        assert!(overlaps(&["10.0.0.0/8"], "bogus").is_err());
        assert!(overlaps(&["bogus"], "10.0.0.0/8").is_err());
    }

    #[test]
    fn test_address_conversions() {
        let ip: IpAddr = "169.254.32.0".parse().unwrap();
        assert_eq!(address_of(ip).unwrap(), 0xA9FE_2000);
        assert_eq!(ip_of(0xA9FE_2000), Ipv4Addr::new(169, 254, 32, 0));

        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped());
        assert_eq!(address_of(mapped).unwrap(), 0x0A00_0001);

        assert!(address_of(IpAddr::V6(Ipv6Addr::LOCALHOST)).is_err());
    }

    #[test]
    fn test_bounds_and_capacity() {
        let net = parse_cidr("169.254.0.0/19").unwrap();
        assert_eq!(capacity(&net), 8192);
        assert_eq!(bounds(&net), (0xA9FE_0000, 0xA9FE_1FFF));

        let all = parse_cidr("0.0.0.0/0").unwrap();
        assert_eq!(capacity(&all), 1u64 << 32);
        assert_eq!(bounds(&all), (0, u64::from(u32::MAX)));
    }
}
