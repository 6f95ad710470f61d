//! IPv4 subnets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::TopologyError;

/// An IPv4 prefix such as `10.1.1.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subnet {
    base: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    /// Parse a dotted-quad base and mask, e.g. `"10.1.1.0"` and
    /// `"255.255.255.0"`.
    ///
    /// The mask must be contiguous and the base must not have host bits set.
    pub fn parse(base: &str, mask: &str) -> Result<Self, TopologyError> {
        let base: Ipv4Addr = base
            .trim()
            .parse()
            .map_err(|_| TopologyError::Configuration(format!("malformed subnet base '{}'", base)))?;
        let mask_addr: Ipv4Addr = mask
            .trim()
            .parse()
            .map_err(|_| TopologyError::Configuration(format!("malformed subnet mask '{}'", mask)))?;
        let bits = u32::from(mask_addr);
        if bits.leading_ones() + bits.trailing_zeros() != 32 {
            return Err(TopologyError::Configuration(format!(
                "mask {} is not contiguous",
                mask_addr
            )));
        }
        Self::new(base, bits.leading_ones() as u8)
    }

    /// Create from a base address and prefix length.
    pub fn new(base: Ipv4Addr, prefix_len: u8) -> Result<Self, TopologyError> {
        if prefix_len > 32 {
            return Err(TopologyError::Configuration(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }
        let subnet = Subnet { base, prefix_len };
        if u32::from(base) & !subnet.mask_bits() != 0 {
            return Err(TopologyError::Configuration(format!(
                "base {} has host bits set for /{}",
                base, prefix_len
            )));
        }
        Ok(subnet)
    }

    fn mask_bits(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        }
    }

    /// Network address.
    pub fn base(&self) -> Ipv4Addr {
        self.base
    }

    /// Prefix length in bits.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Dotted-quad mask.
    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask_bits())
    }

    /// Whether `addr` lies in this subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask_bits() == u32::from(self.base)
    }

    /// Whether the two prefixes share any address.
    pub fn overlaps(&self, other: &Subnet) -> bool {
        self.contains(other.base) || other.contains(self.base)
    }

    /// Number of assignable host addresses (network and broadcast excluded).
    pub fn host_capacity(&self) -> u64 {
        let size = 1u64 << (32 - self.prefix_len as u32);
        size.saturating_sub(2)
    }

    /// The `n`th host address, starting at 1.
    pub fn host(&self, n: u64) -> Option<Ipv4Addr> {
        if n == 0 || n > self.host_capacity() {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.base) + n as u32))
    }
}

impl FromStr for Subnet {
    type Err = TopologyError;

    /// Parse CIDR notation, e.g. `10.1.1.0/24`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, len) = s
            .split_once('/')
            .ok_or_else(|| TopologyError::Configuration(format!("malformed subnet '{}'", s)))?;
        let base: Ipv4Addr = base
            .trim()
            .parse()
            .map_err(|_| TopologyError::Configuration(format!("malformed subnet '{}'", s)))?;
        let len: u8 = len
            .trim()
            .parse()
            .map_err(|_| TopologyError::Configuration(format!("malformed subnet '{}'", s)))?;
        Subnet::new(base, len)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_base_and_mask() {
        let s = Subnet::parse("10.1.1.0", "255.255.255.0").unwrap();
        assert_eq!(s.prefix_len(), 24);
        assert_eq!(s.mask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(s.to_string(), "10.1.1.0/24");
        assert_eq!(s.host(1), Some(Ipv4Addr::new(10, 1, 1, 1)));
        assert_eq!(s.host(254), Some(Ipv4Addr::new(10, 1, 1, 254)));
        assert_eq!(s.host(255), None);
        assert_eq!(s.host_capacity(), 254);
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(Subnet::parse("10.1.1", "255.255.255.0"), Err(TopologyError::Configuration(_))));
        assert!(matches!(Subnet::parse("10.1.1.0", "255.0.255.0"), Err(TopologyError::Configuration(_))));
        assert!(matches!(Subnet::parse("10.1.1.7", "255.255.255.0"), Err(TopologyError::Configuration(_))));
        assert!(matches!("10.1.1.0".parse::<Subnet>(), Err(TopologyError::Configuration(_))));
        assert!(matches!("10.1.1.0/33".parse::<Subnet>(), Err(TopologyError::Configuration(_))));
    }

    #[test]
    fn test_cidr_and_overlap() {
        let a: Subnet = "10.1.0.0/16".parse().unwrap();
        let b: Subnet = "10.1.3.0/24".parse().unwrap();
        let c: Subnet = "10.2.0.0/24".parse().unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(b.contains(Ipv4Addr::new(10, 1, 3, 200)));
        assert!(!b.contains(Ipv4Addr::new(10, 1, 4, 1)));
    }
}
