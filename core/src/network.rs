//! Addressing types for emulated endpoints.
//!
//! Provides the interface address type used by migrations and the
//! per-session address cursor that hands out UE addresses sequentially.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{NetError, Result};

/// An IPv4 address with its prefix length, as assigned to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfaceAddr {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
}

impl IfaceAddr {
    pub fn new(ip: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(NetError::InvalidParameter(format!(
                "prefix length {} out of range for {}",
                prefix_len, ip
            )));
        }
        Ok(Self { ip, prefix_len })
    }

    /// Network address of the subnet containing this address.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip) & u32::from(prefix_to_netmask(self.prefix_len)))
    }

    /// The on-link subnet route the kernel installs when this address is added.
    pub fn subnet_route(&self) -> String {
        format!("{}/{}", self.network(), self.prefix_len)
    }
}

impl fmt::Display for IfaceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

impl std::str::FromStr for IfaceAddr {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        let (ip, prefix) = s
            .split_once('/')
            .ok_or_else(|| NetError::InvalidParameter(format!("expected ADDR/PREFIX: {}", s)))?;
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|e| NetError::InvalidParameter(format!("invalid address '{}': {}", ip, e)))?;
        let prefix_len: u8 = prefix.parse().map_err(|e| {
            NetError::InvalidParameter(format!("invalid prefix length '{}': {}", prefix, e))
        })?;
        Self::new(ip, prefix_len)
    }
}

/// Sequential, never-reusing address allocator for one session.
///
/// Addresses are formed by adding the cursor to the /24 network of the
/// configured base, so base `7.0.0.1` with a first host of 2 yields
/// `7.0.0.2`, `7.0.0.3`, ... Allocation fails once the next address would
/// leave the UE subnet or hit its broadcast address.
#[derive(Debug, Clone)]
pub struct AddressCursor {
    origin: u32,
    subnet: IfaceAddr,
    next: u32,
}

impl AddressCursor {
    pub fn new(base: Ipv4Addr, prefix_len: u8, first_host: u32) -> Result<Self> {
        let subnet = IfaceAddr::new(base, prefix_len)?;
        Ok(Self {
            origin: u32::from(base) & 0xffff_ff00,
            subnet,
            next: first_host,
        })
    }

    /// Host index the next allocation will use.
    pub fn next_index(&self) -> u32 {
        self.next
    }

    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        let candidate = self.origin.checked_add(self.next).ok_or_else(|| {
            NetError::AddressExhausted(format!("cursor overflow at index {}", self.next))
        })?;
        let mask = u32::from(prefix_to_netmask(self.subnet.prefix_len));
        let network = u32::from(self.subnet.network());
        let broadcast = network | !mask;

        if candidate & mask != network || candidate >= broadcast {
            tracing::warn!(
                subnet = %self.subnet.subnet_route(),
                issued = self.next,
                "Address pool exhausted"
            );
            return Err(NetError::AddressExhausted(format!(
                "no addresses left in {}",
                self.subnet.subnet_route()
            )));
        }

        self.next += 1;
        let address = Ipv4Addr::from(candidate);
        tracing::trace!(%address, "Address allocated");
        Ok(address)
    }
}

/// Convert a prefix length to a dotted-decimal netmask.
pub fn prefix_to_netmask(prefix: u8) -> Ipv4Addr {
    if prefix == 0 {
        return Ipv4Addr::new(0, 0, 0, 0);
    }
    let prefix = prefix.min(32) as u32;
    let mask = if prefix == 32 { u32::MAX } else { !((1u32 << (32 - prefix)) - 1) };
    Ipv4Addr::from(mask)
}

/// The base the EPC slave uses for UE and local addressing: the configured
/// UE base with its first octet cleared.
pub fn slave_address_base(ue_ip_base: Ipv4Addr) -> Ipv4Addr {
    let [_, b, c, d] = ue_ip_base.octets();
    Ipv4Addr::new(0, b, c, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_master_allocation_is_base_plus_one() {
        let mut cursor = AddressCursor::new(Ipv4Addr::new(7, 0, 0, 1), 8, 2).unwrap();
        assert_eq!(cursor.allocate().unwrap(), Ipv4Addr::new(7, 0, 0, 2));
        assert_eq!(cursor.allocate().unwrap(), Ipv4Addr::new(7, 0, 0, 3));
    }

    #[test]
    fn test_slave_allocation_starts_at_one() {
        let mut cursor = AddressCursor::new(Ipv4Addr::new(7, 0, 0, 1), 8, 1).unwrap();
        assert_eq!(cursor.allocate().unwrap(), Ipv4Addr::new(7, 0, 0, 1));
    }

    #[test]
    fn test_allocations_never_repeat() {
        let mut cursor = AddressCursor::new(Ipv4Addr::new(7, 0, 0, 1), 8, 2).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..600 {
            assert!(seen.insert(cursor.allocate().unwrap()));
        }
        // Carries past the last octet while staying inside 7.0.0.0/8
        assert!(seen.contains(&Ipv4Addr::new(7, 0, 1, 0)));
    }

    #[test]
    fn test_allocation_exhausts_small_subnet() {
        let mut cursor = AddressCursor::new(Ipv4Addr::new(10, 0, 0, 1), 30, 2).unwrap();
        assert_eq!(cursor.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        // 10.0.0.3 is the broadcast of 10.0.0.0/30
        let err = cursor.allocate().unwrap_err();
        assert!(matches!(err, NetError::AddressExhausted(_)));
        assert_eq!(cursor.next_index(), 3);
    }

    #[test]
    fn test_iface_addr_subnet_route() {
        let addr = IfaceAddr::new(Ipv4Addr::new(7, 0, 0, 2), 8).unwrap();
        assert_eq!(addr.network(), Ipv4Addr::new(7, 0, 0, 0));
        assert_eq!(addr.subnet_route(), "7.0.0.0/8");
        assert_eq!(addr.to_string(), "7.0.0.2/8");
    }

    #[test]
    fn test_iface_addr_parse() {
        let addr: IfaceAddr = "10.1.2.3/24".parse().unwrap();
        assert_eq!(addr.ip, Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(addr.prefix_len, 24);
        assert!("10.1.2.3".parse::<IfaceAddr>().is_err());
        assert!("10.1.2.3/33".parse::<IfaceAddr>().is_err());
        assert!("nope/8".parse::<IfaceAddr>().is_err());
    }

    #[test]
    fn test_prefix_to_netmask() {
        assert_eq!(prefix_to_netmask(8), Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(prefix_to_netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_netmask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(prefix_to_netmask(0), Ipv4Addr::new(0, 0, 0, 0));
    }

    #[test]
    fn test_slave_address_base() {
        assert_eq!(
            slave_address_base(Ipv4Addr::new(7, 0, 0, 1)),
            Ipv4Addr::new(0, 0, 0, 1)
        );
        assert_eq!(
            slave_address_base(Ipv4Addr::new(10, 20, 30, 40)),
            Ipv4Addr::new(0, 20, 30, 40)
        );
    }
}
