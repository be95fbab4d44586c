//! Peer address allocation
//!
//! Picks the lowest free host address across an interface's subnets. This
//! is a pure function over a snapshot of occupied addresses; callers that
//! allocate concurrently must hold the engine's allocation lock across
//! "snapshot, pick, record".

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::AllocationError;
use crate::records::Interface;

/// First host, in subnet order then ascending, that is neither reserved nor occupied
///
/// Network and broadcast addresses are never returned (except in /31 and
/// /32 subnets, which have none).
pub fn first_free_host(
    subnets: &[Ipv4Net],
    reserved: &BTreeSet<Ipv4Addr>,
    occupied: &BTreeSet<Ipv4Addr>,
) -> Option<Ipv4Addr> {
    subnets.iter().find_map(|subnet| {
        subnet
            .trunc()
            .hosts()
            .find(|host| !reserved.contains(host) && !occupied.contains(host))
    })
}

/// Allocate a peer address on `interface`
///
/// `occupied` must hold every peer address known at call time.
pub fn allocate(
    interface: &Interface,
    occupied: &BTreeSet<Ipv4Addr>,
) -> Result<Ipv4Addr, AllocationError> {
    let reserved: BTreeSet<Ipv4Addr> = interface.own_addresses().collect();

    first_free_host(&interface.addresses, &reserved, occupied).ok_or_else(|| {
        AllocationError::SubnetExhausted {
            interface: interface.name.clone(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interface(addresses: &[&str]) -> Interface {
        let mut iface = Interface::new("wg0", 1194);
        iface.addresses = addresses.iter().map(|a| a.parse().unwrap()).collect();
        iface
    }

    #[test]
    fn test_first_allocation_skips_interface_address() {
        let iface = interface(&["10.0.0.1/24"]);
        let address = allocate(&iface, &BTreeSet::new()).unwrap();
        assert_eq!(address, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_allocations_are_distinct() {
        let iface = interface(&["10.0.0.1/24"]);
        let mut occupied = BTreeSet::new();

        for _ in 0..100 {
            let address = allocate(&iface, &occupied).unwrap();
            assert_ne!(address, Ipv4Addr::new(10, 0, 0, 1));
            assert!(occupied.insert(address), "{} allocated twice", address);
        }
        assert_eq!(occupied.len(), 100);
    }

    #[test]
    fn test_subnet_exhaustion() {
        let iface = interface(&["10.0.0.1/24"]);
        let mut occupied = BTreeSet::new();

        // .2 through .254
        for _ in 0..253 {
            occupied.insert(allocate(&iface, &occupied).unwrap());
        }
        assert!(!occupied.contains(&Ipv4Addr::new(10, 0, 0, 0)));
        assert!(!occupied.contains(&Ipv4Addr::new(10, 0, 0, 255)));

        assert_eq!(
            allocate(&iface, &occupied),
            Err(AllocationError::SubnetExhausted {
                interface: "wg0".to_string()
            })
        );
    }

    #[test]
    fn test_falls_through_to_next_subnet() {
        let iface = interface(&["10.0.0.1/30", "10.0.1.1/24"]);
        let occupied: BTreeSet<Ipv4Addr> = [Ipv4Addr::new(10, 0, 0, 2)].into_iter().collect();

        assert_eq!(
            allocate(&iface, &occupied).unwrap(),
            Ipv4Addr::new(10, 0, 1, 2)
        );
    }

    #[test]
    fn test_fills_gaps_first() {
        let iface = interface(&["10.0.0.1/24"]);
        let occupied: BTreeSet<Ipv4Addr> = [2, 3, 5]
            .into_iter()
            .map(|last| Ipv4Addr::new(10, 0, 0, last))
            .collect();

        assert_eq!(
            allocate(&iface, &occupied).unwrap(),
            Ipv4Addr::new(10, 0, 0, 4)
        );
    }

    #[test]
    fn test_no_subnets() {
        let iface = interface(&[]);
        assert!(allocate(&iface, &BTreeSet::new()).is_err());
    }
}
