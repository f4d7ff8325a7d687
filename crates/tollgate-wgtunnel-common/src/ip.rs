// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Tunnel address allocation.
//!
//! Allocation is forward-only: the next address is the most recently
//! allocated one (the last peer the driver reports) plus one. Released
//! addresses are only handed out again if they happen to be that increment
//! target.

use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpError {
	#[error("address space exhausted: {next} is outside {range}")]
	AddressSpaceExhausted { range: IpNet, next: String },
}

pub type Result<T> = std::result::Result<T, IpError>;

/// Adds one to `addr`, treating it as an unsigned big-endian integer. The
/// all-ones address wraps to all-zeroes.
pub fn increment(addr: IpAddr) -> IpAddr {
	match addr {
		IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4).wrapping_add(1))),
		IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6).wrapping_add(1))),
	}
}

/// Host prefix length for a single-address allowed-IP entry.
pub fn host_prefix(addr: IpAddr) -> u8 {
	match addr {
		IpAddr::V4(_) => 32,
		IpAddr::V6(_) => 128,
	}
}

#[derive(Debug, Clone, Copy)]
pub struct AddressAllocator {
	range: IpNet,
	gateway: IpAddr,
}

impl AddressAllocator {
	pub fn new(range: IpNet, gateway: IpAddr) -> Self {
		Self { range, gateway }
	}

	pub fn range(&self) -> IpNet {
		self.range
	}

	pub fn gateway(&self) -> IpAddr {
		self.gateway
	}

	/// Picks the address for a new peer given the addresses currently bound
	/// to peers, in driver-reported order.
	pub fn next_address(&self, existing: &[IpAddr]) -> Result<IpAddr> {
		let baseline = existing.last().copied().unwrap_or(self.gateway);
		let next = increment(baseline);

		if !self.range.contains(&next) {
			return Err(IpError::AddressSpaceExhausted {
				range: self.range,
				next: next.to_string(),
			});
		}

		Ok(next)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	fn allocator(range: &str, gateway: &str) -> AddressAllocator {
		AddressAllocator::new(range.parse().unwrap(), gateway.parse().unwrap())
	}

	fn ip(s: &str) -> IpAddr {
		s.parse().unwrap()
	}

	#[test]
	fn first_peer_follows_gateway() {
		let alloc = allocator("10.0.0.0/24", "10.0.0.1");
		assert_eq!(alloc.next_address(&[]).unwrap(), ip("10.0.0.2"));
	}

	#[test]
	fn second_peer_follows_first() {
		let alloc = allocator("10.0.0.0/24", "10.0.0.1");
		let first = alloc.next_address(&[]).unwrap();
		let second = alloc.next_address(&[first]).unwrap();
		assert_eq!(second, ip("10.0.0.3"));
	}

	#[test]
	fn uses_last_reported_address_not_highest() {
		let alloc = allocator("10.0.0.0/24", "10.0.0.1");
		let next = alloc
			.next_address(&[ip("10.0.0.9"), ip("10.0.0.4")])
			.unwrap();
		assert_eq!(next, ip("10.0.0.5"));
	}

	#[test]
	fn carries_across_octets() {
		let alloc = allocator("10.0.0.0/16", "10.0.0.1");
		assert_eq!(alloc.next_address(&[ip("10.0.0.255")]).unwrap(), ip("10.0.1.0"));
		assert_eq!(alloc.next_address(&[ip("10.0.255.254")]).unwrap(), ip("10.0.255.255"));
	}

	#[test]
	fn slash_31_overflows() {
		let alloc = allocator("10.0.0.0/31", "10.0.0.0");
		assert_eq!(alloc.next_address(&[]).unwrap(), ip("10.0.0.1"));
		let err = alloc.next_address(&[ip("10.0.0.1")]).unwrap_err();
		assert!(matches!(err, IpError::AddressSpaceExhausted { .. }));
	}

	#[test]
	fn full_range_overflows() {
		let alloc = allocator("10.0.0.0/24", "10.0.0.1");
		let err = alloc.next_address(&[ip("10.0.0.255")]).unwrap_err();
		assert_eq!(
			err,
			IpError::AddressSpaceExhausted {
				range: "10.0.0.0/24".parse().unwrap(),
				next: "10.0.1.0".to_string(),
			}
		);
	}

	#[test]
	fn wrap_of_whole_address_space_is_exhaustion() {
		assert_eq!(increment(ip("255.255.255.255")), ip("0.0.0.0"));
		let alloc = allocator("255.255.255.0/24", "255.255.255.1");
		assert!(alloc.next_address(&[ip("255.255.255.255")]).is_err());
	}

	#[test]
	fn ipv6_range() {
		let alloc = allocator("fd00::/120", "fd00::1");
		assert_eq!(alloc.next_address(&[]).unwrap(), ip("fd00::2"));
		assert!(alloc.next_address(&[ip("fd00::ff")]).is_err());
		assert_eq!(host_prefix(ip("fd00::2")), 128);
	}

	proptest! {
		#[test]
		fn allocation_is_fresh_and_monotonic(count in 1usize..200) {
			let alloc = allocator("10.8.0.0/24", "10.8.0.1");
			let mut existing: Vec<IpAddr> = Vec::new();
			for _ in 0..count {
				match alloc.next_address(&existing) {
					Ok(next) => {
						prop_assert!(!existing.contains(&next));
						prop_assert!(alloc.range().contains(&next));
						if let Some(last) = existing.last() {
							prop_assert_eq!(next, increment(*last));
						}
						existing.push(next);
					}
					Err(IpError::AddressSpaceExhausted { .. }) => {
						prop_assert_eq!(existing.last().copied(), Some(ip("10.8.0.255")));
						break;
					}
					Err(e) => prop_assert!(false, "unexpected error {e}"),
				}
			}
		}
	}
}
