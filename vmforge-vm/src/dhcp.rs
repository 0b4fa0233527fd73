//! Lease pool behind the simulated platform's guest networking
//!
//! Hands out addresses sequentially from 10.0.0.10 inside 10.0.0.0/24,
//! skipping the gateway and anything still leased, and wraps around when
//! the end of the subnet is reached.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

use vmforge_core::platform::{PlatformError, PlatformResult};

pub mod constants {
    use std::net::Ipv4Addr;

    pub const DEFAULT_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    pub const DEFAULT_NETWORK_BASE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 0);
    pub const DEFAULT_ALLOCATION_START: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 10);
    pub const DEFAULT_PREFIX_LEN: u8 = 24;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeasePool {
    gateway: Ipv4Addr,
    network_base: Ipv4Addr,
    prefix_len: u8,
    allocation_start: Ipv4Addr,
    leased: BTreeSet<Ipv4Addr>,
    next_ip: Ipv4Addr,
}

impl Default for LeasePool {
    fn default() -> Self {
        Self::new(
            constants::DEFAULT_GATEWAY,
            constants::DEFAULT_NETWORK_BASE,
            constants::DEFAULT_PREFIX_LEN,
            constants::DEFAULT_ALLOCATION_START,
        )
    }
}

impl LeasePool {
    pub fn new(
        gateway: Ipv4Addr,
        network_base: Ipv4Addr,
        prefix_len: u8,
        allocation_start: Ipv4Addr,
    ) -> Self {
        Self {
            gateway,
            network_base,
            prefix_len,
            allocation_start,
            leased: BTreeSet::new(),
            next_ip: allocation_start,
        }
    }

    pub fn lease(&mut self) -> PlatformResult<Ipv4Addr> {
        for _ in 0..self.capacity() {
            let candidate = self.next_ip;
            self.advance();

            if self.is_available(candidate) {
                self.leased.insert(candidate);
                debug!(ip = %candidate, "leased guest address");
                return Ok(candidate);
            }
        }

        Err(PlatformError::Unavailable {
            message: format!(
                "no free addresses left in {}/{}",
                self.network_base, self.prefix_len
            ),
        })
    }

    pub fn release(&mut self, ip: Ipv4Addr) {
        if !self.leased.remove(&ip) {
            warn!(ip = %ip, "released an address that was not leased");
        }
    }

    pub fn is_leased(&self, ip: Ipv4Addr) -> bool {
        self.leased.contains(&ip)
    }

    pub fn leased_count(&self) -> usize {
        self.leased.len()
    }

    fn is_available(&self, ip: Ipv4Addr) -> bool {
        !self.leased.contains(&ip) && ip != self.gateway && self.in_range(ip)
    }

    fn in_range(&self, ip: Ipv4Addr) -> bool {
        let mask = !0u32 << (32 - u32::from(self.prefix_len));
        let ip_num = u32::from(ip);
        let broadcast = u32::from(self.network_base) | !mask;

        (ip_num & mask) == (u32::from(self.network_base) & mask)
            && ip_num >= u32::from(self.allocation_start)
            && ip_num < broadcast
    }

    fn advance(&mut self) {
        self.next_ip = Ipv4Addr::from(u32::from(self.next_ip).wrapping_add(1));
        if !self.in_range(self.next_ip) {
            self.next_ip = self.allocation_start;
        }
    }

    fn capacity(&self) -> usize {
        (1usize << (32 - u32::from(self.prefix_len))).saturating_sub(2)
    }
}
