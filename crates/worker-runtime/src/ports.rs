//! Local port allocation for backend instances

use std::collections::BTreeSet;
use worker_core::{Error, PortConfig, Result};

/// Hands out unique ports counting down from a base port.
///
/// The first port is the base; every later port is one below the lowest port
/// currently in use, so released ports near the bottom are reused first.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    base: u16,
    floor: u16,
    used: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(base: u16, floor: u16) -> Self {
        Self {
            base,
            floor,
            used: BTreeSet::new(),
        }
    }

    pub fn from_config(config: &PortConfig) -> Self {
        Self::new(config.base_port, config.floor_port)
    }

    /// Reserve the next port
    pub fn allocate(&mut self) -> Result<u16> {
        let port = match self.used.first() {
            None => self.base,
            Some(&lowest) if lowest > self.floor => lowest - 1,
            Some(&lowest) => {
                return Err(Error::resource_exhausted(format!(
                    "no port left below {} (floor {})",
                    lowest, self.floor
                )))
            }
        };
        self.used.insert(port);
        Ok(port)
    }

    /// Release a port. Returns false if it was not allocated.
    pub fn release(&mut self, port: u16) -> bool {
        self.used.remove(&port)
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.used.contains(&port)
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_down_from_base() {
        let mut ports = PortAllocator::new(9001, 1024);
        assert_eq!(ports.allocate().unwrap(), 9001);
        assert_eq!(ports.allocate().unwrap(), 9000);
        assert_eq!(ports.allocate().unwrap(), 8999);
        assert_eq!(ports.in_use(), 3);
    }

    #[test]
    fn test_reuses_below_lowest() {
        let mut ports = PortAllocator::new(9001, 1024);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        assert!(ports.release(b));
        assert_eq!(ports.allocate().unwrap(), b);

        assert!(ports.release(a));
        assert_eq!(ports.allocate().unwrap(), b - 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut ports = PortAllocator::new(9001, 1024);
        let port = ports.allocate().unwrap();
        assert!(ports.release(port));
        assert!(!ports.release(port));
        assert!(!ports.release(1234));
        assert_eq!(ports.allocate().unwrap(), 9001);
    }

    #[test]
    fn test_exhaustion_at_floor() {
        let mut ports = PortAllocator::new(1026, 1024);
        assert_eq!(ports.allocate().unwrap(), 1026);
        assert_eq!(ports.allocate().unwrap(), 1025);
        assert_eq!(ports.allocate().unwrap(), 1024);
        assert!(matches!(ports.allocate(), Err(Error::ResourceExhausted(_))));
        assert_eq!(ports.in_use(), 3);
    }

    #[test]
    fn test_ports_stay_unique() {
        let mut ports = PortAllocator::new(9001, 1024);
        let mut seen = BTreeSet::new();
        for round in 0..50 {
            let port = ports.allocate().unwrap();
            assert!(seen.insert(port), "port {} handed out twice", port);
            if round % 3 == 0 {
                ports.release(port);
                seen.remove(&port);
            }
        }
    }
}
