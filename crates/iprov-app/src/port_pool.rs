//! Host port allocation
//!
//! Ports come from an inclusive range. Released ports are reused first, then
//! a cursor walks the range. The lock is held only for the pop or push.

use std::sync::Mutex;

use iprov_core::prelude::*;
use iprov_core::types::PortSet;

#[derive(Debug)]
struct PoolState {
    /// Next never-allocated port; `None` once the range is used up
    cursor: Option<u16>,
    released: Vec<u16>,
}

/// Shared pool of host ports
#[derive(Debug)]
pub struct PortPool {
    min: u16,
    max: u16,
    state: Mutex<PoolState>,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            state: Mutex::new(PoolState {
                cursor: (min <= max).then_some(min),
                released: Vec::new(),
            }),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// Take one free port
    pub fn get_port(&self) -> Result<u16> {
        let mut state = self.lock();
        if let Some(port) = state.released.pop() {
            return Ok(port);
        }

        let port = state.cursor.ok_or(Error::PortsExhausted {
            min: self.min,
            max: self.max,
        })?;
        state.cursor = port.checked_add(1).filter(|next| *next <= self.max);
        Ok(port)
    }

    /// Return a port to the pool. Ports never handed out are ignored.
    pub fn release(&self, port: u16) {
        let mut state = self.lock();
        let handed_out = port >= self.min
            && port <= self.max
            && state.cursor.map_or(true, |cursor| port < cursor);
        if !handed_out || state.released.contains(&port) {
            warn!("Ignoring release of unallocated port {}", port);
            return;
        }
        state.released.push(port);
    }

    /// Allocate every port a device needs. On failure nothing stays taken.
    pub fn allocate_set(&self, backup_video: bool, video_log: bool) -> Result<PortSet> {
        let wanted = 3 + usize::from(backup_video) + usize::from(video_log);
        let mut taken = Vec::with_capacity(wanted);
        for _ in 0..wanted {
            match self.get_port() {
                Ok(port) => taken.push(port),
                Err(e) => {
                    taken.into_iter().for_each(|p| self.release(p));
                    return Err(e);
                }
            }
        }

        Ok(PortSet {
            automation: taken[0],
            video: taken[1],
            video_control: taken[2],
            backup_video: backup_video.then(|| taken[3]),
            video_log: video_log.then(|| taken[wanted - 1]),
        })
    }

    pub fn release_set(&self, ports: &PortSet) {
        for port in ports.all() {
            self.release(port);
        }
    }

    /// Ports currently free for reuse
    pub fn available(&self) -> usize {
        let state = self.lock();
        let fresh = state
            .cursor
            .map_or(0, |cursor| usize::from(self.max - cursor) + 1);
        fresh + state.released.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequential_allocation() {
        let pool = PortPool::new(8100, 8102);
        assert_eq!(pool.get_port().unwrap(), 8100);
        assert_eq!(pool.get_port().unwrap(), 8101);
        assert_eq!(pool.get_port().unwrap(), 8102);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_exhaustion_is_fatal() {
        let pool = PortPool::new(8100, 8100);
        pool.get_port().unwrap();
        let err = pool.get_port().unwrap_err();
        assert!(matches!(err, Error::PortsExhausted { min: 8100, max: 8100 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_released_port_reused_first() {
        let pool = PortPool::new(8100, 8200);
        let a = pool.get_port().unwrap();
        let _b = pool.get_port().unwrap();
        pool.release(a);
        assert_eq!(pool.get_port().unwrap(), a);
        assert_eq!(pool.get_port().unwrap(), 8102);
    }

    #[test]
    fn test_unallocated_and_double_release_ignored() {
        let pool = PortPool::new(8100, 8200);
        let a = pool.get_port().unwrap();
        pool.release(9000);
        pool.release(8150);
        pool.release(a);
        pool.release(a);
        assert_eq!(pool.get_port().unwrap(), a);
        assert_eq!(pool.get_port().unwrap(), 8101);
    }

    #[test]
    fn test_range_ending_at_u16_max() {
        let pool = PortPool::new(u16::MAX - 1, u16::MAX);
        assert_eq!(pool.get_port().unwrap(), u16::MAX - 1);
        assert_eq!(pool.get_port().unwrap(), u16::MAX);
        assert!(pool.get_port().is_err());
    }

    #[test]
    fn test_allocate_set_is_all_or_nothing() {
        let pool = PortPool::new(8100, 8104);
        let first = pool.allocate_set(false, false).unwrap();
        assert_eq!(first.all(), vec![8100, 8101, 8102]);

        assert!(pool.allocate_set(true, false).is_err());
        assert_eq!(pool.available(), 2);

        pool.release_set(&first);
        let again = pool.allocate_set(true, false).unwrap();
        assert!(again.backup_video.is_some());
        assert!(again.video_log.is_none());
    }

    #[test]
    fn test_allocate_set_with_log_port() {
        let pool = PortPool::new(8100, 8199);
        let log_only = pool.allocate_set(false, true).unwrap();
        assert_eq!(log_only.backup_video, None);
        assert_eq!(log_only.video_log, Some(8103));

        let both = pool.allocate_set(true, true).unwrap();
        assert_eq!(both.backup_video, Some(8107));
        assert_eq!(both.video_log, Some(8108));
        assert_eq!(both.all().len(), 5);
    }

    #[test]
    fn test_concurrent_sets_are_disjoint() {
        let pool = Arc::new(PortPool::new(8000, 8299));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.allocate_set(false, false).unwrap())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap().all() {
                assert!(seen.insert(port), "port {} handed out twice", port);
            }
        }
        assert_eq!(seen.len(), 30);
    }
}
