// ===============================
// src/service.rs
// ===============================
use std::sync::atomic::{AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState { Created = 0, Starting = 1, Running = 2, Stopping = 3, Stopped = 4 }

impl ServiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServiceState::Created,
            1 => ServiceState::Starting,
            2 => ServiceState::Running,
            3 => ServiceState::Stopping,
            _ => ServiceState::Stopped,
        }
    }
}

/// Lifecycle cell shared between a service handle and its worker thread.
/// Transitions only move forward; a refused transition returns false.
#[derive(Debug)]
pub struct ServiceStatus { state: AtomicU8 }

impl Default for ServiceStatus {
    fn default() -> Self { Self { state: AtomicU8::new(ServiceState::Created as u8) } }
}

impl ServiceStatus {
    pub fn get(&self) -> ServiceState { ServiceState::from_u8(self.state.load(Ordering::Acquire)) }

    pub fn is_running(&self) -> bool { self.get() == ServiceState::Running }

    fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn starting(&self) -> bool { self.transition(ServiceState::Created, ServiceState::Starting) }
    pub fn running(&self) -> bool { self.transition(ServiceState::Starting, ServiceState::Running) }
    pub fn stopping(&self) -> bool { self.transition(ServiceState::Running, ServiceState::Stopping) }
    pub fn stopped(&self) { self.state.store(ServiceState::Stopped as u8, Ordering::Release); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_forward_only() {
        let s = ServiceStatus::default();
        assert_eq!(s.get(), ServiceState::Created);
        assert!(!s.stopping());
        assert!(s.starting());
        assert!(s.running());
        assert!(s.is_running());
        assert!(!s.starting());
        assert!(s.stopping());
        s.stopped();
        assert_eq!(s.get(), ServiceState::Stopped);
    }
}
