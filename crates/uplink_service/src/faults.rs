//! Fault injection.

use crate::error::ServiceError;
use std::collections::VecDeque;

/// A fault applied to one incoming exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this status (in-band error).
    Status(u16),
    /// Drop the link.
    Disconnect,
    /// Never answer.
    Timeout,
    /// Device memory exhaustion.
    OutOfMemory,
}

impl Fault {
    /// Parses `disconnect`, `timeout`, `oom` or a status code.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "disconnect" => Some(Fault::Disconnect),
            "timeout" => Some(Fault::Timeout),
            "oom" => Some(Fault::OutOfMemory),
            other => other.parse().ok().map(Fault::Status),
        }
    }

    fn into_error(self) -> ServiceError {
        match self {
            Fault::Status(status) => ServiceError::Status {
                status,
                message: "injected fault".into(),
            },
            Fault::Disconnect => ServiceError::Disconnected,
            Fault::Timeout => ServiceError::TimedOut,
            Fault::OutOfMemory => ServiceError::OutOfMemory,
        }
    }
}

/// Queued faults plus a reachability switch.
#[derive(Debug)]
pub struct FaultPlan {
    queue: VecDeque<Fault>,
    online: bool,
    applied: u64,
}

impl FaultPlan {
    /// Creates an empty, online plan.
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            online: true,
            applied: 0,
        }
    }

    /// Queues a fault for the next exchange.
    pub fn inject(&mut self, fault: Fault) {
        self.queue.push_back(fault);
    }

    /// Queues a fault for each of the next `times` exchanges.
    pub fn inject_n(&mut self, fault: Fault, times: usize) {
        self.queue.extend(std::iter::repeat(fault).take(times));
    }

    /// Makes the service (un)reachable. While offline every exchange fails
    /// with a dropped link and queued faults stay queued.
    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    /// Returns true while reachable.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Drops all queued faults.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Queued faults.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Faults applied so far.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Takes the fault for the current exchange, if any.
    pub fn next_fault(&mut self) -> Option<ServiceError> {
        if !self.online {
            return Some(ServiceError::Disconnected);
        }
        let fault = self.queue.pop_front()?;
        self.applied += 1;
        Some(fault.into_error())
    }
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_apply_in_order() {
        let mut plan = FaultPlan::new();
        plan.inject(Fault::Status(503));
        plan.inject(Fault::Timeout);
        assert_eq!(plan.next_fault().map(|e| e.status()), Some(503));
        assert_eq!(plan.next_fault(), Some(ServiceError::TimedOut));
        assert_eq!(plan.next_fault(), None);
        assert_eq!(plan.applied(), 2);
    }

    #[test]
    fn offline_keeps_queue() {
        let mut plan = FaultPlan::new();
        plan.inject_n(Fault::OutOfMemory, 2);
        plan.set_online(false);
        assert_eq!(plan.next_fault(), Some(ServiceError::Disconnected));
        assert_eq!(plan.pending(), 2);
        plan.set_online(true);
        assert_eq!(plan.next_fault(), Some(ServiceError::OutOfMemory));
    }

    #[test]
    fn parse() {
        assert_eq!(Fault::parse("disconnect"), Some(Fault::Disconnect));
        assert_eq!(Fault::parse("oom"), Some(Fault::OutOfMemory));
        assert_eq!(Fault::parse("429"), Some(Fault::Status(429)));
        assert_eq!(Fault::parse("nope"), None);
    }
}
