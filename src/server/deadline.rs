//! Per-request deadline token
//!
//! Created from the write timeout when a request arrives and handed to
//! every stage. Stages consult it at their checkpoints; expiry
//! surfaces as a `Timeout` error and unwinds through the normal error
//! path, releasing pooled resources on the way.

use std::time::{Duration, Instant};

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Deadline {
            at: Instant::now() + timeout,
        }
    }

    /// Checkpoint: fails with `Timeout` once the deadline has passed.
    pub fn check(&self) -> Result<(), ServiceError> {
        if Instant::now() >= self.at {
            Err(ServiceError::Timeout)
        } else {
            Ok(())
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn instant(&self) -> Instant {
        self.at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_deadline_passes() {
        let deadline = Deadline::after(Duration::from_secs(10));
        assert!(deadline.check().is_ok());
        assert!(deadline.remaining() > Duration::from_secs(9));
    }

    #[test]
    fn test_expired_deadline_fails() {
        let deadline = Deadline::after(Duration::from_secs(0));
        assert_eq!(deadline.check(), Err(ServiceError::Timeout));
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }
}
