//! Completion tracking for a subset of submitted jobs.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct GroupState {
    /// Member jobs that have not resolved yet
    outstanding: Mutex<usize>,
    drained: Condvar,
}

/// A set of jobs that can be waited on together.
///
/// Jobs join a group through [`JobQueue::submit_in`](super::JobQueue::submit_in)
/// and leave it once their handle is resolved. Waiting on the group ignores
/// every job submitted outside it. A group may span several queues, and
/// clones share the same membership.
#[derive(Clone, Default)]
pub struct JobGroup {
    state: Arc<GroupState>,
}

/// Membership of one job, released when dropped
pub(crate) struct GroupMember {
    state: Arc<GroupState>,
}

impl JobGroup {
    /// Create an empty group
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of member jobs not yet resolved
    pub fn outstanding(&self) -> usize {
        *self.state.outstanding.lock()
    }

    /// Block until every member job has resolved
    pub fn wait(&self) {
        let mut outstanding = self.state.outstanding.lock();
        while *outstanding > 0 {
            self.state.drained.wait(&mut outstanding);
        }
    }

    /// Wait at most `timeout` for every member job to resolve.
    ///
    /// Returns `true` if the group drained in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };

        let mut outstanding = self.state.outstanding.lock();
        while *outstanding > 0 {
            if self
                .state
                .drained
                .wait_until(&mut outstanding, deadline)
                .timed_out()
            {
                return *outstanding == 0;
            }
        }

        true
    }

    pub(crate) fn enter(&self) -> GroupMember {
        *self.state.outstanding.lock() += 1;
        GroupMember {
            state: Arc::clone(&self.state),
        }
    }
}

impl Drop for GroupMember {
    fn drop(&mut self) {
        let mut outstanding = self.state.outstanding.lock();
        *outstanding -= 1;
        if *outstanding == 0 {
            self.state.drained.notify_all();
        }
    }
}

impl fmt::Debug for JobGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobGroup")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_empty_group_does_not_block() {
        let group = JobGroup::new();
        group.wait();
        assert!(group.wait_timeout(Duration::ZERO));
        assert_eq!(group.outstanding(), 0);
    }

    #[test]
    fn test_group_drains_when_members_leave() {
        let group = JobGroup::new();
        let first = group.enter();
        let second = group.clone().enter();
        assert_eq!(group.outstanding(), 2);

        drop(first);
        assert!(!group.wait_timeout(Duration::from_millis(10)));

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(second);
        });

        assert!(group.wait_timeout(Duration::MAX));
        assert_eq!(group.outstanding(), 0);
    }
}
