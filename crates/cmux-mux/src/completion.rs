//! One-shot completion slots backing the blocking APIs.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crate::error::Result;

/// Slot fulfilled once by the pump and awaited by a blocking caller.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    slot: Mutex<Option<Result<()>>>,
    ready: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store the outcome. Later calls are ignored.
    pub(crate) fn complete(&self, result: Result<()>) {
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.ready.notify_all();
        }
    }

    /// Wait until the slot is filled or `deadline` passes.
    pub(crate) fn wait_until(&self, deadline: Instant) -> Option<Result<()>> {
        let mut slot = self.lock();
        loop {
            if let Some(result) = slot.take() {
                return Some(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = match self.ready.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Result<()>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fulfil every waiter in `waiters`, building one result per waiter.
pub(crate) fn complete_all(waiters: &mut Vec<Arc<Completion>>, result: impl Fn() -> Result<()>) {
    for waiter in waiters.drain(..) {
        waiter.complete(result());
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::error::CmuxError;

    #[test]
    fn first_completion_wins() {
        let completion = Completion::new();
        completion.complete(Ok(()));
        completion.complete(Err(CmuxError::ConnectTimeout));
        assert!(matches!(
            completion.wait_until(Instant::now()),
            Some(Ok(()))
        ));
    }

    #[test]
    fn wait_times_out() {
        let completion = Completion::new();
        let start = Instant::now();
        assert!(completion
            .wait_until(start + Duration::from_millis(20))
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn completion_from_another_thread() {
        let completion = Completion::new();
        let remote = Arc::clone(&completion);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.complete(Err(CmuxError::Rejected(1)));
        });

        let result = completion.wait_until(Instant::now() + Duration::from_secs(2));
        assert!(matches!(result, Some(Err(CmuxError::Rejected(1)))));
        handle.join().unwrap();
    }

    #[test]
    fn complete_all_drains() {
        let mut waiters = vec![Completion::new(), Completion::new()];
        let kept: Vec<_> = waiters.iter().map(Arc::clone).collect();
        complete_all(&mut waiters, || Err(CmuxError::TransportClosed));
        assert!(waiters.is_empty());
        for waiter in kept {
            assert!(matches!(
                waiter.wait_until(Instant::now()),
                Some(Err(CmuxError::TransportClosed))
            ));
        }
    }
}
