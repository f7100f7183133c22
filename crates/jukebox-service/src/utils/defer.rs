/// Execute a callback on dropping of the container type.
///
/// The callback must not panic under any circumstance. Since it is called while dropping an item,
/// this might result in aborting program execution.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    /// Creates a new `CallOnDrop`.
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }

    /// Consumes the guard without running the callback.
    pub fn disarm(mut self) {
        self.f.take();
    }
}

impl std::fmt::Debug for CallOnDrop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOnDrop")
            .field("armed", &self.f.is_some())
            .finish()
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_runs_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            let _guard = CallOnDrop::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disarm() {
        let calls = Arc::new(AtomicUsize::new(0));
        let guard = {
            let calls = Arc::clone(&calls);
            CallOnDrop::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        guard.disarm();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
