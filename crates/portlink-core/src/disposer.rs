//! Subscription disposer.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;

type Teardown = Box<dyn FnOnce() + Send>;

/// Zero-argument function that terminates a live subscription.
///
/// Running it more than once is a no-op. Clones share the same teardown.
#[derive(Clone)]
pub struct Disposer {
    teardown: Arc<Mutex<Option<Teardown>>>,
}

impl Disposer {
    /// Create a disposer from a teardown function.
    #[must_use]
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Arc::new(Mutex::new(Some(Box::new(teardown)))),
        }
    }

    /// A disposer with nothing to tear down.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            teardown: Arc::new(Mutex::new(None)),
        }
    }

    /// Run the teardown if it has not run yet.
    ///
    /// Returns `true` on the first call.
    pub fn dispose(&self) -> bool {
        let teardown = self.teardown.lock().take();
        teardown.is_some_and(|teardown| {
            teardown();
            true
        })
    }

    /// Whether the teardown already ran.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.teardown.lock().is_none()
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
