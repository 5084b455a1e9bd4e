//! One-shot close signalling shared by every closable component.

use parking_lot::Mutex;
use tokio::sync::watch;

type Hook = Box<dyn FnOnce() + Send>;

/// A one-shot close signal with close hooks.
///
/// `close` succeeds exactly once. Tasks can await [`closed`](Closer::closed)
/// to abort blocking work when the owner shuts down.
pub struct Closer {
    signal: watch::Sender<bool>,
    hooks: Mutex<Vec<Hook>>,
}

impl Closer {
    /// A new, open closer.
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal,
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Close and run the registered hooks.
    ///
    /// Returns `false` if the closer was already closed.
    pub fn close(&self) -> bool {
        let hooks = {
            let mut hooks = self.hooks.lock();
            if self.is_closed() {
                return false;
            }
            self.signal.send_replace(true);
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
        true
    }

    /// Whether [`close`](Closer::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolves once the closer is closed.
    pub async fn closed(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives in `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Run `hook` on close, or right away if already closed.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.hooks.lock();
        if self.is_closed() {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Closer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closer")
            .field("closed", &self.is_closed())
            .finish()
    }
}
