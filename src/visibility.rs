/// file: src/visibility.rs
/// description: foreground/background signal used to pause polling
use std::sync::Arc;
use tokio::sync::watch;

/// Current visibility plus how many times the surface has been shown
/// again after being hidden. The counter survives the `watch` channel
/// coalescing a quick hide/show into a single wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visibility {
    pub visible: bool,
    pub reveals: u64,
}

pub type VisibilityWatch = watch::Receiver<Visibility>;

/// Owned by whatever displays the feed. Flipping it to hidden stops polling;
/// flipping it back triggers one immediate refresh.
#[derive(Debug, Clone)]
pub struct VisibilityHandle {
    tx: Arc<watch::Sender<Visibility>>,
}

impl VisibilityHandle {
    pub fn new(visible: bool) -> Self {
        let (tx, _rx) = watch::channel(Visibility {
            visible,
            reveals: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Only actual changes wake the client.
    pub fn set_visible(&self, visible: bool) {
        self.tx.send_if_modified(|current| {
            if current.visible == visible {
                return false;
            }
            if visible {
                current.reveals += 1;
            }
            current.visible = visible;
            true
        });
    }

    pub fn is_visible(&self) -> bool {
        self.tx.borrow().visible
    }

    pub fn subscribe(&self) -> VisibilityWatch {
        self.tx.subscribe()
    }
}

impl Default for VisibilityHandle {
    fn default() -> Self {
        Self::new(true)
    }
}
