use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use super::state::InputActivity;

/// Source of keyboard and mouse events. The tracker registers it when a session starts and
/// releases it when the session stops, events are pushed into `sink`.
#[cfg_attr(test, mockall::automock)]
pub trait InputListener: Send {
    fn register(&mut self, sink: mpsc::Sender<InputActivity>) -> Result<()>;

    fn unregister(&mut self);
}

/// Listener for environments without a global input hook. No events are produced and idle time
/// simply accumulates.
#[derive(Default)]
pub struct NoInputListener;

impl InputListener for NoInputListener {
    fn register(&mut self, _sink: mpsc::Sender<InputActivity>) -> Result<()> {
        Ok(())
    }

    fn unregister(&mut self) {}
}

/// Listener fed by the embedding application, for example a UI toolkit forwarding its own key
/// and pointer events. Clones share the registration, so the application keeps one clone and
/// hands another to the tracker. Events forwarded while unregistered are dropped.
#[derive(Clone, Default)]
pub struct ForwardingInputListener {
    sink: Arc<Mutex<Option<mpsc::Sender<InputActivity>>>>,
}

impl ForwardingInputListener {
    pub fn forward(&self, activity: InputActivity) -> bool {
        let Ok(sink) = self.sink.lock() else {
            return false;
        };
        match sink.as_ref() {
            Some(sink) => sink.try_send(activity).is_ok(),
            None => false,
        }
    }
}

impl InputListener for ForwardingInputListener {
    fn register(&mut self, sink: mpsc::Sender<InputActivity>) -> Result<()> {
        let mut guard = self
            .sink
            .lock()
            .map_err(|_| anyhow!("Input listener registration is poisoned"))?;
        *guard = Some(sink);
        Ok(())
    }

    fn unregister(&mut self) {
        if let Ok(mut guard) = self.sink.lock() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::{ForwardingInputListener, InputListener};
    use crate::tracker::state::InputActivity;

    #[test]
    fn forwards_only_while_registered() {
        let app_side = ForwardingInputListener::default();
        let mut tracker_side = app_side.clone();
        let (sender, mut receiver) = mpsc::channel(4);

        assert!(!app_side.forward(InputActivity::Key));
        tracker_side.register(sender).unwrap();
        assert!(app_side.forward(InputActivity::MouseMotion));
        tracker_side.unregister();
        assert!(!app_side.forward(InputActivity::Key));

        assert_eq!(receiver.try_recv().ok(), Some(InputActivity::MouseMotion));
        assert!(receiver.try_recv().is_err());
    }
}
