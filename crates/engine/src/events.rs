use std::collections::BTreeMap;
use std::fmt;

use layeredit_core::FeatureId;

/// Notifications a layer publishes to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerEvent {
    EditingStarted,
    FeatureAdded(FeatureId),
    FeatureDeleted(FeatureId),
    AttributeValueChanged { fid: FeatureId, index: usize },
    GeometryChanged(FeatureId),
    AttributeAdded(usize),
    AttributeDeleted(usize),
    AttributeRenamed { index: usize, name: String },
    /// Non-data schema change: expression field, join block or reload.
    FieldsChanged,
    /// Temporary ids mapped to the ids assigned by the store.
    CommittedFeaturesAdded(BTreeMap<FeatureId, FeatureId>),
    AfterCommit { success: bool },
    AfterRollback,
    SelectionChanged,
    RepaintRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&LayerEvent)>;

/// Explicit observer registration for layer events.
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<(ListenerId, Listener)>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&LayerEvent) + 'static) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn emit(&mut self, event: &LayerEvent) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(event);
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn subscribers_receive_until_unsubscribed() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut bus = EventBus::new();
        let sink = Rc::clone(&seen);
        let id = bus.subscribe(move |e| sink.borrow_mut().push(e.clone()));

        bus.emit(&LayerEvent::RepaintRequested);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&LayerEvent::RepaintRequested);

        assert_eq!(*seen.borrow(), vec![LayerEvent::RepaintRequested]);
        assert_eq!(bus.listener_count(), 0);
    }
}
