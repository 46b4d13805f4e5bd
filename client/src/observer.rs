use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Token returned when registering a handler, used to unsubscribe it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Synchronous handler list for one kind of event.
///
/// Handlers are cloned out of the list before being invoked, so a handler
/// may subscribe, unsubscribe or trigger further events on the same topic.
pub(crate) struct Registry<E> {
    handlers: RefCell<Vec<(SubscriptionId, Rc<dyn Fn(&E)>)>>,
}

impl<E> Registry<E> {
    pub(crate) fn new() -> Self {
        Self {
            handlers: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self, id: SubscriptionId, handler: Rc<dyn Fn(&E)>) {
        self.handlers.borrow_mut().push((id, handler));
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.borrow_mut();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub(crate) fn emit(&self, event: &E) {
        let handlers: Vec<Rc<dyn Fn(&E)>> = self
            .handlers
            .borrow()
            .iter()
            .map(|(_, handler)| Rc::clone(handler))
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.handlers.borrow().len()
    }
}

/// Hands out subscription ids unique within one topic
pub(crate) struct IdSource {
    next: Cell<u64>,
}

impl IdSource {
    pub(crate) fn new() -> Self {
        Self { next: Cell::new(1) }
    }

    pub(crate) fn next(&self) -> SubscriptionId {
        let id = self.next.get();
        self.next.set(id + 1);
        SubscriptionId(id)
    }
}
