//! Observer/observable substrate for signal fan-out.
//!
//! Edges are weak in both directions: an [`Observable`] keeps `Weak` handles
//! to its observers and every observer keeps `Weak` handles to the nodes it
//! observes in its [`Subscriptions`]. Neither side ever keeps the other alive.
//! Handles are identified by allocation address, which stays reserved for as
//! long as any `Weak` to it exists.
//!
//! Lists are guarded by a per-object mutex that is never held while calling
//! into an observer, so callbacks may freely register or detach observers on
//! the same node.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

pub(crate) fn addr_of<U: ?Sized>(r: &U) -> usize {
    (r as *const U).cast::<()>() as usize
}

fn weak_addr<U: ?Sized>(w: &Weak<U>) -> usize {
    w.as_ptr().cast::<()>() as usize
}

fn guard<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Something that reacts when an observed node changes.
pub trait Notifiable<T>: Send + Sync {
    /// Called once per `notify()` round of an observed node.
    fn update(&self, source: &T);

    /// Nodes this observer is attached to.
    fn subscriptions(&self) -> &Subscriptions<T>;

    /// The observer as a graph node, if it is one.
    ///
    /// Graph traversals only walk through observers that return `Some`.
    fn as_node(&self) -> Option<&T> {
        None
    }
}

/// A node that can be observed.
pub trait Notifier: Send + Sync + Sized + 'static {
    /// The node's observer list.
    fn observable(&self) -> &Observable<Self>;

    /// Registers `observer` on `this` and records the reverse edge.
    ///
    /// Returns false when the observer was already registered.
    fn add_observer(this: &Arc<Self>, observer: &Arc<dyn Notifiable<Self>>) -> bool {
        let added = this.observable().insert(observer);
        observer.subscriptions().track(this);
        added
    }

    /// Removes `observer` from this node. No-op when it is not registered.
    fn del_observer(&self, observer: &dyn Notifiable<Self>) {
        self.observable().remove(addr_of(observer));
        observer.subscriptions().forget(addr_of(self));
    }

    /// Calls `update(self)` on a snapshot of the live observers, in
    /// registration order.
    fn notify(&self) {
        for observer in self.observable().snapshot() {
            observer.update(self);
        }
    }
}

/// Observer list owned by a node.
pub struct Observable<T> {
    observers: Mutex<Vec<Weak<dyn Notifiable<T>>>>,
}

impl<T: 'static> Observable<T> {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    fn insert(&self, observer: &Arc<dyn Notifiable<T>>) -> bool {
        let key = addr_of(&**observer);
        let mut list = guard(&self.observers);
        if list.iter().any(|w| weak_addr(w) == key) {
            return false;
        }
        list.push(Arc::downgrade(observer));
        true
    }

    fn remove(&self, key: usize) -> bool {
        let mut list = guard(&self.observers);
        let before = list.len();
        list.retain(|w| weak_addr(w) != key);
        list.len() != before
    }

    /// Live observers at the time of the call. Dead handles are pruned.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn Notifiable<T>>> {
        let mut list = guard(&self.observers);
        list.retain(|w| w.strong_count() > 0);
        list.iter().filter_map(Weak::upgrade).collect()
    }

    /// Number of live observers.
    #[must_use]
    pub fn len(&self) -> usize {
        guard(&self.observers)
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// True when no live edge remains.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every forward edge and tells each observer to forget `owner`.
    ///
    /// Called from the owning node's `Drop`.
    pub fn release(&self, owner: &T) {
        let drained = std::mem::take(&mut *guard(&self.observers));
        let key = addr_of(owner);
        for observer in drained.iter().filter_map(Weak::upgrade) {
            observer.subscriptions().forget(key);
        }
    }
}

impl<T: 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = guard(&self.observers).len();
        f.debug_struct("Observable").field("observers", &count).finish()
    }
}

/// Back-references from an observer to the nodes it observes.
pub struct Subscriptions<T> {
    observables: Mutex<Vec<Weak<T>>>,
}

impl<T> Subscriptions<T> {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            observables: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, node: &Arc<T>) {
        let key = addr_of(&**node);
        let mut list = guard(&self.observables);
        if !list.iter().any(|w| weak_addr(w) == key) {
            list.push(Arc::downgrade(node));
        }
    }

    fn forget(&self, key: usize) {
        guard(&self.observables).retain(|w| weak_addr(w) != key);
    }

    /// Live observed nodes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        guard(&self.observables).iter().filter_map(Weak::upgrade).collect()
    }

    /// Number of live observed nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        guard(&self.observables)
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// True when this node observes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Notifier> Subscriptions<T> {
    /// Detaches `observer` from every node it observes.
    ///
    /// Called from the observer's `Drop`, or to take a node out of the graph.
    pub fn release(&self, observer: &dyn Notifiable<T>) {
        let drained = std::mem::take(&mut *guard(&self.observables));
        let key = addr_of(observer);
        for node in drained.iter().filter_map(Weak::upgrade) {
            node.observable().remove(key);
        }
    }
}

impl<T> Default for Subscriptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Subscriptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = guard(&self.observables).len();
        f.debug_struct("Subscriptions").field("observables", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Node {
        name: &'static str,
        observable: Observable<Node>,
        subscriptions: Subscriptions<Node>,
        hits: AtomicUsize,
        detach_on_update: AtomicBool,
        log: Option<Arc<Mutex<Vec<&'static str>>>>,
    }

    impl Node {
        fn build(name: &'static str, log: Option<Arc<Mutex<Vec<&'static str>>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                observable: Observable::new(),
                subscriptions: Subscriptions::new(),
                hits: AtomicUsize::new(0),
                detach_on_update: AtomicBool::new(false),
                log,
            })
        }

        fn new(name: &'static str) -> Arc<Self> {
            Self::build(name, None)
        }

        fn logging(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
            Self::build(name, Some(Arc::clone(log)))
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    impl Notifier for Node {
        fn observable(&self) -> &Observable<Node> {
            &self.observable
        }
    }

    impl Notifiable<Node> for Node {
        fn update(&self, source: &Node) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if let Some(log) = &self.log {
                log.lock().unwrap().push(self.name);
            }
            if self.detach_on_update.load(Ordering::SeqCst) {
                source.del_observer(self);
            }
        }

        fn subscriptions(&self) -> &Subscriptions<Node> {
            &self.subscriptions
        }

        fn as_node(&self) -> Option<&Node> {
            Some(self)
        }
    }

    impl Drop for Node {
        fn drop(&mut self) {
            self.subscriptions.release(&*self);
            self.observable.release(&*self);
        }
    }

    fn as_observer(node: &Arc<Node>) -> Arc<dyn Notifiable<Node>> {
        Arc::clone(node) as Arc<dyn Notifiable<Node>>
    }

    #[test]
    fn duplicate_registration_notifies_once() {
        let source = Node::new("source");
        let observer = Node::new("observer");

        assert!(Node::add_observer(&source, &as_observer(&observer)));
        assert!(!Node::add_observer(&source, &as_observer(&observer)));
        assert_eq!(source.observable().len(), 1);
        assert_eq!(observer.subscriptions().len(), 1);

        source.notify();
        assert_eq!(observer.hits(), 1);
    }

    #[test]
    fn notify_follows_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let source = Node::new("source");
        let first = Node::logging("first", &log);
        let second = Node::logging("second", &log);
        let third = Node::logging("third", &log);

        for n in [&first, &second, &third] {
            Node::add_observer(&source, &as_observer(n));
        }
        source.notify();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn observer_detaching_itself_during_notify() {
        let source = Node::new("source");
        let leaving = Node::new("leaving");
        let staying = Node::new("staying");
        leaving.detach_on_update.store(true, Ordering::SeqCst);

        Node::add_observer(&source, &as_observer(&leaving));
        Node::add_observer(&source, &as_observer(&staying));

        source.notify();
        assert_eq!(leaving.hits(), 1);
        assert_eq!(staying.hits(), 1);
        assert!(leaving.subscriptions().is_empty());

        source.notify();
        assert_eq!(leaving.hits(), 1);
        assert_eq!(staying.hits(), 2);
    }

    #[test]
    fn del_observer_unknown_is_noop() {
        let source = Node::new("source");
        let stranger = Node::new("stranger");
        source.del_observer(&*stranger);
        assert!(source.observable().is_empty());
        assert!(stranger.subscriptions().is_empty());
    }

    #[test]
    fn reentrant_registration_does_not_deadlock() {
        struct Recruiter {
            source: Weak<Node>,
            recruit: Arc<Node>,
            subscriptions: Subscriptions<Node>,
        }

        impl Notifiable<Node> for Recruiter {
            fn update(&self, _source: &Node) {
                if let Some(source) = self.source.upgrade() {
                    Node::add_observer(&source, &as_observer(&self.recruit));
                }
            }

            fn subscriptions(&self) -> &Subscriptions<Node> {
                &self.subscriptions
            }
        }

        let source = Node::new("source");
        let recruit = Node::new("recruit");
        let recruiter: Arc<dyn Notifiable<Node>> = Arc::new(Recruiter {
            source: Arc::downgrade(&source),
            recruit: Arc::clone(&recruit),
            subscriptions: Subscriptions::new(),
        });

        Node::add_observer(&source, &recruiter);
        source.notify();
        assert_eq!(source.observable().len(), 2);

        source.notify();
        assert_eq!(recruit.hits(), 1);
    }

    #[test]
    fn dropping_observer_clears_forward_edge() {
        let source = Node::new("source");
        let observer = Node::new("observer");
        Node::add_observer(&source, &as_observer(&observer));
        assert_eq!(source.observable().len(), 1);

        drop(observer);
        assert!(source.observable().is_empty());
        assert!(source.observable().snapshot().is_empty());
    }

    #[test]
    fn dropping_observable_clears_back_edge() {
        let source = Node::new("source");
        let observer = Node::new("observer");
        Node::add_observer(&source, &as_observer(&observer));
        assert_eq!(observer.subscriptions().len(), 1);

        drop(source);
        assert!(observer.subscriptions().is_empty());
    }

    #[test]
    fn edges_do_not_keep_nodes_alive() {
        let source = Node::new("source");
        let observer = Node::new("observer");
        Node::add_observer(&source, &as_observer(&observer));

        assert_eq!(Arc::strong_count(&source), 1);
        assert_eq!(Arc::strong_count(&observer), 1);
    }
}
