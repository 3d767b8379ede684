use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt,
    rc::Rc,
};

/// Identifies an observed element.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct ElementId(pub u64);

/// One intersection change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IntersectionEntry {
    /// The element whose intersection changed.
    pub target: ElementId,
    /// Whether any part of the element is inside the viewport.
    pub is_intersecting: bool,
}

/// Receives coalesced batches of intersection changes.
pub type IntersectionCallback = Box<dyn FnMut(&[IntersectionEntry])>;

struct ObserverInner {
    callback: RefCell<Option<IntersectionCallback>>,
    // Last state delivered per target; `None` until the first delivery.
    targets: RefCell<BTreeMap<ElementId, Option<bool>>>,
    connected: Cell<bool>,
    batches: Cell<u64>,
}

/// One observer shared by any number of elements.
///
/// Notifications arrive in batches through [`ViewportObserver::deliver`]. Within a batch the last
/// entry per target wins, entries for unobserved targets are dropped, and a target whose state
/// did not change since its last delivery is filtered out, so a callback sees at most one
/// transition per target per batch.
#[derive(Clone)]
pub struct ViewportObserver {
    inner: Rc<ObserverInner>,
}

impl fmt::Debug for ViewportObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewportObserver")
            .field("connected", &self.is_connected())
            .field("observed", &self.observed_count())
            .finish()
    }
}

impl ViewportObserver {
    /// A connected observer with no targets.
    pub fn new(callback: impl FnMut(&[IntersectionEntry]) + 'static) -> Self {
        Self {
            inner: Rc::new(ObserverInner {
                callback: RefCell::new(Some(Box::new(callback))),
                targets: RefCell::new(BTreeMap::new()),
                connected: Cell::new(true),
                batches: Cell::new(0),
            }),
        }
    }

    /// Start observing `target`. The next entry for it is always delivered.
    pub fn observe(&self, target: ElementId) {
        self.inner.connected.set(true);
        self.inner.targets.borrow_mut().entry(target).or_insert(None);
    }

    /// Stop observing `target`.
    pub fn unobserve(&self, target: ElementId) {
        self.inner.targets.borrow_mut().remove(&target);
    }

    /// Stop observing every target.
    pub fn disconnect(&self) {
        self.inner.targets.borrow_mut().clear();
        self.inner.connected.set(false);
    }

    /// Whether the observer is connected.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.get()
    }

    /// Number of observed targets.
    pub fn observed_count(&self) -> usize {
        self.inner.targets.borrow().len()
    }

    /// Whether `target` is observed.
    pub fn is_observing(&self, target: ElementId) -> bool {
        self.inner.targets.borrow().contains_key(&target)
    }

    /// Batches that reached the callback.
    pub fn batches_delivered(&self) -> u64 {
        self.inner.batches.get()
    }

    /// Whether both handles refer to the same observer.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Deliver one batch of raw entries. Returns the coalesced entries passed to the callback.
    pub fn deliver(&self, entries: &[IntersectionEntry]) -> Vec<IntersectionEntry> {
        if !self.inner.connected.get() {
            return Vec::new();
        }

        let mut order: Vec<ElementId> = Vec::new();
        let mut last: BTreeMap<ElementId, bool> = BTreeMap::new();
        for e in entries {
            if last.insert(e.target, e.is_intersecting).is_none() {
                order.push(e.target);
            }
        }

        let coalesced: Vec<IntersectionEntry> = {
            let mut targets = self.inner.targets.borrow_mut();
            order
                .into_iter()
                .filter_map(|target| {
                    let is_intersecting = last[&target];
                    let known = targets.get_mut(&target)?;
                    if *known == Some(is_intersecting) {
                        return None;
                    }
                    *known = Some(is_intersecting);
                    Some(IntersectionEntry {
                        target,
                        is_intersecting,
                    })
                })
                .collect()
        };
        if coalesced.is_empty() {
            return coalesced;
        }

        // The callback may observe, unobserve or disconnect re-entrantly.
        let callback = self.inner.callback.borrow_mut().take();
        if let Some(mut callback) = callback {
            self.inner.batches.set(self.inner.batches.get() + 1);
            callback(&coalesced);
            let mut slot = self.inner.callback.borrow_mut();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
        coalesced
    }

    /// Compute positive-area overlap of each element with `viewport` and deliver the result as
    /// one batch.
    pub fn observe_layout(
        &self,
        viewport: kurbo::Rect,
        layout: &[(ElementId, kurbo::Rect)],
    ) -> Vec<IntersectionEntry> {
        let entries: Vec<IntersectionEntry> = layout
            .iter()
            .map(|(target, rect)| IntersectionEntry {
                target: *target,
                is_intersecting: viewport.intersect(*rect).area() > 0.0,
            })
            .collect();
        self.deliver(&entries)
    }
}
