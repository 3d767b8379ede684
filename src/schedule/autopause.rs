use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use crate::{
    media::source::Playable,
    schedule::viewport::{ElementId, IntersectionEntry, ViewportObserver},
};

/// Per-element auto-pause bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct VisibilityState {
    /// Last delivered intersection state.
    pub is_intersecting: bool,
    /// Set when this utility paused a playing element; consumed on return to the viewport.
    pub was_playing_before_hidden: bool,
}

struct Tracked {
    element: Rc<dyn Playable>,
    state: VisibilityState,
}

#[derive(Default)]
struct AutoPauseInner {
    observer: RefCell<Option<ViewportObserver>>,
    tracked: RefCell<HashMap<ElementId, Tracked>>,
}

enum Action {
    Pause(Rc<dyn Playable>),
    Play(Rc<dyn Playable>),
}

impl AutoPauseInner {
    fn handle(&self, entries: &[IntersectionEntry]) {
        let mut actions = Vec::new();
        {
            let mut tracked = self.tracked.borrow_mut();
            for e in entries {
                let Some(t) = tracked.get_mut(&e.target) else {
                    continue;
                };
                t.state.is_intersecting = e.is_intersecting;
                if e.is_intersecting {
                    if std::mem::take(&mut t.state.was_playing_before_hidden)
                        && t.element.paused()
                    {
                        actions.push(Action::Play(Rc::clone(&t.element)));
                    }
                } else if !t.element.paused() {
                    t.state.was_playing_before_hidden = true;
                    actions.push(Action::Pause(Rc::clone(&t.element)));
                }
            }
        }
        // Elements may re-enter this utility from play/pause.
        for action in actions {
            match action {
                Action::Pause(el) => el.pause(),
                Action::Play(el) => el.play(),
            }
        }
    }
}

/// Pauses playing elements while they are out of the viewport and resumes them, once, when they
/// return. Elements that were already paused stay paused.
///
/// All tracked elements share one [`ViewportObserver`], created with the first tracked element
/// and disconnected when the last one is untracked.
#[derive(Clone, Default)]
pub struct AutoPause {
    inner: Rc<AutoPauseInner>,
}

impl AutoPause {
    /// An instance tracking nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `element`.
    pub fn track(&self, id: ElementId, element: Rc<dyn Playable>) {
        self.inner.tracked.borrow_mut().insert(
            id,
            Tracked {
                element,
                state: VisibilityState::default(),
            },
        );
        self.shared_observer().observe(id);
    }

    /// Stop tracking `id`. The shared observer is torn down with the last element.
    pub fn untrack(&self, id: ElementId) {
        let now_empty = {
            let mut tracked = self.inner.tracked.borrow_mut();
            tracked.remove(&id);
            tracked.is_empty()
        };
        let observer = self.inner.observer.borrow().clone();
        if let Some(observer) = observer {
            observer.unobserve(id);
            if now_empty {
                observer.disconnect();
                self.inner.observer.borrow_mut().take();
                tracing::debug!("auto-pause observer disconnected");
            }
        }
    }

    /// The shared observer, if any element is tracked.
    pub fn observer(&self) -> Option<ViewportObserver> {
        self.inner.observer.borrow().clone()
    }

    /// Deliver a batch of intersection changes through the shared observer.
    pub fn deliver(&self, entries: &[IntersectionEntry]) {
        if let Some(observer) = self.observer() {
            observer.deliver(entries);
        }
    }

    /// Number of tracked elements.
    pub fn tracked_count(&self) -> usize {
        self.inner.tracked.borrow().len()
    }

    /// Bookkeeping for `id`.
    pub fn state(&self, id: ElementId) -> Option<VisibilityState> {
        self.inner.tracked.borrow().get(&id).map(|t| t.state)
    }

    fn shared_observer(&self) -> ViewportObserver {
        if let Some(observer) = self.inner.observer.borrow().as_ref() {
            return observer.clone();
        }
        let weak: Weak<AutoPauseInner> = Rc::downgrade(&self.inner);
        let observer = ViewportObserver::new(move |entries| {
            if let Some(inner) = weak.upgrade() {
                inner.handle(entries);
            }
        });
        *self.inner.observer.borrow_mut() = Some(observer.clone());
        tracing::debug!("auto-pause observer created");
        observer
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[derive(Default)]
    struct Element {
        paused: Cell<bool>,
        plays: Cell<u32>,
        pauses: Cell<u32>,
    }

    impl Playable for Element {
        fn play(&self) {
            self.plays.set(self.plays.get() + 1);
            self.paused.set(false);
        }
        fn pause(&self) {
            self.pauses.set(self.pauses.get() + 1);
            self.paused.set(true);
        }
        fn paused(&self) -> bool {
            self.paused.get()
        }
    }

    fn entry(id: u64, is_intersecting: bool) -> IntersectionEntry {
        IntersectionEntry {
            target: ElementId(id),
            is_intersecting,
        }
    }

    #[test]
    fn playing_element_resumes_exactly_once() {
        let ap = AutoPause::new();
        let el = Rc::new(Element::default());
        ap.track(ElementId(1), el.clone());

        ap.deliver(&[entry(1, true)]);
        ap.deliver(&[entry(1, false)]);
        assert!(el.paused());
        assert!(ap.state(ElementId(1)).unwrap().was_playing_before_hidden);

        ap.deliver(&[entry(1, true)]);
        ap.deliver(&[entry(1, false), entry(1, true)]);
        assert!(!el.paused());
        assert_eq!(el.plays.get(), 1);
        assert!(!ap.state(ElementId(1)).unwrap().was_playing_before_hidden);
    }

    #[test]
    fn paused_element_stays_paused() {
        let ap = AutoPause::new();
        let el = Rc::new(Element::default());
        el.paused.set(true);
        ap.track(ElementId(1), el.clone());
        ap.deliver(&[entry(1, false)]);
        ap.deliver(&[entry(1, true)]);
        assert!(el.paused());
        assert_eq!(el.plays.get(), 0);
        assert_eq!(el.pauses.get(), 0);
    }

    #[test]
    fn user_play_while_hidden_is_not_doubled() {
        let ap = AutoPause::new();
        let el = Rc::new(Element::default());
        ap.track(ElementId(1), el.clone());
        ap.deliver(&[entry(1, false)]);
        el.play();
        ap.deliver(&[entry(1, true)]);
        assert_eq!(el.plays.get(), 1);
    }

    #[test]
    fn one_observer_shared_and_torn_down_with_last_element() {
        let ap = AutoPause::new();
        assert!(ap.observer().is_none());
        ap.track(ElementId(1), Rc::new(Element::default()));
        let first = ap.observer().unwrap();
        ap.track(ElementId(2), Rc::new(Element::default()));
        assert!(first.ptr_eq(&ap.observer().unwrap()));
        assert_eq!(first.observed_count(), 2);

        ap.untrack(ElementId(1));
        assert!(ap.observer().is_some());
        ap.untrack(ElementId(2));
        assert!(ap.observer().is_none());
        assert!(!first.is_connected());
    }
}
