// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use proptest::prelude::*;
use weft_observable::{Cleanup, Observable, Observer, ReplaySubject, Sink};

#[derive(Debug, Clone, Copy)]
enum Step {
    Next(u8),
    Error,
    Complete,
    Unsubscribe,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => any::<u8>().prop_map(Step::Next),
        1 => Just(Step::Error),
        1 => Just(Step::Complete),
        1 => Just(Step::Unsubscribe),
    ]
}

#[derive(Debug, Default)]
struct Seen {
    values: Vec<u8>,
    errors: usize,
    completions: usize,
}

type Slot = Rc<RefCell<Option<Sink<u8, &'static str>>>>;

/// Observable whose sink is handed to the test, counting cleanup runs.
fn manual() -> (Observable<u8, &'static str>, Slot, Rc<Cell<usize>>) {
    let slot: Slot = Rc::new(RefCell::new(None));
    let cleanups = Rc::new(Cell::new(0));
    let producer_slot = Rc::clone(&slot);
    let producer_cleanups = Rc::clone(&cleanups);
    let observable = Observable::create(move |sink| {
        *producer_slot.borrow_mut() = Some(sink);
        let cleanups = Rc::clone(&producer_cleanups);
        Cleanup::from_fn(move || cleanups.set(cleanups.get() + 1))
    });
    (observable, slot, cleanups)
}

fn recording_observer(seen: &Rc<RefCell<Seen>>) -> Observer<u8, &'static str> {
    let next = Rc::clone(seen);
    let error = Rc::clone(seen);
    let complete = Rc::clone(seen);
    Observer::new()
        .on_next(move |value| next.borrow_mut().values.push(value))
        .on_error(move |_| error.borrow_mut().errors += 1)
        .on_complete(move || complete.borrow_mut().completions += 1)
}

proptest! {
    #[test]
    fn delivery_stops_at_the_first_ending(steps in prop::collection::vec(step(), 0..24)) {
        let (observable, slot, cleanups) = manual();
        let seen = Rc::new(RefCell::new(Seen::default()));
        let subscription = observable.subscribe(recording_observer(&seen));
        let sink = slot.borrow().clone().unwrap();

        let mut expected = Vec::new();
        let mut ended = false;
        for step in &steps {
            match *step {
                Step::Next(value) => {
                    if !ended {
                        expected.push(value);
                    }
                    sink.next(value);
                }
                Step::Error => {
                    ended = true;
                    sink.error("boom");
                }
                Step::Complete => {
                    ended = true;
                    sink.complete();
                }
                Step::Unsubscribe => {
                    ended = true;
                    subscription.unsubscribe();
                }
            }
        }

        let seen = seen.borrow();
        prop_assert_eq!(&seen.values, &expected);
        prop_assert!(seen.errors + seen.completions <= 1);
        prop_assert_eq!(cleanups.get(), usize::from(ended));
        prop_assert_eq!(subscription.closed(), ended);
        prop_assert_eq!(sink.closed(), ended);
    }

    #[test]
    fn replay_subject_late_subscribers_see_the_whole_history(
        values in prop::collection::vec(any::<u8>(), 0..16),
        split in 0usize..16,
    ) {
        let subject = ReplaySubject::<u8, &'static str>::new();
        let split = split.min(values.len());
        let early = Rc::new(RefCell::new(Seen::default()));
        let _early = subject.observable().subscribe(recording_observer(&early));
        for value in &values[..split] {
            subject.next(*value);
        }
        let late = Rc::new(RefCell::new(Seen::default()));
        let _late = subject.observable().subscribe(recording_observer(&late));
        for value in &values[split..] {
            subject.next(*value);
        }
        subject.complete();

        prop_assert_eq!(&early.borrow().values, &values);
        prop_assert_eq!(&late.borrow().values, &values);
        prop_assert_eq!(late.borrow().completions, 1);
    }
}

#[test]
fn each_subscription_runs_its_own_producer() {
    let runs = Rc::new(Cell::new(0));
    let counter = Rc::clone(&runs);
    let observable = Observable::<u8, &'static str>::create(move |sink| {
        counter.set(counter.get() + 1);
        sink.next(counter.get().try_into().unwrap_or(u8::MAX));
        sink.complete();
        Cleanup::None
    });
    let first = Rc::new(RefCell::new(Seen::default()));
    let second = Rc::new(RefCell::new(Seen::default()));
    let _a = observable.subscribe(recording_observer(&first));
    let _b = observable.subscribe(recording_observer(&second));
    assert_eq!(runs.get(), 2);
    assert_eq!(first.borrow().values, vec![1]);
    assert_eq!(second.borrow().values, vec![2]);
}

#[test]
fn unsubscribing_from_a_callback_stops_later_values() {
    let (observable, slot, cleanups) = manual();
    let seen = Rc::new(RefCell::new(Seen::default()));
    let handle: Rc<RefCell<Option<weft_observable::Subscription>>> = Rc::new(RefCell::new(None));
    let on_next_handle = Rc::clone(&handle);
    let on_next_seen = Rc::clone(&seen);
    let subscription = observable.subscribe(Observer::new().on_next(move |value| {
        on_next_seen.borrow_mut().values.push(value);
        if value == 2 {
            if let Some(subscription) = on_next_handle.borrow().as_ref() {
                subscription.unsubscribe();
            }
        }
    }));
    *handle.borrow_mut() = Some(subscription.clone());

    let sink = slot.borrow().clone().unwrap();
    for value in 1..=4 {
        sink.next(value);
    }
    assert_eq!(seen.borrow().values, vec![1, 2]);
    assert_eq!(cleanups.get(), 1);
    assert!(subscription.closed());
}

#[test]
fn values_pushed_from_a_callback_are_delivered_in_order() {
    let (observable, slot, _cleanups) = manual();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let on_next_seen = Rc::clone(&seen);
    let on_next_slot = Rc::clone(&slot);
    let _subscription = observable.subscribe(Observer::new().on_next(move |value| {
        on_next_seen.borrow_mut().push(value);
        if value == 1 {
            let sink = on_next_slot.borrow().clone().unwrap();
            sink.next(2);
            sink.next(3);
        }
    }));

    let sink = slot.borrow().clone().unwrap();
    sink.next(1);
    sink.next(4);
    assert_eq!(*seen.borrow(), vec![1, 2, 3, 4]);
}

#[test]
fn queued_values_are_discarded_when_the_callback_ends_the_stream() {
    let (observable, slot, cleanups) = manual();
    let seen = Rc::new(RefCell::new(Seen::default()));
    let on_next_seen = Rc::clone(&seen);
    let on_complete_seen = Rc::clone(&seen);
    let on_next_slot = Rc::clone(&slot);
    let _subscription = observable.subscribe(
        Observer::new()
            .on_next(move |value| {
                on_next_seen.borrow_mut().values.push(value);
                let sink = on_next_slot.borrow().clone().unwrap();
                sink.next(value + 1);
                sink.complete();
            })
            .on_complete(move || on_complete_seen.borrow_mut().completions += 1),
    );

    slot.borrow().clone().unwrap().next(1);
    assert_eq!(seen.borrow().values, vec![1]);
    assert_eq!(seen.borrow().completions, 1);
    assert_eq!(cleanups.get(), 1);
}
