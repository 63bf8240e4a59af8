//! Crate-level scenario tests for the propagation engine.

use crate::arena::edge_arena;
use crate::{batch, computed, effect, signal, untracked, Computed, ReactiveError, Signal};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[test]
fn diamond_propagates_once_per_write() {
    let a = signal(1i64);

    let a_b = a.clone();
    let b = computed(move || a_b.get() * 2);
    let a_c = a.clone();
    let c = computed(move || a_c.get() + 1);
    let (b_d, c_d) = (b.clone(), c.clone());
    let d = computed(move || b_d.get() + c_d.get());

    let runs = counter();
    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let runs_in = runs.clone();
    let seen_in = seen.clone();
    let d_in = d.clone();
    let _e = effect(move || {
        seen_in.lock().push(d_in.get());
        runs_in.fetch_add(1, Ordering::Relaxed);
    });

    assert_eq!(runs.load(Ordering::Relaxed), 1);
    assert_eq!(*seen.lock(), vec![4]);

    cov_mark::check!(effect_scheduled);
    a.set(5).unwrap();

    // Both branches of the diamond changed, but the effect observed the
    // join exactly once, with both branches already settled.
    assert_eq!(runs.load(Ordering::Relaxed), 2);
    assert_eq!(*seen.lock(), vec![4, 16]);
    assert_eq!(d.get(), 16);
}

#[test]
fn dynamic_dependencies_follow_the_branch_taken() {
    let flag = signal(true);
    let x = signal(10);
    let y = signal(20);

    let runs = counter();
    let runs_in = runs.clone();
    let (flag_in, x_in, y_in) = (flag.clone(), x.clone(), y.clone());
    let c = computed(move || {
        runs_in.fetch_add(1, Ordering::Relaxed);
        if flag_in.get() {
            x_in.get()
        } else {
            y_in.get()
        }
    });

    assert_eq!(c.get(), 10);
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    // The untaken branch is not a dependency at all.
    let sources: Vec<_> = edge_arena::source_entries(c.node_id())
        .iter()
        .map(|(source, _)| *source)
        .collect();
    assert!(sources.contains(&flag.node_id()));
    assert!(sources.contains(&x.node_id()));
    assert!(!sources.contains(&y.node_id()));

    y.set(99).unwrap();
    assert_eq!(c.get(), 10);
    assert_eq!(runs.load(Ordering::Relaxed), 1, "a change to y must not re-evaluate");

    flag.set(false).unwrap();
    assert_eq!(c.get(), 99);
    assert_eq!(runs.load(Ordering::Relaxed), 2);

    // The branch flipped, so x dropped out of the dependency set.
    x.set(0).unwrap();
    assert_eq!(c.get(), 99);
    assert_eq!(runs.load(Ordering::Relaxed), 2, "a change to x must no longer re-evaluate");
}

#[test]
fn equality_suppression_stops_downstream_propagation() {
    let s = signal(1);

    let c_runs = counter();
    let c_runs_in = c_runs.clone();
    let s_in = s.clone();
    let c = computed(move || {
        c_runs_in.fetch_add(1, Ordering::Relaxed);
        s_in.get() % 2
    });

    let e_runs = counter();
    let e_runs_in = e_runs.clone();
    let c_in = c.clone();
    let _e = effect(move || {
        c_in.get();
        e_runs_in.fetch_add(1, Ordering::Relaxed);
    });

    assert_eq!(c_runs.load(Ordering::Relaxed), 1);
    assert_eq!(e_runs.load(Ordering::Relaxed), 1);
    let version_before = c.version();

    // 1 -> 3 is a real source change, so the computed must re-evaluate to
    // discover the result is identical; its dependents stay untouched.
    cov_mark::check!(effect_skip_unchanged);
    s.set(3).unwrap();

    assert_eq!(c_runs.load(Ordering::Relaxed), 2);
    assert_eq!(c.get(), 1);
    assert_eq!(c.version(), version_before, "equal result must not advance the version");
    assert_eq!(e_runs.load(Ordering::Relaxed), 1, "effect body must be skipped");
}

#[test]
fn unchanged_intermediate_shields_the_tail_of_a_chain() {
    let a = signal(2i64);

    let a_in = a.clone();
    let parity = computed(move || a_in.get() % 2);

    let tail_runs = counter();
    let tail_runs_in = tail_runs.clone();
    let parity_in = parity.clone();
    let tail = computed(move || {
        tail_runs_in.fetch_add(1, Ordering::Relaxed);
        parity_in.get() * 10
    });

    assert_eq!(tail.get(), 0);
    assert_eq!(tail_runs.load(Ordering::Relaxed), 1);

    a.set(4).unwrap(); // parity unchanged
    cov_mark::check!(refresh_sources_unchanged);
    assert_eq!(tail.get(), 0);
    assert_eq!(
        tail_runs.load(Ordering::Relaxed),
        1,
        "tail must not recompute when the intermediate value is identical"
    );
}

#[test]
fn mutual_reads_are_reported_as_a_cycle() {
    type Slot = Arc<Mutex<Option<Computed<i32>>>>;
    let a_slot: Slot = Arc::new(Mutex::new(None));
    let b_slot: Slot = Arc::new(Mutex::new(None));

    let b_for_a = b_slot.clone();
    let a = computed(move || match b_for_a.lock().clone() {
        Some(b) => b.get() + 1,
        None => 0,
    });
    let a_for_b = a_slot.clone();
    let b = computed(move || match a_for_b.lock().clone() {
        Some(a) => a.get() + 1,
        None => 0,
    });
    *a_slot.lock() = Some(a.clone());
    *b_slot.lock() = Some(b.clone());

    let err = a.try_get().unwrap_err();
    assert!(matches!(err, ReactiveError::Cycle { .. }), "got {err:?}");
}

#[test]
fn auto_dispose_fires_on_losing_the_last_subscriber() {
    let c = Computed::builder(|| 1).auto_dispose(true).build();
    let sub = c.subscribe(|_| {});
    assert!(!c.disposed());
    assert!(edge_arena::has_targets(c.node_id()));

    sub.unsubscribe();
    assert!(c.disposed(), "losing the last subscriber must dispose an auto-dispose node");
    assert!(!edge_arena::has_targets(c.node_id()));
}

#[test]
fn auto_dispose_signal_behaves_the_same() {
    let s = Signal::builder(1).auto_dispose(true).build();
    let sub = s.subscribe(|_| {});
    assert!(!s.disposed());

    sub.unsubscribe();
    assert!(s.disposed());
}

#[test]
fn batch_coalesces_writes_into_one_effect_run() {
    let a = signal(1);
    let b = signal(2);

    let runs = counter();
    let sums: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let runs_in = runs.clone();
    let sums_in = sums.clone();
    let (a_in, b_in) = (a.clone(), b.clone());
    let _e = effect(move || {
        sums_in.lock().push(a_in.get() + b_in.get());
        runs_in.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    batch(|| {
        a.set(10).unwrap();
        b.set(20).unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1, "no effect runs inside the batch");
    });
    assert_eq!(runs.load(Ordering::Relaxed), 2);
    assert_eq!(*sums.lock(), vec![3, 30], "the effect only ever saw settled states");

    batch(|| {
        batch(|| {
            a.set(100).unwrap();
        });
        assert_eq!(
            runs.load(Ordering::Relaxed),
            2,
            "inner batch exit must defer to the outermost"
        );
        b.set(200).unwrap();
    });
    assert_eq!(runs.load(Ordering::Relaxed), 3);
    assert_eq!(sums.lock().last(), Some(&300));
}

#[test]
fn subscribe_delivers_current_then_changed_values() {
    let s = signal(1);
    let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

    let seen_in = seen.clone();
    let sub = s.subscribe(move |v| seen_in.lock().push(v));
    assert_eq!(*seen.lock(), vec![1]);

    s.set(2).unwrap();
    s.set(2).unwrap(); // suppressed
    s.set(3).unwrap();
    assert_eq!(*seen.lock(), vec![1, 2, 3]);

    sub.unsubscribe();
    s.set(4).unwrap();
    assert_eq!(*seen.lock(), vec![1, 2, 3]);
}

#[test]
fn edge_versions_match_sources_after_refresh() {
    let a = signal(1i64);

    let a_b = a.clone();
    let b = computed(move || a_b.get() * 2);
    let (b_d, a_d) = (b.clone(), a.clone());
    let d = computed(move || b_d.get() + a_d.get());

    let check = |node: crate::arena::NodeId| {
        for (source, recorded) in edge_arena::source_entries(node) {
            assert_eq!(
                source.version(),
                recorded,
                "edge version must equal the source version after a successful refresh"
            );
        }
    };

    d.get();
    check(d.node_id());
    check(b.node_id());

    a.set(7).unwrap();
    d.get();
    check(d.node_id());
    check(b.node_id());
}

#[test]
fn errors_flow_through_dependent_reads() {
    let input = signal(0);

    let input_in = input.clone();
    let risky = computed(move || {
        let v = input_in.get();
        if v == 0 {
            panic!("zero is not allowed");
        }
        100 / v
    });

    let risky_in = risky.clone();
    let downstream = computed(move || risky_in.get() + 1);

    let err = downstream.try_get().unwrap_err();
    assert!(matches!(err, ReactiveError::Compute { .. }), "got {err:?}");

    input.set(4).unwrap();
    assert_eq!(downstream.try_get().unwrap(), 26);
}

#[test]
fn dispose_during_subscription_freezes_dependents_view() {
    let s = signal(5);
    let s_in = s.clone();
    let doubled = computed(move || s_in.get() * 2);
    assert_eq!(doubled.get(), 10);

    s.dispose();
    // The frozen value keeps flowing; only writes are rejected.
    assert_eq!(doubled.get(), 10);
    assert!(s.set(6).is_err());
}

#[test]
fn recompute_is_idempotent_with_unchanged_sources() {
    let base = signal(3);
    let base_in = base.clone();
    let c = computed(move || base_in.get() * base_in.get());

    assert_eq!(c.get(), 9);
    c.recompute().unwrap();
    let first = c.get();
    c.recompute().unwrap();
    assert_eq!(c.get(), first);
}

#[test]
fn observer_hooks_see_lifecycle_events() {
    use crate::{register_observer, NodeInfo, Observer};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, u64)>>,
    }

    impl Observer for Recorder {
        fn signal_created(&self, info: &NodeInfo) {
            self.events.lock().push(("signal_created", info.global_id));
        }
        fn signal_updated(&self, info: &NodeInfo, _value: &dyn std::any::Any) {
            self.events.lock().push(("signal_updated", info.global_id));
        }
        fn computed_created(&self, info: &NodeInfo) {
            self.events.lock().push(("computed_created", info.global_id));
        }
        fn computed_updated(&self, info: &NodeInfo, _value: &dyn std::any::Any) {
            self.events.lock().push(("computed_updated", info.global_id));
        }
        fn effect_created(&self, info: &NodeInfo) {
            self.events.lock().push(("effect_created", info.global_id));
        }
        fn effect_called(&self, info: &NodeInfo) {
            self.events.lock().push(("effect_called", info.global_id));
        }
    }

    let recorder = Arc::new(Recorder::default());
    let handle = register_observer(recorder.clone());

    let s = signal(1);
    let s_in = s.clone();
    let c = computed(move || s_in.get() + 1);
    let c_in = c.clone();
    let e = effect(move || {
        c_in.get();
    });
    s.set(2).unwrap();

    let events = recorder.events.lock().clone();
    let has = |name: &str, id: u64| events.iter().any(|(n, i)| *n == name && *i == id);

    assert!(has("signal_created", s.global_id()));
    assert!(has("signal_updated", s.global_id()));
    assert!(has("computed_created", c.global_id()));
    assert!(has("computed_updated", c.global_id()));
    assert!(has("effect_created", e.global_id()));
    assert!(has("effect_called", e.global_id()));

    handle.unregister();
    let mine = |events: &Vec<(&'static str, u64)>| {
        events.iter().filter(|(_, id)| *id == s.global_id()).count()
    };
    let before = mine(&recorder.events.lock());
    s.set(3).unwrap();
    assert_eq!(
        mine(&recorder.events.lock()),
        before,
        "no new events after unregistering"
    );
}

#[test]
fn dropping_the_observer_handle_unregisters() {
    use crate::{register_observer, NodeInfo, Observer};

    #[derive(Default)]
    struct Seen {
        ids: Mutex<Vec<u64>>,
    }

    impl Observer for Seen {
        fn signal_updated(&self, info: &NodeInfo, _value: &dyn std::any::Any) {
            self.ids.lock().push(info.global_id);
        }
    }

    let seen = Arc::new(Seen::default());
    let s = signal(1);
    let updates = |seen: &Seen| {
        seen.ids
            .lock()
            .iter()
            .filter(|id| **id == s.global_id())
            .count()
    };

    {
        let _handle = register_observer(seen.clone());
        s.set(2).unwrap();
        assert_eq!(updates(&seen), 1);
    } // handle dropped here

    s.set(3).unwrap();
    assert_eq!(updates(&seen), 1, "dropping the handle must unregister the observer");
}

#[test]
fn disposed_read_warning_is_logged() {
    use std::io::Write;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    let sink = Capture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(sink.clone())
        .finish();
    // Thread-scoped, so parallel tests neither see nor pollute this sink.
    let _guard = tracing::subscriber::set_default(subscriber);

    let s = signal(7);
    s.dispose();
    assert_eq!(s.get(), 7);

    let logged = String::from_utf8_lossy(&sink.0.lock()).to_string();
    assert!(
        logged.contains("read of a disposed signal"),
        "expected the dispose warning in the captured log, got: {logged}"
    );
}

#[test]
fn untracked_block_reads_without_subscribing() {
    let watched = signal(1);
    let ignored = signal(1);

    let runs = counter();
    let runs_in = runs.clone();
    let (watched_in, ignored_in) = (watched.clone(), ignored.clone());
    let c = computed(move || {
        runs_in.fetch_add(1, Ordering::Relaxed);
        watched_in.get() + untracked(|| ignored_in.get())
    });

    assert_eq!(c.get(), 2);
    ignored.set(100).unwrap();
    assert_eq!(c.get(), 2, "cached value survives untracked-source changes");
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    watched.set(2).unwrap();
    assert_eq!(c.get(), 102, "refresh picks up the untracked source's latest value");
}

proptest! {
    // Random write sequences through a diamond: the observer must never
    // see a torn snapshot, and must run at most once per accepted write.
    #[test]
    fn diamond_observer_never_tears(writes in proptest::collection::vec(0i64..100, 1..20)) {
        let a = signal(0i64);

        let a_b = a.clone();
        let b = computed(move || a_b.get() * 2);
        let a_c = a.clone();
        let c = computed(move || a_c.get() + 1);
        let (b_d, c_d) = (b.clone(), c.clone());
        let d = computed(move || b_d.get() + c_d.get());

        let runs = counter();
        let runs_in = runs.clone();
        let d_in = d.clone();
        let a_check = a.clone();
        let _e = effect(move || {
            let joined = d_in.get();
            let base = untracked(|| a_check.get());
            assert_eq!(joined, base * 3 + 1, "torn snapshot observed");
            runs_in.fetch_add(1, Ordering::Relaxed);
        });

        let mut expected = 1usize;
        for value in writes {
            let accepted = a.peek() != value;
            a.set(value).unwrap();
            if accepted {
                expected += 1;
            }
            prop_assert_eq!(runs.load(Ordering::Relaxed), expected);
        }
    }
}
