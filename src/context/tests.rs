use super::*;
use crate::context;
use futures_executor::block_on;

#[derive(Clone, Debug, PartialEq)]
struct ValueA(u64);
#[derive(Clone, Debug, PartialEq)]
struct ValueB(u64);

#[test]
fn binding_sets_are_shared_between_clones() {
    let cx = AsyncContext::new();
    let alias = cx.clone();

    let _ = cx.set(ValueA(1));

    // Mutations made through one handle are visible through every alias.
    assert_eq!(alias.get::<ValueA>(), Some(ValueA(1)));
    assert!(cx.same_set(&alias));

    // A fresh set is not aliased.
    assert!(!cx.same_set(&AsyncContext::new()));
}

#[test]
fn set_returns_undo_capability() {
    let cx = AsyncContext::new();

    let first = cx.set(ValueA(1));
    let second = cx.set(ValueA(2));
    assert_eq!(cx.get::<ValueA>(), Some(ValueA(2)));

    // Undoing the most recent write restores the previous value.
    second.undo();
    assert_eq!(cx.get::<ValueA>(), Some(ValueA(1)));

    // Undoing the first write removes the binding entirely.
    first.undo();
    assert_eq!(cx.get::<ValueA>(), None);
}

#[test]
fn stale_undo_is_a_no_op() {
    let cx = AsyncContext::new();

    let first = cx.set(ValueA(1));
    let _second = cx.set(ValueA(2));

    // `first` no longer matches the installed value, so undoing it must not
    // clobber the newer write.
    first.undo();
    assert_eq!(cx.get::<ValueA>(), Some(ValueA(2)));
}

#[test]
fn nested_binding_sets() {
    let outer = AsyncContext::new();
    let _ = outer.set(ValueA(1));
    let _outer_guard = outer.attach();

    assert_eq!(AsyncContext::current().get::<ValueA>(), Some(ValueA(1)));
    assert_eq!(AsyncContext::current().get::<ValueB>(), None);

    {
        let inner = AsyncContext::new();
        let _ = inner.set(ValueB(42));
        let _inner_guard = inner.attach();

        // The inner flow observes only its own set.
        assert_eq!(AsyncContext::current().get::<ValueA>(), None);
        assert_eq!(AsyncContext::current().get::<ValueB>(), Some(ValueB(42)));

        assert!(AsyncContext::map_current(|cx| {
            assert_eq!(cx.get::<ValueB>(), Some(ValueB(42)));
            true
        }));
    }

    // Resets to the outer set when the inner guard is dropped.
    assert_eq!(AsyncContext::current().get::<ValueA>(), Some(ValueA(1)));
    assert_eq!(AsyncContext::current().get::<ValueB>(), None);
}

#[test]
fn overlapping_guards() {
    let outer = AsyncContext::new();
    let _ = outer.set(ValueA(1));
    let outer_guard = outer.attach();

    let inner = AsyncContext::new();
    let _ = inner.set(ValueB(42));
    let inner_guard = inner.attach();

    assert_eq!(AsyncContext::current().get::<ValueB>(), Some(ValueB(42)));

    // Dropping the outer guard first must not detach the inner set.
    drop(outer_guard);
    assert_eq!(AsyncContext::current().get::<ValueB>(), Some(ValueB(42)));

    drop(inner_guard);
    assert_eq!(AsyncContext::current().get::<ValueA>(), None);
    assert_eq!(AsyncContext::current().get::<ValueB>(), None);
}

#[test]
fn run_uses_a_fresh_empty_set() {
    let outer = AsyncContext::new();
    let _ = outer.set(ValueA(7));
    let _guard = outer.attach();

    context::run(|| {
        // Fresh set: the outer binding is not visible.
        assert_eq!(AsyncContext::current().get::<ValueA>(), None);
        let _ = AsyncContext::current().set(ValueB(1));
        assert_eq!(AsyncContext::current().get::<ValueB>(), Some(ValueB(1)));
    });

    // Mutations made inside run() are not visible after it returns.
    assert_eq!(AsyncContext::current().get::<ValueB>(), None);
    assert_eq!(AsyncContext::current().get::<ValueA>(), Some(ValueA(7)));
}

#[test]
fn sibling_runs_are_isolated() {
    let value = context::run_and_return(|| {
        let _ = AsyncContext::current().set(ValueA(1));
        AsyncContext::current().get::<ValueA>()
    });
    assert_eq!(value, Some(ValueA(1)));

    let sibling = context::run_and_return(|| AsyncContext::current().get::<ValueA>());
    assert_eq!(sibling, None);
}

#[test]
fn run_in_context_restores_captured_set() {
    let captured = context::run_and_return(|| {
        let _ = AsyncContext::current().set(ValueA(9));
        AsyncContext::current()
    });

    // The flow that created the set is gone; the handle still works.
    let seen = context::run_in_context(&captured, || AsyncContext::current().get::<ValueA>());
    assert_eq!(seen, Some(ValueA(9)));
    assert_eq!(AsyncContext::current().get::<ValueA>(), None);
}

#[test]
fn bound_callback_restores_wrap_time_set() {
    let callback = context::run_and_return(|| {
        let _ = AsyncContext::current().set(ValueA(3));
        context::bind(|| AsyncContext::current().get::<ValueA>())
    });

    // Fired outside any flow, the callback still sees the wrap-time set.
    assert_eq!(callback(), Some(ValueA(3)));
    assert_eq!(AsyncContext::current().get::<ValueA>(), None);
}

#[test]
fn bound_callback_fires_from_other_thread() {
    let cx = AsyncContext::new();
    let _ = cx.set(ValueA(5));
    let _guard = cx.attach();

    let callback = context::bind(|| AsyncContext::current().get::<ValueA>());
    let seen = std::thread::spawn(callback).join().unwrap();
    assert_eq!(seen, Some(ValueA(5)));
}

#[test]
fn with_context_future_restores_set_at_poll_time() {
    let cx = AsyncContext::new();
    let _ = cx.set(ValueA(42));

    let fut = async {
        assert_eq!(AsyncContext::current().get::<ValueA>(), Some(ValueA(42)));
        AsyncContext::current().get::<ValueA>()
    }
    .with_context(cx);

    // Nothing is attached on this thread while the future is not running.
    assert_eq!(AsyncContext::current().get::<ValueA>(), None);
    assert_eq!(block_on(fut), Some(ValueA(42)));
    assert_eq!(AsyncContext::current().get::<ValueA>(), None);
}

#[test]
fn with_context_stream_restores_set_per_item() {
    use futures_util::stream::{self, StreamExt};

    let cx = AsyncContext::new();
    let _ = cx.set(ValueA(8));

    let observed: Vec<Option<ValueA>> = block_on(
        stream::iter(0..3)
            .map(|_| AsyncContext::current().get::<ValueA>())
            .with_context(cx)
            .collect(),
    );
    assert_eq!(observed, vec![Some(ValueA(8)); 3]);
}

#[test]
fn test_pop_id_out_of_order() {
    let mut stack = ContextStack::default();

    let cx1 = AsyncContext::new();
    let _ = cx1.set(ValueA(1));
    let cx2 = AsyncContext::new();
    let _ = cx2.set(ValueA(2));
    let cx3 = AsyncContext::new();
    let _ = cx3.set(ValueA(3));

    let id1 = stack.push(cx1);
    let id2 = stack.push(cx2);
    let id3 = stack.push(cx3);

    // Pop middle context first - should not affect the active set.
    stack.pop_id(id2);
    assert_eq!(stack.current_cx.get::<ValueA>(), Some(ValueA(3)));
    assert_eq!(stack.stack.len(), 3); // Length unchanged for middle pops

    // Pop last context - should restore previous valid set.
    stack.pop_id(id3);
    assert_eq!(stack.current_cx.get::<ValueA>(), Some(ValueA(1)));
    assert_eq!(stack.stack.len(), 1);

    // Pop first context - should restore to empty state.
    stack.pop_id(id1);
    assert_eq!(stack.current_cx.get::<ValueA>(), None);
    assert_eq!(stack.stack.len(), 0);
}

/// Edge cases in stack operations should log warnings, and definitely not
/// panic.
#[test]
fn test_pop_id_edge_cases() {
    let mut stack = ContextStack::default();

    stack.pop_id(ContextStack::BASE_POS);
    assert_eq!(stack.stack.len(), 0);

    stack.pop_id(ContextStack::MAX_POS);
    assert_eq!(stack.stack.len(), 0);

    stack.pop_id(1000);
    assert_eq!(stack.stack.len(), 0);

    stack.pop_id(1);
    assert_eq!(stack.stack.len(), 0);
}

#[test]
fn test_push_overflow() {
    let mut stack = ContextStack::default();
    let max_pos = ContextStack::MAX_POS as usize;

    for i in 0..max_pos {
        let cx = AsyncContext::new();
        let _ = cx.set(ValueA(i as u64));
        let id = stack.push(cx);
        assert_eq!(id, (i + 1) as u16);
    }

    // Try to push beyond capacity.
    let cx = AsyncContext::new();
    let _ = cx.set(ValueA(max_pos as u64));
    let id = stack.push(cx);
    assert_eq!(id, ContextStack::MAX_POS);

    // The active set remains unchanged after overflow.
    assert_eq!(
        stack.current_cx.get::<ValueA>(),
        Some(ValueA((max_pos - 2) as u64))
    );
}
