//! Execution-scoped binding propagation.
//!
//! The `context` module makes a small set of ambient values (the current
//! span, the current entry span, and a few related bindings) available to
//! any code running "within" one logical flow of control, without threading
//! them through every function signature. Per-library adapters read and
//! write these bindings through an [`AsyncContext`] handle.
//!
//! # Main types
//!
//! - [`AsyncContext`]: a shared, mutable binding set for one logical flow.
//! - [`ContextGuard`]: scoped attachment; dropping it restores the previous
//!   binding set.
//! - [`BindingUndo`]: a capability returned by [`AsyncContext::set`] that
//!   undoes the write, used by span cleanup hooks.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasherDefault, Hasher};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use crate::agent_warn;

#[cfg(test)]
mod tests;

mod future_ext;

pub use future_ext::{FutureContextExt, SinkContextExt, StreamContextExt, WithContext};

thread_local! {
    static CURRENT_CONTEXT: RefCell<ContextStack> = RefCell::new(ContextStack::default());
}

type BindingMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>, BuildHasherDefault<IdHasher>>;

/// The binding set for one logical flow of control.
///
/// An `AsyncContext` carries execution-scoped values across API boundaries
/// between logically associated execution units. Unlike a plain scoped
/// variable, the set is *shared*: cloning the handle aliases the same
/// underlying bindings, so a cleanup hook registered when a span starts can
/// undo the binding later, from whichever continuation completes the span.
///
/// Binding sets are isolated between concurrently in-flight flows. Code
/// observes exactly one set at a time, chosen by which asynchronous path led
/// to it: the thread-local stack managed through [`attach`], or an explicit
/// handle captured earlier via [`AsyncContext::current`] and restored with
/// [`run_in_context`] / [`FutureContextExt::with_context`].
///
/// [`attach`]: AsyncContext::attach()
///
/// # Examples
///
/// ```
/// use tracecore::context::AsyncContext;
///
/// // Application-specific binding values
/// #[derive(Clone, Debug, PartialEq)]
/// struct ValueA(&'static str);
/// #[derive(Clone, Debug, PartialEq)]
/// struct ValueB(u64);
///
/// let outer = AsyncContext::new();
/// let _ = outer.set(ValueA("a"));
/// let _outer_guard = outer.attach();
///
/// // Only value a has been set
/// assert_eq!(AsyncContext::current().get::<ValueA>(), Some(ValueA("a")));
/// assert_eq!(AsyncContext::current().get::<ValueB>(), None);
///
/// {
///     let inner = AsyncContext::new();
///     let _ = inner.set(ValueB(42));
///     let _inner_guard = inner.attach();
///     // The inner flow sees only its own bindings
///     assert_eq!(AsyncContext::current().get::<ValueA>(), None);
///     assert_eq!(AsyncContext::current().get::<ValueB>(), Some(ValueB(42)));
/// }
///
/// // Resets to the outer set when the inner guard is dropped
/// assert_eq!(AsyncContext::current().get::<ValueA>(), Some(ValueA("a")));
/// assert_eq!(AsyncContext::current().get::<ValueB>(), None);
/// ```
#[derive(Clone, Default)]
pub struct AsyncContext {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    bindings: Mutex<BindingMap>,
}

impl AsyncContext {
    /// Creates a new, empty binding set.
    pub fn new() -> Self {
        AsyncContext::default()
    }

    /// Returns a handle to the binding set active on the current thread.
    ///
    /// This is the capture primitive: the returned handle aliases the live
    /// set, so it can be stored and re-attached later when a third-party
    /// operation loses the implicit propagation.
    pub fn current() -> Self {
        Self::map_current(|cx| cx.clone())
    }

    /// Applies a function to the active binding set, returning its value.
    ///
    /// Cheaper than `AsyncContext::current()` when the handle itself is not
    /// needed, e.g. for a single lookup.
    pub fn map_current<T>(f: impl FnOnce(&AsyncContext) -> T) -> T {
        CURRENT_CONTEXT.with(|cx| cx.borrow().map_current_cx(f))
    }

    /// Reads a binding by value type.
    ///
    /// Returns `None` if no binding of this type has been set in this set.
    /// Bindings are small, cheaply clonable values (typically `Arc`-backed
    /// handles), hence the `Clone` bound.
    pub fn get<T: Clone + 'static>(&self) -> Option<T> {
        let bindings = self
            .inner
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        bindings.get(&TypeId::of::<T>())?.downcast_ref::<T>().cloned()
    }

    /// Writes a binding, returning a capability that undoes the write.
    ///
    /// The returned [`BindingUndo`] restores whatever value the binding held
    /// before this call, but only if the binding still holds the value set
    /// here. If another writer replaced it in the meantime, the undo is a
    /// no-op, so out-of-order cleanup cannot clobber newer state.
    pub fn set<T: Send + Sync + 'static>(&self, value: T) -> BindingUndo {
        let installed: Arc<dyn Any + Send + Sync> = Arc::new(value);
        let mut bindings = self
            .inner
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = bindings.insert(TypeId::of::<T>(), installed.clone());
        BindingUndo {
            set: self.inner.clone(),
            type_id: TypeId::of::<T>(),
            installed,
            previous,
        }
    }

    /// Makes this binding set the active one on the current thread.
    ///
    /// Dropping the returned [`ContextGuard`] restores the previously active
    /// set. Entering and exiting is always paired this way; there is no raw
    /// unpaired variant, which removes the class of leaks where an entered
    /// set is never exited.
    ///
    /// # Examples
    ///
    /// ```
    /// use tracecore::context::AsyncContext;
    ///
    /// #[derive(Clone, Debug, PartialEq)]
    /// struct ValueA(&'static str);
    ///
    /// let my_cx = AsyncContext::new();
    /// let _ = my_cx.set(ValueA("a"));
    ///
    /// {
    ///     let _guard = my_cx.clone().attach();
    ///     assert_eq!(AsyncContext::current().get::<ValueA>(), Some(ValueA("a")));
    ///     // exiting the scope drops the guard, detaching the set
    /// }
    ///
    /// assert_eq!(AsyncContext::current().get::<ValueA>(), None);
    /// ```
    pub fn attach(self) -> ContextGuard {
        let cx_pos = CURRENT_CONTEXT.with(|cx| cx.borrow_mut().push(self));

        ContextGuard {
            cx_pos,
            _marker: PhantomData,
        }
    }

    /// Returns `true` if both handles alias the same binding set.
    pub fn same_set(&self, other: &AsyncContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .inner
            .bindings
            .lock()
            .map(|b| b.len())
            .unwrap_or_default();
        f.debug_struct("AsyncContext")
            .field("bindings", &entries)
            .finish()
    }
}

/// Executes `f` with a new, empty binding set active; the set is detached
/// when `f` returns. The return value of `f` is discarded; use
/// [`run_and_return`] when it matters.
pub fn run(f: impl FnOnce()) {
    run_and_return(f)
}

/// Executes `f` with a new, empty binding set active and returns its value.
/// The set is detached on every exit path.
pub fn run_and_return<T>(f: impl FnOnce() -> T) -> T {
    let _guard = AsyncContext::new().attach();
    f()
}

/// Executes `f` with a previously captured binding set active, detaching it
/// on every exit path.
///
/// For deferred computations, use [`FutureContextExt::with_context`]
/// instead: it re-attaches the set at every poll, which a plain guard held
/// across an `.await` cannot do.
pub fn run_in_context<T>(cx: &AsyncContext, f: impl FnOnce() -> T) -> T {
    let _guard = cx.clone().attach();
    f()
}

/// Wraps a callback so that the binding set active *now* is re-attached
/// whenever the callback fires later, regardless of what is active at fire
/// time.
pub fn bind<T>(f: impl FnOnce() -> T) -> impl FnOnce() -> T {
    let cx = AsyncContext::current();
    move || run_in_context(&cx, f)
}

/// Like [`bind`], for callbacks that fire more than once (event listeners).
pub fn bind_mut<T>(mut f: impl FnMut() -> T) -> impl FnMut() -> T {
    let cx = AsyncContext::current();
    move || {
        let _guard = cx.clone().attach();
        f()
    }
}

/// Undoes a single binding write. See [`AsyncContext::set`].
#[must_use = "dropping a BindingUndo without calling undo() leaves the binding in place"]
pub struct BindingUndo {
    set: Arc<ContextInner>,
    type_id: TypeId,
    installed: Arc<dyn Any + Send + Sync>,
    previous: Option<Arc<dyn Any + Send + Sync>>,
}

impl BindingUndo {
    /// Restores the value the binding held before the corresponding `set`.
    ///
    /// No-op if the binding has been overwritten since.
    pub fn undo(self) {
        let mut bindings = self
            .set
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match bindings.get(&self.type_id) {
            Some(current) if Arc::ptr_eq(current, &self.installed) => match self.previous {
                Some(previous) => {
                    bindings.insert(self.type_id, previous);
                }
                None => {
                    bindings.remove(&self.type_id);
                }
            },
            _ => {}
        }
    }
}

impl fmt::Debug for BindingUndo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingUndo")
            .field("type_id", &self.type_id)
            .finish()
    }
}

/// A guard that restores the previously active binding set when dropped.
#[derive(Debug)]
pub struct ContextGuard {
    // The position of the binding set in the stack, used to pop it.
    cx_pos: u16,
    // Ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let id = self.cx_pos;
        if id > ContextStack::BASE_POS && id < ContextStack::MAX_POS {
            CURRENT_CONTEXT.with(|context_stack| context_stack.borrow_mut().pop_id(id));
        }
    }
}

/// With TypeIds as keys, there's no need to hash them. They are already
/// hashes themselves, coming from the compiler. The IdHasher holds the u64
/// of the TypeId, and then returns it, instead of doing any bit fiddling.
#[derive(Clone, Default, Debug)]
struct IdHasher(u64);

impl Hasher for IdHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("TypeId calls write_u64");
    }

    #[inline]
    fn write_u64(&mut self, id: u64) {
        self.0 = id;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }
}

/// A stack for keeping track of the [`AsyncContext`] handles that have been
/// attached to a thread.
///
/// The stack allows for popping of binding sets by position, which is used
/// to do out of order dropping of [`ContextGuard`] instances. Only when the
/// top of the stack is popped, the topmost set is actually restored.
///
/// The stack relies on the fact that it is thread local and that the
/// [`ContextGuard`] instances constructed using ids from it can't be moved
/// to other threads. That means that the ids are always valid and always
/// within the bounds of the stack.
struct ContextStack {
    /// The binding set that is active on this thread, and the top of the
    /// stack. Always present; if `stack` is empty it's an empty set.
    current_cx: AsyncContext,
    /// The other binding sets attached to the thread.
    stack: Vec<Option<AsyncContext>>,
    /// Ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl ContextStack {
    const BASE_POS: u16 = 0;
    const MAX_POS: u16 = u16::MAX;
    const INITIAL_CAPACITY: usize = 8;

    #[inline(always)]
    fn push(&mut self, cx: AsyncContext) -> u16 {
        // The next id is the length of the `stack`, plus one since the top
        // of the stack is `current_cx`.
        let next_id = self.stack.len() + 1;
        if next_id < ContextStack::MAX_POS.into() {
            let current_cx = std::mem::replace(&mut self.current_cx, cx);
            self.stack.push(Some(current_cx));
            next_id as u16
        } else {
            // This is an overflow, log it and ignore it.
            agent_warn!(
                name: "context_attach_failed",
                message = format!("Too many binding sets. Max limit is {}. \
                  The active binding set remains unchanged as this attach failed. \
                  Dropping the returned ContextGuard will have no effect.",
                  ContextStack::MAX_POS)
            );
            ContextStack::MAX_POS
        }
    }

    #[inline(always)]
    fn pop_id(&mut self, pos: u16) {
        if pos == ContextStack::BASE_POS || pos == ContextStack::MAX_POS {
            // The empty binding set at the bottom of the stack cannot be
            // popped, and the overflow position is invalid, so do nothing.
            agent_warn!(
                name: "context_out_of_order_drop",
                position = pos,
                message = if pos == ContextStack::BASE_POS {
                    "Attempted to pop the base binding set which is not allowed"
                } else {
                    "Attempted to pop the overflow position which is not allowed"
                }
            );
            return;
        }
        let len: u16 = self.stack.len() as u16;
        // Are we at the top of the stack?
        if pos == len {
            // Shrink the stack if possible to clear out any out of order
            // pops.
            while let Some(None) = self.stack.last() {
                _ = self.stack.pop();
            }
            // Restore the previous binding set. This will always happen
            // since the empty set is always at the bottom of the stack if
            // the stack is not empty.
            if let Some(Some(next_cx)) = self.stack.pop() {
                self.current_cx = next_cx;
            }
        } else {
            // This is an out of order pop.
            if pos >= len {
                // This is an invalid id, ignore it.
                agent_warn!(
                    name: "context_pop_out_of_bounds",
                    position = pos,
                    stack_length = len,
                    message = "Attempted to pop beyond the end of the context stack"
                );
                return;
            }
            // Clear out the entry at the given id.
            _ = self.stack[pos as usize].take();
        }
    }

    #[inline(always)]
    fn map_current_cx<T>(&self, f: impl FnOnce(&AsyncContext) -> T) -> T {
        f(&self.current_cx)
    }
}

impl Default for ContextStack {
    fn default() -> Self {
        ContextStack {
            current_cx: AsyncContext::default(),
            stack: Vec::with_capacity(ContextStack::INITIAL_CAPACITY),
            _marker: PhantomData,
        }
    }
}
