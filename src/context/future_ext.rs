use crate::context::AsyncContext;
use futures_core::Stream;
use futures_sink::Sink;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::Context as TaskContext;
use std::task::Poll;

impl<T: std::future::Future> std::future::Future for WithContext<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.binding_cx.clone().attach();

        this.inner.poll(task_cx)
    }
}

impl<T: Stream> Stream for WithContext<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let _guard = this.binding_cx.clone().attach();
        T::poll_next(this.inner, task_cx)
    }
}

pin_project! {
    /// A future, stream, or sink that has an associated binding set.
    ///
    /// The set is re-attached at every poll, so code running inside the
    /// wrapped computation observes it as current, no matter which executor
    /// thread the poll lands on.
    #[derive(Clone, Debug)]
    pub struct WithContext<T> {
        #[pin]
        inner: T,
        binding_cx: AsyncContext,
    }
}

impl<I, T: Sink<I>> Sink<I> for WithContext<T> {
    type Error = T::Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _guard = this.binding_cx.clone().attach();
        T::poll_ready(this.inner, task_cx)
    }

    fn start_send(self: Pin<&mut Self>, item: I) -> Result<(), Self::Error> {
        let this = self.project();
        let _guard = this.binding_cx.clone().attach();
        T::start_send(this.inner, item)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _guard = this.binding_cx.clone().attach();
        T::poll_flush(this.inner, task_cx)
    }

    fn poll_close(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _enter = this.binding_cx.clone().attach();
        T::poll_close(this.inner, task_cx)
    }
}

// The following three extension traits are _almost_ identical,
// but need to be separate to avoid overlapping implementation errors.

impl<F: std::future::Future> FutureContextExt for F {}
/// Extension trait allowing futures to carry a binding set.
pub trait FutureContextExt: Sized {
    /// Attaches the provided [`AsyncContext`] to this future, returning a
    /// `WithContext` wrapper.
    ///
    /// The attached set will be current while this future is being polled.
    fn with_context(self, binding_cx: AsyncContext) -> WithContext<Self> {
        WithContext {
            inner: self,
            binding_cx,
        }
    }

    /// Attaches the current [`AsyncContext`] to this future, returning a
    /// `WithContext` wrapper.
    ///
    /// The attached set will be current while this future is being polled.
    fn with_current_context(self) -> WithContext<Self> {
        let binding_cx = AsyncContext::current();
        self.with_context(binding_cx)
    }
}

impl<S: Stream> StreamContextExt for S {}
/// Extension trait allowing streams (event sources) to carry a binding set.
///
/// This is the binding primitive for event-emitting objects: whichever set
/// is active at wrap time is restored whenever an item is produced later.
pub trait StreamContextExt: Sized {
    /// Attaches the provided [`AsyncContext`] to this stream, returning a
    /// `WithContext` wrapper.
    ///
    /// The attached set will be current while this stream is being polled.
    fn with_context(self, binding_cx: AsyncContext) -> WithContext<Self> {
        WithContext {
            inner: self,
            binding_cx,
        }
    }

    /// Attaches the current [`AsyncContext`] to this stream, returning a
    /// `WithContext` wrapper.
    ///
    /// The attached set will be current while this stream is being polled.
    fn with_current_context(self) -> WithContext<Self> {
        let binding_cx = AsyncContext::current();
        self.with_context(binding_cx)
    }
}

impl<_I, S: Sink<_I>> SinkContextExt<_I> for S {}
/// Extension trait allowing sinks to carry a binding set.
///
/// The generic argument is unused.
pub trait SinkContextExt<_I>: Sized {
    /// Attaches the provided [`AsyncContext`] to this sink, returning a
    /// `WithContext` wrapper.
    ///
    /// The attached set will be current while this sink is being polled.
    fn with_context(self, binding_cx: AsyncContext) -> WithContext<Self> {
        WithContext {
            inner: self,
            binding_cx,
        }
    }

    /// Attaches the current [`AsyncContext`] to this sink, returning a
    /// `WithContext` wrapper.
    ///
    /// The attached set will be current while this sink is being polled.
    fn with_current_context(self) -> WithContext<Self> {
        let binding_cx = AsyncContext::current();
        self.with_context(binding_cx)
    }
}
