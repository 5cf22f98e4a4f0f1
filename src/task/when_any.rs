//! First-completion combinators.
//!
//! `when_anyN` polls its inputs in order and resolves with the first that
//! completes, tagged by position. An input that is already ready when the
//! combinator is first polled therefore wins by position. The losing futures
//! are dropped with the combinator, which is their cooperative cancellation:
//! a pending [`delay_until`](crate::task::delay_until) releases its timer
//! token, a pending [`ScopedTask`](crate::task::ScopedTask) aborts.
//!
//! Unit-returning futures need no special casing: their arm simply carries
//! `()`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// The result of [`when_any2`]: the first completer's value, by position.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Any2<A, B> {
    First(A),
    Second(B),
}

impl<A, B> Any2<A, B> {
    /// Zero-based index of the arm that completed first.
    pub fn index(&self) -> usize {
        match self {
            Any2::First(_) => 0,
            Any2::Second(_) => 1,
        }
    }
}

/// The result of [`when_any3`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Any3<A, B, C> {
    First(A),
    Second(B),
    Third(C),
}

impl<A, B, C> Any3<A, B, C> {
    /// Zero-based index of the arm that completed first.
    pub fn index(&self) -> usize {
        match self {
            Any3::First(_) => 0,
            Any3::Second(_) => 1,
            Any3::Third(_) => 2,
        }
    }
}

/// The result of [`when_any4`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Any4<A, B, C, D> {
    First(A),
    Second(B),
    Third(C),
    Fourth(D),
}

impl<A, B, C, D> Any4<A, B, C, D> {
    /// Zero-based index of the arm that completed first.
    pub fn index(&self) -> usize {
        match self {
            Any4::First(_) => 0,
            Any4::Second(_) => 1,
            Any4::Third(_) => 2,
            Any4::Fourth(_) => 3,
        }
    }
}

/// Waits for the first completion of two futures.
pub fn when_any2<A, B>(first: A, second: B) -> WhenAny2<A, B>
where
    A: Future,
    B: Future,
{
    WhenAny2 { first, second }
}

/// Waits for the first completion of three futures.
pub fn when_any3<A, B, C>(first: A, second: B, third: C) -> WhenAny3<A, B, C>
where
    A: Future,
    B: Future,
    C: Future,
{
    WhenAny3 {
        first,
        second,
        third,
    }
}

/// Waits for the first completion of four futures.
pub fn when_any4<A, B, C, D>(first: A, second: B, third: C, fourth: D) -> WhenAny4<A, B, C, D>
where
    A: Future,
    B: Future,
    C: Future,
    D: Future,
{
    WhenAny4 {
        first,
        second,
        third,
        fourth,
    }
}

/// The future returned by [`when_any2`].
pub struct WhenAny2<A, B> {
    first: A,
    second: B,
}

impl<A, B> Future for WhenAny2<A, B>
where
    A: Future,
    B: Future,
{
    type Output = Any2<A::Output, B::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: the fields are never moved out of the pinned struct; each
        // is re-pinned in place, as the inputs were pinned transitively.
        let this = unsafe { self.get_unchecked_mut() };

        let first = unsafe { Pin::new_unchecked(&mut this.first) };
        if let Poll::Ready(value) = first.poll(cx) {
            return Poll::Ready(Any2::First(value));
        }

        let second = unsafe { Pin::new_unchecked(&mut this.second) };
        if let Poll::Ready(value) = second.poll(cx) {
            return Poll::Ready(Any2::Second(value));
        }

        Poll::Pending
    }
}

/// The future returned by [`when_any3`].
pub struct WhenAny3<A, B, C> {
    first: A,
    second: B,
    third: C,
}

impl<A, B, C> Future for WhenAny3<A, B, C>
where
    A: Future,
    B: Future,
    C: Future,
{
    type Output = Any3<A::Output, B::Output, C::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: as in `WhenAny2::poll`.
        let this = unsafe { self.get_unchecked_mut() };

        let first = unsafe { Pin::new_unchecked(&mut this.first) };
        if let Poll::Ready(value) = first.poll(cx) {
            return Poll::Ready(Any3::First(value));
        }

        let second = unsafe { Pin::new_unchecked(&mut this.second) };
        if let Poll::Ready(value) = second.poll(cx) {
            return Poll::Ready(Any3::Second(value));
        }

        let third = unsafe { Pin::new_unchecked(&mut this.third) };
        if let Poll::Ready(value) = third.poll(cx) {
            return Poll::Ready(Any3::Third(value));
        }

        Poll::Pending
    }
}

/// The future returned by [`when_any4`].
pub struct WhenAny4<A, B, C, D> {
    first: A,
    second: B,
    third: C,
    fourth: D,
}

impl<A, B, C, D> Future for WhenAny4<A, B, C, D>
where
    A: Future,
    B: Future,
    C: Future,
    D: Future,
{
    type Output = Any4<A::Output, B::Output, C::Output, D::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: as in `WhenAny2::poll`.
        let this = unsafe { self.get_unchecked_mut() };

        let first = unsafe { Pin::new_unchecked(&mut this.first) };
        if let Poll::Ready(value) = first.poll(cx) {
            return Poll::Ready(Any4::First(value));
        }

        let second = unsafe { Pin::new_unchecked(&mut this.second) };
        if let Poll::Ready(value) = second.poll(cx) {
            return Poll::Ready(Any4::Second(value));
        }

        let third = unsafe { Pin::new_unchecked(&mut this.third) };
        if let Poll::Ready(value) = third.poll(cx) {
            return Poll::Ready(Any4::Third(value));
        }

        let fourth = unsafe { Pin::new_unchecked(&mut this.fourth) };
        if let Poll::Ready(value) = fourth.poll(cx) {
            return Poll::Ready(Any4::Fourth(value));
        }

        Poll::Pending
    }
}

/// Waits for the first completion among two to four futures.
///
/// Expands to the matching [`when_any2`]/[`when_any3`]/[`when_any4`] call.
#[macro_export]
macro_rules! when_any {
    ($first:expr, $second:expr $(,)?) => {
        $crate::task::when_any2($first, $second)
    };
    ($first:expr, $second:expr, $third:expr $(,)?) => {
        $crate::task::when_any3($first, $second, $third)
    };
    ($first:expr, $second:expr, $third:expr, $fourth:expr $(,)?) => {
        $crate::task::when_any4($first, $second, $third, $fourth)
    };
}
