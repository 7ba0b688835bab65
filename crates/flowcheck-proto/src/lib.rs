//! Contract for asynchronous, backpressured element streams.
//!
//! Three roles cooperate:
//!
//! - [`Publisher`]: produces elements, but only as many as were requested.
//! - [`Subscriber`]: consumes elements and signals demand.
//! - [`Subscription`]: the link between exactly one publisher and one
//!   subscriber, carrying cumulative demand and cancellation.
//!
//! A [`Processor`] is both a subscriber (upstream) and a publisher
//! (downstream).
//!
//! # Signal order
//!
//! ```text
//! on_subscribe  (on_next)*  (on_complete | on_error)?
//! ```
//!
//! Every subscriber sees exactly one `on_subscribe` first, then any number of
//! `on_next` signals bounded by the demand it requested, then at most one
//! terminal signal. Terminal signals may arrive without any demand.
//!
//! All methods take `&self`: implementations are shared across threads behind
//! [`Arc`] and keep their state behind interior mutability, because signals
//! are allowed to be delivered from any thread.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use thiserror::Error;

/// Largest demand a subscriber can express.
///
/// Cumulative demand that reaches this value is treated as unbounded; adding
/// to it must saturate rather than overflow or fail.
pub const MAX_DEMAND: i64 = i64::MAX;

/// Error carried by `on_error`.
///
/// Shared so that one failure can fan out to several subscribers and still be
/// inspected by kind through [`std::error::Error`] downcasting.
pub type SignalError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Error a publisher must signal when asked for `n <= 0` elements.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("rule 3.9: non-positive subscription request ({requested}) is illegal")]
pub struct NonPositiveRequest {
    /// The offending request argument.
    pub requested: i64,
}

impl NonPositiveRequest {
    /// Wrap the offending request as a [`SignalError`].
    pub fn signal(requested: i64) -> SignalError {
        Arc::new(Self { requested })
    }
}

/// Add demand, saturating at [`MAX_DEMAND`].
///
/// Negative operands are clamped to zero; illegal requests must be rejected
/// before they reach the demand counter.
pub fn add_demand(current: i64, requested: i64) -> i64 {
    current.max(0).saturating_add(requested.max(0))
}

/// Link between one publisher and one subscriber.
pub trait Subscription: Send + Sync {
    /// Add `n` to the outstanding demand.
    ///
    /// `n <= 0` is illegal and must be answered with `on_error` carrying
    /// [`NonPositiveRequest`]. After cancellation this is a no-op.
    fn request(&self, n: i64);

    /// Stop signalling and release the subscriber.
    ///
    /// Idempotent: repeated calls are no-ops.
    fn cancel(&self);
}

/// Consumer side of a stream.
pub trait Subscriber<T>: Send + Sync {
    /// First signal, delivering the subscription used to request elements.
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);

    /// One element, delivered only against outstanding demand.
    fn on_next(&self, element: T);

    /// Terminal failure.
    fn on_error(&self, error: SignalError);

    /// Terminal success.
    fn on_complete(&self);
}

/// Producer side of a stream.
pub trait Publisher<T>: Send + Sync {
    /// Attach a subscriber.
    ///
    /// The publisher must eventually call `on_subscribe` on it, and may
    /// follow that with `on_error` to reject the subscription.
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// A stage that is a subscriber upstream and a publisher downstream.
pub trait Processor<T, R = T>: Subscriber<T> + Publisher<R> {}

impl<T, R, P> Processor<T, R> for P where P: Subscriber<T> + Publisher<R> {}
