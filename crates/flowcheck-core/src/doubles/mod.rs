//! Reference implementations of the protocol roles.
//!
//! The doubles are correct by construction and fully scriptable, so a
//! scenario can put exactly one implementation under test and surround it
//! with known-good counterparts:
//!
//! - [`ManualPublisher`] drives a subscriber under test and records the
//!   demand and cancellation it signals upstream.
//! - [`ManualSubscriber`] observes a publisher under test and buffers what it
//!   emits, with a blackhole variant that only counts.
//! - [`HelperPublisher`] generates elements on a background thread for
//!   scenarios that need a plain source of data.

mod helper_publisher;
mod manual_publisher;
mod manual_subscriber;

use std::{sync::Arc, time::Duration};

use flowcheck_proto::Publisher;
pub use helper_publisher::{ElementFactory, HelperPublisher};
pub use manual_publisher::ManualPublisher;
pub use manual_subscriber::ManualSubscriber;

use crate::{Element, env::TestEnvironment, error::Failure};

impl TestEnvironment {
    /// Subscribe `subscriber` to `publisher` and wait the default timeout
    /// for `on_subscribe`.
    pub fn subscribe<T: Element>(
        &self,
        publisher: &dyn Publisher<T>,
        subscriber: &Arc<ManualSubscriber<T>>,
    ) -> Result<(), Failure> {
        self.subscribe_within(publisher, subscriber, self.default_timeout())
    }

    /// Subscribe `subscriber` to `publisher` and wait up to `timeout` for
    /// `on_subscribe`.
    pub fn subscribe_within<T: Element>(
        &self,
        publisher: &dyn Publisher<T>,
        subscriber: &Arc<ManualSubscriber<T>>,
        timeout: Duration,
    ) -> Result<(), Failure> {
        publisher.subscribe(subscriber.clone());
        let message = "could not subscribe to publisher: no on_subscribe";
        subscriber.expect_subscription_within(timeout, message).map(drop)
    }

    /// Create a buffering [`ManualSubscriber`] already subscribed to
    /// `publisher`.
    pub fn new_manual_subscriber<T: Element>(
        self: &Arc<Self>,
        publisher: &dyn Publisher<T>,
    ) -> Result<Arc<ManualSubscriber<T>>, Failure> {
        let subscriber = ManualSubscriber::new(Arc::clone(self));
        self.subscribe(publisher, &subscriber)?;
        Ok(subscriber)
    }

    /// Create a blackhole [`ManualSubscriber`] already subscribed to
    /// `publisher`.
    pub fn new_blackhole_subscriber<T: Element>(
        self: &Arc<Self>,
        publisher: &dyn Publisher<T>,
    ) -> Result<Arc<ManualSubscriber<T>>, Failure> {
        let subscriber = ManualSubscriber::blackhole(Arc::clone(self));
        self.subscribe(publisher, &subscriber)?;
        Ok(subscriber)
    }
}
