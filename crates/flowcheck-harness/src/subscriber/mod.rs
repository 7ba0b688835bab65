//! Rules every subscriber must follow.
//!
//! Two postures:
//!
//! - [`SubscriberWhiteboxVerification`]: the subscriber under test reports
//!   every signal to a probe and hands the harness a puppet, so scenarios
//!   can make it request or cancel and then observe the effect upstream.
//! - [`SubscriberBlackboxVerification`]: the subscriber is only wrapped, so
//!   scenarios see what reaches it but cannot steer it.
//!
//! In both, the subscriber under test is attached to a
//! [`flowcheck_core::ManualPublisher`] that plays the publisher role and
//! records the demand and cancellation it receives. Payloads come from a
//! background [`HelperPublisher`].

mod blackbox;
mod whitebox;

use std::sync::Arc;

pub use blackbox::{BlackboxSubscriberFactory, SubscriberBlackboxVerification};
use flowcheck_core::{
    Element, ElementFactory, HelperPublisher, Latch, ManualSubscriber, TestEnvironment,
};
use flowcheck_proto::{Subscriber, Subscription};
pub use whitebox::{SubscriberWhiteboxVerification, WhiteboxSubscriberFactory};

use crate::rule::ScenarioError;

/// Untested subscriber rules shared by both postures: `(rule, name, reason)`.
const UNTESTED_COMMON: [(&str, &str, &str); 11] = [
    (
        "2.2",
        "should_asynchronously_dispatch",
        "dispatch strategy is not observable",
    ),
    (
        "2.4",
        "must_consider_the_subscription_as_cancelled_after_on_complete_or_on_error",
        "subscriber internals are not observable",
    ),
    (
        "2.6",
        "must_call_subscription_cancel_if_it_is_no_longer_valid",
        "validity is the subscriber's own judgement",
    ),
    (
        "2.7",
        "must_ensure_all_calls_on_its_subscription_take_place_from_the_same_thread_or_synchronize",
        "thread confinement is not observable from the subscription side",
    ),
    (
        "2.11",
        "must_make_sure_that_all_calls_on_its_methods_happen_before_processing_of_the_events",
        "memory visibility is not observable",
    ),
    (
        "2.12",
        "must_not_call_on_subscribe_more_than_once_based_on_object_equality",
        "the harness cannot construct an equal but distinct subscriber",
    ),
    (
        "2.13",
        "failing_on_signal_invocation",
        "a subscriber cannot be forced to fail",
    ),
    (
        "2.13",
        "on_subscribe_must_reject_null_subscription",
        "not expressible: a subscription reference is never null",
    ),
    (
        "2.13",
        "on_next_must_reject_null_element",
        "not expressible: elements are values, never null",
    ),
    (
        "2.13",
        "on_error_must_reject_null_error",
        "not expressible: an error reference is never null",
    ),
    (
        "3.1",
        "must_not_be_called_outside_subscriber_context",
        "callers of the subscription are not observable",
    ),
];

/// Untested subscription rules exercised from the subscriber side.
const UNTESTED_SUBSCRIPTION: [(&str, &str, &str); 5] = [
    (
        "3.10",
        "request_may_synchronously_call_on_next_on_subscriber",
        "permission, not obligation",
    ),
    (
        "3.11",
        "request_may_synchronously_call_on_complete_or_on_error",
        "permission, not obligation",
    ),
    (
        "3.14",
        "cancel_may_cause_the_publisher_to_shutdown_if_no_other_subscription_exists",
        "permission, not obligation",
    ),
    (
        "3.15",
        "cancel_must_not_fail_and_must_signal_on_error",
        "the reference subscription never fails",
    ),
    (
        "3.16",
        "request_must_not_fail_and_must_signal_on_error",
        "the reference subscription never fails",
    ),
];

/// Subscription handed to an already-subscribed subscriber.
///
/// The subscriber must cancel it without ever requesting from it.
struct SecondSubscription {
    env: Arc<TestEnvironment>,
    cancelled: Latch,
}

impl SecondSubscription {
    fn new(env: Arc<TestEnvironment>) -> Arc<Self> {
        Arc::new(Self { cancelled: Latch::new(Arc::clone(&env)), env })
    }
}

impl Subscription for SecondSubscription {
    fn request(&self, n: i64) {
        self.env.flop(format!(
            "subscriber illegally called request({n}) on a second subscription it should have \
             cancelled (rule 2.5)"
        ));
    }

    fn cancel(&self) {
        self.cancelled.close();
    }
}

/// Deliver a second subscription to `subject` and require it to be
/// cancelled.
fn expect_second_subscription_cancelled<T>(
    env: &Arc<TestEnvironment>,
    subject: &Arc<dyn Subscriber<T>>,
) -> Result<(), ScenarioError> {
    let second = SecondSubscription::new(Arc::clone(env));
    subject.on_subscribe(second.clone());
    second.cancelled.expect_close(
        "expected the second subscription given to the subscriber to be cancelled, but cancel \
         was not called",
    )?;
    env.verify_no_async_errors()?;
    Ok(())
}

/// Unbounded source of payloads plus a subscriber pulling from it.
///
/// Cancelled on drop so the background worker stops.
pub(crate) struct ElementSource<T: Element> {
    tees: Arc<ManualSubscriber<T>>,
    seen: parking_lot::Mutex<Vec<T>>,
}

impl<T: Element> ElementSource<T> {
    pub(crate) fn new(
        env: &Arc<TestEnvironment>,
        factory: ElementFactory<T>,
    ) -> Result<Self, ScenarioError> {
        let helper = HelperPublisher::unbounded(factory);
        let tees = env.new_manual_subscriber(&*helper).inspect_err(|_| helper.cancel_all())?;
        Ok(Self { tees, seen: parking_lot::Mutex::new(Vec::new()) })
    }

    /// Pull the next payload, flopping if the helper repeats one.
    pub(crate) fn next(&self, env: &TestEnvironment) -> Result<T, ScenarioError> {
        let element = self.tees.request_next_element()?;
        let mut seen = self.seen.lock();
        if seen.contains(&element) {
            env.flop(format!(
                "helper publisher illegally produced the same element {element:?} twice"
            ));
        }
        seen.push(element.clone());
        Ok(element)
    }
}

impl<T: Element> Drop for ElementSource<T> {
    fn drop(&mut self) {
        if let Some(subscription) = self.tees.release_subscription() {
            subscription.cancel();
        }
    }
}
