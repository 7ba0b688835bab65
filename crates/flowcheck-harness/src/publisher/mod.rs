//! Rules every publisher must follow.
//!
//! [`PublisherVerification`] runs the publisher rules against publishers
//! produced by a [`PublisherFactory`]. The factory also declares the
//! publisher's legal limitations through [`PublisherCapabilities`], so that
//! rules needing more elements, completion or several subscribers are
//! reported as skipped rather than failed.
//!
//! # Usage
//!
//! ```ignore
//! let env = TestEnvironment::from_env()?;
//! let report = PublisherVerification::new(env, Arc::new(MyFactory)).run();
//! report.assert_conformant();
//! ```

mod subscribers;

use std::{sync::Arc, time::Duration};

use flowcheck_core::{
    Delivery, Element, ManualSubscriber, TestEnvironment, await_release,
};
use flowcheck_proto::{MAX_DEMAND, NonPositiveRequest, Publisher};
use rand::Rng;
use serde::Serialize;

use self::subscribers::{
    EagerRequester, OrderingSubscriber, OverflowingSubscriber, RecursionProbe,
    SequentialSubscriber,
};
use crate::{
    rule::{Rule, RuleInfo, RuleRegistry, ScenarioError, ScenarioResult},
    runner::{RuleReport, RunSettings, SuiteReport, run_registry, run_rule},
};

/// Element count asking for a publisher that never completes.
pub const UNBOUNDED_ELEMENTS: u64 = u64::MAX;

/// Supplies the publishers under test.
pub trait PublisherFactory<T>: Send + Sync {
    /// A fresh publisher that emits exactly `elements` elements to each
    /// subscriber and then completes, or never completes when `elements`
    /// is [`UNBOUNDED_ELEMENTS`].
    fn create_publisher(&self, elements: u64) -> Arc<dyn Publisher<T>>;

    /// A publisher that signals `on_subscribe` followed by `on_error` to
    /// every subscriber. `None` skips the rules that need one.
    fn create_failed_publisher(&self) -> Option<Arc<dyn Publisher<T>>> {
        None
    }

    /// Declared limitations of the publishers.
    fn capabilities(&self) -> PublisherCapabilities {
        PublisherCapabilities::default()
    }
}

/// Known, legal limitations of a publisher under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublisherCapabilities {
    /// Largest element count the publisher can be created with.
    /// [`UNBOUNDED_ELEMENTS`] means it cannot signal completion at all.
    pub max_elements_from_publisher: u64,
    /// How deep `request -> on_next` recursion may go on one thread.
    pub bounded_depth_of_on_next_and_request_recursion: u64,
    /// Skip the stochastic rules.
    pub skip_stochastic_tests: bool,
    /// Repetitions of each stochastic rule.
    pub stochastic_repetitions: u32,
    /// Concurrent subscribers the publisher supports. Unbounded by default,
    /// so the optional multi-subscriber rules run unless this is lowered.
    pub max_supported_subscribers: usize,
    /// Emission waits for the slowest subscriber, so one subscriber cannot
    /// be served ahead of the others.
    pub does_coordinated_emission: bool,
}

impl Default for PublisherCapabilities {
    fn default() -> Self {
        Self {
            max_elements_from_publisher: UNBOUNDED_ELEMENTS - 1,
            bounded_depth_of_on_next_and_request_recursion: 1,
            skip_stochastic_tests: false,
            stochastic_repetitions: 100,
            max_supported_subscribers: usize::MAX,
            does_coordinated_emission: false,
        }
    }
}

impl PublisherCapabilities {
    /// Set the largest supported element count.
    #[must_use]
    pub fn with_max_elements(mut self, max: u64) -> Self {
        self.max_elements_from_publisher = max;
        self
    }

    /// Set the allowed recursion depth.
    #[must_use]
    pub fn with_bounded_recursion_depth(mut self, depth: u64) -> Self {
        self.bounded_depth_of_on_next_and_request_recursion = depth;
        self
    }

    /// Skip or run the stochastic rules.
    #[must_use]
    pub fn with_skip_stochastic_tests(mut self, skip: bool) -> Self {
        self.skip_stochastic_tests = skip;
        self
    }

    /// Set the repetitions of each stochastic rule.
    #[must_use]
    pub fn with_stochastic_repetitions(mut self, repetitions: u32) -> Self {
        self.stochastic_repetitions = repetitions;
        self
    }

    /// Set the number of concurrent subscribers supported.
    #[must_use]
    pub fn with_max_supported_subscribers(mut self, subscribers: usize) -> Self {
        self.max_supported_subscribers = subscribers;
        self
    }

    /// Declare coordinated emission.
    #[must_use]
    pub fn with_coordinated_emission(mut self, coordinated: bool) -> Self {
        self.does_coordinated_emission = coordinated;
        self
    }

    /// Runner settings implied by these capabilities.
    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            skip_stochastic: self.skip_stochastic_tests,
            stochastic_repetitions: self.stochastic_repetitions,
            max_supported_subscribers: self.max_supported_subscribers,
        }
    }
}

/// Requested but not delivered after cancellation, the most rule 3.12
/// tolerates.
const DEMAND_BEFORE_CANCEL: i64 = 10;

/// `on_next` calls the overflow check issues `request(MAX_DEMAND - 1)` from.
const OVERFLOW_REQUEST_CALLS: i64 = 10;

/// Verification suite for one publisher implementation.
pub struct PublisherVerification<T> {
    env: Arc<TestEnvironment>,
    factory: Arc<dyn PublisherFactory<T>>,
    caps: PublisherCapabilities,
}

impl<T: Element> PublisherVerification<T> {
    /// Suite name used in reports.
    pub const SUITE: &'static str = "publisher";

    /// Create a suite over the publishers of `factory`.
    pub fn new(env: Arc<TestEnvironment>, factory: Arc<dyn PublisherFactory<T>>) -> Self {
        let caps = factory.capabilities();
        Self { env, factory, caps }
    }

    /// Environment shared by every rule.
    pub fn env(&self) -> &Arc<TestEnvironment> {
        &self.env
    }

    /// Declared capabilities.
    pub fn capabilities(&self) -> &PublisherCapabilities {
        &self.caps
    }

    /// Run every rule.
    pub fn run(&self) -> SuiteReport {
        run_registry(Self::SUITE, &self.env, &Self::registry(), self, &self.caps.run_settings())
    }

    /// Run the rule called `name`, if there is one.
    pub fn run_rule(&self, name: &str) -> Option<RuleReport> {
        let registry = Self::registry();
        let rule = registry.get(name)?;
        Some(run_rule(Self::SUITE, &self.env, rule, self, &self.caps.run_settings()))
    }

    /// Listing of every rule.
    pub fn rules() -> Vec<RuleInfo> {
        Self::registry().infos()
    }

    /// Every publisher rule, in rule-book order.
    pub fn registry() -> RuleRegistry<Self> {
        let mut r = RuleRegistry::new();

        r.add(Rule::required(
            "1.1",
            "create_publisher_1_must_produce_a_stream_of_exactly_1_element",
            "a publisher created for one element emits it and then completes",
            Self::create_publisher_1,
        ));
        r.add(Rule::required(
            "1.1",
            "create_publisher_3_must_produce_a_stream_of_exactly_3_elements",
            "a publisher created for three elements emits them and then completes",
            Self::create_publisher_3,
        ));
        r.add(Rule::required(
            "-",
            "validate_max_elements_from_publisher",
            "the declared maximum element count is usable",
            Self::validate_max_elements,
        ));
        r.add(Rule::required(
            "-",
            "validate_bounded_depth_of_on_next_and_request_recursion",
            "the declared recursion bound is at least 1",
            Self::validate_bounded_depth,
        ));
        r.add(Rule::required(
            "1.1",
            "subscription_request_must_result_in_the_correct_number_of_produced_elements",
            "on_next is signalled at most as often as requested",
            Self::spec101_correct_number_of_elements,
        ));
        r.add(Rule::required(
            "1.2",
            "may_signal_less_than_requested_and_terminate_subscription",
            "a publisher may complete before all demand is served",
            Self::spec102_may_signal_less_than_requested,
        ));
        r.add(Rule::stochastic(
            "1.3",
            "must_signal_on_methods_sequentially",
            "signals to one subscriber never overlap in time",
            Self::spec103_signals_sequentially,
        ));
        r.add(Rule::optional(
            "1.4",
            "must_signal_on_error_when_fails",
            "a failed publisher signals on_error after on_subscribe",
            Self::spec104_signal_on_error_when_fails,
        ));
        r.add(Rule::required(
            "1.5",
            "must_signal_on_complete_when_finite_stream_terminates",
            "a finite stream ends with on_complete",
            Self::spec105_on_complete_when_finite,
        ));
        r.add(Rule::optional(
            "1.5",
            "empty_stream_must_terminate_by_signalling_on_complete",
            "an empty stream completes once demand is signalled",
            Self::spec105_empty_stream_completes,
        ));
        r.add(Rule::untested(
            "1.6",
            "must_consider_subscription_cancelled_after_on_error_or_on_complete",
            "a terminated subscription is considered cancelled",
            "publisher internals are not observable",
        ));
        r.add(Rule::required(
            "1.7",
            "must_not_emit_further_signals_once_on_complete_has_been_signalled",
            "nothing follows on_complete",
            Self::spec107_nothing_after_on_complete,
        ));
        r.add(Rule::untested(
            "1.7",
            "must_not_emit_further_signals_once_on_error_has_been_signalled",
            "nothing follows on_error",
            "a publisher cannot be made to fail on demand",
        ));
        r.add(Rule::untested(
            "1.8",
            "possibly_cancelled_subscription_should_not_receive_on_error_or_on_complete",
            "cancelled subscriptions eventually stop receiving terminal signals",
            "indistinguishable from a race with cancellation",
        ));
        r.add(Rule::untested(
            "1.9",
            "subscribe_should_not_fail_for_non_null_subscriber",
            "subscribe returns normally",
            "a failing subscribe cannot be told apart from a correct one from the outside",
        ));
        r.add(Rule::untested(
            "1.9",
            "subscribe_must_reject_null_subscriber",
            "subscribe rejects a missing subscriber",
            "not expressible: a subscriber reference is never null",
        ));
        r.add(Rule::required(
            "1.9",
            "must_issue_on_subscribe_for_non_null_subscriber",
            "on_subscribe precedes every other signal and arrives once",
            Self::spec109_on_subscribe_first,
        ));
        r.add(Rule::required(
            "1.9",
            "may_reject_calls_to_subscribe_with_on_error_after_on_subscribe",
            "rejection is signalled with on_error after on_subscribe",
            Self::spec109_reject_with_on_error,
        ));
        r.add(Rule::untested(
            "1.10",
            "reject_a_subscription_request_if_the_same_subscriber_subscribes_twice",
            "a subscriber subscribing twice is rejected",
            "the outcome depends on subscriber identity rules outside the protocol",
        ));
        r.add(
            Rule::optional(
                "1.11",
                "may_support_multi_subscribe",
                "several subscribers may subscribe to the same publisher",
                Self::spec111_multi_subscribe,
            )
            .with_subscribers(2),
        );
        r.add(
            Rule::optional(
                "1.11",
                "registered_subscribers_must_receive_on_next_or_on_complete_signals",
                "every subscriber gets an element or completion",
                Self::spec111_subscribers_receive_signals,
            )
            .with_subscribers(2),
        );
        r.add(
            Rule::optional(
                "1.11",
                "multicast_same_elements_in_same_sequence_when_requesting_one_by_one",
                "independently paced subscribers see the same sequence",
                Self::spec111_multicast_one_by_one,
            )
            .with_subscribers(3),
        );
        r.add(
            Rule::optional(
                "1.11",
                "multicast_same_elements_in_same_sequence_when_requesting_many_upfront",
                "subscribers requesting up front see the same sequence",
                Self::spec111_multicast_many_upfront,
            )
            .with_subscribers(3),
        );
        r.add(
            Rule::optional(
                "1.11",
                "multicast_same_elements_when_requesting_many_upfront_and_complete_as_expected",
                "subscribers requesting up front see the same sequence and completion",
                Self::spec111_multicast_many_upfront_completing,
            )
            .with_subscribers(3),
        );
        r.add(Rule::required(
            "3.2",
            "must_allow_synchronous_request_calls_from_on_next_and_on_subscribe",
            "request may be called from inside on_subscribe and on_next",
            Self::spec302_synchronous_request,
        ));
        r.add(Rule::required(
            "3.3",
            "must_not_allow_unbounded_recursion_between_request_and_on_next",
            "request -> on_next recursion stays within the declared bound",
            Self::spec303_bounded_recursion,
        ));
        r.add(Rule::untested(
            "3.4",
            "request_should_not_perform_heavy_computations",
            "request returns quickly",
            "cost of a call is not a protocol signal",
        ));
        r.add(Rule::untested(
            "3.5",
            "cancel_must_not_synchronously_perform_heavy_computation",
            "cancel returns quickly",
            "cost of a call is not a protocol signal",
        ));
        r.add(Rule::required(
            "3.6",
            "after_subscription_is_cancelled_request_must_be_nops",
            "request after cancel has no effect",
            Self::spec306_request_after_cancel,
        ));
        r.add(Rule::required(
            "3.7",
            "after_subscription_is_cancelled_additional_cancellations_must_be_nops",
            "cancel is idempotent",
            Self::spec307_repeated_cancel,
        ));
        r.add(Rule::required(
            "3.9",
            "request_zero_must_signal_non_positive_request",
            "request(0) is answered with on_error",
            Self::spec309_request_zero,
        ));
        r.add(Rule::required(
            "3.9",
            "request_negative_number_must_signal_non_positive_request",
            "request(n < 0) is answered with on_error",
            Self::spec309_request_negative,
        ));
        r.add(Rule::optional(
            "3.9",
            "request_negative_number_may_signal_error_with_specific_message",
            "the error for request(n <= 0) names rule 3.9",
            Self::spec309_request_negative_message,
        ));
        r.add(Rule::required(
            "3.12",
            "cancel_must_make_the_publisher_eventually_stop_signalling",
            "signalling stops after cancel",
            Self::spec312_cancel_stops_signalling,
        ));
        r.add(Rule::required(
            "3.13",
            "cancel_must_make_the_publisher_eventually_drop_all_references_to_the_subscriber",
            "a cancelled subscriber is released",
            Self::spec313_cancel_drops_references,
        ));
        r.add(Rule::required(
            "3.17",
            "must_support_a_pending_element_count_up_to_max_demand",
            "request(MAX_DEMAND) is accepted",
            Self::spec317_max_demand,
        ));
        r.add(Rule::required(
            "3.17",
            "must_support_a_cumulative_pending_element_count_up_to_max_demand",
            "demand adding up to MAX_DEMAND is accepted",
            Self::spec317_cumulative_max_demand,
        ));
        r.add(Rule::required(
            "3.17",
            "must_not_signal_on_error_when_pending_above_max_demand",
            "demand above MAX_DEMAND saturates instead of failing",
            Self::spec317_no_error_above_max_demand,
        ));

        r
    }

    // Scenario plumbing

    /// Run `body` against a publisher of `elements` elements, or skip when
    /// the publisher cannot provide them.
    fn active_publisher_test<F>(
        &self,
        elements: u64,
        completion_required: bool,
        body: F,
    ) -> ScenarioResult
    where
        F: FnOnce(&Arc<dyn Publisher<T>>) -> ScenarioResult,
    {
        let max = self.caps.max_elements_from_publisher;
        if elements > max {
            return Err(ScenarioError::not_verified(format!(
                "unable to run this test: it requires {elements} elements, the publisher supports \
                 at most {max}"
            )));
        }
        if completion_required && max == UNBOUNDED_ELEMENTS {
            return Err(ScenarioError::not_verified(
                "unable to run this test: it requires on_complete, which this publisher cannot \
                 signal (max_elements_from_publisher is unbounded)",
            ));
        }

        let publisher = self.factory.create_publisher(elements);
        body(&publisher)?;
        self.env.verify_no_async_errors_no_delay()?;
        Ok(())
    }

    /// Run `body` against the failed publisher, or skip when there is none.
    fn when_has_error_publisher_test<F>(&self, body: F) -> ScenarioResult
    where
        F: FnOnce(&Arc<dyn Publisher<T>>) -> ScenarioResult,
    {
        let Some(publisher) = self.factory.create_failed_publisher() else {
            return Err(ScenarioError::not_verified(
                "skipping because no failed publisher was provided",
            ));
        };
        body(&publisher)
    }

    fn subscriber(
        &self,
        publisher: &Arc<dyn Publisher<T>>,
    ) -> Result<Arc<ManualSubscriber<T>>, ScenarioError> {
        Ok(self.env.new_manual_subscriber(&**publisher)?)
    }

    /// Run `body`, then cancel every subscriber whatever the outcome.
    fn then_cancel<F>(subscribers: &[&Arc<ManualSubscriber<T>>], body: F) -> ScenarioResult
    where
        F: FnOnce() -> ScenarioResult,
    {
        let result = body();
        let cancelled = subscribers.iter().try_for_each(|sub| sub.cancel());
        result?;
        cancelled.map_err(ScenarioError::from)
    }

    // Rules

    fn create_publisher_1(&self) -> ScenarioResult {
        self.active_publisher_test(1, true, |publisher| {
            let sub = self.subscriber(publisher)?;
            if sub.request_next_element_or_end_of_stream()?.is_none() {
                return Err(ScenarioError::violation("publisher produced no elements"));
            }
            sub.request_end_of_stream()?;
            Ok(())
        })
    }

    fn create_publisher_3(&self) -> ScenarioResult {
        self.active_publisher_test(3, true, |publisher| {
            let sub = self.subscriber(publisher)?;
            for nth in 1..=3 {
                if sub.request_next_element_or_end_of_stream()?.is_none() {
                    return Err(ScenarioError::violation(format!(
                        "publisher completed after {} of 3 elements",
                        nth - 1
                    )));
                }
            }
            sub.request_end_of_stream()?;
            Ok(())
        })
    }

    fn validate_max_elements(&self) -> ScenarioResult {
        if self.caps.max_elements_from_publisher >= 1 {
            Ok(())
        } else {
            Err(ScenarioError::Harness(
                "max_elements_from_publisher must be at least 1".to_string(),
            ))
        }
    }

    fn validate_bounded_depth(&self) -> ScenarioResult {
        if self.caps.bounded_depth_of_on_next_and_request_recursion >= 1 {
            Ok(())
        } else {
            Err(ScenarioError::Harness(
                "bounded_depth_of_on_next_and_request_recursion must be at least 1".to_string(),
            ))
        }
    }

    fn spec101_correct_number_of_elements(&self) -> ScenarioResult {
        self.active_publisher_test(5, false, |publisher| {
            let sub = self.subscriber(publisher)?;
            let window = self.env.default_no_signals_timeout();
            let timeout = self.env.default_timeout();
            Self::then_cancel(&[&sub], || {
                let early = "publisher produced an element before the first request";
                sub.expect_none_within(window, early)?;
                sub.request(1)?;
                let missing = "publisher produced no element after the first request";
                sub.next_element_within(timeout, missing)?;
                sub.expect_none_within(window, "publisher produced an unrequested element")?;
                sub.request(1)?;
                sub.request(2)?;
                sub.next_elements_within(
                    3,
                    timeout,
                    "publisher produced less than 3 elements after two request calls",
                )?;
                sub.expect_none_within(window, "publisher produced an unrequested element")?;
                Ok(())
            })
        })
    }

    fn spec102_may_signal_less_than_requested(&self) -> ScenarioResult {
        let elements = 3;
        self.active_publisher_test(elements, true, |publisher| {
            let sub = self.subscriber(publisher)?;
            sub.request(10)?;
            sub.next_elements(3)?;
            sub.expect_completion()?;
            Ok(())
        })
    }

    fn spec103_signals_sequentially(&self) -> ScenarioResult {
        let elements = 10;
        self.active_publisher_test(elements, true, |publisher| {
            let subscriber = SequentialSubscriber::<T>::new(Arc::clone(&self.env), elements);
            publisher.subscribe(subscriber.clone());

            let timeout = self.env.default_timeout().saturating_mul(10);
            let completed = &subscriber.completed;
            if let Err(missing) = completed.expect_close_within(timeout, "expected on_complete") {
                return Err(ScenarioError::violation(format!(
                    "{missing} after signalling {elements} elements (signalled {})",
                    subscriber.received.load(std::sync::atomic::Ordering::Acquire)
                )));
            }
            Ok(())
        })
    }

    fn failed_publisher_ordering(&self, publisher: &Arc<dyn Publisher<T>>) -> ScenarioResult {
        let subscriber = OrderingSubscriber::<T>::new(Arc::clone(&self.env), true);
        publisher.subscribe(subscriber.clone());
        subscriber.subscribed.expect_close("should have received on_subscribe")?;
        subscriber
            .errored
            .expect_close("failed publisher did not call on_error on new subscriber")?;
        self.env.verify_no_async_errors()?;
        Ok(())
    }

    fn spec104_signal_on_error_when_fails(&self) -> ScenarioResult {
        self.when_has_error_publisher_test(|publisher| self.failed_publisher_ordering(publisher))
    }

    fn spec105_on_complete_when_finite(&self) -> ScenarioResult {
        self.active_publisher_test(3, true, |publisher| {
            let sub = self.subscriber(publisher)?;
            sub.request_next_element()?;
            sub.request_next_element()?;
            sub.request_next_element()?;
            sub.request_end_of_stream()?;
            sub.expect_none()?;
            Ok(())
        })
    }

    fn spec105_empty_stream_completes(&self) -> ScenarioResult {
        self.active_publisher_test(0, true, |publisher| {
            let sub = self.subscriber(publisher)?;
            sub.request(1)?;
            sub.expect_completion()?;
            sub.expect_none()?;
            Ok(())
        })
    }

    fn spec107_nothing_after_on_complete(&self) -> ScenarioResult {
        self.active_publisher_test(1, true, |publisher| {
            let sub = self.subscriber(publisher)?;
            sub.request(10)?;
            sub.next_element()?;
            sub.expect_completion()?;
            sub.request(10)?;
            sub.expect_none()?;
            Ok(())
        })
    }

    fn spec109_on_subscribe_first(&self) -> ScenarioResult {
        self.active_publisher_test(0, false, |publisher| {
            let subscriber = OrderingSubscriber::<T>::new(Arc::clone(&self.env), false);
            publisher.subscribe(subscriber.clone());
            subscriber.subscribed.expect_close("should have received on_subscribe")?;
            Ok(())
        })
    }

    fn spec109_reject_with_on_error(&self) -> ScenarioResult {
        self.when_has_error_publisher_test(|publisher| self.failed_publisher_ordering(publisher))
    }

    fn spec111_multi_subscribe(&self) -> ScenarioResult {
        self.active_publisher_test(1, false, |publisher| {
            let first = self.subscriber(publisher)?;
            let second = self.subscriber(publisher)?;
            Self::then_cancel(&[&first, &second], || Ok(self.env.verify_no_async_errors()?))
        })
    }

    fn spec111_subscribers_receive_signals(&self) -> ScenarioResult {
        self.active_publisher_test(1, false, |publisher| {
            let first = self.subscriber(publisher)?;
            let second = self.subscriber(publisher)?;
            // Unicast or multicast is the publisher's choice, so either an
            // element or completion is acceptable for each subscriber.
            Self::then_cancel(&[&first, &second], || {
                first.request_next_element_or_end_of_stream()?;
                second.request_next_element_or_end_of_stream()?;
                self.env.verify_no_async_errors()?;
                Ok(())
            })
        })
    }

    fn spec111_multicast_one_by_one(&self) -> ScenarioResult {
        self.active_publisher_test(5, true, |publisher| {
            let sub1 = self.subscriber(publisher)?;
            let sub2 = self.subscriber(publisher)?;
            let sub3 = self.subscriber(publisher)?;
            let timeout = self.env.default_timeout();

            let mut first = pull(&sub1, 1, "1st", timeout)?;
            let mut second = pull(&sub2, 2, "2nd", timeout)?;
            first.extend(pull(&sub1, 1, "1st", timeout)?);
            let mut third = pull(&sub3, 3, "3rd", timeout)?;
            third.extend(pull(&sub3, 1, "3rd", timeout)?);
            third.extend(pull(&sub3, 1, "3rd", timeout)?);
            finish(&sub3, "3rd", timeout)?;
            second.extend(pull(&sub2, 3, "2nd", timeout)?);
            finish(&sub2, "2nd", timeout)?;
            first.extend(pull(&sub1, 2, "1st", timeout)?);
            first.extend(pull(&sub1, 1, "1st", timeout)?);
            finish(&sub1, "1st", timeout)?;

            same_sequence(&first, &second, "1 and 2")?;
            same_sequence(&first, &third, "1 and 3")
        })
    }

    fn many_upfront(&self, publisher: &Arc<dyn Publisher<T>>, completion: bool) -> ScenarioResult {
        let subscribers =
            [self.subscriber(publisher)?, self.subscriber(publisher)?, self.subscriber(publisher)?];
        // A publisher may only notice its source is drained when asked for
        // more than it holds, so ask for one extra.
        for sub in &subscribers {
            sub.request(4)?;
        }
        let mut received = Vec::with_capacity(subscribers.len());
        for sub in &subscribers {
            received.push(sub.next_elements(3)?);
        }
        if completion {
            for sub in &subscribers {
                sub.expect_completion()?;
            }
        }

        same_sequence(&received[0], &received[1], "1 and 2")?;
        same_sequence(&received[1], &received[2], "2 and 3")
    }

    fn spec111_multicast_many_upfront(&self) -> ScenarioResult {
        self.active_publisher_test(3, false, |publisher| self.many_upfront(publisher, false))
    }

    fn spec111_multicast_many_upfront_completing(&self) -> ScenarioResult {
        self.active_publisher_test(3, true, |publisher| self.many_upfront(publisher, true))
    }

    fn spec302_synchronous_request(&self) -> ScenarioResult {
        self.active_publisher_test(6, false, |publisher| {
            let subscriber = EagerRequester::<T>::new(Arc::clone(&self.env));
            publisher.subscribe(subscriber.clone());
            let result = subscriber
                .subscribed
                .expect_close("could not subscribe to publisher: no on_subscribe")
                .and_then(|()| self.env.verify_no_async_errors());
            subscriber.cancel();
            Ok(result?)
        })
    }

    fn spec303_bounded_recursion(&self) -> ScenarioResult {
        let bound = self.caps.bounded_depth_of_on_next_and_request_recursion;
        let elements = bound.saturating_add(1);
        self.active_publisher_test(elements, false, |publisher| {
            let probe = RecursionProbe::<T>::new(Arc::clone(&self.env), bound);
            publisher.subscribe(probe.clone());
            let subscription = probe
                .subscription()
                .expect_completion("could not subscribe to publisher: no on_subscribe")?;

            // Kick off request -> on_next -> request -> ...
            subscription.request(1);
            let result = probe
                .finished
                .expect_close(&format!(
                    "unable to validate call stack depth safety, awaited at most {elements} \
                     signals or completion"
                ))
                .and_then(|()| self.env.verify_no_async_errors_no_delay());
            // The recursion may keep the publisher running forever.
            subscription.cancel();
            Ok(result?)
        })
    }

    fn spec306_request_after_cancel(&self) -> ScenarioResult {
        self.active_publisher_test(3, false, |publisher| {
            let sub = self.subscriber(publisher)?;
            sub.cancel()?;
            sub.request(1)?;
            sub.request(1)?;
            sub.request(1)?;
            sub.expect_none()?;
            Ok(())
        })
    }

    fn spec307_repeated_cancel(&self) -> ScenarioResult {
        self.active_publisher_test(1, false, |publisher| {
            let sub = self.subscriber(publisher)?;
            sub.cancel()?;
            sub.cancel()?;
            sub.cancel()?;
            sub.expect_none()?;
            Ok(())
        })
    }

    fn spec309_request_zero(&self) -> ScenarioResult {
        self.active_publisher_test(10, false, |publisher| {
            let sub = self.subscriber(publisher)?;
            sub.request(0)?;
            sub.expect_error::<NonPositiveRequest>()?;
            Ok(())
        })
    }

    fn spec309_request_negative(&self) -> ScenarioResult {
        self.active_publisher_test(10, false, |publisher| {
            let sub = self.subscriber(publisher)?;
            let n = -rand::thread_rng().gen_range(1..=i64::from(i32::MAX));
            sub.request(n)?;
            sub.expect_error::<NonPositiveRequest>()?;
            Ok(())
        })
    }

    fn spec309_request_negative_message(&self) -> ScenarioResult {
        self.active_publisher_test(10, false, |publisher| {
            let sub = self.subscriber(publisher)?;
            sub.request(-1)?;
            sub.expect_error_with_message::<NonPositiveRequest>(&[
                "3.9",
                "non-positive subscription request",
            ])?;
            Ok(())
        })
    }

    fn spec312_cancel_stops_signalling(&self) -> ScenarioResult {
        self.active_publisher_test(20, false, |publisher| {
            let sub = self.subscriber(publisher)?;
            sub.request(DEMAND_BEFORE_CANCEL)?;
            sub.cancel()?;

            let window = self.env.default_no_signals_timeout();
            let mut signalled = 0_i64;
            while let Some(Delivery::Next(_)) = sub.try_next_within(window) {
                signalled += 1;
                if signalled > DEMAND_BEFORE_CANCEL {
                    return Err(ScenarioError::violation(format!(
                        "publisher signalled {signalled} elements, which is more than the \
                         signalled demand of {DEMAND_BEFORE_CANCEL}"
                    )));
                }
            }
            Ok(())
        })
    }

    fn spec313_cancel_drops_references(&self) -> ScenarioResult {
        self.active_publisher_test(3, false, |publisher| {
            let weak = {
                let sub = self.subscriber(publisher)?;
                sub.request(1)?;
                sub.next_element()?;
                sub.cancel()?;
                drop(sub.release_subscription());
                Arc::downgrade(&sub)
            };

            let released = await_release(
                &weak,
                self.env.publisher_reference_gc_timeout(),
                self.env.default_poll_interval().min(Duration::from_millis(10)),
            );
            if released {
                Ok(())
            } else {
                Err(self
                    .env
                    .flop_and_fail(
                        "publisher did not drop reference to test subscriber after subscription \
                         cancellation",
                    )
                    .into())
            }
        })
    }

    fn spec317_max_demand(&self) -> ScenarioResult {
        self.active_publisher_test(3, true, |publisher| {
            let sub = self.subscriber(publisher)?;
            sub.request(MAX_DEMAND)?;
            sub.next_elements(3)?;
            sub.expect_completion()?;
            Ok(())
        })
    }

    fn spec317_cumulative_max_demand(&self) -> ScenarioResult {
        self.active_publisher_test(3, true, |publisher| {
            let sub = self.subscriber(publisher)?;
            sub.request(MAX_DEMAND / 2)?;
            sub.request(MAX_DEMAND / 2)?;
            sub.request(1)?;
            sub.next_elements(3)?;
            sub.expect_completion()?;
            Ok(())
        })
    }

    fn spec317_no_error_above_max_demand(&self) -> ScenarioResult {
        let elements = u64::from(i32::MAX.unsigned_abs());
        self.active_publisher_test(elements, false, |publisher| {
            let subscriber =
                OverflowingSubscriber::<T>::new(Arc::clone(&self.env), OVERFLOW_REQUEST_CALLS);
            publisher.subscribe(subscriber.clone());
            let subscription = subscriber
                .subscription()
                .expect_completion("could not subscribe to publisher: no on_subscribe")?;

            // Each on_next requests MAX_DEMAND - 1 more; the second call
            // already overflows unless demand saturates.
            subscription.request(1);
            let result = self.env.verify_no_async_errors().map_err(ScenarioError::from);
            subscription.cancel();
            result
        })
    }
}

/// Request `n` elements from `sub` and wait for all of them.
fn pull<T: Element>(
    sub: &ManualSubscriber<T>,
    n: u8,
    which: &str,
    timeout: Duration,
) -> Result<Vec<T>, ScenarioError> {
    sub.request(i64::from(n))?;
    let noun = if n == 1 { "element" } else { "elements" };
    let message = format!("did not produce {n} {noun} on the {which} subscriber");
    Ok(sub.next_elements_within(usize::from(n), timeout, &message)?)
}

/// Request past the end of `sub`'s stream and wait for completion.
fn finish<T: Element>(sub: &ManualSubscriber<T>, which: &str, timeout: Duration) -> ScenarioResult {
    sub.request(1)?;
    let message = format!("did not complete the stream on the {which} subscriber");
    Ok(sub.expect_completion_within(timeout, &message)?)
}

fn same_sequence<T: Element>(left: &[T], right: &[T], which: &str) -> ScenarioResult {
    if left == right {
        Ok(())
    } else {
        Err(ScenarioError::violation(format!(
            "publisher did not produce the same element sequence for subscribers {which}: \
             {left:?} vs {right:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_names_are_unique() {
        let infos = PublisherVerification::<u64>::rules();
        let mut names: Vec<_> = infos.iter().map(|info| info.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), infos.len());
    }

    #[test]
    fn capabilities_feed_run_settings() {
        let caps = PublisherCapabilities::default()
            .with_skip_stochastic_tests(true)
            .with_stochastic_repetitions(7)
            .with_max_supported_subscribers(3);
        let settings = caps.run_settings();

        assert!(settings.skip_stochastic);
        assert_eq!(settings.stochastic_repetitions, 7);
        assert_eq!(settings.max_supported_subscribers, 3);
        assert_eq!(caps.max_elements_from_publisher, UNBOUNDED_ELEMENTS - 1);
    }
}
