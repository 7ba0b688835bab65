//! Rules for identity processors.
//!
//! An identity processor is checked three ways:
//!
//! - as a publisher, by subscribing it to a [`HelperPublisher`] and running
//!   every [`PublisherVerification`] rule against its downstream side;
//! - as a subscriber, by attaching a probe-reporting subscriber downstream
//!   and running every [`SubscriberWhiteboxVerification`] rule against its
//!   upstream side;
//! - with its own fan-out rules, which need at least two concurrent
//!   subscribers.
//!
//! Merged reports name the composed rules `publisher::<rule>` and
//! `subscriber::<rule>`.

use std::sync::Arc;

use flowcheck_core::{
    Element, ElementFactory, HelperPublisher, ManualPublisher, ManualSubscriber, SubscriberPuppet,
    TEST_BUFFER_SIZE, TestEnvironment, WhiteboxSubscriberProbe,
};
use flowcheck_proto::{Processor, Publisher, SignalError, Subscriber, Subscription};
use tracing::debug;

use crate::{
    TestSignalError,
    publisher::{PublisherCapabilities, PublisherFactory, PublisherVerification, UNBOUNDED_ELEMENTS},
    rule::{Rule, RuleInfo, RuleRegistry, ScenarioError, ScenarioResult},
    runner::{RuleReport, SuiteReport, run_registry, run_rule},
    subscriber::{ElementSource, SubscriberWhiteboxVerification, WhiteboxSubscriberFactory},
};

/// Stochastic repetitions when the factory declares no capabilities.
pub const PROCESSOR_STOCHASTIC_REPETITIONS: u32 = 10;

/// Prefix of the composed publisher rules in merged reports.
const PUBLISHER_PREFIX: &str = "publisher";

/// Prefix of the composed subscriber rules in merged reports.
const SUBSCRIBER_PREFIX: &str = "subscriber";

/// Supplies identity processors under test.
pub trait ProcessorFactory<T>: Send + Sync {
    /// A fresh processor that passes elements through unchanged, buffering
    /// at least `buffer_size` of them.
    fn create_identity_processor(&self, buffer_size: usize) -> Arc<dyn Processor<T>>;

    /// A publisher that signals `on_subscribe` followed by `on_error` to
    /// every subscriber. `None` skips the rules that need one.
    fn create_failed_publisher(&self) -> Option<Arc<dyn Publisher<T>>> {
        None
    }

    /// The element at position `id` of generated streams.
    fn create_element(&self, id: u64) -> T;

    /// Declared limitations of the processor's downstream side.
    fn capabilities(&self) -> PublisherCapabilities {
        PublisherCapabilities::default()
            .with_stochastic_repetitions(PROCESSOR_STOCHASTIC_REPETITIONS)
    }
}

fn element_factory<T: Element>(factory: &Arc<dyn ProcessorFactory<T>>) -> ElementFactory<T> {
    let factory = Arc::clone(factory);
    Arc::new(move |id: u64| factory.create_element(id))
}

/// A processor together with the helper feeding it.
///
/// Dropping it cancels the feed, so the helper's worker ends with the
/// scenario even when nothing downstream cancelled.
struct FedProcessor<T: Element> {
    processor: Arc<dyn Publisher<T>>,
    upstream: Arc<HelperPublisher<T>>,
}

impl<T: Element> Publisher<T> for FedProcessor<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.processor.subscribe(subscriber);
    }
}

impl<T: Element> Drop for FedProcessor<T> {
    fn drop(&mut self) {
        self.upstream.cancel_all();
    }
}

/// Processor fed by a [`HelperPublisher`], seen as a publisher.
struct FedProcessors<T> {
    factory: Arc<dyn ProcessorFactory<T>>,
    caps: PublisherCapabilities,
    buffer_size: usize,
}

impl<T: Element> PublisherFactory<T> for FedProcessors<T> {
    fn create_publisher(&self, elements: u64) -> Arc<dyn Publisher<T>> {
        let processor = self.factory.create_identity_processor(self.buffer_size);
        let elements_of = element_factory(&self.factory);
        let upstream = if elements == UNBOUNDED_ELEMENTS {
            HelperPublisher::unbounded(elements_of)
        } else {
            HelperPublisher::new(elements, elements_of)
        };
        let subscriber: Arc<dyn Subscriber<T>> = processor.clone();
        upstream.subscribe(subscriber);
        let processor: Arc<dyn Publisher<T>> = processor;
        Arc::new(FedProcessor { processor, upstream })
    }

    fn create_failed_publisher(&self) -> Option<Arc<dyn Publisher<T>>> {
        self.factory.create_failed_publisher()
    }

    fn capabilities(&self) -> PublisherCapabilities {
        self.caps
    }
}

/// Processor with a [`ProbeForwarder`] downstream, seen as a whitebox
/// subscriber.
struct ProbedProcessors<T> {
    factory: Arc<dyn ProcessorFactory<T>>,
    buffer_size: usize,
}

impl<T: Element> WhiteboxSubscriberFactory<T> for ProbedProcessors<T> {
    fn create_subscriber(&self, probe: Arc<WhiteboxSubscriberProbe<T>>) -> Arc<dyn Subscriber<T>> {
        let processor = self.factory.create_identity_processor(self.buffer_size);
        processor.subscribe(Arc::new(ProbeForwarder { probe }));
        processor
    }

    fn create_element(&self, id: u64) -> T {
        self.factory.create_element(id)
    }
}

/// Downstream subscriber that reports everything the processor emits to a
/// whitebox probe, and lets the probe steer the downstream subscription.
struct ProbeForwarder<T> {
    probe: Arc<WhiteboxSubscriberProbe<T>>,
}

impl<T: Element> Subscriber<T> for ProbeForwarder<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.probe.register_on_subscribe(Arc::new(DownstreamPuppet { subscription }));
    }

    fn on_next(&self, element: T) {
        self.probe.register_on_next(element);
    }

    fn on_error(&self, error: SignalError) {
        self.probe.register_on_error(error);
    }

    fn on_complete(&self) {
        self.probe.register_on_complete();
    }
}

/// Demand on the processor's downstream side turns into upstream demand.
struct DownstreamPuppet {
    subscription: Arc<dyn Subscription>,
}

impl SubscriberPuppet for DownstreamPuppet {
    fn trigger_request(&self, n: i64) {
        self.subscription.request(n);
    }

    fn signal_cancel(&self) {
        self.subscription.cancel();
    }
}

/// Per-scenario fixture: a processor under test fed by a
/// [`ManualPublisher`].
struct ProcessorStage<T: Element> {
    env: Arc<TestEnvironment>,
    upstream: Arc<ManualPublisher<T>>,
    source: ElementSource<T>,
    processor: Arc<dyn Publisher<T>>,
}

impl<T: Element> ProcessorStage<T> {
    fn subscriber(&self) -> Result<Arc<ManualSubscriber<T>>, ScenarioError> {
        Ok(self.env.new_manual_subscriber(&*self.processor)?)
    }

    fn error_collecting_subscriber(&self) -> Result<Arc<ManualSubscriber<T>>, ScenarioError> {
        let subscriber = ManualSubscriber::with_error_collection(Arc::clone(&self.env));
        self.env.subscribe(&*self.processor, &subscriber)?;
        Ok(subscriber)
    }

    fn expect_request(&self) -> Result<i64, ScenarioError> {
        Ok(self.upstream.expect_request()?)
    }

    /// Send the next generated element into the processor.
    fn send_next_from_upstream(&self) -> Result<T, ScenarioError> {
        let element = self.source.next(&self.env)?;
        self.upstream.send_next(element.clone())?;
        Ok(element)
    }

    fn expect_next(
        &self,
        sub: &ManualSubscriber<T>,
        expected: &T,
        context: &str,
    ) -> ScenarioResult {
        let actual = sub.next_element_within(self.env.default_timeout(), context)?;
        if actual == *expected {
            Ok(())
        } else {
            let message = format!("{context}: expected element {expected:?} but got {actual:?}");
            Err(self.env.flop_and_fail(message).into())
        }
    }
}

/// Verification suite for one identity processor implementation.
pub struct IdentityProcessorVerification<T> {
    env: Arc<TestEnvironment>,
    factory: Arc<dyn ProcessorFactory<T>>,
    caps: PublisherCapabilities,
    buffer_size: usize,
}

impl<T: Element> IdentityProcessorVerification<T> {
    /// Suite name used in reports.
    pub const SUITE: &'static str = "identity_processor";

    /// Create a suite over the processors of `factory`, built with
    /// [`TEST_BUFFER_SIZE`].
    pub fn new(env: Arc<TestEnvironment>, factory: Arc<dyn ProcessorFactory<T>>) -> Self {
        let caps = factory.capabilities();
        Self { env, factory, caps, buffer_size: TEST_BUFFER_SIZE }
    }

    /// Build processors with `buffer_size` instead.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Declared capabilities.
    pub fn capabilities(&self) -> &PublisherCapabilities {
        &self.caps
    }

    /// The publisher suite, run against processors fed by a helper
    /// publisher.
    pub fn publisher_verification(&self) -> PublisherVerification<T> {
        PublisherVerification::new(
            Arc::clone(&self.env),
            Arc::new(FedProcessors {
                factory: Arc::clone(&self.factory),
                caps: self.caps,
                buffer_size: self.buffer_size,
            }),
        )
    }

    /// The whitebox subscriber suite, run against processors with a
    /// probe-reporting subscriber downstream.
    pub fn subscriber_verification(&self) -> SubscriberWhiteboxVerification<T> {
        SubscriberWhiteboxVerification::new(
            Arc::clone(&self.env),
            Arc::new(ProbedProcessors {
                factory: Arc::clone(&self.factory),
                buffer_size: self.buffer_size,
            }),
        )
    }

    /// Run the processor rules, then both composed suites.
    pub fn run(&self) -> SuiteReport {
        let settings = self.caps.run_settings();
        let mut report = run_registry(Self::SUITE, &self.env, &Self::registry(), self, &settings);
        debug!(suite = Self::SUITE, "running composed publisher rules");
        report.merge(PUBLISHER_PREFIX, self.publisher_verification().run());
        debug!(suite = Self::SUITE, "running composed subscriber rules");
        report.merge(SUBSCRIBER_PREFIX, self.subscriber_verification().run());
        report
    }

    /// Run the rule called `name`, if there is one. Composed rules are
    /// addressed with their `publisher::` or `subscriber::` prefix.
    pub fn run_rule(&self, name: &str) -> Option<RuleReport> {
        let prefixed = |prefix: &str, mut report: RuleReport| {
            report.name = format!("{prefix}::{}", report.name);
            report
        };

        if let Some(rest) = name.strip_prefix("publisher::") {
            return self
                .publisher_verification()
                .run_rule(rest)
                .map(|report| prefixed(PUBLISHER_PREFIX, report));
        }
        if let Some(rest) = name.strip_prefix("subscriber::") {
            return self
                .subscriber_verification()
                .run_rule(rest)
                .map(|report| prefixed(SUBSCRIBER_PREFIX, report));
        }

        let registry = Self::registry();
        let rule = registry.get(name)?;
        Some(run_rule(Self::SUITE, &self.env, rule, self, &self.caps.run_settings()))
    }

    /// Listing of every rule, composed ones included.
    pub fn rules() -> Vec<RuleInfo> {
        let prefixed = |prefix: &'static str, infos: Vec<RuleInfo>| {
            infos.into_iter().map(move |mut info| {
                info.name = format!("{prefix}::{}", info.name);
                info
            })
        };

        let mut infos = Self::registry().infos();
        infos.extend(prefixed(PUBLISHER_PREFIX, PublisherVerification::<T>::rules()));
        infos.extend(prefixed(SUBSCRIBER_PREFIX, SubscriberWhiteboxVerification::<T>::rules()));
        infos
    }

    /// The processor's own rules.
    pub fn registry() -> RuleRegistry<Self> {
        let mut r = RuleRegistry::new();

        r.add(
            Rule::required(
                "1.4",
                "must_call_on_error_on_all_its_subscribers_if_it_encounters_a_non_recoverable_error",
                "an upstream error reaches every downstream subscriber",
                Self::spec104_error_reaches_every_subscriber,
            )
            .with_subscribers(2),
        );
        r.add(
            Rule::required(
                "-",
                "must_request_from_upstream_for_elements_that_have_been_requested_long_ago",
                "downstream demand keeps being served after a second subscriber joins",
                Self::request_from_upstream_for_old_demand,
            )
            .with_subscribers(2),
        );

        r
    }

    /// Build the stage and run `body` against it.
    fn processor_test<F>(&self, body: F) -> ScenarioResult
    where
        F: FnOnce(&ProcessorStage<T>) -> ScenarioResult,
    {
        let env = Arc::clone(&self.env);
        let source = ElementSource::new(&env, element_factory(&self.factory))?;

        let upstream = ManualPublisher::new(Arc::clone(&env));
        let processor = self.factory.create_identity_processor(self.buffer_size);
        let subscriber: Arc<dyn Subscriber<T>> = processor.clone();
        upstream.subscribe(subscriber);
        let processor: Arc<dyn Publisher<T>> = processor;

        let stage = ProcessorStage { env, upstream, source, processor };
        body(&stage)
    }

    fn spec104_error_reaches_every_subscriber(&self) -> ScenarioResult {
        self.processor_test(|stage| {
            let sub1 = stage.error_collecting_subscriber()?;
            let sub2 = stage.error_collecting_subscriber()?;

            sub1.request(1)?;
            stage.expect_request()?;
            let x = stage.send_next_from_upstream()?;
            stage.expect_next(&sub1, &x, "processor did not pass the first element downstream")?;
            sub1.request(1)?;

            // sub1 has one pending demand, sub2 never requested.
            let cause = TestSignalError::signal();
            stage.upstream.send_error(Arc::clone(&cause))?;
            for (which, sub) in [("first", &sub1), ("second", &sub2)] {
                let received = sub.expect_error::<TestSignalError>()?;
                if !Arc::ptr_eq(&received, &cause) {
                    return Err(stage
                        .env
                        .flop_and_fail(format!(
                            "{which} subscriber received an error other than the upstream one: \
                             [{received}]"
                        ))
                        .into());
                }
            }
            stage.env.verify_no_async_errors()?;
            Ok(())
        })
    }

    fn request_from_upstream_for_old_demand(&self) -> ScenarioResult {
        let coordinated = self.caps.does_coordinated_emission;
        self.processor_test(|stage| {
            let sub1 = stage.subscriber()?;
            sub1.request(20)?;

            let mut total_requests = stage.expect_request()?;
            let x = stage.send_next_from_upstream()?;
            stage.expect_next(&sub1, &x, "processor did not pass the first element downstream")?;

            if total_requests == 1 {
                total_requests += stage.expect_request()?;
            }
            let y = stage.send_next_from_upstream()?;
            stage.expect_next(&sub1, &y, "processor did not pass the second element downstream")?;

            if total_requests == 2 {
                total_requests += stage.expect_request()?;
            }

            // sub1 has 18 pending, sub2 has none.
            let sub2 = stage.subscriber()?;
            if coordinated {
                sub2.expect_none()?;
                sub2.request(1)?;
                let z = stage.send_next_from_upstream()?;
                let lost = "processor did not pass the third element downstream";
                stage.expect_next(&sub1, &z, lost)?;
                stage.expect_next(
                    &sub2,
                    &z,
                    "processor did not pass the third element to the late subscriber",
                )?;
            } else {
                let z = stage.send_next_from_upstream()?;
                stage.expect_next(
                    &sub1,
                    &z,
                    "processor must not hold back elements from a subscriber with pending demand",
                )?;
                sub2.expect_none()?;
                sub2.request(1)?;
                stage.expect_next(
                    &sub2,
                    &z,
                    "processor did not pass the third element to the late subscriber",
                )?;
            }

            if total_requests == 3 {
                stage.expect_request()?;
            }
            stage.env.verify_no_async_errors()?;

            sub1.cancel()?;
            sub2.cancel()?;
            Ok(())
        })
    }
}
