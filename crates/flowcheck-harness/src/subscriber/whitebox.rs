//! Subscriber rules checked through the subscriber's own puppet.

use std::sync::Arc;

use flowcheck_core::{
    Element, ManualPublisher, SubscriberPuppet, TestEnvironment, WhiteboxSubscriberProbe,
};
use flowcheck_proto::{Publisher, SignalError, Subscriber};

use super::{
    ElementSource, UNTESTED_COMMON, UNTESTED_SUBSCRIPTION, expect_second_subscription_cancelled,
};
use crate::{
    TestSignalError,
    rule::{Rule, RuleInfo, RuleRegistry, ScenarioError, ScenarioResult},
    runner::{RuleReport, RunSettings, SuiteReport, run_registry, run_rule},
};

/// Supplies whitebox subscribers under test.
///
/// The subscriber must call [`WhiteboxSubscriberProbe::register_on_subscribe`]
/// from its `on_subscribe` with a puppet driving its subscription, and
/// report every other signal through the matching `register_*` method.
pub trait WhiteboxSubscriberFactory<T>: Send + Sync {
    /// A fresh subscriber reporting to `probe`.
    fn create_subscriber(&self, probe: Arc<WhiteboxSubscriberProbe<T>>) -> Arc<dyn Subscriber<T>>;

    /// The element at position `id` of generated streams.
    fn create_element(&self, id: u64) -> T;
}

/// Per-scenario fixture: the subscriber under test attached to a
/// [`ManualPublisher`], with its puppet registered.
struct WhiteboxStage<T: Element> {
    env: Arc<TestEnvironment>,
    publisher: Arc<ManualPublisher<T>>,
    source: ElementSource<T>,
    probe: Arc<WhiteboxSubscriberProbe<T>>,
    subject: Arc<dyn Subscriber<T>>,
    puppet: Arc<dyn SubscriberPuppet>,
}

impl<T: Element> WhiteboxStage<T> {
    fn puppet(&self) -> &dyn SubscriberPuppet {
        &*self.puppet
    }

    /// Send the next generated element to the subscriber under test.
    fn signal_next(&self) -> Result<T, ScenarioError> {
        let element = self.source.next(&self.env)?;
        self.publisher.send_next(element.clone())?;
        Ok(element)
    }

    fn expect_request(&self) -> Result<i64, ScenarioError> {
        Ok(self.publisher.expect_request()?)
    }
}

/// Whitebox verification suite for one subscriber implementation.
pub struct SubscriberWhiteboxVerification<T> {
    env: Arc<TestEnvironment>,
    factory: Arc<dyn WhiteboxSubscriberFactory<T>>,
}

impl<T: Element> SubscriberWhiteboxVerification<T> {
    /// Suite name used in reports.
    pub const SUITE: &'static str = "subscriber_whitebox";

    /// Create a suite over the subscribers of `factory`.
    pub fn new(env: Arc<TestEnvironment>, factory: Arc<dyn WhiteboxSubscriberFactory<T>>) -> Self {
        Self { env, factory }
    }

    /// Run every rule.
    pub fn run(&self) -> SuiteReport {
        run_registry(Self::SUITE, &self.env, &Self::registry(), self, &RunSettings::default())
    }

    /// Run the rule called `name`, if there is one.
    pub fn run_rule(&self, name: &str) -> Option<RuleReport> {
        let registry = Self::registry();
        let rule = registry.get(name)?;
        Some(run_rule(Self::SUITE, &self.env, rule, self, &RunSettings::default()))
    }

    /// Listing of every rule.
    pub fn rules() -> Vec<RuleInfo> {
        Self::registry().infos()
    }

    /// Every whitebox subscriber rule.
    pub fn registry() -> RuleRegistry<Self> {
        let mut r = RuleRegistry::new();

        r.add(Rule::required(
            "-",
            "exercise_whitebox_happy_path",
            "request, receive and cancel through the puppet",
            Self::happy_path,
        ));
        r.add(Rule::required(
            "2.1",
            "must_signal_demand_via_subscription_request",
            "demand reaches the subscription",
            Self::spec201_signal_demand,
        ));
        r.add(Rule::required(
            "2.3",
            "must_not_call_methods_on_subscription_or_publisher_in_on_complete",
            "no request or cancel from inside on_complete",
            Self::spec203_nothing_in_on_complete,
        ));
        r.add(Rule::required(
            "2.3",
            "must_not_call_methods_on_subscription_or_publisher_in_on_error",
            "no request or cancel from inside on_error",
            Self::spec203_nothing_in_on_error,
        ));
        r.add(Rule::required(
            "2.5",
            "must_call_subscription_cancel_if_it_already_has_a_subscription_and_receives_another",
            "a second subscription is cancelled",
            Self::spec205_cancel_second_subscription,
        ));
        r.add(Rule::required(
            "2.8",
            "must_be_prepared_to_receive_on_next_signals_after_having_called_subscription_cancel",
            "late elements after cancel are tolerated",
            Self::spec208_on_next_after_cancel,
        ));
        r.add(Rule::required(
            "2.9",
            "must_be_prepared_to_receive_an_on_complete_signal_with_preceding_request_call",
            "on_complete is accepted after demand",
            Self::spec209_on_complete_with_request,
        ));
        r.add(Rule::required(
            "2.9",
            "must_be_prepared_to_receive_an_on_complete_signal_without_preceding_request_call",
            "on_complete is accepted without demand",
            Self::spec209_on_complete_without_request,
        ));
        r.add(Rule::required(
            "2.10",
            "must_be_prepared_to_receive_an_on_error_signal_with_preceding_request_call",
            "on_error is accepted after demand",
            Self::spec210_on_error_with_request,
        ));
        r.add(Rule::required(
            "2.10",
            "must_be_prepared_to_receive_an_on_error_signal_without_preceding_request_call",
            "on_error is accepted without demand",
            Self::spec210_on_error_without_request,
        ));
        r.add(Rule::required(
            "3.8",
            "request_must_register_given_number_elements_to_be_produced",
            "requested elements are delivered",
            Self::spec308_request_registers_elements,
        ));
        for (id, name, reason) in UNTESTED_COMMON.into_iter().chain(UNTESTED_SUBSCRIPTION) {
            r.add(Rule::untested(id, name, "not mechanically checkable", reason));
        }

        r
    }

    /// Build the stage and run `body` against it.
    fn subscriber_test<F>(&self, body: F) -> ScenarioResult
    where
        F: FnOnce(&WhiteboxStage<T>) -> ScenarioResult,
    {
        let env = Arc::clone(&self.env);
        let factory = Arc::clone(&self.factory);
        let source = ElementSource::new(&env, Arc::new(move |id: u64| factory.create_element(id)))?;

        let publisher = ManualPublisher::new(Arc::clone(&env));
        let probe = WhiteboxSubscriberProbe::new(Arc::clone(&env));
        let subject = self.factory.create_subscriber(Arc::clone(&probe));
        publisher.subscribe(Arc::clone(&subject));
        let puppet = probe.puppet()?;
        env.verify_no_async_errors_no_delay()?;

        let stage = WhiteboxStage { env, publisher, source, probe, subject, puppet };
        body(&stage)
    }

    fn happy_path(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            stage.puppet().trigger_request(1);
            stage.puppet().trigger_request(1);
            let requested = stage.expect_request()?;
            let first = stage.signal_next()?;
            stage.probe.expect_next(first)?;

            stage.puppet().trigger_request(1);
            // Some subscribers coalesce the first two requests.
            if requested == 1 {
                stage.expect_request()?;
            }
            let second = stage.signal_next()?;
            stage.probe.expect_next(second)?;

            stage.puppet().signal_cancel();
            stage.publisher.expect_cancelling()?;
            stage.env.verify_no_async_errors()?;
            Ok(())
        })
    }

    fn spec201_signal_demand(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            stage.puppet().trigger_request(1);
            stage.expect_request()?;
            let element = stage.signal_next()?;
            stage.probe.expect_next(element)?;
            Ok(())
        })
    }

    fn spec203_nothing_in_on_complete(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            stage.publisher.send_completion()?;
            stage.probe.expect_completion()?;
            stage.env.verify_no_async_errors()?;
            Ok(())
        })
    }

    fn spec203_nothing_in_on_error(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            let cause = TestSignalError::signal();
            stage.publisher.send_error(Arc::clone(&cause))?;
            stage.probe.expect_error_same(&cause)?;
            stage.env.verify_no_async_errors()?;
            Ok(())
        })
    }

    fn spec205_cancel_second_subscription(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            expect_second_subscription_cancelled(&stage.env, &stage.subject)
        })
    }

    fn spec208_on_next_after_cancel(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            stage.puppet().trigger_request(1);
            stage.puppet().signal_cancel();
            stage.publisher.expect_cancelling()?;
            stage.signal_next()?;

            stage.puppet().trigger_request(1);
            stage.puppet().trigger_request(1);
            stage.env.verify_no_async_errors()?;
            Ok(())
        })
    }

    fn spec209_on_complete_with_request(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            stage.puppet().trigger_request(1);
            stage.publisher.send_completion()?;
            stage.probe.expect_completion()?;
            stage.env.verify_no_async_errors()?;
            Ok(())
        })
    }

    fn spec209_on_complete_without_request(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            stage.publisher.send_completion()?;
            stage.probe.expect_completion()?;
            stage.env.verify_no_async_errors()?;
            Ok(())
        })
    }

    fn expect_error_delivered(stage: &WhiteboxStage<T>, cause: &SignalError) -> ScenarioResult {
        stage.publisher.send_error(Arc::clone(cause))?;
        stage.probe.expect_error_same(cause)?;
        stage.env.verify_no_async_errors_no_delay()?;
        Ok(())
    }

    fn spec210_on_error_with_request(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            stage.puppet().trigger_request(1);
            stage.puppet().trigger_request(1);
            Self::expect_error_delivered(stage, &TestSignalError::signal())
        })
    }

    fn spec210_on_error_without_request(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            Self::expect_error_delivered(stage, &TestSignalError::signal())
        })
    }

    fn spec308_request_registers_elements(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            stage.puppet().trigger_request(2);
            let requested = stage.expect_request()?;
            let first = stage.signal_next()?;
            stage.probe.expect_next(first)?;

            // Some subscribers only request one element at a time.
            if requested < 2 {
                stage.expect_request()?;
            }
            let second = stage.signal_next()?;
            stage.probe.expect_next(second)?;
            stage.probe.expect_none()?;

            stage.puppet().trigger_request(3);
            stage.env.verify_no_async_errors()?;
            Ok(())
        })
    }
}
