//! Subscriber rules checked from the outside only.

use std::sync::Arc;

use flowcheck_core::{
    BlackboxProbe, BlackboxSubscriberProxy, Element, ManualPublisher, TestEnvironment,
};
use flowcheck_proto::{Publisher, Subscriber};

use super::{
    ElementSource, UNTESTED_COMMON, UNTESTED_SUBSCRIPTION, expect_second_subscription_cancelled,
};
use crate::{
    TestSignalError,
    rule::{Rule, RuleInfo, RuleRegistry, ScenarioResult},
    runner::{RuleReport, RunSettings, SuiteReport, run_registry, run_rule},
};

/// Most elements rule 2.1 sends, however much the subscriber requests.
const MAX_SIGNALS_TO_EMIT: i64 = 512;

/// How many elements to send between two cancellation checks.
const CANCEL_SAMPLE_INTERVAL: i64 = 10;

/// Supplies blackbox subscribers under test.
pub trait BlackboxSubscriberFactory<T>: Send + Sync {
    /// A fresh subscriber.
    fn create_subscriber(&self) -> Arc<dyn Subscriber<T>>;

    /// The element at position `id` of generated streams.
    fn create_element(&self, id: u64) -> T;

    /// Make `subscriber` signal demand, for subscribers that do not request
    /// on their own from `on_subscribe`.
    fn trigger_request(&self, subscriber: &Arc<dyn Subscriber<T>>) {
        let _ = subscriber;
    }
}

/// Per-scenario fixture: the subscriber under test, wrapped in a recording
/// proxy, attached to a [`ManualPublisher`].
struct BlackboxStage<T: Element> {
    env: Arc<TestEnvironment>,
    publisher: Arc<ManualPublisher<T>>,
    source: ElementSource<T>,
    probe: Arc<BlackboxProbe<T>>,
    subject: Arc<dyn Subscriber<T>>,
}

/// Blackbox verification suite for one subscriber implementation.
pub struct SubscriberBlackboxVerification<T> {
    env: Arc<TestEnvironment>,
    factory: Arc<dyn BlackboxSubscriberFactory<T>>,
}

impl<T: Element> SubscriberBlackboxVerification<T> {
    /// Suite name used in reports.
    pub const SUITE: &'static str = "subscriber_blackbox";

    /// Create a suite over the subscribers of `factory`.
    pub fn new(env: Arc<TestEnvironment>, factory: Arc<dyn BlackboxSubscriberFactory<T>>) -> Self {
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

    /// Every blackbox subscriber rule.
    pub fn registry() -> RuleRegistry<Self> {
        let mut r = RuleRegistry::new();

        r.add(Rule::required(
            "2.1",
            "must_signal_demand_via_subscription_request",
            "the subscriber requests and copes with what it requested",
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
        r.add(Rule::untested(
            "2.8",
            "must_be_prepared_to_receive_on_next_signals_after_having_called_subscription_cancel",
            "late elements after cancel are tolerated",
            "a blackbox subscriber cannot be made to cancel",
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
        r.add(Rule::untested(
            "3.8",
            "request_must_register_given_number_elements_to_be_produced",
            "requested elements are delivered",
            "delivery is not observable without a probe inside the subscriber",
        ));
        for (id, name, reason) in UNTESTED_COMMON.into_iter().chain(UNTESTED_SUBSCRIPTION) {
            r.add(Rule::untested(id, name, "not mechanically checkable", reason));
        }

        r
    }

    /// Build the stage and run `body` against it.
    fn subscriber_test<F>(&self, body: F) -> ScenarioResult
    where
        F: FnOnce(&BlackboxStage<T>) -> ScenarioResult,
    {
        let env = Arc::clone(&self.env);
        let factory = Arc::clone(&self.factory);
        let source = ElementSource::new(&env, Arc::new(move |id: u64| factory.create_element(id)))?;

        let publisher = ManualPublisher::new(Arc::clone(&env));
        let probe = BlackboxProbe::new(Arc::clone(&env));
        let subject = self.factory.create_subscriber();
        publisher.subscribe(BlackboxSubscriberProxy::new(Arc::clone(&probe), Arc::clone(&subject)));

        let stage = BlackboxStage { env, publisher, source, probe, subject };
        body(&stage)
    }

    fn request_from(&self, stage: &BlackboxStage<T>) -> Result<i64, crate::rule::ScenarioError> {
        self.factory.trigger_request(&stage.subject);
        Ok(stage.publisher.expect_request()?)
    }

    fn spec201_signal_demand(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            let requested = self.request_from(stage)?;
            // Protect against subscribers asking for absurd amounts.
            let to_emit = requested.min(MAX_SIGNALS_TO_EMIT);
            for sent in 0..to_emit {
                if sent % CANCEL_SAMPLE_INTERVAL == 0 && stage.publisher.is_cancelled() {
                    break;
                }
                let element = stage.source.next(&stage.env)?;
                stage.publisher.send_next(element)?;
            }
            // Completing before all demand is served is legal.
            stage.publisher.send_completion()?;
            stage.env.verify_no_async_errors()?;
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

    fn spec209_on_complete_with_request(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            self.request_from(stage)?;
            stage.publisher.send_completion()?;
            stage.probe.expect_completion()?;
            stage.env.verify_no_async_errors()?;
            Ok(())
        })
    }

    fn spec209_on_complete_without_request(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            stage.publisher.send_completion()?;
            self.factory.trigger_request(&stage.subject);
            stage.probe.expect_completion()?;
            stage.probe.expect_none()?;
            stage.env.verify_no_async_errors_no_delay()?;
            Ok(())
        })
    }

    fn spec210_on_error_with_request(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            self.request_from(stage)?;
            let cause = TestSignalError::signal();
            stage.publisher.send_error(Arc::clone(&cause))?;
            stage.probe.expect_error_same(&cause)?;
            stage.env.verify_no_async_errors_no_delay()?;
            Ok(())
        })
    }

    fn spec210_on_error_without_request(&self) -> ScenarioResult {
        self.subscriber_test(|stage| {
            let cause = TestSignalError::signal();
            stage.publisher.send_error(Arc::clone(&cause))?;
            stage.probe.expect_error_same(&cause)?;
            stage.env.verify_no_async_errors_no_delay()?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleLevel;

    #[test]
    fn blackbox_leaves_steering_rules_untested() {
        let infos = SubscriberBlackboxVerification::<u32>::rules();
        let level_of =
            |name: &str| infos.iter().find(|info| info.name == name).map(|info| info.level);

        assert_eq!(
            level_of("request_must_register_given_number_elements_to_be_produced"),
            Some(RuleLevel::Untested)
        );
        assert_eq!(
            level_of("must_signal_demand_via_subscription_request"),
            Some(RuleLevel::Required)
        );
    }
}
