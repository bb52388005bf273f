#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use cairn::{
    config::{ExpirationProperties, QueryProperties},
    logic::LogicLimits,
    metrics::Lifecycle,
    results::{PageStatus, ResultPublisher, ResultQueueManager},
    runner::{NextCall, StopReason},
    status::{InMemoryQueryStatusStore, Query, QueryStatus, QueryStatusStore},
    testing::VecLogicFactory,
    QueryId, QueryKey,
};
use proptest::prelude::*;
use serde_json::{json, Value};
use tokio::time::Instant;

struct Fixture {
    store: Arc<InMemoryQueryStatusStore>,
    results: ResultQueueManager,
    id: QueryId,
}

impl Fixture {
    fn new(query: Query) -> Self {
        let id = QueryId::new("paged-query");
        let store = Arc::new(InMemoryQueryStatusStore::new());
        store
            .create(QueryStatus::new(
                QueryKey::new(id.clone(), "pool-a", "Vec"),
                query,
            ))
            .expect("create status");
        Self {
            store,
            results: ResultQueueManager::new(),
            id,
        }
    }

    fn publisher(&self) -> ResultPublisher {
        self.results.publisher(&self.id)
    }

    fn call(&self, properties: &QueryProperties, limits: LogicLimits) -> NextCall {
        let logic = VecLogicFactory::new("Vec", Vec::new()).limits(limits).build();
        NextCall::new(properties, self.store.clone(), &self.results, &self.id, &logic)
            .expect("build next call")
    }
}

fn page_limits(max_page_size: usize) -> LogicLimits {
    LogicLimits {
        max_page_size,
        ..LogicLimits::default()
    }
}

/// A JSON string whose encoding is exactly `bytes` long.
fn sized(bytes: usize) -> Value {
    json!("x".repeat(bytes - 2))
}

fn properties_with_timeout(
    call_timeout_ms: u64,
    check_ms: u64,
    hard_ms: u64,
) -> QueryProperties {
    QueryProperties {
        expiration: ExpirationProperties {
            call_timeout_ms,
            short_circuit_check_time_ms: check_ms,
            short_circuit_timeout_ms: hard_ms,
        },
        ..QueryProperties::default()
    }
}

#[tokio::test(start_paused = true)]
async fn byte_trigger_returns_partial_page() {
    let fx = Fixture::new(Query::new("Vec", "x").with_page_size(10));
    let publisher = fx.publisher();
    for _ in 0..3 {
        publisher.publish(sized(400)).expect("publish");
    }
    let limits = LogicLimits {
        max_page_size: 10,
        page_byte_trigger: 1000,
        ..LogicLimits::default()
    };
    let call = fx.call(&QueryProperties::default(), limits);
    let handle = call.handle();

    let page = call.call().await.expect("page");
    assert_eq!(page.len(), 2);
    assert_eq!(page.status, PageStatus::Partial);
    assert_eq!(handle.metric().stop_reason(), Some(StopReason::PageBytes));
    assert_eq!(handle.metric().lifecycle(), Lifecycle::Results);

    // the result that would have crossed the trigger opens the next page
    publisher.finish().expect("finish");
    let rest = fx.call(&QueryProperties::default(), limits).call().await.expect("page");
    assert_eq!(rest.results, vec![sized(400)]);
    assert_eq!(rest.status, PageStatus::Complete);
}

#[tokio::test(start_paused = true)]
async fn byte_trigger_fills_the_page_up_to_the_threshold() {
    let fx = Fixture::new(Query::new("Vec", "x").with_page_size(10));
    let publisher = fx.publisher();
    for bytes in [600, 100, 100, 400, 1500] {
        publisher.publish(sized(bytes)).expect("publish");
    }
    publisher.finish().expect("finish");
    let limits = LogicLimits {
        max_page_size: 10,
        page_byte_trigger: 1000,
        ..LogicLimits::default()
    };

    let call = fx.call(&QueryProperties::default(), limits);
    let handle = call.handle();
    let page = call.call().await.expect("first page");
    assert_eq!(page.results, vec![sized(600), sized(100), sized(100)]);
    assert_eq!(page.status, PageStatus::Partial);
    assert_eq!(handle.metric().stop_reason(), Some(StopReason::PageBytes));

    let page = fx.call(&QueryProperties::default(), limits).call().await.expect("second page");
    assert_eq!(page.results, vec![sized(400)]);
    assert_eq!(page.status, PageStatus::Partial);

    // a single result above the trigger still makes progress
    let call = fx.call(&QueryProperties::default(), limits);
    let handle = call.handle();
    let page = call.call().await.expect("third page");
    assert_eq!(page.results, vec![sized(1500)]);
    assert_eq!(handle.metric().stop_reason(), Some(StopReason::PageBytes));

    let page = fx.call(&QueryProperties::default(), limits).call().await.expect("last page");
    assert!(page.is_empty());
    assert_eq!(page.status, PageStatus::Complete);
}

#[tokio::test(start_paused = true)]
async fn end_of_stream_returns_complete_page() {
    let fx = Fixture::new(Query::new("Vec", "x").with_page_size(10));
    let publisher = fx.publisher();
    for i in 0..3 {
        publisher.publish(json!(i)).expect("publish");
    }
    publisher.finish().expect("finish");

    let call = fx.call(&QueryProperties::default(), page_limits(10));
    let handle = call.handle();
    let page = call.call().await.expect("page");
    assert_eq!(page.results, vec![json!(0), json!(1), json!(2)]);
    assert_eq!(page.status, PageStatus::Complete);
    assert_eq!(handle.metric().stop_reason(), Some(StopReason::EndOfStream));
}

#[tokio::test(start_paused = true)]
async fn caller_page_size_outranks_byte_trigger() {
    let fx = Fixture::new(Query::new("Vec", "x").with_page_size(2));
    let publisher = fx.publisher();
    for _ in 0..3 {
        publisher.publish(sized(400)).expect("publish");
    }
    let limits = LogicLimits {
        max_page_size: 10,
        page_byte_trigger: 800,
        ..LogicLimits::default()
    };
    let call = fx.call(&QueryProperties::default(), limits);
    let handle = call.handle();
    let page = call.call().await.expect("page");
    assert_eq!(page.len(), 2);
    assert_eq!(page.status, PageStatus::Complete);
    assert_eq!(handle.metric().stop_reason(), Some(StopReason::UserPageSize));
}

#[tokio::test(start_paused = true)]
async fn cancellation_returns_accumulated_results_within_a_poll() {
    let fx = Fixture::new(Query::new("Vec", "x").with_page_size(10));
    let publisher = fx.publisher();
    publisher.publish(json!("a")).expect("publish");
    publisher.publish(json!("b")).expect("publish");

    let properties = QueryProperties::default();
    let call = fx.call(&properties, page_limits(10));
    let handle = call.handle();
    let running = tokio::spawn(call.call());

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(!running.is_finished());
    let cancelled_at = Instant::now();
    handle.cancel();
    let page = running.await.expect("join").expect("page");

    assert!(cancelled_at.elapsed() <= properties.result_poll_rate());
    assert_eq!(page.results, vec![json!("a"), json!("b")]);
    assert_eq!(page.status, PageStatus::Complete);
    assert_eq!(handle.metric().lifecycle(), Lifecycle::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn slow_page_short_circuits_on_result_rate() {
    let fx = Fixture::new(Query::new("Vec", "x").with_page_size(10));
    fx.publisher().publish(json!(1)).expect("publish");

    let call = fx.call(&properties_with_timeout(10_000, 5_000, 9_700), page_limits(10));
    let handle = call.handle();
    let started = Instant::now();
    let page = call.call().await.expect("page");

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(5_000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(6_000), "{elapsed:?}");
    assert_eq!(page.len(), 1);
    assert_eq!(page.status, PageStatus::Partial);
    assert_eq!(handle.metric().stop_reason(), Some(StopReason::ShortCircuit));
    assert_eq!(handle.metric().lifecycle(), Lifecycle::NextTimeout);
}

#[tokio::test(start_paused = true)]
async fn nearly_full_page_stops_at_hard_timeout() {
    let fx = Fixture::new(Query::new("Vec", "x").with_page_size(10));
    let publisher = fx.publisher();
    for i in 0..9 {
        publisher.publish(json!(i)).expect("publish");
    }

    let call = fx.call(&properties_with_timeout(10_000, 5_000, 6_000), page_limits(10));
    let started = Instant::now();
    let page = call.call().await.expect("page");

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(6_000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(7_000), "{elapsed:?}");
    assert_eq!(page.len(), 9);
    assert_eq!(page.status, PageStatus::Partial);
}

#[tokio::test(start_paused = true)]
async fn empty_page_never_short_circuits() {
    let fx = Fixture::new(Query::new("Vec", "x").with_page_size(10));
    let call = fx.call(&properties_with_timeout(1_000, 500, 970), page_limits(10));
    let handle = call.handle();
    let running = tokio::spawn(call.call());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!running.is_finished(), "empty page must keep waiting");

    handle.cancel();
    let page = running.await.expect("join").expect("page");
    assert!(page.is_empty());
    assert_eq!(page.status, PageStatus::Complete);
}

#[tokio::test(start_paused = true)]
async fn max_results_counts_previously_returned() {
    let fx = Fixture::new(Query::new("Vec", "x").with_page_size(10));
    fx.store
        .add_results_returned(&fx.id, 8)
        .expect("record returned");
    let publisher = fx.publisher();
    for i in 0..5 {
        publisher.publish(json!(i)).expect("publish");
    }
    let limits = LogicLimits {
        max_page_size: 10,
        max_results: 10,
        ..LogicLimits::default()
    };
    let call = fx.call(&QueryProperties::default(), limits);
    let handle = call.handle();
    let page = call.call().await.expect("page");
    assert_eq!(page.len(), 2);
    assert_eq!(page.status, PageStatus::Complete);
    assert_eq!(handle.metric().lifecycle(), Lifecycle::MaxResults);
}

#[tokio::test(start_paused = true)]
async fn max_work_stops_before_results() {
    let fx = Fixture::new(Query::new("Vec", "x").with_page_size(10));
    fx.publisher().publish(json!(1)).expect("publish");
    let limits = LogicLimits {
        max_page_size: 10,
        max_work: 100,
        ..LogicLimits::default()
    };
    let call = fx.call(&QueryProperties::default(), limits);
    let handle = call.handle();
    handle.metric().record_next(60);
    handle.metric().record_seek(40);

    let page = call.call().await.expect("page");
    assert!(page.is_empty());
    assert_eq!(handle.metric().work(), 100);
    assert_eq!(handle.metric().lifecycle(), Lifecycle::MaxWork);
}

#[tokio::test(start_paused = true)]
async fn override_can_lower_the_logic_limit() {
    let fx = Fixture::new(
        Query::new("Vec", "x")
            .with_page_size(10)
            .with_max_results_override(1),
    );
    let publisher = fx.publisher();
    publisher.publish(json!(1)).expect("publish");
    publisher.publish(json!(2)).expect("publish");
    let limits = LogicLimits {
        max_page_size: 10,
        max_results: 50,
        ..LogicLimits::default()
    };
    let call = fx.call(&QueryProperties::default(), limits);
    assert_eq!(call.max_results(), 1);
    let page = call.call().await.expect("page");
    assert_eq!(page.results, vec![json!(1)]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn page_never_exceeds_smaller_page_size(
        user in 1usize..20,
        logic in 1usize..20,
        published in 0usize..40,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("runtime");
        let page = runtime.block_on(async {
            let fx = Fixture::new(Query::new("Vec", "x").with_page_size(user));
            let publisher = fx.publisher();
            for i in 0..published {
                publisher.publish(json!(i)).expect("publish");
            }
            publisher.finish().expect("finish");
            fx.call(&QueryProperties::default(), page_limits(logic))
                .call()
                .await
                .expect("page")
        });
        prop_assert!(page.len() <= user.min(logic));
        prop_assert_eq!(page.len(), published.min(user.min(logic)));
        prop_assert_eq!(page.status, PageStatus::Complete);
    }
}
