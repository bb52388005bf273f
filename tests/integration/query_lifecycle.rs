#![allow(missing_docs)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use cairn::{
    checkpoint::{InMemoryQueryTaskStore, QueryTaskStore},
    config::QueryProperties,
    executor::{ExecutorContext, QueryExecutor, TaskOutcome},
    logic::Payload,
    results::{PageStatus, ResultQueueManager},
    runner::QueryService,
    status::{InMemoryQueryStatusStore, Query, QueryState, QueryStatus, QueryStatusStore},
    testing::{StaticConnector, VecLogicFactory},
    CairnError, QueryId, QueryKey,
};
use serde_json::json;
use tempfile::NamedTempFile;

const LOGIC: &str = "EventQuery";

struct Deployment {
    status: Arc<InMemoryQueryStatusStore>,
    tasks: Arc<InMemoryQueryTaskStore>,
    results: Arc<ResultQueueManager>,
    service: QueryService,
    executor: QueryExecutor,
    factory: Arc<VecLogicFactory>,
}

impl Deployment {
    fn new(properties: QueryProperties, factory: VecLogicFactory) -> Self {
        let status = Arc::new(InMemoryQueryStatusStore::new());
        let tasks = Arc::new(InMemoryQueryTaskStore::new());
        let results = Arc::new(ResultQueueManager::new());
        let factory = Arc::new(factory);
        let service = QueryService::new(
            properties.clone(),
            status.clone(),
            tasks.clone(),
            results.clone(),
        );
        let ctx = ExecutorContext::new(status.clone(), tasks.clone(), factory.clone(), results.clone())
            .properties(properties);
        Self {
            status,
            tasks,
            results,
            service,
            executor: QueryExecutor::new(ctx),
            factory,
        }
    }

    fn define(&self, id: &str, page_size: usize) -> QueryId {
        let key = QueryKey::new(QueryId::new(id), "pool-a", LOGIC);
        let status = QueryStatus::new(
            key.clone(),
            Query::new(LOGIC, "GENRE == 'jazz'").with_page_size(page_size),
        );
        self.service.define(status).expect("define");
        key.query_id
    }

    /// Runs every pending task for the query the way a worker pool would.
    fn run_tasks(&self, id: &QueryId) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::new();
        while let Some(task_key) = self.tasks.tasks_for(id).expect("tasks").first().cloned() {
            outcomes.push(
                self.executor
                    .handle(&task_key, &StaticConnector::default())
                    .expect("task"),
            );
        }
        outcomes
    }
}

fn events(count: usize) -> Vec<Payload> {
    (0..count).map(|i| json!({ "id": i, "genre": "jazz" })).collect()
}

fn load_properties(toml: &str) -> QueryProperties {
    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(toml.as_bytes()).expect("write config");
    QueryProperties::load(file.path()).expect("load config")
}

#[tokio::test(start_paused = true)]
async fn checkpointed_query_is_paged_to_completion_and_closed() {
    let properties = load_properties(
        r#"
        result_poll_rate_ms = 50

        [executor]
        max_results_per_task = 4
        "#,
    );
    assert_eq!(properties.result_poll_rate(), Duration::from_millis(50));
    let deployment = Deployment::new(
        properties,
        VecLogicFactory::new(LOGIC, events(10)).checkpointable(true),
    );
    let id = deployment.define("query-jazz", 3);

    let outcomes = deployment.run_tasks(&id);
    assert_eq!(outcomes.first(), Some(&TaskOutcome::Checkpointed));
    assert_eq!(outcomes.last(), Some(&TaskOutcome::Exhausted));
    assert_eq!(deployment.status.get(&id).expect("status").state, QueryState::Running);

    let logic = deployment.factory.build();
    let mut sizes = Vec::new();
    let mut seen = Vec::new();
    loop {
        let page = deployment.service.next(&id, &logic).await.expect("page");
        assert_eq!(page.status, PageStatus::Complete);
        sizes.push(page.len());
        seen.extend(page.results);
        if sizes.last() != Some(&3) {
            break;
        }
    }
    assert_eq!(sizes, vec![3, 3, 3, 1]);
    assert_eq!(seen, events(10));
    assert_eq!(
        deployment.status.get(&id).expect("status").num_results_returned,
        10
    );

    deployment.service.close(&id).expect("close");
    let closed = deployment.status.get(&id).expect("status");
    assert_eq!(closed.state, QueryState::Closed);
    assert!(!deployment.results.contains(&id));
}

#[tokio::test(start_paused = true)]
async fn non_checkpointable_query_is_exhausted_by_create() {
    let deployment = Deployment::new(
        QueryProperties::default(),
        VecLogicFactory::new(LOGIC, events(4)),
    );
    let id = deployment.define("query-small", 10);
    assert_eq!(deployment.run_tasks(&id), vec![TaskOutcome::Exhausted]);

    let page = deployment
        .service
        .next(&id, &deployment.factory.build())
        .await
        .expect("page");
    assert_eq!(page.results, events(4));
    assert_eq!(deployment.status.get(&id).expect("status").state, QueryState::Created);
}

#[tokio::test(start_paused = true)]
async fn cancel_from_another_actor_ends_a_waiting_page() {
    let deployment = Deployment::new(
        QueryProperties::default(),
        VecLogicFactory::new(LOGIC, events(0)).checkpointable(true),
    );
    let id = deployment.define("query-idle", 5);
    let logic = deployment.factory.build();

    let (page, cancelled) = tokio::join!(deployment.service.next(&id, &logic), async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(deployment.service.in_flight(&id), 1);
        deployment.service.cancel(&id)
    });
    assert_eq!(cancelled, 1);
    let page = page.expect("page");
    assert!(page.is_empty());
    assert_eq!(deployment.service.in_flight(&id), 0);
    assert_eq!(deployment.service.cancel(&id), 0);
}

#[tokio::test(start_paused = true)]
async fn failing_a_query_records_the_error_and_drops_results() {
    let deployment = Deployment::new(
        QueryProperties::default(),
        VecLogicFactory::new(LOGIC, events(3)),
    );
    let id = deployment.define("query-doomed", 10);
    deployment.run_tasks(&id);
    assert!(deployment.results.contains(&id));

    deployment
        .service
        .fail(&id, &CairnError::Unavailable("tablet server lost".into()))
        .expect("fail");
    let status = deployment.status.get(&id).expect("status");
    assert_eq!(status.state, QueryState::Failed);
    assert_eq!(
        status.failure.as_deref(),
        Some("unavailable: tablet server lost")
    );
    assert!(!deployment.results.contains(&id));

    let err = deployment
        .service
        .next(&id, &deployment.factory.build())
        .await
        .expect_err("failed query serves no pages");
    assert!(matches!(err, CairnError::InvariantViolation(_)));
}

#[test]
fn invalid_config_file_is_rejected() {
    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"result_poll_rate_ms = 0\n").expect("write");
    let err = QueryProperties::load(file.path()).expect_err("zero poll rate");
    assert!(matches!(err, CairnError::Config(_)));
}
