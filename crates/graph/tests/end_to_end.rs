//! Whole jobs and batch orders, run on the engine with in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::runtime::Handle;

use partchain_core::{BatchState, ItemKey, JobId, JobState, ProcessStep};
use partchain_graph::testing::{InMemoryRegistry, ItemGraphFixture};
use partchain_graph::{
    BatchOrderError, DigitalTwinRegistry, FetchError, ItemGraphEngine, ItemGraphJob, QueryError,
    RegisterBatchOrder, RegisterJob, Shell,
};
use partchain_jobs::{BlobPersistence, JobConfig, RetryPolicy};

const ROOT: &str = "urn:uuid:vehicle";
const ENGINE: &str = "urn:uuid:engine";
const GEARBOX: &str = "urn:uuid:gearbox";
const PISTON_1: &str = "urn:uuid:piston-1";
const PISTON_2: &str = "urn:uuid:piston-2";

fn config() -> JobConfig {
    JobConfig::default()
        .with_worker_pool_size(4)
        .with_retry_policy(RetryPolicy::fixed(3, Duration::from_millis(10)))
}

fn supply_chain() -> ItemGraphFixture {
    let fixture = ItemGraphFixture::new();
    fixture
        .link(ROOT, ENGINE)
        .link(ROOT, GEARBOX)
        .link(ENGINE, PISTON_1)
        .link(ENGINE, PISTON_2);
    fixture
}

fn engine_for(fixture: &ItemGraphFixture) -> ItemGraphEngine {
    ItemGraphEngine::builder(config(), fixture.submodels.clone())
        .with_registry(fixture.registry.clone())
        .build(Handle::current())
}

async fn wait_for_terminal(engine: &ItemGraphEngine, job_id: JobId) -> ItemGraphJob {
    for _ in 0..500 {
        let job = engine.query.get_job(job_id, true).unwrap();
        if job.job.state.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not finish");
}

fn ids(shells: &[Shell]) -> Vec<&str> {
    let mut ids: Vec<_> = shells.iter().map(|s| s.global_asset_id.as_str()).collect();
    ids.sort();
    ids
}

/// Delays lookups of one item; everything else goes to the inner registry.
struct SlowRegistry {
    inner: Arc<InMemoryRegistry>,
    slow_item: &'static str,
    delay: Duration,
}

#[async_trait]
impl DigitalTwinRegistry for SlowRegistry {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn lookup_shell(&self, key: &ItemKey) -> Result<Shell, FetchError> {
        if key.global_asset_id == self.slow_item {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.lookup_shell(key).await
    }
}

fn slow_engine(fixture: &ItemGraphFixture, slow_item: &'static str) -> ItemGraphEngine {
    ItemGraphEngine::builder(config(), fixture.submodels.clone())
        .with_registry(Arc::new(SlowRegistry {
            inner: fixture.registry.clone(),
            slow_item,
            delay: Duration::from_secs(3600),
        }))
        .build(Handle::current())
}

#[tokio::test(start_paused = true)]
async fn unreachable_branch_becomes_a_tombstone_and_the_job_completes() {
    let fixture = supply_chain();
    fixture
        .registry
        .fail_lookup(GEARBOX, FetchError::Transport("connection refused".into()));
    let engine = engine_for(&fixture);

    let request = RegisterJob::new(ItemGraphFixture::key(ROOT)).with_depth(2);
    let response = engine.query.register_job(&request).unwrap();
    assert!(response.is_ok());

    let job = wait_for_terminal(&engine, response.job_id).await;
    assert_eq!(job.job.state, JobState::Completed);
    assert_eq!(ids(&job.graph.shells), vec![ENGINE, PISTON_1, PISTON_2, ROOT]);
    assert_eq!(job.graph.relationships.len(), 4);
    assert_eq!(job.summary.completed, 5);
    assert_eq!(job.summary.running, 0);
    assert_eq!(job.summary.failed, 1);
    assert_eq!(job.discovered_items, 5);

    let tombstone = &job.graph.tombstones[0];
    assert_eq!(tombstone.item_id, GEARBOX);
    assert_eq!(
        tombstone.processing_error.process_step,
        Some(ProcessStep::DigitalTwinRequest)
    );
    assert_eq!(
        tombstone.processing_error.retry_counter,
        config().retry_policy.max_attempts
    );
    assert_eq!(tombstone.processing_error.root_causes.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn depth_limits_the_walk() {
    let fixture = supply_chain();
    let engine = engine_for(&fixture);

    let response = engine
        .query
        .register_job(&RegisterJob::new(ItemGraphFixture::key(ROOT)))
        .unwrap();
    let job = wait_for_terminal(&engine, response.job_id).await;

    assert_eq!(job.job.state, JobState::Completed);
    assert_eq!(ids(&job.graph.shells), vec![ENGINE, GEARBOX, ROOT]);
    assert_eq!(job.graph.relationships.len(), 2);
    assert!(job.graph.tombstones.is_empty());
}

#[tokio::test(start_paused = true)]
async fn requested_aspects_end_up_in_the_graph() {
    let fixture = supply_chain();
    fixture
        .aspect(ROOT, "SerialPart", json!({"catenaXId": ROOT}))
        .aspect(ENGINE, "SerialPart", json!({"catenaXId": ENGINE}))
        .aspect(ENGINE, "Batch", json!({"catenaXId": ENGINE}));
    let engine = engine_for(&fixture);

    let request = RegisterJob::new(ItemGraphFixture::key(ROOT))
        .with_depth(2)
        .with_aspects(vec!["SerialPart".to_string()]);
    let response = engine.query.register_job(&request).unwrap();
    let job = wait_for_terminal(&engine, response.job_id).await;

    let mut aspects: Vec<_> = job
        .graph
        .submodels
        .iter()
        .map(|s| (s.catena_x_id.as_str(), s.aspect_type.as_str()))
        .collect();
    aspects.sort();
    assert_eq!(aspects, vec![(ENGINE, "SerialPart"), (ROOT, "SerialPart")]);
}

#[tokio::test(start_paused = true)]
async fn partial_results_are_visible_while_running_and_cancel_is_final() {
    let fixture = supply_chain();
    let engine = slow_engine(&fixture, GEARBOX);

    let response = engine
        .query
        .register_job(&RegisterJob::new(ItemGraphFixture::key(ROOT)))
        .unwrap();
    let job_id = response.job_id;

    let mut partial = None;
    for _ in 0..100 {
        let job = engine.query.get_job(job_id, true).unwrap();
        if job.summary.completed == 2 {
            partial = Some(job);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let partial = partial.expect("root and engine transfers did not finish");
    assert_eq!(partial.job.state, JobState::Running);
    assert_eq!(partial.summary.running, 1);
    assert_eq!(ids(&partial.graph.shells), vec![ENGINE, ROOT]);

    let without_partial = engine.query.get_job(job_id, false).unwrap();
    assert!(without_partial.graph.is_empty());

    let cancelled = engine.query.cancel_job(job_id).unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(cancelled.completed_on.is_some());

    // The slow transfer finishes later; its completion is ignored.
    tokio::time::sleep(Duration::from_secs(3700)).await;
    let job = engine.query.get_job(job_id, true).unwrap();
    assert_eq!(job.job.state, JobState::Cancelled);
    assert_eq!(job.summary.completed, 2);
    assert_eq!(job.summary.running, 0);

    let again = engine.query.cancel_job(job_id).unwrap();
    assert_eq!(again.state, JobState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn unknown_jobs_are_reported() {
    let fixture = supply_chain();
    let engine = engine_for(&fixture);
    let missing = JobId::new();

    assert!(matches!(
        engine.query.get_job(missing, true),
        Err(QueryError::JobNotFound(id)) if id == missing
    ));
    assert!(matches!(
        engine.query.cancel_job(missing),
        Err(QueryError::JobNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn jobs_can_be_listed_by_state() {
    let fixture = supply_chain();
    let engine = slow_engine(&fixture, ENGINE);

    let done = engine
        .query
        .register_job(&RegisterJob::new(ItemGraphFixture::key(GEARBOX)))
        .unwrap()
        .job_id;
    let running = engine
        .query
        .register_job(&RegisterJob::new(ItemGraphFixture::key(ROOT)))
        .unwrap()
        .job_id;
    wait_for_terminal(&engine, done).await;

    let completed = engine.query.jobs_by_state(&[JobState::Completed]).unwrap();
    assert_eq!(completed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![done]);
    let in_flight = engine.query.jobs_by_state(&[JobState::Running]).unwrap();
    assert_eq!(in_flight.iter().map(|j| j.id).collect::<Vec<_>>(), vec![running]);
    assert_eq!(engine.query.jobs_by_state(&[]).unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn expired_jobs_are_cleaned_up_with_their_blobs() {
    let fixture = supply_chain();
    let engine = engine_for(&fixture);

    let response = engine
        .query
        .register_job(&RegisterJob::new(ItemGraphFixture::key(ROOT)))
        .unwrap();
    let job = wait_for_terminal(&engine, response.job_id).await;
    assert_eq!(job.job.state, JobState::Completed);
    assert!(engine.blob_store.get(&response.job_id.to_string()).unwrap().is_some());

    std::thread::sleep(Duration::from_millis(5));
    let removed = engine
        .orchestrator
        .find_and_cleanup_completed_jobs(Duration::ZERO);
    assert_eq!(removed.len(), 1);
    assert!(engine.blob_store.get(&response.job_id.to_string()).unwrap().is_none());
    assert!(matches!(
        engine.query.get_job(response.job_id, true),
        Err(QueryError::JobNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn durable_stores_keep_jobs_as_blobs() {
    let fixture = supply_chain();
    let engine = ItemGraphEngine::builder(config(), fixture.submodels.clone())
        .with_registry(fixture.registry.clone())
        .with_durable_stores()
        .build(Handle::current());

    let response = engine
        .query
        .register_job(&RegisterJob::new(ItemGraphFixture::key(ROOT)))
        .unwrap();
    let job = wait_for_terminal(&engine, response.job_id).await;

    assert_eq!(job.job.state, JobState::Completed);
    let stored = engine
        .blob_store
        .find_by_prefix(&format!("job:{}", response.job_id))
        .unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn batch_order_tracks_batches_and_times_out_slow_jobs() {
    let fixture = supply_chain();
    let engine = slow_engine(&fixture, PISTON_2);

    // Batch 1 holds two leaves; batch 2 a small tree and the slow leaf.
    let keys = [GEARBOX, PISTON_1, ROOT, PISTON_2]
        .map(ItemGraphFixture::key)
        .to_vec();
    let order = RegisterBatchOrder::new(keys)
        .with_batch_size(2)
        .with_job_timeout(Duration::from_secs(60))
        .with_timeout(Duration::from_secs(600));
    let response = engine.batches.start_batch_order(&order).unwrap();
    assert_eq!(response.batch_ids.len(), 2);

    let view = engine.batches.get_batch(response.batch_ids[1]).unwrap();
    assert_eq!(view.batch.batch_number, 2);
    assert_eq!(view.batch.batch_total, 2);
    assert_eq!(view.jobs.len(), 2);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let first = engine.batches.get_batch(response.batch_ids[0]).unwrap();
    assert_eq!(first.batch.batch_state, BatchState::Completed);
    assert!(first.batch.completed_on.is_some());
    let second = engine.batches.get_batch(response.batch_ids[1]).unwrap();
    assert_eq!(second.batch.batch_state, BatchState::Processing);

    tokio::time::sleep(Duration::from_secs(60)).await;
    let second = engine.batches.get_batch(response.batch_ids[1]).unwrap();
    assert_eq!(second.batch.batch_state, BatchState::Partial);
    let states: Vec<_> = second.jobs.iter().map(|(_, state)| *state).collect();
    assert_eq!(
        states,
        vec![Some(JobState::Completed), Some(JobState::Cancelled)]
    );

    let order_view = engine
        .batches
        .get_batch_order(response.batch_order_id)
        .unwrap();
    assert_eq!(order_view.batches.len(), 2);
    assert_eq!(order_view.state, BatchState::Partial);
}

#[tokio::test(start_paused = true)]
async fn unreadable_job_of_a_batch_is_reported_not_hidden() {
    let fixture = supply_chain();
    let engine = ItemGraphEngine::builder(config(), fixture.submodels.clone())
        .with_registry(fixture.registry.clone())
        .with_durable_stores()
        .build(Handle::current());

    let order = RegisterBatchOrder::new(vec![ItemGraphFixture::key(GEARBOX)]);
    let response = engine.batches.start_batch_order(&order).unwrap();
    let batch_id = response.batch_ids[0];
    let (job_id, _) = engine.batches.get_batch(batch_id).unwrap().jobs[0];
    wait_for_terminal(&engine, job_id).await;

    engine
        .blob_store
        .put(&format!("job:{job_id}"), b"not json".to_vec())
        .unwrap();
    assert!(matches!(
        engine.batches.get_batch(batch_id),
        Err(BatchOrderError::Query(QueryError::Store(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn empty_batch_order_is_rejected() {
    let fixture = supply_chain();
    let engine = engine_for(&fixture);
    assert!(engine
        .batches
        .start_batch_order(&RegisterBatchOrder::new(vec![]))
        .is_err());
}
