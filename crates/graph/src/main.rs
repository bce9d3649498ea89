//! Demo: discover a small supply chain from in-memory collaborators.
//!
//! One branch is unreachable, so the result carries a tombstone next to the
//! items that were found. Set `PARTCHAIN_LOG_FORMAT=pretty` for readable logs.

use std::time::Duration;

use anyhow::{Context, bail};
use serde_json::json;
use tokio::runtime::Handle;
use tracing::info;

use partchain_graph::testing::ItemGraphFixture;
use partchain_graph::{FetchError, ItemGraphEngine, RegisterJob};
use partchain_jobs::JobConfig;

const VEHICLE: &str = "urn:uuid:vehicle-0001";

fn supply_chain() -> ItemGraphFixture {
    let fixture = ItemGraphFixture::new();
    fixture
        .link(VEHICLE, "urn:uuid:engine-0001")
        .link(VEHICLE, "urn:uuid:gearbox-0001")
        .link("urn:uuid:engine-0001", "urn:uuid:piston-0001")
        .link("urn:uuid:engine-0001", "urn:uuid:piston-0002")
        .aspect(VEHICLE, "SerialPart", json!({"catenaXId": VEHICLE, "partTypeInformation": {"nameAtManufacturer": "Vehicle"}}))
        .aspect("urn:uuid:engine-0001", "SerialPart", json!({"catenaXId": "urn:uuid:engine-0001", "partTypeInformation": {"nameAtManufacturer": "Engine"}}));
    fixture.registry.fail_lookup(
        "urn:uuid:gearbox-0001",
        FetchError::Transport("connection refused".to_string()),
    );
    fixture
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    partchain_observability::init();
    let config = JobConfig::from_env().context("invalid configuration")?;

    let fixture = supply_chain();
    let engine = ItemGraphEngine::builder(config, fixture.submodels.clone())
        .with_registry(fixture.registry.clone())
        .build(Handle::current());
    let _cleanup = engine.spawn_cleanup();

    let request = RegisterJob::new(ItemGraphFixture::key(VEHICLE))
        .with_depth(2)
        .with_aspects(vec!["SerialPart".to_string()])
        .with_owner("demo");
    let response = engine.query.register_job(&request)?;
    if !response.is_ok() {
        bail!("job {} was not started: {:?}", response.job_id, response.error);
    }

    let job = loop {
        let job = engine.query.get_job(response.job_id, true)?;
        if job.job.state.is_terminal() {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    info!(
        job_id = %response.job_id,
        state = ?job.job.state,
        shells = job.graph.shells.len(),
        relationships = job.graph.relationships.len(),
        tombstones = job.summary.failed,
        "demo job finished"
    );
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}
