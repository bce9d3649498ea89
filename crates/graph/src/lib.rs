//! `partchain-graph`: item-graph discovery on top of `partchain-jobs`.
//!
//! A job starts at one root item and walks its relationships (components
//! downward, users upward) to the requested depth. Each item is one
//! transfer: shell lookup, relationship fetch and, when asked for, submodel
//! payloads. Items that cannot be fetched become tombstones; the job still
//! completes with everything else.
//!
//! ## Components
//!
//! - `ItemTransferWorker`: fetches one item; never fails
//! - `ItemGraphHandler`: root request, child requests, final assembly
//! - `ItemTreesAssembler`: merges per-item containers into one graph
//! - `ItemGraphQueryService`: register, inspect and cancel jobs
//! - `BatchOrderService`: batch orders with timeouts
//! - `ItemGraphEngine`: wires all of the above

pub mod assembler;
pub mod batch;
pub mod clients;
pub mod engine;
pub mod handler;
pub mod model;
pub mod request;
pub mod service;
pub mod testing;
pub mod worker;

pub use assembler::ItemTreesAssembler;
pub use batch::{BatchOrderError, BatchOrderResponse, BatchOrderService, BatchOrderView, BatchView, RegisterBatchOrder};
pub use clients::{AspectSchema, DigitalTwinRegistry, FetchError, SemanticsHub, SubmodelClient};
pub use engine::{ItemGraphEngine, ItemGraphEngineBuilder};
pub use handler::{DISCOVERED_ITEMS, ItemGraphHandler};
pub use model::{
    ItemContainer, LinkedItem, Relationship, RelationshipAspect, Shell, Submodel,
    SubmodelDescriptor,
};
pub use request::{ItemDataRequest, ItemTransferProcess};
pub use service::{
    DEFAULT_ASPECT, ItemGraphJob, ItemGraphOrchestrator, ItemGraphQueryService, JobSummary,
    QueryError, RegisterJob,
};
pub use worker::ItemTransferWorker;
