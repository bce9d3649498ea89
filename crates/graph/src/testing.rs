//! In-memory collaborators for tests, benches and the demo binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use partchain_core::{BomLifecycle, ItemKey};

use crate::clients::{AspectSchema, DigitalTwinRegistry, FetchError, SemanticsHub, SubmodelClient};
use crate::model::{LinkedItem, Relationship, RelationshipAspect, Shell, SubmodelDescriptor};

fn poisoned() -> FetchError {
    FetchError::Transport("lock poisoned".to_string())
}

/// Registry backed by a map of shells keyed by global asset id.
#[derive(Debug)]
pub struct InMemoryRegistry {
    endpoint: String,
    shells: RwLock<HashMap<String, Shell>>,
    failures: RwLock<HashMap<String, FetchError>>,
    lookups: AtomicUsize,
}

impl InMemoryRegistry {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            shells: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn arc(endpoint: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(endpoint))
    }

    pub fn insert_shell(&self, shell: Shell) {
        if let Ok(mut shells) = self.shells.write() {
            shells.insert(shell.global_asset_id.clone(), shell);
        }
    }

    /// Make every lookup of `global_asset_id` fail with `error`.
    pub fn fail_lookup(&self, global_asset_id: impl Into<String>, error: FetchError) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(global_asset_id.into(), error);
        }
    }

    /// Number of lookups served, failed ones included.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DigitalTwinRegistry for InMemoryRegistry {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn lookup_shell(&self, key: &ItemKey) -> Result<Shell, FetchError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self
            .failures
            .read()
            .map_err(|_| poisoned())?
            .get(&key.global_asset_id)
        {
            return Err(error.clone());
        }
        self.shells
            .read()
            .map_err(|_| poisoned())?
            .get(&key.global_asset_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(key.global_asset_id.clone()))
    }
}

/// Submodel endpoints served from maps keyed by endpoint address.
#[derive(Debug, Default)]
pub struct InMemorySubmodelClient {
    relationships: RwLock<HashMap<String, Vec<Relationship>>>,
    payloads: RwLock<HashMap<String, serde_json::Value>>,
    failures: RwLock<HashMap<String, FetchError>>,
    calls: AtomicUsize,
}

impl InMemorySubmodelClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert_relationships(&self, endpoint: impl Into<String>, relationships: Vec<Relationship>) {
        if let Ok(mut map) = self.relationships.write() {
            map.entry(endpoint.into()).or_default().extend(relationships);
        }
    }

    pub fn insert_payload(&self, endpoint: impl Into<String>, payload: serde_json::Value) {
        if let Ok(mut map) = self.payloads.write() {
            map.insert(endpoint.into(), payload);
        }
    }

    /// Make every call to `endpoint` fail with `error`.
    pub fn fail(&self, endpoint: impl Into<String>, error: FetchError) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(endpoint.into(), error);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, endpoint: &str) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures.read().map_err(|_| poisoned())?.get(endpoint) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SubmodelClient for InMemorySubmodelClient {
    async fn relationships(
        &self,
        endpoint: &str,
        _aspect: RelationshipAspect,
    ) -> Result<Vec<Relationship>, FetchError> {
        self.check(endpoint)?;
        Ok(self
            .relationships
            .read()
            .map_err(|_| poisoned())?
            .get(endpoint)
            .cloned()
            .unwrap_or_default())
    }

    async fn submodel_payload(
        &self,
        endpoint: &str,
        _bpn: &str,
    ) -> Result<serde_json::Value, FetchError> {
        self.check(endpoint)?;
        self.payloads
            .read()
            .map_err(|_| poisoned())?
            .get(endpoint)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(endpoint.to_string()))
    }
}

/// Schemas keyed by aspect type.
#[derive(Debug, Default)]
pub struct InMemorySemanticsHub {
    schemas: RwLock<HashMap<String, AspectSchema>>,
}

impl InMemorySemanticsHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(self, aspect_type: impl Into<String>, schema: AspectSchema) -> Self {
        if let Ok(mut schemas) = self.schemas.write() {
            schemas.insert(aspect_type.into(), schema);
        }
        self
    }
}

#[async_trait]
impl SemanticsHub for InMemorySemanticsHub {
    async fn model_schema(&self, aspect_type: &str) -> Result<AspectSchema, FetchError> {
        self.schemas
            .read()
            .map_err(|_| poisoned())?
            .get(aspect_type)
            .cloned()
            .ok_or_else(|| FetchError::SchemaNotFound(aspect_type.to_string()))
    }
}

/// Builds a supply chain (as-built, downward) into an in-memory registry and
/// submodel client.
///
/// Every item gets a shell; `link` publishes a single level BOM on the
/// parent's shell, `aspect` publishes a submodel payload.
pub struct ItemGraphFixture {
    pub registry: Arc<InMemoryRegistry>,
    pub submodels: Arc<InMemorySubmodelClient>,
    provider: String,
}

impl ItemGraphFixture {
    pub const BPN: &'static str = "BPNL00000000TEST";

    pub fn new() -> Self {
        Self {
            registry: InMemoryRegistry::arc("https://registry.example/shell-descriptors"),
            submodels: InMemorySubmodelClient::arc(),
            provider: "https://provider.example".to_string(),
        }
    }

    pub fn key(global_asset_id: &str) -> ItemKey {
        ItemKey::new(global_asset_id, Self::BPN)
    }

    fn update_shell(&self, global_asset_id: &str, descriptor: Option<SubmodelDescriptor>) {
        let key = Self::key(global_asset_id);
        let mut shell = self
            .registry
            .shells
            .read()
            .ok()
            .and_then(|shells| shells.get(global_asset_id).cloned())
            .unwrap_or_else(|| Shell {
                id: format!("shell:{global_asset_id}"),
                global_asset_id: key.global_asset_id.clone(),
                id_short: None,
                submodel_descriptors: Vec::new(),
            });
        if let Some(descriptor) = descriptor {
            if !shell.submodel_descriptors.iter().any(|d| d.id == descriptor.id) {
                shell.submodel_descriptors.push(descriptor);
            }
        }
        self.registry.insert_shell(shell);
    }

    /// Register an item without any submodels.
    pub fn item(&self, global_asset_id: &str) -> &Self {
        self.update_shell(global_asset_id, None);
        self
    }

    /// Publish `child` as a component of `parent`.
    pub fn link(&self, parent: &str, child: &str) -> &Self {
        let aspect = RelationshipAspect::SingleLevelBomAsBuilt;
        let endpoint = format!("{}/{parent}/{}", self.provider, aspect.aspect_type());
        self.update_shell(
            parent,
            Some(SubmodelDescriptor {
                id: format!("{parent}:{}", aspect.aspect_type()),
                aspect_type: aspect.aspect_type().to_string(),
                endpoint: endpoint.clone(),
            }),
        );
        self.item(child);
        self.submodels.insert_relationships(
            endpoint,
            vec![Relationship {
                catena_x_id: parent.to_string(),
                linked_item: LinkedItem {
                    child_catena_x_id: child.to_string(),
                    business_partner: Some(Self::BPN.to_string()),
                    quantity: Some(1.0),
                    lifecycle_context: BomLifecycle::AsBuilt,
                },
                aspect_type: aspect,
            }],
        );
        self
    }

    /// Publish a submodel of `aspect_type` for `item`.
    pub fn aspect(&self, item: &str, aspect_type: &str, payload: serde_json::Value) -> &Self {
        let endpoint = format!("{}/{item}/{aspect_type}", self.provider);
        self.update_shell(
            item,
            Some(SubmodelDescriptor {
                id: format!("{item}:{aspect_type}"),
                aspect_type: aspect_type.to_string(),
                endpoint: endpoint.clone(),
            }),
        );
        self.submodels.insert_payload(endpoint, payload);
        self
    }

    /// Endpoint `aspect` publishes for `item`.
    pub fn endpoint(&self, item: &str, aspect_type: &str) -> String {
        format!("{}/{item}/{aspect_type}", self.provider)
    }
}

impl Default for ItemGraphFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn fixture_publishes_shells_and_relationships() {
        let fixture = ItemGraphFixture::new();
        fixture.link("root", "a").link("root", "b").aspect("a", "SerialPart", json!({"id": 1}));

        let shell = fixture
            .registry
            .lookup_shell(&ItemGraphFixture::key("root"))
            .await
            .unwrap();
        let endpoints = shell.relationship_endpoints(RelationshipAspect::SingleLevelBomAsBuilt);
        assert_eq!(endpoints.len(), 1);

        let children = fixture
            .submodels
            .relationships(endpoints[0], RelationshipAspect::SingleLevelBomAsBuilt)
            .await
            .unwrap();
        let ids: Vec<_> = children
            .iter()
            .map(|r| r.linked_item.child_catena_x_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        let payload = fixture
            .submodels
            .submodel_payload(&fixture.endpoint("a", "SerialPart"), ItemGraphFixture::BPN)
            .await
            .unwrap();
        assert_eq!(payload, json!({"id": 1}));
    }

    #[tokio::test]
    async fn injected_failures_win_over_data() {
        let fixture = ItemGraphFixture::new();
        fixture.item("root");
        fixture
            .registry
            .fail_lookup("root", FetchError::Transport("timeout".into()));

        let err = fixture
            .registry
            .lookup_shell(&ItemGraphFixture::key("root"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fixture.registry.lookups(), 1);
    }

    #[tokio::test]
    async fn unknown_schema_is_reported() {
        let hub = InMemorySemanticsHub::new().with_schema("SerialPart", AspectSchema::default());
        assert!(hub.model_schema("SerialPart").await.is_ok());
        assert!(matches!(
            hub.model_schema("Batch").await,
            Err(FetchError::SchemaNotFound(_))
        ));
    }
}
