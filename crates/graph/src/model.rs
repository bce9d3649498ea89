//! Item graph data: shells, relationships, submodels and the per-transfer
//! container they are collected into.

use serde::{Deserialize, Serialize};

use partchain_core::{BomLifecycle, Direction, Tombstone};

/// The relationship aspect that links items for a lifecycle and direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipAspect {
    SingleLevelBomAsBuilt,
    SingleLevelBomAsPlanned,
    SingleLevelBomAsSpecified,
    SingleLevelUsageAsBuilt,
    SingleLevelUsageAsPlanned,
    SingleLevelUsageAsSpecified,
}

impl RelationshipAspect {
    pub fn from(lifecycle: BomLifecycle, direction: Direction) -> Self {
        match (direction, lifecycle) {
            (Direction::Downward, BomLifecycle::AsBuilt) => Self::SingleLevelBomAsBuilt,
            (Direction::Downward, BomLifecycle::AsPlanned) => Self::SingleLevelBomAsPlanned,
            (Direction::Downward, BomLifecycle::AsSpecified) => Self::SingleLevelBomAsSpecified,
            (Direction::Upward, BomLifecycle::AsBuilt) => Self::SingleLevelUsageAsBuilt,
            (Direction::Upward, BomLifecycle::AsPlanned) => Self::SingleLevelUsageAsPlanned,
            (Direction::Upward, BomLifecycle::AsSpecified) => Self::SingleLevelUsageAsSpecified,
        }
    }

    /// Aspect type name as it appears in submodel descriptors.
    pub fn aspect_type(self) -> &'static str {
        match self {
            Self::SingleLevelBomAsBuilt => "SingleLevelBomAsBuilt",
            Self::SingleLevelBomAsPlanned => "SingleLevelBomAsPlanned",
            Self::SingleLevelBomAsSpecified => "SingleLevelBomAsSpecified",
            Self::SingleLevelUsageAsBuilt => "SingleLevelUsageAsBuilt",
            Self::SingleLevelUsageAsPlanned => "SingleLevelUsageAsPlanned",
            Self::SingleLevelUsageAsSpecified => "SingleLevelUsageAsSpecified",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmodelDescriptor {
    pub id: String,
    pub aspect_type: String,
    pub endpoint: String,
}

/// Digital twin of one item, as returned by a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shell {
    pub id: String,
    pub global_asset_id: String,
    pub id_short: Option<String>,
    pub submodel_descriptors: Vec<SubmodelDescriptor>,
}

impl Shell {
    /// Endpoints of the descriptors carrying `aspect`.
    pub fn relationship_endpoints(&self, aspect: RelationshipAspect) -> Vec<&str> {
        self.submodel_descriptors
            .iter()
            .filter(|d| d.aspect_type == aspect.aspect_type())
            .map(|d| d.endpoint.as_str())
            .collect()
    }

    /// Descriptors whose aspect type is one of `aspects`.
    pub fn filter_descriptors_by_aspect_types(&self, aspects: &[String]) -> Vec<SubmodelDescriptor> {
        self.submodel_descriptors
            .iter()
            .filter(|d| aspects.iter().any(|a| a.eq_ignore_ascii_case(&d.aspect_type)))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedItem {
    pub child_catena_x_id: String,
    pub business_partner: Option<String>,
    pub quantity: Option<f64>,
    pub lifecycle_context: BomLifecycle,
}

/// Edge from an item to a linked item (a component downward, a user upward).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub catena_x_id: String,
    pub linked_item: LinkedItem,
    pub aspect_type: RelationshipAspect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submodel {
    pub id: String,
    pub aspect_type: String,
    pub catena_x_id: String,
    pub payload: serde_json::Value,
}

/// Everything one transfer collected about one item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemContainer {
    pub shells: Vec<Shell>,
    pub relationships: Vec<Relationship>,
    pub submodels: Vec<Submodel>,
    pub tombstones: Vec<Tombstone>,
}

impl ItemContainer {
    pub fn is_empty(&self) -> bool {
        self.shells.is_empty()
            && self.relationships.is_empty()
            && self.submodels.is_empty()
            && self.tombstones.is_empty()
    }
}
