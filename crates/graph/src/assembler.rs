//! Merges per-transfer item containers into one graph.

use std::collections::HashSet;

use crate::model::ItemContainer;

/// Merges containers, dropping duplicates: shells by id, relationships by
/// parent/child pair, submodels by id. Tombstones are kept in arrival order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemTreesAssembler;

impl ItemTreesAssembler {
    pub fn assemble<I>(&self, containers: I) -> ItemContainer
    where
        I: IntoIterator<Item = ItemContainer>,
    {
        let mut graph = ItemContainer::default();
        let mut shells = HashSet::new();
        let mut relationships = HashSet::new();
        let mut submodels = HashSet::new();

        for container in containers {
            for shell in container.shells {
                if shells.insert(shell.id.clone()) {
                    graph.shells.push(shell);
                }
            }
            for relationship in container.relationships {
                let edge = (
                    relationship.catena_x_id.clone(),
                    relationship.linked_item.child_catena_x_id.clone(),
                );
                if relationships.insert(edge) {
                    graph.relationships.push(relationship);
                }
            }
            for submodel in container.submodels {
                if submodels.insert(submodel.id.clone()) {
                    graph.submodels.push(submodel);
                }
            }
            graph.tombstones.extend(container.tombstones);
        }

        graph
    }
}
