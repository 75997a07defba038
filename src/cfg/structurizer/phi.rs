//! PHI repair. While the graph is rewritten the incoming lists of PHI
//! records hold the original definitions (node plus value available at its
//! end) rather than one value per predecessor. Once the graph is final each
//! PHI gets a value per predecessor again, with new PHIs placed on the
//! dominance frontier wherever several definitions meet.

use std::cmp::Reverse;

use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use log::{debug, trace, warn};

use super::Structurizer;
use crate::{
    cfg::{
        analysis::{exists_path_in_cfg_without_intermediate_node, query_reachability_through_back_edges},
        node::{IncomingValue, NodeId, Phi},
    },
    index::Index,
    lir::{Instruction, Operand, RegisterId},
};

/// A value available at the end of `node`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Definition {
    node: NodeId,
    value: Operand,
}

impl Structurizer<'_> {
    pub(super) fn insert_phis(&mut self) {
        let records = self
            .reverse_post_order()
            .into_iter()
            .flat_map(|id| (0..self.pool.node(id).ir.phi.len()).map(move |index| (id, index)))
            .collect::<Vec<_>>();

        for (id, index) in records {
            self.insert_phi(id, index);
        }
    }

    fn insert_phi(&mut self, id: NodeId, index: usize) {
        let node = self.pool.node(id);
        let queries = node.all_preds();

        let mut definitions = node.ir.phi[index]
            .incoming
            .iter()
            .filter(|incoming| self.pool.contains(incoming.block) && self.pool.node(incoming.block).visited())
            .map(|incoming| Definition {
                node: incoming.block,
                value: incoming.value,
            })
            .collect::<Vec<_>>();

        let uniform = definitions
            .iter()
            .map(|definition| definition.value)
            .all_equal_value()
            .ok();

        let incoming = match uniform {
            Some(value) => queries
                .iter()
                .map(|pred| IncomingValue { block: *pred, value })
                .collect(),
            None => {
                self.resolve_definitions(&mut definitions, &queries, Some(id));

                queries
                    .iter()
                    .map(|pred| IncomingValue {
                        block: *pred,
                        value: self.find_incoming_value(&definitions, *pred),
                    })
                    .collect()
            }
        };

        self.pool.node_mut(id).ir.phi[index].incoming = incoming;
        self.fixup_phi(id, index);
    }

    /// Keeps one incoming value per distinct predecessor
    fn fixup_phi(&mut self, id: NodeId, index: usize) {
        let mut seen = HashSet::new();

        self.pool.node_mut(id).ir.phi[index]
            .incoming
            .retain(|incoming| seen.insert(incoming.block));
    }

    /// Places PHIs on the dominance frontier of the definitions until every
    /// query point sees exactly one of them
    fn resolve_definitions(&mut self, definitions: &mut Vec<Definition>, queries: &[NodeId], phi_node: Option<NodeId>) {
        let mut inserted = HashSet::new();

        while !queries
            .iter()
            .all(|query| self.can_complete_phi_insertion(definitions, *query))
        {
            let mut candidates = definitions
                .iter()
                .flat_map(|definition| self.pool.node(definition.node).dominance_frontier.iter().copied())
                .unique()
                .filter(|frontier| {
                    Some(*frontier) != phi_node
                        && !inserted.contains(frontier)
                        && !definitions.iter().any(|definition| definition.node == *frontier)
                        && queries.iter().any(|query| self.reachability.query(*frontier, *query))
                })
                .collect::<Vec<_>>();

            candidates.sort_by_key(|frontier| Reverse(self.post_order(*frontier)));

            let Some(frontier) = candidates
                .into_iter()
                .find(|frontier| self.phi_frontier_makes_forward_progress(definitions, queries, *frontier))
            else {
                panic!(
                    "no forward progress placing PHIs for {} definition(s) in `{}`",
                    definitions.len(),
                    self.function.name
                );
            };

            inserted.insert(frontier);

            let incoming = self
                .pool
                .node(frontier)
                .all_preds()
                .into_iter()
                .map(|pred| IncomingValue {
                    block: pred,
                    value: self.find_incoming_value(definitions, pred),
                })
                .collect::<Vec<_>>();

            let destination = self.function.create_register();
            let instruction = self.function.insert_after_phis(
                self.pool.node(frontier).block,
                Instruction::Phi {
                    destination,
                    sources: Vec::new(),
                },
            );

            self.pool.node_mut(frontier).ir.phi.push(Phi {
                instruction,
                destination,
                incoming,
            });

            debug!("placed frontier PHI in `{}`", self.pool.node(frontier).name);

            definitions.retain(|definition| !self.subsumed_by(*definition, frontier, queries));
            definitions.push(Definition {
                node: frontier,
                value: Operand::Register(destination),
            });
        }
    }

    /// Whether `query` sees a single definition: the closest one dominating
    /// it, with no other definition sneaking in on the way
    fn can_complete_phi_insertion(&self, definitions: &[Definition], query: NodeId) -> bool {
        match self.closest_dominating_definition(definitions, query) {
            Some(closest) if closest.node == query => true,
            Some(closest) => definitions
                .iter()
                .filter(|definition| definition.node != closest.node)
                .all(|definition| {
                    !exists_path_in_cfg_without_intermediate_node(self.pool, definition.node, query, closest.node)
                }),
            None => definitions
                .iter()
                .all(|definition| !self.reachability.query(definition.node, query)),
        }
    }

    fn phi_frontier_makes_forward_progress(
        &self,
        definitions: &[Definition],
        queries: &[NodeId],
        frontier: NodeId,
    ) -> bool {
        definitions
            .iter()
            .any(|definition| self.subsumed_by(*definition, frontier, queries))
    }

    /// A definition is subsumed by a PHI in `frontier` when every way from
    /// it to a query point goes through `frontier`
    fn subsumed_by(&self, definition: Definition, frontier: NodeId, queries: &[NodeId]) -> bool {
        definition.node != frontier
            && self.reachability.query(definition.node, frontier)
            && queries.iter().all(|query| {
                *query == frontier
                    || !self.reachability.query(definition.node, *query)
                    || !exists_path_in_cfg_without_intermediate_node(self.pool, definition.node, *query, frontier)
            })
    }

    fn closest_dominating_definition(&self, definitions: &[Definition], query: NodeId) -> Option<Definition> {
        definitions
            .iter()
            .copied()
            .filter(|definition| self.dominates(definition.node, query))
            .min_by_key(|definition| self.post_order(definition.node))
    }

    /// Value flowing out of `pred`, undefined when no definition dominates it
    fn find_incoming_value(&self, definitions: &[Definition], pred: NodeId) -> Operand {
        self.closest_dominating_definition(definitions, pred)
            .map(|definition| definition.value)
            .unwrap_or(Operand::UNDEF)
    }

    /// Rewires uses which are no longer dominated by their definition, which
    /// happens when ladders pull code out from under the block defining a
    /// value
    pub(super) fn fixup_broken_value_dominance(&mut self) {
        let mut defining_node = HashMap::new();

        for id in self.reverse_post_order() {
            let node = self.pool.node(id);

            for phi in &node.ir.phi {
                defining_node.insert(phi.destination, id);
            }

            for instruction in &node.ir.operations {
                if let Some(register) = self.function.instruction(*instruction).destination() {
                    defining_node.insert(register, id);
                }
            }
        }

        let mut resolved = HashMap::new();

        let broken = |this: &Self, operand: Operand, query: NodeId| match operand {
            Operand::Register(register) => defining_node
                .get(&register)
                .copied()
                .filter(|definition| *definition != query && !this.dominates(*definition, query))
                .map(|definition| (register, definition)),
            _ => None,
        };

        for id in self.reverse_post_order() {
            for instruction in self.pool.node(id).ir.operations.clone() {
                for operand in self.function.instruction(instruction).operands() {
                    let Some((register, definition)) = broken(self, operand, id) else {
                        continue;
                    };

                    let value = self.repair_use(&mut resolved, register, definition, id);
                    self.function
                        .instruction_mut(instruction)
                        .replace_register_uses(register, value);
                }
            }

            if let Some(operand) = self.pool.node(id).ir.terminator.operand() {
                if let Some((register, definition)) = broken(self, operand, id) {
                    let value = self.repair_use(&mut resolved, register, definition, id);

                    if let Some(operand) = self.pool.node_mut(id).ir.terminator.operand_mut() {
                        *operand = value;
                    }
                }
            }

            for index in 0..self.pool.node(id).ir.phi.len() {
                for slot in 0..self.pool.node(id).ir.phi[index].incoming.len() {
                    let incoming = self.pool.node(id).ir.phi[index].incoming[slot];

                    // Incoming values have to be available at the end of the
                    // predecessor
                    let Some((register, definition)) = broken(self, incoming.value, incoming.block) else {
                        continue;
                    };

                    let value = self.repair_use(&mut resolved, register, definition, incoming.block);
                    self.pool.node_mut(id).ir.phi[index].incoming[slot].value = value;
                }
            }
        }
    }

    fn repair_use(
        &mut self,
        resolved: &mut HashMap<RegisterId, Vec<Definition>>,
        register: RegisterId,
        definition: NodeId,
        query: NodeId,
    ) -> Operand {
        if !query_reachability_through_back_edges(self.pool, definition, query) {
            warn!(
                "use of %{} in `{}` can't be reached from its definition in `{}`",
                register.index(),
                self.pool.node(query).name,
                self.pool.node(definition).name
            );
        }

        let mut definitions = resolved.remove(&register).unwrap_or_else(|| {
            vec![Definition {
                node: definition,
                value: Operand::Register(register),
            }]
        });

        self.resolve_definitions(&mut definitions, &[query], None);
        let value = self.find_incoming_value(&definitions, query);

        trace!(
            "use of %{} in `{}` now reads {value:?}",
            register.index(),
            self.pool.node(query).name
        );

        resolved.insert(register, definitions);
        value
    }
}
