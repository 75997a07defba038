use log::debug;

use super::Structurizer;
use crate::cfg::node::{NodeId, Terminator};

impl Structurizer<'_> {
    /// Cuts the edges of nodes the entry can't reach and forgets the values
    /// they contribute to PHIs. The translator removes their blocks later.
    pub(super) fn prune_dead_preds(&mut self) -> bool {
        let dead = self
            .pool
            .live_nodes()
            .into_iter()
            .filter(|id| !self.pool.node(*id).visited())
            .collect::<Vec<_>>();

        if dead.is_empty() {
            return false;
        }

        for id in &dead {
            let node = self.pool.node_mut(*id);
            debug!("pruning unreachable node `{}`", node.name);
            node.ir.terminator = Terminator::Unreachable;
        }

        self.pool.for_each_node(|node| {
            for phi in &mut node.ir.phi {
                phi.incoming.retain(|incoming| !dead.contains(&incoming.block));
            }
        });

        true
    }

    /// Folds empty blocks which only jump somewhere else into predecessors
    /// that jump to them unconditionally. Empty arms of a branch stay, they
    /// keep the branch from targeting its merge directly.
    pub(super) fn eliminate_degenerate_blocks(&mut self) -> bool {
        let mut changed = false;
        self.touched.clear();

        for id in self.reverse_post_order() {
            let Some(target) = self.degenerate_target(id) else {
                continue;
            };

            let preds = self.pool.node(id).pred.clone();

            if self.is_touched(&preds) || self.is_touched(&[id, target]) {
                continue;
            }

            for pred in &preds {
                self.pool.retarget_branch(*pred, id, target);
            }

            // Only a single predecessor is allowed when there are PHIs
            for phi in &mut self.pool.node_mut(target).ir.phi {
                for incoming in &mut phi.incoming {
                    if incoming.block == id {
                        incoming.block = preds[0];
                    }
                }
            }

            let block = self.pool.node(id).block;

            debug!(
                "folding empty block `{}` into {} predecessor(s)",
                self.pool.node(id).name,
                preds.len()
            );

            self.pool.detach_node(id);
            self.pool.remove_node(id);
            self.function.erase_block(block);

            self.touched.extend(preds);
            self.touched.insert(target);
            changed = true;
        }

        changed
    }

    /// Target of an empty, jump-only block that can be folded away
    fn degenerate_target(&self, id: NodeId) -> Option<NodeId> {
        let node = self.pool.node(id);

        let Terminator::Branch { target } = node.ir.terminator else {
            return None;
        };

        let empty = node.ir.phi.is_empty()
            && node.ir.operations.is_empty()
            && self.function.block(node.block).instructions.len() <= 1;

        if id == self.entry
            || target == id
            || !empty
            || node.is_loop_header()
            || node.succ_back_edge.is_some()
            || node.pred.is_empty()
        {
            return None;
        }

        let only_jumps = node
            .pred
            .iter()
            .all(|pred| matches!(self.pool.node(*pred).ir.terminator, Terminator::Branch { .. }));

        if !only_jumps {
            return None;
        }

        let target_node = self.pool.node(target);

        if !target_node.ir.phi.is_empty() && node.pred.len() != 1 {
            return None;
        }

        Some(target)
    }
}
