//! Ladder blocks: empty blocks put in front of a merge target so that the
//! edges of one construct arrive through a block of its own.

use hashbrown::HashMap;
use itertools::Itertools;
use log::{debug, trace, warn};

use super::{Placement, Structurizer};
use crate::{
    cfg::{
        analysis::find_common_dominator,
        node::{Case, IncomingValue, NodeId, Phi, Terminator},
    },
    lir::{Immediate, Instruction, Operand},
};

impl Structurizer<'_> {
    /// Reroutes the predecessors of `node` dominated by `header` through a
    /// new block. `None` if `header` dominates none of them.
    pub(super) fn create_ladder_block(&mut self, header: NodeId, node: NodeId, tag: &str) -> Option<NodeId> {
        let preds = self
            .pool
            .node(node)
            .pred
            .iter()
            .copied()
            .filter(|pred| self.dominates(header, *pred))
            .collect::<Vec<_>>();

        if preds.is_empty() {
            warn!(
                "can't ladder `{}` for `{}`: no predecessor is dominated by it",
                self.pool.node(node).name,
                self.pool.node(header).name
            );
            return None;
        }

        let name = format!("{}.{tag}", self.pool.node(node).name);
        let ladder = self.create_helper_node(&name, Placement::Before(node), Terminator::Branch { target: node });

        for pred in preds {
            self.pool.retarget_branch(pred, node, ladder);
            self.touched.insert(pred);
        }

        self.touched.insert(node);

        debug!(
            "created ladder `{}` for `{}` in front of `{}`",
            self.pool.node(ladder).name,
            self.pool.node(header).name,
            self.pool.node(node).name
        );

        Some(ladder)
    }

    /// Like [`Self::create_ladder_block`], but reuses an earlier ladder: an
    /// empty block jumping to `node` that already is the only predecessor
    /// dominated by `header`. The flag is set when a block was created.
    pub(super) fn get_or_create_ladder_block(
        &mut self,
        header: NodeId,
        node: NodeId,
        tag: &str,
    ) -> Option<(NodeId, bool)> {
        let preds = self
            .pool
            .node(node)
            .pred
            .iter()
            .copied()
            .filter(|pred| self.dominates(header, *pred))
            .collect::<Vec<_>>();

        if let [pred] = preds.as_slice() {
            if *pred != header && self.is_empty_jump_to(*pred, node) {
                trace!(
                    "reusing ladder `{}` in front of `{}`",
                    self.pool.node(*pred).name,
                    self.pool.node(node).name
                );
                return Some((*pred, false));
            }
        }

        self.create_ladder_block(header, node, tag)
            .map(|ladder| (ladder, true))
    }

    fn is_empty_jump_to(&self, id: NodeId, target: NodeId) -> bool {
        let node = self.pool.node(id);

        node.ir.terminator == Terminator::Branch { target }
            && node.ir.phi.is_empty()
            && node.ir.operations.is_empty()
            && !node.is_loop_header()
            && node.succ_back_edge.is_none()
    }

    /// Funnels every `(from, target)` edge into one new block which then
    /// dispatches to the original targets on a selector PHI. Sources with
    /// edges to several of the targets go through an extra block per edge so
    /// that each predecessor of the ladder stands for a single target.
    pub(super) fn create_selector_ladder(&mut self, header: NodeId, edges: &[(NodeId, NodeId)], tag: &str) -> NodeId {
        let targets = edges.iter().map(|(_, target)| *target).unique().collect::<Vec<_>>();

        assert!(
            targets.len() > 1,
            "selector ladder for `{}` needs several targets",
            self.pool.node(header).name
        );

        let name = format!("{}.{tag}", self.pool.node(header).name);
        let ladder = self.create_helper_node(&name, Placement::Before(targets[0]), Terminator::Unreachable);

        let selector_for = |target: NodeId| {
            let index = targets
                .iter()
                .position(|t| *t == target)
                .unwrap_or_else(|| panic!("{target:?} is not a ladder target"));

            if targets.len() == 2 {
                Operand::Immediate(Immediate::Bool(index == 0))
            } else {
                Operand::Immediate(Immediate::Int(index as i64))
            }
        };

        let mut by_source: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let sources = edges.iter().map(|(from, _)| *from).unique().collect::<Vec<_>>();
        for (from, target) in edges {
            let targets = by_source.entry(*from).or_default();
            if !targets.contains(target) {
                targets.push(*target);
            }
        }

        let mut incoming = Vec::new();

        for from in sources {
            let exits = &by_source[&from];

            if let [target] = exits.as_slice() {
                self.pool.retarget_branch(from, *target, ladder);
                incoming.push(IncomingValue {
                    block: from,
                    value: selector_for(*target),
                });
            } else {
                for target in exits.iter().copied() {
                    let name = format!("{}.exit", self.pool.node(from).name);
                    let helper =
                        self.create_helper_node(&name, Placement::Before(ladder), Terminator::Branch { target: ladder });

                    self.pool.retarget_branch(from, target, helper);
                    incoming.push(IncomingValue {
                        block: helper,
                        value: selector_for(target),
                    });
                }
            }

            self.touched.insert(from);
        }

        let selector = self.function.create_register();

        let terminator = if let [first, second] = targets.as_slice() {
            Terminator::Condition {
                condition: Operand::Register(selector),
                true_block: *first,
                false_block: *second,
            }
        } else {
            Terminator::Switch {
                condition: Operand::Register(selector),
                cases: targets
                    .iter()
                    .enumerate()
                    .map(|(index, target)| Case {
                        node: *target,
                        value: (index > 0).then_some(index as i64),
                        is_default: index == 0,
                    })
                    .collect(),
            }
        };

        for target in terminator.targets() {
            self.pool.add_branch(ladder, target);
            self.touched.insert(target);
        }

        let block = self.pool.node(ladder).block;
        let instruction = self.function.insert_after_phis(
            block,
            Instruction::Phi {
                destination: selector,
                sources: Vec::new(),
            },
        );

        let node = self.pool.node_mut(ladder);
        node.ir.terminator = terminator;
        node.ir.phi.push(Phi {
            instruction,
            destination: selector,
            incoming,
        });

        debug!(
            "created selector ladder `{}` for `{}` with {} targets",
            self.pool.node(ladder).name,
            self.pool.node(header).name,
            targets.len()
        );

        ladder
    }

    /// A block claimed as merge by several constructs, or by a loop although
    /// it already belongs to an enclosing loop, gets a ladder for everything
    /// but its owner
    pub(super) fn split_merge_blocks(&mut self) -> bool {
        let mut changed = false;

        for index in 0..self.loops.len() {
            let info = &self.loops[index];
            let header = info.header;
            let Some(merge) = info.merge else {
                continue;
            };

            let outer = self
                .enclosing_loops(header)
                .filter(|outer| outer.header != header)
                .find(|outer| outer.merge == Some(merge) || outer.latch == merge)
                .map(|outer| outer.latch == merge);

            if (outer.is_none() && self.dominates(header, merge)) || self.is_touched(&[header, merge]) {
                continue;
            }

            let ladder = match outer {
                // Breaking out of both loops at once
                Some(false) => self.get_target_break_block_for_inner_header(header, merge),
                // The inner loop never leaves except by continuing the outer
                Some(true) => self.get_or_create_ladder_block(header, merge, "continue_ladder"),
                None => self.get_or_create_ladder_block(header, merge, "loop_merge_ladder"),
            };

            changed |= ladder.is_some_and(|(_, created)| created);
        }

        if changed {
            return true;
        }

        let mut claims: Vec<(NodeId, Vec<NodeId>)> = Vec::new();
        let mut claim = |merge: NodeId, header: NodeId| match claims.iter_mut().find(|(m, _)| *m == merge) {
            Some((_, headers)) => headers.push(header),
            None => claims.push((merge, vec![header])),
        };

        for id in self.reverse_post_order() {
            let node = self.pool.node(id);

            if let Some(merge) = node.selection_merge_block.or(node.ir.merge_info.merge_block) {
                claim(merge, id);
            }
        }

        for (merge, headers) in claims {
            if headers.len() < 2 {
                continue;
            }

            // The claimant dominating all others, else the outermost one
            let common = headers
                .iter()
                .copied()
                .reduce(|a, b| find_common_dominator(self.pool, a, b))
                .unwrap_or(headers[0]);

            let owner = if headers.contains(&common) {
                common
            } else {
                headers
                    .iter()
                    .copied()
                    .max_by_key(|header| self.post_order(*header))
                    .unwrap_or(headers[0])
            };

            // Innermost claimant first, the others follow in later passes
            let Some(inner) = headers
                .iter()
                .copied()
                .filter(|header| *header != owner)
                .min_by_key(|header| self.post_order(*header))
            else {
                continue;
            };

            if self.is_touched(&[inner, merge]) {
                continue;
            }

            debug!(
                "`{}` is claimed as merge by {} headers, splitting off `{}`",
                self.pool.node(merge).name,
                headers.len(),
                self.pool.node(inner).name
            );

            changed |= self.create_ladder_block(inner, merge, "merge_ladder").is_some();
        }

        changed
    }
}
