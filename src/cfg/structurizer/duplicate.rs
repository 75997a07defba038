use hashbrown::{HashMap, HashSet};
use log::debug;

use super::Structurizer;
use crate::{
    cfg::node::{MergeInfo, NodeId, NodeIr, Phi},
    lir::{Instruction, InstructionId, Operand, RegisterId},
};

impl Structurizer<'_> {
    /// A block ending the function which is entered from several loop scopes
    /// can't belong to all of them. Give every scope but the first its own
    /// copy.
    pub(super) fn duplicate_impossible_merge_constructs(&mut self) -> bool {
        let mut changed = false;

        for id in self.reverse_post_order() {
            let node = self.pool.node(id);

            if !node.ir.terminator.is_terminal() || node.pred.len() < 2 {
                continue;
            }

            let mut scopes: Vec<(Option<NodeId>, Vec<NodeId>)> = Vec::new();

            for pred in node.pred.iter().copied() {
                let scope = self.innermost_loop(pred).map(|info| info.header);

                match scopes.iter_mut().find(|(s, _)| *s == scope) {
                    Some((_, preds)) => preds.push(pred),
                    None => scopes.push((scope, vec![pred])),
                }
            }

            if scopes.len() < 2 || !self.can_duplicate_phis(id) {
                continue;
            }

            for (_, preds) in scopes.into_iter().skip(1) {
                let copy = self.duplicate_node(id, &preds);

                debug!(
                    "duplicated `{}` into `{}` for {} predecessor(s)",
                    self.pool.node(id).name,
                    self.pool.node(copy).name,
                    preds.len()
                );
            }

            changed = true;
        }

        changed
    }

    /// Values defined by the node must not be used anywhere else, the copy
    /// would need a PHI to merge them again
    fn can_duplicate_phis(&self, id: NodeId) -> bool {
        let node = self.pool.node(id);

        let defined = node
            .ir
            .phi
            .iter()
            .map(|phi| phi.destination)
            .chain(
                node.ir
                    .operations
                    .iter()
                    .filter_map(|instruction| self.function.instruction(*instruction).destination()),
            )
            .collect::<HashSet<_>>();

        self.function
            .live_instructions()
            .filter(|(block, _)| *block != node.block)
            .all(|(_, instruction)| {
                let instruction = self.function.instruction(instruction);
                defined.iter().all(|register| !instruction.uses_register(*register))
            })
    }

    /// Clones `id` into a new node and moves the edges from `preds` over to
    /// it. Registers defined in the copy are renamed.
    pub(super) fn duplicate_node(&mut self, id: NodeId, preds: &[NodeId]) -> NodeId {
        let original = self.pool.node(id).clone();
        let name = format!("{}.dup", original.name);

        let block = self.function.create_block_after(&name, original.block);
        let copy = self.pool.create_node(self.function.block_name(block), block);

        let mut remap = HashMap::new();

        let phi = original
            .ir
            .phi
            .iter()
            .map(|phi| {
                let destination = self.function.create_register();
                remap.insert(phi.destination, Operand::Register(destination));

                let instruction = self.function.push_instruction(
                    block,
                    Instruction::Phi {
                        destination,
                        sources: Vec::new(),
                    },
                );

                Phi {
                    instruction,
                    destination,
                    incoming: phi
                        .incoming
                        .iter()
                        .copied()
                        .filter(|incoming| preds.contains(&incoming.block))
                        .collect(),
                }
            })
            .collect::<Vec<_>>();

        let operations = original
            .ir
            .operations
            .iter()
            .map(|instruction| {
                let instruction = self.duplicate_op(*instruction, &mut remap);
                self.function.push_instruction(block, instruction)
            })
            .collect::<Vec<_>>();

        let mut terminator = original.ir.terminator.clone();
        if let Some(operand) = terminator.operand_mut() {
            remap_operand(operand, &remap);
        }

        self.pool.node_mut(copy).ir = NodeIr {
            terminator,
            phi,
            operations,
            merge_info: MergeInfo::default(),
        };

        for phi in &mut self.pool.node_mut(id).ir.phi {
            phi.incoming.retain(|incoming| !preds.contains(&incoming.block));
        }

        for pred in preds {
            self.pool.retarget_branch(*pred, id, copy);
        }

        copy
    }

    fn duplicate_op(&mut self, id: InstructionId, remap: &mut HashMap<RegisterId, Operand>) -> Instruction {
        let mut instruction = self.function.instruction(id).clone();

        for operand in instruction.operands_mut() {
            remap_operand(operand, remap);
        }

        if let Some(destination) = instruction.destination() {
            let register = self.function.create_register();
            instruction.set_destination(register);
            remap.insert(destination, Operand::Register(register));
        }

        instruction
    }
}

fn remap_operand(operand: &mut Operand, remap: &HashMap<RegisterId, Operand>) {
    if let Operand::Register(register) = operand {
        if let Some(new) = remap.get(register) {
            *operand = *new;
        }
    }
}
