use hashbrown::{HashMap, HashSet};
use log::{debug, trace, warn};

use super::{
    node::{Case, IncomingValue, MergeInfo, MergeType, NodeId, NodeIr, Phi, Terminator, TerminatorKind},
    pool::CfgNodePool,
};
use crate::{
    config::MarkerNames,
    error::CfgError,
    lir::{BlockId, Function, Instruction, InstructionId, Operand, pretty_print::print_instruction_plain},
};

/// Converts a function into a [`CfgNodePool`] and writes the (structurized)
/// pool back into the function afterwards.
#[derive(Debug)]
pub struct CfgTranslator {
    entry: NodeId,
    markers: MarkerNames,
}

/// Whether the last instruction before the terminator, ignoring merge
/// markers, is a call to the discard intrinsic
fn discard_precedes_terminator(function: &Function, block: BlockId, markers: &MarkerNames) -> bool {
    function
        .block(block)
        .instructions
        .iter()
        .rev()
        .map(|id| function.instruction(*id))
        .skip_while(|instruction| instruction.is_terminator())
        .find(|instruction| !markers.is_marker_call(instruction))
        .is_some_and(|instruction| instruction.is_call_to(&markers.discard))
}

fn unsupported_terminator(function: &Function, block: BlockId, instruction: &Instruction) -> CfgError {
    CfgError::UnsupportedTerminator {
        block: function.block_name(block).to_owned(),
        instruction: print_instruction_plain(function, instruction),
    }
}

/// Terminator classification of a block, as a pure function of its last
/// instruction
pub fn terminator_kind(
    function: &Function,
    block: BlockId,
    markers: &MarkerNames,
) -> Result<TerminatorKind, CfgError> {
    let Some(terminator) = function.terminator(block) else {
        return Err(match function.block(block).instructions.last() {
            None => CfgError::EmptyBlock {
                block: function.block_name(block).to_owned(),
            },
            Some(last) => unsupported_terminator(function, block, function.instruction(*last)),
        });
    };

    match function.instruction(terminator) {
        Instruction::Jump { .. } => Ok(TerminatorKind::Branch),
        Instruction::Branch { .. } => Ok(TerminatorKind::Condition),
        Instruction::Return { .. } => Ok(TerminatorKind::Return),
        Instruction::Switch { .. } => Ok(TerminatorKind::Switch),
        Instruction::Unreachable if discard_precedes_terminator(function, block, markers) => {
            Ok(TerminatorKind::Kill)
        }
        Instruction::Unreachable => Ok(TerminatorKind::Unreachable),
        other => Err(unsupported_terminator(function, block, other)),
    }
}

impl CfgTranslator {
    /// Creates one node per block and translates the block contents
    pub fn run(
        function: &Function,
        pool: &mut CfgNodePool,
        markers: &MarkerNames,
    ) -> Result<Self, CfgError> {
        let Some(entry_block) = function.entry_block() else {
            return Err(CfgError::EmptyFunction {
                function: function.name.clone(),
            });
        };

        let block_map = function
            .layout
            .iter()
            .map(|block| (*block, pool.create_node(function.block_name(*block), *block)))
            .collect::<HashMap<_, _>>();

        for block in &function.layout {
            translate_block(function, pool, &block_map, *block, markers)?;
        }

        debug!(
            "translated `{}` into {} cfg nodes",
            function.name,
            block_map.len()
        );

        Ok(Self {
            entry: block_map[&entry_block],
            markers: markers.clone(),
        })
    }

    pub fn entry(&self) -> NodeId {
        self.entry
    }

    /// Writes the node pool back into `function`
    pub fn cfg_to_lir(
        &mut self,
        function: &mut Function,
        pool: &mut CfgNodePool,
        updated_entry: NodeId,
        add_merge_annotations: bool,
    ) -> Result<(), CfgError> {
        if self.entry != updated_entry {
            function.move_block_to_front(pool.node(updated_entry).block);
        }
        self.entry = updated_entry;

        self.update_terminators(function, pool)?;

        let reachable = self.reachable_blocks(function, pool);

        self.update_phis(function, pool, &reachable);
        self.remove_unreachable_nodes(function, pool, &reachable);

        if add_merge_annotations {
            for id in pool.live_nodes() {
                self.add_merge_annotation(function, pool, id);
            }
        }

        Ok(())
    }

    fn update_terminators(&mut self, function: &mut Function, pool: &mut CfgNodePool) -> Result<(), CfgError> {
        for id in pool.live_nodes() {
            let node = pool.node(id);

            if needs_fake_selection(pool, id) {
                if !self.fake_selection_is_current(function, pool, id) {
                    self.add_or_update_terminator(function, pool, id)?;
                }
                continue;
            }

            let up_to_date = function
                .terminator(node.block)
                .is_some_and(|terminator| self.native_terminator_matches(function, pool, id, terminator));

            if !up_to_date {
                trace!("replacing terminator of `{}`", node.name);
                self.add_or_update_terminator(function, pool, id)?;
            }
        }

        Ok(())
    }

    fn native_terminator_matches(
        &self,
        function: &Function,
        pool: &CfgNodePool,
        id: NodeId,
        terminator: InstructionId,
    ) -> bool {
        let node = pool.node(id);
        let block_of = |node: NodeId| pool.node(node).block;

        if node.synthesized.fake_selection.is_some() {
            return false;
        }

        match (&node.ir.terminator, function.instruction(terminator)) {
            (Terminator::Branch { target }, Instruction::Jump { destination }) => {
                block_of(*target) == *destination
            }
            (
                Terminator::Condition {
                    condition,
                    true_block,
                    false_block,
                },
                Instruction::Branch {
                    condition: native_condition,
                    positive,
                    negative,
                },
            ) => {
                condition == native_condition
                    && block_of(*true_block) == *positive
                    && block_of(*false_block) == *negative
            }
            (Terminator::Return { value }, Instruction::Return { value: native_value }) => {
                value == native_value
            }
            (Terminator::Unreachable, Instruction::Unreachable) => {
                !discard_precedes_terminator(function, node.block, &self.markers)
            }
            (Terminator::Kill, Instruction::Unreachable) => {
                discard_precedes_terminator(function, node.block, &self.markers)
            }
            (
                Terminator::Switch { condition, cases },
                Instruction::Switch {
                    condition: native_condition,
                    default,
                    cases: native_cases,
                },
            ) => {
                let Some(default_case) = cases.iter().find(|case| case.is_default) else {
                    return false;
                };

                let explicit = cases
                    .iter()
                    .filter(|case| !case.is_default)
                    .map(|case| (case.value, block_of(case.node)))
                    .collect::<Vec<_>>();
                let native = native_cases
                    .iter()
                    .map(|(value, block)| (Some(*value), *block))
                    .collect::<Vec<_>>();

                condition == native_condition && block_of(default_case.node) == *default && explicit == native
            }
            _ => false,
        }
    }

    fn fake_selection_is_current(&self, function: &Function, pool: &CfgNodePool, id: NodeId) -> bool {
        let node = pool.node(id);

        let Some(fake_selection) = node.synthesized.fake_selection else {
            return false;
        };

        let Terminator::Condition {
            condition,
            true_block,
            false_block,
        } = node.ir.terminator
        else {
            return false;
        };

        let jumps_to_selection = function.terminator(node.block).is_some_and(|terminator| {
            *function.instruction(terminator)
                == Instruction::Jump {
                    destination: fake_selection,
                }
        });

        let branches = function.terminator(fake_selection).is_some_and(|terminator| {
            *function.instruction(terminator)
                == Instruction::Branch {
                    condition,
                    positive: pool.node(true_block).block,
                    negative: pool.node(false_block).block,
                }
        });

        jumps_to_selection && branches
    }

    fn remove_terminator(function: &mut Function, block: BlockId) {
        if let Some(terminator) = function.terminator(block) {
            function.erase_instruction(block, terminator);
        }
    }

    /// Removes the blocks of a fake selection made by an earlier conversion
    fn erase_fake_selection(&self, function: &mut Function, pool: &mut CfgNodePool, id: NodeId) {
        let node = pool.node_mut(id);
        let header = node.block;
        let stale = [
            node.synthesized.fake_selection.take(),
            node.synthesized.fake_selection_merge.take(),
        ];
        node.phi_override = None;

        for block in stale.into_iter().flatten() {
            let referencing = function
                .block(header)
                .instructions
                .iter()
                .copied()
                .filter(|instruction| {
                    self.markers.is_marker_call(function.instruction(*instruction))
                        && function.instruction(*instruction).uses_block(block)
                })
                .collect::<Vec<_>>();

            for instruction in referencing {
                function.erase_instruction(header, instruction);
            }

            function.erase_block(block);
        }
    }

    fn add_or_update_terminator(
        &self,
        function: &mut Function,
        pool: &mut CfgNodePool,
        id: NodeId,
    ) -> Result<(), CfgError> {
        if pool.node(id).synthesized.fake_selection.is_some() {
            self.erase_fake_selection(function, pool, id);
        }

        let fake_selection = needs_fake_selection(pool, id);
        let node = pool.node(id);
        let (block, name) = (node.block, node.name.clone());
        let block_of = |node: NodeId| pool.node(node).block;

        Self::remove_terminator(function, block);

        match node.ir.terminator.clone() {
            Terminator::Condition {
                condition,
                true_block,
                false_block,
            } if fake_selection => {
                let selection = function.create_block_after(&format!("{name}.fake_selection"), block);
                let unreachable = function.create_block_after(&format!("{name}.unreachable"), selection);

                function.push_instruction(
                    block,
                    Instruction::Jump {
                        destination: selection,
                    },
                );
                function.push_instruction(unreachable, Instruction::Unreachable);
                function.push_instruction(
                    selection,
                    Instruction::Branch {
                        condition,
                        positive: block_of(true_block),
                        negative: block_of(false_block),
                    },
                );
                self.create_selection_merge(function, selection, unreachable);

                debug!("created fake selection for loop header `{name}`");

                let node = pool.node_mut(id);
                node.phi_override = Some(selection);
                node.synthesized.fake_selection = Some(selection);
                node.synthesized.fake_selection_merge = Some(unreachable);
            }
            Terminator::Condition {
                condition,
                true_block,
                false_block,
            } => {
                function.push_instruction(
                    block,
                    Instruction::Branch {
                        condition,
                        positive: block_of(true_block),
                        negative: block_of(false_block),
                    },
                );
            }
            Terminator::Branch { target } => {
                function.push_instruction(
                    block,
                    Instruction::Jump {
                        destination: block_of(target),
                    },
                );
            }
            Terminator::Return { value } => {
                function.push_instruction(block, Instruction::Return { value });
            }
            Terminator::Kill => {
                if !discard_precedes_terminator(function, block, &self.markers) {
                    function.push_instruction(
                        block,
                        Instruction::Call {
                            callee: self.markers.discard.clone(),
                            arguments: Vec::new(),
                            destination: None,
                        },
                    );
                }
                function.push_instruction(block, Instruction::Unreachable);
            }
            Terminator::Unreachable => {
                function.push_instruction(block, Instruction::Unreachable);
            }
            Terminator::Switch { condition, cases } => {
                let Some(default) = cases.iter().find(|case| case.is_default) else {
                    return Err(CfgError::MissingDefaultCase { block: name });
                };

                let instruction = Instruction::Switch {
                    condition,
                    default: block_of(default.node),
                    cases: cases
                        .iter()
                        .filter(|case| !case.is_default)
                        .filter_map(|case| case.value.map(|value| (value, block_of(case.node))))
                        .collect(),
                };

                function.push_instruction(block, instruction);
            }
        }

        Ok(())
    }

    fn reachable_blocks(&self, function: &Function, pool: &CfgNodePool) -> HashSet<BlockId> {
        let mut reachable = HashSet::new();
        let mut stack = vec![pool.node(self.entry).block];

        while let Some(block) = stack.pop() {
            if reachable.insert(block) {
                stack.extend(function.successors(block));
            }
        }

        reachable
    }

    /// Rewrites the sources of every native PHI from the PHI records, then
    /// repeats sources for predecessors that branch here more than once
    fn update_phis(&self, function: &mut Function, pool: &CfgNodePool, reachable: &HashSet<BlockId>) {
        for id in pool.live_nodes() {
            let node = pool.node(id);

            if !reachable.contains(&node.block) {
                continue;
            }

            let predecessors = function
                .predecessors(node.block)
                .into_iter()
                .filter(|pred| reachable.contains(pred))
                .collect::<Vec<_>>();

            for instruction in function.phis(node.block) {
                let Some(record) = node.ir.phi.iter().find(|phi| phi.instruction == instruction) else {
                    panic!("no phi record for native phi in block `{}`", node.name);
                };

                let mut sources = record
                    .incoming
                    .iter()
                    .filter(|incoming| pool.contains(incoming.block))
                    .map(|incoming| {
                        let source = pool.node(incoming.block);
                        (source.phi_override.unwrap_or(source.block), incoming.value)
                    })
                    .filter(|(block, _)| reachable.contains(block))
                    .collect::<Vec<_>>();

                let mut seen = HashSet::new();
                for pred in &predecessors {
                    if seen.insert(*pred) {
                        continue;
                    }

                    match sources.iter().find(|(block, _)| block == pred).copied() {
                        Some(source) => sources.push(source),
                        None => warn!(
                            "phi in `{}` has no value for predecessor `{}`",
                            node.name,
                            function.block_name(*pred)
                        ),
                    }
                }

                if let Instruction::Phi { sources: native, .. } = function.instruction_mut(instruction) {
                    *native = sources;
                }
            }
        }
    }

    fn remove_unreachable_nodes(&self, function: &mut Function, pool: &mut CfgNodePool, reachable: &HashSet<BlockId>) {
        let dead = pool
            .live_nodes()
            .into_iter()
            .filter(|id| !reachable.contains(&pool.node(*id).block))
            .collect::<Vec<_>>();

        if dead.is_empty() {
            return;
        }

        let dead_blocks = dead
            .iter()
            .flat_map(|id| {
                let node = pool.node(*id);
                let synthesized = node.synthesized;

                [
                    Some(node.block),
                    synthesized.fake_selection,
                    synthesized.fake_selection_merge,
                    synthesized.fake_merge,
                    synthesized.fake_continue,
                    synthesized.new_entry,
                ]
            })
            .flatten()
            .filter(|block| !function.block(*block).erased)
            .collect::<Vec<_>>();

        // Dead blocks may reference each other, so first drop every
        // reference, then remove the instructions, then the blocks
        for block in &dead_blocks {
            for instruction in function.block(*block).instructions.clone() {
                function.instruction_mut(instruction).drop_all_references();
            }
        }

        for block in &dead_blocks {
            function.blocks[*block].instructions.clear();
        }

        for block in &dead_blocks {
            if let Some((user, _)) = function
                .live_instructions()
                .find(|(_, instruction)| function.instruction(*instruction).uses_block(*block))
            {
                panic!(
                    "unreachable block `{}` is still used by `{}`",
                    function.block_name(*block),
                    function.block_name(user)
                );
            }

            function.erase_block(*block);
        }

        for id in &dead {
            debug!("removing unreachable node `{}`", pool.node(*id).name);
            pool.detach_node(*id);
            pool.remove_node(*id);
        }

        let is_dead = |node: &Option<NodeId>| node.is_some_and(|node| dead.contains(&node));

        pool.for_each_node(|node| {
            for phi in &mut node.ir.phi {
                phi.incoming.retain(|incoming| !dead.contains(&incoming.block));
            }

            if is_dead(&node.ir.merge_info.merge_block) {
                node.ir.merge_info.merge_block = None;
            }
            if is_dead(&node.ir.merge_info.continue_block) {
                node.ir.merge_info.continue_block = None;
            }
            if is_dead(&node.selection_merge_block) {
                node.selection_merge_block = None;
            }
        });
    }

    fn add_merge_annotation(&self, function: &mut Function, pool: &mut CfgNodePool, id: NodeId) {
        let node = pool.node(id);
        let block = node.block;

        match node.merge {
            MergeType::None => {}
            MergeType::Selection => {
                let terminator = function
                    .terminator(block)
                    .map(|terminator| function.instruction(terminator).clone());

                if node.selection_merge_block.is_none() && node.selection_merge_exit {
                    match (node.ir.terminator.kind(), terminator) {
                        (
                            TerminatorKind::Condition,
                            Some(Instruction::Branch {
                                positive, negative, ..
                            }),
                        ) => {
                            let is_unreachable = |block: BlockId| {
                                function.terminator(block).is_some_and(|terminator| {
                                    *function.instruction(terminator) == Instruction::Unreachable
                                })
                            };

                            // Merge into whichever side keeps going
                            match (is_unreachable(positive), is_unreachable(negative)) {
                                (true, false) => self.create_selection_merge(function, block, negative),
                                (false, true) => self.create_selection_merge(function, block, positive),
                                _ => {}
                            }
                        }
                        (kind, _) => {
                            warn!(
                                "can't handle exit selection merge on `{}` terminated by {kind}",
                                node.name
                            );
                        }
                    }
                    return;
                }

                match node.ir.terminator.kind() {
                    TerminatorKind::Condition | TerminatorKind::Switch => {}
                    kind => panic!("invalid selection merge on `{}` terminated by {kind}", node.name),
                }

                let merge = match node.selection_merge_block {
                    Some(merge) => pool.node(merge).block,
                    None => {
                        let name = node.name.clone();
                        self.fake_merge(function, pool, id, &name)
                    }
                };

                self.create_selection_merge(function, block, merge);
            }
            MergeType::Loop => {
                let MergeInfo {
                    merge_block,
                    continue_block,
                } = node.ir.merge_info;
                let name = node.name.clone();

                let continue_of = |continue_block: NodeId| {
                    let continue_node = pool.node(continue_block);
                    match node.phi_override {
                        Some(selection) if continue_block == id => selection,
                        _ => continue_node.block,
                    }
                };

                match (merge_block, continue_block) {
                    (Some(merge), Some(continue_block)) => {
                        let (merge, continue_block) = (pool.node(merge).block, continue_of(continue_block));
                        self.create_loop_merge(function, block, merge, continue_block);
                    }
                    (Some(merge), None) => {
                        let merge = pool.node(merge).block;
                        let is_entry = id == self.entry;

                        let mut fakes = Vec::new();

                        if is_entry {
                            // A fake continue in front of the entry would not be
                            // a back edge, so a new entry has to come first
                            let new_entry = match node.synthesized.new_entry {
                                Some(existing) => existing,
                                None => {
                                    let new_entry = function
                                        .create_block_before(&format!("{name}.new_entry.fake_continue"), block);
                                    function.push_instruction(new_entry, Instruction::Jump { destination: block });
                                    new_entry
                                }
                            };
                            fakes.push(new_entry);
                        }

                        let fake_continue = match node.synthesized.fake_continue {
                            Some(existing) => existing,
                            None => {
                                let fake_continue =
                                    function.create_block_before(&format!("{name}.fake_continue"), block);
                                function.push_instruction(fake_continue, Instruction::Jump { destination: block });
                                fake_continue
                            }
                        };
                        fakes.push(fake_continue);

                        self.create_loop_merge(function, block, merge, fake_continue);

                        for phi in function.phis(block) {
                            if let Instruction::Phi { sources, .. } = function.instruction_mut(phi) {
                                for fake in &fakes {
                                    if !sources.iter().any(|(source, _)| source == fake) {
                                        sources.push((*fake, Operand::UNDEF));
                                    }
                                }
                            }
                        }

                        let synthesized = &mut pool.node_mut(id).synthesized;
                        synthesized.fake_continue = Some(fake_continue);
                        if is_entry {
                            synthesized.new_entry = fakes.first().copied();
                        }
                    }
                    (None, Some(continue_block)) => {
                        let continue_block = continue_of(continue_block);
                        let merge = self.fake_merge(function, pool, id, &name);
                        self.create_loop_merge(function, block, merge, continue_block);
                    }
                    (None, None) => panic!("invalid loop merge on `{name}`: no merge or continue block"),
                }
            }
        }
    }

    /// An `unreachable` block standing in for a missing merge block. It goes
    /// after the header, which may be the entry and has to stay first.
    fn fake_merge(&self, function: &mut Function, pool: &mut CfgNodePool, id: NodeId, name: &str) -> BlockId {
        let node = pool.node_mut(id);

        if let Some(existing) = node.synthesized.fake_merge {
            return existing;
        }

        let name = format!("{name}.fake_merge");
        let fake_merge = function.create_block_after(&name, node.block);

        function.push_instruction(fake_merge, Instruction::Unreachable);
        node.synthesized.fake_merge = Some(fake_merge);
        fake_merge
    }

    fn insert_marker(&self, function: &mut Function, block: BlockId, callee: &str, arguments: Vec<Operand>) {
        assert!(
            function.terminator(block).is_some(),
            "markers go before the terminator of `{}`",
            function.block_name(block)
        );

        let marker = Instruction::Call {
            callee: callee.to_owned(),
            arguments,
            destination: None,
        };

        let present = function
            .block(block)
            .instructions
            .iter()
            .any(|instruction| *function.instruction(*instruction) == marker);

        if !present {
            function.insert_before_terminator(block, marker);
        }
    }

    fn create_loop_merge(&self, function: &mut Function, header: BlockId, merge: BlockId, continue_block: BlockId) {
        self.insert_marker(
            function,
            header,
            &self.markers.loop_merge,
            vec![Operand::Label(merge), Operand::Label(continue_block)],
        );
        self.insert_marker(function, merge, &self.markers.merge_block, Vec::new());
        self.insert_marker(function, continue_block, &self.markers.continue_block, Vec::new());
    }

    fn create_selection_merge(&self, function: &mut Function, header: BlockId, merge: BlockId) {
        self.insert_marker(
            function,
            header,
            &self.markers.selection_merge,
            vec![Operand::Label(merge)],
        );
        self.insert_marker(function, merge, &self.markers.merge_block, Vec::new());
    }
}

/// A loop header branching conditionally into its own body needs the branch
/// moved into a block of its own, wrapped in a selection
pub fn needs_fake_selection(pool: &CfgNodePool, id: NodeId) -> bool {
    let node = pool.node(id);
    let MergeInfo {
        merge_block,
        continue_block,
    } = node.ir.merge_info;

    match node.ir.terminator {
        Terminator::Condition {
            true_block,
            false_block,
            ..
        } if node.merge == MergeType::Loop => [true_block, false_block]
            .iter()
            .all(|target| Some(*target) != merge_block && Some(*target) != continue_block),
        _ => false,
    }
}

fn translate_block(
    function: &Function,
    pool: &mut CfgNodePool,
    block_map: &HashMap<BlockId, NodeId>,
    block: BlockId,
    markers: &MarkerNames,
) -> Result<(), CfgError> {
    let kind = terminator_kind(function, block, markers)?;
    let id = block_map[&block];

    let instructions = &function.block(block).instructions;
    let Some((terminator, body)) = instructions.split_last() else {
        return Err(CfgError::EmptyBlock {
            block: function.block_name(block).to_owned(),
        });
    };

    let node_of = |target: BlockId| {
        block_map.get(&target).copied().ok_or_else(|| {
            unsupported_terminator(function, block, function.instruction(*terminator))
        })
    };

    let mut phi = Vec::new();
    let mut operations = Vec::new();

    for instruction in body {
        match function.instruction(*instruction) {
            Instruction::Phi {
                destination,
                sources,
            } => {
                let mut seen = HashSet::new();
                let mut incoming = Vec::new();

                // Duplicate incoming blocks carry the same value, first wins
                for (source, value) in sources {
                    if !seen.insert(*source) {
                        continue;
                    }

                    match block_map.get(source) {
                        Some(node) => incoming.push(IncomingValue {
                            block: *node,
                            value: *value,
                        }),
                        None => warn!(
                            "phi in `{}` names `{}` which is not part of the function",
                            function.block_name(block),
                            function.block_name(*source)
                        ),
                    }
                }

                phi.push(Phi {
                    instruction: *instruction,
                    destination: *destination,
                    incoming,
                });
            }
            other if other.is_terminator() => {
                return Err(unsupported_terminator(function, block, other));
            }
            _ => operations.push(*instruction),
        }
    }

    let terminator = match function.instruction(*terminator) {
        Instruction::Jump { destination } => Terminator::Branch {
            target: node_of(*destination)?,
        },
        Instruction::Branch {
            condition,
            positive,
            negative,
        } => Terminator::Condition {
            condition: *condition,
            true_block: node_of(*positive)?,
            false_block: node_of(*negative)?,
        },
        Instruction::Return { value } => Terminator::Return { value: *value },
        Instruction::Switch {
            condition,
            default,
            cases,
        } => {
            let mut translated = vec![Case {
                node: node_of(*default)?,
                value: None,
                is_default: true,
            }];

            for (value, target) in cases {
                translated.push(Case {
                    node: node_of(*target)?,
                    value: Some(*value),
                    is_default: false,
                });
            }

            Terminator::Switch {
                condition: *condition,
                cases: translated,
            }
        }
        _ if kind == TerminatorKind::Kill => Terminator::Kill,
        _ => Terminator::Unreachable,
    };

    let targets = terminator.targets();

    pool.node_mut(id).ir = NodeIr {
        terminator,
        phi,
        operations,
        merge_info: MergeInfo::default(),
    };

    for target in targets {
        pool.add_branch(id, target);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::lir::{Module, parser::Parser, pretty_print::print_module_plain};

    fn parse(source: &str) -> Module {
        Parser::parse_module(source).unwrap()
    }

    #[test]
    fn classifies_terminators() {
        let module = parse(indoc! {"
            fn f(%0) {
            entry:
                switch %0, a, [1: b, 2: b]
            a:
                call @cfg.discard_fragment()
                unreachable
            b:
                br %0, c, d
            c:
                unreachable
            d:
                ret
            }
        "});

        let function = &module.functions[0];
        let mut pool = CfgNodePool::new();
        let translator = CfgTranslator::run(function, &mut pool, &MarkerNames::default()).unwrap();

        let kinds = pool
            .live_nodes()
            .into_iter()
            .map(|id| pool.node(id).ir.terminator.kind())
            .collect::<Vec<_>>();

        assert_eq!(
            kinds,
            vec![
                TerminatorKind::Switch,
                TerminatorKind::Kill,
                TerminatorKind::Condition,
                TerminatorKind::Unreachable,
                TerminatorKind::Return,
            ]
        );

        let entry = pool.node(translator.entry());
        assert_eq!(entry.name, "entry");
        // Successor edges are unique even though `b` appears twice
        assert_eq!(entry.succ.len(), 2);

        let Terminator::Switch { cases, .. } = &entry.ir.terminator else {
            panic!("entry should end in a switch");
        };
        assert!(cases[0].is_default);
        assert_eq!(cases.len(), 3);
    }

    #[test]
    fn coalesces_duplicate_phi_sources() {
        let module = parse(indoc! {"
            fn f(%0) {
            entry:
                br %0, join, join
            join:
                %1 = phi(entry -> 1, entry -> 1)
                ret %1
            }
        "});

        let mut pool = CfgNodePool::new();
        CfgTranslator::run(&module.functions[0], &mut pool, &MarkerNames::default()).unwrap();

        let join = pool.live_nodes()[1];
        assert_eq!(pool.node(join).ir.phi[0].incoming.len(), 1);
        assert_eq!(pool.node(join).pred.len(), 1);
    }

    #[test]
    fn rejects_missing_terminator() {
        let module = parse(indoc! {"
            fn f(%0) {
            entry:
                %1 = add %0, 1
            }
        "});

        let mut pool = CfgNodePool::new();
        let error = CfgTranslator::run(&module.functions[0], &mut pool, &MarkerNames::default()).unwrap_err();

        assert_eq!(
            error,
            CfgError::UnsupportedTerminator {
                block: "entry".to_owned(),
                instruction: "%1 = add %0, 1".to_owned(),
            }
        );
    }

    #[test]
    fn round_trip_without_changes_keeps_the_function() {
        let source = indoc! {"
            fn f(%0) {
            entry:
                br %0, left, right
            left:
                jmp join
            right:
                jmp join
            join:
                %1 = phi(left -> 1, right -> 2)
                ret %1
            }
        "};

        let mut module = parse(source);
        let function = &mut module.functions[0];
        let mut pool = CfgNodePool::new();
        let mut translator = CfgTranslator::run(function, &mut pool, &MarkerNames::default()).unwrap();

        let entry = translator.entry();
        translator.cfg_to_lir(function, &mut pool, entry, false).unwrap();

        assert_eq!(print_module_plain(&module), source);
    }

    #[test]
    fn unreachable_blocks_are_removed() {
        let mut module = parse(indoc! {"
            fn f() {
            entry:
                ret
            dead:
                jmp also_dead
            also_dead:
                jmp dead
            }
        "});

        let function = &mut module.functions[0];
        let mut pool = CfgNodePool::new();
        let mut translator = CfgTranslator::run(function, &mut pool, &MarkerNames::default()).unwrap();

        let entry = translator.entry();
        translator.cfg_to_lir(function, &mut pool, entry, true).unwrap();

        assert_eq!(function.layout.len(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn duplicate_predecessor_edges_repeat_phi_sources() {
        let mut module = parse(indoc! {"
            fn f(%0) {
            entry:
                switch %0, exit, [1: exit, 2: other]
            other:
                jmp exit
            exit:
                %1 = phi(entry -> 7, other -> 8)
                ret %1
            }
        "});

        let function = &mut module.functions[0];
        let mut pool = CfgNodePool::new();
        let mut translator = CfgTranslator::run(function, &mut pool, &MarkerNames::default()).unwrap();

        let entry = translator.entry();
        translator.cfg_to_lir(function, &mut pool, entry, false).unwrap();

        let exit = function.block_by_name("exit").unwrap();
        let Instruction::Phi { sources, .. } = function.instruction(function.phis(exit)[0]) else {
            panic!("expected a phi");
        };

        let entry_block = function.block_by_name("entry").unwrap();
        assert_eq!(sources.iter().filter(|(block, _)| *block == entry_block).count(), 2);
        assert_eq!(sources.len(), function.predecessors(exit).len());
    }
}
