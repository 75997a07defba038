//! LIR (Low-level Intermediate Representation). This is the form the rest of
//! the compiler hands to the structurizer: SSA registers, PHI instructions and
//! plain labels and jumps. Blocks and instructions live in per-function arenas
//! so they can be referenced by id from the CFG model without any ownership
//! cycles.

use strum::{Display, EnumString};

use crate::index::{IndexVec, simple_index};

pub mod lexer;
pub mod parser;
pub mod pretty_print;

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub arguments: Vec<RegisterId>,
    /// Block order, the first block is the entry block
    pub layout: Vec<BlockId>,
    pub blocks: IndexVec<BlockId, Block>,
    pub instructions: IndexVec<InstructionId, Instruction>,
    next_register: u32,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    pub instructions: Vec<InstructionId>,
    pub erased: bool,
}

simple_index! {
    /// Identifies an LIR block
    pub struct BlockId;
}

simple_index! {
    /// Identifies an instruction in the instruction arena of a function
    pub struct InstructionId;
}

simple_index! {
    /// Identifies a virtual LIR register which holds an SSA value
    pub struct RegisterId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    Neg,
    Select,
    Copy,
    Load,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Immediate {
    Int(i64),
    Bool(bool),
    Undef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Immediate(Immediate),
    Register(RegisterId),
    /// A reference to a block as a value, only used by marker intrinsics
    Label(BlockId),
}

impl Operand {
    pub const UNDEF: Self = Self::Immediate(Immediate::Undef);
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Phi {
        destination: RegisterId,
        /// May list the same block more than once if the block branches here
        /// through several edges
        sources: Vec<(BlockId, Operand)>,
    },
    Operation {
        opcode: Opcode,
        destination: Option<RegisterId>,
        operands: Vec<Operand>,
    },
    Call {
        callee: String,
        arguments: Vec<Operand>,
        destination: Option<RegisterId>,
    },
    Jump {
        destination: BlockId,
    },
    Branch {
        condition: Operand,
        positive: BlockId,
        negative: BlockId,
    },
    Switch {
        condition: Operand,
        default: BlockId,
        cases: Vec<(i64, BlockId)>,
    },
    Return {
        value: Option<Operand>,
    },
    Unreachable,
}

impl Instruction {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Jump { .. }
                | Self::Branch { .. }
                | Self::Switch { .. }
                | Self::Return { .. }
                | Self::Unreachable
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Self::Phi { .. })
    }

    pub fn is_call_to(&self, name: &str) -> bool {
        matches!(self, Self::Call { callee, .. } if callee == name)
    }

    pub fn destination(&self) -> Option<RegisterId> {
        match self {
            Self::Phi { destination, .. } => Some(*destination),
            Self::Operation { destination, .. } | Self::Call { destination, .. } => *destination,
            _ => None,
        }
    }

    pub fn set_destination(&mut self, register: RegisterId) {
        match self {
            Self::Phi { destination, .. } => *destination = register,
            Self::Operation { destination, .. } | Self::Call { destination, .. } => {
                *destination = Some(register)
            }
            _ => panic!("instruction does not define a value: {self:?}"),
        }
    }

    /// Value operands in order. Phi sources only contribute their values.
    pub fn operands(&self) -> Vec<Operand> {
        match self {
            Self::Phi { sources, .. } => sources.iter().map(|(_, value)| *value).collect(),
            Self::Operation { operands, .. } => operands.clone(),
            Self::Call { arguments, .. } => arguments.clone(),
            Self::Branch { condition, .. } | Self::Switch { condition, .. } => vec![*condition],
            Self::Return { value } => value.iter().copied().collect(),
            Self::Jump { .. } | Self::Unreachable => Vec::new(),
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Operand> {
        match self {
            Self::Phi { sources, .. } => sources.iter_mut().map(|(_, value)| value).collect(),
            Self::Operation { operands, .. } => operands.iter_mut().collect(),
            Self::Call { arguments, .. } => arguments.iter_mut().collect(),
            Self::Branch { condition, .. } | Self::Switch { condition, .. } => vec![condition],
            Self::Return { value } => value.iter_mut().collect(),
            Self::Jump { .. } | Self::Unreachable => Vec::new(),
        }
    }

    /// Successor blocks of a terminator, one entry per edge
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Self::Jump { destination } => vec![*destination],
            Self::Branch {
                positive, negative, ..
            } => vec![*positive, *negative],
            Self::Switch { default, cases, .. } => std::iter::once(*default)
                .chain(cases.iter().map(|(_, target)| *target))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn uses_register(&self, register: RegisterId) -> bool {
        self.operands()
            .iter()
            .any(|operand| *operand == Operand::Register(register))
    }

    pub fn uses_block(&self, block: BlockId) -> bool {
        if self.successors().contains(&block) {
            return true;
        }

        if let Self::Phi { sources, .. } = self {
            if sources.iter().any(|(source, _)| *source == block) {
                return true;
            }
        }

        self.operands()
            .iter()
            .any(|operand| *operand == Operand::Label(block))
    }

    /// Forget every value and block this instruction refers to. Used before
    /// erasing whole regions of code that may reference each other.
    pub fn drop_all_references(&mut self) {
        match self {
            Self::Phi { sources, .. } => sources.clear(),
            Self::Jump { .. } | Self::Branch { .. } | Self::Switch { .. } => {
                *self = Self::Unreachable
            }
            _ => {
                for operand in self.operands_mut() {
                    *operand = Operand::UNDEF;
                }
            }
        }
    }

    /// Rewrites uses of `old` to `new`. Returns whether anything changed.
    pub fn replace_register_uses(&mut self, old: RegisterId, new: Operand) -> bool {
        let mut changed = false;

        for operand in self.operands_mut() {
            if *operand == Operand::Register(old) {
                *operand = new;
                changed = true;
            }
        }

        changed
    }
}

impl Function {
    pub fn new(name: impl Into<String>, arguments: Vec<RegisterId>) -> Self {
        let next_register = arguments.iter().map(|a| a.0 + 1).max().unwrap_or(0);

        Self {
            name: name.into(),
            arguments,
            layout: Vec::new(),
            blocks: IndexVec::new(),
            instructions: IndexVec::new(),
            next_register,
        }
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    pub fn block(&self, block: BlockId) -> &Block {
        &self.blocks[block]
    }

    pub fn block_name(&self, block: BlockId) -> &str {
        &self.blocks[block].name
    }

    pub fn block_by_name(&self, name: &str) -> Option<BlockId> {
        self.layout
            .iter()
            .copied()
            .find(|block| self.blocks[*block].name == name)
    }

    fn unique_block_name(&self, name: &str) -> String {
        let taken = |candidate: &str| {
            self.blocks
                .iter()
                .any(|block| !block.erased && block.name == candidate)
        };

        if !taken(name) {
            return name.to_owned();
        }

        let mut n = 1;
        loop {
            let candidate = format!("{name}.{n}");
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn allocate_block(&mut self, name: &str) -> BlockId {
        let name = self.unique_block_name(name);
        let id = self.blocks.next_index();

        self.blocks.push(Block {
            id,
            name,
            instructions: Vec::new(),
            erased: false,
        })
    }

    /// Creates an empty block at the end of the layout
    pub fn create_block(&mut self, name: &str) -> BlockId {
        let id = self.allocate_block(name);
        self.layout.push(id);
        id
    }

    pub fn create_block_before(&mut self, name: &str, before: BlockId) -> BlockId {
        let id = self.allocate_block(name);
        let position = self.layout_position(before);
        self.layout.insert(position, id);
        id
    }

    pub fn create_block_after(&mut self, name: &str, after: BlockId) -> BlockId {
        let id = self.allocate_block(name);
        let position = self.layout_position(after);
        self.layout.insert(position + 1, id);
        id
    }

    fn layout_position(&self, block: BlockId) -> usize {
        self.layout
            .iter()
            .position(|b| *b == block)
            .unwrap_or_else(|| panic!("block `{}` is not in the layout", self.block_name(block)))
    }

    pub fn move_block_to_front(&mut self, block: BlockId) {
        let position = self.layout_position(block);
        self.layout.remove(position);
        self.layout.insert(0, block);
    }

    /// Removes an (empty) block from the function
    pub fn erase_block(&mut self, block: BlockId) {
        let position = self.layout_position(block);
        self.layout.remove(position);

        let block = &mut self.blocks[block];
        block.instructions.clear();
        block.erased = true;
    }

    pub fn create_register(&mut self) -> RegisterId {
        let id = RegisterId(self.next_register);
        self.next_register += 1;
        id
    }

    /// Makes sure freshly created registers never collide with `register`
    pub fn reserve_register(&mut self, register: RegisterId) {
        self.next_register = self.next_register.max(register.0 + 1);
    }

    pub fn instruction(&self, id: InstructionId) -> &Instruction {
        &self.instructions[id]
    }

    pub fn instruction_mut(&mut self, id: InstructionId) -> &mut Instruction {
        &mut self.instructions[id]
    }

    pub fn push_instruction(&mut self, block: BlockId, instruction: Instruction) -> InstructionId {
        let id = self.instructions.push(instruction);
        self.blocks[block].instructions.push(id);
        id
    }

    pub fn insert_instruction(
        &mut self,
        block: BlockId,
        position: usize,
        instruction: Instruction,
    ) -> InstructionId {
        let id = self.instructions.push(instruction);
        self.blocks[block].instructions.insert(position, id);
        id
    }

    /// Inserts before the terminator, or at the end if there is none yet
    pub fn insert_before_terminator(
        &mut self,
        block: BlockId,
        instruction: Instruction,
    ) -> InstructionId {
        let position = match self.terminator(block) {
            Some(_) => self.blocks[block].instructions.len() - 1,
            None => self.blocks[block].instructions.len(),
        };

        self.insert_instruction(block, position, instruction)
    }

    /// Inserts after the leading phi instructions of a block
    pub fn insert_after_phis(&mut self, block: BlockId, instruction: Instruction) -> InstructionId {
        let position = self.phis(block).len();
        self.insert_instruction(block, position, instruction)
    }

    /// Detaches an instruction from its block
    pub fn erase_instruction(&mut self, block: BlockId, id: InstructionId) {
        self.blocks[block].instructions.retain(|i| *i != id);
    }

    pub fn terminator(&self, block: BlockId) -> Option<InstructionId> {
        self.blocks[block]
            .instructions
            .last()
            .copied()
            .filter(|id| self.instructions[*id].is_terminator())
    }

    pub fn phis(&self, block: BlockId) -> Vec<InstructionId> {
        self.blocks[block]
            .instructions
            .iter()
            .copied()
            .take_while(|id| self.instructions[*id].is_phi())
            .collect()
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.terminator(block)
            .map(|id| self.instructions[id].successors())
            .unwrap_or_default()
    }

    /// Predecessor blocks, one entry per incoming edge
    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        let mut predecessors = Vec::new();

        for candidate in &self.layout {
            for successor in self.successors(*candidate) {
                if successor == block {
                    predecessors.push(*candidate);
                }
            }
        }

        predecessors
    }

    /// Every instruction still attached to a block in the layout
    pub fn live_instructions(&self) -> impl Iterator<Item = (BlockId, InstructionId)> + '_ {
        self.layout.iter().flat_map(|block| {
            self.blocks[*block]
                .instructions
                .iter()
                .map(move |instruction| (*block, *instruction))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;

    fn diamond() -> Function {
        let mut function = Function::new("diamond", vec![RegisterId::new(0)]);

        let a = function.create_block("a");
        let b = function.create_block("b");
        let c = function.create_block("c");

        function.push_instruction(
            a,
            Instruction::Branch {
                condition: Operand::Register(RegisterId::new(0)),
                positive: b,
                negative: b,
            },
        );
        function.push_instruction(b, Instruction::Jump { destination: c });
        function.push_instruction(c, Instruction::Return { value: None });

        function
    }

    #[test]
    fn predecessors_count_every_edge() {
        let function = diamond();
        let a = function.block_by_name("a").unwrap();
        let b = function.block_by_name("b").unwrap();

        assert_eq!(function.predecessors(b), vec![a, a]);
    }

    #[test]
    fn block_names_stay_unique() {
        let mut function = diamond();

        let first = function.create_block("b");
        let second = function.create_block("b");

        assert_eq!(function.block_name(first), "b.1");
        assert_eq!(function.block_name(second), "b.2");
    }

    #[test]
    fn fresh_registers_skip_arguments() {
        let mut function = diamond();

        assert_eq!(function.create_register(), RegisterId::new(1));
    }

    #[test]
    fn dropping_references_clears_block_uses() {
        let mut function = diamond();
        let a = function.block_by_name("a").unwrap();
        let b = function.block_by_name("b").unwrap();
        let terminator = function.terminator(a).unwrap();

        assert!(function.instruction(terminator).uses_block(b));

        function.instruction_mut(terminator).drop_all_references();

        assert!(!function.instruction(terminator).uses_block(b));
    }
}
