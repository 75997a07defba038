use std::fmt::Write;

use colored::Colorize;
use itertools::Itertools;

use super::{BlockId, Function, Immediate, Instruction, Module, Operand};
use crate::index::Index;

/// Renders a module with terminal colors. Every function is followed by a
/// blank line.
pub fn pretty_print_module(module: &Module) -> String {
    module
        .functions
        .iter()
        .map(pretty_print_function)
        .join("\n")
}

/// Same as [`pretty_print_module`] without the color codes, parseable by
/// [`super::parser::Parser`]
pub fn print_module_plain(module: &Module) -> String {
    strip_ansi_escapes::strip_str(pretty_print_module(module))
}

pub fn print_instruction_plain(function: &Function, instruction: &Instruction) -> String {
    strip_ansi_escapes::strip_str(
        InstructionPrinter {
            function,
            instruction,
        }
        .to_string(),
    )
}

pub fn pretty_print_function(function: &Function) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "{} {}{}{}{}",
        "fn".magenta(),
        function.name.as_str().blue(),
        "(".white(),
        function
            .arguments
            .iter()
            .map(|arg| format!("%{}", arg.index()).yellow().to_string())
            .join(", "),
        ") {".white()
    );

    for block in &function.layout {
        let _ = writeln!(out, "{}", format!("{}:", function.block_name(*block)).bright_red());

        for instruction in &function.block(*block).instructions {
            let _ = writeln!(
                out,
                "    {}",
                InstructionPrinter {
                    function,
                    instruction: function.instruction(*instruction),
                }
            );
        }
    }

    let _ = writeln!(out, "{}", "}".white());

    out
}

/// Instructions refer to blocks by id, so printing needs the function for
/// block names
pub struct InstructionPrinter<'a> {
    pub function: &'a Function,
    pub instruction: &'a Instruction,
}

impl InstructionPrinter<'_> {
    fn block(&self, block: BlockId) -> String {
        self.function.block_name(block).blue().to_string()
    }

    fn operand(&self, operand: &Operand) -> String {
        match operand {
            Operand::Immediate(immediate) => immediate.to_string().purple().to_string(),
            Operand::Register(register) => format!("%{}", register.index()).yellow().to_string(),
            Operand::Label(block) => format!("{} {}", "label".cyan(), self.block(*block)),
        }
    }

    fn operands<'o>(&self, operands: impl IntoIterator<Item = &'o Operand>) -> String {
        operands
            .into_iter()
            .map(|operand| self.operand(operand))
            .join(", ")
    }
}

impl core::fmt::Display for InstructionPrinter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(destination) = self.instruction.destination() {
            write!(
                f,
                "{} {} ",
                format!("%{}", destination.index()).yellow(),
                "=".white()
            )?;
        }

        match self.instruction {
            Instruction::Phi { sources, .. } => write!(
                f,
                "{}{}{}{}",
                "phi".bright_green(),
                "(".white(),
                sources
                    .iter()
                    .map(|(block, value)| format!("{} -> {}", self.block(*block), self.operand(value)))
                    .join(", "),
                ")".white()
            ),
            Instruction::Operation {
                opcode, operands, ..
            } => {
                write!(f, "{}", opcode.to_string().cyan())?;

                if !operands.is_empty() {
                    write!(f, " {}", self.operands(operands))?;
                }

                Ok(())
            }
            Instruction::Call {
                callee, arguments, ..
            } => write!(
                f,
                "{} {}{}{}{}",
                "call".cyan(),
                format!("@{callee}").blue(),
                "(".white(),
                self.operands(arguments),
                ")".white()
            ),
            Instruction::Jump { destination } => {
                write!(f, "{} {}", "jmp".cyan(), self.block(*destination))
            }
            Instruction::Branch {
                condition,
                positive,
                negative,
            } => write!(
                f,
                "{} {}, {}, {}",
                "br".cyan(),
                self.operand(condition),
                self.block(*positive),
                self.block(*negative)
            ),
            Instruction::Switch {
                condition,
                default,
                cases,
            } => write!(
                f,
                "{} {}, {}, [{}]",
                "switch".cyan(),
                self.operand(condition),
                self.block(*default),
                cases
                    .iter()
                    .map(|(value, block)| format!(
                        "{}: {}",
                        value.to_string().purple(),
                        self.block(*block)
                    ))
                    .join(", ")
            ),
            Instruction::Return { value: Some(value) } => {
                write!(f, "{} {}", "ret".cyan(), self.operand(value))
            }
            Instruction::Return { value: None } => write!(f, "{}", "ret".cyan()),
            Instruction::Unreachable => write!(f, "{}", "unreachable".cyan()),
        }
    }
}

impl core::fmt::Display for Immediate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Immediate::Int(value) => write!(f, "{value}"),
            Immediate::Bool(value) => write!(f, "{value}"),
            Immediate::Undef => write!(f, "undef"),
        }
    }
}
