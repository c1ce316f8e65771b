//! Peephole optimisation and label linking
//!
//! The peephole pass fuses adjacent instructions; it never rewrites across
//! a label, since a label is a potential jump target. The linker then
//! resolves labels to relative offsets and strips the markers.

use crate::compiler::instructions::Instruction;

/// Run the peephole rewrites to a fixed point.
pub fn optimize(mut instructions: Vec<Instruction>) -> Vec<Instruction> {
    loop {
        let before = instructions.len();
        instructions = pass(instructions);
        if instructions.len() == before {
            return instructions;
        }
    }
}

fn pass(instructions: Vec<Instruction>) -> Vec<Instruction> {
    let mut out: Vec<Instruction> = Vec::with_capacity(instructions.len());
    for instruction in instructions {
        match (out.last(), &instruction) {
            (Some(Instruction::Compose(n)), Instruction::Compose(m)) => {
                let fused = Instruction::Compose(n + m - 1);
                out.pop();
                out.push(fused);
            }
            (Some(Instruction::Compose(n)), Instruction::Append(m)) => {
                let fused = Instruction::Append(n + m - 1);
                out.pop();
                out.push(fused);
            }
            (Some(Instruction::Mul), Instruction::Add) => {
                out.pop();
                out.push(Instruction::MulAdd);
            }
            (Some(Instruction::Literal(value)), Instruction::Append(count))
                if value.is_empty() =>
            {
                out.pop();
                if *count > 1 {
                    out.push(Instruction::Append(count - 1));
                }
            }
            (Some(Instruction::Literal(value)), Instruction::AppendRoot)
                if value.is_empty() =>
            {
                out.pop();
            }
            _ => out.push(instruction),
        }
    }
    out
}

/// Resolve each jump's label to a relative offset (applied after the fetch
/// has advanced the program counter) and strip the label markers.
pub fn link(instructions: Vec<Instruction>) -> Vec<Instruction> {
    let mut addresses = rustc_hash::FxHashMap::default();
    let mut address = 0usize;
    for instruction in &instructions {
        if let Instruction::Label(label) = instruction {
            addresses.insert(*label, address);
        } else {
            address += 1;
        }
    }
    let mut out = Vec::with_capacity(address);
    for instruction in instructions {
        let address = out.len() as isize;
        match instruction {
            Instruction::Label(_) => {}
            Instruction::Jump { label, .. } => out.push(Instruction::Jump {
                label,
                offset: addresses[&label] as isize - address - 1,
            }),
            Instruction::BranchTrue { label, .. } => out.push(Instruction::BranchTrue {
                label,
                offset: addresses[&label] as isize - address - 1,
            }),
            Instruction::BranchFalse { label, .. } => out.push(Instruction::BranchFalse {
                label,
                offset: addresses[&label] as isize - address - 1,
            }),
            Instruction::Next { names, label, .. } => out.push(Instruction::Next {
                names,
                label,
                offset: addresses[&label] as isize - address - 1,
            }),
            Instruction::PushNext { label, .. } => out.push(Instruction::PushNext {
                label,
                offset: addresses[&label] as isize - address - 1,
            }),
            instruction => out.push(instruction),
        }
    }
    out
}
