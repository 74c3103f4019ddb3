use std::collections::BTreeSet;

use crate::bytecode::image::{ImageError, ProgramImage};
use crate::bytecode::op::{Op, OpCode};

/// Disassemble an image into textual bytecode.
///
/// Every line starts with the instruction's cell address. Jump and call
/// targets are marked in comments, so the text parses back into the same
/// image.
pub fn format_program(image: &ProgramImage) -> Result<String, ImageError> {
    let instructions = image.instructions()?;
    Ok(format_instructions(&instructions, image.len()))
}

pub fn format_instructions(instructions: &[(usize, Op)], cells: usize) -> String {
    let targets = collect_jump_targets(instructions);
    let mut out = format!("; {} instructions, {} cells\n", instructions.len(), cells);

    for (at, op) in instructions {
        if targets.contains(at) {
            out.push_str(";     ┌──────────────────────────────────\n");
        }

        let text = op.to_string();
        out.push_str(&format!("{:04}: {}", at, text));

        let note = match op.opcode() {
            OpCode::Jmp | OpCode::Jif => op.target().map(|t| format!("-> {:04}", t)),
            OpCode::Call => op.target().map(|t| format!("call {:04}", t)),
            _ => None,
        };
        let mark = targets.contains(at).then_some("►");

        match (mark, note) {
            (None, None) => {}
            (mark, note) => {
                let pad = 24usize.saturating_sub(text.len());
                let parts: Vec<String> = mark
                    .map(str::to_string)
                    .into_iter()
                    .chain(note)
                    .collect();
                out.push_str(&format!("{:pad$} ; {}", "", parts.join(" "), pad = pad));
            }
        }
        out.push('\n');
    }

    out
}

fn collect_jump_targets(instructions: &[(usize, Op)]) -> BTreeSet<usize> {
    instructions
        .iter()
        .filter_map(|(_, op)| op.target())
        .collect()
}
