//! Textual bytecode.
//!
//! A program is a stream of `NAME operand...` groups, each carrying exactly
//! the arity of its instruction. Names are case-insensitive, whitespace and
//! line breaks are insignificant and `;` starts a comment running to the end
//! of the line. A token of the form `0012:` asserts the cell address of the
//! next instruction, so disassembler output reads back unchanged.

use thiserror::Error;

use crate::bytecode::image::ProgramImage;
use crate::bytecode::op::{DecodeError, Op, OpCode};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AsmError {
    #[error("line {line}: unknown instruction '{name}'")]
    UnknownInstruction { line: usize, name: String },

    #[error("line {line}: {op} takes {expected} operand(s), found {found}")]
    Arity {
        line: usize,
        op: OpCode,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: invalid operand for {op}: {source}")]
    Operand {
        line: usize,
        op: OpCode,
        #[source]
        source: DecodeError,
    },

    #[error("line {line}: address label {label} does not match position {actual}")]
    Address {
        line: usize,
        label: String,
        actual: usize,
    },
}

struct Word<'s> {
    line: usize,
    text: &'s str,
}

fn words(source: &str) -> Vec<Word<'_>> {
    source
        .lines()
        .enumerate()
        .flat_map(|(i, line)| {
            let code = line.split(';').next().unwrap_or("");
            code.split_whitespace().map(move |text| Word { line: i + 1, text })
        })
        .collect()
}

/// Parse textual bytecode into instructions.
pub fn parse(source: &str) -> Result<Vec<Op>, AsmError> {
    let words = words(source);
    let mut ops = Vec::new();
    let mut pos = 0;
    let mut i = 0;

    while i < words.len() {
        let word = &words[i];
        i += 1;

        if let Some(label) = word.text.strip_suffix(':') {
            if label.parse::<usize>().ok() != Some(pos) {
                return Err(AsmError::Address {
                    line: word.line,
                    label: label.to_string(),
                    actual: pos,
                });
            }
            continue;
        }

        let op = OpCode::from_name(word.text).ok_or_else(|| AsmError::UnknownInstruction {
            line: word.line,
            name: word.text.to_string(),
        })?;

        let mut operands = Vec::with_capacity(op.arity());
        while operands.len() < op.arity() {
            match words.get(i).and_then(|w| w.text.parse::<f64>().ok()) {
                Some(value) => {
                    operands.push(value);
                    i += 1;
                }
                None => {
                    return Err(AsmError::Arity {
                        line: word.line,
                        op,
                        expected: op.arity(),
                        found: operands.len(),
                    });
                }
            }
        }

        // a number left over means the instruction was given too many
        if let Some(extra) = words.get(i).filter(|w| w.text.parse::<f64>().is_ok()) {
            return Err(AsmError::Arity {
                line: extra.line,
                op,
                expected: op.arity(),
                found: op.arity() + 1,
            });
        }

        let decoded = Op::from_parts(op, &operands).map_err(|source| AsmError::Operand {
            line: word.line,
            op,
            source,
        })?;
        pos += decoded.width();
        ops.push(decoded);
    }

    Ok(ops)
}

/// Parse and encode into a loadable image.
pub fn assemble(source: &str) -> Result<ProgramImage, AsmError> {
    Ok(ProgramImage::from_ops(&parse(source)?))
}
