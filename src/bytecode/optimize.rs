use crate::bytecode::op::Op;
use crate::bytecode::token::Token;

/// What to do with one adjacent pair of resolved instructions.
enum Rewrite {
    Drop,
    Replace(Op),
}

fn rewrite(first: &Op, second: &Op) -> Option<Rewrite> {
    match (first, second) {
        (Op::Not, Op::Not) | (Op::Neg, Op::Neg) => Some(Rewrite::Drop),
        // a + -b  ==  a - b
        (Op::Neg, Op::Add) => Some(Rewrite::Replace(Op::Sub)),
        // a - -b  ==  a + b
        (Op::Neg, Op::Sub) => Some(Rewrite::Replace(Op::Add)),
        _ => None,
    }
}

/// Peephole pass over a finished token list.
///
/// Only pairs of resolved instructions are folded; a placeholder on either
/// side blocks the merge. After a rewrite the scan steps back one slot so a
/// pair made adjacent by the removal is looked at too, which makes the pass
/// idempotent.
pub fn optimize(tokens: Vec<Token>) -> Vec<Token> {
    let mut out = tokens;
    let mut i = 0;

    while i + 1 < out.len() {
        let action = match (out[i].ready(), out[i + 1].ready()) {
            (Some(a), Some(b)) => rewrite(a, b),
            _ => None,
        };

        match action {
            Some(Rewrite::Drop) => {
                out.drain(i..i + 2);
                i = i.saturating_sub(1);
            }
            Some(Rewrite::Replace(op)) => {
                out.splice(i..i + 2, [Token::Ready(op)]);
                i = i.saturating_sub(1);
            }
            None => i += 1,
        }
    }

    out
}
