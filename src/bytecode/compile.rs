//! Code generator: typed syntax tree to a flat program image.
//!
//! Every statement emitter returns its own token list and advances `pos`,
//! the address its first token lands at. Jumps are emitted as placeholders
//! and resolved by the construct that owns them once its span is known;
//! calls wait for the final pass, after every function has an entry address.
//!
//! Expression emitters never move `pos`. Their lists hold no jump targets,
//! so they are run through the peephole pass before being committed.

use std::collections::HashMap;

use tracing::debug;

use crate::bytecode::compile_error::{CompileError, Result};
use crate::bytecode::image::ProgramImage;
use crate::bytecode::op::Op;
use crate::bytecode::optimize::optimize;
use crate::bytecode::token::{Resolution, Target, Token, finish, resolve_all, width_of};
use crate::lang::{
    BinaryOp, Branch, Expr, Function, FunctionId, Place, Program, Stmt, UnaryOp, Var,
};
use crate::runtime::linker::LinkTable;

/// What a call site needs to know about its callee.
#[derive(Debug, Clone)]
struct Callee {
    name: String,
    params: usize,
    locals: usize,
    returns_value: bool,
    native: Option<String>,
}

pub struct Compiler<'a> {
    links: &'a LinkTable,
    functions: HashMap<FunctionId, Callee>,

    /// Address of the next committed token.
    pos: usize,

    /// Name of the code being compiled, for error messages.
    context: String,
}

impl<'a> Compiler<'a> {
    pub fn new(links: &'a LinkTable) -> Self {
        Self {
            links,
            functions: HashMap::new(),
            pos: 0,
            context: "top level".to_string(),
        }
    }

    /// Compile a whole program.
    ///
    /// Layout: `ENTER globals`, the top-level statements, an implicit return
    /// when they can fall through, then every non-native function in
    /// declaration order.
    pub fn compile_program(mut self, program: &Program) -> Result<ProgramImage> {
        for f in &program.functions {
            self.functions.insert(
                f.id,
                Callee {
                    name: f.name.clone(),
                    params: f.params.len(),
                    locals: f.locals,
                    returns_value: !f.returns.is_void(),
                    native: f.native.clone(),
                },
            );
        }

        let mut tokens = Vec::new();
        self.context = "top level".to_string();
        self.emit(&mut tokens, Op::Enter(program.globals));
        tokens.extend(self.block(&program.body)?);
        if !always_returns(&program.body) {
            self.emit_implicit_return(&mut tokens);
        }
        self.check_closed(&tokens)?;

        let mut entries = Vec::new();
        for f in program.functions.iter().filter(|f| !f.is_native()) {
            let entry = self.pos;
            tokens.extend(self.function(f)?);
            debug!(function = %f.name, id = f.id, entry, "compiled function");
            entries.push((f.id, entry));
        }

        for (id, entry) in entries {
            tokens = resolve_all(tokens, &Resolution::Function { id, entry });
        }

        let ops = finish(tokens).map_err(|token| CompileError::UnresolvedToken {
            token: token.to_string(),
            context: "program".to_string(),
        })?;
        let image = ProgramImage::from_ops(&ops);
        debug!(instructions = ops.len(), cells = image.len(), "program compiled");
        Ok(image)
    }

    fn function(&mut self, f: &Function) -> Result<Vec<Token>> {
        self.context = format!("function '{}'", f.name);
        let mut out = Vec::new();

        // arguments arrive in order, the last one on top
        for param in f.params.iter().rev() {
            let store = store_param(param);
            self.commit(&mut out, store);
        }

        out.extend(self.block(&f.body)?);
        if !always_returns(&f.body) {
            self.emit_implicit_return(&mut out);
        }
        self.check_closed(&out)?;
        Ok(out)
    }

    // =========================================================================
    // Emission bookkeeping
    // =========================================================================

    fn emit(&mut self, out: &mut Vec<Token>, op: Op) {
        self.emit_token(out, Token::Ready(op));
    }

    fn emit_token(&mut self, out: &mut Vec<Token>, token: Token) {
        self.pos += token.width();
        out.push(token);
    }

    /// Optimize a straight-line list and append it at `pos`.
    fn commit(&mut self, out: &mut Vec<Token>, tokens: Vec<Token>) {
        let tokens = optimize(tokens);
        self.pos += width_of(&tokens);
        out.extend(tokens);
    }

    fn emit_implicit_return(&mut self, out: &mut Vec<Token>) {
        self.emit(out, Op::Push(0.0));
        self.emit(out, Op::Ret);
    }

    /// Reject placeholders that should have been claimed inside a body.
    fn check_closed(&self, tokens: &[Token]) -> Result<()> {
        for token in tokens {
            let Token::Await { target, .. } = token else {
                continue;
            };
            match target {
                Target::Function(..) => {}
                Target::Start(_) => {
                    return Err(CompileError::JumpOutsideLoop {
                        keyword: "continue",
                        context: self.context.clone(),
                    });
                }
                Target::End(_) => {
                    return Err(CompileError::JumpOutsideLoop {
                        keyword: "break",
                        context: self.context.clone(),
                    });
                }
                Target::LabelStart(label, _) | Target::LabelEnd(label, _) => {
                    return Err(CompileError::UnknownLabel {
                        label: label.clone(),
                        context: self.context.clone(),
                    });
                }
                Target::Last(_) => {
                    return Err(CompileError::UnresolvedToken {
                        token: token.to_string(),
                        context: self.context.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn block(&mut self, stmts: &[Stmt]) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        for stmt in stmts {
            out.extend(self.stmt(stmt)?);
        }
        Ok(out)
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        match stmt {
            Stmt::Expr(expr) => {
                let mut tokens = self.expr(expr)?;
                if self.leaves_value(expr) {
                    tokens.push(Op::Pop.into());
                }
                self.commit(&mut out, tokens);
            }
            Stmt::Decl { var, init } => {
                let tokens = self.decl(var, init.as_ref())?;
                self.commit(&mut out, tokens);
            }
            Stmt::Alloc { var, size } => {
                let tokens = self.resize(var, size, Op::Alloc)?;
                self.commit(&mut out, tokens);
            }
            Stmt::Realloc { var, size } => {
                let tokens = self.resize(var, size, Op::Realloc)?;
                self.commit(&mut out, tokens);
            }
            Stmt::Free { var } => {
                let id = heap_id(var, "free")?;
                self.emit(&mut out, Op::Free(id));
            }
            Stmt::Assign { place, value } => {
                let tokens = self.assign(place, value)?;
                self.commit(&mut out, tokens);
            }
            Stmt::If {
                branches,
                otherwise,
            } => return self.if_chain(branches, otherwise.as_deref()),
            Stmt::While { label, cond, body } => {
                return self.while_loop(label.as_deref(), cond, body);
            }
            Stmt::DoWhile { label, body, cond } => {
                return self.do_while_loop(label.as_deref(), body, cond);
            }
            Stmt::For {
                label,
                init,
                cond,
                step,
                body,
            } => {
                return self.for_loop(
                    label.as_deref(),
                    init.as_deref(),
                    cond.as_ref(),
                    step.as_deref(),
                    body,
                );
            }
            Stmt::Break(label) => {
                let target = match label {
                    Some(l) => Target::LabelEnd(l.clone(), 0),
                    None => Target::End(0),
                };
                self.emit_token(&mut out, Token::jump(target));
            }
            Stmt::Continue(label) => {
                let target = match label {
                    Some(l) => Target::LabelStart(l.clone(), 0),
                    None => Target::Start(0),
                };
                self.emit_token(&mut out, Token::jump(target));
            }
            Stmt::Return(value) => {
                let mut tokens = match value {
                    Some(expr) => self.expr(expr)?,
                    None => vec![Op::Push(0.0).into()],
                };
                tokens.push(Op::Ret.into());
                self.commit(&mut out, tokens);
            }
            Stmt::Block(stmts) => return self.block(stmts),
        }
        Ok(out)
    }

    /// Whether an expression statement leaves a value to discard.
    fn leaves_value(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Call { function, .. } => self
                .functions
                .get(function)
                .is_none_or(|f| f.native.is_none() || f.returns_value),
            _ => true,
        }
    }

    fn decl(&self, var: &Var, init: Option<&Expr>) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        match (var.heap, &var.ty) {
            (Some(id), _) => match init {
                Some(value) => {
                    self.push_expr(&mut out, value)?;
                    out.push(Op::Dup.into());
                    push_frame_op(&mut out, var, Op::Alloc(id));
                    out.push(Op::Dup.into());
                    push_frame_op(&mut out, var, Op::Sto(var.address));
                    out.push(Op::Hasto(id).into());
                }
                None => {
                    out.push(Op::Push(0.0).into());
                    push_frame_op(&mut out, var, Op::Alloc(id));
                    push_frame_op(&mut out, var, Op::Sto(var.address));
                }
            },
            (None, ty) if ty.is_array() => {
                match init {
                    Some(value) => self.push_expr(&mut out, value)?,
                    None => {
                        for cell in ty.default_cells().into_iter().rev() {
                            out.push(Op::Push(cell).into());
                        }
                    }
                }
                push_frame_op(&mut out, var, Op::Asto(var.address, ty.span()));
            }
            (None, _) => {
                match init {
                    Some(value) => self.push_expr(&mut out, value)?,
                    None => out.push(Op::Push(0.0).into()),
                }
                push_frame_op(&mut out, var, Op::Sto(var.address));
            }
        }
        Ok(out)
    }

    fn resize(&self, var: &Var, size: &Expr, op: fn(usize) -> Op) -> Result<Vec<Token>> {
        let id = heap_id(var, "resize")?;
        let mut out = Vec::new();
        self.push_expr(&mut out, size)?;
        match op(id) {
            // ALLOC takes its owning frame from GLOB
            alloc @ Op::Alloc(_) => push_frame_op(&mut out, var, alloc),
            other => out.push(other.into()),
        }
        push_frame_op(&mut out, var, Op::Sto(var.address));
        Ok(out)
    }

    fn assign(&self, place: &Place, value: &Expr) -> Result<Vec<Token>> {
        let var = &place.var;
        let indices = &place.indices;
        let mut out = Vec::new();

        match (var.heap, &var.ty) {
            (Some(id), _) => match indices.len() {
                0 => {
                    self.push_expr(&mut out, value)?;
                    push_frame_op(&mut out, var, Op::Lod(var.address));
                    out.push(Op::Hasto(id).into());
                }
                1 => {
                    push_frame_op(&mut out, var, Op::Lod(var.address));
                    self.push_expr(&mut out, &indices[0])?;
                    self.push_expr(&mut out, value)?;
                    out.push(Op::Hsto(id).into());
                }
                _ => {
                    return Err(CompileError::unsupported(
                        "multi-dimensional heap store",
                        &var.name,
                        &var.ty,
                    ));
                }
            },
            (None, ty) if ty.is_array() => {
                if indices.is_empty() {
                    self.push_expr(&mut out, value)?;
                    push_frame_op(&mut out, var, Op::Asto(var.address, ty.span()));
                } else if indices.len() == ty.rank() {
                    self.push_offset(&mut out, var, indices)?;
                    self.push_expr(&mut out, value)?;
                    push_frame_op(&mut out, var, Op::Stx(var.address));
                } else {
                    return Err(CompileError::unsupported(
                        "partially indexed store",
                        &var.name,
                        ty,
                    ));
                }
            }
            (None, ty) => {
                if !indices.is_empty() {
                    return Err(CompileError::unsupported("indexed store", &var.name, ty));
                }
                self.push_expr(&mut out, value)?;
                push_frame_op(&mut out, var, Op::Sto(var.address));
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Control constructs
    // =========================================================================

    fn if_chain(&mut self, branches: &[Branch], otherwise: Option<&[Stmt]>) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        let mut exits = Vec::new();

        for (i, branch) in branches.iter().enumerate() {
            let start = self.pos;
            let mut arm = Vec::new();

            let mut test = self.expr(&branch.cond)?;
            test.push(Op::Not.into());
            self.commit(&mut arm, test);
            let skip = arm.len();
            self.emit_token(&mut arm, Token::jump_if(Target::End(0)));

            arm.extend(self.block(&branch.body)?);

            let more = i + 1 < branches.len() || otherwise.is_some();
            if more {
                exits.push(out.len() + arm.len());
                self.emit_token(&mut arm, Token::jump(Target::Last(0)));
            }

            // only this arm's own skip; breaks in the body belong to a loop
            let end = self.pos;
            resolve_at(&mut arm, skip, &Resolution::Span { start, end });
            out.extend(arm);
        }

        if let Some(body) = otherwise {
            out.extend(self.block(body)?);
        }

        let end = self.pos;
        for i in exits {
            resolve_at(&mut out, i, &Resolution::Last { end });
        }
        Ok(out)
    }

    fn while_loop(&mut self, label: Option<&str>, cond: &Expr, body: &[Stmt]) -> Result<Vec<Token>> {
        let start = self.pos;
        let mut out = Vec::new();

        let mut test = self.expr(cond)?;
        test.push(Op::Not.into());
        self.commit(&mut out, test);
        self.emit_token(&mut out, Token::jump_if(Target::End(0)));

        out.extend(self.block(body)?);
        self.emit_token(&mut out, Token::jump(Target::Start(0)));

        let end = self.pos;
        Ok(close_loop(out, label, start, end))
    }

    /// `continue` re-tests the condition.
    fn do_while_loop(&mut self, label: Option<&str>, body: &[Stmt], cond: &Expr) -> Result<Vec<Token>> {
        let start = self.pos;
        let body = self.block(body)?;

        let test_start = self.pos;
        let mut tail = Vec::new();
        let test = self.expr(cond)?;
        self.commit(&mut tail, test);
        self.emit_token(&mut tail, Token::jump_if(Target::Start(0)));
        let end = self.pos;

        let mut out = close_loop(body, label, test_start, end);
        out.extend(resolve_all(tail, &Resolution::Span { start, end }));
        Ok(out)
    }

    /// `continue` runs the step before re-testing.
    fn for_loop(
        &mut self,
        label: Option<&str>,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Stmt>,
        body: &[Stmt],
    ) -> Result<Vec<Token>> {
        let mut out = match init {
            Some(stmt) => self.stmt(stmt)?,
            None => Vec::new(),
        };

        let start = self.pos;
        let mut head = Vec::new();
        if let Some(cond) = cond {
            let mut test = self.expr(cond)?;
            test.push(Op::Not.into());
            self.commit(&mut head, test);
            self.emit_token(&mut head, Token::jump_if(Target::End(0)));
        }

        let body = self.block(body)?;

        let step_start = self.pos;
        let mut tail = match step {
            Some(stmt) => self.stmt(stmt)?,
            None => Vec::new(),
        };
        self.emit_token(&mut tail, Token::jump(Target::Start(0)));
        let end = self.pos;

        let span = Resolution::Span { start, end };
        out.extend(resolve_all(head, &span));
        out.extend(close_loop(body, label, step_start, end));
        out.extend(resolve_all(tail, &span));
        Ok(out)
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expr(&self, expr: &Expr) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        self.push_expr(&mut out, expr)?;
        Ok(out)
    }

    fn push_expr(&self, out: &mut Vec<Token>, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Int(n) => out.push(Op::Push(*n as f64).into()),
            Expr::Float(x) => out.push(Op::Push(*x).into()),
            Expr::Bool(b) => out.push(Op::Push(if *b { 1.0 } else { 0.0 }).into()),
            Expr::Char(c) => out.push(Op::Push(*c as u32 as f64).into()),

            // array values go on the stack last element first, count on top
            Expr::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                for c in chars.iter().rev() {
                    out.push(Op::Push(*c as u32 as f64).into());
                }
                out.push(Op::Push(chars.len() as f64).into());
            }
            Expr::Array(items) => {
                for item in items.iter().rev() {
                    self.push_expr(out, item)?;
                }
                out.push(Op::Push(items.len() as f64).into());
            }

            Expr::Load(place) => self.push_load(out, place)?,
            Expr::Size { var, indices } => self.push_size(out, var, indices)?,

            Expr::Unary { op, operand } => {
                self.push_expr(out, operand)?;
                out.push(
                    match op {
                        UnaryOp::Neg => Op::Neg,
                        UnaryOp::Not => Op::Not,
                    }
                    .into(),
                );
            }
            Expr::Binary { op, lhs, rhs } => {
                self.push_expr(out, lhs)?;
                self.push_expr(out, rhs)?;
                out.push(binary_op(*op).into());
            }

            Expr::Call { function, args } => self.push_call(out, *function, args)?,
        }
        Ok(())
    }

    fn push_call(&self, out: &mut Vec<Token>, function: FunctionId, args: &[Expr]) -> Result<()> {
        let callee = self
            .functions
            .get(&function)
            .ok_or(CompileError::UnknownFunction(function))?;
        if args.len() != callee.params {
            return Err(CompileError::ArgumentCount {
                name: callee.name.clone(),
                expected: callee.params,
                got: args.len(),
            });
        }

        match &callee.native {
            Some(signature) => {
                let id = self
                    .links
                    .lookup(signature)
                    .ok_or_else(|| CompileError::UnknownNative {
                        signature: signature.clone(),
                    })?;
                out.push(Op::Mark.into());
                for arg in args {
                    self.push_expr(out, arg)?;
                }
                out.push(Op::Sys(id).into());
            }
            None => {
                for arg in args {
                    self.push_expr(out, arg)?;
                }
                out.push(Op::Frame(callee.locals).into());
                out.push(Token::call(function));
            }
        }
        Ok(())
    }

    fn push_load(&self, out: &mut Vec<Token>, place: &Place) -> Result<()> {
        let var = &place.var;
        let indices = &place.indices;

        match (var.heap, &var.ty) {
            (Some(id), _) => {
                push_frame_op(out, var, Op::Lod(var.address));
                match indices.len() {
                    0 => out.push(Op::Halod(id).into()),
                    1 => {
                        self.push_expr(out, &indices[0])?;
                        out.push(Op::Hlod(id).into());
                    }
                    _ => {
                        return Err(CompileError::unsupported(
                            "multi-dimensional heap load",
                            &var.name,
                            &var.ty,
                        ));
                    }
                }
            }
            (None, ty) if ty.is_array() => {
                if indices.is_empty() {
                    push_frame_op(out, var, Op::Alod(var.address, ty.span()));
                } else if indices.len() == ty.rank() {
                    self.push_offset(out, var, indices)?;
                    push_frame_op(out, var, Op::Ldx(var.address));
                } else {
                    return Err(CompileError::unsupported(
                        "partially indexed load",
                        &var.name,
                        ty,
                    ));
                }
            }
            (None, ty) => {
                if !indices.is_empty() {
                    return Err(CompileError::unsupported("indexed load", &var.name, ty));
                }
                push_frame_op(out, var, Op::Lod(var.address));
            }
        }
        Ok(())
    }

    fn push_size(&self, out: &mut Vec<Token>, var: &Var, indices: &[Expr]) -> Result<()> {
        match (var.heap, &var.ty) {
            (Some(id), _) if indices.is_empty() => out.push(Op::Hsize(id).into()),
            (None, ty) if ty.is_array() && indices.is_empty() => {
                push_frame_op(out, var, Op::Size(var.address));
            }
            (None, ty) if ty.is_array() && indices.len() < ty.rank() => {
                self.push_offset(out, var, indices)?;
                push_frame_op(out, var, Op::Asize(var.address));
            }
            (_, ty) => return Err(CompileError::unsupported("size query", &var.name, ty)),
        }
        Ok(())
    }

    /// Flat cell offset of `indices` inside a static array, header included.
    ///
    /// Each index is bounds-checked against its dimension, scaled by the
    /// stride of that dimension and stepped past the header it lands in.
    fn push_offset(&self, out: &mut Vec<Token>, var: &Var, indices: &[Expr]) -> Result<()> {
        let dims = var.ty.dims();
        let strides = var.ty.strides();
        if indices.len() > dims.len() {
            return Err(CompileError::unsupported(
                "too many indices",
                &var.name,
                &var.ty,
            ));
        }

        for (k, index) in indices.iter().enumerate() {
            self.push_expr(out, index)?;
            out.push(Op::Bnd(dims[k]).into());
            if strides[k] != 1 {
                out.push(Op::Push(strides[k] as f64).into());
                out.push(Op::Mul.into());
            }
            out.push(Op::Inc.into());
            if k > 0 {
                out.push(Op::Add.into());
            }
        }
        Ok(())
    }
}

/// Compile `program` against `links`.
pub fn compile(program: &Program, links: &LinkTable) -> Result<ProgramImage> {
    Compiler::new(links).compile_program(program)
}

/// Move one incoming argument from the stack into its frame slot.
fn store_param(param: &Var) -> Vec<Token> {
    let mut out = Vec::new();
    match param.heap {
        Some(id) => {
            // copy the incoming array value into a fresh allocation
            out.push(Op::Dup.into());
            out.push(Op::Alloc(id).into());
            out.push(Op::Dup.into());
            push_frame_op(&mut out, param, Op::Sto(param.address));
            out.push(Op::Hasto(id).into());
        }
        None if param.ty.is_array() => {
            push_frame_op(&mut out, param, Op::Asto(param.address, param.ty.span()));
        }
        None => push_frame_op(&mut out, param, Op::Sto(param.address)),
    }
    out
}

/// Push a frame access, preceded by `GLOB` for globals.
fn push_frame_op(out: &mut Vec<Token>, var: &Var, op: Op) {
    if var.global {
        out.push(Op::Glob.into());
    }
    out.push(op.into());
}

fn heap_id(var: &Var, what: &'static str) -> Result<usize> {
    var.heap
        .ok_or_else(|| CompileError::unsupported(what, &var.name, &var.ty))
}

fn binary_op(op: BinaryOp) -> Op {
    match op {
        BinaryOp::Add => Op::Add,
        BinaryOp::Sub => Op::Sub,
        BinaryOp::Mul => Op::Mul,
        BinaryOp::Div => Op::Div,
        BinaryOp::IntDiv => Op::IDiv,
        BinaryOp::Mod => Op::Mod,
        BinaryOp::Eq => Op::Eq,
        BinaryOp::Ne => Op::Ne,
        BinaryOp::Lt => Op::Lt,
        BinaryOp::Le => Op::Le,
        BinaryOp::Gt => Op::Gt,
        BinaryOp::Ge => Op::Ge,
        BinaryOp::And => Op::And,
        BinaryOp::Or => Op::Or,
    }
}

fn resolve_at(tokens: &mut [Token], index: usize, resolution: &Resolution<'_>) {
    if let Some(slot) = tokens.get_mut(index) {
        let token = std::mem::replace(slot, Token::Ready(Op::Halt));
        *slot = token.resolve(resolution);
    }
}

/// Resolve the unlabelled and (if named) labelled jumps of a loop body.
/// `start` is where `continue` lands.
fn close_loop(tokens: Vec<Token>, label: Option<&str>, start: usize, end: usize) -> Vec<Token> {
    let tokens = resolve_all(tokens, &Resolution::Span { start, end });
    match label {
        Some(label) => resolve_all(tokens, &Resolution::Label { label, start, end }),
        None => tokens,
    }
}

/// Whether every path through `body` ends in a `return`.
fn always_returns(body: &[Stmt]) -> bool {
    body.iter().any(|stmt| match stmt {
        Stmt::Return(_) => true,
        Stmt::Block(inner) => always_returns(inner),
        Stmt::If {
            branches,
            otherwise: Some(otherwise),
        } => branches.iter().all(|b| always_returns(&b.body)) && always_returns(otherwise),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::Type;
    use crate::runtime::runtime_error::RuntimeError;
    use crate::runtime::vm::{Vm, VmConfig};

    // =========================================================================
    // Test Helpers
    // =========================================================================

    fn compile_core(program: &Program) -> Result<ProgramImage> {
        compile(program, &LinkTable::with_core())
    }

    fn ops(program: &Program) -> Vec<(usize, Op)> {
        compile_core(program)
            .expect("program should compile")
            .instructions()
            .expect("image should decode")
    }

    fn execute(program: &Program) -> std::result::Result<f64, RuntimeError> {
        let image = compile_core(program).expect("program should compile");
        let config = VmConfig {
            max_steps: Some(100_000),
            ..VmConfig::default()
        };
        let mut vm = Vm::with_config(config, LinkTable::with_core());
        vm.initialize(&image)?;
        vm.run().map_err(|trap| trap.error)
    }

    fn run(program: &Program) -> f64 {
        execute(program).expect("execution should succeed")
    }

    fn main(globals: usize, body: Vec<Stmt>) -> Program {
        Program {
            functions: Vec::new(),
            body,
            globals,
        }
    }

    fn int(n: i64) -> Expr {
        Expr::Int(n)
    }

    fn bin(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(op, lhs, rhs)
    }

    fn set(var: &Var, value: Expr) -> Stmt {
        Stmt::Assign {
            place: Place::var(var),
            value,
        }
    }

    fn decl(var: &Var, value: Expr) -> Stmt {
        Stmt::Decl {
            var: var.clone(),
            init: Some(value),
        }
    }

    fn incr(var: &Var) -> Stmt {
        set(var, bin(BinaryOp::Add, Expr::load(var), int(1)))
    }

    fn when(cond: Expr, body: Vec<Stmt>) -> Stmt {
        Stmt::If {
            branches: vec![Branch { cond, body }],
            otherwise: None,
        }
    }

    fn ret(value: Expr) -> Stmt {
        Stmt::Return(Some(value))
    }

    fn function(id: FunctionId, name: &str, params: Vec<Var>, locals: usize, body: Vec<Stmt>) -> Function {
        Function {
            id,
            name: name.to_string(),
            params,
            locals,
            returns: Type::Int,
            body,
            native: None,
        }
    }

    fn native_fn(id: FunctionId, signature: &str, params: Vec<Var>, returns: Type) -> Function {
        Function {
            id,
            name: signature.to_string(),
            params,
            locals: 0,
            returns,
            body: Vec::new(),
            native: Some(signature.to_string()),
        }
    }

    // =========================================================================
    // Basic programs
    // =========================================================================

    #[test]
    fn test_empty_program() {
        let program = main(0, Vec::new());

        let ops: Vec<Op> = ops(&program).into_iter().map(|(_, op)| op).collect();
        assert_eq!(ops, vec![Op::Enter(0), Op::Push(0.0), Op::Ret]);
        assert_eq!(run(&program), 0.0);
    }

    #[test]
    fn test_arithmetic_end_to_end() {
        // ((5*3)+(5*3)) * -1
        let product = bin(BinaryOp::Mul, int(5), int(3));
        let sum = bin(BinaryOp::Add, product.clone(), product);
        let program = main(
            0,
            vec![ret(bin(
                BinaryOp::Mul,
                sum,
                Expr::unary(UnaryOp::Neg, int(1)),
            ))],
        );

        assert_eq!(run(&program), -30.0);
    }

    #[test]
    fn test_peephole_applies_to_expressions() {
        let x = Var::global("x", 0, Type::Int);
        let y = Var::global("y", 1, Type::Int);
        let program = main(
            2,
            vec![
                decl(&x, int(7)),
                decl(&y, int(2)),
                ret(bin(
                    BinaryOp::Sub,
                    Expr::load(&x),
                    Expr::unary(UnaryOp::Neg, Expr::unary(UnaryOp::Neg, Expr::load(&y))),
                )),
            ],
        );

        let ops = ops(&program);
        assert!(!ops.iter().any(|(_, op)| *op == Op::Neg));
        assert_eq!(run(&program), 5.0);
    }

    #[test]
    fn test_global_access_is_prefixed() {
        let x = Var::global("x", 0, Type::Int);
        let program = main(1, vec![decl(&x, int(4)), ret(Expr::load(&x))]);

        let ops: Vec<Op> = ops(&program).into_iter().map(|(_, op)| op).collect();
        assert_eq!(
            ops,
            vec![
                Op::Enter(1),
                Op::Push(4.0),
                Op::Glob,
                Op::Sto(0),
                Op::Glob,
                Op::Lod(0),
                Op::Ret,
            ]
        );
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    #[test]
    fn test_while_jump_targets() {
        let x = Var::global("x", 0, Type::Int);
        let program = main(
            1,
            vec![
                decl(&x, int(0)),
                Stmt::While {
                    label: None,
                    cond: bin(BinaryOp::Lt, Expr::load(&x), int(3)),
                    body: vec![incr(&x)],
                },
                ret(Expr::load(&x)),
            ],
        );

        let ops = ops(&program);
        // ENTER 1; PUSH 0; GLOB; STO 0 -- the condition starts at 7
        let cond_start = 7;
        assert_eq!(ops[4], (cond_start, Op::Glob));

        let (jif_at, jif) = ops.iter().find(|(_, op)| matches!(op, Op::Jif(_))).unwrap();
        let (jmp_at, jmp) = ops.iter().find(|(_, op)| matches!(op, Op::Jmp(_))).unwrap();
        let loop_end = jmp_at + 2;

        assert!(jif_at < jmp_at);
        assert_eq!(jif.target(), Some(loop_end));
        assert_eq!(jmp.target(), Some(cond_start));
        assert_eq!(run(&program), 3.0);
    }

    fn classify(value: i64) -> Program {
        let x = Var::global("x", 0, Type::Int);
        let r = Var::global("r", 1, Type::Int);
        main(
            2,
            vec![
                decl(&x, int(value)),
                decl(&r, int(0)),
                Stmt::If {
                    branches: vec![
                        Branch {
                            cond: bin(BinaryOp::Eq, Expr::load(&x), int(1)),
                            body: vec![set(&r, int(10))],
                        },
                        Branch {
                            cond: bin(BinaryOp::Eq, Expr::load(&x), int(2)),
                            body: vec![set(&r, int(20))],
                        },
                    ],
                    otherwise: Some(vec![set(&r, int(30))]),
                },
                ret(Expr::load(&r)),
            ],
        )
    }

    #[test]
    fn test_if_chain() {
        assert_eq!(run(&classify(1)), 10.0);
        assert_eq!(run(&classify(2)), 20.0);
        assert_eq!(run(&classify(7)), 30.0);
    }

    #[test]
    fn test_if_chain_exits_share_one_target() {
        let ops = ops(&classify(1));
        let targets: Vec<usize> = ops
            .iter()
            .filter(|(_, op)| matches!(op, Op::Jmp(_)))
            .filter_map(|(_, op)| op.target())
            .collect();

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0], targets[1]);
    }

    #[test]
    fn test_labelled_break_and_continue_across_loops() {
        let i = Var::global("i", 0, Type::Int);
        let j = Var::global("j", 1, Type::Int);
        let count = Var::global("count", 2, Type::Int);

        let inner = Stmt::For {
            label: None,
            init: Some(Box::new(decl(&j, int(0)))),
            cond: Some(bin(BinaryOp::Lt, Expr::load(&j), int(3))),
            step: Some(Box::new(incr(&j))),
            body: vec![
                when(
                    bin(BinaryOp::Eq, Expr::load(&j), int(1)),
                    vec![Stmt::Continue(Some("outer".to_string()))],
                ),
                when(
                    bin(BinaryOp::Eq, Expr::load(&i), int(2)),
                    vec![Stmt::Break(Some("outer".to_string()))],
                ),
                incr(&count),
            ],
        };
        let outer = Stmt::For {
            label: Some("outer".to_string()),
            init: Some(Box::new(decl(&i, int(0)))),
            cond: Some(bin(BinaryOp::Lt, Expr::load(&i), int(3))),
            step: Some(Box::new(incr(&i))),
            body: vec![inner],
        };
        let program = main(3, vec![decl(&count, int(0)), outer, ret(Expr::load(&count))]);

        assert_eq!(run(&program), 2.0);
    }

    #[test]
    fn test_nested_while_break_binds_to_inner_loop() {
        let n = Var::global("n", 0, Type::Int);
        let m = Var::global("m", 1, Type::Int);
        let program = main(
            2,
            vec![
                decl(&n, int(0)),
                decl(&m, int(0)),
                Stmt::While {
                    label: None,
                    cond: bin(BinaryOp::Lt, Expr::load(&n), int(4)),
                    body: vec![
                        incr(&n),
                        Stmt::While {
                            label: None,
                            cond: Expr::Bool(true),
                            body: vec![incr(&m), Stmt::Break(None)],
                        },
                    ],
                },
                ret(Expr::load(&m)),
            ],
        );

        assert_eq!(run(&program), 4.0);
    }

    #[test]
    fn test_do_while_continue_tests_condition() {
        let x = Var::global("x", 0, Type::Int);
        let y = Var::global("y", 1, Type::Int);
        let program = main(
            2,
            vec![
                decl(&x, int(0)),
                decl(&y, int(0)),
                Stmt::DoWhile {
                    label: None,
                    body: vec![
                        incr(&x),
                        when(
                            bin(BinaryOp::Eq, Expr::load(&x), int(2)),
                            vec![Stmt::Continue(None)],
                        ),
                        set(&y, bin(BinaryOp::Add, Expr::load(&y), int(10))),
                    ],
                    cond: bin(BinaryOp::Lt, Expr::load(&x), int(4)),
                },
                ret(Expr::load(&y)),
            ],
        );

        assert_eq!(run(&program), 30.0);
    }

    #[test]
    fn test_do_while_runs_body_once() {
        let x = Var::global("x", 0, Type::Int);
        let program = main(
            1,
            vec![
                decl(&x, int(0)),
                Stmt::DoWhile {
                    label: None,
                    body: vec![incr(&x)],
                    cond: Expr::Bool(false),
                },
                ret(Expr::load(&x)),
            ],
        );

        assert_eq!(run(&program), 1.0);
    }

    #[test]
    fn test_for_continue_runs_step() {
        let i = Var::global("i", 0, Type::Int);
        let s = Var::global("s", 1, Type::Int);
        let program = main(
            2,
            vec![
                decl(&s, int(0)),
                Stmt::For {
                    label: None,
                    init: Some(Box::new(decl(&i, int(0)))),
                    cond: Some(bin(BinaryOp::Lt, Expr::load(&i), int(5))),
                    step: Some(Box::new(incr(&i))),
                    body: vec![
                        when(
                            bin(BinaryOp::Eq, Expr::load(&i), int(2)),
                            vec![Stmt::Continue(None)],
                        ),
                        set(&s, bin(BinaryOp::Add, Expr::load(&s), Expr::load(&i))),
                    ],
                },
                ret(Expr::load(&s)),
            ],
        );

        assert_eq!(run(&program), 8.0);
    }

    #[test]
    fn test_for_without_condition_needs_break() {
        let i = Var::global("i", 0, Type::Int);
        let program = main(
            1,
            vec![
                Stmt::For {
                    label: None,
                    init: Some(Box::new(decl(&i, int(0)))),
                    cond: None,
                    step: Some(Box::new(incr(&i))),
                    body: vec![when(
                        bin(BinaryOp::Ge, Expr::load(&i), int(6)),
                        vec![Stmt::Break(None)],
                    )],
                },
                ret(Expr::load(&i)),
            ],
        );

        assert_eq!(run(&program), 6.0);
    }

    #[test]
    fn test_break_outside_loop() {
        let program = main(0, vec![Stmt::Break(None)]);

        assert!(matches!(
            compile_core(&program),
            Err(CompileError::JumpOutsideLoop {
                keyword: "break",
                ..
            })
        ));
    }

    #[test]
    fn test_continue_inside_if_outside_loop() {
        let program = main(0, vec![when(Expr::Bool(true), vec![Stmt::Continue(None)])]);

        assert!(matches!(
            compile_core(&program),
            Err(CompileError::JumpOutsideLoop {
                keyword: "continue",
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_label() {
        let program = main(
            0,
            vec![Stmt::While {
                label: Some("inner".to_string()),
                cond: Expr::Bool(true),
                body: vec![Stmt::Break(Some("outer".to_string()))],
            }],
        );

        assert_eq!(
            compile_core(&program),
            Err(CompileError::UnknownLabel {
                label: "outer".to_string(),
                context: "top level".to_string(),
            })
        );
    }

    // =========================================================================
    // Functions
    // =========================================================================

    #[test]
    fn test_recursive_function() {
        let n = Var::local("n", 0, Type::Int);
        let fact = function(
            0,
            "fact",
            vec![n.clone()],
            1,
            vec![
                when(bin(BinaryOp::Le, Expr::load(&n), int(1)), vec![ret(int(1))]),
                ret(bin(
                    BinaryOp::Mul,
                    Expr::load(&n),
                    Expr::call(0, vec![bin(BinaryOp::Sub, Expr::load(&n), int(1))]),
                )),
            ],
        );
        let program = Program {
            functions: vec![fact],
            body: vec![ret(Expr::call(0, vec![int(5)]))],
            globals: 0,
        };

        assert_eq!(run(&program), 120.0);
    }

    #[test]
    fn test_forward_and_mutual_calls() {
        let n = Var::local("n", 0, Type::Int);
        let parity = |id, name: &str, base: i64, other| {
            function(
                id,
                name,
                vec![n.clone()],
                1,
                vec![Stmt::If {
                    branches: vec![Branch {
                        cond: bin(BinaryOp::Eq, Expr::load(&n), int(0)),
                        body: vec![ret(int(base))],
                    }],
                    otherwise: Some(vec![ret(Expr::call(
                        other,
                        vec![bin(BinaryOp::Sub, Expr::load(&n), int(1))],
                    ))]),
                }],
            )
        };
        let program = Program {
            functions: vec![parity(0, "is_even", 1, 1), parity(1, "is_odd", 0, 0)],
            body: vec![ret(bin(
                BinaryOp::Add,
                bin(BinaryOp::Mul, Expr::call(0, vec![int(7)]), int(10)),
                Expr::call(1, vec![int(7)]),
            ))],
            globals: 0,
        };

        assert_eq!(run(&program), 1.0);
    }

    #[test]
    fn test_parameters_keep_order() {
        let a = Var::local("a", 0, Type::Int);
        let b = Var::local("b", 1, Type::Int);
        let sub = function(
            0,
            "sub",
            vec![a.clone(), b.clone()],
            2,
            vec![ret(bin(BinaryOp::Sub, Expr::load(&a), Expr::load(&b)))],
        );
        let program = Program {
            functions: vec![sub],
            body: vec![ret(Expr::call(0, vec![int(10), int(3)]))],
            globals: 0,
        };

        assert_eq!(run(&program), 7.0);
    }

    #[test]
    fn test_locals_are_per_call() {
        let g = Var::global("g", 0, Type::Int);
        let t = Var::local("t", 0, Type::Int);
        let bump = function(
            0,
            "bump",
            Vec::new(),
            1,
            vec![incr(&t), set(&g, bin(BinaryOp::Add, Expr::load(&g), Expr::load(&t)))],
        );
        let program = Program {
            functions: vec![bump],
            body: vec![
                decl(&g, int(0)),
                Stmt::Expr(Expr::call(0, Vec::new())),
                Stmt::Expr(Expr::call(0, Vec::new())),
                ret(Expr::load(&g)),
            ],
            globals: 1,
        };

        assert_eq!(run(&program), 2.0);
    }

    #[test]
    fn test_unknown_function() {
        let program = main(0, vec![ret(Expr::call(9, Vec::new()))]);
        assert_eq!(compile_core(&program), Err(CompileError::UnknownFunction(9)));
    }

    #[test]
    fn test_argument_count_mismatch() {
        let program = Program {
            functions: vec![function(0, "f", Vec::new(), 0, vec![ret(int(1))])],
            body: vec![ret(Expr::call(0, vec![int(1)]))],
            globals: 0,
        };

        assert!(matches!(
            compile_core(&program),
            Err(CompileError::ArgumentCount {
                expected: 0,
                got: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_native_call() {
        let x = Var::local("x", 0, Type::Float);
        let program = Program {
            functions: vec![native_fn(0, "sqrt(float)", vec![x], Type::Float)],
            body: vec![ret(Expr::call(0, vec![Expr::Float(16.0)]))],
            globals: 0,
        };

        assert_eq!(run(&program), 4.0);
    }

    #[test]
    fn test_void_native_statement_leaves_no_pop() {
        let x = Var::local("x", 0, Type::Int);
        let program = Program {
            functions: vec![native_fn(0, "print(int)", vec![x], Type::Void)],
            body: vec![Stmt::Expr(Expr::call(0, vec![int(3)]))],
            globals: 0,
        };

        let id = LinkTable::with_core().lookup("print(int)").unwrap();
        let ops: Vec<Op> = ops(&program).into_iter().map(|(_, op)| op).collect();
        assert_eq!(
            ops,
            vec![
                Op::Enter(0),
                Op::Mark,
                Op::Push(3.0),
                Op::Sys(id),
                Op::Push(0.0),
                Op::Ret,
            ]
        );
    }

    #[test]
    fn test_unknown_native() {
        let program = Program {
            functions: vec![native_fn(0, "nope()", Vec::new(), Type::Int)],
            body: vec![ret(Expr::call(0, Vec::new()))],
            globals: 0,
        };

        assert_eq!(
            compile_core(&program),
            Err(CompileError::UnknownNative {
                signature: "nope()".to_string()
            })
        );
    }

    // =========================================================================
    // Arrays
    // =========================================================================

    #[test]
    fn test_two_dimensional_offsets_and_sizes() {
        let grid = Var::global("grid", 0, Type::array(Type::array(Type::Int, 3), 2));
        let at = |i, j| vec![int(i), int(j)];
        let program = main(
            9,
            vec![
                Stmt::Decl {
                    var: grid.clone(),
                    init: None,
                },
                Stmt::Assign {
                    place: Place::index(&grid, at(1, 2)),
                    value: int(42),
                },
                ret(bin(
                    BinaryOp::Add,
                    Expr::load_index(&grid, at(1, 2)),
                    bin(
                        BinaryOp::Add,
                        bin(
                            BinaryOp::Mul,
                            Expr::Size {
                                var: grid.clone(),
                                indices: Vec::new(),
                            },
                            int(100),
                        ),
                        bin(
                            BinaryOp::Mul,
                            Expr::Size {
                                var: grid.clone(),
                                indices: vec![int(1)],
                            },
                            int(1000),
                        ),
                    ),
                )),
            ],
        );

        assert_eq!(run(&program), 3242.0);
    }

    #[test]
    fn test_offset_arithmetic() {
        let grid = Var::local("grid", 0, Type::array(Type::array(Type::Int, 3), 2));
        let links = LinkTable::new();
        let compiler = Compiler::new(&links);

        let mut out = Vec::new();
        compiler
            .push_offset(&mut out, &grid, &[int(1), int(2)])
            .unwrap();
        let ops: Vec<Op> = out.iter().filter_map(|t| t.ready().copied()).collect();

        assert_eq!(
            ops,
            vec![
                Op::Push(1.0),
                Op::Bnd(2),
                Op::Push(4.0),
                Op::Mul,
                Op::Inc,
                Op::Push(2.0),
                Op::Bnd(3),
                Op::Inc,
                Op::Add,
            ]
        );
    }

    #[test]
    fn test_index_out_of_range_faults() {
        let a = Var::global("a", 0, Type::array(Type::Int, 3));
        let program = main(
            4,
            vec![
                Stmt::Decl {
                    var: a.clone(),
                    init: None,
                },
                ret(Expr::load_index(&a, vec![int(3)])),
            ],
        );

        assert_eq!(
            execute(&program),
            Err(RuntimeError::IndexOutOfRange {
                index: 3.0,
                len: 3
            })
        );
    }

    #[test]
    fn test_array_literal_and_copy() {
        let a = Var::global("a", 0, Type::array(Type::Int, 3));
        let b = Var::global("b", 4, Type::array(Type::Int, 3));
        let digits = |v: &Var| {
            bin(
                BinaryOp::Add,
                bin(
                    BinaryOp::Add,
                    bin(BinaryOp::Mul, Expr::load_index(v, vec![int(0)]), int(100)),
                    bin(BinaryOp::Mul, Expr::load_index(v, vec![int(1)]), int(10)),
                ),
                Expr::load_index(v, vec![int(2)]),
            )
        };
        let program = main(
            8,
            vec![
                decl(&a, Expr::Array(vec![int(1), int(2), int(3)])),
                Stmt::Decl {
                    var: b.clone(),
                    init: None,
                },
                set(&b, Expr::load(&a)),
                ret(digits(&b)),
            ],
        );

        assert_eq!(run(&program), 123.0);
    }

    #[test]
    fn test_array_parameter() {
        let a = Var::local("a", 0, Type::array(Type::Int, 3));
        let sum = function(
            0,
            "sum",
            vec![a.clone()],
            4,
            vec![ret(bin(
                BinaryOp::Add,
                bin(
                    BinaryOp::Add,
                    Expr::load_index(&a, vec![int(0)]),
                    Expr::load_index(&a, vec![int(1)]),
                ),
                Expr::load_index(&a, vec![int(2)]),
            ))],
        );
        let program = Program {
            functions: vec![sum],
            body: vec![ret(Expr::call(
                0,
                vec![Expr::Array(vec![int(4), int(5), int(6)])],
            ))],
            globals: 0,
        };

        assert_eq!(run(&program), 15.0);
    }

    #[test]
    fn test_string_literal_layout() {
        let s = Var::global("s", 0, Type::array(Type::Char, 2));
        let program = main(
            3,
            vec![
                decl(&s, Expr::Str("hi".to_string())),
                ret(Expr::load_index(&s, vec![int(1)])),
            ],
        );

        assert_eq!(run(&program), 'i' as u32 as f64);
    }

    #[test]
    fn test_heap_array_lifecycle() {
        let h = Var::heap("h", 0, Type::Int, 0).into_global();
        let program = main(
            1,
            vec![
                decl(&h, Expr::Array(vec![int(1), int(2), int(3)])),
                Stmt::Realloc {
                    var: h.clone(),
                    size: int(5),
                },
                Stmt::Assign {
                    place: Place::index(&h, vec![int(4)]),
                    value: int(9),
                },
                ret(bin(
                    BinaryOp::Add,
                    bin(
                        BinaryOp::Add,
                        Expr::load_index(&h, vec![int(0)]),
                        Expr::load_index(&h, vec![int(4)]),
                    ),
                    bin(
                        BinaryOp::Mul,
                        Expr::Size {
                            var: h.clone(),
                            indices: Vec::new(),
                        },
                        int(100),
                    ),
                )),
            ],
        );

        assert_eq!(run(&program), 510.0);
    }

    #[test]
    fn test_heap_access_after_free_faults() {
        let h = Var::heap("h", 0, Type::Int, 0).into_global();
        let program = main(
            1,
            vec![
                Stmt::Decl {
                    var: h.clone(),
                    init: None,
                },
                Stmt::Alloc {
                    var: h.clone(),
                    size: int(2),
                },
                Stmt::Free { var: h.clone() },
                ret(Expr::load_index(&h, vec![int(0)])),
            ],
        );

        assert!(matches!(
            execute(&program),
            Err(RuntimeError::DanglingAddress(_))
        ));
    }

    #[test]
    fn test_heap_access_after_reuse_faults() {
        let a = Var::heap("a", 0, Type::Int, 1).into_global();
        let b = Var::heap("b", 1, Type::Int, 2).into_global();
        let program = main(
            2,
            vec![
                decl(&a, Expr::Array(vec![int(1), int(2), int(3)])),
                Stmt::Free { var: a.clone() },
                decl(&b, Expr::Array(vec![int(7), int(8), int(9)])),
                ret(Expr::load_index(&a, vec![int(0)])),
            ],
        );

        assert!(matches!(
            execute(&program),
            Err(RuntimeError::DanglingAddress(_))
        ));
    }

    #[test]
    fn test_recursive_heap_parameter_keeps_caller_copy() {
        // f(arr, n) { if n > 0 { f([9, 9, 9], n - 1) } return arr[0] }
        let arr = Var::heap("arr", 0, Type::Int, 0);
        let n = Var::local("n", 1, Type::Int);
        let f = function(
            0,
            "f",
            vec![arr.clone(), n.clone()],
            2,
            vec![
                when(
                    bin(BinaryOp::Gt, Expr::load(&n), int(0)),
                    vec![Stmt::Expr(Expr::call(
                        0,
                        vec![
                            Expr::Array(vec![int(9), int(9), int(9)]),
                            bin(BinaryOp::Sub, Expr::load(&n), int(1)),
                        ],
                    ))],
                ),
                ret(Expr::load_index(&arr, vec![int(0)])),
            ],
        );
        let program = Program {
            functions: vec![f],
            body: vec![ret(Expr::call(
                0,
                vec![Expr::Array(vec![int(1), int(2), int(3)]), int(3)],
            ))],
            globals: 0,
        };

        assert_eq!(run(&program), 1.0);
    }

    #[test]
    fn test_global_heap_alloc_is_prefixed() {
        let h = Var::heap("h", 0, Type::Int, 4).into_global();
        let program = main(
            1,
            vec![Stmt::Alloc {
                var: h.clone(),
                size: int(2),
            }],
        );

        let ops: Vec<Op> = ops(&program).into_iter().map(|(_, op)| op).collect();
        assert_eq!(
            &ops[1..6],
            &[
                Op::Push(2.0),
                Op::Glob,
                Op::Alloc(4),
                Op::Glob,
                Op::Sto(0)
            ]
        );
    }

    #[test]
    fn test_heap_parameter_is_copied() {
        let h = Var::heap("h", 0, Type::Int, 1);
        let f = function(
            0,
            "f",
            vec![h.clone()],
            1,
            vec![ret(bin(
                BinaryOp::Add,
                Expr::Size {
                    var: h.clone(),
                    indices: Vec::new(),
                },
                Expr::load_index(&h, vec![int(1)]),
            ))],
        );
        let program = Program {
            functions: vec![f],
            body: vec![ret(Expr::call(0, vec![Expr::Array(vec![int(7), int(8)])]))],
            globals: 0,
        };

        assert_eq!(run(&program), 10.0);
    }

    #[test]
    fn test_partial_index_unsupported() {
        let grid = Var::global("grid", 0, Type::array(Type::array(Type::Int, 3), 2));
        let program = main(9, vec![ret(Expr::load_index(&grid, vec![int(0)]))]);

        assert!(matches!(
            compile_core(&program),
            Err(CompileError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_free_on_static_var_unsupported() {
        let x = Var::global("x", 0, Type::Int);
        let program = main(1, vec![Stmt::Free { var: x }]);

        assert!(matches!(
            compile_core(&program),
            Err(CompileError::Unsupported { what: "free", .. })
        ));
    }
}
