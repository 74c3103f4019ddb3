use super::types::Type;

/// Compiler-assigned function identity, stable across the whole program.
pub type FunctionId = usize;

/// Compiler-assigned id naming one heap allocation site.
pub type HeapId = usize;

// ─────────────────────────────── Names ────────────────────────────────

/// A declared name after slot allocation.
///
/// `address` is relative to the active frame, or to the global frame when
/// `global` is set. Heap arrays keep the allocation's current address in
/// their slot and carry the allocation id in `heap`.
#[derive(Debug, Clone, PartialEq)]
pub struct Var {
    pub name: String,
    pub address: usize,
    pub global: bool,
    pub ty: Type,
    pub heap: Option<HeapId>,
}

impl Var {
    pub fn local(name: &str, address: usize, ty: Type) -> Self {
        Self {
            name: name.to_string(),
            address,
            global: false,
            ty,
            heap: None,
        }
    }

    pub fn global(name: &str, address: usize, ty: Type) -> Self {
        Self {
            global: true,
            ..Self::local(name, address, ty)
        }
    }

    /// A heap array of `elem` whose address lives in slot `address`.
    pub fn heap(name: &str, address: usize, elem: Type, id: HeapId) -> Self {
        Self {
            heap: Some(id),
            ..Self::local(name, address, Type::heap_array(elem))
        }
    }

    pub fn into_global(mut self) -> Self {
        self.global = true;
        self
    }
}

/// An assignable location: a variable plus zero or more indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Place {
    pub var: Var,
    pub indices: Vec<Expr>,
}

impl Place {
    pub fn var(var: &Var) -> Self {
        Self {
            var: var.clone(),
            indices: Vec::new(),
        }
    }

    pub fn index(var: &Var, indices: Vec<Expr>) -> Self {
        Self {
            var: var.clone(),
            indices,
        }
    }
}

// ──────────────────────────── Expressions ─────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Floating-point division.
    Div,
    /// Truncating integer division; dividing by zero is a runtime fault.
    IntDiv,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Bool(bool),
    Char(char),

    /// String literal, laid out as a `char` array value.
    Str(String),

    /// Array literal. Nested literals give multi-dimensional values.
    Array(Vec<Expr>),

    /// Read a place. Fewer indices than the declared rank loads the whole
    /// value (only without indices for static arrays).
    Load(Place),

    /// `#name` or `#name[i]...`: the element count stored in the header
    /// reached after applying `indices`.
    Size { var: Var, indices: Vec<Expr> },

    Unary { op: UnaryOp, operand: Box<Expr> },

    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    Call { function: FunctionId, args: Vec<Expr> },
}

impl Expr {
    pub fn load(var: &Var) -> Self {
        Expr::Load(Place::var(var))
    }

    pub fn load_index(var: &Var, indices: Vec<Expr>) -> Self {
        Expr::Load(Place::index(var, indices))
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn call(function: FunctionId, args: Vec<Expr>) -> Self {
        Expr::Call { function, args }
    }
}

// ──────────────────────────── Statements ──────────────────────────────

/// One `if` / `else if` arm.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub cond: Expr,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Evaluate and discard.
    Expr(Expr),

    /// Declare a frame or global variable. Without `init`, scalars start at
    /// zero and arrays get their headers written.
    Decl { var: Var, init: Option<Expr> },

    /// Allocate `size` elements for a heap array declaration.
    Alloc { var: Var, size: Expr },

    /// Resize a heap array, keeping its contents.
    Realloc { var: Var, size: Expr },

    /// Release a heap array.
    Free { var: Var },

    Assign { place: Place, value: Expr },

    /// `if` / `else if` chain with optional trailing `else`.
    If {
        branches: Vec<Branch>,
        otherwise: Option<Vec<Stmt>>,
    },

    While {
        label: Option<String>,
        cond: Expr,
        body: Vec<Stmt>,
    },

    DoWhile {
        label: Option<String>,
        body: Vec<Stmt>,
        cond: Expr,
    },

    For {
        label: Option<String>,
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Vec<Stmt>,
    },

    /// `break;` or `break @label;`
    Break(Option<String>),

    /// `continue;` or `continue @label;`
    Continue(Option<String>),

    Return(Option<Expr>),

    Block(Vec<Stmt>),
}

// ──────────────────────────── Functions ───────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,

    /// Parameters in declaration order, each with its assigned frame slot.
    pub params: Vec<Var>,

    /// Frame size in cells, parameters included.
    pub locals: usize,

    pub returns: Type,
    pub body: Vec<Stmt>,

    /// Link table signature for `native` functions; these have no body.
    pub native: Option<String>,
}

impl Function {
    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }
}

/// A fully typed, slot-allocated program.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub functions: Vec<Function>,

    /// Top-level statements, run in the global frame.
    pub body: Vec<Stmt>,

    /// Size of the global frame in cells.
    pub globals: usize,
}
