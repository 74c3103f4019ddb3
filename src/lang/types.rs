/// Declared type of a value, as resolved by the front end.
///
/// Every scalar occupies exactly one cell. Arrays are stored header first:
/// one cell holding the element count followed by the element cells, where
/// an element may itself be a nested array (header + body).
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Int,
    Float,
    Bool,
    Char,
    Void,

    /// Array of `elem`. A fixed `len` gives a statically sized array; `None`
    /// is only legal for heap arrays, whose size is decided at run time.
    Array { elem: Box<Type>, len: Option<usize> },
}

impl Type {
    /// Statically sized array `elem[len]`.
    pub fn array(elem: Type, len: usize) -> Self {
        Type::Array {
            elem: Box::new(elem),
            len: Some(len),
        }
    }

    /// Dynamically sized array, only valid for heap declarations.
    pub fn heap_array(elem: Type) -> Self {
        Type::Array {
            elem: Box::new(elem),
            len: None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array { .. })
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    /// Total number of cells a value of this type occupies, headers included.
    ///
    /// A dynamically sized array only accounts for its header here.
    pub fn cells(&self) -> usize {
        match self {
            Type::Void => 0,
            Type::Array { elem, len } => 1 + len.unwrap_or(0) * elem.cells(),
            _ => 1,
        }
    }

    /// Cells following the outermost header.
    pub fn span(&self) -> usize {
        self.cells().saturating_sub(1)
    }

    /// Static size of each dimension, outermost first.
    pub fn dims(&self) -> Vec<usize> {
        let mut dims = Vec::new();
        let mut ty = self;
        while let Type::Array { elem, len } = ty {
            dims.push(len.unwrap_or(0));
            ty = elem;
        }
        dims
    }

    /// Number of array dimensions (0 for scalars).
    pub fn rank(&self) -> usize {
        match self {
            Type::Array { elem, .. } => 1 + elem.rank(),
            _ => 0,
        }
    }

    /// Cell distance between consecutive elements at each dimension.
    ///
    /// For `int[2][3]` this is `[4, 1]`: each row is a header plus three ints.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = Vec::new();
        let mut ty = self;
        while let Type::Array { elem, .. } = ty {
            strides.push(elem.cells());
            ty = elem;
        }
        strides
    }

    /// Type reached after applying `depth` indices.
    pub fn element_at(&self, depth: usize) -> Option<&Type> {
        let mut ty = self;
        for _ in 0..depth {
            match ty {
                Type::Array { elem, .. } => ty = elem,
                _ => return None,
            }
        }
        Some(ty)
    }

    /// Cell layout of a default-initialized value: headers hold their static
    /// counts, every scalar cell is zero.
    pub fn default_cells(&self) -> Vec<f64> {
        let mut cells = Vec::with_capacity(self.cells());
        self.push_default_cells(&mut cells);
        cells
    }

    fn push_default_cells(&self, out: &mut Vec<f64>) {
        match self {
            Type::Void => {}
            Type::Array { elem, len } => {
                let len = len.unwrap_or(0);
                out.push(len as f64);
                for _ in 0..len {
                    elem.push_default_cells(out);
                }
            }
            _ => out.push(0.0),
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Bool => write!(f, "bool"),
            Type::Char => write!(f, "char"),
            Type::Void => write!(f, "void"),
            Type::Array { elem, len } => match len {
                Some(n) => write!(f, "{}[{}]", elem, n),
                None => write!(f, "{}[]", elem),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_cells() {
        assert_eq!(Type::Int.cells(), 1);
        assert_eq!(Type::Void.cells(), 0);
        assert_eq!(Type::Int.rank(), 0);
    }

    #[test]
    fn test_two_dimensional_layout() {
        let ty = Type::array(Type::array(Type::Int, 3), 2);

        assert_eq!(ty.cells(), 9);
        assert_eq!(ty.span(), 8);
        assert_eq!(ty.dims(), vec![2, 3]);
        assert_eq!(ty.strides(), vec![4, 1]);
        assert_eq!(ty.rank(), 2);
    }

    #[test]
    fn test_default_cells_carry_headers() {
        let ty = Type::array(Type::array(Type::Int, 3), 2);

        assert_eq!(
            ty.default_cells(),
            vec![2.0, 3.0, 0.0, 0.0, 0.0, 3.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_element_at() {
        let ty = Type::array(Type::array(Type::Char, 4), 2);

        assert_eq!(ty.element_at(1), Some(&Type::array(Type::Char, 4)));
        assert_eq!(ty.element_at(2), Some(&Type::Char));
        assert_eq!(ty.element_at(3), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Type::array(Type::Int, 3).to_string(), "int[3]");
        assert_eq!(Type::heap_array(Type::Float).to_string(), "float[]");
    }
}
