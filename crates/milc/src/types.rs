//! Type system for MIL
//!
//! MIL is already typed when it reaches this crate: every block has a block
//! type derived from its parameter types and body result, and the checker
//! (see `check.rs`) only verifies consistency. The vocabulary is small:
//! machine words, boolean flags, addresses, named data types, and closures.

use crate::mil::{ClosId, DataId};

/// Base types carried by MIL atoms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// Machine word (64-bit)
    Word,
    /// Boolean flag, the result of comparisons and the scrutinee of `if`
    Flag,
    /// Address of a static area or of address arithmetic rooted in one
    Addr,
    /// A named data type (bitdata or struct), by id into the program arena
    Data(DataId),
    /// A closure value; the block type describes what `enter` provides
    /// and produces
    Clos(ClosId),
}

impl Type {
    /// True for types already in machine representation; the representation
    /// transform leaves these alone.
    pub fn is_machine(&self) -> bool {
        matches!(self, Type::Word | Type::Flag | Type::Addr)
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Word => write!(f, "word"),
            Type::Flag => write!(f, "flag"),
            Type::Addr => write!(f, "addr"),
            Type::Data(d) => write!(f, "data#{}", d.0),
            Type::Clos(c) => write!(f, "clos#{}", c.0),
        }
    }
}

/// The type of a block: a tuple of parameter types and a tuple of result
/// types. Also used for closures, where `dom` is the argument tuple the
/// `enter` site supplies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockType {
    pub dom: Vec<Type>,
    pub rng: Vec<Type>,
}

impl BlockType {
    pub fn new(dom: Vec<Type>, rng: Vec<Type>) -> Self {
        BlockType { dom, rng }
    }

    /// Number of results this block produces.
    pub fn outity(&self) -> usize {
        self.rng.len()
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, t) in self.dom.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", t)?;
        }
        write!(f, ") -> (")?;
        for (i, t) in self.rng.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", t)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_types() {
        assert!(Type::Word.is_machine());
        assert!(Type::Flag.is_machine());
        assert!(Type::Addr.is_machine());
        assert!(!Type::Data(DataId(0)).is_machine());
    }

    #[test]
    fn test_block_type_display() {
        let bt = BlockType::new(vec![Type::Word, Type::Word], vec![Type::Flag]);
        assert_eq!(bt.to_string(), "(word, word) -> (flag)");
        assert_eq!(bt.outity(), 1);
    }
}
