//! BX's type system: `Int`, `Bool`, and `Void` (return type only).
//!
//! Type equality is nominal and simple — there is no inference or
//! polymorphism to unify.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Int,
    Bool,
    Void,
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Type::Int => "int",
            Type::Bool => "bool",
            Type::Void => "void",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_lowercase() {
        assert_eq!(Type::Int.to_string(), "int");
        assert_eq!(Type::Bool.to_string(), "bool");
        assert_eq!(Type::Void.to_string(), "void");
    }

    #[test]
    fn equality_is_nominal() {
        assert_eq!(Type::Int, Type::Int);
        assert_ne!(Type::Int, Type::Bool);
    }
}
