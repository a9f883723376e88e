//! IR Type System
//!
//! The type system covers what the obfuscation passes need to reason
//! about:
//! - Void type
//! - Integer types (i1, i8, i16, i32, i64, ...)
//! - Floating point types (half, float, double)
//! - Opaque pointer type
//! - Array types
//! - Function types

use std::fmt;
use std::sync::Arc;

/// An IR type.
///
/// Compound types are reference counted so that `Type` stays cheap to
/// clone and store in instruction payloads.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Int(u32),
    Float(FloatKind),
    /// Opaque pointer; the pointee is carried by the instruction that
    /// needs it (load, GEP, alloca).
    Ptr,
    Array(Arc<ArrayType>),
    Func(Arc<FunctionType>),
}

/// Floating point type kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatKind {
    Half,   // 16-bit
    Float,  // 32-bit
    Double, // 64-bit
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ArrayType {
    pub element: Type,
    pub len: u64,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub ret: Type,
    pub params: Vec<Type>,
    pub is_var_arg: bool,
}

impl Type {
    pub const I1: Type = Type::Int(1);
    pub const I8: Type = Type::Int(8);
    pub const I16: Type = Type::Int(16);
    pub const I32: Type = Type::Int(32);
    pub const I64: Type = Type::Int(64);

    pub fn array(element: Type, len: u64) -> Type {
        Type::Array(Arc::new(ArrayType { element, len }))
    }

    pub fn func(ret: Type, params: Vec<Type>, is_var_arg: bool) -> Type {
        Type::Func(Arc::new(FunctionType { ret, params, is_var_arg }))
    }

    // Type queries

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float(_))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Type::Func(_))
    }

    pub fn is_int_or_ptr(&self) -> bool {
        self.is_integer() || self.is_pointer()
    }

    /// Get the bit width of an integer type
    pub fn int_width(&self) -> Option<u32> {
        match self {
            Type::Int(bits) => Some(*bits),
            _ => None,
        }
    }

    /// Storage size in bytes, as the interpreter and GEP lowering see it.
    ///
    /// Integers round up to the next power-of-two byte size; pointers
    /// are 8 bytes. Panics for void and function types, which are not
    /// first-class storage.
    pub fn byte_size(&self) -> u64 {
        match self {
            Type::Void => panic!("void has no storage size"),
            Type::Int(bits) => match bits {
                0 => panic!("zero-width integer"),
                1..=8 => 1,
                9..=16 => 2,
                17..=32 => 4,
                33..=64 => 8,
                _ => panic!("integer wider than 64 bits"),
            },
            Type::Float(FloatKind::Half) => 2,
            Type::Float(FloatKind::Float) => 4,
            Type::Float(FloatKind::Double) => 8,
            Type::Ptr => 8,
            Type::Array(a) => a.element.byte_size() * a.len,
            Type::Func(_) => panic!("function type has no storage size"),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(bits) => write!(f, "i{}", bits),
            Type::Float(kind) => match kind {
                FloatKind::Half => write!(f, "half"),
                FloatKind::Float => write!(f, "float"),
                FloatKind::Double => write!(f, "double"),
            },
            Type::Ptr => write!(f, "ptr"),
            Type::Array(a) => write!(f, "[{} x {}]", a.len, a.element),
            Type::Func(ft) => {
                write!(f, "{} (", ft.ret)?;
                for (i, param) in ft.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                if ft.is_var_arg {
                    if !ft.params.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "...")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_types() {
        assert!(Type::I32.is_integer());
        assert_eq!(Type::I32.int_width(), Some(32));
        assert_eq!(format!("{}", Type::I32), "i32");
        assert_eq!(Type::Int(1).byte_size(), 1);
        assert_eq!(Type::Int(24).byte_size(), 4);
    }

    #[test]
    fn test_pointer_type() {
        assert!(Type::Ptr.is_pointer());
        assert!(Type::Ptr.is_int_or_ptr());
        assert_eq!(Type::Ptr.byte_size(), 8);
        assert_eq!(format!("{}", Type::Ptr), "ptr");
    }

    #[test]
    fn test_array_type() {
        let arr = Type::array(Type::I32, 10);
        assert!(arr.is_array());
        assert_eq!(arr.byte_size(), 40);
        assert_eq!(format!("{}", arr), "[10 x i32]");
    }

    #[test]
    fn test_function_type() {
        let fn_ty = Type::func(Type::I32, vec![Type::I32, Type::I32], false);
        assert!(fn_ty.is_function());
        assert_eq!(format!("{}", fn_ty), "i32 (i32, i32)");
    }
}
