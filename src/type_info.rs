// File: src/type_info.rs
//
// Structural type representation shared by the type checker and the
// compiler. Primitive kinds are process-wide singletons so that two
// references to `i32` are pointer-equal; composite kinds are constructed
// fresh per occurrence.

use std::rc::Rc;

use crate::lexer::{Token, TokenKind};

pub type TypeRef = Rc<TypeInfo>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    USize,
    F32,
    F64,
    Bool,
    Str,
    Null,
    Void,
    Any,
    Class,
    Function,
    Array,
    Dict,
    Set,
    Optional,
}

#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub kind: TypeKind,
    pub class_name: String,
    pub param_types: Vec<TypeRef>,
    pub return_type: Option<TypeRef>,
    pub element_type: Option<TypeRef>,
    pub key_type: Option<TypeRef>,
    pub value_type: Option<TypeRef>,
    pub inner_type: Option<TypeRef>,
}

impl TypeInfo {
    fn primitive(kind: TypeKind) -> TypeRef {
        Rc::new(TypeInfo {
            kind,
            class_name: String::new(),
            param_types: Vec::new(),
            return_type: None,
            element_type: None,
            key_type: None,
            value_type: None,
            inner_type: None,
        })
    }
}

// Mirrors the original's function-local `static TypeRef instance`: one
// shared allocation per primitive kind, built on first use. `Rc` is not
// `Sync`, so a process-wide `once_cell::sync::Lazy` can't hold it directly;
// a `thread_local` gives the same one-allocation-per-kind behavior and is
// sound since the interpreter is single-threaded end to end.
macro_rules! singleton {
    ($fn_name:ident, $kind:expr) => {
        pub fn $fn_name() -> TypeRef {
            thread_local! {
                static INSTANCE: TypeRef = TypeInfo::primitive($kind);
            }
            INSTANCE.with(|t| t.clone())
        }
    };
}

impl TypeInfo {
    singleton!(make_i8, TypeKind::I8);
    singleton!(make_i16, TypeKind::I16);
    singleton!(make_i32, TypeKind::I32);
    singleton!(make_i64, TypeKind::I64);
    singleton!(make_u8, TypeKind::U8);
    singleton!(make_u16, TypeKind::U16);
    singleton!(make_u32, TypeKind::U32);
    singleton!(make_u64, TypeKind::U64);
    singleton!(make_usize, TypeKind::USize);
    singleton!(make_f32, TypeKind::F32);
    singleton!(make_f64, TypeKind::F64);
    singleton!(make_bool, TypeKind::Bool);
    singleton!(make_str, TypeKind::Str);
    singleton!(make_any, TypeKind::Any);
    singleton!(make_void, TypeKind::Void);
    singleton!(make_null, TypeKind::Null);

    pub fn make_class(name: impl Into<String>) -> TypeRef {
        Rc::new(TypeInfo { kind: TypeKind::Class, class_name: name.into(), ..Self::blank() })
    }

    pub fn make_function(params: Vec<TypeRef>, ret: TypeRef) -> TypeRef {
        Rc::new(TypeInfo {
            kind: TypeKind::Function,
            param_types: params,
            return_type: Some(ret),
            ..Self::blank()
        })
    }

    pub fn make_array(element: TypeRef) -> TypeRef {
        Rc::new(TypeInfo { kind: TypeKind::Array, element_type: Some(element), ..Self::blank() })
    }

    pub fn make_dict(key: TypeRef, value: TypeRef) -> TypeRef {
        Rc::new(TypeInfo {
            kind: TypeKind::Dict,
            key_type: Some(key),
            value_type: Some(value),
            ..Self::blank()
        })
    }

    pub fn make_set(element: TypeRef) -> TypeRef {
        Rc::new(TypeInfo { kind: TypeKind::Set, element_type: Some(element), ..Self::blank() })
    }

    pub fn make_optional(inner: TypeRef) -> TypeRef {
        Rc::new(TypeInfo { kind: TypeKind::Optional, inner_type: Some(inner), ..Self::blank() })
    }

    fn blank() -> TypeInfo {
        TypeInfo {
            kind: TypeKind::Any,
            class_name: String::new(),
            param_types: Vec::new(),
            return_type: None,
            element_type: None,
            key_type: None,
            value_type: None,
            inner_type: None,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::I8
                | TypeKind::I16
                | TypeKind::I32
                | TypeKind::I64
                | TypeKind::U8
                | TypeKind::U16
                | TypeKind::U32
                | TypeKind::U64
                | TypeKind::USize
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self.kind, TypeKind::F32 | TypeKind::F64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_signed(&self) -> bool {
        matches!(self.kind, TypeKind::I8 | TypeKind::I16 | TypeKind::I32 | TypeKind::I64)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::U8 | TypeKind::U16 | TypeKind::U32 | TypeKind::U64 | TypeKind::USize
        )
    }

    pub fn is_any(&self) -> bool {
        self.kind == TypeKind::Any
    }

    pub fn is_void(&self) -> bool {
        self.kind == TypeKind::Void
    }

    pub fn is_class(&self) -> bool {
        self.kind == TypeKind::Class
    }

    pub fn is_optional(&self) -> bool {
        self.kind == TypeKind::Optional
    }

    pub fn bit_width(&self) -> u32 {
        match self.kind {
            TypeKind::I8 | TypeKind::U8 => 8,
            TypeKind::I16 | TypeKind::U16 => 16,
            TypeKind::I32 | TypeKind::U32 | TypeKind::F32 => 32,
            TypeKind::I64 | TypeKind::U64 | TypeKind::USize | TypeKind::F64 => 64,
            _ => 0,
        }
    }
}

impl std::fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            TypeKind::I8 => write!(f, "i8"),
            TypeKind::I16 => write!(f, "i16"),
            TypeKind::I32 => write!(f, "i32"),
            TypeKind::I64 => write!(f, "i64"),
            TypeKind::U8 => write!(f, "u8"),
            TypeKind::U16 => write!(f, "u16"),
            TypeKind::U32 => write!(f, "u32"),
            TypeKind::U64 => write!(f, "u64"),
            TypeKind::USize => write!(f, "usize"),
            TypeKind::F32 => write!(f, "f32"),
            TypeKind::F64 => write!(f, "f64"),
            TypeKind::Bool => write!(f, "bool"),
            TypeKind::Str => write!(f, "str"),
            TypeKind::Null => write!(f, "null"),
            TypeKind::Void => write!(f, "void"),
            TypeKind::Any => write!(f, "any"),
            TypeKind::Class => write!(f, "{}", self.class_name),
            TypeKind::Function => {
                write!(f, "function(")?;
                for (i, p) in self.param_types.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(
                    f,
                    ") -> {}",
                    self.return_type.as_ref().map(|t| t.to_string()).unwrap_or_else(|| "void".into())
                )
            }
            TypeKind::Array => {
                write!(f, "Array<{}>", self.element_type.as_ref().map(|t| t.to_string()).unwrap_or_else(|| "any".into()))
            }
            TypeKind::Dict => write!(
                f,
                "Dict<{}, {}>",
                self.key_type.as_ref().map(|t| t.to_string()).unwrap_or_else(|| "any".into()),
                self.value_type.as_ref().map(|t| t.to_string()).unwrap_or_else(|| "any".into())
            ),
            TypeKind::Set => {
                write!(f, "Set<{}>", self.element_type.as_ref().map(|t| t.to_string()).unwrap_or_else(|| "any".into()))
            }
            TypeKind::Optional => {
                write!(f, "{}?", self.inner_type.as_ref().map(|t| t.to_string()).unwrap_or_else(|| "any".into()))
            }
        }
    }
}

fn widest_signed_int(bit_width: u32) -> TypeRef {
    if bit_width <= 8 {
        TypeInfo::make_i8()
    } else if bit_width <= 16 {
        TypeInfo::make_i16()
    } else if bit_width <= 32 {
        TypeInfo::make_i32()
    } else {
        TypeInfo::make_i64()
    }
}

fn widest_unsigned_int(bit_width: u32) -> TypeRef {
    if bit_width <= 8 {
        TypeInfo::make_u8()
    } else if bit_width <= 16 {
        TypeInfo::make_u16()
    } else if bit_width <= 32 {
        TypeInfo::make_u32()
    } else {
        TypeInfo::make_u64()
    }
}

/// True if a subclass chain, represented as repeated `class_name` lookups
/// against `superclass_of`, connects `derived` to `base`.
pub fn is_class_subtype(derived: &str, base: &str, superclass_of: &dyn Fn(&str) -> Option<String>) -> bool {
    let mut current = Some(derived.to_string());
    while let Some(name) = current {
        if name == base {
            return true;
        }
        current = superclass_of(&name);
    }
    false
}

/// `any` is bidirectionally compatible with everything; structural kinds
/// recurse into their element/key/value types; numeric-to-numeric permits
/// same-signedness widening plus any-to-f64 and f32-to-f32; `null` is
/// assignable to nothing but `any`.
pub fn is_assignable(from: &TypeRef, to: &TypeRef) -> bool {
    if to.is_any() || from.is_any() {
        return true;
    }

    if from.kind == to.kind {
        return match from.kind {
            TypeKind::Array | TypeKind::Set => {
                let from_elem = from.element_type.clone().unwrap_or_else(TypeInfo::make_any);
                let to_elem = to.element_type.clone().unwrap_or_else(TypeInfo::make_any);
                is_assignable(&from_elem, &to_elem)
            }
            TypeKind::Dict => {
                let from_key = from.key_type.clone().unwrap_or_else(TypeInfo::make_any);
                let to_key = to.key_type.clone().unwrap_or_else(TypeInfo::make_any);
                let from_val = from.value_type.clone().unwrap_or_else(TypeInfo::make_any);
                let to_val = to.value_type.clone().unwrap_or_else(TypeInfo::make_any);
                is_assignable(&from_key, &to_key) && is_assignable(&from_val, &to_val)
            }
            TypeKind::Class => from.class_name == to.class_name,
            _ => true,
        };
    }

    if from.kind == TypeKind::Null || to.kind == TypeKind::Null {
        return false;
    }

    if from.is_numeric() && to.is_numeric() {
        if to.kind == TypeKind::F64 {
            return true;
        }
        if to.kind == TypeKind::F32 {
            return from.kind == TypeKind::F32;
        }
        if from.is_signed() && to.is_signed() {
            return from.bit_width() <= to.bit_width();
        }
        if from.is_unsigned() && to.is_unsigned() {
            return from.bit_width() <= to.bit_width();
        }
        return false;
    }

    false
}

/// If either side is float, widen to f64 unless both are f32; otherwise
/// widen to the wider same-signedness integer; mixed signedness promotes
/// to f64 to avoid silent sign loss. Returns `None` if either side is
/// non-numeric.
pub fn numeric_promotion(lhs: &TypeRef, rhs: &TypeRef) -> Option<TypeRef> {
    if !lhs.is_numeric() || !rhs.is_numeric() {
        return None;
    }

    if lhs.is_float() || rhs.is_float() {
        if lhs.kind == TypeKind::F32 && rhs.kind == TypeKind::F32 {
            return Some(TypeInfo::make_f32());
        }
        return Some(TypeInfo::make_f64());
    }

    if lhs.is_signed() && rhs.is_signed() {
        return Some(widest_signed_int(lhs.bit_width().max(rhs.bit_width())));
    }

    if lhs.is_unsigned() && rhs.is_unsigned() {
        return Some(widest_unsigned_int(lhs.bit_width().max(rhs.bit_width())));
    }

    Some(TypeInfo::make_f64())
}

/// True if the token at `tokens[pos]` can begin a type annotation: one of
/// the primitive type keywords, or an identifier (a class name, or one of
/// the generic collection names `Array`/`Dict`/`Set`). Used by both the
/// type checker and the compiler to disambiguate `T x = e;` declarations
/// from plain expression statements (a two-token lookahead: a leading
/// identifier only starts a type when the following token is itself an
/// identifier, per the single-pass grammar in §4.4).
pub fn starts_type(tokens: &[Token], pos: usize) -> bool {
    let Some(tok) = tokens.get(pos) else { return false };
    if tok.kind.is_type_token() && tok.kind != TokenKind::Null {
        return true;
    }
    if tok.kind == TokenKind::Identifier {
        return matches!(tokens.get(pos + 1).map(|t| t.kind), Some(TokenKind::Identifier));
    }
    false
}

/// Parses a type annotation starting at `tokens[*pos]`, advancing `*pos`
/// past it. `is_known_class` resolves bare identifiers that aren't one of
/// the generic collection names to a class type.
pub fn parse_type_ref(
    tokens: &[Token],
    pos: &mut usize,
    is_known_class: &dyn Fn(&str) -> bool,
) -> Result<TypeRef, String> {
    let tok = tokens.get(*pos).ok_or_else(|| "Expected type, found end of input.".to_string())?;
    let base = match tok.kind {
        TokenKind::TypeI8 => { *pos += 1; TypeInfo::make_i8() }
        TokenKind::TypeI16 => { *pos += 1; TypeInfo::make_i16() }
        TokenKind::TypeI32 => { *pos += 1; TypeInfo::make_i32() }
        TokenKind::TypeI64 => { *pos += 1; TypeInfo::make_i64() }
        TokenKind::TypeU8 => { *pos += 1; TypeInfo::make_u8() }
        TokenKind::TypeU16 => { *pos += 1; TypeInfo::make_u16() }
        TokenKind::TypeU32 => { *pos += 1; TypeInfo::make_u32() }
        TokenKind::TypeU64 => { *pos += 1; TypeInfo::make_u64() }
        TokenKind::TypeUSize => { *pos += 1; TypeInfo::make_usize() }
        TokenKind::TypeF32 => { *pos += 1; TypeInfo::make_f32() }
        TokenKind::TypeF64 => { *pos += 1; TypeInfo::make_f64() }
        TokenKind::TypeBool => { *pos += 1; TypeInfo::make_bool() }
        TokenKind::TypeStr => { *pos += 1; TypeInfo::make_str() }
        TokenKind::Identifier => {
            let name = tok.lexeme.clone();
            *pos += 1;
            match name.as_str() {
                "Array" => {
                    expect_less(tokens, pos)?;
                    let elem = parse_type_ref(tokens, pos, is_known_class)?;
                    expect_greater(tokens, pos)?;
                    TypeInfo::make_array(elem)
                }
                "Set" => {
                    expect_less(tokens, pos)?;
                    let elem = parse_type_ref(tokens, pos, is_known_class)?;
                    expect_greater(tokens, pos)?;
                    TypeInfo::make_set(elem)
                }
                "Dict" => {
                    expect_less(tokens, pos)?;
                    let key = parse_type_ref(tokens, pos, is_known_class)?;
                    expect_comma(tokens, pos)?;
                    let value = parse_type_ref(tokens, pos, is_known_class)?;
                    expect_greater(tokens, pos)?;
                    TypeInfo::make_dict(key, value)
                }
                "any" => TypeInfo::make_any(),
                _ => {
                    if is_known_class(&name) {
                        TypeInfo::make_class(name)
                    } else {
                        return Err(format!("Unknown type '{}'.", name));
                    }
                }
            }
        }
        _ => return Err(format!("Expected type, found '{}'.", tok.lexeme)),
    };

    if matches!(tokens.get(*pos).map(|t| t.kind), Some(TokenKind::Bang)) {
        // `T?` isn't lexed distinctly; optional types are only produced
        // internally (e.g. nullable fields), not parsed from source in
        // the core grammar, so there is no surface syntax to consume here.
    }

    Ok(base)
}

fn expect_less(tokens: &[Token], pos: &mut usize) -> Result<(), String> {
    match tokens.get(*pos).map(|t| t.kind) {
        Some(TokenKind::Less) => { *pos += 1; Ok(()) }
        _ => Err("Expected '<' to begin generic type arguments.".to_string()),
    }
}

fn expect_greater(tokens: &[Token], pos: &mut usize) -> Result<(), String> {
    match tokens.get(*pos).map(|t| t.kind) {
        Some(TokenKind::Greater) => { *pos += 1; Ok(()) }
        _ => Err("Expected '>' to close generic type arguments.".to_string()),
    }
}

fn expect_comma(tokens: &[Token], pos: &mut usize) -> Result<(), String> {
    match tokens.get(*pos).map(|t| t.kind) {
        Some(TokenKind::Comma) => { *pos += 1; Ok(()) }
        _ => Err("Expected ',' between Dict key and value types.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_reference_equal() {
        assert!(Rc::ptr_eq(&TypeInfo::make_i32(), &TypeInfo::make_i32()));
        assert!(!Rc::ptr_eq(&TypeInfo::make_i32(), &TypeInfo::make_i64()));
    }

    #[test]
    fn any_is_bidirectionally_assignable() {
        assert!(is_assignable(&TypeInfo::make_any(), &TypeInfo::make_str()));
        assert!(is_assignable(&TypeInfo::make_str(), &TypeInfo::make_any()));
    }

    #[test]
    fn signed_widening_is_one_directional() {
        assert!(is_assignable(&TypeInfo::make_i8(), &TypeInfo::make_i32()));
        assert!(!is_assignable(&TypeInfo::make_i32(), &TypeInfo::make_i8()));
    }

    #[test]
    fn null_assignable_only_to_any() {
        assert!(!is_assignable(&TypeInfo::make_null(), &TypeInfo::make_i32()));
        assert!(is_assignable(&TypeInfo::make_null(), &TypeInfo::make_any()));
    }

    #[test]
    fn mixed_signedness_promotes_to_f64() {
        let promoted = numeric_promotion(&TypeInfo::make_i32(), &TypeInfo::make_u32()).unwrap();
        assert_eq!(promoted.kind, TypeKind::F64);
    }

    #[test]
    fn array_assignability_recurses_into_element_type() {
        let narrow_elems = TypeInfo::make_array(TypeInfo::make_i32());
        let wide_elems = TypeInfo::make_array(TypeInfo::make_i8());
        assert!(is_assignable(&wide_elems, &narrow_elems), "i8 widens into i32 elementwise");
        assert!(!is_assignable(&narrow_elems, &wide_elems), "i32 does not narrow into i8");
    }
}
