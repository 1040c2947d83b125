// File: src/value.rs
//
// Runtime values and the GC-managed heap object kinds they can reference.
// Strings are refcounted but not traced by the collector (they hold no
// outgoing references); everything else that needs tracing lives behind
// a `GcRef` and is allocated through `Gc::alloc` (see gc.rs).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::Chunk;
use crate::type_info::TypeRef;

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Object(GcRef),
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_falsey(&self) -> bool {
        match self {
            Value::Nil => true,
            Value::Bool(b) => !b,
            _ => false,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<GcRef> {
        match self {
            Value::Object(o) => Some(*o),
            _ => None,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::Nil => "null".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Number(_) => "f64".to_string(),
            Value::Str(_) => "str".to_string(),
            Value::Object(o) => o.type_name(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Str(s) => write!(f, "{}", s),
            Value::Object(o) => write!(f, "{}", o),
        }
    }
}

/// Intrusive mark-and-sweep header shared by every heap object. `next`
/// threads the object through the collector's flat allocation list.
pub struct GcHeader {
    pub marked: Cell<bool>,
    pub next: Cell<Option<GcRef>>,
    pub size: usize,
}

pub struct Obj {
    pub header: GcHeader,
    pub data: RefCell<ObjData>,
}

/// A raw, non-owning reference to a heap-allocated `Obj`. Equality is by
/// identity, matching the value model's "heap-object values compare by
/// identity" rule. Only `Gc` (gc.rs) ever frees the pointee.
#[derive(Clone, Copy)]
pub struct GcRef(pub std::ptr::NonNull<Obj>);

impl GcRef {
    pub fn obj(&self) -> &Obj {
        unsafe { self.0.as_ref() }
    }

    pub fn marked(&self) -> bool {
        self.obj().header.marked.get()
    }

    pub fn set_marked(&self, value: bool) {
        self.obj().header.marked.set(value);
    }

    pub fn data(&self) -> std::cell::Ref<'_, ObjData> {
        self.obj().data.borrow()
    }

    pub fn data_mut(&self) -> std::cell::RefMut<'_, ObjData> {
        self.obj().data.borrow_mut()
    }

    pub fn type_name(&self) -> String {
        match &*self.data() {
            ObjData::Function(_) => "function".to_string(),
            ObjData::Closure(_) => "function".to_string(),
            ObjData::Upvalue(_) => "upvalue".to_string(),
            ObjData::Class(c) => c.name.clone(),
            ObjData::Instance(i) => i.class.class_name(),
            ObjData::BoundMethod(_) => "function".to_string(),
            ObjData::NativeFunction(_) => "function".to_string(),
            ObjData::NativeBoundMethod(_) => "function".to_string(),
            ObjData::Array(_) => "Array".to_string(),
            ObjData::Dict(_) => "Dict".to_string(),
            ObjData::Set(_) => "Set".to_string(),
            ObjData::Iterator(_) => "Iterator".to_string(),
            ObjData::Module(_) => "Module".to_string(),
        }
    }

    /// Walks `class -> superclass -> ...` looking up a method by name.
    pub fn find_method(&self, name: &str) -> Option<GcRef> {
        match &*self.data() {
            ObjData::Class(c) => c.find_method(name),
            _ => None,
        }
    }
}

impl PartialEq for GcRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl fmt::Display for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.data() {
            ObjData::Function(func) => write!(f, "<function {}>", func.name),
            ObjData::Closure(c) => {
                let name = c.function.data();
                if let ObjData::Function(func) = &*name {
                    write!(f, "<function {}>", func.name)
                } else {
                    write!(f, "<function>")
                }
            }
            ObjData::Upvalue(_) => write!(f, "<upvalue>"),
            ObjData::Class(c) => write!(f, "<class {}>", c.name),
            ObjData::Instance(i) => write!(f, "<instance {}>", i.class.class_name()),
            ObjData::BoundMethod(_) => write!(f, "<bound method>"),
            ObjData::NativeFunction(n) => write!(f, "<native {}>", n.name),
            ObjData::NativeBoundMethod(n) => write!(f, "<native bound {}>", n.name),
            ObjData::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.elements.borrow().iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            ObjData::Dict(d) => {
                write!(f, "{{")?;
                for (i, (k, v)) in d.entries.borrow().iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            ObjData::Set(s) => {
                write!(f, "Set{{")?;
                for (i, v) in s.elements.borrow().iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "}}")
            }
            ObjData::Iterator(_) => write!(f, "<iterator>"),
            ObjData::Module(m) => write!(f, "<module {}>", m.path),
        }
    }
}

pub enum ObjData {
    Function(FunctionObject),
    Closure(ClosureObject),
    Upvalue(UpvalueObject),
    Class(ClassObject),
    Instance(InstanceObject),
    BoundMethod(BoundMethodObject),
    NativeFunction(NativeFunctionObject),
    NativeBoundMethod(NativeBoundMethodObject),
    Array(ArrayObject),
    Dict(DictObject),
    Set(SetObject),
    Iterator(IteratorObject),
    Module(ModuleObject),
}

pub struct FunctionObject {
    pub name: String,
    pub params: Vec<String>,
    pub param_types: Vec<TypeRef>,
    pub chunk: Chunk,
    pub upvalue_count: usize,
}

pub struct ClosureObject {
    pub function: GcRef,
    pub upvalues: Vec<GcRef>,
}

pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct UpvalueObject {
    pub state: RefCell<UpvalueState>,
}

pub struct ClassObject {
    pub name: String,
    pub superclass: Option<GcRef>,
    pub methods: RefCell<HashMap<String, GcRef>>,
    pub field_types: RefCell<HashMap<String, TypeRef>>,
}

impl ClassObject {
    pub fn find_method(&self, name: &str) -> Option<GcRef> {
        if let Some(m) = self.methods.borrow().get(name) {
            return Some(*m);
        }
        match &self.superclass {
            Some(sup) => sup.find_method(name),
            None => None,
        }
    }

    /// True if `name` names this class or any class in its superclass chain.
    pub fn is_or_extends(&self, name: &str) -> bool {
        if self.name == name {
            return true;
        }
        match &self.superclass {
            Some(sup) => match &*sup.data() {
                ObjData::Class(c) => c.is_or_extends(name),
                _ => false,
            },
            None => false,
        }
    }
}

pub struct InstanceObject {
    pub class: GcRef,
    pub fields: RefCell<HashMap<String, Value>>,
}

impl InstanceObject {
    pub fn class_name(&self) -> String {
        match &*self.class.data() {
            ObjData::Class(c) => c.name.clone(),
            _ => "?".to_string(),
        }
    }
}

pub struct BoundMethodObject {
    pub receiver: GcRef,
    pub method: GcRef,
}

pub struct NativeFunctionObject {
    pub name: String,
    /// -1 means variadic (no arity check at call time).
    pub arity: i32,
    pub func: NativeFn,
}

pub struct NativeBoundMethodObject {
    pub name: String,
    pub receiver: GcRef,
    pub func: NativeFn,
}

pub struct ArrayObject {
    pub elements: RefCell<Vec<Value>>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    Str(String),
    Num(u64),
}

pub fn value_to_dict_key(value: &Value) -> Result<DictKey, String> {
    match value {
        Value::Str(s) => Ok(DictKey::Str(s.to_string())),
        Value::Number(n) => Ok(DictKey::Num(n.to_bits())),
        other => Err(format!("Dict keys must be strings or numbers, got {}", other.type_name())),
    }
}

/// Insertion-ordered map restricted to string/number keys (§3.5). The index
/// gives O(1) lookup while `entries` preserves iteration order for
/// `ITER_*` and display.
pub struct DictObject {
    pub entries: RefCell<Vec<(Value, Value)>>,
    pub index: RefCell<HashMap<DictKey, usize>>,
}

impl DictObject {
    pub fn new() -> Self {
        DictObject { entries: RefCell::new(Vec::new()), index: RefCell::new(HashMap::new()) }
    }

    pub fn insert(&self, key: Value, value: Value) -> Result<(), String> {
        let dict_key = value_to_dict_key(&key)?;
        let mut index = self.index.borrow_mut();
        if let Some(&i) = index.get(&dict_key) {
            self.entries.borrow_mut()[i].1 = value;
        } else {
            let i = self.entries.borrow().len();
            self.entries.borrow_mut().push((key, value));
            index.insert(dict_key, i);
        }
        Ok(())
    }

    pub fn get(&self, key: &Value) -> Result<Option<Value>, String> {
        let dict_key = value_to_dict_key(key)?;
        let index = self.index.borrow();
        Ok(index.get(&dict_key).map(|&i| self.entries.borrow()[i].1.clone()))
    }
}

impl Default for DictObject {
    fn default() -> Self {
        Self::new()
    }
}

/// Membership uses the same equality as `==`; elements aren't restricted
/// to hashable kinds, so membership is a linear scan (§3.5's contract is
/// semantic, not a performance guarantee).
pub struct SetObject {
    pub elements: RefCell<Vec<Value>>,
}

impl SetObject {
    pub fn contains(&self, value: &Value) -> bool {
        self.elements.borrow().iter().any(|v| v == value)
    }

    pub fn insert(&self, value: Value) {
        if !self.contains(&value) {
            self.elements.borrow_mut().push(value);
        }
    }
}

pub enum IterSource {
    Array(GcRef),
    Dict(GcRef),
    Set(GcRef),
}

pub struct IteratorObject {
    pub source: IterSource,
    pub pos: Cell<usize>,
}

impl IteratorObject {
    pub fn has_next(&self) -> bool {
        let len = match &self.source {
            IterSource::Array(a) => match &*a.data() {
                ObjData::Array(arr) => arr.elements.borrow().len(),
                _ => 0,
            },
            IterSource::Dict(d) => match &*d.data() {
                ObjData::Dict(dict) => dict.entries.borrow().len(),
                _ => 0,
            },
            IterSource::Set(s) => match &*s.data() {
                ObjData::Set(set) => set.elements.borrow().len(),
                _ => 0,
            },
        };
        self.pos.get() < len
    }

    /// Advances and yields the next element (array element, dict key, or
    /// set element per §3.5: "Dict (yields keys)").
    pub fn next(&self) -> Option<Value> {
        if !self.has_next() {
            return None;
        }
        let i = self.pos.get();
        self.pos.set(i + 1);
        match &self.source {
            IterSource::Array(a) => match &*a.data() {
                ObjData::Array(arr) => Some(arr.elements.borrow()[i].clone()),
                _ => None,
            },
            IterSource::Dict(d) => match &*d.data() {
                ObjData::Dict(dict) => Some(dict.entries.borrow()[i].0.clone()),
                _ => None,
            },
            IterSource::Set(s) => match &*s.data() {
                ObjData::Set(set) => Some(set.elements.borrow()[i].clone()),
                _ => None,
            },
        }
    }
}

pub struct ModuleObject {
    pub path: String,
    pub exports: RefCell<HashMap<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_equals_nil() {
        assert_eq!(Value::Nil, Value::Nil);
    }

    #[test]
    fn numbers_compare_by_value() {
        assert_eq!(Value::Number(1.0), Value::Number(1.0));
        assert_ne!(Value::Number(1.0), Value::Number(2.0));
    }

    #[test]
    fn display_formats_whole_numbers_without_decimal() {
        assert_eq!(Value::Number(44.0).to_string(), "44");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
    }

    #[test]
    fn dict_key_conversion_rejects_non_primitive() {
        assert!(value_to_dict_key(&Value::Nil).is_err());
        assert!(value_to_dict_key(&Value::str("k")).is_ok());
        assert!(value_to_dict_key(&Value::Number(1.0)).is_ok());
    }
}
