// File: src/vm.rs
//
// Stack-based bytecode virtual machine (§4.5). Drives a dispatch loop
// over the active call frame's `Chunk`, owns the evaluation stack, the
// frame stack, the globals vector, the open-upvalue list, and the GC
// heap. Grounded on the call-protocol and dispatch-loop contract in
// examples/original_source/src/VirtualMachine.cpp, generalized from the
// original's arithmetic-only opcode set to the full vocabulary in
// bytecode.rs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;

use crate::builtins::{native_fn, standard_library_natives};
use crate::bytecode::{GlobalTable, NarrowKind, OpCode};
use crate::errors::{find_closest_match, ErrorKind, RuffError, SourceLocation};
use crate::gc::{Gc, INITIAL_GC_THRESHOLD};
use crate::type_checker::TypeChecker;
use crate::value::{
    ArrayObject, BoundMethodObject, ClassObject, ClosureObject, DictObject, GcRef, InstanceObject,
    IterSource, IteratorObject, ModuleObject, NativeFunctionObject, ObjData, SetObject,
    UpvalueObject, UpvalueState, Value,
};

/// Hard cap on live call frames (§3.8): exceeding it is a runtime
/// stack-overflow error, distinct from the compiler's own compile-time
/// limits (256 constants, 16-bit jump offsets).
const FRAME_MAX: usize = 256;

struct CallFrame {
    closure: GcRef,
    ip: usize,
    /// Stack index of the first local slot (the callee value itself sits
    /// one below this, at `slot_base - 1`).
    slot_base: usize,
    receiver: Option<GcRef>,
}

/// Executes compiled chunks. `out` is where `print` writes go — real
/// stdout outside tests, a buffer inside them (A.5's "pluggable VM output
/// writer").
pub struct VM {
    gc: Gc,
    globals: GlobalTable,
    global_values: Vec<Value>,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<GcRef>,
    modules: HashMap<String, GcRef>,
    gc_threshold: usize,
    out: Box<dyn Write>,
    file: Option<String>,
    source_lines: Vec<String>,
}

impl VM {
    pub fn new() -> Self {
        VM::with_writer(Box::new(std::io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write>) -> Self {
        let mut vm = VM {
            gc: Gc::new(),
            globals: GlobalTable::new(),
            global_values: Vec::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            modules: HashMap::new(),
            gc_threshold: INITIAL_GC_THRESHOLD,
            out,
            file: None,
            source_lines: Vec::new(),
        };
        vm.install_stdlib();
        vm
    }

    /// Declares every native in the globals table up front so the
    /// compiler's identifier resolution (`slot_for_or_declare`) finds an
    /// existing slot the first time source references e.g. `clock`.
    fn install_stdlib(&mut self) {
        for descriptor in standard_library_natives() {
            let slot = self.globals.slot_for_or_declare(descriptor.name);
            let (func, arity): (crate::value::NativeFn, i32) = match native_fn(descriptor.name) {
                Some(pair) => pair,
                // `Set` constructs a heap object and has no access to the
                // GC from a bare function pointer; `call_value` special-cases
                // it by name instead of invoking `func`.
                None => (native_set_placeholder, -1),
            };
            let native = self.gc.alloc(ObjData::NativeFunction(NativeFunctionObject {
                name: descriptor.name.to_string(),
                arity,
                func,
            }));
            self.set_global_slot(slot, Value::Object(native));
        }
    }

    /// Runs the full pipeline against this VM's persistent globals table —
    /// type-check, compile, execute — matching the REPL shape (A.2): the
    /// compiler's own tables reset per call, but VM state persists.
    pub fn run_source(&mut self, source: &str, file: Option<String>) -> Result<(), Vec<RuffError>> {
        let type_errors = TypeChecker::new(source, file.clone()).check();
        if !type_errors.is_empty() {
            return Err(type_errors);
        }
        self.file = file.clone();
        self.source_lines = source.lines().map(|l| l.to_string()).collect();
        let script = crate::compiler::compile(source, file, &mut self.gc, &mut self.globals)?;
        self.run(script).map_err(|e| vec![e])
    }

    /// Executes an already-compiled top-level script `FunctionObject`.
    pub fn run(&mut self, script: GcRef) -> Result<(), RuffError> {
        let closure = self.alloc(ObjData::Closure(ClosureObject { function: script, upvalues: Vec::new() }));
        self.stack.push(Value::Object(closure));
        self.frames.push(CallFrame { closure, ip: 0, slot_base: self.stack.len(), receiver: None });
        let result = self.run_frames(0);
        if result.is_err() {
            self.frames.clear();
            self.stack.clear();
        }
        result
    }

    // ---- errors ----

    fn runtime_error(&self, message: impl Into<String>) -> RuffError {
        let line = self.current_line();
        let location = SourceLocation::with_file(
            line as usize,
            1,
            self.file.clone().unwrap_or_else(|| "<repl>".to_string()),
        );
        let mut err = RuffError::new(ErrorKind::RuntimeError, message.into(), location);
        if let Some(src) = self.source_lines.get((line as usize).saturating_sub(1)) {
            err = err.with_source(src.clone());
        }
        err
    }

    fn undefined_name_error(&self, name: &str, what: &str) -> RuffError {
        let mut candidates: Vec<String> = self.globals.known_names().to_vec();
        candidates.extend(self.modules.keys().cloned());
        let suggestion = find_closest_match(name, &candidates).map(|s| s.to_string());
        let mut err = self.runtime_error(format!("Undefined {} '{}'.", what, name));
        if let Some(s) = suggestion {
            err = err.with_suggestion(s);
        }
        err
    }

    fn current_line(&self) -> u32 {
        let frame = match self.frames.last() {
            Some(f) => f,
            None => return 0,
        };
        self.line_at(frame.closure, frame.ip.saturating_sub(1))
    }

    fn line_at(&self, closure: GcRef, ip: usize) -> u32 {
        match &*closure.data() {
            ObjData::Closure(c) => match &*c.function.data() {
                ObjData::Function(f) => f.chunk.lines.get(ip).copied().unwrap_or(0),
                _ => 0,
            },
            _ => 0,
        }
    }

    // ---- stack helpers ----

    fn push(&mut self, value: Value) -> Result<(), RuffError> {
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("compiler guarantees balanced stack effects")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance].clone()
    }

    // ---- globals ----

    fn set_global_slot(&mut self, slot: u16, value: Value) {
        let idx = slot as usize;
        if self.global_values.len() <= idx {
            self.global_values.resize(idx + 1, Value::Nil);
        }
        self.global_values[idx] = value;
    }

    // ---- GC ----

    fn maybe_collect(&mut self) {
        if self.gc.bytes_allocated() < self.gc_threshold {
            return;
        }
        self.collect_garbage();
    }

    /// Marks every root in §5 — evaluation stack, frame closures/receivers,
    /// open upvalues, globals, loaded modules — then sweeps.
    fn collect_garbage(&mut self) {
        for value in self.stack.clone() {
            self.gc.mark_value(&value);
        }
        let frame_roots: Vec<(GcRef, Option<GcRef>)> =
            self.frames.iter().map(|f| (f.closure, f.receiver)).collect();
        for (closure, receiver) in frame_roots {
            self.gc.mark_object(closure);
            if let Some(r) = receiver {
                self.gc.mark_object(r);
            }
        }
        for up in self.open_upvalues.clone() {
            self.gc.mark_object(up);
        }
        for value in self.global_values.clone() {
            self.gc.mark_value(&value);
        }
        for module in self.modules.values().copied().collect::<Vec<_>>() {
            self.gc.mark_object(module);
        }
        self.gc.drain_gray_stack();
        self.gc.sweep();
        self.gc_threshold = std::cmp::max(INITIAL_GC_THRESHOLD, 2 * self.gc.bytes_allocated());
    }

    fn alloc(&mut self, data: ObjData) -> GcRef {
        self.maybe_collect();
        self.gc.alloc(data)
    }

    // ---- upvalues ----

    fn capture_upvalue(&mut self, stack_index: usize) -> GcRef {
        for up in &self.open_upvalues {
            if let ObjData::Upvalue(u) = &*up.data() {
                if let UpvalueState::Open(i) = &*u.state.borrow() {
                    if *i == stack_index {
                        return *up;
                    }
                }
            }
        }
        let obj = self.alloc(ObjData::Upvalue(UpvalueObject { state: RefCell::new(UpvalueState::Open(stack_index)) }));
        self.open_upvalues.push(obj);
        obj
    }

    /// Moves every open upvalue pointing at `from_index` or higher onto
    /// the heap, copying the stack value it aliased (§3.6).
    fn close_upvalues_from(&mut self, from_index: usize) {
        let mut still_open = Vec::with_capacity(self.open_upvalues.len());
        for up in self.open_upvalues.drain(..) {
            let open_index = match &*up.data() {
                ObjData::Upvalue(u) => match &*u.state.borrow() {
                    UpvalueState::Open(i) => Some(*i),
                    UpvalueState::Closed(_) => None,
                },
                _ => None,
            };
            match open_index {
                Some(i) if i >= from_index => {
                    let value = self.stack[i].clone();
                    if let ObjData::Upvalue(u) = &*up.data() {
                        *u.state.borrow_mut() = UpvalueState::Closed(value);
                    }
                }
                _ => still_open.push(up),
            }
        }
        self.open_upvalues = still_open;
    }

    fn read_upvalue(&self, up: GcRef) -> Value {
        match &*up.data() {
            ObjData::Upvalue(u) => match &*u.state.borrow() {
                UpvalueState::Open(idx) => self.stack[*idx].clone(),
                UpvalueState::Closed(v) => v.clone(),
            },
            _ => unreachable!("upvalue index always names an Upvalue object"),
        }
    }

    fn write_upvalue(&mut self, up: GcRef, value: Value) {
        let open_index = match &*up.data() {
            ObjData::Upvalue(u) => match &*u.state.borrow() {
                UpvalueState::Open(idx) => Some(*idx),
                UpvalueState::Closed(_) => None,
            },
            _ => unreachable!("upvalue index always names an Upvalue object"),
        };
        match open_index {
            Some(idx) => self.stack[idx] = value,
            None => {
                if let ObjData::Upvalue(u) = &*up.data() {
                    *u.state.borrow_mut() = UpvalueState::Closed(value);
                }
            }
        }
    }

    // ---- chunk access ----

    fn fetch(&mut self) -> Result<OpCode, RuffError> {
        let frame = self.frames.last_mut().expect("dispatch only runs with an active frame");
        let op = match &*frame.closure.data() {
            ObjData::Closure(c) => match &*c.function.data() {
                ObjData::Function(f) => f.chunk.code.get(frame.ip).cloned(),
                _ => None,
            },
            _ => None,
        };
        match op {
            Some(op) => {
                frame.ip += 1;
                Ok(op)
            }
            None => Err(self.runtime_error("Instruction pointer ran past the end of the chunk.")),
        }
    }

    fn constant(&self, idx: u8) -> Value {
        let frame = self.frames.last().expect("active frame");
        match &*frame.closure.data() {
            ObjData::Closure(c) => match &*c.function.data() {
                ObjData::Function(f) => f.chunk.constants[idx as usize].clone(),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    fn string_constant(&self, idx: u8) -> String {
        self.constant(idx).to_string()
    }

    fn current_upvalue(&self, idx: u8) -> GcRef {
        let frame = self.frames.last().expect("active frame");
        match &*frame.closure.data() {
            ObjData::Closure(c) => c.upvalues[idx as usize],
            _ => unreachable!(),
        }
    }

    // ---- module bookkeeping ----

    fn current_module(&self) -> Option<GcRef> {
        self.file.as_ref().and_then(|f| self.modules.get(f).copied())
    }

    fn import_module(&mut self, path: &str) -> Result<GcRef, RuffError> {
        if let Some(existing) = self.modules.get(path) {
            return Ok(*existing);
        }
        let source = std::fs::read_to_string(path)
            .map_err(|e| self.runtime_error(format!("Cannot read module '{}': {}.", path, e)))?;

        let module_ref = self.alloc(ObjData::Module(ModuleObject {
            path: path.to_string(),
            exports: RefCell::new(HashMap::new()),
        }));
        self.modules.insert(path.to_string(), module_ref);

        let previous_file = self.file.replace(path.to_string());
        let previous_lines = std::mem::replace(&mut self.source_lines, source.lines().map(|l| l.to_string()).collect());
        let outcome = self.execute_module_source(&source, path);
        self.file = previous_file;
        self.source_lines = previous_lines;
        outcome?;
        Ok(module_ref)
    }

    fn execute_module_source(&mut self, source: &str, path: &str) -> Result<(), RuffError> {
        let type_errors = TypeChecker::new(source, Some(path.to_string())).check();
        if let Some(first) = type_errors.into_iter().next() {
            return Err(first);
        }
        let function = crate::compiler::compile(source, Some(path.to_string()), &mut self.gc, &mut self.globals)
            .map_err(|mut errs| errs.drain(..).next().expect("non-empty error list"))?;
        let closure = self.alloc(ObjData::Closure(ClosureObject { function, upvalues: Vec::new() }));
        self.stack.push(Value::Object(closure));
        let floor = self.frames.len();
        self.frames.push(CallFrame { closure, ip: 0, slot_base: self.stack.len(), receiver: None });
        self.run_frames(floor)
    }

    // ---- dispatch ----

    /// Runs instructions until the frame stack depth drops back to
    /// `floor` (its depth before the caller pushed the frame it wants
    /// executed). Used both for the top-level run (`floor == 0`) and for
    /// a module's nested execution (`floor` = depth before the import).
    fn run_frames(&mut self, floor: usize) -> Result<(), RuffError> {
        loop {
            if self.frames.len() == floor {
                return Ok(());
            }
            let op = self.fetch()?;
            if let OpCode::Return = op {
                let result = self.pop();
                let frame = self.frames.pop().expect("Return always has an active frame");
                self.close_upvalues_from(frame.slot_base - 1);
                self.stack.truncate(frame.slot_base - 1);
                self.push(result)?;
                continue;
            }
            self.execute(op)?;
        }
    }

    fn execute(&mut self, op: OpCode) -> Result<(), RuffError> {
        match op {
            OpCode::Return => unreachable!("handled by run_frames"),

            OpCode::Constant(idx) => {
                let v = self.constant(idx);
                self.push(v)?;
            }
            OpCode::Nil => self.push(Value::Nil)?,
            OpCode::TrueLiteral => self.push(Value::Bool(true))?,
            OpCode::FalseLiteral => self.push(Value::Bool(false))?,

            OpCode::Add => self.binary_add()?,
            OpCode::Sub => self.binary_numeric(|a, b| a - b)?,
            OpCode::Mult => self.binary_numeric(|a, b| a * b)?,
            OpCode::Div => self.binary_numeric(|a, b| a / b)?,
            OpCode::IAdd => self.binary_int(true, i64::wrapping_add)?,
            OpCode::ISub => self.binary_int(true, i64::wrapping_sub)?,
            OpCode::IMult => self.binary_int(true, i64::wrapping_mul)?,
            OpCode::IDiv => self.binary_int_div(true)?,
            OpCode::UAdd => self.binary_int(false, i64::wrapping_add)?,
            OpCode::USub => self.binary_int(false, i64::wrapping_sub)?,
            OpCode::UMult => self.binary_int(false, i64::wrapping_mul)?,
            OpCode::UDiv => self.binary_int_div(false)?,
            OpCode::Negate => {
                let n = self.pop_number("Operand to '-' must be a number.")?;
                self.push(Value::Number(-n))?;
            }

            OpCode::EqualOp => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a == b))?;
            }
            OpCode::NotEqualOp => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a != b))?;
            }
            OpCode::GreaterThan => self.compare(|a, b| a > b)?,
            OpCode::LessThan => self.compare(|a, b| a < b)?,
            OpCode::GreaterEqualThan => self.compare(|a, b| a >= b)?,
            OpCode::LessEqualThan => self.compare(|a, b| a <= b)?,

            OpCode::ShiftLeft => self.shift(|a, b| a.wrapping_shl(b as u32))?,
            OpCode::ShiftRight => self.shift(|a, b| a.wrapping_shr(b as u32))?,

            OpCode::Not => {
                let v = self.pop();
                self.push(Value::Bool(v.is_falsey()))?;
            }

            OpCode::Pop => {
                self.pop();
            }
            OpCode::Dup => {
                let v = self.peek(0);
                self.push(v)?;
            }
            OpCode::Dup2 => {
                let len = self.stack.len();
                let a = self.stack[len - 2].clone();
                let b = self.stack[len - 1].clone();
                self.push(a)?;
                self.push(b)?;
            }
            OpCode::GetLocal(slot) => {
                let idx = self.frames.last().unwrap().slot_base + slot as usize;
                let v = self.stack[idx].clone();
                self.push(v)?;
            }
            OpCode::SetLocal(slot) => {
                let idx = self.frames.last().unwrap().slot_base + slot as usize;
                self.stack[idx] = self.peek(0);
            }
            OpCode::DefineGlobal(slot) => {
                let v = self.pop();
                self.set_global_slot(slot, v);
            }
            OpCode::GetGlobal(slot) => match self.global_values.get(slot as usize) {
                Some(v) => {
                    let v = v.clone();
                    self.push(v)?;
                }
                None => {
                    let name = self.globals.known_names().get(slot as usize).cloned().unwrap_or_default();
                    return Err(self.undefined_name_error(&name, "variable"));
                }
            },
            OpCode::SetGlobal(slot) => {
                let v = self.peek(0);
                self.set_global_slot(slot, v);
            }
            OpCode::GetUpvalue(idx) => {
                let up = self.current_upvalue(idx);
                let v = self.read_upvalue(up);
                self.push(v)?;
            }
            OpCode::SetUpvalue(idx) => {
                let up = self.current_upvalue(idx);
                let v = self.peek(0);
                self.write_upvalue(up, v);
            }
            OpCode::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues_from(top);
                self.pop();
            }

            OpCode::Jump(offset) => {
                self.frames.last_mut().unwrap().ip += offset as usize;
            }
            OpCode::JumpIfFalse(offset) => {
                if self.peek(0).is_falsey() {
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
            }
            OpCode::Loop(offset) => {
                self.frames.last_mut().unwrap().ip -= offset as usize;
            }

            OpCode::Closure(const_idx, upvalue_descs) => {
                let func_val = self.constant(const_idx);
                let function = match func_val {
                    Value::Object(o) => o,
                    _ => return Err(self.runtime_error("CLOSURE constant is not a function.")),
                };
                let slot_base = self.frames.last().unwrap().slot_base;
                let enclosing = self.frames.last().unwrap().closure;
                let mut upvalues = Vec::with_capacity(upvalue_descs.len());
                for desc in &upvalue_descs {
                    if desc.is_local {
                        upvalues.push(self.capture_upvalue(slot_base + desc.index as usize));
                    } else {
                        let enclosing_upvalues = match &*enclosing.data() {
                            ObjData::Closure(c) => c.upvalues.clone(),
                            _ => unreachable!(),
                        };
                        upvalues.push(enclosing_upvalues[desc.index as usize]);
                    }
                }
                let closure = self.alloc(ObjData::Closure(ClosureObject { function, upvalues }));
                self.push(Value::Object(closure))?;
            }
            OpCode::Call(argc) => self.call_value(argc as usize)?,

            OpCode::ClassOp(name_idx) => {
                let name = self.string_constant(name_idx);
                let class = self.alloc(ObjData::Class(ClassObject {
                    name,
                    superclass: None,
                    methods: RefCell::new(HashMap::new()),
                    field_types: RefCell::new(HashMap::new()),
                }));
                self.push(Value::Object(class))?;
            }
            OpCode::Inherit => {
                let super_val = self.pop();
                let super_ref = match super_val {
                    Value::Object(o) if matches!(&*o.data(), ObjData::Class(_)) => o,
                    _ => return Err(self.runtime_error("Superclass must be a class.")),
                };
                let class_ref = match self.peek(0) {
                    Value::Object(o) => o,
                    _ => return Err(self.runtime_error("INHERIT target is not a class.")),
                };
                match &mut *class_ref.data_mut() {
                    ObjData::Class(c) => c.superclass = Some(super_ref),
                    _ => unreachable!(),
                }
            }
            OpCode::Method(name_idx) => {
                let name = self.string_constant(name_idx);
                let method_ref = match self.pop() {
                    Value::Object(o) => o,
                    _ => return Err(self.runtime_error("METHOD value is not a closure.")),
                };
                let class_ref = match self.peek(0) {
                    Value::Object(o) => o,
                    _ => return Err(self.runtime_error("METHOD target is not a class.")),
                };
                match &*class_ref.data() {
                    ObjData::Class(c) => {
                        c.methods.borrow_mut().insert(name, method_ref);
                    }
                    _ => unreachable!(),
                }
            }
            OpCode::GetProperty(name_idx) => {
                let name = self.string_constant(name_idx);
                let receiver = self.pop();
                let value = self.get_property(&receiver, &name)?;
                self.push(value)?;
            }
            OpCode::SetProperty(name_idx) => {
                let name = self.string_constant(name_idx);
                let value = self.pop();
                let receiver = self.pop();
                match receiver {
                    Value::Object(o) if matches!(&*o.data(), ObjData::Instance(_)) => match &*o.data() {
                        ObjData::Instance(i) => {
                            i.fields.borrow_mut().insert(name, value.clone());
                        }
                        _ => unreachable!(),
                    },
                    _ => return Err(self.runtime_error("Only instances have settable properties.")),
                }
                self.push(value)?;
            }
            OpCode::GetSuper(name_idx) => {
                let name = self.string_constant(name_idx);
                let receiver = match self.pop() {
                    Value::Object(o) => o,
                    _ => return Err(self.runtime_error("'super' used outside an instance method.")),
                };
                let class_ref = match &*receiver.data() {
                    ObjData::Instance(i) => i.class,
                    _ => return Err(self.runtime_error("'super' used outside an instance method.")),
                };
                let superclass = match &*class_ref.data() {
                    ObjData::Class(c) => c.superclass,
                    _ => return Err(self.runtime_error("'super' used outside a class.")),
                };
                let method = superclass.and_then(|s| s.find_method(&name));
                match method {
                    Some(m) => {
                        let bound = self.alloc(ObjData::BoundMethod(BoundMethodObject { receiver, method: m }));
                        self.push(Value::Object(bound))?;
                    }
                    None => return Err(self.undefined_name_error(&name, "method")),
                }
            }
            OpCode::GetThis => {
                let receiver = self.frames.last().and_then(|f| f.receiver);
                match receiver {
                    Some(r) => self.push(Value::Object(r))?,
                    None => return Err(self.runtime_error("'this' used outside a method.")),
                }
            }
            OpCode::CheckInstanceType(name_idx) => {
                let name = self.string_constant(name_idx);
                let value = self.peek(0);
                let ok = match &value {
                    Value::Nil => true,
                    Value::Object(o) => match &*o.data() {
                        ObjData::Instance(i) => match &*i.class.data() {
                            ObjData::Class(c) => c.is_or_extends(&name),
                            _ => false,
                        },
                        _ => false,
                    },
                    _ => false,
                };
                if !ok {
                    return Err(self.runtime_error(format!(
                        "Expected an instance of '{}', got {}.",
                        name,
                        value.type_name()
                    )));
                }
            }

            OpCode::BuildArray(count) => {
                let mut elements = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    elements.push(self.pop());
                }
                elements.reverse();
                let arr = self.alloc(ObjData::Array(ArrayObject { elements: RefCell::new(elements) }));
                self.push(Value::Object(arr))?;
            }
            OpCode::BuildDict(count) => {
                let mut pairs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let v = self.pop();
                    let k = self.pop();
                    pairs.push((k, v));
                }
                pairs.reverse();
                let dict = DictObject::new();
                for (k, v) in pairs {
                    dict.insert(k, v).map_err(|e| self.runtime_error(e))?;
                }
                let obj = self.alloc(ObjData::Dict(dict));
                self.push(Value::Object(obj))?;
            }
            OpCode::GetIndex => {
                let key = self.pop();
                let container = self.pop();
                let value = self.index_get(&container, &key)?;
                self.push(value)?;
            }
            OpCode::SetIndex => {
                let value = self.pop();
                let key = self.pop();
                let container = self.pop();
                self.index_set(&container, key, value.clone())?;
                self.push(value)?;
            }
            OpCode::IterInit => {
                let iterable = self.pop();
                let source = match iterable {
                    Value::Object(o) => match &*o.data() {
                        ObjData::Array(_) => IterSource::Array(o),
                        ObjData::Dict(_) => IterSource::Dict(o),
                        ObjData::Set(_) => IterSource::Set(o),
                        _ => return Err(self.runtime_error("Value is not iterable.")),
                    },
                    _ => return Err(self.runtime_error("Value is not iterable.")),
                };
                let iter = self.alloc(ObjData::Iterator(IteratorObject { source, pos: std::cell::Cell::new(0) }));
                self.push(Value::Object(iter))?;
            }
            OpCode::IterHasNext => {
                let has_next = match self.pop() {
                    Value::Object(o) => match &*o.data() {
                        ObjData::Iterator(it) => it.has_next(),
                        _ => return Err(self.runtime_error("Not an iterator.")),
                    },
                    _ => return Err(self.runtime_error("Not an iterator.")),
                };
                self.push(Value::Bool(has_next))?;
            }
            OpCode::IterNext => {
                let next = match self.pop() {
                    Value::Object(o) => match &*o.data() {
                        ObjData::Iterator(it) => it.next(),
                        _ => return Err(self.runtime_error("Not an iterator.")),
                    },
                    _ => return Err(self.runtime_error("Not an iterator.")),
                };
                self.push(next.unwrap_or(Value::Nil))?;
            }

            OpCode::ImportModule(path_idx) => {
                let path = self.string_constant(path_idx);
                let module_ref = self.import_module(&path)?;
                self.push(Value::Object(module_ref))?;
            }
            OpCode::ExportName(name_idx) => {
                let name = self.string_constant(name_idx);
                let value = self.peek(0);
                if let Some(module_ref) = self.current_module() {
                    if let ObjData::Module(m) = &*module_ref.data() {
                        m.exports.borrow_mut().insert(name, value);
                    }
                }
            }

            OpCode::NarrowInt(kind) => {
                let n = self.pop_number("Cannot narrow a non-numeric value.")?;
                self.push(Value::Number(narrow_int(n, kind)))?;
            }
            OpCode::IntToFloat => {
                let n = self.pop_number("Cannot convert a non-numeric value to a float.")?;
                self.push(Value::Number(n))?;
            }
            OpCode::IntToStr => {
                let v = self.pop();
                self.push(Value::str(v.to_string()))?;
            }

            OpCode::PrintOp => {
                let v = self.pop();
                let _ = writeln!(self.out, "{}", v);
            }
        }
        Ok(())
    }

    // ---- arithmetic / comparison ----

    fn pop_number(&mut self, message: &str) -> Result<f64, RuffError> {
        match self.pop() {
            Value::Number(n) => Ok(n),
            _ => Err(self.runtime_error(message)),
        }
    }

    fn binary_add(&mut self) -> Result<(), RuffError> {
        let b = self.pop();
        let a = self.pop();
        match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y)),
            (Value::Str(_), _) | (_, Value::Str(_)) => self.push(Value::str(format!("{}{}", a, b))),
            _ => Err(self.runtime_error("Operands to '+' must be two numbers, or include a string to concatenate.")),
        }
    }

    fn binary_numeric(&mut self, op: fn(f64, f64) -> f64) -> Result<(), RuffError> {
        let b = self.pop_number("Right operand must be a number.")?;
        let a = self.pop_number("Left operand must be a number.")?;
        self.push(Value::Number(op(a, b)))
    }

    fn binary_int(&mut self, signed: bool, op: fn(i64, i64) -> i64) -> Result<(), RuffError> {
        let b = self.pop_number("Right operand must be a number.")?;
        let a = self.pop_number("Left operand must be a number.")?;
        let result = if signed {
            op(a as i64, b as i64) as f64
        } else {
            op(a as u64 as i64, b as u64 as i64) as u64 as f64
        };
        self.push(Value::Number(result))
    }

    fn binary_int_div(&mut self, signed: bool) -> Result<(), RuffError> {
        let b = self.pop_number("Right operand must be a number.")?;
        let a = self.pop_number("Left operand must be a number.")?;
        if signed {
            let bi = b as i64;
            if bi == 0 {
                return Err(self.runtime_error("Division by zero."));
            }
            self.push(Value::Number((a as i64).wrapping_div(bi) as f64))
        } else {
            let bu = b as u64;
            if bu == 0 {
                return Err(self.runtime_error("Division by zero."));
            }
            self.push(Value::Number(((a as u64).wrapping_div(bu)) as f64))
        }
    }

    fn compare(&mut self, op: fn(f64, f64) -> bool) -> Result<(), RuffError> {
        let b = self.pop_number("Right operand must be a number.")?;
        let a = self.pop_number("Left operand must be a number.")?;
        self.push(Value::Bool(op(a, b)))
    }

    /// Shift operands round-trip through `i64` rather than being
    /// constrained to a particular integer width at runtime — width is a
    /// compile-time-checked property (§9 open question (a)).
    fn shift(&mut self, op: fn(i64, i64) -> i64) -> Result<(), RuffError> {
        let b = self.pop_number("Right operand must be a number.")?;
        let a = self.pop_number("Left operand must be a number.")?;
        self.push(Value::Number(op(a as i64, b as i64) as f64))
    }

    // ---- calls ----

    fn call_value(&mut self, argc: usize) -> Result<(), RuffError> {
        let callee_index = self.stack.len() - argc - 1;
        let callee = self.stack[callee_index].clone();
        let receiver_obj = match callee {
            Value::Object(o) => o,
            _ => return Err(self.runtime_error("Can only call functions, methods, and classes.")),
        };
        let action = match &*receiver_obj.data() {
            ObjData::Closure(c) => CallAction::Closure(c.function, None),
            ObjData::BoundMethod(b) => CallAction::Closure(function_of(b.method), Some((b.receiver, b.method))),
            ObjData::NativeFunction(n) if n.name == "Set" => CallAction::SetConstructor,
            ObjData::NativeFunction(n) => CallAction::Native(n.name.clone(), n.arity, n.func),
            ObjData::Class(_) => CallAction::Construct(receiver_obj),
            _ => return Err(self.runtime_error("Can only call functions, methods, and classes.")),
        };

        match action {
            CallAction::Closure(function, bound) => {
                self.check_arity(function, argc)?;
                if self.frames.len() >= FRAME_MAX {
                    return Err(self.runtime_error("Stack overflow."));
                }
                let (closure, receiver) = match bound {
                    Some((receiver, method)) => (method, Some(receiver)),
                    None => (receiver_obj, None),
                };
                self.frames.push(CallFrame { closure, ip: 0, slot_base: callee_index + 1, receiver });
                Ok(())
            }
            CallAction::Native(name, arity, func) => {
                if arity >= 0 && argc != arity as usize {
                    return Err(self.runtime_error(format!("'{}' expects {} argument(s), got {}.", name, arity, argc)));
                }
                let args: Vec<Value> = self.stack[callee_index + 1..].to_vec();
                self.stack.truncate(callee_index);
                match func(&args) {
                    Ok(v) => self.push(v),
                    Err(msg) => Err(self.runtime_error(msg)),
                }
            }
            CallAction::SetConstructor => {
                let args: Vec<Value> = self.stack[callee_index + 1..].to_vec();
                self.stack.truncate(callee_index);
                let set = SetObject { elements: RefCell::new(Vec::with_capacity(args.len())) };
                for a in args {
                    set.insert(a);
                }
                let obj = self.alloc(ObjData::Set(set));
                self.push(Value::Object(obj))
            }
            CallAction::Construct(class_ref) => {
                let instance = self.alloc(ObjData::Instance(InstanceObject {
                    class: class_ref,
                    fields: RefCell::new(HashMap::new()),
                }));
                self.stack[callee_index] = Value::Object(instance);
                match class_ref.find_method("init") {
                    Some(init_closure) => {
                        let function = function_of(init_closure);
                        self.check_arity(function, argc)?;
                        self.frames.push(CallFrame {
                            closure: init_closure,
                            ip: 0,
                            slot_base: callee_index + 1,
                            receiver: Some(instance),
                        });
                        Ok(())
                    }
                    None => {
                        if argc != 0 {
                            return Err(self.runtime_error(format!(
                                "Class '{}' has no 'init' method but was called with {} argument(s).",
                                class_name(class_ref),
                                argc
                            )));
                        }
                        self.stack.truncate(callee_index + 1);
                        Ok(())
                    }
                }
            }
        }
    }

    fn check_arity(&self, function: GcRef, argc: usize) -> Result<(), RuffError> {
        let (declared, name) = match &*function.data() {
            ObjData::Function(f) => (f.params.len(), f.name.clone()),
            _ => unreachable!("call targets always resolve to a Function"),
        };
        if declared != argc {
            return Err(self.runtime_error(format!("'{}' expects {} argument(s), got {}.", name, declared, argc)));
        }
        Ok(())
    }

    // ---- properties / indexing ----

    fn get_property(&mut self, receiver: &Value, name: &str) -> Result<Value, RuffError> {
        match receiver {
            Value::Object(o) => match &*o.data() {
                ObjData::Instance(i) => {
                    if let Some(v) = i.fields.borrow().get(name) {
                        return Ok(v.clone());
                    }
                    match i.class.find_method(name) {
                        Some(m) => {
                            let bound = self.alloc(ObjData::BoundMethod(BoundMethodObject { receiver: *o, method: m }));
                            Ok(Value::Object(bound))
                        }
                        None => Err(self.undefined_name_error(name, "property")),
                    }
                }
                ObjData::Module(m) => match m.exports.borrow().get(name) {
                    Some(v) => Ok(v.clone()),
                    None => Err(self.undefined_name_error(name, "export")),
                },
                _ => Err(self.runtime_error(format!("Cannot access property '{}' on a {}.", name, o.type_name()))),
            },
            _ => Err(self.runtime_error(format!("Cannot access property '{}' on {}.", name, receiver.type_name()))),
        }
    }

    fn index_get(&self, container: &Value, key: &Value) -> Result<Value, RuffError> {
        match container {
            Value::Object(o) => match &*o.data() {
                ObjData::Array(a) => {
                    let idx = self.index_as_usize(key, a.elements.borrow().len())?;
                    Ok(a.elements.borrow()[idx].clone())
                }
                ObjData::Dict(d) => d
                    .get(key)
                    .map_err(|e| self.runtime_error(e))?
                    .ok_or_else(|| self.runtime_error("Key not found in dict.")),
                ObjData::Set(s) => Ok(Value::Bool(s.contains(key))),
                _ => Err(self.runtime_error("Value does not support indexing.")),
            },
            Value::Str(s) => {
                let idx = self.index_as_usize(key, s.chars().count())?;
                let ch = s.chars().nth(idx).expect("bounds already checked");
                Ok(Value::str(ch.to_string()))
            }
            _ => Err(self.runtime_error("Value does not support indexing.")),
        }
    }

    fn index_set(&self, container: &Value, key: Value, value: Value) -> Result<(), RuffError> {
        match container {
            Value::Object(o) => match &*o.data() {
                ObjData::Array(a) => {
                    let idx = self.index_as_usize(&key, a.elements.borrow().len())?;
                    a.elements.borrow_mut()[idx] = value;
                    Ok(())
                }
                ObjData::Dict(d) => d.insert(key, value).map_err(|e| self.runtime_error(e)),
                _ => Err(self.runtime_error("Value does not support index assignment.")),
            },
            _ => Err(self.runtime_error("Value does not support index assignment.")),
        }
    }

    fn index_as_usize(&self, key: &Value, len: usize) -> Result<usize, RuffError> {
        match key {
            Value::Number(n) => {
                let i = *n as i64;
                if i < 0 || i as usize >= len {
                    Err(self.runtime_error(format!("Index {} out of bounds (length {}).", i, len)))
                } else {
                    Ok(i as usize)
                }
            }
            _ => Err(self.runtime_error("Index must be a number.")),
        }
    }
}

enum CallAction {
    Closure(GcRef, Option<(GcRef, GcRef)>),
    Native(String, i32, crate::value::NativeFn),
    SetConstructor,
    Construct(GcRef),
}

fn function_of(closure: GcRef) -> GcRef {
    match &*closure.data() {
        ObjData::Closure(c) => c.function,
        _ => unreachable!("function_of is only called with closures"),
    }
}

fn class_name(class_ref: GcRef) -> String {
    match &*class_ref.data() {
        ObjData::Class(c) => c.name.clone(),
        _ => "?".to_string(),
    }
}

fn narrow_int(n: f64, kind: NarrowKind) -> f64 {
    let i = n as i64;
    match kind {
        NarrowKind::I8 => (i as i8) as f64,
        NarrowKind::I16 => (i as i16) as f64,
        NarrowKind::I32 => (i as i32) as f64,
        NarrowKind::I64 => i as f64,
        NarrowKind::U8 => (i as u8) as f64,
        NarrowKind::U16 => (i as u16) as f64,
        NarrowKind::U32 => (i as u32) as f64,
        NarrowKind::U64 => (i as u64) as f64,
        NarrowKind::USize => (i as usize) as f64,
    }
}

fn native_set_placeholder(_args: &[Value]) -> Result<Value, String> {
    Err("Set() must be invoked through the VM's call protocol.".to_string())
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_capturing(source: &str) -> Result<String, Vec<RuffError>> {
        let buf: std::rc::Rc<RefCell<Vec<u8>>> = std::rc::Rc::new(RefCell::new(Vec::new()));
        struct SharedWriter(std::rc::Rc<RefCell<Vec<u8>>>);
        impl Write for SharedWriter {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let mut vm = VM::with_writer(Box::new(SharedWriter(buf.clone())));
        vm.run_source(source, None)?;
        let bytes = buf.borrow().clone();
        Ok(String::from_utf8(bytes).unwrap())
    }

    #[test]
    fn arithmetic_and_print() {
        let out = run_capturing("print 1 + 2 * 3;").unwrap();
        assert_eq!(out, "7\n");
    }

    #[test]
    fn while_loop_accumulates() {
        let out = run_capturing(
            "i64 i = 0; i64 sum = 0; while (i < 5) { sum = sum + i; i = i + 1; } print sum;",
        )
        .unwrap();
        assert_eq!(out, "10\n");
    }

    #[test]
    fn closures_capture_by_reference() {
        let out = run_capturing(
            "function makeCounter() { i64 count = 0; function inc() { count = count + 1; print count; } return inc; } \
             var c = makeCounter(); c(); c(); c();",
        )
        .unwrap();
        assert_eq!(out, "1\n2\n3\n");
    }

    #[test]
    fn class_inheritance_and_super() {
        let out = run_capturing(
            "class A { speak() { print \"A\"; } } \
             class B < A { speak() { super.speak(); print \"B\"; } } \
             var b = B(); b.speak();",
        )
        .unwrap();
        assert_eq!(out, "A\nB\n");
    }

    #[test]
    fn integer_narrowing_wraps_two_complement() {
        let out = run_capturing("i64 x = 300; print x as i8;").unwrap();
        assert_eq!(out, "44\n");
    }

    #[test]
    fn foreach_over_array_prints_each_element_once() {
        let out = run_capturing("for (var v : [10, 20, 30]) print v;").unwrap();
        assert_eq!(out, "10\n20\n30\n");
    }

    #[test]
    fn string_to_int_assignment_is_a_type_error() {
        let result = run_capturing("i64 x = \"nope\";");
        assert!(result.is_err());
    }

    #[test]
    fn arity_mismatch_is_a_type_error() {
        let result = run_capturing("function add(i64 a, i64 b) -> i64 { return a + b; } add(1);");
        assert!(result.is_err());
    }

    #[test]
    fn void_function_return_value_is_a_type_error() {
        let result = run_capturing("function sayHi() { print \"hi\"; } i64 x = sayHi();");
        assert!(result.is_err());
    }

    #[test]
    fn super_outside_class_is_a_compile_error() {
        let result = run_capturing("function f() { super.thing(); }");
        assert!(result.is_err());
    }

    #[test]
    fn index_compound_assignment_mutates_in_place() {
        let out = run_capturing("var arr = [1, 2, 3]; arr[0] += 10; print arr[0];").unwrap();
        assert_eq!(out, "11\n");
    }
}
