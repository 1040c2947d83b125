// File: src/gc.rs
//
// Tracing mark-and-sweep collector. Objects live in a flat, intrusively
// linked allocation list (`GcHeader::next`); `collect` marks everything
// reachable from the roots the caller supplies, then sweeps the rest.
// Grounded on the original implementation's `GC`/`GcObject` split (a
// single `mark`/`sweep` pair driven by the VM, not a per-object
// destructor chain): see examples/original_source/src/GC.cpp.

use std::cell::Cell;

use crate::value::{GcRef, Obj, ObjData, Value};

pub const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

pub struct Gc {
    head: Option<GcRef>,
    bytes_allocated: usize,
    gray_stack: Vec<GcRef>,
}

impl Gc {
    pub fn new() -> Self {
        Gc { head: None, bytes_allocated: 0, gray_stack: Vec::new() }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn alloc(&mut self, data: ObjData) -> GcRef {
        let size = std::mem::size_of::<Obj>();
        let boxed = Box::new(Obj {
            header: crate::value::GcHeader {
                marked: Cell::new(false),
                next: Cell::new(self.head),
                size,
            },
            data: std::cell::RefCell::new(data),
        });
        let ptr = std::ptr::NonNull::new(Box::into_raw(boxed)).expect("Box pointer is never null");
        let gc_ref = GcRef(ptr);
        self.head = Some(gc_ref);
        self.bytes_allocated += size;
        gc_ref
    }

    pub fn mark_value(&mut self, value: &Value) {
        if let Value::Object(obj) = value {
            self.mark_object(*obj);
        }
    }

    pub fn mark_object(&mut self, obj: GcRef) {
        if obj.marked() {
            return;
        }
        obj.set_marked(true);
        self.gray_stack.push(obj);
    }

    /// Propagates marks through the graph via each object's outgoing
    /// references (the `trace` step in §3.5/§9).
    pub fn drain_gray_stack(&mut self) {
        while let Some(obj) = self.gray_stack.pop() {
            self.trace(obj);
        }
    }

    fn trace(&mut self, obj: GcRef) {
        // Collect references first (can't hold `data()` borrow across
        // mutable `self.mark_*` calls, since marking an object that's
        // already borrowed elsewhere would panic on re-entrant borrow).
        let mut objects: Vec<GcRef> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        match &*obj.data() {
            ObjData::Function(f) => {
                values.extend(f.chunk.constants.iter().cloned());
            }
            ObjData::Closure(c) => {
                objects.push(c.function);
                objects.extend(c.upvalues.iter().cloned());
            }
            ObjData::Upvalue(u) => {
                if let crate::value::UpvalueState::Closed(v) = &*u.state.borrow() {
                    values.push(v.clone());
                }
            }
            ObjData::Class(c) => {
                if let Some(sup) = c.superclass {
                    objects.push(sup);
                }
                objects.extend(c.methods.borrow().values().cloned());
            }
            ObjData::Instance(i) => {
                objects.push(i.class);
                values.extend(i.fields.borrow().values().cloned());
            }
            ObjData::BoundMethod(b) => {
                objects.push(b.receiver);
                objects.push(b.method);
            }
            ObjData::NativeFunction(_) => {}
            ObjData::NativeBoundMethod(n) => {
                objects.push(n.receiver);
            }
            ObjData::Array(a) => {
                values.extend(a.elements.borrow().iter().cloned());
            }
            ObjData::Dict(d) => {
                for (k, v) in d.entries.borrow().iter() {
                    values.push(k.clone());
                    values.push(v.clone());
                }
            }
            ObjData::Set(s) => {
                values.extend(s.elements.borrow().iter().cloned());
            }
            ObjData::Iterator(it) => match it.source {
                crate::value::IterSource::Array(o)
                | crate::value::IterSource::Dict(o)
                | crate::value::IterSource::Set(o) => objects.push(o),
            },
            ObjData::Module(m) => {
                values.extend(m.exports.borrow().values().cloned());
            }
        }

        for o in objects {
            self.mark_object(o);
        }
        for v in values {
            self.mark_value(&v);
        }
    }

    /// Frees every unmarked object, clears marks on survivors.
    pub fn sweep(&mut self) {
        let mut current = self.head;
        let mut previous: Option<GcRef> = None;

        while let Some(obj) = current {
            let next = obj.obj().header.next.get();
            if obj.marked() {
                obj.set_marked(false);
                previous = Some(obj);
                current = next;
            } else {
                match previous {
                    Some(p) => p.obj().header.next.set(next),
                    None => self.head = next,
                }
                let size = obj.obj().header.size;
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
                unsafe {
                    drop(Box::from_raw(obj.0.as_ptr()));
                }
                current = next;
            }
        }
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        let mut current = self.head;
        while let Some(obj) = current {
            let next = obj.obj().header.next.get();
            unsafe {
                drop(Box::from_raw(obj.0.as_ptr()));
            }
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ArrayObject, ObjData};

    #[test]
    fn unreachable_object_is_swept() {
        let mut gc = Gc::new();
        let obj = gc.alloc(ObjData::Array(ArrayObject { elements: std::cell::RefCell::new(vec![]) }));
        assert!(gc.bytes_allocated() > 0);
        drop(obj);
        gc.sweep();
        assert_eq!(gc.bytes_allocated(), 0);
    }

    #[test]
    fn marked_object_survives_sweep() {
        let mut gc = Gc::new();
        let obj = gc.alloc(ObjData::Array(ArrayObject { elements: std::cell::RefCell::new(vec![]) }));
        gc.mark_object(obj);
        gc.drain_gray_stack();
        gc.sweep();
        assert!(gc.bytes_allocated() > 0);
        assert!(!obj.marked(), "surviving objects have their mark cleared for the next cycle");
    }

    #[test]
    fn tracing_follows_array_elements_into_nested_heap_values() {
        let mut gc = Gc::new();
        let inner = gc.alloc(ObjData::Array(ArrayObject { elements: std::cell::RefCell::new(vec![]) }));
        let outer = gc.alloc(ObjData::Array(ArrayObject {
            elements: std::cell::RefCell::new(vec![Value::Object(inner)]),
        }));
        gc.mark_object(outer);
        gc.drain_gray_stack();
        gc.sweep();
        assert!(gc.bytes_allocated() > 0, "both outer and inner array survive");
    }
}
