// Mylox VM heap
// Created by: Yuyang Feng <mu_yunaaaa@mail.nwpu.edu.cn>
// Changelog:
// 2026-03-04: Ported the Heap from the Lua VM: intrusive all_objects list, byte
//            accounting with a doubling threshold, and the HARD_MEMORY_LIMIT
//            safeguard in alloc_raw_object.
// 2026-03-07: The string pool is now the open-addressed Table keyed by the interned
//            objects themselves; find_string does the content probe before a
//            canonical object exists. intern() covers source constants,
//            take_string() adopts concatenation buffers without re-copying.
// 2026-03-10: Tri-colour machinery moved in here: mark_object/mark_value feed the
//            gray worklist (a plain Vec on purpose, its growth must never recurse
//            into collection), trace_references blackens until the list drains,
//            sweep frees white objects with type-aware destructors.
// 2026-03-11: compiler_roots added; every in-progress function of the active
//            compiler chain registers here so an allocation burst inside the
//            compiler cannot reclaim the half-built chunks.

use crate::backend::vm::{HARD_MEMORY_LIMIT, VM_THRESHOLD};
use crate::common::object::{
    ClosureData, FunctionData, GCObject, HeaderOnly, NativeData, NativeFn, ObjectKind, StrData,
    UpvalueData, UpvalueState, hash_bytes,
};
use crate::common::table::Table;
use crate::common::value::Value;

pub struct Heap {
    pub all_objects: *mut GCObject<HeaderOnly>,
    /// Intern set: keys are the live strings, values unused. Weak during GC.
    pub strings: Table,
    /// Gray worklist. Plain Vec, never GC-managed.
    gray_stack: Vec<*mut GCObject<HeaderOnly>>,
    /// In-progress functions of the active compiler chain, outermost first.
    pub compiler_roots: Vec<*mut GCObject<FunctionData>>,
    pub total_allocated: usize,
    pub threshold: usize,
    // used for debugging and tuning GC parameters, not used in actual GC logic
    pub max_allocated: usize,
    /// Collect before every growing allocation, regardless of the threshold.
    pub stress: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            all_objects: std::ptr::null_mut(),
            strings: Table::new(),
            gray_stack: Vec::new(),
            compiler_roots: Vec::new(),
            total_allocated: 0,
            threshold: VM_THRESHOLD,
            max_allocated: 0,
            stress: false,
        }
    }

    // ------------------------------------------------------------------
    // allocation
    // ------------------------------------------------------------------

    fn alloc_raw_object<T>(
        &mut self,
        data: T,
        kind: ObjectKind,
        size: usize,
    ) -> Option<*mut GCObject<T>> {
        if self.total_allocated + size > HARD_MEMORY_LIMIT {
            return None;
        }

        let obj = GCObject {
            mark: false,
            kind,
            size,
            next: self.all_objects,
            data,
        };
        let ptr = Box::into_raw(Box::new(obj));
        self.all_objects = GCObject::header(ptr);

        self.total_allocated += size;
        if self.total_allocated > self.max_allocated {
            self.max_allocated = self.total_allocated;
        }

        Some(ptr)
    }

    /// Canonical string for `chars`, copying only on an intern miss.
    pub fn intern(&mut self, chars: &str) -> Option<*mut GCObject<StrData>> {
        let hash = hash_bytes(chars.as_bytes());
        if let Some(ptr) = self.strings.find_string(chars, hash) {
            return Some(ptr);
        }
        self.store_new_string(chars.to_string(), hash)
    }

    /// Adopts an already-built buffer (string concatenation). On an intern hit
    /// the buffer is dropped and the canonical object returned.
    pub fn take_string(&mut self, chars: String) -> Option<*mut GCObject<StrData>> {
        let hash = hash_bytes(chars.as_bytes());
        if let Some(ptr) = self.strings.find_string(&chars, hash) {
            return Some(ptr);
        }
        self.store_new_string(chars, hash)
    }

    fn store_new_string(&mut self, chars: String, hash: u32) -> Option<*mut GCObject<StrData>> {
        let size = std::mem::size_of::<GCObject<StrData>>() + chars.capacity();
        let ptr = self.alloc_raw_object(StrData { chars, hash }, ObjectKind::String, size)?;
        self.strings.set(ptr, Value::Nil);
        Some(ptr)
    }

    pub fn alloc_function(&mut self, data: FunctionData) -> Option<*mut GCObject<FunctionData>> {
        let size = std::mem::size_of::<GCObject<FunctionData>>()
            + data.chunk.code.capacity()
            + data.chunk.lines.capacity() * std::mem::size_of::<usize>()
            + data.chunk.constants.capacity() * std::mem::size_of::<Value>();
        self.alloc_raw_object(data, ObjectKind::Function, size)
    }

    pub fn alloc_closure(
        &mut self,
        function: *mut GCObject<FunctionData>,
        upvalues: Vec<*mut GCObject<UpvalueData>>,
    ) -> Option<*mut GCObject<ClosureData>> {
        let size = std::mem::size_of::<GCObject<ClosureData>>()
            + upvalues.capacity() * std::mem::size_of::<*mut GCObject<UpvalueData>>();
        self.alloc_raw_object(ClosureData { function, upvalues }, ObjectKind::Closure, size)
    }

    pub fn alloc_upvalue(&mut self, state: UpvalueState) -> Option<*mut GCObject<UpvalueData>> {
        let size = std::mem::size_of::<GCObject<UpvalueData>>();
        self.alloc_raw_object(
            UpvalueData {
                state,
                next: std::ptr::null_mut(),
            },
            ObjectKind::Upvalue,
            size,
        )
    }

    pub fn alloc_native(&mut self, function: NativeFn) -> Option<*mut GCObject<NativeData>> {
        let size = std::mem::size_of::<GCObject<NativeData>>();
        self.alloc_raw_object(NativeData { function }, ObjectKind::Native, size)
    }

    // ------------------------------------------------------------------
    // collection triggers
    // ------------------------------------------------------------------

    pub fn should_collect(&self) -> bool {
        self.stress || self.total_allocated > self.threshold
    }

    pub fn expand_threshold(&mut self) {
        self.threshold *= 2;
    }

    // ------------------------------------------------------------------
    // tri-colour mark
    // ------------------------------------------------------------------

    /// Idempotent: only the first white->gray transition pushes to the worklist.
    pub fn mark_object(&mut self, ptr: *mut GCObject<HeaderOnly>) {
        if ptr.is_null() {
            return;
        }
        unsafe {
            if (*ptr).mark {
                return;
            }
            (*ptr).mark = true;
        }
        self.gray_stack.push(ptr);
    }

    pub fn mark_value(&mut self, value: &Value) {
        match value {
            Value::String(ptr) => self.mark_object(GCObject::header(*ptr)),
            Value::Function(ptr) => self.mark_object(GCObject::header(*ptr)),
            Value::Closure(ptr) => self.mark_object(GCObject::header(*ptr)),
            Value::Native(ptr) => self.mark_object(GCObject::header(*ptr)),
            _ => {}
        }
    }

    pub fn mark_compiler_roots(&mut self) {
        for i in 0..self.compiler_roots.len() {
            let func = self.compiler_roots[i];
            self.mark_object(GCObject::header(func));
        }
    }

    /// Drains the gray worklist, blackening each object by marking what it
    /// references. Open upvalues deliberately mark nothing: the slot they point
    /// at is still on the operand stack, which is a root of its own.
    pub fn trace_references(&mut self) {
        while let Some(obj) = self.gray_stack.pop() {
            unsafe {
                match (*obj).kind {
                    ObjectKind::String | ObjectKind::Native => {}
                    ObjectKind::Upvalue => {
                        let upval = obj as *mut GCObject<UpvalueData>;
                        if let UpvalueState::Closed(value) = (*upval).data.state {
                            self.mark_value(&value);
                        }
                    }
                    ObjectKind::Function => {
                        let func = obj as *mut GCObject<FunctionData>;
                        let name = (*func).data.name;
                        if !name.is_null() {
                            self.mark_object(GCObject::header(name));
                        }
                        for i in 0..(*func).data.chunk.constants.len() {
                            let constant = (&(*func).data.chunk.constants)[i];
                            self.mark_value(&constant);
                        }
                    }
                    ObjectKind::Closure => {
                        let closure = obj as *mut GCObject<ClosureData>;
                        self.mark_object(GCObject::header((*closure).data.function));
                        for i in 0..(*closure).data.upvalues.len() {
                            let upval = (&(*closure).data.upvalues)[i];
                            self.mark_object(GCObject::header(upval));
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // sweep
    // ------------------------------------------------------------------

    /// Frees every unmarked object and clears the mark on survivors.
    /// Returns (objects, bytes) reclaimed for the debug log.
    pub fn sweep(&mut self) -> (usize, usize) {
        let mut swept_count = 0;
        let mut swept_bytes = 0;

        unsafe {
            let mut p_prev: *mut GCObject<HeaderOnly> = std::ptr::null_mut();
            let mut p_curr = self.all_objects;

            while !p_curr.is_null() {
                if (*p_curr).mark {
                    (*p_curr).mark = false;
                    p_prev = p_curr;
                    p_curr = (*p_curr).next;
                } else {
                    let p_next = (*p_curr).next;
                    if p_prev.is_null() {
                        self.all_objects = p_next;
                    } else {
                        (*p_prev).next = p_next;
                    }

                    swept_count += 1;
                    swept_bytes += (*p_curr).size;
                    self.total_allocated = self.total_allocated.saturating_sub((*p_curr).size);
                    Self::free_object(p_curr);

                    p_curr = p_next;
                }
            }
        }

        (swept_count, swept_bytes)
    }

    /// Reconstructs the Box at the object's concrete type so the payload's own
    /// destructor runs (a function drops its chunk, a closure its upvalue vec).
    unsafe fn free_object(obj: *mut GCObject<HeaderOnly>) {
        unsafe {
            match (*obj).kind {
                ObjectKind::String => {
                    let _ = Box::from_raw(obj as *mut GCObject<StrData>);
                }
                ObjectKind::Function => {
                    let _ = Box::from_raw(obj as *mut GCObject<FunctionData>);
                }
                ObjectKind::Closure => {
                    let _ = Box::from_raw(obj as *mut GCObject<ClosureData>);
                }
                ObjectKind::Upvalue => {
                    let _ = Box::from_raw(obj as *mut GCObject<UpvalueData>);
                }
                ObjectKind::Native => {
                    let _ = Box::from_raw(obj as *mut GCObject<NativeData>);
                }
            }
        }
    }

    /// VM teardown: frees everything still on the object list.
    pub fn free_all_objects(&mut self) {
        unsafe {
            let mut obj = self.all_objects;
            while !obj.is_null() {
                let next = (*obj).next;
                Self::free_object(obj);
                obj = next;
            }
        }
        self.all_objects = std::ptr::null_mut();
        self.total_allocated = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::Heap;
    use crate::common::object::{FunctionData, GCObject};

    #[test]
    fn intern_deduplicates_by_content() {
        let mut heap = Heap::new();
        let a = heap.intern("hello").unwrap();
        let b = heap.intern("hello").unwrap();
        let c = heap.intern("world").unwrap();
        assert!(std::ptr::eq(a, b));
        assert!(!std::ptr::eq(a, c));
        heap.free_all_objects();
    }

    #[test]
    fn take_string_returns_canonical_object() {
        let mut heap = Heap::new();
        let a = heap.intern("foobar").unwrap();
        let b = heap.take_string(String::from("foo") + "bar").unwrap();
        assert!(std::ptr::eq(a, b));
        heap.free_all_objects();
    }

    #[test]
    fn sweep_frees_unmarked_and_unmarks_survivors() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep").unwrap();
        let _drop = heap.intern("drop").unwrap();

        heap.mark_object(GCObject::header(keep));
        heap.trace_references();
        heap.strings.remove_white();
        let (count, bytes) = heap.sweep();

        assert_eq!(count, 1);
        assert!(bytes > 0);
        assert!(!unsafe { (*keep).mark });
        // the survivor is still interned
        let again = heap.intern("keep").unwrap();
        assert!(std::ptr::eq(again, keep));
        heap.free_all_objects();
    }

    #[test]
    fn repeated_collection_without_mutation_is_stable() {
        let mut heap = Heap::new();
        let s = heap.intern("stable").unwrap();
        let func = heap.alloc_function(FunctionData::new()).unwrap();

        for _ in 0..3 {
            heap.mark_object(GCObject::header(s));
            heap.mark_object(GCObject::header(func));
            heap.trace_references();
            heap.strings.remove_white();
            let (count, _) = heap.sweep();
            assert_eq!(count, 0);
        }
        heap.free_all_objects();
    }
}
