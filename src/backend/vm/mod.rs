// Mylox virtual machine
// Created by: Yuyang Feng <mu_yunaaaa@mail.nwpu.edu.cn>
// Changelog:
// 2026-03-04: Rebuilt the execution core for the stack ISA: call frames index into
//            one shared operand stack (slot 0 = callee, then arguments), the
//            dispatch loop pulls raw bytes and decodes them with num_enum.
// 2026-03-06: Globals moved to the open-addressed table keyed by interned name;
//            interpret() drives compile -> wrap in closure -> run.
// 2026-03-08: Closures and upvalues: the VM keeps the open-upvalue list sorted by
//            stack slot descending; Return and CloseUpValue close everything at or
//            above the dying slots.
// 2026-03-10: Collection wired to the allocation sites and the loop boundary;
//            roots are the operand stack, the frame closures, the open upvalues,
//            both sides of every globals entry, and the compiler chain.
// 2026-03-12: Runtime errors now carry the frame-by-frame traceback and reset the
//            operand stack, matching the single "interpret returns a status"
//            surface the embedder sees.

pub mod dispatch;
pub mod error;
pub mod heap;
pub mod stack;
mod std_lib;

use clap::ValueEnum;

use crate::backend::vm::error::{ErrorKind, TraceFrame, VMError};
use crate::backend::vm::heap::Heap;
use crate::backend::vm::stack::{CallFrame, ValueStack};
use crate::backend::vm::std_lib::native_clock;
use crate::common::object::{
    ClosureData, GCObject, NativeFn, StrData, UpvalueData, UpvalueState,
};
use crate::common::opcode::OpCode;
use crate::common::table::Table;
use crate::common::value::Value;
use crate::frontend::compiler::compile;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Release, // 仅输出程序结果
    Debug,   // 输出编译与 GC 的基本信息
    Trace,   // 输出反汇编和逐指令执行轨迹
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

pub const MAX_FRAMES: usize = 64;
pub const HARD_MEMORY_LIMIT: usize = 1024 * 1024 * 512; //512MB
pub const VM_THRESHOLD: usize = 1024 * 1024; //1MB

pub struct VirtualMachine {
    pub frames: Vec<CallFrame>,
    pub stack: ValueStack,
    pub globals: Table,
    pub heap: Heap,
    /// Head of the open-upvalue list, sorted by stack slot descending.
    pub open_upvalues: *mut GCObject<UpvalueData>,
    pub log_level: LogLevel,
}

impl VirtualMachine {
    pub fn new() -> Self {
        let mut vm = Self {
            frames: Vec::new(),
            stack: ValueStack::default(),
            globals: Table::new(),
            heap: Heap::new(),
            open_upvalues: std::ptr::null_mut(),
            log_level: LogLevel::Release,
        };
        vm.load_standard_library();
        vm
    }

    pub fn load_standard_library(&mut self) {
        self.define_native("clock", native_clock);
    }

    /// Both halves of the binding are kept on the operand stack across the
    /// allocations, so a collection between them cannot reclaim either.
    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_ptr = self
            .heap
            .intern(name)
            .expect("VM bootstrap: heap exhausted interning native name");
        self.stack.push(Value::String(name_ptr));
        let native = self
            .heap
            .alloc_native(function)
            .expect("VM bootstrap: heap exhausted allocating native");
        self.stack.push(Value::Native(native));

        self.globals.set(name_ptr, Value::Native(native));

        self.stack.pop();
        self.stack.pop();
    }

    // ------------------------------------------------------------------
    // entry point
    // ------------------------------------------------------------------

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let Some(function) = compile(self, source) else {
            return InterpretResult::CompileError;
        };

        // root the fresh function while its closure is allocated
        self.stack.push(Value::Function(function));
        self.maybe_collect();
        let Some(closure) = self.heap.alloc_closure(function, Vec::new()) else {
            self.report_error(&self.error(ErrorKind::OutOfMemory));
            self.reset_runtime_state();
            return InterpretResult::RuntimeError;
        };
        self.stack.pop();
        self.stack.push(Value::Closure(closure));

        if let Err(err) = self.call_closure(closure, 0) {
            self.report_error(&err);
            self.reset_runtime_state();
            return InterpretResult::RuntimeError;
        }

        if matches!(self.log_level, LogLevel::Debug | LogLevel::Trace) {
            println!("[DEBUG] Starting execution engine...");
        }

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(err) => {
                self.report_error(&err);
                self.reset_runtime_state();
                InterpretResult::RuntimeError
            }
        }
    }

    fn run(&mut self) -> Result<(), VMError> {
        while !self.frames.is_empty() {
            if self.log_level == LogLevel::Trace {
                self.trace_instruction();
            }

            let byte = self.read_byte();
            let op = OpCode::try_from(byte).map_err(|_| {
                self.error(ErrorKind::InternalError(format!(
                    "corrupted chunk: byte {:#04x} is not an opcode",
                    byte
                )))
            })?;

            self.execute_instruction(op)?;

            // loop-boundary check backs up the per-allocation triggers
            if self.heap.should_collect() {
                self.maybe_collect();
            }
        }
        Ok(())
    }

    fn reset_runtime_state(&mut self) {
        self.frames.clear();
        self.stack.clear();
        self.open_upvalues = std::ptr::null_mut();
    }

    // ------------------------------------------------------------------
    // frame and chunk access
    // ------------------------------------------------------------------

    pub fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = unsafe {
            (&(*(*frame.closure).data.function).data.chunk.code)[frame.ip]
        };
        frame.ip += 1;
        byte
    }

    pub fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    pub fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().unwrap();
        unsafe { (&(*(*frame.closure).data.function).data.chunk.constants)[index] }
    }

    /// The interned name a GetGlobal/DefineGlobal/SetGlobal operand refers to.
    pub fn read_name_constant(&mut self) -> Result<*mut GCObject<StrData>, VMError> {
        match self.read_constant() {
            Value::String(ptr) => Ok(ptr),
            other => Err(self.error(ErrorKind::InternalError(format!(
                "corrupted chunk: name constant is a {}",
                other.type_name()
            )))),
        }
    }

    fn current_line(&self) -> usize {
        match self.frames.last() {
            Some(frame) => unsafe {
                (*(*frame.closure).data.function)
                    .data
                    .chunk
                    .line_of(frame.ip.saturating_sub(1))
            },
            None => 0,
        }
    }

    // ------------------------------------------------------------------
    // calls
    // ------------------------------------------------------------------

    pub fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), VMError> {
        match callee {
            Value::Closure(closure) => self.call_closure(closure, argc),

            Value::Native(native) => {
                let function = unsafe { (*native).data.function };
                let args_start = self.stack.len() - argc;
                let result = function(argc, &self.stack.values[args_start..]);
                // drop the arguments and the callee, keep the result
                self.stack.truncate(args_start - 1);
                self.stack.push(result);
                Ok(())
            }

            _ => Err(self.error(ErrorKind::InvalidCall(
                "Can only call functions and classes.".to_string(),
            ))),
        }
    }

    pub fn call_closure(
        &mut self,
        closure: *mut GCObject<ClosureData>,
        argc: usize,
    ) -> Result<(), VMError> {
        let arity = unsafe { (*(*closure).data.function).data.arity };
        if argc != arity {
            return Err(self.error(ErrorKind::InvalidCall(format!(
                "Expected {} arguments but got {}.",
                arity, argc
            ))));
        }
        if self.frames.len() == MAX_FRAMES {
            return Err(self.error(ErrorKind::StackOverflow));
        }

        let slots = self.stack.len() - argc - 1;
        self.frames.push(CallFrame::new(closure, slots));
        Ok(())
    }

    // ------------------------------------------------------------------
    // upvalues
    // ------------------------------------------------------------------

    /// Reuses the open upvalue for `slot` if one exists, otherwise splices a
    /// new one into the descending-sorted list. No two open upvalues ever
    /// refer to the same slot.
    pub fn capture_upvalue(
        &mut self,
        slot: usize,
    ) -> Result<*mut GCObject<UpvalueData>, VMError> {
        let mut prev: *mut GCObject<UpvalueData> = std::ptr::null_mut();
        let mut curr = self.open_upvalues;
        unsafe {
            while !curr.is_null() {
                match (*curr).data.state {
                    UpvalueState::Open(s) if s > slot => {
                        prev = curr;
                        curr = (*curr).data.next;
                    }
                    _ => break,
                }
            }
            if !curr.is_null() {
                if let UpvalueState::Open(s) = (*curr).data.state {
                    if s == slot {
                        return Ok(curr);
                    }
                }
            }
        }

        // list entries survive a collection here: the open list is a root
        self.maybe_collect();
        let created = self
            .heap
            .alloc_upvalue(UpvalueState::Open(slot))
            .ok_or_else(|| self.error(ErrorKind::OutOfMemory))?;
        unsafe {
            (*created).data.next = curr;
            if prev.is_null() {
                self.open_upvalues = created;
            } else {
                (*prev).data.next = created;
            }
        }
        Ok(created)
    }

    /// Closes every open upvalue whose slot is at or above `from_slot`: the
    /// stack value moves into the upvalue, which leaves the open list.
    pub fn close_upvalues(&mut self, from_slot: usize) {
        unsafe {
            while !self.open_upvalues.is_null() {
                let upval = self.open_upvalues;
                let Some(slot) = (*upval).data.open_slot() else {
                    break;
                };
                if slot < from_slot {
                    break;
                }
                (*upval).data.state = UpvalueState::Closed(self.stack.values[slot]);
                self.open_upvalues = (*upval).data.next;
                (*upval).data.next = std::ptr::null_mut();
            }
        }
    }

    // ------------------------------------------------------------------
    // garbage collection
    // ------------------------------------------------------------------

    /// Call before any allocation that grows the heap. Under --gc-stress this
    /// collects every time; otherwise only past the byte threshold.
    pub fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        if self.heap.total_allocated > self.heap.threshold {
            self.heap.expand_threshold();
        }
        self.collect_garbage();
    }

    pub fn collect_garbage(&mut self) {
        let debug = matches!(self.log_level, LogLevel::Debug | LogLevel::Trace);
        if debug {
            println!(
                "[DEBUG] -- gc begin ({} bytes in use)",
                self.heap.total_allocated
            );
        }

        self.mark_roots();
        self.heap.trace_references();
        // the intern set holds its keys weakly
        self.heap.strings.remove_white();
        let (swept_count, swept_bytes) = self.heap.sweep();

        if debug {
            println!(
                "[DEBUG] -- gc end: reclaimed {} objects, {} bytes released. Current heap: {} bytes.",
                swept_count, swept_bytes, self.heap.total_allocated
            );
        }
    }

    fn mark_roots(&mut self) {
        for value in &self.stack.values {
            self.heap.mark_value(value);
        }

        for frame in &self.frames {
            self.heap.mark_object(GCObject::header(frame.closure));
        }

        let mut upval = self.open_upvalues;
        while !upval.is_null() {
            self.heap.mark_object(GCObject::header(upval));
            upval = unsafe { (*upval).data.next };
        }

        for (key, value) in self.globals.iter() {
            self.heap.mark_object(GCObject::header(key));
            self.heap.mark_value(value);
        }

        self.heap.mark_compiler_roots();
    }

    // ------------------------------------------------------------------
    // diagnostics
    // ------------------------------------------------------------------

    /// Captures the traceback at the moment the error is raised, innermost
    /// frame first.
    pub fn error(&self, kind: ErrorKind) -> VMError {
        let stack_trace = self
            .frames
            .iter()
            .rev()
            .map(|frame| unsafe {
                let function = (*frame.closure).data.function;
                let line = (*function).data.chunk.line_of(frame.ip.saturating_sub(1));
                let name_ptr = (*function).data.name;
                let name = if name_ptr.is_null() {
                    None
                } else {
                    Some((*name_ptr).data.chars.clone())
                };
                TraceFrame { line, name }
            })
            .collect();

        VMError {
            kind,
            line: self.current_line(),
            stack_trace,
        }
    }

    fn report_error(&self, err: &VMError) {
        eprint!("{}", err);
    }

    fn trace_instruction(&self) {
        print!("          ");
        for value in &self.stack.values {
            print!("[ {} ]", value);
        }
        println!();
        if let Some(frame) = self.frames.last() {
            unsafe {
                (*(*frame.closure).data.function)
                    .data
                    .chunk
                    .disassemble_instruction(frame.ip);
            }
        }
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        if matches!(self.log_level, LogLevel::Debug | LogLevel::Trace) {
            println!(
                "[DEBUG] Max memory allocated during execution: {} bytes",
                self.heap.max_allocated
            );
        }
        self.heap.free_all_objects();
    }
}
