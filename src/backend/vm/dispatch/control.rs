use crate::backend::vm::VirtualMachine;
use crate::backend::vm::error::{ErrorKind, VMError};
use crate::common::value::Value;

impl VirtualMachine {
    pub fn handle_print(&mut self) -> Result<(), VMError> {
        let value = self.stack.pop();
        println!("{}", value);
        Ok(())
    }

    /// 条件留在栈顶，编译器在两条分支上各补一个 POP
    pub fn handle_jumpz(&mut self, offset: u16) -> Result<(), VMError> {
        if !self.stack.peek(0).is_truthy() {
            self.frames.last_mut().unwrap().ip += offset as usize;
        }
        Ok(())
    }

    pub fn handle_jump(&mut self, offset: u16) -> Result<(), VMError> {
        self.frames.last_mut().unwrap().ip += offset as usize;
        Ok(())
    }

    pub fn handle_loop(&mut self, offset: u16) -> Result<(), VMError> {
        self.frames.last_mut().unwrap().ip -= offset as usize;
        Ok(())
    }

    pub fn handle_call(&mut self, argc: u8) -> Result<(), VMError> {
        let argc = argc as usize;
        let callee = self.stack.peek(argc);
        self.call_value(callee, argc)
    }

    /// Wraps the function constant in a closure and captures its upvalues:
    /// enclosing locals through the open-upvalue list, everything further out
    /// by copying from the enclosing closure.
    pub fn handle_closure(&mut self, constant: u8) -> Result<(), VMError> {
        let frame = self.frames.last().unwrap();
        let function = unsafe {
            match (&(*(*frame.closure).data.function).data.chunk.constants)[constant as usize] {
                Value::Function(func) => func,
                other => {
                    return Err(self.error(ErrorKind::InternalError(format!(
                        "corrupted chunk: Closure operand is a {}",
                        other.type_name()
                    ))));
                }
            }
        };
        let upvalue_count = unsafe { (*function).data.upvalue_count };

        self.maybe_collect();
        let closure = self
            .heap
            .alloc_closure(function, Vec::with_capacity(upvalue_count))
            .ok_or_else(|| self.error(ErrorKind::OutOfMemory))?;
        // rooted before the capture loop can allocate upvalues
        self.stack.push(Value::Closure(closure));

        for _ in 0..upvalue_count {
            let is_local = self.read_byte();
            let index = self.read_byte() as usize;

            let upvalue = if is_local == 1 {
                let slot = self.frames.last().unwrap().slots + index;
                self.capture_upvalue(slot)?
            } else {
                let enclosing = self.frames.last().unwrap().closure;
                unsafe { (&(*enclosing).data.upvalues)[index] }
            };

            unsafe {
                (*closure).data.upvalues.push(upvalue);
            }
        }

        Ok(())
    }

    pub fn handle_close_upvalue(&mut self) -> Result<(), VMError> {
        self.close_upvalues(self.stack.len() - 1);
        self.stack.pop();
        Ok(())
    }

    /// Pops the finished frame. Everything the frame owned leaves the stack,
    /// captured locals are closed first, and the return value lands where the
    /// callee used to sit. Returning from the last frame ends the program.
    pub fn handle_return(&mut self) -> Result<(), VMError> {
        let result = self.stack.pop();
        let frame = self.frames.pop().unwrap();
        self.close_upvalues(frame.slots);

        if self.frames.is_empty() {
            // the script closure itself
            self.stack.pop();
            return Ok(());
        }

        self.stack.truncate(frame.slots);
        self.stack.push(result);
        Ok(())
    }
}
