use crate::backend::vm::VirtualMachine;
use crate::backend::vm::error::{ErrorKind, VMError};
use crate::common::object::{GCObject, StrData, UpvalueState};
use crate::common::value::Value;

impl VirtualMachine {
    /// CONSTANT / NIL / TRUE / FALSE all reduce to a push.
    pub fn handle_push_value(&mut self, value: Value) -> Result<(), VMError> {
        self.stack.push(value);
        Ok(())
    }

    pub fn handle_pop(&mut self) -> Result<(), VMError> {
        self.stack.pop();
        Ok(())
    }

    pub fn handle_get_local(&mut self, slot: u8) -> Result<(), VMError> {
        let base = self.frames.last().unwrap().slots;
        let value = self.stack.values[base + slot as usize];
        self.stack.push(value);
        Ok(())
    }

    /// 赋值是表达式，值留在栈顶不弹
    pub fn handle_set_local(&mut self, slot: u8) -> Result<(), VMError> {
        let base = self.frames.last().unwrap().slots;
        let value = self.stack.peek(0);
        self.stack.values[base + slot as usize] = value;
        Ok(())
    }

    pub fn handle_get_global(
        &mut self,
        name: *mut GCObject<StrData>,
    ) -> Result<(), VMError> {
        match self.globals.get(name) {
            Some(value) => {
                self.stack.push(value);
                Ok(())
            }
            None => {
                let text = unsafe { (*name).data.chars.clone() };
                Err(self.error(ErrorKind::UndefinedVariable(text)))
            }
        }
    }

    pub fn handle_define_global(
        &mut self,
        name: *mut GCObject<StrData>,
    ) -> Result<(), VMError> {
        let value = self.stack.peek(0);
        self.globals.set(name, value);
        self.stack.pop();
        Ok(())
    }

    /// Assignment to a global that was never defined is an error; the probe
    /// that just inserted it is rolled back before reporting.
    pub fn handle_set_global(
        &mut self,
        name: *mut GCObject<StrData>,
    ) -> Result<(), VMError> {
        let value = self.stack.peek(0);
        if self.globals.set(name, value) {
            self.globals.delete(name);
            let text = unsafe { (*name).data.chars.clone() };
            return Err(self.error(ErrorKind::UndefinedVariable(text)));
        }
        Ok(())
    }

    pub fn handle_get_upvalue(&mut self, index: u8) -> Result<(), VMError> {
        let closure = self.frames.last().unwrap().closure;
        let upvalue = unsafe { (&(*closure).data.upvalues)[index as usize] };
        let value = match unsafe { (*upvalue).data.state } {
            UpvalueState::Open(slot) => self.stack.values[slot],
            UpvalueState::Closed(value) => value,
        };
        self.stack.push(value);
        Ok(())
    }

    pub fn handle_set_upvalue(&mut self, index: u8) -> Result<(), VMError> {
        let value = self.stack.peek(0);
        let closure = self.frames.last().unwrap().closure;
        let upvalue = unsafe { (&(*closure).data.upvalues)[index as usize] };
        unsafe {
            match (*upvalue).data.state {
                UpvalueState::Open(slot) => self.stack.values[slot] = value,
                UpvalueState::Closed(_) => (*upvalue).data.state = UpvalueState::Closed(value),
            }
        }
        Ok(())
    }
}
