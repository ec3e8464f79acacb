mod access;
mod arithmetic;
mod compare;
mod control;

use crate::backend::vm::VirtualMachine;
use crate::backend::vm::error::VMError;
use crate::common::opcode::OpCode;
use crate::common::value::Value;

impl VirtualMachine {
    /// One decoded instruction. Inline operands are pulled here so every
    /// handler receives plain values.
    pub fn execute_instruction(&mut self, op: OpCode) -> Result<(), VMError> {
        match op {
            OpCode::Constant => {
                let constant = self.read_constant();
                self.handle_push_value(constant)
            }
            OpCode::Nil => self.handle_push_value(Value::Nil),
            OpCode::True => self.handle_push_value(Value::Boolean(true)),
            OpCode::False => self.handle_push_value(Value::Boolean(false)),
            OpCode::Pop => self.handle_pop(),

            OpCode::GetLocal => {
                let slot = self.read_byte();
                self.handle_get_local(slot)
            }
            OpCode::SetLocal => {
                let slot = self.read_byte();
                self.handle_set_local(slot)
            }
            OpCode::GetGlobal => {
                let name = self.read_name_constant()?;
                self.handle_get_global(name)
            }
            OpCode::DefineGlobal => {
                let name = self.read_name_constant()?;
                self.handle_define_global(name)
            }
            OpCode::SetGlobal => {
                let name = self.read_name_constant()?;
                self.handle_set_global(name)
            }
            OpCode::GetUpValue => {
                let index = self.read_byte();
                self.handle_get_upvalue(index)
            }
            OpCode::SetUpValue => {
                let index = self.read_byte();
                self.handle_set_upvalue(index)
            }
            OpCode::CloseUpValue => self.handle_close_upvalue(),

            OpCode::Equal => self.handle_equal(),
            OpCode::Greater => self.handle_greater(),
            OpCode::Less => self.handle_less(),

            OpCode::Add => self.handle_add(),
            OpCode::Sub => self.handle_sub(),
            OpCode::Mult => self.handle_mult(),
            OpCode::Div => self.handle_div(),
            OpCode::Not => self.handle_not(),
            OpCode::Negate => self.handle_negate(),

            OpCode::Print => self.handle_print(),

            OpCode::JumpZ => {
                let offset = self.read_u16();
                self.handle_jumpz(offset)
            }
            OpCode::Jump => {
                let offset = self.read_u16();
                self.handle_jump(offset)
            }
            OpCode::Loop => {
                let offset = self.read_u16();
                self.handle_loop(offset)
            }

            OpCode::Call => {
                let argc = self.read_byte();
                self.handle_call(argc)
            }
            OpCode::Closure => {
                let constant = self.read_byte();
                self.handle_closure(constant)
            }
            OpCode::Return => self.handle_return(),
        }
    }
}
