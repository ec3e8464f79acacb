use crate::backend::vm::VirtualMachine;
use crate::backend::vm::error::{ErrorKind, VMError};
use crate::common::value::Value;

impl VirtualMachine {
    /// ADD is the overloaded one: two numbers add, two strings concatenate
    /// through the intern set, anything else is a type error.
    pub fn handle_add(&mut self) -> Result<(), VMError> {
        let b = self.stack.peek(0);
        let a = self.stack.peek(1);

        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.stack.pop();
                self.stack.pop();
                self.stack.push(Value::Number(x + y));
                Ok(())
            }
            (Value::String(x), Value::String(y)) => {
                // 两个操作数留在栈上，穿过分配点之前都是 GC 根
                let combined = unsafe {
                    let left = &(*x).data.chars;
                    let right = &(*y).data.chars;
                    let mut buffer = String::with_capacity(left.len() + right.len());
                    buffer.push_str(left);
                    buffer.push_str(right);
                    buffer
                };

                self.maybe_collect();
                let result = self
                    .heap
                    .take_string(combined)
                    .ok_or_else(|| self.error(ErrorKind::OutOfMemory))?;

                self.stack.pop();
                self.stack.pop();
                self.stack.push(Value::String(result));
                Ok(())
            }
            _ => Err(self.error(ErrorKind::TypeError(
                "Operands must be two numbers or two strings.".to_string(),
            ))),
        }
    }

    pub fn handle_sub(&mut self) -> Result<(), VMError> {
        self.handle_binary_numeric(|x, y| x - y)
    }

    pub fn handle_mult(&mut self) -> Result<(), VMError> {
        self.handle_binary_numeric(|x, y| x * y)
    }

    /// Division by zero follows IEEE: the result is an infinity, not an error.
    pub fn handle_div(&mut self) -> Result<(), VMError> {
        self.handle_binary_numeric(|x, y| x / y)
    }

    pub fn handle_not(&mut self) -> Result<(), VMError> {
        let value = self.stack.pop();
        self.stack.push(Value::Boolean(!value.is_truthy()));
        Ok(())
    }

    pub fn handle_negate(&mut self) -> Result<(), VMError> {
        match self.stack.peek(0) {
            Value::Number(n) => {
                self.stack.pop();
                self.stack.push(Value::Number(-n));
                Ok(())
            }
            _ => Err(self.error(ErrorKind::TypeError(
                "Operand must be a number.".to_string(),
            ))),
        }
    }

    fn handle_binary_numeric<F>(&mut self, op_fn: F) -> Result<(), VMError>
    where
        F: Fn(f64, f64) -> f64,
    {
        match (self.stack.peek(1), self.stack.peek(0)) {
            (Value::Number(x), Value::Number(y)) => {
                self.stack.pop();
                self.stack.pop();
                self.stack.push(Value::Number(op_fn(x, y)));
                Ok(())
            }
            _ => Err(self.error(ErrorKind::TypeError(
                "Operands must be numbers.".to_string(),
            ))),
        }
    }
}
