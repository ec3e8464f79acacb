use crate::backend::vm::VirtualMachine;
use crate::backend::vm::error::{ErrorKind, VMError};
use crate::common::value::Value;

impl VirtualMachine {
    pub fn handle_equal(&mut self) -> Result<(), VMError> {
        let b = self.stack.pop();
        let a = self.stack.pop();
        self.stack.push(Value::Boolean(a.equals(&b)));
        Ok(())
    }

    pub fn handle_greater(&mut self) -> Result<(), VMError> {
        self.handle_comparison(|x, y| x > y)
    }

    pub fn handle_less(&mut self) -> Result<(), VMError> {
        self.handle_comparison(|x, y| x < y)
    }

    /// Ordering is defined for numbers only; <= and >= are compiled as the
    /// negation of the opposite comparison.
    fn handle_comparison<F>(&mut self, op_fn: F) -> Result<(), VMError>
    where
        F: Fn(f64, f64) -> bool,
    {
        match (self.stack.peek(1), self.stack.peek(0)) {
            (Value::Number(x), Value::Number(y)) => {
                self.stack.pop();
                self.stack.pop();
                self.stack.push(Value::Boolean(op_fn(x, y)));
                Ok(())
            }
            _ => Err(self.error(ErrorKind::TypeError(
                "Operands must be numbers.".to_string(),
            ))),
        }
    }
}
