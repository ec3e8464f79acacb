// Mylox VM runtime errors
// Created by: Yuyang Feng <mu_yunaaaa@mail.nwpu.edu.cn>
// Changelog:
// 2026-03-04: Carried the VMError hierarchy over from the Lua VM; the trace now
//            records source lines instead of instruction offsets, because Lox
//            chunks keep a per-byte line table.
// 2026-03-08: Frame entries print as "[line N] in name()" / "in script", which is
//            what the traceback walker emits after the message.

#[derive(Debug, Clone)]
pub enum ErrorKind {
    // 1 + "a" 之类
    TypeError(String),
    // 访问未定义的全局变量
    UndefinedVariable(String),
    // 调用一个不可调用的值
    InvalidCall(String),
    // 递归太深
    StackOverflow,
    // GC 之后仍然分配失败
    OutOfMemory,
    // 字节码损坏或 VM 自身的 bug
    InternalError(String),
}

/// One frame of the traceback, innermost first. `name` is None for the
/// top-level script frame.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: usize,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VMError {
    pub kind: ErrorKind,
    pub line: usize,
    pub stack_trace: Vec<TraceFrame>,
}

impl VMError {
    pub fn message(&self) -> String {
        match &self.kind {
            ErrorKind::TypeError(m) => m.clone(),
            ErrorKind::UndefinedVariable(name) => format!("Undefined variable '{}'.", name),
            ErrorKind::InvalidCall(m) => m.clone(),
            ErrorKind::StackOverflow => "Stack overflow.".to_string(),
            ErrorKind::OutOfMemory => "Out of memory.".to_string(),
            ErrorKind::InternalError(m) => m.clone(),
        }
    }
}

impl std::fmt::Display for VMError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.message())?;
        for frame in &self.stack_trace {
            match &frame.name {
                Some(name) => writeln!(f, "[line {}] in {}()", frame.line, name)?,
                None => writeln!(f, "[line {}] in script", frame.line)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, TraceFrame, VMError};

    #[test]
    fn traceback_renders_innermost_first() {
        let err = VMError {
            kind: ErrorKind::TypeError("Operands must be numbers.".to_string()),
            line: 3,
            stack_trace: vec![
                TraceFrame {
                    line: 3,
                    name: Some("inner".to_string()),
                },
                TraceFrame { line: 9, name: None },
            ],
        };
        let rendered = err.to_string();
        assert_eq!(
            rendered,
            "Operands must be numbers.\n[line 3] in inner()\n[line 9] in script\n"
        );
    }

    #[test]
    fn undefined_variable_message() {
        let err = VMError {
            kind: ErrorKind::UndefinedVariable("x".to_string()),
            line: 1,
            stack_trace: vec![],
        };
        assert_eq!(err.message(), "Undefined variable 'x'.");
    }
}
