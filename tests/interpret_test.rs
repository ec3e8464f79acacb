use mylox::backend::vm::{InterpretResult, VirtualMachine};

// Embedder-level checks against the single interpret() surface, the way the
// CLI and the REPL drive the VM.

#[test]
fn interpret_reports_the_three_outcomes() {
    let mut vm = VirtualMachine::new();
    assert_eq!(vm.interpret("var a = 1;"), InterpretResult::Ok);
    assert_eq!(vm.interpret("var = ;"), InterpretResult::CompileError);
    assert_eq!(vm.interpret("1 + nil;"), InterpretResult::RuntimeError);
}

#[test]
fn globals_survive_across_interpret_calls() {
    // the REPL depends on this: one VM, many lines
    let mut vm = VirtualMachine::new();
    assert_eq!(vm.interpret("var counter = 41;"), InterpretResult::Ok);
    assert_eq!(
        vm.interpret("counter = counter + 1; print counter;"),
        InterpretResult::Ok
    );
}

#[test]
fn compile_errors_do_not_define_globals() {
    let mut vm = VirtualMachine::new();
    assert_eq!(
        vm.interpret("var ghost = 1; var broken ="),
        InterpretResult::CompileError
    );
    // nothing of the failed line ran
    assert_eq!(vm.interpret("print ghost;"), InterpretResult::RuntimeError);
}

#[test]
fn runtime_error_resets_the_operand_stack() {
    let mut vm = VirtualMachine::new();
    assert_eq!(vm.interpret("1 + nil;"), InterpretResult::RuntimeError);
    assert_eq!(vm.stack.len(), 0);
    // and the VM is still usable afterwards
    assert_eq!(vm.interpret("print 1 + 1;"), InterpretResult::Ok);
}

#[test]
fn stress_collection_during_a_script_is_safe() {
    let mut vm = VirtualMachine::new();
    vm.heap.stress = true;
    let source = "\
        fun weave(n) { \
          if (n < 1) return \"\"; \
          return weave(n - 1) + \"x\"; \
        } \
        var rope = weave(30); \
        print rope == weave(30);";
    assert_eq!(vm.interpret(source), InterpretResult::Ok);
}

#[test]
fn collection_keeps_only_reachable_strings_interned() {
    let mut vm = VirtualMachine::new();
    assert_eq!(
        vm.interpret("var keep = \"keep\" + \"me\";"),
        InterpretResult::Ok
    );
    let before = vm.heap.total_allocated;

    // the concat result is reachable through globals and must survive a
    // full collection; repeated collection stays stable
    vm.collect_garbage();
    let after_first = vm.heap.total_allocated;
    vm.collect_garbage();
    assert_eq!(after_first, vm.heap.total_allocated);
    assert!(after_first <= before);

    assert_eq!(vm.interpret("print keep;"), InterpretResult::Ok);
}
