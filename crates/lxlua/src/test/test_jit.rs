// Native backend: compilation, execution parity with the interpreter,
// and the barrier protocol.

use crate::jit::{self, JitOutcome};
use crate::lua_vm::execute::call::{self, PreCall};
use crate::test::helpers::*;
use crate::*;

fn jit_vm() -> Box<LuaVM> {
    let mut opts = VmOptions::default();
    opts.jit_enabled = true;
    LuaVM::new(opts)
}

fn add_proto() -> std::rc::Rc<Proto> {
    // return a + b, fully inline-emittable
    let mut b = ProtoBuilder::new(2, 4);
    b.abc(OpCode::Add, 2, 0, 1);
    b.abc(OpCode::Return1, 2, 0, 0);
    b.build()
}

/// First opcode emits inline, the second one barriers.
fn barrier_proto() -> std::rc::Rc<Proto> {
    let mut b = ProtoBuilder::new(2, 5).with_env();
    b.abc(OpCode::Add, 2, 0, 1); // 0: inline
    b.abc(OpCode::GetUpval, 3, 0, 0); // 1: not emitted -> barrier
    b.abc(OpCode::Return1, 2, 0, 0); // 2
    b.build()
}

#[cfg(all(any(target_arch = "x86_64", target_arch = "aarch64"), unix))]
mod native {
    use super::*;

    #[test]
    fn simple_functions_compile_and_run() {
        let mut vm = jit_vm();
        let proto = add_proto();
        jit::compile(&proto);
        assert!(proto.jit.get().is_set(), "backend produced no code");

        let f = vm.closure_from_proto(proto);
        let r = vm
            .call_value(f, &[LuaValue::integer(30), LuaValue::integer(12)])
            .unwrap();
        assert_eq!(r.first().as_integer(), Some(42));
    }

    #[test]
    fn jit_matches_interpreter_on_arithmetic() {
        let cases: &[(i64, i64)] = &[(1, 2), (-5, 5), (i64::MAX, 1), (0, 0)];
        for &(a, b) in cases {
            let mut vm_i = new_vm(); // interpreter only
            let mut vm_j = jit_vm();
            let args = [LuaValue::integer(a), LuaValue::integer(b)];

            let fi = vm_i.closure_from_proto(add_proto());
            let fj = vm_j.closure_from_proto(add_proto());
            let ri = vm_i.call_value(fi, &args).unwrap();
            let rj = vm_j.call_value(fj, &args).unwrap();
            assert_eq!(ri.first().as_integer(), rj.first().as_integer());
        }
    }

    #[test]
    fn barrier_saves_the_resume_point() {
        let mut vm = jit_vm();
        let proto = barrier_proto();
        let f = vm.closure_from_proto(proto.clone());

        // drive the frame by hand so the barrier is observable
        let s = vm.main_state();
        let func_pos = s.top();
        s.push(f).unwrap();
        s.push(LuaValue::integer(2)).unwrap();
        s.push(LuaValue::integer(3)).unwrap();
        let depth = s.call_depth();
        match call::precall(s, func_pos, -1).unwrap() {
            PreCall::Lua => {}
            PreCall::Done => panic!("expected a Lua frame"),
        }

        match jit::try_enter(s, depth, &proto).unwrap() {
            JitOutcome::Barrier => {}
            JitOutcome::Returned => panic!("native code should have bailed"),
            JitOutcome::NotCompiled => panic!("backend produced no code"),
        }
        // the saved pc names the opcode the interpreter resumes from
        assert_eq!(s.frame(depth).pc, 1);

        // finishing interpreted yields the same observable result
        crate::lua_vm::execute::lua_execute(s, depth).unwrap();
        let result = s.get(func_pos);
        assert_eq!(result.as_integer(), Some(5));
        s.set_top(func_pos);
    }

    #[test]
    fn whole_function_runs_through_the_dispatcher() {
        let mut vm = jit_vm();
        let proto = barrier_proto();
        let f = vm.closure_from_proto(proto);
        let r = vm
            .call_value(f, &[LuaValue::integer(20), LuaValue::integer(22)])
            .unwrap();
        assert_eq!(r.first().as_integer(), Some(42));
    }

    #[test]
    fn native_calls_and_comparisons() {
        let mut vm = jit_vm();
        // max(a, b) via LT + JMP, all emitted (compare via helper)
        let mut b = ProtoBuilder::new(2, 4);
        b.abck(OpCode::Lt, 0, 1, 0, true); // 0: a < b ?
        b.sj(OpCode::Jmp, 1); // 1 -> 3 (return b)
        b.abc(OpCode::Return1, 0, 0, 0); // 2
        b.abc(OpCode::Return1, 1, 0, 0); // 3
        let proto = b.build();
        jit::compile(&proto);
        assert!(proto.jit.get().is_set());

        let f = vm.closure_from_proto(proto);
        let r = vm
            .call_value(f, &[LuaValue::integer(3), LuaValue::integer(9)])
            .unwrap();
        assert_eq!(r.first().as_integer(), Some(9));
        let r = vm
            .call_value(f, &[LuaValue::integer(11), LuaValue::integer(9)])
            .unwrap();
        assert_eq!(r.first().as_integer(), Some(11));
    }

    #[test]
    fn native_errors_surface_like_interpreted_ones() {
        let mut vm = jit_vm();
        // n // 0 raises from inside emitted code
        let mut b = ProtoBuilder::new(2, 4);
        b.abc(OpCode::IDiv, 2, 0, 1);
        b.abc(OpCode::Return1, 2, 0, 0);
        let f = vm.closure_from_proto(b.build());
        let err = vm
            .pcall_value(f, &[LuaValue::integer(1), LuaValue::integer(0)])
            .unwrap_err();
        assert_eq!(err, LuaError::ArithmeticError);
    }

    #[test]
    fn emission_failure_is_not_fatal() {
        // an empty prototype compiles to nothing and still "runs"
        let proto = ProtoBuilder::new(0, 2).build();
        jit::compile(&proto);
        assert!(!proto.jit.get().is_set());
    }

    #[test]
    fn pages_are_released_with_the_prototype() {
        let proto = add_proto();
        jit::compile(&proto);
        assert!(proto.jit.get().is_set());
        drop(proto); // Proto::drop must munmap without issue
    }
}

#[cfg(not(all(any(target_arch = "x86_64", target_arch = "aarch64"), unix)))]
mod stub {
    use super::*;

    #[test]
    fn stub_backend_compiles_nothing() {
        let proto = add_proto();
        jit::compile(&proto);
        assert!(!proto.jit.get().is_set());

        // the interpreter carries the load
        let mut vm = jit_vm();
        let f = vm.closure_from_proto(proto);
        let r = vm
            .call_value(f, &[LuaValue::integer(1), LuaValue::integer(2)])
            .unwrap();
        assert_eq!(r.first().as_integer(), Some(3));
    }
}
