// Shared test scaffolding: the compiler is an external collaborator, so
// tests hand-assemble prototypes with the Instruction helpers.

use crate::lua_value::{Constant, LocalVar, Prototype, UpvalueDesc};
use crate::lua_vm::LuaVM;
use crate::LuaValue;
use smol_str::SmolStr;
use std::sync::Arc;

pub struct ProtoBuilder {
    chunk_name: String,
    code: Vec<u32>,
    lines: Vec<u32>,
    constants: Vec<Constant>,
    protos: Vec<Arc<Prototype>>,
    upvalues: Vec<UpvalueDesc>,
    locals: Vec<LocalVar>,
    param_count: usize,
    is_vararg: bool,
    max_stack: usize,
}

impl ProtoBuilder {
    pub fn new(chunk_name: &str, max_stack: usize) -> Self {
        ProtoBuilder {
            chunk_name: chunk_name.to_string(),
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            locals: Vec::new(),
            param_count: 0,
            is_vararg: false,
            max_stack,
        }
    }

    pub fn op(mut self, line: u32, instr: u32) -> Self {
        self.code.push(instr);
        self.lines.push(line);
        self
    }

    pub fn constant(mut self, k: Constant) -> Self {
        self.constants.push(k);
        self
    }

    pub fn child(mut self, proto: Arc<Prototype>) -> Self {
        self.protos.push(proto);
        self
    }

    /// Declare the `_ENV`-style upvalue most chunks carry
    pub fn env_upvalue(mut self) -> Self {
        self.upvalues.push(UpvalueDesc {
            name: SmolStr::new("_ENV"),
            in_stack: false,
            index: 0,
        });
        self
    }

    pub fn upvalue(mut self, name: &str, in_stack: bool, index: u32) -> Self {
        self.upvalues.push(UpvalueDesc {
            name: SmolStr::new(name),
            in_stack,
            index,
        });
        self
    }

    pub fn local(mut self, name: &str, start_pc: u32, end_pc: u32) -> Self {
        self.locals.push(LocalVar {
            name: SmolStr::new(name),
            start_pc,
            end_pc,
        });
        self
    }

    pub fn params(mut self, n: usize) -> Self {
        self.param_count = n;
        self
    }

    pub fn vararg(mut self) -> Self {
        self.is_vararg = true;
        self
    }

    pub fn build(self) -> Arc<Prototype> {
        Arc::new(Prototype::new(
            self.chunk_name,
            self.code,
            self.lines,
            self.constants,
            self.protos,
            self.upvalues,
            self.locals,
            self.param_count,
            self.is_vararg,
            self.max_stack,
        ))
    }
}

pub fn new_vm() -> LuaVM {
    let mut vm = LuaVM::new();
    crate::stdlib::open_libs(&mut vm).expect("open_libs");
    vm
}

pub fn run(vm: &mut LuaVM, proto: Arc<Prototype>) -> Result<Vec<LuaValue>, String> {
    let main = vm.load_main(proto);
    vm.run_main(main).map_err(|e| {
        let full = vm.into_full_error(e);
        full.message
    })
}

/// A scripted debug controller: answers the n-th stop with the n-th
/// action (Continue once the script runs out) and records what it saw.
pub mod controller {
    use crate::debug::snapshot::PausedContext;
    use crate::debug::{DebugEvent, DebugHub, ResumeAction};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    #[derive(Debug, Clone)]
    pub struct StopRecord {
        pub reason: String,
        pub line: u32,
        pub context: PausedContext,
    }

    pub struct Script {
        pub stops: Arc<Mutex<Vec<StopRecord>>>,
        pub outputs: Arc<Mutex<Vec<(String, String)>>>,
        handle: JoinHandle<()>,
    }

    impl Script {
        pub fn finish(self, hub: &Arc<DebugHub>) -> (Vec<StopRecord>, Vec<(String, String)>) {
            hub.emit(DebugEvent::Terminated);
            self.handle.join().expect("controller thread");
            let stops = self.stops.lock().unwrap().clone();
            let outputs = self.outputs.lock().unwrap().clone();
            (stops, outputs)
        }
    }

    pub fn spawn(hub: Arc<DebugHub>, actions: Vec<ResumeAction>) -> Script {
        let (tx, rx) = mpsc::channel::<DebugEvent>();
        let tx = Mutex::new(tx);
        hub.set_event_sink(Box::new(move |event| {
            let _ = tx.lock().unwrap().send(event);
        }));
        let stops: Arc<Mutex<Vec<StopRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let outputs: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let stops_in = stops.clone();
        let outputs_in = outputs.clone();
        let hub_in = hub.clone();
        let handle = std::thread::spawn(move || {
            let mut actions = actions.into_iter();
            while let Ok(event) = rx.recv() {
                match event {
                    DebugEvent::Stopped { reason, line, .. } => {
                        let context = hub_in
                            .paused_context()
                            .expect("paused context while stopped");
                        stops_in.lock().unwrap().push(StopRecord {
                            reason: reason.to_string(),
                            line,
                            context,
                        });
                        let action = actions.next().unwrap_or(ResumeAction::Continue);
                        hub_in.resume(action);
                    }
                    DebugEvent::Output { category, output } => {
                        outputs_in
                            .lock()
                            .unwrap()
                            .push((category.to_string(), output));
                    }
                    DebugEvent::Terminated => break,
                    _ => {}
                }
            }
        });
        Script {
            stops,
            outputs,
            handle,
        }
    }
}

pub fn num(results: &[LuaValue], index: usize) -> f64 {
    match results.get(index) {
        Some(LuaValue::Number(n)) => *n,
        other => panic!("expected number at result {}, got {:?}", index, other),
    }
}

pub fn text(results: &[LuaValue], index: usize) -> String {
    match results.get(index) {
        Some(LuaValue::String(s)) => s.as_str().to_string(),
        other => panic!("expected string at result {}, got {:?}", index, other),
    }
}
