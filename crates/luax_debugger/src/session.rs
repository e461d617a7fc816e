// Debug session: owns the VM thread, translates requests into hub
// operations, and forwards hub events onto the wire. The session never
// touches interpreter data directly; everything goes through the hub's
// desired-state surfaces.

use crate::protocol::{self, Request};
use luax::debug::snapshot::{BytecodeSnapshot, FrameSnapshot, PausedContext, VarEntry};
use luax::debug::{DebugEvent, DebugHub, LineBreakpointSpec, ResumeAction, StepOverMode, VarScope};
use luax::lua_value::chunk_io;
use luax::{LuaVM, Prototype};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub default_program: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    /// (source, line) pairs supplied on the command line
    pub breakpoints: Vec<(String, u32)>,
    pub stop_on_entry: bool,
}

enum VmCommand {
    Launch {
        program: PathBuf,
        stop_on_entry: bool,
    },
}

pub struct DebugSession {
    hub: Arc<DebugHub>,
    vm_tx: Sender<VmCommand>,
    vm_thread: Option<JoinHandle<()>>,
    config: SessionConfig,
    /// Chunk name of the launched program, once known
    program_chunk: Arc<Mutex<Option<String>>>,
    /// Cancellation token of the running VM, once built
    cancel: Arc<Mutex<Option<Arc<AtomicBool>>>>,
    launched: AtomicBool,
}

fn event_name(event: &DebugEvent) -> (&'static str, Value) {
    match event {
        DebugEvent::Initialized => ("initialized", json!({})),
        DebugEvent::Stopped {
            reason,
            thread_id,
            file,
            line,
        } => (
            "stopped",
            json!({ "reason": reason, "threadId": thread_id, "file": file, "line": line }),
        ),
        DebugEvent::Continued => ("continued", json!({})),
        DebugEvent::Output { category, output } => {
            ("output", json!({ "category": category, "output": output }))
        }
        DebugEvent::Terminated => ("terminated", json!({})),
    }
}

impl DebugSession {
    pub fn new(out: Sender<String>, config: SessionConfig) -> DebugSession {
        let hub = DebugHub::new();
        let program_chunk: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let cancel: Arc<Mutex<Option<Arc<AtomicBool>>>> = Arc::new(Mutex::new(None));

        // Events flow from the VM thread through the hub sink straight
        // onto the writer channel. Stop-on-entry cleanup also lives
        // here: the entry trap is cleared at its first (and only) stop.
        // The sink holds the hub weakly; a strong reference would keep
        // the writer channel alive forever.
        let sink_out = Mutex::new(out);
        let sink_hub = Arc::downgrade(&hub);
        let entry_break: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let sink_entry = entry_break.clone();
        hub.set_event_sink(Box::new(move |debug_event| {
            if matches!(debug_event, DebugEvent::Stopped { .. }) {
                if let Some(chunk) = sink_entry.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    if let Some(hub) = sink_hub.upgrade() {
                        hub.set_instr_breakpoint(&chunk, 0, false);
                    }
                }
            }
            let (name, body) = event_name(&debug_event);
            let _ = sink_out
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .send(protocol::event(name, body));
        }));

        let (vm_tx, vm_rx) = channel::<VmCommand>();
        let thread_hub = hub.clone();
        let thread_chunk = program_chunk.clone();
        let thread_cancel = cancel.clone();
        let thread_entry = entry_break;
        let vm_thread = std::thread::spawn(move || {
            while let Ok(command) = vm_rx.recv() {
                match command {
                    VmCommand::Launch {
                        program,
                        stop_on_entry,
                    } => run_program(
                        &thread_hub,
                        &program,
                        stop_on_entry,
                        &thread_chunk,
                        &thread_cancel,
                        &thread_entry,
                    ),
                }
            }
        });

        DebugSession {
            hub,
            vm_tx,
            vm_thread: Some(vm_thread),
            config,
            program_chunk,
            cancel,
            launched: AtomicBool::new(false),
        }
    }

    pub fn hub(&self) -> &Arc<DebugHub> {
        &self.hub
    }

    /// Resolve a client-facing source path onto a registered chunk name
    fn resolve_chunk(&self, source: &str) -> String {
        let normalized = source.replace('\\', "/");
        let candidate = if normalized.starts_with('@') {
            normalized.clone()
        } else {
            format!("@{}", normalized)
        };
        if self.hub.registered_prototype(&candidate).is_some() {
            return candidate;
        }
        if self.hub.registered_prototype(&normalized).is_some() {
            return normalized;
        }
        // Fall back to matching the launched program's chunk by suffix
        if let Some(chunk) = self
            .program_chunk
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            let bare = chunk.strip_prefix('@').unwrap_or(&chunk);
            if bare.ends_with(normalized.trim_start_matches('@'))
                || normalized.trim_start_matches('@').ends_with(bare)
            {
                return chunk;
            }
        }
        candidate
    }

    /// Apply `--bp file:line` arguments before anything runs
    pub fn apply_cli_breakpoints(&self) {
        use std::collections::HashMap;
        let mut per_chunk: HashMap<String, Vec<LineBreakpointSpec>> = HashMap::new();
        for (source, line) in &self.config.breakpoints {
            per_chunk
                .entry(self.resolve_chunk(source))
                .or_default()
                .push(LineBreakpointSpec {
                    line: *line,
                    ..Default::default()
                });
        }
        for (chunk, specs) in per_chunk {
            self.hub.set_desired_breakpoints(&chunk, specs);
        }
    }

    fn paused_or_err(&self, id: &Option<Value>) -> Result<PausedContext, String> {
        self.hub
            .paused_context()
            .ok_or_else(|| protocol::response_err(id, protocol::NOT_PAUSED, "VM is not paused"))
    }

    fn frame<'c>(
        context: &'c PausedContext,
        id: &Option<Value>,
        params: &Value,
    ) -> Result<&'c FrameSnapshot, String> {
        let frame_id = params["frameId"].as_u64().unwrap_or(0) as usize;
        context.frames.get(frame_id).ok_or_else(|| {
            protocol::response_err(id, protocol::INVALID_PARAMS, "no such frame")
        })
    }

    fn vars_json(vars: &[VarEntry]) -> Value {
        Value::Array(
            vars.iter()
                .map(|v| json!({ "name": v.name, "value": v.value, "type": v.type_name }))
                .collect(),
        )
    }

    fn bytecode_json(snapshot: &BytecodeSnapshot) -> Value {
        json!({
            "chunk": snapshot.chunk,
            "pc": snapshot.pc,
            "instructions": snapshot.instructions.iter().map(|i| {
                let mut obj = json!({ "index": i.index, "line": i.line, "text": i.text });
                if let Some(child) = i.child_index {
                    obj["childIndex"] = json!(child);
                }
                obj
            }).collect::<Vec<_>>(),
            "constants": snapshot.constants,
            "locals": snapshot.locals,
            "upvalues": snapshot.upvalues,
        })
    }

    fn frame_prototype(
        &self,
        context: &PausedContext,
        params: &Value,
    ) -> Option<(Arc<Prototype>, u32)> {
        let frame_id = params["frameId"].as_u64().unwrap_or(0) as usize;
        let frame = context.frames.get(frame_id)?;
        let proto = self.hub.prototype_by_key(frame.proto_key)?;
        Some((proto, frame.pc))
    }

    fn resume_with(&self, id: &Option<Value>, action: ResumeAction) -> (Option<String>, bool) {
        if self.hub.resume(action) {
            (Some(protocol::response_ok(id, json!({}))), false)
        } else {
            (
                Some(protocol::response_err(
                    id,
                    protocol::NOT_PAUSED,
                    "VM is not paused",
                )),
                false,
            )
        }
    }

    /// Handle one request. Returns the response line (if any) and
    /// whether the serve loop should stop.
    pub fn handle(&self, request: &Request) -> (Option<String>, bool) {
        let id = &request.id;
        let params = &request.params;
        match request.method.as_str() {
            "initialize" => {
                let response = protocol::response_ok(
                    id,
                    json!({
                        "supportsConditionalBreakpoints": true,
                        "supportsHitConditionalBreakpoints": true,
                        "supportsLogPoints": true,
                        "supportsInstructionBreakpoints": true,
                        "supportsStepOverModes": ["Line", "Instruction"],
                    }),
                );
                self.hub.emit(DebugEvent::Initialized);
                (Some(response), false)
            }
            "setBreakpoints" => {
                let source = params["source"]["path"]
                    .as_str()
                    .or_else(|| params["source"].as_str())
                    .unwrap_or("");
                if source.is_empty() {
                    return (
                        Some(protocol::response_err(
                            id,
                            protocol::INVALID_PARAMS,
                            "setBreakpoints requires a source",
                        )),
                        false,
                    );
                }
                let chunk = self.resolve_chunk(source);
                let specs: Vec<LineBreakpointSpec> = params["breakpoints"]
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| {
                                Some(LineBreakpointSpec {
                                    line: item["line"].as_u64()? as u32,
                                    condition: item["condition"]
                                        .as_str()
                                        .map(|s| s.to_string()),
                                    hit_condition: item["hitCondition"]
                                        .as_str()
                                        .map(|s| s.to_string()),
                                    log_message: item["logMessage"]
                                        .as_str()
                                        .map(|s| s.to_string()),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let verification = self.hub.set_desired_breakpoints(&chunk, specs);
                let body: Vec<Value> = verification
                    .into_iter()
                    .map(|(line, verified)| json!({ "line": line, "verified": verified }))
                    .collect();
                (
                    Some(protocol::response_ok(id, json!({ "breakpoints": body }))),
                    false,
                )
            }
            "launch" => {
                let program = params["program"]
                    .as_str()
                    .map(PathBuf::from)
                    .or_else(|| self.config.default_program.clone());
                let Some(program) = program else {
                    return (
                        Some(protocol::response_err(
                            id,
                            protocol::INVALID_PARAMS,
                            "launch requires a program",
                        )),
                        false,
                    );
                };
                if self.launched.swap(true, Ordering::SeqCst) {
                    return (
                        Some(protocol::response_err(
                            id,
                            protocol::SESSION_ERROR,
                            "program already launched",
                        )),
                        false,
                    );
                }
                if let Some(cwd) = params["cwd"].as_str().map(PathBuf::from).or_else(|| self.config.cwd.clone()) {
                    if let Err(e) = std::env::set_current_dir(&cwd) {
                        tracing::warn!(cwd = %cwd.display(), error = %e, "cannot change working directory");
                    }
                }
                let stop_on_entry = params["stopOnEntry"]
                    .as_bool()
                    .unwrap_or(self.config.stop_on_entry);
                let sent = self.vm_tx.send(VmCommand::Launch {
                    program,
                    stop_on_entry,
                });
                match sent {
                    Ok(()) => (Some(protocol::response_ok(id, json!({}))), false),
                    Err(_) => (
                        Some(protocol::response_err(
                            id,
                            protocol::SESSION_ERROR,
                            "VM thread is gone",
                        )),
                        false,
                    ),
                }
            }
            "continue" => self.resume_with(id, ResumeAction::Continue),
            "next" => self.resume_with(id, ResumeAction::StepOver),
            "stepIn" => self.resume_with(id, ResumeAction::StepIn),
            "stepOut" => self.resume_with(id, ResumeAction::StepOut),
            "getStack" => match self.paused_or_err(id) {
                Err(response) => (Some(response), false),
                Ok(context) => {
                    let frames: Vec<Value> = context
                        .frames
                        .iter()
                        .map(|f| {
                            json!({
                                "id": f.id,
                                "file": f.file,
                                "line": f.line,
                                "what": f.what,
                                "tail": f.is_tail,
                            })
                        })
                        .collect();
                    (
                        Some(protocol::response_ok(id, json!({ "frames": frames }))),
                        false,
                    )
                }
            },
            "getLocals" | "getUpvalues" => match self.paused_or_err(id) {
                Err(response) => (Some(response), false),
                Ok(context) => match Self::frame(&context, id, params) {
                    Err(response) => (Some(response), false),
                    Ok(frame) => {
                        let vars = if request.method == "getLocals" {
                            Self::vars_json(&frame.locals)
                        } else {
                            Self::vars_json(&frame.upvalues)
                        };
                        (
                            Some(protocol::response_ok(id, json!({ "variables": vars }))),
                            false,
                        )
                    }
                },
            },
            "getGlobals" => match self.paused_or_err(id) {
                Err(response) => (Some(response), false),
                Ok(context) => (
                    Some(protocol::response_ok(
                        id,
                        json!({ "variables": Self::vars_json(&context.globals) }),
                    )),
                    false,
                ),
            },
            "setLocal" | "setUpvalue" => {
                let name = params["name"].as_str().unwrap_or("");
                let value = params["value"].as_str().map(|s| s.to_string()).unwrap_or_else(|| {
                    params["value"].to_string()
                });
                if name.is_empty() {
                    return (
                        Some(protocol::response_err(
                            id,
                            protocol::INVALID_PARAMS,
                            "a variable name is required",
                        )),
                        false,
                    );
                }
                let scope = if request.method == "setLocal" {
                    VarScope::Local
                } else {
                    VarScope::Upvalue
                };
                let frame_id = params["frameId"].as_u64().unwrap_or(0) as usize;
                if self.hub.queue_var_set(scope, frame_id, name, &value) {
                    (Some(protocol::response_ok(id, json!({}))), false)
                } else {
                    (
                        Some(protocol::response_err(
                            id,
                            protocol::NOT_PAUSED,
                            "VM is not paused",
                        )),
                        false,
                    )
                }
            }
            "getBytecode" => match self.paused_or_err(id) {
                Err(response) => (Some(response), false),
                Ok(context) => match self.frame_prototype(&context, params) {
                    None => (
                        Some(protocol::response_err(
                            id,
                            protocol::INVALID_PARAMS,
                            "no prototype for that frame",
                        )),
                        false,
                    ),
                    Some((proto, pc)) => {
                        let snapshot = self.hub.bytecode_snapshot(&proto, Some(pc));
                        (
                            Some(protocol::response_ok(id, Self::bytecode_json(&snapshot))),
                            false,
                        )
                    }
                },
            },
            "setInstrBreakpoint" => {
                let chunk = params["chunk"].as_str().map(|s| self.resolve_chunk(s));
                let index = params["index"].as_u64();
                let enabled = params["enabled"].as_bool().unwrap_or(true);
                match (chunk, index) {
                    (Some(chunk), Some(index)) => {
                        let applied =
                            self.hub.set_instr_breakpoint(&chunk, index as u32, enabled);
                        (
                            Some(protocol::response_ok(
                                id,
                                json!({ "applied": applied, "pending": !applied }),
                            )),
                            false,
                        )
                    }
                    _ => (
                        Some(protocol::response_err(
                            id,
                            protocol::INVALID_PARAMS,
                            "setInstrBreakpoint requires chunk and index",
                        )),
                        false,
                    ),
                }
            }
            "getInstrBreakpoints" => {
                let chunk = params["chunk"].as_str().map(|s| self.resolve_chunk(s));
                match chunk {
                    Some(chunk) => (
                        Some(protocol::response_ok(
                            id,
                            json!({ "indices": self.hub.instr_breakpoints(&chunk) }),
                        )),
                        false,
                    ),
                    None => (
                        Some(protocol::response_err(
                            id,
                            protocol::INVALID_PARAMS,
                            "getInstrBreakpoints requires a chunk",
                        )),
                        false,
                    ),
                }
            }
            "findPrototype" => {
                let file = params["file"].as_str().unwrap_or("");
                let line = params["line"].as_u64().unwrap_or(0) as u32;
                match self.hub.find_prototype(file, line) {
                    Some(proto) => {
                        let snapshot = self.hub.bytecode_snapshot(&proto, None);
                        (
                            Some(protocol::response_ok(id, Self::bytecode_json(&snapshot))),
                            false,
                        )
                    }
                    None => (
                        Some(protocol::response_err(
                            id,
                            protocol::INVALID_PARAMS,
                            "no prototype matches that location",
                        )),
                        false,
                    ),
                }
            }
            "setStepOverMode" => {
                let mode = match params["mode"].as_str() {
                    Some("Line") => Some(StepOverMode::Line),
                    Some("Instruction") => Some(StepOverMode::Instruction),
                    _ => None,
                };
                match mode {
                    Some(mode) => {
                        self.hub.set_step_over_mode(mode);
                        (Some(protocol::response_ok(id, json!({}))), false)
                    }
                    None => (
                        Some(protocol::response_err(
                            id,
                            protocol::INVALID_PARAMS,
                            "mode must be Line or Instruction",
                        )),
                        false,
                    ),
                }
            }
            "getOptions" => {
                let mode = match self.hub.step_over_mode() {
                    StepOverMode::Line => "Line",
                    StepOverMode::Instruction => "Instruction",
                };
                (
                    Some(protocol::response_ok(id, json!({ "stepOverMode": mode }))),
                    false,
                )
            }
            "terminate" => {
                self.request_stop();
                (Some(protocol::response_ok(id, json!({}))), true)
            }
            unknown => (
                Some(protocol::response_err(
                    id,
                    protocol::METHOD_NOT_FOUND,
                    &format!("unknown method '{}'", unknown),
                )),
                false,
            ),
        }
    }

    fn request_stop(&self) {
        if let Some(token) = self
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            token.store(true, Ordering::Relaxed);
        }
        // A paused VM cannot observe cancellation until it resumes
        self.hub.resume(ResumeAction::Continue);
    }

    pub fn shutdown(mut self) {
        self.request_stop();
        // Closing the command channel ends the VM thread's loop
        let (dead_tx, _) = channel();
        self.vm_tx = dead_tx;
        if let Some(handle) = self.vm_thread.take() {
            let _ = handle.join();
        }
        self.hub.emit(DebugEvent::Terminated);
    }
}

/// Body of the VM thread: everything `Rc`-shaped lives and dies here.
fn run_program(
    hub: &Arc<DebugHub>,
    program: &PathBuf,
    stop_on_entry: bool,
    program_chunk: &Arc<Mutex<Option<String>>>,
    cancel: &Arc<Mutex<Option<Arc<AtomicBool>>>>,
    entry_break: &Arc<Mutex<Option<String>>>,
) {
    tracing::info!(program = %program.display(), "launching chunk");
    let proto = match chunk_io::load_chunk_file(program) {
        Ok(p) => p,
        Err(message) => {
            hub.emit(DebugEvent::Output {
                category: "stderr",
                output: message,
            });
            hub.emit(DebugEvent::Terminated);
            return;
        }
    };
    let chunk = proto.chunk_name.to_string();
    *program_chunk.lock().unwrap_or_else(|e| e.into_inner()) = Some(chunk.clone());
    if stop_on_entry {
        hub.set_instr_breakpoint(&chunk, 0, true);
        *entry_break.lock().unwrap_or_else(|e| e.into_inner()) = Some(chunk.clone());
    }

    let mut vm = LuaVM::new();
    vm.attach_debugger(hub.clone());
    *cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(vm.cancel_token());
    if let Err(e) = luax::stdlib::open_libs(&mut vm) {
        let full = vm.into_full_error(e);
        hub.emit(DebugEvent::Output {
            category: "stderr",
            output: full.message,
        });
        hub.emit(DebugEvent::Terminated);
        return;
    }
    let print_hub = hub.clone();
    vm.set_print_sink(Box::new(move |line| {
        print_hub.emit(DebugEvent::Output {
            category: "stdout",
            output: line.to_string(),
        });
    }));

    let main = vm.load_main(proto);
    match vm.run_main(main) {
        Ok(results) => {
            if !results.is_empty() {
                let rendered: Vec<String> =
                    results.iter().map(|v| vm.display_value(v)).collect();
                hub.emit(DebugEvent::Output {
                    category: "stdout",
                    output: rendered.join("\t"),
                });
            }
            tracing::info!("program finished");
        }
        Err(e) => {
            let full = vm.into_full_error(e);
            hub.emit(DebugEvent::Output {
                category: "stderr",
                output: full.message,
            });
        }
    }
    hub.emit(DebugEvent::Terminated);
}
