// Debugger hub: the only state shared between the VM thread and the
// controller RPC thread. The RPC side writes desires (breakpoint
// snapshots, variable mutations, resume actions); the VM thread drains
// them into reality at safe points (trap entry, prototype registration,
// the dispatch loop's periodic check). All instruction patching happens
// under the single hub lock, and that lock is never held across the
// pause wait or an event emission.

pub mod eval;
pub mod overlay;
pub mod snapshot;

use crate::lua_value::Prototype;
use crate::lua_vm::{Instruction, LuaVM, OpCode};
use smol_str::SmolStr;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};

/// Single-step kind armed by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    None,
    Over,
    In,
    Out,
}

/// Whether step-over targets the next source line or the next instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOverMode {
    Line,
    Instruction,
}

/// What the controller answered to a stopped event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    Continue,
    StepOver,
    StepIn,
    StepOut,
}

/// Events published to the controller
#[derive(Debug, Clone)]
pub enum DebugEvent {
    Initialized,
    Stopped {
        reason: &'static str,
        thread_id: usize,
        file: String,
        line: u32,
    },
    Continued,
    Output {
        category: &'static str,
        output: String,
    },
    Terminated,
}

pub type EventSink = Box<dyn Fn(DebugEvent) + Send + Sync>;

/// One line breakpoint requested by the controller
#[derive(Debug, Clone, Default)]
pub struct LineBreakpointSpec {
    pub line: u32,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
}

/// Options attached to an installed breakpoint site
#[derive(Debug, Clone, Default)]
pub struct BreakpointOptions {
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    Line,
    Instruction,
}

/// An installed trap: the prototype is kept alive so the identity key
/// (its address) stays valid.
pub(crate) struct BreakpointSite {
    pub proto: Arc<Prototype>,
    pub index: u32,
    pub original: u32,
    pub kind: SiteKind,
}

/// The single temporary step trap
pub(crate) struct StepBreak {
    pub proto: Arc<Prototype>,
    pub index: u32,
    /// The saved instruction when the step trap owns the patch; None
    /// when the site already carried a user breakpoint (never
    /// double-restore)
    pub original: Option<u32>,
    /// Call depth at arming; a hit at greater depth passes through
    pub depth: usize,
    pub thread: usize,
}

/// Variable mutation queued by the controller, applied by the VM thread
/// on resume
#[derive(Debug, Clone)]
pub struct PendingVarSet {
    pub scope: VarScope,
    pub frame_id: usize,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScope {
    Local,
    Upvalue,
}

pub(crate) struct PausedState {
    pub context: snapshot::PausedContext,
    pub resume_tx: Sender<ResumeAction>,
    /// Breakpoint site we are paused at (None for a pure step pause)
    pub site: Option<(usize, u32)>,
    /// The recovered instruction at the pause site
    pub original: u32,
}

pub(crate) type SiteKey = (usize, u32);

pub(crate) struct HubState {
    pub registered: HashMap<SmolStr, Arc<Prototype>>,
    pub active: HashMap<SiteKey, BreakpointSite>,
    pub options: HashMap<SiteKey, BreakpointOptions>,
    pub hit_counts: HashMap<SiteKey, u64>,
    /// Instruction-level breakpoints requested before the chunk was seen
    pub instr_pending: HashMap<SmolStr, Vec<u32>>,
    /// Desired line-breakpoint snapshots not yet applied, per chunk
    pub desired: HashMap<SmolStr, Vec<LineBreakpointSpec>>,
    pub step_break: Option<StepBreak>,
    pub paused: Option<PausedState>,
    pub pending_sets: Vec<PendingVarSet>,
    pub step_over_mode: StepOverMode,
    pub last_thread: usize,
}

impl HubState {
    fn new() -> Self {
        HubState {
            registered: HashMap::new(),
            active: HashMap::new(),
            options: HashMap::new(),
            hit_counts: HashMap::new(),
            instr_pending: HashMap::new(),
            desired: HashMap::new(),
            step_break: None,
            paused: None,
            pending_sets: Vec::new(),
            step_over_mode: StepOverMode::Line,
            last_thread: 0,
        }
    }
}

pub struct DebugHub {
    pub(crate) state: Mutex<HubState>,
    /// Fast-path step mode for the frame push/pop hooks (In/Out only)
    step_mode: AtomicU8,
    /// Set when `desired`/`instr_pending` changed and the VM thread
    /// should drain at its next safe point
    desired_dirty: AtomicBool,
    sink: Mutex<Option<EventSink>>,
}

impl DebugHub {
    pub fn new() -> Arc<DebugHub> {
        Arc::new(DebugHub {
            state: Mutex::new(HubState::new()),
            step_mode: AtomicU8::new(0),
            desired_dirty: AtomicBool::new(false),
            sink: Mutex::new(None),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_event_sink(&self, sink: EventSink) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    pub fn emit(&self, event: DebugEvent) {
        let guard = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sink) = guard.as_ref() {
            sink(event);
        }
    }

    pub(crate) fn step_mode(&self) -> StepMode {
        match self.step_mode.load(Ordering::Acquire) {
            1 => StepMode::Over,
            2 => StepMode::In,
            3 => StepMode::Out,
            _ => StepMode::None,
        }
    }

    pub(crate) fn set_step_mode(&self, mode: StepMode) {
        let v = match mode {
            StepMode::None => 0,
            StepMode::Over => 1,
            StepMode::In => 2,
            StepMode::Out => 3,
        };
        self.step_mode.store(v, Ordering::Release);
    }

    /// Take the step mode if it matches (used by the push/pop hooks)
    pub(crate) fn take_step_mode(&self, expected: StepMode) -> bool {
        let v = match expected {
            StepMode::None => 0,
            StepMode::Over => 1,
            StepMode::In => 2,
            StepMode::Out => 3,
        };
        self.step_mode
            .compare_exchange(v, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_desired_dirty(&self) {
        self.desired_dirty.store(true, Ordering::Release);
    }

    pub(crate) fn take_desired_dirty(&self) -> bool {
        self.desired_dirty.swap(false, Ordering::AcqRel)
    }

    // ===== Controller-facing API (RPC thread) =====

    /// Replace the desired line breakpoints of a chunk. Returns per-line
    /// verification: a line verifies when the chunk is registered and
    /// maps to an instruction.
    pub fn set_desired_breakpoints(
        &self,
        chunk: &str,
        specs: Vec<LineBreakpointSpec>,
    ) -> Vec<(u32, bool)> {
        let mut st = self.lock();
        let verification = specs
            .iter()
            .map(|spec| {
                let verified = st
                    .registered
                    .get(chunk)
                    .and_then(|root| root.find_line_instruction(spec.line))
                    .is_some();
                (spec.line, verified)
            })
            .collect();
        st.desired.insert(SmolStr::new(chunk), specs);
        drop(st);
        self.mark_desired_dirty();
        verification
    }

    /// Resolve the pause handshake. Returns false when nothing is paused.
    pub fn resume(&self, action: ResumeAction) -> bool {
        let tx = {
            let st = self.lock();
            st.paused.as_ref().map(|p| p.resume_tx.clone())
        };
        match tx {
            Some(tx) => tx.send(action).is_ok(),
            None => false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused.is_some()
    }

    pub fn paused_context(&self) -> Option<snapshot::PausedContext> {
        self.lock().paused.as_ref().map(|p| p.context.clone())
    }

    /// Queue a local/upvalue mutation; it is applied by the VM thread on
    /// resume and mirrored into the paused snapshot immediately so later
    /// reads observe it.
    pub fn queue_var_set(
        &self,
        scope: VarScope,
        frame_id: usize,
        name: &str,
        value: &str,
    ) -> bool {
        let mut st = self.lock();
        if st.paused.is_none() {
            return false;
        }
        st.pending_sets.push(PendingVarSet {
            scope,
            frame_id,
            name: name.to_string(),
            value: value.to_string(),
        });
        if let Some(paused) = st.paused.as_mut() {
            if let Some(frame) = paused.context.frames.get_mut(frame_id) {
                let vars = match scope {
                    VarScope::Local => &mut frame.locals,
                    VarScope::Upvalue => &mut frame.upvalues,
                };
                if let Some(entry) = vars.iter_mut().find(|v| v.name == name) {
                    entry.value = value.to_string();
                }
            }
        }
        true
    }

    pub fn set_step_over_mode(&self, mode: StepOverMode) {
        self.lock().step_over_mode = mode;
    }

    pub fn step_over_mode(&self) -> StepOverMode {
        self.lock().step_over_mode
    }

    pub fn last_thread(&self) -> usize {
        self.lock().last_thread
    }

    /// Install or clear an instruction-level breakpoint. Applied
    /// immediately on a registered chunk, deferred otherwise. Returns
    /// true when applied now.
    pub fn set_instr_breakpoint(&self, chunk: &str, index: u32, enabled: bool) -> bool {
        let mut st = self.lock();
        match st.registered.get(chunk).cloned() {
            Some(root) => {
                if enabled {
                    overlay::install_site(
                        &mut *st,
                        &root,
                        index,
                        BreakpointOptions::default(),
                        SiteKind::Instruction,
                    );
                } else {
                    let key = (root.key(), index);
                    overlay::clear_site(&mut *st, key);
                }
                true
            }
            None => {
                if enabled {
                    let entry = st.instr_pending.entry(SmolStr::new(chunk)).or_default();
                    if !entry.contains(&index) {
                        entry.push(index);
                    }
                } else if let Some(entry) = st.instr_pending.get_mut(chunk) {
                    entry.retain(|&i| i != index);
                }
                false
            }
        }
    }

    pub fn instr_breakpoints(&self, chunk: &str) -> Vec<u32> {
        let st = self.lock();
        if let Some(root) = st.registered.get(chunk) {
            let root_key = root.key();
            let mut out: Vec<u32> = st
                .active
                .values()
                .filter(|s| s.kind == SiteKind::Instruction && s.proto.key() == root_key)
                .map(|s| s.index)
                .collect();
            out.sort_unstable();
            return out;
        }
        st.instr_pending.get(chunk).cloned().unwrap_or_default()
    }

    pub fn registered_prototype(&self, chunk: &str) -> Option<Arc<Prototype>> {
        self.lock().registered.get(chunk).cloned()
    }

    /// Locate a prototype anywhere in the registered trees by its
    /// identity key (as carried in frame snapshots).
    pub fn prototype_by_key(&self, key: usize) -> Option<Arc<Prototype>> {
        fn find(p: &Arc<Prototype>, key: usize) -> Option<Arc<Prototype>> {
            if p.key() == key {
                return Some(p.clone());
            }
            for child in &p.protos {
                if let Some(found) = find(child, key) {
                    return Some(found);
                }
            }
            None
        }
        let st = self.lock();
        for root in st.registered.values() {
            if let Some(found) = find(root, key) {
                return Some(found);
            }
        }
        None
    }

    /// Best-matching prototype for (file, line) across registered chunks
    pub fn find_prototype(&self, file: &str, line: u32) -> Option<Arc<Prototype>> {
        let st = self.lock();
        let normalized = file.replace('\\', "/");
        for (chunk, root) in st.registered.iter() {
            let name = chunk.strip_prefix('@').unwrap_or(chunk);
            if name == normalized || normalized.ends_with(name) || name.ends_with(&normalized) {
                if let Some(found) = root.find_enclosing(line) {
                    return Some(found);
                }
                return Some(root.clone());
            }
        }
        None
    }

    /// The original (unpatched) instruction at a site, resolving through
    /// the breakpoint and step records.
    pub(crate) fn original_at(st: &HubState, proto: &Arc<Prototype>, index: u32) -> u32 {
        let fetched = proto.fetch(index as usize);
        if Instruction::get_opcode(fetched) != OpCode::DebugTrap {
            return fetched;
        }
        let key = (proto.key(), index);
        if let Some(site) = st.active.get(&key) {
            return site.original;
        }
        if let Some(sb) = &st.step_break {
            if sb.proto.key() == key.0 && sb.index == index {
                if let Some(orig) = sb.original {
                    return orig;
                }
            }
        }
        if let Some(paused) = &st.paused {
            if paused.site == Some(key) || (paused.context.proto_key(), paused.context.pc) == key {
                return paused.original;
            }
        }
        fetched
    }

    /// Bytecode view of a prototype with original instruction text even
    /// at patched sites.
    pub fn bytecode_snapshot(
        &self,
        proto: &Arc<Prototype>,
        pc: Option<u32>,
    ) -> snapshot::BytecodeSnapshot {
        let st = self.lock();
        snapshot::bytecode_of(&*st, proto, pc)
    }

    // ===== VM-thread API =====

    /// Announce a prototype at closure creation. The first prototype of
    /// a chunk becomes the chunk's root; pending instruction breakpoints
    /// and desired line snapshots apply here.
    pub fn register_prototype(&self, proto: &Arc<Prototype>) {
        let mut st = self.lock();
        let chunk = proto.chunk_name.clone();
        if st.registered.contains_key(&chunk) {
            return;
        }
        st.registered.insert(chunk.clone(), proto.clone());
        if let Some(indices) = st.instr_pending.remove(&chunk) {
            for index in indices {
                overlay::install_site(
                    &mut *st,
                    proto,
                    index,
                    BreakpointOptions::default(),
                    SiteKind::Instruction,
                );
            }
        }
        if let Some(specs) = st.desired.remove(&chunk) {
            overlay::apply_line_snapshot(&mut *st, proto, &specs);
        }
    }

    /// Drain desired breakpoint snapshots into patched reality. Safe
    /// point: called from the VM thread only.
    pub fn drain_desired(&self, _vm: &mut LuaVM) {
        if !self.take_desired_dirty() {
            return;
        }
        let mut st = self.lock();
        overlay::drain_desired_locked(&mut *st);
    }
}
