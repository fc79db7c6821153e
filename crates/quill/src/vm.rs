//! The stack-based virtual machine.
//!
//! Executes [`Program`]s produced by the compiler with a fetch-decode-
//! execute loop over the byte-encoded instruction stream. All runtime
//! state lives here: the operand stack, the frame stack, the globals
//! value, the module cache, the writer chain, and the abort flag. The
//! compiler is pure translation; `operators`, `slice`, `methods`, and
//! `builtins` are stateless helpers the loop calls into.
//!
//! Frame locals occupy a reserved region of the operand stack starting at
//! the frame's base. Captured locals are promoted in place to
//! [`ObjectPtr`] cells by `OpGetLocalPtr`; `OpGetLocal`/`OpSetLocal` read
//! and write through a cell transparently when they meet one, so a frame
//! and the closures it produced observe the same storage.
//!
//! Exception handling uses explicit protected-region records, never Rust
//! unwinding: `SetupTry` pushes a record, raising walks the records of
//! each frame innermost-first, and one `Finalizer` per region resumes
//! whatever action (fall-through, re-raise, return) its finally block
//! interrupted.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::bytecode::{self, CompiledFunction, Opcode, Program, call_flags};
use crate::error::{Error, Result};
use crate::span::{SourceFile, Span};
use crate::value::{
    ErrorValue, ObjectPtr, ReaderHandle, RuntimeError, Value, ValueIter, ValueMap, WriterHandle,
    shared,
};

/// Resource ceilings enforced by the dispatch loop; exceeding one ends
/// the run without consulting catch handlers.
#[derive(Debug, Clone, Default)]
pub struct Limits {
    /// Maximum instructions per run.
    pub max_instructions: Option<u64>,
    /// Maximum frame-stack depth.
    pub max_recursion_depth: Option<usize>,
}

/// A clonable handle that aborts the machine it was handed to at the next
/// instruction boundary.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the machine; effective at the next instruction boundary.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the handle so the machine can run again.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-run inputs from the host.
#[derive(Default)]
pub struct RunOptions {
    /// The globals mapping (a `Dict` or `SyncDict` value). A fresh dict
    /// when absent.
    pub globals: Option<Value>,
    /// Positional script arguments, visible through `param` and
    /// `__args__`.
    pub args: Vec<Value>,
    /// Named script arguments.
    pub named_args: ValueMap,
    /// Cancellation flag.
    pub abort: Option<AbortHandle>,
    pub limits: Limits,
    /// Bottom of the output writer chain; process stdout when absent.
    pub stdout: Option<WriterHandle>,
    pub stderr: Option<WriterHandle>,
    pub stdin: Option<ReaderHandle>,
}

/// What a native callee receives: the machine (for re-entry and the
/// writer chain) plus argument views.
pub struct CallContext<'a> {
    pub vm: &'a mut Vm,
    pub args: Vec<Value>,
    pub named: Vec<(String, Value)>,
    /// The argument values are safe to retain beyond the call.
    pub safe_args: bool,
}

/// A pooled handle for host callbacks that re-enter the interpreter.
///
/// Re-entrancy on the owning thread reuses this machine's frame stack;
/// hosts driving callbacks from several threads take one invoker per
/// machine per thread.
pub struct Invoker<'vm> {
    vm: &'vm mut Vm,
    callable: Value,
}

impl Invoker<'_> {
    /// Run the callable to completion and return its result.
    pub fn invoke(
        &mut self,
        args: Vec<Value>,
        named: Vec<(String, Value)>,
    ) -> std::result::Result<Value, ErrorValue> {
        let callable = self.callable.clone();
        self.vm.invoke_with_named(&callable, args, named)
    }
}

// ---------------------------------------------------------------------------
// Frames and protected regions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum TryState {
    Active,
    InCatch,
    InFinally,
}

/// The action a finally block interrupted, resumed by `Finalizer`.
enum Pending {
    None,
    Raise(Raised),
    Return(Value),
}

struct TryRecord {
    /// Catch entry point; `0` means the region has no catch clause.
    catch_pc: usize,
    finally_pc: usize,
    /// Operand-stack depth at `SetupTry`.
    sp: usize,
    state: TryState,
    /// The error delivered to the catch clause, for bare re-raise.
    caught: Option<Value>,
    pending: Pending,
}

struct Frame {
    func: Arc<CompiledFunction>,
    /// The callable value this frame runs (`__callee__`).
    callee: Value,
    free: Vec<ObjectPtr>,
    ip: usize,
    /// Locals occupy `stack[base .. base + num_locals]`.
    base: usize,
    args: Vec<Value>,
    named_args: Vec<(String, Value)>,
    trys: Vec<TryRecord>,
    is_module: bool,
}

/// An in-flight raise: the error plus the trace accumulated so far,
/// innermost position first.
struct Raised {
    error: ErrorValue,
    trace: Vec<Span>,
}

impl Raised {
    fn from_value(value: Value) -> Self {
        match value {
            Value::Error(err) => Self { error: (*err).clone(), trace: Vec::new() },
            Value::RuntimeError(rt) => Self {
                error: rt.error.clone(),
                // Re-throws append to the existing trace, never reset it.
                trace: rt.trace.clone(),
            },
            other => Self {
                error: ErrorValue::new("error", other.to_print_string()),
                trace: Vec::new(),
            },
        }
    }

    fn into_runtime(self, file: Arc<SourceFile>) -> RuntimeError {
        RuntimeError { error: self.error, trace: self.trace, file }
    }
}

/// An in-memory sink for `obstart` buffering.
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// The machine
// ---------------------------------------------------------------------------

pub struct Vm {
    constants: Vec<Value>,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: Value,
    module_cache: Vec<Option<Value>>,
    writers: Vec<WriterHandle>,
    /// Buffers opened by `obstart`, innermost last.
    ob_buffers: Vec<Arc<Mutex<Vec<u8>>>>,
    stderr: WriterHandle,
    stdin: ReaderHandle,
    abort: AbortHandle,
    limits: Limits,
    instruction_count: u64,
    file: Arc<SourceFile>,
    run_args: Vec<Value>,
    run_named: Vec<(String, Value)>,
}

impl Vm {
    /// Build a machine for `program` with the given run options.
    pub fn new(program: &Program, opts: RunOptions) -> Self {
        let globals = match opts.globals {
            Some(v @ (Value::Dict(_) | Value::SyncDict(_))) => v,
            _ => Value::dict(ValueMap::new()),
        };
        Self {
            constants: program.constants.clone(),
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(8),
            globals,
            module_cache: vec![None; program.modules.len()],
            writers: vec![
                opts.stdout.unwrap_or_else(|| WriterHandle::new(io::stdout())),
            ],
            ob_buffers: Vec::new(),
            stderr: opts.stderr.unwrap_or_else(|| WriterHandle::new(io::stderr())),
            stdin: opts.stdin.unwrap_or_else(|| ReaderHandle::new(io::empty())),
            abort: opts.abort.unwrap_or_default(),
            limits: opts.limits,
            instruction_count: 0,
            file: program.file.clone(),
            run_args: opts.args,
            run_named: opts.named_args.into_iter().collect(),
        }
    }

    /// Compile-free convenience: run `program` to completion.
    pub fn run(program: &Program, opts: RunOptions) -> Result<Value> {
        let mut vm = Self::new(program, opts);
        vm.execute(program)
    }

    /// Execute the program's main function. The machine can be reused;
    /// its globals value persists across calls.
    pub fn execute(&mut self, program: &Program) -> Result<Value> {
        self.instruction_count = 0;
        let main = program.main.clone();
        let floor = self.frames.len();
        self.push_script_frame(main, false);
        match self.run_loop(floor) {
            Ok(value) => Ok(value),
            Err(raised) => Err(Error::Runtime(raised.into_runtime(self.file.clone()))),
        }
    }

    /// The globals value scripts read and write.
    pub fn globals(&self) -> &Value {
        &self.globals
    }

    /// Take an invoker for re-entrant calls from host code.
    pub fn invoker(&mut self, callable: Value) -> Invoker<'_> {
        Invoker { vm: self, callable }
    }

    // -- Writer chain ----------------------------------------------------

    pub(crate) fn write_out(&mut self, bytes: &[u8]) -> std::result::Result<(), ErrorValue> {
        let top = self.writers.last().expect("writer chain is never empty");
        top.write_all(bytes)
            .map_err(|e| ErrorValue::new("error", format!("write failed: {}", e)))
    }

    pub(crate) fn flush_out(&mut self) -> std::result::Result<(), ErrorValue> {
        let top = self.writers.last().expect("writer chain is never empty");
        top.flush()
            .map_err(|e| ErrorValue::new("error", format!("flush failed: {}", e)))
    }

    pub(crate) fn push_writer(&mut self, writer: WriterHandle) {
        self.writers.push(writer);
    }

    pub(crate) fn pop_writer(&mut self) -> Option<WriterHandle> {
        // The bottom sink stays.
        if self.writers.len() > 1 { self.writers.pop() } else { None }
    }

    pub(crate) fn push_buffer_writer(&mut self) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        self.ob_buffers.push(buf.clone());
        self.writers.push(WriterHandle::new(SharedBuffer(buf)));
    }

    pub(crate) fn pop_buffer_writer(&mut self) -> Option<Vec<u8>> {
        let buf = self.ob_buffers.pop()?;
        if self.writers.len() > 1 {
            self.writers.pop();
        }
        Some(std::mem::take(&mut *buf.lock()))
    }

    // -- Re-entry --------------------------------------------------------

    /// Call any callable value to completion and return its result. Used
    /// by builtins (`map`, proxies, methods) and host callbacks.
    pub fn invoke_value(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
    ) -> std::result::Result<Value, ErrorValue> {
        self.invoke_with_named(callee, args, Vec::new())
    }

    pub fn invoke_with_named(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        named: Vec<(String, Value)>,
    ) -> std::result::Result<Value, ErrorValue> {
        match callee {
            Value::Closure(_) | Value::Compiled(_) => {
                let floor = self.frames.len();
                self.begin_call(callee.clone(), args, named)?;
                // Native callees handled by begin_call leave their result
                // on the stack without a new frame.
                if self.frames.len() == floor {
                    return Ok(self.pop());
                }
                self.run_loop(floor).map_err(|raised| raised.error)
            }
            Value::Builtin(def) => {
                let mut ctx = CallContext { vm: self, args, named, safe_args: false };
                (def.func)(&mut ctx)
            }
            Value::HostFn(host) => {
                let func = host.func.clone();
                let mut ctx = CallContext { vm: self, args, named, safe_args: false };
                func(&mut ctx)
            }
            Value::CallWrapper(wrapper) => {
                let mut full_args = wrapper.args.clone();
                full_args.extend(args);
                let mut full_named = wrapper.named.clone();
                full_named.extend(named);
                let inner = wrapper.callee.clone();
                self.invoke_with_named(&inner, full_args, full_named)
            }
            Value::ObjectType(ty) => crate::builtins::construct_object(ty, &args),
            other => Err(ErrorValue::not_callable(other.type_name())),
        }
    }

    /// Indexing that can re-enter user code for proxy values.
    fn index_get_dispatch(
        &mut self,
        object: &Value,
        index: &Value,
    ) -> std::result::Result<Value, ErrorValue> {
        match object {
            Value::GetProxy(proxy) => {
                let handler = proxy.handler.clone();
                self.invoke_value(&handler, vec![index.clone()])
            }
            other => other.index_get(index),
        }
    }

    fn index_set_dispatch(
        &mut self,
        object: &Value,
        index: &Value,
        value: Value,
    ) -> std::result::Result<(), ErrorValue> {
        match object {
            Value::SetProxy(proxy) => {
                let handler = proxy.handler.clone();
                self.invoke_value(&handler, vec![index.clone(), value])?;
                Ok(())
            }
            other => other.index_set(index, value),
        }
    }

    /// Deletion with proxy support, used by the `delete` builtin.
    pub(crate) fn index_delete_dispatch(
        &mut self,
        object: &Value,
        index: &Value,
    ) -> std::result::Result<(), ErrorValue> {
        match object {
            Value::DelProxy(proxy) => {
                let handler = proxy.handler.clone();
                self.invoke_value(&handler, vec![index.clone()])?;
                Ok(())
            }
            other => other.index_delete(index),
        }
    }

    // -----------------------------------------------------------------------
    // The dispatch loop
    // -----------------------------------------------------------------------

    /// Run until the frame stack drops back to `floor`; returns the value
    /// produced by the frame that was above it.
    fn run_loop(&mut self, floor: usize) -> std::result::Result<Value, Raised> {
        loop {
            // Cancellation and ceilings are checked between instructions
            // and bypass the protected-region machinery entirely.
            if self.abort.is_aborted() {
                return Err(self.fatal(ErrorValue::aborted()));
            }
            self.instruction_count += 1;
            if let Some(limit) = self.limits.max_instructions {
                if self.instruction_count > limit {
                    return Err(self.fatal(ErrorValue::new(
                        "VMError",
                        format!("instruction limit {} exceeded", limit),
                    )));
                }
            }

            let frame = self.frames.last().expect("running frame");
            let ip0 = frame.ip;
            if ip0 >= frame.func.instructions.len() {
                // Falling off the end is an implicit `return nil`.
                if let Some(value) = self.do_return(Value::Nil, floor) {
                    return Ok(value);
                }
                continue;
            }

            let ins = &frame.func.instructions;
            let op = Opcode::from_byte(ins[ip0]).expect("valid opcode");
            let (operands, read) = bytecode::read_operands(op, ins, ip0 + 1);
            self.frames.last_mut().expect("running frame").ip = ip0 + 1 + read;

            match self.dispatch(op, &operands, floor) {
                Ok(()) => {}
                Err(Flow::Finished(value)) => return Ok(value),
                Err(Flow::Raise(value)) => {
                    let raised = Raised::from_value(value);
                    self.unwind(raised, floor, ip0)?;
                }
                Err(Flow::Resume(raised)) => {
                    // A finally block completed with a pending raise; the
                    // trace is already populated, so resume unwinding
                    // without re-recording this position.
                    self.unwind_inner(raised, floor)?;
                }
            }
        }
    }

    fn fatal(&self, error: ErrorValue) -> Raised {
        let trace = self
            .frames
            .last()
            .map(|f| vec![f.func.span_at(f.ip as u32)])
            .unwrap_or_default();
        Raised { error, trace }
    }

    /// Route a raise at instruction `at_ip` through the protected-region
    /// records. Returns `Ok(())` when a handler or finally took over;
    /// `Err` propagates out of this `run_loop` invocation.
    fn unwind(
        &mut self,
        mut raised: Raised,
        floor: usize,
        at_ip: usize,
    ) -> std::result::Result<(), Raised> {
        let frame = self.frames.last().expect("raising frame");
        raised.trace.push(frame.func.span_at(at_ip as u32));
        self.unwind_inner(raised, floor)
    }

    fn unwind_inner(&mut self, mut raised: Raised, floor: usize) -> std::result::Result<(), Raised> {
        loop {
            // Inspect the innermost record of the current frame without
            // holding a borrow across the mutations below.
            enum Action {
                Catch { sp: usize, pc: usize },
                Finally { sp: usize, pc: usize },
                DropRecord,
                PopFrame,
            }
            let action = {
                let frame = self.frames.last_mut().expect("unwinding frame");
                match frame.trys.last() {
                    Some(r) if r.state == TryState::Active && r.catch_pc != 0 => {
                        Action::Catch { sp: r.sp, pc: r.catch_pc }
                    }
                    Some(r) if r.state != TryState::InFinally => {
                        Action::Finally { sp: r.sp, pc: r.finally_pc }
                    }
                    // An error inside a finally replaces whatever that
                    // block was going to resume.
                    Some(_) => Action::DropRecord,
                    None => Action::PopFrame,
                }
            };
            match action {
                Action::Catch { sp, pc } => {
                    let caught = Value::RuntimeError(Arc::new(
                        Raised {
                            error: raised.error.clone(),
                            trace: raised.trace.clone(),
                        }
                        .into_runtime(self.file.clone()),
                    ));
                    self.stack.truncate(sp);
                    let frame = self.frames.last_mut().expect("frame");
                    frame.ip = pc;
                    let record = frame.trys.last_mut().expect("record");
                    record.state = TryState::InCatch;
                    record.caught = Some(caught);
                    return Ok(());
                }
                Action::Finally { sp, pc } => {
                    self.stack.truncate(sp);
                    let frame = self.frames.last_mut().expect("frame");
                    frame.ip = pc;
                    let record = frame.trys.last_mut().expect("record");
                    record.state = TryState::InFinally;
                    record.pending = Pending::Raise(raised);
                    return Ok(());
                }
                Action::DropRecord => {
                    self.frames.last_mut().expect("frame").trys.pop();
                }
                Action::PopFrame => {
                    let finished = self.frames.pop().expect("unwinding frame");
                    self.stack.truncate(finished.base);
                    if self.frames.len() <= floor {
                        return Err(raised);
                    }
                    let caller = self.frames.last().expect("caller frame");
                    raised
                        .trace
                        .push(caller.func.span_at(caller.ip.saturating_sub(1) as u32));
                }
            }
        }
    }

    /// Return `value` from the current frame, detouring through any
    /// pending finally blocks. `Some` ends the `run_loop` invocation.
    fn do_return(&mut self, value: Value, floor: usize) -> Option<Value> {
        loop {
            enum Action {
                Finally { sp: usize, pc: usize },
                DropRecord,
                Return,
            }
            let action = {
                let frame = self.frames.last().expect("returning frame");
                match frame.trys.last() {
                    Some(r) if r.state != TryState::InFinally => {
                        Action::Finally { sp: r.sp, pc: r.finally_pc }
                    }
                    // `return` inside the finally body overrides that
                    // region's pending action.
                    Some(_) => Action::DropRecord,
                    None => Action::Return,
                }
            };
            match action {
                Action::Finally { sp, pc } => {
                    self.stack.truncate(sp);
                    let frame = self.frames.last_mut().expect("frame");
                    frame.ip = pc;
                    let record = frame.trys.last_mut().expect("record");
                    record.state = TryState::InFinally;
                    record.pending = Pending::Return(value);
                    return None;
                }
                Action::DropRecord => {
                    self.frames.last_mut().expect("frame").trys.pop();
                }
                Action::Return => {
                    let finished = self.frames.pop().expect("returning frame");
                    self.stack.truncate(finished.base);
                    if self.frames.len() <= floor {
                        return Some(value);
                    }
                    self.stack.push(value);
                    return None;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Instruction execution
    // -----------------------------------------------------------------------

    fn dispatch(
        &mut self,
        op: Opcode,
        operands: &[usize],
        floor: usize,
    ) -> std::result::Result<(), Flow> {
        use Opcode::*;
        match op {
            NoOp => {}
            Nil => self.stack.push(Value::Nil),
            True => self.stack.push(Value::Bool(true)),
            False => self.stack.push(Value::Bool(false)),
            Yes => self.stack.push(Value::Flag(true)),
            No => self.stack.push(Value::Flag(false)),
            Pop => {
                self.stack.pop();
            }
            Constant => {
                let value = self.constants[operands[0]].clone();
                self.stack.push(value);
            }

            // -- Globals and locals ---------------------------------------
            GetGlobal => {
                let name = self.constant_name(operands[0])?;
                let value = match &self.globals {
                    Value::Dict(map) | Value::SyncDict(map) => {
                        map.read().get(name.as_str()).cloned().unwrap_or(Value::Nil)
                    }
                    _ => Value::Nil,
                };
                self.stack.push(value);
            }
            SetGlobal => {
                let name = self.constant_name(operands[0])?;
                let value = self.pop();
                if let Value::Dict(map) | Value::SyncDict(map) = &self.globals {
                    map.write().insert(name, value);
                }
            }
            GetLocal => {
                let slot = self.frame().base + operands[0];
                let value = match &self.stack[slot] {
                    Value::Ptr(cell) => cell.get(),
                    other => other.clone(),
                };
                self.stack.push(value);
            }
            SetLocal => {
                let value = self.pop();
                let slot = self.frame().base + operands[0];
                if let Value::Ptr(cell) = &self.stack[slot] {
                    cell.set(value);
                } else {
                    self.stack[slot] = value;
                }
            }
            DefineLocal => {
                // A fresh binding always overwrites the slot, cells
                // included.
                let value = self.pop();
                let slot = self.frame().base + operands[0];
                self.stack[slot] = value;
            }
            GetLocalPtr => {
                let slot = self.frame().base + operands[0];
                let cell = match self.stack[slot].clone() {
                    Value::Ptr(cell) => cell,
                    other => {
                        let cell = ObjectPtr::new(other);
                        self.stack[slot] = Value::Ptr(cell.clone());
                        cell
                    }
                };
                self.stack.push(Value::Ptr(cell));
            }
            GetFree => {
                let value = self.frame().free[operands[0]].get();
                self.stack.push(value);
            }
            SetFree => {
                let value = self.pop();
                self.frame().free[operands[0]].set(value);
            }
            GetFreePtr => {
                let cell = self.frame().free[operands[0]].clone();
                self.stack.push(Value::Ptr(cell));
            }
            GetBuiltin => {
                let def = &crate::builtins::BUILTINS[operands[0]];
                self.stack.push(Value::Builtin(def));
            }

            // -- Operators ------------------------------------------------
            BinaryOp => {
                let op = bytecode::binop_from_byte(operands[0] as u8)
                    .ok_or_else(|| raise(ErrorValue::invalid_operator("unknown operator byte")))?;
                let rhs = self.pop();
                let lhs = self.pop();
                let result = crate::operators::binary_op(op, &lhs, &rhs).map_err(raise)?;
                self.stack.push(result);
            }
            Unary => {
                let op = bytecode::unop_from_byte(operands[0] as u8)
                    .ok_or_else(|| raise(ErrorValue::invalid_operator("unknown operator byte")))?;
                let operand = self.pop();
                let result = crate::operators::unary_op(op, &operand).map_err(raise)?;
                self.stack.push(result);
            }
            Equal => {
                let rhs = self.pop();
                let lhs = self.pop();
                self.stack.push(Value::Bool(lhs.equal(&rhs)));
            }
            NotEqual => {
                let rhs = self.pop();
                let lhs = self.pop();
                self.stack.push(Value::Bool(!lhs.equal(&rhs)));
            }
            IsNil => {
                let value = self.pop();
                self.stack.push(Value::Bool(value.is_nil()));
            }
            NotIsNil => {
                let value = self.pop();
                self.stack.push(Value::Bool(!value.is_nil()));
            }

            // -- Jumps ----------------------------------------------------
            Jump => self.jump(operands[0]),
            JumpFalsy => {
                let value = self.pop();
                if value.is_falsy() {
                    self.jump(operands[0]);
                }
            }
            AndJump => {
                // Short-circuit `&&`: a falsy left operand stays as the
                // result.
                if self.top().is_falsy() {
                    self.jump(operands[0]);
                } else {
                    self.stack.pop();
                }
            }
            OrJump => {
                if !self.top().is_falsy() {
                    self.jump(operands[0]);
                } else {
                    self.stack.pop();
                }
            }
            JumpNil => {
                if self.top().is_nil() {
                    self.jump(operands[0]);
                } else {
                    self.stack.pop();
                }
            }
            JumpNotNil => {
                if !self.top().is_nil() {
                    self.jump(operands[0]);
                } else {
                    self.stack.pop();
                }
            }

            // -- Containers -----------------------------------------------
            Array => {
                let n = operands[0];
                let start = self.stack.len() - n;
                let items: Vec<Value> = self.stack.drain(start..).collect();
                self.stack.push(Value::array(items));
            }
            Dict => {
                let n = operands[0];
                let start = self.stack.len() - n * 2;
                let raw: Vec<Value> = self.stack.drain(start..).collect();
                let mut map = ValueMap::with_capacity(n);
                for pair in raw.chunks(2) {
                    let key = match &pair[0] {
                        Value::Str(s) | Value::RawStr(s) => s.to_string(),
                        other => other.to_print_string(),
                    };
                    map.insert(key, pair[1].clone());
                }
                self.stack.push(Value::dict(map));
            }
            KeyValue => {
                let value = if operands[0] == 1 { self.pop() } else { Value::Flag(true) };
                let key = self.pop();
                self.stack.push(Value::key_value(key, value));
            }
            KeyValueArray => {
                let n = operands[0];
                let start = self.stack.len() - n;
                let raw: Vec<Value> = self.stack.drain(start..).collect();
                let mut pairs = Vec::with_capacity(n);
                for item in raw {
                    match item {
                        Value::KeyValue(pair) => pairs.push((pair.0.clone(), pair.1.clone())),
                        other => {
                            return Err(raise(ErrorValue::type_error(format!(
                                "keyValueArray element must be a keyValue, not {}",
                                other.type_name()
                            ))));
                        }
                    }
                }
                self.stack.push(Value::KeyValueArray(shared(pairs)));
            }

            // -- Indexing -------------------------------------------------
            GetIndex => {
                let n = operands[0];
                let start = self.stack.len() - n;
                let indices: Vec<Value> = self.stack.drain(start..).collect();
                let mut object = self.pop();
                for index in &indices {
                    object = self.index_get_dispatch(&object, index).map_err(raise)?;
                }
                self.stack.push(object);
            }
            SetIndex => {
                let value = self.pop();
                let index = self.pop();
                let object = self.pop();
                self.index_set_dispatch(&object, &index, value).map_err(raise)?;
            }
            SliceIndex => {
                let high = self.pop();
                let low = self.pop();
                let object = self.pop();
                let result = crate::slice::slice_value(&object, &low, &high).map_err(raise)?;
                self.stack.push(result);
            }

            // -- Iteration ------------------------------------------------
            IterInit => {
                let value = self.pop();
                let iter = value
                    .iterate()
                    .ok_or_else(|| raise(ErrorValue::not_iterable(value.type_name())))?;
                self.stack.push(Value::Iter(shared(iter)));
            }
            IterNextElse => {
                let has_next = self.with_top_iter(|iter| iter.advance())?;
                if has_next {
                    self.jump(operands[0]);
                } else {
                    self.stack.pop();
                    self.jump(operands[1]);
                }
            }
            IterNext => {
                let has_next = self.with_top_iter(|iter| iter.advance())?;
                self.stack.push(Value::Bool(has_next));
            }
            IterKey => {
                let key = self.with_top_iter(|iter| iter.key())?;
                self.stack.push(key);
            }
            IterValue => {
                let value = self.with_top_iter(|iter| iter.value())?.map_err(raise)?;
                self.stack.push(value);
            }

            // -- Calls ----------------------------------------------------
            Call => {
                self.op_call(operands[0], operands[1] as u8, false)?;
            }
            CallName => {
                self.op_call(operands[0], operands[1] as u8, true)?;
            }
            Closure => {
                let k = operands[1];
                let start = self.stack.len() - k;
                let cells: Vec<Value> = self.stack.drain(start..).collect();
                let mut free = Vec::with_capacity(k);
                for cell in cells {
                    match cell {
                        Value::Ptr(ptr) => free.push(ptr),
                        other => {
                            return Err(raise(ErrorValue::type_error(format!(
                                "closure capture must be a cell, not {}",
                                other.type_name()
                            ))));
                        }
                    }
                }
                let func = match &self.constants[operands[0]] {
                    Value::Compiled(f) => f.clone(),
                    other => {
                        return Err(raise(ErrorValue::type_error(format!(
                            "closure constant must be a function, not {}",
                            other.type_name()
                        ))));
                    }
                };
                self.stack.push(Value::Closure(Arc::new(crate::value::Closure { func, free })));
            }
            Return => {
                let value = if operands[0] == 1 { self.pop() } else { Value::Nil };
                if let Some(result) = self.do_return(value, floor) {
                    return Err(Flow::Finished(result));
                }
            }

            // -- Exceptions -----------------------------------------------
            Throw => {
                if operands[0] == 1 {
                    let value = self.pop();
                    return Err(Flow::Raise(value));
                }
                // Bare re-raise: the innermost caught error.
                let caught = self
                    .frame_ref()
                    .trys
                    .iter()
                    .rev()
                    .find_map(|r| r.caught.clone())
                    .ok_or_else(|| raise(ErrorValue::new("error", "no active error to re-throw")))?;
                return Err(Flow::Raise(caught));
            }
            SetupTry => {
                let sp = self.stack.len();
                let record = TryRecord {
                    catch_pc: operands[0],
                    finally_pc: operands[1],
                    sp,
                    state: TryState::Active,
                    caught: None,
                    pending: Pending::None,
                };
                self.frame().trys.push(record);
            }
            SetupCatch => {
                let caught = self
                    .frame_ref()
                    .trys
                    .last()
                    .and_then(|r| r.caught.clone())
                    .unwrap_or(Value::Nil);
                self.stack.push(caught);
            }
            SetupFinally => {
                if let Some(record) = self.frame().trys.last_mut() {
                    record.state = TryState::InFinally;
                }
            }
            Finalizer => {
                if let Some(record) = self.frame().trys.pop() {
                    match record.pending {
                        Pending::None => {}
                        Pending::Raise(raised) => return Err(Flow::Resume(raised)),
                        Pending::Return(value) => {
                            if let Some(result) = self.do_return(value, floor) {
                                return Err(Flow::Finished(result));
                            }
                        }
                    }
                }
            }

            // -- Modules --------------------------------------------------
            LoadModule => {
                let module_idx = operands[1];
                match self.module_cache.get(module_idx).cloned().flatten() {
                    Some(value) => self.stack.push(value),
                    None => {
                        let func = match &self.constants[operands[0]] {
                            Value::Compiled(f) => f.clone(),
                            other => {
                                return Err(raise(ErrorValue::type_error(format!(
                                    "module constant must be a function, not {}",
                                    other.type_name()
                                ))));
                            }
                        };
                        self.push_script_frame(func, true);
                    }
                }
            }
            StoreModule => {
                let value = self.top().clone();
                let module_idx = operands[0];
                if module_idx < self.module_cache.len() {
                    self.module_cache[module_idx] = Some(value);
                }
            }

            // -- Frame introspection --------------------------------------
            Callee => {
                let callee = self.frame_ref().callee.clone();
                self.stack.push(callee);
            }
            Args => {
                let args = self.frame_ref().args.clone();
                self.stack.push(Value::array(args));
            }
            NamedArgs => {
                let map: ValueMap = self.frame_ref().named_args.iter().cloned().collect();
                self.stack.push(Value::dict(map));
            }
            DotName => {
                let name = self.frame_ref().func.name.clone();
                self.stack.push(Value::str(name));
            }
            DotFile => {
                let name = self.file.name.clone();
                self.stack.push(Value::str(name));
            }
            IsModule => {
                let is_module = self.frame_ref().is_module;
                self.stack.push(Value::Bool(is_module));
            }

            // -- Standard I/O ---------------------------------------------
            StdIn => {
                let handle = self.stdin.clone();
                self.stack.push(Value::Reader(handle));
            }
            StdOut | TextWriter => {
                let top = self.writers.last().expect("writer chain").clone();
                self.stack.push(Value::Writer(top));
            }
            StdErr => {
                let handle = self.stderr.clone();
                self.stack.push(Value::Writer(handle));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    fn op_call(&mut self, argc: usize, flags: u8, named_call: bool) -> std::result::Result<(), Flow> {
        // Named arguments: the merge collection sits above the bundle.
        let mut named: Vec<(String, Value)> = Vec::new();
        if flags & call_flags::VAR_NAMED_ARGS != 0 {
            let extra = self.pop();
            named = collect_named(&extra).map_err(raise)?;
        }
        if flags & call_flags::NAMED_ARGS != 0 {
            let bundle = self.pop();
            let mut base = collect_named(&bundle).map_err(raise)?;
            base.extend(named);
            named = base;
        }

        // Positional arguments; a trailing array expands under VAR_ARGS.
        let mut rest = Vec::new();
        if flags & call_flags::VAR_ARGS != 0 {
            let spread = self.pop();
            match &spread {
                Value::Array(items) => rest = items.read().clone(),
                Value::Nil => {}
                other => {
                    return Err(raise(ErrorValue::type_error(format!(
                        "cannot expand {} as arguments",
                        other.type_name()
                    ))));
                }
            }
        }
        let start = self.stack.len() - argc;
        let mut args: Vec<Value> = self.stack.drain(start..).collect();
        args.extend(rest);

        if named_call {
            let name = match self.pop() {
                Value::Str(s) | Value::RawStr(s) => s.to_string(),
                other => other.to_print_string(),
            };
            let receiver = self.pop();
            let mut ctx = CallContext { vm: self, args, named, safe_args: false };
            let result = crate::methods::call_name(&mut ctx, &receiver, &name).map_err(raise)?;
            self.stack.push(result);
            return Ok(());
        }

        let callee = self.pop();
        self.begin_call(callee, args, named).map_err(raise)
    }

    /// Start a call: push a frame for compiled callees, or run native
    /// callees to completion and push their result.
    fn begin_call(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        named: Vec<(String, Value)>,
    ) -> std::result::Result<(), ErrorValue> {
        match &callee {
            Value::Closure(closure) => {
                let func = closure.func.clone();
                let free = closure.free.clone();
                self.push_frame(callee, func, free, args, named)
            }
            Value::Compiled(func) => {
                let func = func.clone();
                self.push_frame(callee, func, Vec::new(), args, named)
            }
            Value::Builtin(def) => {
                let func = def.func;
                let mut ctx = CallContext { vm: self, args, named, safe_args: false };
                let result = func(&mut ctx)?;
                self.stack.push(result);
                Ok(())
            }
            Value::HostFn(host) => {
                let func = host.func.clone();
                let mut ctx = CallContext { vm: self, args, named, safe_args: false };
                let result = func(&mut ctx)?;
                self.stack.push(result);
                Ok(())
            }
            Value::CallWrapper(wrapper) => {
                let mut full_args = wrapper.args.clone();
                full_args.extend(args);
                let mut full_named = wrapper.named.clone();
                full_named.extend(named);
                let inner = wrapper.callee.clone();
                self.begin_call(inner, full_args, full_named)
            }
            Value::ObjectType(ty) => {
                let result = crate::builtins::construct_object(ty, &args)?;
                self.stack.push(result);
                Ok(())
            }
            other => Err(ErrorValue::not_callable(other.type_name())),
        }
    }

    /// Validate arity, bind parameters into the local slots, and push the
    /// frame.
    fn push_frame(
        &mut self,
        callee: Value,
        func: Arc<CompiledFunction>,
        free: Vec<ObjectPtr>,
        args: Vec<Value>,
        named: Vec<(String, Value)>,
    ) -> std::result::Result<(), ErrorValue> {
        if let Some(limit) = self.limits.max_recursion_depth {
            if self.frames.len() >= limit {
                return Err(ErrorValue::new(
                    "VMError",
                    format!("recursion limit {} exceeded", limit),
                ));
            }
        }

        let num_params = func.num_params as usize;
        if func.variadic {
            if args.len() < num_params {
                return Err(ErrorValue::wrong_num_arguments(format!(
                    "{}() expects at least {} argument(s), got {}",
                    func.name,
                    num_params,
                    args.len()
                )));
            }
        } else if args.len() != num_params {
            return Err(ErrorValue::wrong_num_arguments(format!(
                "{}() expects {} argument(s), got {}",
                func.name,
                num_params,
                args.len()
            )));
        }

        // Named parameters match by name; extras collect into the named-
        // rest slot or are rejected. Absent names take their default
        // thunk's value, evaluated in a sub-frame first.
        let mut named_slots = Vec::with_capacity(func.named_params.len());
        let mut remaining = named.clone();
        for (i, param) in func.named_params.iter().enumerate() {
            match remaining.iter().position(|(name, _)| name == param) {
                Some(at) => named_slots.push(remaining.remove(at).1),
                None => match func.defaults.get(i).cloned().flatten() {
                    Some(thunk) => {
                        let value = self.invoke_value(&Value::Compiled(thunk), Vec::new())?;
                        named_slots.push(value);
                    }
                    None => named_slots.push(Value::Nil),
                },
            }
        }
        if !remaining.is_empty() && !func.var_named {
            return Err(ErrorValue::wrong_num_arguments(format!(
                "{}() got unexpected named argument {:?}",
                func.name, remaining[0].0
            )));
        }

        // Slot layout: positionals, variadic rest, named, named rest, then
        // plain locals zeroed to nil.
        let base = self.stack.len();
        self.stack.extend(args.iter().take(num_params).cloned());
        if func.variadic {
            self.stack.push(Value::array(args[num_params..].to_vec()));
        }
        self.stack.extend(named_slots);
        if func.var_named {
            let map: ValueMap = remaining.into_iter().collect();
            self.stack.push(Value::dict(map));
        }
        let occupied = self.stack.len() - base;
        for _ in occupied..func.num_locals as usize {
            self.stack.push(Value::Nil);
        }

        self.frames.push(Frame {
            func,
            callee,
            free,
            ip: 0,
            base,
            args,
            named_args: named,
            trys: Vec::new(),
            is_module: false,
        });
        Ok(())
    }

    /// Push the frame for the file body or a module body: no parameter
    /// binding; the run arguments become the frame's argument views.
    fn push_script_frame(&mut self, func: Arc<CompiledFunction>, is_module: bool) {
        let base = self.stack.len();
        for _ in 0..func.num_locals {
            self.stack.push(Value::Nil);
        }
        self.frames.push(Frame {
            callee: Value::Compiled(func.clone()),
            func,
            free: Vec::new(),
            ip: 0,
            base,
            args: self.run_args.clone(),
            named_args: self.run_named.clone(),
            trys: Vec::new(),
            is_module,
        });
    }

    // -----------------------------------------------------------------------
    // Small helpers
    // -----------------------------------------------------------------------

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    fn top(&self) -> &Value {
        self.stack.last().unwrap_or(&Value::Nil)
    }

    fn jump(&mut self, target: usize) {
        self.frames.last_mut().expect("frame").ip = target;
    }

    fn frame(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame")
    }

    fn frame_ref(&self) -> &Frame {
        self.frames.last().expect("frame")
    }

    fn constant_name(&self, idx: usize) -> std::result::Result<String, Flow> {
        match &self.constants[idx] {
            Value::Str(s) | Value::RawStr(s) => Ok(s.to_string()),
            other => Err(raise(ErrorValue::type_error(format!(
                "name constant must be a string, not {}",
                other.type_name()
            )))),
        }
    }

    fn with_top_iter<T>(
        &mut self,
        f: impl FnOnce(&mut ValueIter) -> T,
    ) -> std::result::Result<T, Flow> {
        match self.stack.last() {
            Some(Value::Iter(iter)) => {
                let iter = iter.clone();
                let mut guard = iter.write();
                Ok(f(&mut guard))
            }
            other => {
                let found = other
                    .map(|v| v.type_name().into_owned())
                    .unwrap_or_else(|| "nothing".to_string());
                Err(raise(ErrorValue::type_error(format!(
                    "expected an iterator on the stack, found {}",
                    found
                ))))
            }
        }
    }
}

/// Dispatch-level control flow escaping the plain "execute and continue"
/// path.
enum Flow {
    /// A value was thrown; route through the protected regions.
    Raise(Value),
    /// A finally block finished with a pending raise whose trace is
    /// already recorded.
    Resume(Raised),
    /// The frame the loop was entered for returned.
    Finished(Value),
}

fn raise(error: ErrorValue) -> Flow {
    Flow::Raise(Value::Error(Arc::new(error)))
}

/// Read a named-argument collection (`KeyValueArray`, `Dict`) into pairs.
fn collect_named(value: &Value) -> std::result::Result<Vec<(String, Value)>, ErrorValue> {
    match value {
        Value::KeyValueArray(items) => items
            .read()
            .iter()
            .map(|(k, v)| match k {
                Value::Str(s) | Value::RawStr(s) => Ok((s.to_string(), v.clone())),
                other => Err(ErrorValue::type_error(format!(
                    "named argument name must be a string, not {}",
                    other.type_name()
                ))),
            })
            .collect(),
        Value::Dict(map) | Value::SyncDict(map) => Ok(map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()),
        Value::Nil => Ok(Vec::new()),
        other => Err(ErrorValue::type_error(format!(
            "cannot expand {} as named arguments",
            other.type_name()
        ))),
    }
}
