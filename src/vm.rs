//! The Ark virtual machine.
//!
//! The VM is a **stack-based interpreter** executing the flat page bytes of a
//! loaded [`Image`].  It maintains:
//!
//! - a value stack shared across all calls,
//! - a frame stack ([`Frame`]) recording return addresses and how many scopes
//!   each call pushed,
//! - a scope chain: a stack of shared [`Scope`] vectors, walked from the
//!   innermost scope outwards for every variable access.
//!
//! # Closures
//!
//! `CAPTURE` copies variables into a lazily created saved scope, and
//! `SAVE_ENV` saves the whole innermost scope; either way the saved scope is
//! consumed by the next `LOAD_CONST` that materialises a page-address
//! constant, becoming the closure's captured scope.  Calling the closure
//! pushes the captured scope (then a fresh one) onto the chain, so the body
//! sees the captured variables, and mutations through `SET` are observed by
//! every holder of the scope.
//!
//! # Termination
//!
//! `HALT` and the return of the root frame both stop the loop; the value left
//! on top of the stack (or `Nil`) is the program's result.  The first runtime
//! error aborts execution and is reported with instruction/page context.

use std::fmt;
use std::path::Path;

use tracing::{debug, trace};

use crate::bytecode::{ConstValue, Instruction};
use crate::container::Image;
use crate::value::{NativeFn, Scope, ScopeRef, Value};
use crate::{builtins, ArkError};

// ─────────────────────────────────────────────────────────────────────────────
// Runtime error
// ─────────────────────────────────────────────────────────────────────────────

/// A runtime error raised by the VM, with the instruction context it
/// happened at.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    /// Instruction offset within the page at the time of the error.
    pub ip: usize,
    /// Page the VM was executing.
    pub page: usize,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at instruction {}, page {})", self.message, self.ip, self.page)
    }
}

impl std::error::Error for RuntimeError {}

type VmResult<T> = Result<T, RuntimeError>;

// ─────────────────────────────────────────────────────────────────────────────
// Module loader
// ─────────────────────────────────────────────────────────────────────────────

/// Host-provided resolver for `PLUGIN`: takes the module path recorded at
/// compile time and returns the names it exports.
///
/// Module resolution is an embedding concern (shared libraries, embedded
/// registries, …); the VM only merges the returned names into the root scope.
pub type ModuleLoader = Box<dyn FnMut(&str) -> Result<Vec<(String, Value)>, String>>;

// ─────────────────────────────────────────────────────────────────────────────
// Frame
// ─────────────────────────────────────────────────────────────────────────────

/// One active call: where to return to, where the callee's stack region
/// begins, and how many scopes to unwind on return.
struct Frame {
    ret_page: usize,
    ret_ip: usize,
    stack_base: usize,
    scopes_to_pop: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Vm
// ─────────────────────────────────────────────────────────────────────────────

/// The Ark virtual machine.
///
/// Feed it a container with [`Vm::feed`] or [`Vm::feed_bytes`], optionally
/// bind host functions with [`Vm::load_function`], then [`Vm::run`].
pub struct Vm {
    /// Keep the root scope alive across `run`/`feed` cycles.
    persist: bool,

    // Materialised from the container by the loader.
    symbols: Vec<String>,
    constants: Vec<ConstValue>,
    /// Pre-built values for non-function constants, indexed like `constants`.
    const_cache: Vec<Value>,
    pages: Vec<u8>,
    page_offsets: Vec<usize>,
    loaded: bool,

    /// The builtin registry, in ABI order.
    builtins: Vec<(&'static str, Value)>,
    /// Host functions to merge into the root scope at startup.
    bound: Vec<(String, NativeFn)>,
    /// Module resolver for `PLUGIN`.
    loader: Option<ModuleLoader>,
    /// Paths already handed to the loader; a module is loaded at most once.
    loaded_plugins: Vec<String>,

    // Execution state.
    ip: usize,
    page: usize,
    running: bool,
    last_sym_loaded: u16,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    scopes: Vec<ScopeRef>,
    saved_scope: Option<ScopeRef>,
    /// Scopes pushed by `GET_FIELD` for the upcoming `CALL`; folded into the
    /// callee frame's unwind count.
    pending_scopes: usize,
}

impl Vm {
    /// Create a VM.  With `persist` set, the root scope survives across
    /// successive [`Vm::run`] calls (and reloads), so global state carries
    /// over between programs sharing a symbol layout.
    pub fn new(persist: bool) -> Self {
        Self {
            persist,
            symbols: Vec::new(),
            constants: Vec::new(),
            const_cache: Vec::new(),
            pages: Vec::new(),
            page_offsets: Vec::new(),
            loaded: false,
            builtins: builtins::all(),
            bound: Vec::new(),
            loader: None,
            loaded_plugins: Vec::new(),
            ip: 0,
            page: 0,
            running: false,
            last_sym_loaded: 0,
            stack: Vec::new(),
            frames: Vec::new(),
            scopes: Vec::new(),
            saved_scope: None,
            pending_scopes: 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────

    /// Read and verify a container file.
    pub fn feed(&mut self, path: impl AsRef<Path>) -> Result<(), ArkError> {
        let bytes = std::fs::read(path.as_ref())?;
        self.feed_bytes(&bytes)?;
        Ok(())
    }

    /// Load and verify a container from memory.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Result<(), ArkError> {
        let image = Image::read(bytes)?;
        debug!(
            symbols = image.symbols.len(),
            constants = image.constants.len(),
            pages = image.page_count(),
            plugins = image.plugins.len(),
            "container loaded"
        );

        self.const_cache = image
            .constants
            .iter()
            .map(|constant| match constant {
                ConstValue::Number(n) => Value::Number(*n),
                ConstValue::Str(s) => Value::string(s.clone()),
                // Function constants are materialised per LOAD_CONST so each
                // closure can take the saved scope of its creation site.
                ConstValue::PageAddr(_) => Value::Undefined,
            })
            .collect();
        self.symbols = image.symbols;
        self.constants = image.constants;
        self.pages = image.pages;
        self.page_offsets = image.page_offsets;
        self.loaded = true;
        Ok(())
    }

    /// Bind a host function under `name`.
    ///
    /// At startup the name is resolved through the symbol table and written
    /// into the root scope; a name the program never mentions is ignored.
    pub fn load_function(&mut self, name: impl Into<String>, function: NativeFn) {
        self.bound.push((name.into(), function));
    }

    /// Install the module resolver used by `PLUGIN` instructions.
    pub fn set_module_loader(&mut self, loader: ModuleLoader) {
        self.loader = Some(loader);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    /// Execute page 0 from offset 0 and return the program's final value.
    pub fn run(&mut self) -> VmResult<Value> {
        if !self.loaded {
            return Err(self.error("no bytecode was fed to the virtual machine"));
        }
        self.init();
        self.running = true;
        let result = self.dispatch();
        self.running = false;
        match &result {
            Ok(value) => debug!(%value, "execution finished"),
            Err(error) => debug!(%error, "execution aborted"),
        }
        result
    }

    /// Reset the execution state, keeping the root scope when persistent.
    fn init(&mut self) {
        let symbol_count = self.symbols.len();
        if self.persist && !self.scopes.is_empty() {
            self.scopes.truncate(1);
            self.scopes[0].borrow_mut().grow(symbol_count);
        } else {
            self.scopes = vec![Scope::shared(symbol_count)];
        }

        self.stack.clear();
        self.frames.clear();
        self.saved_scope = None;
        self.pending_scopes = 0;
        self.last_sym_loaded = 0;
        self.ip = 0;
        self.page = 0;

        // Root frame: page 0, offset 0.
        self.frames.push(Frame {
            ret_page: 0,
            ret_ip: 0,
            stack_base: 0,
            scopes_to_pop: 0,
        });

        // Merge host-bound functions into the root scope by symbol id.
        for (name, function) in &self.bound {
            if let Some(id) = self.symbols.iter().position(|s| s == name) {
                self.scopes[0]
                    .borrow_mut()
                    .set(id as u16, Value::Builtin(*function));
            }
        }
    }

    // ── Fetching ─────────────────────────────────────────────────────────────

    fn page_span(&self, page: usize) -> (usize, usize) {
        let start = self.page_offsets[page];
        let end = self
            .page_offsets
            .get(page + 1)
            .copied()
            .unwrap_or(self.pages.len());
        (start, end)
    }

    fn fetch_byte(&mut self) -> VmResult<u8> {
        let (start, end) = self.page_span(self.page);
        let pos = start + self.ip;
        if pos >= end {
            return Err(self.error("instruction pointer ran past the end of the page"));
        }
        self.ip += 1;
        Ok(self.pages[pos])
    }

    fn read_u16(&mut self) -> VmResult<u16> {
        let hi = self.fetch_byte()?;
        let lo = self.fetch_byte()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    /// The opcode byte the `ip` currently points at, if any.
    fn peek_byte(&self) -> Option<u8> {
        let (start, end) = self.page_span(self.page);
        let pos = start + self.ip;
        (pos < end).then(|| self.pages[pos])
    }

    // ── Stack helpers ────────────────────────────────────────────────────────

    #[inline]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or_else(|| self.error("stack underflow"))
    }

    fn pop2(&mut self) -> VmResult<(Value, Value)> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    // ── Scope helpers ────────────────────────────────────────────────────────

    /// Nearest-scope lookup, innermost first.
    fn lookup(&self, id: u16) -> Option<Value> {
        for scope in self.scopes.iter().rev() {
            let scope = scope.borrow();
            if scope.is_defined(id) {
                return Some(scope.slot(id).clone());
            }
        }
        None
    }

    /// Overwrite the nearest scope already defining `id`.
    fn store_nearest(&mut self, id: u16, value: Value) -> bool {
        for scope in self.scopes.iter().rev() {
            let mut scope = scope.borrow_mut();
            if scope.is_defined(id) {
                scope.set(id, value);
                return true;
            }
        }
        false
    }

    /// Reset the nearest defining slot of `id` back to undefined.
    fn del_nearest(&mut self, id: u16) -> bool {
        for scope in self.scopes.iter().rev() {
            let mut scope = scope.borrow_mut();
            if scope.is_defined(id) {
                scope.set(id, Value::Undefined);
                return true;
            }
        }
        false
    }

    fn symbol_name(&self, id: u16) -> &str {
        self.symbols
            .get(id as usize)
            .map(String::as_str)
            .unwrap_or("<unknown symbol>")
    }

    fn error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError {
            message: message.into(),
            ip: self.ip,
            page: self.page,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch loop
    // ─────────────────────────────────────────────────────────────────────────

    fn dispatch(&mut self) -> VmResult<Value> {
        while self.running {
            let byte = self.fetch_byte()?;
            let op = Instruction::try_from(byte)
                .map_err(|byte| self.error(format!("unknown instruction: {byte:#04x}")))?;

            match op {
                // ── Loads ────────────────────────────────────────────────────
                Instruction::LoadSymbol => {
                    let id = self.read_u16()?;
                    self.last_sym_loaded = id;
                    match self.lookup(id) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(
                                self.error(format!("unbound variable: {}", self.symbol_name(id)))
                            )
                        }
                    }
                }
                Instruction::LoadConst => {
                    let id = self.read_u16()? as usize;
                    match self.constants.get(id) {
                        Some(ConstValue::PageAddr(page)) => {
                            let page = *page;
                            // The adjacent CAPTURE/SAVE_ENV instructions, if
                            // any, left the scope this closure closes over.
                            let captured = self.saved_scope.take();
                            self.push(Value::closure(page, captured));
                        }
                        Some(_) => self.push(self.const_cache[id].clone()),
                        None => {
                            return Err(self.error(format!("constant id {id} out of range")))
                        }
                    }
                }
                Instruction::Builtin => {
                    let id = self.read_u16()? as usize;
                    match self.builtins.get(id) {
                        Some((_, value)) => self.push(value.clone()),
                        None => return Err(self.error(format!("unknown builtin id {id}"))),
                    }
                }

                // ── Jumps ────────────────────────────────────────────────────
                Instruction::PopJumpIfTrue => {
                    let target = self.read_u16()? as usize;
                    if self.pop()?.is_truthy() {
                        self.ip = target;
                    }
                }
                Instruction::PopJumpIfFalse => {
                    let target = self.read_u16()? as usize;
                    if !self.pop()?.is_truthy() {
                        self.ip = target;
                    }
                }
                Instruction::Jump => {
                    let target = self.read_u16()? as usize;
                    self.ip = target;
                }

                // ── Bindings ─────────────────────────────────────────────────
                Instruction::Store => {
                    let id = self.read_u16()?;
                    let value = self.pop()?;
                    if !self.store_nearest(id, value) {
                        return Err(self.error(format!(
                            "unbound variable {}, can not change its value",
                            self.symbol_name(id)
                        )));
                    }
                }
                Instruction::Let => {
                    let id = self.read_u16()?;
                    let value = self.pop()?;
                    let current = self.scopes.last().expect("scope chain is never empty");
                    if current.borrow().is_defined(id) {
                        return Err(self.error(format!(
                            "can not use 'let' to redefine the variable {}",
                            self.symbol_name(id)
                        )));
                    }
                    current.borrow_mut().set(id, value);
                }
                Instruction::Mut => {
                    let id = self.read_u16()?;
                    let value = self.pop()?;
                    self.scopes
                        .last()
                        .expect("scope chain is never empty")
                        .borrow_mut()
                        .set(id, value);
                }
                Instruction::Del => {
                    let id = self.read_u16()?;
                    if !self.del_nearest(id) {
                        return Err(
                            self.error(format!("unbound variable: {}", self.symbol_name(id)))
                        );
                    }
                }

                // ── Closures ─────────────────────────────────────────────────
                Instruction::Capture => {
                    let id = self.read_u16()?;
                    let value = self.lookup(id).ok_or_else(|| {
                        self.error(format!(
                            "can not capture the unbound variable {}",
                            self.symbol_name(id)
                        ))
                    })?;
                    let saved = self
                        .saved_scope
                        .get_or_insert_with(|| Scope::shared(self.symbols.len()));
                    saved.borrow_mut().set(id, value);
                }
                Instruction::SaveEnv => {
                    let current = self.scopes.last().expect("scope chain is never empty");
                    self.saved_scope = Some(current.clone());
                }
                Instruction::GetField => {
                    let id = self.read_u16()?;
                    self.get_field(id)?;
                }

                // ── Calls ────────────────────────────────────────────────────
                Instruction::Call => {
                    let argc = self.read_u16()? as usize;
                    self.call(argc)?;
                }
                Instruction::Ret => {
                    let frame = self
                        .frames
                        .pop()
                        .ok_or_else(|| self.error("return without an active frame"))?;
                    let value = if self.stack.len() > frame.stack_base {
                        self.pop()?
                    } else {
                        Value::Nil
                    };
                    self.stack.truncate(frame.stack_base);
                    for _ in 0..frame.scopes_to_pop {
                        self.scopes.pop();
                    }
                    self.push(value);
                    if self.frames.is_empty() {
                        self.running = false;
                    } else {
                        self.page = frame.ret_page;
                        self.ip = frame.ret_ip;
                    }
                }
                Instruction::Halt => {
                    self.running = false;
                }

                // ── Plugins ──────────────────────────────────────────────────
                Instruction::Plugin => {
                    let id = self.read_u16()? as usize;
                    self.load_plugin(id)?;
                }

                // ── Lists ────────────────────────────────────────────────────
                Instruction::List => {
                    let count = self.read_u16()? as usize;
                    // Elements were emitted in reverse, so popping restores
                    // source order.
                    let mut items = Vec::with_capacity(count);
                    for _ in 0..count {
                        items.push(self.pop()?);
                    }
                    self.push(Value::list(items));
                }
                Instruction::Append => {
                    let count = self.read_u16()? as usize;
                    let mut items = self.pop_list("append")?;
                    for _ in 0..count {
                        items.push(self.pop()?);
                    }
                    self.push(Value::list(items));
                }
                Instruction::Concat => {
                    let count = self.read_u16()? as usize;
                    let mut items = self.pop_list("concat")?;
                    for _ in 0..count {
                        items.extend(self.pop_list("concat")?);
                    }
                    self.push(Value::list(items));
                }
                Instruction::AppendInPlace => {
                    let count = self.read_u16()? as usize;
                    let list = self.pop_list_handle("append!")?;
                    for _ in 0..count {
                        let value = self.pop()?;
                        list.borrow_mut().push(value);
                    }
                    self.push(Value::Nil);
                }
                Instruction::ConcatInPlace => {
                    let count = self.read_u16()? as usize;
                    let list = self.pop_list_handle("concat!")?;
                    for _ in 0..count {
                        let other = self.pop_list("concat!")?;
                        list.borrow_mut().extend(other);
                    }
                    self.push(Value::Nil);
                }
                Instruction::PopList => {
                    let mut items = self.pop_list("pop")?;
                    let index = self.pop_index(items.len(), "pop")?;
                    items.remove(index);
                    self.push(Value::list(items));
                }
                Instruction::PopListInPlace => {
                    let list = self.pop_list_handle("pop!")?;
                    let len = list.borrow().len();
                    let index = self.pop_index(len, "pop!")?;
                    list.borrow_mut().remove(index);
                }

                // ── Operators ────────────────────────────────────────────────
                Instruction::Add => {
                    let (a, b) = self.pop2()?;
                    let result = match (&a, &b) {
                        (Value::Number(x), Value::Number(y)) => Value::Number(x + y),
                        (Value::Str(x), Value::Str(y)) => Value::string(format!("{x}{y}")),
                        _ => {
                            return Err(self.error(format!(
                                "type error: + expects two Numbers or two Strings, got {} and {}",
                                a.type_name(),
                                b.type_name()
                            )))
                        }
                    };
                    self.push(result);
                }
                Instruction::Sub => {
                    let (a, b) = self.numbers("-")?;
                    self.push(Value::Number(a - b));
                }
                Instruction::Mul => {
                    let (a, b) = self.numbers("*")?;
                    self.push(Value::Number(a * b));
                }
                Instruction::Div => {
                    let (a, b) = self.numbers("/")?;
                    if b == 0.0 {
                        return Err(self.error("division by zero"));
                    }
                    self.push(Value::Number(a / b));
                }
                Instruction::Mod => {
                    let (a, b) = self.numbers("mod")?;
                    self.push(Value::Number(a % b));
                }
                Instruction::Gt => self.compare(">", |ord| ord == std::cmp::Ordering::Greater)?,
                Instruction::Lt => self.compare("<", |ord| ord == std::cmp::Ordering::Less)?,
                Instruction::Le => self.compare("<=", |ord| ord != std::cmp::Ordering::Greater)?,
                Instruction::Ge => self.compare(">=", |ord| ord != std::cmp::Ordering::Less)?,
                Instruction::Eq => {
                    let (a, b) = self.pop2()?;
                    self.push(Value::bool(a == b));
                }
                Instruction::Neq => {
                    let (a, b) = self.pop2()?;
                    self.push(Value::bool(a != b));
                }
                Instruction::And => {
                    let (a, b) = self.pop2()?;
                    self.push(Value::bool(a.is_truthy() && b.is_truthy()));
                }
                Instruction::Or => {
                    let (a, b) = self.pop2()?;
                    self.push(Value::bool(a.is_truthy() || b.is_truthy()));
                }
                Instruction::Not => {
                    let a = self.pop()?;
                    self.push(Value::bool(!a.is_truthy()));
                }
                Instruction::Len => {
                    let a = self.pop()?;
                    let len = match &a {
                        Value::List(items) => items.borrow().len(),
                        Value::Str(s) => s.chars().count(),
                        _ => {
                            return Err(self.error(format!(
                                "type error: len expects a List or a String, got {}",
                                a.type_name()
                            )))
                        }
                    };
                    self.push(Value::Number(len as f64));
                }
                Instruction::Empty => {
                    let a = self.pop()?;
                    let empty = match &a {
                        Value::List(items) => items.borrow().is_empty(),
                        Value::Str(s) => s.is_empty(),
                        _ => {
                            return Err(self.error(format!(
                                "type error: empty? expects a List or a String, got {}",
                                a.type_name()
                            )))
                        }
                    };
                    self.push(Value::bool(empty));
                }
                Instruction::Head => {
                    let a = self.pop()?;
                    let head = match &a {
                        Value::List(items) => {
                            items.borrow().first().cloned().unwrap_or(Value::Nil)
                        }
                        Value::Str(s) => match s.chars().next() {
                            Some(c) => Value::string(c.to_string()),
                            None => Value::string(""),
                        },
                        _ => {
                            return Err(self.error(format!(
                                "type error: head expects a List or a String, got {}",
                                a.type_name()
                            )))
                        }
                    };
                    self.push(head);
                }
                Instruction::Tail => {
                    let a = self.pop()?;
                    let tail = match &a {
                        Value::List(items) => {
                            let items = items.borrow();
                            if items.len() < 2 {
                                Value::list(Vec::new())
                            } else {
                                Value::list(items[1..].to_vec())
                            }
                        }
                        Value::Str(s) => {
                            let mut chars = s.chars();
                            chars.next();
                            Value::string(chars.as_str().to_string())
                        }
                        _ => {
                            return Err(self.error(format!(
                                "type error: tail expects a List or a String, got {}",
                                a.type_name()
                            )))
                        }
                    };
                    self.push(tail);
                }
                Instruction::IsNil => {
                    let a = self.pop()?;
                    self.push(Value::bool(a == Value::Nil));
                }
                Instruction::Assert => {
                    let (condition, message) = self.pop2()?;
                    if condition == Value::False {
                        let message = match &message {
                            Value::Str(s) => s.to_string(),
                            other => {
                                return Err(self.error(format!(
                                    "type error: assert expects a String message, got {}",
                                    other.type_name()
                                )))
                            }
                        };
                        return Err(self.error(format!("assertion failed: {message}")));
                    }
                }
                Instruction::ToNum => {
                    let a = self.pop()?;
                    let result = match &a {
                        Value::Str(s) => s
                            .trim()
                            .parse::<f64>()
                            .map(Value::Number)
                            .unwrap_or(Value::Nil),
                        _ => {
                            return Err(self.error(format!(
                                "type error: toNumber expects a String, got {}",
                                a.type_name()
                            )))
                        }
                    };
                    self.push(result);
                }
                Instruction::ToStr => {
                    let a = self.pop()?;
                    self.push(Value::string(a.to_string()));
                }
                Instruction::At => {
                    let index = self.pop()?;
                    let collection = self.pop()?;
                    let index = match index {
                        Value::Number(n) => n,
                        other => {
                            return Err(self.error(format!(
                                "type error: @ expects a Number index, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    let value = match &collection {
                        Value::List(items) => {
                            let items = items.borrow();
                            let at = resolve_index(index, items.len())
                                .ok_or_else(|| self.error("@: index out of range"))?;
                            items[at].clone()
                        }
                        Value::Str(s) => {
                            let chars: Vec<char> = s.chars().collect();
                            let at = resolve_index(index, chars.len())
                                .ok_or_else(|| self.error("@: index out of range"))?;
                            Value::string(chars[at].to_string())
                        }
                        _ => {
                            return Err(self.error(format!(
                                "type error: @ expects a List or a String, got {}",
                                collection.type_name()
                            )))
                        }
                    };
                    self.push(value);
                }
                Instruction::Type => {
                    let a = self.pop()?;
                    self.push(Value::string(a.type_name()));
                }
                Instruction::HasField => {
                    let (closure, field) = self.pop2()?;
                    let name = match &field {
                        Value::Str(s) => s.to_string(),
                        other => {
                            return Err(self.error(format!(
                                "type error: hasField expects a String, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    let closure = match &closure {
                        Value::Closure(c) => c.clone(),
                        other => {
                            return Err(self.error(format!(
                                "type error: hasField expects a Function, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    let has = self
                        .symbols
                        .iter()
                        .position(|s| *s == name)
                        .and_then(|id| {
                            closure
                                .scope
                                .as_ref()
                                .map(|scope| scope.borrow().is_defined(id as u16))
                        })
                        .unwrap_or(false);
                    self.push(Value::bool(has));
                }

                // Framing bytes are never executed.
                Instruction::SymTableStart
                | Instruction::ValTableStart
                | Instruction::CodeSegmentStart
                | Instruction::NumberType
                | Instruction::StringType
                | Instruction::FuncType => {
                    return Err(
                        self.error(format!("framing byte {byte:#04x} in executable code"))
                    );
                }
            }
        }

        Ok(self.stack.pop().unwrap_or(Value::Nil))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Calls
    // ─────────────────────────────────────────────────────────────────────────

    fn call(&mut self, argc: usize) -> VmResult<()> {
        let callee = self.pop()?;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse(); // back into source order

        match callee {
            Value::Builtin(function) => {
                let result = function(&args).map_err(|message| self.error(message))?;
                // A GET_FIELD scope pushed for this call is no longer needed.
                for _ in 0..std::mem::take(&mut self.pending_scopes) {
                    self.scopes.pop();
                }
                self.push(result);
                Ok(())
            }
            Value::Closure(closure) => {
                let page = closure.page as usize;
                if page >= self.page_offsets.len() {
                    return Err(
                        self.error(format!("function references page {page}, which does not exist"))
                    );
                }
                trace!(page, argc, "entering function");

                let mut scopes_to_pop = std::mem::take(&mut self.pending_scopes);
                let frame = Frame {
                    ret_page: self.page,
                    ret_ip: self.ip,
                    stack_base: self.stack.len(),
                    scopes_to_pop: 0,
                };
                self.frames.push(frame);

                if let Some(captured) = &closure.scope {
                    self.scopes.push(captured.clone());
                    scopes_to_pop += 1;
                }
                self.scopes.push(Scope::shared(self.symbols.len()));
                scopes_to_pop += 1;
                self.frames
                    .last_mut()
                    .expect("frame just pushed")
                    .scopes_to_pop = scopes_to_pop;

                // Arguments go back in reverse so the callee's first MUT
                // binds the first argument.
                for arg in args.into_iter().rev() {
                    self.push(arg);
                }
                self.page = page;
                self.ip = 0;
                Ok(())
            }
            other => Err(self.error(format!(
                "can not call a value of type {}",
                other.type_name()
            ))),
        }
    }

    fn get_field(&mut self, id: u16) -> VmResult<()> {
        let value = self.pop()?;
        let closure = match &value {
            Value::Closure(c) => c.clone(),
            _ => {
                return Err(self.error(format!(
                    "the variable `{}' isn't a closure, can not get the field `{}' from it",
                    self.symbol_name(self.last_sym_loaded),
                    self.symbol_name(id)
                )))
            }
        };
        let scope = closure.scope.clone().ok_or_else(|| {
            self.error(format!(
                "couldn't find the variable {} in the closure environment",
                self.symbol_name(id)
            ))
        })?;

        let field = {
            let scope = scope.borrow();
            if !scope.is_defined(id) {
                return Err(self.error(format!(
                    "couldn't find the variable {} in the closure environment",
                    self.symbol_name(id)
                )));
            }
            scope.slot(id).clone()
        };

        // Bound-method call: when the field is immediately called, the
        // closure's scope stays visible for the duration of that call.
        if self.peek_byte() == Some(Instruction::Call as u8) {
            self.scopes.push(scope);
            self.pending_scopes += 1;
        }
        self.push(field);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Plugins
    // ─────────────────────────────────────────────────────────────────────────

    fn load_plugin(&mut self, constant_id: usize) -> VmResult<()> {
        let path = match self.constants.get(constant_id) {
            Some(ConstValue::Str(path)) => path.clone(),
            _ => return Err(self.error("PLUGIN references a non-string constant")),
        };
        if self.loaded_plugins.contains(&path) {
            return Ok(());
        }

        let (ip, page) = (self.ip, self.page);
        let loader = self.loader.as_mut().ok_or_else(|| RuntimeError {
            message: format!("could not load module '{path}': no module loader is installed"),
            ip,
            page,
        })?;
        let exports = loader(&path).map_err(|message| RuntimeError {
            message: format!("could not load module '{path}': {message}"),
            ip,
            page,
        })?;

        // Exports merge into the root scope, keyed by symbol id; names the
        // program never mentions have no slot and are skipped.
        let mut merged = 0usize;
        for (name, value) in exports {
            if let Some(id) = self.symbols.iter().position(|s| *s == name) {
                self.scopes[0].borrow_mut().set(id as u16, value);
                merged += 1;
            }
        }
        debug!(module = %path, merged, "plugin loaded");
        self.loaded_plugins.push(path);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operand helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn numbers(&mut self, who: &str) -> VmResult<(f64, f64)> {
        let (a, b) = self.pop2()?;
        match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => Ok((*x, *y)),
            _ => Err(self.error(format!(
                "type error: {who} expects two Numbers, got {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn compare(
        &mut self,
        who: &str,
        predicate: impl Fn(std::cmp::Ordering) -> bool,
    ) -> VmResult<()> {
        let (a, b) = self.pop2()?;
        match a.partial_cmp(&b) {
            Some(ordering) => {
                self.push(Value::bool(predicate(ordering)));
                Ok(())
            }
            None => Err(self.error(format!(
                "type error: can not compare {} and {} with {who}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    /// Pop a list and clone out its elements.
    fn pop_list(&mut self, who: &str) -> VmResult<Vec<Value>> {
        match self.pop()? {
            Value::List(items) => Ok(items.borrow().clone()),
            other => Err(self.error(format!(
                "type error: {who} expects a List, got {}",
                other.type_name()
            ))),
        }
    }

    /// Pop a list, keeping the shared handle (for the in-place opcodes).
    fn pop_list_handle(&mut self, who: &str) -> VmResult<std::rc::Rc<std::cell::RefCell<Vec<Value>>>> {
        match self.pop()? {
            Value::List(items) => Ok(items),
            other => Err(self.error(format!(
                "type error: {who} expects a List, got {}",
                other.type_name()
            ))),
        }
    }

    /// Pop a numeric index and resolve it (negative counts from the end).
    fn pop_index(&mut self, len: usize, who: &str) -> VmResult<usize> {
        match self.pop()? {
            Value::Number(n) => resolve_index(n, len)
                .ok_or_else(|| self.error(format!("{who}: index out of range"))),
            other => Err(self.error(format!(
                "type error: {who} expects a Number index, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Resolve a possibly negative index against `len`.
fn resolve_index(index: f64, len: usize) -> Option<usize> {
    let index = index as i64;
    let resolved = if index < 0 { len as i64 + index } else { index };
    (0..len as i64).contains(&resolved).then_some(resolved as usize)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;

    fn compile(src: &str) -> Vec<u8> {
        let mut compiler = Compiler::new(0, Vec::new(), 0);
        compiler.feed(src, "<test>").expect("feed failed");
        compiler.compile().expect("compile failed");
        compiler.bytecode().to_vec()
    }

    fn run(src: &str) -> Value {
        let mut vm = Vm::new(false);
        vm.feed_bytes(&compile(src)).expect("load failed");
        vm.run().expect("run failed")
    }

    fn run_err(src: &str) -> RuntimeError {
        let mut vm = Vm::new(false);
        vm.feed_bytes(&compile(src)).expect("load failed");
        vm.run().expect_err("expected a runtime error")
    }

    #[test]
    fn test_arithmetic_program() {
        assert_eq!(run("(let x 6) (let y 7) (* x y)"), Value::Number(42.0));
        assert_eq!(run("(- 10 4 1)"), Value::Number(5.0));
        assert_eq!(run("(mod 7 4)"), Value::Number(3.0));
        assert_eq!(run("(/ 1 2)"), Value::Number(0.5));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(run("(+ \"foo\" \"bar\")"), Value::string("foobar"));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(run("(< 1 2)"), Value::True);
        assert_eq!(run("(>= 2 2)"), Value::True);
        assert_eq!(run("(= \"a\" \"a\")"), Value::True);
        assert_eq!(run("(!= 1 \"1\")"), Value::True);
    }

    #[test]
    fn test_if_branches() {
        assert_eq!(run("(if (< 1 2) 10 20)"), Value::Number(10.0));
        assert_eq!(run("(if (> 1 2) 10 20)"), Value::Number(20.0));
        assert_eq!(run("(if false 1)"), Value::Nil); // no else, no value
    }

    #[test]
    fn test_while_loop() {
        let result = run(
            "(mut sum 0) (mut i 0) \
             (while (< i 5) { (set sum (+ sum i)) (set i (+ i 1)) }) \
             sum",
        );
        assert_eq!(result, Value::Number(10.0));
    }

    #[test]
    fn test_recursive_function() {
        let result = run(
            "(let f (fun (n) (if (< n 2) n (+ (f (- n 1)) (f (- n 2)))))) \
             (f 10)",
        );
        assert_eq!(result, Value::Number(55.0));
    }

    #[test]
    fn test_counter_closure_shares_its_captured_scope() {
        let result = run(
            "(let make (fun (x) (fun (&x) { (set x (+ x 1)) x }))) \
             (let c (make 0)) \
             (c) (c) (c)",
        );
        assert_eq!(result, Value::Number(3.0));
    }

    #[test]
    fn test_two_closures_do_not_share_state() {
        let result = run(
            "(let make (fun (x) (fun (&x) { (set x (+ x 1)) x }))) \
             (let a (make 0)) (let b (make 100)) \
             (a) (a) (b)",
        );
        assert_eq!(result, Value::Number(101.0));
    }

    #[test]
    fn test_closure_field_access() {
        let result = run(
            "(let make (fun (x) { \
               (mut get-x (fun (&x) x)) \
               (fun (&x &get-x) ()) })) \
             (let obj (make 5)) \
             (+ obj.x (obj.get-x))",
        );
        assert_eq!(result, Value::Number(10.0));
    }

    #[test]
    fn test_get_field_on_non_closure() {
        let err = run_err("(let field 1) (let x 1) (print x.field)");
        assert!(err.message.contains("isn't a closure"), "{}", err.message);
    }

    #[test]
    fn test_let_redefinition_is_a_runtime_error() {
        let err = run_err("(let x 1) (let x 2)");
        assert!(err.message.contains("redefine"), "{}", err.message);
    }

    #[test]
    fn test_mut_allows_redefinition_and_set_updates() {
        assert_eq!(run("(mut x 1) (mut x 2) x"), Value::Number(2.0));
        assert_eq!(run("(let x 1) (set x 5) x"), Value::Number(5.0));
    }

    #[test]
    fn test_del_undefines_the_variable() {
        let err = run_err("(mut x 1) (del x) x");
        assert!(err.message.contains("unbound variable"), "{}", err.message);
        let err = run_err("(mut x 1) (del x) (del x)");
        assert!(err.message.contains("unbound variable"), "{}", err.message);
    }

    #[test]
    fn test_list_construction_preserves_order() {
        assert_eq!(
            run("(list 1 2 3)"),
            Value::list(vec![
                Value::Number(1.0),
                Value::Number(2.0),
                Value::Number(3.0)
            ])
        );
        assert_eq!(run("[1 2 3]"), run("(list 1 2 3)"));
    }

    #[test]
    fn test_append_copies_while_append_bang_mutates() {
        assert_eq!(
            run("(mut xs (list 1)) (let ys (append xs 2)) (len xs)"),
            Value::Number(1.0)
        );
        assert_eq!(
            run("(mut xs (list 1 2 3)) (append! xs 4) (len xs)"),
            Value::Number(4.0)
        );
    }

    #[test]
    fn test_concat_flattens_in_order() {
        assert_eq!(
            run("(concat (list 1) (list 2 3) (list 4))"),
            Value::list(vec![
                Value::Number(1.0),
                Value::Number(2.0),
                Value::Number(3.0),
                Value::Number(4.0)
            ])
        );
        assert_eq!(
            run("(mut xs (list 1)) (concat! xs (list 2 3)) (len xs)"),
            Value::Number(3.0)
        );
    }

    #[test]
    fn test_pop_list_variants() {
        assert_eq!(
            run("(pop (list 1 2 3) 0)"),
            Value::list(vec![Value::Number(2.0), Value::Number(3.0)])
        );
        assert_eq!(
            run("(pop (list 1 2 3) -1)"),
            Value::list(vec![Value::Number(1.0), Value::Number(2.0)])
        );
        assert_eq!(
            run("(mut xs (list 1 2 3)) (pop! xs 1) (len xs)"),
            Value::Number(2.0)
        );
        let err = run_err("(pop (list 1) 5)");
        assert!(err.message.contains("out of range"), "{}", err.message);
    }

    #[test]
    fn test_sequence_operators() {
        assert_eq!(run("(head (list 1 2))"), Value::Number(1.0));
        assert_eq!(run("(head (list))"), Value::Nil);
        assert_eq!(
            run("(tail (list 1 2 3))"),
            Value::list(vec![Value::Number(2.0), Value::Number(3.0)])
        );
        assert_eq!(run("(len \"héllo\")"), Value::Number(5.0));
        assert_eq!(run("(empty? (list))"), Value::True);
        assert_eq!(run("(nil? ())"), Value::True);
        assert_eq!(run("(@ (list 1 2 3) 1)"), Value::Number(2.0));
        assert_eq!(run("(@ \"abc\" -1)"), Value::string("c"));
    }

    #[test]
    fn test_conversions_and_type() {
        assert_eq!(run("(toNumber \"1.5\")"), Value::Number(1.5));
        assert_eq!(run("(toNumber \"zzz\")"), Value::Nil);
        assert_eq!(run("(toString 42)"), Value::string("42"));
        assert_eq!(run("(type (list))"), Value::string("List"));
        assert_eq!(run("(type \"x\")"), Value::string("String"));
    }

    #[test]
    fn test_has_field() {
        let result = run(
            "(let make (fun (x) (fun (&x) ()))) \
             (let obj (make 1)) \
             (list (hasField obj \"x\") (hasField obj \"y\"))",
        );
        assert_eq!(result, Value::list(vec![Value::True, Value::False]));
    }

    #[test]
    fn test_assert() {
        assert_eq!(run("(assert true \"fine\") 1"), Value::Number(1.0));
        let err = run_err("(assert (> 1 2) \"one is not greater\")");
        assert!(
            err.message.contains("one is not greater"),
            "{}",
            err.message
        );
    }

    #[test]
    fn test_division_by_zero() {
        let err = run_err("(/ 1 0)");
        assert!(err.message.contains("division by zero"), "{}", err.message);
    }

    #[test]
    fn test_operator_type_error() {
        let err = run_err("(+ 1 \"a\")");
        assert!(err.message.contains("type error"), "{}", err.message);
    }

    #[test]
    fn test_calling_a_non_callable() {
        let err = run_err("(let x 1) (x)");
        assert!(err.message.contains("can not call"), "{}", err.message);
    }

    #[test]
    fn test_builtin_functions() {
        assert_eq!(
            run("(list:reverse (list 1 2 3))"),
            Value::list(vec![
                Value::Number(3.0),
                Value::Number(2.0),
                Value::Number(1.0)
            ])
        );
        assert_eq!(run("(math:floor 2.7)"), Value::Number(2.0));
        let err = run_err("(list:reverse 1)");
        assert!(err.message.contains("list:reverse"), "{}", err.message);
    }

    #[test]
    fn test_quote_defers_evaluation() {
        assert_eq!(run("(let q '(+ 1 2)) (q)"), Value::Number(3.0));
    }

    #[test]
    fn test_quoted_code_runs_each_call() {
        let result = run(
            "(mut n 0) \
             (let bump '(set n (+ n 1))) \
             (bump) (bump) n",
        );
        assert_eq!(result, Value::Number(2.0));
    }

    #[test]
    fn test_module_loader_merges_exports() {
        fn answer(_: &[Value]) -> Result<Value, String> {
            Ok(Value::Number(42.0))
        }
        let mut vm = Vm::new(false);
        vm.feed_bytes(&compile("(import \"tools.arkm\") (tools:answer)"))
            .unwrap();
        vm.set_module_loader(Box::new(|path| {
            assert_eq!(path, "tools.arkm");
            Ok(vec![("tools:answer".to_string(), Value::Builtin(answer))])
        }));
        assert_eq!(vm.run().unwrap(), Value::Number(42.0));
    }

    #[test]
    fn test_missing_module_loader_is_a_runtime_error() {
        let mut vm = Vm::new(false);
        vm.feed_bytes(&compile("(import \"tools.arkm\") (tools:answer)"))
            .unwrap();
        let err = vm.run().unwrap_err();
        assert!(err.message.contains("no module loader"), "{}", err.message);
    }

    #[test]
    fn test_load_function_binds_into_the_root_scope() {
        fn host_add(args: &[Value]) -> Result<Value, String> {
            match (&args[0], &args[1]) {
                (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
                _ => Err("host:add expects two Numbers".to_string()),
            }
        }
        let mut vm = Vm::new(false);
        vm.feed_bytes(&compile("(import \"host.arkm\") (host:add 40 2)"))
            .unwrap();
        vm.set_module_loader(Box::new(|_| Ok(Vec::new())));
        vm.load_function("host:add", host_add);
        assert_eq!(vm.run().unwrap(), Value::Number(42.0));
    }

    #[test]
    fn test_persistent_vm_keeps_the_root_scope() {
        // Both programs place `n` at symbol id 0, so the persistent root
        // scope carries the value from the first run into the second.  The
        // second program re-binds `n` from its inherited value: `(mut n n)`
        // reads the slot the first run left behind.
        let mut vm = Vm::new(true);
        vm.feed_bytes(&compile("(mut n 41)")).unwrap();
        vm.run().unwrap();
        vm.feed_bytes(&compile("(mut n n) (set n (+ n 1)) n")).unwrap();
        assert_eq!(vm.run().unwrap(), Value::Number(42.0));
    }

    #[test]
    fn test_run_without_feed_fails() {
        let mut vm = Vm::new(false);
        let err = vm.run().unwrap_err();
        assert!(err.message.contains("no bytecode"), "{}", err.message);
    }

    #[test]
    fn test_empty_program_returns_nil() {
        assert_eq!(run(""), Value::Nil);
        assert_eq!(run("()"), Value::Nil);
    }
}
