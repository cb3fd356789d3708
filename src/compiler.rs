//! AST-to-bytecode compiler for the Ark language.
//!
//! The compiler performs a single-pass walk of the [`Node`] tree and emits
//! instructions into [`Page`]s — one page for the top level (page 0) plus one
//! per function or quote body.  Along the way it maintains three append-only
//! tables (symbols, constants, plugin paths) whose `u16` indices become the
//! instruction operands, then hands everything to the container codec.
//!
//! # Scratch pages
//!
//! A call form must materialise its callee *after* its arguments, so the
//! callee expression is first compiled onto a scratch page.  Scratch pages
//! live on their own stack and are addressed through [`PageRef::Temp`]; their
//! contents are appended to a real page before being popped and never appear
//! in the final bytecode.  A scratch page of length 1 can only be a bare
//! operator byte, which is what distinguishes an operator application from a
//! builtin/function call.
//!
//! # Forward jumps
//!
//! `if` and `while` emit jump operands as `0x0000` placeholders and patch
//! them in place once the target offset is known.  All jump targets are
//! absolute offsets within the emitting page.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::ast::{Keyword, Node, NodeKind};
use crate::bytecode::{
    disassemble_page, ConstValue, Instruction, Page, CHAINABLE_OPERATORS, FIRST_OPERATOR,
};
use crate::container;
use crate::token::Span;
use crate::{builtins, lexer, parser, ArkError};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// A compile-time error.  Compilation aborts on the first one.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub span: Span,
}

impl CompileError {
    fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.span, self.message)
    }
}

impl std::error::Error for CompileError {}

type CompileResult<T> = Result<T, CompileError>;

// ─────────────────────────────────────────────────────────────────────────────
// Page handles
// ─────────────────────────────────────────────────────────────────────────────

/// Which page an emission lands on: a finished page by id, or a scratch page
/// by its depth on the scratch stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageRef {
    Final(usize),
    Temp(usize),
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiler
// ─────────────────────────────────────────────────────────────────────────────

/// The Ark bytecode compiler.
///
/// Create one with [`Compiler::new`], feed it source with [`Compiler::feed`],
/// then call [`Compiler::compile`] and read the container back with
/// [`Compiler::bytecode`] or write it with [`Compiler::save_to`].
pub struct Compiler {
    /// Debug level; `>= 2` dumps a disassembly of every page.
    debug: u8,
    /// Library search paths, forwarded to the VM host for plugin resolution.
    lib_paths: Vec<PathBuf>,
    /// Feature bitmask reserved for the parse/macro/optimise collaborators.
    #[allow(dead_code)]
    options: u16,

    /// The root AST produced by `feed`.
    ast: Option<Node>,
    /// Name of the file fed, for logging only.
    filename: String,

    /// Symbol table: unique names with the span of their first use.
    symbols: Vec<(String, Span)>,
    /// Names the compiler has seen a binding for.
    defined_symbols: Vec<String>,
    /// Plugin paths in `import` order.
    plugins: Vec<String>,
    /// Constant table.
    values: Vec<ConstValue>,
    /// Finished code pages; page 0 is the top level.
    pages: Vec<Page>,
    /// Scratch pages used while lowering call forms.
    temp_pages: Vec<Page>,
    /// Builtin registry names, in ABI order.
    builtin_names: Vec<&'static str>,

    /// The serialised container, filled in by `compile`.
    bytecode: Vec<u8>,
}

impl Compiler {
    /// Create a new compiler.
    ///
    /// `debug` controls log verbosity, `lib_paths` are remembered for the
    /// host, and `options` is forwarded to the front-end collaborators.
    pub fn new(debug: u8, lib_paths: Vec<PathBuf>, options: u16) -> Self {
        Self {
            debug,
            lib_paths,
            options,
            ast: None,
            filename: String::new(),
            symbols: Vec::new(),
            defined_symbols: Vec::new(),
            plugins: Vec::new(),
            values: Vec::new(),
            pages: Vec::new(),
            temp_pages: Vec::new(),
            builtin_names: builtins::all().into_iter().map(|(name, _)| name).collect(),
            bytecode: Vec::new(),
        }
    }

    /// The library search paths this compiler was created with.
    pub fn lib_paths(&self) -> &[PathBuf] {
        &self.lib_paths
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entry points
    // ─────────────────────────────────────────────────────────────────────────

    /// Lex and parse `source`, storing the resulting AST for `compile`.
    pub fn feed(&mut self, source: &str, filename: &str) -> Result<(), ArkError> {
        let (tokens, errors) = lexer::lex(source);
        if !errors.is_empty() {
            return Err(ArkError::Lex(errors));
        }
        let ast = parser::parse_tokens(tokens)?;
        debug!(file = filename, "source fed to the compiler");
        self.ast = Some(ast);
        self.filename = filename.to_string();
        Ok(())
    }

    /// Lower the stored AST and serialise the container.
    pub fn compile(&mut self) -> CompileResult<()> {
        let ast = self
            .ast
            .clone()
            .ok_or_else(|| CompileError::new("no source was fed to the compiler", Span::dummy()))?;

        self.pages.push(Page::new()); // page 0: the top level
        self.compile_node(&ast, PageRef::Final(0))?;
        self.check_for_undefined_symbols()?;

        if self.debug >= 2 {
            for (id, page) in self.pages.iter().enumerate() {
                debug!("\n{}", disassemble_page(page.as_bytes(), &format!("page {id}")));
            }
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let names: Vec<String> = self.symbols.iter().map(|(name, _)| name.clone()).collect();
        self.bytecode = container::serialize(&names, &self.values, &self.pages, timestamp)
            .map_err(|e| CompileError::new(e.to_string(), Span::dummy()))?;

        debug!(
            file = %self.filename,
            pages = self.pages.len(),
            symbols = self.symbols.len(),
            constants = self.values.len(),
            bytes = self.bytecode.len(),
            "compilation finished"
        );
        Ok(())
    }

    /// The serialised container produced by [`Compiler::compile`].
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    /// Write the serialised container to `path`.
    pub fn save_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, &self.bytecode)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Emit helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn page_mut(&mut self, p: PageRef) -> &mut Page {
        match p {
            PageRef::Final(i) => &mut self.pages[i],
            PageRef::Temp(i) => &mut self.temp_pages[i],
        }
    }

    fn page_len(&self, p: PageRef) -> usize {
        match p {
            PageRef::Final(i) => self.pages[i].len(),
            PageRef::Temp(i) => self.temp_pages[i].len(),
        }
    }

    fn emit(&mut self, p: PageRef, op: Instruction) {
        self.page_mut(p).push_op(op);
    }

    fn emit_u16(&mut self, p: PageRef, op: Instruction, operand: u16) {
        let page = self.page_mut(p);
        page.push_op(op);
        page.push_u16(operand);
    }

    /// Emit a jump with a `0x0000` placeholder; returns the operand offset.
    fn emit_jump(&mut self, p: PageRef, op: Instruction) -> usize {
        let page = self.page_mut(p);
        page.push_op(op);
        let at = page.len();
        page.push_u16(0);
        at
    }

    /// Back-patch a jump operand to the current end of the page.
    fn patch_jump(&mut self, p: PageRef, at: usize) {
        let target = self.page_len(p) as u16;
        self.page_mut(p).patch_u16(at, target);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Node dispatch
    // ─────────────────────────────────────────────────────────────────────────

    fn compile_node(&mut self, node: &Node, p: PageRef) -> CompileResult<()> {
        match &node.kind {
            NodeKind::Symbol(name) => self.compile_symbol(name, node.span, p),
            NodeKind::GetField(name) => {
                let id = self.add_symbol(name, node.span)?;
                self.emit_u16(p, Instruction::GetField, id);
                Ok(())
            }
            NodeKind::Str(s) => {
                let id = self.add_value(ConstValue::Str(s.clone()), node.span)?;
                self.emit_u16(p, Instruction::LoadConst, id);
                Ok(())
            }
            NodeKind::Number(n) => {
                let id = self.add_value(ConstValue::Number(*n), node.span)?;
                self.emit_u16(p, Instruction::LoadConst, id);
                Ok(())
            }
            NodeKind::Keyword(kw) => Err(CompileError::new(
                format!("`{}' can not be used outside of a form", kw.name()),
                node.span,
            )),
            NodeKind::Capture(name) => Err(CompileError::new(
                format!("`&{name}' can only appear in a function parameter list"),
                node.span,
            )),
            NodeKind::List(children) => {
                // An empty code block evaluates to nil.
                if children.is_empty() {
                    let id = self.builtin_id("nil", node.span)?;
                    self.emit_u16(p, Instruction::Builtin, id);
                    return Ok(());
                }
                match &children[0].kind {
                    NodeKind::Symbol(head) if Instruction::specific(head).is_some() => {
                        self.compile_specific(head, node, p)
                    }
                    NodeKind::Keyword(kw) => self.compile_keyword(*kw, node, p),
                    _ => self.compile_call(node, p),
                }
            }
        }
    }

    fn compile_symbol(&mut self, name: &str, span: Span, p: PageRef) -> CompileResult<()> {
        if let Some(id) = builtins_index(&self.builtin_names, name) {
            self.emit_u16(p, Instruction::Builtin, id);
        } else if let Some(index) = Instruction::operator_index(name) {
            self.page_mut(p).push_byte(FIRST_OPERATOR + index as u8);
        } else {
            // var-use
            let id = self.add_symbol(name, span)?;
            self.emit_u16(p, Instruction::LoadSymbol, id);
        }
        Ok(())
    }

    fn compile_keyword(&mut self, kw: Keyword, node: &Node, p: PageRef) -> CompileResult<()> {
        match kw {
            Keyword::If => self.compile_if(node, p),
            Keyword::Let | Keyword::Mut => self.compile_let_mut(kw, node, p),
            Keyword::Set => self.compile_set(node, p),
            Keyword::Fun => self.compile_function(node, p),
            Keyword::Begin => {
                for child in &node.children()[1..] {
                    self.compile_node(child, p)?;
                }
                Ok(())
            }
            Keyword::While => self.compile_while(node, p),
            Keyword::Import => self.compile_plugin_import(node, p),
            Keyword::Quote => self.compile_quote(node, p),
            Keyword::Del => self.compile_del(node, p),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Specific forms (list, append, concat, pop, and in-place variants)
    // ─────────────────────────────────────────────────────────────────────────

    fn compile_specific(&mut self, head: &str, node: &Node, p: PageRef) -> CompileResult<()> {
        let inst = Instruction::specific(head).unwrap_or(Instruction::List);
        let children = node.children();

        // Arguments, not counting GetField attachments.
        let argc = children[1..].iter().filter(|c| !c.is_get_field()).count() as u16;
        if argc < 2 && inst != Instruction::List {
            return Err(CompileError::new(
                format!("can not use {head} with less than 2 arguments"),
                node.span,
            ));
        }

        // Compile arguments in reverse order, keeping each run of GetField
        // attachments after the base expression it belongs to.
        let mut i = children.len() - 1;
        while i > 0 {
            let mut j = i;
            while children[j].is_get_field() {
                j -= 1;
            }
            let diff = i - j;
            let mut k = j;
            while k < i {
                self.compile_node(&children[k], p)?;
                k += 1;
            }
            self.compile_node(&children[i], p)?;
            i -= diff;
            if i == 0 {
                break;
            }
            i -= 1;
        }

        self.emit(p, inst);
        match inst {
            Instruction::List => self.page_mut(p).push_u16(argc),
            Instruction::Append
            | Instruction::AppendInPlace
            | Instruction::Concat
            | Instruction::ConcatInPlace => self.page_mut(p).push_u16(argc - 1),
            _ => {}
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keyword forms
    // ─────────────────────────────────────────────────────────────────────────

    fn compile_if(&mut self, node: &Node, p: PageRef) -> CompileResult<()> {
        let children = node.children();
        if children.len() != 3 && children.len() != 4 {
            return Err(CompileError::new(
                "`if' expects a condition, a then-expression and an optional else-expression",
                node.span,
            ));
        }

        self.compile_node(&children[1], p)?;
        // Jump over the else code when the condition holds.
        let jump_to_if = self.emit_jump(p, Instruction::PopJumpIfTrue);
        if children.len() == 4 {
            self.compile_node(&children[3], p)?;
        }
        let jump_to_end = self.emit_jump(p, Instruction::Jump);
        self.patch_jump(p, jump_to_if);
        self.compile_node(&children[2], p)?;
        self.patch_jump(p, jump_to_end);
        Ok(())
    }

    fn compile_let_mut(&mut self, kw: Keyword, node: &Node, p: PageRef) -> CompileResult<()> {
        let children = node.children();
        let name = match children.get(1).map(|n| &n.kind) {
            Some(NodeKind::Symbol(name)) => name.clone(),
            _ => {
                return Err(CompileError::new(
                    format!("`{}' expects a variable name", kw.name()),
                    node.span,
                ))
            }
        };
        if children.len() < 3 {
            return Err(CompileError::new(
                format!("`{}' expects a value expression", kw.name()),
                node.span,
            ));
        }

        let id = self.add_symbol(&name, children[1].span)?;
        self.add_defined_symbol(&name);
        self.put_value(node, p)?;
        let inst = if kw == Keyword::Let {
            Instruction::Let
        } else {
            Instruction::Mut
        };
        self.emit_u16(p, inst, id);
        Ok(())
    }

    fn compile_set(&mut self, node: &Node, p: PageRef) -> CompileResult<()> {
        let children = node.children();
        let name = match children.get(1).map(|n| &n.kind) {
            Some(NodeKind::Symbol(name)) => name.clone(),
            _ => {
                return Err(CompileError::new(
                    "`set' expects a variable name",
                    node.span,
                ))
            }
        };
        if children.len() < 3 {
            return Err(CompileError::new(
                "`set' expects a value expression",
                node.span,
            ));
        }

        // The name is not registered as defined: the final symbol pass will
        // flag a `set` whose target is never bound anywhere.
        let id = self.add_symbol(&name, children[1].span)?;
        self.put_value(node, p)?;
        self.emit_u16(p, Instruction::Store, id);
        Ok(())
    }

    fn compile_function(&mut self, node: &Node, p: PageRef) -> CompileResult<()> {
        let children = node.children();
        let params = match children.get(1) {
            Some(params) if matches!(params.kind, NodeKind::List(_)) => params.children(),
            _ => {
                return Err(CompileError::new(
                    "`fun' expects a parameter list and a body expression",
                    node.span,
                ))
            }
        };
        if children.len() != 3 {
            return Err(CompileError::new(
                "`fun' expects exactly one body expression (wrap several in a begin block)",
                node.span,
            ));
        }

        // Captures are emitted on the *current* page, before the closure is
        // materialised, so the VM snapshots the enclosing scope values.
        for param in params {
            if let NodeKind::Capture(name) = &param.kind {
                if !self.defined_symbols.iter().any(|s| s == name) {
                    return Err(CompileError::new(
                        format!(
                            "Can not capture {name} because it is referencing an unbound variable."
                        ),
                        param.span,
                    ));
                }
                self.add_defined_symbol(name);
                let id = self.add_symbol(name, param.span)?;
                self.emit_u16(p, Instruction::Capture, id);
            }
        }

        // New page for the function body, referenced through the constants.
        self.pages.push(Page::new());
        let page_id = self.pages.len() - 1;
        if page_id > u16::MAX as usize {
            return Err(CompileError::new(
                "Too many code pages (exceeds 65'536), aborting compilation.",
                node.span,
            ));
        }
        let id = self.add_value(ConstValue::PageAddr(page_id as u16), node.span)?;
        self.emit_u16(p, Instruction::LoadConst, id);

        // Bind arguments from the stack into the callee scope.
        let body_page = PageRef::Final(page_id);
        for param in params {
            if let NodeKind::Symbol(name) = &param.kind {
                let id = self.add_symbol(name, param.span)?;
                self.add_defined_symbol(name);
                self.emit_u16(body_page, Instruction::Mut, id);
            }
        }

        self.compile_node(&children[2], body_page)?;
        self.emit(body_page, Instruction::Ret);
        Ok(())
    }

    fn compile_while(&mut self, node: &Node, p: PageRef) -> CompileResult<()> {
        let children = node.children();
        if children.len() != 3 {
            return Err(CompileError::new(
                "`while' expects a condition and a body expression",
                node.span,
            ));
        }

        // Loop start: the condition is re-evaluated every iteration.
        let current = self.page_len(p) as u16;
        self.compile_node(&children[1], p)?;
        let jump_to_end = self.emit_jump(p, Instruction::PopJumpIfFalse);
        self.compile_node(&children[2], p)?;
        self.emit_u16(p, Instruction::Jump, current);
        self.patch_jump(p, jump_to_end);
        Ok(())
    }

    fn compile_quote(&mut self, node: &Node, p: PageRef) -> CompileResult<()> {
        let children = node.children();
        if children.len() != 2 {
            return Err(CompileError::new(
                "`quote' expects exactly one expression",
                node.span,
            ));
        }

        // The quoted expression gets its own page, entered like a 0-ary call.
        self.pages.push(Page::new());
        let page_id = self.pages.len() - 1;
        let body_page = PageRef::Final(page_id);
        self.compile_node(&children[1], body_page)?;
        self.emit(body_page, Instruction::Ret);

        let id = self.add_value(ConstValue::PageAddr(page_id as u16), node.span)?;
        self.emit_u16(p, Instruction::LoadConst, id);
        Ok(())
    }

    fn compile_plugin_import(&mut self, node: &Node, p: PageRef) -> CompileResult<()> {
        let children = node.children();
        let path = match children.get(1).map(|n| &n.kind) {
            Some(NodeKind::Str(path)) if children.len() == 2 => path.clone(),
            _ => {
                return Err(CompileError::new(
                    "`import' expects a module path string",
                    node.span,
                ))
            }
        };

        let id = self.add_value(ConstValue::Str(path.clone()), children[1].span)?;
        // Remember the plugin so its exported names pass the symbol check.
        self.plugins.push(path);
        self.emit_u16(p, Instruction::Plugin, id);
        Ok(())
    }

    fn compile_del(&mut self, node: &Node, p: PageRef) -> CompileResult<()> {
        let children = node.children();
        let name = match children.get(1).map(|n| &n.kind) {
            Some(NodeKind::Symbol(name)) if children.len() == 2 => name.clone(),
            _ => {
                return Err(CompileError::new(
                    "`del' expects a variable name",
                    node.span,
                ))
            }
        };

        let id = self.add_symbol(&name, children[1].span)?;
        self.emit_u16(p, Instruction::Del, id);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // General calls
    // ─────────────────────────────────────────────────────────────────────────

    fn compile_call(&mut self, node: &Node, p: PageRef) -> CompileResult<()> {
        let children = node.children();

        // The callee (and any chained `.field` attachments) goes onto a
        // scratch page so it can land after the arguments.
        self.temp_pages.push(Page::new());
        let proc_page = PageRef::Temp(self.temp_pages.len() - 1);
        self.compile_node(&children[0], proc_page)?;

        let mut n = 1;
        while n < children.len() && children[n].is_get_field() {
            self.compile_node(&children[n], proc_page)?;
            n += 1;
        }
        let proc_len = self.page_len(proc_page);
        if proc_len == 0 {
            return Err(CompileError::new(
                "can not call an expression that produces no value",
                children[0].span,
            ));
        }

        // Operators lower to exactly 1 byte; anything longer is a
        // builtin/function value that must be applied with CALL.
        if proc_len > 1 {
            for exp in &children[n..] {
                self.compile_node(exp, p)?;
            }
            let scratch = self.temp_pages.pop().unwrap_or_default();
            self.page_mut(p).append_page(&scratch);

            let argc = children[1..]
                .iter()
                .filter(|c| !c.is_get_field() && !c.is_capture())
                .count() as u16;
            self.emit_u16(p, Instruction::Call, argc);
            return Ok(());
        }

        let op = self.temp_pages.pop().unwrap_or_default().as_bytes()[0];

        // `(op a b c d)` lowers to `a b op c op d op`: emit the operator
        // after the second and each subsequent completed argument.
        let mut exp_count = 0usize;
        for index in n..children.len() {
            self.compile_node(&children[index], p)?;
            let completes = index + 1 == children.len()
                || (!children[index + 1].is_get_field() && !children[index + 1].is_capture());
            if completes {
                exp_count += 1;
                if exp_count >= 2 {
                    self.page_mut(p).push_byte(op);
                }
            }
        }
        // Unary application still needs the operator byte.
        if exp_count == 1 {
            self.page_mut(p).push_byte(op);
        }

        if exp_count > 2 {
            let inst = Instruction::try_from(op).expect("operator byte decodes");
            if !CHAINABLE_OPERATORS.contains(&inst) {
                let name = inst.operator_name().unwrap_or("?");
                return Err(CompileError::new(
                    format!(
                        "can not create a chained expression (of length {exp_count}) for \
                         operator `{name}'. You most likely forgot a `)'."
                    ),
                    node.span,
                ));
            }
        }
        Ok(())
    }

    /// Compile the value expressions of a `(let|mut|set name …)` node.
    fn put_value(&mut self, node: &Node, p: PageRef) -> CompileResult<()> {
        for child in &node.children()[2..] {
            self.compile_node(child, p)?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tables
    // ─────────────────────────────────────────────────────────────────────────

    fn builtin_id(&self, name: &str, span: Span) -> CompileResult<u16> {
        builtins_index(&self.builtin_names, name)
            .ok_or_else(|| CompileError::new(format!("unknown builtin `{name}'"), span))
    }

    /// Register `name` in the symbol table, returning its stable id.
    fn add_symbol(&mut self, name: &str, span: Span) -> CompileResult<u16> {
        if let Some(pos) = self.symbols.iter().position(|(s, _)| s == name) {
            return Ok(pos as u16);
        }
        if self.symbols.len() > u16::MAX as usize {
            return Err(CompileError::new(
                "Too many symbols (exceeds 65'536), aborting compilation.",
                span,
            ));
        }
        self.symbols.push((name.to_string(), span));
        Ok((self.symbols.len() - 1) as u16)
    }

    /// Register a constant in the value table, returning its stable id.
    fn add_value(&mut self, value: ConstValue, span: Span) -> CompileResult<u16> {
        if let Some(pos) = self.values.iter().position(|v| *v == value) {
            return Ok(pos as u16);
        }
        if self.values.len() > u16::MAX as usize {
            return Err(CompileError::new(
                "Too many values (exceeds 65'536), aborting compilation.",
                span,
            ));
        }
        self.values.push(value);
        Ok((self.values.len() - 1) as u16)
    }

    fn add_defined_symbol(&mut self, name: &str) {
        if !self.defined_symbols.iter().any(|s| s == name) {
            self.defined_symbols.push(name.to_string());
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Undefined-symbol pass
    // ─────────────────────────────────────────────────────────────────────────

    /// Could `name` be exported by one of the imported plugins?
    ///
    /// The prefix before the first `:` is compared against each plugin path's
    /// file stem, so `(import "mod.arkm")` vouches for `mod:anything`.
    fn may_be_from_plugin(&self, name: &str) -> bool {
        let prefix = name.split(':').next().unwrap_or(name);
        self.plugins.iter().any(|plugin| {
            Path::new(plugin)
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| stem == prefix)
        })
    }

    fn check_for_undefined_symbols(&self) -> CompileResult<()> {
        for (name, span) in &self.symbols {
            let defined = self.defined_symbols.iter().any(|s| s == name);
            if !defined && !self.may_be_from_plugin(name) {
                return Err(CompileError::new(
                    "Unbound variable error (variable is used but not defined)",
                    *span,
                ));
            }
        }
        Ok(())
    }
}

/// Position of `name` in the builtin registry names.
fn builtins_index(names: &[&'static str], name: &str) -> Option<u16> {
    names.iter().position(|entry| *entry == name).map(|i| i as u16)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
