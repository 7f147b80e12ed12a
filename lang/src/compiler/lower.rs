use std::collections::{BTreeSet, HashMap};

use typed_index_collections::TiVec;

use crate::{
    bytecode::{
        BinaryOp, Binding, Constant, Function, FunctionIndex, Image, Import, ImportIndex, Op,
        TypeIndex, UnaryOp, Visibility,
    },
    diagnostic::{Code, Diagnostic},
    parser::{Block, Else, Expr, ExprKind, Ident, LambdaBody, Place, Stmt, SyntaxTree, TypeDecl},
    references::{ModuleBinding, ReferenceSet},
    source::{SourceUnit, Span},
    types::{accepts, Type},
};

use super::{
    declare::{MethodInfo, TypeInfo},
    EntryPointDescriptor, OutputKind,
};

pub(super) struct Lowered {
    pub image: Image,
    pub entry: Option<EntryPointDescriptor>,
    pub diagnostics: Vec<Diagnostic>,
}

pub(super) fn lower(
    source: &SourceUnit,
    tree: &SyntaxTree,
    references: &ReferenceSet,
    output_kind: OutputKind,
    unit_name: String,
) -> Lowered {
    let mut cx = Lowering {
        source,
        references,
        image: Image {
            name: unit_name,
            ..Image::default()
        },
        types: TiVec::new(),
        decl_types: vec![],
        imports: HashMap::new(),
        diagnostics: vec![],
        lambdas: 0,
    };
    cx.declare(tree);
    cx.define(tree);
    let entry = match output_kind {
        OutputKind::Executable => cx.select_entry(),
        OutputKind::Library => None,
    };

    let mut diagnostics = cx.diagnostics;
    diagnostics.sort_by_key(|d| {
        d.location
            .map(|l| (l.line, l.col))
            .unwrap_or((usize::MAX, 0))
    });
    Lowered {
        image: cx.image,
        entry,
        diagnostics,
    }
}

pub(super) struct Lowering<'a> {
    pub source: &'a SourceUnit,
    pub references: &'a ReferenceSet,
    pub image: Image,
    /// Parallel to `image.types`.
    pub types: TiVec<TypeIndex, TypeInfo>,
    /// Per `TypeDecl` in the tree; `None` for rejected duplicates.
    pub decl_types: Vec<Option<TypeIndex>>,
    pub imports: HashMap<(String, String), ImportIndex>,
    pub diagnostics: Vec<Diagnostic>,
    lambdas: usize,
}

impl<'a> Lowering<'a> {
    pub(super) fn error(&mut self, code: Code, message: impl Into<String>, span: Span) {
        let diagnostic = Diagnostic::error(code, message).at(self.source, span);
        self.diagnostics.push(diagnostic);
    }

    fn warning(&mut self, code: Code, message: impl Into<String>, span: Span) {
        let diagnostic = Diagnostic::warning(code, message).at(self.source, span);
        self.diagnostics.push(diagnostic);
    }

    fn import(&mut self, binding: &ModuleBinding, function: &str) -> ImportIndex {
        let key = (binding.name.clone(), function.to_owned());
        if let Some(index) = self.imports.get(&key) {
            return *index;
        }
        let index = self.image.imports.push_and_get_key(Import {
            module: binding.name.clone(),
            major: binding.version.major,
            minor: binding.version.minor,
            function: function.to_owned(),
        });
        self.imports.insert(key, index);
        index
    }

    fn define(&mut self, tree: &SyntaxTree) {
        for (decl, ty) in tree.types.iter().zip(self.decl_types.clone()) {
            let Some(ty) = ty else {
                continue;
            };
            self.define_initializer(ty, decl);

            for method in self.types[ty].methods.clone() {
                let f = &decl.functions[method.decl];
                let mut body = FnLowerer::new(self, ty, &method.name, method.ret.clone());
                if !method.is_static {
                    let slot = body.alloc();
                    body.self_slot = Some(slot);
                }
                for (param, param_ty) in f.params.iter().zip(&method.params) {
                    body.declare_param(&param.name, param_ty.clone());
                }
                body.block(&f.body);
                let (code, locals) = body.finish();

                if !returns_nothing(&method.ret) && !block_returns(&f.body) {
                    self.error(
                        Code::MissingReturn,
                        format!(
                            "`{}` must return a value of type {} on every path",
                            method.name, method.ret
                        ),
                        method.span,
                    );
                }
                let function = &mut self.image.functions[method.index];
                function.code = code;
                function.locals = locals;
            }
        }
    }

    /// Synthesizes the function that stores every field default into a
    /// fresh instance.
    fn define_initializer(&mut self, ty: TypeIndex, decl: &TypeDecl) {
        let fields = self.types[ty].fields.clone();
        if fields.is_empty() {
            return;
        }
        let index = self.image.functions.push_and_get_key(Function {
            name: "<init>".to_owned(),
            owner: Some(ty),
            visibility: Visibility::Private,
            binding: Binding::Instance,
            arity: 1,
            locals: 1,
            code: vec![],
        });

        let mut body = FnLowerer::new(self, ty, "<init>", Type::Unit);
        let receiver = body.alloc();
        body.self_slot = Some(receiver);
        for (i, field) in fields.iter().enumerate() {
            body.emit(Op::Load(receiver));
            match &decl.fields[field.decl].init {
                Some(init) => {
                    let actual = body.expr(init, Some(&field.ty));
                    body.check(&field.ty, &actual, init.span);
                }
                None => body.default_value(&field.ty),
            }
            body.emit(Op::StoreField(i));
        }
        let (code, locals) = body.finish();

        let function = &mut self.image.functions[index];
        function.code = code;
        function.locals = locals;
        self.image.types[ty].initializer = Some(index);
    }
}

fn returns_nothing(ty: &Type) -> bool {
    matches!(ty, Type::Unit | Type::Dyn | Type::Error)
}

fn block_returns(block: &Block) -> bool {
    block.stmts.iter().any(stmt_returns)
}

fn stmt_returns(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Return { .. } => true,
        Stmt::If {
            then,
            otherwise: Some(otherwise),
            ..
        } => {
            block_returns(then)
                && match otherwise {
                    Else::Block(block) => block_returns(block),
                    Else::If(stmt) => stmt_returns(stmt),
                }
        }
        _ => false,
    }
}

struct Local {
    name: String,
    slot: usize,
    ty: Type,
    used: bool,
    /// Where to point an unused-local warning; `None` for slots that are
    /// never linted.
    lint: Option<Span>,
}

/// Lowers one function body, checking types as it emits.
struct FnLowerer<'l, 'a> {
    cx: &'l mut Lowering<'a>,
    owner: TypeIndex,
    namespace: String,
    name: String,
    self_slot: Option<usize>,
    ret: Type,
    scopes: Vec<Vec<Local>>,
    next_slot: usize,
    code: Vec<Op>,
}

impl<'l, 'a> FnLowerer<'l, 'a> {
    fn new(cx: &'l mut Lowering<'a>, owner: TypeIndex, name: &str, ret: Type) -> Self {
        let namespace = cx.types[owner].namespace.clone();
        FnLowerer {
            cx,
            owner,
            namespace,
            name: name.to_owned(),
            self_slot: None,
            ret,
            scopes: vec![vec![]],
            next_slot: 0,
            code: vec![],
        }
    }

    fn finish(mut self) -> (Vec<Op>, usize) {
        while !self.scopes.is_empty() {
            self.pop_scope();
        }
        self.emit(Op::Push(Constant::Unit));
        self.emit(Op::Return);
        (self.code, self.next_slot)
    }

    fn emit(&mut self, op: Op) -> usize {
        self.code.push(op);
        self.code.len() - 1
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn patch(&mut self, at: usize, target: usize) {
        match &mut self.code[at] {
            Op::Jump(t) | Op::JumpUnless(t) | Op::IterNext { exit: t, .. } => *t = target,
            other => panic!("patching a non-jump op: {other:?}"),
        }
    }

    fn alloc(&mut self) -> usize {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    fn declare(&mut self, name: &str, ty: Type, lint: Option<Span>) -> usize {
        let slot = self.alloc();
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(Local {
                name: name.to_owned(),
                slot,
                ty,
                used: false,
                lint,
            });
        }
        slot
    }

    fn declare_param(&mut self, name: &Ident, ty: Type) {
        let duplicate = self
            .scopes
            .last()
            .is_some_and(|scope| scope.iter().any(|l| l.name == name.name));
        if duplicate {
            self.cx.error(
                Code::DuplicateDefinition,
                format!("parameter `{}` is declared more than once", name.name),
                name.span,
            );
        }
        self.declare(&name.name, ty, None);
    }

    /// Finds the innermost local of that name and marks it used.
    fn lookup(&mut self, name: &str) -> Option<(usize, Type)> {
        let local = self
            .scopes
            .iter_mut()
            .rev()
            .flat_map(|scope| scope.iter_mut().rev())
            .find(|l| l.name == name)?;
        local.used = true;
        Some((local.slot, local.ty.clone()))
    }

    /// Like [`Self::lookup`], for writes.
    fn lookup_for_store(&self, name: &str) -> Option<(usize, Type)> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|l| l.name == name)
            .map(|l| (l.slot, l.ty.clone()))
    }

    fn push_scope(&mut self) {
        self.scopes.push(vec![]);
    }

    fn pop_scope(&mut self) {
        let Some(scope) = self.scopes.pop() else {
            return;
        };
        for local in scope {
            if let Some(span) = local.lint {
                if !local.used && !local.name.starts_with('_') {
                    self.cx.warning(
                        Code::UnusedLocal,
                        format!("unused local `{}`", local.name),
                        span,
                    );
                }
            }
        }
    }

    fn error(&mut self, code: Code, message: impl Into<String>, span: Span) -> Type {
        self.cx.error(code, message, span);
        Type::Error
    }

    fn check(&mut self, expected: &Type, actual: &Type, span: Span) {
        if !accepts(expected, actual, &mut None) {
            self.error(
                Code::TypeMismatch,
                format!("expected {expected}, found {actual}"),
                span,
            );
        }
    }

    fn owner_type(&self) -> Type {
        Type::Object(self.cx.types[self.owner].full_name.clone())
    }

    fn default_value(&mut self, ty: &Type) {
        match ty {
            Type::Int => self.emit(Op::Push(Constant::Int(0))),
            Type::Bool => self.emit(Op::Push(Constant::Bool(false))),
            Type::Str => self.emit(Op::Push(Constant::Str(String::new()))),
            Type::Array(_) => self.emit(Op::MakeArray(0)),
            _ => self.emit(Op::Push(Constant::Unit)),
        };
    }

    fn block(&mut self, block: &Block) {
        self.push_scope();
        for stmt in &block.stmts {
            self.stmt(stmt);
        }
        self.pop_scope();
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Let {
                name, ty, value, ..
            } => {
                let namespace = self.namespace.clone();
                let declared = ty.as_ref().map(|t| self.cx.resolve_type(t, &namespace));
                let actual = self.expr(value, declared.as_ref());
                let ty = match declared {
                    Some(declared) => {
                        self.check(&declared, &actual, value.span);
                        declared
                    }
                    None => actual,
                };
                let slot = self.declare(&name.name, ty, Some(name.span));
                self.emit(Op::Store(slot));
            }
            Stmt::Assign {
                target: Place::Local(name),
                value,
                ..
            } => match self.lookup_for_store(&name.name) {
                Some((slot, ty)) => {
                    let actual = self.expr(value, Some(&ty));
                    self.check(&ty, &actual, value.span);
                    self.emit(Op::Store(slot));
                }
                None => {
                    self.error(
                        Code::UnknownName,
                        format!("unknown name `{}`", name.name),
                        name.span,
                    );
                    self.expr(value, None);
                }
            },
            Stmt::Assign {
                target: Place::Field(field),
                value,
                span,
            } => {
                let Some(receiver) = self.self_slot else {
                    self.error(
                        Code::SelfOutsideInstance,
                        "fields can only be assigned in instance methods",
                        *span,
                    );
                    self.expr(value, None);
                    return;
                };
                let owner = self.cx.types[self.owner].full_name.clone();
                let Some((index, ty)) = self.cx.field_of(&owner, &field.name) else {
                    self.error(
                        Code::UnknownField,
                        format!("type `{owner}` has no field `{}`", field.name),
                        field.span,
                    );
                    self.expr(value, None);
                    return;
                };
                self.emit(Op::Load(receiver));
                let actual = self.expr(value, Some(&ty));
                self.check(&ty, &actual, value.span);
                self.emit(Op::StoreField(index));
            }
            Stmt::For {
                binding,
                iterable,
                body,
                ..
            } => {
                let iterable_ty = self.expr(iterable, None);
                let elem = match iterable_ty.element() {
                    Some(elem) => elem,
                    None => self.error(
                        Code::InvalidOperation,
                        format!("cannot iterate over a value of type {iterable_ty}"),
                        iterable.span,
                    ),
                };
                self.emit(Op::IterStart);
                let cursor = self.alloc();
                self.emit(Op::Store(cursor));
                let head = self.emit(Op::IterNext {
                    slot: cursor,
                    exit: 0,
                });
                self.push_scope();
                let slot = self.declare(&binding.name, elem, None);
                self.emit(Op::Store(slot));
                self.block(body);
                self.pop_scope();
                self.emit(Op::Jump(head));
                let end = self.here();
                self.patch(head, end);
            }
            Stmt::While { cond, body, .. } => {
                let head = self.here();
                let cond_ty = self.expr(cond, Some(&Type::Bool));
                self.check(&Type::Bool, &cond_ty, cond.span);
                let exit = self.emit(Op::JumpUnless(0));
                self.block(body);
                self.emit(Op::Jump(head));
                let end = self.here();
                self.patch(exit, end);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
                ..
            } => {
                let cond_ty = self.expr(cond, Some(&Type::Bool));
                self.check(&Type::Bool, &cond_ty, cond.span);
                let skip_then = self.emit(Op::JumpUnless(0));
                self.block(then);
                match otherwise {
                    None => {
                        let end = self.here();
                        self.patch(skip_then, end);
                    }
                    Some(otherwise) => {
                        let skip_else = self.emit(Op::Jump(0));
                        let else_start = self.here();
                        self.patch(skip_then, else_start);
                        match otherwise {
                            Else::Block(block) => self.block(block),
                            Else::If(stmt) => self.stmt(stmt),
                        }
                        let end = self.here();
                        self.patch(skip_else, end);
                    }
                }
            }
            Stmt::Return { value, span } => {
                let ret = self.ret.clone();
                match value {
                    Some(value) => {
                        let actual = self.expr(value, Some(&ret));
                        self.check(&ret, &actual, value.span);
                    }
                    None => {
                        if !returns_nothing(&ret) {
                            self.error(
                                Code::TypeMismatch,
                                format!("expected a value of type {ret}"),
                                *span,
                            );
                        }
                        self.emit(Op::Push(Constant::Unit));
                    }
                }
                self.emit(Op::Return);
            }
            Stmt::Expr(expr) => {
                let ty = self.expr(expr, None);
                if matches!(ty, Type::Seq(_)) {
                    self.cx.warning(
                        Code::DiscardedSequence,
                        "sequence is discarded without being enumerated; its functions never run",
                        expr.span,
                    );
                }
                self.emit(Op::Pop);
            }
        }
    }

    /// Emits code leaving exactly one value on the operand stack.
    fn expr(&mut self, expr: &Expr, expected: Option<&Type>) -> Type {
        match &expr.kind {
            ExprKind::Int(i) => {
                self.emit(Op::Push(Constant::Int(*i)));
                Type::Int
            }
            ExprKind::Str(s) => {
                self.emit(Op::Push(Constant::Str(s.clone())));
                Type::Str
            }
            ExprKind::Bool(b) => {
                self.emit(Op::Push(Constant::Bool(*b)));
                Type::Bool
            }
            ExprKind::Array(items) => {
                let mut elem = match expected {
                    Some(Type::Array(e)) | Some(Type::Seq(e)) => Some((**e).clone()),
                    _ => None,
                };
                for item in items {
                    let actual = self.expr(item, elem.as_ref());
                    match &elem {
                        Some(e) => {
                            let e = e.clone();
                            self.check(&e, &actual, item.span);
                        }
                        None => elem = Some(actual),
                    }
                }
                self.emit(Op::MakeArray(items.len()));
                Type::array(elem.unwrap_or(Type::Dyn))
            }
            ExprKind::SelfRef => match self.self_slot {
                Some(slot) => {
                    self.emit(Op::Load(slot));
                    self.owner_type()
                }
                None => self.error(
                    Code::SelfOutsideInstance,
                    "`self` is only available in instance methods",
                    expr.span,
                ),
            },
            ExprKind::Path(segments) => match segments.as_slice() {
                [name] => match self.lookup(&name.name) {
                    Some((slot, ty)) => {
                        self.emit(Op::Load(slot));
                        ty
                    }
                    None => self.error(
                        Code::UnknownName,
                        format!("unknown name `{}`", name.name),
                        name.span,
                    ),
                },
                _ => self.error(
                    Code::InvalidOperation,
                    format!("`{}` is not a value", path_text(segments)),
                    expr.span,
                ),
            },
            ExprKind::Call { callee, args } => self.call(callee, args, expr.span),
            ExprKind::MethodCall {
                target,
                method,
                args,
            } => self.method_call(target, method, args, expr.span),
            ExprKind::Field { target, name } => {
                let target_ty = self.expr(target, None);
                match &target_ty {
                    Type::Object(full_name) => match self.cx.field_of(full_name, &name.name) {
                        Some((index, ty)) => {
                            self.emit(Op::LoadField(index));
                            ty
                        }
                        None => self.error(
                            Code::UnknownField,
                            format!("type `{full_name}` has no field `{}`", name.name),
                            name.span,
                        ),
                    },
                    Type::Error => Type::Error,
                    other => self.error(
                        Code::InvalidOperation,
                        format!("a value of type {other} has no fields"),
                        name.span,
                    ),
                }
            }
            ExprKind::Index { target, index } => {
                let target_ty = self.expr(target, None);
                let index_ty = self.expr(index, Some(&Type::Int));
                self.check(&Type::Int, &index_ty, index.span);
                self.emit(Op::Index);
                match target_ty {
                    Type::Array(elem) => *elem,
                    Type::Dyn => Type::Dyn,
                    Type::Error => Type::Error,
                    other => self.error(
                        Code::InvalidOperation,
                        format!("cannot index a value of type {other}"),
                        target.span,
                    ),
                }
            }
            ExprKind::New(name) => match self.cx.find_type(&name.name, &self.namespace) {
                Some(ty) => {
                    self.emit(Op::New(ty));
                    Type::Object(self.cx.types[ty].full_name.clone())
                }
                None => self.error(
                    Code::UnknownType,
                    format!("unknown type `{}`", name.name),
                    name.span,
                ),
            },
            ExprKind::Lambda { params, body } => self.lambda(params, body, expected),
            ExprKind::Unary { op, operand } => {
                let want = match op {
                    UnaryOp::Not => Type::Bool,
                    UnaryOp::Neg => Type::Int,
                };
                let actual = self.expr(operand, Some(&want));
                self.emit(Op::Unary(*op));
                if accepts(&want, &actual, &mut None) {
                    want
                } else {
                    self.error(
                        Code::InvalidOperands,
                        format!("`{}` cannot be applied to {actual}", op.symbol()),
                        expr.span,
                    )
                }
            }
            ExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, expr.span),
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr, span: Span) -> Type {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                let lhs_ty = self.expr(lhs, Some(&Type::Bool));
                let rhs_ty;
                if op == BinaryOp::And {
                    let short = self.emit(Op::JumpUnless(0));
                    rhs_ty = self.expr(rhs, Some(&Type::Bool));
                    let end = self.emit(Op::Jump(0));
                    let at = self.here();
                    self.patch(short, at);
                    self.emit(Op::Push(Constant::Bool(false)));
                    let at = self.here();
                    self.patch(end, at);
                } else {
                    let eval_rhs = self.emit(Op::JumpUnless(0));
                    self.emit(Op::Push(Constant::Bool(true)));
                    let end = self.emit(Op::Jump(0));
                    let at = self.here();
                    self.patch(eval_rhs, at);
                    rhs_ty = self.expr(rhs, Some(&Type::Bool));
                    let at = self.here();
                    self.patch(end, at);
                }
                let both_bool = accepts(&Type::Bool, &lhs_ty, &mut None)
                    && accepts(&Type::Bool, &rhs_ty, &mut None);
                if both_bool {
                    Type::Bool
                } else {
                    self.error(
                        Code::InvalidOperands,
                        format!("`{}` cannot be applied to {lhs_ty} and {rhs_ty}", op.symbol()),
                        span,
                    )
                }
            }
            _ => {
                let lhs_ty = self.expr(lhs, None);
                let rhs_ty = self.expr(rhs, None);
                self.emit(Op::Binary(op));
                match binary_type(op, &lhs_ty, &rhs_ty) {
                    Some(ty) => ty,
                    None => self.error(
                        Code::InvalidOperands,
                        format!("`{}` cannot be applied to {lhs_ty} and {rhs_ty}", op.symbol()),
                        span,
                    ),
                }
            }
        }
    }

    fn call(&mut self, callee: &Expr, args: &[Expr], span: Span) -> Type {
        let ExprKind::Path(segments) = &callee.kind else {
            let callee_ty = self.expr(callee, None);
            return self.call_value(callee_ty, args, "expression", span);
        };
        match segments.as_slice() {
            [name] => {
                if let Some((slot, ty)) = self.lookup(&name.name) {
                    self.emit(Op::Load(slot));
                    return self.call_value(ty, args, &name.name, span);
                }
                match self.cx.method_of(self.owner, &name.name) {
                    Some(method) => self.call_method(method, false, args, span),
                    None => {
                        self.lower_args_unchecked(args);
                        self.error(
                            Code::UnknownFunction,
                            format!("unknown function `{}`", name.name),
                            name.span,
                        )
                    }
                }
            }
            [qualifier, function] => self.call_path(qualifier, function, args, span),
            _ => {
                self.lower_args_unchecked(args);
                self.error(
                    Code::InvalidOperation,
                    format!("cannot call `{}`", path_text(segments)),
                    callee.span,
                )
            }
        }
    }

    /// `Type::function(..)` or `module::function(..)`.
    fn call_path(&mut self, qualifier: &Ident, function: &Ident, args: &[Expr], span: Span) -> Type {
        let path = format!("{}::{}", qualifier.name, function.name);

        if let Some(ty) = self.cx.find_type(&qualifier.name, &self.namespace) {
            return match self.cx.method_of(ty, &function.name) {
                Some(method) if method.is_static => {
                    self.check_visible(ty, &method, span);
                    self.call_method(method, false, args, span)
                }
                Some(_) => {
                    self.lower_args_unchecked(args);
                    self.error(
                        Code::InvalidOperation,
                        format!("`{path}` is an instance method; call it on an instance"),
                        span,
                    )
                }
                None => {
                    self.lower_args_unchecked(args);
                    self.error(
                        Code::UnknownFunction,
                        format!("unknown function `{path}`"),
                        function.span,
                    )
                }
            };
        }

        let references = self.cx.references;
        let Some(binding) = references.get(&qualifier.name) else {
            self.lower_args_unchecked(args);
            return self.error(
                Code::UnresolvedModule,
                format!(
                    "unresolved module `{}` in call to `{path}`",
                    qualifier.name
                ),
                qualifier.span,
            );
        };
        let Some(native) = binding.module.function(&function.name) else {
            self.lower_args_unchecked(args);
            return self.error(
                Code::UnknownFunction,
                format!("unknown function `{path}`"),
                function.span,
            );
        };
        let bound = self.args(&native.params, args, &path, span);
        let import = self.cx.import(binding, &function.name);
        self.emit(Op::CallNative {
            import,
            argc: args.len(),
        });
        native.ret.substitute(&bound)
    }

    fn method_call(&mut self, target: &Expr, method: &Ident, args: &[Expr], span: Span) -> Type {
        let target_ty = self.expr(target, None);
        let full_name = match &target_ty {
            Type::Object(full_name) => full_name.clone(),
            Type::Error => {
                self.lower_args_unchecked(args);
                return Type::Error;
            }
            other => {
                self.lower_args_unchecked(args);
                return self.error(
                    Code::UnknownMethod,
                    format!("type {other} has no method `{}`", method.name),
                    method.span,
                );
            }
        };
        let found = self
            .cx
            .type_named(&full_name)
            .and_then(|ty| Some((ty, self.cx.method_of(ty, &method.name)?)));
        match found {
            Some((_, info)) if info.is_static => {
                self.lower_args_unchecked(args);
                self.error(
                    Code::InvalidOperation,
                    format!(
                        "`{}` is static; call it as `{}::{}(..)`",
                        method.name, full_name, method.name
                    ),
                    method.span,
                )
            }
            Some((ty, info)) => {
                self.check_visible(ty, &info, span);
                self.call_method(info, true, args, span)
            }
            None => {
                self.lower_args_unchecked(args);
                self.error(
                    Code::UnknownMethod,
                    format!("type `{full_name}` has no method `{}`", method.name),
                    method.span,
                )
            }
        }
    }

    fn check_visible(&mut self, ty: TypeIndex, method: &MethodInfo, span: Span) {
        if ty != self.owner && !method.is_pub {
            let owner = self.cx.types[ty].full_name.clone();
            self.error(
                Code::InvalidOperation,
                format!("`{}` of `{owner}` is private", method.name),
                span,
            );
        }
    }

    /// Calls a declared function. Instance methods take the receiver in
    /// slot 0: either already on the stack, or `self`.
    fn call_method(&mut self, method: MethodInfo, receiver_pushed: bool, args: &[Expr], span: Span) -> Type {
        let mut argc = args.len();
        if !method.is_static {
            argc += 1;
            if !receiver_pushed {
                match self.self_slot {
                    Some(slot) => {
                        self.emit(Op::Load(slot));
                    }
                    None => {
                        self.error(
                            Code::SelfOutsideInstance,
                            format!(
                                "instance method `{}` called without an instance",
                                method.name
                            ),
                            span,
                        );
                    }
                }
            }
        }
        self.args(&method.params, args, &method.name, span);
        self.emit(Op::Call {
            function: method.index,
            argc,
        });
        method.ret
    }

    fn call_value(&mut self, callee_ty: Type, args: &[Expr], what: &str, span: Span) -> Type {
        match callee_ty {
            Type::Fn(params, ret) => {
                self.args(&params, args, what, span);
                self.emit(Op::CallClosure { argc: args.len() });
                *ret
            }
            Type::Dyn => {
                self.lower_args_unchecked(args);
                self.emit(Op::CallClosure { argc: args.len() });
                Type::Dyn
            }
            Type::Error => {
                self.lower_args_unchecked(args);
                Type::Error
            }
            other => {
                self.lower_args_unchecked(args);
                self.error(
                    Code::InvalidOperation,
                    format!("`{what}` has type {other} and cannot be called"),
                    span,
                )
            }
        }
    }

    /// Lowers and checks arguments, returning what the signature's type
    /// parameter was bound to.
    fn args(&mut self, params: &[Type], args: &[Expr], callee: &str, span: Span) -> Option<Type> {
        if params.len() != args.len() {
            self.error(
                Code::ArgumentCount,
                format!(
                    "`{callee}` takes {} arguments but {} were supplied",
                    params.len(),
                    args.len()
                ),
                span,
            );
        }
        let mut bound = None;
        for (i, arg) in args.iter().enumerate() {
            let Some(param) = params.get(i) else {
                self.expr(arg, None);
                continue;
            };
            let expected = param.substitute(&bound);
            let actual = self.expr(arg, Some(&expected));
            if !accepts(param, &actual, &mut bound) {
                self.error(
                    Code::TypeMismatch,
                    format!(
                        "argument {} of `{callee}`: expected {}, found {actual}",
                        i + 1,
                        param.substitute(&bound)
                    ),
                    arg.span,
                );
            }
        }
        bound
    }

    fn lower_args_unchecked(&mut self, args: &[Expr]) {
        for arg in args {
            self.expr(arg, None);
        }
    }

    /// Lowers a lambda into its own function and emits the closure value.
    /// Enclosing locals the body mentions are copied in as leading slots.
    fn lambda(&mut self, params: &[Ident], body: &LambdaBody, expected: Option<&Type>) -> Type {
        let (param_tys, ret) = match expected {
            Some(Type::Fn(ps, r)) if ps.len() == params.len() => (ps.clone(), (**r).clone()),
            _ => (vec![Type::Dyn; params.len()], Type::Dyn),
        };

        let mut mentioned = BTreeSet::new();
        names_in_lambda(body, &mut mentioned);
        let mut captures: Vec<(String, usize, Type)> = vec![];
        for name in &mentioned {
            if name == "self" {
                if let Some(slot) = self.self_slot {
                    captures.push((name.clone(), slot, self.owner_type()));
                }
                continue;
            }
            if params.iter().any(|p| &p.name == name) {
                continue;
            }
            if let Some((slot, ty)) = self.lookup(name) {
                captures.push((name.clone(), slot, ty));
            }
        }
        for (_, slot, _) in &captures {
            self.emit(Op::Load(*slot));
        }

        self.cx.lambdas += 1;
        let name = format!("{}$lambda{}", self.name, self.cx.lambdas);
        let index = self.cx.image.functions.push_and_get_key(Function {
            name: name.clone(),
            owner: Some(self.owner),
            visibility: Visibility::Private,
            binding: Binding::Closure {
                captures: captures.len(),
            },
            arity: captures.len() + params.len(),
            locals: captures.len() + params.len(),
            code: vec![],
        });

        let mut inner = FnLowerer::new(&mut *self.cx, self.owner, &name, ret.clone());
        for (capture, _, ty) in &captures {
            let slot = inner.declare(capture, ty.clone(), None);
            if capture == "self" {
                inner.self_slot = Some(slot);
            }
        }
        for (param, ty) in params.iter().zip(&param_tys) {
            inner.declare_param(param, ty.clone());
        }
        let body_ret = match body {
            LambdaBody::Expr(expr) => {
                let actual = inner.expr(expr, Some(&ret));
                inner.check(&ret, &actual, expr.span);
                inner.emit(Op::Return);
                if ret.is_dyn() {
                    actual
                } else {
                    ret.clone()
                }
            }
            LambdaBody::Block(block) => {
                inner.block(block);
                ret.clone()
            }
        };
        let (code, locals) = inner.finish();
        set_body(&mut *self.cx, index, code, locals);

        self.emit(Op::MakeClosure {
            function: index,
            captures: captures.len(),
        });
        Type::func(param_tys, body_ret)
    }
}

fn set_body(cx: &mut Lowering<'_>, index: FunctionIndex, code: Vec<Op>, locals: usize) {
    let function = &mut cx.image.functions[index];
    function.code = code;
    function.locals = locals;
}

fn binary_type(op: BinaryOp, lhs: &Type, rhs: &Type) -> Option<Type> {
    if lhs.is_error() || rhs.is_error() {
        return Some(Type::Error);
    }
    let dynamic = lhs.is_dyn() || rhs.is_dyn();
    match op {
        BinaryOp::Eq | BinaryOp::Ne => (accepts(lhs, rhs, &mut None)
            || accepts(rhs, lhs, &mut None))
        .then_some(Type::Bool),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let comparable = matches!(
                (lhs, rhs),
                (Type::Int, Type::Int) | (Type::Str, Type::Str)
            );
            (comparable || dynamic).then_some(Type::Bool)
        }
        BinaryOp::Add => match (lhs, rhs) {
            (Type::Int, Type::Int) => Some(Type::Int),
            (Type::Str, Type::Str) => Some(Type::Str),
            _ if dynamic => Some(Type::Dyn),
            _ => None,
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let numeric = |t: &Type| matches!(t, Type::Int | Type::Dyn);
            (numeric(lhs) && numeric(rhs)).then_some(Type::Int)
        }
        BinaryOp::And | BinaryOp::Or => Some(Type::Bool),
    }
}

fn path_text(segments: &[Ident]) -> String {
    segments
        .iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join("::")
}

/// Every name a lambda body might read from its enclosing function. Over-
/// approximates: a name shadowed inside the body is still reported.
fn names_in_lambda(body: &LambdaBody, out: &mut BTreeSet<String>) {
    match body {
        LambdaBody::Expr(expr) => names_in_expr(expr, out),
        LambdaBody::Block(block) => names_in_block(block, out),
    }
}

fn names_in_block(block: &Block, out: &mut BTreeSet<String>) {
    for stmt in &block.stmts {
        names_in_stmt(stmt, out);
    }
}

fn names_in_stmt(stmt: &Stmt, out: &mut BTreeSet<String>) {
    match stmt {
        Stmt::Let { value, .. } => names_in_expr(value, out),
        Stmt::Assign { target, value, .. } => {
            match target {
                Place::Local(name) => {
                    out.insert(name.name.clone());
                }
                Place::Field(_) => {
                    out.insert("self".to_owned());
                }
            }
            names_in_expr(value, out);
        }
        Stmt::For { iterable, body, .. } => {
            names_in_expr(iterable, out);
            names_in_block(body, out);
        }
        Stmt::While { cond, body, .. } => {
            names_in_expr(cond, out);
            names_in_block(body, out);
        }
        Stmt::If {
            cond,
            then,
            otherwise,
            ..
        } => {
            names_in_expr(cond, out);
            names_in_block(then, out);
            match otherwise {
                Some(Else::Block(block)) => names_in_block(block, out),
                Some(Else::If(stmt)) => names_in_stmt(stmt, out),
                None => {}
            }
        }
        Stmt::Return { value, .. } => {
            if let Some(value) = value {
                names_in_expr(value, out);
            }
        }
        Stmt::Expr(expr) => names_in_expr(expr, out),
    }
}

fn names_in_expr(expr: &Expr, out: &mut BTreeSet<String>) {
    match &expr.kind {
        ExprKind::Int(_) | ExprKind::Str(_) | ExprKind::Bool(_) | ExprKind::New(_) => {}
        ExprKind::SelfRef => {
            out.insert("self".to_owned());
        }
        ExprKind::Path(segments) => {
            if let [name] = segments.as_slice() {
                out.insert(name.name.clone());
            }
        }
        ExprKind::Array(items) => items.iter().for_each(|e| names_in_expr(e, out)),
        ExprKind::Call { callee, args } => {
            // A bare call may reach an instance method through `self`.
            if matches!(&callee.kind, ExprKind::Path(s) if s.len() == 1) {
                out.insert("self".to_owned());
            }
            names_in_expr(callee, out);
            args.iter().for_each(|e| names_in_expr(e, out));
        }
        ExprKind::MethodCall { target, args, .. } => {
            names_in_expr(target, out);
            args.iter().for_each(|e| names_in_expr(e, out));
        }
        ExprKind::Field { target, .. } => names_in_expr(target, out),
        ExprKind::Index { target, index } => {
            names_in_expr(target, out);
            names_in_expr(index, out);
        }
        ExprKind::Lambda { body, .. } => names_in_lambda(body, out),
        ExprKind::Unary { operand, .. } => names_in_expr(operand, out),
        ExprKind::Binary { lhs, rhs, .. } => {
            names_in_expr(lhs, out);
            names_in_expr(rhs, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parser, references::ModuleTable};

    fn lower_text(text: &str) -> Lowered {
        let source = SourceUnit::latest(text);
        let tree = parser::parse(&source).unwrap();
        let table = ModuleTable::standard();
        let mut references = ReferenceSet::default();
        for name in ["core", "io", "text", "dynamic", "seq"] {
            references.insert(table.get(name).unwrap().clone());
        }
        lower(
            &source,
            &tree,
            &references,
            OutputKind::Executable,
            "unit".to_owned(),
        )
    }

    fn function<'i>(image: &'i Image, name: &str) -> &'i Function {
        image.functions.iter().find(|f| f.name == name).unwrap()
    }

    #[test]
    fn lambda_captures_only_mentioned_locals() {
        let lowered = lower_text(
            r#"type P { static fn main(args: [str]) {
                let prefix = "x";
                let other = 2;
                let f = |a| prefix + a;
                io::print_line(f("y"));
                io::print_line(other);
            } }"#,
        );
        assert!(lowered.diagnostics.is_empty(), "{:?}", lowered.diagnostics);
        let lambda = function(&lowered.image, "main$lambda1");
        assert_eq!(lambda.binding, Binding::Closure { captures: 1 });
        assert_eq!(lambda.arity, 2);
    }

    #[test]
    fn fields_get_an_initializer() {
        let lowered = lower_text(
            "type P { field n: int = 4; field s: str; fn main(args: [str]) -> int { return self.n; } }",
        );
        assert!(lowered.diagnostics.is_empty(), "{:?}", lowered.diagnostics);
        let ty = &lowered.image.types[TypeIndex::from(0)];
        assert_eq!(ty.fields, vec!["n", "s"]);
        let init = &lowered.image.functions[ty.initializer.unwrap()];
        assert_eq!(init.binding, Binding::Instance);
        assert!(init.code.contains(&Op::Push(Constant::Str(String::new()))));
    }

    #[test]
    fn natives_are_imported_once() {
        let lowered = lower_text(
            "type P { static fn main(args: [str]) { io::print_line(1); io::print_line(2); io::print(3); } }",
        );
        let modules: Vec<_> = lowered
            .image
            .imports
            .iter()
            .map(|i| format!("{}::{}@{}.{}", i.module, i.function, i.major, i.minor))
            .collect();
        assert_eq!(modules, vec!["io::print_line@1.0", "io::print@1.0"]);
    }

    #[test]
    fn filter_binds_the_element_type() {
        let lowered = lower_text(
            r#"type P { static fn main(args: [str]) {
                for a in seq::filter(args, |a| text::len(a) > 1) {
                    io::print_line(text::upper(a));
                }
                let _n: int = seq::filter(args, |a| a == 3);
            } }"#,
        );
        let codes: Vec<_> = lowered.diagnostics.iter().map(|d| d.code).collect();
        // The filtered seq is not an int, and `a == 3` compares str with int.
        assert_eq!(codes, vec![Code::TypeMismatch, Code::InvalidOperands]);
    }

    #[test]
    fn instance_method_from_static_context_is_rejected() {
        let lowered = lower_text(
            "type P { fn helper() {} static fn main(args: [str]) { helper(); } }",
        );
        let codes: Vec<_> = lowered.diagnostics.iter().map(|d| d.code).collect();
        assert_eq!(codes, vec![Code::SelfOutsideInstance]);
    }
}
