use std::cell::RefCell;

use itertools::Itertools;
use pest::{
    iterators::Pair,
    pratt_parser::{Assoc, Op, PrattParser},
    Parser,
};
use pest_derive::Parser;

use crate::{
    bytecode::{BinaryOp, UnaryOp},
    diagnostic::{Code, Diagnostic},
    source::{LanguageVersion, Location, SourceUnit, Span},
};

#[derive(Parser)]
#[grammar = "parser/flicker.pest"]
struct FlickerParser;

/// Parses a source unit under its declared language version.
///
/// Grammar failures and version-gated features both come back as
/// syntax-category diagnostics; no partial tree is returned.
pub fn parse(source: &SourceUnit) -> Result<SyntaxTree, Vec<Diagnostic>> {
    let mut pairs = FlickerParser::parse(Rule::file, source.text())
        .map_err(|e| vec![syntax_error(source, e)])?;
    let Some(file) = pairs.next() else {
        return Err(vec![Diagnostic::error(Code::SyntaxError, "empty parse")]);
    };

    let factory = Factory::new(source);
    let tree = factory.file(file);
    let problems = factory.problems.into_inner();
    if problems.is_empty() {
        Ok(tree)
    } else {
        Err(problems)
    }
}

fn syntax_error(source: &SourceUnit, e: pest::error::Error<Rule>) -> Diagnostic {
    let (line, col) = match e.line_col {
        pest::error::LineColLocation::Pos(pos) => pos,
        pest::error::LineColLocation::Span(start, _) => start,
    };
    let e = e.renamed_rules(rule_name);
    let found = if e.location == pest::error::InputLocation::Pos(source.text().len()) {
        "end of input"
    } else {
        "unexpected input"
    };
    Diagnostic::error(
        Code::SyntaxError,
        format!("{}; found {found}", e.variant.message()),
    )
    .at_location(Location { line, col })
}

fn rule_name(rule: &Rule) -> String {
    match rule {
        Rule::EOI => "end of input".to_owned(),
        Rule::identifier => "identifier".to_owned(),
        Rule::block => "`{`".to_owned(),
        Rule::type_decl | Rule::kw_type => "`type`".to_owned(),
        Rule::namespace_decl | Rule::kw_namespace => "`namespace`".to_owned(),
        Rule::use_decl | Rule::kw_use => "`use`".to_owned(),
        Rule::fn_decl | Rule::kw_fn => "`fn`".to_owned(),
        Rule::field_decl | Rule::kw_field => "`field`".to_owned(),
        Rule::expr | Rule::postfix_expr => "expression".to_owned(),
        Rule::type_expr => "type".to_owned(),
        Rule::param => "parameter".to_owned(),
        other => format!("{other:?}"),
    }
}

fn is_keyword(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::kw_use
            | Rule::kw_namespace
            | Rule::kw_type
            | Rule::kw_field
            | Rule::kw_fn
            | Rule::kw_let
            | Rule::kw_for
            | Rule::kw_in
            | Rule::kw_while
            | Rule::kw_if
            | Rule::kw_else
            | Rule::kw_return
            | Rule::kw_new
    )
}

/// Children of a pair with keyword tokens removed.
fn children<'i>(p: Pair<'i, Rule>) -> impl Iterator<Item = Pair<'i, Rule>> {
    p.into_inner().filter(|c| !is_keyword(c.as_rule()))
}

fn only_child<'i>(p: Pair<'i, Rule>) -> Pair<'i, Rule> {
    let rule = p.as_rule();
    children(p)
        .exactly_one()
        .unwrap_or_else(|_| panic!("{rule:?} must have exactly one child"))
}

struct Factory<'s> {
    source: &'s SourceUnit,
    pratt: PrattParser<Rule>,
    problems: RefCell<Vec<Diagnostic>>,
}

impl<'s> Factory<'s> {
    fn new(source: &'s SourceUnit) -> Self {
        let pratt = PrattParser::new()
            .op(Op::infix(Rule::or_op, Assoc::Left))
            .op(Op::infix(Rule::and_op, Assoc::Left))
            .op(Op::infix(Rule::eq_op, Assoc::Left) | Op::infix(Rule::ne_op, Assoc::Left))
            .op(Op::infix(Rule::lt_op, Assoc::Left)
                | Op::infix(Rule::le_op, Assoc::Left)
                | Op::infix(Rule::gt_op, Assoc::Left)
                | Op::infix(Rule::ge_op, Assoc::Left))
            .op(Op::infix(Rule::add_op, Assoc::Left) | Op::infix(Rule::sub_op, Assoc::Left))
            .op(Op::infix(Rule::mul_op, Assoc::Left)
                | Op::infix(Rule::div_op, Assoc::Left)
                | Op::infix(Rule::rem_op, Assoc::Left))
            .op(Op::prefix(Rule::not_op) | Op::prefix(Rule::neg_op));
        Self {
            source,
            pratt,
            problems: RefCell::new(vec![]),
        }
    }

    fn span(&self, p: &Pair<Rule>) -> Span {
        Span::from_pest(p.as_span())
    }

    fn report(&self, diagnostic: Diagnostic) {
        self.problems.borrow_mut().push(diagnostic);
    }

    fn require(&self, version: LanguageVersion, feature: &str, span: Span) {
        if self.source.version() < version {
            self.report(
                Diagnostic::error(
                    Code::FeatureUnavailable,
                    format!(
                        "{feature} need language version {version} or later; the source declares {}",
                        self.source.version()
                    ),
                )
                .at(self.source, span),
            );
        }
    }

    fn file(&self, p: Pair<Rule>) -> SyntaxTree {
        assert_eq!(p.as_rule(), Rule::file);
        let mut tree = SyntaxTree::default();
        for pair in children(p) {
            match pair.as_rule() {
                Rule::use_decl => tree.imports.push(self.identifier(only_child(pair))),
                Rule::namespace_decl => self.namespace_decl(pair, &mut tree.types),
                Rule::type_decl => tree.types.push(self.type_decl(String::new(), pair)),
                Rule::EOI => {}
                other => panic!("invalid file item: {other:?}"),
            }
        }
        tree
    }

    fn namespace_decl(&self, p: Pair<Rule>, types: &mut Vec<TypeDecl>) {
        assert_eq!(p.as_rule(), Rule::namespace_decl);
        let mut inner = children(p);
        let name = inner.next().expect("namespace name");
        let namespace = children(name).map(|i| i.as_str().to_owned()).join(".");
        for pair in inner {
            types.push(self.type_decl(namespace.clone(), pair));
        }
    }

    fn type_decl(&self, namespace: String, p: Pair<Rule>) -> TypeDecl {
        assert_eq!(p.as_rule(), Rule::type_decl);
        let span = self.span(&p);
        let mut inner = children(p);
        let name = self.identifier(inner.next().expect("type name"));
        let mut decl = TypeDecl {
            namespace,
            name,
            fields: vec![],
            functions: vec![],
            span,
        };
        for member in inner {
            match member.as_rule() {
                Rule::field_decl => decl.fields.push(self.field_decl(member)),
                Rule::fn_decl => decl.functions.push(self.fn_decl(member)),
                other => panic!("invalid type member: {other:?}"),
            }
        }
        decl
    }

    fn field_decl(&self, p: Pair<Rule>) -> FieldDecl {
        assert_eq!(p.as_rule(), Rule::field_decl);
        let mut inner = children(p);
        let name = self.identifier(inner.next().expect("field name"));
        let ty = self.type_expr(inner.next().expect("field type"));
        let init = inner.next().map(|e| self.expr(e));
        FieldDecl { name, ty, init }
    }

    fn fn_decl(&self, p: Pair<Rule>) -> FnDecl {
        assert_eq!(p.as_rule(), Rule::fn_decl);
        let span = self.span(&p);
        let mut is_pub = false;
        let mut is_static = false;
        let mut name = None;
        let mut params = vec![];
        let mut ret = None;
        let mut body = None;
        for pair in children(p) {
            match pair.as_rule() {
                Rule::visibility => is_pub = true,
                Rule::static_kw => is_static = true,
                Rule::identifier => name = Some(self.identifier(pair)),
                Rule::param_list => {
                    params = children(pair).map(|param| self.param(param)).collect()
                }
                Rule::return_type => ret = Some(self.type_expr(only_child(pair))),
                Rule::block => body = Some(self.block(pair)),
                other => panic!("invalid fn item: {other:?}"),
            }
        }
        FnDecl {
            name: name.expect("fn name"),
            is_pub,
            is_static,
            params,
            ret,
            body: body.expect("fn body"),
            span,
        }
    }

    fn param(&self, p: Pair<Rule>) -> Param {
        assert_eq!(p.as_rule(), Rule::param);
        let (name, ty) = children(p).collect_tuple().expect("param shape");
        Param {
            name: self.identifier(name),
            ty: self.type_expr(ty),
        }
    }

    fn type_expr(&self, p: Pair<Rule>) -> TypeExpr {
        assert_eq!(p.as_rule(), Rule::type_expr);
        let span = self.span(&p);
        let inner = only_child(p);
        let kind = match inner.as_rule() {
            Rule::array_type => TypeExprKind::Array(Box::new(self.type_expr(only_child(inner)))),
            Rule::seq_type => TypeExprKind::Seq(Box::new(self.type_expr(only_child(inner)))),
            Rule::fn_type => {
                let mut types: Vec<TypeExpr> = children(inner).map(|t| self.type_expr(t)).collect();
                let ret = types.pop().expect("fn type return");
                TypeExprKind::Fn(types, Box::new(ret))
            }
            Rule::prim_type => match inner.as_str() {
                "int" => TypeExprKind::Int,
                "str" => TypeExprKind::Str,
                "bool" => TypeExprKind::Bool,
                "unit" => TypeExprKind::Unit,
                "dyn" => {
                    self.require(LanguageVersion::V2, "the `dyn` type", span);
                    TypeExprKind::Dyn
                }
                other => panic!("invalid primitive type: {other}"),
            },
            Rule::named_type => TypeExprKind::Named(only_child(inner).as_str().to_owned()),
            other => panic!("invalid type: {other:?}"),
        };
        TypeExpr { kind, span }
    }

    fn block(&self, p: Pair<Rule>) -> Block {
        assert_eq!(p.as_rule(), Rule::block);
        let span = self.span(&p);
        let stmts = children(p).map(|s| self.stmt(s)).collect();
        Block { stmts, span }
    }

    fn stmt(&self, p: Pair<Rule>) -> Stmt {
        let span = self.span(&p);
        match p.as_rule() {
            Rule::let_stmt => {
                let mut name = None;
                let mut ty = None;
                let mut value = None;
                for pair in children(p) {
                    match pair.as_rule() {
                        Rule::identifier => name = Some(self.identifier(pair)),
                        Rule::type_expr => ty = Some(self.type_expr(pair)),
                        Rule::expr => value = Some(self.expr(pair)),
                        other => panic!("invalid let item: {other:?}"),
                    }
                }
                Stmt::Let {
                    name: name.expect("let name"),
                    ty,
                    value: value.expect("let value"),
                    span,
                }
            }
            Rule::for_stmt => {
                let (binding, iterable, body) = children(p).collect_tuple().expect("for shape");
                Stmt::For {
                    binding: self.identifier(binding),
                    iterable: self.expr(iterable),
                    body: self.block(body),
                    span,
                }
            }
            Rule::while_stmt => {
                let (cond, body) = children(p).collect_tuple().expect("while shape");
                Stmt::While {
                    cond: self.expr(cond),
                    body: self.block(body),
                    span,
                }
            }
            Rule::if_stmt => {
                let mut inner = children(p);
                let cond = self.expr(inner.next().expect("if condition"));
                let then = self.block(inner.next().expect("if body"));
                let otherwise = inner.next().map(|e| match e.as_rule() {
                    Rule::block => Else::Block(self.block(e)),
                    Rule::if_stmt => Else::If(Box::new(self.stmt(e))),
                    other => panic!("invalid else: {other:?}"),
                });
                Stmt::If {
                    cond,
                    then,
                    otherwise,
                    span,
                }
            }
            Rule::return_stmt => Stmt::Return {
                value: children(p).next().map(|e| self.expr(e)),
                span,
            },
            Rule::assign_stmt => {
                let (place, value) = children(p).collect_tuple().expect("assign shape");
                let place = only_child(place);
                let target = match place.as_rule() {
                    Rule::identifier => Place::Local(self.identifier(place)),
                    Rule::field_place => {
                        let (_, field) = children(place).collect_tuple().expect("field place");
                        Place::Field(self.identifier(field))
                    }
                    other => panic!("invalid place: {other:?}"),
                };
                Stmt::Assign {
                    target,
                    value: self.expr(value),
                    span,
                }
            }
            Rule::expr_stmt => Stmt::Expr(self.expr(only_child(p))),
            other => panic!("invalid statement: {other:?}"),
        }
    }

    fn expr(&self, p: Pair<Rule>) -> Expr {
        assert_eq!(p.as_rule(), Rule::expr);
        self.pratt
            .map_primary(|primary| self.postfix_expr(primary))
            .map_prefix(|op, operand| {
                let op_span = self.span(&op);
                let op = match op.as_rule() {
                    Rule::not_op => UnaryOp::Not,
                    Rule::neg_op => UnaryOp::Neg,
                    other => panic!("invalid prefix operator: {other:?}"),
                };
                Expr {
                    span: op_span.to(operand.span),
                    kind: ExprKind::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                }
            })
            .map_infix(|lhs, op, rhs| {
                let op = match op.as_rule() {
                    Rule::or_op => BinaryOp::Or,
                    Rule::and_op => BinaryOp::And,
                    Rule::eq_op => BinaryOp::Eq,
                    Rule::ne_op => BinaryOp::Ne,
                    Rule::lt_op => BinaryOp::Lt,
                    Rule::le_op => BinaryOp::Le,
                    Rule::gt_op => BinaryOp::Gt,
                    Rule::ge_op => BinaryOp::Ge,
                    Rule::add_op => BinaryOp::Add,
                    Rule::sub_op => BinaryOp::Sub,
                    Rule::mul_op => BinaryOp::Mul,
                    Rule::div_op => BinaryOp::Div,
                    Rule::rem_op => BinaryOp::Rem,
                    other => panic!("invalid infix operator: {other:?}"),
                };
                Expr {
                    span: lhs.span.to(rhs.span),
                    kind: ExprKind::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                }
            })
            .parse(p.into_inner())
    }

    fn postfix_expr(&self, p: Pair<Rule>) -> Expr {
        assert_eq!(p.as_rule(), Rule::postfix_expr);
        let mut inner = children(p).peekable();
        let mut expr = self.primary(inner.next().expect("primary expression"));
        while let Some(suffix) = inner.next() {
            let suffix_span = self.span(&suffix);
            expr = match suffix.as_rule() {
                Rule::call_args => Expr {
                    span: expr.span.to(suffix_span),
                    kind: ExprKind::Call {
                        callee: Box::new(expr),
                        args: self.args(suffix),
                    },
                },
                Rule::index_suffix => Expr {
                    span: expr.span.to(suffix_span),
                    kind: ExprKind::Index {
                        target: Box::new(expr),
                        index: Box::new(self.expr(only_child(suffix))),
                    },
                },
                Rule::member_suffix => {
                    let name = self.identifier(only_child(suffix));
                    match inner.next_if(|next| next.as_rule() == Rule::call_args) {
                        Some(args) => Expr {
                            span: expr.span.to(self.span(&args)),
                            kind: ExprKind::MethodCall {
                                target: Box::new(expr),
                                method: name,
                                args: self.args(args),
                            },
                        },
                        None => Expr {
                            span: expr.span.to(suffix_span),
                            kind: ExprKind::Field {
                                target: Box::new(expr),
                                name,
                            },
                        },
                    }
                }
                other => panic!("invalid postfix: {other:?}"),
            };
        }
        expr
    }

    fn args(&self, p: Pair<Rule>) -> Vec<Expr> {
        assert_eq!(p.as_rule(), Rule::call_args);
        children(p).map(|e| self.expr(e)).collect()
    }

    fn primary(&self, p: Pair<Rule>) -> Expr {
        let span = self.span(&p);
        let kind = match p.as_rule() {
            Rule::expr => return self.expr(p),
            Rule::lambda => {
                self.require(LanguageVersion::V2, "lambda expressions", span);
                let (params, body) = children(p).collect_tuple().expect("lambda shape");
                let params = children(params).map(|i| self.identifier(i)).collect();
                let body = match body.as_rule() {
                    Rule::block => LambdaBody::Block(self.block(body)),
                    Rule::expr => LambdaBody::Expr(Box::new(self.expr(body))),
                    other => panic!("invalid lambda body: {other:?}"),
                };
                ExprKind::Lambda { params, body }
            }
            Rule::new_expr => ExprKind::New(self.identifier(only_child(p))),
            Rule::literal => self.literal(only_child(p)),
            Rule::array_lit => ExprKind::Array(children(p).map(|e| self.expr(e)).collect()),
            Rule::self_kw => ExprKind::SelfRef,
            Rule::path => ExprKind::Path(children(p).map(|i| self.identifier(i)).collect()),
            other => panic!("invalid primary: {other:?}"),
        };
        Expr { kind, span }
    }

    fn literal(&self, p: Pair<Rule>) -> ExprKind {
        let span = self.span(&p);
        match p.as_rule() {
            Rule::int_lit => match p.as_str().parse::<i64>() {
                Ok(value) => ExprKind::Int(value),
                Err(_) => {
                    self.report(
                        Diagnostic::error(
                            Code::InvalidLiteral,
                            format!("integer literal `{}` is out of range", p.as_str()),
                        )
                        .at(self.source, span),
                    );
                    ExprKind::Int(0)
                }
            },
            Rule::bool_lit => ExprKind::Bool(p.as_str() == "true"),
            Rule::string_lit => ExprKind::Str(self.unescape(only_child(p))),
            other => panic!("invalid literal: {other:?}"),
        }
    }

    fn unescape(&self, p: Pair<Rule>) -> String {
        let mut out = String::with_capacity(p.as_str().len());
        let mut chars = p.as_str().chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('0') => out.push('\0'),
                Some('\\') => out.push('\\'),
                Some('"') => out.push('"'),
                other => self.report(
                    Diagnostic::error(
                        Code::InvalidLiteral,
                        format!("unknown escape `\\{}`", other.unwrap_or(' ')),
                    )
                    .at(self.source, self.span(&p)),
                ),
            }
        }
        out
    }

    fn identifier(&self, p: Pair<Rule>) -> Ident {
        assert_eq!(p.as_rule(), Rule::identifier);
        Ident {
            name: p.as_str().to_owned(),
            span: self.span(&p),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyntaxTree {
    pub imports: Vec<Ident>,
    pub types: Vec<TypeDecl>,
}

impl SyntaxTree {
    pub fn import_names(&self) -> Vec<String> {
        self.imports.iter().map(|i| i.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct TypeDecl {
    pub namespace: String,
    pub name: Ident,
    pub fields: Vec<FieldDecl>,
    pub functions: Vec<FnDecl>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: Ident,
    pub ty: TypeExpr,
    pub init: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct FnDecl {
    pub name: Ident,
    pub is_pub: bool,
    pub is_static: bool,
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    pub body: Block,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Ident,
    pub ty: TypeExpr,
}

#[derive(Debug, Clone)]
pub struct TypeExpr {
    pub kind: TypeExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum TypeExprKind {
    Int,
    Str,
    Bool,
    Unit,
    Dyn,
    Array(Box<TypeExpr>),
    Seq(Box<TypeExpr>),
    Fn(Vec<TypeExpr>, Box<TypeExpr>),
    Named(String),
}

#[derive(Debug, Clone)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Let {
        name: Ident,
        ty: Option<TypeExpr>,
        value: Expr,
        span: Span,
    },
    Assign {
        target: Place,
        value: Expr,
        span: Span,
    },
    For {
        binding: Ident,
        iterable: Expr,
        body: Block,
        span: Span,
    },
    While {
        cond: Expr,
        body: Block,
        span: Span,
    },
    If {
        cond: Expr,
        then: Block,
        otherwise: Option<Else>,
        span: Span,
    },
    Return {
        value: Option<Expr>,
        span: Span,
    },
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub enum Else {
    Block(Block),
    If(Box<Stmt>),
}

#[derive(Debug, Clone)]
pub enum Place {
    Local(Ident),
    /// `self.<field>`
    Field(Ident),
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Int(i64),
    Str(String),
    Bool(bool),
    Array(Vec<Expr>),
    SelfRef,
    Path(Vec<Ident>),
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Field {
        target: Box<Expr>,
        name: Ident,
    },
    MethodCall {
        target: Box<Expr>,
        method: Ident,
        args: Vec<Expr>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    New(Ident),
    Lambda {
        params: Vec<Ident>,
        body: LambdaBody,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone)]
pub enum LambdaBody {
    Expr(Box<Expr>),
    Block(Block),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Category;

    fn parse_ok(text: &str) -> SyntaxTree {
        match parse(&SourceUnit::latest(text)) {
            Ok(tree) => tree,
            Err(problems) => panic!("unexpected diagnostics: {problems:?}"),
        }
    }

    fn main_body(tree: &SyntaxTree) -> &[Stmt] {
        &tree.types[0].functions[0].body.stmts
    }

    #[test]
    fn parses_namespaces_imports_and_members() {
        let tree = parse_ok(
            r#"
            use io;
            use seq;
            namespace demo.app {
                type Program {
                    field count: int = 0;
                    pub static fn main(args: [str]) {}
                    fn bump(by: int) -> int { return by; }
                }
            }
            type Loose {}
            "#,
        );
        assert_eq!(tree.import_names(), vec!["io", "seq"]);
        assert_eq!(tree.types.len(), 2);
        let program = &tree.types[0];
        assert_eq!(program.namespace, "demo.app");
        assert_eq!(program.name.name, "Program");
        assert_eq!(program.fields.len(), 1);
        assert!(program.functions[0].is_pub && program.functions[0].is_static);
        assert!(!program.functions[1].is_pub && !program.functions[1].is_static);
        assert_eq!(tree.types[1].namespace, "");
    }

    #[test]
    fn operator_precedence_binds_multiplication_tighter() {
        let tree = parse_ok("type A { static fn main(args: [str]) { let x = 1 + 2 * 3 == 7 && !false; } }");
        let Stmt::Let { value, .. } = &main_body(&tree)[0] else {
            panic!("expected let");
        };
        let ExprKind::Binary { op: BinaryOp::And, lhs, .. } = &value.kind else {
            panic!("expected && at the root, got {value:?}");
        };
        let ExprKind::Binary { op: BinaryOp::Eq, lhs, .. } = &lhs.kind else {
            panic!("expected ==");
        };
        let ExprKind::Binary { op: BinaryOp::Add, rhs, .. } = &lhs.kind else {
            panic!("expected +");
        };
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn member_followed_by_arguments_is_a_method_call() {
        let tree = parse_ok("type A { fn main(args: [str]) { self.greet(args[0]); let n = self.count; } }");
        let Stmt::Expr(call) = &main_body(&tree)[0] else {
            panic!("expected expression statement");
        };
        assert!(matches!(&call.kind, ExprKind::MethodCall { method, args, .. } if method.name == "greet" && args.len() == 1));
        let Stmt::Let { value, .. } = &main_body(&tree)[1] else {
            panic!("expected let");
        };
        assert!(matches!(&value.kind, ExprKind::Field { name, .. } if name.name == "count"));
    }

    #[test]
    fn keyword_prefixed_identifiers_stay_identifiers() {
        let tree = parse_ok("type A { static fn main(args: [str]) { let letter = 1; letter = 2; returned(letter); } }");
        let stmts = main_body(&tree);
        assert!(matches!(&stmts[0], Stmt::Let { name, .. } if name.name == "letter"));
        assert!(matches!(&stmts[1], Stmt::Assign { target: Place::Local(name), .. } if name.name == "letter"));
        assert!(matches!(&stmts[2], Stmt::Expr(_)));
    }

    #[test]
    fn string_escapes_are_decoded() {
        let tree = parse_ok(r#"type A { static fn main(args: [str]) { let s = "a\tb\"c\\"; } }"#);
        let Stmt::Let { value, .. } = &main_body(&tree)[0] else {
            panic!("expected let");
        };
        assert!(matches!(&value.kind, ExprKind::Str(s) if s == "a\tb\"c\\"));
    }

    #[test]
    fn missing_closing_brace_is_a_syntax_error() {
        let problems = parse(&SourceUnit::latest(
            "type A { static fn main(args: [str]) { let x = 1; }",
        ))
        .unwrap_err();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].category(), Category::Syntax);
        assert!(problems[0].message.contains("end of input"), "{}", problems[0]);
    }

    #[test]
    fn lambdas_and_dyn_are_gated_by_language_version() {
        let text = "type A { static fn main(args: [str]) { let f = |x| x; let d: dyn = 1; } }";
        let problems = parse(&SourceUnit::new(text, LanguageVersion::V1)).unwrap_err();
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().all(|p| p.code == Code::FeatureUnavailable));
        assert!(parse(&SourceUnit::new(text, LanguageVersion::V2)).is_ok());
    }

    #[test]
    fn out_of_range_integer_is_reported() {
        let problems = parse(&SourceUnit::latest(
            "type A { static fn main(args: [str]) { let x = 99999999999999999999; } }",
        ))
        .unwrap_err();
        assert_eq!(problems[0].code, Code::InvalidLiteral);
    }
}
