//! First pass: types, fields and method signatures, before any body is
//! lowered, so bodies can refer to members declared later in the file.

use itertools::Itertools;

use crate::{
    bytecode::{qualified_name, Binding, Function, FunctionIndex, TypeDef, TypeIndex, Visibility},
    diagnostic::{Code, Diagnostic},
    parser::{SyntaxTree, TypeExpr, TypeExprKind},
    source::Span,
    types::Type,
};

use super::{lower::Lowering, EntryBinding, EntryPointDescriptor};

pub(super) const ENTRY_NAME: &str = "main";

#[derive(Debug, Clone)]
pub(super) struct TypeInfo {
    pub namespace: String,
    pub name: String,
    pub full_name: String,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
}

#[derive(Debug, Clone)]
pub(super) struct FieldInfo {
    pub name: String,
    pub ty: Type,
    /// Position in the declaring `TypeDecl::fields`.
    pub decl: usize,
}

#[derive(Debug, Clone)]
pub(super) struct MethodInfo {
    pub name: String,
    pub index: FunctionIndex,
    pub params: Vec<Type>,
    pub ret: Type,
    pub is_static: bool,
    pub is_pub: bool,
    /// Position in the declaring `TypeDecl::functions`.
    pub decl: usize,
    pub span: Span,
}

impl<'a> Lowering<'a> {
    pub(super) fn declare(&mut self, tree: &SyntaxTree) {
        for decl in &tree.types {
            let full_name = qualified_name(&decl.namespace, &decl.name.name);
            if self.types.iter().any(|t| t.full_name == full_name) {
                self.error(
                    Code::DuplicateDefinition,
                    format!("type `{full_name}` is defined more than once"),
                    decl.name.span,
                );
                self.decl_types.push(None);
                continue;
            }
            let index = self.image.types.push_and_get_key(TypeDef {
                namespace: decl.namespace.clone(),
                name: decl.name.name.clone(),
                fields: vec![],
                initializer: None,
                methods: vec![],
            });
            self.types.push(TypeInfo {
                namespace: decl.namespace.clone(),
                name: decl.name.name.clone(),
                full_name,
                fields: vec![],
                methods: vec![],
            });
            self.decl_types.push(Some(index));
        }

        for (decl, ty) in tree.types.iter().zip(self.decl_types.clone()) {
            let Some(ty) = ty else {
                continue;
            };

            for (i, field) in decl.fields.iter().enumerate() {
                if self.types[ty].fields.iter().any(|f| f.name == field.name.name) {
                    self.error(
                        Code::DuplicateDefinition,
                        format!("field `{}` is declared more than once", field.name.name),
                        field.name.span,
                    );
                    continue;
                }
                let field_ty = self.resolve_type(&field.ty, &decl.namespace);
                self.image.types[ty].fields.push(field.name.name.clone());
                self.types[ty].fields.push(FieldInfo {
                    name: field.name.name.clone(),
                    ty: field_ty,
                    decl: i,
                });
            }

            for (i, f) in decl.functions.iter().enumerate() {
                if self.types[ty].methods.iter().any(|m| m.name == f.name.name) {
                    self.error(
                        Code::DuplicateDefinition,
                        format!(
                            "function `{}` is defined more than once in `{}`",
                            f.name.name, self.types[ty].full_name
                        ),
                        f.name.span,
                    );
                    continue;
                }
                let params = f
                    .params
                    .iter()
                    .map(|p| self.resolve_type(&p.ty, &decl.namespace))
                    .collect_vec();
                let ret = match &f.ret {
                    Some(ret) => self.resolve_type(ret, &decl.namespace),
                    None => Type::Unit,
                };
                let receiver = usize::from(!f.is_static);
                let index = self.image.functions.push_and_get_key(Function {
                    name: f.name.name.clone(),
                    owner: Some(ty),
                    visibility: if f.is_pub {
                        Visibility::Public
                    } else {
                        Visibility::Private
                    },
                    binding: if f.is_static {
                        Binding::Static
                    } else {
                        Binding::Instance
                    },
                    arity: params.len() + receiver,
                    locals: params.len() + receiver,
                    code: vec![],
                });
                self.image.types[ty].methods.push(index);
                self.types[ty].methods.push(MethodInfo {
                    name: f.name.name.clone(),
                    index,
                    params,
                    ret,
                    is_static: f.is_static,
                    is_pub: f.is_pub,
                    decl: i,
                    span: f.name.span,
                });
            }
        }
    }

    pub(super) fn resolve_type(&mut self, expr: &TypeExpr, namespace: &str) -> Type {
        match &expr.kind {
            TypeExprKind::Int => Type::Int,
            TypeExprKind::Str => Type::Str,
            TypeExprKind::Bool => Type::Bool,
            TypeExprKind::Unit => Type::Unit,
            TypeExprKind::Dyn => {
                if self.references.contains("dynamic") {
                    Type::Dyn
                } else {
                    self.error(
                        Code::DynamicUnavailable,
                        "`dyn` needs the `dynamic` module, which is not referenced",
                        expr.span,
                    );
                    Type::Error
                }
            }
            TypeExprKind::Array(elem) => Type::array(self.resolve_type(elem, namespace)),
            TypeExprKind::Seq(elem) => Type::seq(self.resolve_type(elem, namespace)),
            TypeExprKind::Fn(params, ret) => {
                let params = params
                    .iter()
                    .map(|p| self.resolve_type(p, namespace))
                    .collect();
                Type::func(params, self.resolve_type(ret, namespace))
            }
            TypeExprKind::Named(name) => match self.find_type(name, namespace) {
                Some(ty) => Type::Object(self.types[ty].full_name.clone()),
                None => {
                    self.error(Code::UnknownType, format!("unknown type `{name}`"), expr.span);
                    Type::Error
                }
            },
        }
    }

    /// Finds a type by simple name, preferring the given namespace.
    pub(super) fn find_type(&self, name: &str, namespace: &str) -> Option<TypeIndex> {
        let mut candidates = self
            .types
            .iter_enumerated()
            .filter(|(_, t)| t.name == name)
            .map(|(i, t)| (i, t.namespace == namespace))
            .collect_vec();
        candidates.sort_by_key(|(_, local)| !local);
        candidates.first().map(|(i, _)| *i)
    }

    pub(super) fn type_named(&self, full_name: &str) -> Option<TypeIndex> {
        self.types
            .iter_enumerated()
            .find(|(_, t)| t.full_name == full_name)
            .map(|(i, _)| i)
    }

    pub(super) fn method_of(&self, ty: TypeIndex, name: &str) -> Option<MethodInfo> {
        self.types.get(ty)?.methods.iter().find(|m| m.name == name).cloned()
    }

    pub(super) fn field_of(&self, full_name: &str, name: &str) -> Option<(usize, Type)> {
        let ty = self.type_named(full_name)?;
        self.types[ty]
            .fields
            .iter()
            .find_position(|f| f.name == name)
            .map(|(i, f)| (i, f.ty.clone()))
    }

    /// Picks the single `main([str]) -> unit | int` and records it as the
    /// image entry.
    pub(super) fn select_entry(&mut self) -> Option<EntryPointDescriptor> {
        let candidates = self
            .types
            .iter_enumerated()
            .flat_map(|(ty, info)| {
                info.methods
                    .iter()
                    .filter(|m| m.name == ENTRY_NAME)
                    .map(move |m| (ty, m.clone()))
            })
            .collect_vec();

        match candidates.as_slice() {
            [] => {
                self.diagnostics.push(Diagnostic::error(
                    Code::NoEntryPoint,
                    format!("no entry point: define `{ENTRY_NAME}(args: [str])` on a type"),
                ));
                None
            }
            [(ty, main)] => {
                let info = self.types[*ty].clone();
                let takes_args = main.params == [Type::array(Type::Str)];
                let returns = matches!(main.ret, Type::Unit | Type::Int);
                if !takes_args || !returns {
                    let found = Type::func(main.params.clone(), main.ret.clone());
                    self.error(
                        Code::EntrySignature,
                        format!(
                            "`{}.{ENTRY_NAME}` must have type fn([str]) -> unit or fn([str]) -> int, found {found}",
                            info.full_name
                        ),
                        main.span,
                    );
                    return None;
                }
                let descriptor = EntryPointDescriptor {
                    namespace: info.namespace.clone(),
                    type_name: info.name.clone(),
                    method: main.name.clone(),
                    binding: if main.is_static {
                        EntryBinding::Static
                    } else {
                        EntryBinding::Instance
                    },
                };
                self.image.entry = Some(main.index);
                Some(descriptor)
            }
            many => {
                let count = many.len();
                for (ty, main) in many {
                    let message = format!(
                        "`{}.{ENTRY_NAME}` is one of {count} entry points",
                        self.types[*ty].full_name
                    );
                    self.error(Code::MultipleEntryPoints, message, main.span);
                }
                None
            }
        }
    }
}
