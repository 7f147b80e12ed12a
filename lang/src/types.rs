use std::fmt::Display;

use itertools::Itertools;

/// Static types as seen by the checker.
///
/// `Param` only appears in host module signatures and stands for the single
/// generic parameter of that signature. `Error` is the poison type produced
/// after a reported diagnostic; it is compatible with everything so one
/// mistake does not cascade.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Unit,
    Int,
    Bool,
    Str,
    Dyn,
    Array(Box<Type>),
    Seq(Box<Type>),
    Fn(Vec<Type>, Box<Type>),
    Object(String),
    Param,
    Error,
}

impl Type {
    pub fn array(elem: Type) -> Self {
        Type::Array(Box::new(elem))
    }

    pub fn seq(elem: Type) -> Self {
        Type::Seq(Box::new(elem))
    }

    pub fn func(params: Vec<Type>, ret: Type) -> Self {
        Type::Fn(params, Box::new(ret))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Type::Error)
    }

    pub fn is_dyn(&self) -> bool {
        matches!(self, Type::Dyn)
    }

    /// Element type when the value can be enumerated by `for`.
    pub fn element(&self) -> Option<Type> {
        match self {
            Type::Array(elem) | Type::Seq(elem) => Some((**elem).clone()),
            Type::Dyn => Some(Type::Dyn),
            Type::Error => Some(Type::Error),
            _ => None,
        }
    }

    /// Replaces `Param` with the bound type, or `dyn` when nothing bound it.
    pub fn substitute(&self, binding: &Option<Type>) -> Type {
        match self {
            Type::Param => binding.clone().unwrap_or(Type::Dyn),
            Type::Array(elem) => Type::array(elem.substitute(binding)),
            Type::Seq(elem) => Type::seq(elem.substitute(binding)),
            Type::Fn(params, ret) => Type::func(
                params.iter().map(|p| p.substitute(binding)).collect(),
                ret.substitute(binding),
            ),
            other => other.clone(),
        }
    }
}

/// Whether a value of type `actual` may be passed where `expected` is
/// required. Binds `Param` on first use; arrays coerce to sequences.
pub fn accepts(expected: &Type, actual: &Type, binding: &mut Option<Type>) -> bool {
    match (expected, actual) {
        (Type::Error, _) | (_, Type::Error) => true,
        (Type::Dyn, _) | (_, Type::Dyn) => true,
        (Type::Param, actual) => match binding {
            Some(bound) => {
                let bound = bound.clone();
                accepts(&bound, actual, &mut None)
            }
            None => {
                *binding = Some(actual.clone());
                true
            }
        },
        (Type::Seq(e), Type::Array(a)) | (Type::Seq(e), Type::Seq(a)) => accepts(e, a, binding),
        (Type::Array(e), Type::Array(a)) => accepts(e, a, binding),
        (Type::Fn(ep, er), Type::Fn(ap, ar)) => {
            ep.len() == ap.len()
                && ep.iter().zip(ap).all(|(e, a)| accepts(e, a, binding))
                && accepts(er, ar, binding)
        }
        (e, a) => e == a,
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Unit => write!(f, "unit"),
            Type::Int => write!(f, "int"),
            Type::Bool => write!(f, "bool"),
            Type::Str => write!(f, "str"),
            Type::Dyn => write!(f, "dyn"),
            Type::Array(elem) => write!(f, "[{elem}]"),
            Type::Seq(elem) => write!(f, "seq<{elem}>"),
            Type::Fn(params, ret) => write!(f, "fn({}) -> {ret}", params.iter().join(", ")),
            Type::Object(name) => write!(f, "{name}"),
            Type::Param => write!(f, "T"),
            Type::Error => write!(f, "{{error}}"),
        }
    }
}
