use derive_more::derive::{From, Into};
use serde::{Deserialize, Serialize};
use typed_index_collections::TiVec;

pub mod encoding;

pub use encoding::ImageError;

macro_rules! operators {
    {
        $enum:ident {
            $(($ident:ident, $symbol:literal),)*
        }
    } => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $enum {
            $($ident,)*
        }

        impl $enum {
            pub fn symbol(self) -> &'static str {
                match self {
                    $($enum::$ident => $symbol,)*
                }
            }
        }
    };
}

operators! {
    BinaryOp {
        (Add, "+"),
        (Sub, "-"),
        (Mul, "*"),
        (Div, "/"),
        (Rem, "%"),
        (Eq, "=="),
        (Ne, "!="),
        (Lt, "<"),
        (Le, "<="),
        (Gt, ">"),
        (Ge, ">="),
        (And, "&&"),
        (Or, "||"),
    }
}

operators! {
    UnaryOp {
        (Not, "!"),
        (Neg, "-"),
    }
}

#[derive(From, Into, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionIndex(usize);

#[derive(From, Into, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeIndex(usize);

#[derive(From, Into, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImportIndex(usize);

#[derive(Clone, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
pub enum Constant {
    Unit,
    Int(i64),
    Bool(bool),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Push(Constant),
    Load(usize),
    Store(usize),
    LoadField(usize),
    StoreField(usize),
    Pop,
    Unary(UnaryOp),
    Binary(BinaryOp),
    MakeArray(usize),
    Index,
    MakeClosure { function: FunctionIndex, captures: usize },
    New(TypeIndex),
    Call { function: FunctionIndex, argc: usize },
    CallClosure { argc: usize },
    CallNative { import: ImportIndex, argc: usize },
    IterStart,
    IterNext { slot: usize, exit: usize },
    Jump(usize),
    JumpUnless(usize),
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Public,
    Private,
}

/// How a function receives its leading arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Binding {
    Static,
    /// Slot 0 holds the receiver.
    Instance,
    /// Leading slots hold the captured values.
    Closure { captures: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub owner: Option<TypeIndex>,
    pub visibility: Visibility,
    pub binding: Binding,
    /// Number of incoming values, receiver and captures included.
    pub arity: usize,
    pub locals: usize,
    pub code: Vec<Op>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub namespace: String,
    pub name: String,
    pub fields: Vec<String>,
    /// Instance function that stores every field default.
    pub initializer: Option<FunctionIndex>,
    pub methods: Vec<FunctionIndex>,
}

impl TypeDef {
    pub fn full_name(&self) -> String {
        qualified_name(&self.namespace, &self.name)
    }
}

pub fn qualified_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_owned()
    } else {
        format!("{namespace}.{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Import {
    pub module: String,
    pub major: u16,
    pub minor: u16,
    pub function: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub name: String,
    pub imports: TiVec<ImportIndex, Import>,
    pub types: TiVec<TypeIndex, TypeDef>,
    pub functions: TiVec<FunctionIndex, Function>,
    pub entry: Option<FunctionIndex>,
}

#[derive(Serialize, Deserialize)]
struct ImageSerde {
    name: String,
    imports: Vec<Import>,
    types: Vec<TypeDef>,
    functions: Vec<Function>,
    entry: Option<FunctionIndex>,
}

impl Serialize for Image {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let serde_repr = ImageSerde {
            name: self.name.clone(),
            imports: self.imports.iter().cloned().collect(),
            types: self.types.iter().cloned().collect(),
            functions: self.functions.iter().cloned().collect(),
            entry: self.entry,
        };
        serde_repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Image {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let serde_repr = ImageSerde::deserialize(deserializer)?;
        Ok(Image {
            name: serde_repr.name,
            imports: serde_repr.imports.into_iter().collect(),
            types: serde_repr.types.into_iter().collect(),
            functions: serde_repr.functions.into_iter().collect(),
            entry: serde_repr.entry,
        })
    }
}

impl Image {
    pub fn find_type(&self, full_name: &str) -> Option<TypeIndex> {
        self.types
            .iter_enumerated()
            .find_map(|(i, t)| if t.full_name() == full_name { Some(i) } else { None })
    }

    /// Looks a method up by name regardless of visibility or binding.
    pub fn find_method(&self, owner: TypeIndex, name: &str) -> Option<FunctionIndex> {
        self.types
            .get(owner)?
            .methods
            .iter()
            .copied()
            .find(|f| self.functions.get(*f).is_some_and(|f| f.name == name))
    }
}
