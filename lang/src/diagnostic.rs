use std::fmt::Display;

use crate::source::{Location, SourceUnit, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Syntax,
    Resolution,
    Type,
    Entry,
    Lint,
    Emit,
}

macro_rules! codes {
    {
        $(($ident:ident, $code:literal, $category:ident),)*
    } => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Code {
            $($ident,)*
        }

        impl Code {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Code::$ident => $code,)*
                }
            }

            pub fn category(self) -> Category {
                match self {
                    $(Code::$ident => Category::$category,)*
                }
            }
        }
    };
}

codes! {
    (SyntaxError, "FL0001", Syntax),
    (FeatureUnavailable, "FL0002", Syntax),
    (InvalidLiteral, "FL0003", Syntax),

    (UnresolvedModule, "FL1001", Resolution),
    (UnknownFunction, "FL1002", Resolution),
    (UnknownName, "FL1003", Resolution),
    (UnknownType, "FL1004", Resolution),
    (DuplicateDefinition, "FL1005", Resolution),
    (UnknownField, "FL1006", Resolution),
    (UnknownMethod, "FL1007", Resolution),
    (DynamicUnavailable, "FL1008", Resolution),

    (TypeMismatch, "FL2001", Type),
    (ArgumentCount, "FL2002", Type),
    (InvalidOperation, "FL2003", Type),
    (InvalidOperands, "FL2004", Type),
    (SelfOutsideInstance, "FL2005", Type),
    (MissingReturn, "FL2006", Type),

    (NoEntryPoint, "FL2101", Entry),
    (MultipleEntryPoints, "FL2102", Entry),
    (EntrySignature, "FL2103", Entry),

    (UnusedLocal, "FL3001", Lint),
    (DiscardedSequence, "FL3002", Lint),

    (EmitFailed, "FL4001", Emit),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Code,
    pub message: String,
    pub location: Option<Location>,
    /// A warning promoted to an error by the compile options.
    pub escalated: bool,
}

impl Diagnostic {
    pub fn new(severity: Severity, code: Code, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
            location: None,
            escalated: false,
        }
    }

    pub fn error(code: Code, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, message)
    }

    pub fn warning(code: Code, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, code, message)
    }

    pub fn at(mut self, source: &SourceUnit, span: Span) -> Self {
        self.location = Some(source.location(span));
        self
    }

    pub fn at_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn category(&self) -> Category {
        self.code.category()
    }

    pub fn escalate(mut self) -> Self {
        if self.severity == Severity::Warning {
            self.severity = Severity::Error;
            self.escalated = true;
        }
        self
    }

    /// Whether the diagnostic belongs in a compilation result.
    pub fn is_reportable(&self) -> bool {
        self.severity == Severity::Error || self.escalated
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.severity, self.code.as_str())?;
        if let Some(location) = self.location {
            write!(f, " {location}")?;
        }
        write!(f, ": {}", self.message)?;
        if self.escalated {
            write!(f, " (warning treated as error)")?;
        }
        Ok(())
    }
}
