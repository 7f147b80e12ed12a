use std::fmt::Display;

/// Language revision a source unit is written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LanguageVersion {
    V1,
    #[default]
    V2,
}

impl LanguageVersion {
    pub const LATEST: Self = LanguageVersion::V2;

    pub fn number(self) -> u32 {
        match self {
            LanguageVersion::V1 => 1,
            LanguageVersion::V2 => 2,
        }
    }
}

impl Display for LanguageVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.number())
    }
}

impl std::str::FromStr for LanguageVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" | "1" => Ok(LanguageVersion::V1),
            "v2" | "2" | "latest" => Ok(LanguageVersion::V2),
            _ => Err(format!("unknown language version: {s}")),
        }
    }
}

/// Source text submitted to the compiler. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    text: String,
    version: LanguageVersion,
}

impl SourceUnit {
    pub fn new(text: impl Into<String>, version: LanguageVersion) -> Self {
        Self {
            text: text.into(),
            version,
        }
    }

    pub fn latest(text: impl Into<String>) -> Self {
        Self::new(text, LanguageVersion::LATEST)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn version(&self) -> LanguageVersion {
        self.version
    }

    pub fn slice(&self, span: Span) -> &str {
        &self.text[span.start..span.end]
    }

    pub fn location(&self, span: Span) -> Location {
        let offset = span.start.min(self.text.len());
        match pest::Position::new(&self.text, offset) {
            Some(pos) => {
                let (line, col) = pos.line_col();
                Location { line, col }
            }
            None => Location { line: 1, col: 1 },
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn from_pest(span: pest::Span) -> Self {
        Self {
            start: span.start(),
            end: span.end(),
        }
    }

    /// Span covering `self` through the end of `other`.
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub line: usize,
    pub col: usize,
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_counts_lines_and_columns_from_one() {
        let unit = SourceUnit::latest("use io;\n  type A {}");
        let span = Span { start: 10, end: 14 };
        assert_eq!(unit.slice(span), "type");
        assert_eq!(unit.location(span), Location { line: 2, col: 3 });
    }

    #[test]
    fn version_parses_from_cli_spelling() {
        assert_eq!("v1".parse::<LanguageVersion>(), Ok(LanguageVersion::V1));
        assert_eq!("latest".parse::<LanguageVersion>(), Ok(LanguageVersion::V2));
        assert!("v9".parse::<LanguageVersion>().is_err());
    }
}
