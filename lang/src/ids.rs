use std::sync::atomic::{AtomicU64, Ordering};

/// What an identifier will name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdPurpose {
    CompilationUnit,
    Context,
}

impl IdPurpose {
    fn prefix(self) -> &'static str {
        match self {
            IdPurpose::CompilationUnit => "unit",
            IdPurpose::Context => "ctx",
        }
    }
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self, purpose: IdPurpose) -> String;
}

/// Random identifiers; collisions are possible only in theory.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn next_id(&self, purpose: IdPurpose) -> String {
        format!("{}-{}", purpose.prefix(), uuid::Uuid::new_v4().simple())
    }
}

/// `<prefix>-<purpose>-<n>` with a counter shared across purposes.
#[derive(Debug, Default)]
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        SequentialIds {
            prefix: prefix.into(),
            next: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self, purpose: IdPurpose) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{n}", self.prefix, purpose.prefix())
    }
}

/// Hands out the same identifier every time.
#[derive(Debug, Clone)]
pub struct FixedIds(pub String);

impl IdGenerator for FixedIds {
    fn next_id(&self, _: IdPurpose) -> String {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_ids_are_deterministic() {
        let ids = SequentialIds::new("t");
        assert_eq!(ids.next_id(IdPurpose::CompilationUnit), "t-unit-0");
        assert_eq!(ids.next_id(IdPurpose::Context), "t-ctx-1");
    }

    #[test]
    fn random_ids_differ() {
        let a = RandomIds.next_id(IdPurpose::Context);
        let b = RandomIds.next_id(IdPurpose::Context);
        assert!(a.starts_with("ctx-"));
        assert_ne!(a, b);
    }
}
