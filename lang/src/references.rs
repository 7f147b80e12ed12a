use std::{fmt::Display, path::PathBuf, sync::Arc};

use tracing::debug;

use crate::runtime::{self, NativeModule};

/// Modules every source unit may use without a `use` directive.
pub const CORE_SET: [&str; 4] = ["core", "io", "text", "dynamic"];

/// Extension of the marker files [`ProbingResolver`] looks for.
pub const LIBRARY_EXTENSION: &str = "flib";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleVersion {
    pub major: u16,
    pub minor: u16,
}

impl ModuleVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        ModuleVersion { major, minor }
    }
}

impl Display for ModuleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone)]
pub struct ModuleBinding {
    pub name: String,
    pub version: ModuleVersion,
    pub module: Arc<NativeModule>,
}

/// The host's declared module-name to native-module bindings.
#[derive(Debug, Clone, Default)]
pub struct ModuleTable {
    bindings: Vec<ModuleBinding>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let v1 = ModuleVersion::new(1, 0);
        let mut table = Self::new();
        table
            .bind(runtime::core_module(), v1)
            .bind(runtime::io_module(), v1)
            .bind(runtime::text_module(), v1)
            .bind(runtime::dynamic_module(), v1)
            .bind(runtime::seq_module(), v1);
        table
    }

    /// Adds a binding, replacing any earlier one with the same name.
    pub fn bind(&mut self, module: NativeModule, version: ModuleVersion) -> &mut Self {
        let binding = ModuleBinding {
            name: module.name.to_owned(),
            version,
            module: Arc::new(module),
        };
        match self.bindings.iter_mut().find(|b| b.name == binding.name) {
            Some(existing) => *existing = binding,
            None => self.bindings.push(binding),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&ModuleBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.name.as_str())
    }
}

/// Resolved modules a compilation may reference, unique by name, in
/// resolution order.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    entries: Vec<ModuleBinding>,
}

impl ReferenceSet {
    /// Returns false if a module of that name is already present.
    pub fn insert(&mut self, binding: ModuleBinding) -> bool {
        if self.contains(&binding.name) {
            return false;
        }
        self.entries.push(binding);
        true
    }

    pub fn get(&self, name: &str) -> Option<&ModuleBinding> {
        self.entries.iter().find(|b| b.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleBinding> {
        self.entries.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|b| b.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Maps the modules a source unit implies onto concrete bindings.
///
/// Names that cannot be resolved are left out of the result; the compiler
/// reports any use of them.
pub trait ReferenceResolver {
    fn resolve(&self, imports: &[String]) -> ReferenceSet;
}

fn candidates(imports: &[String]) -> impl Iterator<Item = &str> {
    CORE_SET
        .iter()
        .copied()
        .chain(imports.iter().map(String::as_str))
}

/// Resolves against the host module table alone.
#[derive(Debug, Clone)]
pub struct TableResolver {
    table: Arc<ModuleTable>,
}

impl TableResolver {
    pub fn new(table: Arc<ModuleTable>) -> Self {
        TableResolver { table }
    }
}

impl ReferenceResolver for TableResolver {
    fn resolve(&self, imports: &[String]) -> ReferenceSet {
        let mut set = ReferenceSet::default();
        for name in candidates(imports) {
            if set.contains(name) {
                continue;
            }
            match self.table.get(name) {
                Some(binding) => {
                    set.insert(binding.clone());
                }
                None => debug!(module = name, "dropping reference with no binding"),
            }
        }
        debug!(references = ?set.names(), "resolved references");
        set
    }
}

/// Keeps a candidate only when `<root>/<name>.flib` exists and the table
/// binds the name.
#[derive(Debug, Clone)]
pub struct ProbingResolver {
    root: PathBuf,
    table: Arc<ModuleTable>,
}

impl ProbingResolver {
    pub fn new(root: impl Into<PathBuf>, table: Arc<ModuleTable>) -> Self {
        ProbingResolver {
            root: root.into(),
            table,
        }
    }
}

impl ReferenceResolver for ProbingResolver {
    fn resolve(&self, imports: &[String]) -> ReferenceSet {
        let mut set = ReferenceSet::default();
        for name in candidates(imports) {
            if set.contains(name) {
                continue;
            }
            let path = self.root.join(format!("{name}.{LIBRARY_EXTENSION}"));
            if !path.is_file() {
                debug!(module = name, path = %path.display(), "no library on disk");
                continue;
            }
            match self.table.get(name) {
                Some(binding) => {
                    set.insert(binding.clone());
                }
                None => debug!(module = name, "library on disk has no binding"),
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imports(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn core_set_comes_first_and_duplicates_collapse() {
        let resolver = TableResolver::new(Arc::new(ModuleTable::standard()));
        let set = resolver.resolve(&imports(&["seq", "io", "seq"]));
        assert_eq!(set.names(), vec!["core", "io", "text", "dynamic", "seq"]);
    }

    #[test]
    fn unknown_modules_are_dropped_silently() {
        let resolver = TableResolver::new(Arc::new(ModuleTable::standard()));
        let set = resolver.resolve(&imports(&["net", "seq"]));
        assert!(!set.contains("net"));
        assert!(set.contains("seq"));
        assert_eq!(set.len(), 5);
    }

    #[test]
    fn rebinding_replaces_the_version() {
        let mut table = ModuleTable::standard();
        table.bind(runtime::seq_module(), ModuleVersion::new(2, 1));
        assert_eq!(table.get("seq").unwrap().version.to_string(), "2.1");
        assert_eq!(table.names().filter(|n| *n == "seq").count(), 1);
    }

    #[test]
    fn probing_requires_a_file_and_a_binding() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["core", "io", "seq", "net"] {
            std::fs::write(dir.path().join(format!("{name}.flib")), b"").unwrap();
        }
        let resolver = ProbingResolver::new(dir.path(), Arc::new(ModuleTable::standard()));
        let set = resolver.resolve(&imports(&["seq", "net"]));
        assert_eq!(set.names(), vec!["core", "io", "seq"]);
    }
}
