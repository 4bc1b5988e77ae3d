use anyhow::{Result, anyhow};
use rayon::prelude::*;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::extractor::{ClassExtractor, ClassUnit};

/// Process-wide map from type name to definition source.
///
/// Populated once before any generation work starts, then only read. The
/// first definition inserted for a name wins.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<String, String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the extractor over every file and merges each class's reachable
    /// type definitions in file enumeration order.
    ///
    /// Extraction is spread over the current rayon pool; merging is
    /// sequential so duplicate names resolve the same way on every run.
    pub fn build<E>(source_files: &[PathBuf], extractor: &E) -> Self
    where
        E: ClassExtractor + ?Sized,
    {
        let extracted: Vec<_> = source_files
            .par_iter()
            .map(|file| (file, extract_guarded(extractor, file)))
            .collect();

        let mut registry = Self::new();
        let mut failed = 0usize;
        for (file, result) in extracted {
            match result {
                Ok(classes) => {
                    for class in classes {
                        for (name, source) in class.referenced_type_defs {
                            if !registry.insert(name.clone(), source) {
                                debug!(
                                    name = %name,
                                    file = %file.display(),
                                    "duplicate type ignored"
                                );
                            }
                        }
                    }
                }
                Err(err) => {
                    failed += 1;
                    warn!(
                        file = %file.display(),
                        error = %format!("{err:#}"),
                        "extraction failed; file skipped for registry"
                    );
                }
            }
        }

        info!(
            types = registry.len(),
            files = source_files.len(),
            failed,
            "type registry built"
        );
        registry
    }

    /// Inserts unless `name` is already present. Returns whether it was new.
    pub fn insert(&mut self, name: String, source: String) -> bool {
        if self.types.contains_key(&name) {
            return false;
        }
        self.types.insert(name, source);
        true
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.types.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// A panicking extractor counts as a failed extraction for that file.
fn extract_guarded<E>(extractor: &E, file: &Path) -> Result<Vec<ClassUnit>>
where
    E: ClassExtractor + ?Sized,
{
    panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(file)))
        .unwrap_or_else(|_| Err(anyhow!("extractor panicked on {}", file.display())))
}

impl FromIterator<(String, String)> for TypeRegistry {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut registry = Self::new();
        for (name, source) in iter {
            registry.insert(name, source);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::collections::BTreeMap;

    struct MapExtractor(HashMap<PathBuf, Vec<(&'static str, &'static str)>>);

    impl ClassExtractor for MapExtractor {
        fn extract(&self, source_file: &Path) -> Result<Vec<ClassUnit>> {
            if source_file.ends_with("Panic.cs") {
                panic!("extractor bug");
            }
            let Some(defs) = self.0.get(source_file) else {
                bail!("unparsable: {}", source_file.display());
            };
            let referenced_type_defs: BTreeMap<String, String> = defs
                .iter()
                .map(|(n, s)| (n.to_string(), s.to_string()))
                .collect();
            Ok(vec![ClassUnit {
                class_name: "Any".to_string(),
                referenced_type_defs,
                ..ClassUnit::default()
            }])
        }
    }

    #[test]
    fn first_definition_wins_in_enumeration_order() {
        let a = PathBuf::from("/src/A.cs");
        let b = PathBuf::from("/src/B.cs");
        let extractor = MapExtractor(HashMap::from([
            (a.clone(), vec![("Customer", "class Customer { /* A */ }")]),
            (
                b.clone(),
                vec![
                    ("Customer", "class Customer { /* B */ }"),
                    ("Address", "class Address {}"),
                ],
            ),
        ]));

        let registry = TypeRegistry::build(&[a, b], &extractor);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("Customer"), Some("class Customer { /* A */ }"));
        assert_eq!(registry.get("Address"), Some("class Address {}"));
    }

    #[test]
    fn failed_extraction_contributes_nothing() {
        let good = PathBuf::from("/src/Good.cs");
        let bad = PathBuf::from("/src/Bad.cs");
        let extractor = MapExtractor(HashMap::from([(
            good.clone(),
            vec![("Customer", "class Customer {}")],
        )]));

        let registry = TypeRegistry::build(&[bad, good], &extractor);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("Customer"));
    }

    #[test]
    fn panicking_extractor_is_treated_as_failure() {
        let good = PathBuf::from("/src/Good.cs");
        let extractor = MapExtractor(HashMap::from([(
            good.clone(),
            vec![("Customer", "class Customer {}")],
        )]));

        let registry = TypeRegistry::build(&[PathBuf::from("/src/Panic.cs"), good], &extractor);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn insert_never_overwrites() {
        let mut registry = TypeRegistry::new();
        assert!(registry.insert("Foo".into(), "first".into()));
        assert!(!registry.insert("Foo".into(), "second".into()));
        assert_eq!(registry.get("Foo"), Some("first"));
    }

    #[test]
    fn empty_file_list_builds_empty_registry() {
        let registry = TypeRegistry::build(&[], &MapExtractor(HashMap::new()));
        assert!(registry.is_empty());
    }
}
