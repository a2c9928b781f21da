//! Named module factories inside one module binary.
//!
//! A binary may carry several implementations; the host picks one by name
//! (the `module_type` setting) or, when no name is given, expects exactly one.

use crate::module::Module;

type Factory = Box<dyn Fn() -> anyhow::Result<Box<dyn Module>> + Send + Sync>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ResolveError {
    #[error("module type '{requested}' not found; the binary provides: {}", list(.candidates))]
    NotFound {
        requested: String,
        candidates: Vec<String>,
    },
    #[error("the binary does not provide any module implementation")]
    NoCandidates,
    #[error("the binary provides more than one module ({}); set module_type to pick one", list(.candidates))]
    Ambiguous { candidates: Vec<String> },
}

fn list(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

pub struct Registration {
    type_name: String,
    factory: Factory,
}

impl Registration {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Construct a fresh, uninitialized instance.
    pub fn construct(&self) -> anyhow::Result<Box<dyn Module>> {
        (self.factory)()
    }
}

#[derive(Default)]
pub struct ModuleRegistry {
    entries: Vec<Registration>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: Module + Default>(self, type_name: &str) -> Self {
        self.register_with(type_name, || Ok(Box::new(M::default()) as Box<dyn Module>))
    }

    pub fn register_with<F>(mut self, type_name: &str, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        self.entries.push(Registration {
            type_name: type_name.to_string(),
            factory: Box::new(factory),
        });
        self
    }

    pub fn type_names(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.type_name.clone()).collect()
    }

    pub fn resolve(&self, requested: Option<&str>) -> Result<&Registration, ResolveError> {
        match requested {
            Some(name) => self
                .entries
                .iter()
                .find(|r| r.type_name == name)
                .ok_or_else(|| ResolveError::NotFound {
                    requested: name.to_string(),
                    candidates: self.type_names(),
                }),
            None => match self.entries.as_slice() {
                [] => Err(ResolveError::NoCandidates),
                [only] => Ok(only),
                _ => Err(ResolveError::Ambiguous {
                    candidates: self.type_names(),
                }),
            },
        }
    }
}
