//! Process-wide interned string handles.
//!
//! Planner and queue code passes resource-type and subsystem names around
//! constantly; interning turns those comparisons into integer equality and
//! lets the handles be `Copy` keys in maps. Ids are monotonic per interner
//! and never reused for the life of the process.

use std::{
    collections::HashMap,
    fmt,
    sync::LazyLock,
};

use parking_lot::RwLock;
use serde::Serialize;

struct Interner {
    by_name: HashMap<&'static str, u32>,
    names: Vec<&'static str>,
}

impl Interner {
    fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            names: Vec::new(),
        }
    }

    fn intern(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        // Leaked so resolved names can be handed out as &'static str.
        // Interners are process-wide; entries are never reclaimed.
        let name: &'static str = Box::leak(name.to_owned().into_boxed_str());
        let id = self.names.len() as u32;
        self.names.push(name);
        self.by_name.insert(name, id);
        id
    }

    fn resolve(&self, id: u32) -> &'static str {
        self.names[id as usize]
    }
}

static RESOURCE_TYPES: LazyLock<RwLock<Interner>> = LazyLock::new(|| RwLock::new(Interner::new()));
static SUBSYSTEMS: LazyLock<RwLock<Interner>> = LazyLock::new(|| RwLock::new(Interner::new()));

/// An interned resource-type name ("core", "memory", "gpu", ...).
/// Equality and hashing are integer-fast; `as_str` resolves the name.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "String")]
pub struct ResourceType(u32);

impl ResourceType {
    pub fn intern(name: &str) -> Self {
        Self(RESOURCE_TYPES.write().intern(name))
    }

    pub fn as_str(&self) -> &'static str {
        RESOURCE_TYPES.read().resolve(self.0)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ResourceType({})", self.as_str())
    }
}

impl From<ResourceType> for String {
    fn from(rt: ResourceType) -> String {
        rt.as_str().to_owned()
    }
}

/// An interned subsystem name ("containment", "network", ...).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "String")]
pub struct Subsystem(u32);

impl Subsystem {
    pub fn intern(name: &str) -> Self {
        Self(SUBSYSTEMS.write().intern(name))
    }

    pub fn as_str(&self) -> &'static str {
        SUBSYSTEMS.read().resolve(self.0)
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Subsystem({})", self.as_str())
    }
}

impl From<Subsystem> for String {
    fn from(s: Subsystem) -> String {
        s.as_str().to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_idempotent() {
        let a = ResourceType::intern("core");
        let b = ResourceType::intern("core");
        let c = ResourceType::intern("memory");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "core");
        assert_eq!(c.as_str(), "memory");
    }

    #[test]
    fn test_namespaces_are_independent() {
        let r = ResourceType::intern("containment");
        let s = Subsystem::intern("containment");
        assert_eq!(r.as_str(), s.as_str());
    }
}
