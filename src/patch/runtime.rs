use super::Error;
use crate::jvm::{BinaryName, Name};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The process classes get patched for
///
/// Answers the questions that depend on the live state of the host: whether a class is already
/// loaded (which decides the patching mode), and where fields sit in memory (for raw access to
/// fields that cannot be accessed directly).
pub trait HostRuntime: Send + Sync {
    fn is_class_loaded(&self, class: &BinaryName) -> bool;

    /// Offset of an instance field from the start of its object
    fn field_offset(&self, owner: &BinaryName, name: &str) -> Result<i64, Error>;

    /// Offset of a static field from its static base object
    fn static_field_offset(&self, owner: &BinaryName, name: &str) -> Result<i64, Error>;
}

/// Frozen answers about a host, usually loaded from JSON
///
/// ```json
/// {
///   "loaded": ["com/example/Server"],
///   "offsets": { "com/example/Server.port": 12 },
///   "static_offsets": { "com/example/Server.INSTANCE": 104 }
/// }
/// ```
///
/// The default snapshot describes a detached host where nothing is loaded yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    #[serde(default)]
    pub loaded: BTreeSet<String>,

    /// Instance field offsets, keyed by `owner.name`
    #[serde(default)]
    pub offsets: BTreeMap<String, i64>,

    /// Static field offsets, keyed by `owner.name`
    #[serde(default)]
    pub static_offsets: BTreeMap<String, i64>,
}

impl RuntimeSnapshot {
    pub fn detached() -> RuntimeSnapshot {
        RuntimeSnapshot::default()
    }

    pub fn from_json(json: &str) -> Result<RuntimeSnapshot, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn mark_loaded(&mut self, class: &BinaryName) {
        self.loaded.insert(class.as_str().to_owned());
    }

    pub fn set_offset(&mut self, owner: &BinaryName, name: &str, offset: i64) {
        self.offsets.insert(Self::key(owner, name), offset);
    }

    pub fn set_static_offset(&mut self, owner: &BinaryName, name: &str, offset: i64) {
        self.static_offsets.insert(Self::key(owner, name), offset);
    }

    fn key(owner: &BinaryName, name: &str) -> String {
        format!("{}.{}", owner, name)
    }

    fn lookup(table: &BTreeMap<String, i64>, owner: &BinaryName, name: &str) -> Result<i64, Error> {
        let key = Self::key(owner, name);
        table
            .get(&key)
            .copied()
            .ok_or_else(|| Error::Runtime(format!("no offset known for {}", key)))
    }
}

impl HostRuntime for RuntimeSnapshot {
    fn is_class_loaded(&self, class: &BinaryName) -> bool {
        self.loaded.contains(class.as_str())
    }

    fn field_offset(&self, owner: &BinaryName, name: &str) -> Result<i64, Error> {
        Self::lookup(&self.offsets, owner, name)
    }

    fn static_field_offset(&self, owner: &BinaryName, name: &str) -> Result<i64, Error> {
        Self::lookup(&self.static_offsets, owner, name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_from_json() {
        let snapshot = RuntimeSnapshot::from_json(
            r#"{ "loaded": ["a/B"], "offsets": { "a/B.count": 12 } }"#,
        )
        .unwrap();
        let class = BinaryName::from_str("a/B").unwrap();

        assert!(snapshot.is_class_loaded(&class));
        assert!(!snapshot.is_class_loaded(&BinaryName::OBJECT));
        assert_eq!(snapshot.field_offset(&class, "count").unwrap(), 12);
        assert!(matches!(
            snapshot.static_field_offset(&class, "count"),
            Err(Error::Runtime(_))
        ));
    }

    #[test]
    fn detached_has_nothing_loaded() {
        let detached = RuntimeSnapshot::detached();
        assert!(!detached.is_class_loaded(&BinaryName::OBJECT));
    }
}
