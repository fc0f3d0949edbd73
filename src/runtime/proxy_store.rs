use super::Error;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Source of identity keys. Keys are never handed out twice.
static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// Something holding per-identity state that must go when the identity does
trait Evict: Send + Sync {
    fn evict(&self, key: u64);
}

/// Identity of an object that owns proxied fields
///
/// The handle lives exactly as long as its owner. Dropping it evicts the owner's entries from
/// every store it was ever written to, after which reads for its key return defaults. Since
/// keys come from a global counter, a new identity can never observe a dead one's values.
pub struct Identity {
    key: u64,

    /// Stores that hold entries for this identity
    hooks: Mutex<Vec<Weak<dyn Evict>>>,
}

impl Identity {
    pub fn new() -> Identity {
        Identity {
            key: NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed),
            hooks: Mutex::new(vec![]),
        }
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    fn on_drop(&self, hook: Weak<dyn Evict>) {
        self.hooks.lock().push(hook);
    }
}

impl Default for Identity {
    fn default() -> Self {
        Identity::new()
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        for hook in self.hooks.get_mut().drain(..) {
            if let Some(store) = hook.upgrade() {
                store.evict(self.key);
            }
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.key)
    }
}

/// Out-of-band storage for `arity` fields of one storage kind
///
/// Every owner gets a row of `arity` slots, and a field is addressed by its index in the row.
/// Reads never block on or fail because of a concurrent eviction: a missing row reads as the
/// default value.
pub struct ProxyStore<T> {
    arity: usize,
    rows: DashMap<u64, Box<[T]>>,
}

impl<T> ProxyStore<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    pub fn new(arity: usize) -> Arc<ProxyStore<T>> {
        Arc::new(ProxyStore {
            arity,
            rows: DashMap::new(),
        })
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Number of owners with live entries
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn check_index(&self, index: usize) -> Result<(), Error> {
        if index >= self.arity {
            return Err(Error::IndexOutOfRange {
                index,
                arity: self.arity,
            });
        }
        Ok(())
    }

    pub fn get(&self, owner: &Identity, index: usize) -> Result<T, Error> {
        self.get_by_key(owner.key(), index)
    }

    /// Read by raw key (the owner may already be gone)
    pub fn get_by_key(&self, key: u64, index: usize) -> Result<T, Error> {
        self.check_index(index)?;
        Ok(self
            .rows
            .get(&key)
            .map(|row| row[index].clone())
            .unwrap_or_default())
    }

    pub fn put(self: &Arc<Self>, owner: &Identity, index: usize, value: T) -> Result<(), Error> {
        self.check_index(index)?;

        let mut created = false;
        {
            let mut row = self.rows.entry(owner.key()).or_insert_with(|| {
                created = true;
                vec![T::default(); self.arity].into_boxed_slice()
            });
            row[index] = value;
        }

        // Registered outside the map lock
        if created {
            let hook: Weak<dyn Evict> = Arc::downgrade(self) as Weak<dyn Evict>;
            owner.on_drop(hook);
        }
        Ok(())
    }
}

impl<T> Evict for ProxyStore<T>
where
    T: Send + Sync,
{
    fn evict(&self, key: u64) {
        self.rows.remove(&key);
    }
}

/// Value of a reference-typed proxied field (`None` is `null`)
pub type ObjectValue = Option<Arc<dyn Any + Send + Sync>>;

/// Store for the reference-typed group
pub type ObjectStore = ProxyStore<ObjectValue>;

/// Storage group of a proxied field
///
/// Each primitive sort has its own group; all references share one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Object,
}

impl StoreKind {
    pub const ALL: [StoreKind; 9] = [
        StoreKind::Boolean,
        StoreKind::Byte,
        StoreKind::Char,
        StoreKind::Short,
        StoreKind::Int,
        StoreKind::Long,
        StoreKind::Float,
        StoreKind::Double,
        StoreKind::Object,
    ];

    /// Group for a field descriptor
    pub fn of_descriptor(descriptor: &str) -> Option<StoreKind> {
        Some(match descriptor.chars().next()? {
            'Z' => StoreKind::Boolean,
            'B' => StoreKind::Byte,
            'C' => StoreKind::Char,
            'S' => StoreKind::Short,
            'I' => StoreKind::Int,
            'J' => StoreKind::Long,
            'F' => StoreKind::Float,
            'D' => StoreKind::Double,
            'L' | '[' => StoreKind::Object,
            _ => return None,
        })
    }

    /// Name used in generated accessor and field names (`getInt`, `STORE_INT`)
    pub fn name(&self) -> &'static str {
        match self {
            StoreKind::Boolean => "Boolean",
            StoreKind::Byte => "Byte",
            StoreKind::Char => "Char",
            StoreKind::Short => "Short",
            StoreKind::Int => "Int",
            StoreKind::Long => "Long",
            StoreKind::Float => "Float",
            StoreKind::Double => "Double",
            StoreKind::Object => "Object",
        }
    }

    /// Erased descriptor values of this group are stored as
    pub fn descriptor(&self) -> &'static str {
        match self {
            StoreKind::Boolean => "Z",
            StoreKind::Byte => "B",
            StoreKind::Char => "C",
            StoreKind::Short => "S",
            StoreKind::Int => "I",
            StoreKind::Long => "J",
            StoreKind::Float => "F",
            StoreKind::Double => "D",
            StoreKind::Object => "Ljava/lang/Object;",
        }
    }

    /// Does a value take two stack slots?
    pub fn is_wide(&self) -> bool {
        matches!(self, StoreKind::Long | StoreKind::Double)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn set_then_get() {
        let store = ProxyStore::<i32>::new(2);
        let owner = Identity::new();

        assert_eq!(store.get(&owner, 0).unwrap(), 0);
        store.put(&owner, 0, 7).unwrap();
        store.put(&owner, 1, 8).unwrap();
        store.put(&owner, 0, 9).unwrap();
        assert_eq!(store.get(&owner, 0).unwrap(), 9);
        assert_eq!(store.get(&owner, 1).unwrap(), 8);

        let other = Identity::new();
        assert_eq!(store.get(&other, 0).unwrap(), 0);
        assert_eq!(
            store.put(&other, 2, 1),
            Err(Error::IndexOutOfRange { index: 2, arity: 2 })
        );
        assert_eq!(
            store.get(&owner, 2),
            Err(Error::IndexOutOfRange { index: 2, arity: 2 })
        );
        assert_eq!(
            store.get(&other, 5),
            Err(Error::IndexOutOfRange { index: 5, arity: 2 })
        );
    }

    #[test]
    fn dropped_owner_reads_default() {
        let longs = ProxyStore::<i64>::new(1);
        let objects = ObjectStore::new(1);

        let owner = Identity::new();
        let key = owner.key();
        longs.put(&owner, 0, 42).unwrap();
        objects
            .put(&owner, 0, Some(Arc::new(String::from("hello"))))
            .unwrap();
        assert_eq!(longs.len(), 1);

        drop(owner);
        assert_eq!(longs.get_by_key(key, 0).unwrap(), 0);
        assert!(objects.get_by_key(key, 0).unwrap().is_none());
        assert!(longs.is_empty());
        assert!(objects.is_empty());

        // No resurrection through a fresh identity
        let fresh = Identity::new();
        assert_ne!(fresh.key(), key);
        assert_eq!(longs.get(&fresh, 0).unwrap(), 0);
    }

    #[test]
    fn store_dropped_before_owner() {
        let owner = Identity::new();
        {
            let store = ProxyStore::<f64>::new(1);
            store.put(&owner, 0, 1.5).unwrap();
        }
        drop(owner);
    }

    #[test]
    fn concurrent_owners() {
        let store = ProxyStore::<u64>::new(1);
        thread::scope(|scope| {
            for i in 0..8u64 {
                let store = &store;
                scope.spawn(move || {
                    let owner = Identity::new();
                    for _ in 0..100 {
                        let next = store.get(&owner, 0).unwrap() + i;
                        store.put(&owner, 0, next).unwrap();
                    }
                    assert_eq!(store.get(&owner, 0).unwrap(), 100 * i);
                });
            }
        });
        assert!(store.is_empty());
    }

    #[test]
    fn kinds() {
        assert_eq!(StoreKind::of_descriptor("J"), Some(StoreKind::Long));
        assert_eq!(
            StoreKind::of_descriptor("Ljava/lang/String;"),
            Some(StoreKind::Object)
        );
        assert_eq!(StoreKind::of_descriptor("[I"), Some(StoreKind::Object));
        assert_eq!(StoreKind::of_descriptor("V"), None);
        assert!(StoreKind::Double.is_wide());
        assert_eq!(StoreKind::Int.name(), "Int");
    }
}
