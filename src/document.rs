//! Entities and the handles sessions give out for them.

use crate::core::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use regex::Regex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Store-assigned document identity
pub type DocumentId = i64;

/// A type that can be stored as a document.
///
/// `type_name` is written to the `Type` column and checked on load. The default is the
/// Rust type name without module paths, generic arguments included (`Wrapper<Post>`).
/// Two types with the same name in different modules get the same tag, so override it
/// for one of them; overriding also keeps stored data stable across renames.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn type_name() -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }
}

lazy_static::lazy_static! {
    static ref MODULE_PATH: Regex = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*::").unwrap();
    static ref GENERIC_NAMES: Mutex<HashMap<&'static str, &'static str>> = Mutex::new(HashMap::new());
}

fn short_type_name(full: &'static str) -> &'static str {
    if !full.contains('<') {
        return full.rsplit("::").next().unwrap_or(full);
    }

    // Generic names are built once per type and kept for the life of the process
    let mut names = GENERIC_NAMES.lock().unwrap_or_else(PoisonError::into_inner);
    *names.entry(full).or_insert_with(|| {
        let short = MODULE_PATH.replace_all(full, "").into_owned();
        Box::leak(short.into_boxed_str())
    })
}

/// Type-erased storage cell behind a [`DocHandle`].
pub(crate) trait EntityCell: Send + Sync {
    /// Current state as a serde tree
    fn snapshot(&self) -> Result<serde_json::Value>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn address(&self) -> *const ();
}

impl<T: Entity> EntityCell for RwLock<T> {
    fn snapshot(&self) -> Result<serde_json::Value> {
        let guard = self.read()?;
        Ok(serde_json::to_value(&*guard)?)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn address(&self) -> *const () {
        self as *const Self as *const ()
    }
}

/// Shared handle to a tracked entity.
///
/// Every load of the same id within a session yields a handle to the same value, so a
/// mutation made through one handle is visible through all of them.
pub struct DocHandle<T> {
    id: DocumentId,
    value: Arc<RwLock<T>>,
}

impl<T> Clone for DocHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            value: Arc::clone(&self.value),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for DocHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocHandle")
            .field("id", &self.id)
            .field("value", &self.value)
            .finish()
    }
}

impl<T: Entity> DocHandle<T> {
    pub(crate) fn new(id: DocumentId, entity: T) -> Self {
        Self {
            id,
            value: Arc::new(RwLock::new(entity)),
        }
    }

    /// Recover a typed handle from a tracked cell. `None` when `T` is the wrong type.
    pub(crate) fn from_cell(id: DocumentId, cell: Arc<dyn EntityCell>) -> Option<Self> {
        cell.into_any()
            .downcast::<RwLock<T>>()
            .ok()
            .map(|value| Self { id, value })
    }

    pub(crate) fn cell(&self) -> Arc<dyn EntityCell> {
        self.value.clone()
    }
}

impl<T> DocHandle<T> {
    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.value.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.value.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the entity in place. Call `Session::update` to schedule the change.
    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.write())
    }

    /// Whether both handles point at the same in-memory instance
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }

    pub(crate) fn address(&self) -> *const () {
        Arc::as_ptr(&self.value) as *const ()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct BlogPost {
        title: String,
    }

    impl Entity for BlogPost {}

    #[derive(Debug, Serialize, Deserialize)]
    struct Renamed;

    impl Entity for Renamed {
        fn type_name() -> &'static str {
            "LegacyName"
        }
    }

    #[test]
    fn test_default_type_name_is_unqualified() {
        assert_eq!(BlogPost::type_name(), "BlogPost");
        assert_eq!(Renamed::type_name(), "LegacyName");
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Wrapper<T> {
        inner: T,
    }

    impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> Entity for Wrapper<T> {}

    #[test]
    fn test_generic_type_names_keep_their_arguments() {
        assert_eq!(Wrapper::<BlogPost>::type_name(), "Wrapper<BlogPost>");
        assert_eq!(Wrapper::<Vec<String>>::type_name(), "Wrapper<Vec<String>>");
        assert_ne!(Wrapper::<BlogPost>::type_name(), Wrapper::<i64>::type_name());

        // Built once per type
        assert!(std::ptr::eq(
            Wrapper::<BlogPost>::type_name(),
            Wrapper::<BlogPost>::type_name()
        ));
    }

    #[test]
    fn test_handles_share_the_instance() {
        let handle = DocHandle::new(
            1,
            BlogPost {
                title: "draft".into(),
            },
        );
        let other = DocHandle::<BlogPost>::from_cell(1, handle.cell()).unwrap();

        other.modify(|post| post.title = "final".into());
        assert_eq!(handle.read().title, "final");
        assert!(handle.ptr_eq(&other));
        assert_eq!(handle.address(), handle.cell().address());
    }

    #[test]
    fn test_downcast_to_wrong_type_fails() {
        let handle = DocHandle::new(1, BlogPost { title: "x".into() });
        assert!(DocHandle::<Renamed>::from_cell(1, handle.cell()).is_none());
    }
}
