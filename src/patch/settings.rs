use crate::jvm::{BinaryName, Name, UnqualifiedName};

/// Knobs for code generated while patching
#[derive(Clone, Debug)]
pub struct Settings {
    /// Class exposing raw memory access by field offset
    ///
    /// Expected to have static `get<T>(Ljava/lang/Object;J)T` and `put<T>(Ljava/lang/Object;TJ)V`
    /// methods for every `T` in `Boolean`, `Byte`, `Char`, `Short`, `Int`, `Long`, `Float`,
    /// `Double`, `Object`, as well as `getDeclaredField` and `getStaticBase` helpers.
    pub unsafe_access_class: String,

    /// Class implementing out-of-band field storage
    ///
    /// Expected to have a `<init>(I)V` constructor taking the arity, and instance methods
    /// `get<T>(Ljava/lang/Object;I)T` and `put<T>(Ljava/lang/Object;IT)V`.
    pub proxy_store_class: String,

    /// Suffix for generated classes caching the base object of static fields
    pub base_holder_suffix: String,

    /// Suffix for generated classes holding proxy stores for new fields
    pub proxy_holder_suffix: String,

    /// Check that patched methods still have consistent stack depths
    pub validate_stack: bool,
}

impl Settings {
    pub fn new() -> Settings {
        Settings {
            unsafe_access_class: String::from("bytepatch/runtime/UnsafeAccess"),
            proxy_store_class: String::from("bytepatch/runtime/ProxyStore"),
            base_holder_suffix: String::from("BaseHolder"),
            proxy_holder_suffix: String::from("ProxyFields"),
            validate_stack: true,
        }
    }

    /// Check that every configured name is usable in a class file
    pub fn validate(&self) -> Result<(), String> {
        BinaryName::check_valid(&self.unsafe_access_class)?;
        BinaryName::check_valid(&self.proxy_store_class)?;
        UnqualifiedName::check_valid(&self.base_holder_suffix)?;
        UnqualifiedName::check_valid(&self.proxy_holder_suffix)?;
        Ok(())
    }

    pub(crate) fn unsafe_access(&self) -> Result<BinaryName, String> {
        BinaryName::from_str(&self.unsafe_access_class)
    }

    pub(crate) fn proxy_store(&self) -> Result<BinaryName, String> {
        BinaryName::from_str(&self.proxy_store_class)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Settings::new().validate().is_ok());

        let mut settings = Settings::new();
        settings.proxy_holder_suffix = String::from("a/b");
        assert!(settings.validate().is_err());
    }
}
