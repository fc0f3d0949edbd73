use std::borrow::Cow;
use std::fmt::{Debug, Display, Error as FmtError, Formatter};

/// Names of methods, fields
///
/// See <https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html#jvms-4.2.2>
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct UnqualifiedName(Cow<'static, str>);

/// Names of classes and interfaces, in internal form (eg. `java/lang/Object`)
///
/// See <https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html#jvms-4.2.1>
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct BinaryName(Cow<'static, str>);

/// Extracts the raw underlying string name
impl AsRef<str> for UnqualifiedName {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

/// Extracts the raw underlying string name
impl AsRef<str> for BinaryName {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

pub trait Name: Sized {
    /// Check if a string would be a valid name
    fn check_valid(name: impl AsRef<str>) -> Result<(), String>;

    /// Extact the raw underlying string data
    fn as_cow(&self) -> &Cow<'static, str>;

    /// Extact the raw underlying string name
    fn as_str(&self) -> &str {
        self.as_cow().as_ref()
    }

    /// Try to construct a name from a string
    fn from_string(name: String) -> Result<Self, String>;

    /// Try to construct a name from a string slice
    fn from_str(name: &str) -> Result<Self, String> {
        Self::from_string(name.to_owned())
    }
}

impl Name for UnqualifiedName {
    fn check_valid(name: impl AsRef<str>) -> Result<(), String> {
        let name = name.as_ref();
        if name.contains(&['.', ';', '[', '/'][..]) {
            Err(format!(
                "Unqualified name '{}' contains an illegal character",
                name
            ))
        } else if name.is_empty() {
            Err(format!("Unqualified name '{}' is empty", name))
        } else {
            Ok(())
        }
    }

    fn as_cow(&self) -> &Cow<'static, str> {
        &self.0
    }

    fn from_string(name: String) -> Result<Self, String> {
        Self::check_valid(&name)?;
        Ok(UnqualifiedName(Cow::Owned(name)))
    }
}

impl Name for BinaryName {
    fn check_valid(name: impl AsRef<str>) -> Result<(), String> {
        let name = name.as_ref();
        if name.is_empty() {
            Err(format!("Binary name '{}' is empty", name))
        } else {
            name.split('/').map(UnqualifiedName::check_valid).collect()
        }
    }

    fn as_cow(&self) -> &Cow<'static, str> {
        &self.0
    }

    fn from_string(name: String) -> Result<Self, String> {
        Self::check_valid(&name)?;
        Ok(BinaryName(Cow::Owned(name)))
    }
}

impl Debug for UnqualifiedName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

impl Debug for BinaryName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

impl Display for UnqualifiedName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

impl Display for BinaryName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

impl UnqualifiedName {
    const fn name(value: &'static str) -> UnqualifiedName {
        UnqualifiedName(Cow::Borrowed(value))
    }

    // Special unqualified names - only these are allowed to have angle brackets in them
    pub const INIT: Self = Self::name("<init>");
    pub const CLINIT: Self = Self::name("<clinit>");

    // Runtime helper entry points
    pub const GETDECLAREDFIELD: Self = Self::name("getDeclaredField");
    pub const GETSTATICBASE: Self = Self::name("getStaticBase");
}

impl BinaryName {
    /// Package portion of the name (everything before the last `/`)
    ///
    /// Classes in the default package have an empty package.
    pub fn package(&self) -> &str {
        match self.as_str().rfind('/') {
            Some(idx) => &self.as_str()[..idx],
            None => "",
        }
    }

    /// Name of the nested class `Outer$inner`
    pub fn nested(&self, inner: &str) -> BinaryName {
        BinaryName(Cow::Owned(format!("{}${}", self.as_str(), inner)))
    }

    const fn name(value: &'static str) -> BinaryName {
        BinaryName(Cow::Borrowed(value))
    }

    pub const OBJECT: Self = Self::name("java/lang/Object");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packages() {
        let name = BinaryName::from_str("com/example/Foo").unwrap();
        assert_eq!(name.package(), "com/example");
        assert_eq!(BinaryName::from_str("Foo").unwrap().package(), "");
        assert_eq!(name.nested("BaseHolder").as_str(), "com/example/Foo$BaseHolder");
    }

    #[test]
    fn invalid_names() {
        assert!(UnqualifiedName::from_str("a.b").is_err());
        assert!(UnqualifiedName::from_str("").is_err());
        assert!(BinaryName::from_str("com//Foo").is_err());
        assert!(BinaryName::from_str("com/Foo;").is_err());
    }
}
