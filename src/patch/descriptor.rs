use super::Error;
use crate::jvm::{BinaryName, Name};
use serde::{Deserialize, Serialize};
use std::fmt;

/// When the patched class will be handed to the host
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatchMode {
    /// Before the class is first defined, through a custom class loader
    #[serde(rename = "CLASSLOADER_TIME")]
    ClassLoaderTime,

    /// After the class is loaded, through live redefinition
    #[serde(rename = "LIVE_REDEFINE")]
    LiveRedefine,

    /// Whichever of the above fits, based on whether the target is already loaded
    #[serde(rename = "AUTO")]
    Auto,
}

impl Default for PatchMode {
    fn default() -> Self {
        PatchMode::Auto
    }
}

/// A [`PatchMode`] after `Auto` has been decided
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolvedMode {
    #[serde(rename = "CLASSLOADER_TIME")]
    ClassLoaderTime,
    #[serde(rename = "LIVE_REDEFINE")]
    LiveRedefine,
}

impl fmt::Display for ResolvedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedMode::ClassLoaderTime => f.write_str("CLASSLOADER_TIME"),
            ResolvedMode::LiveRedefine => f.write_str("LIVE_REDEFINE"),
        }
    }
}

fn default_priority() -> u32 {
    100
}

fn yes() -> bool {
    true
}

/// Declarative description of one patch
///
/// The code a patch injects lives in the methods of its `source` class. Fields and accessor
/// methods of the source class stand in for members of the target, as described by `members`:
/// uses of them inside injected code get rewritten into accesses to the real target members.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchDescriptor {
    pub name: String,

    /// Class being patched
    pub target: String,

    /// Class holding the code to inject
    #[serde(default)]
    pub source: Option<String>,

    /// Patches for the same target apply in ascending priority order
    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default)]
    pub mode: PatchMode,

    #[serde(default)]
    pub members: Vec<MemberDeclaration>,

    #[serde(default)]
    pub injections: Vec<InjectDeclaration>,

    #[serde(default)]
    pub replacements: Vec<ReplaceDeclaration>,
}

impl PatchDescriptor {
    pub fn new(name: &str, target: &str) -> PatchDescriptor {
        PatchDescriptor {
            name: name.to_owned(),
            target: target.to_owned(),
            source: None,
            priority: default_priority(),
            mode: PatchMode::Auto,
            members: vec![],
            injections: vec![],
            replacements: vec![],
        }
    }

    pub fn with_source(mut self, source: &str) -> PatchDescriptor {
        self.source = Some(source.to_owned());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> PatchDescriptor {
        self.priority = priority;
        self
    }

    pub fn with_mode(mut self, mode: PatchMode) -> PatchDescriptor {
        self.mode = mode;
        self
    }

    pub fn member(mut self, member: MemberDeclaration) -> PatchDescriptor {
        self.members.push(member);
        self
    }

    pub fn inject(mut self, injection: InjectDeclaration) -> PatchDescriptor {
        self.injections.push(injection);
        self
    }

    pub fn replace(mut self, method: &str, target: &str) -> PatchDescriptor {
        self.replacements.push(ReplaceDeclaration {
            method: method.to_owned(),
            target: target.to_owned(),
        });
        self
    }

    pub fn target_name(&self) -> Result<BinaryName, Error> {
        BinaryName::from_str(&self.target).map_err(Error::InvalidPatch)
    }

    /// Source class, which must be present if the patch carries any code
    pub fn source_name(&self) -> Result<Option<BinaryName>, Error> {
        match &self.source {
            Some(source) => BinaryName::from_str(source)
                .map(Some)
                .map_err(Error::InvalidPatch),
            None if self.injections.is_empty() && self.replacements.is_empty() => Ok(None),
            None => Err(Error::InvalidPatch(format!(
                "patch {} injects code but has no source class",
                self.name
            ))),
        }
    }

    /// Parse a list of patches from JSON
    pub fn list_from_json(json: &str) -> Result<Vec<PatchDescriptor>, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// How a member of the patch source class maps onto the target
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemberDeclaration {
    /// Source field (or accessor methods) standing for an existing field of the target
    FieldAccessor {
        /// Field on the source class
        name: String,
        descriptor: String,

        /// Field on the target, if named differently
        #[serde(default)]
        target_name: Option<String>,
        #[serde(default)]
        target_descriptor: Option<String>,

        /// Can the patch write the field?
        #[serde(default)]
        mutable: bool,

        /// Getter method on the source class, `()T`
        #[serde(default)]
        getter: Option<String>,

        /// Setter method on the source class, `(T)V`
        #[serde(default)]
        setter: Option<String>,

        /// Explicitly ask for the field's access flags to be widened
        #[serde(default)]
        widen: bool,
    },

    /// Source field or getter standing for the patched instance itself
    SelfReference {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        getter: Option<String>,
    },

    /// State the patch adds to the target
    NewField {
        name: String,
        descriptor: String,
        #[serde(default = "yes")]
        mutable: bool,
        #[serde(default)]
        is_static: bool,
        #[serde(default)]
        getter: Option<String>,
        #[serde(default)]
        setter: Option<String>,
    },
}

impl MemberDeclaration {
    /// Accessor for a target field that the source refers to under the same name
    pub fn field_accessor(name: &str, descriptor: &str, mutable: bool) -> MemberDeclaration {
        MemberDeclaration::FieldAccessor {
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            target_name: None,
            target_descriptor: None,
            mutable,
            getter: None,
            setter: None,
            widen: false,
        }
    }

    pub fn new_field(name: &str, descriptor: &str, is_static: bool) -> MemberDeclaration {
        MemberDeclaration::NewField {
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            mutable: true,
            is_static,
            getter: None,
            setter: None,
        }
    }
}

/// Where injected code goes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Anchor {
    /// Start of the method
    Head,

    /// End of the method
    Tail,

    /// Lines of disassembly to find, with `*` wildcards
    Pattern(String),
}

impl From<String> for Anchor {
    fn from(anchor: String) -> Anchor {
        match anchor.trim().to_ascii_uppercase().as_str() {
            "HEAD" => Anchor::Head,
            "TAIL" => Anchor::Tail,
            _ => Anchor::Pattern(anchor),
        }
    }
}

impl From<Anchor> for String {
    fn from(anchor: Anchor) -> String {
        match anchor {
            Anchor::Head => String::from("HEAD"),
            Anchor::Tail => String::from("TAIL"),
            Anchor::Pattern(pattern) => pattern,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Position {
    Before,
    After,
    Replace,
}

impl Default for Position {
    fn default() -> Self {
        Position::Before
    }
}

/// Splice the code of a source method into a target method
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectDeclaration {
    /// Method of the source class holding the code
    pub method: String,

    /// Method of the target class to patch (`name` or `name(desc)ret`)
    pub target: String,

    pub anchor: Anchor,

    #[serde(default)]
    pub position: Position,

    #[serde(default)]
    pub offset: i32,

    /// Let a `return` at the end of the injected code return from the target method
    #[serde(default)]
    pub keep_fallthrough_return: bool,

    #[serde(default = "yes")]
    pub ignore_line_numbers: bool,
}

impl InjectDeclaration {
    pub fn new(method: &str, target: &str, anchor: Anchor, position: Position) -> InjectDeclaration {
        InjectDeclaration {
            method: method.to_owned(),
            target: target.to_owned(),
            anchor,
            position,
            offset: 0,
            keep_fallthrough_return: false,
            ignore_line_numbers: true,
        }
    }
}

/// Swap the body of a target method for the body of a source method
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceDeclaration {
    pub method: String,
    pub target: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_patch_list() {
        let patches = PatchDescriptor::list_from_json(
            r#"[{
                "name": "greeting",
                "target": "app/Greeter",
                "source": "patches/GreeterPatch",
                "priority": 50,
                "mode": "CLASSLOADER_TIME",
                "members": [
                    { "kind": "field_accessor", "name": "count", "descriptor": "I", "mutable": true },
                    { "kind": "self_reference", "getter": "self" },
                    { "kind": "new_field", "name": "extra", "descriptor": "J" }
                ],
                "injections": [{
                    "method": "onGreet",
                    "target": "greet(Ljava/lang/String;)V",
                    "anchor": "ALOAD *\nINVOKEVIRTUAL *",
                    "position": "AFTER",
                    "offset": 1
                }]
            }, {
                "name": "minimal",
                "target": "app/Other"
            }]"#,
        )
        .unwrap();

        let greeting = &patches[0];
        assert_eq!(greeting.priority, 50);
        assert_eq!(greeting.mode, PatchMode::ClassLoaderTime);
        assert_eq!(
            greeting.members[0],
            MemberDeclaration::field_accessor("count", "I", true)
        );
        assert!(matches!(
            &greeting.members[2],
            MemberDeclaration::NewField { mutable: true, is_static: false, .. }
        ));
        let injection = &greeting.injections[0];
        assert_eq!(
            injection.anchor,
            Anchor::Pattern(String::from("ALOAD *\nINVOKEVIRTUAL *"))
        );
        assert_eq!(injection.position, Position::After);
        assert!(injection.ignore_line_numbers);
        assert!(!injection.keep_fallthrough_return);

        let minimal = &patches[1];
        assert_eq!(minimal.priority, 100);
        assert_eq!(minimal.mode, PatchMode::Auto);
        assert_eq!(minimal.source_name().unwrap(), None);
    }

    #[test]
    fn anchors() {
        assert_eq!(Anchor::from(String::from("head")), Anchor::Head);
        assert_eq!(Anchor::from(String::from(" TAIL ")), Anchor::Tail);
        assert_eq!(String::from(Anchor::Tail), "TAIL");
    }

    #[test]
    fn code_needs_a_source() {
        let patch = PatchDescriptor::new("p", "a/B").inject(InjectDeclaration::new(
            "m",
            "n",
            Anchor::Head,
            Position::Before,
        ));
        assert!(matches!(patch.source_name(), Err(Error::InvalidPatch(_))));
    }
}
