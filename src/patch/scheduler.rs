use super::access::{AccessEngine, AccessMapping};
use super::descriptor::{PatchDescriptor, PatchMode, ResolvedMode};
use super::method_patcher::{validate_stack, MethodPatcher};
use super::{Error, HostRuntime, LogFacade, PatchLogger, Settings};
use crate::jvm::class_file::{ClassAssembler, ClassWriter};
use crate::jvm::{BinaryName, ClassDescriptor, MethodNode, Name};
use crate::registry::ClassRegistry;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::Arc;

/// Bytes of one class produced by a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchedClass {
    pub bytes: Vec<u8>,
    pub mode: ResolvedMode,

    /// Generated helper class, rather than a patched target
    pub synthetic: bool,
}

/// Outcome of a run, keyed by internal class name
#[derive(Debug, Default)]
pub struct PatchRun {
    pub classes: BTreeMap<String, PatchedClass>,
    pub failures: BTreeMap<String, Error>,
}

/// Hooks called as classes come out of a run
///
/// Only classes that were patched successfully are reported.
pub trait PostProcessor {
    fn class_patched(&self, _class: &BinaryName, _mode: ResolvedMode) {}
    fn method_patched(&self, _class: &BinaryName, _method: &str) {}
    fn field_added(&self, _class: &BinaryName, _field: &str) {}
    fn finished(&self, _run: &PatchRun) {}
}

struct Scheduled {
    priority: u32,
    sequence: u64,
    patch: PatchDescriptor,
}

impl Scheduled {
    fn key(&self) -> (u32, u64) {
        (self.priority, self.sequence)
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Patches for one target, all in the same mode
struct Schedule {
    mode: ResolvedMode,
    patches: BTreeSet<Scheduled>,
}

/// Everything that came out of patching one target
struct ClassOutput {
    class: ClassDescriptor,
    synthetic: Vec<ClassDescriptor>,
    methods: Vec<String>,
    fields: Vec<String>,
}

/// Collects patches, then applies them class by class
pub struct Patcher<'a> {
    registry: &'a ClassRegistry,
    runtime: &'a dyn HostRuntime,
    settings: Settings,
    logger: Arc<dyn PatchLogger>,
    assembler: Box<dyn ClassAssembler>,
    post_processors: Vec<Box<dyn PostProcessor + 'a>>,
    schedules: BTreeMap<BinaryName, Schedule>,

    /// Registration counter, breaking ties between equal priorities
    sequence: u64,
}

impl<'a> Patcher<'a> {
    pub fn new(
        registry: &'a ClassRegistry,
        runtime: &'a dyn HostRuntime,
        settings: Settings,
    ) -> Result<Patcher<'a>, Error> {
        settings.validate().map_err(Error::InvalidPatch)?;
        Ok(Patcher {
            registry,
            runtime,
            settings,
            logger: Arc::new(LogFacade),
            assembler: Box::new(ClassWriter::new()),
            post_processors: vec![],
            schedules: BTreeMap::new(),
            sequence: 0,
        })
    }

    pub fn with_logger(mut self, logger: Arc<dyn PatchLogger>) -> Patcher<'a> {
        self.logger = logger;
        self
    }

    pub fn with_assembler(mut self, assembler: Box<dyn ClassAssembler>) -> Patcher<'a> {
        self.assembler = assembler;
        self
    }

    pub fn add_post_processor(&mut self, post_processor: impl PostProcessor + 'a) {
        self.post_processors.push(Box::new(post_processor));
    }

    /// Schedule a patch, deciding its mode
    ///
    /// `Auto` picks class-loader-time patching for classes the host has not loaded yet, and live
    /// redefinition otherwise. Once decided, the mode is fixed for every patch of the same class.
    pub fn register(&mut self, patch: PatchDescriptor) -> Result<ResolvedMode, Error> {
        let target = patch.target_name()?;
        patch.source_name()?;

        let loaded = self.runtime.is_class_loaded(&target);
        let mode = match (patch.mode, loaded) {
            (PatchMode::Auto, false) | (PatchMode::ClassLoaderTime, false) => {
                ResolvedMode::ClassLoaderTime
            }
            (PatchMode::Auto, true) | (PatchMode::LiveRedefine, true) => {
                ResolvedMode::LiveRedefine
            }
            (PatchMode::ClassLoaderTime, true) => {
                return Err(Error::InvalidPatchMode(format!(
                    "{} asks for class-loader-time patching, but {} is already loaded",
                    patch.name, target
                )))
            }
            (PatchMode::LiveRedefine, false) => {
                return Err(Error::InvalidPatchMode(format!(
                    "{} asks for live redefinition, but {} is not loaded",
                    patch.name, target
                )))
            }
        };

        let schedule = self.schedules.entry(target.clone()).or_insert_with(|| Schedule {
            mode,
            patches: BTreeSet::new(),
        });
        if schedule.mode != mode {
            return Err(Error::InvalidPatchMode(format!(
                "{} resolves to {} but earlier patches of {} use {}",
                patch.name, mode, target, schedule.mode
            )));
        }

        self.logger.debug(&format!(
            "Registered {} for {} ({}, priority {})",
            patch.name, target, mode, patch.priority
        ));
        self.sequence += 1;
        schedule.patches.insert(Scheduled {
            priority: patch.priority,
            sequence: self.sequence,
            patch,
        });
        Ok(mode)
    }

    /// Names of registered patches for a class, in the order they will apply
    pub fn scheduled(&self, target: &BinaryName) -> Vec<&str> {
        self.schedules
            .get(target)
            .map(|schedule| {
                schedule
                    .patches
                    .iter()
                    .map(|scheduled| scheduled.patch.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply every schedule
    ///
    /// A class that fails ends up in [`PatchRun::failures`] and takes its helper classes with it;
    /// other classes are unaffected.
    pub fn run(&self) -> PatchRun {
        let mut run = PatchRun::default();

        for (target, schedule) in &self.schedules {
            log::info!(
                "Patching {} with {} patch(es)",
                target,
                schedule.patches.len()
            );
            match self.patch_class(target, schedule).and_then(|output| {
                let bytes = self.assembler.assemble(&output.class)?;
                let helpers = output
                    .synthetic
                    .iter()
                    .map(|class| -> Result<_, Error> {
                        Ok((class.name.clone(), self.assembler.assemble(class)?))
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                Ok((output, bytes, helpers))
            }) {
                Ok((output, bytes, helpers)) => {
                    for (name, bytes) in helpers {
                        run.classes.insert(
                            name.as_str().to_owned(),
                            PatchedClass {
                                bytes,
                                mode: ResolvedMode::ClassLoaderTime,
                                synthetic: true,
                            },
                        );
                    }
                    run.classes.insert(
                        target.as_str().to_owned(),
                        PatchedClass {
                            bytes,
                            mode: schedule.mode,
                            synthetic: false,
                        },
                    );

                    for post in &self.post_processors {
                        for method in &output.methods {
                            post.method_patched(target, method);
                        }
                        for field in &output.fields {
                            post.field_added(target, field);
                        }
                        post.class_patched(target, schedule.mode);
                    }
                }
                Err(err) => {
                    self.logger
                        .critical(&format!("Failed to patch {}: {}", target, err));
                    run.failures.insert(target.as_str().to_owned(), err);
                }
            }
        }

        for post in &self.post_processors {
            post.finished(&run);
        }
        run
    }

    fn patch_class(&self, target: &BinaryName, schedule: &Schedule) -> Result<ClassOutput, Error> {
        let mut output = ClassOutput {
            class: (*self.registry.resolve(target)?).clone(),
            synthetic: vec![],
            methods: vec![],
            fields: vec![],
        };
        let engine = AccessEngine {
            registry: self.registry,
            runtime: self.runtime,
            settings: &self.settings,
            logger: &*self.logger,
        };

        for Scheduled { patch, .. } in &schedule.patches {
            self.logger
                .info(&format!("Applying {} to {}", patch.name, target));
            let mapping = engine.plan(patch, schedule.mode, &mut output.class)?;
            output.fields.extend(mapping.added_fields.iter().cloned());

            if let Some(source_name) = patch.source_name()? {
                let source = self.registry.resolve(&source_name)?;
                let patcher = MethodPatcher {
                    source: &source,
                    target,
                    logger: &*self.logger,
                };

                for replacement in &patch.replacements {
                    let method = target_method(&mut output.class, &replacement.target)?;
                    patcher.replace(method, replacement)?;
                    let body = 0..method.instructions.len();
                    self.finish_method(&mapping, method, body)?;
                    output.methods.push(replacement.target.clone());
                }
                for injection in &patch.injections {
                    let method = target_method(&mut output.class, &injection.target)?;
                    let spliced = patcher.inject(method, injection)?;
                    self.finish_method(&mapping, method, spliced)?;
                    output.methods.push(injection.target.clone());
                }
            }

            // Runtime support classes are shared between patches
            for class in mapping.synthetic {
                if !output.synthetic.iter().any(|have| have.name == class.name) {
                    output.synthetic.push(class);
                }
            }
        }
        Ok(output)
    }

    fn finish_method(
        &self,
        mapping: &AccessMapping,
        method: &mut MethodNode,
        spliced: Range<usize>,
    ) -> Result<(), Error> {
        mapping.remap_range(method, spliced)?;
        if self.settings.validate_stack {
            validate_stack(method)?;
        }
        Ok(())
    }
}

fn target_method<'c>(
    class: &'c mut ClassDescriptor,
    signature: &str,
) -> Result<&'c mut MethodNode, Error> {
    let owner = class.name.clone();
    class
        .method_by_signature_mut(signature)
        .ok_or_else(|| Error::MemberNotFound(format!("{}.{}", owner, signature)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::{ClassAccessFlags, MethodAccessFlags, UnqualifiedName};
    use crate::patch::logging::test::RecordingLogger;
    use crate::patch::RuntimeSnapshot;
    use crate::registry::Archive;
    use parking_lot::Mutex;

    fn name(name: &str) -> BinaryName {
        BinaryName::from_str(name).unwrap()
    }

    fn registry() -> ClassRegistry {
        let mut archive = Archive::new();
        for class in ["app/A", "app/B"] {
            let mut class =
                ClassDescriptor::new(name(class), Some(BinaryName::OBJECT), ClassAccessFlags::PUBLIC);
            let mut method = MethodNode::new(
                MethodAccessFlags::PUBLIC,
                UnqualifiedName::from_str("run").unwrap(),
                "()V",
            );
            method.set_instructions(vec![crate::jvm::code::Insn::Simple(
                crate::jvm::code::Opcode::RETURN,
            )]);
            class.methods.push(method);
            archive.insert(class);
        }
        ClassRegistry::new().with_source(archive)
    }

    #[test]
    fn lower_priority_applies_first() {
        let registry = registry();
        let runtime = RuntimeSnapshot::detached();
        let mut patcher = Patcher::new(&registry, &runtime, Settings::new()).unwrap();

        patcher
            .register(PatchDescriptor::new("late", "app/A").with_priority(100))
            .unwrap();
        patcher
            .register(PatchDescriptor::new("early", "app/A").with_priority(50))
            .unwrap();
        patcher
            .register(PatchDescriptor::new("also-late", "app/A").with_priority(100))
            .unwrap();

        assert_eq!(
            patcher.scheduled(&name("app/A")),
            vec!["early", "late", "also-late"]
        );
    }

    #[test]
    fn auto_mode_follows_loaded_state() {
        let registry = registry();
        let mut runtime = RuntimeSnapshot::detached();
        runtime.mark_loaded(&name("app/B"));
        let mut patcher = Patcher::new(&registry, &runtime, Settings::new()).unwrap();

        assert_eq!(
            patcher.register(PatchDescriptor::new("a", "app/A")).unwrap(),
            ResolvedMode::ClassLoaderTime
        );
        assert_eq!(
            patcher.register(PatchDescriptor::new("b", "app/B")).unwrap(),
            ResolvedMode::LiveRedefine
        );
    }

    #[test]
    fn conflicting_modes() {
        let registry = registry();
        let mut runtime = RuntimeSnapshot::detached();
        runtime.mark_loaded(&name("app/B"));
        let mut patcher = Patcher::new(&registry, &runtime, Settings::new()).unwrap();

        let explicit = |target: &str, mode| PatchDescriptor::new("p", target).with_mode(mode);
        assert!(matches!(
            patcher.register(explicit("app/B", PatchMode::ClassLoaderTime)),
            Err(Error::InvalidPatchMode(_))
        ));
        assert!(matches!(
            patcher.register(explicit("app/A", PatchMode::LiveRedefine)),
            Err(Error::InvalidPatchMode(_))
        ));
        assert!(patcher
            .register(explicit("app/A", PatchMode::ClassLoaderTime))
            .is_ok());
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl PostProcessor for &Events {
        fn class_patched(&self, class: &BinaryName, mode: ResolvedMode) {
            self.0.lock().push(format!("class {} {}", class, mode));
        }

        fn finished(&self, run: &PatchRun) {
            self.0.lock().push(format!(
                "finished {} {}",
                run.classes.len(),
                run.failures.len()
            ));
        }
    }

    #[test]
    fn failures_are_isolated() {
        let registry = registry();
        let runtime = RuntimeSnapshot::detached();
        let logger = Arc::new(RecordingLogger::default());
        let events = Events::default();
        let mut patcher = Patcher::new(&registry, &runtime, Settings::new())
            .unwrap()
            .with_logger(logger.clone());
        patcher.add_post_processor(&events);

        patcher.register(PatchDescriptor::new("fine", "app/A")).unwrap();
        patcher
            .register(PatchDescriptor::new("missing", "app/Missing"))
            .unwrap();
        let run = patcher.run();

        assert!(run.classes.contains_key("app/A"));
        assert!(matches!(
            run.failures.get("app/Missing"),
            Some(Error::ClassNotFound(_))
        ));
        assert_eq!(logger.messages("critical").len(), 1);
        assert_eq!(
            *events.0.lock(),
            vec![
                String::from("class app/A CLASSLOADER_TIME"),
                String::from("finished 1 1"),
            ]
        );
    }
}
