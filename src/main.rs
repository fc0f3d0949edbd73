use bytepatch::jvm::code::disassemble;
use bytepatch::jvm::{BinaryName, Name};
use bytepatch::patch::{self, PatchDescriptor, Patcher, RuntimeSnapshot, Settings};
use bytepatch::registry::{ClassRegistry, DirectorySource};

use clap::{crate_version, Arg, ArgAction, ArgMatches, Command};
use std::fs;
use std::path::PathBuf;
use std::process;

fn main() -> Result<(), patch::Error> {
    env_logger::init();

    let classpath = Arg::new("classpath")
        .long("classpath")
        .value_name("DIRECTORY")
        .required(true)
        .action(ArgAction::Append)
        .value_parser(clap::value_parser!(PathBuf))
        .help("Directory of compiled classes (may be repeated)");

    let matches = Command::new("bytepatch")
        .version(crate_version!())
        .about("Apply declarative bytecode patches to JVM classes")
        .subcommand_required(true)
        .subcommand(
            Command::new("disasm")
                .about("Print the instructions of a method, as injection patterns see them")
                .arg(classpath.clone())
                .arg(
                    Arg::new("CLASS")
                        .help("Class name (eg. `foo/bar/Baz`)")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::new("METHOD")
                        .help("Method name, optionally with its descriptor (eg. `run()V`)")
                        .required(true)
                        .index(2),
                ),
        )
        .subcommand(
            Command::new("apply")
                .about("Apply patches and write out the patched classes")
                .arg(classpath)
                .arg(
                    Arg::new("patches")
                        .long("patches")
                        .value_name("FILE")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("JSON list of patch descriptors"),
                )
                .arg(
                    Arg::new("runtime")
                        .long("runtime")
                        .value_name("FILE")
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("JSON snapshot of the host (loaded classes and field offsets)"),
                )
                .arg(
                    Arg::new("out")
                        .long("out")
                        .value_name("DIRECTORY")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Directory the patched classes are written to"),
                )
                .arg(
                    Arg::new("unsafe-access")
                        .long("unsafe-access")
                        .value_name("CLASS_NAME")
                        .help("Class providing raw memory access by field offset"),
                )
                .arg(
                    Arg::new("proxy-store")
                        .long("proxy-store")
                        .value_name("CLASS_NAME")
                        .help("Class providing storage for fields added to live classes"),
                )
                .arg(
                    Arg::new("no-validate-stack")
                        .long("no-validate-stack")
                        .action(ArgAction::SetTrue)
                        .help("Skip stack depth checks of patched methods"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("disasm", sub)) => disasm(sub),
        Some(("apply", sub)) => apply(sub),
        _ => Ok(()),
    }
}

fn registry(matches: &ArgMatches) -> ClassRegistry {
    let mut registry = ClassRegistry::new();
    for dir in matches.get_many::<PathBuf>("classpath").into_iter().flatten() {
        registry.add_source(DirectorySource::new(dir.clone()));
    }
    registry
}

fn class_name(name: &str) -> Result<BinaryName, patch::Error> {
    BinaryName::from_str(&name.replace('.', "/")).map_err(patch::Error::InvalidPatch)
}

fn disasm(matches: &ArgMatches) -> Result<(), patch::Error> {
    let registry = registry(matches);
    let class = registry.resolve(&class_name(
        matches.get_one::<String>("CLASS").map_or("", String::as_str),
    )?)?;
    let method = matches.get_one::<String>("METHOD").map_or("", String::as_str);

    let mut found = false;
    for candidate in &class.methods {
        if !candidate.matches_signature(method) {
            continue;
        }
        found = true;
        println!("{}{}", candidate.name, candidate.descriptor);
        for (index, line) in disassemble(&candidate.instructions).iter().enumerate() {
            println!("{:>5}: {}", index, line);
        }
    }

    if !found {
        return Err(patch::Error::MemberNotFound(format!(
            "{}.{}",
            class.name, method
        )));
    }
    Ok(())
}

fn apply(matches: &ArgMatches) -> Result<(), patch::Error> {
    let registry = registry(matches);

    let runtime = match matches.get_one::<PathBuf>("runtime") {
        Some(path) => {
            log::info!("Reading host snapshot '{}'", path.display());
            RuntimeSnapshot::from_json(&fs::read_to_string(path)?)
                .map_err(|err| patch::Error::Runtime(err.to_string()))?
        }
        None => RuntimeSnapshot::detached(),
    };

    let mut settings = Settings::new();
    if let Some(class) = matches.get_one::<String>("unsafe-access") {
        settings.unsafe_access_class = class.clone();
    }
    if let Some(class) = matches.get_one::<String>("proxy-store") {
        settings.proxy_store_class = class.clone();
    }
    settings.validate_stack = !matches.get_flag("no-validate-stack");

    let mut patcher = Patcher::new(&registry, &runtime, settings)?;
    if let Some(path) = matches.get_one::<PathBuf>("patches") {
        log::info!("Reading patches '{}'", path.display());
        let patches = PatchDescriptor::list_from_json(&fs::read_to_string(path)?)
            .map_err(|err| patch::Error::InvalidPatch(err.to_string()))?;
        for patch in patches {
            patcher.register(patch)?;
        }
    }

    let run = patcher.run();

    // Write out the results
    let out = matches
        .get_one::<PathBuf>("out")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("."));
    for (class_name, class) in &run.classes {
        let path = out.join(format!("{}.class", class_name));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        log::info!(
            "Writing '{}' ({}{})",
            path.display(),
            class.mode,
            if class.synthetic { ", generated" } else { "" }
        );
        fs::write(&path, &class.bytes)?;
    }

    for (class_name, err) in &run.failures {
        eprintln!("{}: {}", class_name, err);
    }
    if !run.failures.is_empty() {
        process::exit(1);
    }
    Ok(())
}
