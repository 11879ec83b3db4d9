use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::{env, process::exit};

use tracing::error;
use tracing_subscriber::EnvFilter;

use machtree::collector::{CollectorOptions, collect_deps, fixup_toplevels};
use machtree::crawler::{DependencyOptions, deps_read};
use machtree::graph::{Dependency, DependencyGraph};
use machtree::walk;

struct Opts {
    /// Disable colourised log output.
    no_color: bool,

    /// Only log warnings and errors.
    quiet: bool,

    /// Print the version and exit.
    version: bool,

    /// Recursively find dependencies.
    recursive: bool,

    /// Number of files to process concurrently.
    jobs: usize,

    /// Dump the dependency graph as JSON.
    json: bool,

    /// Library prefixes to ignore when resolving dependencies.
    ignored_prefixes: Vec<String>,

    /// Library basenames to ignore when resolving dependencies.
    ignored_files: Vec<String>,

    /// Do not ignore libraries under /System and /usr/lib.
    no_default_ignore: bool,

    /// Value for @executable_path when resolving dependencies.
    executable_path: Option<PathBuf>,

    /// Skip handling weakly loaded libraries.
    skip_weak_libs: bool,

    /// Collect dependencies into this folder.
    collect: Option<PathBuf>,

    /// Prefixes to prefer when resolving collection conflicts.
    collect_order: Vec<String>,

    /// Overwrite existing libraries in the collection folder.
    overwrite: bool,

    /// Collect and modify @executable_path/@loader_path dependencies.
    modify_special_paths: bool,

    /// Include framework libraries in the collection.
    collect_frameworks: bool,

    /// The files (or folders) to process.
    files: Vec<PathBuf>,
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let opts = parse_opts(&args);
    setup_logging(&opts);

    if opts.version {
        println!("machtree {}", env!("CARGO_PKG_VERSION"));
        exit(0);
    }
    if opts.files.is_empty() {
        eprintln!("usage: machtree [options] <file|folder>...");
        exit(1);
    }

    let dep_opts = DependencyOptions {
        executable_path: opts.executable_path.clone(),
        ignored_prefixes: ignored_prefixes(&opts),
        ignored_files: opts.ignored_files.clone(),
        recursive: opts.recursive,
        skip_weak_libs: opts.skip_weak_libs,
        jobs: opts.jobs,
    };

    let graph = match deps_read(dep_opts, &expand_file_list(&opts.files)) {
        Ok(graph) => graph,
        Err(err) => {
            error!("could not process dependencies: {err}");
            exit(1);
        }
    };

    if opts.json {
        match serde_json::to_string_pretty(&graph.to_serializable()) {
            Ok(out) => println!("{out}"),
            Err(err) => error!("could not serialise as JSON: {err}"),
        }
    } else if opts.collect.is_none() || !opts.quiet {
        print_graph(&graph);
    }

    if let Some(folder) = &opts.collect {
        let collector_opts = CollectorOptions {
            folder: folder.clone(),
            preferred_order: opts.collect_order.clone(),
            overwrite: opts.overwrite,
            modify_special_paths: opts.modify_special_paths,
            collect_frameworks: opts.collect_frameworks,
            jobs: opts.jobs,
        };
        if let Err(err) = collect_deps(&graph, &collector_opts) {
            error!("could not collect dependencies: {err}");
            exit(1);
        }
        if let Err(err) = fixup_toplevels(&graph, &collector_opts) {
            error!("could not fix up top-level binaries: {err}");
            exit(1);
        }
    }
}

/// Ignored prefixes are /System and /usr/lib unless disabled, plus whatever
/// the caller added.
fn ignored_prefixes(opts: &Opts) -> Vec<String> {
    let mut prefixes: Vec<String> = if opts.no_default_ignore {
        Vec::new()
    } else {
        vec!["/System".to_string(), "/usr/lib".to_string()]
    };
    for prefix in &opts.ignored_prefixes {
        if !prefixes.contains(prefix) {
            prefixes.push(prefix.clone());
        }
    }
    prefixes
}

/// Folders among the inputs are expanded to the binaries found under them.
fn expand_file_list(files: &[PathBuf]) -> Vec<PathBuf> {
    let mut ret = Vec::new();
    for file in files {
        match fs_err::metadata(file) {
            Err(err) => error!("cannot process {}: {err}", file.display()),
            Ok(meta) if meta.is_dir() => match walk::find_binaries(file) {
                Ok(found) => ret.extend(found),
                Err(err) => error!("cannot process {}: {err}", file.display()),
            },
            Ok(_) => ret.push(file.clone()),
        }
    }
    ret
}

/// Print the graph the way ldd would, expanding each shared subtree once.
fn print_graph(graph: &DependencyGraph) {
    let many = graph.top_deps.len() > 1;
    for top in &graph.top_deps {
        if many {
            println!("{}:", top.path);
        }
        let mut printed = HashSet::new();
        print_tree(top, 0, &mut printed);
    }
}

fn print_tree(dep: &Dependency, depth: usize, printed: &mut HashSet<PathBuf>) {
    for child in dep.children() {
        let indent = 4 + 2 * depth;
        match child.resolved_path() {
            Some(resolved) if resolved != Path::new(&child.path) => {
                println!(
                    "{:indent$}{} => {} ({})",
                    "",
                    child.name,
                    child.path,
                    resolved.display()
                );
            }
            _ => println!("{:indent$}{} => {}", "", child.name, child.path),
        }
        if printed.insert(child.real_path().to_path_buf()) {
            print_tree(&child, depth + 1, printed);
        }
    }
}

fn parse_opts(args: &[String]) -> Opts {
    let mut opts = Opts {
        no_color: false,
        quiet: false,
        version: false,
        recursive: false,
        jobs: 10,
        json: false,
        ignored_prefixes: Vec::new(),
        ignored_files: Vec::new(),
        no_default_ignore: false,
        executable_path: None,
        skip_weak_libs: false,
        collect: None,
        collect_order: Vec::new(),
        overwrite: false,
        modify_special_paths: false,
        collect_frameworks: false,
        files: Vec::new(),
    };

    let mut i = 1; // Skip program name
    while i < args.len() {
        let arg = args[i].as_str();
        let value = |i: &mut usize| -> String {
            if *i + 1 >= args.len() {
                eprintln!("error: {arg} requires a value");
                exit(1);
            }
            *i += 2;
            args[*i - 1].clone()
        };

        match arg {
            "-n" | "--no-color" => {
                opts.no_color = true;
                i += 1;
            }
            "-q" | "--quiet" => {
                opts.quiet = true;
                i += 1;
            }
            "-v" | "--version" => {
                opts.version = true;
                i += 1;
            }
            "-r" | "--recursive" => {
                opts.recursive = true;
                i += 1;
            }
            "-j" | "--jobs" => {
                opts.jobs = value(&mut i).parse().unwrap_or_else(|_| {
                    eprintln!("error: --jobs requires a number");
                    exit(1);
                });
            }
            "-s" | "--json" => {
                opts.json = true;
                i += 1;
            }
            "-i" | "--ignore-prefix" => {
                let prefix = value(&mut i);
                opts.ignored_prefixes.push(prefix);
            }
            "-x" | "--ignore-file" => {
                let file = value(&mut i);
                opts.ignored_files.push(file);
            }
            "-d" | "--no-default-ignore" => {
                opts.no_default_ignore = true;
                i += 1;
            }
            "-e" | "--executable-path" => {
                opts.executable_path = Some(PathBuf::from(value(&mut i)));
            }
            "--skip-weak" => {
                opts.skip_weak_libs = true;
                i += 1;
            }
            "-c" | "--collect" => {
                opts.collect = Some(PathBuf::from(value(&mut i)));
            }
            "-l" | "--collect-order" => {
                let prefix = value(&mut i);
                opts.collect_order.push(prefix);
            }
            "-w" | "--overwrite" => {
                opts.overwrite = true;
                i += 1;
            }
            "-m" | "--modify-special-paths" => {
                opts.modify_special_paths = true;
                i += 1;
            }
            "-f" | "--collect-frameworks" => {
                opts.collect_frameworks = true;
                i += 1;
            }
            _ if arg.starts_with('-') => {
                eprintln!("error: unknown option {arg}");
                exit(1);
            }
            _ => {
                opts.files.push(PathBuf::from(arg));
                i += 1;
            }
        }
    }
    opts
}

fn setup_logging(opts: &Opts) {
    let default = if opts.quiet { "warn" } else { "machtree=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!opts.no_color)
        .with_writer(std::io::stderr)
        .init();
}
