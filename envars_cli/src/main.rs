//! `envars` - manage application configuration and secrets as code.
//!
//! A thin `clap` builder-style argument parser over `envars_cli::commands`;
//! every subcommand here does nothing but translate flags into a call there
//! (§6.2).

extern crate clap;
extern crate envars_cli;
#[macro_use]
extern crate log;
extern crate loggerv;

use std::env;
use std::process;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

use envars_cli::commands;

fn main() {
    let matches = cli().get_matches();

    let verbosity = matches.occurrences_of("verbose") as u64 + if env::var("ENVARS_DEBUG").is_ok() { 1 } else { 0 };
    loggerv::Logger::new()
        .verbosity(verbosity)
        .level(true)
        .module_path(false)
        .init()
        .expect("only one logger is ever installed");

    if let Err(e) = envars_cli::init() {
        eprintln!("error: {}", e);
        process::exit(1);
    }

    if let Err(e) = run(&matches) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn cli() -> App<'static, 'static> {
    App::new("envars")
        .about("Manage application configuration and secrets as code.")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("file")
                .long("file")
                .short("f")
                .global(true)
                .takes_value(true)
                .default_value("envars.yml")
                .help("Path to the envars document"),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .global(true)
                .multiple(true)
                .help("Increase log verbosity (repeatable)"),
        )
        .subcommand(
            SubCommand::with_name("init")
                .about("Initialize a new envars document")
                .arg(Arg::with_name("app").long("app").short("a").takes_value(true).required(true))
                .arg(
                    Arg::with_name("env")
                        .long("env")
                        .short("e")
                        .takes_value(true)
                        .required(true)
                        .help("Comma-separated environment names"),
                )
                .arg(
                    Arg::with_name("loc")
                        .long("loc")
                        .short("l")
                        .takes_value(true)
                        .help("Comma-separated name:id locations"),
                )
                .arg(Arg::with_name("kms-key").long("kms-key").short("k").takes_value(true))
                .arg(Arg::with_name("force").long("force"))
                .arg(Arg::with_name("description-mandatory").long("description-mandatory")),
        )
        .subcommand(
            SubCommand::with_name("add")
                .about("Add or update a variable binding")
                .arg(Arg::with_name("assignment").index(1).help("VAR=value"))
                .arg(Arg::with_name("var-name").long("var-name").takes_value(true))
                .arg(Arg::with_name("value-from-file").long("value-from-file").takes_value(true))
                .arg(Arg::with_name("env").long("env").short("e").takes_value(true))
                .arg(Arg::with_name("loc").long("loc").short("l").takes_value(true))
                .arg(Arg::with_name("secret").long("secret").short("s").conflicts_with("no-secret"))
                .arg(Arg::with_name("no-secret").long("no-secret"))
                .arg(Arg::with_name("description").long("description").short("d").takes_value(true))
                .arg(Arg::with_name("validation").long("validation").takes_value(true)),
        )
        .subcommand(
            SubCommand::with_name("output")
                .about("Resolve and print variables for a context")
                .arg(Arg::with_name("env").long("env").short("e").takes_value(true))
                .arg(Arg::with_name("loc").long("loc").short("l").takes_value(true))
                .arg(
                    Arg::with_name("format")
                        .long("format")
                        .takes_value(true)
                        .default_value("dotenv")
                        .possible_values(&["dotenv", "yaml", "json"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("tree")
                .about("Print the whole document")
                .arg(Arg::with_name("decrypt").long("decrypt"))
                .arg(Arg::with_name("truncate").long("truncate").takes_value(true)),
        )
        .subcommand(
            SubCommand::with_name("exec")
                .about("Exec a command with resolved variables injected")
                .arg(Arg::with_name("env").long("env").short("e").takes_value(true))
                .arg(Arg::with_name("loc").long("loc").short("l").takes_value(true))
                .arg(Arg::with_name("cmd").index(1).multiple(true).last(true).required(true)),
        )
        .subcommand(
            SubCommand::with_name("set-systemd-env")
                .about("Push resolved variables to the user session manager")
                .arg(Arg::with_name("env").long("env").short("e").takes_value(true))
                .arg(Arg::with_name("loc").long("loc").short("l").takes_value(true)),
        )
        .subcommand(
            SubCommand::with_name("config")
                .about("Edit document-level configuration")
                .arg(Arg::with_name("kms-key").long("kms-key").short("k").takes_value(true))
                .arg(Arg::with_name("add-env").long("add-env").takes_value(true))
                .arg(Arg::with_name("remove-env").long("remove-env").takes_value(true))
                .arg(Arg::with_name("add-loc").long("add-loc").takes_value(true))
                .arg(Arg::with_name("remove-loc").long("remove-loc").takes_value(true))
                .arg(
                    Arg::with_name("description-mandatory")
                        .long("description-mandatory")
                        .conflicts_with("no-description-mandatory"),
                )
                .arg(Arg::with_name("no-description-mandatory").long("no-description-mandatory")),
        )
        .subcommand(
            SubCommand::with_name("rotate-kms-key")
                .about("Re-encrypt every secret under a new KMS key")
                .arg(Arg::with_name("new-kms-key").long("new-kms-key").takes_value(true).required(true))
                .arg(
                    Arg::with_name("output-file")
                        .long("output-file")
                        .takes_value(true)
                        .default_value("envars.new.yml"),
                ),
        )
        .subcommand(
            SubCommand::with_name("validate")
                .about("Check every static invariant of the document")
                .arg(Arg::with_name("ignore-default-secrets").long("ignore-default-secrets")),
        )
}

fn run(matches: &ArgMatches) -> envars_cli::Result<()> {
    let file = matches.value_of("file").unwrap_or("envars.yml");
    debug!("using document {}", file);

    match matches.subcommand() {
        ("init", Some(m)) => commands::init(
            file,
            m.value_of("app").unwrap(),
            m.value_of("env").unwrap(),
            m.value_of("loc"),
            m.value_of("kms-key"),
            m.is_present("force"),
            m.is_present("description-mandatory"),
        ),
        ("add", Some(m)) => commands::add(
            file,
            m.value_of("assignment"),
            m.value_of("var-name"),
            m.value_of("value-from-file"),
            m.value_of("env"),
            m.value_of("loc"),
            m.is_present("secret"),
            m.is_present("no-secret"),
            m.value_of("description"),
            m.value_of("validation"),
        ),
        ("output", Some(m)) => commands::output(file, m.value_of("env"), m.value_of("loc"), m.value_of("format").unwrap_or("dotenv")),
        ("tree", Some(m)) => {
            let truncate = m.value_of("truncate").map(|s| s.parse()).transpose()?;
            commands::tree(file, m.is_present("decrypt"), truncate)
        }
        ("exec", Some(m)) => {
            let cmd: Vec<String> = m.values_of("cmd").map(|v| v.map(str::to_string).collect()).unwrap_or_default();
            commands::exec(file, m.value_of("env"), m.value_of("loc"), &cmd)
        }
        ("set-systemd-env", Some(m)) => commands::set_systemd_env(file, m.value_of("env"), m.value_of("loc")),
        ("config", Some(m)) => {
            let description_mandatory = if m.is_present("description-mandatory") {
                Some(true)
            } else if m.is_present("no-description-mandatory") {
                Some(false)
            } else {
                None
            };
            commands::config(
                file,
                m.value_of("kms-key"),
                m.value_of("add-env"),
                m.value_of("remove-env"),
                m.value_of("add-loc"),
                m.value_of("remove-loc"),
                description_mandatory,
            )
        }
        ("rotate-kms-key", Some(m)) => {
            commands::rotate_kms_key(file, m.value_of("new-kms-key").unwrap(), m.value_of("output-file").unwrap_or("envars.new.yml"))
        }
        ("validate", Some(m)) => commands::validate_cmd(file, m.is_present("ignore-default-secrets")),
        _ => unreachable!("clap enforces a subcommand via SubcommandRequiredElseHelp"),
    }
}
