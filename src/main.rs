mod attributes;
mod audit;
mod budget;
mod config;
mod entry;
mod error;
mod exec;
mod ops;
mod parser;
mod registry;
mod resolver;
mod signal;
mod stack;
mod value;

use attributes::{AttrValue, KEY_AUDIT_TRAIL, KEY_SECTION};
use audit::AuditTrail;
use clap::Parser as ClapParser;
use config::{EngineConfig, HELP_TEXT, WELCOME_MESSAGE, WELCOME_SUBTITLE};
use entry::MacroObj;
use error::ExecError;
use exec::MacroResolver;
use parser::Parser as EngineParser;
use resolver::StaticResolver;
use rustyline::error::ReadlineError;
use rustyline::{Config as RlConfig, Editor};
use stack::ExecStack;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{error, info, warn};

/// A stack-oriented, postfix scripting engine for time-series analytics
/// platforms.
#[derive(ClapParser, Debug)]
#[command(name = "stackscript")]
#[command(version = config::VERSION)]
#[command(about = "A stack-oriented, postfix scripting engine")]
struct CliArgs {
    /// Script file to execute (optional - if not provided, starts REPL)
    #[arg(value_name = "FILE")]
    script: Option<PathBuf>,

    /// Maximum number of executed operations before aborting
    #[arg(long = "max-ops", value_name = "N")]
    max_ops: Option<u64>,

    /// Maximum macro-call recursion depth
    #[arg(long = "max-recurse", value_name = "N")]
    max_recurse: Option<u32>,

    /// Maximum visible stack depth
    #[arg(long = "max-depth", value_name = "N")]
    max_depth: Option<usize>,

    /// Maximum number of symbol-table entries
    #[arg(long = "max-symbols", value_name = "N")]
    max_symbols: Option<usize>,

    /// Start with audit mode enabled (demote a class of parse/resolution
    /// errors into in-band, observable audit entries instead of failing)
    #[arg(long = "audit")]
    audit: bool,

    /// Initial value of the `section` attribute, used in framed-error
    /// diagnostics
    #[arg(long = "section", value_name = "NAME")]
    section: Option<String>,

    /// After a script run, print the accumulated audit trail as JSON
    /// (implies --audit)
    #[arg(long = "audit-json")]
    audit_json: bool,
}

/// No macro repository is wired in by default (the fleet/library macro
/// repository is an external collaborator); `@name` therefore only ever
/// resolves through the local symbol table.
struct NoMacros;
impl MacroResolver for NoMacros {
    fn lookup(&self, _name: &str) -> Option<Rc<MacroObj>> {
        None
    }
}

fn build_config(args: &CliArgs) -> EngineConfig {
    let mut cfg = EngineConfig {
        section_name: args.section.clone(),
        audit_by_default: args.audit || args.audit_json,
        ..EngineConfig::default()
    };
    if let Some(n) = args.max_ops {
        cfg.limits.maxops = n;
    }
    if let Some(n) = args.max_recurse {
        cfg.limits.maxrecurse = n;
    }
    if let Some(n) = args.max_depth {
        cfg.limits.maxdepth = n;
    }
    if let Some(n) = args.max_symbols {
        cfg.limits.maxsymbols = n;
    }
    cfg
}

fn new_stack(cfg: &EngineConfig) -> ExecStack {
    let mut stack = ExecStack::new(cfg.limits);
    if let Some(section) = &cfg.section_name {
        let _ = stack.set_attribute(KEY_SECTION, AttrValue::Text(section.clone()));
    }
    if cfg.audit_by_default {
        let _ = stack.set_attribute(KEY_AUDIT_TRAIL, AttrValue::AuditTrail(AuditTrail::new()));
    }
    stack
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stackscript=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let cfg = build_config(&args);
    let functions = StaticResolver::new();

    if let Some(script_path) = args.script {
        info!(path = %script_path.display(), "running script");
        run_script(&script_path, &cfg, &functions, args.audit_json)?;
        return Ok(());
    }

    run_repl(&cfg, &functions)
}

fn run_script(
    path: &PathBuf,
    cfg: &EngineConfig,
    functions: &StaticResolver,
    dump_audit_json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read script file {}: {e}", path.display()))?;

    let mut stack = new_stack(cfg);
    let mut parser = EngineParser::new();
    parser.set_audit(cfg.audit_by_default);

    for line in contents.lines() {
        if let Err(err) = parser.feed_line(line, &mut stack, functions, &NoMacros) {
            report_exec_error(&err);
            return Err(format!("script aborted: {err:?}").into());
        }
    }

    println!("depth={} top={:?}", stack.depth(), stack.peek().ok());

    if dump_audit_json {
        if let Some(trail) = stack.audit_trail() {
            let json = serde_json::to_string_pretty(&trail.entries())
                .map_err(|e| format!("failed to serialize audit trail: {e}"))?;
            println!("{json}");
        }
    }

    Ok(())
}

fn run_repl(cfg: &EngineConfig, functions: &StaticResolver) -> Result<(), Box<dyn std::error::Error>> {
    let mut stack = new_stack(cfg);
    let mut parser = EngineParser::new();
    parser.set_audit(cfg.audit_by_default);

    let rl_config = RlConfig::builder().auto_add_history(true).build();
    let mut rl: Editor<(), _> =
        Editor::with_config(rl_config).map_err(|e| format!("failed to initialize REPL: {e}"))?;

    let history_file = ".stackscript_history";
    let _ = rl.load_history(history_file);

    println!("{WELCOME_MESSAGE}");
    println!("{WELCOME_SUBTITLE}");

    loop {
        let prompt = if parser.macro_depth() > 0 { "...> " } else { "ss> " };
        let readline = rl.readline(prompt);

        match readline {
            Ok(line) => {
                match line.trim() {
                    "" => continue,
                    "quit" | "exit" => {
                        println!("Goodbye!");
                        break;
                    }
                    ".help" => {
                        println!("{HELP_TEXT}");
                        continue;
                    }
                    ".depth" => {
                        println!("depth={}", stack.depth());
                        continue;
                    }
                    ".clear" => {
                        print!("\x1B[2J\x1B[H");
                        continue;
                    }
                    _ => {}
                }

                match parser.feed_line(&line, &mut stack, functions, &NoMacros) {
                    Ok(()) => {
                        if let Ok(top) = stack.peek() {
                            println!("=> {top}");
                        }
                    }
                    Err(err) => report_exec_error(&err),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                error!(%err, "readline failure");
                break;
            }
        }
    }

    let _ = rl.save_history(history_file);
    Ok(())
}

fn report_exec_error(err: &ExecError) {
    match err {
        ExecError::Engine(e) => {
            error!(error = %e.diagnostic(), "script error");
            eprintln!("Error: {}", e.diagnostic());
        }
        ExecError::Control(cf) => {
            warn!(signal = %cf, "control-flow exit at top level");
            eprintln!("Stopped: {cf}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_config_applies_cli_overrides() {
        let args = CliArgs {
            script: None,
            max_ops: Some(50),
            max_recurse: Some(4),
            max_depth: Some(8),
            max_symbols: Some(2),
            audit: true,
            section: Some("billing".into()),
            audit_json: false,
        };
        let cfg = build_config(&args);
        assert_eq!(cfg.limits.maxops, 50);
        assert_eq!(cfg.limits.maxrecurse, 4);
        assert_eq!(cfg.limits.maxdepth, 8);
        assert_eq!(cfg.limits.maxsymbols, 2);
        assert!(cfg.audit_by_default);
        assert_eq!(cfg.section_name.as_deref(), Some("billing"));
    }

    #[test]
    fn build_config_defaults_to_engine_defaults() {
        let args = CliArgs {
            script: None,
            max_ops: None,
            max_recurse: None,
            max_depth: None,
            max_symbols: None,
            audit: false,
            section: None,
            audit_json: false,
        };
        let cfg = build_config(&args);
        let defaults = EngineConfig::default();
        assert_eq!(cfg.limits.maxops, defaults.limits.maxops);
        assert!(!cfg.audit_by_default);
    }

    #[test]
    fn new_stack_applies_section_attribute() {
        let cfg = EngineConfig {
            section_name: Some("sec1".into()),
            ..EngineConfig::default()
        };
        let stack = new_stack(&cfg);
        assert_eq!(stack.section(), Some("sec1"));
    }
}
