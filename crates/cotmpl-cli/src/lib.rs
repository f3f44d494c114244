use cotmpl_core::Value;
use cotmpl_web::{Engine, EngineConfig, ErrorPolicy, parse_fragment};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq)]
enum CliCommand {
    Check {
        file: PathBuf,
        id: Option<String>,
        strict: bool,
    },
    Render {
        file: PathBuf,
        id: Option<String>,
        data: Option<String>,
        strict: bool,
        flush: bool,
    },
    Bundle {
        file: PathBuf,
    },
}

pub fn run_from_env() -> Result<(), String> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let verbose = take_flag(&mut args, "--verbose");
    init_tracing(verbose);
    let output = run_from_args(args)?;
    println!("{output}");
    Ok(())
}

/// Run one command and return what it would print.
pub fn run_from_args(args: Vec<String>) -> Result<String, String> {
    let command = parse_command(args)?;
    debug!(?command, "parsed command");

    match command {
        CliCommand::Check { file, id, strict } => run_check(&file, id, strict),
        CliCommand::Render {
            file,
            id,
            data,
            strict,
            flush,
        } => run_render(&file, id, data, strict, flush),
        CliCommand::Bundle { file } => run_bundle(&file),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    // a subscriber may already be installed when embedded
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != flag);
    args.len() != before
}

fn parse_command(args: Vec<String>) -> Result<CliCommand, String> {
    if args.is_empty() {
        return Err(help_text());
    }

    let cmd = args[0].as_str();
    match cmd {
        "check" => parse_check_or_render(args, false),
        "render" => parse_check_or_render(args, true),
        "bundle" => parse_bundle(args),
        "help" | "--help" | "-h" => Err(help_text()),
        _ => Err(format!("unknown command: {cmd}\n\n{}", help_text())),
    }
}

fn parse_check_or_render(args: Vec<String>, is_render: bool) -> Result<CliCommand, String> {
    let mut file: Option<PathBuf> = None;
    let mut id: Option<String> = None;
    let mut data: Option<String> = None;
    let mut strict = false;
    let mut flush = false;

    let mut i = 1usize;
    while i < args.len() {
        let token = &args[i];
        match token.as_str() {
            "--id" => {
                i += 1;
                id = Some(
                    args.get(i)
                        .ok_or_else(|| "--id requires a value".to_string())?
                        .to_string(),
                );
            }
            "--data" if is_render => {
                i += 1;
                data = Some(
                    args.get(i)
                        .ok_or_else(|| "--data requires a value".to_string())?
                        .to_string(),
                );
            }
            "--strict" => strict = true,
            "--flush" if is_render => flush = true,
            x if x.starts_with("--") => return Err(format!("unknown flag: {x}")),
            _ => {
                if file.is_some() {
                    return Err("only one FILE positional argument is allowed".to_string());
                }
                file = Some(PathBuf::from(token));
            }
        }
        i += 1;
    }

    let name = if is_render { "render" } else { "check" };
    let file = file.ok_or_else(|| format!("{name} requires FILE"))?;
    if is_render {
        Ok(CliCommand::Render {
            file,
            id,
            data,
            strict,
            flush,
        })
    } else {
        Ok(CliCommand::Check { file, id, strict })
    }
}

fn parse_bundle(args: Vec<String>) -> Result<CliCommand, String> {
    match args.as_slice() {
        [_, file] if !file.starts_with("--") => Ok(CliCommand::Bundle {
            file: PathBuf::from(file),
        }),
        [_] => Err("bundle requires FILE".to_string()),
        _ => Err("bundle takes exactly one FILE".to_string()),
    }
}

fn help_text() -> String {
    [
        "cotmpl CLI",
        "",
        "Commands:",
        "  cotmpl check FILE [--id ID] [--strict]",
        "  cotmpl render FILE [--id ID] [--data JSON_OR_PATH] [--strict] [--flush]",
        "  cotmpl bundle FILE",
        "",
        "Global flags:",
        "  --verbose    debug logging on stderr (RUST_LOG overrides)",
    ]
    .join("\n")
}

fn engine_for(strict: bool, debug_source: bool) -> Engine {
    let mut config = EngineConfig::default().with_env_overrides();
    if strict {
        config.policy = ErrorPolicy::Strict;
    }
    config.debug_source |= debug_source;
    Engine::new(config)
}

fn read_source(file: &Path) -> Result<String, String> {
    fs::read_to_string(file).map_err(|e| format!("failed to read {}: {e}", file.display()))
}

/// Template id for a single-template file: `--id`, else the file stem.
fn template_id(file: &Path, id: Option<String>) -> String {
    id.unwrap_or_else(|| {
        file.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("template")
            .to_string()
    })
}

fn run_check(file: &Path, id: Option<String>, strict: bool) -> Result<String, String> {
    let source = read_source(file)?;
    let id = template_id(file, id);
    let engine = engine_for(strict, true);
    engine.template(&id, &source).map_err(|e| e.to_string())?;
    let meta = engine
        .meta(&id)
        .ok_or_else(|| format!("template {id} was not registered"))?;
    info!(template = %id, instructions = meta.compiled.program().instr_count(), "compiled");
    Ok(meta.source_listing.unwrap_or_default())
}

fn run_render(
    file: &Path,
    id: Option<String>,
    data: Option<String>,
    strict: bool,
    flush: bool,
) -> Result<String, String> {
    let source = read_source(file)?;
    let id = template_id(file, id);
    let engine = engine_for(strict, false);
    let data = load_data_payload(data)?
        .map(Value::from)
        .unwrap_or_else(|| Value::object::<&str>([]));

    let render = engine.template(&id, &source).map_err(|e| e.to_string())?;
    let component = render.render(data).map_err(|e| e.to_string())?;
    if flush {
        let ran = engine.flush();
        debug!(tasks = ran, "flushed scheduler");
    }

    let markup = component
        .roots()
        .iter()
        .map(|root| root.outer_html())
        .collect::<String>();
    let css = engine.stylesheet();
    if css.is_empty() {
        Ok(markup)
    } else {
        Ok(format!("<style>{css}</style>{markup}"))
    }
}

fn run_bundle(file: &Path) -> Result<String, String> {
    let source = read_source(file)?;
    let engine = engine_for(false, false);
    let container = parse_fragment(&source);
    let ids = engine
        .add_tmpls(&container, false, &[])
        .map_err(|e| e.to_string())?;
    if ids.is_empty() {
        return Err(format!("no templates found in {}", file.display()));
    }

    let paths = engine.namespace();
    let lines: Vec<String> = ids
        .iter()
        .map(|id| {
            let path = paths
                .iter()
                .find(|(_, owner)| owner == id)
                .map(|(path, _)| path.as_str())
                .unwrap_or("-");
            format!("{id}\t{path}")
        })
        .collect();
    Ok(lines.join("\n"))
}

fn load_data_payload(data: Option<String>) -> Result<Option<serde_json::Value>, String> {
    let Some(input) = data else {
        return Ok(None);
    };

    let as_path = PathBuf::from(&input);
    if as_path.exists() {
        let content = fs::read_to_string(&as_path)
            .map_err(|e| format!("failed to read {}: {e}", as_path.display()))?;
        let parsed = serde_json::from_str::<serde_json::Value>(&content)
            .map_err(|e| format!("invalid JSON in {}: {e}", as_path.display()))?;
        return Ok(Some(parsed));
    }

    let parsed = serde_json::from_str::<serde_json::Value>(&input)
        .map_err(|e| format!("invalid --data JSON: {e}"))?;
    Ok(Some(parsed))
}
