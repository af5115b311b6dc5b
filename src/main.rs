use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::{fs, process};

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cinder::frontend::lexer::Lexer;
use cinder::frontend::token_dumper::TokenDumper;
use cinder::runtime::interpreter::parse;
use cinder::{Config, Interpreter, Value};

#[derive(Parser, Debug)]
#[command(name = "cinder")]
#[command(about = "Cinder - a small scripting language on a bytecode VM")]
struct Cli {
    /// Script to run (.cin). Starts a REPL on stdin when omitted.
    file: Option<PathBuf>,

    /// Print the token stream and exit
    #[arg(long)]
    tokens: bool,

    /// Disable colors in token output
    #[arg(long)]
    no_color: bool,

    /// Show token source text instead of debug values
    #[arg(long)]
    pretty: bool,

    /// Print the parsed AST and exit
    #[arg(long)]
    ast: bool,

    /// Print the bytecode of each chunk before running it
    #[arg(long)]
    dis: bool,

    /// JSON settings file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path).unwrap_or_else(|e| {
            eprintln!("{}", e);
            process::exit(1);
        }),
        None => Config::default(),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    match &cli.file {
        Some(path) => {
            ensure_extension(path);
            let source = fs::read_to_string(path).unwrap_or_else(|e| {
                eprintln!("Failed to read '{}': {}", path.display(), e);
                process::exit(1);
            });
            if cli.tokens {
                dump_tokens(&source, cli.no_color, cli.pretty);
            } else {
                run_file(&source, &cli, config);
            }
        }
        None => repl(&cli, config),
    }
}

fn ensure_extension(path: &Path) {
    if path.extension().and_then(|e| e.to_str()) != Some("cin") {
        eprintln!("Error: expected a .cin file, got {}", path.display());
        process::exit(1);
    }
}

fn dump_tokens(source: &str, no_color: bool, pretty: bool) {
    match Lexer::new(source).tokenize() {
        Ok(tokens) => {
            let mut dumper = TokenDumper::new();
            if no_color {
                dumper = dumper.no_color();
            }
            if pretty {
                dumper = dumper.pretty();
            }
            dumper.dump(&tokens);
        }
        Err(e) => {
            eprintln!("Lexer error: {}", e);
            process::exit(1);
        }
    }
}

fn run_file(source: &str, cli: &Cli, config: Config) {
    let mut interp = Interpreter::with_config(config.vm, vec![]);
    if let Err(e) = run_chunk(&mut interp, source, cli) {
        error!("script failed");
        eprintln!("{}", e);
        process::exit(1);
    }
}

/// Evaluate one chunk, honouring `--ast` and `--dis`.
fn run_chunk(interp: &mut Interpreter, source: &str, cli: &Cli) -> Result<Value, cinder::Error> {
    if !cli.ast && !cli.dis {
        return interp.evaluate(source);
    }
    let program = parse(source)?;
    if cli.ast {
        println!("{:#?}", program);
        return Ok(Value::Nil);
    }
    let chunk = interp.compile(&program)?;
    match interp.disassemble(chunk.clone()) {
        Ok(text) => print!("{}", text),
        Err(e) => eprintln!("disassembly failed: {}", e),
    }
    interp.execute(chunk)
}

fn repl(cli: &Cli, config: Config) {
    let mut interp = Interpreter::with_config(config.vm, vec![]);
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("cinder> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("Failed to read input: {}", e);
                process::exit(1);
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        match run_chunk(&mut interp, &line, cli) {
            Ok(Value::Nil) => {}
            Ok(value) => println!("{}", value),
            Err(e) => eprintln!("{}", e),
        }
    }
    debug!("repl closed");
    println!();
}
