use clap::{Parser, Subcommand};
use regex_syntax::ast::parse::ParserBuilder;
use regex_syntax::hir::translate::TranslatorBuilder;

use cursor_regex::{Cursor, CursorOptions, Error, Regex, RegexBuilder, ScanOptions};

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

#[derive(Debug, Parser)]
#[command(name = "curex", version, about = "Backtracking pattern matching over line-buffered text")]
struct Cli {
    /// Log matcher decisions and print matcher state (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the matcher tree built for a pattern
    Tree { pattern: String },
    /// Match a pattern at the start of one or more inputs
    Match {
        pattern: String,
        #[arg(required = true)]
        inputs: Vec<String>,
        /// Also list every other answer the backtracking driver produces
        #[arg(long)]
        alternatives: bool,
    },
    /// Print every match in the given files (standard input if none)
    Grep {
        pattern: String,
        files: Vec<PathBuf>,
        /// Join a line ending in this character with the line after it
        #[arg(long)]
        continuation: Option<char>,
    },
}

fn parse_pattern(pattern: &str) -> Regex {
    let ast = ParserBuilder::new()
        .build()
        .parse(pattern)
        .unwrap_or_else(|e| {
            eprintln!("error: failed to parse pattern: {e}");
            process::exit(2);
        });
    let hir = TranslatorBuilder::new()
        .build()
        .translate(pattern, &ast)
        .unwrap_or_else(|e| {
            eprintln!("error: failed to translate pattern: {e}");
            process::exit(2);
        });
    RegexBuilder::new().build(&hir).unwrap_or_else(|e| {
        eprintln!("error: failed to compile pattern: {e}");
        process::exit(2);
    })
}

fn fail(err: Error) -> ! {
    eprintln!("error: {err}");
    process::exit(2);
}

fn run_tree(pattern: &str) {
    let regex = parse_pattern(pattern);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = regex.to_tree(&mut out).and_then(|()| out.flush()) {
        fail(e.into());
    }
}

fn run_match(pattern: &str, inputs: &[String], alternatives: bool, debug: bool) {
    let regex = parse_pattern(pattern);

    eprintln!("pattern: {pattern}");
    eprintln!("capture groups: {}", regex.group_len() - 1);
    eprintln!();

    let mut any_failed = false;
    for input in inputs {
        let mut cursor = Cursor::from_stream(input.as_bytes()).unwrap_or_else(|e| fail(e));
        let mut matcher = regex.matcher(&mut cursor);

        if debug {
            eprintln!("--- input: {:?} ---", input);
        }
        let len = matcher.try_match().unwrap_or_else(|e| fail(e));
        if debug {
            eprintln!("[after match] {:#?}", matcher);
        }

        match len {
            Some(len) => {
                println!("  \x1b[32mMATCH\x1b[0m  {:?} (length {})", input, len);
                if alternatives {
                    while let Some(len) = matcher.change_match().unwrap_or_else(|e| fail(e)) {
                        println!("         or length {}", len);
                    }
                }
            }
            None => {
                println!("  \x1b[31mNO MATCH\x1b[0m  {:?}", input);
                any_failed = true;
            }
        }
        matcher.release().unwrap_or_else(|e| fail(e));
    }

    if any_failed {
        process::exit(1);
    }
}

fn grep<R: BufRead>(
    regex: &Regex,
    mut cursor: Cursor<R>,
    out: &mut impl Write,
) -> Result<bool, Error> {
    let mut found = false;
    while let Some(m) = regex.find(&mut cursor)? {
        found = true;
        writeln!(
            out,
            "{}:{}:{}: {}",
            cursor.name(),
            m.span.start.line,
            m.span.start.column + 1,
            m.text.escape_debug()
        )?;
        // An empty match would be found again at the same place.
        if m.span.is_empty() && !cursor.advance(ScanOptions::new())? {
            break;
        }
    }
    Ok(found)
}

fn run_grep(pattern: &str, files: &[PathBuf], continuation: Option<char>) {
    let regex = parse_pattern(pattern);
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut found = false;
    if files.is_empty() {
        let options = CursorOptions {
            name: Some("<stdin>".to_string()),
            continuation,
        };
        let cursor =
            Cursor::with_options(io::stdin().lock(), options).unwrap_or_else(|e| fail(e));
        found |= grep(&regex, cursor, &mut out).unwrap_or_else(|e| fail(e));
    }
    for path in files {
        let options = CursorOptions {
            name: None,
            continuation,
        };
        let cursor = Cursor::file_with_options(path, options).unwrap_or_else(|e| fail(e));
        found |= grep(&regex, cursor, &mut out).unwrap_or_else(|e| fail(e));
    }
    if let Err(e) = out.flush() {
        fail(e.into());
    }

    if !found {
        process::exit(1);
    }
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    log::debug!("{:?}", cli.command);

    match cli.command {
        Command::Tree { pattern } => run_tree(&pattern),
        Command::Match {
            pattern,
            inputs,
            alternatives,
        } => run_match(&pattern, &inputs, alternatives, cli.debug),
        Command::Grep {
            pattern,
            files,
            continuation,
        } => run_grep(&pattern, &files, continuation),
    }
}
