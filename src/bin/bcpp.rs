use std::collections::VecDeque;
use std::convert::TryFrom;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process;

use ansi_term::{ANSIString, Colour};
use pico_args::Arguments;

use brackish::data::{CompileWarning, Location};
use brackish::{Definition, Definitions, Error, Files, PreProcessorBuilder};

const HELP: &str = concat!(
    env!("CARGO_PKG_NAME"),
    " ",
    env!("CARGO_PKG_VERSION"),
    "\n",
    env!("CARGO_PKG_DESCRIPTION"),
    "\n",
    "\n",
    "usage: bcpp [FLAGS] [OPTIONS] [<file>]

FLAGS:
        --debug-lex       If set, print all tokens found by the lexer in addition
                          to preprocessing.
    -A, --annotate        Print every token from every branch, one per line,
                          prefixed with its presence condition. Without this flag
                          only the tokens of the currently-selected configuration
                          are printed, like `cpp -E`.
    -h, --help            Prints help information
    -V, --version         Prints version information

OPTIONS:
    -o, --output <file>      The output file to use. [default: stdout]
        --max-errors <max>   The maximum number of errors to allow before giving up.
                             Use 0 to allow unlimited errors. [default: 10]
    -I, --include <dir>      Add a directory to the include search path
    -D, --define <name[=def]> Define a macro before the first line of input

ARGS:
    <file>    The file to read C source from. \"-\" means stdin (use ./- to read
              a file called '-'). Only one file at a time is currently accepted.
              [default: -]"
);

const USAGE: &str = "usage: bcpp [--help] [--version | -V] [--annotate | -A] [--debug-lex] \
                     [-I <dir>] [-D <name[=def]>] [-o <file>] [<file>]";

struct BinOpt {
    debug_lex: bool,
    annotate: bool,
    search_path: Vec<PathBuf>,
    definitions: Definitions,
    max_errors: Option<NonZeroUsize>,
    filename: PathBuf,
    output: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    #[cfg(debug_assertions)]
    color_backtrace::install();

    let opt = match parse_args() {
        Ok(opt) => opt,
        Err(err) => {
            eprintln!("bcpp: error parsing args: {}", err);
            eprintln!("{}", USAGE);
            process::exit(1);
        }
    };

    let mut buf = String::new();
    let filename = if opt.filename == PathBuf::from("-") {
        io::stdin().read_to_string(&mut buf).unwrap_or_else(|err| {
            eprintln!("Failed to read stdin: {}", err);
            process::exit(1);
        });
        PathBuf::from("<stdin>")
    } else {
        File::open(opt.filename.as_path())
            .and_then(|mut file| file.read_to_string(&mut buf))
            .unwrap_or_else(|err| {
                eprintln!("Failed to read {}: {}", opt.filename.to_string_lossy(), err);
                process::exit(1);
            });
        opt.filename.clone()
    };

    let result = if let Some(path) = &opt.output {
        let out = match File::create(path) {
            Ok(file) => file,
            Err(err) => fatal(&err, 3),
        };
        preprocess(&buf, filename, &opt, BufWriter::new(out))
    } else {
        let stdout = io::stdout();
        let out = BufWriter::new(stdout.lock());
        preprocess(&buf, filename, &opt, out)
    };

    if let Err(err) = result {
        match err {
            Error::Source(errs) => {
                // already reported inline
                if !errs.is_empty() {
                    process::exit(2);
                }
            }
            Error::IO(err) => fatal(&err, 3),
        }
    }
}

fn preprocess<W: Write>(
    buf: &str,
    filename: PathBuf,
    opt: &BinOpt,
    mut out: W,
) -> Result<(), Error> {
    let mut builder = PreProcessorBuilder::new(arcstr::ArcStr::from(buf.to_owned()))
        .filename(filename)
        .debug(opt.debug_lex);
    for dir in &opt.search_path {
        builder = builder.search_path(dir.clone());
    }
    for (name, def) in &opt.definitions {
        builder = builder.definition(*name, def.clone());
    }
    let mut cpp = builder.build();

    let mut errors = VecDeque::new();
    let mut printed = 0usize;
    loop {
        let next = match cpp.next() {
            None => break,
            Some(next) => next,
        };
        match next {
            Err(err) => errors.push_back(err),
            Ok(token) => {
                if opt.annotate {
                    if !token.is_whitespace() {
                        let cond = cpp.conditions().display(token.cond);
                        writeln!(out, "{}\t// {}", token.token, cond)?;
                    }
                } else if cpp.satisfied(token.cond) {
                    write!(out, "{}", token.token)?;
                    printed += 1;
                }
            }
        }
        if let Some(max) = opt.max_errors {
            if errors.len() >= max.get() {
                eprintln!("fatal: too many errors (--max-errors {}), stopping now", max);
                break;
            }
        }
    }
    if !opt.annotate && printed > 0 {
        writeln!(out)?;
    }
    out.flush()?;

    let warnings = cpp.warnings();
    let files = cpp.into_files();
    let (num_warnings, num_errors) = (warnings.len(), errors.len());
    handle_warnings(warnings, &files);
    for err in &errors {
        error(&err.data, err.location, &files);
    }
    print_issues(num_warnings, num_errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Source(errors))
    }
}

fn handle_warnings(warnings: VecDeque<CompileWarning>, files: &Files) {
    let tag = Colour::Yellow.bold().paint("warning");
    for warning in warnings {
        eprint!(
            "{}",
            pretty_print(tag.clone(), &warning.data, warning.location, files)
        );
    }
}

fn error<T: std::fmt::Display>(msg: T, location: Location, files: &Files) {
    eprint!(
        "{}",
        pretty_print(Colour::Red.bold().paint("error"), msg, location, files)
    );
}

#[must_use]
fn pretty_print<T: std::fmt::Display>(
    prefix: ANSIString,
    msg: T,
    location: Location,
    files: &Files,
) -> String {
    let file = location.file;
    let start = match files.location(file, location.span.start()) {
        Ok(start) => start,
        Err(_) => return format!("{}: {}\n", prefix, msg),
    };
    let buf = format!(
        "{}:{}:{} {}: {}\n",
        files.name(file).to_string_lossy(),
        start.line.number(),
        start.column.number(),
        prefix,
        msg
    );
    // avoid printing spurious carets for errors at EOF
    let end = match files.location(file, location.span.end()) {
        Ok(end) => end,
        Err(_) => return buf,
    };
    if start.line == end.line && location.span.start() != location.span.end() {
        let line = match files.line_span(file, start.line) {
            Ok(line) => line,
            Err(_) => return buf,
        };
        let source = files.source_slice(file, line).unwrap_or_default();
        format!(
            "{}{}\n{}{}\n",
            buf,
            source.trim_end_matches('\n'),
            " ".repeat(start.column.to_usize()),
            "^".repeat(std::cmp::max(1, end.column.to_usize() - start.column.to_usize())),
        )
    } else {
        buf
    }
}

fn print_issues(warnings: usize, errors: usize) {
    if warnings == 0 && errors == 0 {
        return;
    }
    let warn_msg = if warnings > 1 { "warnings" } else { "warning" };
    let err_msg = if errors > 1 { "errors" } else { "error" };
    let msg = match (warnings, errors) {
        (0, _) => format!("{} {}", errors, err_msg),
        (_, 0) => format!("{} {}", warnings, warn_msg),
        (_, _) => format!("{} {} and {} {}", warnings, warn_msg, errors, err_msg),
    };
    eprintln!("{} generated", msg);
}

fn fatal<T: std::fmt::Display>(msg: T, code: i32) -> ! {
    eprintln!("{}: {}", Colour::Black.bold().paint("fatal"), msg);
    process::exit(code);
}

fn os_str_to_path_buf(os_str: &std::ffi::OsStr) -> Result<PathBuf, bool> {
    Ok(os_str.into())
}

fn parse_args() -> Result<BinOpt, pico_args::Error> {
    let mut input = Arguments::from_env();
    if input.contains(["-h", "--help"]) {
        println!("{}", HELP);
        process::exit(1);
    }
    if input.contains(["-V", "--version"]) {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        process::exit(0);
    }
    let output = input.opt_value_from_os_str(["-o", "--output"], os_str_to_path_buf)?;
    let max_errors = input
        .opt_value_from_fn("--max-errors", |s| {
            usize::from_str_radix(s, 10).map(NonZeroUsize::new)
        })?
        .unwrap_or_else(|| Some(NonZeroUsize::new(10).unwrap()));
    let mut search_path = Vec::new();
    while let Some(include) = input.opt_value_from_os_str(["-I", "--include"], os_str_to_path_buf)?
    {
        search_path.push(include);
    }
    let mut definitions = Definitions::new();
    while let Some(define) = input.opt_value_from_str::<_, String>(["-D", "--define"])? {
        let (name, value) = match define.find('=') {
            Some(idx) => (&define[..idx], &define[idx + 1..]),
            None => (define.as_str(), "1"),
        };
        let def = Definition::try_from(value).unwrap_or_else(|err| {
            eprintln!("bcpp: cannot lex definition of {}: {}", name, err);
            process::exit(1);
        });
        definitions.insert(name.into(), def);
    }
    Ok(BinOpt {
        debug_lex: input.contains("--debug-lex"),
        annotate: input.contains(["-A", "--annotate"]),
        search_path,
        definitions,
        max_errors,
        filename: input
            .free_from_os_str(os_str_to_path_buf)?
            .unwrap_or_else(|| "-".into()),
        output,
    })
}
