use std::io::Read;
use std::sync::Arc;

use crossterm::style::Stylize;
use tracing::Level;

use imgscript::cli::{self, CliArgs};
use imgscript::config::{self, Config};
use imgscript::image::basic::BasicLibrary;
use imgscript::image::ImageList;
use imgscript::script::parallel::THREAD_STACK_SIZE;
use imgscript::script::Interpreter;
use imgscript::InterpreterError;

const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    let args = match cli::parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("imgscript: {e}");
            eprintln!("{}", cli::USAGE);
            std::process::exit(EXIT_USAGE);
        }
    };
    if args.help {
        println!("{}", cli::USAGE);
        return;
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if args.debug { Level::DEBUG } else { Level::ERROR })
        .with_target(false)
        .init();

    // Custom-command recursion uses the native stack.
    let worker = std::thread::Builder::new()
        .name("interpreter".into())
        .stack_size(THREAD_STACK_SIZE)
        .spawn(move || run(args));
    let code = match worker {
        Ok(handle) => handle.join().unwrap_or(EXIT_ERROR),
        Err(e) => {
            eprintln!("imgscript: cannot start interpreter thread: {e}");
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

fn run(args: CliArgs) -> i32 {
    let mut config = Config::from_env();
    if let Some(v) = args.verbosity {
        config.verbosity = v;
    }
    config.load_user_file = !args.no_user;
    config.command_paths.extend(args.commands);

    let mut interp = Interpreter::with_library(Arc::new(BasicLibrary::new()), &config);

    if let Some(path) = config.user_command_file().filter(|p| p.exists()) {
        match config::read_command_file(&path) {
            Ok(text) => {
                let n = interp.load_commands(&text, &path.display().to_string());
                tracing::debug!(file = %path.display(), commands = n, "loaded user commands");
            }
            Err(e) => tracing::warn!(file = %path.display(), error = %e, "cannot read user commands"),
        }
    }
    for path in &config.command_paths {
        match config::read_command_file(path) {
            Ok(text) => {
                let n = interp.load_commands(&text, &path.display().to_string());
                tracing::debug!(file = %path.display(), commands = n, "loaded commands");
            }
            Err(e) => {
                eprintln!("imgscript: {}: {e}", path.display());
                return EXIT_ERROR;
            }
        }
    }

    let script = if !args.script.is_empty() {
        cli::script_text(&args.script)
    } else if !cli::stdin_is_tty() {
        let mut text = String::new();
        if let Err(e) = std::io::stdin().read_to_string(&mut text) {
            eprintln!("imgscript: cannot read script: {e}");
            return EXIT_ERROR;
        }
        text
    } else {
        eprintln!("{}", cli::USAGE);
        return EXIT_USAGE;
    };

    let mut images = ImageList::new();
    let result = interp.run(&script, &mut images);
    for line in interp.take_output() {
        println!("{line}");
    }
    match result {
        Ok(status) => {
            tracing::debug!(?status, images = images.len(), "script finished");
            0
        }
        Err(e) => {
            report(&interp, &e);
            EXIT_ERROR
        }
    }
}

fn report(interp: &Interpreter, e: &InterpreterError) {
    let text = e.rendered();
    if cli::stderr_is_tty() {
        eprintln!("{}", text.red());
    } else {
        eprintln!("{text}");
    }
    let commands = interp.commands();
    let registry = commands.read().unwrap_or_else(|p| p.into_inner());
    if let Some(help) = registry.help(&e.command) {
        eprintln!("{help}");
    }
}
