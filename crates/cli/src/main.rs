//! Lyra CLI
//!
//! Runs precompiled Lyra images (detected by the leading escape byte of
//! the image magic). The source compiler is a separate tool and is not
//! bundled here; pointing this binary at source text reports exactly
//! that. `RUST_LOG` controls runtime tracing output.

use std::io::Read;
use std::process;

use clap::Parser;
use lyra_runtime::{State, ValueKind};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lyra")]
#[command(version)]
#[command(about = "Run compiled Lyra images", long_about = None)]
struct Cli {
    /// Compiled image file, or "-" to read the image from stdin
    input: String,

    /// Arguments passed through to the program
    args: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => process::exit(code),
        Err(msg) => {
            eprintln!("lyra: {msg}");
            process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<i32, String> {
    let image = if cli.input == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .map_err(|e| format!("could not read stdin: {e}"))?;
        buf
    } else {
        std::fs::read(&cli.input).map_err(|e| format!("could not open {}: {e}", cli.input))?
    };

    if image.first() != Some(&0x1b) {
        return Err(format!(
            "{} is not a compiled image (this runtime does not bundle the compiler)",
            cli.input
        ));
    }

    let mut s = State::new();
    s.load(image.as_slice()).map_err(|e| e.message().to_string())?;

    // Program name plus arguments, matching what the top-level variadic
    // closure expects.
    s.set_error_recovery(true);
    s.push_string(&cli.input)
        .map_err(|e| e.message().to_string())?;
    for a in &cli.args {
        s.push_string(a).map_err(|e| e.message().to_string())?;
    }
    s.call(cli.args.len() as i32 + 1, 1)
        .map_err(|e| e.message().to_string())?;

    // Exit code contract: a Number result is the exit code, anything
    // else means 0.
    let code = if s.type_(-1) == ValueKind::Number {
        s.to_integer(-1)
    } else {
        0
    };
    s.pop(1);
    Ok(code)
}
