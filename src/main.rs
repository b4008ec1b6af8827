use bf_machine::cli_util::{format_bytes, print_machine_error};
use bf_machine::config::{self, Settings};
use bf_machine::{BracketMatching, EofPolicy, Machine, MachineError, StepControl};
use clap::Parser;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{info, warn, Level};

fn usage_and_exit(program: &str, code: i32) -> ! {
    eprintln!(
        r#"Usage:
  {0} [OPTIONS] <FILE>

Options:
  --input,  -i <TEXT>  Bytes consumed, in order, by `,`
  --eof <POLICY>       What `,` does once input runs out: zero (default), unchanged, fail
  --brackets <MODE>    Loop matching: nested (default) or flat (first bare bracket wins)
  --tape-length <N>    Number of tape cells (default 30000)
  --max-steps <N>      Abort after N instructions (fallback BFM_MAX_STEPS; default unlimited)
  --timeout <MS>       Wall-clock timeout in milliseconds (fallback BFM_TIMEOUT_MS; default none)
  --no-stream          Don't echo output while the program runs
  --verbose, -v        Log to stderr; repeat for more detail
  --help,   -h         Show this help

Notes:
- Exactly one program file is required.
- Characters outside of ><+-.,[] are comments and do not count as cycles.
- Settings not given as flags are read from the [machine] section of bfm.toml
  in your config directory, or from the file named by BFM_CONFIG.

Examples:
    {0} ./hello.bf
    {0} --input "abc" ./echo.bf
"#,
        program
    );
    let _ = io::stderr().flush();
    std::process::exit(code);
}

#[derive(Parser, Debug)]
#[command(name = "bfm", disable_help_flag = true)]
struct Cli {
    /// Bytes consumed, in order, by `,`
    #[arg(short = 'i', long = "input", value_name = "TEXT")]
    input: Option<String>,

    /// Exhausted-input policy: zero, unchanged, fail
    #[arg(long = "eof", value_name = "POLICY", value_parser = parse_eof_arg)]
    eof: Option<EofPolicy>,

    /// Bracket matching: nested or flat
    #[arg(long = "brackets", value_name = "MODE", value_parser = parse_brackets_arg)]
    brackets: Option<BracketMatching>,

    /// Number of tape cells
    #[arg(long = "tape-length", value_name = "N")]
    tape_length: Option<usize>,

    /// Maximum instructions before abort (fallback BFM_MAX_STEPS; default unlimited)
    #[arg(long = "max-steps", value_name = "N")]
    max_steps: Option<u64>,

    /// Wall-clock timeout in milliseconds (fallback BFM_TIMEOUT_MS; default none)
    #[arg(long = "timeout", value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Don't echo output while the program runs
    #[arg(long = "no-stream")]
    no_stream: bool,

    /// Log to stderr; repeat for more detail
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Program file(s); exactly one is accepted
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Show this help
    #[arg(short = 'h', long = "help", action = clap::ArgAction::SetTrue)]
    help: bool,
}

fn parse_eof_arg(s: &str) -> Result<EofPolicy, String> {
    config::parse_eof_policy(s)
        .ok_or_else(|| format!("expected zero, unchanged or fail, got '{s}'"))
}

fn parse_brackets_arg(s: &str) -> Result<BracketMatching, String> {
    config::parse_bracket_matching(s).ok_or_else(|| format!("expected nested or flat, got '{s}'"))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

fn run(program: &str, cli: Cli) -> i32 {
    if cli.help {
        usage_and_exit(program, 0);
    }

    if cli.files.len() != 1 {
        eprintln!("{program}: Please provide the name of exactly one program file to execute.");
        usage_and_exit(program, 2);
    }

    if cli.tape_length == Some(0) {
        eprintln!("{program}: --tape-length must be at least 1");
        usage_and_exit(program, 2);
    }

    // Resolve settings: flags -> env -> config file -> defaults
    let file_settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{program}: invalid config: {e}");
            let _ = io::stderr().flush();
            return 2;
        }
    };
    let flag_settings = Settings {
        tape_length: cli.tape_length,
        bracket_matching: cli.brackets,
        eof_policy: cli.eof,
        max_steps: cli.max_steps,
        timeout_ms: cli.timeout_ms,
    };
    let settings = flag_settings.or(Settings::from_env()).or(file_settings);

    let path = &cli.files[0];
    let code_str = match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            eprintln!("{program}: failed to read program file {}: {e}", path.display());
            let _ = io::stderr().flush();
            return 1;
        }
    };

    let mut machine = match Machine::with_options(settings.machine_options()) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{program}: {e}");
            return 2;
        }
    };
    if let Err(e) = machine.load(&code_str) {
        print_machine_error(Some(program), &code_str, &e);
        return 1;
    }
    machine.set_input(cli.input.unwrap_or_default().into_bytes());
    if !cli.no_stream {
        machine.set_output_sink(|bytes| {
            let mut out = io::stdout().lock();
            let _ = out.write_all(bytes);
            let _ = out.flush();
        });
    }

    info!(
        file = %path.display(),
        options = ?machine.options(),
        max_steps = ?settings.max_steps,
        timeout_ms = ?settings.timeout_ms,
        "loaded program"
    );

    // Execute on a worker thread with cooperative cancellation
    let cancel = Arc::new(AtomicBool::new(false));
    let ctrl_cancel = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || ctrl_cancel.store(true, Ordering::Relaxed)) {
        warn!("failed to set ctrl+c handler: {e}");
    }

    let (tx, rx) = mpsc::channel::<(Result<(), MachineError>, Machine)>();
    let ctrl = StepControl::new(settings.max_steps, cancel.clone());
    thread::spawn(move || {
        let res = machine.run_with_control(ctrl);
        let _ = tx.send((res, machine));
    });

    let received = match settings.timeout_ms {
        Some(ms) => rx.recv_timeout(Duration::from_millis(ms)).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => {
                cancel.store(true, Ordering::Relaxed);
                eprintln!("Execution aborted: wall-clock timeout exceeded ({ms} ms)");
            }
            mpsc::RecvTimeoutError::Disconnected => {}
        }),
        None => rx.recv().map_err(|_| ()),
    };

    let exit_code = match received {
        Ok((Ok(()), machine)) => {
            println!();
            println!("Result: {}", format_bytes(machine.output()));
            println!("Finished in {} cycles.", machine.cycle_count());
            info!(cycles = machine.cycle_count(), "run complete");
            0
        }
        Ok((Err(e @ (MachineError::StepLimitExceeded { .. } | MachineError::Canceled)), m)) => {
            println!();
            eprintln!("{e} after {} cycles", m.cycle_count());
            1
        }
        Ok((Err(other), _)) => {
            println!();
            print_machine_error(Some(program), &code_str, &other);
            1
        }
        Err(()) => {
            println!();
            1
        }
    };

    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    exit_code
}

fn main() {
    // We still pull the program name for help rendering consistency
    let program = std::env::args().next().unwrap_or_else(|| String::from("bfm"));

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = run(&program, cli);
    std::process::exit(code);
}
