//! Purpose: `bitseed` CLI entry point and command definitions.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Records, envelopes, and seeds are printed as JSON on stdout; logs go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use bitseed::api::{Envelope, Error, ErrorKind, TokenRecord, to_exit_code};
use bitseed::core::host::MAX_HEAP_BYTES;
use bitseed::core::record::cbor_to_json;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                let message = clap_error_summary(&err);
                let hint = clap_error_hint(&err);
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(message)
                        .with_hint(hint),
                    ColorMode::Auto,
                ));
            }
        },
    };

    init_tracing();
    let color_mode = cli.color;
    command_dispatch::dispatch_command(cli.command, color_mode)
        .map_err(add_io_hint)
        .map_err(add_generator_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "bitseed",
    version,
    about = "Run deterministic token generators and decode inscription envelopes",
    long_about = None,
    before_help = r#"Generators are WebAssembly modules; the same inputs always produce the same record.

Mental model:
  - `generate` runs a generator and prints the token record
  - `verify` regenerates and compares against a claimed record
  - `decode` recovers inscribed metadata from a signed transaction
"#,
    after_help = r#"EXAMPLES
  $ bitseed seed --block-hash <hash> --outpoint <txid>:0
  $ bitseed generate generator.wasm --seed 0xabc \
      --deploy-arg '{"height":{"type":"range","data":{"min":1,"max":1000}}}'
  $ bitseed decode 02000000000101...

LEARN MORE
  $ bitseed <command> --help"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Run a generator and print its token record",
        long_about = r#"Run a WebAssembly generator once and print the token record as JSON.

The module is instantiated fresh for the call. Its ABI (malloc/free or
stackAlloc/stackSave/stackRestore) is detected when it loads."#,
        after_help = r#"EXAMPLES
  $ bitseed generate gen.wasm --seed 0x01 \
      --deploy-arg '{"level":{"type":"range","data":{"min":1,"max":10}}}'
  $ bitseed generate gen.wasm --seed 0x01 --user-input alice --tick seed

NOTES
  - Deploy args keep their order; repeat --deploy-arg for each one
  - Guest log output is visible with RUST_LOG=bitseed::guest=info"#
    )]
    Generate(GenerateArgs),
    #[command(
        arg_required_else_help = true,
        about = "Regenerate a record and compare it with a claimed one",
        after_help = r#"EXAMPLES
  $ bitseed verify gen.wasm --seed 0x01 --expected record.json

NOTES
  - Exits 0 when the records match, 1 otherwise"#
    )]
    Verify {
        #[command(flatten)]
        generate: GenerateArgs,
        #[arg(
            long,
            help = "Claimed record as JSON (file path, or - for stdin)",
            value_hint = ValueHint::FilePath
        )]
        expected: String,
    },
    #[command(
        arg_required_else_help = true,
        about = "Decode the inscription envelope in a signed transaction",
        after_help = r#"EXAMPLES
  $ bitseed decode 0200000000010...
  $ bitcoin-cli getrawtransaction <txid> | bitseed decode -
  $ bitseed decode <tx-hex> --input 1

NOTES
  - Prints {"envelope": null} when the transaction carries no envelope"#
    )]
    Decode {
        #[arg(help = "Signed transaction hex (use - for stdin)")]
        tx: String,
        #[arg(long, help = "Only look at this input index")]
        input: Option<usize>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Derive a generator seed from chain data",
        after_help = r#"EXAMPLES
  $ bitseed seed --block-hash <hash> --outpoint <txid>:0
  $ bitseed seed --block-hash <hash> --inscription-id <txid>i0"#
    )]
    Seed {
        #[arg(long, help = "Block hash the mint is anchored to")]
        block_hash: String,
        #[arg(
            long,
            help = "UTXO being spent, as <txid>:<vout>",
            conflicts_with = "inscription_id",
            required_unless_present = "inscription_id"
        )]
        outpoint: Option<String>,
        #[arg(long, help = "Inscription id, as <txid>i<index>")]
        inscription_id: Option<String>,
    },
    #[command(about = "Print version info as JSON")]
    Version,
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(help = "Generator module (.wasm or .wat)", value_hint = ValueHint::FilePath)]
    wasm: PathBuf,
    #[arg(
        long = "deploy-arg",
        value_name = "JSON",
        help = "Repeatable deploy arg, e.g. {\"n\":{\"type\":\"range\",\"data\":{\"min\":1,\"max\":9}}}"
    )]
    deploy_args: Vec<String>,
    #[arg(long, help = "Seed string (see `bitseed seed`)")]
    seed: String,
    #[arg(long, default_value = "", help = "Minter-supplied input")]
    user_input: String,
    #[arg(long, default_value = "", help = "Tick to stamp on the record when the generator omits it")]
    tick: String,
    #[arg(long, value_name = "SIZE", help = "Guest memory ceiling (bytes or K/M/G, max 2G)")]
    max_memory: Option<String>,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn read_input(source: &str, what: &str) -> Result<Vec<u8>, Error> {
    if source == "-" {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to read {what} from stdin"))
                .with_source(err)
        })?;
        return Ok(buf);
    }
    read_file(Path::new(source), what)
}

fn read_file(path: &Path, what: &str) -> Result<Vec<u8>, Error> {
    std::fs::read(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(format!("failed to read {what} `{}`", path.display()))
            .with_source(err)
    })
}

fn add_io_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Io || err.hint().is_some() {
        return err;
    }
    err.with_hint("I/O error. Check the path and file permissions.")
}

fn add_generator_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Module => err.with_hint("The file is not a valid WebAssembly module."),
        ErrorKind::UnsupportedAbi => err.with_hint(
            "Generators must export memory, inscribe_generate, and malloc/free or stackAlloc/stackSave/stackRestore.",
        ),
        ErrorKind::OutOfMemory => {
            err.with_hint("The guest ran out of memory. Raise --max-memory (up to 2G).")
        }
        ErrorKind::GeneratorExecution => err.with_hint(
            "The generator trapped. Inspect guest logs with RUST_LOG=bitseed::guest=info.",
        ),
        ErrorKind::InvalidDeployArgs => err.with_hint(
            "Each deploy arg is {\"name\":{\"type\":\"range\",\"data\":{\"min\":N,\"max\":M}}}.",
        ),
        _ => err,
    }
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
    )
}

const MEMORY_SIZE_HINT: &str = "Use bytes or K/M/G up to 2G (e.g. 512M).";

/// Guest memory ceiling from `--max-memory`; anything above `MAX_HEAP_BYTES` is refused.
fn parse_memory_size(input: &str) -> Result<u64, Error> {
    let trimmed = input.trim();
    let split = trimmed
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map(|(idx, _)| idx)
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);

    let value: u64 = digits.parse().map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid memory size")
            .with_hint(MEMORY_SIZE_HINT)
            .with_source(err)
    })?;

    let multiplier = match suffix.trim() {
        "" => 1,
        "K" | "k" => 1024,
        "M" | "m" => 1024 * 1024,
        "G" | "g" => 1024 * 1024 * 1024,
        _ => {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("invalid memory size suffix")
                .with_hint(MEMORY_SIZE_HINT));
        }
    };

    match value.checked_mul(multiplier) {
        Some(bytes) if bytes <= MAX_HEAP_BYTES => Ok(bytes),
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("memory size {trimmed} is above the guest ceiling"))
            .with_hint(MEMORY_SIZE_HINT)),
    }
}

fn envelope_json(envelope: &Envelope, record: Option<&TokenRecord>) -> Value {
    let text = |bytes: &Option<String>| bytes.as_ref().map_or(Value::Null, |v| json!(v));
    let mut object = Map::new();
    object.insert("input".to_string(), json!(envelope.input));
    object.insert("witness_index".to_string(), json!(envelope.witness_index));
    object.insert(
        "protocol".to_string(),
        envelope
            .protocol
            .as_ref()
            .map_or(Value::Null, |id| json!(String::from_utf8_lossy(id))),
    );
    object.insert("content_type".to_string(), text(&envelope.content_type));
    object.insert("content_encoding".to_string(), text(&envelope.content_encoding));
    object.insert("metaprotocol".to_string(), text(&envelope.metaprotocol));
    match &envelope.body {
        Some(body) => {
            object.insert("body_len".to_string(), json!(body.len()));
            object.insert("body_hex".to_string(), json!(hex::encode(body)));
            if let Some(body_text) = envelope.body_text() {
                object.insert("body_text".to_string(), json!(body_text));
            }
        }
        None => {
            object.insert("body_len".to_string(), Value::Null);
        }
    }
    object.insert(
        "metadata".to_string(),
        envelope.metadata.as_ref().map_or(Value::Null, cbor_to_json),
    );
    object.insert(
        "record".to_string(),
        record.map_or(Value::Null, TokenRecord::to_json),
    );
    Value::Object(object)
}

fn emit_version_output(color_mode: ColorMode) {
    let is_tty = io::stdout().is_terminal();
    if is_tty {
        println!("{}", version_text(color_mode.use_color(is_tty)));
    } else {
        emit_json(json!({
            "name": "bitseed",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn version_text(use_color: bool) -> String {
    format!(
        "{} {}",
        colorize_label("bitseed", use_color, AnsiColor::Yellow),
        env!("CARGO_PKG_VERSION")
    )
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::Io => "i/o error",
        ErrorKind::Module => "invalid generator module",
        ErrorKind::UnsupportedAbi => "unsupported generator ABI",
        ErrorKind::OutOfMemory => "guest out of memory",
        ErrorKind::MemoryDecode => "unreadable guest memory",
        ErrorKind::GeneratorExecution => "generator trapped",
        ErrorKind::InvalidDeployArgs => "invalid deploy args",
        ErrorKind::InvalidGeneratorOutput => "invalid generator output",
        ErrorKind::EnvelopeDecode => "envelope decode failed",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    if let Some(raw) = err.raw() {
        inner.insert("raw_hex".to_string(), json!(hex::encode(raw)));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!(
            "{} {offset}",
            colorize_label("offset:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(raw) = err.raw() {
        lines.push(format!(
            "{} {} bytes",
            colorize_label("raw:", use_color, AnsiColor::Yellow),
            raw.len()
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);

    let Some(usage) = usage else {
        return "Try `bitseed --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "bitseed") else {
        return "Try `bitseed --help`.".to_string();
    };

    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect();

    if parts.is_empty() {
        return "Try `bitseed --help`.".to_string();
    }
    format!("Try `bitseed {} --help`.", parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, error_json, error_text, parse_memory_size, version_text};

    #[test]
    fn memory_size_accepts_bytes_and_kmg() {
        assert_eq!(parse_memory_size("42").expect("size"), 42);
        assert_eq!(parse_memory_size("1K").expect("size"), 1024);
        assert_eq!(parse_memory_size("3M").expect("size"), 3 * 1024 * 1024);
        assert_eq!(parse_memory_size("2g").expect("size"), 2 * 1024 * 1024 * 1024);
        assert_eq!(
            parse_memory_size("12Q").err().map(|err| err.kind()),
            Some(ErrorKind::Usage)
        );
        assert!(parse_memory_size("").is_err());
    }

    #[test]
    fn version_text_colors_only_when_asked() {
        let plain = version_text(false);
        assert_eq!(plain, format!("bitseed {}", env!("CARGO_PKG_VERSION")));
        let colored = version_text(true);
        assert!(colored.starts_with("\u{1b}[33mbitseed\u{1b}[0m "));
    }

    #[test]
    fn memory_size_hints_name_the_ceiling() {
        for input in ["3G", "2049M", "lots", "8T", "99999999999999999999"] {
            let err = parse_memory_size(input).err().expect("must fail");
            assert_eq!(err.kind(), ErrorKind::Usage, "{input}");
            assert_eq!(err.hint(), Some("Use bytes or K/M/G up to 2G (e.g. 512M)."), "{input}");
        }
    }

    #[test]
    fn error_json_carries_raw_bytes_and_offset() {
        let err = Error::new(ErrorKind::InvalidGeneratorOutput)
            .with_message("amount must be an integer")
            .with_offset(64)
            .with_raw(vec![0xde, 0xad]);
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "InvalidGeneratorOutput");
        assert_eq!(value["error"]["offset"], 64);
        assert_eq!(value["error"]["raw_hex"], "dead");
    }

    #[test]
    fn error_text_without_color_is_plain() {
        let err = Error::new(ErrorKind::UnsupportedAbi).with_hint("export malloc");
        let text = error_text(&err, false);
        assert!(text.starts_with("error: unsupported generator ABI"));
        assert!(text.contains("hint: export malloc"));
        assert!(!text.contains('\u{1b}'));
    }
}
