//! Converts a PyTorch `.pth` checkpoint to JSON.
//!
//! ```text
//! pth2json speaker.pth --pretty
//! pth2json speaker.pth --speech-text "Hello there" --language en
//! ```

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use pth_decode::{CheckpointReader, DecoderConfig, SpeakerConditioning, SpeechRequest};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The `.pth` file to decode
    input: PathBuf,

    /// JSON decoder configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the output here instead of stdout
    #[arg(long, short)]
    out: Option<PathBuf>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,

    /// Only keep these entries (repeatable)
    #[arg(long = "key", value_name = "NAME")]
    keys: Vec<String>,

    /// Emit a speech request for this text instead of the checkpoint
    #[arg(long, value_name = "TEXT")]
    speech_text: Option<String>,

    /// Language of the speech request
    #[arg(long, default_value = "en", requires = "speech_text")]
    language: String,

    /// Ask for raw audio without a WAV header
    #[arg(long, requires = "speech_text")]
    no_wav_header: bool,
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => DecoderConfig::load(path)?,
        None => DecoderConfig::default(),
    };

    let buffer = std::fs::read(&args.input)?;
    log::info!("Read {} bytes from {}", buffer.len(), args.input.display());

    let mut checkpoint = CheckpointReader::new(config).decode(&buffer)?;
    if !args.keys.is_empty() {
        checkpoint.retain_keys(&args.keys);
    }

    let output = match args.speech_text {
        Some(text) => {
            let conditioning = SpeakerConditioning::from_checkpoint(&checkpoint)?;
            let request = SpeechRequest::new(text, conditioning)
                .with_language(args.language)
                .with_wav_header(!args.no_wav_header);
            to_json(&request, args.pretty)?
        }
        None => to_json(&checkpoint, args.pretty)?,
    };

    match &args.out {
        Some(path) => std::fs::write(path, output)?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(output.as_bytes())?;
            stdout.write_all(b"\n")?;
        }
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T, pretty: bool) -> serde_json::Result<String> {
    if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
}

fn main() -> ExitCode {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .try_init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            let mut source = err.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}
