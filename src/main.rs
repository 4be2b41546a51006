use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "page-translator",
    version,
    about = "OCR and translate scanned pages with a vision model"
)]
struct Cli {
    /// PDF or image files to process, in queue order
    files: Vec<PathBuf>,

    /// Target language (default: en)
    #[arg(short = 'l', long = "lang", default_value = "en")]
    lang: String,

    /// Provider or provider:model (e.g. gemini:gemini-2.5-pro)
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// API key (overrides environment variables)
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Zoom factor applied to layout hints
    #[arg(long = "zoom", default_value_t = 1.0)]
    zoom: f32,

    /// Print results as JSON (blocks in paint order with layout hints)
    #[arg(long = "json")]
    json: bool,

    /// Do not print progress lines to stderr
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Analysis timeout in seconds (overrides settings)
    #[arg(long = "timeout-secs")]
    timeout_secs: Option<u64>,

    /// Delay between streamed blocks in milliseconds (overrides settings)
    #[arg(long = "block-delay-ms")]
    block_delay_ms: Option<u64>,

    /// Show supported target languages and exit
    #[arg(long = "show-enabled-languages")]
    show_enabled_languages: bool,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    page_translator::logging::init(cli.verbose)?;

    if cli.show_enabled_languages {
        let registry = page_translator::languages::LanguageRegistry::load()?;
        for (code, label) in registry.codes() {
            println!("{}\t{}", code, label);
        }
        return Ok(());
    }

    let report = page_translator::run(page_translator::Config {
        files: cli.files,
        lang: cli.lang,
        model: cli.model,
        key: cli.key,
        settings_path: cli.read_settings,
        zoom: cli.zoom,
        json: cli.json,
        show_progress: !cli.quiet,
        timeout_secs: cli.timeout_secs,
        block_delay_ms: cli.block_delay_ms,
    })
    .await?;

    println!("{}", report.output);
    if report.failed > 0 {
        eprintln!("{} task(s) failed", report.failed);
        std::process::exit(1);
    }
    Ok(())
}
