use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use depwatch_core::scanner::DEFAULT_SCANNER_TIMEOUT;
use depwatch_core::{default_scanners, scan_all, Report};

/// depwatch: outdated dependency audit
#[derive(Parser, Debug)]
#[command(name = "depwatch")]
#[command(about = "Audit a checkout for outdated dependencies", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan a directory and print the report the server would file
    Scan(ScanArgs),
    /// List the ecosystems that are probed
    Ecosystems,
}

#[derive(Parser, Debug)]
struct ScanArgs {
    /// Directory containing the manifests
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Per-ecosystem tool timeout in seconds
    #[arg(long, default_value_t = DEFAULT_SCANNER_TIMEOUT.as_secs())]
    timeout_secs: u64,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Markdown)]
    format: OutputFormat,

    /// Write the report to a file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Exit with status 1 when anything is outdated
    #[arg(long)]
    fail_on_outdated: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Markdown,
    Json,
}

fn render(report: &Report, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Markdown => Ok(report.render(&depwatch_core::service_version())),
        OutputFormat::Json => {
            serde_json::to_string_pretty(report).context("Failed to serialize report as JSON")
        }
    }
}

async fn scan(args: ScanArgs) -> Result<bool> {
    if !args.path.is_dir() {
        return Err(anyhow!("{} is not a directory", args.path.display()));
    }

    let scanners = default_scanners(Duration::from_secs(args.timeout_secs));
    info!(
        "Scanning {} with {} scanners",
        args.path.display(),
        scanners.len()
    );

    let outcomes = scan_all(&scanners, &args.path).await;
    let report = Report::compose(outcomes, Utc::now());
    let rendered = render(&report, args.format)?;

    match &args.output {
        Some(path) => {
            fs::write(path, &rendered)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            eprintln!("Report written to {}", path.display());
        }
        None => print!("{}", rendered),
    }

    Ok(report.is_up_to_date())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan(args) => {
            let fail_on_outdated = args.fail_on_outdated;
            let up_to_date = scan(args).await?;
            if fail_on_outdated && !up_to_date {
                std::process::exit(1);
            }
        }
        Commands::Ecosystems => {
            for scanner in default_scanners(DEFAULT_SCANNER_TIMEOUT) {
                println!("{}", scanner.ecosystem());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use depwatch_core::finding::{DependencyFinding, ScanOutcome};

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_scan_defaults() {
        let cli = Cli::try_parse_from(["depwatch", "scan"]).unwrap();
        match cli.command {
            Commands::Scan(args) => {
                assert_eq!(args.path, PathBuf::from("."));
                assert_eq!(args.timeout_secs, 300);
                assert_eq!(args.format, OutputFormat::Markdown);
                assert!(!args.fail_on_outdated);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_scan_with_options() {
        let cli = Cli::try_parse_from([
            "depwatch",
            "scan",
            "/srv/app",
            "--timeout-secs",
            "30",
            "--format",
            "json",
            "--fail-on-outdated",
        ])
        .unwrap();
        match cli.command {
            Commands::Scan(args) => {
                assert_eq!(args.path, PathBuf::from("/srv/app"));
                assert_eq!(args.timeout_secs, 30);
                assert_eq!(args.format, OutputFormat::Json);
                assert!(args.fail_on_outdated);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_json_render_keeps_findings() {
        let report = Report::compose(
            [(
                "pip".to_string(),
                ScanOutcome::Findings(vec![DependencyFinding::new(
                    "pip",
                    "requests",
                    "2.0.0",
                    None,
                    "2.32.3",
                )]),
            )],
            Utc::now(),
        );

        let json: serde_json::Value =
            serde_json::from_str(&render(&report, OutputFormat::Json).unwrap()).unwrap();
        let findings = &json["findings_by_ecosystem"]["pip"];
        assert!(findings.to_string().contains("requests"));
    }

    #[tokio::test]
    async fn test_scan_of_empty_directory_is_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("report.md");

        let up_to_date = scan(ScanArgs {
            path: dir.path().to_path_buf(),
            timeout_secs: 5,
            format: OutputFormat::Markdown,
            output: Some(output.clone()),
            fail_on_outdated: false,
        })
        .await
        .unwrap();

        assert!(up_to_date);
        let written = fs::read_to_string(output).unwrap();
        assert!(written.contains("All checked dependencies are up to date."));
    }

    #[tokio::test]
    async fn test_scan_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let err = scan(ScanArgs {
            path: missing,
            timeout_secs: 5,
            format: OutputFormat::Markdown,
            output: None,
            fail_on_outdated: false,
        })
        .await
        .unwrap_err();

        assert!(err.to_string().contains("is not a directory"));
    }
}
