use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use welltrack_app::{Coordinator, CoordinatorSettings, SessionStart, SessionView, WorkerSettings};
use welltrack_core::{CacheManager, ParameterFile, ViewFilters};

#[tokio::main]
async fn main() -> Result<()> {
    let config = welltrack_config::load_from_env()?;
    init_file_logging(&config.log_path())?;
    let cli = parse_cli_flags()?;

    let cache = config.cache_runtime();
    let parameter_file = ParameterFile::new(config.parameter_file_path());
    let global_parameters = parameter_file.load()?;
    let coordinator = Coordinator::spawn(CoordinatorSettings {
        worker: WorkerSettings::from_runtime(&config.worker_runtime()),
        cache: CacheManager::with_staleness(cache.directory, cache.staleness),
        parameter_file: Some(parameter_file),
        global_parameters,
    });

    coordinator
        .set_filters(ViewFilters {
            hide_warning: cli.hide_warning,
            hide_buffer_zone: cli.hide_buffer_zone,
            ..ViewFilters::default()
        })
        .await?;

    let outcome = match coordinator.open_session(&cli.input, cli.refresh).await? {
        SessionStart::Hydrated { items } => {
            tracing::info!(items, "using cached results");
            Ok(())
        }
        SessionStart::Launched(completion) => completion.wait().await,
    };

    coordinator.flush_cache().await?;
    print_table(&coordinator.current_view());
    coordinator.shutdown().await?;

    outcome.map_err(|error| anyhow!("analysis of '{}' failed: {error}", cli.input.display()))
}

fn init_file_logging(log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|error| {
                anyhow!(
                    "failed to create welltrack log directory '{}': {error}",
                    parent.display()
                )
            })?;
        }
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|error| {
            anyhow!(
                "failed to open welltrack log file '{}': {error}",
                log_path.display()
            )
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .init();

    Ok(())
}

#[derive(Debug)]
struct CliFlags {
    input: PathBuf,
    refresh: bool,
    hide_warning: bool,
    hide_buffer_zone: bool,
}

fn parse_cli_flags() -> Result<CliFlags> {
    parse_cli_args(std::env::args().skip(1))
}

fn parse_cli_args(args: impl IntoIterator<Item = String>) -> Result<CliFlags> {
    let mut input = None;
    let mut refresh = false;
    let mut hide_warning = false;
    let mut hide_buffer_zone = false;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--input" => {
                let value = args.next().ok_or_else(|| {
                    anyhow!("Missing value after --input. Use --input <directory>.")
                })?;
                if value.trim().is_empty() {
                    return Err(anyhow!("Flag '--input' requires a non-empty value."));
                }
                input = Some(PathBuf::from(value));
            }
            "--refresh" => refresh = true,
            "--hide-warning" => hide_warning = true,
            "--hide-buffer-zone" => hide_buffer_zone = true,
            "--help" | "-h" => {
                print_cli_help();
                std::process::exit(0);
            }
            value if value.starts_with("--") => {
                return Err(anyhow!(
                    "Unknown flag '{value}'. Run with --help for valid flags."
                ));
            }
            unknown => {
                return Err(anyhow!(
                    "Unexpected argument '{unknown}'. Run with --help for valid flags."
                ));
            }
        }
    }

    let input = input.ok_or_else(|| anyhow!("Missing --input <directory>. Run with --help."))?;
    Ok(CliFlags {
        input,
        refresh,
        hide_warning,
        hide_buffer_zone,
    })
}

fn print_cli_help() {
    println!("Usage: welltrack --input <directory> [--refresh] [--hide-warning] [--hide-buffer-zone]");
    println!();
    println!("  --input <directory>   Input location to analyze");
    println!("  --refresh             Ignore any cached results and rerun the worker");
    println!("  --hide-warning        Leave warning items out of the table");
    println!("  --hide-buffer-zone    Leave buffer zone items out of the table");
    println!("  --help                Show this help message");
}

fn print_table(view: &SessionView) {
    println!(
        "{:<8} {:<24} {:>8} {:<12} {}",
        "ID", "NAME", "COUNT", "STATUS", "OVERRIDDEN"
    );
    for record in &view.view.rows {
        println!(
            "{:<8} {:<24} {:>8} {:<12} {}",
            record.id.as_str(),
            record.display_name,
            record.measurement_count,
            record.status.label(),
            if record.is_overridden { "yes" } else { "" }
        );
    }
    if let Some(expected) = view.progress.expected {
        println!();
        println!("{} of {expected} items processed", view.progress.completed);
    }
}

#[cfg(test)]
mod tests {
    use super::parse_cli_args;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    #[test]
    fn parses_input_and_switches() {
        let flags = parse_cli_args(args(&["--input", "/data/plate", "--refresh", "--hide-warning"]))
            .expect("parse flags");

        assert_eq!(flags.input, std::path::PathBuf::from("/data/plate"));
        assert!(flags.refresh);
        assert!(flags.hide_warning);
        assert!(!flags.hide_buffer_zone);
    }

    #[test]
    fn input_is_required() {
        let error = parse_cli_args(args(&["--refresh"])).expect_err("missing input");
        assert!(error.to_string().contains("--input"));
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let error =
            parse_cli_args(args(&["--input", "x", "--verbose"])).expect_err("unknown flag");
        assert!(error.to_string().contains("Unknown flag '--verbose'"));
    }
}
