use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser};
use premsabot_core::commons::{CommonsApi, CommonsClient, CommonsClientConfig};
use premsabot_core::config::load_config;
use premsabot_core::pipeline::{SessionOptions, run_session};
use premsabot_core::search::{DateRange, SearchClient};
use premsabot_core::timeparse::parse_day;

#[derive(Debug, Parser)]
#[command(
    name = "premsabot",
    version,
    about = "Uploads Generalitat de Catalunya Press Room images to Wikimedia Commons",
    group(ArgGroup::new("window").required(true).args(["date", "start"]))
)]
struct Cli {
    #[arg(
        long,
        value_name = "DD-MM-YYYY",
        conflicts_with_all = ["start", "end"],
        help = "Single publication day to ingest"
    )]
    date: Option<String>,
    #[arg(long, value_name = "DD-MM-YYYY", requires = "end")]
    start: Option<String>,
    #[arg(long, value_name = "DD-MM-YYYY", requires = "start")]
    end: Option<String>,
    #[arg(long, help = "Run everything except the destination writes")]
    debug: bool,
    #[arg(long, help = "Load the whole batch history before deciding what is new")]
    full: bool,
    #[arg(long, value_name = "PATH", default_value = "premsabot.toml")]
    config: PathBuf,
    #[arg(long, value_name = "PATH", help = "Override the state directory")]
    state_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let range = resolve_range(&cli)?;

    let mut config = load_config(&cli.config)?;
    if let Some(state_dir) = &cli.state_dir {
        config.paths.state_dir = Some(state_dir.clone());
    }
    config.validate()?;

    let mut search = SearchClient::new(&config)?;
    let mut commons = CommonsClient::new(CommonsClientConfig::from_config(&config))?;
    if !cli.debug {
        let username =
            env::var("COMMONS_BOT_USER").context("COMMONS_BOT_USER is not set")?;
        let password =
            env::var("COMMONS_BOT_PASSWORD").context("COMMONS_BOT_PASSWORD is not set")?;
        commons.login(&username, &password)?;
    }

    let options = SessionOptions {
        range,
        full_history: cli.full,
        debug: cli.debug,
    };
    let report = run_session(&config, &mut search, &mut commons, &options)?;
    println!(
        "fetched: {}, eligible: {}, uploaded: {}, rejected: {}, pending: {}, skipped: {}",
        report.fetched,
        report.eligible,
        report.uploaded,
        report.rejected,
        report.pending,
        report.skipped
    );
    Ok(())
}

fn resolve_range(cli: &Cli) -> Result<DateRange> {
    if let Some(day) = &cli.date {
        let day = parse_day(day)?;
        return Ok(DateRange {
            start: day,
            end: day,
        });
    }
    match (&cli.start, &cli.end) {
        (Some(start), Some(end)) => {
            let start = parse_day(start)?;
            let end = parse_day(end)?;
            if end < start {
                bail!("--end precedes --start");
            }
            Ok(DateRange { start, end })
        }
        _ => bail!("provide --date or both --start and --end"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn date_flag_yields_a_single_day_range() {
        let cli = Cli::try_parse_from(["premsabot", "--date", "01-05-2024"]).expect("parse");
        let range = resolve_range(&cli).expect("range");
        assert_eq!(range.start, range.end);
    }

    #[test]
    fn start_and_end_must_come_together() {
        assert!(Cli::try_parse_from(["premsabot", "--start", "01-05-2024"]).is_err());
        let cli = Cli::try_parse_from([
            "premsabot",
            "--start",
            "01-05-2024",
            "--end",
            "02-05-2024",
        ])
        .expect("parse");
        assert!(resolve_range(&cli).is_ok());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let cli = Cli::try_parse_from([
            "premsabot",
            "--start",
            "02-05-2024",
            "--end",
            "01-05-2024",
        ])
        .expect("parse");
        assert!(resolve_range(&cli).is_err());
    }

    #[test]
    fn date_conflicts_with_the_range_flags() {
        assert!(
            Cli::try_parse_from([
                "premsabot",
                "--date",
                "01-05-2024",
                "--start",
                "01-05-2024",
                "--end",
                "02-05-2024",
            ])
            .is_err()
        );
    }
}
