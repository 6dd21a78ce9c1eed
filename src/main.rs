//! logdex - date-indexed search over rotated log files.

use anyhow::Result;
use bstr::ByteSlice;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use futures::TryStreamExt;
use logdex::{Application, ChunkHits, Config, LogdexError, SearchRequest};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

fn cli() -> Command {
    Command::new("logdex")
        .version(logdex::VERSION)
        .about("Date-indexed search over rotated log files")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file (default: ./logdex.toml, then the user config dir)"),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .short('w')
                .global(true)
                .value_parser(value_parser!(usize))
                .help("Worker pool size (default: available CPUs)"),
        )
        .subcommand(
            Command::new("reindex")
                .about("Build or update offset and date indexes")
                .arg(
                    Arg::new("index")
                        .help("Index name to reindex; all when omitted")
                        .index(1),
                )
                .arg(
                    Arg::new("dates-only")
                        .long("dates-only")
                        .action(ArgAction::SetTrue)
                        .help("Rebuild date indexes from existing offset indexes"),
                ),
        )
        .subcommand(
            Command::new("search")
                .about("Search an index, optionally within a date range")
                .arg(
                    Arg::new("terms")
                        .value_name("[SUBSTRING] INDEX")
                        .num_args(1..=2)
                        .required(true)
                        .help("Substring to search and the index to search in"),
                )
                .arg(
                    Arg::new("regex")
                        .long("regex")
                        .short('e')
                        .help("Regex pattern, used instead of the substring"),
                )
                .arg(
                    Arg::new("date-from")
                        .long("date-from")
                        .visible_alias("df")
                        .help("First date to search (YYYY-MM-DD)"),
                )
                .arg(
                    Arg::new("date-to")
                        .long("date-to")
                        .visible_alias("dt")
                        .help("Last date to search (YYYY-MM-DD)"),
                )
                .arg(
                    Arg::new("ordered")
                        .long("ordered")
                        .action(ArgAction::SetTrue)
                        .help("Print matches oldest first instead of as they are found"),
                ),
        )
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let matches = cli().get_matches();
    match run(&matches).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            let usage = err
                .downcast_ref::<LogdexError>()
                .is_some_and(LogdexError::is_usage);
            if usage {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(matches: &ArgMatches) -> Result<()> {
    let path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&path)?;
    if let Some(workers) = matches.get_one::<usize>("workers") {
        config = config.with_workers(*workers);
    }
    let app = Application::new(config)?;

    match matches.subcommand() {
        Some(("reindex", sub)) => reindex(&app, sub).await,
        Some(("search", sub)) => search(&app, sub).await,
        _ => Ok(()),
    }
}

async fn reindex(app: &Application, matches: &ArgMatches) -> Result<()> {
    let name = matches.get_one::<String>("index").map(String::as_str);
    let reports = if matches.get_flag("dates-only") {
        app.rebuild_dates(name).await?
    } else {
        app.reindex(name).await?
    };

    for report in reports {
        log::info!(
            "{}: {} built, {} up to date, {} pruned",
            report.index,
            report.built.len(),
            report.skipped.len(),
            report.pruned.len()
        );
    }
    Ok(())
}

async fn search(app: &Application, matches: &ArgMatches) -> Result<()> {
    let arg = |name: &str| matches.get_one::<String>(name).map(String::as_str);
    let (substring, index) = search_terms(matches);
    let request = SearchRequest::new(index, substring, arg("regex"))?
        .between(arg("date-from"), arg("date-to"))?
        .ordered(matches.get_flag("ordered"));

    let mut results = app.search(request).await?;
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    while let Some(output) = results.try_next().await? {
        if let ChunkHits::Matches(hits) = output.hits {
            for hit in hits {
                writeln!(out, "{}", hit.line.to_str_lossy())?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

/// A single positional names the index; with two the substring comes first
fn search_terms(matches: &ArgMatches) -> (Option<&str>, &str) {
    let terms: Vec<&str> = matches
        .get_many::<String>("terms")
        .map(|values| values.map(String::as_str).collect())
        .unwrap_or_default();
    match terms.as_slice() {
        [substring, index] => (Some(*substring), *index),
        [index] => (None, *index),
        _ => (None, ""),
    }
}
