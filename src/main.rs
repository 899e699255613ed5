mod config;
mod error;
mod fetcher;
mod mailbox;
mod report;
mod source;
mod utf7;

use std::env;

use anyhow::Result;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::fetcher::{
    FetcherParams, ReportFetcher, RunRecord, SummaryResult, make_summary_result,
};
use crate::mailbox::client::MailboxClient;
use crate::report::{MemoryReportStore, TracingRunLog, XmlReportParser};
use crate::source::directory::DirectorySource;
use crate::source::mailbox::MailboxSource;

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dmarcfetch=debug"));

    // Try to create a log file in the config directory
    let log_file = Config::config_dir()
        .ok()
        .map(|dir| dir.join("dmarcfetch.log"))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .ok()
        });

    if let Some(file) = log_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        // Fallback to stderr if file logging fails
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"dmarcfetch - Batch fetcher for DMARC aggregate reports

Usage: dmarcfetch [command] [config-path]

Commands:
    fetch       Pull new reports from all configured sources (default)
    status      Show the state of the configured mailboxes
    help        Show this help message

Configuration file: ~/.config/dmarcfetch/config.toml
"#
    );
}

fn load_config(path: Option<&String>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(std::path::Path::new(path)),
        None => Config::load(),
    }
}

async fn run_fetch(config: Config) -> Result<()> {
    let parser = XmlReportParser;
    let mut store = MemoryReportStore::default();
    let log = TracingRunLog;
    let mut records: Vec<RunRecord> = Vec::new();

    for mailbox in &config.mailboxes {
        let client = MailboxClient::new(mailbox.clone());
        let mut source = MailboxSource::new(client);
        let params = FetcherParams::from(&config.fetcher.mailboxes);
        let run = ReportFetcher::new(&mut source, &parser, &mut store, &log, params)
            .fetch()
            .await;
        // The client needs its cleanup pass even after a failed run: a
        // pending expunge or an open session may be left behind.
        source.store_mut().cleanup().await;
        records.extend(run);
    }

    for directory in &config.directories {
        let mut source = DirectorySource::new(directory.clone());
        let params = FetcherParams::from(&config.fetcher.directories);
        let run = ReportFetcher::new(&mut source, &parser, &mut store, &log, params)
            .fetch()
            .await;
        records.extend(run);
    }

    render_problems(&records);
    render_summary(&records);
    Ok(())
}

fn render_problems(records: &[RunRecord]) {
    for record in records {
        let mut messages: Vec<&str> = Vec::new();
        let mut item = None;
        match record {
            RunRecord::SourceError(message) => messages.push(message),
            RunRecord::Item(result) => {
                if let Some(message) = &result.post_processing {
                    messages.push(message);
                }
                if result.error_code != 0
                    && let Some(message) = &result.message
                {
                    messages.push(message);
                }
                item = Some(result);
            }
        }
        if messages.is_empty() {
            continue;
        }

        println!("Failed to load an incoming report:");
        for message in messages {
            println!("  - {message}");
        }
        if let Some(result) = item {
            if let Some(report_id) = &result.report_id {
                println!("  Report ID: {report_id}");
            }
            if result.emailed_from.is_some()
                || result.emailed_date.is_some()
                || result.mailbox.is_some()
            {
                println!("  Email message metadata:");
                println!(
                    "    - From:    {}",
                    result.emailed_from.as_deref().unwrap_or("-")
                );
                println!(
                    "    - Date:    {}",
                    result.emailed_date.as_deref().unwrap_or("-")
                );
                println!(
                    "    - Mailbox: {}",
                    result.mailbox.as_deref().unwrap_or("-")
                );
            }
        }
        println!();
    }

    // One debug block for the whole run, from the first failure that
    // recorded detail.
    let debug_info = records.iter().find_map(|record| match record {
        RunRecord::Item(result) => result
            .debug_info
            .as_deref()
            .filter(|info| !info.is_empty()),
        RunRecord::SourceError(_) => None,
    });
    if let Some(info) = debug_info {
        println!("Debug information:");
        println!("{info}");
        println!();
    }
}

fn render_summary(records: &[RunRecord]) {
    match make_summary_result(records) {
        SummaryResult::Item(item) => {
            if let Some(message) = &item.message {
                println!("{message}");
            }
        }
        SummaryResult::Summary(summary) => {
            if let Some(message) = &summary.message {
                println!("{message}");
            }
            for error in &summary.other_errors {
                println!("  - {error}");
            }
        }
    }
}

async fn run_status(config: Config) -> Result<()> {
    for mailbox in &config.mailboxes {
        let mut client = MailboxClient::new(mailbox.clone());
        match client.status().await {
            Ok(status) => println!(
                "{}: {} messages, {} unseen",
                mailbox.label(),
                status.messages,
                status.unseen
            ),
            Err(err) => println!("{}: {err}", mailbox.label()),
        }
        client.cleanup().await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some("status") => {
            setup_logging();
            let config = load_config(args.get(2))?;
            run_status(config).await
        }
        Some("fetch") => {
            setup_logging();
            let config = load_config(args.get(2))?;
            run_fetch(config).await
        }
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
        None => {
            setup_logging();
            let config = load_config(None)?;
            run_fetch(config).await
        }
    }
}
