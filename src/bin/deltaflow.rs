//! deltaflow: run ETL jobs from a `deltaflow.toml`.
//!
//! # Usage
//!
//! ```bash
//! # Show the SQL a job reads with
//! deltaflow compile orders --where "status = 'open'" --dialect postgres
//!
//! # Run jobs
//! deltaflow run orders customers --commit-size 5000
//!
//! # Check a filter expression against a job's source table
//! deltaflow explain "amount >= 10 or status is null" --job orders
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use deltaflow::config::{DatabaseConfig, EtlConfig, JobConfig};
use deltaflow::engine::{Connection, ConnectionSql, SqlxDriver, TransactionStore};
use deltaflow::prelude::*;
use deltaflow::validation::ValidatingReader;
use deltaflow::writer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "deltaflow")]
#[command(version)]
#[command(about = "Delta-aware ETL: compile, read and batch-write tables", long_about = None)]
#[command(after_help = "EXAMPLES:
    deltaflow compile orders --dialect sqlite
    deltaflow run --format json
    deltaflow count orders")]
struct Cli {
    /// Config file (default: ./deltaflow.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Source database URL
    #[arg(long, env = "DELTAFLOW_SOURCE_URL", global = true)]
    source_url: Option<String>,

    /// Target database URL
    #[arg(long, env = "DELTAFLOW_TARGET_URL", global = true)]
    target_url: Option<String>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the SQL and parameters a job reads with
    Compile {
        job: String,
        /// Filter expression replacing the job's filter
        #[arg(long = "where")]
        filter: Option<String>,
        /// Sort expression replacing the job's order
        #[arg(long)]
        order: Option<String>,
        /// Dialect to compile for (default: the source's)
        #[arg(long)]
        dialect: Option<String>,
    },
    /// Run jobs (default: all)
    Run {
        jobs: Vec<String>,
        #[arg(long)]
        commit_size: Option<usize>,
        /// Check types and nullability, sending failing rows to the reject table
        #[arg(long)]
        validate: bool,
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// Count the rows of a job's target table
    Count { job: String },
    /// Show how a filter expression parses
    Explain {
        expression: String,
        #[arg(long)]
        job: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = dispatch(&cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "deltaflow=info",
        1 => "deltaflow=debug",
        _ => "deltaflow=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: &Cli) -> Result<()> {
    let mut config = EtlConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = &cli.source_url {
        config.source.url = url.clone();
    }
    if let Some(url) = &cli.target_url {
        config.target.url = url.clone();
    }

    match &cli.command {
        Commands::Compile {
            job,
            filter,
            order,
            dialect,
        } => compile_job(&config, job, filter.as_deref(), order.as_deref(), dialect.as_deref()),
        Commands::Run {
            jobs,
            commit_size,
            validate,
            format,
        } => run_jobs(&config, jobs, *commit_size, *validate, *format).await,
        Commands::Count { job } => count_rows(&config, job).await,
        Commands::Explain { expression, job } => explain(&config, expression, job),
    }
}

fn compile_job(
    config: &EtlConfig,
    name: &str,
    filter: Option<&str>,
    order: Option<&str>,
    dialect: Option<&str>,
) -> Result<()> {
    let job = config.job(name)?;
    let mut query = job.query()?;
    if let Some(filter) = filter {
        query.filters = parse_filters(filter, &job.source)?;
    }
    if let Some(order) = order {
        query.sorts = parse_sorts(order, &job.source)?;
    }
    let dialect = match dialect {
        Some(name) => name.parse::<Dialect>()?,
        None => config.source.dialect()?,
    };

    let compiled = compile(&job.source, Some(&query), &dialect)?;
    println!("{} {}", "Dialect:".dimmed(), dialect.name.cyan());
    println!("{}", "Generated SQL:".green().bold());
    println!("{}", compiled.sql.white());

    if !compiled.params.is_empty() {
        println!();
        println!("{}", "Parameters:".cyan());
        for param in &compiled.params {
            println!(
                "  {} {} = {}",
                param.name.white(),
                format!("{:?}", param.type_code).dimmed(),
                param.value.to_string().yellow()
            );
        }
    }
    if !compiled.skipped_filters.is_empty() {
        println!();
        println!(
            "{}",
            format!(
                "⚠ {} filter(s) not supported by {} will be applied after reading",
                compiled.skipped_filters.len(),
                dialect.name
            )
            .yellow()
        );
    }
    Ok(())
}

async fn connect(name: &str, database: &DatabaseConfig) -> Result<ConnectionSql> {
    if database.url.is_empty() {
        anyhow::bail!("no {name} url; set it in the config or with --{name}-url");
    }
    let driver = SqlxDriver::connect(&database.url, database.max_connections)
        .await
        .with_context(|| format!("connecting to {name}"))?;
    Ok(ConnectionSql::new(
        name,
        Arc::new(driver),
        database.dialect()?,
        Arc::new(TransactionStore::new()),
    )
    .with_timeout(database.timeout()))
}

async fn run_jobs(
    config: &EtlConfig,
    names: &[String],
    commit_size: Option<usize>,
    validate: bool,
    format: OutputFormat,
) -> Result<()> {
    let jobs: Vec<&JobConfig> = if names.is_empty() {
        config.jobs.iter().collect()
    } else {
        names.iter().map(|n| config.job(n)).collect::<Result<_, _>>()?
    };
    if jobs.is_empty() {
        anyhow::bail!("no jobs configured");
    }

    let source = connect("source", &config.source).await?;
    let target: Arc<dyn Connection> = Arc::new(connect("target", &config.target).await?);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let mut results = Vec::new();
    for job in jobs {
        let mut options = job.writer_options(&config.writer);
        if let Some(size) = commit_size {
            options.commit_size = size.max(1);
        }
        let table = job.target_table();
        let reject_table = match &job.reject_table {
            Some(name) => Some(writer::reject_table(&table, &options.reject_table_suffix)?.renamed(name.clone())),
            None => None,
        };

        let reader = source.reader(&job.source, Some(job.query()?)).await?;
        let mut reader: Box<dyn RowReader> = if validate {
            Box::new(ValidatingReader::new(reader)?)
        } else {
            reader
        };
        let result = write_all_records(
            reader.as_mut(),
            table,
            Arc::clone(&target),
            reject_table,
            None,
            options,
            cancel.clone(),
        )
        .await;
        let stop = result.status == RunStatus::Cancelled;
        results.push((job.name.clone(), result));
        if stop {
            break;
        }
    }

    print_results(&results, format)?;
    if results.iter().any(|(_, r)| r.status != RunStatus::Finished) {
        std::process::exit(2);
    }
    Ok(())
}

fn print_results(results: &[(String, WriterResult)], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let by_job: Vec<_> = results.iter().map(|(_, r)| r).collect();
            println!("{}", serde_json::to_string_pretty(&by_job)?);
        }
        OutputFormat::Table => {
            println!(
                "{}",
                format!(
                    "{:20} {:>10} {:>10} {:>10} {:>10} {:>10}  {}",
                    "job", "read", "created", "updated", "deleted", "rejected", "status"
                )
                .white()
                .bold()
            );
            println!("{}", "─".repeat(90).dimmed());
            for (name, result) in results {
                let status = format!("{:?}", result.status);
                let status = match result.status {
                    RunStatus::Finished => status.green(),
                    RunStatus::Cancelled => status.yellow(),
                    _ => status.red(),
                };
                println!(
                    "{:20} {:>10} {:>10} {:>10} {:>10} {:>10}  {}",
                    name,
                    result.rows_read,
                    result.rows_created,
                    result.rows_updated,
                    result.rows_deleted,
                    result.rows_rejected,
                    status
                );
                if let Some(message) = &result.message {
                    println!("  {}", message.dimmed());
                }
            }
        }
    }
    Ok(())
}

async fn count_rows(config: &EtlConfig, name: &str) -> Result<()> {
    let job = config.job(name)?;
    let target = connect("target", &config.target).await?;
    let table = job.target_table();
    let count = target.row_count(&table, None, TxHandle::AUTO).await?;
    println!("{} {}", table.qualified_name().white(), count.to_string().cyan());
    Ok(())
}

fn explain(config: &EtlConfig, expression: &str, name: &str) -> Result<()> {
    let job = config.job(name)?;
    println!("{} {}", "Expression:".dimmed(), expression.yellow());
    println!();

    let filters = match parse_filters(expression, &job.source) {
        Ok(filters) => filters,
        Err(EtlError::Parse { position, message }) => {
            eprintln!("{} {}", "Parse Error:".red().bold(), message);
            eprintln!("  {}", expression);
            eprintln!("  {}{}", " ".repeat(position), "^".red());
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    println!("{}", "Filter chain:".green().bold());
    for (i, filter) in filters.iter().enumerate() {
        let left = filter
            .left_column
            .as_ref()
            .map(|c| c.name.clone())
            .unwrap_or_default();
        let right = match (&filter.right_column, &filter.right_value) {
            (Some(column), _) => format!("@{}", column.name),
            (None, Some(value)) => value.to_string(),
            (None, None) => String::new(),
        };
        let link = if i + 1 < filters.len() {
            filter.and_or.sql()
        } else {
            ""
        };
        println!(
            "  ({}) {} {:?}{} {} {}",
            i + 1,
            left.white(),
            filter.compare,
            if filter.allow_null { "?" } else { "" },
            right.yellow(),
            link.cyan()
        );
    }

    let compiled = compile(
        &job.source,
        Some(&SelectQuery {
            filters,
            ..Default::default()
        }),
        &config.source.dialect().unwrap_or_else(|_| Dialect::postgres()),
    )?;
    println!();
    println!("{}", "Generated SQL:".green().bold());
    println!("  {}", compiled.sql.white());
    Ok(())
}
