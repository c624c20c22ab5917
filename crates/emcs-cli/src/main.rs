use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use emcs_storage::IdentityCache;
use emcs_sync::{EnrichConfig, EnrichmentPipeline, ReportFormat, ResolverSource};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "emcs-cli")]
#[command(about = "EarthMAP capability survey enrichment")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Normalize the survey, resolve new respondents and write the enriched report
    Enrich(EnrichArgs),
    /// Create an empty identity cache file
    InitCache {
        /// Path of the cache file to create
        #[arg(env = "EMCS_CACHE")]
        cache: PathBuf,
    },
}

#[derive(Debug, Args)]
struct EnrichArgs {
    /// Survey spreadsheet (.xlsx, .xls, .ods)
    #[arg(short, long, env = "EMCS_SURVEY")]
    survey: PathBuf,

    /// Identity cache JSON file
    #[arg(short, long, env = "EMCS_CACHE")]
    cache: PathBuf,

    /// Report path; defaults to augmented_survey_data_<YYYYMMDD>.<format>
    #[arg(short, long, env = "EMCS_OUTPUT")]
    output: Option<PathBuf>,

    /// Report format; inferred from the output extension when omitted
    #[arg(long, value_enum, env = "EMCS_REPORT_FORMAT")]
    format: Option<FormatArg>,

    /// Column mapping YAML overriding the bundled one
    #[arg(long, env = "EMCS_SCHEMA")]
    schema: Option<PathBuf>,

    /// Base URL of the identity-resolution service
    #[arg(long, env = "EMCS_RESOLVER_URL", conflicts_with = "resolver_fixture")]
    resolver_url: Option<String>,

    /// Answer resolver requests from a JSON fixture instead of the service
    #[arg(long, env = "EMCS_RESOLVER_FIXTURE")]
    resolver_fixture: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Xlsx,
    Parquet,
}

impl From<FormatArg> for ReportFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Xlsx => ReportFormat::Xlsx,
            FormatArg::Parquet => ReportFormat::Parquet,
        }
    }
}

impl EnrichArgs {
    fn into_config(self) -> Result<EnrichConfig> {
        let resolver = match (self.resolver_url, self.resolver_fixture) {
            (Some(base_url), _) => ResolverSource::Http { base_url },
            (None, Some(path)) => ResolverSource::Fixture { path },
            (None, None) => bail!("one of --resolver-url or --resolver-fixture is required"),
        };
        let report_format = match (self.format, &self.output) {
            (Some(format), _) => format.into(),
            (None, Some(output)) => ReportFormat::from_path(output),
            (None, None) => ReportFormat::default(),
        };
        Ok(EnrichConfig {
            survey_path: self.survey,
            cache_path: self.cache,
            output_path: self
                .output
                .unwrap_or_else(|| EnrichConfig::default_output_path_today(report_format)),
            report_format,
            schema_path: self.schema,
            resolver,
            http: EnrichConfig::http_from_env(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "emcs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enrich(args) => {
            let config = args.into_config()?;
            let summary = EnrichmentPipeline::from_config(config)?
                .run_once()
                .await
                .context("enrichment run failed")?;
            println!(
                "enrich complete: run_id={} responses={} duplicates_dropped={} resolved={} unresolved={} matched={} report={}",
                summary.run_id,
                summary.responses,
                summary.duplicates_dropped,
                summary.fetch.resolved,
                summary.fetch.unresolved.len(),
                summary.report.matched_rows,
                summary.report.path
            );
        }
        Commands::InitCache { cache } => {
            let written = IdentityCache::init(&cache)
                .await
                .with_context(|| format!("initialising cache {}", cache.display()))?;
            info!(path = %written.path.display(), "created empty identity cache");
            println!("created {}", written.path.display());
        }
    }

    Ok(())
}
