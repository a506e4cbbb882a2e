#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ssr_harness::anchors::AnchorBank;
use ssr_harness::cache::SqliteRationaleCache;
use ssr_harness::config::Settings;
use ssr_harness::elicitation::{GatewayRationaleGenerator, RationaleGenerator};
use ssr_harness::gateway::{
    ChatGateway, Embedder, GatewayConfig, ProviderError, ProviderGateway, TracingUsageSink,
};
use ssr_harness::orchestrator::{SimulationRequest, Simulator};
use ssr_harness::persona::csv::write_personas_csv;
use ssr_harness::persona::inputs::{
    parse_filter_expression, parse_generation_expression, parse_injection_payload,
    parse_population_spec_input,
};
use ssr_harness::persona::{LlmPersonaGenerator, PersonaLibrary};
use ssr_harness::population::build_population;

#[derive(Parser)]
#[command(name = "ssr", version, about = "Synthetic consumer panel simulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation from a JSON request (LLM and embedding calls)
    Simulate {
        #[arg(long)]
        request: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Anchor bank directory
        #[arg(long)]
        anchors: Option<PathBuf>,
        /// Persona library directory
        #[arg(long)]
        library: Option<PathBuf>,
        /// Rationale cache database
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long)]
        no_cache: bool,
        /// Draws per persona (or stratified total)
        #[arg(long)]
        n: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Extra filter bucket, e.g. "include.age=25-44;share=0.4"
        #[arg(long = "filter")]
        filters: Vec<String>,
        /// Extra generation bucket, e.g. "prompt=eco parents;count=2"
        #[arg(long = "generate")]
        generations: Vec<String>,
        /// Extra injected persona (JSON, JSON file or key=value list)
        #[arg(long = "inject")]
        injections: Vec<String>,
        /// Population spec (YAML/JSON text or path)
        #[arg(long)]
        population_spec: Option<String>,
    },
    /// Build a population from a spec and write it as CSV (.csv) or JSON
    Population {
        #[arg(long)]
        spec: String,
        #[arg(long)]
        library: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// List persona groups, or the personas of one group
    Personas {
        #[arg(long)]
        library: Option<PathBuf>,
        #[arg(long)]
        group: Option<String>,
    },
    /// Validate an anchor bank and print its ratings
    Anchors {
        #[arg(long)]
        file: PathBuf,
    },
    /// Export the rationale cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune the rationale cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;
    init_tracing(&settings.log_level);

    match cli.command {
        Commands::Simulate {
            request,
            out,
            anchors,
            library,
            cache,
            no_cache,
            n,
            seed,
            filters,
            generations,
            injections,
            population_spec,
        } => {
            if let Some(dir) = anchors {
                settings.anchor_bank_path = dir;
            }
            if let Some(dir) = library {
                settings.persona_library_path = dir;
            }

            let mut req: SimulationRequest = read_json(&request)?;
            if n.is_some() {
                req.options.n = n;
            }
            if seed.is_some() {
                req.options.seed = seed;
            }
            for expr in &filters {
                req.persona_filters.push(parse_filter_expression(expr)?);
            }
            for expr in &generations {
                req.persona_generations.push(parse_generation_expression(expr)?);
            }
            for expr in &injections {
                req.persona_injections.push(parse_injection_payload(expr)?);
            }
            if let Some(raw) = population_spec {
                req.population_spec = Some(parse_population_spec_input(&raw)?);
            }

            let usage = Arc::new(TracingUsageSink);
            let gateway: Arc<dyn ChatGateway> = Arc::new(chat_gateway(&settings, usage.clone())?);
            let embedder: Arc<dyn Embedder> = Arc::new(settings.embeddings(usage)?);

            let mut generator =
                GatewayRationaleGenerator::new(Arc::clone(&gateway), settings.research_model.clone());
            if !no_cache {
                let path = cache.unwrap_or_else(|| settings.cache_path.clone());
                generator = generator.with_cache(Arc::new(SqliteRationaleCache::new(path)?));
            }
            let generators: Vec<Arc<dyn RationaleGenerator>> = vec![Arc::new(generator)];
            let persona_llm = Arc::new(LlmPersonaGenerator::new(
                gateway,
                settings.research_model.clone(),
            ));

            let simulator =
                Simulator::new(settings, embedder, generators).with_persona_generator(persona_llm);
            let response = simulator.run_simulation(&req).await?;
            write_json(&out, &response)?;
            println!(
                "mean {:.3}, top2box {:.3}, n {} across {} personas",
                response.aggregate.mean,
                response.aggregate.top2box,
                response.aggregate.sample_n,
                response.personas.len()
            );
        }
        Commands::Population { spec, library, out } => {
            let spec = parse_population_spec_input(&spec)?;
            let dir = library.unwrap_or_else(|| settings.persona_library_path.clone());
            let library = PersonaLibrary::load(dir)?;
            let llm = optional_persona_llm(&settings);
            let composition = build_population(&spec, &library, llm.as_deref()).await?;

            if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            if out.extension().and_then(|e| e.to_str()) == Some("csv") {
                write_personas_csv(BufWriter::new(File::create(&out)?), &composition.personas)?;
            } else {
                write_json(&out, &composition.personas)?;
            }
            if composition.dropped_buckets > 0 {
                eprintln!(
                    "warning: {} unspecified bucket(s) dropped (explicit shares use everything)",
                    composition.dropped_buckets
                );
            }
            println!(
                "wrote {} personas to {}",
                composition.personas.len(),
                out.display()
            );
        }
        Commands::Personas { library, group } => {
            let dir = library.unwrap_or_else(|| settings.persona_library_path.clone());
            let library = PersonaLibrary::load(dir)?;
            match group {
                Some(name) => {
                    for persona in library.list_personas(Some(&name))? {
                        println!("{}\t{:.3}\t{}", persona.name, persona.weight, persona.describe());
                    }
                }
                None => {
                    for group in library.groups() {
                        println!("{}\t{}\t{}", group.name, group.personas.len(), group.description);
                    }
                }
            }
        }
        Commands::Anchors { file } => {
            let bank = AnchorBank::load(&file)?;
            println!(
                "{} v{} ({}): {} anchor sets, ratings {:?}",
                bank.intent,
                bank.version,
                bank.locale,
                bank.anchor_sets.len(),
                bank.ratings()
            );
        }
        Commands::CacheExport { db, out } => {
            let cache = SqliteRationaleCache::new(db.unwrap_or(settings.cache_path))?;
            let rows = cache.export_jsonl(&out).await?;
            println!("exported {rows} rows to {}", out.display());
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let cache = SqliteRationaleCache::new(db.unwrap_or(settings.cache_path))?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise the configured level. Logs go to stderr.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// LLM persona generation when chat credentials are configured; heuristic
/// generation otherwise.
fn optional_persona_llm(settings: &Settings) -> Option<Arc<LlmPersonaGenerator>> {
    match chat_gateway(settings, Arc::new(TracingUsageSink)) {
        Ok(gateway) => Some(Arc::new(LlmPersonaGenerator::new(
            Arc::new(gateway),
            settings.research_model.clone(),
        ))),
        Err(err) => {
            tracing::debug!(error = %err, "chat gateway unavailable; llm generations fall back to heuristics");
            None
        }
    }
}

fn chat_gateway(
    settings: &Settings,
    usage: Arc<TracingUsageSink>,
) -> Result<ProviderGateway<TracingUsageSink>, ProviderError> {
    Ok(ProviderGateway::with_config(
        settings.openrouter_adapter()?,
        usage,
        GatewayConfig::default(),
    ))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
