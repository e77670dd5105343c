//! JSON:API Graph CLI
//!
//! Command-line interface for compiling queries and rendering documents
//! against a declared registry.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;

use jsonapi_graph::{
    compile, decode, encode, load_records, load_registry_auto, memory_providers, EngineOptions,
    Endpoint, ErrorDocument, JsonApi, Operation, RawParams, Request, Response,
};

#[derive(Parser)]
#[command(name = "jsonapi-graph")]
#[command(about = "Compile JSON:API queries and render compound documents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a bracket-noted query string into JSON
    Decode {
        /// Query string, e.g. 'name[op]=eq&name[value]=Ann'
        query: String,

        /// Pretty-print JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Encode a JSON object as a bracket-noted query string
    Encode {
        /// JSON object to encode
        json: String,
    },

    /// Compile query parameters for one resource type
    Compile {
        /// Registry source: file path or URL (http:// or https://)
        #[arg(long)]
        registry: String,

        /// Resource type the query targets
        #[arg(long = "type", short)]
        type_name: String,

        /// Endpoint whose parameter whitelist applies
        #[arg(long, value_enum, default_value_t = EndpointArg::Collection)]
        endpoint: EndpointArg,

        /// Raw query string
        #[arg(default_value = "")]
        query: String,

        /// Pretty-print JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Serve one request from record fixtures and print the document
    Render {
        /// Registry source: file path or URL (http:// or https://)
        #[arg(long)]
        registry: String,

        /// Record fixtures: {"type": [records], ...}
        #[arg(long)]
        records: PathBuf,

        /// Resource type of the request
        #[arg(long = "type", short)]
        type_name: String,

        /// Record id (single, relationship and related requests)
        #[arg(long)]
        id: Option<String>,

        /// Relationship name (related request, or linkage with --linkage)
        #[arg(long, requires = "id")]
        relationship: Option<String>,

        /// Render relationship linkage instead of related records
        #[arg(long, requires = "relationship")]
        linkage: bool,

        /// Raw query string
        #[arg(default_value = "")]
        query: String,

        /// Prefix for generated links
        #[arg(long, default_value = "")]
        base_url: String,

        /// Request deadline in milliseconds
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,

        /// Output file (stdout if not specified)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Pretty-print JSON output
        #[arg(long)]
        pretty: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum EndpointArg {
    Collection,
    Single,
    Related,
}

impl From<EndpointArg> for Endpoint {
    fn from(arg: EndpointArg) -> Self {
        match arg {
            EndpointArg::Collection => Endpoint::Collection,
            EndpointArg::Single => Endpoint::Single,
            EndpointArg::Related => Endpoint::Related,
        }
    }
}

struct RenderArgs {
    registry: String,
    records: PathBuf,
    type_name: String,
    id: Option<String>,
    relationship: Option<String>,
    linkage: bool,
    query: String,
    base_url: String,
    timeout_ms: u64,
    output: Option<PathBuf>,
    pretty: bool,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Decode { query, pretty } => run_decode(&query, pretty),
        Commands::Encode { json } => run_encode(&json),
        Commands::Compile {
            registry,
            type_name,
            endpoint,
            query,
            pretty,
        } => run_compile(&registry, &type_name, endpoint.into(), &query, pretty),
        Commands::Render {
            registry,
            records,
            type_name,
            id,
            relationship,
            linkage,
            query,
            base_url,
            timeout_ms,
            output,
            pretty,
        } => run_render(RenderArgs {
            registry,
            records,
            type_name,
            id,
            relationship,
            linkage,
            query,
            base_url,
            timeout_ms,
            output,
            pretty,
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

/// Logs go to stderr; `RUST_LOG` overrides the default `warn` level.
fn init_tracing() {
    use tracing_subscriber::prelude::*;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_decode(query: &str, pretty: bool) -> Result<(), u8> {
    emit(&decode(query), pretty, None)
}

fn run_encode(json: &str) -> Result<(), u8> {
    let value: Value = serde_json::from_str(json).map_err(|e| {
        eprintln!("Error: invalid JSON: {}", e);
        2u8
    })?;
    let Value::Object(map) = value else {
        eprintln!("Error: expected a JSON object");
        return Err(2);
    };
    println!("{}", encode(&map));
    Ok(())
}

fn run_compile(
    registry_source: &str,
    type_name: &str,
    endpoint: Endpoint,
    query: &str,
    pretty: bool,
) -> Result<(), u8> {
    let registry = load_registry_auto(registry_source).map_err(|e| {
        eprintln!("Error: {}", e);
        e.exit_code() as u8
    })?;

    if registry.get(type_name).is_none() {
        eprintln!("Error: unknown resource type '{}'", type_name);
        return Err(2);
    }

    match compile(&registry, type_name, endpoint, &RawParams::parse(query)) {
        Ok(args) => emit(&args, pretty, None),
        Err(err) => {
            emit(&ErrorDocument::from(&err), pretty, None)?;
            Err(err.exit_code() as u8)
        }
    }
}

fn run_render(args: RenderArgs) -> Result<(), u8> {
    let RenderArgs {
        registry: registry_source,
        records: records_path,
        type_name,
        id,
        relationship,
        linkage,
        query,
        base_url,
        timeout_ms,
        output,
        pretty,
    } = args;

    let registry = load_registry_auto(&registry_source).map_err(|e| {
        eprintln!("Error loading registry: {}", e);
        e.exit_code() as u8
    })?;
    if registry.get(&type_name).is_none() {
        eprintln!("Error: unknown resource type '{}'", type_name);
        return Err(2);
    }

    let providers = load_records(&records_path)
        .and_then(|records| memory_providers(&registry, records))
        .map_err(|e| {
            eprintln!("Error loading records: {}", e);
            e.exit_code() as u8
        })?;

    let operation = match (id, relationship) {
        (None, _) => Operation::Collection { type_name },
        (Some(id), None) => Operation::Single { type_name, id },
        (Some(id), Some(relationship)) if linkage => Operation::Relationship {
            type_name,
            id,
            relationship,
        },
        (Some(id), Some(relationship)) => Operation::Related {
            type_name,
            id,
            relationship,
        },
    };

    let options = EngineOptions::default()
        .with_base_url(base_url)
        .with_timeout(Duration::from_millis(timeout_ms));
    let api = JsonApi::new(Arc::new(registry), providers).with_options(options);
    let request = Request::new(operation, query);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| {
            eprintln!("Error starting runtime: {}", e);
            2u8
        })?;
    let response = runtime.block_on(api.handle(&request));

    emit(&response, pretty, output.as_ref())?;
    match response {
        Response::Document(_) => Ok(()),
        Response::Error(doc) if doc.status() >= 500 => Err(2),
        Response::Error(_) => Err(1),
    }
}

fn emit<T: Serialize>(value: &T, pretty: bool, output: Option<&PathBuf>) -> Result<(), u8> {
    let json_output = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .map_err(|e| {
        eprintln!("Error serializing output: {}", e);
        2u8
    })?;

    match output {
        Some(path) => {
            std::fs::write(path, &json_output).map_err(|e| {
                eprintln!("Error writing to {}: {}", path.display(), e);
                3u8
            })?;
        }
        None => {
            println!("{}", json_output);
        }
    }

    Ok(())
}
