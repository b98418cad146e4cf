use clap::{Parser, Subcommand};

const DEFAULT_DATA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data");
const DEFAULT_ASSETS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/assets");
const ICD_RELEASE: &str = "https://id.who.int/icd/release/11/2025-01/mms";

#[derive(Parser, Debug)]
#[command(name = "terminology-backend")]
#[command(about = "ICD-11 / NAMASTE terminology bridge (Tantivy + Gemini)", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Rebuild the local NAMASTE index from the category CSVs.
    Build(BuildArgs),
    /// Serve the HTTP API (requires a completed build).
    Serve(ServeArgs),
    /// Pair ICD and NAMASTE entries for one query and print them as JSON.
    Match(MatchArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct StorageArgs {
    /// Backend data directory (Tantivy index generations).
    #[arg(long, env = "DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    /// Directory holding ayurveda.csv, unani.csv and siddha.csv.
    #[arg(long, env = "ASSETS_DIR", default_value = DEFAULT_ASSETS_DIR)]
    pub assets_dir: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RemoteArgs {
    #[arg(long, env = "ICD_CLIENTID", hide_env_values = true)]
    pub icd_client_id: String,

    #[arg(long, env = "ICD_CLIENTSECRET", hide_env_values = true)]
    pub icd_client_secret: String,

    #[arg(
        long,
        env = "ICD_TOKEN_URL",
        default_value = "https://icdaccessmanagement.who.int/connect/token"
    )]
    pub icd_token_url: String,

    #[arg(long, env = "ICD_SCOPE", default_value = "icdapi_access")]
    pub icd_scope: String,

    /// MMS search endpoint.
    #[arg(long, env = "ICD_SEARCH_URL", default_value_t = format!("{ICD_RELEASE}/search"))]
    pub icd_search_url: String,

    /// Base URL entity ids are appended to when fetching descriptions.
    #[arg(long, env = "ICD_ENTITY_URL", default_value = ICD_RELEASE)]
    pub icd_entity_url: String,

    /// Concurrent partition queries when enumerating ICD codes.
    #[arg(long, default_value_t = 2)]
    pub list_workers: usize,

    /// Skip per-entity description lookups when enumerating ICD codes.
    #[arg(long)]
    pub no_list_descriptions: bool,

    /// Request timeout for ICD identity, search and entity calls, in seconds.
    #[arg(long, env = "ICD_TIMEOUT_SECS", default_value_t = 30)]
    pub icd_timeout_secs: u64,

    /// Concurrent description lookups per ICD search.
    #[arg(long, default_value_t = 8)]
    pub backfill_concurrency: usize,

    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: String,

    #[arg(long, env = "GEMINI_MODEL", default_value = "gemini-2.5-flash")]
    pub gemini_model: String,

    #[arg(
        long,
        env = "GEMINI_BASE_URL",
        default_value = "https://generativelanguage.googleapis.com/v1beta"
    )]
    pub gemini_base_url: String,

    /// Matcher request timeout in seconds.
    #[arg(long, default_value_t = 60)]
    pub matcher_timeout_secs: u64,
}

#[derive(clap::Args, Debug, Clone)]
pub struct BuildArgs {
    #[command(flatten)]
    pub storage: StorageArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(flatten)]
    pub remote: RemoteArgs,

    #[arg(long, env = "HOST", default_value = "localhost")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Externally visible base URL used in FHIR system and url fields.
    /// Defaults to http://HOST:PORT.
    #[arg(long, env = "PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Rebuild the NAMASTE index before serving.
    #[arg(long)]
    pub rebuild: bool,
}

impl ServeArgs {
    pub fn public_base(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct MatchArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(flatten)]
    pub remote: RemoteArgs,

    /// Free-text disease query.
    pub query: String,
}
