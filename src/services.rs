use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::Client;

use crate::autocomplete::AutoComplete;
use crate::cli::{RemoteArgs, StorageArgs};
use crate::icd::{IcdClient, IcdConfig};
use crate::index::namaste::NamasteIndex;
use crate::matcher::{GeminiConfig, GeminiMatcher, Matcher};
use crate::storage::StoragePaths;
use crate::token::{IdentityConfig, TokenManager};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Long-lived handles shared by the CLI commands and the HTTP surface.
#[derive(Clone)]
pub struct Services {
    pub icd: Arc<IcdClient>,
    pub namaste: Arc<NamasteIndex>,
    pub autocomplete: Arc<AutoComplete>,
}

impl Services {
    pub fn from_args(storage: &StorageArgs, remote: &RemoteArgs) -> anyhow::Result<Self> {
        let namaste = Arc::new(open_index(storage)?);

        let http = icd_http_client(Duration::from_secs(remote.icd_timeout_secs))
            .context("build http client")?;

        let tokens = TokenManager::new(
            http.clone(),
            IdentityConfig {
                token_url: remote.icd_token_url.clone(),
                client_id: remote.icd_client_id.clone(),
                client_secret: remote.icd_client_secret.clone(),
                scope: remote.icd_scope.clone(),
            },
        );
        let icd = Arc::new(IcdClient::new(
            http,
            Arc::new(tokens),
            IcdConfig {
                search_url: remote.icd_search_url.clone(),
                entity_url: remote.icd_entity_url.clone(),
                list_workers: remote.list_workers.max(1),
                list_descriptions: !remote.no_list_descriptions,
                backfill_concurrency: remote.backfill_concurrency.max(1),
            },
        ));

        let matcher: Arc<dyn Matcher> = Arc::new(
            GeminiMatcher::new(GeminiConfig {
                base_url: remote.gemini_base_url.clone(),
                model: remote.gemini_model.clone(),
                api_key: remote.gemini_api_key.clone(),
                timeout: Duration::from_secs(remote.matcher_timeout_secs),
            })
            .context("build matcher")?,
        );

        let autocomplete = Arc::new(AutoComplete::new(
            Arc::clone(&icd),
            Arc::clone(&namaste),
            matcher,
        ));

        Ok(Self {
            icd,
            namaste,
            autocomplete,
        })
    }
}

/// HTTP client for the identity, search and entity endpoints.
///
/// Every request is time-bounded: the token exchange holds the credential lock.
pub fn icd_http_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(concat!("terminology-backend/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(timeout.min(CONNECT_TIMEOUT))
        .timeout(timeout)
        .build()
}

pub fn open_index(storage: &StorageArgs) -> anyhow::Result<NamasteIndex> {
    let paths = StoragePaths::new(&storage.data_dir, &storage.assets_dir);
    paths
        .ensure_dirs()
        .with_context(|| format!("create {}", paths.namaste_index_root.display()))?;
    Ok(NamasteIndex::new(paths))
}
