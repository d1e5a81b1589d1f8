//! Source importers.
//!
//! An [`Importer`] only knows how to fetch one provider's payload and how to
//! map its columns. Everything after the fetch is the shared pipeline in
//! [`crate::ingest`], driven by [`run_importer`].

use std::future::Future;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ingest::{ingest, ColumnMapping, Extract, IngestError, IngestOptions, IngestOutcome, NoData};
use crate::models::NewApi;
use crate::observer::{Phase, PipelineObserver};
use crate::store::{Store, StoreError};

// ---

/// Provider error codes meaning the credential must be refreshed.
pub const CREDENTIAL_EXPIRED_CODES: [i64; 2] = [498, 499];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {message}")]
    Provider { status: i64, message: String },

    #[error("credentials for {0} have expired")]
    CredentialExpired(String),

    #[error("credential refresh is not implemented for {0}")]
    RefreshNotImplemented(String),

    #[error("unable to decode provider payload: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A refreshed credential to persist on the API row.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub api_key: String,
    pub token_expiry: Option<DateTime<Utc>>,
}

pub trait Importer: Send + Sync {
    // ---
    /// Registration record for this source.
    fn api(&self) -> NewApi;

    fn mapping(&self) -> &ColumnMapping;

    fn options(&self) -> &IngestOptions;

    /// Fetch the current payload. `Ok(None)` means the provider had nothing.
    fn fetch(&self) -> impl Future<Output = Result<Option<Extract>, FetchError>> + Send;

    /// Obtain a fresh credential and start using it. Importers that
    /// authenticate with expiring tokens must override this.
    fn refresh_credentials(&self) -> impl Future<Output = Result<Credentials, FetchError>> + Send {
        let name = self.api().name;
        async move { Err(FetchError::RefreshNotImplemented(name)) }
    }
}

/// Check a provider response, honouring an `{"error": {"code", "message"}}`
/// envelope over the HTTP status.
pub fn check_provider_response(api_name: &str, status: u16, body: &Value) -> Result<(), FetchError> {
    // ---
    let envelope = body.get("error").filter(|e| e.is_object());
    let code = envelope
        .and_then(|e| e.get("code"))
        .and_then(Value::as_i64)
        .unwrap_or(i64::from(status));

    if CREDENTIAL_EXPIRED_CODES.contains(&code) {
        return Err(FetchError::CredentialExpired(api_name.to_string()));
    }

    if envelope.is_some() || !(200..300).contains(&code) {
        let message = envelope
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| body.to_string());
        return Err(FetchError::Provider { status: code, message });
    }
    Ok(())
}

/// Fetch once, refreshing the credential and retrying on expiry, then
/// ingest the result.
pub async fn run_importer<I, S>(
    importer: &I,
    store: &S,
    observer: &dyn PipelineObserver,
) -> Result<IngestOutcome, ImportError>
where
    I: Importer,
    S: Store,
{
    // ---
    let api = importer.api();
    observer.on_phase(Phase::Fetch {
        api_name: api.name.clone(),
    });

    let fetched = match importer.fetch().await {
        Err(FetchError::CredentialExpired(name)) => {
            warn!("Credentials for {} expired, refreshing", name);
            observer.on_phase(Phase::RefreshCredentials { api_name: name });

            let credentials = match importer.refresh_credentials().await {
                Ok(c) => c,
                Err(e) => {
                    observer.on_phase(Phase::Failed { error: e.to_string() });
                    return Err(e.into());
                }
            };
            let row = store.register_api(&api).await?;
            store
                .update_api_credentials(row.id, &credentials.api_key, credentials.token_expiry)
                .await?;
            importer.fetch().await
        }
        other => other,
    };

    let extract = match fetched {
        Ok(Some(extract)) => extract,
        Ok(None) => {
            info!("{} returned no data", api.name);
            observer.on_phase(Phase::Skipped {
                reason: NoData::EmptyPayload.to_string(),
            });
            return Ok(IngestOutcome::Skipped(NoData::EmptyPayload));
        }
        Err(e) => {
            observer.on_phase(Phase::Failed { error: e.to_string() });
            return Err(e.into());
        }
    };
    debug!("{} returned {} rows", api.name, extract.len());

    Ok(ingest(store, &api, &extract, importer.mapping(), importer.options(), observer).await?)
}

/// Importer for any endpoint returning JSON.
///
/// The request URL is the API url with the key appended. The payload is
/// flattened with [`Extract::from_json`].
pub struct HttpJsonImporter {
    client: reqwest::Client,
    api: NewApi,
    object_separator: Option<String>,
    ignore_tags: Vec<String>,
    mapping: ColumnMapping,
    options: IngestOptions,
}

impl HttpJsonImporter {
    pub fn new(api: NewApi, mapping: ColumnMapping) -> Self {
        HttpJsonImporter {
            client: reqwest::Client::new(),
            api,
            object_separator: None,
            ignore_tags: Vec::new(),
            mapping,
            options: IngestOptions::default(),
        }
    }

    pub fn object_separator(mut self, separator: impl Into<String>) -> Self {
        self.object_separator = Some(separator.into());
        self
    }

    pub fn ignore_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_options(mut self, options: IngestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn request_url(&self) -> String {
        format!("{}{}", self.api.url, self.api.api_key)
    }
}

impl Importer for HttpJsonImporter {
    fn api(&self) -> NewApi {
        self.api.clone()
    }

    fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    fn options(&self) -> &IngestOptions {
        &self.options
    }

    async fn fetch(&self) -> Result<Option<Extract>, FetchError> {
        // ---
        debug!("Fetching {}", self.api.name);

        let response = self.client.get(self.request_url()).send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        let body: Value = match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(_) if !(200..300).contains(&status) => Value::String(text),
            Err(e) => return Err(FetchError::Decode(e.to_string())),
        };
        check_provider_response(&self.api.name, status, &body)?;

        let extract = Extract::from_json(&body, self.object_separator.as_deref(), &self.ignore_tags);
        if extract.is_empty() {
            return Ok(None);
        }
        Ok(Some(extract))
    }
}
