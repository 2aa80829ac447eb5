//! Client for the PocketBase-style record store.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use url::Url;

use crate::{auth::AuthStore, upload::Record};

mod transport;

pub use transport::HttpEvents;

pub const DEFAULT_AUTH_COLLECTION: &str = "_superusers";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    #[error("failed to authenticate. status: {code}, message: {message}")]
    Auth {
        code: reqwest::StatusCode,
        message: String,
    },
    #[error("failed to look up records. status: {code}, message: {message}")]
    Lookup {
        code: reqwest::StatusCode,
        message: String,
    },
    #[error("base url cannot hold a collection path: {0}")]
    BaseUrl(Url),
}

/// Error body returned by the store.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Serialize)]
struct PasswordAuth<'a> {
    identity: &'a str,
    password: &'a str,
}

#[derive(Deserialize, Debug)]
pub struct AuthResponse {
    pub token: String,
    pub record: Record,
}

/// One page of a record listing.
#[derive(Deserialize, Debug)]
pub struct ListResponse {
    #[serde(default)]
    pub items: Vec<Record>,
}

#[derive(Clone)]
pub struct RecordStore {
    base_url: Url,
    client: reqwest::Client,
}

impl RecordStore {
    pub fn new(base_url: Url) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: Url, client: reqwest::Client) -> Self {
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Log in against an auth collection and store the returned token in
    /// `auth`. A rejected login leaves `auth` anonymous.
    pub async fn auth_with_password(
        &self,
        auth: &AuthStore,
        collection: &str,
        identity: &str,
        password: &str,
    ) -> Result<Record, Error> {
        let mut endpoint = collection_url(&self.base_url, collection)
            .ok_or_else(|| Error::BaseUrl(self.base_url.clone()))?;
        endpoint
            .path_segments_mut()
            .map_err(|_| Error::BaseUrl(self.base_url.clone()))?
            .push("auth-with-password");
        debug!(%endpoint, identity, "authenticating");

        let response = self
            .client
            .post(endpoint.clone())
            .json(&PasswordAuth { identity, password })
            .send()
            .await
            .inspect_err(|error| error!(%error, %endpoint, "failed to reach record store"))
            .map_err(Error::Transport)?;
        let code = response.status();
        if !code.is_success() {
            auth.clear();
            let message = error_message(response).await;
            error!(%code, reason = %message, "authentication rejected");
            return Err(Error::Auth { code, message });
        }
        let response = response
            .json::<AuthResponse>()
            .await
            .inspect_err(|error| error!(%error, "malformed authentication response"))
            .map_err(Error::Transport)?;
        auth.set(response.token);
        Ok(response.record)
    }

    /// First record of `collection`, for collections holding a single record
    /// such as the site settings.
    pub async fn first_record(
        &self,
        auth: &AuthStore,
        collection: &str,
    ) -> Result<Option<Record>, Error> {
        let mut endpoint = records_url(&self.base_url, collection, None)
            .ok_or_else(|| Error::BaseUrl(self.base_url.clone()))?;
        endpoint
            .query_pairs_mut()
            .append_pair("page", "1")
            .append_pair("perPage", "1")
            .append_pair("skipTotal", "1");
        debug!(%endpoint, "looking up first record");

        let mut builder = self.client.get(endpoint.clone());
        if let Some(token) = auth.token() {
            builder = builder.header(reqwest::header::AUTHORIZATION, token);
        }
        let response = builder
            .send()
            .await
            .inspect_err(|error| error!(%error, %endpoint, "failed to reach record store"))
            .map_err(Error::Transport)?;
        let code = response.status();
        if !code.is_success() {
            let message = error_message(response).await;
            warn!(%code, reason = %message, collection, "record lookup rejected");
            return Err(Error::Lookup { code, message });
        }
        let page = response
            .json::<ListResponse>()
            .await
            .inspect_err(|error| error!(%error, collection, "malformed record listing"))
            .map_err(Error::Transport)?;
        Ok(page.items.into_iter().next())
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let code = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) if !body.message.is_empty() => body.message,
        _ => code.canonical_reason().unwrap_or_default().to_owned(),
    }
}

fn collection_url(base: &Url, collection: &str) -> Option<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .extend(["api", "collections", collection]);
    Some(url)
}

/// `<base>/api/collections/<collection>/records[/<id>]`, or `None` when the
/// base url cannot carry a path.
pub fn records_url(base: &Url, collection: &str, record_id: Option<&str>) -> Option<Url> {
    let mut url = collection_url(base, collection)?;
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments.push("records");
        if let Some(id) = record_id {
            segments.push(id);
        }
    }
    Some(url)
}
