use super::config::ConnectionConfig;
use super::{ClusterSession, SessionFactory};
use crate::core::{ClusterError, ClusterSettings, Membership, Result, ServerInfo, ShardMapDocument};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Path of the node-local database holding one shard map per database.
const SHARD_MAP_DB: [&str; 3] = ["_node", "_local", "_dbs"];

/// Opens `reqwest`-backed sessions against CouchDB's HTTP API
#[derive(Debug, Clone, Default)]
pub struct HttpSessionFactory;

impl HttpSessionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    type Session = HttpSession;

    async fn open(&self, endpoint: &ConnectionConfig) -> Result<HttpSession> {
        let mut builder = Client::builder().connect_timeout(endpoint.connect_timeout);
        if let Some(timeout) = endpoint.request_timeout {
            builder = builder.timeout(timeout);
        }
        let mut session = HttpSession {
            client: builder.build()?,
            config: endpoint.clone(),
        };
        session.info().await?;
        Ok(session)
    }
}

/// Session to one node over HTTP
pub struct HttpSession {
    client: Client,
    config: ConnectionConfig,
}

#[derive(Deserialize)]
struct DatabaseInfo {
    #[serde(default)]
    doc_count: u64,
    #[serde(default)]
    doc_del_count: u64,
}

impl HttpSession {
    fn url_for(&self, segments: &[&str]) -> Url {
        let mut url = self.config.url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.config.username {
            Some(username) => request.basic_auth(username, self.config.password.as_ref()),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        let url = self.url_for(segments);
        let response = self.request(Method::GET, url.clone()).send().await?;
        read_json(response, &url).await
    }
}

async fn status_error(response: Response, url: &Url) -> ClusterError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ClusterError::Status {
        status,
        path: url.path().to_string(),
        body,
    }
}

async fn read_json<T: DeserializeOwned>(response: Response, url: &Url) -> Result<T> {
    if !response.status().is_success() {
        return Err(status_error(response, url).await);
    }
    Ok(response.json::<T>().await?)
}

#[async_trait]
impl ClusterSession for HttpSession {
    async fn info(&mut self) -> Result<ServerInfo> {
        self.get_json(&[]).await
    }

    async fn list_databases(&mut self, start_key: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let url = self.url_for(&["_all_dbs"]);
        let mut query = vec![("limit", limit.to_string())];
        if let Some(key) = start_key {
            query.push(("start_key", serde_json::to_string(key)?));
        }
        let response = self
            .request(Method::GET, url.clone())
            .query(&query)
            .send()
            .await?;
        read_json(response, &url).await
    }

    async fn get_shard_map(&mut self, db: &str) -> Result<Option<ShardMapDocument>> {
        let url = self.url_for(&[SHARD_MAP_DB[0], SHARD_MAP_DB[1], SHARD_MAP_DB[2], db]);
        let response = self.request(Method::GET, url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let raw: Value = read_json(response, &url).await?;
        ShardMapDocument::from_json(db, raw).map(Some)
    }

    async fn put_shard_map(&mut self, db: &str, doc: &ShardMapDocument) -> Result<()> {
        let url = self.url_for(&[SHARD_MAP_DB[0], SHARD_MAP_DB[1], SHARD_MAP_DB[2], db]);
        let response = self
            .request(Method::PUT, url.clone())
            .json(&doc.to_json()?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClusterError::DocumentMissing(db.to_string()));
        }
        if !response.status().is_success() {
            return Err(status_error(response, &url).await);
        }
        Ok(())
    }

    async fn membership(&mut self) -> Result<Membership> {
        self.get_json(&["_membership"]).await
    }

    async fn cluster_settings(&mut self) -> Result<ClusterSettings> {
        let raw: Value = self
            .get_json(&["_node", "_local", "_config", "cluster"])
            .await?;
        ClusterSettings::from_json(&raw)
    }

    async fn metadata_count(&mut self) -> Result<u64> {
        let info: DatabaseInfo = self.get_json(&SHARD_MAP_DB).await?;
        Ok(info.doc_count + info.doc_del_count)
    }
}
