//! Client for populating the mocked metadata through the admin endpoint.
//!
//! Every request carries `api_key` in clear and the payload as an encrypted
//! `content` envelope under the caller's secret.

use anyhow::{anyhow, bail, Result};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::auth::{encode_content, API_KEY, CONTENT};
use crate::store::ResourceRecord;

#[derive(Debug, Deserialize)]
struct Meta {
    status: bool,
    verbose: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    meta: Meta,
    content: Option<T>,
}

pub struct ArestorClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    secret: String,
    client_id: String,
    namespace: String,
}

impl ArestorClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        client_id: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: reqwest::Client::builder()
                .user_agent(format!("arestor-client/{}", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            secret: secret.into(),
            client_id: client_id.into(),
            namespace: namespace.into(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = namespace.into();
    }

    /// Admin endpoint URL, optionally for a single resource. The resource id
    /// is percent-encoded as one path segment.
    pub fn url(&self, resource_id: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| anyhow!("invalid arestor base url {:?}: {}", self.base_url, e))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow!("arestor base url {:?} cannot carry a path", self.base_url))?;
            segments.pop_if_empty().extend(["admin", "resource"]);
            if let Some(id) = resource_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn base_info(&self) -> Map<String, Value> {
        let mut info = Map::new();
        info.insert("client_id".into(), Value::String(self.client_id.clone()));
        info.insert("namespace".into(), Value::String(self.namespace.clone()));
        info
    }

    /// `api_key` plus `fields` (and the client's base info) sealed into `content`.
    fn signed_params(&self, fields: Map<String, Value>) -> Result<Vec<(&'static str, String)>> {
        let mut payload = fields;
        for (k, v) in self.base_info() {
            payload.entry(k).or_insert(v);
        }
        let content = encode_content(&self.secret, &payload)?;
        Ok(vec![(API_KEY, self.api_key.clone()), (CONTENT, content)])
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<(StatusCode, Option<T>)> {
        let code = response.status();
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| anyhow!("unexpected response from arestor ({}): {}", code, e))?;
        if !envelope.meta.status && code != StatusCode::NOT_FOUND {
            bail!("arestor rejected the request ({}): {}", code, envelope.meta.verbose);
        }
        Ok((code, envelope.content))
    }

    /// Create (or overwrite) a resource in the client's namespace.
    pub async fn create_resource(&self, resource_name: &str, resource_data: Value) -> Result<ResourceRecord> {
        let mut fields = Map::new();
        fields.insert("resource".into(), Value::String(resource_name.to_string()));
        fields.insert("data".into(), resource_data);

        let response = self
            .http
            .post(self.url(None)?)
            .form(&self.signed_params(fields)?)
            .send()
            .await?;
        match Self::decode(response).await? {
            (_, Some(record)) => Ok(record),
            (code, None) => bail!("arestor returned no resource ({})", code),
        }
    }

    /// All resources of the client's namespace, whoever created them.
    pub async fn resources(&self) -> Result<Vec<ResourceRecord>> {
        let response = self
            .http
            .get(self.url(None)?)
            .query(&self.signed_params(Map::new())?)
            .send()
            .await?;
        Ok(Self::decode(response).await?.1.unwrap_or_default())
    }

    /// Remove one resource; `false` when it did not exist.
    pub async fn delete_resource(&self, resource_id: &str) -> Result<bool> {
        let response = self
            .http
            .delete(self.url(Some(resource_id))?)
            .query(&self.signed_params(Map::new())?)
            .send()
            .await?;
        let (code, _) = Self::decode::<Value>(response).await?;
        Ok(code != StatusCode::NOT_FOUND)
    }

    /// Delete the resources this client created; records of other clients
    /// sharing the namespace are left alone.
    pub async fn delete_all_data(&self) -> Result<usize> {
        let mut removed = 0usize;
        let own = self
            .resources()
            .await?
            .into_iter()
            .filter(|record| record.client_id.as_deref() == Some(self.client_id.as_str()));
        for record in own {
            if self.delete_resource(&record.resource).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn set_hostname(&self, hostname: &str) -> Result<ResourceRecord> {
        self.create_resource("hostname", Value::from(hostname)).await
    }

    pub async fn set_uuid(&self, uuid: &str) -> Result<ResourceRecord> {
        self.create_resource("uuid", Value::from(uuid)).await
    }

    pub async fn set_random_seed(&self, random_seed: &str) -> Result<ResourceRecord> {
        self.create_resource("random_seed", Value::from(random_seed)).await
    }

    pub async fn set_availability_zone(&self, availability_zone: &str) -> Result<ResourceRecord> {
        self.create_resource("availability_zone", Value::from(availability_zone))
            .await
    }

    pub async fn set_launch_index(&self, launch_index: u64) -> Result<ResourceRecord> {
        self.create_resource("launch_index", Value::from(launch_index))
            .await
    }

    pub async fn set_project_id(&self, project_id: &str) -> Result<ResourceRecord> {
        self.create_resource("project_id", Value::from(project_id)).await
    }

    pub async fn set_name(&self, name: &str) -> Result<ResourceRecord> {
        self.create_resource("name", Value::from(name)).await
    }

    pub async fn set_user_data(&self, user_data: &str) -> Result<ResourceRecord> {
        self.create_resource("user_data", Value::from(user_data)).await
    }

    pub async fn set_public_keys(&self, ssh_keys: Value, cert_keys: Value) -> Result<()> {
        self.create_resource("public_keys", ssh_keys).await?;
        self.create_resource("keys", cert_keys).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::decode_content;
    use serde_json::json;

    fn client() -> ArestorClient {
        ArestorClient::new("http://127.0.0.1:8088/", "ak", "sk", "vm-42", "openstack")
    }

    #[test]
    fn urls_drop_trailing_slash() {
        let c = client();
        assert_eq!(c.url(None).unwrap().as_str(), "http://127.0.0.1:8088/admin/resource");
        assert_eq!(
            c.url(Some("hostname")).unwrap().as_str(),
            "http://127.0.0.1:8088/admin/resource/hostname"
        );
    }

    #[test]
    fn resource_id_is_a_single_encoded_segment() {
        let c = client();
        let url = c.url(Some("keys/0?x#frag")).unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8088/admin/resource/keys%2F0%3Fx%23frag"
        );
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn base_url_prefix_is_kept() {
        let c = ArestorClient::new("http://meta.local/arestor/", "ak", "sk", "vm", "openstack");
        assert_eq!(
            c.url(None).unwrap().as_str(),
            "http://meta.local/arestor/admin/resource"
        );
        let bad = ArestorClient::new("not a url", "ak", "sk", "vm", "openstack");
        assert!(bad.url(None).is_err());
    }

    #[test]
    fn signed_params_seal_payload_and_base_info() {
        let mut c = client();
        c.set_namespace("custom");

        let mut fields = Map::new();
        fields.insert("resource".into(), json!("hostname"));
        let params = c.signed_params(fields).unwrap();

        assert_eq!(params[0], (API_KEY, "ak".to_string()));
        assert_eq!(params[1].0, CONTENT);
        let decoded = decode_content("sk", &params[1].1).unwrap();
        assert_eq!(decoded["resource"], json!("hostname"));
        assert_eq!(decoded["client_id"], json!("vm-42"));
        assert_eq!(decoded["namespace"], json!("custom"));
    }
}
