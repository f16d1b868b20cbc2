//! Resource tree for the mocked metadata endpoint.
//!
//! Path segments are resolved one at a time through [`ResourceTree::resolve`].
//! Segment names are alias-normalized first (`-` and `.` become `_`), so
//! `meta_data.json`, `meta-data.json` and `meta_data_json` all reach the same
//! handler.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::store::{ResourceRecord, SecretStore, StoreError};

/// Namespace the OpenStack handlers read from.
pub const OPENSTACK_NAMESPACE: &str = "openstack";

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("resource not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handler for one leaf of the tree.
pub trait Resource: Send + Sync {
    fn get(&self, store: &SecretStore) -> Result<Value, ResourceError>;

    fn post(&self, _store: &SecretStore, _body: &str) -> Result<Value, ResourceError> {
        Err(ResourceError::MethodNotAllowed)
    }
}

pub enum Node {
    Branch(ResourceTree),
    Leaf(Arc<dyn Resource>),
}

/// Canonical form of a path segment.
pub fn normalize(name: &str) -> String {
    name.trim().replace(['-', '.'], "_")
}

#[derive(Default)]
pub struct ResourceTree {
    // normalized name -> (display name, node)
    children: BTreeMap<String, (String, Node)>,
}

impl ResourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(mut self, name: &str, resource: impl Resource + 'static) -> Self {
        self.children.insert(
            normalize(name),
            (name.to_string(), Node::Leaf(Arc::new(resource))),
        );
        self
    }

    pub fn with_branch(mut self, name: &str, tree: ResourceTree) -> Self {
        self.children
            .insert(normalize(name), (name.to_string(), Node::Branch(tree)));
        self
    }

    pub fn resolve(&self, name: &str) -> Option<&Node> {
        self.children.get(&normalize(name)).map(|(_, node)| node)
    }

    /// Walk a `/`-separated path; empty segments are ignored.
    pub fn resolve_path(&self, path: &str) -> Option<&Node> {
        let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
        segments.peek()?;

        let mut node: Option<&Node> = None;
        for segment in segments {
            let next = match node {
                None => self.resolve(segment)?,
                Some(Node::Branch(sub)) => sub.resolve(segment)?,
                Some(Node::Leaf(_)) => return None,
            };
            node = Some(next);
        }
        node
    }

    /// Display names of the direct children, in order.
    pub fn names(&self) -> Vec<&str> {
        self.children
            .values()
            .map(|(display, _)| display.as_str())
            .collect()
    }
}

// ==============================
// OpenStack handlers
// ==============================

const METADATA_FIELDS: [&str; 7] = [
    "random_seed",
    "uuid",
    "availability_zone",
    "hostname",
    "launch_index",
    "project_id",
    "name",
];

// Missing records read as an empty string, like a freshly booted instance.
fn openstack_data(store: &SecretStore, name: &str) -> Result<Value, ResourceError> {
    Ok(store
        .get_resource(OPENSTACK_NAMESPACE, name)?
        .map(|rec| rec.data)
        .unwrap_or_else(|| Value::String(String::new())))
}

struct MetadataResource;

impl Resource for MetadataResource {
    fn get(&self, store: &SecretStore) -> Result<Value, ResourceError> {
        let mut out = serde_json::Map::new();
        for field in METADATA_FIELDS {
            out.insert(field.to_string(), openstack_data(store, field)?);
        }
        Ok(Value::Object(out))
    }
}

struct UserdataResource;

impl Resource for UserdataResource {
    fn get(&self, store: &SecretStore) -> Result<Value, ResourceError> {
        openstack_data(store, "user_data")
    }
}

/// Placeholder for config-drive style content files; nothing is served yet.
struct ContentResource;

impl Resource for ContentResource {
    fn get(&self, _store: &SecretStore) -> Result<Value, ResourceError> {
        Ok(json!({}))
    }
}

struct PasswordResource;

impl Resource for PasswordResource {
    fn get(&self, store: &SecretStore) -> Result<Value, ResourceError> {
        openstack_data(store, "password")
    }

    fn post(&self, store: &SecretStore, body: &str) -> Result<Value, ResourceError> {
        store.put_resource(&ResourceRecord {
            resource: "password".to_string(),
            data: Value::String(body.to_string()),
            client_id: None,
            namespace: OPENSTACK_NAMESPACE.to_string(),
        })?;
        Ok(json!(null))
    }
}

/// The OpenStack-flavoured metadata tree served under `/openstack`.
pub fn openstack_tree() -> ResourceTree {
    ResourceTree::new()
        .with_branch(
            "2013-04-04",
            ResourceTree::new().with_resource("password", PasswordResource),
        )
        .with_branch(
            "latest",
            ResourceTree::new()
                .with_resource("meta_data.json", MetadataResource)
                .with_resource("user_data", UserdataResource),
        )
        .with_resource("content", ContentResource)
}
