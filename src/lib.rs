#![forbid(unsafe_code)]
#![doc = r#"
Arestor

Mock cloud metadata service. Answers instance-metadata requests (OpenStack
flavour) from a Redis-backed store and guards its admin API with an
API-key/secret pair plus an encrypted `content` channel.

Crate highlights
- Authentication gate: `RequestAuthenticator::authenticate(&mut RequestParams)`.
- Content envelopes: `AesCipher` (AES-256-CBC, SHA-256 key derivation, random IV, base64).
- Resilient store client with bounded reconnects: `SecretStore`.
- HTTP server (in `server`): `/openstack/...` metadata tree and the gated `/admin/resource` API.
- Client (in `client`): populates the store through the admin API.

Modules
- `auth`: request parameters, verdicts, the authenticator and content codec.
- `cipher`: envelope encryption and PKCS#7 padding.
- `store`: Redis / in-memory backends and the secret store.
- `resources`: path-segment resource tree with alias normalization.
- `server`: Actix-web routes and handlers.
- `client`: async admin client.
- `config`, `util`: CLI/env configuration, tracing setup, shared state.

Note: envelopes carry no MAC; tampered content that still decodes to a JSON
object is accepted.
"#]

pub mod auth;
pub mod cipher;
pub mod client;
pub mod config;
pub mod resources;
pub mod server;
pub mod store;
pub mod util;

pub use crate::auth::{decode_content, encode_content, RequestAuthenticator, RequestParams, Verdict};
pub use crate::cipher::{AesCipher, CipherError};
pub use crate::client::ArestorClient;
pub use crate::config::Config;
pub use crate::resources::{normalize, openstack_tree, Node, Resource, ResourceTree};
pub use crate::store::{
    MemoryConnector, RedisConnector, ResourceRecord, SecretStore, StoreBackend, StoreError,
    UserInfo,
};
