//! Message types that cross the plugin connection.
//!
//! Every type here is a plain serde struct encoded with postcard. Nested
//! JSON trees travel as strings, instants as [`Timestamp`], and durations as
//! signed nanoseconds. Optional sub-messages are `Option`s so the decoder can
//! tell "absent" from "empty".

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use super::error::WireError;

/// Seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireLeaseOptions {
    pub ttl: i64,
    pub max_ttl: i64,
    pub renewable: bool,
    pub increment: i64,
    pub issue_time: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSecret {
    pub lease_options: Option<WireLeaseOptions>,
    /// JSON object.
    pub internal_data: String,
    pub lease_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAlias {
    pub mount_type: String,
    pub mount_accessor: String,
    pub name: String,
    pub metadata: HashMap<String, String>,
    pub id: String,
    pub custom_metadata: HashMap<String, String>,
    pub local: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAuth {
    pub lease_options: Option<WireLeaseOptions>,
    pub token_type: u32,
    /// JSON object.
    pub internal_data: String,
    pub display_name: String,
    pub policies: Vec<String>,
    pub token_policies: Vec<String>,
    pub identity_policies: Vec<String>,
    pub no_default_policy: bool,
    pub metadata: HashMap<String, String>,
    pub client_token: String,
    pub accessor: String,
    pub period: i64,
    pub explicit_max_ttl: i64,
    pub num_uses: i64,
    pub entity_id: String,
    pub alias: Option<WireAlias>,
    pub group_aliases: Vec<WireAlias>,
    pub bound_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTokenEntry {
    pub id: String,
    pub accessor: String,
    pub parent: String,
    pub policies: Vec<String>,
    pub inline_policy: String,
    pub path: String,
    pub meta: HashMap<String, String>,
    pub internal_meta: HashMap<String, String>,
    pub display_name: String,
    pub num_uses: i64,
    pub creation_time: i64,
    pub ttl: i64,
    pub explicit_max_ttl: i64,
    pub role: String,
    pub period: i64,
    pub entity_id: String,
    pub no_identity_policies: bool,
    pub bound_cidrs: Vec<String>,
    pub namespace_id: String,
    pub cubbyhole_id: String,
    pub token_type: u32,
    pub external_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequestWrapInfo {
    pub ttl: i64,
    pub format: String,
    pub seal_wrap: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCertificateChain {
    pub certificates: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireConnectionState {
    pub version: u32,
    pub handshake_complete: bool,
    pub did_resume: bool,
    pub cipher_suite: u32,
    pub negotiated_protocol: String,
    pub negotiated_protocol_is_mutual: bool,
    pub server_name: String,
    pub peer_certificates: WireCertificateChain,
    pub verified_chains: Vec<WireCertificateChain>,
    pub signed_certificate_timestamps: Vec<Vec<u8>>,
    pub ocsp_response: Vec<u8>,
    pub tls_unique: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireConnection {
    pub remote_addr: String,
    pub remote_port: i32,
    pub connection_state: Option<WireConnectionState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: String,
    pub operation: String,
    pub path: String,
    /// JSON object.
    pub data: String,
    pub secret: Option<WireSecret>,
    pub auth: Option<WireAuth>,
    pub headers: HashMap<String, Vec<String>>,
    pub client_token: String,
    pub client_token_accessor: String,
    pub client_token_remaining_uses: i64,
    pub display_name: String,
    pub mount_point: String,
    pub mount_type: String,
    pub mount_accessor: String,
    pub wrap_info: Option<WireRequestWrapInfo>,
    pub entity_id: String,
    pub policy_override: bool,
    pub unauthenticated: bool,
    pub connection: Option<WireConnection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireResponseWrapInfo {
    pub ttl: i64,
    pub token: String,
    pub accessor: String,
    pub creation_time: Option<Timestamp>,
    pub wrapped_accessor: String,
    pub wrapped_entity_id: String,
    pub format: String,
    pub creation_path: String,
    pub seal_wrap: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireResponse {
    pub secret: Option<WireSecret>,
    pub auth: Option<WireAuth>,
    /// JSON object.
    pub data: String,
    pub redirect: String,
    pub warnings: Vec<String>,
    pub wrap_info: Option<WireResponseWrapInfo>,
    pub headers: HashMap<String, Vec<String>>,
    pub mount_type: String,
    /// JSON object; `None` when the backend did not populate it.
    pub supplemental_audit_request_data: Option<String>,
    pub supplemental_audit_response_data: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireStorageEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub seal_wrap: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePaths {
    pub root: Vec<String>,
    pub unauthenticated: Vec<String>,
    pub local_storage: Vec<String>,
    pub seal_wrap_storage: Vec<String>,
    pub write_forwarded_storage: Vec<String>,
    pub binary: Vec<String>,
    pub limited: Vec<String>,
    pub allow_snapshot_read: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntity {
    pub id: String,
    pub name: String,
    pub aliases: Vec<WireAlias>,
    pub metadata: HashMap<String, String>,
    pub disabled: bool,
    pub namespace_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGroup {
    pub id: String,
    pub name: String,
    pub metadata: HashMap<String, String>,
    pub namespace_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePluginEnvironment {
    pub host_version: String,
    pub host_version_prerelease: String,
    pub host_version_metadata: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEventData {
    pub id: String,
    /// JSON object.
    pub metadata: String,
    pub entity_ids: Vec<String>,
    pub note: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRotationJob {
    pub name: String,
    pub mount_type: String,
    pub path: String,
    pub schedule: String,
    pub rotation_window: i64,
    pub rotation_period: i64,
}

// ============================================================================
// Backend service
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupArgs {
    /// Channel on which the host serves the reverse services for this instance.
    pub broker_id: u32,
    pub config: HashMap<String, String>,
    pub backend_uuid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupReply {
    pub err: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeReply {
    pub err: Option<WireError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRequestArgs {
    pub request: WireRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRequestReply {
    pub response: Option<WireResponse>,
    pub err: Option<WireError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleExistenceCheckArgs {
    pub request: WireRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleExistenceCheckReply {
    pub check_found: bool,
    pub exists: bool,
    pub err: Option<WireError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialPathsReply {
    pub paths: Option<WirePaths>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateKeyArgs {
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeReply {
    pub backend_type: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginVersionReply {
    pub plugin_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplexingSupportReply {
    pub supported: bool,
}

// ============================================================================
// Storage service
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageListArgs {
    pub prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageListReply {
    pub keys: Vec<String>,
    pub err: Option<WireError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageGetArgs {
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageGetReply {
    pub entry: Option<WireStorageEntry>,
    pub err: Option<WireError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePutArgs {
    pub entry: WireStorageEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDeleteArgs {
    pub key: String,
}

/// Reply for storage calls with no payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageReply {
    pub err: Option<WireError>,
}

// ============================================================================
// System view service
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlReply {
    pub ttl: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolReply {
    pub value: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStateReply {
    pub state: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseWrapDataArgs {
    /// JSON object.
    pub data: String,
    pub ttl: i64,
    pub jwt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseWrapDataReply {
    pub wrap_info: Option<WireResponseWrapInfo>,
    pub err: Option<WireError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfoArgs {
    pub entity_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfoReply {
    pub entity: Option<WireEntity>,
    pub err: Option<WireError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupsForEntityReply {
    pub groups: Vec<WireGroup>,
    pub err: Option<WireError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginEnvReply {
    pub plugin_environment: Option<WirePluginEnvironment>,
    pub err: Option<WireError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratePasswordArgs {
    pub policy_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratePasswordReply {
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfoReply {
    pub cluster_id: String,
    pub err: Option<WireError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityTokenArgs {
    pub audience: String,
    pub ttl: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityTokenReply {
    pub token: String,
    pub ttl: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRotationJobArgs {
    pub job: WireRotationJob,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRotationJobReply {
    pub rotation_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregisterRotationJobArgs {
    pub mount_point: String,
    pub req_path: String,
}

// ============================================================================
// Events and observations
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEventArgs {
    pub event_type: String,
    pub event: WireEventData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordObservationArgs {
    pub observation_type: String,
    /// JSON object.
    pub data: String,
}
