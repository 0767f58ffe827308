//! Conversion between the logical model and its wire form.
//!
//! Every conversion is loss-free: for every supported value `v`,
//! decoding the encoding of `v` yields `v` again. JSON trees travel as
//! strings, durations as nanoseconds, instants as [`Timestamp`], CIDRs as
//! their string form.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use ipnet::IpNet;
use lockbox_logical::Alias;
use lockbox_logical::Auth;
use lockbox_logical::BackendType;
use lockbox_logical::Connection;
use lockbox_logical::ConnectionState;
use lockbox_logical::Entity;
use lockbox_logical::EventData;
use lockbox_logical::Group;
use lockbox_logical::LeaseOptions;
use lockbox_logical::LogicalError;
use lockbox_logical::Paths;
use lockbox_logical::PluginEnvironment;
use lockbox_logical::Request;
use lockbox_logical::RequestWrapInfo;
use lockbox_logical::Response;
use lockbox_logical::ResponseWrapInfo;
use lockbox_logical::RotationJobConfig;
use lockbox_logical::Secret;
use lockbox_logical::StorageEntry;
use lockbox_logical::StorageHandle;
use lockbox_logical::TokenEntry;
use lockbox_logical::TokenType;
use serde_json::Map;
use serde_json::Value;
use snafu::ResultExt;
use snafu::Snafu;

use super::types::*;
use crate::rpc::Status;

/// Failures converting between wire and logical forms.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TranslateError {
    #[snafu(display("failed to encode {field} as JSON: {source}"))]
    EncodeJson {
        field: &'static str,
        source: serde_json::Error,
    },

    #[snafu(display("failed to decode {field} from JSON: {source}"))]
    DecodeJson {
        field: &'static str,
        source: serde_json::Error,
    },

    #[snafu(display("{field} is not a JSON object"))]
    NotAnObject { field: &'static str },

    #[snafu(display("timestamp out of range: {seconds}s {nanos}ns"))]
    InvalidTimestamp { seconds: i64, nanos: i32 },

    #[snafu(display("invalid CIDR '{cidr}'"))]
    InvalidCidr { cidr: String },

    #[snafu(display("unknown operation '{operation}'"))]
    UnknownOperation { operation: String },
}

// ============================================================================
// Scalars
// ============================================================================

/// Durations beyond `i64::MAX` nanoseconds saturate.
pub fn duration_to_wire(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Negative durations clamp to zero.
pub fn duration_from_wire(nanos: i64) -> Duration {
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(0))
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(t: DateTime<Utc>) -> Self {
        Self {
            seconds: t.timestamp(),
            // subsec nanos is below 2 * 10^9 (leap seconds), always fits.
            nanos: t.timestamp_subsec_nanos() as i32,
        }
    }
}

impl TryFrom<Timestamp> for DateTime<Utc> {
    type Error = TranslateError;

    fn try_from(ts: Timestamp) -> Result<Self, Self::Error> {
        let nanos = u32::try_from(ts.nanos).map_err(|_| TranslateError::InvalidTimestamp {
            seconds: ts.seconds,
            nanos: ts.nanos,
        })?;
        DateTime::<Utc>::from_timestamp(ts.seconds, nanos).ok_or(TranslateError::InvalidTimestamp {
            seconds: ts.seconds,
            nanos: ts.nanos,
        })
    }
}

fn time_to_wire(t: Option<DateTime<Utc>>) -> Option<Timestamp> {
    t.map(Timestamp::from)
}

fn time_from_wire(ts: Option<Timestamp>) -> Result<Option<DateTime<Utc>>, TranslateError> {
    ts.map(DateTime::<Utc>::try_from).transpose()
}

/// Encode a JSON object as a string.
pub fn map_to_wire(map: &Map<String, Value>, field: &'static str) -> Result<String, TranslateError> {
    serde_json::to_string(map).context(EncodeJsonSnafu { field })
}

/// Decode a JSON object string. An empty string is an empty object.
pub fn map_from_wire(json: &str, field: &'static str) -> Result<Map<String, Value>, TranslateError> {
    if json.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(json).context(DecodeJsonSnafu { field })? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(TranslateError::NotAnObject { field }),
    }
}

fn cidrs_to_wire(cidrs: &[IpNet]) -> Vec<String> {
    cidrs.iter().map(ToString::to_string).collect()
}

/// Bare addresses are accepted and become host networks.
fn cidrs_from_wire(cidrs: Vec<String>) -> Result<Vec<IpNet>, TranslateError> {
    cidrs
        .into_iter()
        .map(|cidr| {
            if let Ok(net) = cidr.parse::<IpNet>() {
                return Ok(net);
            }
            match cidr.parse::<std::net::IpAddr>() {
                Ok(addr) => Ok(IpNet::from(addr)),
                Err(_) => Err(TranslateError::InvalidCidr { cidr }),
            }
        })
        .collect()
}

// ============================================================================
// Lease options, secrets, auth
// ============================================================================

impl From<&LeaseOptions> for WireLeaseOptions {
    fn from(lease: &LeaseOptions) -> Self {
        Self {
            ttl: duration_to_wire(lease.ttl),
            max_ttl: duration_to_wire(lease.max_ttl),
            renewable: lease.renewable,
            increment: duration_to_wire(lease.increment),
            issue_time: time_to_wire(lease.issue_time),
        }
    }
}

impl TryFrom<WireLeaseOptions> for LeaseOptions {
    type Error = TranslateError;

    fn try_from(lease: WireLeaseOptions) -> Result<Self, Self::Error> {
        Ok(Self {
            ttl: duration_from_wire(lease.ttl),
            max_ttl: duration_from_wire(lease.max_ttl),
            renewable: lease.renewable,
            increment: duration_from_wire(lease.increment),
            issue_time: time_from_wire(lease.issue_time)?,
        })
    }
}

fn lease_from_wire(lease: Option<WireLeaseOptions>) -> Result<LeaseOptions, TranslateError> {
    lease.map(LeaseOptions::try_from).transpose().map(Option::unwrap_or_default)
}

impl TryFrom<&Secret> for WireSecret {
    type Error = TranslateError;

    fn try_from(secret: &Secret) -> Result<Self, Self::Error> {
        Ok(Self {
            lease_options: Some(WireLeaseOptions::from(&secret.lease_options)),
            internal_data: map_to_wire(&secret.internal_data, "secret.internal_data")?,
            lease_id: secret.lease_id.clone(),
        })
    }
}

impl TryFrom<WireSecret> for Secret {
    type Error = TranslateError;

    fn try_from(secret: WireSecret) -> Result<Self, Self::Error> {
        Ok(Self {
            lease_options: lease_from_wire(secret.lease_options)?,
            internal_data: map_from_wire(&secret.internal_data, "secret.internal_data")?,
            lease_id: secret.lease_id,
        })
    }
}

impl From<&Alias> for WireAlias {
    fn from(alias: &Alias) -> Self {
        Self {
            mount_type: alias.mount_type.clone(),
            mount_accessor: alias.mount_accessor.clone(),
            name: alias.name.clone(),
            metadata: alias.metadata.clone(),
            id: alias.id.clone(),
            custom_metadata: alias.custom_metadata.clone(),
            local: alias.local,
        }
    }
}

impl From<WireAlias> for Alias {
    fn from(alias: WireAlias) -> Self {
        Self {
            mount_type: alias.mount_type,
            mount_accessor: alias.mount_accessor,
            name: alias.name,
            metadata: alias.metadata,
            id: alias.id,
            custom_metadata: alias.custom_metadata,
            local: alias.local,
        }
    }
}

impl TryFrom<&Auth> for WireAuth {
    type Error = TranslateError;

    fn try_from(auth: &Auth) -> Result<Self, Self::Error> {
        Ok(Self {
            lease_options: Some(WireLeaseOptions::from(&auth.lease_options)),
            token_type: auth.token_type.as_u32(),
            internal_data: map_to_wire(&auth.internal_data, "auth.internal_data")?,
            display_name: auth.display_name.clone(),
            policies: auth.policies.clone(),
            token_policies: auth.token_policies.clone(),
            identity_policies: auth.identity_policies.clone(),
            no_default_policy: auth.no_default_policy,
            metadata: auth.metadata.clone(),
            client_token: auth.client_token.clone(),
            accessor: auth.accessor.clone(),
            period: duration_to_wire(auth.period),
            explicit_max_ttl: duration_to_wire(auth.explicit_max_ttl),
            num_uses: auth.num_uses,
            entity_id: auth.entity_id.clone(),
            alias: auth.alias.as_ref().map(WireAlias::from),
            group_aliases: auth.group_aliases.iter().map(WireAlias::from).collect(),
            bound_cidrs: cidrs_to_wire(&auth.bound_cidrs),
        })
    }
}

impl TryFrom<WireAuth> for Auth {
    type Error = TranslateError;

    fn try_from(auth: WireAuth) -> Result<Self, Self::Error> {
        Ok(Self {
            lease_options: lease_from_wire(auth.lease_options)?,
            token_type: TokenType::from_u32(auth.token_type),
            internal_data: map_from_wire(&auth.internal_data, "auth.internal_data")?,
            display_name: auth.display_name,
            policies: auth.policies,
            token_policies: auth.token_policies,
            identity_policies: auth.identity_policies,
            no_default_policy: auth.no_default_policy,
            metadata: auth.metadata,
            client_token: auth.client_token,
            accessor: auth.accessor,
            period: duration_from_wire(auth.period),
            explicit_max_ttl: duration_from_wire(auth.explicit_max_ttl),
            num_uses: auth.num_uses,
            entity_id: auth.entity_id,
            alias: auth.alias.map(Alias::from),
            group_aliases: auth.group_aliases.into_iter().map(Alias::from).collect(),
            bound_cidrs: cidrs_from_wire(auth.bound_cidrs)?,
        })
    }
}

impl From<&TokenEntry> for WireTokenEntry {
    fn from(te: &TokenEntry) -> Self {
        Self {
            id: te.id.clone(),
            accessor: te.accessor.clone(),
            parent: te.parent.clone(),
            policies: te.policies.clone(),
            inline_policy: te.inline_policy.clone(),
            path: te.path.clone(),
            meta: te.meta.clone(),
            internal_meta: te.internal_meta.clone(),
            display_name: te.display_name.clone(),
            num_uses: te.num_uses,
            creation_time: te.creation_time,
            ttl: duration_to_wire(te.ttl),
            explicit_max_ttl: duration_to_wire(te.explicit_max_ttl),
            role: te.role.clone(),
            period: duration_to_wire(te.period),
            entity_id: te.entity_id.clone(),
            no_identity_policies: te.no_identity_policies,
            bound_cidrs: cidrs_to_wire(&te.bound_cidrs),
            namespace_id: te.namespace_id.clone(),
            cubbyhole_id: te.cubbyhole_id.clone(),
            token_type: te.token_type.as_u32(),
            external_id: te.external_id.clone(),
        }
    }
}

impl TryFrom<WireTokenEntry> for TokenEntry {
    type Error = TranslateError;

    fn try_from(te: WireTokenEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            id: te.id,
            accessor: te.accessor,
            parent: te.parent,
            policies: te.policies,
            inline_policy: te.inline_policy,
            path: te.path,
            meta: te.meta,
            internal_meta: te.internal_meta,
            display_name: te.display_name,
            num_uses: te.num_uses,
            creation_time: te.creation_time,
            ttl: duration_from_wire(te.ttl),
            explicit_max_ttl: duration_from_wire(te.explicit_max_ttl),
            role: te.role,
            period: duration_from_wire(te.period),
            entity_id: te.entity_id,
            no_identity_policies: te.no_identity_policies,
            bound_cidrs: cidrs_from_wire(te.bound_cidrs)?,
            namespace_id: te.namespace_id,
            cubbyhole_id: te.cubbyhole_id,
            token_type: TokenType::from_u32(te.token_type),
            external_id: te.external_id,
        })
    }
}

// ============================================================================
// Connection metadata
// ============================================================================

impl From<&ConnectionState> for WireConnectionState {
    fn from(cs: &ConnectionState) -> Self {
        Self {
            version: u32::from(cs.version),
            handshake_complete: cs.handshake_complete,
            did_resume: cs.did_resume,
            cipher_suite: u32::from(cs.cipher_suite),
            negotiated_protocol: cs.negotiated_protocol.clone(),
            negotiated_protocol_is_mutual: cs.negotiated_protocol_is_mutual,
            server_name: cs.server_name.clone(),
            peer_certificates: WireCertificateChain {
                certificates: cs.peer_certificates.clone(),
            },
            verified_chains: cs
                .verified_chains
                .iter()
                .map(|chain| WireCertificateChain {
                    certificates: chain.clone(),
                })
                .collect(),
            signed_certificate_timestamps: cs.signed_certificate_timestamps.clone(),
            ocsp_response: cs.ocsp_response.clone(),
            tls_unique: cs.tls_unique.clone(),
        }
    }
}

impl From<WireConnectionState> for ConnectionState {
    fn from(cs: WireConnectionState) -> Self {
        Self {
            // TLS versions and cipher suites are 16-bit on the wire of TLS itself.
            version: cs.version as u16,
            handshake_complete: cs.handshake_complete,
            did_resume: cs.did_resume,
            cipher_suite: cs.cipher_suite as u16,
            negotiated_protocol: cs.negotiated_protocol,
            negotiated_protocol_is_mutual: cs.negotiated_protocol_is_mutual,
            server_name: cs.server_name,
            peer_certificates: cs.peer_certificates.certificates,
            verified_chains: cs.verified_chains.into_iter().map(|chain| chain.certificates).collect(),
            signed_certificate_timestamps: cs.signed_certificate_timestamps,
            ocsp_response: cs.ocsp_response,
            tls_unique: cs.tls_unique,
        }
    }
}

impl From<&Connection> for WireConnection {
    fn from(conn: &Connection) -> Self {
        Self {
            remote_addr: conn.remote_addr.clone(),
            remote_port: conn.remote_port,
            connection_state: conn.connection_state.as_ref().map(WireConnectionState::from),
        }
    }
}

impl From<WireConnection> for Connection {
    fn from(conn: WireConnection) -> Self {
        Self {
            remote_addr: conn.remote_addr,
            remote_port: conn.remote_port,
            connection_state: conn.connection_state.map(ConnectionState::from),
        }
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

impl From<&RequestWrapInfo> for WireRequestWrapInfo {
    fn from(info: &RequestWrapInfo) -> Self {
        Self {
            ttl: duration_to_wire(info.ttl),
            format: info.format.clone(),
            seal_wrap: info.seal_wrap,
        }
    }
}

impl From<WireRequestWrapInfo> for RequestWrapInfo {
    fn from(info: WireRequestWrapInfo) -> Self {
        Self {
            ttl: duration_from_wire(info.ttl),
            format: info.format,
            seal_wrap: info.seal_wrap,
        }
    }
}

impl TryFrom<&Request> for WireRequest {
    type Error = TranslateError;

    fn try_from(req: &Request) -> Result<Self, Self::Error> {
        Ok(Self {
            id: req.id.clone(),
            operation: req.operation.as_str().to_string(),
            path: req.path.clone(),
            data: map_to_wire(&req.data, "request.data")?,
            secret: req.secret.as_ref().map(WireSecret::try_from).transpose()?,
            auth: req.auth.as_ref().map(WireAuth::try_from).transpose()?,
            headers: req.headers.clone(),
            client_token: req.client_token.clone(),
            client_token_accessor: req.client_token_accessor.clone(),
            client_token_remaining_uses: req.client_token_remaining_uses,
            display_name: req.display_name.clone(),
            mount_point: req.mount_point.clone(),
            mount_type: req.mount_type.clone(),
            mount_accessor: req.mount_accessor.clone(),
            wrap_info: req.wrap_info.as_ref().map(WireRequestWrapInfo::from),
            entity_id: req.entity_id.clone(),
            policy_override: req.policy_override,
            unauthenticated: req.unauthenticated,
            connection: req.connection.as_ref().map(WireConnection::from),
        })
    }
}

/// The decoded request has no storage attached; the receiver binds one.
impl TryFrom<WireRequest> for Request {
    type Error = TranslateError;

    fn try_from(req: WireRequest) -> Result<Self, Self::Error> {
        let operation = req
            .operation
            .parse()
            .map_err(|_| TranslateError::UnknownOperation {
                operation: req.operation.clone(),
            })?;
        Ok(Self {
            id: req.id,
            operation,
            path: req.path,
            data: map_from_wire(&req.data, "request.data")?,
            secret: req.secret.map(Secret::try_from).transpose()?,
            auth: req.auth.map(Auth::try_from).transpose()?,
            headers: req.headers,
            client_token: req.client_token,
            client_token_accessor: req.client_token_accessor,
            client_token_remaining_uses: req.client_token_remaining_uses,
            display_name: req.display_name,
            mount_point: req.mount_point,
            mount_type: req.mount_type,
            mount_accessor: req.mount_accessor,
            wrap_info: req.wrap_info.map(RequestWrapInfo::from),
            entity_id: req.entity_id,
            policy_override: req.policy_override,
            unauthenticated: req.unauthenticated,
            connection: req.connection.map(Connection::from),
            storage: StorageHandle::detached(),
        })
    }
}

impl From<&ResponseWrapInfo> for WireResponseWrapInfo {
    fn from(info: &ResponseWrapInfo) -> Self {
        Self {
            ttl: duration_to_wire(info.ttl),
            token: info.token.clone(),
            accessor: info.accessor.clone(),
            creation_time: time_to_wire(info.creation_time),
            wrapped_accessor: info.wrapped_accessor.clone(),
            wrapped_entity_id: info.wrapped_entity_id.clone(),
            format: info.format.clone(),
            creation_path: info.creation_path.clone(),
            seal_wrap: info.seal_wrap,
        }
    }
}

impl TryFrom<WireResponseWrapInfo> for ResponseWrapInfo {
    type Error = TranslateError;

    fn try_from(info: WireResponseWrapInfo) -> Result<Self, Self::Error> {
        Ok(Self {
            ttl: duration_from_wire(info.ttl),
            token: info.token,
            accessor: info.accessor,
            creation_time: time_from_wire(info.creation_time)?,
            wrapped_accessor: info.wrapped_accessor,
            wrapped_entity_id: info.wrapped_entity_id,
            format: info.format,
            creation_path: info.creation_path,
            seal_wrap: info.seal_wrap,
        })
    }
}

impl TryFrom<&Response> for WireResponse {
    type Error = TranslateError;

    fn try_from(resp: &Response) -> Result<Self, Self::Error> {
        let audit_request = resp
            .supplemental_audit_request_data
            .as_ref()
            .map(|m| map_to_wire(m, "response.supplemental_audit_request_data"))
            .transpose()?;
        let audit_response = resp
            .supplemental_audit_response_data
            .as_ref()
            .map(|m| map_to_wire(m, "response.supplemental_audit_response_data"))
            .transpose()?;
        Ok(Self {
            secret: resp.secret.as_ref().map(WireSecret::try_from).transpose()?,
            auth: resp.auth.as_ref().map(WireAuth::try_from).transpose()?,
            data: map_to_wire(&resp.data, "response.data")?,
            redirect: resp.redirect.clone(),
            warnings: resp.warnings.clone(),
            wrap_info: resp.wrap_info.as_ref().map(WireResponseWrapInfo::from),
            headers: resp.headers.clone(),
            mount_type: resp.mount_type.clone(),
            supplemental_audit_request_data: audit_request,
            supplemental_audit_response_data: audit_response,
        })
    }
}

impl TryFrom<WireResponse> for Response {
    type Error = TranslateError;

    fn try_from(resp: WireResponse) -> Result<Self, Self::Error> {
        let audit_request = resp
            .supplemental_audit_request_data
            .map(|s| map_from_wire(&s, "response.supplemental_audit_request_data"))
            .transpose()?;
        let audit_response = resp
            .supplemental_audit_response_data
            .map(|s| map_from_wire(&s, "response.supplemental_audit_response_data"))
            .transpose()?;
        Ok(Self {
            secret: resp.secret.map(Secret::try_from).transpose()?,
            auth: resp.auth.map(Auth::try_from).transpose()?,
            data: map_from_wire(&resp.data, "response.data")?,
            redirect: resp.redirect,
            warnings: resp.warnings,
            wrap_info: resp.wrap_info.map(ResponseWrapInfo::try_from).transpose()?,
            headers: resp.headers,
            mount_type: resp.mount_type,
            supplemental_audit_request_data: audit_request,
            supplemental_audit_response_data: audit_response,
        })
    }
}

// ============================================================================
// Storage, paths, identity and friends
// ============================================================================

impl From<&StorageEntry> for WireStorageEntry {
    fn from(entry: &StorageEntry) -> Self {
        Self {
            key: entry.key.clone(),
            value: entry.value.clone(),
            seal_wrap: entry.seal_wrap,
        }
    }
}

impl From<WireStorageEntry> for StorageEntry {
    fn from(entry: WireStorageEntry) -> Self {
        Self {
            key: entry.key,
            value: entry.value,
            seal_wrap: entry.seal_wrap,
        }
    }
}

impl From<&Paths> for WirePaths {
    fn from(paths: &Paths) -> Self {
        Self {
            root: paths.root.clone(),
            unauthenticated: paths.unauthenticated.clone(),
            local_storage: paths.local_storage.clone(),
            seal_wrap_storage: paths.seal_wrap_storage.clone(),
            write_forwarded_storage: paths.write_forwarded_storage.clone(),
            binary: paths.binary.clone(),
            limited: paths.limited.clone(),
            allow_snapshot_read: paths.allow_snapshot_read.clone(),
        }
    }
}

impl From<WirePaths> for Paths {
    fn from(paths: WirePaths) -> Self {
        Self {
            root: paths.root,
            unauthenticated: paths.unauthenticated,
            local_storage: paths.local_storage,
            seal_wrap_storage: paths.seal_wrap_storage,
            write_forwarded_storage: paths.write_forwarded_storage,
            binary: paths.binary,
            limited: paths.limited,
            allow_snapshot_read: paths.allow_snapshot_read,
        }
    }
}

impl From<&Entity> for WireEntity {
    fn from(entity: &Entity) -> Self {
        Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            aliases: entity.aliases.iter().map(WireAlias::from).collect(),
            metadata: entity.metadata.clone(),
            disabled: entity.disabled,
            namespace_id: entity.namespace_id.clone(),
        }
    }
}

impl From<WireEntity> for Entity {
    fn from(entity: WireEntity) -> Self {
        Self {
            id: entity.id,
            name: entity.name,
            aliases: entity.aliases.into_iter().map(Alias::from).collect(),
            metadata: entity.metadata,
            disabled: entity.disabled,
            namespace_id: entity.namespace_id,
        }
    }
}

impl From<&Group> for WireGroup {
    fn from(group: &Group) -> Self {
        Self {
            id: group.id.clone(),
            name: group.name.clone(),
            metadata: group.metadata.clone(),
            namespace_id: group.namespace_id.clone(),
        }
    }
}

impl From<WireGroup> for Group {
    fn from(group: WireGroup) -> Self {
        Self {
            id: group.id,
            name: group.name,
            metadata: group.metadata,
            namespace_id: group.namespace_id,
        }
    }
}

impl From<&PluginEnvironment> for WirePluginEnvironment {
    fn from(env: &PluginEnvironment) -> Self {
        Self {
            host_version: env.host_version.clone(),
            host_version_prerelease: env.host_version_prerelease.clone(),
            host_version_metadata: env.host_version_metadata.clone(),
        }
    }
}

impl From<WirePluginEnvironment> for PluginEnvironment {
    fn from(env: WirePluginEnvironment) -> Self {
        Self {
            host_version: env.host_version,
            host_version_prerelease: env.host_version_prerelease,
            host_version_metadata: env.host_version_metadata,
        }
    }
}

impl From<&RotationJobConfig> for WireRotationJob {
    fn from(job: &RotationJobConfig) -> Self {
        Self {
            name: job.name.clone(),
            mount_type: job.mount_type.clone(),
            path: job.path.clone(),
            schedule: job.schedule.clone(),
            rotation_window: job.rotation_window,
            rotation_period: job.rotation_period,
        }
    }
}

impl From<WireRotationJob> for RotationJobConfig {
    fn from(job: WireRotationJob) -> Self {
        Self {
            name: job.name,
            mount_type: job.mount_type,
            path: job.path,
            schedule: job.schedule,
            rotation_window: job.rotation_window,
            rotation_period: job.rotation_period,
        }
    }
}

impl TryFrom<&EventData> for WireEventData {
    type Error = TranslateError;

    fn try_from(event: &EventData) -> Result<Self, Self::Error> {
        Ok(Self {
            id: event.id.clone(),
            metadata: map_to_wire(&event.metadata, "event.metadata")?,
            entity_ids: event.entity_ids.clone(),
            note: event.note.clone(),
        })
    }
}

impl TryFrom<WireEventData> for EventData {
    type Error = TranslateError;

    fn try_from(event: WireEventData) -> Result<Self, Self::Error> {
        Ok(Self {
            id: event.id,
            metadata: map_from_wire(&event.metadata, "event.metadata")?,
            entity_ids: event.entity_ids,
            note: event.note,
        })
    }
}

impl From<BackendType> for TypeReply {
    fn from(ty: BackendType) -> Self {
        Self {
            backend_type: ty.as_u32(),
        }
    }
}

impl From<TranslateError> for LogicalError {
    fn from(err: TranslateError) -> Self {
        LogicalError::internal(err.to_string())
    }
}

/// A message that fails to translate is the caller's fault.
impl From<TranslateError> for Status {
    fn from(err: TranslateError) -> Self {
        Status::invalid_argument(err.to_string())
    }
}
