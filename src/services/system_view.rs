//! System view served from the host to a plugin.
//!
//! Plugin lookups and spawning are not exposed: the client keeps the
//! trait's refusing defaults for those methods.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lockbox_logical::Context;
use lockbox_logical::Entity;
use lockbox_logical::Group;
use lockbox_logical::IdentityTokenRequest;
use lockbox_logical::IdentityTokenResponse;
use lockbox_logical::LogicalError;
use lockbox_logical::PluginEnvironment;
use lockbox_logical::ReplicationState;
use lockbox_logical::ResponseWrapInfo;
use lockbox_logical::RotationJobConfig;
use lockbox_logical::RotationJobDeregisterRequest;
use lockbox_logical::SystemView;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;

use super::SYSTEM_VIEW_SERVICE;
use super::Slot;
use super::invoke;
use crate::rpc::IncomingCall;
use crate::rpc::RpcConnection;
use crate::rpc::Service;
use crate::rpc::Status;
use crate::rpc::metadata;
use crate::rpc::service::encode;
use crate::rpc::service::unknown_method;
use crate::wire::BoolReply;
use crate::wire::ClusterInfoReply;
use crate::wire::DeregisterRotationJobArgs;
use crate::wire::Empty;
use crate::wire::EntityInfoArgs;
use crate::wire::EntityInfoReply;
use crate::wire::GeneratePasswordArgs;
use crate::wire::GeneratePasswordReply;
use crate::wire::GroupsForEntityReply;
use crate::wire::IdentityTokenArgs;
use crate::wire::IdentityTokenReply;
use crate::wire::PluginEnvReply;
use crate::wire::RegisterRotationJobArgs;
use crate::wire::RegisterRotationJobReply;
use crate::wire::ReplicationStateReply;
use crate::wire::ResponseWrapDataArgs;
use crate::wire::ResponseWrapDataReply;
use crate::wire::TtlReply;
use crate::wire::WireEntity;
use crate::wire::WireGroup;
use crate::wire::WirePluginEnvironment;
use crate::wire::WireResponseWrapInfo;
use crate::wire::WireRotationJob;
use crate::wire::decode_err;
use crate::wire::duration_from_wire;
use crate::wire::duration_to_wire;
use crate::wire::encode_err;
use crate::wire::map_from_wire;
use crate::wire::map_to_wire;

mod path {
    pub const DEFAULT_LEASE_TTL: &str = "plugin.SystemView/DefaultLeaseTTL";
    pub const MAX_LEASE_TTL: &str = "plugin.SystemView/MaxLeaseTTL";
    pub const TAINTED: &str = "plugin.SystemView/Tainted";
    pub const CACHING_DISABLED: &str = "plugin.SystemView/CachingDisabled";
    pub const LOCAL_MOUNT: &str = "plugin.SystemView/LocalMount";
    pub const MLOCK_ENABLED: &str = "plugin.SystemView/MlockEnabled";
    pub const REPLICATION_STATE: &str = "plugin.SystemView/ReplicationState";
    pub const RESPONSE_WRAP_DATA: &str = "plugin.SystemView/ResponseWrapData";
    pub const ENTITY_INFO: &str = "plugin.SystemView/EntityInfo";
    pub const GROUPS_FOR_ENTITY: &str = "plugin.SystemView/GroupsForEntity";
    pub const PLUGIN_ENV: &str = "plugin.SystemView/PluginEnv";
    pub const GENERATE_PASSWORD: &str = "plugin.SystemView/GeneratePasswordFromPolicy";
    pub const CLUSTER_INFO: &str = "plugin.SystemView/ClusterInfo";
    pub const GENERATE_IDENTITY_TOKEN: &str = "plugin.SystemView/GenerateIdentityToken";
    pub const REGISTER_ROTATION_JOB: &str = "plugin.SystemView/RegisterRotationJob";
    pub const DEREGISTER_ROTATION_JOB: &str = "plugin.SystemView/DeregisterRotationJob";
}

/// Host side. Refuses with `missing-system-view` until a view is attached.
#[derive(Debug, Default)]
pub struct SystemViewServer {
    view: Slot<dyn SystemView>,
}

impl SystemViewServer {
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn new(view: Arc<dyn SystemView>) -> Self {
        Self { view: Slot::with(view) }
    }

    pub fn attach(&self, view: Arc<dyn SystemView>) {
        self.view.attach(view);
    }

    pub fn is_attached(&self) -> bool {
        self.view.is_attached()
    }

    fn view(&self) -> Result<Arc<dyn SystemView>, Status> {
        self.view.get().ok_or_else(|| Status::from(LogicalError::MissingSystemView))
    }
}

#[async_trait]
impl Service for SystemViewServer {
    fn name(&self) -> &'static str {
        SYSTEM_VIEW_SERVICE
    }

    async fn call(&self, method: &str, call: IncomingCall) -> Result<Vec<u8>, Status> {
        let ctx = metadata::incoming(&call.metadata, call.cancel.clone());
        let view = self.view()?;
        match method {
            "DefaultLeaseTTL" => encode(&TtlReply {
                ttl: duration_to_wire(view.default_lease_ttl(&ctx).await?),
            }),
            "MaxLeaseTTL" => encode(&TtlReply {
                ttl: duration_to_wire(view.max_lease_ttl(&ctx).await?),
            }),
            "Tainted" => encode(&BoolReply {
                value: view.tainted(&ctx).await?,
            }),
            "CachingDisabled" => encode(&BoolReply {
                value: view.caching_disabled(&ctx).await?,
            }),
            "LocalMount" => encode(&BoolReply {
                value: view.local_mount(&ctx).await?,
            }),
            "MlockEnabled" => encode(&BoolReply {
                value: view.mlock_enabled(&ctx).await?,
            }),
            "ReplicationState" => encode(&ReplicationStateReply {
                state: view.replication_state(&ctx).await?.bits(),
            }),
            "ResponseWrapData" => {
                let args: ResponseWrapDataArgs = call.decode()?;
                let data = map_from_wire(&args.data, "wrap.data")?;
                if args.jwt {
                    debug!("plugin requested JWT response wrapping, using a token instead");
                }
                let result = view.response_wrap_data(&ctx, data, duration_from_wire(args.ttl), false).await;
                let err = encode_err(&result);
                encode(&ResponseWrapDataReply {
                    wrap_info: result.ok().as_ref().map(WireResponseWrapInfo::from),
                    err,
                })
            }
            "EntityInfo" => {
                let args: EntityInfoArgs = call.decode()?;
                let result = view.entity_info(&ctx, &args.entity_id).await;
                let err = encode_err(&result);
                encode(&EntityInfoReply {
                    entity: result.ok().flatten().as_ref().map(WireEntity::from),
                    err,
                })
            }
            "GroupsForEntity" => {
                let args: EntityInfoArgs = call.decode()?;
                let result = view.groups_for_entity(&ctx, &args.entity_id).await;
                let err = encode_err(&result);
                encode(&GroupsForEntityReply {
                    groups: result.unwrap_or_default().iter().map(WireGroup::from).collect(),
                    err,
                })
            }
            "PluginEnv" => {
                let result = view.plugin_env(&ctx).await;
                let err = encode_err(&result);
                encode(&PluginEnvReply {
                    plugin_environment: result.ok().as_ref().map(WirePluginEnvironment::from),
                    err,
                })
            }
            "GeneratePasswordFromPolicy" => {
                let args: GeneratePasswordArgs = call.decode()?;
                if args.policy_name.is_empty() {
                    return Err(Status::invalid_argument("no password policy specified"));
                }
                let password = view
                    .generate_password_from_policy(&ctx, &args.policy_name)
                    .await
                    .map_err(|e| Status::internal(format!("failed to generate password from policy: {e}")))?;
                encode(&GeneratePasswordReply { password })
            }
            "ClusterInfo" => {
                let result = view.cluster_id(&ctx).await;
                let err = encode_err(&result);
                encode(&ClusterInfoReply {
                    cluster_id: result.unwrap_or_default(),
                    err,
                })
            }
            "GenerateIdentityToken" => {
                let args: IdentityTokenArgs = call.decode()?;
                let req = IdentityTokenRequest {
                    audience: args.audience,
                    ttl: duration_from_wire(args.ttl),
                };
                let resp = view.generate_identity_token(&ctx, req).await?;
                encode(&IdentityTokenReply {
                    token: resp.token,
                    ttl: duration_to_wire(resp.ttl),
                })
            }
            "RegisterRotationJob" => {
                let args: RegisterRotationJobArgs = call.decode()?;
                let rotation_id = view.register_rotation_job(&ctx, RotationJobConfig::from(args.job)).await?;
                encode(&RegisterRotationJobReply { rotation_id })
            }
            "DeregisterRotationJob" => {
                let args: DeregisterRotationJobArgs = call.decode()?;
                let req = RotationJobDeregisterRequest {
                    mount_point: args.mount_point,
                    req_path: args.req_path,
                };
                view.deregister_rotation_job(&ctx, req).await?;
                encode(&Empty {})
            }
            other => Err(unknown_method(SYSTEM_VIEW_SERVICE, other)),
        }
    }
}

/// Plugin side: a [`SystemView`] that forwards to the host.
#[derive(Debug, Clone)]
pub struct SystemViewClient {
    conn: RpcConnection,
    channel: u32,
}

impl SystemViewClient {
    pub fn new(conn: RpcConnection, channel: u32) -> Self {
        Self { conn, channel }
    }

    async fn flag(&self, ctx: &Context, path: &str) -> lockbox_logical::Result<bool> {
        let reply: BoolReply = invoke(&self.conn, self.channel, path, ctx, &Empty {}).await?;
        Ok(reply.value)
    }

    async fn ttl(&self, ctx: &Context, path: &str) -> lockbox_logical::Result<Duration> {
        let reply: TtlReply = invoke(&self.conn, self.channel, path, ctx, &Empty {}).await?;
        Ok(duration_from_wire(reply.ttl))
    }
}

#[async_trait]
impl SystemView for SystemViewClient {
    async fn default_lease_ttl(&self, ctx: &Context) -> lockbox_logical::Result<Duration> {
        self.ttl(ctx, path::DEFAULT_LEASE_TTL).await
    }

    async fn max_lease_ttl(&self, ctx: &Context) -> lockbox_logical::Result<Duration> {
        self.ttl(ctx, path::MAX_LEASE_TTL).await
    }

    async fn tainted(&self, ctx: &Context) -> lockbox_logical::Result<bool> {
        self.flag(ctx, path::TAINTED).await
    }

    async fn caching_disabled(&self, ctx: &Context) -> lockbox_logical::Result<bool> {
        self.flag(ctx, path::CACHING_DISABLED).await
    }

    async fn local_mount(&self, ctx: &Context) -> lockbox_logical::Result<bool> {
        self.flag(ctx, path::LOCAL_MOUNT).await
    }

    async fn mlock_enabled(&self, ctx: &Context) -> lockbox_logical::Result<bool> {
        self.flag(ctx, path::MLOCK_ENABLED).await
    }

    async fn replication_state(&self, ctx: &Context) -> lockbox_logical::Result<ReplicationState> {
        let reply: ReplicationStateReply =
            invoke(&self.conn, self.channel, path::REPLICATION_STATE, ctx, &Empty {}).await?;
        Ok(ReplicationState::from_bits_truncate(reply.state))
    }

    async fn response_wrap_data(
        &self,
        ctx: &Context,
        data: Map<String, Value>,
        ttl: Duration,
        jwt: bool,
    ) -> lockbox_logical::Result<ResponseWrapInfo> {
        let args = ResponseWrapDataArgs {
            data: map_to_wire(&data, "wrap.data")?,
            ttl: duration_to_wire(ttl),
            jwt,
        };
        let reply: ResponseWrapDataReply = invoke(&self.conn, self.channel, path::RESPONSE_WRAP_DATA, ctx, &args).await?;
        decode_err(reply.err)?;
        let info = reply
            .wrap_info
            .ok_or_else(|| LogicalError::internal("host returned no wrap info"))?;
        Ok(ResponseWrapInfo::try_from(info)?)
    }

    async fn entity_info(&self, ctx: &Context, entity_id: &str) -> lockbox_logical::Result<Option<Entity>> {
        let args = EntityInfoArgs {
            entity_id: entity_id.to_string(),
        };
        let reply: EntityInfoReply = invoke(&self.conn, self.channel, path::ENTITY_INFO, ctx, &args).await?;
        decode_err(reply.err)?;
        Ok(reply.entity.map(Entity::from))
    }

    async fn groups_for_entity(&self, ctx: &Context, entity_id: &str) -> lockbox_logical::Result<Vec<Group>> {
        let args = EntityInfoArgs {
            entity_id: entity_id.to_string(),
        };
        let reply: GroupsForEntityReply = invoke(&self.conn, self.channel, path::GROUPS_FOR_ENTITY, ctx, &args).await?;
        decode_err(reply.err)?;
        Ok(reply.groups.into_iter().map(Group::from).collect())
    }

    async fn plugin_env(&self, ctx: &Context) -> lockbox_logical::Result<PluginEnvironment> {
        let reply: PluginEnvReply = invoke(&self.conn, self.channel, path::PLUGIN_ENV, ctx, &Empty {}).await?;
        decode_err(reply.err)?;
        Ok(reply.plugin_environment.map(PluginEnvironment::from).unwrap_or_default())
    }

    async fn generate_password_from_policy(&self, ctx: &Context, policy_name: &str) -> lockbox_logical::Result<String> {
        let args = GeneratePasswordArgs {
            policy_name: policy_name.to_string(),
        };
        let reply: GeneratePasswordReply = invoke(&self.conn, self.channel, path::GENERATE_PASSWORD, ctx, &args).await?;
        Ok(reply.password)
    }

    async fn cluster_id(&self, ctx: &Context) -> lockbox_logical::Result<String> {
        let reply: ClusterInfoReply = invoke(&self.conn, self.channel, path::CLUSTER_INFO, ctx, &Empty {}).await?;
        decode_err(reply.err)?;
        Ok(reply.cluster_id)
    }

    async fn generate_identity_token(
        &self,
        ctx: &Context,
        req: IdentityTokenRequest,
    ) -> lockbox_logical::Result<IdentityTokenResponse> {
        let args = IdentityTokenArgs {
            audience: req.audience,
            ttl: duration_to_wire(req.ttl),
        };
        let reply: IdentityTokenReply =
            invoke(&self.conn, self.channel, path::GENERATE_IDENTITY_TOKEN, ctx, &args).await?;
        Ok(IdentityTokenResponse {
            token: reply.token,
            ttl: duration_from_wire(reply.ttl),
        })
    }

    async fn register_rotation_job(&self, ctx: &Context, cfg: RotationJobConfig) -> lockbox_logical::Result<String> {
        let args = RegisterRotationJobArgs {
            job: WireRotationJob::from(&cfg),
        };
        let reply: RegisterRotationJobReply =
            invoke(&self.conn, self.channel, path::REGISTER_ROTATION_JOB, ctx, &args).await?;
        Ok(reply.rotation_id)
    }

    async fn deregister_rotation_job(
        &self,
        ctx: &Context,
        req: RotationJobDeregisterRequest,
    ) -> lockbox_logical::Result<()> {
        let args = DeregisterRotationJobArgs {
            mount_point: req.mount_point,
            req_path: req.req_path,
        };
        let _: Empty = invoke(&self.conn, self.channel, path::DEREGISTER_ROTATION_JOB, ctx, &args).await?;
        Ok(())
    }
}
