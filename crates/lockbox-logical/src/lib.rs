//! Logical backend contract for lockbox.
//!
//! This crate holds everything a backend author and the host agree on
//! without knowing whether the backend runs in-process or in an external
//! plugin process:
//!
//! - the [`Backend`] and [`BackendFactory`] traits
//! - the data model ([`Request`], [`Response`], [`Secret`], [`Auth`], [`TokenEntry`])
//! - the reverse capabilities ([`Storage`], [`SystemView`], [`EventSender`], [`ObservationRecorder`])
//! - the error taxonomy ([`LogicalError`])
//! - the per-call [`Context`]

pub mod auth;
pub mod backend;
pub mod context;
pub mod error;
pub mod events;
pub mod request;
pub mod response;
pub mod secret;
pub mod storage;
pub mod system_view;
pub mod token;

pub use auth::Alias;
pub use auth::Auth;
pub use auth::TokenType;
pub use backend::Backend;
pub use backend::BackendConfig;
pub use backend::BackendFactory;
pub use backend::BackendType;
pub use backend::InitializationRequest;
pub use backend::Paths;
pub use backend::PluginVersion;
pub use context::Context;
pub use context::IndexState;
pub use error::LogicalError;
pub use error::Result;
pub use events::EventData;
pub use events::EventSender;
pub use events::ObservationRecorder;
pub use request::Connection;
pub use request::ConnectionState;
pub use request::Operation;
pub use request::Request;
pub use request::RequestWrapInfo;
pub use response::Response;
pub use response::ResponseWrapInfo;
pub use secret::LeaseOptions;
pub use secret::Secret;
pub use storage::InmemStorage;
pub use storage::NoopStorage;
pub use storage::Storage;
pub use storage::StorageEntry;
pub use storage::StorageHandle;
pub use system_view::Entity;
pub use system_view::Group;
pub use system_view::IdentityTokenRequest;
pub use system_view::IdentityTokenResponse;
pub use system_view::PluginEnvironment;
pub use system_view::PluginLookup;
pub use system_view::PluginType;
pub use system_view::ReplicationState;
pub use system_view::RotationJobConfig;
pub use system_view::RotationJobDeregisterRequest;
pub use system_view::StaticSystemView;
pub use system_view::SystemView;
pub use token::TokenEntry;
