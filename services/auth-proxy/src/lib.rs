pub mod audit;
pub mod auth;
pub mod client_ip;
pub mod config;
pub mod impersonation;
pub mod kube;
pub mod proxy;
pub mod server;
pub mod shutdown;

pub use audit::{AuditPipeline, AuditRecord, Outcome};
pub use auth::{AuthChain, AuthError, Identity};
pub use client_ip::ClientIpResolver;
pub use config::{ConfigError, ProxyConfig};
pub use impersonation::{ImpersonationAuthorizer, ImpersonationError};
pub use proxy::{Proxy, ProxyError, Reviewers};
pub use server::{PeerInfo, ProxyServer};
pub use shutdown::{ShutdownHookError, ShutdownHooks};
