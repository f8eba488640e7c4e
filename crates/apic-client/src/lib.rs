//! APIC REST API Client
//!
//! A Rust client for the Cisco APIC REST API, exposing the Endpoint Group
//! and contract operations the EPG operator needs. The fabric's DN format
//! and its two authentication modes stay behind this crate.
//!
//! # Example
//!
//! ```no_run
//! use apic_client::{ApicAuth, ApicClient, ApicConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ApicConfig {
//!     host: "10.0.0.1".to_string(),
//!     username: "admin".to_string(),
//!     auth: ApicAuth::Password("secret".to_string()),
//! };
//!
//! // Connects and lists fabric nodes to validate credentials
//! let client = ApicClient::connect(&config).await?;
//!
//! client.create_epg("web_EPG", "kube-app", "kube", "kube-pod-bd", "kube", "Kubernetes").await?;
//! client.consume_contract("web_EPG", "kube-app", "kube", "dns").await?;
//! let consumed = client.get_consumed_contracts("web_EPG", "kube-app", "kube").await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod dn;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod apic_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use auth::{ApicAuth, ApicConfig};
pub use client::ApicClient;
pub use error::ApicError;
pub use apic_trait::ApicClientTrait;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockApicClient, MockEndpointGroup};
