//! Tenantry: persistence abstraction and transaction coordination for
//! multi-tenant services.
//!
//! This facade crate re-exports the tenantry sub-crates through a single
//! dependency and adds the composition root, [`DataLayer`], which turns a
//! [`TenantryConfig`](tenantry_core::TenantryConfig) into a ready registry,
//! connection and transaction manager.
//!
//! ```ignore
//! use tenantry::prelude::*;
//!
//! tenantry::init_tracing();
//! let config = TenantryConfig::load("dev")?;
//! let data = DataLayer::bootstrap(&config).await?;
//! let customers = data.repository("customer")?;
//! ```
//!
//! # Feature flags
//!
//! | Feature  | Default | Crate                |
//! |----------|---------|----------------------|
//! | `sqlite` | **yes** | `tenantry-data-sqlx` |

mod layer;
pub mod settings;

pub use tenantry_core;
pub use tenantry_data;

#[cfg(feature = "sqlite")]
pub use tenantry_data_sqlx;

pub use layer::{BootstrapError, DataLayer};
pub use settings::{BackendKind, DataSettings, EntitySettings};
pub use tenantry_core::{init_tracing, init_tracing_with, LogFormat};

/// Unified prelude. Import everything with `use tenantry::prelude::*`.
pub mod prelude {
    pub use crate::{BootstrapError, DataLayer, DataSettings};
    pub use tenantry_core::{ConfigError, ConfigSection, TenantryConfig};
    pub use tenantry_data::prelude::*;
    pub use tenantry_data::{
        run_in_transaction, Condition, Enrichment, Sort, TransactionManager, TransactionOptions,
    };

    #[cfg(feature = "sqlite")]
    pub use tenantry_data_sqlx::prelude::*;
}
