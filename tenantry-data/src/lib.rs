pub mod backend;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod list;
pub mod mapper;
pub mod memory;
pub mod page;
pub mod query;
pub mod record;
pub mod registry;
pub mod schema;
pub mod tx;
pub mod typed;

pub use backend::{Backend, BackendRepository, Connection, RawQueryCapable, Repository};
pub use context::{get_transaction, Context};
pub use error::DataError;
pub use list::{Enrichment, PageQuery};
pub use mapper::{from_record, to_record};
pub use memory::MemoryBackend;
pub use page::{ListParams, Page, Sort, SortDirection};
pub use query::{Condition, QueryBuilder};
pub use record::{Record, Value};
pub use registry::{Constructor, RegistryBuilder, RepositoryRegistry};
pub use schema::EntitySchema;
pub use tx::{
    run_in_transaction, Transaction, TransactionManager, TransactionOptions, TransactionState,
};
pub use typed::TypedRepository;

pub mod prelude {
    //! Re-exports of the most commonly used data types.
    pub use crate::{
        Context, DataError, EntitySchema, ListParams, Page, PageQuery, QueryBuilder, Record,
        Repository, TypedRepository, Value,
    };
}
