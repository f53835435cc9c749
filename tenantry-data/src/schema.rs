use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed business schema stored through a repository.
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Customer {
///     #[serde(default)]
///     id: String,
///     name: String,
///     email: Option<String>,
/// }
///
/// impl EntitySchema for Customer {
///     const ENTITY: &'static str = "customer";
///     fn searchable_fields() -> &'static [&'static str] { &["name", "email"] }
/// }
/// ```
pub trait EntitySchema: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical entity name used as the registry key.
    const ENTITY: &'static str;

    /// Fields free-text search looks at.
    fn searchable_fields() -> &'static [&'static str] {
        &["name"]
    }
}
