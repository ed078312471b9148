//! Per-entity declaration of the columns visibility filtering relies on.

use sqlx::PgPool;

use crate::error::ScopeError;
use crate::models::ResourceType;

/// How an entity takes part in ad hoc grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantParticipation {
    pub resource_type: ResourceType,
    pub resource_id_column: String,
}

/// Declares which scoping columns a business table carries.
///
/// Declared once per entity type. Absent columns are never guessed: a tier
/// that needs a missing column resolves to a constant-false leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopableEntityDescriptor {
    table: String,
    tenant_column: Option<String>,
    owner_column: Option<String>,
    unit_column: Option<String>,
    multi_unit_column: Option<String>,
    grants: Option<GrantParticipation>,
    register_creator: bool,
}

impl ScopableEntityDescriptor {
    /// A table with no scoping columns declared yet.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            tenant_column: None,
            owner_column: None,
            unit_column: None,
            multi_unit_column: None,
            grants: None,
            register_creator: false,
        }
    }

    /// `tenant_id`, `owner_id` and `unit_id`, the usual business-table layout.
    pub fn conventional(table: impl Into<String>) -> Self {
        Self::new(table)
            .with_tenant_column(ColumnConventions::default().tenant)
            .with_owner_column(ColumnConventions::default().owner)
            .with_unit_column(ColumnConventions::default().unit)
    }

    pub fn with_tenant_column(mut self, column: impl Into<String>) -> Self {
        self.tenant_column = Some(column.into());
        self
    }

    pub fn with_owner_column(mut self, column: impl Into<String>) -> Self {
        self.owner_column = Some(column.into());
        self
    }

    pub fn with_unit_column(mut self, column: impl Into<String>) -> Self {
        self.unit_column = Some(column.into());
        self
    }

    /// Column holding a JSON array of unit ids.
    pub fn with_multi_unit_column(mut self, column: impl Into<String>) -> Self {
        self.multi_unit_column = Some(column.into());
        self
    }

    pub fn with_grants(
        mut self,
        resource_type: ResourceType,
        resource_id_column: impl Into<String>,
    ) -> Self {
        self.grants = Some(GrantParticipation {
            resource_type,
            resource_id_column: resource_id_column.into(),
        });
        self
    }

    /// Record an OWNER grant for the creating actor on every new row.
    pub fn register_creator_as_owner(mut self) -> Self {
        self.register_creator = true;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn tenant_column(&self) -> Option<&str> {
        self.tenant_column.as_deref()
    }

    pub fn owner_column(&self) -> Option<&str> {
        self.owner_column.as_deref()
    }

    pub fn unit_column(&self) -> Option<&str> {
        self.unit_column.as_deref()
    }

    pub fn multi_unit_column(&self) -> Option<&str> {
        self.multi_unit_column.as_deref()
    }

    /// Grant participation, only when the resource type is positive.
    pub fn grant_participation(&self) -> Option<&GrantParticipation> {
        self.grants.as_ref().filter(|g| g.resource_type > 0)
    }

    pub fn registers_creator(&self) -> bool {
        self.register_creator && self.grant_participation().is_some()
    }

    pub fn has_unit_columns(&self) -> bool {
        self.unit_column.is_some() || self.multi_unit_column.is_some()
    }
}

/// Column names recognised by [`introspect_descriptor`].
#[derive(Debug, Clone)]
pub struct ColumnConventions {
    pub tenant: String,
    pub owner: String,
    pub unit: String,
    pub multi_unit: String,
}

impl Default for ColumnConventions {
    fn default() -> Self {
        Self {
            tenant: "tenant_id".to_string(),
            owner: "owner_id".to_string(),
            unit: "unit_id".to_string(),
            multi_unit: "unit_ids".to_string(),
        }
    }
}

impl ColumnConventions {
    /// Build a descriptor from the column names a table actually has.
    pub fn describe<S: AsRef<str>>(
        &self,
        table: &str,
        columns: &[S],
    ) -> ScopableEntityDescriptor {
        let has = |name: &str| columns.iter().any(|c| c.as_ref() == name);
        let mut descriptor = ScopableEntityDescriptor::new(table);
        if has(&self.tenant) {
            descriptor = descriptor.with_tenant_column(self.tenant.clone());
        }
        if has(&self.owner) {
            descriptor = descriptor.with_owner_column(self.owner.clone());
        }
        if has(&self.unit) {
            descriptor = descriptor.with_unit_column(self.unit.clone());
        }
        if has(&self.multi_unit) {
            descriptor = descriptor.with_multi_unit_column(self.multi_unit.clone());
        }
        descriptor
    }
}

/// Opt-in adapter deriving a descriptor from the live schema.
///
/// Grant participation is never inferred. Prefer declaring descriptors
/// explicitly; a table that is renamed or not yet migrated silently loses
/// clauses here.
#[tracing::instrument(skip(pool, conventions))]
pub async fn introspect_descriptor(
    pool: &PgPool,
    table: &str,
    conventions: &ColumnConventions,
) -> Result<ScopableEntityDescriptor, ScopeError> {
    let columns: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT column_name::text FROM information_schema.columns
        WHERE table_schema = current_schema() AND table_name = $1
        "#,
    )
    .bind(table)
    .fetch_all(pool)
    .await?;

    let names: Vec<String> = columns.into_iter().map(|(c,)| c).collect();
    if names.is_empty() {
        tracing::warn!(table, "Introspection found no columns; descriptor is empty");
    }
    Ok(conventions.describe(table, &names))
}
