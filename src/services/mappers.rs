//! Row mappers for the built-in entity types.

use garde::Validate;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::EntityType;
use crate::services::mapper::{
    optional, parse_optional, parse_required, required, EntityCommand, MapperRegistry, RowError,
    RowMapper, TenantContext,
};
use crate::services::parser::Row;

impl MapperRegistry {
    /// Registry holding a mapper for every built-in entity type.
    pub fn with_defaults() -> Self {
        MapperRegistry::new()
            .register(Arc::new(ItemMapper))
            .register(Arc::new(InventoryMapper))
            .register(Arc::new(LocationMapper))
            .register(Arc::new(ContainerMapper))
            .register(Arc::new(CategoryMapper))
            .register(Arc::new(BorrowerMapper))
    }
}

fn validated<T: Validate<Context = ()> + Serialize>(
    entity_type: EntityType,
    natural_key: String,
    command: T,
) -> Result<EntityCommand, RowError> {
    command
        .validate()
        .map_err(|report| RowError::from_report(&report))?;
    EntityCommand::new(entity_type, natural_key, &command)
}

/// `parent/name` path used as the key of tree-shaped entities.
fn path_key(parent: Option<&str>, name: &str) -> String {
    match parent {
        Some(parent) => format!("{}/{}", parent.to_lowercase(), name.to_lowercase()),
        None => name.to_lowercase(),
    }
}

// ── Items ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Validate)]
pub struct CreateItem {
    #[garde(length(min = 1, max = 64))]
    pub sku: String,

    #[garde(length(min = 1, max = 200))]
    pub name: String,

    #[garde(length(max = 2000))]
    pub description: Option<String>,

    #[garde(length(min = 1, max = 100))]
    pub category: Option<String>,

    #[garde(length(min = 4, max = 64))]
    pub barcode: Option<String>,

    #[garde(range(min = 0))]
    pub min_stock_level: Option<i64>,

    #[garde(skip)]
    pub created_by: Option<Uuid>,
}

pub struct ItemMapper;

impl RowMapper for ItemMapper {
    fn entity_type(&self) -> EntityType {
        EntityType::Item
    }

    fn required_columns(&self) -> &'static [&'static str] {
        &["sku", "name"]
    }

    fn map(&self, row: &Row, tenant: &TenantContext) -> Result<EntityCommand, RowError> {
        let command = CreateItem {
            sku: required(row, "sku")?,
            name: required(row, "name")?,
            description: optional(row, "description"),
            category: optional(row, "category"),
            barcode: optional(row, "barcode"),
            min_stock_level: parse_optional(row, "min_stock_level")?,
            created_by: tenant.user_id,
        };
        validated(EntityType::Item, command.sku.clone(), command)
    }
}

// ── Inventory ───────────────────────────────────────────────────────

#[derive(Debug, Serialize, Validate)]
pub struct CreateInventory {
    #[garde(length(min = 1, max = 64))]
    pub sku: String,

    #[garde(length(min = 1, max = 200))]
    pub location: String,

    #[garde(length(min = 1, max = 200))]
    pub container: Option<String>,

    #[garde(range(min = 0, max = 1_000_000_000))]
    pub quantity: i64,

    #[garde(length(min = 1, max = 50))]
    pub condition: Option<String>,

    #[garde(length(max = 2000))]
    pub notes: Option<String>,

    #[garde(skip)]
    pub created_by: Option<Uuid>,
}

pub struct InventoryMapper;

impl RowMapper for InventoryMapper {
    fn entity_type(&self) -> EntityType {
        EntityType::Inventory
    }

    fn required_columns(&self) -> &'static [&'static str] {
        &["sku", "location", "quantity"]
    }

    fn map(&self, row: &Row, tenant: &TenantContext) -> Result<EntityCommand, RowError> {
        let command = CreateInventory {
            sku: required(row, "sku")?,
            location: required(row, "location")?,
            container: optional(row, "container"),
            quantity: parse_required(row, "quantity")?,
            condition: optional(row, "condition"),
            notes: optional(row, "notes"),
            created_by: tenant.user_id,
        };
        let key = match &command.container {
            Some(container) => format!(
                "{}@{}/{}",
                command.sku,
                command.location.to_lowercase(),
                container.to_lowercase()
            ),
            None => format!("{}@{}", command.sku, command.location.to_lowercase()),
        };
        validated(EntityType::Inventory, key, command)
    }
}

// ── Locations ───────────────────────────────────────────────────────

#[derive(Debug, Serialize, Validate)]
pub struct CreateLocation {
    #[garde(length(min = 1, max = 200))]
    pub name: String,

    #[garde(length(min = 1, max = 200))]
    pub parent: Option<String>,

    #[garde(length(max = 2000))]
    pub description: Option<String>,

    #[garde(skip)]
    pub created_by: Option<Uuid>,
}

pub struct LocationMapper;

impl RowMapper for LocationMapper {
    fn entity_type(&self) -> EntityType {
        EntityType::Location
    }

    fn required_columns(&self) -> &'static [&'static str] {
        &["name"]
    }

    fn map(&self, row: &Row, tenant: &TenantContext) -> Result<EntityCommand, RowError> {
        let command = CreateLocation {
            name: required(row, "name")?,
            parent: optional(row, "parent"),
            description: optional(row, "description"),
            created_by: tenant.user_id,
        };
        let key = path_key(command.parent.as_deref(), &command.name);
        validated(EntityType::Location, key, command)
    }
}

// ── Containers ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Validate)]
pub struct CreateContainer {
    #[garde(length(min = 1, max = 200))]
    pub name: String,

    #[garde(length(min = 1, max = 200))]
    pub location: String,

    #[garde(alphanumeric, length(min = 1, max = 32))]
    pub short_code: Option<String>,

    #[garde(range(min = 1))]
    pub capacity: Option<i64>,

    #[garde(length(max = 2000))]
    pub description: Option<String>,

    #[garde(skip)]
    pub created_by: Option<Uuid>,
}

pub struct ContainerMapper;

impl RowMapper for ContainerMapper {
    fn entity_type(&self) -> EntityType {
        EntityType::Container
    }

    fn required_columns(&self) -> &'static [&'static str] {
        &["name", "location"]
    }

    fn map(&self, row: &Row, tenant: &TenantContext) -> Result<EntityCommand, RowError> {
        let command = CreateContainer {
            name: required(row, "name")?,
            location: required(row, "location")?,
            short_code: optional(row, "short_code"),
            capacity: parse_optional(row, "capacity")?,
            description: optional(row, "description"),
            created_by: tenant.user_id,
        };
        let key = match &command.short_code {
            Some(code) => code.to_uppercase(),
            None => path_key(Some(&command.location), &command.name),
        };
        validated(EntityType::Container, key, command)
    }
}

// ── Categories ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Validate)]
pub struct CreateCategory {
    #[garde(length(min = 1, max = 100))]
    pub name: String,

    #[garde(length(min = 1, max = 100))]
    pub parent: Option<String>,

    #[garde(length(max = 2000))]
    pub description: Option<String>,

    #[garde(skip)]
    pub created_by: Option<Uuid>,
}

pub struct CategoryMapper;

impl RowMapper for CategoryMapper {
    fn entity_type(&self) -> EntityType {
        EntityType::Category
    }

    fn required_columns(&self) -> &'static [&'static str] {
        &["name"]
    }

    fn map(&self, row: &Row, tenant: &TenantContext) -> Result<EntityCommand, RowError> {
        let command = CreateCategory {
            name: required(row, "name")?,
            parent: optional(row, "parent"),
            description: optional(row, "description"),
            created_by: tenant.user_id,
        };
        let key = path_key(command.parent.as_deref(), &command.name);
        validated(EntityType::Category, key, command)
    }
}

// ── Borrowers ───────────────────────────────────────────────────────

#[derive(Debug, Serialize, Validate)]
pub struct CreateBorrower {
    #[garde(length(min = 1, max = 200))]
    pub name: String,

    #[garde(contains("@"), length(min = 3, max = 254))]
    pub email: Option<String>,

    #[garde(length(min = 3, max = 40))]
    pub phone: Option<String>,

    #[garde(length(max = 2000))]
    pub notes: Option<String>,

    #[garde(skip)]
    pub created_by: Option<Uuid>,
}

pub struct BorrowerMapper;

impl RowMapper for BorrowerMapper {
    fn entity_type(&self) -> EntityType {
        EntityType::Borrower
    }

    fn required_columns(&self) -> &'static [&'static str] {
        &["name"]
    }

    fn map(&self, row: &Row, tenant: &TenantContext) -> Result<EntityCommand, RowError> {
        let command = CreateBorrower {
            name: required(row, "name")?,
            email: optional(row, "email"),
            phone: optional(row, "phone"),
            notes: optional(row, "notes"),
            created_by: tenant.user_id,
        };
        let key = command
            .email
            .as_deref()
            .unwrap_or(&command.name)
            .to_lowercase();
        validated(EntityType::Borrower, key, command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::parser::Columns;
    use strum::IntoEnumIterator;

    fn row(headers: &[&str], values: &[&str]) -> Row {
        let columns = Columns::from_headers(headers.iter().map(|h| h.to_string()).collect())
            .unwrap();
        Row::new(
            1,
            Arc::new(columns),
            values.iter().map(|v| v.to_string()).collect(),
        )
    }

    fn tenant() -> TenantContext {
        TenantContext {
            workspace_id: Uuid::new_v4(),
            user_id: Some(Uuid::new_v4()),
        }
    }

    #[test]
    fn test_defaults_cover_every_entity_type() {
        let registry = MapperRegistry::with_defaults();
        for entity_type in EntityType::iter() {
            assert!(registry.get(entity_type).is_some(), "{}", entity_type);
        }
    }

    #[test]
    fn test_item_row_maps_to_command() {
        let row = row(
            &["SKU", "Name", "Min Stock Level"],
            &["HAM-01", "Claw hammer", "2"],
        );
        let command = ItemMapper.map(&row, &tenant()).unwrap();

        assert_eq!(command.entity_type, EntityType::Item);
        assert_eq!(command.natural_key, "HAM-01");
        assert_eq!(command.payload["name"], "Claw hammer");
        assert_eq!(command.payload["min_stock_level"], 2);
    }

    #[test]
    fn test_item_missing_name_is_field_error() {
        let row = row(&["sku", "name"], &["HAM-01", "  "]);
        let err = ItemMapper.map(&row, &tenant()).unwrap_err();
        assert_eq!(err.field_name.as_deref(), Some("name"));
    }

    #[test]
    fn test_inventory_rejects_negative_quantity() {
        let row = row(&["sku", "location", "quantity"], &["HAM-01", "Garage", "-3"]);
        let err = InventoryMapper.map(&row, &tenant()).unwrap_err();
        assert_eq!(err.field_name.as_deref(), Some("quantity"));
    }

    #[test]
    fn test_inventory_key_includes_container() {
        let row = row(
            &["sku", "location", "container", "quantity"],
            &["HAM-01", "Garage", "Red Bin", "4"],
        );
        let command = InventoryMapper.map(&row, &tenant()).unwrap();
        assert_eq!(command.natural_key, "HAM-01@garage/red bin");
    }

    #[test]
    fn test_location_key_is_path() {
        let row = row(&["name", "parent"], &["Shelf A", "Garage"]);
        let command = LocationMapper.map(&row, &tenant()).unwrap();
        assert_eq!(command.natural_key, "garage/shelf a");
    }

    #[test]
    fn test_container_short_code_must_be_alphanumeric() {
        let row = row(&["name", "location", "short_code"], &["Bin", "Garage", "B-1"]);
        let err = ContainerMapper.map(&row, &tenant()).unwrap_err();
        assert_eq!(err.field_name.as_deref(), Some("short_code"));
    }

    #[test]
    fn test_borrower_email_validated_and_used_as_key() {
        let ok = row(&["name", "email"], &["Sam", "Sam@Example.org"]);
        let command = BorrowerMapper.map(&ok, &tenant()).unwrap();
        assert_eq!(command.natural_key, "sam@example.org");

        let bad = row(&["name", "email"], &["Sam", "not-an-address"]);
        let err = BorrowerMapper.map(&bad, &tenant()).unwrap_err();
        assert_eq!(err.field_name.as_deref(), Some("email"));
    }

    #[test]
    fn test_unparseable_number_names_column() {
        let row = row(&["name", "location", "capacity"], &["Bin", "Garage", "lots"]);
        let err = ContainerMapper.map(&row, &tenant()).unwrap_err();
        assert_eq!(err.field_name.as_deref(), Some("capacity"));
        assert!(err.message.contains("lots"));
    }
}
