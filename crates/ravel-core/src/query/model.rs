// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Model metadata: the trusted schema the query builder interpolates identifiers from.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Storage kind of a model field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKind {
    /// Primary key. Integer ids are auto-generated; string ids are supplied.
    Id,
    /// Text of any length.
    Text,
    /// 64-bit integer.
    Integer,
    /// Floating point or fixed precision number.
    Decimal,
    /// Boolean.
    Boolean,
    /// Timestamp with time zone.
    Datetime,
    /// Calendar date.
    Date,
    /// Arbitrary JSON document.
    Json,
    /// Geographic point, stored with SRID 4326.
    Geometry,
    /// Foreign key to another model's id.
    Reference,
}

impl FieldKind {
    /// Whether arithmetic update operators make sense on this kind.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Decimal)
    }
}

/// A model field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    /// Column name.
    pub name: String,
    /// Storage kind.
    #[serde(rename = "type")]
    pub kind: FieldKind,
    /// Whether inserts must supply a value.
    #[serde(default)]
    pub required: bool,
    /// Target model of a reference field.
    #[serde(default)]
    pub references: Option<String>,
    /// Include in full-text search; defaults to true for text fields.
    #[serde(default)]
    pub searchable: Option<bool>,
}

impl Field {
    /// Create a field of the given kind.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            references: None,
            searchable: None,
        }
    }

    /// Whether full-text search covers this field.
    pub fn is_searchable(&self) -> bool {
        self.searchable.unwrap_or(self.kind == FieldKind::Text)
    }
}

/// A model: one table in a relational database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    /// Model id.
    #[serde(default)]
    pub iid: String,
    /// Model name used by application code.
    pub name: String,
    /// Table name; defaults to the model name.
    #[serde(default)]
    pub table: Option<String>,
    /// Fields in declaration order.
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl Model {
    /// Create a model with an integer `id` field.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            iid: String::new(),
            name: name.into(),
            table: None,
            fields: vec![Field::new("id", FieldKind::Id)],
        }
    }

    /// Append a field.
    pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field::new(name, kind));
        self
    }

    /// Append a reference field pointing at `target`.
    pub fn with_reference(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut field = Field::new(name, FieldKind::Reference);
        field.references = Some(target.into());
        self.fields.push(field);
        self
    }

    /// Override the table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Table name.
    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Name of the primary key field.
    pub fn id_field(&self) -> &str {
        self.fields
            .iter()
            .find(|f| f.kind == FieldKind::Id)
            .map(|f| f.name.as_str())
            .unwrap_or("id")
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

/// Models of one logical database, by name.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    models: HashMap<String, Model>,
}

impl Schema {
    /// Build a schema from models.
    pub fn new(models: impl IntoIterator<Item = Model>) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.name.clone(), m)).collect(),
        }
    }

    /// Look up a model by name.
    pub fn model(&self, name: &str) -> Option<&Model> {
        self.models.get(name)
    }

    /// Number of models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the schema has no models.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_from_json() {
        let model: Model = serde_json::from_value(json!({
            "iid": "m-1",
            "name": "orders",
            "fields": [
                {"name": "id", "type": "id"},
                {"name": "total", "type": "decimal", "required": true},
                {"name": "customer", "type": "reference", "references": "customers"},
                {"name": "location", "type": "geometry"}
            ]
        }))
        .unwrap();

        assert_eq!(model.table_name(), "orders");
        assert_eq!(model.id_field(), "id");
        assert!(model.field("total").unwrap().required);
        assert_eq!(
            model.field("customer").unwrap().references.as_deref(),
            Some("customers")
        );
        assert!(model.field("missing").is_none());
    }

    #[test]
    fn test_searchable_defaults() {
        let text = Field::new("title", FieldKind::Text);
        let number = Field::new("count", FieldKind::Integer);
        assert!(text.is_searchable());
        assert!(!number.is_searchable());

        let mut excluded = Field::new("secret", FieldKind::Text);
        excluded.searchable = Some(false);
        assert!(!excluded.is_searchable());
    }

    #[test]
    fn test_builder_and_schema() {
        let users = Model::new("users")
            .with_field("name", FieldKind::Text)
            .with_table("app_users");
        let posts = Model::new("posts").with_reference("author", "users");
        let schema = Schema::new([users, posts]);

        assert_eq!(schema.len(), 2);
        assert_eq!(schema.model("users").unwrap().table_name(), "app_users");
        let names: Vec<_> = schema.model("posts").unwrap().field_names().collect();
        assert_eq!(names, vec!["id", "author"]);
    }
}
