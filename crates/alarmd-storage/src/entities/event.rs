use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub event_id: String,
    #[sea_orm(indexed)]
    pub external_id: Option<String>,
    pub title: String,
    #[sea_orm(column_type = "Text")]
    pub description: String,
    pub level: i64,
    pub service: Option<String>,
    pub location: Option<String>,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,
    pub resource_type: Option<String>,
    pub event_type: Option<String>,
    pub item: Option<String>,
    pub source: Option<String>,
    /// JSON object.
    #[sea_orm(column_type = "Text")]
    pub labels: String,
    /// JSON object.
    #[sea_orm(column_type = "Text")]
    pub tags: String,
    #[sea_orm(indexed)]
    pub received_at: DateTimeWithTimeZone,
    pub action: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
