use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "alarm_strategies")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    pub priority: i32,
    #[sea_orm(column_type = "Text")]
    pub match_rules: String,
    #[sea_orm(column_type = "Text")]
    pub params: String,
    pub auto_close: bool,
    pub close_minutes: i64,
    #[sea_orm(column_type = "Text")]
    pub dispatch_team: String,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
