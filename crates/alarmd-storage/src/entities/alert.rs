use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "alerts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub alert_id: String,
    #[sea_orm(indexed)]
    pub fingerprint: String,
    pub rule_id: Option<i64>,
    pub level: i64,
    pub title: String,
    #[sea_orm(column_type = "Text")]
    pub content: String,
    #[sea_orm(indexed)]
    pub status: String,
    pub operate: Option<String>,
    pub first_event_time: DateTimeWithTimeZone,
    pub last_event_time: DateTimeWithTimeZone,
    pub event_count: i64,
    pub group_by_field: String,
    pub is_session_alert: bool,
    pub session_status: Option<String>,
    pub session_end_time: Option<DateTimeWithTimeZone>,
    #[sea_orm(column_type = "Text")]
    pub team: String,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
