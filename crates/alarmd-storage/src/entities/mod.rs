pub mod alarm_strategy;
pub mod alert;
pub mod alert_event;
pub mod event;
pub mod operator_log;
