pub mod backup_run;
pub mod schedule;
