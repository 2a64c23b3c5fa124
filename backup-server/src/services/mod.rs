pub mod event_relay;
pub mod instance_lock;
pub mod maintenance;
pub mod schedules;
