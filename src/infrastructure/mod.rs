pub mod admission_lock;
pub mod db;
pub mod encryption;
pub mod event_bus;
pub mod key_store;
pub mod logging;
