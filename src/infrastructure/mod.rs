pub mod db;
pub mod distributed_lock;
pub mod health;
pub mod keyed_lock;
pub mod logging;
