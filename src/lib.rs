//! oxledger - 托管结算引擎
//!
//! 游戏币/真实货币双余额账本、对局押注托管与结算、比特币充值入账与提现出款

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod repository;
pub mod service;

// 重新导出常用类型
pub use app_state::AppState;
pub use error::EngineError;
