//! # HisLink Core
//!
//! 医院信息系统集成的核心模块，提供连接器数据模型、错误定义和通用工具。

pub mod error;
pub mod models;
pub mod utils;

pub use error::{ConnectorError, Result};
pub use models::*;
