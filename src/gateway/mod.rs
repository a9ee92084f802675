//! 对外接口层：HTTP 路由与服务启动

pub mod http;

pub use http::{router, serve, ApiError, ErrorResponse};
