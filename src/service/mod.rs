//! # 调度服务模块
//!
//! 预处理、候选查询、负载均衡转发、流处理与审计落库

pub mod before;
pub mod chat;
pub mod process;
pub mod record;

pub use before::{Before, before_for_style};
pub use chat::{
    ProvidersWithMeta, ReqMeta, StreamContext, balance_chat, build_headers,
    providers_with_meta_by_model_name,
};
pub use process::{
    OutputUnion, ProcessError, ProcessStats, StreamError, Usage, classify_process_error,
};
pub use record::{ChatLogRow, process_for_style, record_cache_hit, record_log, save_chat_log};
