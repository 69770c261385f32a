//! 管线中的两个重型阶段：数据代理与看板构建

pub mod data;
pub mod narrative;
pub mod presentation;

pub use data::{DataAgent, FetchRequest, QueryPlan, QueryReport, MAX_QUERIES_PER_REQUEST};
pub use presentation::{BuildInput, PresentationBuilder};
