//! 查询执行层：参数规范化、目录模板的安全调用与结果整形
//!
//! SQL 只在这里被触碰：模板来自目录常量，参数按位绑定，引擎其余部分
//! 看不到 SQL 文本。规范化（应用默认值、丢弃未知参数、日期归一 ISO-8601、
//! 键排序）同时服务于调用与缓存键，保证逻辑相等的参数产生相同的键。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Row, TypeInfo};
use tokio_util::sync::CancellationToken;

use crate::catalog::{CatalogEntry, OutputKind, ParamDefault, ParamType, QueryCatalog};
use crate::error::EngineError;
use crate::payload::{DatasetMeta, TableData, TimeSeriesData, TimeSeriesPoint, TopItem, TopItemsData};

pub type RowMap = serde_json::Map<String, Value>;

/// 规范化后的参数值
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Date(NaiveDate),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(s) => write!(f, "{}", s),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

/// 规范化参数：BTreeMap 保证键序确定
pub type CanonicalParams = BTreeMap<String, ParamValue>;

/// 目录条目执行后的类型化片段
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Kpis(BTreeMap<String, f64>),
    TimeSeries(TimeSeriesData),
    TopItems(TopItemsData),
    Table(TableData),
    /// 形状约束被违反（如 KPI 查询零行）：empty_result，不算错误
    Empty,
}

/// 一次执行的结果：片段 + 元数据
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub fragment: Fragment,
    pub meta: DatasetMeta,
}

/// SQL 传输层接口：Postgres 为生产实现，DemoBackend 供演示与测试
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn fetch_rows(
        &self,
        entry: &CatalogEntry,
        params: &CanonicalParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<RowMap>, EngineError>;

    /// 健康检查
    async fn ping(&self) -> bool;
}

// ============== 参数规范化 ==============

/// 应用默认值、丢弃未知参数、校验类型与白名单，返回键序确定的参数表
pub fn canonicalize(
    entry: &CatalogEntry,
    user_params: &RowMap,
    today: NaiveDate,
) -> Result<CanonicalParams, EngineError> {
    let mut out = CanonicalParams::new();

    for spec in &entry.params {
        match spec.default {
            ParamDefault::None => {}
            ParamDefault::Int(v) => {
                out.insert(spec.name.to_string(), ParamValue::Int(v));
            }
            ParamDefault::Str(s) => {
                out.insert(spec.name.to_string(), ParamValue::Str(s.to_string()));
            }
            ParamDefault::DaysAgo(n) => {
                out.insert(
                    spec.name.to_string(),
                    ParamValue::Date(today - chrono::Duration::days(n)),
                );
            }
            ParamDefault::DaysAhead(n) => {
                out.insert(
                    spec.name.to_string(),
                    ParamValue::Date(today + chrono::Duration::days(n)),
                );
            }
        }
    }

    for (name, value) in user_params {
        let Some(spec) = entry.param(name) else {
            tracing::warn!(query_id = entry.id, param = %name, "dropping unknown param");
            continue;
        };
        if value.is_null() {
            continue;
        }
        let parsed = coerce(spec.ty, value).ok_or_else(|| EngineError::InvalidParams {
            query_id: entry.id.to_string(),
            reason: format!("param '{}' is not a valid {:?}", name, spec.ty),
        })?;
        if let (Some(allowed), ParamValue::Str(s)) = (spec.allowed, &parsed) {
            if !allowed.contains(&s.as_str()) {
                return Err(EngineError::InvalidParams {
                    query_id: entry.id.to_string(),
                    reason: format!("param '{}' value not allowed", name),
                });
            }
        }
        out.insert(name.clone(), parsed);
    }

    for spec in &entry.params {
        if spec.required && !out.contains_key(spec.name) {
            return Err(EngineError::InvalidParams {
                query_id: entry.id.to_string(),
                reason: format!("missing required param '{}'", spec.name),
            });
        }
    }

    Ok(out)
}

fn coerce(ty: ParamType, value: &Value) -> Option<ParamValue> {
    match ty {
        ParamType::Integer => match value {
            Value::Number(n) => n.as_i64().map(ParamValue::Int),
            Value::String(s) => s.trim().parse::<i64>().ok().map(ParamValue::Int),
            _ => None,
        },
        ParamType::String => value.as_str().map(|s| ParamValue::Str(s.to_string())),
        ParamType::Date => {
            let s = value.as_str()?;
            // 接受 ISO 日期或带时间的前缀
            let prefix = s.get(..10).unwrap_or(s);
            NaiveDate::parse_from_str(prefix, "%Y-%m-%d")
                .ok()
                .map(ParamValue::Date)
        }
    }
}

/// 缓存键：query_id + 规范化参数的确定性序列化
pub fn cache_key(entry_id: &str, params: &CanonicalParams) -> String {
    let mut key = String::from(entry_id);
    for (name, value) in params {
        key.push('|');
        key.push_str(name);
        key.push('=');
        key.push_str(&value.to_string());
    }
    key
}

/// 供日志使用的参数摘要；sensitive 参数只打名字不打值
fn param_summary(entry: &CatalogEntry, params: &CanonicalParams) -> String {
    params
        .iter()
        .map(|(name, value)| {
            let sensitive = entry.param(name).map(|s| s.sensitive).unwrap_or(false);
            if sensitive {
                format!("{}=<redacted>", name)
            } else {
                format!("{}={}", name, value)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============== 结果整形 ==============

fn num(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// ref 的末段作为数据集名（ts.sales_by_day -> sales_by_day）
fn ref_suffix(output_ref: &str) -> String {
    output_ref
        .rsplit('.')
        .next()
        .unwrap_or(output_ref)
        .to_string()
}

/// 行集 -> 按 output_kind 整形的片段；零行报 Empty（empty_result）
pub fn marshal(entry: &CatalogEntry, rows: Vec<RowMap>) -> Fragment {
    if rows.is_empty() {
        return Fragment::Empty;
    }

    match entry.output_kind {
        OutputKind::Kpi | OutputKind::Comparison => {
            let mut kpis = BTreeMap::new();
            for (name, value) in &rows[0] {
                if let Some(v) = num(value) {
                    kpis.insert(name.clone(), v);
                }
            }
            if kpis.is_empty() {
                Fragment::Empty
            } else {
                Fragment::Kpis(kpis)
            }
        }
        OutputKind::TimeSeries => Fragment::TimeSeries(TimeSeriesData {
            series_name: ref_suffix(entry.output_ref),
            points: rows
                .iter()
                .map(|row| TimeSeriesPoint {
                    date: text(row.get("date").unwrap_or(&Value::Null)),
                    value: row.get("value").and_then(num).unwrap_or(0.0),
                    label: row.get("label").and_then(|v| v.as_str()).map(String::from),
                })
                .collect(),
        }),
        OutputKind::TopItems => Fragment::TopItems(TopItemsData {
            ranking_name: ref_suffix(entry.output_ref),
            metric: "revenue".to_string(),
            items: rows
                .iter()
                .enumerate()
                .map(|(i, row)| {
                    let mut extra = RowMap::new();
                    for (k, v) in row {
                        if !matches!(k.as_str(), "rank" | "id" | "title" | "value") {
                            extra.insert(k.clone(), v.clone());
                        }
                    }
                    TopItem {
                        rank: row
                            .get("rank")
                            .and_then(|v| v.as_i64())
                            .unwrap_or(i as i64 + 1) as u32,
                        id: text(row.get("id").unwrap_or(&Value::Null)),
                        title: text(row.get("title").unwrap_or(&Value::Null)),
                        value: row.get("value").and_then(num).unwrap_or(0.0),
                        extra: if extra.is_empty() { None } else { Some(extra) },
                    }
                })
                .collect(),
        }),
        OutputKind::Table => Fragment::Table(TableData {
            name: ref_suffix(entry.output_ref),
            rows,
        }),
    }
}

// ============== 执行器 ==============

/// 目录条目执行器：唯一的 execute 入口
pub struct QueryExecutor {
    catalog: Arc<QueryCatalog>,
    backend: Arc<dyn QueryBackend>,
}

impl QueryExecutor {
    pub fn new(catalog: Arc<QueryCatalog>, backend: Arc<dyn QueryBackend>) -> Self {
        Self { catalog, backend }
    }

    pub fn catalog(&self) -> &QueryCatalog {
        &self.catalog
    }

    pub fn backend(&self) -> &Arc<dyn QueryBackend> {
        &self.backend
    }

    /// 规范化参数并计算缓存键
    pub fn cache_key_for(
        &self,
        id: &str,
        user_params: &RowMap,
        today: NaiveDate,
    ) -> Result<String, EngineError> {
        let entry = self
            .catalog
            .lookup(id)
            .ok_or_else(|| EngineError::UnknownQuery(id.to_string()))?;
        let params = canonicalize(entry, user_params, today)?;
        Ok(cache_key(entry.id, &params))
    }

    /// 执行一条目录查询：校验 -> 规范化 -> 调用后端 -> 整形
    pub async fn execute(
        &self,
        id: &str,
        user_params: &RowMap,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, EngineError> {
        let entry = self
            .catalog
            .lookup(id)
            .ok_or_else(|| EngineError::UnknownQuery(id.to_string()))?;
        let params = canonicalize(entry, user_params, today)?;

        tracing::debug!(
            query_id = entry.id,
            params = %param_summary(entry, &params),
            "executing catalog query"
        );

        let started = Instant::now();
        let rows = self.backend.fetch_rows(entry, &params, cancel).await?;
        let row_count = rows.len();
        let fragment = marshal(entry, rows);

        Ok(QueryOutcome {
            fragment,
            meta: DatasetMeta {
                query_id: entry.id.to_string(),
                row_count,
                execution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                from_cache: false,
                executed_at: Utc::now(),
            },
        })
    }
}

// ============== Postgres 后端 ==============

/// 生产后端：sqlx PgPool 上按位绑定执行模板
pub struct PgBackend {
    pool: PgPool,
    timeout: Duration,
}

impl PgBackend {
    pub fn new(pool: PgPool, timeout_seconds: u64) -> Self {
        Self {
            pool,
            timeout: Duration::from_secs(timeout_seconds),
        }
    }

    fn row_to_map(row: &PgRow) -> RowMap {
        let mut map = RowMap::new();
        for col in row.columns() {
            let idx = col.ordinal();
            let value = match col.type_info().name() {
                "INT8" => row
                    .try_get::<Option<i64>, _>(idx)
                    .ok()
                    .flatten()
                    .map(Value::from),
                "INT4" => row
                    .try_get::<Option<i32>, _>(idx)
                    .ok()
                    .flatten()
                    .map(Value::from),
                "INT2" => row
                    .try_get::<Option<i16>, _>(idx)
                    .ok()
                    .flatten()
                    .map(Value::from),
                "FLOAT8" => row
                    .try_get::<Option<f64>, _>(idx)
                    .ok()
                    .flatten()
                    .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number)),
                "FLOAT4" => row
                    .try_get::<Option<f32>, _>(idx)
                    .ok()
                    .flatten()
                    .and_then(|f| serde_json::Number::from_f64(f as f64).map(Value::Number)),
                "BOOL" => row
                    .try_get::<Option<bool>, _>(idx)
                    .ok()
                    .flatten()
                    .map(Value::from),
                "DATE" => row
                    .try_get::<Option<NaiveDate>, _>(idx)
                    .ok()
                    .flatten()
                    .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
                "TIMESTAMPTZ" => row
                    .try_get::<Option<chrono::DateTime<Utc>>, _>(idx)
                    .ok()
                    .flatten()
                    .map(|t| Value::String(t.to_rfc3339())),
                "TIMESTAMP" => row
                    .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
                    .ok()
                    .flatten()
                    .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S").to_string())),
                _ => row
                    .try_get::<Option<String>, _>(idx)
                    .ok()
                    .flatten()
                    .map(Value::String),
            };
            map.insert(col.name().to_string(), value.unwrap_or(Value::Null));
        }
        map
    }

    fn map_sqlx_error(e: sqlx::Error) -> EngineError {
        match e {
            sqlx::Error::Database(db) => EngineError::UpstreamError(db.message().to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                EngineError::UpstreamUnavailable(e.to_string())
            }
            other => EngineError::UpstreamError(other.to_string()),
        }
    }
}

#[async_trait]
impl QueryBackend for PgBackend {
    async fn fetch_rows(
        &self,
        entry: &CatalogEntry,
        params: &CanonicalParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<RowMap>, EngineError> {
        let mut query = sqlx::query(entry.template);
        for bind in entry.binds {
            match params.get(*bind) {
                Some(ParamValue::Int(i)) => query = query.bind(*i),
                Some(ParamValue::Str(s)) => query = query.bind(s.clone()),
                Some(ParamValue::Date(d)) => query = query.bind(*d),
                None => {
                    return Err(EngineError::InvalidParams {
                        query_id: entry.id.to_string(),
                        reason: format!("missing bind '{}'", bind),
                    })
                }
            }
        }

        let fetch = query.fetch_all(&self.pool);
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            res = tokio::time::timeout(self.timeout, fetch) => match res {
                Err(_) => Err(EngineError::UpstreamTimeout(self.timeout.as_secs())),
                Ok(Err(e)) => Err(Self::map_sqlx_error(e)),
                Ok(Ok(rows)) => Ok(rows.iter().map(Self::row_to_map).collect()),
            },
        }
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

// ============== Demo 后端 ==============

/// 演示/测试后端：按 query id 返回固定行集，可脚本化失败与空结果。
/// 无数据库时也能完整跑通管线（demo 模式）。
#[derive(Default)]
pub struct DemoBackend {
    failures: std::collections::HashMap<String, EngineError>,
    empty: std::collections::HashSet<String>,
}

impl DemoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定某条查询固定失败
    pub fn with_failure(mut self, query_id: &str, error: EngineError) -> Self {
        self.failures.insert(query_id.to_string(), error);
        self
    }

    /// 指定某条查询返回零行
    pub fn with_empty(mut self, query_id: &str) -> Self {
        self.empty.insert(query_id.to_string());
        self
    }

    /// 所有查询都失败（data_unavailable 场景）
    pub fn all_failing(catalog: &QueryCatalog, error: EngineError) -> Self {
        let mut backend = Self::new();
        for entry in catalog.iter() {
            backend
                .failures
                .insert(entry.id.to_string(), error.clone());
        }
        backend
    }

    fn demo_rows(entry: &CatalogEntry) -> Vec<RowMap> {
        let json = match entry.id {
            "kpi_sales_summary" | "kpi_sales_comparison" => serde_json::json!([{
                "total_sales": 4_523_800.0,
                "total_orders": 342,
                "avg_order_value": 13227.49,
                "total_units": 489
            }]),
            "ts_sales_by_day" => serde_json::json!([
                {"date": "2025-11-03", "value": 120_500.0, "order_count": 9},
                {"date": "2025-11-04", "value": 145_200.0, "order_count": 11},
                {"date": "2025-11-05", "value": 98_700.0, "order_count": 8},
                {"date": "2025-11-06", "value": 171_300.0, "order_count": 14},
                {"date": "2025-11-07", "value": 189_900.0, "order_count": 15}
            ]),
            "sales_by_month" => serde_json::json!([
                {"date": "2025-09", "value": 3_890_000.0, "order_count": 301},
                {"date": "2025-10", "value": 4_120_000.0, "order_count": 315},
                {"date": "2025-11", "value": 4_523_800.0, "order_count": 342}
            ]),
            "top_products_by_revenue" => serde_json::json!([
                {"rank": 1, "id": "MLA111", "title": "Auriculares BT Pro", "value": 1_890_000.0, "units_sold": 120},
                {"rank": 2, "id": "MLA222", "title": "Teclado Mecanico RGB", "value": 960_400.0, "units_sold": 64},
                {"rank": 3, "id": "MLA333", "title": "Mouse Inalambrico", "value": 402_300.0, "units_sold": 89}
            ]),
            "top_products_by_sales" => serde_json::json!([
                {"rank": 1, "id": "MLA111", "title": "Auriculares BT Pro", "value": 120.0, "units_sold": 120},
                {"rank": 2, "id": "MLA333", "title": "Mouse Inalambrico", "value": 89.0, "units_sold": 89}
            ]),
            "recent_orders" => serde_json::json!([
                {"id": "ORD-9001", "buyer_nickname": "COMPRADOR_A", "item_title": "Auriculares BT Pro", "total_amount": 15800.0, "quantity": 1, "status": "paid", "shipping_status": "shipped", "date_created": "2025-11-07T14:03:00Z"},
                {"id": "ORD-9002", "buyer_nickname": "COMPRADOR_B", "item_title": "Teclado Mecanico RGB", "total_amount": 30100.0, "quantity": 2, "status": "paid", "shipping_status": "pending", "date_created": "2025-11-07T11:40:00Z"}
            ]),
            "products_inventory" => serde_json::json!([
                {"id": "MLA111", "title": "Auriculares BT Pro", "sku": "AUR-01", "price": 15800.0, "stock": 42, "status": "active", "total_sold": 120},
                {"id": "MLA222", "title": "Teclado Mecanico RGB", "sku": "TEC-02", "price": 15050.0, "stock": 18, "status": "active", "total_sold": 64}
            ]),
            "products_low_stock" => serde_json::json!([
                {"id": "MLA444", "title": "Cable USB-C 2m", "sku": "CAB-04", "price": 1900.0, "stock": 3, "status": "active"},
                {"id": "MLA555", "title": "Funda Notebook 15", "sku": "FUN-05", "price": 5400.0, "stock": 6, "status": "active"}
            ]),
            "kpi_inventory_summary" => serde_json::json!([{
                "critical_count": 3,
                "warning_count": 7,
                "ok_count": 140,
                "total_products": 150,
                "avg_days_cover": 24.5
            }]),
            "stock_alerts" => serde_json::json!([
                {"id": "MLA444", "title": "Cable USB-C 2m", "stock": 3, "days_cover": 2.1, "severity": "critical", "reorder_date": "2025-11-10"},
                {"id": "MLA555", "title": "Funda Notebook 15", "stock": 6, "days_cover": 6.8, "severity": "warning", "reorder_date": "2025-11-15"}
            ]),
            "stock_reorder_analysis" => serde_json::json!([
                {"id": "MLA444", "title": "Cable USB-C 2m", "stock": 3, "daily_sales_rate": 1.4, "days_cover": 2.1, "reorder_date": "2025-11-10", "severity": "critical"},
                {"id": "MLA666", "title": "Soporte Monitor", "stock": 12, "daily_sales_rate": 0.9, "days_cover": 13.3, "reorder_date": "2025-11-20", "severity": "warning"}
            ]),
            "ai_interactions_summary" => serde_json::json!([{
                "total_interactions": 230,
                "escalated_count": 18,
                "escalation_rate": 7.8,
                "auto_responded": 212,
                "auto_response_rate": 92.2
            }]),
            "recent_ai_interactions" => serde_json::json!([
                {"id": 501, "buyer_nickname": "COMPRADOR_C", "status": "resolved", "case_type": "envio", "last_message_at": "2025-11-07T10:12:00Z"},
                {"id": 502, "buyer_nickname": "COMPRADOR_D", "status": "pending", "case_type": "producto", "last_message_at": "2025-11-07T09:55:00Z"}
            ]),
            "escalated_cases" => serde_json::json!([
                {"id": 71, "buyer_nickname": "COMPRADOR_E", "buyer_message": "No llego mi pedido", "reason": "sin tracking", "case_type": "envio", "status": "pending", "priority": "high", "created_at": "2025-11-06T18:21:00Z"}
            ]),
            "interactions_by_case_type" => serde_json::json!([
                {"rank": 1, "id": "envio", "title": "Envio", "value": 9.0},
                {"rank": 2, "id": "producto", "title": "Producto", "value": 6.0},
                {"rank": 3, "id": "devolucion", "title": "Devolucion", "value": 3.0}
            ]),
            "preventa_summary" => serde_json::json!([{
                "total_queries": 48,
                "answered": 41,
                "pending": 7,
                "answer_rate": 85.4
            }]),
            "recent_preventa_queries" => serde_json::json!([
                {"id": 11, "buyer_nickname": "COMPRADOR_F", "question": "Hacen envios a Cordoba?", "status": "answered", "created_at": "2025-11-07T08:30:00Z"}
            ]),
            _ => serde_json::json!([]),
        };

        match json {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        }
    }
}

#[async_trait]
impl QueryBackend for DemoBackend {
    async fn fetch_rows(
        &self,
        entry: &CatalogEntry,
        _params: &CanonicalParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<RowMap>, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if let Some(err) = self.failures.get(entry.id) {
            return Err(err.clone());
        }
        if self.empty.contains(entry.id) {
            return Ok(vec![]);
        }
        Ok(Self::demo_rows(entry))
    }

    async fn ping(&self) -> bool {
        true
    }
}
