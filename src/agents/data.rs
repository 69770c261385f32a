//! 数据代理：选择目录查询、经缓存执行、组装 DataPayload
//!
//! 选择策略：领域词清晰且无回指 -> 确定性映射；否则（且开关打开）LLM 从
//! 目录 id 列表里挑选，坏 JSON 修复一次后仍失败就落回映射。单次最多 3 条，
//! 受限并发执行，部分失败可接受；全部失败才算阶段失败（data_unavailable）。

use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;
use crate::catalog::OutputKind;
use crate::dates::{describe_period, extract_comparison_periods, NamedPeriod};
use crate::error::EngineError;
use crate::executor::{Fragment, QueryExecutor, QueryOutcome, RowMap};
use crate::intent::{detect_domain, has_back_reference, normalize, Domain, RoutingDecision};
use crate::llm::{complete_json, LlmClient};
use crate::memory::Message;
use crate::payload::{ComparisonData, ComparisonPeriod, DataPayload, DatasetMeta};

/// 单次请求最多执行的查询条数
pub const MAX_QUERIES_PER_REQUEST: usize = 3;

/// 选定的查询计划
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub query_ids: Vec<String>,
    pub params: RowMap,
    /// heuristic / llm（进 agent_steps）
    pub source: &'static str,
}

/// 每条查询的执行报告（进 agent_steps，部分失败时也要可见）
#[derive(Debug, Clone)]
pub struct QueryReport {
    pub query_id: String,
    pub rows: usize,
    pub from_cache: bool,
    /// 失败时的错误类别 + 描述
    pub error: Option<String>,
}

/// 数据层输入
pub struct FetchRequest<'a> {
    pub question: &'a str,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub chat_context: &'a str,
    pub decision: &'a RoutingDecision,
    /// reflect 之后要避开的查询 id
    pub avoid_query_ids: &'a [String],
    pub today: NaiveDate,
}

/// LLM 查询选择的结构化输出
#[derive(Debug, Deserialize)]
struct LlmQueryPlan {
    query_ids: Vec<String>,
    #[serde(default)]
    params: Option<RowMap>,
}

enum TaskOutput {
    Single(QueryOutcome),
    Comparison(Box<ComparisonData>, Vec<DatasetMeta>),
}

/// 数据代理
pub struct DataAgent {
    executor: Arc<QueryExecutor>,
    cache: Arc<TtlCache<QueryOutcome>>,
    llm: Option<Arc<dyn LlmClient>>,
    use_llm_selection: bool,
    concurrency: usize,
}

impl DataAgent {
    pub fn new(
        executor: Arc<QueryExecutor>,
        cache: Arc<TtlCache<QueryOutcome>>,
        llm: Option<Arc<dyn LlmClient>>,
        use_llm_selection: bool,
        concurrency: usize,
    ) -> Self {
        Self {
            executor,
            cache,
            llm,
            use_llm_selection,
            concurrency: concurrency.max(1),
        }
    }

    // ============== 查询选择 ==============

    /// 确定性领域映射。规则顺序重要：对比在销售之前（"comparame ... ventas"），
    /// 库存在销售之前（"inventario" 含子串 "venta"）。
    pub fn select_heuristic(question_normalized: &str, domain: Domain) -> Vec<&'static str> {
        let q = question_normalized;
        let padded = format!(" {} ", q);

        // 周期对比
        if q.contains("compar") || padded.contains(" vs ") || q.contains("versus") {
            return vec!["kpi_sales_comparison", "ts_sales_by_day", "top_products_by_revenue"];
        }

        // Agente AI / interacciones
        if q.contains("agente")
            || q.contains("interacci")
            || q.contains("asistente")
            || padded.contains(" ai ")
            || padded.contains(" bot ")
        {
            let mut ids = vec!["ai_interactions_summary", "recent_ai_interactions"];
            if q.contains("escalad") {
                ids.push("escalated_cases");
            }
            return ids;
        }

        // Escalados
        if q.contains("escalad") {
            return vec!["escalated_cases", "ai_interactions_summary", "interactions_by_case_type"];
        }

        // Top / mas vendidos (antes de inventario para priorizar)
        if q.contains("mas vendido")
            || q.contains("top producto")
            || q.contains("mejores producto")
        {
            return vec!["kpi_sales_summary", "top_products_by_revenue"];
        }

        // Inventario / stock
        if q.contains("inventario") || q.contains("stock") || q.contains("existencia") {
            if q.contains("bajo") || q.contains("alerta") || q.contains("reponer") || q.contains("falta") || q.contains("critic") {
                return vec!["products_low_stock", "stock_alerts", "stock_reorder_analysis"];
            }
            return vec!["kpi_inventory_summary", "products_inventory", "stock_reorder_analysis"];
        }

        // Ventas / revenue
        if q.contains("venta")
            || q.contains("factura")
            || q.contains("ingreso")
            || q.contains("revenue")
            || q.contains("vendido")
            || q.contains("vendieron")
        {
            return vec!["kpi_sales_summary", "ts_sales_by_day", "top_products_by_revenue"];
        }

        // Productos genericos (sin señal de venta)
        if q.contains("producto") {
            return vec!["products_inventory", "products_low_stock"];
        }

        // Preventa
        if q.contains("preventa") || q.contains("consulta") || q.contains("pregunta") {
            return vec!["preventa_summary", "recent_preventa_queries"];
        }

        // Fallback por dominio de la decision
        match domain {
            Domain::Inventory => vec!["kpi_inventory_summary", "products_inventory", "stock_reorder_analysis"],
            Domain::Conversations => vec!["ai_interactions_summary", "recent_ai_interactions"],
            Domain::Sales | Domain::Unknown => vec!["kpi_sales_summary", "recent_orders"],
        }
    }

    async fn select_with_llm(&self, req: &FetchRequest<'_>) -> Result<QueryPlan, EngineError> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| EngineError::Llm("no llm configured".to_string()))?;

        let queries_list = self
            .executor
            .catalog()
            .descriptions()
            .iter()
            .map(|(id, desc)| format!("- {}: {}", id, desc))
            .collect::<Vec<_>>()
            .join("\n");

        let system = format!(
            "Eres un experto en analisis de datos de e-commerce.\n\n\
             ## QUERIES DISPONIBLES (SOLO puedes elegir de esta lista):\n{}\n\n\
             ## REGLAS\n\
             1. SOLO responde con JSON valido (sin markdown)\n\
             2. SOLO usa query_ids de la lista de arriba\n\
             3. Elige las queries MAS RELEVANTES (max {})\n\
             4. Para ventas: SIEMPRE incluir kpi_sales_summary\n\n\
             FORMATO JSON:\n{{\"query_ids\": [\"query_id1\", \"query_id2\"], \"params\": {{\"limit\": 10}}}}",
            queries_list, MAX_QUERIES_PER_REQUEST
        );

        let range = req
            .date_from
            .zip(req.date_to)
            .map(describe_period_pair)
            .unwrap_or_else(|| "ultimos 30 dias".to_string());

        let user = format!(
            "Pregunta del usuario: \"{}\"\nRango de fechas: {}\n{}\n\
             Responde SOLO con el JSON de queries a ejecutar.",
            req.question,
            range,
            if req.chat_context.is_empty() {
                String::new()
            } else {
                format!("Contexto previo:\n{}\n", req.chat_context)
            }
        );

        let messages = vec![Message::system(system), Message::user(user)];
        let out: LlmQueryPlan = complete_json(llm.as_ref(), &messages).await?;

        // 校验：id 必须存在于目录，多余的裁掉
        let mut ids: Vec<String> = out
            .query_ids
            .into_iter()
            .filter(|id| {
                let known = self.executor.catalog().lookup(id).is_some();
                if !known {
                    tracing::warn!(query_id = %id, "llm picked unknown query id, dropping");
                }
                known
            })
            .collect();
        ids.truncate(MAX_QUERIES_PER_REQUEST);

        if ids.is_empty() {
            return Err(EngineError::LlmParse("no valid query ids".to_string()));
        }

        Ok(QueryPlan {
            query_ids: ids,
            params: out.params.unwrap_or_default(),
            source: "llm",
        })
    }

    /// 选择查询：清晰领域走映射；歧义时（开关允许）问 LLM，失败回映射
    pub async fn select(&self, req: &FetchRequest<'_>) -> QueryPlan {
        let q = normalize(req.question);
        let clear_domain = detect_domain(&q) != Domain::Unknown && !has_back_reference(&q);

        if !clear_domain && self.use_llm_selection && self.llm.is_some() {
            match self.select_with_llm(req).await {
                Ok(plan) => return plan,
                Err(e) => {
                    tracing::warn!("llm query selection failed, using heuristics: {}", e);
                }
            }
        }

        let mut ids: Vec<String> = Self::select_heuristic(&q, req.decision.domain)
            .into_iter()
            .map(String::from)
            .collect();
        ids.truncate(MAX_QUERIES_PER_REQUEST);
        QueryPlan {
            query_ids: ids,
            params: RowMap::new(),
            source: "heuristic",
        }
    }

    // ============== 执行 ==============

    /// 主入口：选择 -> 执行 -> 组装。全部失败时 Err(DataUnavailable)。
    pub async fn fetch(
        &self,
        req: &FetchRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(DataPayload, QueryPlan, Vec<QueryReport>), EngineError> {
        let plan = self.select(req).await;

        // reflect 的调整：丢弃上一轮失败的 id，但不能丢到一条不剩
        let mut ids: Vec<String> = plan
            .query_ids
            .iter()
            .filter(|id| !req.avoid_query_ids.contains(id))
            .cloned()
            .collect();
        if ids.is_empty() {
            ids = plan.query_ids.clone();
        }

        // 基础参数：计划参数 + 显式日期范围
        let mut base_params = plan.params.clone();
        if let Some(from) = req.date_from {
            base_params.insert(
                "date_from".into(),
                serde_json::json!(from.format("%Y-%m-%d").to_string()),
            );
        }
        if let Some(to) = req.date_to {
            base_params.insert(
                "date_to".into(),
                serde_json::json!(to.format("%Y-%m-%d").to_string()),
            );
        }

        let results: Vec<(String, Result<TaskOutput, EngineError>)> =
            stream::iter(ids.iter().cloned().map(|id| {
                let base_params = base_params.clone();
                let cancel = cancel.clone();
                async move {
                    let out = self.run_one(&id, &base_params, req, &cancel).await;
                    (id, out)
                }
            }))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        // buffer_unordered 打乱完成顺序；按选择顺序重排后再组装
        let mut ordered: Vec<(String, Result<TaskOutput, EngineError>)> = Vec::new();
        let mut by_id: std::collections::HashMap<String, Result<TaskOutput, EngineError>> =
            results.into_iter().collect();
        for id in &ids {
            if let Some(out) = by_id.remove(id) {
                ordered.push((id.clone(), out));
            }
        }

        let mut payload = DataPayload::default();
        let mut reports = Vec::new();

        for (query_id, result) in ordered {
            match result {
                Ok(TaskOutput::Single(outcome)) => {
                    reports.push(QueryReport {
                        query_id: query_id.clone(),
                        rows: outcome.meta.row_count,
                        from_cache: outcome.meta.from_cache,
                        error: None,
                    });
                    self.fold(&mut payload, &query_id, outcome);
                }
                Ok(TaskOutput::Comparison(data, metas)) => {
                    reports.push(QueryReport {
                        query_id: query_id.clone(),
                        rows: metas.iter().map(|m| m.row_count).sum(),
                        from_cache: metas.iter().all(|m| m.from_cache),
                        error: None,
                    });
                    payload.datasets_meta.extend(metas);
                    // 当前周期的 KPI 也进 payload.kpis，让 KPI 卡能带 delta 渲染
                    payload.merge_kpis("comparison", data.current_period.kpis.clone());
                    payload.comparison = Some(*data);
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    tracing::warn!(query_id = %query_id, "query failed: {}", e);
                    reports.push(QueryReport {
                        query_id: query_id.clone(),
                        rows: 0,
                        from_cache: false,
                        error: Some(format!("{}: {}", e.kind(), e)),
                    });
                }
            }
        }

        // 全部失败或全部空结果：没有任何 ref 可用才算阶段失败
        if payload.available_refs.is_empty() {
            let failed = reports.iter().filter(|r| r.error.is_some()).count();
            return Err(EngineError::DataUnavailable(format!(
                "{} of {} queries failed, no refs produced",
                failed,
                reports.len()
            )));
        }

        Ok((payload, plan, reports))
    }

    /// 单条查询：经缓存执行；comparison 条目跑两个周期
    async fn run_one(
        &self,
        query_id: &str,
        base_params: &RowMap,
        req: &FetchRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput, EngineError> {
        let entry_kind = self
            .executor
            .catalog()
            .lookup(query_id)
            .map(|e| e.output_kind)
            .ok_or_else(|| EngineError::UnknownQuery(query_id.to_string()))?;

        if entry_kind == OutputKind::Comparison {
            return self.run_comparison(query_id, req, cancel).await;
        }

        let outcome = self
            .cached_execute(query_id, base_params, req.today, cancel)
            .await?;
        Ok(TaskOutput::Single(outcome))
    }

    async fn cached_execute(
        &self,
        query_id: &str,
        params: &RowMap,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, EngineError> {
        let key = self.executor.cache_key_for(query_id, params, today)?;
        let executor = self.executor.clone();
        let (mut outcome, from_cache) = self
            .cache
            .get_or_fetch(&key, || async move {
                executor.execute(query_id, params, today, cancel).await
            })
            .await?;
        outcome.meta.from_cache = from_cache;
        Ok(outcome)
    }

    /// comparison 条目：当前周期 + 上一周期各执行一次 KPI 模板并算差值
    async fn run_comparison(
        &self,
        query_id: &str,
        req: &FetchRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput, EngineError> {
        let (current, previous) = extract_comparison_periods(req.question, req.today)
            .unwrap_or_else(|| derive_adjacent_periods(req.date_from, req.date_to, req.today));

        let mut metas = Vec::new();
        let mut period_kpis = Vec::new();

        for period in [&current, &previous] {
            let mut params = RowMap::new();
            params.insert(
                "date_from".into(),
                serde_json::json!(period.from.format("%Y-%m-%d").to_string()),
            );
            params.insert(
                "date_to".into(),
                serde_json::json!(period.to.format("%Y-%m-%d").to_string()),
            );
            let outcome = self
                .cached_execute(query_id, &params, req.today, cancel)
                .await?;
            let kpis = match &outcome.fragment {
                Fragment::Kpis(k) => k.clone(),
                _ => Default::default(),
            };
            metas.push(outcome.meta);
            period_kpis.push(ComparisonPeriod {
                label: period.label.clone(),
                date_from: period.from.format("%Y-%m-%d").to_string(),
                date_to: period.to.format("%Y-%m-%d").to_string(),
                kpis,
            });
        }

        let previous_kpis = period_kpis.pop().expect("two periods");
        let current_kpis = period_kpis.pop().expect("two periods");
        let data = ComparisonData::build(current_kpis, previous_kpis);
        Ok(TaskOutput::Comparison(Box::new(data), metas))
    }

    /// 片段折叠进 payload；Empty 只留 meta，不登记 ref
    fn fold(&self, payload: &mut DataPayload, query_id: &str, outcome: QueryOutcome) {
        let entry_ref = self
            .executor
            .catalog()
            .lookup(query_id)
            .map(|e| e.output_ref)
            .unwrap_or("unknown");

        payload.datasets_meta.push(outcome.meta);

        match outcome.fragment {
            Fragment::Kpis(kpis) => payload.merge_kpis(entry_ref, kpis),
            Fragment::TimeSeries(ts) => {
                payload.time_series.push(ts);
                payload.push_ref(entry_ref);
            }
            Fragment::TopItems(top) => {
                payload.top_items.push(top);
                payload.push_ref(entry_ref);
            }
            Fragment::Table(table) => {
                payload.tables.push(table);
                payload.push_ref(entry_ref);
            }
            Fragment::Empty => {
                tracing::debug!(query_id = %query_id, "empty result, ref not registered");
            }
        }
    }
}

fn describe_period_pair((from, to): (NaiveDate, NaiveDate)) -> String {
    describe_period(Some((from, to)))
}

/// 问题里没有两个月份时：上一周期 = 紧邻的等长周期
fn derive_adjacent_periods(
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    today: NaiveDate,
) -> (NamedPeriod, NamedPeriod) {
    let from = date_from.unwrap_or(today - Duration::days(30));
    let to = date_to.unwrap_or(today + Duration::days(1));
    let len = to - from;
    let current = NamedPeriod {
        from,
        to,
        label: describe_period(Some((from, to))),
    };
    let previous = NamedPeriod {
        from: from - len,
        to: from,
        label: describe_period(Some((from - len, from))),
    };
    (current, previous)
}
