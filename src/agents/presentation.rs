//! 看板构建：DataPayload -> DashboardSpec
//!
//! 结构完全确定性（LLM 只参与叙事，且默认关闭）。槽位规则：
//! - KPI 卡最多 4 张，按固定指标优先级，剩余按字典序补位
//! - 尽量凑满 2 张图：时间序列出折线/面积，排行出柱状/饼图，
//!   只有一个家族时从该家族再出一张
//! - 有对比数据时加 comparison_bar
//! - 每个明细表出一个 table 槽位（reduced 模式下略去）
//!
//! 不变量：产出的每个 value_ref / dataset_ref 必须在 available_refs 里；
//! 违反视为编程错误，开发构建直接断言，发布构建过滤并记错误日志。

use std::sync::Arc;

use chrono::{NaiveDate, Utc};

use crate::agents::narrative;
use crate::dashboard::{
    ChartConfig, ChartSlot, ComparisonChartConfig, DashboardSpec, KpiCard, KpiFormat,
    NarrativeBlock, Slots, TableSlotConfig,
};
use crate::error::EngineError;
use crate::intent::normalize;
use crate::llm::LlmClient;
use crate::payload::DataPayload;

/// KPI 卡上限
const MAX_KPI_CARDS: usize = 4;
/// 表格槽位行数上限
const TABLE_MAX_ROWS: u32 = 10;
/// 表格列数上限
const TABLE_MAX_COLUMNS: usize = 5;

/// 指标 -> 标签与格式的固定优先级表
const KPI_PRIORITY: &[(&str, &str, KpiFormat)] = &[
    ("total_sales", "Ventas Totales", KpiFormat::Currency),
    ("total_orders", "Ordenes", KpiFormat::Number),
    ("avg_order_value", "Ticket Promedio", KpiFormat::Currency),
    ("total_units", "Unidades", KpiFormat::Number),
    ("total_interactions", "Total Interacciones", KpiFormat::Number),
    ("escalated_count", "Casos Escalados", KpiFormat::Number),
    ("escalation_rate", "Tasa Escalamiento", KpiFormat::Percent),
    ("auto_responded", "Auto-Respondidas", KpiFormat::Number),
    ("auto_response_rate", "Tasa Auto-Respuesta", KpiFormat::Percent),
    ("critical_count", "Stock Critico", KpiFormat::Number),
    ("warning_count", "En Alerta", KpiFormat::Number),
    ("total_products", "Productos", KpiFormat::Number),
    ("avg_days_cover", "Dias de Cobertura", KpiFormat::Number),
    ("total_queries", "Consultas Totales", KpiFormat::Number),
    ("answered", "Respondidas", KpiFormat::Number),
    ("pending", "Pendientes", KpiFormat::Number),
    ("answer_rate", "Tasa Respuesta", KpiFormat::Percent),
];

/// 对比图的指标顺序
const COMPARISON_METRICS: &[&str] = &["total_sales", "total_orders", "avg_order_value", "total_units"];

/// 构建输入
pub struct BuildInput<'a> {
    pub question: &'a str,
    pub payload: &'a DataPayload,
    pub period_label: &'a str,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    /// presentation_error 重试：缩减槽位（solo KPI + 2 graficos）
    pub reduced: bool,
}

/// 看板构建器
pub struct PresentationBuilder {
    llm: Option<Arc<dyn LlmClient>>,
    use_llm_narrative: bool,
}

impl PresentationBuilder {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, use_llm_narrative: bool) -> Self {
        Self {
            llm,
            use_llm_narrative,
        }
    }

    /// 主入口：槽位 -> 叙事 -> 引用校验
    pub async fn build(&self, input: &BuildInput<'_>) -> Result<DashboardSpec, EngineError> {
        let payload = input.payload;
        let mut slots = Slots::default();

        if let Some((from, to)) = input.date_range {
            slots.filters.push(serde_json::json!({
                "type": "date_range",
                "from": from.format("%Y-%m-%d").to_string(),
                "to": to.format("%Y-%m-%d").to_string(),
            }));
        }

        self.build_kpi_cards(payload, &mut slots);
        self.build_charts(payload, &mut slots, input.reduced);
        if !input.reduced {
            self.build_tables(payload, &mut slots);
        }

        // 叙事：LLM 路径（坏 JSON 修复一次）失败落回确定性路径
        let (blocks, conclusion) = if self.use_llm_narrative && self.llm.is_some() {
            match narrative::build_with_llm(
                self.llm.as_ref().unwrap(),
                input.question,
                payload,
            )
            .await
            {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("llm narrative failed, using deterministic path: {}", e);
                    narrative::build_deterministic(payload, input.period_label)
                }
            }
        } else {
            narrative::build_deterministic(payload, input.period_label)
        };
        slots.narrative = blocks;

        let mut spec = DashboardSpec {
            title: self.title_for(input.question),
            subtitle: Some(input.period_label.to_string()),
            conclusion: Some(conclusion),
            slots,
            generated_at: Some(Utc::now().to_rfc3339()),
        };

        self.validate_refs(&mut spec, payload);
        Ok(spec)
    }

    /// 会话型直接回复也包成一个最小看板（前端单一渲染路径）
    pub fn direct_spec(answer: &str) -> DashboardSpec {
        DashboardSpec {
            title: "Asistente de datos".to_string(),
            subtitle: None,
            conclusion: Some(answer.to_string()),
            slots: Slots {
                filters: vec![],
                series: vec![],
                charts: vec![],
                narrative: vec![NarrativeBlock::new(
                    crate::dashboard::NarrativeKind::Summary,
                    answer,
                )],
            },
            generated_at: Some(Utc::now().to_rfc3339()),
        }
    }

    fn build_kpi_cards(&self, payload: &DataPayload, slots: &mut Slots) {
        let delta_ref = payload
            .comparison
            .as_ref()
            .map(|_| "comparison".to_string());

        for (metric, label, format) in KPI_PRIORITY {
            if slots.series.len() >= MAX_KPI_CARDS {
                return;
            }
            let value_ref = format!("kpi.{}", metric);
            if payload.has_ref(&value_ref) {
                let with_delta = delta_ref.is_some()
                    && payload
                        .comparison
                        .as_ref()
                        .map(|c| c.deltas.contains_key(*metric))
                        .unwrap_or(false);
                slots.series.push(KpiCard {
                    label: (*label).to_string(),
                    value_ref,
                    format: *format,
                    delta_ref: if with_delta { delta_ref.clone() } else { None },
                    icon: None,
                });
            }
        }

        // 优先级表没覆盖的指标按字典序补位
        for metric in payload.kpis.keys() {
            if slots.series.len() >= MAX_KPI_CARDS {
                return;
            }
            if KPI_PRIORITY.iter().any(|(m, _, _)| m == metric) {
                continue;
            }
            let value_ref = format!("kpi.{}", metric);
            if payload.has_ref(&value_ref) {
                slots.series.push(KpiCard {
                    label: humanize(metric),
                    value_ref,
                    format: KpiFormat::Number,
                    delta_ref: None,
                    icon: None,
                });
            }
        }
    }

    fn build_charts(&self, payload: &DataPayload, slots: &mut Slots, reduced: bool) {
        // 1. series temporales: primera en linea, siguientes en area
        for (i, ts) in payload.time_series.iter().enumerate() {
            let dataset_ref = format!("ts.{}", ts.series_name);
            if !payload.has_ref(&dataset_ref) {
                continue;
            }
            let config = ChartConfig {
                title: humanize(&ts.series_name),
                dataset_ref,
                x_axis: "date".to_string(),
                y_axis: "value".to_string(),
                color: None,
            };
            slots.charts.push(if i == 0 {
                ChartSlot::LineChart(config)
            } else {
                ChartSlot::AreaChart(config)
            });
        }

        // 2. rankings: distribucion por tipo va en pie, el resto en barras
        for top in &payload.top_items {
            let dataset_ref = format!("top.{}", top.ranking_name);
            if !payload.has_ref(&dataset_ref) {
                continue;
            }
            let config = ChartConfig {
                title: humanize(&top.ranking_name),
                dataset_ref,
                x_axis: "title".to_string(),
                y_axis: "value".to_string(),
                color: None,
            };
            slots.charts.push(if top.ranking_name.contains("case_type") {
                ChartSlot::PieChart(config)
            } else {
                ChartSlot::BarChart(config)
            });
        }

        // 3. comparacion de periodos
        if let Some(cmp) = &payload.comparison {
            if payload.has_ref("comparison") {
                let metrics: Vec<String> = COMPARISON_METRICS
                    .iter()
                    .filter(|m| cmp.deltas.contains_key(**m))
                    .map(|m| m.to_string())
                    .collect();
                if !metrics.is_empty() {
                    slots.charts.push(ChartSlot::ComparisonBar(ComparisonChartConfig {
                        title: format!(
                            "{} vs {}",
                            cmp.current_period.label, cmp.previous_period.label
                        ),
                        current_label: cmp.current_period.label.clone(),
                        previous_label: cmp.previous_period.label.clone(),
                        metrics,
                        dataset_ref: "comparison".to_string(),
                    }));
                }
            }
        }

        self.ensure_two_charts(payload, slots);

        if reduced {
            // 重试模式：最多保留 2 张图
            let mut kept = 0usize;
            slots.charts.retain(|c| {
                if c.is_graphic() && kept < 2 {
                    kept += 1;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// 至少 2 张图：缺哪个家族补哪个；只有一个家族时从同家族再补一张
    fn ensure_two_charts(&self, payload: &DataPayload, slots: &mut Slots) {
        let graphics = slots.charts.iter().filter(|c| c.is_graphic()).count();
        if graphics >= 2 {
            return;
        }

        let has_line_or_area = slots
            .charts
            .iter()
            .any(|c| matches!(c, ChartSlot::LineChart(_) | ChartSlot::AreaChart(_)));
        let has_bar = slots
            .charts
            .iter()
            .any(|c| matches!(c, ChartSlot::BarChart(_) | ChartSlot::PieChart(_)));

        if !has_line_or_area {
            if let Some(ts) = payload.time_series.first() {
                let dataset_ref = format!("ts.{}", ts.series_name);
                if payload.has_ref(&dataset_ref) {
                    slots.charts.insert(
                        0,
                        ChartSlot::AreaChart(ChartConfig {
                            title: format!("Tendencia: {}", humanize(&ts.series_name)),
                            dataset_ref,
                            x_axis: "date".to_string(),
                            y_axis: "value".to_string(),
                            color: None,
                        }),
                    );
                }
            }
        }

        if !has_bar {
            if let Some(top) = payload.top_items.first() {
                let dataset_ref = format!("top.{}", top.ranking_name);
                if payload.has_ref(&dataset_ref) {
                    slots.charts.push(ChartSlot::BarChart(ChartConfig {
                        title: format!("Ranking: {}", humanize(&top.ranking_name)),
                        dataset_ref,
                        x_axis: "title".to_string(),
                        y_axis: "value".to_string(),
                        color: None,
                    }));
                }
            }
        }

        // 家族unico: segunda vista del mismo dataset con otra forma
        let graphics = slots.charts.iter().filter(|c| c.is_graphic()).count();
        if graphics == 1 {
            if payload.time_series.is_empty() {
                if let Some(top) = payload.top_items.first() {
                    let dataset_ref = format!("top.{}", top.ranking_name);
                    if payload.has_ref(&dataset_ref) {
                        slots.charts.push(ChartSlot::PieChart(ChartConfig {
                            title: format!("Distribucion: {}", humanize(&top.ranking_name)),
                            dataset_ref,
                            x_axis: "title".to_string(),
                            y_axis: "value".to_string(),
                            color: None,
                        }));
                    }
                }
            } else if payload.top_items.is_empty() {
                if let Some(ts) = payload.time_series.first() {
                    let dataset_ref = format!("ts.{}", ts.series_name);
                    if payload.has_ref(&dataset_ref) {
                        slots.charts.push(ChartSlot::BarChart(ChartConfig {
                            title: format!("Detalle: {}", humanize(&ts.series_name)),
                            dataset_ref,
                            x_axis: "date".to_string(),
                            y_axis: "value".to_string(),
                            color: None,
                        }));
                    }
                }
            }
        }
    }

    fn build_tables(&self, payload: &DataPayload, slots: &mut Slots) {
        for table in &payload.tables {
            let dataset_ref = format!("table.{}", table.name);
            if !payload.has_ref(&dataset_ref) {
                continue;
            }
            let columns: Vec<String> = table
                .rows
                .first()
                .map(|row| row.keys().take(TABLE_MAX_COLUMNS).cloned().collect())
                .unwrap_or_default();
            slots.charts.push(ChartSlot::Table(TableSlotConfig {
                title: humanize(&table.name),
                dataset_ref,
                columns,
                max_rows: TABLE_MAX_ROWS,
            }));
        }
    }

    fn title_for(&self, question: &str) -> String {
        let q = normalize(question);
        if q.contains("compar") || q.contains("versus") {
            "Comparacion de Periodos".to_string()
        } else if q.contains("inventario") || q.contains("stock") {
            "Analisis de Inventario".to_string()
        } else if q.contains("agente") || q.contains("interacci") || q.contains("escalad") {
            "Rendimiento del Agente AI".to_string()
        } else if q.contains("venta") || q.contains("ingreso") || q.contains("factura") {
            "Dashboard de Ventas".to_string()
        } else if q.contains("producto") {
            "Analisis de Productos".to_string()
        } else if q.contains("orden") || q.contains("pedido") {
            "Resumen de Ordenes".to_string()
        } else {
            "Dashboard de Insights".to_string()
        }
    }

    /// 引用校验：无效引用是编程错误；开发断言，发布过滤 + 错误日志
    fn validate_refs(&self, spec: &mut DashboardSpec, payload: &DataPayload) {
        let invalid: Vec<String> = spec
            .collect_refs()
            .iter()
            .filter(|r| !payload.has_ref(r))
            .map(|r| r.to_string())
            .collect();

        if !invalid.is_empty() {
            tracing::error!(refs = ?invalid, "dashboard references missing from payload");
            debug_assert!(invalid.is_empty(), "refs invalidas: {:?}", invalid);
            spec.slots
                .series
                .retain(|card| payload.has_ref(&card.value_ref));
            spec.slots
                .charts
                .retain(|chart| payload.has_ref(chart.dataset_ref()));
        }
    }
}

fn humanize(name: &str) -> String {
    name.replace(['_', '.'], " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{
        ComparisonData, ComparisonPeriod, TableData, TimeSeriesData, TimeSeriesPoint, TopItem,
        TopItemsData,
    };
    use std::collections::BTreeMap;

    fn builder() -> PresentationBuilder {
        PresentationBuilder::new(None, false)
    }

    fn sales_payload() -> DataPayload {
        let mut payload = DataPayload::default();
        payload.merge_kpis(
            "kpi.sales_summary",
            BTreeMap::from([
                ("total_sales".to_string(), 4_523_800.0),
                ("total_orders".to_string(), 342.0),
                ("avg_order_value".to_string(), 13_227.49),
                ("total_units".to_string(), 489.0),
            ]),
        );
        payload.time_series.push(TimeSeriesData {
            series_name: "sales_by_day".into(),
            points: vec![
                TimeSeriesPoint {
                    date: "2025-11-01".into(),
                    value: 100.0,
                    label: None,
                },
                TimeSeriesPoint {
                    date: "2025-11-07".into(),
                    value: 150.0,
                    label: None,
                },
            ],
        });
        payload.push_ref("ts.sales_by_day");
        payload.top_items.push(TopItemsData {
            ranking_name: "products_by_revenue".into(),
            metric: "revenue".into(),
            items: vec![TopItem {
                rank: 1,
                id: "MLA111".into(),
                title: "Auriculares".into(),
                value: 1_890_000.0,
                extra: None,
            }],
        });
        payload.push_ref("top.products_by_revenue");
        payload
    }

    fn input<'a>(question: &'a str, payload: &'a DataPayload) -> BuildInput<'a> {
        BuildInput {
            question,
            payload,
            period_label: "noviembre 2025",
            date_range: None,
            reduced: false,
        }
    }

    #[tokio::test]
    async fn test_sales_dashboard_shape() {
        let payload = sales_payload();
        let spec = builder()
            .build(&input("como van las ventas", &payload))
            .await
            .unwrap();

        assert_eq!(spec.title, "Dashboard de Ventas");
        assert!(!spec.slots.series.is_empty());
        assert!(spec.slots.series.len() <= MAX_KPI_CARDS);
        // una de linea/area y una de barras
        assert!(spec
            .slots
            .charts
            .iter()
            .any(|c| matches!(c, ChartSlot::LineChart(_) | ChartSlot::AreaChart(_))));
        assert!(spec
            .slots
            .charts
            .iter()
            .any(|c| matches!(c, ChartSlot::BarChart(_))));
        assert!(spec.conclusion.is_some());
        assert!(!spec.slots.narrative.is_empty());
    }

    #[tokio::test]
    async fn test_kpi_priority_order() {
        let payload = sales_payload();
        let spec = builder()
            .build(&input("como van las ventas", &payload))
            .await
            .unwrap();
        assert_eq!(spec.slots.series[0].value_ref, "kpi.total_sales");
        assert_eq!(spec.slots.series[1].value_ref, "kpi.total_orders");
    }

    #[tokio::test]
    async fn test_all_refs_exist_in_payload() {
        let payload = sales_payload();
        let spec = builder()
            .build(&input("como van las ventas", &payload))
            .await
            .unwrap();
        for r in spec.collect_refs() {
            assert!(payload.has_ref(r), "ref {} fuera de available_refs", r);
        }
    }

    #[tokio::test]
    async fn test_single_family_emits_two_charts() {
        // solo ranking, sin series: dos vistas del mismo dataset
        let mut payload = DataPayload::default();
        payload.top_items.push(TopItemsData {
            ranking_name: "products_by_revenue".into(),
            metric: "revenue".into(),
            items: vec![TopItem {
                rank: 1,
                id: "a".into(),
                title: "X".into(),
                value: 10.0,
                extra: None,
            }],
        });
        payload.push_ref("top.products_by_revenue");

        let spec = builder()
            .build(&input("top productos", &payload))
            .await
            .unwrap();
        let graphics = spec.slots.charts.iter().filter(|c| c.is_graphic()).count();
        assert!(graphics >= 2);
    }

    #[tokio::test]
    async fn test_comparison_adds_comparison_bar() {
        let mut payload = sales_payload();
        payload.comparison = Some(ComparisonData::build(
            ComparisonPeriod {
                label: "noviembre 2025".into(),
                date_from: "2025-11-01".into(),
                date_to: "2025-12-01".into(),
                kpis: BTreeMap::from([
                    ("total_sales".to_string(), 120.0),
                    ("total_orders".to_string(), 12.0),
                ]),
            },
            ComparisonPeriod {
                label: "octubre 2025".into(),
                date_from: "2025-10-01".into(),
                date_to: "2025-11-01".into(),
                kpis: BTreeMap::from([
                    ("total_sales".to_string(), 100.0),
                    ("total_orders".to_string(), 10.0),
                ]),
            },
        ));
        payload.push_ref("comparison");

        let spec = builder()
            .build(&input("comparame noviembre vs octubre", &payload))
            .await
            .unwrap();

        let cmp_chart = spec
            .slots
            .charts
            .iter()
            .find_map(|c| match c {
                ChartSlot::ComparisonBar(cfg) => Some(cfg),
                _ => None,
            })
            .expect("comparison_bar presente");
        assert_eq!(cmp_chart.current_label, "noviembre 2025");
        assert!(cmp_chart.metrics.contains(&"total_sales".to_string()));
        assert_eq!(spec.title, "Comparacion de Periodos");
        // KPI cards llevan delta_ref al dataset de comparacion
        assert!(spec.slots.series.iter().any(|c| c.delta_ref.is_some()));
    }

    #[tokio::test]
    async fn test_tables_capped_columns() {
        let mut payload = sales_payload();
        let mut row = serde_json::Map::new();
        for i in 0..8 {
            row.insert(format!("col{}", i), serde_json::json!(i));
        }
        payload.tables.push(TableData {
            name: "recent_orders".into(),
            rows: vec![row],
        });
        payload.push_ref("table.recent_orders");

        let spec = builder()
            .build(&input("ventas y ultimas ordenes", &payload))
            .await
            .unwrap();
        let table = spec
            .slots
            .charts
            .iter()
            .find_map(|c| match c {
                ChartSlot::Table(t) => Some(t),
                _ => None,
            })
            .expect("tabla presente");
        assert!(table.columns.len() <= TABLE_MAX_COLUMNS);
        assert_eq!(table.max_rows, TABLE_MAX_ROWS);
    }

    #[tokio::test]
    async fn test_reduced_mode_drops_tables() {
        let mut payload = sales_payload();
        payload.tables.push(TableData {
            name: "recent_orders".into(),
            rows: vec![],
        });
        payload.push_ref("table.recent_orders");

        let mut i = input("como van las ventas", &payload);
        i.reduced = true;
        let spec = builder().build(&i).await.unwrap();

        assert!(spec
            .slots
            .charts
            .iter()
            .all(|c| !matches!(c, ChartSlot::Table(_))));
        assert!(spec.slots.charts.len() <= 2);
    }

    #[tokio::test]
    async fn test_inventory_title_not_sales() {
        let mut payload = DataPayload::default();
        payload.merge_kpis(
            "kpi.inventory_summary",
            BTreeMap::from([("critical_count".to_string(), 3.0)]),
        );
        let spec = builder()
            .build(&input("como esta el inventario", &payload))
            .await
            .unwrap();
        assert_eq!(spec.title, "Analisis de Inventario");
    }

    #[test]
    fn test_direct_spec_minimal() {
        let spec = PresentationBuilder::direct_spec("Hola!");
        assert_eq!(spec.conclusion.as_deref(), Some("Hola!"));
        assert!(spec.slots.charts.is_empty());
        assert_eq!(spec.slots.narrative.len(), 1);
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize("sales_by_day"), "Sales By Day");
        assert_eq!(humanize("products_by_revenue"), "Products By Revenue");
    }
}
