//! DashboardSpec：前端渲染的看板 JSON
//!
//! 槽位固定为 series（KPI 卡）/ charts（图表、表格、对比）/ narrative / filters。
//! 规范：spec 中出现的每个 value_ref / dataset_ref 必须存在于 payload 的
//! available_refs；collect_refs 提供校验所需的引用清单。

use serde::{Deserialize, Serialize};

/// KPI 卡的数值格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KpiFormat {
    Currency,
    Number,
    Percent,
}

/// 一张 KPI 卡
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiCard {
    pub label: String,
    /// 指向 payload 的引用（如 kpi.total_sales）
    pub value_ref: String,
    pub format: KpiFormat,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub delta_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub icon: Option<String>,
}

/// 常规图表配置（折线 / 面积 / 柱状 / 饼图共用）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartConfig {
    pub title: String,
    /// 指向 payload 的数据集（如 ts.sales_by_day）
    pub dataset_ref: String,
    pub x_axis: String,
    pub y_axis: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub color: Option<String>,
}

/// 表格槽位配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSlotConfig {
    pub title: String,
    pub dataset_ref: String,
    pub columns: Vec<String>,
    pub max_rows: u32,
}

/// 周期对比图配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonChartConfig {
    pub title: String,
    pub current_label: String,
    pub previous_label: String,
    /// 参与对比的指标名（total_sales, total_orders, ...）
    pub metrics: Vec<String>,
    pub dataset_ref: String,
}

/// charts 槽位里的一个组件；type 字段是与前端的线约定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChartSlot {
    LineChart(ChartConfig),
    AreaChart(ChartConfig),
    BarChart(ChartConfig),
    PieChart(ChartConfig),
    Table(TableSlotConfig),
    ComparisonBar(ComparisonChartConfig),
    ComparisonKpi(ComparisonChartConfig),
}

impl ChartSlot {
    pub fn dataset_ref(&self) -> &str {
        match self {
            ChartSlot::LineChart(c)
            | ChartSlot::AreaChart(c)
            | ChartSlot::BarChart(c)
            | ChartSlot::PieChart(c) => &c.dataset_ref,
            ChartSlot::Table(t) => &t.dataset_ref,
            ChartSlot::ComparisonBar(c) | ChartSlot::ComparisonKpi(c) => &c.dataset_ref,
        }
    }

    /// 是否算作「图表」（表格不算，双图规则用）
    pub fn is_graphic(&self) -> bool {
        !matches!(self, ChartSlot::Table(_))
    }
}

/// 叙事块类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrativeKind {
    Headline,
    Summary,
    Insight,
    Callout,
}

/// 一个叙事块
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NarrativeBlock {
    #[serde(rename = "type")]
    pub kind: NarrativeKind,
    pub text: String,
}

impl NarrativeBlock {
    pub fn new(kind: NarrativeKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// 看板槽位
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Slots {
    #[serde(default)]
    pub filters: Vec<serde_json::Value>,
    #[serde(default)]
    pub series: Vec<KpiCard>,
    #[serde(default)]
    pub charts: Vec<ChartSlot>,
    #[serde(default)]
    pub narrative: Vec<NarrativeBlock>,
}

/// 看板完整规格
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardSpec {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subtitle: Option<String>,
    /// 直接回答问题的一句话结论，总是存在
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub conclusion: Option<String>,
    pub slots: Slots,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub generated_at: Option<String>,
}

impl DashboardSpec {
    /// spec 中出现的全部引用（value_ref + delta_ref + dataset_ref）
    pub fn collect_refs(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        for card in &self.slots.series {
            refs.push(card.value_ref.as_str());
            if let Some(d) = &card.delta_ref {
                refs.push(d.as_str());
            }
        }
        for chart in &self.slots.charts {
            refs.push(chart.dataset_ref());
        }
        refs
    }
}
