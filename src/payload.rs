//! DataPayload：数据层产出、看板层消费、并随流下发的类型化数据包
//!
//! available_refs 是看板引用校验的依据：只有真正拿到非空结果的 ref 才会出现。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 单个数据集的执行元数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetMeta {
    pub query_id: String,
    pub row_count: usize,
    pub execution_time_ms: f64,
    pub from_cache: bool,
    pub executed_at: DateTime<Utc>,
}

/// 时间序列中的一个点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSeriesPoint {
    /// YYYY-MM-DD 或 YYYY-MM
    pub date: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub label: Option<String>,
}

/// 一条时间序列
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSeriesData {
    pub series_name: String,
    #[serde(default)]
    pub points: Vec<TimeSeriesPoint>,
}

impl TimeSeriesData {
    /// 首尾变化率（%）；首值为 0 时返回 None
    pub fn pct_change(&self) -> Option<f64> {
        let first = self.points.first()?.value;
        let last = self.points.last()?.value;
        if first == 0.0 {
            return None;
        }
        Some((last - first) / first * 100.0)
    }
}

/// 排行中的一项
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopItem {
    pub rank: u32,
    pub id: String,
    pub title: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extra: Option<serde_json::Map<String, serde_json::Value>>,
}

/// 一份排行数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopItemsData {
    pub ranking_name: String,
    pub metric: String,
    #[serde(default)]
    pub items: Vec<TopItem>,
}

/// 一张明细表
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableData {
    pub name: String,
    #[serde(default)]
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// 对比中的一个周期
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonPeriod {
    pub label: String,
    pub date_from: String,
    pub date_to: String,
    #[serde(default)]
    pub kpis: BTreeMap<String, f64>,
}

/// 单个指标的差值
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MetricDelta {
    pub delta: f64,
    /// (actual - anterior) / anterior * 100；anterior = 0 时为 0
    pub delta_pct: f64,
}

/// 两个周期的对比数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonData {
    pub current_period: ComparisonPeriod,
    pub previous_period: ComparisonPeriod,
    #[serde(default)]
    pub deltas: BTreeMap<String, MetricDelta>,
}

impl ComparisonData {
    /// 由两个周期的 KPI 计算差值；只比较两边都有的指标
    pub fn build(current: ComparisonPeriod, previous: ComparisonPeriod) -> Self {
        let mut deltas = BTreeMap::new();
        for (metric, cur) in &current.kpis {
            if let Some(prev) = previous.kpis.get(metric) {
                let delta = cur - prev;
                let delta_pct = if *prev == 0.0 {
                    0.0
                } else {
                    delta / prev * 100.0
                };
                deltas.insert(metric.clone(), MetricDelta { delta, delta_pct });
            }
        }
        Self {
            current_period: current,
            previous_period: previous,
            deltas,
        }
    }
}

/// 数据层产出的完整数据包
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataPayload {
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub kpis: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub time_series: Vec<TimeSeriesData>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub top_items: Vec<TopItemsData>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tables: Vec<TableData>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub comparison: Option<ComparisonData>,
    #[serde(default)]
    pub datasets_meta: Vec<DatasetMeta>,
    /// 真正拿到非空结果的 ref 集合（看板引用的校验依据）
    #[serde(default)]
    pub available_refs: Vec<String>,
}

impl DataPayload {
    pub fn has_ref(&self, r: &str) -> bool {
        self.available_refs.iter().any(|a| a == r)
    }

    pub fn push_ref(&mut self, r: impl Into<String>) {
        let r = r.into();
        if !self.has_ref(&r) {
            self.available_refs.push(r);
        }
    }

    /// 合并一组 KPI；每个指标追加 kpi.<nombre> 引用
    pub fn merge_kpis(&mut self, entry_ref: &str, kpis: BTreeMap<String, f64>) {
        for (name, value) in kpis {
            self.push_ref(format!("kpi.{}", name));
            self.kpis.insert(name, value);
        }
        self.push_ref(entry_ref);
    }
}
