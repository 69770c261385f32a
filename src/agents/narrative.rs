//! 叙事生成：确定性规则为主路径，LLM 为可选增强
//!
//! 确定性路径不是降级模式，而是默认产线：headline 报主 KPI 与周期，
//! 趋势阈值 ±10% 判多空，排行取第一名，单品占比 >40% 报集中度，
//! 阈值告警（stock critico / escalamiento alto / caida fuerte）出 callout。

use std::sync::Arc;

use crate::dashboard::{NarrativeBlock, NarrativeKind};
use crate::error::EngineError;
use crate::llm::{complete_json, LlmClient};
use crate::memory::Message;
use crate::payload::DataPayload;
use serde::Deserialize;

/// 趋势判定阈值（%）
const TREND_BULLISH_PCT: f64 = 10.0;
const TREND_BEARISH_PCT: f64 = -10.0;
/// 陡峭下跌的 callout 阈值（%）
const TREND_STEEP_DROP_PCT: f64 = -25.0;
/// 单品集中度阈值
const OUTLIER_SHARE: f64 = 0.40;
/// 逃逸率告警阈值（%）
const ESCALATION_ALERT_PCT: f64 = 20.0;
/// 叙事块数量范围
const MAX_BLOCKS: usize = 5;

/// 千分位格式（sin decimales）
pub fn format_money(value: f64) -> String {
    let negative = value < 0.0;
    let mut n = value.abs().round() as u64;
    if n == 0 {
        return if negative { "-$0".into() } else { "$0".into() };
    }
    let mut parts = Vec::new();
    while n > 0 {
        parts.push((n % 1000) as u32);
        n /= 1000;
    }
    let mut out = String::new();
    for (i, part) in parts.iter().rev().enumerate() {
        if i == 0 {
            out.push_str(&part.to_string());
        } else {
            out.push_str(&format!(",{:03}", part));
        }
    }
    format!("{}${}", if negative { "-" } else { "" }, out)
}

fn format_count(value: f64) -> String {
    format!("{}", value.round() as i64)
}

/// 确定性叙事：返回 (bloques, conclusion)。conclusion 总是非空。
pub fn build_deterministic(payload: &DataPayload, period_label: &str) -> (Vec<NarrativeBlock>, String) {
    let mut blocks = Vec::new();
    let mut insights: Vec<String> = Vec::new();
    let mut callouts: Vec<String> = Vec::new();

    // --- headline: KPI principal del dominio presente ---
    let headline = if let Some(cmp) = &payload.comparison {
        let sales_delta = cmp.deltas.get("total_sales");
        let pct = sales_delta.map(|d| d.delta_pct).unwrap_or(0.0);
        let current_sales = cmp
            .current_period
            .kpis
            .get("total_sales")
            .copied()
            .unwrap_or(0.0);
        format!(
            "{}: {} en ventas, {}{:.1}% vs {}",
            cmp.current_period.label,
            format_money(current_sales),
            if pct >= 0.0 { "+" } else { "" },
            pct,
            cmp.previous_period.label
        )
    } else if let Some(total_sales) = payload.kpis.get("total_sales") {
        let orders = payload.kpis.get("total_orders").copied().unwrap_or(0.0);
        format!(
            "Ventas por {} con {} ordenes en {}",
            format_money(*total_sales),
            format_count(orders),
            period_label
        )
    } else if let Some(total) = payload.kpis.get("total_interactions") {
        let rate = payload.kpis.get("escalation_rate").copied().unwrap_or(0.0);
        format!(
            "El agente AI proceso {} interacciones con {:.1}% de escalamiento",
            format_count(*total),
            rate
        )
    } else if let Some(critical) = payload.kpis.get("critical_count") {
        let total = payload.kpis.get("total_products").copied().unwrap_or(0.0);
        format!(
            "Inventario: {} de {} productos en estado critico",
            format_count(*critical),
            format_count(total)
        )
    } else if let Some(queries) = payload.kpis.get("total_queries") {
        let rate = payload.kpis.get("answer_rate").copied().unwrap_or(0.0);
        format!(
            "Se recibieron {} consultas de preventa con {:.1}% respondidas",
            format_count(*queries),
            rate
        )
    } else {
        format!("Datos del periodo {} procesados", period_label)
    };

    blocks.push(NarrativeBlock::new(NarrativeKind::Headline, headline.clone()));

    // --- tendencia de la primera serie temporal ---
    if let Some(ts) = payload.time_series.first() {
        if let Some(pct) = ts.pct_change() {
            if pct > TREND_BULLISH_PCT {
                insights.push(format!(
                    "Tendencia alcista: la serie {} crecio {:.1}% entre puntas",
                    ts.series_name, pct
                ));
            } else if pct < TREND_BEARISH_PCT {
                insights.push(format!(
                    "Tendencia bajista: la serie {} cayo {:.1}% entre puntas",
                    ts.series_name,
                    pct.abs()
                ));
            } else {
                insights.push(format!(
                    "La serie {} se mantiene estable ({:+.1}%)",
                    ts.series_name, pct
                ));
            }
            if pct < TREND_STEEP_DROP_PCT {
                callouts.push(format!(
                    "Caida fuerte en {}: {:.1}% en el periodo, revisar causas",
                    ts.series_name,
                    pct.abs()
                ));
            }
        }
    }

    // --- top performer + concentracion por ranking ---
    for top in &payload.top_items {
        if let Some(first) = top.items.first() {
            insights.push(format!(
                "#1 en {}: '{}' con {}",
                top.ranking_name,
                first.title,
                format_money(first.value)
            ));
            let total: f64 = top.items.iter().map(|i| i.value).sum();
            if total > 0.0 && first.value / total > OUTLIER_SHARE {
                insights.push(format!(
                    "'{}' concentra {:.0}% del total de {}",
                    first.title,
                    first.value / total * 100.0,
                    top.ranking_name
                ));
            }
        }
    }

    // --- callouts por umbral ---
    if let Some(critical) = payload.kpis.get("critical_count") {
        if *critical > 0.0 {
            callouts.push(format!(
                "{} productos con stock critico: priorizar reposicion",
                format_count(*critical)
            ));
        }
    }
    if let Some(rate) = payload.kpis.get("escalation_rate") {
        if *rate > ESCALATION_ALERT_PCT {
            callouts.push(format!(
                "Tasa de escalamiento alta ({:.1}%): revisar respuestas del agente",
                rate
            ));
        }
    }

    for text in insights {
        blocks.push(NarrativeBlock::new(NarrativeKind::Insight, text));
    }
    for text in callouts {
        blocks.push(NarrativeBlock::new(NarrativeKind::Callout, text));
    }

    // 2..=5 bloques
    if blocks.len() < 2 {
        blocks.push(NarrativeBlock::new(
            NarrativeKind::Summary,
            "Revisa los graficos para mas detalle.",
        ));
    }
    blocks.truncate(MAX_BLOCKS);

    (blocks, headline)
}

/// LLM 叙事的结构化输出
#[derive(Debug, Deserialize)]
pub struct NarrativeOutput {
    pub conclusion: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub recommendation: String,
}

/// payload 摘要：给 LLM 的数据上下文（不送原始行集）
fn summarize_payload(payload: &DataPayload) -> String {
    let mut lines = Vec::new();

    if !payload.kpis.is_empty() {
        let kpis = payload
            .kpis
            .iter()
            .map(|(k, v)| format!("{}={:.2}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("KPIs: {}", kpis));
    }
    for ts in &payload.time_series {
        let change = ts
            .pct_change()
            .map(|p| format!("{:+.1}%", p))
            .unwrap_or_else(|| "n/a".to_string());
        lines.push(format!(
            "Serie {}: {} puntos, cambio {}",
            ts.series_name,
            ts.points.len(),
            change
        ));
    }
    for top in &payload.top_items {
        if let Some(first) = top.items.first() {
            lines.push(format!(
                "Top {}: #1 es '{}' con {:.2}",
                top.ranking_name, first.title, first.value
            ));
        }
    }
    if let Some(cmp) = &payload.comparison {
        lines.push(format!(
            "Comparacion {} vs {}: deltas {}",
            cmp.current_period.label,
            cmp.previous_period.label,
            cmp.deltas
                .iter()
                .map(|(k, d)| format!("{} {:+.1}%", k, d.delta_pct))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    lines.join("\n")
}

/// LLM 叙事路径：失败（含一次修复）由调用方落回确定性路径
pub async fn build_with_llm(
    llm: &Arc<dyn LlmClient>,
    question: &str,
    payload: &DataPayload,
) -> Result<(Vec<NarrativeBlock>, String), EngineError> {
    let system = "Eres un analista de negocio senior. Genera insights accionables y concretos \
        basados SOLO en los datos provistos, en español.\n\
        Responde SOLO con JSON valido:\n\
        {\"conclusion\": \"respuesta directa a la pregunta (1-2 oraciones)\", \
         \"summary\": \"resumen ejecutivo (2-3 oraciones)\", \
         \"insights\": [\"insight 1\", \"insight 2\"], \
         \"recommendation\": \"recomendacion accionable (1 oracion)\"}";

    let user = format!(
        "Pregunta del usuario: \"{}\"\n\nDatos disponibles:\n{}\n\nGenera insights basados en estos datos.",
        question,
        summarize_payload(payload)
    );

    let messages = vec![Message::system(system), Message::user(user)];
    let out: NarrativeOutput = complete_json(llm.as_ref(), &messages).await?;

    let mut blocks = Vec::new();
    blocks.push(NarrativeBlock::new(
        NarrativeKind::Headline,
        out.conclusion.clone(),
    ));
    if !out.summary.is_empty() {
        blocks.push(NarrativeBlock::new(NarrativeKind::Summary, out.summary));
    }
    for insight in out.insights {
        blocks.push(NarrativeBlock::new(NarrativeKind::Insight, insight));
    }
    if !out.recommendation.is_empty() {
        blocks.push(NarrativeBlock::new(
            NarrativeKind::Callout,
            out.recommendation,
        ));
    }
    blocks.truncate(MAX_BLOCKS);

    Ok((blocks, out.conclusion))
}
