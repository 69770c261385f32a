//! 意图分类：问题 + 会话上下文 -> 路由决策
//!
//! 两段式：
//! 1. 确定性关键词层（快、零成本，多数输入在这里解决）
//! 2. LLM 语义兜底（只在关键词全部落空时调用，且可整体关闭）
//!
//! 领域匹配是顺序敏感的：更具体的词表先测并遮蔽其命中的 token，
//! 否则 "inventario" 会因含有子串 "venta" 被误判为 sales。

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::llm::{complete_json, LlmClient};
use crate::memory::Message;

/// 响应类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    /// 寒暄 / 帮助：直接回复，不进下游阶段
    Conversational,
    /// 只要数据，不要看板
    DataOnly,
    /// 完整看板
    Dashboard,
    /// 问题太含糊，需要追问
    Clarification,
}

/// 数据领域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Sales,
    Inventory,
    Conversations,
    Unknown,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Sales => "sales",
            Domain::Inventory => "inventory",
            Domain::Conversations => "conversations",
            Domain::Unknown => "unknown",
        }
    }

    fn parse(s: &str) -> Domain {
        match s {
            "inventory" => Domain::Inventory,
            "conversations" => Domain::Conversations,
            "sales" => Domain::Sales,
            _ => Domain::Unknown,
        }
    }
}

/// 分类器输出：驱动编排器的路由决策
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub kind: RouteKind,
    pub domain: Domain,
    pub confidence: f64,
    pub rationale: String,
    /// conversational / clarification 时的直接回复
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub direct_answer: Option<String>,
}

/// 分类输入
pub struct ClassifyInput<'a> {
    pub question: &'a str,
    pub chat_context: &'a str,
    /// 上一轮助手消息是否已经是澄清追问
    pub previous_was_clarification: bool,
}

// ============== 词表 ==============

/// 会话型模式 -> 预置回复键
const CONVERSATIONAL_PATTERNS: &[(&str, &str)] = &[
    (
        r"^(hola|hey|buenas|buenos dias|buenas tardes|buenas noches|saludos)",
        "greeting",
    ),
    (
        r"^(gracias|muchas gracias|thanks|ok|perfecto|genial|excelente)",
        "thanks",
    ),
    (
        r"(que puedes hacer|que sabes hacer|ayuda|help|como funciona)",
        "help",
    ),
    (r"(quien eres|que eres|como te llamas)", "identity"),
];

/// 定量 / 名词类：需要数据
const DATA_KEYWORDS: &[&str] = &[
    "cuanto",
    "cuantos",
    "cuantas",
    "total",
    "suma",
    "cantidad",
    "vendimos",
    "venta",
    "vendido",
    "ordenes",
    "orden",
    "pedidos",
    "pedido",
    "productos",
    "producto",
    "inventario",
    "stock",
    "escalado",
    "escalacion",
    "casos",
    "agente",
    "interacciones",
    "preventa",
    "ingresos",
    "revenue",
    "facturacion",
    "promedio",
    "kpi",
    "metricas",
    "dime",
    "dame",
    "quiero",
    "necesito",
];

/// 可视化 / 状态类：需要看板
const DASHBOARD_KEYWORDS: &[&str] = &[
    "mostrame",
    "muestrame",
    "muestra",
    "visualiza",
    "grafico",
    "chart",
    "dashboard",
    "panel",
    "reporte",
    "tendencia",
    "evolucion",
    "comparar",
    "comparacion",
    "comparame",
    "versus",
    " vs ",
    "analisis",
    "analiza",
    "insight",
    "resumen",
    "como van",
    "como estan",
    "como esta",
    "que tal",
    "como vamos",
    "como fue",
    "como estuvo",
    "como me fue",
    "situacion",
    "estado de",
    "reposicion",
    "reponer",
    "alerta",
    "critico",
    "proyeccion",
    "margen",
    "crecimiento",
    "cual fue",
    "cual es",
    "mas vendido",
    "mejor mes",
    "peor mes",
    "que producto",
];

/// 领域词表：按特异性排序，前面的命中后遮蔽其 token。
/// "inventario" 含子串 "venta"，所以 inventory 必须排在 sales 之前。
const DOMAIN_KEYWORDS: &[(Domain, &[&str])] = &[
    (
        Domain::Conversations,
        &[
            "agente",
            "interacci",
            "conversacion",
            "mensaje",
            "escalad",
            "preventa",
            "bot",
        ],
    ),
    (
        Domain::Inventory,
        &[
            "inventario",
            "existencia",
            "stock",
            "reposicion",
            "reponer",
            "producto",
            "disponible",
        ],
    ),
    (
        Domain::Sales,
        &[
            "venta",
            "vendido",
            "facturacion",
            "factura",
            "ingreso",
            "revenue",
            "orden",
            "pedido",
            "ticket",
        ],
    ),
];

/// 含糊问题里的回指词
const BACK_REFERENCES: &[&str] = &[
    "eso", "esto", "aquello", "lo mismo", "el mismo", "la misma", "y este", "y esta", "anterior",
    "tambien",
];

/// 短问题阈值（字符数，低于它才考虑歧义判定）
const AMBIGUITY_MAX_LEN: usize = 30;

fn direct_response(key: &str) -> String {
    match key {
        "greeting" => "Hola! Soy tu asistente de datos. Puedo ayudarte con:\n- Ventas y ordenes\n- Inventario y productos\n- Rendimiento del agente AI\n- Casos escalados\n\nQue te gustaria saber?",
        "thanks" => "De nada! Si tienes mas preguntas sobre tus datos, estoy aqui para ayudarte.",
        "help" => "Puedo ayudarte a analizar tus datos de negocio. Prueba preguntas como:\n- Como van las ventas?\n- Mostrame el inventario\n- Productos con stock bajo\n- Como esta el agente AI?\n- Ultimas ordenes",
        "identity" => "Soy un asistente de BI potenciado por IA. Analizo tus datos de ventas, inventario y servicio al cliente para darte insights accionables.",
        _ => "No estoy seguro de que necesitas. Puedo ayudarte con:\n- Ventas y ordenes\n- Inventario y stock\n- Agente AI e interacciones\n\nQue area te interesa?",
    }
    .to_string()
}

/// 小写 + 去元音重音（ñ 保留，日期词 "año" 靠正则处理）
pub fn normalize(question: &str) -> String {
    question
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' => 'a',
            'é' | 'è' | 'ë' => 'e',
            'í' | 'ì' | 'ï' => 'i',
            'ó' | 'ò' | 'ö' => 'o',
            'ú' | 'ù' | 'ü' => 'u',
            other => other,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// 问题是否带回指词（"eso", "lo mismo", ...）；数据层用它决定是否走 LLM 选择
pub fn has_back_reference(normalized: &str) -> bool {
    BACK_REFERENCES.iter().any(|r| normalized.contains(r))
}

/// 领域检测：顺序敏感 + token 遮蔽
pub fn detect_domain(normalized: &str) -> Domain {
    let mut masked = normalized.to_string();
    let mut best: Option<(Domain, usize)> = None;

    for (domain, keywords) in DOMAIN_KEYWORDS {
        let mut score = 0usize;
        for kw in *keywords {
            if masked.contains(kw) {
                score += 1;
                masked = masked.replace(kw, " ");
            }
        }
        if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((*domain, score));
        }
    }

    best.map(|(d, _)| d).unwrap_or(Domain::Unknown)
}

/// LLM 兜底的结构化输出
#[derive(Debug, Deserialize)]
struct LlmRouteOutput {
    response_type: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    reasoning: String,
}

/// 两段式意图分类器
pub struct IntentClassifier {
    llm: Option<Arc<dyn LlmClient>>,
    clarify_best_guess_after_prompt: bool,
}

impl IntentClassifier {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, clarify_best_guess_after_prompt: bool) -> Self {
        Self {
            llm,
            clarify_best_guess_after_prompt,
        }
    }

    /// 第一段：确定性关键词分类。None 表示需要 LLM 兜底。
    pub fn stage1(&self, input: &ClassifyInput<'_>) -> Option<RoutingDecision> {
        let q = normalize(input.question);

        // 1. 会话型模式
        for (pattern, key) in CONVERSATIONAL_PATTERNS {
            if Regex::new(pattern).unwrap().is_match(&q) {
                return Some(RoutingDecision {
                    kind: RouteKind::Conversational,
                    domain: Domain::Unknown,
                    confidence: 0.95,
                    rationale: format!("matched conversational pattern: {}", key),
                    direct_answer: Some(direct_response(key)),
                });
            }
        }

        // 2. 歧义判定：短 + 回指 + 无上下文
        let ambiguous = q.len() < AMBIGUITY_MAX_LEN
            && BACK_REFERENCES.iter().any(|r| q.contains(r))
            && input.chat_context.is_empty();
        if ambiguous {
            let skip = input.previous_was_clarification && self.clarify_best_guess_after_prompt;
            if !skip {
                return Some(RoutingDecision {
                    kind: RouteKind::Clarification,
                    domain: Domain::Unknown,
                    confidence: 0.9,
                    rationale: "short question with back-reference and no context".to_string(),
                    direct_answer: Some(direct_response("clarification")),
                });
            }
        }

        // 3. 数据 / 看板信号
        let needs_dashboard = DASHBOARD_KEYWORDS.iter().any(|kw| q.contains(kw));
        let needs_data = needs_dashboard || DATA_KEYWORDS.iter().any(|kw| q.contains(kw));

        if !needs_data && !needs_dashboard {
            return None;
        }

        // 4. 领域
        let domain = detect_domain(&q);

        Some(if needs_dashboard {
            RoutingDecision {
                kind: RouteKind::Dashboard,
                domain,
                confidence: 0.9,
                rationale: format!("dashboard keywords, domain {}", domain.as_str()),
                direct_answer: None,
            }
        } else {
            RoutingDecision {
                kind: RouteKind::DataOnly,
                domain,
                confidence: 0.85,
                rationale: format!("data keywords, domain {}", domain.as_str()),
                direct_answer: None,
            }
        })
    }

    /// 第二段：LLM 语义分类（complete_json 内含一次修复重试）
    async fn stage2(&self, input: &ClassifyInput<'_>) -> RoutingDecision {
        let Some(llm) = &self.llm else {
            // 没有 LLM：按规范落到澄清
            return RoutingDecision {
                kind: RouteKind::Clarification,
                domain: Domain::Unknown,
                confidence: 0.5,
                rationale: "no keyword signal and no llm available".to_string(),
                direct_answer: Some(direct_response("clarification")),
            };
        };

        let system = "Eres un clasificador de intenciones para un sistema de analytics de e-commerce.\n\
            Analiza la pregunta y determina:\n\
            1. response_type: \"dashboard\" (necesita visualizacion), \"data_only\" (solo numeros), \"conversational\" (saludo/ayuda)\n\
            2. domain: \"sales\" | \"inventory\" | \"conversations\"\n\n\
            Responde SOLO con JSON valido:\n\
            {\"response_type\": \"dashboard|data_only|conversational\", \"domain\": \"sales|inventory|conversations\", \"reasoning\": \"breve\"}";

        let user = if input.chat_context.is_empty() {
            format!("Pregunta: {}", input.question)
        } else {
            format!(
                "Contexto previo:\n{}\n\nPregunta: {}",
                input.chat_context, input.question
            )
        };

        let messages = vec![Message::system(system), Message::user(user)];
        match complete_json::<LlmRouteOutput>(llm.as_ref(), &messages).await {
            Ok(out) => {
                let domain = out
                    .domain
                    .as_deref()
                    .map(Domain::parse)
                    .unwrap_or(Domain::Unknown);
                match out.response_type.as_str() {
                    "conversational" => RoutingDecision {
                        kind: RouteKind::Conversational,
                        domain: Domain::Unknown,
                        confidence: 0.8,
                        rationale: format!("llm semantic: {}", out.reasoning),
                        direct_answer: Some(direct_response("help")),
                    },
                    "data_only" => RoutingDecision {
                        kind: RouteKind::DataOnly,
                        domain,
                        confidence: 0.8,
                        rationale: format!("llm semantic: {}", out.reasoning),
                        direct_answer: None,
                    },
                    _ => RoutingDecision {
                        kind: RouteKind::Dashboard,
                        domain,
                        confidence: 0.8,
                        rationale: format!("llm semantic: {}", out.reasoning),
                        direct_answer: None,
                    },
                }
            }
            Err(e) => {
                tracing::warn!("intent llm fallback failed: {}", e);
                RoutingDecision {
                    kind: RouteKind::DataOnly,
                    domain: Domain::Unknown,
                    confidence: 0.3,
                    rationale: format!("llm fallback error: {}", e),
                    direct_answer: None,
                }
            }
        }
    }

    /// 主入口
    pub async fn classify(&self, input: &ClassifyInput<'_>) -> RoutingDecision {
        if let Some(decision) = self.stage1(input) {
            return decision;
        }
        tracing::debug!("no keyword signal, falling back to llm routing");
        self.stage2(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmClient, LlmError, MockLlmClient};

    fn classifier() -> IntentClassifier {
        IntentClassifier::new(None, true)
    }

    fn input(question: &str) -> ClassifyInput<'_> {
        ClassifyInput {
            question,
            chat_context: "",
            previous_was_clarification: false,
        }
    }

    #[test]
    fn test_greeting_is_conversational() {
        let d = classifier().stage1(&input("hola")).unwrap();
        assert_eq!(d.kind, RouteKind::Conversational);
        assert!(d.direct_answer.is_some());
    }

    #[test]
    fn test_sales_dashboard() {
        let d = classifier().stage1(&input("como van las ventas")).unwrap();
        assert_eq!(d.kind, RouteKind::Dashboard);
        assert_eq!(d.domain, Domain::Sales);
    }

    #[test]
    fn test_inventory_never_classifies_as_sales() {
        // "inventario" contiene "venta" como substring: la trampa clasica
        for q in [
            "como esta el inventario",
            "mostrame el inventario",
            "inventario actual por favor",
            "analisis del inventario de productos",
        ] {
            let d = classifier().stage1(&input(q)).unwrap();
            assert_eq!(d.domain, Domain::Inventory, "pregunta: {}", q);
            assert_ne!(d.domain, Domain::Sales, "pregunta: {}", q);
        }
    }

    #[test]
    fn test_data_only_without_dashboard_keywords() {
        let d = classifier()
            .stage1(&input("cuantas ordenes tuvimos"))
            .unwrap();
        assert_eq!(d.kind, RouteKind::DataOnly);
        assert_eq!(d.domain, Domain::Sales);
    }

    #[test]
    fn test_conversations_domain() {
        let d = classifier()
            .stage1(&input("como esta el agente ai"))
            .unwrap();
        assert_eq!(d.kind, RouteKind::Dashboard);
        assert_eq!(d.domain, Domain::Conversations);
    }

    #[test]
    fn test_accents_are_normalized() {
        let d = classifier()
            .stage1(&input("cómo van las ventas"))
            .unwrap();
        assert_eq!(d.kind, RouteKind::Dashboard);
        assert_eq!(d.domain, Domain::Sales);
    }

    #[test]
    fn test_ambiguous_question_asks_clarification() {
        let d = classifier().stage1(&input("y eso?")).unwrap();
        assert_eq!(d.kind, RouteKind::Clarification);
        assert!(d.direct_answer.is_some());
    }

    #[test]
    fn test_ambiguous_with_context_is_not_clarification() {
        let c = classifier();
        let i = ClassifyInput {
            question: "y eso?",
            chat_context: "Usuario: como van las ventas\nAsistente: Ventas por $1.2M",
            previous_was_clarification: false,
        };
        // 有上下文时不判歧义；回指词也不是数据信号，所以落到 stage 2
        assert!(c.stage1(&i).is_none());
    }

    #[test]
    fn test_best_guess_after_clarification() {
        let c = classifier();
        let i = ClassifyInput {
            question: "y eso?",
            chat_context: "",
            previous_was_clarification: true,
        };
        let d = c.stage1(&i);
        // 政策显式：追问只发一次，下一轮按最佳猜测继续
        assert!(d.is_none() || d.unwrap().kind != RouteKind::Clarification);
    }

    #[test]
    fn test_stage1_is_deterministic() {
        let c = classifier();
        for q in ["como van las ventas", "hola", "como esta el inventario"] {
            let a = c.stage1(&input(q)).unwrap();
            let b = c.stage1(&input(q)).unwrap();
            assert_eq!(a.kind, b.kind);
            assert_eq!(a.domain, b.domain);
            assert_eq!(a.rationale, b.rationale);
        }
    }

    #[test]
    fn test_detect_domain_masking() {
        assert_eq!(detect_domain("como esta el inventario"), Domain::Inventory);
        assert_eq!(detect_domain("como van las ventas"), Domain::Sales);
        assert_eq!(detect_domain("casos escalados del agente"), Domain::Conversations);
        assert_eq!(detect_domain("que hora es"), Domain::Unknown);
    }

    #[tokio::test]
    async fn test_stage2_llm_routing() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_responses(vec![Ok(
            r#"{"response_type": "dashboard", "domain": "inventory", "reasoning": "pide estado"}"#
                .into(),
        )]));
        let c = IntentClassifier::new(Some(llm), true);
        let d = c.classify(&input("necesitaria revisar el deposito")).await;
        assert_eq!(d.kind, RouteKind::Dashboard);
        assert_eq!(d.domain, Domain::Inventory);
    }

    #[tokio::test]
    async fn test_stage2_double_failure_defaults_data_only() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_responses(vec![
            Ok("sin json".into()),
            Ok("tampoco".into()),
        ]));
        let c = IntentClassifier::new(Some(llm), true);
        let d = c.classify(&input("que onda el negocio")).await;
        assert_eq!(d.kind, RouteKind::DataOnly);
        assert!(d.confidence <= 0.5);
    }

    #[tokio::test]
    async fn test_stage2_llm_error_defaults_data_only() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_responses(vec![Err(
            LlmError::Api("boom".into()),
        )]));
        let c = IntentClassifier::new(Some(llm), true);
        let d = c.classify(&input("che, el negocio?")).await;
        assert_eq!(d.kind, RouteKind::DataOnly);
        assert!(d.confidence <= 0.5);
    }

    #[tokio::test]
    async fn test_no_llm_falls_to_clarification() {
        let c = IntentClassifier::new(None, true);
        let d = c.classify(&input("che, el negocio?")).await;
        assert_eq!(d.kind, RouteKind::Clarification);
    }
}
