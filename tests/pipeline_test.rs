//! 端到端场景测试：demo 后端 + mock LLM 跑完整管线

mod common;

use std::sync::Arc;

use common::{default_state, make_state, run_question};
use faro::config::AppConfig;
use faro::dashboard::ChartSlot;
use faro::error::EngineError;
use faro::executor::DemoBackend;
use faro::intent::{Domain, RouteKind};
use faro::llm::{LlmClient, MockLlmClient};
use faro::pipeline::StepStatus;
use faro::stream::{FinishReason, StreamEvent};

// ============== escenario 1: saludo ==============

#[tokio::test]
async fn test_greeting_is_conversational() {
    let state = default_state();
    let result = run_question(&state, "hola").await;

    assert_eq!(result.reason, FinishReason::Complete);
    // un solo agent_step (classify) y nada de dashboard/payload
    assert_eq!(result.agent_steps().len(), 1);
    assert_eq!(result.agent_steps()[0].step, "classify");
    assert!(result.dashboard().is_none());
    assert!(result.payload().is_none());
    assert!(result.full_text().contains("Ventas y ordenes"));
}

// ============== escenario 2: dashboard de ventas ==============

#[tokio::test]
async fn test_sales_dashboard_end_to_end() {
    let state = default_state();
    let result = run_question(&state, "como van las ventas").await;

    assert_eq!(result.reason, FinishReason::Complete);
    let decision = result.state.routing_decision.as_ref().unwrap();
    assert_eq!(decision.kind, RouteKind::Dashboard);
    assert_eq!(decision.domain, Domain::Sales);

    // seleccion deterministica esperada
    let fetch_done = result
        .agent_steps()
        .into_iter()
        .find(|s| s.step == "fetch_data" && s.status == StepStatus::Done)
        .expect("fetch_data done");
    let ids = fetch_done.detail.as_ref().unwrap()["query_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(
        ids,
        vec!["kpi_sales_summary", "ts_sales_by_day", "top_products_by_revenue"]
    );

    // dashboard antes que payload
    let dash_pos = result
        .position(|e| matches!(e, StreamEvent::Dashboard { .. }))
        .expect("data-dashboard");
    let payload_pos = result
        .position(|e| matches!(e, StreamEvent::Payload { .. }))
        .expect("data-payload");
    assert!(dash_pos < payload_pos);

    // >=1 KPI card, >=2 graficos (linea/area + barras)
    let spec = result.dashboard().unwrap();
    assert!(!spec.slots.series.is_empty());
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
}

// ============== escenario 3: inventario (trampa de substring) ==============

#[tokio::test]
async fn test_inventory_question_is_not_sales() {
    let state = default_state();
    let result = run_question(&state, "como esta el inventario").await;

    assert_eq!(result.reason, FinishReason::Complete);
    let decision = result.state.routing_decision.as_ref().unwrap();
    assert_eq!(decision.domain, Domain::Inventory);

    let fetch_done = result
        .agent_steps()
        .into_iter()
        .find(|s| s.step == "fetch_data" && s.status == StepStatus::Done)
        .unwrap();
    let ids: Vec<String> = fetch_done.detail.as_ref().unwrap()["query_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(ids.contains(&"kpi_inventory_summary".to_string()));
    assert!(ids.contains(&"stock_reorder_analysis".to_string()));
    assert!(!ids.contains(&"kpi_sales_summary".to_string()));

    let payload = result.payload().unwrap();
    assert!(payload.has_ref("kpi.critical_count"));
    assert!(!payload.has_ref("kpi.total_sales"));

    let spec = result.dashboard().unwrap();
    assert_eq!(spec.title, "Analisis de Inventario");
}

// ============== escenario 4: comparacion de periodos ==============

#[tokio::test]
async fn test_comparison_periods() {
    let state = default_state();
    let result = run_question(&state, "comparame noviembre vs octubre").await;

    assert_eq!(result.reason, FinishReason::Complete);
    let payload = result.payload().unwrap();
    let cmp = payload.comparison.as_ref().expect("comparison poblada");
    assert!(cmp.current_period.label.starts_with("noviembre"));
    assert!(cmp.previous_period.label.starts_with("octubre"));
    assert!(!cmp.current_period.kpis.is_empty());
    assert!(!cmp.previous_period.kpis.is_empty());
    assert!(cmp.deltas.contains_key("total_sales"));

    let spec = result.dashboard().unwrap();
    assert!(spec
        .slots
        .charts
        .iter()
        .any(|c| matches!(c, ChartSlot::ComparisonBar(_))));
}

// ============== escenario 5: reparacion de JSON del LLM ==============

#[tokio::test]
async fn test_llm_selection_repairs_bad_json() {
    let mut cfg = AppConfig::default();
    cfg.pipeline.use_llm_for_query_selection = true;
    let llm: Arc<MockLlmClient> = Arc::new(MockLlmClient::with_responses(vec![
        Ok("esto no es json".into()),
        Ok(r#"{"query_ids": ["kpi_sales_summary", "recent_orders"]}"#.into()),
    ]));
    let llm_dyn: Arc<dyn LlmClient> = llm.clone();
    let state = make_state(DemoBackend::new(), Some(llm_dyn), cfg);

    // pregunta con señal de datos pero sin dominio claro -> seleccion LLM
    let result = run_question(&state, "dame un panorama general").await;
    assert_eq!(result.reason, FinishReason::Complete);
    assert_eq!(llm.call_count(), 2);

    let fetch_done = result
        .agent_steps()
        .into_iter()
        .find(|s| s.step == "fetch_data" && s.status == StepStatus::Done)
        .unwrap();
    assert_eq!(fetch_done.detail.as_ref().unwrap()["selection"], "llm");
}

#[tokio::test]
async fn test_llm_selection_double_failure_uses_heuristics() {
    let mut cfg = AppConfig::default();
    cfg.pipeline.use_llm_for_query_selection = true;
    let llm: Arc<MockLlmClient> = Arc::new(MockLlmClient::with_responses(vec![
        Ok("basura".into()),
        Ok("mas basura".into()),
    ]));
    let llm_dyn: Arc<dyn LlmClient> = llm.clone();
    let state = make_state(DemoBackend::new(), Some(llm_dyn), cfg);

    let result = run_question(&state, "dame un panorama general").await;
    // el resultado final sigue siendo bien formado
    assert_eq!(result.reason, FinishReason::Complete);
    assert!(result.payload().is_some());

    let fetch_done = result
        .agent_steps()
        .into_iter()
        .find(|s| s.step == "fetch_data" && s.status == StepStatus::Done)
        .unwrap();
    assert_eq!(fetch_done.detail.as_ref().unwrap()["selection"], "heuristic");
}

// ============== escenario 6: fallo parcial de la base ==============

#[tokio::test]
async fn test_partial_database_failure() {
    let backend =
        DemoBackend::new().with_failure("ts_sales_by_day", EngineError::UpstreamTimeout(30));
    let state = make_state(backend, None, AppConfig::default());
    let result = run_question(&state, "como van las ventas").await;

    // dashboard con los refs exitosos; el timeout queda en agent_steps; finish complete
    assert_eq!(result.reason, FinishReason::Complete);
    let payload = result.payload().unwrap();
    assert!(payload.has_ref("kpi.total_sales"));
    assert!(payload.has_ref("top.products_by_revenue"));
    assert!(!payload.has_ref("ts.sales_by_day"));

    assert!(result.agent_steps().iter().any(|s| {
        s.step == "query:ts_sales_by_day"
            && s.status == StepStatus::Error
            && s.message.as_ref().unwrap().contains("upstream_timeout")
    }));

    let spec = result.dashboard().unwrap();
    for r in spec.collect_refs() {
        assert!(payload.has_ref(r));
    }
}

// ============== fallo total -> reflect -> error ==============

#[tokio::test]
async fn test_all_queries_fail_exhausts_retries() {
    let catalog = faro::catalog::QueryCatalog::builtin().unwrap();
    let backend = DemoBackend::all_failing(&catalog, EngineError::UpstreamTimeout(30));
    let state = make_state(backend, None, AppConfig::default());
    let result = run_question(&state, "como van las ventas").await;

    assert_eq!(result.reason, FinishReason::Error);
    assert!(result.dashboard().is_none());
    assert!(result.payload().is_none());
    // al menos un step de error y los reflect intermedios
    assert!(result
        .agent_steps()
        .iter()
        .any(|s| s.status == StepStatus::Error));
    let reflects = result
        .agent_steps()
        .iter()
        .filter(|s| s.step == "reflect")
        .count();
    assert_eq!(reflects, state.max_retries as usize);
    // retry_count acotado por max_retries
    assert!(result.state.retry_count <= result.state.max_retries);
    assert!(!result.full_text().is_empty());
}

// ============== data_only: payload sin dashboard ==============

#[tokio::test]
async fn test_data_only_emits_payload_without_dashboard() {
    let state = default_state();
    let result = run_question(&state, "cuantas ordenes tuvimos").await;

    assert_eq!(result.reason, FinishReason::Complete);
    assert_eq!(
        result.state.routing_decision.as_ref().unwrap().kind,
        RouteKind::DataOnly
    );
    assert!(result.dashboard().is_none());
    assert!(result.payload().is_some());
    assert!(!result.full_text().is_empty());
}

// ============== clarificacion ==============

#[tokio::test]
async fn test_ambiguous_question_terminates_with_clarification() {
    let state = default_state();
    let result = run_question(&state, "y eso?").await;

    assert_eq!(result.reason, FinishReason::Complete);
    assert_eq!(
        result.state.routing_decision.as_ref().unwrap().kind,
        RouteKind::Clarification
    );
    assert!(result.dashboard().is_none());
    assert!(result.full_text().contains("Que area te interesa"));
}
