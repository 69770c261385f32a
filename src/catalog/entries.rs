//! 内置查询目录
//!
//! 命名约定：kpi_* 返回单行指标，ts_* 返回时间序列，top_* 返回排行，
//! 其余为明细表。聚合列统一 cast 到 float8 / int8，避免 NUMERIC 解码分歧。

use super::{CatalogEntry, OutputKind, ParamDefault, ParamSpec};

/// 全部内置条目；QueryCatalog::builtin() 负责加载校验
pub fn builtin_entries() -> Vec<CatalogEntry> {
    vec![
        // ============== 商品 (ml_items) ==============
        CatalogEntry {
            id: "products_inventory",
            description: "Inventario de productos con stock y precios",
            template: "SELECT
                item_id AS id,
                title,
                sku,
                price::float8 AS price,
                available_quantity::int8 AS stock,
                status,
                total_sold::int8 AS total_sold
            FROM ml_items
            ORDER BY available_quantity DESC
            LIMIT $1",
            binds: &["limit"],
            params: vec![ParamSpec::integer("limit", 50)],
            output_kind: OutputKind::Table,
            output_ref: "table.products_inventory",
        },
        CatalogEntry {
            id: "products_low_stock",
            description: "Productos con stock bajo (menos de 10 unidades)",
            template: "SELECT
                item_id AS id,
                title,
                sku,
                price::float8 AS price,
                available_quantity::int8 AS stock,
                status
            FROM ml_items
            WHERE available_quantity < 10
              AND status = 'active'
            ORDER BY available_quantity ASC
            LIMIT $1",
            binds: &["limit"],
            params: vec![ParamSpec::integer("limit", 20)],
            output_kind: OutputKind::Table,
            output_ref: "table.products_low_stock",
        },
        CatalogEntry {
            id: "top_products_by_sales",
            description: "Top productos por unidades vendidas",
            template: "SELECT
                ROW_NUMBER() OVER (ORDER BY total_sold DESC NULLS LAST)::int8 AS rank,
                item_id AS id,
                title,
                COALESCE(total_sold, 0)::float8 AS value,
                COALESCE(total_sold, 0)::int8 AS units_sold
            FROM ml_items
            ORDER BY total_sold DESC NULLS LAST
            LIMIT $1",
            binds: &["limit"],
            params: vec![ParamSpec::integer("limit", 10)],
            output_kind: OutputKind::TopItems,
            output_ref: "top.products_by_sales",
        },
        // ============== 库存看板 (v_stock_dashboard) ==============
        CatalogEntry {
            id: "kpi_inventory_summary",
            description: "Resumen de inventario (criticos, alertas, cobertura promedio)",
            template: "SELECT
                COUNT(*) FILTER (WHERE severity = 'critical')::int8 AS critical_count,
                COUNT(*) FILTER (WHERE severity = 'warning')::int8 AS warning_count,
                COUNT(*) FILTER (WHERE severity = 'ok')::int8 AS ok_count,
                COUNT(*)::int8 AS total_products,
                COALESCE(AVG(days_cover), 0)::float8 AS avg_days_cover
            FROM v_stock_dashboard",
            binds: &[],
            params: vec![],
            output_kind: OutputKind::Kpi,
            output_ref: "kpi.inventory_summary",
        },
        CatalogEntry {
            id: "stock_alerts",
            description: "Alertas de stock critico y productos a reponer",
            template: "SELECT
                item_id AS id,
                title,
                available_quantity::int8 AS stock,
                days_cover::float8 AS days_cover,
                severity,
                reorder_date
            FROM v_stock_dashboard
            WHERE severity IN ('critical', 'warning')
            ORDER BY severity DESC, days_cover ASC
            LIMIT $1",
            binds: &["limit"],
            params: vec![ParamSpec::integer("limit", 20)],
            output_kind: OutputKind::Table,
            output_ref: "table.stock_alerts",
        },
        CatalogEntry {
            id: "stock_reorder_analysis",
            description: "Analisis de reposicion: dias de cobertura y fecha sugerida de reorden",
            template: "SELECT
                item_id AS id,
                title,
                available_quantity::int8 AS stock,
                daily_sales_rate::float8 AS daily_sales_rate,
                days_cover::float8 AS days_cover,
                reorder_date,
                severity
            FROM v_stock_dashboard
            ORDER BY days_cover ASC
            LIMIT $1",
            binds: &["limit"],
            params: vec![ParamSpec::integer("limit", 20)],
            output_kind: OutputKind::Table,
            output_ref: "table.stock_reorder",
        },
        // ============== 互动 AI (conversations / escalations) ==============
        CatalogEntry {
            id: "ai_interactions_summary",
            description: "Resumen de interacciones del agente AI (total, escaladas, por tipo)",
            template: "SELECT
                COALESCE(conv.total_interactions, 0)::int8 AS total_interactions,
                COALESCE(esc.escalated_count, 0)::int8 AS escalated_count,
                COALESCE(ROUND(esc.escalated_count::numeric / NULLIF(conv.total_interactions, 0) * 100, 1), 0)::float8 AS escalation_rate,
                (COALESCE(conv.total_interactions, 0) - COALESCE(esc.escalated_count, 0))::int8 AS auto_responded,
                COALESCE(
                    ROUND(
                        (COALESCE(conv.total_interactions, 0) - COALESCE(esc.escalated_count, 0))::numeric
                        / NULLIF(conv.total_interactions, 0) * 100,
                        1
                    ),
                    0
                )::float8 AS auto_response_rate
            FROM
                (SELECT COUNT(*) AS total_interactions FROM conversations) conv,
                (SELECT COUNT(*) AS escalated_count FROM escalations) esc",
            binds: &[],
            params: vec![],
            output_kind: OutputKind::Kpi,
            output_ref: "kpi.ai_interactions",
        },
        CatalogEntry {
            id: "recent_ai_interactions",
            description: "Ultimas interacciones del agente AI con compradores",
            template: "SELECT
                id,
                buyer_nickname,
                status,
                case_type,
                last_message_at
            FROM conversations
            ORDER BY last_message_at DESC
            LIMIT $1",
            binds: &["limit"],
            params: vec![ParamSpec::integer("limit", 20)],
            output_kind: OutputKind::Table,
            output_ref: "table.recent_ai_interactions",
        },
        CatalogEntry {
            id: "escalated_cases",
            description: "Casos escalados a humano con motivo",
            template: "SELECT
                id,
                buyer_nickname,
                buyer_message,
                reason,
                case_type,
                status,
                priority,
                created_at
            FROM escalations
            ORDER BY created_at DESC
            LIMIT $1",
            binds: &["limit"],
            params: vec![ParamSpec::integer("limit", 20)],
            output_kind: OutputKind::Table,
            output_ref: "table.escalated_cases",
        },
        CatalogEntry {
            id: "interactions_by_case_type",
            description: "Interacciones agrupadas por tipo de caso",
            template: "SELECT
                ROW_NUMBER() OVER (ORDER BY COUNT(*) DESC)::int8 AS rank,
                COALESCE(case_type, 'sin_tipo') AS id,
                INITCAP(REPLACE(COALESCE(case_type, 'sin_tipo'), '_', ' ')) AS title,
                COUNT(*)::float8 AS value
            FROM escalations
            GROUP BY case_type
            ORDER BY value DESC
            LIMIT $1",
            binds: &["limit"],
            params: vec![ParamSpec::integer("limit", 10)],
            output_kind: OutputKind::TopItems,
            output_ref: "top.interactions_by_case_type",
        },
        // ============== 预售 (preventa_queries) ==============
        CatalogEntry {
            id: "preventa_summary",
            description: "Resumen de consultas de preventa (total, respondidas, pendientes)",
            template: "SELECT
                COUNT(*)::int8 AS total_queries,
                (COUNT(*) FILTER (WHERE status = 'answered'))::int8 AS answered,
                (COUNT(*) FILTER (WHERE status = 'pending'))::int8 AS pending,
                COALESCE(
                    ROUND((COUNT(*) FILTER (WHERE status = 'answered'))::numeric / NULLIF(COUNT(*), 0) * 100, 1),
                    0
                )::float8 AS answer_rate
            FROM preventa_queries",
            binds: &[],
            params: vec![],
            output_kind: OutputKind::Kpi,
            output_ref: "kpi.preventa",
        },
        CatalogEntry {
            id: "recent_preventa_queries",
            description: "Ultimas preguntas de preventa de compradores",
            template: "SELECT
                id,
                buyer_nickname,
                question,
                status,
                created_at
            FROM preventa_queries
            ORDER BY created_at DESC
            LIMIT $1",
            binds: &["limit"],
            params: vec![ParamSpec::integer("limit", 20)],
            output_kind: OutputKind::Table,
            output_ref: "table.recent_preventa",
        },
        // ============== 销售 (ml_orders) ==============
        CatalogEntry {
            id: "kpi_sales_summary",
            description: "Resumen de KPIs de ventas (total, cantidad, promedio) - Solo ordenes PAID",
            template: "SELECT
                COALESCE(SUM(total_amount), 0)::float8 AS total_sales,
                COUNT(*)::int8 AS total_orders,
                COALESCE(AVG(total_amount), 0)::float8 AS avg_order_value,
                COALESCE(SUM(quantity), 0)::int8 AS total_units
            FROM ml_orders
            WHERE status = 'paid'
              AND date_created >= $1
              AND date_created < $2",
            binds: &["date_from", "date_to"],
            params: vec![
                ParamSpec::date("date_from", ParamDefault::DaysAgo(30)),
                ParamSpec::date("date_to", ParamDefault::DaysAhead(1)),
            ],
            output_kind: OutputKind::Kpi,
            output_ref: "kpi.sales_summary",
        },
        CatalogEntry {
            id: "ts_sales_by_day",
            description: "Ventas agrupadas por dia para grafico de linea",
            template: "SELECT
                DATE(date_created) AS date,
                SUM(total_amount)::float8 AS value,
                COUNT(*)::int8 AS order_count
            FROM ml_orders
            WHERE status = 'paid'
              AND date_created >= $1
              AND date_created < $2
            GROUP BY DATE(date_created)
            ORDER BY date ASC
            LIMIT $3",
            binds: &["date_from", "date_to", "limit"],
            params: vec![
                ParamSpec::date("date_from", ParamDefault::DaysAgo(30)),
                ParamSpec::date("date_to", ParamDefault::DaysAhead(1)),
                ParamSpec::integer("limit", 31),
            ],
            output_kind: OutputKind::TimeSeries,
            output_ref: "ts.sales_by_day",
        },
        CatalogEntry {
            id: "sales_by_month",
            description: "Ventas agrupadas por mes para analisis de estacionalidad",
            template: "SELECT
                TO_CHAR(date_created, 'YYYY-MM') AS date,
                SUM(total_amount)::float8 AS value,
                COUNT(*)::int8 AS order_count
            FROM ml_orders
            WHERE status = 'paid'
              AND date_created >= $1
              AND date_created < $2
            GROUP BY TO_CHAR(date_created, 'YYYY-MM')
            ORDER BY date ASC
            LIMIT $3",
            binds: &["date_from", "date_to", "limit"],
            params: vec![
                ParamSpec::date("date_from", ParamDefault::DaysAgo(395)),
                ParamSpec::date("date_to", ParamDefault::DaysAhead(1)),
                ParamSpec::integer("limit", 13),
            ],
            output_kind: OutputKind::TimeSeries,
            output_ref: "ts.sales_by_month",
        },
        CatalogEntry {
            id: "top_products_by_revenue",
            description: "Top productos ordenados por ingresos en un periodo de tiempo",
            template: "SELECT
                ROW_NUMBER() OVER (ORDER BY SUM(o.total_amount) DESC)::int8 AS rank,
                o.item_id AS id,
                i.title,
                SUM(o.total_amount)::float8 AS value,
                SUM(o.quantity)::int8 AS units_sold
            FROM ml_orders o
            LEFT JOIN ml_items i ON o.item_id = i.item_id
            WHERE o.status = 'paid'
              AND o.date_created >= $1
              AND o.date_created < $2
            GROUP BY o.item_id, i.title
            ORDER BY value DESC
            LIMIT $3",
            binds: &["date_from", "date_to", "limit"],
            params: vec![
                ParamSpec::date("date_from", ParamDefault::DaysAgo(30)),
                ParamSpec::date("date_to", ParamDefault::DaysAhead(1)),
                ParamSpec::integer("limit", 10),
            ],
            output_kind: OutputKind::TopItems,
            output_ref: "top.products_by_revenue",
        },
        CatalogEntry {
            id: "recent_orders",
            description: "Ultimas ordenes para mostrar en tabla",
            template: "SELECT
                order_id AS id,
                buyer_nickname,
                item_title,
                total_amount::float8 AS total_amount,
                quantity::int8 AS quantity,
                status,
                shipping_status,
                date_created
            FROM ml_orders
            ORDER BY date_created DESC
            LIMIT $1",
            binds: &["limit"],
            params: vec![ParamSpec::integer("limit", 20)],
            output_kind: OutputKind::Table,
            output_ref: "table.recent_orders",
        },
        // 周期对比：模板与 kpi_sales_summary 相同，数据层分别跑当前/上一周期
        CatalogEntry {
            id: "kpi_sales_comparison",
            description: "Comparacion de KPIs de ventas entre dos periodos (ej: noviembre vs octubre)",
            template: "SELECT
                COALESCE(SUM(total_amount), 0)::float8 AS total_sales,
                COUNT(*)::int8 AS total_orders,
                COALESCE(AVG(total_amount), 0)::float8 AS avg_order_value,
                COALESCE(SUM(quantity), 0)::int8 AS total_units
            FROM ml_orders
            WHERE status = 'paid'
              AND date_created >= $1
              AND date_created < $2",
            binds: &["date_from", "date_to"],
            params: vec![
                ParamSpec::date("date_from", ParamDefault::DaysAgo(30)),
                ParamSpec::date("date_to", ParamDefault::DaysAhead(1)),
            ],
            output_kind: OutputKind::Comparison,
            output_ref: "comparison",
        },
    ]
}
