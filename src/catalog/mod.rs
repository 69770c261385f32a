//! 查询目录：引擎可执行 SQL 的唯一来源
//!
//! 进程启动时加载一次，之后只读。安全规则：
//! - 只有 SELECT 模板，全部带 LIMIT 或聚合
//! - 参数经 schema 校验后按位绑定，引擎内不拼接任何 SQL
//! - LLM 只能从 id 列表里挑选，永远接触不到 SQL 文本
//!
//! 加载期校验：重复 id、重复 output_ref、默认值与 schema 不符都是致命错误。

mod entries;

use std::collections::HashMap;

use thiserror::Error;

pub use entries::builtin_entries;

/// 参数类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Date,
}

/// 参数默认值：日期默认相对「今天」解析
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamDefault {
    None,
    Int(i64),
    Str(&'static str),
    /// 今天往前 N 天
    DaysAgo(i64),
    /// 今天往后 N 天（date_to 为开区间，常用 +1）
    DaysAhead(i64),
}

/// 单个参数的 schema
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
    pub default: ParamDefault,
    /// 枚举值白名单（仅 String 参数）
    pub allowed: Option<&'static [&'static str]>,
    /// 标记后执行层不记录该参数的值
    pub sensitive: bool,
}

impl ParamSpec {
    pub fn integer(name: &'static str, default: i64) -> Self {
        Self {
            name,
            ty: ParamType::Integer,
            required: false,
            default: ParamDefault::Int(default),
            allowed: None,
            sensitive: false,
        }
    }

    pub fn date(name: &'static str, default: ParamDefault) -> Self {
        Self {
            name,
            ty: ParamType::Date,
            required: true,
            default,
            allowed: None,
            sensitive: false,
        }
    }

    pub fn string(name: &'static str, allowed: &'static [&'static str], default: &'static str) -> Self {
        Self {
            name,
            ty: ParamType::String,
            required: false,
            default: ParamDefault::Str(default),
            allowed: Some(allowed),
            sensitive: false,
        }
    }
}

/// 查询结果的形状：决定行如何折叠进 DataPayload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Kpi,
    TimeSeries,
    TopItems,
    Table,
    /// KPI 模板跑两个周期，数据层负责算差值
    Comparison,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Kpi => "kpi",
            OutputKind::TimeSeries => "time_series",
            OutputKind::TopItems => "top_items",
            OutputKind::Table => "table",
            OutputKind::Comparison => "comparison",
        }
    }
}

/// 目录条目（不可变）
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub id: &'static str,
    /// 供 LLM 选择器与 /api/queries 使用的人类可读描述
    pub description: &'static str,
    /// 参数化 SQL 模板（$1..$n）
    pub template: &'static str,
    /// $1..$n 对应的参数名（绑定顺序）
    pub binds: &'static [&'static str],
    pub params: Vec<ParamSpec>,
    pub output_kind: OutputKind,
    /// 结果在 DataPayload 中的规范引用（如 ts.sales_by_day）
    pub output_ref: &'static str,
}

impl CatalogEntry {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// 目录加载错误：启动期致命
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("duplicate query id: {0}")]
    DuplicateId(String),

    #[error("duplicate output ref: {0}")]
    DuplicateRef(String),

    #[error("entry {id}: bind '{bind}' has no parameter spec")]
    UnknownBind { id: String, bind: String },

    #[error("entry {id}: default for '{param}' does not satisfy its schema")]
    BadDefault { id: String, param: String },
}

/// 只读查询注册表
pub struct QueryCatalog {
    entries: Vec<CatalogEntry>,
    by_id: HashMap<&'static str, usize>,
}

impl QueryCatalog {
    /// 校验并构建目录；生产代码使用 builtin()
    pub fn load(entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        let mut by_id = HashMap::new();
        let mut refs = HashMap::new();

        for (idx, entry) in entries.iter().enumerate() {
            if by_id.insert(entry.id, idx).is_some() {
                return Err(CatalogError::DuplicateId(entry.id.to_string()));
            }
            if refs.insert(entry.output_ref, entry.id).is_some() {
                return Err(CatalogError::DuplicateRef(entry.output_ref.to_string()));
            }
            for bind in entry.binds {
                if entry.param(bind).is_none() {
                    return Err(CatalogError::UnknownBind {
                        id: entry.id.to_string(),
                        bind: bind.to_string(),
                    });
                }
            }
            for p in &entry.params {
                let ok = match (&p.ty, &p.default) {
                    (_, ParamDefault::None) => !p.required,
                    (ParamType::Integer, ParamDefault::Int(_)) => true,
                    (ParamType::Date, ParamDefault::DaysAgo(_)) => true,
                    (ParamType::Date, ParamDefault::DaysAhead(_)) => true,
                    (ParamType::String, ParamDefault::Str(s)) => {
                        p.allowed.map(|a| a.contains(s)).unwrap_or(true)
                    }
                    _ => false,
                };
                if !ok {
                    return Err(CatalogError::BadDefault {
                        id: entry.id.to_string(),
                        param: p.name.to_string(),
                    });
                }
            }
        }

        Ok(Self { entries, by_id })
    }

    /// 内置目录
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::load(builtin_entries())
    }

    pub fn lookup(&self, id: &str) -> Option<&CatalogEntry> {
        self.by_id.get(id).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// id -> 描述，供 LLM 选择器 prompt 与 /api/queries 使用
    pub fn descriptions(&self) -> Vec<(&'static str, &'static str)> {
        self.entries.iter().map(|e| (e.id, e.description)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_entry(id: &'static str, output_ref: &'static str) -> CatalogEntry {
        CatalogEntry {
            id,
            description: "test",
            template: "SELECT 1",
            binds: &[],
            params: vec![],
            output_kind: OutputKind::Kpi,
            output_ref,
        }
    }

    #[test]
    fn test_builtin_catalog_loads() {
        let catalog = QueryCatalog::builtin().unwrap();
        assert!(catalog.len() >= 15);
        assert!(catalog.lookup("kpi_sales_summary").is_some());
        assert!(catalog.lookup("ts_sales_by_day").is_some());
        assert!(catalog.lookup("kpi_inventory_summary").is_some());
        assert!(catalog.lookup("stock_reorder_analysis").is_some());
        assert!(catalog.lookup("no_existe").is_none());
    }

    #[test]
    fn test_builtin_has_no_duplicate_refs() {
        // load() 已经校验，这里显式确认每个 ref 唯一
        let catalog = QueryCatalog::builtin().unwrap();
        let mut seen = std::collections::HashSet::new();
        for entry in catalog.iter() {
            assert!(seen.insert(entry.output_ref), "ref duplicado: {}", entry.output_ref);
        }
    }

    #[test]
    fn test_duplicate_id_is_fatal() {
        let entries = vec![minimal_entry("a", "kpi.a"), minimal_entry("a", "kpi.b")];
        assert!(matches!(
            QueryCatalog::load(entries),
            Err(CatalogError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_duplicate_ref_is_fatal() {
        let entries = vec![minimal_entry("a", "kpi.x"), minimal_entry("b", "kpi.x")];
        assert!(matches!(
            QueryCatalog::load(entries),
            Err(CatalogError::DuplicateRef(_))
        ));
    }

    #[test]
    fn test_bind_without_spec_is_fatal() {
        let mut entry = minimal_entry("a", "kpi.a");
        entry.binds = &["limit"];
        assert!(matches!(
            QueryCatalog::load(vec![entry]),
            Err(CatalogError::UnknownBind { .. })
        ));
    }

    #[test]
    fn test_required_param_without_default_is_fatal() {
        let mut entry = minimal_entry("a", "kpi.a");
        entry.params = vec![ParamSpec {
            name: "fecha",
            ty: ParamType::Date,
            required: true,
            default: ParamDefault::None,
            allowed: None,
            sensitive: false,
        }];
        assert!(matches!(
            QueryCatalog::load(vec![entry]),
            Err(CatalogError::BadDefault { .. })
        ));
    }

    #[test]
    fn test_templates_are_select_only() {
        let catalog = QueryCatalog::builtin().unwrap();
        for entry in catalog.iter() {
            let t = entry.template.trim_start().to_uppercase();
            assert!(t.starts_with("SELECT"), "{} no es SELECT", entry.id);
        }
    }
}
