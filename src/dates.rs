//! 从西语自然语言问题中提取日期范围
//!
//! 返回 (date_from, date_to)，date_to 为开区间。识别不了就返回 None，
//! 由目录参数默认值兜底（最近 30 天）。同时提供人类可读的周期描述，
//! 用于进度事件与叙事文本。

use chrono::{Datelike, Duration, NaiveDate};
use regex::Regex;

/// 西语月份名 -> 月号（全名在前，缩写在后）
const SPANISH_MONTHS: &[(&str, u32)] = &[
    ("enero", 1),
    ("febrero", 2),
    ("marzo", 3),
    ("abril", 4),
    ("mayo", 5),
    ("junio", 6),
    ("julio", 7),
    ("agosto", 8),
    ("septiembre", 9),
    ("octubre", 10),
    ("noviembre", 11),
    ("diciembre", 12),
    ("ene", 1),
    ("feb", 2),
    ("mar", 3),
    ("abr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("ago", 8),
    ("sep", 9),
    ("sept", 9),
    ("oct", 10),
    ("nov", 11),
    ("dic", 12),
];

const MONTH_NAMES: [&str; 12] = [
    "enero",
    "febrero",
    "marzo",
    "abril",
    "mayo",
    "junio",
    "julio",
    "agosto",
    "septiembre",
    "octubre",
    "noviembre",
    "diciembre",
];

/// 一个命名周期：[from, to) + 标签
#[derive(Debug, Clone, PartialEq)]
pub struct NamedPeriod {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub label: String,
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    (next.unwrap() - NaiveDate::from_ymd_opt(year, month, 1).unwrap()).num_days() as u32
}

/// 整月范围（to 开区间）
fn month_range(year: i32, month: u32) -> (NaiveDate, NaiveDate) {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap()
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap()
    };
    (first, next)
}

fn quarter_range(year: i32, start_month: u32, end_month: u32) -> (NaiveDate, NaiveDate) {
    let first = NaiveDate::from_ymd_opt(year, start_month, 1).unwrap();
    let (_, next) = month_range(year, end_month);
    (first, next)
}

/// 提到未来月份时退回上一年（「noviembre」在 8 月问指去年 11 月）
fn year_for_month(today: NaiveDate, month: u32) -> i32 {
    if month > today.month() {
        today.year() - 1
    } else {
        today.year()
    }
}

/// 主入口：从问题中提取 [from, to)（开区间）
pub fn extract_date_range(question: &str, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let q = question.to_lowercase();

    // === 相对表达 ===
    if Regex::new(r"\bhoy\b").unwrap().is_match(&q) {
        return Some((today, today + Duration::days(1)));
    }
    if Regex::new(r"\bayer\b").unwrap().is_match(&q) {
        return Some((today - Duration::days(1), today));
    }
    if Regex::new(r"\besta\s+semana\b").unwrap().is_match(&q) {
        let start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
        return Some((start, start + Duration::days(7)));
    }
    if Regex::new(r"\b(semana\s+pasada|[uú]ltima\s+semana)\b")
        .unwrap()
        .is_match(&q)
    {
        let start = today - Duration::days(today.weekday().num_days_from_monday() as i64 + 7);
        return Some((start, start + Duration::days(7)));
    }
    if Regex::new(r"\beste\s+mes\b").unwrap().is_match(&q) {
        return Some(month_range(today.year(), today.month()));
    }
    if Regex::new(r"\b(mes\s+pasado|[uú]ltimo\s+mes)\b")
        .unwrap()
        .is_match(&q)
    {
        return Some(if today.month() == 1 {
            month_range(today.year() - 1, 12)
        } else {
            month_range(today.year(), today.month() - 1)
        });
    }
    if let Some(caps) = Regex::new(r"\b[uú]ltimos?\s+(\d+)\s+d[ií]as?\b")
        .unwrap()
        .captures(&q)
    {
        let days: i64 = caps[1].parse().ok()?;
        return Some((today - Duration::days(days), today + Duration::days(1)));
    }
    if let Some(caps) = Regex::new(r"\b[uú]ltimas?\s+(\d+)\s+semanas?\b")
        .unwrap()
        .captures(&q)
    {
        let weeks: i64 = caps[1].parse().ok()?;
        return Some((today - Duration::weeks(weeks), today + Duration::days(1)));
    }

    // === 区间与具体日 ===
    // "del 1 al 15 de diciembre [2024]"
    if let Some(caps) =
        Regex::new(r"\bdel?\s+(\d{1,2})\s+al?\s+(\d{1,2})\s+de\s+(\p{L}+)(?:\s+(?:de\s+)?(\d{4}))?\b")
            .unwrap()
            .captures(&q)
    {
        let day_start: u32 = caps[1].parse().ok()?;
        let day_end: u32 = caps[2].parse().ok()?;
        if let Some(month) = month_number(&caps[3]) {
            let year = caps
                .get(4)
                .and_then(|y| y.as_str().parse().ok())
                .unwrap_or_else(|| year_for_month(today, month));
            let start = NaiveDate::from_ymd_opt(year, month, day_start)?;
            let end = NaiveDate::from_ymd_opt(year, month, day_end)? + Duration::days(1);
            return Some((start, end));
        }
    }

    // "15 de diciembre [2024]"
    if let Some(caps) = Regex::new(r"\b(\d{1,2})\s+de\s+(\p{L}+)(?:\s+(?:de\s+)?(\d{4}))?\b")
        .unwrap()
        .captures(&q)
    {
        if let Some(month) = month_number(&caps[2]) {
            let day: u32 = caps[1].parse().ok()?;
            let year = caps
                .get(3)
                .and_then(|y| y.as_str().parse().ok())
                .unwrap_or_else(|| year_for_month(today, month));
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                return Some((date, date + Duration::days(1)));
            }
        }
    }

    // === 月份 ===
    // "diciembre 2024" / "diciembre de 2024"
    for (name, month) in SPANISH_MONTHS {
        let pattern = format!(r"\b{}\s+(?:de\s+)?(\d{{4}})\b", name);
        if let Some(caps) = Regex::new(&pattern).unwrap().captures(&q) {
            let year: i32 = caps[1].parse().ok()?;
            return Some(month_range(year, *month));
        }
    }
    // "diciembre" / "en diciembre"（不带年份）
    for (name, month) in SPANISH_MONTHS {
        let pattern = format!(r"\b{}\b", name);
        if Regex::new(&pattern).unwrap().is_match(&q) {
            return Some(month_range(year_for_month(today, *month), *month));
        }
    }

    // === 季度 ===
    let quarters: &[(&str, u32, u32)] = &[
        (r"q1|primer\s+trimestre|1er\s+trimestre", 1, 3),
        (r"q2|segundo\s+trimestre|2do\s+trimestre", 4, 6),
        (r"q3|tercer\s+trimestre|3er\s+trimestre", 7, 9),
        (r"q4|cuarto\s+trimestre|4to\s+trimestre", 10, 12),
    ];
    for (pattern, start, end) in quarters {
        let full = format!(r"\b(?:{})\s+(?:de\s+)?(\d{{4}})\b", pattern);
        if let Some(caps) = Regex::new(&full).unwrap().captures(&q) {
            let year: i32 = caps[1].parse().ok()?;
            return Some(quarter_range(year, *start, *end));
        }
    }

    // === 年份（需要提到 año/year）===
    if Regex::new(r"\b(a[ñn]o|year)\b").unwrap().is_match(&q) {
        if let Some(caps) = Regex::new(r"\b(20\d{2})\b").unwrap().captures(&q) {
            let year: i32 = caps[1].parse().ok()?;
            return Some((
                NaiveDate::from_ymd_opt(year, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap(),
            ));
        }
    }

    // === 特殊事件：cyber monday / black friday 算作 11 月 ===
    if Regex::new(r"\b(cyber\s*monday|black\s*friday|hot\s*sale)\b")
        .unwrap()
        .is_match(&q)
    {
        let year = Regex::new(r"\b(20\d{2})\b")
            .unwrap()
            .captures(&q)
            .and_then(|c| c[1].parse().ok())
            .unwrap_or_else(|| year_for_month(today, 11));
        return Some(month_range(year, 11));
    }

    None
}

fn month_number(name: &str) -> Option<u32> {
    SPANISH_MONTHS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, m)| *m)
}

/// 对比问题（"noviembre vs octubre"）：按出现顺序取前两个月份
///
/// 没有两个明确月份时返回 None，调用方按「紧邻的等长上一周期」推导。
pub fn extract_comparison_periods(
    question: &str,
    today: NaiveDate,
) -> Option<(NamedPeriod, NamedPeriod)> {
    let q = question.to_lowercase();
    let marker = Regex::new(r"compar|versus|\bvs\b|\bcontra\b").unwrap();
    if !marker.is_match(&q) {
        return None;
    }

    let mut mentions: Vec<(usize, u32)> = Vec::new();
    for (name, month) in SPANISH_MONTHS {
        let pattern = format!(r"\b{}\b", name);
        for m in Regex::new(&pattern).unwrap().find_iter(&q) {
            if !mentions.iter().any(|(pos, _)| *pos == m.start()) {
                mentions.push((m.start(), *month));
            }
        }
    }
    mentions.sort_by_key(|(pos, _)| *pos);
    mentions.dedup_by_key(|(_, month)| *month);

    if mentions.len() < 2 {
        return None;
    }

    let build = |month: u32| {
        let year = year_for_month(today, month);
        let (from, to) = month_range(year, month);
        NamedPeriod {
            from,
            to,
            label: format!("{} {}", MONTH_NAMES[(month - 1) as usize], year),
        }
    };

    Some((build(mentions[0].1), build(mentions[1].1)))
}

/// 人类可读的周期描述（事件消息与叙事使用）
pub fn describe_period(range: Option<(NaiveDate, NaiveDate)>) -> String {
    let Some((from, to)) = range else {
        return "ultimos 30 dias".to_string();
    };
    let to_inclusive = to - Duration::days(1);

    if from == to_inclusive {
        return from.format("%d/%m/%Y").to_string();
    }

    if from.year() == to_inclusive.year()
        && from.month() == to_inclusive.month()
        && from.day() == 1
        && to_inclusive.day() == days_in_month(from.year(), from.month())
    {
        return format!(
            "{} {}",
            MONTH_NAMES[(from.month() - 1) as usize],
            from.year()
        );
    }

    format!(
        "{} a {}",
        from.format("%d/%m/%Y"),
        to_inclusive.format("%d/%m/%Y")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        // 2025-11-08 es sabado
        NaiveDate::from_ymd_opt(2025, 11, 8).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_month_with_year() {
        assert_eq!(
            extract_date_range("ventas de diciembre 2024", today()),
            Some((d(2024, 12, 1), d(2025, 1, 1)))
        );
    }

    #[test]
    fn test_yesterday() {
        assert_eq!(
            extract_date_range("cuales fueron las ventas de ayer", today()),
            Some((d(2025, 11, 7), d(2025, 11, 8)))
        );
    }

    #[test]
    fn test_this_week() {
        assert_eq!(
            extract_date_range("productos vendidos esta semana", today()),
            Some((d(2025, 11, 3), d(2025, 11, 10)))
        );
    }

    #[test]
    fn test_last_month() {
        assert_eq!(
            extract_date_range("reporte del ultimo mes", today()),
            Some((d(2025, 10, 1), d(2025, 11, 1)))
        );
    }

    #[test]
    fn test_last_n_days() {
        assert_eq!(
            extract_date_range("ventas de los ultimos 7 dias", today()),
            Some((d(2025, 11, 1), d(2025, 11, 9)))
        );
    }

    #[test]
    fn test_specific_day() {
        assert_eq!(
            extract_date_range("que paso el 15 de noviembre 2024", today()),
            Some((d(2024, 11, 15), d(2024, 11, 16)))
        );
    }

    #[test]
    fn test_quarter() {
        assert_eq!(
            extract_date_range("resultados del q4 2024", today()),
            Some((d(2024, 10, 1), d(2025, 1, 1)))
        );
    }

    #[test]
    fn test_cyber_monday() {
        assert_eq!(
            extract_date_range("como me fue en el cyber monday 2024", today()),
            Some((d(2024, 11, 1), d(2024, 12, 1)))
        );
    }

    #[test]
    fn test_no_dates() {
        assert_eq!(extract_date_range("hola como estas", today()), None);
    }

    #[test]
    fn test_future_month_resolves_to_past_year() {
        // en noviembre de 2025 preguntar por "diciembre" refiere a dic 2024
        assert_eq!(
            extract_date_range("ventas de diciembre", today()),
            Some((d(2024, 12, 1), d(2025, 1, 1)))
        );
    }

    #[test]
    fn test_comparison_periods() {
        let (current, previous) =
            extract_comparison_periods("comparame noviembre vs octubre", today()).unwrap();
        assert_eq!(current.from, d(2025, 11, 1));
        assert_eq!(current.to, d(2025, 12, 1));
        assert_eq!(current.label, "noviembre 2025");
        assert_eq!(previous.from, d(2025, 10, 1));
        assert_eq!(previous.label, "octubre 2025");
    }

    #[test]
    fn test_comparison_requires_marker() {
        assert!(extract_comparison_periods("ventas de noviembre y octubre", today()).is_none());
    }

    #[test]
    fn test_comparison_requires_two_months() {
        assert!(extract_comparison_periods("comparame este mes", today()).is_none());
    }

    #[test]
    fn test_describe_full_month() {
        assert_eq!(
            describe_period(Some((d(2025, 11, 1), d(2025, 12, 1)))),
            "noviembre 2025"
        );
    }

    #[test]
    fn test_describe_single_day() {
        assert_eq!(
            describe_period(Some((d(2025, 11, 7), d(2025, 11, 8)))),
            "07/11/2025"
        );
    }

    #[test]
    fn test_describe_fallback() {
        assert_eq!(describe_period(None), "ultimos 30 dias");
    }

    #[test]
    fn test_describe_range() {
        assert_eq!(
            describe_period(Some((d(2025, 11, 1), d(2025, 11, 16)))),
            "01/11/2025 a 15/11/2025"
        );
    }
}
